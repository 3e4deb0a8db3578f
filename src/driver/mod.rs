//! VeertuManage driver layer.
//!
//! This module provides the abstractions used to control a single VM:
//! - [`Driver`]: the operation set, implemented once per tool version
//! - [`command`]: locating and running the `VeertuManage` binary
//! - [`retry`]: exit-code interpretation and bounded retry
//! - [`factory`]: version detection and driver selection

pub mod adapters;
pub mod command;
pub mod factory;
pub mod parse;
pub mod retry;
pub mod version_5_0;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub use command::{CommandOutput, CommandRunner, OutputStream, ToolLocator, VeertuManage};
pub use retry::{ExecOptions, RetryExecutor};
pub use version_5_0::Version5_0;

/// Default adapter label attached to forwarded port rules.
pub const DEFAULT_PORT_ADAPTER: &str = "nat";

/// Maximum number of network adapters a Veertu VM can carry.
pub const MAX_NETWORK_ADAPTERS: usize = 36;

/// Progress callback receiving a completion percentage (0-100).
pub type ProgressFn<'a> = &'a mut dyn FnMut(u8);

/// VM state as reported by the control tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// No VM exists for this machine.
    NotCreated,
    /// VM is powered off.
    Stopped,
    /// VM is running.
    Running,
    /// VM is paused.
    Paused,
    /// VM is suspended to disk.
    Suspended,
    /// The tool reported something we don't recognize.
    Unknown,
}

impl VmState {
    /// Map a tool status string onto a state.
    pub fn from_status(status: &str) -> Self {
        match status.trim() {
            "not_created" => VmState::NotCreated,
            "stopped" => VmState::Stopped,
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            "suspended" => VmState::Suspended,
            _ => VmState::Unknown,
        }
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmState::NotCreated => "not_created",
            VmState::Stopped => "stopped",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Suspended => "suspended",
            VmState::Unknown => "unknown",
        }
    }

    /// Human readable explanation of the state.
    pub fn description(&self) -> &'static str {
        match self {
            VmState::NotCreated => "The environment has not yet been created.",
            VmState::Stopped => "The VM is powered off. Start it to use it again.",
            VmState::Running => "The VM is running.",
            VmState::Paused => "The VM is paused. Resume it to continue.",
            VmState::Suspended => "The VM is suspended. Resume it to continue.",
            VmState::Unknown => "The VM is in a state the provider does not recognize.",
        }
    }

    /// Check if the VM is running.
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How to boot a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Boot without a window.
    Headless,
    /// Boot with the Veertu window.
    Gui,
    /// Plain start, used to resume a paused VM.
    Resume,
}

impl StartMode {
    /// Pick headless or gui from a config flag.
    pub fn from_gui(gui: bool) -> Self {
        if gui {
            StartMode::Gui
        } else {
            StartMode::Headless
        }
    }
}

/// A host-to-guest port forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPort {
    /// Adapter the rule belongs to.
    pub adapter: String,
    /// Rule name, unique per VM.
    pub name: String,
    /// Port on the host.
    pub host_port: u16,
    /// Port in the guest.
    pub guest_port: u16,
    /// Transport protocol ("tcp" or "udp").
    pub protocol: String,
    /// Host address to bind.
    pub host_ip: String,
    /// Guest address to forward to; empty means the guest's default.
    pub guest_ip: String,
}

impl ForwardedPort {
    /// Create a TCP rule bound to localhost.
    pub fn new(name: impl Into<String>, host_port: u16, guest_port: u16) -> Self {
        Self {
            adapter: DEFAULT_PORT_ADAPTER.to_string(),
            name: name.into(),
            host_port,
            guest_port,
            protocol: "tcp".to_string(),
            host_ip: "127.0.0.1".to_string(),
            guest_ip: String::new(),
        }
    }

    /// Set the protocol.
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the host address.
    pub fn host_ip(mut self, ip: impl Into<String>) -> Self {
        self.host_ip = ip.into();
        self
    }

    /// Set the guest address.
    pub fn guest_ip(mut self, ip: impl Into<String>) -> Self {
        self.guest_ip = ip.into();
        self
    }
}

/// Network adapter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum AdapterType {
    /// NAT networking.
    Nat,
    /// Bridged networking.
    Bridged,
    /// No connection.
    Disconnected,
}

impl AdapterType {
    /// Connection type name understood by VeertuManage.
    pub fn connection(&self) -> &'static str {
        match self {
            AdapterType::Nat => "host",
            AdapterType::Bridged => "shared",
            AdapterType::Disconnected => "disconnected",
        }
    }
}

impl From<&str> for AdapterType {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "nat" => AdapterType::Nat,
            "bridged" => AdapterType::Bridged,
            _ => AdapterType::Disconnected,
        }
    }
}

impl From<String> for AdapterType {
    fn from(s: String) -> Self {
        AdapterType::from(s.as_str())
    }
}

/// Desired adapter for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    /// Adapter slot, starting at 1.
    pub slot: u32,
    /// Adapter type.
    #[serde(rename = "type")]
    pub adapter_type: AdapterType,
}

impl NetworkAdapter {
    /// Create an adapter descriptor.
    pub fn new(slot: u32, adapter_type: AdapterType) -> Self {
        Self { slot, adapter_type }
    }
}

/// Operations on a single Veertu VM.
///
/// One implementation exists per supported VeertuManage version. A driver
/// is bound to one VM identifier (or none, before import) for its whole
/// lifetime; use a new driver to talk about a different VM.
pub trait Driver: Send {
    /// Identifier of the VM this driver is bound to.
    fn uuid(&self) -> Option<&str>;

    /// Detected VeertuManage version.
    fn version(&self) -> &str;

    /// Delete every forwarded port rule on the VM.
    fn clear_forwarded_ports(&self) -> Result<()>;

    /// Delete the VM without prompting.
    fn delete(&self) -> Result<()>;

    /// Make the VM's network cards match the desired adapters.
    fn enable_adapters(&self, adapters: &[NetworkAdapter]) -> Result<()>;

    /// Run raw VeertuManage arguments and return stdout.
    fn execute_command(&self, args: &[String]) -> Result<String>;

    /// Export the VM as a box file, reporting percentage progress.
    fn export(&self, path: &Path, progress: Option<ProgressFn<'_>>) -> Result<()>;

    /// Add port forwarding rules. Existing rules are left alone.
    fn forward_ports(&self, ports: &[ForwardedPort]) -> Result<()>;

    /// Shut the VM down.
    fn halt(&self) -> Result<()>;

    /// Import a box and return the new VM's identifier.
    ///
    /// `Ok(None)` means the tool did not confirm the import.
    fn import(&self, source: &Path, progress: Option<ProgressFn<'_>>) -> Result<Option<String>>;

    /// Maximum number of network adapters supported.
    fn max_network_adapters(&self) -> usize {
        MAX_NETWORK_ADAPTERS
    }

    /// Host interfaces available for bridging.
    fn read_bridged_interfaces(&self) -> Result<Vec<String>>;

    /// Forwarded port rules of a VM (this one if `uuid` is `None`).
    fn read_forwarded_ports(&self, uuid: Option<&str>, active_only: bool)
        -> Result<Vec<ForwardedPort>>;

    /// Guest IP address, if the tool knows it.
    fn read_guest_ip(&self) -> Result<Option<String>>;

    /// MAC address of the first network card.
    fn read_mac_address(&self) -> Result<Option<String>>;

    /// Adapter layout the driver assumes for a freshly imported VM.
    fn read_network_interfaces(&self) -> BTreeMap<u32, AdapterType>;

    /// Current VM state, queried live.
    fn read_state(&self) -> Result<VmState>;

    /// Host ports used by other running VMs.
    fn read_used_ports(&self) -> Result<Vec<u16>>;

    /// All VMs known to the tool, by identifier.
    fn read_vms(&self) -> Result<BTreeMap<String, String>>;

    /// Resume a paused VM.
    fn resume(&self) -> Result<()> {
        self.start(StartMode::Resume)
    }

    /// Rename the VM.
    fn set_name(&self, name: &str) -> Result<()>;

    /// Host port forwarded to the given guest port.
    fn ssh_port(&self, expected_guest_port: u16) -> Result<Option<u16>>;

    /// Boot the VM.
    fn start(&self, mode: StartMode) -> Result<()>;

    /// Pause the VM.
    fn suspend(&self) -> Result<()>;

    /// Check that the tool is ready to accept work.
    fn verify(&self) -> Result<()>;

    /// Check whether a VM with the given identifier exists.
    fn vm_exists(&self, uuid: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_state_from_status() {
        let cases = [
            ("running", VmState::Running),
            ("stopped", VmState::Stopped),
            ("paused", VmState::Paused),
            ("suspended", VmState::Suspended),
            ("not_created", VmState::NotCreated),
            ("exploded", VmState::Unknown),
            ("", VmState::Unknown),
        ];

        for (status, expected) in cases {
            assert_eq!(VmState::from_status(status), expected, "status {:?}", status);
        }
    }

    #[test]
    fn test_vm_state_name_round_trips_through_status() {
        for state in [
            VmState::NotCreated,
            VmState::Stopped,
            VmState::Running,
            VmState::Paused,
            VmState::Suspended,
        ] {
            assert_eq!(VmState::from_status(state.name()), state);
        }
    }

    #[test]
    fn test_adapter_type_connection_names() {
        assert_eq!(AdapterType::Nat.connection(), "host");
        assert_eq!(AdapterType::Bridged.connection(), "shared");
        assert_eq!(AdapterType::Disconnected.connection(), "disconnected");
    }

    #[test]
    fn test_unknown_adapter_type_is_disconnected() {
        assert_eq!(AdapterType::from("hostonly"), AdapterType::Disconnected);
        assert_eq!(AdapterType::from("NAT"), AdapterType::Nat);

        let adapter: NetworkAdapter = serde_json::from_str(r#"{"slot": 2, "type": "intnet"}"#).unwrap();
        assert_eq!(adapter.adapter_type, AdapterType::Disconnected);
    }

    #[test]
    fn test_forwarded_port_defaults() {
        let rule = ForwardedPort::new("ssh", 2222, 22);
        assert_eq!(rule.adapter, DEFAULT_PORT_ADAPTER);
        assert_eq!(rule.protocol, "tcp");
        assert_eq!(rule.host_ip, "127.0.0.1");
        assert!(rule.guest_ip.is_empty());

        let udp = ForwardedPort::new("dns", 5353, 53).protocol("udp");
        assert_eq!(udp.protocol, "udp");
    }

    #[test]
    fn test_start_mode_from_gui() {
        assert_eq!(StartMode::from_gui(true), StartMode::Gui);
        assert_eq!(StartMode::from_gui(false), StartMode::Headless);
    }
}
