//! Driver for VeertuManage 5.0.

use super::adapters;
use super::command::OutputStream;
use super::parse::{self, Envelope, ProgressParser, VmDescription, VmInfo, VmSummary};
use super::retry::{ExecOptions, RetryExecutor};
use super::{
    AdapterType, Driver, ForwardedPort, NetworkAdapter, ProgressFn, StartMode, VmState,
    DEFAULT_PORT_ADAPTER,
};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Number of `show` lookups made by [`Driver::vm_exists`].
pub const EXISTS_POLL_ATTEMPTS: u32 = 5;

/// Delay between `show` lookups.
pub const EXISTS_POLL_DELAY: Duration = Duration::from_secs(2);

/// Build an owned argument vector.
fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Driver for VeertuManage 5.0.x.
pub struct Version5_0 {
    uuid: Option<String>,
    version: String,
    exec: RetryExecutor,
    poll_delay: Duration,
}

impl Version5_0 {
    /// Create a driver bound to `uuid` (or to no VM yet).
    pub fn new(uuid: Option<String>, version: impl Into<String>, exec: RetryExecutor) -> Self {
        Self {
            uuid,
            version: version.into(),
            exec,
            poll_delay: EXISTS_POLL_DELAY,
        }
    }

    /// Override the delay between existence lookups.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    fn bound_uuid(&self) -> Result<&str> {
        self.uuid.as_deref().ok_or(Error::NotCreated)
    }

    fn execute(&self, parts: &[&str]) -> Result<String> {
        self.exec.execute(&argv(parts), ExecOptions::default())
    }

    /// Run a command, feeding any percentages it prints to `progress`.
    fn execute_with_progress(
        &self,
        args: &[String],
        progress: Option<ProgressFn<'_>>,
    ) -> Result<String> {
        match progress {
            Some(report) => {
                let mut stdout = ProgressParser::default();
                let mut stderr = ProgressParser::default();
                let mut on_output = |stream: OutputStream, chunk: &str| {
                    let parser = match stream {
                        OutputStream::Stdout => &mut stdout,
                        OutputStream::Stderr => &mut stderr,
                    };
                    for pct in parser.feed(chunk) {
                        report(pct);
                    }
                };
                self.exec
                    .execute_streaming(args, ExecOptions::default(), Some(&mut on_output))
            }
            None => self.exec.execute(args, ExecOptions::default()),
        }
    }

    /// Undecoded body of `show`, or `None` if the answer was unparseable
    /// or empty.
    fn show_body(&self, uuid: &str) -> Result<Option<serde_json::Value>> {
        let output = self.exec.execute(
            &argv(&["--machine-readable", "show", uuid]),
            ExecOptions::retryable(),
        )?;
        Ok(raw_body(&output, "show"))
    }

    /// Body of `show`, or `None` if the answer was unparseable or empty.
    fn vm_info(&self, uuid: &str) -> Result<Option<VmInfo>> {
        Ok(self
            .show_body(uuid)?
            .and_then(|body| decode_body(body, "show")))
    }

    /// Body of `describe`, or `None` if the answer was unparseable or empty.
    fn vm_description(&self, uuid: &str) -> Result<Option<VmDescription>> {
        let output = self.exec.execute(
            &argv(&["--machine-readable", "describe", uuid]),
            ExecOptions::retryable(),
        )?;
        Ok(non_empty_body(&output, "describe"))
    }

    fn vm_list(&self) -> Result<Vec<VmSummary>> {
        let output = self.exec.execute(
            &argv(&["--machine-readable", "list"]),
            ExecOptions::retryable(),
        )?;
        Ok(non_empty_body(&output, "list").unwrap_or_default())
    }

    fn port_forward_args(uuid: &str, port: &ForwardedPort) -> Vec<String> {
        let host_port = port.host_port.to_string();
        let guest_port = port.guest_port.to_string();
        argv(&[
            "--machine-readable",
            "modify",
            uuid,
            "add",
            "port_forwarding",
            &port.name,
            "--host-ip",
            &port.host_ip,
            "--host-port",
            &host_port,
            "--protocol",
            &port.protocol,
            "--guest-ip",
            &port.guest_ip,
            "--guest-port",
            &guest_port,
        ])
    }
}

/// Body of a machine-readable answer, if it carries anything.
///
/// Read paths treat malformed output as "no result".
fn raw_body(output: &str, what: &str) -> Option<serde_json::Value> {
    let envelope: Envelope<serde_json::Value> = match parse::parse_envelope(output) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(command = what, error = %e, "unparseable VeertuManage output");
            return None;
        }
    };

    let body = envelope.body?;
    let empty = match &body {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(_) => false,
        _ => true,
    };
    if empty {
        None
    } else {
        Some(body)
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(body: serde_json::Value, what: &str) -> Option<T> {
    match serde_json::from_value(body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(command = what, error = %e, "unexpected VeertuManage body");
            None
        }
    }
}

fn non_empty_body<T: serde::de::DeserializeOwned>(output: &str, what: &str) -> Option<T> {
    raw_body(output, what).and_then(|body| decode_body(body, what))
}

impl Driver for Version5_0 {
    fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn clear_forwarded_ports(&self) -> Result<()> {
        let uuid = self.bound_uuid()?;
        for rule in self.read_forwarded_ports(None, false)? {
            self.execute(&["modify", uuid, "delete", "port_forwarding", &rule.name])?;
        }
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let uuid = self.bound_uuid()?;
        self.execute(&["delete", "--yes", uuid])?;
        Ok(())
    }

    fn enable_adapters(&self, desired: &[NetworkAdapter]) -> Result<()> {
        let uuid = self.bound_uuid()?;
        if desired.len() > self.max_network_adapters() {
            return Err(Error::Config(format!(
                "{} network adapters requested, at most {} are supported",
                desired.len(),
                self.max_network_adapters()
            )));
        }
        let cards = self
            .vm_description(uuid)?
            .map(VmDescription::network_cards)
            .unwrap_or_default();

        let changes = adapters::reconcile(&cards, desired);
        tracing::debug!(
            vm = %uuid,
            existing = cards.len(),
            desired = desired.len(),
            changes = changes.len(),
            "reconciling network adapters"
        );

        for change in changes {
            let response = self.exec.execute(&change.to_args(uuid), ExecOptions::default())?;
            tracing::info!(?change, response = %response.trim(), "network card updated");
        }
        Ok(())
    }

    fn execute_command(&self, args: &[String]) -> Result<String> {
        self.exec.execute(args, ExecOptions::default())
    }

    fn export(&self, path: &Path, progress: Option<ProgressFn<'_>>) -> Result<()> {
        let uuid = self.bound_uuid()?;
        let path = path.to_string_lossy();
        let args = argv(&["export", uuid, &path, "--fmt=box"]);
        self.execute_with_progress(&args, progress)?;
        Ok(())
    }

    fn forward_ports(&self, ports: &[ForwardedPort]) -> Result<()> {
        let uuid = self.bound_uuid()?;
        for port in ports {
            tracing::debug!(
                vm = %uuid,
                name = %port.name,
                host_port = port.host_port,
                guest_port = port.guest_port,
                "forwarding port"
            );
            self.exec
                .execute(&Self::port_forward_args(uuid, port), ExecOptions::default())?;
        }
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        let uuid = self.bound_uuid()?;
        self.execute(&["shutdown", uuid])?;
        Ok(())
    }

    fn import(&self, source: &Path, progress: Option<ProgressFn<'_>>) -> Result<Option<String>> {
        let source = source.to_string_lossy();

        tracing::debug!(source = %source, "dry-run import to determine a parallel-safe name");
        let dry_run = self.execute(&["import", "-n", &source])?;
        let plan = parse::parse_import_dry_run(&dry_run)?;

        let name = parse::unique_vm_name(&plan.suggested_name);
        tracing::debug!(suggested = %plan.suggested_name, name = %name, "parallel-safe name");

        let mut args = argv(&[
            "--machine-readable",
            "import",
            &source,
            "--os-family",
            "0",
            "--name",
            &name,
        ]);
        for disk in &plan.disks {
            let target = parse::rewrite_disk_path(&disk.path, &plan.suggested_name, &name);
            args.extend(argv(&["--vsys", "0", "--unit", &disk.unit, "--disk", &target]));
        }

        let response = self.execute_with_progress(&args, progress)?;
        match parse::parse_envelope::<serde_json::Value>(&response) {
            Ok(env) if env.is_ok() => {
                tracing::info!(name = %name, "imported successfully");
            }
            Ok(env) => {
                tracing::warn!(status = ?env.status, "import was not confirmed");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "import response could not be parsed");
                return Ok(None);
            }
        }

        // The import answer carries no identifier; look it up by name.
        let id = self
            .vm_info(&name)?
            .map(|info| info.id)
            .filter(|id| !id.is_empty());
        tracing::debug!(name = %name, id = ?id, "resolved imported vm");
        Ok(id)
    }

    fn read_bridged_interfaces(&self) -> Result<Vec<String>> {
        Err(Error::unsupported("bridged interfaces"))
    }

    fn read_forwarded_ports(
        &self,
        uuid: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<ForwardedPort>> {
        let uuid = match uuid {
            Some(id) => id,
            None => self.bound_uuid()?,
        };
        tracing::debug!(vm = %uuid, active_only, "reading forwarded ports");

        let Some(info) = self.vm_info(uuid)? else {
            return Ok(Vec::new());
        };
        if active_only && info.status != "running" {
            return Ok(Vec::new());
        }

        let rules = info
            .port_forwarding
            .into_iter()
            .map(|r| ForwardedPort {
                adapter: DEFAULT_PORT_ADAPTER.to_string(),
                name: r.name,
                host_port: r.host_port,
                guest_port: r.guest_port,
                protocol: r.protocol.unwrap_or_else(|| "tcp".to_string()),
                host_ip: r.host_ip.unwrap_or_default(),
                guest_ip: r.guest_ip.unwrap_or_default(),
            })
            .inspect(|rule| tracing::debug!(?rule, "  - forwarded port"))
            .collect();
        Ok(rules)
    }

    fn read_guest_ip(&self) -> Result<Option<String>> {
        let uuid = self.bound_uuid()?;
        Ok(self
            .vm_info(uuid)?
            .and_then(|info| info.ip)
            .filter(|ip| !ip.is_empty()))
    }

    fn read_mac_address(&self) -> Result<Option<String>> {
        let uuid = self.bound_uuid()?;
        Ok(self
            .vm_description(uuid)?
            .map(VmDescription::network_cards)
            .and_then(|cards| cards.into_iter().next())
            .and_then(|card| card.mac_address))
    }

    fn read_network_interfaces(&self) -> BTreeMap<u32, AdapterType> {
        BTreeMap::from([(0, AdapterType::Nat), (1, AdapterType::Bridged)])
    }

    fn read_state(&self) -> Result<VmState> {
        let uuid = self.bound_uuid()?;
        let info = self
            .vm_info(uuid)?
            .ok_or_else(|| Error::parse(format!("no vm info returned for {}", uuid)))?;
        let state = VmState::from_status(&info.status);
        tracing::debug!(vm = %uuid, status = %info.status, %state, "machine status");
        Ok(state)
    }

    fn read_used_ports(&self) -> Result<Vec<u16>> {
        let mut ports = Vec::new();
        for vm in self.vm_list()? {
            // Our own ports are not "used" by someone else.
            if vm.id.is_empty() || self.uuid.as_deref() == Some(vm.id.as_str()) {
                continue;
            }
            ports.extend(
                self.read_forwarded_ports(Some(&vm.id), true)?
                    .into_iter()
                    .map(|r| r.host_port),
            );
        }
        Ok(ports)
    }

    fn read_vms(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .vm_list()?
            .into_iter()
            .map(|vm| (vm.id, vm.name))
            .collect())
    }

    fn set_name(&self, name: &str) -> Result<()> {
        let uuid = self.bound_uuid()?;
        self.execute(&["modify", uuid, "set", "--name", name])?;
        Ok(())
    }

    fn ssh_port(&self, expected_guest_port: u16) -> Result<Option<u16>> {
        tracing::debug!(expected = expected_guest_port, "searching for SSH port");
        let expected = expected_guest_port.to_string();
        Ok(self
            .read_forwarded_ports(None, false)?
            .into_iter()
            .find(|r| r.guest_port.to_string() == expected)
            .map(|r| r.host_port))
    }

    fn start(&self, mode: StartMode) -> Result<()> {
        let uuid = self.bound_uuid()?;

        let headless = match mode {
            StartMode::Headless => Some("1"),
            StartMode::Gui => Some("0"),
            StartMode::Resume => None,
        };
        if let Some(flag) = headless {
            self.execute(&["--machine-readable", "modify", uuid, "set", "--headless", flag])?;
        }

        let args = argv(&["--machine-readable", "start", uuid]);
        let response = self.exec.execute(&args, ExecOptions::default())?;
        let envelope: Envelope<serde_json::Value> = parse::parse_envelope(&response)?;
        if envelope.is_ok() {
            return Ok(());
        }

        Err(Error::tool_execution(
            &args,
            response,
            format!("unexpected start status: {:?}", envelope.status),
        ))
    }

    fn suspend(&self) -> Result<()> {
        let uuid = self.bound_uuid()?;
        self.execute(&["pause", uuid])?;
        Ok(())
    }

    fn verify(&self) -> Result<()> {
        // `list` fails when the kernel drivers are not loaded yet.
        self.exec
            .execute(&argv(&["list"]), ExecOptions::retryable())?;
        Ok(())
    }

    fn vm_exists(&self, uuid: &str) -> Result<bool> {
        for attempt in 1..=EXISTS_POLL_ATTEMPTS {
            // Existence does not depend on every field decoding.
            match self.show_body(uuid) {
                Ok(Some(_)) => return Ok(true),
                // A readable answer without a VM is conclusive.
                Ok(None) => return Ok(false),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(vm = %uuid, attempt, error = %e, "vm lookup failed");
                    if attempt < EXISTS_POLL_ATTEMPTS {
                        std::thread::sleep(self.poll_delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Every lookup failed; a plain `show` raises if it fails again.
        self.execute(&["show", uuid])?;
        Ok(true)
    }
}
