//! Machine-level facade over the driver.
//!
//! The orchestration layer talks to a [`Provider`]: it asks for the
//! machine state and SSH endpoint, and tells the provider when the
//! machine's VM identifier changes so a fresh driver can be built.

use crate::driver::factory::DriverFactory;
use crate::driver::{Driver, VmState};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Host the forwarded SSH port listens on.
pub const SSH_HOST: &str = "127.0.0.1";

/// Default guest SSH port.
pub const DEFAULT_SSH_GUEST_PORT: u16 = 22;

/// What the orchestration layer knows about a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    /// VeertuManage identifier of the VM, if one was created.
    pub id: Option<String>,
    /// Uid of the user that created the machine.
    pub uid: Option<String>,
    /// Guest port SSH listens on.
    pub ssh_guest_port: u16,
}

impl Machine {
    /// A machine with the given identifier.
    pub fn new(id: Option<String>) -> Self {
        Self {
            id,
            uid: None,
            ssh_guest_port: DEFAULT_SSH_GUEST_PORT,
        }
    }
}

/// State with short and long descriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    /// State identifier.
    pub id: VmState,
    /// Short description, e.g. "not created".
    pub short: String,
    /// Long description.
    pub long: String,
}

impl From<VmState> for MachineState {
    fn from(state: VmState) -> Self {
        Self {
            id: state,
            short: state.name().replace('_', " "),
            long: state.description().to_string(),
        }
    }
}

/// Where to SSH into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInfo {
    /// Host address.
    pub host: String,
    /// Host port forwarded to the guest's SSH port.
    pub port: u16,
}

/// Provider for one machine.
pub struct Provider {
    machine: Machine,
    factory: Arc<DriverFactory>,
    driver: Box<dyn Driver>,
}

impl Provider {
    /// Whether VeertuManage is installed and a driver can be built.
    pub fn installed(factory: &DriverFactory) -> bool {
        factory.create(None).is_ok()
    }

    /// Like [`Provider::installed`], optionally returning the reason.
    pub fn usable(factory: &DriverFactory, raise_error: bool) -> Result<bool> {
        match factory.create(None) {
            Ok(_) => Ok(true),
            Err(e) if raise_error => Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "Veertu provider is not usable");
                Ok(false)
            }
        }
    }

    /// Create a provider, building the driver for the machine's id.
    ///
    /// A stale id is dropped from the machine.
    pub fn new(mut machine: Machine, factory: Arc<DriverFactory>) -> Result<Self> {
        let driver = load_driver(&factory, &mut machine)?;
        Ok(Self {
            machine,
            factory,
            driver,
        })
    }

    /// Rebuild the driver after the machine's id changed.
    pub fn machine_id_changed(&mut self) -> Result<()> {
        self.driver = load_driver(&self.factory, &mut self.machine)?;
        Ok(())
    }

    /// Set the machine id and rebuild the driver.
    pub fn set_id(&mut self, id: Option<String>) -> Result<()> {
        self.machine.id = id;
        self.machine_id_changed()
    }

    /// Change the guest port used to find the SSH forwarding rule.
    pub fn set_ssh_guest_port(&mut self, port: u16) {
        self.machine.ssh_guest_port = port;
    }

    /// The machine this provider represents.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// The current driver.
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Query the live machine state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UserMismatch`] if the machine belongs to another user.
    pub fn state(&self) -> Result<MachineState> {
        if let Some(ref uid) = self.machine.uid {
            let current = current_uid();
            if *uid != current {
                return Err(Error::UserMismatch {
                    original_uid: uid.clone(),
                    uid: current,
                });
            }
        }

        let state = match self.driver.uuid() {
            None => VmState::NotCreated,
            Some(_) => self.driver.read_state()?,
        };
        Ok(MachineState::from(state))
    }

    /// SSH endpoint, if the VM is running and forwards the SSH port.
    pub fn ssh_info(&self) -> Result<Option<SshInfo>> {
        if self.state()?.id != VmState::Running {
            return Ok(None);
        }

        let port = self.driver.ssh_port(self.machine.ssh_guest_port)?;
        Ok(port.map(|port| SshInfo {
            host: SSH_HOST.to_string(),
            port,
        }))
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.machine.id {
            Some(ref id) => write!(f, "Veertu ({})", id),
            None => write!(f, "Veertu (new VM)"),
        }
    }
}

/// Build a driver for the machine, clearing the id if the VM is gone.
///
/// At most two attempts are made: with the id, then without it.
fn load_driver(factory: &DriverFactory, machine: &mut Machine) -> Result<Box<dyn Driver>> {
    tracing::debug!(id = ?machine.id, "instantiating the driver");
    match factory.create(machine.id.as_deref()) {
        Ok(driver) => Ok(driver),
        Err(e) if e.is_vm_not_found() => {
            tracing::debug!(id = ?machine.id, "VM not found, clearing saved machine id");
            machine.id = None;
            factory.create(None)
        }
        Err(e) => Err(e),
    }
}

fn current_uid() -> String {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }.to_string()
}
