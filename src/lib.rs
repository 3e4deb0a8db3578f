//! veertu - control-plane client for Veertu virtual machines.
//!
//! All real work is done by the `VeertuManage` control tool. This crate
//! locates and runs it, interprets its output, and exposes a typed,
//! version-dispatched [`Driver`] plus a machine-level [`Provider`] facade.

pub mod action;
pub mod config;
pub mod driver;
pub mod error;
pub mod provider;

pub use config::ProviderConfig;
pub use driver::factory::{DriverFactory, VersionResolver};
pub use driver::{AdapterType, Driver, ForwardedPort, NetworkAdapter, StartMode, VmState};
pub use error::{Error, Result};
pub use provider::{Machine, MachineState, Provider, SshInfo};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
