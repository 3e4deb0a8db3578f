//! CLI command implementations.

pub mod lifecycle;
pub mod package;
pub mod ports;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use veertu::{DriverFactory, Machine, Provider, ProviderConfig, VersionResolver};

/// Build a provider for the installed VeertuManage.
pub fn provider(id: Option<String>) -> veertu::Result<Provider> {
    let resolver = Arc::new(VersionResolver::installed());
    let factory = Arc::new(DriverFactory::locate(resolver)?);
    let provider = Provider::new(Machine::new(id.clone()), factory)?;

    if let (Some(id), None) = (id, provider.machine().id.as_ref()) {
        eprintln!("Warning: VM {} no longer exists", id);
    }
    Ok(provider)
}

/// Load a provider config, or the defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> veertu::Result<ProviderConfig> {
    let config = match path {
        Some(p) => ProviderConfig::load(p)?,
        None => ProviderConfig::default(),
    };
    for problem in config.validate() {
        eprintln!("Warning: {}", problem);
    }
    Ok(config)
}

/// Print a progress line in place.
pub fn print_progress(done: u64, total: u64, is_error: bool) {
    if is_error {
        return;
    }
    let pct = if total == 0 { 0 } else { done * 100 / total };
    print!("\rProgress: {}%", pct);
    let _ = std::io::stdout().flush();
}
