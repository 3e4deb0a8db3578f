//! Multi-step machine actions built on the provider.
//!
//! None of these are atomic. A failure part way through leaves whatever
//! the finished steps did, and the next state query reports it.

use crate::config::ProviderConfig;
use crate::driver::{StartMode, VmState};
use crate::error::{Error, Result};
use crate::provider::Provider;
use std::path::{Path, PathBuf};

/// File name of an exported box inside the export directory.
pub const EXPORT_FILE_NAME: &str = "box.vmz";

/// Run the customizations attached to `event`.
pub fn run_customizations(provider: &Provider, config: &ProviderConfig, event: &str) -> Result<()> {
    let driver = provider.driver();
    for customization in config.customizations_for(event) {
        let args = customization.resolve(driver.uuid())?;
        tracing::info!(event, ?args, "running customization");
        driver.execute_command(&args)?;
    }
    Ok(())
}

/// Import a box and bind the provider to the new VM.
///
/// Returns the new VM identifier.
pub fn import(
    provider: &mut Provider,
    config: &ProviderConfig,
    source: &Path,
    mut progress: impl FnMut(u64, u64, bool),
) -> Result<String> {
    config.ensure_valid()?;
    run_customizations(provider, config, "pre-import")?;

    let mut report = |pct: u8| progress(u64::from(pct), 100, false);
    let id = provider
        .driver()
        .import(source, Some(&mut report))?
        .ok_or_else(|| {
            Error::tool_execution(
                &["import".to_string(), source.display().to_string()],
                "",
                "import was not confirmed by VeertuManage",
            )
        })?;

    tracing::info!(id = %id, "imported VM");
    provider.set_id(Some(id.clone()))?;

    if let Some(ref name) = config.name {
        provider.driver().set_name(name)?;
    }
    Ok(id)
}

/// Configure and boot the VM.
///
/// Runs pre-boot customizations, reconciles network adapters, starts the
/// VM headless or with a GUI, then runs post-boot customizations.
pub fn boot(provider: &Provider, config: &ProviderConfig) -> Result<()> {
    config.ensure_valid()?;
    let driver = provider.driver();
    if driver.uuid().is_none() {
        return Err(Error::NotCreated);
    }

    run_customizations(provider, config, "pre-boot")?;
    driver.enable_adapters(&config.desired_adapters())?;

    let mode = StartMode::from_gui(config.gui);
    tracing::info!(?mode, "booting VM");
    driver.start(mode)?;

    run_customizations(provider, config, "post-boot")
}

/// Resume the VM if it is paused or stopped.
///
/// Returns whether a resume was issued.
pub fn resume(provider: &Provider) -> Result<bool> {
    let state = provider.state()?.id;
    if matches!(state, VmState::Paused | VmState::Stopped) {
        tracing::info!(%state, "resuming VM");
        provider.driver().resume()?;
        return Ok(true);
    }
    Ok(false)
}

/// Export a stopped VM into `dir`, reporting progress as
/// `(percent, 100, is_error)`.
pub fn export(
    provider: &Provider,
    dir: &Path,
    mut progress: impl FnMut(u64, u64, bool),
) -> Result<PathBuf> {
    let state = provider.state()?.id;
    if state != VmState::Stopped {
        return Err(Error::InvalidState {
            expected: VmState::Stopped.to_string(),
            actual: state.to_string(),
        });
    }

    let path = dir.join(EXPORT_FILE_NAME);
    tracing::info!(path = %path.display(), "exporting VM");
    let mut report = |pct: u8| progress(u64::from(pct), 100, false);
    provider.driver().export(&path, Some(&mut report))?;
    Ok(path)
}
