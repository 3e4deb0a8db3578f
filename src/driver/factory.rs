//! Version detection and driver selection.
//!
//! The VeertuManage version is read once and kept by a [`VersionResolver`]
//! built at the composition root and shared by reference. The
//! [`DriverFactory`] maps the version onto a driver implementation by
//! prefix and, when given a VM identifier, checks that the VM exists.

use super::command::{CommandRunner, ToolLocator, VeertuManage};
use super::retry::{RetryExecutor, RETRY_DELAY};
use super::version_5_0::{Version5_0, EXISTS_POLL_DELAY};
use super::Driver;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Version reported by every VeertuManage release this crate knows about.
///
/// VeertuManage has no version query, so the installed tool is assumed to
/// speak the 5.0 command set once it has been located.
pub const VEERTU_MANAGE_VERSION: &str = "5.0";

/// Reads the VeertuManage version. Expected to be slow.
pub trait VersionProbe: Send + Sync {
    /// Detect the installed version.
    fn read_version(&self) -> Result<String>;
}

/// Probe that locates the tool and reports [`VEERTU_MANAGE_VERSION`].
#[derive(Debug, Clone, Default)]
pub struct InstalledToolProbe {
    locator: ToolLocator,
}

impl InstalledToolProbe {
    /// Create a probe using a specific locator.
    pub fn new(locator: ToolLocator) -> Self {
        Self { locator }
    }
}

impl VersionProbe for InstalledToolProbe {
    fn read_version(&self) -> Result<String> {
        self.locator.locate()?;
        Ok(VEERTU_MANAGE_VERSION.to_string())
    }
}

/// Detects the tool version once and remembers it.
///
/// Concurrent first callers block on the lock rather than probing twice.
/// A failed probe is not remembered; the next call probes again.
pub struct VersionResolver {
    probe: Box<dyn VersionProbe>,
    version: Mutex<Option<String>>,
}

impl VersionResolver {
    /// Create a resolver around a probe.
    pub fn new(probe: impl VersionProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            version: Mutex::new(None),
        }
    }

    /// Resolver for the installed VeertuManage.
    pub fn installed() -> Self {
        Self::new(InstalledToolProbe::default())
    }

    /// The tool version, probing on first use.
    pub fn resolve(&self) -> Result<String> {
        let mut cached = self.version.lock();
        if let Some(ref version) = *cached {
            return Ok(version.clone());
        }

        let version = self.probe.read_version()?;
        tracing::debug!(version = %version, "detected Veertu version");
        *cached = Some(version.clone());
        Ok(version)
    }
}

/// Everything a driver needs to be built.
pub struct DriverContext {
    /// VM the driver is bound to.
    pub uuid: Option<String>,
    /// Detected tool version.
    pub version: String,
    /// Executor for tool commands.
    pub exec: RetryExecutor,
    /// Delay between existence lookups.
    pub poll_delay: Duration,
}

/// Constructor for one driver implementation.
pub type DriverBuilder = fn(DriverContext) -> Box<dyn Driver>;

fn build_version_5_0(ctx: DriverContext) -> Box<dyn Driver> {
    Box::new(
        Version5_0::new(ctx.uuid, ctx.version, ctx.exec).with_poll_delay(ctx.poll_delay),
    )
}

/// Supported version prefixes and their drivers.
const DRIVERS: &[(&str, DriverBuilder)] = &[("5.0", build_version_5_0)];

/// Comma separated, sorted list of supported version prefixes.
pub fn supported_versions() -> String {
    let mut prefixes: Vec<&str> = DRIVERS.iter().map(|(prefix, _)| *prefix).collect();
    prefixes.sort_unstable();
    prefixes.join(", ")
}

/// Select the driver for a version by prefix.
///
/// # Errors
///
/// Returns [`Error::UnsupportedVersion`] if no prefix matches.
pub fn select_driver(version: &str) -> Result<DriverBuilder> {
    DRIVERS
        .iter()
        .find(|(prefix, _)| version.starts_with(prefix))
        .map(|(_, builder)| *builder)
        .ok_or_else(|| Error::UnsupportedVersion {
            detected: version.to_string(),
            supported: supported_versions(),
        })
}

/// Builds drivers for the installed tool version.
pub struct DriverFactory {
    resolver: Arc<VersionResolver>,
    runner: Arc<dyn CommandRunner>,
    retry_delay: Duration,
    poll_delay: Duration,
}

impl DriverFactory {
    /// Create a factory around an existing runner.
    pub fn new(resolver: Arc<VersionResolver>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            resolver,
            runner,
            retry_delay: RETRY_DELAY,
            poll_delay: EXISTS_POLL_DELAY,
        }
    }

    /// Create a factory for the installed VeertuManage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolNotFound`] if the tool cannot be located.
    pub fn locate(resolver: Arc<VersionResolver>) -> Result<Self> {
        let runner = VeertuManage::locate()?;
        Ok(Self::new(resolver, Arc::new(runner)))
    }

    /// Override retry and polling delays.
    pub fn with_delays(mut self, retry_delay: Duration, poll_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.poll_delay = poll_delay;
        self
    }

    /// The shared version resolver.
    pub fn resolver(&self) -> &Arc<VersionResolver> {
        &self.resolver
    }

    /// Build a driver, optionally bound to an existing VM.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VmNotFound`] if `uuid` names a VM the tool does not
    /// know, so the caller can drop the stale identifier and try again.
    pub fn create(&self, uuid: Option<&str>) -> Result<Box<dyn Driver>> {
        let version = self.resolver.resolve()?;
        tracing::debug!(version = %version, "finding driver for Veertu version");
        let builder = select_driver(&version)?;

        let driver = builder(DriverContext {
            uuid: uuid.map(String::from),
            version: version.clone(),
            exec: RetryExecutor::new(Arc::clone(&self.runner)).with_delay(self.retry_delay),
            poll_delay: self.poll_delay,
        });
        tracing::info!(version = %version, "using Veertu driver");

        if let Some(id) = uuid {
            if !driver.vm_exists(id)? {
                return Err(Error::VmNotFound(id.to_string()));
            }
        }

        Ok(driver)
    }
}
