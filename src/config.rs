//! Configuration.
//!
//! Two kinds of configuration live here:
//! - the `~/.veertu_config` override file naming the VeertuManage binary
//! - [`ProviderConfig`], the per-machine settings the orchestration layer
//!   hands to the provider (GUI, adapters, customizations)

use crate::driver::{AdapterType, NetworkAdapter};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the override file in the user's home directory.
pub const OVERRIDE_FILE_NAME: &str = ".veertu_config";

/// Placeholder replaced with the VM identifier in customizations.
pub const ID_PLACEHOLDER: &str = ":id";

/// Events a customization can be attached to.
pub const VALID_EVENTS: [&str; 4] = ["pre-import", "pre-boot", "post-boot", "post-comm"];

/// Event used when a customization names none.
pub const DEFAULT_EVENT: &str = "pre-boot";

/// Location of the override file, if there is a home directory.
pub fn override_file_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(OVERRIDE_FILE_NAME))
}

#[derive(Debug, Default, Deserialize)]
struct OverrideFile {
    #[serde(rename = "VAGRANT", default)]
    vagrant: OverrideSection,
}

#[derive(Debug, Default, Deserialize)]
struct OverrideSection {
    #[serde(default)]
    manage_path: Option<PathBuf>,
}

/// Read `manage_path` from the `[VAGRANT]` section of an override file.
///
/// Returns `None` if the file does not exist or does not set the key.
pub fn read_manage_path(file: &Path) -> Result<Option<PathBuf>> {
    if !file.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(file)?;
    let parsed: OverrideFile = toml::from_str(&contents)
        .map_err(|e| Error::ConfigLoad(format!("{}: {}", file.display(), e)))?;
    Ok(parsed.vagrant.manage_path)
}

/// A VeertuManage command to run at a point in the machine's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customization {
    /// Lifecycle event, one of [`VALID_EVENTS`].
    #[serde(default = "default_event")]
    pub event: String,
    /// Arguments to VeertuManage; [`ID_PLACEHOLDER`] becomes the VM id.
    pub command: Vec<String>,
}

fn default_event() -> String {
    DEFAULT_EVENT.to_string()
}

impl Customization {
    /// Arguments with the id placeholder substituted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCreated`] if the command needs an id and there
    /// is none.
    pub fn resolve(&self, uuid: Option<&str>) -> Result<Vec<String>> {
        self.command
            .iter()
            .map(|arg| {
                if arg == ID_PLACEHOLDER {
                    uuid.map(String::from).ok_or(Error::NotCreated)
                } else {
                    Ok(arg.clone())
                }
            })
            .collect()
    }

    /// Whether the command refers to the VM id.
    pub fn uses_id(&self) -> bool {
        self.command.iter().any(|a| a == ID_PLACEHOLDER)
    }
}

/// Provider settings for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Boot with the Veertu window instead of headless.
    pub gui: bool,

    /// Name to give the VM after import.
    pub name: Option<String>,

    /// Network adapters by slot. Slot 1 is NAT unless configured otherwise.
    pub network_adapters: Vec<NetworkAdapter>,

    /// Customizations, applied in order.
    pub customizations: Vec<Customization>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            gui: false,
            name: None,
            network_adapters: vec![NetworkAdapter::new(1, AdapterType::Nat)],
            customizations: Vec::new(),
        }
    }
}

impl ProviderConfig {
    /// Load a provider config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Set the adapter for a slot, replacing any previous one.
    pub fn network_adapter(&mut self, slot: u32, adapter_type: AdapterType) -> &mut Self {
        self.network_adapters.retain(|a| a.slot != slot);
        self.network_adapters
            .push(NetworkAdapter::new(slot, adapter_type));
        self
    }

    /// Append a customization for an event.
    pub fn customize<I, S>(&mut self, event: &str, command: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.customizations.push(Customization {
            event: event.to_string(),
            command: command.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Set the memory size in megabytes before boot.
    pub fn memory(&mut self, megabytes: u32) -> &mut Self {
        let size = format!("{}MB", megabytes);
        self.customize(
            DEFAULT_EVENT,
            ["modify", ID_PLACEHOLDER, "set", "--ram", size.as_str()],
        )
    }

    /// Set the CPU count before boot.
    pub fn cpus(&mut self, count: u32) -> &mut Self {
        let count = count.to_string();
        self.customize(
            DEFAULT_EVENT,
            ["modify", ID_PLACEHOLDER, "set", "--cpu", count.as_str()],
        )
    }

    /// Customizations for one event, in order.
    pub fn customizations_for<'a>(
        &'a self,
        event: &'a str,
    ) -> impl Iterator<Item = &'a Customization> + 'a {
        self.customizations.iter().filter(move |c| c.event == event)
    }

    /// Desired adapters ordered by slot.
    pub fn desired_adapters(&self) -> Vec<NetworkAdapter> {
        let mut adapters = self.network_adapters.clone();
        adapters.sort_by_key(|a| a.slot);
        adapters
    }

    /// Layer `other` over this config.
    ///
    /// Customizations are concatenated; adapters are merged by slot with
    /// `other` winning; `other`'s name is used when it has one.
    pub fn merge(&self, other: &ProviderConfig) -> ProviderConfig {
        let mut merged = self.clone();
        merged.gui = other.gui;
        if other.name.is_some() {
            merged.name = other.name.clone();
        }
        for adapter in &other.network_adapters {
            merged.network_adapter(adapter.slot, adapter.adapter_type);
        }
        merged
            .customizations
            .extend(other.customizations.iter().cloned());
        merged
    }

    /// Check the config and describe every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for c in &self.customizations {
            if !VALID_EVENTS.contains(&c.event.as_str()) {
                errors.push(format!(
                    "invalid customization event '{}'; valid events: {}",
                    c.event,
                    VALID_EVENTS.join(", ")
                ));
            }
        }

        for c in &self.customizations {
            if c.event == "pre-import" && c.uses_id() {
                errors.push(
                    "pre-import customizations cannot use ':id'; the VM does not exist yet"
                        .to_string(),
                );
            }
        }

        for a in &self.network_adapters {
            if a.slot == 0 {
                errors.push("network adapter slots start at 1".to_string());
            }
        }

        errors
    }

    /// Validate, failing on the first problem.
    pub fn ensure_valid(&self) -> Result<()> {
        match self.validate().into_iter().next() {
            Some(problem) => Err(Error::Config(problem)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_nat_on_slot_one() {
        let config = ProviderConfig::default();
        assert!(!config.gui);
        assert_eq!(
            config.desired_adapters(),
            vec![NetworkAdapter::new(1, AdapterType::Nat)]
        );
    }

    #[test]
    fn test_network_adapter_replaces_slot() {
        let mut config = ProviderConfig::default();
        config
            .network_adapter(2, AdapterType::Bridged)
            .network_adapter(1, AdapterType::Disconnected);

        assert_eq!(
            config.desired_adapters(),
            vec![
                NetworkAdapter::new(1, AdapterType::Disconnected),
                NetworkAdapter::new(2, AdapterType::Bridged),
            ]
        );
    }

    #[test]
    fn test_memory_and_cpus_are_pre_boot_customizations() {
        let mut config = ProviderConfig::default();
        config.memory(2048).cpus(2);

        let pre_boot: Vec<_> = config.customizations_for("pre-boot").collect();
        assert_eq!(pre_boot.len(), 2);
        assert_eq!(
            pre_boot[0].command,
            vec!["modify", ":id", "set", "--ram", "2048MB"]
        );
        assert_eq!(pre_boot[1].command, vec!["modify", ":id", "set", "--cpu", "2"]);
    }

    #[test]
    fn test_customization_resolves_id() {
        let c = Customization {
            event: "pre-boot".to_string(),
            command: vec!["modify".into(), ":id".into(), "set".into()],
        };
        assert_eq!(c.resolve(Some("vm-9")).unwrap(), vec!["modify", "vm-9", "set"]);
        assert!(matches!(c.resolve(None), Err(Error::NotCreated)));
    }

    #[test]
    fn test_validate_reports_bad_event_and_pre_import_id() {
        let mut config = ProviderConfig::default();
        config.customize("mid-flight", ["list"]);
        config.customize("pre-import", ["modify", ":id", "set"]);

        let errors = config.validate();
        assert_eq!(errors.len(), 2, "{:?}", errors);
        assert!(errors[0].contains("mid-flight"));
        assert!(errors[1].contains("pre-import"));
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn test_valid_config_has_no_errors() {
        let mut config = ProviderConfig::default();
        config.memory(1024);
        assert!(config.validate().is_empty());
        assert!(config.ensure_valid().is_ok());
    }

    #[test]
    fn test_merge() {
        let mut base = ProviderConfig::default();
        base.memory(512);
        base.name = Some("base".to_string());

        let mut over = ProviderConfig::default();
        over.gui = true;
        over.network_adapter(2, AdapterType::Bridged);
        over.cpus(4);

        let merged = base.merge(&over);
        assert!(merged.gui);
        assert_eq!(merged.name.as_deref(), Some("base"));
        assert_eq!(merged.customizations.len(), 2);
        assert_eq!(merged.desired_adapters().len(), 2);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veertu.toml");
        std::fs::write(
            &path,
            r#"
gui = true
name = "web"

[[network_adapters]]
slot = 1
type = "nat"

[[network_adapters]]
slot = 2
type = "bridged"

[[customizations]]
command = ["modify", ":id", "set", "--ram", "1024MB"]

[[customizations]]
event = "post-boot"
command = ["list"]
"#,
        )
        .unwrap();

        let config = ProviderConfig::load(&path).unwrap();
        assert!(config.gui);
        assert_eq!(config.name.as_deref(), Some("web"));
        assert_eq!(config.desired_adapters()[1].adapter_type, AdapterType::Bridged);
        assert_eq!(config.customizations[0].event, "pre-boot");
        assert_eq!(config.customizations_for("post-boot").count(), 1);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: ProviderConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProviderConfig::default());
    }

    #[test]
    fn test_read_manage_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(OVERRIDE_FILE_NAME);
        assert!(read_manage_path(&file).unwrap().is_none());

        std::fs::write(&file, "[VAGRANT]\nmanage_path = \"/opt/veertu/VeertuManage\"\n").unwrap();
        assert_eq!(
            read_manage_path(&file).unwrap(),
            Some(PathBuf::from("/opt/veertu/VeertuManage"))
        );

        std::fs::write(&file, "[OTHER]\nkey = 1\n").unwrap();
        assert!(read_manage_path(&file).unwrap().is_none());
    }

    #[test]
    fn test_read_manage_path_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(OVERRIDE_FILE_NAME);
        std::fs::write(&file, "this is = = not toml").unwrap();
        assert!(matches!(read_manage_path(&file), Err(Error::ConfigLoad(_))));
    }
}
