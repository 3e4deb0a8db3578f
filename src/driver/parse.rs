//! Parsing VeertuManage output.
//!
//! `--machine-readable` commands answer with a JSON envelope
//! `{"status": ..., "body": ...}`. The import dry-run only prints free
//! text, which is picked apart with regular expressions. Everything here
//! is pure so it can be tested against captured output.

use crate::error::{Error, Result};
use rand::Rng;
use regex::Regex;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

fn suggested_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"Suggested VM name "(.+?)""#).expect("valid regex"))
}

fn disk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+): Hard disk image: source image=.+, target path=(.+),")
            .expect("valid regex")
    })
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})%").expect("valid regex"))
}

/// A disk the import will create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTarget {
    /// Unit number within the virtual system.
    pub unit: String,
    /// Target path suggested by the tool.
    pub path: String,
}

/// What the import dry-run told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPlan {
    /// Name the tool would give the VM.
    pub suggested_name: String,
    /// Disks with their suggested target paths.
    pub disks: Vec<DiskTarget>,
}

/// Parse the output of `import -n <box>`.
///
/// # Errors
///
/// Returns [`Error::NoSuggestedName`] if the output has no suggested name.
pub fn parse_import_dry_run(output: &str) -> Result<ImportPlan> {
    let suggested_name = suggested_name_re()
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::NoSuggestedName {
            output: output.to_string(),
        })?;

    let disks = disk_re()
        .captures_iter(output)
        .map(|c| DiskTarget {
            unit: c[1].to_string(),
            path: c[2].to_string(),
        })
        .collect();

    Ok(ImportPlan {
        suggested_name,
        disks,
    })
}

/// Build a name unlikely to collide with a concurrent import of the same box.
///
/// Appends the current time in milliseconds and a random number below 100000.
pub fn unique_vm_name(suggested: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let salt: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("{}_{}_{}", suggested, millis, salt)
}

/// Replace the last `/<suggested>/` path segment with `/<specified>/`.
///
/// Earlier occurrences belong to shared parent directories and are kept.
pub fn rewrite_disk_path(path: &str, suggested: &str, specified: &str) -> String {
    let needle = format!("/{}/", suggested);
    match path.rfind(&needle) {
        Some(pos) => format!(
            "{}/{}/{}",
            &path[..pos],
            specified,
            &path[pos + needle.len()..]
        ),
        None => path.to_string(),
    }
}

/// Extract percentages from a chunk of progress output.
pub fn parse_progress(chunk: &str) -> Vec<u8> {
    percent_re()
        .captures_iter(chunk)
        .filter_map(|c| c[1].parse::<u8>().ok())
        .filter(|p| *p <= 100)
        .collect()
}

/// Percentages from streamed output whose chunks may split a token.
///
/// Trailing digits are held back until the next chunk shows whether they
/// end in `%`.
#[derive(Debug, Default)]
pub struct ProgressParser {
    pending: String,
}

impl ProgressParser {
    /// Feed the next chunk and return the percentages it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<u8> {
        self.pending.push_str(chunk);
        let complete = self
            .pending
            .trim_end_matches(|c: char| c.is_ascii_digit())
            .len();
        let found = parse_progress(&self.pending[..complete]);
        self.pending.drain(..complete);
        found
    }
}

/// The `{status, body}` envelope of a machine-readable response.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    /// Status word, "ok" on success.
    #[serde(default)]
    pub status: Option<String>,
    /// Response payload.
    #[serde(default = "Option::default")]
    pub body: Option<T>,
}

impl<T> Envelope<T> {
    /// Check the status word, ignoring case.
    pub fn is_ok(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("ok"))
            .unwrap_or(false)
    }
}

/// Parse a machine-readable response.
///
/// Some commands print progress before the JSON, so if the whole output
/// is not JSON the last line that looks like an object is tried.
pub fn parse_envelope<T: DeserializeOwned>(output: &str) -> Result<Envelope<T>> {
    let trimmed = output.trim();
    match serde_json::from_str(trimmed) {
        Ok(env) => Ok(env),
        Err(first) => {
            let last_object = trimmed
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| l.starts_with('{'));
            match last_object {
                Some(line) if line != trimmed => Ok(serde_json::from_str(line)?),
                _ => Err(Error::parse(format!("{}: {:?}", first, trimmed))),
            }
        }
    }
}

/// Body of `show <uuid>`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmInfo {
    /// VM identifier.
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    /// VM display name.
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    /// Status word, e.g. "running".
    #[serde(deserialize_with = "null_as_default")]
    pub status: String,
    /// Guest IP address.
    pub ip: Option<String>,
    /// Port forwarding rules. Rules that do not decode are skipped.
    #[serde(deserialize_with = "readable_rules")]
    pub port_forwarding: Vec<PortForwardingRecord>,
}

/// A port forwarding rule as `show` reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortForwardingRecord {
    /// Rule name.
    pub name: String,
    /// Host port.
    #[serde(deserialize_with = "port_number")]
    pub host_port: u16,
    /// Guest port.
    #[serde(deserialize_with = "port_number")]
    pub guest_port: u16,
    /// Protocol, if reported.
    pub protocol: Option<String>,
    /// Host address, if reported.
    pub host_ip: Option<String>,
    /// Guest address, if reported.
    pub guest_ip: Option<String>,
}

/// An entry of `list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmSummary {
    /// VM identifier.
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    /// VM display name.
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
}

/// Body of `describe <uuid>`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmDescription {
    /// Hardware section.
    pub hardware: Hardware,
}

/// Hardware section of a VM description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Hardware {
    /// Network cards; the tool emits a bare object when there is one.
    #[serde(rename = "network cards")]
    pub network_cards: Option<OneOrMany<NetworkCard>>,
}

impl VmDescription {
    /// Network cards as a list, whatever shape the tool used.
    pub fn network_cards(self) -> Vec<NetworkCard> {
        self.hardware
            .network_cards
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
    }
}

/// A network card in a VM description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkCard {
    /// Card index, passed back to `modify ... --network`.
    #[serde(rename = "card index", deserialize_with = "string_or_number")]
    pub card_index: String,
    /// Connection type ("host", "shared", "disconnected").
    pub connection: Option<String>,
    /// MAC address.
    #[serde(rename = "mac address")]
    pub mac_address: Option<String>,
}

/// A value the tool sometimes emits alone and sometimes as a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A list.
    Many(Vec<T>),
    /// A single value.
    One(T),
}

impl<T> OneOrMany<T> {
    /// Normalize to a list.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Number(u64),
    String(String),
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match StringOrNumber::deserialize(d)? {
        StringOrNumber::Number(n) => n.to_string(),
        StringOrNumber::String(s) => s,
    })
}

fn port_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u16, D::Error> {
    let raw = string_or_number(d)?;
    raw.trim()
        .parse::<u16>()
        .map_err(|_| de::Error::custom(format!("invalid port: {:?}", raw)))
}

fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn readable_rules<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Vec<PortForwardingRecord>, D::Error> {
    let raw = Option::<Vec<serde_json::Value>>::deserialize(d)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|rule| match serde_json::from_value(rule) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable port forwarding rule");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRY_RUN: &str = "\
Interpreting /boxes/ubuntu.box...
OK.
Disks:
  vmdisk1  41943040000  -1  http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized  disk.vmdk  -1  -1
Virtual system 0:
 0: Suggested OS type: \"Ubuntu_64\"
 1: Suggested VM name \"ubuntu_base\"
 2: Number of CPUs: 1
11: Hard disk image: source image=disk.vmdk, target path=/Users/me/VMs/ubuntu_base/disk.vmdk, controller=7;channel=0
12: Hard disk image: source image=data.vmdk, target path=/Users/me/VMs/ubuntu_base/data.vmdk, controller=7;channel=1
";

    #[test]
    fn test_parse_import_dry_run() {
        let plan = parse_import_dry_run(DRY_RUN).unwrap();
        assert_eq!(plan.suggested_name, "ubuntu_base");
        assert_eq!(
            plan.disks,
            vec![
                DiskTarget {
                    unit: "11".to_string(),
                    path: "/Users/me/VMs/ubuntu_base/disk.vmdk".to_string(),
                },
                DiskTarget {
                    unit: "12".to_string(),
                    path: "/Users/me/VMs/ubuntu_base/data.vmdk".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_dry_run_without_name_is_an_error() {
        let err = parse_import_dry_run("Interpreting box...\nOK.\n").unwrap_err();
        match err {
            Error::NoSuggestedName { output } => assert!(output.contains("Interpreting")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_dry_run_without_disks() {
        let plan = parse_import_dry_run("Suggested VM name \"tiny\"\n").unwrap();
        assert_eq!(plan.suggested_name, "tiny");
        assert!(plan.disks.is_empty());
    }

    #[test]
    fn test_unique_vm_name_extends_suggested() {
        let name = unique_vm_name("base");
        let re = Regex::new(r"^base_\d+_\d{1,5}$").unwrap();
        assert!(re.is_match(&name), "unexpected name {}", name);
    }

    #[test]
    fn test_unique_vm_names_differ() {
        let names: std::collections::HashSet<_> =
            (0..50).map(|_| unique_vm_name("base")).collect();
        assert!(names.len() > 1, "generated names should not all collide");
    }

    #[test]
    fn test_rewrite_disk_path_replaces_last_segment_only() {
        let path = "/vms/base/base/disk.vmdk";
        assert_eq!(
            rewrite_disk_path(path, "base", "base_1_2"),
            "/vms/base/base_1_2/disk.vmdk"
        );
    }

    #[test]
    fn test_rewrite_disk_path_without_match_is_unchanged() {
        assert_eq!(
            rewrite_disk_path("/vms/other/disk.vmdk", "base", "base_1"),
            "/vms/other/disk.vmdk"
        );
        // Partial segment names are not rewritten.
        assert_eq!(
            rewrite_disk_path("/vms/database/disk.vmdk", "base", "base_1"),
            "/vms/database/disk.vmdk"
        );
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("0%...10%...20%"), vec![0, 10, 20]);
        assert_eq!(parse_progress("100%\n"), vec![100]);
        assert!(parse_progress("no numbers here").is_empty());
        assert!(parse_progress("250%").is_empty());
    }

    #[test]
    fn test_progress_split_across_chunks() {
        let mut parser = ProgressParser::default();
        assert!(parser.feed("4").is_empty());
        assert_eq!(parser.feed("0%"), vec![40]);
        assert_eq!(parser.feed("...5"), Vec::<u8>::new());
        assert_eq!(parser.feed("5%...1"), vec![55]);
        assert_eq!(parser.feed("00%\n"), vec![100]);
    }

    #[test]
    fn test_vm_info_tolerates_nulls_and_bad_rules() {
        let info: VmInfo = serde_json::from_value(serde_json::json!({
            "id": "vm-1",
            "name": null,
            "status": "running",
            "port_forwarding": [
                {"name": "broken", "host_port": "", "guest_port": "22"},
                {"name": "ssh", "host_port": "2222", "guest_port": 22}
            ]
        }))
        .unwrap();
        assert_eq!(info.name, "");
        assert_eq!(info.port_forwarding.len(), 1);
        assert_eq!(info.port_forwarding[0].host_port, 2222);

        let info: VmInfo = serde_json::from_value(serde_json::json!({
            "id": "vm-1",
            "status": "stopped",
            "port_forwarding": null
        }))
        .unwrap();
        assert!(info.port_forwarding.is_empty());
    }

    #[test]
    fn test_parse_envelope_status() {
        let env: Envelope<serde_json::Value> =
            parse_envelope(r#"{"status":"OK","body":{}}"#).unwrap();
        assert!(env.is_ok());

        let env: Envelope<serde_json::Value> =
            parse_envelope(r#"{"status":"error","body":null}"#).unwrap();
        assert!(!env.is_ok());
        assert!(env.body.is_none());
    }

    #[test]
    fn test_parse_envelope_after_progress_text() {
        let output = "0%...50%...100%\n{\"status\": \"ok\"}\n";
        let env: Envelope<serde_json::Value> = parse_envelope(output).unwrap();
        assert!(env.is_ok());
    }

    #[test]
    fn test_parse_envelope_rejects_garbage() {
        let err = parse_envelope::<serde_json::Value>("VeertuManage: error").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_vm_info_with_string_and_numeric_ports() {
        let json = r#"{
            "id": "abc",
            "name": "web",
            "status": "running",
            "ip": "10.0.0.5",
            "port_forwarding": [
                {"name": "ssh", "host_port": "2222", "guest_port": "22"},
                {"name": "http", "host_port": 8080, "guest_port": 80, "protocol": "tcp"}
            ]
        }"#;
        let info: VmInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.status, "running");
        assert_eq!(info.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(info.port_forwarding.len(), 2);
        assert_eq!(info.port_forwarding[0].host_port, 2222);
        assert_eq!(info.port_forwarding[1].guest_port, 80);
    }

    #[test]
    fn test_vm_info_without_rules() {
        let info: VmInfo = serde_json::from_str(r#"{"id": "abc", "status": "stopped"}"#).unwrap();
        assert!(info.port_forwarding.is_empty());
    }

    #[test]
    fn test_describe_single_card_is_normalized() {
        let json = r#"{"hardware": {"network cards": {"card index": 0, "connection": "host", "mac address": "aa:bb"}}}"#;
        let desc: VmDescription = serde_json::from_str(json).unwrap();
        let cards = desc.network_cards();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].card_index, "0");
        assert_eq!(cards[0].mac_address.as_deref(), Some("aa:bb"));
    }

    #[test]
    fn test_describe_card_list_and_missing_cards() {
        let json = r#"{"hardware": {"network cards": [
            {"card index": "0", "connection": "host"},
            {"card index": "1", "connection": "shared"}
        ]}}"#;
        let desc: VmDescription = serde_json::from_str(json).unwrap();
        assert_eq!(desc.network_cards().len(), 2);

        let empty: VmDescription = serde_json::from_str("{}").unwrap();
        assert!(empty.network_cards().is_empty());
    }
}
