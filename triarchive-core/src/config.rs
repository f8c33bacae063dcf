//! Process-wide and per-folder configuration, read from JSON files
//! following the shape `examples/original_source/config.py` establishes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TriarchiveResult;
use crate::model::{ArchiveConfig, CloudOnlyRule, Folder};

/// Default regex the storage-tool RPC/GUI banner is matched against to
/// extract `{user, password, host, port, login_token}`.
pub const DEFAULT_GUI_URL_PATTERN: &str =
    r"http://(?P<user>\S+):(?P<password>\S+)@(?P<host>\S+):(?P<port>\d+)/\?.*login_token=(?P<login_token>\S+) ";

/// RPC endpoint and parameter table for a storage-tool subcommand routed
/// through the GUI/RPC mode rather than invoked as a CLI process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCommandSpec {
    pub endpoint: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageToolGuiConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub login_token: String,
    #[serde(default = "default_special_commands")]
    pub special_commands: std::collections::HashMap<String, RpcCommandSpec>,
    #[serde(default = "default_filter_params")]
    pub filter_params: Vec<String>,
    #[serde(default = "default_list_filter_params")]
    pub list_filter_params: Vec<String>,
    #[serde(default = "default_max_async_poll_interval")]
    pub max_async_poll_interval_secs: u64,
}

fn default_special_commands() -> std::collections::HashMap<String, RpcCommandSpec> {
    [
        (
            "copy",
            RpcCommandSpec {
                endpoint: "sync/copy".into(),
                params: vec!["srcFs".into(), "dstFs".into(), "createEmptySrcDirs".into()],
            },
        ),
        (
            "move",
            RpcCommandSpec {
                endpoint: "sync/move".into(),
                params: vec![
                    "srcFs".into(),
                    "dstFs".into(),
                    "createEmptySrcDirs".into(),
                    "deleteEmptySrcDirs".into(),
                ],
            },
        ),
        (
            "delete",
            RpcCommandSpec {
                endpoint: "operations/delete".into(),
                params: vec!["fs".into()],
            },
        ),
        (
            "purge",
            RpcCommandSpec {
                endpoint: "operations/purge".into(),
                params: vec!["fs".into(), "remote".into()],
            },
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_filter_params() -> Vec<String> {
    [
        "--delete-excluded",
        "--exclude-file",
        "--exclude-from",
        "--exclude-rule",
        "--files-from",
        "--files-from-raw",
        "--filter-from",
        "--filter-rule",
        "--ignore-case",
        "--include-from",
        "--include-rule",
        "--max-age",
        "--max-size",
        "--min-age",
        "--min-size",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_list_filter_params() -> Vec<String> {
    [
        "--exclude-file",
        "--exclude-from",
        "--exclude-rule",
        "--files-from",
        "--files-from-raw",
        "--filter-from",
        "--filter-rule",
        "--include-from",
        "--include-rule",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_async_poll_interval() -> u64 {
    60
}

/// Process-wide configuration: sync-daemon endpoint, retry budgets,
/// listener address, failure-rate ceilings, logging directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub api_key: String,
    pub message_listener_host: String,
    pub message_listener_port: u16,
    pub message_listener_auth_token: String,
    pub logging_folder: PathBuf,
    pub logging_file: PathBuf,
    pub last_event_file: PathBuf,
    pub folder_configs: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_syncthing_retry_count")]
    pub syncthing_retry_count: u32,
    #[serde(default = "default_syncthing_retry_delay_secs")]
    pub syncthing_retry_delay_secs: u64,
    #[serde(default = "default_failure_expiry_days")]
    pub failure_expiry_days: i64,
    #[serde(default = "default_max_failures_per_hour")]
    pub max_failures_per_hour: u32,
    #[serde(default = "default_max_failures_per_day")]
    pub max_failures_per_day: u32,
    /// Delay a crashed worker's main loop sleeps before restarting in
    /// place.
    #[serde(default = "default_worker_restart_delay_secs")]
    pub worker_restart_delay_secs: u64,
    #[serde(default)]
    pub default_hashsum: Option<String>,
    #[serde(default = "default_gui_url_pattern")]
    pub rclone_gui_url_pattern: String,
    #[serde(default)]
    pub storage_tool_gui: Option<StorageToolGuiConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_timezone() -> String {
    "Europe/Budapest".to_string()
}
fn default_syncthing_retry_count() -> u32 {
    10
}
fn default_syncthing_retry_delay_secs() -> u64 {
    120
}
fn default_failure_expiry_days() -> i64 {
    14
}
fn default_max_failures_per_hour() -> u32 {
    5
}
fn default_max_failures_per_day() -> u32 {
    20
}
fn default_worker_restart_delay_secs() -> u64 {
    5
}
fn default_gui_url_pattern() -> String {
    DEFAULT_GUI_URL_PATTERN.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl GlobalConfig {
    pub fn read_from_file(path: impl AsRef<Path>) -> TriarchiveResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// On-disk shape of a single folder's config file, deserialized and then
/// combined with `GlobalConfig` into a `Folder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfigFile {
    pub folder_id: String,
    pub local_folder: PathBuf,
    pub remote_folder: String,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub trash_folder: Option<PathBuf>,
    #[serde(default)]
    pub metadata_folder: Option<PathBuf>,
    #[serde(default)]
    pub archive_config: Option<ArchiveConfigFile>,
    #[serde(default)]
    pub cloud_only_defaults: Vec<CloudOnlyRuleFile>,
    #[serde(default = "default_keep_days")]
    pub trash_keep_days: u64,
    #[serde(default)]
    pub local_keep_days: Option<u64>,
    #[serde(default)]
    pub local_ignore_patterns: Option<Vec<String>>,
}

fn default_keep_days() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfigFile {
    pub archive_folder: String,
    #[serde(default)]
    pub mount_folder: Option<PathBuf>,
    #[serde(default)]
    pub archive_device: Option<String>,
}

/// On-disk shape of a CloudOnlyRule: a bare string is `(target, [])`; an
/// explicit pair gives both target and criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CloudOnlyRuleFile {
    TargetOnly(String),
    Pair(String, Vec<String>),
}

impl From<CloudOnlyRuleFile> for CloudOnlyRule {
    fn from(value: CloudOnlyRuleFile) -> Self {
        match value {
            CloudOnlyRuleFile::TargetOnly(target) => CloudOnlyRule::new(target, vec![]),
            CloudOnlyRuleFile::Pair(target, criteria) => CloudOnlyRule::new(target, criteria),
        }
    }
}

impl FolderConfigFile {
    pub fn read_from_file(path: impl AsRef<Path>) -> TriarchiveResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Build the runtime `Folder` this file describes, filling in the
    /// defaults (`.trash`/`.backupdata` under the local root) the original
    /// config loader applies.
    pub fn into_folder(self) -> Folder {
        let trash_root = self
            .trash_folder
            .unwrap_or_else(|| self.local_folder.join(".trash"));
        let metadata_root = self
            .metadata_folder
            .unwrap_or_else(|| self.local_folder.join(".backupdata"));

        Folder {
            folder_id: self.folder_id,
            local_root: self.local_folder,
            remote_root: self.remote_folder,
            trash_root,
            metadata_root,
            archive: self.archive_config.map(|a| ArchiveConfig {
                archive_root: a.archive_folder,
                mount_point: a.mount_folder,
                device_id: a.archive_device,
            }),
            trash_keep_duration: Some(std::time::Duration::from_secs(
                self.trash_keep_days * 24 * 3600,
            )),
            local_keep_duration: self
                .local_keep_days
                .map(|d| std::time::Duration::from_secs(d * 24 * 3600)),
            local_ignore_patterns: self
                .local_ignore_patterns
                .unwrap_or_else(Folder::default_local_ignores),
            cloud_only_rules: self.cloud_only_defaults.into_iter().map(Into::into).collect(),
            database_name: self.database_name,
        }
    }
}

/// Read every `*.json` file under `folder_configs_dir` into a `Folder`.
pub fn read_all_folders(folder_configs_dir: impl AsRef<Path>) -> TriarchiveResult<Vec<Folder>> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(folder_configs_dir)? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let file = FolderConfigFile::read_from_file(entry.path())?;
        folders.push(file.into_folder());
    }
    Ok(folders)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_only_rule_file_target_only_has_empty_criteria() {
        let rule: CloudOnlyRule = CloudOnlyRuleFile::TargetOnly("a/.*".into()).into();
        assert!(rule.criterion_patterns.is_empty());
    }

    #[test]
    fn folder_config_file_defaults_trash_and_metadata_under_local_root() {
        let file = FolderConfigFile {
            folder_id: "f1".into(),
            local_folder: PathBuf::from("/data/f1"),
            remote_folder: "remote:f1".into(),
            database_name: None,
            trash_folder: None,
            metadata_folder: None,
            archive_config: None,
            cloud_only_defaults: vec![],
            trash_keep_days: 60,
            local_keep_days: None,
            local_ignore_patterns: None,
        };
        let folder = file.into_folder();
        assert_eq!(folder.trash_root, PathBuf::from("/data/f1/.trash"));
        assert_eq!(folder.metadata_root, PathBuf::from("/data/f1/.backupdata"));
        assert_eq!(folder.database_file_name(), "f1-files.sqlite");
    }
}
