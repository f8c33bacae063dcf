//! Sample config/model builders shared across crate test suites.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use triarchive_core::config::GlobalConfig;
use triarchive_core::model::{CloudOnlyRule, FileIndexRow};

/// A `GlobalConfig` with every required field populated with harmless
/// defaults, so tests only need to override what they care about.
pub fn sample_global_config() -> GlobalConfig {
    GlobalConfig {
        api_key: "test-api-key".into(),
        message_listener_host: "127.0.0.1".into(),
        message_listener_port: 0,
        message_listener_auth_token: "test-secret".into(),
        logging_folder: PathBuf::from("/tmp/triarchive-test-logs"),
        logging_file: PathBuf::from("triarchive.log"),
        last_event_file: PathBuf::from("/tmp/triarchive-test-last-event"),
        folder_configs: PathBuf::from("/tmp/triarchive-test-folders"),
        timezone: "Europe/Budapest".into(),
        syncthing_retry_count: 3,
        syncthing_retry_delay_secs: 0,
        failure_expiry_days: 14,
        max_failures_per_hour: 5,
        max_failures_per_day: 20,
        worker_restart_delay_secs: 0,
        default_hashsum: Some("sha256".into()),
        rclone_gui_url_pattern: triarchive_core::config::DEFAULT_GUI_URL_PATTERN.to_string(),
        storage_tool_gui: None,
        log_level: "warn".into(),
    }
}

pub fn sample_file_row(path: &str, at: DateTime<Utc>, size: i64) -> FileIndexRow {
    FileIndexRow {
        path: path.to_string(),
        hash: Some(format!("hash-of-{path}")),
        mod_time: Some(at),
        size: Some(size),
        uploaded_time: Some(at),
        cloud_only: false,
    }
}

/// The cloud-only rule used throughout the spec's worked examples:
/// yearly photo folders whose `.xmp` sidecar is already known.
pub fn sample_cloud_only_rule() -> CloudOnlyRule {
    CloudOnlyRule::new(
        r"photos/(?P<y>\d{4})/.*\.jpg",
        vec![r"photos/{y}/.*\.xmp".to_string()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_global_config_round_trips_through_json() {
        let config = sample_global_config();
        let text = serde_json::to_string(&config).unwrap();
        let back: GlobalConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.api_key, config.api_key);
    }
}
