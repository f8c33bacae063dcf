//! The data model shared across every triarchive component: folders, file
//! index rows, cloud-only rules, timed tasks and the supervisor's failure
//! window.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A named unit of synchronization: one local root, one remote root,
/// optionally one archive root.
#[derive(Debug, Clone)]
pub struct Folder {
    pub folder_id: String,
    pub local_root: std::path::PathBuf,
    pub remote_root: String,
    pub trash_root: std::path::PathBuf,
    pub metadata_root: std::path::PathBuf,
    pub archive: Option<ArchiveConfig>,
    pub trash_keep_duration: Option<Duration>,
    pub local_keep_duration: Option<Duration>,
    pub local_ignore_patterns: Vec<String>,
    pub cloud_only_rules: Vec<CloudOnlyRule>,
    pub database_name: Option<String>,
}

impl Folder {
    /// Default ignore patterns carried over unless a folder overrides them.
    pub fn default_local_ignores() -> Vec<String> {
        vec![
            ".stfolder".into(),
            ".stignore".into(),
            ".stversions".into(),
            ".trash".into(),
            ".backupdata".into(),
        ]
    }

    /// Paths the sync daemon itself should never replicate: the trash and
    /// metadata directories underneath this folder's local root.
    pub fn default_daemon_ignores(&self) -> Vec<String> {
        vec![
            format!("/{}", file_name(&self.trash_root)),
            format!("/{}", file_name(&self.metadata_root)),
        ]
    }

    /// The sqlite file name this folder's index lives in:
    /// `<folderId>-<name>.sqlite`.
    pub fn database_file_name(&self) -> String {
        let name = self.database_name.as_deref().unwrap_or("files");
        format!("{}-{}.sqlite", self.folder_id, name)
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub archive_root: String,
    pub mount_point: Option<std::path::PathBuf>,
    pub device_id: Option<String>,
}

/// A single row of a folder's FileIndex. `None` represents an absent
/// value for every optional field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileIndexRow {
    pub path: String,
    pub hash: Option<String>,
    pub mod_time: Option<DateTime<Utc>>,
    pub size: Option<i64>,
    pub uploaded_time: Option<DateTime<Utc>>,
    pub cloud_only: bool,
}

impl FileIndexRow {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Invariant 2: a cloudOnly row must carry an uploadedTime.
    pub fn upholds_cloud_only_invariant(&self) -> bool {
        !self.cloud_only || self.uploaded_time.is_some()
    }

    /// Invariant 3's soft-delete shape: bytes fields cleared, row retained.
    pub fn clear_bytes(&mut self) {
        self.hash = None;
        self.mod_time = None;
        self.size = None;
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.hash.is_none() && self.mod_time.is_none() && self.size.is_none()
    }
}

/// A `(targetPattern, criterionPatterns)` pair: a newly downloaded file
/// becomes cloud-only if its path matches `target` and either `criteria`
/// is empty or one criterion, after named-capture substitution, matches a
/// known or co-downloaded path.
#[derive(Debug, Clone)]
pub struct CloudOnlyRule {
    pub target_pattern: String,
    pub criterion_patterns: Vec<String>,
}

impl CloudOnlyRule {
    pub fn new(target_pattern: impl Into<String>, criterion_patterns: Vec<String>) -> Self {
        Self {
            target_pattern: target_pattern.into(),
            criterion_patterns,
        }
    }

    /// Evaluate this rule against `path`, consulting `known_paths` (already
    /// indexed or co-downloaded in the same batch) for criterion matches.
    pub fn matches(&self, path: &str, known_paths: &[&str]) -> Result<bool, regex::Error> {
        let target = Regex::new(&self.target_pattern)?;
        let captures = match target.captures(path) {
            Some(c) => c,
            None => return Ok(false),
        };

        if self.criterion_patterns.is_empty() {
            return Ok(true);
        }

        for template in &self.criterion_patterns {
            let substituted = substitute_named_captures(template, &captures, &target);
            let criterion = Regex::new(&substituted)?;
            if known_paths.iter().any(|p| criterion.is_match(p)) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn substitute_named_captures(template: &str, captures: &regex::Captures, re: &Regex) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '{' {
            if let Some(end) = template[i..].find('}') {
                let name = &template[i + 1..i + end];
                if re.capture_names().flatten().any(|n| n == name) {
                    if let Some(m) = captures.name(name) {
                        out.push_str(m.as_str());
                    }
                    for _ in 0..end {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Base time-of-day plus advancement rule for the scheduler, and the
/// live retry state tracked while the program runs.
#[derive(Debug, Clone)]
pub struct TimedTask {
    pub name: String,
    /// Reference instant; only the components named in `time_fields`
    /// (e.g. day-of-month + hour + minute + second for a monthly task)
    /// are meaningful.
    pub time: chrono::NaiveDateTime,
    pub time_fields: Vec<TimeField>,
    pub time_diff: TimeDiff,
    pub max_delay: Duration,
    pub retry_time: Duration,
    pub max_retry_count: u32,
    pub enabled: bool,
    pub skip_if_running: bool,
    pub for_all_folders: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

#[derive(Debug, Clone, Copy)]
pub enum TimeDiff {
    Months(i32),
    Days(i64),
}

/// An ordered list of recent failure timestamps, used by the supervisor's
/// rate limiter (P8: window never holds an entry older than its expiry).
#[derive(Debug, Clone, Default)]
pub struct FailureWindow {
    expiry: Option<Duration>,
    failures: VecDeque<DateTime<Utc>>,
}

impl FailureWindow {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry: Some(expiry),
            failures: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.failures.push_back(at);
        self.evict_before(at);
    }

    /// Number of failures currently inside the window, as of `now`.
    pub fn count(&mut self, now: DateTime<Utc>) -> usize {
        self.evict_before(now);
        self.failures.len()
    }

    fn evict_before(&mut self, now: DateTime<Utc>) {
        let Some(expiry) = self.expiry else {
            return;
        };
        let cutoff = now - chrono::Duration::from_std(expiry).unwrap_or_default();
        while let Some(front) = self.failures.front() {
            if *front < cutoff {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_only_rule_matches_with_named_capture_substitution() {
        let rule = CloudOnlyRule::new(
            r"photos/(?P<y>\d{4})/.*\.jpg",
            vec![r"photos/{y}/.*\.xmp".to_string()],
        );
        let known = vec!["photos/2022/a.xmp"];
        assert!(rule.matches("photos/2022/a.jpg", &known).unwrap());
        assert!(!rule
            .matches("photos/2022/a.jpg", &["photos/2023/a.xmp"])
            .unwrap());
    }

    #[test]
    fn cloud_only_rule_with_no_criteria_matches_on_target_alone() {
        let rule = CloudOnlyRule::new(r"^archive/.*", vec![]);
        assert!(rule.matches("archive/old.bin", &[]).unwrap());
    }

    #[test]
    fn file_index_row_clear_bytes_preserves_cloud_only_and_uploaded() {
        let mut row = FileIndexRow::new("a/b.txt");
        row.hash = Some("abc".into());
        row.size = Some(100);
        row.uploaded_time = Some(Utc::now());
        row.clear_bytes();
        assert!(row.is_soft_deleted());
        assert!(row.uploaded_time.is_some());
    }

    #[test]
    fn failure_window_evicts_entries_older_than_expiry() {
        let mut window = FailureWindow::new(Duration::from_secs(3600));
        let base = Utc::now();
        window.record(base - chrono::Duration::hours(2));
        window.record(base - chrono::Duration::minutes(10));
        assert_eq!(window.count(base), 1);
    }
}
