//! Default `TimedTask` table shipped by the program.

use std::time::Duration;

use chrono::NaiveDate;
use triarchive_core::model::{TimeDiff, TimeField, TimedTask};

fn midnight(hour: u32, minute: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

/// `archive`: monthly at 00:00, `forAllFolders`.
pub fn archive_task() -> TimedTask {
    TimedTask {
        name: "archive".into(),
        time: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
        time_fields: vec![TimeField::Day, TimeField::Hour, TimeField::Minute, TimeField::Second],
        time_diff: TimeDiff::Months(1),
        max_delay: Duration::from_secs(4 * 3600),
        retry_time: Duration::from_secs(24 * 3600),
        max_retry_count: 3,
        enabled: true,
        skip_if_running: false,
        for_all_folders: true,
    }
}

/// `check_processes`: daily at 01:00, `skipIfRunning`, not per-folder.
pub fn check_processes_task() -> TimedTask {
    TimedTask {
        name: "check_processes".into(),
        time: midnight(1, 0),
        time_fields: vec![TimeField::Hour, TimeField::Minute, TimeField::Second],
        time_diff: TimeDiff::Days(1),
        max_delay: Duration::from_secs(4 * 3600),
        retry_time: Duration::from_secs(3600),
        max_retry_count: 5,
        enabled: true,
        skip_if_running: true,
        for_all_folders: false,
    }
}

/// `sync_from_cloud`: daily at 23:00, `forAllFolders`.
pub fn sync_from_cloud_task() -> TimedTask {
    TimedTask {
        name: "sync_from_cloud".into(),
        time: midnight(23, 0),
        time_fields: vec![TimeField::Hour, TimeField::Minute, TimeField::Second],
        time_diff: TimeDiff::Days(1),
        max_delay: Duration::from_secs(2 * 3600),
        retry_time: Duration::from_secs(3600),
        max_retry_count: 5,
        enabled: true,
        skip_if_running: false,
        for_all_folders: true,
    }
}

/// `handle_trash`: monthly at 10:00, `forAllFolders`.
pub fn handle_trash_task() -> TimedTask {
    TimedTask {
        name: "handle_trash".into(),
        time: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap(),
        time_fields: vec![TimeField::Day, TimeField::Hour, TimeField::Minute, TimeField::Second],
        time_diff: TimeDiff::Months(1),
        max_delay: Duration::from_secs(24 * 3600),
        retry_time: Duration::from_secs(24 * 3600),
        max_retry_count: 3,
        enabled: true,
        skip_if_running: false,
        for_all_folders: true,
    }
}

pub fn default_tasks() -> Vec<TimedTask> {
    vec![archive_task(), check_processes_task(), sync_from_cloud_task(), handle_trash_task()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tasks_has_the_four_named_entries() {
        let names: Vec<&str> = default_tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["archive", "check_processes", "sync_from_cloud", "handle_trash"]);
    }

    #[test]
    fn only_check_processes_skips_when_running() {
        for task in default_tasks() {
            assert_eq!(task.skip_if_running, task.name == "check_processes");
        }
    }
}
