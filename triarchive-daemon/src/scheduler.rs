//! Scheduler: fires `TimedTask`s with max-delay and retry semantics.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use triarchive_core::model::{TimeDiff, TimeField, TimedTask};
use triarchive_core::TriarchiveResult;

/// A task's work, boxed so the scheduler can hold heterogeneous tasks
/// (folder-scoped wrappers and process-wide ones alike) behind one type.
pub type TaskRunner = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = TriarchiveResult<()>> + Send>> + Send + Sync>;

fn days_in_month(year: i32, month: u32) -> u32 {
    let next_month_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next_month_first
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn apply_fields(now: NaiveDateTime, task: &TimedTask) -> Option<NaiveDateTime> {
    let mut year = now.year();
    let mut month = now.month();
    let mut day = now.day();
    let mut hour = now.hour();
    let mut minute = now.minute();
    let mut second = now.second();

    for field in &task.time_fields {
        match field {
            TimeField::Month => month = task.time.month(),
            TimeField::Day => day = task.time.day(),
            TimeField::Hour => hour = task.time.hour(),
            TimeField::Minute => minute = task.time.minute(),
            TimeField::Second => second = task.time.second(),
        }
    }
    let day = day.min(days_in_month(year, month)).max(1);
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

fn advance(dt: NaiveDateTime, diff: TimeDiff) -> Option<NaiveDateTime> {
    match diff {
        TimeDiff::Days(n) => dt.checked_add_signed(chrono::Duration::days(n)),
        TimeDiff::Months(n) => {
            let total = dt.year() * 12 + dt.month() as i32 - 1 + n;
            let year = total.div_euclid(12);
            let month = (total.rem_euclid(12) + 1) as u32;
            let day = dt.day().min(days_in_month(year, month));
            NaiveDate::from_ymd_opt(year, month, day)?.and_time(dt.time())
        }
    }
}

/// The next instant ≥ `now` whose `timeFields` equal `task.time`'s
/// corresponding components, advancing by `task.time_diff` up to 10
/// times. `None` means the task couldn't be scheduled at all.
pub fn next_scheduled(task: &TimedTask, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let mut candidate = apply_fields(now, task)?;
    let mut attempts = 0;
    while candidate < now {
        if attempts >= 10 {
            warn!(task = %task.name, "could not reach a future scheduled time within 10 advances");
            return None;
        }
        candidate = advance(candidate, task.time_diff)?;
        attempts += 1;
    }
    Some(candidate)
}

/// What the scheduler does with a task whose `nextTime` has arrived,
/// decided as a pure function so the late-start/skip-if-running/
/// retry-budget branches (§4.13 steps 3-5) are unit-testable without a
/// real clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Outside the on-time window; reschedule by `retryTime`.
    TooLate,
    /// A previous invocation is still running and `skipIfRunning` is set.
    SkipRunningReset,
    /// A previous invocation is still running; reschedule by `retryTime`.
    SkipRunningRetry,
    /// Retry budget exhausted; the task is disabled.
    Disable,
    /// Spawn the task now.
    Run,
}

pub fn decide(
    now: NaiveDateTime,
    next_time: NaiveDateTime,
    max_delay: Duration,
    still_running: bool,
    skip_if_running: bool,
    retry_count: u32,
    max_retry_count: u32,
) -> Decision {
    let delay = now.signed_duration_since(next_time);
    let window = chrono::Duration::from_std(max_delay).unwrap_or_default();
    if delay < chrono::Duration::zero() || delay >= window {
        return Decision::TooLate;
    }
    if still_running {
        return if skip_if_running {
            Decision::SkipRunningReset
        } else {
            Decision::SkipRunningRetry
        };
    }
    if retry_count > max_retry_count {
        return Decision::Disable;
    }
    Decision::Run
}

struct TaskState {
    task: TimedTask,
    next_time: NaiveDateTime,
    retry_count: u32,
    running: Arc<AtomicBool>,
    last_failed: Arc<Mutex<bool>>,
}

pub struct Scheduler {
    tasks: Vec<TaskState>,
}

impl Scheduler {
    pub fn new(tasks: Vec<TimedTask>, now: NaiveDateTime) -> Self {
        let tasks = tasks
            .into_iter()
            .filter(|task| task.enabled)
            .filter_map(|task| {
                let next_time = next_scheduled(&task, now)?;
                Some(TaskState {
                    task,
                    next_time,
                    retry_count: 0,
                    running: Arc::new(AtomicBool::new(false)),
                    last_failed: Arc::new(Mutex::new(false)),
                })
            })
            .collect();
        Self { tasks }
    }

    /// Runs forever (until cancelled), firing each registered task's
    /// `TaskRunner` by name at its scheduled time.
    pub async fn run(&mut self, runners: HashMap<String, TaskRunner>, cancel: CancellationToken) {
        loop {
            if self.tasks.is_empty() {
                return;
            }
            let idx = self
                .tasks
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.next_time)
                .map(|(i, _)| i)
                .expect("non-empty");

            let target = self.tasks[idx].next_time;
            let now = Utc::now().naive_utc();
            if target > now {
                let wait = (target - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let now = Utc::now().naive_utc();
            let state = &mut self.tasks[idx];
            let still_running = state.running.load(Ordering::SeqCst);
            let decision = decide(
                now,
                state.next_time,
                state.task.max_delay,
                still_running,
                state.task.skip_if_running,
                state.retry_count,
                state.task.max_retry_count,
            );

            match decision {
                Decision::TooLate => {
                    state.next_time += chrono::Duration::from_std(state.task.retry_time).unwrap_or_default();
                    state.retry_count += 1;
                }
                Decision::SkipRunningReset => {
                    if let Some(next) = next_scheduled(&state.task, now) {
                        state.next_time = next;
                    }
                    state.retry_count = 0;
                }
                Decision::SkipRunningRetry => {
                    state.next_time += chrono::Duration::from_std(state.task.retry_time).unwrap_or_default();
                    state.retry_count += 1;
                }
                Decision::Disable => {
                    error!(task = %state.task.name, "exceeded retry budget, disabling task");
                    state.task.enabled = false;
                    self.tasks.remove(idx);
                }
                Decision::Run => {
                    let failed_last_time = *state.last_failed.lock().expect("mutex poisoned");
                    if failed_last_time {
                        state.retry_count += 1;
                    } else {
                        state.retry_count = 0;
                    }

                    let Some(runner) = runners.get(&state.task.name).cloned() else {
                        warn!(task = %state.task.name, "no runner registered for scheduled task");
                        if let Some(next) = next_scheduled(&state.task, now) {
                            state.next_time = next;
                        }
                        continue;
                    };

                    let running = state.running.clone();
                    let last_failed = state.last_failed.clone();
                    let name = state.task.name.clone();
                    running.store(true, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let result = runner().await;
                        *last_failed.lock().expect("mutex poisoned") = result.is_err();
                        if let Err(err) = result {
                            error!(task = %name, error = %err, "scheduled task failed");
                        } else {
                            info!(task = %name, "scheduled task completed");
                        }
                        running.store(false, Ordering::SeqCst);
                    });

                    if let Some(next) = next_scheduled(&state.task, now) {
                        state.next_time = next;
                    } else {
                        state.task.enabled = false;
                        self.tasks.remove(idx);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn daily_midnight_task() -> TimedTask {
        TimedTask {
            name: "daily".into(),
            time: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            time_fields: vec![TimeField::Hour, TimeField::Minute, TimeField::Second],
            time_diff: TimeDiff::Days(1),
            max_delay: StdDuration::from_secs(3600),
            retry_time: StdDuration::from_secs(3600),
            max_retry_count: 3,
            enabled: true,
            skip_if_running: false,
            for_all_folders: false,
        }
    }

    #[test]
    fn next_scheduled_picks_todays_time_when_still_ahead() {
        let task = daily_midnight_task();
        let now = NaiveDate::from_ymd_opt(2023, 5, 10).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let next = next_scheduled(&task, now).unwrap();
        assert_eq!(next, NaiveDate::from_ymd_opt(2023, 5, 11).unwrap().and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn next_scheduled_is_strictly_monotonic_across_repeated_advances() {
        let task = daily_midnight_task();
        let mut now = NaiveDate::from_ymd_opt(2023, 5, 10).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let mut prev = next_scheduled(&task, now).unwrap();
        for _ in 0..5 {
            now = prev;
            let next = next_scheduled(&task, now + chrono::Duration::seconds(1)).unwrap();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn monthly_task_advances_by_one_month_at_a_time() {
        let mut task = daily_midnight_task();
        task.time_diff = TimeDiff::Months(1);
        task.time_fields = vec![TimeField::Day, TimeField::Hour, TimeField::Minute, TimeField::Second];
        task.time = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let now = NaiveDate::from_ymd_opt(2023, 5, 15).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let next = next_scheduled(&task, now).unwrap();
        assert_eq!(next, NaiveDate::from_ymd_opt(2023, 6, 1).unwrap().and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn late_start_reschedules_by_retry_time_and_increments_retry_count() {
        // Scenario 6: base 00:00:00, maxDelay=1h, retryTime=1h, now=02:30.
        let base = NaiveDate::from_ymd_opt(2023, 1, 1);
        let next_time = base.unwrap().and_hms_opt(0, 0, 0).unwrap();
        let now = base.unwrap().and_hms_opt(2, 30, 0).unwrap();
        let decision = decide(now, next_time, StdDuration::from_secs(3600), false, false, 0, 5);
        assert_eq!(decision, Decision::TooLate);
    }

    #[test]
    fn on_time_arrival_within_window_runs() {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1);
        let next_time = base.unwrap().and_hms_opt(3, 0, 0).unwrap();
        let now = base.unwrap().and_hms_opt(3, 0, 10).unwrap();
        let decision = decide(now, next_time, StdDuration::from_secs(3600), false, false, 1, 5);
        assert_eq!(decision, Decision::Run);
    }

    #[test]
    fn still_running_with_skip_if_running_resets() {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1);
        let next_time = base.unwrap().and_hms_opt(1, 0, 0).unwrap();
        let now = base.unwrap().and_hms_opt(1, 0, 5).unwrap();
        let decision = decide(now, next_time, StdDuration::from_secs(3600), true, true, 0, 5);
        assert_eq!(decision, Decision::SkipRunningReset);
    }

    #[test]
    fn still_running_without_skip_if_running_retries() {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1);
        let next_time = base.unwrap().and_hms_opt(1, 0, 0).unwrap();
        let now = base.unwrap().and_hms_opt(1, 0, 5).unwrap();
        let decision = decide(now, next_time, StdDuration::from_secs(3600), true, false, 0, 5);
        assert_eq!(decision, Decision::SkipRunningRetry);
    }

    #[test]
    fn exceeded_retry_budget_disables() {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1);
        let next_time = base.unwrap().and_hms_opt(1, 0, 0).unwrap();
        let now = base.unwrap().and_hms_opt(1, 0, 5).unwrap();
        let decision = decide(now, next_time, StdDuration::from_secs(3600), false, false, 6, 5);
        assert_eq!(decision, Decision::Disable);
    }
}
