//! Supervisor: brings up every worker, restarts failed ones via a
//! per-worker failure window, watches a process-wide hourly/daily
//! failure ceiling across all workers, and answers control-socket
//! requests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use triarchive_core::config::GlobalConfig;
use triarchive_core::model::{FailureWindow, Folder};
use triarchive_core::{TriarchiveError, TriarchiveResult};
use triarchive_herald::archiver::{archive, OsDeviceMounter};
use triarchive_herald::events::ListenerEvent;
use triarchive_herald::folder_uploader::FolderUploader;
use triarchive_herald::global_uploader::GlobalUploader;
use triarchive_herald::listener::ChangeListener;
use triarchive_herald::queue::{GlobalUploadMessage, UploadAction};
use triarchive_herald::reconciler::sync_from_cloud;
use triarchive_herald::trash_purger::handle_trash;
use triarchive_herald::upload_syncer::UploadSyncer;
use triarchive_storage::index::{FileIndex, SqliteFileIndex};
use triarchive_tools::storage_tool::StorageTool;
use triarchive_tools::sync_daemon::SyncDaemonClient;
use triarchive_utils::retry::{retry_on_error, RetryOnErrorOptions};

use crate::control::{Command, ControlRequest, GetTarget, RunTarget};
use crate::scheduler::{Scheduler, TaskRunner};
use crate::tasks::default_tasks;

type BoxFuture = Pin<Box<dyn Future<Output = TriarchiveResult<()>> + Send>>;

/// One folder's index and upload-queue handle, built for every known
/// folder at startup. `upload_rx` is taken once, by `run`, when the
/// folder's uploader is spawned; `upload_tx` stays cloneable so
/// scheduled passes (`sync_from_cloud`, `run` control commands) can
/// enqueue onto the same queue the change-driven path uses.
struct FolderRuntime {
    folder: Folder,
    index: Arc<dyn FileIndex>,
    upload_tx: mpsc::Sender<(Vec<String>, UploadAction)>,
    upload_rx: parking_lot::Mutex<Option<mpsc::Receiver<(Vec<String>, UploadAction)>>>,
}

/// Restarts a worker's `run` method whenever it returns `Err`, sleeping
/// `retry_delay` between restarts and tracking failures in a window
/// scoped to just this worker; gives up once that window's budget is
/// exceeded, leaving the worker down until a manual `restart` control
/// command. `on_failure` additionally feeds every failure into the
/// process-wide failure-rate ceiling, independent of this worker's own
/// budget.
async fn run_supervised<W, F, Fut>(
    name: String,
    mut worker: W,
    mut call: F,
    opts: RetryOnErrorOptions,
    cancel: CancellationToken,
    mut on_failure: impl FnMut() + Send,
) where
    F: FnMut(&mut W, CancellationToken) -> Fut,
    Fut: Future<Output = TriarchiveResult<()>>,
{
    let name_for_attempt = name.clone();
    let result = retry_on_error(
        || {
            let worker_cancel = cancel.clone();
            let fut = call(&mut worker, worker_cancel.clone());
            async move {
                tokio::select! {
                    _ = worker_cancel.cancelled() => Ok(()),
                    result = fut => result,
                }
            }
        },
        opts,
        move |err| {
            error!(worker = %name_for_attempt, error = %err, "worker failed, restarting after delay");
            on_failure();
        },
    )
    .await;
    if let Err(err) = result {
        error!(worker = %name, error = %err, "worker exceeded its failure budget, giving up until manually restarted");
    }
}

pub struct Supervisor {
    config: GlobalConfig,
    folders: Vec<FolderRuntime>,
    storage: Arc<StorageTool>,
    sync_client: Arc<SyncDaemonClient>,
    cancel: CancellationToken,
    /// Process-wide (hourly, daily) failure counters fed by every
    /// supervised worker's `on_failure` hook. Exceeding either ceiling
    /// ends the process rather than just the offending worker, since a
    /// failure rate this high suggests something environmental
    /// (network, disk, sync-daemon outage) rather than one bad worker.
    process_failures: parking_lot::Mutex<(FailureWindow, FailureWindow)>,
}

impl Supervisor {
    pub fn new(
        config: GlobalConfig,
        folders: Vec<Folder>,
        storage: Arc<StorageTool>,
        sync_client: Arc<SyncDaemonClient>,
        cancel: CancellationToken,
    ) -> TriarchiveResult<Self> {
        let mut runtimes = Vec::with_capacity(folders.len());
        for folder in folders {
            std::fs::create_dir_all(&folder.metadata_root)?;
            let db_path = folder.metadata_root.join(folder.database_file_name());
            let index: Arc<dyn FileIndex> = Arc::new(SqliteFileIndex::open(db_path)?);
            let (upload_tx, upload_rx) = mpsc::channel::<(Vec<String>, UploadAction)>(1000);
            runtimes.push(FolderRuntime {
                folder,
                index,
                upload_tx,
                upload_rx: parking_lot::Mutex::new(Some(upload_rx)),
            });
        }
        let process_failures = parking_lot::Mutex::new((
            FailureWindow::new(Duration::from_secs(3600)),
            FailureWindow::new(Duration::from_secs(24 * 3600)),
        ));
        Ok(Self {
            config,
            folders: runtimes,
            storage,
            sync_client,
            cancel,
            process_failures,
        })
    }

    fn folder(&self, folder_id: &str) -> Option<&FolderRuntime> {
        self.folders.iter().find(|f| f.folder.folder_id == folder_id)
    }

    /// Per-worker restart budget: a worker that keeps failing within
    /// `failure_expiry_days` more than `max_failures_per_day` times is
    /// left down, sleeping `worker_restart_delay_secs` between tries.
    fn worker_retry_options(&self) -> RetryOnErrorOptions {
        RetryOnErrorOptions {
            max_retry_count: self.config.max_failures_per_day,
            retry_expiry: Duration::from_secs((self.config.failure_expiry_days.max(0) as u64) * 24 * 3600),
            retry_delay: Duration::from_secs(self.config.worker_restart_delay_secs),
            error_message: "worker loop failed".into(),
        }
    }

    /// Records one worker failure against both the hourly and daily
    /// process-wide windows. If either ceiling configured is exceeded,
    /// logs fatally and exits the process rather than continuing to
    /// limp along restarting workers into the same environment.
    fn record_process_failure(&self) {
        let now = Utc::now();
        let (hourly_exceeded, daily_exceeded) = {
            let mut windows = self.process_failures.lock();
            windows.0.record(now);
            windows.1.record(now);
            (
                windows.0.count(now) as u32 > self.config.max_failures_per_hour,
                windows.1.count(now) as u32 > self.config.max_failures_per_day,
            )
        };
        if hourly_exceeded || daily_exceeded {
            error!(
                hourly_exceeded,
                daily_exceeded,
                "too many worker failures registered across the process, exiting"
            );
            std::process::exit(1);
        }
    }

    /// Runs until cancelled. Brings workers up in dependency order:
    /// global uploader, then each folder's uploader/syncer/queue, then
    /// the change listener, then the scheduler, then (by the caller, via
    /// `control_rx`) the control socket's requests.
    pub async fn run(self: Arc<Self>, control_rx: mpsc::Receiver<ControlRequest>) -> TriarchiveResult<()> {
        let (global_tx, global_rx) = mpsc::channel::<GlobalUploadMessage>(1000);
        let global_uploader = GlobalUploader::new(self.storage.clone(), global_rx);
        {
            let this = self.clone();
            tokio::spawn(run_supervised(
                "global_uploader".into(),
                global_uploader,
                |w, cancel| w.run(cancel),
                self.worker_retry_options(),
                self.cancel.clone(),
                move || this.record_process_failure(),
            ));
        }

        let mut listener = ChangeListener::new(self.sync_client.clone(), self.config.last_event_file.clone());

        for runtime in &self.folders {
            let upload_rx = runtime
                .upload_rx
                .lock()
                .take()
                .expect("folder uploader queue already taken");
            let folder_uploader = FolderUploader::new(
                runtime.folder.clone(),
                runtime.index.clone(),
                self.storage.clone(),
                upload_rx,
                global_tx.clone(),
            );
            {
                let this = self.clone();
                tokio::spawn(run_supervised(
                    format!("folder_uploader[{}]", runtime.folder.folder_id),
                    folder_uploader,
                    |w, cancel| w.run(cancel),
                    self.worker_retry_options(),
                    self.cancel.clone(),
                    move || this.record_process_failure(),
                ));
            }

            let (batch_tx, mut batch_rx) = mpsc::channel::<Arc<Vec<ListenerEvent>>>(1000);
            listener.register(batch_tx);

            let syncer = UploadSyncer::new(
                runtime.folder.clone(),
                runtime.index.clone(),
                self.storage.clone(),
                self.sync_client.clone(),
                runtime.upload_tx.clone(),
            );
            let syncer_cancel = self.cancel.clone();
            let worker_name = format!("upload_syncer[{}]", runtime.folder.folder_id);
            tokio::spawn(async move {
                loop {
                    let batch = tokio::select! {
                        _ = syncer_cancel.cancelled() => return,
                        batch = batch_rx.recv() => batch,
                    };
                    let Some(batch) = batch else {
                        return;
                    };
                    if let Err(err) = syncer.handle_batch(&batch).await {
                        warn!(worker = %worker_name, error = %err, "upload syncer batch failed");
                    }
                }
            });
        }

        {
            let this = self.clone();
            tokio::spawn(run_supervised(
                "change_listener".into(),
                listener,
                |w, cancel| w.run(cancel),
                self.worker_retry_options(),
                self.cancel.clone(),
                move || this.record_process_failure(),
            ));
        }

        let runners = self.clone().build_task_runners();
        let scheduler_tasks = default_tasks();
        let now = Utc::now().naive_utc();
        let mut scheduler = Scheduler::new(scheduler_tasks, now);
        let scheduler_cancel = self.cancel.clone();
        tokio::spawn(async move {
            scheduler.run(runners, scheduler_cancel).await;
        });

        self.handle_control_requests(control_rx).await;
        Ok(())
    }

    /// Builds the named-task-runner table the scheduler (and `run`
    /// control commands) dispatch through, wrapping `forAllFolders`
    /// tasks so the scheduler itself stays folder-agnostic.
    fn build_task_runners(self: Arc<Self>) -> HashMap<String, TaskRunner> {
        let mut runners: HashMap<String, TaskRunner> = HashMap::new();

        let this = self.clone();
        runners.insert(
            "archive".into(),
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move { this.run_archive_for_all_folders(None).await }) as BoxFuture
            }),
        );

        let this = self.clone();
        runners.insert(
            "sync_from_cloud".into(),
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move { this.run_sync_from_cloud_for_all_folders().await }) as BoxFuture
            }),
        );

        let this = self.clone();
        runners.insert(
            "handle_trash".into(),
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move { this.run_handle_trash_for_all_folders().await }) as BoxFuture
            }),
        );

        let this = self.clone();
        runners.insert(
            "check_processes".into(),
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move { this.run_check_processes().await }) as BoxFuture
            }),
        );

        runners
    }

    async fn run_archive_for_all_folders(&self, free_up_needed: Option<u64>) -> TriarchiveResult<()> {
        let mounter = OsDeviceMounter;
        for runtime in &self.folders {
            archive(
                &runtime.folder,
                runtime.index.as_ref(),
                &self.storage,
                &self.sync_client,
                &mounter,
                free_up_needed.unwrap_or(0),
            )
            .await?;
        }
        Ok(())
    }

    async fn run_sync_from_cloud_for_all_folders(&self) -> TriarchiveResult<()> {
        for runtime in &self.folders {
            let outcome = sync_from_cloud(
                &runtime.folder,
                runtime.index.as_ref(),
                &self.storage,
                &self.sync_client,
                &runtime.upload_tx,
            )
            .await?;
            info!(
                folder_id = %runtime.folder.folder_id,
                downloaded = outcome.downloaded.len(),
                uploaded = outcome.uploaded.len(),
                "sync_from_cloud completed"
            );
        }
        Ok(())
    }

    async fn run_handle_trash_for_all_folders(&self) -> TriarchiveResult<()> {
        for runtime in &self.folders {
            handle_trash(&runtime.folder, &self.storage).await?;
        }
        Ok(())
    }

    /// `check_processes`: a lightweight watchdog confirming the sync
    /// daemon is still reachable; restarting a worker whose own task
    /// exited is already handled continuously by `run_supervised`.
    async fn run_check_processes(&self) -> TriarchiveResult<()> {
        match self.sync_client.get("db/ignores", &[("folder", "".to_string())], &[400, 404]).await {
            Ok(_) => info!("check_processes: sync daemon reachable"),
            Err(err) => warn!(error = %err, "check_processes: sync daemon unreachable"),
        }
        Ok(())
    }

    async fn handle_control_requests(&self, mut control_rx: mpsc::Receiver<ControlRequest>) {
        while let Some(request) = control_rx.recv().await {
            let response = self.dispatch(request.command).await;
            let _ = request.reply.send(response);
        }
    }

    async fn dispatch(&self, command: Command) -> Value {
        match command {
            Command::Help => json!({
                "verbs": ["help", "get", "start", "stop", "restart", "run"],
                "get_targets": ["config", "folders", "uploader", "rclone_gui_config", "<workerName>"],
                "run_targets": ["check_processes", "archive <folderId> [freeupBytes]", "update_all_files <folderId>", "download_only <folderId>", "upload_only <folderId>", "<namedTask>"],
            }),
            Command::Get(target) => self.dispatch_get(target),
            Command::Start(name) | Command::Restart(name) => {
                json!({"note": format!("{name} is supervised and self-restarts; manual start/restart is not yet wired to an external process table")})
            }
            Command::Stop(name) => {
                json!({"note": format!("stopping individual worker {name} requires a future process-table extension")})
            }
            Command::Run(target) => self.dispatch_run(target).await,
        }
    }

    fn dispatch_get(&self, target: GetTarget) -> Value {
        match target {
            GetTarget::Config => json!({
                "message_listener_host": self.config.message_listener_host,
                "message_listener_port": self.config.message_listener_port,
                "timezone": self.config.timezone,
            }),
            GetTarget::Folders => json!(self.folders.iter().map(|f| f.folder.folder_id.clone()).collect::<Vec<_>>()),
            GetTarget::Uploader => json!({"note": "the global uploader has no externally observable state beyond its queue depth"}),
            GetTarget::RcloneGuiConfig(keys) => json!({"requested_keys": keys, "configured": false}),
            GetTarget::Worker(name) => json!({"worker": name, "status": "supervised"}),
        }
    }

    async fn dispatch_run(&self, target: RunTarget) -> Value {
        let result = match target {
            RunTarget::CheckProcesses => self.run_check_processes().await,
            RunTarget::Archive { folder_id, free_up_bytes } => self.run_one_archive(&folder_id, free_up_bytes).await,
            RunTarget::UpdateAllFiles(folder_id) => self.run_update_all_files(&folder_id).await,
            RunTarget::DownloadOnly(folder_id) => self.run_one_sync_from_cloud(&folder_id).await,
            RunTarget::UploadOnly(folder_id) => self.run_one_archive(&folder_id, None).await,
            RunTarget::Named(name) => Err(TriarchiveError::NotFound(format!("no named task {name}"))),
        };
        match result {
            Ok(()) => json!({"ok": true}),
            Err(err) => json!({"error": err.to_string()}),
        }
    }

    async fn run_one_archive(&self, folder_id: &str, free_up_bytes: Option<u64>) -> TriarchiveResult<()> {
        let runtime = self
            .folder(folder_id)
            .ok_or_else(|| TriarchiveError::NotFound(format!("unknown folder {folder_id}")))?;
        let mounter = OsDeviceMounter;
        archive(
            &runtime.folder,
            runtime.index.as_ref(),
            &self.storage,
            &self.sync_client,
            &mounter,
            free_up_bytes.unwrap_or(0),
        )
        .await
    }

    async fn run_one_sync_from_cloud(&self, folder_id: &str) -> TriarchiveResult<()> {
        let runtime = self
            .folder(folder_id)
            .ok_or_else(|| TriarchiveError::NotFound(format!("unknown folder {folder_id}")))?;
        sync_from_cloud(&runtime.folder, runtime.index.as_ref(), &self.storage, &self.sync_client, &runtime.upload_tx).await?;
        Ok(())
    }

    async fn run_update_all_files(&self, folder_id: &str) -> TriarchiveResult<()> {
        let runtime = self
            .folder(folder_id)
            .ok_or_else(|| TriarchiveError::NotFound(format!("unknown folder {folder_id}")))?;
        triarchive_herald::refresh_index::refresh_index(&runtime.folder, runtime.index.as_ref(), &self.sync_client, &self.storage, true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyWorker {
        calls: Arc<std::sync::atomic::AtomicU32>,
    }

    impl FlakyWorker {
        async fn run(&mut self, _cancel: CancellationToken) -> TriarchiveResult<()> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(TriarchiveError::Transient("boom".into()))
        }
    }

    #[tokio::test]
    async fn run_supervised_stops_after_exceeding_its_failure_budget() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let worker = FlakyWorker { calls: calls.clone() };
        let failures_observed = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let failures_for_closure = failures_observed.clone();
        let opts = RetryOnErrorOptions {
            max_retry_count: 2,
            retry_expiry: Duration::from_secs(3600),
            retry_delay: Duration::from_millis(1),
            error_message: "flaky worker".into(),
        };
        run_supervised(
            "flaky".into(),
            worker,
            |w, cancel| w.run(cancel),
            opts,
            CancellationToken::new(),
            move || {
                failures_for_closure.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
        )
        .await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(failures_observed.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
