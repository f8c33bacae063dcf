//! Folder uploader: coalesces consecutive same-action operations
//! over a 10-second window and dispatches to the global uploader or,
//! for deletes, straight to the storage tool. Grounded on
//! `examples/original_source/uploader.py`'s `Uploader.run`/`_collect`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use triarchive_core::model::Folder;
use triarchive_core::TriarchiveResult;
use triarchive_storage::index::{FileIndex, FileQuery};
use triarchive_tools::storage_tool::StorageTool;
use triarchive_utils::checkfile::write_path_list;

use crate::queue::{GlobalAction, GlobalUploadMessage, UploadAction};

const COALESCE_WINDOW: Duration = Duration::from_secs(10);

/// A path is excluded from the global-uploader batch if it lives under,
/// or is itself, a storage-tool "_files" sidecar directory.
fn uploadable(path: &str) -> bool {
    !path.contains("_files/") && !path.ends_with("_files")
}

pub struct FolderUploader {
    folder: Folder,
    index: Arc<dyn FileIndex>,
    storage: Arc<StorageTool>,
    receiver: mpsc::Receiver<(Vec<String>, UploadAction)>,
    global_tx: mpsc::Sender<GlobalUploadMessage>,
}

impl FolderUploader {
    pub fn new(
        folder: Folder,
        index: Arc<dyn FileIndex>,
        storage: Arc<StorageTool>,
        receiver: mpsc::Receiver<(Vec<String>, UploadAction)>,
        global_tx: mpsc::Sender<GlobalUploadMessage>,
    ) -> Self {
        Self {
            folder,
            index,
            storage,
            receiver,
            global_tx,
        }
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> TriarchiveResult<()> {
        let mut pending: Option<(UploadAction, Vec<String>)> = match tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = self.receiver.recv() => msg,
        } {
            Some(msg) => Some(msg),
            None => return Ok(()),
        };

        loop {
            let Some((action, mut paths)) = pending.take() else {
                return Ok(());
            };

            if !action.is_coalescable() {
                self.perform_action(action, paths).await?;
                pending = self.next_message(&cancel).await?;
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.perform_action(action, paths).await?;
                    return Ok(());
                }
                _ = tokio::time::sleep(COALESCE_WINDOW) => {
                    self.perform_action(action, paths).await?;
                    pending = self.next_message(&cancel).await?;
                }
                msg = self.receiver.recv() => {
                    match msg {
                        Some((new_paths, new_action)) if new_action == action => {
                            paths.extend(new_paths);
                            pending = Some((action, paths));
                        }
                        Some((new_paths, new_action)) => {
                            self.perform_action(action, paths).await?;
                            pending = Some((new_action, new_paths));
                        }
                        None => {
                            self.perform_action(action, paths).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn next_message(
        &mut self,
        cancel: &CancellationToken,
    ) -> TriarchiveResult<Option<(UploadAction, Vec<String>)>> {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            msg = self.receiver.recv() => msg,
        };
        Ok(msg)
    }

    async fn perform_action(&self, action: UploadAction, paths: Vec<String>) -> TriarchiveResult<()> {
        match action {
            UploadAction::Copy | UploadAction::Move => self.perform_copy_or_move(action, paths).await,
            UploadAction::DeleteFiles => self.perform_delete_files(paths).await,
            UploadAction::DeleteFolders => self.perform_delete_folders(paths).await,
        }
    }

    async fn perform_copy_or_move(&self, action: UploadAction, paths: Vec<String>) -> TriarchiveResult<()> {
        let filtered: Vec<String> = paths.into_iter().filter(|p| uploadable(p)).collect();
        if filtered.is_empty() {
            return Ok(());
        }

        let global_action = if action == UploadAction::Copy {
            GlobalAction::Copy
        } else {
            GlobalAction::Move
        };
        if self
            .global_tx
            .send(GlobalUploadMessage {
                paths: filtered.clone(),
                action: global_action,
                src_root: self.folder.local_root.display().to_string(),
                dst_root: self.folder.remote_root.clone(),
            })
            .await
            .is_err()
        {
            warn!(folder_id = %self.folder.folder_id, "global uploader queue dropped, no consumer");
        }

        let mut rows = Vec::new();
        for path in &filtered {
            if let Some(mut row) = self.index.get(path).await? {
                row.uploaded_time = row.mod_time;
                rows.push(row);
            }
        }
        if !rows.is_empty() {
            self.index.upsert(rows).await?;
        }
        Ok(())
    }

    async fn perform_delete_files(&self, paths: Vec<String>) -> TriarchiveResult<()> {
        let scratch = tempfile::NamedTempFile::new()?;
        write_path_list(scratch.path(), &paths)?;
        match self.storage.delete_files(&self.folder.remote_root, scratch.path()).await {
            Ok(_) => {
                info!(folder_id = %self.folder.folder_id, count = paths.len(), "deleted files remotely");
                Ok(())
            }
            Err(err) => {
                error!(folder_id = %self.folder.folder_id, ?paths, error = %err, "remote file deletion failed");
                Ok(())
            }
        }
    }

    async fn perform_delete_folders(&self, prefixes: Vec<String>) -> TriarchiveResult<()> {
        for prefix in prefixes {
            let cloud_only_rows = self
                .index
                .select_where(FileQuery {
                    path_prefix: Some(prefix.clone()),
                    cloud_only: Some(true),
                    ..Default::default()
                })
                .await?;
            if !cloud_only_rows.is_empty() {
                warn!(
                    folder_id = %self.folder.folder_id,
                    prefix = %prefix,
                    "skipping folder purge: cloud-only rows live under this prefix"
                );
                continue;
            }

            let remote_path = format!("{}/{}", self.folder.remote_root, prefix);
            if let Err(err) = self.storage.purge(&remote_path).await {
                error!(folder_id = %self.folder.folder_id, prefix = %prefix, error = %err, "folder purge failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triarchive_storage::index::SqliteFileIndex;

    fn test_folder() -> Folder {
        Folder {
            folder_id: "f1".into(),
            local_root: "/data/f1".into(),
            remote_root: "remote:f1".into(),
            trash_root: "/data/f1/.trash".into(),
            metadata_root: "/data/f1/.backupdata".into(),
            archive: None,
            trash_keep_duration: None,
            local_keep_duration: None,
            local_ignore_patterns: Folder::default_local_ignores(),
            cloud_only_rules: vec![],
            database_name: None,
        }
    }

    #[test]
    fn uploadable_excludes_files_sidecar_paths() {
        assert!(!uploadable("a/b_files/c.txt"));
        assert!(!uploadable("a/b_files"));
        assert!(uploadable("a/b.txt"));
    }

    #[tokio::test]
    async fn coalesces_consecutive_copy_messages_into_one_global_dispatch() {
        let index: Arc<dyn FileIndex> = Arc::new(SqliteFileIndex::open_in_memory().unwrap());
        let storage = Arc::new(StorageTool::new("true", "/tmp", "SENTINEL", None));
        let (tx, rx) = mpsc::channel(10);
        let (global_tx, mut global_rx) = mpsc::channel(10);

        let mut uploader = FolderUploader::new(test_folder(), index, storage, rx, global_tx);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { uploader.run(run_cancel).await });

        tx.send((vec!["a".to_string()], UploadAction::Copy)).await.unwrap();
        tx.send((vec!["b".to_string()], UploadAction::Copy)).await.unwrap();
        drop(tx);

        let msg = global_rx.recv().await.unwrap();
        assert_eq!(msg.paths, vec!["a".to_string(), "b".to_string()]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn different_action_flushes_the_pending_batch_first() {
        let index: Arc<dyn FileIndex> = Arc::new(SqliteFileIndex::open_in_memory().unwrap());
        let storage = Arc::new(StorageTool::new("true", "/tmp", "SENTINEL", None));
        let (tx, rx) = mpsc::channel(10);
        let (global_tx, mut global_rx) = mpsc::channel(10);

        let mut uploader = FolderUploader::new(test_folder(), index, storage, rx, global_tx);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { uploader.run(run_cancel).await });

        tx.send((vec!["a".to_string()], UploadAction::Copy)).await.unwrap();
        tx.send((vec!["c".to_string()], UploadAction::DeleteFiles)).await.unwrap();
        drop(tx);

        let first = global_rx.recv().await.unwrap();
        assert_eq!(first.paths, vec!["a".to_string()]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
