//! Upload syncer: translates a folder's change batches into one of
//! `{copy, delete_files, delete_folders}` and mutates that folder's
//! FileIndex accordingly, per §4.5. Grounded on
//! `examples/original_source/sync.py`'s `listen()`/`handle_event` dispatch.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;
use triarchive_core::model::Folder;
use triarchive_core::TriarchiveResult;
use triarchive_storage::index::{FileIndex, FileQuery};
use triarchive_tools::storage_tool::StorageTool;
use triarchive_tools::sync_daemon::SyncDaemonClient;

use crate::events::{ChangeAction, ChangeSource, EntryKind, ListenerEvent};
use crate::queue::UploadAction;
use crate::refresh_index::get_file_details;

pub struct UploadSyncer {
    folder: Folder,
    index: Arc<dyn FileIndex>,
    storage: Arc<StorageTool>,
    sync_client: Arc<SyncDaemonClient>,
    upload_tx: mpsc::Sender<(Vec<String>, UploadAction)>,
}

impl UploadSyncer {
    pub fn new(
        folder: Folder,
        index: Arc<dyn FileIndex>,
        storage: Arc<StorageTool>,
        sync_client: Arc<SyncDaemonClient>,
        upload_tx: mpsc::Sender<(Vec<String>, UploadAction)>,
    ) -> Self {
        Self {
            folder,
            index,
            storage,
            sync_client,
            upload_tx,
        }
    }

    /// Processes one batch fanned out by the change listener, acting only
    /// on events whose `folderID` matches this syncer's folder.
    pub async fn handle_batch(&self, batch: &[ListenerEvent]) -> TriarchiveResult<()> {
        let mut copy = Vec::new();
        let mut delete_files = Vec::new();
        let mut delete_folders = Vec::new();
        let mut local_deletes = Vec::new();

        for event in batch {
            let ListenerEvent::Change(change) = event else {
                continue;
            };
            if change.folder_id != self.folder.folder_id {
                continue;
            }
            match (change.action, change.kind) {
                (ChangeAction::Deleted, EntryKind::File) => {
                    delete_files.push(change.path.clone());
                    if change.source == ChangeSource::Local {
                        local_deletes.push(change.path.clone());
                    }
                }
                (ChangeAction::Deleted, EntryKind::Directory) => {
                    delete_folders.push(change.path.clone());
                    if change.source == ChangeSource::Local {
                        local_deletes.push(change.path.clone());
                    }
                }
                (ChangeAction::Modified, _) => copy.push(change.path.clone()),
            }
        }

        // Step 1: a cloud-only download completing locally shows up as a
        // modify event, but the cloud already has the bytes — refresh the
        // row from disk and drop it from the upload batch.
        let mut filtered_copy = Vec::with_capacity(copy.len());
        let mut completed_downloads = Vec::new();
        for path in copy {
            let existing = self.index.get(&path).await?;
            let is_completing_download = existing
                .as_ref()
                .map(|row| row.mod_time.is_none() && row.uploaded_time.is_some())
                .unwrap_or(false);
            if is_completing_download {
                completed_downloads.push(get_file_details(&self.folder.local_root, &path, &self.storage).await?);
            } else {
                filtered_copy.push(path);
            }
        }
        if !completed_downloads.is_empty() {
            self.index.upsert(completed_downloads).await?;
        }

        // Step 2: persist mutations.
        let mut fresh_rows = Vec::with_capacity(filtered_copy.len());
        for path in &filtered_copy {
            fresh_rows.push(get_file_details(&self.folder.local_root, path, &self.storage).await?);
        }
        if !fresh_rows.is_empty() {
            self.index.upsert(fresh_rows).await?;
        }

        if !delete_files.is_empty() {
            self.index.clear_bytes(delete_files.clone()).await?;
        }

        let mut cleared_under_folders = Vec::new();
        for prefix in &delete_folders {
            let rows = self
                .index
                .select_where(FileQuery {
                    path_prefix: Some(prefix.clone()),
                    cloud_only: Some(false),
                    ..Default::default()
                })
                .await?;
            cleared_under_folders.extend(rows.into_iter().map(|row| row.path));
        }
        if !cleared_under_folders.is_empty() {
            self.index.clear_bytes(cleared_under_folders).await?;
        }

        // Step 3: enqueue actions onto this folder's uploader.
        if !filtered_copy.is_empty() {
            self.send(filtered_copy, UploadAction::Copy).await;
        }
        if !delete_files.is_empty() {
            self.send(delete_files, UploadAction::DeleteFiles).await;
        }
        if !delete_folders.is_empty() {
            self.send(delete_folders, UploadAction::DeleteFolders).await;
        }

        // Local deletions of non-cloudOnly rows must not be reintroduced
        // from peers: add them to the sync daemon's ignore list.
        if !local_deletes.is_empty() {
            let mut non_cloud_only = Vec::with_capacity(local_deletes.len());
            for path in local_deletes {
                let cloud_only = self
                    .index
                    .get(&path)
                    .await?
                    .map(|row| row.cloud_only)
                    .unwrap_or(false);
                if !cloud_only {
                    non_cloud_only.push(path);
                }
            }
            if !non_cloud_only.is_empty() {
                self.sync_client
                    .extend_ignores(&self.folder.folder_id, &non_cloud_only)
                    .await?;
            }
        }

        Ok(())
    }

    async fn send(&self, paths: Vec<String>, action: UploadAction) {
        if self.upload_tx.send((paths, action)).await.is_err() {
            warn!(folder_id = %self.folder.folder_id, "folder uploader queue dropped, upload syncer has no consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use triarchive_core::model::FileIndexRow;
    use triarchive_storage::index::SqliteFileIndex;

    fn test_folder(local_root: std::path::PathBuf) -> Folder {
        Folder {
            folder_id: "f1".into(),
            local_root,
            remote_root: "remote:f1".into(),
            trash_root: std::path::PathBuf::from("/tmp/trash"),
            metadata_root: std::path::PathBuf::from("/tmp/meta"),
            archive: None,
            trash_keep_duration: None,
            local_keep_duration: None,
            local_ignore_patterns: Folder::default_local_ignores(),
            cloud_only_rules: vec![],
            database_name: None,
        }
    }

    fn change(source: ChangeSource, action: ChangeAction, kind: EntryKind, path: &str) -> ListenerEvent {
        ListenerEvent::Change(crate::events::ChangeEvent {
            source,
            folder_id: "f1".into(),
            path: path.to_string(),
            action,
            kind,
        })
    }

    #[tokio::test]
    async fn modified_file_is_enqueued_as_copy_and_upserted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let index: Arc<dyn FileIndex> = Arc::new(SqliteFileIndex::open_in_memory().unwrap());
        let storage = Arc::new(StorageTool::new("true", dir.path(), "SENTINEL", None));
        let sync_client = Arc::new(SyncDaemonClient::new("http://127.0.0.1:1", "key", 1, Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::channel(10);

        let syncer = UploadSyncer::new(test_folder(dir.path().to_path_buf()), index.clone(), storage, sync_client, tx);
        let batch = vec![change(ChangeSource::Local, ChangeAction::Modified, EntryKind::File, "a.txt")];
        syncer.handle_batch(&batch).await.unwrap();

        let (paths, action) = rx.recv().await.unwrap();
        assert_eq!(paths, vec!["a.txt".to_string()]);
        assert_eq!(action, UploadAction::Copy);
        assert!(index.get("a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleted_file_clears_bytes_but_keeps_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let index: Arc<dyn FileIndex> = Arc::new(SqliteFileIndex::open_in_memory().unwrap());
        index
            .upsert(vec![FileIndexRow {
                path: "p".into(),
                hash: Some("h".into()),
                mod_time: Some(chrono::Utc::now()),
                size: Some(100),
                uploaded_time: Some(chrono::Utc::now()),
                cloud_only: false,
            }])
            .await
            .unwrap();
        let storage = Arc::new(StorageTool::new("true", dir.path(), "SENTINEL", None));
        let sync_client = Arc::new(SyncDaemonClient::new("http://127.0.0.1:1", "key", 1, Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::channel(10);

        let syncer = UploadSyncer::new(test_folder(dir.path().to_path_buf()), index.clone(), storage, sync_client, tx);
        let batch = vec![change(ChangeSource::Remote, ChangeAction::Deleted, EntryKind::File, "p")];
        syncer.handle_batch(&batch).await.unwrap();

        let (paths, action) = rx.recv().await.unwrap();
        assert_eq!(paths, vec!["p".to_string()]);
        assert_eq!(action, UploadAction::DeleteFiles);

        let row = index.get("p").await.unwrap().unwrap();
        assert!(row.is_soft_deleted());
        assert!(row.uploaded_time.is_some());
    }

    #[tokio::test]
    async fn events_for_other_folders_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let index: Arc<dyn FileIndex> = Arc::new(SqliteFileIndex::open_in_memory().unwrap());
        let storage = Arc::new(StorageTool::new("true", dir.path(), "SENTINEL", None));
        let sync_client = Arc::new(SyncDaemonClient::new("http://127.0.0.1:1", "key", 1, Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::channel(10);

        let syncer = UploadSyncer::new(test_folder(dir.path().to_path_buf()), index, storage, sync_client, tx);
        let mut other = crate::events::ChangeEvent {
            source: ChangeSource::Local,
            folder_id: "other-folder".into(),
            path: "a.txt".into(),
            action: ChangeAction::Modified,
            kind: EntryKind::File,
        };
        other.folder_id = "other-folder".into();
        syncer.handle_batch(&[ListenerEvent::Change(other)]).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
