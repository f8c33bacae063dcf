//! Trash purger: deletes files older than a folder's configured
//! retention under its trash root. Grounded on
//! `examples/original_source/trashhandler.py::handle_trash`.

use tracing::warn;
use triarchive_core::model::Folder;
use triarchive_core::TriarchiveResult;
use triarchive_tools::storage_tool::StorageTool;

/// `handleTrash(folder)`: non-fatal by design — a failure here never
/// takes down the folder's other workers.
pub async fn handle_trash(folder: &Folder, storage: &StorageTool) -> TriarchiveResult<()> {
    let keep = folder.trash_keep_duration.unwrap_or_default();
    let trash_root = folder.trash_root.display().to_string();
    if let Err(err) = storage.delete_with_min_age(&trash_root, keep).await {
        warn!(folder_id = %folder.folder_id, error = %err, "trash purge failed, non-fatal");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn failures_are_swallowed_as_warnings() {
        let folder = Folder {
            folder_id: "f1".into(),
            local_root: "/tmp".into(),
            remote_root: "remote:f1".into(),
            trash_root: "/tmp/.trash".into(),
            metadata_root: "/tmp/.backupdata".into(),
            archive: None,
            trash_keep_duration: Some(Duration::from_secs(60 * 24 * 3600)),
            local_keep_duration: None,
            local_ignore_patterns: vec![],
            cloud_only_rules: vec![],
            database_name: None,
        };
        let storage = StorageTool::new("false", "/tmp", "SENTINEL", None);
        assert!(handle_trash(&folder, &storage).await.is_ok());
    }
}
