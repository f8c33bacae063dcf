//! `refreshIndex` (§4.4): reconciles a folder's FileIndex against the sync
//! daemon's `db/browse` tree. Shared by the upload syncer's cloud-only
//! special case, the reconciler, and the archiver — each calls this
//! before doing its own three-way compare.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use serde_json::Value;
use tracing::warn;
use triarchive_core::model::{Folder, FileIndexRow};
use triarchive_core::time::parse_sync_daemon_mod_time;
use triarchive_core::TriarchiveResult;
use triarchive_storage::index::FileIndex;
use triarchive_tools::storage_tool::StorageTool;
use triarchive_tools::sync_daemon::{parse_browse_response, BrowseNode, SyncDaemonClient};
use triarchive_utils::same_file::{is_same_file, FileStat};

/// Walks the sync daemon's browse tree for `folder_id` one directory
/// level at a time, issuing one `levels=0` request per directory found
/// (matching the original's one-request-per-top-level-subtree recursion,
/// generalized to arbitrary depth via an explicit work queue rather than
/// async recursion).
async fn browse_all(client: &SyncDaemonClient, folder_id: &str) -> TriarchiveResult<Vec<(String, BrowseNode)>> {
    let mut out = Vec::new();
    let mut queue: VecDeque<Option<String>> = VecDeque::new();
    queue.push_back(None);

    while let Some(prefix) = queue.pop_front() {
        let mut query = vec![("folder", folder_id.to_string()), ("levels", "0".to_string())];
        if let Some(p) = &prefix {
            query.push(("prefix", p.clone()));
        }
        let value = client.get("db/browse", &query, &[]).await?;
        for node in parse_browse_response(&value) {
            let path = match &prefix {
                Some(p) => format!("{p}/{}", node.name),
                None => node.name.clone(),
            };
            if node.is_directory() {
                queue.push_back(Some(path.clone()));
                out.push((path, node));
            } else if node.kind == "FILE_INFO_TYPE_FILE" {
                out.push((path, node));
            } else {
                warn!(kind = %node.kind, path = %path, "unknown browse entry type, skipping");
            }
        }
    }
    Ok(out)
}

fn is_ignored(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|raw| {
        let pattern = raw.trim_start_matches('/');
        path == pattern || path.starts_with(&format!("{pattern}/"))
    })
}

fn file_status_indicates_erasure(value: &Value) -> bool {
    if let Some(text) = value.as_str() {
        return text.contains("No such object");
    }
    if let Some(global) = value.get("global") {
        let deleted = global.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        let ignored = global.get("ignored").and_then(Value::as_bool).unwrap_or(false);
        return deleted || ignored;
    }
    false
}

/// `getFileDetails(path)`: directories get the configured sentinel hash;
/// files are hashed via `hashsum quickxor`. mtime/size come straight from
/// the filesystem stat, with no timezone conversion at this step.
pub async fn get_file_details(
    local_root: &Path,
    relative_path: &str,
    storage: &StorageTool,
) -> TriarchiveResult<FileIndexRow> {
    let absolute = local_root.join(relative_path);
    let metadata = tokio::fs::metadata(&absolute).await?;
    let mod_time = metadata.modified()?.into();

    let (hash, size) = if metadata.is_dir() {
        (storage.default_hashsum_sentinel().to_string(), None)
    } else {
        (storage.hashsum("quickxor", &absolute).await, Some(metadata.len() as i64))
    };

    Ok(FileIndexRow {
        path: relative_path.to_string(),
        hash: Some(hash),
        mod_time: Some(mod_time),
        size,
        uploaded_time: None,
        cloud_only: false,
    })
}

/// `refreshIndex(folder, {returnDirectories})`. Returns the folder's full
/// set of rows after reconciliation, filtered to files only unless
/// `return_directories` is set.
pub async fn refresh_index(
    folder: &Folder,
    index: &dyn FileIndex,
    sync_daemon: &SyncDaemonClient,
    storage: &StorageTool,
    return_directories: bool,
) -> TriarchiveResult<Vec<FileIndexRow>> {
    let known: HashMap<String, FileIndexRow> = index
        .get_all()
        .await?
        .into_iter()
        .map(|row| (row.path.clone(), row))
        .collect();
    let mut removed: HashSet<String> = known.keys().cloned().collect();
    let mut added = Vec::new();
    let mut changed = Vec::new();

    let entries = browse_all(sync_daemon, &folder.folder_id).await?;
    for (path, node) in &entries {
        removed.remove(path);

        let Some(existing) = known.get(path) else {
            added.push(path.clone());
            continue;
        };
        if node.is_directory() {
            continue;
        }

        let Some(mod_time) = node.mod_time.as_deref().and_then(parse_sync_daemon_mod_time) else {
            warn!(path = %path, raw = ?node.mod_time, "unparseable modTime from sync daemon, keeping existing row");
            continue;
        };

        let same = is_same_file(
            FileStat { hash: existing.hash.as_deref(), mod_time: existing.mod_time, size: existing.size },
            FileStat { hash: None, mod_time: Some(mod_time), size: node.size },
        );
        if !same {
            changed.push(path.clone());
        }
    }

    let ignores = &folder.local_ignore_patterns;
    added.retain(|p| !is_ignored(p, ignores));
    changed.retain(|p| !is_ignored(p, ignores));
    removed.retain(|p| !is_ignored(p, ignores));

    let mut upserts = Vec::new();
    for path in added.iter().chain(changed.iter()) {
        if tokio::fs::metadata(folder.local_root.join(path)).await.is_ok() {
            upserts.push(get_file_details(&folder.local_root, path, storage).await?);
        }
    }
    if !upserts.is_empty() {
        index.upsert(upserts).await?;
    }

    let mut to_erase = Vec::new();
    for path in &removed {
        let value = sync_daemon
            .get("db/file", &[("folder", folder.folder_id.clone()), ("file", path.clone())], &[])
            .await?;
        if file_status_indicates_erasure(&value) {
            to_erase.push(path.clone());
        } else {
            warn!(path = %path, "vanished from browse but not globally deleted or ignored, keeping row");
        }
    }
    if !to_erase.is_empty() {
        index.erase(to_erase).await?;
    }

    let mut result = index.get_all().await?;
    if !return_directories {
        result.retain(|row| row.hash.is_some());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ignored_matches_exact_path_and_descendants() {
        let patterns = vec![".trash".to_string(), "/.backupdata".to_string()];
        assert!(is_ignored(".trash", &patterns));
        assert!(is_ignored(".trash/a.txt", &patterns));
        assert!(is_ignored(".backupdata/x", &patterns));
        assert!(!is_ignored("trash-other/a.txt", &patterns));
    }

    #[test]
    fn file_status_recognizes_no_such_object_text() {
        let value = Value::String("No such object in the index".to_string());
        assert!(file_status_indicates_erasure(&value));
    }

    #[test]
    fn file_status_recognizes_globally_deleted() {
        let value = serde_json::json!({ "global": { "deleted": true } });
        assert!(file_status_indicates_erasure(&value));
    }

    #[test]
    fn file_status_keeps_row_when_present_and_not_deleted() {
        let value = serde_json::json!({ "global": { "deleted": false, "ignored": false } });
        assert!(!file_status_indicates_erasure(&value));
    }
}
