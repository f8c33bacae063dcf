//! Reconciler: `syncFromCloud`, the three-way compare between the
//! local tree, the FileIndex, and the storage tool's remote listing.
//! Grounded on `examples/original_source/sync.py`'s
//! `sync_from_cloud`/`filter_cloud_only`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;
use triarchive_core::model::{Folder, FileIndexRow};
use triarchive_core::TriarchiveResult;
use triarchive_storage::index::{FileIndex, FileQuery};
use triarchive_tools::storage_tool::StorageTool;
use triarchive_tools::sync_daemon::SyncDaemonClient;
use triarchive_utils::checkfile::{parse_lsl_output, read_path_list, write_checkfile, write_path_list, LslEntry};

use crate::queue::UploadAction;
use crate::refresh_index::refresh_index;

/// Outcome of a single `syncFromCloud` pass, reported for logging/tests.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub downloaded: Vec<String>,
    pub uploaded: Vec<String>,
    pub new_cloud_only: Vec<String>,
    pub deletion_missed: Vec<String>,
}

fn parse_lsl_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

async fn get_remote_file_info(
    storage: &StorageTool,
    remote_root: &str,
    paths: &[String],
    tmp_dir: &std::path::Path,
) -> TriarchiveResult<HashMap<String, LslEntry>> {
    if paths.is_empty() {
        return Ok(HashMap::new());
    }
    let list_path = tmp_dir.join(format!("lsl-{}.txt", paths.len()));
    write_path_list(&list_path, paths)?;
    let output = storage.lsl(remote_root, &list_path).await?;
    Ok(parse_lsl_output(&output.stdout)
        .into_iter()
        .map(|entry| (entry.path.clone(), entry))
        .collect())
}

/// `syncFromCloud(folder)`: three-way reconcile per §4.9, enqueuing
/// downloads/uploads onto the folder's uploader queue as it goes.
pub async fn sync_from_cloud(
    folder: &Folder,
    index: &dyn FileIndex,
    storage: &StorageTool,
    sync_client: &SyncDaemonClient,
    folder_uploader_tx: &mpsc::Sender<(Vec<String>, UploadAction)>,
) -> TriarchiveResult<ReconcileOutcome> {
    let files: HashMap<String, FileIndexRow> = refresh_index(folder, index, sync_client, storage, false)
        .await?
        .into_iter()
        .map(|row| (row.path.clone(), row))
        .collect();

    let tmp_dir = tempfile::tempdir()?;
    let checkfile_path = tmp_dir.path().join("checkfile.txt");
    let differ_path = tmp_dir.path().join("differ.txt");
    let missing_dst_path = tmp_dir.path().join("missing.txt");
    let missing_src_path = tmp_dir.path().join("sync.txt");

    let checkfile_rows: Vec<(String, String)> = files
        .values()
        .filter_map(|row| row.hash.clone().map(|hash| (hash, row.path.clone())))
        .collect();
    write_checkfile(&checkfile_path, &checkfile_rows)?;

    storage
        .check(
            &checkfile_path,
            &folder.remote_root,
            "Hash",
            &differ_path,
            &missing_dst_path,
            &missing_src_path,
            &[0, 1, 3],
        )
        .await?;

    let differing = read_path_list(&differ_path)?;
    let missing_on_dst = read_path_list(&missing_dst_path)?;
    let remotely_added = read_path_list(&missing_src_path)?;

    // Step 5: cloud-only filtering of remotely-added paths.
    let mut known_paths: Vec<String> = files.keys().cloned().collect();
    known_paths.extend(remotely_added.iter().cloned());

    let mut new_cloud_only = Vec::new();
    let mut remaining_remote_added = Vec::new();
    for path in remotely_added {
        let known_refs: Vec<&str> = known_paths.iter().map(String::as_str).collect();
        let matched = folder
            .cloud_only_rules
            .iter()
            .any(|rule| rule.matches(&path, &known_refs).unwrap_or(false));
        if matched {
            new_cloud_only.push(path);
        } else {
            remaining_remote_added.push(path);
        }
    }

    if !new_cloud_only.is_empty() {
        let info = get_remote_file_info(storage, &folder.remote_root, &new_cloud_only, tmp_dir.path()).await?;
        let mut rows = Vec::new();
        for path in &new_cloud_only {
            let Some(entry) = info.get(path) else {
                warn!(path = %path, "cloud-only match but storage tool reported no remote info, skipping");
                continue;
            };
            let mod_time = parse_lsl_timestamp(&entry.timestamp);
            rows.push(FileIndexRow {
                path: path.clone(),
                hash: None,
                mod_time,
                size: Some(entry.size),
                uploaded_time: mod_time,
                cloud_only: true,
            });
        }
        if !rows.is_empty() {
            index.upsert(rows).await?;
        }
    }

    // Step 6: route D entries by which side is newer.
    let mut downloads: Vec<String> = remaining_remote_added;
    let mut uploads: Vec<String> = Vec::new();
    if !differing.is_empty() {
        let remote_info = get_remote_file_info(storage, &folder.remote_root, &differing, tmp_dir.path()).await?;
        for path in differing {
            let remote_mod = remote_info.get(&path).and_then(|e| parse_lsl_timestamp(&e.timestamp));
            let local_mod = files.get(&path).and_then(|row| row.mod_time);
            match (local_mod, remote_mod) {
                (None, _) => downloads.push(path),
                (Some(local), Some(remote)) if remote > local => downloads.push(path),
                _ => uploads.push(path),
            }
        }
    }
    // `missing_on_dst`: present in the index, absent remotely — always an upload.
    uploads.extend(missing_on_dst);

    // Step 7: deletion-miss detection among the candidate downloads.
    let deletion_missed_rows = index
        .select_where(FileQuery {
            uploaded_present: Some(true),
            size_absent: Some(true),
            cloud_only: Some(false),
            ..Default::default()
        })
        .await?;
    let deletion_missed_paths: HashSet<String> = deletion_missed_rows
        .into_iter()
        .map(|row| row.path)
        .filter(|p| downloads.contains(p))
        .collect();

    if !deletion_missed_paths.is_empty() {
        let list: Vec<String> = deletion_missed_paths.iter().cloned().collect();
        downloads.retain(|p| !deletion_missed_paths.contains(p));
        if folder_uploader_tx.send((list, UploadAction::DeleteFiles)).await.is_err() {
            warn!(folder_id = %folder.folder_id, "folder uploader queue dropped during reconciliation");
        }
    }

    if !downloads.is_empty() {
        let now = Utc::now();
        let mut pending_rows = Vec::new();
        for path in &downloads {
            let mut row = index.get(path).await?.unwrap_or_else(|| FileIndexRow::new(path.clone()));
            row.uploaded_time = Some(now);
            pending_rows.push(row);
        }
        index.upsert(pending_rows).await?;

        let download_list_path = tmp_dir.path().join("deleted.txt");
        write_path_list(&download_list_path, &downloads)?;
        storage
            .copy(&download_list_path, &folder.remote_root, &folder.local_root.display().to_string())
            .await?;

        let mut completed = Vec::new();
        for path in &downloads {
            if let Some(mut row) = index.get(path).await? {
                row.uploaded_time = row.mod_time;
                completed.push(row);
            }
        }
        if !completed.is_empty() {
            index.upsert(completed).await?;
        }
    }

    // Step 8: uploads first become un-ignored, then flow through the
    // folder uploader like any local change.
    if !uploads.is_empty() {
        sync_client.discard_ignores(&folder.folder_id, &uploads).await?;
        if folder_uploader_tx
            .send((uploads.clone(), UploadAction::Copy))
            .await
            .is_err()
        {
            warn!(folder_id = %folder.folder_id, "folder uploader queue dropped during reconciliation");
        }
    }

    Ok(ReconcileOutcome {
        downloaded: downloads,
        uploaded: uploads,
        new_cloud_only,
        deletion_missed: deletion_missed_paths.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsl_joined_timestamp() {
        let parsed = parse_lsl_timestamp("2022-06-01T10:00:00.000000000").unwrap();
        assert_eq!(parsed.format("%Y-%m-%d").to_string(), "2022-06-01");
    }
}
