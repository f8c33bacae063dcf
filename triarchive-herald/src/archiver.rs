//! Archiver: reconciles local+index against a removable-media
//! archive, mounting/unmounting the device and evicting local files by
//! age or by a `freeUpNeeded` byte target. Grounded on
//! `examples/original_source/archiver.py`'s `sync_with_archive`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{error, warn};
use triarchive_core::model::{ArchiveConfig, Folder};
use triarchive_core::{TriarchiveError, TriarchiveResult};
use triarchive_storage::index::FileIndex;
use triarchive_tools::storage_tool::{RunOptions, StorageTool};
use triarchive_tools::sync_daemon::SyncDaemonClient;
use triarchive_utils::checkfile::{read_path_list, write_checkfile, write_path_list};
use walkdir::WalkDir;

use crate::refresh_index::refresh_index;

/// The OS-level mount/eject primitives the archive pass needs,
/// abstracted so archival logic can be exercised without real hardware.
#[async_trait]
pub trait DeviceMounter: Send + Sync {
    async fn is_mounted(&self, mount_point: &Path) -> TriarchiveResult<bool>;
    async fn close_tray(&self, device_id: &str) -> TriarchiveResult<()>;
    async fn mount(&self, device_id: &str, mount_point: &Path) -> TriarchiveResult<()>;
    async fn eject(&self, device_id: &str) -> TriarchiveResult<()>;
}

/// Shells out to `mountpoint`/`eject`/`mount`, the same external-command
/// convention the storage tool adapter uses.
pub struct OsDeviceMounter;

#[async_trait]
impl DeviceMounter for OsDeviceMounter {
    async fn is_mounted(&self, mount_point: &Path) -> TriarchiveResult<bool> {
        let output = tokio::process::Command::new("mountpoint")
            .arg("-q")
            .arg(mount_point)
            .output()
            .await?;
        Ok(output.status.success())
    }

    async fn close_tray(&self, device_id: &str) -> TriarchiveResult<()> {
        let _ = tokio::process::Command::new("eject").arg("-t").arg(device_id).output().await?;
        Ok(())
    }

    async fn mount(&self, device_id: &str, mount_point: &Path) -> TriarchiveResult<()> {
        tokio::fs::create_dir_all(mount_point).await?;
        let output = tokio::process::Command::new("mount").arg(device_id).arg(mount_point).output().await?;
        if !output.status.success() {
            return Err(TriarchiveError::Resource(format!(
                "mount {device_id} at {} failed: {}",
                mount_point.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn eject(&self, device_id: &str) -> TriarchiveResult<()> {
        let output = tokio::process::Command::new("eject").arg(device_id).output().await?;
        if !output.status.success() {
            return Err(TriarchiveError::Resource(format!(
                "eject {device_id} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

async fn reconnect(mounter: &dyn DeviceMounter, device_id: &str, mount_point: &Path) -> TriarchiveResult<()> {
    if mounter.is_mounted(mount_point).await? {
        warn!(device_id, mount_point = %mount_point.display(), "archive device already mounted, continuing");
        return Ok(());
    }
    mounter.close_tray(device_id).await?;
    mounter.mount(device_id, mount_point).await?;
    Ok(())
}

fn scan_local_files(root: &Path, ignore_patterns: &[String]) -> TriarchiveResult<HashMap<String, (DateTime<Utc>, u64)>> {
    let patterns: Vec<Regex> = ignore_patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();
    let mut out = HashMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let relative = relative.to_string_lossy().replace('\\', "/");
        if patterns.iter().any(|re| re.is_match(&relative)) {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| TriarchiveError::Resource(e.to_string()))?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        out.insert(relative, (modified, metadata.len()));
    }
    Ok(out)
}

/// `archive(folder, freeUpNeeded)`: the full archival pass for one folder.
pub async fn archive(
    folder: &Folder,
    index: &dyn FileIndex,
    storage: &StorageTool,
    sync_client: &SyncDaemonClient,
    mounter: &dyn DeviceMounter,
    free_up_needed: u64,
) -> TriarchiveResult<()> {
    let Some(archive_cfg) = &folder.archive else {
        warn!(folder_id = %folder.folder_id, "archive requested but folder has no archive configuration");
        return Ok(());
    };

    if let Some(device_id) = &archive_cfg.device_id {
        let mount_point = archive_cfg
            .mount_point
            .as_deref()
            .ok_or_else(|| TriarchiveError::Configuration("archive device configured without a mount point".into()))?;
        reconnect(mounter, device_id, mount_point).await?;
    }

    let result = run_archive_body(folder, archive_cfg, index, storage, sync_client, free_up_needed).await;
    if let Err(err) = &result {
        error!(folder_id = %folder.folder_id, error = %err, "archive pass failed, continuing to eject");
    }

    if let Some(device_id) = &archive_cfg.device_id {
        if let Err(err) = mounter.eject(device_id).await {
            error!(folder_id = %folder.folder_id, error = %err, "failed to eject archive device");
        }
    }

    result
}

async fn run_archive_body(
    folder: &Folder,
    archive_cfg: &ArchiveConfig,
    index: &dyn FileIndex,
    storage: &StorageTool,
    sync_client: &SyncDaemonClient,
    free_up_needed: u64,
) -> TriarchiveResult<()> {
    let files = refresh_index(folder, index, sync_client, storage, false).await?;

    let tmp_dir = tempfile::tempdir()?;
    let checkfile_path = tmp_dir.path().join("checkfile.txt");
    let differ_path = tmp_dir.path().join("differ.txt");
    let missing_dst_path = tmp_dir.path().join("missing.txt");
    let missing_src_path = tmp_dir.path().join("sync.txt");

    let checkfile_rows: Vec<(String, String)> = files
        .iter()
        .filter_map(|row| row.hash.clone().map(|hash| (hash, row.path.clone())))
        .collect();
    write_checkfile(&checkfile_path, &checkfile_rows)?;

    storage
        .check(
            &checkfile_path,
            &archive_cfg.archive_root,
            "Hash",
            &differ_path,
            &missing_dst_path,
            &missing_src_path,
            &[0, 1],
        )
        .await?;

    let mut copy_to_archive = read_path_list(&differ_path)?;
    copy_to_archive.extend(read_path_list(&missing_dst_path)?);
    copy_to_archive.sort();
    copy_to_archive.dedup();
    let delete_from_archive = read_path_list(&missing_src_path)?;

    let local_files = scan_local_files(&folder.local_root, &folder.local_ignore_patterns)?;

    let mut delete_from_local: Vec<String> = Vec::new();
    if let Some(keep) = folder.local_keep_duration {
        let cutoff = Utc::now() - chrono::Duration::from_std(keep).unwrap_or_default();
        delete_from_local.extend(
            local_files
                .iter()
                .filter(|(_, (mtime, _))| *mtime < cutoff)
                .map(|(path, _)| path.clone()),
        );
    }

    if free_up_needed > 0 {
        // Open Question #3: freeUp-based eviction replaces the age-based
        // list rather than extending it.
        delete_from_local.clear();
        let mut by_mtime: Vec<(&String, &(DateTime<Utc>, u64))> = local_files.iter().collect();
        by_mtime.sort_by_key(|(_, (mtime, _))| *mtime);
        let mut freed = 0u64;
        for (path, (_, size)) in by_mtime {
            if freed >= free_up_needed {
                break;
            }
            delete_from_local.push(path.clone());
            freed += size;
        }
    }

    let local_root_str = folder.local_root.display().to_string();

    if !copy_to_archive.is_empty() {
        let list_path = tmp_dir.path().join("copy_to_archive.txt");
        write_path_list(&list_path, &copy_to_archive)?;
        storage.copy(&list_path, &local_root_str, &archive_cfg.archive_root).await?;
    }

    // Step 9: never delete locally what the cloud replica doesn't have yet.
    let missing_remote_path = tmp_dir.path().join("missing_remote.txt");
    storage
        .run(
            "check",
            &[
                local_root_str.clone(),
                folder.remote_root.clone(),
                "--missing-on-dst".to_string(),
                missing_remote_path.display().to_string(),
            ],
            RunOptions::expecting(&[0, 1]),
        )
        .await?;
    let withheld: HashSet<String> = read_path_list(&missing_remote_path)?.into_iter().collect();
    delete_from_local.retain(|p| !withheld.contains(p));

    if !withheld.is_empty() {
        let withheld_list: Vec<String> = withheld.into_iter().collect();
        sync_client.extend_ignores(&folder.folder_id, &withheld_list).await?;
    }

    if !delete_from_local.is_empty() {
        let list_path = tmp_dir.path().join("delete_from_local.txt");
        write_path_list(&list_path, &delete_from_local)?;
        storage.move_files(&list_path, &local_root_str, &archive_cfg.archive_root).await?;
    }

    if !delete_from_archive.is_empty() {
        let list_path = tmp_dir.path().join("delete_from_archive.txt");
        write_path_list(&list_path, &delete_from_archive)?;
        storage
            .move_files(&list_path, &archive_cfg.archive_root, &folder.trash_root.display().to_string())
            .await?;
    }

    Ok(())
}
