//! Isolated, auto-cleaned test environments: a temp local root, trash
//! root and metadata root wired into a `Folder`.

use std::path::PathBuf;

use anyhow::Result;
use tempfile::TempDir;
use triarchive_core::model::Folder;

pub struct TestEnvironment {
    _root: TempDir,
    pub local_root: PathBuf,
    pub trash_root: PathBuf,
    pub metadata_root: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let root = TempDir::new()?;
        let local_root = root.path().join("local");
        let trash_root = root.path().join(".trash");
        let metadata_root = root.path().join(".backupdata");
        std::fs::create_dir_all(&local_root)?;
        std::fs::create_dir_all(&trash_root)?;
        std::fs::create_dir_all(&metadata_root)?;
        Ok(Self {
            _root: root,
            local_root,
            trash_root,
            metadata_root,
        })
    }

    /// Builds a minimal `Folder` pointed at this environment's temp
    /// directories, with no archive configuration and no cloud-only
    /// rules, suitable as a base for tests to customize further.
    pub fn folder(&self, folder_id: impl Into<String>) -> Folder {
        Folder {
            folder_id: folder_id.into(),
            local_root: self.local_root.clone(),
            remote_root: "remote:test".into(),
            trash_root: self.trash_root.clone(),
            metadata_root: self.metadata_root.clone(),
            archive: None,
            trash_keep_duration: Some(std::time::Duration::from_secs(60 * 24 * 3600)),
            local_keep_duration: None,
            local_ignore_patterns: Folder::default_local_ignores(),
            cloud_only_rules: vec![],
            database_name: None,
        }
    }

    /// Writes `contents` to `relative_path` under the local root,
    /// creating parent directories as needed, and returns the absolute
    /// path.
    pub fn write_local_file(&self, relative_path: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.local_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_points_at_the_environments_temp_directories() {
        let env = TestEnvironment::new().unwrap();
        let folder = env.folder("f1");
        assert_eq!(folder.local_root, env.local_root);
        assert_eq!(folder.trash_root, env.trash_root);
    }

    #[test]
    fn write_local_file_creates_parent_directories() {
        let env = TestEnvironment::new().unwrap();
        let path = env.write_local_file("a/b/c.txt", b"hi").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hi");
    }
}
