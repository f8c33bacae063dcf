//! Storage test helpers: an in-memory `FileIndex` fixture and a fake
//! storage-tool binary driven entirely by its argv, so tests can assert
//! on `StorageTool` call shapes without a real `rclone`.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use tempfile::NamedTempFile;
use triarchive_storage::index::{FileIndex, SqliteFileIndex};

/// An in-memory `FileIndex`, pre-seeded with the given rows.
pub struct TestStorage {
    pub index: SqliteFileIndex,
}

impl TestStorage {
    pub fn new() -> Result<Self> {
        Ok(Self {
            index: SqliteFileIndex::open_in_memory()?,
        })
    }

    pub async fn seed(&self, rows: Vec<triarchive_core::model::FileIndexRow>) -> Result<()> {
        self.index.upsert(rows).await?;
        Ok(())
    }
}

/// A fake storage-tool binary: a shell script that, given the first
/// argument as a subcommand, prints a canned response and exits with a
/// canned code, both supplied by the caller. Lets tests exercise
/// `StorageTool` without invoking a real `rclone`.
pub struct FakeStorageTool {
    script: NamedTempFile,
}

impl FakeStorageTool {
    /// `responses` maps a subcommand name to `(exit_code, stdout)`.
    /// Any subcommand not listed exits 0 with empty stdout.
    pub fn new(responses: &[(&str, i32, &str)]) -> Result<Self> {
        let mut script = NamedTempFile::new()?;
        writeln!(script, "#!/bin/sh")?;
        writeln!(script, "case \"$1\" in")?;
        for (subcommand, exit_code, stdout) in responses {
            writeln!(script, "  {subcommand})")?;
            writeln!(script, "    printf '%s' '{stdout}'")?;
            writeln!(script, "    exit {exit_code}")?;
            writeln!(script, "    ;;")?;
        }
        writeln!(script, "  *) exit 0 ;;")?;
        writeln!(script, "esac")?;
        script.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(script.path())?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(script.path(), perms)?;
        }

        Ok(Self { script })
    }

    pub fn binary_path(&self) -> PathBuf {
        self.script.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_seeds_and_reads_back_rows() {
        let storage = TestStorage::new().unwrap();
        storage
            .seed(vec![triarchive_core::model::FileIndexRow::new("a.txt")])
            .await
            .unwrap();
        let all = storage.index.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn fake_storage_tool_script_is_executable() {
        let fake = FakeStorageTool::new(&[("check", 1, "differ.txt\n")]).unwrap();
        let metadata = std::fs::metadata(fake.binary_path()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_ne!(metadata.permissions().mode() & 0o100, 0);
        }
    }
}
