//! Global uploader: the single process-wide worker that serializes
//! byte transfers by running the storage tool's `copy`/`move`
//! subcommands. Grounded on `examples/original_source/uploader.py`'s
//! `GlobalUploader.run`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use triarchive_core::TriarchiveResult;
use triarchive_tools::storage_tool::StorageTool;
use triarchive_utils::checkfile::write_path_list;

use crate::queue::{GlobalAction, GlobalUploadMessage};

pub struct GlobalUploader {
    storage: Arc<StorageTool>,
    receiver: mpsc::Receiver<GlobalUploadMessage>,
}

impl GlobalUploader {
    pub fn new(storage: Arc<StorageTool>, receiver: mpsc::Receiver<GlobalUploadMessage>) -> Self {
        Self { storage, receiver }
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> TriarchiveResult<()> {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = self.receiver.recv() => msg,
            };
            let Some(msg) = msg else {
                return Ok(());
            };
            self.handle(msg).await?;
        }
    }

    async fn handle(&self, msg: GlobalUploadMessage) -> TriarchiveResult<()> {
        let mut paths = msg.paths;
        paths.sort();
        paths.dedup();

        let scratch = tempfile::NamedTempFile::new()?;
        write_path_list(scratch.path(), &paths)?;

        let result = match msg.action {
            GlobalAction::Copy => self.storage.copy(scratch.path(), &msg.src_root, &msg.dst_root).await,
            GlobalAction::Move => self.storage.move_files(scratch.path(), &msg.src_root, &msg.dst_root).await,
        };

        match result {
            Ok(out) => {
                info!(exit_code = out.exit_code, count = paths.len(), "global upload completed");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, src = %msg.src_root, dst = %msg.dst_root, "global upload failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduplicates_paths_before_writing_the_scratch_list() {
        let storage = Arc::new(StorageTool::new("true", "/tmp", "SENTINEL", None));
        let (_tx, rx) = mpsc::channel(1);
        let uploader = GlobalUploader::new(storage, rx);

        let result = uploader
            .handle(GlobalUploadMessage {
                paths: vec!["a".to_string(), "a".to_string(), "b".to_string()],
                action: GlobalAction::Copy,
                src_root: "/tmp/src".to_string(),
                dst_root: "remote:dst".to_string(),
            })
            .await;
        assert!(result.is_ok());
    }
}
