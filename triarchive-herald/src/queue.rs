//! Message shapes carried on the three queues between workers: change
//! listener → upload syncer (see [`crate::events::ListenerEvent`]),
//! upload syncer → folder uploader (`UploadAction`), folder uploader →
//! global uploader (`GlobalUploadMessage`).

/// One of the three actions the upload syncer produces, plus `Move` for
/// the folder uploader's coalescing state machine (a collecting batch of
/// copies or moves can extend across messages, even though the upload
/// syncer itself only ever emits `Copy`/`DeleteFiles`/`DeleteFolders`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAction {
    Copy,
    Move,
    DeleteFiles,
    DeleteFolders,
}

impl UploadAction {
    /// Only `copy`/`move` batches coalesce across messages; deletes flush
    /// immediately.
    pub fn is_coalescable(self) -> bool {
        matches!(self, UploadAction::Copy | UploadAction::Move)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalAction {
    Copy,
    Move,
}

/// A single folder uploader's dispatch onto the one process-wide global
/// uploader queue.
#[derive(Debug, Clone)]
pub struct GlobalUploadMessage {
    pub paths: Vec<String>,
    pub action: GlobalAction,
    pub src_root: String,
    pub dst_root: String,
}
