//! The change listener, the per-folder upload syncer and
//! folder uploader, the single global uploader, the cloud reconciler,
//! the removable-media archiver and the trash purger.

pub mod archiver;
pub mod events;
pub mod folder_uploader;
pub mod global_uploader;
pub mod listener;
pub mod queue;
pub mod reconciler;
pub mod refresh_index;
pub mod trash_purger;
pub mod upload_syncer;
