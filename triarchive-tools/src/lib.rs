//! The external-tool adapter: uniform invocation of the storage CLI
//! and the sync daemon's HTTP API, with retries, expected-exit-code
//! handling, and async-job polling.

pub mod storage_tool;
pub mod sync_daemon;

pub use storage_tool::{CommandOutput, RunOptions, StorageTool};
pub use sync_daemon::SyncDaemonClient;
