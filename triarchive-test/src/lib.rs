//! Test utilities shared across the triarchive workspace: isolated
//! temp-directory environments, config/model fixtures, a fake sync
//! daemon, and a fake storage-tool binary.

pub mod environment;
pub mod fixtures;
pub mod mock;
pub mod storage;

pub use environment::TestEnvironment;
pub use fixtures::{sample_cloud_only_rule, sample_file_row, sample_global_config};
pub use mock::FakeSyncDaemon;
pub use storage::{FakeStorageTool, TestStorage};
