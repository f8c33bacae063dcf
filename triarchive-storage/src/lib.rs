//! The per-folder FileIndex store: a durable keyed map of path to
//! `{hash, modTime, size, uploadedTime, cloudOnly}`, backed by an
//! embedded relational database.

pub mod index;

pub use index::{FileIndex, FileQuery, SqliteFileIndex};
