//! Shared utilities: retry wrapper, same-file predicate, checkfile and
//! path-list I/O.

pub mod checkfile;
pub mod retry;
pub mod same_file;
