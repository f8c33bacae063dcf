//! Core data model, error types, configuration and logging bootstrap shared
//! by every triarchive crate.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod time;

pub use error::{TriarchiveError, TriarchiveResult};
