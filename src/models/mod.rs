//! Core data models for pairgen.
//!
//! - `config`: the immutable run configuration
//! - `error`: the failure taxonomy
//! - `record`: chunks, jobs, committed records and run summaries

mod config;
mod error;
mod record;

pub use config::*;
pub use error::*;
pub use record::*;
