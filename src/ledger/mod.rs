//! Ledger module for resumable generation.
//!
//! Provides:
//! - `fingerprint`: content-addressed job identities
//! - `Ledger`: the append-only record of completed jobs

mod fingerprint;
mod store;

pub use fingerprint::*;
pub use store::*;
