//! Chunk source: labeled, lazily-read corpus shards, plus pair files for
//! re-asking.

mod corpus;
mod pairs;
mod reader;

pub use corpus::*;
pub use pairs::*;
pub use reader::*;
