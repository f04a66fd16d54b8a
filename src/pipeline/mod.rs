//! Pipeline module - dispatch of generation jobs to provider pools.

mod dispatcher;
mod pool;

pub use dispatcher::*;
pub use pool::*;
