//! Provider module.
//!
//! Provides:
//! - `ProviderAdapter`: one-attempt structured generation against a backend
//! - `ChatCompletionsAdapter`: OpenAI-compatible HTTP implementation
//! - `MessagesAdapter`: Anthropic Messages implementation (forced tool call)
//! - `RetryPolicy`: bounded retries with a fixed delay
//! - Output schema validation and strict free-text parsing
//! - Prompt rendering from a template

mod adapter;
mod http;
mod messages;
mod parser;
mod render;
mod retry;
mod schema;

pub use adapter::*;
pub use http::*;
pub use messages::*;
pub use parser::*;
pub use render::*;
pub use retry::*;
pub use schema::*;
