//! pairgen - Resumable instruction-response corpus generation.
//!
//! ## Architecture
//!
//! Text chunks are streamed from labeled corpora, sampled uniformly per
//! label, and sent to several generation providers. Every completed job is
//! appended to a ledger keyed by a content fingerprint, so an interrupted
//! run can be restarted without repeating or losing work.
//!
//! ## Stages
//!
//! - **Source**: delimiter-separated chunks from labeled shard files
//! - **Sampling**: parallel per-shard reservoirs merged into one uniform sample
//! - **Dispatch**: chunks × providers × variants, bounded per provider,
//!   with retries and re-asks
//! - **Re-ask**: existing pairs from JSONL sent through the same dispatch
//! - **Ledger**: append-only JSONL, the single record of what is done
//!
//! ## Failure model
//!
//! - Unreadable sources contribute nothing; other sources continue
//! - Provider failures are retried, then the job is skipped until next run
//! - Ledger write failures stop the run

pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod sampling;
pub mod source;

// Re-exports for convenience
pub use ledger::{Fingerprint, Ledger, fingerprint};
pub use models::{
    Chunk, Config, GenerationError, JobSubject, PairgenError, Result, ResultRecord, RunSummary,
    SampledSet, SourcePair,
};
pub use pipeline::{DispatchOptions, Dispatcher, ProviderPool};
pub use provider::{OutputSchema, ProviderAdapter, RetryPolicy, StructuredResult, TemplateRenderer};
pub use sampling::{ReservoirSampler, sample_corpus};
pub use source::{ChunkSource, read_pairs};
