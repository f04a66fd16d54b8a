//! Records flowing through the pipeline.
//!
//! Chunk → SampledSet → GenerationJob → ResultRecord, with RunSummary as the
//! user-visible account of a dispatch run. Existing pairs (`SourcePair`)
//! enter the same flow for re-asking.

use crate::ledger::{Fingerprint, fingerprint, pair_fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A delimiter-bounded unit of source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Label of the corpus this chunk came from
    pub source_label: String,

    /// Position within its shard's stream (0-based)
    pub sequence_index: u64,

    /// Trimmed, non-empty text
    pub text: String,
}

impl Chunk {
    pub fn new(source_label: impl Into<String>, sequence_index: u64, text: impl Into<String>) -> Self {
        Self {
            source_label: source_label.into(),
            sequence_index,
            text: text.into(),
        }
    }

    /// Short human-readable reference, e.g. `Wiki#12`.
    pub fn reference(&self) -> String {
        format!("{}#{}", self.source_label, self.sequence_index)
    }
}

/// Per-label uniform samples.
///
/// Labels iterate in sorted order so that job construction is reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampledSet {
    sets: BTreeMap<String, Vec<Chunk>>,
}

impl SampledSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sample for a label.
    pub fn insert(&mut self, label: impl Into<String>, chunks: Vec<Chunk>) {
        self.sets.insert(label.into(), chunks);
    }

    pub fn get(&self, label: &str) -> Option<&[Chunk]> {
        self.sets.get(label).map(Vec::as_slice)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Chunk])> {
        self.sets.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Total chunks across all labels.
    pub fn total(&self) -> usize {
        self.sets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// An existing instruction/response pair, read from a pair file to be
/// re-asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePair {
    /// Label the pair file is recorded under
    pub source_label: String,

    /// Line number in the pair file (1-based)
    pub sequence_index: u64,

    pub instruction: String,

    pub response: String,
}

impl SourcePair {
    pub fn new(
        source_label: impl Into<String>,
        sequence_index: u64,
        instruction: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            source_label: source_label.into(),
            sequence_index,
            instruction: instruction.into(),
            response: response.into(),
        }
    }

    /// Content hash of the normalized pair; independent of where it was read.
    pub fn fingerprint(&self) -> Fingerprint {
        pair_fingerprint(&self.instruction, &self.response)
    }
}

/// What a job asks a provider about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSubject {
    /// Fresh generation from a sampled chunk
    Chunk(Chunk),
    /// Re-ask of an existing pair
    Pair(SourcePair),
}

impl JobSubject {
    pub fn source_label(&self) -> &str {
        match self {
            Self::Chunk(chunk) => &chunk.source_label,
            Self::Pair(pair) => &pair.source_label,
        }
    }

    /// Short human-readable reference, e.g. `Wiki#12` or `LIMA#3`.
    pub fn reference(&self) -> String {
        match self {
            Self::Chunk(chunk) => chunk.reference(),
            Self::Pair(pair) => format!("{}#{}", pair.source_label, pair.sequence_index),
        }
    }
}

/// One unit of work: a subject sent to one provider for one variant.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub subject: JobSubject,
    pub provider_id: String,
    pub variant_index: u32,
    pub rendered_prompt: String,
}

impl GenerationJob {
    /// The ordered parts that identify this job for dedup and resume.
    ///
    /// A chunk is identified by label and content, not position, so the
    /// same text sampled on another run maps to the same job. A pair is
    /// identified by its content hash alone.
    pub fn identity_parts(&self) -> Vec<String> {
        let mut parts = match &self.subject {
            JobSubject::Chunk(chunk) => vec![chunk.source_label.clone(), chunk.text.clone()],
            JobSubject::Pair(pair) => vec![pair.fingerprint().to_string()],
        };
        parts.push(self.provider_id.clone());
        parts.push(self.variant_index.to_string());
        parts
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(self.identity_parts())
    }
}

/// The pair a re-ask record was generated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairOrigin {
    pub instruction: String,
    pub response: String,
    /// `pair_fingerprint` of the two fields above
    pub hash: Fingerprint,
}

impl From<&SourcePair> for PairOrigin {
    fn from(pair: &SourcePair) -> Self {
        Self {
            instruction: pair.instruction.clone(),
            response: pair.response.clone(),
            hash: pair.fingerprint(),
        }
    }
}

/// A committed generation result. One JSON line in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Fingerprint of the job that produced this record
    pub fingerprint: Fingerprint,

    /// Human-readable id: `<uuid8>-<provider>-<label>-<index>`
    pub run_id: String,

    pub provider_id: String,

    /// Model reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub source_label: String,

    #[serde(default)]
    pub variant_index: u32,

    pub instruction: String,

    pub response: String,

    /// Any schema fields beyond instruction/response (e.g. a second response)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_fields: BTreeMap<String, String>,

    /// Fingerprint of the normalized (instruction, response) pair
    pub content_hash: Fingerprint,

    /// Reference to the chunk or source pair, e.g. `Wiki#12`
    pub raw_chunk_ref: String,

    /// Full chunk text the pair was generated from; empty for re-asks
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_text: String,

    /// Original pair, for re-asks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PairOrigin>,

    pub created_at: DateTime<Utc>,
}

/// Per-(provider, source) counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Jobs considered
    pub sampled: usize,
    /// Jobs whose fingerprint was already committed
    pub skipped_done: usize,
    /// Jobs committed in this run
    pub succeeded: usize,
    /// Jobs that failed after retries and re-asks (eligible next run)
    pub failed_terminal: usize,
    /// Jobs abandoned because the run was cancelled
    pub cancelled: usize,
}

impl JobCounts {
    pub fn absorb(&mut self, other: &JobCounts) {
        self.sampled += other.sampled;
        self.skipped_done += other.skipped_done;
        self.succeeded += other.succeeded;
        self.failed_terminal += other.failed_terminal;
        self.cancelled += other.cancelled;
    }
}

/// Summary of a dispatch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Counters keyed by provider id, then source label
    pub by_provider: BTreeMap<String, BTreeMap<String, JobCounts>>,

    /// Records whose (instruction, response) content already existed
    pub duplicate_content: usize,

    pub runtime_secs: f64,

    /// Committed records per hour
    pub throughput_per_hour: f64,
}

impl RunSummary {
    /// Mutable counters for a (provider, source) cell.
    pub fn counts_mut(&mut self, provider_id: &str, source_label: &str) -> &mut JobCounts {
        self.by_provider
            .entry(provider_id.to_string())
            .or_default()
            .entry(source_label.to_string())
            .or_default()
    }

    pub fn counts(&self, provider_id: &str, source_label: &str) -> JobCounts {
        self.by_provider
            .get(provider_id)
            .and_then(|m| m.get(source_label))
            .copied()
            .unwrap_or_default()
    }

    /// Totals across every provider and source.
    pub fn totals(&self) -> JobCounts {
        let mut total = JobCounts::default();
        for counts in self.by_provider.values().flat_map(|m| m.values()) {
            total.absorb(counts);
        }
        total
    }

    /// Calculate derived stats.
    pub fn finalize(&mut self, runtime_secs: f64) {
        self.runtime_secs = runtime_secs;
        if runtime_secs > 0.0 {
            self.throughput_per_hour = self.totals().succeeded as f64 / runtime_secs * 3600.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampled_set_orders_labels() {
        let mut set = SampledSet::new();
        set.insert("Wiki", vec![Chunk::new("Wiki", 0, "a")]);
        set.insert("Oireachtas", vec![Chunk::new("Oireachtas", 3, "b"), Chunk::new("Oireachtas", 5, "c")]);
        assert_eq!(set.labels().collect::<Vec<_>>(), vec!["Oireachtas", "Wiki"]);
        assert_eq!(set.total(), 3);
    }

    #[test]
    fn test_summary_totals() {
        let mut summary = RunSummary::default();
        summary.counts_mut("a", "Wiki").succeeded += 2;
        summary.counts_mut("b", "Wiki").failed_terminal += 1;
        summary.counts_mut("b", "Oireachtas").succeeded += 1;
        let totals = summary.totals();
        assert_eq!(totals.succeeded, 3);
        assert_eq!(totals.failed_terminal, 1);
        assert_eq!(summary.counts("b", "Oireachtas").succeeded, 1);
        assert_eq!(summary.counts("missing", "Wiki"), JobCounts::default());
    }

    fn job(subject: JobSubject, variant_index: u32) -> GenerationJob {
        GenerationJob {
            subject,
            provider_id: "p".into(),
            variant_index,
            rendered_prompt: String::new(),
        }
    }

    #[test]
    fn test_identity_ignores_position() {
        let chunk = |idx| JobSubject::Chunk(Chunk::new("Wiki", idx, "text"));
        assert_eq!(job(chunk(1), 0).identity_parts(), job(chunk(9), 0).identity_parts());
        assert_eq!(job(chunk(1), 0).fingerprint(), job(chunk(9), 0).fingerprint());
    }

    #[test]
    fn test_pair_identity_is_the_pair_hash() {
        let a = SourcePair::new("LIMA", 3, "What is rust?", "A language.");
        let b = SourcePair::new("other", 90, "  What is rust?\n", "A language. ");
        assert_eq!(a.fingerprint(), pair_fingerprint("What is rust?", "A language."));
        assert_eq!(a.fingerprint(), b.fingerprint());

        let pa = job(JobSubject::Pair(a.clone()), 0);
        assert_eq!(pa.identity_parts()[0], a.fingerprint().to_string());
        assert_eq!(pa.fingerprint(), job(JobSubject::Pair(b), 0).fingerprint());
        assert_ne!(pa.fingerprint(), job(JobSubject::Pair(a.clone()), 1).fingerprint());

        // A chunk whose text happens to equal the hash is a different job
        let chunk = Chunk::new("LIMA", 3, a.fingerprint().to_string());
        assert_ne!(pa.fingerprint(), job(JobSubject::Chunk(chunk), 0).fingerprint());
        assert_eq!(JobSubject::Pair(a).reference(), "LIMA#3");
    }
}
