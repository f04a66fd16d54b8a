//! Deterministic slicing of a sampled set into named, disjoint splits.

use crate::models::{Chunk, Result, SampledSet, SplitSpec};
use crate::source::write_chunks;
use std::path::{Path, PathBuf};
use tracing::info;

/// A named slice of sampled chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub name: String,
    pub chunks: Vec<Chunk>,
}

/// Cut consecutive slices at fixed offsets.
///
/// Slices are taken in the order given. When the sample is shorter than the
/// combined split sizes, the trailing slices come out short or empty.
pub fn split_slices(chunks: &[Chunk], specs: &[SplitSpec]) -> Vec<Split> {
    let mut offset = 0usize;
    specs
        .iter()
        .map(|spec| {
            let start = offset.min(chunks.len());
            let end = offset.saturating_add(spec.size).min(chunks.len());
            offset = offset.saturating_add(spec.size);
            Split {
                name: spec.name.clone(),
                chunks: chunks[start..end].to_vec(),
            }
        })
        .collect()
}

/// Write every label's splits to `<dir>/<label>_<split>.txt`.
///
/// With no split specs the whole sample is written as one `sample` split.
pub fn write_splits(dir: &Path, sampled: &SampledSet, specs: &[SplitSpec]) -> Result<Vec<PathBuf>> {
    let whole = [SplitSpec {
        name: "sample".to_string(),
        size: usize::MAX,
    }];
    let specs = if specs.is_empty() { &whole[..] } else { specs };

    let mut written = Vec::new();
    for (label, chunks) in sampled.iter() {
        for split in split_slices(chunks, specs) {
            let path = dir.join(format!("{label}_{}.txt", split.name));
            write_chunks(&path, &split.chunks)?;
            info!(
                source = label,
                split = %split.name,
                chunks = split.chunks.len(),
                path = %path.display(),
                "Split written"
            );
            written.push(path);
        }
    }
    Ok(written)
}

/// Keep only the named split of every label.
pub fn select_split(sampled: &SampledSet, specs: &[SplitSpec], name: &str) -> SampledSet {
    let mut selected = SampledSet::new();
    for (label, chunks) in sampled.iter() {
        if let Some(split) = split_slices(chunks, specs).into_iter().find(|s| s.name == name) {
            selected.insert(label, split.chunks);
        }
    }
    selected
}
