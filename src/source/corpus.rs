//! Corpus discovery and labeled chunk streams.
//!
//! A corpus is a set of shard files under one directory. Each shard gets a
//! source label inferred from its file name. Shards are streamed lazily and
//! never loaded whole.

use crate::models::{Chunk, PairgenError, Result, SourcesConfig};
use crate::source::ChunkReader;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One file of a labeled corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub label: String,
    pub path: PathBuf,
}

/// Discovers shards and opens chunk streams over them.
#[derive(Debug, Clone)]
pub struct ChunkSource {
    config: SourcesConfig,
    max_chars: Option<usize>,
}

impl ChunkSource {
    pub fn new(config: SourcesConfig, max_chars: Option<usize>) -> Self {
        Self { config, max_chars }
    }

    /// Label for a file name, or `None` when it matches nothing and no
    /// default label is configured.
    pub fn infer_label(&self, file_name: &str) -> Option<String> {
        let lower = file_name.to_lowercase();
        self.config
            .labels
            .iter()
            .find(|(needle, _)| lower.contains(&needle.to_lowercase()))
            .map(|(_, label)| label.clone())
            .or_else(|| self.config.default_label.clone())
    }

    /// Find all shards, in sorted path order.
    pub fn discover(&self) -> Result<Vec<Shard>> {
        let pattern = self.config.dir.join(&self.config.pattern);
        let pattern_str = pattern.to_string_lossy();

        let mut paths: Vec<PathBuf> = glob::glob(&pattern_str)
            .map_err(|e| PairgenError::ParseError(format!("Invalid source pattern: {e}")))?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable source entry");
                    None
                }
            })
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut shards = Vec::with_capacity(paths.len());
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.infer_label(&file_name) {
                Some(label) => shards.push(Shard { label, path }),
                None => warn!(file = %file_name, "No source label for file, dropping"),
            }
        }

        info!(
            dir = %self.config.dir.display(),
            shards = shards.len(),
            "Discovered corpus shards"
        );
        Ok(shards)
    }

    /// Shards grouped by label, each group in sorted path order.
    pub fn shards_by_label(&self) -> Result<BTreeMap<String, Vec<Shard>>> {
        let mut grouped: BTreeMap<String, Vec<Shard>> = BTreeMap::new();
        for shard in self.discover()? {
            grouped.entry(shard.label.clone()).or_default().push(shard);
        }
        Ok(grouped)
    }

    /// Open a lazy chunk stream over one shard.
    pub fn open(&self, shard: &Shard) -> Result<ShardStream> {
        let file = File::open(&shard.path).map_err(|e| PairgenError::SourceUnavailable {
            source_label: shard.label.clone(),
            reason: format!("{}: {e}", shard.path.display()),
        })?;

        Ok(ShardStream {
            label: shard.label.clone(),
            path: shard.path.clone(),
            reader: ChunkReader::new(BufReader::new(file)),
            max_chars: self.max_chars,
            position: 0,
            filtered: 0,
        })
    }

    /// Stream one shard; an unreadable shard yields nothing.
    pub fn stream_shard(&self, shard: &Shard) -> Box<dyn Iterator<Item = Chunk> + Send> {
        match self.open(shard) {
            Ok(stream) => Box::new(stream),
            Err(e) => {
                warn!(error = %e, "Source unavailable, contributing zero chunks");
                Box::new(std::iter::empty())
            }
        }
    }

    /// Stream every shard of a label, one after another.
    pub fn stream(&self, shards: &[Shard]) -> impl Iterator<Item = Chunk> + '_ {
        let shards = shards.to_vec();
        shards.into_iter().flat_map(move |shard| self.stream_shard(&shard))
    }
}

/// Lazy chunk stream over one shard file.
pub struct ShardStream {
    label: String,
    path: PathBuf,
    reader: ChunkReader<BufReader<File>>,
    max_chars: Option<usize>,
    position: u64,
    filtered: u64,
}

impl Iterator for ShardStream {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            let text = match self.reader.next()? {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        source = %self.label,
                        path = %self.path.display(),
                        error = %e,
                        "Read failed, ending shard stream"
                    );
                    return None;
                }
            };

            let index = self.position;
            self.position += 1;

            if self.max_chars.is_some_and(|max| text.chars().count() > max) {
                self.filtered += 1;
                continue;
            }

            return Some(Chunk::new(self.label.clone(), index, text));
        }
    }
}

impl Drop for ShardStream {
    fn drop(&mut self) {
        debug!(
            source = %self.label,
            path = %self.path.display(),
            read = self.position,
            filtered = self.filtered,
            "Shard stream closed"
        );
    }
}

/// Write chunks to a file in the delimiter format, creating parent dirs.
pub fn write_chunks(path: &Path, chunks: &[Chunk]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PairgenError::io("creating output dir", e))?;
    }
    let content = super::join_chunks(chunks.iter().map(|c| c.text.as_str()));
    fs::write(path, content).map_err(|e| PairgenError::io("writing chunk file", e))?;
    debug!(path = %path.display(), chunks = chunks.len(), "Wrote chunk file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(dir: &Path, default_label: Option<&str>, max_chars: Option<usize>) -> ChunkSource {
        let mut labels = BTreeMap::new();
        labels.insert("wiki".to_string(), "Wiki".to_string());
        labels.insert("oireachtas".to_string(), "Oireachtas".to_string());
        ChunkSource::new(
            SourcesConfig {
                dir: dir.to_path_buf(),
                pattern: "*.txt".to_string(),
                labels,
                default_label: default_label.map(String::from),
            },
            max_chars,
        )
    }

    #[test]
    fn test_label_inference() {
        let temp = TempDir::new().unwrap();
        let src = source(temp.path(), None, None);
        assert_eq!(src.infer_label("GAWIKI_part1.txt").as_deref(), Some("Wiki"));
        assert_eq!(src.infer_label("oireachtas_test2.txt").as_deref(), Some("Oireachtas"));
        assert_eq!(src.infer_label("misc.txt"), None);

        let src = source(temp.path(), Some("Wiki"), None);
        assert_eq!(src.infer_label("misc.txt").as_deref(), Some("Wiki"));
    }

    #[test]
    fn test_discover_groups_and_drops_unlabeled() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("wiki_b.txt"), "x").unwrap();
        fs::write(temp.path().join("wiki_a.txt"), "y").unwrap();
        fs::write(temp.path().join("oireachtas.txt"), "z").unwrap();
        fs::write(temp.path().join("unknown.txt"), "w").unwrap();
        fs::write(temp.path().join("wiki.csv"), "ignored").unwrap();

        let grouped = source(temp.path(), None, None).shards_by_label().unwrap();
        assert_eq!(grouped.len(), 2);
        let wiki: Vec<_> = grouped["Wiki"]
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(wiki, vec!["wiki_a.txt", "wiki_b.txt"]);
    }

    #[test]
    fn test_stream_applies_length_filter_and_keeps_positions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wiki.txt");
        fs::write(&path, "short\n\n\nthis one is far too long\n\n\nok").unwrap();

        let src = source(temp.path(), None, Some(5));
        let shard = Shard {
            label: "Wiki".into(),
            path,
        };
        let chunks: Vec<Chunk> = src.stream_shard(&shard).collect();
        assert_eq!(
            chunks,
            vec![Chunk::new("Wiki", 0, "short"), Chunk::new("Wiki", 2, "ok")]
        );
    }

    #[test]
    fn test_unavailable_shard_does_not_stop_others() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("wiki_good.txt");
        fs::write(&good, "one\n\n\ntwo").unwrap();
        let shards = vec![
            Shard {
                label: "Wiki".into(),
                path: temp.path().join("wiki_missing.txt"),
            },
            Shard {
                label: "Wiki".into(),
                path: good,
            },
        ];

        let src = source(temp.path(), None, None);
        assert!(matches!(
            src.open(&shards[0]),
            Err(PairgenError::SourceUnavailable { .. })
        ));
        let texts: Vec<String> = src.stream(&shards).map(|c| c.text).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn test_write_chunks_round_trips_through_stream() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out").join("wiki_test1.txt");
        let chunks = vec![Chunk::new("Wiki", 4, "alpha"), Chunk::new("Wiki", 9, "beta\n\ngamma")];
        write_chunks(&path, &chunks).unwrap();

        let src = source(temp.path(), None, None);
        let shard = Shard {
            label: "Wiki".into(),
            path,
        };
        let texts: Vec<String> = src.stream_shard(&shard).map(|c| c.text).collect();
        assert_eq!(texts, vec!["alpha", "beta\n\ngamma"]);
    }
}
