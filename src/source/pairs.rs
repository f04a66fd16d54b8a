//! Existing instruction/response pairs, read from JSONL for re-asking.
//!
//! Accepted line shapes:
//! - `{"conversations": ["<instruction>", "<response>", ...]}`
//! - `{"conversations": [{"value"|"content"|"text": "..."}, {...}, ...]}`
//! - `{"instruction": "...", "response": "..."}`
//!
//! Only the first two turns of a conversation are used.

use crate::models::{PairgenError, Result, SourcePair};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PairLine {
    Conversation { conversations: Vec<Turn> },
    Flat { instruction: String, response: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Turn {
    Text(String),
    Message {
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
}

impl Turn {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Message {
                value,
                content,
                text,
            } => [value, content, text]
                .into_iter()
                .flatten()
                .find(|s| !s.is_empty())
                .unwrap_or_default(),
        }
    }
}

impl PairLine {
    fn into_fields(self) -> Option<(String, String)> {
        match self {
            Self::Flat {
                instruction,
                response,
            } => Some((instruction, response)),
            Self::Conversation { conversations } => {
                let mut turns = conversations.into_iter().map(Turn::into_text);
                Some((turns.next()?, turns.next()?))
            }
        }
    }
}

/// Load every pair in a JSONL file, recording them under `label`.
///
/// An unreadable file is `SourceUnavailable`; a line of unexpected shape is a
/// `ParseError` naming the line. Pairs with an empty side are skipped.
pub fn read_pairs(path: &Path, label: &str) -> Result<Vec<SourcePair>> {
    let unavailable = |reason: String| PairgenError::SourceUnavailable {
        source_label: label.to_string(),
        reason,
    };

    let file = File::open(path).map_err(|e| unavailable(format!("{}: {e}", path.display())))?;
    let reader = BufReader::new(file);
    let mut pairs = Vec::new();
    let mut empty = 0usize;

    for (idx, line) in reader.lines().enumerate() {
        let line_num = idx + 1;
        let line = line.map_err(|e| unavailable(format!("{} line {line_num}: {e}", path.display())))?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: PairLine = serde_json::from_str(&line).map_err(|e| {
            PairgenError::ParseError(format!("{} line {line_num}: {e}", path.display()))
        })?;
        let Some((instruction, response)) = parsed.into_fields() else {
            return Err(PairgenError::ParseError(format!(
                "{} line {line_num}: conversation has fewer than two turns",
                path.display()
            )));
        };

        if instruction.trim().is_empty() || response.trim().is_empty() {
            warn!(line = line_num, "Skipping pair with an empty side");
            empty += 1;
            continue;
        }
        pairs.push(SourcePair::new(label, line_num as u64, instruction, response));
    }

    info!(
        source = label,
        pairs = pairs.len(),
        skipped_empty = empty,
        "Loaded pairs"
    );
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("pairs.jsonl");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_reads_every_shape() {
        let temp = TempDir::new().unwrap();
        let path = write(
            &temp,
            concat!(
                r#"{"conversations": ["Why is the sky blue?", "Rayleigh scattering.", "extra"]}"#,
                "\n\n",
                r#"{"conversations": [{"from": "human", "value": "Hi"}, {"content": "Hello"}]}"#,
                "\n",
                r#"{"instruction": "Name a river.", "response": "The Shannon.", "source": "x"}"#,
                "\n",
            ),
        );

        let pairs = read_pairs(&path, "LIMA").unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], SourcePair::new("LIMA", 1, "Why is the sky blue?", "Rayleigh scattering."));
        assert_eq!(pairs[1].instruction, "Hi");
        assert_eq!(pairs[1].response, "Hello");
        assert_eq!(pairs[1].sequence_index, 3);
        assert_eq!(pairs[2].response, "The Shannon.");
    }

    #[test]
    fn test_skips_empty_and_rejects_bad_lines() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "{\"instruction\": \"  \", \"response\": \"x\"}\n");
        assert!(read_pairs(&path, "LIMA").unwrap().is_empty());

        let path = write(&temp, "{\"conversations\": [\"only one\"]}\n");
        let err = read_pairs(&path, "LIMA").unwrap_err();
        assert!(matches!(err, PairgenError::ParseError(ref m) if m.contains("line 1")));

        let path = write(&temp, "{\"prompt\": \"wrong keys\"}\n");
        assert!(matches!(read_pairs(&path, "LIMA"), Err(PairgenError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let err = read_pairs(&temp.path().join("absent.jsonl"), "LIMA").unwrap_err();
        assert!(matches!(
            err,
            PairgenError::SourceUnavailable { ref source_label, .. } if source_label == "LIMA"
        ));
    }
}
