//! Streaming chunk reader.
//!
//! Chunks are separated by runs of two or more blank lines (the
//! triple-newline convention). A single blank line is a paragraph break and
//! stays inside the chunk. Chunks are trimmed; empty ones are never yielded.
//!
//! Bytes that are not valid UTF-8 are replaced with U+FFFD; the rest of the
//! shard is still read.

use std::io::{self, BufRead};
use tracing::warn;

/// Lazily splits a line-oriented reader into chunk texts.
pub struct ChunkReader<R> {
    reader: R,
    raw: Vec<u8>,
    line_num: usize,
    done: bool,
}

impl<R: BufRead> ChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            raw: Vec::new(),
            line_num: 0,
            done: false,
        }
    }

    /// Next line without its terminator, decoded lossily.
    fn next_line(&mut self) -> Option<io::Result<String>> {
        self.raw.clear();
        match self.reader.read_until(b'\n', &mut self.raw) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }
        self.line_num += 1;

        if self.raw.last() == Some(&b'\n') {
            self.raw.pop();
            if self.raw.last() == Some(&b'\r') {
                self.raw.pop();
            }
        }

        let line = match String::from_utf8_lossy(&self.raw) {
            std::borrow::Cow::Borrowed(text) => text.to_string(),
            std::borrow::Cow::Owned(text) => {
                warn!(line = self.line_num, "Replaced invalid UTF-8 in source line");
                text
            }
        };
        Some(Ok(line))
    }
}

impl<R: BufRead> Iterator for ChunkReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = String::new();
        let mut blank_run = 0usize;

        loop {
            match self.next_line() {
                None => {
                    self.done = true;
                    break;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        blank_run += 1;
                        if blank_run >= 2 && !buf.is_empty() {
                            break;
                        }
                        continue;
                    }

                    if !buf.is_empty() {
                        // blank_run is 0 or 1 here
                        buf.push('\n');
                        if blank_run == 1 {
                            buf.push('\n');
                        }
                    }
                    buf.push_str(&line);
                    blank_run = 0;
                }
            }
        }

        let text = buf.trim();
        if text.is_empty() {
            None
        } else {
            Some(Ok(text.to_string()))
        }
    }
}

/// Join chunk texts back into the delimiter format read by `ChunkReader`.
pub fn join_chunks<'a>(texts: impl IntoIterator<Item = &'a str>) -> String {
    texts.into_iter().collect::<Vec<_>>().join("\n\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunks(input: &str) -> Vec<String> {
        ChunkReader::new(Cursor::new(input))
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_splits_on_blank_line_runs() {
        let input = "first chunk\nline two\n\n\nsecond chunk\n\n\n\n\nthird";
        assert_eq!(chunks(input), vec!["first chunk\nline two", "second chunk", "third"]);
    }

    #[test]
    fn test_single_blank_line_is_paragraph_break() {
        assert_eq!(chunks("para one\n\npara two"), vec!["para one\n\npara two"]);
    }

    #[test]
    fn test_trims_and_drops_empty() {
        let input = "\n\n\n   \n  padded  \n\n\n \n\n\n\n";
        assert_eq!(chunks(input), vec!["padded"]);
        assert!(chunks("").is_empty());
        assert!(chunks("\n\n\n\n").is_empty());
    }

    #[test]
    fn test_handles_crlf() {
        assert_eq!(chunks("a\r\n\r\n\r\nb\r\n"), vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_utf8_keeps_the_rest_of_the_shard() {
        let mut input = b"before\n\n\nbad ".to_vec();
        input.extend_from_slice(&[0xff, 0xfe]);
        input.extend_from_slice(b" byte\n\n\nafter\n\n\nlast".as_slice());

        let texts = ChunkReader::new(Cursor::new(input))
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(texts, vec!["before", "bad \u{fffd}\u{fffd} byte", "after", "last"]);
    }

    #[test]
    fn test_join_reads_back() {
        let texts = ["Tá sé fuar.", "Dia duit\n\nconas atá tú?", "slán"];
        let joined = join_chunks(texts.iter().copied());
        assert_eq!(chunks(&joined), texts);
    }
}
