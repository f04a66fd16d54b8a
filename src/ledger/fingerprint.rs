//! Content-addressed job fingerprints.
//!
//! A fingerprint is the lowercase hex SHA-256 of the normalized parts joined
//! by U+001E. Normalization trims surrounding whitespace, applies Unicode
//! NFC and removes U+001E, so the separator never occurs inside a part.
//! The value is a pure function of the text and is stable across restarts
//! and implementations.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Record separator used between normalized parts.
pub const PART_SEPARATOR: char = '\u{1e}';

/// 64-character lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, for logs and run ids.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of one part.
pub fn normalize(part: &str) -> String {
    let composed: String = part
        .trim()
        .nfc()
        .filter(|c| *c != PART_SEPARATOR)
        .collect();
    composed.trim().to_string()
}

/// Fingerprint an ordered sequence of parts.
pub fn fingerprint<I, S>(parts: I) -> Fingerprint
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4];
    let separator = PART_SEPARATOR.encode_utf8(&mut buf);

    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update(separator.as_bytes());
        }
        hasher.update(normalize(part.as_ref()).as_bytes());
    }

    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of an (instruction, response) pair, used for content dedup.
pub fn pair_fingerprint(instruction: &str, response: &str) -> Fingerprint {
    fingerprint([instruction, response])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_and_fixed_length() {
        let a = fingerprint(["Wiki", "Tá an lá go breá.", "gpt-5", "0"]);
        let b = fingerprint(["Wiki", "Tá an lá go breá.", "gpt-5", "0"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_known_digests() {
        // sha256("a\x1eb")
        assert_eq!(
            pair_fingerprint(" a ", "b\n").as_str(),
            "d30a11ae896cfd9828c66c826156c80a42e6c401f767ced8dcde831b7a729bdc"
        );
        assert_eq!(
            pair_fingerprint("Dia duit", "Conas atá tú?").as_str(),
            "03eb530f4fa718797da9ab6a3220561e789ba62af3c2b80bbdf5db9ac7b88e64"
        );
    }

    #[test]
    fn test_whitespace_and_composition_do_not_matter() {
        // "á" precomposed vs "a" + combining acute
        let composed = fingerprint(["  B\u{e1}ile  ", "x"]);
        let decomposed = fingerprint(["Ba\u{301}ile\n", "x"]);
        assert_eq!(composed, decomposed);
    }

    #[test]
    fn test_part_boundaries_matter() {
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
        assert_ne!(fingerprint(["a", "b"]), fingerprint(["b", "a"]));
        assert_ne!(fingerprint(["a"]), fingerprint(["a", ""]));
    }

    #[test]
    fn test_separator_is_stripped_from_parts() {
        assert_eq!(normalize("a\u{1e}b"), "ab");
        assert_eq!(fingerprint(["a\u{1e}", "b"]), fingerprint(["a", "b"]));
    }
}
