//! Prompt rendering.

use crate::models::{JobSubject, PairgenError, Result};
use std::borrow::Cow;
use std::path::Path;

/// Placeholders that carry subject content; a template needs at least one.
const CONTENT_PLACEHOLDERS: [&str; 3] = ["{TEXT}", "{INSTRUCTION}", "{RESPONSE}"];

/// Turns a job subject into the prompt sent to providers.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, subject: &JobSubject, variant_index: u32) -> String;
}

/// Plain-text template.
///
/// Placeholders:
/// - `{TEXT}`: chunk text, or for a pair the instruction and response
///   separated by a blank line
/// - `{INSTRUCTION}`, `{RESPONSE}`: the pair's fields (empty for chunks)
/// - `{SOURCE}`: source label
/// - `{VARIANT}`: variant index
///
/// Substitution is a single left-to-right pass, so placeholder-like text
/// inside the subject is kept literally.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    template: String,
}

impl TemplateRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path)
            .map_err(|e| PairgenError::io(format!("reading prompt template {}", path.display()), e))?;
        if !CONTENT_PLACEHOLDERS.iter().any(|p| template.contains(p)) {
            return Err(PairgenError::ParseError(format!(
                "prompt template {} has none of {}",
                path.display(),
                CONTENT_PLACEHOLDERS.join(", ")
            )));
        }
        Ok(Self::new(template))
    }
}

impl PromptRenderer for TemplateRenderer {
    fn render(&self, subject: &JobSubject, variant_index: u32) -> String {
        let variant = variant_index.to_string();
        substitute(&self.template, |name| match (name, subject) {
            ("SOURCE", _) => Some(Cow::Borrowed(subject.source_label())),
            ("VARIANT", _) => Some(Cow::Borrowed(variant.as_str())),
            ("TEXT", JobSubject::Chunk(chunk)) => Some(Cow::Borrowed(chunk.text.as_str())),
            ("TEXT", JobSubject::Pair(pair)) => {
                Some(Cow::Owned(format!("{}\n\n{}", pair.instruction, pair.response)))
            }
            ("INSTRUCTION", JobSubject::Pair(pair)) => Some(Cow::Borrowed(pair.instruction.as_str())),
            ("RESPONSE", JobSubject::Pair(pair)) => Some(Cow::Borrowed(pair.response.as_str())),
            ("INSTRUCTION" | "RESPONSE", JobSubject::Chunk(_)) => Some(Cow::Borrowed("")),
            _ => None,
        })
    }
}

/// Replace `{NAME}` occurrences for which `lookup` has a value; anything else
/// is copied through.
fn substitute<'a>(template: &str, lookup: impl Fn(&str) -> Option<Cow<'a, str>>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after
            .find('}')
            .and_then(|close| lookup(&after[..close]).map(|v| (v, close)));

        match value {
            Some((value, close)) => {
                out.push_str(&value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, SourcePair};
    use tempfile::TempDir;

    #[test]
    fn test_render_placeholders() {
        let renderer = TemplateRenderer::new("[{SOURCE}/{VARIANT}] {JSON}\n{TEXT}");
        let chunk = JobSubject::Chunk(Chunk::new("Wiki", 3, "Is cathair í Corcaigh {SOURCE}."));
        assert_eq!(
            renderer.render(&chunk, 1),
            "[Wiki/1] {JSON}\nIs cathair í Corcaigh {SOURCE}."
        );
    }

    #[test]
    fn test_render_pair() {
        let renderer = TemplateRenderer::new("Aistrigh:\ninstruction_en: {INSTRUCTION}\nresponse_en: {RESPONSE}");
        let pair = JobSubject::Pair(SourcePair::new("LIMA", 1, "Say {RESPONSE}", "Hello"));
        assert_eq!(
            renderer.render(&pair, 0),
            "Aistrigh:\ninstruction_en: Say {RESPONSE}\nresponse_en: Hello"
        );
        assert_eq!(TemplateRenderer::new("{TEXT}").render(&pair, 0), "Say {RESPONSE}\n\nHello");
    }

    #[test]
    fn test_from_file_requires_content_placeholder() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("good.txt");
        let pair = temp.path().join("pair.txt");
        let bad = temp.path().join("bad.txt");
        std::fs::write(&good, "Read this: {TEXT}").unwrap();
        std::fs::write(&pair, "Translate: {INSTRUCTION} / {RESPONSE}").unwrap();
        std::fs::write(&bad, "No placeholder {SOURCE}").unwrap();

        assert!(TemplateRenderer::from_file(&good).is_ok());
        assert!(TemplateRenderer::from_file(&pair).is_ok());
        assert!(matches!(
            TemplateRenderer::from_file(&bad),
            Err(PairgenError::ParseError(_))
        ));
        assert!(matches!(
            TemplateRenderer::from_file(&temp.path().join("missing.txt")),
            Err(PairgenError::Io { .. })
        ));
    }
}
