//! Strict extraction of schema fields from free-text replies.
//!
//! Two formats are accepted, tried in order:
//! 1. A JSON object, optionally wrapped in a markdown code fence
//! 2. `<field>value</field>` tags
//!
//! Whatever the format, a missing or empty required field is
//! `MalformedOutput`.

use crate::models::GenerationError;
use crate::provider::{OutputSchema, StructuredResult};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Parse a provider reply into a schema-valid result.
pub fn parse_reply(content: &str, schema: &OutputSchema) -> Result<StructuredResult, GenerationError> {
    let body = strip_code_fence(content);

    let fields = match extract_json(body, schema) {
        Some(fields) => fields,
        None => extract_tags(body, schema),
    };

    let result = StructuredResult::new(fields);
    schema.validate(&result)?;
    Ok(result)
}

/// Remove a surrounding ```` ``` ```` / ```` ```json ```` fence, if any.
pub fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the info string ("json") up to the first newline.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Validate an already-decoded JSON object (e.g. a tool call's input).
pub fn parse_object(
    object: &Map<String, Value>,
    schema: &OutputSchema,
) -> Result<StructuredResult, GenerationError> {
    let result = StructuredResult::new(object_fields(object, schema));
    schema.validate(&result)?;
    Ok(result)
}

fn extract_json(body: &str, schema: &OutputSchema) -> Option<BTreeMap<String, String>> {
    let object = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        // Tolerate prose around a single object.
        _ => {
            let start = body.find('{')?;
            let end = body.rfind('}')?;
            if end <= start {
                return None;
            }
            match serde_json::from_str::<Value>(&body[start..=end]) {
                Ok(Value::Object(map)) => map,
                _ => return None,
            }
        }
    };

    Some(object_fields(&object, schema))
}

fn object_fields(object: &Map<String, Value>, schema: &OutputSchema) -> BTreeMap<String, String> {
    schema
        .fields()
        .iter()
        .filter_map(|field| match object.get(field) {
            Some(Value::String(s)) => Some((field.clone(), s.trim().to_string())),
            _ => None,
        })
        .collect()
}

fn extract_tags(body: &str, schema: &OutputSchema) -> BTreeMap<String, String> {
    schema
        .fields()
        .iter()
        .filter_map(|field| {
            let escaped = regex::escape(field);
            let re = Regex::new(&format!(r"(?s)<{escaped}>(.*?)</{escaped}>")).ok()?;
            let captures = re.captures(body)?;
            captures
                .get(1)
                .map(|m| (field.clone(), m.as_str().trim().to_string()))
        })
        .collect()
}
