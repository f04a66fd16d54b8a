//! Output schema and structured results.

use crate::models::GenerationError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// The exact set of string fields a provider must return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    fields: Vec<String>,
}

impl OutputSchema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The default `instruction` + `response` schema.
    pub fn instruction_response() -> Self {
        Self::new(["instruction", "response"])
    }

    /// Instruction plus two alternative responses, for pair re-asks.
    pub fn pair_variants() -> Self {
        Self::new(["instruction", "response", "response_variant_2"])
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// JSON Schema object for schema-constrained generation.
    ///
    /// Every field is a required string and no other properties are allowed,
    /// which is what strict structured-output modes expect.
    pub fn json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.clone(), json!({ "type": "string" })))
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": self.fields,
            "additionalProperties": false,
        })
    }

    /// Check that every required field is present and non-empty.
    pub fn validate(&self, result: &StructuredResult) -> Result<(), GenerationError> {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| result.get(f).is_none_or(|v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(GenerationError::malformed(format!(
                "missing or empty field(s): {}",
                missing.join(", ")
            )))
        }
    }
}

impl Default for OutputSchema {
    fn default() -> Self {
        Self::instruction_response()
    }
}

/// Field values returned by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub fields: BTreeMap<String, String>,

    /// Model that actually served the request, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl StructuredResult {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self {
            fields,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Build from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
