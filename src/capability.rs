//! CapabilityDefinition and the SchemaValidator that gates registration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A typed verb a worker offers, identified by `(verb, name)`.
///
/// Core fields are required and typed; everything else the wire sends is preserved
/// in `extra` so unrecognized fields round-trip byte-for-byte through storage,
/// `/capabilities`, `/workers`, and `export_state` (forward compatibility, §3/§9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityDefinition {
    pub name: String,
    pub verb: String,
    pub version: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub requires_gpu: bool,
    pub max_concurrency: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slo: Option<Slo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spiffe_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_tokens_per_invocation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slo_bid: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_affinity: Option<Vec<String>>,

    /// Any field not named above. Flattened so it serializes back out at the top
    /// level rather than nested under a synthetic key.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_p95_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_budget_pct: Option<f64>,
}

impl CapabilityDefinition {
    /// The registry index key: `"verb:name"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.verb, self.name)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// `index` is the offending capability's position in the registration
    /// payload, kept for the log line; `field` is the bare field name and is
    /// what's surfaced on the wire (§8 scenario 6 specifies the literal
    /// `"field":"max_concurrency"`, not an indexed path).
    #[error("field '{field}' is invalid in capabilities[{index}]: {reason}")]
    BadField {
        index: usize,
        field: String,
        reason: String,
    },

    #[error("duplicate capability '{key}' in registration payload")]
    Duplicate { key: String },
}

/// Validates a batch of `CapabilityDefinition`s submitted at registration.
///
/// Stateless; exists as a named component (rather than a free function) because the
/// spec names it as a first-class component with its own rule set, and because a
/// future SLO/identity-aware variant may need configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate every capability in a registration payload.
    ///
    /// Returns the first violation encountered; `BadField::field` is the bare
    /// field name (e.g. `max_concurrency`) and `BadField::index` is the
    /// offending capability's position in the payload.
    pub fn validate_batch(&self, caps: &[CapabilityDefinition]) -> Result<(), ValidationError> {
        let mut seen: HashSet<String> = HashSet::new();

        for (idx, cap) in caps.iter().enumerate() {
            self.validate_one(idx, cap)?;

            let key = cap.key();
            if !seen.insert(key.clone()) {
                return Err(ValidationError::Duplicate { key });
            }
        }

        Ok(())
    }

    fn validate_one(&self, idx: usize, cap: &CapabilityDefinition) -> Result<(), ValidationError> {
        let bad_field = |field: &str, reason: &str| ValidationError::BadField {
            index: idx,
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if cap.name.trim().is_empty() {
            return Err(bad_field("name", "must be non-empty"));
        }
        if cap.verb.trim().is_empty() {
            return Err(bad_field("verb", "must be non-empty"));
        }
        if semver::Version::parse(&cap.version).is_err() {
            return Err(bad_field("version", "must be a parseable semantic version"));
        }
        if !is_syntactically_valid_schema(&cap.input_schema) {
            return Err(bad_field(
                "input_schema",
                "must be a syntactically valid JSON schema",
            ));
        }
        if !is_syntactically_valid_schema(&cap.output_schema) {
            return Err(bad_field(
                "output_schema",
                "must be a syntactically valid JSON schema",
            ));
        }
        if cap.max_concurrency == 0 {
            return Err(bad_field("max_concurrency", "must be a positive integer"));
        }
        if let Some(slo) = &cap.slo {
            if let Some(latency) = slo.latency_p95_ms {
                if latency < 0.0 {
                    return Err(bad_field("slo.latency_p95_ms", "must be non-negative"));
                }
            }
        }
        if let Some(affinity) = &cap.controller_affinity {
            if affinity.iter().any(|s| s.trim().is_empty()) {
                return Err(bad_field(
                    "controller_affinity",
                    "entries must be non-empty strings",
                ));
            }
        }

        Ok(())
    }
}

/// "Syntactically valid JSON schema" per §4.5: a boolean schema, or an object whose
/// `"type"` keyword (if present) names a JSON Schema primitive type. Full keyword
/// semantics (e.g. `$ref` resolution) are out of scope.
fn is_syntactically_valid_schema(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::Object(map) => match map.get("type") {
            None => true,
            Some(Value::String(t)) => matches!(
                t.as_str(),
                "null" | "boolean" | "object" | "array" | "number" | "string" | "integer"
            ),
            Some(Value::Array(types)) => types.iter().all(|t| {
                matches!(
                    t.as_str(),
                    Some("null")
                        | Some("boolean")
                        | Some("object")
                        | Some("array")
                        | Some("number")
                        | Some("string")
                        | Some("integer")
                )
            }),
            Some(_) => false,
        },
        _ => false,
    }
}
