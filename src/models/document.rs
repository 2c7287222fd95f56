use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An uploaded document. `display_name` is plaintext in memory and
/// ciphertext at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Assigned by the store on create.
    pub id: i64,
    pub user_id: i64,
    pub display_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub redaction_schema: RedactionSchema,
}

/// How a document (or one detected entity) is to be redacted.
///
/// Fields this crate does not model are kept in `extra` so a schema written
/// by a newer client survives a read-modify-write cycle unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedactionSchema {
    #[serde(default)]
    pub rules: Vec<RedactionRule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionRule {
    /// What the rule targets, e.g. "email" or "iban".
    pub label: String,
    pub action: RedactionAction,
    #[serde(default)]
    pub spans: Vec<TextSpan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RedactionAction {
    Mask {
        #[serde(default = "default_mask")]
        character: char,
    },
    Remove,
    Replace {
        with: String,
    },
}

fn default_mask() -> char {
    '█'
}

/// A character range on one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub page: u32,
    pub start: u32,
    pub end: u32,
}

impl RedactionSchema {
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// A sensitive entity found in a document by a detection method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEntity {
    /// Assigned by the store on insert.
    pub id: i64,
    pub document_id: i64,
    pub method_id: i64,
    /// Resolved from `detection_methods` on read; ignored on insert.
    #[serde(default)]
    pub method_name: Option<String>,
    pub entity_name: String,
    pub redaction_schema: RedactionSchema,
    pub detected_at: DateTime<Utc>,
}

/// A row of the read-only detection method lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionMethod {
    pub id: i64,
    pub name: String,
}

/// Document header plus the number of entities detected in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: i64,
    pub display_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub entity_count: i64,
}
