//! Normalized tool results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on the text handed to the model for one tool call.
pub const MAX_MODEL_TEXT: usize = 2000;

/// Rows rendered into the model summary of a tabular result.
const PREVIEW_ROWS: usize = 5;

/// Envelope format version returned to callers.
pub const ENVELOPE_VERSION: &str = "1";

/// Raw output of a tool call, as reported by the tool server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawToolOutput {
    /// Text content blocks, in order.
    pub text: Vec<String>,
    /// Structured content, when the server provides it.
    pub structured: Option<Value>,
    pub is_error: bool,
}

/// A typed payload for display surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DisplayPayload {
    Table { columns: Vec<String>, rows: Vec<Value> },
    Markdown { text: String },
    Json { value: Value },
}

/// A full tool result kept out of the model's context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Short summary given to the model.
    pub model_text: String,
    #[serde(default)]
    pub display: Vec<DisplayPayload>,
    /// Structured data, when the output parsed as JSON.
    #[serde(default)]
    pub data: Option<Value>,
    /// Latency, row counts and similar facts.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// What a caller receives in place of the full result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEnvelope {
    pub artifact_id: String,
    pub model_text: String,
    pub version: String,
}

impl ToolEnvelope {
    pub fn new(artifact_id: String, model_text: String) -> Self {
        Self {
            artifact_id,
            model_text,
            version: ENVELOPE_VERSION.to_string(),
        }
    }
}

impl ResourceRecord {
    /// A plain-text record.
    pub fn text(text: &str) -> Self {
        Self {
            model_text: truncate(text, MAX_MODEL_TEXT),
            display: vec![DisplayPayload::Markdown {
                text: text.to_string(),
            }],
            data: None,
            metadata: Map::new(),
        }
    }

    /// Coerce raw tool output into a record: structured data when it parses,
    /// text otherwise.
    pub fn from_raw(raw: &RawToolOutput) -> Self {
        let joined = raw.text.join("\n");
        let data = raw.structured.clone().or_else(|| {
            serde_json::from_str::<Value>(joined.trim())
                .ok()
                .filter(|v| v.is_object() || v.is_array())
        });

        let mut record = match data {
            Some(Value::Array(rows)) if !rows.is_empty() && rows.iter().all(Value::is_object) => {
                Self::table(rows)
            }
            Some(value) => {
                let compact = value.to_string();
                Self {
                    model_text: truncate(&compact, MAX_MODEL_TEXT),
                    display: vec![DisplayPayload::Json {
                        value: value.clone(),
                    }],
                    data: Some(value),
                    metadata: Map::new(),
                }
            }
            None => Self::text(&joined),
        };

        if raw.is_error {
            record.model_text = truncate(
                &format!("Tool error: {}", record.model_text),
                MAX_MODEL_TEXT,
            );
            record.metadata.insert("is_error".to_string(), Value::Bool(true));
        }
        record
    }

    fn table(rows: Vec<Value>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            if let Some(obj) = row.as_object() {
                for key in obj.keys() {
                    if !columns.iter().any(|c| c == key) {
                        columns.push(key.clone());
                    }
                }
            }
        }

        let mut summary = format!("{} rows (columns: {})", rows.len(), columns.join(", "));
        for row in rows.iter().take(PREVIEW_ROWS) {
            summary.push('\n');
            summary.push_str(&row.to_string());
        }
        if rows.len() > PREVIEW_ROWS {
            summary.push_str(&format!("\n... {} more rows", rows.len() - PREVIEW_ROWS));
        }

        let mut metadata = Map::new();
        metadata.insert("row_count".to_string(), Value::from(rows.len()));

        let data = Value::Array(rows.clone());
        Self {
            model_text: truncate(&summary, MAX_MODEL_TEXT),
            display: vec![DisplayPayload::Table { columns, rows }],
            data: Some(data),
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Truncate on a char boundary, appending an ellipsis when shortened.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
