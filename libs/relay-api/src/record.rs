use serde_json::{Map, Value};

/// Normalized row on its way to the warehouse.
///
/// `fields` is what gets appended; `message_id` only follows the record
/// through the pipeline for logging and is never written.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub message_id: String,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(message_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            message_id: message_id.into(),
            fields,
        }
    }

    /// Serialize the row as a single NDJSON line (without trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }
}
