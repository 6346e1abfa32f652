use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const INGEST_META_TYPE: &str = "azure";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestMeta {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for IngestMeta {
    fn default() -> Self {
        Self {
            kind: INGEST_META_TYPE.to_string(),
        }
    }
}

/// One upload unit: `{"meta": {"type": "azure"}, "data": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub meta: IngestMeta,
    pub data: Vec<Value>,
}

impl IngestBatch {
    pub fn new(data: Vec<Value>) -> Self {
        Self {
            meta: IngestMeta::default(),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Response wrapper used by every job-control endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}
