use flate2::{Compression, write::GzEncoder};
use serde_json::Value;
use std::io::Write;
use thiserror::Error;

use crate::domain::IngestBatch;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gzip compression failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes collected records as gzip-compressed ingest documents.
#[derive(Debug, Clone)]
pub struct IngestSerializer {
    level: Compression,
}

impl Default for IngestSerializer {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl IngestSerializer {
    pub fn new(level: Compression) -> Self {
        Self { level }
    }

    pub fn encode(&self, data: Vec<Value>) -> Result<Vec<u8>, SerializationError> {
        self.encode_batch(&IngestBatch::new(data))
    }

    pub fn encode_batch(&self, batch: &IngestBatch) -> Result<Vec<u8>, SerializationError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        serde_json::to_writer(&mut encoder, batch)?;
        encoder.write_all(b"\n")?;
        Ok(encoder.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;

    #[test]
    fn encodes_meta_and_data_as_gzip_json() {
        let serializer = IngestSerializer::default();
        let compressed = serializer
            .encode(vec![json!({"kind": "AZUser", "id": "u1"}), json!({"kind": "AZGroup"})])
            .unwrap();

        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        let value: Value = serde_json::from_str(&decoded).unwrap();

        assert_eq!(value["meta"], json!({"type": "azure"}));
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
        assert_eq!(value["data"][0]["id"], "u1");
    }

    #[test]
    fn empty_batch_still_encodes() {
        let compressed = IngestSerializer::new(Compression::fast()).encode(Vec::new()).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
    }
}
