use crate::error::{ChannelError, Result};

/// Fallback serializer for values without a compact wire form, and for
/// faults carried by exception replies.
pub trait ValueSerializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// JSON text, via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl ValueSerializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ChannelError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| ChannelError::Serialization(e.to_string()))
    }
}
