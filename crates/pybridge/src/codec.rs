use std::fmt::Debug;

use crate::host::BoxError;

/// Structured-text encoding used for arguments and results on the wire.
///
/// The guest side of the prelude imports [`Codec::guest_module`] and calls its
/// `dumps`/`loads` functions, so a custom codec must have a guest counterpart
/// with the same name and behaviour.
pub trait Codec: Debug + Send + Sync + 'static {
    /// Encode a structured value to bytes.
    ///
    /// # Errors
    /// Returns an error if the value cannot be represented.
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, BoxError>;

    /// Decode bytes produced by the guest.
    ///
    /// # Errors
    /// Returns an error if the bytes are malformed.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, BoxError>;

    /// Name of the guest module providing `dumps`/`loads`.
    fn guest_module(&self) -> &str;
}

/// Default codec: compact JSON, paired with Python's `json` module.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, BoxError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn guest_module(&self) -> &str {
        "json"
    }
}
