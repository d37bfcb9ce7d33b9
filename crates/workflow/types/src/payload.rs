//! Payloads exchanged between clients, workflows and activities

use crate::Failure;
use serde::{de::DeserializeOwned, Serialize};

/// Opaque value carried by inputs, results, signals and markers
pub type Payload = serde_json::Value;

/// Error type reported when a payload cannot be converted
pub const SERIALIZATION_ERROR: &str = "SerializationError";

/// Convert a typed value into a payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Payload, Failure> {
    serde_json::to_value(value).map_err(|e| {
        Failure::non_retryable(SERIALIZATION_ERROR, format!("failed to encode payload: {}", e))
    })
}

/// Convert a payload back into a typed value.
pub fn decode<T: DeserializeOwned>(payload: &Payload) -> Result<T, Failure> {
    T::deserialize(payload).map_err(|e| {
        Failure::non_retryable(SERIALIZATION_ERROR, format!("failed to decode payload: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_mismatch_is_non_retryable() {
        let payload = encode(&"World").unwrap();
        let failure = decode::<u32>(&payload).unwrap_err();
        assert!(failure.is_non_retryable());
        assert_eq!(failure.error_type(), Some(SERIALIZATION_ERROR));
    }

    #[test]
    fn tuples_encode_as_arrays() {
        let payload = encode(&("Hello", "World")).unwrap();
        assert_eq!(payload, serde_json::json!(["Hello", "World"]));
        let (greeting, name): (String, String) = decode(&payload).unwrap();
        assert_eq!(format!("{} {}!", greeting, name), "Hello World!");
    }
}
