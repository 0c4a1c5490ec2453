//! Payloads and data conversion.
//!
//! Everything that crosses the workflow boundary (inputs, results, signals, query
//! arguments) travels as an opaque [`Payload`]. A [`DataConverter`] turns typed
//! values into payloads and back. The trait is object safe so it can live in the
//! workflow context; typed callers go through the generic helpers which route via
//! `serde_json::Value`.

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// An opaque serialized value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }
}

/// Serializes and deserializes values by type.
///
/// Implementations only handle the byte representation; typing happens in the
/// generic helpers below, keeping the trait object safe.
pub trait DataConverter {
    fn encode(&self, value: serde_json::Value) -> Result<Payload, DecodeError>;
    fn decode(&self, payload: &Payload) -> Result<serde_json::Value, DecodeError>;
}

/// Encode one typed value.
pub fn to_payload<T: Serialize>(
    converter: &dyn DataConverter,
    value: &T,
) -> Result<Payload, DecodeError> {
    let json = serde_json::to_value(value)?;
    converter.encode(json)
}

/// Decode one typed value.
pub fn from_payload<T: DeserializeOwned>(
    converter: &dyn DataConverter,
    payload: &Payload,
) -> Result<T, DecodeError> {
    let json = converter.decode(payload)?;
    Ok(serde_json::from_value(json)?)
}

/// Encode an argument list into a single payload.
pub fn encode_args(
    converter: &dyn DataConverter,
    args: Vec<serde_json::Value>,
) -> Result<Payload, DecodeError> {
    converter.encode(serde_json::Value::Array(args))
}

/// Decode a payload produced by [`encode_args`].
pub fn decode_args(
    converter: &dyn DataConverter,
    payload: &Payload,
) -> Result<Vec<serde_json::Value>, DecodeError> {
    match converter.decode(payload)? {
        serde_json::Value::Array(values) => Ok(values),
        other => Err(DecodeError::TypeMismatch(format!(
            "expected an argument list, got {other}"
        ))),
    }
}

/// The default converter: payloads are UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDataConverter;

impl DataConverter for JsonDataConverter {
    fn encode(&self, value: serde_json::Value) -> Result<Payload, DecodeError> {
        Ok(Payload(serde_json::to_vec(&value)?))
    }

    fn decode(&self, payload: &Payload) -> Result<serde_json::Value, DecodeError> {
        Ok(serde_json::from_slice(payload.as_bytes())?)
    }
}

pub fn default_data_converter() -> Rc<dyn DataConverter> {
    Rc::new(JsonDataConverter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_values() {
        let conv = JsonDataConverter;
        let payload = to_payload(&conv, &vec![1, 2, 3]).unwrap();
        let back: Vec<i32> = from_payload(&conv, &payload).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn corrupt_payload_is_malformed() {
        let conv = JsonDataConverter;
        let err = conv.decode(&Payload(b"{not json".to_vec())).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn shape_mismatch_is_type_mismatch() {
        let conv = JsonDataConverter;
        let payload = to_payload(&conv, &"a string").unwrap();
        let err = from_payload::<u64>(&conv, &payload).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch(_)));
    }

    #[test]
    fn arg_lists_keep_order() {
        let conv = JsonDataConverter;
        let payload = encode_args(
            &conv,
            vec![serde_json::json!(1), serde_json::json!("two")],
        )
        .unwrap();
        let args = decode_args(&conv, &payload).unwrap();
        assert_eq!(args, vec![serde_json::json!(1), serde_json::json!("two")]);
    }
}
