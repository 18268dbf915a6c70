use crate::Payload;
use serde::{Serialize, de::DeserializeOwned};

/// Conversion between typed values and payloads.
pub trait Codec {
    fn encode<T: Serialize>(v: &T) -> Result<Payload, String>;
    fn decode<T: DeserializeOwned>(p: &Payload) -> Result<T, String>;
}

pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(v: &T) -> Result<Payload, String> {
        serde_json::to_value(v).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(p: &Payload) -> Result<T, String> {
        serde_json::from_value(p.clone()).map_err(|e| format!("decode: {e}"))
    }
}

/// Decode a handler argument list as one typed value (a tuple decodes from the array).
pub(crate) fn decode_args<T: DeserializeOwned>(args: Vec<Payload>) -> Result<T, String> {
    Json::decode(&Payload::Array(args))
}
