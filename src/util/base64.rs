use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine as _;
use serde::{Deserialize, Deserializer, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeBase64Error;

impl fmt::Display for DecodeBase64Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to decode base64 string")
    }
}

impl std::error::Error for DecodeBase64Error {}

/// Encode bytes with the standard padded alphabet.
pub fn base64_encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode into raw bytes. Missing padding is tolerated.
pub fn base64_decode_bytes(input: &str) -> Result<Vec<u8>, DecodeBase64Error> {
    let mut normalized = input.trim().to_owned();
    let remainder = normalized.len() % 4;
    if remainder != 0 {
        normalized.extend("====".chars().take(4 - remainder));
    }
    STANDARD
        .decode(normalized.as_bytes())
        .map_err(|_err| DecodeBase64Error)
}

/// Serde adapter that renders opaque byte tokens as base64 strings.
///
/// Use with `#[serde(with = "crate::util::base64")]`.
pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64_encode_bytes(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    base64_decode_bytes(&raw).map_err(serde::de::Error::custom)
}
