//! xrpc codec types

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Result;

/// Wire codecs a connection can negotiate
///
/// Adding a codec means a variant here (tag, body encode/decode) plus its
/// frame constructor in the codec table (`protocol::codec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecType {
    /// Newline-delimited JSON header and body values
    Json,
}

impl CodecType {
    /// Parse a handshake tag
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "application/json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Tag sent in the handshake
    #[must_use]
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Json => "application/json",
        }
    }

    /// Encode a body value with this codec
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        match self {
            Self::Json => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }

    /// Decode a body value with this codec
    pub fn decode<T: DeserializeOwned>(self, body: &[u8]) -> Result<T> {
        match self {
            Self::Json => Ok(serde_json::from_slice(body)?),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_tag_roundtrip() {
        let codec = CodecType::Json;
        assert_eq!(CodecType::from_tag(codec.as_tag()), Some(codec));
        assert_eq!(CodecType::from_tag("application/gob"), None);
        assert_eq!(codec.to_string(), "application/json");
    }

    #[test]
    fn test_body_encoding_is_single_line() {
        let body = CodecType::Json
            .encode(&vec!["line\none".to_string(), "two".to_string()])
            .unwrap();
        assert!(!body.contains(&b'\n'));

        let decoded: Vec<String> = CodecType::Json.decode(&body).unwrap();
        assert_eq!(decoded, vec!["line\none".to_string(), "two".to_string()]);
    }
}
