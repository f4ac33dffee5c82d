// ai
//! 📦 Chunks — the unit of cargo that rides through every sluice gate.
//!
//! Byte-mode endpoints count bytes. Object-mode endpoints count items. A chunk
//! doesn't care which one it lands in; the endpoint decides how heavy it is.
//!
//! 🧠 Knowledge graph:
//! - `Bytes` — raw bytes, concatenable, sized by `len()`.
//! - `Text` — a string plus the encoding it should be decoded with when the endpoint
//!   is in byte mode with `decode_strings` on.
//! - `Value` — an opaque JSON value. Object mode only. `null` is rejected upstream.
//!
//! 🦆 The duck is size 1 in object mode. The duck is also size 1 in byte mode, if it's a 'D'.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::Deserialize;

use crate::error::StreamError;

/// 🔡 Text encodings understood when turning `Text` chunks into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
    Hex,
    Base64,
}

impl Encoding {
    /// 🔄 Turn a string into bytes the way this encoding says to.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, StreamError> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            // -- 🪓 ascii and latin1 both keep the low byte of every char; ascii also drops the high bit
            Encoding::Ascii => Ok(text.chars().map(|c| (c as u32 as u8) & 0x7f).collect()),
            Encoding::Latin1 => Ok(text.chars().map(|c| c as u32 as u8).collect()),
            Encoding::Hex => hex::decode(text).map_err(|e| StreamError::InvalidArgValue {
                name: "chunk",
                reason: format!("not valid hex: {e}"),
            }),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| StreamError::InvalidArgValue {
                    name: "chunk",
                    reason: format!("not valid base64: {e}"),
                }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Hex => "hex",
            Encoding::Base64 => "base64",
        }
    }
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "hex" => Ok(Encoding::Hex),
            "base64" => Ok(Encoding::Base64),
            _ => Err(StreamError::UnknownEncoding(raw.to_string())),
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = StreamError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 📦 One unit of data moving through an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Bytes(Vec<u8>),
    Text {
        text: String,
        encoding: Option<Encoding>,
    },
    Value(serde_json::Value),
}

impl Chunk {
    /// 📏 Byte length in byte mode. `Value` has no byte length, it's an object.
    pub fn byte_len(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text { text, .. } => text.len(),
            Chunk::Value(_) => 0,
        }
    }

    /// ⚖️ How much this chunk weighs against a high-water mark.
    pub fn size(&self, object_mode: bool) -> usize {
        if object_mode { 1 } else { self.byte_len() }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Chunk::Text {
            text: text.into(),
            encoding: None,
        }
    }

    pub fn text_with(text: impl Into<String>, encoding: Encoding) -> Self {
        Chunk::Text {
            text: text.into(),
            encoding: Some(encoding),
        }
    }

    /// 🔍 Borrow the bytes if this chunk has them.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Bytes(b) => Some(b),
            Chunk::Text { text, .. } => Some(text.as_bytes()),
            Chunk::Value(_) => None,
        }
    }

    /// 🪄 Lossy peek at the contents as text. Handy for transforms and tests.
    pub fn to_text_lossy(&self) -> String {
        match self {
            Chunk::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Chunk::Text { text, .. } => text.clone(),
            Chunk::Value(v) => v.to_string(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Chunk::Bytes(b) => b,
            Chunk::Text { text, .. } => text.into_bytes(),
            Chunk::Value(v) => v.to_string().into_bytes(),
        }
    }

    /// 🛂 Passport control at the door of a writable side.
    ///
    /// Object mode: anything but `null` goes through as-is.
    /// Byte mode: `Value` is turned away, `Text` becomes bytes when `decode_strings` is on.
    pub(crate) fn normalize(
        self,
        object_mode: bool,
        decode_strings: bool,
        default_encoding: Encoding,
    ) -> Result<Chunk, StreamError> {
        if object_mode {
            if matches!(self, Chunk::Value(serde_json::Value::Null)) {
                return Err(StreamError::NullValues);
            }
            return Ok(self);
        }
        match self {
            Chunk::Value(_) => Err(StreamError::InvalidArgType {
                name: "chunk",
                expected: "of type string or bytes",
            }),
            Chunk::Text { text, encoding } if decode_strings => {
                let encoding = encoding.unwrap_or(default_encoding);
                Ok(Chunk::Bytes(encoding.encode(&text)?))
            }
            other => Ok(other),
        }
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Bytes(bytes)
    }
}

impl From<&[u8]> for Chunk {
    fn from(bytes: &[u8]) -> Self {
        Chunk::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Chunk::text(text)
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::text(text)
    }
}

impl From<serde_json::Value> for Chunk {
    fn from(value: serde_json::Value) -> Self {
        Chunk::Value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_size_depends_on_who_is_asking() {
        let chunk = Chunk::from("four");
        assert_eq!(chunk.size(false), 4);
        assert_eq!(chunk.size(true), 1);
        assert_eq!(Chunk::Value(json!({"a": 1})).size(true), 1);
    }

    #[test]
    fn the_one_where_text_gets_decoded_at_the_door() -> Result<(), StreamError> {
        let hexed = Chunk::text_with("cafe", Encoding::Hex).normalize(false, true, Encoding::Utf8)?;
        assert_eq!(hexed, Chunk::Bytes(vec![0xca, 0xfe]));

        let b64 = Chunk::text("aGk=").normalize(false, true, Encoding::Base64)?;
        assert_eq!(b64, Chunk::Bytes(b"hi".to_vec()));

        let kept = Chunk::text("hi").normalize(false, false, Encoding::Utf8)?;
        assert!(matches!(kept, Chunk::Text { .. }));
        Ok(())
    }

    #[test]
    fn the_one_where_the_bouncer_turns_away_nulls_and_objects() {
        let null = Chunk::Value(serde_json::Value::Null).normalize(true, true, Encoding::Utf8);
        assert!(matches!(null, Err(StreamError::NullValues)));

        let object = Chunk::Value(json!(1)).normalize(false, true, Encoding::Utf8);
        assert_eq!(object.unwrap_err().code(), "ERR_INVALID_ARG_TYPE");
    }

    #[test]
    fn the_one_where_encodings_parse_case_insensitively() {
        assert_eq!("UTF-8".parse::<Encoding>().ok(), Some(Encoding::Utf8));
        assert_eq!("binary".parse::<Encoding>().ok(), Some(Encoding::Latin1));
        let nope = "klingon".parse::<Encoding>();
        assert_eq!(nope.unwrap_err().code(), "ERR_UNKNOWN_ENCODING");
    }
}
