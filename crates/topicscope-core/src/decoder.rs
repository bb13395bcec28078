//! Record decoding.
//!
//! A [`Decoder`] turns the raw key/value bytes of a broker record into
//! displayable text. The consumer job only sees the trait object; schema-aware
//! decoders plug in through the same seam.

use serde::{Deserialize, Serialize};

use crate::broker::RawRecord;
use crate::error::DecodeError;

/// Placeholder stored in place of a payload that failed to decode.
pub const UNDECODABLE_PAYLOAD: &str = "<undecodable>";

/// Decoded key and payload of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedRecord {
    pub key: Option<String>,
    pub payload: Option<String>,
}

/// Decoding capability.
pub trait Decoder: Send + Sync {
    fn decode(&self, record: &RawRecord) -> Result<DecodedRecord, DecodeError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

fn utf8(field: &'static str, bytes: Option<&[u8]>) -> Result<Option<String>, DecodeError> {
    bytes
        .map(|b| {
            std::str::from_utf8(b)
                .map(str::to_owned)
                .map_err(|e| DecodeError::InvalidUtf8 {
                    field,
                    valid_up_to: e.valid_up_to(),
                })
        })
        .transpose()
}

/// Key and payload as UTF-8 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Decoder;

impl Decoder for Utf8Decoder {
    fn decode(&self, record: &RawRecord) -> Result<DecodedRecord, DecodeError> {
        Ok(DecodedRecord {
            key: utf8("key", record.key.as_deref())?,
            payload: utf8("payload", record.payload.as_deref())?,
        })
    }

    fn name(&self) -> &'static str {
        "utf8"
    }
}

/// UTF-8 key, JSON payload re-rendered in pretty form.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, record: &RawRecord) -> Result<DecodedRecord, DecodeError> {
        let key = utf8("key", record.key.as_deref())?;
        let payload = record
            .payload
            .as_deref()
            .map(|bytes| {
                let value: serde_json::Value = serde_json::from_slice(bytes)
                    .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
                serde_json::to_string_pretty(&value)
                    .map_err(|e| DecodeError::InvalidJson(e.to_string()))
            })
            .transpose()?;
        Ok(DecodedRecord { key, payload })
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Built-in decoders selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    #[default]
    Utf8,
    Json,
}

impl DecoderKind {
    #[must_use]
    pub fn build(self) -> Box<dyn Decoder> {
        match self {
            Self::Utf8 => Box::new(Utf8Decoder),
            Self::Json => Box::new(JsonDecoder),
        }
    }
}
