//! Message encoders selected by the preamble content type.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use duplexwire_frame::{decode_varint, encode_varint};
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageHeaders, MessageProperties};

/// Content type of [`BinaryMessageEncoder`].
pub const BINARY_CONTENT_TYPE: &str = "application/x-duplexwire-binary";

/// Content type of [`JsonMessageEncoder`].
pub const JSON_CONTENT_TYPE: &str = "application/json";

const BINARY_FORMAT: u8 = 0x01;
const FLAG_MESSAGE_ID: u8 = 0b001;
const FLAG_RELATES_TO: u8 = 0b010;
const FLAG_FAULT: u8 = 0b100;
const KNOWN_FLAGS: u8 = FLAG_MESSAGE_ID | FLAG_RELATES_TO | FLAG_FAULT;

/// Errors from message encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message body is not valid UTF-8")]
    NonUtf8Body,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame error: {0}")]
    Frame(#[from] duplexwire_frame::FrameError),
}

/// Converts between messages and envelope payloads.
pub trait MessageEncoder: Send + Sync {
    /// The content-type token this encoder answers to.
    fn content_type(&self) -> &str;

    /// Append the encoded message to `dst`.
    fn encode(&self, message: &Message, dst: &mut Vec<u8>) -> Result<(), EncodingError>;

    /// Decode one envelope payload.
    fn decode(&self, payload: Bytes) -> Result<Message, EncodingError>;
}

/// Compact binary layout:
///
/// ```text
/// [0x01][flags][varint len][action][varint len][to][u64 LE id?][u64 LE relates-to?][body...]
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryMessageEncoder;

impl MessageEncoder for BinaryMessageEncoder {
    fn content_type(&self) -> &str {
        BINARY_CONTENT_TYPE
    }

    fn encode(&self, message: &Message, dst: &mut Vec<u8>) -> Result<(), EncodingError> {
        let headers = &message.headers;
        let mut flags = 0u8;
        if headers.message_id.is_some() {
            flags |= FLAG_MESSAGE_ID;
        }
        if headers.relates_to.is_some() {
            flags |= FLAG_RELATES_TO;
        }
        if headers.fault {
            flags |= FLAG_FAULT;
        }

        dst.reserve(2 + headers.action.len() + headers.to.len() + 26 + message.body.len());
        dst.put_u8(BINARY_FORMAT);
        dst.put_u8(flags);
        encode_varint(headers.action.len(), dst)?;
        dst.put_slice(headers.action.as_bytes());
        encode_varint(headers.to.len(), dst)?;
        dst.put_slice(headers.to.as_bytes());
        if let Some(id) = headers.message_id {
            dst.put_u64_le(id);
        }
        if let Some(id) = headers.relates_to {
            dst.put_u64_le(id);
        }
        dst.put_slice(&message.body);
        Ok(())
    }

    fn decode(&self, mut payload: Bytes) -> Result<Message, EncodingError> {
        if payload.len() < 2 {
            return Err(malformed("truncated header"));
        }
        let format = payload.get_u8();
        if format != BINARY_FORMAT {
            return Err(malformed(format!("unknown format byte 0x{format:02x}")));
        }
        let flags = payload.get_u8();
        if flags & !KNOWN_FLAGS != 0 {
            return Err(malformed(format!("unknown flags 0x{flags:02x}")));
        }

        let action = take_string(&mut payload, "action")?;
        let to = take_string(&mut payload, "to")?;
        let message_id = take_id(&mut payload, flags & FLAG_MESSAGE_ID != 0, "message id")?;
        let relates_to = take_id(&mut payload, flags & FLAG_RELATES_TO != 0, "relates-to")?;

        Ok(Message {
            headers: MessageHeaders {
                action,
                to,
                message_id,
                relates_to,
                fault: flags & FLAG_FAULT != 0,
            },
            body: payload,
            properties: MessageProperties::default(),
        })
    }
}

fn take_string(payload: &mut Bytes, field: &str) -> Result<String, EncodingError> {
    let (len, used) = decode_varint(payload)?
        .ok_or_else(|| malformed(format!("truncated {field} length")))?;
    let len = len as usize;
    if payload.len() < used + len {
        return Err(malformed(format!("truncated {field}")));
    }
    payload.advance(used);
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| malformed(format!("{field} is not UTF-8")))
}

fn take_id(payload: &mut Bytes, present: bool, field: &str) -> Result<Option<u64>, EncodingError> {
    if !present {
        return Ok(None);
    }
    if payload.len() < 8 {
        return Err(malformed(format!("truncated {field}")));
    }
    Ok(Some(payload.get_u64_le()))
}

fn malformed(reason: impl Into<String>) -> EncodingError {
    EncodingError::Malformed(reason.into())
}

/// Text layout: headers as JSON fields plus a UTF-8 `body` string.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageEncoder;

#[derive(Serialize, Deserialize)]
struct JsonEnvelope<'a> {
    action: std::borrow::Cow<'a, str>,
    #[serde(default, skip_serializing_if = "str::is_empty")]
    to: std::borrow::Cow<'a, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relates_to: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    fault: bool,
    #[serde(default)]
    body: std::borrow::Cow<'a, str>,
}

impl MessageEncoder for JsonMessageEncoder {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, message: &Message, dst: &mut Vec<u8>) -> Result<(), EncodingError> {
        let body = std::str::from_utf8(&message.body).map_err(|_| EncodingError::NonUtf8Body)?;
        let wire = JsonEnvelope {
            action: message.headers.action.as_str().into(),
            to: message.headers.to.as_str().into(),
            message_id: message.headers.message_id,
            relates_to: message.headers.relates_to,
            fault: message.headers.fault,
            body: body.into(),
        };
        serde_json::to_writer(dst, &wire)?;
        Ok(())
    }

    fn decode(&self, payload: Bytes) -> Result<Message, EncodingError> {
        let wire: JsonEnvelope<'_> = serde_json::from_slice(&payload)?;
        Ok(Message {
            headers: MessageHeaders {
                action: wire.action.into_owned(),
                to: wire.to.into_owned(),
                message_id: wire.message_id,
                relates_to: wire.relates_to,
                fault: wire.fault,
            },
            body: Bytes::from(wire.body.into_owned()),
            properties: MessageProperties::default(),
        })
    }
}

/// Content-type token to encoder, with a default for empty tokens.
#[derive(Clone)]
pub struct EncoderRegistry {
    encoders: Vec<Arc<dyn MessageEncoder>>,
    default_index: usize,
}

impl EncoderRegistry {
    /// Binary (default) and JSON encoders.
    pub fn new() -> Self {
        Self {
            encoders: vec![
                Arc::new(BinaryMessageEncoder),
                Arc::new(JsonMessageEncoder),
            ],
            default_index: 0,
        }
    }

    /// Add or replace the encoder for its content type.
    pub fn register(mut self, encoder: Arc<dyn MessageEncoder>) -> Self {
        match self.position(encoder.content_type()) {
            Some(index) => self.encoders[index] = encoder,
            None => self.encoders.push(encoder),
        }
        self
    }

    /// Make the encoder for `content_type` the default. Unknown tokens leave
    /// the default unchanged.
    pub fn with_default(mut self, content_type: &str) -> Self {
        if let Some(index) = self.position(content_type) {
            self.default_index = index;
        }
        self
    }

    /// Look up an encoder; an empty token selects the default.
    pub fn resolve(&self, content_type: &str) -> Option<Arc<dyn MessageEncoder>> {
        if content_type.is_empty() {
            return Some(self.default_encoder());
        }
        self.position(content_type)
            .map(|index| Arc::clone(&self.encoders[index]))
    }

    pub fn default_encoder(&self) -> Arc<dyn MessageEncoder> {
        Arc::clone(&self.encoders[self.default_index])
    }

    pub fn content_types(&self) -> Vec<&str> {
        self.encoders
            .iter()
            .map(|encoder| encoder.content_type())
            .collect()
    }

    fn position(&self, content_type: &str) -> Option<usize> {
        self.encoders
            .iter()
            .position(|encoder| encoder.content_type().eq_ignore_ascii_case(content_type))
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderRegistry")
            .field("content_types", &self.content_types())
            .field("default", &self.default_encoder().content_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FaultCode, MessageFault};

    fn encode_with(encoder: &dyn MessageEncoder, message: &Message) -> Vec<u8> {
        let mut out = Vec::new();
        encoder.encode(message, &mut out).unwrap();
        out
    }

    #[test]
    fn binary_layout_is_exact() {
        let message = Message::new("echo", "hi").with_message_id(1);
        let wire = encode_with(&BinaryMessageEncoder, &message);

        let mut expected = vec![0x01, FLAG_MESSAGE_ID, 4];
        expected.extend_from_slice(b"echo");
        expected.push(0);
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(b"hi");
        assert_eq!(wire, expected);
    }

    #[test]
    fn binary_round_trip_with_all_headers() {
        let request = Message::new("reverse", vec![0u8, 1, 2, 255])
            .with_to("proto://host/svc")
            .with_message_id(42);
        let reply = request.fault_reply(&MessageFault::new(FaultCode::OperationFailed, "boom"));

        for message in [request, reply] {
            let wire = encode_with(&BinaryMessageEncoder, &message);
            let decoded = BinaryMessageEncoder.decode(Bytes::from(wire)).unwrap();
            assert_eq!(decoded.headers, message.headers);
            assert_eq!(decoded.body, message.body);
        }
    }

    #[test]
    fn binary_rejects_truncation_and_unknown_bits() {
        let wire = encode_with(&BinaryMessageEncoder, &Message::new("echo", "").with_message_id(9));
        let truncated = Bytes::copy_from_slice(&wire[..wire.len() - 3]);
        assert!(matches!(
            BinaryMessageEncoder.decode(truncated),
            Err(EncodingError::Malformed(_))
        ));

        assert!(BinaryMessageEncoder
            .decode(Bytes::from_static(&[0x01, 0x80, 0, 0]))
            .is_err());
        assert!(BinaryMessageEncoder
            .decode(Bytes::from_static(&[0x02, 0x00, 0, 0]))
            .is_err());
        assert!(BinaryMessageEncoder
            .decode(Bytes::from_static(&[0x01]))
            .is_err());
    }

    #[test]
    fn json_round_trip() {
        let message = Message::new("echo", "{\"k\":1}").with_message_id(5);
        let wire = encode_with(&JsonMessageEncoder, &message);
        let value: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(value["action"], "echo");
        assert_eq!(value["message_id"], 5);
        assert!(value.get("relates_to").is_none());

        let decoded = JsonMessageEncoder.decode(Bytes::from(wire)).unwrap();
        assert_eq!(decoded.headers, message.headers);
        assert_eq!(decoded.body, message.body);
    }

    #[test]
    fn json_rejects_binary_body() {
        let message = Message::new("echo", vec![0xFFu8, 0xFE]);
        let mut out = Vec::new();
        assert!(matches!(
            JsonMessageEncoder.encode(&message, &mut out),
            Err(EncodingError::NonUtf8Body)
        ));
    }

    #[test]
    fn registry_resolves_tokens() {
        let registry = EncoderRegistry::new();
        assert_eq!(
            registry.resolve("").unwrap().content_type(),
            BINARY_CONTENT_TYPE
        );
        assert_eq!(
            registry.resolve("Application/JSON").unwrap().content_type(),
            JSON_CONTENT_TYPE
        );
        assert!(registry.resolve("text/xml").is_none());

        let registry = registry.with_default(JSON_CONTENT_TYPE);
        assert_eq!(registry.default_encoder().content_type(), JSON_CONTENT_TYPE);
    }
}
