//! Schemaless walk over protobuf wire-format bytes.
//!
//! The feed does not publish its `.proto` files, so frames are decoded into a
//! tree of numbered fields and interpreted afterwards by [`crate::decoder`].

use std::collections::BTreeMap;

use bytes::Buf;
use prost::encoding::{decode_key, decode_varint, WireType};
use serde_json::{json, Value as Json};

use crate::types::WireError;

/// Groups nested deeper than this are rejected instead of recursing further.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    Text(String),
    Bytes(Vec<u8>),
    Message(Message),
}

impl WireValue {
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            WireValue::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_varint(&self) -> Option<u64> {
        match self {
            WireValue::Varint(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric reading of the value: fixed64 as a double, fixed32 as a float.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            WireValue::Varint(v) => Some(*v as f64),
            WireValue::Fixed64(bits) => Some(f64::from_bits(*bits)),
            WireValue::Fixed32(bits) => Some(f32::from_bits(*bits) as f64),
            _ => None,
        }
    }

    fn to_json(&self) -> Json {
        match self {
            WireValue::Varint(v) => json!(v),
            WireValue::Fixed64(bits) => {
                let f = f64::from_bits(*bits);
                if f.is_finite() {
                    json!(f)
                } else {
                    json!(bits)
                }
            }
            WireValue::Fixed32(bits) => json!(bits),
            WireValue::Text(s) => json!(s),
            WireValue::Bytes(b) => json!(format!("[HEX] {}", hex_string(b))),
            WireValue::Message(m) => m.to_json(),
        }
    }
}

/// Decoded message: field number to values, repeated fields keep wire order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: BTreeMap<u32, Vec<WireValue>>,
}

impl Message {
    pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
        let mut buf = bytes;
        let msg = Self::decode_fields(&mut buf, None, 0)?;
        Ok(msg)
    }

    fn decode_fields(
        buf: &mut &[u8],
        group: Option<u32>,
        depth: usize,
    ) -> Result<Message, WireError> {
        if depth > MAX_DEPTH {
            return Err(WireError::TooDeep);
        }
        let mut msg = Message::default();
        while buf.has_remaining() {
            let (tag, wire_type) =
                decode_key(buf).map_err(|e| WireError::Malformed(e.to_string()))?;
            let value = match wire_type {
                WireType::Varint => WireValue::Varint(
                    decode_varint(buf).map_err(|e| WireError::Malformed(e.to_string()))?,
                ),
                WireType::SixtyFourBit => {
                    if buf.remaining() < 8 {
                        return Err(WireError::Truncated(tag));
                    }
                    WireValue::Fixed64(buf.get_u64_le())
                }
                WireType::ThirtyTwoBit => {
                    if buf.remaining() < 4 {
                        return Err(WireError::Truncated(tag));
                    }
                    WireValue::Fixed32(buf.get_u32_le())
                }
                WireType::LengthDelimited => {
                    let len = decode_varint(buf).map_err(|e| WireError::Malformed(e.to_string()))?;
                    let len = usize::try_from(len).map_err(|_| WireError::Truncated(tag))?;
                    if buf.remaining() < len {
                        return Err(WireError::Truncated(tag));
                    }
                    let data: &[u8] = *buf;
                    let (chunk, rest) = data.split_at(len);
                    *buf = rest;
                    Self::classify_chunk(chunk, depth)
                }
                WireType::StartGroup => {
                    let inner = Self::decode_fields(buf, Some(tag), depth + 1)?;
                    WireValue::Message(inner)
                }
                WireType::EndGroup => {
                    return if group == Some(tag) {
                        Ok(msg)
                    } else {
                        Err(WireError::UnexpectedEndGroup(tag))
                    };
                }
            };
            msg.fields.entry(tag).or_default().push(value);
        }
        if let Some(tag) = group {
            return Err(WireError::UnterminatedGroup(tag));
        }
        Ok(msg)
    }

    // printable text wins over a speculative nested parse, short strings
    // frequently happen to be valid messages
    fn classify_chunk(chunk: &[u8], depth: usize) -> WireValue {
        if let Ok(text) = std::str::from_utf8(chunk) {
            if is_printable(text) {
                return WireValue::Text(text.to_string());
            }
        }
        let mut inner = chunk;
        match Self::decode_fields(&mut inner, None, depth + 1) {
            Ok(m) if !m.is_empty() => WireValue::Message(m),
            _ => WireValue::Bytes(chunk.to_vec()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// First value of a field.
    pub fn get(&self, field: u32) -> Option<&WireValue> {
        self.fields.get(&field).and_then(|v| v.first())
    }

    pub fn get_all(&self, field: u32) -> &[WireValue] {
        self.fields.get(&field).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn message(&self, field: u32) -> Option<&Message> {
        self.get(field).and_then(WireValue::as_message)
    }

    pub fn text(&self, field: u32) -> Option<&str> {
        self.get(field).and_then(WireValue::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (u32, &WireValue)> {
        self.fields
            .iter()
            .flat_map(|(tag, values)| values.iter().map(move |v| (*tag, v)))
    }

    /// Pre-order walk over this message and every nested message.
    pub fn walk(&self) -> Vec<&Message> {
        let mut out = vec![];
        let mut stack = vec![self];
        while let Some(m) = stack.pop() {
            out.push(m);
            let mut children = m
                .fields()
                .filter_map(|(_, v)| v.as_message())
                .collect::<Vec<_>>();
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// JSON view keyed by field number, used for raw dumps.
    pub fn to_json(&self) -> Json {
        let mut map = serde_json::Map::new();
        for (tag, values) in &self.fields {
            let v = if values.len() == 1 {
                values[0].to_json()
            } else {
                Json::Array(values.iter().map(WireValue::to_json).collect())
            };
            map.insert(tag.to_string(), v);
        }
        Json::Object(map)
    }
}

fn is_printable(text: &str) -> bool {
    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}


#[cfg(test)]
mod test {
    use super::build::MessageBuilder;
    use super::*;

    #[test]
    fn decodes_nested_messages_and_strings() {
        let bytes = MessageBuilder::new()
            .varint(1, 150)
            .message(
                4,
                MessageBuilder::new()
                    .string(2, "iris-out-5c")
                    .double(7, 12.5),
            )
            .finish();

        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg.get(1).and_then(WireValue::as_varint), Some(150));
        let inner = msg.message(4).unwrap();
        assert_eq!(inner.text(2), Some("iris-out-5c"));
        assert_eq!(inner.get(7).and_then(WireValue::as_number), Some(12.5));
    }

    #[test]
    fn short_text_is_not_mistaken_for_a_message() {
        // "hi" is also a valid message: field 13, varint 105
        let bytes = MessageBuilder::new().string(2, "hi").finish();
        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg.text(2), Some("hi"));
    }

    #[test]
    fn rejects_truncated_input() {
        let mut bytes = MessageBuilder::new().string(2, "truncated").finish();
        bytes.truncate(5);
        assert!(Message::decode(&bytes).is_err());

        // fixed64 with only three bytes behind it
        assert!(Message::decode(&[0x09, 0x01, 0x02, 0x03]).is_err());
    }

    #[test]
    fn rejects_invalid_wire_type() {
        // wire type 7 does not exist
        assert!(Message::decode(&[0x0f, 0x01]).is_err());
    }

    #[test]
    fn repeated_fields_keep_order() {
        let bytes = MessageBuilder::new()
            .string(3, "a")
            .string(3, "b")
            .finish();
        let msg = Message::decode(&bytes).unwrap();
        let all = msg
            .get_all(3)
            .iter()
            .filter_map(WireValue::as_str)
            .collect::<Vec<_>>();
        assert_eq!(all, vec!["a", "b"]);
        assert_eq!(msg.to_json(), json!({"3": ["a", "b"]}));
    }

    #[test]
    fn walk_visits_every_nested_message() {
        let bytes = MessageBuilder::new()
            .message(1, MessageBuilder::new().message(2, MessageBuilder::new().varint(9, 1)))
            .message(3, MessageBuilder::new().varint(1, 2))
            .finish();
        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg.walk().len(), 4);
    }
}
