//! Frame decoder for the feed's binary protobuf frames.
//!
//! Frames carry no schema, so listing records are recognised by shape:
//!
//! ```text
//! record   { 1: price, 2: currency, 3: vendor, 4: details }
//! details  { 1: product id, 2: slug, 3: vendor handle, 4: title, 6: store name, 18: media }
//! ```
//!
//! Records may sit at any depth. Heartbeats and acks are recognised and
//! dropped before the walk.

use crate::{
    types::{DecodedEvent, Frame, FrameKind, ListingDetails},
    utils::canonical_listing_url,
    wire::{hex_string, Message, WireValue},
};

const HEARTBEAT_FIELDS: &[u32] = &[10, 13];
const ACK_FIELD: u32 = 8;
const QUERY_FIELD: u32 = 42;

const RECORD_PRICE: u32 = 1;
const RECORD_CURRENCY: u32 = 2;
const RECORD_VENDOR: u32 = 3;
const RECORD_DETAILS: u32 = 4;

const DETAIL_PRODUCT_ID: u32 = 1;
const DETAIL_SLUG: u32 = 2;
const DETAIL_VENDOR_HANDLE: u32 = 3;
const DETAIL_TITLE: u32 = 4;
const DETAIL_STORE_NAME: u32 = 6;

/// What a single frame turned out to carry.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// One or more listing records, priced or not, with the frame's field tree.
    Listings {
        events: Vec<DecodedEvent>,
        message: Message,
    },
    /// A search query typed on the feed page.
    Query(String),
    /// Heartbeats and acks.
    Control,
    /// Parsed fine but holds nothing we recognise.
    Unrecognized(Message),
    /// Not a protobuf message; kept as hex for raw dumps.
    Undecoded(String),
    Text(String),
}

impl FrameOutcome {
    pub fn events(&self) -> &[DecodedEvent] {
        match self {
            FrameOutcome::Listings { events, .. } => events,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameDecoder {
    base_url: String,
}

impl FrameDecoder {
    pub fn new(base_url: &str) -> Self {
        FrameDecoder {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn decode(&self, frame: &Frame) -> FrameOutcome {
        if frame.kind == FrameKind::Text {
            return FrameOutcome::Text(String::from_utf8_lossy(&frame.payload).into_owned());
        }
        let msg = match Message::decode(&frame.payload) {
            Ok(m) => m,
            Err(e) => {
                debug!("frame of {} bytes is not protobuf: {}", frame.payload.len(), e);
                return FrameOutcome::Undecoded(hex_string(&frame.payload));
            }
        };
        self.classify(msg)
    }

    fn classify(&self, msg: Message) -> FrameOutcome {
        if msg.is_empty() {
            return FrameOutcome::Control;
        }
        if let Some((field, value)) = single_field(&msg) {
            if HEARTBEAT_FIELDS.contains(&field) {
                return FrameOutcome::Control;
            }
            if field == ACK_FIELD && is_ack(value) {
                return FrameOutcome::Control;
            }
            if field == QUERY_FIELD {
                if let Some(query) = value.as_message().and_then(|m| m.text(1)) {
                    return FrameOutcome::Query(query.to_string());
                }
            }
        }

        let events = msg
            .walk()
            .into_iter()
            .filter_map(|node| self.extract_record(node))
            .collect::<Vec<_>>();
        if events.is_empty() {
            FrameOutcome::Unrecognized(msg)
        } else {
            FrameOutcome::Listings {
                events,
                message: msg,
            }
        }
    }

    fn extract_record(&self, node: &Message) -> Option<DecodedEvent> {
        let details = node.message(RECORD_DETAILS)?;
        let slug = details.text(DETAIL_SLUG)?.trim();
        if slug.is_empty() {
            return None;
        }
        let owned = |field: u32, m: &Message| m.text(field).map(String::from);

        Some(DecodedEvent {
            price: node.get(RECORD_PRICE).and_then(WireValue::as_number),
            currency: owned(RECORD_CURRENCY, node),
            slug: slug.to_string(),
            name: owned(DETAIL_VENDOR_HANDLE, details),
            vendor: owned(RECORD_VENDOR, node),
            url: canonical_listing_url(&self.base_url, slug),
            details: ListingDetails {
                product_id: details
                    .get(DETAIL_PRODUCT_ID)
                    .and_then(|v| match v {
                        WireValue::Text(s) => Some(s.clone()),
                        WireValue::Varint(n) => Some(n.to_string()),
                        _ => None,
                    }),
                vendor_handle: owned(DETAIL_VENDOR_HANDLE, details),
                title: owned(DETAIL_TITLE, details),
                store_name: owned(DETAIL_STORE_NAME, details),
            },
        })
    }
}

fn single_field(msg: &Message) -> Option<(u32, &WireValue)> {
    let mut fields = msg.fields();
    let first = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    Some(first)
}

// { 8: { 1: { 1: int, 2: int } } }
fn is_ack(value: &WireValue) -> bool {
    value
        .as_message()
        .and_then(|m| m.message(1))
        .map_or(false, |inner| {
            [1, 2]
                .iter()
                .all(|f| inner.get(*f).and_then(WireValue::as_varint).is_some())
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Direction;
    use crate::wire::build::MessageBuilder;

    fn record(price: f64, currency: &str, slug: &str, vendor: &str) -> MessageBuilder {
        MessageBuilder::new()
            .double(1, price)
            .string(2, currency)
            .string(3, vendor)
            .message(
                4,
                MessageBuilder::new()
                    .string(1, "prod_123")
                    .string(2, slug)
                    .string(3, "acme")
                    .string(4, "Iris Out")
                    .string(6, "Acme Store"),
            )
    }

    fn decoder() -> FrameDecoder {
        FrameDecoder::new("https://whop.com")
    }

    #[test]
    fn extracts_a_nested_priced_listing() {
        let payload = MessageBuilder::new()
            .message(11, record(49.0, "usd", "iris-out-5c", "Acme"))
            .finish();
        let outcome = decoder().decode(&Frame::binary(Direction::Inbound, payload));
        let events = outcome.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.price, Some(49.0));
        assert_eq!(e.currency.as_deref(), Some("usd"));
        assert_eq!(e.slug, "iris-out-5c");
        assert_eq!(e.vendor.as_deref(), Some("Acme"));
        assert_eq!(e.url, "https://whop.com/iris-out-5c");
        assert_eq!(e.details.product_id.as_deref(), Some("prod_123"));
        assert_eq!(e.details.store_name.as_deref(), Some("Acme Store"));
    }

    #[test]
    fn varint_prices_are_whole_amounts() {
        let payload = MessageBuilder::new()
            .varint(1, 20)
            .message(4, MessageBuilder::new().string(2, "course"))
            .finish();
        let outcome = decoder().decode(&Frame::binary(Direction::Inbound, payload));
        assert_eq!(outcome.events()[0].price, Some(20.0));
    }

    #[test]
    fn records_without_price_are_unpriced() {
        let payload = MessageBuilder::new()
            .message(4, MessageBuilder::new().string(2, "free-thing"))
            .finish();
        let outcome = decoder().decode(&Frame::binary(Direction::Inbound, payload));
        assert!(!outcome.events()[0].is_priced());
    }

    #[test]
    fn several_records_in_one_frame() {
        let payload = MessageBuilder::new()
            .message(11, record(10.0, "usd", "one", "A"))
            .message(11, record(20.0, "usd", "two", "B"))
            .finish();
        let outcome = decoder().decode(&Frame::binary(Direction::Inbound, payload));
        let slugs = outcome
            .events()
            .iter()
            .map(|e| e.slug.as_str())
            .collect::<Vec<_>>();
        assert_eq!(slugs, vec!["one", "two"]);
    }

    #[test]
    fn heartbeats_and_acks_are_control_frames() {
        let d = decoder();
        let heartbeat = MessageBuilder::new().varint(10, 1).finish();
        assert_eq!(
            d.decode(&Frame::binary(Direction::Inbound, heartbeat)),
            FrameOutcome::Control
        );
        let ack = MessageBuilder::new()
            .message(
                8,
                MessageBuilder::new().message(1, MessageBuilder::new().varint(1, 3).varint(2, 4)),
            )
            .finish();
        assert_eq!(
            d.decode(&Frame::binary(Direction::Inbound, ack)),
            FrameOutcome::Control
        );
    }

    #[test]
    fn query_frames_are_reported() {
        let payload = MessageBuilder::new()
            .message(42, MessageBuilder::new().string(1, "trading"))
            .finish();
        assert_eq!(
            decoder().decode(&Frame::binary(Direction::Outbound, payload)),
            FrameOutcome::Query("trading".into())
        );
    }

    #[test]
    fn malformed_frames_yield_no_event() {
        let d = decoder();
        for payload in [
            vec![0xff],
            vec![0x0a, 0x10, 0x01],
            vec![0x09, 0x00, 0x01],
            vec![0x0f, 0x00],
        ] {
            let outcome = d.decode(&Frame::binary(Direction::Inbound, payload));
            assert!(outcome.events().is_empty());
            assert!(matches!(outcome, FrameOutcome::Undecoded(_)));
        }
    }

    #[test]
    fn text_frames_are_not_decoded() {
        let outcome = decoder().decode(&Frame::text(Direction::Inbound, "{\"ping\":1}"));
        assert_eq!(outcome, FrameOutcome::Text("{\"ping\":1}".into()));
    }

    #[test]
    fn unrelated_messages_are_unrecognized() {
        let payload = MessageBuilder::new().varint(1, 1).varint(2, 2).finish();
        assert!(matches!(
            decoder().decode(&Frame::binary(Direction::Inbound, payload)),
            FrameOutcome::Unrecognized(_)
        ));
    }
}
