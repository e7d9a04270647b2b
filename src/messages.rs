//! Wire messages exchanged by two synchronizing peers.
//!
//! Every message is a short ASCII tag immediately followed by its payload, with no
//! separator and no framing beyond what the underlying channel already provides:
//!
//! | Message    | Tag   | Payload                                 |
//! |------------|-------|-----------------------------------------|
//! | Request    | `TSQ` | decimal probe index                     |
//! | Reply      | `TSR` | decimal probe index being answered      |
//! | Completion | `TSD` | final latency in milliseconds (`f64`)   |

use std::fmt;

use thiserror::Error;

/// Tag of a probe request.
pub const REQUEST_TAG: &str = "TSQ";
/// Tag of a probe reply.
pub const REPLY_TAG: &str = "TSR";
/// Tag of a completion message.
pub const DONE_TAG: &str = "TSD";

/// Identifier of one outstanding probe on the side that sent it.
pub type ProbeIndex = u32;

/// A decoded protocol message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    /// Probe request, to be echoed back as a [`Message::Reply`].
    Request(ProbeIndex),
    /// Echo of a previously received request.
    Reply(ProbeIndex),
    /// Final latency estimate computed by the initiating side.
    Done(f64),
}

/// Errors returned when decoding an inbound text message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The text does not start with any protocol tag and belongs to another consumer.
    #[error("message is not part of the time sync protocol")]
    Unrecognized,

    /// The tag was recognized but the payload could not be parsed.
    #[error("malformed {tag} payload: {payload:?}")]
    MalformedPayload { tag: &'static str, payload: String },
}

impl Message {
    /// Encodes the message into its wire text.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes a wire text.
    ///
    /// Tags are checked in request, reply, completion order and the first match wins.
    /// Text that matches none of them yields [`CodecError::Unrecognized`] and should be
    /// handed over untouched to whoever else listens on the channel.
    pub fn decode(text: &str) -> Result<Message, CodecError> {
        if let Some(payload) = text.strip_prefix(REQUEST_TAG) {
            parse_index(REQUEST_TAG, payload).map(Message::Request)
        } else if let Some(payload) = text.strip_prefix(REPLY_TAG) {
            parse_index(REPLY_TAG, payload).map(Message::Reply)
        } else if let Some(payload) = text.strip_prefix(DONE_TAG) {
            payload
                .parse::<f64>()
                .map(Message::Done)
                .map_err(|_| malformed(DONE_TAG, payload))
        } else {
            Err(CodecError::Unrecognized)
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Message::Request(index) => write!(f, "{}{}", REQUEST_TAG, index),
            Message::Reply(index) => write!(f, "{}{}", REPLY_TAG, index),
            // f64 Display is locale independent and round-trips through `parse`.
            Message::Done(latency) => write!(f, "{}{}", DONE_TAG, latency),
        }
    }
}

fn parse_index(tag: &'static str, payload: &str) -> Result<ProbeIndex, CodecError> {
    // `u32::from_str` accepts a leading '+' and zeros; only the canonical decimal form
    // names a probe, so `TSR007` never matches probe 7.
    if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(tag, payload));
    }
    if payload.len() > 1 && payload.starts_with('0') {
        return Err(malformed(tag, payload));
    }
    payload.parse().map_err(|_| malformed(tag, payload))
}

fn malformed(tag: &'static str, payload: &str) -> CodecError {
    CodecError::MalformedPayload {
        tag,
        payload: payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_and_reply() {
        assert_eq!(Message::Request(4217).encode(), "TSQ4217");
        assert_eq!(Message::Reply(0).encode(), "TSR0");
    }

    #[test]
    fn test_encode_done_uses_plain_decimal() {
        assert_eq!(Message::Done(25.0).encode(), "TSD25");
        assert_eq!(Message::Done(12.75).encode(), "TSD12.75");
    }

    #[test]
    fn test_decode_each_kind() {
        assert_eq!(Message::decode("TSQ17"), Ok(Message::Request(17)));
        assert_eq!(Message::decode("TSR9999"), Ok(Message::Reply(9999)));
        assert_eq!(Message::decode("TSD24.5"), Ok(Message::Done(24.5)));
    }

    #[test]
    fn test_decode_done_preserves_value_bits() {
        let latency = 25.333333333333332_f64;
        match Message::decode(&Message::Done(latency).encode()) {
            Ok(Message::Done(v)) => assert_eq!(v.to_bits(), latency.to_bits()),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_done_nan() {
        match Message::decode("TSDNaN") {
            Ok(Message::Done(v)) => assert!(v.is_nan()),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_non_canonical_index() {
        assert_eq!(Message::decode("TSQ0"), Ok(Message::Request(0)));
        assert!(matches!(
            Message::decode("TSR007"),
            Err(CodecError::MalformedPayload { tag: "TSR", .. })
        ));
        assert!(matches!(
            Message::decode("TSQ00"),
            Err(CodecError::MalformedPayload { tag: "TSQ", .. })
        ));
    }

    #[test]
    fn test_decode_foreign_message() {
        assert_eq!(Message::decode("hello"), Err(CodecError::Unrecognized));
        assert_eq!(Message::decode(""), Err(CodecError::Unrecognized));
        // Tags are case sensitive and must be at the very start.
        assert_eq!(Message::decode("tsq1"), Err(CodecError::Unrecognized));
        assert_eq!(Message::decode(" TSQ1"), Err(CodecError::Unrecognized));
    }

    #[test]
    fn test_decode_malformed_payloads() {
        assert!(matches!(
            Message::decode("TSQ"),
            Err(CodecError::MalformedPayload { tag: "TSQ", .. })
        ));
        assert!(matches!(
            Message::decode("TSR+5"),
            Err(CodecError::MalformedPayload { tag: "TSR", .. })
        ));
        assert!(matches!(
            Message::decode("TSQ-1"),
            Err(CodecError::MalformedPayload { .. })
        ));
        assert!(matches!(
            Message::decode("TSQ99999999999"),
            Err(CodecError::MalformedPayload { .. })
        ));
        assert!(matches!(
            Message::decode("TSDfast"),
            Err(CodecError::MalformedPayload { tag: "TSD", .. })
        ));
    }
}
