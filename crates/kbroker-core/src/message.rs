//! Message envelope helpers.
//!
//! Every message exchanged between a worker and a client is an opaque
//! binary buffer with a fixed header:
//!
//! ```text
//! [0..8)   id              u64 LE, unique per sender
//! [8..16)  correlation id  u64 LE
//! [16..)   name\0 json\0 blob
//! ```
//!
//! The broker only routes on the header and the name token; the JSON
//! payload and blob are never decoded here.

use crate::error::{Error, Result};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 16;

/// Correlation id of a message that is not a reply to anything.
pub const UNCORRELATED: u64 = 0;

/// Correlation id marking a message as a request that awaits a reply.
pub const PENDING_REPLY: u64 = u64::MAX;

/// Name of the client control message asking the worker to cancel every
/// request it currently has outstanding.
pub const CANCEL_ALL: &str = "!//";

/// Decoded fixed header of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: u64,
    pub correlation_id: u64,
}

impl MessageHeader {
    /// Parse the header of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            id: id(buf)?,
            correlation_id: correlation_id(buf)?,
        })
    }

    /// Whether this message is itself a request awaiting a reply.
    pub const fn is_pending_request(&self) -> bool {
        self.correlation_id == PENDING_REPLY
    }

    /// Whether this message replies to an earlier request.
    pub const fn is_reply(&self) -> bool {
        self.correlation_id != UNCORRELATED && self.correlation_id != PENDING_REPLY
    }
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    if buf.len() < HEADER_LEN {
        return Err(Error::MalformedMessage {
            len: buf.len(),
            required: HEADER_LEN,
        });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    Ok(u64::from_le_bytes(bytes))
}

/// Read the message id.
pub fn id(buf: &[u8]) -> Result<u64> {
    read_u64(buf, 0)
}

/// Read the correlation id.
pub fn correlation_id(buf: &[u8]) -> Result<u64> {
    read_u64(buf, 8)
}

/// Raw bytes of the name token (without the NUL terminator).
///
/// A name without a terminator runs to the end of the buffer.
pub fn name_bytes(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < HEADER_LEN {
        return Err(Error::MalformedMessage {
            len: buf.len(),
            required: HEADER_LEN,
        });
    }
    let rest = &buf[HEADER_LEN..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    Ok(&rest[..end])
}

/// Name token as UTF-8, `None` when it is not valid UTF-8.
pub fn name(buf: &[u8]) -> Result<Option<&str>> {
    Ok(std::str::from_utf8(name_bytes(buf)?).ok())
}

/// Compare the name token against `expected` without allocating.
///
/// Malformed buffers never match.
pub fn is_named(buf: &[u8], expected: &str) -> bool {
    name_bytes(buf).is_ok_and(|n| n == expected.as_bytes())
}

/// Whether `buf` is a request awaiting a reply.
pub fn is_pending_request(buf: &[u8]) -> bool {
    correlation_id(buf).is_ok_and(|c| c == PENDING_REPLY)
}

/// Whether `buf` is the cancel-all control message.
pub fn is_cancel_all(buf: &[u8]) -> bool {
    correlation_id(buf).is_ok_and(|c| c == UNCORRELATED) && is_named(buf, CANCEL_ALL)
}

/// Builder producing well-formed message buffers.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    id: u64,
    correlation_id: u64,
    name: String,
    json: String,
    blob: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            json: "null".to_string(),
            ..Self::default()
        }
    }

    /// Mark the message as a request awaiting a reply.
    #[must_use]
    pub const fn pending_reply(mut self) -> Self {
        self.correlation_id = PENDING_REPLY;
        self
    }

    /// Mark the message as a reply to the request with `request_id`.
    #[must_use]
    pub const fn reply_to(mut self, request_id: u64) -> Self {
        self.correlation_id = request_id;
        self
    }

    #[must_use]
    pub fn json(mut self, json: impl Into<String>) -> Self {
        self.json = json.into();
        self
    }

    #[must_use]
    pub fn blob(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.blob = blob.into();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            HEADER_LEN + self.name.len() + self.json.len() + 2 + self.blob.len(),
        );
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.correlation_id.to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.json.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.blob);
        buf
    }
}

/// Build the cancel-all control message with the given id.
pub fn cancel_all(id: u64) -> Vec<u8> {
    MessageBuilder::new(id, CANCEL_ALL).build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_little_endian() {
        let msg = MessageBuilder::new(0x0102, "hello").reply_to(7).build();
        assert_eq!(&msg[..2], &[0x02, 0x01]);
        let header = MessageHeader::parse(&msg).unwrap();
        assert_eq!(header.id, 0x0102);
        assert_eq!(header.correlation_id, 7);
        assert!(header.is_reply());
        assert!(!header.is_pending_request());
    }

    #[test]
    fn short_buffer_is_malformed() {
        let err = id(&[0u8; 15]).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedMessage {
                len: 15,
                required: 16
            }
        ));
        assert!(!is_named(&[0u8; 3], "x"));
        assert!(!is_pending_request(&[]));
    }

    #[test]
    fn name_stops_at_terminator() {
        let msg = MessageBuilder::new(1, "!Shutdown").json("[1,2]").build();
        assert_eq!(name(&msg).unwrap(), Some("!Shutdown"));
        assert!(is_named(&msg, "!Shutdown"));
        assert!(!is_named(&msg, "!Shut"));
        assert!(!is_named(&msg, "!ShutdownNow"));
    }

    #[test]
    fn unterminated_name_runs_to_end() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&5u64.to_le_bytes());
        msg.extend_from_slice(&0u64.to_le_bytes());
        msg.extend_from_slice(b"?Eval");
        assert_eq!(name(&msg).unwrap(), Some("?Eval"));
    }

    #[test]
    fn header_only_message_has_empty_name() {
        let msg = [0u8; HEADER_LEN];
        assert_eq!(name(&msg).unwrap(), Some(""));
    }

    #[test]
    fn pending_and_cancel_all_detection() {
        let pending = MessageBuilder::new(3, "?Request").pending_reply().build();
        assert!(is_pending_request(&pending));
        assert!(!is_cancel_all(&pending));

        let cancel = cancel_all(9);
        assert!(is_cancel_all(&cancel));
        assert!(!is_pending_request(&cancel));

        // The cancel-all name only counts when uncorrelated.
        let correlated = MessageBuilder::new(4, CANCEL_ALL).reply_to(2).build();
        assert!(!is_cancel_all(&correlated));
    }

    #[test]
    fn blob_follows_json() {
        let msg = MessageBuilder::new(1, "!Blob")
            .json("{}")
            .blob(vec![0xde, 0xad])
            .build();
        assert_eq!(&msg[msg.len() - 2..], &[0xde, 0xad]);
        assert_eq!(name(&msg).unwrap(), Some("!Blob"));
    }
}
