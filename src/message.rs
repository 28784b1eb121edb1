//! Message framing inside a packet payload.
//!
//! Messages are concatenated in the payload region: a varint type code,
//! a varint length for variable-sized types, then the body. Handshake
//! messages have fixed bodies; DATA carries opaque bytes.

use crate::cookie::Cookie;
use crate::identity::{Capabilities, ChannelId};
use crate::support::{Error, ErrorKind, ProtocolResult};
use byteorder::{BigEndian, ByteOrder};

pub const CHANNEL_NEW: u64 = 10;
pub const CHANNEL_ACKNOWLEDGE: u64 = 11;
pub const CHANNEL_FINALIZE: u64 = 12;
pub const CHANNEL_COOKIE: u64 = 13;
pub const DATA: u64 = 20;

const CHANNEL_NEW_SIZE: usize = 6;
const CHANNEL_ACKNOWLEDGE_SIZE: usize = 12;
const CHANNEL_FINALIZE_SIZE: usize = 10;
const CHANNEL_COOKIE_SIZE: usize = 6;

/// Decode a LEB128-style unsigned varint. Returns the value and the number
/// of bytes consumed.
pub fn read_varint(buf: &[u8]) -> ProtocolResult<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;

    for (consumed, &byte) in buf.iter().enumerate() {
        if shift > 63 {
            return Err(Error::new(ErrorKind::Decode, "varint exceeds 64 bits"));
        }

        value |= u64::from(byte & 0x7f) << shift;

        if byte & 0x80 == 0 {
            return Ok((value, consumed + 1));
        }

        shift += 7;
    }

    Err(Error::new(ErrorKind::Decode, "truncated varint"))
}

/// Encode a LEB128-style unsigned varint. Returns the number of bytes written.
pub fn write_varint(mut value: u64, buf: &mut [u8]) -> ProtocolResult<usize> {
    let mut written = 0;

    loop {
        if written >= buf.len() {
            return Err(Error::new(ErrorKind::Encode, "varint does not fit the buffer"));
        }

        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            buf[written] = byte;
            return Ok(written + 1);
        }

        buf[written] = byte | 0x80;
        written += 1;
    }
}

/// Encoded size of a varint.
#[inline]
pub fn varint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros().min(63);
    ((bits as usize + 6) / 7).max(1)
}

/// Opaque bytes carried by a DATA message. On egress the queue owns the
/// bytes; on ingress the segment is a span into the packet payload backed by
/// the pool slot, so no copy is made.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataSegment {
    Owned(Vec<u8>),
    Span { offset: usize, length: usize },
}

impl DataSegment {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            DataSegment::Owned(bytes) => bytes.len(),
            DataSegment::Span { length, .. } => *length,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    ChannelNew {
        initiator: u16,
        cookie: Cookie,
    },
    ChannelAcknowledge {
        channel: ChannelId,
        initiator_cookie: Cookie,
        responder_cookie: Cookie,
    },
    ChannelFinalize {
        channel: ChannelId,
        cookie: Cookie,
        capabilities: Capabilities,
    },
    ChannelCookie {
        cookie: Cookie,
        capabilities: Capabilities,
    },
    Data(DataSegment),
}

impl Message {
    #[inline]
    pub fn message_type(&self) -> u64 {
        match self {
            Message::ChannelNew { .. } => CHANNEL_NEW,
            Message::ChannelAcknowledge { .. } => CHANNEL_ACKNOWLEDGE,
            Message::ChannelFinalize { .. } => CHANNEL_FINALIZE,
            Message::ChannelCookie { .. } => CHANNEL_COOKIE,
            Message::Data(_) => DATA,
        }
    }

    /// Parse one message from the front of `buf`. `base` is the offset of
    /// `buf[0]` within the enclosing packet, recorded in DATA spans so the
    /// payload can later be read straight out of the slot.
    pub fn parse(buf: &[u8], base: usize) -> ProtocolResult<(Message, usize)> {
        let (message_type, type_size) = read_varint(buf)?;
        let body = &buf[type_size..];

        let fixed_size = match message_type {
            CHANNEL_NEW => CHANNEL_NEW_SIZE,
            CHANNEL_ACKNOWLEDGE => CHANNEL_ACKNOWLEDGE_SIZE,
            CHANNEL_FINALIZE => CHANNEL_FINALIZE_SIZE,
            CHANNEL_COOKIE => CHANNEL_COOKIE_SIZE,
            DATA => {
                let (length, length_size) = read_varint(body)?;
                let length = length as usize;
                let payload = &body[length_size..];

                if payload.len() < length {
                    return Err(Error::new(ErrorKind::Decode, "truncated DATA body"));
                }

                let offset = base + type_size + length_size;
                let consumed = type_size + length_size + length;

                return Ok((Message::Data(DataSegment::Span { offset, length }), consumed));
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidMessageType,
                    format!("unknown message type {}", message_type),
                ));
            }
        };

        if body.len() < fixed_size {
            return Err(Error::new(ErrorKind::Decode, "truncated message body"));
        }

        let message = match message_type {
            CHANNEL_NEW => Message::ChannelNew {
                initiator: BigEndian::read_u16(&body[..2]),
                cookie: Cookie::from_raw(BigEndian::read_u32(&body[2..6])),
            },
            CHANNEL_ACKNOWLEDGE => Message::ChannelAcknowledge {
                channel: ChannelId::from_raw(BigEndian::read_u32(&body[..4])),
                initiator_cookie: Cookie::from_raw(BigEndian::read_u32(&body[4..8])),
                responder_cookie: Cookie::from_raw(BigEndian::read_u32(&body[8..12])),
            },
            CHANNEL_FINALIZE => Message::ChannelFinalize {
                channel: ChannelId::from_raw(BigEndian::read_u32(&body[..4])),
                cookie: Cookie::from_raw(BigEndian::read_u32(&body[4..8])),
                capabilities: Capabilities::from_raw(BigEndian::read_u16(&body[8..10])),
            },
            CHANNEL_COOKIE => Message::ChannelCookie {
                cookie: Cookie::from_raw(BigEndian::read_u32(&body[..4])),
                capabilities: Capabilities::from_raw(BigEndian::read_u16(&body[4..6])),
            },
            _ => unreachable!(),
        };

        Ok((message, type_size + fixed_size))
    }

    /// Bytes this message occupies on the wire.
    pub fn encoded_size(&self) -> usize {
        let type_size = varint_size(self.message_type());

        match self {
            Message::ChannelNew { .. } => type_size + CHANNEL_NEW_SIZE,
            Message::ChannelAcknowledge { .. } => type_size + CHANNEL_ACKNOWLEDGE_SIZE,
            Message::ChannelFinalize { .. } => type_size + CHANNEL_FINALIZE_SIZE,
            Message::ChannelCookie { .. } => type_size + CHANNEL_COOKIE_SIZE,
            Message::Data(segment) => {
                type_size + varint_size(segment.len() as u64) + segment.len()
            }
        }
    }

    /// Serialize the message to the front of `buf`. Returns the number of
    /// bytes written. Span segments are read-only views and cannot be
    /// re-serialized.
    pub fn write(&self, buf: &mut [u8]) -> ProtocolResult<usize> {
        let size = self.encoded_size();
        if buf.len() < size {
            return Err(Error::new(ErrorKind::Encode, "message does not fit the buffer"));
        }

        let mut offset = write_varint(self.message_type(), buf)?;
        let body = &mut buf[offset..];

        match self {
            Message::ChannelNew { initiator, cookie } => {
                BigEndian::write_u16(&mut body[..2], *initiator);
                BigEndian::write_u32(&mut body[2..6], cookie.raw());
                offset += CHANNEL_NEW_SIZE;
            }
            Message::ChannelAcknowledge {
                channel,
                initiator_cookie,
                responder_cookie,
            } => {
                BigEndian::write_u32(&mut body[..4], channel.raw());
                BigEndian::write_u32(&mut body[4..8], initiator_cookie.raw());
                BigEndian::write_u32(&mut body[8..12], responder_cookie.raw());
                offset += CHANNEL_ACKNOWLEDGE_SIZE;
            }
            Message::ChannelFinalize {
                channel,
                cookie,
                capabilities,
            } => {
                BigEndian::write_u32(&mut body[..4], channel.raw());
                BigEndian::write_u32(&mut body[4..8], cookie.raw());
                BigEndian::write_u16(&mut body[8..10], capabilities.raw());
                offset += CHANNEL_FINALIZE_SIZE;
            }
            Message::ChannelCookie {
                cookie,
                capabilities,
            } => {
                BigEndian::write_u32(&mut body[..4], cookie.raw());
                BigEndian::write_u16(&mut body[4..6], capabilities.raw());
                offset += CHANNEL_COOKIE_SIZE;
            }
            Message::Data(segment) => {
                let bytes = match segment {
                    DataSegment::Owned(bytes) => bytes,
                    DataSegment::Span { .. } => {
                        return Err(Error::new(
                            ErrorKind::Encode,
                            "span segments are read-only views",
                        ));
                    }
                };

                let length_size = write_varint(bytes.len() as u64, body)?;
                body[length_size..length_size + bytes.len()].copy_from_slice(bytes);
                offset += length_size + bytes.len();
            }
        }

        Ok(offset)
    }
}

/// Lazy message sequence over a payload region. Iteration stops at the end
/// of the payload or at the first undecodable byte; the remainder (the
/// padding tail) is discarded. Constructing a fresh iterator restarts the
/// parse from the beginning.
pub struct MessageIter<'a> {
    payload: &'a [u8],
    offset: usize,
    base: usize,
}

impl<'a> MessageIter<'a> {
    /// `base` is the offset of `payload[0]` within the enclosing packet.
    #[inline]
    pub fn new(payload: &'a [u8], base: usize) -> MessageIter<'a> {
        MessageIter {
            payload,
            offset: 0,
            base,
        }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.offset >= self.payload.len() {
            return None;
        }

        match Message::parse(&self.payload[self.offset..], self.base + self.offset) {
            Ok((message, consumed)) => {
                self.offset += consumed;
                Some(message)
            }
            Err(_) => {
                // Undecodable remainder; skip to the end.
                self.offset = self.payload.len();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        let mut buf = [0u8; 10];

        for &value in &[0u64, 1, 127, 128, 300, 16_383, 16_384, u64::max_value()] {
            let written = write_varint(value, &mut buf).unwrap();

            assert_eq!(written, varint_size(value));
            assert_eq!(read_varint(&buf[..written]).unwrap(), (value, written));
        }
    }

    #[test]
    fn test_varint_single_byte_boundary() {
        let mut buf = [0u8; 10];

        assert_eq!(write_varint(127, &mut buf).unwrap(), 1);
        assert_eq!(write_varint(128, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[0x80, 0x01]);
    }

    #[test]
    fn test_varint_truncated() {
        let result = read_varint(&[0x80, 0x80]);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_varint_overlong() {
        let result = read_varint(&[0x80; 11]);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_channel_new_roundtrip() {
        let message = Message::ChannelNew {
            initiator: 0xa1a1,
            cookie: Cookie::from_raw(0xdead_beef),
        };

        let mut buf = [0u8; 32];
        let written = message.write(&mut buf).unwrap();

        assert_eq!(written, 7);
        assert_eq!(written, message.encoded_size());

        let (parsed, consumed) = Message::parse(&buf[..written], 0).unwrap();

        assert_eq!(parsed, message);
        assert_eq!(consumed, written);
    }

    #[test]
    fn test_control_roundtrips() {
        let messages = vec![
            Message::ChannelAcknowledge {
                channel: ChannelId::new(0xa1a1, 0xb2b2),
                initiator_cookie: Cookie::from_raw(1),
                responder_cookie: Cookie::from_raw(2),
            },
            Message::ChannelFinalize {
                channel: ChannelId::new(0xa1a1, 0xb2b2),
                cookie: Cookie::from_raw(3),
                capabilities: Capabilities::RESEND,
            },
            Message::ChannelCookie {
                cookie: Cookie::from_raw(4),
                capabilities: Capabilities::ORDERED,
            },
        ];

        let mut buf = [0u8; 64];

        for message in messages {
            let written = message.write(&mut buf).unwrap();
            let (parsed, consumed) = Message::parse(&buf[..written], 0).unwrap();

            assert_eq!(parsed, message);
            assert_eq!(consumed, written);
            assert_eq!(consumed, message.encoded_size());
        }
    }

    #[test]
    fn test_data_span_offsets() {
        let message = Message::Data(DataSegment::Owned(vec![9; 5]));

        let mut buf = [0u8; 32];
        let written = message.write(&mut buf).unwrap();

        // Type varint + length varint + 5 payload bytes.
        assert_eq!(written, 7);

        let (parsed, consumed) = Message::parse(&buf[..written], 100).unwrap();

        assert_eq!(consumed, written);
        match parsed {
            Message::Data(DataSegment::Span { offset, length }) => {
                assert_eq!(offset, 102);
                assert_eq!(length, 5);
            }
            other => panic!("Unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type() {
        let mut buf = [0u8; 8];
        write_varint(99, &mut buf).unwrap();

        let result = Message::parse(&buf, 0);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidMessageType);
    }

    #[test]
    fn test_truncated_body() {
        let message = Message::ChannelNew {
            initiator: 1,
            cookie: Cookie::from_raw(2),
        };

        let mut buf = [0u8; 32];
        let written = message.write(&mut buf).unwrap();

        let result = Message::parse(&buf[..written - 1], 0);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_iterator_consumes_sequence() {
        let first = Message::ChannelNew {
            initiator: 0xa1a1,
            cookie: Cookie::from_raw(1),
        };
        let second = Message::Data(DataSegment::Owned(vec![1, 2, 3]));

        let mut buf = [0u8; 64];
        let mut offset = first.write(&mut buf).unwrap();
        offset += second.write(&mut buf[offset..]).unwrap();

        let messages: Vec<_> = MessageIter::new(&buf[..offset], 0).collect();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], first);
        match &messages[1] {
            Message::Data(DataSegment::Span { offset, length }) => {
                assert_eq!(*offset, 9);
                assert_eq!(*length, 3);
            }
            other => panic!("Unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_iterator_skips_padding_tail() {
        let message = Message::ChannelNew {
            initiator: 0xa1a1,
            cookie: Cookie::from_raw(1),
        };

        let mut buf = [69u8; 64];
        let written = message.write(&mut buf).unwrap();

        // Everything after the message is padding; 69 is not a registered
        // message type so iteration stops silently.
        let messages: Vec<_> = MessageIter::new(&buf, 0).collect();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], message);
        assert_eq!(written, 7);
    }

    #[test]
    fn test_iteration_is_restartable() {
        let message = Message::ChannelCookie {
            cookie: Cookie::from_raw(7),
            capabilities: Capabilities::empty(),
        };

        let mut buf = [0u8; 16];
        let written = message.write(&mut buf).unwrap();

        let first: Vec<_> = MessageIter::new(&buf[..written], 0).collect();
        let second: Vec<_> = MessageIter::new(&buf[..written], 0).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_write_overflow() {
        let message = Message::Data(DataSegment::Owned(vec![0; 100]));

        let mut buf = [0u8; 16];
        let result = message.write(&mut buf);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Encode);
    }
}
