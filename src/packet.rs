//! Packet envelope codec.
//!
//! A packet is a fixed-size envelope over a pool slot: public header,
//! private header (sequence + payload size, encryptable once the ENCRYPTED
//! flag is honoured), payload messages, padding that hides the payload
//! length, and a trailing CRC-32. All integers are big-endian.

use crate::identity::{ChannelId, PeerId, PROTOCOL_ID};
use crate::message::MessageIter;
use crate::pool::Slot;
use crate::support::{Error, ErrorKind, ProtocolResult};
use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::fmt;

const PROTOCOL_OFFSET: usize = 0;
const SENDER_OFFSET: usize = 4;
const RECIPIENT_OFFSET: usize = 20;
const CHANNEL_OFFSET: usize = 36;
const FLAGS_OFFSET: usize = 40;
const PACKET_SIZE_OFFSET: usize = 42;
const SEQUENCE_OFFSET: usize = 44;
const PAYLOAD_SIZE_OFFSET: usize = 46;

/// Offset of the first payload byte.
pub const PAYLOAD_OFFSET: usize = 48;

pub const PUBLIC_HEADER_SIZE: usize = 44;
pub const PRIVATE_HEADER_SIZE: usize = 4;
pub const FOOTER_SIZE: usize = 4;

/// Total fixed overhead per packet.
pub const ENVELOPE_SIZE: usize = PUBLIC_HEADER_SIZE + PRIVATE_HEADER_SIZE + FOOTER_SIZE;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Header flag bits. Bit 0 marks an encrypted private section, bit 1 is the
/// spin bit; the rest are reserved.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Flags(u16);

impl Flags {
    pub const ENCRYPTED: Flags = Flags(1);
    pub const SPIN_BIT: Flags = Flags(1 << 1);

    #[inline]
    pub fn empty() -> Flags {
        Flags(0)
    }

    #[inline]
    pub fn from_raw(raw: u16) -> Flags {
        Flags(raw)
    }

    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Flags({:#06x})", self.0)
    }
}

/// Parsed public header fields, produced by the de-envelope stage before the
/// full packet wrapper is constructed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub channel: ChannelId,
    pub flags: Flags,
    pub packet_size: u16,
}

/// Parse and validate the public header of a raw buffer.
pub fn parse_header(buf: &[u8]) -> ProtocolResult<Header> {
    if buf.len() < ENVELOPE_SIZE {
        return Err(Error::new(
            ErrorKind::Decode,
            "buffer shorter than the envelope",
        ));
    }

    let protocol = BigEndian::read_u32(&buf[PROTOCOL_OFFSET..PROTOCOL_OFFSET + 4]);
    if protocol != PROTOCOL_ID {
        return Err(Error::new(ErrorKind::Decode, "protocol id mismatch"));
    }

    let packet_size = BigEndian::read_u16(&buf[PACKET_SIZE_OFFSET..PACKET_SIZE_OFFSET + 2]);
    if packet_size as usize > buf.len() || (packet_size as usize) < ENVELOPE_SIZE {
        return Err(Error::new(ErrorKind::Decode, "stated packet size out of bounds"));
    }

    let mut sender = [0u8; PeerId::SIZE];
    sender.copy_from_slice(&buf[SENDER_OFFSET..SENDER_OFFSET + PeerId::SIZE]);
    let mut recipient = [0u8; PeerId::SIZE];
    recipient.copy_from_slice(&buf[RECIPIENT_OFFSET..RECIPIENT_OFFSET + PeerId::SIZE]);

    Ok(Header {
        sender: PeerId::new(sender),
        recipient: PeerId::new(recipient),
        channel: ChannelId::from_raw(BigEndian::read_u32(&buf[CHANNEL_OFFSET..CHANNEL_OFFSET + 4])),
        flags: Flags::from_raw(BigEndian::read_u16(&buf[FLAGS_OFFSET..FLAGS_OFFSET + 2])),
        packet_size,
    })
}

/// Zero-copy packet view over a pool slot. Accessors read straight from the
/// buffer; mutators write straight through.
#[derive(Clone)]
pub struct Packet {
    slot: Slot,
}

impl Packet {
    /// Wrap an inbound slot, validating the envelope.
    pub fn parse(slot: Slot) -> ProtocolResult<Packet> {
        let header = parse_header(slot.data())?;

        let packet = Packet { slot };
        if packet.payload_size() as usize > header.packet_size as usize - ENVELOPE_SIZE {
            return Err(Error::new(
                ErrorKind::Decode,
                "stated payload size exceeds the packet",
            ));
        }

        Ok(packet)
    }

    /// Initialize an outbound packet in a freshly allocated slot. The packet
    /// spans the entire slot; padding hides the real payload length.
    pub fn prepare(mut slot: Slot) -> ProtocolResult<Packet> {
        let capacity = slot.capacity();

        if capacity < ENVELOPE_SIZE {
            return Err(Error::new(
                ErrorKind::Encode,
                "slot smaller than the envelope",
            ));
        }
        if capacity > u16::max_value() as usize {
            return Err(Error::new(
                ErrorKind::Encode,
                "slot exceeds the addressable packet size",
            ));
        }

        let data = slot.data_mut();
        BigEndian::write_u32(&mut data[PROTOCOL_OFFSET..PROTOCOL_OFFSET + 4], PROTOCOL_ID);
        for byte in data[SENDER_OFFSET..PAYLOAD_OFFSET].iter_mut() {
            *byte = 0;
        }
        BigEndian::write_u16(
            &mut data[PACKET_SIZE_OFFSET..PACKET_SIZE_OFFSET + 2],
            capacity as u16,
        );

        Ok(Packet { slot })
    }

    #[inline]
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    /// Hand the backing slot out for retention in a buffer.
    #[inline]
    pub fn clone_slot(&self) -> Slot {
        self.slot.clone()
    }

    /// Unwrap the view, keeping only the backing slot.
    #[inline]
    pub fn into_slot(self) -> Slot {
        self.slot
    }

    /// The full serialized packet bytes.
    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.slot.data()[..self.packet_size() as usize]
    }

    /// Owned duplicate sized to the stated packet size.
    #[inline]
    pub fn copy(&self) -> Vec<u8> {
        self.buffer().to_vec()
    }

    #[inline]
    pub fn sender(&self) -> PeerId {
        let mut raw = [0u8; PeerId::SIZE];
        raw.copy_from_slice(&self.slot.data()[SENDER_OFFSET..SENDER_OFFSET + PeerId::SIZE]);
        PeerId::new(raw)
    }

    #[inline]
    pub fn recipient(&self) -> PeerId {
        let mut raw = [0u8; PeerId::SIZE];
        raw.copy_from_slice(&self.slot.data()[RECIPIENT_OFFSET..RECIPIENT_OFFSET + PeerId::SIZE]);
        PeerId::new(raw)
    }

    #[inline]
    pub fn channel(&self) -> ChannelId {
        ChannelId::from_raw(BigEndian::read_u32(
            &self.slot.data()[CHANNEL_OFFSET..CHANNEL_OFFSET + 4],
        ))
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::from_raw(BigEndian::read_u16(
            &self.slot.data()[FLAGS_OFFSET..FLAGS_OFFSET + 2],
        ))
    }

    #[inline]
    pub fn packet_size(&self) -> u16 {
        BigEndian::read_u16(&self.slot.data()[PACKET_SIZE_OFFSET..PACKET_SIZE_OFFSET + 2])
    }

    #[inline]
    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.slot.data()[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 2])
    }

    #[inline]
    pub fn payload_size(&self) -> u16 {
        BigEndian::read_u16(&self.slot.data()[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 2])
    }

    #[inline]
    pub fn set_sender(&mut self, sender: &PeerId) {
        self.slot.data_mut()[SENDER_OFFSET..SENDER_OFFSET + PeerId::SIZE]
            .copy_from_slice(sender.raw());
    }

    #[inline]
    pub fn set_recipient(&mut self, recipient: &PeerId) {
        self.slot.data_mut()[RECIPIENT_OFFSET..RECIPIENT_OFFSET + PeerId::SIZE]
            .copy_from_slice(recipient.raw());
    }

    #[inline]
    pub fn set_channel(&mut self, channel: ChannelId) {
        BigEndian::write_u32(
            &mut self.slot.data_mut()[CHANNEL_OFFSET..CHANNEL_OFFSET + 4],
            channel.raw(),
        );
    }

    #[inline]
    pub fn set_flags(&mut self, flags: Flags) {
        BigEndian::write_u16(
            &mut self.slot.data_mut()[FLAGS_OFFSET..FLAGS_OFFSET + 2],
            flags.raw(),
        );
    }

    #[inline]
    pub fn set_sequence(&mut self, sequence: u16) {
        BigEndian::write_u16(
            &mut self.slot.data_mut()[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 2],
            sequence,
        );
    }

    /// Shrink or restate the packet size. The size must still cover the
    /// envelope and the current payload, and fit the slot.
    pub fn set_packet_size(&mut self, size: u16) -> ProtocolResult<()> {
        let minimum = ENVELOPE_SIZE + self.payload_size() as usize;

        if (size as usize) < minimum || size as usize > self.slot.capacity() {
            return Err(Error::new(
                ErrorKind::Encode,
                "packet size violates the buffer bounds",
            ));
        }

        BigEndian::write_u16(
            &mut self.slot.data_mut()[PACKET_SIZE_OFFSET..PACKET_SIZE_OFFSET + 2],
            size,
        );
        Ok(())
    }

    pub fn set_payload_size(&mut self, size: u16) -> ProtocolResult<()> {
        if size as usize > self.max_payload_size() {
            return Err(Error::new(
                ErrorKind::Encode,
                "payload size violates the buffer bounds",
            ));
        }

        BigEndian::write_u16(
            &mut self.slot.data_mut()[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 2],
            size,
        );
        Ok(())
    }

    /// Payload bytes the packet can carry.
    #[inline]
    pub fn max_payload_size(&self) -> usize {
        self.packet_size() as usize - ENVELOPE_SIZE
    }

    /// The stated (non-padding) payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.slot.data()[PAYLOAD_OFFSET..PAYLOAD_OFFSET + self.payload_size() as usize]
    }

    /// The entire writable message region, padding included.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.packet_size() as usize - FOOTER_SIZE;
        &mut self.slot.data_mut()[PAYLOAD_OFFSET..end]
    }

    /// Fill the region between the stated payload and the footer with the
    /// padding byte, `padding_size mod 256`.
    pub fn write_padding(&mut self) {
        let start = PAYLOAD_OFFSET + self.payload_size() as usize;
        let end = self.packet_size() as usize - FOOTER_SIZE;
        let value = (end - start) as u8;

        for byte in self.slot.data_mut()[start..end].iter_mut() {
            *byte = value;
        }
    }

    #[inline]
    fn compute_checksum(&self) -> u32 {
        let end = self.packet_size() as usize - FOOTER_SIZE;
        CRC32.checksum(&self.slot.data()[..end])
    }

    #[inline]
    pub fn checksum(&self) -> u32 {
        let offset = self.packet_size() as usize - FOOTER_SIZE;
        BigEndian::read_u32(&self.slot.data()[offset..offset + 4])
    }

    pub fn write_checksum(&mut self) {
        let checksum = self.compute_checksum();
        let offset = self.packet_size() as usize - FOOTER_SIZE;

        BigEndian::write_u32(&mut self.slot.data_mut()[offset..offset + 4], checksum);
    }

    /// Recompute the CRC-32 over the stated packet bytes minus the footer and
    /// compare against the stored value.
    #[inline]
    pub fn has_valid_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum()
    }

    /// Lazy message sequence over the payload region. Iteration never reads
    /// past the stated payload size; constructing a fresh iterator restarts
    /// the parse.
    #[inline]
    pub fn messages(&self) -> MessageIter {
        MessageIter::new(self.payload(), PAYLOAD_OFFSET)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Packet(channel: {}, size: {}, payload: {}, seq: {})",
            self.channel(),
            self.packet_size(),
            self.payload_size(),
            self.sequence()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::Cookie;
    use crate::message::Message;
    use crate::pool::Pool;
    use crate::sync::LockStrategy;

    const SLOT_SIZE: usize = 128;

    fn pool() -> Pool {
        Pool::new(SLOT_SIZE, 4, LockStrategy::SingleThread, None)
    }

    fn build_packet(pool: &Pool) -> Packet {
        let mut packet = Packet::prepare(pool.allocate().unwrap()).unwrap();

        packet.set_sender(&PeerId::new([1; 16]));
        packet.set_recipient(&PeerId::new([2; 16]));
        packet.set_channel(ChannelId::new(0xa1a1, 0xb2b2));
        packet.set_sequence(7);

        let message = Message::ChannelNew {
            initiator: 0xa1a1,
            cookie: Cookie::from_raw(0xdead_beef),
        };
        let written = message.write(packet.payload_mut()).unwrap();
        packet.set_payload_size(written as u16).unwrap();
        packet.write_padding();
        packet.write_checksum();

        packet
    }

    #[test]
    fn test_prepare_parse_roundtrip() {
        let pool = pool();
        let packet = build_packet(&pool);

        // Reparse the serialized bytes through a second slot.
        let mut slot = pool.allocate().unwrap();
        slot.data_mut().copy_from_slice(packet.slot().data());
        let parsed = Packet::parse(slot).unwrap();

        assert_eq!(parsed.sender(), PeerId::new([1; 16]));
        assert_eq!(parsed.recipient(), PeerId::new([2; 16]));
        assert_eq!(parsed.channel(), ChannelId::new(0xa1a1, 0xb2b2));
        assert_eq!(parsed.sequence(), 7);
        assert_eq!(parsed.packet_size() as usize, SLOT_SIZE);
        assert_eq!(parsed.payload_size(), 7);
        assert!(parsed.has_valid_checksum());
        assert_eq!(parsed.buffer(), packet.buffer());
    }

    #[test]
    fn test_padding_bytes() {
        let pool = pool();
        let packet = build_packet(&pool);

        // payload = 7, so padding covers bytes 55..124 with value
        // (128 - 52 - 7) mod 256 = 69.
        assert_eq!(packet.payload_size(), 7);
        assert_eq!(packet.packet_size() as usize, 128);

        let data = packet.slot().data();
        for &byte in &data[PAYLOAD_OFFSET + 7..128 - FOOTER_SIZE] {
            assert_eq!(byte, 69);
        }
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        let pool = Pool::new(ENVELOPE_SIZE - 1, 2, LockStrategy::SingleThread, None);
        let result = Packet::parse(pool.allocate().unwrap());

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_parse_rejects_protocol_mismatch() {
        let pool = pool();
        let packet = build_packet(&pool);

        let mut slot = pool.allocate().unwrap();
        slot.data_mut().copy_from_slice(packet.slot().data());
        slot.data_mut()[0] ^= 0xff;

        let result = Packet::parse(slot);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_parse_rejects_oversized_packet_size() {
        let pool = pool();
        let packet = build_packet(&pool);

        let mut slot = pool.allocate().unwrap();
        slot.data_mut().copy_from_slice(packet.slot().data());
        BigEndian::write_u16(&mut slot.data_mut()[PACKET_SIZE_OFFSET..PACKET_SIZE_OFFSET + 2], 129);

        let result = Packet::parse(slot);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let pool = pool();
        let packet = build_packet(&pool);

        let mut slot = pool.allocate().unwrap();
        slot.data_mut().copy_from_slice(packet.slot().data());
        slot.data_mut()[PAYLOAD_OFFSET] ^= 1;

        let parsed = Packet::parse(slot).unwrap();

        assert!(!parsed.has_valid_checksum());
    }

    #[test]
    fn test_copy_is_sized_to_packet() {
        let pool = Pool::new(256, 2, LockStrategy::SingleThread, None);
        let mut packet = Packet::prepare(pool.allocate().unwrap()).unwrap();

        packet.set_packet_size(100).unwrap();
        packet.write_checksum();

        assert_eq!(packet.copy().len(), 100);
        assert_eq!(packet.slot().capacity(), 256);
    }

    #[test]
    fn test_payload_size_bounds() {
        let pool = pool();
        let mut packet = Packet::prepare(pool.allocate().unwrap()).unwrap();

        let max = packet.max_payload_size();

        assert!(packet.set_payload_size(max as u16).is_ok());
        assert_eq!(
            packet.set_payload_size(max as u16 + 1).unwrap_err().kind(),
            ErrorKind::Encode
        );
    }

    #[test]
    fn test_packet_size_bounds() {
        let pool = pool();
        let mut packet = Packet::prepare(pool.allocate().unwrap()).unwrap();

        packet.set_payload_size(8).unwrap();

        assert_eq!(
            packet
                .set_packet_size((ENVELOPE_SIZE + 7) as u16)
                .unwrap_err()
                .kind(),
            ErrorKind::Encode
        );
        assert!(packet.set_packet_size((ENVELOPE_SIZE + 8) as u16).is_ok());
        assert_eq!(
            packet.set_packet_size(SLOT_SIZE as u16 + 1).unwrap_err().kind(),
            ErrorKind::Encode
        );
    }

    #[test]
    fn test_messages_iterates_payload() {
        let pool = pool();
        let packet = build_packet(&pool);

        let messages: Vec<_> = packet.messages().collect();

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::ChannelNew { initiator, cookie } => {
                assert_eq!(*initiator, 0xa1a1);
                assert_eq!(cookie.raw(), 0xdead_beef);
            }
            other => panic!("Unexpected message {:?}", other),
        }

        // Iteration is restartable and yields the same sequence.
        let again: Vec<_> = packet.messages().collect();
        assert_eq!(again, messages);
    }

    #[test]
    fn test_prepare_rejects_tiny_slot() {
        let pool = Pool::new(16, 2, LockStrategy::SingleThread, None);
        let result = Packet::prepare(pool.allocate().unwrap());

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Encode);
    }
}
