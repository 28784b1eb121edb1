use std::fmt;

/// Wire protocol identifier. Packets carrying anything else are rejected
/// during envelope parsing.
pub const PROTOCOL_ID: u32 = 0x0c22_9d94;

/// The reserved all-zero channel used exclusively for handshake traffic.
pub const DEFAULT_CHANNELID: ChannelId = ChannelId(0);

const PEER_ID_SIZE: usize = 16;

/// Opaque 16 byte peer identity, generated randomly at node creation and
/// stable across connections.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    pub const SIZE: usize = PEER_ID_SIZE;

    #[inline]
    pub fn new(raw: [u8; PEER_ID_SIZE]) -> PeerId {
        PeerId(raw)
    }

    /// Fresh random identity for a newly created node.
    #[inline]
    pub fn random() -> PeerId {
        PeerId(rand::random::<[u8; PEER_ID_SIZE]>())
    }

    #[inline]
    pub fn raw(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// 32 bit channel identifier viewed as two 16 bit halves. The initiator
/// half occupies the high bits. A zero half means "unfilled"; the all-zero
/// id is the handshake channel.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    #[inline]
    pub fn new(initiator: u16, responder: u16) -> ChannelId {
        ChannelId(((initiator as u32) << 16) | responder as u32)
    }

    #[inline]
    pub fn from_raw(raw: u32) -> ChannelId {
        ChannelId(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn initiator(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub fn responder(self) -> u16 {
        self.0 as u16
    }

    /// Both halves zero; the handshake channel.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Initiator half set, responder half still unfilled.
    #[inline]
    pub fn is_partial_initiator(self) -> bool {
        self.initiator() != 0 && self.responder() == 0
    }

    /// Responder half set without an initiator half. Never valid on its own.
    #[inline]
    pub fn is_partial_responder(self) -> bool {
        self.initiator() == 0 && self.responder() != 0
    }

    #[inline]
    pub fn is_complete(self) -> bool {
        self.initiator() != 0 && self.responder() != 0
    }

    /// Drops the responder half, yielding the partial id the initiator
    /// originally advertised.
    #[inline]
    pub fn create_partial(self) -> ChannelId {
        ChannelId(self.0 & 0xffff_0000)
    }

    /// Fills in the responder half.
    #[inline]
    pub fn make_full(self, responder: u16) -> ChannelId {
        ChannelId(self.0 | responder as u32)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.initiator(), self.responder())
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChannelId({})", self)
    }
}

/// Capability bits asserted by the responder when a channel is finalized.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(transparent)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const RESEND: Capabilities = Capabilities(1);
    pub const ORDERED: Capabilities = Capabilities(1 << 1);
    pub const CLOSE_ON_LOSS: Capabilities = Capabilities(1 << 2);

    #[inline]
    pub fn empty() -> Capabilities {
        Capabilities(0)
    }

    #[inline]
    pub fn from_raw(raw: u16) -> Capabilities {
        Capabilities(raw)
    }

    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: Capabilities) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn with(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Capabilities({:#06x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        let peer = PeerId::new([0xab; 16]);

        assert_eq!(peer.to_string(), "ab".repeat(16));
    }

    #[test]
    fn test_peer_id_random_distinct() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_channel_id_halves() {
        let id = ChannelId::new(0xa1a1, 0xb2b2);

        assert_eq!(id.raw(), 0xa1a1_b2b2);
        assert_eq!(id.initiator(), 0xa1a1);
        assert_eq!(id.responder(), 0xb2b2);
        assert_eq!(id.to_string(), "a1a1:b2b2");
    }

    #[test]
    fn test_channel_id_predicates() {
        assert!(DEFAULT_CHANNELID.is_empty());
        assert!(ChannelId::new(0xa1a1, 0).is_partial_initiator());
        assert!(ChannelId::new(0, 0xb2b2).is_partial_responder());
        assert!(ChannelId::new(0xa1a1, 0xb2b2).is_complete());
        assert!(!ChannelId::new(0xa1a1, 0xb2b2).is_partial_initiator());
    }

    #[test]
    fn test_partial_full_roundtrip() {
        let partial = ChannelId::new(0xa1a1, 0);
        let full = partial.make_full(0xb2b2);

        assert_eq!(full, ChannelId::new(0xa1a1, 0xb2b2));
        assert_eq!(full.create_partial(), partial);
    }

    #[test]
    fn test_capabilities_bits() {
        assert_eq!(Capabilities::RESEND.raw(), 0b001);
        assert_eq!(Capabilities::ORDERED.raw(), 0b010);
        assert_eq!(Capabilities::CLOSE_ON_LOSS.raw(), 0b100);

        let caps = Capabilities::RESEND.with(Capabilities::ORDERED);

        assert!(caps.contains(Capabilities::RESEND));
        assert!(caps.contains(Capabilities::ORDERED));
        assert!(!caps.contains(Capabilities::CLOSE_ON_LOSS));
    }
}
