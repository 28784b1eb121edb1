//! Keyed handshake cookies.
//!
//! A cookie is a keyed checksum over the peer pair and the channel material.
//! It lets the responder prove a peer participated in an earlier handshake
//! step without keeping per-handshake state; the cookie itself is the state.

use crate::identity::{ChannelId, PeerId};
use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::fmt;

/// 32 bit cookie value carried in handshake messages.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Cookie(u32);

impl Cookie {
    pub const SIZE: usize = 4;

    #[inline]
    pub fn from_raw(raw: u32) -> Cookie {
        Cookie(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Cookie({:#010x})", self.0)
    }
}

/// Keyed PRF producing at least 32 bits. The default is CRC-32; a real MAC
/// can be substituted without wire changes since only the low 32 bits are
/// ever serialized.
pub trait Prf {
    fn digest(&self, secret: &[u8], material: &[u8]) -> u32;
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 instantiation of the cookie PRF.
pub struct Crc32Prf;

impl Prf for Crc32Prf {
    #[inline]
    fn digest(&self, secret: &[u8], material: &[u8]) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(secret);
        digest.update(material);
        digest.finalize()
    }
}

/// Returns the current cookie secret. Invoked on every create and validate so
/// the host may rotate secrets; in-flight handshakes under a retired secret
/// fail validation and are retried by timeout.
pub type SecretGenerator = Box<dyn Fn() -> Vec<u8>>;

/// Creates and validates handshake cookies with the host-supplied secret.
pub struct CookieFactory {
    secret: SecretGenerator,
    prf: Box<dyn Prf>,
}

impl CookieFactory {
    #[inline]
    pub fn new(secret: SecretGenerator) -> CookieFactory {
        CookieFactory {
            secret,
            prf: Box::new(Crc32Prf),
        }
    }

    /// Swap the PRF implementation. The factory keeps the same material
    /// layout, so the wire format is untouched.
    #[inline]
    pub fn with_prf(secret: SecretGenerator, prf: Box<dyn Prf>) -> CookieFactory {
        CookieFactory { secret, prf }
    }

    /// Cookie binding the initiator half of a channel to the peer pair.
    pub fn initiator(&self, initiator: &PeerId, responder: &PeerId, half: u16) -> Cookie {
        let mut material = [0u8; PeerId::SIZE * 2 + 2];
        material[..PeerId::SIZE].copy_from_slice(initiator.raw());
        material[PeerId::SIZE..PeerId::SIZE * 2].copy_from_slice(responder.raw());
        BigEndian::write_u16(&mut material[PeerId::SIZE * 2..], half);

        Cookie(self.prf.digest(&(self.secret)(), &material))
    }

    /// Cookie binding the full channel id to the peer pair.
    pub fn responder(&self, initiator: &PeerId, responder: &PeerId, channel: ChannelId) -> Cookie {
        let mut material = [0u8; PeerId::SIZE * 2 + 4];
        material[..PeerId::SIZE].copy_from_slice(initiator.raw());
        material[PeerId::SIZE..PeerId::SIZE * 2].copy_from_slice(responder.raw());
        BigEndian::write_u32(&mut material[PeerId::SIZE * 2..], channel.raw());

        Cookie(self.prf.digest(&(self.secret)(), &material))
    }

    #[inline]
    pub fn validate_initiator(
        &self,
        cookie: Cookie,
        initiator: &PeerId,
        responder: &PeerId,
        half: u16,
    ) -> bool {
        self.initiator(initiator, responder, half) == cookie
    }

    #[inline]
    pub fn validate_responder(
        &self,
        cookie: Cookie,
        initiator: &PeerId,
        responder: &PeerId,
        channel: ChannelId,
    ) -> bool {
        self.responder(initiator, responder, channel) == cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> CookieFactory {
        CookieFactory::new(Box::new(|| b"s".to_vec()))
    }

    #[test]
    fn test_create_validate_roundtrip() {
        let cookies = factory();
        let a = PeerId::new([1; 16]);
        let b = PeerId::new([2; 16]);

        let cookie = cookies.initiator(&a, &b, 0xa1a1);
        assert!(cookies.validate_initiator(cookie, &a, &b, 0xa1a1));

        let channel = ChannelId::new(0xa1a1, 0xb2b2);
        let cookie = cookies.responder(&a, &b, channel);
        assert!(cookies.validate_responder(cookie, &a, &b, channel));
    }

    #[test]
    fn test_single_bit_flip_invalidates() {
        let cookies = factory();
        let a = PeerId::new([1; 16]);
        let b = PeerId::new([2; 16]);
        let half = 0xa1a1;

        let cookie = cookies.initiator(&a, &b, half);

        // Flip each bit of the half in turn.
        for bit in 0..16 {
            assert!(!cookies.validate_initiator(cookie, &a, &b, half ^ (1 << bit)));
        }

        // Flip one bit of each peer id.
        let mut raw = *a.raw();
        raw[0] ^= 1;
        assert!(!cookies.validate_initiator(cookie, &PeerId::new(raw), &b, half));

        let mut raw = *b.raw();
        raw[15] ^= 0x80;
        assert!(!cookies.validate_initiator(cookie, &a, &PeerId::new(raw), half));
    }

    #[test]
    fn test_variants_differ() {
        let cookies = factory();
        let a = PeerId::new([1; 16]);
        let b = PeerId::new([2; 16]);
        let channel = ChannelId::new(0xa1a1, 0xb2b2);

        // The initiator cookie binds only the initiator half, the responder
        // cookie the full id.
        assert_ne!(
            cookies.initiator(&a, &b, channel.initiator()),
            cookies.responder(&a, &b, channel)
        );
    }

    #[test]
    fn test_secret_rotation_invalidates() {
        use std::cell::Cell;
        use std::rc::Rc;

        let generation = Rc::new(Cell::new(0u8));
        let handle = generation.clone();
        let cookies = CookieFactory::new(Box::new(move || vec![handle.get()]));

        let a = PeerId::new([1; 16]);
        let b = PeerId::new([2; 16]);

        let cookie = cookies.initiator(&a, &b, 0xa1a1);
        generation.set(1);

        assert!(!cookies.validate_initiator(cookie, &a, &b, 0xa1a1));
    }
}
