use std::fmt::{Debug, Display, Formatter};
use bytes::{Buf, BufMut};
use rand::RngCore;
use crate::error::CourierError;

/// Opaque payload identifier. Acknowledgements refer to a payload by its nonce, so it must be
///  unique among a client's in-flight payloads.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Nonce(pub [u8; 16]);

impl Nonce {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn new_random() -> Nonce {
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        rand::rng().fill_bytes(&mut raw);
        Nonce(raw)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Nonce, CourierError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(CourierError::protocol(format!("nonce requires {} bytes, only {} available", Self::SERIALIZED_LEN, buf.remaining())));
        }
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut raw);
        Ok(Nonce(raw))
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_random_is_unique() {
        let a = Nonce::new_random();
        let b = Nonce::new_random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_is_hex() {
        let nonce = Nonce([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 255]);
        assert_eq!(nonce.to_string(), "000102030405060708090a0b0c0d0eff");
        assert_eq!(format!("{:?}", nonce), "Nonce(000102030405060708090a0b0c0d0eff)");
    }

    #[test]
    fn test_ser_deser() {
        let nonce = Nonce::new_random();
        let mut buf = Vec::new();
        nonce.ser(&mut buf);
        buf.extend_from_slice(b"rest");

        let mut b: &[u8] = &buf;
        assert_eq!(Nonce::try_deser(&mut b).unwrap(), nonce);
        assert_eq!(b, b"rest");
    }

    #[test]
    fn test_deser_too_short() {
        let mut b: &[u8] = &[1u8; 15];
        assert!(matches!(Nonce::try_deser(&mut b), Err(CourierError::Protocol(_))));
    }
}
