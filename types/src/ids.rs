use crate::errors::DhtError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

/// Width of the identifier space in bytes.
pub const ID_BYTES: usize = 20;
/// Width of the identifier space in bits (`m` in ring arithmetic).
pub const ID_BITS: u32 = 160;
/// Length of the canonical lowercase hex rendering.
pub const ID_HEX_DIGITS: usize = 40;

/// A position in the 160-bit identifier space.
///
/// Stored big-endian, so the derived byte ordering is the numeric ordering.
/// Every key and every node address hashes into this space; all ring
/// arithmetic is modulo 2^160.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    /// SHA-1 of the UTF-8 bytes of `input`.
    pub fn hash_of(input: &str) -> Self {
        let digest = Sha1::digest(input.as_bytes());
        Id(digest.into())
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Canonical 40-digit lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        if s.len() != ID_HEX_DIGITS {
            return Err(DhtError::BadId(s.to_string()));
        }
        let raw = hex::decode(s).map_err(|_| DhtError::BadId(s.to_string()))?;
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&raw);
        Ok(Id(bytes))
    }

    /// `(self + 2^exp) mod 2^160`. Finger targets; `exp` must be below 160.
    pub fn add_pow2(&self, exp: u32) -> Id {
        debug_assert!(exp < ID_BITS);
        let mut out = self.0;
        let mut idx = ID_BYTES - 1 - (exp as usize / 8);
        let mut carry = 1u16 << (exp % 8);
        loop {
            let sum = out[idx] as u16 + carry;
            out[idx] = (sum & 0xff) as u8;
            carry = sum >> 8;
            if carry == 0 || idx == 0 {
                break;
            }
            idx -= 1;
        }
        // carry out of the top byte wraps around the ring
        Id(out)
    }

    /// Absolute numeric difference `|self − other|` as a 160-bit magnitude.
    pub fn distance(&self, other: &Id) -> Id {
        let (hi, lo) = if self >= other {
            (self, other)
        } else {
            (other, self)
        };
        let mut out = [0u8; ID_BYTES];
        let mut borrow = 0i16;
        for i in (0..ID_BYTES).rev() {
            let mut diff = hi.0[i] as i16 - lo.0[i] as i16 - borrow;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = diff as u8;
        }
        Id(out)
    }

    /// Value of the `i`-th hex digit (most significant first), `i < 40`.
    pub fn hex_digit(&self, i: usize) -> u8 {
        let byte = self.0[i / 2];
        if i % 2 == 0 { byte >> 4 } else { byte & 0x0f }
    }

    /// Number of leading hex digits shared with `other`.
    pub fn shared_prefix_len(&self, other: &Id) -> usize {
        (0..ID_HEX_DIGITS)
            .take_while(|&i| self.hex_digit(i) == other.hex_digit(i))
            .count()
    }
}

/// Membership of `key` on the clockwise arc from `from` to `to`.
///
/// The arc is open at `from`; `include_to` closes it at `to`. Wraparound
/// (`from > to`) splits into `(from, 2^160) ∪ [0, to]`. When `from == to`
/// the arc spans the whole ring.
pub fn in_ring(key: &Id, from: &Id, to: &Id, include_to: bool) -> bool {
    use std::cmp::Ordering;
    match from.cmp(to) {
        Ordering::Less => (from < key && key < to) || (include_to && key == to),
        Ordering::Greater => key > from || key < to || (include_to && key == to),
        Ordering::Equal => include_to || key != from,
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}..)", &self.to_hex()[..10])
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct IdVisitor;

impl Visitor<'_> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a 40-digit lowercase hex identifier")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Id, E> {
        Id::from_hex(v).map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        deserializer.deserialize_str(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(hex40: &str) -> Id {
        Id::from_hex(hex40).unwrap()
    }

    fn low(n: u8) -> Id {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 1] = n;
        Id::from_bytes(bytes)
    }

    #[test]
    fn sha1_known_answer() {
        assert_eq!(
            Id::hash_of("abc").to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(Id::hash_of("Toy Story"), Id::hash_of("Toy Story"));
        assert_ne!(Id::hash_of("Toy Story"), Id::hash_of("Toy Story 2"));
    }

    #[test]
    fn hex_round_trip() {
        let original = Id::hash_of("127.0.0.1:4411");
        assert_eq!(Id::from_hex(&original.to_hex()).unwrap(), original);
        assert!(Id::from_hex("abc").is_err());
        assert!(Id::from_hex(&"g".repeat(ID_HEX_DIGITS)).is_err());
    }

    #[test]
    fn serde_uses_hex_string() {
        let original = low(0xab);
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, format!("\"{}\"", original.to_hex()));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn ring_membership_without_wrap() {
        let (a, b) = (low(10), low(20));
        assert!(in_ring(&low(15), &a, &b, false));
        assert!(!in_ring(&low(10), &a, &b, false));
        assert!(!in_ring(&low(20), &a, &b, false));
        assert!(in_ring(&low(20), &a, &b, true));
        assert!(!in_ring(&low(25), &a, &b, true));
    }

    #[test]
    fn ring_membership_with_wrap() {
        let (a, b) = (low(200), low(5));
        assert!(in_ring(&low(250), &a, &b, false));
        assert!(in_ring(&low(3), &a, &b, false));
        assert!(!in_ring(&low(100), &a, &b, false));
        assert!(!in_ring(&low(5), &a, &b, false));
        assert!(in_ring(&low(5), &a, &b, true));
    }

    #[test]
    fn ring_membership_degenerate_interval() {
        // a == b: the arc covers the whole ring
        let a = low(42);
        assert!(in_ring(&low(7), &a, &a, false));
        assert!(in_ring(&low(7), &a, &a, true));
        assert!(!in_ring(&a, &a, &a, false));
        assert!(in_ring(&a, &a, &a, true));
    }

    #[test]
    fn add_pow2_carries_across_bytes() {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 1] = 0xff;
        let one_past = Id::from_bytes(bytes).add_pow2(0);
        let mut expected = [0u8; ID_BYTES];
        expected[ID_BYTES - 2] = 1;
        assert_eq!(one_past, Id::from_bytes(expected));
    }

    #[test]
    fn add_pow2_wraps_modulo_ring() {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0x80; // 2^159
        let wrapped = Id::from_bytes(bytes).add_pow2(159);
        assert_eq!(wrapped, Id::default());
    }

    #[test]
    fn distance_is_symmetric() {
        let (a, b) = (low(10), low(200));
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&b), low(190));
        assert_eq!(a.distance(&a), Id::default());
    }

    #[test]
    fn distance_borrows_across_bytes() {
        let mut hi = [0u8; ID_BYTES];
        hi[ID_BYTES - 2] = 1; // 256
        let d = Id::from_bytes(hi).distance(&low(1));
        assert_eq!(d, low(255));
    }

    #[test]
    fn shared_prefix_counts_hex_digits() {
        let a = id("a9993e364706816aba3e25717850c26c9cd0d89d");
        let b = id("a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(a.shared_prefix_len(&b), ID_HEX_DIGITS);
        let c = id("a99a3e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(a.shared_prefix_len(&c), 3);
        let d = id("b9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(a.shared_prefix_len(&d), 0);
    }

    #[test]
    fn hex_digit_reads_nibbles() {
        let a = id("a1b2000000000000000000000000000000000000");
        assert_eq!(a.hex_digit(0), 0xa);
        assert_eq!(a.hex_digit(1), 0x1);
        assert_eq!(a.hex_digit(2), 0xb);
        assert_eq!(a.hex_digit(3), 0x2);
    }
}
