//! Kademlia node Id or a storage key
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// Kademlia node Id or a storage key.
///
/// Ordered as an unsigned big-endian number. Bit `0` is the most significant bit.
pub struct Id(pub(crate) [u8; ID_SIZE]);

/// Result of [Id::first_differing_bit].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitIndex {
    /// Index of the most significant bit where the two ids differ.
    At(usize),
    /// `self` has no set bit, the ids diverge at the first set bit of the other id.
    AllZero,
    /// Both ids are equal.
    Identical,
}

impl Id {
    /// The all-zero identifier.
    pub const MIN: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Random id sharing its first `depth` bits with `prefix`.
    pub fn random_with_prefix(prefix: &Id, depth: usize) -> Id {
        let mut id = Id::random();

        for i in 0..depth.min(ID_BITS) {
            id = if prefix.bit(i) {
                id.with_bit_set(i)
            } else {
                id.with_bit_cleared(i)
            };
        }

        id
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// SHA-1 digest of arbitrary bytes, used to derive storage keys.
    pub fn digest<T: AsRef<[u8]>>(data: T) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(data.as_ref());

        Id(hasher.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR distance to another Id, itself an Id so it can be ordered.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Value of the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        let (byte, mask) = Self::locate(index);
        self.0[byte] & mask != 0
    }

    pub fn with_bit_set(&self, index: usize) -> Id {
        let (byte, mask) = Self::locate(index);
        let mut bytes = self.0;
        bytes[byte] |= mask;
        Id(bytes)
    }

    pub fn with_bit_cleared(&self, index: usize) -> Id {
        let (byte, mask) = Self::locate(index);
        let mut bytes = self.0;
        bytes[byte] &= !mask;
        Id(bytes)
    }

    pub fn with_bit_flipped(&self, index: usize) -> Id {
        let (byte, mask) = Self::locate(index);
        let mut bytes = self.0;
        bytes[byte] ^= mask;
        Id(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Index of the most significant bit where `self` and `other` differ.
    pub fn first_differing_bit(&self, other: &Id) -> BitIndex {
        if self == other {
            return BitIndex::Identical;
        }
        if self.is_zero() {
            return BitIndex::AllZero;
        }

        BitIndex::At(self.xor(other).leading_zeros())
    }

    /// Number of leading bits shared with `other`.
    pub fn shared_prefix_len(&self, other: &Id) -> usize {
        match self.first_differing_bit(other) {
            BitIndex::At(index) => index,
            BitIndex::AllZero => other.leading_zeros(),
            BitIndex::Identical => ID_BITS,
        }
    }

    /// Clears every bit from `depth` onwards, leaving the prefix.
    pub(crate) fn prefix(&self, depth: usize) -> Id {
        (depth..ID_BITS).fold(*self, |id, i| id.with_bit_cleared(i))
    }

    fn locate(index: usize) -> (usize, u8) {
        debug_assert!(index < ID_BITS);
        (index / 8, 0b1000_0000 >> (index % 8))
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(matches!(
            Id::from_bytes([0_u8; 19]),
            Err(Error::InvalidIdSize(19))
        ));
        assert!(matches!(
            Id::from_bytes([0_u8; 21]),
            Err(Error::InvalidIdSize(21))
        ));
        assert!(Id::from_bytes([7_u8; 20]).is_ok());
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::from_str("0639A1E24FBB8AB277DF033476AB0DE10FAB3BDC").unwrap();

        assert_eq!(id.to_string(), "0639a1e24fbb8ab277df033476ab0de10fab3bdc");
        assert!(Id::from_str("0639a1").is_err());
        assert!(Id::from_str("zz39a1e24fbb8ab277df033476ab0de10fab3bdc").is_err());
    }

    #[test]
    fn xor_metric() {
        for _ in 0..32 {
            let a = Id::random();
            let b = Id::random();

            assert!(a.xor(&a).is_zero());
            assert_eq!(a.xor(&b), b.xor(&a));
            assert_eq!(a.xor(&b).is_zero(), a == b);
        }
    }

    #[test]
    fn total_order_is_big_endian() {
        let mut low = [0_u8; ID_SIZE];
        low[19] = 0xff;
        let mut high = [0_u8; ID_SIZE];
        high[0] = 0x01;

        let low = Id(low);
        let high = Id(high);

        assert!(low < high);
        assert!(Id::MIN < low);
        assert_eq!(low.cmp(&low), std::cmp::Ordering::Equal);
    }

    #[test]
    fn bit_operations_are_immutable() {
        let id = Id::MIN;
        let set = id.with_bit_set(0);

        assert!(!id.bit(0));
        assert!(set.bit(0));
        assert_eq!(set.0[0], 0b1000_0000);
        assert_eq!(set.with_bit_cleared(0), id);
        assert_eq!(set.with_bit_flipped(0), id);
        assert_eq!(id.with_bit_flipped(159).0[19], 1);
    }

    #[test]
    fn first_differing_bit() {
        let a = Id::from_str("f000000000000000000000000000000000000000").unwrap();
        let b = Id::from_str("f800000000000000000000000000000000000000").unwrap();

        assert_eq!(a.first_differing_bit(&b), BitIndex::At(4));
        assert_eq!(a.first_differing_bit(&a), BitIndex::Identical);
        assert_eq!(Id::MIN.first_differing_bit(&b), BitIndex::AllZero);

        assert_eq!(a.shared_prefix_len(&b), 4);
        assert_eq!(Id::MIN.shared_prefix_len(&b), 0);
        assert_eq!(Id::MIN.shared_prefix_len(&Id::MIN.with_bit_set(9)), 9);
        assert_eq!(a.shared_prefix_len(&a), ID_BITS);
    }

    #[test]
    fn random_with_prefix() {
        let prefix = Id::random();

        for depth in [0, 1, 7, 8, 33, 160] {
            let id = Id::random_with_prefix(&prefix, depth);
            assert!(id.shared_prefix_len(&prefix) >= depth);
        }
    }

    #[test]
    fn prefix_clears_suffix() {
        let id = Id::from_str("ffffffffffffffffffffffffffffffffffffffff").unwrap();

        assert_eq!(id.prefix(0), Id::MIN);
        assert_eq!(
            id.prefix(12).to_string(),
            "fff0000000000000000000000000000000000000"
        );
        assert_eq!(id.prefix(ID_BITS), id);
    }

    #[test]
    fn digest_is_sha1() {
        assert_eq!(
            Id::digest(b"abc").to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
