//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, also the number of k-buckets.
pub const ID_BITS: usize = ID_SIZE * 8;
/// Longest bit string accepted by [leading_ones] (256 bits).
pub const MAX_PREFIX_LEN_BYTES: usize = 32;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdentifier(format!(
                "expected {} bytes, got {}",
                ID_SIZE,
                bytes.len()
            )));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Derive the lookup target for a stored key (sha1 of the key).
    pub fn from_key(key: &str) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(key.as_bytes());

        Id(hasher.digest().bytes())
    }

    /// XOR distance between this Id and another.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut xor = [0_u8; ID_SIZE];
        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(xor)
    }

    /// Number of leading bits shared with `other`, in `0..ID_BITS`.
    ///
    /// A node never routes to itself, so `self == other` is an error.
    pub fn common_prefix_len(&self, other: &Id) -> Result<usize> {
        let distance = self.distance(other);

        if distance.is_zero() {
            return Err(Error::InvalidIdentifier(format!(
                "no prefix length between {} and itself",
                self
            )));
        }

        Ok(distance.leading_zeros())
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
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
        let bytes = hex::decode(s)
            .map_err(|error| Error::InvalidIdentifier(format!("{:?}: {}", s, error)))?;

        Id::from_bytes(bytes)
    }
}

/// XOR of two [Id]s, ordered as an unsigned big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_SIZE]);

impl Distance {
    /// XOR distance between two raw identifiers.
    ///
    /// Both slices must be exactly [ID_SIZE] bytes long.
    pub fn between(a: &[u8], b: &[u8]) -> Result<Distance> {
        if a.len() != b.len() {
            return Err(Error::InvalidIdentifier(format!(
                "mismatched identifier lengths {} and {}",
                a.len(),
                b.len()
            )));
        }

        Ok(Id::from_bytes(a)?.distance(&Id::from_bytes(b)?))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Leading zero bits, [ID_BITS] for a zero distance.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// Count the leading 1 bits of a big-endian bit string of 1 to
/// [MAX_PREFIX_LEN_BYTES] bytes.
pub fn leading_ones(bytes: &[u8]) -> Result<usize> {
    if bytes.is_empty() || bytes.len() > MAX_PREFIX_LEN_BYTES {
        return Err(Error::InvalidIdentifier(format!(
            "invalid bit string length: {}",
            bytes.len()
        )));
    }

    for (i, byte) in bytes.iter().enumerate() {
        if *byte != 0xff {
            return Ok(i * 8 + byte.leading_ones() as usize);
        }
    }

    Ok(bytes.len() * 8)
}

#[cfg(test)]
mod test {
    use super::*;

    fn id_with_first_byte(first: u8) -> Id {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[0] = first;
        Id::from(bytes)
    }

    #[test]
    fn distance_to_self_is_zero() {
        let id = Id::random();

        assert!(id.distance(&id).is_zero());
        assert_eq!(id.distance(&id).leading_zeros(), ID_BITS);
    }

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..100 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.distance(&b), b.distance(&a));
            if a != b {
                assert!(!a.distance(&b).is_zero());
            }
        }
    }

    #[test]
    fn single_high_bit() {
        let a = id_with_first_byte(0x00);
        let b = id_with_first_byte(0x80);

        assert_eq!(a.distance(&b).as_bytes()[0], 0x80);
        assert_eq!(a.common_prefix_len(&b).unwrap(), 0);
    }

    #[test]
    fn raw_distance_rejects_bad_lengths() {
        assert!(matches!(
            Distance::between(&[0x00], &[0x80]),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(matches!(
            Distance::between(&[0; ID_SIZE], &[0; ID_SIZE + 1]),
            Err(Error::InvalidIdentifier(_))
        ));

        let distance = Distance::between(&[0xff; ID_SIZE], &[0x0f; ID_SIZE]).unwrap();
        assert_eq!(distance.as_bytes(), &[0xf0; ID_SIZE]);
    }

    #[test]
    fn common_prefix_len_of_self_is_an_error() {
        let id = Id::random();

        assert!(matches!(
            id.common_prefix_len(&id),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn common_prefix_len_is_monotonic_with_distance() {
        let local = Id::random();

        for _ in 0..200 {
            let x = Id::random();
            let y = Id::random();

            if x == local || y == local {
                continue;
            }

            if local.distance(&x) < local.distance(&y) {
                assert!(
                    local.common_prefix_len(&x).unwrap() >= local.common_prefix_len(&y).unwrap()
                );
            }
        }
    }

    #[test]
    fn prefix_len() {
        let cases: [(&[u8], usize); 8] = [
            (&[0x00], 0),
            (&[0x80], 1),
            (&[0xC0], 2),
            (&[0xE0], 3),
            (&[0xF0, 0x00], 4),
            (&[0xFF, 0x00], 8),
            (&[0xFF, 0xF0, 0x00], 12),
            (&[0xFF, 0xFF], 16),
        ];

        for (bytes, expected) in cases {
            assert_eq!(leading_ones(bytes).unwrap(), expected, "{:x?}", bytes);
        }

        assert!(leading_ones(&[]).is_err());
        assert!(leading_ones(&[0xff; MAX_PREFIX_LEN_BYTES + 1]).is_err());
        assert_eq!(leading_ones(&[0xff; MAX_PREFIX_LEN_BYTES]).unwrap(), 256);
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::random();
        let parsed: Id = id.to_string().parse().unwrap();

        assert_eq!(parsed, id);
        assert!("abcd".parse::<Id>().is_err());
        assert!("zz".parse::<Id>().is_err());
    }

    #[test]
    fn from_key_is_stable() {
        assert_eq!(Id::from_key("foo"), Id::from_key("foo"));
        assert_ne!(Id::from_key("foo"), Id::from_key("bar"));
        assert_eq!(
            Id::from_key("").to_string(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }
}
