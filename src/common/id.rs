//! Kademlia node id or a lookup key
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia Unique ID, used for node ids, value keys and lookup targets.
pub struct Kuid(pub [u8; ID_SIZE]);

impl Kuid {
    pub const MIN: Kuid = Kuid([0; ID_SIZE]);
    pub const MAX: Kuid = Kuid([0xff; ID_SIZE]);

    pub fn random() -> Kuid {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Kuid(random_bytes)
    }

    /// Create a new Kuid from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Kuid> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Kuid(tmp))
    }

    /// The SHA1 hash of some content as a Kuid.
    pub fn from_content(content: &[u8]) -> Kuid {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(content);

        Kuid(hasher.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn xor(&self, other: &Kuid) -> Kuid {
        let mut result = [0_u8; ID_SIZE];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Kuid(result)
    }

    /// Flips every bit, the furthest possible id from this one.
    pub fn invert(&self) -> Kuid {
        let mut result = self.0;
        for byte in result.iter_mut() {
            *byte = !*byte;
        }

        Kuid(result)
    }

    /// Simplified XOR distance between this Kuid and a target Kuid.
    ///
    /// The distance is the number of trailing bits after the common prefix.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Kuid is 160
    /// Distance to a Kuid with 5 leading matching bits is 155
    pub fn distance(&self, other: &Kuid) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Returns `true` if this id is strictly closer to `target` than `other` is.
    pub fn is_nearer_to(&self, target: &Kuid, other: &Kuid) -> bool {
        self.xor(target) < other.xor(target)
    }

    /// A random Kuid whose [Kuid::distance] from `self` is exactly `distance`.
    ///
    /// Used to pick a lookup target inside the range of a routing table bucket.
    pub fn random_at_distance(&self, distance: u8) -> Kuid {
        if distance == 0 {
            return *self;
        }
        let distance = distance.min(MAX_DISTANCE);

        let mut random = Kuid::random();

        // Bit index (from the most significant) of the first differing bit.
        let flip = (MAX_DISTANCE - distance) as usize;

        for bit in 0..=flip {
            let byte = bit / 8;
            let mask = 0x80_u8 >> (bit % 8);
            let own = self.0[byte] & mask;

            random.0[byte] &= !mask;
            if bit == flip {
                random.0[byte] |= own ^ mask;
            } else {
                random.0[byte] |= own;
            }
        }

        random
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

pub(crate) fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

impl FromStr for Kuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Kuid> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            match (hex_value(pair[0]), hex_value(pair[1])) {
                (Some(high), Some(low)) => bytes[i] = (high << 4) | low,
                _ => return Err(Error::InvalidIdEncoding(s.to_string())),
            }
        }

        Ok(Kuid(bytes))
    }
}

impl Display for Kuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Kuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({self})")
    }
}

impl From<[u8; ID_SIZE]> for Kuid {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Kuid(bytes)
    }
}
