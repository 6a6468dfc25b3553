use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{borrow::Borrow, fmt, str::FromStr};
use uint::*;

use crate::{error::Error, KEY_LENGTH, NUM_BUCKETS};

/// A 160-bit identifier. Used both for node ids and for content keys.
#[derive(Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LENGTH]);

construct_uint! {
    /// 192-bit unsigned integer, the smallest word multiple holding a 160-bit distance.
    pub(crate) struct U192(3);
}

impl Key {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Key(bytes)
    }

    /// Content key of `value`: its SHA-1 digest.
    pub fn from_content<T>(value: T) -> Self
    where
        T: Borrow<[u8]>,
    {
        Key(Sha1::digest(value.borrow()).into())
    }

    pub fn random() -> Self {
        Key(rand::thread_rng().gen::<[u8; KEY_LENGTH]>())
    }

    /// Random key whose bucket index relative to `local` is `index`.
    ///
    /// The distance keeps bit `index` set, clears every higher bit and
    /// randomizes the lower ones.
    pub fn random_in_bucket(local: &Key, index: usize) -> Self {
        let index = index.min(NUM_BUCKETS - 1);
        let mut distance = rand::thread_rng().gen::<[u8; KEY_LENGTH]>();

        let byte = KEY_LENGTH - 1 - index / 8;
        let bit = (index % 8) as u32;

        distance[..byte].iter_mut().for_each(|b| *b = 0);
        let low_mask = (1u8 << bit).wrapping_sub(1);
        distance[byte] = (distance[byte] & low_mask) | (1u8 << bit);

        let mut bytes = local.0;
        for (b, d) in bytes.iter_mut().zip(distance.iter()) {
            *b ^= d;
        }
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// XOR of both ids read as a big-endian unsigned integer.
    pub fn distance(&self, other: &Key) -> Distance {
        let a = U192::from_big_endian(self.0.as_slice());
        let b = U192::from_big_endian(other.0.as_slice());

        Distance(a ^ b)
    }

    /// Index of the bucket `other` belongs to in a table owned by `self`.
    ///
    /// This is the position of the highest set bit of the distance, which is
    /// `159 - 8 * same_bytes - p` with `p` the first differing bit inside the
    /// first differing byte. Identical ids map to bucket 0.
    pub fn bucket_index(&self, other: &Key) -> usize {
        self.distance(other)
            .ilog2()
            .map_or(0, |index| index as usize)
    }
}

impl From<[u8; KEY_LENGTH]> for Key {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Key(bytes)
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        <[u8; KEY_LENGTH]>::try_from(decoded.as_slice())
            .map(Key)
            .map_err(|_| {
                Error::InvalidKey(format!(
                    "expected {KEY_LENGTH} bytes, got {}",
                    decoded.len()
                ))
            })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub(crate) U192);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Position of the highest set bit, `None` for a zero distance.
    pub fn ilog2(&self) -> Option<u32> {
        (192 - self.0.leading_zeros()).checked_sub(1)
    }
}
