use bytes::Bytes;
use data_encoding::HEXLOWER;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const BLOCK_HASH_LEN: usize = 16;

/// BLAKE2b-128 digest of a block's plaintext.
/// It also serves as the XXTEA key the block was encrypted with.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash([u8; BLOCK_HASH_LEN]);

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] data_encoding::DecodeError),
}

type Blake2b128 = blake2::Blake2b<digest::consts::U16>;

impl BlockHash {
    /// Hashes the given plaintext.
    pub fn of(data: &[u8]) -> Self {
        use digest::Digest;
        Self(Blake2b128::digest(data).into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let raw = HEXLOWER.decode(s.to_ascii_lowercase().as_bytes())?;
        Self::try_from(raw.as_slice())
    }
}

impl TryFrom<&[u8]> for BlockHash {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; BLOCK_HASH_LEN] = value
            .try_into()
            .map_err(|_| Error::InvalidDigestLen(value.len()))?;
        Ok(Self(arr))
    }
}

impl From<[u8; BLOCK_HASH_LEN]> for BlockHash {
    fn from(value: [u8; BLOCK_HASH_LEN]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blake2b:{}", self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Location and identity of one block of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Opaque key in the object store.
    #[serde(with = "hex_bytes")]
    pub key: Bytes,
    pub hash: BlockHash,
}

mod hex_bytes {
    use bytes::Bytes;
    use data_encoding::HEXLOWER;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
