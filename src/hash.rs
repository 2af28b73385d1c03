//! Cryptographic hashing.
//!
//! A [`Hash`] is the BLAKE2b-256 digest of some data, prefixed with a version byte. It is what an
//! [`IdentityKey`](crate::identity::IdentityKey) signs, and what the armor checksum is cut from.

use crate::CryptoError;

use blake2::{digest::consts::U32, Blake2b, Digest};
use subtle::ConstantTimeEq;

use std::{convert::TryFrom, fmt};

/// Default hash algorithm version.
pub const DEFAULT_HASH_VERSION: u8 = 1;

/// Minimum accepted hash algorithm version.
pub const MIN_HASH_VERSION: u8 = 1;

/// Maximum accepted hash algorithm version.
pub const MAX_HASH_VERSION: u8 = 1;

pub(crate) const V1_HASH_SIZE: usize = 32;

pub(crate) type Blake2b256 = Blake2b<U32>;

/// Cryptographically secure hash of data.
#[derive(Clone)]
pub struct Hash {
    version: u8,
    digest: [u8; V1_HASH_SIZE],
}

impl Hash {
    /// Hash some data with the default algorithm.
    pub fn new(data: impl AsRef<[u8]>) -> Hash {
        let mut state = HashState::new();
        state.update(data);
        state.finalize()
    }

    /// Hash some data with a specific algorithm version.
    pub fn with_version(data: impl AsRef<[u8]>, version: u8) -> Result<Hash, CryptoError> {
        if !(MIN_HASH_VERSION..=MAX_HASH_VERSION).contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        Ok(Self::new(data))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// The raw digest, without the version byte.
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn as_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(1 + V1_HASH_SIZE);
        v.push(self.version);
        v.extend_from_slice(&self.digest);
        v
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.as_vec()).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        let raw = bs58::decode(s)
            .into_vec()
            .or(Err(CryptoError::BadFormat("Not valid Base58")))?;
        Self::try_from(&raw[..])
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, data) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get Hash version",
            expected: 1,
            actual: 0,
        })?;
        if !(MIN_HASH_VERSION..=MAX_HASH_VERSION).contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let digest: [u8; V1_HASH_SIZE] = TryFrom::try_from(data).or(Err(CryptoError::BadLength {
            step: "get Hash digest",
            expected: V1_HASH_SIZE,
            actual: data.len(),
        }))?;
        Ok(Hash { version, digest })
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && bool::from(self.digest.ct_eq(&other.digest))
    }
}

impl Eq for Hash {}

impl std::hash::Hash for Hash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.version.hash(state);
        self.digest.hash(state);
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hash")
            .field("version", &self.version)
            .field("digest", &self.digest)
            .finish()
    }
}

impl fmt::Display for Hash {
    /// Display as a base58-encoded string.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// A hasher that can incrementally take in data and produce a [`Hash`].
#[derive(Clone)]
pub struct HashState {
    state: Blake2b256,
}

impl HashState {
    pub fn new() -> Self {
        Self {
            state: Blake2b256::new(),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        Digest::update(&mut self.state, data.as_ref());
    }

    pub fn finalize(self) -> Hash {
        let mut digest = [0u8; V1_HASH_SIZE];
        digest.copy_from_slice(&self.state.finalize());
        Hash {
            version: DEFAULT_HASH_VERSION,
            digest,
        }
    }
}

impl Default for HashState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HashState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("HashState")
    }
}
