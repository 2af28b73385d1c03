//! Public-Key encryption.
//!
//! A [`LockKey`] is an X25519 private key, and its [`LockId`] is the matching public key. Anyone
//! holding a `LockId` can seal a [`StreamKey`] for it; only the `LockKey` can open the result.
//! This is how an envelope's content key and a submission's session key reach each recipient.
//!
//! # Example
//!
//! ```
//! # use tip_crypto::lock::*;
//! # use tip_crypto::stream::*;
//! let mut csprng = rand::rngs::OsRng {};
//! let receiver = LockKey::new_temp(&mut csprng);
//!
//! let session = StreamKey::new_temp(&mut csprng);
//! let sealed = session.export_for_lock(&mut csprng, receiver.id()).unwrap();
//!
//! let opened = receiver.decrypt_stream_key(&sealed).unwrap();
//! assert_eq!(opened.id(), session.id());
//! ```
//!
//! # Algorithm
//!
//! Each lockbox gets a fresh ephemeral X25519 key pair. The shared secret between the ephemeral
//! private key and the `LockId` is used directly as the XChaCha20-Poly1305 key, and the ephemeral
//! public key travels in the lockbox header.
//!
//! # Format
//!
//! A `LockId` is a version byte followed by the 32-byte public key. A `LockKey` is a version byte
//! followed by the 32-byte secret, and only ever appears inside a [`LockLockbox`].

use crate::{
    lockbox::*,
    stream::{stream_key_encrypt, ContainedStreamKey, new_stream_key, StreamKey},
    CryptoError, CryptoSrc,
};

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use std::{convert::TryFrom, fmt, sync::Arc};

/// Default public-key encryption algorithm version.
pub const DEFAULT_LOCK_VERSION: u8 = 1;

/// Minimum accepted public-key encryption algorithm version.
pub const MIN_LOCK_VERSION: u8 = 1;

/// Maximum accepted public-key encryption algorithm version.
pub const MAX_LOCK_VERSION: u8 = 1;

const V1_LOCK_ID_SIZE: usize = 32;
const V1_LOCK_KEY_SIZE: usize = 32;

pub(crate) fn lock_id_size(_version: u8) -> usize {
    1 + V1_LOCK_ID_SIZE
}

pub(crate) fn lock_eph_size(_version: u8) -> usize {
    V1_LOCK_ID_SIZE
}

/// A key that allows decrypting data meant for a particular [`LockId`].
#[derive(Clone)]
pub struct LockKey {
    interface: Arc<dyn LockInterface>,
}

impl LockKey {
    /// Generate a temporary `LockKey` that exists only in program memory.
    pub fn new_temp<R>(csprng: &mut R) -> LockKey
    where
        R: CryptoRng + RngCore,
    {
        new_lock_key(Arc::new(ContainedLockKey::generate(csprng)))
    }

    /// Generate a temporary `LockKey` with a specific version. Fails if the version is
    /// unsupported.
    pub fn new_temp_with_version<R>(csprng: &mut R, version: u8) -> Result<LockKey, CryptoError>
    where
        R: CryptoRng + RngCore,
    {
        let interface = Arc::new(ContainedLockKey::with_version(csprng, version)?);
        Ok(new_lock_key(interface))
    }

    /// Version of Diffie-Hellman key exchange algorithm used by this key.
    pub fn version(&self) -> u8 {
        self.interface.id().version()
    }

    /// The public identifier for this key.
    pub fn id(&self) -> &LockId {
        self.interface.id()
    }

    /// Attempt to decrypt a `StreamLockbox` with this key.
    pub fn decrypt_stream_key(&self, lockbox: &StreamLockbox) -> Result<StreamKey, CryptoError> {
        self.interface.decrypt_stream_key(lockbox)
    }

    /// Pack this key into a `LockLockbox` addressed to `stream`. Returns None if the key cannot be
    /// exported.
    pub fn export_for_stream<R: CryptoRng + RngCore>(
        &self,
        csprng: &mut R,
        stream: &StreamKey,
    ) -> Option<LockLockbox> {
        self.interface.self_export_stream(csprng, stream)
    }
}

impl fmt::Debug for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockKey")
            .field("version", &self.version())
            .field("lock_id", &self.id().raw_public_key())
            .finish()
    }
}

impl fmt::Display for LockKey {
    /// Display just the LockId (never the underlying key).
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.id(), f)
    }
}

/// Create a new `LockKey` to hold a `LockInterface` implementation.
pub fn new_lock_key(interface: Arc<dyn LockInterface>) -> LockKey {
    LockKey { interface }
}

/// A decryption interface, implemented by anything that can hold a private cryptographic
/// decryption key.
pub trait LockInterface: Send + Sync {
    /// Get the corresponding `LockId` for the private key.
    fn id(&self) -> &LockId;

    /// Decrypt a `StreamKey` sealed for this key's `LockId`.
    fn decrypt_stream_key(&self, lockbox: &StreamLockbox) -> Result<StreamKey, CryptoError>;

    /// Export the decryption key in a `LockLockbox`, with `receive_stream` as the recipient. If the
    /// key cannot be exported, this should return None.
    fn self_export_stream(
        &self,
        csprng: &mut dyn CryptoSrc,
        receive_stream: &StreamKey,
    ) -> Option<LockLockbox>;
}

/// An identifier for a corresponding [`LockKey`] that can be used to encrypt data for that key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockId {
    inner: x25519_dalek::PublicKey,
}

impl LockId {
    /// Get the cryptographic algorithm version used for this ID.
    pub fn version(&self) -> u8 {
        1u8
    }

    /// Get the raw public encryption key contained within.
    pub fn raw_public_key(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Convert into a byte vector.
    pub fn as_vec(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.encode_vec(&mut v);
        v
    }

    /// Attempt to parse a base58-encoded `LockId`.
    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        let raw = bs58::decode(s)
            .into_vec()
            .or(Err(CryptoError::BadFormat("Not valid Base58")))?;
        Self::try_from(&raw[..])
    }

    /// Convert into a base58-encoded `LockId`.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.as_vec()).into_string()
    }

    /// Encode onto an existing byte vector: the version followed by the public key.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.len());
        buf.push(self.version());
        buf.extend_from_slice(self.inner.as_bytes());
    }

    /// Get the length of this `LockId` once encoded as bytes.
    pub fn len(&self) -> usize {
        1 + V1_LOCK_ID_SIZE
    }
}

impl TryFrom<&[u8]> for LockId {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, data) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get LockId version",
            expected: 1,
            actual: 0,
        })?;
        if version < MIN_LOCK_VERSION {
            return Err(CryptoError::OldVersion(version));
        }
        if version > MAX_LOCK_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let inner: [u8; V1_LOCK_ID_SIZE] =
            TryFrom::try_from(data).map_err(|_| CryptoError::BadLength {
                step: "get LockId public key",
                expected: V1_LOCK_ID_SIZE,
                actual: data.len(),
            })?;
        Ok(Self {
            inner: x25519_dalek::PublicKey::from(inner),
        })
    }
}

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockId")
            .field("version", &self.version())
            .field("public_key", &self.raw_public_key())
            .finish()
    }
}

impl fmt::Display for LockId {
    /// Display as a base58-encoded string.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// Encrypt data for a `LockId`, returning the raw lockbox bytes. Key exports use this; user code
/// goes through [`StreamKey::export_for_lock`].
pub(crate) fn lock_id_encrypt(
    id: &LockId,
    csprng: &mut dyn CryptoSrc,
    lock_type: LockboxType,
    content: &[u8],
) -> Vec<u8> {
    assert!(
        !lock_type.is_for_stream(),
        "Tried to encrypt a non-lock-recipient lockbox with a LockId"
    );

    let mut nonce = [0u8; V1_LOCKBOX_NONCE_SIZE];
    csprng.fill_bytes(&mut nonce);
    let eph = x25519_dalek::EphemeralSecret::random_from_rng(&mut *csprng);
    let eph_pub = x25519_dalek::PublicKey::from(&eph);

    let version = id.version();
    let header_len = 2 + id.len() + eph_pub.as_bytes().len();
    let nonce_len = lockbox_nonce_size(version);
    let mut lockbox =
        Vec::with_capacity(header_len + nonce_len + content.len() + lockbox_tag_size(version));
    lockbox.push(version);
    lockbox.push(lock_type.as_u8());
    id.encode_vec(&mut lockbox);
    lockbox.extend_from_slice(eph_pub.as_bytes());
    lockbox.extend_from_slice(&nonce);
    lockbox.extend_from_slice(content);

    let (additional, rest) = lockbox.split_at_mut(header_len);
    let (_, content) = rest.split_at_mut(nonce_len);
    let secret = eph.diffie_hellman(&id.inner);
    let aead = XChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
    // Encryption only fails past 256 GiB of content.
    let tag = aead
        .encrypt_in_place_detached(&XNonce::from(nonce), additional, content)
        .expect("More data than the cipher can accept was put in");
    lockbox.extend_from_slice(&tag);
    lockbox
}

/// A self-contained implementor of `LockInterface`.
pub struct ContainedLockKey {
    id: LockId,
    key: x25519_dalek::StaticSecret,
}

impl ContainedLockKey {
    /// Generate a new key given a cryptographic random number generator.
    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let key = x25519_dalek::StaticSecret::random_from_rng(csprng);
        let id = LockId {
            inner: x25519_dalek::PublicKey::from(&key),
        };
        Self { id, key }
    }

    /// Generate a new key with a specific version. Fails if the version isn't supported.
    pub fn with_version<R>(csprng: &mut R, version: u8) -> Result<Self, CryptoError>
    where
        R: CryptoRng + RngCore,
    {
        if !(MIN_LOCK_VERSION..=MAX_LOCK_VERSION).contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        Ok(Self::generate(csprng))
    }

    /// Encode directly to a byte vector. The resulting vector should be zeroized or overwritten
    /// before being dropped.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.reserve(1 + V1_LOCK_KEY_SIZE);
        buf.push(self.id.version());
        let mut raw_key = self.key.to_bytes();
        buf.extend_from_slice(&raw_key);
        raw_key.zeroize();
    }

    fn decrypt_parts(&self, recipient: &LockboxRecipient, parts: LockboxParts) -> Result<Vec<u8>, CryptoError> {
        match recipient {
            LockboxRecipient::LockId(id) if id == &self.id => (),
            LockboxRecipient::LockId(_) => {
                return Err(CryptoError::ObjectMismatch(
                    "LockKey being used on a lockbox meant for a different LockId",
                ))
            }
            LockboxRecipient::StreamId(_) => {
                return Err(CryptoError::ObjectMismatch(
                    "Attempted to use a LockKey to decrypt a lockbox with a StreamId recipient",
                ))
            }
        }
        let eph_pub = parts.eph_pub.unwrap_or_default();
        let eph_pub: [u8; V1_LOCK_ID_SIZE] =
            TryFrom::try_from(eph_pub).map_err(|_| CryptoError::BadLength {
                step: "get Lockbox ephemeral public key",
                expected: V1_LOCK_ID_SIZE,
                actual: eph_pub.len(),
            })?;
        let secret = self
            .key
            .diffie_hellman(&x25519_dalek::PublicKey::from(eph_pub));
        if !secret.was_contributory() {
            return Err(CryptoError::BadKey);
        }
        let aead = XChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
        let payload = Payload {
            msg: parts.ciphertext,
            aad: parts.additional,
        };
        aead.decrypt(XNonce::from_slice(parts.nonce), payload)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

impl TryFrom<&[u8]> for ContainedLockKey {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, raw_key) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get LockKey version",
            expected: 1,
            actual: 0,
        })?;
        if version < MIN_LOCK_VERSION {
            return Err(CryptoError::OldVersion(version));
        }
        if version > MAX_LOCK_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let mut raw: [u8; V1_LOCK_KEY_SIZE] =
            TryFrom::try_from(raw_key).map_err(|_| CryptoError::BadLength {
                step: "get LockKey key bytes",
                expected: V1_LOCK_KEY_SIZE,
                actual: raw_key.len(),
            })?;
        let key = x25519_dalek::StaticSecret::from(raw);
        raw.zeroize();
        let id = LockId {
            inner: x25519_dalek::PublicKey::from(&key),
        };
        Ok(Self { id, key })
    }
}

impl LockInterface for ContainedLockKey {
    fn id(&self) -> &LockId {
        &self.id
    }

    fn decrypt_stream_key(&self, lockbox: &StreamLockbox) -> Result<StreamKey, CryptoError> {
        let mut raw = self.decrypt_parts(lockbox.recipient(), lockbox.as_parts())?;
        let result = ContainedStreamKey::try_from(&raw[..]);
        raw.zeroize();
        Ok(new_stream_key(Arc::new(result?)))
    }

    fn self_export_stream(
        &self,
        csprng: &mut dyn CryptoSrc,
        receive_stream: &StreamKey,
    ) -> Option<LockLockbox> {
        let mut raw_secret = Vec::new();
        self.encode_vec(&mut raw_secret);
        let lockbox_vec = stream_key_encrypt(receive_stream, csprng, LockboxType::Lock(true), &raw_secret);
        raw_secret.zeroize();
        Some(lock_lockbox_from_parts(
            LockboxRecipient::StreamId(receive_stream.id().clone()),
            lockbox_vec,
        ))
    }
}
