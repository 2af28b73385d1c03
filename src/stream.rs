//! Symmetric-Key encryption.
//!
//! A [`StreamKey`] is a XChaCha20-Poly1305 key. Each one has a [`StreamId`] so a lockbox can name
//! the key needed to open it without revealing the key.
//!
//! Stream keys play three roles in this crate:
//! - the per-message content key of an envelope,
//! - the per-submission session key shared between a whistleblower and the receivers,
//! - the key that a protection secret is stretched into when a private key is locked.
//!
//! # Example
//!
//! ```
//! # use std::convert::TryFrom;
//! # use tip_crypto::stream::*;
//! # use tip_crypto::lockbox::*;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut csprng = rand::rngs::OsRng {};
//! let key = StreamKey::new_temp(&mut csprng);
//!
//! let lockbox = key.encrypt_data(&mut csprng, b"answers to the questionnaire");
//! let encoded = lockbox.as_bytes().to_vec();
//!
//! let decoded = DataLockbox::try_from(&encoded[..])?;
//! assert_eq!(key.decrypt_data(&decoded)?, b"answers to the questionnaire");
//! # Ok(())
//! # }
//! ```
//!
//! # Format
//!
//! A `StreamId` is a version byte followed by the 32-byte BLAKE2b-256 hash of the domain string
//! `tip-crypto stream id` and the raw key. A `StreamKey` is encoded as a version byte followed by
//! the 32-byte key, and that encoding only ever appears inside a [`StreamLockbox`].

use crate::{
    hash::Blake2b256,
    identity::{new_identity_key, ContainedIdKey, IdentityKey},
    lock::{lock_id_encrypt, new_lock_key, ContainedLockKey, LockId, LockKey},
    lockbox::*,
    CryptoError, CryptoSrc,
};

use blake2::Digest;
use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use std::{convert::TryFrom, fmt, sync::Arc};

/// Default symmetric-key encryption algorithm version.
pub const DEFAULT_STREAM_VERSION: u8 = 1;

/// Minimum accepted symmetric-key encryption algorithm version.
pub const MIN_STREAM_VERSION: u8 = 1;

/// Maximum accepted symmetric-key encryption algorithm version.
pub const MAX_STREAM_VERSION: u8 = 1;

pub(crate) const V1_STREAM_ID_SIZE: usize = 32;
pub(crate) const V1_STREAM_KEY_SIZE: usize = 32;

const STREAM_ID_DOMAIN: &[u8] = b"tip-crypto stream id";

/// Get expected size of an encoded StreamId for a given version. Version *must* be validated
/// before calling this.
pub(crate) fn stream_id_size(_version: u8) -> usize {
    1 + V1_STREAM_ID_SIZE
}

/// Stream Key that allows encrypting data into a lockbox and decrypting it later.
#[derive(Clone)]
pub struct StreamKey {
    interface: Arc<dyn StreamInterface>,
}

impl StreamKey {
    /// Generate a temporary `StreamKey` that exists only in program memory.
    pub fn new_temp<R>(csprng: &mut R) -> StreamKey
    where
        R: CryptoRng + RngCore,
    {
        new_stream_key(Arc::new(ContainedStreamKey::generate(csprng)))
    }

    /// Generate a temporary `StreamKey` with a specific version. Fails if the version is
    /// unsupported.
    pub fn new_temp_with_version<R>(csprng: &mut R, version: u8) -> Result<StreamKey, CryptoError>
    where
        R: CryptoRng + RngCore,
    {
        let interface = Arc::new(ContainedStreamKey::with_version(csprng, version)?);
        Ok(new_stream_key(interface))
    }

    /// Build a key from 32 bytes of derived key material. The caller keeps ownership of (and
    /// should zeroize) the input.
    pub(crate) fn from_derived(raw: &[u8; V1_STREAM_KEY_SIZE]) -> StreamKey {
        new_stream_key(Arc::new(ContainedStreamKey::from_raw(DEFAULT_STREAM_VERSION, raw)))
    }

    /// Version of symmetric encryption algorithm used by this key.
    pub fn version(&self) -> u8 {
        self.interface.id().version()
    }

    /// The publicly shareable identifier for this key.
    pub fn id(&self) -> &StreamId {
        self.interface.id()
    }

    /// Encrypt a byte slice into a `DataLockbox`.
    pub fn encrypt_data<R: CryptoRng + RngCore>(&self, csprng: &mut R, content: &[u8]) -> DataLockbox {
        data_lockbox_from_parts(
            LockboxRecipient::StreamId(self.id().clone()),
            self.interface.encrypt(csprng, LockboxType::Data(true), content),
        )
    }

    /// Attempt to decrypt an `IdentityLockbox` with this key.
    pub fn decrypt_identity_key(&self, lockbox: &IdentityLockbox) -> Result<IdentityKey, CryptoError> {
        self.interface.decrypt_identity_key(lockbox)
    }

    /// Attempt to decrypt a `LockLockbox` with this key.
    pub fn decrypt_lock_key(&self, lockbox: &LockLockbox) -> Result<LockKey, CryptoError> {
        self.interface.decrypt_lock_key(lockbox)
    }

    /// Attempt to decrypt a `StreamLockbox` with this key.
    pub fn decrypt_stream_key(&self, lockbox: &StreamLockbox) -> Result<StreamKey, CryptoError> {
        self.interface.decrypt_stream_key(lockbox)
    }

    /// Attempt to decrypt a `DataLockbox` with this key.
    pub fn decrypt_data(&self, lockbox: &DataLockbox) -> Result<Vec<u8>, CryptoError> {
        self.interface.decrypt_data(lockbox)
    }

    /// Pack this key into a `StreamLockbox` that only the holder of `lock`'s private key can open.
    /// Returns None if this key cannot be exported.
    pub fn export_for_lock<R: CryptoRng + RngCore>(
        &self,
        csprng: &mut R,
        lock: &LockId,
    ) -> Option<StreamLockbox> {
        self.interface.self_export_lock(csprng, lock)
    }

    /// Pack this key into a `StreamLockbox` addressed to another `StreamKey`. Returns None if this
    /// key cannot be exported.
    pub fn export_for_stream<R: CryptoRng + RngCore>(
        &self,
        csprng: &mut R,
        stream: &StreamKey,
    ) -> Option<StreamLockbox> {
        self.interface.self_export_stream(csprng, stream)
    }
}

impl PartialEq for StreamKey {
    /// Keys are equal when their identifiers are, as the identifier is a hash of the key.
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for StreamKey {}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamKey")
            .field("version", &self.version())
            .field("stream_id", &self.id().raw_identifier())
            .finish()
    }
}

impl fmt::Display for StreamKey {
    /// Display just the StreamId (never the underlying key).
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.id(), f)
    }
}

/// Encrypt data with a `StreamKey`, returning the raw lockbox bytes. Used by key exports.
pub(crate) fn stream_key_encrypt(
    key: &StreamKey,
    csprng: &mut dyn CryptoSrc,
    lock_type: LockboxType,
    content: &[u8],
) -> Vec<u8> {
    key.interface.encrypt(csprng, lock_type, content)
}

/// Create a new `StreamKey` to hold a `StreamInterface` implementation.
pub fn new_stream_key(interface: Arc<dyn StreamInterface>) -> StreamKey {
    StreamKey { interface }
}

/// A symmetric encryption/decryption interface, implemented by anything that can hold a symmetric
/// encryption key.
pub trait StreamInterface: Send + Sync {
    /// Get the corresponding `StreamId` for the symmetric key.
    fn id(&self) -> &StreamId;

    /// Encrypt raw data into a lockbox, following the `StreamId`-recipient lockbox format.
    fn encrypt(&self, csprng: &mut dyn CryptoSrc, lock_type: LockboxType, content: &[u8]) -> Vec<u8>;

    fn decrypt_identity_key(&self, lockbox: &IdentityLockbox) -> Result<IdentityKey, CryptoError>;

    fn decrypt_lock_key(&self, lockbox: &LockLockbox) -> Result<LockKey, CryptoError>;

    fn decrypt_stream_key(&self, lockbox: &StreamLockbox) -> Result<StreamKey, CryptoError>;

    fn decrypt_data(&self, lockbox: &DataLockbox) -> Result<Vec<u8>, CryptoError>;

    /// Export the symmetric key for a `LockId` recipient. None if the key can't leave its store.
    fn self_export_lock(&self, csprng: &mut dyn CryptoSrc, receive_lock: &LockId) -> Option<StreamLockbox>;

    /// Export the symmetric key for a `StreamKey` recipient. None if the key can't leave its
    /// store.
    fn self_export_stream(
        &self,
        csprng: &mut dyn CryptoSrc,
        receive_stream: &StreamKey,
    ) -> Option<StreamLockbox>;
}

/// Compute the corresponding StreamId for a given raw key.
fn stream_id_from_key(version: u8, key: &[u8]) -> StreamId {
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, STREAM_ID_DOMAIN);
    Digest::update(&mut hasher, key);
    let mut id = [0u8; V1_STREAM_ID_SIZE];
    id.copy_from_slice(&hasher.finalize());
    StreamId { version, id }
}

/// A self-contained implementor of `StreamInterface`.
pub struct ContainedStreamKey {
    key: [u8; V1_STREAM_KEY_SIZE],
    id: StreamId,
}

impl ContainedStreamKey {
    /// Generate a new key, given a cryptographic RNG.
    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let mut key = [0u8; V1_STREAM_KEY_SIZE];
        csprng.fill_bytes(&mut key);
        let new = Self::from_raw(DEFAULT_STREAM_VERSION, &key);
        key.zeroize();
        new
    }

    /// Generate a new key with a specific version. Fails if the version isn't supported.
    pub fn with_version<R>(csprng: &mut R, version: u8) -> Result<Self, CryptoError>
    where
        R: CryptoRng + RngCore,
    {
        if !(MIN_STREAM_VERSION..=MAX_STREAM_VERSION).contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        Ok(Self::generate(csprng))
    }

    fn from_raw(version: u8, raw: &[u8; V1_STREAM_KEY_SIZE]) -> Self {
        Self {
            key: *raw,
            id: stream_id_from_key(version, raw),
        }
    }

    /// Encode directly to a byte vector. The resulting vector should be zeroized or overwritten
    /// before being dropped.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.reserve(1 + V1_STREAM_KEY_SIZE);
        buf.push(self.id.version());
        buf.extend_from_slice(&self.key);
    }

    fn decrypt_parts(&self, recipient: &LockboxRecipient, parts: LockboxParts) -> Result<Vec<u8>, CryptoError> {
        match recipient {
            LockboxRecipient::StreamId(id) if id == &self.id => (),
            LockboxRecipient::StreamId(_) => {
                return Err(CryptoError::ObjectMismatch(
                    "StreamKey being used on a lockbox meant for a different StreamId",
                ))
            }
            LockboxRecipient::LockId(_) => {
                return Err(CryptoError::ObjectMismatch(
                    "Attempted to use a StreamKey to decrypt a lockbox with a LockId recipient",
                ))
            }
        }
        let aead = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let payload = Payload {
            msg: parts.ciphertext,
            aad: parts.additional,
        };
        aead.decrypt(XNonce::from_slice(parts.nonce), payload)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    fn export_raw(
        &self,
        csprng: &mut dyn CryptoSrc,
        recipient: LockboxRecipient,
        encrypt: impl FnOnce(&mut dyn CryptoSrc, &[u8]) -> Vec<u8>,
    ) -> StreamLockbox {
        let mut raw_secret = Vec::new();
        self.encode_vec(&mut raw_secret);
        let lockbox_vec = encrypt(csprng, &raw_secret);
        raw_secret.zeroize();
        stream_lockbox_from_parts(recipient, lockbox_vec)
    }
}

impl TryFrom<&[u8]> for ContainedStreamKey {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, key) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get StreamKey version",
            expected: 1,
            actual: 0,
        })?;
        if version < MIN_STREAM_VERSION {
            return Err(CryptoError::OldVersion(version));
        }
        if version > MAX_STREAM_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let mut raw: [u8; V1_STREAM_KEY_SIZE] =
            TryFrom::try_from(key).map_err(|_| CryptoError::BadLength {
                step: "get StreamKey key bytes",
                expected: V1_STREAM_KEY_SIZE,
                actual: key.len(),
            })?;
        let new = Self::from_raw(version, &raw);
        raw.zeroize();
        Ok(new)
    }
}

impl Drop for ContainedStreamKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl StreamInterface for ContainedStreamKey {
    fn id(&self) -> &StreamId {
        &self.id
    }

    fn encrypt(&self, csprng: &mut dyn CryptoSrc, lock_type: LockboxType, content: &[u8]) -> Vec<u8> {
        assert!(
            lock_type.is_for_stream(),
            "Tried to encrypt a non-stream-recipient lockbox with a StreamKey"
        );
        let version = self.id.version();
        let header_len = 2 + self.id.len();
        let nonce_len = lockbox_nonce_size(version);
        let mut nonce = [0u8; V1_LOCKBOX_NONCE_SIZE];
        csprng.fill_bytes(&mut nonce);

        let mut lockbox =
            Vec::with_capacity(header_len + nonce_len + content.len() + lockbox_tag_size(version));
        lockbox.push(version);
        lockbox.push(lock_type.as_u8());
        self.id.encode_vec(&mut lockbox);
        lockbox.extend_from_slice(&nonce);
        lockbox.extend_from_slice(content);

        let (additional, rest) = lockbox.split_at_mut(header_len);
        let (_, content) = rest.split_at_mut(nonce_len);
        let aead = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        // Encryption only fails past 256 GiB of content.
        let tag = aead
            .encrypt_in_place_detached(&XNonce::from(nonce), additional, content)
            .expect("More data than the cipher can accept was put in");
        lockbox.extend_from_slice(&tag);
        lockbox
    }

    fn decrypt_identity_key(&self, lockbox: &IdentityLockbox) -> Result<IdentityKey, CryptoError> {
        let mut raw = self.decrypt_parts(lockbox.recipient(), lockbox.as_parts())?;
        let result = ContainedIdKey::try_from(&raw[..]);
        raw.zeroize();
        Ok(new_identity_key(Arc::new(result?)))
    }

    fn decrypt_lock_key(&self, lockbox: &LockLockbox) -> Result<LockKey, CryptoError> {
        let mut raw = self.decrypt_parts(lockbox.recipient(), lockbox.as_parts())?;
        let result = ContainedLockKey::try_from(&raw[..]);
        raw.zeroize();
        Ok(new_lock_key(Arc::new(result?)))
    }

    fn decrypt_stream_key(&self, lockbox: &StreamLockbox) -> Result<StreamKey, CryptoError> {
        let mut raw = self.decrypt_parts(lockbox.recipient(), lockbox.as_parts())?;
        let result = ContainedStreamKey::try_from(&raw[..]);
        raw.zeroize();
        Ok(new_stream_key(Arc::new(result?)))
    }

    fn decrypt_data(&self, lockbox: &DataLockbox) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_parts(lockbox.recipient(), lockbox.as_parts())
    }

    fn self_export_lock(&self, csprng: &mut dyn CryptoSrc, receive_lock: &LockId) -> Option<StreamLockbox> {
        Some(self.export_raw(
            csprng,
            LockboxRecipient::LockId(receive_lock.clone()),
            |rng, raw| lock_id_encrypt(receive_lock, rng, LockboxType::Stream(false), raw),
        ))
    }

    fn self_export_stream(
        &self,
        csprng: &mut dyn CryptoSrc,
        receive_stream: &StreamKey,
    ) -> Option<StreamLockbox> {
        Some(self.export_raw(
            csprng,
            LockboxRecipient::StreamId(receive_stream.id().clone()),
            |rng, raw| stream_key_encrypt(receive_stream, rng, LockboxType::Stream(true), raw),
        ))
    }
}

/// An identifier for a corresponding [`StreamKey`], used to mark lockboxes meant for that key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    version: u8,
    id: [u8; V1_STREAM_ID_SIZE],
}

impl StreamId {
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn raw_identifier(&self) -> &[u8] {
        &self.id
    }

    pub fn as_vec(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.encode_vec(&mut v);
        v
    }

    /// Convert into a base58-encoded StreamId.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.as_vec()).into_string()
    }

    /// Attempt to parse a base58-encoded StreamId.
    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        let raw = bs58::decode(s)
            .into_vec()
            .or(Err(CryptoError::BadFormat("Not valid Base58")))?;
        Self::try_from(&raw[..])
    }

    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.len());
        buf.push(self.version);
        buf.extend_from_slice(&self.id);
    }

    pub fn len(&self) -> usize {
        1 + V1_STREAM_ID_SIZE
    }
}

impl TryFrom<&[u8]> for StreamId {
    type Error = CryptoError;

    /// Value must be exactly one encoded StreamId, with no trailing bytes.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, raw) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get StreamId version",
            expected: 1,
            actual: 0,
        })?;
        if !(MIN_STREAM_VERSION..=MAX_STREAM_VERSION).contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let id = TryFrom::try_from(raw).map_err(|_| CryptoError::BadLength {
            step: "get StreamId",
            expected: V1_STREAM_ID_SIZE,
            actual: raw.len(),
        })?;
        Ok(Self { version, id })
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamId")
            .field("version", &self.version)
            .field("stream_id", &self.id)
            .finish()
    }
}

impl fmt::Display for StreamId {
    /// Display as a base58-encoded string.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basics() {
        let mut csprng = rand::rngs::OsRng;
        let key = StreamKey::new_temp(&mut csprng);
        assert_eq!(key.version(), DEFAULT_STREAM_VERSION);
        let key = StreamKey::new_temp_with_version(&mut csprng, DEFAULT_STREAM_VERSION).unwrap();
        assert_eq!(key.version(), DEFAULT_STREAM_VERSION);
        if let Err(CryptoError::UnsupportedVersion(99u8)) =
            StreamKey::new_temp_with_version(&mut csprng, 99u8)
        {
        } else {
            panic!("Didn't get expected error on new_temp_with_version");
        }
    }

    #[test]
    fn display() {
        let mut csprng = rand::rngs::OsRng;
        let key = StreamKey::new_temp(&mut csprng);
        assert_eq!(format!("{}", &key), key.id().to_base58());
    }

    #[test]
    fn derived_keys_are_deterministic() {
        let raw = [7u8; V1_STREAM_KEY_SIZE];
        let a = StreamKey::from_derived(&raw);
        let b = StreamKey::from_derived(&raw);
        assert_eq!(a.id(), b.id());
        let c = StreamKey::from_derived(&[8u8; V1_STREAM_KEY_SIZE]);
        assert_ne!(a.id(), c.id());

        let mut csprng = rand::rngs::OsRng;
        let lockbox = a.encrypt_data(&mut csprng, b"locked with a derived key");
        assert_eq!(b.decrypt_data(&lockbox).unwrap(), b"locked with a derived key");
        assert!(c.decrypt_data(&lockbox).is_err());
    }

    #[test]
    fn id_is_not_key() {
        let mut csprng = rand::rngs::OsRng;
        let key = ContainedStreamKey::generate(&mut csprng);
        let mut enc_key = Vec::new();
        key.encode_vec(&mut enc_key);
        assert_ne!(key.id().as_vec(), enc_key);
    }

    #[test]
    fn base58() {
        let mut csprng = rand::rngs::OsRng;
        let key = StreamKey::new_temp(&mut csprng);
        let mut base58 = key.id().to_base58();
        assert_eq!(&StreamId::from_base58(&base58).unwrap(), key.id());
        base58.push('a');
        base58.push('a');
        assert!(StreamId::from_base58(&base58).is_err());
    }

    #[test]
    fn export_for_stream() {
        let mut csprng = rand::rngs::OsRng;
        let key = StreamKey::new_temp(&mut csprng);
        let to_send = StreamKey::new_temp(&mut csprng);
        let lockbox = to_send.export_for_stream(&mut csprng, &key).unwrap();
        assert_eq!(
            lockbox.recipient(),
            &LockboxRecipient::StreamId(key.id().clone())
        );
        let enc = lockbox.as_bytes().to_vec();
        let dec = StreamLockbox::try_from(&enc[..]).unwrap();
        assert_eq!(key.decrypt_stream_key(&dec).unwrap().id(), to_send.id());
    }

    fn setup_data() -> (Vec<u8>, impl Fn(&[u8]) -> bool, impl Fn(&[u8]) -> bool) {
        let mut csprng = rand::rngs::OsRng;
        let key = StreamKey::new_temp(&mut csprng);
        let message = b"I am a test message, going undercover for the receivers";
        let enc = key.encrypt_data(&mut csprng, message).as_bytes().to_vec();
        let check_decode = |enc: &[u8]| DataLockbox::try_from(enc).is_ok();
        let check_decrypt = move |enc: &[u8]| match DataLockbox::try_from(enc) {
            Ok(lockbox) => match key.decrypt_data(&lockbox) {
                Ok(dec) => dec == &message[..],
                Err(_) => false,
            },
            Err(_) => false,
        };
        (enc, check_decode, check_decrypt)
    }

    #[test]
    fn data_clean_decrypt() {
        let (enc, _, check_decrypt) = setup_data();
        assert!(check_decrypt(&enc[..]));
    }

    #[test]
    fn data_corrupt_version() {
        let (mut enc, check_decode, check_decrypt) = setup_data();
        enc[0] = 0;
        assert!(!check_decode(&enc[..]));
        enc[0] = 2;
        assert!(!check_decode(&enc[..]));
        enc[0] = DEFAULT_STREAM_VERSION;
        assert!(check_decrypt(&enc[..]));
    }

    #[test]
    fn data_corrupt_type() {
        let (mut enc, check_decode, check_decrypt) = setup_data();
        let valid = enc[1];
        enc[1] |= 0x80;
        assert!(!check_decode(&enc[..]));
        for t in 0u8..8 {
            enc[1] = t;
            if t == valid {
                assert!(check_decrypt(&enc[..]));
            } else {
                assert!(!check_decrypt(&enc[..]));
            }
        }
    }

    #[test]
    fn data_corrupt_tag_and_length() {
        let (mut enc, check_decode, check_decrypt) = setup_data();
        *enc.last_mut().unwrap() ^= 0xFF;
        assert!(check_decode(&enc[..]));
        assert!(!check_decrypt(&enc[..]));
        *enc.last_mut().unwrap() ^= 0xFF;
        enc.push(0);
        assert!(!check_decrypt(&enc[..]));
        enc.pop();
        enc.pop();
        assert!(!check_decrypt(&enc[..]));
    }

    #[test]
    fn data_corrupt_each_byte() {
        let (mut enc, _, check_decrypt) = setup_data();
        for i in 0..enc.len() {
            enc[i] ^= 0xFF;
            assert!(!check_decrypt(&enc[..]));
            enc[i] ^= 0xFF;
        }
        assert!(check_decrypt(&enc[..]));
    }

    #[test]
    fn stream_inner_corruption() {
        // Well-formed lockboxes around malformed key encodings must not yield keys.
        let mut csprng = rand::rngs::OsRng;
        let key = StreamKey::new_temp(&mut csprng);
        let check = |content: &[u8]| {
            let mut csprng = rand::rngs::OsRng;
            let raw = stream_key_encrypt(&key, &mut csprng, LockboxType::Stream(true), content);
            let lockbox = StreamLockbox::try_from(&raw[..]).unwrap();
            key.decrypt_stream_key(&lockbox).is_ok()
        };
        let mut content = vec![DEFAULT_STREAM_VERSION];
        content.extend_from_slice(&[3u8; V1_STREAM_KEY_SIZE]);
        assert!(check(&content));
        content[0] = 0;
        assert!(!check(&content));
        content[0] = 99;
        assert!(!check(&content));
        content[0] = DEFAULT_STREAM_VERSION;
        content.push(0);
        assert!(!check(&content));
        content.pop();
        content.pop();
        assert!(!check(&content));
    }
}
