//! Long-term key pairs and their armored text form.
//!
//! A key pair is an Ed25519 [`IdentityKey`] for signing plus an X25519 [`LockKey`] for receiving
//! session keys. The public half ([`PublicKey`]) is shared freely. The private half only ever
//! leaves this crate locked: both secret keys are packed into lockboxes addressed to a
//! [`StreamKey`] derived from a protection secret (see [`kdf`](crate::kdf)).
//!
//! # Format
//!
//! Both halves share a header:
//!
//! ```text
//! +---------+------+---------+==========+========+
//! | Version | Type | Created | Identity | LockId |
//! +---------+------+---------+==========+========+
//! ```
//!
//! - Version (1 byte)
//! - Type: 0x01 for a public key, 0x02 for a locked private key
//! - Created: seconds since the Unix epoch, u64 big-endian
//!
//! A locked private key continues with:
//!
//! ```text
//! +------+---------------+=================+=============+
//! | Salt | Identity Len  | IdentityLockbox | LockLockbox |
//! +------+---------------+=================+=============+
//! ```
//!
//! - Salt (16 bytes)
//! - Identity Len: length of the IdentityLockbox, u16 big-endian
//!
//! The lockbox key is HKDF-SHA256 over the protection secret, salted with the stored salt, with
//! the key fingerprint in the info string. A wrong secret therefore yields lockboxes addressed to
//! some other `StreamId`, which is reported as a failed unlock rather than an error.

use crate::{
    armor::{self, ArmorLabel},
    identity::{Identity, IdentityKey},
    kdf::Secret,
    lock::{LockId, LockKey},
    lockbox::{IdentityLockbox, LockLockbox, LockboxRecipient},
    stream::{StreamId, StreamKey},
    CryptoError, CryptoSrc,
};

use blake2::{digest::consts::U20, Blake2b, Digest};
use byteorder::{BigEndian, ReadBytesExt};
use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use std::{
    convert::TryFrom,
    fmt,
    io::Read,
    time::{SystemTime, UNIX_EPOCH},
};

/// Default key format version.
pub const DEFAULT_KEY_VERSION: u8 = 1;

/// Minimum accepted key format version.
pub const MIN_KEY_VERSION: u8 = 1;

/// Maximum accepted key format version.
pub const MAX_KEY_VERSION: u8 = 1;

const PUBLIC_FLAG: u8 = 0x01;
const PRIVATE_FLAG: u8 = 0x02;
const SALT_SIZE: usize = 16;
const FINGERPRINT_SIZE: usize = 20;
const PROTECTION_INFO: &[u8] = b"tip-crypto key protection v1";

type Blake2b160 = Blake2b<U20>;

/// Short, stable identifier of a key pair, shared by its public and private halves.
#[derive(Clone, Copy)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    fn compute(version: u8, created: u64, identity: &Identity, lock_id: &LockId) -> Self {
        let digest = Blake2b160::new()
            .chain_update([version])
            .chain_update(created.to_be_bytes())
            .chain_update(identity.as_vec())
            .chain_update(lock_id.as_vec())
            .finalize();
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Uppercase hex, no separators.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse hex in either case.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut raw = [0u8; FINGERPRINT_SIZE];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|_| CryptoError::BadFormat("Fingerprint isn't 40 hex digits"))?;
        Ok(Self(raw))
    }

    /// Human-friendly form: groups of four hex digits, with a double space halfway.
    ///
    /// ```text
    /// 0D1E 2F3A 4B5C 6D7E 8F90  A1B2 C3D4 E5F6 0718 293A
    /// ```
    pub fn nice(&self) -> String {
        let hex = self.to_hex();
        let mut out = String::with_capacity(hex.len() + 10);
        for (i, group) in hex.as_bytes().chunks(4).enumerate() {
            match i {
                0 => (),
                5 => out.push_str("  "),
                _ => out.push(' '),
            }
            out.extend(group.iter().map(|b| char::from(*b)));
        }
        out
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let raw = <[u8; FINGERPRINT_SIZE]>::try_from(value).map_err(|_| CryptoError::BadLength {
            step: "get Fingerprint bytes",
            expected: FINGERPRINT_SIZE,
            actual: value.len(),
        })?;
        Ok(Self(raw))
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Fingerprint {}

impl std::hash::Hash for Fingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Summary of a key for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDetails {
    pub fingerprint: Fingerprint,
    /// Seconds since the Unix epoch.
    pub created: u64,
}

/// The shareable half of a key pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey {
    version: u8,
    created: u64,
    identity: Identity,
    lock_id: LockId,
}

impl PublicKey {
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Creation time, in seconds since the Unix epoch.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// The signing identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The key that session keys get sealed to.
    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self.version, self.created, &self.identity, &self.lock_id)
    }

    pub fn details(&self) -> KeyDetails {
        KeyDetails {
            fingerprint: self.fingerprint(),
            created: self.created,
        }
    }

    /// Encode the binary body of the armored public key.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        self.encode_header(PUBLIC_FLAG, buf);
    }

    pub fn to_armored(&self) -> String {
        let mut body = Vec::new();
        self.encode_vec(&mut body);
        armor::encode(ArmorLabel::PublicKey, &body)
    }

    pub fn from_armored(text: &str) -> Result<Self, CryptoError> {
        let body = armor::decode_as(text, ArmorLabel::PublicKey)?;
        Self::try_from(&body[..])
    }

    fn encode_header(&self, flag: u8, buf: &mut Vec<u8>) {
        buf.push(self.version);
        buf.push(flag);
        buf.extend_from_slice(&self.created.to_be_bytes());
        self.identity.encode_vec(buf);
        self.lock_id.encode_vec(buf);
    }

    fn decode_header(buf: &mut &[u8], flag: u8) -> Result<Self, CryptoError> {
        let version = buf.read_u8()?;
        if version < MIN_KEY_VERSION {
            return Err(CryptoError::OldVersion(version));
        }
        if version > MAX_KEY_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        match buf.read_u8()? {
            f if f == flag => (),
            PUBLIC_FLAG => return Err(CryptoError::BadFormat("Expected a private key, found a public key")),
            PRIVATE_FLAG => return Err(CryptoError::BadFormat("Expected a public key, found a private key")),
            _ => return Err(CryptoError::BadFormat("Unknown key type flag")),
        }
        let created = buf.read_u64::<BigEndian>()?;
        let id_len = identity_size(buf)?;
        let identity = Identity::try_from(take(buf, id_len, "get key Identity")?)?;
        let lock_len = lock_id_size(buf)?;
        let lock_id = LockId::try_from(take(buf, lock_len, "get key LockId")?)?;
        Ok(Self {
            version,
            created,
            identity,
            lock_id,
        })
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut buf = value;
        let key = Self::decode_header(&mut buf, PUBLIC_FLAG)?;
        if !buf.is_empty() {
            return Err(CryptoError::BadFormat("Trailing bytes after public key"));
        }
        Ok(key)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.fingerprint(), f)
    }
}

fn identity_size(buf: &[u8]) -> Result<usize, CryptoError> {
    // Only version 1 identities exist: version byte plus a 32-byte key.
    let version = *buf.first().ok_or(CryptoError::BadLength {
        step: "get Identity version",
        expected: 1,
        actual: 0,
    })?;
    Ok(1 + match version {
        1 => ed25519_dalek::PUBLIC_KEY_LENGTH,
        v => return Err(CryptoError::UnsupportedVersion(v)),
    })
}

fn lock_id_size(buf: &[u8]) -> Result<usize, CryptoError> {
    let version = *buf.first().ok_or(CryptoError::BadLength {
        step: "get LockId version",
        expected: 1,
        actual: 0,
    })?;
    Ok(crate::lock::lock_id_size(version))
}

fn take<'a>(buf: &mut &'a [u8], len: usize, step: &'static str) -> Result<&'a [u8], CryptoError> {
    if buf.len() < len {
        return Err(CryptoError::BadLength {
            step,
            expected: len,
            actual: buf.len(),
        });
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn created_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn protection_key(
    salt: &[u8; SALT_SIZE],
    fingerprint: &Fingerprint,
    protection: &Secret,
) -> Result<StreamKey, CryptoError> {
    if protection.is_empty() {
        return Err(CryptoError::Derivation("protection secret is empty".into()));
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), protection.as_bytes());
    let mut info = Vec::with_capacity(PROTECTION_INFO.len() + FINGERPRINT_SIZE);
    info.extend_from_slice(PROTECTION_INFO);
    info.extend_from_slice(fingerprint.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|_| CryptoError::Derivation("HKDF expansion failed".into()))?;
    let key = StreamKey::from_derived(&okm);
    okm.zeroize();
    Ok(key)
}

/// A private key, encrypted under a protection secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockedPrivateKey {
    public: PublicKey,
    salt: [u8; SALT_SIZE],
    identity_box: IdentityLockbox,
    lock_box: LockLockbox,
}

impl LockedPrivateKey {
    fn seal<R: CryptoSrc>(
        csprng: &mut R,
        public: &PublicKey,
        keys: &SecretKeys,
        protection: &Secret,
    ) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_SIZE];
        csprng.fill_bytes(&mut salt);
        let stream = protection_key(&salt, &public.fingerprint(), protection)?;
        let identity_box = keys
            .identity_key
            .export_for_stream(csprng, &stream)
            .ok_or_else(|| CryptoError::InvalidKey("identity key can't be exported".into()))?;
        let lock_box = keys
            .lock_key
            .export_for_stream(csprng, &stream)
            .ok_or_else(|| CryptoError::InvalidKey("lock key can't be exported".into()))?;
        Ok(Self {
            public: public.clone(),
            salt,
            identity_box,
            lock_box,
        })
    }

    /// The public half, readable without the protection secret.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    /// Try to open the key. A wrong secret gives `Ok(None)`. Lockboxes that authenticate under the
    /// right secret but hold the wrong keys are an [`InvalidKey`](CryptoError::InvalidKey) error.
    pub fn open(&self, protection: &Secret) -> Result<Option<SecretKeys>, CryptoError> {
        let stream = protection_key(&self.salt, &self.fingerprint(), protection)?;
        let identity_key = match stream.decrypt_identity_key(&self.identity_box) {
            Ok(key) => key,
            Err(CryptoError::ObjectMismatch(_)) => return Ok(None),
            Err(e) => return Err(CryptoError::InvalidKey(format!("identity key lockbox: {}", e))),
        };
        let lock_key = stream
            .decrypt_lock_key(&self.lock_box)
            .map_err(|e| CryptoError::InvalidKey(format!("lock key lockbox: {}", e)))?;
        if identity_key.id() != self.public.identity() {
            return Err(CryptoError::InvalidKey(
                "decrypted identity key doesn't match the public key".into(),
            ));
        }
        if lock_key.id() != self.public.lock_id() {
            return Err(CryptoError::InvalidKey(
                "decrypted lock key doesn't match the public key".into(),
            ));
        }
        Ok(Some(SecretKeys {
            identity_key,
            lock_key,
        }))
    }

    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        self.public.encode_header(PRIVATE_FLAG, buf);
        buf.extend_from_slice(&self.salt);
        let id_bytes = self.identity_box.as_bytes();
        // Identity lockboxes are under a hundred bytes.
        buf.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(id_bytes);
        buf.extend_from_slice(self.lock_box.as_bytes());
    }

    pub fn to_armored(&self) -> String {
        let mut body = Vec::new();
        self.encode_vec(&mut body);
        armor::encode(ArmorLabel::PrivateKey, &body)
    }

    pub fn from_armored(text: &str) -> Result<Self, CryptoError> {
        let body = armor::decode_as(text, ArmorLabel::PrivateKey)?;
        Self::try_from(&body[..])
    }
}

impl TryFrom<&[u8]> for LockedPrivateKey {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut buf = value;
        let public = PublicKey::decode_header(&mut buf, PRIVATE_FLAG)?;
        let mut salt = [0u8; SALT_SIZE];
        buf.read_exact(&mut salt)?;
        let id_len = buf.read_u16::<BigEndian>()? as usize;
        let identity_box = IdentityLockbox::try_from(take(&mut buf, id_len, "get IdentityLockbox")?)?;
        let lock_box = LockLockbox::try_from(buf)?;
        match (identity_box.recipient(), lock_box.recipient()) {
            (LockboxRecipient::StreamId(a), LockboxRecipient::StreamId(b)) if a == b => (),
            (LockboxRecipient::StreamId(_), LockboxRecipient::StreamId(_)) => {
                return Err(CryptoError::BadFormat(
                    "Private key lockboxes are addressed to different keys",
                ))
            }
            _ => {
                return Err(CryptoError::BadFormat(
                    "Private key lockboxes must be addressed to a StreamId",
                ))
            }
        }
        Ok(Self {
            public,
            salt,
            identity_box,
            lock_box,
        })
    }
}

/// Both secret keys of an unlocked key pair. Only ever held in memory.
#[derive(Clone)]
pub struct SecretKeys {
    identity_key: IdentityKey,
    lock_key: LockKey,
}

impl SecretKeys {
    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn lock_key(&self) -> &LockKey {
        &self.lock_key
    }
}

impl fmt::Debug for SecretKeys {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SecretKeys")
            .field("identity", self.identity_key.id())
            .field("lock_id", self.lock_key.id())
            .finish()
    }
}

/// Whether the private half is encrypted or sitting in memory.
#[derive(Clone, Debug)]
pub enum KeyState {
    Locked(LockedPrivateKey),
    Unlocked(SecretKeys),
}

/// Identifies the protection key an unlocked pair was opened with. Holds no secret material.
#[derive(Clone, Debug)]
struct SecretCheck {
    salt: [u8; SALT_SIZE],
    stream_id: StreamId,
}

impl SecretCheck {
    fn from_locked(locked: &LockedPrivateKey) -> Option<Self> {
        match locked.identity_box.recipient() {
            LockboxRecipient::StreamId(id) => Some(Self {
                salt: locked.salt,
                stream_id: id.clone(),
            }),
            LockboxRecipient::LockId(_) => None,
        }
    }
}

/// A public key plus its private half in exactly one of the locked or unlocked states.
#[derive(Clone, Debug)]
pub struct KeyPair {
    public: PublicKey,
    state: KeyState,
    check: Option<SecretCheck>,
}

impl KeyPair {
    /// Load a locked private key. The public half comes from its header.
    pub fn from_locked(locked: LockedPrivateKey) -> Self {
        Self {
            public: locked.public.clone(),
            state: KeyState::Locked(locked),
            check: None,
        }
    }

    /// Parse an armored private key into a locked key pair.
    pub fn from_armored(text: &str) -> Result<Self, CryptoError> {
        LockedPrivateKey::from_armored(text)
            .map(Self::from_locked)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    pub fn state(&self) -> &KeyState {
        &self.state
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, KeyState::Locked(_))
    }

    /// The secret keys, if unlocked.
    pub fn secret_keys(&self) -> Option<&SecretKeys> {
        match &self.state {
            KeyState::Unlocked(keys) => Some(keys),
            KeyState::Locked(_) => None,
        }
    }

    /// Lock the private half under `protection` and return it armored. A key pair that is already
    /// locked is returned unchanged.
    pub fn lock<R: CryptoSrc>(&mut self, csprng: &mut R, protection: &Secret) -> Result<String, CryptoError> {
        if let KeyState::Unlocked(keys) = &self.state {
            let locked = LockedPrivateKey::seal(csprng, &self.public, keys, protection)?;
            self.state = KeyState::Locked(locked);
            self.check = None;
        }
        export_private_key(self)
    }

    /// Unlock in place. Returns false, leaving the pair locked, if `protection` is wrong. An
    /// already unlocked pair returns true.
    pub fn unlock(&mut self, protection: &Secret) -> Result<bool, CryptoError> {
        let (keys, check) = match &self.state {
            KeyState::Unlocked(_) => return Ok(true),
            KeyState::Locked(locked) => match locked.open(protection)? {
                Some(keys) => (keys, SecretCheck::from_locked(locked)),
                None => return Ok(false),
            },
        };
        self.state = KeyState::Unlocked(keys);
        self.check = check;
        Ok(true)
    }

    /// Whether `protection` is the secret this pair is locked under, or was last unlocked with.
    pub fn verify_secret(&self, protection: &Secret) -> Result<bool, CryptoError> {
        match &self.state {
            KeyState::Locked(locked) => Ok(locked.open(protection)?.is_some()),
            KeyState::Unlocked(_) => match &self.check {
                Some(check) => {
                    let stream = protection_key(&check.salt, &self.fingerprint(), protection)?;
                    Ok(*stream.id() == check.stream_id)
                }
                None => Ok(false),
            },
        }
    }
}

/// Result of checking an armored public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyValidation {
    Valid(PublicKey),
    Invalid(String),
}

impl KeyValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, KeyValidation::Valid(_))
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        match self {
            KeyValidation::Valid(key) => Some(key),
            KeyValidation::Invalid(_) => None,
        }
    }

    pub fn into_result(self) -> Result<PublicKey, CryptoError> {
        match self {
            KeyValidation::Valid(key) => Ok(key),
            KeyValidation::Invalid(reason) => Err(CryptoError::InvalidKey(reason)),
        }
    }
}

/// Result of checking an armored private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrivateKeyValidation {
    Valid(Fingerprint),
    Invalid(String),
}

impl PrivateKeyValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, PrivateKeyValidation::Valid(_))
    }
}

/// Create a fresh key pair. The private half is locked under `protection` before this returns.
pub fn generate<R: CryptoSrc>(csprng: &mut R, protection: &Secret) -> Result<KeyPair, CryptoError> {
    let keys = SecretKeys {
        identity_key: IdentityKey::new_temp(csprng),
        lock_key: LockKey::new_temp(csprng),
    };
    let public = PublicKey {
        version: DEFAULT_KEY_VERSION,
        created: created_now(),
        identity: keys.identity_key.id().clone(),
        lock_id: keys.lock_key.id().clone(),
    };
    let locked = LockedPrivateKey::seal(csprng, &public, &keys, protection)?;
    drop(keys);
    tracing::debug!(fingerprint = %public.fingerprint(), "generated key pair");
    Ok(KeyPair::from_locked(locked))
}

/// Check that `text` is a well-formed armored public key.
pub fn validate_public_key(text: &str) -> KeyValidation {
    match PublicKey::from_armored(text) {
        Ok(key) => KeyValidation::Valid(key),
        Err(e) => KeyValidation::Invalid(e.to_string()),
    }
}

/// Check that `text` is a well-formed armored, locked private key. Nothing is decrypted.
pub fn validate_private_key(text: &str) -> PrivateKeyValidation {
    match LockedPrivateKey::from_armored(text) {
        Ok(key) => PrivateKeyValidation::Valid(key.fingerprint()),
        Err(e) => PrivateKeyValidation::Invalid(e.to_string()),
    }
}

/// Lock a key pair under `protection`, returning the armored private key.
pub fn lock<R: CryptoSrc>(
    csprng: &mut R,
    pair: &mut KeyPair,
    protection: &Secret,
) -> Result<String, CryptoError> {
    pair.lock(csprng, protection)
}

/// Unlock an armored private key. `Ok(None)` means the secret was wrong.
pub fn unlock(text: &str, protection: &Secret) -> Result<Option<KeyPair>, CryptoError> {
    let mut pair = KeyPair::from_armored(text)?;
    if pair.unlock(protection)? {
        Ok(Some(pair))
    } else {
        tracing::debug!(fingerprint = %pair.fingerprint(), "private key unlock refused");
        Ok(None)
    }
}

/// Armor the locked private key. Fails if the pair is unlocked.
pub fn export_private_key(pair: &KeyPair) -> Result<String, CryptoError> {
    match &pair.state {
        KeyState::Locked(locked) => Ok(locked.to_armored()),
        KeyState::Unlocked(_) => Err(CryptoError::ExportWhileUnlocked),
    }
}

/// Re-lock an armored private key under a new secret. The input is untouched either way.
pub fn change_passphrase<R: CryptoSrc>(
    csprng: &mut R,
    text: &str,
    old: &Secret,
    new: &Secret,
) -> Result<String, CryptoError> {
    let mut pair = unlock(text, old)?.ok_or(CryptoError::WrongSecret)?;
    pair.lock(csprng, new)
}
