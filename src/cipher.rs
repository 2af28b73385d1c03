//! Multi-recipient encryption and signing of opaque payloads.
//!
//! Every envelope gets a fresh content key. The payload is encrypted once under it, and the content
//! key is sealed once per recipient: to a recipient's [`LockId`] for public-key recipients, or to
//! a [`StreamId`](crate::StreamId) for holders of the session key. Any one recipient can open the
//! envelope on their own.
//!
//! # Format
//!
//! ```text
//! +---------+------------+====================================+=============+
//! | Version | Slot Count | Slot Len | StreamLockbox  (repeat) | DataLockbox |
//! +---------+------------+====================================+=============+
//! ```
//!
//! - Version (1 byte)
//! - Slot Count: u16 big-endian
//! - Slot Len: u32 big-endian, length of the following StreamLockbox
//! - DataLockbox: the payload, running to the end of the envelope
//!
//! The decrypted payload is a flag byte (bit 0 set when signed), then for signed payloads a u16
//! big-endian signature length and the [`Signature`](crate::Signature) over the BLAKE2b hash of the
//! data, then the data itself.
//!
//! # Signatures
//!
//! Signature checking is advisory: [`CipherEngine::decrypt_and_verify`] always returns the data
//! with a [`SignatureStatus`], and only turns a non-[`Verified`](SignatureStatus::Verified) status
//! into [`CryptoError::SignatureFailed`] when the caller requires a signature. A signature only
//! counts as verified if it checks out and its signer is in the key ring.

use crate::{
    armor::{self, ArmorLabel},
    hash::Hash,
    identity::{Identity, IdentityKey, UnverifiedSignature},
    keyring::{KeyRing, KeyRingHandle, SessionKey, LOCAL_KEY_ALIAS},
    keys::{self, KeyValidation, PrivateKeyValidation, PublicKey},
    lock::{LockId, LockKey},
    lockbox::{DataLockbox, LockboxRecipient, StreamLockbox},
    stream::StreamKey,
    CryptoError, CryptoSrc,
};

use byteorder::{BigEndian, ReadBytesExt};
use rand_core::OsRng;
use zeroize::Zeroize;

use std::{convert::TryFrom, fmt};

/// Default envelope format version.
pub const DEFAULT_ENVELOPE_VERSION: u8 = 1;

/// Minimum accepted envelope format version.
pub const MIN_ENVELOPE_VERSION: u8 = 1;

/// Maximum accepted envelope format version.
pub const MAX_ENVELOPE_VERSION: u8 = 1;

const SIGNED_FLAG: u8 = 0x01;

/// An encrypted, optionally signed payload for one or more recipients.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    version: u8,
    slots: Vec<StreamLockbox>,
    body: DataLockbox,
}

impl EncryptedEnvelope {
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Who can open this envelope.
    pub fn recipients(&self) -> impl Iterator<Item = &LockboxRecipient> {
        self.slots.iter().map(|s| s.recipient())
    }

    /// Whether the holder of `lock_id`'s private key is among the recipients.
    pub fn is_addressed_to(&self, lock_id: &LockId) -> bool {
        self.recipients()
            .any(|r| matches!(r, LockboxRecipient::LockId(id) if id == lock_id))
    }

    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.push(self.version);
        buf.extend_from_slice(&(self.slots.len() as u16).to_be_bytes());
        for slot in &self.slots {
            let raw = slot.as_bytes();
            buf.extend_from_slice(&(raw.len() as u32).to_be_bytes());
            buf.extend_from_slice(raw);
        }
        buf.extend_from_slice(self.body.as_bytes());
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_vec(&mut buf);
        buf
    }

    pub fn to_armored(&self) -> String {
        armor::encode(ArmorLabel::Message, &self.to_vec())
    }

    pub fn from_armored(text: &str) -> Result<Self, CryptoError> {
        let body = armor::decode_as(text, ArmorLabel::Message)?;
        Self::try_from(&body[..])
    }

    fn find_slot(&self, recipient: &LockboxRecipient) -> Option<&StreamLockbox> {
        self.slots.iter().find(|s| s.recipient() == recipient)
    }
}

impl TryFrom<&[u8]> for EncryptedEnvelope {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut buf = value;
        let version = buf.read_u8()?;
        if version < MIN_ENVELOPE_VERSION {
            return Err(CryptoError::OldVersion(version));
        }
        if version > MAX_ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let count = buf.read_u16::<BigEndian>()? as usize;
        if count == 0 {
            return Err(CryptoError::BadFormat("Envelope has no recipients"));
        }
        let mut slots = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let len = buf.read_u32::<BigEndian>()? as usize;
            if buf.len() < len {
                return Err(CryptoError::BadLength {
                    step: "get envelope slot",
                    expected: len,
                    actual: buf.len(),
                });
            }
            let (raw, rest) = buf.split_at(len);
            slots.push(StreamLockbox::try_from(raw)?);
            buf = rest;
        }
        let body = DataLockbox::try_from(buf)?;
        Ok(Self {
            version,
            slots,
            body,
        })
    }
}

impl fmt::Debug for EncryptedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EncryptedEnvelope")
            .field("version", &self.version)
            .field("recipients", &self.slots.len())
            .field("body_len", &self.body.as_bytes().len())
            .finish()
    }
}

/// Outcome of checking an envelope's signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The envelope carried no signature.
    Unsigned,
    /// A signature was present but malformed or not valid for the data.
    Invalid,
    /// Valid signature from a key the ring doesn't know.
    UnknownSigner(Identity),
    /// Valid signature from a known key.
    Verified { signer: Identity, recipient_id: String },
}

impl SignatureStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, SignatureStatus::Verified { .. })
    }

    /// Short name of the status, for logs.
    pub fn label(&self) -> &'static str {
        match self {
            SignatureStatus::Unsigned => "unsigned",
            SignatureStatus::Invalid => "invalid",
            SignatureStatus::UnknownSigner(_) => "unknown signer",
            SignatureStatus::Verified { .. } => "verified",
        }
    }
}

/// An opened envelope.
#[derive(Clone, Debug)]
pub struct Decrypted {
    pub data: Vec<u8>,
    pub signature: SignatureStatus,
}

const MAX_SLOTS: usize = u16::MAX as usize;

/// Seal `plaintext` for every lock id and stream key given. Fails if that is more than
/// `u16::MAX` distinct recipients.
pub(crate) fn seal_envelope<R: CryptoSrc>(
    csprng: &mut R,
    plaintext: &[u8],
    locks: &[LockId],
    streams: &[StreamKey],
    signer: Option<&IdentityKey>,
) -> Result<EncryptedEnvelope, CryptoError> {
    if locks.is_empty() && streams.is_empty() {
        return Err(CryptoError::NoRecipients);
    }
    let mut unique: Vec<&LockId> = Vec::with_capacity(locks.len());
    for lock in locks {
        if !unique.contains(&lock) {
            unique.push(lock);
        }
    }
    // The slot count is encoded as a u16.
    let count = unique.len() + streams.len();
    if count > MAX_SLOTS {
        return Err(CryptoError::BadLength {
            step: "envelope recipient count",
            expected: MAX_SLOTS,
            actual: count,
        });
    }
    let content_key = StreamKey::new_temp(csprng);

    let mut slots: Vec<StreamLockbox> = Vec::with_capacity(count);
    for lock in unique {
        let slot = content_key
            .export_for_lock(csprng, lock)
            .ok_or_else(|| CryptoError::InvalidKey("content key can't be exported".into()))?;
        slots.push(slot);
    }
    for stream in streams {
        let slot = content_key
            .export_for_stream(csprng, stream)
            .ok_or_else(|| CryptoError::InvalidKey("content key can't be exported".into()))?;
        slots.push(slot);
    }

    let mut inner = Vec::with_capacity(plaintext.len() + 128);
    match signer {
        Some(key) => {
            let signature = key.sign(&Hash::new(plaintext));
            inner.push(SIGNED_FLAG);
            inner.extend_from_slice(&(signature.size() as u16).to_be_bytes());
            signature.encode_vec(&mut inner);
        }
        None => inner.push(0),
    }
    inner.extend_from_slice(plaintext);
    let body = content_key.encrypt_data(csprng, &inner);
    inner.zeroize();

    Ok(EncryptedEnvelope {
        version: DEFAULT_ENVELOPE_VERSION,
        slots,
        body,
    })
}

/// The keys and identities an envelope is opened with, copied out of the key ring so the ring
/// isn't held during decryption.
struct OpenKeys {
    session: Option<SessionKey>,
    lock_key: Option<LockKey>,
    local_lock_id: Option<LockId>,
    known: Vec<(String, Identity)>,
}

impl OpenKeys {
    fn from_ring(ring: &KeyRing) -> Self {
        Self {
            session: ring.session_key().cloned(),
            lock_key: ring.secret_keys().map(|k| k.lock_key().clone()),
            local_lock_id: ring.get_pub_key(LOCAL_KEY_ALIAS).map(|k| k.lock_id().clone()),
            known: ring.identities(),
        }
    }

    fn content_key(&self, envelope: &EncryptedEnvelope) -> Result<StreamKey, CryptoError> {
        if let Some(session) = &self.session {
            if let Some(slot) = envelope.find_slot(&LockboxRecipient::StreamId(session.id().clone())) {
                return session
                    .decrypt_stream_key(slot)
                    .map_err(|_| CryptoError::Decryption("content key failed to decrypt"));
            }
        }
        if let Some(lock_key) = &self.lock_key {
            if let Some(slot) = envelope.find_slot(&LockboxRecipient::LockId(lock_key.id().clone())) {
                return lock_key
                    .decrypt_stream_key(slot)
                    .map_err(|_| CryptoError::Decryption("content key failed to decrypt"));
            }
            return Err(CryptoError::Decryption("not an intended recipient"));
        }
        match &self.local_lock_id {
            Some(id) if envelope.is_addressed_to(id) => Err(CryptoError::Decryption("key ring is locked")),
            _ => Err(CryptoError::Decryption("not an intended recipient")),
        }
    }

    fn open(&self, envelope: &EncryptedEnvelope) -> Result<Decrypted, CryptoError> {
        let content_key = self.content_key(envelope)?;
        let mut inner = content_key
            .decrypt_data(&envelope.body)
            .map_err(|_| CryptoError::Decryption("envelope body failed to decrypt"))?;
        let result = self.split_inner(&inner);
        inner.zeroize();
        result
    }

    fn split_inner(&self, inner: &[u8]) -> Result<Decrypted, CryptoError> {
        let malformed = |_| CryptoError::Decryption("malformed envelope payload");
        let mut buf = inner;
        let flag = buf.read_u8().map_err(malformed)?;
        if flag & !SIGNED_FLAG != 0 {
            return Err(CryptoError::Decryption("malformed envelope payload"));
        }
        if flag & SIGNED_FLAG == 0 {
            return Ok(Decrypted {
                data: buf.to_vec(),
                signature: SignatureStatus::Unsigned,
            });
        }
        let sig_len = buf.read_u16::<BigEndian>().map_err(malformed)? as usize;
        if buf.len() < sig_len {
            return Err(CryptoError::Decryption("malformed envelope payload"));
        }
        let (raw_sig, data) = buf.split_at(sig_len);
        let signature = match UnverifiedSignature::try_from(raw_sig) {
            Ok(unverified) => match unverified.verify(&Hash::new(data)) {
                Ok(verified) => {
                    let signer = verified.signer().clone();
                    match self.known.iter().find(|(_, id)| *id == signer) {
                        Some((recipient_id, _)) => SignatureStatus::Verified {
                            signer,
                            recipient_id: recipient_id.clone(),
                        },
                        None => SignatureStatus::UnknownSigner(signer),
                    }
                }
                Err(_) => SignatureStatus::Invalid,
            },
            Err(_) => SignatureStatus::Invalid,
        };
        Ok(Decrypted {
            data: data.to_vec(),
            signature,
        })
    }
}

/// Encrypts and decrypts on behalf of a key ring.
#[derive(Clone, Debug)]
pub struct CipherEngine {
    ring: KeyRingHandle,
}

impl CipherEngine {
    pub fn new(ring: KeyRingHandle) -> Self {
        Self { ring }
    }

    pub fn key_ring(&self) -> &KeyRingHandle {
        &self.ring
    }

    fn signer(ring: &KeyRing, sign: bool) -> Result<Option<IdentityKey>, CryptoError> {
        if !sign {
            return Ok(None);
        }
        if !ring.is_initialized() {
            return Err(CryptoError::NotInitialized);
        }
        ring.secret_keys()
            .map(|k| Some(k.identity_key().clone()))
            .ok_or(CryptoError::Locked)
    }

    /// Encrypt for a set of public keys, signing with the local key if `sign` is set.
    pub async fn encrypt_and_sign(
        &self,
        plaintext: &[u8],
        recipients: &[PublicKey],
        sign: bool,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        if recipients.is_empty() {
            return Err(CryptoError::NoRecipients);
        }
        let signer = Self::signer(&*self.ring.read().await, sign)?;
        let locks: Vec<LockId> = recipients.iter().map(|k| k.lock_id().clone()).collect();
        let plaintext = plaintext.to_vec();
        let envelope = tokio::task::spawn_blocking(move || {
            seal_envelope(&mut OsRng, &plaintext, &locks, &[], signer.as_ref())
        })
        .await??;
        tracing::debug!(recipients = envelope.slots.len(), signed = sign, "envelope sealed");
        Ok(envelope)
    }

    /// Encrypt under the ring's session key.
    pub async fn encrypt_for_session(&self, plaintext: &[u8], sign: bool) -> Result<EncryptedEnvelope, CryptoError> {
        let (session, signer) = {
            let ring = self.ring.read().await;
            let session = ring.session_key().cloned().ok_or(CryptoError::InvalidState {
                operation: "encrypt_for_session",
                state: "no session key",
            })?;
            (session, Self::signer(&ring, sign)?)
        };
        let plaintext = plaintext.to_vec();
        let envelope = tokio::task::spawn_blocking(move || {
            seal_envelope(&mut OsRng, &plaintext, &[], &[session], signer.as_ref())
        })
        .await??;
        tracing::debug!(signed = sign, "envelope sealed for session");
        Ok(envelope)
    }

    /// Open an envelope with the session key or the local private key. With `require_signature`
    /// set, anything short of a verified signature from a known key fails with
    /// [`SignatureFailed`](CryptoError::SignatureFailed).
    pub async fn decrypt_and_verify(
        &self,
        envelope: &EncryptedEnvelope,
        require_signature: bool,
    ) -> Result<Decrypted, CryptoError> {
        let keys = OpenKeys::from_ring(&*self.ring.read().await);
        let envelope = envelope.clone();
        let decrypted = tokio::task::spawn_blocking(move || keys.open(&envelope)).await??;
        tracing::debug!(signature = decrypted.signature.label(), "envelope opened");
        if require_signature && !decrypted.signature.is_verified() {
            tracing::warn!(status = ?decrypted.signature, "required signature missing or invalid");
            return Err(CryptoError::SignatureFailed);
        }
        Ok(decrypted)
    }

    /// Parse a batch of armored public keys. Every input gets exactly one entry in the output, in
    /// the same order; invalid keys are reported, never fatal.
    pub fn load_public_keys(&self, armored: &[&str]) -> Vec<KeyValidation> {
        let results: Vec<KeyValidation> = armored.iter().map(|t| keys::validate_public_key(t)).collect();
        let invalid = results.iter().filter(|r| !r.is_valid()).count();
        if invalid > 0 {
            tracing::warn!(total = results.len(), invalid, "some public keys failed to load");
        }
        results
    }

    pub fn valid_public_key(&self, armored: &str) -> KeyValidation {
        keys::validate_public_key(armored)
    }

    pub fn valid_private_key(&self, armored: &str) -> PrivateKeyValidation {
        keys::validate_private_key(armored)
    }

    /// Seal a session key to one recipient, as an armored `SESSION KEY` block.
    pub fn seal_session_key(&self, key: &SessionKey, recipient: &PublicKey) -> Result<String, CryptoError> {
        let lockbox = key
            .export_for_lock(&mut OsRng, recipient.lock_id())
            .ok_or_else(|| CryptoError::InvalidKey("session key can't be exported".into()))?;
        Ok(armor::encode(ArmorLabel::SessionKey, lockbox.as_bytes()))
    }

    /// Open a sealed session key with the local private key.
    pub async fn open_session_key(&self, armored: &str) -> Result<SessionKey, CryptoError> {
        let raw = armor::decode_as(armored, ArmorLabel::SessionKey)
            .map_err(|_| CryptoError::Decryption("sealed session key is malformed"))?;
        let lockbox = StreamLockbox::try_from(&raw[..])
            .map_err(|_| CryptoError::Decryption("sealed session key is malformed"))?;
        let ring = self.ring.read().await;
        let lock_key = match ring.secret_keys() {
            Some(keys) => keys.lock_key(),
            None => return Err(CryptoError::Decryption("key ring is locked")),
        };
        match lockbox.recipient() {
            LockboxRecipient::LockId(id) if id == lock_key.id() => (),
            _ => return Err(CryptoError::Decryption("not an intended recipient")),
        }
        lock_key
            .decrypt_stream_key(&lockbox)
            .map_err(|_| CryptoError::Decryption("session key failed to decrypt"))
    }
}
