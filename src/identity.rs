//! Cryptographic signatures.
//!
//! An [`IdentityKey`] signs a [`Hash`](crate::hash::Hash), producing a [`Signature`] that carries
//! the signer's public [`Identity`]. Envelopes signed by a whistleblower or a receiver carry one of
//! these over the hash of their plaintext.
//!
//! All `IdentityKey` structs are backed by something implementing [`SignInterface`]. In this crate
//! that is always an in-memory key, recovered from a locked private key when the key ring is
//! unlocked.
//!
//! # Example
//!
//! ```
//! # use tip_crypto::identity::*;
//! # use tip_crypto::hash::Hash;
//! # use std::convert::TryFrom;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut csprng = rand::rngs::OsRng {};
//! let key = IdentityKey::new_temp(&mut csprng);
//!
//! let hash = Hash::new(b"I am data, soon to be hashed");
//! let signature = key.sign(&hash);
//!
//! let mut encoded = Vec::new();
//! signature.encode_vec(&mut encoded);
//!
//! let unverified = UnverifiedSignature::try_from(&encoded[..])?;
//! let verified = unverified.verify(&hash)?;
//! assert_eq!(verified.signer(), key.id());
//! # Ok(())
//! # }
//! ```
//!
//! # Algorithm
//!
//! Ed25519 with strict verification.
//!
//! # Format
//!
//! An [`Identity`] is a version byte followed by the 32-byte public key. An [`IdentityKey`] is a
//! version byte followed by the 32-byte secret key, and that encoding only ever appears inside an
//! [`IdentityLockbox`].
//!
//! ```text
//! +--------------+==========+===========+
//! | Hash Version | Identity | Signature |
//! +--------------+==========+===========+
//!
//! - Hash Version (1 byte)
//! - Identity: 33 bytes
//! - Signature: 64 bytes
//! ```

use crate::{
    hash::{Hash, MAX_HASH_VERSION, MIN_HASH_VERSION},
    lockbox::*,
    stream::{stream_key_encrypt, StreamKey},
    CryptoError, CryptoSrc,
};

use ed25519_dalek::Signer;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use std::{convert::TryFrom, fmt, sync::Arc};

/// Default signature algorithm version.
pub const DEFAULT_SIGN_VERSION: u8 = 1;

/// Minimum accepted signature algorithm version.
pub const MIN_SIGN_VERSION: u8 = 1;

/// Maximum accepted signature algorithm version.
pub const MAX_SIGN_VERSION: u8 = 1;

const V1_IDENTITY_KEY_SIZE: usize = ed25519_dalek::SECRET_KEY_LENGTH;
const V1_IDENTITY_ID_SIZE: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;
const V1_IDENTITY_SIGN_SIZE: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Identity Key that allows signing hashes as a given Identity.
#[derive(Clone)]
pub struct IdentityKey {
    interface: Arc<dyn SignInterface>,
}

impl IdentityKey {
    /// Generate a temporary `IdentityKey` that exists in program memory.
    pub fn new_temp<R>(csprng: &mut R) -> IdentityKey
    where
        R: CryptoRng + RngCore,
    {
        new_identity_key(Arc::new(ContainedIdKey::generate(csprng)))
    }

    /// Generate a temporary `IdentityKey` with a specific version. Fails if the version is
    /// unsupported.
    pub fn new_temp_with_version<R>(csprng: &mut R, version: u8) -> Result<IdentityKey, CryptoError>
    where
        R: CryptoRng + RngCore,
    {
        let interface = Arc::new(ContainedIdKey::with_version(csprng, version)?);
        Ok(new_identity_key(interface))
    }

    /// Get the signature algorithm version used by this key.
    pub fn version(&self) -> u8 {
        self.id().version()
    }

    /// Get the associated [`Identity`] for this key.
    pub fn id(&self) -> &Identity {
        self.interface.id()
    }

    /// Sign a hash. Signing should be fast and always succeed.
    pub fn sign(&self, hash: &Hash) -> Signature {
        self.interface.sign(hash)
    }

    /// Pack this key into an `IdentityLockbox` addressed to `stream`. Returns None if this key
    /// cannot be exported.
    pub fn export_for_stream<R: CryptoRng + RngCore>(
        &self,
        csprng: &mut R,
        stream: &StreamKey,
    ) -> Option<IdentityLockbox> {
        self.interface.self_export_stream(csprng, stream)
    }
}

impl fmt::Display for IdentityKey {
    /// Display just the Identity (never the underlying key).
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.id(), f)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("version", &self.version())
            .field("public_key", &self.id().raw_public_key())
            .finish()
    }
}

/// Create a new `IdentityKey` from something implementing the signature interface.
pub fn new_identity_key(interface: Arc<dyn SignInterface>) -> IdentityKey {
    IdentityKey { interface }
}

/// An Identity, wrapping a public signing key.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    id: ed25519_dalek::VerifyingKey,
}

impl Identity {
    /// Get the cryptographic algorithm version used for this identity.
    pub fn version(&self) -> u8 {
        1u8
    }

    /// Get the raw public signing key contained within.
    pub fn raw_public_key(&self) -> &[u8] {
        self.id.as_bytes()
    }

    /// Convert into a byte vector.
    pub fn as_vec(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.encode_vec(&mut v);
        v
    }

    /// Attempt to parse a base58-encoded Identity.
    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        let raw = bs58::decode(s)
            .into_vec()
            .or(Err(CryptoError::BadFormat("Not valid Base58")))?;
        Self::try_from(&raw[..])
    }

    /// Convert into a base58-encoded Identity.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.as_vec()).into_string()
    }

    /// Encode onto an existing byte vector: the version followed by the public signing key.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.size());
        buf.push(self.version());
        buf.extend_from_slice(self.id.as_bytes());
    }

    /// Get the length of this Identity once encoded as bytes.
    pub fn size(&self) -> usize {
        1 + V1_IDENTITY_ID_SIZE
    }
}

fn verifying_key(raw: &[u8]) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
    let raw: &[u8; V1_IDENTITY_ID_SIZE] = raw.try_into().map_err(|_| CryptoError::BadLength {
        step: "get Identity public key",
        expected: V1_IDENTITY_ID_SIZE,
        actual: raw.len(),
    })?;
    ed25519_dalek::VerifyingKey::from_bytes(raw).or(Err(CryptoError::BadKey))
}

impl TryFrom<&[u8]> for Identity {
    type Error = CryptoError;

    /// Value must be exactly one encoded Identity, with no trailing bytes.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, data) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get Identity version",
            expected: 1,
            actual: 0,
        })?;
        if !(MIN_SIGN_VERSION..=MAX_SIGN_VERSION).contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        Ok(Identity {
            id: verifying_key(data)?,
        })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Identity")
            .field("version", &self.version())
            .field("public_key", &self.raw_public_key())
            .finish()
    }
}

impl fmt::Display for Identity {
    /// Display as a base58-encoded string.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl std::hash::Hash for Identity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.as_bytes().hash(state);
    }
}

/// A Signature interface, implemented by anything that can hold a private cryptographic signing
/// key.
pub trait SignInterface: Send + Sync {
    /// Get the corresponding `Identity` for the private key.
    fn id(&self) -> &Identity;

    /// Sign a hash.
    fn sign(&self, hash: &Hash) -> Signature;

    /// Export the signing key in an `IdentityLockbox`, with `receive_stream` as the recipient. If
    /// the key cannot be exported, this should return None.
    fn self_export_stream(
        &self,
        csprng: &mut dyn CryptoSrc,
        receive_stream: &StreamKey,
    ) -> Option<IdentityLockbox>;
}

/// A self-contained implementor of `SignInterface`.
pub struct ContainedIdKey {
    id: Identity,
    inner: ed25519_dalek::SigningKey,
}

impl ContainedIdKey {
    /// Generate a new key given a cryptographic random number generator.
    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let inner = ed25519_dalek::SigningKey::generate(csprng);
        let id = Identity {
            id: inner.verifying_key(),
        };
        Self { id, inner }
    }

    /// Generate a new key with a specific version. Fails if the version isn't supported.
    pub fn with_version<R>(csprng: &mut R, version: u8) -> Result<Self, CryptoError>
    where
        R: CryptoRng + RngCore,
    {
        if !(MIN_SIGN_VERSION..=MAX_SIGN_VERSION).contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        Ok(Self::generate(csprng))
    }

    /// Encode the raw key, prepended with the version byte. The output vector must be either
    /// zeroized or encrypted before being dropped.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.reserve(1 + V1_IDENTITY_KEY_SIZE);
        buf.push(self.id.version());
        buf.extend_from_slice(self.inner.as_bytes());
    }
}

impl TryFrom<&[u8]> for ContainedIdKey {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, key) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get IdentityKey version",
            expected: 1,
            actual: 0,
        })?;
        if version < MIN_SIGN_VERSION {
            return Err(CryptoError::OldVersion(version));
        }
        if version > MAX_SIGN_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let mut raw: [u8; V1_IDENTITY_KEY_SIZE] =
            TryFrom::try_from(key).map_err(|_| CryptoError::BadLength {
                step: "get IdentityKey key bytes",
                expected: V1_IDENTITY_KEY_SIZE,
                actual: key.len(),
            })?;
        let inner = ed25519_dalek::SigningKey::from_bytes(&raw);
        raw.zeroize();
        let id = Identity {
            id: inner.verifying_key(),
        };
        Ok(Self { id, inner })
    }
}

impl SignInterface for ContainedIdKey {
    fn id(&self) -> &Identity {
        &self.id
    }

    fn sign(&self, hash: &Hash) -> Signature {
        Signature {
            hash_version: hash.version(),
            id: self.id.clone(),
            inner: self.inner.sign(hash.digest()),
        }
    }

    fn self_export_stream(
        &self,
        csprng: &mut dyn CryptoSrc,
        receive_stream: &StreamKey,
    ) -> Option<IdentityLockbox> {
        let mut raw_secret = Vec::new();
        self.encode_vec(&mut raw_secret);
        let lockbox_vec = stream_key_encrypt(
            receive_stream,
            csprng,
            LockboxType::Identity(true),
            &raw_secret,
        );
        raw_secret.zeroize();
        Some(identity_lockbox_from_parts(
            LockboxRecipient::StreamId(receive_stream.id().clone()),
            lockbox_vec,
        ))
    }
}

/// An annotated cryptographic signature.
///
/// Includes the version of hash that was signed, the [`Identity`] of the signer, and the signature
/// itself. A signature comes either from [`IdentityKey::sign`] or from verifying an
/// [`UnverifiedSignature`].
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    hash_version: u8,
    id: Identity,
    inner: ed25519_dalek::Signature,
}

impl Signature {
    /// The version of the [`struct@Hash`] used in signature computation.
    pub fn hash_version(&self) -> u8 {
        self.hash_version
    }

    /// The public [`Identity`] of the [`IdentityKey`] that created this signature.
    pub fn signer(&self) -> &Identity {
        &self.id
    }

    /// Encode the signature onto a `Vec<u8>`.
    pub fn encode_vec(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.size());
        buf.push(self.hash_version);
        self.id.encode_vec(buf);
        buf.extend_from_slice(&self.inner.to_bytes());
    }

    /// The length of the signature, in bytes, when encoded.
    pub fn size(&self) -> usize {
        1 + self.id.size() + V1_IDENTITY_SIGN_SIZE
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Signature")
            .field("hash_version", &self.hash_version)
            .field("signer", &self.id)
            .field("signature", &self.inner)
            .finish()
    }
}

/// A signature that has been read from a byte slice but hasn't been verified yet.
#[derive(Clone, PartialEq, Eq)]
pub struct UnverifiedSignature {
    hash_version: u8,
    signature: ed25519_dalek::Signature,
    id: Identity,
}

impl UnverifiedSignature {
    /// Get the version of hash needed to complete the signature.
    pub fn hash_version(&self) -> u8 {
        self.hash_version
    }

    /// Verify the Signature, producing a verified Signature or failing.
    pub fn verify(self, hash: &Hash) -> Result<Signature, CryptoError> {
        if hash.version() != self.hash_version {
            return Err(CryptoError::ObjectMismatch(
                "Verification step got wrong version of hash",
            ));
        }
        self.id
            .id
            .verify_strict(hash.digest(), &self.signature)
            .map_err(|_| CryptoError::SignatureFailed)?;
        Ok(Signature {
            hash_version: self.hash_version,
            id: self.id,
            inner: self.signature,
        })
    }
}

impl fmt::Debug for UnverifiedSignature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UnverifiedSignature")
            .field("hash_version", &self.hash_version)
            .field("signer", &self.id)
            .field("signature", &self.signature)
            .finish()
    }
}

impl TryFrom<&[u8]> for UnverifiedSignature {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&hash_version, value) = value.split_first().ok_or(CryptoError::BadLength {
            step: "get signature hash version",
            expected: 1,
            actual: 0,
        })?;
        if !(MIN_HASH_VERSION..=MAX_HASH_VERSION).contains(&hash_version) {
            return Err(CryptoError::UnsupportedVersion(hash_version));
        }
        let id_len = 1 + V1_IDENTITY_ID_SIZE;
        if value.len() != id_len + V1_IDENTITY_SIGN_SIZE {
            // Check the identity version first so a bad version reports as such.
            if let Some(&id_version) = value.first() {
                if !(MIN_SIGN_VERSION..=MAX_SIGN_VERSION).contains(&id_version) {
                    return Err(CryptoError::UnsupportedVersion(id_version));
                }
            }
            return Err(CryptoError::BadLength {
                step: "get signature signer and data",
                expected: id_len + V1_IDENTITY_SIGN_SIZE,
                actual: value.len(),
            });
        }
        let (raw_id, raw_signature) = value.split_at(id_len);
        let id = Identity::try_from(raw_id)?;
        let signature = ed25519_dalek::Signature::from_slice(raw_signature)
            .or(Err(CryptoError::SignatureFailed))?;
        Ok(UnverifiedSignature {
            hash_version,
            id,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basics() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        assert_eq!(key.version(), DEFAULT_SIGN_VERSION);
        let key = IdentityKey::new_temp_with_version(&mut csprng, DEFAULT_SIGN_VERSION).unwrap();
        assert_eq!(key.version(), DEFAULT_SIGN_VERSION);
        if let Err(CryptoError::UnsupportedVersion(99u8)) =
            IdentityKey::new_temp_with_version(&mut csprng, 99u8)
        {
        } else {
            panic!("Didn't get expected error on new_temp_with_version");
        }
    }

    #[test]
    fn display() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let disp_key = format!("{}", &key);
        assert_eq!(disp_key, format!("{}", key.id()));
        assert_eq!(disp_key, key.id().to_base58());
    }

    #[test]
    fn base58() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let mut base58 = key.id().to_base58();
        assert_eq!(&Identity::from_base58(&base58).unwrap(), key.id());
        base58.push('a');
        base58.push('a');
        assert!(Identity::from_base58(&base58).is_err());
        base58.truncate(base58.len() - 3);
        assert!(Identity::from_base58(&base58).is_err());
    }

    #[test]
    fn encode() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let enc = key.id().as_vec();
        assert_eq!(enc.len(), key.id().size());
        assert_eq!(&Identity::try_from(&enc[..]).unwrap(), key.id());
    }

    #[test]
    fn sign() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let hash = Hash::new(b"This is a test");
        let sign = key.sign(&hash);
        assert_eq!(sign.hash_version(), hash.version());
        assert_eq!(sign.signer(), key.id());

        let mut enc = Vec::new();
        sign.encode_vec(&mut enc);
        assert_eq!(enc.len(), sign.size());
        let dec_sign = UnverifiedSignature::try_from(&enc[..])
            .expect("Wasn't able to decode an unverified signature")
            .verify(&hash)
            .expect("Wasn't able to verify the signature");
        assert_eq!(dec_sign, sign);
    }

    #[test]
    fn wrong_hash() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let sign = key.sign(&Hash::new(b"This is a test"));
        let mut enc = Vec::new();
        sign.encode_vec(&mut enc);
        let unverified = UnverifiedSignature::try_from(&enc[..]).unwrap();
        if let Err(CryptoError::SignatureFailed) = unverified.verify(&Hash::new(b"Not the same data")) {
        } else {
            panic!("Signature verification should fail with SignatureFailed when given the wrong Hash");
        }
    }

    #[test]
    fn wrong_versions() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let sign = key.sign(&Hash::new(b"This is a test"));
        let mut enc = Vec::new();
        sign.encode_vec(&mut enc);

        for (index, bad) in [(0usize, 0u8), (0, 255), (1, 0), (1, 255)] {
            let mut corrupt = enc.clone();
            corrupt[index] = bad;
            match UnverifiedSignature::try_from(&corrupt[..]) {
                Err(CryptoError::UnsupportedVersion(v)) => assert_eq!(v, bad),
                other => panic!("Expected UnsupportedVersion, got {:?}", other),
            }
        }
    }

    #[test]
    fn corrupted_signature() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let hash = Hash::new(b"This is a test");
        let mut enc = Vec::new();
        key.sign(&hash).encode_vec(&mut enc);

        for i in (enc.len() - V1_IDENTITY_SIGN_SIZE)..enc.len() {
            enc[i] = !enc[i];
            let verified = UnverifiedSignature::try_from(&enc[..]).and_then(|u| u.verify(&hash));
            if let Err(CryptoError::SignatureFailed) = verified {
            } else {
                panic!("Should fail with SignatureFailed when signature byte {} is wrong", i);
            }
            enc[i] = !enc[i];
        }
    }

    #[test]
    fn substitute_wrong_id() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let other_id = IdentityKey::new_temp(&mut csprng);
        let hash = Hash::new(b"This is a test");
        let mut enc = Vec::new();
        key.sign(&hash).encode_vec(&mut enc);
        for (dest, src) in enc.iter_mut().skip(1).zip(other_id.id().as_vec().iter()) {
            *dest = *src;
        }
        let unverified = UnverifiedSignature::try_from(&enc[..])
            .expect("Key should be valid, just wrong for the signature");
        if let Err(CryptoError::SignatureFailed) = unverified.verify(&hash) {
        } else {
            panic!("Should fail with SignatureFailed when identity is wrong for signature");
        }
    }

    #[test]
    fn export_round_trip() {
        let mut csprng = rand::rngs::OsRng;
        let key = IdentityKey::new_temp(&mut csprng);
        let wrapper = StreamKey::new_temp(&mut csprng);
        let lockbox = key.export_for_stream(&mut csprng, &wrapper).unwrap();
        let enc = lockbox.as_bytes().to_vec();
        let dec = IdentityLockbox::try_from(&enc[..]).unwrap();
        let restored = wrapper.decrypt_identity_key(&dec).unwrap();
        assert_eq!(restored.id(), key.id());

        let hash = Hash::new(b"signed after restore");
        let mut sig = Vec::new();
        restored.sign(&hash).encode_vec(&mut sig);
        let verified = UnverifiedSignature::try_from(&sig[..]).unwrap().verify(&hash).unwrap();
        assert_eq!(verified.signer(), key.id());
    }
}
