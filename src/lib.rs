/*!
Client-side cryptography for anonymous submissions.

A source ("whistleblower") has no account and no persistent identity. All they hold is a keycode
or passphrase. From it this crate derives a secret that protects a long-term key pair, and a token
the server can use to recognise the source without ever learning the secret. Each submission gets
its own session key, sealed once for every receiver (and for the source), and the answers are
encrypted and signed under that session key.

The layers, leaf first:

- [`kdf`]: memory-hard derivation of a protection secret and an authentication token.
- [`keycode`]: 16-digit numeric credentials.
- [`keys`]: armored public and private keys, locking and unlocking under a protection secret.
- [`keyring`]: the local key pair, known recipients and the session key, behind one lock.
- [`cipher`]: multi-recipient encryption and signing of opaque payloads.
- [`whistleblower`] and [`receiver`]: the two sides of a submission as explicit state machines.

# Cryptographic Algorithms Used

- Password stretching: Argon2id, split into independent outputs with HKDF-SHA256
- Hashing: BLAKE2b with a 32-byte digest
- Signing: Ed25519
- Symmetric Encryption: AEAD cipher using XChaCha20 and Poly1305
- DH key exchange: X25519

# Cryptographic Versioning

Every encoded object starts with a version byte. Each primitive has `DEFAULT_*`, `MIN_*` and
`MAX_*` version constants. A new algorithm is introduced by raising the maximum, adopted by raising
the default once deployed readers understand it, and retired by raising the minimum.
*/

mod error;
pub use self::error::CryptoError;

pub mod hash;

pub mod identity;
pub use identity::{Identity, IdentityKey, Signature};

pub mod lock;
pub use lock::{LockId, LockKey};

pub mod lockbox;

pub mod stream;
pub use stream::{StreamId, StreamKey};

pub mod armor;

pub mod kdf;
pub use kdf::{AuthToken, DerivedMaterial, KdfConfig, KeyDerivation, Secret};

pub mod keycode;
pub use keycode::Keycode;

pub mod keys;
pub use keys::{Fingerprint, KeyPair, KeyValidation, PrivateKeyValidation, PublicKey};

pub mod keyring;
pub use keyring::{KeyRing, KeyRingHandle, SessionKey, LOCAL_KEY_ALIAS};

pub mod cipher;
pub use cipher::{CipherEngine, Decrypted, EncryptedEnvelope, SignatureStatus};

pub mod submission;
pub use submission::{EncryptedSessionKey, SubmissionRecord};

pub mod whistleblower;
pub use whistleblower::{Whistleblower, WhistleblowerState, WHISTLEBLOWER_ID};

pub mod receiver;
pub use receiver::{GeneratedKey, PassphraseChange, Receiver, ReceiverState};

#[cfg(feature = "with-serde")]
pub mod serde;

use rand_core::{CryptoRng, RngCore};

/// Holds a cryptographic random number generator (RNG). This trait is needed so that a RNG can be
/// passed around as a trait object.
pub trait CryptoSrc: CryptoRng + RngCore {}
impl<T: CryptoRng + RngCore> CryptoSrc for T {}
