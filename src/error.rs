use std::io;

use thiserror::Error;

/// Possible error conditions for key derivation, key management and encryption.
///
/// The first group covers malformed encodings and primitive-level failures. The second group is
/// the engine's contract: callers are expected to branch on `WrongSecret`, `KeyRingAdd`,
/// `NoRecipients`, `Decryption` and `SignatureFailed`, while `ExportWhileUnlocked` and
/// `InvalidKey` on stored material indicate a broken caller contract.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Crypto primitive uses a version this library doesn't recognize.
    #[error("unsupported crypto version {0}")]
    UnsupportedVersion(u8),
    /// Crypto primitive uses a version this library no longer accepts.
    #[error("crypto version {0} is no longer accepted")]
    OldVersion(u8),
    /// Data for a decoding step wasn't the correct length.
    #[error("bad length during step \"{step}\": expected {expected}, got {actual}")]
    BadLength {
        step: &'static str,
        expected: usize,
        actual: usize,
    },
    /// The data format doesn't match the expected encoding.
    #[error("malformed data: {0}")]
    BadFormat(&'static str),
    /// A cryptographic key is weak or isn't a valid curve point.
    #[error("crypto key is weak or invalid")]
    BadKey,
    /// An object was used with the wrong counterpart (e.g. a key on a lockbox meant for another
    /// key).
    #[error("object mismatch: {0}")]
    ObjectMismatch(&'static str),
    /// AEAD decryption failed.
    #[error("could not decrypt with key")]
    DecryptFailed,
    /// A signature didn't verify, or wasn't acceptable to the caller's policy.
    #[error("signature verification failed")]
    SignatureFailed,
    /// Bad derivation parameters, empty secret or empty salt.
    #[error("key derivation failed: {0}")]
    Derivation(String),
    /// Key material could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The key material is well formed, but the secret does not unlock it.
    #[error("secret does not unlock the private key")]
    WrongSecret,
    /// A recipient public key was rejected by the key ring.
    #[error("could not add pubkey to key ring ({recipient}): {reason}")]
    KeyRingAdd { recipient: String, reason: String },
    /// Cleartext private key material was about to leave the engine.
    #[error("attempted to export decrypted private key")]
    ExportWhileUnlocked,
    /// Encryption was requested with an empty recipient set.
    #[error("no recipients given for encryption")]
    NoRecipients,
    /// Envelope or session key couldn't be opened by the local identity.
    #[error("decryption failed: {0}")]
    Decryption(&'static str),
    /// No public key is known for the recipient id.
    #[error("no public key known for recipient {0}")]
    UnknownRecipient(String),
    /// The key ring holds no local identity.
    #[error("key ring is not initialized")]
    NotInitialized,
    /// The operation needs the local private key, but the ring is locked.
    #[error("key ring is locked")]
    Locked,
    /// A workflow transition was attempted from the wrong state.
    #[error("operation \"{operation}\" not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    /// A background computation panicked or was shut down.
    #[error("background task failed: {0}")]
    Task(String),
    /// Encode/decode I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CryptoError {
    #[cfg(feature = "with-serde")]
    pub(crate) fn serde_err(&self) -> String {
        self.to_string()
    }
}

impl From<tokio::task::JoinError> for CryptoError {
    fn from(err: tokio::task::JoinError) -> CryptoError {
        CryptoError::Task(err.to_string())
    }
}
