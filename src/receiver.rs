//! The receiver's side of a submission.
//!
//! A receiver holds a long-term key pair stored locked on the server. After unlocking it, they load
//! the session key sealed to them in a submission, read the answers, and reply with comments that
//! the source and every other receiver of that submission can read.

use crate::{
    cipher::{CipherEngine, Decrypted, EncryptedEnvelope},
    kdf::{AuthToken, KeyDerivation, Secret},
    keyring::KeyRingHandle,
    keys,
    submission::SubmissionRecord,
    CryptoError,
};

use rand_core::OsRng;

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    /// No usable private key: nothing loaded yet, or still locked.
    Locked,
    Unlocked,
    /// A submission's session key is loaded.
    SessionLoaded,
}

impl ReceiverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiverState::Locked => "Locked",
            ReceiverState::Unlocked => "Unlocked",
            ReceiverState::SessionLoaded => "SessionLoaded",
        }
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of [`Receiver::generate_key`], ready to upload.
#[derive(Clone, Debug)]
pub struct GeneratedKey {
    pub public_key: String,
    pub private_key: String,
    pub auth_token: AuthToken,
}

/// Output of [`Receiver::change_passphrase`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassphraseChange {
    /// The private key, locked under the new passphrase.
    pub private_key: String,
    pub old_auth_token_hash: String,
    pub new_auth_token_hash: String,
}

pub struct Receiver {
    engine: CipherEngine,
    kdf: KeyDerivation,
    state: ReceiverState,
}

impl Receiver {
    pub fn new(ring: KeyRingHandle, kdf: KeyDerivation) -> Self {
        Self {
            engine: CipherEngine::new(ring),
            kdf,
            state: ReceiverState::Locked,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn key_ring(&self) -> &KeyRingHandle {
        self.engine.key_ring()
    }

    pub fn engine(&self) -> &CipherEngine {
        &self.engine
    }

    fn require(&self, operation: &'static str, allowed: &[ReceiverState]) -> Result<(), CryptoError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CryptoError::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    fn transition(&mut self, to: ReceiverState) {
        if self.state != to {
            tracing::info!(from = %self.state, to = %to, "receiver state changed");
            self.state = to;
        }
    }

    /// Create a fresh key pair protected by `passphrase`, load it into the key ring under
    /// `receiver_id`, and leave it unlocked.
    pub async fn generate_key(
        &mut self,
        passphrase: impl Into<Secret>,
        salt: &[u8],
        receiver_id: &str,
    ) -> Result<GeneratedKey, CryptoError> {
        self.require("generate_key", &[ReceiverState::Locked])?;
        let material = self.kdf.derive(passphrase.into(), salt.to_vec()).await?;
        let pair = keys::generate(&mut OsRng, &material.protection_secret)?;
        let private_key = keys::export_private_key(&pair)?;
        let public_key = pair.public_key().to_armored();

        let ring = self.key_ring();
        ring.initialize(&private_key, receiver_id).await?;
        if !ring.unlock_key_ring(&material.protection_secret).await? {
            return Err(CryptoError::WrongSecret);
        }
        self.transition(ReceiverState::Unlocked);
        Ok(GeneratedKey {
            public_key,
            private_key,
            auth_token: material.auth_token,
        })
    }

    /// Load the receiver's locked private key. Any loaded session is dropped.
    pub async fn initialize(&mut self, armored_private_key: &str, receiver_id: &str) -> Result<(), CryptoError> {
        self.key_ring().initialize(armored_private_key, receiver_id).await?;
        self.transition(ReceiverState::Locked);
        Ok(())
    }

    /// Unlock with an already derived protection secret.
    pub async fn unlock(&mut self, protection: &Secret) -> Result<(), CryptoError> {
        if !self.key_ring().unlock_key_ring(protection).await? {
            return Err(CryptoError::WrongSecret);
        }
        if self.state == ReceiverState::Locked {
            self.transition(ReceiverState::Unlocked);
        }
        Ok(())
    }

    /// Derive the protection secret from the passphrase and unlock with it. Returns the token for
    /// the authentication service.
    pub async fn derive_and_unlock(&mut self, passphrase: impl Into<Secret>, salt: &[u8]) -> Result<AuthToken, CryptoError> {
        let material = self.kdf.derive(passphrase.into(), salt.to_vec()).await?;
        self.unlock(&material.protection_secret).await?;
        Ok(material.auth_token)
    }

    /// Open a session key sealed to this receiver and make it the active one.
    pub async fn load_session_key(&mut self, sealed: &str) -> Result<(), CryptoError> {
        let session = self.engine.open_session_key(sealed).await?;
        self.key_ring().set_session_key(session).await;
        self.transition(ReceiverState::SessionLoaded);
        Ok(())
    }

    /// Find this receiver's entry in a submission record and load it.
    pub async fn load_session_key_from(&mut self, record: &SubmissionRecord) -> Result<(), CryptoError> {
        let local_id = self.key_ring().local_id().await.ok_or(CryptoError::NotInitialized)?;
        let sealed = record
            .session_key_for(&local_id)
            .ok_or(CryptoError::Decryption("not an intended recipient"))?;
        self.load_session_key(sealed).await
    }

    /// Open the submission's answers, or any comment on it.
    pub async fn decrypt_answers(&self, envelope: &EncryptedEnvelope, require_signature: bool) -> Result<Decrypted, CryptoError> {
        self.require("decrypt_answers", &[ReceiverState::SessionLoaded])?;
        self.engine.decrypt_and_verify(envelope, require_signature).await
    }

    /// Encrypt a comment under the loaded session key.
    pub async fn encrypt_comment(&self, comment: &[u8], sign: bool) -> Result<EncryptedEnvelope, CryptoError> {
        self.require("encrypt_comment", &[ReceiverState::SessionLoaded])?;
        self.engine.encrypt_for_session(comment, sign).await
    }

    /// Re-lock the private key under a new passphrase. The returned key replaces the stored one,
    /// and the token hashes let the authentication service switch over. `old` must be the
    /// passphrase the key is protected by, or this fails with
    /// [`WrongSecret`](CryptoError::WrongSecret). The ring ends up unlocked.
    pub async fn change_passphrase(
        &mut self,
        old: impl Into<Secret>,
        new: impl Into<Secret>,
        salt: &[u8],
    ) -> Result<PassphraseChange, CryptoError> {
        let old = self.kdf.derive(old.into(), salt.to_vec()).await?;
        let new = self.kdf.derive(new.into(), salt.to_vec()).await?;

        let ring = self.key_ring();
        ring.change_key_passphrase(&old.protection_secret, &new.protection_secret)
            .await?;
        let private_key = ring.export_priv_key().await?;
        if !ring.unlock_key_ring(&new.protection_secret).await? {
            return Err(CryptoError::WrongSecret);
        }
        if self.state == ReceiverState::Locked {
            self.transition(ReceiverState::Unlocked);
        }

        Ok(PassphraseChange {
            private_key,
            old_auth_token_hash: old.auth_token.hash_hex(),
            new_auth_token_hash: new.auth_token.hash_hex(),
        })
    }

    pub async fn clear(&mut self) {
        self.key_ring().clear().await;
        self.transition(ReceiverState::Locked);
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kdf::KdfConfig, whistleblower::Whistleblower, SignatureStatus};

    fn cheap_kdf() -> KeyDerivation {
        KeyDerivation::new(KdfConfig {
            work_factor: 8,
            iterations: 1,
            parallelism: 1,
        })
    }

    const BOB: &str = "9d4e1e23-bd5b-4d6f-9f5b-4c1b0e35e1a2";

    #[tokio::test]
    async fn generate_and_reload() {
        let kdf = cheap_kdf();
        let mut rx = Receiver::new(KeyRingHandle::new(), kdf);
        let generated = rx.generate_key("correct horse", b"bob salt", BOB).await.unwrap();
        assert_eq!(rx.state(), ReceiverState::Unlocked);
        assert!(keys::validate_public_key(&generated.public_key).is_valid());
        assert!(keys::validate_private_key(&generated.private_key).is_valid());

        let mut again = Receiver::new(KeyRingHandle::new(), kdf);
        again.initialize(&generated.private_key, BOB).await.unwrap();
        assert_eq!(again.state(), ReceiverState::Locked);
        assert!(matches!(
            again.derive_and_unlock("wrong horse", b"bob salt").await,
            Err(CryptoError::WrongSecret)
        ));
        assert_eq!(again.state(), ReceiverState::Locked);
        let token = again.derive_and_unlock("correct horse", b"bob salt").await.unwrap();
        assert_eq!(token, generated.auth_token);
        assert_eq!(again.state(), ReceiverState::Unlocked);
    }

    #[tokio::test]
    async fn session_required() {
        let mut rx = Receiver::new(KeyRingHandle::new(), cheap_kdf());
        rx.generate_key("pass", b"salt", BOB).await.unwrap();
        assert!(matches!(
            rx.encrypt_comment(b"hi", true).await,
            Err(CryptoError::InvalidState { .. })
        ));
        assert!(matches!(
            rx.load_session_key("not armor").await,
            Err(CryptoError::Decryption(_))
        ));
        assert_eq!(rx.state(), ReceiverState::Unlocked);
    }

    #[tokio::test]
    async fn locked_ring_cannot_load_session() {
        let kdf = cheap_kdf();
        let mut rx = Receiver::new(KeyRingHandle::new(), kdf);
        let generated = rx.generate_key("pass", b"salt", BOB).await.unwrap();

        let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf);
        let mut record = SubmissionRecord::new();
        wb.derive_key("1234123412341234", b"wb salt", &mut record).await.unwrap();
        wb.key_ring().add_pub_key(BOB, &generated.public_key).await.unwrap();
        wb.derive_session_key(&[BOB], &mut record).await.unwrap();

        let mut locked = Receiver::new(KeyRingHandle::new(), kdf);
        locked.initialize(&generated.private_key, BOB).await.unwrap();
        assert!(matches!(
            locked.load_session_key_from(&record).await,
            Err(CryptoError::Decryption("key ring is locked"))
        ));

        rx.load_session_key_from(&record).await.unwrap();
        assert_eq!(rx.state(), ReceiverState::SessionLoaded);
        let envelope = wb.encrypt_and_sign_answers(b"answers", true).await.unwrap();
        let opened = rx.decrypt_answers(&envelope, false).await.unwrap();
        assert_eq!(opened.data, b"answers");
        // The source's key isn't in the receiver's ring.
        assert!(matches!(opened.signature, SignatureStatus::UnknownSigner(_)));
        assert!(matches!(
            rx.decrypt_answers(&envelope, true).await,
            Err(CryptoError::SignatureFailed)
        ));
    }

    #[tokio::test]
    async fn change_passphrase() {
        let kdf = cheap_kdf();
        let mut rx = Receiver::new(KeyRingHandle::new(), kdf);
        let generated = rx.generate_key("old pass", b"salt", BOB).await.unwrap();
        let public = keys::validate_public_key(&generated.public_key).into_result().unwrap();

        assert!(matches!(
            rx.change_passphrase("not it", "new pass", b"salt").await,
            Err(CryptoError::WrongSecret)
        ));

        let change = rx.change_passphrase("old pass", "new pass", b"salt").await.unwrap();
        assert_eq!(change.old_auth_token_hash.len(), 128);
        assert_eq!(change.new_auth_token_hash.len(), 128);
        assert_eq!(change.old_auth_token_hash, generated.auth_token.hash_hex());
        assert_ne!(change.old_auth_token_hash, change.new_auth_token_hash);
        assert!(rx.key_ring().is_unlocked().await);
        assert_eq!(rx.state(), ReceiverState::Unlocked);

        let mut reloaded = Receiver::new(KeyRingHandle::new(), kdf);
        reloaded.initialize(&change.private_key, BOB).await.unwrap();
        assert!(reloaded.derive_and_unlock("old pass", b"salt").await.is_err());
        reloaded.derive_and_unlock("new pass", b"salt").await.unwrap();
        let pub_again = reloaded.key_ring().get_pub_key(BOB).await.unwrap();
        assert_eq!(pub_again.fingerprint(), public.fingerprint());

        // A locked receiver changes its passphrase and comes out unlocked.
        let mut locked = Receiver::new(KeyRingHandle::new(), kdf);
        locked.initialize(&change.private_key, BOB).await.unwrap();
        assert!(matches!(
            locked.change_passphrase("old pass", "third pass", b"salt").await,
            Err(CryptoError::WrongSecret)
        ));
        assert_eq!(locked.state(), ReceiverState::Locked);
        locked.change_passphrase("new pass", "third pass", b"salt").await.unwrap();
        assert_eq!(locked.state(), ReceiverState::Unlocked);
        assert!(locked.key_ring().is_unlocked().await);
    }
}
