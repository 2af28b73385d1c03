//! The source's side of a submission.
//!
//! ```text
//! New --derive_key--> MasterKeyReady --derive_session_key--> SessionKeyReady
//!  |                        ^                                       |
//!  +--initialize, unlock----+                    encrypt_and_sign_answers
//!                           |                                       v
//!                           +----------resume_session---------> Submitted
//! ```
//!
//! A first-time source turns a keycode into a key pair with [`Whistleblower::derive_key`]. A
//! returning source reloads the locked private key from the server with
//! [`store_passphrase`](Whistleblower::store_passphrase),
//! [`initialize`](Whistleblower::initialize) and [`unlock`](Whistleblower::unlock), then gets the
//! session key back with [`resume_session`](Whistleblower::resume_session).

use crate::{
    cipher::{CipherEngine, Decrypted, EncryptedEnvelope},
    kdf::{AuthToken, KeyDerivation, Secret},
    keyring::{KeyRingHandle, SessionKey, LOCAL_KEY_ALIAS},
    keys,
    submission::SubmissionRecord,
    CryptoError,
};

use rand_core::OsRng;

use std::fmt;

/// Key ring id of the whistleblower's own key pair.
pub const WHISTLEBLOWER_ID: &str = "whistleblower";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhistleblowerState {
    New,
    MasterKeyReady,
    SessionKeyReady,
    Submitted,
}

impl WhistleblowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhistleblowerState::New => "New",
            WhistleblowerState::MasterKeyReady => "MasterKeyReady",
            WhistleblowerState::SessionKeyReady => "SessionKeyReady",
            WhistleblowerState::Submitted => "Submitted",
        }
    }
}

impl fmt::Display for WhistleblowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives key creation and submission encryption for one source.
pub struct Whistleblower {
    engine: CipherEngine,
    kdf: KeyDerivation,
    state: WhistleblowerState,
    protection: Option<Secret>,
}

impl Whistleblower {
    pub fn new(ring: KeyRingHandle, kdf: KeyDerivation) -> Self {
        Self {
            engine: CipherEngine::new(ring),
            kdf,
            state: WhistleblowerState::New,
            protection: None,
        }
    }

    pub fn state(&self) -> WhistleblowerState {
        self.state
    }

    pub fn key_ring(&self) -> &KeyRingHandle {
        self.engine.key_ring()
    }

    pub fn engine(&self) -> &CipherEngine {
        &self.engine
    }

    fn require(&self, operation: &'static str, allowed: &[WhistleblowerState]) -> Result<(), CryptoError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CryptoError::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    fn transition(&mut self, to: WhistleblowerState) {
        if self.state != to {
            tracing::info!(from = %self.state, to = %to, "whistleblower state changed");
            self.state = to;
        }
    }

    /// Derive the protection secret from a keycode, create a key pair locked under it, and record
    /// both halves in `record`. The key ring ends up initialized and unlocked. Returns the token
    /// for the authentication service.
    pub async fn derive_key(
        &mut self,
        keycode: impl Into<Secret>,
        salt: &[u8],
        record: &mut SubmissionRecord,
    ) -> Result<AuthToken, CryptoError> {
        self.require("derive_key", &[WhistleblowerState::New])?;
        let material = self.kdf.derive(keycode.into(), salt.to_vec()).await?;
        let protection = material.protection_secret.clone();

        let pair = keys::generate(&mut OsRng, &protection)?;
        let private_key = keys::export_private_key(&pair)?;
        let public_key = pair.public_key().to_armored();

        let ring = self.key_ring();
        ring.initialize(&private_key, WHISTLEBLOWER_ID).await?;
        if !ring.unlock_key_ring(&protection).await? {
            return Err(CryptoError::WrongSecret);
        }

        record.encrypted_private_key = private_key;
        record.public_key = public_key;
        self.protection = Some(protection);
        self.transition(WhistleblowerState::MasterKeyReady);
        Ok(material.auth_token)
    }

    /// Create a session key and seal it to every listed recipient, plus the whistleblower's own
    /// key, storing each sealed copy in `record`. Every recipient must already be in the key ring.
    pub async fn derive_session_key(
        &mut self,
        recipient_ids: &[&str],
        record: &mut SubmissionRecord,
    ) -> Result<(), CryptoError> {
        self.require("derive_session_key", &[WhistleblowerState::MasterKeyReady])?;
        let ring = self.key_ring();

        let mut targets = Vec::with_capacity(recipient_ids.len() + 1);
        for &id in recipient_ids {
            let id = if id == LOCAL_KEY_ALIAS { WHISTLEBLOWER_ID } else { id };
            if targets.iter().any(|(known, _)| known == id) {
                continue;
            }
            let key = ring
                .get_pub_key(id)
                .await
                .ok_or_else(|| CryptoError::UnknownRecipient(id.to_owned()))?;
            targets.push((id.to_owned(), key));
        }
        if !targets.iter().any(|(id, _)| id == WHISTLEBLOWER_ID) {
            let own = ring.get_pub_key(WHISTLEBLOWER_ID).await.ok_or(CryptoError::NotInitialized)?;
            targets.push((WHISTLEBLOWER_ID.to_owned(), own));
        }

        let session = SessionKey::new_temp(&mut OsRng);
        let mut sealed = Vec::with_capacity(targets.len());
        for (id, key) in &targets {
            sealed.push((id, self.engine.seal_session_key(&session, key)?));
        }
        for (id, key) in sealed {
            record.set_session_key(id, key);
        }
        ring.set_session_key(session).await;
        tracing::debug!(recipients = targets.len(), "session key sealed");
        self.transition(WhistleblowerState::SessionKeyReady);
        Ok(())
    }

    /// Encrypt the submission content under the session key. Also used for follow-up messages
    /// once submitted.
    pub async fn encrypt_and_sign_answers(&mut self, answers: &[u8], sign: bool) -> Result<EncryptedEnvelope, CryptoError> {
        self.require(
            "encrypt_and_sign_answers",
            &[WhistleblowerState::SessionKeyReady, WhistleblowerState::Submitted],
        )?;
        let envelope = self.engine.encrypt_for_session(answers, sign).await?;
        self.transition(WhistleblowerState::Submitted);
        Ok(envelope)
    }

    /// Keep the protection secret of a returning source for [`unlock`](Self::unlock).
    pub fn store_passphrase(&mut self, protection: Secret) {
        self.protection = Some(protection);
    }

    /// Load a returning source's locked private key and the recipients' public keys, given as
    /// `(recipient id, armored public key)` pairs.
    pub async fn initialize(
        &mut self,
        armored_private_key: &str,
        recipient_public_keys: &[(&str, &str)],
    ) -> Result<(), CryptoError> {
        self.require("initialize", &[WhistleblowerState::New])?;
        let ring = self.key_ring();
        ring.initialize(armored_private_key, WHISTLEBLOWER_ID).await?;
        for (id, key) in recipient_public_keys {
            ring.add_pub_key(id, key).await?;
        }
        Ok(())
    }

    /// Unlock the loaded private key with the stored protection secret.
    pub async fn unlock(&mut self) -> Result<(), CryptoError> {
        self.require("unlock", &[WhistleblowerState::New])?;
        let protection = self.protection.as_ref().ok_or(CryptoError::InvalidState {
            operation: "unlock",
            state: "no passphrase stored",
        })?;
        if !self.engine.key_ring().unlock_key_ring(protection).await? {
            return Err(CryptoError::WrongSecret);
        }
        self.transition(WhistleblowerState::MasterKeyReady);
        Ok(())
    }

    /// Reload the whistleblower's own copy of the session key from an existing submission.
    pub async fn resume_session(&mut self, record: &SubmissionRecord) -> Result<(), CryptoError> {
        self.require("resume_session", &[WhistleblowerState::MasterKeyReady])?;
        let sealed = record
            .session_key_for(WHISTLEBLOWER_ID)
            .ok_or_else(|| CryptoError::UnknownRecipient(WHISTLEBLOWER_ID.to_owned()))?;
        let session = self.engine.open_session_key(sealed).await?;
        self.key_ring().set_session_key(session).await;
        self.transition(WhistleblowerState::Submitted);
        Ok(())
    }

    /// Open an envelope: the submission itself, or a reply from a receiver.
    pub async fn decrypt(&self, envelope: &EncryptedEnvelope, require_signature: bool) -> Result<Decrypted, CryptoError> {
        self.engine.decrypt_and_verify(envelope, require_signature).await
    }

    /// Forget everything: key ring contents and the stored protection secret.
    pub async fn clear(&mut self) {
        self.key_ring().clear().await;
        self.protection = None;
        self.transition(WhistleblowerState::New);
    }
}

impl fmt::Debug for Whistleblower {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Whistleblower")
            .field("state", &self.state)
            .field("passphrase_stored", &self.protection.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kdf::KdfConfig, keycode::Keycode, SignatureStatus};
    use rand::rngs::OsRng;

    fn cheap_kdf() -> KeyDerivation {
        KeyDerivation::new(KdfConfig {
            work_factor: 8,
            iterations: 1,
            parallelism: 1,
        })
    }

    fn new_whistleblower() -> Whistleblower {
        Whistleblower::new(KeyRingHandle::new(), cheap_kdf())
    }

    #[tokio::test]
    async fn out_of_order_calls_rejected() {
        let mut wb = new_whistleblower();
        let mut record = SubmissionRecord::new();
        assert!(matches!(
            wb.derive_session_key(&[], &mut record).await,
            Err(CryptoError::InvalidState { .. })
        ));
        assert!(matches!(
            wb.encrypt_and_sign_answers(b"answers", true).await,
            Err(CryptoError::InvalidState { .. })
        ));
        assert!(matches!(wb.unlock().await, Err(CryptoError::InvalidState { .. })));
        assert_eq!(wb.state(), WhistleblowerState::New);
    }

    #[tokio::test]
    async fn first_submission() {
        let mut wb = new_whistleblower();
        let mut record = SubmissionRecord::new();
        let keycode = Keycode::generate(&mut OsRng);

        let token = wb.derive_key(&keycode, b"receipt salt", &mut record).await.unwrap();
        assert_eq!(token.hash_hex().len(), 128);
        assert_eq!(wb.state(), WhistleblowerState::MasterKeyReady);
        assert!(keys::validate_private_key(&record.encrypted_private_key).is_valid());
        assert!(keys::validate_public_key(&record.public_key).is_valid());
        assert!(wb.key_ring().is_unlocked().await);
        assert!(matches!(
            wb.derive_key(&keycode, b"receipt salt", &mut record).await,
            Err(CryptoError::InvalidState { .. })
        ));

        assert!(matches!(
            wb.derive_session_key(&["nobody"], &mut record).await,
            Err(CryptoError::UnknownRecipient(_))
        ));
        assert!(record.encrypted_session_keys.is_empty());

        wb.derive_session_key(&[], &mut record).await.unwrap();
        assert_eq!(record.recipient_ids().collect::<Vec<_>>(), vec![WHISTLEBLOWER_ID]);
        assert_eq!(wb.state(), WhistleblowerState::SessionKeyReady);

        let envelope = wb.encrypt_and_sign_answers(b"{\"q\":\"a\"}", true).await.unwrap();
        assert_eq!(wb.state(), WhistleblowerState::Submitted);
        let opened = wb.decrypt(&envelope, true).await.unwrap();
        assert_eq!(opened.data, b"{\"q\":\"a\"}");
        assert!(matches!(opened.signature, SignatureStatus::Verified { .. }));

        // Follow-up messages are still allowed.
        wb.encrypt_and_sign_answers(b"more", false).await.unwrap();
    }

    #[tokio::test]
    async fn returning_source() {
        let kdf = cheap_kdf();
        let keycode: Keycode = "0123456789012345".parse().unwrap();
        let mut record = SubmissionRecord::new();
        let envelope = {
            let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf);
            wb.derive_key(&keycode, b"salt", &mut record).await.unwrap();
            wb.derive_session_key(&[], &mut record).await.unwrap();
            wb.encrypt_and_sign_answers(b"answers", true).await.unwrap()
        };

        let material = kdf.derive(Secret::from(&keycode), b"salt".to_vec()).await.unwrap();
        let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf);
        wb.store_passphrase(material.protection_secret);
        wb.initialize(&record.encrypted_private_key, &[]).await.unwrap();
        wb.unlock().await.unwrap();
        assert_eq!(wb.state(), WhistleblowerState::MasterKeyReady);
        wb.resume_session(&record).await.unwrap();
        assert_eq!(wb.state(), WhistleblowerState::Submitted);

        let opened = wb.decrypt(&envelope, true).await.unwrap();
        assert_eq!(opened.data, b"answers");
    }

    #[tokio::test]
    async fn wrong_passphrase_on_resume() {
        let kdf = cheap_kdf();
        let mut record = SubmissionRecord::new();
        let mut first = Whistleblower::new(KeyRingHandle::new(), kdf);
        first.derive_key("1111222233334444", b"salt", &mut record).await.unwrap();

        let wrong = kdf.derive(Secret::from("9999222233334444"), b"salt".to_vec()).await.unwrap();
        let mut wb = Whistleblower::new(KeyRingHandle::new(), kdf);
        wb.store_passphrase(wrong.protection_secret);
        wb.initialize(&record.encrypted_private_key, &[]).await.unwrap();
        assert!(matches!(wb.unlock().await, Err(CryptoError::WrongSecret)));
        assert_eq!(wb.state(), WhistleblowerState::New);

        wb.clear().await;
        assert!(!wb.key_ring().is_initialized().await);
    }
}
