//! The key ring: one local key pair, the public keys of known recipients, and the current session
//! key.
//!
//! [`KeyRing`] is plain state with synchronous methods. [`KeyRingHandle`] wraps it in a tokio
//! `RwLock` and is what the workflows share: every mutation takes the write lock, so at most one
//! is in flight and a concurrent reader sees the ring either before or after it, never halfway.
//!
//! The local key pair is either locked or unlocked. Recipients and the session key are kept
//! regardless of that flag.

use crate::{
    identity::Identity,
    keys::{self, KeyPair, PublicKey, SecretKeys},
    kdf::Secret,
    stream::StreamKey,
    CryptoError, CryptoSrc,
};

use rand_core::OsRng;
use tokio::sync::{RwLock, RwLockReadGuard};

use std::{collections::HashMap, fmt, sync::Arc};

/// Recipient id that always refers to the local key pair.
pub const LOCAL_KEY_ALIAS: &str = "private";

/// Per-submission symmetric key.
pub type SessionKey = StreamKey;

struct LocalKey {
    id: String,
    pair: KeyPair,
}

/// Key ring state.
#[derive(Default)]
pub struct KeyRing {
    local: Option<LocalKey>,
    recipients: HashMap<String, PublicKey>,
    session_key: Option<SessionKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.local.is_some()
    }

    /// Id the local key pair was initialized under.
    pub fn local_id(&self) -> Option<&str> {
        self.local.as_ref().map(|l| l.id.as_str())
    }

    /// True if initialized and the local private key is unlocked.
    pub fn is_unlocked(&self) -> bool {
        self.local.as_ref().map_or(false, |l| !l.pair.is_locked())
    }

    /// Set the local identity from an armored, locked private key. Replaces any previous local
    /// identity and drops the session key; recipients are kept.
    pub fn initialize(&mut self, armored_private_key: &str, local_id: &str) -> Result<bool, CryptoError> {
        let pair = KeyPair::from_armored(armored_private_key)?;
        tracing::info!(
            local_id,
            fingerprint = %pair.fingerprint(),
            replaced = self.local.is_some(),
            "key ring initialized"
        );
        self.session_key = None;
        self.local = Some(LocalKey {
            id: local_id.to_owned(),
            pair,
        });
        Ok(true)
    }

    /// Validate and store a recipient's public key. On failure any existing entry for the
    /// recipient stays as it was.
    pub fn add_pub_key(&mut self, recipient_id: &str, armored_public_key: &str) -> Result<PublicKey, CryptoError> {
        let reject = |reason: String| {
            tracing::warn!(recipient = recipient_id, %reason, "public key rejected");
            CryptoError::KeyRingAdd {
                recipient: recipient_id.to_owned(),
                reason,
            }
        };
        if recipient_id.is_empty() {
            return Err(reject("empty recipient id".into()));
        }
        if recipient_id == LOCAL_KEY_ALIAS || Some(recipient_id) == self.local_id() {
            return Err(reject("id is reserved for the local key".into()));
        }
        let key = keys::validate_public_key(armored_public_key)
            .into_result()
            .map_err(|e| reject(e.to_string()))?;
        tracing::debug!(recipient = recipient_id, fingerprint = %key.fingerprint(), "public key added");
        self.recipients.insert(recipient_id.to_owned(), key.clone());
        Ok(key)
    }

    pub fn remove_pub_key(&mut self, recipient_id: &str) -> Option<PublicKey> {
        let removed = self.recipients.remove(recipient_id);
        if removed.is_some() {
            tracing::debug!(recipient = recipient_id, "public key removed");
        }
        removed
    }

    /// Look up a public key. [`LOCAL_KEY_ALIAS`] and the local id give the local public key.
    pub fn get_pub_key(&self, recipient_id: &str) -> Option<&PublicKey> {
        if let Some(local) = &self.local {
            if recipient_id == LOCAL_KEY_ALIAS || recipient_id == local.id {
                return Some(local.pair.public_key());
            }
        }
        self.recipients.get(recipient_id)
    }

    /// Known recipient ids, sorted. The local key is not included.
    pub fn recipients(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.recipients.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Every known signing identity with the id it is known under, the local key first.
    pub fn identities(&self) -> Vec<(String, Identity)> {
        let mut known = Vec::with_capacity(self.recipients.len() + 1);
        if let Some(local) = &self.local {
            known.push((local.id.clone(), local.pair.public_key().identity().clone()));
        }
        let mut recipients: Vec<_> = self
            .recipients
            .iter()
            .map(|(id, key)| (id.clone(), key.identity().clone()))
            .collect();
        recipients.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        known.extend(recipients);
        known
    }

    /// The unlocked secret keys of the local key pair.
    pub fn secret_keys(&self) -> Option<&SecretKeys> {
        self.local.as_ref().and_then(|l| l.pair.secret_keys())
    }

    /// Lock the local key under `secret`. Locking a locked ring does nothing.
    pub fn lock_key_ring<R: CryptoSrc>(&mut self, csprng: &mut R, secret: &Secret) -> Result<(), CryptoError> {
        let local = self.local.as_mut().ok_or(CryptoError::NotInitialized)?;
        if local.pair.is_locked() {
            return Ok(());
        }
        local.pair.lock(csprng, secret)?;
        tracing::info!(local_id = %local.id, "key ring locked");
        Ok(())
    }

    /// Unlock the local key. A wrong secret returns false; an unlocked ring returns true.
    pub fn unlock_key_ring(&mut self, secret: &Secret) -> Result<bool, CryptoError> {
        let local = self.local.as_mut().ok_or(CryptoError::NotInitialized)?;
        if !local.pair.is_locked() {
            return Ok(true);
        }
        let unlocked = local.pair.unlock(secret)?;
        if unlocked {
            tracing::info!(local_id = %local.id, "key ring unlocked");
        } else {
            tracing::debug!(local_id = %local.id, "key ring unlock refused");
        }
        Ok(unlocked)
    }

    /// Re-lock the local key under `new`. `old` must be the secret the key is locked under, or was
    /// last unlocked with; otherwise this fails with [`WrongSecret`](CryptoError::WrongSecret) and
    /// the ring is unchanged. Either way a successful change leaves the ring locked.
    pub fn change_key_passphrase<R: CryptoSrc>(
        &mut self,
        csprng: &mut R,
        old: &Secret,
        new: &Secret,
    ) -> Result<(), CryptoError> {
        let local = self.local.as_mut().ok_or(CryptoError::NotInitialized)?;
        if !local.pair.verify_secret(old)? {
            tracing::warn!(local_id = %local.id, "passphrase change refused");
            return Err(CryptoError::WrongSecret);
        }
        let mut pair = local.pair.clone();
        if !pair.unlock(old)? {
            return Err(CryptoError::WrongSecret);
        }
        pair.lock(csprng, new)?;
        local.pair = pair;
        tracing::info!(local_id = %local.id, "key ring passphrase changed");
        Ok(())
    }

    /// Armored locked private key. Fails while the ring is unlocked.
    pub fn export_priv_key(&self) -> Result<String, CryptoError> {
        let local = self.local.as_ref().ok_or(CryptoError::NotInitialized)?;
        keys::export_private_key(&local.pair)
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    pub fn set_session_key(&mut self, key: SessionKey) {
        tracing::debug!(stream_id = %key.id(), "session key set");
        self.session_key = Some(key);
    }

    pub fn clear_session_key(&mut self) {
        self.session_key = None;
    }

    /// Drop the local key, every recipient and the session key. Secret key material is zeroized
    /// as it is dropped.
    pub fn clear(&mut self) {
        let recipients = self.recipients.len();
        self.local = None;
        self.recipients.clear();
        self.session_key = None;
        tracing::info!(recipients, "key ring cleared");
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("local_id", &self.local_id())
            .field("unlocked", &self.is_unlocked())
            .field("recipients", &self.recipients())
            .field("session_key", &self.session_key.as_ref().map(|k| k.id().to_string()))
            .finish()
    }
}

/// Shared handle to a [`KeyRing`]. Cloning is cheap and every clone sees the same ring.
#[derive(Clone, Debug, Default)]
pub struct KeyRingHandle {
    inner: Arc<RwLock<KeyRing>>,
}

impl KeyRingHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the whole ring, for operations that need several fields consistently.
    pub async fn read(&self) -> RwLockReadGuard<'_, KeyRing> {
        self.inner.read().await
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.is_initialized()
    }

    pub async fn is_unlocked(&self) -> bool {
        self.inner.read().await.is_unlocked()
    }

    pub async fn local_id(&self) -> Option<String> {
        self.inner.read().await.local_id().map(str::to_owned)
    }

    pub async fn initialize(&self, armored_private_key: &str, local_id: &str) -> Result<bool, CryptoError> {
        self.inner.write().await.initialize(armored_private_key, local_id)
    }

    pub async fn add_pub_key(&self, recipient_id: &str, armored_public_key: &str) -> Result<PublicKey, CryptoError> {
        self.inner
            .write()
            .await
            .add_pub_key(recipient_id, armored_public_key)
    }

    pub async fn remove_pub_key(&self, recipient_id: &str) -> Option<PublicKey> {
        self.inner.write().await.remove_pub_key(recipient_id)
    }

    pub async fn get_pub_key(&self, recipient_id: &str) -> Option<PublicKey> {
        self.inner.read().await.get_pub_key(recipient_id).cloned()
    }

    pub async fn recipients(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .recipients()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    pub async fn lock_key_ring(&self, secret: &Secret) -> Result<(), CryptoError> {
        self.inner.write().await.lock_key_ring(&mut OsRng, secret)
    }

    pub async fn unlock_key_ring(&self, secret: &Secret) -> Result<bool, CryptoError> {
        self.inner.write().await.unlock_key_ring(secret)
    }

    pub async fn change_key_passphrase(&self, old: &Secret, new: &Secret) -> Result<(), CryptoError> {
        self.inner
            .write()
            .await
            .change_key_passphrase(&mut OsRng, old, new)
    }

    pub async fn export_priv_key(&self) -> Result<String, CryptoError> {
        self.inner.read().await.export_priv_key()
    }

    pub async fn session_key(&self) -> Option<SessionKey> {
        self.inner.read().await.session_key().cloned()
    }

    pub async fn set_session_key(&self, key: SessionKey) {
        self.inner.write().await.set_session_key(key)
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    struct Fixture {
        private: String,
        public: String,
        secret: Secret,
    }

    fn fixture(secret: &str) -> Fixture {
        let mut csprng = OsRng;
        let secret = Secret::from(secret);
        let pair = keys::generate(&mut csprng, &secret).unwrap();
        Fixture {
            private: keys::export_private_key(&pair).unwrap(),
            public: pair.public_key().to_armored(),
            secret,
        }
    }

    #[test]
    fn initialize_and_lookup() {
        let alice = fixture("alice");
        let bob = fixture("bob");
        let mut ring = KeyRing::new();
        assert!(!ring.is_initialized());
        assert!(ring.get_pub_key(LOCAL_KEY_ALIAS).is_none());

        assert!(ring.initialize(&alice.private, "alice-id").unwrap());
        assert!(ring.is_initialized());
        assert!(!ring.is_unlocked());
        let local = ring.get_pub_key(LOCAL_KEY_ALIAS).unwrap().clone();
        assert_eq!(ring.get_pub_key("alice-id"), Some(&local));
        assert_eq!(local, PublicKey::from_armored(&alice.public).unwrap());

        ring.add_pub_key("bob-id", &bob.public).unwrap();
        assert_eq!(
            ring.get_pub_key("bob-id").unwrap(),
            &PublicKey::from_armored(&bob.public).unwrap()
        );
        assert!(ring.get_pub_key("carol-id").is_none());
        assert_eq!(ring.recipients(), vec!["bob-id"]);
        let known = ring.identities();
        assert_eq!(known.len(), 2);
        assert_eq!(known[0], ("alice-id".to_owned(), local.identity().clone()));
        assert_eq!(known[1].0, "bob-id");
    }

    #[test]
    fn initialize_rejects_garbage() {
        let mut ring = KeyRing::new();
        assert!(matches!(
            ring.initialize("not a key", "id"),
            Err(CryptoError::InvalidKey(_))
        ));
        let bob = fixture("bob");
        assert!(matches!(
            ring.initialize(&bob.public, "id"),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(!ring.is_initialized());
    }

    #[test]
    fn bad_pub_key_leaves_map_unchanged() {
        let bob = fixture("bob");
        let mut ring = KeyRing::new();
        ring.add_pub_key("bob-id", &bob.public).unwrap();
        let before = ring.get_pub_key("bob-id").cloned();

        let err = ring.add_pub_key("bob-id", "-----BEGIN nonsense").unwrap_err();
        assert!(matches!(err, CryptoError::KeyRingAdd { .. }));
        assert!(err.to_string().contains("could not add pubkey to key ring"));
        assert_eq!(ring.get_pub_key("bob-id").cloned(), before);

        assert!(ring.add_pub_key("carol-id", "").is_err());
        assert!(ring.get_pub_key("carol-id").is_none());
        assert!(ring.add_pub_key(LOCAL_KEY_ALIAS, &bob.public).is_err());
        assert_eq!(ring.recipients(), vec!["bob-id"]);
    }

    #[test]
    fn lock_unlock_cycle() {
        let mut csprng = OsRng;
        let alice = fixture("alice");
        let mut ring = KeyRing::new();
        assert!(matches!(
            ring.unlock_key_ring(&alice.secret),
            Err(CryptoError::NotInitialized)
        ));
        ring.initialize(&alice.private, "alice-id").unwrap();

        assert!(!ring.unlock_key_ring(&Secret::from("wrong")).unwrap());
        assert!(!ring.is_unlocked());
        assert!(ring.unlock_key_ring(&alice.secret).unwrap());
        assert!(ring.is_unlocked());
        assert!(ring.secret_keys().is_some());
        // Already unlocked: no check at all.
        assert!(ring.unlock_key_ring(&Secret::from("wrong")).unwrap());

        assert!(matches!(ring.export_priv_key(), Err(CryptoError::ExportWhileUnlocked)));
        ring.lock_key_ring(&mut csprng, &alice.secret).unwrap();
        assert!(!ring.is_unlocked());
        let exported = ring.export_priv_key().unwrap();
        // Locking twice is harmless.
        ring.lock_key_ring(&mut csprng, &alice.secret).unwrap();
        assert_eq!(ring.export_priv_key().unwrap(), exported);
    }

    #[test]
    fn change_passphrase() {
        let mut csprng = OsRng;
        let alice = fixture("alice");
        let mut ring = KeyRing::new();
        ring.initialize(&alice.private, "alice-id").unwrap();

        assert!(matches!(
            ring.change_key_passphrase(&mut csprng, &Secret::from("wrong"), &Secret::from("new")),
            Err(CryptoError::WrongSecret)
        ));
        assert_eq!(ring.export_priv_key().unwrap(), alice.private);

        ring.change_key_passphrase(&mut csprng, &alice.secret, &Secret::from("new"))
            .unwrap();
        assert!(!ring.is_unlocked());
        assert!(!ring.unlock_key_ring(&alice.secret).unwrap());
        assert!(ring.unlock_key_ring(&Secret::from("new")).unwrap());
    }

    #[test]
    fn change_passphrase_unlocked_checks_old() {
        let mut csprng = OsRng;
        let alice = fixture("alice");
        let mut ring = KeyRing::new();
        ring.initialize(&alice.private, "alice-id").unwrap();
        assert!(ring.unlock_key_ring(&alice.secret).unwrap());

        assert!(matches!(
            ring.change_key_passphrase(&mut csprng, &Secret::from("made up"), &Secret::from("taken")),
            Err(CryptoError::WrongSecret)
        ));
        // Untouched: still unlocked, and still locks and reopens under the real secret.
        assert!(ring.is_unlocked());
        ring.lock_key_ring(&mut csprng, &alice.secret).unwrap();
        assert!(!ring.unlock_key_ring(&Secret::from("taken")).unwrap());
        assert!(ring.unlock_key_ring(&alice.secret).unwrap());

        ring.change_key_passphrase(&mut csprng, &alice.secret, &Secret::from("new"))
            .unwrap();
        assert!(!ring.is_unlocked());
        assert!(ring.unlock_key_ring(&Secret::from("new")).unwrap());
    }

    #[test]
    fn clear_resets_everything() {
        let mut csprng = OsRng;
        let alice = fixture("alice");
        let bob = fixture("bob");
        let mut ring = KeyRing::new();
        ring.initialize(&alice.private, "alice-id").unwrap();
        ring.unlock_key_ring(&alice.secret).unwrap();
        ring.add_pub_key("bob-id", &bob.public).unwrap();
        ring.set_session_key(SessionKey::new_temp(&mut csprng));

        ring.clear();
        assert!(!ring.is_initialized());
        assert!(ring.get_pub_key(LOCAL_KEY_ALIAS).is_none());
        assert!(ring.get_pub_key("bob-id").is_none());
        assert!(ring.session_key().is_none());
        assert!(ring.secret_keys().is_none());
        assert!(ring.recipients().is_empty());
    }

    #[test]
    fn reinitialize_drops_session_key() {
        let mut csprng = OsRng;
        let alice = fixture("alice");
        let bob = fixture("bob");
        let mut ring = KeyRing::new();
        ring.initialize(&alice.private, "alice-id").unwrap();
        ring.add_pub_key("bob-id", &bob.public).unwrap();
        ring.set_session_key(SessionKey::new_temp(&mut csprng));

        ring.initialize(&alice.private, "alice-id").unwrap();
        assert!(ring.session_key().is_none());
        assert_eq!(ring.recipients(), vec!["bob-id"]);
    }

    #[tokio::test]
    async fn handle_serializes_mutations() {
        let alice = fixture("alice");
        let handle = KeyRingHandle::new();
        handle.initialize(&alice.private, "alice-id").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let handle = handle.clone();
            let secret = if i % 2 == 0 {
                alice.secret.clone()
            } else {
                Secret::from("wrong")
            };
            tasks.push(tokio::spawn(async move {
                handle.unlock_key_ring(&secret).await.unwrap();
                handle.is_initialized().await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert!(handle.is_unlocked().await);
        assert!(handle.export_priv_key().await.is_err());
        handle.lock_key_ring(&alice.secret).await.unwrap();
        assert!(handle.export_priv_key().await.is_ok());

        handle.clear().await;
        assert!(!handle.is_initialized().await);
        assert!(handle.get_pub_key(LOCAL_KEY_ALIAS).await.is_none());
        assert!(handle.session_key().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clear_is_atomic_to_readers() {
        let alice = fixture("alice");
        let bob = fixture("bob");
        let handle = KeyRingHandle::new();
        handle.initialize(&alice.private, "alice-id").await.unwrap();
        assert!(handle.unlock_key_ring(&alice.secret).await.unwrap());
        handle.add_pub_key("bob-id", &bob.public).await.unwrap();
        handle.set_session_key(SessionKey::new_temp(&mut OsRng)).await;

        let mut readers = Vec::new();
        for _ in 0..64 {
            let handle = handle.clone();
            readers.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                let ring = handle.read().await;
                let seen = [
                    ring.is_initialized(),
                    ring.is_unlocked(),
                    ring.secret_keys().is_some(),
                    ring.get_pub_key(LOCAL_KEY_ALIAS).is_some(),
                    ring.get_pub_key("bob-id").is_some(),
                    ring.session_key().is_some(),
                    !ring.recipients().is_empty(),
                ];
                seen.iter().all(|s| *s) || seen.iter().all(|s| !*s)
            }));
        }
        let clearer = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.clear().await })
        };

        for reader in readers {
            assert!(reader.await.unwrap(), "reader saw a partially cleared ring");
        }
        clearer.await.unwrap();
        let ring = handle.read().await;
        assert!(!ring.is_initialized());
        assert!(ring.session_key().is_none());
        assert!(ring.recipients().is_empty());
    }
}
