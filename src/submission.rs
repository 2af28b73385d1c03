//! The key material a submission carries to the server.

/// A session key sealed to one recipient, as an armored `SESSION KEY` block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncryptedSessionKey {
    pub recipient_id: String,
    pub key: String,
}

/// Fields the whistleblower workflow fills in for the storage service.
///
/// Nothing in here is secret: the private key is locked, and each session key is sealed to its
/// recipient.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubmissionRecord {
    /// Armored private key, locked under the whistleblower's protection secret.
    pub encrypted_private_key: String,
    /// Armored public key of the whistleblower.
    pub public_key: String,
    pub encrypted_session_keys: Vec<EncryptedSessionKey>,
}

impl SubmissionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sealed session key for a recipient, if there is one.
    pub fn session_key_for(&self, recipient_id: &str) -> Option<&str> {
        self.encrypted_session_keys
            .iter()
            .find(|k| k.recipient_id == recipient_id)
            .map(|k| k.key.as_str())
    }

    /// Store a sealed session key, replacing any earlier one for the same recipient.
    pub fn set_session_key(&mut self, recipient_id: &str, key: String) {
        match self
            .encrypted_session_keys
            .iter_mut()
            .find(|k| k.recipient_id == recipient_id)
        {
            Some(entry) => entry.key = key,
            None => self.encrypted_session_keys.push(EncryptedSessionKey {
                recipient_id: recipient_id.to_owned(),
                key,
            }),
        }
    }

    /// Recipient ids with a sealed session key, in insertion order.
    pub fn recipient_ids(&self) -> impl Iterator<Item = &str> {
        self.encrypted_session_keys.iter().map(|k| k.recipient_id.as_str())
    }
}
