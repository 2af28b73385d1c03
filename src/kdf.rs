//! Memory-hard derivation of key material from a low-entropy secret.
//!
//! A [`Secret`] (passphrase or [`Keycode`]) and a per-identity salt go through Argon2id once, and
//! the 64-byte result is split with HKDF-SHA256 into two independent outputs:
//!
//! - a 32-byte protection secret, used to lock the private key and never leaving the client, and
//! - a 32-byte [`AuthToken`], handed to the authentication service in place of a password.
//!
//! Derivation is deliberately slow. The async entry points run it on tokio's blocking pool so
//! other work on the caller's executor keeps going. Dropping the returned future does not stop
//! the computation.

use crate::{keycode::Keycode, CryptoError};

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use std::{fmt, time::Instant};

/// Lowest accepted work factor (8 KiB of memory).
pub const MIN_WORK_FACTOR: u8 = 3;
/// Highest accepted work factor (4 GiB of memory).
pub const MAX_WORK_FACTOR: u8 = 22;
/// Shortest output [`KeyDerivation::stretch`] will produce.
pub const MIN_STRETCH_LEN: usize = 4;
/// Longest output [`KeyDerivation::stretch`] will produce.
pub const MAX_STRETCH_LEN: usize = 1024;

const MAX_PARALLELISM: u32 = 16;
const MASTER_LEN: usize = 64;
const OUTPUT_LEN: usize = 32;

const SALT_DOMAIN: &[u8] = b"tip-crypto salt v1";
const PROTECTION_INFO: &[u8] = b"tip-crypto protection v1";
const AUTH_INFO: &[u8] = b"tip-crypto auth v1";

/// Argon2id cost parameters.
///
/// `work_factor` is the base-2 logarithm of the memory cost in KiB, so the default of 16 uses
/// 64 MiB per derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "with-serde", serde(default))]
pub struct KdfConfig {
    pub work_factor: u8,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            work_factor: 16,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfConfig {
    /// Check that the configuration maps onto valid Argon2id parameters.
    pub fn validate(&self) -> Result<(), CryptoError> {
        self.params(MASTER_LEN).map(|_| ())
    }

    fn params(&self, output_len: usize) -> Result<Params, CryptoError> {
        if !(MIN_WORK_FACTOR..=MAX_WORK_FACTOR).contains(&self.work_factor) {
            return Err(CryptoError::Derivation(format!(
                "work factor {} outside {}..={}",
                self.work_factor, MIN_WORK_FACTOR, MAX_WORK_FACTOR
            )));
        }
        if self.iterations == 0 {
            return Err(CryptoError::Derivation("iterations must be at least 1".into()));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(CryptoError::Derivation(format!(
                "parallelism {} outside 1..={}",
                self.parallelism, MAX_PARALLELISM
            )));
        }
        let m_cost = 1u32 << self.work_factor;
        Params::new(m_cost, self.iterations, self.parallelism, Some(output_len))
            .map_err(|e| CryptoError::Derivation(format!("invalid Argon2 parameters: {}", e)))
    }
}

/// A low-entropy secret presented by a person: a passphrase or a keycode.
///
/// The bytes are wiped when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Secret {}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&[u8]> for Secret {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<Keycode> for Secret {
    fn from(value: Keycode) -> Self {
        Self::from(&value)
    }
}

impl From<&Keycode> for Secret {
    fn from(value: &Keycode) -> Self {
        Self(value.as_str().as_bytes().to_vec())
    }
}

/// Token proving knowledge of the secret to the authentication service.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthToken([u8; OUTPUT_LEN]);

impl AuthToken {
    pub fn as_bytes(&self) -> &[u8; OUTPUT_LEN] {
        &self.0
    }

    /// Lowercase hex encoding of the token.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex-encoded SHA-512 of [`to_hex`](Self::to_hex). This is the value submitted to the server,
    /// so the token itself never needs to be stored there.
    pub fn hash_hex(&self) -> String {
        let mut token_hex = self.to_hex();
        let digest = Sha512::digest(token_hex.as_bytes());
        token_hex.zeroize();
        hex::encode(digest)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

impl PartialEq for AuthToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for AuthToken {}

/// The two outputs of a derivation. Never persisted.
#[derive(Clone, Debug)]
pub struct DerivedMaterial {
    /// 32 bytes used to lock and unlock the private key.
    pub protection_secret: Secret,
    /// Given to the authentication service.
    pub auth_token: AuthToken,
}

/// Runs Argon2id with a fixed configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyDerivation {
    config: KdfConfig,
}

impl KeyDerivation {
    pub fn new(config: KdfConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KdfConfig {
        &self.config
    }

    /// Derive the protection secret and authentication token. Blocks the current thread for the
    /// whole derivation.
    pub fn derive_blocking(&self, secret: &Secret, salt: &[u8]) -> Result<DerivedMaterial, CryptoError> {
        let params = self.config.params(MASTER_LEN)?;
        let mut master = argon2id(params, secret, salt)?;

        let hk = Hkdf::<Sha256>::new(None, &master);
        let mut protection = vec![0u8; OUTPUT_LEN];
        let mut auth = [0u8; OUTPUT_LEN];
        let expanded = hk
            .expand(PROTECTION_INFO, &mut protection)
            .and_then(|_| hk.expand(AUTH_INFO, &mut auth));
        master.zeroize();
        if expanded.is_err() {
            protection.zeroize();
            auth.zeroize();
            return Err(CryptoError::Derivation("HKDF expansion failed".into()));
        }

        let material = DerivedMaterial {
            protection_secret: Secret(protection),
            auth_token: AuthToken(auth),
        };
        auth.zeroize();
        Ok(material)
    }

    /// Derive on tokio's blocking pool.
    pub async fn derive(&self, secret: Secret, salt: Vec<u8>) -> Result<DerivedMaterial, CryptoError> {
        let this = *self;
        tokio::task::spawn_blocking(move || this.derive_blocking(&secret, &salt)).await?
    }

    /// Raw Argon2id output of a caller-chosen length, using this derivation's iteration and lane
    /// counts with the given work factor.
    pub fn stretch(
        &self,
        secret: &Secret,
        salt: &[u8],
        work_factor: u8,
        output_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if !(MIN_STRETCH_LEN..=MAX_STRETCH_LEN).contains(&output_len) {
            return Err(CryptoError::Derivation(format!(
                "output length {} outside {}..={}",
                output_len, MIN_STRETCH_LEN, MAX_STRETCH_LEN
            )));
        }
        let config = KdfConfig {
            work_factor,
            ..self.config
        };
        let params = config.params(output_len)?;
        argon2id(params, secret, salt)
    }

    /// [`stretch`](Self::stretch) on tokio's blocking pool.
    pub async fn stretch_async(
        &self,
        secret: Secret,
        salt: Vec<u8>,
        work_factor: u8,
        output_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let this = *self;
        tokio::task::spawn_blocking(move || this.stretch(&secret, &salt, work_factor, output_len))
            .await?
    }
}

fn normalize_salt(salt: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(SALT_DOMAIN)
        .chain_update(salt)
        .finalize()
        .into()
}

fn argon2id(params: Params, secret: &Secret, salt: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::Derivation("secret is empty".into()));
    }
    if salt.is_empty() {
        return Err(CryptoError::Derivation("salt is empty".into()));
    }
    let output_len = params.output_len().unwrap_or(MASTER_LEN);
    let work_factor = params.m_cost().trailing_zeros();
    let start = Instant::now();
    tracing::debug!(work_factor, output_len, "starting key derivation");

    let salt = normalize_salt(salt);
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = vec![0u8; output_len];
    if let Err(e) = argon.hash_password_into(secret.as_bytes(), &salt, &mut out) {
        out.zeroize();
        return Err(CryptoError::Derivation(format!("Argon2id failed: {}", e)));
    }

    tracing::debug!(
        work_factor,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "key derivation finished"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KeyDerivation {
        KeyDerivation::new(KdfConfig {
            work_factor: 8,
            iterations: 1,
            parallelism: 1,
        })
    }

    #[test]
    fn default_config_validates() {
        KdfConfig::default().validate().unwrap();
    }

    #[test]
    fn derive_is_deterministic() {
        let kdf = cheap();
        let secret = Secret::from("correct horse battery staple");
        let a = kdf.derive_blocking(&secret, b"receipt salt").unwrap();
        let b = kdf.derive_blocking(&secret, b"receipt salt").unwrap();
        assert_eq!(a.protection_secret, b.protection_secret);
        assert_eq!(a.auth_token, b.auth_token);
        assert_eq!(a.protection_secret.len(), 32);
    }

    #[test]
    fn outputs_are_independent() {
        let kdf = cheap();
        let m = kdf
            .derive_blocking(&Secret::from("passphrase"), b"salt")
            .unwrap();
        assert_ne!(m.protection_secret.as_bytes(), &m.auth_token.as_bytes()[..]);
    }

    #[test]
    fn inputs_change_outputs() {
        let kdf = cheap();
        let base = kdf.derive_blocking(&Secret::from("passphrase"), b"salt").unwrap();
        let other_salt = kdf.derive_blocking(&Secret::from("passphrase"), b"salt2").unwrap();
        let other_secret = kdf.derive_blocking(&Secret::from("passphrasf"), b"salt").unwrap();
        assert_ne!(base.protection_secret, other_salt.protection_secret);
        assert_ne!(base.auth_token, other_salt.auth_token);
        assert_ne!(base.protection_secret, other_secret.protection_secret);
    }

    #[test]
    fn empty_inputs_rejected() {
        let kdf = cheap();
        assert!(matches!(
            kdf.derive_blocking(&Secret::from(""), b"salt"),
            Err(CryptoError::Derivation(_))
        ));
        assert!(matches!(
            kdf.derive_blocking(&Secret::from("secret"), b""),
            Err(CryptoError::Derivation(_))
        ));
    }

    #[test]
    fn bad_config_rejected() {
        for config in [
            KdfConfig { work_factor: 2, ..KdfConfig::default() },
            KdfConfig { work_factor: 23, ..KdfConfig::default() },
            KdfConfig { iterations: 0, ..KdfConfig::default() },
            KdfConfig { parallelism: 0, ..KdfConfig::default() },
            KdfConfig { parallelism: 17, ..KdfConfig::default() },
        ] {
            assert!(matches!(config.validate(), Err(CryptoError::Derivation(_))));
            assert!(KeyDerivation::new(config)
                .derive_blocking(&Secret::from("secret"), b"salt")
                .is_err());
        }
    }

    #[test]
    fn stretch_deterministic() {
        let kdf = cheap();
        let secret = Secret::from("1234567812345678");
        let a = kdf.stretch(&secret, b"salt", 8, 48).unwrap();
        let b = kdf.stretch(&secret, b"salt", 8, 48).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 48);
        let c = kdf.stretch(&secret, b"salt", 9, 48).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn stretch_bounds() {
        let kdf = cheap();
        let secret = Secret::from("secret");
        assert!(kdf.stretch(&secret, b"salt", 8, 3).is_err());
        assert!(kdf.stretch(&secret, b"salt", 8, 1025).is_err());
        assert!(kdf.stretch(&secret, b"salt", 2, 32).is_err());
        assert!(kdf.stretch(&secret, b"salt", 23, 32).is_err());
        assert_eq!(kdf.stretch(&secret, b"salt", 8, 4).unwrap().len(), 4);
    }

    #[test]
    fn auth_token_hash() {
        let kdf = cheap();
        let m = kdf.derive_blocking(&Secret::from("secret"), b"salt").unwrap();
        let hex = m.auth_token.to_hex();
        assert_eq!(hex.len(), 64);
        let hashed = m.auth_token.hash_hex();
        assert_eq!(hashed.len(), 128);
        assert_eq!(hashed, hex::encode(Sha512::digest(hex.as_bytes())));
    }

    #[test]
    fn secret_debug_redacts() {
        let secret = Secret::from("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(7 bytes)");
    }

    #[tokio::test]
    async fn async_matches_blocking() {
        let kdf = cheap();
        let secret = Secret::from("secret");
        let blocking = kdf.derive_blocking(&secret, b"salt").unwrap();
        let derived = kdf.derive(secret.clone(), b"salt".to_vec()).await.unwrap();
        assert_eq!(blocking.protection_secret, derived.protection_secret);
        let stretched = kdf.stretch_async(secret.clone(), b"salt".to_vec(), 8, 16).await.unwrap();
        assert_eq!(stretched, kdf.stretch(&secret, b"salt", 8, 16).unwrap());
    }
}
