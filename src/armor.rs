//! Armored text blocks.
//!
//! Keys, sealed session keys and envelopes leave this crate as text, so they can travel through
//! form fields and JSON documents. An armored block looks like this:
//!
//! ```text
//! -----BEGIN TIP-CRYPTO PUBLIC KEY-----
//! Version: 1
//!
//! AQEAAAAAZQ7uAAEK3x...
//! =Xq9z
//! -----END TIP-CRYPTO PUBLIC KEY-----
//! ```
//!
//! The body is standard base64 broken into 64-column lines. The `=` line is the base64 encoding of
//! the first three bytes of the BLAKE2b-256 hash of the decoded body. Decoding tolerates CRLF line
//! endings and surrounding whitespace; every other defect is reported as
//! [`CryptoError::BadFormat`].

use crate::{hash::Blake2b256, CryptoError};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use blake2::Digest;

use std::fmt;

/// Armor format version written into every block.
pub const ARMOR_VERSION: u8 = 1;

const LINE_WIDTH: usize = 64;
const BEGIN_PREFIX: &str = "-----BEGIN TIP-CRYPTO ";
const END_PREFIX: &str = "-----END TIP-CRYPTO ";
const DASHES: &str = "-----";

/// What an armored block contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArmorLabel {
    PublicKey,
    PrivateKey,
    SessionKey,
    Message,
}

impl ArmorLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArmorLabel::PublicKey => "PUBLIC KEY",
            ArmorLabel::PrivateKey => "PRIVATE KEY",
            ArmorLabel::SessionKey => "SESSION KEY",
            ArmorLabel::Message => "MESSAGE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "PUBLIC KEY" => Some(ArmorLabel::PublicKey),
            "PRIVATE KEY" => Some(ArmorLabel::PrivateKey),
            "SESSION KEY" => Some(ArmorLabel::SessionKey),
            "MESSAGE" => Some(ArmorLabel::Message),
            _ => None,
        }
    }
}

impl fmt::Display for ArmorLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn checksum(body: &[u8]) -> String {
    let digest = Blake2b256::digest(body);
    STANDARD.encode(&digest[..3])
}

/// Armor a binary body under the given label.
pub fn encode(label: ArmorLabel, body: &[u8]) -> String {
    let b64 = STANDARD.encode(body);
    let mut out = String::with_capacity(b64.len() + b64.len() / LINE_WIDTH + 128);
    out.push_str(BEGIN_PREFIX);
    out.push_str(label.as_str());
    out.push_str(DASHES);
    out.push('\n');
    out.push_str(&format!("Version: {}\n\n", ARMOR_VERSION));
    // base64 output is ASCII, so byte chunks are char boundaries.
    for line in b64.as_bytes().chunks(LINE_WIDTH) {
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        out.push('\n');
    }
    out.push('=');
    out.push_str(&checksum(body));
    out.push('\n');
    out.push_str(END_PREFIX);
    out.push_str(label.as_str());
    out.push_str(DASHES);
    out.push('\n');
    out
}

/// Decode any armored block, returning its label and binary body.
pub fn decode(text: &str) -> Result<(ArmorLabel, Vec<u8>), CryptoError> {
    let mut lines = text.lines().map(str::trim).skip_while(|l| l.is_empty());

    let begin = lines.next().ok_or(CryptoError::BadFormat("Empty armor"))?;
    let label = begin
        .strip_prefix(BEGIN_PREFIX)
        .and_then(|l| l.strip_suffix(DASHES))
        .and_then(ArmorLabel::parse)
        .ok_or(CryptoError::BadFormat("Missing armor BEGIN line"))?;

    let mut version_seen = false;
    loop {
        let line = lines
            .next()
            .ok_or(CryptoError::BadFormat("Armor ended inside the headers"))?;
        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or(CryptoError::BadFormat("Malformed armor header"))?;
        if key.trim() == "Version" {
            if value.trim() != ARMOR_VERSION.to_string() {
                return Err(CryptoError::BadFormat("Unsupported armor version"));
            }
            version_seen = true;
        }
    }
    if !version_seen {
        return Err(CryptoError::BadFormat("Armor has no Version header"));
    }

    let mut b64 = String::new();
    let sum = loop {
        let line = lines
            .next()
            .ok_or(CryptoError::BadFormat("Armor ended before the checksum"))?;
        if let Some(sum) = line.strip_prefix('=') {
            break sum;
        }
        if line.starts_with(DASHES) {
            return Err(CryptoError::BadFormat("Armor has no checksum"));
        }
        b64.push_str(line);
    };

    let end = lines
        .next()
        .ok_or(CryptoError::BadFormat("Missing armor END line"))?;
    let end_label = end
        .strip_prefix(END_PREFIX)
        .and_then(|l| l.strip_suffix(DASHES))
        .and_then(ArmorLabel::parse);
    if end_label != Some(label) {
        return Err(CryptoError::BadFormat("Armor END line doesn't match BEGIN"));
    }
    if lines.any(|l| !l.is_empty()) {
        return Err(CryptoError::BadFormat("Trailing data after armor"));
    }

    let body = STANDARD
        .decode(b64.as_bytes())
        .map_err(|_| CryptoError::BadFormat("Armor body isn't valid base64"))?;
    if body.is_empty() {
        return Err(CryptoError::BadFormat("Armor body is empty"));
    }
    if sum != checksum(&body) {
        return Err(CryptoError::BadFormat("Armor checksum mismatch"));
    }
    Ok((label, body))
}

/// Decode an armored block that must carry the given label.
pub fn decode_as(text: &str, expected: ArmorLabel) -> Result<Vec<u8>, CryptoError> {
    let (label, body) = decode(text)?;
    if label != expected {
        return Err(CryptoError::BadFormat("Armor label isn't the expected one"));
    }
    Ok(body)
}
