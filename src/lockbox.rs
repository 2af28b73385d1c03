//! Encrypted data.
//!
//! There are four kinds of lockbox, one per payload:
//! - [`IdentityLockbox`]: an exported [`IdentityKey`](crate::identity::IdentityKey)
//! - [`LockLockbox`]: an exported [`LockKey`](crate::lock::LockKey)
//! - [`StreamLockbox`]: an exported [`StreamKey`](crate::stream::StreamKey), which is how a
//!   per-message content key travels to each recipient of an envelope
//! - [`DataLockbox`]: arbitrary bytes, such as the body of an envelope
//!
//! Every lockbox names its recipient: either a [`LockId`] (public-key encryption) or a
//! [`StreamId`] (symmetric encryption).
//!
//! # Type byte
//!
//! Bit 0 is set when the recipient is a `StreamId`. Bits 2 and 1 select the payload kind:
//!
//! | Payload           | `LockId` | `StreamId` |
//! | --                | --       | --         |
//! | `IdentityLockbox` | 0        | 1          |
//! | `StreamLockbox`   | 2        | 3          |
//! | `LockLockbox`     | 4        | 5          |
//! | `DataLockbox`     | 6        | 7          |
//!
//! # Format
//!
//! ```text
//! LockId recipient:
//! +---------+------+========+========+=======+============+=====+
//! | Version | Type | LockId | EphKey | Nonce | Ciphertext | Tag |
//! +---------+------+========+========+=======+============+=====+
//!
//! StreamId recipient:
//! +---------+------+==========+=======+============+=====+
//! | Version | Type | StreamId | Nonce | Ciphertext | Tag |
//! +---------+------+==========+=======+============+=====+
//! ```
//!
//! - `LockId` is a version byte and a 32-byte X25519 public key.
//! - `EphKey` is the 32-byte X25519 public key of a one-time key pair.
//! - `StreamId` is a version byte and a 32-byte hash of the symmetric key.
//! - `Nonce` is 24 random bytes.
//! - `Ciphertext` and `Tag` come from XChaCha20-Poly1305. The additional data is every byte before
//!   the nonce.

use crate::{
    lock::{lock_eph_size, lock_id_size, LockId},
    stream::{stream_id_size, StreamId, MAX_STREAM_VERSION, MIN_STREAM_VERSION},
    CryptoError,
};

use std::{convert::TryFrom, fmt};

pub(crate) const V1_LOCKBOX_NONCE_SIZE: usize = 24;
pub(crate) const V1_LOCKBOX_TAG_SIZE: usize = 16;

const RECIPIENT_IS_STREAM: u8 = 0x01;

/// Payload kind and recipient kind of a lockbox, as carried in its type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockboxType {
    Identity(bool),
    Stream(bool),
    Lock(bool),
    Data(bool),
}

impl LockboxType {
    pub fn as_u8(&self) -> u8 {
        let (kind, for_stream) = match *self {
            LockboxType::Identity(s) => (0u8, s),
            LockboxType::Stream(s) => (2, s),
            LockboxType::Lock(s) => (4, s),
            LockboxType::Data(s) => (6, s),
        };
        if for_stream {
            kind | RECIPIENT_IS_STREAM
        } else {
            kind
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, CryptoError> {
        let s = (v & RECIPIENT_IS_STREAM) != 0;
        match v & !RECIPIENT_IS_STREAM {
            0 => Ok(LockboxType::Identity(s)),
            2 => Ok(LockboxType::Stream(s)),
            4 => Ok(LockboxType::Lock(s)),
            6 => Ok(LockboxType::Data(s)),
            _ => Err(CryptoError::BadFormat("Lockbox type field wasn't valid")),
        }
    }

    /// True if the recipient is a `StreamId` rather than a `LockId`.
    pub fn is_for_stream(&self) -> bool {
        match *self {
            LockboxType::Identity(s)
            | LockboxType::Stream(s)
            | LockboxType::Lock(s)
            | LockboxType::Data(s) => s,
        }
    }

    fn same_kind(&self, other: &LockboxType) -> bool {
        (self.as_u8() & !RECIPIENT_IS_STREAM) == (other.as_u8() & !RECIPIENT_IS_STREAM)
    }
}

/// Get expected size of a Lockbox's nonce for a given version. Version *must* be validated before
/// calling this.
pub(crate) fn lockbox_nonce_size(_version: u8) -> usize {
    V1_LOCKBOX_NONCE_SIZE
}

/// Get expected size of a Lockbox's AEAD tag for a given version. Version *must* be validated
/// before calling this.
pub(crate) fn lockbox_tag_size(_version: u8) -> usize {
    V1_LOCKBOX_TAG_SIZE
}

/// Lockboxes can be meant for one of two types of recipients: a LockId (public key), or a
/// StreamId (symmetric key).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockboxRecipient {
    LockId(LockId),
    StreamId(StreamId),
}

/// The slices of a lockbox that go into the AEAD construction.
pub struct LockboxParts<'a> {
    pub eph_pub: Option<&'a [u8]>,
    pub additional: &'a [u8],
    pub nonce: &'a [u8],
    pub ciphertext: &'a [u8],
}

#[derive(Clone, PartialEq, Eq)]
struct Lockbox {
    recipient: LockboxRecipient,
    inner: Vec<u8>,
}

impl Lockbox {
    fn as_parts(&self) -> LockboxParts {
        let version = self.version();
        let nonce_len = lockbox_nonce_size(version);
        let (header_len, eph_len) = match self.recipient {
            LockboxRecipient::LockId(ref id) => {
                let eph_len = lock_eph_size(id.version());
                (2 + lock_id_size(id.version()) + eph_len, eph_len)
            }
            LockboxRecipient::StreamId(_) => (2 + stream_id_size(version), 0),
        };
        // Lengths were checked when the lockbox was decoded or built.
        let (additional, rest) = self.inner.split_at(header_len);
        let (nonce, ciphertext) = rest.split_at(nonce_len);
        let eph_pub = if eph_len > 0 {
            Some(&additional[header_len - eph_len..])
        } else {
            None
        };
        LockboxParts {
            eph_pub,
            additional,
            nonce,
            ciphertext,
        }
    }

    fn version(&self) -> u8 {
        self.inner[0]
    }

    fn decode(raw: &[u8]) -> Result<(Self, LockboxType), CryptoError> {
        let (&version, parse) = raw.split_first().ok_or(CryptoError::BadLength {
            step: "get lockbox version",
            expected: 1,
            actual: 0,
        })?;
        if version < MIN_STREAM_VERSION {
            return Err(CryptoError::OldVersion(version));
        }
        if version > MAX_STREAM_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let (&boxtype, parse) = parse.split_first().ok_or(CryptoError::BadLength {
            step: "get lockbox type",
            expected: 1,
            actual: 0,
        })?;
        let boxtype = LockboxType::from_u8(boxtype)?;
        let nonce_len = lockbox_nonce_size(version);
        let tag_len = lockbox_tag_size(version);

        let recipient = if boxtype.is_for_stream() {
            let id_len = stream_id_size(version);
            let min_len = id_len + nonce_len + tag_len;
            if parse.len() < min_len {
                return Err(CryptoError::BadLength {
                    step: "get lockbox component lengths",
                    expected: min_len,
                    actual: parse.len(),
                });
            }
            let id = StreamId::try_from(&parse[..id_len])?;
            if id.version() != version {
                return Err(CryptoError::BadFormat(
                    "Lockbox version didn't match StreamId version",
                ));
            }
            LockboxRecipient::StreamId(id)
        } else {
            let id_version = *parse.first().ok_or(CryptoError::BadLength {
                step: "get LockId version for lockbox",
                expected: 1,
                actual: 0,
            })?;
            let id_len = lock_id_size(id_version);
            let min_len = id_len + lock_eph_size(id_version) + nonce_len + tag_len;
            if parse.len() < min_len {
                return Err(CryptoError::BadLength {
                    step: "get lockbox component lengths",
                    expected: min_len,
                    actual: parse.len(),
                });
            }
            LockboxRecipient::LockId(LockId::try_from(&parse[..id_len])?)
        };

        Ok((
            Self {
                recipient,
                inner: raw.to_vec(),
            },
            boxtype,
        ))
    }
}

impl fmt::Debug for Lockbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Lockbox")
            .field("version", &self.version())
            .field("recipient", &self.recipient)
            .field("ciphertext_len", &self.as_parts().ciphertext.len())
            .finish()
    }
}

macro_rules! lockbox_kind {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $from_parts:ident, $err:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name(Lockbox);

        impl $name {
            /// Decompose the lockbox into its component parts.
            pub fn as_parts(&self) -> LockboxParts {
                self.0.as_parts()
            }

            /// Get the encryption version.
            pub fn version(&self) -> u8 {
                self.0.version()
            }

            /// Get the target recipient who can decrypt this.
            pub fn recipient(&self) -> &LockboxRecipient {
                &self.0.recipient
            }

            /// The raw bytestream, suitable for serialization.
            pub fn as_bytes(&self) -> &[u8] {
                &self.0.inner
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = CryptoError;

            fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
                let (lockbox, boxtype) = Lockbox::decode(value)?;
                if boxtype.same_kind(&LockboxType::$kind(false)) {
                    Ok(Self(lockbox))
                } else {
                    Err(CryptoError::BadFormat($err))
                }
            }
        }

        /// Wrap freshly encrypted bytes. Only the encrypt functions in this crate call this, and
        /// they must pass a lockbox of the matching kind.
        pub(crate) fn $from_parts(recipient: LockboxRecipient, inner: Vec<u8>) -> $name {
            $name(Lockbox { recipient, inner })
        }
    };
}

lockbox_kind!(
    /// An encrypted `IdentityKey`.
    IdentityLockbox,
    Identity,
    identity_lockbox_from_parts,
    "Didn't find an identity lockbox"
);

lockbox_kind!(
    /// An encrypted `LockKey`.
    LockLockbox,
    Lock,
    lock_lockbox_from_parts,
    "Didn't find a lock lockbox"
);

lockbox_kind!(
    /// An encrypted `StreamKey`.
    StreamLockbox,
    Stream,
    stream_lockbox_from_parts,
    "Didn't find a stream lockbox"
);

lockbox_kind!(
    /// General encrypted data.
    DataLockbox,
    Data,
    data_lockbox_from_parts,
    "Didn't find a data lockbox"
);
