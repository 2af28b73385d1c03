//! [`serde`](https://serde.rs/) support.
//!
//! This module is optionally compiled if the `with-serde` feature is enabled (which is the
//! default). Each type is serialized as though it were a variant of one enum, so a reader can tell
//! the types apart without extra framing. Supported types are `Hash`, `Identity`, `LockId`,
//! `StreamId`, `Fingerprint`, `PublicKey`, and `EncryptedEnvelope`.
//!
//! The types all serialize as bytes if the serializer is not marked as human-readable. If
//! human-readable:
//!
//! - `Hash`, `Identity`, `LockId` and `StreamId` are base58 strings.
//! - `Fingerprint` is upper-case hex.
//! - `PublicKey` is its armored text block.
//! - `EncryptedEnvelope` is a base64 string.

/// Name marker used for the library's fictional Enum type
pub const TIP_TYPE_ENUM: &str = "_TipType";
pub const TIP_TYPE_ENUM_HASH_NAME: &str = "Hash";
pub const TIP_TYPE_ENUM_IDENTITY_NAME: &str = "Identity";
pub const TIP_TYPE_ENUM_LOCK_ID_NAME: &str = "LockId";
pub const TIP_TYPE_ENUM_STREAM_ID_NAME: &str = "StreamId";
pub const TIP_TYPE_ENUM_FINGERPRINT_NAME: &str = "Fingerprint";
pub const TIP_TYPE_ENUM_PUBLIC_KEY_NAME: &str = "PublicKey";
pub const TIP_TYPE_ENUM_ENVELOPE_NAME: &str = "EncryptedEnvelope";

pub const TIP_TYPE_ENUM_HASH_INDEX: u64 = 1;
pub const TIP_TYPE_ENUM_IDENTITY_INDEX: u64 = 2;
pub const TIP_TYPE_ENUM_LOCK_ID_INDEX: u64 = 3;
pub const TIP_TYPE_ENUM_STREAM_ID_INDEX: u64 = 4;
pub const TIP_TYPE_ENUM_FINGERPRINT_INDEX: u64 = 5;
pub const TIP_TYPE_ENUM_PUBLIC_KEY_INDEX: u64 = 6;
pub const TIP_TYPE_ENUM_ENVELOPE_INDEX: u64 = 7;

const VARIANTS: &[&str] = &[
    TIP_TYPE_ENUM,
    TIP_TYPE_ENUM_HASH_NAME,
    TIP_TYPE_ENUM_IDENTITY_NAME,
    TIP_TYPE_ENUM_LOCK_ID_NAME,
    TIP_TYPE_ENUM_STREAM_ID_NAME,
    TIP_TYPE_ENUM_FINGERPRINT_NAME,
    TIP_TYPE_ENUM_PUBLIC_KEY_NAME,
    TIP_TYPE_ENUM_ENVELOPE_NAME,
];

use crate::{
    cipher::EncryptedEnvelope,
    hash::Hash,
    identity::Identity,
    keys::{Fingerprint, PublicKey},
    lock::LockId,
    stream::StreamId,
    CryptoError,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{
    de::{Deserialize, Deserializer, EnumAccess, Error, Unexpected, VariantAccess, Visitor},
    ser::{Serialize, Serializer},
};
use serde_bytes::ByteBuf;
use std::{convert::TryFrom, fmt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TipEnum {
    Hash,
    Identity,
    LockId,
    StreamId,
    Fingerprint,
    PublicKey,
    EncryptedEnvelope,
}

impl TipEnum {
    fn as_str(&self) -> &'static str {
        use TipEnum::*;
        match *self {
            Hash => TIP_TYPE_ENUM_HASH_NAME,
            Identity => TIP_TYPE_ENUM_IDENTITY_NAME,
            LockId => TIP_TYPE_ENUM_LOCK_ID_NAME,
            StreamId => TIP_TYPE_ENUM_STREAM_ID_NAME,
            Fingerprint => TIP_TYPE_ENUM_FINGERPRINT_NAME,
            PublicKey => TIP_TYPE_ENUM_PUBLIC_KEY_NAME,
            EncryptedEnvelope => TIP_TYPE_ENUM_ENVELOPE_NAME,
        }
    }

    fn from_name(v: &str) -> Option<Self> {
        Some(match v {
            TIP_TYPE_ENUM_HASH_NAME => TipEnum::Hash,
            TIP_TYPE_ENUM_IDENTITY_NAME => TipEnum::Identity,
            TIP_TYPE_ENUM_LOCK_ID_NAME => TipEnum::LockId,
            TIP_TYPE_ENUM_STREAM_ID_NAME => TipEnum::StreamId,
            TIP_TYPE_ENUM_FINGERPRINT_NAME => TipEnum::Fingerprint,
            TIP_TYPE_ENUM_PUBLIC_KEY_NAME => TipEnum::PublicKey,
            TIP_TYPE_ENUM_ENVELOPE_NAME => TipEnum::EncryptedEnvelope,
            _ => return None,
        })
    }
}

struct TipEnumVisitor;
impl<'de> Visitor<'de> for TipEnumVisitor {
    type Value = TipEnum;
    fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "variant identifier")
    }

    fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
        match v {
            TIP_TYPE_ENUM_HASH_INDEX => Ok(TipEnum::Hash),
            TIP_TYPE_ENUM_IDENTITY_INDEX => Ok(TipEnum::Identity),
            TIP_TYPE_ENUM_LOCK_ID_INDEX => Ok(TipEnum::LockId),
            TIP_TYPE_ENUM_STREAM_ID_INDEX => Ok(TipEnum::StreamId),
            TIP_TYPE_ENUM_FINGERPRINT_INDEX => Ok(TipEnum::Fingerprint),
            TIP_TYPE_ENUM_PUBLIC_KEY_INDEX => Ok(TipEnum::PublicKey),
            TIP_TYPE_ENUM_ENVELOPE_INDEX => Ok(TipEnum::EncryptedEnvelope),
            _ => Err(E::invalid_value(
                Unexpected::Unsigned(v),
                &"variant index 1 <= i <= 7",
            )),
        }
    }

    fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
        TipEnum::from_name(v).ok_or_else(|| E::unknown_variant(v, VARIANTS))
    }

    fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        let v = std::str::from_utf8(v).map_err(|_| {
            let v = String::from_utf8_lossy(v);
            E::unknown_variant(v.as_ref(), VARIANTS)
        })?;
        self.visit_str(v)
    }
}

impl<'de> Deserialize<'de> for TipEnum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_identifier(TipEnumVisitor)
    }
}

fn envelope_from_base64(text: &str) -> Result<EncryptedEnvelope, CryptoError> {
    let raw = STANDARD
        .decode(text)
        .map_err(|_| CryptoError::BadFormat("envelope is not valid base64"))?;
    EncryptedEnvelope::try_from(&raw[..])
}

/// Implements `Serialize` and `Deserialize` for one variant of the fictional enum. `$to_text` and
/// `$from_text` are used for human-readable formats, `$to_bytes` and `TryFrom<&[u8]>` otherwise.
macro_rules! tip_type_serde {
    ($t:ident, $variant:ident, $name:ident, $index:ident, $to_text:expr, $from_text:expr, $to_bytes:expr) => {
        impl Serialize for $t {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                if serializer.is_human_readable() {
                    let value: String = $to_text(self);
                    serializer.serialize_newtype_variant(TIP_TYPE_ENUM, $index as u32, $name, &value)
                } else {
                    let value = ByteBuf::from($to_bytes(self));
                    serializer.serialize_newtype_variant(TIP_TYPE_ENUM, $index as u32, $name, &value)
                }
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct TypeVisitor {
                    is_human_readable: bool,
                }

                impl<'de> Visitor<'de> for TypeVisitor {
                    type Value = $t;

                    fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                        write!(fmt, "{} enum with variant {} (id {})", TIP_TYPE_ENUM, $name, $index)
                    }

                    fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
                    where
                        A: EnumAccess<'de>,
                    {
                        let variant = match data.variant()? {
                            (TipEnum::$variant, variant) => variant,
                            (e, _) => {
                                return Err(A::Error::invalid_type(Unexpected::Other(e.as_str()), &$name))
                            }
                        };
                        if self.is_human_readable {
                            let text: String = variant.newtype_variant()?;
                            $from_text(&text).map_err(|e: CryptoError| A::Error::custom(e.serde_err()))
                        } else {
                            let bytes: ByteBuf = variant.newtype_variant()?;
                            $t::try_from(bytes.as_ref()).map_err(|e| A::Error::custom(e.serde_err()))
                        }
                    }
                }

                let is_human_readable = deserializer.is_human_readable();
                deserializer.deserialize_enum(TIP_TYPE_ENUM, &[$name], TypeVisitor { is_human_readable })
            }
        }
    };
}

tip_type_serde!(
    Hash,
    Hash,
    TIP_TYPE_ENUM_HASH_NAME,
    TIP_TYPE_ENUM_HASH_INDEX,
    Hash::to_base58,
    Hash::from_base58,
    Hash::as_vec
);

tip_type_serde!(
    Identity,
    Identity,
    TIP_TYPE_ENUM_IDENTITY_NAME,
    TIP_TYPE_ENUM_IDENTITY_INDEX,
    Identity::to_base58,
    Identity::from_base58,
    Identity::as_vec
);

tip_type_serde!(
    LockId,
    LockId,
    TIP_TYPE_ENUM_LOCK_ID_NAME,
    TIP_TYPE_ENUM_LOCK_ID_INDEX,
    LockId::to_base58,
    LockId::from_base58,
    LockId::as_vec
);

tip_type_serde!(
    StreamId,
    StreamId,
    TIP_TYPE_ENUM_STREAM_ID_NAME,
    TIP_TYPE_ENUM_STREAM_ID_INDEX,
    StreamId::to_base58,
    StreamId::from_base58,
    StreamId::as_vec
);

tip_type_serde!(
    Fingerprint,
    Fingerprint,
    TIP_TYPE_ENUM_FINGERPRINT_NAME,
    TIP_TYPE_ENUM_FINGERPRINT_INDEX,
    Fingerprint::to_hex,
    Fingerprint::from_hex,
    |f: &Fingerprint| f.as_bytes().to_vec()
);

tip_type_serde!(
    PublicKey,
    PublicKey,
    TIP_TYPE_ENUM_PUBLIC_KEY_NAME,
    TIP_TYPE_ENUM_PUBLIC_KEY_INDEX,
    PublicKey::to_armored,
    PublicKey::from_armored,
    |k: &PublicKey| {
        let mut buf = Vec::new();
        k.encode_vec(&mut buf);
        buf
    }
);

tip_type_serde!(
    EncryptedEnvelope,
    EncryptedEnvelope,
    TIP_TYPE_ENUM_ENVELOPE_NAME,
    TIP_TYPE_ENUM_ENVELOPE_INDEX,
    |e: &EncryptedEnvelope| STANDARD.encode(e.to_vec()),
    envelope_from_base64,
    EncryptedEnvelope::to_vec
);
