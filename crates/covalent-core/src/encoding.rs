//! Prefixed hex string encoding shared by ids and crypto types.
//!
//! Every encodable value is written as `<prefix><hex>` (for example
//! `hash_9f2c...` or `sealed_01ab...`) and serialized through serde as that
//! string, so the same form appears in JSON changes, sync messages and
//! storage rows.

use crate::error::{CoreError, Result};

/// Strip `prefix` from `s` and hex-decode the remainder.
pub fn decode_prefixed(s: &str, prefix: &str) -> Result<Vec<u8>> {
    let body = s
        .strip_prefix(prefix)
        .ok_or_else(|| CoreError::InvalidEncoding(format!("expected prefix {prefix:?} in {s:?}")))?;
    hex::decode(body).map_err(|e| CoreError::InvalidEncoding(format!("{prefix}: {e}")))
}

/// Implements `FromStr`, `Display`, `Debug` and string serde for a byte newtype.
///
/// Arms:
/// - `(Type, "prefix_", N)` for `Type([u8; N])`
/// - `(Type, "prefix_", N, secret)` same, with a redacted `Debug`
/// - `(Type, "prefix_", vec)` for `Type(Vec<u8>)`
macro_rules! prefixed_hex {
    ($ty:ident, $prefix:literal, $len:literal) => {
        prefixed_hex!(@array $ty, $prefix, $len);
        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let hex = hex::encode(&self.0);
                write!(f, "{}({}{})", stringify!($ty), $prefix, &hex[..hex.len().min(16)])
            }
        }
    };
    ($ty:ident, $prefix:literal, $len:literal, secret) => {
        prefixed_hex!(@array $ty, $prefix, $len);
        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(<redacted>)", stringify!($ty))
            }
        }
    };
    ($ty:ident, $prefix:literal, vec) => {
        impl std::str::FromStr for $ty {
            type Err = $crate::error::CoreError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self($crate::encoding::decode_prefixed(s, $prefix)?))
            }
        }
        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({} bytes)", stringify!($ty), self.0.len())
            }
        }
        prefixed_hex!(@common $ty, $prefix);
    };
    (@array $ty:ident, $prefix:literal, $len:literal) => {
        impl std::str::FromStr for $ty {
            type Err = $crate::error::CoreError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let bytes = $crate::encoding::decode_prefixed(s, $prefix)?;
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    $crate::error::CoreError::InvalidEncoding(format!(
                        "{} must encode {} bytes",
                        $prefix, $len
                    ))
                })?;
                Ok(Self(array))
            }
        }
        prefixed_hex!(@common $ty, $prefix);
    };
    (@common $ty:ident, $prefix:literal) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, hex::encode(&self.0))
            }
        }
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use prefixed_hex;

/// Implements string serde for a type that already has `Display` and `FromStr`.
macro_rules! string_serde {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use string_serde;
