// File: testing-framework/src/types.rs
//
// Primitive Types
//
// Addresses, transaction hashes and token amounts shared by every layer of the
// harness. Addresses and hashes render as 0x-prefixed lowercase hex.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Token amount (deposits, locks, balances, allowances)
pub type Amount = u128;

/// Error returned when parsing a hex-encoded address or hash
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexParseError {
    /// Input is not valid hex
    #[error("invalid hex '{0}'")]
    InvalidHex(String),

    /// Input decodes to the wrong number of bytes
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required byte length
        expected: usize,
        /// Decoded byte length
        actual: usize,
    },
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], HexParseError> {
    let trimmed = s.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(stripped).map_err(|_| HexParseError::InvalidHex(s.to_string()))?;
    if bytes.len() != N {
        return Err(HexParseError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

macro_rules! hex_newtype {
    ($name:ident, $len:expr) => {
        impl $name {
            /// Size in bytes
            pub const LEN: usize = $len;

            /// Wrap raw bytes
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// The all-zero value
            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Abbreviated form for log lines (first 4 bytes)
            pub fn short(&self) -> String {
                format!("0x{}", hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = HexParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// 20-byte account or contract address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

hex_newtype!(Address, 20);

impl Address {
    /// Derive an address from public key bytes: last 20 bytes of SHA3-256
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha3_256::digest(public_key);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Self(out)
    }
}

/// 32-byte transaction hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash([u8; 32]);

hex_newtype!(TxHash, 32);

impl TxHash {
    /// SHA3-256 of arbitrary bytes
    pub fn digest(data: &[u8]) -> Self {
        let digest = Sha3_256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }
}

/// Serde helpers for amounts written either as integers or decimal strings
///
/// Large token amounts do not fit every YAML/JSON number representation, so
/// configuration files may quote them: `deposit_a: "1000000000000"`.
pub mod amount_serde {
    use super::Amount;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(u64),
        Str(String),
    }

    /// Serialize as a decimal string
    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize from an integer or a decimal string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Int(v) => Ok(v as Amount),
            Repr::Str(s) => s
                .trim()
                .parse::<Amount>()
                .map_err(|_| de::Error::custom(format!("invalid amount '{}'", s))),
        }
    }
}

/// Serde helpers for optional amounts, same forms as [`amount_serde`]
pub mod opt_amount_serde {
    use super::Amount;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "super::amount_serde")] Amount);

    /// Serialize as a decimal string or null
    pub fn serialize<S: Serializer>(
        value: &Option<Amount>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from an integer, a decimal string or null
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Amount>, D::Error> {
        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
    }
}
