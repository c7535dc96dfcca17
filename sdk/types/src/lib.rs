//! Veil shared primitives
//!
//! Addresses, ciphertext handles and encrypted-type tags used by every
//! Veil crate. All of them travel as `0x`-prefixed hex on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing 0x prefix")]
    MissingPrefix,

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("unknown encrypted type tag {0}")]
    UnknownType(u8),
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], ParseError> {
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or(ParseError::MissingPrefix)?;
    let bytes = hex::decode(body).map_err(|e| ParseError::InvalidHex(e.to_string()))?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ParseError::InvalidLength { expected: N, got })
}

macro_rules! hex_newtype {
    ($name:ident, $len:expr) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
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
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// ============================================================================
// Address
// ============================================================================

/// A 20-byte account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

hex_newtype!(Address, 20);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    /// Takes the trailing 20 bytes of a 32-byte digest.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Self(out)
    }
}

// ============================================================================
// Transaction hash
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxHash(pub [u8; 32]);

hex_newtype!(TxHash, 32);

// ============================================================================
// Encrypted types
// ============================================================================

/// Encrypted scalar types a ciphertext handle can refer to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FheType {
    Ebool,
    Euint8,
    Euint16,
    Euint32,
    Euint64,
}

impl FheType {
    /// Plaintext width in bits.
    pub fn bits(self) -> u32 {
        match self {
            FheType::Ebool => 1,
            FheType::Euint8 => 8,
            FheType::Euint16 => 16,
            FheType::Euint32 => 32,
            FheType::Euint64 => 64,
        }
    }

    /// Unsigned type for a scalar width, if the width is supported.
    pub fn from_width(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(FheType::Euint8),
            16 => Some(FheType::Euint16),
            32 => Some(FheType::Euint32),
            64 => Some(FheType::Euint64),
            _ => None,
        }
    }

    /// Largest plaintext the type can hold.
    pub fn max_value(self) -> u64 {
        match self {
            FheType::Euint64 => u64::MAX,
            other => (1u64 << other.bits()) - 1,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            FheType::Ebool => 0,
            FheType::Euint8 => 2,
            FheType::Euint16 => 3,
            FheType::Euint32 => 4,
            FheType::Euint64 => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ParseError> {
        match tag {
            0 => Ok(FheType::Ebool),
            2 => Ok(FheType::Euint8),
            3 => Ok(FheType::Euint16),
            4 => Ok(FheType::Euint32),
            5 => Ok(FheType::Euint64),
            other => Err(ParseError::UnknownType(other)),
        }
    }
}

// ============================================================================
// Ciphertext handle
// ============================================================================

/// Opaque reference to an encrypted value held by the ledger.
///
/// Layout: `digest[0..21] || index (1) || chain_id (8, BE) || type tag (1) || version (1)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(pub [u8; 32]);

hex_newtype!(Handle, 32);

const HANDLE_VERSION: u8 = 0;

impl Handle {
    /// Packs a digest prefix with the handle metadata.
    pub fn compose(digest: &[u8; 32], index: u8, chain_id: u64, fhe_type: FheType) -> Self {
        let mut out = [0u8; 32];
        out[..21].copy_from_slice(&digest[..21]);
        out[21] = index;
        out[22..30].copy_from_slice(&chain_id.to_be_bytes());
        out[30] = fhe_type.tag();
        out[31] = HANDLE_VERSION;
        Self(out)
    }

    /// Position of the value inside the input it was created from.
    pub fn index(&self) -> u8 {
        self.0[21]
    }

    pub fn chain_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[22..30]);
        u64::from_be_bytes(id)
    }

    pub fn fhe_type(&self) -> Result<FheType, ParseError> {
        FheType::from_tag(self.0[30])
    }
}
