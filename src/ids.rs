// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Position of a link in a sigchain, or of a root in the Merkle tree history.
pub type Seqno = i64;

const KID_VERSION: u8 = 0x01;
const KID_SUFFIX: u8 = 0x0a;
const UID_USER_SUFFIX: u8 = 0x19;

/// Errors raised while decoding identifiers received from the server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid hex for {what}: {value}")]
    InvalidHex { what: &'static str, value: String },
    #[error("invalid length for {what} (expected={expected}, actual={actual})")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("malformed KID {value}: {reason}")]
    MalformedKid { value: String, reason: &'static str },
    #[error("invalid device id {0}")]
    InvalidDeviceId(String),
}

/// Algorithm tag carried in the second byte of a [`Kid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KidType {
    PgpEddsa,
    NaclEddsa,
    NaclDh,
}

impl KidType {
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::PgpEddsa => 0x16,
            Self::NaclEddsa => 0x20,
            Self::NaclDh => 0x21,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x16 => Some(Self::PgpEddsa),
            0x20 => Some(Self::NaclEddsa),
            0x21 => Some(Self::NaclDh),
            _ => None,
        }
    }
}

/// Key identifier: `0x01 ‖ type ‖ body ‖ 0x0a`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kid(Vec<u8>);

impl Kid {
    /// Builds a KID from its algorithm tag and 32-byte body.
    #[must_use]
    pub fn from_parts(kind: KidType, body: &[u8; 32]) -> Self {
        let mut bytes = Vec::with_capacity(35);
        bytes.push(KID_VERSION);
        bytes.push(kind.tag());
        bytes.extend_from_slice(body);
        bytes.push(KID_SUFFIX);
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(value).map_err(|_| IdError::InvalidHex {
            what: "KID",
            value: value.to_string(),
        })?;
        Self::from_bytes(bytes).map_err(|reason| IdError::MalformedKid {
            value: value.to_string(),
            reason,
        })
    }

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, &'static str> {
        if bytes.len() < 3 {
            return Err("too short");
        }
        if bytes[0] != KID_VERSION {
            return Err("unknown version byte");
        }
        if bytes[bytes.len() - 1] != KID_SUFFIX {
            return Err("missing suffix byte");
        }
        Ok(Self(bytes))
    }

    /// Returns the algorithm tag, if it is one this crate understands.
    #[must_use]
    pub fn kind(&self) -> Option<KidType> {
        KidType::from_tag(self.0[1])
    }

    /// Returns the key-specific bytes between the tag and the suffix.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.0[2..self.0.len() - 1]
    }

    /// For NaCl KIDs the body is the public key itself.
    #[must_use]
    pub fn nacl_public_key(&self) -> Option<[u8; 32]> {
        match self.kind() {
            Some(KidType::NaclEddsa | KidType::NaclDh) => self.body().try_into().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({})", self.to_hex())
    }
}

impl FromStr for Kid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Kid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Kid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(de::Error::custom)
    }
}

macro_rules! fixed_hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            #[must_use]
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_hex(value: &str) -> Result<Self, IdError> {
                let bytes = hex::decode(value).map_err(|_| IdError::InvalidHex {
                    what: $what,
                    value: value.to_string(),
                })?;
                let actual = bytes.len();
                let bytes: [u8; $len] =
                    bytes.try_into().map_err(|_| IdError::InvalidLength {
                        what: $what,
                        expected: $len,
                        actual,
                    })?;
                Ok(Self(bytes))
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                Self::from_hex(&value).map_err(de::Error::custom)
            }
        }
    };
}

fixed_hex_id!(
    /// SHA-256 of a link's payload bytes.
    LinkId,
    32,
    "link id"
);

impl LinkId {
    /// Hashes raw payload bytes into the identifier they must carry.
    #[must_use]
    pub fn of_payload(payload: &[u8]) -> Self {
        let digest = Sha256::digest(payload);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }
}

fixed_hex_id!(
    /// SHA-256 of an encoded signature envelope.
    SigId,
    32,
    "sig id"
);

fixed_hex_id!(
    /// User identifier. Users derive theirs from the normalized username.
    Uid,
    16,
    "uid"
);

impl Uid {
    /// Computes the UID bound to `username`.
    #[must_use]
    pub fn from_username(username: &str) -> Self {
        Self::from_hash_of(&normalize_username(username))
    }

    /// Computes the UID over the username exactly as cased.
    #[must_use]
    pub fn from_cased_username(username: &str) -> Self {
        Self::from_hash_of(username)
    }

    fn from_hash_of(value: &str) -> Self {
        let digest = Sha256::digest(value.as_bytes());
        let mut bytes = [0u8; 16];
        bytes[..15].copy_from_slice(&digest[..15]);
        bytes[15] = UID_USER_SUFFIX;
        Self(bytes)
    }

    #[must_use]
    pub fn is_user(&self) -> bool {
        self.0[15] == UID_USER_SUFFIX
    }
}

fixed_hex_id!(
    /// OpenPGP v4 fingerprint.
    PgpFingerprint,
    20,
    "PGP fingerprint"
);

/// Identifier of a provisioned device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(value: &str) -> Result<Self, IdError> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| IdError::InvalidDeviceId(value.to_string()))
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lowercases a username the way the server keys its indexes.
#[must_use]
pub fn normalize_username(username: &str) -> String {
    username.to_lowercase()
}
