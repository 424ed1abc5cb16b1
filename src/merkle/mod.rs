// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

/// Signed-root verification and directory lookups.
pub mod client;
/// Path descent, user-leaf parsing and username binding.
pub mod path;
/// Historical search for the first root reflecting a chain position.
pub mod search;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::ConfigError;
use crate::error::ErrorCategory;
use crate::ids::{normalize_username, Kid, LinkId, Seqno, SigId, Uid};
use crate::store::StoreError;

pub use client::{DirectoryService, MerkleClient, PathQuery, PathResponse};
pub use path::{verify_path, verify_user, verify_username};
pub use search::find_first_leaf_with_chain_seqno;

/// Node type tag of an interior node.
pub const NODE_TYPE_INTERIOR: i64 = 1;
/// Node type tag of a leaf node.
pub const NODE_TYPE_LEAF: i64 = 2;

/// Errors raised while verifying roots, paths and leaves.
#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("server rolled back the tree: verified {last}, offered {attempted}")]
    Rollback { last: Seqno, attempted: Seqno },
    #[error("root {seqno} carries no valid signature from a trusted tree key")]
    NoValidSigningKey { seqno: Seqno },
    #[error("root {seqno} differs from the root already verified at that seqno")]
    RootConflict { seqno: Seqno },
    #[error("hash mismatch at level {level}")]
    PathHashMismatch { level: usize },
    #[error("path prefix mismatch at level {level}")]
    PathPrefixMismatch { level: usize },
    #[error("no leaf for {key} in the tree")]
    LeafNotFound { key: String },
    #[error("username {username} is not bound to UID {uid}")]
    UsernameUidMismatch { username: String, uid: Uid },
    #[error("cannot load root {requested}; historical lookups start at {first}")]
    AncientSeqno { requested: Seqno, first: Seqno },
    #[error("asked for root {requested}, server returned {returned}")]
    SeqnoMismatch { requested: Seqno, returned: Seqno },
    #[error("no root up to {latest} reflects chain seqno {target}")]
    NotFound { target: Seqno, latest: Seqno },
    #[error("malformed user leaf: {0}")]
    MalformedLeaf(String),
    #[error("malformed root: {0}")]
    MalformedRoot(String),
    #[error("malformed node at level {level}: {message}")]
    MalformedNode { level: usize, message: String },
    #[error("malformed path response: {0}")]
    MalformedResponse(String),
    #[error("root has no legacy UID tree")]
    NoLegacyUidRoot,
    #[error("directory service failed: {0}")]
    Server(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MerkleError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LeafNotFound { .. } | Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AncientSeqno { .. } => ErrorCategory::Configuration,
            Self::Server(_) => ErrorCategory::Environment,
            Self::Store(error) => error.category(),
            Self::Config(error) => error.category(),
            _ => ErrorCategory::Integrity,
        }
    }
}

/// Hash of a serialized tree node. Roots use the long form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeHash {
    Short([u8; 32]),
    Long([u8; 64]),
}

impl NodeHash {
    #[must_use]
    pub fn short_of(node: &str) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(node.as_bytes()));
        Self::Short(out)
    }

    #[must_use]
    pub fn long_of(node: &str) -> Self {
        let mut out = [0u8; 64];
        out.copy_from_slice(&Sha512::digest(node.as_bytes()));
        Self::Long(out)
    }

    /// Whether `node` hashes to this value under the same hash width.
    #[must_use]
    pub fn check(&self, node: &str) -> bool {
        let computed = match self {
            Self::Short(_) => Self::short_of(node),
            Self::Long(_) => Self::long_of(node),
        };
        computed.as_bytes().ct_eq(self.as_bytes()).into()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Short(bytes) => bytes.as_slice(),
            Self::Long(bytes) => bytes.as_slice(),
        }
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn from_hex(value: &str) -> Result<Self, MerkleError> {
        let bytes = hex::decode(value)
            .map_err(|_| MerkleError::MalformedRoot(format!("node hash {value} is not hex")))?;
        match bytes.len() {
            32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok(Self::Short(out))
            }
            64 => {
                let mut out = [0u8; 64];
                out.copy_from_slice(&bytes);
                Ok(Self::Long(out))
            }
            other => Err(MerkleError::MalformedRoot(format!(
                "node hash has {other} bytes"
            ))),
        }
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({})", self.to_hex())
    }
}

impl FromStr for NodeHash {
    type Err = MerkleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(de::Error::custom)
    }
}

/// A chain position as published in the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTriple {
    pub seqno: Seqno,
    pub link_id: LinkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_id: Option<SigId>,
}

/// Where a user's reset chain ended when the leaf was written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetTail {
    pub seqno: Seqno,
    pub hash: String,
}

/// A user's entry in a verified tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleUserLeaf {
    pub uid: Uid,
    pub username: String,
    pub public: Option<MerkleTriple>,
    pub private: Option<MerkleTriple>,
    pub eldest: Option<Kid>,
    pub reset: Option<ResetTail>,
    pub id_version: i64,
}

impl MerkleUserLeaf {
    /// Leaf for a user the tree does not contain.
    #[must_use]
    pub fn absent(uid: Uid) -> Self {
        Self {
            uid,
            username: String::new(),
            public: None,
            private: None,
            eldest: None,
            reset: None,
            id_version: 0,
        }
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.public.is_none()
    }

    #[must_use]
    pub fn public_seqno(&self) -> Seqno {
        self.public.as_ref().map_or(0, |triple| triple.seqno)
    }

    /// Checks the leaf against the user a caller believes it loaded.
    pub fn match_user(&self, uid: &Uid, username: &str) -> Result<(), MerkleError> {
        if self.uid != *uid || normalize_username(&self.username) != normalize_username(username) {
            return Err(MerkleError::UsernameUidMismatch {
                username: username.to_string(),
                uid: *uid,
            });
        }
        Ok(())
    }
}

/// One signature over a root payload, keyed by the signing KID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSig {
    pub sig: String,
}

/// A root exactly as the server ships it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRoot {
    #[serde(default)]
    pub sigs: BTreeMap<String, RootSig>,
    pub payload_json: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RootBody {
    seqno: Seqno,
    root: NodeHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    legacy_uid_root: Option<NodeHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev: Option<NodeHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    txid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RootPayload {
    body: RootBody,
    ctime: i64,
    #[serde(default)]
    tag: String,
}

/// A parsed tree root. Signatures are checked by [`MerkleClient`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ServerRoot", into = "ServerRoot")]
pub struct MerkleRoot {
    sigs: BTreeMap<String, RootSig>,
    payload_json: String,
    payload: RootPayload,
}

impl TryFrom<ServerRoot> for MerkleRoot {
    type Error = MerkleError;

    fn try_from(server: ServerRoot) -> Result<Self, Self::Error> {
        let payload: RootPayload = serde_json::from_str(&server.payload_json)
            .map_err(|error| MerkleError::MalformedRoot(error.to_string()))?;
        if payload.body.seqno < 0 {
            return Err(MerkleError::MalformedRoot(format!(
                "negative seqno {}",
                payload.body.seqno
            )));
        }
        if !matches!(payload.body.root, NodeHash::Long(_)) {
            return Err(MerkleError::MalformedRoot(
                "root hash must be a long node hash".to_string(),
            ));
        }
        Ok(Self {
            sigs: server.sigs,
            payload_json: server.payload_json,
            payload,
        })
    }
}

impl From<MerkleRoot> for ServerRoot {
    fn from(root: MerkleRoot) -> Self {
        Self {
            sigs: root.sigs,
            payload_json: root.payload_json,
        }
    }
}

impl MerkleRoot {
    pub fn from_json(bytes: &[u8]) -> Result<Self, MerkleError> {
        serde_json::from_slice(bytes).map_err(|error| MerkleError::MalformedRoot(error.to_string()))
    }

    #[must_use]
    pub fn seqno(&self) -> Seqno {
        self.payload.body.seqno
    }

    #[must_use]
    pub fn root_hash(&self) -> &NodeHash {
        &self.payload.body.root
    }

    #[must_use]
    pub fn legacy_uid_root(&self) -> Option<&NodeHash> {
        self.payload.body.legacy_uid_root.as_ref()
    }

    #[must_use]
    pub fn ctime(&self) -> i64 {
        self.payload.ctime
    }

    /// The exact bytes the tree keys sign.
    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload_json.as_bytes()
    }

    /// Identifies the payload for the verified-seqno memo.
    #[must_use]
    pub fn payload_hash(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(self.payload_json.as_bytes()));
        out
    }

    pub fn signatures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sigs
            .iter()
            .map(|(kid, sig)| (kid.as_str(), sig.sig.as_str()))
    }
}

/// One level of a claimed path: the prefix taken at this node and the node itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    #[serde(default)]
    pub prefix: String,
    pub node: String,
}
