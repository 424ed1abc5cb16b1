// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    MerkleError, MerkleRoot, MerkleTriple, MerkleUserLeaf, NodeHash, PathStep, ResetTail,
    NODE_TYPE_INTERIOR, NODE_TYPE_LEAF,
};
use crate::ids::{normalize_username, Kid, LinkId, SigId, Uid};

/// Descends `path` from `root` towards `key` and returns the leaf value stored there.
///
/// Every node must hash to the value its parent (or the root) names, and every
/// prefix must be a prefix of `key`. An intact path that ends without a leaf for
/// `key` is [`MerkleError::LeafNotFound`].
pub fn verify_path(path: &[PathStep], root: &NodeHash, key: &str) -> Result<Value, MerkleError> {
    let mut expected = *root;
    let mut leaf = None;
    for (level, step) in path.iter().enumerate() {
        if !expected.check(&step.node) {
            return Err(MerkleError::PathHashMismatch { level });
        }
        let node: Value =
            serde_json::from_str(&step.node).map_err(|error| MerkleError::MalformedNode {
                level,
                message: error.to_string(),
            })?;
        let prefix = step.prefix.as_str();
        if prefix.len() > key.len() || !key.starts_with(prefix) {
            return Err(MerkleError::PathPrefixMismatch { level });
        }
        let malformed = |message: &str| MerkleError::MalformedNode {
            level,
            message: message.to_string(),
        };
        let tab = node.get("tab").ok_or_else(|| malformed("node has no tab"))?;
        match node.get("type").and_then(Value::as_i64) {
            Some(NODE_TYPE_INTERIOR) => {
                if prefix.is_empty() {
                    return Err(malformed("empty prefix at an interior node"));
                }
                let child = tab
                    .get(prefix)
                    .and_then(Value::as_str)
                    .ok_or_else(|| MerkleError::LeafNotFound {
                        key: key.to_string(),
                    })?;
                expected = NodeHash::from_hex(child).map_err(|_| malformed("bad child hash"))?;
                leaf = None;
            }
            Some(NODE_TYPE_LEAF) => leaf = tab.get(key).cloned(),
            _ => return Err(malformed("unknown node type")),
        }
    }
    leaf.ok_or_else(|| MerkleError::LeafNotFound {
        key: key.to_string(),
    })
}

fn parse_triple(value: &Value) -> Result<Option<MerkleTriple>, MerkleError> {
    let malformed = |message: String| MerkleError::MalformedLeaf(message);
    let items = match value {
        Value::Null => return Ok(None),
        Value::Array(items) => items,
        other => return Err(malformed(format!("triple is not an array: {other}"))),
    };
    match items.len() {
        0 => return Ok(None),
        1 => return Err(malformed("triple with fewer than 2 values".to_string())),
        len if len > 3 => return Err(malformed("triple with more than 3 values".to_string())),
        _ => {}
    }
    let seqno = items[0]
        .as_i64()
        .ok_or_else(|| malformed("triple seqno is not an integer".to_string()))?;
    let link_id = items[1]
        .as_str()
        .ok_or_else(|| malformed("triple link id is not a string".to_string()))
        .and_then(|hex| LinkId::from_hex(hex).map_err(|error| malformed(error.to_string())))?;
    let sig_id = match items.get(2) {
        Some(Value::String(hex)) => {
            Some(SigId::from_hex(hex).map_err(|error| malformed(error.to_string()))?)
        }
        Some(Value::Null) | None => None,
        Some(other) => return Err(malformed(format!("triple sig id is not a string: {other}"))),
    };
    Ok(Some(MerkleTriple {
        seqno,
        link_id,
        sig_id,
    }))
}

fn parse_reset(value: &Value) -> Result<Option<ResetTail>, MerkleError> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => match items.as_slice() {
            [seqno, hash] => Ok(Some(ResetTail {
                seqno: seqno.as_i64().ok_or_else(|| {
                    MerkleError::MalformedLeaf("reset seqno is not an integer".to_string())
                })?,
                hash: hash
                    .as_str()
                    .ok_or_else(|| {
                        MerkleError::MalformedLeaf("reset hash is not a string".to_string())
                    })?
                    .to_string(),
            })),
            _ => Err(MerkleError::MalformedLeaf(
                "reset tail must be [seqno, hash]".to_string(),
            )),
        },
        other => Err(MerkleError::MalformedLeaf(format!(
            "reset tail is not an array: {other}"
        ))),
    }
}

/// Parses a user leaf in either the unversioned v1 shape or the v2 shape.
pub fn parse_user_leaf(uid: Uid, value: &Value) -> Result<MerkleUserLeaf, MerkleError> {
    let items = value
        .as_array()
        .filter(|items| items.len() >= 2)
        .ok_or_else(|| MerkleError::MalformedLeaf("expected an array of 2 or more".to_string()))?;
    let mut leaf = MerkleUserLeaf::absent(uid);
    // The earliest leaves carried no version and start with the bare triple.
    if items[1].is_string() {
        leaf.public = parse_triple(value)?;
        return Ok(leaf);
    }
    match items[0].as_i64() {
        Some(1) => leaf.public = parse_triple(value)?,
        Some(2) => {
            leaf.public = parse_triple(&items[1])?;
            if let Some(private) = items.get(2) {
                leaf.private = parse_triple(private)?;
            }
            if let Some(eldest) = items.get(3).filter(|value| !value.is_null()) {
                let eldest = eldest.as_str().ok_or_else(|| {
                    MerkleError::MalformedLeaf("eldest KID is not a string".to_string())
                })?;
                leaf.eldest = Some(
                    Kid::from_hex(eldest)
                        .map_err(|error| MerkleError::MalformedLeaf(error.to_string()))?,
                );
            }
            if let Some(reset) = items.get(4) {
                leaf.reset = parse_reset(reset)?;
            }
        }
        other => {
            return Err(MerkleError::MalformedLeaf(format!(
                "unexpected leaf version {other:?}"
            )))
        }
    }
    Ok(leaf)
}

/// Verifies the path to `uid` and parses its leaf. A user absent from the tree
/// yields an empty leaf.
pub fn verify_user(
    root: &MerkleRoot,
    path: &[PathStep],
    uid: Uid,
) -> Result<MerkleUserLeaf, MerkleError> {
    match verify_path(path, root.root_hash(), &uid.to_hex()) {
        Ok(value) => parse_user_leaf(uid, &value),
        Err(MerkleError::LeafNotFound { .. }) => {
            debug!(%uid, root = root.seqno(), "user not in tree");
            Ok(MerkleUserLeaf::absent(uid))
        }
        Err(error) => Err(error),
    }
}

/// Confirms that `username` belongs to `uid`.
///
/// Tries the direct hash of the normalized name, then of the cased name, then
/// falls back to the legacy UID tree proven by `uid_proof_path`.
pub fn verify_username(
    root: &MerkleRoot,
    uid: Uid,
    username: &str,
    username_cased: Option<&str>,
    uid_proof_path: &[PathStep],
) -> Result<String, MerkleError> {
    if Uid::from_username(username) == uid {
        debug!(username, %uid, "username bound via direct hash");
        return Ok(username.to_string());
    }
    if let Some(cased) = username_cased {
        if cased != username
            && normalize_username(cased) == username
            && Uid::from_cased_username(cased) == uid
        {
            debug!(username = cased, %uid, "username bound via cased hash");
            return Ok(username.to_string());
        }
    }

    let legacy = root.legacy_uid_root().ok_or(MerkleError::NoLegacyUidRoot)?;
    let key = hex::encode(Sha256::digest(normalize_username(username).as_bytes()));
    let mismatch = || MerkleError::UsernameUidMismatch {
        username: username.to_string(),
        uid,
    };
    let leaf = verify_path(uid_proof_path, legacy, &key)?;
    let bound = leaf
        .as_str()
        .and_then(|hex| Uid::from_hex(hex).ok())
        .ok_or_else(mismatch)?;
    if bound != uid {
        return Err(mismatch());
    }
    debug!(username, %uid, "username bound via legacy tree");
    Ok(username.to_string())
}
