// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use libp2p_identity::ed25519;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::KeyError;
use crate::ids::{normalize_username, Kid, KidType, PgpFingerprint};

/// Domain of the identity a PGP eldest key must carry.
pub const KEYBASE_EMAIL_DOMAIN: &str = "keybase.io";

/// User id packet on a PGP key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PgpIdentity {
    pub email: String,
    pub ctime: i64,
    /// Zero means the self-signature never expires.
    pub etime: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PgpSubkey {
    pub fingerprint: PgpFingerprint,
    pub ctime: i64,
    pub revoked_at: Option<i64>,
}

/// One published version of a PGP public key.
///
/// The server can hold several versions of the same primary key; each is
/// identified by the hash of its encoding.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PgpKeyBundle {
    fingerprint: PgpFingerprint,
    primary: [u8; 32],
    identities: Vec<PgpIdentity>,
    subkeys: Vec<PgpSubkey>,
    revoked_at: Option<i64>,
}

impl PgpKeyBundle {
    #[must_use]
    pub fn new(fingerprint: PgpFingerprint, primary: &ed25519::PublicKey) -> Self {
        Self {
            fingerprint,
            primary: primary.to_bytes(),
            identities: Vec::new(),
            subkeys: Vec::new(),
            revoked_at: None,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, email: impl Into<String>, ctime: i64, etime: i64) -> Self {
        self.identities.push(PgpIdentity {
            email: email.into(),
            ctime,
            etime,
        });
        self
    }

    #[must_use]
    pub fn with_subkey(mut self, fingerprint: PgpFingerprint, ctime: i64) -> Self {
        self.subkeys.push(PgpSubkey {
            fingerprint,
            ctime,
            revoked_at: None,
        });
        self
    }

    /// Marks a subkey, or the primary when `fingerprint` is the primary's, as revoked.
    #[must_use]
    pub fn with_revocation(mut self, fingerprint: &PgpFingerprint, at: i64) -> Self {
        if *fingerprint == self.fingerprint {
            self.revoked_at = Some(at);
        }
        for subkey in &mut self.subkeys {
            if subkey.fingerprint == *fingerprint {
                subkey.revoked_at = Some(at);
            }
        }
        self
    }

    #[must_use]
    pub fn kid(&self) -> Kid {
        let digest = Sha256::digest(self.primary);
        let mut body = [0u8; 32];
        body.copy_from_slice(&digest);
        Kid::from_parts(KidType::PgpEddsa, &body)
    }

    #[must_use]
    pub fn fingerprint(&self) -> &PgpFingerprint {
        &self.fingerprint
    }

    #[must_use]
    pub fn identities(&self) -> &[PgpIdentity] {
        &self.identities
    }

    #[must_use]
    pub fn subkeys(&self) -> &[PgpSubkey] {
        &self.subkeys
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn primary_key(&self) -> Result<ed25519::PublicKey, KeyError> {
        ed25519::PublicKey::try_from_bytes(&self.primary)
            .map_err(|_| KeyError::InvalidPublicKey { kid: self.kid() })
    }

    /// Returns the `(ctime, etime)` of the identity bound to `username`, if present.
    ///
    /// A zero etime is reported as `None`.
    #[must_use]
    pub fn keybase_identity(&self, username: &str) -> Option<(i64, Option<i64>)> {
        let wanted = format!("{}@{KEYBASE_EMAIL_DOMAIN}", normalize_username(username));
        self.identities
            .iter()
            .find(|identity| identity.email.to_lowercase() == wanted)
            .map(|identity| {
                let etime = (identity.etime > 0).then_some(identity.etime);
                (identity.ctime, etime)
            })
    }

    pub fn encode(&self) -> Result<String, KeyError> {
        serde_cbor::to_vec(self)
            .map(hex::encode)
            .map_err(|error| KeyError::Serialization(error.to_string()))
    }

    /// Decodes a bundle filed under `kid`, rejecting bundles that hash elsewhere.
    pub fn decode(kid: &Kid, bundle: &str) -> Result<Self, KeyError> {
        let decode_err = |message: String| KeyError::BundleDecode {
            kid: kid.clone(),
            message,
        };
        let bytes = hex::decode(bundle).map_err(|error| decode_err(error.to_string()))?;
        let parsed: Self =
            serde_cbor::from_slice(&bytes).map_err(|error| decode_err(error.to_string()))?;
        let found = parsed.kid();
        if found != *kid {
            return Err(KeyError::BundleKidMismatch {
                expected: kid.clone(),
                found,
            });
        }
        Ok(parsed)
    }

    /// Hex SHA-256 of the encoding; pins a specific version.
    pub fn content_hash(&self) -> Result<String, KeyError> {
        let bytes =
            serde_cbor::to_vec(self).map_err(|error| KeyError::Serialization(error.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Combines two versions of the same key, dropping every revocation.
    ///
    /// Identities are matched by email and subkeys by fingerprint; for
    /// duplicates the later self-signature wins.
    #[must_use]
    pub fn merge_permissive(&self, other: &Self) -> Self {
        let mut identities: BTreeMap<String, PgpIdentity> = BTreeMap::new();
        for identity in self.identities.iter().chain(&other.identities) {
            let keep = identities
                .get(&identity.email)
                .map_or(true, |existing| identity.ctime >= existing.ctime);
            if keep {
                identities.insert(identity.email.clone(), identity.clone());
            }
        }
        let mut subkeys: BTreeMap<PgpFingerprint, PgpSubkey> = BTreeMap::new();
        for subkey in self.subkeys.iter().chain(&other.subkeys) {
            let keep = subkeys
                .get(&subkey.fingerprint)
                .map_or(true, |existing| subkey.ctime >= existing.ctime);
            if keep {
                subkeys.insert(
                    subkey.fingerprint,
                    PgpSubkey {
                        revoked_at: None,
                        ..subkey.clone()
                    },
                );
            }
        }
        Self {
            fingerprint: self.fingerprint,
            primary: self.primary,
            identities: identities.into_values().collect(),
            subkeys: subkeys.into_values().collect(),
            revoked_at: None,
        }
    }
}
