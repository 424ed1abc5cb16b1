// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GenericKey, KeyError, PgpKeyBundle};
use crate::ids::{Kid, KidType, PgpFingerprint};

/// A key as the server reports it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerKeyRecord {
    /// KID hex for NaCl keys, encoded bundle for PGP keys.
    pub bundle: String,
    #[serde(default)]
    pub key_algo: u8,
}

/// Raw key material for one user, as served alongside the sigchain.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerKeyFamily {
    #[serde(default)]
    pub all: BTreeMap<Kid, ServerKeyRecord>,
    /// Every historical version of each PGP key, oldest first.
    #[serde(default)]
    pub pgp_versions: BTreeMap<Kid, Vec<String>>,
}

/// All known versions of one PGP key plus their permissive merge.
#[derive(Clone, Debug)]
pub struct PgpKeySet {
    merged: Arc<PgpKeyBundle>,
    versions: BTreeMap<String, Arc<PgpKeyBundle>>,
}

impl PgpKeySet {
    fn new(bundle: PgpKeyBundle) -> Result<Self, KeyError> {
        let hash = bundle.content_hash()?;
        let merged = Arc::new(bundle.merge_permissive(&bundle));
        Ok(Self {
            merged,
            versions: BTreeMap::from([(hash, Arc::new(bundle))]),
        })
    }

    fn add(&mut self, bundle: PgpKeyBundle) -> Result<(), KeyError> {
        let hash = bundle.content_hash()?;
        if self.versions.contains_key(&hash) {
            return Ok(());
        }
        self.merged = Arc::new(self.merged.merge_permissive(&bundle));
        self.versions.insert(hash, Arc::new(bundle));
        Ok(())
    }

    #[must_use]
    pub fn merged(&self) -> &Arc<PgpKeyBundle> {
        &self.merged
    }

    #[must_use]
    pub fn version(&self, hash: &str) -> Option<&Arc<PgpKeyBundle>> {
        self.versions.get(hash)
    }

    pub fn version_hashes(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }
}

/// Every key a user's sigchain may reference, indexed by KID.
#[derive(Clone, Debug, Default)]
pub struct KeyCatalog {
    all_kids: BTreeSet<Kid>,
    single_keys: BTreeMap<Kid, GenericKey>,
    pgp_key_sets: BTreeMap<Kid, PgpKeySet>,
    by_fingerprint: BTreeMap<PgpFingerprint, Kid>,
}

impl KeyCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the server's key listing.
    pub fn from_json(bytes: &[u8]) -> Result<Self, KeyError> {
        let server: ServerKeyFamily = serde_json::from_slice(bytes)
            .map_err(|error| KeyError::Serialization(error.to_string()))?;
        Self::import(&server)
    }

    pub fn import(server: &ServerKeyFamily) -> Result<Self, KeyError> {
        let mut catalog = Self::new();
        for (kid, record) in &server.all {
            match kid.kind() {
                Some(KidType::PgpEddsa) => {
                    catalog.insert(GenericKey::Pgp(Arc::new(PgpKeyBundle::decode(
                        kid,
                        &record.bundle,
                    )?)))?;
                }
                _ => {
                    let key = GenericKey::from_kid(&Kid::from_hex(&record.bundle)?)?;
                    let found = key.kid();
                    if found != *kid {
                        return Err(KeyError::BundleKidMismatch {
                            expected: kid.clone(),
                            found,
                        });
                    }
                    catalog.insert(key)?;
                }
            }
        }
        for (kid, versions) in &server.pgp_versions {
            for bundle in versions {
                catalog.insert_pgp(PgpKeyBundle::decode(kid, bundle)?)?;
            }
        }
        debug!(
            keys = catalog.all_kids.len(),
            pgp = catalog.pgp_key_sets.len(),
            "imported key catalog"
        );
        Ok(catalog)
    }

    /// Adds a key; PGP keys accumulate versions rather than replacing.
    pub fn insert(&mut self, key: GenericKey) -> Result<(), KeyError> {
        match key {
            GenericKey::Pgp(bundle) => self.insert_pgp((*bundle).clone()),
            other => {
                let kid = other.kid();
                self.all_kids.insert(kid.clone());
                self.single_keys.insert(kid, other);
                Ok(())
            }
        }
    }

    fn insert_pgp(&mut self, bundle: PgpKeyBundle) -> Result<(), KeyError> {
        let kid = bundle.kid();
        self.by_fingerprint.insert(*bundle.fingerprint(), kid.clone());
        self.all_kids.insert(kid.clone());
        match self.pgp_key_sets.get_mut(&kid) {
            Some(set) => set.add(bundle),
            None => {
                self.pgp_key_sets.insert(kid, PgpKeySet::new(bundle)?);
                Ok(())
            }
        }
    }

    /// Records a key this client just delegated, before the server echoes it back.
    pub fn local_delegate(&mut self, key: GenericKey) -> Result<(), KeyError> {
        debug!(kid = %key.kid(), "locally delegated key");
        self.insert(key)
    }

    #[must_use]
    pub fn contains(&self, kid: &Kid) -> bool {
        self.all_kids.contains(kid)
    }

    /// Looks a key up; PGP keys resolve to their merged view.
    #[must_use]
    pub fn find_key(&self, kid: &Kid) -> Option<GenericKey> {
        if let Some(key) = self.single_keys.get(kid) {
            return Some(key.clone());
        }
        self.pgp_key_sets
            .get(kid)
            .map(|set| GenericKey::Pgp(Arc::clone(set.merged())))
    }

    /// Looks a key up, honouring a pinned PGP version when one is given.
    pub fn find_key_with_pgp_hash(
        &self,
        kid: &Kid,
        hash: Option<&str>,
    ) -> Result<Option<GenericKey>, KeyError> {
        let (Some(hash), Some(set)) = (hash, self.pgp_key_sets.get(kid)) else {
            return Ok(self.find_key(kid));
        };
        set.version(hash)
            .map(|bundle| Some(GenericKey::Pgp(Arc::clone(bundle))))
            .ok_or_else(|| KeyError::UnknownPgpVersion {
                kid: kid.clone(),
                hash: hash.to_string(),
            })
    }

    #[must_use]
    pub fn kid_for_fingerprint(&self, fingerprint: &PgpFingerprint) -> Option<&Kid> {
        self.by_fingerprint.get(fingerprint)
    }

    #[must_use]
    pub fn pgp_key_set(&self, kid: &Kid) -> Option<&PgpKeySet> {
        self.pgp_key_sets.get(kid)
    }

    pub fn kids(&self) -> impl Iterator<Item = &Kid> {
        self.all_kids.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.all_kids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all_kids.is_empty()
    }
}
