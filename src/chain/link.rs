// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::ChainError;
use crate::family::{ComputedKeyFamily, ComputedKeyInfos, Device, KeyFamilyError};
use crate::ids::{normalize_username, Kid, LinkId, PgpFingerprint, Seqno, SigId, Uid};
use crate::keys::{self, KeyError};
use crate::merkle::MerkleTriple;
use crate::store::{DbKey, LocalStore, ObjType, StoreError};

/// A link exactly as the server sends it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerLink {
    pub seqno: Seqno,
    pub payload_hash: LinkId,
    pub sig: String,
    #[serde(default)]
    pub sig_id: Option<SigId>,
    pub kid: Kid,
    pub payload_json: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Payload {
    pub body: Body,
    pub ctime: i64,
    #[serde(default)]
    pub expire_in: i64,
    #[serde(default)]
    pub prev: Option<LinkId>,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Body {
    pub key: KeySection,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sibkey: Option<SibkeySection>,
    #[serde(default)]
    pub subkey: Option<SubkeySection>,
    #[serde(default)]
    pub revoke: Option<RevokeSection>,
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub pgp_update: Option<PgpUpdateSection>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct KeySection {
    pub kid: Kid,
    #[serde(default)]
    pub eldest_kid: Option<Kid>,
    #[serde(default)]
    pub fingerprint: Option<PgpFingerprint>,
    pub uid: Uid,
    pub username: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct SibkeySection {
    pub kid: Kid,
    #[serde(default)]
    pub reverse_sig: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct SubkeySection {
    pub kid: Kid,
    pub parent_kid: Kid,
    #[serde(default)]
    pub reverse_sig: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct RevokeSection {
    #[serde(default)]
    pub sig_id: Option<SigId>,
    #[serde(default)]
    pub sig_ids: Vec<SigId>,
    #[serde(default)]
    pub kid: Option<Kid>,
    #[serde(default)]
    pub kids: Vec<Kid>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PgpUpdateSection {
    pub kid: Kid,
    #[serde(default)]
    pub full_hash: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct StoredLink {
    link: ServerLink,
    hash_verified: bool,
    payload_verified: bool,
    chain_verified: bool,
    sig_verified: bool,
    #[serde(default)]
    cki: Option<ComputedKeyInfos>,
}

/// One signed statement in a sigchain, with its verification state.
///
/// Verification flags only ever go from false to true.
#[derive(Clone, Debug)]
pub struct ChainLink {
    id: LinkId,
    seqno: Seqno,
    sig: String,
    sig_id: SigId,
    server_kid: Kid,
    payload: Vec<u8>,
    unpacked: Payload,
    hash_verified: bool,
    payload_verified: bool,
    chain_verified: bool,
    sig_verified: bool,
    cki: Option<Arc<ComputedKeyInfos>>,
    trusted: bool,
}

impl ChainLink {
    /// Imports a freshly fetched, untrusted link.
    pub fn import(server: ServerLink) -> Result<Self, ChainError> {
        let unpacked: Payload = serde_json::from_str(&server.payload_json).map_err(|error| {
            ChainError::MalformedPayload {
                seqno: server.seqno,
                message: error.to_string(),
            }
        })?;
        if unpacked.seqno != server.seqno {
            return Err(ChainError::MalformedPayload {
                seqno: server.seqno,
                message: format!("payload claims seqno {}", unpacked.seqno),
            });
        }
        let sig_id = keys::signature_id(&server.sig).map_err(|source| {
            ChainError::SignatureInvalid {
                seqno: server.seqno,
                source,
            }
        })?;
        if let Some(declared) = server.sig_id {
            if declared != sig_id {
                return Err(ChainError::SigIdMismatch {
                    seqno: server.seqno,
                    declared: declared.to_hex(),
                    computed: sig_id.to_hex(),
                });
            }
        }
        Ok(Self {
            id: server.payload_hash,
            seqno: server.seqno,
            sig: server.sig,
            sig_id,
            server_kid: server.kid,
            payload: server.payload_json.into_bytes(),
            unpacked,
            hash_verified: false,
            payload_verified: false,
            chain_verified: false,
            sig_verified: false,
            cki: None,
            trusted: false,
        })
    }

    /// Re-exports the link in server form.
    #[must_use]
    pub fn to_server_link(&self) -> ServerLink {
        ServerLink {
            seqno: self.seqno,
            payload_hash: self.id,
            sig: self.sig.clone(),
            sig_id: Some(self.sig_id),
            kid: self.server_kid.clone(),
            payload_json: String::from_utf8_lossy(&self.payload).into_owned(),
        }
    }

    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    #[must_use]
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    #[must_use]
    pub fn prev(&self) -> Option<LinkId> {
        self.unpacked.prev
    }

    #[must_use]
    pub fn sig(&self) -> &str {
        &self.sig
    }

    #[must_use]
    pub fn sig_id(&self) -> SigId {
        self.sig_id
    }

    /// KID of the signing key as named in the payload.
    #[must_use]
    pub fn kid(&self) -> &Kid {
        &self.unpacked.body.key.kid
    }

    /// Eldest KID the link claims, defaulting to its signer.
    #[must_use]
    pub fn eldest_kid(&self) -> &Kid {
        self.unpacked
            .body
            .key
            .eldest_kid
            .as_ref()
            .unwrap_or(&self.unpacked.body.key.kid)
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&PgpFingerprint> {
        self.unpacked.body.key.fingerprint.as_ref()
    }

    #[must_use]
    pub fn uid(&self) -> &Uid {
        &self.unpacked.body.key.uid
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.unpacked.body.key.username
    }

    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.unpacked.body.kind
    }

    #[must_use]
    pub fn is_eldest(&self) -> bool {
        self.type_tag() == "eldest"
    }

    #[must_use]
    pub fn ctime(&self) -> i64 {
        self.unpacked.ctime
    }

    /// `None` when the link never expires.
    #[must_use]
    pub fn etime(&self) -> Option<i64> {
        (self.unpacked.expire_in > 0)
            .then(|| self.unpacked.ctime.checked_add(self.unpacked.expire_in))
            .flatten()
    }

    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn body(&self) -> &Body {
        &self.unpacked.body
    }

    pub(crate) fn payload_value(&self) -> Result<Value, ChainError> {
        serde_json::from_slice(&self.payload).map_err(|error| ChainError::MalformedPayload {
            seqno: self.seqno,
            message: error.to_string(),
        })
    }

    /// Signature ids this link revokes.
    #[must_use]
    pub fn revoked_sig_ids(&self) -> Vec<SigId> {
        self.unpacked
            .body
            .revoke
            .as_ref()
            .map(|revoke| revoke.sig_id.iter().chain(&revoke.sig_ids).copied().collect())
            .unwrap_or_default()
    }

    /// KIDs this link revokes outright.
    #[must_use]
    pub fn revoked_kids(&self) -> Vec<Kid> {
        self.unpacked
            .body
            .revoke
            .as_ref()
            .map(|revoke| revoke.kid.iter().chain(&revoke.kids).cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_revocations(&self) -> bool {
        self.unpacked.body.revoke.as_ref().is_some_and(|revoke| {
            revoke.sig_id.is_some()
                || revoke.kid.is_some()
                || !revoke.sig_ids.is_empty()
                || !revoke.kids.is_empty()
        })
    }

    #[must_use]
    pub fn device(&self) -> Option<&Device> {
        self.unpacked.body.device.as_ref()
    }

    #[must_use]
    pub fn to_merkle_triple(&self) -> MerkleTriple {
        MerkleTriple {
            seqno: self.seqno,
            link_id: self.id,
            sig_id: Some(self.sig_id),
        }
    }

    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    #[must_use]
    pub fn is_hash_verified(&self) -> bool {
        self.hash_verified
    }

    #[must_use]
    pub fn is_payload_verified(&self) -> bool {
        self.payload_verified
    }

    #[must_use]
    pub fn is_chain_verified(&self) -> bool {
        self.chain_verified
    }

    #[must_use]
    pub fn is_sig_verified(&self) -> bool {
        self.sig_verified
    }

    pub(crate) fn mark_chain_verified(&mut self) {
        self.chain_verified = true;
    }

    /// Checks that the link id is the hash of the payload.
    pub fn verify_hash(&mut self) -> Result<(), ChainError> {
        if self.hash_verified {
            return Ok(());
        }
        let computed = LinkId::of_payload(&self.payload);
        if computed != self.id {
            return Err(ChainError::HashMismatch {
                seqno: self.seqno,
                expected: self.id,
                computed,
            });
        }
        self.hash_verified = true;
        Ok(())
    }

    /// Checks that the signature covers exactly the stored payload.
    pub fn verify_payload_signature(&mut self) -> Result<SigId, ChainError> {
        if self.payload_verified {
            return Ok(self.sig_id);
        }
        let sig_id = keys::assert_payload(&self.sig, &self.payload)
            .map_err(|source| self.signature_error(source))?;
        self.payload_verified = true;
        Ok(sig_id)
    }

    /// Hash and payload checks that need no key family.
    pub fn verify_link(&mut self) -> Result<(), ChainError> {
        self.verify_hash()?;
        self.verify_payload_signature().map(|_| ())
    }

    fn signature_error(&self, source: KeyError) -> ChainError {
        match source {
            KeyError::PayloadMismatch => ChainError::PayloadMismatch { seqno: self.seqno },
            source => ChainError::SignatureInvalid {
                seqno: self.seqno,
                source,
            },
        }
    }

    fn check_server_signature_metadata(
        &self,
        ckf: &ComputedKeyFamily,
    ) -> Result<Kid, ChainError> {
        let payload_kid = self.kid();
        if *payload_kid != self.server_kid {
            return Err(ChainError::KeyFamilyMismatch {
                seqno: self.seqno,
                server: self.server_kid.clone(),
                payload: payload_kid.clone(),
            });
        }
        let key = ckf
            .catalog()
            .find_key(payload_kid)
            .ok_or_else(|| KeyFamilyError::NoSuchKey {
                kid: payload_kid.clone(),
            })?;
        if let Some(fingerprint) = self.fingerprint() {
            if key.fingerprint().as_ref() != Some(fingerprint) {
                return Err(ChainError::FingerprintMismatch { seqno: self.seqno });
            }
        }
        Ok(payload_kid.clone())
    }

    /// Verifies the signature with the key that was an active sibkey when the link was made.
    pub fn verify_against_key_family(&mut self, ckf: &ComputedKeyFamily) -> Result<(), ChainError> {
        if self.trusted && self.sig_verified {
            debug!(seqno = self.seqno, "signature already verified in trusted storage");
            return Ok(());
        }
        let kid = self.check_server_signature_metadata(ckf)?;
        let key = ckf.find_active_sibkey_at_time(&kid, self.ctime())?;
        self.verify_link()?;
        key.verify_string(&self.sig, &self.payload)
            .map_err(|source| self.signature_error(source))?;
        debug!(seqno = self.seqno, %kid, "verified link signature");
        Ok(())
    }

    /// Requires the link to belong to `username`/`uid`.
    pub fn check_name_and_id(&self, username: &str, uid: &Uid) -> Result<(), ChainError> {
        if self.uid() != uid {
            return Err(ChainError::IdentityMismatch {
                seqno: self.seqno,
                field: "uid",
            });
        }
        if normalize_username(self.username()) != normalize_username(username) {
            return Err(ChainError::IdentityMismatch {
                seqno: self.seqno,
                field: "username",
            });
        }
        Ok(())
    }

    /// Returns the cached replay result, if this link carries a verified one.
    #[must_use]
    pub fn sig_check_cache(&self) -> Option<Arc<ComputedKeyInfos>> {
        if !self.sig_verified {
            return None;
        }
        self.cki.clone()
    }

    pub fn put_sig_check_cache(&mut self, cki: Arc<ComputedKeyInfos>) {
        debug!(seqno = self.seqno, id = %self.id, "caching replay result on link");
        self.sig_verified = true;
        self.cki = Some(cki);
    }

    fn db_key(id: &LinkId) -> DbKey {
        DbKey::new(ObjType::ChainLink, id.to_hex())
    }

    /// Persists the link with its flags and cached replay result.
    pub fn store(&self, store: &dyn LocalStore) -> Result<(), ChainError> {
        let key = Self::db_key(&self.id);
        let record = StoredLink {
            link: self.to_server_link(),
            hash_verified: self.hash_verified,
            payload_verified: self.payload_verified,
            chain_verified: self.chain_verified,
            sig_verified: self.sig_verified,
            cki: self.cki.as_deref().cloned(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|error| StoreError::Encode {
            key: key.clone(),
            message: error.to_string(),
        })?;
        store.put(&key, &[], &bytes)?;
        Ok(())
    }

    /// Loads a stored link. Flags and cache survive only when `trusted`.
    pub fn load(
        store: &dyn LocalStore,
        id: &LinkId,
        trusted: bool,
    ) -> Result<Option<Self>, ChainError> {
        let Some(bytes) = store.get(&Self::db_key(id))? else {
            return Ok(None);
        };
        let corrupt = |message: String| ChainError::CorruptStoredLink { id: *id, message };
        let record: StoredLink =
            serde_json::from_slice(&bytes).map_err(|error| corrupt(error.to_string()))?;
        if record.link.payload_hash != *id {
            return Err(corrupt(format!(
                "record is filed under {id} but names {}",
                record.link.payload_hash
            )));
        }
        let mut link = Self::import(record.link)?;
        if trusted {
            link.trusted = true;
            link.hash_verified = record.hash_verified;
            link.payload_verified = record.payload_verified;
            link.chain_verified = record.chain_verified;
            link.sig_verified = record.sig_verified;
            link.cki = record.cki.map(Arc::new);
        }
        Ok(Some(link))
    }

    #[cfg(test)]
    pub(crate) fn corrupt_payload_byte(&mut self, index: usize, mask: u8) {
        let index = index % self.payload.len();
        self.payload[index] ^= mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{catalog, ChainBuilder};
    use crate::store::MemoryStore;

    #[test]
    fn fresh_link_verifies_hash_and_payload() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        let sig_id = builder.eldest(&alice);
        let mut link = builder.links().remove(0);
        assert!(!link.is_hash_verified() && !link.is_trusted());
        link.verify_link().expect("verify");
        assert!(link.is_hash_verified() && link.is_payload_verified());
        assert_eq!(link.sig_id(), sig_id);
        assert_eq!(link.eldest_kid(), &alice.kid());
        assert!(link.is_eldest());
        assert_eq!(link.to_merkle_triple().sig_id, Some(sig_id));
    }

    #[test]
    fn flipped_payload_byte_is_a_hash_mismatch() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        let mut link = builder.links().remove(0);
        link.corrupt_payload_byte(10, 0x01);
        assert!(matches!(
            link.verify_hash(),
            Err(ChainError::HashMismatch { seqno: 1, .. })
        ));
        assert!(!link.is_hash_verified());
    }

    #[test]
    fn declared_sig_id_must_match() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        let mut server = builder.server_links().remove(0);
        server.sig_id = Some(SigId::new([0; 32]));
        assert!(matches!(
            ChainLink::import(server),
            Err(ChainError::SigIdMismatch { .. })
        ));
    }

    #[test]
    fn payload_seqno_must_match_server_seqno() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        let mut server = builder.server_links().remove(0);
        server.seqno = 2;
        assert!(matches!(
            ChainLink::import(server),
            Err(ChainError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn server_kid_must_match_payload_kid() {
        let alice = ChainBuilder::signer(1);
        let mallory = ChainBuilder::signer(9);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        let mut server = builder.server_links().remove(0);
        server.kid = mallory.kid();
        let mut link = ChainLink::import(server).expect("import");

        let mut ckf = ComputedKeyFamily::empty(catalog(&[alice.public_key().clone()]));
        ckf.insert_eldest_link(&alice.kid(), "alice", true, 0, None, 1)
            .expect("eldest");
        assert!(matches!(
            link.verify_against_key_family(&ckf),
            Err(ChainError::KeyFamilyMismatch { .. })
        ));
    }

    #[test]
    fn name_and_id_are_checked() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("Alice");
        builder.eldest(&alice);
        let link = builder.links().remove(0);
        link.check_name_and_id("alice", &Uid::from_username("alice"))
            .expect("same user");
        assert!(matches!(
            link.check_name_and_id("bob", &Uid::from_username("alice")),
            Err(ChainError::IdentityMismatch { field: "username", .. })
        ));
        assert!(matches!(
            link.check_name_and_id("alice", &Uid::from_username("bob")),
            Err(ChainError::IdentityMismatch { field: "uid", .. })
        ));
    }

    #[test]
    fn cache_survives_only_trusted_loads() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        let mut link = builder.links().remove(0);
        link.verify_link().expect("verify");
        link.mark_chain_verified();
        assert!(link.sig_check_cache().is_none());
        link.put_sig_check_cache(Arc::new(ComputedKeyInfos::default()));
        assert!(link.sig_check_cache().is_some());

        let store = MemoryStore::new();
        link.store(&store).expect("store");

        let trusted = ChainLink::load(&store, &link.id(), true)
            .expect("load")
            .expect("present");
        assert!(trusted.is_trusted() && trusted.is_chain_verified());
        assert!(trusted.sig_check_cache().is_some());

        let untrusted = ChainLink::load(&store, &link.id(), false)
            .expect("load")
            .expect("present");
        assert!(!untrusted.is_chain_verified() && !untrusted.is_hash_verified());
        assert!(untrusted.sig_check_cache().is_none());

        assert!(ChainLink::load(&store, &LinkId::new([0; 32]), true)
            .expect("load")
            .is_none());
    }

    #[test]
    fn etime_is_none_without_expiry() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        builder.set_expire_in(100);
        builder.track(&alice);
        let links = builder.links();
        assert_eq!(links[0].etime(), None);
        assert_eq!(links[1].etime(), Some(links[1].ctime() + 100));
    }
}
