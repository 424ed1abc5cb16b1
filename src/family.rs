// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::ErrorCategory;
use crate::ids::{DeviceId, Kid, Seqno, SigId};
use crate::keys::{GenericKey, KeyCatalog, KeyError};

/// Device type string used by web (deterministic) devices.
pub const DEVICE_TYPE_WEB: &str = "web";

/// Errors raised while computing or querying a key family.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyFamilyError {
    #[error("key {kid} is not in the server key catalog")]
    NoSuchKey { kid: Kid },
    #[error("key {kid} was never delegated in this chain")]
    NotDelegated { kid: Kid },
    #[error("key {kid} has been revoked")]
    KeyRevoked { kid: Kid },
    #[error("key {kid} expired at {etime} (checked at {at})")]
    KeyExpired { kid: Kid, etime: i64, at: i64 },
    #[error("key {kid} is not valid before {ctime} (checked at {at})")]
    KeyNotYetValid { kid: Kid, ctime: i64, at: i64 },
    #[error("key {kid} is a subkey, a sibkey is required")]
    NotSibkey { kid: Kid },
    #[error("eldest key {kid} is not in the server key catalog")]
    NotEldestKey { kid: Kid },
    #[error("eldest key {kid} carries no identity for {username}")]
    EldestIdentity { kid: Kid, username: String },
    #[error("signature {sig_id} did not delegate the key it is filed under")]
    BadRevocation { sig_id: SigId },
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl KeyFamilyError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotDelegated { .. }
            | Self::KeyRevoked { .. }
            | Self::KeyExpired { .. }
            | Self::KeyNotYetValid { .. }
            | Self::NotSibkey { .. } => ErrorCategory::KeyLifecycle,
            Self::Key(error) => error.category(),
            _ => ErrorCategory::Integrity,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    Uncancelled,
    Revoked,
}

/// Role a key plays in its family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyRole {
    None,
    Sibkey,
    Subkey,
}

/// Outcome of asking whether a key may be used at a given time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyActivity {
    Active,
    Revoked,
    Expired,
    NotYetValid,
}

/// Wall-clock time paired with the chain position at which something happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeybaseTime {
    pub unix: i64,
    pub chain: Seqno,
}

/// Replay-derived state of one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedKeyInfo {
    pub status: KeyStatus,
    pub eldest: bool,
    pub sibkey: bool,
    pub ctime: i64,
    /// `None` means the key never expires.
    pub etime: Option<i64>,
    pub parent: Option<Kid>,
    pub subkey: Option<Kid>,
    /// Signature id to the KID that signed the delegation.
    pub delegations: BTreeMap<SigId, Kid>,
    pub delegated_at: Option<KeybaseTime>,
    pub revoked_at: Option<KeybaseTime>,
    pub revoked_by: Option<Kid>,
    /// Pinned PGP version, when the chain names one.
    pub active_pgp_hash: Option<String>,
}

impl ComputedKeyInfo {
    fn new(sibkey: bool, ctime: i64, etime: Option<i64>) -> Self {
        Self {
            status: KeyStatus::Uncancelled,
            eldest: false,
            sibkey,
            ctime,
            etime,
            parent: None,
            subkey: None,
            delegations: BTreeMap::new(),
            delegated_at: None,
            revoked_at: None,
            revoked_by: None,
            active_pgp_hash: None,
        }
    }

    /// Revocation wins over time-based checks.
    #[must_use]
    pub fn activity_at(&self, at: i64) -> KeyActivity {
        if self.status == KeyStatus::Revoked {
            return KeyActivity::Revoked;
        }
        if at < self.ctime {
            return KeyActivity::NotYetValid;
        }
        match self.etime {
            Some(etime) if at > etime => KeyActivity::Expired,
            _ => KeyActivity::Active,
        }
    }
}

/// A provisioned device as declared by the chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: Option<DeviceId>,
    #[serde(default)]
    pub kid: Option<Kid>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
}

impl Device {
    /// Overlays the fields `newer` sets.
    pub fn merge(&mut self, newer: &Device) {
        if newer.kid.is_some() {
            self.kid = newer.kid.clone();
        }
        if newer.kind.is_some() {
            self.kind = newer.kind.clone();
        }
        if newer.name.is_some() {
            self.name = newer.name.clone();
        }
        if newer.status.is_some() {
            self.status = newer.status;
        }
    }

    #[must_use]
    pub fn is_web(&self) -> bool {
        self.kind.as_deref() == Some(DEVICE_TYPE_WEB)
    }
}

/// Everything replay derives about a user's keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedKeyInfos {
    pub infos: BTreeMap<Kid, ComputedKeyInfo>,
    /// Delegation signature id to the delegated KID.
    pub sigs: BTreeMap<SigId, Kid>,
    pub devices: BTreeMap<DeviceId, Device>,
    pub kid_to_device: BTreeMap<Kid, DeviceId>,
    pub web_device_id: Option<DeviceId>,
}

/// Parameters of one key delegation.
#[derive(Clone, Debug)]
pub struct Delegation {
    pub kid: Kid,
    pub signer: Kid,
    pub sig_id: SigId,
    pub role: KeyRole,
    pub parent: Option<Kid>,
    pub ctime: i64,
    pub etime: Option<i64>,
    pub seqno: Seqno,
    pub pgp_hash: Option<String>,
}

/// A key catalog together with the replay state computed over it.
///
/// Both halves are shared snapshots. Mutation clones the key infos first when
/// another reader still holds them, so earlier snapshots never change.
#[derive(Clone, Debug)]
pub struct ComputedKeyFamily {
    catalog: Arc<KeyCatalog>,
    cki: Arc<ComputedKeyInfos>,
}

impl ComputedKeyFamily {
    #[must_use]
    pub fn new(catalog: Arc<KeyCatalog>, cki: Arc<ComputedKeyInfos>) -> Self {
        Self { catalog, cki }
    }

    #[must_use]
    pub fn empty(catalog: Arc<KeyCatalog>) -> Self {
        Self::new(catalog, Arc::new(ComputedKeyInfos::default()))
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<KeyCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn infos(&self) -> &Arc<ComputedKeyInfos> {
        &self.cki
    }

    #[must_use]
    pub fn info(&self, kid: &Kid) -> Option<&ComputedKeyInfo> {
        self.cki.infos.get(kid)
    }

    fn infos_mut(&mut self) -> &mut ComputedKeyInfos {
        Arc::make_mut(&mut self.cki)
    }

    fn require_key(&self, kid: &Kid) -> Result<GenericKey, KeyFamilyError> {
        self.catalog
            .find_key(kid)
            .ok_or_else(|| KeyFamilyError::NoSuchKey { kid: kid.clone() })
    }

    /// Installs the key that signed the first link of a subchain.
    ///
    /// A self-signed eldest link supplies its own times; otherwise the key must
    /// be a PGP key carrying the user's keybase identity, whose times are used.
    pub fn insert_eldest_link(
        &mut self,
        kid: &Kid,
        username: &str,
        self_signed: bool,
        ctime: i64,
        etime: Option<i64>,
        seqno: Seqno,
    ) -> Result<(), KeyFamilyError> {
        let key = self
            .catalog
            .find_key(kid)
            .ok_or_else(|| KeyFamilyError::NotEldestKey { kid: kid.clone() })?;
        let identity = match &key {
            GenericKey::Pgp(bundle) => bundle.keybase_identity(username),
            _ => None,
        };
        let (ctime, etime) = match identity {
            Some(times) => times,
            None if self_signed => (ctime, etime),
            None => {
                return Err(KeyFamilyError::EldestIdentity {
                    kid: kid.clone(),
                    username: username.to_string(),
                })
            }
        };
        self.insert_eldest(kid, ctime, etime, seqno);
        Ok(())
    }

    /// Installs an eldest key the server reports for a user with no links yet.
    pub fn insert_server_eldest_key(
        &mut self,
        kid: &Kid,
        username: &str,
    ) -> Result<(), KeyFamilyError> {
        self.insert_eldest_link(kid, username, false, 0, None, 0)
    }

    /// Installs a key this client just generated as eldest, before any link names it.
    pub fn insert_local_eldest_key(&mut self, kid: &Kid, now: i64) {
        self.insert_eldest(kid, now, None, 0);
    }

    fn insert_eldest(&mut self, kid: &Kid, ctime: i64, etime: Option<i64>, seqno: Seqno) {
        let mut info = ComputedKeyInfo::new(true, ctime, etime);
        info.eldest = true;
        info.delegated_at = Some(KeybaseTime { unix: ctime, chain: seqno });
        debug!(%kid, ctime, "inserted eldest key");
        self.infos_mut().infos.insert(kid.clone(), info);
    }

    /// Records a delegation. A revoked KID stays revoked.
    pub fn delegate(&mut self, delegation: &Delegation) -> Result<(), KeyFamilyError> {
        self.require_key(&delegation.kid)?;
        if let Some(hash) = &delegation.pgp_hash {
            self.catalog
                .find_key_with_pgp_hash(&delegation.kid, Some(hash))?;
        }
        let sibkey = delegation.role == KeyRole::Sibkey;
        let at = KeybaseTime {
            unix: delegation.ctime,
            chain: delegation.seqno,
        };
        let cki = self.infos_mut();
        let info = cki
            .infos
            .entry(delegation.kid.clone())
            .and_modify(|info| {
                if info.status == KeyStatus::Revoked {
                    warn!(kid = %delegation.kid, seqno = delegation.seqno, "ignoring re-delegation of revoked key");
                } else {
                    info.ctime = delegation.ctime;
                    info.etime = delegation.etime;
                }
            })
            .or_insert_with(|| {
                let mut info = ComputedKeyInfo::new(sibkey, delegation.ctime, delegation.etime);
                info.delegated_at = Some(at);
                info
            });
        info.sibkey = sibkey;
        info.delegations
            .insert(delegation.sig_id, delegation.signer.clone());
        if delegation.pgp_hash.is_some() && info.status == KeyStatus::Uncancelled {
            info.active_pgp_hash = delegation.pgp_hash.clone();
        }
        if let Some(parent) = &delegation.parent {
            info.parent = Some(parent.clone());
        }
        cki.sigs.insert(delegation.sig_id, delegation.kid.clone());
        if let Some(parent) = &delegation.parent {
            if let Some(parent_info) = cki.infos.get_mut(parent) {
                parent_info.subkey = Some(delegation.kid.clone());
            }
        }
        debug!(kid = %delegation.kid, signer = %delegation.signer, role = ?delegation.role, "delegated key");
        Ok(())
    }

    /// Pins the PGP version that verifies signatures by `kid` from now on.
    pub fn set_active_pgp_hash(&mut self, kid: &Kid, hash: &str) -> Result<(), KeyFamilyError> {
        self.catalog.find_key_with_pgp_hash(kid, Some(hash))?;
        let Some(info) = self.infos_mut().infos.get_mut(kid) else {
            debug!(%kid, "PGP pin names a key outside the family");
            return Ok(());
        };
        if info.status == KeyStatus::Revoked {
            warn!(%kid, "ignoring PGP pin for revoked key");
            return Ok(());
        }
        info.active_pgp_hash = Some(hash.to_string());
        Ok(())
    }

    /// Revokes the key a signature delegated. Unknown signatures are ignored.
    pub fn revoke_sig(
        &mut self,
        sig_id: &SigId,
        by: &Kid,
        at: KeybaseTime,
    ) -> Result<(), KeyFamilyError> {
        let Some(kid) = self.cki.sigs.get(sig_id).cloned() else {
            debug!(%sig_id, "revocation names an unknown signature");
            return Ok(());
        };
        let delegated = self
            .cki
            .infos
            .get(&kid)
            .is_some_and(|info| info.delegations.contains_key(sig_id));
        if !delegated {
            return Err(KeyFamilyError::BadRevocation { sig_id: *sig_id });
        }
        self.revoke_kid(&kid, by, at);
        Ok(())
    }

    /// Revokes a key outright. Unknown KIDs are ignored.
    pub fn revoke_kid(&mut self, kid: &Kid, by: &Kid, at: KeybaseTime) {
        let Some(info) = self.infos_mut().infos.get_mut(kid) else {
            debug!(%kid, "revocation names an unknown key");
            return;
        };
        if info.status == KeyStatus::Revoked {
            return;
        }
        info.status = KeyStatus::Revoked;
        info.revoked_at = Some(at);
        info.revoked_by = Some(by.clone());
        info.active_pgp_hash = None;
        debug!(%kid, by = %by, seqno = at.chain, "revoked key");
    }

    /// Applies a device declaration, optionally binding it to `kid`.
    pub fn update_devices(&mut self, device: &Device, kid: Option<&Kid>) {
        let Some(id) = device.id else {
            return;
        };
        let cki = self.infos_mut();
        let previous_kid = cki.devices.get(&id).and_then(|existing| existing.kid.clone());
        let merged = cki
            .devices
            .entry(id)
            .and_modify(|existing| existing.merge(device))
            .or_insert_with(|| device.clone());
        if let Some(kid) = kid {
            merged.kid = Some(kid.clone());
        }
        let is_web = merged.is_web();
        let bound = merged.kid.clone();
        if let Some(previous) = previous_kid {
            cki.kid_to_device.remove(&previous);
        }
        if let Some(bound) = bound {
            cki.kid_to_device.insert(bound, id);
        }
        if is_web {
            cki.web_device_id = Some(id);
        }
    }

    /// Adds a just-generated key to the catalog and records its delegation.
    pub fn local_delegate(
        &mut self,
        key: GenericKey,
        delegation: &Delegation,
    ) -> Result<(), KeyFamilyError> {
        Arc::make_mut(&mut self.catalog).local_delegate(key)?;
        self.delegate(delegation)
    }

    /// Typed activity of `kid` at `at`.
    pub fn key_activity_at(&self, kid: &Kid, at: i64) -> Result<KeyActivity, KeyFamilyError> {
        self.info(kid)
            .map(|info| info.activity_at(at))
            .ok_or_else(|| KeyFamilyError::NotDelegated { kid: kid.clone() })
    }

    fn active_info_at(&self, kid: &Kid, at: i64) -> Result<&ComputedKeyInfo, KeyFamilyError> {
        let info = self
            .info(kid)
            .ok_or_else(|| KeyFamilyError::NotDelegated { kid: kid.clone() })?;
        match info.activity_at(at) {
            KeyActivity::Active => Ok(info),
            KeyActivity::Revoked => Err(KeyFamilyError::KeyRevoked { kid: kid.clone() }),
            KeyActivity::NotYetValid => Err(KeyFamilyError::KeyNotYetValid {
                kid: kid.clone(),
                ctime: info.ctime,
                at,
            }),
            KeyActivity::Expired => Err(KeyFamilyError::KeyExpired {
                kid: kid.clone(),
                etime: info.etime.unwrap_or_default(),
                at,
            }),
        }
    }

    fn key_for(&self, kid: &Kid, info: &ComputedKeyInfo) -> Result<GenericKey, KeyFamilyError> {
        self.catalog
            .find_key_with_pgp_hash(kid, info.active_pgp_hash.as_deref())?
            .ok_or_else(|| KeyFamilyError::NoSuchKey { kid: kid.clone() })
    }

    /// Returns the signing key for `kid` if it was an active sibkey at `at`.
    pub fn find_active_sibkey_at_time(
        &self,
        kid: &Kid,
        at: i64,
    ) -> Result<GenericKey, KeyFamilyError> {
        let info = self.active_info_at(kid, at)?;
        if !info.sibkey {
            return Err(KeyFamilyError::NotSibkey { kid: kid.clone() });
        }
        self.key_for(kid, info)
    }

    pub fn find_active_sibkey(
        &self,
        ctx: &Context,
        kid: &Kid,
    ) -> Result<GenericKey, KeyFamilyError> {
        self.find_active_sibkey_at_time(kid, ctx.now())
    }

    /// First active subkey that can encrypt.
    #[must_use]
    pub fn find_active_encryption_subkey(&self, ctx: &Context) -> Option<(Kid, GenericKey)> {
        let now = ctx.now();
        self.cki
            .infos
            .iter()
            .filter(|(_, info)| !info.sibkey && info.activity_at(now) == KeyActivity::Active)
            .filter_map(|(kid, info)| Some((kid.clone(), self.key_for(kid, info).ok()?)))
            .find(|(_, key)| key.can_encrypt())
    }

    #[must_use]
    pub fn key_role_at(&self, kid: &Kid, at: i64) -> KeyRole {
        match self.active_info_at(kid, at) {
            Ok(info) if info.sibkey => KeyRole::Sibkey,
            Ok(_) => KeyRole::Subkey,
            Err(_) => KeyRole::None,
        }
    }

    fn active_keys_at(&self, at: i64, sibkeys: bool) -> Vec<GenericKey> {
        self.cki
            .infos
            .iter()
            .filter(|(_, info)| info.sibkey == sibkeys && info.activity_at(at) == KeyActivity::Active)
            .filter_map(|(kid, info)| self.key_for(kid, info).ok())
            .collect()
    }

    #[must_use]
    pub fn all_active_sibkeys_at(&self, at: i64) -> Vec<GenericKey> {
        self.active_keys_at(at, true)
    }

    #[must_use]
    pub fn all_active_subkeys_at(&self, at: i64) -> Vec<GenericKey> {
        self.active_keys_at(at, false)
    }

    /// Active PGP sibkeys, each resolved to its pinned version when one exists.
    #[must_use]
    pub fn active_pgp_keys_at(&self, at: i64) -> Vec<GenericKey> {
        self.all_active_sibkeys_at(at)
            .into_iter()
            .filter(GenericKey::is_pgp)
            .collect()
    }

    #[must_use]
    pub fn has_active_key_at(&self, at: i64) -> bool {
        self.cki
            .infos
            .values()
            .any(|info| info.activity_at(at) == KeyActivity::Active)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.cki.devices.values()
    }

    #[must_use]
    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.cki.devices.get(id)
    }

    #[must_use]
    pub fn device_for_key(&self, kid: &Kid) -> Option<&Device> {
        self.cki
            .kid_to_device
            .get(kid)
            .and_then(|id| self.cki.devices.get(id))
    }

    #[must_use]
    pub fn web_device(&self) -> Option<&Device> {
        self.cki
            .web_device_id
            .as_ref()
            .and_then(|id| self.cki.devices.get(id))
    }

    /// Active sibkey bound to a device.
    pub fn sibkey_for_device(
        &self,
        id: &DeviceId,
        at: i64,
    ) -> Result<Option<GenericKey>, KeyFamilyError> {
        let Some(kid) = self.device(id).and_then(|device| device.kid.as_ref()) else {
            return Ok(None);
        };
        self.find_active_sibkey_at_time(kid, at).map(Some)
    }

    /// Active encryption subkey hanging off a device's sibkey.
    pub fn encryption_subkey_for_device(
        &self,
        id: &DeviceId,
        at: i64,
    ) -> Result<Option<GenericKey>, KeyFamilyError> {
        let Some(sibkey) = self.device(id).and_then(|device| device.kid.as_ref()) else {
            return Ok(None);
        };
        let Some(subkey) = self.info(sibkey).and_then(|info| info.subkey.as_ref()) else {
            return Ok(None);
        };
        let info = self.active_info_at(subkey, at)?;
        let key = self.key_for(subkey, info)?;
        Ok(key.can_encrypt().then_some(key))
    }

    /// The device's sibkey and its subkey, where active.
    #[must_use]
    pub fn all_active_keys_for_device(&self, id: &DeviceId, at: i64) -> Vec<Kid> {
        let Some(sibkey) = self.device(id).and_then(|device| device.kid.clone()) else {
            return Vec::new();
        };
        let subkey = self.info(&sibkey).and_then(|info| info.subkey.clone());
        std::iter::once(sibkey)
            .chain(subkey)
            .filter(|kid| self.key_activity_at(kid, at).ok() == Some(KeyActivity::Active))
            .collect()
    }

    /// Whether a key, or the sibkey that delegated it, belongs to a web device.
    #[must_use]
    pub fn is_web_key(&self, kid: &Kid) -> bool {
        if self.device_for_key(kid).is_some_and(Device::is_web) {
            return true;
        }
        self.info(kid)
            .and_then(|info| info.parent.as_ref())
            .and_then(|parent| self.device_for_key(parent))
            .is_some_and(Device::is_web)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::ManualClock;
    use crate::ids::PgpFingerprint;
    use crate::keys::{PgpKeyBundle, SigningKey};
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn nacl(seed: u8) -> GenericKey {
        SigningKey::nacl(SigningKey::keypair_from_seed([seed; 32]).expect("keypair"))
            .public_key()
            .clone()
    }

    fn dh(seed: u8) -> GenericKey {
        GenericKey::NaclDh(x25519_dalek::PublicKey::from([seed; 32]))
    }

    fn family(keys: &[GenericKey]) -> ComputedKeyFamily {
        let mut catalog = KeyCatalog::new();
        for key in keys {
            catalog.insert(key.clone()).expect("insert");
        }
        ComputedKeyFamily::empty(Arc::new(catalog))
    }

    fn delegation(kid: &Kid, signer: &Kid, sig: u8, role: KeyRole) -> Delegation {
        Delegation {
            kid: kid.clone(),
            signer: signer.clone(),
            sig_id: SigId::new([sig; 32]),
            role,
            parent: (role == KeyRole::Subkey).then(|| signer.clone()),
            ctime: 100,
            etime: None,
            seqno: i64::from(sig),
            pgp_hash: None,
        }
    }

    fn at(seqno: Seqno) -> KeybaseTime {
        KeybaseTime {
            unix: 200,
            chain: seqno,
        }
    }

    #[test]
    fn expiration_and_revocation_are_independent() {
        let eldest = nacl(1);
        let mut ckf = family(&[eldest.clone()]);
        ckf.insert_eldest_link(&eldest.kid(), "alice", true, 100, Some(500), 1)
            .expect("eldest");

        assert_eq!(ckf.key_activity_at(&eldest.kid(), 300).expect("info"), KeyActivity::Active);
        assert!(ckf.find_active_sibkey_at_time(&eldest.kid(), 300).is_ok());
        assert!(matches!(
            ckf.find_active_sibkey_at_time(&eldest.kid(), 600),
            Err(KeyFamilyError::KeyExpired { etime: 500, .. })
        ));
        assert!(matches!(
            ckf.find_active_sibkey_at_time(&eldest.kid(), 50),
            Err(KeyFamilyError::KeyNotYetValid { .. })
        ));

        ckf.revoke_kid(&eldest.kid(), &eldest.kid(), at(2));
        let err = ckf
            .find_active_sibkey_at_time(&eldest.kid(), 300)
            .expect_err("revoked");
        assert!(matches!(err, KeyFamilyError::KeyRevoked { .. }));
        assert_eq!(err.category(), ErrorCategory::KeyLifecycle);
    }

    #[test]
    fn missing_eldest_key_is_rejected() {
        let mut ckf = family(&[]);
        assert!(matches!(
            ckf.insert_eldest_link(&nacl(1).kid(), "alice", true, 0, None, 1),
            Err(KeyFamilyError::NotEldestKey { .. })
        ));
    }

    #[test]
    fn pgp_eldest_uses_identity_times() {
        let keypair = SigningKey::keypair_from_seed([4u8; 32]).expect("keypair");
        let bundle = PgpKeyBundle::new(PgpFingerprint::new([4u8; 20]), &keypair.public())
            .with_identity("carol@keybase.io", 42, 4_200);
        let key = GenericKey::Pgp(Arc::new(bundle));
        let mut ckf = family(&[key.clone()]);
        ckf.insert_server_eldest_key(&key.kid(), "Carol").expect("eldest");
        let info = ckf.info(&key.kid()).expect("info");
        assert_eq!((info.ctime, info.etime), (42, Some(4_200)));
        assert!(info.eldest && info.sibkey);

        assert!(matches!(
            ckf.insert_server_eldest_key(&key.kid(), "dave"),
            Err(KeyFamilyError::EldestIdentity { .. })
        ));
    }

    #[test]
    fn subkey_delegation_links_parent_and_child() {
        let eldest = nacl(1);
        let subkey = dh(2);
        let mut ckf = family(&[eldest.clone(), subkey.clone()]);
        ckf.insert_eldest_link(&eldest.kid(), "alice", true, 100, None, 1)
            .expect("eldest");
        ckf.delegate(&delegation(&subkey.kid(), &eldest.kid(), 2, KeyRole::Subkey))
            .expect("delegate");

        assert_eq!(ckf.info(&eldest.kid()).expect("eldest").subkey, Some(subkey.kid()));
        assert_eq!(ckf.info(&subkey.kid()).expect("subkey").parent, Some(eldest.kid()));
        assert_eq!(ckf.key_role_at(&subkey.kid(), 150), KeyRole::Subkey);
        assert!(matches!(
            ckf.find_active_sibkey_at_time(&subkey.kid(), 150),
            Err(KeyFamilyError::NotSibkey { .. })
        ));
        let clock = Arc::new(ManualClock::new(150));
        let ctx = Context::new(Config::default(), Arc::new(MemoryStore::new()), clock);
        let (kid, _) = ckf.find_active_encryption_subkey(&ctx).expect("encryption key");
        assert_eq!(kid, subkey.kid());
        assert_eq!(ckf.all_active_subkeys_at(150), vec![subkey]);
        assert!(ckf.has_active_key_at(150));
    }

    #[test]
    fn revoked_key_stays_revoked_when_redelegated() {
        let eldest = nacl(1);
        let sibkey = nacl(2);
        let mut ckf = family(&[eldest.clone(), sibkey.clone()]);
        ckf.insert_eldest_link(&eldest.kid(), "alice", true, 100, None, 1)
            .expect("eldest");
        ckf.delegate(&delegation(&sibkey.kid(), &eldest.kid(), 2, KeyRole::Sibkey))
            .expect("delegate");
        ckf.revoke_sig(&SigId::new([2; 32]), &eldest.kid(), at(3))
            .expect("revoke");
        ckf.delegate(&delegation(&sibkey.kid(), &eldest.kid(), 4, KeyRole::Sibkey))
            .expect("redelegate");

        let info = ckf.info(&sibkey.kid()).expect("info");
        assert_eq!(info.status, KeyStatus::Revoked);
        assert_eq!(info.revoked_at, Some(at(3)));
        assert_eq!(info.delegations.len(), 2);
        assert_eq!(ckf.key_role_at(&sibkey.kid(), 150), KeyRole::None);
    }

    #[test]
    fn revoke_sig_ignores_unknown_and_rejects_mismatched() {
        let eldest = nacl(1);
        let mut ckf = family(&[eldest.clone()]);
        ckf.insert_eldest_link(&eldest.kid(), "alice", true, 100, None, 1)
            .expect("eldest");
        ckf.revoke_sig(&SigId::new([9; 32]), &eldest.kid(), at(2))
            .expect("unknown sig ignored");
        ckf.revoke_kid(&nacl(7).kid(), &eldest.kid(), at(2));

        ckf.infos_mut()
            .sigs
            .insert(SigId::new([8; 32]), eldest.kid());
        assert!(matches!(
            ckf.revoke_sig(&SigId::new([8; 32]), &eldest.kid(), at(2)),
            Err(KeyFamilyError::BadRevocation { .. })
        ));
        assert_eq!(
            ckf.info(&eldest.kid()).expect("info").status,
            KeyStatus::Uncancelled
        );
    }

    #[test]
    fn snapshots_are_copy_on_write() {
        let eldest = nacl(1);
        let mut ckf = family(&[eldest.clone()]);
        ckf.insert_eldest_link(&eldest.kid(), "alice", true, 100, None, 1)
            .expect("eldest");
        let before = Arc::clone(ckf.infos());
        ckf.revoke_kid(&eldest.kid(), &eldest.kid(), at(2));
        assert_eq!(
            before.infos[&eldest.kid()].status,
            KeyStatus::Uncancelled
        );
        assert_eq!(
            ckf.info(&eldest.kid()).expect("info").status,
            KeyStatus::Revoked
        );
    }

    #[test]
    fn devices_merge_and_rebind() {
        let first = nacl(1);
        let second = nacl(2);
        let subkey = dh(3);
        let mut ckf = family(&[first.clone(), second.clone(), subkey.clone()]);
        ckf.insert_eldest_link(&first.kid(), "alice", true, 100, None, 1)
            .expect("eldest");
        ckf.delegate(&delegation(&subkey.kid(), &first.kid(), 2, KeyRole::Subkey))
            .expect("subkey");
        let id = DeviceId::new(Uuid::from_u128(7));
        let device = Device {
            id: Some(id),
            kind: Some(DEVICE_TYPE_WEB.to_string()),
            name: Some("browser".to_string()),
            ..Device::default()
        };
        ckf.update_devices(&device, Some(&first.kid()));
        assert_eq!(ckf.device_for_key(&first.kid()).and_then(|d| d.id), Some(id));
        assert!(ckf.is_web_key(&subkey.kid()));
        assert_eq!(
            ckf.all_active_keys_for_device(&id, 150),
            vec![first.kid(), subkey.kid()]
        );
        assert_eq!(
            ckf.encryption_subkey_for_device(&id, 150).expect("lookup"),
            Some(subkey.clone())
        );

        ckf.update_devices(
            &Device {
                id: Some(id),
                status: Some(1),
                ..Device::default()
            },
            Some(&second.kid()),
        );
        assert!(ckf.device_for_key(&first.kid()).is_none());
        let merged = ckf.device(&id).expect("device");
        assert_eq!(merged.name.as_deref(), Some("browser"));
        assert_eq!(merged.kid, Some(second.kid()));
        assert_eq!(ckf.web_device().and_then(|d| d.id), Some(id));
        assert!(matches!(
            ckf.sibkey_for_device(&id, 150),
            Err(KeyFamilyError::NotDelegated { .. })
        ));
    }
}
