// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::debug;

use super::{ChainError, ChainLink, TypedChainLink};
use crate::family::{ComputedKeyFamily, ComputedKeyInfos, KeyRole, KeybaseTime};
use crate::keys::KeyCatalog;

/// Step-by-step replay of one subchain.
///
/// Each step sees the family exactly as earlier links left it, so a link can
/// only be signed by a key that was active at its point in history.
#[derive(Debug)]
pub struct SubchainReplay {
    username: String,
    family: ComputedKeyFamily,
    applied: usize,
}

impl SubchainReplay {
    #[must_use]
    pub fn new(catalog: Arc<KeyCatalog>, username: &str) -> Self {
        Self {
            username: username.to_string(),
            family: ComputedKeyFamily::empty(catalog),
            applied: 0,
        }
    }

    /// Family state after the links applied so far.
    #[must_use]
    pub fn family(&self) -> &ComputedKeyFamily {
        &self.family
    }

    #[must_use]
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Folds one link into the family. The first link names the eldest key.
    pub fn apply(&mut self, link: &mut ChainLink, is_final: bool) -> Result<(), ChainError> {
        let typed = TypedChainLink::from_link(link)?;

        if let TypedChainLink::PgpUpdate {
            kid,
            full_hash: Some(hash),
        } = &typed
        {
            self.family.set_active_pgp_hash(kid, hash)?;
        }

        if self.applied == 0 {
            self.family.insert_eldest_link(
                link.kid(),
                &self.username,
                link.is_eldest(),
                link.ctime(),
                link.etime(),
                link.seqno(),
            )?;
        }

        if typed.modifies_keys() || is_final || link.has_revocations() {
            link.verify_against_key_family(&self.family)?;
        }

        if typed.role() != KeyRole::None {
            if let Some(delegation) = typed.delegation(link) {
                self.family.delegate(&delegation)?;
            }
        }

        typed.verify_reverse_sig(&self.family, link)?;

        let at = KeybaseTime {
            unix: link.ctime(),
            chain: link.seqno(),
        };
        for sig_id in link.revoked_sig_ids() {
            self.family.revoke_sig(&sig_id, link.kid(), at)?;
        }
        for kid in link.revoked_kids() {
            self.family.revoke_kid(&kid, link.kid(), at);
        }

        if let Some(device) = link.device() {
            self.family.update_devices(device, typed.delegated_kid());
        }

        self.applied += 1;
        Ok(())
    }

    #[must_use]
    pub fn finish(self) -> ComputedKeyFamily {
        self.family
    }
}

/// Replays `links` (oldest first) into the key state they establish.
///
/// Returns whether the result came from the last link's cache. The cache is
/// written only after every link has been applied.
pub fn verify_subchain(
    catalog: Arc<KeyCatalog>,
    username: &str,
    links: &mut [ChainLink],
) -> Result<(bool, Arc<ComputedKeyInfos>), ChainError> {
    let Some(last) = links.last() else {
        return Err(ChainError::EmptySubchain);
    };
    if let Some(cached) = last.sig_check_cache() {
        debug!(seqno = last.seqno(), "replay cache hit");
        return Ok((true, cached));
    }

    let mut replay = SubchainReplay::new(catalog, username);
    let count = links.len();
    for (index, link) in links.iter_mut().enumerate() {
        replay.apply(link, index + 1 == count)?;
    }
    let cki = Arc::clone(replay.finish().infos());
    if let Some(last) = links.last_mut() {
        last.put_sig_check_cache(Arc::clone(&cki));
    }
    debug!(links = count, "replayed subchain");
    Ok((false, cki))
}
