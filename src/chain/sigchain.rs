// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{verify_subchain, ChainError, ChainLink, ServerLink};
use crate::context::Context;
use crate::family::{ComputedKeyFamily, ComputedKeyInfos, Delegation, KeyRole};
use crate::ids::{Kid, LinkId, Seqno, SigId, Uid};
use crate::keys::{GenericKey, KeyCatalog};
use crate::merkle::MerkleTriple;
use crate::store::{DbKey, LocalStore, ObjType, StoreError};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct StoredTail {
    seqno: Seqno,
    link_id: LinkId,
}

#[derive(Clone, Debug)]
struct LocalTail {
    triple: MerkleTriple,
    bumped_at: i64,
}

/// Where the current subchain starts, given the eldest KID the tree reports.
///
/// Returns `links.len()` when there is no current subchain: the chain is empty
/// or the account was reset after its last link.
pub fn crop_to_rightmost_subchain(links: &[ChainLink], eldest: &Kid) -> Result<usize, ChainError> {
    let Some(last) = links.last() else {
        return Ok(0);
    };
    if last.eldest_kid() != eldest {
        return Ok(links.len());
    }
    for i in (1..links.len()).rev() {
        let (curr, prev) = (&links[i], &links[i - 1]);
        if curr.seqno() == 1 || curr.is_eldest() || curr.eldest_kid() != prev.eldest_kid() {
            return Ok(i);
        }
    }
    if links[0].seqno() != 1 {
        return Err(ChainError::MissingPrefix {
            first: links[0].seqno(),
        });
    }
    Ok(0)
}

/// All links of one user, oldest first.
#[derive(Debug)]
pub struct SigChain {
    uid: Uid,
    username: String,
    links: Vec<ChainLink>,
    local_tail: Option<LocalTail>,
    local_cki: Option<Arc<ComputedKeyInfos>>,
    current_subchain_start: Seqno,
    historical_subchains: Vec<Range<usize>>,
}

impl SigChain {
    #[must_use]
    pub fn new(uid: Uid, username: &str) -> Self {
        Self::from_links(uid, username, Vec::new())
    }

    #[must_use]
    pub fn from_links(uid: Uid, username: &str, links: Vec<ChainLink>) -> Self {
        Self {
            uid,
            username: username.to_string(),
            links,
            local_tail: None,
            local_cki: None,
            current_subchain_start: 0,
            historical_subchains: Vec::new(),
        }
    }

    /// Imports links fetched from the server.
    pub fn from_server_links(
        uid: Uid,
        username: &str,
        links: Vec<ServerLink>,
    ) -> Result<Self, ChainError> {
        let links = links
            .into_iter()
            .map(ChainLink::import)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_links(uid, username, links))
    }

    #[must_use]
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Seqno of the first link in the current subchain, or 0 when there is none.
    #[must_use]
    pub fn eldest_seqno(&self) -> Seqno {
        self.current_subchain_start
    }

    /// Link ranges of earlier subchains replayed by the last key computation, oldest first.
    #[must_use]
    pub fn historical_subchains(&self) -> &[Range<usize>] {
        &self.historical_subchains
    }

    /// Checks hash linkage, seqno contiguity and ownership of every link not yet checked.
    ///
    /// Walks newest to oldest and stops at the first link already verified.
    /// Links are marked only after the whole walk succeeds.
    pub fn verify_chain(&mut self) -> Result<(), ChainError> {
        let mut checked = Vec::new();
        for i in (0..self.links.len()).rev() {
            if self.links[i].is_chain_verified() {
                debug!(seqno = self.links[i].seqno(), "chain verification short-circuit");
                break;
            }
            self.links[i].verify_link()?;
            if i > 0 {
                let (prev, curr) = (&self.links[i - 1], &self.links[i]);
                if curr.prev() != Some(prev.id()) {
                    return Err(ChainError::ChainBroken {
                        seqno: curr.seqno(),
                    });
                }
                if prev.seqno().checked_add(1) != Some(curr.seqno()) {
                    return Err(ChainError::WrongSeqno {
                        seqno: curr.seqno(),
                        previous: prev.seqno(),
                    });
                }
            }
            self.links[i].check_name_and_id(&self.username, &self.uid)?;
            checked.push(i);
        }
        for i in checked {
            self.links[i].mark_chain_verified();
        }
        Ok(())
    }

    #[must_use]
    pub fn current_tail_triple(&self) -> Option<MerkleTriple> {
        self.links.last().map(ChainLink::to_merkle_triple)
    }

    #[must_use]
    pub fn last_loaded_seqno(&self) -> Seqno {
        self.links.last().map_or(0, ChainLink::seqno)
    }

    #[must_use]
    pub fn last_loaded_id(&self) -> Option<LinkId> {
        self.links.last().map(ChainLink::id)
    }

    /// The bumped local tail, while it is still inside the server update window.
    pub fn future_chain_tail(&self, ctx: &Context) -> Result<Option<MerkleTriple>, ChainError> {
        let lag = ctx.config().server_update_lag_secs()?;
        Ok(self
            .local_tail
            .as_ref()
            .filter(|tail| ctx.now() - tail.bumped_at < lag)
            .map(|tail| tail.triple.clone()))
    }

    pub fn last_known_seqno(&self, ctx: &Context) -> Result<Seqno, ChainError> {
        Ok(self
            .future_chain_tail(ctx)?
            .map_or_else(|| self.last_loaded_seqno(), |tail| tail.seqno))
    }

    pub fn last_known_id(&self, ctx: &Context) -> Result<Option<LinkId>, ChainError> {
        Ok(self
            .future_chain_tail(ctx)?
            .map(|tail| tail.link_id)
            .or_else(|| self.last_loaded_id()))
    }

    fn next_known_seqno(&self, ctx: &Context) -> Result<Seqno, ChainError> {
        let last = self.last_known_seqno(ctx)?;
        last.checked_add(1).ok_or(ChainError::WrongSeqno {
            seqno: last,
            previous: last,
        })
    }

    /// Records a link this client just posted, ahead of the server.
    pub fn bump(&mut self, ctx: &Context, mut triple: MerkleTriple) -> Result<(), ChainError> {
        triple.seqno = self.next_known_seqno(ctx)?;
        debug!(uid = %self.uid, seqno = triple.seqno, "bumped local chain tail");
        self.local_tail = Some(LocalTail {
            triple,
            bumped_at: ctx.now(),
        });
        Ok(())
    }

    /// Compares the loaded tail with the server's claim. Returns whether the
    /// local chain is current.
    pub fn check_freshness(
        &self,
        ctx: &Context,
        server: Option<&MerkleTriple>,
    ) -> Result<bool, ChainError> {
        let client = self.current_tail_triple();
        let future = self.future_chain_tail(ctx)?;
        debug!(
            uid = %self.uid,
            server = server.map(|tail| tail.seqno),
            client = client.as_ref().map(|tail| tail.seqno),
            future = future.as_ref().map(|tail| tail.seqno),
            "checking chain freshness"
        );
        let Some(server) = server else {
            if let Some(client) = client {
                return Err(ChainError::UserAbsent {
                    local: client.seqno,
                });
            }
            return Ok(false);
        };
        let local = client.as_ref().map_or(-1, |tail| tail.seqno);
        if server.seqno < 0 || local > server.seqno {
            return Err(ChainError::Rollback {
                local,
                server: server.seqno,
            });
        }
        let mut current = false;
        if local == server.seqno {
            let Some(client) = &client else {
                return Err(ChainError::WrongTail {
                    seqno: server.seqno,
                });
            };
            if client.link_id != server.link_id {
                return Err(ChainError::WrongTail {
                    seqno: server.seqno,
                });
            }
            current = true;
        }
        if current && future.is_some_and(|future| local < future.seqno) {
            debug!(uid = %self.uid, "local writes ahead of server, reload needed");
            current = false;
        }
        Ok(current)
    }

    /// Replayed key state, preferring an unposted local delegation.
    #[must_use]
    pub fn computed_key_infos(&self) -> Option<Arc<ComputedKeyInfos>> {
        self.local_cki
            .clone()
            .or_else(|| self.links.last().and_then(ChainLink::sig_check_cache))
    }

    /// Verifies the chain and replays the current subchain, then every earlier one.
    ///
    /// Returns whether every replay was served from cache. Failures in earlier
    /// subchains are logged and do not fail the load.
    pub fn verify_sigs_and_compute_keys(
        &mut self,
        catalog: Arc<KeyCatalog>,
        eldest: Option<&Kid>,
    ) -> Result<(bool, ComputedKeyFamily), ChainError> {
        self.verify_chain()?;
        if let Some(first) = self.links.first() {
            if first.seqno() > 1 {
                return Err(ChainError::MissingPrefix {
                    first: first.seqno(),
                });
            }
        }
        self.current_subchain_start = 0;
        self.historical_subchains.clear();

        let Some(eldest) = eldest else {
            debug!(uid = %self.uid, "no eldest key, nothing to replay");
            let family = ComputedKeyFamily::empty(catalog);
            self.local_cki = Some(Arc::clone(family.infos()));
            return Ok((false, family));
        };

        let start = crop_to_rightmost_subchain(&self.links, eldest)?;
        let (cached, family) = if start == self.links.len() {
            debug!(uid = %self.uid, %eldest, "empty current subchain");
            let mut family = ComputedKeyFamily::empty(Arc::clone(&catalog));
            family.insert_server_eldest_key(eldest, &self.username)?;
            (false, family)
        } else {
            self.current_subchain_start = self.links[start].seqno();
            let (cached, cki) =
                verify_subchain(Arc::clone(&catalog), &self.username, &mut self.links[start..])?;
            (cached, ComputedKeyFamily::new(Arc::clone(&catalog), cki))
        };
        self.local_cki = None;

        let mut all_cached = cached;
        let mut end = start;
        while end > 0 {
            let historical = &self.links[..end];
            let eldest = historical[end - 1].eldest_kid().clone();
            let begin = match crop_to_rightmost_subchain(historical, &eldest) {
                Ok(begin) if begin < end => begin,
                Ok(_) => break,
                Err(error) => {
                    info!(uid = %self.uid, end, %error, "cannot backtrack historical subchain");
                    break;
                }
            };
            match verify_subchain(
                Arc::clone(&catalog),
                &self.username,
                &mut self.links[begin..end],
            ) {
                Ok((cached, _)) => all_cached &= cached,
                Err(error) => {
                    info!(uid = %self.uid, end, %error, "historical subchain failed to verify");
                    break;
                }
            }
            self.historical_subchains.insert(0, begin..end);
            end = begin;
        }
        debug!(
            uid = %self.uid,
            start = self.current_subchain_start,
            historical = self.historical_subchains.len(),
            "computed keys"
        );
        Ok((all_cached, family))
    }

    /// Records a key this client just delegated, before the server has the link.
    pub fn local_delegate(
        &mut self,
        ctx: &Context,
        catalog: Arc<KeyCatalog>,
        key: GenericKey,
        sig_id: SigId,
        signer: &Kid,
        role: KeyRole,
    ) -> Result<ComputedKeyFamily, ChainError> {
        let now = ctx.now();
        let cki = self.computed_key_infos().unwrap_or_default();
        let mut family = ComputedKeyFamily::new(catalog, cki);
        if family.infos().infos.is_empty() {
            debug!(%signer, "local delegation starts a new family");
            family.insert_local_eldest_key(signer, now);
        }
        let delegation = Delegation {
            kid: key.kid(),
            signer: signer.clone(),
            sig_id,
            role,
            parent: (role == KeyRole::Subkey).then(|| signer.clone()),
            ctime: now,
            etime: None,
            seqno: self.next_known_seqno(ctx)?,
            pgp_hash: None,
        };
        family.local_delegate(key, &delegation)?;
        self.local_cki = Some(Arc::clone(family.infos()));
        Ok(family)
    }

    #[must_use]
    pub fn link_by_seqno(&self, seqno: Seqno) -> Option<&ChainLink> {
        self.links.iter().find(|link| link.seqno() == seqno)
    }

    #[must_use]
    pub fn link_by_sig_id(&self, sig_id: &SigId) -> Option<&ChainLink> {
        self.links.iter().find(|link| link.sig_id() == *sig_id)
    }

    fn tail_key(uid: &Uid) -> DbKey {
        DbKey::new(ObjType::SigChainTail, uid.to_hex())
    }

    /// Persists every link, newest first, then the tail pointer.
    pub fn store(&self, store: &dyn LocalStore) -> Result<(), ChainError> {
        let Some(last) = self.links.last() else {
            return Ok(());
        };
        for link in self.links.iter().rev() {
            link.store(store)?;
        }
        let key = Self::tail_key(&self.uid);
        let tail = StoredTail {
            seqno: last.seqno(),
            link_id: last.id(),
        };
        let bytes = serde_json::to_vec(&tail).map_err(|error| StoreError::Encode {
            key: key.clone(),
            message: error.to_string(),
        })?;
        store.put(&key, &[], &bytes)?;
        debug!(uid = %self.uid, seqno = tail.seqno, "stored sigchain");
        Ok(())
    }

    /// Loads a stored chain by walking `prev` pointers back from the tail.
    ///
    /// Only a `trusted` load keeps the stored verification flags and caches.
    pub fn load_from_storage(
        store: &dyn LocalStore,
        uid: Uid,
        username: &str,
        trusted: bool,
    ) -> Result<Self, ChainError> {
        let key = Self::tail_key(&uid);
        let Some(bytes) = store.get(&key)? else {
            return Ok(Self::new(uid, username));
        };
        let tail: StoredTail = serde_json::from_slice(&bytes).map_err(|error| {
            StoreError::Decode {
                key: key.clone(),
                message: error.to_string(),
            }
        })?;
        let mut links = Vec::new();
        let mut next = Some(tail.link_id);
        while let Some(id) = next {
            let link = ChainLink::load(store, &id, trusted)?
                .ok_or(ChainError::MissingStoredLink { id })?;
            if Seqno::try_from(links.len()).map_or(true, |count| count >= tail.seqno) {
                return Err(ChainError::CorruptStoredLink {
                    id,
                    message: format!("chain walks past the stored tail seqno {}", tail.seqno),
                });
            }
            next = if link.seqno() > 1 { link.prev() } else { None };
            links.push(link);
        }
        links.reverse();
        debug!(%uid, links = links.len(), trusted, "loaded sigchain from storage");
        Ok(Self::from_links(uid, username, links))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{catalog, ChainBuilder};
    use crate::config::Config;
    use crate::context::ManualClock;
    use crate::family::{KeyFamilyError, KeyStatus};
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn context(now: i64) -> (Context, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let ctx = Context::new(Config::default(), Arc::new(MemoryStore::new()), clock.clone());
        (ctx, clock)
    }

    fn simple_chain(len: usize) -> (ChainBuilder, SigChain) {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        for _ in 1..len {
            builder.track(&alice);
        }
        let chain = SigChain::from_links(builder.uid(), "alice", builder.links());
        (builder, chain)
    }

    #[test]
    fn verify_chain_marks_links() {
        let (_, mut chain) = simple_chain(4);
        chain.verify_chain().expect("verify");
        assert!(chain.links().iter().all(ChainLink::is_chain_verified));
        assert_eq!(chain.last_loaded_seqno(), 4);
    }

    #[test]
    fn seqno_gap_is_rejected() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        builder.track(&alice);
        builder.skip_seqno();
        builder.track(&alice);
        let mut chain = SigChain::from_links(builder.uid(), "alice", builder.links());
        let seqnos: Vec<_> = chain.links().iter().map(ChainLink::seqno).collect();
        assert_eq!(seqnos, vec![1, 2, 4]);
        assert!(matches!(
            chain.verify_chain(),
            Err(ChainError::WrongSeqno {
                seqno: 4,
                previous: 2
            })
        ));
        assert!(!chain.links().iter().any(ChainLink::is_chain_verified));
    }

    #[test]
    fn seqno_at_the_integer_limit_is_a_mismatch() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        builder.set_next_seqno(Seqno::MAX);
        builder.track(&alice);
        builder.set_next_seqno(3);
        builder.track(&alice);
        let mut chain = SigChain::from_links(builder.uid(), "alice", builder.links());
        assert!(matches!(
            chain.verify_chain(),
            Err(ChainError::WrongSeqno {
                seqno: 3,
                previous: Seqno::MAX
            })
        ));

        let mut links = builder.links();
        links.pop();
        let mut chain = SigChain::from_links(builder.uid(), "alice", links);
        let ctx = Context::in_memory(Config::default());
        let tail = chain.current_tail_triple().expect("tail");
        assert!(matches!(
            chain.bump(&ctx, tail),
            Err(ChainError::WrongSeqno {
                seqno: Seqno::MAX,
                ..
            })
        ));
    }

    #[test]
    fn omitted_link_breaks_the_chain() {
        let (builder, _) = simple_chain(4);
        let mut links = builder.links();
        links.remove(2);
        let mut chain = SigChain::from_links(builder.uid(), "alice", links);
        assert!(matches!(
            chain.verify_chain(),
            Err(ChainError::ChainBroken { seqno: 4 })
        ));
    }

    #[test]
    fn foreign_link_is_an_identity_mismatch() {
        let (builder, _) = simple_chain(2);
        let mut chain = SigChain::from_links(Uid::from_username("bob"), "bob", builder.links());
        assert!(matches!(
            chain.verify_chain(),
            Err(ChainError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn verified_links_are_not_rechecked() {
        let (_, mut chain) = simple_chain(3);
        chain.verify_chain().expect("verify");
        chain.links[0].corrupt_payload_byte(5, 0x01);
        chain.verify_chain().expect("short-circuit at verified tail");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn flipped_payload_byte_fails_the_whole_chain(
            target in 0usize..5,
            offset in any::<usize>(),
            mask in 1u8..=255,
        ) {
            let (_, mut chain) = simple_chain(5);
            chain.links[target].corrupt_payload_byte(offset, mask);
            let result = chain.verify_chain();
            let is_hash_mismatch = matches!(result, Err(ChainError::HashMismatch { .. }));
            prop_assert!(is_hash_mismatch);
            prop_assert!(!chain.links().iter().any(ChainLink::is_chain_verified));
        }
    }

    #[test]
    fn bump_is_bounded_by_the_update_window() {
        let (ctx, clock) = context(10_000);
        let (_, mut chain) = simple_chain(3);
        let triple = MerkleTriple {
            seqno: 0,
            link_id: LinkId::new([7; 32]),
            sig_id: None,
        };
        chain.bump(&ctx, triple).expect("bump");
        assert_eq!(chain.last_known_seqno(&ctx).expect("seqno"), 4);
        assert_eq!(
            chain.last_known_id(&ctx).expect("id"),
            Some(LinkId::new([7; 32]))
        );
        assert_eq!(chain.last_loaded_seqno(), 3);

        clock.advance(60);
        assert!(chain.future_chain_tail(&ctx).expect("tail").is_none());
        assert_eq!(chain.last_known_seqno(&ctx).expect("seqno"), 3);
        assert_eq!(chain.last_known_id(&ctx).expect("id"), chain.last_loaded_id());
    }

    #[test]
    fn freshness_against_server_tail() {
        let (ctx, _) = context(10_000);
        let (_, chain) = simple_chain(3);
        let tail = chain.current_tail_triple().expect("tail");

        assert!(chain.check_freshness(&ctx, Some(&tail)).expect("fresh"));
        assert!(matches!(
            chain.check_freshness(&ctx, None),
            Err(ChainError::UserAbsent { local: 3 })
        ));
        let behind = MerkleTriple {
            seqno: 2,
            ..tail.clone()
        };
        assert!(matches!(
            chain.check_freshness(&ctx, Some(&behind)),
            Err(ChainError::Rollback { local: 3, server: 2 })
        ));
        let forked = MerkleTriple {
            link_id: LinkId::new([1; 32]),
            ..tail.clone()
        };
        assert!(matches!(
            chain.check_freshness(&ctx, Some(&forked)),
            Err(ChainError::WrongTail { seqno: 3 })
        ));
        let ahead = MerkleTriple {
            seqno: 5,
            ..tail.clone()
        };
        assert!(!chain.check_freshness(&ctx, Some(&ahead)).expect("stale"));
        assert!(!SigChain::new(Uid::from_username("alice"), "alice")
            .check_freshness(&ctx, None)
            .expect("new user"));
    }

    #[test]
    fn bumped_tail_forces_reload() {
        let (ctx, _) = context(10_000);
        let (_, mut chain) = simple_chain(3);
        let tail = chain.current_tail_triple().expect("tail");
        chain.bump(&ctx, tail.clone()).expect("bump");
        assert!(!chain.check_freshness(&ctx, Some(&tail)).expect("reload"));
    }

    #[test]
    fn crop_finds_the_current_subchain() {
        let alice = ChainBuilder::signer(1);
        let reset = ChainBuilder::signer(2);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        builder.track(&alice);
        builder.eldest(&reset);
        builder.track(&reset);
        let links = builder.links();
        assert_eq!(crop_to_rightmost_subchain(&links, &reset.kid()).expect("crop"), 2);
        assert_eq!(crop_to_rightmost_subchain(&links, &alice.kid()).expect("crop"), 4);
        assert_eq!(crop_to_rightmost_subchain(&links[..2], &alice.kid()).expect("crop"), 0);
        assert!(matches!(
            crop_to_rightmost_subchain(&links[3..], &reset.kid()),
            Err(ChainError::MissingPrefix { first: 4 })
        ));
        assert_eq!(crop_to_rightmost_subchain(&[], &alice.kid()).expect("empty"), 0);
    }

    #[test]
    fn computes_current_and_historical_subchains() {
        let alice = ChainBuilder::signer(1);
        let reset = ChainBuilder::signer(2);
        let dh = ChainBuilder::dh(3);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        builder.subkey(&alice, &dh);
        builder.eldest(&reset);
        builder.track(&reset);
        let mut chain = SigChain::from_links(builder.uid(), "alice", builder.links());
        let catalog = catalog(&[
            alice.public_key().clone(),
            reset.public_key().clone(),
            dh.clone(),
        ]);

        let (cached, family) = chain
            .verify_sigs_and_compute_keys(Arc::clone(&catalog), Some(&reset.kid()))
            .expect("compute");
        assert!(!cached);
        assert_eq!(chain.eldest_seqno(), 3);
        assert_eq!(chain.historical_subchains(), &[0..2]);
        assert!(family.info(&alice.kid()).is_none());
        assert!(family.info(&reset.kid()).expect("eldest").eldest);
        assert!(chain.links()[1].sig_check_cache().is_some());

        let (cached, _) = chain
            .verify_sigs_and_compute_keys(catalog, Some(&reset.kid()))
            .expect("again");
        assert!(cached);
    }

    #[test]
    fn reset_without_links_needs_a_pgp_eldest() {
        let (_, mut chain) = simple_chain(2);
        let other = ChainBuilder::signer(8);
        let catalog = catalog(&[
            ChainBuilder::signer(1).public_key().clone(),
            other.public_key().clone(),
        ]);
        let err = chain
            .verify_sigs_and_compute_keys(catalog, Some(&other.kid()))
            .expect_err("nacl key has no identity");
        assert!(matches!(
            err,
            ChainError::KeyFamily(KeyFamilyError::EldestIdentity { .. })
        ));
        assert_eq!(chain.eldest_seqno(), 0);
    }

    #[test]
    fn link_lookups() {
        let alice = ChainBuilder::signer(1);
        let mut builder = ChainBuilder::new("alice");
        builder.eldest(&alice);
        let track = builder.track(&alice);
        let chain = SigChain::from_links(builder.uid(), "alice", builder.links());
        assert_eq!(chain.link_by_sig_id(&track).map(ChainLink::seqno), Some(2));
        assert_eq!(
            chain.link_by_seqno(1).map(ChainLink::sig_id),
            chain.links().first().map(ChainLink::sig_id)
        );
        assert!(chain.link_by_seqno(9).is_none());
    }

    #[test]
    fn storage_round_trip_respects_trust() {
        let alice = ChainBuilder::signer(1);
        let (builder, mut chain) = simple_chain(3);
        let catalog = catalog(&[alice.public_key().clone()]);
        chain
            .verify_sigs_and_compute_keys(catalog, Some(&alice.kid()))
            .expect("compute");
        let store = MemoryStore::new();
        chain.store(&store).expect("store");

        let trusted =
            SigChain::load_from_storage(&store, builder.uid(), "alice", true).expect("load");
        assert_eq!(trusted.len(), 3);
        assert!(trusted.links().iter().all(ChainLink::is_chain_verified));
        assert!(trusted.computed_key_infos().is_some());

        let untrusted =
            SigChain::load_from_storage(&store, builder.uid(), "alice", false).expect("load");
        assert_eq!(untrusted.current_tail_triple(), chain.current_tail_triple());
        assert!(!untrusted.links().iter().any(ChainLink::is_chain_verified));
        assert!(untrusted.computed_key_infos().is_none());

        let empty = SigChain::load_from_storage(&store, Uid::from_username("bob"), "bob", true)
            .expect("absent");
        assert!(empty.is_empty());

        store
            .delete(&DbKey::new(ObjType::ChainLink, chain.links()[1].id().to_hex()))
            .expect("delete");
        assert!(matches!(
            SigChain::load_from_storage(&store, builder.uid(), "alice", true),
            Err(ChainError::MissingStoredLink { .. })
        ));
    }

    #[test]
    fn local_delegation_runs_ahead_of_the_server() {
        let (ctx, _) = context(10_000);
        let alice = ChainBuilder::signer(1);
        let (_, mut chain) = simple_chain(2);
        let catalog = catalog(&[alice.public_key().clone()]);
        chain
            .verify_sigs_and_compute_keys(Arc::clone(&catalog), Some(&alice.kid()))
            .expect("compute");

        let dh = ChainBuilder::dh(4);
        let family = chain
            .local_delegate(
                &ctx,
                catalog,
                dh.clone(),
                SigId::new([4; 32]),
                &alice.kid(),
                KeyRole::Subkey,
            )
            .expect("delegate");
        let info = family.info(&dh.kid()).expect("delegated");
        assert_eq!(info.status, KeyStatus::Uncancelled);
        assert_eq!(info.parent, Some(alice.kid()));
        assert!(family.catalog().contains(&dh.kid()));
        let cki = chain.computed_key_infos().expect("local cki");
        assert!(cki.infos.contains_key(&dh.kid()));
    }
}
