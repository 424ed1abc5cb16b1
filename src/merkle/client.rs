// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::path::{verify_user, verify_username};
use super::{MerkleError, MerkleRoot, MerkleUserLeaf, PathStep};
use crate::context::Context;
use crate::ids::{Kid, Seqno, Uid};
use crate::keys::GenericKey;
use crate::store::{DbKey, ObjType, StoreError};

const HEAD_KEY: &str = "HEAD";

/// What to ask the directory for. A query without a user fetches only a root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_seqno: Option<Seqno>,
}

impl PathQuery {
    #[must_use]
    pub fn for_uid(uid: Uid) -> Self {
        Self {
            uid: Some(uid),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_username(username: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn at_seqno(mut self, seqno: Seqno) -> Self {
        self.start_seqno = Some(seqno);
        self
    }
}

/// The directory's answer: a root, the path to the user and the username proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResponse {
    pub root: MerkleRoot,
    #[serde(default)]
    pub path: Vec<PathStep>,
    #[serde(default)]
    pub uid: Option<Uid>,
    #[serde(default)]
    pub uid_proof_path: Vec<PathStep>,
    #[serde(default)]
    pub id_version: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub username_cased: Option<String>,
}

/// Transport to the server's tree. Timeouts and retries belong to the implementation.
pub trait DirectoryService: Send + Sync {
    fn fetch_path(&self, query: &PathQuery) -> Result<PathResponse, MerkleError>;
}

#[derive(Debug, Default)]
struct ClientState {
    last_root: Option<MerkleRoot>,
    /// Payload hash of every root verified in this process, by seqno.
    verified: HashMap<Seqno, [u8; 32]>,
}

/// Verifies tree roots against the configured signing keys and resolves users through them.
pub struct MerkleClient {
    ctx: Context,
    service: Arc<dyn DirectoryService>,
    trusted_kids: Vec<Kid>,
    state: RwLock<ClientState>,
}

impl MerkleClient {
    /// Builds a client and restores the last verified root from local storage.
    pub fn new(ctx: Context, service: Arc<dyn DirectoryService>) -> Result<Self, MerkleError> {
        let trusted_kids = ctx.config().tree_signing_kids()?;
        let last_root = Self::load_head(&ctx)?;
        let mut verified = HashMap::new();
        if let Some(root) = &last_root {
            debug!(seqno = root.seqno(), "restored stored merkle root");
            verified.insert(root.seqno(), root.payload_hash());
        }
        Ok(Self {
            ctx,
            service,
            trusted_kids,
            state: RwLock::new(ClientState {
                last_root,
                verified,
            }),
        })
    }

    fn head_key() -> DbKey {
        DbKey::new(ObjType::MerkleRoot, HEAD_KEY)
    }

    fn seqno_key(seqno: Seqno) -> DbKey {
        DbKey::new(ObjType::MerkleRoot, seqno.to_string())
    }

    fn decode_root(key: DbKey, bytes: &[u8]) -> Result<MerkleRoot, MerkleError> {
        MerkleRoot::from_json(bytes).map_err(|error| {
            MerkleError::Store(StoreError::Decode {
                key,
                message: error.to_string(),
            })
        })
    }

    fn load_head(ctx: &Context) -> Result<Option<MerkleRoot>, MerkleError> {
        let key = Self::head_key();
        match ctx.store().get(&key)? {
            Some(bytes) => Self::decode_root(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// The stored head, if it is the root at `seqno`.
    pub fn stored_root_at(&self, seqno: Seqno) -> Result<Option<MerkleRoot>, MerkleError> {
        let key = Self::seqno_key(seqno);
        let Some(bytes) = self.ctx.store().get(&key)? else {
            return Ok(None);
        };
        let root = Self::decode_root(key, &bytes)?;
        Ok((root.seqno() == seqno).then_some(root))
    }

    pub fn last_root(&self) -> Result<Option<MerkleRoot>, MerkleError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.last_root.clone())
    }

    pub fn last_seqno(&self) -> Result<Option<Seqno>, MerkleError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.last_root.as_ref().map(MerkleRoot::seqno))
    }

    /// Verifies `root` as the new head of the tree and stores it.
    pub fn verify_root(&self, root: &MerkleRoot) -> Result<(), MerkleError> {
        self.verify_and_store(root, false)
    }

    /// Verifies a root from the past without rollback checks or touching the head.
    pub fn verify_root_historical(&self, root: &MerkleRoot) -> Result<(), MerkleError> {
        self.verify_and_store(root, true)
    }

    /// The rollback check, memo lookup and head update all run under one write lock.
    fn verify_and_store(&self, root: &MerkleRoot, historical: bool) -> Result<(), MerkleError> {
        let seqno = root.seqno();
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        if !historical {
            let last = state.last_root.as_ref().map(MerkleRoot::seqno);
            if let Some(last) = last.filter(|last| *last > seqno) {
                warn!(last, attempted = seqno, "merkle tree rollback");
                return Err(MerkleError::Rollback {
                    last,
                    attempted: seqno,
                });
            }
        }

        let payload_hash = root.payload_hash();
        match state.verified.get(&seqno) {
            Some(known) if *known != payload_hash => {
                warn!(seqno, "conflicting merkle roots at one seqno");
                return Err(MerkleError::RootConflict { seqno });
            }
            Some(_) => debug!(seqno, "merkle root already verified"),
            None => {
                let kid = self.find_valid_signature(root)?;
                debug!(seqno, %kid, "merkle root signature verified");
                state.verified.insert(seqno, payload_hash);
            }
        }
        if !historical {
            self.store_head(&mut state, root);
        }
        Ok(())
    }

    fn find_valid_signature(&self, root: &MerkleRoot) -> Result<Kid, MerkleError> {
        for (kid, sig) in root.signatures() {
            let Ok(kid) = Kid::from_hex(kid) else {
                continue;
            };
            if !self.trusted_kids.contains(&kid) {
                continue;
            }
            let verified = GenericKey::from_kid(&kid)
                .and_then(|key| key.verify_string(sig, root.payload_bytes()));
            match verified {
                Ok(_) => return Ok(kid),
                Err(error) => debug!(%kid, %error, "rejected merkle root signature"),
            }
        }
        Err(MerkleError::NoValidSigningKey {
            seqno: root.seqno(),
        })
    }

    fn store_head(&self, state: &mut ClientState, root: &MerkleRoot) {
        let seqno = root.seqno();
        let stored = serde_json::to_vec(root)
            .map_err(|error| StoreError::Encode {
                key: Self::head_key(),
                message: error.to_string(),
            })
            .and_then(|bytes| {
                self.ctx
                    .store()
                    .put(&Self::head_key(), &[Self::seqno_key(seqno)], &bytes)
            });
        match stored {
            Ok(()) => {
                info!(seqno, "stored merkle root");
                state.last_root = Some(root.clone());
            }
            Err(error) => warn!(seqno, %error, "cannot commit merkle root to local storage"),
        }
    }

    /// Fetches, verifies and stores the current root.
    pub fn fetch_current_root(&self) -> Result<MerkleRoot, MerkleError> {
        let response = self.service.fetch_path(&PathQuery::default())?;
        self.verify_and_store(&response.root, false)?;
        Ok(response.root)
    }

    /// Resolves a user through a freshly verified root.
    ///
    /// The leaf's UID path and the username binding are both proven against
    /// that root. A user absent from the tree yields an empty leaf.
    pub fn lookup_user(&self, query: &PathQuery) -> Result<MerkleUserLeaf, MerkleError> {
        let response = self.service.fetch_path(query)?;
        let uid = response.uid.ok_or_else(|| {
            MerkleError::MalformedResponse("verification path has no UID".to_string())
        })?;
        self.verify_and_store(&response.root, false)?;
        let mut leaf = verify_user(&response.root, &response.path, uid)?;
        leaf.username = verify_username(
            &response.root,
            uid,
            &response.username,
            response.username_cased.as_deref(),
            &response.uid_proof_path,
        )?;
        leaf.id_version = response.id_version;
        debug!(%uid, seqno = leaf.public_seqno(), root = response.root.seqno(), "looked up user");
        Ok(leaf)
    }

    /// Whether historical lookups may request root `seqno`.
    #[must_use]
    pub fn can_examine_historical_root(&self, seqno: Seqno) -> bool {
        self.check_historical_seqno(seqno).is_ok()
    }

    fn check_historical_seqno(&self, seqno: Seqno) -> Result<(), MerkleError> {
        match self.ctx.config().first_examinable_merkle_seqno() {
            Some(first) if seqno < first => Err(MerkleError::AncientSeqno {
                requested: seqno,
                first,
            }),
            _ => Ok(()),
        }
    }

    fn lookup_historical(
        &self,
        uid: Option<Uid>,
        seqno: Seqno,
    ) -> Result<(Option<MerkleUserLeaf>, MerkleRoot), MerkleError> {
        self.check_historical_seqno(seqno)?;
        let query = PathQuery {
            uid,
            ..PathQuery::default()
        }
        .at_seqno(seqno);
        let response = self.service.fetch_path(&query)?;
        let returned = response.root.seqno();
        if returned != seqno {
            return Err(MerkleError::SeqnoMismatch {
                requested: seqno,
                returned,
            });
        }
        self.verify_and_store(&response.root, true)?;
        let leaf = uid
            .map(|uid| verify_user(&response.root, &response.path, uid))
            .transpose()?;
        Ok((leaf, response.root))
    }

    /// The user's leaf as of root `seqno`, with that verified root.
    pub fn lookup_leaf_at_seqno(
        &self,
        uid: Uid,
        seqno: Seqno,
    ) -> Result<(MerkleUserLeaf, MerkleRoot), MerkleError> {
        let (leaf, root) = self.lookup_historical(Some(uid), seqno)?;
        let leaf = leaf.unwrap_or_else(|| MerkleUserLeaf::absent(uid));
        Ok((leaf, root))
    }

    pub fn lookup_root_at_seqno(&self, seqno: Seqno) -> Result<MerkleRoot, MerkleError> {
        self.lookup_historical(None, seqno).map(|(_, root)| root)
    }
}
