// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Two-level test trees, signed roots and a scripted directory service.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::{
    DirectoryService, MerkleError, MerkleRoot, NodeHash, PathQuery, PathResponse, PathStep,
    RootSig, ServerRoot, NODE_TYPE_INTERIOR, NODE_TYPE_LEAF,
};
use crate::ids::{LinkId, Seqno, Uid};
use crate::keys::SigningKey;

/// A tree with one interior root fanning out on the first key character.
pub(crate) struct TestTree {
    long: bool,
    root_node: String,
    root_hash: NodeHash,
    children: BTreeMap<String, String>,
}

impl TestTree {
    pub(crate) fn long(leaves: Vec<(String, Value)>) -> Self {
        Self::build(leaves, true)
    }

    pub(crate) fn short(leaves: Vec<(String, Value)>) -> Self {
        Self::build(leaves, false)
    }

    fn hash(&self, node: &str) -> NodeHash {
        if self.long {
            NodeHash::long_of(node)
        } else {
            NodeHash::short_of(node)
        }
    }

    fn build(leaves: Vec<(String, Value)>, long: bool) -> Self {
        let mut groups: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        for (key, value) in leaves {
            let prefix = key.chars().take(1).collect::<String>();
            groups.entry(prefix).or_default().insert(key, value);
        }
        let mut tree = Self {
            long,
            root_node: String::new(),
            root_hash: NodeHash::Short([0; 32]),
            children: BTreeMap::new(),
        };
        let mut tab = Map::new();
        for (prefix, entries) in groups {
            let node = json!({ "type": NODE_TYPE_LEAF, "tab": entries }).to_string();
            tab.insert(prefix.clone(), json!(tree.hash(&node).to_hex()));
            tree.children.insert(prefix, node);
        }
        tree.root_node = json!({ "type": NODE_TYPE_INTERIOR, "tab": tab }).to_string();
        tree.root_hash = tree.hash(&tree.root_node);
        tree
    }

    pub(crate) fn root_hash(&self) -> &NodeHash {
        &self.root_hash
    }

    /// The path a server would send for `key`, ending early when no child covers it.
    pub(crate) fn path(&self, key: &str) -> Vec<PathStep> {
        let prefix = key.chars().take(1).collect::<String>();
        let mut path = vec![PathStep {
            prefix: prefix.clone(),
            node: self.root_node.clone(),
        }];
        if let Some(child) = self.children.get(&prefix) {
            path.push(PathStep {
                prefix,
                node: child.clone(),
            });
        }
        path
    }
}

pub(crate) fn link_id_for(seqno: Seqno) -> LinkId {
    LinkId::new([u8::try_from(seqno % 251).expect("small"); 32])
}

/// A v2 leaf whose public chain ends at `seqno`.
pub(crate) fn user_leaf(seqno: Seqno, eldest: Option<&str>) -> Value {
    json!([2, [seqno, link_id_for(seqno)], [], eldest])
}

pub(crate) fn signed_root(
    signer: &SigningKey,
    seqno: Seqno,
    root: &NodeHash,
    legacy: Option<&NodeHash>,
) -> MerkleRoot {
    let mut body = json!({ "seqno": seqno, "root": root });
    if let Some(legacy) = legacy {
        body["legacy_uid_root"] = json!(legacy);
    }
    let payload_json = json!({ "body": body, "ctime": 1_000 + seqno, "tag": "signature" }).to_string();
    let (sig, _) = signer.sign(payload_json.as_bytes()).expect("sign root");
    let mut sigs = BTreeMap::new();
    sigs.insert(signer.kid().to_hex(), RootSig { sig });
    MerkleRoot::try_from(ServerRoot { sigs, payload_json }).expect("root")
}

type ChainSeqnoAt = Box<dyn Fn(Seqno) -> Seqno + Send + Sync>;

/// Serves one user's history over `1..=latest` roots, building each tree on demand.
pub(crate) struct MockDirectory {
    signer: SigningKey,
    username: String,
    latest: Seqno,
    chain_seqno_at: ChainSeqnoAt,
    tamper: Mutex<Option<Box<dyn Fn(&mut PathResponse) + Send + Sync>>>,
    queries: Mutex<Vec<PathQuery>>,
}

impl MockDirectory {
    pub(crate) fn new(
        signer: SigningKey,
        username: &str,
        latest: Seqno,
        chain_seqno_at: impl Fn(Seqno) -> Seqno + Send + Sync + 'static,
    ) -> Self {
        Self {
            signer,
            username: username.to_string(),
            latest,
            chain_seqno_at: Box::new(chain_seqno_at),
            tamper: Mutex::new(None),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn uid(&self) -> Uid {
        Uid::from_username(&self.username)
    }

    pub(crate) fn set_tamper(&self, tamper: impl Fn(&mut PathResponse) + Send + Sync + 'static) {
        *self.tamper.lock().expect("tamper") = Some(Box::new(tamper));
    }

    pub(crate) fn queries(&self) -> Vec<PathQuery> {
        self.queries.lock().expect("queries").clone()
    }

    /// Number of requests that named a specific root.
    pub(crate) fn historical_probes(&self) -> usize {
        self.queries()
            .iter()
            .filter(|query| query.start_seqno.is_some())
            .count()
    }

    pub(crate) fn root_at(&self, seqno: Seqno) -> MerkleRoot {
        self.response_at(seqno, None).root
    }

    fn response_at(&self, seqno: Seqno, uid: Option<Uid>) -> PathResponse {
        let me = self.uid();
        let mut leaves = vec![
            (Uid::from_username("bob").to_hex(), user_leaf(2, None)),
            (Uid::from_username("carol").to_hex(), user_leaf(9, None)),
        ];
        let chain_seqno = (self.chain_seqno_at)(seqno);
        if chain_seqno > 0 {
            leaves.push((me.to_hex(), user_leaf(chain_seqno, None)));
        }
        let main = TestTree::long(leaves);
        let legacy_key = hex::encode(Sha256::digest(self.username.to_lowercase().as_bytes()));
        let legacy = TestTree::short(vec![(legacy_key.clone(), json!(me.to_hex()))]);
        let root = signed_root(&self.signer, seqno, main.root_hash(), Some(legacy.root_hash()));
        PathResponse {
            root,
            path: uid.map(|uid| main.path(&uid.to_hex())).unwrap_or_default(),
            uid,
            uid_proof_path: legacy.path(&legacy_key),
            id_version: 1,
            username: self.username.to_lowercase(),
            username_cased: Some(self.username.clone()),
        }
    }
}

impl DirectoryService for MockDirectory {
    fn fetch_path(&self, query: &PathQuery) -> Result<PathResponse, MerkleError> {
        self.queries.lock().expect("queries").push(query.clone());
        let seqno = query.start_seqno.unwrap_or(self.latest);
        if seqno < 1 || seqno > self.latest {
            return Err(MerkleError::Server(format!("no root {seqno}")));
        }
        let uid = query
            .uid
            .or_else(|| query.username.as_ref().map(|name| Uid::from_username(name)));
        let mut response = self.response_at(seqno, uid);
        if let Some(tamper) = self.tamper.lock().expect("tamper").as_ref() {
            tamper(&mut response);
        }
        Ok(response)
    }
}
