// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Deterministic chain fixtures shared by the chain and replay tests.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{ChainLink, ServerLink};
use crate::family::Device;
use crate::ids::{Kid, LinkId, Seqno, SigId, Uid};
use crate::keys::{GenericKey, KeyCatalog, SigningKey};

pub(crate) fn catalog(keys: &[GenericKey]) -> Arc<KeyCatalog> {
    let mut catalog = KeyCatalog::new();
    for key in keys {
        catalog.insert(key.clone()).expect("insert key");
    }
    Arc::new(catalog)
}

/// Builds a correctly signed and linked chain for one user.
pub(crate) struct ChainBuilder {
    username: String,
    uid: Uid,
    eldest: Option<Kid>,
    prev: Option<LinkId>,
    ctime: i64,
    expire_in: i64,
    skipped: Seqno,
    links: Vec<ServerLink>,
}

impl ChainBuilder {
    pub(crate) fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            uid: Uid::from_username(username),
            eldest: None,
            prev: None,
            ctime: 1_000,
            expire_in: 0,
            skipped: 0,
            links: Vec::new(),
        }
    }

    pub(crate) fn signer(seed: u8) -> SigningKey {
        SigningKey::nacl(SigningKey::keypair_from_seed([seed; 32]).expect("keypair"))
    }

    pub(crate) fn dh(seed: u8) -> GenericKey {
        GenericKey::NaclDh(x25519_dalek::PublicKey::from([seed; 32]))
    }

    pub(crate) fn uid(&self) -> Uid {
        self.uid
    }

    /// Applies to links pushed from now on.
    pub(crate) fn set_expire_in(&mut self, expire_in: i64) {
        self.expire_in = expire_in;
    }

    pub(crate) fn next_ctime(&self) -> i64 {
        self.ctime
    }

    fn next_seqno(&self) -> Seqno {
        Seqno::try_from(self.links.len()).expect("seqno") + 1 + self.skipped
    }

    /// Leaves a hole in the seqno sequence while keeping `prev` intact.
    pub(crate) fn skip_seqno(&mut self) {
        self.skipped += 1;
    }

    /// Gives the next link an arbitrary seqno while keeping `prev` intact.
    pub(crate) fn set_next_seqno(&mut self, seqno: Seqno) {
        let pushed = Seqno::try_from(self.links.len()).expect("seqno");
        self.skipped = seqno - pushed - 1;
    }

    fn payload(&self, signer: &Kid, mut body: Value) -> Value {
        let mut key = json!({
            "kid": signer,
            "uid": self.uid,
            "username": self.username,
        });
        if let Some(eldest) = &self.eldest {
            key["eldest_kid"] = json!(eldest);
        }
        body["key"] = key;
        json!({
            "body": body,
            "ctime": self.ctime,
            "expire_in": self.expire_in,
            "prev": self.prev,
            "seqno": self.next_seqno(),
        })
    }

    fn push(&mut self, signer: &SigningKey, payload: &Value) -> SigId {
        let payload_json = payload.to_string();
        let (sig, sig_id) = signer.sign(payload_json.as_bytes()).expect("sign");
        let id = LinkId::of_payload(payload_json.as_bytes());
        self.links.push(ServerLink {
            seqno: self.next_seqno(),
            payload_hash: id,
            sig,
            sig_id: Some(sig_id),
            kid: signer.kid(),
            payload_json,
        });
        self.prev = Some(id);
        self.ctime += 10;
        sig_id
    }

    /// Pushes a link whose body is given verbatim apart from the key section.
    pub(crate) fn push_body(&mut self, signer: &SigningKey, body: Value) -> SigId {
        let payload = self.payload(&signer.kid(), body);
        self.push(signer, &payload)
    }

    pub(crate) fn eldest(&mut self, key: &SigningKey) -> SigId {
        self.eldest = Some(key.kid());
        self.push_body(key, json!({ "type": "eldest", "version": 1 }))
    }

    fn reverse_signed(
        &mut self,
        signer: &SigningKey,
        delegated: &SigningKey,
        body: Value,
        section: &str,
    ) -> SigId {
        let mut payload = self.payload(&signer.kid(), body);
        payload["body"][section]["reverse_sig"] = Value::Null;
        let (reverse, _) = delegated
            .sign(payload.to_string().as_bytes())
            .expect("reverse sign");
        payload["body"][section]["reverse_sig"] = json!(reverse);
        self.push(signer, &payload)
    }

    pub(crate) fn sibkey(&mut self, signer: &SigningKey, new: &SigningKey) -> SigId {
        let body = json!({
            "type": "sibkey",
            "sibkey": { "kid": new.kid(), "reverse_sig": null },
        });
        self.reverse_signed(signer, new, body, "sibkey")
    }

    pub(crate) fn sibkey_with_device(
        &mut self,
        signer: &SigningKey,
        new: &SigningKey,
        device: &Device,
    ) -> SigId {
        let body = json!({
            "type": "sibkey",
            "sibkey": { "kid": new.kid(), "reverse_sig": null },
            "device": device,
        });
        self.reverse_signed(signer, new, body, "sibkey")
    }

    pub(crate) fn sibkey_without_reverse_sig(
        &mut self,
        signer: &SigningKey,
        new: &SigningKey,
    ) -> SigId {
        self.push_body(
            signer,
            json!({ "type": "sibkey", "sibkey": { "kid": new.kid() } }),
        )
    }

    pub(crate) fn subkey(&mut self, signer: &SigningKey, subkey: &GenericKey) -> SigId {
        self.push_body(
            signer,
            json!({
                "type": "subkey",
                "subkey": { "kid": subkey.kid(), "parent_kid": signer.kid() },
            }),
        )
    }

    pub(crate) fn revoke(&mut self, signer: &SigningKey, sig_ids: &[SigId], kids: &[Kid]) -> SigId {
        self.push_body(
            signer,
            json!({
                "type": "revoke",
                "revoke": { "sig_ids": sig_ids, "kids": kids },
            }),
        )
    }

    pub(crate) fn track(&mut self, signer: &SigningKey) -> SigId {
        self.push_body(
            signer,
            json!({ "type": "track", "track": { "basics": { "username": "bob" } } }),
        )
    }

    pub(crate) fn pgp_update(&mut self, signer: &SigningKey, kid: &Kid, full_hash: &str) -> SigId {
        self.push_body(
            signer,
            json!({
                "type": "pgp_update",
                "pgp_update": { "kid": kid, "full_hash": full_hash },
            }),
        )
    }

    pub(crate) fn server_links(&self) -> Vec<ServerLink> {
        self.links.clone()
    }

    pub(crate) fn links(&self) -> Vec<ChainLink> {
        self.links
            .iter()
            .cloned()
            .map(ChainLink::import)
            .collect::<Result<_, _>>()
            .expect("import links")
    }
}
