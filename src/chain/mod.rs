// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

/// One signed statement and its per-link checks.
pub mod link;
/// Folding a subchain into a computed key family.
pub mod replay;
/// Ordered chains, tails and storage.
pub mod sigchain;
/// Closed interpretation of link payload types.
pub mod typed;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::ErrorCategory;
use crate::family::KeyFamilyError;
use crate::ids::{Kid, LinkId, Seqno};
use crate::keys::KeyError;
use crate::store::StoreError;

pub use link::{ChainLink, ServerLink};
pub use replay::{verify_subchain, SubchainReplay};
pub use sigchain::SigChain;
pub use typed::TypedChainLink;

/// Errors raised while loading or replaying a sigchain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("link {seqno} hashes to {computed}, expected {expected}")]
    HashMismatch {
        seqno: Seqno,
        expected: LinkId,
        computed: LinkId,
    },
    #[error("signature on link {seqno} is invalid: {source}")]
    SignatureInvalid {
        seqno: Seqno,
        #[source]
        source: KeyError,
    },
    #[error("signature on link {seqno} covers a different payload")]
    PayloadMismatch { seqno: Seqno },
    #[error("link {seqno} declares signature id {declared}, signature hashes to {computed}")]
    SigIdMismatch {
        seqno: Seqno,
        declared: String,
        computed: String,
    },
    #[error("link {seqno}: server KID {server} differs from payload KID {payload}")]
    KeyFamilyMismatch {
        seqno: Seqno,
        server: Kid,
        payload: Kid,
    },
    #[error("link {seqno}: payload fingerprint does not match the signing key")]
    FingerprintMismatch { seqno: Seqno },
    #[error("chain broken at seqno {seqno}: prev does not match the previous link id")]
    ChainBroken { seqno: Seqno },
    #[error("chain seqno mismatch at {seqno} (previous={previous})")]
    WrongSeqno { seqno: Seqno, previous: Seqno },
    #[error("link {seqno} belongs to a different {field}")]
    IdentityMismatch { seqno: Seqno, field: &'static str },
    #[error("link {seqno} has a malformed payload: {message}")]
    MalformedPayload { seqno: Seqno, message: String },
    #[error("link {seqno} delegates {kid} without the required reverse signature")]
    ReverseSigMissing { seqno: Seqno, kid: Kid },
    #[error("reverse signature on link {seqno} by {kid} does not match the link")]
    ReverseSigMismatch { seqno: Seqno, kid: Kid },
    #[error("cannot replay an empty subchain")]
    EmptySubchain,
    #[error("chain starts at seqno {first}, expected 1")]
    MissingPrefix { first: Seqno },
    #[error("server claims the user is absent but we hold links up to {local}")]
    UserAbsent { local: Seqno },
    #[error("server version rollback suspected: local {local} > server {server}")]
    Rollback { local: Seqno, server: Seqno },
    #[error("server returned the wrong sigchain tail at seqno {seqno}")]
    WrongTail { seqno: Seqno },
    #[error("stored link {id} is corrupt: {message}")]
    CorruptStoredLink { id: LinkId, message: String },
    #[error("stored link {id} is missing")]
    MissingStoredLink { id: LinkId },
    #[error(transparent)]
    KeyFamily(#[from] KeyFamilyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ChainError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::KeyFamily(error) => error.category(),
            Self::Store(error) => error.category(),
            Self::Config(error) => error.category(),
            Self::MissingStoredLink { .. } => ErrorCategory::NotFound,
            _ => ErrorCategory::Integrity,
        }
    }
}
