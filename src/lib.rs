// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Client-side verification of user sigchains and the Merkle directory that anchors them.
//!
//! A [`SigChain`] is replayed link by link into a [`family::ComputedKeyFamily`], and a
//! [`MerkleClient`] proves the chain tail the server claims for a user against a signed
//! tree root. Every operation takes a [`Context`] carrying configuration, the local
//! store and the clock.

/// Sigchain links, per-link checks, replay and chain tails.
pub mod chain;
/// Run mode, tree-signing allow-list and timing knobs.
pub mod config;
/// Explicit environment handed to every operation.
pub mod context;
/// Error taxonomy shared by all modules.
pub mod error;
/// Computed key family and point-in-time key queries.
pub mod family;
/// Fixed-width identifiers with hex encodings.
pub mod ids;
/// Public keys, signature envelopes and the server key catalog.
pub mod keys;
/// Merkle roots, paths and the directory client.
pub mod merkle;
/// Typed local key-value storage.
pub mod store;

pub use chain::{verify_subchain, ChainError, ChainLink, SigChain};
pub use config::{Config, RunMode};
pub use context::Context;
pub use error::{Error, ErrorCategory};
pub use family::ComputedKeyFamily;
pub use keys::catalog::KeyCatalog;
pub use merkle::{find_first_leaf_with_chain_seqno, DirectoryService, MerkleClient, MerkleError};
