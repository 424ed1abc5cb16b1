// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

use crate::chain::ChainError;
use crate::config::ConfigError;
use crate::family::KeyFamilyError;
use crate::ids::IdError;
use crate::keys::KeyError;
use crate::merkle::MerkleError;
use crate::store::StoreError;

/// Coarse classification shared by every error in the crate.
///
/// Callers use it to tell "this identity cannot be trusted" apart from "this key is
/// simply not usable right now" without matching on individual variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Tampering or malformed data. Fatal to the load, never retried.
    Integrity,
    /// Expected key-state outcomes such as revocation or expiry.
    KeyLifecycle,
    /// Legitimate absence, distinct from a structural failure.
    NotFound,
    /// The request is outside what the configured environment supports.
    Configuration,
    /// Local storage or transport failures reported by collaborators.
    Environment,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Integrity => "integrity",
            Self::KeyLifecycle => "key-lifecycle",
            Self::NotFound => "not-found",
            Self::Configuration => "configuration",
            Self::Environment => "environment",
        };
        f.write_str(label)
    }
}

/// Umbrella error for callers that drive several subsystems at once.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    KeyFamily(#[from] KeyFamilyError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Id(_) => ErrorCategory::Integrity,
            Self::Key(error) => error.category(),
            Self::KeyFamily(error) => error.category(),
            Self::Chain(error) => error.category(),
            Self::Merkle(error) => error.category(),
            Self::Store(error) => error.category(),
            Self::Config(error) => error.category(),
        }
    }
}
