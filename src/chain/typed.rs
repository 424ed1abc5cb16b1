// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use serde_json::Value;
use tracing::debug;

use super::{ChainError, ChainLink};
use crate::family::{ComputedKeyFamily, Delegation, KeyFamilyError};
use crate::ids::Kid;

pub use crate::family::KeyRole;

/// What a link says, keyed by its payload type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypedChainLink {
    /// Establishes the signing key as eldest.
    Eldest { kid: Kid },
    Sibkey {
        kid: Kid,
        reverse_sig: Option<String>,
    },
    Subkey {
        kid: Kid,
        parent: Kid,
        reverse_sig: Option<String>,
    },
    PgpUpdate {
        kid: Kid,
        full_hash: Option<String>,
    },
    Revoke,
    Device,
    Track,
    Untrack,
    /// Any type this crate does not interpret. Never delegates.
    Unrecognized(String),
}

impl TypedChainLink {
    pub fn from_link(link: &ChainLink) -> Result<Self, ChainError> {
        let body = link.body();
        let missing = |section: &str| ChainError::MalformedPayload {
            seqno: link.seqno(),
            message: format!("{} link without a {section} section", body.kind),
        };
        Ok(match body.kind.as_str() {
            "eldest" => Self::Eldest {
                kid: link.kid().clone(),
            },
            "sibkey" => {
                let section = body.sibkey.as_ref().ok_or_else(|| missing("sibkey"))?;
                Self::Sibkey {
                    kid: section.kid.clone(),
                    reverse_sig: section.reverse_sig.clone(),
                }
            }
            "subkey" => {
                let section = body.subkey.as_ref().ok_or_else(|| missing("subkey"))?;
                Self::Subkey {
                    kid: section.kid.clone(),
                    parent: section.parent_kid.clone(),
                    reverse_sig: section.reverse_sig.clone(),
                }
            }
            "pgp_update" => {
                let section = body
                    .pgp_update
                    .as_ref()
                    .ok_or_else(|| missing("pgp_update"))?;
                Self::PgpUpdate {
                    kid: section.kid.clone(),
                    full_hash: section.full_hash.clone(),
                }
            }
            "revoke" => Self::Revoke,
            "device" => Self::Device,
            "track" => Self::Track,
            "untrack" => Self::Untrack,
            other => {
                debug!(seqno = link.seqno(), kind = other, "unrecognized link type");
                Self::Unrecognized(other.to_string())
            }
        })
    }

    #[must_use]
    pub fn role(&self) -> KeyRole {
        match self {
            Self::Eldest { .. } | Self::Sibkey { .. } => KeyRole::Sibkey,
            Self::Subkey { .. } => KeyRole::Subkey,
            _ => KeyRole::None,
        }
    }

    /// Whether replay must check the signature before applying this link.
    #[must_use]
    pub fn modifies_keys(&self) -> bool {
        self.role() != KeyRole::None || matches!(self, Self::PgpUpdate { .. })
    }

    #[must_use]
    pub fn delegated_kid(&self) -> Option<&Kid> {
        match self {
            Self::Eldest { kid } | Self::Sibkey { kid, .. } | Self::Subkey { kid, .. } => Some(kid),
            _ => None,
        }
    }

    #[must_use]
    pub fn parent_kid(&self) -> Option<&Kid> {
        match self {
            Self::Subkey { parent, .. } => Some(parent),
            _ => None,
        }
    }

    /// The delegation this link performs, if any.
    #[must_use]
    pub fn delegation(&self, link: &ChainLink) -> Option<Delegation> {
        let kid = self.delegated_kid()?;
        Some(Delegation {
            kid: kid.clone(),
            signer: link.kid().clone(),
            sig_id: link.sig_id(),
            role: self.role(),
            parent: self.parent_kid().cloned(),
            ctime: link.ctime(),
            etime: link.etime(),
            seqno: link.seqno(),
            pgp_hash: None,
        })
    }

    /// Checks that a delegated key counter-signed its own delegation.
    ///
    /// Sibkeys always must. Subkeys must when they can sign, and a reverse
    /// signature that is present is always checked.
    pub fn verify_reverse_sig(
        &self,
        ckf: &ComputedKeyFamily,
        link: &ChainLink,
    ) -> Result<(), ChainError> {
        let (kid, reverse_sig, section) = match self {
            Self::Sibkey { kid, reverse_sig } => (kid, reverse_sig, "sibkey"),
            Self::Subkey {
                kid, reverse_sig, ..
            } => (kid, reverse_sig, "subkey"),
            _ => return Ok(()),
        };
        let key = ckf
            .catalog()
            .find_key(kid)
            .ok_or_else(|| KeyFamilyError::NoSuchKey { kid: kid.clone() })?;
        let Some(reverse_sig) = reverse_sig else {
            if section == "sibkey" || key.can_sign() {
                return Err(ChainError::ReverseSigMissing {
                    seqno: link.seqno(),
                    kid: kid.clone(),
                });
            }
            return Ok(());
        };
        let mismatch = || ChainError::ReverseSigMismatch {
            seqno: link.seqno(),
            kid: kid.clone(),
        };
        let (signed, _) = key.verify_and_extract(reverse_sig).map_err(|error| {
            debug!(seqno = link.seqno(), %kid, %error, "reverse signature rejected");
            mismatch()
        })?;
        let signed: Value = serde_json::from_slice(&signed).map_err(|_| mismatch())?;
        let mut expected = link.payload_value()?;
        match expected.pointer_mut(&format!("/body/{section}/reverse_sig")) {
            Some(slot) => *slot = Value::Null,
            None => return Err(mismatch()),
        }
        if signed != expected {
            return Err(mismatch());
        }
        Ok(())
    }
}
