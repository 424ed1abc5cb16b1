// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

/// Server-reported key material for one user.
pub mod catalog;
/// PGP key bundles and their version handling.
pub mod pgp;

use std::sync::Arc;

use libp2p_identity::ed25519;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorCategory;
use crate::ids::{IdError, Kid, KidType, PgpFingerprint, SigId};

pub use catalog::{KeyCatalog, PgpKeySet, ServerKeyFamily, ServerKeyRecord};
pub use pgp::{PgpIdentity, PgpKeyBundle, PgpSubkey};

const SIG_ENVELOPE_VERSION: u8 = 1;

/// Errors raised while decoding keys or checking signatures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(String),
    #[error("unsupported signature envelope version {0}")]
    UnsupportedEnvelope(u8),
    #[error("signature names key {found} but was checked against {expected}")]
    KidMismatch { expected: Kid, found: Kid },
    #[error("signature by {kid} rejected")]
    SignatureInvalid { kid: Kid },
    #[error("signed payload differs from the expected payload")]
    PayloadMismatch,
    #[error("key {kid} cannot produce signatures")]
    CannotSign { kid: Kid },
    #[error("key {kid} has an unsupported algorithm")]
    UnsupportedKid { kid: Kid },
    #[error("key {kid} carries an invalid public key")]
    InvalidPublicKey { kid: Kid },
    #[error("invalid secret key material")]
    InvalidSecretKey,
    #[error("key bundle for {kid} could not be decoded: {message}")]
    BundleDecode { kid: Kid, message: String },
    #[error("key bundle hashes to {found}, server filed it under {expected}")]
    BundleKidMismatch { expected: Kid, found: Kid },
    #[error("no PGP version {hash} recorded for {kid}")]
    UnknownPgpVersion { kid: Kid, hash: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Id(#[from] IdError),
}

impl KeyError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CannotSign { .. } => ErrorCategory::KeyLifecycle,
            Self::InvalidSecretKey | Self::Serialization(_) => ErrorCategory::Environment,
            _ => ErrorCategory::Integrity,
        }
    }
}

/// Wire form of a signature: the signed bytes travel with the signature.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct SignatureEnvelope {
    version: u8,
    kid: Kid,
    payload: Vec<u8>,
    sig: Vec<u8>,
}

impl SignatureEnvelope {
    fn decode(sig: &str) -> Result<(Self, SigId), KeyError> {
        let bytes =
            hex::decode(sig).map_err(|error| KeyError::SignatureEncoding(error.to_string()))?;
        let envelope: Self = serde_cbor::from_slice(&bytes)
            .map_err(|error| KeyError::SignatureEncoding(error.to_string()))?;
        if envelope.version != SIG_ENVELOPE_VERSION {
            return Err(KeyError::UnsupportedEnvelope(envelope.version));
        }
        Ok((envelope, sig_id_of(&bytes)))
    }

    fn encode(&self) -> Result<(String, SigId), KeyError> {
        let bytes =
            serde_cbor::to_vec(self).map_err(|error| KeyError::Serialization(error.to_string()))?;
        Ok((hex::encode(&bytes), sig_id_of(&bytes)))
    }
}

fn sig_id_of(envelope: &[u8]) -> SigId {
    let digest = Sha256::digest(envelope);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    SigId::new(out)
}

/// Public key material that can appear in a user's key family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenericKey {
    /// Ed25519 signing key.
    NaclSigning(ed25519::PublicKey),
    /// Curve25519 encryption key. Cannot sign.
    NaclDh(x25519_dalek::PublicKey),
    Pgp(Arc<PgpKeyBundle>),
}

impl GenericKey {
    /// Reconstructs a NaCl key from its KID, which embeds the public key.
    pub fn from_kid(kid: &Kid) -> Result<Self, KeyError> {
        let bytes = kid
            .nacl_public_key()
            .ok_or_else(|| KeyError::UnsupportedKid { kid: kid.clone() })?;
        match kid.kind() {
            Some(KidType::NaclEddsa) => ed25519::PublicKey::try_from_bytes(&bytes)
                .map(Self::NaclSigning)
                .map_err(|_| KeyError::InvalidPublicKey { kid: kid.clone() }),
            Some(KidType::NaclDh) => Ok(Self::NaclDh(x25519_dalek::PublicKey::from(bytes))),
            _ => Err(KeyError::UnsupportedKid { kid: kid.clone() }),
        }
    }

    #[must_use]
    pub fn kid(&self) -> Kid {
        match self {
            Self::NaclSigning(key) => Kid::from_parts(KidType::NaclEddsa, &key.to_bytes()),
            Self::NaclDh(key) => Kid::from_parts(KidType::NaclDh, key.as_bytes()),
            Self::Pgp(bundle) => bundle.kid(),
        }
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<PgpFingerprint> {
        match self {
            Self::Pgp(bundle) => Some(*bundle.fingerprint()),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_sign(&self) -> bool {
        !matches!(self, Self::NaclDh(_))
    }

    #[must_use]
    pub fn can_encrypt(&self) -> bool {
        matches!(self, Self::NaclDh(_))
    }

    #[must_use]
    pub fn is_pgp(&self) -> bool {
        matches!(self, Self::Pgp(_))
    }

    fn verifying_key(&self) -> Result<ed25519::PublicKey, KeyError> {
        match self {
            Self::NaclSigning(key) => Ok(key.clone()),
            Self::Pgp(bundle) => bundle.primary_key(),
            Self::NaclDh(_) => Err(KeyError::CannotSign { kid: self.kid() }),
        }
    }

    /// Verifies `sig` and returns the payload it covers together with its id.
    pub fn verify_and_extract(&self, sig: &str) -> Result<(Vec<u8>, SigId), KeyError> {
        let verifying = self.verifying_key()?;
        let (envelope, sig_id) = SignatureEnvelope::decode(sig)?;
        let expected = self.kid();
        if envelope.kid != expected {
            return Err(KeyError::KidMismatch {
                expected,
                found: envelope.kid,
            });
        }
        if !verifying.verify(&envelope.payload, &envelope.sig) {
            return Err(KeyError::SignatureInvalid { kid: expected });
        }
        Ok((envelope.payload, sig_id))
    }

    /// Verifies `sig` and requires it to cover exactly `payload`.
    pub fn verify_string(&self, sig: &str, payload: &[u8]) -> Result<SigId, KeyError> {
        let (signed, sig_id) = self.verify_and_extract(sig)?;
        if signed != payload {
            return Err(KeyError::PayloadMismatch);
        }
        Ok(sig_id)
    }
}

/// Reads the signer KID out of a signature without checking it.
pub fn signature_kid(sig: &str) -> Result<Kid, KeyError> {
    SignatureEnvelope::decode(sig).map(|(envelope, _)| envelope.kid)
}

/// Computes the id of a signature without checking it.
pub fn signature_id(sig: &str) -> Result<SigId, KeyError> {
    SignatureEnvelope::decode(sig).map(|(_, sig_id)| sig_id)
}

/// Checks that `sig` covers exactly `payload`.
///
/// NaCl signatures are verified against the key embedded in their KID. PGP
/// signatures need the key material, so only the payload is checked here.
pub fn assert_payload(sig: &str, payload: &[u8]) -> Result<SigId, KeyError> {
    let (envelope, sig_id) = SignatureEnvelope::decode(sig)?;
    if envelope.kid.kind() == Some(KidType::NaclEddsa) {
        return GenericKey::from_kid(&envelope.kid)?.verify_string(sig, payload);
    }
    if envelope.payload != payload {
        return Err(KeyError::PayloadMismatch);
    }
    Ok(sig_id)
}

/// Ed25519 signing half, for NaCl device keys and PGP EdDSA primaries.
#[derive(Clone)]
pub struct SigningKey {
    keypair: ed25519::Keypair,
    public: GenericKey,
}

impl SigningKey {
    /// Wraps a keypair as a NaCl signing key.
    #[must_use]
    pub fn nacl(keypair: ed25519::Keypair) -> Self {
        let public = GenericKey::NaclSigning(keypair.public());
        Self { keypair, public }
    }

    /// Wraps a keypair as the primary of the given PGP bundle.
    pub fn pgp(keypair: ed25519::Keypair, bundle: PgpKeyBundle) -> Result<Self, KeyError> {
        let kid = bundle.kid();
        if bundle.primary_key()? != keypair.public() {
            return Err(KeyError::InvalidPublicKey { kid });
        }
        Ok(Self {
            keypair,
            public: GenericKey::Pgp(Arc::new(bundle)),
        })
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn keypair_from_seed(mut seed: [u8; 32]) -> Result<ed25519::Keypair, KeyError> {
        let secret =
            ed25519::SecretKey::try_from_bytes(&mut seed).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(ed25519::Keypair::from(secret))
    }

    #[must_use]
    pub fn kid(&self) -> Kid {
        self.public.kid()
    }

    #[must_use]
    pub fn public_key(&self) -> &GenericKey {
        &self.public
    }

    #[must_use]
    pub fn keypair(&self) -> &ed25519::Keypair {
        &self.keypair
    }

    /// Signs `payload`, returning the wire signature and its id.
    pub fn sign(&self, payload: &[u8]) -> Result<(String, SigId), KeyError> {
        SignatureEnvelope {
            version: SIG_ENVELOPE_VERSION,
            kid: self.kid(),
            payload: payload.to_vec(),
            sig: self.keypair.sign(payload),
        }
        .encode()
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid()).finish()
    }
}
