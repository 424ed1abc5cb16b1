// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCategory;
use crate::ids::{Kid, Seqno};

/// Tree-signing keys trusted in every run mode.
const MERKLE_PROD_KIDS: &[&str] =
    &["01206c2c653ae165d8748b16a75f74da864ca5a4e025651288423b5a69be80e7526b0a"];
/// Additional tree-signing keys trusted outside production.
const MERKLE_STAGING_KIDS: &[&str] =
    &["0120e5b04e0b80440839eb19554afbaa1ed2c9038ffd390821b68a04d20f708cbb720a"];
const MERKLE_TEST_KIDS: &[&str] =
    &["0120913b5828f5232f8394dabe86ae88cfdbf8474cae4cf01842074ca1b9f65e79b70a"];

/// First production root whose leaves carry the modern shape and signatures.
pub const FIRST_PROD_MERKLE_SEQNO_WITH_SIGS: Seqno = 796;

const DEFAULT_SERVER_UPDATE_LAG_SECS: i64 = 60;

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: Arc<PathBuf>,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(serde_json::Error),
    #[error("built-in tree-signing KID {value} is malformed")]
    InvalidBuiltinKid { value: &'static str },
    #[error("server update lag must not be negative (got {0})")]
    NegativeUpdateLag(i64),
}

impl ConfigError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Read { .. } | Self::Write { .. } => ErrorCategory::Environment,
            _ => ErrorCategory::Configuration,
        }
    }
}

/// Which server deployment this client talks to.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Production,
    Staging,
    Devel,
}

/// Static client configuration, normally read from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub run_mode: RunMode,
    /// Replaces the built-in tree-signing allow-list when set.
    pub merkle_kids: Option<Vec<Kid>>,
    /// Replaces the run-mode boundary for historical lookups when set.
    pub first_examinable_merkle_seqno: Option<Seqno>,
    /// How long a locally bumped chain tail outranks the server's view.
    pub server_update_lag_secs: i64,
    pub store_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            merkle_kids: None,
            first_examinable_merkle_seqno: None,
            server_update_lag_secs: DEFAULT_SERVER_UPDATE_LAG_SECS,
            store_dir: None,
        }
    }
}

impl Config {
    #[must_use]
    pub fn for_run_mode(run_mode: RunMode) -> Self {
        Self {
            run_mode,
            ..Self::default()
        }
    }

    /// Returns the KIDs whose signatures may anchor a Merkle root.
    pub fn tree_signing_kids(&self) -> Result<Vec<Kid>, ConfigError> {
        if let Some(kids) = &self.merkle_kids {
            return Ok(kids.clone());
        }
        let mut sources = vec![MERKLE_PROD_KIDS];
        if matches!(self.run_mode, RunMode::Staging | RunMode::Devel) {
            sources.push(MERKLE_STAGING_KIDS);
            sources.push(MERKLE_TEST_KIDS);
        }
        sources
            .into_iter()
            .flatten()
            .map(|value| {
                Kid::from_hex(value).map_err(|_| ConfigError::InvalidBuiltinKid { value })
            })
            .collect()
    }

    /// Lowest root seqno that historical lookups may request, if any.
    #[must_use]
    pub fn first_examinable_merkle_seqno(&self) -> Option<Seqno> {
        if self.first_examinable_merkle_seqno.is_some() {
            return self.first_examinable_merkle_seqno;
        }
        match self.run_mode {
            RunMode::Production => Some(FIRST_PROD_MERKLE_SEQNO_WITH_SIGS),
            RunMode::Staging | RunMode::Devel => None,
        }
    }

    pub fn server_update_lag_secs(&self) -> Result<i64, ConfigError> {
        if self.server_update_lag_secs < 0 {
            return Err(ConfigError::NegativeUpdateLag(self.server_update_lag_secs));
        }
        Ok(self.server_update_lag_secs)
    }

    /// Loads a config file; a missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: Arc::new(path.to_path_buf()),
                source,
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: Arc::new(path.to_path_buf()),
                source,
            }),
        }
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: Arc::new(path.to_path_buf()),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        let data = serde_json::to_vec_pretty(self).map_err(ConfigError::Serialize)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).map_err(write_err)?;
        fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }
}
