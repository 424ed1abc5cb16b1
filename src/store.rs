// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::error::ErrorCategory;

/// Errors produced by local persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {key} to {path}: {source}")]
    Write {
        key: DbKey,
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {key} from {path}: {source}")]
    Read {
        key: DbKey,
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {key} at {path}: {source}")]
    Remove {
        key: DbKey,
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt alias record at {path}")]
    CorruptAlias { path: Arc<PathBuf> },
    #[error("failed to encode {key}: {message}")]
    Encode { key: DbKey, message: String },
    #[error("failed to decode {key}: {message}")]
    Decode { key: DbKey, message: String },
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Environment
    }
}

/// Namespace of a stored object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjType {
    SigChainTail,
    ChainLink,
    MerkleRoot,
}

impl ObjType {
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::SigChainTail => 0x03,
            Self::ChainLink => 0x04,
            Self::MerkleRoot => 0xf0,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x03 => Some(Self::SigChainTail),
            0x04 => Some(Self::ChainLink),
            0xf0 => Some(Self::MerkleRoot),
            _ => None,
        }
    }
}

/// Typed key: object-type byte plus a string key within that namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbKey {
    pub typ: ObjType,
    pub key: String,
}

impl DbKey {
    pub fn new(typ: ObjType, key: impl Into<String>) -> Self {
        Self {
            typ,
            key: key.into(),
        }
    }

    fn file_name(&self) -> String {
        hex::encode(self.key.as_bytes())
    }

    fn encode(&self) -> String {
        format!("{:02x}:{}", self.typ.tag(), self.key)
    }

    fn decode(raw: &str) -> Option<Self> {
        let (tag, key) = raw.split_once(':')?;
        let tag = u8::from_str_radix(tag, 16).ok()?;
        Some(Self::new(ObjType::from_tag(tag)?, key))
    }
}

impl fmt::Display for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Get/put persistence used for verified roots and trusted chain links.
///
/// Aliases are secondary keys that resolve to the object stored under the primary key.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &DbKey) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &DbKey, aliases: &[DbKey], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &DbKey) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<DbKey, Vec<u8>>,
    aliases: HashMap<DbKey, DbKey>,
}

/// Process-local store, mostly for tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &DbKey) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        if let Some(value) = state.values.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(state
            .aliases
            .get(key)
            .and_then(|primary| state.values.get(primary))
            .cloned())
    }

    fn put(&self, key: &DbKey, aliases: &[DbKey], value: &[u8]) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.values.insert(key.clone(), value.to_vec());
        for alias in aliases {
            state.aliases.insert(alias.clone(), key.clone());
        }
        Ok(())
    }

    fn delete(&self, key: &DbKey) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.values.remove(key);
        state.aliases.retain(|_, primary| primary != key);
        Ok(())
    }
}

/// Disk-backed store laid out as `objects/<type>/<key>` and `aliases/<type>/<key>`.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
    objects_dir: PathBuf,
    aliases_dir: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let objects_dir = root.join("objects");
        let aliases_dir = root.join("aliases");
        for dir in [&objects_dir, &aliases_dir] {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: Arc::new(dir.clone()),
                source,
            })?;
        }
        Ok(Self {
            root,
            objects_dir,
            aliases_dir,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &DbKey) -> PathBuf {
        self.objects_dir
            .join(format!("{:02x}", key.typ.tag()))
            .join(key.file_name())
    }

    fn alias_path(&self, key: &DbKey) -> PathBuf {
        self.aliases_dir
            .join(format!("{:02x}", key.typ.tag()))
            .join(key.file_name())
    }

    fn write_atomic(&self, key: &DbKey, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: Arc::new(parent.to_path_buf()),
                source,
            })?;
        }
        let path_arc = Arc::new(path.to_path_buf());
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|source| StoreError::Write {
            key: key.clone(),
            path: path_arc.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| StoreError::Write {
            key: key.clone(),
            path: path_arc,
            source,
        })
    }

    fn read_optional(&self, key: &DbKey, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                key: key.clone(),
                path: Arc::new(path.to_path_buf()),
                source,
            }),
        }
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &DbKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path(key);
        if let Some(bytes) = self.read_optional(key, &path)? {
            return Ok(Some(bytes));
        }
        let alias_path = self.alias_path(key);
        let Some(raw) = self.read_optional(key, &alias_path)? else {
            return Ok(None);
        };
        let primary = std::str::from_utf8(&raw)
            .ok()
            .and_then(DbKey::decode)
            .ok_or_else(|| StoreError::CorruptAlias {
                path: Arc::new(alias_path),
            })?;
        self.read_optional(&primary, &self.object_path(&primary))
    }

    fn put(&self, key: &DbKey, aliases: &[DbKey], value: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(key, &self.object_path(key), value)?;
        let target = key.encode();
        for alias in aliases {
            self.write_atomic(alias, &self.alias_path(alias), target.as_bytes())?;
        }
        Ok(())
    }

    fn delete(&self, key: &DbKey) -> Result<(), StoreError> {
        let path = self.object_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Remove {
                key: key.clone(),
                path: Arc::new(path),
                source,
            }),
        }
    }
}
