//! Per-binary persisted analysis state (spec §6). One JSON document per
//! `(binary path, module name)` pair, with each serializable component
//! (`tracer`, `protocol`, ...) stored under its own named key. Grounded on
//! `mttn::main()`'s `serde_json::to_writer` use for its own output file;
//! the keyed-component contract itself is this crate's own addition since
//! `mttn` persists nothing structured.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;

use crate::error::ArchiveError;

/// A component the archive can persist and restore by itself. Each
/// component owns its own JSON shape; the archive only threads the named
/// key through.
pub trait Archivable: Sized {
    fn to_json(&self) -> Value;
    fn from_json(value: Value) -> Result<Self, ArchiveError>;
}

/// Computes the archive key for a binary: `hash(path) ^ hash(mtime)`, per
/// spec §6. `mtime` is passed in explicitly (rather than stat'd here) so
/// the function stays pure and testable.
pub fn binary_key(path: &Path, mtime: SystemTime) -> u64 {
    let mut path_hasher = DefaultHasher::new();
    path.hash(&mut path_hasher);
    let path_hash = path_hasher.finish();

    let mut mtime_hasher = DefaultHasher::new();
    mtime.hash(&mut mtime_hasher);
    let mtime_hash = mtime_hasher.finish();

    path_hash ^ mtime_hash
}

fn archive_file_name(key: u64, module_name: &str) -> String {
    format!("{:016x}_{}.json", key, module_name)
}

/// A per-binary archive: named component keys (`plugins`, `debugger`,
/// `tracer`, `protocol`, ...) mapped to their serialized JSON. Loaded
/// lazily and saved as one document, matching spec §6's "one JSON-like
/// document per binary".
#[derive(Debug, Default, Clone)]
pub struct Archive {
    components: std::collections::BTreeMap<String, Value>,
}

impl Archive {
    pub fn new() -> Self {
        Archive::default()
    }

    pub fn put<A: Archivable>(&mut self, component: &str, value: &A) {
        self.components.insert(component.to_string(), value.to_json());
    }

    pub fn get<A: Archivable>(&self, component: &str) -> Result<Option<A>, ArchiveError> {
        match self.components.get(component) {
            Some(v) => Ok(Some(A::from_json(v.clone())?)),
            None => Ok(None),
        }
    }

    fn path_for(archive_dir: &Path, key: u64, module_name: &str) -> PathBuf {
        archive_dir.join(archive_file_name(key, module_name))
    }

    /// Loads the archive for `(key, module_name)` from `archive_dir`. A
    /// missing file is benign (spec §7): returns a fresh, empty archive.
    pub fn load(archive_dir: &Path, key: u64, module_name: &str) -> Result<Self, ArchiveError> {
        let path = Self::path_for(archive_dir, key, module_name);

        if !path.exists() {
            log::debug!("no archive at {}, starting fresh", path.display());
            return Ok(Archive::new());
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ArchiveError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let components: std::collections::BTreeMap<String, Value> =
            serde_json::from_str(&contents).map_err(|source| ArchiveError::Serde {
                component: "Archive",
                source,
            })?;

        Ok(Archive { components })
    }

    /// Saves the archive to `archive_dir`, creating the directory if
    /// needed. Fatal on failure, per spec §7's "Archive I/O failure:
    /// fatal on save".
    pub fn save(&self, archive_dir: &Path, key: u64, module_name: &str) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(archive_dir).map_err(|source| ArchiveError::Write {
            path: archive_dir.display().to_string(),
            source,
        })?;

        let path = Self::path_for(archive_dir, key, module_name);
        let json = serde_json::to_string_pretty(&self.components).map_err(|source| ArchiveError::Serde {
            component: "Archive",
            source,
        })?;

        std::fs::write(&path, json).map_err(|source| ArchiveError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}
