//! User-authored session metadata (tag, pin), persisted as JSON.
//!
//! Entries are keyed by session id and outlive the sessions they describe.
//! The daemon merges them into presentation snapshots and never interprets them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::MetaError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

impl SessionMeta {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && !self.pinned
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaFile {
    #[serde(default)]
    sessions: HashMap<String, SessionMeta>,
}

pub struct MetaStore {
    path: PathBuf,
    tag_max_chars: usize,
    write_lock: Mutex<()>,
}

impl MetaStore {
    pub fn new(path: PathBuf, tag_max_chars: usize) -> Self {
        Self {
            path,
            tag_max_chars,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn all(&self) -> Result<HashMap<String, SessionMeta>, MetaError> {
        Ok(load(&self.path)?.sessions)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionMeta, MetaError> {
        Ok(self.all()?.remove(session_id).unwrap_or_default())
    }

    /// Applies the given fields; absent fields are left as they are. An
    /// empty tag clears it.
    pub fn set(
        &self,
        session_id: &str,
        tag: Option<&str>,
        pinned: Option<bool>,
    ) -> Result<SessionMeta, MetaError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut file = load(&self.path)?;
        let mut entry = file.sessions.remove(session_id).unwrap_or_default();

        if let Some(tag) = tag {
            entry.tag = normalize_tag(tag, self.tag_max_chars);
        }
        if let Some(pinned) = pinned {
            entry.pinned = pinned;
        }
        if !entry.is_empty() {
            file.sessions.insert(session_id.to_string(), entry.clone());
        }
        file.sessions.retain(|_, meta| !meta.is_empty());

        save(&self.path, &file)?;
        Ok(entry)
    }
}

fn normalize_tag(tag: &str, max_chars: usize) -> Option<String> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_chars).collect::<String>().trim_end().to_string())
}

fn load(path: &Path) -> Result<MetaFile, MetaError> {
    let data = match fs_err::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(MetaFile::default()),
        Err(source) => {
            return Err(MetaError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&data).map_err(|err| MetaError::Malformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn save(path: &Path, file: &MetaFile) -> Result<(), MetaError> {
    let write_err = |source| MetaError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(write_err)?;
    }
    let payload = serde_json::to_vec_pretty(file)?;
    let tmp_path = path.with_extension("tmp");
    fs_err::write(&tmp_path, payload).map_err(write_err)?;
    fs_err::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}
