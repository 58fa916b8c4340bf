//! Durable record of an in-flight re-key job.
//!
//! The journal lives at the vault root as `.notevault-rekey.json` and maps
//! each note's path (relative to the root) to its status. It is rewritten
//! atomically after every file, so after a crash it tells exactly which notes
//! still need the transform.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    fs::store::{NoteStore, StoreError},
    vault::config::VaultConfig,
};

/// Name of the journal file at the vault root.
pub const JOURNAL_FILE_NAME: &str = ".notevault-rekey.json";

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Failed to access re-key journal: {0}")]
    Store(#[from] StoreError),

    #[error("Corrupt re-key journal: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The transform a job applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReKeyOperation {
    Encrypt,
    Decrypt,
    ReEncrypt,
}

impl ReKeyOperation {
    /// Where results go unless the caller overrides it.
    pub fn default_output(self) -> OutputMode {
        match self {
            ReKeyOperation::Encrypt | ReKeyOperation::Decrypt => OutputMode::Sibling,
            ReKeyOperation::ReEncrypt => OutputMode::InPlace,
        }
    }

    /// Suffix appended to sibling outputs.
    pub fn sibling_suffix(self) -> &'static str {
        match self {
            ReKeyOperation::Encrypt | ReKeyOperation::ReEncrypt => ".encrypted",
            ReKeyOperation::Decrypt => ".decrypted",
        }
    }
}

/// Where a transformed note is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Next to the original as `<name>.encrypted` or `<name>.decrypted`.
    Sibling,
    /// Over the original, via temp file and rename.
    InPlace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReKeyJournal {
    pub job_id: Uuid,
    pub operation: ReKeyOperation,
    pub output: OutputMode,
    /// Configuration the vault moves to once every entry is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<VaultConfig>,
    pub entries: BTreeMap<String, EntryStatus>,
}

/// Journal key for `path`: its location relative to `root`, `/`-separated.
///
/// `None` when a component is not valid UTF-8; such a path has no key that
/// maps back to it.
pub fn entry_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("/"))
}

impl ReKeyJournal {
    pub fn new<'a>(
        job_id: Uuid,
        operation: ReKeyOperation,
        output: OutputMode,
        root: &Path,
        files: impl IntoIterator<Item = &'a PathBuf>,
    ) -> Self {
        let entries = files
            .into_iter()
            .filter_map(|path| entry_key(root, path).map(|key| (key, EntryStatus::Pending)))
            .collect();
        Self {
            job_id,
            operation,
            output,
            target: None,
            entries,
        }
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(JOURNAL_FILE_NAME)
    }

    pub fn load(store: &dyn NoteStore, root: &Path) -> Result<Option<Self>, JournalError> {
        let bytes = match store.read(&Self::path(root)) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let journal: Self = serde_json::from_slice(&bytes)?;
        debug!(job_id = %journal.job_id, entries = journal.entries.len(), "Loaded re-key journal");
        Ok(Some(journal))
    }

    pub fn save(&self, store: &dyn NoteStore, root: &Path) -> Result<(), JournalError> {
        let json = serde_json::to_vec_pretty(self)?;
        store.write(&Self::path(root), &json)?;
        trace!(job_id = %self.job_id, "Saved re-key journal");
        Ok(())
    }

    /// Delete the journal file, if there is one.
    pub fn remove(store: &dyn NoteStore, root: &Path) -> Result<(), JournalError> {
        match store.remove(&Self::path(root)) {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub fn mark(&mut self, key: &str, status: EntryStatus) {
        if let Some(entry) = self.entries.get_mut(key) {
            *entry = status;
        }
    }

    pub fn status(&self, key: &str) -> Option<EntryStatus> {
        self.entries.get(key).copied()
    }

    /// Absolute paths of every entry not yet done.
    pub fn remaining(&self, root: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter(|(_, status)| **status != EntryStatus::Done)
            .map(|(key, _)| root.join(key))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.values().all(|s| *s == EntryStatus::Done)
    }
}
