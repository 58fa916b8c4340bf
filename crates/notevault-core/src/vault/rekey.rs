//! Bulk re-keying of every note under a vault root.
//!
//! Used when a vault gains a password (encrypt), loses it (decrypt) or
//! changes it (re-encrypt). Each file is processed independently: a failure
//! on one note is recorded in the [`ReKeyReport`] and the walk continues.
//! Only a failure to enumerate the tree aborts the job.
//!
//! For every note the engine reads the original, builds the new content,
//! verifies it opens back to the same plaintext, then writes it through the
//! [`NoteStore`] (temp file plus rename for the local store). With journaling
//! enabled the per-file status is persisted after each note, so an interrupted
//! job can be finished with [`BulkReKeyEngine::resume`].

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    crypto::keys::MasterKey,
    fs::{
        envelope::{EnvelopeCipher, EnvelopeError, FileContext, NoteContent},
        store::{LocalNoteStore, NoteStore, StoreError, is_temp_file_name},
    },
    vault::{
        config::{CONFIG_FILE_NAME, VaultConfig},
        journal::{
            EntryStatus, JOURNAL_FILE_NAME, JournalError, OutputMode, ReKeyJournal,
            ReKeyOperation, entry_key,
        },
    },
};

/// Default bound on concurrently processed files.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Error, Debug)]
pub enum ReKeyError {
    /// Enumerating the tree failed. Nothing after the failure was processed.
    #[error("Failed to walk vault: {0}")]
    Walk(#[source] StoreError),

    /// A key could not be turned into a cipher. Raised before any file I/O.
    #[error("Invalid re-key key: {0}")]
    Key(#[from] EnvelopeError),

    #[error("Re-key journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Failed to build re-key worker pool: {0}")]
    ThreadPool(String),

    /// `resume` was called without a key the journaled operation needs.
    #[error("Resuming a {operation:?} job requires the {role} key")]
    MissingKey {
        operation: ReKeyOperation,
        role: &'static str,
    },

    /// Returned by [`ReKeyReport::into_result`].
    #[error("Re-key incomplete: {failed} file(s) failed (cancelled: {cancelled})")]
    Incomplete {
        failed: usize,
        cancelled: bool,
        report: Box<ReKeyReport>,
    },
}

/// Why a single note could not be transformed.
#[derive(Error, Debug)]
pub enum FileFailure {
    #[error("read failed: {0}")]
    Read(#[source] StoreError),

    #[error("{0}")]
    Decrypt(#[source] EnvelopeError),

    #[error("{0}")]
    Encrypt(#[source] EnvelopeError),

    /// The new content did not open back to the original plaintext.
    #[error("round-trip verification failed")]
    Verification,

    /// Note is encrypted but the job has no key to open it.
    #[error("content is encrypted but no old key was supplied")]
    MissingOldKey,

    #[error("write failed: {0}")]
    Write(#[source] StoreError),

    /// The path relative to the root is not valid UTF-8 and cannot be journaled.
    #[error("path is not valid UTF-8")]
    UnsupportedName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Encrypt job, note already in envelope form.
    AlreadyEncrypted,
    /// Decrypt job, note already plaintext.
    NotEncrypted,
    /// Re-encrypt job, note already opens under the new key.
    AlreadyCurrentKey,
}

#[derive(Debug)]
pub enum FileStatus {
    Transformed,
    Skipped(SkipReason),
    Failed(FileFailure),
}

#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    /// Where the new content was written, when it was.
    pub output: Option<PathBuf>,
    pub status: FileStatus,
}

impl FileOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, FileStatus::Failed(_))
    }
}

/// Per-file result of a re-key job.
#[derive(Debug)]
pub struct ReKeyReport {
    pub job_id: Uuid,
    pub operation: ReKeyOperation,
    pub output: OutputMode,
    /// Outcomes in walk order. Files never reached are absent.
    pub outcomes: Vec<FileOutcome>,
    /// The job stopped before reaching every file, on request or fail-fast.
    pub cancelled: bool,
}

impl ReKeyReport {
    pub fn transformed(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FileStatus::Transformed))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FileStatus::Skipped(_)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn failed_paths(&self) -> Vec<&Path> {
        self.failed().map(|o| o.path.as_path()).collect()
    }

    /// No failures and every file was reached.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed().next().is_none()
    }

    /// Convert a report with failures into an error.
    pub fn into_result(self) -> Result<Self, ReKeyError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(ReKeyError::Incomplete {
                failed: self.failed().count(),
                cancelled: self.cancelled,
                report: Box::new(self),
            })
        }
    }
}

/// Tuning for a re-key job.
#[derive(Debug, Clone)]
pub struct ReKeyOptions {
    /// Output mode override. `None` uses the operation's default.
    pub output: Option<OutputMode>,
    pub max_parallel: usize,
    /// Checked between files; set it to stop the job.
    pub cancel: Arc<AtomicBool>,
    /// Stop scheduling new files after the first failure.
    pub fail_fast: bool,
    pub journal: bool,
    /// Reopen new content before writing it.
    pub verify: bool,
    /// Recorded in the journal for the vault facade.
    pub target: Option<VaultConfig>,
    /// Leave a completed journal on disk for the caller to remove.
    pub retain_journal: bool,
}

impl Default for ReKeyOptions {
    fn default() -> Self {
        Self {
            output: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
            cancel: Arc::new(AtomicBool::new(false)),
            fail_fast: false,
            journal: true,
            verify: true,
            target: None,
            retain_journal: false,
        }
    }
}

impl ReKeyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: bool) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: VaultConfig) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn with_retained_journal(mut self, retain: bool) -> Self {
        self.retain_journal = retain;
        self
    }

    /// A flag that cancels this job when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

enum Transform {
    Encrypt { new: EnvelopeCipher },
    Decrypt { old: EnvelopeCipher },
    ReEncrypt { old: Option<EnvelopeCipher>, new: EnvelopeCipher },
}

impl Transform {
    fn operation(&self) -> ReKeyOperation {
        match self {
            Transform::Encrypt { .. } => ReKeyOperation::Encrypt,
            Transform::Decrypt { .. } => ReKeyOperation::Decrypt,
            Transform::ReEncrypt { .. } => ReKeyOperation::ReEncrypt,
        }
    }

    fn build(
        operation: ReKeyOperation,
        old_key: Option<&MasterKey>,
        new_key: Option<&MasterKey>,
    ) -> Result<Self, ReKeyError> {
        let cipher = |key: Option<&MasterKey>, role| {
            key.ok_or(ReKeyError::MissingKey { operation, role })
                .and_then(|k| Ok(EnvelopeCipher::from_master_key(k)?))
        };
        Ok(match operation {
            ReKeyOperation::Encrypt => Transform::Encrypt {
                new: cipher(new_key, "new")?,
            },
            ReKeyOperation::Decrypt => Transform::Decrypt {
                old: cipher(old_key, "old")?,
            },
            ReKeyOperation::ReEncrypt => Transform::ReEncrypt {
                old: old_key.map(EnvelopeCipher::from_master_key).transpose()?,
                new: cipher(new_key, "new")?,
            },
        })
    }

    /// New content for `bytes`, or why none is needed.
    fn apply(
        &self,
        bytes: &[u8],
        verify: bool,
        context: &FileContext,
    ) -> Result<Result<Vec<u8>, SkipReason>, FileFailure> {
        let content = NoteContent::classify(bytes);
        match self {
            Transform::Encrypt { new } => {
                if content.is_envelope() {
                    return Ok(Err(SkipReason::AlreadyEncrypted));
                }
                seal(new, bytes, verify, context).map(Ok)
            }
            Transform::Decrypt { old } => {
                if !content.is_envelope() {
                    return Ok(Err(SkipReason::NotEncrypted));
                }
                let plaintext = old
                    .decrypt_with_context(bytes, None, context)
                    .map_err(FileFailure::Decrypt)?;
                // Plaintext that itself looks like an envelope cannot be stored as is
                if verify && NoteContent::classify(&plaintext).is_envelope() {
                    return Err(FileFailure::Verification);
                }
                Ok(Ok(plaintext))
            }
            Transform::ReEncrypt { old, new } => {
                if !content.is_envelope() {
                    return seal(new, bytes, verify, context).map(Ok);
                }
                if new.decrypt(bytes, None).is_ok() {
                    return Ok(Err(SkipReason::AlreadyCurrentKey));
                }
                let old = old.as_ref().ok_or(FileFailure::MissingOldKey)?;
                let plaintext = zeroize::Zeroizing::new(
                    old.decrypt_with_context(bytes, None, context)
                        .map_err(FileFailure::Decrypt)?,
                );
                seal(new, &plaintext, verify, context).map(Ok)
            }
        }
    }
}

fn seal(
    cipher: &EnvelopeCipher,
    plaintext: &[u8],
    verify: bool,
    context: &FileContext,
) -> Result<Vec<u8>, FileFailure> {
    let sealed = cipher
        .encrypt_with_context(plaintext, None, context)
        .map_err(FileFailure::Encrypt)?;
    if verify {
        match cipher.decrypt(&sealed, None) {
            Ok(reopened) if reopened == plaintext => {}
            _ => return Err(FileFailure::Verification),
        }
    }
    Ok(sealed)
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Whether a walk writing to `output` must leave `path` alone.
///
/// Vault metadata and temp files from interrupted writes are never
/// transformed. Names ending in a sibling suffix are skipped by sibling jobs
/// only; an in-place job reaches every note.
pub fn is_excluded(path: &Path, output: OutputMode) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name == CONFIG_FILE_NAME || name == JOURNAL_FILE_NAME || is_temp_file_name(name) {
        return true;
    }
    output == OutputMode::Sibling
        && (name.ends_with(ReKeyOperation::Encrypt.sibling_suffix())
            || name.ends_with(ReKeyOperation::Decrypt.sibling_suffix()))
}

/// Applies envelope transforms to every note under a root.
///
/// # Example
///
/// ```
/// use notevault_core::crypto::keys::MasterKey;
/// use notevault_core::fs::envelope::EnvelopeCipher;
/// use notevault_core::vault::rekey::BulkReKeyEngine;
///
/// let dir = tempfile::tempdir().unwrap();
/// std::fs::write(dir.path().join("note.md"), b"# hello").unwrap();
///
/// let key = MasterKey::generate();
/// let report = BulkReKeyEngine::local().re_encrypt_files(None, &key, dir.path()).unwrap();
/// assert!(report.is_complete());
///
/// let stored = std::fs::read(dir.path().join("note.md")).unwrap();
/// let cipher = EnvelopeCipher::from_master_key(&key).unwrap();
/// assert_eq!(cipher.decrypt(&stored, None).unwrap(), b"# hello");
/// ```
#[derive(Clone)]
pub struct BulkReKeyEngine {
    store: Arc<dyn NoteStore>,
}

impl BulkReKeyEngine {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self { store }
    }

    /// Engine over the local filesystem.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalNoteStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn NoteStore> {
        &self.store
    }

    /// Encrypt every plaintext note into a sibling `<name>.encrypted`.
    pub fn encrypt_files(&self, new_key: &MasterKey, root: &Path) -> Result<ReKeyReport, ReKeyError> {
        self.encrypt_files_with(new_key, root, &ReKeyOptions::default())
    }

    pub fn encrypt_files_with(
        &self,
        new_key: &MasterKey,
        root: &Path,
        options: &ReKeyOptions,
    ) -> Result<ReKeyReport, ReKeyError> {
        let transform = Transform::build(ReKeyOperation::Encrypt, None, Some(new_key))?;
        self.start(transform, root, options)
    }

    /// Decrypt every envelope into a sibling `<name>.decrypted`.
    pub fn decrypt_files(&self, old_key: &MasterKey, root: &Path) -> Result<ReKeyReport, ReKeyError> {
        self.decrypt_files_with(old_key, root, &ReKeyOptions::default())
    }

    pub fn decrypt_files_with(
        &self,
        old_key: &MasterKey,
        root: &Path,
        options: &ReKeyOptions,
    ) -> Result<ReKeyReport, ReKeyError> {
        let transform = Transform::build(ReKeyOperation::Decrypt, Some(old_key), None)?;
        self.start(transform, root, options)
    }

    /// Re-encrypt every note under `new_key`, overwriting the original.
    ///
    /// With `old_key` of `None` the vault is assumed to hold plaintext notes.
    /// Notes that already open under `new_key` are skipped, so rerunning an
    /// interrupted job is safe.
    pub fn re_encrypt_files(
        &self,
        old_key: Option<&MasterKey>,
        new_key: &MasterKey,
        root: &Path,
    ) -> Result<ReKeyReport, ReKeyError> {
        self.re_encrypt_files_with(old_key, new_key, root, &ReKeyOptions::default())
    }

    pub fn re_encrypt_files_with(
        &self,
        old_key: Option<&MasterKey>,
        new_key: &MasterKey,
        root: &Path,
        options: &ReKeyOptions,
    ) -> Result<ReKeyReport, ReKeyError> {
        let transform = Transform::build(ReKeyOperation::ReEncrypt, old_key, Some(new_key))?;
        self.start(transform, root, options)
    }

    /// The journal of an interrupted job, if one is on disk.
    pub fn pending_job(&self, root: &Path) -> Result<Option<ReKeyJournal>, ReKeyError> {
        Ok(ReKeyJournal::load(self.store.as_ref(), root)?)
    }

    /// Delete the journal without finishing its job.
    pub fn discard_journal(&self, root: &Path) -> Result<(), ReKeyError> {
        Ok(ReKeyJournal::remove(self.store.as_ref(), root)?)
    }

    /// Finish an interrupted job from its journal.
    ///
    /// Every entry not marked done is processed again with the journaled
    /// operation and output mode. Returns `None` when there is no journal.
    #[instrument(level = "debug", skip(self, old_key, new_key, options))]
    pub fn resume(
        &self,
        root: &Path,
        old_key: Option<&MasterKey>,
        new_key: Option<&MasterKey>,
        options: &ReKeyOptions,
    ) -> Result<Option<ReKeyReport>, ReKeyError> {
        let Some(journal) = self.pending_job(root)? else {
            return Ok(None);
        };
        info!(job_id = %journal.job_id, operation = ?journal.operation, "Resuming re-key job");

        let transform = Transform::build(journal.operation, old_key, new_key)?;
        let files = journal.remaining(root);
        let options = ReKeyOptions {
            output: Some(journal.output),
            journal: true,
            ..options.clone()
        };
        self.run(&transform, root, files, Some(journal), &options)
            .map(Some)
    }

    /// Undo the in-place writes of `report`.
    ///
    /// Transformed notes are put back under their previous key (or back to
    /// plaintext); sibling outputs are deleted. `old_key` and `new_key` are
    /// the keys the original job ran with. Journaling is off for the revert
    /// itself, but when the job's journal is still on disk every restored note
    /// goes back to pending so a later resume transforms it again.
    #[instrument(level = "debug", skip_all, fields(job_id = %report.job_id))]
    pub fn revert(
        &self,
        report: &ReKeyReport,
        old_key: Option<&MasterKey>,
        new_key: Option<&MasterKey>,
        root: &Path,
    ) -> Result<ReKeyReport, ReKeyError> {
        let transformed: Vec<&FileOutcome> = report.transformed().collect();
        if report.output == OutputMode::Sibling {
            let mut restored = Vec::new();
            let outcomes = transformed
                .into_iter()
                .filter_map(|o| o.output.clone().map(|sibling| (&o.path, sibling)))
                .map(|(original, sibling)| {
                    let status = match self.store.remove(&sibling) {
                        Err(e) if !e.is_not_found() => FileStatus::Failed(FileFailure::Write(e)),
                        _ => {
                            restored.push(original.clone());
                            FileStatus::Transformed
                        }
                    };
                    FileOutcome {
                        path: sibling,
                        output: None,
                        status,
                    }
                })
                .collect();
            self.reopen_entries(report.job_id, root, &restored)?;
            return Ok(ReKeyReport {
                job_id: Uuid::new_v4(),
                operation: report.operation,
                output: OutputMode::Sibling,
                outcomes,
                cancelled: false,
            });
        }

        let inverse = match (report.operation, old_key) {
            (ReKeyOperation::Encrypt, _) | (ReKeyOperation::ReEncrypt, None) => {
                Transform::build(ReKeyOperation::Decrypt, new_key, None)?
            }
            (ReKeyOperation::Decrypt, _) => Transform::build(ReKeyOperation::Encrypt, None, old_key)?,
            (ReKeyOperation::ReEncrypt, Some(old)) => {
                Transform::build(ReKeyOperation::ReEncrypt, new_key, Some(old))?
            }
        };
        let files = transformed.into_iter().map(|o| o.path.clone()).collect();
        let options = ReKeyOptions::default()
            .with_output(OutputMode::InPlace)
            .with_journal(false);
        let revert = self.run(&inverse, root, files, None, &options)?;

        // A skip means the note was already back in its previous form
        let restored: Vec<PathBuf> = revert
            .outcomes
            .iter()
            .filter(|o| !o.is_failed())
            .map(|o| o.path.clone())
            .collect();
        self.reopen_entries(report.job_id, root, &restored)?;
        Ok(revert)
    }

    /// Mark `paths` pending again in the journal of job `job_id`, if present.
    fn reopen_entries(&self, job_id: Uuid, root: &Path, paths: &[PathBuf]) -> Result<(), ReKeyError> {
        let Some(mut journal) = self.pending_job(root)? else {
            return Ok(());
        };
        if journal.job_id != job_id || paths.is_empty() {
            return Ok(());
        }
        for path in paths {
            if let Some(key) = entry_key(root, path) {
                journal.mark(&key, EntryStatus::Pending);
            }
        }
        journal.save(self.store.as_ref(), root)?;
        debug!(%job_id, reopened = paths.len(), "Reverted entries marked pending");
        Ok(())
    }

    fn start(
        &self,
        transform: Transform,
        root: &Path,
        options: &ReKeyOptions,
    ) -> Result<ReKeyReport, ReKeyError> {
        let output = options
            .output
            .unwrap_or_else(|| transform.operation().default_output());
        let files: Vec<PathBuf> = self
            .store
            .walk(root)
            .map_err(ReKeyError::Walk)?
            .into_iter()
            .filter(|p| !is_excluded(p, output))
            .collect();
        self.run(&transform, root, files, None, options)
    }

    #[instrument(level = "debug", skip_all, fields(operation = ?transform.operation(), files = files.len()))]
    fn run(
        &self,
        transform: &Transform,
        root: &Path,
        files: Vec<PathBuf>,
        journal: Option<ReKeyJournal>,
        options: &ReKeyOptions,
    ) -> Result<ReKeyReport, ReKeyError> {
        let operation = transform.operation();
        let output = options
            .output
            .unwrap_or_else(|| operation.default_output());

        let journal = match journal {
            Some(journal) => Some(journal),
            None if options.journal => {
                let mut journal =
                    ReKeyJournal::new(Uuid::new_v4(), operation, output, root, &files);
                journal.target.clone_from(&options.target);
                journal.save(self.store.as_ref(), root)?;
                Some(journal)
            }
            None => None,
        };
        let job_id = journal.as_ref().map_or_else(Uuid::new_v4, |j| j.job_id);
        let journal = journal.map(Mutex::new);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_parallel.max(1))
            .thread_name(|i| format!("notevault-rekey-{i}"))
            .build()
            .map_err(|e| ReKeyError::ThreadPool(e.to_string()))?;

        let stop = AtomicBool::new(false);
        let outcomes: Vec<Option<FileOutcome>> = pool.install(|| {
            files
                .par_iter()
                .map(|path| {
                    if options.cancel.load(Ordering::Relaxed) || stop.load(Ordering::Relaxed) {
                        return None;
                    }
                    let outcome = if entry_key(root, path).is_some() {
                        self.process(transform, path, output, options.verify)
                    } else {
                        warn!(path = %path.display(), "Refusing note with non UTF-8 path");
                        FileOutcome {
                            path: path.clone(),
                            output: None,
                            status: FileStatus::Failed(FileFailure::UnsupportedName),
                        }
                    };
                    if outcome.is_failed() && options.fail_fast {
                        stop.store(true, Ordering::Relaxed);
                    }
                    if let Some(journal) = &journal {
                        self.record(journal, root, &outcome);
                    }
                    Some(outcome)
                })
                .collect()
        });

        let cancelled = outcomes.iter().any(Option::is_none);
        let outcomes: Vec<FileOutcome> = outcomes.into_iter().flatten().collect();
        let report = ReKeyReport {
            job_id,
            operation,
            output,
            outcomes,
            cancelled,
        };

        if let Some(journal) = journal {
            let journal = journal.into_inner().unwrap_or_else(PoisonError::into_inner);
            if journal.is_complete() && !options.retain_journal {
                ReKeyJournal::remove(self.store.as_ref(), root)?;
                debug!(%job_id, "Re-key journal removed");
            }
        }

        info!(
            %job_id,
            transformed = report.transformed().count(),
            skipped = report.skipped().count(),
            failed = report.failed().count(),
            cancelled,
            "Re-key job finished"
        );
        Ok(report)
    }

    fn process(
        &self,
        transform: &Transform,
        path: &Path,
        output: OutputMode,
        verify: bool,
    ) -> FileOutcome {
        let operation = transform.operation();
        let context = FileContext::new().with_path(path).with_operation(match operation {
            ReKeyOperation::Encrypt => "encrypt",
            ReKeyOperation::Decrypt => "decrypt",
            ReKeyOperation::ReEncrypt => "re-encrypt",
        });
        let outcome = |output, status| FileOutcome {
            path: path.to_path_buf(),
            output,
            status,
        };

        let bytes = match self.store.read(path) {
            Ok(bytes) => bytes,
            Err(e) => return outcome(None, FileStatus::Failed(FileFailure::Read(e))),
        };

        let new_content = match transform.apply(&bytes, verify, &context) {
            Ok(Ok(content)) => zeroize::Zeroizing::new(content),
            Ok(Err(reason)) => {
                trace!(path = %path.display(), ?reason, "Skipped");
                return outcome(None, FileStatus::Skipped(reason));
            }
            Err(failure) => {
                warn!(path = %path.display(), error = %failure, "Re-key failed for file");
                return outcome(None, FileStatus::Failed(failure));
            }
        };

        let target = match output {
            OutputMode::InPlace => path.to_path_buf(),
            OutputMode::Sibling => sibling_path(path, operation.sibling_suffix()),
        };
        if let Err(e) = self.store.write(&target, &new_content) {
            warn!(path = %target.display(), error = %e, "Re-key write failed");
            return outcome(None, FileStatus::Failed(FileFailure::Write(e)));
        }

        trace!(path = %path.display(), "Transformed");
        outcome(Some(target), FileStatus::Transformed)
    }

    fn record(&self, journal: &Mutex<ReKeyJournal>, root: &Path, outcome: &FileOutcome) {
        let status = if outcome.is_failed() {
            EntryStatus::Failed
        } else {
            EntryStatus::Done
        };
        let Some(key) = entry_key(root, &outcome.path) else {
            return;
        };
        let mut journal = journal.lock().unwrap_or_else(PoisonError::into_inner);
        journal.mark(&key, status);
        // The transform already happened; a stale journal only costs a redundant retry
        if let Err(e) = journal.save(self.store.as_ref(), root) {
            warn!(error = %e, "Failed to update re-key journal");
        }
    }
}

impl std::fmt::Debug for BulkReKeyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkReKeyEngine").finish_non_exhaustive()
    }
}
