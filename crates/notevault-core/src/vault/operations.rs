//! High-level vault operations.
//!
//! [`NoteVault`] ties the vault configuration, the session, the note store and
//! the re-key engine together. It is what an editor talks to: unlock, read and
//! write notes, and move the vault between unprotected and password-protected.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    crypto::{
        kdf::{KdfError, Password},
        keys::MasterKey,
    },
    fs::{
        envelope::{EnvelopeCipher, EnvelopeError, FileContext},
        store::{LocalNoteStore, NoteStore, StoreError},
    },
    vault::{
        config::{ConfigError, VaultConfig},
        journal::{OutputMode, ReKeyJournal, ReKeyOperation},
        rekey::{BulkReKeyEngine, ReKeyError, ReKeyOptions, ReKeyReport},
        session::{SessionError, SessionState, VaultSession},
    },
};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ReKey(#[from] ReKeyError),

    #[error("Password error: {0}")]
    Password(#[from] KdfError),

    /// Guest mode cannot read or overwrite an encrypted note.
    #[error("Note {0:?} is password-protected")]
    PasswordRequired(PathBuf),

    #[error("Note path {0:?} escapes the vault root")]
    PathOutsideVault(PathBuf),

    /// A password flow did not reach every note.
    ///
    /// The vault configuration was left unchanged. With `rolled_back` set,
    /// every transformed note was restored and the vault is consistent.
    /// Otherwise the journal is kept for [`NoteVault::resume_rekey`].
    #[error("Re-key incomplete ({} failed, rolled back: {rolled_back})", .report.failed().count())]
    ReKeyIncomplete {
        report: Box<ReKeyReport>,
        rolled_back: bool,
    },
}

/// A note vault rooted at a local directory.
///
/// # Example
///
/// ```
/// use notevault_core::crypto::kdf::Password;
/// use notevault_core::vault::{NoteVault, VaultConfig};
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut vault = NoteVault::create_with_config(dir.path(), VaultConfig::unprotected().with_iterations(1_000)).unwrap();
/// vault.open_without_password().unwrap();
/// vault.write_note("todo.md".as_ref(), b"- [ ] buy milk").unwrap();
///
/// vault.set_password(&mut Password::new("correct horse battery")).unwrap();
/// assert!(vault.session().is_protection_enabled());
/// assert_eq!(vault.read_note("todo.md".as_ref()).unwrap(), b"- [ ] buy milk");
/// ```
pub struct NoteVault {
    root: PathBuf,
    store: Arc<dyn NoteStore>,
    engine: BulkReKeyEngine,
    config: VaultConfig,
    session: Arc<VaultSession>,
    rekey_options: ReKeyOptions,
}

impl NoteVault {
    /// Open the vault at `root` on the local filesystem.
    ///
    /// A directory without a configuration file opens as an unprotected vault.
    pub fn open(root: &Path) -> Result<Self, VaultError> {
        Self::open_with_store(root, Arc::new(LocalNoteStore::new()))
    }

    #[instrument(level = "debug", skip(store))]
    pub fn open_with_store(root: &Path, store: Arc<dyn NoteStore>) -> Result<Self, VaultError> {
        let config = match VaultConfig::load_from(store.as_ref(), root) {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => {
                debug!("No vault configuration, treating as unprotected");
                VaultConfig::unprotected()
            }
            Err(e) => return Err(e.into()),
        };
        let session = Arc::new(config.session()?);
        Ok(Self {
            root: root.to_path_buf(),
            engine: BulkReKeyEngine::new(Arc::clone(&store)),
            store,
            config,
            session,
            rekey_options: ReKeyOptions::default(),
        })
    }

    /// Create an unprotected vault at `root`.
    pub fn create(root: &Path) -> Result<Self, VaultError> {
        Self::create_with_config(root, VaultConfig::unprotected())
    }

    /// Create a vault at `root` with `config`, which must not exist yet.
    pub fn create_with_config(root: &Path, config: VaultConfig) -> Result<Self, VaultError> {
        if VaultConfig::exists(root) {
            return Err(ConfigError::AlreadyExists(VaultConfig::path(root)).into());
        }
        std::fs::create_dir_all(root).map_err(|e| StoreError::io(e, root))?;
        config.save(root)?;
        info!(root = %root.display(), protected = config.is_protected(), "Vault created");
        Self::open(root)
    }

    /// Options used by the password flows. The output mode is always in place.
    #[must_use]
    pub fn with_rekey_options(mut self, options: ReKeyOptions) -> Self {
        self.rekey_options = options;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<VaultSession> {
        &self.session
    }

    pub fn is_protected(&self) -> bool {
        self.config.is_protected()
    }

    /// Unlock a password-protected vault.
    pub fn unlock(&self, password: &mut Password) -> Result<(), VaultError> {
        if !self.config.is_protected() {
            password.wipe();
            return Err(SessionError::IllegalState(
                "vault has no password; open it without one".to_string(),
            )
            .into());
        }
        Ok(self.session.unlock(password)?)
    }

    /// Unlock on tokio's blocking pool.
    #[cfg(feature = "async")]
    pub async fn unlock_async(&self, mut password: Password) -> Result<(), VaultError> {
        if !self.config.is_protected() {
            password.wipe();
            return Err(SessionError::IllegalState(
                "vault has no password; open it without one".to_string(),
            )
            .into());
        }
        Ok(self.session.unlock_async(password).await?)
    }

    /// Enter guest mode: plaintext notes only.
    pub fn open_without_password(&self) -> Result<(), VaultError> {
        Ok(self.session.open_without_password()?)
    }

    pub fn lock(&self) {
        self.session.lock();
    }

    fn note_path(&self, relative: &Path) -> Result<PathBuf, VaultError> {
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(VaultError::PathOutsideVault(relative.to_path_buf()));
        }
        Ok(self.root.join(relative))
    }

    /// Guest-mode gate: only plaintext or missing notes may be touched.
    fn require_plaintext(&self, path: &Path, relative: &Path) -> Result<(), VaultError> {
        if EnvelopeCipher::is_action_allowed_without_password(self.store.as_ref(), path)? {
            return Ok(());
        }
        warn!("Refusing to touch encrypted note in guest mode");
        Err(VaultError::PasswordRequired(relative.to_path_buf()))
    }

    /// Read a note, decrypting it when the vault is unlocked with a key.
    ///
    /// In guest mode an encrypted note fails with
    /// [`VaultError::PasswordRequired`] instead of being returned as is.
    #[instrument(level = "debug", skip(self))]
    pub fn read_note(&self, relative: &Path) -> Result<Vec<u8>, VaultError> {
        let path = self.note_path(relative)?;
        match self.session.state() {
            SessionState::Locked => Err(SessionError::IllegalState(
                "vault is locked".to_string(),
            )
            .into()),
            SessionState::UnlockedNoKey => {
                self.require_plaintext(&path, relative)?;
                Ok(self.store.read(&path)?)
            }
            SessionState::UnlockedWithKey => {
                let bytes = self.store.read(&path)?;
                let cipher = EnvelopeCipher::from_master_key(&*self.session.required_master_key()?)?;
                let context = FileContext::new().with_path(&path).with_operation("read");
                Ok(cipher.decrypt_with_context(&bytes, None, &context)?)
            }
        }
    }

    /// Read a note as UTF-8 text, replacing invalid sequences.
    pub fn read_note_string(&self, relative: &Path) -> Result<String, VaultError> {
        let bytes = self.read_note(relative)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write a note, encrypting it when the vault is unlocked with a key.
    ///
    /// Guest mode refuses to overwrite an encrypted note with plaintext.
    #[instrument(level = "debug", skip(self, content), fields(len = content.len()))]
    pub fn write_note(&self, relative: &Path, content: &[u8]) -> Result<(), VaultError> {
        let path = self.note_path(relative)?;
        match self.session.state() {
            SessionState::Locked => Err(SessionError::IllegalState(
                "vault is locked".to_string(),
            )
            .into()),
            SessionState::UnlockedNoKey => {
                self.require_plaintext(&path, relative)?;
                Ok(self.store.write(&path, content)?)
            }
            SessionState::UnlockedWithKey => {
                let cipher = EnvelopeCipher::from_master_key(&*self.session.required_master_key()?)?;
                let context = FileContext::new().with_path(&path).with_operation("write");
                let envelope = cipher.encrypt_with_context(content, None, &context)?;
                Ok(self.store.write(&path, &envelope)?)
            }
        }
    }

    fn flow_options(&self, target: &VaultConfig) -> ReKeyOptions {
        self.rekey_options
            .clone()
            .with_output(OutputMode::InPlace)
            .with_target(target.clone())
            .with_retained_journal(true)
    }

    fn require_state(&self, expected: SessionState, action: &str) -> Result<(), VaultError> {
        let state = self.session.state();
        if state != expected {
            return Err(SessionError::IllegalState(format!(
                "{action} requires state {expected:?} (state: {state:?})"
            ))
            .into());
        }
        Ok(())
    }

    fn require_unprotected(&self) -> Result<(), VaultError> {
        if self.config.is_protected() {
            return Err(SessionError::IllegalState(
                "vault already has a password; use change_password".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Protect an unprotected vault with `password`.
    ///
    /// Must be in guest mode on a vault without a password. Every note is
    /// encrypted in place under a key derived from a fresh salt; afterwards the
    /// session holds that key.
    #[instrument(level = "info", skip_all)]
    pub fn set_password(&mut self, password: &mut Password) -> Result<ReKeyReport, VaultError> {
        if let Err(e) = self
            .require_unprotected()
            .and_then(|()| self.require_state(SessionState::UnlockedNoKey, "set password"))
            .and_then(|()| Ok(password.validate()?))
        {
            password.wipe();
            return Err(e);
        }

        let (target, new_key) = self.config.protect(password)?;
        let report = self.engine.encrypt_files_with(
            &new_key,
            &self.root,
            &self.flow_options(&target),
        )?;
        self.finish_flow(report, target, None, Some(new_key))
    }

    /// Remove the password from a protected vault.
    ///
    /// Must be unlocked with the key. Every note is decrypted in place;
    /// afterwards the session is in guest mode.
    #[instrument(level = "info", skip_all)]
    pub fn remove_password(&mut self) -> Result<ReKeyReport, VaultError> {
        self.require_state(SessionState::UnlockedWithKey, "remove password")?;
        let old_key = self.session.required_master_key()?;

        let target = self.config.unprotect();
        let report = self.engine.decrypt_files_with(
            &old_key,
            &self.root,
            &self.flow_options(&target),
        )?;
        self.finish_flow(report, target, Some(old_key), None)
    }

    /// Replace the vault password.
    ///
    /// Must be unlocked with the current key. Every note is re-encrypted in
    /// place under a key derived from `new_password` and a fresh salt.
    #[instrument(level = "info", skip_all)]
    pub fn change_password(&mut self, new_password: &mut Password) -> Result<ReKeyReport, VaultError> {
        if let Err(e) = self
            .require_state(SessionState::UnlockedWithKey, "change password")
            .and_then(|()| Ok(new_password.validate()?))
        {
            new_password.wipe();
            return Err(e);
        }
        let old_key = self.session.required_master_key()?;

        let (target, new_key) = self.config.protect(new_password)?;
        let report = self.engine.re_encrypt_files_with(
            Some(&old_key),
            &new_key,
            &self.root,
            &self.flow_options(&target),
        )?;
        self.finish_flow(report, target, Some(old_key), Some(new_key))
    }

    /// The journal of an interrupted password flow, if any.
    pub fn pending_rekey(&self) -> Result<Option<ReKeyJournal>, VaultError> {
        Ok(self.engine.pending_job(&self.root)?)
    }

    /// Finish an interrupted password flow.
    ///
    /// `old_password` is needed when the job decrypts notes and the session
    /// does not hold the current key. `new_password` is needed when the job
    /// encrypts notes. Returns `None` when nothing was pending.
    #[instrument(level = "info", skip_all)]
    pub fn resume_rekey(
        &mut self,
        old_password: Option<&mut Password>,
        new_password: Option<&mut Password>,
    ) -> Result<Option<ReKeyReport>, VaultError> {
        let Some(journal) = self.pending_rekey()? else {
            return Ok(None);
        };

        let needs_old = journal.operation != ReKeyOperation::Encrypt && self.config.is_protected();
        let old_key = match (needs_old, self.session.key_if_present(), old_password) {
            (false, _, _) => None,
            (true, Some(key), _) => Some(key),
            (true, None, Some(password)) => Some(Arc::new(derive_verified(&self.config, password)?)),
            (true, None, None) => {
                return Err(ReKeyError::MissingKey {
                    operation: journal.operation,
                    role: "old",
                }
                .into());
            }
        };

        let new_key = match (&journal.target, new_password) {
            (Some(target), Some(password)) if target.is_protected() => {
                Some(derive_verified(target, password)?)
            }
            (Some(target), None) if target.is_protected() => {
                return Err(ReKeyError::MissingKey {
                    operation: journal.operation,
                    role: "new",
                }
                .into());
            }
            _ => None,
        };

        let options = self
            .rekey_options
            .clone()
            .with_retained_journal(journal.target.is_some());
        let Some(report) =
            self.engine
                .resume(&self.root, old_key.as_deref(), new_key.as_ref(), &options)?
        else {
            return Ok(None);
        };

        if !report.is_complete() {
            return Err(VaultError::ReKeyIncomplete {
                report: Box::new(report),
                rolled_back: false,
            });
        }
        match journal.target {
            Some(target) => self.commit(target, new_key)?,
            None => self.engine.discard_journal(&self.root)?,
        }
        Ok(Some(report))
    }

    fn finish_flow(
        &mut self,
        report: ReKeyReport,
        target: VaultConfig,
        old_key: Option<Arc<MasterKey>>,
        new_key: Option<MasterKey>,
    ) -> Result<ReKeyReport, VaultError> {
        if !report.is_complete() {
            warn!(
                failed = report.failed().count(),
                cancelled = report.cancelled,
                "Password flow incomplete, rolling back"
            );
            let rolled_back =
                match self
                    .engine
                    .revert(&report, old_key.as_deref(), new_key.as_ref(), &self.root)
                {
                    Ok(revert) if revert.is_complete() => {
                        self.engine.discard_journal(&self.root)?;
                        true
                    }
                    Ok(revert) => {
                        warn!(failed = revert.failed().count(), "Rollback incomplete, journal kept");
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "Rollback failed, journal kept");
                        false
                    }
                };
            if let Some(key) = new_key {
                key.destroy();
            }
            return Err(VaultError::ReKeyIncomplete {
                report: Box::new(report),
                rolled_back,
            });
        }

        self.commit(target, new_key)?;
        Ok(report)
    }

    /// Persist `target`, drop the journal and swap in a session for it.
    fn commit(&mut self, target: VaultConfig, new_key: Option<MasterKey>) -> Result<(), VaultError> {
        target.save_to(self.store.as_ref(), &self.root)?;
        self.engine.discard_journal(&self.root)?;

        let session = Arc::new(target.session()?);
        match new_key {
            Some(key) => session.unlock_with_key(key)?,
            None => session.open_without_password()?,
        }

        self.session.lock();
        self.session = session;
        self.config = target;
        info!(protected = self.config.is_protected(), "Vault configuration updated");
        Ok(())
    }
}

/// Derive the key for `config` and check it against the stored key check.
fn derive_verified(config: &VaultConfig, password: &mut Password) -> Result<MasterKey, VaultError> {
    let key = config.key_derivation().derive_master_key(password)?;
    if !config.matches_key(&key)? {
        key.destroy();
        return Err(SessionError::InvalidPassword.into());
    }
    Ok(key)
}

impl std::fmt::Debug for NoteVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteVault")
            .field("root", &self.root)
            .field("protected", &self.config.is_protected())
            .field("state", &self.session.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> (tempfile::TempDir, NoteVault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = NoteVault::create_with_config(
            dir.path(),
            VaultConfig::unprotected().with_iterations(10),
        )
        .unwrap();
        (dir, vault)
    }

    #[test]
    fn test_note_path_rejects_escapes() {
        let (_dir, vault) = vault();
        assert!(vault.note_path(Path::new("a/b.md")).is_ok());
        assert!(vault.note_path(Path::new("./a.md")).is_ok());
        for bad in ["../x.md", "/etc/passwd", "a/../../x.md", ""] {
            assert!(
                matches!(vault.note_path(Path::new(bad)), Err(VaultError::PathOutsideVault(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_locked_vault_refuses_io() {
        let (_dir, vault) = vault();
        assert!(matches!(
            vault.read_note(Path::new("a.md")),
            Err(VaultError::Session(SessionError::IllegalState(_)))
        ));
        assert!(matches!(
            vault.write_note(Path::new("a.md"), b"x"),
            Err(VaultError::Session(SessionError::IllegalState(_)))
        ));
    }

    #[test]
    fn test_unlock_unprotected_vault_is_rejected() {
        let (_dir, vault) = vault();
        let mut password = Password::new("whatever-password");
        assert!(vault.unlock(&mut password).is_err());
        assert!(password.is_wiped());
    }

    #[test]
    fn test_create_twice_fails() {
        let (dir, _vault) = vault();
        assert!(matches!(
            NoteVault::create(dir.path()),
            Err(VaultError::Config(ConfigError::AlreadyExists(_)))
        ));
    }

    #[test]
    fn test_set_password_rejects_weak_password() {
        let (_dir, mut vault) = vault();
        vault.open_without_password().unwrap();
        let mut password = Password::new("short");
        assert!(matches!(
            vault.set_password(&mut password),
            Err(VaultError::Password(KdfError::WeakPassword(_)))
        ));
        assert!(password.is_wiped());
        assert!(!vault.is_protected());
    }
}
