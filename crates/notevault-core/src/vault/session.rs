//! Lock/unlock state machine owning the resident master key.
//!
//! The session keeps a single slot that is swapped atomically. Every
//! transition is a compare-and-set on that slot, so concurrent callers always
//! agree on one winner and a losing unlock never leaves a second key resident.

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::crypto::{
    kdf::{KdfError, KeyDerivation, Password, constant_time_eq},
    keys::{KeyAccessError, MasterKey},
};

#[derive(Error, Debug)]
pub enum SessionError {
    /// The requested transition is not valid from the current state.
    #[error("Illegal session state: {0}")]
    IllegalState(String),

    /// The password did not derive the vault key.
    #[error("Invalid password")]
    InvalidPassword,

    #[error("Key derivation failed: {0}")]
    Derivation(#[from] KdfError),

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),

    /// The blocking KDF task panicked or was cancelled
    #[error("Unlock task failed: {0}")]
    TaskJoin(String),
}

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    /// Guest mode: no password, notes are read and written as plaintext.
    UnlockedNoKey,
    UnlockedWithKey,
}

enum KeySlot {
    Locked,
    NoKey,
    Key(Arc<MasterKey>),
}

impl KeySlot {
    fn state(&self) -> SessionState {
        match self {
            KeySlot::Locked => SessionState::Locked,
            KeySlot::NoKey => SessionState::UnlockedNoKey,
            KeySlot::Key(_) => SessionState::UnlockedWithKey,
        }
    }
}

/// Owner of the resident master key.
///
/// # Example
///
/// ```
/// use notevault_core::crypto::kdf::{KeyDerivation, Password};
/// use notevault_core::vault::session::{SessionState, VaultSession};
///
/// let session = VaultSession::new(KeyDerivation::new(b"per-vault-salt!!".to_vec()).with_iterations(1_000));
/// session.unlock(&mut Password::new("correct-password")).unwrap();
/// assert!(session.is_protection_enabled());
/// assert_eq!(session.required_master_key().unwrap().len(), 32);
///
/// session.lock();
/// assert_eq!(session.state(), SessionState::Locked);
/// ```
pub struct VaultSession {
    slot: ArcSwap<KeySlot>,
    locked: Arc<KeySlot>,
    kdf: KeyDerivation,
    key_check: Option<[u8; 32]>,
}

impl VaultSession {
    /// Create a locked session that derives keys with `kdf`.
    pub fn new(kdf: KeyDerivation) -> Self {
        let locked = Arc::new(KeySlot::Locked);
        Self {
            slot: ArcSwap::new(Arc::clone(&locked)),
            locked,
            kdf,
            key_check: None,
        }
    }

    /// Require derived keys to match `key_check` (see [`MasterKey::check_value`]).
    #[must_use]
    pub fn with_key_check(mut self, key_check: [u8; 32]) -> Self {
        self.key_check = Some(key_check);
        self
    }

    pub fn key_derivation(&self) -> &KeyDerivation {
        &self.kdf
    }

    pub fn state(&self) -> SessionState {
        self.slot.load().state()
    }

    /// Derive the vault key from `password` and make it resident.
    ///
    /// The password is wiped whatever the outcome.
    ///
    /// # Errors
    ///
    /// - `SessionError::IllegalState`: the session is not locked, or another
    ///   thread unlocked it while this call was deriving
    /// - `SessionError::InvalidPassword`: the key check did not match
    /// - `SessionError::Derivation`: the KDF failed; the session stays locked
    #[instrument(level = "debug", skip_all)]
    pub fn unlock(&self, password: &mut Password) -> Result<(), SessionError> {
        let current = self.slot.load_full();
        if !matches!(*current, KeySlot::Locked) {
            password.wipe();
            return Err(SessionError::IllegalState(format!(
                "unlock requires a locked session (state: {:?})",
                current.state()
            )));
        }

        let key = self.kdf.derive_master_key(password)?;
        self.install(&current, key)
    }

    /// Make an already derived key resident.
    ///
    /// Same transition rules as [`unlock`](Self::unlock). Used after a
    /// password change, when the new key is already in hand.
    pub fn unlock_with_key(&self, key: MasterKey) -> Result<(), SessionError> {
        let current = self.slot.load_full();
        if !matches!(*current, KeySlot::Locked) {
            key.destroy();
            return Err(SessionError::IllegalState(format!(
                "unlock requires a locked session (state: {:?})",
                current.state()
            )));
        }
        self.install(&current, key)
    }

    fn install(&self, current: &Arc<KeySlot>, key: MasterKey) -> Result<(), SessionError> {
        if let Some(expected) = &self.key_check {
            let actual = match key.check_value() {
                Ok(actual) => actual,
                Err(e) => {
                    key.destroy();
                    return Err(e.into());
                }
            };
            if !constant_time_eq(&actual, expected) {
                key.destroy();
                warn!("Unlock rejected: key check mismatch");
                return Err(SessionError::InvalidPassword);
            }
        }

        let key = Arc::new(key);
        let previous = self
            .slot
            .compare_and_swap(current, Arc::new(KeySlot::Key(Arc::clone(&key))));
        if !Arc::ptr_eq(&previous, current) {
            key.destroy();
            warn!("Unlock lost a race with a concurrent transition");
            return Err(SessionError::IllegalState(
                "session was unlocked concurrently".to_string(),
            ));
        }

        info!("Vault unlocked");
        Ok(())
    }

    /// Unlock on tokio's blocking pool.
    ///
    /// PBKDF2 with the default work factor takes hundreds of milliseconds;
    /// this keeps it off async worker threads.
    #[cfg(feature = "async")]
    pub async fn unlock_async(self: &Arc<Self>, mut password: Password) -> Result<(), SessionError> {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.unlock(&mut password))
            .await
            .map_err(|e| SessionError::TaskJoin(e.to_string()))?
    }

    /// Enter guest mode. Valid only while locked.
    pub fn open_without_password(&self) -> Result<(), SessionError> {
        let current = self.slot.load_full();
        if !matches!(*current, KeySlot::Locked) {
            return Err(SessionError::IllegalState(format!(
                "open without password requires a locked session (state: {:?})",
                current.state()
            )));
        }

        let previous = self.slot.compare_and_swap(&current, Arc::new(KeySlot::NoKey));
        if !Arc::ptr_eq(&previous, &current) {
            return Err(SessionError::IllegalState(
                "session was unlocked concurrently".to_string(),
            ));
        }

        debug!("Vault opened without password");
        Ok(())
    }

    /// Lock the session, destroying the resident key if there is one.
    ///
    /// Idempotent. Key bytes are zero once this returns, including through
    /// any `Arc<MasterKey>` handed out earlier.
    pub fn lock(&self) {
        let previous = self.slot.swap(Arc::clone(&self.locked));
        match &*previous {
            KeySlot::Key(key) => {
                key.destroy();
                info!("Vault locked, master key destroyed");
            }
            KeySlot::NoKey => debug!("Vault locked"),
            KeySlot::Locked => {}
        }
    }

    /// True while a master key is resident.
    pub fn is_unlocked(&self) -> bool {
        matches!(**self.slot.load(), KeySlot::Key(_))
    }

    /// True when the session is exactly [`SessionState::UnlockedWithKey`].
    pub fn is_protection_enabled(&self) -> bool {
        self.state() == SessionState::UnlockedWithKey
    }

    pub fn key_if_present(&self) -> Option<Arc<MasterKey>> {
        match &**self.slot.load() {
            KeySlot::Key(key) => Some(Arc::clone(key)),
            KeySlot::Locked | KeySlot::NoKey => None,
        }
    }

    /// The resident key, for callers that cannot proceed without one.
    pub fn required_master_key(&self) -> Result<Arc<MasterKey>, SessionError> {
        self.key_if_present().ok_or_else(|| {
            SessionError::IllegalState(format!(
                "a master key is required (state: {:?})",
                self.state()
            ))
        })
    }
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        self.lock();
    }
}

impl fmt::Debug for VaultSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSession")
            .field("state", &self.state())
            .field("kdf", &self.kdf)
            .field("key_check", &self.key_check.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> VaultSession {
        VaultSession::new(KeyDerivation::new(b"session-salt-123".to_vec()).with_iterations(10))
    }

    #[test]
    fn test_initially_locked() {
        let session = session();
        assert_eq!(session.state(), SessionState::Locked);
        assert!(!session.is_unlocked());
        assert!(!session.is_protection_enabled());
        assert!(session.key_if_present().is_none());
        assert!(matches!(
            session.required_master_key(),
            Err(SessionError::IllegalState(_))
        ));
    }

    #[test]
    fn test_unlock_wipes_password() {
        let session = session();
        let mut password = Password::new("correct-password");
        session.unlock(&mut password).unwrap();
        assert!(password.is_wiped());
        assert!(session.is_unlocked());
        assert_eq!(session.required_master_key().unwrap().len(), 32);
    }

    #[test]
    fn test_failed_derivation_stays_locked() {
        let session = VaultSession::new(KeyDerivation::new(Vec::new()));
        let mut password = Password::new("correct-password");
        let result = session.unlock(&mut password);
        assert!(matches!(
            result,
            Err(SessionError::Derivation(KdfError::EmptySalt))
        ));
        assert!(password.is_wiped());
        assert_eq!(session.state(), SessionState::Locked);
    }

    #[test]
    fn test_key_check_rejects_wrong_password() {
        let kdf = KeyDerivation::new(b"session-salt-123".to_vec()).with_iterations(10);
        let expected = kdf
            .derive_master_key(&mut Password::new("right"))
            .unwrap()
            .check_value()
            .unwrap();
        let session = VaultSession::new(kdf).with_key_check(expected);

        assert!(matches!(
            session.unlock(&mut Password::new("wrong")),
            Err(SessionError::InvalidPassword)
        ));
        assert_eq!(session.state(), SessionState::Locked);

        session.unlock(&mut Password::new("right")).unwrap();
        assert!(session.is_protection_enabled());
    }

    #[test]
    fn test_unlock_with_key_requires_locked() {
        let session = session();
        session.open_without_password().unwrap();

        let key = MasterKey::generate();
        let result = session.unlock_with_key(key);
        assert!(matches!(result, Err(SessionError::IllegalState(_))));
        assert_eq!(session.state(), SessionState::UnlockedNoKey);
    }

    #[test]
    fn test_guest_mode_has_no_key() {
        let session = session();
        session.open_without_password().unwrap();
        assert_eq!(session.state(), SessionState::UnlockedNoKey);
        assert!(!session.is_unlocked());
        assert!(!session.is_protection_enabled());
        assert!(session.required_master_key().is_err());

        // Second open is a misuse
        assert!(session.open_without_password().is_err());
        session.lock();
        assert_eq!(session.state(), SessionState::Locked);
    }

    #[test]
    fn test_drop_destroys_key() {
        let session = session();
        session.unlock(&mut Password::new("pw")).unwrap();
        let key = session.required_master_key().unwrap();
        drop(session);
        assert!(key.is_zeroed());
    }
}
