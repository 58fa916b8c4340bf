#![forbid(unsafe_code)]

use std::{
    fmt,
    sync::{PoisonError, RwLock},
};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key lengths accepted for AES-GCM (AES-128, AES-192, AES-256).
pub const VALID_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Length of keys generated by [`MasterKey::generate`] and derived by sessions.
pub const MASTER_KEY_LENGTH: usize = 32;

const MAX_KEY_LENGTH: usize = 32;

const KEY_CHECK_LABEL: &[u8] = b"notevault key check v1";

/// Error type for key access operations.
#[derive(Debug, Error)]
pub enum KeyAccessError {
    /// The key material is not 16, 24 or 32 bytes long.
    #[error("Invalid key length: expected 16, 24 or 32 bytes, got {0}")]
    InvalidLength(usize),

    /// The key was destroyed by a vault lock and can no longer be used.
    #[error("Key material has been destroyed")]
    Destroyed,

    /// Lock was poisoned (a thread panicked while holding it)
    #[error("Key lock was poisoned")]
    LockPoisoned,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    bytes: [u8; MAX_KEY_LENGTH],
    len: usize,
    destroyed: bool,
}

/// Symmetric master key for note encryption.
///
/// # Security
///
/// The key bytes live in a fixed-size buffer that is zeroed when the key is
/// dropped. Because a session hands out `Arc<MasterKey>` handles, dropping is
/// not enough to guarantee erasure while another handle is alive, so the key
/// also supports explicit in-place destruction via [`MasterKey::destroy`].
/// After destruction every accessor fails with [`KeyAccessError::Destroyed`].
///
/// Access to key material is provided through the scoped
/// [`with_key`](MasterKey::with_key) method: the callback receives a borrowed
/// slice and cannot keep it past the call.
///
/// # Thread Safety
///
/// `MasterKey` is `Send + Sync`. The internal `RwLock` lets many readers use
/// the key concurrently while `destroy` takes exclusive access.
pub struct MasterKey {
    material: RwLock<KeyMaterial>,
}

impl MasterKey {
    /// Create a master key from raw key material.
    ///
    /// The bytes are copied; the caller stays responsible for wiping its own
    /// buffer (a `Zeroizing` wrapper does this automatically).
    ///
    /// # Errors
    ///
    /// Returns [`KeyAccessError::InvalidLength`] unless `key` is 16, 24 or 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, KeyAccessError> {
        if !VALID_KEY_LENGTHS.contains(&key.len()) {
            return Err(KeyAccessError::InvalidLength(key.len()));
        }

        let mut bytes = [0u8; MAX_KEY_LENGTH];
        bytes[..key.len()].copy_from_slice(key);

        Ok(Self {
            material: RwLock::new(KeyMaterial {
                bytes,
                len: key.len(),
                destroyed: false,
            }),
        })
    }

    /// Generate a random 256-bit key using a cryptographically secure RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; MAX_KEY_LENGTH];
        rand::rng().fill_bytes(&mut bytes[..MASTER_KEY_LENGTH]);
        Self {
            material: RwLock::new(KeyMaterial {
                bytes,
                len: MASTER_KEY_LENGTH,
                destroyed: false,
            }),
        }
    }

    /// Try to clone the master key, returning an error if it was destroyed.
    pub fn try_clone(&self) -> Result<Self, KeyAccessError> {
        self.with_key(Self::new)?
    }

    /// Length of the key in bytes.
    pub fn len(&self) -> usize {
        self.material
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len
    }

    /// Always false; keys are 16, 24 or 32 bytes long.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Execute a function with access to the raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeyAccessError::Destroyed`] after [`destroy`](Self::destroy)
    /// and [`KeyAccessError::LockPoisoned`] if a thread panicked while holding
    /// the key lock.
    ///
    /// # Example
    ///
    /// ```
    /// # use notevault_core::crypto::keys::MasterKey;
    /// let master_key = MasterKey::generate();
    /// let len = master_key.with_key(|key| key.len()).unwrap();
    /// assert_eq!(len, 32);
    /// ```
    pub fn with_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let guard = self
            .material
            .read()
            .map_err(|_| KeyAccessError::LockPoisoned)?;
        if guard.destroyed {
            return Err(KeyAccessError::Destroyed);
        }
        Ok(f(&guard.bytes[..guard.len]))
    }

    /// Zero the key bytes in place.
    ///
    /// Destruction ignores lock poisoning: a panic elsewhere must never keep
    /// key material alive. Calling this more than once is harmless.
    pub fn destroy(&self) {
        let mut guard = self
            .material
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.bytes.zeroize();
        guard.destroyed = true;
    }

    /// Whether [`destroy`](Self::destroy) has run on this key.
    pub fn is_destroyed(&self) -> bool {
        self.material
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .destroyed
    }

    /// Key check value: HMAC-SHA256 of a fixed label under this key.
    ///
    /// Stored alongside a protected vault so a wrong password is detected at
    /// unlock instead of at the first note read. It reveals nothing about the
    /// key beyond what a known-plaintext envelope would.
    pub fn check_value(&self) -> Result<[u8; 32], KeyAccessError> {
        self.with_key(|key| {
            // HMAC accepts keys of any length, so this cannot fail
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                .map_err(|_| KeyAccessError::InvalidLength(key.len()))?;
            mac.update(KEY_CHECK_LABEL);
            Ok(mac.finalize().into_bytes().into())
        })?
    }

    /// Whether every byte of the key buffer is zero.
    ///
    /// Lets callers verify erasure after a lock without reading the key.
    pub fn is_zeroed(&self) -> bool {
        self.material
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
            .iter()
            .all(|b| *b == 0)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("len", &self.len())
            .field("key", &"[REDACTED]")
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
