//! Vault cryptography for password-protected note directories.
//!
//! The crate is layered leaves first:
//!
//! - [`crypto`]: password-based key derivation and the [`MasterKey`](crypto::MasterKey) type
//! - [`fs`]: the note envelope codec and the file-store collaborator contract
//! - [`vault`]: the lock/unlock session, the vault configuration file, the
//!   bulk re-key engine and the [`NoteVault`](vault::NoteVault) facade

pub mod crypto;
pub mod error;
pub mod fs;
pub mod vault;

pub use crypto::{KeyDerivation, MasterKey, Password};
pub use fs::{EnvelopeCipher, LocalNoteStore, NoteContent, NoteStore};
pub use vault::{BulkReKeyEngine, NoteVault, ReKeyOptions, ReKeyReport, SessionState, VaultSession};
