//! Vault-level abstractions and operations

pub mod config;
pub mod journal;
pub mod operations;
pub mod rekey;
pub mod session;

// Re-export commonly used types
pub use config::{CONFIG_FILE_NAME, ConfigError, VaultConfig};
pub use journal::{EntryStatus, JOURNAL_FILE_NAME, OutputMode, ReKeyJournal, ReKeyOperation};
pub use operations::{NoteVault, VaultError};
pub use rekey::{
    BulkReKeyEngine, FileFailure, FileOutcome, FileStatus, ReKeyError, ReKeyOptions, ReKeyReport,
    SkipReason,
};
pub use session::{SessionError, SessionState, VaultSession};
