//! Error types for the notevault crate
//!
//! Every module defines its own error enum; this module gathers them for
//! callers that match on errors from several layers.

pub use crate::crypto::kdf::KdfError;
pub use crate::crypto::keys::KeyAccessError;
pub use crate::fs::envelope::{EnvelopeError, FileContext};
pub use crate::fs::store::StoreError;
pub use crate::vault::config::ConfigError;
pub use crate::vault::journal::JournalError;
pub use crate::vault::operations::VaultError;
pub use crate::vault::rekey::{FileFailure, ReKeyError};
pub use crate::vault::session::SessionError;
