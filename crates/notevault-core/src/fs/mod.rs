//! Note envelope codec and file store

pub mod envelope;
pub mod store;

// Re-export commonly used types
pub use envelope::{EnvelopeCipher, EnvelopeError, FileContext, NoteContent, Opened};
pub use store::{LocalNoteStore, NoteStore, StoreError};
