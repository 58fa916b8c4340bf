//! The note envelope format.
//!
//! An encrypted note is stored as a single ASCII header line followed by the
//! base64 encoding of `nonce (12 bytes) || ciphertext || tag (16 bytes)`:
//!
//! ```text
//! %NOTEVAULT-ENVELOPE/1\n
//! <base64(nonce || ciphertext || tag)>
//! ```
//!
//! The header line, including its trailing newline, is authenticated as the
//! first part of the AES-GCM associated data, followed by any caller AAD.
//! Bytes that do not start with a complete header line are plaintext and are
//! passed through unchanged by [`EnvelopeCipher::decrypt`].

use std::{
    fmt,
    path::{Path, PathBuf},
};

use aead::Payload;
use aes::Aes192;
use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, KeyInit, consts::U12},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::{
    crypto::keys::{KeyAccessError, MasterKey, VALID_KEY_LENGTHS},
    fs::store::{NoteStore, StoreError},
};

/// Leading bytes shared by every envelope header.
pub const HEADER_PREFIX: &[u8] = b"%NOTEVAULT-ENVELOPE/";

/// Envelope format version written by [`EnvelopeCipher::encrypt`].
pub const CURRENT_VERSION: u32 = 1;

/// Upper bound on the header line length, newline included.
///
/// Also the number of bytes peeked by
/// [`EnvelopeCipher::is_action_allowed_without_password`].
pub const MAX_HEADER_LEN: usize = HEADER_PREFIX.len() + 11;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM tag length in bytes.
pub const TAG_LEN: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Context for envelope operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    /// Path of the note on disk, if known
    pub path: Option<PathBuf>,
    /// Operation that failed (e.g. "re-encrypt")
    pub operation: Option<&'static str>,
}

impl FileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }
}

impl fmt::Display for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.operation, &self.path) {
            (Some(op), Some(path)) => write!(f, "{op} of {:?}", path.display()),
            (None, Some(path)) => write!(f, "{:?}", path.display()),
            (Some(op), None) => write!(f, "{op}"),
            (None, None) => write!(f, "(no context)"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The key is not 16, 24 or 32 bytes long. Raised before any cipher work.
    #[error("Invalid key length: expected 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Sealing failed unexpectedly.
    #[error("Failed to encrypt {context}: {reason}")]
    Encryption {
        reason: String,
        context: FileContext,
    },

    /// The envelope could not be opened.
    ///
    /// **[INTEGRITY VIOLATION]** Covers tag mismatch, truncation, malformed
    /// base64, unknown format version and wrong key. These are deliberately
    /// indistinguishable.
    #[error("Failed to decrypt {context}: invalid envelope or wrong key")]
    Decryption { context: FileContext },

    #[error("Failed to read {context}: {source}")]
    Store {
        #[source]
        source: StoreError,
        context: FileContext,
    },

    /// Key access failed because the key was destroyed by a lock
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

impl EnvelopeError {
    /// Replace the context carried by the error, if it has one.
    #[must_use]
    pub fn with_context(self, context: FileContext) -> Self {
        match self {
            EnvelopeError::Encryption { reason, .. } => EnvelopeError::Encryption { reason, context },
            EnvelopeError::Decryption { .. } => EnvelopeError::Decryption { context },
            EnvelopeError::Store { source, .. } => EnvelopeError::Store { source, context },
            other => other,
        }
    }

    /// Whether this error means the content could not be authenticated.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, EnvelopeError::Decryption { .. })
    }
}

/// Classification of stored note bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteContent<'a> {
    /// Starts with a complete envelope header line.
    Envelope(&'a [u8]),
    /// Anything else, including input shorter than a header.
    Plaintext(&'a [u8]),
}

impl<'a> NoteContent<'a> {
    pub fn classify(bytes: &'a [u8]) -> Self {
        if split_header(bytes).is_some() {
            NoteContent::Envelope(bytes)
        } else {
            NoteContent::Plaintext(bytes)
        }
    }

    pub fn is_envelope(&self) -> bool {
        matches!(self, NoteContent::Envelope(_))
    }

    pub fn bytes(&self) -> &'a [u8] {
        match self {
            NoteContent::Envelope(b) | NoteContent::Plaintext(b) => b,
        }
    }
}

/// Result of [`EnvelopeCipher::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// The input was an envelope and authenticated under this key.
    Decrypted(Vec<u8>),
    /// The input carried no envelope header and is returned as is.
    Plaintext(Vec<u8>),
}

impl Opened {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Opened::Decrypted(b) | Opened::Plaintext(b) => b,
        }
    }

    pub fn was_encrypted(&self) -> bool {
        matches!(self, Opened::Decrypted(_))
    }
}

/// Split `bytes` into the header line (newline included) and the body.
fn split_header(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    if !bytes.starts_with(HEADER_PREFIX) {
        return None;
    }
    let window = &bytes[..bytes.len().min(MAX_HEADER_LEN)];
    let newline = window.iter().position(|b| *b == b'\n')?;
    Some(bytes.split_at(newline + 1))
}

fn header_line(version: u32) -> Vec<u8> {
    let mut line = HEADER_PREFIX.to_vec();
    line.extend_from_slice(version.to_string().as_bytes());
    line.push(b'\n');
    line
}

fn parse_version(header: &[u8]) -> Option<u32> {
    let digits = &header[HEADER_PREFIX.len()..header.len() - 1];
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[derive(Clone)]
enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl GcmCipher {
    fn seal(&self, nonce: &[u8; NONCE_LEN], payload: Payload<'_, '_>) -> Result<Vec<u8>, aead::Error> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            GcmCipher::Aes128(c) => c.encrypt(nonce, payload),
            GcmCipher::Aes192(c) => c.encrypt(nonce, payload),
            GcmCipher::Aes256(c) => c.encrypt(nonce, payload),
        }
    }

    fn open(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>, aead::Error> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            GcmCipher::Aes128(c) => c.decrypt(nonce, payload),
            GcmCipher::Aes192(c) => c.decrypt(nonce, payload),
            GcmCipher::Aes256(c) => c.decrypt(nonce, payload),
        }
    }
}

/// AES-GCM codec for the note envelope format.
///
/// The key size selects AES-128, AES-192 or AES-256. Every call to
/// [`encrypt`](Self::encrypt) draws a fresh random 96-bit nonce, so one cipher
/// can be shared between threads.
///
/// # Example
///
/// ```
/// use notevault_core::fs::envelope::{EnvelopeCipher, HEADER_PREFIX};
///
/// let cipher = EnvelopeCipher::new(&[0x42; 32]).unwrap();
/// let envelope = cipher.encrypt(b"hello", None).unwrap();
/// assert!(envelope.starts_with(HEADER_PREFIX));
/// assert_eq!(cipher.decrypt(&envelope, None).unwrap(), b"hello");
///
/// // Bytes without the header pass through unchanged.
/// assert_eq!(cipher.decrypt(b"# plain note", None).unwrap(), b"# plain note");
/// ```
#[derive(Clone)]
pub struct EnvelopeCipher {
    cipher: GcmCipher,
}

impl EnvelopeCipher {
    /// Build a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::InvalidKeyLength`] unless `key` is 16, 24 or 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, EnvelopeError> {
        if !VALID_KEY_LENGTHS.contains(&key.len()) {
            return Err(EnvelopeError::InvalidKeyLength(key.len()));
        }
        let invalid = |_| EnvelopeError::InvalidKeyLength(key.len());
        let cipher = match key.len() {
            16 => GcmCipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            24 => GcmCipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            _ => GcmCipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
        };
        Ok(Self { cipher })
    }

    /// Build a cipher from a master key.
    ///
    /// Fails with [`EnvelopeError::KeyAccess`] if the key was destroyed.
    pub fn from_master_key(master_key: &MasterKey) -> Result<Self, EnvelopeError> {
        master_key.with_key(Self::new)?
    }

    /// Seal `plaintext` into an envelope.
    ///
    /// `aad` is authenticated but not stored; the same value must be passed
    /// to [`decrypt`](Self::decrypt).
    #[instrument(level = "debug", skip_all, fields(plaintext_len = plaintext.len(), has_aad = aad.is_some()))]
    pub fn encrypt(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, EnvelopeError> {
        self.encrypt_with_context(plaintext, aad, &FileContext::new())
    }

    /// Seal `plaintext` with contextual error information.
    pub fn encrypt_with_context(
        &self,
        plaintext: &[u8],
        aad: Option<&[u8]>,
        context: &FileContext,
    ) -> Result<Vec<u8>, EnvelopeError> {
        let header = header_line(CURRENT_VERSION);
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let associated = [header.as_slice(), aad.unwrap_or_default()].concat();
        let sealed = self
            .cipher
            .seal(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &associated,
                },
            )
            .map_err(|e| EnvelopeError::Encryption {
                reason: e.to_string(),
                context: context.clone(),
            })?;

        let mut raw = Vec::with_capacity(NONCE_LEN + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);

        let mut envelope = header;
        envelope.extend_from_slice(BASE64.encode(raw).as_bytes());
        trace!(envelope_len = envelope.len(), "Envelope sealed");
        Ok(envelope)
    }

    /// Open an envelope, or return plaintext input unchanged.
    pub fn decrypt(&self, bytes: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, EnvelopeError> {
        self.open(bytes, aad).map(Opened::into_bytes)
    }

    /// Open an envelope with contextual error information.
    pub fn decrypt_with_context(
        &self,
        bytes: &[u8],
        aad: Option<&[u8]>,
        context: &FileContext,
    ) -> Result<Vec<u8>, EnvelopeError> {
        self.open_with_context(bytes, aad, context)
            .map(Opened::into_bytes)
    }

    /// Typed form of [`decrypt`](Self::decrypt).
    pub fn open(&self, bytes: &[u8], aad: Option<&[u8]>) -> Result<Opened, EnvelopeError> {
        self.open_with_context(bytes, aad, &FileContext::new())
    }

    /// Typed form of [`decrypt_with_context`](Self::decrypt_with_context).
    #[instrument(level = "debug", skip(self, bytes, aad), fields(input_len = bytes.len()))]
    pub fn open_with_context(
        &self,
        bytes: &[u8],
        aad: Option<&[u8]>,
        context: &FileContext,
    ) -> Result<Opened, EnvelopeError> {
        let Some((header, body)) = split_header(bytes) else {
            trace!("No envelope header, passing content through");
            return Ok(Opened::Plaintext(bytes.to_vec()));
        };

        let fail = || EnvelopeError::Decryption {
            context: context.clone(),
        };

        if parse_version(header) != Some(CURRENT_VERSION) {
            warn!("Unsupported envelope version");
            return Err(fail());
        }

        let raw = BASE64.decode(body.trim_ascii_end()).map_err(|_| {
            warn!("Envelope body is not valid base64");
            fail()
        })?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            warn!(actual_size = raw.len(), "Envelope payload truncated");
            return Err(fail());
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let associated = [header, aad.unwrap_or_default()].concat();
        let plaintext = self
            .cipher
            .open(
                nonce,
                Payload {
                    msg: sealed,
                    aad: &associated,
                },
            )
            .map_err(|_| {
                warn!("Envelope authentication failed - tag mismatch or wrong key");
                fail()
            })?;

        debug!(plaintext_len = plaintext.len(), "Envelope opened");
        Ok(Opened::Decrypted(plaintext))
    }

    /// Report whether the note at `path` may be read or replaced without a
    /// password.
    ///
    /// Only the first [`MAX_HEADER_LEN`] bytes are read from `store`. A
    /// missing file is allowed since it carries no protected content yet.
    pub fn is_action_allowed_without_password(
        store: &dyn NoteStore,
        path: &Path,
    ) -> Result<bool, EnvelopeError> {
        let head = match store.read_prefix(path, MAX_HEADER_LEN) {
            Ok(head) => head,
            Err(e) if e.is_not_found() => return Ok(true),
            Err(source) => {
                return Err(EnvelopeError::Store {
                    source,
                    context: FileContext::new().with_path(path),
                });
            }
        };
        Ok(!NoteContent::classify(&head).is_envelope())
    }
}

impl fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self.cipher {
            GcmCipher::Aes128(_) => "AES-128-GCM",
            GcmCipher::Aes192(_) => "AES-192-GCM",
            GcmCipher::Aes256(_) => "AES-256-GCM",
        };
        f.debug_struct("EnvelopeCipher")
            .field("cipher", &variant)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::store::LocalNoteStore;

    fn cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(&[0x11; 32]).unwrap()
    }

    #[test]
    fn test_round_trip_all_key_sizes() {
        for len in VALID_KEY_LENGTHS {
            let cipher = EnvelopeCipher::new(&vec![0x5A; len]).unwrap();
            let envelope = cipher.encrypt(b"note body", Some(b"notes/a.md")).unwrap();
            let plaintext = cipher.decrypt(&envelope, Some(b"notes/a.md")).unwrap();
            assert_eq!(plaintext, b"note body", "key length {len}");
        }
    }

    #[test]
    fn test_envelope_layout() {
        let envelope = cipher().encrypt(b"hello", None).unwrap();
        let (header, body) = split_header(&envelope).unwrap();
        assert_eq!(header, b"%NOTEVAULT-ENVELOPE/1\n");
        let raw = BASE64.decode(body).unwrap();
        assert_eq!(raw.len(), NONCE_LEN + 5 + TAG_LEN);
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = cipher();
        let envelope = cipher.encrypt(b"", None).unwrap();
        assert!(NoteContent::classify(&envelope).is_envelope());
        assert_eq!(cipher.open(&envelope, None).unwrap(), Opened::Decrypted(Vec::new()));
    }

    #[test]
    fn test_invalid_key_lengths() {
        for len in [0usize, 8, 15, 17, 31, 33, 64] {
            assert!(matches!(
                EnvelopeCipher::new(&vec![0u8; len]),
                Err(EnvelopeError::InvalidKeyLength(l)) if l == len
            ));
        }
    }

    #[test]
    fn test_destroyed_master_key_rejected() {
        let key = MasterKey::generate();
        key.destroy();
        assert!(matches!(
            EnvelopeCipher::from_master_key(&key),
            Err(EnvelopeError::KeyAccess(KeyAccessError::Destroyed))
        ));
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let cipher = cipher();
        let envelope = cipher.encrypt(b"secret", Some(b"one")).unwrap();
        assert!(cipher.decrypt(&envelope, Some(b"two")).is_err());
        assert!(cipher.decrypt(&envelope, None).is_err());
    }

    #[test]
    fn test_plaintext_passthrough() {
        let cipher = cipher();
        for input in [
            &b""[..],
            b"# Title\n\nbody",
            b"%NOTEVAULT",
            b"%NOTEVAULT-ENVELOPE/",
            b"%NOTEVAULT-ENVELOPE/1",
            b"%NOTEVAULT-ENVELOPE/1 with a very long line and no newline nearby\n",
        ] {
            assert_eq!(cipher.open(input, None).unwrap(), Opened::Plaintext(input.to_vec()));
            assert!(!NoteContent::classify(input).is_envelope());
        }
    }

    #[test]
    fn test_unknown_version_rejected() {
        let cipher = cipher();
        let envelope = cipher.encrypt(b"hello", None).unwrap();
        let (_, body) = split_header(&envelope).unwrap();
        let mut forged = header_line(2);
        forged.extend_from_slice(body);
        assert!(matches!(
            cipher.decrypt(&forged, None),
            Err(EnvelopeError::Decryption { .. })
        ));

        let mut garbage = b"%NOTEVAULT-ENVELOPE/x\n".to_vec();
        garbage.extend_from_slice(body);
        assert!(cipher.decrypt(&garbage, None).is_err());
    }

    #[test]
    fn test_malformed_body_rejected() {
        let cipher = cipher();
        let short = [header_line(1), BASE64.encode([0u8; 20]).into_bytes()].concat();
        let not_base64 = [header_line(1), b"!!not base64!!".to_vec()].concat();
        for input in [short, not_base64, header_line(1)] {
            let err = cipher.decrypt(&input, None).unwrap_err();
            assert!(err.is_integrity_failure());
        }
    }

    #[test]
    fn test_trailing_newline_tolerated() {
        let cipher = cipher();
        let mut envelope = cipher.encrypt(b"hello", None).unwrap();
        envelope.extend_from_slice(b"\r\n");
        assert_eq!(cipher.decrypt(&envelope, None).unwrap(), b"hello");
    }

    #[test]
    fn test_error_context_display() {
        let context = FileContext::new()
            .with_path("notes/today.md")
            .with_operation("decrypt");
        let err = EnvelopeError::Decryption { context };
        let message = err.to_string();
        assert!(message.contains("decrypt"));
        assert!(message.contains("today.md"));
    }

    #[test]
    fn test_action_allowed_without_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalNoteStore::new();
        let plain = dir.path().join("plain.md");
        let sealed = dir.path().join("sealed.md");
        std::fs::write(&plain, b"# just text").unwrap();
        std::fs::write(&sealed, cipher().encrypt(&[b'x'; 4096], None).unwrap()).unwrap();

        let allowed = |path: &Path| EnvelopeCipher::is_action_allowed_without_password(&store, path);
        assert!(allowed(&plain).unwrap());
        assert!(!allowed(&sealed).unwrap());
        assert!(allowed(&dir.path().join("missing.md")).unwrap());
        assert!(matches!(
            allowed(dir.path()),
            Err(EnvelopeError::Store { .. })
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let debug_output = format!("{:?}", EnvelopeCipher::new(&[0xAA; 16]).unwrap());
        assert!(debug_output.contains("AES-128-GCM"));
        assert!(!debug_output.contains("170"));
    }
}
