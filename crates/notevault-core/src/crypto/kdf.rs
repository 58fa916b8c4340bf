//! Password-based key derivation.
//!
//! Keys are derived with PBKDF2 (HMAC-SHA256 by default) from a per-vault
//! random salt. The password is wiped on every exit path of a derivation,
//! successful or not.

#![forbid(unsafe_code)]

use std::{fmt, str::FromStr};

use hmac::Hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use unicode_normalization::UnicodeNormalization;
use zeroize::{Zeroize, Zeroizing};

use super::keys::{KeyAccessError, MasterKey};

/// Default PBKDF2 work factor.
///
/// Roughly half a second with HMAC-SHA256 on current desktop hardware.
pub const DEFAULT_ITERATIONS: u32 = 500_000;

/// Reduced work factor used when `NOTEVAULT_FAST_KDF=1` is set.
///
/// This is for testing only. Never use in production!
const FAST_ITERATIONS: u32 = 1_000;

/// Default derived key length in bits (AES-256).
pub const DEFAULT_KEY_LENGTH_BITS: usize = 256;

/// Largest derived key [`derive_key`] will produce, in bits.
pub const MAX_KEY_LENGTH_BITS: usize = 4096;

/// Output length of [`derive_auth_hash`] in bits.
pub const AUTH_HASH_LENGTH_BITS: usize = 256;

/// Length of freshly generated salts in bytes.
pub const SALT_LENGTH: usize = 16;

/// Minimum password length in characters.
const MIN_PASSWORD_LENGTH: usize = 8;

/// Check if fast KDF mode is enabled via environment variable.
#[inline]
fn is_fast_kdf_enabled() -> bool {
    std::env::var("NOTEVAULT_FAST_KDF")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// The configured KDF work factor.
///
/// Returns [`DEFAULT_ITERATIONS`] unless `NOTEVAULT_FAST_KDF=1` is set.
pub fn default_iterations() -> u32 {
    if is_fast_kdf_enabled() {
        FAST_ITERATIONS
    } else {
        DEFAULT_ITERATIONS
    }
}

/// Errors raised by key derivation.
#[derive(Debug, Error)]
pub enum KdfError {
    #[error("Unsupported key derivation algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Iteration count must be greater than zero")]
    InvalidIterations,

    #[error("Invalid derived key length: {0} bits (must be a non-zero multiple of 8)")]
    InvalidKeyLength(usize),

    #[error("Salt must not be empty")]
    EmptySalt,

    /// The password buffer was already consumed by an earlier derivation.
    #[error("Password has already been wiped")]
    PasswordWiped,

    #[error("Password rejected: {0}")]
    WeakPassword(String),

    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Supported key derivation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdfAlgorithm {
    #[default]
    Pbkdf2HmacSha256,
    Pbkdf2HmacSha512,
}

impl KdfAlgorithm {
    /// Name used in vault configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            KdfAlgorithm::Pbkdf2HmacSha256 => "PBKDF2-HMAC-SHA256",
            KdfAlgorithm::Pbkdf2HmacSha512 => "PBKDF2-HMAC-SHA512",
        }
    }
}

impl fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KdfAlgorithm {
    type Err = KdfError;

    /// Accepts the configuration names as well as the JCA-style
    /// `PBKDF2WithHmacSHA256` spelling, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PBKDF2-HMAC-SHA256" | "PBKDF2WITHHMACSHA256" => Ok(KdfAlgorithm::Pbkdf2HmacSha256),
            "PBKDF2-HMAC-SHA512" | "PBKDF2WITHHMACSHA512" => Ok(KdfAlgorithm::Pbkdf2HmacSha512),
            _ => Err(KdfError::UnsupportedAlgorithm(s.to_owned())),
        }
    }
}

/// A caller-owned password buffer.
///
/// Passwords built from strings are NFC-normalized so that visually identical
/// input from different keyboards derives the same key. The buffer is zeroed
/// by [`wipe`](Password::wipe), by every derivation function in this module,
/// and on drop.
pub struct Password {
    bytes: Zeroizing<Vec<u8>>,
    wiped: bool,
}

impl Password {
    pub fn new(password: &str) -> Self {
        let normalized = Zeroizing::new(password.nfc().collect::<String>());
        Self {
            bytes: Zeroizing::new(normalized.as_bytes().to_vec()),
            wiped: false,
        }
    }

    pub fn from_secret(secret: &SecretString) -> Self {
        Self::new(secret.expose_secret())
    }

    /// Wrap raw password bytes without normalization.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            wiped: false,
        }
    }

    /// Zero the buffer and mark the password as consumed.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
        self.wiped = true;
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check this password against [`validate_password`].
    ///
    /// Raw passwords that are not valid UTF-8 are rejected.
    pub fn validate(&self) -> Result<(), KdfError> {
        let text = std::str::from_utf8(&self.bytes)
            .map_err(|_| KdfError::WeakPassword("password must be valid UTF-8".to_string()))?;
        validate_password(text)
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy the password into a second independently wiped buffer.
    pub fn duplicate(&self) -> Self {
        Self {
            bytes: Zeroizing::new(self.bytes.to_vec()),
            wiped: self.wiped,
        }
    }
}

impl From<&str> for Password {
    fn from(password: &str) -> Self {
        Self::new(password)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password")
            .field("bytes", &"[REDACTED]")
            .field("wiped", &self.wiped)
            .finish()
    }
}

/// Wipes the borrowed password when dropped, including during unwinding.
struct WipeOnExit<'a>(&'a mut Password);

impl Drop for WipeOnExit<'_> {
    fn drop(&mut self) {
        self.0.wipe();
    }
}

/// Derive key material from a password.
///
/// The password is wiped before this function returns, whatever the outcome.
///
/// # Errors
///
/// - `KdfError::PasswordWiped`: the password was consumed earlier
/// - `KdfError::InvalidIterations`, `KdfError::InvalidKeyLength`,
///   `KdfError::EmptySalt`: invalid parameters
/// - `KdfError::DerivationFailed`: the underlying PBKDF2 call failed
///
/// # Example
///
/// ```
/// use notevault_core::crypto::kdf::{derive_key, KdfAlgorithm, Password};
///
/// let mut password = Password::new("correct horse battery staple");
/// let key = derive_key(&mut password, b"per-vault-salt!!", 1_000, 256, KdfAlgorithm::default()).unwrap();
/// assert_eq!(key.len(), 32);
/// assert!(password.is_wiped());
/// ```
#[instrument(level = "debug", skip(password, salt), fields(salt_len = salt.len()))]
pub fn derive_key(
    password: &mut Password,
    salt: &[u8],
    iterations: u32,
    key_len_bits: usize,
    algorithm: KdfAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, KdfError> {
    let password = WipeOnExit(password);

    if password.0.is_wiped() {
        warn!("Refusing to derive from a wiped password");
        return Err(KdfError::PasswordWiped);
    }
    if iterations == 0 {
        return Err(KdfError::InvalidIterations);
    }
    if key_len_bits == 0 || key_len_bits > MAX_KEY_LENGTH_BITS || !key_len_bits.is_multiple_of(8) {
        return Err(KdfError::InvalidKeyLength(key_len_bits));
    }
    if salt.is_empty() {
        return Err(KdfError::EmptySalt);
    }

    trace!("Running PBKDF2");
    let start = std::time::Instant::now();
    let mut output = Zeroizing::new(vec![0u8; key_len_bits / 8]);
    let result = match algorithm {
        KdfAlgorithm::Pbkdf2HmacSha256 => {
            pbkdf2::pbkdf2::<Hmac<Sha256>>(password.0.expose(), salt, iterations, &mut output)
        }
        KdfAlgorithm::Pbkdf2HmacSha512 => {
            pbkdf2::pbkdf2::<Hmac<Sha512>>(password.0.expose(), salt, iterations, &mut output)
        }
    };
    result.map_err(|e| {
        warn!("PBKDF2 call failed");
        KdfError::DerivationFailed(e.to_string())
    })?;

    debug!(elapsed = ?start.elapsed(), "Key derived");
    Ok(output)
}

/// Derive a 256-bit authentication hash from a password.
///
/// Same contract as [`derive_key`] with the output length fixed to
/// [`AUTH_HASH_LENGTH_BITS`].
pub fn derive_auth_hash(
    password: &mut Password,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>, KdfError> {
    derive_key(
        password,
        salt,
        iterations,
        AUTH_HASH_LENGTH_BITS,
        KdfAlgorithm::Pbkdf2HmacSha256,
    )
}

/// Compare two byte sequences in constant time.
///
/// The running time depends only on the lengths, never on the position of
/// the first differing byte. Sequences of different length compare unequal.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Check a new password against the minimum strength policy.
///
/// # Requirements
///
/// - Not empty or only whitespace
/// - At least 8 characters long
pub fn validate_password(password: &str) -> Result<(), KdfError> {
    if password.trim().is_empty() {
        return Err(KdfError::WeakPassword(
            "password cannot be empty".to_string(),
        ));
    }

    let chars = password.chars().count();
    if chars < MIN_PASSWORD_LENGTH {
        return Err(KdfError::WeakPassword(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters (got {chars})"
        )));
    }

    Ok(())
}

/// Generate a random salt of [`SALT_LENGTH`] bytes.
pub fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Key derivation parameters for one vault.
///
/// # Example
///
/// ```
/// use notevault_core::crypto::kdf::{KeyDerivation, Password, random_salt};
///
/// let kdf = KeyDerivation::new(random_salt()).with_iterations(1_000);
/// let master_key = kdf.derive_master_key(&mut Password::new("hunter2-but-longer")).unwrap();
/// assert_eq!(master_key.len(), 32);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct KeyDerivation {
    salt: Vec<u8>,
    iterations: u32,
    key_len_bits: usize,
    algorithm: KdfAlgorithm,
}

impl KeyDerivation {
    /// Create parameters with the default work factor, key length and algorithm.
    pub fn new(salt: Vec<u8>) -> Self {
        Self {
            salt,
            iterations: default_iterations(),
            key_len_bits: DEFAULT_KEY_LENGTH_BITS,
            algorithm: KdfAlgorithm::default(),
        }
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_key_length_bits(mut self, key_len_bits: usize) -> Self {
        self.key_len_bits = key_len_bits;
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: KdfAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// A copy of the configured salt.
    pub fn salt(&self) -> Vec<u8> {
        self.salt.clone()
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn key_length_bits(&self) -> usize {
        self.key_len_bits
    }

    pub fn algorithm(&self) -> KdfAlgorithm {
        self.algorithm
    }

    /// Derive raw key material with the configured parameters.
    pub fn derive_key(&self, password: &mut Password) -> Result<Zeroizing<Vec<u8>>, KdfError> {
        derive_key(
            password,
            &self.salt,
            self.iterations,
            self.key_len_bits,
            self.algorithm,
        )
    }

    /// Derive a [`MasterKey`] with the configured parameters.
    ///
    /// The configured key length must be 128, 192 or 256 bits.
    pub fn derive_master_key(&self, password: &mut Password) -> Result<MasterKey, KdfError> {
        let bytes = self.derive_key(password)?;
        Ok(MasterKey::new(&bytes)?)
    }

    /// Derive a 256-bit authentication hash.
    ///
    /// `salt` and `iterations` default to the configured values.
    pub fn derive_auth_hash(
        &self,
        password: &mut Password,
        salt: Option<&[u8]>,
        iterations: Option<u32>,
    ) -> Result<Zeroizing<Vec<u8>>, KdfError> {
        derive_auth_hash(
            password,
            salt.unwrap_or(&self.salt),
            iterations.unwrap_or(self.iterations),
        )
    }
}

impl fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDerivation")
            .field("salt", &hex::encode(&self.salt))
            .field("iterations", &self.iterations)
            .field("key_len_bits", &self.key_len_bits)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}
