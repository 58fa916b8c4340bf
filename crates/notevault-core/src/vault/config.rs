#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, base64::Base64, serde_as};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    crypto::{
        kdf::{
            DEFAULT_KEY_LENGTH_BITS, KdfAlgorithm, KdfError, KeyDerivation, Password,
            constant_time_eq, default_iterations, random_salt,
        },
        keys::{KeyAccessError, MasterKey},
    },
    fs::store::{LocalNoteStore, NoteStore, StoreError},
    vault::session::VaultSession,
};

/// Name of the vault configuration file at the vault root.
pub const CONFIG_FILE_NAME: &str = ".notevault.json";

/// Configuration format written by this version.
pub const CONFIG_FORMAT: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Vault configuration not found at {0:?}")]
    NotFound(PathBuf),

    #[error("Vault configuration already exists at {0:?}")]
    AlreadyExists(PathBuf),

    #[error("Unsupported vault configuration format: {0}")]
    UnsupportedFormat(u32),

    #[error("Invalid vault configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse vault configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Key derivation failed: {0}")]
    Kdf(#[from] KdfError),

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Per-vault settings stored in `.notevault.json`.
///
/// ```json
/// {
///   "format": 1,
///   "kdf": "PBKDF2-HMAC-SHA256",
///   "salt": "q83vEjRWeJCrze8SNFZ4kA==",
///   "iterations": 500000,
///   "keyLengthBits": 256,
///   "keyCheck": "..."
/// }
/// ```
///
/// `keyCheck` is present iff the vault is password-protected. The salt is
/// regenerated every time a password is set or changed.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    pub format: u32,
    #[serde_as(as = "DisplayFromStr")]
    pub kdf: KdfAlgorithm,
    #[serde_as(as = "Base64")]
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub key_length_bits: usize,
    #[serde_as(as = "Option<Base64>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_check: Option<Vec<u8>>,
}

impl VaultConfig {
    /// Configuration for a vault without a password.
    pub fn unprotected() -> Self {
        Self {
            format: CONFIG_FORMAT,
            kdf: KdfAlgorithm::default(),
            salt: random_salt(),
            iterations: default_iterations(),
            key_length_bits: DEFAULT_KEY_LENGTH_BITS,
            key_check: None,
        }
    }

    /// Configuration for a new vault protected by `password`.
    ///
    /// Returns the derived master key alongside the config.
    pub fn protected(password: &mut Password) -> Result<(Self, MasterKey), ConfigError> {
        Self::unprotected().protect(password)
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, kdf: KdfAlgorithm) -> Self {
        self.kdf = kdf;
        self
    }

    /// Derive a protected copy of this configuration under a fresh salt.
    ///
    /// Algorithm, work factor and key length carry over.
    #[instrument(level = "debug", skip_all)]
    pub fn protect(&self, password: &mut Password) -> Result<(Self, MasterKey), ConfigError> {
        let mut config = Self {
            salt: random_salt(),
            key_check: None,
            ..self.clone()
        };
        let master_key = config.key_derivation().derive_master_key(password)?;
        config.key_check = Some(master_key.check_value()?.to_vec());
        debug!(iterations = config.iterations, "Derived protected configuration");
        Ok((config, master_key))
    }

    /// Unprotected copy of this configuration under a fresh salt.
    #[must_use]
    pub fn unprotect(&self) -> Self {
        Self {
            salt: random_salt(),
            key_check: None,
            ..self.clone()
        }
    }

    pub fn is_protected(&self) -> bool {
        self.key_check.is_some()
    }

    pub fn key_derivation(&self) -> KeyDerivation {
        KeyDerivation::new(self.salt.clone())
            .with_iterations(self.iterations)
            .with_key_length_bits(self.key_length_bits)
            .with_algorithm(self.kdf)
    }

    /// The stored key check value, if the vault is protected.
    pub fn key_check(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        self.key_check
            .as_deref()
            .map(|bytes| {
                <[u8; 32]>::try_from(bytes).map_err(|_| {
                    ConfigError::Invalid(format!("keyCheck must be 32 bytes, got {}", bytes.len()))
                })
            })
            .transpose()
    }

    /// Whether `master_key` is the key this configuration was protected with.
    pub fn matches_key(&self, master_key: &MasterKey) -> Result<bool, ConfigError> {
        match self.key_check()? {
            Some(expected) => Ok(constant_time_eq(
                &master_key.check_value()?,
                &expected,
            )),
            None => Ok(false),
        }
    }

    /// A locked session for this vault.
    pub fn session(&self) -> Result<VaultSession, ConfigError> {
        let session = VaultSession::new(self.key_derivation());
        Ok(match self.key_check()? {
            Some(check) => session.with_key_check(check),
            None => session,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.format != CONFIG_FORMAT {
            return Err(ConfigError::UnsupportedFormat(self.format));
        }
        if self.salt.is_empty() {
            return Err(ConfigError::Invalid("salt must not be empty".to_string()));
        }
        if self.iterations == 0 {
            return Err(ConfigError::Invalid("iterations must be positive".to_string()));
        }
        if ![128, 192, 256].contains(&self.key_length_bits) {
            return Err(ConfigError::Invalid(format!(
                "keyLengthBits must be 128, 192 or 256, got {}",
                self.key_length_bits
            )));
        }
        self.key_check()?;
        Ok(())
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE_NAME)
    }

    pub fn exists(root: &Path) -> bool {
        Self::path(root).is_file()
    }

    /// Load the configuration of the vault at `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        Self::load_from(&LocalNoteStore, root)
    }

    pub fn load_from(store: &dyn NoteStore, root: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(root);
        let bytes = store.read(&path).map_err(|e| {
            if e.is_not_found() {
                ConfigError::NotFound(path.clone())
            } else {
                ConfigError::Store(e)
            }
        })?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        debug!(protected = config.is_protected(), "Loaded vault configuration");
        Ok(config)
    }

    /// Write the configuration atomically.
    pub fn save(&self, root: &Path) -> Result<(), ConfigError> {
        self.save_to(&LocalNoteStore, root)
    }

    pub fn save_to(&self, store: &dyn NoteStore, root: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self)?;
        store.write(&Self::path(root), &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unprotected_defaults() {
        let config = VaultConfig::unprotected();
        assert_eq!(config.format, CONFIG_FORMAT);
        assert_eq!(config.kdf, KdfAlgorithm::Pbkdf2HmacSha256);
        assert_eq!(config.salt.len(), 16);
        assert!(!config.is_protected());
        assert!(config.key_check().unwrap().is_none());
    }

    #[test]
    fn test_protect_uses_fresh_salt() {
        let base = VaultConfig::unprotected().with_iterations(10);
        let (first, key1) = base.protect(&mut Password::new("password")).unwrap();
        let (second, key2) = base.protect(&mut Password::new("password")).unwrap();

        assert!(first.is_protected());
        assert_ne!(first.salt, base.salt);
        assert_ne!(first.salt, second.salt);
        assert_eq!(first.iterations, 10);
        assert_ne!(
            key1.with_key(<[u8]>::to_vec).unwrap(),
            key2.with_key(<[u8]>::to_vec).unwrap()
        );
        assert!(first.matches_key(&key1).unwrap());
        assert!(!first.matches_key(&key2).unwrap());
    }

    #[test]
    fn test_session_verifies_password() {
        let (config, _key) = VaultConfig::unprotected()
            .with_iterations(10)
            .protect(&mut Password::new("password"))
            .unwrap();
        let session = config.session().unwrap();
        assert!(session.unlock(&mut Password::new("not the password")).is_err());
        session.unlock(&mut Password::new("password")).unwrap();
        assert!(session.is_protection_enabled());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let (config, _key) = VaultConfig::unprotected()
            .with_iterations(10)
            .protect(&mut Password::new("password"))
            .unwrap();

        assert!(!VaultConfig::exists(dir.path()));
        config.save(dir.path()).unwrap();
        assert!(VaultConfig::exists(dir.path()));

        let loaded = VaultConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);

        let json = std::fs::read_to_string(VaultConfig::path(dir.path())).unwrap();
        assert!(json.contains("\"keyLengthBits\": 256"));
        assert!(json.contains("\"kdf\": \"PBKDF2-HMAC-SHA256\""));
        assert!(json.contains("\"keyCheck\""));
    }

    #[test]
    fn test_unprotected_omits_key_check() {
        let json = serde_json::to_string(&VaultConfig::unprotected()).unwrap();
        assert!(!json.contains("keyCheck"));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VaultConfig::load(dir.path()),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = serde_json::to_value(VaultConfig::unprotected()).unwrap();
        value["format"] = serde_json::json!(7);
        std::fs::write(VaultConfig::path(dir.path()), value.to_string()).unwrap();
        assert!(matches!(
            VaultConfig::load(dir.path()),
            Err(ConfigError::UnsupportedFormat(7))
        ));
    }

    #[test]
    fn test_load_rejects_unknown_kdf() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = serde_json::to_value(VaultConfig::unprotected()).unwrap();
        value["kdf"] = serde_json::json!("argon2id");
        std::fs::write(VaultConfig::path(dir.path()), value.to_string()).unwrap();
        assert!(matches!(
            VaultConfig::load(dir.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_rejects_bad_key_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = serde_json::to_value(VaultConfig::unprotected()).unwrap();
        value["keyLengthBits"] = serde_json::json!(512);
        std::fs::write(VaultConfig::path(dir.path()), value.to_string()).unwrap();
        assert!(matches!(
            VaultConfig::load(dir.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
