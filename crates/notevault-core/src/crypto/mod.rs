//! Cryptographic primitives for note vaults

pub mod kdf;
pub mod keys;

// Re-export commonly used types
pub use kdf::{
    KdfAlgorithm, KdfError, KeyDerivation, Password, constant_time_eq, default_iterations,
    derive_auth_hash, derive_key, random_salt, validate_password,
};
pub use keys::{KeyAccessError, MasterKey};
