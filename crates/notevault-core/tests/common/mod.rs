#![allow(dead_code)]

use std::path::{Path, PathBuf};

use notevault_core::crypto::kdf::{KeyDerivation, Password};
use notevault_core::crypto::keys::MasterKey;
use notevault_core::vault::{NoteVault, VaultConfig};
use tempfile::TempDir;

pub const TEST_PASSWORD: &str = "test-password-12345";
pub const OTHER_PASSWORD: &str = "another-password-678";

/// Iteration count low enough to keep tests fast.
pub const TEST_ITERATIONS: u32 = 10;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_kdf() -> KeyDerivation {
    KeyDerivation::new(b"notevault-test-salt".to_vec()).with_iterations(TEST_ITERATIONS)
}

pub fn key_from_password(password: &str) -> MasterKey {
    test_kdf()
        .derive_master_key(&mut Password::new(password))
        .unwrap()
}

/// Write `files` (relative path, content) under `root`, creating directories.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) -> Vec<PathBuf> {
    files
        .iter()
        .map(|(name, content)| {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, content).unwrap();
            path
        })
        .collect()
}

/// A temp directory holding a few markdown notes.
pub fn notes_dir() -> (TempDir, Vec<PathBuf>) {
    let dir = TempDir::new().unwrap();
    let paths = write_tree(
        dir.path(),
        &[
            ("a.md", &b"# Alpha\n\nfirst note"[..]),
            ("b.md", &b"# Beta\n\n- [ ] todo"[..]),
            ("journal/2026-01-01.md", "unicode: caf\u{e9} \u{1f4dd}".as_bytes()),
        ],
    );
    (dir, paths)
}

/// An unprotected vault over [`notes_dir`], opened in guest mode.
pub fn guest_vault() -> (TempDir, NoteVault) {
    let (dir, _) = notes_dir();
    let vault = NoteVault::create_with_config(
        dir.path(),
        VaultConfig::unprotected().with_iterations(TEST_ITERATIONS),
    )
    .unwrap();
    vault.open_without_password().unwrap();
    (dir, vault)
}

/// A vault over [`notes_dir`] protected with [`TEST_PASSWORD`] and unlocked.
pub fn protected_vault() -> (TempDir, NoteVault) {
    let (dir, mut vault) = guest_vault();
    vault
        .set_password(&mut Password::new(TEST_PASSWORD))
        .unwrap();
    (dir, vault)
}

pub fn is_envelope(path: &Path) -> bool {
    std::fs::read(path)
        .unwrap()
        .starts_with(notevault_core::fs::envelope::HEADER_PREFIX)
}
