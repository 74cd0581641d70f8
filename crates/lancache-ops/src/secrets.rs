//! Encrypted secret storage.
//!
//! Secrets (refresh tokens, API keys for upstream services) live in
//! their own directory with restrictive permissions and are encrypted
//! at rest with a Salsa20 keystream. The cipher key is derived from the
//! server's own API key with SHA-256, so secrets are unreadable without
//! it; each file carries its random 8-byte nonce in front of the
//! ciphertext.

use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::state::write_json_atomic;

const NONCE_LENGTH: usize = 8;

/// Salsa20 constants for 32-byte keys ("expand 32-byte k").
const SIGMA: [u32; 4] = [0x6170_7865, 0x3320_646e, 0x7962_2d32, 0x6b20_6574];

/// Minimal Salsa20 keystream generator (20 rounds, 32-byte key).
struct Salsa20 {
    state: [u32; 16],
    keystream: [u8; 64],
    keystream_pos: usize,
}

impl Salsa20 {
    fn new(key: &[u8; 32], nonce: &[u8; NONCE_LENGTH]) -> Self {
        let word = |bytes: &[u8], i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };

        let mut state = [0u32; 16];
        state[0] = SIGMA[0];
        state[5] = SIGMA[1];
        state[10] = SIGMA[2];
        state[15] = SIGMA[3];
        for i in 0..4 {
            state[1 + i] = word(key, i * 4);
            state[11 + i] = word(key, 16 + i * 4);
        }
        state[6] = word(nonce, 0);
        state[7] = word(nonce, 4);
        // Block counter starts at zero.
        state[8] = 0;
        state[9] = 0;

        Self {
            state,
            keystream: [0; 64],
            keystream_pos: 64,
        }
    }

    fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
        state[b] ^= state[a].wrapping_add(state[d]).rotate_left(7);
        state[c] ^= state[b].wrapping_add(state[a]).rotate_left(9);
        state[d] ^= state[c].wrapping_add(state[b]).rotate_left(13);
        state[a] ^= state[d].wrapping_add(state[c]).rotate_left(18);
    }

    fn refill(&mut self) {
        let mut working = self.state;
        for _ in 0..10 {
            // Column round
            Self::quarter_round(&mut working, 0, 4, 8, 12);
            Self::quarter_round(&mut working, 5, 9, 13, 1);
            Self::quarter_round(&mut working, 10, 14, 2, 6);
            Self::quarter_round(&mut working, 15, 3, 7, 11);
            // Row round
            Self::quarter_round(&mut working, 0, 1, 2, 3);
            Self::quarter_round(&mut working, 5, 6, 7, 4);
            Self::quarter_round(&mut working, 10, 11, 8, 9);
            Self::quarter_round(&mut working, 15, 12, 13, 14);
        }
        for (i, word) in working.iter().enumerate() {
            let mixed = word.wrapping_add(self.state[i]);
            self.keystream[i * 4..(i + 1) * 4].copy_from_slice(&mixed.to_le_bytes());
        }
        self.state[8] = self.state[8].wrapping_add(1);
        if self.state[8] == 0 {
            self.state[9] = self.state[9].wrapping_add(1);
        }
        self.keystream_pos = 0;
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.keystream_pos >= 64 {
                self.refill();
            }
            *byte ^= self.keystream[self.keystream_pos];
            self.keystream_pos += 1;
        }
    }
}

/// Directory of encrypted secrets.
pub struct SecretStore {
    dir: PathBuf,
    key: [u8; 32],
}

impl SecretStore {
    /// Open (creating if needed) the secret directory. The cipher key
    /// is derived from `api_key` with SHA-256.
    pub fn open(dir: impl Into<PathBuf>, api_key: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700)?;

        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(api_key.as_bytes()));
        Ok(Self { dir, key })
    }

    fn secret_path(&self, name: &str) -> PathBuf {
        // File names are hex of the secret name, so callers can use
        // arbitrary identifiers.
        self.dir.join(format!("{}.bin", hex::encode(name)))
    }

    /// Encrypt and store a secret, replacing any previous value.
    pub fn store(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut payload = value.to_vec();
        Salsa20::new(&self.key, &nonce).apply(&mut payload);

        let mut file_content = Vec::with_capacity(NONCE_LENGTH + payload.len());
        file_content.extend_from_slice(&nonce);
        file_content.extend_from_slice(&payload);

        let path = self.secret_path(name);
        fs::write(&path, &file_content)?;
        restrict_permissions(&path, 0o600)?;
        debug!("stored secret '{name}'");
        Ok(())
    }

    /// Load and decrypt a secret. Absent secrets return `None`.
    pub fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.secret_path(name);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        if content.len() < NONCE_LENGTH {
            return Err(Error::SecretCorrupt(name.to_string()));
        }
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&content[..NONCE_LENGTH]);
        let mut payload = content[NONCE_LENGTH..].to_vec();
        Salsa20::new(&self.key, &nonce).apply(&mut payload);
        Ok(Some(payload))
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.secret_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Store a small JSON document as a secret sidecar (plaintext
    /// metadata such as auth mode, no credential material).
    pub fn store_metadata<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(format!("{}.json", hex::encode(name)));
        write_json_atomic(&path, value)?;
        restrict_permissions(&path, 0o600)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_a_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("secrets"), "api-key").unwrap();

        store.store("steam_refresh_token", b"top secret value").unwrap();
        let loaded = store.load("steam_refresh_token").unwrap().unwrap();
        assert_eq!(loaded, b"top secret value");
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("secrets"), "api-key").unwrap();
        store.store("token", b"hello world").unwrap();

        let raw = fs::read(store.secret_path("token")).unwrap();
        assert!(!raw.windows(11).any(|w| w == b"hello world"));
    }

    #[test]
    fn wrong_key_does_not_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets");
        let store = SecretStore::open(&path, "right-key").unwrap();
        store.store("token", b"hello world").unwrap();

        let wrong = SecretStore::open(&path, "wrong-key").unwrap();
        let loaded = wrong.load("token").unwrap().unwrap();
        assert_ne!(loaded, b"hello world");
    }

    #[test]
    fn missing_secret_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("secrets"), "k").unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn truncated_secret_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("secrets"), "k").unwrap();
        fs::write(store.secret_path("bad"), b"abc").unwrap();
        assert!(matches!(
            store.load("bad"),
            Err(Error::SecretCorrupt(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn secret_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("secrets"), "k").unwrap();
        store.store("token", b"v").unwrap();

        let mode = fs::metadata(store.secret_path("token"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn keystream_is_deterministic_per_nonce() {
        let key = [7u8; 32];
        let nonce = [1u8; 8];
        let mut a = vec![0u8; 100];
        let mut b = vec![0u8; 100];
        Salsa20::new(&key, &nonce).apply(&mut a);
        Salsa20::new(&key, &nonce).apply(&mut b);
        assert_eq!(a, b);

        let mut c = vec![0u8; 100];
        Salsa20::new(&key, &[2u8; 8]).apply(&mut c);
        assert_ne!(a, c);
    }
}
