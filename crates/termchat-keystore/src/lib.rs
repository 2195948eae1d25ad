use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Slot name recorded in the on-disk envelope.
pub const SECRET_SLOT: &str = "openai_api_key";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to read key store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write key store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode key store {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode key store payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unsupported key store envelope version: {0}")]
    UnsupportedVersion(u32),
}

/// Durable storage for the single provider credential held on this device.
pub trait KeyStore {
    fn get(&self) -> Result<Option<String>, KeyStoreError>;
    fn set(&mut self, secret: &str) -> Result<(), KeyStoreError>;
    fn remove(&mut self) -> Result<(), KeyStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    slot: String,
    secret: String,
}

/// JSON file under the user's home directory. Not synced anywhere.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self) -> Result<Option<String>, KeyStoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let envelope = read_envelope(&self.path)?;
        if envelope.slot != SECRET_SLOT || envelope.secret.is_empty() {
            return Ok(None);
        }
        Ok(Some(envelope.secret))
    }

    fn set(&mut self, secret: &str) -> Result<(), KeyStoreError> {
        let envelope = Envelope {
            version: 1,
            slot: SECRET_SLOT.to_string(),
            secret: secret.to_string(),
        };
        write_envelope(&self.path, &envelope)?;
        debug!(path = %self.path.display(), "stored credential");
        Ok(())
    }

    fn remove(&mut self) -> Result<(), KeyStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed stored credential");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(KeyStoreError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Process-local store, used by tests and by sessions that should not touch disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    secret: Option<String>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self) -> Result<Option<String>, KeyStoreError> {
        Ok(self.secret.clone().filter(|value| !value.is_empty()))
    }

    fn set(&mut self, secret: &str) -> Result<(), KeyStoreError> {
        self.secret = Some(secret.to_string());
        Ok(())
    }

    fn remove(&mut self) -> Result<(), KeyStoreError> {
        self.secret = None;
        Ok(())
    }
}

/// `abcd...wxyz` for secrets longer than eight characters, the raw value otherwise.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        secret.to_string()
    }
}

fn read_envelope(path: &Path) -> Result<Envelope, KeyStoreError> {
    let raw = fs::read_to_string(path).map_err(|source| KeyStoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let envelope: Envelope =
        serde_json::from_str(&raw).map_err(|source| KeyStoreError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if envelope.version != 1 {
        return Err(KeyStoreError::UnsupportedVersion(envelope.version));
    }
    Ok(envelope)
}

fn write_envelope(path: &Path, envelope: &Envelope) -> Result<(), KeyStoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| KeyStoreError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let serialized = serde_json::to_vec_pretty(envelope)?;
    let staging = path.with_extension("json.tmp");
    let write_err = |source| KeyStoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    // The secret only ever lands in a file created owner-only; the rename
    // then replaces whatever was at `path`, permissions included.
    let mut file = open_owner_only(&staging).map_err(write_err)?;
    let written = file.write_all(&serialized).and_then(|()| file.sync_all());
    drop(file);
    if let Err(source) = written.and_then(|()| fs::rename(&staging, path)) {
        let _ = fs::remove_file(&staging);
        return Err(write_err(source));
    }
    Ok(())
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
