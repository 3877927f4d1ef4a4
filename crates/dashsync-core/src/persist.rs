// ── Persistence backends ──
//
// Pluggable key-value storage behind the cache mirror, the sync queue,
// and the layout store. Records are wrapped in a versioned envelope so
// schema drift fails loudly instead of silently resetting state.

use std::path::PathBuf;

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Version stamped into every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage I/O failed for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("persisted record is corrupt: {message}")]
    Corrupt { message: String },

    #[error("persisted schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("failed to serialize record: {message}")]
    Serialization { message: String },
}

// ── StorageBackend ──────────────────────────────────────────────────

/// Synchronous key-value storage used as the persistent mirror.
///
/// Implementations must tolerate concurrent calls from multiple tasks;
/// values are opaque strings (JSON envelopes produced by [`encode`]).
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, PersistError>;
    fn write(&self, key: &str, value: &str) -> Result<(), PersistError>;
    fn remove(&self, key: &str) -> Result<(), PersistError>;
    fn keys(&self) -> Result<Vec<String>, PersistError>;
}

// ── Versioned envelope ──────────────────────────────────────────────

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

#[derive(Debug, serde::Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: u32,
}

/// Wrap `data` in the versioned envelope and serialize to JSON.
pub fn encode<T: Serialize>(data: &T) -> Result<String, PersistError> {
    let envelope = Envelope {
        version: SCHEMA_VERSION,
        data,
    };
    serde_json::to_string(&envelope).map_err(|e| PersistError::Serialization {
        message: e.to_string(),
    })
}

/// Decode a persisted envelope, failing loudly on version mismatch
/// or corrupt JSON.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, PersistError> {
    let header: VersionHeader =
        serde_json::from_str(raw).map_err(|e| PersistError::Corrupt {
            message: e.to_string(),
        })?;

    if header.version != SCHEMA_VERSION {
        return Err(PersistError::SchemaMismatch {
            found: header.version,
            expected: SCHEMA_VERSION,
        });
    }

    let envelope: Envelope<T> =
        serde_json::from_str(raw).map_err(|e| PersistError::Corrupt {
            message: e.to_string(),
        })?;
    Ok(envelope.data)
}

// ── MemoryBackend ───────────────────────────────────────────────────

/// In-process backend for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), PersistError> {
        self.entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, PersistError> {
        Ok(self.entries.iter().map(|r| r.key().clone()).collect())
    }
}

// ── FileBackend ─────────────────────────────────────────────────────

/// One file per key under a directory. Keys are escaped into safe
/// file names reversibly, so `keys()` can recover the originals.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create the backend, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PersistError::Io {
            key: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(escape_key(key))
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<String>, PersistError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError::Io {
                key: key.to_owned(),
                source: e,
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), PersistError> {
        std::fs::write(self.path_for(key), value).map_err(|e| PersistError::Io {
            key: key.to_owned(),
            source: e,
        })
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::Io {
                key: key.to_owned(),
                source: e,
            }),
        }
    }

    fn keys(&self) -> Result<Vec<String>, PersistError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| PersistError::Io {
            key: self.dir.display().to_string(),
            source: e,
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistError::Io {
                key: self.dir.display().to_string(),
                source: e,
            })?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = unescape_key(name) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

// ── Key escaping ────────────────────────────────────────────────────

/// Escape a key into a safe file name. Bytes outside `[A-Za-z0-9_.-]`
/// become `%XX`, so the mapping is reversible.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'.' | b'-' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02x}"));
            }
        }
    }
    out
}

/// Reverse [`escape_key`]. Returns `None` for names that are not valid
/// escapes (foreign files in the directory).
fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// ── Tests ───────────────────────────────────────────────────────────
