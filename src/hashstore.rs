//! C2: hash store & validator.
//!
//! Each hashed file gets a `HashRecord` on disk, addressed by a
//! deterministic, (mostly) reversible encoding of its absolute path. The
//! hash directory is a flat, human-inspectable manifest: an operator can
//! `ls` it and, for any name not using the SHA-256 fallback, read off
//! which file it covers.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CommandRunnerError, Result};
use crate::fileio;

/// Marker byte prefixing a fallback-encoded hash filename. Illegal in the
/// normal encoding (every literal `#` is rewritten to `~1`), so the two
/// encoding branches are trivially distinguishable by inspecting byte 0.
const FALLBACK_MARKER: char = '#';

/// Filename length budget, leaving room for the `.json` suffix on
/// filesystems with a 255-byte name limit.
const FILENAME_BUDGET: usize = 250;

const SUFFIX: &str = ".json";

/// The nine reserved characters plus the fallback marker, each mapped to a
/// two-character `~N` escape. Order fixes the digit each character maps
/// to; `~` itself is handled separately (doubled, not table-driven).
const ESCAPES: [(char, char); 10] = [
    ('/', '0'),
    (FALLBACK_MARKER, '1'),
    ('\\', '2'),
    (':', '3'),
    ('*', '4'),
    ('?', '5'),
    ('"', '6'),
    ('<', '7'),
    ('>', '8'),
    ('|', '9'),
];

fn escape_for(c: char) -> Option<char> {
    ESCAPES.iter().find(|(ch, _)| *ch == c).map(|(_, d)| *d)
}

fn unescape_digit(d: char) -> Option<char> {
    ESCAPES.iter().find(|(_, dd)| *dd == d).map(|(ch, _)| *ch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Normal,
    Fallback,
}

/// Encode `path` into a hash filename (without the `.json` suffix),
/// returning which branch was used.
#[must_use]
pub fn encode_path(path: &Path) -> (String, Encoding) {
    let raw = path.to_string_lossy();
    let mut normal = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        if c == '~' {
            normal.push('~');
            normal.push('~');
        } else if let Some(digit) = escape_for(c) {
            normal.push('~');
            normal.push(digit);
        } else {
            normal.push(c);
        }
    }

    if normal.len() <= FILENAME_BUDGET {
        (normal, Encoding::Normal)
    } else {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        let digest = hex::encode(hasher.finalize());
        (format!("{FALLBACK_MARKER}{digest}"), Encoding::Fallback)
    }
}

/// Full hash filename (with `.json` suffix) for `path`.
#[must_use]
pub fn hash_file_name(path: &Path) -> String {
    let (encoded, _) = encode_path(path);
    format!("{encoded}{SUFFIX}")
}

/// Decode a hash filename (without the `.json` suffix) back to the
/// original path. Fails if `name` uses the (irreversible) fallback
/// encoding, or if the escape sequences are malformed.
pub fn decode_name(name: &str) -> Result<PathBuf> {
    if name.starts_with(FALLBACK_MARKER) {
        return Err(CommandRunnerError::ManifestInvalid(format!(
            "fallback-encoded name is not reversible: {name}"
        )));
    }

    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            let next = chars.next().ok_or_else(|| {
                CommandRunnerError::ManifestInvalid(format!(
                    "truncated escape sequence in {name}"
                ))
            })?;
            if next == '~' {
                out.push('~');
            } else if let Some(ch) = unescape_digit(next) {
                out.push(ch);
            } else {
                return Err(CommandRunnerError::ManifestInvalid(format!(
                    "unknown escape '~{next}' in {name}"
                )));
            }
        } else {
            out.push(c);
        }
    }
    Ok(PathBuf::from(out))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashRecord {
    pub version: String,
    pub format: String,
    pub timestamp: String,
    pub file: FileSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSection {
    pub path: String,
    pub hash: HashSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashSection {
    pub algorithm: String,
    pub value: String,
}

impl HashRecord {
    fn new(path: &Path, hash_hex: &str) -> Self {
        Self {
            version: "1.0".to_string(),
            format: "file-hash".to_string(),
            timestamp: jiff::Timestamp::now().to_string(),
            file: FileSection {
                path: path.to_string_lossy().into_owned(),
                hash: HashSection {
                    algorithm: "sha256".to_string(),
                    value: hash_hex.to_string(),
                },
            },
        }
    }
}

/// Directory mode for the hash store.
pub const HASH_DIR_MODE: u32 = 0o750;
/// File mode for each `HashRecord`.
pub const HASH_FILE_MODE: u32 = 0o640;

pub struct HashStore {
    dir: PathBuf,
}

fn sha256_hex_of_reader(mut r: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl HashStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(HASH_DIR_MODE))?;
        }
        Ok(Self { dir })
    }

    fn record_path(&self, target: &Path) -> PathBuf {
        self.dir.join(hash_file_name(target))
    }

    /// Compute the SHA-256 of `target_path`, write a `HashRecord`, and
    /// return `(hash_file_path, "sha256:<hex>")`. Refuses to overwrite an
    /// existing record unless `force` is set.
    pub fn record(&self, target_path: &Path, force: bool) -> Result<(PathBuf, String)> {
        let bytes = fileio::read_all(target_path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash_hex = hex::encode(hasher.finalize());

        let record_path = self.record_path(target_path);
        if record_path.exists() && !force {
            return Err(CommandRunnerError::ManifestInvalid(format!(
                "hash record already exists for {} (use force to overwrite)",
                target_path.display()
            )));
        }

        let record = HashRecord::new(target_path, &hash_hex);
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| CommandRunnerError::ManifestInvalid(e.to_string()))?;
        fileio::write_atomic(&record_path, &json, HASH_FILE_MODE)?;

        Ok((record_path, format!("sha256:{hash_hex}")))
    }

    fn load_record(&self, target_path: &Path) -> Result<HashRecord> {
        let record_path = self.record_path(target_path);
        if !record_path.exists() {
            return Err(CommandRunnerError::RecordNotFound(
                target_path.display().to_string(),
            ));
        }
        let bytes = fileio::read_all(&record_path)?;
        let record: HashRecord = serde_json::from_slice(&bytes)
            .map_err(|e| CommandRunnerError::ManifestInvalid(e.to_string()))?;

        if record.file.path != target_path.to_string_lossy() {
            return Err(CommandRunnerError::ManifestInvalid(format!(
                "record path mismatch: record covers {} but {} was requested",
                record.file.path,
                target_path.display()
            )));
        }
        if record.file.hash.algorithm != "sha256" {
            return Err(CommandRunnerError::ManifestInvalid(format!(
                "unsupported hash algorithm: {}",
                record.file.hash.algorithm
            )));
        }
        Ok(record)
    }

    /// Re-hash `target_path` and compare against the stored record.
    pub fn verify(&self, target_path: &Path) -> Result<()> {
        let record = self.load_record(target_path)?;
        let file = fileio::open_read(target_path)?;
        let actual = sha256_hex_of_reader(file)?;
        if actual != record.file.hash.value {
            return Err(CommandRunnerError::HashMismatch {
                path: target_path.display().to_string(),
                expected: truncate_hash(&record.file.hash.value),
                actual: truncate_hash(&actual),
            });
        }
        Ok(())
    }

    /// Atomically verify-and-read: the target is opened exactly once, its
    /// hash is computed while the bytes are buffered, and the bytes are
    /// only returned if the digest matches. This removes the TOCTOU window
    /// between a separate `verify()` and a later `read()`.
    pub fn verify_and_read(&self, target_path: &Path) -> Result<Vec<u8>> {
        let record = self.load_record(target_path)?;
        let mut file = fileio::open_read(target_path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());

        if actual != record.file.hash.value {
            return Err(CommandRunnerError::HashMismatch {
                path: target_path.display().to_string(),
                expected: truncate_hash(&record.file.hash.value),
                actual: truncate_hash(&actual),
            });
        }
        Ok(bytes)
    }

    /// Same as [`verify`](Self::verify_and_read) but against an
    /// already-open handle (e.g. one held by the caller for an unrelated
    /// reason); `target_path` is used only to look up the expected record.
    pub fn verify_from_handle(&self, target_path: &Path, mut handle: &File) -> Result<Vec<u8>> {
        let record = self.load_record(target_path)?;
        let mut bytes = Vec::new();
        handle.read_to_end(&mut bytes)?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());

        if actual != record.file.hash.value {
            return Err(CommandRunnerError::HashMismatch {
                path: target_path.display().to_string(),
                expected: truncate_hash(&record.file.hash.value),
                actual: truncate_hash(&actual),
            });
        }
        Ok(bytes)
    }
}

fn truncate_hash(hash: &str) -> String {
    if hash.len() > 16 {
        format!("{}…", &hash[..16])
    } else {
        hash.to_string()
    }
}
