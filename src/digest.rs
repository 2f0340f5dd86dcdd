//! Content digests for files and directories
//!
//! SHA-256 throughout. Digests cover content bytes only, never
//! metadata, so touching a file without changing it does not
//! invalidate a fingerprint.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};
use walkdir::WalkDir;

/// Fixed-size SHA-256 content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    /// Parse a lowercase hex digest, as produced by `Display`
    pub fn parse_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Digest(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &hex::encode(self.0)[..12])
    }
}

/// Digest of an in-memory byte slice
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest(hasher.finalize().into())
}

/// Digest of a file's content, or `None` when the file is missing.
///
/// Directories hash as the sorted sequence of their contained regular
/// files; other read failures surface as errors.
pub fn hash_file(path: &Path) -> io::Result<Option<Digest>> {
    match File::open(path) {
        Ok(mut file) => {
            let metadata = file.metadata()?;
            if metadata.is_dir() {
                return hash_dir(path).map(Some);
            }
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(Some(Digest(hasher.finalize().into())))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Digest of a directory: the sorted sequence of
/// (relative-path, content-digest) pairs of contained regular files.
pub fn hash_dir(dir: &Path) -> io::Result<Digest> {
    let mut entries: Vec<(String, Digest)> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("walk {}: {}", dir.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let digest = hash_file(entry.path())?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file vanished during hash: {}", entry.path().display()),
            )
        })?;
        entries.push((rel, digest));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, digest) in &entries {
        hasher.update((rel.len() as u64).to_be_bytes());
        hasher.update(rel.as_bytes());
        hasher.update(digest.as_bytes());
    }
    Ok(Digest(hasher.finalize().into()))
}
