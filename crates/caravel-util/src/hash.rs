//! SHA-256 digests for artifact integrity checks.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::{CaravelError, CaravelResult};

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> CaravelResult<String> {
    let data = fs::read(path).map_err(CaravelError::Io)?;
    Ok(sha256_hex(&data))
}

/// Digest of a directory tree: file names and contents, walked in sorted
/// order so the result is stable across filesystems.
pub fn sha256_dir(dir: &Path) -> CaravelResult<String> {
    let mut hasher = Sha256::new();
    hash_dir_into(dir, Path::new(""), &mut hasher)?;
    Ok(hex(&hasher.finalize()))
}

fn hash_dir_into(dir: &Path, rel: &Path, hasher: &mut Sha256) -> CaravelResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(CaravelError::Io)?
        .collect::<Result<_, _>>()
        .map_err(CaravelError::Io)?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let rel = rel.join(entry.file_name());
        hasher.update(rel.to_string_lossy().as_bytes());
        if entry.file_type().map_err(CaravelError::Io)?.is_dir() {
            hash_dir_into(&entry.path(), &rel, hasher)?;
        } else {
            hasher.update(fs::read(entry.path()).map_err(CaravelError::Io)?);
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
