//! Filesystem helpers: directory copies, overlays, and the staged swap used
//! by the provisioning commit step.

use std::fs;
use std::path::Path;

use crate::errors::{CaravelError, CaravelResult};

/// Ensure a directory exists, creating it and any parents if needed.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Recursively copy `src` into `dst`, creating `dst` if needed.
///
/// Existing files in `dst` are overwritten, which is what makes this usable
/// both for the initial package copy and for patch overlays (later overlays
/// earlier).
pub fn copy_dir_all(src: &Path, dst: &Path) -> CaravelResult<()> {
    ensure_dir(dst).map_err(CaravelError::Io)?;
    for entry in fs::read_dir(src).map_err(CaravelError::Io)? {
        let entry = entry.map_err(CaravelError::Io)?;
        let target = dst.join(entry.file_name());
        let ty = entry.file_type().map_err(CaravelError::Io)?;
        if ty.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(CaravelError::Io)?;
        }
    }
    Ok(())
}

/// Move every top-level entry of `staging` into `target`, replacing entries
/// that already exist.
///
/// The caller runs the entire resolve/merge/assembly pipeline into `staging`
/// first; this swap only happens after the pipeline succeeded, so a
/// mid-pipeline failure leaves `target` untouched.
pub fn swap_in(staging: &Path, target: &Path) -> CaravelResult<()> {
    ensure_dir(target).map_err(CaravelError::Io)?;
    for entry in fs::read_dir(staging).map_err(CaravelError::Io)? {
        let entry = entry.map_err(CaravelError::Io)?;
        let dest = target.join(entry.file_name());
        if dest.exists() {
            if dest.is_dir() {
                fs::remove_dir_all(&dest).map_err(CaravelError::Io)?;
            } else {
                fs::remove_file(&dest).map_err(CaravelError::Io)?;
            }
        }
        // Rename first; fall back to copy when staging sits on another device.
        if fs::rename(entry.path(), &dest).is_err() {
            if entry.file_type().map_err(CaravelError::Io)?.is_dir() {
                copy_dir_all(&entry.path(), &dest)?;
                fs::remove_dir_all(entry.path()).map_err(CaravelError::Io)?;
            } else {
                fs::copy(entry.path(), &dest).map_err(CaravelError::Io)?;
                fs::remove_file(entry.path()).map_err(CaravelError::Io)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_overwrites_existing_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/a.txt"), "new").unwrap();
        fs::create_dir(dst.path().join("sub")).unwrap();
        fs::write(dst.path().join("sub/a.txt"), "old").unwrap();

        copy_dir_all(src.path(), dst.path()).unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("sub/a.txt")).unwrap(), "new");
    }

    #[test]
    fn swap_replaces_target_entries() {
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::create_dir(staging.path().join("bin")).unwrap();
        fs::write(staging.path().join("bin/tool"), "v2").unwrap();
        fs::create_dir(target.path().join("bin")).unwrap();
        fs::write(target.path().join("bin/tool"), "v1").unwrap();
        fs::write(target.path().join("keep.txt"), "untouched").unwrap();

        swap_in(staging.path(), target.path()).unwrap();
        assert_eq!(fs::read_to_string(target.path().join("bin/tool")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(target.path().join("keep.txt")).unwrap(), "untouched");
    }
}
