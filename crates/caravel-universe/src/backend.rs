//! The artifact backend contract and a filesystem-backed implementation.
//!
//! The engine never assumes a particular store; it only needs the contract
//! here plus the version-range semantics of `caravel-core::version`. The
//! filesystem backend mirrors the standard repository layout
//! (`group/as/dirs/artifact/version/`) and doubles as the local cache the
//! tests and local installs run against.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use caravel_core::version::Version;
use caravel_util::errors::{CaravelError, CaravelResult};
use caravel_util::{fs as cfs, hash};

/// Coordinates of one versioned artifact in a backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub group: String,
    pub artifact: String,
    pub version: String,
    pub extension: String,
    pub classifier: Option<String>,
}

impl Coordinate {
    pub fn new(group: impl Into<String>, artifact: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
            extension: "zip".to_string(),
            classifier: None,
        }
    }

    /// Build coordinates from a `group:artifact` pair and a version.
    pub fn from_ga(ga: &str, version: &str) -> CaravelResult<Self> {
        let (group, artifact) = ga.split_once(':').ok_or_else(|| CaravelError::Config {
            message: format!("`{ga}` is not a group:artifact coordinate"),
        })?;
        if group.is_empty() || artifact.is_empty() {
            return Err(CaravelError::Config {
                message: format!("`{ga}` is not a group:artifact coordinate"),
            }
            .into());
        }
        Ok(Self::new(group, artifact, version))
    }

    /// Coordinates for an id addressed through the coordinate shorthand.
    ///
    /// `qualifier` is the shorthand's optional `packaging[:classifier]`
    /// part, carried in the universe spec location.
    pub fn from_shorthand(producer: &str, build: &str, qualifier: Option<&str>) -> CaravelResult<Self> {
        let mut coord = Self::from_ga(producer, build)?;
        if let Some(qualifier) = qualifier {
            match qualifier.split_once(':') {
                Some((ext, classifier)) => {
                    coord.extension = ext.to_string();
                    coord.classifier = Some(classifier.to_string());
                }
                None => coord.extension = qualifier.to_string(),
            }
        }
        Ok(coord)
    }

    /// Repository-relative directory for this coordinate.
    pub fn rel_dir(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for part in self.group.split('.') {
            path.push(part);
        }
        path.push(&self.artifact);
        path.push(&self.version);
        path
    }

    fn artifact_dir(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for part in self.group.split('.') {
            path.push(part);
        }
        path.push(&self.artifact);
        path
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)
    }
}

/// External store the engine retrieves artifact bytes from.
///
/// `resolve` is read-only and idempotent per coordinate, so callers may
/// parallelize retrieval across independent ids; writes into a shared local
/// store go through `install`/`deploy`, which are safe to retry.
pub trait ArtifactBackend: fmt::Debug + Send + Sync {
    /// Path to the artifact's content directory, fetching from remote
    /// stores when the local one misses.
    fn resolve(&self, coord: &Coordinate) -> CaravelResult<PathBuf>;

    /// Put an artifact into the local store.
    fn install(&self, coord: &Coordinate, src: &Path) -> CaravelResult<()>;

    /// Publish an artifact to the store others resolve from.
    fn deploy(&self, coord: &Coordinate, src: &Path) -> CaravelResult<()>;

    /// All versions available for `group:artifact`; `local_only` restricts
    /// the listing to the local store.
    fn versions(&self, group: &str, artifact: &str, local_only: bool) -> CaravelResult<Vec<Version>>;
}

/// Directory-tree backend in the standard repository layout.
///
/// Artifacts are directories at `<root>/<group>/<artifact>/<version>/` with
/// a `.sha256` sidecar next to each version directory, written on deploy and
/// verified on resolve.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    remotes: Vec<PathBuf>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remotes: Vec::new(),
        }
    }

    /// Remote stores consulted, in order, when the local store misses.
    pub fn with_remotes(root: impl Into<PathBuf>, remotes: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remotes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local_dir(&self, coord: &Coordinate) -> PathBuf {
        self.root.join(coord.rel_dir())
    }

    fn sidecar(dir: &Path) -> PathBuf {
        let mut name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".sha256");
        dir.with_file_name(name)
    }

    /// Copy `src` to `dst` through a temp sibling so a concurrent populate
    /// of the same coordinate can be retried instead of interleaving.
    fn populate(dst: &Path, src: &Path) -> CaravelResult<()> {
        let parent = dst.parent().ok_or_else(|| CaravelError::Generic {
            message: format!("artifact path {} has no parent", dst.display()),
        })?;
        cfs::ensure_dir(parent).map_err(CaravelError::Io)?;
        let staging = tempfile::Builder::new()
            .prefix(".populate-")
            .tempdir_in(parent)
            .map_err(CaravelError::Io)?;
        let staged = staging.path().join("content");
        cfs::copy_dir_all(src, &staged)?;
        if dst.exists() {
            // Someone else won the race; their copy is equivalent.
            return Ok(());
        }
        fs::rename(&staged, dst).or_else(|e| {
            if dst.exists() {
                Ok(())
            } else {
                Err(CaravelError::Io(e))
            }
        })?;
        let digest = hash::sha256_dir(dst)?;
        fs::write(Self::sidecar(dst), digest).map_err(CaravelError::Io)?;
        Ok(())
    }

    fn verify(dir: &Path) -> CaravelResult<()> {
        let sidecar = Self::sidecar(dir);
        if !sidecar.is_file() {
            tracing::warn!("no checksum sidecar for {}", dir.display());
            return Ok(());
        }
        let expected = fs::read_to_string(&sidecar).map_err(CaravelError::Io)?;
        let actual = hash::sha256_dir(dir)?;
        if expected.trim() != actual {
            return Err(CaravelError::Generic {
                message: format!("checksum mismatch for {}", dir.display()),
            }
            .into());
        }
        Ok(())
    }

    fn versions_under(root: &Path, coord_dir: &Path, out: &mut Vec<Version>) {
        let dir = root.join(coord_dir);
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let version = Version::parse(&name);
                if !out.contains(&version) {
                    out.push(version);
                }
            }
        }
    }
}

impl ArtifactBackend for FsBackend {
    fn resolve(&self, coord: &Coordinate) -> CaravelResult<PathBuf> {
        let local = self.local_dir(coord);
        if local.is_dir() {
            Self::verify(&local)?;
            return Ok(local);
        }
        for remote in &self.remotes {
            let candidate = remote.join(coord.rel_dir());
            if candidate.is_dir() {
                tracing::debug!("fetching {coord} from {}", remote.display());
                Self::populate(&local, &candidate)?;
                return Ok(local);
            }
        }
        Err(CaravelError::Generic {
            message: format!("artifact {coord} not found in any configured store"),
        }
        .into())
    }

    fn install(&self, coord: &Coordinate, src: &Path) -> CaravelResult<()> {
        Self::populate(&self.local_dir(coord), src)
    }

    fn deploy(&self, coord: &Coordinate, src: &Path) -> CaravelResult<()> {
        let dst = self.local_dir(coord);
        if dst.exists() {
            fs::remove_dir_all(&dst).map_err(CaravelError::Io)?;
            let sidecar = Self::sidecar(&dst);
            if sidecar.exists() {
                fs::remove_file(sidecar).map_err(CaravelError::Io)?;
            }
        }
        Self::populate(&dst, src)
    }

    fn versions(&self, group: &str, artifact: &str, local_only: bool) -> CaravelResult<Vec<Version>> {
        let coord_dir = Coordinate::new(group, artifact, "x").artifact_dir();
        let mut versions = Vec::new();
        Self::versions_under(&self.root, &coord_dir, &mut versions);
        if !local_only {
            for remote in &self.remotes {
                Self::versions_under(remote, &coord_dir, &mut versions);
            }
        }
        versions.sort();
        Ok(versions)
    }
}
