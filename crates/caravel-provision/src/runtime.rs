//! The provisioning operation: lock, resolve, merge, stage, commit.
//!
//! All content is assembled into a staging directory inside the
//! installation root; the live state is only swapped in after the whole
//! resolve/merge/assembly pipeline succeeded, so a mid-pipeline failure
//! leaves the previous installation untouched.

use std::path::Path;
use std::sync::Arc;

use caravel_core::config::ProvisioningConfig;
use caravel_core::descriptor::PACKAGES_DIR;
use caravel_core::state::{ProvisionedFeaturePack, ProvisionedState, STATE_FILE};
use caravel_core::version::CoreVersion;
use caravel_resolver::layout::{LayoutBuilder, ENGINE_VERSION};
use caravel_universe::backend::ArtifactBackend;
use caravel_universe::resolver::UniverseResolver;
use caravel_util::errors::{CaravelError, CaravelResult};
use caravel_util::fs as cfs;
use caravel_util::lock::InstallLock;

use crate::merge::merge;
use crate::selection::{select, StabilityPolicy};

/// Metadata directory inside an installation.
pub const METADATA_DIR: &str = ".caravel";

/// Persisted provisioning descriptor inside the metadata directory.
pub const PROVISIONING_FILE: &str = "provisioning.toml";

/// Directory name holding a package's installable files.
const CONTENT_DIR: &str = "content";

/// Executes provisioning operations against installations.
#[derive(Debug, Clone)]
pub struct Provisioner {
    backend: Arc<dyn ArtifactBackend>,
    engine_version: CoreVersion,
    local_only: bool,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn ArtifactBackend>) -> Self {
        Self {
            backend,
            engine_version: CoreVersion::parse(ENGINE_VERSION),
            local_only: false,
        }
    }

    /// Override the engine version used for descriptor gating.
    pub fn engine_version(mut self, version: CoreVersion) -> Self {
        self.engine_version = version;
        self
    }

    /// Restrict build selection to locally available artifacts.
    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    /// Provision `install_dir` to the desired state in `config`.
    ///
    /// Mutually exclusive per installation: the advisory lock under the
    /// metadata directory is held for the whole operation.
    pub fn provision(
        &self,
        install_dir: &Path,
        config: &ProvisioningConfig,
    ) -> CaravelResult<ProvisionedState> {
        cfs::ensure_dir(install_dir).map_err(CaravelError::Io)?;
        let _lock = InstallLock::acquire(&install_dir.join(METADATA_DIR).join("lock"))?;

        let mut resolver =
            UniverseResolver::with_config(self.backend.clone(), config).local_only(self.local_only);
        let policy = StabilityPolicy::from_options(&config.options)?;
        let mut layout = LayoutBuilder::new(&mut resolver)
            .engine_version(self.engine_version.clone())
            .build(config)?;

        let mut selections = Vec::with_capacity(layout.feature_packs().len());
        for entry in layout.feature_packs() {
            selections.push(select(entry, &policy)?);
        }

        let outcome = merge(&layout, &selections, &config.configs, &policy)?;

        let mut feature_packs = Vec::with_capacity(selections.len());
        for (entry, selection) in layout.feature_packs().iter().zip(&selections) {
            let mut packages = selection.packages.clone();
            if let Some(extra) = outcome.feature_packages.get(&entry.fpid.producer) {
                for package in extra {
                    if !packages.contains(package) {
                        packages.push(package.clone());
                    }
                }
            }
            // Feature-induced packages still pull their declared deps.
            let mut i = 0;
            while i < packages.len() {
                if let Some(spec) = entry.spec.package(&packages[i]) {
                    for dep in spec.deps.clone() {
                        if !packages.contains(&dep) {
                            packages.push(dep);
                        }
                    }
                }
                i += 1;
            }
            feature_packs.push(ProvisionedFeaturePack {
                fpid: entry.fpid.clone(),
                packages,
            });
        }
        let state = ProvisionedState {
            feature_packs,
            configs: outcome.configs,
        };

        // Assemble everything into staging before touching the live tree.
        let staging = tempfile::Builder::new()
            .prefix(".stage-")
            .tempdir_in(install_dir)
            .map_err(CaravelError::Io)?;
        for (entry, pack_state) in layout.feature_packs().iter().zip(&state.feature_packs) {
            for package in &pack_state.packages {
                let content = entry.dir.join(PACKAGES_DIR).join(package).join(CONTENT_DIR);
                if content.is_dir() {
                    cfs::copy_dir_all(&content, staging.path())?;
                }
            }
            // Patches overlay their base in declaration order.
            for patch in layout.patches_of(&entry.fpid) {
                for package in &pack_state.packages {
                    let content = patch.dir.join(PACKAGES_DIR).join(package).join(CONTENT_DIR);
                    if content.is_dir() {
                        tracing::debug!("overlaying {} from patch {}", package, patch.fpid);
                        cfs::copy_dir_all(&content, staging.path())?;
                    }
                }
            }
        }

        cfs::swap_in(staging.path(), install_dir)?;

        let meta = install_dir.join(METADATA_DIR);
        cfs::ensure_dir(&meta).map_err(CaravelError::Io)?;
        let descriptor = config.to_string_pretty().map_err(|e| CaravelError::Generic {
            message: format!("failed to serialize provisioning descriptor: {e}"),
        })?;
        std::fs::write(meta.join(PROVISIONING_FILE), descriptor).map_err(CaravelError::Io)?;
        state.write_to(&meta.join(STATE_FILE))?;

        layout.close();
        tracing::info!(
            "provisioned {} feature packs into {}",
            state.feature_packs.len(),
            install_dir.display()
        );
        Ok(state)
    }

    /// Re-run provisioning from the descriptor persisted in an installation.
    pub fn reprovision(&self, install_dir: &Path) -> CaravelResult<ProvisionedState> {
        let config =
            ProvisioningConfig::from_path(&install_dir.join(METADATA_DIR).join(PROVISIONING_FILE))?;
        self.provision(install_dir, &config)
    }

    /// The persisted provisioning configuration of an installation.
    pub fn installed_config(&self, install_dir: &Path) -> CaravelResult<ProvisioningConfig> {
        ProvisioningConfig::from_path(&install_dir.join(METADATA_DIR).join(PROVISIONING_FILE))
    }

    /// The persisted provisioned state of an installation.
    pub fn installed_state(&self, install_dir: &Path) -> CaravelResult<ProvisionedState> {
        ProvisionedState::from_path(&install_dir.join(METADATA_DIR).join(STATE_FILE))
    }
}
