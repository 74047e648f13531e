//! Building the provisioning layout: the ordered, conflict-resolved,
//! patch-aware dependency graph for one provisioning operation.
//!
//! Expansion is depth-first from the root feature pack list. The resulting
//! order is topological (every feature pack after all its dependencies) with
//! ties broken by first discovery, and it is the install and merge order
//! everything downstream relies on.

use std::collections::HashMap;
use std::path::PathBuf;

use caravel_core::config::{FeaturePackConfig, ProvisioningConfig};
use caravel_core::descriptor::{DescriptorHeader, FeaturePackSpec};
use caravel_core::location::Fpid;
use caravel_core::version::CoreVersion;
use caravel_universe::resolver::UniverseResolver;
use caravel_util::errors::{CaravelError, CaravelResult};

use crate::graph::{LayoutGraph, LayoutNode};

/// Version of the running engine, gating `min-engine-version` declarations.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One resolved feature pack's position in the layout.
#[derive(Debug)]
pub struct FeaturePackLayout {
    pub fpid: Fpid,
    /// On-disk content directory.
    pub dir: PathBuf,
    pub spec: FeaturePackSpec,
    /// The declaration governing this pack's selection customizations.
    pub config: FeaturePackConfig,
    /// Declared (non-transitive) at the root of the provisioning config.
    pub direct: bool,
    /// Whether `config` came from the provisioning config rather than a
    /// dependency declaration inside another pack. Root-level declarations
    /// inherit defaults when their inherit flags are unset.
    pub root_declared: bool,
}

/// A patch resolved for a base feature pack in the layout.
#[derive(Debug, Clone)]
pub struct PatchLayout {
    pub fpid: Fpid,
    pub dir: PathBuf,
    pub patch_for: Fpid,
}

/// The whole resolved graph, owned by one provisioning operation.
///
/// A layout is a scoped resource: it must be closed to release the feature
/// pack content it references, on every exit path. Dropping an unclosed
/// layout closes it.
#[derive(Debug, Default)]
pub struct ProvisioningLayout {
    entries: Vec<FeaturePackLayout>,
    patches: HashMap<Fpid, Vec<PatchLayout>>,
    graph: LayoutGraph,
    closed: bool,
}

impl ProvisioningLayout {
    /// Feature packs in install order.
    pub fn feature_packs(&self) -> &[FeaturePackLayout] {
        &self.entries
    }

    pub fn find(&self, producer_key: &str) -> Option<&FeaturePackLayout> {
        self.entries
            .iter()
            .find(|e| e.fpid.producer_key() == producer_key)
    }

    /// Patches of a base pack, in declaration order (later overlays earlier).
    pub fn patches_of(&self, fpid: &Fpid) -> &[PatchLayout] {
        self.patches.get(fpid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fpids(&self) -> Vec<Fpid> {
        self.entries.iter().map(|e| e.fpid.clone()).collect()
    }

    pub fn graph(&self) -> &LayoutGraph {
        &self.graph
    }

    pub fn print_tree(&self) -> String {
        self.graph.print_tree()
    }

    /// Release the feature pack content this layout references.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.entries.clear();
        self.patches.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ProvisioningLayout {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!("closing provisioning layout on drop");
            self.close();
        }
    }
}

#[derive(Default)]
struct BuildState {
    entries: Vec<FeaturePackLayout>,
    index: HashMap<String, usize>,
    /// Producer keys on the current expansion path, for cycle detection.
    visiting: Vec<String>,
    /// Root-level transitive customizations, keyed by producer.
    transitive_customs: HashMap<String, FeaturePackConfig>,
    graph: LayoutGraph,
}

/// Builds a [`ProvisioningLayout`] from a [`ProvisioningConfig`].
pub struct LayoutBuilder<'r> {
    resolver: &'r mut UniverseResolver,
    engine_version: CoreVersion,
}

impl<'r> LayoutBuilder<'r> {
    pub fn new(resolver: &'r mut UniverseResolver) -> Self {
        Self {
            resolver,
            engine_version: CoreVersion::parse(ENGINE_VERSION),
        }
    }

    /// Override the engine version used for the `min-engine-version` gate.
    pub fn engine_version(mut self, version: CoreVersion) -> Self {
        self.engine_version = version;
        self
    }

    pub fn build(mut self, config: &ProvisioningConfig) -> CaravelResult<ProvisioningLayout> {
        let mut state = BuildState::default();

        for fp in &config.feature_packs {
            if fp.transitive {
                let loc = self.resolver.normalize(&fp.location);
                let mut custom = fp.clone();
                custom.location = loc.clone();
                state.transitive_customs.insert(loc.producer_key(), custom);
            }
        }

        for fp in &config.feature_packs {
            if !fp.transitive {
                self.visit(&mut state, fp, true, None)?;
            }
        }

        for key in state.transitive_customs.keys() {
            if !state.index.contains_key(key) {
                return Err(CaravelError::MissingRequiredProducer {
                    producer: key.clone(),
                }
                .into());
            }
        }

        let mut patches: HashMap<Fpid, Vec<PatchLayout>> = HashMap::new();
        for idx in 0..state.entries.len() {
            let declared = state.entries[idx].config.patches.clone();
            for patch_id in declared {
                let (base, patch) = self.attach_patch(&state, &patch_id)?;
                patches.entry(base).or_default().push(patch);
            }
        }

        tracing::debug!(
            "layout resolved: {} feature packs, {} patched",
            state.entries.len(),
            patches.len()
        );
        Ok(ProvisioningLayout {
            entries: state.entries,
            patches,
            graph: state.graph,
            closed: false,
        })
    }

    fn visit(
        &mut self,
        state: &mut BuildState,
        declared: &FeaturePackConfig,
        root: bool,
        parent_key: Option<String>,
    ) -> CaravelResult<()> {
        let loc = self.resolver.normalize(&declared.location);
        let key = loc.producer_key();

        if state.visiting.contains(&key) {
            return Err(CaravelError::CycleDetected { at: key }.into());
        }

        if let Some(&idx) = state.index.get(&key) {
            if let (Some(parent), Some(node)) = (
                parent_key.as_deref().and_then(|k| state.graph.find(k)),
                state.graph.find(&key),
            ) {
                state.graph.add_edge(parent, node);
            }
            if root {
                self.redeclare(state, idx, declared, &loc)?;
            }
            // A transitive rediscovery of a resolved producer: first wins.
            return Ok(());
        }

        // Explicit-wins: a root transitive customization may pin the build
        // of a producer discovered here for the first time.
        let (resolve_loc, governing, root_declared) = if root {
            let mut governing = declared.clone();
            governing.location = loc.clone();
            (loc.clone(), governing, true)
        } else if let Some(custom) = state.transitive_customs.get(&key).cloned() {
            let resolve_loc =
                if custom.location.build.is_some() || custom.location.channel.is_some() {
                    custom.location.clone()
                } else {
                    loc.clone()
                };
            (resolve_loc, custom, true)
        } else {
            let mut governing = declared.clone();
            governing.location = loc.clone();
            (loc.clone(), governing, false)
        };

        let fpid = self.resolver.resolve_build(&resolve_loc)?;
        let (dir, spec) = self.load_pack(&fpid)?;

        let node = state.graph.add_node(LayoutNode {
            fpid: fpid.clone(),
            direct: root,
        });
        if let Some(parent) = parent_key.as_deref().and_then(|k| state.graph.find(k)) {
            state.graph.add_edge(parent, node);
        }

        state.visiting.push(key.clone());
        let deps = spec.dependencies.clone();
        for dep in &deps {
            self.visit(state, dep, false, Some(key.clone()))?;
        }
        state.visiting.pop();

        let idx = state.entries.len();
        state.entries.push(FeaturePackLayout {
            fpid,
            dir,
            spec,
            config: governing,
            direct: root,
            root_declared,
        });
        state.index.insert(key, idx);
        Ok(())
    }

    /// A producer already in the layout is declared again at the root.
    fn redeclare(
        &mut self,
        state: &mut BuildState,
        idx: usize,
        declared: &FeaturePackConfig,
        loc: &caravel_core::location::FeaturePackLocation,
    ) -> CaravelResult<()> {
        let key = loc.producer_key();
        let fpid = self.resolver.resolve_build(loc)?;
        let existing_fpid = state.entries[idx].fpid.clone();
        let was_direct = state.entries[idx].direct;

        if was_direct {
            if fpid != existing_fpid {
                return Err(CaravelError::ConflictingExplicitVersions {
                    producer: key,
                    first: existing_fpid.to_string(),
                    second: fpid.to_string(),
                }
                .into());
            }
        } else if fpid != existing_fpid {
            // Transitively discovered earlier at another build: the explicit
            // declaration wins, so the build is replaced and the new build's
            // own dependencies are walked.
            tracing::debug!(
                "explicit declaration replaces transitive build {existing_fpid} with {fpid}"
            );
            let (dir, spec) = self.load_pack(&fpid)?;
            state.visiting.push(key.clone());
            let deps = spec.dependencies.clone();
            for dep in &deps {
                self.visit(state, dep, false, Some(key.clone()))?;
            }
            state.visiting.pop();

            let entry = &mut state.entries[idx];
            entry.fpid = fpid.clone();
            entry.dir = dir;
            entry.spec = spec;
            if let Some(node) = state.graph.find(&key) {
                state.graph.node_mut(node).fpid = fpid;
            }
        }

        let entry = &mut state.entries[idx];
        entry.direct = true;
        entry.root_declared = true;
        let mut governing = declared.clone();
        governing.location = loc.clone();
        entry.config = governing;
        if let Some(node) = state.graph.find(&key) {
            state.graph.node_mut(node).direct = true;
        }
        Ok(())
    }

    /// Resolve a pack's bytes and descriptor, gating on the engine version
    /// before anything else in the graph is touched.
    fn load_pack(&mut self, fpid: &Fpid) -> CaravelResult<(PathBuf, FeaturePackSpec)> {
        let dir = self.resolver.resolve(fpid)?;
        let header = DescriptorHeader::peek(&dir)?;
        if let Some(required) = &header.pack.min_engine_version {
            let required = CoreVersion::parse(required);
            if self.engine_version < required {
                return Err(CaravelError::MinimumEngineVersionUnsatisfied {
                    fpid: fpid.to_string(),
                    required: required.to_string(),
                    actual: self.engine_version.to_string(),
                }
                .into());
            }
        }
        let spec = FeaturePackSpec::load(&dir)?;
        if spec.pack.location.producer != fpid.producer || spec.pack.location.build != fpid.build {
            return Err(CaravelError::Descriptor {
                path: dir.display().to_string(),
                message: format!(
                    "descriptor identity `{}` does not match requested `{fpid}`",
                    spec.pack.location
                ),
            }
            .into());
        }
        Ok((dir, spec))
    }

    fn attach_patch(
        &mut self,
        state: &BuildState,
        patch_id: &Fpid,
    ) -> CaravelResult<(Fpid, PatchLayout)> {
        let dir = self.resolver.resolve(patch_id)?;
        let header = DescriptorHeader::peek(&dir)?;
        let Some(patch_for) = header.pack.patch_for else {
            return Err(CaravelError::Descriptor {
                path: dir.display().to_string(),
                message: format!("`{patch_id}` is not a patch: descriptor declares no patch-for"),
            }
            .into());
        };
        let patch_for = self
            .resolver
            .normalize(&patch_for.location())
            .fpid()
            .expect("normalizing keeps the build");

        let target = state
            .index
            .get(&patch_for.producer_key())
            .map(|&idx| &state.entries[idx]);
        match target {
            Some(entry) if entry.fpid == patch_for => Ok((
                patch_for.clone(),
                PatchLayout {
                    fpid: patch_id.clone(),
                    dir,
                    patch_for,
                },
            )),
            _ => Err(CaravelError::PatchTargetNotInLayout {
                patch: patch_id.to_string(),
                target: patch_for.to_string(),
            }
            .into()),
        }
    }
}
