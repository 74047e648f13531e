//! The feature/config merge engine.
//!
//! Walks the layout in dependency-first order, expands layers and feature
//! groups, resolves cross-spec references, merges features by resolved
//! identity, applies exclusions, and emits the final ordered configs.
//!
//! Ordering is deterministic by construction: configs appear in first
//! encounter order, and features in (declaring pack order, declaration
//! order); maps are only used as indexes next to insertion-ordered vectors.

use std::collections::{BTreeMap, HashMap, HashSet};

use caravel_core::model::{ConfigId, ConfigModel, FeatureConfig, FeatureGroup, FeatureReferenceSpec, FeatureSpec, GroupRef};
use caravel_core::state::{ProvisionedConfig, ProvisionedFeature, ResolvedFeatureId, ResolvedSpecId};
use caravel_resolver::layout::{FeaturePackLayout, ProvisioningLayout};
use caravel_util::errors::{CaravelError, CaravelResult};

use crate::selection::{Selection, StabilityPolicy};

/// Where a fragment came from when no feature pack declares it.
const ROOT_ORIGIN: &str = "<provisioning config>";

/// The merged configs plus the packages pulled in by provisioned features,
/// feature groups, and layers, keyed by producer.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub configs: Vec<ProvisionedConfig>,
    pub feature_packages: HashMap<String, Vec<String>>,
}

struct MergeContext<'a> {
    packs: &'a [FeaturePackLayout],
    policy: &'a StabilityPolicy,
    /// Producer name per pack index.
    producers: Vec<String>,
    specs: HashMap<ResolvedSpecId, (usize, &'a FeatureSpec)>,
    groups: HashMap<(String, String), (usize, &'a FeatureGroup)>,
    /// Layer declarations across the whole graph, in dependency order.
    layers: HashMap<(String, String), Vec<(usize, &'a caravel_core::model::ConfigLayerSpec)>>,
}

impl<'a> MergeContext<'a> {
    fn build(layout: &'a ProvisioningLayout, policy: &'a StabilityPolicy) -> Self {
        let packs = layout.feature_packs();
        let producers: Vec<String> = packs.iter().map(|e| e.fpid.producer.clone()).collect();
        let mut specs = HashMap::new();
        let mut groups = HashMap::new();
        let mut layers: HashMap<(String, String), Vec<_>> = HashMap::new();
        for (idx, entry) in packs.iter().enumerate() {
            let producer = &producers[idx];
            for spec in &entry.spec.feature_specs {
                specs.insert(ResolvedSpecId::new(producer.clone(), spec.name.clone()), (idx, spec));
            }
            for group in &entry.spec.feature_groups {
                groups.insert((producer.clone(), group.name.clone()), (idx, group));
            }
            for layer in &entry.spec.layers {
                layers
                    .entry((layer.model.clone(), layer.name.clone()))
                    .or_default()
                    .push((idx, layer));
            }
        }
        Self {
            packs,
            policy,
            producers,
            specs,
            groups,
            layers,
        }
    }

    fn origin_name(&self, pack: Option<usize>) -> String {
        match pack {
            Some(idx) => self.packs[idx].fpid.to_string(),
            None => ROOT_ORIGIN.to_string(),
        }
    }

    /// Resolve a spec name to its global identity: explicit origin first,
    /// then the declaring pack, then the whole graph in dependency order.
    fn resolve_spec(
        &self,
        pack: Option<usize>,
        origin: Option<&str>,
        name: &str,
    ) -> CaravelResult<(ResolvedSpecId, usize, &'a FeatureSpec)> {
        if let Some(origin) = origin {
            let key = ResolvedSpecId::new(origin, name);
            if let Some(&(idx, spec)) = self.specs.get(&key) {
                return Ok((key, idx, spec));
            }
            return Err(self.unknown("feature-spec", &format!("{origin}/{name}"), pack));
        }
        if let Some(idx) = pack {
            let key = ResolvedSpecId::new(self.producers[idx].clone(), name);
            if let Some(&(i, spec)) = self.specs.get(&key) {
                return Ok((key, i, spec));
            }
        }
        for producer in &self.producers {
            let key = ResolvedSpecId::new(producer.clone(), name);
            if let Some(&(i, spec)) = self.specs.get(&key) {
                return Ok((key, i, spec));
            }
        }
        Err(self.unknown("feature-spec", name, pack))
    }

    fn resolve_group(
        &self,
        pack: Option<usize>,
        origin: Option<&str>,
        name: &str,
    ) -> CaravelResult<((String, String), usize, &'a FeatureGroup)> {
        if let Some(origin) = origin {
            let key = (origin.to_string(), name.to_string());
            if let Some(&(idx, group)) = self.groups.get(&key) {
                return Ok((key, idx, group));
            }
            return Err(self.unknown("feature-group", &format!("{origin}/{name}"), pack));
        }
        if let Some(idx) = pack {
            let key = (self.producers[idx].clone(), name.to_string());
            if let Some(&(i, group)) = self.groups.get(&key) {
                return Ok((key, i, group));
            }
        }
        for producer in &self.producers {
            let key = (producer.clone(), name.to_string());
            if let Some(&(i, group)) = self.groups.get(&key) {
                return Ok((key, i, group));
            }
        }
        Err(self.unknown("feature-group", name, pack))
    }

    fn unknown(&self, kind: &'static str, name: &str, pack: Option<usize>) -> miette::Report {
        CaravelError::UnknownSelectionTarget {
            kind,
            name: name.to_string(),
            fpid: self.origin_name(pack),
        }
        .into()
    }
}

#[derive(Debug, Clone)]
struct ResolvedPattern {
    spec: ResolvedSpecId,
    params: BTreeMap<String, String>,
}

fn pattern_matches(pattern: &ResolvedPattern, id: &ResolvedFeatureId) -> bool {
    pattern.spec == id.spec
        && pattern
            .params
            .iter()
            .all(|(k, v)| id.param(k) == Some(v.as_str()))
}

#[derive(Debug)]
struct PendingFeature {
    id: ResolvedFeatureId,
    spec_id: ResolvedSpecId,
    params: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct PendingConfig {
    props: BTreeMap<String, String>,
    features: Vec<PendingFeature>,
    index: HashMap<ResolvedFeatureId, usize>,
    /// Resolution history per spec, most recent last, for reference lookups.
    history: HashMap<ResolvedSpecId, Vec<ResolvedFeatureId>>,
    /// Exclusions pending until the merge walk completes; re-adding a
    /// matching feature drops the exclusion (last write wins).
    exclusions: Vec<ResolvedPattern>,
}

#[derive(Debug, Default)]
struct MergeState {
    order: Vec<ConfigId>,
    configs: HashMap<ConfigId, PendingConfig>,
    feature_packages: HashMap<String, Vec<String>>,
}

impl MergeState {
    fn config_mut(&mut self, id: &ConfigId) -> &mut PendingConfig {
        if !self.configs.contains_key(id) {
            self.order.push(id.clone());
            self.configs.insert(id.clone(), PendingConfig::default());
        }
        self.configs.get_mut(id).expect("just inserted")
    }

    fn add_package(&mut self, producer: &str, package: &str) {
        let packages = self.feature_packages.entry(producer.to_string()).or_default();
        if !packages.iter().any(|p| p == package) {
            packages.push(package.to_string());
        }
    }
}

/// Merge the selected config fragments of every pack, plus the inline
/// configs of the provisioning configuration, into the final config list.
pub fn merge(
    layout: &ProvisioningLayout,
    selections: &[Selection],
    inline_configs: &[ConfigModel],
    policy: &StabilityPolicy,
) -> CaravelResult<MergeOutcome> {
    let ctx = MergeContext::build(layout, policy);
    let mut state = MergeState::default();

    for (idx, selection) in selections.iter().enumerate() {
        for fragment in &selection.configs {
            process_fragment(&ctx, &mut state, Some(idx), fragment)?;
        }
    }
    for fragment in inline_configs {
        process_fragment(&ctx, &mut state, None, fragment)?;
    }

    finalize(&ctx, state)
}

fn process_fragment(
    ctx: &MergeContext<'_>,
    state: &mut MergeState,
    pack: Option<usize>,
    fragment: &ConfigModel,
) -> CaravelResult<()> {
    let id = fragment.id();
    {
        let cfg = state.config_mut(&id);
        for (key, value) in &fragment.props {
            cfg.props.insert(key.clone(), value.clone());
        }
    }

    // Included layers expand first, resolved across the entire graph; the
    // fragment's own features follow.
    for layer_name in &fragment.layers {
        if fragment.excluded_layers.iter().any(|l| l == layer_name) {
            continue;
        }
        let declarations = ctx
            .layers
            .get(&(fragment.model.clone(), layer_name.clone()))
            .ok_or_else(|| ctx.unknown("layer", layer_name, pack))?;
        for &(layer_pack, layer) in declarations {
            for feature in &layer.features {
                add_feature(ctx, state, &id, Some(layer_pack), feature, &BTreeMap::new())?;
            }
            let mut visited = HashSet::new();
            for group in &layer.groups {
                expand_group(ctx, state, &id, Some(layer_pack), group, &BTreeMap::new(), &mut visited)?;
            }
            for package in &layer.packages {
                state.add_package(&ctx.producers[layer_pack], package);
            }
        }
    }

    for feature in &fragment.features {
        add_feature(ctx, state, &id, pack, feature, &BTreeMap::new())?;
    }
    let mut visited = HashSet::new();
    for group in &fragment.groups {
        expand_group(ctx, state, &id, pack, group, &BTreeMap::new(), &mut visited)?;
    }

    for pattern in &fragment.excluded_features {
        let (spec_id, _, _) = ctx.resolve_spec(pack, pattern.origin.as_deref(), &pattern.spec)?;
        let cfg = state.config_mut(&id);
        cfg.exclusions.push(ResolvedPattern {
            spec: spec_id,
            params: pattern.params.clone(),
        });
    }
    Ok(())
}

fn expand_group(
    ctx: &MergeContext<'_>,
    state: &mut MergeState,
    config_id: &ConfigId,
    pack: Option<usize>,
    gref: &GroupRef,
    overrides: &BTreeMap<String, String>,
    visited: &mut HashSet<(String, String)>,
) -> CaravelResult<()> {
    let (key, group_pack, group) = ctx.resolve_group(pack, gref.origin.as_deref(), &gref.name)?;
    if !visited.insert(key.clone()) {
        return Err(CaravelError::CycleDetected {
            at: format!("feature group {}/{}", key.0, key.1),
        }
        .into());
    }

    // Outer callers win over the group's own parameter overrides.
    let mut merged = gref.params.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }

    for feature in &group.features {
        add_feature(ctx, state, config_id, Some(group_pack), feature, &merged)?;
    }
    for nested in &group.groups {
        expand_group(ctx, state, config_id, Some(group_pack), nested, &merged, visited)?;
    }
    for package in &group.packages {
        state.add_package(&ctx.producers[group_pack], package);
    }

    visited.remove(&key);
    Ok(())
}

enum RefLookup {
    Supplied(String),
    NoTarget,
    NoRef,
}

fn add_feature(
    ctx: &MergeContext<'_>,
    state: &mut MergeState,
    config_id: &ConfigId,
    pack: Option<usize>,
    fc: &FeatureConfig,
    overrides: &BTreeMap<String, String>,
) -> CaravelResult<()> {
    let (spec_id, spec_pack, spec) = ctx.resolve_spec(pack, fc.origin.as_deref(), &fc.spec)?;
    if spec.stability > ctx.policy.config {
        tracing::debug!("dropping feature of `{spec_id}`: stability {}", spec.stability);
        return Ok(());
    }

    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for param in &spec.params {
        if let Some(default) = &param.default {
            params.insert(param.name.clone(), default.clone());
        }
    }
    for (key, value) in &fc.params {
        if spec.param(key).is_none() {
            return Err(CaravelError::Config {
                message: format!("feature spec `{spec_id}` has no parameter `{key}`"),
            }
            .into());
        }
        params.insert(key.clone(), value.clone());
    }
    // Group-level overrides only land on specs that know the parameter.
    for (key, value) in overrides {
        if spec.param(key).is_some() {
            params.insert(key.clone(), value.clone());
        }
    }
    params.retain(|key, _| {
        spec.param(key)
            .map(|p| p.stability <= ctx.policy.config)
            .unwrap_or(true)
    });

    // Identity: id parameters in spec order; missing values are supplied by
    // reference specs from the most recently resolved matching target.
    let mut id_params: Vec<(String, String)> = Vec::new();
    for param in spec.id_params() {
        if let Some(value) = params.get(&param.name) {
            id_params.push((param.name.clone(), value.clone()));
            continue;
        }
        let cfg = state.config_mut(config_id);
        match lookup_ref_param(ctx, cfg, pack, spec, &params, &param.name) {
            RefLookup::Supplied(value) => {
                params.insert(param.name.clone(), value.clone());
                id_params.push((param.name.clone(), value));
            }
            RefLookup::NoTarget if param.nillable => {}
            RefLookup::NoRef if param.nillable => {}
            RefLookup::NoTarget => {
                return Err(CaravelError::DanglingReference {
                    from: spec_id.to_string(),
                    to: param.name.clone(),
                    config: config_id.to_string(),
                }
                .into());
            }
            RefLookup::NoRef => {
                return Err(CaravelError::Config {
                    message: format!(
                        "feature of `{spec_id}` in `{config_id}` is missing id parameter `{}`",
                        param.name
                    ),
                }
                .into());
            }
        }
    }

    let id = ResolvedFeatureId::new(spec_id.clone(), id_params);
    let cfg = state.config_mut(config_id);

    // Re-adding an excluded id cancels the exclusion: last write wins.
    cfg.exclusions.retain(|pattern| !pattern_matches(pattern, &id));

    if let Some(&idx) = cfg.index.get(&id) {
        let existing = &mut cfg.features[idx];
        for (key, value) in &params {
            if id.param(key).is_some() {
                continue;
            }
            if let Some(param_spec) = spec.param(key) {
                if param_spec.fixed {
                    if let Some(old) = existing.params.get(key) {
                        if old != value {
                            return Err(CaravelError::ConflictingFeatureParam {
                                feature: id.to_string(),
                                param: key.clone(),
                                first: old.clone(),
                                second: value.clone(),
                            }
                            .into());
                        }
                    }
                }
            }
            existing.params.insert(key.clone(), value.clone());
        }
    } else {
        let idx = cfg.features.len();
        cfg.index.insert(id.clone(), idx);
        cfg.features.push(PendingFeature {
            id: id.clone(),
            spec_id: spec_id.clone(),
            params,
        });
    }
    cfg.history.entry(spec_id).or_default().push(id);

    for package in &spec.packages {
        if !ctx.packs[spec_pack].spec.has_package(package) {
            return Err(ctx.unknown("package", package, Some(spec_pack)));
        }
        state.add_package(&ctx.producers[spec_pack], package);
    }
    Ok(())
}

/// Supply a missing id parameter from the most recently resolved feature of
/// a reference's target spec that agrees with the already-known values.
fn lookup_ref_param(
    ctx: &MergeContext<'_>,
    cfg: &PendingConfig,
    pack: Option<usize>,
    spec: &FeatureSpec,
    known: &BTreeMap<String, String>,
    missing: &str,
) -> RefLookup {
    let mut saw_ref = false;
    for reference in &spec.refs {
        let target_param = reference
            .mappings
            .get(missing)
            .cloned()
            .unwrap_or_else(|| missing.to_string());
        let Ok((target_spec_id, _, target_spec)) =
            ctx.resolve_spec(pack, None, &reference.feature)
        else {
            continue;
        };
        if !target_spec.id_params().any(|p| p.name == target_param) {
            continue;
        }
        saw_ref = true;

        let Some(history) = cfg.history.get(&target_spec_id) else {
            continue;
        };
        'candidate: for candidate in history.iter().rev() {
            // The candidate must share the already-known id prefix.
            for param in spec.id_params() {
                if param.name == missing {
                    continue;
                }
                if let Some(value) = known.get(&param.name) {
                    let mapped = reference
                        .mappings
                        .get(&param.name)
                        .cloned()
                        .unwrap_or_else(|| param.name.clone());
                    if let Some(candidate_value) = candidate.param(&mapped) {
                        if candidate_value != value {
                            continue 'candidate;
                        }
                    }
                }
            }
            if let Some(value) = candidate.param(&target_param) {
                return RefLookup::Supplied(value.to_string());
            }
        }
    }
    if saw_ref {
        RefLookup::NoTarget
    } else {
        RefLookup::NoRef
    }
}

fn finalize(ctx: &MergeContext<'_>, mut state: MergeState) -> CaravelResult<MergeOutcome> {
    let mut configs = Vec::new();
    for id in &state.order {
        let mut cfg = state.configs.remove(id).expect("tracked config");

        // Exclusions apply after merging, before reference validation.
        let exclusions = std::mem::take(&mut cfg.exclusions);
        if !exclusions.is_empty() {
            cfg.features
                .retain(|f| !exclusions.iter().any(|p| pattern_matches(p, &f.id)));
        }

        let index: HashSet<&ResolvedFeatureId> = cfg.features.iter().map(|f| &f.id).collect();
        for feature in &cfg.features {
            let &(spec_pack, spec) = ctx.specs.get(&feature.spec_id).expect("resolved spec");
            for reference in &spec.refs {
                validate_reference(ctx, id, &index, feature, spec_pack, reference)?;
            }
        }

        let features = cfg
            .features
            .into_iter()
            .map(|f| ProvisionedFeature {
                id: f.id,
                params: f.params,
            })
            .collect();
        configs.push(ProvisionedConfig {
            id: id.clone(),
            props: cfg.props,
            features,
        });
    }
    Ok(MergeOutcome {
        configs,
        feature_packages: state.feature_packages,
    })
}

/// A surviving non-nillable reference must point at a feature present in
/// the same config.
fn validate_reference(
    ctx: &MergeContext<'_>,
    config_id: &ConfigId,
    index: &HashSet<&ResolvedFeatureId>,
    feature: &PendingFeature,
    spec_pack: usize,
    reference: &FeatureReferenceSpec,
) -> CaravelResult<()> {
    let dangling = || {
        CaravelError::DanglingReference {
            from: feature.id.to_string(),
            to: reference.feature.clone(),
            config: config_id.to_string(),
        }
        .into()
    };

    let Ok((target_spec_id, _, target_spec)) =
        ctx.resolve_spec(Some(spec_pack), None, &reference.feature)
    else {
        return if reference.nillable { Ok(()) } else { Err(dangling()) };
    };

    let mut target_params: Vec<(String, String)> = Vec::new();
    for param in target_spec.id_params() {
        // Reverse the mapping: which local parameter feeds this target id
        // parameter?
        let local = reference
            .mappings
            .iter()
            .find(|(_, target)| **target == param.name)
            .map(|(local, _)| local.clone())
            .unwrap_or_else(|| param.name.clone());
        match feature.params.get(&local).or(param.default.as_ref()) {
            Some(value) => target_params.push((param.name.clone(), value.clone())),
            None if param.nillable => {}
            None => {
                return if reference.nillable { Ok(()) } else { Err(dangling()) };
            }
        }
    }

    let target_id = ResolvedFeatureId::new(target_spec_id, target_params);
    if index.contains(&target_id) || reference.nillable {
        Ok(())
    } else {
        Err(dangling())
    }
}
