//! The configuration data model contributed by feature packs: config
//! fragments, layers, feature specs, feature groups, and the stability
//! levels that gate them.
//!
//! These are plain tagged data types with free functions over them; the
//! merge semantics live in `caravel-provision`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stability level of a spec, parameter, package, or config.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stability {
    Default,
    Community,
    Preview,
    Experimental,
}

impl Default for Stability {
    fn default() -> Self {
        Stability::Default
    }
}

impl Stability {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_lowercase().as_str() {
            "default" => Some(Stability::Default),
            "community" => Some(Stability::Community),
            "preview" => Some(Stability::Preview),
            "experimental" => Some(Stability::Experimental),
            _ => None,
        }
    }
}

impl fmt::Display for Stability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stability::Default => "default",
            Stability::Community => "community",
            Stability::Preview => "preview",
            Stability::Experimental => "experimental",
        };
        f.write_str(s)
    }
}

/// Identity of a configuration: a model plus an optional name.
///
/// A missing name makes the id "model-only": in include/exclude positions it
/// matches every named config under that model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConfigId {
    pub fn named(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: Some(name.into()),
        }
    }

    pub fn model_only(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: None,
        }
    }

    pub fn is_model_only(&self) -> bool {
        self.name.is_none()
    }

    /// Whether this id (possibly model-only) covers `other`.
    pub fn matches(&self, other: &ConfigId) -> bool {
        self.model == other.model && (self.name.is_none() || self.name == other.name)
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{}", self.model, name),
            None => write!(f, "{}:*", self.model),
        }
    }
}

/// A package declared by a feature pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    /// Packages this one pulls in when selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    #[serde(default)]
    pub stability: Stability,
}

/// One feature usage: a spec name plus parameter overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub spec: String,
    /// Producer of the feature pack declaring the target spec; defaults to
    /// the pack the usage appears in, falling back to a graph-wide lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl FeatureConfig {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// A reference to a feature group, expanded at merge time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Caller parameter overrides applied to every expanded feature.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// A reusable composition of feature usages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub name: String,
    /// Packages pulled in whenever the group expands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<FeatureConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupRef>,
}

impl FeatureGroup {
    pub fn builder(name: impl Into<String>) -> FeatureGroupBuilder {
        FeatureGroupBuilder {
            group: FeatureGroup {
                name: name.into(),
                ..Default::default()
            },
        }
    }
}

/// Owned builder consumed into an immutable [`FeatureGroup`].
#[derive(Debug)]
pub struct FeatureGroupBuilder {
    group: FeatureGroup,
}

impl FeatureGroupBuilder {
    pub fn add_feature(mut self, feature: FeatureConfig) -> Self {
        self.group.features.push(feature);
        self
    }

    pub fn add_group(mut self, group: GroupRef) -> Self {
        self.group.groups.push(group);
        self
    }

    pub fn add_package(mut self, package: impl Into<String>) -> Self {
        self.group.packages.push(package.into());
        self
    }

    pub fn build(self) -> FeatureGroup {
        self.group
    }
}

/// One parameter of a feature spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureParamSpec {
    pub name: String,
    /// Id parameters, in declaration order, form the feature's identity.
    #[serde(default)]
    pub id: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub nillable: bool,
    /// Non-overridable: differing values for this parameter across merged
    /// occurrences of one feature are an error instead of a merge.
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub stability: Stability,
}

/// A reference from one feature spec to another.
///
/// Supplies missing id parameters from the most recently resolved feature of
/// the target spec, and is validated after merge: a non-nillable reference
/// whose target is absent from the config is an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureReferenceSpec {
    /// Target spec name.
    pub feature: String,
    #[serde(default)]
    pub nillable: bool,
    /// Maps local parameter names to the target's id parameter names.
    /// Parameters absent from the map carry their own name over.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mappings: BTreeMap<String, String>,
}

/// The schema of a feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    #[serde(default)]
    pub stability: Stability,
    /// Packages installed whenever a feature of this spec is provisioned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<FeatureParamSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<FeatureReferenceSpec>,
}

impl FeatureSpec {
    pub fn builder(name: impl Into<String>) -> FeatureSpecBuilder {
        FeatureSpecBuilder {
            spec: FeatureSpec {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Id parameters in declaration order.
    pub fn id_params(&self) -> impl Iterator<Item = &FeatureParamSpec> {
        self.params.iter().filter(|p| p.id)
    }

    pub fn param(&self, name: &str) -> Option<&FeatureParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Owned builder consumed into an immutable [`FeatureSpec`].
#[derive(Debug)]
pub struct FeatureSpecBuilder {
    spec: FeatureSpec,
}

impl FeatureSpecBuilder {
    pub fn stability(mut self, stability: Stability) -> Self {
        self.spec.stability = stability;
        self
    }

    pub fn add_param(mut self, param: FeatureParamSpec) -> Self {
        self.spec.params.push(param);
        self
    }

    pub fn add_ref(mut self, reference: FeatureReferenceSpec) -> Self {
        self.spec.refs.push(reference);
        self
    }

    pub fn add_package(mut self, package: impl Into<String>) -> Self {
        self.spec.packages.push(package.into());
        self
    }

    pub fn build(self) -> FeatureSpec {
        self.spec
    }
}

/// Full or wildcard feature identity used by exclude directives.
///
/// Parameters listed in `params` must match exactly; id parameters absent
/// from the map match any value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureIdPattern {
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// A named configuration fragment declared by a feature pack (or inline in
/// the provisioning configuration).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigModel {
    pub model: String,
    pub name: String,
    #[serde(default)]
    pub stability: Stability,
    /// Layers included by name, resolved across the whole dependency graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "excluded-layers")]
    pub excluded_layers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<FeatureConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupRef>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        rename = "excluded-features"
    )]
    pub excluded_features: Vec<FeatureIdPattern>,
}

impl ConfigModel {
    pub fn builder(model: impl Into<String>, name: impl Into<String>) -> ConfigModelBuilder {
        ConfigModelBuilder {
            config: ConfigModel {
                model: model.into(),
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn id(&self) -> ConfigId {
        ConfigId::named(self.model.clone(), self.name.clone())
    }
}

/// Owned builder consumed into an immutable [`ConfigModel`].
#[derive(Debug)]
pub struct ConfigModelBuilder {
    config: ConfigModel,
}

impl ConfigModelBuilder {
    pub fn prop(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.props.insert(name.into(), value.into());
        self
    }

    pub fn add_feature(mut self, feature: FeatureConfig) -> Self {
        self.config.features.push(feature);
        self
    }

    pub fn add_group(mut self, group: GroupRef) -> Self {
        self.config.groups.push(group);
        self
    }

    pub fn include_layer(mut self, layer: impl Into<String>) -> Self {
        self.config.layers.push(layer.into());
        self
    }

    pub fn exclude_layer(mut self, layer: impl Into<String>) -> Self {
        self.config.excluded_layers.push(layer.into());
        self
    }

    pub fn exclude_feature(mut self, pattern: FeatureIdPattern) -> Self {
        self.config.excluded_features.push(pattern);
        self
    }

    pub fn build(self) -> ConfigModel {
        self.config
    }
}

/// A reusable configuration fragment included into configs by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayerSpec {
    pub model: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<FeatureConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupRef>,
}
