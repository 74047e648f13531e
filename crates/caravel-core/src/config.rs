//! The provisioning configuration: the root desired state an installation
//! is provisioned from.
//!
//! A configuration is built through owned builders that are consumed at
//! `build()`, and round-trips losslessly through the installation's
//! `provisioning.toml` descriptor.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use caravel_util::errors::{CaravelError, CaravelResult};

use crate::location::{FeaturePackLocation, Fpid, UniverseSpec};
use crate::model::{ConfigId, ConfigModel};

/// One feature pack dependency declaration with its selection customizations.
///
/// Field order matters for TOML serialization: plain values come before the
/// config-id tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePackConfig {
    pub location: FeaturePackLocation,
    /// A transitive declaration customizes a pack expected to enter the
    /// layout through some other pack's dependencies; it does not add the
    /// pack itself.
    #[serde(default)]
    pub transitive: bool,
    #[serde(
        default,
        rename = "inherit-packages",
        skip_serializing_if = "Option::is_none"
    )]
    pub inherit_packages: Option<bool>,
    #[serde(
        default,
        rename = "inherit-configs",
        skip_serializing_if = "Option::is_none"
    )]
    pub inherit_configs: Option<bool>,
    #[serde(
        default,
        rename = "included-packages",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub included_packages: Vec<String>,
    #[serde(
        default,
        rename = "excluded-packages",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub excluded_packages: Vec<String>,
    /// Patches applied onto this pack, in declaration order (later overlays
    /// earlier).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<Fpid>,
    #[serde(
        default,
        rename = "included-configs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub included_configs: Vec<ConfigId>,
    #[serde(
        default,
        rename = "excluded-configs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub excluded_configs: Vec<ConfigId>,
}

impl FeaturePackConfig {
    pub fn new(location: FeaturePackLocation) -> Self {
        Self {
            location,
            transitive: false,
            inherit_packages: None,
            inherit_configs: None,
            included_packages: Vec::new(),
            excluded_packages: Vec::new(),
            included_configs: Vec::new(),
            excluded_configs: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn builder(location: FeaturePackLocation) -> FeaturePackConfigBuilder {
        FeaturePackConfigBuilder {
            config: Self::new(location),
        }
    }

    /// Whether this declaration carries any selection customization at all.
    pub fn is_plain(&self) -> bool {
        self.inherit_packages.is_none()
            && self.inherit_configs.is_none()
            && self.included_packages.is_empty()
            && self.excluded_packages.is_empty()
            && self.included_configs.is_empty()
            && self.excluded_configs.is_empty()
    }
}

/// Owned builder consumed into an immutable [`FeaturePackConfig`].
#[derive(Debug)]
pub struct FeaturePackConfigBuilder {
    config: FeaturePackConfig,
}

impl FeaturePackConfigBuilder {
    pub fn transitive(mut self) -> Self {
        self.config.transitive = true;
        self
    }

    pub fn inherit_packages(mut self, inherit: bool) -> Self {
        self.config.inherit_packages = Some(inherit);
        self
    }

    pub fn inherit_configs(mut self, inherit: bool) -> Self {
        self.config.inherit_configs = Some(inherit);
        self
    }

    pub fn include_package(mut self, name: impl Into<String>) -> Self {
        self.config.included_packages.push(name.into());
        self
    }

    pub fn exclude_package(mut self, name: impl Into<String>) -> Self {
        self.config.excluded_packages.push(name.into());
        self
    }

    pub fn include_default_config(
        mut self,
        model: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.config.included_configs.push(ConfigId::named(model, name));
        self
    }

    pub fn include_config_model(mut self, model: impl Into<String>) -> Self {
        self.config.included_configs.push(ConfigId::model_only(model));
        self
    }

    pub fn exclude_default_config(
        mut self,
        model: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.config.excluded_configs.push(ConfigId::named(model, name));
        self
    }

    pub fn exclude_config_model(mut self, model: impl Into<String>) -> Self {
        self.config.excluded_configs.push(ConfigId::model_only(model));
        self
    }

    pub fn add_patch(mut self, patch: Fpid) -> Self {
        self.config.patches.push(patch);
        self
    }

    pub fn build(self) -> FeaturePackConfig {
        self.config
    }
}

/// The root desired state of an installation.
///
/// Field order matters for TOML serialization: plain values come before
/// tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(
        default,
        rename = "default-universe",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_universe: Option<UniverseSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub universes: BTreeMap<String, UniverseSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    #[serde(
        default,
        rename = "feature-packs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub feature_packs: Vec<FeaturePackConfig>,
    /// Inline config definitions merged on top of everything the feature
    /// packs contribute.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ConfigModel>,
}

impl ProvisioningConfig {
    pub fn builder() -> ProvisioningConfigBuilder {
        ProvisioningConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load and parse a provisioning descriptor from the given path.
    pub fn from_path(path: &Path) -> CaravelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CaravelError::Descriptor {
            path: path.display().to_string(),
            message: format!("failed to read: {e}"),
        })?;
        toml::from_str(&content).map_err(|e| {
            CaravelError::Descriptor {
                path: path.display().to_string(),
                message: format!("failed to parse: {e}"),
            }
            .into()
        })
    }

    /// Serialize to a pretty-printed TOML descriptor.
    pub fn to_string_pretty(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The declaration for a producer, if present.
    pub fn feature_pack(&self, producer_key: &str) -> Option<&FeaturePackConfig> {
        self.feature_packs
            .iter()
            .find(|fp| fp.location.producer_key() == producer_key)
    }
}

/// Owned builder consumed into an immutable [`ProvisioningConfig`].
#[derive(Debug)]
pub struct ProvisioningConfigBuilder {
    config: ProvisioningConfig,
}

impl ProvisioningConfigBuilder {
    pub fn add_feature_pack(mut self, fp: FeaturePackConfig) -> Self {
        self.config.feature_packs.push(fp);
        self
    }

    pub fn add_config(mut self, config: ConfigModel) -> Self {
        self.config.configs.push(config);
        self
    }

    pub fn universe(mut self, name: impl Into<String>, spec: UniverseSpec) -> Self {
        self.config.universes.insert(name.into(), spec);
        self
    }

    pub fn default_universe(mut self, spec: UniverseSpec) -> Self {
        self.config.default_universe = Some(spec);
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.options.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> ProvisioningConfig {
        self.config
    }
}
