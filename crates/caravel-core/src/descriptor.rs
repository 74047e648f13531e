//! Feature pack descriptors.
//!
//! Every feature pack directory carries a `feature-pack.toml` describing its
//! identity, dependencies, packages, and configuration model. A light parse
//! path ([`DescriptorHeader`]) reads only the identity and dependency list
//! so the engine-version gate can run before the full model loads.

use std::path::Path;

use serde::{Deserialize, Serialize};

use caravel_util::errors::{CaravelError, CaravelResult};

use crate::config::FeaturePackConfig;
use crate::location::{FeaturePackLocation, Fpid};
use crate::model::{ConfigLayerSpec, ConfigModel, FeatureGroup, FeatureSpec, PackageSpec};

/// File name of the descriptor inside a feature pack directory.
pub const FEATURE_PACK_DESCRIPTOR: &str = "feature-pack.toml";

/// Directory holding package content inside a feature pack.
pub const PACKAGES_DIR: &str = "packages";

/// The `[pack]` section: identity and engine requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackSection {
    pub location: Fpid,
    /// Oldest engine version able to provision this pack.
    #[serde(
        default,
        rename = "min-engine-version",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_engine_version: Option<String>,
    /// Set on patch packs: the base feature pack this patch overlays.
    #[serde(default, rename = "patch-for", skip_serializing_if = "Option::is_none")]
    pub patch_for: Option<Fpid>,
}

/// The `[packages]` section: default selection plus declared package specs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackagesSection {
    /// Packages installed when the pack's defaults are inherited.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declared: Vec<PackageSpec>,
}

/// The full feature pack descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePackSpec {
    pub pack: PackSection,
    /// Dependency declarations, reusing the provisioning-config selection
    /// surface.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<FeaturePackConfig>,
    #[serde(default, skip_serializing_if = "packages_empty")]
    pub packages: PackagesSection,
    #[serde(default, rename = "feature-specs", skip_serializing_if = "Vec::is_empty")]
    pub feature_specs: Vec<FeatureSpec>,
    #[serde(default, rename = "feature-groups", skip_serializing_if = "Vec::is_empty")]
    pub feature_groups: Vec<FeatureGroup>,
    /// Default configs contributed when configs are inherited.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ConfigModel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<ConfigLayerSpec>,
}

fn packages_empty(packages: &PackagesSection) -> bool {
    packages.default.is_empty() && packages.declared.is_empty()
}

impl FeaturePackSpec {
    pub fn new(fpid: Fpid) -> Self {
        Self {
            pack: PackSection {
                location: fpid,
                min_engine_version: None,
                patch_for: None,
            },
            dependencies: Vec::new(),
            packages: PackagesSection::default(),
            feature_specs: Vec::new(),
            feature_groups: Vec::new(),
            configs: Vec::new(),
            layers: Vec::new(),
        }
    }

    /// Load the descriptor from a feature pack directory.
    pub fn load(dir: &Path) -> CaravelResult<Self> {
        let path = dir.join(FEATURE_PACK_DESCRIPTOR);
        let content = read(&path)?;
        let spec: Self = parse(&path, &content)?;
        spec.validate(&path)?;
        Ok(spec)
    }

    pub fn to_string_pretty(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn fpid(&self) -> &Fpid {
        &self.pack.location
    }

    pub fn producer_key(&self) -> String {
        self.pack.location.producer_key()
    }

    pub fn package(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.declared.iter().find(|p| p.name == name)
    }

    /// Whether `name` is a known package: declared, or listed as a default.
    pub fn has_package(&self, name: &str) -> bool {
        self.package(name).is_some() || self.packages.default.iter().any(|p| p == name)
    }

    pub fn feature_spec(&self, name: &str) -> Option<&FeatureSpec> {
        self.feature_specs.iter().find(|s| s.name == name)
    }

    pub fn feature_group(&self, name: &str) -> Option<&FeatureGroup> {
        self.feature_groups.iter().find(|g| g.name == name)
    }

    pub fn config(&self, model: &str, name: &str) -> Option<&ConfigModel> {
        self.configs
            .iter()
            .find(|c| c.model == model && c.name == name)
    }

    pub fn layer(&self, model: &str, name: &str) -> Option<&ConfigLayerSpec> {
        self.layers
            .iter()
            .find(|l| l.model == model && l.name == name)
    }

    fn validate(&self, path: &Path) -> CaravelResult<()> {
        let mut seen = std::collections::HashSet::new();
        for package in &self.packages.declared {
            if !seen.insert(package.name.as_str()) {
                return Err(descriptor_error(
                    path,
                    format!("duplicate package `{}`", package.name),
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for config in &self.configs {
            if config.model.is_empty() || config.name.is_empty() {
                return Err(descriptor_error(
                    path,
                    "declared configs must carry both model and name".to_string(),
                ));
            }
            if !seen.insert((config.model.as_str(), config.name.as_str())) {
                return Err(descriptor_error(
                    path,
                    format!("duplicate config `{}`", config.id()),
                ));
            }
        }
        Ok(())
    }
}

/// The light parse path: identity, engine gate, and dependency locations
/// only. Unknown fields in the descriptor are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorHeader {
    pub pack: PackSection,
    #[serde(default)]
    pub dependencies: Vec<DependencyHeader>,
}

/// A dependency as seen by the light parse path.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencyHeader {
    pub location: FeaturePackLocation,
    #[serde(default)]
    pub transitive: bool,
}

impl DescriptorHeader {
    pub fn peek(dir: &Path) -> CaravelResult<Self> {
        let path = dir.join(FEATURE_PACK_DESCRIPTOR);
        let content = read(&path)?;
        parse(&path, &content)
    }
}

fn read(path: &Path) -> CaravelResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        CaravelError::Descriptor {
            path: path.display().to_string(),
            message: format!("failed to read: {e}"),
        }
        .into()
    })
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> CaravelResult<T> {
    toml::from_str(content).map_err(|e| {
        CaravelError::Descriptor {
            path: path.display().to_string(),
            message: format!("failed to parse: {e}"),
        }
        .into()
    })
}

fn descriptor_error(path: &Path, message: String) -> miette::Report {
    CaravelError::Descriptor {
        path: path.display().to_string(),
        message,
    }
    .into()
}
