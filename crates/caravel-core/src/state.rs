//! The provisioned state: the immutable record of what one provisioning
//! operation produced, persisted under the installation's metadata
//! directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use caravel_util::errors::{CaravelError, CaravelResult};

use crate::location::Fpid;
use crate::model::ConfigId;

/// File name of the persisted state under the metadata directory.
pub const STATE_FILE: &str = "state.json";

/// Identity of a feature spec once its producer is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedSpecId {
    pub producer: String,
    pub name: String,
}

impl ResolvedSpecId {
    pub fn new(producer: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResolvedSpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.producer, self.name)
    }
}

/// Global identity of one feature instance: its resolved spec plus the
/// ordered id-parameter values. Unique within a provisioned config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedFeatureId {
    pub spec: ResolvedSpecId,
    /// Id parameters in spec declaration order.
    pub params: Vec<(String, String)>,
}

impl ResolvedFeatureId {
    pub fn new(spec: ResolvedSpecId, params: Vec<(String, String)>) -> Self {
        Self { spec, params }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ResolvedFeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.spec)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// One provisioned feature: identity plus all resolved parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedFeature {
    pub id: ResolvedFeatureId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// One merged configuration in the final state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedConfig {
    pub id: ConfigId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
    /// Ordered by (declaring feature pack order, declaration order).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<ProvisionedFeature>,
}

impl ProvisionedConfig {
    pub fn feature(&self, id: &ResolvedFeatureId) -> Option<&ProvisionedFeature> {
        self.features.iter().find(|f| &f.id == id)
    }
}

/// One feature pack with its finally selected packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedFeaturePack {
    pub fpid: Fpid,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
}

/// The final output of one provisioning operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedState {
    /// Feature packs in install order.
    #[serde(default, rename = "feature-packs", skip_serializing_if = "Vec::is_empty")]
    pub feature_packs: Vec<ProvisionedFeaturePack>,
    /// Configs ordered by first encounter in dependency-first order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ProvisionedConfig>,
}

impl ProvisionedState {
    pub fn config(&self, model: &str, name: &str) -> Option<&ProvisionedConfig> {
        let id = ConfigId::named(model, name);
        self.configs.iter().find(|c| c.id == id)
    }

    pub fn feature_pack(&self, producer_key: &str) -> Option<&ProvisionedFeaturePack> {
        self.feature_packs
            .iter()
            .find(|fp| fp.fpid.producer_key() == producer_key)
    }

    pub fn from_path(path: &Path) -> CaravelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CaravelError::Descriptor {
            path: path.display().to_string(),
            message: format!("failed to read: {e}"),
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CaravelError::Descriptor {
                path: path.display().to_string(),
                message: format!("failed to parse: {e}"),
            }
            .into()
        })
    }

    pub fn write_to(&self, path: &Path) -> CaravelResult<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| CaravelError::Generic {
            message: format!("failed to serialize provisioned state: {e}"),
        })?;
        std::fs::write(path, content).map_err(CaravelError::Io)?;
        Ok(())
    }
}
