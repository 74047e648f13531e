//! Per-feature-pack package and config selection.
//!
//! For every pack in the layout this computes which packages and which
//! default config fragments take part in the merge, from the pack's own
//! defaults and the inherit/include/exclude customizations of its governing
//! declaration.

use std::collections::BTreeMap;

use caravel_core::model::{ConfigModel, Stability};
use caravel_resolver::layout::FeaturePackLayout;
use caravel_util::errors::{CaravelError, CaravelResult};

/// Option name for the unified stability level.
pub const OPTION_STABILITY: &str = "stability-level";
/// Option name for the package-only stability level.
pub const OPTION_PACKAGE_STABILITY: &str = "package-stability-level";
/// Option name for the config-only stability level.
pub const OPTION_CONFIG_STABILITY: &str = "config-stability-level";

/// Stability thresholds in force for one provisioning operation.
#[derive(Debug, Clone, Copy)]
pub struct StabilityPolicy {
    pub package: Stability,
    pub config: Stability,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        // Nothing is gated unless the caller asks for it.
        Self {
            package: Stability::Experimental,
            config: Stability::Experimental,
        }
    }
}

impl StabilityPolicy {
    /// Read the policy from the provisioning options.
    ///
    /// Setting the unified option together with a per-kind one is a
    /// configuration error.
    pub fn from_options(options: &BTreeMap<String, String>) -> CaravelResult<Self> {
        let unified = parse_level(options, OPTION_STABILITY)?;
        let package = parse_level(options, OPTION_PACKAGE_STABILITY)?;
        let config = parse_level(options, OPTION_CONFIG_STABILITY)?;

        if unified.is_some() && (package.is_some() || config.is_some()) {
            return Err(CaravelError::Config {
                message: format!(
                    "`{OPTION_STABILITY}` cannot be combined with \
                     `{OPTION_PACKAGE_STABILITY}` or `{OPTION_CONFIG_STABILITY}`"
                ),
            }
            .into());
        }

        let default = StabilityPolicy::default();
        Ok(match unified {
            Some(level) => StabilityPolicy {
                package: level,
                config: level,
            },
            None => StabilityPolicy {
                package: package.unwrap_or(default.package),
                config: config.unwrap_or(default.config),
            },
        })
    }
}

fn parse_level(options: &BTreeMap<String, String>, key: &str) -> CaravelResult<Option<Stability>> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => Stability::parse(value).map(Some).ok_or_else(|| {
            CaravelError::Config {
                message: format!("`{key}` has unknown stability level `{value}`"),
            }
            .into()
        }),
    }
}

/// What one feature pack contributes to the merge.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Selected packages, defaults first, in declaration order.
    pub packages: Vec<String>,
    /// Selected default config fragments, in declaration order.
    pub configs: Vec<ConfigModel>,
}

/// Compute the selection for one pack in the layout.
pub fn select(entry: &FeaturePackLayout, policy: &StabilityPolicy) -> CaravelResult<Selection> {
    Ok(Selection {
        packages: select_packages(entry, policy)?,
        configs: select_configs(entry, policy)?,
    })
}

fn select_packages(entry: &FeaturePackLayout, policy: &StabilityPolicy) -> CaravelResult<Vec<String>> {
    let spec = &entry.spec;
    let config = &entry.config;
    let fpid = entry.fpid.to_string();

    for name in config.included_packages.iter().chain(&config.excluded_packages) {
        if !spec.has_package(name) {
            return Err(CaravelError::UnknownSelectionTarget {
                kind: "package",
                name: name.clone(),
                fpid,
            }
            .into());
        }
    }

    // Unset inherit flags keep the defaults only for root-level
    // declarations; a dependency declaration propagates nothing beyond its
    // explicit includes.
    let inherit = config.inherit_packages.unwrap_or(entry.root_declared);

    let mut selected: Vec<String> = Vec::new();
    if inherit {
        for name in &spec.packages.default {
            if !config.excluded_packages.contains(name) {
                selected.push(name.clone());
            }
        }
    }
    for name in &config.included_packages {
        if !selected.contains(name) {
            selected.push(name.clone());
        }
    }

    // Pull in declared package dependencies, keeping selection order.
    let mut i = 0;
    while i < selected.len() {
        if let Some(package) = spec.package(&selected[i]) {
            for dep in &package.deps {
                if !spec.has_package(dep) {
                    return Err(CaravelError::UnknownSelectionTarget {
                        kind: "package",
                        name: dep.clone(),
                        fpid: entry.fpid.to_string(),
                    }
                    .into());
                }
                if !selected.contains(dep) {
                    selected.push(dep.clone());
                }
            }
        }
        i += 1;
    }

    selected.retain(|name| {
        let stability = spec.package(name).map(|p| p.stability).unwrap_or_default();
        if stability > policy.package {
            tracing::debug!("dropping package `{name}` of {}: stability {stability}", entry.fpid);
            false
        } else {
            true
        }
    });

    Ok(selected)
}

fn select_configs(entry: &FeaturePackLayout, policy: &StabilityPolicy) -> CaravelResult<Vec<ConfigModel>> {
    let spec = &entry.spec;
    let config = &entry.config;

    for id in config.included_configs.iter().chain(&config.excluded_configs) {
        let known = spec.configs.iter().any(|c| id.matches(&c.id()));
        if !known {
            return Err(CaravelError::UnknownSelectionTarget {
                kind: "config",
                name: id.to_string(),
                fpid: entry.fpid.to_string(),
            }
            .into());
        }
    }

    let inherit = config.inherit_configs.unwrap_or(entry.root_declared);

    let mut selected = Vec::new();
    for declared in &spec.configs {
        let id = declared.id();
        let included = config.included_configs.iter().any(|i| i.matches(&id));
        let excluded = config.excluded_configs.iter().any(|e| e.matches(&id));
        // An explicit include re-adds a config dropped by an exclusion.
        let keep = if inherit { !excluded || included } else { included };
        if !keep {
            continue;
        }
        if declared.stability > policy.config {
            tracing::debug!(
                "dropping config `{id}` of {}: stability {}",
                entry.fpid,
                declared.stability
            );
            continue;
        }
        selected.push(declared.clone());
    }

    Ok(selected)
}
