//! Update plans: the diff between an installed layout and a set of
//! requested feature pack updates.
//!
//! Explicit requests come first, in caller order. After that, any installed
//! producer whose build no longer satisfies a coordinate-equivalent
//! dependency declared by an updated pack gets a `transitive` plan entry,
//! discovered by re-walking the dependency declarations of the newly
//! selected versions (not the old ones).

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use caravel_core::descriptor::DescriptorHeader;
use caravel_core::location::{FeaturePackLocation, Fpid};
use caravel_universe::resolver::UniverseResolver;
use caravel_util::errors::{CaravelError, CaravelResult};

use crate::layout::ProvisioningLayout;

/// A caller-supplied update request for one producer.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Producer name or producer key of an installed feature pack.
    pub producer: String,
    /// New location to move the producer to; `None` keeps the build and
    /// only changes patches.
    pub location: Option<FeaturePackLocation>,
    pub added_patches: Vec<Fpid>,
    pub removed_patches: Vec<Fpid>,
}

impl UpdateRequest {
    pub fn to_location(producer: impl Into<String>, location: FeaturePackLocation) -> Self {
        Self {
            producer: producer.into(),
            location: Some(location),
            ..Default::default()
        }
    }
}

/// One producer's entry in an update plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturePackUpdatePlan {
    pub producer: String,
    pub current: Fpid,
    #[serde(default, rename = "new-location", skip_serializing_if = "Option::is_none")]
    pub new_location: Option<FeaturePackLocation>,
    #[serde(default, rename = "added-patches", skip_serializing_if = "Vec::is_empty")]
    pub added_patches: Vec<Fpid>,
    #[serde(default, rename = "removed-patches", skip_serializing_if = "Vec::is_empty")]
    pub removed_patches: Vec<Fpid>,
    /// Pulled in by an updated pack's dependency declarations rather than
    /// requested by the caller.
    #[serde(default)]
    pub transitive: bool,
}

/// Compute the update plan for a set of requests against the current layout.
pub fn plan_updates(
    layout: &ProvisioningLayout,
    requests: &[UpdateRequest],
    resolver: &mut UniverseResolver,
) -> CaravelResult<Vec<FeaturePackUpdatePlan>> {
    let installed: HashMap<String, Fpid> = layout
        .feature_packs()
        .iter()
        .map(|e| (e.fpid.producer_key(), e.fpid.clone()))
        .collect();

    let mut plans = Vec::new();
    let mut planned: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<Fpid> = VecDeque::new();

    for request in requests {
        let entry = layout
            .feature_packs()
            .iter()
            .find(|e| {
                e.fpid.producer_key() == request.producer || e.fpid.producer == request.producer
            })
            .ok_or_else(|| CaravelError::Config {
                message: format!(
                    "update requested for `{}` which is not in the current layout",
                    request.producer
                ),
            })?;
        let key = entry.fpid.producer_key();
        let current = entry.fpid.clone();

        let new_fpid = match &request.location {
            Some(location) => Some(resolver.resolve_build(location)?),
            None => None,
        };

        plans.push(FeaturePackUpdatePlan {
            producer: key.clone(),
            current: current.clone(),
            new_location: new_fpid.as_ref().map(|f| f.location()),
            added_patches: request.added_patches.clone(),
            removed_patches: request.removed_patches.clone(),
            transitive: false,
        });
        planned.insert(key);

        if let Some(new_fpid) = new_fpid {
            if new_fpid != current {
                queue.push_back(new_fpid);
            }
        }
    }

    // Walk the dependency declarations of every newly selected build; an
    // installed producer whose build no longer matches what the new build
    // declares needs a transitive update.
    while let Some(fpid) = queue.pop_front() {
        let dir = resolver.resolve(&fpid)?;
        let header = DescriptorHeader::peek(&dir)?;
        for dep in &header.dependencies {
            let loc = resolver.normalize(&dep.location);
            let key = loc.producer_key();
            let Some(current) = installed.get(&key) else {
                continue;
            };
            if planned.contains(&key) {
                continue;
            }
            let declared = resolver.resolve_build(&loc)?;
            if declared.build == current.build {
                continue;
            }
            tracing::debug!(
                "{key} installed at {} no longer satisfies {} declared by {fpid}",
                current.build,
                declared.build
            );
            plans.push(FeaturePackUpdatePlan {
                producer: key.clone(),
                current: current.clone(),
                new_location: Some(declared.location()),
                added_patches: Vec::new(),
                removed_patches: Vec::new(),
                transitive: true,
            });
            planned.insert(key);
            queue.push_back(declared);
        }
    }

    Ok(plans)
}

/// Apply an update plan to a provisioning config, producing the config to
/// re-provision with.
pub fn apply_plan(
    config: &caravel_core::config::ProvisioningConfig,
    plans: &[FeaturePackUpdatePlan],
) -> caravel_core::config::ProvisioningConfig {
    let mut updated = config.clone();
    for plan in plans {
        let mut matched = false;
        for fp in &mut updated.feature_packs {
            // A root declaration may omit the universe its producer key
            // carries, so match on the plain producer too.
            if fp.location.producer_key() != plan.producer
                && fp.location.producer != plan.current.producer
            {
                continue;
            }
            matched = true;
            if let Some(location) = &plan.new_location {
                fp.location = location.clone();
            }
            fp.patches.retain(|p| !plan.removed_patches.contains(p));
            for patch in &plan.added_patches {
                if !fp.patches.contains(patch) {
                    fp.patches.push(patch.clone());
                }
            }
        }
        // A transitive plan entry pins a producer that has no root
        // declaration yet.
        if !matched {
            if let Some(location) = &plan.new_location {
                let mut fp = caravel_core::config::FeaturePackConfig::new(location.clone());
                fp.transitive = true;
                updated.feature_packs.push(fp);
            }
        }
    }
    updated
}
