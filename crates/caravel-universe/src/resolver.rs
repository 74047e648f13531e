//! Resolution of partial addresses into pinned ids and content directories.
//!
//! The resolver caches one loaded universe per spec and one content path per
//! id for the lifetime of a provisioning operation. A producer or channel
//! miss on a cached universe triggers exactly one re-fetch of the universe's
//! backing artifact before the miss is surfaced as an error.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use caravel_core::config::ProvisioningConfig;
use caravel_core::location::{FeaturePackLocation, Fpid, UniverseSpec, MAVEN_FACTORY};
use caravel_core::version::Qualifier;
use caravel_util::errors::{CaravelError, CaravelResult};

use crate::backend::{ArtifactBackend, Coordinate};
use crate::universe::{Channel, Producer, Universe, UniverseFactoryRegistry};

struct CachedUniverse {
    universe: Box<dyn Universe>,
    refreshed: bool,
}

/// Stateful resolver for one provisioning operation.
pub struct UniverseResolver {
    backend: Arc<dyn ArtifactBackend>,
    factories: UniverseFactoryRegistry,
    named: BTreeMap<String, UniverseSpec>,
    default_universe: UniverseSpec,
    local_only: bool,
    universes: HashMap<UniverseSpec, CachedUniverse>,
    paths: HashMap<Fpid, PathBuf>,
}

impl UniverseResolver {
    pub fn new(backend: Arc<dyn ArtifactBackend>) -> Self {
        Self {
            backend,
            factories: UniverseFactoryRegistry::new(),
            named: BTreeMap::new(),
            default_universe: UniverseSpec::maven(),
            local_only: false,
            universes: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    /// Resolver configured with the named and default universes of a
    /// provisioning configuration.
    pub fn with_config(backend: Arc<dyn ArtifactBackend>, config: &ProvisioningConfig) -> Self {
        let mut resolver = Self::new(backend);
        resolver.named = config.universes.clone();
        if let Some(default) = &config.default_universe {
            resolver.default_universe = default.clone();
        }
        resolver
    }

    /// Restrict build selection to versions available in the local store.
    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    pub fn register_factory(&mut self, factory: Box<dyn crate::universe::UniverseFactory>) {
        self.factories.register(factory);
    }

    pub fn backend(&self) -> &Arc<dyn ArtifactBackend> {
        &self.backend
    }

    /// Fill in the default universe and expand named universe aliases.
    pub fn normalize(&self, location: &FeaturePackLocation) -> FeaturePackLocation {
        let mut loc = location.with_default_universe(&self.default_universe);
        if let Some(spec) = &loc.universe {
            if spec.location.is_none() {
                if let Some(named) = self.named.get(&spec.factory) {
                    loc.universe = Some(named.clone());
                }
            }
        }
        loc
    }

    fn normalize_fpid(&self, fpid: &Fpid) -> Fpid {
        self.normalize(&fpid.location())
            .fpid()
            .expect("normalizing keeps the build")
    }

    /// Load (or return the cached) universe for a spec.
    pub fn resolve_universe(&mut self, spec: &UniverseSpec) -> CaravelResult<&dyn Universe> {
        self.ensure_loaded(spec)?;
        Ok(self.universes[spec].universe.as_ref())
    }

    fn ensure_loaded(&mut self, spec: &UniverseSpec) -> CaravelResult<()> {
        if self.universes.contains_key(spec) {
            return Ok(());
        }
        let factory = self
            .factories
            .get(&spec.factory)
            .ok_or_else(|| CaravelError::UnknownUniverse {
                spec: spec.to_string(),
            })?;
        let universe = factory.load(spec, self.backend.as_ref())?;
        self.universes.insert(
            spec.clone(),
            CachedUniverse {
                universe,
                refreshed: false,
            },
        );
        Ok(())
    }

    /// Re-fetch the universe's backing artifact, at most once per spec.
    /// Returns whether a refresh actually happened.
    fn refresh(&mut self, spec: &UniverseSpec) -> CaravelResult<bool> {
        match self.universes.get(spec) {
            Some(cached) if cached.refreshed => return Ok(false),
            None => return Ok(false),
            Some(_) => {}
        }
        tracing::debug!("refreshing universe {spec} after a lookup miss");
        let factory = self
            .factories
            .get(&spec.factory)
            .ok_or_else(|| CaravelError::UnknownUniverse {
                spec: spec.to_string(),
            })?;
        let universe = factory.load(spec, self.backend.as_ref())?;
        self.universes.insert(
            spec.clone(),
            CachedUniverse {
                universe,
                refreshed: true,
            },
        );
        Ok(true)
    }

    /// Look up a producer, refreshing the universe once on a miss.
    pub fn producer(&mut self, spec: &UniverseSpec, name: &str) -> CaravelResult<Producer> {
        self.ensure_loaded(spec)?;
        if let Some(producer) = self.universes[spec].universe.producer(name) {
            return Ok(producer);
        }
        if self.refresh(spec)? {
            if let Some(producer) = self.universes[spec].universe.producer(name) {
                return Ok(producer);
            }
        }
        Err(CaravelError::ProducerNotFound {
            universe: spec.to_string(),
            producer: name.to_string(),
        }
        .into())
    }

    fn channel(
        &mut self,
        spec: &UniverseSpec,
        producer: &Producer,
        name: Option<&str>,
    ) -> CaravelResult<Channel> {
        match name {
            Some(name) => {
                if let Some(channel) = producer.channel(name) {
                    return Ok(channel.clone());
                }
                if self.refresh(spec)? {
                    let producer = self.producer(spec, &producer.name)?;
                    if let Some(channel) = producer.channel(name) {
                        return Ok(channel.clone());
                    }
                }
                Err(CaravelError::ChannelNotFound {
                    producer: producer.name.clone(),
                    channel: name.to_string(),
                }
                .into())
            }
            None => producer.preferred_channel().cloned().ok_or_else(|| {
                CaravelError::ChannelNotFound {
                    producer: producer.name.clone(),
                    channel: "<default>".to_string(),
                }
                .into()
            }),
        }
    }

    /// Pin a location to a concrete build.
    ///
    /// A location already carrying a build passes through; otherwise the
    /// highest version in the channel's range honoring the frequency's
    /// qualifier floor is selected.
    pub fn resolve_build(&mut self, location: &FeaturePackLocation) -> CaravelResult<Fpid> {
        let loc = self.normalize(location);
        if let Some(fpid) = loc.fpid() {
            return Ok(fpid);
        }
        let spec = loc.universe.clone().expect("normalized location has a universe");
        let producer = self.producer(&spec, &loc.producer)?;
        let channel = self.channel(&spec, &producer, loc.channel.as_deref())?;

        if let Some(frequency) = loc.frequency.as_deref() {
            if !producer.has_frequency(frequency) {
                return Err(CaravelError::Config {
                    message: format!(
                        "producer `{}` does not publish frequency `{frequency}`",
                        producer.name
                    ),
                }
                .into());
            }
        }
        let frequency = loc.frequency.as_deref().or(producer.default_frequency.as_deref());
        let floor = Qualifier::from_frequency(frequency)?;

        let base = Coordinate::from_ga(&producer.coordinate, "")?;
        let versions = self
            .backend
            .versions(&base.group, &base.artifact, self.local_only)?;
        let latest = channel.range.latest(&versions, floor);
        match latest.version {
            Some(version) => {
                tracing::debug!(
                    "resolved {} to build {} on channel {}",
                    loc.producer,
                    version,
                    channel.name
                );
                Ok(loc.with_build(version.original))
            }
            None => Err(CaravelError::NoMatchingVersion {
                producer: loc.producer.clone(),
                range: channel.range.to_string(),
                floor: floor.to_string(),
                below_floor: latest.below_floor,
            }
            .into()),
        }
    }

    /// Content directory for a pinned id, memoized per id.
    pub fn resolve(&mut self, fpid: &Fpid) -> CaravelResult<PathBuf> {
        let fpid = self.normalize_fpid(fpid);
        if let Some(path) = self.paths.get(&fpid) {
            return Ok(path.clone());
        }
        let coordinate = self.coordinate_of(&fpid)?;
        let path = self.backend.resolve(&coordinate)?;
        self.paths.insert(fpid, path.clone());
        Ok(path)
    }

    fn coordinate_of(&mut self, fpid: &Fpid) -> CaravelResult<Coordinate> {
        let spec = fpid.universe.clone().expect("normalized id has a universe");
        if spec.factory == MAVEN_FACTORY {
            return Coordinate::from_shorthand(&fpid.producer, &fpid.build, spec.location.as_deref());
        }
        let producer = self.producer(&spec, &fpid.producer)?;
        Coordinate::from_ga(&producer.coordinate, &fpid.build)
    }
}

impl std::fmt::Debug for UniverseResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniverseResolver")
            .field("default_universe", &self.default_universe)
            .field("named", &self.named)
            .field("local_only", &self.local_only)
            .field("cached_universes", &self.universes.len())
            .field("cached_paths", &self.paths.len())
            .finish()
    }
}
