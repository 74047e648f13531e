//! The universe model: producers, channels, and the pluggable factories
//! that load a universe from its backing artifact.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use caravel_core::location::{UniverseSpec, MAVEN_FACTORY};
use caravel_core::version::{Qualifier, VersionRange};
use caravel_util::errors::{CaravelError, CaravelResult};

use crate::backend::{ArtifactBackend, Coordinate};

/// File name of the universe descriptor inside its backing artifact.
pub const UNIVERSE_DESCRIPTOR: &str = "universe.toml";

/// Factory id of the registry (descriptor-backed) universe.
pub const REGISTRY_FACTORY: &str = "registry";

/// A named release stream of a producer.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub range: VersionRange,
}

/// A named publisher within a universe.
#[derive(Debug, Clone)]
pub struct Producer {
    pub name: String,
    /// `group:artifact` coordinate of the producer's feature pack artifacts.
    pub coordinate: String,
    pub frequencies: Vec<String>,
    pub default_frequency: Option<String>,
    pub default_channel: Option<String>,
    pub channels: Vec<Channel>,
}

impl Producer {
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// The channel consulted when a location names none.
    pub fn preferred_channel(&self) -> Option<&Channel> {
        match &self.default_channel {
            Some(name) => self.channel(name),
            None if self.channels.len() == 1 => self.channels.first(),
            None => None,
        }
    }

    /// Whether a frequency is one this producer publishes.
    pub fn has_frequency(&self, frequency: &str) -> bool {
        self.frequencies.is_empty() || self.frequencies.iter().any(|f| f == frequency)
    }
}

/// A loaded naming authority.
pub trait Universe: fmt::Debug {
    /// Identity used in error messages.
    fn id(&self) -> String;

    fn producer(&self, name: &str) -> Option<Producer>;

    fn producer_names(&self) -> Vec<String>;
}

/// Loads universes for one factory id.
pub trait UniverseFactory {
    fn id(&self) -> &str;

    fn load(
        &self,
        spec: &UniverseSpec,
        backend: &dyn ArtifactBackend,
    ) -> CaravelResult<Box<dyn Universe>>;
}

/// Registry of universe factories, keyed by factory id.
pub struct UniverseFactoryRegistry {
    factories: BTreeMap<String, Box<dyn UniverseFactory>>,
}

impl UniverseFactoryRegistry {
    /// Registry with the built-in factories: `registry` and `maven`.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register(Box::new(RegistryUniverseFactory));
        registry.register(Box::new(MavenUniverseFactory));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn UniverseFactory>) {
        self.factories.insert(factory.id().to_string(), factory);
    }

    pub fn get(&self, id: &str) -> Option<&dyn UniverseFactory> {
        self.factories.get(id).map(|f| f.as_ref())
    }
}

impl Default for UniverseFactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UniverseFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniverseFactoryRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Range the registry factory uses to pick its own backing artifact.
const BACKING_RANGE: &str = "(,)";

/// Descriptor-backed universe: producers and channels are listed in a
/// `universe.toml` inside a versioned artifact resolved through the backend.
#[derive(Debug)]
pub struct RegistryUniverse {
    spec: UniverseSpec,
    version: String,
    producers: BTreeMap<String, Producer>,
}

impl Universe for RegistryUniverse {
    fn id(&self) -> String {
        format!("{}@{}", self.spec, self.version)
    }

    fn producer(&self, name: &str) -> Option<Producer> {
        self.producers.get(name).cloned()
    }

    fn producer_names(&self) -> Vec<String> {
        self.producers.keys().cloned().collect()
    }
}

pub struct RegistryUniverseFactory;

impl UniverseFactory for RegistryUniverseFactory {
    fn id(&self) -> &str {
        REGISTRY_FACTORY
    }

    fn load(
        &self,
        spec: &UniverseSpec,
        backend: &dyn ArtifactBackend,
    ) -> CaravelResult<Box<dyn Universe>> {
        let ga = spec.location.as_deref().ok_or_else(|| CaravelError::UnknownUniverse {
            spec: spec.to_string(),
        })?;
        let base = Coordinate::from_ga(ga, "")?;

        // Highest release of the universe's own backing artifact.
        let versions = backend.versions(&base.group, &base.artifact, false)?;
        let range = VersionRange::parse(BACKING_RANGE)?;
        let latest = range.latest(&versions, Qualifier::Final);
        let version = latest.version.ok_or_else(|| CaravelError::NoMatchingVersion {
            producer: ga.to_string(),
            range: range.to_string(),
            floor: Qualifier::Final.to_string(),
            below_floor: latest.below_floor,
        })?;

        let mut coord = Coordinate::from_ga(ga, &version.original)?;
        coord.extension = "toml".to_string();
        let dir = backend.resolve(&coord)?;
        let doc = parse_universe_doc(&dir)?;

        let mut producers = BTreeMap::new();
        for producer in doc.producers {
            let mut channels = Vec::new();
            for channel in producer.channels {
                channels.push(Channel {
                    name: channel.name,
                    range: VersionRange::parse(&channel.version_range)?,
                });
            }
            producers.insert(
                producer.name.clone(),
                Producer {
                    name: producer.name,
                    coordinate: producer.coordinate,
                    frequencies: producer.frequencies,
                    default_frequency: producer.default_frequency,
                    default_channel: producer.default_channel,
                    channels,
                },
            );
        }

        tracing::debug!(
            "loaded universe {} at {} with {} producers",
            spec,
            version,
            producers.len()
        );
        Ok(Box::new(RegistryUniverse {
            spec: spec.clone(),
            version: version.original,
            producers,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct UniverseDoc {
    #[serde(default)]
    producers: Vec<ProducerDoc>,
}

#[derive(Debug, Deserialize)]
struct ProducerDoc {
    name: String,
    coordinate: String,
    #[serde(default)]
    frequencies: Vec<String>,
    #[serde(default, rename = "default-frequency")]
    default_frequency: Option<String>,
    #[serde(default, rename = "default-channel")]
    default_channel: Option<String>,
    #[serde(default)]
    channels: Vec<ChannelDoc>,
}

#[derive(Debug, Deserialize)]
struct ChannelDoc {
    name: String,
    #[serde(rename = "version-range")]
    version_range: String,
}

fn parse_universe_doc(dir: &Path) -> CaravelResult<UniverseDoc> {
    let path = dir.join(UNIVERSE_DESCRIPTOR);
    let content = std::fs::read_to_string(&path).map_err(|e| CaravelError::Descriptor {
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

/// Pass-through universe behind the coordinate shorthand: every
/// `group:artifact` producer exists and publishes one all-versions channel.
#[derive(Debug)]
pub struct MavenUniverse;

impl Universe for MavenUniverse {
    fn id(&self) -> String {
        MAVEN_FACTORY.to_string()
    }

    fn producer(&self, name: &str) -> Option<Producer> {
        name.contains(':').then(|| Producer {
            name: name.to_string(),
            coordinate: name.to_string(),
            frequencies: Vec::new(),
            default_frequency: None,
            default_channel: Some("releases".to_string()),
            channels: vec![Channel {
                name: "releases".to_string(),
                range: VersionRange::any(),
            }],
        })
    }

    fn producer_names(&self) -> Vec<String> {
        Vec::new()
    }
}

pub struct MavenUniverseFactory;

impl UniverseFactory for MavenUniverseFactory {
    fn id(&self) -> &str {
        MAVEN_FACTORY
    }

    fn load(
        &self,
        _spec: &UniverseSpec,
        _backend: &dyn ArtifactBackend,
    ) -> CaravelResult<Box<dyn Universe>> {
        Ok(Box::new(MavenUniverse))
    }
}
