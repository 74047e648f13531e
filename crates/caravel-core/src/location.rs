//! Feature pack addresses: partial locations, fully resolved ids, and the
//! universe spec that names the authority resolving them.
//!
//! The string grammar is
//! `producer[@factory[(location)]][:channel][/frequency][#build]`, plus the
//! coordinate shorthand `group:artifact:version` (with optional packaging
//! and classifier segments) for artifacts addressed directly in a
//! repository, which implies the `maven` universe factory and a `zip`
//! packaging.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use caravel_util::errors::{CaravelError, CaravelResult};

/// The universe factory used by the coordinate shorthand.
pub const MAVEN_FACTORY: &str = "maven";

/// Names the pluggable authority that maps producers to artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniverseSpec {
    /// Factory id, or the name of a universe configured on the installation.
    pub factory: String,
    /// Factory-specific coordinate of the universe's backing artifact.
    pub location: Option<String>,
}

impl UniverseSpec {
    pub fn new(factory: impl Into<String>, location: Option<String>) -> Self {
        Self {
            factory: factory.into(),
            location,
        }
    }

    /// The universe behind the `group:artifact:version` shorthand.
    pub fn maven() -> Self {
        Self::new(MAVEN_FACTORY, None)
    }

    pub fn parse(text: &str) -> CaravelResult<Self> {
        if let Some(open) = text.find('(') {
            if !text.ends_with(')') {
                return Err(malformed(text, "unterminated universe location"));
            }
            let factory = &text[..open];
            let location = &text[open + 1..text.len() - 1];
            if factory.is_empty() || location.is_empty() {
                return Err(malformed(text, "empty universe factory or location"));
            }
            Ok(Self::new(factory, Some(location.to_string())))
        } else if text.is_empty() {
            Err(malformed(text, "empty universe spec"))
        } else {
            Ok(Self::new(text, None))
        }
    }
}

impl fmt::Display for UniverseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}({})", self.factory, loc),
            None => f.write_str(&self.factory),
        }
    }
}

/// A partial or full feature pack address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeaturePackLocation {
    pub universe: Option<UniverseSpec>,
    pub producer: String,
    pub channel: Option<String>,
    pub frequency: Option<String>,
    pub build: Option<String>,
}

impl FeaturePackLocation {
    pub fn new(producer: impl Into<String>) -> Self {
        Self {
            universe: None,
            producer: producer.into(),
            channel: None,
            frequency: None,
            build: None,
        }
    }

    pub fn parse(text: &str) -> CaravelResult<Self> {
        if text.trim().is_empty() {
            return Err(malformed(text, "empty location"));
        }
        let (rest, build) = match text.rsplit_once('#') {
            Some((rest, build)) => {
                if build.is_empty() {
                    return Err(malformed(text, "empty build after `#`"));
                }
                (rest, Some(build.to_string()))
            }
            None => (text, None),
        };

        if let Some((producer, universe_part)) = rest.split_once('@') {
            if producer.is_empty() {
                return Err(malformed(text, "empty producer"));
            }
            // The universe location may itself contain `:`; consume the
            // parenthesized part before looking for channel and frequency.
            let (universe_text, tail) = if universe_part.contains('(') {
                let close = universe_part
                    .find(')')
                    .ok_or_else(|| malformed(text, "unterminated universe location"))?;
                universe_part.split_at(close + 1)
            } else {
                match universe_part.find([':', '/']) {
                    Some(idx) => universe_part.split_at(idx),
                    None => (universe_part, ""),
                }
            };
            let (tail, frequency) = split_frequency(text, tail)?;
            let channel = if tail.is_empty() {
                None
            } else {
                let channel = tail
                    .strip_prefix(':')
                    .ok_or_else(|| malformed(text, "unexpected text after universe spec"))?;
                if channel.is_empty() {
                    return Err(malformed(text, "empty channel after `:`"));
                }
                Some(channel.to_string())
            };
            return Ok(Self {
                universe: Some(UniverseSpec::parse(universe_text)?),
                producer: producer.to_string(),
                channel,
                frequency,
                build,
            });
        }

        if rest.matches(':').count() >= 2 {
            return Self::parse_coordinate(text, rest, build);
        }

        let (rest, frequency) = split_frequency(text, rest)?;
        let (producer, channel) = split_channel(text, rest)?;
        if producer.is_empty() {
            return Err(malformed(text, "empty producer"));
        }
        Ok(Self {
            universe: None,
            producer: producer.to_string(),
            channel,
            frequency,
            build,
        })
    }

    /// `group:artifact[:packaging[:classifier]]:version` shorthand.
    fn parse_coordinate(text: &str, rest: &str, build: Option<String>) -> CaravelResult<Self> {
        if build.is_some() {
            return Err(malformed(text, "coordinate shorthand cannot carry `#build`"));
        }
        let segments: Vec<&str> = rest.split(':').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(malformed(text, "empty coordinate segment"));
        }
        let (producer, qualifier, version) = match segments.as_slice() {
            [g, a, v] => (format!("{g}:{a}"), None, *v),
            [g, a, p, v] => (format!("{g}:{a}"), Some((*p).to_string()), *v),
            [g, a, p, c, v] => (format!("{g}:{a}"), Some(format!("{p}:{c}")), *v),
            _ => return Err(malformed(text, "too many coordinate segments")),
        };
        Ok(Self {
            universe: Some(UniverseSpec::new(MAVEN_FACTORY, qualifier)),
            producer,
            channel: None,
            frequency: None,
            build: Some(version.to_string()),
        })
    }

    pub fn has_build(&self) -> bool {
        self.build.is_some()
    }

    /// Pin this location to a concrete build.
    pub fn with_build(&self, build: impl Into<String>) -> Fpid {
        Fpid {
            universe: self.universe.clone(),
            producer: self.producer.clone(),
            build: build.into(),
        }
    }

    /// Convert to an id if the build is already pinned.
    pub fn fpid(&self) -> Option<Fpid> {
        self.build.as_ref().map(|b| self.with_build(b.clone()))
    }

    /// Fill in the universe spec when absent.
    pub fn with_default_universe(&self, universe: &UniverseSpec) -> Self {
        let mut loc = self.clone();
        if loc.universe.is_none() {
            loc.universe = Some(universe.clone());
        }
        loc
    }

    /// The producer identity this location addresses, qualified by its
    /// universe. Two locations with equal keys compete for the same slot in
    /// a layout.
    pub fn producer_key(&self) -> String {
        match &self.universe {
            Some(u) => format!("{}@{}", self.producer, u),
            None => self.producer.clone(),
        }
    }

    fn is_maven_shorthand(&self) -> bool {
        self.universe
            .as_ref()
            .is_some_and(|u| u.factory == MAVEN_FACTORY)
            && self.producer.contains(':')
            && self.channel.is_none()
            && self.frequency.is_none()
            && self.build.is_some()
    }
}

fn split_frequency<'a>(text: &str, part: &'a str) -> CaravelResult<(&'a str, Option<String>)> {
    match part.split_once('/') {
        Some((rest, freq)) => {
            if freq.is_empty() {
                return Err(malformed(text, "empty frequency after `/`"));
            }
            Ok((rest, Some(freq.to_string())))
        }
        None => Ok((part, None)),
    }
}

fn split_channel<'a>(text: &str, part: &'a str) -> CaravelResult<(&'a str, Option<String>)> {
    match part.split_once(':') {
        Some((rest, channel)) => {
            if channel.is_empty() {
                return Err(malformed(text, "empty channel after `:`"));
            }
            Ok((rest, Some(channel.to_string())))
        }
        None => Ok((part, None)),
    }
}

impl fmt::Display for FeaturePackLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_maven_shorthand() {
            // Renders back to the coordinate shorthand it was parsed from.
            let universe = self.universe.as_ref().expect("maven shorthand has universe");
            write!(f, "{}", self.producer)?;
            if let Some(qualifier) = &universe.location {
                write!(f, ":{qualifier}")?;
            }
            return write!(f, ":{}", self.build.as_ref().expect("shorthand has build"));
        }
        f.write_str(&self.producer)?;
        if let Some(universe) = &self.universe {
            write!(f, "@{universe}")?;
        }
        if let Some(channel) = &self.channel {
            write!(f, ":{channel}")?;
        }
        if let Some(frequency) = &self.frequency {
            write!(f, "/{frequency}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "#{build}")?;
        }
        Ok(())
    }
}

/// A fully resolved feature pack identity: location with the build pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fpid {
    pub universe: Option<UniverseSpec>,
    pub producer: String,
    pub build: String,
}

impl Fpid {
    pub fn parse(text: &str) -> CaravelResult<Self> {
        let loc = FeaturePackLocation::parse(text)?;
        loc.fpid().ok_or_else(|| {
            CaravelError::MalformedLocation {
                text: text.to_string(),
                reason: "feature pack id requires a build".to_string(),
            }
            .into()
        })
    }

    /// The location form of this id.
    pub fn location(&self) -> FeaturePackLocation {
        FeaturePackLocation {
            universe: self.universe.clone(),
            producer: self.producer.clone(),
            channel: None,
            frequency: None,
            build: Some(self.build.clone()),
        }
    }

    pub fn producer_key(&self) -> String {
        self.location().producer_key()
    }
}

impl fmt::Display for Fpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.location().fmt(f)
    }
}

fn malformed(text: &str, reason: &str) -> miette::Report {
    CaravelError::MalformedLocation {
        text: text.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                <$ty>::parse(&text).map_err(|e| D::Error::custom(e.to_string()))
            }
        }
    };
}

string_serde!(UniverseSpec);
string_serde!(FeaturePackLocation);
string_serde!(Fpid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_producer_only() {
        let loc = FeaturePackLocation::parse("wings").unwrap();
        assert_eq!(loc.producer, "wings");
        assert!(loc.universe.is_none());
        assert!(loc.channel.is_none());
        assert!(loc.build.is_none());
    }

    #[test]
    fn parse_full_form() {
        let loc = FeaturePackLocation::parse("wings@registry(org.acme:universe):current/beta#1.0.0")
            .unwrap();
        assert_eq!(loc.producer, "wings");
        let universe = loc.universe.as_ref().unwrap();
        assert_eq!(universe.factory, "registry");
        assert_eq!(universe.location.as_deref(), Some("org.acme:universe"));
        assert_eq!(loc.channel.as_deref(), Some("current"));
        assert_eq!(loc.frequency.as_deref(), Some("beta"));
        assert_eq!(loc.build.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn parse_channel_and_build() {
        let loc = FeaturePackLocation::parse("wings:current#2.0.0").unwrap();
        assert_eq!(loc.channel.as_deref(), Some("current"));
        assert_eq!(loc.build.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn parse_frequency_without_channel() {
        let loc = FeaturePackLocation::parse("wings/snapshot").unwrap();
        assert!(loc.channel.is_none());
        assert_eq!(loc.frequency.as_deref(), Some("snapshot"));
    }

    #[test]
    fn parse_coordinate_shorthand() {
        let loc = FeaturePackLocation::parse("org.acme:wings-pack:1.0.0").unwrap();
        assert_eq!(loc.producer, "org.acme:wings-pack");
        assert_eq!(loc.universe.as_ref().unwrap().factory, MAVEN_FACTORY);
        assert_eq!(loc.build.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn parse_coordinate_with_packaging_and_classifier() {
        let loc = FeaturePackLocation::parse("org.acme:wings-pack:zip:dist:1.0.0").unwrap();
        assert_eq!(loc.producer, "org.acme:wings-pack");
        assert_eq!(
            loc.universe.as_ref().unwrap().location.as_deref(),
            Some("zip:dist")
        );
        assert_eq!(loc.build.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn malformed_locations() {
        assert!(FeaturePackLocation::parse("").is_err());
        assert!(FeaturePackLocation::parse("wings#").is_err());
        assert!(FeaturePackLocation::parse("wings:").is_err());
        assert!(FeaturePackLocation::parse("wings/").is_err());
        assert!(FeaturePackLocation::parse("@factory").is_err());
        assert!(FeaturePackLocation::parse("a:b:c:d:e:f").is_err());
        assert!(FeaturePackLocation::parse("wings@factory(loc:current").is_err());
    }

    #[test]
    fn display_round_trip() {
        for text in [
            "wings",
            "wings#1.0.0",
            "wings:current",
            "wings:current/beta#1.0.0",
            "wings@registry(org.acme:universe):current/beta#1.0.0",
            "wings/snapshot",
            "org.acme:wings-pack:1.0.0",
            "org.acme:wings-pack:zip:dist:1.0.0",
        ] {
            let loc = FeaturePackLocation::parse(text).unwrap();
            assert_eq!(loc.to_string(), text);
            assert_eq!(FeaturePackLocation::parse(&loc.to_string()).unwrap(), loc);
        }
    }

    #[test]
    fn fpid_requires_build() {
        assert!(Fpid::parse("wings").is_err());
        let fpid = Fpid::parse("wings#1.0.0").unwrap();
        assert_eq!(fpid.producer, "wings");
        assert_eq!(fpid.build, "1.0.0");
        assert_eq!(fpid.to_string(), "wings#1.0.0");
    }

    #[test]
    fn producer_key_includes_universe() {
        let a = FeaturePackLocation::parse("wings@registry(u)#1").unwrap();
        let b = FeaturePackLocation::parse("wings#1").unwrap();
        assert_ne!(a.producer_key(), b.producer_key());
        let b = b.with_default_universe(&UniverseSpec::parse("registry(u)").unwrap());
        assert_eq!(a.producer_key(), b.producer_key());
    }

    #[test]
    fn serde_as_string() {
        let fpid = Fpid::parse("wings#1.0.0").unwrap();
        let json = serde_json::to_string(&fpid).unwrap();
        assert_eq!(json, "\"wings#1.0.0\"");
        let back: Fpid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fpid);
    }
}
