//! Declarative capability requirements derived from configuration.

use std::collections::BTreeMap;

#[cfg(feature = "config")]
use clap::Args;
use semver::Version;
use serde::{Deserialize, Serialize};

use super::{CapabilityName, CapabilitySet, parse_version};
use crate::{Error, Result};

/// Minimum versions required by a deployment, keyed by capability.
///
/// Built once from configuration and immutable for the life of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementSet {
    inner: BTreeMap<CapabilityName, Version>,
}

/// Why a requirement is not satisfied by the probed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GapKind {
    /// The capability is not active at all.
    Missing,
    /// The capability is active with an older version.
    UnderVersioned { found: Version },
}

/// A single unsatisfied requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementGap {
    pub capability: CapabilityName,
    pub required: Version,
    pub gap: GapKind,
}

impl RequirementSet {
    /// Creates an empty requirement set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a requirement, keeping the stricter version if already present.
    pub fn with(mut self, capability: impl Into<CapabilityName>, minimum: Version) -> Self {
        self.require(capability, minimum);
        self
    }

    /// Adds a requirement in place, keeping the stricter version if already present.
    pub fn require(&mut self, capability: impl Into<CapabilityName>, minimum: Version) {
        let current = self
            .inner
            .entry(capability.into())
            .or_insert_with(|| minimum.clone());
        if minimum > *current {
            *current = minimum;
        }
    }

    /// Returns the required minimum version of a capability.
    #[inline]
    pub fn minimum(&self, capability: &CapabilityName) -> Option<&Version> {
        self.inner.get(capability)
    }

    /// Returns whether the capability is required.
    #[inline]
    pub fn contains(&self, capability: &CapabilityName) -> bool {
        self.inner.contains_key(capability)
    }

    /// Iterates over requirements in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&CapabilityName, &Version)> {
        self.inner.iter()
    }

    /// Returns the number of required capabilities.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether nothing is required.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Compares the requirements against probed capabilities.
    pub fn diff(&self, capabilities: &CapabilitySet) -> Vec<RequirementGap> {
        self.inner
            .iter()
            .filter_map(|(name, required)| {
                let gap = match capabilities.get(name) {
                    Some(found) if found.satisfies(required) => return None,
                    Some(found) if found.active => GapKind::UnderVersioned {
                        found: found.version.clone(),
                    },
                    _ => GapKind::Missing,
                };

                Some(RequirementGap {
                    capability: name.clone(),
                    required: required.clone(),
                    gap,
                })
            })
            .collect()
    }

    /// Returns whether every requirement is satisfied.
    pub fn is_satisfied_by(&self, capabilities: &CapabilitySet) -> bool {
        self.diff(capabilities).is_empty()
    }
}

impl FromIterator<(CapabilityName, Version)> for RequirementSet {
    fn from_iter<I: IntoIterator<Item = (CapabilityName, Version)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, version) in iter {
            set.require(name, version);
        }
        set
    }
}

/// Extension toggles read from the environment or command line.
///
/// Each flag enables one optional capability with a configurable minimum
/// version. Values are read once at startup and turned into a
/// [`RequirementSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
pub struct ExtensionFlags {
    /// Enable PostGIS spatial types and the spatial-aware backend
    #[cfg_attr(feature = "config", arg(long = "enable-gis", env = "ENABLE_GIS"))]
    #[serde(default)]
    pub enable_gis: bool,

    /// Minimum PostGIS version
    #[cfg_attr(
        feature = "config",
        arg(long = "gis-min-version", env = "GIS_MIN_VERSION", default_value = "3.0.0")
    )]
    #[serde(default = "default_gis_version")]
    pub gis_min_version: String,

    /// Enable TimescaleDB hypertables
    #[cfg_attr(
        feature = "config",
        arg(long = "enable-timescale", env = "ENABLE_TIMESCALE")
    )]
    #[serde(default)]
    pub enable_timescale: bool,

    /// Minimum TimescaleDB version
    #[cfg_attr(
        feature = "config",
        arg(
            long = "timescale-min-version",
            env = "TIMESCALE_MIN_VERSION",
            default_value = "2.0.0"
        )
    )]
    #[serde(default = "default_timescale_version")]
    pub timescale_min_version: String,

    /// Enable pgvector columns and indexes
    #[cfg_attr(feature = "config", arg(long = "enable-vector", env = "ENABLE_VECTOR"))]
    #[serde(default)]
    pub enable_vector: bool,

    /// Minimum pgvector version (HNSW indexes need 0.5.0)
    #[cfg_attr(
        feature = "config",
        arg(
            long = "vector-min-version",
            env = "VECTOR_MIN_VERSION",
            default_value = "0.5.0"
        )
    )]
    #[serde(default = "default_vector_version")]
    pub vector_min_version: String,
}

fn default_gis_version() -> String {
    "3.0.0".to_owned()
}

fn default_timescale_version() -> String {
    "2.0.0".to_owned()
}

fn default_vector_version() -> String {
    "0.5.0".to_owned()
}

impl Default for ExtensionFlags {
    fn default() -> Self {
        Self {
            enable_gis: false,
            gis_min_version: default_gis_version(),
            enable_timescale: false,
            timescale_min_version: default_timescale_version(),
            enable_vector: false,
            vector_min_version: default_vector_version(),
        }
    }
}

impl ExtensionFlags {
    /// Enables every optional capability with default minimum versions.
    pub fn all() -> Self {
        Self {
            enable_gis: true,
            enable_timescale: true,
            enable_vector: true,
            ..Self::default()
        }
    }

    /// Builds the requirement set for the enabled flags.
    ///
    /// Minimum versions are read as leniently as probed ones, so `3.0` means
    /// `3.0.0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a minimum version does not parse.
    pub fn requirements(&self) -> Result<RequirementSet> {
        let toggles = [
            (self.enable_gis, CapabilityName::spatial(), &self.gis_min_version),
            (
                self.enable_timescale,
                CapabilityName::time_series(),
                &self.timescale_min_version,
            ),
            (self.enable_vector, CapabilityName::vector(), &self.vector_min_version),
        ];

        let mut set = RequirementSet::new();
        for (enabled, name, raw) in toggles {
            if !enabled {
                continue;
            }

            let minimum = parse_version(raw).map_err(|_| {
                Error::Config(format!("invalid minimum version '{raw}' for {name}"))
            })?;
            set.require(name, minimum);
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    #[test]
    fn diff_reports_missing_and_old() {
        let requirements = RequirementSet::new()
            .with(CapabilityName::spatial(), Version::new(3, 0, 0))
            .with(CapabilityName::vector(), Version::new(0, 5, 0))
            .with(CapabilityName::time_series(), Version::new(2, 0, 0));

        let probed: CapabilitySet = [
            Capability::active("postgis", Version::new(3, 4, 2)),
            Capability::active("vector", Version::new(0, 4, 4)),
        ]
        .into_iter()
        .collect();

        let gaps = requirements.diff(&probed);
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].capability, CapabilityName::time_series());
        assert_eq!(gaps[0].gap, GapKind::Missing);
        assert_eq!(gaps[1].capability, CapabilityName::vector());
        assert_eq!(
            gaps[1].gap,
            GapKind::UnderVersioned {
                found: Version::new(0, 4, 4)
            }
        );
    }

    #[test]
    fn require_keeps_stricter_version() {
        let set = RequirementSet::new()
            .with("vector", Version::new(0, 7, 0))
            .with("vector", Version::new(0, 5, 0));
        assert_eq!(set.minimum(&"vector".into()), Some(&Version::new(0, 7, 0)));
    }

    #[test]
    fn flags_build_requirements() {
        let flags = ExtensionFlags {
            enable_gis: true,
            enable_vector: true,
            ..ExtensionFlags::default()
        };

        let set = flags.requirements().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.minimum(&CapabilityName::spatial()), Some(&Version::new(3, 0, 0)));
        assert!(!set.contains(&CapabilityName::time_series()));
    }

    #[test]
    fn flags_accept_short_versions() {
        let flags = ExtensionFlags {
            enable_gis: true,
            gis_min_version: "3.0".into(),
            enable_vector: true,
            vector_min_version: " 1 ".into(),
            ..ExtensionFlags::default()
        };

        let set = flags.requirements().unwrap();
        assert_eq!(set.minimum(&CapabilityName::spatial()), Some(&Version::new(3, 0, 0)));
        assert_eq!(set.minimum(&CapabilityName::vector()), Some(&Version::new(1, 0, 0)));
    }

    #[test]
    fn flags_reject_bad_versions() {
        let flags = ExtensionFlags {
            enable_timescale: true,
            timescale_min_version: "two".into(),
            ..ExtensionFlags::default()
        };
        assert!(matches!(flags.requirements(), Err(Error::Config(_))));
    }

    #[test]
    fn disabled_flags_require_nothing() {
        assert!(ExtensionFlags::default().requirements().unwrap().is_empty());
        assert_eq!(ExtensionFlags::all().requirements().unwrap().len(), 3);
    }
}
