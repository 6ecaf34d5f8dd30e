//! Database capabilities (optional extensions) and their discovered state.
//!
//! A [`Capability`] is a named, versioned optional feature of the database such
//! as spatial types, time partitioning or vector indexing. Probes only ever
//! return active capabilities: absence from a [`CapabilitySet`] means inactive.

mod backend;
mod requirement;

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

pub use backend::{BackendSelection, select_backend};
use derive_more::{Deref, Display};
pub use requirement::{ExtensionFlags, GapKind, RequirementGap, RequirementSet};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifier of a capability, equal to the extension name in the database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize, Deref, Display)]
#[serde(transparent)]
pub struct CapabilityName(String);

impl CapabilityName {
    /// Extension name of the spatial capability.
    pub const SPATIAL: &'static str = "postgis";
    /// Extension name of the time-series capability.
    pub const TIME_SERIES: &'static str = "timescaledb";
    /// Extension name of the vector capability.
    pub const VECTOR: &'static str = "vector";

    /// Creates a capability name, trimming surrounding whitespace.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_owned())
    }

    /// Spatial types and functions (PostGIS).
    pub fn spatial() -> Self {
        Self::new(Self::SPATIAL)
    }

    /// Time partitioned tables (TimescaleDB).
    pub fn time_series() -> Self {
        Self::new(Self::TIME_SERIES)
    }

    /// Vector columns and approximate nearest neighbour indexes (pgvector).
    pub fn vector() -> Self {
        Self::new(Self::VECTOR)
    }

    /// Returns the name as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CapabilityName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CapabilityName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for CapabilityName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A capability together with its discovered version and activation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Extension name.
    pub name: CapabilityName,
    /// Installed extension version.
    pub version: Version,
    /// Whether the capability is usable by its dependents.
    pub active: bool,
}

impl Capability {
    /// Creates an active capability, as returned by a probe.
    pub fn active(name: impl Into<CapabilityName>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            active: true,
        }
    }

    /// Returns whether this capability is active and at least `minimum`.
    #[inline]
    pub fn satisfies(&self, minimum: &Version) -> bool {
        self.active && &self.version >= minimum
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)?;
        if !self.active {
            f.write_str(" (inactive)")?;
        }
        Ok(())
    }
}

/// Set of capabilities keyed by name.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    inner: BTreeMap<CapabilityName, Capability>,
}

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a capability.
    pub fn insert(&mut self, capability: Capability) {
        self.inner.insert(capability.name.clone(), capability);
    }

    /// Removes a capability, returning it if present.
    pub fn remove(&mut self, name: &CapabilityName) -> Option<Capability> {
        self.inner.remove(name)
    }

    /// Returns the capability with the given name.
    #[inline]
    pub fn get(&self, name: &CapabilityName) -> Option<&Capability> {
        self.inner.get(name)
    }

    /// Returns whether the named capability is present and active.
    #[inline]
    pub fn is_active(&self, name: &CapabilityName) -> bool {
        self.get(name).is_some_and(|c| c.active)
    }

    /// Returns the names among `names` that are not active in this set.
    pub fn inactive_of<'a>(
        &self,
        names: impl IntoIterator<Item = &'a CapabilityName>,
    ) -> Vec<CapabilityName> {
        names
            .into_iter()
            .filter(|name| !self.is_active(name))
            .cloned()
            .collect()
    }

    /// Iterates over capabilities in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.inner.values()
    }

    /// Returns the number of capabilities.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::new();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl IntoIterator for CapabilitySet {
    type IntoIter = btree_map::IntoValues<CapabilityName, Capability>;
    type Item = Capability;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_values()
    }
}

/// Parses an extension version string as reported by the database.
///
/// Extension versions are not strict semantic versions: `"1.0"`, `"3.5.0dev"`
/// and `"2.14.2"` all occur. Leading numeric components are kept and missing
/// ones padded with zero. A version with no leading number is rejected with
/// [`Error::ProbeParse`].
pub fn parse_version(raw: &str) -> Result<Version> {
    let raw = raw.trim();
    if let Ok(version) = Version::parse(raw) {
        return Ok(version);
    }

    let mut parts = [0u64; 3];
    let mut seen = 0;
    for (slot, component) in parts.iter_mut().zip(raw.split('.')) {
        let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            break;
        }

        *slot = digits
            .parse()
            .map_err(|_| Error::ProbeParse(format!("version component out of range in '{raw}'")))?;
        seen += 1;

        if digits.len() != component.len() {
            break;
        }
    }

    if seen == 0 {
        return Err(Error::ProbeParse(format!(
            "unrecognized extension version '{raw}'"
        )));
    }

    Ok(Version::new(parts[0], parts[1], parts[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lenient_versions() {
        assert_eq!(parse_version("3.4.2").unwrap(), Version::new(3, 4, 2));
        assert_eq!(parse_version("1.0").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("0.8").unwrap(), Version::new(0, 8, 0));
        assert_eq!(parse_version("3.5.0dev").unwrap(), Version::new(3, 5, 0));
        assert_eq!(parse_version("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(parse_version(" 2.14.2 ").unwrap(), Version::new(2, 14, 2));
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = parse_version("unknown").unwrap_err();
        assert!(matches!(err, Error::ProbeParse(_)));
        assert!(parse_version("").is_err());
    }

    #[test]
    fn capability_set_activity() {
        let set: CapabilitySet = [Capability::active("vector", Version::new(0, 8, 0))]
            .into_iter()
            .collect();

        assert!(set.is_active(&CapabilityName::vector()));
        assert!(!set.is_active(&CapabilityName::spatial()));

        let wanted = [CapabilityName::vector(), CapabilityName::time_series()];
        assert_eq!(set.inactive_of(&wanted), vec![CapabilityName::time_series()]);
    }

    #[test]
    fn satisfies_checks_version_and_activity() {
        let mut capability = Capability::active("postgis", Version::new(3, 4, 0));
        assert!(capability.satisfies(&Version::new(3, 0, 0)));
        assert!(!capability.satisfies(&Version::new(3, 5, 0)));

        capability.active = false;
        assert!(!capability.satisfies(&Version::new(3, 0, 0)));
    }
}
