//! Data-access backend selection.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use super::{CapabilityName, RequirementSet};

/// Data-access mode the application layer must use.
///
/// Derived once per process from the [`RequirementSet`] and passed explicitly
/// to every consumer, so nothing downstream needs to consult the environment or
/// the database again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, Display, EnumString, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackendSelection {
    /// Plain PostgreSQL backend.
    #[default]
    Standard,
    /// Spatial-aware backend with geometry and geography support.
    SpatialAware,
}

impl BackendSelection {
    /// Returns whether geometry types are available to the application.
    #[inline]
    pub fn is_spatial(self) -> bool {
        matches!(self, Self::SpatialAware)
    }

    /// Returns the stable string form, e.g. `"spatial-aware"`.
    #[inline]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Maps a requirement set to the backend the application must use.
///
/// Pure and deterministic: equal requirement sets always yield equal selections.
pub fn select_backend(requirements: &RequirementSet) -> BackendSelection {
    if requirements.contains(&CapabilityName::spatial()) {
        BackendSelection::SpatialAware
    } else {
        BackendSelection::Standard
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;

    #[test]
    fn spatial_requirement_selects_spatial_backend() {
        let requirements = RequirementSet::new().with("postgis", Version::new(3, 0, 0));
        assert_eq!(select_backend(&requirements), BackendSelection::SpatialAware);
        assert_eq!(select_backend(&requirements).as_str(), "spatial-aware");
    }

    #[test]
    fn other_requirements_select_standard() {
        let requirements = RequirementSet::new()
            .with("vector", Version::new(0, 5, 0))
            .with("timescaledb", Version::new(2, 0, 0));
        assert_eq!(select_backend(&requirements), BackendSelection::Standard);
        assert_eq!(select_backend(&RequirementSet::new()), BackendSelection::Standard);
    }

    #[test]
    fn selection_is_deterministic() {
        let a = RequirementSet::new().with("postgis", Version::new(3, 0, 0));
        let b = a.clone();
        assert_eq!(select_backend(&a), select_backend(&b));
        assert_eq!("standard".parse::<BackendSelection>().unwrap(), BackendSelection::Standard);
    }
}
