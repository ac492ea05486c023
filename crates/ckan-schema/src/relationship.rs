//! Relationship descriptors.
//!
//! `depends`, `recommends`, `suggests` and `conflicts` all hold
//! lists of these. A descriptor names an identifier and optionally pins an
//! exact version or bounds it with `min_version`/`max_version`.

use serde::{Deserialize, Serialize};

use crate::version::{ModuleVersion, Version};

/// A reference from one module to another identifier, optionally bounded by version.
///
/// Used for `depends`, `recommends`, `suggests` and `conflicts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    /// Identifier (real or provided) the relationship points at.
    pub name: String,

    /// Exact version required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    /// Inclusive lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<Version>,

    /// Inclusive upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<Version>,
}

impl RelationshipDescriptor {
    /// An unversioned relationship.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            min_version: None,
            max_version: None,
        }
    }

    /// Restricts the relationship to an inclusive range.
    pub fn between(mut self, min: Option<Version>, max: Option<Version>) -> Self {
        self.min_version = min;
        self.max_version = max;
        self
    }

    /// Restricts the relationship to one exact version.
    pub fn exactly(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// True if any version bound is present.
    pub fn is_versioned(&self) -> bool {
        self.version.is_some() || self.min_version.is_some() || self.max_version.is_some()
    }

    /// Whether a module at `version` satisfies the bounds.
    ///
    /// Autodetected and virtual versions always do.
    pub fn version_within(&self, version: &ModuleVersion) -> bool {
        match (&self.version, version) {
            (Some(exact), ModuleVersion::Normal { version }) => exact == version,
            (Some(_), ModuleVersion::Autodetected | ModuleVersion::Virtual { .. }) => true,
            (None, version) => {
                version.within(self.min_version.as_ref(), self.max_version.as_ref())
            }
        }
    }

    /// Whether the identifier `name` at `version` satisfies this relationship.
    pub fn satisfied_by(&self, name: &str, version: &ModuleVersion) -> bool {
        self.name == name && self.version_within(version)
    }
}

impl std::fmt::Display for RelationshipDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if let Some(version) = &self.version {
            return write!(f, " {version}");
        }
        match (&self.min_version, &self.max_version) {
            (Some(min), Some(max)) => write!(f, " {min}-{max}"),
            (Some(min), None) => write!(f, " {min}+"),
            (None, Some(max)) => write!(f, " <= {max}"),
            (None, None) => Ok(()),
        }
    }
}
