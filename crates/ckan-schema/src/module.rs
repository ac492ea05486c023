//! The module descriptor and its JSON wire format.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MetadataError;
use crate::game_version::{GameVersion, GameVersionRange};
use crate::install::{InstallDescriptor, RawInstallDescriptor, one_or_many};
use crate::relationship::RelationshipDescriptor;
use crate::version::{ModuleVersion, Version};

/// Metadata spec version understood by this build.
pub const SUPPORTED_SPEC: SpecVersion = SpecVersion { major: 1, minor: 34 };

/// Version of the metadata format a document was written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpecVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
}

impl SpecVersion {
    /// Reads `spec_version`, which is either the integer `1` or a string like `v1.4`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Invalid`] for any other shape.
    pub fn from_value(value: &Value) -> Result<Self, MetadataError> {
        let invalid = || MetadataError::Invalid(format!("bad spec_version {value}"));
        match value {
            Value::Number(n) => {
                let major = n.as_u64().and_then(|m| u32::try_from(m).ok()).ok_or_else(invalid)?;
                Ok(Self { major, minor: 0 })
            }
            Value::String(s) => {
                let s = s.strip_prefix('v').unwrap_or(s);
                let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
                Ok(Self {
                    major: major.parse().map_err(|_| invalid())?,
                    minor: minor.parse().map_err(|_| invalid())?,
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for SpecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// Maturity of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseStatus {
    /// Ready for general use.
    #[default]
    Stable,
    /// Feature complete, still being tested.
    Testing,
    /// Work in progress.
    Development,
}

impl ReleaseStatus {
    /// Parses one of `stable`, `testing`, `development`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Invalid`] for any other value.
    pub fn parse(s: &str) -> Result<Self, MetadataError> {
        match s {
            "stable" => Ok(Self::Stable),
            "testing" => Ok(Self::Testing),
            "development" => Ok(Self::Development),
            other => Err(MetadataError::Invalid(format!("unknown release_status {other:?}"))),
        }
    }

    /// The wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Testing => "testing",
            Self::Development => "development",
        }
    }
}

/// A license identifier such as `GPL-3.0` or `CC-BY-SA-4.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct License(String);

impl License {
    /// Validates a license identifier: non-empty, no whitespace, restricted punctuation.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Invalid`] when the identifier does not qualify.
    pub fn parse(s: &str) -> Result<Self, MetadataError> {
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(MetadataError::Invalid(format!("bad license {s:?}")))
        }
    }

    /// The identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed module descriptor. Identity is `(identifier, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ModuleDocument", into = "ModuleDocument")]
pub struct CkanModule {
    /// Stable key shared by every release of the module.
    pub identifier: String,
    /// Human-readable name.
    pub name: Option<String>,
    /// One-line description.
    pub summary: Option<String>,
    /// Authors, in declaration order.
    pub authors: Vec<String>,
    /// Release version.
    pub version: Version,
    /// Metadata format version the document targets.
    pub spec_version: SpecVersion,
    /// Licenses the release is distributed under.
    pub license: Vec<License>,
    /// Maturity of the release.
    pub release_status: ReleaseStatus,
    /// Game versions the release supports.
    pub game_versions: GameVersionRange,
    /// Archive download URL.
    pub download: String,
    /// Archive size in bytes, when known.
    pub download_size: Option<u64>,
    /// Install stanzas; empty means the default stanza applies.
    pub install: Vec<InstallDescriptor>,
    /// Hard dependencies.
    pub depends: Vec<RelationshipDescriptor>,
    /// Soft dependencies installed by default.
    pub recommends: Vec<RelationshipDescriptor>,
    /// Soft dependencies installed on request.
    pub suggests: Vec<RelationshipDescriptor>,
    /// Modules that cannot be installed alongside this one.
    pub conflicts: Vec<RelationshipDescriptor>,
    /// Virtual identifiers this module also satisfies.
    pub provides: Vec<String>,
}

impl CkanModule {
    /// Parses a `.ckan` JSON document.
    ///
    /// Unknown fields are ignored. The `spec_version` check runs before the
    /// rest of the document is interpreted, so future documents report as
    /// unsupported rather than invalid.
    ///
    /// # Errors
    ///
    /// - [`MetadataError::Json`] if the text is not JSON.
    /// - [`MetadataError::Unsupported`] for a newer `spec_version`.
    /// - [`MetadataError::Invalid`] for any other rule violation.
    pub fn from_json(text: &str) -> Result<Self, MetadataError> {
        let value: Value = serde_json::from_str(text)?;
        if let Some(spec) = value.get("spec_version") {
            let spec = SpecVersion::from_value(spec)?;
            if spec > SUPPORTED_SPEC {
                return Err(MetadataError::Unsupported(spec.to_string()));
            }
        }
        let doc: ModuleDocument =
            serde_json::from_value(value).map_err(|e| MetadataError::Invalid(e.to_string()))?;
        Self::try_from(doc)
    }

    /// Serializes back to a `.ckan` JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, MetadataError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The stanzas to apply, substituting the default stanza when none are declared.
    pub fn install_stanzas(&self) -> Cow<'_, [InstallDescriptor]> {
        if self.install.is_empty() {
            Cow::Owned(vec![InstallDescriptor::default_for(&self.identifier)])
        } else {
            Cow::Borrowed(&self.install)
        }
    }

    /// File name used for this release's archive in the download cache.
    pub fn standard_name(&self) -> String {
        let raw = format!("{}-{}.zip", self.identifier, self.version);
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// This release's version as an installed-module version.
    pub fn module_version(&self) -> ModuleVersion {
        ModuleVersion::normal(self.version.clone())
    }

    /// True if this module is `identifier` or provides it.
    pub fn provides_identifier(&self, identifier: &str) -> bool {
        self.identifier == identifier || self.provides.iter().any(|p| p == identifier)
    }

    /// True if this module can satisfy `rel`, directly or through `provides`.
    pub fn satisfies(&self, rel: &RelationshipDescriptor) -> bool {
        if self.identifier == rel.name {
            return rel.version_within(&self.module_version());
        }
        self.provides.iter().any(|p| *p == rel.name)
    }

    /// True if one of this module's `conflicts` entries matches `other`.
    ///
    /// A module never conflicts with itself, even when it conflicts with
    /// something it provides.
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.identifier != other.identifier && self.conflicts.iter().any(|rel| other.satisfies(rel))
    }

    /// Whether the declared range contains `game` exactly.
    pub fn supports_game(&self, game: &GameVersion) -> bool {
        self.game_versions.contains(game)
    }
}

impl PartialEq for CkanModule {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.version == other.version
    }
}

impl Eq for CkanModule {}

impl fmt::Display for CkanModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.identifier, self.version)
    }
}

/// Wire shape of a `.ckan` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModuleDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spec_version: Option<Value>,
    identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    author: Vec<String>,
    version: String,
    #[serde(deserialize_with = "one_or_many")]
    license: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    release_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ksp_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ksp_version_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ksp_version_max: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    ksp_version_strict: bool,
    download: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    download_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    install: Vec<RawInstallDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends: Vec<RelationshipDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    recommends: Vec<RelationshipDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    suggests: Vec<RelationshipDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conflicts: Vec<RelationshipDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    provides: Vec<String>,
}

fn parse_game_version(field: &str, raw: Option<&str>) -> Result<Option<GameVersion>, MetadataError> {
    raw.map(|s| {
        GameVersion::parse(s).map_err(|e| MetadataError::Invalid(format!("{field}: {e}")))
    })
    .transpose()
}

impl TryFrom<ModuleDocument> for CkanModule {
    type Error = MetadataError;

    fn try_from(doc: ModuleDocument) -> Result<Self, Self::Error> {
        if doc.identifier.is_empty() {
            return Err(MetadataError::Invalid("empty identifier".into()));
        }
        let spec_version = match &doc.spec_version {
            Some(value) => SpecVersion::from_value(value)?,
            None => SpecVersion { major: 1, minor: 0 },
        };

        let exact = parse_game_version("ksp_version", doc.ksp_version.as_deref())?;
        let min = parse_game_version("ksp_version_min", doc.ksp_version_min.as_deref())?;
        let max = parse_game_version("ksp_version_max", doc.ksp_version_max.as_deref())?;
        let game_versions = match exact {
            Some(_) if min.is_some() || max.is_some() => {
                return Err(MetadataError::Invalid(format!(
                    "{}: ksp_version cannot be combined with ksp_version_min/max",
                    doc.identifier
                )));
            }
            Some(v) if v.is_any() => GameVersionRange::unbounded(),
            Some(v) => GameVersionRange::exact(v),
            None => GameVersionRange::between(min, max),
        }
        .with_strict(doc.ksp_version_strict);

        let license = doc
            .license
            .iter()
            .map(|l| License::parse(l))
            .collect::<Result<Vec<_>, _>>()?;
        if license.is_empty() {
            return Err(MetadataError::Invalid(format!("{}: no license", doc.identifier)));
        }

        let release_status = doc
            .release_status
            .as_deref()
            .map(ReleaseStatus::parse)
            .transpose()?
            .unwrap_or_default();

        let install = doc
            .install
            .into_iter()
            .map(InstallDescriptor::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: Version::parse(&doc.version)?,
            identifier: doc.identifier,
            name: doc.name,
            summary: doc.summary,
            authors: doc.author,
            spec_version,
            license,
            release_status,
            game_versions,
            download: doc.download,
            download_size: doc.download_size,
            install,
            depends: doc.depends,
            recommends: doc.recommends,
            suggests: doc.suggests,
            conflicts: doc.conflicts,
            provides: doc.provides,
        })
    }
}

impl From<CkanModule> for ModuleDocument {
    fn from(module: CkanModule) -> Self {
        let range = module.game_versions;
        let (ksp_version, ksp_version_min, ksp_version_max) = if range.is_exact() {
            (range.min().map(|v| v.to_string()), None, None)
        } else {
            (
                None,
                range.min().map(|v| v.to_string()),
                range.max().map(|v| v.to_string()),
            )
        };
        Self {
            spec_version: Some(Value::String(module.spec_version.to_string())),
            identifier: module.identifier,
            name: module.name,
            summary: module.summary,
            author: module.authors,
            version: module.version.to_string(),
            license: module.license.into_iter().map(|l| l.0).collect(),
            release_status: Some(module.release_status.as_str().to_string()),
            ksp_version,
            ksp_version_min,
            ksp_version_max,
            ksp_version_strict: range.is_strict(),
            download: module.download,
            download_size: module.download_size,
            install: module.install.into_iter().map(RawInstallDescriptor::from).collect(),
            depends: module.depends,
            recommends: module.recommends,
            suggests: module.suggests,
            conflicts: module.conflicts,
            provides: module.provides,
        }
    }
}
