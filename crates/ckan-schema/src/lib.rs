//! Metadata model for ckan: versions, game-version ranges, relationships,
//! install stanzas and the module descriptor parsed from `.ckan` documents.

/// Errors raised while reading metadata.
pub mod error;
pub mod game_version;
pub mod install;
pub mod module;
/// Relationships between modules (`depends`, `conflicts`, ...).
pub mod relationship;
pub mod version;

// Re-exports
pub use error::MetadataError;
pub use game_version::{GameVersion, GameVersionRange};
pub use install::{InstallDescriptor, InstallLocation, InstallSource, InstallTarget};
pub use module::{CkanModule, License, ReleaseStatus, SUPPORTED_SPEC, SpecVersion};
pub use relationship::RelationshipDescriptor;
pub use version::{ModuleVersion, Version, VersionError};

/// Suffix of metadata documents inside repository archives.
pub const METADATA_SUFFIX: &str = ".ckan";
