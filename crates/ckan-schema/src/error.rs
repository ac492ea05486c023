use thiserror::Error;

use crate::version::VersionError;

/// Errors raised while reading a module descriptor.
///
/// [`Invalid`](Self::Invalid) and [`Unsupported`](Self::Unsupported) are the
/// soft classes: a repository scan skips such entries and keeps going.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// The document is not JSON at all.
    #[error("Unreadable metadata: {0}")]
    Json(#[from] serde_json::Error),

    /// The document is JSON but violates the metadata rules.
    #[error("Invalid metadata: {0}")]
    Invalid(String),

    /// The document declares a newer metadata spec than this build understands.
    #[error("Unsupported metadata spec version {0}")]
    Unsupported(String),
}

impl MetadataError {
    /// True for errors a scanning loop may skip.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::Unsupported(_))
    }
}

impl From<VersionError> for MetadataError {
    fn from(err: VersionError) -> Self {
        Self::Invalid(err.to_string())
    }
}
