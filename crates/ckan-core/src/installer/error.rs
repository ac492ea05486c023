//! Domain-specific errors for install and removal

use thiserror::Error;

use crate::cache::CacheError;
use crate::io::download::DownloadError;
use crate::registry::RegistryError;
use crate::resolver::ResolveError;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Module {0} is not installed")]
    ModuleNotInstalled(String),

    #[error("{identifier}: file not found in archive: {detail}")]
    FileNotFound { identifier: String, detail: String },

    #[error("{identifier}: bad install location {path}")]
    BadInstallLocation { identifier: String, path: String },

    #[error("{identifier}: {path} already exists{}", .owner.as_ref().map(|o| format!(" (owned by {o})")).unwrap_or_default())]
    FileExists {
        identifier: String,
        path: String,
        owner: Option<String>,
    },

    #[error("Download failed: {0}")]
    DownloadFailed(#[from] DownloadError),

    #[error("Cached archive for {url} is corrupt")]
    CorruptArchive { url: String },

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl InstallError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }
}
