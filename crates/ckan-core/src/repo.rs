//! Repository metadata sync.
//!
//! Each repository is an archive (tar.gz, tar or zip) of `.ckan` documents.
//! A sync downloads every repository, loads the documents into the registry's
//! available set and reports installed modules whose install stanzas changed
//! underneath them.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use ckan_schema::{CkanModule, GameVersion, METADATA_SUFFIX, MetadataError, Version};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::comparator::GameComparator;
use crate::io::archive::{self, ArchiveFormat};
use crate::io::download::{DownloadError, DownloadTarget, NetAsyncDownloader};
use crate::registry::{Registry, Repository};
use crate::reporter::Reporter;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("{repository}: download produced no file")]
    NothingDownloaded { repository: String },

    #[error("{repository}: not a tar or zip archive")]
    UnknownFormat { repository: String },

    #[error("{repository}: {entry}: {source}")]
    Metadata {
        repository: String,
        entry: String,
        #[source]
        source: MetadataError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of [`RepoUpdater::update`].
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Releases in the available set afterwards.
    pub available_count: usize,
    /// Installed modules whose install stanzas changed; candidates for reinstall.
    pub metadata_changes: Vec<String>,
    /// Repositories that kept their previous contents, with the reason.
    pub failed_repositories: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct RepoUpdater<'a> {
    downloader: &'a NetAsyncDownloader,
    reporter: Arc<dyn Reporter>,
    comparator: Arc<dyn GameComparator>,
}

impl<'a> RepoUpdater<'a> {
    pub fn new(
        downloader: &'a NetAsyncDownloader,
        reporter: Arc<dyn Reporter>,
        comparator: Arc<dyn GameComparator>,
    ) -> Self {
        Self {
            downloader,
            reporter,
            comparator,
        }
    }

    /// Refreshes the available set from `repositories`, highest priority first.
    ///
    /// With `clear`, the available set is rebuilt from scratch; a repository
    /// that fails keeps whatever it provided before. When two repositories
    /// carry the same release, the higher-priority one wins.
    ///
    /// # Errors
    ///
    /// Only cancellation aborts the update, leaving the registry untouched.
    /// Every other failure is per repository and lands in the report.
    pub fn update(
        &self,
        registry: &mut Registry,
        game: &GameVersion,
        repositories: &[Repository],
        clear: bool,
    ) -> Result<SyncReport, RepoError> {
        let before = registry.clone();
        let mut repos: Vec<&Repository> = repositories.iter().collect();
        repos.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        if clear {
            registry.clear_available();
        }

        let mut report = SyncReport::default();
        let mut claimed: HashSet<(String, Version)> = HashSet::new();
        for repo in repos {
            self.reporter.info(&format!("Updating {} ({})", repo.name, repo.uri));
            match self.fetch(repo) {
                Ok(modules) => {
                    info!(repository = %repo.name, modules = modules.len(), "Loaded repository");
                    for module in modules {
                        let key = (module.identifier.clone(), module.version.clone());
                        if claimed.insert(key) {
                            registry.add_available_from(module, &repo.name);
                        }
                    }
                }
                Err(RepoError::Download(DownloadError::UserCancelled)) => {
                    *registry = before;
                    return Err(DownloadError::UserCancelled.into());
                }
                Err(e) => {
                    warn!(repository = %repo.name, error = %e, "Repository update failed");
                    self.reporter
                        .warning(&format!("Could not update {}: {e}", repo.name));
                    report.failed_repositories.push((repo.name.clone(), e.to_string()));
                    if clear {
                        restore_repository(registry, &before, &repo.name, &mut claimed);
                    }
                }
            }
        }

        report.available_count = registry.available_entries().count();
        report.metadata_changes = metadata_changes(&before, registry);

        let compatible = registry.available(game, self.comparator.as_ref()).len();
        info!(
            available = report.available_count,
            compatible,
            game = %game,
            "Repository update finished"
        );
        if !report.metadata_changes.is_empty() {
            self.reporter.info(&format!(
                "Install instructions changed for installed modules: {}",
                report.metadata_changes.join(", ")
            ));
        }
        Ok(report)
    }

    fn fetch(&self, repo: &Repository) -> Result<Vec<CkanModule>, RepoError> {
        if let Some(local) = repo.uri.strip_prefix("file://") {
            return load_archive(&repo.name, Path::new(local));
        }

        let paths = self
            .downloader
            .download_and_wait(vec![DownloadTarget::new(&repo.uri, None)])?;
        let downloaded: Vec<TempPath> = paths.into_iter().map(TempPath::from_path).collect();
        let Some(path) = downloaded.first() else {
            return Err(RepoError::NothingDownloaded {
                repository: repo.name.clone(),
            });
        };
        load_archive(&repo.name, path)
    }
}

/// Parses every metadata document in a repository archive.
///
/// Soft metadata errors skip the entry; anything else fails the repository.
pub fn load_archive(repository: &str, path: &Path) -> Result<Vec<CkanModule>, RepoError> {
    let format = archive::detect(path)?;
    if matches!(format, ArchiveFormat::Gzip | ArchiveFormat::Unknown) {
        return Err(RepoError::UnknownFormat {
            repository: repository.to_string(),
        });
    }

    let mut modules = Vec::new();
    for (entry, bytes) in archive::read_entries_with_suffix(path, format, METADATA_SUFFIX)? {
        let parsed = std::str::from_utf8(&bytes)
            .map_err(|e| MetadataError::Invalid(format!("not UTF-8: {e}")))
            .and_then(CkanModule::from_json);
        match parsed {
            Ok(module) => modules.push(module),
            Err(e) if e.is_soft() => {
                warn!(repository, entry = %entry, error = %e, "Skipping metadata entry");
            }
            Err(source) => {
                return Err(RepoError::Metadata {
                    repository: repository.to_string(),
                    entry,
                    source,
                });
            }
        }
    }
    debug!(repository, count = modules.len(), "Parsed repository archive");
    Ok(modules)
}

fn restore_repository(
    registry: &mut Registry,
    before: &Registry,
    repository: &str,
    claimed: &mut HashSet<(String, Version)>,
) {
    let previous = before
        .available_entries()
        .filter(|a| a.repository.as_deref() == Some(repository));
    for entry in previous {
        let key = (entry.module.identifier.clone(), entry.module.version.clone());
        if claimed.insert(key) {
            registry.add_available_from(entry.module.clone(), repository);
        }
    }
}

/// Installed modules whose install stanzas at the installed version differ
/// between `before` and `after`.
///
/// Releases missing from either snapshot are skipped.
pub fn metadata_changes(before: &Registry, after: &Registry) -> Vec<String> {
    let mut changed = Vec::new();
    for (id, entry) in after.installed_modules() {
        let Some(version) = entry.version.as_normal() else {
            continue;
        };
        let Some(new) = after.available_module(id, version) else {
            continue;
        };
        let Some(old) = before.available_module(id, version) else {
            continue;
        };
        if old.install_stanzas() != new.install_stanzas() {
            debug!(identifier = id, %version, "Install stanzas changed");
            changed.push(id.to_string());
        }
    }
    changed
}
