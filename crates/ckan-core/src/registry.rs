//! Installed and available modules plus the configured repositories.
//!
//! The registry never saves itself. Callers batch their mutations and then
//! call [`Registry::save`], which replaces the snapshot on disk atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ckan_schema::{CkanModule, GameVersion, ModuleVersion, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::comparator::GameComparator;

/// Repository added to every fresh registry.
pub const DEFAULT_REPOSITORY_NAME: &str = "default";
/// Metadata archive the default repository points at.
pub const DEFAULT_REPOSITORY_URI: &str =
    "https://github.com/KSP-CKAN/CKAN-meta/archive/master.tar.gz";

/// Registry lookup, repository bookkeeping and persistence failures.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Nothing by that identifier is installed.
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Repository '{0}' already exists")]
    DuplicateRepository(String),

    #[error("Unknown repository '{0}'")]
    UnknownRepository(String),

    #[error("Registry serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A metadata source. Lower priority values win ties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Unique key within the registry.
    pub name: String,
    /// `http(s)://` URL or `file://` path of the metadata archive.
    pub uri: String,
    #[serde(default)]
    pub priority: i32,
}

impl Repository {
    /// Creates a repository entry.
    pub fn new(name: impl Into<String>, uri: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            priority,
        }
    }
}

/// An entry in the installed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledModule {
    pub version: ModuleVersion,
    /// Metadata the module was installed from; absent for autodetected entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<CkanModule>,
    /// Files owned by the module, relative to the game directory.
    #[serde(default)]
    pub files: BTreeSet<String>,
    /// Directories the install created, relative to the game directory.
    #[serde(default)]
    pub directories: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_time: Option<DateTime<Utc>>,
}

/// A known release plus the repository it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableModule {
    pub module: CkanModule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// Persistent record of what is available and what is installed.
///
/// Saved as a single JSON document under the game's CKAN directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    installed: BTreeMap<String, InstalledModule>,
    #[serde(default)]
    available: BTreeMap<String, BTreeMap<Version, AvailableModule>>,
    #[serde(default)]
    repositories: BTreeMap<String, Repository>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.repositories.insert(
            DEFAULT_REPOSITORY_NAME.to_string(),
            Repository::new(DEFAULT_REPOSITORY_NAME, DEFAULT_REPOSITORY_URI, 0),
        );
        registry
    }
}

impl Registry {
    /// A registry with no repositories configured.
    pub fn empty() -> Self {
        Self {
            installed: BTreeMap::new(),
            available: BTreeMap::new(),
            repositories: BTreeMap::new(),
        }
    }

    /// Loads a registry snapshot, or a fresh default registry if `path` does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        if !path.exists() {
            info!(path = %path.display(), "No registry found, starting fresh");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes the snapshot to `path` via a temp file in the same directory and a rename.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "Registry saved");
        Ok(())
    }

    // ---- Available set -------------------------------------------------

    /// Inserts or replaces the release keyed by `(identifier, version)`.
    pub fn add_available(&mut self, module: CkanModule) {
        self.insert_available(module, None);
    }

    /// As [`add_available`](Self::add_available), remembering the originating repository.
    pub fn add_available_from(&mut self, module: CkanModule, repository: &str) {
        self.insert_available(module, Some(repository.to_string()));
    }

    fn insert_available(&mut self, module: CkanModule, repository: Option<String>) {
        self.available
            .entry(module.identifier.clone())
            .or_default()
            .insert(module.version.clone(), AvailableModule { module, repository });
    }

    pub fn remove_available(&mut self, module: &CkanModule) {
        if let Some(versions) = self.available.get_mut(&module.identifier) {
            versions.remove(&module.version);
            if versions.is_empty() {
                self.available.remove(&module.identifier);
            }
        }
    }

    pub fn clear_available(&mut self) {
        self.available.clear();
    }

    /// Every known release of `identifier`, oldest first.
    pub fn all_available(&self, identifier: &str) -> Vec<&CkanModule> {
        self.available
            .get(identifier)
            .map(|versions| versions.values().map(|a| &a.module).collect())
            .unwrap_or_default()
    }

    /// The release `(identifier, version)`, if known.
    pub fn available_module(&self, identifier: &str, version: &Version) -> Option<&CkanModule> {
        self.available
            .get(identifier)
            .and_then(|versions| versions.get(version))
            .map(|a| &a.module)
    }

    /// Every available release of every identifier.
    pub fn available_entries(&self) -> impl Iterator<Item = &AvailableModule> {
        self.available.values().flat_map(BTreeMap::values)
    }

    /// Highest release of `identifier` compatible with `game`, or `None`.
    pub fn latest_available(
        &self,
        identifier: &str,
        game: &GameVersion,
        comparator: &dyn GameComparator,
    ) -> Option<&CkanModule> {
        self.available
            .get(identifier)?
            .values()
            .rev()
            .map(|a| &a.module)
            .find(|m| comparator.compatible(game, m))
    }

    /// Latest compatible release of every identifier.
    pub fn available(&self, game: &GameVersion, comparator: &dyn GameComparator) -> Vec<&CkanModule> {
        self.available
            .keys()
            .filter_map(|id| self.latest_available(id, game, comparator))
            .collect()
    }

    /// Priority of a repository by name; unknown or missing repositories sort last.
    pub fn repository_priority(&self, name: Option<&str>) -> i32 {
        name.and_then(|n| self.repositories.get(n))
            .map_or(i32::MAX, |r| r.priority)
    }

    // ---- Installed set -------------------------------------------------

    /// Identifier to version for everything installed.
    ///
    /// Identifiers provided by installed modules appear as virtual entries
    /// unless a real entry already uses the name. Autodetected entries are
    /// listed only when `include_autodetected` is set.
    pub fn installed(&self, include_autodetected: bool) -> BTreeMap<String, ModuleVersion> {
        let mut out: BTreeMap<String, ModuleVersion> = self
            .installed
            .iter()
            .filter(|(_, m)| include_autodetected || !m.version.is_autodetected())
            .map(|(id, m)| (id.clone(), m.version.clone()))
            .collect();

        for (id, entry) in &self.installed {
            let Some(module) = &entry.module else { continue };
            for provided in &module.provides {
                out.entry(provided.clone()).or_insert_with(|| ModuleVersion::Virtual {
                    provided_by: id.clone(),
                });
            }
        }
        out
    }

    /// Installed entries with their ownership records.
    pub fn installed_modules(&self) -> impl Iterator<Item = (&str, &InstalledModule)> {
        self.installed.iter().map(|(id, m)| (id.as_str(), m))
    }

    pub fn installed_module(&self, identifier: &str) -> Option<&InstalledModule> {
        self.installed.get(identifier)
    }

    /// True if `identifier` is installed, autodetected, or provided.
    pub fn is_installed(&self, identifier: &str) -> bool {
        self.installed(true).contains_key(identifier)
    }

    /// Installed version of `identifier`, including autodetected and provided entries.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ModuleNotFound`] if nothing by that name is installed.
    pub fn installed_version(&self, identifier: &str) -> Result<ModuleVersion, RegistryError> {
        self.installed(true)
            .remove(identifier)
            .ok_or_else(|| RegistryError::ModuleNotFound(identifier.to_string()))
    }

    /// Records a module as installed along with what it owns on disk.
    pub fn register_module(
        &mut self,
        module: CkanModule,
        files: BTreeSet<String>,
        directories: BTreeSet<String>,
    ) {
        let identifier = module.identifier.clone();
        self.installed.insert(
            identifier,
            InstalledModule {
                version: module.module_version(),
                module: Some(module),
                files,
                directories,
                install_time: Some(Utc::now()),
            },
        );
    }

    /// Removes an installed entry, returning its record.
    pub fn deregister_module(&mut self, identifier: &str) -> Option<InstalledModule> {
        self.installed.remove(identifier)
    }

    /// Installed module owning `path` (relative to the game directory), if any.
    pub fn file_owner(&self, path: &str) -> Option<&str> {
        self.installed
            .iter()
            .find(|(_, m)| !m.version.is_autodetected() && m.files.contains(path))
            .map(|(id, _)| id.as_str())
    }

    /// Registers a loose DLL found on disk as an autodetected module named after its file stem.
    ///
    /// Skipped when a module already owns the file or a real module uses the identifier.
    pub fn register_dll(&mut self, relative_path: &str) {
        let Some(identifier) = Path::new(relative_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
        else {
            return;
        };

        if let Some(owner) = self.file_owner(relative_path) {
            debug!(path = relative_path, owner, "DLL owned by installed module");
            return;
        }
        if self
            .installed
            .get(&identifier)
            .is_some_and(|m| !m.version.is_autodetected())
        {
            return;
        }

        debug!(identifier, path = relative_path, "Registering autodetected DLL");
        self.installed.insert(
            identifier,
            InstalledModule {
                version: ModuleVersion::Autodetected,
                module: None,
                files: BTreeSet::from([relative_path.to_string()]),
                directories: BTreeSet::new(),
                install_time: None,
            },
        );
    }

    /// Drops every autodetected entry before a rescan.
    pub fn clear_dlls(&mut self) {
        self.installed.retain(|_, m| !m.version.is_autodetected());
    }

    /// Installed modules that would be left with an unmet `depends` if
    /// `identifiers` were removed, followed transitively.
    ///
    /// The requested identifiers themselves are not included in the result.
    pub fn find_reverse_dependencies(&self, identifiers: &[String]) -> Vec<String> {
        let requested: BTreeSet<&str> = identifiers.iter().map(String::as_str).collect();
        let mut removing = requested.clone();

        loop {
            let remaining = self.installed_without(&removing);
            let broken: Vec<&str> = self
                .installed
                .iter()
                .filter(|(id, _)| !removing.contains(id.as_str()))
                .filter_map(|(id, m)| m.module.as_ref().map(|module| (id, module)))
                .filter(|(_, module)| {
                    module.depends.iter().any(|dep| {
                        !remaining
                            .get(&dep.name)
                            .is_some_and(|v| dep.version_within(v))
                    })
                })
                .map(|(id, _)| id.as_str())
                .collect();

            if broken.is_empty() {
                break;
            }
            removing.extend(broken);
        }

        removing
            .difference(&requested)
            .map(|s| (*s).to_string())
            .collect()
    }

    /// The `installed(true)` view with some identifiers (and what they provide) removed.
    pub(crate) fn installed_without(&self, removing: &BTreeSet<&str>) -> BTreeMap<String, ModuleVersion> {
        let mut out = BTreeMap::new();
        for (id, entry) in &self.installed {
            if removing.contains(id.as_str()) {
                continue;
            }
            out.insert(id.clone(), entry.version.clone());
        }
        for (id, entry) in &self.installed {
            if removing.contains(id.as_str()) {
                continue;
            }
            let Some(module) = &entry.module else { continue };
            for provided in &module.provides {
                out.entry(provided.clone()).or_insert_with(|| ModuleVersion::Virtual {
                    provided_by: id.clone(),
                });
            }
        }
        out
    }

    // ---- Repositories --------------------------------------------------

    /// Repositories ordered by priority, then name.
    pub fn repositories(&self) -> Vec<&Repository> {
        let mut repos: Vec<&Repository> = self.repositories.values().collect();
        repos.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        repos
    }

    /// Adds a repository.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateRepository`] if the name is taken.
    pub fn add_repository(&mut self, repository: Repository) -> Result<(), RegistryError> {
        if self.repositories.contains_key(&repository.name) {
            return Err(RegistryError::DuplicateRepository(repository.name));
        }
        self.repositories.insert(repository.name.clone(), repository);
        Ok(())
    }

    pub fn remove_repository(&mut self, name: &str) -> Result<Repository, RegistryError> {
        self.repositories
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownRepository(name.to_string()))
    }
}
