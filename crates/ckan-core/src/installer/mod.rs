//! Module installation and removal.
//!
//! Every public operation funnels into [`ModuleInstaller::add_remove`]:
//!
//! 1. Fetch any archives missing from the cache.
//! 2. Resolve and validate every file of every module being added, and check
//!    nothing already on disk would be clobbered. Nothing is written yet.
//! 3. Apply removals, then installs, inside one [`FileTransaction`].
//! 4. Save the updated registry, then commit.
//!
//! A failure at any step leaves the game directory and the registry as they were.

mod error;
mod files;
mod transaction;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ckan_schema::{CkanModule, InstallTarget};
use tracing::{debug, info};
use zip::ZipArchive;

pub use error::InstallError;
pub use files::{InstallableFile, find_installable_files, transform_output_name};
pub use transaction::FileTransaction;

use crate::cache::NetFileCache;
use crate::comparator::GameComparator;
use crate::game::GameInstance;
use crate::io::download::{DownloadTarget, NetAsyncDownloader};
use crate::registry::{InstalledModule, Registry};
use crate::reporter::Reporter;
use crate::resolver::{RelationshipResolver, Resolution, ResolverOptions};

/// What to do about unowned files already at a destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverwriteMode {
    /// Fail with [`InstallError::FileExists`].
    #[default]
    Refuse,
    /// Replace them. The originals come back on rollback.
    Overwrite,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub resolver: ResolverOptions,
    pub overwrite: OverwriteMode,
}

/// A validated module install, ready to extract.
#[derive(Debug)]
struct Planned<'m> {
    module: &'m CkanModule,
    archive: PathBuf,
    files: Vec<InstallableFile>,
}

#[derive(Debug)]
pub struct ModuleInstaller<'a> {
    game: &'a GameInstance,
    cache: &'a NetFileCache,
    downloader: &'a NetAsyncDownloader,
    reporter: Arc<dyn Reporter>,
    comparator: Arc<dyn GameComparator>,
}

impl<'a> ModuleInstaller<'a> {
    pub fn new(
        game: &'a GameInstance,
        cache: &'a NetFileCache,
        downloader: &'a NetAsyncDownloader,
        reporter: Arc<dyn Reporter>,
        comparator: Arc<dyn GameComparator>,
    ) -> Self {
        Self {
            game,
            cache,
            downloader,
            reporter,
            comparator,
        }
    }

    fn resolver<'r>(&'r self, registry: &'r Registry, options: ResolverOptions) -> RelationshipResolver<'r> {
        RelationshipResolver::new(registry, self.game.version(), self.comparator.as_ref(), options)
    }

    fn report_plan(&self, resolution: &Resolution) {
        for warning in &resolution.warnings {
            self.reporter.warning(warning);
        }
        let names: Vec<String> = resolution.modules.iter().map(ToString::to_string).collect();
        if !names.is_empty() {
            self.reporter.info(&format!("Installing: {}", names.join(", ")));
        }
    }

    /// Installs the latest compatible release of each identifier with its dependencies.
    ///
    /// # Errors
    ///
    /// Resolution, download, validation and IO failures; nothing is changed on error.
    pub fn install_list(
        &self,
        registry: &mut Registry,
        identifiers: &[String],
        options: &InstallOptions,
    ) -> Result<Resolution, InstallError> {
        let resolution = self
            .resolver(registry, options.resolver)
            .resolve_identifiers(identifiers)?;
        self.report_plan(&resolution);
        self.add_remove(registry, &resolution.modules, &[], options.overwrite)?;
        Ok(resolution)
    }

    /// Installs exactly these releases plus whatever they need.
    pub fn install_modules(
        &self,
        registry: &mut Registry,
        modules: Vec<CkanModule>,
        options: &InstallOptions,
    ) -> Result<Resolution, InstallError> {
        let resolution = self
            .resolver(registry, options.resolver)
            .resolve_modules(modules)?;
        self.report_plan(&resolution);
        self.add_remove(registry, &resolution.modules, &[], options.overwrite)?;
        Ok(resolution)
    }

    /// Removes the modules and every installed module depending on them.
    ///
    /// Returns everything removed.
    pub fn uninstall_list(
        &self,
        registry: &mut Registry,
        identifiers: &[String],
    ) -> Result<Vec<String>, InstallError> {
        let mut all: Vec<String> = Vec::new();
        for id in identifiers {
            require_installed(registry, id)?;
            if !all.contains(id) {
                all.push(id.clone());
            }
        }

        let reverse = registry.find_reverse_dependencies(&all);
        if !reverse.is_empty() {
            self.reporter.info(&format!(
                "Also removing modules that depend on them: {}",
                reverse.join(", ")
            ));
        }
        all.extend(reverse);

        self.add_remove(registry, &[], &all, OverwriteMode::Refuse)?;
        Ok(all)
    }

    /// Upgrades the given modules, or every installed one if `identifiers` is
    /// empty, to their latest compatible release.
    ///
    /// Modules already at their newest release are skipped. Returns the
    /// modules installed, new dependencies included.
    pub fn upgrade(
        &self,
        registry: &mut Registry,
        identifiers: &[String],
        options: &InstallOptions,
    ) -> Result<Vec<CkanModule>, InstallError> {
        let targets: Vec<String> = if identifiers.is_empty() {
            registry
                .installed_modules()
                .filter(|(_, m)| !m.version.is_autodetected())
                .map(|(id, _)| id.to_string())
                .collect()
        } else {
            identifiers.to_vec()
        };

        let mut upgrades = Vec::new();
        for id in &targets {
            let entry = require_installed(registry, id)?;
            let Some(current) = entry.version.as_normal() else {
                continue;
            };
            match registry.latest_available(id, self.game.version(), self.comparator.as_ref()) {
                Some(latest) if latest.version > *current => upgrades.push(latest.clone()),
                _ => debug!(identifier = %id, %current, "Already at newest compatible version"),
            }
        }

        if upgrades.is_empty() {
            self.reporter.info("Nothing to upgrade");
            return Ok(Vec::new());
        }

        let replacing: Vec<String> = upgrades.iter().map(|m| m.identifier.clone()).collect();
        let resolution = self
            .resolver(registry, options.resolver)
            .removing(replacing.iter().cloned())
            .resolve_modules(upgrades)?;
        self.report_plan(&resolution);
        self.add_remove(registry, &resolution.modules, &replacing, options.overwrite)?;
        Ok(resolution.modules)
    }

    /// Removes and reinstalls modules at their installed version, using the
    /// current available metadata when there is any.
    pub fn reinstall(&self, registry: &mut Registry, identifiers: &[String]) -> Result<(), InstallError> {
        let mut modules = Vec::with_capacity(identifiers.len());
        for id in identifiers {
            let entry = require_installed(registry, id)?;
            let installed = entry
                .module
                .as_ref()
                .ok_or_else(|| InstallError::ModuleNotInstalled(id.clone()))?;
            let module = registry
                .available_module(id, &installed.version)
                .unwrap_or(installed)
                .clone();
            modules.push(module);
        }
        self.add_remove(registry, &modules, identifiers, OverwriteMode::Refuse)
    }

    /// Game-relative paths `module` would install. Its archive must already be cached.
    pub fn module_contents(&self, module: &CkanModule) -> Result<Vec<String>, InstallError> {
        let archive = self.cached_archive(module)?;
        Ok(find_installable_files(module, &archive, Some(self.game))?
            .into_iter()
            .map(|f| f.relative)
            .collect())
    }

    /// Downloads every archive not yet in the cache and stores it under the
    /// module's standard name.
    ///
    /// # Errors
    ///
    /// [`InstallError::DownloadFailed`] once all transfers have settled, if any failed.
    pub fn download_modules(&self, modules: &[CkanModule]) -> Result<(), InstallError> {
        let mut seen = HashSet::new();
        let pending: Vec<&CkanModule> = modules
            .iter()
            .filter(|m| seen.insert(m.download.as_str()))
            .filter(|m| self.cache.get_cached_zip(&m.download, false).is_none())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        info!(count = pending.len(), "Downloading module archives");
        let targets = pending
            .iter()
            .map(|m| DownloadTarget::new(&m.download, m.download_size))
            .collect();
        let paths = self.downloader.download_and_wait(targets)?;

        for (module, path) in pending.iter().zip(paths) {
            self.cache
                .store(&module.download, &path, Some(&module.standard_name()), true)?;
        }
        Ok(())
    }

    fn cached_archive(&self, module: &CkanModule) -> Result<PathBuf, InstallError> {
        self.cache
            .get_cached_zip(&module.download, false)
            .ok_or_else(|| InstallError::CorruptArchive {
                url: module.download.clone(),
            })
    }

    /// Installs `add` and removes `remove` as one transaction.
    ///
    /// Removals are applied first, so an identifier in both is replaced.
    pub fn add_remove(
        &self,
        registry: &mut Registry,
        add: &[CkanModule],
        remove: &[String],
        overwrite: OverwriteMode,
    ) -> Result<(), InstallError> {
        let current: &Registry = registry;
        let removing: Vec<(&str, &InstalledModule)> = remove
            .iter()
            .map(|id| Ok((id.as_str(), require_installed(current, id)?)))
            .collect::<Result<_, InstallError>>()?;

        self.download_modules(add)?;
        let planned = add
            .iter()
            .map(|module| {
                let archive = self.cached_archive(module)?;
                let files = find_installable_files(module, &archive, Some(self.game))?;
                Ok(Planned {
                    module,
                    archive,
                    files,
                })
            })
            .collect::<Result<Vec<_>, InstallError>>()?;

        let freed: BTreeSet<&str> = removing
            .iter()
            .flat_map(|(_, m)| m.files.iter().map(String::as_str))
            .collect();
        let removed_ids: BTreeSet<&str> = removing.iter().map(|(id, _)| *id).collect();
        self.check_clobbers(current, &planned, &freed, &removed_ids, overwrite)?;

        let mut tx = FileTransaction::new(&self.game.temp_dir())?;
        for (id, record) in &removing {
            info!(identifier = id, "Removing module");
            self.remove_files(&mut tx, record)?;
        }

        let total = planned.len();
        let mut installed = Vec::with_capacity(total);
        for (i, plan) in planned.iter().enumerate() {
            self.reporter.progress(
                &format!("Installing {}", plan.module),
                percent(i, total),
            );
            let (files, dirs) = self.extract(&mut tx, plan, overwrite)?;
            installed.push((plan.module.clone(), files, dirs));
        }

        let mut next = current.clone();
        for id in remove {
            next.deregister_module(id);
        }
        for (module, files, dirs) in installed {
            next.register_module(module, files, dirs);
        }
        next.save(&self.game.registry_path())?;

        tx.commit();
        *registry = next;
        if total > 0 {
            self.reporter.progress("Done", 100);
        }
        Ok(())
    }

    /// Refuses any write onto a file we don't own.
    fn check_clobbers(
        &self,
        registry: &Registry,
        planned: &[Planned<'_>],
        freed: &BTreeSet<&str>,
        removed_ids: &BTreeSet<&str>,
        overwrite: OverwriteMode,
    ) -> Result<(), InstallError> {
        let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
        for plan in planned {
            let identifier = plan.module.identifier.as_str();
            for file in plan.files.iter().filter(|f| !f.makedir) {
                let exists = |owner: Option<&str>| InstallError::FileExists {
                    identifier: identifier.to_string(),
                    path: file.relative.clone(),
                    owner: owner.map(str::to_string),
                };
                if let Some(other) = claimed.insert(file.relative.as_str(), identifier) {
                    return Err(exists(Some(other)));
                }
                if freed.contains(file.relative.as_str()) {
                    continue;
                }
                let on_disk = file.destination.as_deref().is_some_and(Path::exists);
                if !on_disk {
                    continue;
                }
                match registry.file_owner(&file.relative) {
                    Some(owner) if !removed_ids.contains(owner) => return Err(exists(Some(owner))),
                    _ if overwrite == OverwriteMode::Refuse => return Err(exists(None)),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn extract(
        &self,
        tx: &mut FileTransaction,
        plan: &Planned<'_>,
        overwrite: OverwriteMode,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>), InstallError> {
        info!(module = %plan.module, files = plan.files.len(), "Installing module");
        let mut archive = ZipArchive::new(File::open(&plan.archive)?)?;
        let mut files = BTreeSet::new();
        let mut dirs = BTreeSet::new();

        for file in &plan.files {
            let Some(dest) = file.destination.as_deref() else {
                continue;
            };
            let dir = if file.makedir { Some(dest) } else { dest.parent() };
            if let Some(dir) = dir {
                for created in tx.create_dir_all(dir)? {
                    dirs.extend(self.game.to_relative(&created));
                }
            }
            if file.makedir {
                continue;
            }
            let mut entry = archive.by_index(file.index)?;
            tx.write_from(dest, &mut entry, overwrite == OverwriteMode::Overwrite)
                .map_err(|e| InstallError::context("Extracting archive entry", format!("{}: {e}", file.source)))?;
            files.insert(file.relative.clone());
        }
        Ok((files, dirs))
    }

    /// Deletes a module's files, then every directory left empty, deepest first.
    ///
    /// Target roots survive unless this module's install created them.
    fn remove_files(&self, tx: &mut FileTransaction, record: &InstalledModule) -> Result<(), InstallError> {
        for rel in &record.files {
            let path = self.game.to_absolute(rel);
            if path.is_file() {
                tx.remove_file(&path)?;
            } else {
                debug!(path = %rel, "Owned file already gone");
            }
        }

        let protected = protected_dirs();
        let mut candidates: BTreeSet<String> = record.directories.clone();
        for rel in &record.files {
            let mut current = rel.as_str();
            while let Some(i) = current.rfind('/') {
                current = &current[..i];
                candidates.insert(current.to_string());
            }
        }
        let mut ordered: Vec<String> = candidates
            .into_iter()
            .filter(|d| record.directories.contains(d) || !protected.contains(d.as_str()))
            .collect();
        ordered.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));

        for dir in ordered {
            if tx.remove_dir_if_empty(&self.game.to_absolute(&dir))? {
                debug!(directory = %dir, "Removed empty directory");
            }
        }
        Ok(())
    }
}

/// Target roots and their ancestors.
fn protected_dirs() -> BTreeSet<&'static str> {
    let mut out = BTreeSet::new();
    for target in InstallTarget::ALL {
        let mut current = target.relative_path();
        out.insert(current);
        while let Some(i) = current.rfind('/') {
            current = &current[..i];
            out.insert(current);
        }
    }
    out
}

fn require_installed<'r>(registry: &'r Registry, identifier: &str) -> Result<&'r InstalledModule, InstallError> {
    registry
        .installed_module(identifier)
        .filter(|m| !m.version.is_autodetected())
        .ok_or_else(|| InstallError::ModuleNotInstalled(identifier.to_string()))
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done * 100 / total).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_dirs() {
        let dirs = protected_dirs();
        for d in ["GameData", "Ships", "Ships/@thumbs", "Ships/@thumbs/VAB", "saves", "saves/scenarios"] {
            assert!(dirs.contains(d), "{d}");
        }
        assert!(!dirs.contains("GameData/Foo"));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 4), 0);
        assert_eq!(percent(2, 4), 50);
        assert_eq!(percent(0, 0), 100);
    }
}
