//! Update command - refresh available modules

use anyhow::{Context as _, Result};
use ckan_core::Reporter;
use ckan_core::registry::Repository;
use ckan_core::repo::RepoUpdater;

use crate::Context;

/// Sync every repository, then offer to reinstall modules whose install
/// instructions changed.
pub fn update(ctx: &mut Context) -> Result<()> {
    let repos: Vec<Repository> = ctx.registry.repositories().into_iter().cloned().collect();
    if repos.is_empty() {
        ctx.reporter
            .warning("No repositories configured. Add one with 'ckan repo add <name> <uri>'.");
        return Ok(());
    }

    let updater = RepoUpdater::new(&ctx.downloader, ctx.reporter.clone(), ctx.comparator());
    let version = *ctx.game.version();
    let report = updater
        .update(&mut ctx.registry, &version, &repos, true)
        .context("Repository update cancelled")?;
    ctx.save_registry()?;

    ctx.reporter.info(&format!(
        "{} module release(s) available from {} repository(ies)",
        report.available_count,
        repos.len() - report.failed_repositories.len()
    ));

    if report.metadata_changes.is_empty() {
        return Ok(());
    }
    let question = format!(
        "Install instructions changed for {}. Reinstall now?",
        report.metadata_changes.join(", ")
    );
    if ctx.reporter.confirm(&question) {
        let mut registry = ctx.registry.clone();
        ctx.installer()
            .reinstall(&mut registry, &report.metadata_changes)?;
        ctx.registry = registry;
        ctx.reporter.info("Reinstalled.");
    }
    Ok(())
}
