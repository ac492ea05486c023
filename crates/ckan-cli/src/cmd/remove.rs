//! Remove command

use anyhow::{Result, bail};
use ckan_core::Reporter;

use crate::Context;

/// Remove modules, plus every installed module that depends on them
pub fn remove(ctx: &mut Context, modules: &[String], all: bool) -> Result<()> {
    let targets: Vec<String> = if all {
        ctx.registry
            .installed(false)
            .into_iter()
            .filter(|(_, v)| v.as_normal().is_some())
            .map(|(id, _)| id)
            .collect()
    } else {
        modules.to_vec()
    };
    if targets.is_empty() {
        ctx.reporter.info("No modules installed.");
        return Ok(());
    }

    for id in &targets {
        if !ctx.registry.is_installed(id) {
            bail!("{id} is not installed");
        }
    }
    let dependents = ctx.registry.find_reverse_dependencies(&targets);
    if !dependents.is_empty() {
        let question = format!(
            "{} depend on the modules being removed and will be removed too. Continue?",
            dependents.join(", ")
        );
        if !ctx.reporter.confirm(&question) {
            ctx.reporter.error("Operation cancelled");
            return Ok(());
        }
    }

    let mut registry = ctx.registry.clone();
    let removed = ctx.installer().uninstall_list(&mut registry, &targets)?;
    ctx.registry = registry;
    ctx.reporter
        .info(&format!("Removed {}", removed.join(", ")));
    Ok(())
}
