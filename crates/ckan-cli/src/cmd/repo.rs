//! Repository management commands

use anyhow::Result;
use ckan_core::Reporter;
use ckan_core::registry::Repository;

use crate::Context;
use crate::ui::table::new_table;

/// Show configured repositories in priority order
pub fn list(ctx: &Context) -> Result<()> {
    let repos = ctx.registry.repositories();
    if repos.is_empty() {
        ctx.reporter
            .info("No repositories configured. Add one with 'ckan repo add <name> <uri>'.");
        return Ok(());
    }

    let mut table = new_table(&["Priority", "Name", "URI"]);
    for repo in repos {
        table.add_row(vec![repo.priority.to_string(), repo.name.clone(), repo.uri.clone()]);
    }
    println!("{table}");
    Ok(())
}

/// Add a repository
pub fn add(ctx: &mut Context, name: &str, uri: &str, priority: i32) -> Result<()> {
    ctx.registry
        .add_repository(Repository::new(name, uri, priority))?;
    ctx.save_registry()?;
    ctx.reporter
        .info(&format!("Added {name}. Run 'ckan update' to fetch its modules."));
    Ok(())
}

/// Remove a repository and the modules only it provided
pub fn forget(ctx: &mut Context, name: &str) -> Result<()> {
    ctx.registry.remove_repository(name)?;
    let stale: Vec<_> = ctx
        .registry
        .available_entries()
        .filter(|e| e.repository.as_deref() == Some(name))
        .map(|e| e.module.clone())
        .collect();
    for module in &stale {
        ctx.registry.remove_available(module);
    }
    ctx.save_registry()?;
    ctx.reporter.info(&format!(
        "Removed {name} ({} available release(s) dropped)",
        stale.len()
    ));
    Ok(())
}
