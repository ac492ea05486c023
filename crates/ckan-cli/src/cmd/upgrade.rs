//! Upgrade command - upgrade installed modules to their latest compatible release

use anyhow::Result;
use ckan_core::Reporter;

use crate::Context;

/// Upgrade the given modules, or everything when `modules` is empty
pub fn upgrade(ctx: &mut Context, modules: &[String]) -> Result<()> {
    let options = ctx.install_options();
    let before = ctx.registry.installed(false);

    let mut registry = ctx.registry.clone();
    let upgraded = ctx.installer().upgrade(&mut registry, modules, &options)?;
    ctx.registry = registry;

    if upgraded.is_empty() {
        ctx.reporter.info("All modules are up to date.");
        return Ok(());
    }
    for module in &upgraded {
        match before.get(&module.identifier) {
            Some(old) => ctx
                .reporter
                .info(&format!("{}: {old} -> {}", module.identifier, module.version)),
            None => ctx
                .reporter
                .info(&format!("{}: new dependency {}", module.identifier, module.version)),
        }
    }
    Ok(())
}
