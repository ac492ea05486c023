//! Install command

use anyhow::{Context as _, Result, anyhow, bail};
use ckan_core::Reporter;
use ckan_core::installer::{InstallOptions, OverwriteMode};
use ckan_schema::{CkanModule, Version};

use crate::{Context, split_pin};

/// Flags that adjust one install on top of the config file.
#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct InstallFlags {
    pub no_recommends: bool,
    pub with_suggests: bool,
    pub allow_incompatible: bool,
    pub overwrite: bool,
}

impl InstallFlags {
    fn apply(self, mut options: InstallOptions) -> InstallOptions {
        if self.no_recommends {
            options.resolver.with_recommends = false;
        }
        options.resolver.with_suggests |= self.with_suggests;
        options.resolver.allow_incompatible |= self.allow_incompatible;
        if self.overwrite {
            options.overwrite = OverwriteMode::Overwrite;
        }
        options
    }
}

/// Install modules, each `Foo` or `Foo=1.2`
pub fn install(ctx: &mut Context, specs: &[String], flags: InstallFlags) -> Result<()> {
    let options = flags.apply(ctx.install_options());
    let mut registry = ctx.registry.clone();
    let installer = ctx.installer();

    let pinned = specs.iter().any(|s| split_pin(s).1.is_some());
    let resolution = if pinned {
        let modules = pinned_modules(ctx, specs, &options)?;
        installer.install_modules(&mut registry, modules, &options)?
    } else {
        let ids: Vec<String> = specs.iter().map(|s| split_pin(s).0.to_string()).collect();
        installer.install_list(&mut registry, &ids, &options)?
    };
    drop(installer);
    ctx.registry = registry;

    if resolution.modules.is_empty() {
        ctx.reporter.info("Nothing to install.");
    } else {
        ctx.reporter
            .info(&format!("Installed {} module(s).", resolution.modules.len()));
    }
    Ok(())
}

fn pinned_modules(ctx: &Context, specs: &[String], options: &InstallOptions) -> Result<Vec<CkanModule>> {
    let game = ctx.game.version();
    let comparator = ctx.comparator();
    let mut modules = Vec::with_capacity(specs.len());
    for spec in specs {
        let (id, version) = split_pin(spec);
        if ctx.registry.is_installed(id) {
            bail!("{id} is already installed; use 'ckan upgrade' to change its version");
        }
        let module = match version {
            Some(v) => {
                let version = Version::parse(v).with_context(|| format!("Bad version in '{spec}'"))?;
                ctx.registry.available_module(id, &version)
            }
            None if options.resolver.allow_incompatible => ctx.registry.all_available(id).last().copied(),
            None => ctx.registry.latest_available(id, game, comparator.as_ref()),
        };
        let module = module.ok_or_else(|| anyhow!("No release matches '{spec}'"))?;
        modules.push(module.clone());
    }
    Ok(modules)
}
