//! Cache command

use anyhow::{Context as _, Result};
use ckan_core::Reporter;

use crate::Context;

/// Delete every cached archive
pub fn clean(ctx: &Context) -> Result<()> {
    ctx.cache.cleanup().context("Failed to clean download cache")?;
    ctx.reporter
        .info(&format!("Emptied {}", ctx.cache.dir().display()));
    Ok(())
}
