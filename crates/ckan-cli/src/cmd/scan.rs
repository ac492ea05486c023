//! Scan command

use anyhow::{Context as _, Result};
use ckan_core::Reporter;

use crate::Context;

/// Rebuild autodetected entries from DLLs found under GameData
pub fn scan(ctx: &mut Context) -> Result<()> {
    let found = ctx
        .game
        .scan_game_data(&mut ctx.registry)
        .context("Failed to scan GameData")?;
    ctx.save_registry()?;
    ctx.reporter.info(&format!("Found {found} DLL(s) under GameData"));
    Ok(())
}
