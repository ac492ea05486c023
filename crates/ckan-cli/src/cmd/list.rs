//! List command

use anyhow::Result;
use ckan_core::Reporter;
use ckan_schema::ModuleVersion;

use crate::Context;
use crate::ui::table::{LEGEND, Status, new_table};

/// List installed modules with their upgrade status
pub fn list(ctx: &Context, porcelain: bool) -> Result<()> {
    let comparator = ctx.comparator();
    let game = ctx.game.version();

    let rows: Vec<(String, ModuleVersion, Status)> = ctx
        .registry
        .installed(true)
        .into_iter()
        .filter_map(|(id, version)| {
            let status = match &version {
                ModuleVersion::Virtual { .. } => return None,
                ModuleVersion::Autodetected => Status::Autodetected,
                ModuleVersion::Normal { version: current } => {
                    match ctx.registry.latest_available(&id, game, comparator.as_ref()) {
                        _ if ctx.registry.all_available(&id).is_empty() => Status::Unknown,
                        None => Status::Incompatible,
                        Some(latest) if latest.version > *current => Status::Upgradable,
                        Some(_) => Status::UpToDate,
                    }
                }
            };
            Some((id, version, status))
        })
        .collect();

    if porcelain {
        for (id, version, status) in &rows {
            println!("{} {id} {version}", status.bullet());
        }
        return Ok(());
    }

    if rows.is_empty() {
        ctx.reporter.info("No modules installed.");
        ctx.reporter
            .info("Run 'ckan update && ckan install <module>' to get started.");
        return Ok(());
    }

    println!("  Game at {} (version {game})", ctx.game.root().display());
    let mut table = new_table(&["", "Module", "Version", "Status"]);
    for (id, version, status) in &rows {
        table.add_row(vec![
            status.bullet().to_string(),
            id.clone(),
            version.to_string(),
            status.label().to_string(),
        ]);
    }
    println!("{table}");
    println!("  {LEGEND}");
    Ok(())
}
