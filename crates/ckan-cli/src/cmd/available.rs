//! Available command

use anyhow::Result;
use ckan_core::Reporter;

use crate::Context;
use crate::ui::table::new_table;

/// List the latest release of every module, compatible ones only unless `all`
pub fn available(ctx: &Context, all: bool) -> Result<()> {
    let comparator = ctx.comparator();
    let modules = if all {
        let mut latest = Vec::new();
        let mut entries = ctx.registry.available_entries().peekable();
        // Entries arrive grouped by identifier, oldest first.
        while let Some(entry) = entries.next() {
            let next_id = entries.peek().map(|e| e.module.identifier.as_str());
            if next_id != Some(entry.module.identifier.as_str()) {
                latest.push(&entry.module);
            }
        }
        latest
    } else {
        ctx.registry.available(ctx.game.version(), comparator.as_ref())
    };

    if modules.is_empty() {
        ctx.reporter
            .info("No modules available. Run 'ckan update' to fetch repository metadata.");
        return Ok(());
    }

    let mut table = new_table(&["Module", "Version", "Summary"]);
    for module in &modules {
        table.add_row(vec![
            module.identifier.clone(),
            module.version.to_string(),
            module.summary.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    println!("  {} module(s) for game version {}", modules.len(), ctx.game.version());
    Ok(())
}
