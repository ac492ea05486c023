//! Module tables

use comfy_table::presets::UTF8_HORIZONTAL_ONLY;
use comfy_table::{Cell, ContentArrangement, Table};

/// Create a table with the given column headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_HORIZONTAL_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| Cell::new(*h)));
    table
}

/// Upgrade status of an installed module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    UpToDate,
    Upgradable,
    Incompatible,
    /// Installed but gone from every repository.
    Unknown,
    Autodetected,
}

impl Status {
    pub fn bullet(self) -> char {
        match self {
            Self::UpToDate | Self::Autodetected => '-',
            Self::Upgradable => '^',
            Self::Incompatible => 'X',
            Self::Unknown => '?',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::UpToDate => "up to date",
            Self::Upgradable => "upgradable",
            Self::Incompatible => "incompatible",
            Self::Unknown => "unknown",
            Self::Autodetected => "autodetected",
        }
    }
}

pub const LEGEND: &str = "Legend: -: Up to date. X: Incompatible. ^: Upgradable. ?: Unknown.";
