//! ckan - a mod manager for game installations
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Thin command-line front end over `ckan-core`.
//!
//! # Directory Layout
//!
//! ```text
//! <game>/
//! ├── GameData/         # Mods install here
//! └── CKAN/
//!     ├── registry.json # Installed and available modules
//!     ├── config.toml   # Optional settings
//!     ├── downloads/    # Archive cache
//!     └── temp/         # Scratch space, cleared on start
//! ```

pub mod cmd;
pub mod context;
pub mod ui;

pub use context::Context;

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "ckan")]
#[command(author, version, about = "ckan - a mod manager for game installations")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Game directory (defaults to the current directory)
    #[arg(long, global = true, env = "CKAN_GAME_DIR")]
    pub game_dir: Option<PathBuf>,

    /// Override the detected game version
    #[arg(long, global = true)]
    pub game_version: Option<String>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Answer yes to every question
    #[arg(short, long, global = true)]
    pub yes: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Refresh available modules from every repository
    Update,
    /// Install modules with their dependencies
    Install {
        /// Identifiers, optionally pinned: Foo or Foo=1.2
        #[arg(required = true)]
        modules: Vec<String>,
        /// Skip recommended modules
        #[arg(long)]
        no_recommends: bool,
        /// Also install suggested modules
        #[arg(long)]
        with_suggests: bool,
        /// Allow releases that don't support this game version
        #[arg(long)]
        allow_incompatible: bool,
        /// Replace files already on disk that no module owns
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove modules and everything depending on them
    Remove {
        /// Identifiers
        #[arg(required_unless_present = "all")]
        modules: Vec<String>,
        /// Remove every installed module
        #[arg(long, short = 'a', conflicts_with = "modules")]
        all: bool,
    },
    /// Upgrade installed modules to their latest compatible release
    Upgrade {
        /// Specific modules to upgrade (or all if empty)
        modules: Vec<String>,
    },
    /// List installed modules
    List {
        /// Plain output for scripts
        #[arg(long)]
        porcelain: bool,
    },
    /// List modules available for this game version
    Available {
        /// Include releases for other game versions
        #[arg(long)]
        all: bool,
    },
    /// Manage metadata repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Register loose DLLs under GameData as autodetected modules
    Scan,
    /// Manage the download cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum RepoCommands {
    /// Show configured repositories
    List,
    /// Add a repository
    Add {
        /// Repository name
        name: String,
        /// Archive URL (http(s):// or file://)
        uri: String,
        /// Lower wins when two repositories carry the same release
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Remove a repository
    Forget {
        /// Repository name
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommands {
    /// Delete every cached archive
    Clean,
}

/// Expand a leading `~` to the home directory.
///
/// # Example
///
/// ```
/// use ckan_cli::expand_home;
/// use std::path::Path;
///
/// assert_eq!(expand_home(Path::new("/opt/ksp")), Path::new("/opt/ksp"));
/// ```
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Split `Foo=1.2` into identifier and version.
pub fn split_pin(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('=') {
        Some((id, version)) => (id.trim(), Some(version.trim())),
        None => (spec.trim(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pin() {
        assert_eq!(split_pin("Foo"), ("Foo", None));
        assert_eq!(split_pin("Foo=1:2.0"), ("Foo", Some("1:2.0")));
    }

    #[test]
    fn test_expand_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_home(Path::new("~/KSP")), home.join("KSP"));
        assert_eq!(expand_home(Path::new("~")), home);
        assert_eq!(expand_home(Path::new("KSP/~")), Path::new("KSP/~"));
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "ckan",
            "--game-dir",
            "/opt/ksp",
            "-vv",
            "install",
            "Foo",
            "Bar=1.0",
            "--overwrite",
        ])
        .unwrap();
        assert_eq!(cli.global.verbose, 2);
        assert_eq!(cli.global.game_dir.as_deref(), Some(Path::new("/opt/ksp")));
        match cli.command {
            Commands::Install {
                modules, overwrite, ..
            } => {
                assert_eq!(modules, vec!["Foo", "Bar=1.0"]);
                assert!(overwrite);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(Cli::try_parse_from(["ckan", "remove"]).is_err());
        assert!(Cli::try_parse_from(["ckan", "remove", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["ckan", "repo", "add", "main", "file:///tmp/r.tar.gz"]).is_ok());
    }
}
