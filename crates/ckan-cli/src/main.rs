//! ckan - mod manager CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ckan_cli::cmd;
use ckan_cli::cmd::install::InstallFlags;
use ckan_cli::{CacheCommands, Cli, Commands, Context, RepoCommands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v beats RUST_LOG, which beats the default.
    let filter = match cli.global.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut ctx = Context::open(&cli.global)?;

    match cli.command {
        Commands::Update => cmd::update::update(&mut ctx),
        Commands::Install {
            modules,
            no_recommends,
            with_suggests,
            allow_incompatible,
            overwrite,
        } => {
            let flags = InstallFlags {
                no_recommends,
                with_suggests,
                allow_incompatible,
                overwrite,
            };
            cmd::install::install(&mut ctx, &modules, flags)
        }
        Commands::Remove { modules, all } => cmd::remove::remove(&mut ctx, &modules, all),
        Commands::Upgrade { modules } => cmd::upgrade::upgrade(&mut ctx, &modules),
        Commands::List { porcelain } => cmd::list::list(&ctx, porcelain),
        Commands::Available { all } => cmd::available::available(&ctx, all),
        Commands::Repo { command } => match command {
            RepoCommands::List => cmd::repo::list(&ctx),
            RepoCommands::Add {
                name,
                uri,
                priority,
            } => cmd::repo::add(&mut ctx, &name, &uri, priority),
            RepoCommands::Forget { name } => cmd::repo::forget(&mut ctx, &name),
        },
        Commands::Scan => cmd::scan::scan(&mut ctx),
        Commands::Cache { command } => match command {
            CacheCommands::Clean => cmd::cache::clean(&ctx),
        },
    }
}
