//! Everything a command needs, opened once from the global arguments.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use ckan_core::config::Config;
use ckan_core::game::{self, CKAN_DIR};
use ckan_core::installer::{InstallOptions, OverwriteMode};
use ckan_core::io::download::NetAsyncDownloader;
use ckan_core::{GameComparator, GameInstance, ModuleInstaller, NetFileCache, Registry};
use ckan_schema::GameVersion;
use tracing::debug;

use crate::GlobalArgs;
use crate::ui::ConsoleReporter;

#[derive(Debug)]
pub struct Context {
    pub game: GameInstance,
    pub config: Config,
    pub cache: NetFileCache,
    pub downloader: NetAsyncDownloader,
    pub reporter: Arc<ConsoleReporter>,
    pub registry: Registry,
}

impl Context {
    pub fn open(args: &GlobalArgs) -> Result<Self> {
        let root = match &args.game_dir {
            Some(dir) => crate::expand_home(dir),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };

        let config_path = root.join(CKAN_DIR).join("config.toml");
        let config = Config::load(&config_path)
            .and_then(|c| c.with_overrides(None, args.game_version.as_deref()))
            .with_context(|| format!("Failed to load {}", config_path.display()))?;

        let version = game_version(&config, &root)?;
        let game = GameInstance::new(&root, version)
            .with_context(|| format!("Failed to open game directory {}", root.display()))?;
        debug!(root = %root.display(), %version, "Using game instance");

        let cache = NetFileCache::new(game.download_cache_dir()).context("Failed to open download cache")?;
        let reporter = Arc::new(ConsoleReporter::new(args.yes));
        let downloader = NetAsyncDownloader::new(reporter.clone())
            .with_backend(config.backend())
            .with_progress_interval(config.progress_interval())
            .with_temp_dir(game.temp_dir());
        let registry = Registry::load(&game.registry_path()).context("Failed to load registry")?;

        Ok(Self {
            game,
            config,
            cache,
            downloader,
            reporter,
            registry,
        })
    }

    pub fn comparator(&self) -> Arc<dyn GameComparator> {
        self.config.comparator()
    }

    pub fn installer(&self) -> ModuleInstaller<'_> {
        ModuleInstaller::new(
            &self.game,
            &self.cache,
            &self.downloader,
            self.reporter.clone(),
            self.comparator(),
        )
    }

    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            resolver: self.config.resolver_options(),
            overwrite: OverwriteMode::Refuse,
        }
    }

    pub fn save_registry(&self) -> Result<()> {
        self.registry
            .save(&self.game.registry_path())
            .context("Failed to save registry")
    }
}

fn game_version(config: &Config, root: &std::path::Path) -> Result<GameVersion> {
    if let Some(version) = config.parsed_game_version()? {
        return Ok(version);
    }
    if let Some(version) = game::detect_version(root) {
        return Ok(version);
    }
    let readme: PathBuf = root.join("readme.txt");
    bail!(
        "Could not detect the game version from {}; pass --game-version",
        readme.display()
    )
}
