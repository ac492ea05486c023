//! Access to a game installation and the paths ckan keeps inside it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use ckan_schema::{GameVersion, InstallLocation, InstallTarget};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::registry::Registry;

/// Name of the directory ckan keeps its state in, under the game root.
pub const CKAN_DIR: &str = "CKAN";

#[derive(Error, Debug)]
pub enum GameError {
    #[error("{0} is not a game directory (no GameData)")]
    NotGameDir(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A game directory with a known game version.
#[derive(Debug, Clone)]
pub struct GameInstance {
    root: PathBuf,
    version: GameVersion,
}

impl GameInstance {
    /// Opens a game directory, creating ckan's own directories and emptying its temp dir.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::NotGameDir`] if `root` has no `GameData` directory.
    pub fn new(root: impl Into<PathBuf>, version: GameVersion) -> Result<Self, GameError> {
        let root = root.into();
        if !root.join("GameData").is_dir() {
            return Err(GameError::NotGameDir(root));
        }
        let game = Self { root, version };

        fs::create_dir_all(game.download_cache_dir())?;
        let temp = game.temp_dir();
        if temp.exists() {
            fs::remove_dir_all(&temp)?;
        }
        fs::create_dir_all(&temp)?;

        debug!(root = %game.root.display(), version = %game.version, "Opened game instance");
        Ok(game)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version(&self) -> &GameVersion {
        &self.version
    }

    pub fn game_data(&self) -> PathBuf {
        self.root.join("GameData")
    }

    pub fn ckan_dir(&self) -> PathBuf {
        self.root.join(CKAN_DIR)
    }

    pub fn download_cache_dir(&self) -> PathBuf {
        self.ckan_dir().join("downloads")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.ckan_dir().join("temp")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.ckan_dir().join("registry.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.ckan_dir().join("config.toml")
    }

    /// Absolute directory for a target root.
    pub fn target_dir(&self, target: InstallTarget) -> PathBuf {
        self.to_absolute(target.relative_path())
    }

    /// Absolute directory for a parsed `install_to`.
    pub fn location_dir(&self, location: &InstallLocation) -> PathBuf {
        self.to_absolute(&location.relative_path())
    }

    /// Turns a `/`-separated game-relative path into an absolute one.
    pub fn to_absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |acc, seg| acc.join(seg))
    }

    /// Turns an absolute path under the game root into a `/`-separated relative one.
    pub fn to_relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        Some(parts?.join("/"))
    }

    /// Rebuilds the autodetected entries from loose `.dll` files under `GameData`.
    ///
    /// Returns how many DLLs were seen.
    pub fn scan_game_data(&self, registry: &mut Registry) -> Result<usize, GameError> {
        registry.clear_dlls();
        let mut seen = 0;
        let walker = WalkDir::new(self.game_data())
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_dll = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("dll"));
            if !is_dll {
                continue;
            }
            if let Some(rel) = self.to_relative(entry.path()) {
                registry.register_dll(&rel);
                seen += 1;
            }
        }
        info!(count = seen, "Scanned GameData for DLLs");
        Ok(seen)
    }
}

/// Reads the game version from the `Version x.y.z` line of `readme.txt`.
pub fn detect_version(root: &Path) -> Option<GameVersion> {
    let text = fs::read_to_string(root.join("readme.txt")).ok()?;
    let version = text.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Version")?;
        GameVersion::parse(rest.trim()).ok()
    });
    debug!(root = %root.display(), version = ?version, "Detected game version");
    version
}
