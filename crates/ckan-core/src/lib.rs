pub mod cache;
pub mod comparator;
pub mod config;
pub mod game;
pub mod installer;
pub mod io;
pub mod registry;
pub mod repo;
pub mod resolver;

pub mod reporter;

pub use cache::NetFileCache;
pub use comparator::{CompatibilityMode, GameComparator};
pub use game::GameInstance;
pub use installer::ModuleInstaller;
pub use registry::Registry;
pub use reporter::{NullReporter, Reporter};

/// User Agent string for core operations
pub const USER_AGENT: &str = concat!("ckan-core/", env!("CARGO_PKG_VERSION"));
