//! Game-version compatibility strategies.
//!
//! The active strategy is built once from configuration and handed to the
//! registry queries and the resolver, so both always agree.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ckan_schema::{CkanModule, GameVersion};
use serde::{Deserialize, Serialize};

/// Decides whether a module can be installed on a given game version.
pub trait GameComparator: Send + Sync + fmt::Debug {
    /// True if `module` is compatible with `game`.
    fn compatible(&self, game: &GameVersion, module: &CkanModule) -> bool;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Compatible only inside the declared range.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictComparator;

impl GameComparator for StrictComparator {
    fn compatible(&self, game: &GameVersion, module: &CkanModule) -> bool {
        module.supports_game(game)
    }

    fn name(&self) -> &'static str {
        "strict"
    }
}

/// "Generally recognised as safe": inside the range, or a matching
/// `major.minor` for modules that did not ask for strictness.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrasComparator;

impl GameComparator for GrasComparator {
    fn compatible(&self, game: &GameVersion, module: &CkanModule) -> bool {
        let range = &module.game_versions;
        range.contains(game) || (!range.is_strict() && range.contains_major_minor(game))
    }

    fn name(&self) -> &'static str {
        "gras"
    }
}

/// "You're on your own": everything is compatible.
#[derive(Debug, Clone, Copy, Default)]
pub struct YoyoComparator;

impl GameComparator for YoyoComparator {
    fn compatible(&self, _: &GameVersion, _: &CkanModule) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "yoyo"
    }
}

/// Configurable choice of comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityMode {
    Strict,
    #[default]
    Gras,
    Yoyo,
}

impl CompatibilityMode {
    pub fn comparator(self) -> Arc<dyn GameComparator> {
        match self {
            Self::Strict => Arc::new(StrictComparator),
            Self::Gras => Arc::new(GrasComparator),
            Self::Yoyo => Arc::new(YoyoComparator),
        }
    }
}

impl FromStr for CompatibilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "gras" => Ok(Self::Gras),
            "yoyo" => Ok(Self::Yoyo),
            other => Err(format!("unknown compatibility mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(extra: &str) -> CkanModule {
        let doc = format!(
            r#"{{"identifier":"Test","version":"1","license":"MIT","download":"http://x"{extra}}}"#
        );
        CkanModule::from_json(&doc).unwrap()
    }

    fn results(m: &CkanModule) -> (bool, bool, bool) {
        let game = GameVersion::new(1, 0, 4);
        (
            StrictComparator.compatible(&game, m),
            GrasComparator.compatible(&game, m),
            YoyoComparator.compatible(&game, m),
        )
    }

    #[test]
    fn test_exact_match() {
        assert_eq!(results(&module(r#","ksp_version":"1.0.4""#)), (true, true, true));
    }

    #[test]
    fn test_patch_mismatch() {
        assert_eq!(results(&module(r#","ksp_version":"1.0.3""#)), (false, true, true));
    }

    #[test]
    fn test_patch_mismatch_strict() {
        let m = module(r#","ksp_version":"1.0.3","ksp_version_strict":true"#);
        assert_eq!(results(&m), (false, false, true));
    }

    #[test]
    fn test_old_release() {
        assert_eq!(results(&module(r#","ksp_version":"0.24.2""#)), (false, false, true));
    }

    #[test]
    fn test_undeclared_is_compatible() {
        assert_eq!(results(&module("")), (true, true, true));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("GRAS".parse::<CompatibilityMode>().unwrap(), CompatibilityMode::Gras);
        assert_eq!(CompatibilityMode::Strict.comparator().name(), "strict");
        assert!("lax".parse::<CompatibilityMode>().is_err());
    }
}
