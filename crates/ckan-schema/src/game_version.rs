//! Game versions and the compatibility ranges modules declare against them.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::version::VersionError;

/// A game version with up to four numeric components.
///
/// Missing trailing components act as wildcards, so `1.0` stands for every
/// `1.0.x` release. A version with no components at all is "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GameVersion {
    parts: [Option<u32>; 4],
}

impl GameVersion {
    /// The wildcard version matching every release.
    pub const fn any() -> Self {
        Self { parts: [None; 4] }
    }

    /// A fully specified `major.minor.patch` version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            parts: [Some(major), Some(minor), Some(patch), None],
        }
    }

    /// Parses `any` or a dotted version of one to four numeric components.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::Malformed`] for anything else.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let malformed = || VersionError::Malformed(s.to_string());
        if s.eq_ignore_ascii_case("any") {
            return Ok(Self::any());
        }
        let mut parts = [None; 4];
        let mut count = 0;
        for piece in s.split('.') {
            if count == parts.len() || piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            parts[count] = Some(piece.parse().map_err(|_| malformed())?);
            count += 1;
        }
        Ok(Self { parts })
    }

    /// True when no component is specified.
    pub fn is_any(&self) -> bool {
        self.parts[0].is_none()
    }

    /// Major component, if specified.
    pub fn major(&self) -> Option<u32> {
        self.parts[0]
    }

    /// Minor component, if specified.
    pub fn minor(&self) -> Option<u32> {
        self.parts[1]
    }

    /// Patch component, if specified.
    pub fn patch(&self) -> Option<u32> {
        self.parts[2]
    }

    /// The same version truncated to `major.minor`.
    pub fn major_minor(&self) -> Self {
        Self {
            parts: [self.parts[0], self.parts[1], None, None],
        }
    }

    /// Compares `self` (a concrete version) against a bound.
    ///
    /// Components the bound leaves out are ignored; components `self` leaves
    /// out count as zero.
    fn cmp_to_bound(&self, bound: &Self) -> Ordering {
        for (mine, theirs) in self.parts.iter().zip(bound.parts.iter()) {
            let Some(theirs) = theirs else {
                return Ordering::Equal;
            };
            let ord = mine.unwrap_or(0).cmp(theirs);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return f.write_str("any");
        }
        let mut first = true;
        for part in self.parts.iter().flatten() {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for GameVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for GameVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GameVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The game versions a module declares itself compatible with.
///
/// Both bounds are inclusive; a missing bound is open. An exact declaration
/// is stored as equal bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameVersionRange {
    min: Option<GameVersion>,
    max: Option<GameVersion>,
    strict: bool,
}

impl GameVersionRange {
    /// A range open at both ends.
    pub const fn unbounded() -> Self {
        Self {
            min: None,
            max: None,
            strict: false,
        }
    }

    /// A range covering a single (possibly wildcarded) game version.
    pub fn exact(version: GameVersion) -> Self {
        Self::between(Some(version), Some(version))
    }

    /// A range between two optional inclusive bounds. `any` bounds are open.
    pub fn between(min: Option<GameVersion>, max: Option<GameVersion>) -> Self {
        Self {
            min: min.filter(|v| !v.is_any()),
            max: max.filter(|v| !v.is_any()),
            strict: false,
        }
    }

    /// Sets the flag that disables fuzzy matching.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Lower bound, if any.
    pub fn min(&self) -> Option<GameVersion> {
        self.min
    }

    /// Upper bound, if any.
    pub fn max(&self) -> Option<GameVersion> {
        self.max
    }

    /// True when the module asked for strict matching.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// True when both bounds are equal, i.e. the module named one version.
    pub fn is_exact(&self) -> bool {
        self.min.is_some() && self.min == self.max
    }

    /// True when the module places no constraint on the game version.
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Exact containment of a game version in this range.
    pub fn contains(&self, game: &GameVersion) -> bool {
        if game.is_any() {
            return true;
        }
        self.min.is_none_or(|min| game.cmp_to_bound(&min) != Ordering::Less)
            && self.max.is_none_or(|max| game.cmp_to_bound(&max) != Ordering::Greater)
    }

    /// Containment ignoring patch and build components on both sides.
    pub fn contains_major_minor(&self, game: &GameVersion) -> bool {
        let widened = Self {
            min: self.min.map(|v| v.major_minor()),
            max: self.max.map(|v| v.major_minor()),
            strict: self.strict,
        };
        widened.contains(&game.major_minor())
    }
}

impl fmt::Display for GameVersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (None, None) => f.write_str("any"),
            (Some(min), Some(max)) if min == max => write!(f, "{min}"),
            (Some(min), Some(max)) => write!(f, "{min}-{max}"),
            (Some(min), None) => write!(f, "{min}+"),
            (None, Some(max)) => write!(f, "up to {max}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gv(s: &str) -> GameVersion {
        GameVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(gv("1.0.4").to_string(), "1.0.4");
        assert_eq!(gv("1.1").to_string(), "1.1");
        assert!(gv("any").is_any());
        assert_eq!(GameVersion::any().to_string(), "any");
        assert!(GameVersion::parse("1.x").is_err());
        assert!(GameVersion::parse("1..2").is_err());
        assert!(GameVersion::parse("1.2.3.4.5").is_err());
    }

    #[test]
    fn test_exact_range_with_wildcard() {
        let range = GameVersionRange::exact(gv("1.0"));
        assert!(range.contains(&gv("1.0.4")));
        assert!(range.contains(&gv("1.0.0")));
        assert!(!range.contains(&gv("1.1.0")));
    }

    #[test]
    fn test_min_max_inclusive() {
        let range = GameVersionRange::between(Some(gv("1.0.2")), Some(gv("1.1")));
        assert!(range.contains(&gv("1.0.2")));
        assert!(range.contains(&gv("1.1.3")));
        assert!(!range.contains(&gv("1.0.1")));
        assert!(!range.contains(&gv("1.2.0")));
    }

    #[test]
    fn test_unbounded_and_any_game() {
        assert!(GameVersionRange::unbounded().contains(&gv("0.90.0")));
        let range = GameVersionRange::exact(gv("0.25"));
        assert!(range.contains(&GameVersion::any()));
    }

    #[test]
    fn test_major_minor_match() {
        let range = GameVersionRange::exact(gv("1.0.3"));
        assert!(!range.contains(&gv("1.0.4")));
        assert!(range.contains_major_minor(&gv("1.0.4")));
        assert!(!range.contains_major_minor(&gv("1.1.0")));
    }
}
