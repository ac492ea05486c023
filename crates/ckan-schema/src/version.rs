//! Module versions.
//!
//! A [`Version`] is written `[epoch:]body`. Ordering compares the epoch
//! numerically, then walks the body one dot- or dash-delimited segment at a
//! time. Inside a segment, runs of digits compare numerically and everything
//! else compares lexically. When every segment ties, the raw string breaks the
//! tie so that `Eq`, `Ord` and `Hash` agree.
//!
//! Installed modules carry a [`ModuleVersion`], which adds the two sentinel
//! kinds that live outside the normal ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors raised while parsing or comparing versions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The input string is not a valid version.
    #[error("Malformed version: {0:?}")]
    Malformed(String),

    /// A strict ordering was requested against an autodetected or virtual version.
    #[error("Version {0} has no ordering")]
    NotComparable(String),
}

/// A parsed, totally ordered module version.
#[derive(Debug, Clone)]
pub struct Version {
    epoch: u32,
    body: String,
    raw: String,
}

impl Version {
    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::Malformed`] for empty input, input containing
    /// whitespace, a non-numeric epoch, or an empty body.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(VersionError::Malformed(s.to_string()));
        }

        let (epoch, body) = match s.split_once(':') {
            Some((epoch, body)) => {
                if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(VersionError::Malformed(s.to_string()));
                }
                let epoch = epoch
                    .parse()
                    .map_err(|_| VersionError::Malformed(s.to_string()))?;
                (epoch, body)
            }
            None => (0, s),
        };

        if body.is_empty() || body.contains(':') {
            return Err(VersionError::Malformed(s.to_string()));
        }

        Ok(Self {
            epoch,
            body: body.to_string(),
            raw: s.to_string(),
        })
    }

    /// The epoch prefix, zero when absent.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// The version without its epoch prefix.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// The string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.body.split(['.', '-'])
    }
}

/// One run of a version segment: all digits or no digits.
#[derive(Debug, PartialEq, Eq)]
enum Run<'a> {
    Number(&'a str),
    Text(&'a str),
}

fn runs(segment: &str) -> Vec<Run<'_>> {
    let mut out = Vec::new();
    let bytes = segment.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let digit = bytes[start].is_ascii_digit();
        let mut end = start + 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() == digit {
            end += 1;
        }
        let run = &segment[start..end];
        out.push(if digit { Run::Number(run) } else { Run::Text(run) });
        start = end;
    }
    out
}

fn compare_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let left = runs(a);
    let right = runs(b);
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l, r) {
            (Run::Number(x), Run::Number(y)) => compare_numbers(x, y),
            (Run::Text(x), Run::Text(y)) => x.cmp(y),
            (Run::Number(_), Run::Text(_)) => Ordering::Less,
            (Run::Text(_), Run::Number(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch.cmp(&other.epoch).then_with(|| {
            let mut left = self.segments();
            let mut right = other.segments();
            loop {
                match (left.next(), right.next()) {
                    (Some(l), Some(r)) => {
                        let ord = compare_segments(l, r);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    (Some(_), None) => return Ordering::Greater,
                    (None, Some(_)) => return Ordering::Less,
                    (None, None) => return self.raw.cmp(&other.raw),
                }
            }
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The version of an installed module.
///
/// Exactly one kind holds per installed entry. The two sentinel kinds always
/// satisfy version bounds and refuse strict ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleVersion {
    /// A version read from module metadata.
    Normal {
        /// The parsed version.
        version: Version,
    },
    /// A module found on disk with no matching metadata.
    Autodetected,
    /// An identifier that exists only because another module provides it.
    Virtual {
        /// Identifier of the installed module providing this one.
        provided_by: String,
    },
}

impl ModuleVersion {
    /// Wraps a normal version.
    pub fn normal(version: Version) -> Self {
        Self::Normal { version }
    }

    /// Returns the normal version, if this is one.
    pub fn as_normal(&self) -> Option<&Version> {
        match self {
            Self::Normal { version } => Some(version),
            Self::Autodetected | Self::Virtual { .. } => None,
        }
    }

    /// True for the autodetected sentinel.
    pub fn is_autodetected(&self) -> bool {
        matches!(self, Self::Autodetected)
    }

    /// Strict ordering between two module versions.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::NotComparable`] if either side is a sentinel.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering, VersionError> {
        match (self, other) {
            (Self::Normal { version: a }, Self::Normal { version: b }) => Ok(a.cmp(b)),
            (Self::Normal { .. }, sentinel) | (sentinel, _) => {
                Err(VersionError::NotComparable(sentinel.to_string()))
            }
        }
    }

    /// Inclusive bound check. Sentinels are always within bounds.
    pub fn within(&self, min: Option<&Version>, max: Option<&Version>) -> bool {
        match self {
            Self::Normal { version } => {
                min.is_none_or(|min| version >= min) && max.is_none_or(|max| version <= max)
            }
            Self::Autodetected | Self::Virtual { .. } => true,
        }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal { version } => write!(f, "{version}"),
            Self::Autodetected => f.write_str("autodetected"),
            Self::Virtual { provided_by } => write!(f, "provided by {provided_by}"),
        }
    }
}

impl From<Version> for ModuleVersion {
    fn from(version: Version) -> Self {
        Self::Normal { version }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_numeric_segments() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("1.0.1") > v("1.0"));
        assert!(v("2") > v("1.99.99"));
        assert!(v("0.23") < v("0.23.1"));
    }

    #[test]
    fn test_mixed_runs() {
        assert!(v("1.0a") > v("1.0"));
        assert!(v("1.0b") > v("1.0a"));
        assert!(v("v1.2") > v("v1.1"));
        assert!(v("1.2-rc2") < v("1.2-rc10"));
    }

    #[test]
    fn test_epoch_dominates() {
        assert!(v("1:0.1") > v("9.9"));
        assert!(v("2:0.1") > v("1:5.0"));
        assert_eq!(v("1:0.1").epoch(), 1);
        assert_eq!(v("1:0.1").body(), "0.1");
    }

    #[test]
    fn test_total_order_and_equality() {
        let samples = ["1.0", "1.00", "1.0.0", "1.0-beta", "v1", "1:1.0", "0.9"];
        for a in samples {
            for b in samples {
                let (a, b) = (v(a), v(b));
                let lt = a < b;
                let eq = a == b;
                let gt = a > b;
                assert_eq!(u8::from(lt) + u8::from(eq) + u8::from(gt), 1, "{a} vs {b}");
            }
        }
        assert_ne!(v("1.0"), v("1.00"));
    }

    #[test]
    fn test_round_trip() {
        for s in ["1.0", "1:2.3-beta", "v0.4.17", "2016.01.23"] {
            let parsed = v(s);
            assert_eq!(Version::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn test_malformed() {
        for s in ["", " 1.0", "1.0 beta", "x:1.0", ":1.0", "1:"] {
            assert!(
                matches!(Version::parse(s), Err(VersionError::Malformed(_))),
                "{s:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_sentinels_within_bounds() {
        let min = v("1.0");
        let max = v("2.0");
        assert!(ModuleVersion::Autodetected.within(Some(&min), Some(&max)));
        let virt = ModuleVersion::Virtual {
            provided_by: "Other".into(),
        };
        assert!(virt.within(Some(&min), Some(&max)));
        assert!(ModuleVersion::normal(v("1.5")).within(Some(&min), Some(&max)));
        assert!(ModuleVersion::normal(v("2.0")).within(Some(&min), Some(&max)));
        assert!(!ModuleVersion::normal(v("3")).within(Some(&min), Some(&max)));
    }

    #[test]
    fn test_sentinels_not_comparable() {
        let normal = ModuleVersion::normal(v("1.0"));
        assert!(matches!(
            normal.try_cmp(&ModuleVersion::Autodetected),
            Err(VersionError::NotComparable(_))
        ));
        assert!(matches!(
            ModuleVersion::Autodetected.try_cmp(&normal),
            Err(VersionError::NotComparable(_))
        ));
        assert_eq!(
            normal.try_cmp(&ModuleVersion::normal(v("0.9"))).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_module_version_serde() {
        let json = serde_json::to_string(&ModuleVersion::normal(v("1.2"))).unwrap();
        assert_eq!(json, r#"{"kind":"normal","version":"1.2"}"#);
        let back: ModuleVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ModuleVersion::normal(v("1.2")));
    }
}
