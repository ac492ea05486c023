//! Install stanzas: rules mapping archive contents onto the game directory.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MetadataError;

/// How a stanza locates its root inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// A literal archive path, matched case-insensitively.
    File(String),
    /// A directory (or file) name searched for anywhere in the archive.
    Find(String),
}

/// Fixed set of destination roots a stanza may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstallTarget {
    /// `GameData`, where plugins live.
    GameData,
    /// `Ships`.
    Ships,
    /// `Ships/VAB`.
    ShipsVAB,
    /// `Ships/SPH`.
    ShipsSPH,
    /// `Ships/@thumbs`.
    ShipsThumbs,
    /// `Ships/@thumbs/VAB`.
    ShipsThumbsVAB,
    /// `Ships/@thumbs/SPH`.
    ShipsThumbsSPH,
    /// Training saves.
    Tutorial,
    /// Scenario saves.
    Scenarios,
}

impl InstallTarget {
    /// Every target root.
    pub const ALL: [Self; 9] = [
        Self::GameData,
        Self::Ships,
        Self::ShipsVAB,
        Self::ShipsSPH,
        Self::ShipsThumbs,
        Self::ShipsThumbsVAB,
        Self::ShipsThumbsSPH,
        Self::Tutorial,
        Self::Scenarios,
    ];

    /// Directory of this root relative to the game directory, `/`-separated.
    pub fn relative_path(self) -> &'static str {
        match self {
            Self::GameData => "GameData",
            Self::Ships => "Ships",
            Self::ShipsVAB => "Ships/VAB",
            Self::ShipsSPH => "Ships/SPH",
            Self::ShipsThumbs => "Ships/@thumbs",
            Self::ShipsThumbsVAB => "Ships/@thumbs/VAB",
            Self::ShipsThumbsSPH => "Ships/@thumbs/SPH",
            Self::Tutorial => "saves/training",
            Self::Scenarios => "saves/scenarios",
        }
    }

    fn from_install_to(s: &str) -> Option<Self> {
        Some(match s {
            "GameData" => Self::GameData,
            "Ships" => Self::Ships,
            "Ships/VAB" => Self::ShipsVAB,
            "Ships/SPH" => Self::ShipsSPH,
            "Ships/@thumbs" => Self::ShipsThumbs,
            "Ships/@thumbs/VAB" => Self::ShipsThumbsVAB,
            "Ships/@thumbs/SPH" => Self::ShipsThumbsSPH,
            "Tutorial" => Self::Tutorial,
            "Scenarios" => Self::Scenarios,
            _ => return None,
        })
    }
}

/// A parsed `install_to` value: a target root plus an optional `GameData` subdirectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLocation {
    /// The target root.
    pub target: InstallTarget,
    /// Subdirectory below `GameData`, `/`-separated.
    pub subdir: Option<String>,
}

impl InstallLocation {
    /// Parses an `install_to` string, accepting `\` as a separator.
    ///
    /// Returns `None` for anything outside the recognised roots, including
    /// `GameRoot` and subdirectories containing `.` or `..` segments.
    pub fn parse(install_to: &str) -> Option<Self> {
        let normalized = install_to.replace('\\', "/");
        let normalized = normalized.trim_end_matches('/');

        if let Some(target) = InstallTarget::from_install_to(normalized) {
            return Some(Self {
                target,
                subdir: None,
            });
        }

        let subdir = normalized.strip_prefix("GameData/")?;
        let valid = subdir
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
        valid.then(|| Self {
            target: InstallTarget::GameData,
            subdir: Some(subdir.to_string()),
        })
    }

    /// Destination directory relative to the game directory.
    pub fn relative_path(&self) -> String {
        match &self.subdir {
            Some(subdir) => format!("{}/{subdir}", self.target.relative_path()),
            None => self.target.relative_path().to_string(),
        }
    }
}

impl fmt::Display for InstallLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// One install stanza of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallDescriptor {
    /// Where the stanza's root is in the archive.
    pub source: InstallSource,
    /// Raw `install_to` value, validated when the stanza is applied.
    pub install_to: String,
    /// Replacement name for the located root.
    pub as_name: Option<String>,
    /// Path components to exclude.
    pub filter: Vec<String>,
    /// Regexes over the archive path to exclude.
    pub filter_regexp: Vec<String>,
    /// Path components to keep; everything else is dropped.
    pub include_only: Vec<String>,
    /// Regexes over the archive path to keep.
    pub include_only_regexp: Vec<String>,
    /// Whether `find` may match a file as well as a directory.
    pub find_matches_files: bool,
}

impl InstallDescriptor {
    /// The stanza used for modules that declare none: find the directory
    /// named after the identifier and install it into `GameData`.
    pub fn default_for(identifier: &str) -> Self {
        Self {
            source: InstallSource::Find(identifier.to_string()),
            install_to: "GameData".to_string(),
            as_name: None,
            filter: Vec::new(),
            filter_regexp: Vec::new(),
            include_only: Vec::new(),
            include_only_regexp: Vec::new(),
            find_matches_files: false,
        }
    }

    /// True if any include or exclude filter is set.
    pub fn has_filters(&self) -> bool {
        !(self.filter.is_empty()
            && self.filter_regexp.is_empty()
            && self.include_only.is_empty()
            && self.include_only_regexp.is_empty())
    }
}

/// Accepts either a single string or a list of strings.
pub(crate) fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Wire shape of an install stanza.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RawInstallDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    find: Option<String>,
    install_to: String,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    as_name: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    filter: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    filter_regexp: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    include_only: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    include_only_regexp: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    find_matches_files: bool,
}

impl TryFrom<RawInstallDescriptor> for InstallDescriptor {
    type Error = MetadataError;

    fn try_from(raw: RawInstallDescriptor) -> Result<Self, Self::Error> {
        let source = match (raw.file, raw.find) {
            (Some(file), None) => InstallSource::File(file),
            (None, Some(find)) => InstallSource::Find(find),
            (Some(_), Some(_)) => {
                return Err(MetadataError::Invalid(
                    "install stanza sets both `file` and `find`".into(),
                ));
            }
            (None, None) => {
                return Err(MetadataError::Invalid(
                    "install stanza needs one of `file` or `find`".into(),
                ));
            }
        };
        Ok(Self {
            source,
            install_to: raw.install_to,
            as_name: raw.as_name,
            filter: raw.filter,
            filter_regexp: raw.filter_regexp,
            include_only: raw.include_only,
            include_only_regexp: raw.include_only_regexp,
            find_matches_files: raw.find_matches_files,
        })
    }
}

impl From<InstallDescriptor> for RawInstallDescriptor {
    fn from(desc: InstallDescriptor) -> Self {
        let (file, find) = match desc.source {
            InstallSource::File(file) => (Some(file), None),
            InstallSource::Find(find) => (None, Some(find)),
        };
        Self {
            file,
            find,
            install_to: desc.install_to,
            as_name: desc.as_name,
            filter: desc.filter,
            filter_regexp: desc.filter_regexp,
            include_only: desc.include_only,
            include_only_regexp: desc.include_only_regexp,
            find_matches_files: desc.find_matches_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_stanza(json: &str) -> Result<InstallDescriptor, MetadataError> {
        let raw: RawInstallDescriptor = serde_json::from_str(json).unwrap();
        InstallDescriptor::try_from(raw)
    }

    #[test]
    fn test_install_location_roots() {
        for target in InstallTarget::ALL {
            let name = match target {
                InstallTarget::Tutorial => "Tutorial",
                InstallTarget::Scenarios => "Scenarios",
                other => other.relative_path(),
            };
            let loc = InstallLocation::parse(name).unwrap();
            assert_eq!(loc.target, target);
            assert_eq!(loc.subdir, None);
        }
        assert_eq!(
            InstallLocation::parse("Scenarios").unwrap().relative_path(),
            "saves/scenarios"
        );
    }

    #[test]
    fn test_install_location_gamedata_subdir() {
        let loc = InstallLocation::parse("GameData\\SuchTest/").unwrap();
        assert_eq!(loc.subdir.as_deref(), Some("SuchTest"));
        assert_eq!(loc.relative_path(), "GameData/SuchTest");
    }

    #[test]
    fn test_install_location_rejects() {
        for bad in [
            "GameDataIsTheBestData",
            "Shups",
            "GameData/../../../../etc/pwned",
            "Ships/Foo",
            "GameRoot/saves",
            "GameRoot/CKAN",
            "GameData/..",
            "GameData\\..\\..\\etc\\pwned",
            "GameRoot",
            "",
        ] {
            assert!(InstallLocation::parse(bad).is_none(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_stanza_file_xor_find() {
        assert!(parse_stanza(r#"{"file":"a","find":"b","install_to":"GameData"}"#).is_err());
        assert!(parse_stanza(r#"{"install_to":"GameData"}"#).is_err());
        let ok = parse_stanza(r#"{"find":"kOS","install_to":"GameData","filter":"Thumbs.db"}"#)
            .unwrap();
        assert_eq!(ok.source, InstallSource::Find("kOS".into()));
        assert_eq!(ok.filter, vec!["Thumbs.db".to_string()]);
        assert!(ok.has_filters());
    }

    #[test]
    fn test_filter_order_is_significant() {
        let a = parse_stanza(r#"{"file":"x","install_to":"GameData","filter":["a","b"]}"#).unwrap();
        let b = parse_stanza(r#"{"file":"x","install_to":"GameData","filter":["b","a"]}"#).unwrap();
        assert_ne!(a, b);
    }
}
