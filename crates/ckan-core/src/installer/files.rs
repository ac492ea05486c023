//! Mapping archive entries to destinations under a game directory.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use ckan_schema::{CkanModule, InstallDescriptor, InstallLocation, InstallSource};
use regex::Regex;
use tracing::debug;
use zip::ZipArchive;

use super::InstallError;
use crate::game::GameInstance;

/// Entries no module ever wants on disk.
const JUNK: [&str; 3] = ["__MACOSX", ".DS_Store", "Thumbs.db"];

/// An archive entry paired with where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallableFile {
    /// Entry name inside the archive, `/`-separated.
    pub source: String,
    /// Absolute destination, or `None` when no game is bound.
    pub destination: Option<PathBuf>,
    /// Destination relative to the game root.
    pub relative: String,
    /// Directory entry: create, don't copy.
    pub makedir: bool,
    pub(crate) index: usize,
}

#[derive(Debug)]
struct Entry {
    name: String,
    index: usize,
    is_dir: bool,
}

fn normalize_entry_name(name: &str) -> String {
    name.replace('\\', "/").trim_end_matches('/').to_string()
}

fn list_entries<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Vec<Entry>, InstallError> {
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        let name = normalize_entry_name(entry.name());
        if name.is_empty() {
            continue;
        }
        entries.push(Entry {
            name,
            index,
            is_dir: entry.is_dir(),
        });
    }
    Ok(entries)
}

/// Resolves every file `module` installs from the zip at `archive_path`.
///
/// Works without a game instance for inspection; destinations are then `None`
/// but install locations are still validated.
///
/// # Errors
///
/// - [`InstallError::BadInstallLocation`] for an unknown target or a path escaping it.
/// - [`InstallError::FileNotFound`] when a stanza matches nothing or is ambiguous.
/// - [`InstallError::InvalidFilter`] for a bad filter regex.
pub fn find_installable_files(
    module: &CkanModule,
    archive_path: &Path,
    game: Option<&GameInstance>,
) -> Result<Vec<InstallableFile>, InstallError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let entries = list_entries(&mut archive)?;

    let mut files = Vec::new();
    for stanza in module.install_stanzas().iter() {
        files.extend(stanza_files(&module.identifier, stanza, &entries, game)?);
    }
    debug!(module = %module, count = files.len(), "Found installable files");
    Ok(files)
}

fn stanza_files(
    identifier: &str,
    stanza: &InstallDescriptor,
    entries: &[Entry],
    game: Option<&GameInstance>,
) -> Result<Vec<InstallableFile>, InstallError> {
    let bad_location = || InstallError::BadInstallLocation {
        identifier: identifier.to_string(),
        path: stanza.install_to.clone(),
    };
    let location = InstallLocation::parse(&stanza.install_to).ok_or_else(bad_location)?;
    let install_dir = location.relative_path();

    let root = match &stanza.source {
        InstallSource::File(file) => locate_file(identifier, file, entries)?,
        InstallSource::Find(name) => locate_find(identifier, name, entries, stanza.find_matches_files)?,
    };

    let filters = Filters::new(stanza)?;
    let prefix = format!("{root}/");
    let mut out = Vec::new();
    for entry in entries {
        if entry.name != root && !entry.name.starts_with(&prefix) {
            continue;
        }
        if !filters.wanted(&entry.name, entry.is_dir) {
            continue;
        }

        let relative =
            transform_output_name(&root, &entry.name, &install_dir, stanza.as_name.as_deref())?;
        if relative == install_dir {
            continue;
        }
        if !stays_within(&relative, &install_dir) {
            return Err(InstallError::BadInstallLocation {
                identifier: identifier.to_string(),
                path: relative,
            });
        }

        out.push(InstallableFile {
            source: entry.name.clone(),
            destination: game.map(|g| g.to_absolute(&relative)),
            relative,
            makedir: entry.is_dir,
            index: entry.index,
        });
    }

    if out.iter().all(|f| f.makedir) {
        return Err(InstallError::FileNotFound {
            identifier: identifier.to_string(),
            detail: format!("no files to install from {root}"),
        });
    }
    Ok(out)
}

/// Actual-case archive path for a `file` stanza, matched case-insensitively.
fn locate_file(identifier: &str, file: &str, entries: &[Entry]) -> Result<String, InstallError> {
    let wanted = normalize_entry_name(file).to_ascii_lowercase();
    let prefix = format!("{wanted}/");
    entries
        .iter()
        .find_map(|e| {
            let lower = e.name.to_ascii_lowercase();
            (lower == wanted || lower.starts_with(&prefix)).then(|| e.name[..wanted.len()].to_string())
        })
        .ok_or_else(|| InstallError::FileNotFound {
            identifier: identifier.to_string(),
            detail: file.to_string(),
        })
}

/// Shallowest directory (or file, if allowed) named `name`.
fn locate_find(
    identifier: &str,
    name: &str,
    entries: &[Entry],
    match_files: bool,
) -> Result<String, InstallError> {
    let mut candidates: Vec<&str> = Vec::new();
    for entry in entries {
        let path = entry.name.as_str();
        // Zips often omit directory entries, so every ancestor counts as a directory.
        let mut dirs: Vec<&str> = path.match_indices('/').map(|(i, _)| &path[..i]).collect();
        if entry.is_dir || match_files {
            dirs.push(path);
        }
        for dir in dirs {
            let last = dir.rsplit('/').next().unwrap_or(dir);
            if last.eq_ignore_ascii_case(name) && !candidates.contains(&dir) {
                candidates.push(dir);
            }
        }
    }

    let not_found = |detail: String| InstallError::FileNotFound {
        identifier: identifier.to_string(),
        detail,
    };
    let depth = |p: &str| p.matches('/').count();
    let shallowest = candidates
        .iter()
        .map(|c| depth(c))
        .min()
        .ok_or_else(|| not_found(name.to_string()))?;
    let top: Vec<&str> = candidates
        .into_iter()
        .filter(|c| depth(c) == shallowest)
        .collect();
    match top.as_slice() {
        [only] => Ok((*only).to_string()),
        _ => Err(not_found(format!("{name} is ambiguous: {}", top.join(", ")))),
    }
}

struct Filters {
    exclude: Vec<String>,
    exclude_regex: Vec<Regex>,
    include: Vec<String>,
    include_regex: Vec<Regex>,
}

impl Filters {
    fn new(stanza: &InstallDescriptor) -> Result<Self, InstallError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            exclude: stanza.filter.iter().map(|f| f.to_lowercase()).collect(),
            exclude_regex: compile(&stanza.filter_regexp)?,
            include: stanza.include_only.iter().map(|f| f.to_lowercase()).collect(),
            include_regex: compile(&stanza.include_only_regexp)?,
        })
    }

    fn wanted(&self, path: &str, is_dir: bool) -> bool {
        let components: Vec<String> = path.split('/').map(str::to_lowercase).collect();
        let named = |list: &[String]| components.iter().any(|c| list.contains(c));

        if JUNK.iter().any(|j| components.iter().any(|c| c.eq_ignore_ascii_case(j))) {
            return false;
        }
        if named(&self.exclude) || self.exclude_regex.iter().any(|r| r.is_match(path)) {
            return false;
        }
        if self.include.is_empty() && self.include_regex.is_empty() {
            return true;
        }
        !is_dir && (named(&self.include) || self.include_regex.iter().any(|r| r.is_match(path)))
    }
}

/// Destination of `output_name` (an archive path under `file`) relative to the game root.
///
/// The leading path of `file` is dropped so its last component lands in
/// `install_dir`, renamed to `as_name` when given. A `file` that is itself
/// `GameData` or `Ships` is dropped entirely, and then cannot be renamed.
///
/// # Errors
///
/// [`InstallError::InvalidMetadata`] if `as_name` contains a path separator or
/// is used with a bare `GameData`/`Ships` root.
pub fn transform_output_name(
    file: &str,
    output_name: &str,
    install_dir: &str,
    as_name: Option<&str>,
) -> Result<String, InstallError> {
    let file = file.trim_end_matches('/');
    let leading = file.rfind('/').map_or("", |i| &file[..=i]);
    let mut rest = output_name.strip_prefix(leading).unwrap_or(output_name);

    let last = &file[leading.len()..];
    let whole_root = last.eq_ignore_ascii_case("GameData") || last.eq_ignore_ascii_case("Ships");
    if whole_root {
        if as_name.is_some() {
            return Err(InstallError::InvalidMetadata(format!(
                "cannot rename {file} with 'as'"
            )));
        }
        rest = rest.get(last.len()..).unwrap_or("").trim_start_matches('/');
    }

    let renamed;
    if let Some(name) = as_name {
        if name.contains('/') || name.contains('\\') {
            return Err(InstallError::InvalidMetadata(format!(
                "'as' must be a plain name, got {name}"
            )));
        }
        let tail = rest.get(last.len()..).unwrap_or("");
        renamed = format!("{name}{tail}");
        rest = &renamed;
    }

    let install_dir = install_dir.trim_end_matches('/');
    Ok(if rest.is_empty() {
        install_dir.to_string()
    } else {
        format!("{install_dir}/{rest}")
    })
}

/// Lexically normalizes `relative` and checks it is `root` or below it.
fn stays_within(relative: &str, root: &str) -> bool {
    let mut parts: Vec<&str> = Vec::new();
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return false;
                }
            }
            other => parts.push(other),
        }
    }
    let root: Vec<&str> = root.split('/').filter(|p| !p.is_empty()).collect();
    parts.len() >= root.len() && parts[..root.len()] == root[..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[&str]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for name in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(name.as_bytes()).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn doge_zip(dir: &Path) -> PathBuf {
        let path = dir.join("doge.zip");
        write_zip(
            &path,
            &[
                "DogeCoinFlag-1.01/",
                "DogeCoinFlag-1.01/GameData/DogeCoinFlag/Flags/dogecoin.png",
                "DogeCoinFlag-1.01/GameData/DogeCoinFlag/Flags/README.md",
                "DogeCoinFlag-1.01/GameData/DogeCoinFlag/README.md",
                "DogeCoinFlag-1.01/GameData/DogeCoinFlag/notes.txt.bak",
                "DogeCoinFlag-1.01/GameData/DogeCoinFlag/.DS_Store",
                "DogeCoinFlag-1.01/README.md",
            ],
        );
        path
    }

    fn module(install: &str) -> CkanModule {
        let doc = format!(
            r#"{{"identifier":"DogeCoinFlag","version":"1.01","license":"CC-BY","download":"http://x/doge.zip"{install}}}"#
        );
        CkanModule::from_json(&doc).unwrap()
    }

    fn sources(files: &[InstallableFile]) -> Vec<&str> {
        files.iter().map(|f| f.source.as_str()).collect()
    }

    #[test]
    fn test_transform_output_name() {
        let cases = [
            ("GameData/kOS", "GameData/kOS/Plugins/kOS.dll", "GameData", None, "GameData/kOS/Plugins/kOS.dll"),
            ("kOS-1.1/GameData/kOS", "kOS-1.1/GameData/kOS/Plugins/kOS.dll", "GameData", None, "GameData/kOS/Plugins/kOS.dll"),
            ("ModuleManager.2.5.1.dll", "ModuleManager.2.5.1.dll", "GameData", None, "GameData/ModuleManager.2.5.1.dll"),
            ("Ships", "Ships/SPH/FAR Firehound.craft", "SomeDir/Ships", None, "SomeDir/Ships/SPH/FAR Firehound.craft"),
            ("GameData/kOS", "GameData/kOS/Plugins/kOS.dll", "GameData", Some("kOS-Renamed"), "GameData/kOS-Renamed/Plugins/kOS.dll"),
            ("kOS-1.1/GameData/kOS", "kOS-1.1/GameData/kOS/Plugins/kOS.dll", "GameData", Some("kOS-Renamed"), "GameData/kOS-Renamed/Plugins/kOS.dll"),
            ("ModuleManager.2.5.1.dll", "ModuleManager.2.5.1.dll", "GameData", Some("ModuleManager-Renamed.dll"), "GameData/ModuleManager-Renamed.dll"),
        ];
        for (file, output, dir, as_name, expected) in cases {
            assert_eq!(transform_output_name(file, output, dir, as_name).unwrap(), expected, "{file}");
        }
    }

    #[test]
    fn test_transform_output_name_rejects() {
        let cases = [
            ("GameData", "GameData/kOS/Plugins/kOS.dll", "GameData", "GameData-Renamed"),
            ("Ships", "Ships/SPH/FAR Firehound.craft", "SomeDir/Ships", "Ships-Renamed"),
            ("GameData/kOS", "GameData/kOS/Plugins/kOS.dll", "GameData", "kOS/Renamed"),
            ("kOS-1.1/GameData/kOS", "kOS-1.1/GameData/kOS/Plugins/kOS.dll", "GameData", "kOS/Renamed"),
            ("ModuleManager.2.5.1.dll", "ModuleManager.2.5.1.dll", "GameData", "Renamed/ModuleManager.dll"),
        ];
        for (file, output, dir, as_name) in cases {
            assert!(transform_output_name(file, output, dir, Some(as_name)).is_err(), "{file} as {as_name}");
        }
    }

    #[test]
    fn test_bare_gamedata_is_stripped() {
        assert_eq!(
            transform_output_name("GameData", "GameData/kOS/Plugins/kOS.dll", "GameData", None).unwrap(),
            "GameData/kOS/Plugins/kOS.dll"
        );
    }

    #[test]
    fn test_find_default_stanza_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let zip = doge_zip(dir.path());
        let mut m = module("");
        m.identifier = "DogecoinFlag".to_string();

        let files = find_installable_files(&m, &zip, None).unwrap();
        let found = sources(&files);
        assert!(found.contains(&"DogeCoinFlag-1.01/GameData/DogeCoinFlag/Flags/dogecoin.png"));
        assert!(!found.contains(&"DogeCoinFlag-1.01/README.md"));
        assert!(!found.iter().any(|s| s.ends_with(".DS_Store")));
        assert!(files.iter().all(|f| f.destination.is_none()));
        assert!(files.iter().any(|f| f.relative == "GameData/DogeCoinFlag/Flags/dogecoin.png"));
    }

    #[test]
    fn test_filters() {
        let dir = tempfile::tempdir().unwrap();
        let zip = doge_zip(dir.path());
        let m = module(
            r#","install":[{"find":"DogeCoinFlag","install_to":"GameData","filter":"README.md","filter_regexp":"\\.bak$"}]"#,
        );
        let files = find_installable_files(&m, &zip, None).unwrap();
        let found = sources(&files);
        assert!(found.contains(&"DogeCoinFlag-1.01/GameData/DogeCoinFlag/Flags/dogecoin.png"));
        assert!(!found.iter().any(|s| s.ends_with("README.md")));
        assert!(!found.iter().any(|s| s.ends_with(".bak")));
    }

    #[test]
    fn test_include_only() {
        let dir = tempfile::tempdir().unwrap();
        let zip = doge_zip(dir.path());
        let m = module(
            r#","install":[{"find":"DogeCoinFlag","install_to":"GameData","include_only_regexp":"\\.png$"}]"#,
        );
        let files = find_installable_files(&m, &zip, None).unwrap();
        assert_eq!(
            sources(&files),
            vec!["DogeCoinFlag-1.01/GameData/DogeCoinFlag/Flags/dogecoin.png"]
        );
    }

    #[test]
    fn test_file_stanza_with_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let zip = doge_zip(dir.path());
        for install_to in ["GameData/SuchTest", "GameData\\\\SuchTest\\\\", "GameData/SuchTest/"] {
            let m = module(&format!(
                r#","install":[{{"file":"dogecoinflag-1.01/GameData/DogeCoinFlag","install_to":"{install_to}"}}]"#
            ));
            let files = find_installable_files(&m, &zip, None).unwrap();
            assert!(
                files
                    .iter()
                    .any(|f| f.relative == "GameData/SuchTest/DogeCoinFlag/Flags/dogecoin.png"),
                "{install_to}"
            );
        }
    }

    #[test]
    fn test_missing_file_and_ambiguous_find() {
        let dir = tempfile::tempdir().unwrap();
        let zip = doge_zip(dir.path());
        let m = module(r#","install":[{"file":"NoSuchDir","install_to":"GameData"}]"#);
        assert!(matches!(
            find_installable_files(&m, &zip, None),
            Err(InstallError::FileNotFound { .. })
        ));

        let twins = dir.path().join("twins.zip");
        write_zip(&twins, &["a/Plugin/x.dll", "b/Plugin/y.dll"]);
        let m = module(r#","install":[{"find":"Plugin","install_to":"GameData"}]"#);
        assert!(matches!(
            find_installable_files(&m, &twins, None),
            Err(InstallError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_bad_targets() {
        let dir = tempfile::tempdir().unwrap();
        let zip = doge_zip(dir.path());
        for target in [
            "GameDataIsTheBestData",
            "Shups",
            "GameData/../../../../etc/pwned",
            "Ships/Foo",
            "GameRoot/saves",
            "GameData/..",
            "GameData\\\\..\\\\..\\\\etc\\\\pwned",
        ] {
            let m = module(&format!(
                r#","install":[{{"find":"DogeCoinFlag","install_to":"{target}"}}]"#
            ));
            assert!(
                matches!(
                    find_installable_files(&m, &zip, None),
                    Err(InstallError::BadInstallLocation { .. })
                ),
                "{target}"
            );
        }
    }

    #[test]
    fn test_entry_escaping_root() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("slip.zip");
        write_zip(&zip, &["Evil/../../../outside.txt", "Evil/ok.txt"]);
        let m = module(r#","install":[{"file":"Evil","install_to":"GameData"}]"#);
        assert!(matches!(
            find_installable_files(&m, &zip, None),
            Err(InstallError::BadInstallLocation { .. })
        ));
    }

    #[test]
    fn test_stays_within() {
        assert!(stays_within("GameData/a/b", "GameData"));
        assert!(stays_within("GameData/a/../b", "GameData"));
        assert!(!stays_within("GameData/../etc", "GameData"));
        assert!(!stays_within("Ships/../GameData/x", "Ships/VAB"));
    }
}
