use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use ckan_core::comparator::GrasComparator;
use ckan_core::installer::{InstallError, InstallOptions, OverwriteMode};
use ckan_core::io::download::NetAsyncDownloader;
use ckan_core::{GameInstance, ModuleInstaller, NetFileCache, NullReporter, Registry};
use ckan_schema::{CkanModule, GameVersion, ModuleVersion};
use tempfile::TempDir;
use walkdir::WalkDir;

struct Fixture {
    _dir: TempDir,
    game: GameInstance,
    cache: NetFileCache,
    downloader: NetAsyncDownloader,
    registry: Registry,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("KSP");
        fs::create_dir_all(root.join("GameData/Squad")).unwrap();
        fs::write(root.join("GameData/Squad/stock.cfg"), b"stock").unwrap();
        fs::write(root.join("readme.txt"), b"game").unwrap();

        let game = GameInstance::new(&root, GameVersion::parse("1.0.4").unwrap()).unwrap();
        let cache = NetFileCache::new(game.download_cache_dir()).unwrap();
        let downloader = NetAsyncDownloader::new(Arc::new(NullReporter));
        Self {
            _dir: dir,
            game,
            cache,
            downloader,
            registry: Registry::empty(),
        }
    }

    fn installer(&self) -> ModuleInstaller<'_> {
        ModuleInstaller::new(
            &self.game,
            &self.cache,
            &self.downloader,
            Arc::new(NullReporter),
            Arc::new(GrasComparator),
        )
    }

    /// Registers `json` as available with its archive already cached.
    fn publish(&mut self, json: &str, files: &[(&str, &[u8])]) -> CkanModule {
        let module = CkanModule::from_json(json).unwrap();
        let zip_path = self.game.temp_dir().join(format!("{}.zip", module.identifier));
        let mut zip = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
        for (name, body) in files {
            zip.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
        self.cache
            .store(&module.download, &zip_path, Some(&module.standard_name()), true)
            .unwrap();
        self.registry.add_available(module.clone());
        module
    }

    /// Every path under the game root outside `CKAN/`, with file contents.
    fn snapshot(&self) -> BTreeMap<String, Option<Vec<u8>>> {
        WalkDir::new(self.game.root())
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.file_name() != "CKAN")
            .map(|e| {
                let e = e.unwrap();
                let rel = self.game.to_relative(e.path()).unwrap();
                let body = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
                (rel, body)
            })
            .collect()
    }
}

fn binary_payload() -> Vec<u8> {
    (0..=255u8).cycle().take(4096).collect()
}

fn foo_json(version: &str) -> String {
    format!(
        r#"{{
            "spec_version": 1,
            "identifier": "Foo",
            "version": "{version}",
            "license": "MIT",
            "download": "https://example.invalid/Foo-{version}.zip",
            "install": [
                {{"find": "Foo", "install_to": "GameData"}},
                {{"file": "Foo-{version}/Ships/VAB/Foo.craft", "install_to": "Ships/VAB"}}
            ]
        }}"#
    )
}

fn publish_foo(fx: &mut Fixture, version: &str, plugin: &[u8]) -> CkanModule {
    let top = format!("Foo-{version}");
    let plugin_path = format!("{top}/GameData/Foo/Plugins/Foo.dll");
    let part_path = format!("{top}/GameData/Foo/Parts/part.cfg");
    let craft_path = format!("{top}/Ships/VAB/Foo.craft");
    let readme_path = format!("{top}/README.md");
    fx.publish(
        &foo_json(version),
        &[
            (plugin_path.as_str(), plugin),
            (part_path.as_str(), b"PART {}"),
            (craft_path.as_str(), b"craft"),
            (readme_path.as_str(), b"not installed"),
        ],
    )
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn test_install_then_uninstall_restores_tree() {
    let mut fx = Fixture::new();
    let payload = binary_payload();
    publish_foo(&mut fx, "1.0", &payload);
    let before = fx.snapshot();

    let installer = fx.installer();
    let mut registry = fx.registry.clone();
    installer
        .install_list(&mut registry, &ids(&["Foo"]), &InstallOptions::default())
        .unwrap();

    let root = fx.game.root();
    assert_eq!(fs::read(root.join("GameData/Foo/Plugins/Foo.dll")).unwrap(), payload);
    assert_eq!(fs::read(root.join("Ships/VAB/Foo.craft")).unwrap(), b"craft");
    assert!(!root.join("GameData/Foo-1.0").exists());
    assert!(!root.join("GameData/README.md").exists());

    let saved = Registry::load(&fx.game.registry_path()).unwrap();
    let entry = saved.installed_module("Foo").unwrap();
    assert_eq!(entry.version.to_string(), "1.0");
    assert!(entry.files.contains("GameData/Foo/Parts/part.cfg"));
    assert_eq!(saved.file_owner("Ships/VAB/Foo.craft"), Some("Foo"));

    let removed = installer.uninstall_list(&mut registry, &ids(&["Foo"])).unwrap();
    assert_eq!(removed, ids(&["Foo"]));
    assert!(!registry.is_installed("Foo"));
    drop(installer);
    assert_eq!(fx.snapshot(), before);
}

#[test]
fn test_bad_install_location_writes_nothing() {
    let mut fx = Fixture::new();
    fx.publish(
        r#"{"identifier":"Evil","version":"1","license":"MIT","download":"https://example.invalid/Evil.zip",
            "install":[{"find":"Evil","install_to":"GameData/../../../etc/pwned"}]}"#,
        &[("Evil/pwned.txt", b"gotcha")],
    );
    let before = fx.snapshot();

    let mut registry = fx.registry.clone();
    let err = fx
        .installer()
        .install_list(&mut registry, &ids(&["Evil"]), &InstallOptions::default())
        .unwrap_err();
    assert!(matches!(err, InstallError::BadInstallLocation { .. }), "{err}");
    assert_eq!(fx.snapshot(), before);
    assert!(!registry.is_installed("Evil"));
    assert!(!fx.game.registry_path().exists());
}

#[test]
fn test_existing_file_is_refused_unless_overwriting() {
    let mut fx = Fixture::new();
    publish_foo(&mut fx, "1.0", b"dll");
    let part = fx.game.root().join("GameData/Foo/Parts/part.cfg");
    fs::create_dir_all(part.parent().unwrap()).unwrap();
    fs::write(&part, b"hand-made").unwrap();
    let before = fx.snapshot();

    let mut registry = fx.registry.clone();
    let err = fx
        .installer()
        .install_list(&mut registry, &ids(&["Foo"]), &InstallOptions::default())
        .unwrap_err();
    match err {
        InstallError::FileExists { path, owner, .. } => {
            assert_eq!(path, "GameData/Foo/Parts/part.cfg");
            assert_eq!(owner, None);
        }
        other => panic!("expected FileExists, got {other}"),
    }
    assert_eq!(fx.snapshot(), before);

    let options = InstallOptions {
        overwrite: OverwriteMode::Overwrite,
        ..InstallOptions::default()
    };
    fx.installer()
        .install_list(&mut registry, &ids(&["Foo"]), &options)
        .unwrap();
    assert_eq!(fs::read(&part).unwrap(), b"PART {}");
}

#[test]
fn test_failed_registry_save_rolls_back_files() {
    let mut fx = Fixture::new();
    publish_foo(&mut fx, "1.0", b"dll");
    let before = fx.snapshot();
    // A directory where the registry file should go makes the save fail after extraction.
    fs::create_dir_all(fx.game.registry_path()).unwrap();

    let mut registry = fx.registry.clone();
    let result = fx
        .installer()
        .install_list(&mut registry, &ids(&["Foo"]), &InstallOptions::default());
    assert!(matches!(result, Err(InstallError::Registry(_))));
    assert_eq!(fx.snapshot(), before);
    assert!(!registry.is_installed("Foo"));
}

#[test]
fn test_dependencies_and_reverse_dependencies() {
    let mut fx = Fixture::new();
    publish_foo(&mut fx, "1.0", b"dll");
    fx.publish(
        r#"{"identifier":"Bar","version":"2.0","license":"MIT","download":"https://example.invalid/Bar.zip",
            "depends":[{"name":"Foo","min_version":"1.0"}]}"#,
        &[("GameData/Bar/bar.cfg", b"bar")],
    );

    let installer = fx.installer();
    let mut registry = fx.registry.clone();
    let resolution = installer
        .install_list(&mut registry, &ids(&["Bar"]), &InstallOptions::default())
        .unwrap();
    assert_eq!(resolution.identifiers(), ids(&["Foo", "Bar"]));
    assert!(fx.game.root().join("GameData/Bar/bar.cfg").is_file());

    let removed = installer.uninstall_list(&mut registry, &ids(&["Foo"])).unwrap();
    assert_eq!(removed, ids(&["Foo", "Bar"]));
    assert!(!fx.game.root().join("GameData/Bar").exists());
    assert!(!fx.game.root().join("GameData/Foo").exists());
    assert!(fx.game.root().join("GameData/Squad/stock.cfg").exists());
}

#[test]
fn test_uninstall_unknown_module() {
    let fx = Fixture::new();
    let mut registry = fx.registry.clone();
    let err = fx
        .installer()
        .uninstall_list(&mut registry, &ids(&["Ghost"]))
        .unwrap_err();
    assert!(matches!(err, InstallError::ModuleNotInstalled(id) if id == "Ghost"));
}

#[test]
fn test_upgrade_replaces_files() {
    let mut fx = Fixture::new();
    publish_foo(&mut fx, "1.0", b"old dll");
    let installer_registry = {
        let mut registry = fx.registry.clone();
        fx.installer()
            .install_list(&mut registry, &ids(&["Foo"]), &InstallOptions::default())
            .unwrap();
        registry
    };

    publish_foo(&mut fx, "1.1", b"new dll");
    let mut registry = installer_registry;
    registry.add_available(fx.registry.all_available("Foo")[1].clone());

    let upgraded = fx
        .installer()
        .upgrade(&mut registry, &[], &InstallOptions::default())
        .unwrap();
    assert_eq!(upgraded.len(), 1);
    assert_eq!(
        registry.installed_version("Foo").unwrap(),
        ModuleVersion::normal(upgraded[0].version.clone())
    );
    assert_eq!(
        fs::read(fx.game.root().join("GameData/Foo/Plugins/Foo.dll")).unwrap(),
        b"new dll"
    );

    let again = fx
        .installer()
        .upgrade(&mut registry, &[], &InstallOptions::default())
        .unwrap();
    assert!(again.is_empty());
}

#[test]
fn test_find_installable_files_without_game() {
    let mut fx = Fixture::new();
    let module = publish_foo(&mut fx, "1.0", b"dll");
    let archive = fx.cache.get_cached_zip(&module.download, true).unwrap();

    let files = ckan_core::installer::find_installable_files(&module, Path::new(&archive), None)
        .unwrap();
    assert!(files.iter().all(|f| f.destination.is_none()));
    let mut relative: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
    relative.sort_unstable();
    assert_eq!(
        relative,
        vec![
            "GameData/Foo/Parts/part.cfg",
            "GameData/Foo/Plugins/Foo.dll",
            "Ships/VAB/Foo.craft"
        ]
    );
}
