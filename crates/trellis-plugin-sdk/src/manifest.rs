use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// File name of the JSON manifest shipped at the root of every plugin package.
pub const MANIFEST_FILE: &str = "trellis-plugin.json";

/// On-disk JSON manifest located at the root of each plugin package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub name: String,
    /// Import path the host uses to look the plugin up in its catalog.
    pub path: String,
    pub version: String,
    pub description: Option<String>,
    pub requires_config: bool,
    pub returns_api: bool,
    pub publishable: bool,
    /// Directory, relative to the manifest, holding publishable assets.
    pub publish_dir: String,
    pub publish: Option<PublishMetadata>,
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: String::new(),
            version: "0.1.0".into(),
            description: None,
            requires_config: false,
            returns_api: true,
            publishable: false,
            publish_dir: "publish".into(),
            publish: None,
        }
    }
}

/// Describes where published assets land and which files may be replaced.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PublishMetadata {
    pub domain: String,
    pub overwrite: bool,
    pub overwrite_rules: BTreeMap<String, bool>,
}

impl PublishMetadata {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Whether an existing destination named `file_name` may be replaced.
    pub fn allows_overwrite(&self, file_name: &str, force: bool) -> bool {
        force || self.overwrite || self.overwrite_rules.get(file_name) == Some(&true)
    }
}

impl PluginManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: PluginManifest = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("plugin manifest name must not be empty");
        }
        if self.path.trim().is_empty() {
            bail!("plugin `{}` must declare its import path", self.name);
        }
        semver::Version::parse(&self.version)
            .with_context(|| format!("plugin `{}` has invalid version `{}`", self.name, self.version))?;
        if self.publishable {
            match &self.publish {
                Some(meta) if !meta.domain.trim().is_empty() => {}
                _ => bail!(
                    "publishable plugin `{}` must declare publish.domain",
                    self.name
                ),
            }
        }
        Ok(())
    }
}

/// A manifest together with the directory it was read from.
#[derive(Debug, Clone)]
pub struct LocatedManifest {
    pub root: PathBuf,
    pub manifest: PluginManifest,
}

impl LocatedManifest {
    pub fn publish_source(&self) -> PathBuf {
        self.root.join(&self.manifest.publish_dir)
    }
}

/// Derives the on-disk package name from an import path: first segment, `_` → `-`.
pub fn package_name(import_path: &str) -> String {
    let root = import_path
        .split("::")
        .next()
        .unwrap_or(import_path)
        .split('.')
        .next()
        .unwrap_or(import_path);
    root.replace('_', "-")
}

/// Finds the manifest describing `import_path`.
///
/// Looks in `./<pkg>` and `../<pkg>` relative to `base`, then `<dir>/<pkg>` for every
/// search dir, and finally scans every search dir for a manifest whose `path` matches.
pub fn locate_manifest(
    import_path: &str,
    base: &Path,
    search_dirs: &[PathBuf],
) -> Result<Option<LocatedManifest>> {
    let pkg = package_name(import_path);
    let mut candidates = vec![base.join(&pkg), base.join("..").join(&pkg)];
    candidates.extend(search_dirs.iter().map(|dir| base.join(dir).join(&pkg)));

    for candidate in candidates {
        let file = candidate.join(MANIFEST_FILE);
        if file.is_file() {
            let manifest = PluginManifest::load(&file)?;
            if manifest.path == import_path {
                return Ok(Some(LocatedManifest {
                    root: candidate,
                    manifest,
                }));
            }
        }
    }

    for dir in search_dirs {
        for located in discover_manifests(&base.join(dir))? {
            if located.manifest.path == import_path {
                return Ok(Some(located));
            }
        }
    }
    Ok(None)
}

/// Lists every manifest found one level below `dir`, sorted by plugin name.
pub fn discover_manifests(dir: &Path) -> Result<Vec<LocatedManifest>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let root = entry.path();
        let file = root.join(MANIFEST_FILE);
        if !file.is_file() {
            continue;
        }
        let manifest = PluginManifest::load(&file)?;
        found.push(LocatedManifest { root, manifest });
    }
    found.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, manifest: &PluginManifest) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(manifest).unwrap(),
        )
        .unwrap();
    }

    fn sample(path: &str) -> PluginManifest {
        PluginManifest {
            name: "admin-ui".into(),
            path: path.into(),
            version: "1.2.0".into(),
            publishable: true,
            publish: Some(PublishMetadata::new("admin")),
            ..PluginManifest::default()
        }
    }

    #[test]
    fn package_name_uses_first_segment() {
        assert_eq!(package_name("admin_ui::plugin::AdminUi"), "admin-ui");
        assert_eq!(package_name("admin_ui.plugin.AdminUi"), "admin-ui");
    }

    #[test]
    fn publishable_manifest_requires_domain() {
        let mut manifest = sample("admin_ui::AdminUi");
        manifest.publish = None;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn invalid_version_is_rejected() {
        let mut manifest = sample("admin_ui::AdminUi");
        manifest.version = "one".into();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn overwrite_rules_are_per_file() {
        let mut meta = PublishMetadata::new("admin");
        meta.overwrite_rules.insert("index.html".into(), true);
        meta.overwrite_rules.insert("style.css".into(), false);
        assert!(meta.allows_overwrite("index.html", false));
        assert!(!meta.allows_overwrite("style.css", false));
        assert!(!meta.allows_overwrite("app.js", false));
        assert!(meta.allows_overwrite("app.js", true));
    }

    #[test]
    fn locates_local_package_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(&tmp.path().join("admin-ui"), &sample("admin_ui::AdminUi"));

        let located = locate_manifest("admin_ui::AdminUi", tmp.path(), &[])
            .unwrap()
            .expect("manifest");
        assert_eq!(located.manifest.name, "admin-ui");
        assert_eq!(located.publish_source(), tmp.path().join("admin-ui").join("publish"));
    }

    #[test]
    fn scans_search_dirs_by_import_path() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            &tmp.path().join("plugins").join("whatever"),
            &sample("admin_ui::AdminUi"),
        );

        let located = locate_manifest(
            "admin_ui::AdminUi",
            tmp.path(),
            &[PathBuf::from("plugins")],
        )
        .unwrap();
        assert!(located.is_some());
        assert!(locate_manifest("other::Plugin", tmp.path(), &[PathBuf::from("plugins")])
            .unwrap()
            .is_none());
    }
}
