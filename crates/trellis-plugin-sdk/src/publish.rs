use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};

use crate::manifest::{PublishMetadata, MANIFEST_FILE};

/// Folder, relative to the project root, that holds one directory per domain.
pub const DOMAINS_ROOT: &str = "app/domains";

/// Outcome of a publish run.
#[derive(Debug, Default, Clone)]
pub struct PublishReport {
    pub domain_root: PathBuf,
    pub copied: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Copies a plugin's publish directory into `<project_root>/app/domains/<domain>`.
///
/// Existing destination files are kept unless `meta.overwrite`, a matching
/// `overwrite_rules` entry, or `force` allows replacement. The plugin manifest
/// is never copied.
pub fn publish_assets(
    source: &Path,
    project_root: &Path,
    meta: &PublishMetadata,
    force: bool,
) -> Result<PublishReport> {
    if !source.is_dir() {
        bail!("missing publish directory: {}", source.display());
    }
    if meta.domain.trim().is_empty() {
        bail!("publish metadata must name a domain");
    }

    let domain_root = project_root.join(DOMAINS_ROOT).join(&meta.domain);
    fs::create_dir_all(&domain_root)
        .with_context(|| format!("failed to create {}", domain_root.display()))?;

    let mut report = PublishReport {
        domain_root: domain_root.clone(),
        ..PublishReport::default()
    };
    copy_tree(source, &domain_root, meta, force, &mut report)?;
    tracing::info!(
        domain = %meta.domain,
        copied = report.copied.len(),
        skipped = report.skipped.len(),
        "published plugin assets"
    );
    Ok(report)
}

fn copy_tree(
    src: &Path,
    dst: &Path,
    meta: &PublishMetadata,
    force: bool,
    report: &mut PublishReport,
) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;

    let mut entries = fs::read_dir(src)
        .with_context(|| format!("failed to read {}", src.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let target = dst.join(&name);
        if path.is_dir() {
            copy_tree(&path, &target, meta, force, report)?;
            continue;
        }
        let file_name = name.to_string_lossy();
        if file_name == MANIFEST_FILE {
            continue;
        }
        if target.exists() && !meta.allows_overwrite(&file_name, force) {
            tracing::debug!(file = %target.display(), "keeping existing asset");
            report.skipped.push(target);
            continue;
        }
        fs::copy(&path, &target).with_context(|| {
            format!("failed to copy {} to {}", path.display(), target.display())
        })?;
        report.copied.push(target);
    }
    Ok(())
}
