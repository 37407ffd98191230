use std::path::Path;

use anyhow::{Context, Result};

/// Reads a published HTML asset below `domains_root`.
pub async fn html_content(domains_root: impl AsRef<Path>, relative: &str) -> Result<String> {
    let path = domains_root.as_ref().join(relative.trim_start_matches('/'));
    tracing::debug!(path = %path.display(), "loading html view");
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read view {}", path.display()))
}
