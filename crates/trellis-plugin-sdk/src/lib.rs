pub mod enabled;
pub mod manifest;
pub mod publish;

pub use enabled::{EnabledPlugins, DEFAULT_ENABLED_FILE};
pub use manifest::{
    discover_manifests, locate_manifest, package_name, LocatedManifest, PluginManifest,
    PublishMetadata, MANIFEST_FILE,
};
pub use publish::{publish_assets, PublishReport, DOMAINS_ROOT};
