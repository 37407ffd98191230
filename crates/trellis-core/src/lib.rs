pub mod command;
pub mod config;
pub mod container;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod server;
pub mod views;

pub use command::CommandTable;
pub use config::Config;
pub use container::AppContainer;
pub use discovery::{DiscoveryModule, DiscoveryReport, ModuleCatalog};
pub use error::{ContainerError, PluginError};
pub use lifecycle::{Lifespan, LifespanDriver, PluginOrchestrator};
pub use plugin::{
    plugin_api, resolve_name, Hook, HookSet, Plugin, PluginApi, PluginCatalog, PluginConfig, PluginNamespace,
    SetupContext,
};
pub use registry::{ControllerDeclaration, MetadataRegistry, RouteDeclaration};
pub use router::{handler_fn, method_fn, Handler, RouteBinder};
pub use server::{text_response, HostApp, Server};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
