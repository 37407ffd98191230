use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use tracing_subscriber::{fmt, EnvFilter};
use trellis_core::config::Config;
use trellis_plugin_sdk::{
    locate_manifest, publish_assets, EnabledPlugins, LocatedManifest, PublishReport,
};

const EXAMPLE_CONFIG: &str = r#"[server]
bind = "${TRELLIS_BIND:127.0.0.1:8000}"
request_timeout_secs = 30

[discovery]
root = "app"

[plugins]
enabled_file = ".trellis/enabled_plugins.toml"
search_paths = ["plugins"]

[plugin_config."my_app::plugins::EventBus"]
broker = "memory"
"#;

#[derive(Parser, Debug)]
#[command(name = "trellis", author, version, about = "Route registry and plugin manager")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the project's enabled plugins and their published assets.
    Plugins {
        #[command(flatten)]
        project: ProjectArgs,

        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Interact with configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = "trellis.toml")]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Project root holding the enabled-plugins file and `app/domains`.
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    root: PathBuf,

    /// Configuration file, relative to the project root.
    #[arg(long, value_name = "FILE", default_value = "trellis.toml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints an example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists enabled plugins.
    List,
    /// Records a plugin path in the enabled-plugins file.
    Enable {
        #[arg(value_name = "PATH")]
        path: String,
        /// Publish the plugin's assets right away if it is publishable.
        #[arg(long)]
        publish: bool,
    },
    /// Copies an enabled plugin's assets into `app/domains/<domain>`.
    Publish {
        #[arg(value_name = "PATH")]
        path: String,
        /// Replace files that already exist.
        #[arg(short, long)]
        force: bool,
    },
}

/// Filesystem locations the plugin commands operate on.
#[derive(Debug)]
struct Project {
    root: PathBuf,
    enabled_file: PathBuf,
    search_paths: Vec<PathBuf>,
}

impl Project {
    fn open(args: &ProjectArgs) -> Result<Self> {
        let config_path = args.root.join(&args.config);
        let config = if config_path.is_file() {
            load_config(&config_path)?
        } else {
            tracing::debug!(path = %config_path.display(), "no config file; using defaults");
            Config::default()
        };
        Ok(Self {
            enabled_file: args.root.join(&config.plugins.enabled_file),
            search_paths: config.plugins.search_paths,
            root: args.root.clone(),
        })
    }

    fn locate(&self, path: &str) -> Result<Option<LocatedManifest>> {
        locate_manifest(path, &self.root, &self.search_paths)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Plugins { project, command } => handle_plugins(&Project::open(&project)?, command),
        Commands::Config { command } => handle_config(command),
        Commands::Diag { config } => handle_diag(config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            print!("{EXAMPLE_CONFIG}");
        }
    }
    Ok(())
}

fn handle_plugins(project: &Project, command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List => list_plugins(project),
        PluginCommands::Enable { path, publish } => {
            enable_plugin(project, &path, publish)?;
            Ok(())
        }
        PluginCommands::Publish { path, force } => {
            if let Some(report) = publish_plugin(project, &path, force)? {
                print_report(&report);
            }
            Ok(())
        }
    }
}

fn list_plugins(project: &Project) -> Result<()> {
    let enabled = EnabledPlugins::load_lenient(&project.enabled_file);
    if enabled.is_empty() {
        println!("warning: no plugins enabled");
        return Ok(());
    }
    println!("enabled plugins:");
    for path in enabled.entries() {
        println!("- {path}");
    }
    Ok(())
}

/// Records `path` as enabled. Returns whether the list changed.
fn enable_plugin(project: &Project, path: &str, publish: bool) -> Result<bool> {
    if !is_plugin_path(path) {
        bail!("`{path}` is not a plugin path; expected `crate::module::Type` or `package.module.Type`");
    }

    let mut enabled = EnabledPlugins::load(&project.enabled_file)?;
    let added = enabled.insert(path);
    if added {
        enabled.save()?;
        println!("enabled plugin: {path}");
    } else {
        println!("plugin already enabled: {path}");
    }

    match project.locate(path)? {
        None => {
            tracing::warn!(plugin = %path, "no manifest found; assets cannot be published");
        }
        Some(located) if located.manifest.publishable => {
            if publish {
                if let Some(report) = publish_plugin(project, path, false)? {
                    print_report(&report);
                }
            } else {
                println!("skipping publish; publish later with:");
                println!("  trellis plugins publish {path}");
            }
        }
        Some(_) => {}
    }
    Ok(added)
}

/// Publishes the assets of an enabled plugin. `None` when it has nothing to publish.
fn publish_plugin(project: &Project, path: &str, force: bool) -> Result<Option<PublishReport>> {
    let enabled = EnabledPlugins::load(&project.enabled_file)?;
    if !enabled.contains(path) {
        bail!("plugin `{path}` is not enabled; enable it first with `trellis plugins enable {path}`");
    }

    let located = project
        .locate(path)?
        .with_context(|| format!("no manifest found for plugin `{path}`"))?;
    let manifest = &located.manifest;
    let meta = match (&manifest.publish, manifest.publishable) {
        (Some(meta), true) => meta,
        _ => {
            println!("warning: plugin `{}` is not publishable", manifest.name);
            return Ok(None);
        }
    };

    println!("publishing assets for domain: {}", meta.domain);
    let report = publish_assets(&located.publish_source(), &project.root, meta, force)?;
    Ok(Some(report))
}

fn print_report(report: &PublishReport) {
    println!("published into {}", report.domain_root.display());
    for file in &report.copied {
        println!("  copied  {}", file.display());
    }
    for file in &report.skipped {
        println!("  skipped {} (exists)", file.display());
    }
    if !report.skipped.is_empty() {
        println!("use --force to overwrite skipped files");
    }
}

fn is_plugin_path(path: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:(?:::|\.)[A-Za-z_][A-Za-z0-9_]*)+$").unwrap()
    });
    regex.is_match(path)
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let cfg = load_config(&path)?;
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    Config::from_toml(&expanded).with_context(|| format!("failed to parse {}", path.display()))
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}").unwrap());
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}
