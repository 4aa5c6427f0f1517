// src/config.rs
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:6785";
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:3000";

/// Command-line arguments for the application.
#[derive(Parser, Debug, Deserialize, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Run as a peer (connect to an origin and mirror its tree)
    #[clap(short, long, help = "Run as a peer (connect to an origin and mirror its tree)")]
    pub peer: bool,

    /// Replication address: where the origin listens, or the peer connects
    #[clap(
        short,
        long,
        value_parser,
        help = "Replication address (e.g., \"127.0.0.1:6785\")"
    )]
    pub server: Option<String>,

    /// HTTP address for the CRUD interface on the origin
    #[clap(
        long,
        value_parser,
        help = "HTTP address for the CRUD interface (e.g., \"127.0.0.1:3000\")"
    )]
    pub http: Option<String>,

    /// Path to a configuration file (e.g., dropmirror.toml)
    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., dropmirror.toml)"
    )]
    pub config: Option<PathBuf>,

    /// Directory to replicate (origin) or mirror into (peer)
    #[clap(help = "Directory to replicate (origin) or mirror into (peer)")]
    pub root: Option<String>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FileConfig {
    /// Root directory
    pub root: Option<String>,
    /// Replication address
    pub server: Option<String>,
    /// CRUD HTTP address
    pub http: Option<String>,
    /// Peer mode
    pub peer: Option<bool>,
    /// Log level
    pub log_level: Option<String>,
    /// Events buffered per connected peer before it is disconnected
    pub queue_capacity: Option<usize>,
    pub heartbeat_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub debounce_ms: Option<u64>,
    /// Window during which the watcher ignores paths written through the CRUD interface
    pub suppress_window_ms: Option<u64>,
}

impl FileConfig {
    fn defaults(log_level: String) -> Self {
        FileConfig {
            root: None,
            server: Some(DEFAULT_SERVER_ADDR.to_string()),
            http: Some(DEFAULT_HTTP_ADDR.to_string()),
            peer: Some(false),
            log_level: Some(log_level),
            queue_capacity: Some(crate::bus::DEFAULT_QUEUE_CAPACITY),
            heartbeat_secs: Some(5),
            idle_timeout_secs: Some(15),
            write_timeout_secs: Some(10),
            debounce_ms: Some(500),
            suppress_window_ms: Some(2000),
        }
    }
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Whether to run as a peer
    pub peer: bool,
    /// Replicated (origin) or mirrored (peer) directory
    pub root: PathBuf,
    /// Replication listen (origin) or connect (peer) address
    pub server_addr: String,
    /// CRUD interface address
    pub http_addr: String,
    /// Log level
    pub log_level: String,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub debounce: Duration,
    pub suppress_window: Duration,
}

impl AppConfig {
    /// Loads the application configuration by merging CLI, file, environment, and defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(CliArgs::parse())
    }

    /// Same as [`load`](Self::load) with already-parsed arguments.
    pub fn load_from(cli_args: CliArgs) -> Result<Self, figment::Error> {
        let config_file_path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("dropmirror.toml"));

        // Default log level from environment variable DROPMIRROR_LOG_LEVEL, then "info"
        let default_log_level =
            std::env::var("DROPMIRROR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let fig = Figment::new()
            .merge(Serialized::defaults(FileConfig::defaults(
                default_log_level.clone(),
            )))
            .merge(Toml::file(config_file_path).nested())
            .merge(Env::prefixed("DROPMIRROR_").map(|key| key.as_str().replace("__", ".").into()));

        let mut merged_config: FileConfig = fig.select("dropmirror").extract()?;

        // CLI always wins when given.
        if let Some(cli_ll) = cli_args.log_level {
            merged_config.log_level = Some(cli_ll);
        }
        if let Some(cli_server) = cli_args.server {
            merged_config.server = Some(cli_server);
        }
        if let Some(cli_http) = cli_args.http {
            merged_config.http = Some(cli_http);
        }
        if let Some(cli_root) = cli_args.root {
            merged_config.root = Some(cli_root);
        }
        // For boolean flags, CLI presence means true
        let peer = cli_args.peer || merged_config.peer.unwrap_or(false);

        let root = match merged_config.root {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        Ok(AppConfig {
            peer,
            root,
            server_addr: merged_config
                .server
                .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string()),
            http_addr: merged_config
                .http
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            log_level: merged_config.log_level.unwrap_or(default_log_level),
            queue_capacity: merged_config
                .queue_capacity
                .unwrap_or(crate::bus::DEFAULT_QUEUE_CAPACITY),
            heartbeat_interval: Duration::from_secs(merged_config.heartbeat_secs.unwrap_or(5).max(1)),
            idle_timeout: Duration::from_secs(merged_config.idle_timeout_secs.unwrap_or(15).max(1)),
            write_timeout: Duration::from_secs(merged_config.write_timeout_secs.unwrap_or(10).max(1)),
            debounce: Duration::from_millis(merged_config.debounce_ms.unwrap_or(500)),
            suppress_window: Duration::from_millis(merged_config.suppress_window_ms.unwrap_or(2000)),
        })
    }
}
