//! Configuration system for the meshchat client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/meshchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use meshchat_proto::message::{MAX_MESSAGE_SIZE, MAX_USERNAME_CHARS, PeerId};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is present but unusable.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted name of the offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    username: Option<String>,
    download_dir: Option<PathBuf>,
    network: NetworkFileConfig,
    mesh: MeshFileConfig,
    transfer: TransferFileConfig,
    chat: ChatFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    listen: Option<String>,
    peer_id: Option<String>,
    join: Option<String>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[mesh]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MeshFileConfig {
    keepalive_interval_ms: Option<u64>,
    stale_after_ms: Option<u64>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

/// `[transfer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransferFileConfig {
    chunk_size: Option<usize>,
    window_size: Option<usize>,
    ack_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    stall_timeout_secs: Option<u64>,
    close_grace_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    max_message_size: Option<usize>,
    max_username_len: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Link health and reconnection timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Period of the keep-alive tick.
    pub keepalive_interval: Duration,
    /// Silence after which a connected peer is declared lost.
    pub stale_after: Duration,
    /// Reconnect delay floor; also the value backoff resets to.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_millis(1500),
            stale_after: Duration::from_millis(4000),
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

/// Chunked file transfer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Maximum unacknowledged chunks in flight.
    pub window_size: usize,
    /// How long the sender waits for a chunk ack before resending.
    pub ack_timeout: Duration,
    /// Resends allowed per chunk before the sender gives up.
    pub max_retries: u32,
    /// How long the receiver waits for the next chunk.
    pub stall_timeout: Duration,
    /// How long the sender keeps the link after `file-end`.
    pub close_grace: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            window_size: 4,
            ack_timeout: Duration::from_secs(7),
            max_retries: 5,
            stall_timeout: Duration::from_secs(20),
            close_grace: Duration::from_secs(10),
        }
    }
}

/// Chat input limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Maximum chat text size in bytes.
    pub max_message_size: usize,
    /// Maximum display name length in characters.
    pub max_username_len: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            max_username_len: MAX_USERNAME_CHARS,
        }
    }
}

/// Whether this process runs the session or joins one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accepts guests, assigns names, replays history.
    Host,
    /// Connects to one upstream host.
    Guest {
        /// The host to join.
        host: PeerId,
    },
}

impl Role {
    /// Returns `true` for [`Role::Host`].
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }

    /// The upstream host, for guests.
    #[must_use]
    pub const fn host(&self) -> Option<&PeerId> {
        match self {
            Self::Host => None,
            Self::Guest { host } => Some(host),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host or guest.
    pub role: Role,
    /// Preferred display name; guests keep the host-assigned one when unset.
    pub username: Option<String>,
    /// Where downloads go when no destination is given.
    pub download_dir: PathBuf,

    // -- Network --
    /// Address the TCP connector listens on.
    pub listen: SocketAddr,
    /// Id advertised to peers instead of the listen address.
    pub peer_id: Option<String>,
    /// Timeout for opening a link.
    pub connect_timeout: Duration,
    /// Capacity of the console command channel.
    pub channel_capacity: usize,

    /// Link health and reconnection.
    pub mesh: MeshConfig,
    /// File transfer.
    pub transfer: TransferConfig,
    /// Chat limits.
    pub chat: ChatConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            role: Role::Host,
            username: None,
            download_dir: PathBuf::from("."),
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            peer_id: None,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            mesh: MeshConfig::default(),
            transfer: TransferConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

/// Port used when nothing else is configured.
pub const DEFAULT_PORT: u16 = 7070;

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a value cannot be used.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let role = match (&cli.command, &file.network.join) {
            (Some(Command::Join { host }), _) => Role::Guest {
                host: PeerId::new(host.clone()),
            },
            (Some(Command::Host), _) => Role::Host,
            (None, Some(host)) => Role::Guest {
                host: PeerId::new(host.clone()),
            },
            (None, None) => Role::Host,
        };

        let listen = match cli.listen.as_ref().or(file.network.listen.as_ref()) {
            Some(addr) => addr.parse().map_err(|e| ConfigError::Invalid {
                field: "network.listen",
                reason: format!("{addr}: {e}"),
            })?,
            None => defaults.listen,
        };

        let transfer = TransferConfig {
            chunk_size: file
                .transfer
                .chunk_size
                .unwrap_or(defaults.transfer.chunk_size),
            window_size: file
                .transfer
                .window_size
                .unwrap_or(defaults.transfer.window_size),
            ack_timeout: file
                .transfer
                .ack_timeout_secs
                .map_or(defaults.transfer.ack_timeout, Duration::from_secs),
            max_retries: file
                .transfer
                .max_retries
                .unwrap_or(defaults.transfer.max_retries),
            stall_timeout: file
                .transfer
                .stall_timeout_secs
                .map_or(defaults.transfer.stall_timeout, Duration::from_secs),
            close_grace: file
                .transfer
                .close_grace_secs
                .map_or(defaults.transfer.close_grace, Duration::from_secs),
        };
        if transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.chunk_size",
                reason: "must be greater than zero".into(),
            });
        }
        if transfer.window_size == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.window_size",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            role,
            username: cli.username.clone().or_else(|| file.username.clone()),
            download_dir: cli
                .download_dir
                .clone()
                .or_else(|| file.download_dir.clone())
                .unwrap_or(defaults.download_dir),
            listen,
            peer_id: cli.peer_id.clone().or_else(|| file.network.peer_id.clone()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            mesh: MeshConfig {
                keepalive_interval: file
                    .mesh
                    .keepalive_interval_ms
                    .map_or(defaults.mesh.keepalive_interval, Duration::from_millis),
                stale_after: file
                    .mesh
                    .stale_after_ms
                    .map_or(defaults.mesh.stale_after, Duration::from_millis),
                initial_backoff: file
                    .mesh
                    .initial_backoff_ms
                    .map_or(defaults.mesh.initial_backoff, Duration::from_millis),
                max_backoff: file
                    .mesh
                    .max_backoff_ms
                    .map_or(defaults.mesh.max_backoff, Duration::from_millis),
            },
            transfer,
            chat: ChatConfig {
                max_message_size: file
                    .chat
                    .max_message_size
                    .unwrap_or(defaults.chat.max_message_size),
                max_username_len: file
                    .chat
                    .max_username_len
                    .unwrap_or(defaults.chat.max_username_len),
            },
        })
    }
}

/// What to do once started.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a new session and wait for guests.
    Host,
    /// Join the session hosted at the given address.
    Join {
        /// Host peer id (its `ip:port`).
        host: String,
    },
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Host-centred peer mesh for chat and file transfer")]
pub struct CliArgs {
    /// Host or join; falls back to `network.join` in the config file.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to listen on for peer links.
    #[arg(long, env = "MESHCHAT_LISTEN")]
    pub listen: Option<String>,

    /// Id to advertise to peers (default: the listen address).
    #[arg(long, env = "MESHCHAT_PEER_ID")]
    pub peer_id: Option<String>,

    /// Display name to announce.
    #[arg(short, long, env = "MESHCHAT_USERNAME")]
    pub username: Option<String>,

    /// Directory for downloaded files.
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Path to config file (default: `~/.config/meshchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MESHCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/meshchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("meshchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
