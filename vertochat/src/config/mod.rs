//! Configuration system for the `VertoChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/vertochat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.
//!
//! User identity (nick, colors) is not configuration; it lives in
//! [`settings`] and is written back whenever the user changes it.

pub mod settings;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use vertochat_proto::message::{MAX_MESSAGE_BYTES, MAX_PACKET_SIZE};

/// Errors that can occur when loading or writing configuration files.
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

    /// Failed to write a configuration file.
    #[error("failed to write config file {path}: {source}")]
    WriteFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Failed to serialize a configuration value to TOML.
    #[error("failed to serialize config: {0}")]
    SerializeToml(#[from] toml::ser::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    chat: ChatFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    multicast_group: Option<Ipv4Addr>,
    group_port: Option<u16>,
    private_chat_port: Option<u16>,
    private_chat: Option<bool>,
    detection_group: Option<Ipv4Addr>,
    detection_port: Option<u16>,
    interface: Option<String>,
    monitor_interval_secs: Option<u64>,
    probe_timeout_ms: Option<u64>,
    detection_timeout_ms: Option<u64>,
    packet_size: Option<usize>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    max_message_bytes: Option<usize>,
    idle_interval_secs: Option<u64>,
    user_timeout_secs: Option<u64>,
    logon_delay_ms: Option<u64>,
    client_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Network subsystem configuration (used by `NetworkService`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Multicast group and port for group messages.
    pub group: SocketAddrV4,
    /// First unicast port tried for private chat.
    pub private_chat_port: u16,
    /// Whether the private unicast channel is opened at all.
    pub private_chat_enabled: bool,
    /// Throwaway group used to find the interface the OS routes multicast on.
    pub detection_group: SocketAddrV4,
    /// How long to wait for the detection probe to come back.
    pub detection_timeout: Duration,
    /// Interface name or address that overrides automatic selection.
    pub interface: Option<String>,
    /// Period of the connection monitor's liveness check.
    pub monitor_interval: Duration,
    /// How long a liveness check waits for its own token to come back from
    /// the group. Capped at `monitor_interval`.
    pub probe_timeout: Duration,
    /// Receive buffer size per datagram.
    pub packet_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            group: SocketAddrV4::new(Ipv4Addr::new(224, 168, 5, 1), 40005),
            private_chat_port: 40008,
            private_chat_enabled: true,
            detection_group: SocketAddrV4::new(Ipv4Addr::new(224, 168, 5, 2), 40009),
            detection_timeout: Duration::from_secs(2),
            interface: None,
            monitor_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Chat subsystem configuration (used by `Controller`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Byte budget for chat lines, topics, away messages and file names.
    pub max_message_bytes: usize,
    /// How often IDLE is sent and peers are checked for timeout.
    pub idle_interval: Duration,
    /// Peers silent for longer than this are removed.
    pub user_timeout: Duration,
    /// Settle period after the network comes up before logon completes.
    pub logon_delay: Duration,
    /// Client description announced in CLIENT messages.
    pub client_name: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: MAX_MESSAGE_BYTES,
            idle_interval: Duration::from_secs(15),
            user_timeout: Duration::from_secs(120),
            logon_delay: Duration::from_millis(1500),
            client_name: format!("VertoChat v{} Console", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Network subsystem config.
    pub network: NetworkConfig,
    /// Chat subsystem config.
    pub chat: ChatConfig,
    /// Settings file override (default: `~/.config/vertochat/settings.toml`).
    pub settings_path: Option<PathBuf>,
    /// Nick override for this session.
    pub nick: Option<String>,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/vertochat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let net = NetworkConfig::default();
        let chat = ChatConfig::default();
        let group_ip = file.network.multicast_group.unwrap_or(*net.group.ip());
        let group_port = file.network.group_port.unwrap_or(net.group.port());
        let detection_ip = file
            .network
            .detection_group
            .unwrap_or(*net.detection_group.ip());
        let detection_port = file
            .network
            .detection_port
            .unwrap_or(net.detection_group.port());

        Self {
            network: NetworkConfig {
                group: SocketAddrV4::new(group_ip, group_port),
                private_chat_port: file
                    .network
                    .private_chat_port
                    .unwrap_or(net.private_chat_port),
                private_chat_enabled: !cli.no_private_chat
                    && file
                        .network
                        .private_chat
                        .unwrap_or(net.private_chat_enabled),
                detection_group: SocketAddrV4::new(detection_ip, detection_port),
                detection_timeout: file
                    .network
                    .detection_timeout_ms
                    .map_or(net.detection_timeout, Duration::from_millis),
                interface: cli
                    .interface
                    .clone()
                    .or_else(|| file.network.interface.clone()),
                monitor_interval: file
                    .network
                    .monitor_interval_secs
                    .map_or(net.monitor_interval, Duration::from_secs),
                probe_timeout: file
                    .network
                    .probe_timeout_ms
                    .map_or(net.probe_timeout, Duration::from_millis),
                packet_size: file.network.packet_size.unwrap_or(net.packet_size),
            },
            chat: ChatConfig {
                max_message_bytes: file
                    .chat
                    .max_message_bytes
                    .unwrap_or(chat.max_message_bytes),
                idle_interval: file
                    .chat
                    .idle_interval_secs
                    .map_or(chat.idle_interval, Duration::from_secs),
                user_timeout: file
                    .chat
                    .user_timeout_secs
                    .map_or(chat.user_timeout, Duration::from_secs),
                logon_delay: file
                    .chat
                    .logon_delay_ms
                    .map_or(chat.logon_delay, Duration::from_millis),
                client_name: file.chat.client_name.clone().unwrap_or(chat.client_name),
            },
            settings_path: cli.settings.clone(),
            nick: cli.nick.clone(),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Peer-to-peer LAN chat over UDP multicast")]
pub struct CliArgs {
    /// Nick to use for this session (saved to the settings file).
    #[arg(long, env = "VERTOCHAT_NICK")]
    pub nick: Option<String>,

    /// Network interface name or IPv4 address to chat on.
    #[arg(long, env = "VERTOCHAT_INTERFACE")]
    pub interface: Option<String>,

    /// Do not open the private chat channel.
    #[arg(long, env = "VERTOCHAT_NO_PRIVATE_CHAT")]
    pub no_private_chat: bool,

    /// Path to config file (default: `~/.config/vertochat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to settings file (default: `~/.config/vertochat/settings.toml`).
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "VERTOCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/vertochat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Directory holding the config and settings files.
#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vertochat"))
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
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(dir) = config_dir() else {
            return Ok(ConfigFile::default());
        };
        dir.join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
