//! Persistent user identity: nick, colors and network preferences.
//!
//! Settings are read once at startup and written back through a
//! [`SettingsSaver`] whenever the user changes something the core owns
//! (currently the nick). Loading never fails: each key is validated on its
//! own and an invalid or missing key keeps its default.

use std::path::{Path, PathBuf};

use crate::chat::users::is_valid_nick;
use crate::config::{ConfigError, config_dir};

/// Default color for system messages (opaque blue).
pub const DEFAULT_SYS_COLOR: i32 = -16_776_961;

/// User identity and preferences.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Settings {
    /// Preferred nick. Empty when none is configured and the login name
    /// is not a valid nick; the controller then uses the user code.
    pub nick: String,
    /// Packed RGB color of the user's own chat lines.
    pub own_color: i32,
    /// Packed RGB color for system messages.
    pub sys_color: i32,
    /// Interface name or address to chat on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<String>,
    /// Do not open the private chat channel.
    pub no_private_chat: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let nick = std::env::var("USER")
            .ok()
            .filter(|name| is_valid_nick(name))
            .unwrap_or_default();
        Self {
            nick,
            own_color: 0,
            sys_color: DEFAULT_SYS_COLOR,
            network_interface: None,
            no_private_chat: false,
        }
    }
}

/// Capability for persisting settings. Fire-and-forget.
pub trait SettingsSaver: Send + Sync {
    /// Persist `settings`. Failures are logged by the implementation.
    fn save(&self, settings: &Settings);
}

/// Saves settings as TOML on disk.
#[derive(Debug, Clone)]
pub struct TomlSettingsSaver {
    path: PathBuf,
}

impl TomlSettingsSaver {
    /// Creates a saver writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this saver writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize and write `settings`, creating the parent directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if serialization or any file operation fails.
    pub fn write(&self, settings: &Settings) -> Result<(), ConfigError> {
        let contents = toml::to_string(settings)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(&self.path, contents).map_err(|e| ConfigError::WriteFile {
            path: self.path.clone(),
            source: e,
        })
    }
}

impl SettingsSaver for TomlSettingsSaver {
    fn save(&self, settings: &Settings) {
        match self.write(settings) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "settings saved"),
            Err(e) => tracing::warn!(error = %e, "failed to save settings"),
        }
    }
}

/// Default settings file path (`~/.config/vertochat/settings.toml`).
#[must_use]
pub fn default_settings_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("settings.toml"))
}

/// Load settings from `path`, falling back to defaults key by key.
#[must_use]
pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();

    let table = match std::fs::read_to_string(path) {
        Ok(contents) => match contents.parse::<toml::Table>() {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "settings file is not valid TOML, using defaults");
                return settings;
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
            return settings;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read settings, using defaults");
            return settings;
        }
    };

    if let Some(value) = table.get("nick") {
        match value.as_str() {
            Some(nick) if is_valid_nick(nick) => settings.nick = nick.to_string(),
            _ => tracing::warn!(value = %value, "ignoring invalid nick in settings"),
        }
    }
    if let Some(color) = color_value(&table, "own_color") {
        settings.own_color = color;
    }
    if let Some(color) = color_value(&table, "sys_color") {
        settings.sys_color = color;
    }
    if let Some(value) = table.get("network_interface") {
        match value.as_str() {
            Some(name) if !name.trim().is_empty() => {
                settings.network_interface = Some(name.trim().to_string());
            }
            _ => tracing::warn!(value = %value, "ignoring invalid network interface in settings"),
        }
    }
    if let Some(value) = table.get("no_private_chat") {
        match value.as_bool() {
            Some(flag) => settings.no_private_chat = flag,
            None => tracing::warn!(value = %value, "ignoring invalid no_private_chat in settings"),
        }
    }

    settings
}

fn color_value(table: &toml::Table, key: &str) -> Option<i32> {
    let value = table.get(key)?;
    let color = value.as_integer().and_then(|n| i32::try_from(n).ok());
    if color.is_none() {
        tracing::warn!(key, value = %value, "ignoring invalid color in settings");
    }
    color
}
