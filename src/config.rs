use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

/// Location of the panel config file, overridable with `PANEL_CONFIG`.
pub fn config_path() -> PathBuf {
    std::env::var_os("PANEL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    pub data_directory: String,
    pub log_directory: String,
    pub static_directory: String,
    /// Room archives land in `<backup_directory>/<room id>/`.
    pub backup_directory: String,
    /// Time between SIGTERM and SIGKILL when stopping a room.
    pub stop_grace_secs: u64,
    /// Time allowed for the process to be reaped after SIGKILL.
    pub kill_confirm_secs: u64,
    pub upload_limit_mb: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_directory: "./servers".to_string(),
            log_directory: "./logs".to_string(),
            static_directory: "public".to_string(),
            backup_directory: "./backups".to_string(),
            stop_grace_secs: 10,
            kill_confirm_secs: 5,
            upload_limit_mb: 256,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_players() -> u16 {
    8
}

/// Which server distribution a room runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Vanilla,
    Tshock,
    Tmodloader,
}

impl ServerType {
    /// Launcher used when a room leaves `executable` empty.
    pub fn default_executable(self) -> &'static str {
        match self {
            ServerType::Vanilla => "TerrariaServer",
            ServerType::Tshock => "TShock.Server",
            ServerType::Tmodloader => "tModLoaderServer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server_type: ServerType,
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub directory: String,
    pub port: u16,
    #[serde(default = "default_max_players")]
    pub max_players: u16,
    #[serde(default)]
    pub world_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_true")]
    pub autosave: bool,
    #[serde(default)]
    pub autostart: bool,
}

impl RoomConfig {
    /// Executable to launch; relative paths are taken from the room directory.
    pub fn executable_path(&self) -> PathBuf {
        let exe = if self.executable.trim().is_empty() {
            Path::new(self.server_type.default_executable())
        } else {
            Path::new(&self.executable)
        };
        if exe.is_absolute() || self.directory.is_empty() {
            exe.to_path_buf()
        } else {
            Path::new(&self.directory).join(exe)
        }
    }

    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "-port".to_string(),
            self.port.to_string(),
            "-maxplayers".to_string(),
            self.max_players.to_string(),
        ];
        if !self.world_path.is_empty() {
            args.push("-world".to_string());
            args.push(self.world_path.clone());
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            args.push("-password".to_string());
            args.push(password.to_string());
        }
        if self.autosave {
            args.push("-autosave".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Fields that cannot change while a process is attached to the room.
    pub fn launch_identity_differs(&self, other: &RoomConfig) -> bool {
        self.port != other.port
            || self.directory != other.directory
            || self.executable != other.executable
            || self.server_type != other.server_type
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub async fn save_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create config directory")?;
    }

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .context("Failed to create temp config file")?;
    file.write_all(json.as_bytes())
        .await
        .context("Failed to write temp config file")?;
    file.flush().await.context("Failed to flush temp config file")?;
    file.sync_all()
        .await
        .context("Failed to fsync temp config file")?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("Failed to rename tmp config to final")?;

    Ok(())
}

pub fn validate_room_config(cfg: &RoomConfig) -> Result<(), String> {
    if cfg.id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if cfg.id.contains('/') || cfg.id.contains('\\') || cfg.id.contains("..") {
        return Err("id must not contain '/', '\\', or '..'".to_string());
    }
    if cfg.port < 1024 {
        return Err("port must be between 1024 and 65535".to_string());
    }
    if cfg.max_players == 0 || cfg.max_players > 255 {
        return Err("max_players must be between 1 and 255".to_string());
    }
    if Path::new(&cfg.directory)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err("directory must not contain '..'".to_string());
    }
    Ok(())
}

/// Drops rooms that fail validation or reuse an earlier room's id, so nothing
/// downstream ever sees an id like `../x`.
pub fn retain_valid_rooms(config: &mut Config) {
    let mut seen = std::collections::HashSet::new();
    config.rooms.retain(|room| {
        if let Err(e) = validate_room_config(room) {
            tracing::warn!(room = %room.id, "Skipping invalid room: {}", e);
            return false;
        }
        if !seen.insert(room.id.clone()) {
            tracing::warn!(room = %room.id, "Skipping room with duplicate id");
            return false;
        }
        true
    });
}

#[cfg(test)]
pub(crate) fn test_room(id: &str, port: u16, directory: &Path, executable: &str) -> RoomConfig {
    RoomConfig {
        id: id.to_string(),
        name: id.to_string(),
        server_type: ServerType::Vanilla,
        executable: executable.to_string(),
        directory: directory.to_string_lossy().into_owned(),
        port,
        max_players: 8,
        world_path: "worlds/main.wld".to_string(),
        password: None,
        extra_args: Vec::new(),
        autosave: true,
        autostart: false,
    }
}
