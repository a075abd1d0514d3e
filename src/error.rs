use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Room is already running")]
    AlreadyRunning,

    #[error("Room is not running")]
    NotRunning,

    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to stop server process: {0}")]
    StopFailed(String),

    #[error("Port {port} is already assigned to room '{holder}'")]
    PortInUse { port: u16, holder: String },

    #[error("Illegal path: {0}")]
    IllegalPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Room must be stopped first")]
    InstanceBusy,

    #[error("Room '{0}' does not exist")]
    UnknownRoom(String),

    #[error("Room id '{0}' already exists")]
    RoomExists(String),

    #[error("Room directory is not provisioned: {0}")]
    NotProvisioned(String),

    #[error("Invalid room config: {0}")]
    InvalidConfig(String),

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PanelError {
    /// Stable identifier handed to API clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            PanelError::AlreadyRunning => "already_running",
            PanelError::NotRunning => "not_running",
            PanelError::SpawnFailed(_) => "spawn_failed",
            PanelError::StopFailed(_) => "stop_failed",
            PanelError::PortInUse { .. } => "port_in_use",
            PanelError::IllegalPath(_) => "illegal_path",
            PanelError::NotFound(_) => "not_found",
            PanelError::InstanceBusy => "instance_busy",
            PanelError::UnknownRoom(_) => "unknown_room",
            PanelError::RoomExists(_) => "room_exists",
            PanelError::NotProvisioned(_) => "not_provisioned",
            PanelError::InvalidConfig(_) => "invalid_config",
            PanelError::BackupFailed(_) => "backup_failed",
            PanelError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, PanelError>;
