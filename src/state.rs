use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backup::Backups;
use crate::config::{save_config, AgentConfig, Config};
use crate::files::FileGateway;
use crate::notify::{AuditLog, StatusBroadcaster};
use crate::process::{Supervisor, SupervisorSettings};
use crate::store::InstanceStore;

const STATUS_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<AgentConfig>,
    pub supervisor: Supervisor,
    pub files: FileGateway,
    pub backups: Backups,
    pub events: StatusBroadcaster,
    pub audit: Arc<AuditLog>,
    config_path: Arc<PathBuf>,
    save_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        let store = InstanceStore::from_configs(config.rooms);
        let events = StatusBroadcaster::new(STATUS_CHANNEL_CAPACITY);
        let audit = Arc::new(AuditLog::new());
        let supervisor = Supervisor::new(
            store.clone(),
            Arc::new(events.clone()),
            audit.clone(),
            SupervisorSettings::from_agent(&config.agent),
        );
        let backups = Backups::new(
            store.clone(),
            audit.clone(),
            &config.agent.backup_directory,
        );

        Self {
            agent: Arc::new(config.agent),
            supervisor,
            files: FileGateway::new(store),
            backups,
            events,
            audit,
            config_path: Arc::new(config_path),
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &InstanceStore {
        self.supervisor.store()
    }

    /// Writes the current room registry back to the config file.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let _guard = self.save_lock.lock().await;
        let config = Config {
            agent: (*self.agent).clone(),
            rooms: self.store().configs(),
        };
        save_config(&self.config_path, &config).await
    }
}
