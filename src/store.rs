use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::config::RoomConfig;
use crate::error::{PanelError, Result};
use crate::lifecycle::Instance;

/// One registered room: its launch config and its lock-protected runtime state.
#[derive(Debug)]
pub struct InstanceSlot {
    config: RwLock<RoomConfig>,
    pub state: Mutex<Instance>,
}

impl InstanceSlot {
    fn new(config: RoomConfig) -> Self {
        Self {
            state: Mutex::new(Instance::new(config.id.clone())),
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> RoomConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn port(&self) -> u16 {
        match self.config.read() {
            Ok(guard) => guard.port,
            Err(poisoned) => poisoned.into_inner().port,
        }
    }

    fn replace_config(&self, config: RoomConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

/// Registry of rooms keyed by id.
///
/// The map only guards membership; each room carries its own mutex so work on
/// one room never waits on another. Config reads go through a short sync
/// `RwLock` that is never held across an await, so `list_ports` can run while
/// other rooms are locked.
#[derive(Clone, Default)]
pub struct InstanceStore {
    slots: Arc<DashMap<String, Arc<InstanceSlot>>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = RoomConfig>) -> Self {
        let store = Self::new();
        for cfg in configs {
            store
                .slots
                .insert(cfg.id.clone(), Arc::new(InstanceSlot::new(cfg)));
        }
        store
    }

    pub fn get(&self, id: &str) -> Option<Arc<InstanceSlot>> {
        self.slots.get(id).map(|r| r.value().clone())
    }

    pub fn require(&self, id: &str) -> Result<Arc<InstanceSlot>> {
        self.get(id)
            .ok_or_else(|| PanelError::UnknownRoom(id.to_string()))
    }

    /// Registers a room whose id is not taken yet.
    pub fn insert_new(&self, config: RoomConfig) -> Result<Arc<InstanceSlot>> {
        match self.slots.entry(config.id.clone()) {
            Entry::Occupied(_) => Err(PanelError::RoomExists(config.id)),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(InstanceSlot::new(config));
                vacant.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    /// Inserts a new room or replaces the config of an existing one. Launch
    /// parameters of an active room are frozen until it stops.
    pub async fn upsert(&self, config: RoomConfig) -> Result<Arc<InstanceSlot>> {
        let slot = match self.get(&config.id) {
            Some(slot) => slot,
            None => {
                let slot = self
                    .slots
                    .entry(config.id.clone())
                    .or_insert_with(|| Arc::new(InstanceSlot::new(config.clone())))
                    .value()
                    .clone();
                return Ok(slot);
            }
        };

        let state = slot.state.lock().await;
        if state.status.is_active() && slot.config().launch_identity_differs(&config) {
            return Err(PanelError::InstanceBusy);
        }
        slot.replace_config(config);
        drop(state);
        Ok(slot)
    }

    /// Removes a room. Refused while a process may be attached to it.
    pub async fn delete(&self, id: &str) -> Result<RoomConfig> {
        let slot = self.require(id)?;
        let mut state = slot.state.lock().await;
        if state.status.is_active() {
            return Err(PanelError::InstanceBusy);
        }
        state.removed = true;
        self.slots.remove(id);
        Ok(slot.config())
    }

    /// `(room id, configured port)` for every registered room.
    pub fn list_ports(&self) -> Vec<(String, u16)> {
        self.slots
            .iter()
            .map(|r| (r.key().clone(), r.value().port()))
            .collect()
    }

    /// Another room already configured with `port`, if any.
    pub fn port_holder(&self, port: u16, except_id: &str) -> Option<String> {
        self.list_ports()
            .into_iter()
            .find(|(id, p)| *p == port && id != except_id)
            .map(|(id, _)| id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn configs(&self) -> Vec<RoomConfig> {
        let mut configs: Vec<RoomConfig> =
            self.slots.iter().map(|r| r.value().config()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }
}
