use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use serde::Serialize;
use sysinfo::System;
use tokio::process::{Child, Command};

use crate::config::{AgentConfig, RoomConfig};
use crate::error::{PanelError, Result};
use crate::lifecycle::{Instance, LifecycleEvent, RoomStatus};
use crate::logs;
use crate::notify::{AuditAction, AuditEntry, AuditSink, StatusChange, StatusObserver};
use crate::store::{InstanceSlot, InstanceStore};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub log_dir: PathBuf,
    pub stop_grace: Duration,
    pub kill_confirm: Duration,
}

impl SupervisorSettings {
    pub fn from_agent(agent: &AgentConfig) -> Self {
        Self {
            log_dir: PathBuf::from(&agent.log_directory),
            stop_grace: Duration::from_secs(agent.stop_grace_secs.max(1)),
            kill_confirm: Duration::from_secs(agent.kill_confirm_secs.max(1)),
        }
    }
}

/// What API callers see of a room.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub config: RoomConfig,
    pub status: RoomStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub current_players: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InstanceView {
    fn new(state: &Instance, mut config: RoomConfig) -> Self {
        if config.password.as_deref().is_some_and(|p| !p.is_empty()) {
            config.password = Some("******".to_string());
        }
        Self {
            config,
            status: state.status,
            pid: state.pid,
            started_at: state.started_at,
            uptime_seconds: state.uptime_seconds(),
            current_players: state.current_players,
            last_exit_code: state.last_exit_code,
            last_signal: state.last_signal,
            last_error: state.last_error.clone(),
        }
    }
}

struct Inner {
    store: InstanceStore,
    observer: Arc<dyn StatusObserver>,
    audit: Arc<dyn AuditSink>,
    settings: SupervisorSettings,
    next_run: AtomicU64,
}

/// Owns every room's OS process: start, stop, restart and crash detection.
///
/// Each control call holds the room's lock only for the synchronous part of
/// the transition. Waiting for a process to exit happens in a detached watcher
/// that re-takes the lock to commit the final state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        store: InstanceStore,
        observer: Arc<dyn StatusObserver>,
        audit: Arc<dyn AuditSink>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                observer,
                audit,
                settings,
                next_run: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub async fn status(&self, id: &str) -> Result<InstanceView> {
        let slot = self.inner.store.require(id)?;
        let state = slot.state.lock().await;
        Ok(InstanceView::new(&state, slot.config()))
    }

    pub async fn list(&self) -> Vec<InstanceView> {
        let mut views = Vec::new();
        for id in self.inner.store.ids() {
            if let Ok(view) = self.status(&id).await {
                views.push(view);
            }
        }
        views
    }

    pub async fn start(&self, id: &str) -> Result<InstanceView> {
        let result = self.start_room(id).await;
        self.record(id, AuditAction::Start, &result);
        result
    }

    pub async fn stop(&self, id: &str) -> Result<InstanceView> {
        let result = self.stop_room(id).await;
        self.record(id, AuditAction::Stop, &result);
        result
    }

    /// Stop (tolerating `NotRunning`) followed by a fresh start. Both halves go
    /// through the state machine, so observers see `stopping`/`stopped` first.
    pub async fn restart(&self, id: &str) -> Result<InstanceView> {
        let result = async {
            match self.stop_room(id).await {
                Ok(_) | Err(PanelError::NotRunning) => {}
                Err(e) => return Err(e),
            }
            self.start_room(id).await
        }
        .await;
        self.record(id, AuditAction::Restart, &result);
        result
    }

    pub async fn delete(&self, id: &str) -> Result<RoomConfig> {
        let result = self.inner.store.delete(id).await;
        self.record(id, AuditAction::Delete, &result);
        result
    }

    /// Stops every room that still has a process attached.
    pub async fn shutdown_all(&self) {
        let mut active = Vec::new();
        for id in self.inner.store.ids() {
            if let Some(slot) = self.inner.store.get(&id) {
                if slot.state.lock().await.status.is_active() {
                    active.push(id);
                }
            }
        }

        let stops = active.iter().map(|id| async move {
            if let Err(e) = self.stop(id).await {
                tracing::error!(room = %id, "Failed to stop room during shutdown: {}", e);
            }
        });
        futures_util::future::join_all(stops).await;
    }

    async fn start_room(&self, id: &str) -> Result<InstanceView> {
        let slot = self.inner.store.require(id)?;
        let mut state = slot.state.lock().await;
        if let Err(e) = state.ensure_can_start() {
            tracing::warn!(room = %id, status = %state.status, "Start rejected: {}", e);
            return Err(e);
        }

        let config = slot.config();
        if let Some(holder) = self.inner.store.port_holder(config.port, id) {
            return Err(PanelError::PortInUse {
                port: config.port,
                holder,
            });
        }
        if config.directory.is_empty() {
            return Err(PanelError::NotProvisioned(id.to_string()));
        }

        let run = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let spawned = self.spawn_process(&config).and_then(|child| match child.id() {
            Some(pid) => Ok((child, pid)),
            None => Err(std::io::Error::other("process exited before its pid was read")),
        });
        let (child, pid) = match spawned {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(room = %id, "Failed to spawn server: {}", e);
                self.commit(
                    &mut state,
                    LifecycleEvent::LaunchFailed {
                        reason: e.to_string(),
                    },
                )?;
                return Err(PanelError::SpawnFailed(e));
            }
        };

        self.commit(&mut state, LifecycleEvent::Launched { pid, run })?;
        self.commit(&mut state, LifecycleEvent::Confirmed)?;
        self.spawn_watcher(slot.clone(), run, child);

        tracing::info!(room = %id, pid, port = config.port, "Started server");
        Ok(InstanceView::new(&state, config))
    }

    fn spawn_process(&self, config: &RoomConfig) -> std::io::Result<Child> {
        let stdout = logs::open_sink(&self.inner.settings.log_dir, &config.id)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(config.executable_path());
        cmd.args(config.launch_args())
            .current_dir(&config.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        cmd.spawn()
    }

    /// Waits for the process of run `run` and reports its exit. This is the
    /// only place that reaps the child.
    fn spawn_watcher(&self, slot: Arc<InstanceSlot>, run: u64, mut child: Child) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => LifecycleEvent::Exited {
                    run,
                    outcome: status.into(),
                },
                Err(e) => LifecycleEvent::Lost {
                    run,
                    reason: format!("wait failed: {e}"),
                },
            };
            supervisor.on_process_exit(&slot, event).await;
        });
    }

    async fn on_process_exit(&self, slot: &InstanceSlot, event: LifecycleEvent) {
        let mut state = slot.state.lock().await;
        let id = state.id.clone();
        if let Err(e) = self.commit(&mut state, event) {
            tracing::error!(room = %id, "Failed to record process exit: {}", e);
            return;
        }

        match state.status {
            RoomStatus::Crashed => {
                let reason = match (state.last_exit_code, state.last_signal) {
                    (Some(code), _) => format!("exited on its own with code {code}"),
                    (None, Some(sig)) => format!("killed by signal {sig}"),
                    (None, None) => state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "exited on its own".to_string()),
                };
                tracing::warn!(room = %id, "Server crashed: {}", reason);
                self.inner.audit.record(AuditEntry {
                    room_id: id,
                    action: AuditAction::Crash,
                    success: false,
                    reason: Some(reason),
                    at: Utc::now(),
                });
            }
            RoomStatus::Stopped => tracing::info!(room = %id, "Server exited"),
            _ => {}
        }
    }

    async fn stop_room(&self, id: &str) -> Result<InstanceView> {
        let slot = self.inner.store.require(id)?;

        let (pid, run, term_sent) = {
            let mut state = slot.state.lock().await;
            match state.status {
                RoomStatus::Running => {
                    self.commit(&mut state, LifecycleEvent::StopRequested)?;
                }
                RoomStatus::Stopping => {
                    tracing::info!(room = %id, "Stop already in progress, retrying escalation");
                }
                _ => return Err(PanelError::NotRunning),
            }
            let pid = state.pid.ok_or(PanelError::NotRunning)?;
            let term_sent = match send_signal(pid, Signal::SIGTERM) {
                Ok(()) => true,
                Err(errno) => {
                    tracing::warn!(room = %id, pid, "SIGTERM failed: {}", errno);
                    false
                }
            };
            (pid, state.run, term_sent)
        };

        let grace = if term_sent {
            self.inner.settings.stop_grace
        } else {
            Duration::ZERO
        };
        if !self.wait_for_exit(&slot, run, grace).await {
            self.force_kill(&slot, run).await?;
            if !self
                .wait_for_exit(&slot, run, self.inner.settings.kill_confirm)
                .await
            {
                let reason = format!("pid {pid} still alive after SIGKILL");
                let mut state = slot.state.lock().await;
                self.commit(
                    &mut state,
                    LifecycleEvent::StopFailed {
                        reason: reason.clone(),
                    },
                )?;
                return Err(PanelError::StopFailed(reason));
            }
        }

        tracing::info!(room = %id, "Stopped server");
        let state = slot.state.lock().await;
        Ok(InstanceView::new(&state, slot.config()))
    }

    async fn force_kill(&self, slot: &InstanceSlot, run: u64) -> Result<()> {
        let mut state = slot.state.lock().await;
        // the watcher may have committed while we were waiting
        if state.run != run || state.status != RoomStatus::Stopping {
            return Ok(());
        }
        let Some(pid) = state.pid else {
            return Ok(());
        };

        tracing::warn!(room = %state.id, pid, "Grace window elapsed, sending SIGKILL");
        if let Err(errno) = send_signal(pid, Signal::SIGKILL) {
            let reason = format!("SIGKILL to pid {pid} failed: {errno}");
            self.commit(
                &mut state,
                LifecycleEvent::StopFailed {
                    reason: reason.clone(),
                },
            )?;
            return Err(PanelError::StopFailed(reason));
        }
        Ok(())
    }

    /// True once run `run` is no longer attached to the room.
    async fn wait_for_exit(&self, slot: &InstanceSlot, run: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = slot.state.lock().await;
                if state.run != run || !state.status.is_active() {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Applies `event` and tells the observer about any resulting transition.
    fn commit(&self, state: &mut Instance, event: LifecycleEvent) -> Result<()> {
        if let Some(t) = state.apply(event)? {
            self.inner.observer.on_status_change(&StatusChange {
                room_id: state.id.clone(),
                old: t.old,
                new: t.new,
                pid: t.pid,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    fn record<T>(&self, id: &str, action: AuditAction, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        self.inner.audit.record(AuditEntry::new(id, action, outcome));
    }
}

fn send_signal(pid: u32, sig: Signal) -> std::result::Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    match signal::kill(NixPid::from_raw(raw), sig) {
        // already gone; the watcher will reap it
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno),
    }
}

/// Kills leftovers from a previous panel run: processes running a room's
/// executable from the room's directory.
pub async fn kill_orphaned_servers(rooms: &[RoomConfig]) {
    let sys = System::new_all();
    let mut killed = 0usize;
    for room in rooms {
        if room.directory.is_empty() {
            continue;
        }
        let exe = room.executable_path();
        let exe = std::fs::canonicalize(&exe).unwrap_or(exe);
        let dir = PathBuf::from(&room.directory);
        let dir = std::fs::canonicalize(&dir).unwrap_or(dir);

        for (pid, process) in sys.processes() {
            let same_exe = process.exe().is_some_and(|p| p == exe);
            let same_dir = process.cwd().is_some_and(|p| p == dir);
            if same_exe && same_dir {
                tracing::warn!(room = %room.id, %pid, "Found orphaned server, killing it");
                process.kill();
                killed += 1;
            }
        }
    }
    if killed > 0 {
        // Give them a moment to exit
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
