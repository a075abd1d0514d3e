use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{PanelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Error,
}

impl RoomStatus {
    /// A process may be attached in these states.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RoomStatus::Starting | RoomStatus::Running | RoomStatus::Stopping
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Stopped => "stopped",
            RoomStatus::Starting => "starting",
            RoomStatus::Running => "running",
            RoomStatus::Stopping => "stopping",
            RoomStatus::Crashed => "crashed",
            RoomStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Everything that can happen to a room. `Instance::apply` is the only place
/// where status, pid and timestamps change.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A process handle exists for run `run`.
    Launched { pid: u32, run: u64 },
    /// The launched process survived spawn.
    Confirmed,
    LaunchFailed { reason: String },
    StopRequested,
    StopFailed { reason: String },
    Exited { run: u64, outcome: ExitOutcome },
    /// The process exited but could not be waited on cleanly.
    Lost { run: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub old: RoomStatus,
    pub new: RoomStatus,
    pub pid: Option<u32>,
}

/// Runtime state of one room. Only ever touched under the room's lock.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub status: RoomStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
    pub last_error: Option<String>,
    /// Set before the termination signal goes out, cleared when the exit is
    /// committed. Decides between `stopped` and `crashed`.
    pub stop_requested: bool,
    pub current_players: u32,
    /// Generation of the current (or last) run.
    pub run: u64,
    /// Set once the room is removed from the store.
    pub removed: bool,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RoomStatus::Stopped,
            pid: None,
            started_at: None,
            last_exit_code: None,
            last_signal: None,
            last_error: None,
            stop_requested: false,
            current_players: 0,
            run: 0,
            removed: false,
        }
    }

    pub fn ensure_can_start(&self) -> Result<()> {
        if self.removed {
            return Err(PanelError::UnknownRoom(self.id.clone()));
        }
        if self.status.is_active() {
            return Err(PanelError::AlreadyRunning);
        }
        Ok(())
    }

    pub fn apply(&mut self, event: LifecycleEvent) -> Result<Option<Transition>> {
        let old = self.status;
        match event {
            LifecycleEvent::Launched { pid, run } => {
                self.ensure_can_start()?;
                self.status = RoomStatus::Starting;
                self.pid = Some(pid);
                self.run = run;
                self.started_at = Some(Utc::now());
                self.last_exit_code = None;
                self.last_signal = None;
                self.last_error = None;
                self.stop_requested = false;
                self.current_players = 0;
            }
            LifecycleEvent::Confirmed => {
                if self.status != RoomStatus::Starting {
                    return Ok(None);
                }
                self.status = RoomStatus::Running;
            }
            LifecycleEvent::LaunchFailed { reason } => {
                self.ensure_can_start()?;
                self.status = RoomStatus::Error;
                self.pid = None;
                self.started_at = None;
                self.last_exit_code = None;
                self.last_signal = None;
                self.last_error = Some(reason);
            }
            LifecycleEvent::StopRequested => {
                if self.status != RoomStatus::Running {
                    return Err(PanelError::NotRunning);
                }
                self.stop_requested = true;
                self.status = RoomStatus::Stopping;
            }
            LifecycleEvent::StopFailed { reason } => {
                // stale pid stays for inspection
                self.last_error = Some(reason);
                return Ok(None);
            }
            LifecycleEvent::Exited { run, outcome } => {
                if !self.owns_run(run) {
                    return Ok(None);
                }
                self.status = if self.stop_requested {
                    RoomStatus::Stopped
                } else {
                    RoomStatus::Crashed
                };
                self.last_exit_code = outcome.code;
                self.last_signal = outcome.signal;
                self.clear_run();
            }
            LifecycleEvent::Lost { run, reason } => {
                if !self.owns_run(run) {
                    return Ok(None);
                }
                self.status = if self.stop_requested {
                    RoomStatus::Stopped
                } else {
                    RoomStatus::Crashed
                };
                self.last_error = Some(reason);
                self.clear_run();
            }
        }

        Ok((old != self.status).then_some(Transition {
            old,
            new: self.status,
            pid: self.pid,
        }))
    }

    fn owns_run(&self, run: u64) -> bool {
        run == self.run && self.status.is_active()
    }

    fn clear_run(&mut self) {
        self.pid = None;
        self.started_at = None;
        self.current_players = 0;
        self.stop_requested = false;
    }

    pub fn uptime_seconds(&self) -> Option<u64> {
        self.started_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(pid: u32, run: u64) -> Instance {
        let mut inst = Instance::new("room1");
        inst.apply(LifecycleEvent::Launched { pid, run }).unwrap();
        inst.apply(LifecycleEvent::Confirmed).unwrap();
        inst
    }

    #[test]
    fn normal_run_walks_every_state() {
        let mut inst = Instance::new("room1");
        let mut seen = vec![inst.status];
        for event in [
            LifecycleEvent::Launched { pid: 42, run: 1 },
            LifecycleEvent::Confirmed,
            LifecycleEvent::StopRequested,
            LifecycleEvent::Exited {
                run: 1,
                outcome: ExitOutcome {
                    code: None,
                    signal: Some(15),
                },
            },
        ] {
            let t = inst.apply(event).unwrap().unwrap();
            assert_eq!(t.old, *seen.last().unwrap());
            seen.push(t.new);
        }

        assert_eq!(
            seen,
            vec![
                RoomStatus::Stopped,
                RoomStatus::Starting,
                RoomStatus::Running,
                RoomStatus::Stopping,
                RoomStatus::Stopped,
            ]
        );
        assert_eq!(inst.pid, None);
        assert_eq!(inst.started_at, None);
        assert!(!inst.stop_requested);
        assert_eq!(inst.last_signal, Some(15));
    }

    #[test]
    fn unrequested_exit_is_a_crash() {
        let mut inst = running(42, 1);
        inst.current_players = 3;
        let t = inst
            .apply(LifecycleEvent::Exited {
                run: 1,
                outcome: ExitOutcome {
                    code: Some(3),
                    signal: None,
                },
            })
            .unwrap()
            .unwrap();

        assert_eq!((t.old, t.new), (RoomStatus::Running, RoomStatus::Crashed));
        assert_eq!(inst.last_exit_code, Some(3));
        assert_eq!(inst.current_players, 0);
        assert!(inst.ensure_can_start().is_ok());
    }

    #[test]
    fn pid_is_set_only_while_active() {
        let mut inst = Instance::new("room1");
        assert!(inst.pid.is_none());
        inst.apply(LifecycleEvent::Launched { pid: 7, run: 1 }).unwrap();
        assert!(inst.status.is_active() && inst.pid == Some(7));
        inst.apply(LifecycleEvent::Confirmed).unwrap();
        inst.apply(LifecycleEvent::StopRequested).unwrap();
        assert!(inst.status.is_active() && inst.pid == Some(7));
        inst.apply(LifecycleEvent::Exited {
            run: 1,
            outcome: ExitOutcome::default(),
        })
        .unwrap();
        assert!(!inst.status.is_active() && inst.pid.is_none());
    }

    #[test]
    fn double_start_is_rejected() {
        let mut inst = running(42, 1);
        let err = inst
            .apply(LifecycleEvent::Launched { pid: 43, run: 2 })
            .unwrap_err();
        assert!(matches!(err, PanelError::AlreadyRunning));
        assert_eq!(inst.pid, Some(42));
    }

    #[test]
    fn stop_outside_running_is_rejected() {
        let mut inst = Instance::new("room1");
        assert!(matches!(
            inst.apply(LifecycleEvent::StopRequested),
            Err(PanelError::NotRunning)
        ));
        assert!(matches!(
            inst.apply(LifecycleEvent::StopRequested),
            Err(PanelError::NotRunning)
        ));
        assert_eq!(inst.status, RoomStatus::Stopped);
    }

    #[test]
    fn stale_exit_from_previous_run_is_ignored() {
        let mut inst = running(50, 2);
        let t = inst
            .apply(LifecycleEvent::Exited {
                run: 1,
                outcome: ExitOutcome::default(),
            })
            .unwrap();
        assert!(t.is_none());
        assert_eq!(inst.status, RoomStatus::Running);
        assert_eq!(inst.pid, Some(50));
    }

    #[test]
    fn failed_stop_keeps_stopping_and_pid() {
        let mut inst = running(42, 1);
        inst.apply(LifecycleEvent::StopRequested).unwrap();
        let t = inst
            .apply(LifecycleEvent::StopFailed {
                reason: "EPERM".to_string(),
            })
            .unwrap();
        assert!(t.is_none());
        assert_eq!(inst.status, RoomStatus::Stopping);
        assert_eq!(inst.pid, Some(42));
        assert_eq!(inst.last_error.as_deref(), Some("EPERM"));
    }

    #[test]
    fn launch_failure_lands_in_error_and_allows_retry() {
        let mut inst = Instance::new("room1");
        let t = inst
            .apply(LifecycleEvent::LaunchFailed {
                reason: "No such file".to_string(),
            })
            .unwrap()
            .unwrap();
        assert_eq!((t.old, t.new), (RoomStatus::Stopped, RoomStatus::Error));
        assert!(inst.pid.is_none());
        assert!(inst.ensure_can_start().is_ok());
    }

    #[test]
    fn removed_room_cannot_start() {
        let mut inst = Instance::new("room1");
        inst.removed = true;
        assert!(matches!(
            inst.ensure_can_start(),
            Err(PanelError::UnknownRoom(_))
        ));
    }
}
