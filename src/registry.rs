//! Port-keyed registry of running MySQL instances.
//!
//! A [`Registry`] is owned by its caller and shared by reference. Reserving a
//! port, recording its process and removing it all happen under one lock; the
//! slow work of a `start` (directory preparation, spawning, waiting and
//! bootstrapping) runs outside that lock so other ports stay usable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bootstrap;
use crate::config::{InstanceConfig, RegistrySettings};
use crate::data_dir::DataDirectory;
use crate::error::{InstanceError, Result};
use crate::launcher::{self, ServerProcess};
use crate::readiness::{CancellationToken, ReadinessWaiter};

/// Lifecycle of a registered port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Reserved by an in-flight `start`.
    Starting,
    Running,
    /// `start` failed after the server was spawned; the process is kept
    /// so it can still be stopped.
    Aborted,
}

/// Details of an instance returned by a successful start.
#[derive(Clone, Debug)]
pub struct InstanceInfo {
    pub port: u16,
    pub pid: u32,
    pub reused: bool,
    pub socket: PathBuf,
    pub target: PathBuf,
    pub started_at: DateTime<Utc>,
}

enum Slot {
    /// Reservation of one `start` call, told apart from later reservations
    /// of the same port by its generation.
    Starting {
        generation: u64,
        process: Option<ServerProcess>,
    },
    Running {
        process: ServerProcess,
        info: InstanceInfo,
    },
    Aborted(ServerProcess),
}

impl Slot {
    fn state(&self) -> InstanceState {
        match self {
            Slot::Starting { .. } => InstanceState::Starting,
            Slot::Running { .. } => InstanceState::Running,
            Slot::Aborted(_) => InstanceState::Aborted,
        }
    }

    fn is_reserved_by(&self, generation: u64) -> bool {
        matches!(self, Slot::Starting { generation: owner, .. } if *owner == generation)
    }

    fn into_process(self) -> Option<ServerProcess> {
        match self {
            Slot::Starting { process, .. } => process,
            Slot::Running { process, .. } | Slot::Aborted(process) => Some(process),
        }
    }
}

pub struct Registry {
    slots: Mutex<HashMap<u16, Slot>>,
    generations: AtomicU64,
    last_clean: Mutex<Option<bool>>,
    settings: RegistrySettings,
    cancel: Option<CancellationToken>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

impl Registry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            last_clean: Mutex::new(None),
            settings,
            cancel: None,
        }
    }

    /// Lets `token` interrupt readiness waits of every later `start`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Starts an instance on `config.port()` and blocks until it is reachable.
    ///
    /// `target` is wiped and bootstrapped unless it already holds a `data`
    /// directory and `force_erase` is false. `socket` overrides the default
    /// `<target>/mysql.sock`.
    pub fn start(
        &self,
        config: &InstanceConfig,
        dist: &Path,
        target: &Path,
        force_erase: bool,
        socket: Option<&Path>,
    ) -> Result<InstanceInfo> {
        if !dist.is_dir() {
            return Err(InstanceError::DistributionNotFound {
                path: dist.to_path_buf(),
            });
        }
        let dist = absolute(dist)?;
        let target = absolute(target)?;
        let socket = socket.map(absolute).transpose()?;
        let port = config.port();
        let generation = self.reserve(port)?;
        match self.launch_reserved(generation, config, &dist, &target, force_erase, socket) {
            Ok(info) => {
                info!("MySQL database is up and running at the {port} port");
                Ok(info)
            }
            Err(err) => Err(self.abort(port, generation, err)),
        }
    }

    /// Like [`Registry::start`], but stops the instance when the returned
    /// guard is dropped.
    pub fn start_scoped(
        &self,
        config: &InstanceConfig,
        dist: &Path,
        target: &Path,
        force_erase: bool,
        socket: Option<&Path>,
    ) -> Result<InstanceGuard<'_>> {
        let info = self.start(config, dist, target, force_erase, socket)?;
        Ok(InstanceGuard {
            registry: self,
            info,
        })
    }

    /// Removes and terminates whatever is registered on `port`.
    ///
    /// Returns false when nothing was registered, so repeated calls are
    /// harmless. Works on starting and aborted instances too.
    pub fn stop(&self, port: u16) -> bool {
        let slot = self.lock_slots().remove(&port);
        let Some(slot) = slot else {
            return false;
        };
        if let Some(mut process) = slot.into_process()
            && let Err(err) = process.terminate(self.settings.stop_timeout)
        {
            warn!("failed to stop mysqld on port {port}: {err}");
        }
        info!("MySQL instance on port {port} stopped");
        true
    }

    /// Stops every registered instance, returning how many there were.
    pub fn terminate_all(&self) -> usize {
        let slots: Vec<(u16, Slot)> = self.lock_slots().drain().collect();
        let count = slots.len();
        for (port, slot) in slots {
            if let Some(mut process) = slot.into_process()
                && let Err(err) = process.terminate(self.settings.stop_timeout)
            {
                warn!("failed to stop mysqld on port {port}: {err}");
            }
        }
        if count > 0 {
            info!("stopped {count} MySQL instance(s)");
        }
        count
    }

    /// Whether the most recent `start` reused an existing database; false
    /// before any start.
    pub fn reused_existing_database(&self) -> bool {
        let last_clean = *self
            .last_clean
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        !last_clean.unwrap_or(true)
    }

    /// Reuse decision of the running instance on `port`.
    pub fn reused(&self, port: u16) -> Option<bool> {
        match self.lock_slots().get(&port) {
            Some(Slot::Running { info, .. }) => Some(info.reused),
            _ => None,
        }
    }

    pub fn state(&self, port: u16) -> Option<InstanceState> {
        self.lock_slots().get(&port).map(Slot::state)
    }

    pub fn info(&self, port: u16) -> Option<InstanceInfo> {
        match self.lock_slots().get(&port) {
            Some(Slot::Running { info, .. }) => Some(info.clone()),
            _ => None,
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock_slots().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Claims `port` for one `start` call and returns the reservation's
    /// generation.
    fn reserve(&self, port: u16) -> Result<u64> {
        let mut slots = self.lock_slots();
        if slots.contains_key(&port) {
            return Err(InstanceError::PortConflict { port });
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            port,
            Slot::Starting {
                generation,
                process: None,
            },
        );
        Ok(generation)
    }

    fn launch_reserved(
        &self,
        generation: u64,
        config: &InstanceConfig,
        dist: &Path,
        target: &Path,
        force_erase: bool,
        socket: Option<PathBuf>,
    ) -> Result<InstanceInfo> {
        let port = config.port();
        let dir = DataDirectory::decide(target, force_erase);
        *self
            .last_clean
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dir.is_clean());
        dir.prepare()?;
        dir.bootstrap(dist)?;

        let socket = socket.unwrap_or_else(|| dir.default_socket());
        if socket.exists() {
            std::fs::remove_file(&socket).map_err(|err| InstanceError::io(&socket, err))?;
            info!("removed stale socket {}", socket.display());
        }

        let process = launcher::launch(config, dist, &dir, &socket)?;
        let pid = process.pid();
        self.attach(port, generation, process)?;

        let mut waiter =
            ReadinessWaiter::new(self.settings.startup_timeout, self.settings.poll_interval);
        if let Some(token) = &self.cancel {
            waiter = waiter.with_cancel(token.clone());
        }
        waiter.wait(&socket, port, || self.exit_status(port, generation))?;

        if dir.is_clean() {
            bootstrap::configure(config, dist, &socket, &self.settings)?;
        }

        let info = InstanceInfo {
            port,
            pid,
            reused: !dir.is_clean(),
            socket,
            target: target.to_path_buf(),
            started_at: Utc::now(),
        };
        let mut slots = self.lock_slots();
        if !slots
            .get(&port)
            .is_some_and(|slot| slot.is_reserved_by(generation))
        {
            return Err(InstanceError::StoppedDuringStartup { port });
        }
        let Some(Slot::Starting {
            process: Some(process),
            ..
        }) = slots.remove(&port)
        else {
            return Err(InstanceError::StoppedDuringStartup { port });
        };
        slots.insert(
            port,
            Slot::Running {
                process,
                info: info.clone(),
            },
        );
        Ok(info)
    }

    /// Hands a freshly spawned process to its own reservation, or terminates
    /// it when that reservation was stopped in the meantime.
    fn attach(&self, port: u16, generation: u64, mut process: ServerProcess) -> Result<()> {
        let mut slots = self.lock_slots();
        if let Some(Slot::Starting {
            generation: owner,
            process: slot,
        }) = slots.get_mut(&port)
            && *owner == generation
        {
            *slot = Some(process);
            return Ok(());
        }
        drop(slots);
        if let Err(err) = process.terminate(self.settings.stop_timeout) {
            warn!("failed to stop mysqld on port {port}: {err}");
        }
        Err(InstanceError::StoppedDuringStartup { port })
    }

    fn exit_status(&self, port: u16, generation: u64) -> Option<String> {
        match self.lock_slots().get_mut(&port) {
            Some(Slot::Starting {
                generation: owner,
                process: Some(process),
            }) if *owner == generation => process.exit_status().map(|status| status.to_string()),
            _ => None,
        }
    }

    /// Releases the reservation of a failed start. A still-living server is
    /// parked as [`InstanceState::Aborted`] so `stop` can reach it.
    fn abort(&self, port: u16, generation: u64, err: InstanceError) -> InstanceError {
        let mut slots = self.lock_slots();
        if !slots
            .get(&port)
            .is_some_and(|slot| slot.is_reserved_by(generation))
        {
            return match err {
                InstanceError::StoppedDuringStartup { .. } => err,
                _ => InstanceError::StoppedDuringStartup { port },
            };
        }
        if let Some(Slot::Starting {
            process: Some(mut process),
            ..
        }) = slots.remove(&port)
            && process.exit_status().is_none()
        {
            warn!(
                "mysqld pid {} on port {port} left running after failed start; stop the port to clean it up",
                process.pid()
            );
            slots.insert(port, Slot::Aborted(process));
        }
        err
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<u16, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

/// Stops its instance when dropped.
pub struct InstanceGuard<'a> {
    registry: &'a Registry,
    info: InstanceInfo,
}

impl InstanceGuard<'_> {
    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.registry.stop(self.info.port);
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|err| InstanceError::io(path, err))
}
