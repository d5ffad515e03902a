use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use nix::sys::signal::kill;
use nix::unistd::{getgid, getuid, Pid};
use tracing::{debug, error, info};

use crate::core::config::Config;
use crate::core::error::{MiniconError, Result};
use crate::core::id;
use crate::core::model::{Container, State};
use crate::core::registry::{Registry, StateUpdate};
use crate::platform::linux::namespaces::IdMapping;
use crate::platform::linux::orchestrator::Orchestrator;
use crate::util::{rootfs, security};

/// Registry plus the per-container orchestrators for everything currently
/// running. One manager-wide mutex serializes all access.
struct Inner {
    registry: Registry,
    orchestrators: HashMap<String, Arc<Orchestrator>>,
}

/// Top-level container lifecycle API: create / start / stop / remove / list.
///
/// Each running container gets a dedicated monitor thread that blocks in
/// `waitpid` and records the terminal state. At construction the manager
/// reconciles the persisted registry against the live process table, so
/// containers survive restarts of the runtime itself.
pub struct Manager {
    config: Config,
    inner: Arc<Mutex<Inner>>,
}

impl Manager {
    /// Load the registry and recover the state of any container recorded as
    /// running: live PIDs are re-adopted and monitored, dead ones are marked
    /// exited.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Registry::load(&config.registry_file);
        let manager = Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                registry,
                orchestrators: HashMap::new(),
            })),
        };
        manager.recover()?;
        Ok(manager)
    }

    /// Create a container in the `created` state and return its id.
    pub fn create(
        &self,
        name: &str,
        command: &[String],
        memory_limit: Option<u64>,
    ) -> Result<String> {
        if !security::validate_container_name(name) {
            return Err(MiniconError::Validation(format!(
                "invalid container name: {name:?}"
            )));
        }
        if command.is_empty() || !security::validate_command(command) {
            return Err(MiniconError::Validation(format!(
                "invalid or dangerous command: {command:?}"
            )));
        }

        let id = id::generate_id();
        let root_fs = rootfs::prepare_rootfs(&self.config, &id)?;

        let container = Container::new(
            id.as_str(),
            name,
            command.to_vec(),
            root_fs,
            name,
            memory_limit.unwrap_or(self.config.memory_limit),
        );

        self.inner.lock().unwrap().registry.save(container)?;
        info!(id = %id, name, "container created");
        Ok(id)
    }

    /// Start a created container: spin up its orchestrator, persist the
    /// `running` state, and attach a monitor thread.
    pub fn start(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let container = inner
            .registry
            .get(id)
            .ok_or_else(|| MiniconError::NotFound(id.into()))?;
        if container.state != State::Created {
            return Err(MiniconError::WrongState {
                id: id.into(),
                expected: "created",
            });
        }
        let container = container.clone();

        let mut orchestrator = Orchestrator::new();
        orchestrator.configure(
            &container.root_fs,
            &container.hostname,
            &container.command,
            container.memory_limit,
            &[IdMapping::new(0, getuid().as_raw(), 1)],
            &[IdMapping::new(0, getgid().as_raw(), 1)],
        );
        orchestrator.set_cgroup_settings(container.memory_limit);

        let pid = match orchestrator.create_container_process() {
            Ok(pid) => pid,
            Err(e) => {
                orchestrator.cleanup_resources();
                return Err(MiniconError::StartFailed {
                    id: id.into(),
                    reason: e.to_string(),
                });
            }
        };

        inner
            .registry
            .update_state(id, State::Running, StateUpdate::running(pid, Utc::now()))?;

        let orchestrator = Arc::new(orchestrator);
        inner
            .orchestrators
            .insert(id.to_string(), Arc::clone(&orchestrator));
        drop(inner);

        self.spawn_monitor(id.to_string(), orchestrator);
        info!(id, pid, "container started");
        Ok(())
    }

    /// Stop a running container: SIGTERM, a grace window, then SIGKILL.
    ///
    /// The monitor thread races this on the transition to `exited`; both
    /// orderings are safe because `exited` is idempotent as a target.
    pub fn stop(&self, id: &str) -> Result<()> {
        let orchestrator = {
            let inner = self.inner.lock().unwrap();
            let container = inner
                .registry
                .get(id)
                .ok_or_else(|| MiniconError::NotFound(id.into()))?;
            if container.state != State::Running {
                return Err(MiniconError::WrongState {
                    id: id.into(),
                    expected: "running",
                });
            }
            inner.orchestrators.get(id).cloned().ok_or_else(|| {
                MiniconError::Internal(format!("no active orchestrator for container {id}"))
            })?
        };

        orchestrator.terminate()?;

        self.inner.lock().unwrap().registry.update_state(
            id,
            State::Exited,
            StateUpdate::stopped(Utc::now()),
        )?;
        info!(id, "container stopped");
        Ok(())
    }

    /// Remove a container that is not running, along with its rootfs.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let container = inner
            .registry
            .get(id)
            .ok_or_else(|| MiniconError::NotFound(id.into()))?;
        if container.state == State::Running {
            return Err(MiniconError::WrongState {
                id: id.into(),
                expected: "created or exited",
            });
        }

        if let Some(orchestrator) = inner.orchestrators.remove(id) {
            orchestrator.cleanup_resources();
        }
        inner.registry.remove(id)?;
        drop(inner);

        rootfs::remove_rootfs(&self.config, id);
        info!(id, "container removed");
        Ok(())
    }

    /// All containers, optionally filtered by state, in creation order.
    pub fn list(&self, filter: Option<State>) -> Vec<Container> {
        self.inner.lock().unwrap().registry.get_all(filter)
    }

    pub fn get(&self, id: &str) -> Option<Container> {
        self.inner.lock().unwrap().registry.get(id).cloned()
    }

    /// Whether a monitor/orchestrator is registered for this id.
    pub fn has_active(&self, id: &str) -> bool {
        self.inner.lock().unwrap().orchestrators.contains_key(id)
    }

    /// Reconcile recorded `running` containers against the live process
    /// table: re-adopt the ones whose PID still exists, mark the rest
    /// exited with an unknown exit code.
    fn recover(&self) -> Result<()> {
        let running = {
            let inner = self.inner.lock().unwrap();
            inner.registry.get_all(Some(State::Running))
        };

        for container in running {
            let id = container.id.clone();
            match container.process_id {
                Some(pid) if pid_alive(pid) => {
                    debug!(id = %id, pid, "re-adopting running container");
                    let orchestrator = Arc::new(Orchestrator::adopt(pid));
                    self.inner
                        .lock()
                        .unwrap()
                        .orchestrators
                        .insert(id.clone(), Arc::clone(&orchestrator));
                    self.spawn_monitor(id, orchestrator);
                }
                _ => {
                    info!(id = %id, "recorded container process is gone, marking exited");
                    self.inner.lock().unwrap().registry.update_state(
                        &id,
                        State::Exited,
                        StateUpdate::exited(-1, Utc::now()),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// One background thread per running container: block until the process
    /// exits, record the terminal state, drop the orchestrator.
    fn spawn_monitor(&self, id: String, orchestrator: Arc<Orchestrator>) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("monitor-{id}"))
            .spawn(move || {
                let exit_code = match orchestrator.wait_for_exit() {
                    Ok(code) => code,
                    Err(e) => {
                        error!(id = %id, error = %e, "monitor wait failed");
                        -1
                    }
                };

                let mut inner = inner.lock().unwrap();
                if let Err(e) = inner.registry.update_state(
                    &id,
                    State::Exited,
                    StateUpdate::exited(exit_code, Utc::now()),
                ) {
                    error!(id = %id, error = %e, "could not persist exit state");
                }
                inner.orchestrators.remove(&id);
            });
        if let Err(e) = spawned {
            error!(error = %e, "could not spawn monitor thread");
        }
    }
}

/// Whether a process with this PID exists on the host (signal 0 probe).
fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    fn temp_manager() -> (tempfile::TempDir, Manager) {
        let tmp = tempfile::tempdir().unwrap();
        let manager = Manager::new(Config::rooted(tmp.path())).unwrap();
        (tmp, manager)
    }

    fn echo_command() -> Vec<String> {
        vec!["echo".into(), "hello".into()]
    }

    #[test]
    fn create_assigns_unique_ids() {
        let (_tmp, manager) = temp_manager();
        let a = manager.create("c1", &echo_command(), None).unwrap();
        let b = manager.create("c2", &echo_command(), None).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn create_rejects_invalid_name() {
        let (_tmp, manager) = temp_manager();
        let err = manager.create("c/1", &echo_command(), None).unwrap_err();
        assert!(matches!(err, MiniconError::Validation(_)));
        assert!(manager.list(None).is_empty());
    }

    #[test]
    fn create_rejects_dangerous_command() {
        let (_tmp, manager) = temp_manager();
        let command: Vec<String> = vec!["rm".into(), "-rf".into(), "/".into()];
        let err = manager.create("c2", &command, None).unwrap_err();
        assert!(matches!(err, MiniconError::Validation(_)));
        assert!(manager.list(None).is_empty());
    }

    #[test]
    fn create_prepares_rootfs_and_defaults() {
        let (tmp, manager) = temp_manager();
        let id = manager.create("web", &echo_command(), None).unwrap();

        let container = manager.get(&id).unwrap();
        assert_eq!(container.state, State::Created);
        assert_eq!(container.hostname, "web");
        assert_eq!(container.memory_limit, crate::core::config::DEFAULT_MEMORY_LIMIT);
        assert!(container
            .root_fs
            .starts_with(tmp.path().join("rootfs")));
        assert!(container.root_fs.join("etc/hosts").exists());
    }

    #[test]
    fn start_unknown_container_is_not_found() {
        let (_tmp, manager) = temp_manager();
        assert!(matches!(
            manager.start("deadbeef").unwrap_err(),
            MiniconError::NotFound(_)
        ));
    }

    #[test]
    fn stop_requires_running_state() {
        let (_tmp, manager) = temp_manager();
        let id = manager.create("c1", &echo_command(), None).unwrap();
        assert!(matches!(
            manager.stop(&id).unwrap_err(),
            MiniconError::WrongState { .. }
        ));
    }

    #[test]
    fn remove_running_container_is_denied() {
        let (tmp, manager) = temp_manager();
        let id = manager.create("c3", &echo_command(), None).unwrap();

        // Simulate a running container backed by a real process.
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        {
            let mut inner = manager.inner.lock().unwrap();
            inner
                .registry
                .update_state(
                    &id,
                    State::Running,
                    StateUpdate::running(child.id() as i32, Utc::now()),
                )
                .unwrap();
        }

        assert!(matches!(
            manager.remove(&id).unwrap_err(),
            MiniconError::WrongState { .. }
        ));

        // Reconstructing the manager adopts the live process; stop then
        // releases it and remove succeeds.
        drop(manager);
        let manager = Manager::new(Config::rooted(tmp.path())).unwrap();
        manager.stop(&id).unwrap();
        manager.remove(&id).unwrap();
        assert!(manager.get(&id).is_none());
    }

    #[test]
    fn list_filters_by_state() {
        let (_tmp, manager) = temp_manager();
        let a = manager.create("a", &echo_command(), None).unwrap();
        let b = manager.create("b", &echo_command(), None).unwrap();
        let c = manager.create("c", &echo_command(), None).unwrap();

        {
            let mut inner = manager.inner.lock().unwrap();
            inner
                .registry
                .update_state(
                    &b,
                    State::Running,
                    StateUpdate::running(std::process::id() as i32, Utc::now()),
                )
                .unwrap();
            inner
                .registry
                .update_state(&c, State::Exited, StateUpdate::exited(0, Utc::now()))
                .unwrap();
        }

        let running = manager.list(Some(State::Running));
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b);
        assert_eq!(manager.list(Some(State::Created))[0].id, a);
        assert_eq!(manager.list(None).len(), 3);
    }

    #[test]
    fn recovery_adopts_live_and_buries_dead() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::rooted(tmp.path());

        // Seed the registry with one live and one dead "running" container.
        let live_child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut dead_child = Command::new("true").spawn().unwrap();
        let dead_pid = dead_child.id() as i32;
        dead_child.wait().unwrap();

        {
            let mut registry = Registry::load(&config.registry_file);
            let mut live = Container::new(
                "11111111",
                "live",
                vec!["sleep".into(), "30".into()],
                tmp.path().join("rootfs/11111111"),
                "live",
                1024 * 1024,
            );
            live.state = State::Running;
            live.process_id = Some(live_child.id() as i32);
            registry.save(live).unwrap();

            let mut dead = Container::new(
                "22222222",
                "dead",
                vec!["true".into()],
                tmp.path().join("rootfs/22222222"),
                "dead",
                1024 * 1024,
            );
            dead.state = State::Running;
            dead.process_id = Some(dead_pid);
            registry.save(dead).unwrap();
        }

        let manager = Manager::new(config).unwrap();

        let live = manager.get("11111111").unwrap();
        assert_eq!(live.state, State::Running);
        assert!(manager.has_active("11111111"));

        let dead = manager.get("22222222").unwrap();
        assert_eq!(dead.state, State::Exited);
        assert_eq!(dead.exit_code, Some(-1));
        assert!(!manager.has_active("22222222"));

        manager.stop("11111111").unwrap();
    }

    #[test]
    fn monitor_records_exit_and_releases_orchestrator() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::rooted(tmp.path());

        let child = Command::new("sleep").arg("1").spawn().unwrap();
        {
            let mut registry = Registry::load(&config.registry_file);
            let mut container = Container::new(
                "33333333",
                "short",
                vec!["sleep".into(), "1".into()],
                tmp.path().join("rootfs/33333333"),
                "short",
                1024 * 1024,
            );
            container.state = State::Running;
            container.process_id = Some(child.id() as i32);
            registry.save(container).unwrap();
        }

        let manager = Manager::new(config).unwrap();
        assert!(manager.has_active("33333333"));

        // The adopted process exits after ~1s; the monitor thread records it.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let container = manager.get("33333333").unwrap();
            if container.state == State::Exited {
                assert_eq!(container.exit_code, Some(0));
                assert_eq!(container.process_id, None);
                assert!(container.exited_at.is_some());
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "monitor never recorded the exit"
            );
            thread::sleep(Duration::from_millis(50));
        }

        // No PID leak: the orchestrator map no longer holds the id.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.has_active("33333333") {
            assert!(std::time::Instant::now() < deadline, "orchestrator leaked");
            thread::sleep(Duration::from_millis(50));
        }
    }
}
