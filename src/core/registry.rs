use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::error::Result;
use crate::core::model::{Container, State};

/// Partial mutation applied together with a state transition.
///
/// Each `Some` field is written; `None` fields are left untouched.
/// `process_id` is doubly optional so a transition can clear it.
#[derive(Debug, Default, Clone)]
pub struct StateUpdate {
    pub process_id: Option<Option<i32>>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl StateUpdate {
    /// Fields for the `created → running` transition.
    pub fn running(pid: i32, at: DateTime<Utc>) -> Self {
        Self {
            process_id: Some(Some(pid)),
            started_at: Some(at),
            ..Self::default()
        }
    }

    /// Fields for the transition to `exited` with a known exit code.
    pub fn exited(exit_code: i32, at: DateTime<Utc>) -> Self {
        Self {
            process_id: Some(None),
            exit_code: Some(exit_code),
            exited_at: Some(at),
            ..Self::default()
        }
    }

    /// Fields for a `stop`-driven transition to `exited`. Leaves the exit
    /// code alone so the monitor's value, when it lands, is preserved.
    pub fn stopped(at: DateTime<Utc>) -> Self {
        Self {
            process_id: Some(None),
            exited_at: Some(at),
            ..Self::default()
        }
    }
}

/// Durable mapping `container id → Container`, persisted as a single JSON
/// object. Every mutation rewrites the whole file atomically (temp file +
/// rename), so a reader never observes a partial write.
#[derive(Debug)]
pub struct Registry {
    file: PathBuf,
    containers: HashMap<String, Container>,
}

impl Registry {
    /// Load the registry from `file`. An absent file yields an empty
    /// registry; a malformed one is logged and also yields an empty registry.
    pub fn load(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let containers = match fs::read_to_string(&file) {
            Ok(data) => match serde_json::from_str::<HashMap<String, Container>>(&data) {
                Ok(map) => {
                    debug!(count = map.len(), file = %file.display(), "loaded registry");
                    map
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "malformed registry file, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "could not read registry file, starting empty");
                HashMap::new()
            }
        };
        Self { file, containers }
    }

    /// Insert or replace a container and persist.
    pub fn save(&mut self, container: Container) -> Result<()> {
        self.containers.insert(container.id.clone(), container);
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<&Container> {
        self.containers.get(id)
    }

    /// All containers, optionally filtered by state, in creation-time order.
    pub fn get_all(&self, filter: Option<State>) -> Vec<Container> {
        let mut all: Vec<Container> = self
            .containers
            .values()
            .filter(|c| filter.map_or(true, |s| c.state == s))
            .cloned()
            .collect();
        all.sort_by_key(|c| c.created_at);
        all
    }

    /// Atomically set a container's state plus any subset of
    /// `process_id / exit_code / started_at / exited_at`. Returns whether the
    /// id existed.
    pub fn update_state(&mut self, id: &str, new_state: State, update: StateUpdate) -> Result<bool> {
        let Some(container) = self.containers.get_mut(id) else {
            return Ok(false);
        };
        container.state = new_state;
        if let Some(process_id) = update.process_id {
            container.process_id = process_id;
        }
        if let Some(exit_code) = update.exit_code {
            container.exit_code = Some(exit_code);
        }
        if let Some(started_at) = update.started_at {
            container.started_at = Some(started_at);
        }
        if let Some(exited_at) = update.exited_at {
            container.exited_at = Some(exited_at);
        }
        self.persist()?;
        Ok(true)
    }

    /// Remove a container and persist. Returns whether the id existed.
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        if self.containers.remove(id).is_none() {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Write the full map to `<file>.tmp`, then rename over `file`.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        let json = serde_json::to_string_pretty(&self.containers)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.file)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut path = self.file.clone().into_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }
}
