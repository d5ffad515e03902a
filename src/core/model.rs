use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a container.
///
/// Transitions are `created → running → exited`; `exited` is terminal until
/// the container is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Created,
    Running,
    Exited,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "exited" => Ok(Self::Exited),
            other => Err(format!("invalid state: {other}")),
        }
    }
}

/// Persisted record of a single container. The sole entity in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Unique 8-char lowercase hex id, assigned at creation.
    pub id: String,
    /// User-chosen name.
    pub name: String,
    /// The command (argv) to execute; `command[0]` is the executable.
    pub command: Vec<String>,
    /// Absolute path of the container's root filesystem.
    pub root_fs: PathBuf,
    /// Hostname inside the container. Defaults to `name`.
    pub hostname: String,
    /// Memory limit in bytes.
    pub memory_limit: u64,
    /// Host-visible PID of the container's init, set while running.
    pub process_id: Option<i32>,
    /// Current lifecycle state.
    pub state: State,
    /// Exit code once exited; `-1` means unknown or abnormal.
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl Container {
    /// Build a fresh container record in the `created` state.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        command: Vec<String>,
        root_fs: impl Into<PathBuf>,
        hostname: impl Into<String>,
        memory_limit: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command,
            root_fs: root_fs.into(),
            hostname: hostname.into(),
            memory_limit,
            process_id: None,
            state: State::Created,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            exited_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Container {
        Container::new(
            "abcdef12",
            "web",
            vec!["echo".into(), "hello".into()],
            "/var/lib/minicon/rootfs/abcdef12",
            "web",
            262_144_000,
        )
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(State::Created.to_string(), "created");
        assert_eq!(State::Running.to_string(), "running");
        assert_eq!(State::Exited.to_string(), "exited");
    }

    #[test]
    fn state_parses_from_lowercase_name() {
        assert_eq!("created".parse::<State>().unwrap(), State::Created);
        assert_eq!("running".parse::<State>().unwrap(), State::Running);
        assert_eq!("exited".parse::<State>().unwrap(), State::Exited);
        assert!("paused".parse::<State>().is_err());
    }

    #[test]
    fn state_serializes_as_lowercase_name() {
        assert_eq!(serde_json::to_string(&State::Running).unwrap(), "\"running\"");
    }

    #[test]
    fn new_container_starts_created() {
        let c = sample();
        assert_eq!(c.state, State::Created);
        assert_eq!(c.process_id, None);
        assert_eq!(c.exit_code, None);
        assert!(c.started_at.is_none());
        assert!(c.exited_at.is_none());
    }

    #[test]
    fn serialization_round_trip() {
        let mut c = sample();
        c.state = State::Exited;
        c.process_id = None;
        c.exit_code = Some(0);
        c.started_at = Some(Utc::now());
        c.exited_at = Some(Utc::now());

        let json = serde_json::to_string(&c).expect("serialize");
        let back: Container = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, c);
    }

    #[test]
    fn datetimes_serialize_as_iso8601() {
        let c = sample();
        let json = serde_json::to_string(&c).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let created = value["created_at"].as_str().unwrap();
        assert!(created.contains('T'), "expected ISO-8601 timestamp, got {created}");
    }
}
