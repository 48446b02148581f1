//! On-disk layout of the orchard data root.
//!
//! ```text
//! <root>/
//!   profiles.yaml
//!   projects/<slug>/...
//!   records/<session-id>/events.log
//!   records/<session-id>/daemon.log
//!   sessions/<session-id>.{json,sock,pid}
//!   sessions/next_id
//!   worktrees/<parent-id>-<child-index>/
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Environment variable that overrides the data root.
pub const HOME_ENV: &str = "ORCHARD_HOME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the data root: `$ORCHARD_HOME`, else the platform data dir.
    pub fn discover() -> anyhow::Result<Self> {
        if let Ok(home) = std::env::var(HOME_ENV)
            && !home.is_empty()
        {
            return Ok(Self::new(home));
        }
        let base = dirs::data_dir().context("no platform data directory; set ORCHARD_HOME")?;
        Ok(Self::new(base.join("orchard")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Config file, preferring YAML, then TOML, then JSON. Falls back to the
    /// YAML path when none exists yet.
    pub fn config_file(&self) -> PathBuf {
        for name in ["profiles.yaml", "profiles.yml", "profiles.toml", "profiles.json"] {
            let candidate = self.root.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
        self.root.join("profiles.yaml")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project_dir(&self, slug: &str) -> PathBuf {
        self.projects_dir().join(slug)
    }

    pub fn records_dir(&self, session_id: u64) -> PathBuf {
        self.root.join("records").join(session_id.to_string())
    }

    pub fn recording_file(&self, session_id: u64) -> PathBuf {
        self.records_dir(session_id).join("events.log")
    }

    pub fn daemon_log(&self, session_id: u64) -> PathBuf {
        self.records_dir(session_id).join("daemon.log")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_meta(&self, session_id: u64) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    pub fn session_socket(&self, session_id: u64) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.sock"))
    }

    pub fn session_pid(&self, session_id: u64) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.pid"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn worktree(&self, parent_session: u64, child_index: u32) -> PathBuf {
        self.worktrees_dir()
            .join(format!("{parent_session}-{child_index}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted() {
        let paths = Paths::new("/data/orchard");
        assert_eq!(
            paths.recording_file(7),
            PathBuf::from("/data/orchard/records/7/events.log")
        );
        assert_eq!(
            paths.session_socket(7),
            PathBuf::from("/data/orchard/sessions/7.sock")
        );
        assert_eq!(
            paths.worktree(7, 2),
            PathBuf::from("/data/orchard/worktrees/7-2")
        );
    }

    #[test]
    fn config_file_prefers_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        assert!(paths.config_file().ends_with("profiles.yaml"));

        std::fs::write(dir.path().join("profiles.toml"), "").unwrap();
        assert!(paths.config_file().ends_with("profiles.toml"));

        std::fs::write(dir.path().join("profiles.yaml"), "").unwrap();
        assert!(paths.config_file().ends_with("profiles.yaml"));
    }
}
