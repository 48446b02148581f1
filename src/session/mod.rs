//! Detachable sessions: metadata, wire protocol, daemon, and attach client.

pub mod client;
pub mod daemon;
pub mod hub;
pub mod launch;
pub mod protocol;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Environment variable naming the session an in-agent command belongs to.
pub const SESSION_ENV: &str = "ORCHARD_SESSION_ID";
/// Agent family of the running profile.
pub const AGENT_ENV: &str = "ORCHARD_AGENT";
/// Per-turn nonce.
pub const TURN_ENV: &str = "ORCHARD_TURN_ID";
/// Set to `1` for read-only sessions.
pub const READONLY_ENV: &str = "ORCHARD_READONLY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Detached,
    Stopped,
    Crashed,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Detached => "detached",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "detached" => Some(Self::Detached),
            "stopped" => Some(Self::Stopped),
            "crashed" => Some(Self::Crashed),
            _ => None,
        }
    }

    /// Live sessions own a socket and a pid file.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Detached)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry record for one session, stored at `sessions/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub socket_path: PathBuf,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub project: String,
    pub project_slug: String,
    pub repo_path: PathBuf,
    pub workdir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub profile: String,
    /// Every profile the loop's steps run, for instance caps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    pub agent: String,
    pub loop_name: String,
    pub step_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub handoff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_kind: Option<String>,
}

impl SessionMeta {
    /// Apply a `session_end` announcement the registry may not show yet.
    pub fn apply_end(&mut self, status: &str, exit_kind: Option<String>) {
        if let Some(status) = SessionStatus::parse(status) {
            self.status = status;
        }
        self.exit_kind = exit_kind;
    }

    /// Whether any step of this session runs `profile` (case-insensitive).
    pub fn uses_profile(&self, profile: &str) -> bool {
        self.profile.eq_ignore_ascii_case(profile) || self.profiles.iter().any(|p| p.eq_ignore_ascii_case(profile))
    }

    /// Short one-line description for listings.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{:>4}  {:<9} {:<16} {:<12} {}",
            self.id,
            self.status.as_str(),
            self.loop_name,
            self.profile,
            self.project
        );
        if let Some(parent) = self.parent_session_id {
            line.push_str(&format!("  (child of {parent})"));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_statuses() {
        assert!(SessionStatus::Starting.is_live());
        assert!(SessionStatus::Detached.is_live());
        assert!(!SessionStatus::Stopped.is_live());
        assert!(!SessionStatus::Crashed.is_live());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Detached).unwrap();
        assert_eq!(json, "\"detached\"");
    }
}
