use std::process::ExitCode;

use serde::{Deserialize, Serialize};

/// Stable, user-visible error kinds.
///
/// The string form is what appears in `ack` frames, `error` meta events and
/// the one-line CLI summary, so renaming a variant is a protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    ProfileNotFound,
    LoopNotFound,
    RoleNotFound,
    AgentLaunchFailed,
    RecordingCorrupted,
    SocketUnavailable,
    SessionNotFound,
    NoParentSession,
    SpawnDenied,
    SpawnQueueTimeout,
    TurnTimeout,
    FatalAgentFailures,
    StoreConflict,
    WorktreeBusy,
    PushDeliveryFailed,
    NotFound,
    PlanNotActive,
    PermissionDenied,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config_invalid",
            Self::ProfileNotFound => "profile_not_found",
            Self::LoopNotFound => "loop_not_found",
            Self::RoleNotFound => "role_not_found",
            Self::AgentLaunchFailed => "agent_launch_failed",
            Self::RecordingCorrupted => "recording_corrupted",
            Self::SocketUnavailable => "socket_unavailable",
            Self::SessionNotFound => "session_not_found",
            Self::NoParentSession => "no_parent_session",
            Self::SpawnDenied => "spawn_denied",
            Self::SpawnQueueTimeout => "spawn_queue_timeout",
            Self::TurnTimeout => "turn_timeout",
            Self::FatalAgentFailures => "fatal_agent_failures",
            Self::StoreConflict => "store_conflict",
            Self::WorktreeBusy => "worktree_busy",
            Self::PushDeliveryFailed => "push_delivery_failed",
            Self::NotFound => "not_found",
            Self::PlanNotActive => "plan_not_active",
            Self::PermissionDenied => "permission_denied",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Parse the wire form back into a kind. Unknown strings map to `Internal`.
    pub fn parse(s: &str) -> Self {
        match s {
            "config_invalid" => Self::ConfigInvalid,
            "profile_not_found" => Self::ProfileNotFound,
            "loop_not_found" => Self::LoopNotFound,
            "role_not_found" => Self::RoleNotFound,
            "agent_launch_failed" => Self::AgentLaunchFailed,
            "recording_corrupted" => Self::RecordingCorrupted,
            "socket_unavailable" => Self::SocketUnavailable,
            "session_not_found" => Self::SessionNotFound,
            "no_parent_session" => Self::NoParentSession,
            "spawn_denied" => Self::SpawnDenied,
            "spawn_queue_timeout" => Self::SpawnQueueTimeout,
            "turn_timeout" => Self::TurnTimeout,
            "fatal_agent_failures" => Self::FatalAgentFailures,
            "store_conflict" => Self::StoreConflict,
            "worktree_busy" => Self::WorktreeBusy,
            "push_delivery_failed" => Self::PushDeliveryFailed,
            "not_found" => Self::NotFound,
            "plan_not_active" => Self::PlanNotActive,
            "permission_denied" => Self::PermissionDenied,
            "cancelled" => Self::Cancelled,
            _ => Self::Internal,
        }
    }

    /// User errors exit 1, system errors exit 2, cancellation exits 130.
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::ConfigInvalid
            | Self::ProfileNotFound
            | Self::LoopNotFound
            | Self::RoleNotFound
            | Self::SessionNotFound
            | Self::NoParentSession
            | Self::SpawnDenied
            | Self::SpawnQueueTimeout
            | Self::StoreConflict
            | Self::WorktreeBusy
            | Self::NotFound
            | Self::PlanNotActive
            | Self::PermissionDenied => 1,
            Self::Cancelled => 130,
            Self::AgentLaunchFailed
            | Self::RecordingCorrupted
            | Self::SocketUnavailable
            | Self::TurnTimeout
            | Self::FatalAgentFailures
            | Self::PushDeliveryFailed
            | Self::Internal => 2,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that carry a stable kind and therefore a specific exit code.
#[derive(Debug, thiserror::Error)]
pub enum OrchardError {
    #[error("config error: {0}")]
    Config(String),

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("loop not found: {0}")]
    LoopNotFound(String),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("failed to launch {program}: {message}")]
    AgentLaunch { program: String, message: String },

    #[error("recording corrupted at byte {offset}: {message}")]
    RecordingCorrupted { offset: u64, message: String },

    #[error("session socket unavailable: {0}")]
    SocketUnavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(u64),

    #[error("ORCHARD_SESSION_ID is not set; this command must run inside an orchard session")]
    NoParentSession,

    #[error("spawn denied: {0}")]
    SpawnDenied(String),

    #[error("spawn queue timeout after {secs}s waiting for a {profile} slot")]
    SpawnQueueTimeout { profile: String, secs: u64 },

    #[error("turn timed out after {0}s")]
    TurnTimeout(u64),

    #[error("{0} consecutive agent failures")]
    FatalAgentFailures(u32),

    #[error("store conflict on {0}")]
    StoreConflict(String),

    #[error("worktree busy: {0}")]
    WorktreeBusy(String),

    #[error("push delivery failed: {0}")]
    PushDelivery(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("plan {0} is not active")]
    PlanNotActive(String),

    #[error("not permitted in this step: {0}")]
    PermissionDenied(String),

    #[error("cancelled")]
    Cancelled,

    /// An error reported by a remote party (daemon ack) with its original kind.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("{0}")]
    Internal(String),
}

impl OrchardError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::ConfigInvalid,
            Self::ProfileNotFound(_) => ErrorKind::ProfileNotFound,
            Self::LoopNotFound(_) => ErrorKind::LoopNotFound,
            Self::RoleNotFound(_) => ErrorKind::RoleNotFound,
            Self::AgentLaunch { .. } => ErrorKind::AgentLaunchFailed,
            Self::RecordingCorrupted { .. } => ErrorKind::RecordingCorrupted,
            Self::SocketUnavailable(_) => ErrorKind::SocketUnavailable,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::NoParentSession => ErrorKind::NoParentSession,
            Self::SpawnDenied(_) => ErrorKind::SpawnDenied,
            Self::SpawnQueueTimeout { .. } => ErrorKind::SpawnQueueTimeout,
            Self::TurnTimeout(_) => ErrorKind::TurnTimeout,
            Self::FatalAgentFailures(_) => ErrorKind::FatalAgentFailures,
            Self::StoreConflict(_) => ErrorKind::StoreConflict,
            Self::WorktreeBusy(_) => ErrorKind::WorktreeBusy,
            Self::PushDelivery(_) => ErrorKind::PushDeliveryFailed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PlanNotActive(_) => ErrorKind::PlanNotActive,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Remote { kind, .. } => *kind,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.kind().exit_code())
    }
}

/// Find the error kind anywhere in an anyhow chain; defaults to `Internal`.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<OrchardError>())
        .map_or(ErrorKind::Internal, OrchardError::kind)
}
