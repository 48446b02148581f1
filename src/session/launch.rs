//! Starting a detached session daemon.
//!
//! The launcher validates the loop, allocates an id, publishes `starting`
//! metadata, writes the launch spec next to the recording, and re-executes
//! the current binary as `orchard daemon --session <id>` in a new OS session.
//! The daemon prints `ready` once its socket is bound; the launcher returns
//! only after reading it. Instance caps are checked and the new session
//! published under the registry admission lock.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, LoopDef, Profile};
use crate::error::OrchardError;
use crate::paths::{HOME_ENV, Paths};
use crate::registry::Registry;
use crate::session::{SESSION_ENV, SessionMeta, SessionStatus, TURN_ENV};
use crate::store;

pub const READY_LINE: &str = "ready";
const READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Everything a daemon needs to run a session, written to
/// `records/<id>/launch.json` by the launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub loop_def: LoopDef,
    pub repo_path: PathBuf,
    pub workdir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub handoff: bool,
}

impl LaunchSpec {
    pub fn new(loop_def: LoopDef, repo_path: &Path, workdir: &Path) -> Self {
        Self {
            loop_def,
            repo_path: repo_path.to_path_buf(),
            workdir: workdir.to_path_buf(),
            plan_id: None,
            model: None,
            reasoning: None,
            parent_session_id: None,
            child_index: None,
            worktree: None,
            branch: None,
            read_only: false,
            handoff: false,
        }
    }

    pub fn file(paths: &Paths, id: u64) -> PathBuf {
        paths.records_dir(id).join("launch.json")
    }

    pub fn save(&self, paths: &Paths, id: u64) -> anyhow::Result<()> {
        let dir = paths.records_dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = Self::file(paths, id);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.persist(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(paths: &Paths, id: u64) -> anyhow::Result<Self> {
        let path = Self::file(paths, id);
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Metadata for a new session in `starting`, owned by the launcher's pid
/// until the daemon takes over.
fn starting_meta(paths: &Paths, config: &Config, id: u64, spec: &LaunchSpec) -> anyhow::Result<SessionMeta> {
    let first = spec
        .loop_def
        .steps
        .first()
        .ok_or_else(|| OrchardError::Config(format!("loop {} has no steps", spec.loop_def.name)))?;
    let profile = config.find_profile(&first.profile)?;
    let profiles = step_profiles(config, &spec.loop_def)?
        .into_iter()
        .map(|p| p.name.clone())
        .collect();
    let project = spec
        .repo_path
        .file_name()
        .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned());
    Ok(SessionMeta {
        id,
        pid: Some(std::process::id()),
        socket_path: paths.session_socket(id),
        status: SessionStatus::Starting,
        started_at: Utc::now(),
        ended_at: None,
        project,
        project_slug: store::project_slug(&spec.repo_path),
        repo_path: spec.repo_path.clone(),
        workdir: spec.workdir.clone(),
        plan_id: spec.plan_id.clone(),
        profile: profile.name.clone(),
        profiles,
        agent: profile.agent.clone(),
        loop_name: spec.loop_def.name.clone(),
        step_count: spec.loop_def.steps.len(),
        parent_session_id: spec.parent_session_id,
        child_index: spec.child_index,
        worktree: spec.worktree.clone(),
        branch: spec.branch.clone(),
        read_only: spec.read_only,
        handoff: spec.handoff,
        exit_kind: None,
    })
}

/// Distinct profiles the loop's steps run, in step order.
fn step_profiles<'a>(config: &'a Config, loop_def: &LoopDef) -> anyhow::Result<Vec<&'a Profile>> {
    let mut profiles: Vec<&Profile> = Vec::new();
    for step in &loop_def.steps {
        let profile = config.find_profile(&step.profile)?;
        if !profiles.iter().any(|p| p.name == profile.name) {
            profiles.push(profile);
        }
    }
    Ok(profiles)
}

fn check_instance_caps(registry: &Registry, config: &Config, loop_def: &LoopDef) -> anyhow::Result<()> {
    for profile in step_profiles(config, loop_def)? {
        let Some(cap) = profile.instance_cap() else {
            continue;
        };
        let live = registry.live_count(&profile.name)?;
        if live >= cap {
            return Err(OrchardError::SpawnDenied(format!(
                "profile {} is at its instance cap ({live} of {cap} live)",
                profile.name
            ))
            .into());
        }
    }
    Ok(())
}

/// Launch a detached daemon for `spec` and wait until it is accepting
/// connections. Validation failures leave nothing behind.
pub fn start(paths: &Paths, config: &Config, spec: &LaunchSpec) -> anyhow::Result<SessionMeta> {
    config.resolve_loop(&spec.loop_def)?;
    let registry = Registry::new(paths);
    let _admission = registry.admission_lock()?;
    check_instance_caps(&registry, config, &spec.loop_def)?;
    launch(paths, config, spec)
}

/// [`start`] for a caller that already holds the admission lock and has
/// checked instance caps.
pub fn start_admitted(paths: &Paths, config: &Config, spec: &LaunchSpec) -> anyhow::Result<SessionMeta> {
    config.resolve_loop(&spec.loop_def)?;
    launch(paths, config, spec)
}

fn launch(paths: &Paths, config: &Config, spec: &LaunchSpec) -> anyhow::Result<SessionMeta> {
    let registry = Registry::new(paths);
    let id = registry.allocate_id()?;
    let meta = starting_meta(paths, config, id, spec)?;
    spec.save(paths, id)?;
    registry.publish(&meta)?;

    let crash = |reason: String| -> anyhow::Error {
        if let Err(e) = registry.retire(id, SessionStatus::Crashed, Some("socket_unavailable")) {
            warn!(id, error = %e, "cannot mark failed session crashed");
        }
        OrchardError::SocketUnavailable(format!(
            "session {id} daemon did not start: {reason} (see {})",
            paths.daemon_log(id).display()
        ))
        .into()
    };

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.daemon_log(id))
        .with_context(|| format!("opening {}", paths.daemon_log(id).display()))?;
    let exe = std::env::current_exe().context("locating the orchard binary")?;

    let mut cmd = Command::new(exe);
    cmd.args(["daemon", "--session", &id.to_string()])
        .current_dir(&spec.workdir)
        .env(HOME_ENV, paths.root())
        .env_remove(SESSION_ENV)
        .env_remove(TURN_ENV)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log));
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return Err(crash(e.to_string())),
    };
    let Some(stdout) = child.stdout.take() else {
        return Err(crash("no stdout pipe".to_string()));
    };

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        let read = BufReader::new(stdout).read_line(&mut line);
        let _ = tx.send(read.map(|_| line));
    });

    let ready = match rx.recv_timeout(READY_TIMEOUT) {
        Ok(Ok(line)) if line.trim() == READY_LINE => Ok(()),
        Ok(Ok(line)) if line.is_empty() => Err("daemon exited".to_string()),
        Ok(Ok(line)) => Err(format!("unexpected output {:?}", line.trim())),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => {
            let _ = child.kill();
            Err(format!("no ready signal within {}s", READY_TIMEOUT.as_secs()))
        }
    };

    // Reap the daemon whenever it exits so it never lingers as a zombie that
    // still answers kill(pid, 0).
    thread::spawn(move || {
        let _ = child.wait();
    });

    match ready {
        Ok(()) => {
            info!(id, loop_name = %spec.loop_def.name, "session started");
            registry.lookup(id)
        }
        Err(reason) => {
            // The daemon may already have recorded its own crash.
            match registry.lookup(id) {
                Ok(m) if m.status.is_live() => Err(crash(reason)),
                _ => Err(OrchardError::SocketUnavailable(format!(
                    "session {id} daemon did not start: {reason} (see {})",
                    paths.daemon_log(id).display()
                ))
                .into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopStep;

    #[test]
    fn spec_round_trips_through_records_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let def = LoopDef {
            name: "solo".into(),
            max_cycles: 1,
            steps: vec![LoopStep::new("p")],
        };
        let mut spec = LaunchSpec::new(def, Path::new("/repo"), Path::new("/repo"));
        spec.parent_session_id = Some(4);
        spec.read_only = true;
        spec.save(&paths, 9).unwrap();
        assert_eq!(LaunchSpec::load(&paths, 9).unwrap(), spec);
    }

    #[test]
    fn invalid_loop_allocates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let def = LoopDef {
            name: "ghost".into(),
            max_cycles: 1,
            steps: vec![LoopStep::new("missing")],
        };
        let spec = LaunchSpec::new(def, dir.path(), dir.path());
        let err = start(&paths, &Config::default(), &spec).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::ProfileNotFound);
        assert!(Registry::new(&paths).list().unwrap().is_empty());
    }

    #[test]
    fn starting_meta_uses_first_step_profile() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let mut config = Config::default();
        config.profiles.push(crate::config::Profile::new("lead", "claude"));
        let def = LoopDef {
            name: "solo".into(),
            max_cycles: 1,
            steps: vec![LoopStep::new("lead")],
        };
        let spec = LaunchSpec::new(def, Path::new("/src/widget"), Path::new("/src/widget"));
        let meta = starting_meta(&paths, &config, 3, &spec).unwrap();
        assert_eq!(meta.status, SessionStatus::Starting);
        assert_eq!(meta.profile, "lead");
        assert_eq!(meta.agent, "claude");
        assert_eq!(meta.project, "widget");
        assert_eq!(meta.socket_path, paths.session_socket(3));
    }

    #[test]
    fn capped_profile_in_a_later_step_blocks_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let mut config = Config::default();
        config.profiles.push(crate::config::Profile::new("lead", "claude"));
        let mut reviewer = crate::config::Profile::new("reviewer", "claude");
        reviewer.max_instances = Some(1);
        config.profiles.push(reviewer);

        let pipeline = LoopDef {
            name: "pipeline".into(),
            max_cycles: 1,
            steps: vec![LoopStep::new("lead"), LoopStep::new("Reviewer")],
        };
        let spec = LaunchSpec::new(pipeline, dir.path(), dir.path());
        let meta = starting_meta(&paths, &config, 1, &spec).unwrap();
        assert_eq!(meta.profiles, ["lead", "reviewer"]);
        let registry = Registry::new(&paths);
        registry.publish(&meta).unwrap();

        let review = LoopDef {
            name: "review".into(),
            max_cycles: 1,
            steps: vec![LoopStep::new("reviewer")],
        };
        let err = start(&paths, &config, &LaunchSpec::new(review, dir.path(), dir.path())).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::SpawnDenied);
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
