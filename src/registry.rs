//! Per-user session registry under `sessions/`.
//!
//! One JSON metadata file per session, plus the socket and pid file of live
//! sessions. Id allocation, status transitions and the boot sweep hold an
//! advisory `flock` on `sessions/.lock`; every other operation is a plain
//! read or an atomic temp-file rename by the session's single writer.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::adapter::pid_alive;
use crate::error::OrchardError;
use crate::paths::Paths;
use crate::session::{SESSION_ENV, SessionMeta, SessionStatus};

#[derive(Debug, Clone)]
pub struct Registry {
    paths: Paths,
}

/// Outcome of [`Registry::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub crashed: Vec<u64>,
    pub worktrees_removed: Vec<PathBuf>,
}

/// Exclusive advisory lock on a file in the sessions directory, released on
/// drop.
pub struct DirLock {
    _file: File,
}

impl DirLock {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        // SAFETY: flock on a descriptor we own; the lock dies with the file.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(anyhow::Error::new(std::io::Error::last_os_error())
                .context(format!("locking {}", path.display())));
        }
        Ok(Self { _file: file })
    }
}

/// Session id of the calling in-agent command.
pub fn current_session_id() -> anyhow::Result<u64> {
    let raw = std::env::var(SESSION_ENV).map_err(|_| OrchardError::NoParentSession)?;
    raw.trim()
        .parse()
        .map_err(|_| OrchardError::Config(format!("{SESSION_ENV}={raw:?} is not a session id")).into())
}

impl Registry {
    pub fn new(paths: &Paths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn dir(&self) -> anyhow::Result<PathBuf> {
        let dir = self.paths.sessions_dir();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    fn lock(&self) -> anyhow::Result<DirLock> {
        DirLock::acquire(&self.dir()?.join(".lock"))
    }

    /// Held while a spawn checks instance caps and launches its child, so
    /// parents in different processes cannot both take the last slot.
    pub fn admission_lock(&self) -> anyhow::Result<DirLock> {
        DirLock::acquire(&self.dir()?.join(".admission"))
    }

    /// Next session id. Monotonic across processes and restarts.
    pub fn allocate_id(&self) -> anyhow::Result<u64> {
        let dir = self.dir()?;
        let _lock = self.lock()?;
        let counter = dir.join("next_id");
        let stored = fs::read_to_string(&counter)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(1);
        let seen = self.list()?.iter().map(|m| m.id + 1).max().unwrap_or(1);
        let id = stored.max(seen);

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        writeln!(tmp, "{}", id + 1)?;
        tmp.persist(&counter)
            .with_context(|| format!("writing {}", counter.display()))?;
        debug!(id, "allocated session id");
        Ok(id)
    }

    /// Write `meta` atomically.
    pub fn publish(&self, meta: &SessionMeta) -> anyhow::Result<()> {
        let dir = self.dir()?;
        let path = self.paths.session_meta(meta.id);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, meta)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn lookup(&self, id: u64) -> anyhow::Result<SessionMeta> {
        let path = self.paths.session_meta(id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchardError::SessionNotFound(id).into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("reading {}", path.display()))),
        };
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    /// All sessions, ordered by id. Unreadable entries are skipped.
    pub fn list(&self) -> anyhow::Result<Vec<SessionMeta>> {
        let dir = self.paths.sessions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("listing {}", dir.display()))),
        };
        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            match self.lookup(id) {
                Ok(meta) => out.push(meta),
                Err(e) => warn!(id, error = %e, "skipping unreadable session metadata"),
            }
        }
        out.sort_by_key(|m| m.id);
        Ok(out)
    }

    /// Read-modify-write one session's metadata.
    pub fn update(&self, id: u64, f: impl FnOnce(&mut SessionMeta)) -> anyhow::Result<SessionMeta> {
        let mut meta = self.lookup(id)?;
        f(&mut meta);
        self.publish(&meta)?;
        Ok(meta)
    }

    /// Move a live session to another live status. A session that already
    /// ended keeps its terminal status; returns `None` then.
    pub fn set_live_status(&self, id: u64, status: SessionStatus) -> anyhow::Result<Option<SessionMeta>> {
        let _lock = self.lock()?;
        let mut meta = self.lookup(id)?;
        if !meta.status.is_live() {
            debug!(id, status = meta.status.as_str(), "session already ended; status kept");
            return Ok(None);
        }
        meta.status = status;
        self.publish(&meta)?;
        Ok(Some(meta))
    }

    /// Record a terminal status and remove the socket and pid file.
    pub fn retire(&self, id: u64, status: SessionStatus, exit_kind: Option<&str>) -> anyhow::Result<SessionMeta> {
        let _lock = self.lock()?;
        self.retire_locked(id, status, exit_kind)
    }

    fn retire_locked(&self, id: u64, status: SessionStatus, exit_kind: Option<&str>) -> anyhow::Result<SessionMeta> {
        let meta = self.update(id, |m| {
            m.status = status;
            m.ended_at = Some(Utc::now());
            if let Some(kind) = exit_kind {
                m.exit_kind = Some(kind.to_string());
            }
        })?;
        remove_if_present(&meta.socket_path);
        remove_if_present(&self.paths.session_pid(id));
        info!(id, status = status.as_str(), exit_kind, "session retired");
        Ok(meta)
    }

    /// Live sessions with a step running `profile` (case-insensitive).
    pub fn live_count(&self, profile: &str) -> anyhow::Result<u32> {
        let n = self
            .list()?
            .iter()
            .filter(|m| m.status.is_live() && m.uses_profile(profile))
            .count();
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    pub fn children_of(&self, parent: u64) -> anyhow::Result<Vec<SessionMeta>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.parent_session_id == Some(parent))
            .collect())
    }

    /// Mark live sessions whose process is gone as crashed, remove their
    /// sockets and pid files, and clean up their worktrees unless
    /// `keep_worktrees` is set.
    pub fn sweep(&self, keep_worktrees: bool) -> anyhow::Result<SweepReport> {
        let _lock = self.lock()?;
        let mut report = SweepReport::default();
        for meta in self.list()? {
            if !meta.status.is_live() {
                continue;
            }
            let alive = meta.pid.is_some_and(pid_alive);
            if alive {
                continue;
            }
            warn!(id = meta.id, pid = ?meta.pid, "session process gone; marking crashed");
            self.retire_locked(meta.id, SessionStatus::Crashed, Some("crashed"))?;
            report.crashed.push(meta.id);

            if let Some(worktree) = &meta.worktree
                && !keep_worktrees
                && worktree.exists()
            {
                match crate::worktree::remove(&meta.repo_path, worktree, meta.branch.as_deref()) {
                    Ok(()) => report.worktrees_removed.push(worktree.clone()),
                    Err(e) => warn!(id = meta.id, error = %e, "orphan worktree cleanup failed"),
                }
            }
        }
        Ok(report)
    }
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "could not remove session file");
    }
}
