//! Delegation: spawning bounded child sessions on behalf of the running agent.
//!
//! A spawn is authorized against the current step's delegation tree, waits
//! for a free instance slot, gets its own git worktree unless read-only, and
//! is launched as a single-step, single-turn session. A watcher thread per
//! child records how it ended. Write-capable children keep their worktree
//! until the parent merges or rejects it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::adapter::pid_alive;
use crate::cancel::CancelToken;
use crate::config::{Config, DelegationConfig, LoopDef, LoopStep};
use crate::error::OrchardError;
use crate::paths::Paths;
use crate::recorder;
use crate::registry::{DirLock, Registry};
use crate::session::SessionMeta;
use crate::session::client::AttachClient;
use crate::session::hub::Hub;
use crate::session::launch::{self, LaunchSpec};
use crate::session::protocol::{MetaEvent, SpawnArgs};
use crate::telemetry;
use crate::worktree::{self, WorktreeDiff};

/// Longest single wait before registry state is re-read. Other processes
/// change it without waking us; local changes notify `changed`.
const RECHECK: Duration = Duration::from_millis(250);

/// Starts child sessions. The daemon implementation re-executes orchard;
/// tests substitute a fake.
pub trait ChildLauncher: Send + Sync {
    /// Launch a session for `spec` and return its id once it is running.
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<u64>;
}

/// Launches children as detached daemons, the same way `orchard run` does.
pub struct DaemonLauncher {
    paths: Paths,
    config: Arc<Config>,
}

impl DaemonLauncher {
    pub const fn new(paths: Paths, config: Arc<Config>) -> Self {
        Self { paths, config }
    }
}

impl ChildLauncher for DaemonLauncher {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<u64> {
        launch::start_admitted(&self.paths, &self.config, spec).map(|meta| meta.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    Running,
    Finished,
    /// A merge or reject is in progress.
    Settling,
    Merged,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildRecord {
    pub id: u64,
    pub index: u32,
    pub profile: String,
    pub role: String,
    pub read_only: bool,
    pub handoff: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub state: ChildState,
    /// Final session status once the child has ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_kind: Option<String>,
}

/// The parent session as the manager sees it.
#[derive(Debug, Clone)]
pub struct ParentContext {
    pub session_id: u64,
    pub paths: Paths,
    pub config: Arc<Config>,
    pub repo_path: PathBuf,
    pub workdir: PathBuf,
    pub plan_id: Option<String>,
    pub read_only: bool,
}

#[derive(Default)]
struct State {
    next_index: u32,
    children: BTreeMap<u64, ChildRecord>,
}

pub struct DelegationManager {
    parent: ParentContext,
    registry: Registry,
    launcher: Arc<dyn ChildLauncher>,
    hub: Arc<Hub>,
    cancel: CancelToken,
    /// Serializes acceptances for this parent.
    accept: Mutex<()>,
    state: Mutex<State>,
    changed: Condvar,
}

/// What a spawn was allowed to become.
struct Authorized {
    profile: String,
    role: String,
    handoff: bool,
    nested: Option<DelegationConfig>,
    cap: Option<u32>,
    max_parallel: Option<u32>,
}

impl DelegationManager {
    pub fn new(
        parent: ParentContext,
        launcher: Arc<dyn ChildLauncher>,
        hub: Arc<Hub>,
        cancel: CancelToken,
    ) -> Arc<Self> {
        let registry = Registry::new(&parent.paths);
        Arc::new(Self {
            parent,
            registry,
            launcher,
            hub,
            cancel,
            accept: Mutex::new(()),
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, meta: &MetaEvent) {
        if let Err(e) = self.hub.publish_meta(meta) {
            warn!(error = %e, "cannot record delegation event");
        }
    }

    fn authorize(&self, tree: Option<&DelegationConfig>, args: &SpawnArgs) -> anyhow::Result<Authorized> {
        let denied = |reason: String| -> anyhow::Error { OrchardError::SpawnDenied(reason).into() };

        if self.cancel.is_cancelled() {
            return Err(denied("parent session is cancelling".to_string()));
        }
        let path = args.parent_path.trim_matches('/');
        let level = tree
            .filter(|t| !t.is_empty())
            .and_then(|t| t.descend(path))
            .ok_or_else(|| {
                if path.is_empty() {
                    denied("this step has no delegation rules".to_string())
                } else {
                    denied(format!("no delegation level at {path:?}"))
                }
            })?;
        let rule = level.rule_for(&args.profile).ok_or_else(|| {
            let allowed = level
                .profiles
                .iter()
                .map(|r| r.profile.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            denied(format!("{} is not delegable here (allowed: {allowed})", args.profile))
        })?;

        let role = match args.role.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            Some(role) if rule.has_role(role) => role.to_string(),
            Some(role) => {
                return Err(denied(format!(
                    "role {role} is not allowed for {} (allowed: {})",
                    rule.profile,
                    rule.roles.join(", ")
                )));
            }
            None => rule
                .roles
                .first()
                .cloned()
                .unwrap_or_else(|| self.parent.config.effective_default_role()),
        };
        self.parent.config.find_role(&role)?;
        let profile = self.parent.config.find_profile(&rule.profile)?;

        Ok(Authorized {
            profile: profile.name.clone(),
            role,
            handoff: rule.handoff,
            nested: rule.delegation.clone(),
            cap: profile.instance_cap(),
            max_parallel: level.max_parallel.filter(|n| *n > 0),
        })
    }

    fn running_children(&self) -> u32 {
        let n = self
            .lock()
            .children
            .values()
            .filter(|c| c.state == ChildState::Running)
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    /// Block until the profile has a free slot, then hold the registry-wide
    /// admission lock so the slot stays free until the child is published.
    fn wait_for_slot(self: &Arc<Self>, auth: &Authorized) -> anyhow::Result<DirLock> {
        let window = Duration::from_secs(self.parent.config.runtime.spawn_queue_secs);
        let deadline = Instant::now() + window;
        let waker = Arc::clone(self);
        let _hook = self.cancel.on_cancel(move || waker.changed.notify_all());

        loop {
            if self.cancel.is_cancelled() {
                return Err(OrchardError::Cancelled.into());
            }
            let parallel_ok = auth
                .max_parallel
                .is_none_or(|max| self.running_children() < max);
            if parallel_ok {
                let admission = self.registry.admission_lock()?;
                let live = match auth.cap {
                    Some(_) => self.registry.live_count(&auth.profile)?,
                    None => 0,
                };
                if auth.cap.is_none_or(|cap| live < cap) {
                    return Ok(admission);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchardError::SpawnQueueTimeout {
                    profile: auth.profile.clone(),
                    secs: window.as_secs(),
                }
                .into());
            }
            let state = self.lock();
            let slice = (deadline - now).min(RECHECK);
            drop(
                self.changed
                    .wait_timeout(state, slice)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }

    /// Authorize, queue, and launch a child. `tree` is the current step's
    /// delegation tree.
    pub fn spawn(self: &Arc<Self>, tree: Option<&DelegationConfig>, args: &SpawnArgs) -> anyhow::Result<ChildRecord> {
        let _serial = self.accept.lock().unwrap_or_else(PoisonError::into_inner);

        let auth = match self.authorize(tree, args) {
            Ok(a) => a,
            Err(e) => {
                telemetry::record_spawn(&args.profile, false);
                return Err(e);
            }
        };
        let admission = match self.wait_for_slot(&auth) {
            Ok(guard) => guard,
            Err(e) => {
                telemetry::record_spawn(&auth.profile, false);
                return Err(e);
            }
        };

        let index = {
            let mut state = self.lock();
            state.next_index += 1;
            state.next_index
        };
        let read_only = args.read_only || self.parent.read_only;

        let (worktree, branch) = if read_only {
            (None, None)
        } else {
            let path = self.parent.paths.worktree(self.parent.session_id, index);
            let branch = worktree::branch_name(self.parent.session_id, index);
            worktree::create(&self.parent.workdir, &path, &branch, "HEAD")?;
            (Some(path), Some(branch))
        };

        let mut step = LoopStep::new(&auth.profile);
        step.role.clone_from(&auth.role);
        step.instructions = Some(args.task.clone());
        step.delegation = auth.nested.clone();
        let mut spec = LaunchSpec::new(
            LoopDef {
                name: auth.profile.clone(),
                max_cycles: 1,
                steps: vec![step],
            },
            &self.parent.repo_path,
            worktree.as_deref().unwrap_or(&self.parent.workdir),
        );
        spec.plan_id.clone_from(&self.parent.plan_id);
        spec.parent_session_id = Some(self.parent.session_id);
        spec.child_index = Some(index);
        spec.worktree.clone_from(&worktree);
        spec.branch.clone_from(&branch);
        spec.read_only = read_only;
        spec.handoff = auth.handoff;

        let launched = self.launcher.launch(&spec);
        drop(admission);
        let child_id = match launched {
            Ok(id) => id,
            Err(e) => {
                if let Some(path) = &worktree
                    && let Err(cleanup) = worktree::remove(&self.parent.workdir, path, branch.as_deref())
                {
                    warn!(error = %cleanup, "cannot remove worktree of failed spawn");
                }
                self.emit(&MetaEvent::SpawnFailed {
                    child_id: None,
                    profile: auth.profile.clone(),
                    reason: format!("{e:#}"),
                });
                telemetry::record_spawn(&auth.profile, false);
                return Err(e);
            }
        };

        let record = ChildRecord {
            id: child_id,
            index,
            profile: auth.profile.clone(),
            role: auth.role.clone(),
            read_only,
            handoff: auth.handoff,
            worktree: worktree.clone(),
            branch,
            state: ChildState::Running,
            status: None,
            exit_kind: None,
        };
        self.lock().children.insert(child_id, record.clone());
        telemetry::record_spawn(&auth.profile, true);
        info!(parent = self.parent.session_id, child = child_id, profile = %auth.profile, read_only, "child spawned");
        self.emit(&MetaEvent::SpawnStarted {
            child_id,
            child_index: index,
            profile: auth.profile,
            role: auth.role,
            read_only,
            worktree: worktree.map(|p| p.display().to_string()),
        });
        self.watch(child_id);
        Ok(record)
    }

    fn watch(self: &Arc<Self>, child_id: u64) {
        let manager = Arc::clone(self);
        thread::spawn(move || {
            let end = manager.await_end(child_id);
            manager.finish(child_id, end);
        });
    }

    /// Block until the child session has ended. The child announces its end
    /// on its event stream and in its recording before the registry shows
    /// it; registry status and pid liveness cover children that crashed.
    fn await_end(&self, child_id: u64) -> Option<SessionMeta> {
        loop {
            let mut meta = match self.registry.lookup(child_id) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(child = child_id, error = %e, "lost track of child session");
                    return None;
                }
            };
            if !meta.status.is_live() || !meta.pid.is_some_and(pid_alive) {
                return Some(meta);
            }
            let announced =
                follow_to_end(&meta).or_else(|| recorded_end(&self.parent.paths.recording_file(child_id)));
            if let Some((status, exit_kind)) = announced {
                meta.apply_end(&status, exit_kind);
                return Some(meta);
            }
            let state = self.lock();
            drop(
                self.changed
                    .wait_timeout(state, RECHECK)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }

    fn finish(&self, child_id: u64, end: Option<SessionMeta>) {
        let (status, exit_kind) = match &end {
            Some(meta) if meta.status.is_live() => ("crashed".to_string(), Some("crashed".to_string())),
            Some(meta) => (meta.status.as_str().to_string(), meta.exit_kind.clone()),
            None => ("unknown".to_string(), None),
        };
        let profile = {
            let mut state = self.lock();
            let Some(record) = state.children.get_mut(&child_id) else {
                return;
            };
            if record.state == ChildState::Running {
                record.state = ChildState::Finished;
            }
            record.status = Some(status.clone());
            record.exit_kind.clone_from(&exit_kind);
            record.profile.clone()
        };
        self.changed.notify_all();

        if status == "crashed" || end.is_none() {
            self.emit(&MetaEvent::SpawnFailed {
                child_id: Some(child_id),
                profile,
                reason: exit_kind.unwrap_or(status),
            });
        } else {
            self.emit(&MetaEvent::SpawnFinished {
                child_id,
                status,
                exit_kind,
            });
        }
    }

    pub fn children(&self) -> Vec<ChildRecord> {
        self.lock().children.values().cloned().collect()
    }

    pub fn child(&self, id: u64) -> anyhow::Result<ChildRecord> {
        self.lock()
            .children
            .get(&id)
            .cloned()
            .ok_or_else(|| not_a_child(id))
    }

    /// Wait for a child to end. Returns the record as it stands when the
    /// child ends, the timeout passes, or the parent is cancelled.
    pub fn wait(self: &Arc<Self>, id: u64, timeout: Option<Duration>) -> anyhow::Result<ChildRecord> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let waker = Arc::clone(self);
        let _hook = self.cancel.on_cancel(move || waker.changed.notify_all());
        let mut state = self.lock();
        loop {
            let record = state
                .children
                .get(&id)
                .cloned()
                .ok_or_else(|| not_a_child(id))?;
            if record.state != ChildState::Running || self.cancel.is_cancelled() {
                return Ok(record);
            }
            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(record);
                    }
                    d - now
                }
                None => Duration::from_secs(60),
            };
            state = self
                .changed
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn writable_child(&self, id: u64) -> anyhow::Result<(ChildRecord, PathBuf, String)> {
        let record = self.child(id)?;
        match (&record.worktree, &record.branch) {
            (Some(path), Some(branch)) => {
                let (path, branch) = (path.clone(), branch.clone());
                Ok((record, path, branch))
            }
            _ => Err(OrchardError::NotFound {
                what: "worktree",
                id: format!("child {id} is read-only"),
            }
            .into()),
        }
    }

    pub fn diff(&self, id: u64) -> anyhow::Result<(WorktreeDiff, bool)> {
        let (record, path, branch) = self.writable_child(id)?;
        if matches!(record.state, ChildState::Merged | ChildState::Rejected) {
            return Err(settled(&record));
        }
        let dirty = path.exists() && worktree::is_dirty(&path)?;
        Ok((worktree::diff(&self.parent.workdir, &branch)?, dirty))
    }

    /// Take a finished child for merging or rejecting. Concurrent callers
    /// get `worktree_busy` until the first one settles it.
    fn claim(&self, id: u64) -> anyhow::Result<(ChildRecord, PathBuf, String)> {
        let (_, path, branch) = self.writable_child(id)?;
        let mut state = self.lock();
        let record = state.children.get_mut(&id).ok_or_else(|| not_a_child(id))?;
        match record.state {
            ChildState::Running => Err(OrchardError::WorktreeBusy(format!("child {id} is still running")).into()),
            ChildState::Settling => {
                Err(OrchardError::WorktreeBusy(format!("child {id} is being merged or rejected")).into())
            }
            ChildState::Merged | ChildState::Rejected => Err(settled(record)),
            ChildState::Finished => {
                record.state = ChildState::Settling;
                Ok((record.clone(), path, branch))
            }
        }
    }

    /// Merge a finished child's branch into the parent's working branch. The
    /// worktree is removed only after a successful merge.
    pub fn merge(&self, id: u64, squash: bool) -> anyhow::Result<String> {
        let (record, path, branch) = self.claim(id)?;
        let head = match self.merge_branch(&record, &path, &branch, squash) {
            Ok(head) => head,
            Err(e) => {
                self.settle(id, ChildState::Finished);
                return Err(e);
            }
        };
        self.settle(id, ChildState::Merged);
        if let Err(e) = worktree::remove(&self.parent.workdir, &path, Some(&branch)) {
            warn!(child = id, error = %e, "merged, but cannot remove worktree");
        }
        info!(child = id, squash, head = %head, "child merged");
        Ok(head)
    }

    fn merge_branch(&self, record: &ChildRecord, path: &Path, branch: &str, squash: bool) -> anyhow::Result<String> {
        if path.exists() {
            worktree::commit_all(path, &format!("orchard: work of child {} ({})", record.id, record.profile))?;
        }
        let message = format!(
            "orchard: merge child {} ({}) into session {}",
            record.id, record.profile, self.parent.session_id
        );
        worktree::merge(&self.parent.workdir, branch, squash, &message)
    }

    pub fn reject(&self, id: u64) -> anyhow::Result<()> {
        let (_, path, branch) = self.claim(id)?;
        if let Err(e) = worktree::remove(&self.parent.workdir, &path, Some(&branch)) {
            self.settle(id, ChildState::Finished);
            return Err(e);
        }
        self.settle(id, ChildState::Rejected);
        info!(child = id, "child rejected");
        Ok(())
    }

    fn settle(&self, id: u64, state: ChildState) {
        if let Some(record) = self.lock().children.get_mut(&id) {
            record.state = state;
        }
        self.changed.notify_all();
    }

    /// Cancel every running child that is not a handoff. Called when the
    /// parent session ends.
    pub fn cancel_children(&self) {
        for record in self.children() {
            if record.state != ChildState::Running || record.handoff {
                continue;
            }
            let Ok(meta) = self.registry.lookup(record.id) else {
                continue;
            };
            match AttachClient::connect(&meta).and_then(|c| c.control("cancel", serde_json::Value::Null)) {
                Ok(_) => info!(child = record.id, "cancelled child with parent"),
                Err(e) => warn!(child = record.id, error = %e, "cannot cancel child"),
            }
        }
    }
}

fn not_a_child(id: u64) -> anyhow::Error {
    OrchardError::NotFound {
        what: "child session",
        id: id.to_string(),
    }
    .into()
}

/// Follow a live child's event stream to its `session_end` event.
fn follow_to_end(meta: &SessionMeta) -> Option<(String, Option<String>)> {
    let client = AttachClient::connect(meta).ok()?;
    let stream = client.subscribe(Some(u64::MAX), None).ok()?;
    stream.filter_map(Result::ok).find_map(|event| match event.meta() {
        Some(MetaEvent::SessionEnd { status, exit_kind }) => Some((status, exit_kind)),
        _ => None,
    })
}

/// The `session_end` event in a recording, if the session wrote one.
fn recorded_end(recording: &Path) -> Option<(String, Option<String>)> {
    let replay = recorder::replay(recording).ok()?;
    replay
        .map_while(Result::ok)
        .filter_map(|event| MetaEvent::from_payload(&event.payload))
        .filter_map(|meta| match meta {
            MetaEvent::SessionEnd { status, exit_kind } => Some((status, exit_kind)),
            _ => None,
        })
        .last()
}

fn settled(record: &ChildRecord) -> anyhow::Error {
    let what = if record.state == ChildState::Merged { "merged" } else { "rejected" };
    OrchardError::WorktreeBusy(format!("child {} was already {what}", record.id)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelegationRule, Profile};
    use crate::error::{ErrorKind, kind_of};
    use crate::recorder::Recorder;
    use crate::registry::tests::meta as fake_meta;
    use crate::session::SessionStatus;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Publishes child metadata owned by this test process instead of
    /// starting a daemon. The child "ends" when the test retires it.
    struct FakeLauncher {
        paths: Paths,
        next: AtomicU64,
        launched: Mutex<Vec<LaunchSpec>>,
    }

    impl ChildLauncher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<u64> {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            let mut meta = fake_meta(
                &self.paths,
                id,
                &spec.loop_def.steps[0].profile,
                SessionStatus::Running,
                Some(std::process::id()),
            );
            meta.parent_session_id = spec.parent_session_id;
            meta.worktree.clone_from(&spec.worktree);
            Registry::new(&self.paths).publish(&meta)?;
            self.launched.lock().unwrap().push(spec.clone());
            Ok(id)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: tempfile::TempDir,
        paths: Paths,
        launcher: Arc<FakeLauncher>,
        cancel: CancelToken,
        manager: Arc<DelegationManager>,
        tree: DelegationConfig,
    }

    fn fixture(cap: Option<u32>, queue_secs: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = crate::worktree::tests::init_repo();
        let paths = Paths::new(dir.path().join("data"));
        let mut config = Config::default();
        let mut worker = Profile::new("worker", "claude");
        worker.max_instances = cap;
        config.profiles.push(worker);
        config.profiles.push(Profile::new("lead", "claude"));
        config.runtime.spawn_queue_secs = queue_secs;

        let cancel = CancelToken::new();
        let recorder = Recorder::open(&paths.recording_file(1)).unwrap();
        let hub = Hub::new(recorder, 64, cancel.clone());
        let launcher = Arc::new(FakeLauncher {
            paths: paths.clone(),
            next: AtomicU64::new(100),
            launched: Mutex::new(Vec::new()),
        });
        let manager = DelegationManager::new(
            ParentContext {
                session_id: 1,
                paths: paths.clone(),
                config: Arc::new(config),
                repo_path: repo.path().to_path_buf(),
                workdir: repo.path().to_path_buf(),
                plan_id: None,
                read_only: false,
            },
            Arc::clone(&launcher) as Arc<dyn ChildLauncher>,
            hub,
            cancel.clone(),
        );
        let tree = DelegationConfig {
            profiles: vec![DelegationRule::new("worker", &["developer", "reviewer"])],
            max_parallel: None,
        };
        Fixture {
            _dir: dir,
            repo,
            paths,
            launcher,
            cancel,
            manager,
            tree,
        }
    }

    fn args(profile: &str, read_only: bool) -> SpawnArgs {
        SpawnArgs {
            profile: profile.into(),
            task: "do the thing".into(),
            role: None,
            read_only,
            parent_path: String::new(),
        }
    }

    fn end_child(f: &Fixture, id: u64) {
        Registry::new(&f.paths)
            .retire(id, SessionStatus::Stopped, None)
            .unwrap();
        let record = f.manager.wait(id, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(record.state, ChildState::Finished);
    }

    #[test]
    fn empty_tree_denies() {
        let f = fixture(None, 1);
        let err = f.manager.spawn(None, &args("worker", true)).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SpawnDenied);
        let empty = DelegationConfig::default();
        let err = f.manager.spawn(Some(&empty), &args("worker", true)).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SpawnDenied);
        assert!(Registry::new(&f.paths).list().unwrap().is_empty());
    }

    #[test]
    fn unlisted_profile_and_role_are_denied() {
        let f = fixture(None, 1);
        let err = f.manager.spawn(Some(&f.tree), &args("lead", true)).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SpawnDenied);

        let mut bad_role = args("worker", true);
        bad_role.role = Some("scout".into());
        let err = f.manager.spawn(Some(&f.tree), &bad_role).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SpawnDenied);
    }

    #[test]
    fn read_only_child_shares_workdir_and_records_parent() {
        let f = fixture(None, 1);
        let record = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap();
        assert!(record.read_only);
        assert!(record.worktree.is_none());
        assert_eq!(record.role, "developer");

        let launched = f.launcher.launched.lock().unwrap().clone();
        assert_eq!(launched[0].workdir, f.repo.path());
        assert_eq!(launched[0].parent_session_id, Some(1));
        assert_eq!(launched[0].loop_def.steps[0].instructions.as_deref(), Some("do the thing"));
        assert_eq!(launched[0].loop_def.steps[0].effective_turns(), 1);

        let meta = Registry::new(&f.paths).lookup(record.id).unwrap();
        assert_eq!(meta.parent_session_id, Some(1));
    }

    #[test]
    fn cancelled_parent_denies() {
        let f = fixture(None, 1);
        f.cancel.cancel();
        let err = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SpawnDenied);
    }

    #[test]
    fn instance_cap_times_out_and_never_overcommits() {
        let f = fixture(Some(1), 1);
        f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap();
        let started = Instant::now();
        let err = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SpawnQueueTimeout);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(Registry::new(&f.paths).live_count("worker").unwrap(), 1);
    }

    #[test]
    fn queued_spawn_proceeds_when_slot_frees() {
        let f = fixture(Some(1), 10);
        let first = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap();
        let paths = f.paths.clone();
        let freer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            Registry::new(&paths)
                .retire(first.id, SessionStatus::Stopped, None)
                .unwrap();
        });
        let second = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap();
        freer.join().unwrap();
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn cancel_drops_queued_spawn() {
        let f = fixture(Some(1), 30);
        f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap();
        let cancel = f.cancel.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });
        let started = Instant::now();
        let err = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap_err();
        trigger.join().unwrap();
        assert_eq!(kind_of(&err), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn merge_twice_is_success_then_busy() {
        let f = fixture(None, 1);
        let record = f.manager.spawn(Some(&f.tree), &args("worker", false)).unwrap();
        let path = record.worktree.clone().unwrap();
        assert!(path.exists());
        std::fs::write(path.join("child.txt"), "from child\n").unwrap();

        let err = f.manager.merge(record.id, true).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::WorktreeBusy);

        end_child(&f, record.id);
        let (diff, dirty) = f.manager.diff(record.id).unwrap();
        assert!(dirty);
        assert!(diff.commits.is_empty());

        f.manager.merge(record.id, true).unwrap();
        assert!(f.repo.path().join("child.txt").exists());
        assert!(!path.exists());

        let err = f.manager.merge(record.id, true).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::WorktreeBusy);
        assert_eq!(f.manager.child(record.id).unwrap().state, ChildState::Merged);
    }

    #[test]
    fn failed_merge_keeps_worktree() {
        let f = fixture(None, 1);
        let record = f.manager.spawn(Some(&f.tree), &args("worker", false)).unwrap();
        let path = record.worktree.clone().unwrap();
        std::fs::write(path.join("README.md"), "child\n").unwrap();
        end_child(&f, record.id);

        std::fs::write(f.repo.path().join("README.md"), "parent\n").unwrap();
        crate::worktree::commit_all(f.repo.path(), "parent edit").unwrap();

        assert!(f.manager.merge(record.id, false).is_err());
        assert!(path.exists());
        assert_eq!(f.manager.child(record.id).unwrap().state, ChildState::Finished);
    }

    #[test]
    fn concurrent_merges_of_one_child_leave_one_winner() {
        let f = fixture(None, 1);
        let record = f.manager.spawn(Some(&f.tree), &args("worker", false)).unwrap();
        std::fs::write(record.worktree.as_ref().unwrap().join("child.txt"), "from child\n").unwrap();
        end_child(&f, record.id);

        let merges: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&f.manager);
                thread::spawn(move || manager.merge(record.id, true))
            })
            .collect();
        let results: Vec<_> = merges.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.into_iter().find_map(Result::err).unwrap();
        assert_eq!(kind_of(&loser), ErrorKind::WorktreeBusy);
        assert_eq!(f.manager.child(record.id).unwrap().state, ChildState::Merged);
        assert!(f.repo.path().join("child.txt").exists());
    }

    #[test]
    fn recorded_session_end_finishes_child_before_registry_catches_up() {
        let f = fixture(None, 1);
        let record = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap();
        let mut recorder = Recorder::open(&f.paths.recording_file(record.id)).unwrap();
        let end = MetaEvent::SessionEnd {
            status: "stopped".into(),
            exit_kind: Some("cancelled".into()),
        };
        recorder.append(crate::recorder::EventKind::Meta, &end.to_payload()).unwrap();

        let done = f.manager.wait(record.id, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(done.state, ChildState::Finished);
        assert_eq!(done.status.as_deref(), Some("stopped"));
        assert_eq!(done.exit_kind.as_deref(), Some("cancelled"));
        assert!(Registry::new(&f.paths).lookup(record.id).unwrap().status.is_live());
    }

    #[test]
    fn reject_discards_worktree() {
        let f = fixture(None, 1);
        let record = f.manager.spawn(Some(&f.tree), &args("worker", false)).unwrap();
        let path = record.worktree.clone().unwrap();
        end_child(&f, record.id);
        f.manager.reject(record.id).unwrap();
        assert!(!path.exists());
        let err = f.manager.reject(record.id).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::WorktreeBusy);
    }

    #[test]
    fn read_only_child_has_nothing_to_merge() {
        let f = fixture(None, 1);
        let record = f.manager.spawn(Some(&f.tree), &args("worker", true)).unwrap();
        end_child(&f, record.id);
        let err = f.manager.merge(record.id, false).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::NotFound);
    }

    #[test]
    fn nested_path_reaches_inner_rules() {
        let f = fixture(None, 1);
        let mut outer = DelegationRule::new("lead", &["developer"]);
        outer.delegation = Some(f.tree.clone());
        let tree = DelegationConfig {
            profiles: vec![outer],
            max_parallel: None,
        };
        let mut nested = args("worker", true);
        nested.parent_path = "lead".into();
        assert!(f.manager.spawn(Some(&tree), &nested).is_ok());
        // At the root only `lead` is delegable.
        assert!(f.manager.spawn(Some(&tree), &args("worker", true)).is_err());
    }
}
