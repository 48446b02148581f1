//! Project-scoped JSON record store.
//!
//! Every record is one pretty-printed JSON file under `projects/<slug>/`.
//! Writes go to a temp file in the destination directory and are renamed into
//! place, so readers never see a torn record. Within a process, writes to one
//! record are serialized by a per-record mutex. Across processes the last
//! writer wins, except that [`Store::update`] refuses to rename over a record
//! that changed since it was read and retries instead.

pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::OrchardError;
use crate::paths::Paths;

pub use types::*;

/// Attempts made by [`Store::update`] before reporting a conflict.
const UPDATE_ATTEMPTS: usize = 3;

pub struct Store {
    dir: PathBuf,
    slug: String,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

/// Fields for a new issue.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub labels: Vec<String>,
    pub plan_id: Option<String>,
    pub session_id: Option<u64>,
}

/// Partial issue update; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<IssueStatus>,
    pub priority: Option<u8>,
    pub labels: Option<Vec<String>>,
    /// `Some(None)` clears the plan binding.
    pub plan_id: Option<Option<String>>,
}

/// Fields for a new session log.
#[derive(Debug, Clone, Default)]
pub struct NewLog {
    pub session_id: Option<u64>,
    pub profile: Option<String>,
    pub plan_id: Option<String>,
    pub objective: String,
    pub summary: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Profile,
    Loop,
}

impl StatsKind {
    const fn file(self) -> &'static str {
        match self {
            Self::Profile => "profile.json",
            Self::Loop => "loop.json",
        }
    }
}

/// Project slug: sanitized directory name plus 8 hex chars of the path hash.
pub fn project_slug(repo: &Path) -> String {
    let name = repo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let clean: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let digest = Sha256::digest(repo.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{}-{hex}", clean.trim_matches('-'))
}

impl Store {
    /// Open the store for the repository at `repo`, registering the project on
    /// first use.
    pub fn open(paths: &Paths, repo: &Path) -> anyhow::Result<Self> {
        let repo = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
        let slug = project_slug(&repo);
        let store = Self::at(paths.project_dir(&slug), slug.clone());
        if read_record::<Project>(&store.project_file())?.is_none() {
            let name = repo
                .file_name()
                .map_or_else(|| slug.clone(), |n| n.to_string_lossy().into_owned());
            let project = Project {
                name,
                slug,
                repo_path: repo.to_string_lossy().into_owned(),
                active_plan_id: None,
                created_at: Utc::now(),
            };
            // A concurrent first open may win; either record is equivalent.
            let _ = create_record(&store.project_file(), &project)?;
        }
        Ok(store)
    }

    /// Open an already-registered project by slug.
    pub fn open_slug(paths: &Paths, slug: &str) -> anyhow::Result<Self> {
        let store = Self::at(paths.project_dir(slug), slug.to_string());
        if read_record::<Project>(&store.project_file())?.is_none() {
            return Err(OrchardError::NotFound {
                what: "project",
                id: slug.to_string(),
            }
            .into());
        }
        Ok(store)
    }

    fn at(dir: PathBuf, slug: String) -> Self {
        Self {
            dir,
            slug,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn project_file(&self) -> PathBuf {
        self.dir.join("project.json")
    }

    fn kind_dir(&self, kind: &str) -> PathBuf {
        self.dir.join(kind)
    }

    fn record_path(&self, kind: &str, id: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{id}.json"))
    }

    pub fn project(&self) -> anyhow::Result<Project> {
        read_record(&self.project_file())?.ok_or_else(|| {
            OrchardError::NotFound {
                what: "project",
                id: self.slug.clone(),
            }
            .into()
        })
    }

    // -- generic record plumbing --------------------------------------------

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Read-modify-write one record. `f` sees the current value (`None` when
    /// the record does not exist) and returns the replacement. Fails with
    /// `store_conflict` when another writer keeps changing the record.
    pub fn update<T, F>(&self, path: &Path, mut f: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> anyhow::Result<T>,
    {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = path.parent().context("record path has no parent")?;
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        for attempt in 1..=UPDATE_ATTEMPTS {
            let before = read_bytes(path)?;
            let current = before
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()
                .with_context(|| format!("parsing {}", path.display()))?;
            let next = f(current)?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir)
                .with_context(|| format!("creating temp file in {}", dir.display()))?;
            serde_json::to_writer_pretty(&mut tmp, &next)?;
            tmp.write_all(b"\n")?;
            tmp.flush()?;

            if read_bytes(path)? != before {
                debug!(path = %path.display(), attempt, "record changed underneath update");
                continue;
            }
            tmp.persist(path)
                .with_context(|| format!("renaming into {}", path.display()))?;
            return Ok(next);
        }
        Err(OrchardError::StoreConflict(path.display().to_string()).into())
    }

    /// Create a record with the next free `<prefix>-<n>` id in `kind`.
    fn allocate<T, F>(&self, kind: &str, prefix: &str, make: F) -> anyhow::Result<T>
    where
        T: Serialize,
        F: Fn(String) -> T,
    {
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut next = self.max_numeric_id(kind, prefix)? + 1;
        loop {
            let id = format!("{prefix}-{next}");
            let record = make(id.clone());
            if create_record(&self.record_path(kind, &id), &record)? {
                return Ok(record);
            }
            next += 1;
        }
    }

    fn max_numeric_id(&self, kind: &str, prefix: &str) -> anyhow::Result<u64> {
        let head = format!("{prefix}-");
        Ok(self
            .record_ids(kind)?
            .iter()
            .filter_map(|id| id.strip_prefix(&head)?.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }

    fn record_ids(&self, kind: &str) -> anyhow::Result<Vec<String>> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("listing {}", dir.display()))),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json")
                && !id.starts_with('.')
            {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    fn list_kind<T: DeserializeOwned>(&self, kind: &str) -> anyhow::Result<Vec<T>> {
        let mut out = Vec::new();
        for id in self.record_ids(kind)? {
            if let Some(record) = read_record(&self.record_path(kind, &id))? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn get_kind<T: DeserializeOwned>(&self, kind: &str, what: &'static str, id: &str) -> anyhow::Result<T> {
        let exact = self.record_path(kind, id);
        if let Some(record) = read_record(&exact)? {
            return Ok(record);
        }
        let found = self
            .record_ids(kind)?
            .into_iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(id));
        if let Some(actual) = found
            && let Some(record) = read_record(&self.record_path(kind, &actual))?
        {
            return Ok(record);
        }
        Err(OrchardError::NotFound {
            what,
            id: id.to_string(),
        }
        .into())
    }

    // -- plans ---------------------------------------------------------------

    /// Create an active plan. Phases are `(title, description)` pairs and get
    /// ids `1..n`, each depending on the previous one.
    pub fn create_plan(
        &self,
        id: Option<&str>,
        title: &str,
        description: &str,
        phases: &[(String, String)],
    ) -> anyhow::Result<Plan> {
        let now = Utc::now();
        let phases: Vec<Phase> = phases
            .iter()
            .enumerate()
            .map(|(i, (title, description))| Phase {
                id: (i + 1).to_string(),
                title: title.clone(),
                description: description.clone(),
                status: PhaseStatus::NotStarted,
                priority: 0,
                depends_on: if i == 0 { Vec::new() } else { vec![i.to_string()] },
            })
            .collect();
        let make = |id: String| Plan {
            id,
            title: title.to_string(),
            description: description.to_string(),
            status: PlanStatus::Active,
            phases: phases.clone(),
            created_at: now,
            updated_at: now,
        };

        let Some(id) = id else {
            return self.allocate("plans", "plan", make);
        };
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(OrchardError::Config(format!("invalid plan id {id:?}")).into());
        }
        if self.record_ids("plans")?.iter().any(|p| p.eq_ignore_ascii_case(id)) {
            return Err(OrchardError::Config(format!("plan {id} already exists")).into());
        }
        let plan = make(id.to_string());
        fs::create_dir_all(self.kind_dir("plans"))?;
        if !create_record(&self.record_path("plans", id), &plan)? {
            return Err(OrchardError::Config(format!("plan {id} already exists")).into());
        }
        Ok(plan)
    }

    pub fn get_plan(&self, id: &str) -> anyhow::Result<Plan> {
        self.get_kind("plans", "plan", id)
    }

    pub fn list_plans(&self) -> anyhow::Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = self.list_kind("plans")?;
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    /// Change a plan's status and apply the issue side effects: `done` rebinds
    /// its open issues to shared, `cancelled` closes its open issues as
    /// `wontfix`. A plan leaving `active` stops being the active plan.
    pub fn set_plan_status(&self, id: &str, status: PlanStatus) -> anyhow::Result<Plan> {
        let plan_id = self.get_plan(id)?.id;
        let path = self.record_path("plans", &plan_id);
        let plan = self.update(&path, |current: Option<Plan>| {
            let mut plan = current.ok_or_else(|| OrchardError::NotFound {
                what: "plan",
                id: plan_id.clone(),
            })?;
            plan.status = status;
            plan.updated_at = Utc::now();
            Ok(plan)
        })?;

        for issue in self.list_issues(&Scope::Plan(plan.id.clone()), true)? {
            let update = match status {
                PlanStatus::Done => IssueUpdate {
                    plan_id: Some(None),
                    ..IssueUpdate::default()
                },
                PlanStatus::Cancelled => IssueUpdate {
                    status: Some(IssueStatus::Wontfix),
                    ..IssueUpdate::default()
                },
                PlanStatus::Active | PlanStatus::Frozen => continue,
            };
            self.update_issue(&issue.id, &update)?;
        }

        if status != PlanStatus::Active {
            self.update(&self.project_file(), |current: Option<Project>| {
                let mut project = current.context("project record missing")?;
                if project
                    .active_plan_id
                    .as_deref()
                    .is_some_and(|a| a.eq_ignore_ascii_case(&plan.id))
                {
                    project.active_plan_id = None;
                }
                Ok(project)
            })?;
        }
        Ok(plan)
    }

    pub fn set_phase_status(&self, plan_id: &str, phase_id: &str, status: PhaseStatus) -> anyhow::Result<Plan> {
        let plan_id = self.get_plan(plan_id)?.id;
        let path = self.record_path("plans", &plan_id);
        self.update(&path, |current: Option<Plan>| {
            let mut plan = current.ok_or_else(|| OrchardError::NotFound {
                what: "plan",
                id: plan_id.clone(),
            })?;
            let phase = plan
                .phases
                .iter_mut()
                .find(|p| p.id.eq_ignore_ascii_case(phase_id))
                .ok_or_else(|| OrchardError::NotFound {
                    what: "phase",
                    id: phase_id.to_string(),
                })?;
            phase.status = status;
            plan.updated_at = Utc::now();
            Ok(plan)
        })
    }

    /// Select the plan new sessions work on. Only active plans qualify.
    pub fn set_active_plan(&self, id: &str) -> anyhow::Result<Project> {
        let plan = self.get_plan(id)?;
        if plan.status != PlanStatus::Active {
            return Err(OrchardError::PlanNotActive(plan.id).into());
        }
        self.update(&self.project_file(), |current: Option<Project>| {
            let mut project = current.context("project record missing")?;
            project.active_plan_id = Some(plan.id.clone());
            Ok(project)
        })
    }

    /// The project's active plan, if it is still active.
    pub fn active_plan(&self) -> anyhow::Result<Option<Plan>> {
        let Some(id) = self.project()?.active_plan_id else {
            return Ok(None);
        };
        match self.get_plan(&id) {
            Ok(plan) if plan.status == PlanStatus::Active => Ok(Some(plan)),
            Ok(_) => Ok(None),
            Err(e) if crate::error::kind_of(&e) == crate::error::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -- issues --------------------------------------------------------------

    pub fn create_issue(&self, new: &NewIssue) -> anyhow::Result<Issue> {
        if let Some(plan) = &new.plan_id {
            self.get_plan(plan)?;
        }
        let now = Utc::now();
        self.allocate("issues", "iss", |id| Issue {
            id,
            title: new.title.clone(),
            description: new.description.clone(),
            status: IssueStatus::Open,
            priority: new.priority,
            labels: new.labels.clone(),
            plan_id: new.plan_id.clone(),
            session_id: new.session_id,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_issue(&self, id: &str) -> anyhow::Result<Issue> {
        self.get_kind("issues", "issue", id)
    }

    /// Issues in `scope`, most urgent first (lowest priority number).
    pub fn list_issues(&self, scope: &Scope, open_only: bool) -> anyhow::Result<Vec<Issue>> {
        let mut issues: Vec<Issue> = self
            .list_kind::<Issue>("issues")?
            .into_iter()
            .filter(|i| scope.matches(i.plan_id.as_deref()))
            .filter(|i| !open_only || i.status.is_open())
            .collect();
        issues.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(issues)
    }

    pub fn update_issue(&self, id: &str, update: &IssueUpdate) -> anyhow::Result<Issue> {
        let issue_id = self.get_issue(id)?.id;
        let path = self.record_path("issues", &issue_id);
        self.update(&path, |current: Option<Issue>| {
            let mut issue = current.ok_or_else(|| OrchardError::NotFound {
                what: "issue",
                id: issue_id.clone(),
            })?;
            if let Some(title) = &update.title {
                issue.title.clone_from(title);
            }
            if let Some(description) = &update.description {
                issue.description.clone_from(description);
            }
            if let Some(status) = update.status {
                issue.status = status;
            }
            if let Some(priority) = update.priority {
                issue.priority = priority;
            }
            if let Some(labels) = &update.labels {
                issue.labels.clone_from(labels);
            }
            if let Some(plan_id) = &update.plan_id {
                issue.plan_id.clone_from(plan_id);
            }
            issue.updated_at = Utc::now();
            Ok(issue)
        })
    }

    // -- documents -----------------------------------------------------------

    pub fn create_doc(&self, title: &str, content: &str, plan_id: Option<&str>) -> anyhow::Result<Doc> {
        if let Some(plan) = plan_id {
            self.get_plan(plan)?;
        }
        let now = Utc::now();
        self.allocate("docs", "doc", |id| Doc {
            id,
            title: title.to_string(),
            content: content.to_string(),
            plan_id: plan_id.map(ToString::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_doc(&self, id: &str) -> anyhow::Result<Doc> {
        self.get_kind("docs", "doc", id)
    }

    pub fn list_docs(&self, scope: &Scope) -> anyhow::Result<Vec<Doc>> {
        let mut docs: Vec<Doc> = self
            .list_kind::<Doc>("docs")?
            .into_iter()
            .filter(|d| scope.matches(d.plan_id.as_deref()))
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(docs)
    }

    // -- session logs --------------------------------------------------------

    pub fn create_log(&self, new: &NewLog) -> anyhow::Result<SessionLog> {
        let now = Utc::now();
        self.allocate("logs", "log", |id| SessionLog {
            id,
            session_id: new.session_id,
            profile: new.profile.clone(),
            plan_id: new.plan_id.clone(),
            objective: new.objective.clone(),
            summary: new.summary.clone(),
            fields: new.fields.clone(),
            created_at: now,
        })
    }

    pub fn get_log(&self, id: &str) -> anyhow::Result<SessionLog> {
        self.get_kind("logs", "log", id)
    }

    /// Logs in `scope`, oldest first.
    pub fn list_logs(&self, scope: &Scope) -> anyhow::Result<Vec<SessionLog>> {
        let mut logs: Vec<SessionLog> = self
            .list_kind::<SessionLog>("logs")?
            .into_iter()
            .filter(|l| scope.matches(l.plan_id.as_deref()))
            .collect();
        logs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(logs)
    }

    pub fn latest_log(&self, scope: &Scope) -> anyhow::Result<Option<SessionLog>> {
        Ok(self.list_logs(scope)?.pop())
    }

    // -- statistics ----------------------------------------------------------

    fn stats_path(&self, kind: StatsKind) -> PathBuf {
        self.dir.join("stats").join(kind.file())
    }

    /// Fold one run into the counters for `name`.
    pub fn record_run(&self, kind: StatsKind, name: &str, outcome: &RunOutcome) -> anyhow::Result<Stats> {
        let mut updated = Stats::default();
        self.update(&self.stats_path(kind), |current: Option<BTreeMap<String, Stats>>| {
            let mut all = current.unwrap_or_default();
            let entry = all.entry(name.to_string()).or_default();
            entry.record(outcome);
            updated = entry.clone();
            Ok(all)
        })?;
        Ok(updated)
    }

    pub fn stats(&self, kind: StatsKind) -> anyhow::Result<BTreeMap<String, Stats>> {
        Ok(read_record(&self.stats_path(kind))?.unwrap_or_default())
    }
}

fn read_bytes(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("reading {}", path.display()))),
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    read_bytes(path)?
        .map(|bytes| {
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
        })
        .transpose()
}

/// Write `record` at `path` only if nothing is there yet. Returns false when
/// the path is taken.
fn create_record<T: Serialize>(path: &Path, record: &T) -> anyhow::Result<bool> {
    let dir = path.parent().context("record path has no parent")?;
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, record)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(anyhow::Error::new(e.error).context(format!("creating {}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("My Repo");
        fs::create_dir_all(&repo).unwrap();
        let paths = Paths::new(dir.path().join("data"));
        let store = Store::open(&paths, &repo).unwrap();
        (dir, store)
    }

    #[test]
    fn slug_is_sanitized_name_plus_hash() {
        let slug = project_slug(Path::new("/tmp/My Repo"));
        assert!(slug.starts_with("my-repo-"), "{slug}");
        assert_eq!(slug.len(), "my-repo-".len() + 8);
        assert_ne!(slug, project_slug(Path::new("/other/My Repo")));
    }

    #[test]
    fn open_registers_project_once() {
        let (dir, store) = store();
        let project = store.project().unwrap();
        assert_eq!(project.name, "My Repo");
        let again = Store::open(&Paths::new(dir.path().join("data")), &dir.path().join("My Repo")).unwrap();
        assert_eq!(again.project().unwrap().created_at, project.created_at);
    }

    #[test]
    fn issue_ids_are_sequential() {
        let (_dir, store) = store();
        let a = store.create_issue(&NewIssue { title: "a".into(), ..NewIssue::default() }).unwrap();
        let b = store.create_issue(&NewIssue { title: "b".into(), ..NewIssue::default() }).unwrap();
        assert_eq!(a.id, "iss-1");
        assert_eq!(b.id, "iss-2");
        assert_eq!(store.get_issue("ISS-2").unwrap().title, "b");
    }

    #[test]
    fn done_plan_rebinds_open_issues_to_shared() {
        let (_dir, store) = store();
        let plan = store.create_plan(Some("alpha"), "Alpha", "", &[]).unwrap();
        let open = store
            .create_issue(&NewIssue { title: "open".into(), plan_id: Some(plan.id.clone()), ..NewIssue::default() })
            .unwrap();
        let closed = store
            .create_issue(&NewIssue { title: "closed".into(), plan_id: Some(plan.id.clone()), ..NewIssue::default() })
            .unwrap();
        store
            .update_issue(&closed.id, &IssueUpdate { status: Some(IssueStatus::Resolved), ..IssueUpdate::default() })
            .unwrap();

        store.set_plan_status("alpha", PlanStatus::Done).unwrap();

        assert_eq!(store.get_issue(&open.id).unwrap().plan_id, None);
        assert_eq!(store.get_issue(&closed.id).unwrap().plan_id.as_deref(), Some("alpha"));
    }

    #[test]
    fn cancelled_plan_closes_open_issues_as_wontfix() {
        let (_dir, store) = store();
        store.create_plan(Some("beta"), "Beta", "", &[]).unwrap();
        let issue = store
            .create_issue(&NewIssue { title: "x".into(), plan_id: Some("beta".into()), ..NewIssue::default() })
            .unwrap();
        store
            .update_issue(&issue.id, &IssueUpdate { status: Some(IssueStatus::InProgress), ..IssueUpdate::default() })
            .unwrap();
        store.set_plan_status("beta", PlanStatus::Cancelled).unwrap();
        let issue = store.get_issue(&issue.id).unwrap();
        assert_eq!(issue.status, IssueStatus::Wontfix);
        assert_eq!(issue.plan_id.as_deref(), Some("beta"));
    }

    #[test]
    fn non_active_plan_cannot_be_selected() {
        let (_dir, store) = store();
        store.create_plan(Some("gamma"), "Gamma", "", &[]).unwrap();
        store.set_active_plan("gamma").unwrap();
        assert_eq!(store.active_plan().unwrap().unwrap().id, "gamma");

        store.set_plan_status("gamma", PlanStatus::Frozen).unwrap();
        assert!(store.active_plan().unwrap().is_none());
        let err = store.set_active_plan("gamma").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::PlanNotActive);
    }

    #[test]
    fn plan_ids_unique_case_insensitively() {
        let (_dir, store) = store();
        store.create_plan(Some("Delta"), "d", "", &[]).unwrap();
        assert!(store.create_plan(Some("delta"), "d", "", &[]).is_err());
        let generated = store.create_plan(None, "auto", "", &[]).unwrap();
        assert_eq!(generated.id, "plan-1");
    }

    #[test]
    fn phases_chain_dependencies() {
        let (_dir, store) = store();
        let phases = vec![("one".to_string(), String::new()), ("two".to_string(), String::new())];
        let plan = store.create_plan(None, "p", "", &phases).unwrap();
        assert_eq!(plan.current_phase().unwrap().id, "1");
        let plan = store.set_phase_status(&plan.id, "1", PhaseStatus::Complete).unwrap();
        assert_eq!(plan.current_phase().unwrap().id, "2");
    }

    #[test]
    fn scoped_listing() {
        let (_dir, store) = store();
        store.create_plan(Some("p"), "p", "", &[]).unwrap();
        store.create_doc("shared", "s", None).unwrap();
        store.create_doc("scoped", "s", Some("p")).unwrap();
        assert_eq!(store.list_docs(&Scope::Shared).unwrap().len(), 1);
        assert_eq!(store.list_docs(&Scope::Plan("p".into())).unwrap().len(), 1);
        assert_eq!(store.list_docs(&Scope::PlanAndShared("p".into())).unwrap().len(), 2);
    }

    #[test]
    fn latest_log_is_newest() {
        let (_dir, store) = store();
        store.create_log(&NewLog { summary: "first".into(), ..NewLog::default() }).unwrap();
        store.create_log(&NewLog { summary: "second".into(), ..NewLog::default() }).unwrap();
        assert_eq!(store.latest_log(&Scope::All).unwrap().unwrap().summary, "second");
    }

    #[test]
    fn stats_accumulate_per_name() {
        let (_dir, store) = store();
        let ok = RunOutcome { success: true, cycles: 1, ..RunOutcome::default() };
        store.record_run(StatsKind::Profile, "p", &ok).unwrap();
        let stats = store.record_run(StatsKind::Profile, "p", &ok).unwrap();
        assert_eq!(stats.success_count, 2);
        assert!(store.stats(StatsKind::Loop).unwrap().is_empty());
    }

    #[test]
    fn update_reports_conflict_when_record_keeps_changing() {
        let (_dir, store) = store();
        let path = store.dir().join("scratch.json");
        let mut n = 0u32;
        let err = store
            .update(&path, |_: Option<u32>| {
                n += 1;
                fs::write(&path, format!("{n}")).unwrap();
                Ok(n)
            })
            .unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::StoreConflict);
    }

    #[test]
    fn concurrent_updates_in_process_do_not_lose_writes() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let ok = RunOutcome { success: true, ..RunOutcome::default() };
                    store.record_run(StatsKind::Loop, "l", &ok).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.stats(StatsKind::Loop).unwrap()["l"].total_runs, 8);
    }
}
