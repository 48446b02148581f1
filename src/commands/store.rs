//! In-agent record commands: plans, issues, session logs, and docs.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use super::{OutputFormat, Style, current_session, default_plan, open_store, print_json};
use crate::error::OrchardError;
use crate::paths::Paths;
use crate::store::{
    Doc, Issue, IssueStatus, IssueUpdate, NewIssue, NewLog, PhaseStatus, Plan, PlanStatus, Scope, SessionLog,
    Store,
};

/// Options every record command accepts.
#[derive(Debug, Clone, Args)]
pub struct StoreOpts {
    /// Project root directory (default: the session's project, else the
    /// enclosing git repository)
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, global = true)]
    pub format: Option<OutputFormat>,
}

impl StoreOpts {
    fn open(&self, paths: &Paths) -> anyhow::Result<Store> {
        open_store(paths, self.project_root.as_ref())
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::resolve(self.format)
    }
}

/// Read `-` as stdin, anything else literally.
fn text_arg(value: &str) -> anyhow::Result<String> {
    if value == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(value.to_string())
    }
}

// -- plans -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PlanStatusArg {
    Active,
    Frozen,
    Done,
    Cancelled,
}

impl From<PlanStatusArg> for PlanStatus {
    fn from(arg: PlanStatusArg) -> Self {
        match arg {
            PlanStatusArg::Active => Self::Active,
            PlanStatusArg::Frozen => Self::Frozen,
            PlanStatusArg::Done => Self::Done,
            PlanStatusArg::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PhaseStatusArg {
    NotStarted,
    InProgress,
    Complete,
    Blocked,
}

impl From<PhaseStatusArg> for PhaseStatus {
    fn from(arg: PhaseStatusArg) -> Self {
        match arg {
            PhaseStatusArg::NotStarted => Self::NotStarted,
            PhaseStatusArg::InProgress => Self::InProgress,
            PhaseStatusArg::Complete => Self::Complete,
            PhaseStatusArg::Blocked => Self::Blocked,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    /// Show a plan (default: the session's plan, else the active one)
    Show { id: Option<String> },
    /// List plans
    List,
    /// Create a plan; it starts active
    Create {
        title: String,
        /// Plan id (default: allocated)
        #[arg(long)]
        id: Option<String>,
        /// Description, or `-` for stdin
        #[arg(long, default_value = "")]
        description: String,
        /// Phase as `title` or `title: description`; repeat in order
        #[arg(long = "phase")]
        phases: Vec<String>,
    },
    /// Make a plan the project's active plan
    SetActive { id: String },
    /// Change a plan's status, or one phase's status with --phase
    SetStatus {
        id: String,
        /// New plan status
        #[arg(value_enum, required_unless_present = "phase")]
        status: Option<PlanStatusArg>,
        /// Phase id to update instead of the plan
        #[arg(long, requires = "phase_status")]
        phase: Option<String>,
        /// New phase status
        #[arg(long, value_enum)]
        phase_status: Option<PhaseStatusArg>,
    },
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[command(subcommand)]
    pub command: PlanCommand,
    #[command(flatten)]
    pub opts: StoreOpts,
}

impl PlanArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let store = self.opts.open(paths)?;
        let format = self.opts.format();
        match &self.command {
            PlanCommand::Show { id } => {
                let id = match id.clone().or_else(|| default_plan(paths, &store)) {
                    Some(id) => id,
                    None => {
                        return Err(OrchardError::NotFound {
                            what: "plan",
                            id: "active".to_string(),
                        }
                        .into());
                    }
                };
                show_plan(&store.get_plan(&id)?, format)
            }
            PlanCommand::List => {
                let plans = store.list_plans()?;
                if format == OutputFormat::Json {
                    return print_json(&plans);
                }
                let active = store.project()?.active_plan_id;
                for plan in &plans {
                    let marker = if active.as_deref() == Some(plan.id.as_str()) { "*" } else { " " };
                    println!("{marker} {:<10} {:<10} {}", plan.id, plan.status.as_str(), plan.title);
                }
                Ok(())
            }
            PlanCommand::Create {
                title,
                id,
                description,
                phases,
            } => {
                let phases: Vec<(String, String)> = phases.iter().map(|p| parse_phase(p)).collect();
                let plan = store.create_plan(id.as_deref(), title, &text_arg(description)?, &phases)?;
                if format == OutputFormat::Json {
                    return print_json(&plan);
                }
                println!("created plan {} ({} phases)", plan.id, plan.phases.len());
                Ok(())
            }
            PlanCommand::SetActive { id } => {
                let project = store.set_active_plan(id)?;
                println!("active plan: {}", project.active_plan_id.unwrap_or_default());
                Ok(())
            }
            PlanCommand::SetStatus {
                id,
                status,
                phase,
                phase_status,
            } => {
                let plan = match (phase, phase_status, status) {
                    (Some(phase), Some(phase_status), _) => store.set_phase_status(id, phase, (*phase_status).into())?,
                    (None, _, Some(status)) => store.set_plan_status(id, (*status).into())?,
                    _ => anyhow::bail!("give a plan status, or --phase with --phase-status"),
                };
                if format == OutputFormat::Json {
                    return print_json(&plan);
                }
                println!("plan {} is {}", plan.id, plan.status.as_str());
                Ok(())
            }
        }
    }
}

/// `title: description`, or a bare title.
fn parse_phase(raw: &str) -> (String, String) {
    match raw.split_once(':') {
        Some((title, description)) => (title.trim().to_string(), description.trim().to_string()),
        None => (raw.trim().to_string(), String::new()),
    }
}

fn show_plan(plan: &Plan, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(plan);
    }
    let style = Style::for_format(format);
    println!("{}{} {}{} [{}]", style.bold, plan.id, plan.title, style.reset, plan.status.as_str());
    if !plan.description.is_empty() {
        println!("{}", plan.description);
    }
    let current = plan.current_phase().map(|p| p.id.clone());
    for phase in &plan.phases {
        let marker = if current.as_deref() == Some(phase.id.as_str()) {
            style.tool_arrow
        } else {
            " "
        };
        println!("{marker} {:>3}. {:<12} {}", phase.id, phase.status.as_str(), phase.title);
    }
    Ok(())
}

// -- issues ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum IssueStatusArg {
    Open,
    InProgress,
    Resolved,
    Wontfix,
}

impl From<IssueStatusArg> for IssueStatus {
    fn from(arg: IssueStatusArg) -> Self {
        match arg {
            IssueStatusArg::Open => Self::Open,
            IssueStatusArg::InProgress => Self::InProgress,
            IssueStatusArg::Resolved => Self::Resolved,
            IssueStatusArg::Wontfix => Self::Wontfix,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum IssueCommand {
    /// List open issues for the current plan plus shared ones
    List {
        /// Include resolved and wontfix issues
        #[arg(long)]
        all: bool,
        /// Every issue regardless of plan
        #[arg(long)]
        any_plan: bool,
    },
    /// Create an issue
    Create {
        title: String,
        /// Description, or `-` for stdin
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 2)]
        priority: u8,
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Bind to a plan (default: the current plan)
        #[arg(long, conflicts_with = "shared")]
        plan: Option<String>,
        /// Leave unbound to any plan
        #[arg(long)]
        shared: bool,
    },
    /// Update fields of an issue
    Update {
        id: String,
        #[arg(long, value_enum)]
        status: Option<IssueStatusArg>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        /// Replace the labels
        #[arg(long = "label")]
        labels: Option<Vec<String>>,
        /// Rebind to a plan
        #[arg(long, conflicts_with = "shared")]
        plan: Option<String>,
        /// Unbind from its plan
        #[arg(long)]
        shared: bool,
    },
}

#[derive(Debug, Args)]
pub struct IssueArgs {
    #[command(subcommand)]
    pub command: IssueCommand,
    #[command(flatten)]
    pub opts: StoreOpts,
}

impl IssueArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let store = self.opts.open(paths)?;
        let format = self.opts.format();
        match &self.command {
            IssueCommand::List { all, any_plan } => {
                let scope = if *any_plan {
                    Scope::All
                } else {
                    default_plan(paths, &store).map_or(Scope::Shared, Scope::PlanAndShared)
                };
                let issues = store.list_issues(&scope, !all)?;
                if format == OutputFormat::Json {
                    return print_json(&issues);
                }
                if issues.is_empty() {
                    println!("no issues");
                }
                for issue in &issues {
                    print_issue_line(issue, format);
                }
                Ok(())
            }
            IssueCommand::Create {
                title,
                description,
                priority,
                labels,
                plan,
                shared,
            } => {
                let plan_id = if *shared {
                    None
                } else {
                    plan.clone().or_else(|| default_plan(paths, &store))
                };
                let issue = store.create_issue(&NewIssue {
                    title: title.clone(),
                    description: text_arg(description)?,
                    priority: *priority,
                    labels: labels.clone(),
                    plan_id,
                    session_id: current_session(paths).ok().map(|m| m.id),
                })?;
                if format == OutputFormat::Json {
                    return print_json(&issue);
                }
                println!("created issue {}", issue.id);
                Ok(())
            }
            IssueCommand::Update {
                id,
                status,
                title,
                description,
                priority,
                labels,
                plan,
                shared,
            } => {
                let plan_id = if *shared {
                    Some(None)
                } else {
                    plan.clone().map(Some)
                };
                let issue = store.update_issue(id, &IssueUpdate {
                    title: title.clone(),
                    description: description.as_deref().map(text_arg).transpose()?,
                    status: status.map(Into::into),
                    priority: *priority,
                    labels: labels.clone(),
                    plan_id,
                })?;
                if format == OutputFormat::Json {
                    return print_json(&issue);
                }
                print_issue_line(&issue, format);
                Ok(())
            }
        }
    }
}

fn print_issue_line(issue: &Issue, format: OutputFormat) {
    let style = Style::for_format(format);
    let plan = issue.plan_id.as_deref().map(|p| format!(" [{p}]")).unwrap_or_default();
    let labels = if issue.labels.is_empty() {
        String::new()
    } else {
        format!(" {}({}){}", style.dim, issue.labels.join(", "), style.reset)
    };
    println!(
        "{:<8} P{} {:<11} {}{plan}{labels}",
        issue.id,
        issue.priority,
        issue.status.as_str(),
        issue.title
    );
}

// -- session logs ------------------------------------------------------------

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    /// Show the most recent log for the current plan plus shared ones
    Latest,
    /// Show one log
    Show { id: String },
    /// List logs, oldest first
    List,
    /// Record what this session did
    Create {
        /// What the session set out to do
        #[arg(long)]
        objective: String,
        /// What happened, or `-` for stdin
        #[arg(long)]
        summary: String,
        /// Extra `key=value` fields
        #[arg(long = "field")]
        fields: Vec<String>,
    },
}

#[derive(Debug, Args)]
pub struct LogArgs {
    #[command(subcommand)]
    pub command: LogCommand,
    #[command(flatten)]
    pub opts: StoreOpts,
}

impl LogArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let store = self.opts.open(paths)?;
        let format = self.opts.format();
        let scope = default_plan(paths, &store).map_or(Scope::Shared, Scope::PlanAndShared);
        match &self.command {
            LogCommand::Latest => match store.latest_log(&scope)? {
                Some(log) => show_log(&log, format),
                None if format == OutputFormat::Json => print_json(&serde_json::Value::Null),
                None => {
                    println!("no session logs yet");
                    Ok(())
                }
            },
            LogCommand::Show { id } => show_log(&store.get_log(id)?, format),
            LogCommand::List => {
                let logs = store.list_logs(&scope)?;
                if format == OutputFormat::Json {
                    return print_json(&logs);
                }
                for log in &logs {
                    println!("{:<8} {} {}", log.id, log.created_at.format("%Y-%m-%d %H:%M"), log.objective);
                }
                Ok(())
            }
            LogCommand::Create {
                objective,
                summary,
                fields,
            } => {
                let mut parsed = BTreeMap::new();
                for field in fields {
                    let (k, v) = field
                        .split_once('=')
                        .ok_or_else(|| anyhow::anyhow!("field {field:?} is not key=value"))?;
                    parsed.insert(k.trim().to_string(), v.trim().to_string());
                }
                let session = current_session(paths).ok();
                let log = store.create_log(&NewLog {
                    session_id: session.as_ref().map(|m| m.id),
                    profile: session.as_ref().map(|m| m.profile.clone()),
                    plan_id: default_plan(paths, &store),
                    objective: objective.clone(),
                    summary: text_arg(summary)?,
                    fields: parsed,
                })?;
                if format == OutputFormat::Json {
                    return print_json(&log);
                }
                println!("created log {}", log.id);
                Ok(())
            }
        }
    }
}

fn show_log(log: &SessionLog, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(log);
    }
    let style = Style::for_format(format);
    println!("{}{}{} {}", style.bold, log.id, style.reset, log.created_at.to_rfc3339());
    if let Some(profile) = &log.profile {
        println!("{}profile{} {profile}", style.dim, style.reset);
    }
    println!("{}objective{} {}", style.dim, style.reset, log.objective);
    println!("\n{}", log.summary);
    for (k, v) in &log.fields {
        println!("{}{k}{} {v}", style.dim, style.reset);
    }
    Ok(())
}

// -- docs --------------------------------------------------------------------

#[derive(Debug, Subcommand)]
pub enum DocCommand {
    /// List docs for the current plan plus shared ones
    List,
    /// Show a doc, rendered as markdown on a terminal
    Show { id: String },
    /// Create a doc
    Create {
        title: String,
        /// Markdown content, or `-` for stdin
        #[arg(long)]
        content: String,
        /// Bind to the current plan
        #[arg(long)]
        plan: bool,
    },
}

#[derive(Debug, Args)]
pub struct DocArgs {
    #[command(subcommand)]
    pub command: DocCommand,
    #[command(flatten)]
    pub opts: StoreOpts,
}

impl DocArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let store = self.opts.open(paths)?;
        let format = self.opts.format();
        match &self.command {
            DocCommand::List => {
                let scope = default_plan(paths, &store).map_or(Scope::Shared, Scope::PlanAndShared);
                let docs = store.list_docs(&scope)?;
                if format == OutputFormat::Json {
                    return print_json(&docs);
                }
                for doc in &docs {
                    println!("{:<8} {}", doc.id, doc.title);
                }
                Ok(())
            }
            DocCommand::Show { id } => show_doc(&store.get_doc(id)?, format),
            DocCommand::Create { title, content, plan } => {
                let plan_id = if *plan { default_plan(paths, &store) } else { None };
                let doc = store.create_doc(title, &text_arg(content)?, plan_id.as_deref())?;
                if format == OutputFormat::Json {
                    return print_json(&doc);
                }
                println!("created doc {}", doc.id);
                Ok(())
            }
        }
    }
}

fn show_doc(doc: &Doc, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(doc),
        OutputFormat::Pretty => {
            let skin = termimad::MadSkin::default();
            skin.print_text(&format!("# {}\n\n{}", doc.title, doc.content));
            Ok(())
        }
        OutputFormat::Text => {
            println!("# {}\n\n{}", doc.title, doc.content);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_flag_splits_on_first_colon() {
        assert_eq!(
            parse_phase("Build: wire it: all of it"),
            ("Build".to_string(), "wire it: all of it".to_string())
        );
        assert_eq!(parse_phase(" Test "), ("Test".to_string(), String::new()));
    }

    #[test]
    fn status_flags_map_onto_store_statuses() {
        assert_eq!(PlanStatus::from(PlanStatusArg::Cancelled), PlanStatus::Cancelled);
        assert_eq!(PhaseStatus::from(PhaseStatusArg::InProgress).as_str(), "in_progress");
        assert_eq!(IssueStatus::from(IssueStatusArg::Wontfix).as_str(), "wontfix");
    }

    #[test]
    fn plan_and_issue_commands_share_a_project() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let paths = Paths::new(home.path());
        let opts = StoreOpts {
            project_root: Some(project.path().to_path_buf()),
            format: Some(OutputFormat::Json),
        };
        PlanArgs {
            command: PlanCommand::Create {
                title: "Ship".into(),
                id: Some("p1".into()),
                description: String::new(),
                phases: vec!["Build".into()],
            },
            opts: opts.clone(),
        }
        .execute(&paths)
        .unwrap();
        IssueArgs {
            command: IssueCommand::Create {
                title: "bug".into(),
                description: String::new(),
                priority: 1,
                labels: vec![],
                plan: Some("p1".into()),
                shared: false,
            },
            opts: opts.clone(),
        }
        .execute(&paths)
        .unwrap();

        let store = opts.open(&paths).unwrap();
        let issues = store.list_issues(&Scope::Plan("p1".into()), true).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "bug");
        assert_eq!(store.get_plan("p1").unwrap().phases.len(), 1);
    }
}
