use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Subcommand};
use serde_json::{Value, json};

use super::{OutputFormat, Style, load_config, print_json};
use crate::paths::Paths;
use crate::registry::Registry;
use crate::session::client::AttachClient;
use crate::session::{SessionMeta, SessionStatus};

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    /// List sessions, newest first
    List {
        /// Include ended sessions
        #[arg(long)]
        all: bool,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Show one session and its children
    Show {
        /// Session id
        id: u64,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl SessionsCommand {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let config = load_config(paths)?;
        let registry = Registry::new(paths);
        registry.sweep(config.runtime.keep_worktrees)?;
        match self {
            Self::List { all, format } => list(&registry, *all, OutputFormat::resolve(*format)),
            Self::Show { id, format } => show(&registry, *id, OutputFormat::resolve(*format)),
        }
    }
}

fn list(registry: &Registry, all: bool, format: OutputFormat) -> anyhow::Result<()> {
    let mut sessions: Vec<SessionMeta> = registry
        .list()?
        .into_iter()
        .filter(|m| all || m.status.is_live())
        .collect();
    sessions.sort_by(|a, b| b.id.cmp(&a.id));

    if format == OutputFormat::Json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("{}", if all { "no sessions" } else { "no live sessions" });
        return Ok(());
    }
    let style = Style::for_format(format);
    println!(
        "{}{:>4}  {:<9} {:<16} {:<12} PROJECT{}",
        style.bold, "ID", "STATUS", "LOOP", "PROFILE", style.reset
    );
    for meta in &sessions {
        let colour = match meta.status {
            SessionStatus::Running => style.green,
            SessionStatus::Crashed => style.red,
            SessionStatus::Starting | SessionStatus::Detached => style.yellow,
            SessionStatus::Stopped => style.dim,
        };
        println!("{colour}{}{}", meta.summary(), style.reset);
    }
    Ok(())
}

fn show(registry: &Registry, id: u64, format: OutputFormat) -> anyhow::Result<()> {
    let meta = registry.lookup(id)?;
    let children = registry.children_of(id)?;
    if format == OutputFormat::Json {
        return print_json(&json!({ "session": meta, "children": children }));
    }
    let style = Style::for_format(format);
    let row = |key: &str, value: &str| println!("{}{key:<10}{} {value}", style.dim, style.reset);

    println!("{}session {}{}", style.bold, meta.id, style.reset);
    row("status", meta.status.as_str());
    if let Some(kind) = &meta.exit_kind {
        row("exit", kind);
    }
    row("loop", &format!("{} ({} steps)", meta.loop_name, meta.step_count));
    row("profile", &format!("{} [{}]", meta.profile, meta.agent));
    row("project", &meta.project);
    row("workdir", &meta.workdir.display().to_string());
    if let Some(plan) = &meta.plan_id {
        row("plan", plan);
    }
    if let Some(parent) = meta.parent_session_id {
        let index = meta.child_index.map(|i| format!(" #{i}")).unwrap_or_default();
        row("parent", &format!("{parent}{index}"));
    }
    if let Some(branch) = &meta.branch {
        row("branch", branch);
    }
    if meta.read_only {
        row("mode", "read-only");
    }
    row("started", &meta.started_at.to_rfc3339());
    if let Some(ended) = meta.ended_at {
        row("ended", &ended.to_rfc3339());
    }
    if !children.is_empty() {
        println!("{}children{}", style.bold, style.reset);
        for child in &children {
            println!("  {}", child.summary());
        }
    }
    Ok(())
}

#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Session id
    pub id: u64,
    /// Wait for the session to end
    #[arg(long)]
    pub wait: bool,
    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,
}

impl CancelArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let registry = Registry::new(paths);
        let meta = registry.lookup(self.id)?;
        if !meta.status.is_live() {
            println!("session {} already {}", meta.id, meta.status);
            return Ok(());
        }
        AttachClient::connect(&meta)?.control("cancel", Value::Null)?;
        if !self.wait {
            println!("cancelling session {}", meta.id);
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_secs(self.timeout);
        loop {
            let meta = registry.lookup(self.id)?;
            if !meta.status.is_live() {
                println!("session {} {}", meta.id, meta.status);
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("session {} still running after {}s", meta.id, self.timeout);
            }
            thread::sleep(Duration::from_millis(200));
        }
    }
}
