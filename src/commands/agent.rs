//! Commands an agent runs from inside its session. Everything here talks to
//! the parent daemon named by `ORCHARD_SESSION_ID`.

use std::time::Duration;

use clap::{Args, Subcommand};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{OutputFormat, Style, current_session, load_config, print_json, session_client, truncate_safe};
use crate::error::{ErrorKind, kind_of};
use crate::paths::Paths;
use crate::registry::Registry;
use crate::session::SessionStatus;
use crate::session::protocol::{
    ChildArgs, MergeArgs, MessageArgs, NoteArgs, NotifyArgs, SpawnArgs, SpawnWaitArgs, StopArgs,
};
use crate::worktree;

const PATCH_PREVIEW_BYTES: usize = 16 * 1024;

/// Print a control reply: JSON as-is, otherwise through `human`.
fn emit(format: Option<OutputFormat>, value: &Value, human: impl FnOnce(&Value, &Style)) -> anyhow::Result<()> {
    let format = OutputFormat::resolve(format);
    if format == OutputFormat::Json {
        return print_json(value);
    }
    human(value, Style::for_format(format));
    Ok(())
}

fn child_line(child: &Value, style: &Style) -> String {
    let state = child["state"].as_str().unwrap_or("?");
    let colour = match state {
        "running" => style.yellow,
        "merged" => style.green,
        "rejected" => style.dim,
        _ => match child["status"].as_str() {
            Some("crashed") => style.red,
            _ => style.cyan,
        },
    };
    let mode = if child["read_only"].as_bool() == Some(true) { " ro" } else { "" };
    let exit = child["exit_kind"]
        .as_str()
        .map(|k| format!(" ({k})"))
        .unwrap_or_default();
    format!(
        "{colour}#{} {:<8}{} {} as {}{mode}{exit}",
        child["id"],
        state,
        style.reset,
        child["profile"].as_str().unwrap_or("?"),
        child["role"].as_str().unwrap_or("?"),
    )
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl StatusArgs {
    /// Ask the daemon; if its socket is gone, fall back to the registry.
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let meta = current_session(paths)?;
        let value = match session_client(paths).and_then(|c| c.control("status", Value::Null)) {
            Ok(v) => v,
            Err(e) if kind_of(&e) == ErrorKind::SocketUnavailable => {
                debug!(error = %e, "daemon unreachable; reporting registry state");
                json!({ "session": meta, "children": Registry::new(paths).children_of(meta.id)? })
            }
            Err(e) => return Err(e),
        };
        emit(self.format, &value, |v, style| {
            let s = &v["session"];
            println!(
                "{}session {}{} {} loop {} profile {}",
                style.bold,
                s["id"],
                style.reset,
                s["status"].as_str().unwrap_or("?"),
                s["loop_name"].as_str().unwrap_or("?"),
                s["profile"].as_str().unwrap_or("?"),
            );
            if let Some(step) = v["step"].as_u64() {
                println!("step {step}, cursor {}, viewers {}", v["last_cursor"], v["viewers"]);
            }
            if let Some(plan) = s["plan_id"].as_str() {
                println!("plan {plan}");
            }
            for child in v["children"].as_array().into_iter().flatten() {
                println!("  {}", child_line(child, style));
            }
        })
    }
}

#[derive(Debug, Args)]
pub struct SpawnCmd {
    /// Task for the child, used as its instructions
    pub task: String,
    /// Profile to run the child as
    #[arg(long)]
    pub profile: String,
    /// Role for the child (default: the first role the rule allows)
    #[arg(long)]
    pub role: Option<String>,
    /// Run in the parent's working directory without write access
    #[arg(long)]
    pub read_only: bool,
    /// `/`-separated profile path to a nested delegation rule
    #[arg(long, default_value = "")]
    pub parent_path: String,
    /// Block until the child ends
    #[arg(long)]
    pub wait: bool,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl SpawnCmd {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let client = session_client(paths)?;
        // Admission can queue for a while; the daemon enforces the window.
        let record = client.control_timeout(
            "spawn",
            SpawnArgs {
                profile: self.profile.clone(),
                task: self.task.clone(),
                role: self.role.clone(),
                read_only: self.read_only,
                parent_path: self.parent_path.clone(),
            },
            None,
        )?;
        let record = if self.wait {
            let id = record["id"].as_u64().unwrap_or_default();
            client.control_timeout(
                "spawn-wait",
                SpawnWaitArgs {
                    child: id,
                    timeout_secs: None,
                },
                None,
            )?
        } else {
            record
        };
        emit(self.format, &record, |v, style| {
            println!("{}", child_line(v, style));
            if let Some(path) = v["worktree"].as_str() {
                println!("  worktree {path}");
            }
        })
    }
}

#[derive(Debug, Args)]
pub struct SpawnStatusArgs {
    /// Child id (default: all children)
    pub child: Option<u64>,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl SpawnStatusArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let value = session_client(paths)?.control("spawn-status", ChildArgs { child: self.child })?;
        emit(self.format, &value, |v, style| match v.as_array() {
            Some(children) if children.is_empty() => println!("no children"),
            Some(children) => {
                for child in children {
                    println!("{}", child_line(child, style));
                }
            }
            None => println!("{}", child_line(v, style)),
        })
    }
}

#[derive(Debug, Args)]
pub struct SpawnWaitCmd {
    pub child: u64,
    /// Give up after this many seconds and report the child as it is
    #[arg(long)]
    pub timeout: Option<u64>,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl SpawnWaitCmd {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let read_timeout = self.timeout.map(|s| Duration::from_secs(s + 10));
        let value = session_client(paths)?.control_timeout(
            "spawn-wait",
            SpawnWaitArgs {
                child: self.child,
                timeout_secs: self.timeout,
            },
            read_timeout,
        )?;
        emit(self.format, &value, |v, style| println!("{}", child_line(v, style)))
    }
}

#[derive(Debug, Args)]
pub struct SpawnDiffArgs {
    pub child: u64,
    /// Only list commits and files
    #[arg(long)]
    pub stat: bool,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl SpawnDiffArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let value = session_client(paths)?.control("spawn-diff", ChildArgs { child: Some(self.child) })?;
        let stat = self.stat;
        emit(self.format, &value, |v, style| {
            let diff = &v["diff"];
            println!("{}branch {}{}", style.bold, diff["branch"].as_str().unwrap_or("?"), style.reset);
            if v["uncommitted"].as_bool() == Some(true) {
                println!("{}uncommitted changes are committed at merge{}", style.yellow, style.reset);
            }
            for commit in diff["commits"].as_array().into_iter().flatten() {
                println!("  {} {}", style.bullet, commit.as_str().unwrap_or_default());
            }
            for file in diff["files"].as_array().into_iter().flatten() {
                println!("  {}{}{}", style.dim, file.as_str().unwrap_or_default(), style.reset);
            }
            if !stat {
                let patch = diff["patch"].as_str().unwrap_or_default();
                let shown = truncate_safe(patch, PATCH_PREVIEW_BYTES);
                println!("\n{shown}");
                if shown.len() < patch.len() {
                    println!("{}... patch truncated ({} bytes){}", style.dim, patch.len(), style.reset);
                }
            }
        })
    }
}

#[derive(Debug, Args)]
pub struct SpawnMergeArgs {
    pub child: u64,
    /// Squash the child's commits into one
    #[arg(long)]
    pub squash: bool,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl SpawnMergeArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let value = session_client(paths)?.control(
            "spawn-merge",
            MergeArgs {
                child: self.child,
                squash: self.squash,
            },
        )?;
        emit(self.format, &value, |v, style| {
            println!(
                "{}{}{} merged child {} at {}",
                style.green,
                style.checkmark,
                style.reset,
                self.child,
                v["head"].as_str().unwrap_or("?")
            );
        })
    }
}

#[derive(Debug, Args)]
pub struct SpawnRejectArgs {
    pub child: u64,
}

impl SpawnRejectArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        session_client(paths)?.control("spawn-reject", ChildArgs { child: Some(self.child) })?;
        println!("rejected child {}", self.child);
        Ok(())
    }
}

#[derive(Debug, Subcommand)]
pub enum NoteCommand {
    /// Leave a note for the supervisor and later turns
    Add {
        text: String,
        /// Who wrote it (default: the calling profile)
        #[arg(long)]
        author: Option<String>,
    },
    /// List notes left in this session
    List {
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl NoteCommand {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let client = session_client(paths)?;
        match self {
            Self::Add { text, author } => {
                let author = author
                    .clone()
                    .or_else(|| current_session(paths).ok().map(|m| m.profile));
                let reply = client.control("note", NoteArgs {
                    text: text.clone(),
                    author,
                })?;
                println!("noted at cursor {}", reply["cursor"]);
                Ok(())
            }
            Self::List { format } => {
                let notes = client.control("notes", Value::Null)?;
                emit(*format, &notes, |v, style| {
                    for note in v.as_array().into_iter().flatten() {
                        let author = note["author"].as_str().unwrap_or("anonymous");
                        println!("{}{author}:{} {}", style.dim, style.reset, note["text"].as_str().unwrap_or_default());
                    }
                })
            }
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum WorktreeCommand {
    /// List worktrees of the session's repository
    List {
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Remove worktrees left by children that are no longer running
    Cleanup,
}

impl WorktreeCommand {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let meta = current_session(paths)?;
        match self {
            Self::List { format } => {
                let trees = worktree::list(&meta.repo_path)?;
                let format = OutputFormat::resolve(*format);
                if format == OutputFormat::Json {
                    return print_json(&trees);
                }
                let style = Style::for_format(format);
                for tree in &trees {
                    let branch = tree.branch.as_deref().unwrap_or("(detached)");
                    let ours = branch.starts_with("orchard/");
                    let (open, close) = if ours { (style.bold, style.reset) } else { ("", "") };
                    println!("{open}{branch:<24}{close} {}", tree.path.display());
                }
                Ok(())
            }
            Self::Cleanup => {
                let config = load_config(paths)?;
                let registry = Registry::new(paths);
                let report = registry.sweep(config.runtime.keep_worktrees)?;
                let mut removed = report.worktrees_removed;
                for child in registry.children_of(meta.id)? {
                    let Some(path) = &child.worktree else { continue };
                    // Stopped children still awaiting a merge decision keep theirs.
                    if child.status != SessionStatus::Crashed || !path.exists() {
                        continue;
                    }
                    match worktree::remove(&meta.workdir, path, child.branch.as_deref()) {
                        Ok(()) => removed.push(path.clone()),
                        Err(e) => warn!(child = child.id, error = %e, "worktree cleanup failed"),
                    }
                }
                if removed.is_empty() {
                    println!("nothing to clean up");
                }
                for path in &removed {
                    println!("removed {}", path.display());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum LoopCommand {
    /// End the loop after the current turn
    Stop {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Hand a message to another step's next turn
    Message {
        text: String,
        /// Destination step index (default: the next step)
        #[arg(long)]
        to_step: Option<usize>,
    },
    /// Send a push notification to the operator
    Notify {
        message: String,
        #[arg(long)]
        title: Option<String>,
    },
}

impl LoopCommand {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let client = session_client(paths)?;
        match self {
            Self::Stop { reason } => {
                client.control("stop-loop", StopArgs { reason: reason.clone() })?;
                println!("loop will stop after this turn");
            }
            Self::Message { text, to_step } => {
                let reply = client.control("message", MessageArgs {
                    text: text.clone(),
                    to_step: *to_step,
                })?;
                println!("message queued for step {}", reply["to_step"]);
            }
            Self::Notify { message, title } => {
                client.control("notify", NotifyArgs {
                    title: title.clone(),
                    message: message.clone(),
                })?;
                println!("notification queued");
            }
        }
        Ok(())
    }
}
