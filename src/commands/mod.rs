//! Command-line surface: front-end commands for humans and in-agent commands
//! that agents call from inside a running session.

pub mod agent;
pub mod attach;
pub mod daemon;
pub mod init;
pub mod run;
pub mod sessions;
pub mod store;

use std::io::IsTerminal;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::Config;
use crate::paths::Paths;
use crate::registry::{Registry, current_session_id};
use crate::session::SessionMeta;
use crate::session::client::AttachClient;
use crate::store::Store;
use crate::worktree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// The explicit choice, else `FORMAT`, else pretty on a terminal.
    pub fn resolve(explicit: Option<Self>) -> Self {
        if let Some(format) = explicit {
            return format;
        }
        match std::env::var("FORMAT").as_deref() {
            Ok("pretty") => return Self::Pretty,
            Ok("text") => return Self::Text,
            Ok("json") => return Self::Json,
            _ => {}
        }
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Text
        }
    }
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// ANSI codes for pretty output; empty in text mode.
pub struct Style {
    pub bold: &'static str,
    pub bright: &'static str,
    pub bold_bright: &'static str,
    pub dim: &'static str,
    pub reset: &'static str,
    pub green: &'static str,
    pub red: &'static str,
    pub cyan: &'static str,
    pub yellow: &'static str,
    pub bullet: &'static str,
    pub tool_arrow: &'static str,
    pub checkmark: &'static str,
}

pub const PRETTY_STYLE: Style = Style {
    bold: "\x1b[1m",
    bright: "\x1b[97m",
    bold_bright: "\x1b[1;97m",
    dim: "\x1b[2m",
    reset: "\x1b[0m",
    green: "\x1b[32m",
    red: "\x1b[31m",
    cyan: "\x1b[36m",
    yellow: "\x1b[33m",
    bullet: "\u{2022}",
    tool_arrow: "\u{25b6}",
    checkmark: "\u{2713}",
};

pub const TEXT_STYLE: Style = Style {
    bold: "",
    bright: "",
    bold_bright: "",
    dim: "",
    reset: "",
    green: "",
    red: "",
    cyan: "",
    yellow: "",
    bullet: "-",
    tool_arrow: ">",
    checkmark: "+",
};

impl Style {
    pub const fn for_format(format: OutputFormat) -> &'static Self {
        match format {
            OutputFormat::Pretty => &PRETTY_STYLE,
            OutputFormat::Text | OutputFormat::Json => &TEXT_STYLE,
        }
    }
}

pub fn load_config(paths: &Paths) -> anyhow::Result<Config> {
    Config::load(&paths.config_file())
}

/// The session an in-agent command runs under.
pub fn current_session(paths: &Paths) -> anyhow::Result<SessionMeta> {
    let id = current_session_id()?;
    Registry::new(paths).lookup(id)
}

pub fn session_client(paths: &Paths) -> anyhow::Result<AttachClient> {
    AttachClient::connect(&current_session(paths)?)
}

/// Project the command applies to: the calling session's project when run
/// inside a session, else the git repository around the working directory.
pub fn open_store(paths: &Paths, project_root: Option<&PathBuf>) -> anyhow::Result<Store> {
    if let Some(root) = project_root {
        return Store::open(paths, root);
    }
    if let Ok(meta) = current_session(paths) {
        return Store::open(paths, &meta.repo_path);
    }
    let cwd = std::env::current_dir()?;
    let repo = worktree::repo_root(&cwd).unwrap_or(cwd);
    Store::open(paths, &repo)
}

/// Plan a store listing defaults to: the session's plan, else the active one.
pub fn default_plan(paths: &Paths, store: &Store) -> Option<String> {
    current_session(paths)
        .ok()
        .and_then(|m| m.plan_id)
        .or_else(|| store.active_plan().ok().flatten().map(|p| p.id))
}

/// Truncate at a char boundary no later than `max_bytes`.
pub fn truncate_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_format_wins() {
        assert_eq!(OutputFormat::resolve(Some(OutputFormat::Json)), OutputFormat::Json);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_safe("héllo", 2), "h");
        assert_eq!(truncate_safe("short", 10), "short");
    }
}
