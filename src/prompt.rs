//! Per-turn prompt assembly.
//!
//! The prompt is rendered from `templates/turn-prompt.md.jinja`. Composition
//! never fails: missing inputs fall back to an exploratory stance, and a
//! template error falls back to a plain rendering of the same sections.

use std::path::{Path, PathBuf};

use minijinja::Environment;
use serde::Serialize;
use tracing::warn;

use crate::config::{DelegationConfig, Profile, PromptRule, RoleDef, Speed};
use crate::store::{Issue, Plan, Project, SessionLog};

const TURN_TEMPLATE: &str = include_str!("templates/turn-prompt.md.jinja");

/// AGENTS.md bodies above this size are referenced by path instead.
pub const AGENTS_MD_LIMIT: usize = 16 * 1024;

pub const EXPLORE_FALLBACK: &str = "Explore the codebase and address open issues.";

/// A note left by a supervisor for the running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Note {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// Tool permissions the current step holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopControls {
    pub can_stop: bool,
    pub can_message: bool,
    pub can_pushover: bool,
}

/// Everything a turn prompt can draw on. Only `role` is required.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub role: &'a RoleDef,
    pub rules: &'a [PromptRule],
    pub project: Option<&'a Project>,
    pub plan: Option<&'a Plan>,
    pub last_log: Option<&'a SessionLog>,
    pub open_issues: &'a [Issue],
    pub workdir: &'a Path,
    pub data_root: &'a Path,
    pub instructions: Option<&'a str>,
    pub messages: &'a [String],
    pub notes: &'a [Note],
    pub delegation: Option<&'a DelegationConfig>,
    /// Profiles referenced by `delegation`, for their descriptions.
    pub profiles: &'a [Profile],
    pub controls: LoopControls,
    /// Forced read-only (read-only spawn), regardless of the role.
    pub read_only: bool,
}

#[derive(Serialize)]
struct PhaseView {
    id: String,
    title: String,
    description: String,
    status: &'static str,
}

#[derive(Serialize)]
struct PlanView {
    id: String,
    title: String,
}

#[derive(Serialize)]
struct IssueView {
    id: String,
    title: String,
    status: &'static str,
    priority: u8,
}

#[derive(Serialize)]
struct LogView {
    summary: String,
}

#[derive(Serialize)]
struct DelegationView {
    profile: String,
    roles: Vec<String>,
    speed: Option<&'static str>,
    handoff: bool,
    description: Option<String>,
}

#[derive(Serialize)]
struct RoleView {
    name: String,
    identity: String,
}

#[derive(Serialize)]
struct TurnContext {
    messages: Vec<String>,
    role: RoleView,
    rules: Vec<PromptRule>,
    read_only: bool,
    project_name: String,
    plan: Option<PlanView>,
    phase: Option<PhaseView>,
    phases: Vec<PhaseView>,
    data_root: String,
    controls: LoopControls,
    notes: Vec<Note>,
    last_log: Option<LogView>,
    issues: Vec<IssueView>,
    delegation: Vec<DelegationView>,
    agents_md: Option<String>,
    agents_md_path: Option<String>,
    instructions: Option<String>,
}

const fn speed_name(speed: Speed) -> &'static str {
    match speed {
        Speed::Fast => "fast",
        Speed::Medium => "medium",
        Speed::Slow => "slow",
    }
}

fn phase_view(phase: &crate::store::Phase) -> PhaseView {
    PhaseView {
        id: phase.id.clone(),
        title: phase.title.clone(),
        description: phase.description.clone(),
        status: phase.status.as_str(),
    }
}

/// AGENTS.md in `workdir`: the body when small enough, else its path.
fn agents_md(workdir: &Path) -> (Option<String>, Option<PathBuf>) {
    let path = workdir.join("AGENTS.md");
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => {
            if meta.len() > AGENTS_MD_LIMIT as u64 {
                return (None, Some(path));
            }
            match std::fs::read_to_string(&path) {
                Ok(body) if !body.trim().is_empty() => (Some(body.trim().to_string()), None),
                Ok(_) => (None, None),
                Err(_) => (None, Some(path)),
            }
        }
        _ => (None, None),
    }
}

fn build_context(input: &PromptInput<'_>) -> TurnContext {
    let read_only = input.read_only || !input.role.can_write_code;
    let identity = if input.role.identity.trim().is_empty() {
        format!("You are working as the {} for this repository.", input.role.name)
    } else {
        input.role.identity.trim().to_string()
    };

    let phase = input.plan.and_then(Plan::current_phase);
    let phases = input
        .plan
        .map(|plan| plan.phases.iter().map(phase_view).collect())
        .unwrap_or_default();

    let delegation = input
        .delegation
        .map(|tree| {
            tree.profiles
                .iter()
                .map(|rule| DelegationView {
                    profile: rule.profile.clone(),
                    roles: rule.roles.clone(),
                    speed: rule
                        .speed
                        .or_else(|| {
                            input
                                .profiles
                                .iter()
                                .find(|p| p.name.eq_ignore_ascii_case(&rule.profile))
                                .and_then(|p| p.speed)
                        })
                        .map(speed_name),
                    handoff: rule.handoff,
                    description: input
                        .profiles
                        .iter()
                        .find(|p| p.name.eq_ignore_ascii_case(&rule.profile))
                        .and_then(|p| p.description.clone()),
                })
                .collect()
        })
        .unwrap_or_default();

    let (agents_body, agents_path) = agents_md(input.workdir);

    TurnContext {
        messages: input
            .messages
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect(),
        role: RoleView {
            name: input.role.name.clone(),
            identity,
        },
        rules: input.rules.to_vec(),
        read_only,
        project_name: input
            .project
            .map_or_else(|| "(unregistered)".to_string(), |p| p.name.clone()),
        plan: input.plan.map(|p| PlanView {
            id: p.id.clone(),
            title: p.title.clone(),
        }),
        phase: phase.map(phase_view),
        phases,
        data_root: input.data_root.display().to_string(),
        controls: input.controls,
        notes: input.notes.to_vec(),
        last_log: input.last_log.map(|l| LogView {
            summary: l.summary.trim().to_string(),
        }),
        issues: input
            .open_issues
            .iter()
            .map(|i| IssueView {
                id: i.id.clone(),
                title: i.title.clone(),
                status: i.status.as_str(),
                priority: i.priority,
            })
            .collect(),
        delegation,
        agents_md: agents_body,
        agents_md_path: agents_path.map(|p| p.display().to_string()),
        instructions: input
            .instructions
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
    }
}

fn render(ctx: &TurnContext) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("turn-prompt.md", TURN_TEMPLATE)?;
    let template = env.get_template("turn-prompt.md")?;
    Ok(template.render(ctx)?)
}

/// Plain rendering used if the template ever fails.
fn render_plain(ctx: &TurnContext) -> String {
    let mut out = String::new();
    for message in &ctx.messages {
        out.push_str(message);
        out.push_str("\n\n");
    }
    out.push_str(&ctx.role.identity);
    out.push_str("\n\n");
    for rule in &ctx.rules {
        out.push_str(&format!("- {}\n", rule.body));
    }
    out.push_str(&format!("\nProject: {}\n\n{EXPLORE_FALLBACK}\n", ctx.project_name));
    if let Some(instructions) = &ctx.instructions {
        out.push_str(&format!("\n{instructions}\n"));
    }
    out
}

/// Compose the prompt for one turn.
pub fn compose(input: &PromptInput<'_>) -> String {
    let ctx = build_context(input);
    match render(&ctx) {
        Ok(text) => {
            let mut text = text.trim().to_string();
            text.push('\n');
            text
        }
        Err(e) => {
            warn!(error = %e, "turn prompt template failed; using plain prompt");
            render_plain(&ctx)
        }
    }
}
