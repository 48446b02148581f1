use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Args;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{OutputFormat, Style, truncate_safe};
use crate::cancel::CancelToken;
use crate::error::{ErrorKind, OrchardError};
use crate::paths::Paths;
use crate::recorder::{self, EventKind};
use crate::registry::Registry;
use crate::session::SessionMeta;
use crate::session::client::{AttachClient, ClientEvent};
use crate::session::protocol::{MetaEvent, NoteArgs};

#[derive(Debug, Args)]
pub struct AttachArgs {
    /// Session id
    pub id: u64,
    /// Only show events after this cursor
    #[arg(long)]
    pub since: Option<u64>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

/// How an attachment ended.
#[derive(Debug)]
pub enum AttachEnd {
    /// The viewer detached; the session keeps running.
    Detached,
    /// The session ended; its final metadata.
    Ended(SessionMeta),
}

impl AttachArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let meta = Registry::new(paths).lookup(self.id)?;
        let format = OutputFormat::resolve(self.format);
        match attach(paths, &meta, self.since, format)? {
            AttachEnd::Detached => {
                eprintln!("detached from session {}", self.id);
                Ok(())
            }
            AttachEnd::Ended(meta) => session_result(&meta),
        }
    }
}

/// Map a finished session onto the command's result, so `run` and `attach`
/// exit with the session's error kind.
pub fn session_result(meta: &SessionMeta) -> anyhow::Result<()> {
    match meta.exit_kind.as_deref() {
        None => Ok(()),
        Some(kind) => Err(OrchardError::Remote {
            kind: ErrorKind::parse(kind),
            message: format!("session {} ended {} ({kind})", meta.id, meta.status),
        }
        .into()),
    }
}

/// Follow a session until it ends or the viewer detaches. Lines typed on
/// stdin are commands: `detach`, `cancel`, `note <text>`.
///
/// Whatever the socket did not deliver (the session ended before this viewer
/// was served, or the connection dropped) is shown from the recording.
pub fn attach(paths: &Paths, meta: &SessionMeta, since: Option<u64>, format: OutputFormat) -> anyhow::Result<AttachEnd> {
    let mut view = View {
        style: Style::for_format(format),
        format,
        cursor: since.unwrap_or(0),
        end: None,
    };

    let lost = match AttachClient::connect(meta) {
        Ok(client) => {
            let detach = CancelToken::new();
            let on_interrupt = detach.clone();
            if let Err(e) = ctrlc::set_handler(move || on_interrupt.cancel()) {
                warn!(error = %e, "cannot install interrupt handler; use `detach`");
            }
            spawn_command_reader(client.clone(), detach.clone());
            let lost = follow(&client, &detach, &mut view);
            if detach.is_cancelled() {
                return Ok(AttachEnd::Detached);
            }
            lost
        }
        Err(e) => Some(e),
    };
    let lost = match lost {
        Some(e) if matches!(e.downcast_ref::<OrchardError>(), Some(OrchardError::Remote { .. })) => return Err(e),
        other => other,
    };
    if view.end.is_none() {
        view.catch_up(&paths.recording_file(meta.id));
    }

    let mut current = Registry::new(paths).lookup(meta.id)?;
    match (view.end, lost) {
        (Some((status, exit_kind)), _) => {
            // The daemon announces the end before it updates the registry.
            current.apply_end(&status, exit_kind);
            Ok(AttachEnd::Ended(current))
        }
        (None, Some(e)) if current.status.is_live() => Err(e),
        (None, _) => Ok(AttachEnd::Ended(current)),
    }
}

/// Show the live stream. Returns the error that cut it short, if any.
fn follow(client: &AttachClient, detach: &CancelToken, view: &mut View) -> Option<anyhow::Error> {
    let stream = match client.subscribe(Some(view.cursor), Some(detach)) {
        Ok(stream) => stream,
        Err(e) => return Some(e),
    };
    for event in stream {
        match event {
            Ok(event) => view.show(&event),
            Err(e) if detach.is_cancelled() => {
                debug!(error = %e, "stream closed by detach");
                break;
            }
            Err(e) => return Some(e),
        }
    }
    None
}

/// Printing state of one viewer.
struct View {
    style: &'static Style,
    format: OutputFormat,
    /// Last cursor shown.
    cursor: u64,
    /// Status and exit kind from the `session_end` event.
    end: Option<(String, Option<String>)>,
}

impl View {
    fn show(&mut self, event: &ClientEvent) {
        if event.cursor <= self.cursor {
            return;
        }
        self.cursor = event.cursor;
        if let Some(MetaEvent::SessionEnd { status, exit_kind }) = event.meta() {
            self.end = Some((status, exit_kind));
        }
        if let Some(line) = render(event, self.style, self.format) {
            println!("{line}");
        }
    }

    fn catch_up(&mut self, recording: &Path) {
        let replay = match recorder::replay_range(recording, self.cursor, None) {
            Ok(replay) => replay,
            Err(e) => {
                debug!(error = format!("{e:#}"), "no recording to catch up from");
                return;
            }
        };
        debug!(after = self.cursor, "showing the rest from the recording");
        for event in replay {
            match event {
                Ok(event) => self.show(&ClientEvent::from(event)),
                Err(e) => {
                    warn!(error = format!("{e:#}"), "recording ends early");
                    break;
                }
            }
        }
    }
}

fn spawn_command_reader(client: AttachClient, detach: CancelToken) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
            let result = match word {
                "" => continue,
                "detach" => {
                    detach.cancel();
                    return;
                }
                "cancel" => client.control("cancel", Value::Null).map(|_| ()),
                "note" if !rest.trim().is_empty() => client
                    .control("note", NoteArgs {
                        text: rest.trim().to_string(),
                        author: Some("operator".to_string()),
                    })
                    .map(|_| ()),
                _ => {
                    eprintln!("commands: detach | cancel | note <text>");
                    continue;
                }
            };
            if let Err(e) = result {
                eprintln!("error: {e:#}");
            }
        }
    });
}

/// One display line for an event, or `None` when it shows nothing.
pub fn render(event: &ClientEvent, style: &Style, format: OutputFormat) -> Option<String> {
    if format == OutputFormat::Json {
        let mut line = json!({
            "cursor": event.cursor,
            "ts": event.ts,
            "kind": event.kind.as_str(),
        });
        match std::str::from_utf8(&event.payload) {
            Ok(text) => line["payload"] = json!(text),
            Err(_) => line["payload_b64"] = json!(BASE64.encode(&event.payload)),
        }
        return Some(line.to_string());
    }
    let text = event.text();
    match event.kind {
        EventKind::Meta => match event.meta() {
            Some(MetaEvent::Unknown) | None => {
                warn!(cursor = event.cursor, "skipping unknown meta event");
                None
            }
            Some(meta) => Some(meta_line(&meta, style)),
        },
        EventKind::Stdin => {
            let lines = text.lines().count();
            Some(format!("{}{} prompt ({lines} lines){}", style.dim, style.tool_arrow, style.reset))
        }
        EventKind::Stderr => Some(format!("{}{text}{}", style.dim, style.reset)),
        EventKind::Stdout => match serde_json::from_str::<Value>(&text) {
            Ok(value) if value.is_object() => agent_event(&value, style),
            _ => Some(text.into_owned()),
        },
    }
}

fn meta_line(meta: &MetaEvent, style: &Style) -> String {
    let body = match meta {
        MetaEvent::SessionStart {
            session_id,
            loop_name,
            steps,
            parent_session_id,
            ..
        } => {
            let parent = parent_session_id.map(|p| format!(", child of {p}")).unwrap_or_default();
            format!("session {session_id} started: {loop_name} ({steps} steps{parent})")
        }
        MetaEvent::TurnStart {
            cycle,
            step,
            turn,
            profile,
            role,
            ..
        } => format!("cycle {cycle} step {step} turn {turn}: {profile} as {role}"),
        MetaEvent::TurnEnd {
            ok,
            cause,
            duration_ms,
            cost,
            tools,
            exit,
            ..
        } => {
            let mark = if *ok {
                format!("{}{}{}", style.green, style.checkmark, style.reset)
            } else {
                format!("{}x{}", style.red, style.reset)
            };
            let exit = exit.map(|c| format!(" exit {c}")).unwrap_or_default();
            format!(
                "{mark} turn ended: {cause}{exit}, {:.1}s, {tools} tool calls, ${cost:.4}",
                Duration::from_millis(*duration_ms).as_secs_f64()
            )
        }
        MetaEvent::Heartbeat { cycle } => format!("cycle {cycle}"),
        MetaEvent::StepMessage {
            from_step,
            to_step,
            text,
        } => format!("message {from_step} -> {to_step}: {}", first_line(text, 100)),
        MetaEvent::Notify { title, message } => match title {
            Some(t) => format!("notify: {t}: {}", first_line(message, 100)),
            None => format!("notify: {}", first_line(message, 100)),
        },
        MetaEvent::Note { text, author } => match author {
            Some(a) => format!("note from {a}: {}", first_line(text, 100)),
            None => format!("note: {}", first_line(text, 100)),
        },
        MetaEvent::SpawnStarted {
            child_id,
            profile,
            role,
            read_only,
            ..
        } => {
            let mode = if *read_only { " (read-only)" } else { "" };
            format!("spawned session {child_id}: {profile} as {role}{mode}")
        }
        MetaEvent::SpawnFinished {
            child_id,
            status,
            exit_kind,
        } => match exit_kind {
            Some(kind) => format!("child {child_id} {status} ({kind})"),
            None => format!("child {child_id} {status}"),
        },
        MetaEvent::SpawnFailed {
            child_id,
            profile,
            reason,
        } => match child_id {
            Some(id) => format!("{}child {id} ({profile}) failed: {reason}{}", style.red, style.reset),
            None => format!("{}spawn of {profile} failed: {reason}{}", style.red, style.reset),
        },
        MetaEvent::PushFailed { error } => format!("{}push failed: {error}{}", style.yellow, style.reset),
        MetaEvent::Error { kind, message } => {
            format!("{}error [{}]: {message}{}", style.red, kind.as_str(), style.reset)
        }
        MetaEvent::LoopEnd { reason, cycles } => format!("loop ended: {reason} after {cycles} cycles"),
        MetaEvent::SessionEnd { status, exit_kind } => match exit_kind {
            Some(kind) => format!("session {status} ({kind})"),
            None => format!("session {status}"),
        },
        MetaEvent::Unknown => String::new(),
    };
    format!("{}{} {body}{}", style.yellow, style.bullet, style.reset)
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.len() > max {
        format!("{}...", truncate_safe(line, max))
    } else {
        line.to_string()
    }
}

/// Render one stream-json line from an agent.
fn agent_event(event: &Value, style: &Style) -> Option<String> {
    match event.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = event.get("text").and_then(Value::as_str)?;
            (!text.trim().is_empty())
                .then(|| format!("{}{} {}{}", style.bright, style.bullet, first_line(text, 120), style.reset))
        }
        Some("assistant") => assistant_event(event, style),
        Some("user") => user_event(event, style),
        Some("result") => {
            let cost = event.get("total_cost_usd").and_then(Value::as_f64)?;
            Some(format!("{}cost ${cost:.4}{}", style.dim, style.reset))
        }
        _ => None,
    }
}

fn content_items(event: &Value) -> &[Value] {
    event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn assistant_event(event: &Value, style: &Style) -> Option<String> {
    let mut out = Vec::new();
    for item in content_items(event) {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    out.push(format!("\n{}{}{}", style.bright, format_markdown(text, style), style.reset));
                }
            }
            Some("tool_use") => {
                let Some(tool) = item.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let input = serde_json::to_string(item.get("input").unwrap_or(&Value::Null)).unwrap_or_default();
                let input = if input.len() > 80 {
                    format!("{}...", truncate_safe(&input, 80))
                } else {
                    input
                };
                out.push(format!(
                    "\n{} {}{tool}{} {}{input}{}",
                    style.tool_arrow, style.bold_bright, style.reset, style.dim, style.reset
                ));
            }
            _ => {}
        }
    }
    (!out.is_empty()).then(|| out.join("\n"))
}

fn user_event(event: &Value, style: &Style) -> Option<String> {
    let mut out = Vec::new();
    for item in content_items(event) {
        if item.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        let content = match item.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => serde_json::to_string(other).unwrap_or_default(),
            None => String::new(),
        };
        let flat = content.replace('\n', " ");
        let flat = if flat.len() > 100 {
            format!("{}...", truncate_safe(&flat, 100))
        } else {
            flat
        };
        out.push(format!(
            "  {}{}{} {}{flat}{}",
            style.green, style.checkmark, style.reset, style.dim, style.reset
        ));
    }
    (!out.is_empty()).then(|| out.join("\n"))
}

fn regex(cell: &'static OnceLock<regex::Regex>, pattern: &str) -> &'static regex::Regex {
    cell.get_or_init(|| regex::Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern {pattern}: {e}")))
}

fn re_code_block() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    regex(&RE, r"```(\w+)?\n([\s\S]*?)```")
}

fn re_inline_code() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    regex(&RE, r"`([^`]+)`")
}

fn re_bold() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    regex(&RE, r"\*\*([^*]+)\*\*")
}

fn re_headers() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    regex(&RE, r"(?m)^#{1,3}\s+(.+)$")
}

/// Light markdown for agent prose: ANSI in pretty mode, stripped in text
/// mode.
pub fn format_markdown(text: &str, style: &Style) -> String {
    let code = |caps: &regex::Captures| {
        let body = caps.get(2).map_or("", |m| m.as_str()).trim();
        format!("\n{}{body}\n{}", style.dim, style.reset)
    };
    let result = re_code_block().replace_all(text, code);
    if style.bold.is_empty() {
        let result = re_inline_code().replace_all(&result, "$1");
        let result = re_bold().replace_all(&result, "$1");
        re_headers().replace_all(&result, "$1").into_owned()
    } else {
        let result = re_inline_code().replace_all(&result, format!("{}$1{}", style.cyan, style.reset).as_str());
        let result = re_bold().replace_all(&result, format!("{}$1{}", style.bold, style.reset).as_str());
        re_headers()
            .replace_all(&result, format!("{}{} $1{}", style.bold, style.yellow, style.reset).as_str())
            .into_owned()
    }
}
