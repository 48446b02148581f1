//! The loop engine: runs `(cycle, step, turn)` in order, one agent process
//! per turn.

pub mod mailbox;
pub mod signals;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::adapter::{self, AgentExit, ExitCause, OutputSink, Wake, stream::TurnUsage};
use crate::cancel::CancelToken;
use crate::config::{Config, ResolvedLoop, ResolvedStep};
use crate::error::{ErrorKind, OrchardError};
use crate::paths::{HOME_ENV, Paths};
use crate::prompt::{self, LoopControls, PromptInput};
use crate::push::{self, Notifier};
use crate::recorder::EventKind;
use crate::session::hub::Hub;
use crate::session::protocol::MetaEvent;
use crate::session::{AGENT_ENV, READONLY_ENV, SESSION_ENV, SessionStatus, TURN_ENV};
use crate::store::{Issue, Plan, Project, RunOutcome, Scope, SessionLog, StatsKind, Store};
use crate::telemetry;

use signals::LoopSignals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `max_cycles` reached.
    Completed,
    StoppedByStep,
    Cancelled,
    FatalAgentFailures,
    /// The recording could not be written.
    RecordingFailed,
}

impl EndReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::StoppedByStep => "stopped_by_step",
            Self::Cancelled => "cancelled",
            Self::FatalAgentFailures => "fatal_agent_failures",
            Self::RecordingFailed => "recording_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub reason: EndReason,
    pub cycles: u32,
    pub turns: u32,
    pub cost: f64,
}

impl LoopOutcome {
    pub const fn session_status(&self) -> SessionStatus {
        match self.reason {
            EndReason::Completed | EndReason::StoppedByStep | EndReason::Cancelled => {
                SessionStatus::Stopped
            }
            EndReason::FatalAgentFailures | EndReason::RecordingFailed => SessionStatus::Crashed,
        }
    }

    pub const fn exit_kind(&self) -> Option<ErrorKind> {
        match self.reason {
            EndReason::Completed | EndReason::StoppedByStep => None,
            EndReason::Cancelled => Some(ErrorKind::Cancelled),
            EndReason::FatalAgentFailures => Some(ErrorKind::FatalAgentFailures),
            EndReason::RecordingFailed => Some(ErrorKind::Internal),
        }
    }
}

/// Everything a session needs to run its loop.
pub struct EngineSetup {
    pub session_id: u64,
    pub config: Arc<Config>,
    pub paths: Paths,
    pub resolved: ResolvedLoop,
    pub store: Option<Store>,
    pub workdir: PathBuf,
    pub plan_id: Option<String>,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub read_only: bool,
}

pub struct Engine {
    setup: EngineSetup,
    hub: Arc<Hub>,
    signals: Arc<LoopSignals>,
    cancel: CancelToken,
    notifier: Option<Box<dyn Notifier>>,
}

/// Forwards agent output to the hub while collecting usage for the turn.
struct TurnSink {
    hub: Arc<Hub>,
    usage: Mutex<TurnUsage>,
}

impl OutputSink for TurnSink {
    fn line(&self, kind: EventKind, line: &[u8]) {
        {
            let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
            match kind {
                EventKind::Stdout => usage.observe_stdout(line),
                EventKind::Stderr => usage.observe_stderr(line),
                EventKind::Stdin | EventKind::Meta => {}
            }
        }
        self.hub.line(kind, line);
    }
}

struct TurnResult {
    ok: bool,
    exit: Option<i32>,
    cause: String,
    usage: TurnUsage,
}

/// Store-derived prompt context, read fresh for every turn.
#[derive(Default)]
struct StoreView {
    project: Option<Project>,
    plan: Option<Plan>,
    last_log: Option<SessionLog>,
    issues: Vec<Issue>,
}

fn exit_cause_name(cause: &ExitCause) -> String {
    match cause {
        ExitCause::Exited => "exited".to_string(),
        ExitCause::Signaled(sig) => format!("signaled:{sig}"),
        ExitCause::Timeout => "timeout".to_string(),
        ExitCause::Cancelled => "cancelled".to_string(),
        ExitCause::WaitFailed(_) => "wait_failed".to_string(),
    }
}

fn turn_nonce() -> String {
    format!("{:016x}", rand::random::<u64>())
}

impl Engine {
    pub fn new(
        setup: EngineSetup,
        hub: Arc<Hub>,
        signals: Arc<LoopSignals>,
        cancel: CancelToken,
        notifier: Option<Box<dyn Notifier>>,
    ) -> Self {
        Self {
            setup,
            hub,
            signals,
            cancel,
            notifier,
        }
    }

    fn emit(&self, meta: &MetaEvent) -> bool {
        self.hub.publish_meta(meta).is_ok()
    }

    fn store_view(&self) -> StoreView {
        let Some(store) = &self.setup.store else {
            return StoreView::default();
        };
        let project = store.project().ok();
        let plan = match &self.setup.plan_id {
            Some(id) => store.get_plan(id).ok(),
            None => store.active_plan().unwrap_or_else(|e| {
                warn!(error = %e, "cannot read active plan");
                None
            }),
        };
        let scope = plan
            .as_ref()
            .map_or(Scope::Shared, |p| Scope::PlanAndShared(p.id.clone()));
        StoreView {
            project,
            last_log: store.latest_log(&scope).ok().flatten(),
            issues: store.list_issues(&scope, true).unwrap_or_default(),
            plan,
        }
    }

    fn compose(&self, step: &ResolvedStep, messages: &[String]) -> String {
        let view = self.store_view();
        let notes = self.signals.notes();
        prompt::compose(&PromptInput {
            role: &step.role,
            rules: &step.rules,
            project: view.project.as_ref(),
            plan: view.plan.as_ref(),
            last_log: view.last_log.as_ref(),
            open_issues: &view.issues,
            workdir: &self.setup.workdir,
            data_root: self.setup.paths.root(),
            instructions: step.step.instructions.as_deref(),
            messages,
            notes: &notes,
            delegation: step.step.delegation.as_ref().filter(|d| !d.is_empty()),
            profiles: &self.setup.config.profiles,
            controls: controls_for(step),
            read_only: self.setup.read_only,
        })
    }

    fn turn_deadline(&self, step: &ResolvedStep) -> Option<Duration> {
        let secs = step
            .step
            .timeout_secs
            .filter(|s| *s > 0)
            .unwrap_or(self.setup.config.runtime.turn_timeout_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Launch one agent and wait for it. Never returns an error: failures are
    /// folded into the result and reported as events.
    fn run_turn(&self, step: &ResolvedStep, prompt: &str, turn_id: &str) -> TurnResult {
        let runtime = &self.setup.config.runtime;
        let launch = adapter::prepare(
            &self.setup.config,
            &step.profile,
            self.setup.model.as_deref(),
            self.setup.reasoning.as_deref(),
            &self.setup.workdir,
        );
        let launch = launch.map(|l| {
            let l = l
                .with_env(SESSION_ENV, self.setup.session_id.to_string())
                .with_env(AGENT_ENV, step.profile.agent.clone())
                .with_env(TURN_ENV, turn_id)
                .with_env(HOME_ENV, self.setup.paths.root().display().to_string());
            if self.setup.read_only || !step.role.can_write_code {
                l.with_env(READONLY_ENV, "1")
            } else {
                l
            }
        });

        let sink = Arc::new(TurnSink {
            hub: Arc::clone(&self.hub),
            usage: Mutex::new(TurnUsage::default()),
        });
        let process = launch.and_then(|l| l.start(prompt, Arc::clone(&sink) as Arc<dyn OutputSink>));
        let process = match process {
            Ok(p) => p,
            Err(e) => {
                warn!(profile = %step.profile.name, error = format!("{e:#}"), "agent launch failed");
                self.emit(&MetaEvent::Error {
                    kind: ErrorKind::AgentLaunchFailed,
                    message: format!("{e:#}"),
                });
                return TurnResult {
                    ok: false,
                    exit: None,
                    cause: "launch_failed".to_string(),
                    usage: TurnUsage::default(),
                };
            }
        };

        let waker = process.waker();
        let _cancel_hook = self.cancel.on_cancel(move || {
            let _ = waker.send(Wake::Cancel);
        });
        let timeout = self.turn_deadline(step);
        let exit: AgentExit = process.wait(
            timeout.map(|t| Instant::now() + t),
            Duration::from_secs(runtime.grace_period_secs),
        );

        if exit.cause == ExitCause::Timeout {
            let secs = timeout.map_or(0, |t| t.as_secs());
            self.emit(&MetaEvent::Error {
                kind: ErrorKind::TurnTimeout,
                message: OrchardError::TurnTimeout(secs).to_string(),
            });
        }

        let usage = sink.usage.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(api_error) = &usage.api_error {
            warn!(profile = %step.profile.name, error = %api_error, "agent reported an API error");
        }
        TurnResult {
            ok: exit.success(),
            exit: exit.code,
            cause: exit_cause_name(&exit.cause),
            usage,
        }
    }

    fn record_profile_stats(&self, profile: &str, result: &TurnResult) {
        telemetry::record_turn(profile, result.ok);
        let Some(store) = &self.setup.store else {
            return;
        };
        let outcome = RunOutcome {
            success: result.ok,
            cycles: 0,
            cost: result.usage.cost,
            tool_calls: result.usage.tool_calls.clone(),
        };
        if let Err(e) = store.record_run(StatsKind::Profile, profile, &outcome) {
            warn!(profile, error = format!("{e:#}"), "cannot record profile stats");
        }
    }

    fn push(&self, step: &ResolvedStep, title: Option<&str>, message: &str) {
        if !step.step.can_pushover {
            return;
        }
        let Some(notifier) = &self.notifier else {
            return;
        };
        let default_title = push::title_for(self.setup.session_id, &self.setup.resolved.name);
        if let Err(e) = notifier.send(title.unwrap_or(&default_title), message) {
            warn!(error = format!("{e:#}"), "push delivery failed");
            self.emit(&MetaEvent::PushFailed {
                error: format!("{e:#}"),
            });
        }
    }

    /// Run the loop to completion, cancellation, or failure.
    pub fn run(&self) -> LoopOutcome {
        let resolved = &self.setup.resolved;
        let max_failures = self.setup.config.runtime.max_consecutive_failures;
        let mut consecutive_failures = 0u32;
        let mut cycle = 0u32;
        let mut turns = 0u32;
        let mut cost = 0.0;
        let mut tool_calls: BTreeMap<String, u64> = BTreeMap::new();

        let reason = 'cycles: loop {
            if resolved.max_cycles > 0 && cycle >= resolved.max_cycles {
                break EndReason::Completed;
            }
            if !self.emit(&MetaEvent::Heartbeat { cycle }) {
                break EndReason::RecordingFailed;
            }

            for (step_idx, step) in resolved.steps.iter().enumerate() {
                let controls = controls_for(step);
                for turn in 0..step.step.effective_turns() {
                    if self.cancel.is_cancelled() {
                        break 'cycles self.cancel_reason();
                    }
                    self.signals.enter_step(step_idx, controls);

                    let messages = self.signals.take_messages(step_idx);
                    let prompt = self.compose(step, &messages);
                    let turn_id = turn_nonce();
                    let started = Instant::now();

                    info!(cycle, step = step_idx, turn, profile = %step.profile.name, "turn start");
                    let opened = self.emit(&MetaEvent::TurnStart {
                        cycle,
                        step: step_idx,
                        turn,
                        profile: step.profile.name.clone(),
                        role: step.role.name.clone(),
                        turn_id: turn_id.clone(),
                    }) && self.hub.publish(EventKind::Stdin, prompt.as_bytes()).is_ok();
                    if !opened {
                        break 'cycles EndReason::RecordingFailed;
                    }

                    let result = self.run_turn(step, &prompt, &turn_id);
                    turns += 1;
                    cost += result.usage.cost;
                    for (tool, n) in &result.usage.tool_calls {
                        *tool_calls.entry(tool.clone()).or_default() += n;
                    }

                    let closed = self.emit(&MetaEvent::TurnEnd {
                        cycle,
                        step: step_idx,
                        turn,
                        ok: result.ok,
                        exit: result.exit,
                        cause: result.cause.clone(),
                        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        cost: result.usage.cost,
                        tools: result.usage.tool_calls.values().sum(),
                    });
                    if !closed || self.hub.fatal_error().is_some() {
                        break 'cycles EndReason::RecordingFailed;
                    }
                    info!(cycle, step = step_idx, turn, ok = result.ok, cause = %result.cause, "turn end");
                    self.record_profile_stats(&step.profile.name, &result);

                    if self.cancel.is_cancelled() {
                        break 'cycles self.cancel_reason();
                    }

                    if result.ok {
                        consecutive_failures = 0;
                    } else {
                        consecutive_failures += 1;
                        if consecutive_failures > max_failures {
                            self.emit(&MetaEvent::Error {
                                kind: ErrorKind::FatalAgentFailures,
                                message: OrchardError::FatalAgentFailures(consecutive_failures).to_string(),
                            });
                            break 'cycles EndReason::FatalAgentFailures;
                        }
                    }

                    for notify in self.signals.take_notifies() {
                        self.push(step, notify.title.as_deref(), &notify.message);
                    }

                    if let Some(reason) = self.signals.take_stop() {
                        info!(step = step_idx, %reason, "loop stopped by step");
                        self.push(step, None, &format!("Loop stopped: {reason}"));
                        break 'cycles EndReason::StoppedByStep;
                    }
                }
            }
            cycle += 1;
        };

        // Cycles counts the ones entered, including a partial last cycle.
        let cycles = if reason == EndReason::Completed { cycle } else { cycle + 1 };
        self.emit(&MetaEvent::LoopEnd {
            reason: reason.as_str().to_string(),
            cycles,
        });

        if let Some(store) = &self.setup.store {
            let outcome = RunOutcome {
                success: matches!(reason, EndReason::Completed | EndReason::StoppedByStep),
                cycles: u64::from(cycles),
                cost,
                tool_calls,
            };
            if let Err(e) = store.record_run(StatsKind::Loop, &resolved.name, &outcome) {
                warn!(error = format!("{e:#}"), "cannot record loop stats");
            }
        }

        LoopOutcome {
            reason,
            cycles,
            turns,
            cost,
        }
    }

    fn cancel_reason(&self) -> EndReason {
        if self.hub.fatal_error().is_some() {
            EndReason::RecordingFailed
        } else {
            EndReason::Cancelled
        }
    }
}

pub const fn controls_for(step: &ResolvedStep) -> LoopControls {
    LoopControls {
        can_stop: step.step.can_stop,
        can_message: step.step.can_message,
        can_pushover: step.step.can_pushover,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FamilyConfig, LoopDef, LoopStep, Profile, PromptDelivery, ReasoningStyle};
    use crate::recorder::{self, Recorder};

    /// A family whose "agent" is a shell snippet; the prompt arrives on stdin.
    fn shell_family(script: &str) -> FamilyConfig {
        FamilyConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            model_flag: None,
            reasoning_flag: None,
            reasoning_style: ReasoningStyle::None,
            prompt: PromptDelivery::Stdin,
            prompt_flag: None,
            env: BTreeMap::new(),
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        hub: Arc<Hub>,
        signals: Arc<LoopSignals>,
        cancel: CancelToken,
        engine: Engine,
    }

    fn harness(scripts: &[(&str, &str)], steps: Vec<LoopStep>, max_cycles: u32) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("data"));
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let mut config = Config::default();
        for (name, script) in scripts {
            config.families.insert(format!("fam-{name}"), shell_family(script));
            config.profiles.push(Profile::new(name, &format!("fam-{name}")));
        }
        config.runtime.grace_period_secs = 1;
        config.normalize();
        let def = LoopDef {
            name: "test-loop".into(),
            max_cycles,
            steps,
        };
        let resolved = config.resolve_loop(&def).unwrap();
        let store = Store::open(&paths, &repo).unwrap();

        let recorder = Recorder::open(&paths.recording_file(1)).unwrap();
        let cancel = CancelToken::new();
        let hub = Hub::new(recorder, 64, cancel.clone());
        let signals = Arc::new(LoopSignals::new(resolved.steps.len()));
        let engine = Engine::new(
            EngineSetup {
                session_id: 1,
                config: Arc::new(config),
                paths,
                resolved,
                store: Some(store),
                workdir: repo,
                plan_id: None,
                model: None,
                reasoning: None,
                read_only: false,
            },
            Arc::clone(&hub),
            Arc::clone(&signals),
            cancel.clone(),
            None,
        );
        Harness {
            dir,
            hub,
            signals,
            cancel,
            engine,
        }
    }

    fn metas(h: &Harness) -> Vec<MetaEvent> {
        recorder::replay(&h.engine.setup.paths.recording_file(1))
            .unwrap()
            .map(Result::unwrap)
            .filter(|e| e.kind == EventKind::Meta)
            .filter_map(|e| MetaEvent::from_payload(&e.payload))
            .collect()
    }

    #[test]
    fn single_turn_records_start_output_and_end() {
        let h = harness(&[("p", "cat >/dev/null; echo hello")], vec![LoopStep::new("p")], 1);
        let outcome = h.engine.run();
        assert_eq!(outcome.reason, EndReason::Completed);
        assert_eq!(outcome.session_status(), SessionStatus::Stopped);

        let events: Vec<_> = recorder::replay(&h.engine.setup.paths.recording_file(1))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert!(events.iter().any(|e| e.kind == EventKind::Stdout && e.payload == b"hello"));

        let metas = metas(&h);
        let starts = metas.iter().filter(|m| matches!(m, MetaEvent::TurnStart { .. })).count();
        let ends: Vec<_> = metas
            .iter()
            .filter_map(|m| match m {
                MetaEvent::TurnEnd { exit, ok, .. } => Some((*exit, *ok)),
                _ => None,
            })
            .collect();
        assert_eq!(starts, 1);
        assert_eq!(ends, vec![(Some(0), true)]);

        let stats = h.engine.setup.store.as_ref().unwrap().stats(StatsKind::Profile).unwrap();
        assert_eq!(stats["p"].success_count, 1);
        drop(h.dir);
    }

    #[test]
    fn zero_turns_run_once() {
        let mut step = LoopStep::new("p");
        step.turns = 0;
        let h = harness(&[("p", "cat >/dev/null")], vec![step], 1);
        assert_eq!(h.engine.run().turns, 1);
    }

    #[test]
    fn turn_pairs_match_turn_counts() {
        let mut first = LoopStep::new("a");
        first.turns = 2;
        let second = LoopStep::new("b");
        let h = harness(
            &[("a", "cat >/dev/null"), ("b", "cat >/dev/null")],
            vec![first, second],
            2,
        );
        let outcome = h.engine.run();
        assert_eq!(outcome.turns, 6);
        assert_eq!(outcome.cycles, 2);

        let mut open = None;
        for meta in metas(&h) {
            match meta {
                MetaEvent::TurnStart { cycle, step, turn, .. } => {
                    assert!(open.is_none());
                    open = Some((cycle, step, turn));
                }
                MetaEvent::TurnEnd { cycle, step, turn, .. } => {
                    assert_eq!(open.take(), Some((cycle, step, turn)));
                }
                _ => {}
            }
        }
        assert!(open.is_none());
    }

    #[test]
    fn repeated_failures_end_the_loop() {
        let h = harness(&[("p", "cat >/dev/null; exit 3")], vec![LoopStep::new("p")], 0);
        let outcome = h.engine.run();
        assert_eq!(outcome.reason, EndReason::FatalAgentFailures);
        // Three retries are allowed; the fourth failure in a row ends it.
        assert_eq!(outcome.turns, 4);
        assert_eq!(outcome.session_status(), SessionStatus::Crashed);
        assert_eq!(outcome.exit_kind(), Some(ErrorKind::FatalAgentFailures));
    }

    #[test]
    fn launch_failure_counts_against_budget() {
        let h = harness(&[("p", "true")], vec![LoopStep::new("p")], 0);
        let mut config = (*h.engine.setup.config).clone();
        config
            .families
            .get_mut("fam-p")
            .unwrap()
            .command = "/nonexistent/agent-binary".into();
        let mut engine = h.engine;
        engine.setup.config = Arc::new(config);
        let outcome = engine.run();
        assert_eq!(outcome.reason, EndReason::FatalAgentFailures);
    }

    #[test]
    fn message_reaches_next_step_prompt_head() {
        let mut sender = LoopStep::new("p1");
        sender.can_message = true;
        let receiver = LoopStep::new("p2");
        let h = harness(
            &[("p1", "cat >/dev/null"), ("p2", "cat >/dev/null")],
            vec![sender, receiver],
            1,
        );
        // Queue the message as the agent in step 0 would via `loop message`.
        h.signals.enter_step(0, LoopControls { can_message: true, ..LoopControls::default() });
        h.signals.post_message("M".into(), Some(1)).unwrap();

        h.engine.run();
        let prompts: Vec<_> = recorder::replay(&h.engine.setup.paths.recording_file(1))
            .unwrap()
            .map(Result::unwrap)
            .filter(|e| e.kind == EventKind::Stdin)
            .map(|e| e.payload_text())
            .collect();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("> M"));
        let head: String = prompts[1].lines().take(3).collect::<Vec<_>>().join("\n");
        assert!(head.contains('M'), "message not at head: {head}");
    }

    #[test]
    fn stop_request_ends_loop_after_turn() {
        let mut step = LoopStep::new("p");
        step.can_stop = true;
        let h = harness(&[("p", "cat >/dev/null")], vec![step], 0);
        h.signals.enter_step(0, LoopControls { can_stop: true, ..LoopControls::default() });
        h.signals.request_stop(Some("done".into())).unwrap();
        let outcome = h.engine.run();
        assert_eq!(outcome.reason, EndReason::StoppedByStep);
        assert_eq!(outcome.turns, 1);
        assert!(metas(&h).iter().any(|m| matches!(
            m,
            MetaEvent::LoopEnd { reason, .. } if reason == "stopped_by_step"
        )));
    }

    #[test]
    fn cancel_terminates_running_agent() {
        let h = harness(&[("p", "exec sleep 30")], vec![LoopStep::new("p")], 1);
        let cancel = h.cancel.clone();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            cancel.cancel();
        });
        let started = Instant::now();
        let outcome = h.engine.run();
        trigger.join().unwrap();
        assert_eq!(outcome.reason, EndReason::Cancelled);
        assert_eq!(outcome.exit_kind(), Some(ErrorKind::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert!(h.hub.fatal_error().is_none());
    }

    #[test]
    fn turn_deadline_fails_the_turn() {
        let mut step = LoopStep::new("p");
        step.timeout_secs = Some(1);
        let h = harness(&[("p", "exec sleep 30")], vec![step], 1);
        h.engine.run();
        assert!(metas(&h).iter().any(|m| matches!(
            m,
            MetaEvent::Error { kind: ErrorKind::TurnTimeout, .. }
        )));
        assert!(metas(&h).iter().any(|m| matches!(
            m,
            MetaEvent::TurnEnd { ok: false, cause, .. } if cause == "timeout"
        )));
    }

    #[test]
    fn agent_sees_session_environment() {
        let h = harness(
            &[("p", "cat >/dev/null; echo \"sid=$ORCHARD_SESSION_ID turn=${#ORCHARD_TURN_ID}\"")],
            vec![LoopStep::new("p")],
            1,
        );
        h.engine.run();
        let out: Vec<_> = recorder::replay(&h.engine.setup.paths.recording_file(1))
            .unwrap()
            .map(Result::unwrap)
            .filter(|e| e.kind == EventKind::Stdout)
            .map(|e| e.payload_text())
            .collect();
        assert_eq!(out, vec!["sid=1 turn=16".to_string()]);
    }
}
