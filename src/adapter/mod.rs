//! Agent launch: family table, command preparation, and process supervision.
//!
//! A family is plain data ([`FamilyConfig`]): the executable, fixed arguments,
//! how the model and reasoning level are passed, and whether the prompt goes
//! to stdin or onto the command line. Built-in entries can be overridden and
//! new families added under `families.<id>` in the config.

pub mod stream;

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{Config, FamilyConfig, Profile, PromptDelivery, ReasoningStyle};
use crate::error::OrchardError;
use crate::recorder::EventKind;

/// Upper bound on waiting for reader threads after the agent exits.
const DRAIN_LIMIT: Duration = Duration::from_secs(5);

fn family(
    command: &str,
    args: &[&str],
    model_flag: Option<&str>,
    reasoning: Option<(&str, ReasoningStyle)>,
    prompt: PromptDelivery,
    prompt_flag: Option<&str>,
) -> FamilyConfig {
    FamilyConfig {
        command: command.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
        model_flag: model_flag.map(ToString::to_string),
        reasoning_flag: reasoning.map(|(flag, _)| flag.to_string()),
        reasoning_style: reasoning.map_or(ReasoningStyle::None, |(_, style)| style),
        prompt,
        prompt_flag: prompt_flag.map(ToString::to_string),
        env: BTreeMap::new(),
    }
}

/// Built-in agent families.
pub fn builtin_families() -> BTreeMap<String, FamilyConfig> {
    BTreeMap::from([
        (
            "claude".to_string(),
            family(
                "claude",
                &["--verbose", "--output-format", "stream-json", "--dangerously-skip-permissions"],
                Some("--model"),
                None,
                PromptDelivery::Arg,
                Some("-p"),
            ),
        ),
        (
            "codex".to_string(),
            family(
                "codex",
                &["exec", "--json", "--full-auto"],
                Some("--model"),
                Some(("-c", ReasoningStyle::Config)),
                PromptDelivery::Arg,
                None,
            ),
        ),
        (
            "gemini".to_string(),
            family("gemini", &["--yolo"], Some("--model"), None, PromptDelivery::Arg, Some("--prompt")),
        ),
        (
            "opencode".to_string(),
            family("opencode", &["run"], Some("--model"), None, PromptDelivery::Arg, None),
        ),
        (
            "generic".to_string(),
            family("agent", &[], None, None, PromptDelivery::Stdin, None),
        ),
    ])
}

/// Look up a family, preferring the config's entry over the built-in one.
pub fn resolve_family(config: &Config, id: &str) -> anyhow::Result<FamilyConfig> {
    if let Some(found) = config
        .families
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(id))
        .map(|(_, v)| v.clone())
    {
        return Ok(found);
    }
    builtin_families()
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(id))
        .map(|(_, v)| v)
        .ok_or_else(|| OrchardError::Config(format!("unknown agent family {id:?}")).into())
}

/// A fully prepared agent command, ready to start once per turn.
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    prompt: PromptDelivery,
    prompt_flag: Option<String>,
}

/// Build the launch for `profile`. Overrides win over the profile's own model
/// and reasoning level.
pub fn prepare(
    config: &Config,
    profile: &Profile,
    model_override: Option<&str>,
    reasoning_override: Option<&str>,
    cwd: &Path,
) -> anyhow::Result<Launch> {
    let fam = resolve_family(config, &profile.agent)?;
    let mut args = fam.args.clone();

    let model = model_override.or(profile.model.as_deref()).filter(|m| !m.is_empty());
    if let (Some(model), Some(flag)) = (model, fam.model_flag.as_deref()) {
        args.push(flag.to_string());
        args.push(model.to_string());
    }

    let reasoning = reasoning_override
        .or(profile.reasoning_effort.as_deref())
        .filter(|r| !r.is_empty());
    if let Some(level) = reasoning {
        match (fam.reasoning_style, fam.reasoning_flag.as_deref()) {
            (ReasoningStyle::Flag, Some(flag)) => {
                args.push(flag.to_string());
                args.push(level.to_string());
            }
            (ReasoningStyle::Config, Some(flag)) => {
                args.push(flag.to_string());
                args.push(format!("model_reasoning_effort={level}"));
            }
            _ => debug!(family = %profile.agent, level, "family ignores reasoning level"),
        }
    }

    Ok(Launch {
        program: fam.command,
        args,
        env: fam.env.into_iter().collect(),
        cwd: cwd.to_path_buf(),
        prompt: fam.prompt,
        prompt_flag: fam.prompt_flag,
    })
}

/// Receives agent output, one line per call, from reader threads.
pub trait OutputSink: Send + Sync {
    fn line(&self, kind: EventKind, line: &[u8]);
}

/// Why an agent process stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    Exited,
    Signaled(i32),
    Timeout,
    Cancelled,
    WaitFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub code: Option<i32>,
    pub cause: ExitCause,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        self.cause == ExitCause::Exited && self.code == Some(0)
    }

    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(s) => match (s.code(), s.signal()) {
                (Some(code), _) => Self { code: Some(code), cause: ExitCause::Exited },
                (None, Some(sig)) => Self { code: None, cause: ExitCause::Signaled(sig) },
                (None, None) => Self { code: None, cause: ExitCause::Exited },
            },
            Err(e) => Self { code: None, cause: ExitCause::WaitFailed(e.to_string()) },
        }
    }
}

/// Wake-ups delivered to [`AgentProcess::wait`].
#[derive(Debug)]
pub enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Cancel,
}

/// A running agent. Stdout and stderr are drained by dedicated threads into
/// the sink; a waiter thread reports the exit status.
pub struct AgentProcess {
    pid: u32,
    program: String,
    wake_tx: Sender<Wake>,
    wake_rx: Receiver<Wake>,
    drained_rx: Receiver<()>,
}

impl Launch {
    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.retain(|(k, _)| k != key);
        self.env.push((key.to_string(), value.into()));
        self
    }

    /// The argument vector as it will be executed for `prompt`.
    pub fn argv(&self, prompt: &str) -> Vec<String> {
        let mut args = self.args.clone();
        if self.prompt == PromptDelivery::Arg {
            if let Some(flag) = &self.prompt_flag {
                args.push(flag.clone());
            }
            args.push(prompt.to_string());
        }
        args
    }

    /// Start the agent in its own process group and begin draining its output.
    pub fn start(&self, prompt: &str, sink: Arc<dyn OutputSink>) -> anyhow::Result<AgentProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv(prompt))
            .current_dir(&self.cwd)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.prompt == PromptDelivery::Stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| OrchardError::AgentLaunch {
            program: self.program.clone(),
            message: e.to_string(),
        })?;
        let pid = child.id();
        debug!(pid, program = %self.program, "agent started");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            thread::spawn(move || {
                // The agent may exit without reading; a broken pipe is fine.
                let _ = stdin.write_all(prompt.as_bytes());
            });
        }

        let (drained_tx, drained_rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, EventKind::Stdout, Arc::clone(&sink), drained_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, EventKind::Stderr, Arc::clone(&sink), drained_tx.clone());
        }
        drop(drained_tx);

        let (wake_tx, wake_rx) = mpsc::channel();
        let exit_tx = wake_tx.clone();
        thread::spawn(move || {
            let status = child.wait();
            let _ = exit_tx.send(Wake::Exited(status));
        });

        Ok(AgentProcess {
            pid,
            program: self.program.clone(),
            wake_tx,
            wake_rx,
            drained_rx,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    kind: EventKind,
    sink: Arc<dyn OutputSink>,
    done: Sender<()>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    sink.line(kind, &line);
                }
                Err(e) => {
                    warn!(error = %e, stream = kind.as_str(), "agent pipe read failed");
                    break;
                }
            }
        }
        drop(done);
    });
}

impl AgentProcess {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Sender that can interrupt [`wait`](Self::wait) from another thread.
    pub fn waker(&self) -> Sender<Wake> {
        self.wake_tx.clone()
    }

    /// Wait for the agent to exit, the deadline to pass, or a cancel wake-up.
    /// On timeout or cancel the process group is terminated: SIGTERM, then
    /// SIGKILL after `grace`. Returns once the output has been drained.
    pub fn wait(self, deadline: Option<Instant>, grace: Duration) -> AgentExit {
        let outcome = loop {
            let wake = match deadline {
                Some(d) => match self.wake_rx.recv_timeout(d.saturating_duration_since(Instant::now())) {
                    Ok(w) => w,
                    Err(RecvTimeoutError::Timeout) => break self.terminate(ExitCause::Timeout, grace),
                    Err(RecvTimeoutError::Disconnected) => {
                        break AgentExit { code: None, cause: ExitCause::WaitFailed("waiter gone".into()) };
                    }
                },
                None => match self.wake_rx.recv() {
                    Ok(w) => w,
                    Err(_) => break AgentExit { code: None, cause: ExitCause::WaitFailed("waiter gone".into()) },
                },
            };
            match wake {
                Wake::Exited(status) => break AgentExit::from_status(status),
                Wake::Cancel => break self.terminate(ExitCause::Cancelled, grace),
            }
        };
        self.drain();
        outcome
    }

    fn terminate(&self, cause: ExitCause, grace: Duration) -> AgentExit {
        debug!(pid = self.pid, program = %self.program, ?cause, "terminating agent group");
        signal_group(self.pid, libc::SIGTERM);
        let give_up = Instant::now() + grace;
        loop {
            match self.wake_rx.recv_timeout(give_up.saturating_duration_since(Instant::now())) {
                Ok(Wake::Exited(status)) => {
                    // Reap stragglers left in the group.
                    signal_group(self.pid, libc::SIGKILL);
                    return AgentExit { code: AgentExit::from_status(status).code, cause };
                }
                Ok(Wake::Cancel) => {}
                Err(_) => break,
            }
        }
        warn!(pid = self.pid, "agent ignored SIGTERM; killing");
        signal_group(self.pid, libc::SIGKILL);
        loop {
            match self.wake_rx.recv() {
                Ok(Wake::Exited(_)) | Err(_) => return AgentExit { code: None, cause },
                Ok(Wake::Cancel) => {}
            }
        }
    }

    fn drain(&self) {
        let until = Instant::now() + DRAIN_LIMIT;
        loop {
            match self.drained_rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
                Ok(()) => {}
                Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(pid = self.pid, "agent output still open after exit; abandoning readers");
                    signal_group(self.pid, libc::SIGKILL);
                    return;
                }
            }
        }
    }
}

/// Signal every process in the group led by `pid`.
pub fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only sends a signal.
    unsafe {
        libc::kill(-pid, signal);
    }
}

/// Whether a process with this pid exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence check only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(EventKind, String)>>);

    impl OutputSink for Collect {
        fn line(&self, kind: EventKind, line: &[u8]) {
            self.0
                .lock()
                .unwrap()
                .push((kind, String::from_utf8_lossy(line).into_owned()));
        }
    }

    fn sh_config(script: &str) -> Config {
        let mut config = Config::default();
        config.families.insert(
            "sh".into(),
            FamilyConfig {
                command: "sh".into(),
                args: vec!["-c".into(), script.into()],
                model_flag: Some("--model".into()),
                reasoning_flag: None,
                reasoning_style: ReasoningStyle::None,
                prompt: PromptDelivery::Stdin,
                prompt_flag: None,
                env: BTreeMap::new(),
            },
        );
        config
    }

    #[test]
    fn claude_gets_model_and_prompt_flag() {
        let mut profile = Profile::new("p", "claude");
        profile.model = Some("opus".into());
        let launch = prepare(&Config::default(), &profile, None, None, Path::new(".")).unwrap();
        let argv = launch.argv("do it");
        assert_eq!(launch.program, "claude");
        assert!(argv.windows(2).any(|w| w == ["--model", "opus"]));
        assert_eq!(&argv[argv.len() - 2..], ["-p", "do it"]);
    }

    #[test]
    fn overrides_beat_profile_values() {
        let mut profile = Profile::new("p", "codex");
        profile.model = Some("base".into());
        profile.reasoning_effort = Some("low".into());
        let launch = prepare(&Config::default(), &profile, Some("big"), Some("high"), Path::new(".")).unwrap();
        let argv = launch.argv("x");
        assert!(argv.windows(2).any(|w| w == ["--model", "big"]));
        assert!(argv.windows(2).any(|w| w == ["-c", "model_reasoning_effort=high"]));
    }

    #[test]
    fn config_family_overrides_builtin() {
        let mut config = Config::default();
        let mut custom = builtin_families()["claude"].clone();
        custom.command = "/opt/claude".into();
        config.families.insert("claude".into(), custom);
        let launch = prepare(&config, &Profile::new("p", "Claude"), None, None, Path::new(".")).unwrap();
        assert_eq!(launch.program, "/opt/claude");
    }

    #[test]
    fn unknown_family_is_config_error() {
        let err = prepare(&Config::default(), &Profile::new("p", "nope"), None, None, Path::new(".")).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::ConfigInvalid);
    }

    #[test]
    fn runs_agent_and_collects_output() {
        let config = sh_config("read line; echo \"got $line\"; echo oops >&2; exit 3");
        let launch = prepare(&config, &Profile::new("p", "sh"), None, None, Path::new(".")).unwrap();
        let sink = Arc::new(Collect::default());
        let proc = launch.start("hello\n", sink.clone()).unwrap();
        let exit = proc.wait(None, Duration::from_secs(1));
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        let lines = sink.0.lock().unwrap();
        assert!(lines.contains(&(EventKind::Stdout, "got hello".into())));
        assert!(lines.contains(&(EventKind::Stderr, "oops".into())));
    }

    #[test]
    fn missing_binary_is_launch_failure() {
        let mut config = Config::default();
        config.families.insert("ghost".into(), FamilyConfig {
            command: "/nonexistent/agent-xyz".into(),
            ..builtin_families()["generic"].clone()
        });
        let launch = prepare(&config, &Profile::new("p", "ghost"), None, None, Path::new(".")).unwrap();
        let err = launch.start("", Arc::new(Collect::default())).err().unwrap();
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::AgentLaunchFailed);
    }

    #[test]
    fn deadline_terminates_agent() {
        let config = sh_config("sleep 30");
        let launch = prepare(&config, &Profile::new("p", "sh"), None, None, Path::new(".")).unwrap();
        let proc = launch.start("", Arc::new(Collect::default())).unwrap();
        let started = Instant::now();
        let exit = proc.wait(Some(Instant::now() + Duration::from_millis(200)), Duration::from_secs(2));
        assert_eq!(exit.cause, ExitCause::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancel_wake_terminates_agent() {
        let config = sh_config("sleep 30");
        let launch = prepare(&config, &Profile::new("p", "sh"), None, None, Path::new(".")).unwrap();
        let proc = launch.start("", Arc::new(Collect::default())).unwrap();
        let pid = proc.pid();
        let waker = proc.waker();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = waker.send(Wake::Cancel);
        });
        let exit = proc.wait(None, Duration::from_secs(2));
        assert_eq!(exit.cause, ExitCause::Cancelled);
        assert!(!pid_alive(pid));
    }
}
