//! The session daemon: owns the recording, runs the loop on its main thread,
//! and serves viewers and controls on the session socket.

use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info, info_span, warn};

use crate::cancel::CancelToken;
use crate::config::{Config, DelegationConfig};
use crate::delegation::{DaemonLauncher, DelegationManager, ParentContext};
use crate::engine::signals::LoopSignals;
use crate::engine::{Engine, EngineSetup, LoopOutcome};
use crate::error::{ErrorKind, OrchardError, kind_of};
use crate::paths::Paths;
use crate::prompt::Note;
use crate::push::{Notifier, Pushover};
use crate::recorder::Recorder;
use crate::registry::Registry;
use crate::session::SessionStatus;
use crate::session::launch::{LaunchSpec, READY_LINE};
use crate::session::protocol::{
    ChildArgs, Frame, MergeArgs, MessageArgs, MetaEvent, NoteArgs, NotifyArgs, PROTOCOL_VERSION, SpawnArgs,
    SpawnWaitArgs, StopArgs, read_frame, write_frame,
};
use crate::session::hub::Hub;
use crate::store::Store;

/// How long a finished session keeps serving viewers that are still
/// draining their backlog.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// State shared by the engine thread and every connection.
pub struct Shared {
    session_id: u64,
    registry: Registry,
    hub: Arc<Hub>,
    signals: Arc<LoopSignals>,
    cancel: CancelToken,
    delegation: Arc<DelegationManager>,
    /// Delegation tree of each step, by step index.
    trees: Vec<Option<DelegationConfig>>,
    viewers: Mutex<usize>,
    /// Set under the `viewers` lock; viewers stop moving the status once set.
    ending: AtomicBool,
    connections: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    pub const fn new(
        session_id: u64,
        registry: Registry,
        hub: Arc<Hub>,
        signals: Arc<LoopSignals>,
        cancel: CancelToken,
        delegation: Arc<DelegationManager>,
        trees: Vec<Option<DelegationConfig>>,
    ) -> Self {
        Self {
            session_id,
            registry,
            hub,
            signals,
            cancel,
            delegation,
            trees,
            viewers: Mutex::new(0),
            ending: AtomicBool::new(false),
            connections: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn set_status(&self, status: SessionStatus) {
        if let Err(e) = self.registry.set_live_status(self.session_id, status) {
            warn!(error = %e, "cannot update session status");
        }
    }

    /// Freeze the viewer-driven status ahead of the terminal one.
    fn end_viewing(&self) {
        let _viewers = self.viewers.lock().unwrap_or_else(PoisonError::into_inner);
        self.ending.store(true, Ordering::SeqCst);
    }

    /// Wait until every connection has finished, up to `timeout`. False if
    /// some are still open.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let open = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let (open, _) = self
            .idle
            .wait_timeout_while(open, timeout, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *open == 0
    }

    fn viewer_joined(&self) {
        let mut n = self.viewers.lock().unwrap_or_else(PoisonError::into_inner);
        *n += 1;
        if *n == 1 && !self.ending.load(Ordering::SeqCst) {
            self.set_status(SessionStatus::Running);
        }
    }

    fn viewer_left(&self) {
        let mut n = self.viewers.lock().unwrap_or_else(PoisonError::into_inner);
        *n = n.saturating_sub(1);
        if *n == 0 && !self.ending.load(Ordering::SeqCst) {
            self.set_status(SessionStatus::Detached);
        }
    }

    pub fn viewer_count(&self) -> usize {
        *self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream history after `since` and then the live tail until the hub
    /// closes or the viewer goes away.
    fn serve_viewer(
        self: &Arc<Self>,
        stream: &UnixStream,
        writer: &mut impl Write,
        protocol: u32,
        since: Option<u64>,
    ) -> anyhow::Result<()> {
        if protocol > PROTOCOL_VERSION {
            write_frame(
                writer,
                &Frame::ack_err(
                    "hello",
                    ErrorKind::SocketUnavailable,
                    format!("client speaks protocol {protocol}, this session speaks {PROTOCOL_VERSION}"),
                ),
            )?;
            write_frame(writer, &Frame::Bye)?;
            return Ok(());
        }

        let since = since.unwrap_or(0).min(self.hub.last_cursor());
        let subscription = self.hub.subscribe(since);
        write_frame(
            writer,
            &Frame::ack_ok(
                "hello",
                Some(json!({ "session_id": self.session_id, "last_cursor": self.hub.last_cursor() })),
            ),
        )?;

        // Viewers only ever read; EOF on their side means they left, even if
        // no event arrives to notice it by.
        self.viewer_joined();
        let watcher = {
            let shared = Arc::clone(self);
            let mut read_half = stream.try_clone()?;
            thread::spawn(move || {
                let mut sink = [0u8; 256];
                while matches!(read_half.read(&mut sink), Ok(n) if n > 0) {}
                let _ = read_half.shutdown(std::net::Shutdown::Write);
                shared.viewer_left();
            })
        };

        for event in subscription {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "viewer catch-up failed");
                    break;
                }
            };
            if write_frame(writer, &Frame::event(&event)).is_err() {
                debug!("viewer went away");
                break;
            }
        }
        let _ = write_frame(writer, &Frame::Bye);
        let _ = stream.shutdown(std::net::Shutdown::Both);
        let _ = watcher.join();
        Ok(())
    }

    /// Handle one control verb and return its ack data.
    pub fn control(&self, verb: &str, args: Value) -> anyhow::Result<Value> {
        match verb {
            "cancel" => {
                info!(session_id = self.session_id, "cancel requested");
                self.cancel.cancel();
                Ok(Value::Null)
            }
            "note" => {
                let args: NoteArgs = parse_args(verb, args)?;
                let event = self.hub.publish_meta(&MetaEvent::Note {
                    text: args.text.clone(),
                    author: args.author.clone(),
                })?;
                self.signals.add_note(Note {
                    text: args.text,
                    author: args.author,
                });
                Ok(json!({ "cursor": event.cursor }))
            }
            "notes" => Ok(serde_json::to_value(self.signals.notes())?),
            "stop-loop" => {
                let args: StopArgs = parse_args(verb, args)?;
                self.signals.request_stop(args.reason)?;
                Ok(Value::Null)
            }
            "message" => {
                let args: MessageArgs = parse_args(verb, args)?;
                let (from_step, to_step) = self.signals.post_message(args.text.clone(), args.to_step)?;
                self.hub.publish_meta(&MetaEvent::StepMessage {
                    from_step,
                    to_step,
                    text: args.text,
                })?;
                Ok(json!({ "from_step": from_step, "to_step": to_step }))
            }
            "notify" => {
                let args: NotifyArgs = parse_args(verb, args)?;
                self.signals.request_notify(args.title.clone(), args.message.clone())?;
                self.hub.publish_meta(&MetaEvent::Notify {
                    title: args.title,
                    message: args.message,
                })?;
                Ok(Value::Null)
            }
            "spawn" => {
                let args: SpawnArgs = parse_args(verb, args)?;
                let step = self.signals.current_step();
                let tree = self.trees.get(step).and_then(Option::as_ref);
                let record = self.delegation.spawn(tree, &args)?;
                Ok(serde_json::to_value(record)?)
            }
            "spawn-status" => {
                let args: ChildArgs = parse_args(verb, args)?;
                match args.child {
                    Some(id) => Ok(serde_json::to_value(self.delegation.child(id)?)?),
                    None => Ok(serde_json::to_value(self.delegation.children())?),
                }
            }
            "spawn-wait" => {
                let args: SpawnWaitArgs = parse_args(verb, args)?;
                let record = self
                    .delegation
                    .wait(args.child, args.timeout_secs.map(Duration::from_secs))?;
                Ok(serde_json::to_value(record)?)
            }
            "spawn-diff" => {
                let id = required_child(verb, args)?;
                let (diff, dirty) = self.delegation.diff(id)?;
                Ok(json!({ "diff": diff, "uncommitted": dirty }))
            }
            "spawn-merge" => {
                let args: MergeArgs = parse_args(verb, args)?;
                let head = self.delegation.merge(args.child, args.squash)?;
                Ok(json!({ "head": head }))
            }
            "spawn-reject" => {
                let id = required_child(verb, args)?;
                self.delegation.reject(id)?;
                Ok(Value::Null)
            }
            "status" => Ok(json!({
                "session": self.registry.lookup(self.session_id)?,
                "step": self.signals.current_step(),
                "last_cursor": self.hub.last_cursor(),
                "viewers": self.viewer_count(),
                "children": self.delegation.children(),
            })),
            other => Err(OrchardError::NotFound {
                what: "control verb",
                id: other.to_string(),
            }
            .into()),
        }
    }
}

fn parse_args<T: DeserializeOwned>(verb: &str, args: Value) -> anyhow::Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| OrchardError::Internal(format!("malformed {verb} arguments: {e}")).into())
}

fn required_child(verb: &str, args: Value) -> anyhow::Result<u64> {
    let args: ChildArgs = parse_args(verb, args)?;
    args.child
        .ok_or_else(|| OrchardError::Internal(format!("{verb} needs a child id")).into())
}

fn handle_connection(shared: &Arc<Shared>, stream: UnixStream) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream.try_clone()?);
    let Some(frame) = read_frame(&mut reader)? else {
        return Ok(());
    };
    match frame {
        Frame::Hello {
            protocol,
            since_cursor,
        } => shared.serve_viewer(&stream, &mut writer, protocol, since_cursor),
        Frame::Control { verb, args } => {
            let _span = info_span!("control", verb = %verb).entered();
            let reply = match shared.control(&verb, args) {
                Ok(data) => Frame::ack_ok(&verb, Some(data)),
                Err(e) => {
                    debug!(error = format!("{e:#}"), "control refused");
                    Frame::ack_err(&verb, kind_of(&e), format!("{e:#}"))
                }
            };
            write_frame(&mut writer, &reply)?;
            Ok(())
        }
        other => {
            let verb = match other {
                Frame::Ack { verb, .. } => verb,
                _ => "unknown".to_string(),
            };
            write_frame(
                &mut writer,
                &Frame::ack_err(&verb, ErrorKind::Internal, "expected hello or control"),
            )?;
            Ok(())
        }
    }
}

/// Counts a connection as open until dropped.
struct ConnectionGuard {
    shared: Arc<Shared>,
}

impl ConnectionGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        *shared.connections.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut open = self.shared.connections.lock().unwrap_or_else(PoisonError::into_inner);
        *open = open.saturating_sub(1);
        if *open == 0 {
            self.shared.idle.notify_all();
        }
    }
}

/// Listener on the session socket. Accepts on its own thread; each
/// connection gets a thread of its own.
pub struct Server {
    socket: PathBuf,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `socket` (replacing a stale file) with owner-only permissions.
    pub fn bind(shared: Arc<Shared>, socket: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = socket.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        if socket.exists() {
            fs::remove_file(socket).with_context(|| format!("removing stale {}", socket.display()))?;
        }
        let listener = UnixListener::bind(socket)
            .map_err(|e| OrchardError::SocketUnavailable(format!("binding {}: {e}", socket.display())))?;
        fs::set_permissions(socket, fs::Permissions::from_mode(0o600))?;

        let stop = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || accept_loop(&listener, &shared, &stop))
        };
        Ok(Self {
            socket: socket.to_path_buf(),
            stop,
            acceptor: Some(acceptor),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Stop accepting. Connections already queued are still served; open
    /// connections finish on their own.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.acceptor.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        // Wakes the blocking accept.
        match UnixStream::connect(&self.socket) {
            Ok(_) => {
                let _ = handle.join();
            }
            Err(e) => warn!(error = %e, "cannot wake the acceptor; leaving it behind"),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &UnixListener, shared: &Arc<Shared>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => serve(shared, stream),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(error = %e, "accept failed; no longer taking connections");
                return;
            }
        }
    }

    // Clients queued behind the wake-up still get history and BYE.
    if let Err(e) = listener.set_nonblocking(true) {
        warn!(error = %e, "cannot drain queued connections");
        return;
    }
    while let Ok((stream, _)) = listener.accept() {
        serve(shared, stream);
    }
}

fn serve(shared: &Arc<Shared>, stream: UnixStream) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(error = %e, "cannot configure connection");
        return;
    }
    let guard = ConnectionGuard::new(shared);
    thread::spawn(move || {
        if let Err(e) = handle_connection(&guard.shared, stream) {
            debug!(error = format!("{e:#}"), "connection ended with error");
        }
    });
}

/// Everything the daemon builds before it reports ready.
struct Booted {
    shared: Arc<Shared>,
    server: Server,
    engine: Engine,
    delegation: Arc<DelegationManager>,
}

fn boot(paths: &Paths, session_id: u64) -> anyhow::Result<Booted> {
    let registry = Registry::new(paths);
    let spec = LaunchSpec::load(paths, session_id)?;
    let config = Arc::new(Config::load(&paths.config_file())?);
    let resolved = config.resolve_loop(&spec.loop_def)?;

    let report = registry.sweep(config.runtime.keep_worktrees)?;
    if !report.crashed.is_empty() {
        info!(crashed = ?report.crashed, worktrees = report.worktrees_removed.len(), "boot sweep");
    }

    let cancel = CancelToken::new();
    let recorder = Recorder::open(&paths.recording_file(session_id))?;
    let hub = Hub::new(recorder, config.runtime.ring_capacity, cancel.clone());
    let signals = Arc::new(LoopSignals::new(resolved.steps.len()));
    let trees = resolved.steps.iter().map(|s| s.step.delegation.clone()).collect();

    let delegation = DelegationManager::new(
        ParentContext {
            session_id,
            paths: paths.clone(),
            config: Arc::clone(&config),
            repo_path: spec.repo_path.clone(),
            workdir: spec.workdir.clone(),
            plan_id: spec.plan_id.clone(),
            read_only: spec.read_only,
        },
        Arc::new(DaemonLauncher::new(paths.clone(), Arc::clone(&config))),
        Arc::clone(&hub),
        cancel.clone(),
    );
    let shared = Arc::new(Shared::new(
        session_id,
        registry.clone(),
        Arc::clone(&hub),
        Arc::clone(&signals),
        cancel.clone(),
        Arc::clone(&delegation),
        trees,
    ));
    let server = Server::bind(Arc::clone(&shared), &paths.session_socket(session_id))?;

    let store = match Store::open(paths, &spec.repo_path) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = format!("{e:#}"), "project store unavailable; prompts will lack store context");
            None
        }
    };
    let notifier = config
        .pushover
        .as_ref()
        .and_then(Pushover::from_config)
        .map(|p| Box::new(p) as Box<dyn Notifier>);
    let engine = Engine::new(
        EngineSetup {
            session_id,
            config: Arc::clone(&config),
            paths: paths.clone(),
            resolved,
            store,
            workdir: spec.workdir,
            plan_id: spec.plan_id,
            model: spec.model,
            reasoning: spec.reasoning,
            read_only: spec.read_only,
        },
        Arc::clone(&hub),
        signals,
        cancel.clone(),
        notifier,
    );

    let pid = std::process::id();
    fs::write(paths.session_pid(session_id), format!("{pid}\n"))
        .with_context(|| format!("writing {}", paths.session_pid(session_id).display()))?;
    let meta = registry.update(session_id, |m| {
        m.pid = Some(pid);
        m.status = SessionStatus::Running;
    })?;
    hub.publish_meta(&MetaEvent::SessionStart {
        session_id,
        loop_name: meta.loop_name,
        profile: meta.profile,
        steps: meta.step_count,
        parent_session_id: meta.parent_session_id,
    })?;

    let signal_cancel = cancel;
    if let Err(e) = ctrlc::set_handler(move || signal_cancel.cancel()) {
        warn!(error = %e, "cannot install signal handler");
    }

    Ok(Booted {
        shared,
        server,
        engine,
        delegation,
    })
}

/// Run session `session_id` to the end. Called as `orchard daemon`.
pub fn run(paths: &Paths, session_id: u64) -> anyhow::Result<LoopOutcome> {
    let registry = Registry::new(paths);
    let mut booted = match boot(paths, session_id) {
        Ok(b) => b,
        Err(e) => {
            error!(session_id, error = format!("{e:#}"), "session failed to start");
            if let Err(retire) = registry.retire(session_id, SessionStatus::Crashed, Some(kind_of(&e).as_str())) {
                warn!(error = %retire, "cannot mark session crashed");
            }
            return Err(e);
        }
    };

    {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{READY_LINE}")?;
        out.flush()?;
    }
    info!(session_id, socket = %booted.server.socket().display(), "session ready");

    let outcome = booted.engine.run();
    info!(session_id, reason = outcome.reason.as_str(), cycles = outcome.cycles, turns = outcome.turns, "loop ended");

    let shared = &booted.shared;
    shared.end_viewing();
    booted.delegation.cancel_children();

    let status = outcome.session_status();
    let exit_kind = outcome.exit_kind().map(ErrorKind::as_str);
    if let Err(e) = shared.hub.publish_meta(&MetaEvent::SessionEnd {
        status: status.as_str().to_string(),
        exit_kind: exit_kind.map(str::to_string),
    }) {
        warn!(error = %e, "cannot record session end");
    }
    // Viewers get the rest of the history and BYE, including those still
    // queued on the listener.
    shared.hub.close();
    booted.server.shutdown();
    registry.retire(session_id, status, exit_kind)?;

    if !shared.wait_idle(DRAIN_WINDOW) {
        warn!(session_id, viewers = shared.viewer_count(), "viewers still draining at exit");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::delegation::ChildLauncher;
    use crate::prompt::LoopControls;
    use crate::registry::tests::meta as fake_meta;
    use crate::session::client::AttachClient;

    struct NoLauncher;

    impl ChildLauncher for NoLauncher {
        fn launch(&self, _spec: &LaunchSpec) -> anyhow::Result<u64> {
            anyhow::bail!("launching is disabled in tests")
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: Paths,
        shared: Arc<Shared>,
        server: Server,
        client: AttachClient,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("d"));
        let registry = Registry::new(&paths);
        registry
            .publish(&fake_meta(&paths, 1, "lead", SessionStatus::Detached, Some(std::process::id())))
            .unwrap();

        let cancel = CancelToken::new();
        let hub = Hub::new(Recorder::open(&paths.recording_file(1)).unwrap(), 16, cancel.clone());
        let signals = Arc::new(LoopSignals::new(2));
        let delegation = DelegationManager::new(
            ParentContext {
                session_id: 1,
                paths: paths.clone(),
                config: Arc::new(Config::default()),
                repo_path: dir.path().to_path_buf(),
                workdir: dir.path().to_path_buf(),
                plan_id: None,
                read_only: true,
            },
            Arc::new(NoLauncher),
            Arc::clone(&hub),
            cancel.clone(),
        );
        let shared = Arc::new(Shared::new(
            1,
            registry.clone(),
            hub,
            signals,
            cancel,
            delegation,
            vec![None, None],
        ));
        let server = Server::bind(Arc::clone(&shared), &paths.session_socket(1)).unwrap();
        let client = AttachClient::connect(&registry.lookup(1).unwrap()).unwrap();
        Fixture {
            _dir: dir,
            paths,
            shared,
            server,
            client,
        }
    }

    fn wait_until(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !what() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn socket_is_owner_only() {
        let f = fixture();
        let mode = fs::metadata(f.server.socket()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn viewer_gets_history_tail_and_bye() {
        let f = fixture();
        f.shared.hub.publish(crate::recorder::EventKind::Stdout, b"one").unwrap();
        let stream = f.client.subscribe(None, None).unwrap();
        f.shared.hub.publish(crate::recorder::EventKind::Stdout, b"two").unwrap();
        wait_until(|| f.shared.viewer_count() == 1);
        f.shared.hub.close();

        let events: Vec<_> = stream.map(Result::unwrap).collect();
        let payloads: Vec<_> = events.iter().map(|e| e.text().into_owned()).collect();
        assert_eq!(payloads, ["one", "two"]);
        assert_eq!(events[0].cursor, 1);
    }

    #[test]
    fn resume_skips_seen_events() {
        let f = fixture();
        for line in [&b"a"[..], b"b", b"c"] {
            f.shared.hub.publish(crate::recorder::EventKind::Stdout, line).unwrap();
        }
        let stream = f.client.subscribe(Some(2), None).unwrap();
        f.shared.hub.close();
        let cursors: Vec<_> = stream.map(|e| e.unwrap().cursor).collect();
        assert_eq!(cursors, [3]);
    }

    #[test]
    fn viewers_drive_running_and_detached() {
        let f = fixture();
        let registry = Registry::new(&f.paths);
        let stream = f.client.subscribe(None, None).unwrap();
        wait_until(|| registry.lookup(1).unwrap().status == SessionStatus::Running);
        stream.close();
        drop(stream);
        wait_until(|| registry.lookup(1).unwrap().status == SessionStatus::Detached);
        assert_eq!(f.shared.viewer_count(), 0);
    }

    #[test]
    fn connection_queued_at_the_end_still_gets_history() {
        let mut f = fixture();
        f.shared.hub.publish(crate::recorder::EventKind::Stdout, b"quick turn").unwrap();
        let late = UnixStream::connect(f.server.socket()).unwrap();
        f.shared.end_viewing();
        f.shared.hub.close();
        f.server.shutdown();

        let mut writer = BufWriter::new(late.try_clone().unwrap());
        write_frame(&mut writer, &Frame::Hello {
            protocol: PROTOCOL_VERSION,
            since_cursor: None,
        })
        .unwrap();
        drop(writer);
        let mut reader = BufReader::new(late);
        let mut frames = Vec::new();
        while let Some(frame) = read_frame(&mut reader).unwrap() {
            frames.push(frame);
        }
        assert!(matches!(frames.first(), Some(Frame::Ack { ok: true, .. })));
        assert!(matches!(&frames[1], Frame::Event { payload, .. } if payload == "quick turn"));
        assert_eq!(frames.last(), Some(&Frame::Bye));

        assert!(UnixStream::connect(f.server.socket()).is_err(), "listener is closed");
        assert!(f.shared.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn leaving_viewer_cannot_undo_terminal_status() {
        let f = fixture();
        let registry = Registry::new(&f.paths);
        let stream = f.client.subscribe(None, None).unwrap();
        wait_until(|| f.shared.viewer_count() == 1);

        f.shared.end_viewing();
        registry.retire(1, SessionStatus::Stopped, None).unwrap();
        stream.close();
        drop(stream);
        wait_until(|| f.shared.viewer_count() == 0);
        f.shared.set_status(SessionStatus::Detached);
        assert_eq!(registry.lookup(1).unwrap().status, SessionStatus::Stopped);
    }

    #[test]
    fn note_is_recorded_and_kept() {
        let f = fixture();
        let data = f
            .client
            .control("note", NoteArgs {
                text: "check the migration".into(),
                author: Some("lead".into()),
            })
            .unwrap();
        assert_eq!(data["cursor"], 1);
        let notes = f.client.control("notes", Value::Null).unwrap();
        assert_eq!(notes[0]["text"], "check the migration");
    }

    #[test]
    fn loop_controls_need_permission() {
        let f = fixture();
        let err = f.client.control("stop-loop", StopArgs::default()).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::PermissionDenied);

        f.shared.signals.enter_step(0, LoopControls {
            can_stop: false,
            can_message: true,
            can_pushover: false,
        });
        let data = f
            .client
            .control("message", MessageArgs {
                text: "look at auth".into(),
                to_step: None,
            })
            .unwrap();
        assert_eq!(data["to_step"], 1);
        assert_eq!(f.shared.signals.take_messages(1), ["look at auth".to_string()]);
    }

    #[test]
    fn spawn_without_tree_is_denied() {
        let f = fixture();
        let err = f
            .client
            .control("spawn", SpawnArgs {
                profile: "worker".into(),
                task: "t".into(),
                ..SpawnArgs::default()
            })
            .unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::SpawnDenied);
    }

    #[test]
    fn cancel_control_cancels_session() {
        let f = fixture();
        f.client.control("cancel", Value::Null).unwrap();
        assert!(f.shared.cancel.is_cancelled());
    }

    #[test]
    fn unknown_verb_is_not_found() {
        let f = fixture();
        let err = f.client.control("teleport", Value::Null).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::NotFound);
    }

    #[test]
    fn newer_protocol_is_refused() {
        let f = fixture();
        let stream = UnixStream::connect(f.server.socket()).unwrap();
        let mut writer = BufWriter::new(stream.try_clone().unwrap());
        write_frame(&mut writer, &Frame::Hello {
            protocol: PROTOCOL_VERSION + 1,
            since_cursor: None,
        })
        .unwrap();
        let mut reader = BufReader::new(stream);
        let Some(Frame::Ack { ok, .. }) = read_frame(&mut reader).unwrap() else {
            panic!("expected an ack");
        };
        assert!(!ok);
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Frame::Bye));
    }
}
