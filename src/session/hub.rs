//! In-daemon event hub: assigns cursors, makes events durable, fans them out.
//!
//! Every published event is appended to the recording under the hub lock, so
//! cursor order, file order and delivery order are the same. Live subscribers
//! get events through a bounded channel; a subscriber that falls behind is
//! flagged as lagged and later catches up from the ring or the recording.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, warn};

use crate::adapter::OutputSink;
use crate::cancel::CancelToken;
use crate::recorder::{self, EventKind, RecordedEvent, Recorder, Replay};
use crate::session::protocol::MetaEvent;

/// Per-subscriber channel depth before the subscriber is considered lagged.
const SUBSCRIBER_DEPTH: usize = 256;

pub struct Hub {
    state: Mutex<HubState>,
    recording: PathBuf,
    fatal: Mutex<Option<String>>,
    on_fatal: CancelToken,
}

struct HubState {
    recorder: Recorder,
    ring: VecDeque<RecordedEvent>,
    capacity: usize,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

struct Subscriber {
    tx: SyncSender<RecordedEvent>,
    lagged: Arc<AtomicBool>,
}

enum Backlog {
    Empty,
    Memory(VecDeque<RecordedEvent>),
    File(Replay),
}

/// A stream of events for one subscriber, in cursor order without gaps or
/// duplicates. Ends when the hub closes.
pub struct Subscription {
    hub: Arc<Hub>,
    backlog: Backlog,
    rx: Option<Receiver<RecordedEvent>>,
    lagged: Arc<AtomicBool>,
    last: u64,
}

impl Hub {
    /// `on_fatal` is cancelled when the recording can no longer be written.
    pub fn new(recorder: Recorder, capacity: usize, on_fatal: CancelToken) -> Arc<Self> {
        let recording = recorder.path().to_path_buf();
        Arc::new(Self {
            state: Mutex::new(HubState {
                recorder,
                ring: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
                subscribers: Vec::new(),
                closed: false,
            }),
            recording,
            fatal: Mutex::new(None),
            on_fatal,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cursor of the most recent event.
    pub fn last_cursor(&self) -> u64 {
        self.lock().recorder.len()
    }

    /// Set once a recording write fails; the session cannot continue.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn publish(&self, kind: EventKind, payload: &[u8]) -> anyhow::Result<RecordedEvent> {
        let mut state = self.lock();
        let event = match state.recorder.append(kind, payload) {
            Ok(event) => event,
            Err(e) => {
                drop(state);
                self.mark_fatal(&e);
                return Err(e);
            }
        };

        if state.ring.len() == state.capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(event.clone());

        state.subscribers.retain(|sub| {
            if sub.lagged.load(Ordering::SeqCst) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.lagged.store(true, Ordering::SeqCst);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        Ok(event)
    }

    pub fn publish_meta(&self, meta: &MetaEvent) -> anyhow::Result<RecordedEvent> {
        self.publish(EventKind::Meta, &meta.to_payload())
    }

    fn mark_fatal(&self, e: &anyhow::Error) {
        error!(error = format!("{e:#}"), "recording write failed");
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(format!("{e:#}"));
        }
        drop(fatal);
        self.on_fatal.cancel();
    }

    /// Subscribe to events with a cursor greater than `since`.
    pub fn subscribe(self: &Arc<Self>, since: u64) -> Subscription {
        let lagged = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let backlog = self.backlog(&state, since);
        let rx = if state.closed {
            None
        } else {
            let (tx, rx) = mpsc::sync_channel(SUBSCRIBER_DEPTH);
            state.subscribers.push(Subscriber {
                tx,
                lagged: Arc::clone(&lagged),
            });
            Some(rx)
        };
        drop(state);
        Subscription {
            hub: Arc::clone(self),
            backlog,
            rx,
            lagged,
            last: since,
        }
    }

    /// Events in `(since, now]`, from memory when the ring still holds them.
    fn backlog(&self, state: &HubState, since: u64) -> Backlog {
        let upto = state.recorder.len();
        if since >= upto {
            return Backlog::Empty;
        }
        if let Some(first) = state.ring.front()
            && first.cursor <= since + 1
        {
            return Backlog::Memory(
                state
                    .ring
                    .iter()
                    .filter(|e| e.cursor > since)
                    .cloned()
                    .collect(),
            );
        }
        match recorder::replay_range(&self.recording, since, Some(upto)) {
            Ok(replay) => Backlog::File(replay),
            Err(e) => {
                warn!(error = %e, "cannot open recording for catch-up");
                Backlog::Empty
            }
        }
    }

    /// Stop live delivery. Subscribers finish their backlog and then end.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl OutputSink for Hub {
    fn line(&self, kind: EventKind, line: &[u8]) {
        // Failures are recorded as fatal by `publish`; the reader keeps
        // draining so the agent never blocks on a full pipe.
        let _ = self.publish(kind, line);
    }
}

impl Subscription {
    /// Cursor of the last event handed out.
    pub const fn last_cursor(&self) -> u64 {
        self.last
    }

    fn next_backlog(&mut self) -> Option<anyhow::Result<RecordedEvent>> {
        loop {
            let item = match &mut self.backlog {
                Backlog::Empty => return None,
                Backlog::Memory(events) => events.pop_front().map(Ok),
                Backlog::File(replay) => replay.next(),
            };
            match item {
                None => {
                    self.backlog = Backlog::Empty;
                    return None;
                }
                Some(Ok(event)) if event.cursor <= self.last => {}
                Some(other) => return Some(other),
            }
        }
    }

    /// Re-read what was missed while lagged, then rejoin live delivery.
    fn resync(&mut self) {
        let hub = Arc::clone(&self.hub);
        let state = hub.lock();
        self.lagged.store(false, Ordering::SeqCst);
        self.backlog = hub.backlog(&state, self.last);
    }
}

impl Iterator for Subscription {
    type Item = anyhow::Result<RecordedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.next_backlog() {
                if let Ok(event) = &item {
                    self.last = event.cursor;
                }
                return Some(item);
            }

            let Some(rx) = &self.rx else {
                return None;
            };
            let received = match rx.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) if self.lagged.load(Ordering::SeqCst) => {
                    self.resync();
                    continue;
                }
                Err(TryRecvError::Empty) => rx.recv().ok(),
                Err(TryRecvError::Disconnected) => None,
            };

            match received {
                Some(event) if event.cursor <= self.last => {}
                Some(event) => {
                    self.last = event.cursor;
                    return Some(Ok(event));
                }
                None => {
                    // Hub closed. Pick up anything dropped while lagged.
                    self.rx = None;
                    if self.lagged.load(Ordering::SeqCst) {
                        self.resync();
                        continue;
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(capacity: usize) -> (tempfile::TempDir, Arc<Hub>) {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::open(&dir.path().join("events.log")).unwrap();
        (dir, Hub::new(recorder, capacity, CancelToken::new()))
    }

    fn cursors(sub: Subscription) -> Vec<u64> {
        sub.map(|e| e.unwrap().cursor).collect()
    }

    #[test]
    fn cursors_are_assigned_in_publication_order() {
        let (_dir, hub) = hub(8);
        let a = hub.publish(EventKind::Stdout, b"a").unwrap();
        let b = hub.publish(EventKind::Stderr, b"b").unwrap();
        assert_eq!((a.cursor, b.cursor), (1, 2));
        assert!(a.ts <= b.ts);
        assert_eq!(hub.last_cursor(), 2);
    }

    #[test]
    fn late_subscriber_gets_history_then_live_tail() {
        let (_dir, hub) = hub(8);
        for i in 0..3 {
            hub.publish(EventKind::Stdout, format!("{i}").as_bytes()).unwrap();
        }
        let sub = hub.subscribe(0);
        hub.publish(EventKind::Stdout, b"live").unwrap();
        hub.close();
        assert_eq!(cursors(sub), vec![1, 2, 3, 4]);
    }

    #[test]
    fn resume_from_cursor_skips_prefix() {
        let (_dir, hub) = hub(8);
        for _ in 0..5 {
            hub.publish(EventKind::Stdout, b"x").unwrap();
        }
        hub.close();
        assert_eq!(cursors(hub.subscribe(2)), vec![3, 4, 5]);
    }

    #[test]
    fn history_beyond_ring_comes_from_recording() {
        let (_dir, hub) = hub(2);
        for _ in 0..6 {
            hub.publish(EventKind::Stdout, b"x").unwrap();
        }
        hub.close();
        assert_eq!(cursors(hub.subscribe(0)), (1..=6).collect::<Vec<_>>());
    }

    #[test]
    fn lagged_subscriber_catches_up_without_gaps() {
        let (_dir, hub) = hub(4);
        let sub = hub.subscribe(0);
        let total = SUBSCRIBER_DEPTH as u64 * 2 + 7;
        for _ in 0..total {
            hub.publish(EventKind::Stdout, b"x").unwrap();
        }
        hub.close();
        assert_eq!(cursors(sub), (1..=total).collect::<Vec<_>>());
    }

    #[test]
    fn subscribers_see_identical_sequences() {
        let (_dir, hub) = hub(16);
        let early = hub.subscribe(0);
        for _ in 0..10 {
            hub.publish(EventKind::Stdout, b"x").unwrap();
        }
        let mid = hub.subscribe(4);
        hub.publish(EventKind::Meta, b"{}").unwrap();
        hub.close();
        let full = cursors(early);
        let tail = cursors(mid);
        assert_eq!(&full[4..], tail.as_slice());
    }

    #[test]
    fn sink_lines_are_published() {
        let (_dir, hub) = hub(8);
        hub.line(EventKind::Stdout, b"hello");
        hub.close();
        let events: Vec<_> = hub.subscribe(0).map(Result::unwrap).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, b"hello");
    }
}
