//! Requests that reach the running loop from outside the engine thread:
//! agent-side loop controls and supervisor notes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::mailbox::{Mailbox, default_destination};
use crate::error::OrchardError;
use crate::prompt::{LoopControls, Note};

/// A push notification queued by the agent during a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotify {
    pub title: Option<String>,
    pub message: String,
}

#[derive(Debug, Default)]
struct State {
    step: usize,
    step_count: usize,
    controls: LoopControls,
    stop: Option<String>,
    notifies: Vec<PendingNotify>,
    mailbox: Mailbox,
    notes: Vec<Note>,
}

#[derive(Debug, Default)]
pub struct LoopSignals {
    state: Mutex<State>,
}

impl LoopSignals {
    pub fn new(step_count: usize) -> Self {
        Self {
            state: Mutex::new(State {
                step_count,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the engine before each turn.
    pub fn enter_step(&self, step: usize, controls: LoopControls) {
        let mut state = self.lock();
        state.step = step;
        state.controls = controls;
    }

    pub fn current_step(&self) -> usize {
        self.lock().step
    }

    pub fn request_stop(&self, reason: Option<String>) -> anyhow::Result<()> {
        let mut state = self.lock();
        if !state.controls.can_stop {
            return Err(OrchardError::PermissionDenied(format!(
                "step {} cannot stop the loop",
                state.step
            ))
            .into());
        }
        state.stop = Some(reason.unwrap_or_else(|| "requested by agent".to_string()));
        Ok(())
    }

    pub fn take_stop(&self) -> Option<String> {
        self.lock().stop.take()
    }

    /// Queue `text` for `to_step` (default: the next step). Returns the
    /// `(from, to)` step indices.
    pub fn post_message(&self, text: String, to_step: Option<usize>) -> anyhow::Result<(usize, usize)> {
        let mut state = self.lock();
        if !state.controls.can_message {
            return Err(OrchardError::PermissionDenied(format!(
                "step {} cannot message other steps",
                state.step
            ))
            .into());
        }
        let from = state.step;
        let to = to_step.unwrap_or_else(|| default_destination(from, state.step_count));
        if to >= state.step_count {
            return Err(OrchardError::NotFound {
                what: "step",
                id: to.to_string(),
            }
            .into());
        }
        state.mailbox.post(to, text);
        Ok((from, to))
    }

    pub fn take_messages(&self, step: usize) -> Vec<String> {
        self.lock().mailbox.take(step)
    }

    pub fn request_notify(&self, title: Option<String>, message: String) -> anyhow::Result<()> {
        let mut state = self.lock();
        if !state.controls.can_pushover {
            return Err(OrchardError::PermissionDenied(format!(
                "step {} cannot send notifications",
                state.step
            ))
            .into());
        }
        state.notifies.push(PendingNotify { title, message });
        Ok(())
    }

    pub fn take_notifies(&self) -> Vec<PendingNotify> {
        std::mem::take(&mut self.lock().notifies)
    }

    pub fn add_note(&self, note: Note) {
        self.lock().notes.push(note);
    }

    pub fn notes(&self) -> Vec<Note> {
        self.lock().notes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};

    fn controls(can_stop: bool, can_message: bool, can_pushover: bool) -> LoopControls {
        LoopControls {
            can_stop,
            can_message,
            can_pushover,
        }
    }

    #[test]
    fn stop_requires_permission() {
        let signals = LoopSignals::new(2);
        signals.enter_step(0, controls(false, false, false));
        let err = signals.request_stop(None).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::PermissionDenied);
        assert!(signals.take_stop().is_none());

        signals.enter_step(1, controls(true, false, false));
        signals.request_stop(Some("done".into())).unwrap();
        assert_eq!(signals.take_stop().as_deref(), Some("done"));
        assert!(signals.take_stop().is_none());
    }

    #[test]
    fn messages_default_to_next_step() {
        let signals = LoopSignals::new(3);
        signals.enter_step(2, controls(false, true, false));
        assert_eq!(signals.post_message("wrap".into(), None).unwrap(), (2, 0));
        assert_eq!(signals.take_messages(0), vec!["wrap".to_string()]);

        let err = signals.post_message("x".into(), Some(7)).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::NotFound);
    }

    #[test]
    fn notify_is_queued_until_taken() {
        let signals = LoopSignals::new(1);
        signals.enter_step(0, controls(false, false, true));
        signals.request_notify(None, "ping".into()).unwrap();
        assert_eq!(signals.take_notifies().len(), 1);
        assert!(signals.take_notifies().is_empty());
    }

    #[test]
    fn notes_accumulate() {
        let signals = LoopSignals::new(1);
        signals.add_note(Note {
            text: "focus on tests".into(),
            author: Some("lead".into()),
        });
        assert_eq!(signals.notes().len(), 1);
    }
}
