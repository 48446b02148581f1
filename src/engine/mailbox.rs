//! Inter-step messages, queued per destination step.

use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Default)]
pub struct Mailbox {
    queues: BTreeMap<usize, VecDeque<String>>,
}

impl Mailbox {
    pub fn post(&mut self, to_step: usize, text: String) {
        self.queues.entry(to_step).or_default().push_back(text);
    }

    /// Everything waiting for `step`, oldest first.
    pub fn take(&mut self, step: usize) -> Vec<String> {
        self.queues
            .remove(&step)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending(&self, step: usize) -> usize {
        self.queues.get(&step).map_or(0, VecDeque::len)
    }
}

/// Destination for a message from `from` when none is named: the next step,
/// wrapping into the next cycle after the last one.
pub const fn default_destination(from: usize, step_count: usize) -> usize {
    if step_count == 0 { 0 } else { (from + 1) % step_count }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_keeps_submission_order() {
        let mut mb = Mailbox::default();
        mb.post(1, "first".into());
        mb.post(2, "other".into());
        mb.post(1, "second".into());
        assert_eq!(mb.pending(1), 2);
        assert_eq!(mb.take(1), vec!["first".to_string(), "second".to_string()]);
        assert!(mb.take(1).is_empty());
        assert_eq!(mb.take(2), vec!["other".to_string()]);
    }

    #[test]
    fn default_destination_wraps() {
        assert_eq!(default_destination(0, 2), 1);
        assert_eq!(default_destination(1, 2), 0);
        assert_eq!(default_destination(0, 1), 0);
    }
}
