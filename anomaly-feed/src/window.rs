//! Live window
//!
//! Keeps the most recent live events for display, newest first, in the
//! order they arrived. Older events fall off the tail once the window is
//! full.

use crate::event::LiveEvent;
use std::collections::VecDeque;

/// Number of live events kept for display.
pub const LIVE_WINDOW_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct EventWindow {
    events: VecDeque<LiveEvent>,
    capacity: usize,
}

impl Default for EventWindow {
    fn default() -> Self {
        EventWindow::new()
    }
}

impl EventWindow {
    pub fn new() -> EventWindow {
        EventWindow::with_capacity(LIVE_WINDOW_CAPACITY)
    }

    /// A window holding at most `capacity` events. A zero capacity is
    /// bumped to one.
    pub fn with_capacity(capacity: usize) -> EventWindow {
        let capacity = capacity.max(1);
        EventWindow {
            events: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Prepend `event`, evicting the oldest entries past capacity.
    pub fn push(&mut self, event: LiveEvent) {
        self.events.push_front(event);
        self.events.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &LiveEvent> {
        self.events.iter()
    }

    /// Owned copy of the current contents, newest first.
    pub fn snapshot(&self) -> Vec<LiveEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn newest(&self) -> Option<&LiveEvent> {
        self.events.front()
    }

    pub fn anomaly_count(&self) -> usize {
        self.events.iter().filter(|ev| ev.is_anomaly()).count()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(seq: usize) -> LiveEvent {
        match json!({ "seq": seq, "anomaly": ((seq % 10 == 0) as u8) }) {
            serde_json::Value::Object(map) => LiveEvent::new(map),
            _ => unreachable!(),
        }
    }

    fn seqs(window: &EventWindow) -> Vec<u64> {
        window
            .iter()
            .map(|e| e.get("seq").and_then(|v| v.as_u64()).unwrap())
            .collect()
    }

    #[test]
    fn holds_last_hundred_newest_first() {
        let mut window = EventWindow::new();
        for i in 1..=100 {
            window.push(ev(i));
        }
        assert_eq!(window.len(), 100);
        assert_eq!(seqs(&window), (1..=100).rev().collect::<Vec<u64>>());

        window.push(ev(101));
        assert_eq!(window.len(), 100);
        let s = seqs(&window);
        assert_eq!(s.first(), Some(&101));
        assert_eq!(s.last(), Some(&2));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut window = EventWindow::with_capacity(7);
        for i in 0..50 {
            window.push(ev(i));
            assert!(window.len() <= 7);
            let newest = window.newest().and_then(|e| e.get("seq")).and_then(|v| v.as_u64());
            assert_eq!(newest, Some(i as u64));
        }
        assert_eq!(seqs(&window), (43..50).rev().collect::<Vec<u64>>());
    }

    #[test]
    fn snapshot_is_detached() {
        let mut window = EventWindow::new();
        window.push(ev(1));
        let snap = window.snapshot();
        window.push(ev(2));
        assert_eq!(snap.len(), 1);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn counts_anomalies() {
        let mut window = EventWindow::new();
        for i in 1..=30 {
            window.push(ev(i));
        }
        assert_eq!(window.anomaly_count(), 3);
    }
}
