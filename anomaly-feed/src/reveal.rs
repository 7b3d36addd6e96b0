//! Paced reveal
//!
//! A batch analysis result arrives all at once, but handing thousands of
//! rows to the display in one frame stalls it. The `RevealScheduler` holds
//! the full batch and exposes a growing prefix of it: every
//! `REVEAL_INTERVAL` the next `REVEAL_CHUNK_SIZE` rows become visible, in
//! batch order, until the whole batch is shown.
//!
//! The scheduler owns no timer. Its owner asks for `next_deadline()` and
//! calls `poll()` once that deadline passes, so cancelling is just a state
//! change and nothing can fire after `cancel()`.

use crate::event::BatchRow;
use std::time::{Duration, Instant};

/// Rows released per tick.
pub const REVEAL_CHUNK_SIZE: usize = 50;

/// Time between ticks.
pub const REVEAL_INTERVAL: Duration = Duration::from_millis(100);

/// Externally visible phase of a reveal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealPhase {
    /// No batch.
    Idle,
    /// Some rows are still hidden.
    Revealing,
    /// Every row of the batch is visible. Terminal until the next batch.
    Complete,
}

#[derive(Debug)]
enum State {
    Idle,
    Revealing { next_tick: Instant },
    Complete,
}

#[derive(Debug)]
pub struct RevealScheduler {
    batch: Vec<BatchRow>,
    revealed: usize,
    ticks: usize,
    state: State,
}

impl Default for RevealScheduler {
    fn default() -> Self {
        RevealScheduler::new()
    }
}

impl RevealScheduler {
    pub fn new() -> RevealScheduler {
        RevealScheduler {
            batch: Vec::new(),
            revealed: 0,
            ticks: 0,
            state: State::Idle,
        }
    }

    /// Replace whatever is being revealed with `batch`, starting again from
    /// an empty prefix. The first chunk is due one interval from `now`.
    pub fn start(&mut self, batch: Vec<BatchRow>, now: Instant) {
        self.batch = batch;
        self.revealed = 0;
        self.ticks = 0;
        self.state = if self.batch.is_empty() {
            State::Complete
        } else {
            State::Revealing {
                next_tick: now + REVEAL_INTERVAL,
            }
        };
    }

    /// Stop revealing and drop the batch. No deadline remains afterwards.
    pub fn cancel(&mut self) {
        self.batch = Vec::new();
        self.revealed = 0;
        self.ticks = 0;
        self.state = State::Idle;
    }

    /// When the next chunk is due, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            State::Revealing { next_tick } => Some(next_tick),
            _ => None,
        }
    }

    /// Release the next chunk if it is due. Returns the number of rows that
    /// became visible. At most one chunk is released per call; if the caller
    /// is late, the following tick is one full interval after `now`.
    pub fn poll(&mut self, now: Instant) -> usize {
        let next_tick = match self.state {
            State::Revealing { next_tick } if now >= next_tick => next_tick,
            _ => return 0,
        };

        let before = self.revealed;
        self.revealed = std::cmp::min(self.revealed + REVEAL_CHUNK_SIZE, self.batch.len());
        self.ticks += 1;

        self.state = if self.revealed == self.batch.len() {
            State::Complete
        } else {
            let on_cadence = next_tick + REVEAL_INTERVAL;
            State::Revealing {
                next_tick: if on_cadence > now {
                    on_cadence
                } else {
                    now + REVEAL_INTERVAL
                },
            }
        };
        self.revealed - before
    }

    /// The visible prefix of the batch.
    pub fn revealed(&self) -> &[BatchRow] {
        &self.batch[..self.revealed]
    }

    /// (visible rows, total rows)
    pub fn progress(&self) -> (usize, usize) {
        (self.revealed, self.batch.len())
    }

    /// Number of chunks released for the current batch.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    pub fn phase(&self) -> RevealPhase {
        match self.state {
            State::Idle => RevealPhase::Idle,
            State::Revealing { .. } => RevealPhase::Revealing,
            State::Complete => RevealPhase::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }
}
