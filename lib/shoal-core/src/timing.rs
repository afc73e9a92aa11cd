//! Deadline scheduling for request timeouts and server reconnect backoff.
//! A min-heap keyed by deadline, consulted before every event-base wait to
//! bound its timeout and drained of expired entries right after.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// What a timer firing means to the caller. The timing wheel itself does
/// not interpret these, it just returns them in deadline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    RequestTimeout { message_id: u64 },
    ReconnectBackoff { server_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    deadline_ms: u64,
    generation: u64,
    kind_tag: u8,
    payload: u64,
}

impl Entry {
    fn kind(&self) -> TimerKind {
        match self.kind_tag {
            0 => TimerKind::RequestTimeout { message_id: self.payload },
            1 => TimerKind::ReconnectBackoff { server_index: self.payload as usize },
            _ => unreachable!("unknown timer kind tag"),
        }
    }
}

pub struct TimingWheel {
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    entries: hashbrown::HashMap<u64, Entry>,
    next_generation: u64,
}

impl TimingWheel {
    pub fn new() -> TimingWheel {
        TimingWheel {
            heap: BinaryHeap::new(),
            entries: hashbrown::HashMap::new(),
            next_generation: 0,
        }
    }

    /// Schedule `kind` to fire at `deadline_ms`. Returns a generation handle
    /// that can be used to cancel it before it fires.
    pub fn schedule(&mut self, deadline_ms: u64, kind: TimerKind) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let (kind_tag, payload) = match kind {
            TimerKind::RequestTimeout { message_id } => (0u8, message_id),
            TimerKind::ReconnectBackoff { server_index } => (1u8, server_index as u64),
        };

        self.entries.insert(
            generation,
            Entry { deadline_ms, generation, kind_tag, payload },
        );
        self.heap.push(Reverse((deadline_ms, generation)));
        generation
    }

    /// Cancel a previously scheduled timer. No-op if it already fired or was
    /// already cancelled.
    pub fn cancel(&mut self, generation: u64) {
        self.entries.remove(&generation);
    }

    /// Milliseconds until the earliest live deadline, or `None` if the
    /// wheel is empty — callers use this to bound the event base's wait.
    pub fn next_deadline_ms(&mut self, now_ms: u64) -> Option<u64> {
        self.drop_cancelled();
        self.heap.peek().map(|Reverse((deadline, _))| {
            if *deadline <= now_ms {
                0
            } else {
                deadline - now_ms
            }
        })
    }

    /// Remove and return every timer whose deadline has passed.
    pub fn expire(&mut self, now_ms: u64) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        loop {
            match self.heap.peek() {
                Some(Reverse((deadline, generation))) if *deadline <= now_ms => {
                    let generation = *generation;
                    self.heap.pop();
                    if let Some(entry) = self.entries.remove(&generation) {
                        fired.push(entry.kind());
                    }
                }
                _ => break,
            }
        }
        fired
    }

    fn drop_cancelled(&mut self) {
        while let Some(Reverse((_, generation))) = self.heap.peek().copied() {
            if self.entries.contains_key(&generation) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl Default for TimingWheel {
    fn default() -> TimingWheel {
        TimingWheel::new()
    }
}
