//! Traffic controller.
//!
//! Global admission control for node execution: a fixed concurrency cap, a
//! strict four-level priority queue with arrival-order tie-breaking, and a
//! pause gate. High-priority work (directors, system nodes) enters first;
//! critics and auditors yield to everyone else.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

/// Priority levels. Lower value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Directors, system orchestration nodes.
    Vip = 0,
    /// Critical-path work.
    High = 1,
    /// Standard agents.
    Standard = 2,
    /// Critics, auditors, bulk operations.
    Bulk = 3,
}

impl Priority {
    pub fn name(&self) -> &'static str {
        match self {
            Priority::Vip => "VIP",
            Priority::High => "HIGH",
            Priority::Standard => "STANDARD",
            Priority::Bulk => "BULK",
        }
    }
}

struct Ticket {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<()>,
    name: String,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops
// first.
impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Ticket {}
impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct TrafficState {
    active: usize,
    paused: bool,
    next_seq: u64,
    queue: BinaryHeap<Ticket>,
}

/// Priority-aware admission layer with a global concurrency cap.
pub struct TrafficController {
    max_concurrency: usize,
    state: Mutex<TrafficState>,
}

impl TrafficController {
    /// Cap of 1 serializes all node execution; larger caps allow true
    /// concurrency. The cap is fixed for the controller's lifetime.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            state: Mutex::new(TrafficState {
                active: 0,
                paused: false,
                next_seq: 0,
                queue: BinaryHeap::new(),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Acquire a slot, blocking until the controller is unpaused, a slot is
    /// free, and this caller is the highest-priority waiter.
    pub async fn acquire(&self, name: &str, priority: Priority) {
        let rx = {
            let mut state = self.state.lock().await;

            // Fast path: nothing queued, slot free, not paused.
            if !state.paused && state.queue.is_empty() && state.active < self.max_concurrency {
                state.active += 1;
                info!(
                    name,
                    active = state.active,
                    cap = self.max_concurrency,
                    "traffic: direct entry"
                );
                return;
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Ticket {
                priority,
                seq,
                tx,
                name: name.to_string(),
            });
            info!(
                name,
                priority = priority.name(),
                position = state.queue.len(),
                "traffic: queued"
            );
            rx
        };

        // The dispatcher increments `active` before signalling, so the slot
        // is already accounted for when this resolves.
        if rx.await.is_err() {
            warn!(name, "traffic: dispatcher dropped, treating as acquired");
        }
        info!(name, "traffic: acquired");
    }

    /// Release a held slot and wake the next waiter.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
        info!(
            active = state.active,
            cap = self.max_concurrency,
            "traffic: released"
        );
        Self::dispatch(&mut state, self.max_concurrency);
    }

    /// Gate new acquisitions. In-flight slots remain held.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        state.paused = true;
        warn!("traffic: paused");
    }

    /// Re-open admission and drain eligible waiters.
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
        info!("traffic: resumed");
        Self::dispatch(&mut state, self.max_concurrency);
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    /// Number of currently held slots.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active
    }

    /// Number of queued waiters.
    pub async fn queued_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    fn dispatch(state: &mut TrafficState, cap: usize) {
        while !state.paused && state.active < cap {
            match state.queue.pop() {
                Some(ticket) => {
                    // A waiter that gave up is skipped without consuming a
                    // slot.
                    if ticket.tx.send(()).is_ok() {
                        state.active += 1;
                        info!(name = %ticket.name, active = state.active, "traffic: dispatched");
                    }
                }
                None => break,
            }
        }
    }
}
