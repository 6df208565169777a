//! Per-pool matchmaker state.
//!
//! A pool owns two concurrent FIFOs (fresh arrivals and priority re-entries
//! from failed rounds), the gather flag the Director routes against, a
//! non-reentrant round lock so at most one worker processes the pool at a
//! time, and the cached match-size configuration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::constants::MIN_MATCH_SIZE;
use crate::plugin::PoolPlugin;
use crate::protocol::Ticket;
use crate::types::PoolId;

/// One matchmaking pool inside a matchmaker instance.
pub struct TicketPool {
    pub id: PoolId,
    /// Fresh tickets from the fetcher.
    queue: Mutex<VecDeque<Ticket>>,
    /// Tickets re-entering after a failed round; drained before `queue`.
    priority_queue: Mutex<VecDeque<Ticket>>,
    /// Whether a worker is currently holding the pool open for intake.
    gathering: AtomicBool,
    /// Set when the last round could not match everything it should have;
    /// the next round skips the gather phase and re-matches immediately.
    has_failed_victims: AtomicBool,
    /// Serializes rounds: holders process, others skip the pool. An async
    /// mutex because the round holds it across gather sleeps and state
    /// writes.
    round_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
    /// Cached match size from `pool_match_size_<id>`, refreshed every few
    /// seconds by the fetcher.
    last_match_size: AtomicUsize,
    last_size_refresh: Mutex<Option<Instant>>,
    /// Plugin bound at pool creation; never rebound.
    pub plugin: Option<std::sync::Arc<dyn PoolPlugin>>,
}

impl TicketPool {
    pub fn new(id: PoolId, plugin: Option<std::sync::Arc<dyn PoolPlugin>>) -> Self {
        TicketPool {
            id,
            queue: Mutex::new(VecDeque::new()),
            priority_queue: Mutex::new(VecDeque::new()),
            gathering: AtomicBool::new(false),
            has_failed_victims: AtomicBool::new(false),
            round_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
            last_match_size: AtomicUsize::new(MIN_MATCH_SIZE),
            last_size_refresh: Mutex::new(None),
            plugin,
        }
    }

    /// Queue a freshly fetched ticket.
    pub fn enqueue(&self, ticket: Ticket) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ticket);
    }

    /// Re-queue a residue ticket ahead of fresh arrivals.
    pub fn requeue_priority(&self, ticket: Ticket) {
        self.priority_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ticket);
    }

    /// Fresh-queue depth. Workers only wake for a pool when this reaches
    /// two; priority re-entries alone cannot form a new match.
    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total queued tickets (both FIFOs); what the status blob reports.
    pub fn ticket_count(&self) -> usize {
        self.queue_len()
            + self
                .priority_queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
    }

    /// Drain up to `limit` tickets for a round, priority re-entries first.
    pub fn take_snapshot(&self, limit: usize) -> Vec<Ticket> {
        let mut snapshot = Vec::with_capacity(limit.min(64));
        {
            let mut priority = self
                .priority_queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            while snapshot.len() < limit {
                match priority.pop_front() {
                    Some(ticket) => snapshot.push(ticket),
                    None => break,
                }
            }
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            while snapshot.len() < limit {
                match queue.pop_front() {
                    Some(ticket) => snapshot.push(ticket),
                    None => break,
                }
            }
        }
        snapshot
    }

    /// Try to become the worker for this pool's next round.
    pub fn try_round(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.round_lock.clone().try_lock_owned().ok()
    }

    pub fn is_gathering(&self) -> bool {
        self.gathering.load(Ordering::Relaxed)
    }

    pub fn set_gathering(&self, value: bool) {
        self.gathering.store(value, Ordering::Relaxed);
    }

    pub fn has_failed_victims(&self) -> bool {
        self.has_failed_victims.load(Ordering::Relaxed)
    }

    pub fn set_failed_victims(&self, value: bool) {
        self.has_failed_victims.store(value, Ordering::Relaxed);
    }

    /// The cached configured match size.
    pub fn match_size(&self) -> usize {
        self.last_match_size.load(Ordering::Relaxed)
    }

    /// Update the cached match size; sub-minimum values are ignored.
    pub fn set_match_size(&self, size: usize) {
        if size >= MIN_MATCH_SIZE {
            self.last_match_size.store(size, Ordering::Relaxed);
        }
    }

    /// Whether the match-size cache is due for a refresh.
    pub fn size_refresh_due(&self, interval: std::time::Duration) -> bool {
        let guard = self
            .last_size_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(last) => last.elapsed() >= interval,
            None => true,
        }
    }

    /// Record a completed match-size refresh.
    pub fn mark_size_refreshed(&self) {
        *self
            .last_size_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}
