//! The matching-optimized view of a ticket.
//!
//! Tickets arrive as immutable [`Ticket`](crate::protocol::Ticket) records;
//! before a round they are converted into [`TicketView`]s that the candidate
//! search can chew through:
//!
//! - the state matrix is padded to the pool-wide maximum so requirement keys
//!   never index out of bounds,
//! - ranged requirements are normalized to carry exactly two values,
//! - affinity margins are pre-inverted (one multiply per pair instead of a
//!   divide),
//! - and each view carries a fixed-length array of candidate slots sorted
//!   descending by rating.
//!
//! # Candidate links
//!
//! Candidates reference other tickets by index into the round's view table,
//! never by pointer: a ticket holding its candidates directly would create
//! reference cycles (`Ticket ↔ candidate ↔ Ticket`) that cannot be owned
//! cleanly. The [`Candidate::ticket`] index is only meaningful within the
//! slice the view was built for.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::protocol::Ticket;
use crate::types::GlobalId;

/// One rated candidate: an index into the round's view table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub ticket: usize,
    pub rating: f32,
}

/// A requirement flattened for the hot path. Ranged requirements always
/// carry two values (`values[0] = lo`, `values[1] = hi`).
#[derive(Debug, Clone, PartialEq)]
pub struct RequirementView {
    pub key: usize,
    pub ranged: bool,
    pub values: Vec<f32>,
}

impl RequirementView {
    fn from_wire(req: &crate::protocol::Requirement) -> Self {
        let mut values = req.values.clone();
        if req.ranged {
            // Guarantee [lo, hi]; a single value collapses to a point range.
            match values.len() {
                0 => values = vec![0.0, 0.0],
                1 => values.push(values[0]),
                _ => {}
            }
        }
        RequirementView {
            key: req.key.max(0) as usize,
            ranged: req.ranged,
            values,
        }
    }
}

/// An affinity with the margin pre-inverted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffinityView {
    pub value: f32,
    pub max_margin_inverted: f32,
    pub prefer_disimilar: bool,
    pub soft_margin: bool,
    pub priority_factor: f32,
}

impl AffinityView {
    fn from_wire(aff: &crate::protocol::Affinity) -> Self {
        AffinityView {
            value: aff.value,
            max_margin_inverted: if aff.max_margin > 0.0 {
                1.0 / aff.max_margin
            } else {
                // Zero margin means any difference saturates immediately.
                f32::INFINITY
            },
            prefer_disimilar: aff.prefer_disimilar,
            soft_margin: aff.soft_margin,
            priority_factor: aff.priority_factor,
        }
    }
}

/// Fixed-capacity candidate array, sorted descending by rating.
///
/// The write path is guarded by a single mutex per owner; the reject
/// threshold (the worst stored rating once full) is mirrored into an atomic
/// so concurrent writers can short-circuit without taking the lock.
struct CandidateSlots {
    slots: Mutex<Vec<Option<Candidate>>>,
    /// Bit pattern of the current reject threshold; `NEG_INFINITY` until
    /// the array fills up.
    reject_below_bits: AtomicU32,
}

impl CandidateSlots {
    fn with_capacity(capacity: usize) -> Self {
        CandidateSlots {
            slots: Mutex::new(vec![None; capacity]),
            reject_below_bits: AtomicU32::new(f32::NEG_INFINITY.to_bits()),
        }
    }
}

/// A ticket prepared for one matching round.
pub struct TicketView {
    pub global_id: GlobalId,
    /// Expiry on the matchmaker clock, used for age-priority normalization.
    pub expiry: i64,
    pub priority_base: i32,
    pub age_priority_factor: f32,
    /// State matrix padded to the round-wide maximum; missing entries are
    /// empty.
    pub state: Vec<Vec<f32>>,
    /// Requirement groups; the outer list is all-of, each inner any-of.
    pub requirements: Vec<Vec<RequirementView>>,
    pub affinities: Vec<AffinityView>,
    /// Filled by preprocessing before the candidate search runs.
    pub base_priority: f32,
    slots: CandidateSlots,
    /// How many other tickets currently hold this one as a candidate.
    usage_by: AtomicU32,
    consumed: AtomicBool,
}

impl TicketView {
    /// Convert a ticket, padding state to `max_state_size` and sizing the
    /// candidate array to `slot_capacity`.
    pub fn convert(ticket: &Ticket, max_state_size: usize, slot_capacity: usize) -> Self {
        let mut state = ticket.state.clone();
        state.resize(max_state_size, Vec::new());

        TicketView {
            global_id: ticket.global_id,
            expiry: ticket.expiry_matchmaker,
            priority_base: ticket.priority_base,
            age_priority_factor: ticket.age_priority_factor,
            state,
            requirements: ticket
                .requirements
                .iter()
                .map(|g| g.any.iter().map(RequirementView::from_wire).collect())
                .collect(),
            affinities: ticket.affinities.iter().map(AffinityView::from_wire).collect(),
            base_priority: 0.0,
            slots: CandidateSlots::with_capacity(slot_capacity),
            usage_by: AtomicU32::new(0),
            consumed: AtomicBool::new(false),
        }
    }

    /// The largest state vector length across a batch of tickets.
    pub fn max_state_size(tickets: &[Ticket]) -> usize {
        tickets.iter().map(|t| t.state.len()).max().unwrap_or(0)
    }

    /// Clone the static parts of this view with a fresh, larger candidate
    /// array and zeroed counters. Used by the reliable fallback, which
    /// needs unbounded candidate lists.
    pub fn rebuild_with_capacity(&self, slot_capacity: usize) -> Self {
        TicketView {
            global_id: self.global_id,
            expiry: self.expiry,
            priority_base: self.priority_base,
            age_priority_factor: self.age_priority_factor,
            state: self.state.clone(),
            requirements: self.requirements.clone(),
            affinities: self.affinities.clone(),
            base_priority: 0.0,
            slots: CandidateSlots::with_capacity(slot_capacity),
            usage_by: AtomicU32::new(0),
            consumed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn slot_capacity(&self) -> usize {
        self.slots
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[inline]
    pub fn usage(&self) -> u32 {
        self.usage_by.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_consumed(&self, value: bool) {
        self.consumed.store(value, Ordering::Relaxed);
    }

    /// Snapshot the non-empty candidate slots, best first.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.slots
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Offer a candidate for this ticket's slot array.
    ///
    /// Keeps the array sorted descending. A rating at or below the current
    /// worst stored slot is rejected. On acceptance the candidate's usage
    /// counter is incremented; a candidate bumped off the tail has its
    /// usage counter decremented. Returns whether the candidate was stored.
    ///
    /// Safe to call from multiple threads: the array mutation is guarded by
    /// this ticket's slot mutex and the usage counters are atomic. The
    /// threshold pre-check outside the lock is relaxed; the decision is
    /// re-validated under the lock.
    pub fn add_candidate(&self, views: &[TicketView], ticket: usize, rating: f32) -> bool {
        // Cheap rejection without the lock. Only ever rejects ratings that
        // would also be rejected under the lock: the threshold only rises.
        let threshold = f32::from_bits(self.slots.reject_below_bits.load(Ordering::Relaxed));
        if rating <= threshold {
            return false;
        }

        let mut slots = self
            .slots
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // First slot that is empty or strictly worse than the new rating.
        // Equal ratings keep their seniority.
        let Some(insert_at) = slots
            .iter()
            .position(|slot| slot.map_or(true, |c| c.rating < rating))
        else {
            return false;
        };

        // Shift the tail down by one; the candidate falling off the end
        // releases its hold on the target's usage counter.
        if let Some(bumped) = slots.pop().flatten() {
            views[bumped.ticket].usage_by.fetch_sub(1, Ordering::Relaxed);
        }
        slots.insert(insert_at, Some(Candidate { ticket, rating }));
        views[ticket].usage_by.fetch_add(1, Ordering::Relaxed);

        // Refresh the reject threshold while still holding the lock.
        let new_threshold = match slots.last().copied().flatten() {
            Some(worst) => worst.rating,
            None => f32::NEG_INFINITY,
        };
        self.slots
            .reject_below_bits
            .store(new_threshold.to_bits(), Ordering::Relaxed);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Affinity, Requirement, RequirementGroup};
    use crate::types::PoolId;

    fn bare_view(capacity: usize) -> TicketView {
        let ticket = Ticket {
            global_id: GlobalId::random(),
            ..Ticket::new(PoolId::default_pool())
        };
        TicketView::convert(&ticket, 0, capacity)
    }

    fn views(n: usize, capacity: usize) -> Vec<TicketView> {
        (0..n).map(|_| bare_view(capacity)).collect()
    }

    #[test]
    fn test_add_candidate_keeps_descending_order() {
        let table = views(5, 3);
        assert!(table[0].add_candidate(&table, 1, 1.0));
        assert!(table[0].add_candidate(&table, 2, 3.0));
        assert!(table[0].add_candidate(&table, 3, 2.0));

        let candidates = table[0].candidates();
        let ratings: Vec<f32> = candidates.iter().map(|c| c.rating).collect();
        assert_eq!(ratings, vec![3.0, 2.0, 1.0]);
        assert_eq!(candidates[0].ticket, 2);
    }

    #[test]
    fn test_add_candidate_rejects_at_or_below_worst_when_full() {
        let table = views(6, 2);
        assert!(table[0].add_candidate(&table, 1, 5.0));
        assert!(table[0].add_candidate(&table, 2, 4.0));
        // Full now; worst is 4.0.
        assert!(!table[0].add_candidate(&table, 3, 4.0));
        assert!(!table[0].add_candidate(&table, 4, 3.0));
        assert!(table[0].add_candidate(&table, 5, 4.5));
    }

    #[test]
    fn test_add_candidate_usage_accounting() {
        let table = views(5, 2);
        table[0].add_candidate(&table, 1, 1.0);
        table[0].add_candidate(&table, 2, 2.0);
        assert_eq!(table[1].usage(), 1);
        assert_eq!(table[2].usage(), 1);

        // Bumps ticket 1 off the tail: exactly one decrement, one increment.
        assert!(table[0].add_candidate(&table, 3, 3.0));
        assert_eq!(table[1].usage(), 0);
        assert_eq!(table[3].usage(), 1);

        // Rejection leaves all counters unchanged.
        assert!(!table[0].add_candidate(&table, 4, 0.5));
        assert_eq!(table[4].usage(), 0);
        assert_eq!(table[2].usage(), 1);
        assert_eq!(table[3].usage(), 1);
    }

    #[test]
    fn test_add_candidate_partial_array_accepts_low_ratings() {
        let table = views(3, 4);
        assert!(table[0].add_candidate(&table, 1, 10.0));
        // Array not yet full: a much worse rating still gets a slot.
        assert!(table[0].add_candidate(&table, 2, -5.0));
        let ratings: Vec<f32> = table[0].candidates().iter().map(|c| c.rating).collect();
        assert_eq!(ratings, vec![10.0, -5.0]);
    }

    #[test]
    fn test_add_candidate_threadsafe_under_contention() {
        use std::sync::atomic::AtomicUsize;

        let n = 64;
        let capacity = 8;
        let table = views(n, capacity);
        let accepted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for w in 0..4 {
                let table = &table;
                let accepted = &accepted;
                scope.spawn(move || {
                    for i in (1 + w..n).step_by(4) {
                        if table[0].add_candidate(table, i, i as f32) {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        let candidates = table[0].candidates();
        assert_eq!(candidates.len(), capacity);
        // Descending order survived concurrent insertion.
        for pair in candidates.windows(2) {
            assert!(pair[0].rating >= pair[1].rating);
        }
        // Usage counters balance: stored candidates hold exactly one
        // reference each, everything bumped or rejected holds none.
        let total_usage: u32 = table.iter().map(|v| v.usage()).sum();
        assert_eq!(total_usage as usize, capacity);
    }

    #[test]
    fn test_convert_pads_state() {
        let ticket = Ticket {
            state: vec![vec![1.0]],
            ..Ticket::new(PoolId::default_pool())
        };
        let view = TicketView::convert(&ticket, 4, 8);
        assert_eq!(view.state.len(), 4);
        assert_eq!(view.state[0], vec![1.0]);
        assert!(view.state[3].is_empty());
    }

    #[test]
    fn test_convert_normalizes_ranged_requirements() {
        let ticket = Ticket {
            requirements: vec![RequirementGroup {
                any: vec![
                    Requirement {
                        key: 0,
                        ranged: true,
                        values: vec![],
                    },
                    Requirement {
                        key: 1,
                        ranged: true,
                        values: vec![7.0],
                    },
                    Requirement {
                        key: 2,
                        ranged: false,
                        values: vec![1.0],
                    },
                ],
            }],
            ..Ticket::new(PoolId::default_pool())
        };
        let view = TicketView::convert(&ticket, 0, 8);
        let group = &view.requirements[0];
        assert_eq!(group[0].values, vec![0.0, 0.0]);
        assert_eq!(group[1].values, vec![7.0, 7.0]);
        assert_eq!(group[2].values, vec![1.0]);
    }

    #[test]
    fn test_convert_inverts_margins() {
        let ticket = Ticket {
            affinities: vec![
                Affinity {
                    value: 1.0,
                    max_margin: 1000.0,
                    priority_factor: 1.0,
                    ..Default::default()
                },
                Affinity {
                    value: 1.0,
                    max_margin: 0.0,
                    priority_factor: 1.0,
                    ..Default::default()
                },
            ],
            ..Ticket::new(PoolId::default_pool())
        };
        let view = TicketView::convert(&ticket, 0, 8);
        assert_eq!(view.affinities[0].max_margin_inverted, 0.001);
        assert_eq!(view.affinities[1].max_margin_inverted, f32::INFINITY);
    }

    #[test]
    fn test_rebuild_resets_round_state() {
        let table = views(3, 2);
        table[0].add_candidate(&table, 1, 1.0);
        table[0].set_consumed(true);

        let rebuilt = table[0].rebuild_with_capacity(10);
        assert_eq!(rebuilt.slot_capacity(), 10);
        assert!(rebuilt.candidates().is_empty());
        assert!(!rebuilt.is_consumed());
        assert_eq!(rebuilt.usage(), 0);
        assert_eq!(rebuilt.global_id, table[0].global_id);
    }

    #[test]
    fn test_max_state_size() {
        let mut a = Ticket::new(PoolId::default_pool());
        a.state = vec![vec![1.0], vec![2.0]];
        let mut b = Ticket::new(PoolId::default_pool());
        b.state = vec![vec![1.0]];
        assert_eq!(TicketView::max_state_size(&[a, b]), 2);
        assert_eq!(TicketView::max_state_size(&[]), 0);
    }
}
