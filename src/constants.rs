//! Centralized tuning and protocol constants.
//!
//! This module consolidates all magic numbers used throughout the CryMatch
//! control plane. Having them in one place makes it easier to:
//!
//! - Understand the throughput and fairness constraints
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Batching Constants**: state-store round-trip limits
//! - **Matching Constants**: candidate-list sizing, parallelism thresholds
//! - **Scheduling Constants**: periodic loop intervals and tolerances

// =============================================================================
// Batching Constants
// =============================================================================

/// Maximum number of items the control plane puts into a single batched
/// state-store operation.
///
/// Every batched call (stream adds, stream deletes, set membership checks)
/// is capped at this many entries per round-trip. Larger backlogs are drained
/// over multiple iterations (or emergency loops on the Director side).
pub const BATCH_LIMIT: usize = 1_000;

/// How many recent Director loop durations are kept for the emergency-loop
/// headroom calculation.
pub const LOOP_TIME_SAMPLES: usize = 10;

/// Fraction of the Director update delay above which a loop iteration is
/// considered slow. A slow iteration logs a warning and disables emergency
/// loops for that tick.
pub const LOOP_TIME_WARN_FRACTION: f64 = 0.7;

// =============================================================================
// Matching Constants
// =============================================================================

/// Minimum input size before candidate search is partitioned across threads.
///
/// Below this, the sequential variant wins: the pair loop is quadratic but
/// cheap, and thread spawn plus cache contention costs more than it saves.
pub const MIN_FOR_PARALLEL: usize = 1_000;

/// Maximum number of victim tickets the reliable fallback pass accepts.
///
/// Reliable matching holds unbounded candidate lists, so its memory use is
/// quadratic in the victim count. Victims past this cap are reported via the
/// out-of-buffer counter and retried on the next round instead.
pub const MAX_FOR_RELIABLE: usize = 4_000;

/// Candidate slots allocated per missing match participant.
///
/// A ticket matching into a group of `match_size` keeps
/// `CANDIDATE_SLOTS_PER_PEER * (match_size - 1)` rated candidates. Eight per
/// peer gives the assembler enough alternatives to survive most theft without
/// the memory cost of full candidate lists.
pub const CANDIDATE_SLOTS_PER_PEER: usize = 8;

/// Usage-count multiplier above which a ticket is skipped as a candidate.
///
/// When more than `slots * USAGE_IGNORE_FACTOR` other tickets already hold a
/// ticket in their candidate lists, further references are pointless: the
/// pile-up means most holders will see it stolen anyway. Applies to the
/// unreliable pass only.
pub const USAGE_IGNORE_FACTOR: u32 = 3;

/// Lower bound of the random rating-noise range.
///
/// Noise breaks ties between identical-priority tickets. The floor keeps the
/// range non-degenerate when all priorities collapse to a single value.
pub const MIN_NOISE: f32 = 0.001;

/// Fraction of the priority span used as the upper bound of rating noise.
///
/// Noise proportional to the span stays small relative to genuine priority
/// differences; a fixed large range would drown them out.
pub const NOISE_SPAN_FACTOR: f32 = 0.05;

/// Smallest permitted match size.
pub const MIN_MATCH_SIZE: usize = 2;

/// Upper bound on threads used by one parallel candidate search.
///
/// The search is memory-bound past a point; more threads only fight over
/// the slot-array locks.
pub const MAX_PARALLEL_SEARCH_THREADS: usize = 16;

// =============================================================================
// Scheduling Constants
// =============================================================================

/// Interval of the matchmaker consumed-ticket cleaner.
pub const CLEANER_INTERVAL_MS: u64 = 500;

/// Settle time after a successful cleaner round before assigned-ticket
/// entries are dropped from memory. The fetcher may still be iterating a
/// stream read that contains the just-consumed tickets; dropping the dedup
/// entries too early would let it re-ingest them.
pub const CLEANER_SETTLE_MS: u64 = 100;

/// Interval of the Director ticket-submit flush timer.
pub const SUBMIT_FLUSH_INTERVAL_MS: u64 = 100;

/// The Director retries lost-ticket moves every this many main-loop ticks.
pub const LOST_TICKET_EVERY_N_TICKS: u64 = 5;

/// Consumed tickets wait this many Director ticks before being discarded,
/// giving late-posted matches time to mark them for re-add.
pub const DISCARD_DELAY_TICKS: u32 = 2;

/// How often a pool's configured match size is re-read from the state store.
pub const POOL_SIZE_REFRESH_SECS: u64 = 10;

// =============================================================================
// Configuration Defaults
// =============================================================================

/// Default RPC listen endpoint.
pub const DEFAULT_LISTEN_ENDPOINT: &str = "0.0.0.0:5000";

/// Default maximum downtime before a role is considered offline, in seconds.
pub const DEFAULT_MAX_DOWNTIME_SECS: f64 = 10.0;

/// Default matchmaker update delay, in seconds.
pub const DEFAULT_MATCHMAKER_UPDATE_DELAY_SECS: f64 = 1.0;

/// Default Director update delay, in seconds.
pub const DEFAULT_DIRECTOR_UPDATE_DELAY_SECS: f64 = 1.0;

/// Default minimum gather time, in seconds.
pub const DEFAULT_MIN_GATHER_SECS: f64 = 2.0;

/// Default per-pool snapshot capacity of a matchmaker.
pub const DEFAULT_POOL_CAPACITY: usize = 10_000;

/// Default number of failed rounds before a ticket is given up on.
pub const DEFAULT_MAX_MATCH_FAILURES: u32 = 10;

/// Hard bounds on the configured matchmaker worker count.
pub const MIN_MATCHMAKER_THREADS: usize = 1;
pub const MAX_MATCHMAKER_THREADS: usize = 128;

/// Threads of the control-plane runtime.
///
/// The periodic loops of both roles are near-idle but latency-sensitive;
/// two threads cover a pinger firing while a main-loop tick is mid-join.
/// Matching work never runs here (see [`crate::runtime`]).
pub const CONTROL_PLANE_THREADS: usize = 2;

/// Smallest permitted per-pool snapshot capacity.
pub const MIN_POOL_CAPACITY: usize = 10;

/// Smallest permitted MaxDowntimeBeforeOffline, in seconds.
pub const MIN_MAX_DOWNTIME_SECS: f64 = 0.1;

/// Smallest permitted update delay for either role, in seconds.
pub const MIN_UPDATE_DELAY_SECS: f64 = 0.01;

// =============================================================================
// Wire Constants
// =============================================================================

/// Maximum element count accepted for any repeated field while parsing.
///
/// Prevents memory exhaustion from malformed stream payloads that claim to
/// have billions of elements. Generous but bounded.
pub const MAX_WIRE_ARRAY_SIZE: usize = 100_000;

/// Maximum byte length accepted for any length-delimited wire field.
pub const MAX_WIRE_FIELD_SIZE: usize = 16 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_batch_limit_is_bounded() {
        assert!(BATCH_LIMIT >= 100);
        assert!(BATCH_LIMIT <= 10_000);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_reliable_cap_exceeds_parallel_threshold() {
        // The reliable pass must be able to absorb at least one full
        // parallel-sized victim set.
        assert!(MAX_FOR_RELIABLE >= MIN_FOR_PARALLEL);
    }

    #[test]
    fn test_candidate_slot_sizing() {
        // A 1v1 pool keeps 8 candidates per ticket.
        assert_eq!(CANDIDATE_SLOTS_PER_PEER * (2 - 1), 8);
        // A 10-player pool keeps 72.
        assert_eq!(CANDIDATE_SLOTS_PER_PEER * (10 - 1), 72);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_noise_floor_is_small() {
        assert!(MIN_NOISE > 0.0);
        assert!(MIN_NOISE < 1.0);
        assert!(NOISE_SPAN_FACTOR < 1.0);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_config_bounds_are_consistent() {
        assert!(MIN_MATCHMAKER_THREADS <= MAX_MATCHMAKER_THREADS);
        assert!(MIN_MAX_DOWNTIME_SECS > MIN_UPDATE_DELAY_SECS);
        assert!(DEFAULT_POOL_CAPACITY >= MIN_POOL_CAPACITY);
    }
}
