//! Per-pool matching: ticket views, candidate scoring, match assembly.
//!
//! The matchmaker worker converts a snapshot of tickets into
//! [`TicketView`]s (see [`view`]) and hands them to [`match_function`],
//! which runs the full round described in [`algorithm`]: preprocessing,
//! candidate search, greedy assembly, and — when enough tickets lost their
//! candidates to theft — a reliable retry pass with unbounded candidate
//! lists.

pub mod algorithm;
pub mod view;

pub use view::{Candidate, TicketView};

use tracing::debug;

use crate::constants::{MAX_FOR_RELIABLE, MIN_MATCH_SIZE};
use crate::plugin::PoolPlugin;
use crate::protocol::TicketMatch;

use algorithm::{assemble_matches, find_candidates, preprocess};

/// Result of one matching round.
#[derive(Debug)]
pub struct MatchOutcome {
    /// Formed matches; every one has exactly `match_size` participants.
    pub matches: Vec<TicketMatch>,
    /// Whether the round matched everything it possibly could. `false`
    /// means victims overflowed the retry buffer; the worker skips the
    /// gather phase next round and immediately re-matches the residue.
    pub matched_all_it_could: bool,
}

/// Run one matching round over a table of views.
///
/// `unreliable_only` disables the reliable fallback; the worker sets it for
/// oversized snapshots where the quadratic reliable pass would be too
/// expensive.
pub fn match_function(
    views: &mut [TicketView],
    match_size: usize,
    plugin: Option<&dyn PoolPlugin>,
    unreliable_only: bool,
) -> MatchOutcome {
    let mut matches = Vec::new();

    if match_size < MIN_MATCH_SIZE || views.len() < match_size {
        return MatchOutcome {
            matches,
            matched_all_it_could: true,
        };
    }

    let priority_span = preprocess(views);
    find_candidates(views, priority_span, true);

    let mut victims: Vec<usize> = Vec::new();
    let victims_overflow = assemble_matches(
        views,
        match_size,
        plugin,
        &mut matches,
        &mut victims,
        MAX_FOR_RELIABLE,
    );

    if victims.len() >= match_size && !unreliable_only {
        debug!(
            victims = victims.len(),
            "running reliable fallback for theft victims"
        );
        let unreliable_matches = matches.len();

        // Unbounded candidate lists: every victim can hold every other
        // victim, so no theft can strand a matchable ticket again.
        let slot_capacity = victims.len() - 1;
        let mut reliable: Vec<TicketView> = victims
            .iter()
            .map(|&i| views[i].rebuild_with_capacity(slot_capacity))
            .collect();

        let priority_span = preprocess(&mut reliable);
        find_candidates(&reliable, priority_span, false);

        let mut no_victims = Vec::new();
        assemble_matches(&reliable, match_size, plugin, &mut matches, &mut no_victims, 0);

        // Tickets matched by the fallback are consumed in the caller's
        // table too, so the residue accounting sees them as used.
        for m in &matches[unreliable_matches..] {
            for &original in &victims {
                if m.ticket_ids.contains(&views[original].global_id) {
                    views[original].set_consumed(true);
                }
            }
        }
    }

    MatchOutcome {
        matches,
        matched_all_it_could: victims_overflow == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Affinity, Ticket};
    use crate::types::{GlobalId, PoolId};

    fn ticket_with_affinity(value: f32) -> Ticket {
        Ticket {
            global_id: GlobalId::random(),
            expiry_matchmaker: 1_000_000,
            affinities: vec![Affinity {
                value,
                max_margin: 1000.0,
                prefer_disimilar: false,
                soft_margin: true,
                priority_factor: 1.0,
            }],
            ..Ticket::new(PoolId::default_pool())
        }
    }

    fn convert_all(tickets: &[Ticket], match_size: usize) -> Vec<TicketView> {
        let max_state = TicketView::max_state_size(tickets);
        tickets
            .iter()
            .map(|t| TicketView::convert(t, max_state, 8 * (match_size - 1)))
            .collect()
    }

    #[test]
    fn test_too_few_tickets_is_a_clean_noop() {
        let tickets = vec![ticket_with_affinity(1000.0)];
        let mut views = convert_all(&tickets, 2);
        let outcome = match_function(&mut views, 2, None, false);
        assert!(outcome.matches.is_empty());
        assert!(outcome.matched_all_it_could);
    }

    #[test]
    fn test_invalid_match_size_is_rejected() {
        let tickets: Vec<Ticket> = (0..4).map(|_| ticket_with_affinity(1000.0)).collect();
        let mut views = convert_all(&tickets, 2);
        let outcome = match_function(&mut views, 1, None, false);
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn test_match_sizes_are_exact() {
        let tickets: Vec<Ticket> = (0..9).map(|_| ticket_with_affinity(1000.0)).collect();
        let mut views = convert_all(&tickets, 3);
        let outcome = match_function(&mut views, 3, None, false);
        assert_eq!(outcome.matches.len(), 3);
        for m in &outcome.matches {
            assert_eq!(m.ticket_ids.len(), 3);
        }
    }

    #[test]
    fn test_soft_affinity_pairs_by_closeness() {
        // The canonical 1v1 closeness case: 1200 pairs with 1100, the two
        // 1000s pair with each other. Repeated to shake out noise
        // sensitivity.
        for _ in 0..50 {
            let tickets = vec![
                ticket_with_affinity(1200.0),
                ticket_with_affinity(1000.0),
                ticket_with_affinity(1000.0),
                ticket_with_affinity(1100.0),
            ];
            let mut views = convert_all(&tickets, 2);
            let outcome = match_function(&mut views, 2, None, false);

            assert_eq!(outcome.matches.len(), 2);
            assert!(outcome.matched_all_it_could);

            for m in &outcome.matches {
                let values: Vec<f32> = m
                    .ticket_ids
                    .iter()
                    .map(|id| {
                        tickets
                            .iter()
                            .find(|t| t.global_id == *id)
                            .unwrap()
                            .affinities[0]
                            .value
                    })
                    .collect();
                let mut sorted = values.clone();
                sorted.sort_by(f32::total_cmp);
                assert!(
                    sorted == vec![1000.0, 1000.0] || sorted == vec![1100.0, 1200.0],
                    "unexpected pairing: {values:?}"
                );
            }
        }
    }

    /// Four tickets with tiny slot arrays where theft is forced: two
    /// high-priority tickets that everyone covets pair first, robbing the
    /// two low-priority tickets of their only candidates.
    fn theft_scenario() -> Vec<Ticket> {
        let priority = |base: i32| Ticket {
            global_id: GlobalId::random(),
            expiry_matchmaker: 1_000_000,
            priority_base: base,
            ..Ticket::new(PoolId::default_pool())
        };
        vec![priority(100), priority(100), priority(0), priority(0)]
    }

    fn theft_views(tickets: &[Ticket]) -> Vec<TicketView> {
        let max_state = TicketView::max_state_size(tickets);
        // Two slots: enough for two thefts, too few to survive them.
        tickets
            .iter()
            .map(|t| TicketView::convert(t, max_state, 2))
            .collect()
    }

    #[test]
    fn test_reliable_fallback_rescues_victims() {
        let tickets = theft_scenario();
        let mut views = theft_views(&tickets);

        let outcome = match_function(&mut views, 2, None, false);
        // The two robbed tickets are mutually compatible; the fallback
        // pairs them, so everything matches.
        assert_eq!(outcome.matches.len(), 2);
        assert!(outcome.matched_all_it_could);
    }

    #[test]
    fn test_unreliable_only_skips_fallback() {
        let tickets = theft_scenario();

        let mut views = theft_views(&tickets);
        let without_fallback = match_function(&mut views, 2, None, true);
        assert_eq!(without_fallback.matches.len(), 1);

        let mut views = theft_views(&tickets);
        let with_fallback = match_function(&mut views, 2, None, false);
        assert_eq!(with_fallback.matches.len(), 2);
    }

    #[test]
    fn test_consumed_flags_cover_fallback_matches() {
        let tickets = theft_scenario();
        let mut views = theft_views(&tickets);

        let outcome = match_function(&mut views, 2, None, false);
        let matched: std::collections::HashSet<GlobalId> = outcome
            .matches
            .iter()
            .flat_map(|m| m.ticket_ids.iter().copied())
            .collect();
        for view in &views {
            assert_eq!(
                view.is_consumed(),
                matched.contains(&view.global_id),
                "consumed flag out of sync for {}",
                view.global_id
            );
        }
    }
}
