//! The matching round: preprocess, candidate search, match assembly.
//!
//! A round runs in three stages over a table of [`TicketView`]s:
//!
//! 1. **Preprocess** computes each ticket's base priority from its configured
//!    priority and its age (older tickets rate higher), and records the
//!    priority span for noise scaling.
//! 2. **Candidate search** scores every compatible unordered pair and offers
//!    each side to the other's candidate slots. Inputs of
//!    [`MIN_FOR_PARALLEL`] tickets or more are partitioned across threads.
//! 3. **Assembly** walks tickets in input order and greedily forms
//!    non-overlapping groups from their best candidates. Tickets that lost
//!    all their candidates to earlier groups are *victims of theft* and are
//!    retried by the caller in reliable mode (unbounded candidate lists, no
//!    usage pruning).
//!
//! Greedy assembly is deliberate: globally optimal (minimum total distance)
//! matching is a non-goal, the victim retry recovers the practically
//! relevant losses at a fraction of the cost.

use std::collections::HashSet;

use rand::Rng;
use tracing::warn;

use crate::constants::{
    MAX_PARALLEL_SEARCH_THREADS, MIN_FOR_PARALLEL, MIN_NOISE, NOISE_SPAN_FACTOR,
    USAGE_IGNORE_FACTOR,
};
use crate::plugin::{CandidateSnapshot, PoolPlugin};
use crate::protocol::TicketMatch;

use super::view::{Candidate, RequirementView, TicketView};

/// Compute base priorities and return the priority span.
///
/// `base = priority_base + age_normalized * age_priority_factor`, where
/// `age_normalized` is 1 for the oldest expiry in the table and 0 for the
/// newest. A table where every expiry is equal has no age signal and the
/// age term contributes 0.
pub(crate) fn preprocess(views: &mut [TicketView]) -> f32 {
    if views.is_empty() {
        return 0.0;
    }

    let mut min_expire = i64::MAX;
    let mut max_expire = i64::MIN;
    for view in views.iter() {
        min_expire = min_expire.min(view.expiry);
        max_expire = max_expire.max(view.expiry);
    }
    let expire_range = (max_expire - min_expire) as f32;

    let mut min_base = f32::INFINITY;
    let mut max_base = f32::NEG_INFINITY;
    for view in views.iter_mut() {
        let age_normalized = if expire_range == 0.0 {
            0.0
        } else {
            1.0 - ((view.expiry - min_expire) as f32 / expire_range)
        };
        view.base_priority = view.priority_base as f32 + age_normalized * view.age_priority_factor;
        min_base = min_base.min(view.base_priority);
        max_base = max_base.max(view.base_priority);
    }

    max_base - min_base
}

/// Whether every requirement group is satisfied against the given state.
fn requirements_met(groups: &[Vec<RequirementView>], state: &[Vec<f32>]) -> bool {
    groups
        .iter()
        .all(|group| group.iter().any(|req| requirement_met(req, state)))
}

fn requirement_met(req: &RequirementView, state: &[Vec<f32>]) -> bool {
    // A key past the padded state reads as an empty entry.
    let entry: &[f32] = state.get(req.key).map(Vec::as_slice).unwrap_or(&[]);
    if req.ranged {
        match entry.first() {
            Some(&v) => v >= req.values[0] && v <= req.values[1],
            None => false,
        }
    } else {
        req.values.iter().any(|v| entry.contains(v))
    }
}

/// Evaluate the affinity pairs of two tickets.
///
/// Returns the rating contributions `(priority_for_a, priority_for_b)`, or
/// `None` when a hard margin vetoes the pair.
fn affinity_priorities(a: &TicketView, b: &TicketView) -> Option<(f32, f32)> {
    let pairs = a.affinities.len().min(b.affinities.len());
    let mut priority_a = 0.0;
    let mut priority_b = 0.0;

    for i in 0..pairs {
        let fa = &a.affinities[i];
        let fb = &b.affinities[i];
        let diff = (fa.value - fb.value).abs();

        let mut norm_a = normalized_distance(diff, fa.max_margin_inverted);
        if !fa.prefer_disimilar {
            norm_a = 1.0 - norm_a;
        }
        let mut norm_b = normalized_distance(diff, fb.max_margin_inverted);
        if !fb.prefer_disimilar {
            norm_b = 1.0 - norm_b;
        }

        if !fa.soft_margin && norm_a == 0.0 {
            return None;
        }
        if !fb.soft_margin && norm_b == 0.0 {
            return None;
        }

        priority_a += norm_a * fa.priority_factor;
        priority_b += norm_b * fb.priority_factor;
    }

    Some((priority_a, priority_b))
}

#[inline]
fn normalized_distance(diff: f32, margin_inverted: f32) -> f32 {
    // Guarding the zero case keeps `0 * INFINITY` (NaN) out of the math
    // when the margin is zero.
    if diff <= 0.0 {
        0.0
    } else {
        (diff * margin_inverted).clamp(0.0, 1.0)
    }
}

/// Score all unordered pairs and fill candidate slots.
pub(crate) fn find_candidates(views: &[TicketView], priority_span: f32, prune_usage: bool) {
    let n = views.len();
    if n < 2 {
        return;
    }

    if n >= MIN_FOR_PARALLEL {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
            .min(MAX_PARALLEL_SEARCH_THREADS)
            .max(1);
        std::thread::scope(|scope| {
            for start in 0..workers {
                scope.spawn(move || {
                    scan_pairs(views, priority_span, prune_usage, start, workers);
                });
            }
        });
    } else {
        scan_pairs(views, priority_span, prune_usage, 0, 1);
    }
}

/// Scan outer indices `start, start+stride, …` against all later tickets.
///
/// Striding instead of chunking balances the triangular pair loop: early
/// outer indices pair with nearly every ticket, late ones with almost none.
fn scan_pairs(views: &[TicketView], priority_span: f32, prune_usage: bool, start: usize, stride: usize) {
    let n = views.len();
    let noise_limit = (priority_span * NOISE_SPAN_FACTOR).max(MIN_NOISE);
    let usage_limit = views[0].slot_capacity() as u32 * USAGE_IGNORE_FACTOR;
    let mut rng = rand::thread_rng();

    let mut a = start;
    while a + 1 < n {
        for b in (a + 1)..n {
            // Pile-up guard: a ticket already held by several times its
            // slot capacity will mostly be stolen from its holders anyway.
            if prune_usage && views[b].usage() > usage_limit {
                continue;
            }
            if !requirements_met(&views[a].requirements, &views[b].state) {
                continue;
            }
            if !requirements_met(&views[b].requirements, &views[a].state) {
                continue;
            }
            let Some((priority_a, priority_b)) = affinity_priorities(&views[a], &views[b]) else {
                continue;
            };

            // One noise sample per pair, shared by both directions, so a
            // mutual-best pair stays mutual. Zero noise would leave
            // identical-priority tickets tied; the floor keeps the range
            // non-degenerate.
            let noise = rng.gen_range(0.0..noise_limit);
            let rating_a = noise + views[b].base_priority + priority_a;
            let rating_b = noise + views[a].base_priority + priority_b;

            views[a].add_candidate(views, b, rating_a);
            views[b].add_candidate(views, a, rating_b);
        }
        a += stride;
    }
}

/// Form non-overlapping matches from filled candidate slots.
///
/// Returns the number of victims that did not fit into `victims` (its
/// capacity is `victims_cap`).
pub(crate) fn assemble_matches(
    views: &[TicketView],
    match_size: usize,
    plugin: Option<&dyn PoolPlugin>,
    matches: &mut Vec<TicketMatch>,
    victims: &mut Vec<usize>,
    victims_cap: usize,
) -> usize {
    let wanted = match_size - 1;
    let mut victims_overflow = 0;

    for owner in 0..views.len() {
        if views[owner].is_consumed() {
            continue;
        }
        views[owner].set_consumed(true);

        let slots = views[owner].candidates();

        // Default picks: best-rated candidates still on the table. Everything
        // already claimed by an earlier group counts as stolen.
        let mut candidates_stolen = 0usize;
        let mut default_picks: Vec<usize> = Vec::with_capacity(wanted);
        for (slot, candidate) in slots.iter().enumerate() {
            if default_picks.len() == wanted {
                break;
            }
            if views[candidate.ticket].is_consumed() {
                candidates_stolen += 1;
                continue;
            }
            default_picks.push(slot);
        }

        let picks = if default_picks.len() == wanted {
            match plugin {
                Some(p) if p.override_candidate_picking() => {
                    plugin_picks(views, owner, &slots, &default_picks, p)
                }
                _ => Some(default_picks),
            }
        } else {
            // Not enough free candidates; the plugin cannot do better.
            None
        };

        let mut claimed: Vec<usize> = Vec::with_capacity(wanted);
        let complete = match picks {
            Some(picks) if picks.len() == wanted => {
                let mut valid = true;
                for slot in picks {
                    let ticket = slots[slot].ticket;
                    // A pick of an already-consumed candidate invalidates
                    // the whole match.
                    if views[ticket].is_consumed() {
                        valid = false;
                        break;
                    }
                    views[ticket].set_consumed(true);
                    claimed.push(ticket);
                }
                valid
            }
            _ => false,
        };

        if complete {
            matches.push(TicketMatch::form(
                views[owner].global_id,
                claimed.iter().map(|&t| views[t].global_id),
            ));
        } else {
            for &ticket in &claimed {
                views[ticket].set_consumed(false);
            }
            views[owner].set_consumed(false);

            if candidates_stolen > wanted {
                if victims.len() < victims_cap {
                    victims.push(owner);
                } else {
                    victims_overflow += 1;
                }
            }
        }
    }

    victims_overflow
}

/// Run the plugin's candidate picker and validate its output.
///
/// Returns slot indices, or `None` when the picks invalidate the match
/// (duplicate, zero, or out-of-range index). A plugin that reports failure
/// falls back to the default picks.
fn plugin_picks(
    views: &[TicketView],
    owner: usize,
    slots: &[Candidate],
    default_picks: &[usize],
    plugin: &dyn PoolPlugin,
) -> Option<Vec<usize>> {
    let mut snapshot: Vec<CandidateSnapshot<'_>> = Vec::with_capacity(slots.len() + 1);
    snapshot.push(CandidateSnapshot {
        global_id: views[owner].global_id,
        state: &views[owner].state,
        rating: 0.0,
    });
    for candidate in slots {
        snapshot.push(CandidateSnapshot {
            global_id: views[candidate.ticket].global_id,
            state: &views[candidate.ticket].state,
            rating: candidate.rating,
        });
    }

    // The owner occupies index 0, so candidate indices are shifted by one.
    let mut picked: Vec<usize> = default_picks.iter().map(|slot| slot + 1).collect();
    if !plugin.pick_match_candidates(&snapshot, &mut picked) {
        warn!(plugin = plugin.name(), "candidate picking failed, using default picks");
        return Some(default_picks.to_vec());
    }

    let mut seen = HashSet::with_capacity(picked.len());
    let mut out = Vec::with_capacity(picked.len());
    for index in picked {
        if index == 0 || index > slots.len() || !seen.insert(index) {
            return None;
        }
        out.push(index - 1);
    }
    Some(out)
}
