//! Ticket assignment: matchmaker status intake and routing.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::constants::BATCH_LIMIT;
use crate::encode::ToWire;
use crate::matchmaker::MatchmakerStatus;
use crate::protocol::{utc_now_micros, Ticket, NEVER_EXPIRES};
use crate::state::keys;
use crate::types::{MatchmakerId, StateId};

use super::Director;

/// One matchmaker as the Director currently sees it.
pub struct OnlineMatchmaker {
    pub id: MatchmakerId,
    pub status: MatchmakerStatus,
    /// `director_now - matchmaker_local_time` at the moment the status was
    /// read. Applied to ticket expiries so they are evaluated against the
    /// matchmaker's clock, without an NTP dependency.
    pub time_difference_micros: i64,
}

/// A routing target during one assignment pass. Counters are advanced as
/// tickets are assigned so one burst does not pile onto a single target.
struct AssignTarget {
    id: MatchmakerId,
    stream_key: String,
    time_difference_micros: i64,
    processing_tickets: usize,
    /// Pool name → (queued tickets, gathering flag).
    pools: HashMap<String, (usize, bool)>,
}

impl Director {
    /// Refresh the online-matchmaker cache and run assignment passes.
    pub(crate) async fn process_matchmakers(&self) {
        let members = match self.state().set_values(keys::MATCHMAKERS).await {
            Ok(members) => members,
            Err(error) => {
                warn!(%error, "matchmaker set read failed");
                return;
            }
        };

        for member in members {
            let Some(id) = MatchmakerId::parse(&member) else {
                warn!(member = %member, "foreign value in matchmaker set, removing");
                let _ = self.state().set_remove(keys::MATCHMAKERS, &member).await;
                continue;
            };

            match self.state().get_string(keys::status_key(&id)).await {
                Ok(Some(blob)) => match MatchmakerStatus::from_text(&blob) {
                    Ok(status) => {
                        let time_difference_micros = utc_now_micros() - status.local_time_micros;
                        self.online_matchmakers.insert(
                            id.clone(),
                            OnlineMatchmaker {
                                id,
                                status,
                                time_difference_micros,
                            },
                        );
                    }
                    Err(error) => {
                        warn!(%error, id = %id, "unparsable matchmaker status");
                        self.unregister_matchmaker(&id).await;
                    }
                },
                // No status under a registered id: the instance missed its
                // TTL window and is gone.
                Ok(None) => {
                    info!(id = %id, "matchmaker went offline");
                    self.unregister_matchmaker(&id).await;
                }
                Err(error) => {
                    warn!(%error, id = %id, "matchmaker status read failed");
                }
            }
        }

        // Drain the unassigned backlog; spend emergency headroom only
        // while full batches keep coming.
        let max_rounds = self.emergency_loop_budget() + 1;
        for _ in 0..max_rounds {
            if self.assign_tickets().await < BATCH_LIMIT {
                break;
            }
        }
    }

    /// One assignment pass over up to [`BATCH_LIMIT`] unassigned tickets.
    /// Returns how many stream entries it consumed.
    pub(crate) async fn assign_tickets(&self) -> usize {
        let entries = match self
            .state()
            .stream_read(keys::TICKETS_UNASSIGNED, Some(BATCH_LIMIT))
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "unassigned stream read failed");
                return 0;
            }
        };
        if entries.is_empty() {
            return 0;
        }
        let consumed = entries.len();

        // Parse; poison entries leave the stream with everything else.
        let mut dead_entries: Vec<StateId> = Vec::new();
        let mut tickets: Vec<Ticket> = Vec::with_capacity(entries.len());
        for entry in entries {
            match Ticket::from_wire(&entry.data) {
                Ok(ticket) => tickets.push(ticket.with_state_id(entry.id)),
                Err(error) => {
                    warn!(%error, id = %entry.id, "dropping unparsable unassigned ticket");
                    dead_entries.push(entry.id);
                }
            }
        }

        // Cancelled tickets (removed from the live set) and tickets past
        // their max age join the dead pile.
        let ids: Vec<String> = tickets.iter().map(|t| t.global_id.to_string()).collect();
        let live_flags = match self
            .state()
            .set_contains_batch(keys::TICKETS_SUBMITTED, &ids)
            .await
        {
            Ok(flags) => flags,
            Err(error) => {
                warn!(%error, "submitted-set check failed");
                return 0;
            }
        };

        let now = utc_now_micros();
        let mut expired_ids: Vec<String> = Vec::new();
        let mut valid: Vec<Ticket> = Vec::with_capacity(tickets.len());
        for (ticket, live) in tickets.into_iter().zip(live_flags) {
            if !live {
                debug!(ticket = %ticket.global_id, "dropping cancelled ticket");
                dead_entries.push(ticket.state_id);
            } else if ticket.is_past_max_age(now) {
                debug!(ticket = %ticket.global_id, "dropping expired ticket");
                expired_ids.push(ticket.global_id.to_string());
                dead_entries.push(ticket.state_id);
            } else {
                valid.push(ticket);
            }
        }

        if !expired_ids.is_empty() {
            if let Err(error) = self
                .state()
                .set_remove_batch(keys::TICKETS_SUBMITTED, &expired_ids)
                .await
            {
                warn!(%error, "expired-ticket set removal failed");
            }
        }
        if !dead_entries.is_empty() {
            let _ = self
                .state()
                .stream_delete_messages(keys::TICKETS_UNASSIGNED, &dead_entries)
                .await;
        }

        if valid.is_empty() {
            return consumed;
        }

        // Routing targets, iterated in stable id order.
        let mut targets: Vec<AssignTarget> = self
            .online_matchmakers
            .iter()
            .map(|entry| {
                let online = entry.value();
                AssignTarget {
                    id: online.id.clone(),
                    stream_key: keys::assigned_stream(&online.id),
                    time_difference_micros: online.time_difference_micros,
                    processing_tickets: online.status.processing_tickets,
                    pools: online
                        .status
                        .pools
                        .iter()
                        .map(|p| (p.name.as_str().to_string(), (p.in_queue, p.gathering)))
                        .collect(),
                }
            })
            .collect();
        targets.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        if targets.is_empty() {
            // Nobody to assign to; tickets stay in the stream for a later
            // pass.
            return consumed;
        }

        // Route each ticket, grouped by destination stream.
        let capacity = self.config().matchmaker_pool_capacity;
        let mut groups: HashMap<String, (Vec<StateId>, Vec<Bytes>)> = HashMap::new();
        for mut ticket in valid {
            let index = pick_target(&targets, ticket.pool_id.as_str(), capacity);
            let target = &mut targets[index];

            ticket.expiry_matchmaker = if ticket.max_age_seconds == 0 {
                NEVER_EXPIRES
            } else {
                // Shift the creation time onto the matchmaker's clock, then
                // add the allowance.
                (ticket.timestamp - target.time_difference_micros)
                    + i64::from(ticket.max_age_seconds) * 1_000_000
            };

            target.processing_tickets += 1;
            let pool = target
                .pools
                .entry(ticket.pool_id.as_str().to_string())
                .or_insert((0, false));
            pool.0 += 1;

            let group = groups.entry(target.stream_key.clone()).or_default();
            group.0.push(ticket.state_id.clone());
            group.1.push(ticket.to_wire());
        }

        // Move each group: delete from unassigned first, then add to the
        // target stream. A failed add goes to the lost-ticket queue; the
        // periodic recovery pass retries it.
        for (stream_key, (entry_ids, payloads)) in groups {
            if let Err(error) = self
                .state()
                .stream_delete_messages(keys::TICKETS_UNASSIGNED, &entry_ids)
                .await
            {
                warn!(%error, "unassigned delete failed; tickets stay for the next pass");
                continue;
            }
            match self.state().stream_add_batch(&stream_key, &payloads).await {
                Ok(_) => {
                    debug!(stream = %stream_key, count = payloads.len(), "tickets assigned");
                }
                Err(error) => {
                    warn!(%error, stream = %stream_key, "assigned add failed; queueing for recovery");
                    self.lost_tickets
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push((stream_key, payloads));
                }
            }
        }

        consumed
    }

    /// Take a matchmaker offline and rescue its assigned tickets.
    pub(crate) async fn unregister_matchmaker(&self, id: &MatchmakerId) {
        info!(id = %id, "unregistering matchmaker");
        self.online_matchmakers.remove(id);

        let stream = keys::assigned_stream(id);
        loop {
            let entries = match self.state().stream_read(&stream, Some(BATCH_LIMIT)).await {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(%error, id = %id, "orphaned stream read failed");
                    return;
                }
            };
            if entries.is_empty() {
                break;
            }
            let count = entries.len();

            let (entry_ids, payloads): (Vec<StateId>, Vec<Bytes>) =
                entries.into_iter().map(|e| (e.id, e.data)).unzip();

            if let Err(error) = self
                .state()
                .stream_delete_messages(&stream, &entry_ids)
                .await
            {
                warn!(%error, id = %id, "orphaned stream delete failed");
                return;
            }
            if let Err(error) = self
                .state()
                .stream_add_batch(keys::TICKETS_UNASSIGNED, &payloads)
                .await
            {
                warn!(%error, id = %id, "orphan re-queue failed; queueing for recovery");
                self.lost_tickets
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push((keys::TICKETS_UNASSIGNED.to_string(), payloads));
            }

            if count < BATCH_LIMIT {
                break;
            }
        }

        let _ = self.state().stream_delete(&stream).await;
        let _ = self
            .state()
            .set_remove(keys::MATCHMAKERS, id.as_str())
            .await;
    }
}

/// The routing rules, in order:
///
/// 1. The first matchmaker whose pool entry has room and is gathering wins
///    immediately.
/// 2. Otherwise prefer one whose pool has room and already holds tickets.
/// 3. Otherwise the least busy matchmaker overall.
fn pick_target(targets: &[AssignTarget], pool: &str, capacity: usize) -> usize {
    let mut least_busy = 0;
    let mut warm_pool: Option<usize> = None;

    for (index, target) in targets.iter().enumerate() {
        if target.processing_tickets < targets[least_busy].processing_tickets {
            least_busy = index;
        }
        if let Some(&(in_queue, gathering)) = target.pools.get(pool) {
            if in_queue < capacity && gathering {
                return index;
            }
            if warm_pool.is_none() && in_queue < capacity && in_queue > 0 {
                warm_pool = Some(index);
            }
        }
    }

    warm_pool.unwrap_or(least_busy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, processing: usize, pools: &[(&str, usize, bool)]) -> AssignTarget {
        let id = MatchmakerId::parse(id).unwrap();
        AssignTarget {
            stream_key: keys::assigned_stream(&id),
            id,
            time_difference_micros: 0,
            processing_tickets: processing,
            pools: pools
                .iter()
                .map(|&(name, queued, gathering)| (name.to_string(), (queued, gathering)))
                .collect(),
        }
    }

    #[test]
    fn test_pick_prefers_gathering_pool() {
        let targets = vec![
            target("mm_a", 0, &[("pool", 5, false)]),
            target("mm_b", 100, &[("pool", 5, true)]),
        ];
        assert_eq!(pick_target(&targets, "pool", 10), 1);
    }

    #[test]
    fn test_pick_prefers_warm_pool_over_least_busy() {
        let targets = vec![
            target("mm_a", 0, &[]),
            target("mm_b", 50, &[("pool", 3, false)]),
        ];
        assert_eq!(pick_target(&targets, "pool", 10), 1);
    }

    #[test]
    fn test_pick_keeps_scanning_for_a_gatherer() {
        // A warm pool early in the list must not stop the scan: a
        // gathering pool later still wins.
        let targets = vec![
            target("mm_a", 0, &[("pool", 3, false)]),
            target("mm_b", 10, &[("pool", 3, true)]),
        ];
        assert_eq!(pick_target(&targets, "pool", 10), 1);
    }

    #[test]
    fn test_pick_ignores_full_pools() {
        let targets = vec![
            target("mm_a", 9, &[("pool", 10, true)]),
            target("mm_b", 3, &[]),
        ];
        // Full gathering pool is no better than nothing: least busy wins.
        assert_eq!(pick_target(&targets, "pool", 10), 1);
    }

    #[test]
    fn test_pick_falls_back_to_least_busy() {
        let targets = vec![
            target("mm_a", 7, &[]),
            target("mm_b", 2, &[]),
            target("mm_c", 5, &[]),
        ];
        assert_eq!(pick_target(&targets, "pool", 10), 1);
    }

    #[test]
    fn test_pick_empty_pool_entry_is_not_warm() {
        // in_queue == 0 does not make a pool warm; least busy wins.
        let targets = vec![
            target("mm_a", 9, &[("pool", 0, false)]),
            target("mm_b", 1, &[]),
        ];
        assert_eq!(pick_target(&targets, "pool", 10), 1);
    }

    #[test]
    fn test_assign_target_maps_status_pools() {
        let t = target("mm_x", 4, &[("", 2, true), ("ranked", 1, false)]);
        assert_eq!(t.pools.get(""), Some(&(2, true)));
        assert_eq!(t.pools.get("ranked"), Some(&(1, false)));
        assert!(t.stream_key.starts_with("tickets_mm_"));
    }
}
