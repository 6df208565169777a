//! Consumed-ticket reconciliation and lost-ticket recovery.

use std::sync::PoisonError;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::constants::{BATCH_LIMIT, DISCARD_DELAY_TICKS};
use crate::protocol::Ticket;
use crate::state::keys;
use crate::types::StateId;

use super::{Director, DiscardState, DiscardedTicket};

impl Director {
    /// Reconcile the consumed stream against the re-add intentions.
    ///
    /// A consumed ticket flagged for re-admission (a valid participant of
    /// an invalid match) goes straight back to `tickets_unassigned`; its
    /// global id is already in `tickets_submitted`. Everything else gets a
    /// discard timer: the entry is only finalized two ticks later, so a
    /// match posted slightly after its tickets hit the consumed stream
    /// still has time to flag them for re-add.
    pub(crate) async fn clean_consumed_tickets(&self) {
        let entries = match self
            .state()
            .stream_read(keys::CONSUMED_TICKETS, Some(BATCH_LIMIT))
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "consumed stream read failed");
                return;
            }
        };

        let mut poison: Vec<StateId> = Vec::new();
        let mut readd_entries: Vec<StateId> = Vec::new();
        let mut readd_payloads: Vec<Bytes> = Vec::new();
        let mut readd_ids = Vec::new();

        for entry in entries {
            let ticket = match Ticket::from_wire(&entry.data) {
                Ok(ticket) => ticket,
                Err(error) => {
                    warn!(%error, id = %entry.id, "dropping unparsable consumed ticket");
                    poison.push(entry.id);
                    continue;
                }
            };

            if self.tickets_to_readd.contains(&ticket.global_id) {
                // Cancel the scheduled discard; too late once the timer
                // has fired and the entry sits in the discard batch.
                let cancelled = self
                    .discard_scheduled
                    .remove_if(&entry.id, |_, scheduled| !scheduled.discarded);
                let too_late = cancelled.is_none()
                    && self
                        .discard_scheduled
                        .get(&entry.id)
                        .map_or(false, |scheduled| scheduled.discarded);
                if too_late {
                    continue;
                }

                self.tickets_to_readd.remove(&ticket.global_id);
                readd_entries.push(entry.id);
                readd_payloads.push(entry.data);
                readd_ids.push(ticket.global_id);
                continue;
            }

            if self.discard_scheduled.contains_key(&entry.id) {
                continue;
            }
            self.schedule_discard(entry.id, ticket);
        }

        // Re-adds: back into the unassigned stream (the global ids are
        // still in tickets_submitted, no set write needed), then out of
        // the consumed stream so the next tick does not discard what was
        // just revived.
        if !readd_payloads.is_empty() {
            match self
                .state()
                .stream_add_batch(keys::TICKETS_UNASSIGNED, &readd_payloads)
                .await
            {
                Ok(_) => {
                    info!(count = readd_payloads.len(), "tickets re-admitted");
                    let _ = self
                        .state()
                        .stream_delete_messages(keys::CONSUMED_TICKETS, &readd_entries)
                        .await;
                }
                Err(error) => {
                    warn!(%error, "re-add write failed; will retry next tick");
                    for global_id in readd_ids {
                        self.tickets_to_readd.insert(global_id);
                    }
                }
            }
        }

        if !poison.is_empty() {
            let _ = self
                .state()
                .stream_delete_messages(keys::CONSUMED_TICKETS, &poison)
                .await;
        }

        self.finalize_discards().await;
    }

    /// Arm the discard timer for a consumed-stream entry.
    fn schedule_discard(&self, state_id: StateId, ticket: Ticket) {
        let global_id = ticket.global_id;
        self.discard_scheduled.insert(
            state_id.clone(),
            DiscardState {
                global_id,
                discarded: false,
            },
        );

        let delay = self.config().director_delay() * DISCARD_DELAY_TICKS;
        let discard_scheduled = std::sync::Arc::clone(&self.discard_scheduled);
        let discarded = std::sync::Arc::clone(&self.discarded);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A removed entry was cancelled for re-add in the meantime.
            if let Some(mut scheduled) = discard_scheduled.get_mut(&state_id) {
                if !scheduled.discarded {
                    scheduled.discarded = true;
                    discarded
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(DiscardedTicket {
                            global_id,
                            state_id: state_id.clone(),
                        });
                }
            }
        });
    }

    /// Remove finalized tickets from the live set and the consumed stream.
    async fn finalize_discards(&self) {
        let batch: Vec<DiscardedTicket> = {
            let mut discarded = self.discarded.lock().unwrap_or_else(PoisonError::into_inner);
            let take = discarded.len().min(BATCH_LIMIT);
            discarded.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let global_ids: Vec<String> = batch.iter().map(|d| d.global_id.to_string()).collect();
        if let Err(error) = self
            .state()
            .set_remove_batch(keys::TICKETS_SUBMITTED, &global_ids)
            .await
        {
            warn!(%error, "discard set removal failed; re-queueing");
            self.requeue_discards(batch);
            return;
        }

        let state_ids: Vec<StateId> = batch.iter().map(|d| d.state_id.clone()).collect();
        if let Err(error) = self
            .state()
            .stream_delete_messages(keys::CONSUMED_TICKETS, &state_ids)
            .await
        {
            warn!(%error, "discard stream deletion failed; re-queueing");
            self.requeue_discards(batch);
            return;
        }

        debug!(count = batch.len(), "consumed tickets discarded");
        for discard in &batch {
            self.discard_scheduled.remove(&discard.state_id);
        }
    }

    fn requeue_discards(&self, batch: Vec<DiscardedTicket>) {
        let mut discarded = self.discarded.lock().unwrap_or_else(PoisonError::into_inner);
        for item in batch {
            discarded.push(item);
        }
    }

    /// Retry grouped ticket moves whose destination write failed.
    pub(crate) async fn process_lost_tickets(&self) {
        let pending: Vec<(String, Vec<Bytes>)> = {
            let mut lost = self
                .lost_tickets
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *lost)
        };
        if pending.is_empty() {
            return;
        }

        for (stream_key, payloads) in pending {
            match self.state().stream_add_batch(&stream_key, &payloads).await {
                Ok(_) => {
                    info!(stream = %stream_key, count = payloads.len(), "lost tickets recovered");
                }
                Err(error) => {
                    warn!(%error, stream = %stream_key, "lost-ticket retry failed");
                    self.lost_tickets
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((stream_key, payloads));
                }
            }
        }
    }
}
