//! Match validation and reader fan-out.

use tracing::{debug, info, warn};

use crate::constants::BATCH_LIMIT;
use crate::error::Result;
use crate::protocol::TicketMatch;
use crate::state::keys;
use crate::types::StateId;

use super::Director;

impl Director {
    /// Validate freshly posted matches and feed the reader channel.
    ///
    /// Runs only while readers are connected; without a consumer, matches
    /// stay in the stream untouched. Each stream entry is processed once
    /// (dedup by entry id); a store failure mid-validation reverts the
    /// dedup so the entry is reprocessed next tick.
    pub(crate) async fn process_matches(&self) {
        // Matches consumed by readers since the last tick leave the stream
        // first; their dedup entries go with them.
        let delivered: Vec<StateId> = {
            let mut pending = self
                .matches_to_delete
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };
        if !delivered.is_empty() {
            match self
                .state()
                .stream_delete_messages(keys::MATCHES, &delivered)
                .await
            {
                Ok(_) => {
                    for id in &delivered {
                        self.received_match_state_ids.remove(id);
                    }
                }
                Err(error) => {
                    warn!(%error, "delivered-match deletion failed; will retry");
                    let mut pending = self
                        .matches_to_delete
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    pending.extend(delivered);
                }
            }
        }

        if self.reader_count() == 0 {
            return;
        }

        let entries = match self
            .state()
            .stream_read(keys::MATCHES, Some(BATCH_LIMIT))
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "match stream read failed");
                return;
            }
        };

        let mut poison: Vec<StateId> = Vec::new();
        for entry in entries {
            // Entries stay in the stream until delivered, so re-reads are
            // routine.
            if !self.received_match_state_ids.insert(entry.id.clone()) {
                continue;
            }

            let m = match TicketMatch::from_wire(&entry.data) {
                Ok(m) => m.with_state_id(entry.id),
                Err(error) => {
                    warn!(%error, id = %entry.id, "dropping unparsable match");
                    self.received_match_state_ids.remove(&entry.id);
                    poison.push(entry.id);
                    continue;
                }
            };

            if let Err(error) = self.validate_and_route(m).await {
                warn!(%error, "match validation failed; will reprocess");
            }
        }

        if !poison.is_empty() {
            let _ = self
                .state()
                .stream_delete_messages(keys::MATCHES, &poison)
                .await;
        }
    }

    /// Check a match's participants against the live-ticket set, adjust
    /// the set, and hand the match to the reader channel.
    async fn validate_and_route(&self, m: TicketMatch) -> Result<()> {
        let ids: Vec<String> = m.ticket_ids.iter().map(|id| id.to_string()).collect();

        let live_flags = match self
            .state()
            .set_contains_batch(keys::TICKETS_SUBMITTED, &ids)
            .await
        {
            Ok(flags) => flags,
            Err(error) => {
                // Revert the dedup so the next tick reprocesses this entry.
                self.received_match_state_ids.remove(&m.state_id);
                return Err(error.into());
            }
        };

        if live_flags.iter().all(|&live| live) {
            // Fully valid: every participant leaves the live set.
            if let Err(error) = self
                .state()
                .set_remove_batch(keys::TICKETS_SUBMITTED, &ids)
                .await
            {
                self.received_match_state_ids.remove(&m.state_id);
                return Err(error.into());
            }
            debug!(id = %m.global_id, tickets = ids.len(), "match validated");
        } else {
            // Some participant was cancelled or expired while the match
            // formed. The stale ids leave the set; the still-valid
            // participants keep their live entry and are flagged for
            // re-admission once their consumed ticket surfaces.
            let mut invalid: Vec<String> = Vec::new();
            for (global_id, live) in m.ticket_ids.iter().zip(&live_flags) {
                if *live {
                    self.tickets_to_readd.insert(*global_id);
                } else {
                    invalid.push(global_id.to_string());
                }
            }
            info!(
                id = %m.global_id,
                invalid = invalid.len(),
                readd = m.ticket_ids.len() - invalid.len(),
                "match contains dead tickets; valid participants will re-enter"
            );
            if let Err(error) = self
                .state()
                .set_remove_batch(keys::TICKETS_SUBMITTED, &invalid)
                .await
            {
                self.received_match_state_ids.remove(&m.state_id);
                return Err(error.into());
            }
        }

        // Either way the match reaches the readers; a full channel
        // back-pressures this loop rather than dropping.
        if self.match_sender().send(m).await.is_err() {
            warn!("match channel closed");
        }
        Ok(())
    }

    /// Deliver matches to a reader callback until it fails or the cancel
    /// signal fires.
    ///
    /// A match is scheduled for stream deletion only after the callback
    /// returns success; a failed delivery returns the match to the channel
    /// for another reader and stops this one.
    pub async fn read_incoming_matches<F, Fut, E>(
        &self,
        mut cancel: tokio::sync::broadcast::Receiver<()>,
        mut deliver: F,
    ) -> std::result::Result<(), E>
    where
        F: FnMut(TicketMatch) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), E>>,
    {
        self.reader_started();
        let result = loop {
            let next = tokio::select! {
                _ = cancel.recv() => break Ok(()),
                next = async {
                    let mut receiver = self.match_receiver().lock().await;
                    receiver.recv().await
                } => next,
            };
            let Some(m) = next else {
                break Ok(());
            };

            match deliver(m.clone()).await {
                Ok(()) => self.consume_match(m),
                Err(error) => {
                    self.return_match(m).await;
                    break Err(error);
                }
            }
        };
        self.reader_stopped();
        result
    }

    /// Mark a match as delivered; the next tick removes it from the
    /// stream.
    pub(crate) fn consume_match(&self, m: TicketMatch) {
        self.matches_to_delete
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(m.state_id);
    }

    /// Give a match back to the channel for another reader.
    pub(crate) async fn return_match(&self, m: TicketMatch) {
        if self.match_sender().send(m).await.is_err() {
            warn!("match channel closed while returning a match");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::ServiceConfig;
    use crate::encode::ToWire;
    use crate::state::{keys, MemoryState, State};
    use crate::types::GlobalId;

    use super::super::Director;
    use super::*;

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            director_update_delay: 0.02,
            matchmaker_update_delay: 0.02,
            max_downtime_before_offline: 0.5,
            ..Default::default()
        }
    }

    async fn post_match(state: &MemoryState, m: &TicketMatch) -> StateId {
        state.stream_add(keys::MATCHES, m.to_wire()).await.unwrap()
    }

    async fn mark_live(state: &MemoryState, ids: &[GlobalId]) {
        for id in ids {
            state
                .set_add(keys::TICKETS_SUBMITTED, &id.to_string())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_matches_wait_for_a_reader() {
        let state = Arc::new(MemoryState::new());
        let d = Director::new(state.clone(), test_config()).unwrap();

        let m = TicketMatch::form(GlobalId::random(), [GlobalId::random()]);
        mark_live(&state, &m.ticket_ids).await;
        post_match(&state, &m).await;

        d.process_matches().await;

        // No readers: nothing consumed, nothing deduplicated.
        assert_eq!(state.stream_read(keys::MATCHES, None).await.unwrap().len(), 1);
        assert!(d.received_match_state_ids.is_empty());
        for id in &m.ticket_ids {
            assert!(state
                .set_contains(keys::TICKETS_SUBMITTED, &id.to_string())
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_valid_match_clears_live_set_and_routes() {
        let state = Arc::new(MemoryState::new());
        let d = Director::new(state.clone(), test_config()).unwrap();
        d.reader_started();

        let m = TicketMatch::form(GlobalId::random(), [GlobalId::random()]);
        mark_live(&state, &m.ticket_ids).await;
        let entry_id = post_match(&state, &m).await;

        d.process_matches().await;

        for id in &m.ticket_ids {
            assert!(!state
                .set_contains(keys::TICKETS_SUBMITTED, &id.to_string())
                .await
                .unwrap());
        }
        let routed = d.match_receiver().lock().await.try_recv().unwrap();
        assert_eq!(routed.global_id, m.global_id);
        assert_eq!(routed.state_id, entry_id);

        // Re-running does not deliver the same entry twice.
        d.process_matches().await;
        assert!(d.match_receiver().lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_match_flags_survivors_for_readd() {
        let state = Arc::new(MemoryState::new());
        let d = Director::new(state.clone(), test_config()).unwrap();
        d.reader_started();

        let valid = GlobalId::random();
        let cancelled = GlobalId::random();
        let m = TicketMatch::form(valid, [cancelled]);
        // Only the owner is still live.
        mark_live(&state, &[valid]).await;
        post_match(&state, &m).await;

        d.process_matches().await;

        // The survivor stays live and is flagged for re-admission.
        assert!(state
            .set_contains(keys::TICKETS_SUBMITTED, &valid.to_string())
            .await
            .unwrap());
        assert!(d.tickets_to_readd.contains(&valid));
        assert!(!d.tickets_to_readd.contains(&cancelled));

        // The match still reaches readers.
        assert!(d.match_receiver().lock().await.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_consumed_matches_leave_the_stream() {
        let state = Arc::new(MemoryState::new());
        let d = Director::new(state.clone(), test_config()).unwrap();
        d.reader_started();

        let m = TicketMatch::form(GlobalId::random(), [GlobalId::random()]);
        mark_live(&state, &m.ticket_ids).await;
        post_match(&state, &m).await;

        d.process_matches().await;
        let routed = d.match_receiver().lock().await.try_recv().unwrap();
        d.consume_match(routed);

        d.process_matches().await;
        assert!(state.stream_read(keys::MATCHES, None).await.unwrap().is_empty());
        assert!(d.received_match_state_ids.is_empty());
    }

    #[tokio::test]
    async fn test_poison_match_entries_are_dropped() {
        let state = Arc::new(MemoryState::new());
        let d = Director::new(state.clone(), test_config()).unwrap();
        d.reader_started();

        state
            .stream_add(keys::MATCHES, bytes::Bytes::from_static(&[0xFF]))
            .await
            .unwrap();

        d.process_matches().await;
        assert!(state.stream_read(keys::MATCHES, None).await.unwrap().is_empty());
        assert!(d.match_receiver().lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reader_delivers_and_consumes() {
        let state = Arc::new(MemoryState::new());
        let d = Director::new(state.clone(), test_config()).unwrap();

        let m = TicketMatch::form(GlobalId::random(), [GlobalId::random()]);
        d.match_sender().send(m.clone()).await.unwrap();

        let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
        let cancel = d.shutdown_signal();
        let reader = {
            let d = Arc::clone(&d);
            let delivered = Arc::clone(&delivered);
            tokio::spawn(async move {
                d.read_incoming_matches(cancel, move |m| {
                    let delivered = Arc::clone(&delivered);
                    async move {
                        delivered.lock().unwrap().push(m.global_id);
                        Ok::<(), crate::error::Error>(())
                    }
                })
                .await
            })
        };

        // Give the reader a moment, then stop it via shutdown.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        d.shutdown();
        reader.await.unwrap().unwrap();

        assert_eq!(delivered.lock().unwrap().as_slice(), &[m.global_id]);
        assert_eq!(d.reader_count(), 0);
        // Delivered match is queued for stream deletion.
        assert_eq!(d.matches_to_delete.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reader_error_returns_match_and_stops() {
        let state = Arc::new(MemoryState::new());
        let d = Director::new(state.clone(), test_config()).unwrap();

        let m = TicketMatch::form(GlobalId::random(), [GlobalId::random()]);
        d.match_sender().send(m.clone()).await.unwrap();

        let cancel = d.shutdown_signal();
        let result = d
            .read_incoming_matches(cancel, |_m| async {
                Err::<(), _>(crate::error::Error::Parse("client went away".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(d.reader_count(), 0);
        // The match is back in the channel for the next reader.
        let returned = d.match_receiver().lock().await.try_recv().unwrap();
        assert_eq!(returned.global_id, m.global_id);
    }
}
