//! The Matchmaker role.
//!
//! A matchmaker registers itself with the Director through the shared
//! state, ingests the tickets assigned to it, and runs matching rounds per
//! pool. Four kinds of loops cooperate:
//!
//! - **Pinger** (control plane): publishes the status blob with a TTL, then
//!   adds the instance id to the `matchmakers` set. Status is written
//!   before registration so the Director never observes a registered but
//!   statusless matchmaker.
//! - **Fetcher** (control plane): drains the instance's assigned stream,
//!   deduplicates by global id, and feeds per-pool queues. Pools are
//!   created lazily on first sighting, which also binds their plugin and
//!   fetches their configured match size.
//! - **Workers** (matching plane, 1–128): cycle over pools round-robin,
//!   each round gathering, snapshotting, matching and routing the residue.
//! - **Cleaner** (control plane): moves finished tickets out of the
//!   assigned stream into `consumed_tickets`, then releases the in-memory
//!   dedup entries after a settle delay.
//!
//! Matches are posted to the `matches` stream before their tickets reach
//! `consumed_tickets`; the Director's validator relies on that order.

pub mod pool;
pub mod status;

pub use pool::TicketPool;
pub use status::{MatchmakerStatus, PoolStatus};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::constants::{
    BATCH_LIMIT, CANDIDATE_SLOTS_PER_PEER, CLEANER_INTERVAL_MS, CLEANER_SETTLE_MS,
    MAX_FOR_RELIABLE, MIN_MATCH_SIZE, POOL_SIZE_REFRESH_SECS,
};
use crate::encode::ToWire;
use crate::error::Result;
use crate::matching::{match_function, TicketView};
use crate::plugin::PluginRegistry;
use crate::protocol::{utc_now_micros, Ticket};
use crate::runtime::RuntimeHandles;
use crate::state::{keys, State};
use crate::types::{GlobalId, MatchmakerId, PoolId, StateId};

/// A ticket this instance is done with, waiting for the cleaner.
struct ConsumedTicket {
    ticket: Ticket,
    /// Whether the ticket left as part of a match (for logs only; the
    /// Director decides re-admission from its own bookkeeping).
    for_match: bool,
}

/// A matchmaker instance.
pub struct Matchmaker {
    id: MatchmakerId,
    state: Arc<dyn State>,
    config: ServiceConfig,
    pools: DashMap<PoolId, Arc<TicketPool>>,
    /// Global-id dedup across fetcher re-reads of the assigned stream.
    assigned_tickets: DashMap<GlobalId, ()>,
    consumed: Mutex<VecDeque<ConsumedTicket>>,
    plugins: PluginRegistry,
    shutdown: broadcast::Sender<()>,
    /// Shared round-robin cursor across worker loops.
    next_pool: AtomicUsize,
}

impl Matchmaker {
    /// Create an instance with a fresh `mm_<uuid>` identity.
    pub fn new(
        state: Arc<dyn State>,
        config: ServiceConfig,
        plugins: PluginRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Matchmaker {
            id: MatchmakerId::random(),
            state,
            config,
            pools: DashMap::new(),
            assigned_tickets: DashMap::new(),
            consumed: Mutex::new(VecDeque::new()),
            plugins,
            shutdown,
            next_pool: AtomicUsize::new(0),
        }))
    }

    pub fn id(&self) -> &MatchmakerId {
        &self.id
    }

    /// Tickets currently held in memory.
    pub fn processing_tickets(&self) -> usize {
        self.assigned_tickets.len()
    }

    /// Spawn all loops. Periodic loops land on the control plane, worker
    /// rounds on the matching plane. Callers keep their own `Arc` handle
    /// for shutdown and inspection.
    pub fn start(self: Arc<Self>, runtimes: &RuntimeHandles) {
        info!(id = %self.id, workers = self.config.matchmaker_threads, "starting matchmaker");

        runtimes.control.spawn(Arc::clone(&self).pinger_loop());
        runtimes.control.spawn(Arc::clone(&self).fetcher_loop());
        runtimes.control.spawn(Arc::clone(&self).cleaner_loop());
        for worker in 0..self.config.matchmaker_threads {
            runtimes.matching.spawn(Arc::clone(&self).worker_loop(worker));
        }
    }

    /// Stop all loops. In-flight state operations complete on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// The status blob this instance would publish right now.
    pub fn current_status(&self) -> MatchmakerStatus {
        let mut pools: Vec<PoolStatus> = self
            .pools
            .iter()
            .map(|entry| PoolStatus {
                name: entry.key().clone(),
                in_queue: entry.value().ticket_count(),
                gathering: entry.value().is_gathering(),
            })
            .collect();
        pools.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));

        MatchmakerStatus {
            processing_tickets: self.assigned_tickets.len(),
            local_time_micros: utc_now_micros(),
            pools,
        }
    }

    // ------------------------------------------------------------------
    // Pinger
    // ------------------------------------------------------------------

    async fn pinger_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.matchmaker_delay());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.ping().await {
                        warn!(%error, "matchmaker ping failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!(id = %self.id, "pinger stopped");
    }

    /// Publish status and register once. Driven by the pinger loop; public
    /// so embedders and tests can announce the instance deterministically.
    pub async fn ping(&self) -> Result<()> {
        let status = self.current_status().to_text();
        // Status first, registration second: the Director treats a
        // registered id without status as an offline matchmaker.
        self.state
            .set_string(
                keys::status_key(&self.id),
                Some(&status),
                Some(self.config.max_downtime()),
            )
            .await?;
        self.state
            .set_add(keys::MATCHMAKERS, self.id.as_str())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fetcher
    // ------------------------------------------------------------------

    async fn fetcher_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.matchmaker_delay());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.fetch_assigned().await {
                        warn!(%error, "assigned-ticket fetch failed");
                    }
                    self.refresh_pool_sizes().await;
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!(id = %self.id, "fetcher stopped");
    }

    /// Ingest everything currently in the assigned stream. The Director
    /// caps its writes; the fetcher reads without a count. Public for the
    /// same deterministic-stepping reason as [`ping`](Self::ping).
    pub async fn fetch_assigned(&self) -> Result<()> {
        let stream = keys::assigned_stream(&self.id);
        let entries = self.state.stream_read(&stream, None).await?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut poison: Vec<StateId> = Vec::new();
        for entry in entries {
            let ticket = match Ticket::from_wire(&entry.data) {
                Ok(ticket) => ticket.with_state_id(entry.id),
                Err(error) => {
                    warn!(%error, id = %entry.id, "dropping unparsable assigned ticket");
                    poison.push(entry.id);
                    continue;
                }
            };

            // Stream entries stay until the cleaner removes them, so
            // re-reads of already-ingested tickets are the common case.
            if self
                .assigned_tickets
                .insert(ticket.global_id, ())
                .is_some()
            {
                continue;
            }

            let pool = self.pool_for(&ticket.pool_id);
            debug!(ticket = %ticket.global_id, pool = %pool.id, "ticket ingested");
            pool.enqueue(ticket);
        }

        if !poison.is_empty() {
            // Unparsable entries would be re-read forever; delete them.
            let _ = self.state.stream_delete_messages(&stream, &poison).await;
        }
        Ok(())
    }

    fn pool_for(&self, pool_id: &PoolId) -> Arc<TicketPool> {
        self.pools
            .entry(pool_id.clone())
            .or_insert_with(|| {
                let plugin = self.plugins.bind_for_pool(pool_id);
                if let Some(plugin) = &plugin {
                    info!(pool = %pool_id, plugin = plugin.name(), "pool created with plugin");
                } else {
                    info!(pool = %pool_id, "pool created");
                }
                Arc::new(TicketPool::new(pool_id.clone(), plugin))
            })
            .clone()
    }

    /// Refresh cached match sizes. A freshly created pool is due
    /// immediately, so its configuration is fetched on first sighting.
    async fn refresh_pool_sizes(&self) {
        let interval = std::time::Duration::from_secs(POOL_SIZE_REFRESH_SECS);
        let due: Vec<Arc<TicketPool>> = self
            .pools
            .iter()
            .filter(|entry| entry.value().size_refresh_due(interval))
            .map(|entry| entry.value().clone())
            .collect();

        for pool in due {
            match self.state.get_string(&keys::pool_match_size(&pool.id)).await {
                Ok(Some(raw)) => match raw.parse::<usize>() {
                    Ok(size) => pool.set_match_size(size),
                    Err(_) => warn!(pool = %pool.id, raw = %raw, "unparsable pool match size"),
                },
                Ok(None) => {}
                Err(error) => {
                    warn!(pool = %pool.id, %error, "pool match size fetch failed");
                    continue;
                }
            }
            pool.mark_size_refreshed();
        }
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if shutdown.try_recv().is_ok() {
                break;
            }

            if let Some((pool, _round)) = self.claim_pool() {
                self.run_round(&pool).await;
                continue;
            }

            // Nothing eligible; idle until the next fetch can change that.
            tokio::select! {
                _ = tokio::time::sleep(self.config.matchmaker_delay()) => {}
                _ = shutdown.recv() => break,
            }
        }
        debug!(id = %self.id, worker, "worker stopped");
    }

    /// Pick the next eligible pool round-robin from the shared cursor and
    /// hold its round lock.
    ///
    /// A pool is eligible when at least two fresh tickets are queued
    /// (priority re-entries alone cannot form a new match) and no other
    /// worker holds its round lock.
    fn claim_pool(&self) -> Option<(Arc<TicketPool>, tokio::sync::OwnedMutexGuard<()>)> {
        let mut pools: Vec<Arc<TicketPool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        if pools.is_empty() {
            return None;
        }
        pools.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        let start = self.next_pool.fetch_add(1, Ordering::Relaxed) % pools.len();
        for offset in 0..pools.len() {
            let pool = &pools[(start + offset) % pools.len()];
            if pool.queue_len() < MIN_MATCH_SIZE {
                continue;
            }
            let Some(round) = pool.try_round() else {
                continue;
            };
            return Some((pool.clone(), round));
        }
        None
    }

    /// One full matching round for a pool.
    async fn run_round(&self, pool: &Arc<TicketPool>) {
        let capacity = self.config.matchmaker_pool_capacity;

        // Gather phase: hold the pool open so the Director routes more
        // tickets here, then let the raised flag propagate through one
        // status publication before matching.
        if pool.ticket_count() < capacity && !pool.has_failed_victims() {
            pool.set_gathering(true);
            tokio::time::sleep(self.config.min_gather_time()).await;
            pool.set_gathering(false);
            tokio::time::sleep(2 * self.config.matchmaker_delay()).await;
        }

        let snapshot = pool.take_snapshot(capacity);
        if snapshot.is_empty() {
            return;
        }

        // Expired tickets leave as unmatched before the round runs.
        let now = utc_now_micros();
        let tolerance = self.config.matchmaker_delay().as_micros() as i64;
        let mut live: Vec<Ticket> = Vec::with_capacity(snapshot.len());
        for ticket in snapshot {
            if ticket.is_expired_on_matchmaker(now, tolerance) {
                debug!(ticket = %ticket.global_id, pool = %pool.id, "ticket expired");
                self.push_consumed(ticket, false);
            } else {
                live.push(ticket);
            }
        }

        let mut match_size = pool.match_size();
        if let Some(plugin) = &pool.plugin {
            let wanted = plugin.match_size(live.len());
            if wanted >= MIN_MATCH_SIZE {
                match_size = wanted;
            }
        }

        let max_state = TicketView::max_state_size(&live);
        let slot_capacity = CANDIDATE_SLOTS_PER_PEER * (match_size - 1);
        let mut views: Vec<TicketView> = live
            .iter()
            .map(|t| TicketView::convert(t, max_state, slot_capacity))
            .collect();

        let unreliable_only = live.len() > MAX_FOR_RELIABLE;
        let outcome = match_function(
            &mut views,
            match_size,
            pool.plugin.as_deref(),
            unreliable_only,
        );
        pool.set_failed_victims(!outcome.matched_all_it_could);

        // Matches reach the stream before any participant enters
        // consumed_tickets; the Director validator depends on the order.
        let mut posted = true;
        if !outcome.matches.is_empty() {
            let payloads: Vec<Bytes> = outcome.matches.iter().map(|m| m.to_wire()).collect();
            for chunk in payloads.chunks(BATCH_LIMIT) {
                if let Err(error) = self.state.stream_add_batch(keys::MATCHES, chunk).await {
                    error!(%error, pool = %pool.id, "posting matches failed; round will retry");
                    posted = false;
                    break;
                }
            }
        }

        let matched: HashSet<GlobalId> = if posted {
            outcome
                .matches
                .iter()
                .flat_map(|m| m.ticket_ids.iter().copied())
                .collect()
        } else {
            HashSet::new()
        };

        if !matched.is_empty() {
            info!(
                pool = %pool.id,
                matches = outcome.matches.len(),
                tickets = matched.len(),
                "matches formed"
            );
        }

        for mut ticket in live {
            if matched.contains(&ticket.global_id) {
                self.push_consumed(ticket, true);
            } else {
                ticket.matching_failure_count += 1;
                if ticket.matching_failure_count > self.config.max_match_failures {
                    debug!(ticket = %ticket.global_id, "giving up after repeated failures");
                    self.push_consumed(ticket, false);
                } else {
                    pool.requeue_priority(ticket);
                }
            }
        }
    }

    fn push_consumed(&self, ticket: Ticket, for_match: bool) {
        self.consumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ConsumedTicket { ticket, for_match });
    }

    // ------------------------------------------------------------------
    // Cleaner
    // ------------------------------------------------------------------

    async fn cleaner_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(CLEANER_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.clean_consumed().await,
                _ = shutdown.recv() => break,
            }
        }
        debug!(id = %self.id, "cleaner stopped");
    }

    /// Move a batch of finished tickets out of the assigned stream into
    /// `consumed_tickets`. Delete-before-add: a re-added ticket must not
    /// race its own stale copy in the assigned stream.
    async fn clean_consumed(&self) {
        let batch: Vec<ConsumedTicket> = {
            let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
            let take = consumed.len().min(BATCH_LIMIT);
            consumed.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let stream = keys::assigned_stream(&self.id);
        let ids: Vec<StateId> = batch.iter().map(|c| c.ticket.state_id.clone()).collect();

        if let Err(error) = self.state.stream_delete_messages(&stream, &ids).await {
            warn!(%error, "assigned-stream delete failed; re-queueing batch");
            self.requeue_consumed(batch);
            return;
        }

        let payloads: Vec<Bytes> = batch.iter().map(|c| c.ticket.to_wire()).collect();
        if let Err(error) = self
            .state
            .stream_add_batch(keys::CONSUMED_TICKETS, &payloads)
            .await
        {
            warn!(%error, "consumed-stream add failed; re-queueing batch");
            self.requeue_consumed(batch);
            return;
        }

        for consumed in &batch {
            debug!(
                ticket = %consumed.ticket.global_id,
                for_match = consumed.for_match,
                "ticket consumed"
            );
        }

        // Let any in-flight fetcher read that still contains these entries
        // finish before the dedup guard disappears.
        tokio::time::sleep(std::time::Duration::from_millis(CLEANER_SETTLE_MS)).await;
        for consumed in &batch {
            self.assigned_tickets.remove(&consumed.ticket.global_id);
        }
    }

    fn requeue_consumed(&self, batch: Vec<ConsumedTicket>) {
        let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        for item in batch {
            consumed.push_front(item);
        }
    }
}
