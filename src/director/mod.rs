//! The Director role.
//!
//! A singleton leader that owns every cross-matchmaker decision: it ingests
//! submitted tickets, routes them to matchmakers, validates completed
//! matches, fans them out to readers, and reconciles consumed tickets.
//! Leadership is a TTL lease (`director_is_active`), refreshed every tick
//! and checked twice at startup — a starting Director that still sees the
//! lease after waiting one full downtime window refuses to start with
//! [`Error::LeaderConflict`] instead of retrying.
//!
//! # Loop structure
//!
//! - **Pinger**: refreshes the leader lease.
//! - **Submitter** (100 ms): flushes the pending submit queue into
//!   `tickets_unassigned` and `tickets_submitted` in batches, re-arming
//!   itself while a full batch remains.
//! - **Main loop** (every `DirectorUpdateDelay`): runs
//!   `process_matchmakers`, `process_matches`, `clean_consumed_tickets`
//!   and (every fifth tick) `process_lost_tickets` in parallel and joins
//!   them before the next tick. Loop durations feed a small ring buffer;
//!   spare headroom becomes *emergency loops* that let the assigner drain
//!   submission bursts within the same tick.
//!
//! The split across submodules mirrors the work: [`assign`] routes
//! tickets, [`matches`] validates and delivers, [`cleanup`] reconciles the
//! consumed stream and recovers lost moves.

mod assign;
mod cleanup;
mod matches;

pub use assign::OnlineMatchmaker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::constants::{
    BATCH_LIMIT, LOOP_TIME_SAMPLES, LOOP_TIME_WARN_FRACTION, LOST_TICKET_EVERY_N_TICKS,
    MIN_MATCH_SIZE, SUBMIT_FLUSH_INTERVAL_MS,
};
use crate::encode::ToWire;
use crate::error::{Error, Result, TicketStatus};
use crate::protocol::{utc_now_micros, Ticket, TicketMatch};
use crate::runtime::RuntimeHandles;
use crate::state::{keys, State};
use crate::types::{GlobalId, MatchmakerId, PoolId, StateId};

/// A consumed-stream entry whose discard timer has fired.
pub(crate) struct DiscardedTicket {
    pub global_id: GlobalId,
    pub state_id: StateId,
}

/// Scheduled-discard bookkeeping for one consumed-stream entry.
pub(crate) struct DiscardState {
    pub global_id: GlobalId,
    /// Flipped by the timer; once set, a re-add cancellation is too late.
    pub discarded: bool,
}

/// The capacity of the internal match channel. Bounded so a stalled reader
/// back-pressures `process_matches` instead of growing without limit;
/// dropping matches is not an option, they would orphan their tickets in
/// `tickets_submitted`.
const MATCH_CHANNEL_CAPACITY: usize = 4 * BATCH_LIMIT;

/// The singleton Director.
pub struct Director {
    state: Arc<dyn State>,
    config: ServiceConfig,

    /// Tickets accepted by `submit_ticket`, awaiting the flush timer.
    pending_submit: Mutex<VecDeque<Ticket>>,

    /// Status cache of live matchmakers, refreshed each tick.
    pub(crate) online_matchmakers: DashMap<MatchmakerId, OnlineMatchmaker>,

    /// Active `read_incoming_matches` loops.
    readers: AtomicUsize,
    /// Dedup of match stream entries across re-reads.
    pub(crate) received_match_state_ids: DashSet<StateId>,
    match_tx: mpsc::Sender<TicketMatch>,
    match_rx: tokio::sync::Mutex<mpsc::Receiver<TicketMatch>>,
    /// Matches delivered to a reader, to delete from the stream next tick.
    pub(crate) matches_to_delete: Mutex<Vec<StateId>>,

    /// Valid participants of invalid matches, waiting for their ticket to
    /// surface in the consumed stream.
    pub(crate) tickets_to_readd: DashSet<GlobalId>,
    /// Shared with the spawned discard timers.
    pub(crate) discard_scheduled: Arc<DashMap<StateId, DiscardState>>,
    pub(crate) discarded: Arc<Mutex<Vec<DiscardedTicket>>>,

    /// Failed grouped moves, retried by the periodic lost-ticket pass.
    pub(crate) lost_tickets: Mutex<Vec<(String, Vec<Bytes>)>>,

    loop_times: Mutex<VecDeque<Duration>>,
    emergency_loops: AtomicU32,
    tick_count: AtomicU64,

    shutdown: broadcast::Sender<()>,
}

impl Director {
    /// Build a Director without touching the state store. Use
    /// [`acquire_leadership`](Self::acquire_leadership) and
    /// [`start_loops`](Self::start_loops), or [`start`](Self::start) for
    /// both.
    pub fn new(state: Arc<dyn State>, config: ServiceConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (shutdown, _) = broadcast::channel(1);
        let (match_tx, match_rx) = mpsc::channel(MATCH_CHANNEL_CAPACITY);
        Ok(Arc::new(Director {
            state,
            config,
            pending_submit: Mutex::new(VecDeque::new()),
            online_matchmakers: DashMap::new(),
            readers: AtomicUsize::new(0),
            received_match_state_ids: DashSet::new(),
            match_tx,
            match_rx: tokio::sync::Mutex::new(match_rx),
            matches_to_delete: Mutex::new(Vec::new()),
            tickets_to_readd: DashSet::new(),
            discard_scheduled: Arc::new(DashMap::new()),
            discarded: Arc::new(Mutex::new(Vec::new())),
            lost_tickets: Mutex::new(Vec::new()),
            loop_times: Mutex::new(VecDeque::with_capacity(LOOP_TIME_SAMPLES)),
            emergency_loops: AtomicU32::new(0),
            tick_count: AtomicU64::new(0),
            shutdown,
        }))
    }

    /// Acquire leadership, start all loops.
    pub async fn start(
        state: Arc<dyn State>,
        config: ServiceConfig,
        runtimes: &RuntimeHandles,
    ) -> Result<Arc<Self>> {
        let director = Self::new(state, config)?;
        director.acquire_leadership().await?;
        Arc::clone(&director).start_loops(runtimes);
        Ok(director)
    }

    /// The two-check leader acquisition.
    ///
    /// An existing lease gets one full downtime window to expire; if it is
    /// still there afterwards another Director is alive and this one must
    /// not start. Deliberately a single procedure with an explicit error,
    /// not a retry loop.
    pub async fn acquire_leadership(&self) -> Result<()> {
        if self
            .state
            .get_string(keys::DIRECTOR_IS_ACTIVE)
            .await?
            .is_some()
        {
            warn!(
                "leader lease present; waiting {:?} for it to expire",
                self.config.max_downtime()
            );
            tokio::time::sleep(self.config.max_downtime()).await;
            if self
                .state
                .get_string(keys::DIRECTOR_IS_ACTIVE)
                .await?
                .is_some()
            {
                return Err(Error::LeaderConflict);
            }
        }

        self.refresh_lease().await?;
        info!("leader lease acquired");
        Ok(())
    }

    /// Spawn the pinger, submitter and main loop on the control plane.
    pub fn start_loops(self: Arc<Self>, runtimes: &RuntimeHandles) {
        runtimes.control.spawn(Arc::clone(&self).pinger_loop());
        runtimes.control.spawn(Arc::clone(&self).submit_loop());
        runtimes.control.spawn(Arc::clone(&self).main_loop());
    }

    /// Stop all loops. In-flight state operations complete on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// A receiver readers can pass as their cancel signal.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub(crate) fn state(&self) -> &Arc<dyn State> {
        &self.state
    }

    pub(crate) fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Public service API (called by the RPC layer)
    // ------------------------------------------------------------------

    /// Accept a ticket for matchmaking.
    ///
    /// The ticket is queued and written out by the flush timer; acceptance
    /// does not wait for the state store. Tickets without a global id get
    /// one assigned; client-supplied ids are kept so the client can cancel
    /// later.
    pub fn submit_ticket(&self, mut ticket: Ticket) -> TicketStatus {
        if let Err(reason) = ticket.validate() {
            warn!(reason = %reason, "rejecting malformed ticket");
            return TicketStatus::BadRequest;
        }

        let now = utc_now_micros();
        if ticket.global_id.is_nil() {
            ticket.global_id = GlobalId::random();
        }
        if ticket.timestamp == 0 {
            ticket.timestamp = now;
        }
        if ticket.is_past_max_age(now) {
            return TicketStatus::Expired;
        }

        self.pending_submit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ticket);
        TicketStatus::Ok
    }

    /// Cancel a live ticket by global id.
    pub async fn remove_ticket(&self, global_id: GlobalId) -> TicketStatus {
        if global_id.is_nil() {
            return TicketStatus::BadRequest;
        }
        match self
            .state
            .set_remove(keys::TICKETS_SUBMITTED, &global_id.to_string())
            .await
        {
            Ok(true) => TicketStatus::Ok,
            Ok(false) => TicketStatus::NotFound,
            Err(error) => {
                warn!(%error, "ticket removal failed");
                TicketStatus::InternalError
            }
        }
    }

    /// The configured match size of a pool (default when unset).
    pub async fn get_pool_configuration(&self, pool: &PoolId) -> Result<usize> {
        match self.state.get_string(&keys::pool_match_size(pool)).await? {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|e| Error::Parse(format!("bad pool match size '{raw}': {e}"))),
            None => Ok(MIN_MATCH_SIZE),
        }
    }

    /// Configure a pool's match size.
    pub async fn set_pool_configuration(&self, pool: &PoolId, match_size: usize) -> TicketStatus {
        if match_size < MIN_MATCH_SIZE {
            return TicketStatus::BadRequest;
        }
        match self
            .state
            .set_string(
                &keys::pool_match_size(pool),
                Some(&match_size.to_string()),
                None,
            )
            .await
        {
            Ok(()) => TicketStatus::Ok,
            Err(error) => {
                warn!(%error, pool = %pool, "pool configuration write failed");
                TicketStatus::InternalError
            }
        }
    }

    // ------------------------------------------------------------------
    // Pinger
    // ------------------------------------------------------------------

    async fn refresh_lease(&self) -> Result<()> {
        self.state
            .set_string(
                keys::DIRECTOR_IS_ACTIVE,
                Some(keys::DIRECTOR_ACTIVE_VALUE),
                Some(self.config.max_downtime()),
            )
            .await?;
        Ok(())
    }

    async fn pinger_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.director_delay());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.refresh_lease().await {
                        warn!(%error, "leader lease refresh failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("director pinger stopped");
    }

    // ------------------------------------------------------------------
    // Submitter
    // ------------------------------------------------------------------

    async fn submit_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(SUBMIT_FLUSH_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_submissions().await,
                _ = shutdown.recv() => break,
            }
        }
        debug!("director submitter stopped");
    }

    /// Flush the pending queue in batches, re-arming while full batches
    /// remain so a submission burst drains without waiting for the timer.
    ///
    /// Driven by the submit timer; public so embedders and tests can force
    /// a flush without waiting 100 ms.
    pub async fn flush_submissions(&self) {
        loop {
            let batch: Vec<Ticket> = {
                let mut pending = self
                    .pending_submit
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let take = pending.len().min(BATCH_LIMIT);
                pending.drain(..take).collect()
            };
            if batch.is_empty() {
                return;
            }

            // Stream first, then the live set: a ticket that makes it into
            // the stream but not the set is dropped at assignment as
            // cancelled, the reverse would leak a set entry nothing owns.
            let payloads: Vec<Bytes> = batch.iter().map(ToWire::to_wire).collect();
            match self
                .state
                .stream_add_batch(keys::TICKETS_UNASSIGNED, &payloads)
                .await
            {
                Ok(results) => {
                    for (ticket, result) in batch.iter().zip(&results) {
                        if result.is_none() {
                            warn!(ticket = %ticket.global_id, "submission write rejected");
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, count = batch.len(), "submission batch write failed");
                    continue;
                }
            }

            let ids: Vec<String> = batch.iter().map(|t| t.global_id.to_string()).collect();
            if let Err(error) = self
                .state
                .set_add_batch(keys::TICKETS_SUBMITTED, &ids)
                .await
            {
                warn!(%error, "submitted-set add failed");
            }

            if batch.len() < BATCH_LIMIT {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    async fn main_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.director_delay());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.recv() => break,
            }
        }
        debug!("director main loop stopped");
    }

    /// One main-loop iteration: up to four tasks in parallel, joined
    /// before the tick ends.
    ///
    /// Driven by [`start_loops`](Self::start_loops); public so embedders
    /// and tests can step the Director deterministically.
    pub async fn tick(&self) {
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let with_lost_tickets = tick % LOST_TICKET_EVERY_N_TICKS == 0;

        tokio::join!(
            self.process_matchmakers(),
            self.process_matches(),
            self.clean_consumed_tickets(),
            async {
                if with_lost_tickets {
                    self.process_lost_tickets().await;
                }
            },
        );

        self.record_loop_time(started.elapsed());
    }

    /// Feed the loop-duration ring buffer and derive the emergency-loop
    /// budget for the next tick's assigner.
    fn record_loop_time(&self, elapsed: Duration) {
        let delay = self.config.director_delay();

        let mut times = self
            .loop_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        times.push_back(elapsed);
        if times.len() > LOOP_TIME_SAMPLES {
            times.pop_front();
        }

        if elapsed.as_secs_f64() > delay.as_secs_f64() * LOOP_TIME_WARN_FRACTION {
            warn!(
                ?elapsed,
                ?delay,
                "director loop is running hot; emergency loops disabled"
            );
            self.emergency_loops.store(0, Ordering::Relaxed);
            return;
        }

        let max_recent = times.iter().max().copied().unwrap_or(elapsed);
        let avg_recent = times.iter().sum::<Duration>() / times.len() as u32;
        let budget = if avg_recent.is_zero() {
            1
        } else {
            let headroom = delay.saturating_sub(max_recent).as_secs_f64();
            (headroom / avg_recent.as_secs_f64()).max(1.0) as u32
        };
        self.emergency_loops.store(budget, Ordering::Relaxed);
    }

    /// Extra assignment passes available within the current tick.
    pub(crate) fn emergency_loop_budget(&self) -> u32 {
        self.emergency_loops.load(Ordering::Relaxed)
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    pub(crate) fn reader_started(&self) {
        self.readers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reader_stopped(&self) {
        self.readers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn match_sender(&self) -> &mpsc::Sender<TicketMatch> {
        &self.match_tx
    }

    pub(crate) fn match_receiver(&self) -> &tokio::sync::Mutex<mpsc::Receiver<TicketMatch>> {
        &self.match_rx
    }
}
