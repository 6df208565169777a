//! Full-pipeline test: Director and Matchmaker with all loops running
//! against the in-memory backend, from submission to match delivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crymatch::config::ServiceConfig;
use crymatch::director::Director;
use crymatch::matchmaker::Matchmaker;
use crymatch::plugin::PluginRegistry;
use crymatch::protocol::{Affinity, Ticket, TicketMatch};
use crymatch::runtime::RuntimeHandles;
use crymatch::state::{keys, MemoryState, State};
use crymatch::types::PoolId;

fn fast_config() -> ServiceConfig {
    ServiceConfig {
        director_update_delay: 0.02,
        matchmaker_update_delay: 0.02,
        matchmaker_min_gather_time: 0.0,
        max_downtime_before_offline: 2.0,
        matchmaker_threads: 2,
        ..Default::default()
    }
}

fn player_ticket(rating: f32) -> Ticket {
    Ticket {
        affinities: vec![Affinity {
            value: rating,
            max_margin: 1000.0,
            prefer_disimilar: false,
            soft_margin: true,
            priority_factor: 1.0,
        }],
        ..Ticket::new(PoolId::default_pool())
    }
}

async fn wait_until<F, Fut>(deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if check().await {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submission_to_match_delivery() {
    let state = Arc::new(MemoryState::new());
    let config = fast_config();
    let runtimes = RuntimeHandles::from_current();

    let director = Director::start(state.clone(), config.clone(), &runtimes)
        .await
        .expect("fresh state must yield leadership");
    let matchmaker =
        Matchmaker::new(state.clone(), config, PluginRegistry::new()).unwrap();
    Arc::clone(&matchmaker).start(&runtimes);

    for rating in [1200.0, 1000.0, 1000.0, 1100.0] {
        assert!(director.submit_ticket(player_ticket(rating)).is_ok());
    }

    // Collect the two matches through the reader fan-out.
    let delivered: Arc<std::sync::Mutex<Vec<TicketMatch>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let reader = {
        let director = Arc::clone(&director);
        let delivered = Arc::clone(&delivered);
        let cancel = director.shutdown_signal();
        tokio::spawn(async move {
            director
                .read_incoming_matches(cancel, move |m| {
                    let delivered = Arc::clone(&delivered);
                    async move {
                        delivered.lock().unwrap().push(m);
                        Ok::<(), crymatch::error::Error>(())
                    }
                })
                .await
        })
    };

    wait_until(Duration::from_secs(10), || {
        let delivered = Arc::clone(&delivered);
        async move { delivered.lock().unwrap().len() == 2 }
    })
    .await;

    // Every submitted ticket ended up in exactly one delivered match, and
    // validation has already retired them from the live set.
    let matches = delivered.lock().unwrap().clone();
    let mut participants: Vec<_> = matches
        .iter()
        .flat_map(|m| m.ticket_ids.iter().copied())
        .collect();
    participants.sort_by_key(|id| id.to_string());
    participants.dedup();
    assert_eq!(participants.len(), 4);
    assert!(state
        .set_values(keys::TICKETS_SUBMITTED)
        .await
        .unwrap()
        .is_empty());

    // Consumed tickets eventually drain out of the matchmaker and the
    // consumed stream (cleaner plus discard timers).
    wait_until(Duration::from_secs(10), || {
        let state = state.clone();
        async move {
            state
                .stream_read(keys::CONSUMED_TICKETS, None)
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
    wait_until(Duration::from_secs(5), || {
        let matchmaker = Arc::clone(&matchmaker);
        async move { matchmaker.processing_tickets() == 0 }
    })
    .await;

    director.shutdown();
    matchmaker.shutdown();
    reader.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_pools_route_independently() {
    let state = Arc::new(MemoryState::new());
    let config = fast_config();
    let runtimes = RuntimeHandles::from_current();

    let director = Director::start(state.clone(), config.clone(), &runtimes)
        .await
        .unwrap();
    let matchmaker =
        Matchmaker::new(state.clone(), config, PluginRegistry::new()).unwrap();
    Arc::clone(&matchmaker).start(&runtimes);

    // Two default-pool tickets and one for a named pool.
    director.submit_ticket(Ticket::new(PoolId::default_pool()));
    director.submit_ticket(Ticket::new(PoolId::new("test_pool")));
    director.submit_ticket(Ticket::new(PoolId::default_pool()));

    // All three reach the matchmaker and the named pool shows up in its
    // published status.
    wait_until(Duration::from_secs(10), || {
        let matchmaker = Arc::clone(&matchmaker);
        async move { matchmaker.processing_tickets() == 3 }
    })
    .await;

    let status = matchmaker.current_status();
    assert_eq!(status.processing_tickets, 3);
    let pool_names: Vec<&str> = status.pools.iter().map(|p| p.name.as_str()).collect();
    assert!(pool_names.contains(&""));
    assert!(pool_names.contains(&"test_pool"));

    director.shutdown();
    matchmaker.shutdown();
}
