//! # CryMatch
//! Rust-native game matchmaking control plane.
//!
//! CryMatch ingests player tickets, groups them into matches that satisfy
//! declarative requirements and affinity preferences, and streams completed
//! matches back to consumers. This is pure Rust all the way down; meaning
//! memory safety, safe concurrency, low resource usage, and speed.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/), [Nom](https://docs.rs/nom/latest/nom/)
//! - Horizontal matchmaker scaling over a shared Redis state
//! - Be a building block for game backends, not a framework
//!
//! # Architecture
//!
//! Two roles cooperate through a typed shared [`state`]:
//!
//! - A singleton [`Director`](director::Director) accepts tickets, assigns
//!   them to matchmakers, validates completed matches and fans them out to
//!   readers. Leadership is a TTL lease, not a consensus protocol.
//! - One or more [`Matchmaker`](matchmaker::Matchmaker)s gather assigned
//!   tickets per pool and run the [`matching`] algorithm.
//!
//! In Standalone mode both roles share one process and the in-memory
//! backend; distributed deployments put Redis in between.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use crymatch::config::ServiceConfig;
//! use crymatch::director::Director;
//! use crymatch::matchmaker::Matchmaker;
//! use crymatch::plugin::PluginRegistry;
//! use crymatch::runtime::RuntimeHandles;
//! use crymatch::state::MemoryState;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::default();
//!     let state = Arc::new(MemoryState::new());
//!     let runtimes = RuntimeHandles::from_current();
//!
//!     let director = Director::start(state.clone(), config.clone(), &runtimes).await?;
//!     let matchmaker = Matchmaker::new(state, config, PluginRegistry::new())?;
//!     matchmaker.start(&runtimes);
//!
//!     // Submit tickets through director.submit_ticket(...) and consume
//!     // matches through director.read_incoming_matches(...).
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

mod encode;
mod parser;

pub mod config;
pub mod constants;
pub mod director;
pub mod error;
pub mod matching;
pub mod matchmaker;
pub mod plugin;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod types;

pub use encode::ToWire;

pub mod prelude {
    //! Main exports for building a matchmaking service.
    pub use crate::config::{Mode, ServiceConfig};
    pub use crate::director::Director;
    pub use crate::error::{Error, Result, TicketStatus};
    pub use crate::matchmaker::{Matchmaker, MatchmakerStatus};
    pub use crate::plugin::{CandidateSnapshot, PluginRegistry, PoolPlugin};
    pub use crate::protocol::{Affinity, Requirement, RequirementGroup, Ticket, TicketMatch};
    pub use crate::runtime::{RuntimeHandles, ServiceRuntimes};
    pub use crate::state::{MemoryState, RedisState, State};
    pub use crate::types::{GlobalId, MatchmakerId, PoolId, StateId};

    pub use bytes;
}
