//! Crate-level errors and the client-facing status catalogue.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Control-plane layer (`crate::error`)
//!
//! - [`Error`]: failures the Director and Matchmaker loops act on
//! - [`TicketStatus`]: wire status codes for the external RPC surface
//!
//! ## State layer (`crate::state`)
//!
//! - [`StateError`](crate::state::StateError): backend failures (Redis or
//!   in-process), converted upward via `From`
//!
//! # Propagation policy
//!
//! Per-message parse failures are logged at `warn` level and the surrounding
//! loop continues; the malformed entry is dropped. Periodic operations catch
//! and log errors and rely on the next tick as the retry. Batched Director
//! moves that fail mid-flight are re-queued through the lost-ticket pathway
//! rather than retried inline.

use std::{io, result};

use num_derive::FromPrimitive;
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Control-plane errors.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An error in the network or filesystem.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// Could not parse a stream payload or status blob.
    #[error("parse error: {0}")]
    Parse(String),

    /// A state-store operation failed.
    #[error(transparent)]
    State(#[from] crate::state::StateError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A starting Director found another instance holding the leader lease
    /// after the grace wait. Fatal: the caller must not retry in a loop.
    #[error("another Director already holds the leader lease")]
    LeaderConflict,

    /// A pool plugin misbehaved. The offending call is treated as if no
    /// plugin were bound; the error exists for logging.
    #[error("plugin '{plugin}' failed: {reason}")]
    Plugin { plugin: String, reason: String },
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

/// Status codes returned to matchmaking clients.
///
/// The numeric values are part of the external RPC contract and must not be
/// reordered. `DuplicateId` and `MatchmakerBusy` are reserved: the current
/// Director never emits them (submission always accepts well-formed tickets)
/// but clients are expected to handle them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum TicketStatus {
    /// Catch-all for states the server could not classify.
    #[default]
    Unspecified = 0,
    /// The request was accepted.
    Ok = 1,
    /// The ticket or request was malformed (for removal: empty global id).
    BadRequest = 2,
    /// Reserved: a ticket with this global id is already live.
    DuplicateId = 3,
    /// The ticket was already past its max age on arrival.
    Expired = 4,
    /// Removal targeted a global id that is not live.
    NotFound = 5,
    /// A state-store operation failed while serving the request.
    InternalError = 6,
    /// An unexpected server-side failure.
    UnknownError = 7,
    /// Reserved: no matchmaker capacity is available for intake.
    MatchmakerBusy = 8,
}

impl TicketStatus {
    /// Whether the request succeeded.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, TicketStatus::Ok)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TicketStatus::Unspecified => "unspecified",
            TicketStatus::Ok => "ok",
            TicketStatus::BadRequest => "bad_request",
            TicketStatus::DuplicateId => "duplicate_id",
            TicketStatus::Expired => "expired",
            TicketStatus::NotFound => "not_found",
            TicketStatus::InternalError => "internal_error",
            TicketStatus::UnknownError => "unknown_error",
            TicketStatus::MatchmakerBusy => "matchmaker_busy",
        };
        write!(f, "{name}")
    }
}
