//! Well-known keys of the shared state keyspace.
//!
//! Every key the Director and Matchmakers touch is named here, so the whole
//! wire contract between the roles is visible in one place.
//!
//! | Key | Type | Contents |
//! |---|---|---|
//! | `matches` | stream | serialized [`TicketMatch`](crate::protocol::TicketMatch) |
//! | `tickets_unassigned` | stream | serialized tickets awaiting assignment |
//! | `tickets_<mm_id>` | stream | tickets assigned to one matchmaker |
//! | `consumed_tickets` | stream | tickets matchmakers finished with |
//! | `matchmakers` | set | active matchmaker ids |
//! | `tickets_submitted` | set | global ids currently live in the system |
//! | `director_is_active` | string+TTL | the leader lease |
//! | `<mm_id>` | string+TTL | one matchmaker's status blob |
//! | `pool_match_size_<pool>` | string | optional per-pool match size |

use crate::types::{MatchmakerId, PoolId};

/// Stream of completed matches awaiting reader delivery.
pub const MATCHES: &str = "matches";

/// Stream of submitted tickets the Director has not yet assigned.
pub const TICKETS_UNASSIGNED: &str = "tickets_unassigned";

/// Stream where matchmakers park finished tickets for the Director.
pub const CONSUMED_TICKETS: &str = "consumed_tickets";

/// Set of registered matchmaker ids.
pub const MATCHMAKERS: &str = "matchmakers";

/// Set of ticket global ids that are live in the system.
pub const TICKETS_SUBMITTED: &str = "tickets_submitted";

/// The Director leader lease. Present iff a Director is active.
pub const DIRECTOR_IS_ACTIVE: &str = "director_is_active";

/// Value stored under the leader lease.
pub const DIRECTOR_ACTIVE_VALUE: &str = "Active";

/// The per-matchmaker assigned-ticket stream, owned by the Director for
/// writes and consumed by that matchmaker.
pub fn assigned_stream(matchmaker: &MatchmakerId) -> String {
    format!("tickets_{}", matchmaker.as_str())
}

/// The per-matchmaker status key (the id itself).
pub fn status_key(matchmaker: &MatchmakerId) -> &str {
    matchmaker.as_str()
}

/// The optional per-pool match-size configuration key.
pub fn pool_match_size(pool: &PoolId) -> String {
    format!("pool_match_size_{}", pool.as_str())
}
