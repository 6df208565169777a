//! Type-safe wrappers for matchmaking identifiers.
//!
//! These newtypes prevent mixing up the different id spaces that share the
//! same underlying representation: ticket ids, stream-entry ids, matchmaker
//! ids, and pool names all travel as strings on the wire but mean very
//! different things.

use std::fmt;

use uuid::Uuid;

/// The permanent identity of a ticket or match.
///
/// Assigned once (by the Director at submit for tickets, by the matchmaker at
/// formation for matches) and never changed afterwards, no matter how many
/// streams the record moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GlobalId(pub Uuid);

impl GlobalId {
    /// Generate a fresh random id.
    #[inline]
    pub fn random() -> Self {
        GlobalId(Uuid::new_v4())
    }

    /// The all-zero id, used for "not yet assigned".
    pub const NIL: Self = GlobalId(Uuid::nil());

    /// Whether this id has been assigned.
    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parse from the canonical hyphenated text form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(GlobalId)
    }
}

impl From<Uuid> for GlobalId {
    fn from(value: Uuid) -> Self {
        GlobalId(value)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The position identity of a record within a stream.
///
/// Assigned by the state store every time the record is written to a stream,
/// so it changes on every move. Used to delete exactly the entry that was
/// read, and to deduplicate re-reads of the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StateId(pub String);

impl StateId {
    /// Create from a raw backend id.
    #[inline]
    pub fn new(value: impl Into<String>) -> Self {
        StateId(value.into())
    }

    /// Whether the record has ever been written to a stream.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw backend id.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StateId {
    fn from(value: String) -> Self {
        StateId(value)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A matchmaker instance identity, `mm_<uuid>`.
///
/// Doubles as the key under which the instance publishes its status string;
/// the per-instance assigned stream is derived from it (see
/// [`crate::state::keys::assigned_stream`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchmakerId(String);

impl MatchmakerId {
    /// Generate a fresh instance id.
    pub fn random() -> Self {
        MatchmakerId(format!("mm_{}", Uuid::new_v4()))
    }

    /// Wrap an id read back from the state store.
    ///
    /// Returns `None` when the value does not carry the `mm_` prefix, which
    /// means the `matchmakers` set was polluted by something else.
    pub fn parse(s: &str) -> Option<Self> {
        if s.starts_with("mm_") {
            Some(MatchmakerId(s.to_string()))
        } else {
            None
        }
    }

    /// The full id, as stored in the `matchmakers` set.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchmakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A matchmaking pool name. The empty string is the default pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PoolId(pub String);

impl PoolId {
    /// The default (unnamed) pool.
    pub fn default_pool() -> Self {
        PoolId(String::new())
    }

    /// Create a named pool id.
    #[inline]
    pub fn new(value: impl Into<String>) -> Self {
        PoolId(value.into())
    }

    /// Whether this is the default pool.
    #[inline]
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw pool name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PoolId {
    fn from(value: String) -> Self {
        PoolId(value)
    }
}

impl From<&str> for PoolId {
    fn from(value: &str) -> Self {
        PoolId(value.to_string())
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<default>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_id_random_is_unique() {
        assert_ne!(GlobalId::random(), GlobalId::random());
    }

    #[test]
    fn test_global_id_nil() {
        assert!(GlobalId::NIL.is_nil());
        assert!(!GlobalId::random().is_nil());
        assert_eq!(GlobalId::default(), GlobalId::NIL);
    }

    #[test]
    fn test_global_id_parse_roundtrip() {
        let id = GlobalId::random();
        assert_eq!(GlobalId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn test_global_id_parse_invalid() {
        assert_eq!(GlobalId::parse("not-a-uuid"), None);
        assert_eq!(GlobalId::parse(""), None);
    }

    #[test]
    fn test_state_id_empty_default() {
        assert!(StateId::default().is_empty());
        assert!(!StateId::new("1700000000000-0").is_empty());
    }

    #[test]
    fn test_matchmaker_id_prefix() {
        let id = MatchmakerId::random();
        assert!(id.as_str().starts_with("mm_"));
        assert_eq!(MatchmakerId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn test_matchmaker_id_rejects_foreign_values() {
        assert_eq!(MatchmakerId::parse("director_is_active"), None);
        assert_eq!(MatchmakerId::parse(""), None);
    }

    #[test]
    fn test_pool_id_default_display() {
        assert_eq!(PoolId::default_pool().to_string(), "<default>");
        assert_eq!(PoolId::new("ranked_2v2").to_string(), "ranked_2v2");
        assert!(PoolId::default_pool().is_default());
        assert!(!PoolId::new("x").is_default());
    }

    #[test]
    fn test_pool_id_hash_by_name() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(PoolId::new("a"));
        set.insert(PoolId::new("a"));
        set.insert(PoolId::default_pool());
        assert_eq!(set.len(), 2);
    }
}
