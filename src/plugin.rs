//! Per-pool matching plugins.
//!
//! A plugin lets game-specific code override two decisions the generic
//! matcher otherwise makes on its own: the target match size for a round,
//! and which candidates end up in a match. Plugins are registered once on
//! the matchmaker and bound to pools on first sighting.
//!
//! # Binding rules
//!
//! Exactly one plugin is bound to a pool, decided the first time the pool is
//! seen: the first registered plugin whose declared pool equals the pool id
//! wins; otherwise the first catch-all (empty declared pool); otherwise the
//! pool runs without a plugin.
//!
//! # Failure policy
//!
//! A plugin that misbehaves (returns `false` from
//! [`pick_match_candidates`](PoolPlugin::pick_match_candidates)) is logged
//! and the call proceeds as if no plugin were bound. Invalid *picks* — a
//! duplicate index, index zero, out of range, or an already-consumed
//! candidate — invalidate the whole match instead; see
//! [`crate::matching`].

use std::sync::Arc;

use crate::types::{GlobalId, PoolId};

/// Read-only view of one match candidate handed to a plugin.
///
/// Index 0 of the snapshot array is always the owning ticket; its rating is
/// zero by definition. The plugin never owns the underlying buffers.
#[derive(Debug, Clone, Copy)]
pub struct CandidateSnapshot<'a> {
    pub global_id: GlobalId,
    /// The candidate's padded state matrix.
    pub state: &'a [Vec<f32>],
    /// Rating the candidate search assigned, relative to the owner.
    pub rating: f32,
}

/// Game-specific hooks for one matchmaking pool.
pub trait PoolPlugin: Send + Sync {
    /// Plugin name, for logs and registry lookups.
    fn name(&self) -> &str;

    /// The pool this plugin handles. Empty string is a catch-all.
    fn handled_ticket_pool(&self) -> &str;

    /// Desired match size given the number of gathered tickets.
    ///
    /// Results below the minimum match size are ignored and the pool's
    /// configured size is used instead.
    fn match_size(&self, ticket_count: usize) -> usize;

    /// Whether this plugin wants to pick match candidates itself.
    fn override_candidate_picking(&self) -> bool {
        false
    }

    /// Choose the candidates for one match.
    ///
    /// `candidates[0]` is the owning ticket and must not be picked.
    /// `picked` arrives pre-filled with the best-rated candidates and may be
    /// left untouched. Returns `false` to signal plugin failure, in which
    /// case the default picks are used.
    fn pick_match_candidates(
        &self,
        candidates: &[CandidateSnapshot<'_>],
        picked: &mut Vec<usize>,
    ) -> bool {
        let _ = (candidates, picked);
        true
    }
}

/// Registered plugins, in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn PoolPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Registration order decides binding precedence.
    pub fn register(&mut self, plugin: Arc<dyn PoolPlugin>) {
        self.plugins.push(plugin);
    }

    /// Resolve the plugin for a pool: first exact pool match, then first
    /// catch-all.
    pub fn bind_for_pool(&self, pool: &PoolId) -> Option<Arc<dyn PoolPlugin>> {
        self.plugins
            .iter()
            .find(|p| p.handled_ticket_pool() == pool.as_str())
            .or_else(|| {
                self.plugins
                    .iter()
                    .find(|p| p.handled_ticket_pool().is_empty())
            })
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSize {
        name: &'static str,
        pool: &'static str,
        size: usize,
    }

    impl PoolPlugin for FixedSize {
        fn name(&self) -> &str {
            self.name
        }
        fn handled_ticket_pool(&self) -> &str {
            self.pool
        }
        fn match_size(&self, _ticket_count: usize) -> usize {
            self.size
        }
    }

    #[test]
    fn test_exact_pool_binding_wins() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(FixedSize {
            name: "catchall",
            pool: "",
            size: 2,
        }));
        registry.register(Arc::new(FixedSize {
            name: "ranked",
            pool: "ranked",
            size: 4,
        }));

        let bound = registry.bind_for_pool(&PoolId::new("ranked")).unwrap();
        assert_eq!(bound.name(), "ranked");
    }

    #[test]
    fn test_catch_all_binding() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(FixedSize {
            name: "catchall",
            pool: "",
            size: 2,
        }));

        let bound = registry.bind_for_pool(&PoolId::new("unknown")).unwrap();
        assert_eq!(bound.name(), "catchall");
    }

    #[test]
    fn test_no_binding_without_match() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(FixedSize {
            name: "ranked",
            pool: "ranked",
            size: 4,
        }));

        assert!(registry.bind_for_pool(&PoolId::new("casual")).is_none());
        assert!(registry.bind_for_pool(&PoolId::default_pool()).is_none());
    }

    #[test]
    fn test_first_registered_wins_among_equals() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(FixedSize {
            name: "first",
            pool: "p",
            size: 2,
        }));
        registry.register(Arc::new(FixedSize {
            name: "second",
            pool: "p",
            size: 3,
        }));

        let bound = registry.bind_for_pool(&PoolId::new("p")).unwrap();
        assert_eq!(bound.name(), "first");
    }

    #[test]
    fn test_default_pick_hook_is_a_noop() {
        let plugin = FixedSize {
            name: "n",
            pool: "",
            size: 2,
        };
        assert!(!plugin.override_candidate_picking());
        let mut picked = vec![1, 2];
        assert!(plugin.pick_match_candidates(&[], &mut picked));
        assert_eq!(picked, vec![1, 2]);
    }
}
