//! In-process state backend.
//!
//! A single concurrent map of tagged entries. Used by Standalone mode, where
//! the Director and Matchmaker share one process, and by tests. String TTLs
//! are enforced by a spawned timer per write; a generation counter makes
//! sure a stale timer never removes a newer value written under the same
//! key.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use super::{KeyKind, State, StateError, StateResult, StreamEntry};
use crate::types::StateId;

/// In-process [`State`] implementation.
///
/// Cheap to clone; all clones share the same keyspace.
#[derive(Clone, Default)]
pub struct MemoryState {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, Entry>,
    /// Monotonic write counter for TTL-timer invalidation.
    generation: AtomicU64,
}

enum Entry {
    Str { value: String, generation: u64 },
    Stream(Vec<(StateId, Bytes)>),
    Set(HashSet<String>),
}

impl Entry {
    fn kind(&self) -> KeyKind {
        match self {
            Entry::Str { .. } => KeyKind::String,
            Entry::Stream(_) => KeyKind::Stream,
            Entry::Set(_) => KeyKind::Set,
        }
    }
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrong_type(key: &str, expected: KeyKind, actual: KeyKind) -> StateError {
        StateError::WrongType {
            key: key.to_string(),
            expected,
            actual,
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl State for MemoryState {
    async fn get_string(&self, key: &str) -> StateResult<Option<String>> {
        match self.inner.entries.get(key) {
            None => Ok(None),
            Some(entry) => match entry.value() {
                Entry::Str { value, .. } => Ok(Some(value.clone())),
                other => Err(Self::wrong_type(key, KeyKind::String, other.kind())),
            },
        }
    }

    async fn set_string(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> StateResult<()> {
        let Some(value) = value else {
            self.inner.entries.remove(key);
            return Ok(());
        };

        let generation = self.next_generation();
        match self.inner.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !matches!(occupied.get(), Entry::Str { .. }) {
                    return Err(Self::wrong_type(key, KeyKind::String, occupied.get().kind()));
                }
                occupied.insert(Entry::Str {
                    value: value.to_string(),
                    generation,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry::Str {
                    value: value.to_string(),
                    generation,
                });
            }
        }

        if let Some(ttl) = ttl {
            let inner = Arc::clone(&self.inner);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                // Only expire the exact write this timer was armed for.
                inner.entries.remove_if(&key, |_, entry| {
                    matches!(entry, Entry::Str { generation: g, .. } if *g == generation)
                });
            });
        }

        Ok(())
    }

    async fn stream_add(&self, key: &str, data: Bytes) -> StateResult<StateId> {
        let id = StateId::new(Uuid::new_v4().to_string());
        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Stream(Vec::new()));
        match entry.value_mut() {
            Entry::Stream(items) => {
                items.push((id.clone(), data));
                Ok(id)
            }
            other => Err(Self::wrong_type(key, KeyKind::Stream, other.kind())),
        }
    }

    async fn stream_add_batch(
        &self,
        key: &str,
        entries: &[Bytes],
    ) -> StateResult<Vec<Option<StateId>>> {
        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Stream(Vec::new()));
        match entry.value_mut() {
            Entry::Stream(items) => {
                let mut ids = Vec::with_capacity(entries.len());
                for data in entries {
                    let id = StateId::new(Uuid::new_v4().to_string());
                    items.push((id.clone(), data.clone()));
                    ids.push(Some(id));
                }
                Ok(ids)
            }
            other => Err(Self::wrong_type(key, KeyKind::Stream, other.kind())),
        }
    }

    async fn stream_read(
        &self,
        key: &str,
        max_count: Option<usize>,
    ) -> StateResult<Vec<StreamEntry>> {
        match self.inner.entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match entry.value() {
                Entry::Stream(items) => {
                    let take = max_count.unwrap_or(items.len()).min(items.len());
                    Ok(items[..take]
                        .iter()
                        .map(|(id, data)| StreamEntry {
                            id: id.clone(),
                            data: data.clone(),
                        })
                        .collect())
                }
                other => Err(Self::wrong_type(key, KeyKind::Stream, other.kind())),
            },
        }
    }

    async fn stream_delete(&self, key: &str) -> StateResult<()> {
        self.inner.entries.remove(key);
        Ok(())
    }

    async fn stream_delete_messages(&self, key: &str, ids: &[StateId]) -> StateResult<usize> {
        let Some(mut entry) = self.inner.entries.get_mut(key) else {
            return Ok(0);
        };
        match entry.value_mut() {
            Entry::Stream(items) => {
                let before = items.len();
                let targets: HashSet<&StateId> = ids.iter().collect();
                items.retain(|(id, _)| !targets.contains(id));
                Ok(before - items.len())
            }
            other => Err(Self::wrong_type(key, KeyKind::Stream, other.kind())),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> StateResult<bool> {
        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(HashSet::new()));
        match entry.value_mut() {
            Entry::Set(members) => Ok(members.insert(member.to_string())),
            other => Err(Self::wrong_type(key, KeyKind::Set, other.kind())),
        }
    }

    async fn set_add_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>> {
        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(HashSet::new()));
        match entry.value_mut() {
            Entry::Set(set) => Ok(members.iter().map(|m| set.insert(m.clone())).collect()),
            other => Err(Self::wrong_type(key, KeyKind::Set, other.kind())),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> StateResult<bool> {
        let (removed, now_empty) = {
            let Some(mut entry) = self.inner.entries.get_mut(key) else {
                return Ok(false);
            };
            match entry.value_mut() {
                Entry::Set(members) => {
                    let removed = members.remove(member);
                    (removed, members.is_empty())
                }
                other => return Err(Self::wrong_type(key, KeyKind::Set, other.kind())),
            }
        };
        // An empty set does not exist; drop the key.
        if now_empty {
            self.inner
                .entries
                .remove_if(key, |_, e| matches!(e, Entry::Set(s) if s.is_empty()));
        }
        Ok(removed)
    }

    async fn set_remove_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>> {
        let (results, now_empty) = {
            let Some(mut entry) = self.inner.entries.get_mut(key) else {
                return Ok(vec![false; members.len()]);
            };
            match entry.value_mut() {
                Entry::Set(set) => {
                    let results: Vec<bool> = members.iter().map(|m| set.remove(m)).collect();
                    let empty = set.is_empty();
                    (results, empty)
                }
                other => return Err(Self::wrong_type(key, KeyKind::Set, other.kind())),
            }
        };
        if now_empty {
            self.inner
                .entries
                .remove_if(key, |_, e| matches!(e, Entry::Set(s) if s.is_empty()));
        }
        Ok(results)
    }

    async fn set_contains(&self, key: &str, member: &str) -> StateResult<bool> {
        match self.inner.entries.get(key) {
            None => Ok(false),
            Some(entry) => match entry.value() {
                Entry::Set(members) => Ok(members.contains(member)),
                other => Err(Self::wrong_type(key, KeyKind::Set, other.kind())),
            },
        }
    }

    async fn set_contains_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>> {
        match self.inner.entries.get(key) {
            None => Ok(vec![false; members.len()]),
            Some(entry) => match entry.value() {
                Entry::Set(set) => Ok(members.iter().map(|m| set.contains(m)).collect()),
                other => Err(Self::wrong_type(key, KeyKind::Set, other.kind())),
            },
        }
    }

    async fn set_values(&self, key: &str) -> StateResult<Vec<String>> {
        match self.inner.entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match entry.value() {
                Entry::Set(members) => Ok(members.iter().cloned().collect()),
                other => Err(Self::wrong_type(key, KeyKind::Set, other.kind())),
            },
        }
    }

    async fn key_delete(&self, key: &str) -> StateResult<()> {
        self.inner.entries.remove(key);
        Ok(())
    }

    async fn key_type(&self, key: &str) -> StateResult<KeyKind> {
        Ok(self
            .inner
            .entries
            .get(key)
            .map(|e| e.value().kind())
            .unwrap_or(KeyKind::None))
    }
}
