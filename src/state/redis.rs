//! Redis state backend.
//!
//! Maps the [`State`] capabilities onto plain Redis types: strings via
//! `GET`/`SET PX`, sets via `SADD`/`SREM`/`SMISMEMBER`, streams via
//! `XADD`/`XRANGE`/`XDEL`. No consumer groups are involved: the Director
//! owns all assignment logic, so there is nothing to ack or claim.
//!
//! Batch operations are pipelined into a single round-trip. The connection
//! is a [`ConnectionManager`], which reconnects transparently; transient
//! failures surface as [`StateError::Redis`] and the periodic loops above
//! retry on their next tick.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::{cmd, pipe, AsyncCommands, Client};

use super::{KeyKind, State, StateResult, StreamEntry};
use crate::types::StateId;

/// Field name under which stream payloads are stored.
const DATA_FIELD: &str = "d";

/// Redis-backed [`State`] implementation.
#[derive(Clone)]
pub struct RedisState {
    conn: ConnectionManager,
}

impl RedisState {
    /// Connect using a Redis connection string
    /// (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> StateResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl State for RedisState {
    async fn get_string(&self, key: &str) -> StateResult<Option<String>> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set_string(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> StateResult<()> {
        let mut conn = self.conn();
        match (value, ttl) {
            (None, _) => {
                let _: i64 = conn.del(key).await?;
            }
            (Some(value), Some(ttl)) => {
                let _: () = cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
            }
            (Some(value), None) => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn stream_add(&self, key: &str, data: Bytes) -> StateResult<StateId> {
        let id: String = self
            .conn()
            .xadd(key, "*", &[(DATA_FIELD, data.as_ref())])
            .await?;
        Ok(StateId::new(id))
    }

    async fn stream_add_batch(
        &self,
        key: &str,
        entries: &[Bytes],
    ) -> StateResult<Vec<Option<StateId>>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for data in entries {
            pipeline.xadd(key, "*", &[(DATA_FIELD, data.as_ref())]);
        }
        let ids: Vec<String> = pipeline.query_async(&mut self.conn()).await?;
        Ok(ids.into_iter().map(|id| Some(StateId::new(id))).collect())
    }

    async fn stream_read(
        &self,
        key: &str,
        max_count: Option<usize>,
    ) -> StateResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = match max_count {
            Some(count) => conn.xrange_count(key, "-", "+", count).await?,
            None => conn.xrange(key, "-", "+").await?,
        };

        let mut entries = Vec::with_capacity(reply.ids.len());
        for stream_id in reply.ids {
            let data = match stream_id.map.get(DATA_FIELD) {
                Some(value) => redis::from_redis_value::<Vec<u8>>(value)?,
                // Entries without the payload field are foreign; surface
                // them as empty so the parse layer drops them with a log.
                None => Vec::new(),
            };
            entries.push(StreamEntry {
                id: StateId::new(stream_id.id),
                data: Bytes::from(data),
            });
        }
        Ok(entries)
    }

    async fn stream_delete(&self, key: &str) -> StateResult<()> {
        let _: i64 = self.conn().del(key).await?;
        Ok(())
    }

    async fn stream_delete_messages(&self, key: &str, ids: &[StateId]) -> StateResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let raw: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        let removed: usize = self.conn().xdel(key, &raw).await?;
        Ok(removed)
    }

    async fn set_add(&self, key: &str, member: &str) -> StateResult<bool> {
        let added: bool = self.conn().sadd(key, member).await?;
        Ok(added)
    }

    async fn set_add_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for member in members {
            pipeline.sadd(key, member);
        }
        let results: Vec<bool> = pipeline.query_async(&mut self.conn()).await?;
        Ok(results)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StateResult<bool> {
        let removed: bool = self.conn().srem(key, member).await?;
        Ok(removed)
    }

    async fn set_remove_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for member in members {
            pipeline.srem(key, member);
        }
        let results: Vec<bool> = pipeline.query_async(&mut self.conn()).await?;
        Ok(results)
    }

    async fn set_contains(&self, key: &str, member: &str) -> StateResult<bool> {
        let contains: bool = self.conn().sismember(key, member).await?;
        Ok(contains)
    }

    async fn set_contains_batch(&self, key: &str, members: &[String]) -> StateResult<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let results: Vec<bool> = cmd("SMISMEMBER")
            .arg(key)
            .arg(members)
            .query_async(&mut self.conn())
            .await?;
        Ok(results)
    }

    async fn set_values(&self, key: &str) -> StateResult<Vec<String>> {
        let members: Vec<String> = self.conn().smembers(key).await?;
        Ok(members)
    }

    async fn key_delete(&self, key: &str) -> StateResult<()> {
        let _: i64 = self.conn().del(key).await?;
        Ok(())
    }

    async fn key_type(&self, key: &str) -> StateResult<KeyKind> {
        let tag: String = cmd("TYPE").arg(key).query_async(&mut self.conn()).await?;
        Ok(match tag.as_str() {
            "string" => KeyKind::String,
            "set" => KeyKind::Set,
            "stream" => KeyKind::Stream,
            _ => KeyKind::None,
        })
    }
}
