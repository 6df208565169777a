//! The matchmaker status blob.
//!
//! Every matchmaker publishes its load to the Director through a single
//! UTF-8 text value: the first line carries the processing-ticket count and
//! the local wall-clock, each following line one pool's queue depth and
//! gather flag. Tab-delimited, newline-separated:
//!
//! ```text
//! 3<TAB>1700000000000000
//! <TAB>2<TAB>1
//! test_pool<TAB>1<TAB>0
//! ```
//!
//! The local clock is i64 microseconds since the Unix epoch, which makes
//! `to_text ∘ from_text` the identity. The Director uses it to compensate
//! for clock skew when computing ticket expiries; the per-pool lines drive
//! ticket routing. Pool names may contain tabs (fields are split from the
//! right), but never newlines.

use crate::error::{Error, Result};
use crate::types::PoolId;

/// One pool's line in the status blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: PoolId,
    /// Tickets queued for matching (both queues).
    pub in_queue: usize,
    /// Whether a worker is holding the pool open for more tickets.
    pub gathering: bool,
}

/// A matchmaker's published load.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchmakerStatus {
    /// Tickets this instance currently has in memory.
    pub processing_tickets: usize,
    /// The instance's own UTC wall-clock, microseconds since the epoch.
    pub local_time_micros: i64,
    pub pools: Vec<PoolStatus>,
}

impl MatchmakerStatus {
    /// Serialize to the status text blob.
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\t{}", self.processing_tickets, self.local_time_micros);
        for pool in &self.pools {
            out.push('\n');
            out.push_str(pool.name.as_str());
            out.push('\t');
            out.push_str(&pool.in_queue.to_string());
            out.push('\t');
            out.push(if pool.gathering { '1' } else { '0' });
        }
        out
    }

    /// Parse a status text blob.
    pub fn from_text(text: &str) -> Result<MatchmakerStatus> {
        let mut lines = text.lines();

        let header = lines
            .next()
            .ok_or_else(|| Error::Parse("empty status blob".to_string()))?;
        let (count, time) = header
            .split_once('\t')
            .ok_or_else(|| Error::Parse("status header is not count<TAB>time".to_string()))?;
        let processing_tickets = count
            .parse::<usize>()
            .map_err(|e| Error::Parse(format!("bad processing count '{count}': {e}")))?;
        let local_time_micros = time
            .parse::<i64>()
            .map_err(|e| Error::Parse(format!("bad local time '{time}': {e}")))?;

        let mut pools = Vec::new();
        for line in lines {
            // Split from the right: the name field may itself contain tabs.
            let mut fields = line.rsplitn(3, '\t');
            let gathering = match fields.next() {
                Some("1") => true,
                Some("0") => false,
                other => {
                    return Err(Error::Parse(format!(
                        "bad gathering flag {other:?} in status line '{line}'"
                    )))
                }
            };
            let in_queue = fields
                .next()
                .ok_or_else(|| Error::Parse(format!("truncated status line '{line}'")))?
                .parse::<usize>()
                .map_err(|e| Error::Parse(format!("bad queue depth in '{line}': {e}")))?;
            let name = fields
                .next()
                .ok_or_else(|| Error::Parse(format!("truncated status line '{line}'")))?;

            pools.push(PoolStatus {
                name: PoolId::new(name),
                in_queue,
                gathering,
            });
        }

        Ok(MatchmakerStatus {
            processing_tickets,
            local_time_micros,
            pools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MatchmakerStatus {
        MatchmakerStatus {
            processing_tickets: 3,
            local_time_micros: 1_700_000_000_000_000,
            pools: vec![
                PoolStatus {
                    name: PoolId::default_pool(),
                    in_queue: 2,
                    gathering: true,
                },
                PoolStatus {
                    name: PoolId::new("test_pool"),
                    in_queue: 1,
                    gathering: false,
                },
            ],
        }
    }

    #[test]
    fn test_to_text_layout() {
        let text = sample().to_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "3\t1700000000000000");
        assert_eq!(lines[1], "\t2\t1");
        assert_eq!(lines[2], "test_pool\t1\t0");
    }

    #[test]
    fn test_roundtrip_is_identity() {
        let status = sample();
        let text = status.to_text();
        let parsed = MatchmakerStatus::from_text(&text).unwrap();
        assert_eq!(parsed, status);
        // The canonical property: re-serializing the parse is byte-equal.
        assert_eq!(parsed.to_text(), text);
    }

    #[test]
    fn test_roundtrip_no_pools() {
        let status = MatchmakerStatus {
            processing_tickets: 0,
            local_time_micros: -5,
            pools: Vec::new(),
        };
        let text = status.to_text();
        assert_eq!(text, "0\t-5");
        assert_eq!(MatchmakerStatus::from_text(&text).unwrap(), status);
    }

    #[test]
    fn test_roundtrip_tab_in_pool_name() {
        let status = MatchmakerStatus {
            processing_tickets: 1,
            local_time_micros: 42,
            pools: vec![PoolStatus {
                name: PoolId::new("odd\tname"),
                in_queue: 7,
                gathering: false,
            }],
        };
        let text = status.to_text();
        assert_eq!(MatchmakerStatus::from_text(&text).unwrap(), status);
    }

    #[test]
    fn test_rejects_malformed_blobs() {
        assert!(MatchmakerStatus::from_text("").is_err());
        assert!(MatchmakerStatus::from_text("no-tabs-here").is_err());
        assert!(MatchmakerStatus::from_text("x\t5").is_err());
        assert!(MatchmakerStatus::from_text("1\tnot-a-time").is_err());
        assert!(MatchmakerStatus::from_text("1\t5\npool\t2\t2").is_err());
        assert!(MatchmakerStatus::from_text("1\t5\npool\tx\t1").is_err());
    }
}
