//! Redis implementation of the Cache trait

use crate::traits::{Cache, CacheOp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Redis-backed cache tier.
///
/// `ConnectionManager` multiplexes one reconnecting connection; clones are
/// cheap and every operation works on its own clone.
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect and verify the server responds.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Redis connection failed")?;
        let cache = Self { manager };
        cache.ping().await?;
        Ok(cache)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn push_op(pipe: &mut redis::Pipeline, op: &CacheOp) {
    match op {
        CacheOp::HashSetAll {
            key,
            fields,
            ttl_secs,
        } => {
            let items: Vec<(&str, &[u8])> = fields
                .iter()
                .map(|(field, value)| (field.as_str(), value.as_ref()))
                .collect();
            pipe.hset_multiple(key, &items).ignore();
            if let Some(ttl) = ttl_secs {
                pipe.expire(key, *ttl).ignore();
            }
        }
        CacheOp::ListPushTrim {
            key,
            value,
            max_len,
        } => {
            pipe.lpush(key, value.as_ref()).ignore();
            pipe.ltrim(key, 0, *max_len as isize - 1).ignore();
        }
        CacheOp::ZSetAddTrim {
            key,
            score,
            member,
            max_len,
        } => {
            pipe.zadd(key, member.as_str(), *score).ignore();
            pipe.zremrangebyrank(key, 0, -(*max_len as isize) - 1)
                .ignore();
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("Redis PING failed")?;
        Ok(())
    }

    async fn hash_set_all(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()> {
        let mut conn = self.conn();
        let items: Vec<(String, Vec<u8>)> = fields
            .into_iter()
            .map(|(field, value)| (field, value.to_vec()))
            .collect();
        conn.hset_multiple(key, &items).await.context("HSET failed")
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>> {
        let mut conn = self.conn();
        let data: HashMap<String, Vec<u8>> =
            conn.hgetall(key).await.context("HGETALL failed")?;
        Ok(data
            .into_iter()
            .map(|(field, value)| (field, Bytes::from(value)))
            .collect())
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        let mut conn = self.conn();
        conn.expire(key, ttl_secs).await.context("EXPIRE failed")
    }

    async fn list_lpush(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn();
        conn.lpush(key, value.as_ref())
            .await
            .context("LPUSH failed")
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn();
        conn.ltrim(key, start, stop).await.context("LTRIM failed")
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>> {
        let mut conn = self.conn();
        let values: Vec<Vec<u8>> = conn
            .lrange(key, start, stop)
            .await
            .context("LRANGE failed")?;
        Ok(values.into_iter().map(Bytes::from).collect())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn();
        conn.llen(key).await.context("LLEN failed")
    }

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.zadd(key, member, score).await.context("ZADD failed")
    }

    async fn zset_remove_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn();
        conn.zremrangebyrank(key, start, stop)
            .await
            .context("ZREMRANGEBYRANK failed")
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        inclusive: bool,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let min_arg = if inclusive {
            format!("{min}")
        } else {
            format!("({min}")
        };
        let entries: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(key, min_arg, "+inf", 0, limit as isize)
            .await
            .context("ZRANGEBYSCORE failed")?;
        Ok(entries)
    }

    async fn zset_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn();
        conn.zcard(key).await.context("ZCARD failed")
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .context("SCAN failed")?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await.context("DEL failed")?;
        Ok(removed > 0)
    }

    async fn apply(&self, ops: Vec<CacheOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for op in &ops {
            push_op(&mut pipe, op);
        }
        let mut conn = self.conn();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .context("pipeline failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests against a live server; run with `--ignored`.

    #[tokio::test]
    #[ignore = "requires Redis at localhost:6379"]
    async fn basic_operations() {
        let cache = RedisCache::connect("redis://localhost:6379/15")
            .await
            .expect("connect");

        cache.del("envirotest:hash").await.unwrap();
        cache
            .hash_set_all(
                "envirotest:hash",
                vec![
                    ("timestamp".into(), Bytes::from("1700000000000")),
                    ("value".into(), Bytes::from("25.0")),
                ],
            )
            .await
            .unwrap();
        let all = cache.hash_get_all("envirotest:hash").await.unwrap();
        assert_eq!(all.len(), 2);
        cache.del("envirotest:hash").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis at localhost:6379"]
    async fn pipelined_batch_respects_bounds() {
        let cache = RedisCache::connect("redis://localhost:6379/15")
            .await
            .expect("connect");
        cache.del("envirotest:zset").await.unwrap();

        let ops: Vec<CacheOp> = (0..20)
            .map(|i| CacheOp::ZSetAddTrim {
                key: "envirotest:zset".into(),
                score: i as f64,
                member: format!("{i}.0:{i}"),
                max_len: 10,
            })
            .collect();
        cache.apply(ops).await.unwrap();

        assert_eq!(cache.zset_len("envirotest:zset").await.unwrap(), 10);
        cache.del("envirotest:zset").await.unwrap();
    }
}
