//! In-memory implementation of the Cache trait
//!
//! DashMap-backed, suitable for unit tests and for running the pipeline
//! without a Redis instance. TTLs are recorded but not enforced; tests
//! assert on the recorded values instead.

use crate::traits::{Cache, CacheOp};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};

/// In-memory cache with concurrent access support.
#[derive(Default)]
pub struct MemoryCache {
    hashes: DashMap<String, HashMap<String, Bytes>>,
    lists: DashMap<String, VecDeque<Bytes>>,
    zsets: DashMap<String, Vec<(f64, String)>>,
    ttls: DashMap<String, i64>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last TTL recorded for a key, if any.
    pub fn ttl_of(&self, key: &str) -> Option<i64> {
        self.ttls.get(key).map(|entry| *entry)
    }

    /// Drop everything (test isolation).
    pub fn clear(&self) {
        self.hashes.clear();
        self.lists.clear();
        self.zsets.clear();
        self.ttls.clear();
    }

    fn zset_insert(entries: &mut Vec<(f64, String)>, score: f64, member: &str) {
        entries.retain(|(_, existing)| existing != member);
        let index = entries.partition_point(|(s, _)| *s <= score);
        entries.insert(index, (score, member.to_string()));
    }

    fn apply_one(&self, op: CacheOp) {
        match op {
            CacheOp::HashSetAll {
                key,
                fields,
                ttl_secs,
            } => {
                let mut entry = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    entry.insert(field, value);
                }
                if let Some(ttl) = ttl_secs {
                    self.ttls.insert(key, ttl);
                }
            }
            CacheOp::ListPushTrim {
                key,
                value,
                max_len,
            } => {
                let mut entry = self.lists.entry(key).or_default();
                entry.push_front(value);
                entry.truncate(max_len);
            }
            CacheOp::ZSetAddTrim {
                key,
                score,
                member,
                max_len,
            } => {
                let mut entry = self.zsets.entry(key).or_default();
                Self::zset_insert(&mut entry, score, &member);
                let len = entry.len();
                if len > max_len {
                    entry.drain(..len - max_len);
                }
            }
        }
    }
}

/// Glob match supporting `*` and `?`, the subset SCAN patterns use.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[async_trait]
impl Cache for MemoryCache {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn hash_set_all(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()> {
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field, value);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>> {
        Ok(self
            .hashes
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        self.ttls.insert(key.to_string(), ttl_secs);
        Ok(())
    }

    async fn list_lpush(&self, key: &str, value: Bytes) -> Result<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value);
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        if let Some(mut entry) = self.lists.get_mut(key) {
            let len = entry.len() as isize;
            let norm = |i: isize| -> isize {
                if i < 0 {
                    (len + i).max(0)
                } else {
                    i.min(len)
                }
            };
            let (start, stop) = (norm(start), norm(stop));
            if start > stop {
                entry.clear();
            } else {
                let kept: VecDeque<Bytes> = entry
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect();
                *entry = kept;
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>> {
        let Some(entry) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = entry.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let (start, stop) = (norm(start), norm(stop).min(len - 1));
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(entry
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|entry| entry.len()).unwrap_or(0))
    }

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut entry = self.zsets.entry(key.to_string()).or_default();
        Self::zset_insert(&mut entry, score, member);
        Ok(())
    }

    async fn zset_remove_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        if let Some(mut entry) = self.zsets.get_mut(key) {
            let len = entry.len() as isize;
            let norm = |i: isize| -> isize {
                if i < 0 {
                    len + i
                } else {
                    i
                }
            };
            let (start, stop) = (norm(start).max(0), norm(stop).min(len - 1));
            if start <= stop {
                entry.drain(start as usize..=stop as usize);
            }
        }
        Ok(())
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        inclusive: bool,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let Some(entry) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .iter()
            .filter(|(score, _)| if inclusive { *score >= min } else { *score > min })
            .take(limit)
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn zset_len(&self, key: &str) -> Result<usize> {
        Ok(self.zsets.get(key).map(|entry| entry.len()).unwrap_or(0))
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self.hashes.iter() {
            keys.push(entry.key().clone());
        }
        for entry in self.lists.iter() {
            keys.push(entry.key().clone());
        }
        for entry in self.zsets.iter() {
            keys.push(entry.key().clone());
        }
        keys.retain(|key| glob_match(pattern, key));
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut removed = false;
        removed |= self.hashes.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        removed |= self.zsets.remove(key).is_some();
        self.ttls.remove(key);
        Ok(removed)
    }

    async fn apply(&self, ops: Vec<CacheOp>) -> Result<()> {
        for op in ops {
            self.apply_one(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("sensor:*:realtime", "sensor:temperature:t_m1_01:realtime"));
        assert!(glob_match("*:temperature:realtime", "20231208_120000:temperature:realtime"));
        assert!(!glob_match("*:temperature:realtime", "temperature:realtime"));
        assert!(glob_match("temperature:timeseries:*", "temperature:timeseries:channel_01"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test]
    async fn hash_operations() {
        let cache = MemoryCache::new();
        cache
            .hash_set_all(
                "k",
                vec![
                    ("a".into(), Bytes::from("1")),
                    ("b".into(), Bytes::from("2")),
                ],
            )
            .await
            .unwrap();
        let all = cache.hash_get_all("k").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("a"), Some(&Bytes::from("1")));

        assert!(cache.del("k").await.unwrap());
        assert!(cache.hash_get_all("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_push_is_newest_at_head() {
        let cache = MemoryCache::new();
        for i in 0..5 {
            cache
                .list_lpush("l", Bytes::from(format!("{i}")))
                .await
                .unwrap();
        }
        let range = cache.list_range("l", 0, -1).await.unwrap();
        assert_eq!(range[0], Bytes::from("4"));
        assert_eq!(range[4], Bytes::from("0"));

        let head = cache.list_range("l", 0, 1).await.unwrap();
        assert_eq!(head.len(), 2);

        cache.list_trim("l", 0, 2).await.unwrap();
        assert_eq!(cache.list_len("l").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn zset_ordering_and_trim() {
        let cache = MemoryCache::new();
        for i in 0..10 {
            cache
                .zset_add("z", i as f64, &format!("v:{i}"))
                .await
                .unwrap();
        }
        // Re-adding a member moves it, never duplicates
        cache.zset_add("z", 3.5, "v:0").await.unwrap();
        assert_eq!(cache.zset_len("z").await.unwrap(), 10);

        let page = cache.zset_range_by_score("z", 7.0, false, 100).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].0, "v:8");

        let page = cache.zset_range_by_score("z", 7.0, true, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, "v:7");

        // ZREMRANGEBYRANK 0 -(6) keeps the top 5
        cache.zset_remove_by_rank("z", 0, -6).await.unwrap();
        assert_eq!(cache.zset_len("z").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn batch_respects_bounds() {
        let cache = MemoryCache::new();
        let mut ops = Vec::new();
        for i in 0..1500 {
            ops.push(CacheOp::ListPushTrim {
                key: "hist".into(),
                value: Bytes::from(format!("{i}")),
                max_len: 1000,
            });
        }
        cache.apply(ops).await.unwrap();
        assert_eq!(cache.list_len("hist").await.unwrap(), 1000);
        // Newest retained at head
        let head = cache.list_range("hist", 0, 0).await.unwrap();
        assert_eq!(head[0], Bytes::from("1499"));
    }

    #[tokio::test]
    async fn batch_hash_records_ttl() {
        let cache = MemoryCache::new();
        cache
            .apply(vec![CacheOp::HashSetAll {
                key: "rt".into(),
                fields: vec![("value".into(), Bytes::from("1.0"))],
                ttl_secs: Some(3600),
            }])
            .await
            .unwrap();
        assert_eq!(cache.ttl_of("rt"), Some(3600));
    }

    #[tokio::test]
    async fn scan_covers_all_stores() {
        let cache = MemoryCache::new();
        cache
            .hash_set_all("sensor:temperature:x_01:realtime", vec![])
            .await
            .unwrap();
        cache
            .list_lpush("sensor:temperature:m1:history", Bytes::from("{}"))
            .await
            .unwrap();
        cache
            .zset_add("sensor:temperature:x_01:timeseries", 1.0, "1.0:1")
            .await
            .unwrap();

        let keys = cache.scan_match("sensor:*").await.unwrap();
        assert_eq!(keys.len(), 3);
        let keys = cache.scan_match("sensor:*:timeseries").await.unwrap();
        assert_eq!(keys.len(), 1);
    }
}
