// src/transport/nonces.rs

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// 一次 nonce 预约的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceOutcome {
    Reserved,
    /// TTL 内已经出现过同一 (principal, nonce)
    Duplicate,
    /// 载荷时间戳早于 TTL 地平线，预约没有意义
    Expired,
}

struct NonceEntry {
    key: String,
    expires_at: DateTime<Utc>,
}

struct NonceInner {
    entries: VecDeque<NonceEntry>,
    known: HashSet<String>,
}

/// 防重放 nonce 缓存。(principal, nonce) 在 TTL 内只允许出现一次，
/// 检查与写入在同一把锁里完成（test-and-set）。
pub struct NonceCache {
    ttl: Duration,
    inner: Mutex<NonceInner>,
}

impl NonceCache {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds),
            inner: Mutex::new(NonceInner {
                entries: VecDeque::new(),
                known: HashSet::new(),
            }),
        }
    }

    pub async fn reserve(
        &self,
        principal: &str,
        nonce: &str,
        ts: DateTime<Utc>,
    ) -> NonceOutcome {
        let now = Utc::now();
        if ts + self.ttl <= now {
            return NonceOutcome::Expired;
        }
        let key = format!("{}:{}", principal, nonce);
        let mut inner = self.inner.lock().await;
        Self::evict_expired(&mut inner, now);
        if inner.known.contains(&key) {
            return NonceOutcome::Duplicate;
        }
        inner.known.insert(key.clone());
        inner.entries.push_back(NonceEntry {
            key,
            expires_at: now + self.ttl,
        });
        NonceOutcome::Reserved
    }

    fn evict_expired(inner: &mut NonceInner, now: DateTime<Utc>) {
        while let Some(front) = inner.entries.front() {
            if front.expires_at > now {
                break;
            }
            let expired = inner.entries.pop_front().unwrap();
            inner.known.remove(&expired.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_reservation_is_duplicate() {
        let cache = NonceCache::new(60);
        let ts = Utc::now();
        assert_eq!(cache.reserve("alpha", "n1", ts).await, NonceOutcome::Reserved);
        assert_eq!(cache.reserve("alpha", "n1", ts).await, NonceOutcome::Duplicate);
    }

    #[tokio::test]
    async fn nonces_are_scoped_per_principal() {
        let cache = NonceCache::new(60);
        let ts = Utc::now();
        assert_eq!(cache.reserve("alpha", "n1", ts).await, NonceOutcome::Reserved);
        assert_eq!(cache.reserve("beta", "n1", ts).await, NonceOutcome::Reserved);
    }

    #[tokio::test]
    async fn stale_timestamp_is_expired() {
        let cache = NonceCache::new(60);
        let stale = Utc::now() - Duration::seconds(120);
        assert_eq!(cache.reserve("alpha", "n1", stale).await, NonceOutcome::Expired);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted() {
        let cache = NonceCache::new(0);
        let ts = Utc::now() + Duration::seconds(1);
        // TTL 为 0 时条目立即过期，同一 nonce 可重新预约
        assert_eq!(cache.reserve("alpha", "n1", ts).await, NonceOutcome::Reserved);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(cache.reserve("alpha", "n1", ts).await, NonceOutcome::Reserved);
    }
}
