//! Cache interface backing MFA sessions and the rate limiter. Redis in
//! production; an in-process implementation with the same semantics for
//! development and tests. All writes are TTL-scoped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::AuthError;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AuthError>;
    async fn delete(&self, key: &str) -> Result<(), AuthError>;
    /// Increment, creating the key with `ttl` when absent. Returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, AuthError>;
    async fn zadd(&self, key: &str, member: &str, score: f64, ttl: Duration)
        -> Result<(), AuthError>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<(), AuthError>;
    async fn zcard(&self, key: &str) -> Result<i64, AuthError>;
}

// ---------------------------------------------------------------------------
// Redis

pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, AuthError> {
        let client = redis::Client::open(url)
            .map_err(|e| AuthError::StorageFailure(format!("redis: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AuthError::StorageFailure(format!("redis: {}", e)))?;
        Ok(Self { manager })
    }
}

fn redis_err(e: redis::RedisError) -> AuthError {
    AuthError::StorageFailure(format!("redis: {}", e))
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(redis_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AuthError> {
        let mut conn = self.manager.clone();
        conn.set_ex(key, value, ttl.as_secs()).await.map_err(redis_err)
    }

    async fn delete(&self, key: &str) -> Result<(), AuthError> {
        let mut conn = self.manager.clone();
        conn.del(key).await.map_err(redis_err)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, AuthError> {
        let mut conn = self.manager.clone();
        let value: i64 = conn.incr(key, 1).await.map_err(redis_err)?;
        if value == 1 {
            let _: bool = conn
                .expire(key, ttl.as_secs() as i64)
                .await
                .map_err(redis_err)?;
        }
        Ok(value)
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<(), AuthError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.zadd(key, member, score).await.map_err(redis_err)?;
        let _: bool = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<(), AuthError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .zrembyscore(key, min, max)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<i64, AuthError> {
        let mut conn = self.manager.clone();
        conn.zcard(key).await.map_err(redis_err)
    }
}

// ---------------------------------------------------------------------------
// In-process fallback

enum Entry {
    Value(String),
    Counter(i64),
    SortedSet(Vec<(f64, String)>),
}

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(slots: &mut HashMap<String, Slot>, key: &str) {
        let expired = slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            slots.remove(key);
        }
    }
}

fn poisoned<T>(_: T) -> AuthError {
    AuthError::Internal("cache mutex poisoned".to_string())
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        Self::purge(&mut slots, key);
        Ok(slots.get(key).and_then(|slot| match &slot.entry {
            Entry::Value(v) => Some(v.clone()),
            Entry::Counter(n) => Some(n.to_string()),
            Entry::SortedSet(_) => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AuthError> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AuthError> {
        self.slots.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, AuthError> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        Self::purge(&mut slots, key);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Counter(0),
            expires_at: Some(Instant::now() + ttl),
        });
        match &mut slot.entry {
            Entry::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(AuthError::Internal(
                "incr on non-counter cache entry".to_string(),
            )),
        }
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<(), AuthError> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        Self::purge(&mut slots, key);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::SortedSet(Vec::new()),
            expires_at: None,
        });
        slot.expires_at = Some(Instant::now() + ttl);
        match &mut slot.entry {
            Entry::SortedSet(members) => {
                members.retain(|(_, m)| m != member);
                members.push((score, member.to_string()));
                Ok(())
            }
            _ => Err(AuthError::Internal(
                "zadd on non-zset cache entry".to_string(),
            )),
        }
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<(), AuthError> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        Self::purge(&mut slots, key);
        if let Some(Slot {
            entry: Entry::SortedSet(members),
            ..
        }) = slots.get_mut(key)
        {
            members.retain(|(score, _)| *score < min || *score > max);
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<i64, AuthError> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        Self::purge(&mut slots, key);
        Ok(match slots.get(key) {
            Some(Slot {
                entry: Entry::SortedSet(members),
                ..
            }) => members.len() as i64,
            _ => 0,
        })
    }
}
