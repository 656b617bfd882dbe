//! Engine registry: the pool's only shared mutable state.
//!
//! Every read-modify-write happens on `&mut EngineRegistry` behind the pool's
//! mutex, so selection and state changes are atomic with respect to each other.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use worldgen_common::{Engine, EngineState};

use crate::errors::PoolError;

/// An engine plus what the pool needs to drive its unit.
#[derive(Debug, Clone)]
pub struct EngineEntry {
    pub engine: Engine,
    /// Engine working directory on this host, mounted at `/config`.
    pub workdir: PathBuf,
}

#[derive(Debug, Default)]
pub struct EngineRegistry {
    entries: BTreeMap<String, EngineEntry>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Engines counted against `max_pool_size`.
    pub fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.engine.state.is_live())
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, entry: EngineEntry) {
        self.entries.insert(entry.engine.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<EngineEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&EngineEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut EngineEntry, PoolError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| PoolError::EngineNotFound { id: id.to_string() })
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Least recently used engine among those matching `filter`.
    fn lru_where(&self, filter: impl Fn(&Engine) -> bool) -> Option<&EngineEntry> {
        self.entries
            .values()
            .filter(|e| filter(&e.engine))
            .min_by(|a, b| {
                a.engine
                    .last_used_at
                    .cmp(&b.engine.last_used_at)
                    .then_with(|| a.engine.id.cmp(&b.engine.id))
            })
    }

    pub fn lru_ready(&self) -> Option<&EngineEntry> {
        self.lru_where(|e| e.state == EngineState::Ready)
    }

    pub fn lru_live(&self) -> Option<&EngineEntry> {
        self.lru_where(|e| e.state.is_live())
    }

    /// Claim the least recently used ready engine for `job_id`.
    pub fn claim_lru_ready(
        &mut self,
        job_id: &str,
        seed: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, PoolError> {
        let Some(id) = self.lru_ready().map(|e| e.engine.id.clone()) else {
            return Ok(None);
        };
        self.claim(&id, job_id, seed, now)?;
        Ok(Some(id))
    }

    /// Move a specific ready engine to `Generating` for `job_id`.
    pub fn claim(
        &mut self,
        id: &str,
        job_id: &str,
        seed: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let entry = self.get_mut(id)?;
        if entry.engine.state != EngineState::Ready {
            return Err(PoolError::EngineNotReady {
                id: id.to_string(),
                state: entry.engine.state,
            });
        }
        entry.engine.assign(job_id, seed, now)?;
        Ok(())
    }

    /// Ready engines idle for longer than `ttl` at `now`.
    pub fn expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.engine.state == EngineState::Ready && e.engine.idle_for(now) > ttl)
            .map(|e| e.engine.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Engine> {
        self.entries.values().map(|e| e.engine.clone()).collect()
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub engines: Vec<Engine>,
}

impl PoolStatus {
    pub fn count_in(&self, state: EngineState) -> usize {
        self.engines.iter().filter(|e| e.state == state).count()
    }
}
