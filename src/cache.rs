//! Content-Addressed Cache
//!
//! Compiled artifacts keyed by `sha256("<provenance>:<inputHash>")`. Every
//! mutation is written through to a `PersistenceStore` as one versioned
//! document. Storage failures never reach the caller: they switch caching off
//! for the rest of the session and release every handle the cache held.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::loader::{sha256_hex, HandleRegistry};
use crate::persistence::PersistenceStore;
use crate::source::{CompiledArtifact, Provenance};

/// Weight of one hit in the eviction score, in milliseconds of recency.
const HIT_WEIGHT: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub artifact: CompiledArtifact,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub hit_count: u64,
    pub byte_size: usize,
    /// Insertion order, breaks score ties
    #[serde(default)]
    seq: u64,
}

impl CacheEntry {
    fn score(&self) -> i64 {
        self.last_access_at.timestamp_millis() + self.hit_count as i64 * HIT_WEIGHT
    }
}

#[derive(Serialize, Deserialize)]
struct CacheDocument {
    version: String,
    entries: Vec<CacheEntry>,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    enabled: bool,
    next_seq: u64,
}

pub struct CacheService {
    state: Mutex<CacheState>,
    store: Option<Arc<dyn PersistenceStore>>,
    registry: Arc<HandleRegistry>,
    capacity: usize,
    version: String,
    persistence_key: String,
}

impl CacheService {
    pub fn new(
        config: &PipelineConfig,
        store: Option<Arc<dyn PersistenceStore>>,
        registry: Arc<HandleRegistry>,
    ) -> Self {
        let service = Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                enabled: store.is_some(),
                next_seq: 0,
            }),
            store,
            registry,
            capacity: config.cache_capacity.max(1),
            version: config.compiler_version_tag.clone(),
            persistence_key: config.persistence_key.clone(),
        };
        service.restore();
        service
    }

    /// Cache key for a source of the given provenance.
    pub fn key_for(provenance: Provenance, input_hash: &str) -> String {
        sha256_hex(&format!("{}:{}", provenance.as_str(), input_hash))
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().entries.contains_key(key)
    }

    /// Look up `key`, counting a hit. Entries whose handle is gone are dropped.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        self.touch(&mut state, key)
    }

    /// Look up the entry whose compiled output hashes to `output_hash`.
    pub fn get_by_output_hash(&self, output_hash: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        let key = state
            .entries
            .values()
            .find(|e| e.artifact.output_hash == output_hash)
            .map(|e| e.key.clone())?;
        self.touch(&mut state, &key)
    }

    fn touch(&self, state: &mut CacheState, key: &str) -> Option<CacheEntry> {
        if !state.enabled {
            return None;
        }
        let stale = match state.entries.get(key) {
            None => return None,
            Some(entry) => entry
                .artifact
                .load_url
                .as_deref()
                .map(|url| !self.registry.is_live(url))
                .unwrap_or(false),
        };
        if stale {
            debug!(key = %key, "dropping cache entry with released handle");
            state.entries.remove(key);
            self.persist(state);
            return None;
        }

        let entry = state.entries.get_mut(key)?;
        entry.hit_count += 1;
        entry.last_access_at = Utc::now();
        let snapshot = entry.clone();
        self.persist(state);
        if state.enabled {
            Some(snapshot)
        } else {
            None
        }
    }

    /// Insert and prune in one step. Returns whether the artifact is now held by
    /// the cache; if not, its handle has already been released.
    pub fn put(&self, key: &str, artifact: CompiledArtifact) -> bool {
        let mut state = self.state();
        if !state.enabled {
            if let Some(url) = &artifact.load_url {
                self.registry.release(url);
            }
            return false;
        }

        let now = Utc::now();
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = CacheEntry {
            key: key.to_string(),
            byte_size: artifact.byte_size,
            artifact,
            created_at: now,
            last_access_at: now,
            hit_count: 0,
            seq,
        };
        if let Some(previous) = state.entries.insert(key.to_string(), entry) {
            if let Some(url) = &previous.artifact.load_url {
                self.registry.release(url);
            }
        }

        self.prune_locked(&mut state, Some(key));
        self.persist(&mut state);
        if state.enabled {
            info!(key = %key, entries = state.entries.len(), "cached compiled component");
        }
        state.enabled
    }

    pub fn prune(&self) {
        let mut state = self.state();
        if self.prune_locked(&mut state, None) > 0 {
            self.persist(&mut state);
        }
    }

    /// Drop the lowest-scoring quarter when over capacity. `protect` is never evicted.
    fn prune_locked(&self, state: &mut CacheState, protect: Option<&str>) -> usize {
        let len = state.entries.len();
        if len <= self.capacity {
            return 0;
        }
        let quota = (len / 4).max(len - self.capacity);

        let mut ranked: Vec<(i64, u64, String)> = state
            .entries
            .values()
            .filter(|e| Some(e.key.as_str()) != protect)
            .map(|e| (e.score(), e.seq, e.key.clone()))
            .collect();
        ranked.sort();

        let mut removed = 0;
        for (_, _, key) in ranked.into_iter().take(quota) {
            if let Some(entry) = state.entries.remove(&key) {
                if let Some(url) = &entry.artifact.load_url {
                    self.registry.release(url);
                }
                removed += 1;
            }
        }
        debug!(removed, remaining = state.entries.len(), "pruned component cache");
        removed
    }

    /// Release every handle and empty the persisted document.
    pub fn clear(&self) {
        let mut state = self.state();
        self.drain(&mut state);
        if let (true, Some(store)) = (state.enabled, &self.store) {
            if let Err(e) = store.remove(&self.persistence_key) {
                self.disable(&mut state, &e);
            }
        }
    }

    fn drain(&self, state: &mut CacheState) {
        for (_, entry) in state.entries.drain() {
            if let Some(url) = &entry.artifact.load_url {
                self.registry.release(url);
            }
        }
    }

    fn disable(&self, state: &mut CacheState, err: &PipelineError) {
        warn!(error = %err, "cache storage failed; caching disabled for this session");
        state.enabled = false;
        self.drain(state);
    }

    fn persist(&self, state: &mut CacheState) {
        if !state.enabled {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let mut entries: Vec<CacheEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        let doc = CacheDocument {
            version: self.version.clone(),
            entries,
        };
        let result = serde_json::to_string(&doc)
            .map_err(|e| PipelineError::CacheIo(e.to_string()))
            .and_then(|json| store.set(&self.persistence_key, &json));
        if let Err(e) = result {
            self.disable(state, &e);
        }
    }

    fn restore(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut state = self.state();
        let raw = match store.get(&self.persistence_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                self.disable(&mut state, &e);
                return;
            }
        };

        let doc: CacheDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "discarding corrupt cache document");
                if let Err(e) = store.remove(&self.persistence_key) {
                    self.disable(&mut state, &e);
                }
                return;
            }
        };

        if doc.version != self.version {
            info!(
                found = %doc.version,
                expected = %self.version,
                "discarding cache from another compiler version"
            );
            if let Err(e) = store.remove(&self.persistence_key) {
                self.disable(&mut state, &e);
            }
            return;
        }

        let total = doc.entries.len();
        let loader = self.registry.loader();
        for mut entry in doc.entries {
            let ephemeral = entry
                .artifact
                .load_url
                .as_deref()
                .map(|url| loader.is_ephemeral(url))
                .unwrap_or(false);
            if ephemeral {
                continue;
            }
            entry.seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(entry.key.clone(), entry);
        }
        let dropped = total - state.entries.len();
        info!(restored = state.entries.len(), dropped, "restored component cache");
        if dropped > 0 {
            self.persist(&mut state);
        }
    }
}
