use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::context::AnalysisContext;
use super::traits::RawResponse;
use crate::config::AppConfig;

// ═══════════════════════════════════════════════════════════
// AnalysisCache: engine responses by prompt digest
// ═══════════════════════════════════════════════════════════

struct CacheEntry {
    response: RawResponse,
    stored_at: Instant,
}

/// Bounded, expiring cache of engine responses.
///
/// A hit replaces the engine call only; the pipeline still parses the
/// response and appends a fresh record.
pub struct AnalysisCache {
    entries: HashMap<String, CacheEntry>,
    max_size: usize,
    ttl: Duration,
}

impl AnalysisCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_size,
            ttl,
        }
    }

    /// `None` when caching is disabled or sized to zero.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        (config.cache_enabled && config.cache_size > 0)
            .then(|| Self::new(config.cache_size, config.cache_ttl))
    }

    /// SHA-256 over patient, model, template and both prompts. Entries never
    /// cross patients, even when two renderings are identical.
    pub fn key(model: &str, context: &AnalysisContext) -> String {
        let mut hasher = Sha256::new();
        for part in [
            context.patient_id.as_str(),
            model,
            context.template.as_str(),
            context.system_prompt.as_str(),
            context.user_prompt.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&mut self, key: &str) -> Option<RawResponse> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                return Some(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Store a response, evicting the oldest entry when full.
    pub fn insert(&mut self, key: String, response: RawResponse) {
        if self.max_size == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.purge_expired();
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                response,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
