//! Target resolution with a per-client sticky cache.
//!
//! In static mode every client goes to the configured target and the cache
//! is never consulted. In file mode a client is pinned to a randomly drawn
//! candidate for `max_age`; once the entry expires the next connection
//! re-reads the file and draws again.
//!
//! Clients are keyed by `(peer ip, listening port)`, so one client reaching
//! the relay through two ports holds two independent entries.

use crate::config::TargetMode;
use portfwd_core::{parse_target_list, FwdError, FwdResult, TargetSpec};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Identifies a client for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub client_ip: IpAddr,
    pub listen_port: u16,
}

/// A cached choice. Replaced wholesale on expiry, never extended.
#[derive(Debug, Clone)]
struct CacheEntry {
    target: TargetSpec,
    first_used_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.first_used_at) < max_age
    }
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub target: TargetSpec,
    /// `true` when the target came from a live cache entry.
    pub cached: bool,
}

/// Decides which upstream a client is forwarded to.
pub struct TargetResolver {
    mode: TargetMode,
    max_age: Duration,
    cache: Mutex<HashMap<ClientKey, CacheEntry>>,
}

impl TargetResolver {
    /// # Arguments
    ///
    /// * `mode` - A fixed target or a target file read on each miss
    /// * `max_age` - How long a client stays pinned to its drawn target
    pub fn new(mode: TargetMode, max_age: Duration) -> Self {
        Self {
            mode,
            max_age,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the target for `key` as of now.
    ///
    /// # Errors
    ///
    /// [`FwdError::NoValidTarget`] when the target file yields no usable
    /// candidate, [`FwdError::TargetFile`] when it cannot be read.
    pub async fn resolve(&self, key: &ClientKey) -> FwdResult<Resolution> {
        self.resolve_at(key, Instant::now()).await
    }

    /// Resolve the target for `key` as of `now`.
    ///
    /// The cache lock is not held across the file read. A miss draws a
    /// candidate, then inserts it only if no other resolution stored a
    /// fresh entry for the same key in the meantime; otherwise that entry
    /// is returned, so concurrent misses for one key agree on the target.
    ///
    /// # Arguments
    ///
    /// * `key` - Client IP and listening port
    /// * `now` - Reference time for freshness checks and new entries
    pub async fn resolve_at(&self, key: &ClientKey, now: Instant) -> FwdResult<Resolution> {
        let path = match &self.mode {
            TargetMode::Static(target) => {
                return Ok(Resolution {
                    target: target.clone(),
                    cached: false,
                })
            }
            TargetMode::File(path) => path,
        };

        if let Some(hit) = self.lookup(key, now).await {
            debug!(
                client = %key.client_ip,
                listen_port = key.listen_port,
                target = %hit,
                "using cached target"
            );
            return Ok(Resolution {
                target: hit,
                cached: true,
            });
        }

        let candidates = read_candidates(path).await?;
        let drawn = pick(&candidates).ok_or_else(|| {
            warn!(path = %path.display(), "target file has no valid entries");
            FwdError::NoValidTarget(format!("{} lists no valid targets", path.display()))
        })?;
        drawn.validate().map_err(FwdError::NoValidTarget)?;

        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(key) {
            if existing.is_fresh(now, self.max_age) {
                debug!(
                    client = %key.client_ip,
                    listen_port = key.listen_port,
                    target = %existing.target,
                    "concurrent resolution won"
                );
                return Ok(Resolution {
                    target: existing.target.clone(),
                    cached: true,
                });
            }
        }
        cache.insert(
            key.clone(),
            CacheEntry {
                target: drawn.clone(),
                first_used_at: now,
            },
        );
        drop(cache);

        info!(
            client = %key.client_ip,
            listen_port = key.listen_port,
            target = %drawn,
            candidates = candidates.len(),
            "selected new target"
        );
        Ok(Resolution {
            target: drawn,
            cached: false,
        })
    }

    async fn lookup(&self, key: &ClientKey, now: Instant) -> Option<TargetSpec> {
        let cache = self.cache.lock().await;
        cache
            .get(key)
            .filter(|entry| entry.is_fresh(now, self.max_age))
            .map(|entry| entry.target.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now()).await
    }

    pub async fn purge_expired_at(&self, now: Instant) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh(now, self.max_age));
        let removed = before - cache.len();
        if removed > 0 {
            debug!(count = removed, "purged expired cache entries");
        }
        removed
    }

    /// Number of entries currently held, expired or not.
    pub async fn cached_entries(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// The configured entry lifetime.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

/// Read the target file fresh; the list itself is never cached.
async fn read_candidates(path: &Path) -> FwdResult<Vec<TargetSpec>> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|source| {
        warn!(path = %path.display(), error = %source, "cannot read target file");
        FwdError::TargetFile {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(parse_target_list(&contents))
}

/// Uniform random draw.
fn pick(candidates: &[TargetSpec]) -> Option<TargetSpec> {
    candidates.choose(&mut rand::thread_rng()).cloned()
}
