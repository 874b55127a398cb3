//! Predictive context cache.
//!
//! Fingerprint-keyed storage of assembled contexts with TTL expiry, capacity
//! eviction (LRU or prediction-aware), tag-based invalidation, a warming
//! queue, and access-pattern learning. Expired entries are purged lazily on
//! access; a rate-limited [`cleanup_expired`](ContextCache::cleanup_expired)
//! sweep handles entries nobody asks for again.
//!
//! All mutation goes through a single `RwLock` over the entry map, so
//! individual operations appear atomic to callers. Reads hand out clones,
//! never references into the map.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::context::types::{
    AgentContext, ContextError, ContextRequest, PatternType, PredictionPattern,
};

// ============================================================================
// Constants
// ============================================================================

/// Weight of recency in the predictive eviction score
const EVICTION_RECENCY_WEIGHT: f64 = 0.6;

/// Weight of the prediction score in the predictive eviction score
const EVICTION_PREDICTION_WEIGHT: f64 = 0.4;

/// Two accesses further apart than this are not treated as sequential
const SEQUENTIAL_WINDOW: Duration = Duration::from_secs(60);

/// Minimum observations before a co-access pair becomes a pattern
const MIN_PATTERN_OBSERVATIONS: usize = 2;

// ============================================================================
// Configuration
// ============================================================================

/// How the cache picks a victim when capacity is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Oldest `last_accessed` goes first
    Lru,
    /// Lowest combined recency/prediction score goes first
    Predictive,
}

/// Whether predicted requests are queued for background warming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmingStrategy {
    /// Warming disabled; `warm` is a no-op
    None,
    /// Predicted requests are queued for the manager's warming loop
    Background,
}

/// Queue position for explicitly warmed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmingPriority {
    Normal,
    High,
}

/// Cache tunables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_entries: usize,

    /// Maximum total payload bytes across all entries
    pub max_bytes: usize,

    /// Time-to-live applied to every entry at insertion
    pub ttl: Duration,

    /// Eviction strategy when capacity is exceeded
    pub eviction: EvictionStrategy,

    /// Warming behavior
    pub warming: WarmingStrategy,

    /// Minimum spacing between full expiry sweeps
    pub cleanup_interval: Duration,

    /// Bounded length of the access history used for pattern learning
    pub history_limit: usize,

    /// Patterns below this confidence never trigger warming
    pub confidence_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            max_bytes: 64 * 1024 * 1024,
            ttl: Duration::from_secs(300),
            eviction: EvictionStrategy::Predictive,
            warming: WarmingStrategy::Background,
            cleanup_interval: Duration::from_secs(60),
            history_limit: 512,
            confidence_threshold: 0.5,
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    /// Live entries (expired-but-unswept entries may still be counted)
    pub entries: usize,

    /// Total payload bytes of live entries
    pub total_bytes: usize,

    /// Lookups that returned a context
    pub hits: u64,

    /// Lookups that found nothing (or only an expired entry)
    pub misses: u64,

    /// Entries removed to make room
    pub evictions: u64,

    /// Entries removed because their TTL elapsed
    pub expirations: u64,

    /// Hits served from entries placed by the warming loop
    pub warming_hits: u64,
}

impl CacheStatistics {
    /// `hits / (hits + misses)`; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of hits that were served from warmed entries.
    pub fn warming_effectiveness(&self) -> f64 {
        if self.hits == 0 {
            0.0
        } else {
            self.warming_hits as f64 / self.hits as f64
        }
    }
}

// ============================================================================
// Internal State
// ============================================================================

struct CacheEntry {
    context: AgentContext,
    cache_key: String,
    created_at: Instant,
    last_accessed: Instant,
    /// Touches of any kind, including metadata updates
    access_count: u64,
    /// Successful `get` lookups only
    hit_count: u64,
    size_bytes: usize,
    tags: BTreeSet<String>,
    warmed: bool,
    prediction_score: f64,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

#[derive(Default)]
struct CacheStore {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
}

impl CacheStore {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    warming_hits: u64,
}

struct AccessRecord {
    key: String,
    agent_type: String,
    story_id: String,
    request: ContextRequest,
    at: Instant,
}

// ============================================================================
// ContextCache
// ============================================================================

/// TTL cache with eviction, tagging, warming, and pattern-based prediction.
pub struct ContextCache {
    config: CacheConfig,
    store: RwLock<CacheStore>,
    counters: Mutex<Counters>,
    history: Mutex<VecDeque<AccessRecord>>,
    patterns: Mutex<HashMap<String, PredictionPattern>>,
    warm_queue: Mutex<VecDeque<ContextRequest>>,
    /// cache key -> id of the pattern that predicted it, for hit attribution
    predicted_by: Mutex<HashMap<String, String>>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ContextCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: RwLock::new(CacheStore::default()),
            counters: Mutex::new(Counters::default()),
            history: Mutex::new(VecDeque::new()),
            patterns: Mutex::new(HashMap::new()),
            warm_queue: Mutex::new(VecDeque::new()),
            predicted_by: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(None),
        }
    }

    // ========================================================================
    // Lookup and Insertion
    // ========================================================================

    /// Look up a context by its fingerprint key.
    ///
    /// Expired entries are purged on the spot and count as a miss. Hits
    /// update the entry's access bookkeeping and, for warmed entries, the
    /// originating pattern's success rate.
    pub fn get(&self, key: &str) -> Option<AgentContext> {
        let mut expired = false;
        let result = {
            let mut store = self.store.write();
            match store.entries.get_mut(key) {
                Some(entry) if entry.is_expired(self.config.ttl) => {
                    store.remove(key);
                    let mut counters = self.counters.lock();
                    counters.expirations += 1;
                    counters.misses += 1;
                    expired = true;
                    None
                }
                Some(entry) => {
                    entry.last_accessed = Instant::now();
                    entry.access_count += 1;
                    entry.hit_count += 1;
                    let warmed = entry.warmed;
                    let context = entry.context.clone();
                    let mut counters = self.counters.lock();
                    counters.hits += 1;
                    if warmed {
                        counters.warming_hits += 1;
                    }
                    Some((context, warmed))
                }
                None => {
                    self.counters.lock().misses += 1;
                    None
                }
            }
        };

        if expired {
            self.resolve_prediction(key, false);
        }

        let (context, warmed) = result?;
        if warmed {
            self.resolve_prediction(key, true);
        }
        self.trigger_patterns(key, None);
        Some(context)
    }

    /// Non-counting existence check for internal machinery (warming loop,
    /// queue dedup). Touches no statistics, bookkeeping, or patterns.
    /// Expired-but-unswept entries read as absent.
    pub fn contains(&self, key: &str) -> bool {
        self.store
            .read()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(self.config.ttl))
    }

    /// Merge metadata changes into a live entry in place.
    ///
    /// The entry itself is untouched apart from its byte accounting: tags,
    /// TTL, and warming provenance all survive. Returns the updated context,
    /// or `None` when the key is absent or expired.
    pub fn update_metadata(
        &self,
        key: &str,
        changes: &BTreeMap<String, String>,
    ) -> Option<AgentContext> {
        let mut store = self.store.write();
        let (old_size, new_size, context) = {
            let entry = store.entries.get_mut(key)?;
            if entry.is_expired(self.config.ttl) {
                return None;
            }
            let old_size = entry.size_bytes;
            for (k, v) in changes {
                entry.context.metadata.insert(k.clone(), v.clone());
            }
            entry.size_bytes = entry.context.size_bytes();
            entry.access_count += 1;
            (old_size, entry.size_bytes, entry.context.clone())
        };
        store.total_bytes = store.total_bytes.saturating_sub(old_size) + new_size;
        Some(context)
    }

    /// Insert a context under its fingerprint key, evicting as needed.
    ///
    /// Fails only when the context alone exceeds the byte capacity.
    pub fn put(
        &self,
        key: &str,
        context: AgentContext,
        tags: BTreeSet<String>,
    ) -> Result<(), ContextError> {
        self.insert(key, context, tags, false)
    }

    /// Insert a context produced by the warming loop; hits on warmed entries
    /// are tracked separately for warming-effectiveness statistics.
    pub fn put_warmed(
        &self,
        key: &str,
        context: AgentContext,
        tags: BTreeSet<String>,
    ) -> Result<(), ContextError> {
        self.insert(key, context, tags, true)
    }

    fn insert(
        &self,
        key: &str,
        context: AgentContext,
        tags: BTreeSet<String>,
        warmed: bool,
    ) -> Result<(), ContextError> {
        let size_bytes = context.size_bytes();
        if size_bytes > self.config.max_bytes {
            return Err(ContextError::Cache(format!(
                "context of {size_bytes} bytes exceeds cache capacity of {} bytes",
                self.config.max_bytes
            )));
        }

        let prediction_score = self
            .predicted_by
            .lock()
            .get(key)
            .and_then(|pid| self.patterns.lock().get(pid).map(|p| p.confidence))
            .unwrap_or(0.0);

        let mut store = self.store.write();
        store.remove(key);

        while store.entries.len() >= self.config.max_entries
            || store.total_bytes + size_bytes > self.config.max_bytes
        {
            let victim = self.select_victim(&store);
            match victim {
                Some(victim_key) => {
                    if let Some(victim) = store.remove(&victim_key) {
                        self.counters.lock().evictions += 1;
                        debug!(
                            key = %victim.cache_key,
                            hits = victim.hit_count,
                            "evicted cache entry"
                        );
                    }
                }
                None => break,
            }
        }

        let now = Instant::now();
        store.entries.insert(
            key.to_string(),
            CacheEntry {
                context,
                cache_key: key.to_string(),
                created_at: now,
                last_accessed: now,
                access_count: 0,
                hit_count: 0,
                size_bytes,
                tags,
                warmed,
                prediction_score,
            },
        );
        store.total_bytes += size_bytes;
        Ok(())
    }

    fn select_victim(&self, store: &CacheStore) -> Option<String> {
        match self.config.eviction {
            EvictionStrategy::Lru => store
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::Predictive => store
                .entries
                .iter()
                .map(|(k, e)| {
                    let recency = 1.0 / (1.0 + e.last_accessed.elapsed().as_secs_f64());
                    let score = EVICTION_RECENCY_WEIGHT * recency
                        + EVICTION_PREDICTION_WEIGHT * e.prediction_score;
                    (k, score)
                })
                .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(k, _)| k.clone()),
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Remove a single entry; returns whether one existed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.store.write().remove(key).is_some()
    }

    /// Remove every entry sharing at least one tag with `tags`; returns the
    /// number of entries removed.
    pub fn invalidate_by_tags(&self, tags: &BTreeSet<String>) -> usize {
        let mut store = self.store.write();
        let doomed: Vec<String> = store
            .entries
            .values()
            .filter(|e| !e.tags.is_disjoint(tags))
            .map(|e| e.cache_key.clone())
            .collect();
        for key in &doomed {
            store.remove(key);
        }
        doomed.len()
    }

    /// Sweep all expired entries. Rate-limited: a sweep within
    /// `cleanup_interval` of the previous one is skipped and reports 0.
    pub fn cleanup_expired(&self) -> usize {
        {
            let mut last = self.last_cleanup.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.config.cleanup_interval {
                    return 0;
                }
            }
            *last = Some(Instant::now());
        }

        let expired: Vec<String> = {
            let mut store = self.store.write();
            let doomed: Vec<String> = store
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(self.config.ttl))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &doomed {
                store.remove(key);
            }
            doomed
        };
        for key in &expired {
            self.resolve_prediction(key, false);
        }
        self.counters.lock().expirations += expired.len() as u64;
        expired.len()
    }

    // ========================================================================
    // Warming
    // ========================================================================

    /// Queue requests for background warming. Requests whose fingerprint is
    /// already cached or already queued are skipped; high priority goes to
    /// the front. No-op when warming is disabled.
    pub fn warm(&self, requests: Vec<ContextRequest>, priority: WarmingPriority) {
        if self.config.warming == WarmingStrategy::None {
            return;
        }
        for request in requests {
            self.enqueue_warm(request, None, priority);
        }
    }

    /// Pop the next request the warming loop should build.
    pub fn next_warm_request(&self) -> Option<ContextRequest> {
        self.warm_queue.lock().pop_front()
    }

    fn enqueue_warm(
        &self,
        request: ContextRequest,
        pattern_id: Option<String>,
        priority: WarmingPriority,
    ) {
        let key = request.fingerprint();
        if self.contains(&key) {
            return;
        }

        let mut queue = self.warm_queue.lock();
        if queue.iter().any(|r| r.fingerprint() == key) {
            return;
        }

        if let Some(pid) = pattern_id {
            self.predicted_by.lock().insert(key, pid);
        }

        match priority {
            WarmingPriority::High => queue.push_front(request),
            WarmingPriority::Normal => queue.push_back(request),
        }
    }

    // ========================================================================
    // Pattern Learning
    // ========================================================================

    /// Record an access for pattern learning and fire any agent-transition
    /// patterns the access triggers. Called by the manager once per prepared
    /// request, cache hit or not.
    pub fn record_access(&self, request: &ContextRequest) {
        let key = request.fingerprint();
        {
            let mut history = self.history.lock();
            history.push_back(AccessRecord {
                key: key.clone(),
                agent_type: request.agent_type.clone(),
                story_id: request.story_id.clone(),
                request: request.clone(),
                at: Instant::now(),
            });
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
        self.trigger_patterns(&key, Some(&request.agent_type));
    }

    /// Register an externally supplied pattern (e.g. feature-based relevance
    /// patterns from the orchestrator). Replaces any pattern with the same id.
    pub fn register_pattern(&self, pattern: PredictionPattern) {
        self.patterns
            .lock()
            .insert(pattern.pattern_id.clone(), pattern);
    }

    /// Derive sequential and agent-transition patterns from the access
    /// history. Confidence is refreshed on every call; success-rate history
    /// of an existing pattern is preserved. Returns the number of registered
    /// patterns after analysis.
    pub fn analyze_patterns(&self) -> usize {
        struct PairStats {
            count: usize,
            follower: ContextRequest,
        }

        let history = self.history.lock();
        let mut sequential: HashMap<(String, String), PairStats> = HashMap::new();
        let mut transitions: HashMap<(String, String), PairStats> = HashMap::new();
        let mut lead_counts: HashMap<String, usize> = HashMap::new();
        let mut agent_lead_counts: HashMap<String, usize> = HashMap::new();

        for pair in history.iter().zip(history.iter().skip(1)) {
            let (first, second) = pair;
            if second.at.duration_since(first.at) > SEQUENTIAL_WINDOW {
                continue;
            }

            *lead_counts.entry(first.key.clone()).or_default() += 1;
            if first.key != second.key {
                sequential
                    .entry((first.key.clone(), second.key.clone()))
                    .and_modify(|s| {
                        s.count += 1;
                        s.follower = second.request.clone();
                    })
                    .or_insert(PairStats {
                        count: 1,
                        follower: second.request.clone(),
                    });
            }

            if first.story_id == second.story_id && first.agent_type != second.agent_type {
                *agent_lead_counts
                    .entry(first.agent_type.clone())
                    .or_default() += 1;
                transitions
                    .entry((first.agent_type.clone(), second.agent_type.clone()))
                    .and_modify(|s| {
                        s.count += 1;
                        s.follower = second.request.clone();
                    })
                    .or_insert(PairStats {
                        count: 1,
                        follower: second.request.clone(),
                    });
            }
        }
        drop(history);

        let mut patterns = self.patterns.lock();

        for ((lead, follow), stats) in sequential {
            if stats.count < MIN_PATTERN_OBSERVATIONS {
                continue;
            }
            let total = lead_counts.get(&lead).copied().unwrap_or(stats.count);
            let confidence = (stats.count as f64 / total as f64).min(1.0);
            let id = format!(
                "seq:{}:{}",
                lead.chars().take(8).collect::<String>(),
                follow.chars().take(8).collect::<String>()
            );
            Self::upsert_pattern(
                &mut patterns,
                id,
                PatternType::Sequential,
                vec![lead.clone()],
                vec![stats.follower],
                confidence,
            );
        }

        for ((lead, follow), stats) in transitions {
            if stats.count < MIN_PATTERN_OBSERVATIONS {
                continue;
            }
            let total = agent_lead_counts.get(&lead).copied().unwrap_or(stats.count);
            let confidence = (stats.count as f64 / total as f64).min(1.0);
            let id = format!("transition:{lead}:{follow}");
            Self::upsert_pattern(
                &mut patterns,
                id,
                PatternType::AgentTransition,
                vec![format!("agent:{lead}")],
                vec![stats.follower],
                confidence,
            );
        }

        patterns.len()
    }

    fn upsert_pattern(
        patterns: &mut HashMap<String, PredictionPattern>,
        id: String,
        pattern_type: PatternType,
        triggers: Vec<String>,
        predicted: Vec<ContextRequest>,
        confidence: f64,
    ) {
        match patterns.get_mut(&id) {
            Some(existing) => {
                existing.trigger_conditions = triggers;
                existing.predicted_requests = predicted;
                existing.confidence = confidence;
            }
            None => {
                patterns.insert(
                    id.clone(),
                    PredictionPattern::new(id, pattern_type, triggers, predicted, confidence),
                );
            }
        }
    }

    /// Enqueue the predictions of every pattern this access triggers.
    fn trigger_patterns(&self, key: &str, agent_type: Option<&str>) {
        let fired: Vec<(String, Vec<ContextRequest>)> = {
            let patterns = self.patterns.lock();
            patterns
                .values()
                .filter(|p| p.confidence >= self.config.confidence_threshold)
                .filter(|p| p.matches(key, agent_type.unwrap_or("")))
                .map(|p| (p.pattern_id.clone(), p.predicted_requests.clone()))
                .collect()
        };

        for (pattern_id, requests) in fired {
            for request in requests {
                self.enqueue_warm(request, Some(pattern_id.clone()), WarmingPriority::Normal);
            }
        }
    }

    /// Fold a prediction outcome back into the pattern that made it.
    fn resolve_prediction(&self, key: &str, hit: bool) {
        let pattern_id = self.predicted_by.lock().remove(key);
        if let Some(pid) = pattern_id {
            if let Some(pattern) = self.patterns.lock().get_mut(&pid) {
                pattern.record_outcome(hit);
            }
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> CacheStatistics {
        let store = self.store.read();
        let counters = self.counters.lock();
        CacheStatistics {
            entries: store.entries.len(),
            total_bytes: store.total_bytes,
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            expirations: counters.expirations,
            warming_hits: counters.warming_hits,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
