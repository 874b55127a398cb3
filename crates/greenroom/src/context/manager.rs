//! Context preparation orchestration.
//!
//! [`ContextManager`] is the entry point the orchestrator calls before every
//! agent invocation: it resolves the request against the cache, otherwise
//! gathers files, dependency excerpts, history, and agent memory through
//! injected collaborators, compresses everything into the token budget, and
//! caches the result.
//!
//! Collaborator failures never fail a preparation. A broken file filter,
//! code index, or memory store degrades its segment to empty with a warning;
//! only timeouts and request validation errors propagate to the caller.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::cache::{ContextCache, WarmingPriority};
use crate::context::compressor::ContextCompressor;
use crate::context::token_estimator::TokenEstimator;
use crate::context::types::{
    AgentContext, CompressionLevel, ContentType, ContextError, ContextRequest, TokenBudget,
    TokenUsage, BUDGET_OVERRUN_KEY,
};
use crate::context::ContextResult;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on results requested from the code index per preparation
const DEFAULT_INDEX_RESULTS: usize = 20;

/// Entries kept in the in-process story log used for history segments
const STORY_LOG_LIMIT: usize = 256;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Selects the files relevant to a request, in relevance order.
#[async_trait]
pub trait ContextFilter: Send + Sync {
    async fn filter_relevant_files(
        &self,
        request: &ContextRequest,
    ) -> anyhow::Result<Vec<PathBuf>>;
}

/// Produces dependency excerpts for a set of files from a code index.
#[async_trait]
pub trait ContextIndex: Send + Sync {
    async fn search_relevant_context(
        &self,
        files: &[PathBuf],
        max_results: usize,
    ) -> anyhow::Result<String>;
}

/// Persistent per-(agent type, story) memory.
#[async_trait]
pub trait AgentMemory: Send + Sync {
    async fn get_memory(
        &self,
        agent_type: &str,
        story_id: &str,
    ) -> anyhow::Result<Option<serde_json::Value>>;

    async fn store_memory(
        &self,
        agent_type: &str,
        story_id: &str,
        memory: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Optional sink for assembled contexts (audit trail, external store).
/// Failures are logged and never propagate.
#[async_trait]
pub trait ContextStorage: Send + Sync {
    async fn store_context(&self, context: &AgentContext) -> anyhow::Result<()>;
}

// ============================================================================
// Configuration and Metrics
// ============================================================================

/// Manager tunables.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Hard wall-clock limit for a single preparation
    pub max_preparation_time: Duration,

    /// Re-compression rounds before an overrun is flagged
    pub escalation_rounds: u32,

    /// Idle delay of the background warming loop
    pub warming_interval: Duration,

    /// Spacing of pattern-analysis runs
    pub analysis_interval: Duration,

    /// Spacing of expiry sweeps
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_preparation_time: Duration::from_secs(30),
            escalation_rounds: 3,
            warming_interval: Duration::from_millis(500),
            analysis_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Aggregated preparation metrics.
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    /// Total preparations attempted
    pub requests: u64,

    /// Preparations served from cache
    pub cache_hits: u64,

    /// `cache_hits / requests`; 0.0 before any request
    pub cache_hit_rate: f64,

    /// Mean wall-clock preparation time
    pub avg_preparation_ms: f64,

    /// Preparations that hit the time limit
    pub timeouts: u64,

    /// Contexts returned with the overrun flag set
    pub budget_overruns: u64,

    /// Individual segment compressions performed
    pub compressions_applied: u64,
}

#[derive(Default)]
struct MetricsInner {
    requests: u64,
    cache_hits: u64,
    timeouts: u64,
    budget_overruns: u64,
    compressions_applied: u64,
    total_preparation_ms: u64,
}

struct StoryLogLine {
    story_id: String,
    line: String,
}

// ============================================================================
// ContextManager
// ============================================================================

/// Orchestrates cache, compressor, and collaborators to prepare bounded
/// agent contexts.
pub struct ContextManager {
    config: ManagerConfig,
    cache: Arc<ContextCache>,
    compressor: Arc<ContextCompressor>,
    filter: Arc<dyn ContextFilter>,
    index: Arc<dyn ContextIndex>,
    memory: Arc<dyn AgentMemory>,
    storage: Option<Arc<dyn ContextStorage>>,
    metrics: Mutex<MetricsInner>,
    /// context_id -> cache key, for id-based invalidation and updates
    id_index: Mutex<BTreeMap<String, String>>,
    story_log: Mutex<VecDeque<StoryLogLine>>,
    shutdown: CancellationToken,
}

impl ContextManager {
    pub fn new(
        config: ManagerConfig,
        cache: Arc<ContextCache>,
        compressor: Arc<ContextCompressor>,
        filter: Arc<dyn ContextFilter>,
        index: Arc<dyn ContextIndex>,
        memory: Arc<dyn AgentMemory>,
    ) -> Self {
        Self {
            config,
            cache,
            compressor,
            filter,
            index,
            memory,
            storage: None,
            metrics: Mutex::new(MetricsInner::default()),
            id_index: Mutex::new(BTreeMap::new()),
            story_log: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach an optional context sink.
    pub fn with_storage(mut self, storage: Arc<dyn ContextStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// The cache this manager operates on.
    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    /// Prepare a context for `request`: cache hit, or full assembly under
    /// the configured time limit.
    ///
    /// # Errors
    ///
    /// `ContextError::Validation` for malformed requests and
    /// `ContextError::Timeout` when the time limit elapses. Collaborator
    /// failures degrade their segment to empty instead of erroring.
    pub async fn prepare_context(&self, request: ContextRequest) -> ContextResult<AgentContext> {
        Self::validate_request(&request)?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.max_preparation_time,
            self.prepare_inner(&request),
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok((context, cache_hit))) => {
                let mut metrics = self.metrics.lock();
                metrics.requests += 1;
                metrics.total_preparation_ms += elapsed_ms;
                if cache_hit {
                    metrics.cache_hits += 1;
                }
                if context.is_budget_overrun() {
                    metrics.budget_overruns += 1;
                }
                drop(metrics);
                debug!(
                    story_id = %request.story_id,
                    agent_type = %request.agent_type,
                    cache_hit,
                    elapsed_ms,
                    "context prepared"
                );
                Ok(context)
            }
            Ok(Err(err)) => {
                let mut metrics = self.metrics.lock();
                metrics.requests += 1;
                metrics.total_preparation_ms += elapsed_ms;
                drop(metrics);
                Err(err)
            }
            Err(_) => {
                let mut metrics = self.metrics.lock();
                metrics.requests += 1;
                metrics.timeouts += 1;
                metrics.total_preparation_ms += elapsed_ms;
                drop(metrics);
                warn!(
                    story_id = %request.story_id,
                    agent_type = %request.agent_type,
                    "context preparation timed out"
                );
                Err(ContextError::Timeout {
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    fn validate_request(request: &ContextRequest) -> ContextResult<()> {
        let mut violations = Vec::new();
        if request.story_id.trim().is_empty() {
            violations.push("story_id must not be empty".to_string());
        }
        if request.agent_type.trim().is_empty() {
            violations.push("agent_type must not be empty".to_string());
        }
        if request.max_tokens == 0 {
            violations.push("max_tokens must be positive".to_string());
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ContextError::Validation { violations })
        }
    }

    async fn prepare_inner(
        &self,
        request: &ContextRequest,
    ) -> ContextResult<(AgentContext, bool)> {
        let key = request.fingerprint();
        self.cache.record_access(request);

        if let Some(context) = self.cache.get(&key) {
            return Ok((context, true));
        }

        let context = self.assemble(request).await;

        // Cache and persist best-effort; a full assembly is still a success.
        if let Err(err) = self.cache.put(&key, context.clone(), Self::tags_for(request)) {
            warn!(error = %err, "failed to cache prepared context");
        } else {
            self.id_index
                .lock()
                .insert(context.context_id.clone(), key.clone());
        }
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.store_context(&context).await {
                warn!(error = %err, "failed to persist prepared context");
            }
        }

        self.log_story_line(request, &context);
        Ok((context, false))
    }

    fn tags_for(request: &ContextRequest) -> BTreeSet<String> {
        [request.story_id.clone(), request.agent_type.clone()]
            .into_iter()
            .collect()
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Build a context from scratch. Infallible: every collaborator failure
    /// degrades its segment to empty.
    async fn assemble(&self, request: &ContextRequest) -> AgentContext {
        let budget = TokenBudget::allocate_with_flags(
            request.max_tokens,
            request.include_dependencies,
            request.include_history,
        );

        let files = match self.filter.filter_relevant_files(request).await {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "file filter failed, continuing with no files");
                Vec::new()
            }
        };

        let mut originals: IndexMap<PathBuf, String> = IndexMap::new();
        for path in &files {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    originals.insert(path.clone(), content);
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping unreadable file");
                }
            }
        }

        let dependencies_raw = if request.include_dependencies {
            match self
                .index
                .search_relevant_context(&files, DEFAULT_INDEX_RESULTS)
                .await
            {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "code index failed, continuing without dependencies");
                    String::new()
                }
            }
        } else {
            String::new()
        };

        let agent_memory_raw = match self
            .memory
            .get_memory(&request.agent_type, &request.story_id)
            .await
        {
            Ok(Some(value)) => {
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
            }
            Ok(None) => String::new(),
            Err(err) => {
                warn!(error = %err, "memory store failed, continuing without agent memory");
                String::new()
            }
        };

        let history_raw = if request.include_history {
            self.story_history(&request.story_id)
        } else {
            String::new()
        };

        let task_context = Self::render_task_context(request);
        let task_tokens = TokenEstimator::estimate_tokens(&task_context);

        // First compression pass at the requested level.
        let mut level = request.compression_level;
        let mut file_contents =
            self.compress_files(&originals, level, budget.core.saturating_sub(task_tokens));
        let mut dependencies =
            self.compress_segment(&dependencies_raw, ContentType::Text, level, budget.dependencies);
        let mut history = self.compress_segment(
            &history_raw,
            ContentType::Text,
            level,
            budget.history / 2,
        );
        let mut agent_memory = self.compress_segment(
            &agent_memory_raw,
            ContentType::Json,
            level,
            budget.history.saturating_sub(budget.history / 2),
        );

        let mut usage = Self::measure(&task_context, &file_contents, &dependencies, &history, &agent_memory);

        // Escalate compression while over budget and rounds remain.
        let mut rounds = 0;
        while usage.total() > budget.total && rounds < self.config.escalation_rounds {
            level = level.escalate();
            rounds += 1;

            if usage.core >= usage.dependencies && usage.core >= usage.history {
                file_contents = self.compress_files(
                    &originals,
                    level,
                    budget.core.saturating_sub(task_tokens),
                );
            } else if usage.dependencies >= usage.history {
                dependencies = self.compress_segment(
                    &dependencies_raw,
                    ContentType::Text,
                    level,
                    budget.dependencies,
                );
            } else {
                history =
                    self.compress_segment(&history_raw, ContentType::Text, level, budget.history / 2);
                agent_memory = self.compress_segment(
                    &agent_memory_raw,
                    ContentType::Json,
                    level,
                    budget.history.saturating_sub(budget.history / 2),
                );
            }
            usage = Self::measure(&task_context, &file_contents, &dependencies, &history, &agent_memory);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("agent_type".to_string(), request.agent_type.clone());
        metadata.insert("tdd_phase".to_string(), request.tdd_phase.as_str().to_string());
        metadata.insert("compression_level".to_string(), level.as_str().to_string());
        if usage.total() > budget.total {
            // Overruns stay visible on the context, never silently dropped.
            metadata.insert(BUDGET_OVERRUN_KEY.to_string(), "true".to_string());
            warn!(
                story_id = %request.story_id,
                used = usage.total(),
                budget = budget.total,
                "context exceeds budget after escalation"
            );
        }

        AgentContext {
            context_id: Uuid::new_v4().to_string(),
            task_context,
            relevant_files: originals.keys().cloned().collect(),
            file_contents,
            dependencies,
            history,
            agent_memory,
            budget,
            usage,
            metadata,
            created_at: Utc::now(),
            cache_key: request.fingerprint(),
        }
    }

    fn render_task_context(request: &ContextRequest) -> String {
        format!(
            "# Task\nStory: {}\nAgent: {}\nPhase: {}\n\n{}",
            request.story_id,
            request.agent_type,
            request.tdd_phase.as_str(),
            request.task_description
        )
    }

    fn compress_files(
        &self,
        originals: &IndexMap<PathBuf, String>,
        level: CompressionLevel,
        core_budget: usize,
    ) -> IndexMap<PathBuf, String> {
        if originals.is_empty() {
            return IndexMap::new();
        }
        let per_file = core_budget / originals.len();

        let mut out = IndexMap::new();
        for (path, content) in originals {
            let content_type = ContentType::from_path(path);
            let outcome = self
                .compressor
                .compress(content, content_type, level, Some(per_file));
            if outcome.ratio < 1.0 {
                self.metrics.lock().compressions_applied += 1;
            }
            out.insert(path.clone(), outcome.text);
        }
        out
    }

    fn compress_segment(
        &self,
        content: &str,
        content_type: ContentType,
        level: CompressionLevel,
        target: usize,
    ) -> String {
        if content.is_empty() {
            return String::new();
        }
        let outcome = self
            .compressor
            .compress(content, content_type, level, Some(target));
        if outcome.ratio < 1.0 {
            self.metrics.lock().compressions_applied += 1;
        }
        outcome.text
    }

    fn measure(
        task_context: &str,
        file_contents: &IndexMap<PathBuf, String>,
        dependencies: &str,
        history: &str,
        agent_memory: &str,
    ) -> TokenUsage {
        let core = TokenEstimator::estimate_tokens(task_context)
            + file_contents
                .values()
                .map(|c| TokenEstimator::estimate_tokens(c))
                .sum::<usize>();
        TokenUsage::new(
            core,
            TokenEstimator::estimate_tokens(dependencies),
            TokenEstimator::estimate_tokens(history) + TokenEstimator::estimate_tokens(agent_memory),
        )
    }

    // ========================================================================
    // Story History
    // ========================================================================

    fn log_story_line(&self, request: &ContextRequest, context: &AgentContext) {
        let line = format!(
            "[{}] {} ({}): {} tokens",
            context.created_at.format("%H:%M:%S"),
            request.agent_type,
            request.tdd_phase.as_str(),
            context.usage.total()
        );
        let mut log = self.story_log.lock();
        log.push_back(StoryLogLine {
            story_id: request.story_id.clone(),
            line,
        });
        while log.len() > STORY_LOG_LIMIT {
            log.pop_front();
        }
    }

    fn story_history(&self, story_id: &str) -> String {
        self.story_log
            .lock()
            .iter()
            .filter(|l| l.story_id == story_id)
            .map(|l| l.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ========================================================================
    // Cache Operations
    // ========================================================================

    /// Remove a prepared context by its context id.
    pub fn invalidate_context(&self, context_id: &str) -> bool {
        let key = self.id_index.lock().remove(context_id);
        match key {
            Some(key) => self.cache.invalidate(&key),
            None => false,
        }
    }

    /// Merge metadata changes into a cached context. The cached entry is
    /// mutated in place, so its tags and remaining TTL are unaffected.
    ///
    /// # Errors
    ///
    /// `ContextError::NotFound` when the id is unknown or the entry has
    /// since expired or been evicted.
    pub fn update_context(
        &self,
        context_id: &str,
        changes: BTreeMap<String, String>,
    ) -> ContextResult<AgentContext> {
        let key = self
            .id_index
            .lock()
            .get(context_id)
            .cloned()
            .ok_or_else(|| ContextError::NotFound(context_id.to_string()))?;

        self.cache
            .update_metadata(&key, &changes)
            .ok_or_else(|| ContextError::NotFound(context_id.to_string()))
    }

    /// Queue requests for background warming.
    pub fn warm_contexts(&self, requests: Vec<ContextRequest>, priority: WarmingPriority) {
        self.cache.warm(requests, priority);
    }

    /// Trigger an expiry sweep; returns the number of entries removed.
    pub fn cleanup_cache(&self) -> usize {
        self.cache.cleanup_expired()
    }

    /// Pass-through to the agent memory collaborator.
    pub async fn get_agent_memory(
        &self,
        agent_type: &str,
        story_id: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        self.memory.get_memory(agent_type, story_id).await
    }

    /// Snapshot of aggregated preparation metrics.
    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        let inner = self.metrics.lock();
        let cache_hit_rate = if inner.requests == 0 {
            0.0
        } else {
            inner.cache_hits as f64 / inner.requests as f64
        };
        let avg_preparation_ms = if inner.requests == 0 {
            0.0
        } else {
            inner.total_preparation_ms as f64 / inner.requests as f64
        };
        PerformanceMetrics {
            requests: inner.requests,
            cache_hits: inner.cache_hits,
            cache_hit_rate,
            avg_preparation_ms,
            timeouts: inner.timeouts,
            budget_overruns: inner.budget_overruns,
            compressions_applied: inner.compressions_applied,
        }
    }

    // ========================================================================
    // Background Loops
    // ========================================================================

    /// Spawn the warming, pattern-analysis, and cleanup loops. All three
    /// stop cooperatively when [`shutdown`](ContextManager::shutdown) is
    /// called.
    pub fn start_background_loops(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            info!("warming loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(manager.config.warming_interval) => {
                        while let Some(request) = manager.cache.next_warm_request() {
                            manager.warm_one(request).await;
                            if token.is_cancelled() {
                                break;
                            }
                        }
                    }
                }
            }
            info!("warming loop stopped");
        });

        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            info!("pattern analysis loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(manager.config.analysis_interval) => {
                        let patterns = manager.cache.analyze_patterns();
                        debug!(patterns, "pattern analysis complete");
                    }
                }
            }
            info!("pattern analysis loop stopped");
        });

        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            info!("cleanup loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(manager.config.cleanup_interval) => {
                        let removed = manager.cache.cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "expired cache entries swept");
                        }
                    }
                }
            }
            info!("cleanup loop stopped");
        });
    }

    /// Signal all background loops to stop after their current iteration.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Build and cache one warming-queue request.
    async fn warm_one(&self, request: ContextRequest) {
        let key = request.fingerprint();
        // Non-counting check: a warming build must not skew hit/miss stats.
        if self.cache.contains(&key) {
            return;
        }
        let context = self.assemble(&request).await;
        let context_id = context.context_id.clone();
        match self.cache.put_warmed(&key, context, Self::tags_for(&request)) {
            Ok(()) => {
                self.id_index.lock().insert(context_id, key);
            }
            Err(err) => warn!(error = %err, "failed to cache warmed context"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::cache::CacheConfig;
    use crate::context::compressor::CompressorConfig;
    use crate::context::types::TddPhase;

    struct StaticFilter(Vec<PathBuf>);

    #[async_trait]
    impl ContextFilter for StaticFilter {
        async fn filter_relevant_files(
            &self,
            _request: &ContextRequest,
        ) -> anyhow::Result<Vec<PathBuf>> {
            Ok(self.0.clone())
        }
    }

    struct EmptyIndex;

    #[async_trait]
    impl ContextIndex for EmptyIndex {
        async fn search_relevant_context(
            &self,
            _files: &[PathBuf],
            _max_results: usize,
        ) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct NoMemory;

    #[async_trait]
    impl AgentMemory for NoMemory {
        async fn get_memory(
            &self,
            _agent_type: &str,
            _story_id: &str,
        ) -> anyhow::Result<Option<serde_json::Value>> {
            Ok(None)
        }

        async fn store_memory(
            &self,
            _agent_type: &str,
            _story_id: &str,
            _memory: serde_json::Value,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_manager() -> ContextManager {
        ContextManager::new(
            ManagerConfig::default(),
            Arc::new(ContextCache::new(CacheConfig::default())),
            Arc::new(ContextCompressor::new(CompressorConfig::default())),
            Arc::new(StaticFilter(Vec::new())),
            Arc::new(EmptyIndex),
            Arc::new(NoMemory),
        )
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_fields() {
        let manager = test_manager();
        let mut request = ContextRequest::new("", "", TddPhase::Red);
        request.max_tokens = 0;

        let err = manager.prepare_context(request).await.unwrap_err();
        match err {
            ContextError::Validation { violations } => {
                assert_eq!(violations.len(), 3);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prepare_with_no_files_succeeds() {
        let manager = test_manager();
        let mut request = ContextRequest::new("story-1", "coder", TddPhase::Red);
        request.task_description = "write the failing test".into();

        let context = manager.prepare_context(request).await.unwrap();
        assert!(context.task_context.contains("story-1"));
        assert!(context.relevant_files.is_empty());
        assert!(!context.is_budget_overrun());
    }

    #[tokio::test]
    async fn test_second_request_is_cache_hit() {
        let manager = test_manager();
        let request = ContextRequest::new("story-1", "coder", TddPhase::Red);

        let first = manager.prepare_context(request.clone()).await.unwrap();
        let second = manager.prepare_context(request).await.unwrap();

        assert_eq!(first.context_id, second.context_id);
        let metrics = manager.get_performance_metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert!((metrics.cache_hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalidate_context_by_id() {
        let manager = test_manager();
        let request = ContextRequest::new("story-1", "coder", TddPhase::Red);

        let context = manager.prepare_context(request.clone()).await.unwrap();
        assert!(manager.invalidate_context(&context.context_id));
        assert!(!manager.invalidate_context(&context.context_id));

        // Next preparation is a miss again.
        let rebuilt = manager.prepare_context(request).await.unwrap();
        assert_ne!(rebuilt.context_id, context.context_id);
    }

    #[tokio::test]
    async fn test_update_context_merges_metadata() {
        let manager = test_manager();
        let request = ContextRequest::new("story-1", "coder", TddPhase::Red);
        let context = manager.prepare_context(request).await.unwrap();

        let mut changes = BTreeMap::new();
        changes.insert("reviewed".to_string(), "true".to_string());
        let updated = manager.update_context(&context.context_id, changes).unwrap();

        assert_eq!(updated.metadata.get("reviewed").map(String::as_str), Some("true"));
        // Original metadata survives the merge.
        assert_eq!(
            updated.metadata.get("agent_type").map(String::as_str),
            Some("coder")
        );
    }

    #[tokio::test]
    async fn test_updated_context_still_invalidates_by_story_tag() {
        let manager = test_manager();
        let request = ContextRequest::new("story-1", "coder", TddPhase::Red);
        let context = manager.prepare_context(request).await.unwrap();

        let mut changes = BTreeMap::new();
        changes.insert("reviewed".to_string(), "true".to_string());
        manager.update_context(&context.context_id, changes).unwrap();

        // The update must not detach the entry from its story/agent tags.
        let story_tags: BTreeSet<String> = ["story-1".to_string()].into_iter().collect();
        assert_eq!(manager.cache().invalidate_by_tags(&story_tags), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_context_not_found() {
        let manager = test_manager();
        let err = manager
            .update_context("no-such-id", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ContextError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_history_segment_from_story_log() {
        let manager = test_manager();
        let mut first = ContextRequest::new("story-1", "coder", TddPhase::Red);
        first.task_description = "first pass".into();
        manager.prepare_context(first).await.unwrap();

        let mut second = ContextRequest::new("story-1", "reviewer", TddPhase::Green);
        second.task_description = "review pass".into();
        let context = manager.prepare_context(second).await.unwrap();

        assert!(context.history.contains("coder"));
    }

    #[tokio::test]
    async fn test_history_excluded_when_disabled() {
        let manager = test_manager();
        manager
            .prepare_context(ContextRequest::new("story-1", "coder", TddPhase::Red))
            .await
            .unwrap();

        let mut request = ContextRequest::new("story-1", "reviewer", TddPhase::Green);
        request.include_history = false;
        let context = manager.prepare_context(request).await.unwrap();

        assert!(context.history.is_empty());
        assert_eq!(context.budget.history, 0);
    }
}
