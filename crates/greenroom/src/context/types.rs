//! Core type definitions for the context preparation engine.
//!
//! This module defines the fundamental types used throughout the crate:
//! context requests and the assembled context package, token budgets and
//! usage tracking, compression settings and results, prediction patterns,
//! and error handling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Token Estimation Constants
// ============================================================================

/// Characters per token for default English text
pub const CHARS_PER_TOKEN_DEFAULT: f64 = 3.5;

/// Characters per token for Asian characters (Chinese, Japanese, Korean)
pub const CHARS_PER_TOKEN_ASIAN: f64 = 2.0;

/// Characters per token for code content
pub const CHARS_PER_TOKEN_CODE: f64 = 3.0;

// ============================================================================
// Budget Constants
// ============================================================================

/// Share of the total budget allocated to core content (source files)
pub const CORE_BUDGET_SHARE: f64 = 0.50;

/// Share of the total budget allocated to dependency excerpts
pub const DEPENDENCY_BUDGET_SHARE: f64 = 0.25;

/// Share of the total budget allocated to historical/memory content
pub const HISTORY_BUDGET_SHARE: f64 = 0.25;

/// Default token ceiling for a context request that does not specify one
pub const DEFAULT_MAX_TOKENS: usize = 16_000;

/// Metadata key set on a context that could not be brought under budget
pub const BUDGET_OVERRUN_KEY: &str = "budget_overrun";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during context preparation operations.
///
/// Every variant carries a stable [`kind`](ContextError::kind) identifier and
/// structured details so the observability layer can classify failures
/// without parsing messages.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Context could not be brought under budget after escalation. Returned
    /// flagged on the context itself in most paths, not raised.
    #[error("token budget exceeded: {requested} tokens requested, {available} available")]
    BudgetExceeded {
        /// Tokens the assembled context needs
        requested: usize,
        /// Tokens the budget allows
        available: usize,
    },

    /// No cached context matches the given identifier
    #[error("context not found: {0}")]
    NotFound(String),

    /// Internal compression failure; always recovered locally via fallback
    #[error("compression failed: {0}")]
    Compression(String),

    /// Preparation exceeded the configured time limit
    #[error("context preparation timed out after {elapsed:?}")]
    Timeout {
        /// Wall time spent before the deadline fired
        elapsed: Duration,
    },

    /// Cache operation failure (capacity, oversized entry, ...)
    #[error("cache error: {0}")]
    Cache(String),

    /// Request failed validation; carries the violated constraints
    #[error("invalid request: {}", violations.join("; "))]
    Validation {
        /// Human-readable list of violated constraints
        violations: Vec<String>,
    },

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ContextError {
    /// Stable machine-readable identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ContextError::BudgetExceeded { .. } => "token_budget_exceeded",
            ContextError::NotFound(_) => "context_not_found",
            ContextError::Compression(_) => "compression_error",
            ContextError::Timeout { .. } => "context_timeout",
            ContextError::Cache(_) => "context_cache_error",
            ContextError::Validation { .. } => "context_validation_error",
            ContextError::Io(_) => "io_error",
            ContextError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for ContextError {
    fn from(err: serde_json::Error) -> Self {
        ContextError::Serialization(err.to_string())
    }
}

// ============================================================================
// TDD Phase
// ============================================================================

/// Phase of the TDD cycle a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TddPhase {
    /// Writing a failing test
    #[default]
    Red,
    /// Making the test pass
    Green,
    /// Cleaning up with tests green
    Refactor,
}

impl TddPhase {
    /// Lowercase identifier used in fingerprints and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            TddPhase::Red => "red",
            TddPhase::Green => "green",
            TddPhase::Refactor => "refactor",
        }
    }
}

// ============================================================================
// Compression Settings
// ============================================================================

/// Ordinal setting controlling how aggressively content is shrunk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// No structural compression; only the truncation safety net applies
    None,
    /// Light compression: bodies and docs survive
    Low,
    /// Function bodies elided, paragraph bodies reduced to first sentence
    #[default]
    Moderate,
    /// Type bodies elided too, doc comments dropped
    High,
    /// Only imports, signatures, and headings remain
    Extreme,
}

impl CompressionLevel {
    /// The next more aggressive level, saturating at [`Extreme`](Self::Extreme).
    pub fn escalate(self) -> Self {
        match self {
            CompressionLevel::None => CompressionLevel::Low,
            CompressionLevel::Low => CompressionLevel::Moderate,
            CompressionLevel::Moderate => CompressionLevel::High,
            CompressionLevel::High | CompressionLevel::Extreme => CompressionLevel::Extreme,
        }
    }

    /// Lowercase identifier used in fingerprints and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionLevel::None => "none",
            CompressionLevel::Low => "low",
            CompressionLevel::Moderate => "moderate",
            CompressionLevel::High => "high",
            CompressionLevel::Extreme => "extreme",
        }
    }
}

/// Content categories the compressor knows how to handle.
///
/// Rust is the primary implementation language and gets structural
/// compression; everything unrecognized falls back to generic text handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// Rust source code
    RustSource,
    /// Rust test code (assertion-aware compression)
    TestSource,
    /// Markdown documents
    Markdown,
    /// JSON data
    Json,
    /// Configuration files (TOML/INI-like key = value)
    Config,
    /// Plain text
    Text,
}

impl ContentType {
    /// Classify a file by its path.
    ///
    /// Files under a `tests/` directory or whose stem ends in `_test`/`_tests`
    /// are treated as test sources.
    pub fn from_path(path: &Path) -> Self {
        let in_tests_dir = path
            .components()
            .any(|c| c.as_os_str() == "tests" || c.as_os_str() == "test");

        match path.extension().and_then(|e| e.to_str()) {
            Some("rs") => {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                if in_tests_dir || stem.ends_with("_test") || stem.ends_with("_tests") {
                    ContentType::TestSource
                } else {
                    ContentType::RustSource
                }
            }
            Some("md") | Some("markdown") => ContentType::Markdown,
            Some("json") => ContentType::Json,
            Some("toml") | Some("ini") | Some("cfg") | Some("conf") | Some("yaml")
            | Some("yml") => ContentType::Config,
            _ => ContentType::Text,
        }
    }
}

// ============================================================================
// Context Request
// ============================================================================

/// Task descriptor handed in by the orchestrator for each agent invocation.
///
/// Requests are immutable; the normalized fields (everything except nothing —
/// no timestamps are stored here by construction) hash to a stable cache key
/// via [`fingerprint`](ContextRequest::fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    /// Story/ticket identifier the agent is working on
    pub story_id: String,

    /// Kind of agent being invoked (e.g. "coder", "reviewer")
    pub agent_type: String,

    /// Current TDD phase
    pub tdd_phase: TddPhase,

    /// Free-form description of the task at hand
    pub task_description: String,

    /// Root of the project the agent operates on
    pub project_path: PathBuf,

    /// Requested compression aggressiveness
    pub compression_level: CompressionLevel,

    /// Hard token ceiling for the assembled context
    pub max_tokens: usize,

    /// Whether to include historical context from earlier invocations
    pub include_history: bool,

    /// Whether to include dependency excerpts from the code index
    pub include_dependencies: bool,

    /// Caller-supplied key/value extras; folded into the fingerprint in
    /// deterministic (sorted) order
    pub custom: BTreeMap<String, String>,
}

impl ContextRequest {
    /// Create a request with default flags and budget.
    pub fn new(
        story_id: impl Into<String>,
        agent_type: impl Into<String>,
        tdd_phase: TddPhase,
    ) -> Self {
        Self {
            story_id: story_id.into(),
            agent_type: agent_type.into(),
            tdd_phase,
            task_description: String::new(),
            project_path: PathBuf::new(),
            compression_level: CompressionLevel::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
            include_history: true,
            include_dependencies: true,
            custom: BTreeMap::new(),
        }
    }

    /// Stable cache key: SHA-256 over the normalized request fields.
    ///
    /// Two requests with equal normalized fields always produce the same
    /// fingerprint, regardless of when they were constructed.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.story_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.agent_type.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.tdd_phase.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.task_description.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.project_path.to_string_lossy().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.compression_level.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.max_tokens.to_le_bytes());
        hasher.update([self.include_history as u8, self.include_dependencies as u8]);
        for (key, value) in &self.custom {
            hasher.update([0x1f]);
            hasher.update(key.as_bytes());
            hasher.update([0x1e]);
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// Token Budget and Usage
// ============================================================================

/// Allocation of a total token budget into context segments.
///
/// Invariant: `core + dependencies + history == total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenBudget {
    /// Total token ceiling
    pub total: usize,

    /// Tokens for core content (task description + source files)
    pub core: usize,

    /// Tokens for dependency excerpts
    pub dependencies: usize,

    /// Tokens for historical and agent-memory content
    pub history: usize,
}

/// Tokens actually consumed by each segment of an assembled context.
///
/// There is deliberately no stored total: [`total`](TokenUsage::total) is
/// always the computed sum of the three parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Tokens used by core content
    pub core: usize,

    /// Tokens used by dependency excerpts
    pub dependencies: usize,

    /// Tokens used by historical/memory content
    pub history: usize,
}

impl TokenUsage {
    /// Create a usage record from per-segment counts.
    pub fn new(core: usize, dependencies: usize, history: usize) -> Self {
        Self {
            core,
            dependencies,
            history,
        }
    }

    /// Total tokens used; always the sum of the three segments.
    pub fn total(&self) -> usize {
        self.core + self.dependencies + self.history
    }

    /// Whether this usage fits within the given budget.
    pub fn fits(&self, budget: &TokenBudget) -> bool {
        self.total() <= budget.total
    }
}

// ============================================================================
// Agent Context
// ============================================================================

/// The bounded context package handed to an agent before task execution.
///
/// Built once per request (or reused from cache). The cache hands out clones,
/// so a caller mutating its copy never corrupts the cached entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    /// Unique identifier for this assembled context
    pub context_id: String,

    /// Rendered task description block
    pub task_context: String,

    /// Relevant file paths in relevance order
    pub relevant_files: Vec<PathBuf>,

    /// Path → (possibly compressed) content, iteration order == relevance order
    pub file_contents: IndexMap<PathBuf, String>,

    /// Dependency excerpts from the code index
    pub dependencies: String,

    /// Historical context from earlier invocations on the same story
    pub history: String,

    /// Agent memory for this (agent type, story) pair
    pub agent_memory: String,

    /// Budget the context was assembled against
    pub budget: TokenBudget,

    /// Actual token usage per segment
    pub usage: TokenUsage,

    /// Free-form metadata (flags like `budget_overrun`, provenance info)
    pub metadata: BTreeMap<String, String>,

    /// When this context was assembled
    pub created_at: DateTime<Utc>,

    /// Fingerprint of the originating request
    pub cache_key: String,
}

impl AgentContext {
    /// Approximate in-memory size in bytes, used for cache byte accounting.
    pub fn size_bytes(&self) -> usize {
        let files: usize = self
            .file_contents
            .iter()
            .map(|(p, c)| p.as_os_str().len() + c.len())
            .sum();
        let meta: usize = self.metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.task_context.len()
            + self.dependencies.len()
            + self.history.len()
            + self.agent_memory.len()
            + files
            + meta
            + self.cache_key.len()
            + self.context_id.len()
    }

    /// Whether the context was returned over budget after all escalation
    /// rounds. Overruns are always visible, never silently hidden.
    pub fn is_budget_overrun(&self) -> bool {
        self.metadata
            .get(BUDGET_OVERRUN_KEY)
            .is_some_and(|v| v == "true")
    }
}

// ============================================================================
// Compression Results
// ============================================================================

/// Result of a compression pass: the compressed text and the token ratio.
///
/// The ratio is `compressed_tokens / original_tokens`, always in `(0, 1]`,
/// and exactly `1.0` for empty or uncompressible input.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionOutcome {
    /// The compressed text
    pub text: String,

    /// Token ratio in (0, 1]
    pub ratio: f64,
}

impl CompressionOutcome {
    /// Build an outcome from token counts, clamping the ratio into `(0, 1]`.
    pub fn new(text: String, original_tokens: usize, compressed_tokens: usize) -> Self {
        let ratio = if original_tokens == 0 {
            1.0
        } else {
            (compressed_tokens.max(1) as f64 / original_tokens as f64).min(1.0)
        };
        Self { text, ratio }
    }

    /// Identity outcome for input that needs no compression.
    pub fn unchanged(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ratio: 1.0,
        }
    }
}

/// Projected compression effect, used for planning without compressing.
#[derive(Debug, Clone, Default)]
pub struct CompressionEstimate {
    /// Expected token ratio if compression were applied
    pub projected_ratio: f64,

    /// Human-readable descriptions of the elements that would be compressed
    pub compressible_elements: Vec<String>,
}

// ============================================================================
// Prediction Patterns
// ============================================================================

/// Category of a learned or registered prediction pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Key B is usually requested shortly after key A
    Sequential,
    /// Agent type B usually follows agent type A on the same story
    AgentTransition,
    /// Externally supplied feature-weighted relevance pattern
    FeatureBased,
}

/// A pattern learned from access history (or registered externally) that
/// predicts which requests are worth pre-warming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionPattern {
    /// Stable pattern identifier
    pub pattern_id: String,

    /// Pattern category
    pub pattern_type: PatternType,

    /// Conditions that trigger the pattern: cache keys, or `agent:{type}`
    /// markers for agent-transition patterns
    pub trigger_conditions: Vec<String>,

    /// Requests predicted to follow when the pattern triggers
    pub predicted_requests: Vec<ContextRequest>,

    /// Confidence in the prediction, 0.0–1.0
    pub confidence: f64,

    /// Fraction of predictions that later resulted in a cache hit
    pub success_rate: f64,

    /// How many times this pattern has fired
    pub usage_count: usize,
}

impl PredictionPattern {
    /// Create a pattern with no usage history yet.
    pub fn new(
        pattern_id: impl Into<String>,
        pattern_type: PatternType,
        trigger_conditions: Vec<String>,
        predicted_requests: Vec<ContextRequest>,
        confidence: f64,
    ) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            pattern_type,
            trigger_conditions,
            predicted_requests,
            confidence,
            success_rate: 0.0,
            usage_count: 0,
        }
    }

    /// Whether the given access matches one of the trigger conditions.
    pub fn matches(&self, cache_key: &str, agent_type: &str) -> bool {
        let agent_marker = format!("agent:{agent_type}");
        self.trigger_conditions
            .iter()
            .any(|c| c == cache_key || *c == agent_marker)
    }

    /// Fold an observed outcome into the running success rate.
    pub fn record_outcome(&mut self, hit: bool) {
        let observed = if hit { 1.0 } else { 0.0 };
        let n = self.usage_count as f64;
        self.success_rate = (self.success_rate * n + observed) / (n + 1.0);
        self.usage_count += 1;
    }
}

// ============================================================================
// Tests
// ============================================================================
