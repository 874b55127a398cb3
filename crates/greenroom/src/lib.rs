//! Greenroom - context preparation engine for TDD agent orchestration.
//!
//! Before each agent invocation the orchestrator needs a bounded-size
//! "context package": relevant source files, dependency excerpts, and prior
//! agent memory, all fitted into a hard token budget. Greenroom assembles
//! those packages, reuses them through a predictive cache, and shrinks
//! oversized content with multi-format compression.
//!
//! # Architecture
//!
//! - [`context::TokenEstimator`] / [`context::TokenBudget`]: pure helpers for
//!   token accounting and budget allocation
//! - [`context::ContextCompressor`]: multi-format content compression
//! - [`context::ContextCache`]: TTL cache with eviction, tagging, warming,
//!   and pattern-based prediction
//! - [`context::ContextManager`]: orchestrates the above plus external
//!   collaborators to answer "prepare a context for this request"
//! - [`memory::FileMemoryStore`]: file-backed agent memory persistence

pub mod context;
pub mod memory;

pub use context::{
    AgentContext, AgentMemory, CacheConfig, CacheStatistics, CompressionLevel, ContentType,
    ContextCache, ContextCompressor, ContextError, ContextFilter, ContextIndex, ContextManager,
    ContextRequest, ContextResult, ContextStorage, ManagerConfig, TokenBudget, TokenEstimator,
    TokenUsage,
};
pub use memory::FileMemoryStore;
