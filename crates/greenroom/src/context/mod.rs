//! Context preparation engine.
//!
//! Everything needed to turn a [`ContextRequest`] into a bounded
//! [`AgentContext`]: token estimation and budgeting, multi-format
//! compression, the predictive cache, and the manager that orchestrates
//! them against injected collaborators.

pub mod cache;
pub mod compressor;
pub mod manager;
pub mod token_estimator;
pub mod types;

#[cfg(test)]
mod cache_property_tests;

pub use cache::{
    CacheConfig, CacheStatistics, ContextCache, EvictionStrategy, WarmingPriority, WarmingStrategy,
};
pub use compressor::{CompressorConfig, CompressorStats, ContextCompressor, EstimatorFn};
pub use manager::{
    AgentMemory, ContextFilter, ContextIndex, ContextManager, ContextStorage, ManagerConfig,
    PerformanceMetrics,
};
pub use token_estimator::TokenEstimator;
pub use types::{
    AgentContext, CompressionEstimate, CompressionLevel, CompressionOutcome, ContentType,
    ContextError, ContextRequest, PatternType, PredictionPattern, TddPhase, TokenBudget,
    TokenUsage,
};

/// Convenience result alias for context operations.
pub type ContextResult<T> = Result<T, ContextError>;
