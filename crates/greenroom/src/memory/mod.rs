//! Agent memory persistence.
//!
//! One JSON file per `(agent_type, story_id)` pair, with an in-memory cache
//! in front. The orchestrator uses this to carry agent decisions across
//! invocations on the same story.

pub mod store;

pub use store::FileMemoryStore;
