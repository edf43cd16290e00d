//! Retrieval orchestration, background indexing, and failure isolation.

pub mod breaker;
pub mod indexer;
pub mod orchestrator;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, StoreKind};
pub use indexer::{BackgroundIndexer, IndexJob};
pub use orchestrator::{ContextBudget, ContextQuery, ContextScope, Orchestrator, RetrievalTuning};
