//! Persistent multi-layer context memory for a conversational assistant.
//!
//! The engine keeps five memory layers (conversation, strategic, stakeholder,
//! learning, organizational) over a hybrid persistence stack: a canonical
//! SQLite structured store, a rebuildable vector index for semantic search,
//! and a rebuildable analytics store. Reads fan out across the layers in
//! parallel and degrade gracefully behind per-(layer, store) circuit
//! breakers; writes commit synchronously and are embedded in the background.
//!
//! ```no_run
//! use strata_memory::context_engine::{ContextBudget, ContextQuery, ContextScope};
//! use strata_memory::{ContextEngine, EngineConfig, EventDraft, MemoryLayer};
//!
//! # async fn demo() -> strata_memory::Result<()> {
//! let engine = ContextEngine::open(EngineConfig::from_env()?)?;
//!
//! engine
//!     .record_event(
//!         MemoryLayer::Strategic,
//!         EventDraft::text("kickoff for the billing migration")
//!             .with_meta("initiative_id", "billing-migration")
//!             .with_meta("initiative_status", "active"),
//!     )
//!     .await?;
//!
//! let context = engine
//!     .get_context(
//!         ContextQuery::text("how is the billing migration going"),
//!         ContextScope::default(),
//!         ContextBudget::default(),
//!     )
//!     .await?;
//! # let _ = context;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod config;
pub mod context_engine;
pub mod engine;
pub mod error;
pub mod layers;
pub mod memory_db;
pub mod scoring;
pub mod telemetry;
pub mod vector_index;

pub use config::EngineConfig;
pub use context_engine::{
    BreakerConfig, BreakerState, ContextBudget, ContextQuery, ContextScope, StoreKind,
};
pub use engine::{ContextEngine, EngineStats, RebuildReport};
pub use error::{MemoryError, Result};
pub use layers::{EventDraft, LayerDigest, LayerModule, LayerRegistry};
pub use memory_db::schema::{
    ContextRecord, Initiative, InitiativeStatus, MemoryLayer, QueryResult, RankedRecord,
    RetrievalSource, StakeholderProfile,
};
pub use vector_index::{Embedder, HashingEmbedder};
