//! # Arbor - Offline Outline Sync Engine
//!
//! Arbor keeps a browser-style local replica of a tree of outline
//! "articles" consistent with a central server across intermittent
//! connectivity, concurrent edits, and local structural reorderings.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbor::{EngineConfig, HttpClient, Store, SyncEngine};
//!
//! # async fn demo() -> arbor::Result<()> {
//! let config = EngineConfig::default();
//! let store = Arc::new(Store::open("/var/lib/arbor", "alice", &config)?);
//! let api = Arc::new(HttpClient::new("https://notes.example.com".parse().unwrap())?);
//! let engine = Arc::new(SyncEngine::new(store, api, config));
//!
//! // Local edits sit in the outbox; a flush pass transmits them in order.
//! engine.flush_outbox_once().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Arbor uses a layered architecture:
//! - **Store Layer**: one embedded SQLite database per user holding the
//!   article cache, derived indices, embeddings, media state, and the
//!   durable outbox of pending operations.
//! - **Doc Layer**: walkers and patchers over the `docJson` outline tree.
//! - **Sync Layer**: the ordered outline flush protocol, conflict-copy
//!   materialization, background full-pull reconciliation, and the media
//!   prefetch loop.
//! - **Glue**: a cooperative scheduler driven by online / visibility /
//!   outbox-changed signals plus a fallback interval.

pub mod clock;
pub mod config;
pub mod doc;
pub mod error;
pub mod logging;
pub mod quicknotes;
pub mod status;
pub mod store;
pub mod sync;

// Re-export the main public API
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::EngineConfig;
pub use crate::error::{EngineError, HttpError, Result, StoreError};
pub use crate::quicknotes::QuickNotesBridge;
pub use crate::status::OfflineCoverage;
pub use crate::store::{sanitize_user_key, CachedArticle, OpType, OutboxOp, Store};
pub use crate::sync::{
    ApiTransport, FullPullPhase, HttpClient, MediaPrefetcher, SyncEngine, SyncEvent, SyncScheduler,
};
