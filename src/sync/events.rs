/// Observable engine events. Subscribers get a `tokio::sync::broadcast`
/// receiver; lagging subscribers lose old events rather than blocking the
/// engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The per-user store opened and the engine can serve reads.
    StoreReady,
    /// The store could not be opened; the engine is read-only online.
    StoreUnavailable { reason: String },
    /// A rejected content upsert was preserved as a sibling copy.
    OutlineSyncConflict {
        article_id: String,
        original_section_id: String,
        conflict_copy_section_id: String,
    },
    /// Background reconciliation progress.
    FullPull(FullPullPhase),
    /// A 401/403 stopped the flush queue.
    AuthRequired,
    /// One flush pass finished.
    FlushCompleted { transmitted: usize },
}

/// Phases of one full-pull sweep.
#[derive(Debug, Clone)]
pub enum FullPullPhase {
    Idle,
    Index,
    Articles { total: usize, completed: usize },
    Done { pulled: usize },
    Error { message: String },
}
