/// Tuning knobs for the sync engine and its background loops.
///
/// `Default` matches the production cadence; `low_bandwidth` widens the
/// intervals and throttles prefetch for constrained links.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded outbox read per flush pass (clamped to 1..=500 at read time).
    pub outbox_read_limit: usize,
    /// Maximum compact transmissions per article per flush pass.
    pub compact_max_passes: usize,
    /// Minimum interval between flush entries for one article.
    pub article_flush_min_interval_ms: u64,
    /// Minimum interval between structure snapshot transmissions per article.
    pub structure_min_interval_ms: u64,
    /// Fallback flush interval while the outbox holds pending ops.
    pub flush_interval_fast_ms: u64,
    /// Fallback flush interval while the outbox is drained.
    pub flush_interval_idle_ms: u64,
    /// Article index rows upserted per transaction so interactive writers
    /// can interleave between chunks.
    pub index_chunk: usize,
    /// Pause between article fetches during a full pull.
    pub full_pull_yield_ms: u64,
    /// Media prefetch poll interval.
    pub prefetch_poll_ms: u64,
    /// An asset with this many failures is retired from prefetch.
    pub prefetch_fail_cap: u32,
    /// Orphan media assets pruned per reconciliation sweep.
    pub media_prune_limit: usize,
    /// Wall-clock deadline for opening the embedded store.
    pub open_timeout_ms: u64,
    /// Deadline for the startup authentication probe.
    pub auth_probe_timeout_ms: u64,
    /// Upper bound on K for semantic top-K search.
    pub search_top_k_max: usize,
    /// Path prefix identifying uploads the media loops manage.
    pub uploads_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outbox_read_limit: 50,
            compact_max_passes: 2,
            article_flush_min_interval_ms: 2_000,
            structure_min_interval_ms: 3_000,
            flush_interval_fast_ms: 3_000,
            flush_interval_idle_ms: 30_000,
            index_chunk: 50,
            full_pull_yield_ms: 120,
            prefetch_poll_ms: 1_200,
            prefetch_fail_cap: 5,
            media_prune_limit: 500,
            open_timeout_ms: 3_000,
            auth_probe_timeout_ms: 8_000,
            search_top_k_max: 50,
            uploads_prefix: "/uploads/".to_string(),
        }
    }
}

impl EngineConfig {
    /// Profile for metered or slow links: rarer background work, smaller
    /// transports, prefetch effectively single-file.
    pub fn low_bandwidth() -> Self {
        Self {
            outbox_read_limit: 25,
            flush_interval_fast_ms: 6_000,
            flush_interval_idle_ms: 120_000,
            full_pull_yield_ms: 400,
            prefetch_poll_ms: 5_000,
            ..Self::default()
        }
    }
}
