//! The per-user embedded store.
//!
//! One SQLite database per user key holds every object store of the local
//! replica: the article cache, derived section/tag/media indices, section
//! embeddings, the durable outbox, pending uploads, and the process-wide
//! persistent flags (section sequences, outline queue, quick notes).
//!
//! Transactions are the only atomicity unit; every cross-store invariant
//! is either established inside one transaction or re-established on the
//! next cache write.

mod articles;
mod embeddings;
mod media;
mod meta;
mod outbox;
mod schema;
mod sections;
mod tags;
mod uploads;

pub use articles::{ArticleIndexRow, ArticleState, CacheWriteOutcome, CachedArticle};
pub use embeddings::{dot, normalize, EmbeddingRow, EmbeddingUpsert, SectionHit};
pub use media::{MediaAsset, MediaBlob, MediaStatus};
pub use meta::QuickNote;
pub use outbox::{
    DeleteSectionsPayload, EnqueueRequest, OpType, OutboxOp, SaveDocJsonPayload,
    SectionUpsertPayload, StructureSnapshotPayload,
};
pub use sections::StoredSection;
pub use tags::TagCount;
pub use uploads::{PendingUpload, UploadStatus};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::StoreError;

/// Handle to one user's embedded database.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    user_key: String,
    path: PathBuf,
    config: EngineConfig,
    outbox_gen: watch::Sender<u64>,
    embeddings_cache: Mutex<Option<Arc<Vec<EmbeddingRow>>>>,
}

impl Store {
    /// Opens (creating if needed) the database for `user_key` under `dir`.
    ///
    /// The key is sanitized to `[A-Za-z0-9_-]` and defaults to `anon`.
    /// Opening observes a wall-clock deadline: contention inside the
    /// deadline surfaces as [`StoreError::Blocked`], contention that
    /// exhausts it as [`StoreError::Timeout`].
    pub fn open(
        dir: impl AsRef<Path>,
        user_key: &str,
        config: &EngineConfig,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::from_dir_io(&e, dir))?;

        let user_key = sanitize_user_key(user_key);
        let path = dir.join(format!("{user_key}.db"));
        let deadline = Duration::from_millis(config.open_timeout_ms);
        let started = Instant::now();

        let mut conn = Connection::open(&path).map_err(StoreError::from_sqlite)?;
        conn.busy_timeout(deadline)
            .map_err(StoreError::from_sqlite)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::from_sqlite)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StoreError::from_sqlite)?;

        match schema::migrate(&mut conn) {
            Ok(()) => {}
            Err(StoreError::Blocked) if started.elapsed() >= deadline => {
                return Err(StoreError::Timeout(deadline));
            }
            Err(err) => return Err(err),
        }
        info!(user = %user_key, path = %path.display(), "store open");

        let (outbox_gen, _) = watch::channel(0);
        Ok(Self {
            conn: Mutex::new(conn),
            user_key,
            path,
            config: config.clone(),
            outbox_gen,
            embeddings_cache: Mutex::new(None),
        })
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribes to the outbox-changed signal: the value is a generation
    /// counter bumped on every enqueue or removal.
    pub fn outbox_changed(&self) -> watch::Receiver<u64> {
        self.outbox_gen.subscribe()
    }

    pub(crate) fn bump_outbox_gen(&self) {
        self.outbox_gen.send_modify(|gen| *gen = gen.wrapping_add(1));
    }

    /// Runs `f` with the connection locked. All store operations funnel
    /// through here so the lock is released on every exit path.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

/// Maps a raw user id or name onto a filesystem-safe database key.
pub fn sanitize_user_key(raw: &str) -> String {
    let key: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if key.is_empty() {
        "anon".to_string()
    } else {
        key
    }
}
