use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::ApiTransport;
use super::wire::UserInfo;

const SESSION_FILE: &str = "last_user.json";

/// A user the engine has seen before, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl From<&UserInfo> for UserRecord {
    fn from(user: &UserInfo) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCache {
    #[serde(default)]
    last_user: Option<UserRecord>,
    #[serde(default)]
    known_users: Vec<UserRecord>,
}

/// Outcome of the startup authentication probe.
#[derive(Debug, Clone)]
pub enum Session {
    /// The server confirmed the user.
    Online(UserInfo),
    /// No answer inside the deadline; running read-only offline as the
    /// last-known user.
    Offline(UserRecord),
    /// Nobody known; a fresh anonymous store.
    Anonymous,
}

impl Session {
    /// Key selecting the per-user database.
    pub fn store_key(&self) -> &str {
        match self {
            Session::Online(user) => &user.id,
            Session::Offline(user) => &user.id,
            Session::Anonymous => "anon",
        }
    }
}

/// Probes `GET /api/auth/me` raced against a deadline. A timeout or any
/// failure resolves to the last-known-user cache rather than an error, so
/// startup never blocks on the network.
pub async fn resolve_session(
    api: &dyn ApiTransport,
    data_dir: &Path,
    timeout_ms: u64,
) -> Session {
    let probe = tokio::time::timeout(Duration::from_millis(timeout_ms), api.get_me()).await;
    match probe {
        Ok(Ok(user)) => {
            remember_user(data_dir, &user);
            Session::Online(user)
        }
        Ok(Err(err)) => {
            debug!(%err, "auth probe failed; falling back to cached user");
            last_known_user(data_dir)
        }
        Err(_) => {
            debug!("auth probe timed out; falling back to cached user");
            last_known_user(data_dir)
        }
    }
}

/// The known-user list (for account pickers in offline mode).
pub fn known_users(data_dir: &Path) -> Vec<UserRecord> {
    read_cache(data_dir).known_users
}

fn last_known_user(data_dir: &Path) -> Session {
    match read_cache(data_dir).last_user {
        Some(user) => Session::Offline(user),
        None => Session::Anonymous,
    }
}

fn read_cache(data_dir: &Path) -> SessionCache {
    let path = data_dir.join(SESSION_FILE);
    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => SessionCache::default(),
    }
}

fn remember_user(data_dir: &Path, user: &UserInfo) {
    let mut cache = read_cache(data_dir);
    let record = UserRecord::from(user);
    cache.known_users.retain(|u| u.id != record.id);
    cache.known_users.push(record.clone());
    cache.last_user = Some(record);
    let path = data_dir.join(SESSION_FILE);
    let write = std::fs::create_dir_all(data_dir).and_then(|()| {
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&cache).unwrap_or_default(),
        )
    });
    if let Err(err) = write {
        warn!(path = %path.display(), %err, "could not persist session cache");
    }
}
