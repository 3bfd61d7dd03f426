use crate::directive::{ThinkLevel, VerboseLevel};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

pub const GLOBAL_SESSION_KEY: &str = "__global__";

/// One conversation thread with an external agent.
///
/// Persisted verbatim in the store file; message bodies are never stored.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub system_sent: bool,
    #[serde(default)]
    pub think_default: Option<ThinkLevel>,
    #[serde(default)]
    pub verbose_default: Option<VerboseLevel>,
    #[serde(default)]
    pub abort_pending: bool,
}

impl Session {
    fn fresh(now_ms: u64) -> Self {
        Self {
            id: new_session_id(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            system_sent: false,
            think_default: None,
            verbose_default: None,
            abort_pending: false,
        }
    }

    pub fn expired(&self, now_ms: u64, idle_minutes: u64) -> bool {
        now_ms.saturating_sub(self.updated_at_ms) > idle_minutes.saturating_mul(60_000)
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedSession {
    pub session: Session,
    pub is_new: bool,
    pub is_first_turn: bool,
}

/// Durable session map with a single-writer lock.
///
/// The reply engine is the only writer; every mutation flushes the whole map
/// with an atomic replace. A failed flush keeps the in-memory map
/// authoritative and is retried implicitly by the next mutation.
pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn load(path: PathBuf) -> Self {
        let map = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, Session>>(&raw) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!("session store decode failed, starting empty: {err}");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                tracing::warn!("session store read failed, starting empty: {err}");
                HashMap::new()
            }
        };
        Self {
            path,
            inner: Mutex::new(map),
        }
    }

    /// Fetch the session for `key`, creating a fresh one when none exists,
    /// the stored one has idled out, or a reset was requested. Never mutates
    /// `updated_at_ms` of an existing session.
    pub async fn resolve(&self, key: &str, reset: bool, idle_minutes: u64) -> ResolvedSession {
        let now = now_ms();
        let mut map = self.inner.lock().await;
        let replace = match map.get(key) {
            None => true,
            Some(session) => reset || session.expired(now, idle_minutes),
        };
        if replace {
            let session = Session::fresh(now);
            map.insert(key.to_string(), session.clone());
            persist(&self.path, &map);
            return ResolvedSession {
                session,
                is_new: true,
                is_first_turn: true,
            };
        }
        let session = map
            .get(key)
            .cloned()
            .unwrap_or_else(|| Session::fresh(now));
        let is_first_turn = !session.system_sent;
        ResolvedSession {
            session,
            is_new: false,
            is_first_turn,
        }
    }

    /// Mark user activity. Heartbeats never call this.
    pub async fn touch(&self, key: &str) {
        self.for_session(key, |session| {
            session.updated_at_ms = now_ms();
        })
        .await;
    }

    pub async fn set_system_sent(&self, key: &str) {
        self.for_session(key, |session| session.system_sent = true)
            .await;
    }

    pub async fn set_think_default(&self, key: &str, level: ThinkLevel) {
        self.for_session(key, |session| session.think_default = Some(level))
            .await;
    }

    pub async fn set_verbose_default(&self, key: &str, level: VerboseLevel) {
        self.for_session(key, |session| session.verbose_default = Some(level))
            .await;
    }

    pub async fn set_abort_pending(&self, key: &str, pending: bool) {
        self.for_session(key, |session| session.abort_pending = pending)
            .await;
    }

    /// Atomic read-modify-write on one session. No-op when the key is absent.
    pub async fn for_session<F>(&self, key: &str, updater: F)
    where
        F: FnOnce(&mut Session),
    {
        let mut map = self.inner.lock().await;
        if let Some(session) = map.get_mut(key) {
            updater(session);
            persist(&self.path, &map);
        }
    }

    pub async fn snapshot(&self, key: &str) -> Option<Session> {
        self.inner.lock().await.get(key).cloned()
    }

    /// Immutable view of every stored session, for the heartbeat sweep.
    pub async fn all(&self) -> Vec<(String, Session)> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(key, session)| (key.clone(), session.clone()))
            .collect()
    }
}

fn persist(path: &Path, map: &HashMap<String, Session>) {
    if let Err(err) = try_persist(path, map) {
        tracing::error!("session store write failed: {err}");
    }
}

fn try_persist(path: &Path, map: &HashMap<String, Session>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(map).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, format!("{data}\n"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

pub fn session_key(scope: common::config::SessionScope, from: &str) -> String {
    match scope {
        common::config::SessionScope::PerSender => from.to_string(),
        common::config::SessionScope::Global => GLOBAL_SESSION_KEY.to_string(),
    }
}
