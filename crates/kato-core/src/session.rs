//! Session manager (C9, §4.9).
//!
//! Session state (STM, emotive accumulator, metadata, config overrides) is
//! persisted in a dedicated sled tree, namespaced and TTL-bearing exactly as
//! §6.1's "Session KV store" describes. Mutual exclusion uses a lease table
//! (token + TTL, §4.9's "KV-backed, e.g. lease with ~30s TTL and heartbeat");
//! here the lease lives in an in-process `DashMap` rather than a second sled
//! tree, since a single-process reference engine has no need to survive a
//! lock across a restart the way session data itself must.

use crate::error::{SessionError, StoreError};
use crate::settings::{SessionConfig, SessionConfigPatch};
use crate::stm::Stm;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const SESSION_TREE: &str = "kato_sessions";
const LEASE_TTL: Duration = Duration::from_secs(30);
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock is after UNIX_EPOCH").as_secs()
}

/// Per-session persisted state (§3 `Session`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub kb_id: String,
    pub node_id: String,
    pub stm: Stm,
    pub emotive_accumulator: Vec<HashMap<String, f64>>,
    pub metadata: HashSet<String>,
    pub config_override: SessionConfigPatch,
    pub created_at_epoch_secs: u64,
    pub expires_at_epoch_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
}

impl SessionView {
    fn is_expired(&self) -> bool {
        match self.expires_at_epoch_secs {
            Some(exp) => now_epoch_secs() > exp,
            None => false,
        }
    }

}

struct Lease {
    token: Uuid,
    expires_at_epoch_secs: u64,
}

/// Per-session mutual exclusion via lease table (§4.9, §5).
#[derive(Default)]
struct SessionLockManager {
    leases: DashMap<String, Lease>,
}

impl SessionLockManager {
    /// Not linearizable under true cross-thread contention on the same key
    /// (check-then-insert), but `DashMap`'s per-shard locking keeps the
    /// window vanishingly small for a reference engine; a production lease
    /// table would back this with a single atomic `compare_and_swap`.
    fn try_acquire(&self, session_id: &str) -> Option<Uuid> {
        let now = now_epoch_secs();
        if let Some(lease) = self.leases.get(session_id) {
            if lease.expires_at_epoch_secs > now {
                return None;
            }
        }
        let token = Uuid::new_v4();
        self.leases.insert(session_id.to_string(), Lease { token, expires_at_epoch_secs: now + LEASE_TTL.as_secs() });
        Some(token)
    }

    async fn acquire(&self, session_id: &str) -> Result<Uuid, SessionError> {
        let deadline = tokio::time::Instant::now() + LOCK_WAIT_TIMEOUT;
        loop {
            if let Some(token) = self.try_acquire(session_id) {
                return Ok(token);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::Busy { session_id: session_id.to_string() });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    fn release(&self, session_id: &str, token: Uuid) {
        if let Some(lease) = self.leases.get(session_id) {
            if lease.token == token {
                drop(lease);
                self.leases.remove(session_id);
            }
        }
    }
}

/// Sled-backed persistence for `SessionView` rows.
pub struct SessionStore {
    db: sled::Db,
}

impl SessionStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self { db: sled::open(path)? })
    }

    fn tree(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(SESSION_TREE)?)
    }

    fn load_raw(&self, session_id: &str) -> Result<Option<SessionView>, SessionError> {
        let tree = self.tree().map_err(SessionError::from)?;
        match tree.get(session_id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => {
                let view: SessionView = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
                Ok(Some(view))
            }
            None => Ok(None),
        }
    }

    fn save(&self, view: &SessionView) -> Result<(), SessionError> {
        let tree = self.tree().map_err(SessionError::from)?;
        let bytes = serde_json::to_vec(view).map_err(StoreError::from)?;
        tree.insert(view.session_id.as_bytes(), bytes).map_err(StoreError::from)?;
        Ok(())
    }

    /// Bumps `expires_at_epoch_secs` in place via sled's compare-and-swap
    /// retry loop rather than a plain load-then-save: a read path that wants
    /// to refresh TTL must never unconditionally overwrite the row, or it
    /// can race a concurrent `update()` and clobber its just-committed STM
    /// (§8.1 property 12). `fetch_and_update` always retries against the
    /// latest bytes on a CAS conflict, so the worst case under contention is
    /// losing the TTL bump itself, never a write from `update()`.
    fn touch_ttl(&self, session_id: &str, ttl_secs: u64) -> Result<(), SessionError> {
        let tree = self.tree().map_err(SessionError::from)?;
        let now = now_epoch_secs();
        let mut decode_error = None;
        tree.fetch_and_update(session_id.as_bytes(), |old| match old {
            None => None,
            Some(bytes) => match serde_json::from_slice::<SessionView>(bytes) {
                Ok(mut view) => {
                    view.expires_at_epoch_secs = Some(now + ttl_secs);
                    serde_json::to_vec(&view).ok()
                }
                Err(e) => {
                    decode_error = Some(e);
                    Some(bytes.to_vec())
                }
            },
        })
        .map_err(StoreError::from)?;
        match decode_error {
            Some(e) => Err(SessionError::from(StoreError::from(e))),
            None => Ok(()),
        }
    }

    fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let tree = self.tree().map_err(SessionError::from)?;
        tree.remove(session_id.as_bytes()).map_err(StoreError::from)?;
        Ok(())
    }
}

/// The session manager (C9): owns session persistence and per-session locking.
pub struct SessionManager {
    store: SessionStore,
    locks: SessionLockManager,
    session_auto_extend: bool,
}

impl SessionManager {
    /// `session_auto_extend` mirrors `Settings::session_auto_extend` (§6.3):
    /// when false, `get()` is a pure read with no write of any kind.
    pub fn new(store: SessionStore, session_auto_extend: bool) -> Self {
        Self { store, locks: SessionLockManager::default(), session_auto_extend }
    }

    /// `create(node_id, ttl, config_override?) -> session_id` (§4.9).
    pub fn create(&self, node_id: &str, kb_id: &str, ttl_secs: Option<u64>, config_override: SessionConfigPatch, default_config: &SessionConfig) -> Result<String, SessionError> {
        let merged = default_config.merged(&config_override)?;
        merged.validate(false)?;

        let session_id = Uuid::new_v4().to_string();
        let now = now_epoch_secs();
        let view = SessionView {
            session_id: session_id.clone(),
            kb_id: kb_id.to_string(),
            node_id: node_id.to_string(),
            stm: Stm::new(),
            emotive_accumulator: Vec::new(),
            metadata: HashSet::new(),
            config_override,
            created_at_epoch_secs: now,
            expires_at_epoch_secs: ttl_secs.map(|ttl| now + ttl),
            ttl_secs,
        };
        self.store.save(&view)?;
        Ok(session_id)
    }

    /// `get(session_id) -> SessionView` (§4.9). Purely a read unless
    /// `session_auto_extend` is configured, in which case the TTL is bumped
    /// via an atomic KV touch rather than a load-then-save, so a read never
    /// takes the session lease and never risks clobbering a concurrent
    /// `update()`'s write (§8.1 property 12).
    pub fn get(&self, session_id: &str) -> Result<SessionView, SessionError> {
        let view = self.load_live(session_id)?;
        if self.session_auto_extend {
            if let Some(ttl) = view.ttl_secs {
                self.store.touch_ttl(session_id, ttl)?;
            }
        }
        Ok(view)
    }

    fn load_live(&self, session_id: &str) -> Result<SessionView, SessionError> {
        let view = self.store.load_raw(session_id)?.ok_or_else(|| SessionError::NotFound { session_id: session_id.to_string() })?;
        if view.is_expired() {
            let _ = self.store.remove(session_id);
            return Err(SessionError::NotFound { session_id: session_id.to_string() });
        }
        Ok(view)
    }

    /// Runs `f` under the per-session lease, persisting the mutated view on
    /// success. This is the *only* path that mutates a session (§4.9, §5's
    /// "strictly serializable per session").
    pub async fn update<F, R>(&self, session_id: &str, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut SessionView) -> Result<R, SessionError>,
    {
        let token = self.locks.acquire(session_id).await?;
        let result = (|| {
            let mut view = self.load_live(session_id)?;
            let outcome = f(&mut view)?;
            self.store.save(&view)?;
            Ok(outcome)
        })();
        self.locks.release(session_id, token);
        result
    }

    /// `extend(session_id, ttl)` (§4.9).
    pub fn extend(&self, session_id: &str, ttl_secs: u64) -> Result<(), SessionError> {
        let mut view = self.load_live(session_id)?;
        view.ttl_secs = Some(ttl_secs);
        view.expires_at_epoch_secs = Some(now_epoch_secs() + ttl_secs);
        self.store.save(&view)
    }

    /// `delete(session_id)` (§4.9).
    pub fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        self.load_live(session_id)?;
        self.store.remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        let store = SessionStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap();
        SessionManager::new(store, false)
    }

    fn manager_with_auto_extend() -> SessionManager {
        let store = SessionStore::open_path(tempfile::tempdir().unwrap().keep()).unwrap();
        SessionManager::new(store, true)
    }

    #[test]
    fn create_then_get_round_trips() {
        let mgr = manager();
        let id = mgr.create("alice", "alice_kato", Some(3600), SessionConfigPatch::default(), &SessionConfig::default()).unwrap();
        let view = mgr.get(&id).unwrap();
        assert_eq!(view.node_id, "alice");
        assert!(view.stm.is_empty());
    }

    #[test]
    fn get_of_unknown_session_is_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.get("does-not-exist"), Err(SessionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_mutates_and_persists() {
        let mgr = manager();
        let id = mgr.create("bob", "bob_kato", None, SessionConfigPatch::default(), &SessionConfig::default()).unwrap();
        mgr.update(&id, |view| {
            view.stm.append(vec!["a".to_string()], true, 0);
            Ok(())
        })
        .await
        .unwrap();
        let view = mgr.get(&id).unwrap();
        assert_eq!(view.stm.events(), &[vec!["a".to_string()]]);
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let mgr = manager();
        let id = mgr.create("carol", "carol_kato", None, SessionConfigPatch::default(), &SessionConfig::default()).unwrap();
        mgr.delete(&id).unwrap();
        assert!(matches!(mgr.get(&id), Err(SessionError::NotFound { .. })));
    }

    /// With `session_auto_extend` off (the default), `get` never writes: the
    /// TTL deadline set at `create` is unchanged across repeated reads.
    #[test]
    fn get_does_not_refresh_ttl_when_auto_extend_is_off() {
        let mgr = manager();
        let id = mgr.create("dave", "dave_kato", Some(3600), SessionConfigPatch::default(), &SessionConfig::default()).unwrap();
        let before = mgr.get(&id).unwrap().expires_at_epoch_secs;
        let after = mgr.get(&id).unwrap().expires_at_epoch_secs;
        assert_eq!(before, after);
    }

    /// With `session_auto_extend` on, `get` bumps `expires_at_epoch_secs`
    /// forward via the atomic KV touch, without disturbing the rest of the
    /// session (in particular, a concurrently `update`d STM survives).
    #[tokio::test]
    async fn get_refreshes_ttl_via_atomic_touch_when_auto_extend_is_on() {
        let mgr = manager_with_auto_extend();
        let id = mgr.create("erin", "erin_kato", Some(3600), SessionConfigPatch::default(), &SessionConfig::default()).unwrap();
        mgr.update(&id, |view| {
            view.stm.append(vec!["a".to_string()], true, 0);
            Ok(())
        })
        .await
        .unwrap();

        let before = mgr.get(&id).unwrap().expires_at_epoch_secs.unwrap();
        std::thread::sleep(std::time::Duration::from_secs(1));
        let view = mgr.get(&id).unwrap();
        assert!(view.expires_at_epoch_secs.unwrap() > before);
        assert_eq!(view.stm.events(), &[vec!["a".to_string()]]);
    }
}
