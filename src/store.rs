//! Session Store and Room Index.
//!
//! Sessions live under `session:<connectionId>` with a TTL; each room keeps
//! a membership set under `room:<roomName>`. The shared (redis) backend is
//! the source of truth for multi-instance deployments; when it is
//! unreachable every operation falls back to an in-process mapping and the
//! result is marked `Source::Local` so callers and operators can tell the
//! two paths apart.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::error::Error;

/// The record binding one live connection to one user identity and one room.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub room: String,
}

fn session_key(conn_id: &str) -> String {
    format!("session:{conn_id}")
}

fn room_key(room: &str) -> String {
    format!("room:{room}")
}

/// Which path served an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// Served by the shared store, visible to every process.
    Shared,
    /// Served by this process's fallback mapping (degraded or
    /// single-instance mode). Invisible to other processes.
    Local,
}

/// Operation result tagged with the path that produced it.
#[derive(Debug)]
pub struct Served<T> {
    pub value: T,
    pub source: Source,
}

/// Storage operations behind the Session Store. Implemented by the shared
/// redis backend and by the in-process fallback.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn insert(&self, session: &Session, ttl: Duration) -> Result<(), Error>;
    async fn fetch(&self, conn_id: &str) -> Result<Option<Session>, Error>;
    async fn remove(&self, conn_id: &str) -> Result<Option<Session>, Error>;
    async fn touch(&self, conn_id: &str, ttl: Duration) -> Result<(), Error>;
    /// Raw membership set for a room. May contain stale entries; readers
    /// filter against live sessions.
    async fn members(&self, room: &str) -> Result<HashSet<String>, Error>;
    async fn count(&self, room: &str) -> Result<usize, Error>;
    /// Assigns a TTL to any session record found without one. Returns the
    /// number of records repaired.
    async fn sweep(&self, ttl: Duration) -> Result<usize, Error>;
}

/// Shared backend over redis.
pub struct RedisBackend {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBackend {
    pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
        RedisBackend { conn }
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    async fn insert(&self, session: &Session, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(session)?;
        let _: () = conn
            .set_ex(session_key(&session.id), encoded, ttl.as_secs())
            .await?;
        let _: () = conn.sadd(room_key(&session.room), &session.id).await?;
        Ok(())
    }

    async fn fetch(&self, conn_id: &str) -> Result<Option<Session>, Error> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(session_key(conn_id)).await?;
        match raw {
            Some(encoded) => match serde_json::from_str(&encoded) {
                Ok(session) => Ok(Some(session)),
                Err(err) => {
                    warn!("dropping corrupt session record for {conn_id}: {err}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, conn_id: &str) -> Result<Option<Session>, Error> {
        let mut conn = self.conn.clone();
        let Some(session) = self.fetch(conn_id).await? else {
            return Ok(None);
        };
        let _: () = conn.del(session_key(conn_id)).await?;
        let _: () = conn.srem(room_key(&session.room), conn_id).await?;
        Ok(Some(session))
    }

    async fn touch(&self, conn_id: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(session_key(conn_id), ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn members(&self, room: &str) -> Result<HashSet<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(room_key(room)).await?)
    }

    async fn count(&self, room: &str) -> Result<usize, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(room_key(room)).await?)
    }

    async fn sweep(&self, ttl: Duration) -> Result<usize, Error> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("session:*").await?;
        let mut repaired = 0;
        for key in keys {
            let remaining: i64 = conn.ttl(&key).await?;
            // -1 means the key exists but carries no expiry
            if remaining == -1 {
                let _: bool = conn.expire(&key, ttl.as_secs() as i64).await?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

struct MemoryRecord {
    session: Session,
    expires_at: Option<Instant>,
}

/// In-process backend. Primary store for single-instance deployments and
/// fallback target when the shared store is unreachable.
#[derive(Default)]
pub struct MemoryBackend {
    sessions: RwLock<HashMap<String, MemoryRecord>>,
    rooms: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

fn live(record: &MemoryRecord) -> bool {
    record.expires_at.is_none_or(|at| at > Instant::now())
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn insert(&self, session: &Session, ttl: Duration) -> Result<(), Error> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.id.clone(),
            MemoryRecord {
                session: session.clone(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        drop(sessions);

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(session.room.clone())
            .or_default()
            .insert(session.id.clone());
        Ok(())
    }

    async fn fetch(&self, conn_id: &str) -> Result<Option<Session>, Error> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(conn_id)
            .filter(|record| live(record))
            .map(|record| record.session.clone()))
    }

    async fn remove(&self, conn_id: &str) -> Result<Option<Session>, Error> {
        let mut sessions = self.sessions.write().await;
        let Some(record) = sessions.remove(conn_id) else {
            return Ok(None);
        };
        drop(sessions);

        let mut rooms = self.rooms.write().await;
        if let Some(set) = rooms.get_mut(&record.session.room) {
            set.remove(conn_id);
            if set.is_empty() {
                rooms.remove(&record.session.room);
            }
        }
        Ok(live(&record).then_some(record.session))
    }

    async fn touch(&self, conn_id: &str, ttl: Duration) -> Result<(), Error> {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(conn_id) {
            record.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn members(&self, room: &str) -> Result<HashSet<String>, Error> {
        let rooms = self.rooms.read().await;
        Ok(rooms.get(room).cloned().unwrap_or_default())
    }

    async fn count(&self, room: &str) -> Result<usize, Error> {
        let rooms = self.rooms.read().await;
        Ok(rooms.get(room).map_or(0, HashSet::len))
    }

    async fn sweep(&self, ttl: Duration) -> Result<usize, Error> {
        let mut sessions = self.sessions.write().await;
        let mut repaired = 0;
        for record in sessions.values_mut() {
            if record.expires_at.is_none() {
                record.expires_at = Some(Instant::now() + ttl);
                repaired += 1;
            }
        }
        sessions.retain(|_, record| live(record));
        Ok(repaired)
    }
}

/// Fronts the shared backend with a local fallback and a degraded-mode
/// flag. Every shared round-trip is bounded by the configured timeout.
pub struct SessionStore {
    shared: Option<Arc<dyn SessionBackend>>,
    local: Arc<MemoryBackend>,
    degraded: AtomicBool,
    ttl: Duration,
    timeout: Duration,
}

impl SessionStore {
    /// Multi-instance mode: shared backend with local fallback.
    pub fn shared(backend: Arc<dyn SessionBackend>, ttl: Duration, timeout: Duration) -> Self {
        SessionStore {
            shared: Some(backend),
            local: Arc::new(MemoryBackend::new()),
            degraded: AtomicBool::new(false),
            ttl,
            timeout,
        }
    }

    /// Single-instance mode: in-process state only, no cross-process
    /// visibility.
    pub fn local(ttl: Duration) -> Self {
        SessionStore {
            shared: None,
            local: Arc::new(MemoryBackend::new()),
            degraded: AtomicBool::new(false),
            ttl,
            timeout: Duration::ZERO,
        }
    }

    /// True while operations are being served from the local fallback
    /// because the shared store is unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn mark_degraded(&self, op: &str, err: &Error) {
        if self.degraded.swap(true, Ordering::Relaxed) {
            debug!("shared store still unreachable ({op}): {err}");
        } else {
            warn!("shared store unreachable, falling back to local state ({op}): {err}");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("shared store recovered; sessions created during the outage stay local");
        }
    }

    /// Runs a shared-backend operation under the store timeout. `Ok` is the
    /// shared result; `Err` means the caller must fall back.
    async fn try_shared<T, F>(&self, op: &str, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = Result<T, Error>>,
    {
        self.shared.as_ref()?;
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.mark_healthy();
                Some(value)
            }
            Ok(Err(err)) => {
                self.mark_degraded(op, &err);
                None
            }
            Err(_) => {
                self.mark_degraded(op, &Error::StoreTimeout(self.timeout));
                None
            }
        }
    }

    /// Creates or overwrites the session and adds the connection to the
    /// room's membership set. A rejoin into a different room drops the old
    /// membership first, so a connection is never in two sets at once.
    pub async fn join(&self, conn_id: &str, name: &str, room: &str) -> Served<Session> {
        let session = Session {
            id: conn_id.to_string(),
            name: name.to_string(),
            room: room.to_string(),
        };

        if let Some(backend) = self.shared.clone() {
            let outcome = self
                .try_shared("join", Self::insert_via(backend.as_ref(), &session, self.ttl))
                .await;
            if outcome.is_some() {
                return Served { value: session, source: Source::Shared };
            }
        }

        if let Err(err) = Self::insert_via(self.local.as_ref(), &session, self.ttl).await {
            warn!("local session insert failed for {conn_id}: {err}");
        }
        Served { value: session, source: Source::Local }
    }

    async fn insert_via(
        backend: &dyn SessionBackend,
        session: &Session,
        ttl: Duration,
    ) -> Result<(), Error> {
        if let Some(old) = backend.fetch(&session.id).await? {
            if old.room != session.room {
                backend.remove(&session.id).await?;
            }
        }
        backend.insert(session, ttl).await
    }

    /// Looks up the session for a connection, renewing its TTL on a hit.
    pub async fn get(&self, conn_id: &str) -> Served<Option<Session>> {
        if let Some(backend) = self.shared.clone() {
            let fut = async {
                let found = backend.fetch(conn_id).await?;
                if found.is_some() {
                    backend.touch(conn_id, self.ttl).await?;
                }
                Ok(found)
            };
            if let Some(found) = self.try_shared("get", fut).await {
                return Served { value: found, source: Source::Shared };
            }
        }

        let found = self.local.fetch(conn_id).await.unwrap_or_default();
        if found.is_some() {
            let _ = self.local.touch(conn_id, self.ttl).await;
        }
        Served { value: found, source: Source::Local }
    }

    /// Removes the session and its membership entry. Returns the session
    /// that was joined, or `None` for a connection that never joined.
    pub async fn leave(&self, conn_id: &str) -> Served<Option<Session>> {
        if let Some(backend) = self.shared.clone() {
            if let Some(removed) = self.try_shared("leave", backend.remove(conn_id)).await {
                return Served { value: removed, source: Source::Shared };
            }
        }

        let removed = self.local.remove(conn_id).await.unwrap_or_default();
        Served { value: removed, source: Source::Local }
    }

    /// TTL renewal without touching membership.
    pub async fn touch(&self, conn_id: &str) -> Served<()> {
        if let Some(backend) = self.shared.clone() {
            if self
                .try_shared("touch", backend.touch(conn_id, self.ttl))
                .await
                .is_some()
            {
                return Served { value: (), source: Source::Shared };
            }
        }

        let _ = self.local.touch(conn_id, self.ttl).await;
        Served { value: (), source: Source::Local }
    }

    /// Room Index: connection ids currently in a room. Set entries with no
    /// live session are stale and skipped; TTL expiry cleans them up.
    pub async fn members(&self, room: &str) -> Served<HashSet<String>> {
        if let Some(backend) = self.shared.clone() {
            let fut = async {
                let raw = backend.members(room).await?;
                let mut alive = HashSet::with_capacity(raw.len());
                for conn_id in raw {
                    if backend.fetch(&conn_id).await?.is_some() {
                        alive.insert(conn_id);
                    }
                }
                Ok(alive)
            };
            if let Some(alive) = self.try_shared("members", fut).await {
                return Served { value: alive, source: Source::Shared };
            }
        }

        let raw = self.local.members(room).await.unwrap_or_default();
        let mut alive = HashSet::with_capacity(raw.len());
        for conn_id in raw {
            if matches!(self.local.fetch(&conn_id).await, Ok(Some(_))) {
                alive.insert(conn_id);
            }
        }
        Served { value: alive, source: Source::Local }
    }

    /// Room Index: membership-set cardinality, uncorrected for stale
    /// entries (they disappear with TTL expiry).
    pub async fn count(&self, room: &str) -> Served<usize> {
        if let Some(backend) = self.shared.clone() {
            if let Some(count) = self.try_shared("count", backend.count(room)).await {
                return Served { value: count, source: Source::Shared };
            }
        }

        let count = self.local.count(room).await.unwrap_or_default();
        Served { value: count, source: Source::Local }
    }

    async fn sweep_once(&self) {
        let outcome = if let Some(backend) = self.shared.clone() {
            self.try_shared("sweep", backend.sweep(self.ttl)).await
        } else {
            self.local.sweep(self.ttl).await.ok()
        };
        match outcome {
            Some(0) | None => {}
            Some(repaired) => info!("sweep assigned a TTL to {repaired} session record(s)"),
        }
    }

    /// Starts the periodic TTL sweep. The task is owned by the returned
    /// handle and stops when `SweepHandle::stop` is awaited.
    pub fn spawn_sweep(self: &Arc<Self>, interval: Duration) -> SweepHandle {
        let store = Arc::clone(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.sweep_once().await,
                    _ = stop_rx.changed() => break,
                }
            }
        });
        SweepHandle { stop: stop_tx, task }
    }
}

/// Handle to the background sweep task.
pub struct SweepHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_store() -> Arc<SessionStore> {
        Arc::new(SessionStore::local(Duration::from_secs(3600)))
    }

    /// Backend that fails every call, standing in for an unreachable store.
    struct UnreachableBackend;

    #[async_trait]
    impl SessionBackend for UnreachableBackend {
        async fn insert(&self, _: &Session, _: Duration) -> Result<(), Error> {
            Err(Error::StoreTimeout(Duration::ZERO))
        }
        async fn fetch(&self, _: &str) -> Result<Option<Session>, Error> {
            Err(Error::StoreTimeout(Duration::ZERO))
        }
        async fn remove(&self, _: &str) -> Result<Option<Session>, Error> {
            Err(Error::StoreTimeout(Duration::ZERO))
        }
        async fn touch(&self, _: &str, _: Duration) -> Result<(), Error> {
            Err(Error::StoreTimeout(Duration::ZERO))
        }
        async fn members(&self, _: &str) -> Result<HashSet<String>, Error> {
            Err(Error::StoreTimeout(Duration::ZERO))
        }
        async fn count(&self, _: &str) -> Result<usize, Error> {
            Err(Error::StoreTimeout(Duration::ZERO))
        }
        async fn sweep(&self, _: Duration) -> Result<usize, Error> {
            Err(Error::StoreTimeout(Duration::ZERO))
        }
    }

    /// Backend whose failures can be switched on and off, standing in
    /// for a shared store that goes down and comes back.
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            FlakyBackend {
                inner: MemoryBackend::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn check(&self) -> Result<(), Error> {
            if self.failing.load(Ordering::SeqCst) {
                Err(Error::StoreTimeout(Duration::ZERO))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SessionBackend for FlakyBackend {
        async fn insert(&self, session: &Session, ttl: Duration) -> Result<(), Error> {
            self.check()?;
            self.inner.insert(session, ttl).await
        }
        async fn fetch(&self, conn_id: &str) -> Result<Option<Session>, Error> {
            self.check()?;
            self.inner.fetch(conn_id).await
        }
        async fn remove(&self, conn_id: &str) -> Result<Option<Session>, Error> {
            self.check()?;
            self.inner.remove(conn_id).await
        }
        async fn touch(&self, conn_id: &str, ttl: Duration) -> Result<(), Error> {
            self.check()?;
            self.inner.touch(conn_id, ttl).await
        }
        async fn members(&self, room: &str) -> Result<HashSet<String>, Error> {
            self.check()?;
            self.inner.members(room).await
        }
        async fn count(&self, room: &str) -> Result<usize, Error> {
            self.check()?;
            self.inner.count(room).await
        }
        async fn sweep(&self, ttl: Duration) -> Result<usize, Error> {
            self.check()?;
            self.inner.sweep(ttl).await
        }
    }

    #[tokio::test]
    async fn recovery_clears_degraded_without_reconciling_local_state() {
        let flaky = Arc::new(FlakyBackend::new());
        let store = Arc::new(SessionStore::shared(
            flaky.clone(),
            Duration::from_secs(3600),
            Duration::from_millis(50),
        ));

        flaky.failing.store(true, Ordering::SeqCst);
        let joined = store.join("c1", "Alice", "general").await;
        assert_eq!(joined.source, Source::Local);
        assert!(store.is_degraded());

        flaky.failing.store(false, Ordering::SeqCst);
        let joined = store.join("c2", "Bob", "general").await;
        assert_eq!(joined.source, Source::Shared);
        assert!(!store.is_degraded());

        // the outage-era session stays local, invisible to the shared path
        let got = store.get("c1").await;
        assert_eq!(got.source, Source::Shared);
        assert!(got.value.is_none());
        assert_eq!(store.count("general").await.value, 1);
    }

    #[tokio::test]
    async fn join_then_get_returns_the_joined_room() {
        let store = local_store();
        store.join("c1", "Alice", "general").await;

        let got = store.get("c1").await;
        let session = got.value.unwrap();
        assert_eq!(session.room, "general");
        assert_eq!(session.name, "Alice");
    }

    #[tokio::test]
    async fn leave_returns_joined_session_and_not_found_otherwise() {
        let store = local_store();
        store.join("c1", "Alice", "general").await;

        let left = store.leave("c1").await;
        assert_eq!(left.value.unwrap().name, "Alice");

        assert!(store.leave("c1").await.value.is_none());
        assert!(store.leave("never-joined").await.value.is_none());
    }

    #[tokio::test]
    async fn count_tracks_joined_sessions() {
        let store = local_store();
        store.join("c1", "Alice", "general").await;
        store.join("c2", "Bob", "general").await;
        store.join("c3", "Carol", "other").await;

        assert_eq!(store.count("general").await.value, 2);
        assert_eq!(store.count("other").await.value, 1);

        store.leave("c2").await;
        assert_eq!(store.count("general").await.value, 1);
    }

    #[tokio::test]
    async fn rejoin_moves_the_connection_between_rooms() {
        let store = local_store();
        store.join("c1", "Alice", "general").await;
        store.join("c1", "Alice", "random").await;

        assert_eq!(store.count("general").await.value, 0);
        assert_eq!(store.count("random").await.value, 1);
        assert_eq!(store.get("c1").await.value.unwrap().room, "random");
    }

    #[tokio::test]
    async fn touch_keeps_a_session_alive_past_its_original_ttl() {
        let store = Arc::new(SessionStore::local(Duration::from_millis(40)));
        store.join("c1", "Alice", "general").await;

        tokio::time::sleep(Duration::from_millis(25)).await;
        store.touch("c1").await;
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(store.get("c1").await.value.is_some());
    }

    #[tokio::test]
    async fn members_skips_entries_without_a_live_session() {
        let store = Arc::new(SessionStore::local(Duration::from_millis(5)));
        store.join("c1", "Alice", "general").await;
        store.join("c2", "Bob", "general").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let members = store.members("general").await;
        assert!(members.value.is_empty());
    }

    #[tokio::test]
    async fn unreachable_shared_store_serves_from_local_fallback() {
        let store = Arc::new(SessionStore::shared(
            Arc::new(UnreachableBackend),
            Duration::from_secs(3600),
            Duration::from_millis(50),
        ));

        let joined = store.join("c1", "Alice", "general").await;
        assert_eq!(joined.source, Source::Local);
        assert!(store.is_degraded());

        let got = store.get("c1").await;
        assert_eq!(got.source, Source::Local);
        assert_eq!(got.value.unwrap().room, "general");

        let left = store.leave("c1").await;
        assert_eq!(left.source, Source::Local);
        assert!(left.value.is_some());
    }

    #[tokio::test]
    async fn single_instance_mode_is_always_local() {
        let store = local_store();
        let joined = store.join("c1", "Alice", "general").await;
        assert_eq!(joined.source, Source::Local);
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn memory_sweep_assigns_missing_ttls_and_drops_expired() {
        let backend = MemoryBackend::new();
        let session = Session {
            id: "c1".into(),
            name: "Alice".into(),
            room: "general".into(),
        };
        backend.insert(&session, Duration::from_secs(3600)).await.unwrap();
        backend.sessions.write().await.get_mut("c1").unwrap().expires_at = None;

        let repaired = backend.sweep(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(repaired, 1);
        assert!(backend.fetch("c1").await.unwrap().is_some());
    }
}
