//! Runtime map of live sessions, backed by the session store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use docent_core::error::DocentError;
use docent_core::types::SessionRecord;
use docent_storage::SessionStore;

use crate::error::ChatError;
use crate::session::{Session, SessionSnapshot, SessionSummary};

/// A session behind its exchange lock.
pub type SharedSession = Arc<Mutex<Session>>;

/// Live sessions keyed by id.
///
/// The map lock is only held to look up or insert entries, never across an
/// await. Each session has its own async mutex, held for a whole exchange.
/// Store writes run on the blocking pool.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
    store: Arc<SessionStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Create a session and persist it. An existing id is returned as is.
    pub async fn create(&self, id: Option<String>) -> Result<SessionSummary, ChatError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = self.acquire(&id).await?;
        let record = session.to_record();
        if self.store.get(&id).is_some() {
            return Ok(SessionSummary::from(&record));
        }

        self.persist(&session).await?;
        info!(session_id = %id, "Session created");
        Ok(SessionSummary::from(&record))
    }

    /// Live session for `id`, hydrated from the store or created if unknown.
    ///
    /// The handle may be retired by a concurrent delete before it is locked;
    /// use [`acquire`](Self::acquire) to lock a live session.
    pub fn get_or_create(&self, id: &str) -> Result<SharedSession, ChatError> {
        if let Some(existing) = self.get(id)? {
            return Ok(existing);
        }
        debug!(session_id = %id, "Session created on first use");
        self.insert(Session::new(id))
    }

    /// Live session for `id`, hydrating it from the store if needed.
    pub fn get(&self, id: &str) -> Result<Option<SharedSession>, ChatError> {
        if let Some(existing) = self.read()?.get(id) {
            return Ok(Some(existing.clone()));
        }
        match self.store.get(id) {
            Some(record) => {
                debug!(session_id = %id, "Session hydrated from store");
                self.insert(Session::from_record(record)).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Lock the live session for `id`, creating it if unknown.
    ///
    /// Waits for any in-flight exchange. A session deleted while waiting is
    /// replaced by a new one.
    pub async fn acquire(&self, id: &str) -> Result<OwnedMutexGuard<Session>, ChatError> {
        loop {
            let session = self.get_or_create(id)?.lock_owned().await;
            if !session.is_deleted() {
                return Ok(session);
            }
            debug!(session_id = %id, "Session deleted while waiting; retrying");
        }
    }

    /// Lock the live session for `id` if it exists.
    async fn acquire_existing(
        &self,
        id: &str,
    ) -> Result<Option<OwnedMutexGuard<Session>>, ChatError> {
        loop {
            let Some(shared) = self.get(id)? else {
                return Ok(None);
            };
            let session = shared.lock_owned().await;
            if !session.is_deleted() {
                return Ok(Some(session));
            }
        }
    }

    /// Copy of a session's state. Waits for any in-flight exchange.
    pub async fn lookup(&self, id: &str) -> Result<SessionSnapshot, ChatError> {
        let session = self
            .acquire_existing(id)
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))?;
        Ok(session.snapshot())
    }

    /// Clear a session's history and document, and persist the result.
    pub async fn reset(&self, id: &str) -> Result<(), ChatError> {
        let mut session = self
            .acquire_existing(id)
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))?;
        session.reset();
        self.persist(&session).await?;
        info!(session_id = %id, "Session reset");
        Ok(())
    }

    /// Remove a session from the store and from memory.
    ///
    /// Waits for any in-flight exchange to commit first. Both removals happen
    /// under the session lock, so requests queued behind it find the session
    /// retired and start over with a new one.
    pub async fn delete(&self, id: &str) -> Result<(), ChatError> {
        let Some(shared) = self.get(id)? else {
            return Err(ChatError::SessionNotFound(id.to_string()));
        };
        let mut session = shared.clone().lock_owned().await;
        if session.is_deleted() {
            return Err(ChatError::SessionNotFound(id.to_string()));
        }

        let store = self.store.clone();
        let key = id.to_string();
        blocking(move || store.remove(&key)).await?;

        session.mark_deleted();
        let mut map = self.write()?;
        if map.get(id).is_some_and(|current| Arc::ptr_eq(current, &shared)) {
            map.remove(id);
        }
        info!(session_id = %id, "Session deleted");
        Ok(())
    }

    /// Stored sessions, most recently updated first.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.store
            .list()
            .iter()
            .map(SessionSummary::from)
            .collect()
    }

    /// Write a session's current state to the store.
    ///
    /// A deleted session is never written back.
    pub async fn persist(&self, session: &Session) -> Result<(), ChatError> {
        if session.is_deleted() {
            debug!(session_id = %session.id(), "Skipping write for deleted session");
            return Ok(());
        }
        let record: SessionRecord = session.to_record();
        let store = self.store.clone();
        blocking(move || store.upsert(record)).await?;
        Ok(())
    }

    /// Number of sessions held in memory.
    pub fn live_count(&self) -> usize {
        self.sessions.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Insert unless another caller won the race; return the stored entry.
    fn insert(&self, session: Session) -> Result<SharedSession, ChatError> {
        let mut map = self.write()?;
        let entry = map
            .entry(session.id().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(session)));
        Ok(entry.clone())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, SharedSession>>, ChatError> {
        self.sessions
            .read()
            .map_err(|e| ChatError::Storage(format!("session map lock poisoned: {}", e)))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, SharedSession>>, ChatError> {
        self.sessions
            .write()
            .map_err(|e| ChatError::Storage(format!("session map lock poisoned: {}", e)))
    }
}

/// Run a store operation on the blocking pool.
async fn blocking<T, F>(op: F) -> Result<T, ChatError>
where
    F: FnOnce() -> Result<T, DocentError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| ChatError::Storage(format!("store task failed: {}", e)))?
        .map_err(ChatError::from)
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.live_count())
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docent_core::config::PromptConfig;
    use tempfile::TempDir;

    fn registry() -> (SessionRegistry, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        (SessionRegistry::new(store), dir)
    }

    #[tokio::test]
    async fn test_create_persists_immediately() {
        let (registry, _dir) = registry();
        let summary = registry.create(Some("s1".to_string())).await.unwrap();
        assert_eq!(summary.id, "s1");
        assert_eq!(summary.message_count, 0);
        assert!(registry.store().get("s1").is_some());
    }

    #[tokio::test]
    async fn test_create_without_id_generates_uuid() {
        let (registry, _dir) = registry();
        let summary = registry.create(None).await.unwrap();
        assert!(Uuid::parse_str(&summary.id).is_ok());
    }

    #[tokio::test]
    async fn test_create_existing_returns_it() {
        let (registry, _dir) = registry();
        let shared = registry.get_or_create("s1").unwrap();
        shared
            .lock()
            .await
            .ask("hello", &[], &PromptConfig::default())
            .unwrap();
        shared.lock().await.complete("hi").unwrap();

        let summary = registry.create(Some("s1".to_string())).await.unwrap();
        assert_eq!(summary.message_count, 3);
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let (registry, _dir) = registry();
        let a = registry.get_or_create("s1").unwrap();
        let b = registry.get_or_create("s1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_lookup_unknown_is_not_found() {
        let (registry, _dir) = registry();
        let err = registry.lookup("missing").await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_hydrates_from_store_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(SessionStore::open(dir.path()).unwrap());
            let registry = SessionRegistry::new(store);
            let shared = registry.get_or_create("s1").unwrap();
            let mut session = shared.lock().await;
            session.ask("q", &[], &PromptConfig::default()).unwrap();
            session.complete("a").unwrap();
            registry.persist(&session).await.unwrap();
        }

        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        let registry = SessionRegistry::new(store);
        let snapshot = registry.lookup("s1").await.unwrap();
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.phase, "fresh");
        assert!(!snapshot.document_attached);
    }

    #[tokio::test]
    async fn test_reset_persists_cleared_history() {
        let (registry, _dir) = registry();
        let shared = registry.get_or_create("s1").unwrap();
        {
            let mut session = shared.lock().await;
            session.ask("q", &[], &PromptConfig::default()).unwrap();
            session.complete("a").unwrap();
            registry.persist(&session).await.unwrap();
        }

        registry.reset("s1").await.unwrap();
        assert!(registry.lookup("s1").await.unwrap().messages.is_empty());
        assert!(registry.store().get("s1").unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_reset_unknown_is_not_found() {
        let (registry, _dir) = registry();
        assert!(matches!(
            registry.reset("nope").await,
            Err(ChatError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let (registry, _dir) = registry();
        registry.create(Some("s1".to_string())).await.unwrap();
        registry.delete("s1").await.unwrap();

        assert_eq!(registry.live_count(), 0);
        assert!(registry.store().get("s1").is_none());
        assert!(matches!(
            registry.delete("s1").await,
            Err(ChatError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_retires_stale_handles() {
        let (registry, _dir) = registry();
        registry.create(Some("s1".to_string())).await.unwrap();
        let stale = registry.get_or_create("s1").unwrap();

        registry.delete("s1").await.unwrap();

        let mut session = stale.lock().await;
        assert!(session.is_deleted());
        registry.persist(&session).await.unwrap();
        assert!(registry.store().get("s1").is_none());
        drop(session);

        let fresh = registry.acquire("s1").await.unwrap();
        assert!(!fresh.is_deleted());
        assert!(fresh.messages().is_empty());
    }

    #[tokio::test]
    async fn test_requests_queued_behind_delete_start_over() {
        let (registry, _dir) = registry();
        let registry = Arc::new(registry);

        let mut held = registry.acquire("s1").await.unwrap();
        held.ask("q", &[], &PromptConfig::default()).unwrap();
        held.complete("a").unwrap();
        registry.persist(&held).await.unwrap();

        let deleter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.delete("s1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let session = registry.acquire("s1").await.unwrap();
                session.messages().len()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        drop(held);
        deleter.await.unwrap().unwrap();
        assert_eq!(waiter.await.unwrap(), 0);
        assert!(registry.store().get("s1").is_none());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup_after_delete_is_not_found() {
        let (registry, _dir) = registry();
        registry.create(Some("s1".to_string())).await.unwrap();
        registry.delete("s1").await.unwrap();
        assert!(matches!(
            registry.lookup("s1").await,
            Err(ChatError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.reset("s1").await,
            Err(ChatError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_reads_store() {
        let (registry, _dir) = registry();
        registry.create(Some("a".to_string())).await.unwrap();
        registry.create(Some("b".to_string())).await.unwrap();
        // Lazily created sessions are not listed until persisted.
        registry.get_or_create("c").unwrap();

        let mut ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
