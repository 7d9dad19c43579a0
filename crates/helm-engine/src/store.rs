//! In-memory store of [`SessionContext`] records.
//!
//! The store copy is what non-owning readers see. The pipeline checks a
//! context out for a turn and writes it back after every stage, so readers
//! observe monotonic progress.

use dashmap::DashMap;
use helm_core::context::{new_context, SessionContext};
use helm_core::SessionId;
use tracing::debug;

/// Concurrent map of session contexts, keyed by session id.
pub struct SessionContextStore {
    contexts: DashMap<SessionId, SessionContext>,
    audit_capacity: usize,
}

impl SessionContextStore {
    pub fn new(audit_capacity: usize) -> Self {
        Self {
            contexts: DashMap::new(),
            audit_capacity: audit_capacity.max(1),
        }
    }

    /// Clone of the stored context, creating an idle one on first sight.
    pub fn get_or_create(&self, session_id: &SessionId) -> SessionContext {
        self.contexts
            .entry(session_id.clone())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "creating session context");
                new_context(session_id.clone(), self.audit_capacity)
            })
            .clone()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionContext> {
        self.contexts.get(session_id).map(|entry| entry.value().clone())
    }

    /// Replace the stored copy.
    pub fn put(&self, context: SessionContext) {
        let _ = self.contexts.insert(context.session_id.clone(), context);
    }

    /// Mutate the stored copy in place. `None` when the session is unknown.
    pub fn update<R>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionContext) -> R,
    ) -> Option<R> {
        self.contexts
            .get_mut(session_id)
            .map(|mut entry| f(entry.value_mut()))
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<SessionContext> {
        self.contexts.remove(session_id).map(|(_, ctx)| ctx)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.contexts.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    /// Serialize every stored context (sorted by session id).
    pub fn export_json(&self) -> serde_json::Result<String> {
        let mut all: Vec<SessionContext> =
            self.contexts.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        serde_json::to_string(&all)
    }

    /// Load contexts produced by [`Self::export_json`], replacing same-id
    /// entries. Returns how many were loaded.
    pub fn import_json(&self, json: &str) -> serde_json::Result<usize> {
        let all: Vec<SessionContext> = serde_json::from_str(json)?;
        let count = all.len();
        for ctx in all {
            self.put(ctx);
        }
        Ok(count)
    }
}

impl Default for SessionContextStore {
    fn default() -> Self {
        Self::new(helm_core::context::DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::context::record_event;
    use helm_core::SessionStatus;

    #[test]
    fn get_or_create_reuses_record() {
        let store = SessionContextStore::default();
        let id = SessionId::from_raw("s1");
        let first = store.get_or_create(&id);
        assert_eq!(first.status, SessionStatus::Idle);

        let _ = store.update(&id, |ctx| record_event(ctx, "marker", None));
        let second = store.get_or_create(&id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.events.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn new_records_use_store_capacity() {
        let store = SessionContextStore::new(2);
        let ctx = store.get_or_create(&SessionId::from_raw("s1"));
        assert_eq!(ctx.audit_capacity, 2);
    }

    #[test]
    fn update_unknown_session_is_none() {
        let store = SessionContextStore::default();
        assert!(store.update(&SessionId::from_raw("nope"), |_| ()).is_none());
    }

    #[test]
    fn put_replaces_and_remove_deletes() {
        let store = SessionContextStore::default();
        let id = SessionId::from_raw("s1");
        let mut ctx = store.get_or_create(&id);
        ctx.status = SessionStatus::Streaming;
        store.put(ctx);
        assert_eq!(store.get(&id).unwrap().status, SessionStatus::Streaming);

        assert!(store.remove(&id).is_some());
        assert!(!store.contains(&id));
        assert!(store.is_empty());
    }

    #[test]
    fn export_import_preserves_contexts() {
        let store = SessionContextStore::default();
        for raw in ["b", "a"] {
            let id = SessionId::from_raw(raw);
            let _ = store.get_or_create(&id);
            let _ = store.update(&id, |ctx| record_event(ctx, "pipeline:start", None));
        }
        let json = store.export_json().unwrap();

        let restored = SessionContextStore::default();
        assert_eq!(restored.import_json(&json).unwrap(), 2);
        let mut ids = restored.session_ids();
        ids.sort();
        assert_eq!(ids, vec![SessionId::from_raw("a"), SessionId::from_raw("b")]);
        assert_eq!(
            restored.get(&SessionId::from_raw("a")).unwrap(),
            store.get(&SessionId::from_raw("a")).unwrap()
        );
    }
}
