use chrono::{DateTime, Utc};
use meisai_core::{ImportSession, ImportStatus, MeisaiError, Result, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

pub const MAX_PAGE_SIZE: usize = 500;
/// Finished sessions kept for lookup before the oldest are evicted.
pub const DEFAULT_RETAINED_SESSIONS: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    pub status: Option<ImportStatus>,
    pub account_type: Option<String>,
    pub account_id: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, s: &ImportSession) -> bool {
        self.status.map_or(true, |st| st == s.status)
            && self
                .account_type
                .as_deref()
                .map_or(true, |t| t == s.account_type)
            && self.account_id.as_deref().map_or(true, |a| a == s.account_id)
    }
}

/// One page of a listing. `page` is 1-based; `total` counts every match.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

struct Slot {
    session: ImportSession,
    cancel: watch::Sender<bool>,
}

/// Import sessions known to this process, with their cancel signals.
///
/// Running sessions are always kept. Once more than `retained` sessions
/// are terminal, the ones that finished first are dropped.
#[derive(Clone)]
pub struct SessionRegistry {
    slots: Arc<RwLock<HashMap<SessionId, Slot>>>,
    retained: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retained: usize) -> Self {
        SessionRegistry {
            slots: Arc::default(),
            retained: retained.max(1),
        }
    }

    /// Adds a session and returns the receiver its worker watches for
    /// cancellation.
    pub async fn register(&self, session: ImportSession) -> watch::Receiver<bool> {
        let (cancel, cancelled) = watch::channel(false);
        let id = session.session_id;
        self.slots.write().await.insert(id, Slot { session, cancel });
        cancelled
    }

    /// Replaces the stored snapshot of a session. Publishing a terminal
    /// snapshot may evict older finished sessions.
    pub async fn publish(&self, session: &ImportSession) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(&session.session_id) {
            slot.session = session.clone();
        }
        if session.is_terminal() {
            self.evict_finished(&mut slots);
        }
    }

    fn evict_finished(&self, slots: &mut HashMap<SessionId, Slot>) {
        let mut finished: Vec<(DateTime<Utc>, SessionId)> = slots
            .values()
            .filter(|slot| slot.session.is_terminal())
            .map(|slot| {
                let s = &slot.session;
                (s.completed_at.unwrap_or(s.created_at), s.session_id)
            })
            .collect();
        if finished.len() <= self.retained {
            return;
        }
        finished.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));
        let excess = finished.len() - self.retained;
        for (_, id) in finished.into_iter().take(excess) {
            slots.remove(&id);
        }
        tracing::debug!(evicted = excess, retained = self.retained, "finished sessions evicted");
    }

    pub async fn get(&self, id: SessionId) -> Result<ImportSession> {
        self.slots
            .read()
            .await
            .get(&id)
            .map(|slot| slot.session.clone())
            .ok_or(MeisaiError::SessionNotFound(id))
    }

    /// Newest first. `page` below 1 reads as 1 and `page_size` is clamped
    /// to `1..=MAX_PAGE_SIZE`.
    pub async fn list(&self, filter: &SessionFilter, page: usize, page_size: usize) -> Page<ImportSession> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let mut matching: Vec<ImportSession> = self
            .slots
            .read()
            .await
            .values()
            .filter(|slot| filter.matches(&slot.session))
            .map(|slot| slot.session.clone())
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.session_id.0.cmp(&b.session_id.0))
        });
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        Page {
            items,
            total,
            page,
            page_size,
        }
    }

    /// Signals the session's worker to stop. The worker finishes its
    /// in-flight row and marks the session failed.
    pub async fn cancel(&self, id: SessionId) -> Result<ImportSession> {
        let slots = self.slots.read().await;
        let slot = slots.get(&id).ok_or(MeisaiError::SessionNotFound(id))?;
        if slot.session.is_terminal() {
            return Err(MeisaiError::InvalidTransition {
                entity: "import session",
                from: slot.session.status.to_string(),
                to: ImportStatus::Failed.to_string(),
            });
        }
        slot.cancel.send_replace(true);
        tracing::info!(session_id = %id, "import cancellation requested");
        Ok(slot.session.clone())
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meisai_core::ImportSource;

    fn session(account_type: &str, account_id: &str) -> ImportSession {
        ImportSession::new(ImportSource {
            account_type: account_type.into(),
            account_id: account_id.into(),
            file_name: "meisai.csv".into(),
        })
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let registry = SessionRegistry::new();
        let err = registry.get(SessionId::new()).await.unwrap_err();
        assert!(matches!(err, MeisaiError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn publish_replaces_snapshot() {
        let registry = SessionRegistry::new();
        let mut s = session("corporate", "acct-1");
        registry.register(s.clone()).await;
        s.start().unwrap();
        registry.publish(&s).await;
        assert_eq!(
            registry.get(s.session_id).await.unwrap().status,
            ImportStatus::Processing
        );
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let registry = SessionRegistry::new();
        for i in 0..5 {
            registry.register(session("corporate", &format!("a{i}"))).await;
        }
        registry.register(session("personal", "p1")).await;

        let filter = SessionFilter {
            account_type: Some("corporate".into()),
            ..Default::default()
        };
        let first = registry.list(&filter, 1, 2).await;
        assert_eq!(first.total, 5);
        assert_eq!(first.items.len(), 2);
        let last = registry.list(&filter, 3, 2).await;
        assert_eq!(last.items.len(), 1);
        let beyond = registry.list(&filter, 9, 2).await;
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 5);

        let zero = registry.list(&SessionFilter::default(), 0, 0).await;
        assert_eq!((zero.page, zero.page_size, zero.items.len()), (1, 1, 1));
    }

    #[tokio::test]
    async fn cancel_signals_worker() {
        let registry = SessionRegistry::new();
        let s = session("corporate", "acct-1");
        let mut rx = registry.register(s.clone()).await;
        registry.cancel(s.session_id).await.unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn cancel_terminal_session_fails() {
        let registry = SessionRegistry::new();
        let mut s = session("corporate", "acct-1");
        registry.register(s.clone()).await;
        s.complete().unwrap();
        registry.publish(&s).await;
        assert!(matches!(
            registry.cancel(s.session_id).await,
            Err(MeisaiError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn finished_sessions_beyond_retention_are_evicted() {
        let registry = SessionRegistry::with_retention(2);
        let running = session("corporate", "live");
        registry.register(running.clone()).await;

        let mut finished = Vec::new();
        for i in 0..3 {
            let mut s = session("corporate", &format!("done-{i}"));
            registry.register(s.clone()).await;
            s.complete().unwrap();
            s.completed_at = Some(s.created_at + chrono::Duration::seconds(i));
            registry.publish(&s).await;
            finished.push(s.session_id);
        }

        assert_eq!(registry.len().await, 3);
        assert!(registry.get(running.session_id).await.is_ok());
        assert!(matches!(
            registry.get(finished[0]).await,
            Err(MeisaiError::SessionNotFound(_))
        ));
        assert!(registry.get(finished[1]).await.is_ok());
        assert!(registry.get(finished[2]).await.is_ok());
    }
}
