use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::pkce::{self, Pkce};
use crate::types::SessionId;

/// Login state that survives the browser redirect to the identity provider.
///
/// The flow never keeps sessions in memory; the caller persists this record
/// (signed cookie, [`SessionStore`], ...) between the two requests of a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    pub id: SessionId,
    /// OAuth `state`, echoed back by the identity provider on the callback.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce: Option<Pkce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_idp_iss: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Session {
    #[must_use]
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            id: SessionId::generate(),
            state: pkce::generate_state(),
            nonce: None,
            pkce: None,
            chosen_idp_iss: None,
            created_at: clock.now(),
        }
    }

    /// Fill in nonce and PKCE pair unless already present.
    #[must_use]
    pub(crate) fn initialized(mut self) -> Self {
        self.nonce.get_or_insert_with(pkce::generate_nonce);
        self.pkce.get_or_insert_with(Pkce::generate);
        self
    }

    #[must_use]
    pub(crate) fn with_chosen_idp(mut self, iss: impl Into<String>) -> Self {
        self.chosen_idp_iss = Some(iss.into());
        self
    }

    /// A TTL reaching past the representable date range never expires.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime, ttl: time::Duration) -> bool {
        self.created_at
            .checked_add(ttl)
            .is_some_and(|deadline| now >= deadline)
    }
}

/// Consumer-provided session persistence.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStore for MyAppState {
///     async fn save(&self, session: &Session) -> Result<(), ...> {
///         let json = serde_json::to_string(session)?;
///         self.redis.set_ex(session.id.as_str(), json, 600).await?;
///         Ok(())
///     }
///     // find, delete ...
/// }
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Insert or replace the session under `session.id`.
    fn save(
        &self,
        session: &Session,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;

    fn find(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<Option<Session>, Box<dyn std::error::Error + Send + Sync>>>
           + Send;

    /// Remove the session. Call once the code exchange has run, whatever its outcome.
    fn delete(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// In-process [`SessionStore`] for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop sessions older than `ttl`. Returns how many were removed.
    pub async fn purge_expired(&self, clock: &dyn Clock, ttl: time::Duration) -> usize {
        let now = clock.now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now, ttl));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "Purged expired sessions");
        }
        removed
    }
}

impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find(
        &self,
        id: &SessionId,
    ) -> Result<Option<Session>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.sessions.write().await.remove(id);
        Ok(())
    }
}
