//! Session tokens and credential verification.
//!
//! The gateway only needs to map a credential to a stable [`UserId`]; that
//! boundary is the [`Authenticator`] trait. [`SessionStore`] is the bundled
//! implementation: opaque random tokens with an expiry, plus a revocation
//! list that keeps a revoked token rejected until it would have expired
//! anyway.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AuthError;
use crate::model::{now_millis, UserId};

/// Maps a presented credential to a user.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// One issued session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub device: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

#[derive(Default)]
struct SessionInner {
    sessions: HashMap<String, Session>,
    /// Revoked token → when the revocation entry can be forgotten.
    revoked: HashMap<String, Instant>,
}

/// In-memory session store.
pub struct SessionStore {
    inner: RwLock<SessionInner>,
    default_ttl: Duration,
}

impl SessionStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(SessionInner::default()),
            default_ttl,
        }
    }

    /// Issue a fresh token for `user`.
    pub async fn create(&self, user: UserId, device: impl Into<String>, ttl: Option<Duration>) -> Session {
        let token = Uuid::new_v4().simple().to_string();
        self.insert(token, user, device, ttl).await
    }

    /// Register a session under a caller-chosen token. Used to seed tokens
    /// issued by an external identity service.
    pub async fn insert(
        &self,
        token: impl Into<String>,
        user: UserId,
        device: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Session {
        let session = Session {
            token: token.into(),
            user_id: user,
            device: device.into(),
            created_at: now_millis(),
            expires_at: Instant::now() + ttl.unwrap_or(self.default_ttl),
        };
        let mut inner = self.inner.write().await;
        inner.revoked.remove(&session.token);
        inner.sessions.insert(session.token.clone(), session.clone());
        log::debug!("Session issued for {} on {}", session.user_id, session.device);
        session
    }

    pub async fn validate(&self, token: &str) -> Result<Session, AuthError> {
        let inner = self.inner.read().await;
        if inner.revoked.contains_key(token) {
            return Err(AuthError::Revoked);
        }
        match inner.sessions.get(token) {
            Some(session) if session.is_expired() => Err(AuthError::Expired),
            Some(session) => Ok(session.clone()),
            None => Err(AuthError::UnknownCredential),
        }
    }

    /// Returns whether the token was live.
    pub async fn revoke(&self, token: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.remove(token) {
            Some(session) => {
                inner.revoked.insert(session.token, session.expires_at);
                true
            }
            None => false,
        }
    }

    /// Revoke every session of a user. Returns how many.
    pub async fn revoke_user(&self, user: &UserId) -> usize {
        let mut inner = self.inner.write().await;
        let tokens: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| &s.user_id == user)
            .map(|s| s.token.clone())
            .collect();
        for token in &tokens {
            if let Some(session) = inner.sessions.remove(token) {
                inner.revoked.insert(session.token, session.expires_at);
            }
        }
        if !tokens.is_empty() {
            log::info!("Revoked {} sessions of {user}", tokens.len());
        }
        tokens.len()
    }

    pub async fn sessions_of(&self, user: &UserId) -> Vec<Session> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| &s.user_id == user && !s.is_expired())
            .cloned()
            .collect()
    }

    /// Drop expired sessions and stale revocation entries. Returns how many
    /// entries were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let before = inner.sessions.len() + inner.revoked.len();
        inner.sessions.retain(|_, s| s.expires_at > now);
        inner.revoked.retain(|_, until| *until > now);
        before - inner.sessions.len() - inner.revoked.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 60 * 60))
    }
}

#[async_trait]
impl Authenticator for SessionStore {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.validate(credential).await.map(|s| s.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_verify() {
        let store = SessionStore::default();
        let session = store.create("alice".into(), "laptop", None).await;
        assert_eq!(store.verify(&session.token).await, Ok(UserId::new("alice")));
        assert_eq!(store.verify("bogus").await, Err(AuthError::UnknownCredential));
        assert_eq!(store.verify("").await, Err(AuthError::MissingCredential));
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let store = SessionStore::default();
        let a = store.create("alice".into(), "web", None).await;
        let b = store.create("alice".into(), "web", None).await;
        assert_ne!(a.token, b.token);
        assert_eq!(store.sessions_of(&"alice".into()).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_rejected() {
        let store = SessionStore::default();
        let session = store
            .create("alice".into(), "web", Some(Duration::from_secs(10)))
            .await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.verify(&session.token).await, Err(AuthError::Expired));
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.verify(&session.token).await, Err(AuthError::UnknownCredential));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_outlives_session_removal() {
        let store = SessionStore::default();
        let session = store
            .create("alice".into(), "web", Some(Duration::from_secs(60)))
            .await;
        assert!(store.revoke(&session.token).await);
        assert!(!store.revoke(&session.token).await);
        assert_eq!(store.verify(&session.token).await, Err(AuthError::Revoked));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.purge_expired().await, 0);
        assert_eq!(store.verify(&session.token).await, Err(AuthError::Revoked));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_revoke_user() {
        let store = SessionStore::default();
        let a = store.create("alice".into(), "web", None).await;
        let b = store.create("alice".into(), "phone", None).await;
        let c = store.create("bob".into(), "web", None).await;

        assert_eq!(store.revoke_user(&"alice".into()).await, 2);
        assert_eq!(store.verify(&a.token).await, Err(AuthError::Revoked));
        assert_eq!(store.verify(&b.token).await, Err(AuthError::Revoked));
        assert!(store.verify(&c.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_insert_seeded_token() {
        let store = SessionStore::default();
        store.insert("tok-alice", "alice".into(), "seed", None).await;
        assert_eq!(store.verify("tok-alice").await, Ok(UserId::new("alice")));
    }
}
