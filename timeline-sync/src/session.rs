use crate::crypto::SessionCipher;
use crate::types::{Credential, FeedApi, FeedApiError, Result, SyncError, UpstreamSession, UserStore};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Active,
    Expired,
    /// Terminal for the current call.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Established,
    AuthRejected,
    Refreshed,
    CredentialRejected,
}

impl SessionState {
    pub fn on(self, event: SessionEvent) -> Result<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (NoSession, Established) => Ok(Active),
            (Active, AuthRejected) => Ok(Expired),
            (Expired, Refreshed) => Ok(Active),
            (Expired, CredentialRejected) | (NoSession, CredentialRejected) => Ok(Failed),
            (state, event) => Err(SyncError::InvalidTransition(format!("{:?} on {:?}", event, state))),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NoSession => "no-session",
            SessionState::Active => "active",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A live upstream session bound to one local user.
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub upstream: UpstreamSession,
    state: SessionState,
}

impl Session {
    fn established(username: &str, upstream: UpstreamSession) -> Result<Self> {
        Ok(Self {
            username: username.to_string(),
            upstream,
            state: SessionState::NoSession.on(SessionEvent::Established)?,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Record that the upstream rejected the access token.
    pub fn expire(&mut self) -> Result<()> {
        self.transition(SessionEvent::AuthRejected)
    }

    fn transition(&mut self, event: SessionEvent) -> Result<()> {
        let next = self.state.on(event)?;
        debug!("Session for {}: {} -> {}", self.username, self.state, next);
        self.state = next;
        Ok(())
    }
}

pub struct SessionManager {
    api: Arc<dyn FeedApi>,
    users: Arc<dyn UserStore>,
    cipher: SessionCipher,
}

impl SessionManager {
    pub fn new(api: Arc<dyn FeedApi>, users: Arc<dyn UserStore>, cipher: SessionCipher) -> Self {
        Self { api, users, cipher }
    }

    /// Rehydrate the stored session. `None` means the caller should `create`.
    pub async fn restore(&self, username: &str) -> Result<Option<Session>> {
        let token = match self.users.get_user(username).await? {
            Some(user) => user.encrypted_session_token,
            None => None,
        };
        let Some(token) = token else {
            debug!("No stored session for {}", username);
            return Ok(None);
        };

        let stored = match self.cipher.decrypt(&token) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Discarding unreadable session token for {}: {}", username, e);
                self.users.remove_session_token(username).await?;
                return Ok(None);
            }
        };

        match self.api.resume(&stored).await {
            Ok(upstream) => {
                info!("Restored session for {} ({})", username, upstream.did);
                Ok(Some(Session::established(username, upstream)?))
            }
            Err(FeedApiError::Unauthorized { code, .. }) => {
                warn!("Stored session for {} rejected upstream ({}), removing it", username, code);
                self.users.remove_session_token(username).await?;
                Ok(None)
            }
            Err(FeedApiError::Transient(msg)) => Err(SyncError::TransientFetch(msg)),
        }
    }

    pub async fn create(&self, username: &str, credential: &Credential) -> Result<Session> {
        let upstream = match self.api.login(credential).await {
            Ok(upstream) => upstream,
            Err(FeedApiError::Unauthorized { message, .. }) => {
                return Err(SyncError::AuthenticationFailure {
                    username: username.to_string(),
                    reason: message,
                })
            }
            Err(FeedApiError::Transient(msg)) => return Err(SyncError::TransientFetch(msg)),
        };

        self.persist(username, &upstream).await?;
        info!("Created session for {} as {}", username, upstream.handle);
        Session::established(username, upstream)
    }

    pub async fn open(&self, username: &str, credential: &Credential) -> Result<Session> {
        match self.restore(username).await? {
            Some(session) => Ok(session),
            None => self.create(username, credential).await,
        }
    }

    /// Renew an expired session, first with its refresh token, then with the credential.
    pub async fn refresh(&self, session: &mut Session, credential: &Credential) -> Result<()> {
        if session.state != SessionState::Expired {
            return Err(SyncError::InvalidTransition(format!(
                "refresh requested for a session that is {}",
                session.state
            )));
        }

        let refreshed = self.api.refresh(&session.upstream).await;
        let renewed = match refreshed {
            Ok(upstream) => upstream,
            Err(FeedApiError::Unauthorized { code, .. }) => {
                debug!("Refresh token for {} rejected ({}), logging in again", session.username, code);
                match self.api.login(credential).await {
                    Ok(upstream) => upstream,
                    Err(FeedApiError::Unauthorized { message, .. }) => {
                        session.transition(SessionEvent::CredentialRejected)?;
                        warn!("Credential rejected for {}", session.username);
                        return Err(SyncError::AuthenticationFailure {
                            username: session.username.clone(),
                            reason: message,
                        });
                    }
                    Err(FeedApiError::Transient(msg)) => return Err(SyncError::TransientFetch(msg)),
                }
            }
            Err(FeedApiError::Transient(msg)) => return Err(SyncError::TransientFetch(msg)),
        };

        self.persist(&session.username, &renewed).await?;
        session.upstream = renewed;
        session.transition(SessionEvent::Refreshed)?;
        info!("Refreshed session for {}", session.username);
        Ok(())
    }

    pub async fn checkpoint(&self, username: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.users.get_user(username).await?.and_then(|user| user.sync_checkpoint))
    }

    pub async fn advance_checkpoint(&self, username: &str, checkpoint: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let stored = self.users.advance_checkpoint(username, checkpoint).await?;
        info!("Checkpoint for {} is now {}", username, stored);
        Ok(stored)
    }

    pub async fn unlink(&self, username: &str) -> Result<bool> {
        let removed = self.users.unlink(username).await?;
        if removed {
            info!("Unlinked {}", username);
        }
        Ok(removed)
    }

    async fn persist(&self, username: &str, upstream: &UpstreamSession) -> Result<()> {
        let token = self.cipher.encrypt(upstream)?;
        self.users.store_session_token(username, &token).await?;
        Ok(())
    }
}
