//! Identity-provider sessions as seen by the reconciler: a one-shot lookup,
//! a stream of identity-change events, and sign-out.

use super::auth_client::AuthClient;
use super::token_store::TokenStore;
use crate::models::RemoteSession;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Network or provider failure. Absence of evidence, not evidence of absence.
    #[error("Session transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::SignedIn => "signed_in",
            SessionEventKind::SignedOut => "signed_out",
            SessionEventKind::TokenRefreshed => "token_refreshed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: Option<RemoteSession>,
}

impl SessionEvent {
    pub fn signed_in(session: RemoteSession) -> Self {
        Self {
            kind: SessionEventKind::SignedIn,
            session: Some(session),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            kind: SessionEventKind::SignedOut,
            session: None,
        }
    }

    pub fn token_refreshed(session: Option<RemoteSession>) -> Self {
        Self {
            kind: SessionEventKind::TokenRefreshed,
            session,
        }
    }
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(SessionEvent),
    /// The subscriber fell behind and `n` events were dropped.
    Lagged(u64),
}

/// A live registration for session events. Dropping it unsubscribes.
pub struct Subscription {
    receiver: Option<broadcast::Receiver<SessionEvent>>,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<SessionEvent>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// Next delivery, or `None` once the source is gone or after
    /// `unsubscribe`.
    pub async fn next(&mut self) -> Option<Delivery> {
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(RecvError::Lagged(missed)) => Some(Delivery::Lagged(missed)),
            Err(RecvError::Closed) => {
                self.receiver = None;
                None
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn current_session(&self) -> Result<Option<RemoteSession>, SessionError>;
    fn subscribe(&self) -> Subscription;
    async fn sign_out(&self) -> Result<(), SessionError>;
}

/// Per-visitor broadcast channels for session events raised by the login,
/// logout and refresh handlers.
#[derive(Clone, Default)]
pub struct SessionEventHub {
    channels: Arc<DashMap<String, broadcast::Sender<SessionEvent>>>,
}

impl SessionEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, visitor_id: &str) -> Subscription {
        let sender = self
            .channels
            .entry(visitor_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone();
        Subscription::new(sender.subscribe())
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, visitor_id: &str, event: SessionEvent) -> usize {
        let Some(sender) = self.channels.get(visitor_id).map(|entry| entry.clone()) else {
            tracing::debug!(visitor_id = %visitor_id, kind = event.kind.as_str(), "No subscribers for session event");
            return 0;
        };
        sender.send(event).unwrap_or(0)
    }

    /// Drop the visitor's channel once nobody listens on it.
    pub fn release(&self, visitor_id: &str) {
        self.channels
            .remove_if(visitor_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Session source for one visitor, backed by the identity provider.
pub struct ProviderSessionSource {
    visitor_id: String,
    auth_client: Arc<AuthClient>,
    tokens: TokenStore,
    hub: SessionEventHub,
}

impl ProviderSessionSource {
    pub fn new(
        visitor_id: &str,
        auth_client: Arc<AuthClient>,
        tokens: TokenStore,
        hub: SessionEventHub,
    ) -> Self {
        Self {
            visitor_id: visitor_id.to_string(),
            auth_client,
            tokens,
            hub,
        }
    }
}

#[async_trait]
impl SessionSource for ProviderSessionSource {
    async fn current_session(&self) -> Result<Option<RemoteSession>, SessionError> {
        let tokens = self
            .tokens
            .load(&self.visitor_id)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let Some(tokens) = tokens else {
            return Ok(None);
        };

        match self.auth_client.introspect(&tokens.access_token).await {
            Ok(session) => Ok(session),
            Err(e) if e.is_transport() => Err(SessionError::Transport(e.to_string())),
            Err(e) => {
                tracing::debug!(visitor_id = %self.visitor_id, error = %e, "Provider rejected stored access token");
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe(&self.visitor_id)
    }

    async fn sign_out(&self) -> Result<(), SessionError> {
        let tokens = self
            .tokens
            .load(&self.visitor_id)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.tokens
            .remove(&self.visitor_id)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        if let Some(tokens) = tokens {
            self.auth_client
                .logout(&tokens.refresh_token)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
        }

        self.hub.publish(&self.visitor_id, SessionEvent::signed_out());
        Ok(())
    }
}

/// Scriptable session source for tests.
pub struct MockSessionSource {
    session: Mutex<Option<RemoteSession>>,
    delay: Mutex<Option<Duration>>,
    transport_down: AtomicBool,
    fail_sign_out: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    lookups: AtomicUsize,
    sign_outs: AtomicUsize,
}

impl Default for MockSessionSource {
    fn default() -> Self {
        Self {
            session: Mutex::new(None),
            delay: Mutex::new(None),
            transport_down: AtomicBool::new(false),
            fail_sign_out: AtomicBool::new(false),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            lookups: AtomicUsize::new(0),
            sign_outs: AtomicUsize::new(0),
        }
    }
}

impl MockSessionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: RemoteSession) -> Self {
        let source = Self::default();
        source.set_session(Some(session));
        source
    }

    pub fn set_session(&self, session: Option<RemoteSession>) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = session;
        }
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = delay;
        }
    }

    pub fn set_transport_down(&self, down: bool) {
        self.transport_down.store(down, Ordering::SeqCst);
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.fail_sign_out.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event to every subscriber. Returns the subscriber count.
    pub fn emit(&self, event: SessionEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn sign_out_count(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionSource for MockSessionSource {
    async fn current_session(&self) -> Result<Option<RemoteSession>, SessionError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.transport_down.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("provider unreachable".to_string()));
        }
        Ok(self.session.lock().ok().and_then(|s| s.clone()))
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    async fn sign_out(&self) -> Result<(), SessionError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("sign-out request failed".to_string()));
        }
        self.set_session(None);
        Ok(())
    }
}
