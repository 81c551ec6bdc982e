//! Authorization reconciler.
//!
//! Combines the identity provider's live session with the locally cached
//! identity, checks the result against the administrator allow-list and keeps
//! the resulting [`Verdict`] current while session events arrive.
//!
//! Every verification run takes a [`RunToken`] when it starts. A run commits
//! (publishes its verdict and touches the cache) only if no later run has
//! started and the reconciler has not been unmounted, and commits are
//! serialized, so a slow run can never overwrite the outcome of a newer one.

use super::allow_list::{AllowListError, AllowListVerifier};
use super::identity_cache::IdentityCache;
use super::metrics;
use super::session_source::{Delivery, SessionEvent, SessionEventKind, SessionSource, Subscription};
use crate::models::{DenialReason, Identity, IdentityClaim, RemoteSession, Verdict};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Upper bound on one allow-list query.
    pub verify_timeout: Duration,
    /// A cached identity younger than this is not rewritten when it is
    /// verified again unchanged.
    pub cache_refresh: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            verify_timeout: Duration::from_secs(5),
            cache_refresh: Duration::from_secs(300),
        }
    }
}

/// The collaborators one reconciler works against.
#[derive(Clone)]
pub struct Dependencies {
    pub session_source: Arc<dyn SessionSource>,
    pub allow_list: Arc<dyn AllowListVerifier>,
    pub cache: Arc<dyn IdentityCache>,
}

/// Sequence number taken by a verification run when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunToken(u64);

impl RunToken {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// Where a run gets its remote session from.
enum RemoteInput {
    /// Ask the session source (mount, route change, missed events).
    Fetch,
    /// Use the session carried by an event.
    Provided(Option<RemoteSession>),
}

enum Outcome {
    Granted(Identity),
    Denied {
        reason: DenialReason,
        email: Option<String>,
        sign_out: bool,
    },
}

struct Inner {
    deps: Dependencies,
    settings: ReconcilerSettings,
    label: String,
    latest_run: AtomicU64,
    commit_lock: Mutex<()>,
    verdict: watch::Sender<Verdict>,
    cancel: CancellationToken,
    /// `verified_at` of the last identity this reconciler cached.
    last_write: std::sync::Mutex<Option<DateTime<Utc>>>,
}

pub struct Reconciler {
    inner: Arc<Inner>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    /// Build an idle reconciler: `Pending`, not subscribed, nothing running.
    pub fn new(label: impl Into<String>, deps: Dependencies, settings: ReconcilerSettings) -> Self {
        let (verdict, _) = watch::channel(Verdict::Pending);
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                label: label.into(),
                latest_run: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                verdict,
                cancel: CancellationToken::new(),
                last_write: std::sync::Mutex::new(None),
            }),
            listener: std::sync::Mutex::new(None),
        }
    }

    /// Build a reconciler, subscribe to session events and start the initial
    /// verification in the background.
    pub async fn mount(
        label: impl Into<String>,
        deps: Dependencies,
        settings: ReconcilerSettings,
    ) -> Self {
        let reconciler = Self::new(label, deps, settings);
        // Subscribe first so events raised during the initial check are seen
        let subscription = reconciler.inner.deps.session_source.subscribe();
        reconciler.spawn_verification().await;
        reconciler.listen(subscription);
        reconciler
    }

    fn listen(&self, subscription: Subscription) {
        let handle = tokio::spawn(self.inner.clone().listen(subscription));
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(handle);
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn verdict(&self) -> Verdict {
        self.inner.verdict.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Verdict> {
        self.inner.verdict.subscribe()
    }

    pub fn is_unmounted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait up to `wait` for a non-pending verdict, then return whatever
    /// holds.
    pub async fn settled(&self, wait: Duration) -> Verdict {
        let mut receiver = self.inner.verdict.subscribe();
        let settled = tokio::time::timeout(wait, async {
            receiver
                .wait_for(|verdict| !verdict.is_pending())
                .await
                .map(|verdict| verdict.clone())
        })
        .await;

        match settled {
            Ok(Ok(verdict)) => verdict,
            _ => self.verdict(),
        }
    }

    /// Run the initial verification inline. Returns the verdict it
    /// published, or `None` if a newer run or an unmount overtook it.
    pub async fn verify(&self) -> Option<Verdict> {
        let run = self.inner.begin_run().await?;
        self.inner.clone().complete(run, RemoteInput::Fetch).await
    }

    /// Start the initial verification in the background (mount and route
    /// changes). The run token is taken before this returns.
    pub async fn spawn_verification(&self) -> Option<JoinHandle<Option<Verdict>>> {
        let run = self.inner.begin_run().await?;
        Some(tokio::spawn(
            self.inner.clone().complete(run, RemoteInput::Fetch),
        ))
    }

    /// Feed one session event through the listener path.
    pub async fn dispatch(&self, event: SessionEvent) -> Option<JoinHandle<Option<Verdict>>> {
        self.inner.clone().dispatch(event).await
    }

    /// Stop listening and discard every in-flight run. Once this returns the
    /// reconciler no longer touches the verdict or the cache.
    pub async fn unmount(&self) {
        self.inner.cancel.cancel();
        // The listener exits on cancel and drops its subscription
        let listener = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(guard = %self.inner.label, error = %e, "Session listener ended abnormally");
            }
        }
        // Wait out a commit that passed its staleness check before the cancel
        let _commit = self.inner.commit_lock.lock().await;
        debug!(guard = %self.inner.label, "Reconciler unmounted");
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(listener) = slot.take() {
                listener.abort();
            }
        }
    }
}

impl Inner {
    fn wrote(&self, verified_at: DateTime<Utc>) -> bool {
        self.last_write
            .lock()
            .map(|last| *last == Some(verified_at))
            .unwrap_or(false)
    }

    fn is_current(&self, run: RunToken) -> bool {
        !self.cancel.is_cancelled() && self.latest_run.load(Ordering::SeqCst) == run.0
    }

    /// Take the next run token and drop back to `Pending`.
    async fn begin_run(&self) -> Option<RunToken> {
        let _commit = self.commit_lock.lock().await;
        if self.cancel.is_cancelled() {
            return None;
        }
        let run = RunToken(self.latest_run.fetch_add(1, Ordering::SeqCst) + 1);
        self.verdict.send_replace(Verdict::Pending);
        debug!(guard = %self.label, run = run.0, "Verification run started");
        Some(run)
    }

    async fn listen(self: Arc<Self>, mut subscription: Subscription) {
        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => break,
                delivery = subscription.next() => delivery,
            };

            match delivery {
                Some(Delivery::Event(event)) => {
                    self.clone().dispatch(event).await;
                }
                Some(Delivery::Lagged(missed)) => {
                    warn!(guard = %self.label, missed = missed, "Session events dropped, re-verifying from source");
                    if let Some(run) = self.begin_run().await {
                        tokio::spawn(self.clone().complete(run, RemoteInput::Fetch));
                    }
                }
                None => {
                    debug!(guard = %self.label, "Session event stream closed");
                    break;
                }
            }
        }
        subscription.unsubscribe();
    }

    async fn dispatch(self: Arc<Self>, event: SessionEvent) -> Option<JoinHandle<Option<Verdict>>> {
        match event.kind {
            SessionEventKind::TokenRefreshed => {
                // Proof of continued validity, not new identity information
                debug!(guard = %self.label, "Token refreshed, verdict unchanged");
                None
            }
            SessionEventKind::SignedOut => {
                let run = self.begin_run().await?;
                let outcome = Outcome::Denied {
                    reason: DenialReason::SignedOut,
                    email: None,
                    sign_out: false,
                };
                self.commit(run, outcome).await;
                None
            }
            SessionEventKind::SignedIn => {
                let run = self.begin_run().await?;
                Some(tokio::spawn(
                    self.clone().complete(run, RemoteInput::Provided(event.session)),
                ))
            }
        }
    }

    /// One verification: resolve the claim, consult the allow-list, commit.
    async fn complete(self: Arc<Self>, run: RunToken, input: RemoteInput) -> Option<Verdict> {
        let remote = match input {
            RemoteInput::Provided(session) => session,
            RemoteInput::Fetch => match self.deps.session_source.current_session().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(guard = %self.label, run = run.0, error = %e, "Session lookup failed, falling back to cache");
                    None
                }
            },
        };

        let cached = match self.deps.cache.read().await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(guard = %self.label, run = run.0, error = %e, "Identity cache read failed");
                None
            }
        };

        let claim = IdentityClaim::resolve(remote, cached.clone());
        let outcome = self.check(run, claim).await;

        let outcome = match outcome {
            Outcome::Granted(identity) => {
                let checked_at = identity.verified_at;
                // An entry this reconciler wrote moments ago is left alone
                let fresh = cached.as_ref().is_some_and(|cached| {
                    cached.same_subject(&identity)
                        && self.wrote(cached.verified_at)
                        && (identity.verified_at - cached.verified_at)
                            .to_std()
                            .map(|age| age < self.settings.cache_refresh)
                            .unwrap_or(true)
                });
                let identity = match (fresh, cached) {
                    (true, Some(cached)) => Identity {
                        source: identity.source,
                        ..cached
                    },
                    _ => identity,
                };
                return self.commit_granted(run, identity, !fresh, checked_at).await;
            }
            denied => denied,
        };
        self.commit(run, outcome).await
    }

    async fn check(&self, run: RunToken, claim: IdentityClaim) -> Outcome {
        let Some(email) = claim.email().map(str::to_string) else {
            return Outcome::Denied {
                reason: DenialReason::NoIdentity,
                email: None,
                sign_out: false,
            };
        };
        let has_remote = claim.has_remote_session();

        let lookup = tokio::time::timeout(
            self.settings.verify_timeout,
            self.deps.allow_list.find_active_entry(&email),
        )
        .await;

        let reason = match lookup {
            Ok(Ok(entry)) if entry.is_active => {
                metrics::record_allow_list_check("active");
                return match claim.into_identity(Utc::now()) {
                    Some(identity) => Outcome::Granted(identity),
                    None => Outcome::Denied {
                        reason: DenialReason::NoIdentity,
                        email: None,
                        sign_out: false,
                    },
                };
            }
            Ok(Ok(_)) => DenialReason::Inactive,
            Ok(Err(AllowListError::NotFound(_))) => DenialReason::NotListed,
            Ok(Err(AllowListError::Ambiguous(e))) => {
                warn!(guard = %self.label, run = run.0, email = %email, error = %e, "Allow-list query failed");
                DenialReason::Ambiguous
            }
            Err(_) => {
                warn!(
                    guard = %self.label,
                    run = run.0,
                    email = %email,
                    timeout_ms = self.settings.verify_timeout.as_millis() as u64,
                    "Allow-list query timed out"
                );
                DenialReason::Ambiguous
            }
        };
        metrics::record_allow_list_check(reason.as_str());

        Outcome::Denied {
            reason,
            email: Some(email),
            sign_out: has_remote && reason.clears_cache(),
        }
    }

    async fn commit_granted(
        self: Arc<Self>,
        run: RunToken,
        identity: Identity,
        write_cache: bool,
        checked_at: DateTime<Utc>,
    ) -> Option<Verdict> {
        let _commit = self.commit_lock.lock().await;
        if !self.is_current(run) {
            debug!(guard = %self.label, run = run.0, "Discarding stale verification");
            return None;
        }

        if write_cache {
            match self.deps.cache.write(&identity).await {
                Ok(()) => {
                    if let Ok(mut last) = self.last_write.lock() {
                        *last = Some(identity.verified_at);
                    }
                }
                Err(e) => {
                    warn!(guard = %self.label, run = run.0, error = %e, "Identity cache write failed");
                }
            }
        }

        let allow_list = self.deps.allow_list.clone();
        let email = identity.email.clone();
        tokio::spawn(async move {
            if let Err(e) = allow_list.record_login(&email, checked_at).await {
                warn!(email = %email, error = %e, "Failed to record admin login");
            }
        });

        info!(
            guard = %self.label,
            run = run.0,
            email = %identity.email,
            source = identity.source.as_str(),
            "Admin access granted"
        );
        Some(self.publish(Verdict::Authorized(identity)))
    }

    async fn commit(&self, run: RunToken, outcome: Outcome) -> Option<Verdict> {
        let Outcome::Denied {
            reason,
            email,
            sign_out,
        } = outcome
        else {
            // Grants go through commit_granted
            return None;
        };

        let _commit = self.commit_lock.lock().await;
        if !self.is_current(run) {
            debug!(guard = %self.label, run = run.0, "Discarding stale verification");
            return None;
        }

        if reason.clears_cache() {
            if let Err(e) = self.deps.cache.clear().await {
                warn!(guard = %self.label, run = run.0, error = %e, "Identity cache clear failed");
            }
        }

        if sign_out {
            let source = self.deps.session_source.clone();
            let label = self.label.clone();
            tokio::spawn(async move {
                if let Err(e) = source.sign_out().await {
                    warn!(guard = %label, error = %e, "Sign-out after denial failed");
                }
            });
        }

        info!(
            guard = %self.label,
            run = run.0,
            email = email.as_deref().unwrap_or("-"),
            reason = reason.as_str(),
            "Admin access denied"
        );
        Some(self.publish(Verdict::Unauthorized))
    }

    fn publish(&self, verdict: Verdict) -> Verdict {
        metrics::record_verdict(&verdict);
        self.verdict.send_replace(verdict.clone());
        verdict
    }
}
