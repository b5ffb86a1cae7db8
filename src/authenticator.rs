//! Token renewal scheduling.
//!
//! One [`CbsAuthenticator`] covers any number of audiences with a single
//! one-shot timer. Every successful `authenticate` with auto-renew records
//! the token expiry; the timer is always armed at (or before) the earliest
//! recorded expiry. When it fires, all due audiences are re-authenticated
//! concurrently under a shared deadline, failures are published to the
//! error subscribers and the timer is re-armed at the new minimum.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::cbs::CbsClient;
use crate::constants::{DEFAULT_TOKEN_DURATION, MIN_RENEW_DELAY, RENEW_TIMEOUT};
use crate::error::Error;
use crate::token::AsyncCbsTokenProvider;

/// Instant used for `timer_expiry` while a renewal pass is in progress. It
/// precedes every real expiry, so `authenticate`'s opportunistic re-arm is
/// disabled until the pass recomputes the minimum.
fn min_expiry() -> OffsetDateTime {
    time::PrimitiveDateTime::MIN.assume_utc()
}

/// Instant used for `timer_expiry` while no timer is armed
fn max_expiry() -> OffsetDateTime {
    time::PrimitiveDateTime::MAX.assume_utc()
}

/// A failed background renewal, published to error subscribers
#[derive(Debug, Clone)]
pub struct RenewalFailure {
    /// Audience whose renewal failed; it has been removed from the table
    pub audience: String,
    /// Claims the renewal asked for
    pub claims: Vec<String>,
    /// The error that failed the renewal
    pub error: Arc<Error>,
}

#[derive(Clone)]
struct RenewEntry {
    audience: String,
    claims: Vec<String>,
    due: OffsetDateTime,
}

struct RenewState {
    /// Keyed by the lowercased audience; an audience appears at most once
    entries: HashMap<String, RenewEntry>,
    /// Instant the timer is currently armed at, or a sentinel
    timer_expiry: OffsetDateTime,
}

/// Authenticates audiences against the peer's CBS node and keeps their
/// tokens fresh on a shared timer.
#[derive(Clone)]
pub struct CbsAuthenticator {
    inner: Arc<AuthenticatorInner>,
}

impl std::fmt::Debug for CbsAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbsAuthenticator")
            .field("audiences", &self.inner.renew.lock().entries.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

struct AuthenticatorInner {
    cbs: Arc<CbsClient>,
    provider: Arc<dyn AsyncCbsTokenProvider>,
    token_duration: Mutex<Duration>,
    renew: Mutex<RenewState>,
    timer: watch::Sender<Option<OffsetDateTime>>,
    errors: broadcast::Sender<RenewalFailure>,
    closed: AtomicBool,
}

impl CbsAuthenticator {
    /// Creates an authenticator over a CBS client and a token provider.
    ///
    /// Must be called within a Tokio runtime; the renewal timer task is
    /// spawned here.
    pub fn new(cbs: Arc<CbsClient>, provider: Arc<dyn AsyncCbsTokenProvider>) -> Self {
        let (timer_tx, timer_rx) = watch::channel(None);
        let (error_tx, _) = broadcast::channel(32);
        let inner = Arc::new(AuthenticatorInner {
            cbs,
            provider,
            token_duration: Mutex::new(DEFAULT_TOKEN_DURATION),
            renew: Mutex::new(RenewState {
                entries: HashMap::new(),
                timer_expiry: max_expiry(),
            }),
            timer: timer_tx,
            errors: error_tx,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(run_timer(Arc::downgrade(&inner), timer_rx));
        Self { inner }
    }

    /// Requested token validity, passed to the provider. Defaults to 20
    /// minutes.
    pub fn token_duration(&self) -> Duration {
        *self.inner.token_duration.lock()
    }

    /// Overrides the requested token validity
    pub fn set_token_duration(&self, duration: Duration) {
        *self.inner.token_duration.lock() = duration;
    }

    /// Obtain a token for `audience` and push it to the CBS node. With
    /// `auto_renew`, the audience is recorded and re-authenticated shortly
    /// before every expiry until [`remove`](Self::remove)d.
    ///
    /// Fails with [`Error::InvalidOperation`] before the connection's
    /// remote open has been observed.
    pub async fn authenticate(
        &self,
        audience: &str,
        claims: &[String],
        auto_renew: bool,
        ct: &CancellationToken,
    ) -> Result<(), Error> {
        self.inner.authenticate(audience, claims, auto_renew, ct).await
    }

    /// Stop renewing `audience`. Comparison is case-insensitive. Stops the
    /// timer when the table becomes empty.
    pub fn remove(&self, audience: &str) {
        let mut state = self.inner.renew.lock();
        state.entries.remove(&renew_key(audience));
        if state.entries.is_empty() {
            state.timer_expiry = max_expiry();
            let _ = self.inner.timer.send(None);
        }
    }

    /// Subscribe to background renewal failures
    pub fn subscribe_errors(&self) -> broadcast::Receiver<RenewalFailure> {
        self.inner.errors.subscribe()
    }

    /// Stop the timer. Recorded audiences are kept but never renewed again.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.inner.timer.send(None);
    }
}

fn renew_key(audience: &str) -> String {
    audience.to_lowercase()
}

impl AuthenticatorInner {
    async fn authenticate(
        self: &Arc<Self>,
        audience: &str,
        claims: &[String],
        auto_renew: bool,
        ct: &CancellationToken,
    ) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        if !self.cbs.is_open() {
            return Err(Error::InvalidOperation(
                "the connection has not completed open negotiation",
            ));
        }
        let duration = *self.token_duration.lock();
        let token = self
            .provider
            .get_token(audience, claims, duration, ct)
            .await
            .map_err(Error::Provider)?;
        let expires_at = token.expires_at();
        self.cbs.put_token(audience, token, ct).await?;

        if auto_renew {
            let mut state = self.renew.lock();
            state.entries.insert(
                renew_key(audience),
                RenewEntry {
                    audience: audience.to_string(),
                    claims: claims.to_vec(),
                    due: expires_at,
                },
            );
            if expires_at < state.timer_expiry {
                state.timer_expiry = expires_at;
                let _ = self.timer.send(Some(expires_at));
            }
        }
        Ok(())
    }

    /// One renewal pass: re-authenticate every due audience concurrently,
    /// report failures, then re-arm at the remaining minimum.
    async fn renew(self: &Arc<Self>) {
        let due_entries: Vec<RenewEntry> = {
            let mut state = self.renew.lock();
            state.timer_expiry = min_expiry();
            let now = OffsetDateTime::now_utc();
            state
                .entries
                .values()
                .filter(|entry| entry.due <= now)
                .cloned()
                .collect()
        };

        let cts = CancellationToken::new();
        let deadline = {
            let cts = cts.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RENEW_TIMEOUT).await;
                cts.cancel();
            })
        };
        let renewals = due_entries.iter().map(|entry| {
            let ct = cts.clone();
            async move {
                let result = self
                    .authenticate(&entry.audience, &entry.claims, true, &ct)
                    .await;
                (entry, result)
            }
        });
        let results = join_all(renewals).await;
        deadline.abort();

        // Teardown failures are noise; only report while the connection is up.
        if !self.cbs.is_connection_closed() {
            let mut reported = std::collections::HashSet::new();
            for (entry, result) in results {
                if let Err(error) = result {
                    if reported.insert(renew_key(&entry.audience)) {
                        tracing::error!(
                            audience = %entry.audience,
                            %error,
                            "token renewal failed, audience removed",
                        );
                        self.renew.lock().entries.remove(&renew_key(&entry.audience));
                        let _ = self.errors.send(RenewalFailure {
                            audience: entry.audience.clone(),
                            claims: entry.claims.clone(),
                            error: Arc::new(error),
                        });
                    }
                }
            }
        }

        let mut state = self.renew.lock();
        if self.cbs.is_connection_closed() {
            state.timer_expiry = max_expiry();
            let _ = self.timer.send(None);
        } else {
            match state.entries.values().map(|entry| entry.due).min() {
                Some(minimum) => {
                    state.timer_expiry = minimum;
                    let _ = self.timer.send(Some(minimum));
                }
                None => {
                    state.timer_expiry = max_expiry();
                    let _ = self.timer.send(None);
                }
            }
        }
    }
}

/// Sleep delay until `due`, clamped to one second when already past
fn delay_until(due: OffsetDateTime) -> Duration {
    let remaining = due - OffsetDateTime::now_utc();
    if remaining.is_positive() {
        Duration::from_millis(remaining.whole_milliseconds().min(i64::MAX as i128) as u64)
    } else {
        MIN_RENEW_DELAY
    }
}

/// The single timer: a one-shot retargeted through the watch channel.
/// `Some(at)` arms or retargets it, `None` stops it. The task holds only a
/// weak handle so dropping the authenticator tears it down.
async fn run_timer(
    inner: std::sync::Weak<AuthenticatorInner>,
    mut timer_rx: watch::Receiver<Option<OffsetDateTime>>,
) {
    loop {
        let armed_at = *timer_rx.borrow_and_update();
        match armed_at {
            None => {
                if timer_rx.changed().await.is_err() {
                    return;
                }
            }
            Some(due) => {
                tokio::select! {
                    changed = timer_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay_until(due)) => {
                        let Some(inner) = inner.upgrade() else { return };
                        if inner.closed.load(Ordering::Acquire) {
                            return;
                        }
                        inner.renew().await;
                    }
                }
            }
        }
    }
}
