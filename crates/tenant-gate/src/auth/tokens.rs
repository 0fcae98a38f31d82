//! Token storage and refresh scheduling

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Tokens issued by the credential provider
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds; 0 means already expired
    pub refresh_expires_in: u64,
    pub token_type: String,
    pub received_at: SystemTime,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .field("token_type", &self.token_type)
            .field("received_at", &self.received_at)
            .finish()
    }
}

impl TokenSet {
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            id_token: None,
            expires_in: 0,
            refresh_expires_in: 0,
            token_type: "Bearer".to_string(),
            received_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub const fn with_lifetimes(mut self, expires_in: u64, refresh_expires_in: u64) -> Self {
        self.expires_in = expires_in;
        self.refresh_expires_in = refresh_expires_in;
        self
    }

    #[must_use]
    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }
}

/// The single pending refresh timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedRefresh {
    pub generation: u64,
    pub delay: Duration,
}

type Listener = Arc<dyn Fn() + Send + Sync>;

struct Stored {
    tokens: TokenSet,
    received: Instant,
}

struct Armed {
    info: ArmedRefresh,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    current: Option<Stored>,
    armed: Option<Armed>,
    generation: u64,
}

impl State {
    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.cancel.cancel();
        }
    }
}

struct Shared {
    state: Mutex<State>,
    threshold: Duration,
    refresh_listeners: RwLock<Vec<Listener>>,
    expired_listeners: RwLock<Vec<Listener>>,
}

impl Shared {
    fn notify(listeners: &RwLock<Vec<Listener>>) {
        let snapshot: Vec<Listener> = listeners.read().clone();
        for listener in snapshot {
            listener();
        }
    }

    fn fire(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            match &state.armed {
                Some(armed) if armed.info.generation == generation => state.armed = None,
                _ => {
                    tracing::trace!(generation, "Superseded refresh timer ignored");
                    return;
                }
            }
        }
        tracing::debug!(generation, "Access token refresh due");
        Self::notify(&self.refresh_listeners);
    }
}

/// Owns the current [`TokenSet`] and its single refresh timer.
///
/// Elapsed time is measured from receipt on every read, so a token is never
/// handed out past its lifetime even when the timer has not fired.
pub struct TokenLifecycleManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TokenLifecycleManager")
            .field("threshold", &self.shared.threshold)
            .field("has_tokens", &state.current.is_some())
            .field("armed", &state.armed.as_ref().map(|a| a.info))
            .finish_non_exhaustive()
    }
}

impl Default for TokenLifecycleManager {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_REFRESH_THRESHOLD)
    }
}

impl TokenLifecycleManager {
    #[must_use]
    pub fn new(refresh_threshold: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                threshold: refresh_threshold,
                refresh_listeners: RwLock::new(Vec::new()),
                expired_listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn refresh_threshold(&self) -> Duration {
        self.shared.threshold
    }

    /// Store a new set and arm its refresh timer, cancelling any previous one
    pub fn set_tokens(&self, tokens: TokenSet) {
        let lifetime = Duration::from_secs(tokens.expires_in);
        let delay = lifetime.saturating_sub(self.shared.threshold);

        let mut state = self.shared.state.lock();
        state.disarm();
        state.generation += 1;
        let generation = state.generation;
        state.current = Some(Stored {
            tokens,
            received: Instant::now(),
        });

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime; token refresh will not be scheduled");
            return;
        };

        let cancel = CancellationToken::new();
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let token = cancel.clone();
        let deadline = Instant::now() + delay;
        handle.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.fire(generation);
                    }
                }
                () = token.cancelled() => {
                    tracing::trace!(generation, "Refresh timer cancelled");
                }
            }
        });

        state.armed = Some(Armed {
            info: ArmedRefresh { generation, delay },
            cancel,
        });
        tracing::debug!(
            generation,
            delay_secs = delay.as_secs(),
            "Token set installed"
        );
    }

    /// Current tokens with `expires_in` reduced by the whole seconds elapsed.
    ///
    /// `received_at` moves forward by the same amount, so a returned set that
    /// is persisted and later resumed keeps its original absolute expiry.
    ///
    /// Returns `None` once the lifetime has elapsed; detecting that destroys
    /// the set and notifies expiry listeners.
    pub fn get_valid_tokens(&self) -> Option<TokenSet> {
        let mut state = self.shared.state.lock();
        let stored = state.current.as_ref()?;
        let elapsed = stored.received.elapsed();

        if elapsed >= Duration::from_secs(stored.tokens.expires_in) {
            state.current = None;
            state.disarm();
            drop(state);
            tracing::info!("Access token expired");
            Shared::notify(&self.shared.expired_listeners);
            return None;
        }

        let whole = elapsed.as_secs();
        let mut tokens = stored.tokens.clone();
        tokens.expires_in -= whole;
        tokens.refresh_expires_in = tokens.refresh_expires_in.saturating_sub(whole);
        tokens.received_at += Duration::from_secs(whole);
        Some(tokens)
    }

    pub fn has_valid(&self) -> bool {
        self.get_valid_tokens().is_some()
    }

    /// True while the set is valid and within the refresh threshold of expiry
    pub fn needs_refresh(&self) -> bool {
        let mut state = self.shared.state.lock();
        let Some(stored) = state.current.as_ref() else {
            return false;
        };
        let lifetime = Duration::from_secs(stored.tokens.expires_in);
        let elapsed = stored.received.elapsed();
        if elapsed >= lifetime {
            state.current = None;
            state.disarm();
            drop(state);
            Shared::notify(&self.shared.expired_listeners);
            return false;
        }
        lifetime - elapsed <= self.shared.threshold
    }

    /// Whether the stored refresh token can still be exchanged
    pub fn refresh_token_valid(&self) -> bool {
        let state = self.shared.state.lock();
        state.current.as_ref().is_some_and(|stored| {
            stored.tokens.refresh_expires_in > 0
                && stored.received.elapsed() < Duration::from_secs(stored.tokens.refresh_expires_in)
        })
    }

    /// Stored refresh token, regardless of access token validity
    pub fn refresh_token(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|s| s.tokens.refresh_token.clone())
    }

    /// Destroy the set and cancel the timer without notifying listeners
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.current = None;
        state.disarm();
    }

    /// Destroy the set and notify expiry listeners
    pub fn expire(&self) {
        self.clear();
        tracing::info!("Token set expired");
        Shared::notify(&self.shared.expired_listeners);
    }

    pub fn armed_refresh(&self) -> Option<ArmedRefresh> {
        self.shared.state.lock().armed.as_ref().map(|a| a.info)
    }

    pub fn on_refresh_needed<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.refresh_listeners.write().push(Arc::new(listener));
    }

    pub fn on_expired<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.expired_listeners.write().push(Arc::new(listener));
    }
}

impl Drop for TokenLifecycleManager {
    fn drop(&mut self) {
        self.shared.state.lock().disarm();
    }
}
