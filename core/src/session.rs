//! Session Lifecycle Manager
//!
//! Owns the single [`EncryptionSession`] of a wallet connection.
//!
//! ```text
//!          initialize()              resolved + opened
//!   Idle ───────────────▶ Initializing ────────────────▶ Ready
//!    ▲                        │   │                        │
//!    │        abort()/reset() │   │ error                  │ reset(), chain or
//!    └────────────────────────┘   ▼                        │ account change
//!    ▲                         Failed ── initialize() ─▶ … │
//!    └─────────────────────────────────────────────────────┘
//! ```
//!
//! Initialization is single-flight: while one attempt runs, further
//! `initialize` calls wait for it and share its outcome. Each attempt gets its
//! own cancellation token; a cancelled attempt returns to `Idle` without
//! recording an error.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use veil_types::Address;

use crate::backend::{BackendError, BackendKind, EncryptionSession, RelayerSettings};
use crate::capability::{CapabilityResolver, ResolveError};
use crate::rpc::{ProviderSource, RpcError};

// Session State

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session and nothing in flight
    Idle,
    /// An initialization attempt is running
    Initializing,
    /// A session is available
    Ready { chain_id: u64, kind: BackendKind },
    /// The last attempt failed; `initialize` retries
    Failed(String),
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("session initialization was aborted")]
    Aborted,

    #[error("could not determine chain id: {0}")]
    ChainId(RpcError),

    #[error("chain {chain_id} needs a relayer but none is configured")]
    RelayerUnavailable { chain_id: u64 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("session initialization failed: {0}")]
    Failed(String),
}

impl SessionError {
    pub fn is_abort(&self) -> bool {
        matches!(self, SessionError::Aborted)
    }
}

impl From<ResolveError> for SessionError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Aborted => SessionError::Aborted,
            ResolveError::ChainId(e) => SessionError::ChainId(e),
        }
    }
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::RelayerUnavailable { chain_id } => {
                SessionError::RelayerUnavailable { chain_id }
            }
            other => SessionError::Backend(other.to_string()),
        }
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Arc<EncryptionSession>>,
    /// Token of the attempt in flight
    cancel: Option<CancellationToken>,
    last_error: Option<String>,
    /// Bumped whenever an attempt is superseded (abort, reset)
    generation: u64,
}

pub struct SessionManager {
    resolver: CapabilityResolver,
    relayer: Option<RelayerSettings>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(resolver: CapabilityResolver) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            resolver,
            relayer: None,
            inner: Mutex::new(Inner::default()),
            state_tx,
        }
    }

    pub fn with_relayer(mut self, relayer: Option<RelayerSettings>) -> Self {
        self.relayer = relayer;
        self
    }

    pub fn resolver(&self) -> &CapabilityResolver {
        &self.resolver
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub async fn session(&self) -> Option<Arc<EncryptionSession>> {
        self.inner.lock().await.session.clone()
    }

    /// Message of the last non-abort failure, until the next success or reset.
    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Get the session, creating it if needed.
    pub async fn initialize(
        &self,
        source: ProviderSource,
    ) -> Result<Arc<EncryptionSession>, SessionError> {
        let (token, generation) = {
            let mut inner = self.inner.lock().await;
            if let Some(session) = &inner.session {
                return Ok(session.clone());
            }
            if inner.cancel.is_some() {
                let rx = self.state_tx.subscribe();
                drop(inner);
                debug!("Session initialization already in flight, waiting");
                return self.join_in_flight(rx).await;
            }

            let token = CancellationToken::new();
            inner.cancel = Some(token.clone());
            inner.generation += 1;
            self.state_tx.send_replace(SessionState::Initializing);
            (token, inner.generation)
        };

        let outcome = self.attempt(&source, &token).await;

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!("Session attempt superseded, discarding its outcome");
            return Err(SessionError::Aborted);
        }
        inner.cancel = None;

        match outcome {
            Ok(session) => {
                let session = Arc::new(session);
                inner.session = Some(session.clone());
                inner.last_error = None;
                self.state_tx.send_replace(SessionState::Ready {
                    chain_id: session.chain_id(),
                    kind: session.kind(),
                });
                info!(
                    "Encryption session ready (chain={}, backend={:?})",
                    session.chain_id(),
                    session.kind()
                );
                Ok(session)
            }
            Err(SessionError::Aborted) => {
                debug!("Session initialization cancelled");
                self.state_tx.send_replace(SessionState::Idle);
                Err(SessionError::Aborted)
            }
            Err(err) => {
                warn!("Session initialization failed: {}", err);
                inner.last_error = Some(err.to_string());
                self.state_tx.send_replace(SessionState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        source: &ProviderSource,
        token: &CancellationToken,
    ) -> Result<EncryptionSession, SessionError> {
        let descriptor = self.resolver.resolve(source, token).await?;
        debug!("Resolved backend: {:?}", descriptor);

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Aborted),
            opened = EncryptionSession::open(
                &descriptor,
                self.resolver.connector(),
                self.relayer.as_ref(),
            ) => Ok(opened?),
        }
    }

    async fn join_in_flight(
        &self,
        mut rx: watch::Receiver<SessionState>,
    ) -> Result<Arc<EncryptionSession>, SessionError> {
        let settled = rx
            .wait_for(|state| *state != SessionState::Initializing)
            .await
            .map(|state| state.clone())
            .map_err(|_| SessionError::Aborted)?;

        match settled {
            SessionState::Ready { .. } => {
                self.session().await.ok_or(SessionError::Aborted)
            }
            SessionState::Failed(message) => Err(SessionError::Failed(message)),
            _ => Err(SessionError::Aborted),
        }
    }

    /// Cancel the attempt in flight, if any. A ready session is kept.
    pub async fn abort(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.cancel.take() {
            token.cancel();
            inner.generation += 1;
            self.state_tx.send_replace(SessionState::Idle);
            debug!("Session initialization aborted");
        }
    }

    /// Drop the session (and any attempt in flight) and return to `Idle`.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.cancel.take() {
            token.cancel();
        }
        let had_session = inner.session.take().is_some();
        inner.last_error = None;
        inner.generation += 1;
        self.state_tx.send_replace(SessionState::Idle);
        if had_session {
            info!("Encryption session discarded");
        }
    }

    /// Wallet switched networks.
    pub async fn on_chain_changed(&self, chain_id: u64) {
        let stale = {
            let inner = self.inner.lock().await;
            match &inner.session {
                Some(session) => session.chain_id() != chain_id,
                None => inner.cancel.is_some(),
            }
        };
        if stale {
            debug!("Chain changed to {}, resetting session", chain_id);
            self.reset().await;
        }
    }

    /// Wallet accounts changed; an empty list means disconnected.
    pub async fn on_accounts_changed(&self, accounts: &[Address]) {
        if accounts.is_empty() {
            debug!("Wallet disconnected, resetting session");
            self.reset().await;
        }
    }
}
