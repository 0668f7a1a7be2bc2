//! Who is signed in, and the single place that signs them out.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use shared::protocol::{Identity, SignInRequest};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    http::{ApiClient, ApiRequest},
    routes::{is_public_path, Navigator, LOGIN_PATH},
    signals::{SessionExpired, SessionSignals},
    ClientEvent, Notice,
};

pub const IDENTITY_PATH: &str = "/users/me";
pub const SESSIONS_PATH: &str = "/sessions";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub identity: Option<Identity>,
    pub fetch_attempted: bool,
    pub loading: bool,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    UserRequested,
    SessionExpired,
}

impl SignOutReason {
    fn notice(self) -> Notice {
        match self {
            Self::UserRequested => Notice::SignedOut,
            Self::SessionExpired => Notice::SessionExpired,
        }
    }
}

pub struct SessionStore {
    api: Arc<ApiClient>,
    navigator: Navigator,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Sender<Session>,
    logging_out: AtomicBool,
}

impl SessionStore {
    pub fn new(
        api: Arc<ApiClient>,
        navigator: Navigator,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(Session::default());
        Arc::new(Self {
            api,
            navigator,
            events,
            state,
            logging_out: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.borrow().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn is_logging_out(&self) -> bool {
        self.logging_out.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Reconciles the session with the route being entered.
    ///
    /// Public routes drop any identity and skip the network. Every other
    /// route re-fetches the identity; only a terminal authorization failure
    /// signs the user out.
    pub async fn initialize(&self, route: &str) {
        if is_public_path(route) {
            debug!(%route, "public route; skipping identity fetch");
            self.state.send_replace(Session {
                identity: None,
                fetch_attempted: true,
                loading: false,
            });
            return;
        }

        self.state.send_modify(|session| {
            session.fetch_attempted = false;
            session.loading = true;
        });

        let request = ApiRequest::get(IDENTITY_PATH).allow_refresh(true);
        match self.api.send_json::<Identity>(request).await {
            Ok(identity) => {
                info!(user_id = %identity.id, "identity loaded");
                // A live identity means any earlier sign-out is over; rearm it.
                self.logging_out.store(false, Ordering::SeqCst);
                self.state.send_replace(Session {
                    identity: Some(identity),
                    fetch_attempted: true,
                    loading: false,
                });
            }
            Err(err) => {
                self.state.send_modify(|session| {
                    session.fetch_attempted = true;
                    session.loading = false;
                });
                if err.is_terminal_auth() {
                    warn!(%err, "identity fetch failed after refresh; signing out");
                    self.sign_out(SignOutReason::SessionExpired).await;
                } else {
                    warn!(%err, "identity fetch failed; keeping current session");
                }
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, ClientError> {
        let request = ApiRequest::post(SESSIONS_PATH)
            .json(&SignInRequest {
                email: email.to_string(),
                password: password.to_string(),
            })?
            .allow_refresh(false);
        let identity: Identity = self.api.send_json(request).await?;

        self.logging_out.store(false, Ordering::SeqCst);
        self.state.send_replace(Session {
            identity: Some(identity.clone()),
            fetch_attempted: true,
            loading: false,
        });
        info!(user_id = %identity.id, "signed in");
        Ok(identity)
    }

    /// Signs out once; repeat calls do nothing until a sign-in or an
    /// identity fetch re-establishes the session.
    ///
    /// Returns whether this call performed the sign-out.
    pub async fn sign_out(&self, reason: SignOutReason) -> bool {
        if self.logging_out.swap(true, Ordering::SeqCst) {
            debug!(?reason, "sign-out already performed");
            return false;
        }
        info!(?reason, "signing out");

        let request = ApiRequest::delete(SESSIONS_PATH).allow_refresh(false);
        if let Err(err) = self.api.send(request).await {
            warn!(%err, "server-side sign-out failed; clearing local session anyway");
        }

        self.state.send_replace(Session::default());
        let _ = self.events.send(ClientEvent::Notice(reason.notice()));
        self.navigator.navigate(LOGIN_PATH);
        true
    }

    /// Signs out whenever the HTTP layer reports an unrecoverable refresh.
    pub fn spawn_expiry_listener(self: &Arc<Self>, signals: &SessionSignals) -> JoinHandle<()> {
        let mut expired_rx = signals.subscribe();
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match expired_rx.recv().await {
                    Ok(SessionExpired) | Err(RecvError::Lagged(_)) => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        store.sign_out(SignOutReason::SessionExpired).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
