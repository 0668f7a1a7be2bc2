use std::sync::{Arc, Weak};

use anyhow::Result;
use reqwest::cookie::Jar;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod config;
pub mod conversations;
pub mod error;
pub mod http;
pub mod realtime;
pub mod routes;
pub mod session;
pub mod signals;
pub mod unread;

pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, RefreshFailure};
pub use http::{ApiClient, ApiRequest, Timeouts};
pub use realtime::{
    ConnectionLease, RealtimeConnector, RealtimeHub, Subscription, WebSocketConnector,
};
pub use routes::{is_public_path, Navigator};
pub use session::{Session, SessionStore, SignOutReason};
pub use signals::{SessionExpired, SessionSignals};
pub use unread::UnreadCoordinator;

/// User-facing notices raised by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    SessionExpired,
    SignedOut,
}

impl Notice {
    pub fn message(&self) -> &'static str {
        match self {
            Self::SessionExpired => "Your session expired. Please sign in again.",
            Self::SignedOut => "You have been signed out.",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Notice(Notice),
    Navigated(String),
}

#[derive(Default)]
struct RuntimeState {
    started: bool,
    lease: Option<ConnectionLease>,
    unread_subscription: Option<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

/// Wires the session, HTTP, realtime and unread services together.
///
/// Each instance owns its own refresh coordinator and realtime slot, so tests
/// can build as many isolated clients as they need.
pub struct WorkshopClient {
    api: Arc<ApiClient>,
    signals: SessionSignals,
    navigator: Navigator,
    session: Arc<SessionStore>,
    realtime: Arc<RealtimeHub>,
    unread: Arc<UnreadCoordinator>,
    events: broadcast::Sender<ClientEvent>,
    runtime: Mutex<RuntimeState>,
    /// Serializes route application so a slow pass cannot overwrite a newer one.
    route_gate: Mutex<()>,
}

impl WorkshopClient {
    pub fn new(settings: &ClientSettings) -> Result<Arc<Self>> {
        let cookies = Arc::new(Jar::default());
        let connector = Arc::new(WebSocketConnector::new(
            settings.realtime_url()?,
            Arc::clone(&cookies),
        ));
        Self::assemble(settings, cookies, connector)
    }

    pub fn with_connector(
        settings: &ClientSettings,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Result<Arc<Self>> {
        Self::assemble(settings, Arc::new(Jar::default()), connector)
    }

    fn assemble(
        settings: &ClientSettings,
        cookies: Arc<Jar>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(256);
        let signals = SessionSignals::new();
        let api = ApiClient::new(
            settings.api_base_url()?,
            cookies,
            signals.clone(),
            Timeouts {
                request: settings.request_timeout,
                refresh: settings.refresh_timeout,
            },
        )?;
        let navigator = Navigator::new("/", events.clone());
        let session = SessionStore::new(Arc::clone(&api), navigator.clone(), events.clone());
        let realtime = RealtimeHub::new(connector, settings.realtime_timeout);
        let unread = UnreadCoordinator::new(Arc::clone(&api), navigator.clone());

        Ok(Arc::new(Self {
            api,
            signals,
            navigator,
            session,
            realtime,
            unread,
            events,
            runtime: Mutex::new(RuntimeState::default()),
            route_gate: Mutex::new(()),
        }))
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn realtime(&self) -> &Arc<RealtimeHub> {
        &self.realtime
    }

    pub fn unread(&self) -> &Arc<UnreadCoordinator> {
        &self.unread
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Mounts the client on `initial_route`. Later calls are ignored.
    pub async fn start(self: &Arc<Self>, initial_route: impl Into<String>) {
        let route = initial_route.into();
        {
            let mut runtime = self.runtime.lock().await;
            if runtime.started {
                return;
            }
            runtime.started = true;

            runtime
                .tasks
                .push(self.session.spawn_expiry_listener(&self.signals));
            let unread = Arc::clone(&self.unread);
            runtime.unread_subscription = Some(self.realtime.on_message_received(
                move |contact_id| {
                    unread.record_incoming(contact_id);
                },
            ));

            self.navigator.navigate(route.clone());
            runtime.tasks.push(spawn_route_watcher(Arc::downgrade(self), &self.navigator));
        }
        info!(%route, "workshop client starting");

        self.apply_current_route().await;
    }

    /// Changes route; the session and realtime layers follow asynchronously.
    pub fn navigate(&self, route: impl Into<String>) {
        self.navigator.navigate(route);
    }

    pub async fn shutdown(&self) {
        let mut runtime = self.runtime.lock().await;
        for task in runtime.tasks.drain(..) {
            task.abort();
        }
        runtime.unread_subscription = None;
        if let Some(lease) = runtime.lease.take() {
            self.realtime.release(lease).await;
        }
        runtime.started = false;
        info!("workshop client stopped");
    }

    /// Brings session, realtime and unread state in line with the current
    /// route. Always reads the route afresh, so a queued pass applies the
    /// latest navigation rather than the one that triggered it.
    async fn apply_current_route(&self) {
        let _gate = self.route_gate.lock().await;
        let route = self.navigator.current();
        self.session.initialize(&route).await;

        // Sign-out during initialization may already have moved us elsewhere.
        let current = self.navigator.current();
        if is_public_path(&current) {
            self.realtime.disconnect().await;
            self.runtime.lock().await.lease = None;
            self.unread.reset();
            return;
        }

        if !self.realtime.is_connected() {
            match self.realtime.connect(&current).await {
                Ok(Some(lease)) if lease.is_owner() => {
                    self.runtime.lock().await.lease = Some(lease);
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "realtime unavailable; continuing without push events"),
            }
        }

        if !self.session.is_authenticated() {
            self.unread.reset();
        } else if let Err(err) = self.unread.prime_once().await {
            warn!(%err, "unread poll failed");
        }
    }
}

fn spawn_route_watcher(client: Weak<WorkshopClient>, navigator: &Navigator) -> JoinHandle<()> {
    let mut routes = navigator.subscribe();
    tokio::spawn(async move {
        while routes.changed().await.is_ok() {
            let _ = routes.borrow_and_update();
            let Some(client) = client.upgrade() else {
                break;
            };
            client.apply_current_route().await;
        }
    })
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
