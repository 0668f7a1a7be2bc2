//! One shared push connection, fanned out to every subscriber.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex as SyncMutex;
use reqwest::cookie::{CookieStore, Jar};
use shared::{domain::ContactId, protocol::ServerEvent};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::ClientError, routes::is_public_path};

pub type EventStream = BoxStream<'static, Result<ServerEvent, ClientError>>;
pub type MessageHandler = Arc<dyn Fn(ContactId) + Send + Sync>;

type HandlerMap = SyncMutex<BTreeMap<u64, MessageHandler>>;

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self) -> Result<EventStream, ClientError>;
}

/// Websocket transport authenticated with the API client's cookies.
pub struct WebSocketConnector {
    url: Url,
    cookies: Arc<Jar>,
}

impl WebSocketConnector {
    pub fn new(url: Url, cookies: Arc<Jar>) -> Self {
        Self { url, cookies }
    }

    fn cookie_header(&self) -> Option<HeaderValue> {
        // Cookies were issued to the http origin; look them up there.
        let mut origin = self.url.clone();
        let scheme = match origin.scheme() {
            "wss" => "https",
            _ => "http",
        };
        origin.set_scheme(scheme).ok()?;
        let value = self.cookies.cookies(&origin)?;
        HeaderValue::from_str(value.to_str().ok()?).ok()
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self) -> Result<EventStream, ClientError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ClientError::Realtime(err.to_string()))?;
        if let Some(cookie) = self.cookie_header() {
            request.headers_mut().insert(COOKIE, cookie);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| ClientError::Realtime(format!("{}: {err}", self.url)))?;
        let (_, ws_reader) = ws_stream.split();

        let events = ws_reader.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<ServerEvent>(&text).map_err(ClientError::from))
                }
                Ok(_) => None,
                Err(err) => Some(Err(ClientError::Realtime(err.to_string()))),
            }
        });
        Ok(events.boxed())
    }
}

/// Proof of holding the connection. Only the lease that created the
/// connection can release it.
#[derive(Debug)]
pub struct ConnectionLease {
    id: u64,
    owner: bool,
}

impl ConnectionLease {
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

/// Keeps a handler registered; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    handlers: Weak<HandlerMap>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.lock().remove(&self.id);
        }
    }
}

struct ActiveConnection {
    lease_id: u64,
    reader: JoinHandle<()>,
}

pub struct RealtimeHub {
    connector: Arc<dyn RealtimeConnector>,
    connect_timeout: Duration,
    slot: Mutex<Option<ActiveConnection>>,
    /// Lease id of the live connection, 0 when disconnected.
    live: Arc<AtomicU64>,
    handlers: Arc<HandlerMap>,
    next_id: AtomicU64,
}

impl RealtimeHub {
    pub fn new(connector: Arc<dyn RealtimeConnector>, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connector,
            connect_timeout,
            slot: Mutex::new(None),
            live: Arc::new(AtomicU64::new(0)),
            handlers: Arc::new(SyncMutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.live.load(Ordering::SeqCst) != 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Opens the shared connection for `route`, or joins the existing one.
    ///
    /// Public routes never connect and yield `None`.
    pub async fn connect(&self, route: &str) -> Result<Option<ConnectionLease>, ClientError> {
        if is_public_path(route) {
            debug!(%route, "public route; realtime stays disconnected");
            return Ok(None);
        }

        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            if self.live.load(Ordering::SeqCst) == active.lease_id {
                return Ok(Some(ConnectionLease {
                    id: active.lease_id,
                    owner: false,
                }));
            }
        }

        let attempt = tokio::time::timeout(self.connect_timeout, self.connector.connect()).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(%err, "realtime connection failed");
                return Err(err);
            }
            Err(_) => {
                warn!(after = ?self.connect_timeout, "realtime connection timed out");
                return Err(ClientError::Timeout {
                    operation: "realtime connect".into(),
                    after: self.connect_timeout,
                });
            }
        };
        let lease_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.store(lease_id, Ordering::SeqCst);
        let reader = tokio::spawn(pump_events(
            lease_id,
            stream,
            Arc::clone(&self.handlers),
            Arc::clone(&self.live),
        ));
        *slot = Some(ActiveConnection { lease_id, reader });
        info!(lease_id, "realtime connected");

        Ok(Some(ConnectionLease {
            id: lease_id,
            owner: true,
        }))
    }

    /// Tears the connection down if `lease` created it; otherwise a no-op.
    pub async fn release(&self, lease: ConnectionLease) {
        if !lease.owner {
            return;
        }
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|active| active.lease_id == lease.id) {
            close(&mut slot, &self.live);
        }
    }

    /// Unconditional teardown, used when entering a public route.
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        close(&mut slot, &self.live);
    }

    pub fn on_message_received<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ContactId) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().insert(id, Arc::new(handler));
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }
}

fn close(slot: &mut Option<ActiveConnection>, live: &AtomicU64) {
    if let Some(active) = slot.take() {
        active.reader.abort();
        let _ = live.compare_exchange(active.lease_id, 0, Ordering::SeqCst, Ordering::SeqCst);
        info!(lease_id = active.lease_id, "realtime disconnected");
    }
}

async fn pump_events(
    lease_id: u64,
    mut stream: EventStream,
    handlers: Arc<HandlerMap>,
    live: Arc<AtomicU64>,
) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(ServerEvent::MessageReceived { contact_id }) => {
                let targets: Vec<MessageHandler> = handlers.lock().values().cloned().collect();
                debug!(%contact_id, subscribers = targets.len(), "message received");
                for handler in targets {
                    handler(contact_id);
                }
            }
            Ok(ServerEvent::Unknown) => debug!("ignoring unrecognised realtime event"),
            Err(err) => warn!(%err, "realtime transport error"),
        }
    }
    let _ = live.compare_exchange(lease_id, 0, Ordering::SeqCst, Ordering::SeqCst);
    info!(lease_id, "realtime connection ended");
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
