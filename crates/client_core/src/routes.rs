//! Route model shared by the session, realtime and unread layers.

use std::sync::Arc;

use shared::domain::ContactId;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::ClientEvent;

pub const LOGIN_PATH: &str = "/login";
pub const MESSAGES_PATH: &str = "/messages";

/// Routes that render without an identity or a realtime connection.
pub const PUBLIC_PATHS: &[&str] = &[LOGIN_PATH, "/acompanhamento", "/privacy-policy"];

/// A route is public when it is an allowlisted path or nested under one.
pub fn is_public_path(route: &str) -> bool {
    PUBLIC_PATHS
        .iter()
        .any(|prefix| has_path_prefix(route, prefix))
}

pub fn is_messaging_route(route: &str) -> bool {
    has_path_prefix(route, MESSAGES_PATH)
}

/// Contact whose thread is open on `route`, taken from its trailing segment.
pub fn active_conversation(route: &str) -> Option<ContactId> {
    if !is_messaging_route(route) {
        return None;
    }
    let path = strip_query(route).trim_end_matches('/');
    let rest = path.strip_prefix(MESSAGES_PATH)?.strip_prefix('/')?;
    rest.rsplit('/').next()?.parse().ok()
}

pub fn conversation_route(contact_id: ContactId) -> String {
    format!("{MESSAGES_PATH}/{contact_id}")
}

fn strip_query(route: &str) -> &str {
    route
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
}

fn has_path_prefix(route: &str, prefix: &str) -> bool {
    let path = strip_query(route);
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Holds the current route and performs navigation.
///
/// Cloning shares the same underlying route; observers watch it through
/// [`Navigator::subscribe`].
#[derive(Clone)]
pub struct Navigator {
    current: Arc<watch::Sender<String>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Navigator {
    pub fn new(initial_route: impl Into<String>, events: broadcast::Sender<ClientEvent>) -> Self {
        let (current, _) = watch::channel(initial_route.into());
        Self {
            current: Arc::new(current),
            events,
        }
    }

    pub fn current(&self) -> String {
        self.current.borrow().clone()
    }

    pub fn navigate(&self, route: impl Into<String>) {
        let route = route.into();
        debug!(%route, "navigating");
        self.current.send_replace(route.clone());
        let _ = self.events.send(ClientEvent::Navigated(route));
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.current.subscribe()
    }
}
