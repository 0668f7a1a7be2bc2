//! Cookie-authenticated API client with single-flight session refresh.
//!
//! Every request gets one retry budget. A 401 parks the request behind the
//! shared refresh; when the refresh settles the request is replayed once or
//! failed with the refresh error. Only one refresh runs at a time per client.

use std::{sync::Arc, time::Duration};

use reqwest::{cookie::Jar, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, RefreshFailure},
    signals::SessionSignals,
};

pub const REFRESH_PATH: &str = "/sessions/refresh";

type RefreshOutcome = Result<(), RefreshFailure>;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub request: Duration,
    pub refresh: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            refresh: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    allow_refresh: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            allow_refresh: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ClientError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Whether a 401 on this request may start (or join) a session refresh.
    pub fn allow_refresh(mut self, allow: bool) -> Self {
        self.allow_refresh = allow;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn is_refresh(&self) -> bool {
        self.path.trim_end_matches('/') == REFRESH_PATH
    }

    fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

pub struct ApiClient {
    http: Client,
    base_url: Url,
    cookies: Arc<Jar>,
    timeouts: Timeouts,
    signals: SessionSignals,
    refresh: Mutex<RefreshState>,
}

impl ApiClient {
    pub fn new(
        base_url: Url,
        cookies: Arc<Jar>,
        signals: SessionSignals,
        timeouts: Timeouts,
    ) -> Result<Arc<Self>, ClientError> {
        let http = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .build()?;
        Ok(Arc::new(Self {
            http,
            base_url,
            cookies,
            timeouts,
            signals,
            refresh: Mutex::new(RefreshState::default()),
        }))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Cookie jar shared with the realtime transport.
    pub fn cookies(&self) -> Arc<Jar> {
        Arc::clone(&self.cookies)
    }

    pub async fn refresh_in_progress(&self) -> bool {
        self.refresh.lock().await.in_progress
    }

    pub async fn send(self: &Arc<Self>, request: ApiRequest) -> Result<Response, ClientError> {
        let response = self.dispatch(&request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }
        if request.is_refresh() || !request.allow_refresh {
            debug!(request = %request.label(), "401 without refresh eligibility");
            return Err(ClientError::Unauthorized {
                refresh_exhausted: false,
            });
        }

        debug!(request = %request.label(), "401 received; waiting on session refresh");
        self.await_refresh().await?;

        let replay = self.dispatch(&request).await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            warn!(request = %request.label(), "still unauthorized after session refresh");
            return Err(ClientError::Unauthorized {
                refresh_exhausted: true,
            });
        }
        check_status(replay).await
    }

    pub async fn send_json<T: DeserializeOwned>(
        self: &Arc<Self>,
        request: ApiRequest,
    ) -> Result<T, ClientError> {
        let bytes = self.send(request).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_json<T: DeserializeOwned>(
        self: &Arc<Self>,
        path: impl Into<String>,
    ) -> Result<T, ClientError> {
        self.send_json(ApiRequest::get(path)).await
    }

    fn resolve(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<Response, ClientError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.resolve(&request.path)?);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        match tokio::time::timeout(self.timeouts.request, builder.send()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClientError::Timeout {
                operation: request.label(),
                after: self.timeouts.request,
            }),
        }
    }

    /// Joins the in-flight refresh, starting one if none is running.
    async fn await_refresh(self: &Arc<Self>) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.refresh.lock().await;
            state.waiters.push(tx);
            if state.in_progress {
                debug!(waiters = state.waiters.len(), "queued behind in-flight refresh");
            } else {
                state.in_progress = true;
                // Detached so dropping the request that started it cannot strand the waiters.
                let client = Arc::clone(self);
                tokio::spawn(async move { client.run_refresh().await });
            }
        }

        match rx.await {
            Ok(outcome) => outcome.map_err(ClientError::from),
            Err(_) => Err(ClientError::RefreshAborted),
        }
    }

    async fn run_refresh(self: Arc<Self>) {
        let outcome = self.refresh_session().await;

        let waiters = {
            let mut state = self.refresh.lock().await;
            state.in_progress = false;
            std::mem::take(&mut state.waiters)
        };

        match &outcome {
            Ok(()) => info!(waiters = waiters.len(), "session refreshed"),
            Err(failure) => {
                warn!(waiters = waiters.len(), %failure, "session refresh failed");
                if failure.expires_session() {
                    self.signals.emit_session_expired();
                }
            }
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn refresh_session(&self) -> RefreshOutcome {
        let url = self
            .resolve(REFRESH_PATH)
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
        match tokio::time::timeout(self.timeouts.refresh, self.http.get(url).send()).await {
            Err(_) => Err(RefreshFailure::TimedOut(self.timeouts.refresh)),
            Ok(Err(err)) => Err(RefreshFailure::Transport(err.to_string())),
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(RefreshFailure::Rejected(response.status())),
        }
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status { status, body })
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
