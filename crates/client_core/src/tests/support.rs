//! In-process fake of the workshop API used across the client tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use reqwest::cookie::Jar;
use shared::{
    domain::{ContactId, MessageDirection, MessageId, UserId},
    protocol::{ConversationSummary, Identity, MessagePayload, ServerEvent, SignInRequest},
};
use tokio::{net::TcpListener, sync::broadcast};
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use crate::{
    error::ClientError,
    http::{ApiClient, Timeouts},
    realtime::{EventStream, RealtimeConnector},
    signals::SessionSignals,
};

pub const GOOD_PASSWORD: &str = "correct horse";

/// How `/users/me` and `/conversations` treat the presented cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Valid regardless of cookies.
    Valid,
    /// 401 until a refresh has issued a cookie.
    NeedsRefresh,
    AlwaysUnauthorized,
    ServerError,
}

pub struct FakeBackend {
    pub auth_mode: SyncMutex<AuthMode>,
    pub reject_refresh: AtomicBool,
    pub refresh_delay_ms: AtomicU64,
    pub identity_delay_ms: AtomicU64,
    pub generation: AtomicUsize,
    pub identity_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub conversation_calls: AtomicUsize,
    pub summaries: SyncMutex<Vec<ConversationSummary>>,
    pub marked_read: SyncMutex<Vec<ContactId>>,
    pub ws_cookie: SyncMutex<Option<String>>,
    pub push: broadcast::Sender<String>,
}

impl FakeBackend {
    fn new() -> Self {
        let (push, _) = broadcast::channel(64);
        Self {
            auth_mode: SyncMutex::new(AuthMode::Valid),
            reject_refresh: AtomicBool::new(false),
            refresh_delay_ms: AtomicU64::new(0),
            identity_delay_ms: AtomicU64::new(0),
            generation: AtomicUsize::new(0),
            identity_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            conversation_calls: AtomicUsize::new(0),
            summaries: SyncMutex::new(Vec::new()),
            marked_read: SyncMutex::new(Vec::new()),
            ws_cookie: SyncMutex::new(None),
            push,
        }
    }

    pub fn set_auth_mode(&self, mode: AuthMode) {
        *self.auth_mode.lock() = mode;
    }

    pub fn set_summaries(&self, summaries: Vec<ConversationSummary>) {
        *self.summaries.lock() = summaries;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Pushes a `message_received` frame to every open socket.
    pub fn push_message_received(&self, contact_id: ContactId) {
        let frame = serde_json::json!({
            "type": "message_received",
            "payload": { "contactId": contact_id.0 },
        });
        let _ = self.push.send(frame.to_string());
    }
}

pub fn sample_identity() -> Identity {
    Identity {
        id: UserId(7),
        name: "Marta Ribeiro".into(),
        email: "marta@oficina.test".into(),
        is_admin: true,
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
    }
}

pub fn summary(contact_id: i64, has_unread: bool) -> ConversationSummary {
    ConversationSummary {
        contact_id: ContactId(contact_id),
        has_unread,
        last_message: Some("Carro pronto?".into()),
    }
}

type Backend = Arc<FakeBackend>;

/// Applies the current [`AuthMode`] to a protected request.
fn authorize(state: &FakeBackend, headers: &HeaderMap) -> Result<(), Response> {
    match *state.auth_mode.lock() {
        AuthMode::Valid => Ok(()),
        AuthMode::AlwaysUnauthorized => Err(StatusCode::UNAUTHORIZED.into_response()),
        AuthMode::ServerError => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "code": "internal", "message": "database offline" })),
        )
            .into_response()),
        AuthMode::NeedsRefresh => {
            let generation = state.generation.load(Ordering::SeqCst);
            let presented = headers
                .get(header::COOKIE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if generation > 0 && presented.contains(&format!("access_token=fresh-{generation}")) {
                Ok(())
            } else {
                Err(StatusCode::UNAUTHORIZED.into_response())
            }
        }
    }
}

async fn handle_identity(State(state): State<Backend>, headers: HeaderMap) -> Response {
    state.identity_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.identity_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    match authorize(&state, &headers) {
        Ok(()) => Json(sample_identity()).into_response(),
        Err(rejection) => rejection,
    }
}

async fn handle_refresh(State(state): State<Backend>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.reject_refresh.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let generation = state.generation.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::NO_CONTENT,
        [(
            header::SET_COOKIE,
            format!("access_token=fresh-{generation}; Path=/"),
        )],
    )
        .into_response()
}

async fn handle_sign_in(Json(request): Json<SignInRequest>) -> Response {
    if request.password != GOOD_PASSWORD {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        [(header::SET_COOKIE, "access_token=fresh-0; Path=/")],
        Json(sample_identity()),
    )
        .into_response()
}

async fn handle_sign_out(State(state): State<Backend>) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn handle_conversations(State(state): State<Backend>, headers: HeaderMap) -> Response {
    state.conversation_calls.fetch_add(1, Ordering::SeqCst);
    match authorize(&state, &headers) {
        Ok(()) => Json(state.summaries.lock().clone()).into_response(),
        Err(rejection) => rejection,
    }
}

async fn handle_mark_read(State(state): State<Backend>, Path(contact_id): Path<i64>) -> StatusCode {
    state.marked_read.lock().push(ContactId(contact_id));
    StatusCode::NO_CONTENT
}

async fn handle_thread(Path(contact_id): Path<i64>) -> Json<Vec<MessagePayload>> {
    Json(vec![MessagePayload {
        id: MessageId(1),
        contact_id: ContactId(contact_id),
        direction: MessageDirection::Inbound,
        body: "Bom dia, o orçamento ficou pronto?".into(),
        sent_at: Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap(),
    }])
}

async fn handle_send(
    Path(contact_id): Path<i64>,
    Json(request): Json<shared::protocol::SendMessageRequest>,
) -> Json<MessagePayload> {
    Json(MessagePayload {
        id: MessageId(2),
        contact_id: ContactId(contact_id),
        direction: MessageDirection::Outbound,
        body: request.body,
        sent_at: Utc.with_ymd_and_hms(2024, 3, 2, 8, 5, 0).unwrap(),
    })
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<Backend>,
    headers: HeaderMap,
) -> impl IntoResponse {
    *state.ws_cookie.lock() = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Backend, socket: WebSocket) {
    use futures::SinkExt;

    let (mut sender, mut receiver) = socket.split();
    let mut push_rx = state.push.subscribe();
    let send_task = tokio::spawn(async move {
        while let Ok(frame) = push_rx.recv().await {
            if sender.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    });
    while let Some(Ok(_msg)) = receiver.next().await {}
    send_task.abort();
}

pub async fn spawn_backend() -> (String, Backend) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let backend = Arc::new(FakeBackend::new());
    let app = Router::new()
        .route("/users/me", get(handle_identity))
        .route("/sessions/refresh", get(handle_refresh))
        .route("/sessions", post(handle_sign_in).delete(handle_sign_out))
        .route("/conversations", get(handle_conversations))
        .route("/conversations/:contact_id/read", patch(handle_mark_read))
        .route(
            "/conversations/:contact_id/messages",
            get(handle_thread).post(handle_send),
        )
        .route("/ws", get(handle_ws))
        .with_state(Arc::clone(&backend));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), backend)
}

pub fn api_client(server_url: &str, signals: &SessionSignals) -> Arc<ApiClient> {
    api_client_with(server_url, signals, Timeouts::default())
}

pub fn api_client_with(
    server_url: &str,
    signals: &SessionSignals,
    timeouts: Timeouts,
) -> Arc<ApiClient> {
    ApiClient::new(
        Url::parse(&format!("{server_url}/")).expect("base url"),
        Arc::new(Jar::default()),
        signals.clone(),
        timeouts,
    )
    .expect("client")
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

type Feed = tokio::sync::mpsc::UnboundedSender<Result<ServerEvent, ClientError>>;

/// Realtime transport driven by the test through per-connection feeds.
#[derive(Default)]
pub struct FakeConnector {
    pub connects: AtomicUsize,
    pub fail: AtomicBool,
    pub connect_delay_ms: AtomicU64,
    feeds: SyncMutex<Vec<Feed>>,
}

impl FakeConnector {
    /// Feed of the most recent connection.
    pub fn feed(&self) -> Feed {
        self.feeds.lock().last().cloned().expect("no connection opened")
    }

    pub fn send(&self, event: ServerEvent) {
        let _ = self.feed().send(Ok(event));
    }

    /// Ends every open stream, as a dropped transport would.
    pub fn hang_up(&self) {
        self.feeds.lock().clear();
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn connect(&self) -> Result<EventStream, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Realtime("connection refused".into()));
        }
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.feeds.lock().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
