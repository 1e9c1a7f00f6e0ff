// Agent Transport Client
// Owns the WebSocket link to the agent runtime. Handles:
// - Scope handshake (init / change_project / change_mode / get_mode)
// - Translating wire frames into typed AgentEvents
// - Delta tracking and duplicate suppression per stream
// - Cancellation and bounded automatic reconnection

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;
use uuid::Uuid;

use super::delta::DeltaTracker;
use crate::models::events::{AgentErrorKind, AgentEvent, ConnectionState, TaskItem};
use crate::models::protocol::{AuthorMode, ClientMessage, ServerMessage};
use crate::services::error::{AuthorError, AuthorResult};
use crate::utils::config::TransportConfig;

/// Project and mode a ready connection is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub project_path: String,
    pub mode: AuthorMode,
}

/// Handle to the agent connection. Clones share one link.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: Url,
    settings: TransportConfig,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    pending: Mutex<Option<PendingAck>>,
    stream: Mutex<StreamState>,
    scope: Mutex<Option<Scope>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
    next_request: AtomicU64,
    reconnecting: AtomicBool,
    closing: AtomicBool,
}

#[derive(Default)]
struct Link {
    /// Bumped per transport so a stale reader cannot tear down a newer link
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Initialized,
    ProjectChanged,
    ModeChanged,
    CurrentMode,
}

impl AckKind {
    fn expected_for(message: &ClientMessage) -> Option<Self> {
        match message {
            ClientMessage::Init { .. } => Some(AckKind::Initialized),
            ClientMessage::ChangeProject { .. } => Some(AckKind::ProjectChanged),
            ClientMessage::ChangeMode { .. } => Some(AckKind::ModeChanged),
            ClientMessage::GetMode => Some(AckKind::CurrentMode),
            ClientMessage::Message { .. } => None,
        }
    }

    fn of(message: &ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::Initialized { .. } => Some(AckKind::Initialized),
            ServerMessage::ProjectChanged { .. } => Some(AckKind::ProjectChanged),
            ServerMessage::ModeChanged { .. } => Some(AckKind::ModeChanged),
            ServerMessage::CurrentMode { .. } => Some(AckKind::CurrentMode),
            _ => None,
        }
    }

    fn request_name(&self) -> &'static str {
        match self {
            AckKind::Initialized => "init",
            AckKind::ProjectChanged => "change_project",
            AckKind::ModeChanged => "change_mode",
            AckKind::CurrentMode => "get_mode",
        }
    }
}

struct PendingAck {
    id: u64,
    kind: AckKind,
    reply: oneshot::Sender<AuthorResult<ServerMessage>>,
}

#[derive(Default)]
struct StreamState {
    active: Option<ActiveStream>,
    /// Cancelled prompts whose terminal frame has not arrived yet
    draining: usize,
}

struct ActiveStream {
    id: String,
    thread_id: Option<String>,
    started: bool,
    tracker: DeltaTracker,
    tool_calls: HashSet<String>,
    tool_results: HashSet<String>,
    last_todos: Option<Vec<TaskItem>>,
    last_files: Option<Vec<String>>,
}

impl ActiveStream {
    fn new(thread_id: Option<String>) -> Self {
        Self {
            id: format!("stream_{}", Uuid::new_v4().to_string().replace('-', "")),
            thread_id,
            started: false,
            tracker: DeltaTracker::new(),
            tool_calls: HashSet::new(),
            tool_results: HashSet::new(),
            last_todos: None,
            last_files: None,
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AgentClient {
    pub fn new(url: Url, settings: TransportConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                url,
                settings,
                state,
                link: Mutex::new(Link::default()),
                pending: Mutex::new(None),
                stream: Mutex::new(StreamState::default()),
                scope: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                next_request: AtomicU64::new(1),
                reconnecting: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Register a listener. Every listener sees every event in emission order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn scope(&self) -> Option<Scope> {
        lock(&self.inner.scope).clone()
    }

    /// Id of the stream currently in flight
    pub fn active_stream(&self) -> Option<String> {
        lock(&self.inner.stream).active.as_ref().map(|s| s.id.clone())
    }

    /// Open the transport. Resolves once the socket is open.
    pub async fn connect(&self) -> AuthorResult<()> {
        let inner = &self.inner;
        if inner.reconnecting.load(Ordering::SeqCst) {
            return Err(AuthorError::Busy("reconnection in progress".to_string()));
        }
        match self.state() {
            ConnectionState::Connected | ConnectionState::Ready => return Ok(()),
            ConnectionState::Connecting => {
                return Err(AuthorError::Busy("connection attempt in progress".to_string()))
            }
            ConnectionState::Disconnected => {}
        }

        inner.closing.store(false, Ordering::SeqCst);
        inner.set_state(ConnectionState::Connecting);
        match open_transport(inner).await {
            Ok(()) => {
                inner.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Bind the connection to a project. Valid once connected.
    pub async fn initialize(&self, project_path: &str, mode: AuthorMode) -> AuthorResult<Scope> {
        let project_path = validate_project_path(project_path)?;
        self.inner.require_connected()?;
        bind_scope(&self.inner, Scope { project_path, mode }).await
    }

    /// Rebind a ready connection to another project
    pub async fn change_scope(&self, project_path: &str) -> AuthorResult<Scope> {
        let project_path = validate_project_path(project_path)?;
        self.inner.require_ready()?;

        let ack = self
            .inner
            .request(ClientMessage::ChangeProject { project_path: project_path.clone() })
            .await?;
        let bound_path = match ack {
            ServerMessage::ProjectChanged { project_path } => project_path,
            _ => project_path,
        };

        let scope = {
            let mut scope = lock(&self.inner.scope);
            let mode = scope.as_ref().map(|s| s.mode).unwrap_or_default();
            let next = Scope { project_path: bound_path, mode };
            *scope = Some(next.clone());
            next
        };
        self.inner.emit(AgentEvent::ScopeBound {
            project_path: scope.project_path.clone(),
            mode: scope.mode,
        });
        Ok(scope)
    }

    /// Switch the agent instruction set
    pub async fn change_mode(&self, mode: AuthorMode) -> AuthorResult<AuthorMode> {
        self.inner.require_ready()?;
        let ack = self.inner.request(ClientMessage::ChangeMode { mode }).await?;
        let mode = match ack {
            ServerMessage::ModeChanged { mode } => mode,
            _ => mode,
        };
        self.inner.remember_mode(mode);
        self.inner.emit(AgentEvent::ModeChanged { mode });
        Ok(mode)
    }

    /// Ask the runtime for its current mode
    pub async fn get_mode(&self) -> AuthorResult<AuthorMode> {
        self.inner.require_ready()?;
        match self.inner.request(ClientMessage::GetMode).await? {
            ServerMessage::CurrentMode { mode } => {
                self.inner.remember_mode(mode);
                Ok(mode)
            }
            other => Err(AuthorError::Agent(format!("Unexpected reply to get_mode: {:?}", other))),
        }
    }

    /// Check that a prompt would be accepted right now
    pub fn ensure_can_send(&self) -> AuthorResult<()> {
        self.inner.require_ready()?;
        let stream = lock(&self.inner.stream);
        if let Some(active) = &stream.active {
            return Err(AuthorError::Busy(format!("stream {} is still in flight", active.id)));
        }
        if lock(&self.inner.pending).is_some() {
            return Err(AuthorError::Busy("a handshake is in flight".to_string()));
        }
        Ok(())
    }

    /// Submit a prompt. Returns the stream id; the reply arrives as events.
    pub fn send_prompt(&self, text: &str, thread_id: Option<&str>) -> AuthorResult<String> {
        self.inner.require_ready()?;
        if text.trim().is_empty() {
            return Err(AuthorError::Validation("prompt is empty".to_string()));
        }

        let mut stream = lock(&self.inner.stream);
        if let Some(active) = &stream.active {
            return Err(AuthorError::Busy(format!("stream {} is still in flight", active.id)));
        }
        if lock(&self.inner.pending).is_some() {
            return Err(AuthorError::Busy("a handshake is in flight".to_string()));
        }

        let outbound = lock(&self.inner.link)
            .outbound
            .clone()
            .ok_or(AuthorError::NotConnected)?;

        let active = ActiveStream::new(thread_id.map(str::to_string));
        let stream_id = active.id.clone();
        outbound
            .send(ClientMessage::Message {
                content: text.to_string(),
                thread_id: thread_id.map(str::to_string),
            })
            .map_err(|_| AuthorError::NotConnected)?;

        // Frames are routed under this lock, so nothing is seen before the stream is registered
        stream.active = Some(active);
        log::info!("[AgentClient] Prompt sent on {}", stream_id);
        Ok(stream_id)
    }

    /// Stop surfacing a stream. Its remaining frames are drained silently.
    pub fn cancel(&self, stream_id: &str) -> AuthorResult<()> {
        let mut stream = lock(&self.inner.stream);
        match stream.active.as_ref() {
            Some(active) if active.id == stream_id => {}
            _ => return Err(AuthorError::StreamNotFound(stream_id.to_string())),
        }

        if let Some(mut active) = stream.active.take() {
            stream.draining += 1;
            self.inner.start_if_needed(&mut active);
            self.inner.emit(AgentEvent::Error {
                stream_id: Some(active.id),
                thread_id: active.thread_id,
                kind: AgentErrorKind::Cancelled,
                message: "cancelled".to_string(),
            });
        }
        log::info!("[AgentClient] Cancelled {}", stream_id);
        Ok(())
    }

    /// Tear down the link without reconnecting
    pub fn close(&self) {
        let inner = &self.inner;
        inner.closing.store(true, Ordering::SeqCst);
        inner.drop_link();
        inner.fail_in_flight("connection closed");
        inner.set_state(ConnectionState::Disconnected);
        log::info!("[AgentClient] Closed");
    }
}

impl ClientInner {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("[AgentClient] {} -> {}", previous, next);
            self.emit(AgentEvent::ConnectionState { state: next });
        }
    }

    fn emit(&self, event: AgentEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn require_connected(&self) -> AuthorResult<()> {
        match self.current_state() {
            ConnectionState::Connected | ConnectionState::Ready => Ok(()),
            _ => Err(AuthorError::NotConnected),
        }
    }

    fn require_ready(&self) -> AuthorResult<()> {
        match self.current_state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Connected => Err(AuthorError::NotReady("connected".to_string())),
            _ => Err(AuthorError::NotConnected),
        }
    }

    fn remember_mode(&self, mode: AuthorMode) {
        if let Some(scope) = lock(&self.scope).as_mut() {
            scope.mode = mode;
        }
    }

    fn bind(&self, scope: Scope) {
        *lock(&self.scope) = Some(scope.clone());
        self.emit(AgentEvent::ScopeBound {
            project_path: scope.project_path,
            mode: scope.mode,
        });
        self.set_state(ConnectionState::Ready);
    }

    /// Send a handshake request and wait for its acknowledgment
    async fn request(&self, message: ClientMessage) -> AuthorResult<ServerMessage> {
        let kind = AckKind::expected_for(&message).ok_or_else(|| {
            AuthorError::Validation(format!("{} is not a handshake request", message.kind()))
        })?;
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let stream = lock(&self.stream);
            if let Some(active) = &stream.active {
                return Err(AuthorError::Busy(format!("stream {} is still in flight", active.id)));
            }
            // An error reply would be taken as the cancelled stream's terminal frame
            if stream.draining > 0 {
                return Err(AuthorError::Busy("a cancelled stream is still draining".to_string()));
            }
            let mut pending = lock(&self.pending);
            if pending.is_some() {
                return Err(AuthorError::HandshakeInFlight);
            }
            let outbound = lock(&self.link)
                .outbound
                .clone()
                .ok_or(AuthorError::NotConnected)?;
            outbound.send(message).map_err(|_| AuthorError::NotConnected)?;
            *pending = Some(PendingAck { id, kind, reply: tx });
        }

        let timeout = self.settings.handshake_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuthorError::Transport(format!(
                "connection closed before {} was acknowledged",
                kind.request_name()
            ))),
            Err(_) => {
                let mut pending = lock(&self.pending);
                if pending.as_ref().map(|p| p.id) == Some(id) {
                    pending.take();
                }
                log::warn!("[AgentClient] {} timed out", kind.request_name());
                Err(AuthorError::InitializationTimeout(
                    kind.request_name().to_string(),
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn drop_link(&self) {
        let mut link = lock(&self.link);
        link.generation += 1;
        link.outbound = None;
    }

    /// Fail the active stream and any waiting handshake
    fn fail_in_flight(&self, reason: &str) {
        {
            let mut stream = lock(&self.stream);
            stream.draining = 0;
            if let Some(mut active) = stream.active.take() {
                self.start_if_needed(&mut active);
                self.emit(AgentEvent::Error {
                    stream_id: Some(active.id),
                    thread_id: active.thread_id,
                    kind: AgentErrorKind::Transport,
                    message: reason.to_string(),
                });
            }
        }
        // Dropping the sender wakes the waiter with a transport error
        lock(&self.pending).take();
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    fn handle_text(&self, generation: u64, text: &str) {
        if lock(&self.link).generation != generation {
            log::debug!("[AgentClient] Ignoring frame from stale link");
            return;
        }
        for line in text.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
            match ServerMessage::parse(line) {
                Ok(message) => self.dispatch(message),
                Err(e) => log::warn!("[AgentClient] {}", e),
            }
        }
    }

    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Initialized { .. }
            | ServerMessage::ProjectChanged { .. }
            | ServerMessage::ModeChanged { .. }
            | ServerMessage::CurrentMode { .. } => self.resolve_ack(message),
            ServerMessage::Error { error } => self.route_error(error),
            ServerMessage::Unknown => log::debug!("[AgentClient] Ignoring unknown frame type"),
            frame => self.route_stream_frame(frame),
        }
    }

    fn resolve_ack(&self, message: ServerMessage) {
        let mut pending = lock(&self.pending);
        let matches = match (pending.as_ref(), AckKind::of(&message)) {
            (Some(p), Some(kind)) => p.kind == kind,
            _ => false,
        };
        if !matches {
            log::debug!("[AgentClient] Unsolicited acknowledgment: {:?}", message);
            return;
        }
        if let Some(waiter) = pending.take() {
            let _ = waiter.reply.send(Ok(message));
        }
    }

    /// Errors go to the draining prompt, the active stream, the waiting
    /// handshake, or become a stream-less event, in that order
    fn route_error(&self, error: String) {
        {
            let mut stream = lock(&self.stream);
            if stream.draining > 0 {
                stream.draining -= 1;
                log::debug!("[AgentClient] Drained error of cancelled stream: {}", error);
                return;
            }
            if let Some(mut active) = stream.active.take() {
                log::warn!("[AgentClient] Stream {} failed: {}", active.id, error);
                self.start_if_needed(&mut active);
                self.emit(AgentEvent::Error {
                    stream_id: Some(active.id),
                    thread_id: active.thread_id,
                    kind: AgentErrorKind::Agent,
                    message: error,
                });
                return;
            }
        }

        if let Some(waiter) = lock(&self.pending).take() {
            log::warn!(
                "[AgentClient] {} rejected: {}",
                waiter.kind.request_name(),
                error
            );
            let _ = waiter.reply.send(Err(AuthorError::Agent(error)));
            return;
        }

        log::warn!("[AgentClient] Agent error outside any request: {}", error);
        self.emit(AgentEvent::Error {
            stream_id: None,
            thread_id: None,
            kind: AgentErrorKind::Agent,
            message: error,
        });
    }

    fn start_if_needed(&self, active: &mut ActiveStream) {
        if !active.started {
            active.started = true;
            self.emit(AgentEvent::StreamStart {
                stream_id: active.id.clone(),
                thread_id: active.thread_id.clone(),
            });
        }
    }

    fn route_stream_frame(&self, frame: ServerMessage) {
        let mut stream = lock(&self.stream);
        if stream.draining > 0 {
            if frame.is_terminal() {
                stream.draining -= 1;
            }
            return;
        }
        let Some(active) = stream.active.as_mut() else {
            log::debug!("[AgentClient] Frame without an active stream: {:?}", frame);
            return;
        };
        self.start_if_needed(active);

        let finished = match frame {
            ServerMessage::StreamChunk {
                content,
                full_content,
            } => {
                if let Some(delta) = active.tracker.observe(&content, full_content.as_deref()) {
                    self.emit_chunk(active, delta);
                }
                false
            }
            ServerMessage::ToolCall {
                tool,
                args,
                id,
                status,
            } => {
                if active.tool_calls.insert(id.clone()) {
                    self.emit(AgentEvent::ToolCall {
                        stream_id: active.id.clone(),
                        thread_id: active.thread_id.clone(),
                        id,
                        name: tool,
                        args,
                        status,
                    });
                }
                false
            }
            ServerMessage::ToolResult { id, result, status } => {
                // Runtime replays results of earlier turns; only pair with calls seen here
                if active.tool_calls.contains(&id) && active.tool_results.insert(id.clone()) {
                    self.emit(AgentEvent::ToolResult {
                        stream_id: active.id.clone(),
                        thread_id: active.thread_id.clone(),
                        id,
                        status,
                        result,
                    });
                }
                false
            }
            ServerMessage::Todos { data } => {
                let items: Vec<TaskItem> = data
                    .into_iter()
                    .map(|entry| TaskItem {
                        text: entry.content,
                        status: entry.status,
                    })
                    .collect();
                if active.last_todos.as_ref() != Some(&items) {
                    active.last_todos = Some(items.clone());
                    self.emit(AgentEvent::TaskListUpdate {
                        stream_id: active.id.clone(),
                        thread_id: active.thread_id.clone(),
                        items,
                    });
                }
                false
            }
            ServerMessage::Files { data } => {
                if active.last_files.as_ref() != Some(&data) {
                    active.last_files = Some(data.clone());
                    self.emit(AgentEvent::FilesUpdate {
                        stream_id: active.id.clone(),
                        thread_id: active.thread_id.clone(),
                        paths: data,
                    });
                }
                false
            }
            ServerMessage::Complete { full_content } => {
                let (catch_up, full_content) = active.tracker.finish(full_content.as_deref());
                if let Some(delta) = catch_up {
                    self.emit_chunk(active, delta);
                }
                log::info!(
                    "[AgentClient] Stream {} complete ({} chars)",
                    active.id,
                    full_content.chars().count()
                );
                self.emit(AgentEvent::StreamEnd {
                    stream_id: active.id.clone(),
                    thread_id: active.thread_id.clone(),
                    full_content,
                });
                true
            }
            _ => false,
        };

        if finished {
            stream.active = None;
        }
    }

    fn emit_chunk(&self, active: &ActiveStream, delta: String) {
        self.emit(AgentEvent::StreamChunk {
            stream_id: active.id.clone(),
            thread_id: active.thread_id.clone(),
            delta,
            cumulative: active.tracker.text().to_string(),
        });
    }
}

fn validate_project_path(project_path: &str) -> AuthorResult<String> {
    let trimmed = project_path.trim();
    if trimmed.is_empty() {
        return Err(AuthorError::Validation("project path is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

async fn bind_scope(inner: &Arc<ClientInner>, requested: Scope) -> AuthorResult<Scope> {
    let ack = inner
        .request(ClientMessage::Init {
            project_path: requested.project_path.clone(),
            author_mode: requested.mode,
        })
        .await?;
    let scope = match ack {
        ServerMessage::Initialized {
            project_path,
            author_mode,
        } => Scope {
            project_path,
            mode: author_mode,
        },
        _ => requested,
    };
    inner.bind(scope.clone());
    log::info!(
        "[AgentClient] Bound to {} ({})",
        scope.project_path,
        scope.mode
    );
    Ok(scope)
}

// ============================================================================
// Transport tasks
// ============================================================================

/// Open a socket and spawn its writer and reader tasks
async fn open_transport(inner: &Arc<ClientInner>) -> AuthorResult<()> {
    let (socket, _) = connect_async(inner.url.as_str()).await?;
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

    let generation = {
        let mut link = lock(&inner.link);
        link.generation += 1;
        link.outbound = Some(tx);
        link.generation
    };
    log::info!("[AgentClient] Connected to {} (link {})", inner.url, generation);

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    log::error!("[AgentClient] {}", e);
                    continue;
                }
            };
            log::debug!("[AgentClient] -> {}", json);
            if let Err(e) = sink.send(WsMessage::text(json)).await {
                log::warn!("[AgentClient] Write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = Arc::clone(inner);
    tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => reader.handle_text(generation, text.as_str()),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[AgentClient] Read failed: {}", e);
                    break;
                }
            }
        }
        handle_disconnect(&reader, generation);
    });

    Ok(())
}

fn handle_disconnect(inner: &Arc<ClientInner>, generation: u64) {
    {
        let mut link = lock(&inner.link);
        if link.generation != generation {
            return;
        }
        link.outbound = None;
    }

    log::warn!("[AgentClient] Link {} dropped", generation);
    inner.fail_in_flight("connection lost");
    inner.set_state(ConnectionState::Disconnected);

    if inner.closing.load(Ordering::SeqCst) {
        return;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(reconnect_loop(Arc::clone(inner)));
}

/// Bounded reconnection; re-sends `init` for the previous scope before ready
fn reconnect_loop(inner: Arc<ClientInner>) -> BoxFuture<'static, ()> {
    async move {
        let max_attempts = inner.settings.reconnect_attempts;
        let mut attempt = 0;
        let mut recovered = false;

        while attempt < max_attempts {
            attempt += 1;
            tokio::time::sleep(inner.settings.reconnect_delay()).await;
            if inner.closing.load(Ordering::SeqCst) {
                break;
            }

            log::info!("[AgentClient] Reconnect attempt {}/{}", attempt, max_attempts);
            inner.emit(AgentEvent::Reconnecting {
                attempt,
                max_attempts,
            });
            inner.set_state(ConnectionState::Connecting);

            if let Err(e) = open_transport(&inner).await {
                log::warn!("[AgentClient] Reconnect attempt {} failed: {}", attempt, e);
                inner.set_state(ConnectionState::Disconnected);
                continue;
            }
            inner.set_state(ConnectionState::Connected);

            let previous = lock(&inner.scope).clone();
            match previous {
                None => {
                    recovered = true;
                    break;
                }
                Some(scope) => match bind_scope(&inner, scope).await {
                    Ok(_) => {
                        recovered = true;
                        break;
                    }
                    Err(e) => {
                        log::warn!("[AgentClient] Rebinding scope failed: {}", e);
                        inner.drop_link();
                        inner.set_state(ConnectionState::Disconnected);
                    }
                },
            }
        }

        inner.reconnecting.store(false, Ordering::SeqCst);
        if inner.closing.load(Ordering::SeqCst) {
            return;
        }

        if !recovered {
            log::error!("[AgentClient] Giving up after {} attempts", attempt);
            inner.set_state(ConnectionState::Disconnected);
            inner.emit(AgentEvent::ConnectionLost { attempts: attempt });
            return;
        }

        // The new link may have dropped while the flag was still set
        let link_down = lock(&inner.link).outbound.is_none();
        if link_down && !inner.reconnecting.swap(true, Ordering::SeqCst) {
            tokio::spawn(reconnect_loop(Arc::clone(&inner)));
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{collect_stream, next_event, FakeBackend};
    use serde_json::json;

    fn settings() -> TransportConfig {
        TransportConfig {
            reconnect_attempts: 3,
            reconnect_delay_ms: 50,
            handshake_timeout_ms: 2_000,
            ..TransportConfig::default()
        }
    }

    async fn ready_client(backend: &mut FakeBackend) -> (AgentClient, crate::test_support::FakeConnection) {
        let client = AgentClient::new(backend.url(), settings());
        client.connect().await.unwrap();
        let mut conn = backend.next_connection().await;

        let init = {
            let client = client.clone();
            tokio::spawn(async move { client.initialize("/books/novel", AuthorMode::Fiction).await })
        };
        conn.accept_init().await;
        init.await.unwrap().unwrap();
        (client, conn)
    }

    #[tokio::test]
    async fn test_initialize_binds_scope() {
        let mut backend = FakeBackend::start().await;
        let (client, _conn) = ready_client(&mut backend).await;

        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(
            client.scope(),
            Some(Scope {
                project_path: "/books/novel".to_string(),
                mode: AuthorMode::Fiction,
            })
        );
    }

    #[tokio::test]
    async fn test_send_before_ready_is_rejected_without_write() {
        let mut backend = FakeBackend::start().await;
        let client = AgentClient::new(backend.url(), settings());

        assert_eq!(client.send_prompt("Hello", None), Err(AuthorError::NotConnected));

        client.connect().await.unwrap();
        let mut conn = backend.next_connection().await;
        assert_eq!(client.state(), ConnectionState::Connected);

        let err = client.send_prompt("Hello", None).unwrap_err();
        assert!(matches!(err, AuthorError::NotReady(_)));
        conn.assert_silent(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_chunks_become_deltas() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        let stream_id = client.send_prompt("Hello", Some("t1")).unwrap();
        let sent = conn.recv().await;
        assert_eq!(sent, json!({"type": "message", "content": "Hello", "thread_id": "t1"}));

        conn.send(json!({"type": "stream-start"}));
        conn.send(json!({"type": "stream-chunk", "content": "H", "fullContent": "H", "role": "assistant"}));
        conn.send(json!({"type": "stream-chunk", "content": "H", "fullContent": "H"}));
        conn.send(json!({"type": "stream-chunk", "content": "i", "fullContent": "Hi"}));
        conn.send(json!({"type": "complete", "message": "done", "fullContent": "Hi"}));

        let streamed = collect_stream(&mut events).await;
        assert_eq!(
            streamed,
            vec![
                AgentEvent::StreamStart {
                    stream_id: stream_id.clone(),
                    thread_id: Some("t1".to_string()),
                },
                AgentEvent::StreamChunk {
                    stream_id: stream_id.clone(),
                    thread_id: Some("t1".to_string()),
                    delta: "H".to_string(),
                    cumulative: "H".to_string(),
                },
                AgentEvent::StreamChunk {
                    stream_id: stream_id.clone(),
                    thread_id: Some("t1".to_string()),
                    delta: "i".to_string(),
                    cumulative: "Hi".to_string(),
                },
                AgentEvent::StreamEnd {
                    stream_id: stream_id.clone(),
                    thread_id: Some("t1".to_string()),
                    full_content: "Hi".to_string(),
                },
            ]
        );
        assert!(client.active_stream().is_none());
    }

    #[tokio::test]
    async fn test_newline_separated_frames_in_one_message() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        client.send_prompt("Go", None).unwrap();
        conn.recv().await;
        conn.send_raw(
            "{\"type\":\"stream-start\"}\n{\"type\":\"stream-chunk\",\"content\":\"ok\"}\n{\"type\":\"complete\"}",
        );

        let streamed = collect_stream(&mut events).await;
        assert_eq!(streamed.len(), 3);
        assert!(matches!(
            streamed.last(),
            Some(AgentEvent::StreamEnd { full_content, .. }) if full_content == "ok"
        ));
    }

    #[tokio::test]
    async fn test_second_prompt_while_streaming_is_busy() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;

        client.send_prompt("first", None).unwrap();
        conn.recv().await;

        assert!(matches!(client.send_prompt("second", None), Err(AuthorError::Busy(_))));
        assert!(matches!(client.change_mode(AuthorMode::Academic).await, Err(AuthorError::Busy(_))));
        conn.assert_silent(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_tool_frames_are_deduplicated() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        client.send_prompt("Write chapter one", None).unwrap();
        conn.recv().await;

        conn.send(json!({"type": "stream-start"}));
        conn.send(json!({"type": "tool-result", "id": "old", "result": "stale", "status": "completed"}));
        conn.send(json!({"type": "tool-call", "tool": "write_file", "args": {"path": "a.md"}, "id": "a", "status": "pending"}));
        conn.send(json!({"type": "tool-call", "tool": "read_file", "args": {}, "id": "b", "status": "pending"}));
        conn.send(json!({"type": "tool-call", "tool": "write_file", "args": {"path": "a.md"}, "id": "a", "status": "pending"}));
        conn.send(json!({"type": "tool-result", "id": "b", "result": "text", "status": "completed"}));
        conn.send(json!({"type": "tool-result", "id": "a", "result": "ok", "status": "completed"}));
        conn.send(json!({"type": "tool-result", "id": "a", "result": "ok", "status": "completed"}));
        conn.send(json!({"type": "todos", "data": [{"content": "Draft", "status": "pending"}]}));
        conn.send(json!({"type": "todos", "data": [{"content": "Draft", "status": "pending"}]}));
        conn.send(json!({"type": "todos", "data": [{"content": "Draft", "status": "completed"}]}));
        conn.send(json!({"type": "files", "data": ["/a.md"]}));
        conn.send(json!({"type": "files", "data": ["/a.md"]}));
        conn.send(json!({"type": "complete"}));

        let kinds: Vec<String> = collect_stream(&mut events)
            .await
            .into_iter()
            .map(|e| match e {
                AgentEvent::ToolCall { id, .. } => format!("call:{}", id),
                AgentEvent::ToolResult { id, .. } => format!("result:{}", id),
                AgentEvent::TaskListUpdate { items, .. } => format!("todos:{}", items.len()),
                AgentEvent::FilesUpdate { paths, .. } => format!("files:{}", paths.len()),
                AgentEvent::StreamStart { .. } => "start".to_string(),
                AgentEvent::StreamEnd { .. } => "end".to_string(),
                other => format!("{:?}", other),
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                "start", "call:a", "call:b", "result:b", "result:a", "todos:1", "todos:1",
                "files:1", "end"
            ]
        );
    }

    #[tokio::test]
    async fn test_error_frame_ends_stream_and_connection_stays_usable() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        let first = client.send_prompt("fail please", None).unwrap();
        conn.recv().await;
        conn.send(json!({"type": "stream-start"}));
        conn.send(json!({"type": "stream-chunk", "content": "Par", "fullContent": "Par"}));
        conn.send(json!({"type": "error", "error": "model overloaded"}));

        let streamed = collect_stream(&mut events).await;
        assert!(matches!(
            streamed.last(),
            Some(AgentEvent::Error { stream_id: Some(id), kind: AgentErrorKind::Agent, message, .. })
                if *id == first && message == "model overloaded"
        ));

        assert_eq!(client.state(), ConnectionState::Ready);
        client.send_prompt("again", None).unwrap();
        assert_eq!(conn.recv().await["content"], "again");
    }

    #[tokio::test]
    async fn test_cancel_drains_remaining_frames() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        let cancelled = client.send_prompt("long task", None).unwrap();
        conn.recv().await;
        assert_eq!(
            client.cancel("stream_unknown"),
            Err(AuthorError::StreamNotFound("stream_unknown".to_string()))
        );
        client.cancel(&cancelled).unwrap();

        let streamed = collect_stream(&mut events).await;
        assert!(matches!(
            streamed.last(),
            Some(AgentEvent::Error { kind: AgentErrorKind::Cancelled, .. })
        ));

        let next = client.send_prompt("short task", None).unwrap();
        conn.recv().await;

        // Leftovers of the cancelled prompt, then the new reply
        conn.send(json!({"type": "stream-start"}));
        conn.send(json!({"type": "stream-chunk", "content": "stale", "fullContent": "stale"}));
        conn.send(json!({"type": "complete", "fullContent": "stale"}));
        conn.send(json!({"type": "stream-start"}));
        conn.send(json!({"type": "stream-chunk", "content": "fresh", "fullContent": "fresh"}));
        conn.send(json!({"type": "complete", "fullContent": "fresh"}));

        let streamed = collect_stream(&mut events).await;
        assert!(streamed.iter().all(|e| e.stream_id() == Some(next.as_str())));
        assert!(matches!(
            streamed.last(),
            Some(AgentEvent::StreamEnd { full_content, .. }) if full_content == "fresh"
        ));
    }

    #[tokio::test]
    async fn test_handshake_waits_for_cancelled_stream_to_drain() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;

        let cancelled = client.send_prompt("long task", None).unwrap();
        conn.recv().await;
        client.cancel(&cancelled).unwrap();

        let err = client.change_mode(AuthorMode::Academic).await.unwrap_err();
        assert!(matches!(err, AuthorError::Busy(_)));
        conn.assert_silent(Duration::from_millis(100)).await;

        conn.send(json!({"type": "error", "error": "interrupted"}));
        tokio::time::timeout(Duration::from_secs(5), async {
            while lock(&client.inner.stream).draining > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mode = {
            let client = client.clone();
            tokio::spawn(async move { client.change_mode(AuthorMode::Academic).await })
        };
        assert_eq!(conn.recv().await, json!({"type": "change_mode", "mode": "academic"}));
        conn.send(json!({"type": "error", "error": "unknown mode"}));
        assert_eq!(
            mode.await.unwrap(),
            Err(AuthorError::Agent("unknown mode".to_string()))
        );
    }

    #[tokio::test]
    async fn test_handshake_error_and_timeout() {
        let mut backend = FakeBackend::start().await;
        let client = AgentClient::new(
            backend.url(),
            TransportConfig {
                handshake_timeout_ms: 150,
                ..settings()
            },
        );
        client.connect().await.unwrap();
        let mut conn = backend.next_connection().await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.initialize("/missing", AuthorMode::Fiction).await })
        };
        conn.recv().await;
        conn.send(json!({"type": "error", "error": "Failed to initialize agent: no such directory"}));
        assert!(matches!(pending.await.unwrap(), Err(AuthorError::Agent(_))));

        // No reply at all
        let err = client
            .initialize("/books/novel", AuthorMode::Fiction)
            .await
            .unwrap_err();
        assert_eq!(err, AuthorError::InitializationTimeout("init".to_string(), 150));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_handshake_rejected() {
        let mut backend = FakeBackend::start().await;
        let client = AgentClient::new(backend.url(), settings());
        client.connect().await.unwrap();
        let mut conn = backend.next_connection().await;

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.initialize("/a", AuthorMode::Fiction).await })
        };
        conn.recv().await;

        assert_eq!(
            client.initialize("/b", AuthorMode::Fiction).await,
            Err(AuthorError::HandshakeInFlight)
        );
        assert!(matches!(client.send_prompt("hi", None), Err(AuthorError::NotReady(_))));

        conn.send(json!({"type": "initialized", "project_path": "/a", "author_mode": "fiction"}));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_change_scope_and_mode() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        let change = {
            let client = client.clone();
            tokio::spawn(async move { client.change_scope("/books/sequel").await })
        };
        assert_eq!(
            conn.recv().await,
            json!({"type": "change_project", "project_path": "/books/sequel"})
        );
        conn.send(json!({"type": "project_changed", "project_path": "/books/sequel"}));
        assert_eq!(change.await.unwrap().unwrap().project_path, "/books/sequel");

        let mode = {
            let client = client.clone();
            tokio::spawn(async move { client.change_mode(AuthorMode::Academic).await })
        };
        assert_eq!(conn.recv().await, json!({"type": "change_mode", "mode": "academic"}));
        conn.send(json!({"type": "mode_changed", "mode": "academic"}));
        assert_eq!(mode.await.unwrap().unwrap(), AuthorMode::Academic);

        let current = {
            let client = client.clone();
            tokio::spawn(async move { client.get_mode().await })
        };
        assert_eq!(conn.recv().await, json!({"type": "get_mode"}));
        conn.send(json!({"type": "current_mode", "mode": "academic"}));
        assert_eq!(current.await.unwrap().unwrap(), AuthorMode::Academic);

        assert_eq!(
            client.scope(),
            Some(Scope {
                project_path: "/books/sequel".to_string(),
                mode: AuthorMode::Academic,
            })
        );
        assert!(matches!(next_event(&mut events).await, AgentEvent::ScopeBound { .. }));
        assert_eq!(
            next_event(&mut events).await,
            AgentEvent::ModeChanged { mode: AuthorMode::Academic }
        );
    }

    #[tokio::test]
    async fn test_reconnect_rebinds_scope() {
        let mut backend = FakeBackend::start().await;
        let (client, conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        client.send_prompt("in flight", None).unwrap();
        conn.close();

        let mut conn = backend.next_connection().await;
        let init = conn.recv().await;
        assert_eq!(
            init,
            json!({"type": "init", "project_path": "/books/novel", "author_mode": "fiction"})
        );
        assert_ne!(client.state(), ConnectionState::Ready);
        conn.send(json!({"type": "initialized", "project_path": "/books/novel", "author_mode": "fiction"}));

        assert!(client.wait_for_state(ConnectionState::Ready, Duration::from_secs(2)).await);

        let mut saw_transport_error = false;
        let mut saw_reconnecting = false;
        let mut saw_bound_before_ready = false;
        let mut bound = false;
        loop {
            match next_event(&mut events).await {
                AgentEvent::Error { kind: AgentErrorKind::Transport, .. } => saw_transport_error = true,
                AgentEvent::Reconnecting { attempt: 1, max_attempts: 3 } => saw_reconnecting = true,
                AgentEvent::ScopeBound { .. } => bound = true,
                AgentEvent::ConnectionState { state: ConnectionState::Ready } => {
                    saw_bound_before_ready = bound;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_transport_error);
        assert!(saw_reconnecting);
        assert!(saw_bound_before_ready);

        client.send_prompt("after reconnect", None).unwrap();
        assert_eq!(conn.recv().await["content"], "after reconnect");
    }

    #[tokio::test]
    async fn test_reconnect_gives_up() {
        let mut backend = FakeBackend::start().await;
        let (client, conn) = ready_client(&mut backend).await;
        let mut events = client.subscribe();

        backend.shutdown();
        conn.close();

        loop {
            if let AgentEvent::ConnectionLost { attempts } = next_event(&mut events).await {
                assert_eq!(attempts, 3);
                break;
            }
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_does_not_reconnect() {
        let mut backend = FakeBackend::start().await;
        let (client, mut conn) = ready_client(&mut backend).await;

        client.close();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        conn.wait_closed().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(backend.try_next_connection().is_none());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
