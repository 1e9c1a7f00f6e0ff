// Thread Manager
// Owns thread lifecycle, persists both sides of each turn, and routes
// prompts through the agent client

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::models::events::{AgentErrorKind, AgentEvent, ConnectionState, ThreadEvent};
use crate::models::protocol::AuthorMode;
use crate::models::thread::{thread_name_from_prompt, Message, MessageRole, Thread};
use crate::repositories::ThreadRepository;
use crate::services::agent::{AgentClient, Scope};
use crate::services::error::{AuthorError, AuthorResult};
use crate::services::forwarder::EventForwarder;

/// Result of a successful `send_message`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub thread_id: String,
    pub stream_id: String,
    /// Persisted user message
    pub message_id: String,
}

/// Tool activity buffered until its stream ends
#[derive(Default)]
struct PendingTurn {
    records: Vec<(MessageRole, String)>,
}

pub struct ThreadManager {
    repo: ThreadRepository,
    client: AgentClient,
    forwarder: EventForwarder,
    default_mode: AuthorMode,
    /// stream_id -> buffered tool records
    turns: Mutex<HashMap<String, PendingTurn>>,
    /// Held from the busy check until the prompt owns the stream slot
    sending: tokio::sync::Mutex<()>,
}

impl ThreadManager {
    pub fn new(
        repo: ThreadRepository,
        client: AgentClient,
        forwarder: EventForwarder,
        default_mode: AuthorMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            client,
            forwarder,
            default_mode,
            turns: Mutex::new(HashMap::new()),
            sending: tokio::sync::Mutex::new(()),
        })
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    /// Start relaying agent events. Call once, before the first prompt.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.client.subscribe();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_agent_event(event);
            }
            log::info!("[ThreadManager] Agent event stream ended");
        })
    }

    fn turns(&self) -> MutexGuard<'_, HashMap<String, PendingTurn>> {
        self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Threads
    // =========================================================================

    pub fn create_thread(&self, project_id: &str, name: Option<String>) -> AuthorResult<Thread> {
        let project_id = require_project(project_id)?;
        let thread = Thread::new(project_id, name);
        self.repo.create_thread(&thread).map_err(AuthorError::Storage)?;

        log::info!("[ThreadManager] Created thread {} in {}", thread.id, thread.project_id);
        self.forwarder.forward(ThreadEvent::ThreadCreated {
            thread: thread.clone(),
        });
        Ok(thread)
    }

    /// Threads of a project, most recently active first
    pub fn list_threads(&self, project_id: &str) -> AuthorResult<Vec<Thread>> {
        self.repo.list_threads(project_id).map_err(AuthorError::Storage)
    }

    pub fn get_thread(&self, thread_id: &str) -> AuthorResult<Option<Thread>> {
        self.repo.get_thread(thread_id).map_err(AuthorError::Storage)
    }

    pub fn rename_thread(&self, thread_id: &str, name: &str) -> AuthorResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthorError::Validation("thread name is empty".to_string()));
        }
        if !self.repo.rename_thread(thread_id, name).map_err(AuthorError::Storage)? {
            return Err(AuthorError::ThreadNotFound(thread_id.to_string()));
        }

        self.forwarder.forward(ThreadEvent::ThreadRenamed {
            thread_id: thread_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// Delete a thread and its whole history
    pub fn delete_thread(&self, thread_id: &str) -> AuthorResult<()> {
        if !self.repo.delete_thread(thread_id).map_err(AuthorError::Storage)? {
            return Err(AuthorError::ThreadNotFound(thread_id.to_string()));
        }

        log::info!("[ThreadManager] Deleted thread {}", thread_id);
        self.forwarder.forward(ThreadEvent::ThreadDeleted {
            thread_id: thread_id.to_string(),
        });
        Ok(())
    }

    /// Messages oldest first; `limit` keeps only the most recent ones
    pub fn get_thread_messages(&self, thread_id: &str, limit: Option<usize>) -> AuthorResult<Vec<Message>> {
        self.repo
            .get_messages(thread_id, limit)
            .map_err(AuthorError::Storage)
    }

    // =========================================================================
    // Agent
    // =========================================================================

    /// Bind the agent to a project, initializing or rebinding as needed
    pub async fn open_project(&self, project_id: &str, mode: Option<AuthorMode>) -> AuthorResult<Scope> {
        let project_id = require_project(project_id)?;

        match self.client.state() {
            ConnectionState::Connected => {
                self.client
                    .initialize(&project_id, mode.unwrap_or(self.default_mode))
                    .await
            }
            ConnectionState::Ready => {
                let mut scope = match self.client.scope() {
                    Some(scope) if scope.project_path == project_id => scope,
                    _ => self.client.change_scope(&project_id).await?,
                };
                if let Some(mode) = mode.filter(|m| *m != scope.mode) {
                    scope.mode = self.client.change_mode(mode).await?;
                }
                Ok(scope)
            }
            _ => Err(AuthorError::NotConnected),
        }
    }

    /// Persist the prompt, then hand it to the agent
    ///
    /// Without `thread_id` a new thread named after the prompt is created.
    /// The reply is persisted when its stream ends.
    pub async fn send_message(
        &self,
        project_id: &str,
        prompt: &str,
        thread_id: Option<&str>,
    ) -> AuthorResult<SendReceipt> {
        let project_id = require_project(project_id)?;
        if prompt.trim().is_empty() {
            return Err(AuthorError::Validation("prompt is empty".to_string()));
        }

        let _sending = self.sending.lock().await;

        let existing = match thread_id {
            Some(id) => {
                let thread = self
                    .get_thread(id)?
                    .ok_or_else(|| AuthorError::ThreadNotFound(id.to_string()))?;
                if thread.project_id != project_id {
                    return Err(AuthorError::Validation(format!(
                        "thread {} belongs to {}",
                        thread.id, thread.project_id
                    )));
                }
                Some(thread)
            }
            None => None,
        };

        let bound = self.client.scope().map(|s| s.project_path);
        if self.client.state() != ConnectionState::Ready || bound.as_deref() != Some(project_id.as_str()) {
            self.open_project(&project_id, None).await?;
        }
        self.client.ensure_can_send()?;

        let thread = match existing {
            Some(thread) => thread,
            None => self.create_thread(&project_id, Some(thread_name_from_prompt(prompt)))?,
        };

        let user_message = Message::new(&thread, MessageRole::User, prompt);
        self.repo
            .append_messages(std::slice::from_ref(&user_message))
            .map_err(AuthorError::Storage)?;
        self.forwarder.forward(ThreadEvent::MessageSaved {
            message: user_message.clone(),
        });

        let stream_id = self.client.send_prompt(prompt, Some(&thread.id))?;
        log::info!(
            "[ThreadManager] Sent prompt for thread {} on {}",
            thread.id,
            stream_id
        );

        Ok(SendReceipt {
            thread_id: thread.id,
            stream_id,
            message_id: user_message.id,
        })
    }

    /// Cancel a stream; nothing more is persisted for it
    pub fn cancel(&self, stream_id: &str) -> AuthorResult<()> {
        self.client.cancel(stream_id)?;
        self.turns().remove(stream_id);
        Ok(())
    }

    pub async fn change_mode(&self, mode: AuthorMode) -> AuthorResult<AuthorMode> {
        self.client.change_mode(mode).await
    }

    pub async fn current_mode(&self) -> AuthorResult<AuthorMode> {
        self.client.get_mode().await
    }

    // =========================================================================
    // Event relay
    // =========================================================================

    fn handle_agent_event(&self, event: AgentEvent) {
        match &event {
            AgentEvent::ToolCall {
                stream_id,
                id,
                name,
                args,
                ..
            } => {
                let record = json!({ "id": id, "name": name, "args": args }).to_string();
                self.buffer(stream_id, MessageRole::ToolInvocation, record);
            }
            AgentEvent::ToolResult {
                stream_id,
                id,
                status,
                result,
                ..
            } => {
                let record = json!({ "id": id, "status": status, "result": result }).to_string();
                self.buffer(stream_id, MessageRole::ToolResult, record);
            }
            AgentEvent::StreamEnd {
                stream_id,
                thread_id,
                full_content,
            } => {
                let turn = self.turns().remove(stream_id).unwrap_or_default();
                let saved = match thread_id {
                    Some(thread_id) => self.persist_turn(thread_id, turn, full_content),
                    None => Vec::new(),
                };

                self.forwarder.forward(event.clone());
                for message in saved {
                    self.forwarder.forward(ThreadEvent::MessageSaved { message });
                }
                return;
            }
            AgentEvent::Error {
                stream_id: Some(stream_id),
                ..
            } => {
                // No partial reply is ever written
                self.turns().remove(stream_id);
            }
            _ => {}
        }

        self.forwarder.forward(event);
    }

    fn buffer(&self, stream_id: &str, role: MessageRole, content: String) {
        self.turns()
            .entry(stream_id.to_string())
            .or_default()
            .records
            .push((role, content));
    }

    /// Write tool records and the reply in one transaction
    fn persist_turn(&self, thread_id: &str, turn: PendingTurn, full_content: &str) -> Vec<Message> {
        let thread = match self.repo.get_thread(thread_id) {
            Ok(Some(thread)) => thread,
            Ok(None) => {
                log::warn!(
                    "[ThreadManager] Thread {} vanished before its reply completed",
                    thread_id
                );
                return Vec::new();
            }
            Err(e) => {
                self.report_storage_failure(&e);
                return Vec::new();
            }
        };

        let mut messages: Vec<Message> = turn
            .records
            .into_iter()
            .map(|(role, content)| Message::new(&thread, role, content))
            .collect();
        if !full_content.is_empty() {
            messages.push(Message::new(&thread, MessageRole::Assistant, full_content));
        }

        match self.repo.append_messages(&messages) {
            Ok(()) => messages,
            Err(e) => {
                self.report_storage_failure(&e);
                Vec::new()
            }
        }
    }

    fn report_storage_failure(&self, error: &str) {
        log::error!("[ThreadManager] Failed to save reply: {}", error);
        self.forwarder.forward(AgentEvent::Error {
            stream_id: None,
            thread_id: None,
            kind: AgentErrorKind::Agent,
            message: format!("Failed to save reply: {}", error),
        });
    }
}

fn require_project(project_id: &str) -> AuthorResult<String> {
    let trimmed = project_id.trim();
    if trimmed.is_empty() {
        return Err(AuthorError::Validation("project id is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::events::ForwardedEvent;
    use crate::test_support::{FakeBackend, FakeConnection};
    use crate::utils::config::TransportConfig;
    use crate::utils::database::Database;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PROJECT: &str = "/books/novel";

    struct Harness {
        manager: Arc<ThreadManager>,
        conn: FakeConnection,
        events: UnboundedReceiver<ForwardedEvent>,
        _backend: FakeBackend,
    }

    async fn harness() -> Harness {
        let mut backend = FakeBackend::start().await;
        let client = AgentClient::new(
            backend.url(),
            TransportConfig {
                reconnect_delay_ms: 50,
                ..TransportConfig::default()
            },
        );
        client.connect().await.unwrap();
        let mut conn = backend.next_connection().await;

        let (forwarder, events) = EventForwarder::channel();
        let repo = ThreadRepository::new(Database::new_in_memory().unwrap());
        let manager = ThreadManager::new(repo, client, forwarder, AuthorMode::Fiction);
        manager.start();

        let open = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.open_project(PROJECT, None).await })
        };
        conn.accept_init().await;
        open.await.unwrap().unwrap();

        Harness {
            manager,
            conn,
            events,
            _backend: backend,
        }
    }

    async fn wait_for<F>(rx: &mut UnboundedReceiver<ForwardedEvent>, mut pred: F) -> ForwardedEvent
    where
        F: FnMut(&ForwardedEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("forwarder closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not forwarded")
    }

    fn is_terminal(event: &ForwardedEvent) -> bool {
        matches!(event, ForwardedEvent::Agent(e) if e.is_terminal())
    }

    fn contents(messages: &[Message]) -> Vec<(MessageRole, String)> {
        messages.iter().map(|m| (m.role, m.content.clone())).collect()
    }

    #[tokio::test]
    async fn test_hello_hi_round_trip() {
        let mut h = harness().await;
        let thread = h.manager.create_thread(PROJECT, None).unwrap();

        let receipt = h
            .manager
            .send_message(PROJECT, "Hello", Some(&thread.id))
            .await
            .unwrap();
        assert_eq!(receipt.thread_id, thread.id);
        assert_eq!(
            h.conn.recv().await,
            json!({"type": "message", "content": "Hello", "thread_id": thread.id})
        );

        h.conn.send(json!({"type": "stream-start"}));
        h.conn.send(json!({"type": "stream-chunk", "content": "H", "fullContent": "H"}));
        h.conn.send(json!({"type": "stream-chunk", "content": "i", "fullContent": "Hi"}));
        h.conn.send(json!({"type": "complete", "fullContent": "Hi"}));
        wait_for(&mut h.events, is_terminal).await;

        let messages = h.manager.get_thread_messages(&thread.id, None).unwrap();
        assert_eq!(
            contents(&messages),
            vec![
                (MessageRole::User, "Hello".to_string()),
                (MessageRole::Assistant, "Hi".to_string()),
            ]
        );
        assert_eq!(h.manager.get_thread(&thread.id).unwrap().unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn test_error_mid_stream_keeps_only_user_message() {
        let mut h = harness().await;
        let thread = h.manager.create_thread(PROJECT, None).unwrap();

        h.manager
            .send_message(PROJECT, "Write the finale", Some(&thread.id))
            .await
            .unwrap();
        h.conn.recv().await;
        h.conn.send(json!({"type": "stream-start"}));
        h.conn.send(json!({"type": "tool-call", "tool": "write_file", "args": {}, "id": "c1", "status": "pending"}));
        h.conn.send(json!({"type": "stream-chunk", "content": "The fin", "fullContent": "The fin"}));
        h.conn.send(json!({"type": "error", "error": "Agent error: rate limited"}));

        let terminal = wait_for(&mut h.events, is_terminal).await;
        assert!(matches!(
            terminal,
            ForwardedEvent::Agent(AgentEvent::Error { kind: AgentErrorKind::Agent, .. })
        ));

        let messages = h.manager.get_thread_messages(&thread.id, None).unwrap();
        assert_eq!(
            contents(&messages),
            vec![(MessageRole::User, "Write the finale".to_string())]
        );
    }

    #[tokio::test]
    async fn test_tool_records_saved_before_reply() {
        let mut h = harness().await;

        let receipt = h.manager.send_message(PROJECT, "Outline act one", None).await.unwrap();
        h.conn.recv().await;
        h.conn.send(json!({"type": "stream-start"}));
        h.conn.send(json!({"type": "tool-call", "tool": "write_todos", "args": {"n": 3}, "id": "c1", "status": "pending"}));
        h.conn.send(json!({"type": "tool-result", "id": "c1", "result": "ok", "status": "completed"}));
        h.conn.send(json!({"type": "tool-result", "id": "c1", "result": "ok", "status": "completed"}));
        h.conn.send(json!({"type": "stream-chunk", "content": "Done", "fullContent": "Done"}));
        h.conn.send(json!({"type": "complete", "fullContent": "Done"}));
        wait_for(&mut h.events, is_terminal).await;

        let messages = h.manager.get_thread_messages(&receipt.thread_id, None).unwrap();
        let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::ToolInvocation,
                MessageRole::ToolResult,
                MessageRole::Assistant,
            ]
        );
        let invocation: serde_json::Value = serde_json::from_str(&messages[1].content).unwrap();
        assert_eq!(invocation, json!({"id": "c1", "name": "write_todos", "args": {"n": 3}}));
    }

    #[tokio::test]
    async fn test_reply_after_tool_call_is_saved() {
        let mut h = harness().await;

        let receipt = h.manager.send_message(PROJECT, "Save chapter one", None).await.unwrap();
        h.conn.recv().await;
        h.conn.send(json!({"type": "stream-start"}));
        h.conn.send(json!({"type": "stream-chunk", "content": "Let me check.", "fullContent": "Let me check."}));
        h.conn.send(json!({"type": "tool-call", "tool": "write_file", "args": {}, "id": "c1", "status": "pending"}));
        h.conn.send(json!({"type": "tool-result", "id": "c1", "result": "ok", "status": "completed"}));
        h.conn.send(json!({"type": "stream-chunk", "content": "Done,", "fullContent": "Done,"}));
        h.conn.send(json!({"type": "stream-chunk", "content": " chapter saved.", "fullContent": "Done, chapter saved."}));
        h.conn.send(json!({"type": "complete", "fullContent": "Done, chapter saved."}));

        let end = wait_for(&mut h.events, is_terminal).await;
        match end {
            ForwardedEvent::Agent(AgentEvent::StreamEnd { full_content, .. }) => {
                assert_eq!(full_content, "Let me check.\n\nDone, chapter saved.");
            }
            other => panic!("unexpected {:?}", other),
        }

        let messages = h.manager.get_thread_messages(&receipt.thread_id, None).unwrap();
        let reply = messages.last().unwrap();
        assert_eq!(reply.role, MessageRole::Assistant);
        assert!(reply.content.ends_with("Done, chapter saved."));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_persist_one_prompt() {
        let mut h = harness().await;

        let sends: Vec<_> = ["first draft", "second draft"]
            .into_iter()
            .map(|prompt| {
                let manager = Arc::clone(&h.manager);
                tokio::spawn(async move { manager.send_message(PROJECT, prompt, None).await })
            })
            .collect();
        let mut results = Vec::new();
        for send in sends {
            results.push(send.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AuthorError::Busy(_)))));
        h.conn.recv().await;

        let threads = h.manager.list_threads(PROJECT).unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(h.manager.get_thread_messages(&threads[0].id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_without_thread_creates_one() {
        let mut h = harness().await;

        let receipt = h
            .manager
            .send_message(PROJECT, "Give my detective a backstory", None)
            .await
            .unwrap();

        let created = wait_for(&mut h.events, |e| {
            matches!(e, ForwardedEvent::Thread(ThreadEvent::ThreadCreated { .. }))
        })
        .await;
        match created {
            ForwardedEvent::Thread(ThreadEvent::ThreadCreated { thread }) => {
                assert_eq!(thread.id, receipt.thread_id);
                assert_eq!(thread.name, "Give my detective a backstory");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.manager.list_threads(PROJECT).unwrap().len(), 1);
        assert_eq!(h.conn.recv().await["thread_id"], receipt.thread_id);
    }

    #[tokio::test]
    async fn test_recency_follows_last_message() {
        let mut h = harness().await;
        let t1 = h.manager.create_thread(PROJECT, Some("T1".to_string())).unwrap();
        let t2 = h.manager.create_thread(PROJECT, Some("T2".to_string())).unwrap();
        let t3 = h.manager.create_thread(PROJECT, Some("T3".to_string())).unwrap();

        h.manager.send_message(PROJECT, "ping", Some(&t1.id)).await.unwrap();
        h.conn.recv().await;

        let order: Vec<String> = h
            .manager
            .list_threads(PROJECT)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![t1.id, t3.id, t2.id]);
    }

    #[tokio::test]
    async fn test_busy_send_persists_nothing() {
        let mut h = harness().await;
        let first = h.manager.create_thread(PROJECT, None).unwrap();
        let second = h.manager.create_thread(PROJECT, None).unwrap();

        h.manager.send_message(PROJECT, "one", Some(&first.id)).await.unwrap();
        h.conn.recv().await;

        let err = h
            .manager
            .send_message(PROJECT, "two", Some(&second.id))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorError::Busy(_)));
        assert!(h.manager.get_thread_messages(&second.id, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let h = harness().await;
        let thread = h.manager.create_thread(PROJECT, None).unwrap();
        let batch: Vec<Message> = (0..5)
            .map(|i| Message::new(&thread, MessageRole::User, format!("line {}", i)))
            .collect();
        h.manager.repo.append_messages(&batch).unwrap();

        h.manager.delete_thread(&thread.id).unwrap();
        assert!(h.manager.get_thread_messages(&thread.id, None).unwrap().is_empty());
        assert!(h.manager.get_thread(&thread.id).unwrap().is_none());
        assert!(matches!(
            h.manager.delete_thread(&thread.id),
            Err(AuthorError::ThreadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_and_validation() {
        let h = harness().await;
        let thread = h.manager.create_thread(PROJECT, None).unwrap();

        h.manager.rename_thread(&thread.id, "  Act III ").unwrap();
        assert_eq!(h.manager.get_thread(&thread.id).unwrap().unwrap().name, "Act III");
        assert!(matches!(
            h.manager.rename_thread(&thread.id, " "),
            Err(AuthorError::Validation(_))
        ));
        assert!(matches!(
            h.manager.rename_thread("missing", "x"),
            Err(AuthorError::ThreadNotFound(_))
        ));
        assert!(matches!(
            h.manager.send_message(PROJECT, "   ", Some(&thread.id)).await,
            Err(AuthorError::Validation(_))
        ));
        assert!(matches!(
            h.manager.send_message("/books/other", "hi", Some(&thread.id)).await,
            Err(AuthorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_discards_buffered_turn() {
        let mut h = harness().await;
        let receipt = h.manager.send_message(PROJECT, "Draft a prologue", None).await.unwrap();
        h.conn.recv().await;
        h.conn.send(json!({"type": "stream-start"}));
        h.conn.send(json!({"type": "tool-call", "tool": "write_file", "args": {}, "id": "c1", "status": "pending"}));
        wait_for(&mut h.events, |e| {
            matches!(e, ForwardedEvent::Agent(AgentEvent::ToolCall { .. }))
        })
        .await;

        h.manager.cancel(&receipt.stream_id).unwrap();
        let terminal = wait_for(&mut h.events, is_terminal).await;
        assert!(matches!(
            terminal,
            ForwardedEvent::Agent(AgentEvent::Error { kind: AgentErrorKind::Cancelled, .. })
        ));

        h.conn.send(json!({"type": "complete", "fullContent": "A prologue"}));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = h.manager.get_thread_messages(&receipt.thread_id, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_open_project_rebinds_scope() {
        let mut h = harness().await;

        let open = {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.open_project("/books/sequel", Some(AuthorMode::Academic)).await })
        };
        assert_eq!(
            h.conn.recv().await,
            json!({"type": "change_project", "project_path": "/books/sequel"})
        );
        h.conn.send(json!({"type": "project_changed", "project_path": "/books/sequel"}));
        assert_eq!(h.conn.recv().await, json!({"type": "change_mode", "mode": "academic"}));
        h.conn.send(json!({"type": "mode_changed", "mode": "academic"}));

        let scope = open.await.unwrap().unwrap();
        assert_eq!(scope.project_path, "/books/sequel");
        assert_eq!(scope.mode, AuthorMode::Academic);
    }
}
