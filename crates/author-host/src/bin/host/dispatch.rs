//! Command dispatch
//!
//! Maps each `HostCommand` onto the thread manager and agent client and
//! turns the outcome into a `HostResponse`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use author_lib::services::{BackendSupervisor, ThreadManager};
use author_lib::{AuthorError, AuthorResult};

use super::types::{HostCommand, HostError, HostRequest, HostResponse, StatusReport};

/// Whether the run loop keeps reading after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

pub struct Host {
    manager: Arc<ThreadManager>,
    supervisor: Arc<BackendSupervisor>,
}

impl Host {
    pub fn new(manager: Arc<ThreadManager>, supervisor: Arc<BackendSupervisor>) -> Self {
        Self {
            manager,
            supervisor,
        }
    }

    pub async fn dispatch(&self, request: HostRequest) -> (HostResponse, Flow) {
        let HostRequest { id, command } = request;
        let name = command.name();
        log::debug!("[Author Host] {} ({:?})", name, id);

        let flow = if command == HostCommand::Shutdown {
            Flow::Shutdown
        } else {
            Flow::Continue
        };

        let response = match self.execute(command).await {
            Ok(result) => HostResponse::success(id, result),
            Err(e) => {
                log::warn!("[Author Host] {} failed: {}", name, e);
                HostResponse::failure(id, HostError::from(&e))
            }
        };
        (response, flow)
    }

    async fn execute(&self, command: HostCommand) -> AuthorResult<Value> {
        let manager = &self.manager;
        match command {
            HostCommand::CreateThread { project_id, name } => {
                to_value(manager.create_thread(&project_id, name)?)
            }
            HostCommand::ListThreads { project_id } => to_value(manager.list_threads(&project_id)?),
            HostCommand::GetThread { thread_id } => to_value(manager.get_thread(&thread_id)?),
            HostCommand::RenameThread { thread_id, name } => {
                manager.rename_thread(&thread_id, &name)?;
                Ok(json!({ "threadId": thread_id }))
            }
            HostCommand::DeleteThread { thread_id } => {
                manager.delete_thread(&thread_id)?;
                Ok(json!({ "threadId": thread_id }))
            }
            HostCommand::GetThreadMessages { thread_id, limit } => {
                to_value(manager.get_thread_messages(&thread_id, limit)?)
            }
            HostCommand::OpenProject { project_id, mode } => {
                to_value(manager.open_project(&project_id, mode).await?)
            }
            HostCommand::SendMessage {
                project_id,
                prompt,
                thread_id,
            } => to_value(
                manager
                    .send_message(&project_id, &prompt, thread_id.as_deref())
                    .await?,
            ),
            HostCommand::Cancel { stream_id } => {
                manager.cancel(&stream_id)?;
                Ok(json!({ "streamId": stream_id }))
            }
            HostCommand::ChangeMode { mode } => {
                let mode = manager.change_mode(mode).await?;
                Ok(json!({ "mode": mode }))
            }
            HostCommand::GetMode => {
                let mode = manager.current_mode().await?;
                Ok(json!({ "mode": mode }))
            }
            HostCommand::Status => {
                let client = manager.client();
                to_value(StatusReport {
                    connection: client.state(),
                    scope: client.scope(),
                    active_stream: client.active_stream(),
                    backend_running: self.supervisor.is_running().await,
                })
            }
            HostCommand::Shutdown => Ok(json!({ "stopping": true })),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> AuthorResult<Value> {
    serde_json::to_value(value).map_err(AuthorError::from)
}
