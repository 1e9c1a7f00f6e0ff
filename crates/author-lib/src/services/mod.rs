// Services Layer
// Agent runtime supervision, transport, thread orchestration and event relay

pub mod agent;
pub mod error;
pub mod forwarder;
pub mod supervisor;
pub mod thread_manager;

pub use agent::{AgentClient, DeltaTracker, Scope};
pub use error::{AuthorError, AuthorErrorCode, AuthorResult};
pub use forwarder::{EventForwarder, EventSink};
pub use supervisor::{BackendEndpoint, BackendSupervisor};
pub use thread_manager::{SendReceipt, ThreadManager};
