// Agent transport
// WebSocket client for the agent runtime plus streamed-text bookkeeping

pub mod client;
pub mod delta;

pub use client::{AgentClient, Scope};
pub use delta::DeltaTracker;
