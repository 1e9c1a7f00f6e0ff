//! Host modules for Author
//!
//! Wire types and command dispatch for the stdio boundary between the
//! presentation layer and the agent bridge.

pub mod dispatch;
pub mod types;


pub use dispatch::{Flow, Host};
pub use types::{parse_request, HostOutput, HostResponse};
