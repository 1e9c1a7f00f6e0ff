// Data models module
// Persisted records, wire messages and the events that cross the host boundary

pub mod events;
pub mod protocol;
pub mod thread;

pub use events::*;
pub use protocol::*;
pub use thread::*;
