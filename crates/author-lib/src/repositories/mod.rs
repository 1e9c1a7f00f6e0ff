// Repository Layer
// Provides data access abstractions for SQLite database

pub mod thread_repo;

pub use thread_repo::ThreadRepository;
