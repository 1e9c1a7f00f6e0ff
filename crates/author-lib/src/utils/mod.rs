// Utility functions module

pub mod config;
pub mod database;
pub mod schema;

pub use config::AuthorConfig;
pub use database::Database;
