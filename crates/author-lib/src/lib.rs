// Author - shared library
// Thread store, agent runtime supervision, agent transport and event forwarding

pub mod models;
pub mod repositories;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use models::*;
pub use services::{AuthorError, AuthorErrorCode, AuthorResult};
