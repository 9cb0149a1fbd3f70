//! Persistence layer — versioned documents, views, and the libSQL backend.

pub mod document;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;
pub mod views;

pub use document::{Document, Record, ViewRow};
pub use libsql_backend::LibSqlStore;
pub use traits::{Store, load, persist};
pub use views::{View, ViewQuery};
