//! Persistence layer: libSQL-backed mailboxes, cursors, and the job queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

#[cfg(test)]
pub(crate) mod fake;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CredentialStore, CursorStore, Database, JobQueue};
