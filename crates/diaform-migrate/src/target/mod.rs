//! Relational target stores.
//!
//! The [`TargetStore`] trait covers every write the migration performs and
//! the read-backs the integrity checks need. All writes between
//! [`begin`](TargetStore::begin) and [`commit`](TargetStore::commit) form one
//! transaction; [`rollback`](TargetStore::rollback) (or dropping the store
//! mid-run) discards them.
//!
//! Implementations: [`postgres::PostgresTarget`] for real runs and
//! [`memory::MemoryTarget`] for dry runs and tests.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::DestinationConfig;
use crate::content::Token;
use crate::error::Result;
use crate::model::{ConnectionRow, DanglingConnection, ThingKey, ThingRow, UserRow};

/// Result of [`TargetStore::upsert_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row was written.
    Inserted,
    /// An identical row already existed; nothing changed.
    Unchanged,
}

/// Trait for destination stores.
#[async_trait]
pub trait TargetStore: Send {
    /// Get the target type name.
    fn target_type(&self) -> &'static str;

    /// Creates the `users`, `things` and `connections` tables if missing.
    async fn ensure_schema(&mut self) -> Result<()>;

    /// Opens the run's transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Discards the open transaction. A no-op when none is open.
    async fn rollback(&mut self) -> Result<()>;

    /// Inserts a user, or accepts an identical existing row.
    ///
    /// Fails with [`Error::DuplicateKey`](crate::Error::DuplicateKey) when the
    /// user exists with a different password.
    async fn upsert_user(&mut self, user: &UserRow) -> Result<WriteOutcome>;

    /// Inserts a thing.
    ///
    /// Fails with [`Error::ConstraintViolation`](crate::Error::ConstraintViolation)
    /// when `(user, name)` exists.
    async fn insert_thing(&mut self, thing: &ThingRow) -> Result<()>;

    /// Inserts a connection with `parent_index = -1`, whatever the row carries.
    ///
    /// Fails with [`Error::ConstraintViolation`](crate::Error::ConstraintViolation)
    /// when `(user, name)` exists. Parent and child are not checked here.
    async fn insert_connection(&mut self, connection: &ConnectionRow) -> Result<()>;

    /// Looks up a connection by key.
    async fn find_connection(&mut self, user: &str, name: &str) -> Result<Option<ConnectionRow>>;

    /// Overwrites a connection's `parent_index`. Returns false if no such row.
    async fn set_connection_index(&mut self, user: &str, name: &str, index: i64) -> Result<bool>;

    /// Connections still carrying the unresolved sentinel, ordered by key.
    async fn unresolved_connections(&mut self) -> Result<Vec<ConnectionRow>>;

    /// Connections whose parent or child thing is missing, ordered by key.
    async fn dangling_connections(&mut self) -> Result<Vec<DanglingConnection>>;

    /// Up to `limit` things ordered by `(user, name)`, strictly after `after`.
    async fn thing_page(&mut self, after: Option<&ThingKey>, limit: usize)
        -> Result<Vec<ThingRow>>;

    /// Replaces a thing's `json_content`. Returns false if no such row.
    async fn set_json_content(&mut self, key: &ThingKey, tokens: &[Token]) -> Result<bool>;

    /// Sets `first_created` where it is still NULL. Returns true if a row changed.
    async fn set_first_created(&mut self, key: &ThingKey, created: DateTime<Utc>)
        -> Result<bool>;

    /// Releases connections.
    async fn close(&mut self) -> Result<()>;
}

/// Create a target store from configuration.
///
/// `dry_run` always yields a [`memory::MemoryTarget`].
///
/// # Errors
///
/// Returns a fatal configuration error when the destination is unreachable.
pub async fn create_target(
    config: &DestinationConfig,
    dry_run: bool,
) -> Result<Box<dyn TargetStore>> {
    if dry_run {
        return Ok(Box::new(memory::MemoryTarget::new()));
    }
    match config {
        DestinationConfig::Memory => Ok(Box::new(memory::MemoryTarget::new())),
        #[cfg(feature = "postgres")]
        DestinationConfig::Postgres(cfg) => {
            Ok(Box::new(postgres::PostgresTarget::connect(cfg).await?))
        }
        #[cfg(not(feature = "postgres"))]
        DestinationConfig::Postgres(_) => Err(crate::error::Error::Config(
            "built without the `postgres` feature".to_string(),
        )),
    }
}
