//! PostgreSQL target store.
//!
//! All data operations run inside the single transaction opened by
//! [`begin`](TargetStore::begin). Inserts use `ON CONFLICT DO NOTHING` and
//! report a conflict by the affected row count, so a duplicate key never
//! aborts the surrounding transaction. Every row write also runs in its own
//! savepoint: a statement PostgreSQL rejects (a NUL byte in text, say) is
//! rolled back to that savepoint and surfaces as a row error, leaving the
//! run transaction usable for the rows that follow.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::config::PostgresConfig;
use crate::content::Token;
use crate::error::{Error, Result};
use crate::model::{ConnectionRow, DanglingConnection, ThingKey, ThingRow, UserRow};

use super::{TargetStore, WriteOutcome};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        name TEXT PRIMARY KEY,
        password TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS things (
        "user" TEXT NOT NULL,
        name TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        json_content JSON NOT NULL DEFAULT '[]',
        first_created TIMESTAMPTZ,
        PRIMARY KEY ("user", name)
    )
    "#,
    // Tables created by older tooling lack the derived columns.
    "ALTER TABLE things ADD COLUMN IF NOT EXISTS json_content JSON NOT NULL DEFAULT '[]'",
    "ALTER TABLE things ADD COLUMN IF NOT EXISTS first_created TIMESTAMPTZ",
    r#"
    CREATE TABLE IF NOT EXISTS connections (
        "user" TEXT NOT NULL,
        name TEXT NOT NULL,
        parent TEXT NOT NULL,
        child TEXT NOT NULL,
        tag TEXT,
        parent_index INTEGER NOT NULL DEFAULT -1,
        PRIMARY KEY ("user", name)
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS connections_parent_idx ON connections ("user", parent)"#,
];

const CONNECTION_COLUMNS: &str =
    r#"c."user", c.name, c.parent, c.child, c.tag, c.parent_index::BIGINT AS parent_index"#;

const THING_COLUMNS: &str = r#""user", name, content, json_content, first_created"#;

/// PostgreSQL target store.
pub struct PostgresTarget {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTarget {
    /// Connects to the configured server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DestinationConnection`] when the server is unreachable
    /// or rejects the credentials.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::DestinationConnection(format!(
                    "{}:{}/{}: {}",
                    config.host, config.port, config.database, e
                ))
            })?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Connected to PostgreSQL"
        );
        Ok(Self::from_pool(pool))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| Error::Transaction("no open transaction".to_string()))
    }

    /// Opens a savepoint inside the run transaction.
    async fn savepoint(&mut self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.tx()?.begin().await?)
    }
}

/// Releases the savepoint on success, rolls back to it on error.
async fn settle<T>(savepoint: Transaction<'_, Postgres>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            savepoint.commit().await?;
            Ok(value)
        }
        Err(e) => {
            savepoint.rollback().await?;
            Err(e)
        }
    }
}

async fn upsert_user_on(conn: &mut PgConnection, user: &UserRow) -> Result<WriteOutcome> {
    let inserted = sqlx::query(
        "INSERT INTO users (name, password) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
    )
    .bind(&user.name)
    .bind(&user.password)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted > 0 {
        return Ok(WriteOutcome::Inserted);
    }

    let existing: Option<String> = sqlx::query_scalar("SELECT password FROM users WHERE name = $1")
        .bind(&user.name)
        .fetch_optional(&mut *conn)
        .await?;
    match existing {
        Some(password) if password == user.password => Ok(WriteOutcome::Unchanged),
        _ => Err(Error::DuplicateKey(user.name.clone())),
    }
}

fn connection_from_row(row: &PgRow) -> Result<ConnectionRow> {
    Ok(ConnectionRow {
        user: row.try_get("user")?,
        name: row.try_get("name")?,
        parent: row.try_get("parent")?,
        child: row.try_get("child")?,
        tag: row.try_get("tag")?,
        parent_index: row.try_get("parent_index")?,
    })
}

fn thing_from_row(row: &PgRow) -> Result<ThingRow> {
    let user: String = row.try_get("user")?;
    let name: String = row.try_get("name")?;
    let stored: Option<serde_json::Value> = row.try_get("json_content")?;
    let json_content = stored.and_then(|value| match serde_json::from_value(value) {
        Ok(tokens) => Some(tokens),
        Err(e) => {
            debug!(user = %user, name = %name, "json_content is not a token array: {}", e);
            None
        }
    });
    Ok(ThingRow {
        user,
        name,
        content: row.try_get("content")?,
        json_content,
        first_created: row.try_get("first_created")?,
    })
}

#[async_trait]
impl TargetStore for PostgresTarget {
    fn target_type(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::Transaction("transaction already open".to_string()));
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Transaction("commit without open transaction".to_string()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn upsert_user(&mut self, user: &UserRow) -> Result<WriteOutcome> {
        let mut savepoint = self.savepoint().await?;
        let result = upsert_user_on(&mut savepoint, user).await;
        settle(savepoint, result).await
    }

    async fn insert_thing(&mut self, thing: &ThingRow) -> Result<()> {
        let json = serde_json::to_string(thing.json_content.as_deref().unwrap_or_default())?;
        let mut savepoint = self.savepoint().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO things ("user", name, content, json_content, first_created)
            VALUES ($1, $2, $3, $4::json, $5)
            ON CONFLICT ("user", name) DO NOTHING
            "#,
        )
        .bind(&thing.user)
        .bind(&thing.name)
        .bind(&thing.content)
        .bind(json)
        .bind(thing.first_created)
        .execute(&mut *savepoint)
        .await
        .map_err(Error::from);
        let inserted = settle(savepoint, result).await?.rows_affected();

        if inserted == 0 {
            return Err(Error::ConstraintViolation {
                entity: "thing",
                user: thing.user.clone(),
                name: thing.name.clone(),
            });
        }
        Ok(())
    }

    async fn insert_connection(&mut self, connection: &ConnectionRow) -> Result<()> {
        let mut savepoint = self.savepoint().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO connections ("user", name, parent, child, tag, parent_index)
            VALUES ($1, $2, $3, $4, $5, -1)
            ON CONFLICT ("user", name) DO NOTHING
            "#,
        )
        .bind(&connection.user)
        .bind(&connection.name)
        .bind(&connection.parent)
        .bind(&connection.child)
        .bind(&connection.tag)
        .execute(&mut *savepoint)
        .await
        .map_err(Error::from);
        let inserted = settle(savepoint, result).await?.rows_affected();

        if inserted == 0 {
            return Err(Error::ConstraintViolation {
                entity: "connection",
                user: connection.user.clone(),
                name: connection.name.clone(),
            });
        }
        Ok(())
    }

    async fn find_connection(&mut self, user: &str, name: &str) -> Result<Option<ConnectionRow>> {
        let tx = self.tx()?;
        let query = format!(
            r#"SELECT {} FROM connections c WHERE c."user" = $1 AND c.name = $2"#,
            CONNECTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(user)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn set_connection_index(&mut self, user: &str, name: &str, index: i64) -> Result<bool> {
        let mut savepoint = self.savepoint().await?;
        let result = sqlx::query(
            r#"UPDATE connections SET parent_index = $3 WHERE "user" = $1 AND name = $2"#,
        )
        .bind(user)
        .bind(name)
        .bind(index)
        .execute(&mut *savepoint)
        .await
        .map_err(Error::from);
        Ok(settle(savepoint, result).await?.rows_affected() > 0)
    }

    async fn unresolved_connections(&mut self) -> Result<Vec<ConnectionRow>> {
        let tx = self.tx()?;
        let query = format!(
            r#"SELECT {} FROM connections c WHERE c.parent_index = -1 ORDER BY c."user", c.name"#,
            CONNECTION_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&mut **tx).await?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn dangling_connections(&mut self) -> Result<Vec<DanglingConnection>> {
        let tx = self.tx()?;
        let query = format!(
            r#"
            SELECT {},
                   p.name IS NULL AS missing_parent,
                   ch.name IS NULL AS missing_child
            FROM connections c
            LEFT JOIN things p ON p."user" = c."user" AND p.name = c.parent
            LEFT JOIN things ch ON ch."user" = c."user" AND ch.name = c.child
            WHERE p.name IS NULL OR ch.name IS NULL
            ORDER BY c."user", c.name
            "#,
            CONNECTION_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&mut **tx).await?;
        rows.iter()
            .map(|row| {
                Ok(DanglingConnection {
                    connection: connection_from_row(row)?,
                    missing_parent: row.try_get("missing_parent")?,
                    missing_child: row.try_get("missing_child")?,
                })
            })
            .collect()
    }

    async fn thing_page(
        &mut self,
        after: Option<&ThingKey>,
        limit: usize,
    ) -> Result<Vec<ThingRow>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let tx = self.tx()?;
        let rows = match after {
            Some(key) => {
                let query = format!(
                    r#"SELECT {} FROM things WHERE ("user", name) > ($1, $2) ORDER BY "user", name LIMIT $3"#,
                    THING_COLUMNS
                );
                sqlx::query(&query)
                    .bind(&key.user)
                    .bind(&key.name)
                    .bind(limit)
                    .fetch_all(&mut **tx)
                    .await?
            }
            None => {
                let query = format!(
                    r#"SELECT {} FROM things ORDER BY "user", name LIMIT $1"#,
                    THING_COLUMNS
                );
                sqlx::query(&query).bind(limit).fetch_all(&mut **tx).await?
            }
        };
        rows.iter().map(thing_from_row).collect()
    }

    async fn set_json_content(&mut self, key: &ThingKey, tokens: &[Token]) -> Result<bool> {
        let json = serde_json::to_string(tokens)?;
        let mut savepoint = self.savepoint().await?;
        let result = sqlx::query(
            r#"UPDATE things SET json_content = $3::json WHERE "user" = $1 AND name = $2"#,
        )
        .bind(&key.user)
        .bind(&key.name)
        .bind(json)
        .execute(&mut *savepoint)
        .await
        .map_err(Error::from);
        Ok(settle(savepoint, result).await?.rows_affected() > 0)
    }

    async fn set_first_created(
        &mut self,
        key: &ThingKey,
        created: DateTime<Utc>,
    ) -> Result<bool> {
        let mut savepoint = self.savepoint().await?;
        let result = sqlx::query(
            r#"
            UPDATE things SET first_created = $3
            WHERE "user" = $1 AND name = $2 AND first_created IS NULL
            "#,
        )
        .bind(&key.user)
        .bind(&key.name)
        .bind(created)
        .execute(&mut *savepoint)
        .await
        .map_err(Error::from);
        Ok(settle(savepoint, result).await?.rows_affected() > 0)
    }

    async fn close(&mut self) -> Result<()> {
        self.rollback().await?;
        self.pool.close().await;
        Ok(())
    }
}
