//! In-memory [`TargetStore`] for dry runs and tests.
//!
//! Tables are ordered maps keyed like the relational primary keys. A
//! transaction works on a staged copy that replaces the committed tables on
//! [`commit`](TargetStore::commit) and is dropped on rollback. Handles are
//! cheap clones over shared state, so a test can keep one to inspect what a
//! pipeline committed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::content::Token;
use crate::error::{Error, Result};
use crate::model::{
    ConnectionRow, DanglingConnection, ThingKey, ThingRow, UserRow, UNRESOLVED_INDEX,
};

use super::{TargetStore, WriteOutcome};

/// Contents of the three tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTables {
    /// `users`: name to password.
    pub users: BTreeMap<String, String>,
    /// `things` by `(user, name)`.
    pub things: BTreeMap<ThingKey, ThingRow>,
    /// `connections` by `(user, name)`.
    pub connections: BTreeMap<ThingKey, ConnectionRow>,
}

impl MemoryTables {
    /// Connections under `parent`, sorted by `parent_index`.
    pub fn children_of(&self, user: &str, parent: &str) -> Vec<&ConnectionRow> {
        let mut children: Vec<&ConnectionRow> = self
            .connections
            .values()
            .filter(|c| c.user == user && c.parent == parent)
            .collect();
        children.sort_by_key(|c| c.parent_index);
        children
    }

    /// Total number of rows across all tables.
    pub fn row_count(&self) -> usize {
        self.users.len() + self.things.len() + self.connections.len()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: MemoryTables,
    staged: Option<MemoryTables>,
    schema_ready: bool,
}

/// In-memory target store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryTarget {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose committed tables are `tables`.
    pub fn with_tables(tables: MemoryTables) -> Self {
        let target = Self::new();
        target.write().committed = tables;
        target
    }

    /// Copy of the committed tables.
    pub fn snapshot(&self) -> MemoryTables {
        self.read().committed.clone()
    }

    /// True once [`ensure_schema`](TargetStore::ensure_schema) has run.
    pub fn schema_ready(&self) -> bool {
        self.read().schema_ready
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.read().staged.is_some()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn with_staged<T>(&self, f: impl FnOnce(&mut MemoryTables) -> Result<T>) -> Result<T> {
        let mut state = self.write();
        let staged = state
            .staged
            .as_mut()
            .ok_or_else(|| Error::Transaction("no open transaction".to_string()))?;
        f(staged)
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    fn target_type(&self) -> &'static str {
        "memory"
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        self.write().schema_ready = true;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        let mut state = self.write();
        if state.staged.is_some() {
            return Err(Error::Transaction("transaction already open".to_string()));
        }
        state.staged = Some(state.committed.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.write();
        let staged = state
            .staged
            .take()
            .ok_or_else(|| Error::Transaction("commit without open transaction".to_string()))?;
        state.committed = staged;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.write().staged = None;
        Ok(())
    }

    async fn upsert_user(&mut self, user: &UserRow) -> Result<WriteOutcome> {
        self.with_staged(|tables| match tables.users.get(&user.name) {
            Some(existing) if *existing == user.password => Ok(WriteOutcome::Unchanged),
            Some(_) => Err(Error::DuplicateKey(user.name.clone())),
            None => {
                tables.users.insert(user.name.clone(), user.password.clone());
                Ok(WriteOutcome::Inserted)
            }
        })
    }

    async fn insert_thing(&mut self, thing: &ThingRow) -> Result<()> {
        self.with_staged(|tables| {
            let key = thing.key();
            if tables.things.contains_key(&key) {
                return Err(Error::ConstraintViolation {
                    entity: "thing",
                    user: key.user,
                    name: key.name,
                });
            }
            tables.things.insert(key, thing.clone());
            Ok(())
        })
    }

    async fn insert_connection(&mut self, connection: &ConnectionRow) -> Result<()> {
        self.with_staged(|tables| {
            let key = ThingKey::new(&connection.user, &connection.name);
            if tables.connections.contains_key(&key) {
                return Err(Error::ConstraintViolation {
                    entity: "connection",
                    user: key.user,
                    name: key.name,
                });
            }
            let row = ConnectionRow {
                parent_index: UNRESOLVED_INDEX,
                ..connection.clone()
            };
            tables.connections.insert(key, row);
            Ok(())
        })
    }

    async fn find_connection(&mut self, user: &str, name: &str) -> Result<Option<ConnectionRow>> {
        self.with_staged(|tables| Ok(tables.connections.get(&ThingKey::new(user, name)).cloned()))
    }

    async fn set_connection_index(&mut self, user: &str, name: &str, index: i64) -> Result<bool> {
        self.with_staged(|tables| {
            Ok(match tables.connections.get_mut(&ThingKey::new(user, name)) {
                Some(row) => {
                    row.parent_index = index;
                    true
                }
                None => false,
            })
        })
    }

    async fn unresolved_connections(&mut self) -> Result<Vec<ConnectionRow>> {
        self.with_staged(|tables| {
            Ok(tables
                .connections
                .values()
                .filter(|c| c.is_unresolved())
                .cloned()
                .collect())
        })
    }

    async fn dangling_connections(&mut self) -> Result<Vec<DanglingConnection>> {
        self.with_staged(|tables| {
            let things: BTreeSet<&ThingKey> = tables.things.keys().collect();
            Ok(tables
                .connections
                .values()
                .filter_map(|c| {
                    let missing_parent = !things.contains(&ThingKey::new(&c.user, &c.parent));
                    let missing_child = !things.contains(&ThingKey::new(&c.user, &c.child));
                    (missing_parent || missing_child).then(|| DanglingConnection {
                        connection: c.clone(),
                        missing_parent,
                        missing_child,
                    })
                })
                .collect())
        })
    }

    async fn thing_page(
        &mut self,
        after: Option<&ThingKey>,
        limit: usize,
    ) -> Result<Vec<ThingRow>> {
        self.with_staged(|tables| {
            let page = match after {
                Some(key) => tables
                    .things
                    .range::<ThingKey, _>((
                        std::ops::Bound::Excluded(key),
                        std::ops::Bound::Unbounded,
                    ))
                    .map(|(_, row)| row.clone())
                    .take(limit)
                    .collect(),
                None => tables.things.values().take(limit).cloned().collect(),
            };
            Ok(page)
        })
    }

    async fn set_json_content(&mut self, key: &ThingKey, tokens: &[Token]) -> Result<bool> {
        self.with_staged(|tables| {
            Ok(match tables.things.get_mut(key) {
                Some(row) => {
                    row.json_content = Some(tokens.to_vec());
                    true
                }
                None => false,
            })
        })
    }

    async fn set_first_created(
        &mut self,
        key: &ThingKey,
        created: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_staged(|tables| {
            Ok(match tables.things.get_mut(key) {
                Some(row) if row.first_created.is_none() => {
                    row.first_created = Some(created);
                    true
                }
                _ => false,
            })
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.write().staged = None;
        Ok(())
    }
}
