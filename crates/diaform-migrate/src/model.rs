//! Records read from the source store and rows written to the target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::Token;

/// `parent_index` of a connection whose position has not been resolved yet.
pub const UNRESOLVED_INDEX: i64 = -1;

/// A user document from the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUser {
    /// Unique user name.
    pub name: String,
    /// Opaque credential, copied verbatim.
    #[serde(rename = "hashedPassword")]
    pub hashed_password: String,
}

/// A thing document from the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceThing {
    /// Owning user.
    pub user: String,
    /// Name, unique within the user.
    pub name: String,
    /// Raw content with inline `#link` markers.
    #[serde(default)]
    pub content: String,
    /// Ordered names of the connections this thing is the parent of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<String>>,
    /// Legacy ordered list of child thing names, predating connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
}

impl SourceThing {
    /// Primary key of the thing.
    pub fn key(&self) -> ThingKey {
        ThingKey::new(&self.user, &self.name)
    }
}

/// A connection document from the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConnection {
    /// Owning user.
    pub user: String,
    /// Name, unique within the user.
    pub name: String,
    /// Parent thing name.
    pub parent: String,
    /// Child thing name.
    pub child: String,
    /// Optional edge label.
    #[serde(default)]
    pub tag: Option<String>,
}

/// Primary key shared by things and connections: `(user, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThingKey {
    /// Owning user.
    pub user: String,
    /// Name within the user.
    pub name: String,
}

impl ThingKey {
    /// Builds a key from borrowed parts.
    pub fn new(user: &str, name: &str) -> Self {
        Self {
            user: user.to_string(),
            name: name.to_string(),
        }
    }
}

/// Row of the `users` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRow {
    pub name: String,
    pub password: String,
}

impl From<SourceUser> for UserRow {
    fn from(user: SourceUser) -> Self {
        Self {
            name: user.name,
            password: user.hashed_password,
        }
    }
}

/// Row of the `things` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThingRow {
    pub user: String,
    pub name: String,
    pub content: String,
    /// Tokenized form of `content`; `None` when the stored value is not a
    /// token array (e.g. written by older tooling).
    pub json_content: Option<Vec<Token>>,
    /// Best-effort creation time, never authoritative.
    pub first_created: Option<DateTime<Utc>>,
}

impl ThingRow {
    /// Builds a row from a source thing, deriving `json_content` from its content.
    pub fn from_source(thing: &SourceThing) -> Self {
        Self {
            user: thing.user.clone(),
            name: thing.name.clone(),
            content: thing.content.clone(),
            json_content: Some(crate::content::tokenize(&thing.content)),
            first_created: None,
        }
    }

    /// Primary key of the row.
    pub fn key(&self) -> ThingKey {
        ThingKey::new(&self.user, &self.name)
    }
}

/// Row of the `connections` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRow {
    pub user: String,
    pub name: String,
    pub parent: String,
    pub child: String,
    pub tag: Option<String>,
    /// Position among the parent's connections, or [`UNRESOLVED_INDEX`].
    pub parent_index: i64,
}

impl ConnectionRow {
    /// Builds an unresolved row from a source connection.
    pub fn from_source(connection: SourceConnection) -> Self {
        Self {
            user: connection.user,
            name: connection.name,
            parent: connection.parent,
            child: connection.child,
            tag: connection.tag,
            parent_index: UNRESOLVED_INDEX,
        }
    }

    /// True while the repair pass has not assigned a position.
    pub fn is_unresolved(&self) -> bool {
        self.parent_index == UNRESOLVED_INDEX
    }
}

/// A connection whose parent or child thing does not exist for its user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingConnection {
    pub connection: ConnectionRow,
    pub missing_parent: bool,
    pub missing_child: bool,
}

/// The ordering list recorded on a parent thing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThingOrdering {
    pub user: String,
    pub thing: String,
    /// Connection names in display order.
    pub connections: Vec<String>,
}
