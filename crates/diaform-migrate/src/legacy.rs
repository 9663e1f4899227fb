//! Conversion of legacy `children` lists into connections.
//!
//! Older databases record a thing's children as an ordered list of thing
//! names instead of connection documents. A [`LegacyChildren`] converter
//! numbers synthesized connections per user (`"0"`, `"1"`, ...) in scan
//! order, so two scans over the same source produce the same names. Only
//! the first document of a repeated `(user, name)` thing is expanded.

use std::collections::{HashMap, HashSet};

use crate::model::{SourceConnection, SourceThing, ThingKey, ThingOrdering};

/// Connections synthesized for one thing, and its resulting ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyExpansion {
    pub connections: Vec<SourceConnection>,
    pub ordering: ThingOrdering,
}

/// Per-user connection numbering for one scan.
#[derive(Debug, Default)]
pub struct LegacyChildren {
    counters: HashMap<String, u64>,
    seen: HashSet<ThingKey>,
}

impl LegacyChildren {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for things that only carry the legacy `children` list.
    pub fn applies(thing: &SourceThing) -> bool {
        thing.connections.is_none() && thing.children.is_some()
    }

    /// Synthesizes connections for `thing`, or `None` if it is not legacy.
    ///
    /// Must be called for every thing of a scan, in scan order.
    pub fn expand(&mut self, thing: &SourceThing) -> Option<LegacyExpansion> {
        if !self.seen.insert(thing.key()) || !Self::applies(thing) {
            return None;
        }
        let children = thing.children.as_deref().unwrap_or_default();
        let counter = self.counters.entry(thing.user.clone()).or_insert(0);

        let connections: Vec<SourceConnection> = children
            .iter()
            .map(|child| {
                let name = counter.to_string();
                *counter += 1;
                SourceConnection {
                    user: thing.user.clone(),
                    name,
                    parent: thing.name.clone(),
                    child: child.clone(),
                    tag: None,
                }
            })
            .collect();

        let ordering = ThingOrdering {
            user: thing.user.clone(),
            thing: thing.name.clone(),
            connections: connections.iter().map(|c| c.name.clone()).collect(),
        };
        Some(LegacyExpansion {
            connections,
            ordering,
        })
    }

    /// The ordering list to replay for `thing`.
    pub fn ordering(&mut self, thing: SourceThing) -> ThingOrdering {
        match self.expand(&thing) {
            Some(expansion) => expansion.ordering,
            None => ThingOrdering {
                user: thing.user,
                thing: thing.name,
                connections: thing.connections.unwrap_or_default(),
            },
        }
    }
}
