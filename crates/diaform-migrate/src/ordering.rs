//! Connection ordering repair.
//!
//! Connections are inserted with `parent_index = -1` because their position
//! is only recorded on the parent thing. Once every connection exists, each
//! parent's ordering list is replayed: the entry at position `i` gets
//! `parent_index = i`. Entries that cannot be applied are skipped with a
//! warning and keep their slot, so positions always match the source list.

use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::model::ThingOrdering;
use crate::report::{IntegrityWarning, WarningKind};
use crate::target::TargetStore;

/// Outcome of replaying one ordering list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Indices written.
    pub assigned: u64,
    /// Connections that already had the right index.
    pub unchanged: u64,
    /// Entries skipped; one warning each.
    pub warnings: Vec<IntegrityWarning>,
}

impl Resolution {
    /// Number of skipped entries.
    pub fn skipped(&self) -> u64 {
        self.warnings.len() as u64
    }
}

/// Positions to assign, with duplicate entries dropped.
///
/// The first occurrence of a name keeps its position; later ones are
/// reported as [`WarningKind::DuplicateOrderingEntry`].
pub fn plan(ordering: &ThingOrdering) -> (Vec<(i64, &str)>, Vec<IntegrityWarning>) {
    let mut seen = HashSet::new();
    let mut assignments = Vec::with_capacity(ordering.connections.len());
    let mut warnings = Vec::new();

    for (position, name) in ordering.connections.iter().enumerate() {
        if seen.insert(name.as_str()) {
            assignments.push((position as i64, name.as_str()));
        } else {
            warnings.push(IntegrityWarning::new(
                WarningKind::DuplicateOrderingEntry,
                &ordering.user,
                name,
                format!(
                    "listed again at position {} of '{}'",
                    position, ordering.thing
                ),
            ));
        }
    }
    (assignments, warnings)
}

/// Assigns `parent_index` to every connection named by `ordering`.
///
/// Unknown connections and connections of another parent are skipped with
/// a warning. Writing an index the row already has is counted as unchanged
/// and not written, so a repeat run changes nothing.
///
/// # Errors
///
/// Returns an error only if the target store fails.
pub async fn resolve(target: &mut dyn TargetStore, ordering: &ThingOrdering) -> Result<Resolution> {
    let (assignments, warnings) = plan(ordering);
    let mut resolution = Resolution {
        warnings,
        ..Default::default()
    };

    for (index, name) in assignments {
        let Some(connection) = target.find_connection(&ordering.user, name).await? else {
            resolution.warnings.push(IntegrityWarning::new(
                WarningKind::UnknownOrderingEntry,
                &ordering.user,
                name,
                format!(
                    "listed at position {} of '{}' but no such connection exists",
                    index, ordering.thing
                ),
            ));
            continue;
        };

        if connection.parent != ordering.thing {
            resolution.warnings.push(IntegrityWarning::new(
                WarningKind::MisplacedOrderingEntry,
                &ordering.user,
                name,
                format!(
                    "listed under '{}' but its parent is '{}'",
                    ordering.thing, connection.parent
                ),
            ));
            continue;
        }

        if connection.parent_index == index {
            resolution.unchanged += 1;
            continue;
        }

        target
            .set_connection_index(&ordering.user, name, index)
            .await?;
        debug!(user = %ordering.user, connection = %name, index, "Set parent index");
        resolution.assigned += 1;
    }

    Ok(resolution)
}

/// Warnings for every connection still carrying the sentinel index.
///
/// # Errors
///
/// Returns an error if the target store fails.
pub async fn orphans(target: &mut dyn TargetStore) -> Result<Vec<IntegrityWarning>> {
    Ok(target
        .unresolved_connections()
        .await?
        .iter()
        .map(IntegrityWarning::orphaned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionRow;
    use crate::target::memory::MemoryTarget;

    fn ordering(thing: &str, names: &[&str]) -> ThingOrdering {
        ThingOrdering {
            user: "ann".into(),
            thing: thing.into(),
            connections: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn target_with(connections: &[(&str, &str)]) -> MemoryTarget {
        let mut target = MemoryTarget::new();
        target.begin().await.unwrap();
        for (name, parent) in connections {
            target
                .insert_connection(&ConnectionRow {
                    user: "ann".into(),
                    name: name.to_string(),
                    parent: parent.to_string(),
                    child: "x".into(),
                    tag: None,
                    parent_index: -1,
                })
                .await
                .unwrap();
        }
        target
    }

    #[test]
    fn test_plan_keeps_first_duplicate() {
        let o = ordering("p", &["a", "b", "a"]);
        let (assignments, warnings) = plan(&o);
        assert_eq!(assignments, vec![(0, "a"), (1, "b")]);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::DuplicateOrderingEntry);
    }

    #[tokio::test]
    async fn test_resolve_assigns_list_positions() {
        let mut target = target_with(&[("a", "p"), ("b", "p"), ("c", "p")]).await;

        let resolution = resolve(&mut target, &ordering("p", &["c", "a", "b"]))
            .await
            .unwrap();
        assert_eq!(resolution.assigned, 3);
        assert!(resolution.warnings.is_empty());

        let c = target.find_connection("ann", "c").await.unwrap().unwrap();
        let b = target.find_connection("ann", "b").await.unwrap().unwrap();
        assert_eq!(c.parent_index, 0);
        assert_eq!(b.parent_index, 2);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let mut target = target_with(&[("a", "p"), ("b", "p")]).await;
        let o = ordering("p", &["a", "b"]);

        resolve(&mut target, &o).await.unwrap();
        let again = resolve(&mut target, &o).await.unwrap();
        assert_eq!(again.assigned, 0);
        assert_eq!(again.unchanged, 2);
    }

    #[tokio::test]
    async fn test_resolve_skips_unknown_and_misplaced_entries() {
        let mut target = target_with(&[("a", "p"), ("b", "q")]).await;

        let resolution = resolve(&mut target, &ordering("p", &["ghost", "b", "a"]))
            .await
            .unwrap();
        assert_eq!(resolution.assigned, 1);
        assert_eq!(resolution.skipped(), 2);
        assert_eq!(resolution.warnings[0].kind, WarningKind::UnknownOrderingEntry);
        assert_eq!(resolution.warnings[1].kind, WarningKind::MisplacedOrderingEntry);

        // Skipped entries keep their slot.
        let a = target.find_connection("ann", "a").await.unwrap().unwrap();
        assert_eq!(a.parent_index, 2);
        let b = target.find_connection("ann", "b").await.unwrap().unwrap();
        assert!(b.is_unresolved());
    }

    #[tokio::test]
    async fn test_orphans_reports_unresolved() {
        let mut target = target_with(&[("a", "p"), ("b", "p")]).await;
        resolve(&mut target, &ordering("p", &["a"])).await.unwrap();

        let warnings = orphans(&mut target).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::OrphanedConnection);
        assert_eq!(warnings[0].name, "b");
    }
}
