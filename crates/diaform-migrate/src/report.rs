//! Migration report: per-phase counts and integrity warnings.

use std::fmt;

use serde::Serialize;

use crate::model::{ConnectionRow, DanglingConnection};

/// Counts for one phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    /// Source records seen.
    pub total: u64,
    /// Rows written.
    pub migrated: u64,
    /// Rows already present with identical data.
    pub unchanged: u64,
    /// Records skipped on a conflict or integrity problem.
    pub skipped: u64,
    /// Records that failed with a row-level error.
    pub failed: u64,
}

impl PhaseStats {
    /// Records that did not end up written or confirmed.
    #[must_use]
    pub fn not_migrated(&self) -> u64 {
        self.skipped + self.failed
    }
}

/// Kind of an [`IntegrityWarning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Connection whose parent or child thing does not exist.
    DanglingReference,
    /// Connection missing from its parent's ordering list.
    OrphanedConnection,
    /// Ordering entry naming no inserted connection.
    UnknownOrderingEntry,
    /// Ordering entry naming a connection of another parent.
    MisplacedOrderingEntry,
    /// Connection listed twice in one ordering list.
    DuplicateOrderingEntry,
    /// Second source document for an existing `(user, name)` thing.
    DuplicateThing,
    /// User already in the target with a different password.
    ConflictingUser,
    /// Thing name that looks like a timestamp but does not decode.
    UnparseableCreationDate,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DanglingReference => "dangling reference",
            Self::OrphanedConnection => "orphaned connection",
            Self::UnknownOrderingEntry => "unknown ordering entry",
            Self::MisplacedOrderingEntry => "misplaced ordering entry",
            Self::DuplicateOrderingEntry => "duplicate ordering entry",
            Self::DuplicateThing => "duplicate thing",
            Self::ConflictingUser => "conflicting user",
            Self::UnparseableCreationDate => "unparseable creation date",
        };
        f.write_str(label)
    }
}

/// A non-fatal data problem, with enough context to fix it by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityWarning {
    pub kind: WarningKind,
    /// Owning user.
    pub user: String,
    /// Thing or connection name (the user name for user warnings).
    pub name: String,
    pub detail: String,
}

impl IntegrityWarning {
    pub fn new(
        kind: WarningKind,
        user: impl Into<String>,
        name: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            user: user.into(),
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// Warning for a connection still carrying the sentinel index.
    pub fn orphaned(connection: &ConnectionRow) -> Self {
        Self::new(
            WarningKind::OrphanedConnection,
            &connection.user,
            &connection.name,
            format!(
                "connection {} -> {} is not in the ordering list of '{}'",
                connection.parent, connection.child, connection.parent
            ),
        )
    }

    /// Warning for a connection with a missing endpoint.
    pub fn dangling(dangling: &DanglingConnection) -> Self {
        let c = &dangling.connection;
        let missing = match (dangling.missing_parent, dangling.missing_child) {
            (true, true) => format!("parent '{}' and child '{}' do not exist", c.parent, c.child),
            (true, false) => format!("parent '{}' does not exist", c.parent),
            _ => format!("child '{}' does not exist", c.child),
        };
        Self::new(WarningKind::DanglingReference, &c.user, &c.name, missing)
    }
}

impl fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] user '{}', '{}': {}",
            self.kind, self.user, self.name, self.detail
        )
    }
}

/// Summary of a migration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    /// Final orchestrator state, e.g. `committed` or `failed`.
    pub state: String,
    pub dry_run: bool,
    pub users: PhaseStats,
    pub things: PhaseStats,
    pub connections: PhaseStats,
    /// Index repair: `total` ordering entries, `migrated` indices set.
    pub indices: PhaseStats,
    /// `first_created` backfill, when it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_created: Option<PhaseStats>,
    pub warnings: Vec<IntegrityWarning>,
    /// Error that ended the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_secs: f64,
}

impl MigrationReport {
    /// Records a warning and logs it.
    pub fn warn(&mut self, warning: IntegrityWarning) {
        tracing::warn!(
            kind = %warning.kind,
            user = %warning.user,
            name = %warning.name,
            "{}",
            warning.detail
        );
        self.warnings.push(warning);
    }

    /// Number of warnings of `kind`.
    #[must_use]
    pub fn count(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }

    /// Rows written across all entity phases.
    #[must_use]
    pub fn rows_migrated(&self) -> u64 {
        self.users.migrated + self.things.migrated + self.connections.migrated
    }

    /// Serializes the report as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Migration {}{} in {:.2}s",
            self.state,
            if self.dry_run { " (dry run)" } else { "" },
            self.duration_secs
        )?;
        writeln!(
            f,
            "  {:<14} {:>8} {:>8} {:>9} {:>8} {:>8}",
            "phase", "total", "written", "unchanged", "skipped", "failed"
        )?;
        for (name, stats) in [
            ("users", &self.users),
            ("things", &self.things),
            ("connections", &self.connections),
            ("indices", &self.indices),
        ]
        .into_iter()
        .chain(self.first_created.as_ref().map(|stats| ("first_created", stats)))
        {
            writeln!(
                f,
                "  {:<14} {:>8} {:>8} {:>9} {:>8} {:>8}",
                name, stats.total, stats.migrated, stats.unchanged, stats.skipped, stats.failed
            )?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "Error: {}", error)?;
        }
        if self.warnings.is_empty() {
            writeln!(f, "No integrity warnings")?;
        } else {
            writeln!(f, "{} integrity warning(s):", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "  {}", warning)?;
            }
        }
        Ok(())
    }
}
