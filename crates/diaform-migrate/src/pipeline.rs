//! Migration pipeline orchestration.
//!
//! A [`Pipeline`] moves through [`MigrationState`]s strictly in order:
//! users, things, connections, index repair, then a single commit. Any
//! error that ends the run rolls the transaction back and leaves the
//! pipeline in [`MigrationState::Failed`]. Every phase tolerates rows that
//! already exist, so a failed or interrupted run is resumed by running
//! again from the top.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backfill::backfill_first_created;
use crate::config::{MigrationConfig, MigrationOptions};
use crate::connectors::{create_connector, Collection, SourceConnector};
use crate::error::{Error, ErrorClass, Result};
use crate::legacy::LegacyChildren;
use crate::model::{ConnectionRow, ThingKey, ThingOrdering, ThingRow, UserRow};
use crate::ordering;
use crate::report::{IntegrityWarning, MigrationReport, PhaseStats, WarningKind};
use crate::retry::RetryConfig;
use crate::source::SourceReader;
use crate::target::{create_target, TargetStore, WriteOutcome};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Init,
    MigratingUsers,
    MigratingThings,
    MigratingConnections,
    RepairingIndices,
    Committed,
    Failed,
}

impl MigrationState {
    /// The state that follows on success, if any.
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::MigratingUsers),
            Self::MigratingUsers => Some(Self::MigratingThings),
            Self::MigratingThings => Some(Self::MigratingConnections),
            Self::MigratingConnections => Some(Self::RepairingIndices),
            Self::RepairingIndices => Some(Self::Committed),
            Self::Committed | Self::Failed => None,
        }
    }

    /// True for `Committed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    /// Whether `next` is a legal transition from `self`.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        if next == Self::Failed {
            return !self.is_terminal();
        }
        self.successor() == Some(next)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::MigratingUsers => "migrating_users",
            Self::MigratingThings => "migrating_things",
            Self::MigratingConnections => "migrating_connections",
            Self::RepairingIndices => "repairing_indices",
            Self::Committed => "committed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Migration pipeline.
pub struct Pipeline {
    options: MigrationOptions,
    connector: Box<dyn SourceConnector>,
    target: Box<dyn TargetStore>,
    state: MigrationState,
    report: MigrationReport,
    started: Option<Instant>,
}

impl Pipeline {
    /// Create a pipeline from explicit parts.
    pub fn new(
        connector: Box<dyn SourceConnector>,
        target: Box<dyn TargetStore>,
        options: MigrationOptions,
    ) -> Self {
        let report = MigrationReport {
            state: MigrationState::Init.to_string(),
            dry_run: options.dry_run,
            ..Default::default()
        };
        Self {
            options,
            connector,
            target,
            state: MigrationState::Init,
            report,
            started: None,
        }
    }

    /// Create a pipeline from configuration.
    ///
    /// # Errors
    ///
    /// Returns a fatal configuration error if the configuration is invalid
    /// or the destination cannot be reached.
    pub async fn from_config(config: &MigrationConfig) -> Result<Self> {
        config.validate()?;
        let connector = create_connector(&config.source)?;
        let target = create_target(&config.destination, config.options.dry_run).await?;
        if config.options.dry_run {
            info!("Dry run mode - writing to an in-memory target");
        }
        Ok(Self::new(connector, target, config.options.clone()))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Report of the run so far.
    #[must_use]
    pub fn report(&self) -> &MigrationReport {
        &self.report
    }

    /// Run the migration pipeline.
    ///
    /// On error the transaction is rolled back, the state is `Failed` and
    /// [`report`](Self::report) still holds the counts reached.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run.
    pub async fn run(&mut self) -> Result<MigrationReport> {
        if self.state != MigrationState::Init {
            return Err(Error::Transaction(format!(
                "pipeline already ran (state {})",
                self.state
            )));
        }
        self.started = Some(Instant::now());
        info!(
            source = self.connector.source_type(),
            target = self.target.target_type(),
            "Starting migration pipeline"
        );

        let result = self.execute().await;
        match &result {
            Ok(()) => {
                if self.options.backfill_first_created {
                    self.backfill().await;
                }
            }
            Err(e) => {
                error!(code = e.code(), state = %self.state, "Migration failed: {}", e);
                self.fail(e.to_string()).await;
            }
        }
        self.finish().await;

        if result.is_ok() {
            info!(
                "Migration complete: {} users, {} things, {} connections written, {} indices set, {} warnings in {:.2}s",
                self.report.users.migrated,
                self.report.things.migrated,
                self.report.connections.migrated,
                self.report.indices.migrated,
                self.report.warnings.len(),
                self.report.duration_secs
            );
        }
        result.map(|()| self.report.clone())
    }

    /// Abandons a run that was cancelled before it finished.
    ///
    /// Rolls back the open transaction unless the run already committed.
    pub async fn abort(&mut self) -> MigrationReport {
        if !self.state.is_terminal() {
            warn!(state = %self.state, "Migration interrupted, rolling back");
            self.fail(Error::Interrupted.to_string()).await;
            self.finish().await;
        }
        self.report.clone()
    }

    async fn execute(&mut self) -> Result<()> {
        self.connector.connect().await?;
        if self.options.create_schema {
            self.target.ensure_schema().await?;
        }
        self.target.begin().await?;

        self.advance(MigrationState::MigratingUsers)?;
        self.context().migrate_users().await?;

        self.advance(MigrationState::MigratingThings)?;
        self.context().migrate_things().await?;

        self.advance(MigrationState::MigratingConnections)?;
        self.context().migrate_connections().await?;

        self.advance(MigrationState::RepairingIndices)?;
        self.context().repair_indices().await?;

        self.target.commit().await?;
        self.advance(MigrationState::Committed)
    }

    fn advance(&mut self, next: MigrationState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::Transaction(format!(
                "illegal transition {} -> {}",
                self.state, next
            )));
        }
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
        self.report.state = next.to_string();
        Ok(())
    }

    async fn fail(&mut self, reason: String) {
        if let Err(e) = self.target.rollback().await {
            warn!("Rollback failed: {}", e);
        }
        if !self.state.is_terminal() {
            self.state = MigrationState::Failed;
            self.report.state = self.state.to_string();
        }
        self.report.error = Some(reason);
    }

    async fn backfill(&mut self) {
        match backfill_first_created(self.target.as_mut(), self.options.batch_size).await {
            Ok(outcome) => {
                self.report.first_created = Some(outcome.stats);
                for warning in outcome.warnings {
                    self.report.warn(warning);
                }
            }
            Err(e) => warn!("first_created backfill failed, migration stays committed: {}", e),
        }
    }

    async fn finish(&mut self) {
        if let Some(started) = self.started {
            self.report.duration_secs = started.elapsed().as_secs_f64();
        }
        if let Err(e) = self.connector.close().await {
            warn!("Failed to close source: {}", e);
        }
        if let Err(e) = self.target.close().await {
            warn!("Failed to close target: {}", e);
        }
    }

    fn context(&mut self) -> PhaseContext<'_> {
        PhaseContext {
            state: self.state,
            reader: SourceReader::new(
                self.connector.as_ref(),
                self.options.batch_size,
                RetryConfig::from(&self.options.retry),
            ),
            target: self.target.as_mut(),
            options: &self.options,
            report: &mut self.report,
        }
    }
}

/// Everything one phase works with.
struct PhaseContext<'p> {
    state: MigrationState,
    reader: SourceReader<'p>,
    target: &'p mut dyn TargetStore,
    options: &'p MigrationOptions,
    report: &'p mut MigrationReport,
}

impl<'p> PhaseContext<'p> {
    fn stats(&mut self) -> &mut PhaseStats {
        match self.state {
            MigrationState::MigratingUsers => &mut self.report.users,
            MigrationState::MigratingThings => &mut self.report.things,
            MigrationState::MigratingConnections => &mut self.report.connections,
            _ => &mut self.report.indices,
        }
    }

    async fn progress(&self, collection: Collection) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }
        let total = self.reader.count(collection).await.unwrap_or_else(|e| {
            debug!("Could not count {}: {}", collection, e);
            None
        });
        create_progress_bar(total, self.state)
    }

    /// Classifies a failed write of one row.
    fn row_error(&mut self, user: &str, name: &str, error: Error) -> Result<()> {
        match error.class() {
            ErrorClass::ConstraintViolation => {
                self.stats().skipped += 1;
                warn!(user, name, code = error.code(), "Skipped existing row: {}", error);
                Ok(())
            }
            ErrorClass::DuplicateKey => {
                self.stats().skipped += 1;
                self.report.warn(IntegrityWarning::new(
                    WarningKind::ConflictingUser,
                    user,
                    name,
                    "already exists in the target with a different password",
                ));
                Ok(())
            }
            ErrorClass::Row if self.options.continue_on_error => {
                self.stats().failed += 1;
                error!(user, name, code = error.code(), "Row failed: {}", error);
                Ok(())
            }
            _ => {
                self.stats().failed += 1;
                Err(error)
            }
        }
    }

    /// Classifies a source item that could not be read.
    fn source_error(&mut self, error: Error) -> Result<()> {
        self.stats().failed += 1;
        if error.is_row_level() && self.options.continue_on_error {
            error!(code = error.code(), "{}", error);
            Ok(())
        } else {
            Err(error)
        }
    }

    async fn migrate_users(mut self) -> Result<()> {
        info!("Migrating users");
        let bar = self.progress(Collection::Users).await;
        let mut users = self.reader.users();

        while let Some(item) = users.next().await {
            self.stats().total += 1;
            bar.inc(1);
            let user = match item {
                Ok(user) => UserRow::from(user),
                Err(e) => {
                    self.source_error(e)?;
                    continue;
                }
            };
            match self.target.upsert_user(&user).await {
                Ok(WriteOutcome::Inserted) => self.stats().migrated += 1,
                Ok(WriteOutcome::Unchanged) => self.stats().unchanged += 1,
                Err(e) => self.row_error(&user.name, &user.name, e)?,
            }
        }

        bar.finish_and_clear();
        log_phase("Users", &self.report.users);
        Ok(())
    }

    async fn migrate_things(mut self) -> Result<()> {
        info!("Migrating things");
        let bar = self.progress(Collection::Things).await;
        let mut things = self.reader.things();

        while let Some(item) = things.next().await {
            self.stats().total += 1;
            bar.inc(1);
            let thing = match item {
                Ok(thing) => ThingRow::from_source(&thing),
                Err(e) => {
                    self.source_error(e)?;
                    continue;
                }
            };
            match self.target.insert_thing(&thing).await {
                Ok(()) => self.stats().migrated += 1,
                Err(e) => self.row_error(&thing.user, &thing.name, e)?,
            }
        }

        bar.finish_and_clear();
        log_phase("Things", &self.report.things);
        Ok(())
    }

    async fn migrate_connections(mut self) -> Result<()> {
        info!("Migrating connections");
        let bar = self.progress(Collection::Connections).await;
        let mut connections = self.reader.connections();

        while let Some(item) = connections.next().await {
            bar.inc(1);
            match item {
                Ok(connection) => {
                    self.insert_connection(ConnectionRow::from_source(connection))
                        .await?
                }
                Err(e) => {
                    self.stats().total += 1;
                    self.source_error(e)?;
                }
            }
        }
        bar.finish_and_clear();

        if self.options.legacy_children {
            self.convert_legacy_children().await?;
        }

        log_phase("Connections", &self.report.connections);
        Ok(())
    }

    async fn convert_legacy_children(&mut self) -> Result<()> {
        info!("Converting legacy children lists");
        let mut legacy = LegacyChildren::new();
        let mut things = self.reader.things();

        while let Some(item) = things.next().await {
            let thing = match item {
                Ok(thing) => thing,
                // Already counted by the things phase.
                Err(e) if e.is_row_level() => continue,
                Err(e) => return Err(e),
            };
            let Some(expansion) = legacy.expand(&thing) else {
                continue;
            };
            for connection in expansion.connections {
                self.insert_connection(ConnectionRow::from_source(connection))
                    .await?;
            }
        }
        Ok(())
    }

    async fn insert_connection(&mut self, connection: ConnectionRow) -> Result<()> {
        self.stats().total += 1;
        match self.target.insert_connection(&connection).await {
            Ok(()) => {
                self.stats().migrated += 1;
                Ok(())
            }
            Err(e) => self.row_error(&connection.user, &connection.name, e),
        }
    }

    async fn repair_indices(mut self) -> Result<()> {
        info!("Repairing connection indices");
        let bar = self.progress(Collection::Things).await;
        let mut orderings = self.orderings();
        let mut replayed: HashSet<ThingKey> = HashSet::new();

        while let Some(item) = orderings.next().await {
            bar.inc(1);
            let list = match item {
                Ok(list) => list,
                Err(e) if e.is_row_level() => continue,
                Err(e) => return Err(e),
            };

            // Only the first document of a (user, name) pair was inserted.
            if !replayed.insert(ThingKey::new(&list.user, &list.thing)) {
                let entries = list.connections.len() as u64;
                let stats = self.stats();
                stats.total += entries;
                stats.skipped += entries;
                self.report.warn(IntegrityWarning::new(
                    WarningKind::DuplicateThing,
                    &list.user,
                    &list.thing,
                    format!(
                        "ordering list of a repeated thing document ignored ({} entries)",
                        entries
                    ),
                ));
                continue;
            }

            let resolution = ordering::resolve(&mut *self.target, &list).await?;
            let stats = self.stats();
            stats.total += list.connections.len() as u64;
            stats.migrated += resolution.assigned;
            stats.unchanged += resolution.unchanged;
            stats.skipped += resolution.skipped();
            for warning in resolution.warnings {
                self.report.warn(warning);
            }
        }
        bar.finish_and_clear();

        for dangling in self.target.dangling_connections().await? {
            self.report.warn(IntegrityWarning::dangling(&dangling));
        }
        for orphan in ordering::orphans(&mut *self.target).await? {
            self.report.warn(orphan);
        }

        log_phase("Indices", &self.report.indices);
        Ok(())
    }

    /// Ordering lists to replay, synthesized for legacy things when enabled.
    fn orderings(&self) -> BoxStream<'p, Result<ThingOrdering>> {
        if self.options.legacy_children {
            let mut legacy = LegacyChildren::new();
            self.reader
                .things()
                .map_ok(move |thing| legacy.ordering(thing))
                .boxed()
        } else {
            self.reader.orderings()
        }
    }
}

fn log_phase(phase: &str, stats: &PhaseStats) {
    info!(
        "{} done: {} written, {} unchanged, {} skipped, {} failed of {}",
        phase, stats.migrated, stats.unchanged, stats.skipped, stats.failed, stats.total
    );
}

fn create_progress_bar(total: Option<u64>, state: MigrationState) -> ProgressBar {
    let pb = match total {
        Some(total) if total > 0 => ProgressBar::new(total),
        _ => ProgressBar::new_spinner(),
    };

    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} {prefix:<22} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_prefix(state.to_string());

    pb
}
