//! End-to-end pipeline tests: JSON dump source, in-memory target.
//!
//! Run with: `cargo test -p diaform-migrate --test pipeline_test`

#![allow(clippy::pedantic)]

use std::io::Write;

use serde_json::json;
use tempfile::NamedTempFile;

use diaform_migrate::config::{DestinationConfig, MigrationConfig, MigrationOptions, PostgresConfig, SourceConfig};
use diaform_migrate::connectors::json_file::{JsonFileConfig, JsonFileConnector};
use diaform_migrate::model::ThingKey;
use diaform_migrate::target::memory::{MemoryTables, MemoryTarget};
use diaform_migrate::{Error, MigrationReport, MigrationState, Pipeline, Token, WarningKind};

fn write_dump(dump: serde_json::Value) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(dump.to_string().as_bytes()).unwrap();
    file
}

fn options() -> MigrationOptions {
    MigrationOptions {
        batch_size: 2,
        progress: false,
        ..Default::default()
    }
}

async fn migrate_with(
    dump: &NamedTempFile,
    target: &MemoryTarget,
    options: MigrationOptions,
) -> (Pipeline, Result<MigrationReport, Error>) {
    let connector = JsonFileConnector::new(JsonFileConfig {
        path: dump.path().to_path_buf(),
    });
    let mut pipeline = Pipeline::new(Box::new(connector), Box::new(target.clone()), options);
    let result = pipeline.run().await;
    (pipeline, result)
}

async fn migrate(dump: &NamedTempFile, target: &MemoryTarget) -> MigrationReport {
    let (_, result) = migrate_with(dump, target, options()).await;
    result.unwrap()
}

/// Two users; ann has a parent with three ordered children.
fn knowledge_base() -> serde_json::Value {
    json!({
        "users": [
            {"_id": {"$oid": "1"}, "name": "ann", "hashedPassword": "$2b$ann"},
            {"_id": {"$oid": "2"}, "name": "bob", "hashedPassword": "$2b$bob"}
        ],
        "things": [
            {"user": "ann", "name": "root", "content": "Plan: #a then #b", "connections": ["2", "0", "1"]},
            {"user": "ann", "name": "a", "content": "first", "connections": []},
            {"user": "ann", "name": "b", "content": "", "connections": []},
            {"user": "ann", "name": "c", "content": "last #root", "connections": []},
            {"user": "bob", "name": "root", "content": "", "connections": ["0"]},
            {"user": "bob", "name": "x", "content": "", "connections": []}
        ],
        "connections": [
            {"user": "ann", "name": "0", "parent": "root", "child": "a"},
            {"user": "ann", "name": "1", "parent": "root", "child": "b", "tag": "see also"},
            {"user": "ann", "name": "2", "parent": "root", "child": "c"},
            {"user": "bob", "name": "0", "parent": "root", "child": "x"}
        ]
    })
}

fn indices(tables: &MemoryTables, user: &str, parent: &str) -> Vec<(String, i64)> {
    tables
        .children_of(user, parent)
        .iter()
        .map(|c| (c.name.clone(), c.parent_index))
        .collect()
}

#[tokio::test]
async fn test_full_migration_orders_connections() {
    let dump = write_dump(knowledge_base());
    let target = MemoryTarget::new();

    let report = migrate(&dump, &target).await;

    assert_eq!(report.state, "committed");
    assert_eq!(report.users.migrated, 2);
    assert_eq!(report.things.migrated, 6);
    assert_eq!(report.connections.migrated, 4);
    assert_eq!(report.indices.migrated, 4);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let tables = target.snapshot();
    assert_eq!(
        indices(&tables, "ann", "root"),
        vec![("2".into(), 0), ("0".into(), 1), ("1".into(), 2)]
    );
    assert_eq!(indices(&tables, "bob", "root"), vec![("0".into(), 0)]);
    assert!(tables.connections.values().all(|c| !c.is_unresolved()));

    let tagged = &tables.connections[&ThingKey::new("ann", "1")];
    assert_eq!(tagged.tag.as_deref(), Some("see also"));
    assert_eq!(tables.users["bob"], "$2b$bob");
}

#[tokio::test]
async fn test_things_carry_tokenized_content() {
    let dump = write_dump(knowledge_base());
    let target = MemoryTarget::new();
    migrate(&dump, &target).await;

    let tables = target.snapshot();
    let root = &tables.things[&ThingKey::new("ann", "root")];
    assert_eq!(root.content, "Plan: #a then #b");
    assert_eq!(
        root.json_content,
        Some(vec![
            Token::Text("Plan: ".into()),
            Token::Link("a".into()),
            Token::Text(" then ".into()),
            Token::Link("b".into()),
        ])
    );
    assert_eq!(
        tables.things[&ThingKey::new("ann", "b")].json_content,
        Some(Vec::new())
    );
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dump = write_dump(knowledge_base());
    let target = MemoryTarget::new();
    migrate(&dump, &target).await;
    let first = target.snapshot();

    let report = migrate(&dump, &target).await;

    assert_eq!(report.state, "committed");
    assert_eq!(report.rows_migrated(), 0);
    assert_eq!(report.users.unchanged, 2);
    assert_eq!(report.things.skipped, 6);
    assert_eq!(report.connections.skipped, 4);
    assert_eq!(report.indices.migrated, 0);
    assert_eq!(report.indices.unchanged, 4);
    assert!(report.warnings.is_empty());
    assert_eq!(target.snapshot(), first);
}

#[tokio::test]
async fn test_orphaned_and_dangling_connections_are_reported() {
    let dump = write_dump(json!({
        "users": [{"name": "ann", "hashedPassword": "h"}],
        "things": [
            {"user": "ann", "name": "p", "content": "", "connections": ["0", "ghost"]},
            {"user": "ann", "name": "a", "content": ""}
        ],
        "connections": [
            {"user": "ann", "name": "0", "parent": "p", "child": "a"},
            {"user": "ann", "name": "1", "parent": "p", "child": "a"},
            {"user": "ann", "name": "2", "parent": "p", "child": "missing"}
        ]
    }));
    let target = MemoryTarget::new();

    let report = migrate(&dump, &target).await;

    assert_eq!(report.state, "committed");
    assert_eq!(report.count(WarningKind::UnknownOrderingEntry), 1);
    assert_eq!(report.count(WarningKind::DanglingReference), 1);
    assert_eq!(report.count(WarningKind::OrphanedConnection), 2);

    let orphans: Vec<&str> = report
        .warnings
        .iter()
        .filter(|w| w.kind == WarningKind::OrphanedConnection)
        .map(|w| w.name.as_str())
        .collect();
    assert_eq!(orphans, vec!["1", "2"]);

    // Every connection is either resolved or reported.
    let tables = target.snapshot();
    for connection in tables.connections.values() {
        assert!(!connection.is_unresolved() || orphans.contains(&connection.name.as_str()));
    }
}

#[tokio::test]
async fn test_user_without_things_adds_only_user_row() {
    let dump = write_dump(json!({"users": [{"name": "solo", "hashedPassword": "h"}]}));
    let target = MemoryTarget::new();

    let report = migrate(&dump, &target).await;

    assert_eq!(report.state, "committed");
    assert!(report.warnings.is_empty());
    let tables = target.snapshot();
    assert_eq!(tables.row_count(), 1);
    assert_eq!(tables.users["solo"], "h");
}

#[tokio::test]
async fn test_conflicting_user_is_warned_and_kept() {
    let dump = write_dump(knowledge_base());
    let mut existing = MemoryTables::default();
    existing.users.insert("ann".into(), "older-hash".into());
    let target = MemoryTarget::with_tables(existing);

    let report = migrate(&dump, &target).await;

    assert_eq!(report.state, "committed");
    assert_eq!(report.users.skipped, 1);
    assert_eq!(report.users.migrated, 1);
    assert_eq!(report.count(WarningKind::ConflictingUser), 1);
    assert_eq!(target.snapshot().users["ann"], "older-hash");
}

#[tokio::test]
async fn test_legacy_children_become_ordered_connections() {
    let dump = write_dump(json!({
        "users": [{"name": "ann", "hashedPassword": "h"}],
        "things": [
            {"user": "ann", "name": "p", "content": "", "children": ["b", "a"]},
            {"user": "ann", "name": "q", "content": "", "children": ["a"]},
            {"user": "ann", "name": "a", "content": ""},
            {"user": "ann", "name": "b", "content": ""}
        ]
    }));
    let target = MemoryTarget::new();
    let (_, result) = migrate_with(
        &dump,
        &target,
        MigrationOptions {
            legacy_children: true,
            ..options()
        },
    )
    .await;
    let report = result.unwrap();

    assert_eq!(report.connections.migrated, 3);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let tables = target.snapshot();
    assert_eq!(indices(&tables, "ann", "p"), vec![("0".into(), 0), ("1".into(), 1)]);
    assert_eq!(indices(&tables, "ann", "q"), vec![("2".into(), 0)]);
    assert_eq!(tables.connections[&ThingKey::new("ann", "0")].child, "b");
}

#[tokio::test]
async fn test_legacy_children_ignored_when_disabled() {
    let dump = write_dump(json!({
        "things": [
            {"user": "ann", "name": "p", "content": "", "children": ["a"]},
            {"user": "ann", "name": "a", "content": ""}
        ]
    }));
    let target = MemoryTarget::new();

    let report = migrate(&dump, &target).await;

    assert_eq!(report.connections.total, 0);
    assert!(target.snapshot().connections.is_empty());
}

#[tokio::test]
async fn test_undecodable_document_is_counted_and_skipped() {
    let dump = write_dump(json!({
        "users": [{"name": "ann", "hashedPassword": "h"}],
        "things": [
            {"user": "ann", "name": "a", "content": ""},
            {"name": "no-owner"},
            {"user": "ann", "name": "b", "content": ""}
        ]
    }));
    let target = MemoryTarget::new();

    let report = migrate(&dump, &target).await;
    assert_eq!(report.state, "committed");
    assert_eq!(report.things.total, 3);
    assert_eq!(report.things.migrated, 2);
    assert_eq!(report.things.failed, 1);

    let strict = MemoryTarget::new();
    let (pipeline, result) = migrate_with(
        &dump,
        &strict,
        MigrationOptions {
            continue_on_error: false,
            ..options()
        },
    )
    .await;
    assert!(matches!(result, Err(Error::Decode { .. })));
    assert_eq!(pipeline.state(), MigrationState::Failed);
    assert_eq!(strict.snapshot().row_count(), 0);
}

#[tokio::test]
async fn test_missing_dump_fails_before_any_phase() {
    let target = MemoryTarget::new();
    let connector = JsonFileConnector::new(JsonFileConfig {
        path: "/nonexistent/dump.json".into(),
    });
    let mut pipeline = Pipeline::new(Box::new(connector), Box::new(target.clone()), options());

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(pipeline.state(), MigrationState::Failed);
    assert_eq!(pipeline.report().users.total, 0);
    assert!(!target.schema_ready());
}

#[tokio::test]
async fn test_dry_run_uses_memory_target() {
    let dump = write_dump(knowledge_base());
    let config = MigrationConfig {
        source: SourceConfig::JsonFile(JsonFileConfig {
            path: dump.path().to_path_buf(),
        }),
        // Never contacted in a dry run.
        destination: DestinationConfig::Postgres(PostgresConfig {
            host: "db.invalid".into(),
            port: 5432,
            username: "diaform".into(),
            password: String::new(),
            database: "postgres".into(),
            max_connections: 1,
        }),
        options: MigrationOptions {
            dry_run: true,
            ..options()
        },
    };

    let mut pipeline = Pipeline::from_config(&config).await.unwrap();
    let report = pipeline.run().await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.state, "committed");
    assert_eq!(report.things.migrated, 6);
}

#[tokio::test]
async fn test_backfill_runs_after_commit() {
    // "qgljwgll" decodes to 2020-09-13; "a" is too small to be a timestamp.
    let dump = write_dump(json!({
        "things": [
            {"user": "ann", "name": "qgljwgll", "content": ""},
            {"user": "ann", "name": "a", "content": ""}
        ]
    }));
    let target = MemoryTarget::new();
    let (_, result) = migrate_with(
        &dump,
        &target,
        MigrationOptions {
            backfill_first_created: true,
            ..options()
        },
    )
    .await;
    let report = result.unwrap();

    let backfill = report.first_created.expect("backfill stats");
    assert_eq!(backfill.total, 2);
    assert_eq!(backfill.migrated, 1);

    let tables = target.snapshot();
    assert!(tables.things[&ThingKey::new("ann", "qgljwgll")].first_created.is_some());
    assert!(tables.things[&ThingKey::new("ann", "a")].first_created.is_none());
}

#[tokio::test]
async fn test_repeated_thing_document_does_not_reorder_children() {
    let dump = write_dump(json!({
        "users": [{"name": "ann", "hashedPassword": "h"}],
        "things": [
            {"user": "ann", "name": "p", "content": "", "connections": ["a", "b"]},
            {"user": "ann", "name": "x", "content": "", "connections": []},
            {"user": "ann", "name": "y", "content": "", "connections": []},
            {"user": "ann", "name": "p", "content": "older copy", "connections": ["b"]}
        ],
        "connections": [
            {"user": "ann", "name": "a", "parent": "p", "child": "x"},
            {"user": "ann", "name": "b", "parent": "p", "child": "y"}
        ]
    }));
    let target = MemoryTarget::new();

    let report = migrate(&dump, &target).await;
    assert_eq!(report.state, "committed");
    assert_eq!(report.count(WarningKind::DuplicateThing), 1);
    assert_eq!(report.indices.migrated, 2);
    assert_eq!(report.indices.skipped, 1);

    let tables = target.snapshot();
    assert_eq!(
        indices(&tables, "ann", "p"),
        vec![("a".into(), 0), ("b".into(), 1)]
    );
    assert_eq!(tables.things[&ThingKey::new("ann", "p")].content, "");
}

#[tokio::test]
async fn test_repeated_legacy_thing_synthesizes_children_once() {
    let dump = write_dump(json!({
        "users": [{"name": "ann", "hashedPassword": "h"}],
        "things": [
            {"user": "ann", "name": "p", "content": "", "children": ["x", "y"]},
            {"user": "ann", "name": "x", "content": ""},
            {"user": "ann", "name": "y", "content": ""},
            {"user": "ann", "name": "p", "content": "", "children": ["y"]}
        ]
    }));
    let target = MemoryTarget::new();

    let (_, result) = migrate_with(
        &dump,
        &target,
        MigrationOptions {
            legacy_children: true,
            ..options()
        },
    )
    .await;
    let report = result.unwrap();
    assert_eq!(report.connections.migrated, 2);
    assert_eq!(report.count(WarningKind::DuplicateThing), 1);

    let tables = target.snapshot();
    assert_eq!(
        indices(&tables, "ann", "p"),
        vec![("0".into(), 0), ("1".into(), 1)]
    );
}
