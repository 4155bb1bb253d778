//! Export and import between in-memory databases.

use std::path::Path;
use std::sync::Arc;

use guid_migrate::drivers::MemoryDatabase;
use guid_migrate::portable::PortableWriter;
use guid_migrate::{
    run_import, ExportOptions, Exporter, ImportOptions, ImportReport, Importer, Manifest,
    MigrateError, NoProgress, PortableRecord, Registry, SessionState, SqlValue,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn registry() -> Arc<Registry> {
    Arc::new(Registry::standard().unwrap())
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

fn add_workflow(db: &MemoryDatabase, identity: Option<Uuid>, name: &str) -> i64 {
    db.insert(
        "workflow",
        identity,
        [
            ("name", text(name)),
            ("workflow_type", SqlValue::I32(1)),
            ("load_balance_weight", SqlValue::I32(1)),
            ("enable_load_balancing", SqlValue::Bool(false)),
        ],
    )
}

fn add_action(db: &MemoryDatabase, identity: Option<Uuid>, name: &str, workflow: Option<i64>) -> i64 {
    db.insert(
        "action",
        identity,
        [
            ("name", text(name)),
            ("main_sequence", SqlValue::Bool(true)),
            ("workflow_id", workflow.into()),
        ],
    )
}

fn add_login(db: &MemoryDatabase, identity: Uuid, user_name: &str) -> i64 {
    db.insert(
        "login",
        Some(identity),
        [("user_name", text(user_name)), ("is_admin", SqlValue::Bool(false))],
    )
}

fn add_patient(db: &MemoryDatabase, identity: Uuid, mrn: &str, merged_into: Option<i64>) -> i64 {
    db.insert(
        "labde_patient",
        Some(identity),
        [
            ("mrn", text(mrn)),
            ("active", SqlValue::Bool(merged_into.is_none())),
            ("merged_into", merged_into.into()),
        ],
    )
}

async fn export(source: &MemoryDatabase, options: ExportOptions) {
    Exporter::new(Arc::new(source.clone()), registry(), options)
        .export(&NoProgress)
        .await
        .unwrap();
}

async fn import(dest: &MemoryDatabase, options: ImportOptions) -> Result<ImportReport, MigrateError> {
    run_import(
        Box::new(dest.begin()),
        registry(),
        options,
        CancellationToken::new(),
        false,
        &NoProgress,
    )
    .await
}

/// Write an export directory by hand, one file per table.
fn write_export(dir: &Path, tables: &[(&str, Vec<serde_json::Value>)]) {
    let mut manifest = Manifest::new(Uuid::new_v4(), true);
    for (table, records) in tables {
        let mut writer = PortableWriter::create(dir.join(format!("{}.jsonl", table))).unwrap();
        for record in records {
            let record: PortableRecord = serde_json::from_value(record.clone()).unwrap();
            writer.write(&record).unwrap();
        }
        manifest.add(table, &writer.finish().unwrap());
    }
    manifest.save(dir).unwrap();
}

#[tokio::test]
async fn test_foreign_keys_are_rewritten_to_destination_keys() {
    let dir = tempfile::tempdir().unwrap();
    let (wf, act, login) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let source = MemoryDatabase::with_keys(1, 1);
    let wf_key = add_workflow(&source, Some(wf), "Intake");
    add_action(&source, Some(act), "Verify", Some(wf_key));
    add_login(&source, login, "admin");
    export(&source, ExportOptions::new(dir.path())).await;

    // Destination already holds unrelated rows, so keys disagree.
    let dest = MemoryDatabase::with_keys(7000, 3);
    add_workflow(&dest, Some(Uuid::new_v4()), "Local");

    let report = import(&dest, ImportOptions::new(dir.path())).await.unwrap();
    assert!(report.committed);
    assert_eq!(report.summary.table("workflow").unwrap().inserted, 1);
    assert_eq!(report.summary.table("action").unwrap().inserted, 1);
    assert_eq!(report.summary.table("login").unwrap().inserted, 1);

    let dest_wf = dest.find("workflow", wf).unwrap();
    assert_ne!(dest_wf.key, wf_key);
    assert_eq!(dest_wf.get("name"), Some(&text("Intake")));

    let dest_act = dest.find("action", act).unwrap();
    assert_eq!(dest_act.reference("workflow_id"), Some(dest_wf.key));
    assert_eq!(dest.find("login", login).unwrap().get("user_name"), Some(&text("admin")));
}

#[tokio::test]
async fn test_reimport_only_updates() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryDatabase::new();
    let wf_key = add_workflow(&source, Some(Uuid::new_v4()), "Intake");
    add_action(&source, Some(Uuid::new_v4()), "Verify", Some(wf_key));
    add_action(&source, Some(Uuid::new_v4()), "Unassigned", None);
    export(&source, ExportOptions::new(dir.path())).await;

    let dest = MemoryDatabase::with_keys(100, 1);
    let first = import(&dest, ImportOptions::new(dir.path())).await.unwrap();
    let keys_after_first: Vec<i64> = dest.rows("action").iter().map(|r| r.key).collect();

    let second = import(&dest, ImportOptions::new(dir.path())).await.unwrap();

    assert_eq!(first.summary.inserted, 3);
    assert_eq!(first.summary.updated, 0);
    assert_eq!(second.summary.inserted, 0);
    assert_eq!(second.summary.updated, 3);
    assert_eq!(dest.count("workflow"), 1);
    assert_eq!(dest.count("action"), 2);
    let keys_after_second: Vec<i64> = dest.rows("action").iter().map(|r| r.key).collect();
    assert_eq!(keys_after_first, keys_after_second);
}

#[tokio::test]
async fn test_renamed_row_is_updated_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let wf = Uuid::new_v4();
    let source = MemoryDatabase::new();
    let wf_key = add_workflow(&source, Some(wf), "Intake");
    export(&source, ExportOptions::new(dir.path())).await;

    let dest = MemoryDatabase::with_keys(50, 1);
    import(&dest, ImportOptions::new(dir.path())).await.unwrap();
    let key = dest.find("workflow", wf).unwrap().key;

    source.set("workflow", wf_key, "name", text("Intake (renamed)"));
    export(&source, ExportOptions::new(dir.path())).await;
    let report = import(&dest, ImportOptions::new(dir.path())).await.unwrap();

    assert_eq!(report.summary.table("workflow").unwrap().updated, 1);
    let row = dest.find("workflow", wf).unwrap();
    assert_eq!(row.key, key);
    assert_eq!(row.get("name"), Some(&text("Intake (renamed)")));
    assert_eq!(dest.count("workflow"), 1);
}

#[tokio::test]
async fn test_reference_to_existing_destination_row() {
    // Workflow exists on both sides under the same identity, with different keys.
    let dir = tempfile::tempdir().unwrap();
    let (wf, act) = (Uuid::new_v4(), Uuid::new_v4());

    let source = MemoryDatabase::with_keys(10, 1);
    let wf_key = add_workflow(&source, Some(wf), "Shared");
    add_action(&source, Some(act), "Review", Some(wf_key));
    export(
        &source,
        ExportOptions {
            exclude_tables: vec!["workflow".into()],
            ..ExportOptions::new(dir.path())
        },
    )
    .await;

    let dest = MemoryDatabase::with_keys(900, 1);
    add_workflow(&dest, None, "Padding");
    let dest_wf_key = add_workflow(&dest, Some(wf), "Shared");

    let report = import(&dest, ImportOptions::new(dir.path())).await.unwrap();
    assert!(report.summary.table("workflow").is_none());
    assert!(report
        .summary
        .skipped
        .iter()
        .any(|s| s.table == "workflow" && s.reason == "not in export"));
    assert_eq!(
        dest.find("action", act).unwrap().reference("workflow_id"),
        Some(dest_wf_key)
    );
}

#[tokio::test]
async fn test_failure_rolls_back_earlier_tables() {
    let dir = tempfile::tempdir().unwrap();
    let (wf, act, missing) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    write_export(
        dir.path(),
        &[
            (
                "workflow",
                vec![json!({
                    "guid": wf.to_string(),
                    "name": "Intake",
                    "workflow_type": 1,
                    "load_balance_weight": 1,
                    "enable_load_balancing": false
                })],
            ),
            (
                "action",
                vec![json!({
                    "guid": act.to_string(),
                    "name": "Orphan",
                    "main_sequence": true,
                    "workflow_id": missing.to_string()
                })],
            ),
        ],
    );

    let dest = MemoryDatabase::new();
    let existing = add_workflow(&dest, Some(Uuid::new_v4()), "Existing");

    let err = import(&dest, ImportOptions::new(dir.path())).await.unwrap_err();
    match err.root() {
        MigrateError::UnresolvedReference {
            table, reference, ..
        } => {
            assert_eq!(table, "action");
            assert_eq!(*reference, missing);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.exit_code(), 4);

    // The workflow inserted before the failure is gone; the existing one stays.
    assert_eq!(dest.count("workflow"), 1);
    assert_eq!(dest.rows("workflow")[0].key, existing);
    assert_eq!(dest.count("action"), 0);
}

#[tokio::test]
async fn test_fixed_vocabulary_updates_but_never_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let version = Uuid::new_v4();

    let dest = MemoryDatabase::new();
    let key = dest.insert(
        "db_info",
        Some(version),
        [("name", text("SchemaVersion")), ("value", text("200"))],
    );

    write_export(
        dir.path(),
        &[(
            "db_info",
            vec![json!({"guid": version.to_string(), "name": "SchemaVersion", "value": "201"})],
        )],
    );
    let report = import(&dest, ImportOptions::new(dir.path())).await.unwrap();
    assert_eq!(report.summary.table("db_info").unwrap().updated, 1);
    assert_eq!(dest.find("db_info", version).unwrap().get("value"), Some(&text("201")));
    assert_eq!(dest.rows("db_info")[0].key, key);

    let other = tempfile::tempdir().unwrap();
    let unknown = Uuid::new_v4();
    write_export(
        other.path(),
        &[(
            "db_info",
            vec![
                json!({"guid": version.to_string(), "name": "SchemaVersion", "value": "202"}),
                json!({"guid": unknown.to_string(), "name": "NewSetting", "value": "1"}),
            ],
        )],
    );
    let err = import(&dest, ImportOptions::new(other.path())).await.unwrap_err();
    assert!(matches!(
        err.root(),
        MigrateError::NonInsertable { identity, .. } if *identity == unknown
    ));
    assert_eq!(dest.count("db_info"), 1);
    assert_eq!(dest.find("db_info", version).unwrap().get("value"), Some(&text("201")));
}

#[tokio::test]
async fn test_settings_export_is_opt_in() {
    let source = MemoryDatabase::new();
    source.insert(
        "db_info",
        Some(Uuid::new_v4()),
        [("name", text("SchemaVersion")), ("value", text("200"))],
    );
    add_workflow(&source, Some(Uuid::new_v4()), "Intake");

    // A fresh destination has its own settings rows under other identities.
    let dest = MemoryDatabase::new();
    dest.insert(
        "db_info",
        Some(Uuid::new_v4()),
        [("name", text("SchemaVersion")), ("value", text("199"))],
    );

    let dir = tempfile::tempdir().unwrap();
    export(&source, ExportOptions::new(dir.path())).await;
    let manifest = Manifest::load(dir.path()).unwrap();
    assert!(manifest.entry("db_info").is_none());
    assert!(!dir.path().join("db_info.jsonl").exists());

    let report = import(&dest, ImportOptions::new(dir.path())).await.unwrap();
    assert!(report.committed);
    assert_eq!(dest.count("workflow"), 1);
    assert_eq!(dest.rows("db_info")[0].get("value"), Some(&text("199")));
    assert!(report
        .summary
        .skipped
        .iter()
        .any(|s| s.table == "db_info" && s.reason == "not in export"));

    let with_settings = tempfile::tempdir().unwrap();
    export(
        &source,
        ExportOptions {
            include_fixed_vocabulary: true,
            ..ExportOptions::new(with_settings.path())
        },
    )
    .await;
    let manifest = Manifest::load(with_settings.path()).unwrap();
    assert_eq!(manifest.entry("db_info").unwrap().records, 1);

    let err = import(&dest, ImportOptions::new(with_settings.path())).await.unwrap_err();
    assert!(matches!(err.root(), MigrateError::NonInsertable { .. }));
    assert_eq!(dest.rows("db_info")[0].get("value"), Some(&text("199")));
}

#[tokio::test]
async fn test_self_references_are_written_after_all_rows_exist() {
    let dir = tempfile::tempdir().unwrap();
    let (survivor, duplicate) = (Uuid::new_v4(), Uuid::new_v4());

    // The merged-away patient comes first in key order.
    let source = MemoryDatabase::new();
    let dup_key = add_patient(&source, duplicate, "MRN-2", None);
    let survivor_key = add_patient(&source, survivor, "MRN-1", None);
    source.set("labde_patient", dup_key, "merged_into", SqlValue::I64(survivor_key));
    export(&source, ExportOptions::new(dir.path())).await;

    let dest = MemoryDatabase::with_keys(300, 5);
    let report = import(&dest, ImportOptions::new(dir.path())).await.unwrap();

    let stats = report.summary.table("labde_patient").unwrap();
    assert_eq!(stats.inserted, 2);
    assert_eq!(stats.self_references, 2);

    let dest_survivor = dest.find("labde_patient", survivor).unwrap();
    let dest_duplicate = dest.find("labde_patient", duplicate).unwrap();
    assert_eq!(dest_duplicate.reference("merged_into"), Some(dest_survivor.key));
    assert_eq!(dest_survivor.reference("merged_into"), None);
}

#[tokio::test]
async fn test_self_reference_to_row_only_in_destination() {
    let dir = tempfile::tempdir().unwrap();
    let (kept, incoming) = (Uuid::new_v4(), Uuid::new_v4());

    let dest = MemoryDatabase::with_keys(40, 1);
    let kept_key = add_patient(&dest, kept, "MRN-9", None);

    write_export(
        dir.path(),
        &[(
            "labde_patient",
            vec![json!({
                "guid": incoming.to_string(),
                "mrn": "MRN-10",
                "active": false,
                "merged_into": kept.to_string()
            })],
        )],
    );

    import(&dest, ImportOptions::new(dir.path())).await.unwrap();
    assert_eq!(
        dest.find("labde_patient", incoming).unwrap().reference("merged_into"),
        Some(kept_key)
    );
}

#[tokio::test]
async fn test_labde_can_be_left_out() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryDatabase::new();
    add_workflow(&source, Some(Uuid::new_v4()), "Intake");
    add_patient(&source, Uuid::new_v4(), "MRN-1", None);
    export(&source, ExportOptions::new(dir.path())).await;

    let dest = MemoryDatabase::new();
    let report = import(
        &dest,
        ImportOptions {
            include_labde: false,
            ..ImportOptions::new(dir.path())
        },
    )
    .await
    .unwrap();

    assert_eq!(dest.count("workflow"), 1);
    assert_eq!(dest.count("labde_patient"), 0);
    assert!(report
        .summary
        .skipped
        .iter()
        .any(|s| s.table == "labde_patient" && s.reason == "LabDE tables disabled"));
}

#[tokio::test]
async fn test_legacy_rows_keep_their_references() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryDatabase::new();
    let wf_key = add_workflow(&source, None, "Legacy");
    add_action(&source, None, "Legacy step", Some(wf_key));

    let summary = Exporter::new(Arc::new(source.clone()), registry(), ExportOptions::new(dir.path()))
        .export(&NoProgress)
        .await
        .unwrap();
    let legacy: u64 = summary.tables.iter().map(|t| t.legacy_rows).sum();
    assert_eq!(legacy, 2);

    let dest = MemoryDatabase::with_keys(20, 2);
    import(&dest, ImportOptions::new(dir.path())).await.unwrap();

    let dest_wf = &dest.rows("workflow")[0];
    let dest_action = &dest.rows("action")[0];
    assert!(dest_wf.identity.is_some());
    assert_eq!(dest_action.reference("workflow_id"), Some(dest_wf.key));
}

#[tokio::test]
async fn test_incomplete_export_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryDatabase::new();
    add_workflow(&source, Some(Uuid::new_v4()), "Intake");
    export(&source, ExportOptions::new(dir.path())).await;
    std::fs::remove_file(dir.path().join("manifest.json")).unwrap();

    let dest = MemoryDatabase::new();
    let err = import(&dest, ImportOptions::new(dir.path())).await.unwrap_err();
    assert!(matches!(err.root(), MigrateError::PortableFile { .. }));
    assert_eq!(dest.count("workflow"), 0);
}

#[tokio::test]
async fn test_tampered_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryDatabase::new();
    add_workflow(&source, Some(Uuid::new_v4()), "Intake");
    export(&source, ExportOptions::new(dir.path())).await;

    let path = dir.path().join("workflow.jsonl");
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("Intake", "Tampered")).unwrap();

    let dest = MemoryDatabase::new();
    let err = import(&dest, ImportOptions::new(dir.path())).await.unwrap_err();
    assert_eq!(err.exit_code(), 5);
    assert_eq!(dest.count("workflow"), 0);
}

#[tokio::test]
async fn test_cancelled_import_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryDatabase::new();
    add_workflow(&source, Some(Uuid::new_v4()), "Intake");
    export(&source, ExportOptions::new(dir.path())).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let dest = MemoryDatabase::new();
    let err = run_import(
        Box::new(dest.begin()),
        registry(),
        ImportOptions::new(dir.path()),
        cancel,
        false,
        &NoProgress,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, MigrateError::Cancelled));
    assert_eq!(dest.count("workflow"), 0);
}

#[tokio::test]
async fn test_importer_session_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let wf = Uuid::new_v4();
    let source = MemoryDatabase::new();
    add_workflow(&source, Some(wf), "Intake");
    export(&source, ExportOptions::new(dir.path())).await;

    let dest = MemoryDatabase::with_keys(61, 1);
    let mut importer =
        Importer::begin(Box::new(dest.begin()), registry(), ImportOptions::new(dir.path()));
    importer.import(&NoProgress).await.unwrap();

    assert_eq!(importer.state(), SessionState::Open);
    let workflows = importer.identity_maps().get("workflow").unwrap();
    assert_eq!(workflows.get(&wf), Some(61));

    // Nothing is durable until commit; dropping would roll back.
    importer.commit().await.unwrap();
    assert_eq!(dest.find("workflow", wf).unwrap().key, 61);
}

#[tokio::test]
async fn test_dropped_importer_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemoryDatabase::new();
    add_workflow(&source, Some(Uuid::new_v4()), "Intake");
    export(&source, ExportOptions::new(dir.path())).await;

    let dest = MemoryDatabase::new();
    {
        let mut importer =
            Importer::begin(Box::new(dest.begin()), registry(), ImportOptions::new(dir.path()));
        importer.import(&NoProgress).await.unwrap();
        assert_eq!(dest.count("workflow"), 1);
    }
    assert_eq!(dest.count("workflow"), 0);
}

#[tokio::test]
async fn test_duplicate_identity_in_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tag = Uuid::new_v4();
    write_export(
        dir.path(),
        &[(
            "tag",
            vec![
                json!({"guid": tag.to_string(), "name": "Urgent"}),
                json!({"guid": tag.to_string(), "name": "Urgent (copy)"}),
            ],
        )],
    );

    let dest = MemoryDatabase::new();
    let err = import(&dest, ImportOptions::new(dir.path())).await.unwrap_err();
    assert!(matches!(
        err.root(),
        MigrateError::DuplicateIdentity { table, identity } if table == "tag" && *identity == tag
    ));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(dest.count("tag"), 0);
}

#[tokio::test]
async fn test_manifest_with_unknown_table_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_export(
        dir.path(),
        &[
            ("tag", vec![json!({"guid": Uuid::new_v4().to_string(), "name": "Urgent"})]),
            ("retired_table", vec![json!({"guid": Uuid::new_v4().to_string()})]),
        ],
    );

    let dest = MemoryDatabase::new();
    let err = import(&dest, ImportOptions::new(dir.path())).await.unwrap_err();
    match err.root() {
        MigrateError::Config(message) => assert!(message.contains("retired_table")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.exit_code(), 1);
    assert_eq!(dest.count("tag"), 0);
}

#[tokio::test]
async fn test_manifest_with_wrong_file_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = PortableWriter::create(dir.path().join("tags.jsonl")).unwrap();
    let record: PortableRecord =
        serde_json::from_value(json!({"guid": Uuid::new_v4().to_string(), "name": "Urgent"}))
            .unwrap();
    writer.write(&record).unwrap();
    let mut manifest = Manifest::new(Uuid::new_v4(), true);
    manifest.add("tag", &writer.finish().unwrap());
    manifest.save(dir.path()).unwrap();

    let dest = MemoryDatabase::new();
    let err = import(&dest, ImportOptions::new(dir.path())).await.unwrap_err();
    match err.root() {
        MigrateError::Config(message) => assert!(message.contains("tags.jsonl")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(dest.count("tag"), 0);
}
