//! End-to-end reconciliation tests against the scripted backend.

use glidesync_client::{Client, Method, ScriptedBackend, ScriptedResponse, Status};
use glidesync_core::{ColumnSpec, ColumnType, InstanceConfig, Record, TableSpec, Value};
use glidesync_reconcile::{
    ActionKind, DeltaMergeOpts, DeltaOutcome, PrimaryKey, Reconciler, SyncCounts,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn sys_id(n: u8) -> String {
    format!("{n:032x}")
}

fn fixture() -> (Reconciler, Client, Arc<ScriptedBackend>) {
    let config = InstanceConfig::new("acme").with_credentials("admin", "secret");
    let (client, script) = Client::scripted(config).expect("client");
    (Reconciler::new(client.clone()), client, script)
}

/// Schema XML with a single throwaway element; every field the tests read
/// passes through the coercer as a string.
fn minimal_xml(table: &str) -> String {
    format!(r#"<{table}><element name="sys_id" internal_type="GUID" max_length="32"/></{table}>"#)
}

/// Wire a table up for reads: schema, stats count and row page.
fn mount_table(script: &ScriptedBackend, table: &str, xml: &str, rows: serde_json::Value) {
    let count = rows.as_array().map(|a| a.len()).unwrap_or(0);
    script.respond(Method::GET, &format!("/{table}.do"), ScriptedResponse::xml(200, xml));
    script.respond(
        Method::GET,
        &format!("/api/now/v1/stats/{table}"),
        ScriptedResponse::json(200, json!({"result": {"stats": {"count": count.to_string()}}})),
    );
    script.respond(
        Method::GET,
        &format!("/api/now/v2/table/{table}"),
        ScriptedResponse::json(200, json!({"result": rows})),
    );
}

fn mount_user(script: &ScriptedBackend) {
    script.respond(
        Method::GET,
        "/sys_user.do",
        ScriptedResponse::xml(200, minimal_xml("sys_user")),
    );
    script.respond(
        Method::GET,
        "/api/now/v1/table/sys_user",
        ScriptedResponse::json(200, json!({"result": [{"user_name": "admin"}]})),
    );
}

fn mount_write(script: &ScriptedBackend, method: Method, path: &str) {
    script.respond(method, path, ScriptedResponse::json(201, json!({"result": {}})));
}

fn writes(script: &ScriptedBackend) -> Vec<(Method, String)> {
    script
        .calls()
        .into_iter()
        .filter(|c| c.method != Method::GET)
        .map(|c| (c.method, c.url.path().to_string()))
        .collect()
}

#[derive(Default)]
struct RecordingStatus {
    warnings: Mutex<Vec<String>>,
}

impl Status for RecordingStatus {
    fn warn(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }
}

fn null_status() -> Arc<dyn Status> {
    Arc::new(glidesync_client::NullStatus)
}

fn record(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

const HOST_XML: &str = r#"<u_dm_host>
    <element name="u_name" internal_type="string" max_length="40"/>
    <element name="u_in_datamart" internal_type="boolean" max_length="40"/>
    <element name="sys_id" internal_type="GUID" max_length="32"/>
    <element name="sys_class_name" internal_type="sys_class_name" max_length="80"/>
</u_dm_host>"#;

const HOST_XML_NO_FLAG: &str = r#"<u_dm_host>
    <element name="u_name" internal_type="string" max_length="40"/>
    <element name="sys_id" internal_type="GUID" max_length="32"/>
    <element name="sys_class_name" internal_type="sys_class_name" max_length="80"/>
</u_dm_host>"#;

fn mount_host_hierarchy(script: &ScriptedBackend, dictionary_rows: serde_json::Value) {
    mount_user(script);
    mount_table(
        script,
        "sys_db_object",
        &minimal_xml("sys_db_object"),
        json!([{
            "name": "u_dm_host",
            "label": "Host",
            "sys_id": sys_id(9),
            "super_class": "",
            "is_extendable": "true"
        }]),
    );
    mount_table(script, "sys_dictionary", &minimal_xml("sys_dictionary"), dictionary_rows);
    mount_table(script, "sys_choice", &minimal_xml("sys_choice"), json!([]));
    mount_table(
        script,
        "sys_data_policy_rule",
        &minimal_xml("sys_data_policy_rule"),
        json!([]),
    );
    mount_table(
        script,
        "sys_documentation",
        &minimal_xml("sys_documentation"),
        json!([]),
    );
}

// A desired integer column over an existing string column is immutable:
// one error action, no writes, commit refused.
#[tokio::test]
async fn test_immutable_type_change_blocks_sync() {
    let (reconciler, _client, script) = fixture();
    mount_host_hierarchy(
        &script,
        json!([{
            "name": "u_dm_host",
            "element": "u_count",
            "internal_type": "string",
            "max_length": "40",
            "sys_created_by": "admin",
            "sys_id": sys_id(20),
            "sys_update_name": "sys_dictionary_u_dm_host_u_count"
        }]),
    );

    let spec = TableSpec::new("u_dm_host")
        .with_column("u_count", ColumnSpec::new(ColumnType::Integer));

    let plan = reconciler
        .tables
        .plan(&spec, null_status())
        .await
        .expect("plan");
    assert_eq!(plan.actions().len(), 1);
    assert_eq!(plan.actions()[0].kind, ActionKind::Error);
    assert!(plan.actions()[0].description.contains("string"));
    assert!(plan.actions()[0].description.contains("integer"));

    let error = reconciler
        .tables
        .sync(&spec, null_status())
        .await
        .expect_err("sync must refuse");
    assert!(error.to_string().contains("cannot change"));
    assert!(writes(&script).is_empty(), "no writes may be issued");
}

// A spec matching the remote exactly plans nothing: the second sync of the
// idempotence law.
#[tokio::test]
async fn test_matching_spec_plans_nothing() {
    let (reconciler, _client, script) = fixture();
    mount_host_hierarchy(
        &script,
        json!([{
            "name": "u_dm_host",
            "element": "u_count",
            "internal_type": "integer",
            "max_length": "40",
            "sys_created_by": "admin",
            "sys_id": sys_id(20),
            "sys_update_name": "sys_dictionary_u_dm_host_u_count"
        }]),
    );

    let spec = TableSpec::new("u_dm_host")
        .with_column("u_count", ColumnSpec::new(ColumnType::Integer));

    let plan = reconciler
        .tables
        .plan(&spec, null_status())
        .await
        .expect("plan");
    assert!(plan.is_empty(), "unexpected actions: {:?}", plan.actions());
}

// Inherited and out-of-the-box columns cannot be updated.
#[tokio::test]
async fn test_ownership_blocks_updates() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);
    // u_dm_host extends cmdb_ci; the dictionary query returns each level's
    // rows in walk order.
    mount_table(
        &script,
        "sys_db_object",
        &minimal_xml("sys_db_object"),
        json!([]),
    );
    script.enqueue(
        Method::GET,
        "/api/now/v1/stats/sys_db_object",
        ScriptedResponse::json(200, json!({"result": {"stats": {"count": "1"}}})),
    );
    script.enqueue(
        Method::GET,
        "/api/now/v2/table/sys_db_object",
        ScriptedResponse::json(200, json!({"result": [{
            "name": "u_dm_host",
            "label": "Host",
            "sys_id": sys_id(9),
            "super_class": sys_id(8),
            "is_extendable": "true"
        }]})),
    );
    script.enqueue(
        Method::GET,
        "/api/now/v1/stats/sys_db_object",
        ScriptedResponse::json(200, json!({"result": {"stats": {"count": "1"}}})),
    );
    script.enqueue(
        Method::GET,
        "/api/now/v2/table/sys_db_object",
        ScriptedResponse::json(200, json!({"result": [{
            "name": "cmdb_ci",
            "label": "Configuration Item",
            "sys_id": sys_id(8),
            "super_class": "",
            "is_extendable": "true"
        }]})),
    );
    // Level fetches: u_dm_host defines nothing; cmdb_ci defines u_shared.
    script.respond(
        Method::GET,
        "/sys_dictionary.do",
        ScriptedResponse::xml(200, minimal_xml("sys_dictionary")),
    );
    script.enqueue(
        Method::GET,
        "/api/now/v1/stats/sys_dictionary",
        ScriptedResponse::json(200, json!({"result": {"stats": {"count": "0"}}})),
    );
    script.respond(
        Method::GET,
        "/api/now/v1/stats/sys_dictionary",
        ScriptedResponse::json(200, json!({"result": {"stats": {"count": "1"}}})),
    );
    script.respond(
        Method::GET,
        "/api/now/v2/table/sys_dictionary",
        ScriptedResponse::json(200, json!({"result": [{
            "name": "cmdb_ci",
            "element": "u_shared",
            "internal_type": "string",
            "max_length": "40",
            "sys_created_by": "admin",
            "sys_id": sys_id(21),
            "sys_update_name": ""
        }]})),
    );
    mount_table(&script, "sys_choice", &minimal_xml("sys_choice"), json!([]));
    mount_table(
        &script,
        "sys_data_policy_rule",
        &minimal_xml("sys_data_policy_rule"),
        json!([]),
    );
    mount_table(
        &script,
        "sys_documentation",
        &minimal_xml("sys_documentation"),
        json!([]),
    );

    let spec = TableSpec::new("u_dm_host").with_column(
        "u_shared",
        ColumnSpec::new(ColumnType::String).with_max_length(80),
    );

    let plan = reconciler
        .tables
        .plan(&spec, null_status())
        .await
        .expect("plan");
    assert_eq!(plan.actions().len(), 1);
    assert_eq!(plan.actions()[0].kind, ActionKind::Error);
    assert!(
        plan.actions()[0].description.contains("inherited from cmdb_ci"),
        "got: {}",
        plan.actions()[0].description
    );
}

// Creating a missing table commits the table record, settles, re-plans
// against the materialized table and commits the columns.
#[tokio::test(start_paused = true)]
async fn test_sync_creates_missing_table() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);

    script.respond(
        Method::GET,
        "/sys_db_object.do",
        ScriptedResponse::xml(200, minimal_xml("sys_db_object")),
    );
    // First resolve sees nothing; after creation the table exists.
    script.enqueue(
        Method::GET,
        "/api/now/v1/stats/sys_db_object",
        ScriptedResponse::json(200, json!({"result": {"stats": {"count": "0"}}})),
    );
    script.respond(
        Method::GET,
        "/api/now/v1/stats/sys_db_object",
        ScriptedResponse::json(200, json!({"result": {"stats": {"count": "1"}}})),
    );
    script.respond(
        Method::GET,
        "/api/now/v2/table/sys_db_object",
        ScriptedResponse::json(200, json!({"result": [{
            "name": "u_dm_host",
            "label": "Host",
            "sys_id": sys_id(9),
            "super_class": "",
            "is_extendable": "true"
        }]})),
    );
    mount_table(&script, "sys_dictionary", &minimal_xml("sys_dictionary"), json!([]));
    mount_table(&script, "sys_choice", &minimal_xml("sys_choice"), json!([]));
    mount_table(
        &script,
        "sys_data_policy_rule",
        &minimal_xml("sys_data_policy_rule"),
        json!([]),
    );
    mount_table(
        &script,
        "sys_documentation",
        &minimal_xml("sys_documentation"),
        json!([]),
    );
    mount_write(&script, Method::POST, "/api/now/v2/table/sys_db_object");
    mount_write(&script, Method::POST, "/api/now/v2/table/sys_dictionary");

    let spec = TableSpec::new("u_dm_host")
        .with_label("Host")
        .with_column("u_name", ColumnSpec::new(ColumnType::String).with_max_length(40));

    let counts = reconciler
        .tables
        .sync(&spec, null_status())
        .await
        .expect("sync");
    assert_eq!(
        counts,
        SyncCounts {
            created: 2,
            updated: 0,
            deleted: 0
        }
    );

    let writes = writes(&script);
    assert_eq!(
        writes,
        vec![
            (Method::POST, "/api/now/v2/table/sys_db_object".to_string()),
            (Method::POST, "/api/now/v2/table/sys_dictionary".to_string()),
        ]
    );

    let calls = script.calls();
    let body = calls
        .iter()
        .find(|c| c.method == Method::POST && c.url.path() == "/api/now/v2/table/sys_db_object")
        .and_then(|c| c.body.clone())
        .expect("table create body");
    assert_eq!(body["name"], "u_dm_host");
    assert_eq!(body["is_extendable"], "true");
}

// New columns must carry the u_ prefix.
#[tokio::test]
async fn test_new_column_requires_user_prefix() {
    let (reconciler, _client, script) = fixture();
    mount_host_hierarchy(&script, json!([]));

    let spec = TableSpec::new("u_dm_host")
        .with_column("hostname", ColumnSpec::new(ColumnType::String));

    let plan = reconciler
        .tables
        .plan(&spec, null_status())
        .await
        .expect("plan");
    assert_eq!(plan.actions()[0].kind, ActionKind::Error);
    assert!(plan.actions()[0].description.contains("u_ prefix"));
}

// Soft delete: the missing row gets its flag cleared, the matched row is
// untouched, and the policy toggles off then on exactly once.
#[tokio::test]
async fn test_delta_merge_soft_delete() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);
    mount_table(
        &script,
        "u_dm_host",
        HOST_XML,
        json!([
            {
                "sys_id": sys_id(1),
                "sys_class_name": "u_dm_host",
                "u_name": "n1",
                "u_in_datamart": "true"
            },
            {
                "sys_id": sys_id(2),
                "sys_class_name": "u_dm_host",
                "u_name": "n2",
                "u_in_datamart": "true"
            }
        ]),
    );
    mount_table(
        &script,
        "sys_data_policy2",
        &minimal_xml("sys_data_policy2"),
        json!([{
            "sys_id": sys_id(30),
            "model_table": "u_dm_host",
            "active": "true"
        }]),
    );
    let policy_path = format!("/api/now/v2/table/sys_data_policy2/{}", sys_id(30));
    script.respond(
        Method::PUT,
        &policy_path,
        ScriptedResponse::json(200, json!({"result": {}})),
    );
    let soft_delete_path = format!("/api/now/v2/table/u_dm_host/{}", sys_id(2));
    script.respond(
        Method::PUT,
        &soft_delete_path,
        ScriptedResponse::json(200, json!({"result": {}})),
    );

    let incoming = vec![record(&[("u_name", "n1")])];
    let opts = DeltaMergeOpts {
        primary_key: PrimaryKey::Field("u_name".into()),
        ..DeltaMergeOpts::default()
    };
    let outcome = reconciler
        .delta
        .run("u_dm_host", incoming, opts, null_status())
        .await
        .expect("merge");

    assert_eq!(
        outcome,
        DeltaOutcome {
            rows_matched: 1,
            rows_created: 0,
            rows_updated: 0,
            rows_deleted: 1
        }
    );

    // The a2 row was soft-deleted, not removed.
    assert_eq!(script.call_count(&soft_delete_path), 1);
    let soft_body = script
        .calls()
        .into_iter()
        .find(|c| c.url.path() == soft_delete_path)
        .and_then(|c| c.body)
        .expect("soft delete body");
    assert_eq!(soft_body["u_in_datamart"], "0");
    assert_eq!(soft_body["sys_class_name"], "u_dm_host");

    // Toggled off before the write and back on after: exactly two flips.
    let toggles: Vec<serde_json::Value> = script
        .calls()
        .into_iter()
        .filter(|c| c.url.path() == policy_path)
        .filter_map(|c| c.body)
        .collect();
    assert_eq!(toggles.len(), 2);
    assert_eq!(toggles[0]["active"], "false");
    assert_eq!(toggles[1]["active"], "true");
}

// Hard delete: without the flag column and with deletes allowed, the
// stale row is deleted outright.
#[tokio::test]
async fn test_delta_merge_hard_delete() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);
    mount_table(
        &script,
        "u_dm_host",
        HOST_XML_NO_FLAG,
        json!([
            {"sys_id": sys_id(1), "sys_class_name": "u_dm_host", "u_name": "n1"},
            {"sys_id": sys_id(2), "sys_class_name": "u_dm_host", "u_name": "n2"}
        ]),
    );
    mount_table(
        &script,
        "sys_data_policy2",
        &minimal_xml("sys_data_policy2"),
        json!([{"sys_id": sys_id(30), "model_table": "u_dm_host", "active": "true"}]),
    );
    let policy_path = format!("/api/now/v2/table/sys_data_policy2/{}", sys_id(30));
    script.respond(
        Method::PUT,
        &policy_path,
        ScriptedResponse::json(200, json!({"result": {}})),
    );
    let delete_path = format!("/api/now/v2/table/u_dm_host/{}", sys_id(2));
    script.respond(Method::DELETE, &delete_path, ScriptedResponse::status(204));

    let incoming = vec![record(&[("u_name", "n1")])];
    let opts = DeltaMergeOpts {
        primary_key: PrimaryKey::Field("u_name".into()),
        allow_deletes: true,
        ..DeltaMergeOpts::default()
    };
    let outcome = reconciler
        .delta
        .run("u_dm_host", incoming, opts, null_status())
        .await
        .expect("merge");

    assert_eq!(outcome.rows_matched, 1);
    assert_eq!(outcome.rows_deleted, 1);
    assert_eq!(script.call_count(&delete_path), 1);
    assert_eq!(script.call_count(&policy_path), 2);
}

// Identical inputs the second time around change nothing and skip the
// policy toggle entirely.
#[tokio::test]
async fn test_delta_merge_idempotent_run_skips_toggle() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);
    mount_table(
        &script,
        "u_dm_host",
        HOST_XML,
        json!([{
            "sys_id": sys_id(1),
            "sys_class_name": "u_dm_host",
            "u_name": "n1",
            "u_in_datamart": "true"
        }]),
    );

    let incoming = vec![record(&[("u_name", "n1")])];
    let opts = DeltaMergeOpts {
        primary_key: PrimaryKey::Field("u_name".into()),
        ..DeltaMergeOpts::default()
    };
    let outcome = reconciler
        .delta
        .run("u_dm_host", incoming, opts, null_status())
        .await
        .expect("merge");

    assert_eq!(
        outcome,
        DeltaOutcome {
            rows_matched: 1,
            rows_created: 0,
            rows_updated: 0,
            rows_deleted: 0
        }
    );
    assert!(writes(&script).is_empty());
}

// An incoming row without a resolvable primary key cannot be compared,
// but it is still created, not dropped.
#[tokio::test]
async fn test_delta_merge_retains_unkeyed_rows_as_creates() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);
    mount_table(&script, "u_dm_host", HOST_XML, json!([]));
    mount_table(
        &script,
        "sys_data_policy2",
        &minimal_xml("sys_data_policy2"),
        json!([]),
    );
    mount_write(&script, Method::POST, "/api/now/v2/table/u_dm_host");

    // The second row has an empty key field, so it never indexes.
    let incoming = vec![
        record(&[("u_name", "n1")]),
        record(&[("u_name", "")]),
    ];
    let status = Arc::new(RecordingStatus::default());
    let opts = DeltaMergeOpts {
        primary_key: PrimaryKey::Field("u_name".into()),
        ..DeltaMergeOpts::default()
    };
    let outcome = reconciler
        .delta
        .run("u_dm_host", incoming, opts, status.clone())
        .await
        .expect("merge");

    assert_eq!(outcome.rows_created, 2);
    assert_eq!(outcome.rows_matched, 0);
    assert_eq!(script.call_count("/api/now/v2/table/u_dm_host"), 2);

    let warnings = status.warnings.lock();
    assert!(
        warnings.iter().any(|w| w.contains("no primary key")),
        "missing unkeyed warning, got {warnings:?}"
    );
}

// Reference lookup: business keys are rewritten to sys_ids before
// planning; misses blank the value and warn.
#[tokio::test]
async fn test_delta_merge_reference_lookup() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);
    mount_table(
        &script,
        "u_dm_app",
        r#"<u_dm_app>
            <element name="u_name" internal_type="string" max_length="40"/>
            <element name="u_owner" internal_type="reference" max_length="32" reference="u_dm_user"/>
            <element name="sys_id" internal_type="GUID" max_length="32"/>
            <element name="sys_class_name" internal_type="sys_class_name" max_length="80"/>
        </u_dm_app>"#,
        json!([]),
    );
    mount_table(
        &script,
        "u_dm_user",
        r#"<u_dm_user>
            <element name="u_name" internal_type="string" max_length="40"/>
            <element name="sys_id" internal_type="GUID" max_length="32"/>
        </u_dm_user>"#,
        json!([{"sys_id": sys_id(40), "u_name": "alice"}]),
    );
    mount_table(
        &script,
        "sys_data_policy2",
        &minimal_xml("sys_data_policy2"),
        json!([]),
    );
    mount_write(&script, Method::POST, "/api/now/v2/table/u_dm_app");

    let incoming = vec![
        record(&[("u_name", "billing"), ("u_owner", "alice")]),
        record(&[("u_name", "payroll"), ("u_owner", "nobody")]),
    ];
    let status = Arc::new(RecordingStatus::default());
    let opts = DeltaMergeOpts {
        primary_key: PrimaryKey::Field("u_name".into()),
        reference_lookup: [("u_owner".to_string(), "u_name".to_string())]
            .into_iter()
            .collect(),
        ..DeltaMergeOpts::default()
    };
    let outcome = reconciler
        .delta
        .run("u_dm_app", incoming, opts, status.clone())
        .await
        .expect("merge");

    assert_eq!(outcome.rows_created, 2);
    let bodies: BTreeMap<String, serde_json::Value> = script
        .calls()
        .into_iter()
        .filter(|c| c.method == Method::POST && c.url.path() == "/api/now/v2/table/u_dm_app")
        .filter_map(|c| c.body)
        .map(|b| (b["u_name"].as_str().unwrap_or_default().to_string(), b))
        .collect();
    assert_eq!(bodies["billing"]["u_owner"], sys_id(40).as_str());
    assert_eq!(bodies["payroll"]["u_owner"], "");

    let warnings = status.warnings.lock();
    assert!(
        warnings.iter().any(|w| w.contains("nobody")),
        "missing lookup warning, got {warnings:?}"
    );
}

// Choice lists diff by value: unchanged rows are left alone, new values
// inserted, undeclared values removed.
#[tokio::test]
async fn test_choice_sync() {
    let (reconciler, _client, script) = fixture();
    mount_table(
        &script,
        "sys_choice",
        &minimal_xml("sys_choice"),
        json!([
            {
                "sys_id": sys_id(50),
                "name": "u_dm_host",
                "element": "u_state",
                "value": "1",
                "label": "Up",
                "inactive": "false"
            },
            {
                "sys_id": sys_id(51),
                "name": "u_dm_host",
                "element": "u_state",
                "value": "3",
                "label": "Legacy",
                "inactive": "false"
            }
        ]),
    );
    mount_write(&script, Method::POST, "/api/now/v2/table/sys_choice");
    script.respond(
        Method::DELETE,
        &format!("/api/now/v2/table/sys_choice/{}", sys_id(51)),
        ScriptedResponse::status(204),
    );

    let desired: BTreeMap<String, String> = [("1", "Up"), ("2", "Down")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    reconciler
        .choices
        .sync("u_dm_host", "u_state", &desired, &glidesync_client::NullStatus)
        .await
        .expect("sync");

    let writes = writes(&script);
    assert_eq!(
        writes,
        vec![
            (Method::POST, "/api/now/v2/table/sys_choice".to_string()),
            (
                Method::DELETE,
                format!("/api/now/v2/table/sys_choice/{}", sys_id(51)),
            ),
        ]
    );
    let created = script
        .calls()
        .into_iter()
        .find(|c| c.method == Method::POST)
        .and_then(|c| c.body)
        .expect("create body");
    assert_eq!(created["value"], "2");
    assert_eq!(created["label"], "Down");
    assert_eq!(created["inactive"], "false");
}

// The managed policy record is created with its canonical condition.
#[tokio::test]
async fn test_policy_created_with_canonical_fields() {
    let (reconciler, _client, script) = fixture();
    mount_user(&script);
    mount_table(
        &script,
        "sys_data_policy2",
        &minimal_xml("sys_data_policy2"),
        json!([]),
    );
    script.respond(
        Method::POST,
        "/api/now/v2/table/sys_data_policy2",
        ScriptedResponse::json(201, json!({"result": {"sys_id": sys_id(30)}})),
    );

    let policy_id = reconciler
        .policies
        .ensure_policy("u_dm_host")
        .await
        .expect("ensure");
    assert_eq!(policy_id, sys_id(30));

    let body = script
        .calls()
        .into_iter()
        .find(|c| c.method == Method::POST)
        .and_then(|c| c.body)
        .expect("policy body");
    assert_eq!(body["model_table"], "u_dm_host");
    assert_eq!(body["conditions"], "sys_created_by=admin^EQ");
    assert_eq!(body["apply_import_set"], "true");
    assert_eq!(body["apply_soap"], "false");
    assert_eq!(body["enforce_ui"], "true");
    assert_eq!(body["inherit"], "false");
}

// Relationships diff by parent|child under the named type; empty values
// disconnect instead of creating.
#[tokio::test]
async fn test_relationship_sync() {
    let (reconciler, _client, script) = fixture();
    mount_table(
        &script,
        "cmdb_rel_type",
        &minimal_xml("cmdb_rel_type"),
        json!([{"sys_id": sys_id(60), "parent_descriptor": "Runs on", "child_descriptor": "Runs"}]),
    );
    mount_table(
        &script,
        "cmdb_rel_ci",
        &minimal_xml("cmdb_rel_ci"),
        json!([
            // Kept: declared by row 1.
            {"sys_id": sys_id(70), "type": sys_id(60), "parent": sys_id(1), "child": sys_id(10)},
            // Dropped: row 2 now points elsewhere.
            {"sys_id": sys_id(71), "type": sys_id(60), "parent": sys_id(2), "child": sys_id(11)},
            // Ignored: parent outside the row set.
            {"sys_id": sys_id(72), "type": sys_id(60), "parent": sys_id(5), "child": sys_id(12)}
        ]),
    );
    mount_write(&script, Method::POST, "/api/now/v2/table/cmdb_rel_ci");
    script.respond(
        Method::DELETE,
        &format!("/api/now/v2/table/cmdb_rel_ci/{}", sys_id(71)),
        ScriptedResponse::status(204),
    );

    let rows = vec![
        record(&[("sys_id", &sys_id(1)), ("u_ran_on", &sys_id(10))]),
        record(&[("sys_id", &sys_id(2)), ("u_ran_on", &sys_id(13))]),
        record(&[("sys_id", &sys_id(3)), ("u_ran_on", "")]),
    ];
    let mapping: BTreeMap<String, String> =
        [("u_ran_on".to_string(), "Runs on::Runs".to_string())]
            .into_iter()
            .collect();

    let outcome = reconciler
        .relationships
        .sync("u_dm_app", &mapping, &rows, &glidesync_client::NullStatus)
        .await
        .expect("sync");

    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.deleted, 1);

    let created = script
        .calls()
        .into_iter()
        .find(|c| c.method == Method::POST)
        .and_then(|c| c.body)
        .expect("edge body");
    assert_eq!(created["type"], sys_id(60).as_str());
    assert_eq!(created["parent"], sys_id(2).as_str());
    assert_eq!(created["child"], sys_id(13).as_str());
}

// Two columns mapping the same relationship type is a plan error.
#[tokio::test]
async fn test_duplicate_relationship_type_rejected() {
    let (reconciler, _client, script) = fixture();
    mount_table(
        &script,
        "cmdb_rel_type",
        &minimal_xml("cmdb_rel_type"),
        json!([{"sys_id": sys_id(60)}]),
    );
    mount_table(&script, "cmdb_rel_ci", &minimal_xml("cmdb_rel_ci"), json!([]));

    let mapping: BTreeMap<String, String> = [
        ("u_a".to_string(), "Runs on::Runs".to_string()),
        ("u_b".to_string(), "Runs on::Runs".to_string()),
    ]
    .into_iter()
    .collect();

    let error = reconciler
        .relationships
        .sync("u_dm_app", &mapping, &[], &glidesync_client::NullStatus)
        .await
        .expect_err("duplicate type");
    assert!(error.to_string().contains("more than one column"));
}

// A missing relationship type is operational, with the manual remedy.
#[tokio::test]
async fn test_missing_relationship_type() {
    let (reconciler, _client, script) = fixture();
    mount_table(&script, "cmdb_rel_type", &minimal_xml("cmdb_rel_type"), json!([]));

    let mapping: BTreeMap<String, String> =
        [("u_ran_on".to_string(), "Runs on::Runs".to_string())]
            .into_iter()
            .collect();
    let error = reconciler
        .relationships
        .sync("u_dm_app", &mapping, &[], &glidesync_client::NullStatus)
        .await
        .expect_err("missing type");
    assert!(error.to_string().contains("create it manually"));
}
