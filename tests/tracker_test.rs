//! Change tracking through the tool surface: baselines, significance
//! classes, history operations, and the snapshot round-trip law.

mod common;

use serde_json::json;
use webharvest::mcp::args::TrackChangesArgs;

const URL: &str = "https://tracked.example/page";
const BASELINE: &str = "<html><body><p>Hello world</p></body></html>";
const PUNCTUATION: &str = "<html><body><p>Hello world.</p></body></html>";
const REWRITE: &str =
    "<html><body><h1>Totally different</h1><p>New content</p></body></html>";

fn args(value: serde_json::Value) -> TrackChangesArgs {
    serde_json::from_value(value).expect("args")
}

#[tokio::test]
async fn baseline_then_compare_classifies_change_size() {
    let h = common::harness();

    let created = h
        .engine
        .track_changes(args(json!({
            "operation": "create_baseline",
            "url": URL,
            "content": BASELINE,
        })))
        .await
        .expect("baseline");
    let snapshot_id = created["snapshot"]["snapshot_id"]
        .as_str()
        .expect("snapshot id");
    assert_eq!(snapshot_id.len(), 26);

    // Identical content: none, similarity ~ 1.
    let same = h
        .engine
        .track_changes(args(json!({
            "operation": "compare",
            "url": URL,
            "content": BASELINE,
        })))
        .await
        .expect("self compare");
    assert_eq!(same["change"]["significance"], "none");
    assert!(same["change"]["similarity"].as_f64().expect("sim") >= 0.999);

    // Punctuation-only change: none or minor, similarity >= 0.9.
    let small = h
        .engine
        .track_changes(args(json!({
            "operation": "compare",
            "url": URL,
            "content": PUNCTUATION,
        })))
        .await
        .expect("small compare");
    let significance = small["change"]["significance"].as_str().expect("sig");
    assert!(matches!(significance, "none" | "minor"), "{significance}");
    assert!(small["change"]["similarity"].as_f64().expect("sim") >= 0.9);

    // Full rewrite: major or critical, similarity <= 0.5.
    let big = h
        .engine
        .track_changes(args(json!({
            "operation": "compare",
            "url": URL,
            "content": REWRITE,
        })))
        .await
        .expect("big compare");
    let significance = big["change"]["significance"].as_str().expect("sig");
    assert!(matches!(significance, "major" | "critical"), "{significance}");
    assert!(big["change"]["similarity"].as_f64().expect("sim") <= 0.5);
}

#[tokio::test]
async fn snapshot_round_trip_is_byte_equal() {
    let h = common::harness();
    h.engine
        .track_changes(args(json!({
            "operation": "create_baseline",
            "url": URL,
            "content": BASELINE,
        })))
        .await
        .expect("baseline");

    let store = h.engine.tracker().store();
    let record = store.latest(URL).expect("record");
    let bytes = store.read(&record.snapshot_id).expect("read");
    assert_eq!(bytes, BASELINE.as_bytes());
}

#[tokio::test]
async fn stats_history_and_reports_reflect_compares() {
    let h = common::harness();
    for op in [
        json!({"operation": "create_baseline", "url": URL, "content": BASELINE}),
        json!({"operation": "compare", "url": URL, "content": PUNCTUATION}),
        json!({"operation": "compare", "url": URL, "content": REWRITE}),
    ] {
        h.engine.track_changes(args(op)).await.expect("op");
    }

    let stats = h
        .engine
        .track_changes(args(json!({"operation": "get_stats", "url": URL})))
        .await
        .expect("stats");
    assert_eq!(stats["stats"]["snapshot_count"], 1);
    assert_eq!(stats["stats"]["changes_recorded"], 2);

    let exported = h
        .engine
        .track_changes(args(json!({
            "operation": "export_history",
            "url": URL,
            "format": "csv",
        })))
        .await
        .expect("export");
    let csv = exported["history"].as_str().expect("csv");
    assert_eq!(csv.lines().count(), 3, "header plus two records");

    let report = h
        .engine
        .track_changes(args(json!({
            "operation": "generate_trend_report",
            "url": URL,
        })))
        .await
        .expect("report");
    assert_eq!(report["report"]["changes"], 2);

    let dashboard = h
        .engine
        .track_changes(args(json!({"operation": "get_dashboard"})))
        .await
        .expect("dashboard");
    assert_eq!(
        dashboard["dashboard"]["tracked_urls"]
            .as_array()
            .expect("urls")
            .len(),
        1
    );
}

#[tokio::test]
async fn alert_rules_and_templates() {
    let h = common::harness();
    let rule = h
        .engine
        .track_changes(args(json!({
            "operation": "create_alert_rule",
            "url": URL,
            "webhook_url": "https://hooks.example/incoming",
            "min_significance": "moderate",
        })))
        .await
        .expect("rule");
    assert_eq!(rule["rule"]["min_significance"], "moderate");

    let templates = h
        .engine
        .track_changes(args(json!({"operation": "get_monitoring_templates"})))
        .await
        .expect("templates");
    assert!(
        templates["templates"]
            .as_array()
            .expect("list")
            .len()
            >= 3
    );
}

#[tokio::test]
async fn compare_without_baseline_is_a_clean_error() {
    let h = common::harness();
    let err = h
        .engine
        .track_changes(args(json!({
            "operation": "compare",
            "url": "https://never.tracked.example/",
            "content": BASELINE,
        })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "SnapshotNotFound");
}

#[tokio::test]
async fn unknown_operation_field_is_rejected_at_parse_time() {
    let result: Result<TrackChangesArgs, _> = serde_json::from_value(json!({
        "operation": "compare",
        "url": URL,
        "content": BASELINE,
        "bogus_field": 1,
    }));
    assert!(result.is_err());
}
