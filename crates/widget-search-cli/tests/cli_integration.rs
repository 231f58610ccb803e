use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_wsearch<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_wsearch"))
        .arg("--db")
        .arg(db)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute wsearch binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_wsearch(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "wsearch command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn widget_names(payload: &Value) -> Vec<String> {
    payload
        .get("widgets")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing widgets array in payload: {payload}"))
        .iter()
        .map(|widget| {
            widget
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_else(|| panic!("widget without a name: {widget}"))
                .to_string()
        })
        .collect()
}

fn seeded_db(prefix: &str) -> (PathBuf, PathBuf) {
    let dir = unique_temp_dir(prefix);
    let db = dir.join("widgets.sqlite3");
    let seeded = run_json(&db, ["db", "seed"]);
    assert_eq!(seeded.get("inserted").and_then(Value::as_u64), Some(5));
    (dir, db)
}

#[test]
fn db_commands_report_versions_with_contract_version() {
    let dir = unique_temp_dir("wsearch-db");
    let db = dir.join("widgets.sqlite3");

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(status.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(status.get("current_version").and_then(Value::as_i64), Some(0));

    let dry_run = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(dry_run.get("dry_run").and_then(Value::as_bool), Some(true));

    let applied = run_json(&db, ["db", "migrate"]);
    assert_eq!(applied.get("after_version").and_then(Value::as_i64), Some(1));
    assert_eq!(applied.get("up_to_date").and_then(Value::as_bool), Some(true));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn seed_is_skipped_once_widgets_exist() {
    let (dir, db) = seeded_db("wsearch-seed");

    let again = run_json(&db, ["db", "seed"]);
    assert_eq!(again.get("inserted").and_then(Value::as_u64), Some(0));
    assert_eq!(again.get("skipped_existing_catalogue").and_then(Value::as_bool), Some(true));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn added_widgets_are_listed_and_searchable() {
    let dir = unique_temp_dir("wsearch-add");
    let db = dir.join("widgets.sqlite3");

    let added = run_json(
        &db,
        ["widget", "add", "--name", "Copper Widget", "--price", "3.5", "--disabled"],
    );
    assert_eq!(
        added.pointer("/widget/enabled").and_then(Value::as_bool),
        Some(false),
        "payload: {added}"
    );

    let listed = run_json(&db, ["widget", "list"]);
    assert_eq!(widget_names(&listed), vec!["Copper Widget"]);

    let found = run_json(&db, ["query", "search", "--term", "Copper"]);
    assert_eq!(found.get("count").and_then(Value::as_u64), Some(1));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn query_filter_applies_the_selected_policy() {
    let (dir, db) = seeded_db("wsearch-filter");

    let benign = run_json(
        &db,
        ["query", "filter", "--policy", "safest", "--term", "Widget", "--filter", "price gt 0"],
    );
    assert_eq!(widget_names(&benign), vec!["Blue Widget", "Red Widget", "Widget Deluxe"]);

    let escape = "true)] != null ? #this : #this.?[(true";
    let escaped = run_json(
        &db,
        ["query", "filter", "--policy", "safer", "--term", "Widget", "--filter", escape],
    );
    assert!(widget_names(&escaped).contains(&"Green Widget".to_string()));

    let blocked = run_wsearch(
        &db,
        ["query", "filter", "--policy", "safest", "--term", "Widget", "--filter", escape],
    );
    assert!(!blocked.status.success());
    assert!(blocked.stdout.is_empty());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn query_filter_refuses_type_references_outside_unsafe_policy() {
    let (dir, db) = seeded_db("wsearch-runtime");
    let runtime = "price gt 0 and T(Math).abs(-1) == 1";

    let refused = run_wsearch(
        &db,
        ["query", "filter", "--policy", "safer", "--term", "Widget", "--filter", runtime],
    );
    assert!(!refused.status.success());

    let evaluated = run_json(
        &db,
        ["query", "filter", "--policy", "unsafe", "--term", "Widget", "--filter", runtime],
    );
    assert_eq!(evaluated.get("count").and_then(Value::as_u64), Some(3));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn query_price_range_validates_bounds() {
    let (dir, db) = seeded_db("wsearch-range");

    let ranged = run_json(
        &db,
        ["query", "price-range", "--term", "Widget", "--min-price", "5", "--max-price", "20"],
    );
    assert_eq!(widget_names(&ranged), vec!["Blue Widget", "Red Widget"]);

    let injected = run_wsearch(
        &db,
        [
            "query",
            "price-range",
            "--term",
            "Widget",
            "--min-price",
            "0 or true",
            "--max-price",
            "20",
        ],
    );
    assert!(!injected.status.success());

    let inverted = run_json(
        &db,
        ["query", "price-range", "--term", "Widget", "--min-price", "20", "--max-price", "5"],
    );
    assert_eq!(inverted.get("count").and_then(Value::as_u64), Some(0));

    let _ = fs::remove_dir_all(&dir);
}
