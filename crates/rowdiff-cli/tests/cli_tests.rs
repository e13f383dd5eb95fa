//! CLI integration tests for rowdiff.
//!
//! These tests verify argument parsing, help output, exit codes, and a
//! full diff run against an embedded DuckDB file database.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the rowdiff binary.
fn cmd() -> Command {
    Command::cargo_bin("rowdiff").unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_options() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--key-columns"))
        .stdout(predicate::str::contains("--update-column"))
        .stdout(predicate::str::contains("--bisection-factor"))
        .stdout(predicate::str::contains("--bisection-threshold"))
        .stdout(predicate::str::contains("--algorithm"))
        .stdout(predicate::str::contains("--materialize"))
        .stdout(predicate::str::contains("--assume-unique-key"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rowdiff"));
}

// =============================================================================
// Usage Error Tests
// =============================================================================

#[test]
fn test_wrong_target_count_is_usage_error() {
    cmd()
        .args(["postgresql://h/db", "only_one_table"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DB1 TABLE1 DB2 TABLE2"));
}

#[test]
fn test_unknown_driver_is_usage_error() {
    cmd()
        .args(["oracle://h/db", "t1", "t2"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown database driver"));
}

#[test]
fn test_min_age_requires_update_column() {
    cmd()
        .args(["duckdb://:memory:", "t1", "t2", "--min-age", "5min"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("update column"));
}

#[test]
fn test_bad_duration_is_usage_error() {
    cmd()
        .args([
            "duckdb://:memory:",
            "t1",
            "t2",
            "-t",
            "ts",
            "--min-age",
            "5parsecs",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("duration"));
}

#[test]
fn test_missing_run_in_config() {
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("rowdiff.toml");
    std::fs::write(&conf, "[database.x]\ndriver = \"postgresql\"\n").unwrap();
    cmd()
        .args(["--conf", conf.to_str().unwrap(), "--run", "nightly"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("run 'nightly' not found"));
}

// =============================================================================
// End-to-end diff against an embedded database
// =============================================================================

fn seeded_database(path: &std::path::Path) {
    let conn = duckdb::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE t1 (id BIGINT, name VARCHAR, score DOUBLE);
         INSERT INTO t1 SELECT i, 'name-' || i, i / 2.0 FROM range(1, 101) r(i);
         CREATE TABLE t2 AS SELECT * FROM t1;
         DELETE FROM t2 WHERE id = 50;
         UPDATE t2 SET score = 0.5 WHERE id = 7;",
    )
    .unwrap();
}

#[test]
fn test_intra_database_diff_text_output() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");
    seeded_database(&db_path);
    let uri = format!("duckdb://{}", db_path.display());

    cmd()
        .args([&uri, "t1", "t2", "-k", "id", "-c", "name", "-c", "score"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-\t50\tname-50\t25"))
        .stdout(predicate::str::contains("-\t7\tname-7\t3.5"))
        .stdout(predicate::str::contains("+\t7\tname-7\t0.5"));
}

#[test]
fn test_json_output_is_ndjson() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");
    seeded_database(&db_path);
    let uri = format!("duckdb://{}", db_path.display());

    let output = cmd()
        .args([&uri, "t1", "t2", "-k", "id", "-c", "%", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(matches!(value["sign"].as_str(), Some("+") | Some("-")));
        assert!(value["row"].is_array());
    }
}

#[test]
fn test_stats_summary() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");
    seeded_database(&db_path);
    let uri = format!("duckdb://{}", db_path.display());

    cmd()
        .args([&uri, "t1", "t2", "-k", "id", "-c", "%", "-s"])
        .assert()
        .success()
        .stdout(predicate::str::contains("100 rows in table A"))
        .stdout(predicate::str::contains("99 rows in table B"))
        .stdout(predicate::str::contains("1 rows exclusive to table A"))
        .stdout(predicate::str::contains("1 rows updated"));
}

#[test]
fn test_limit_caps_output() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");
    seeded_database(&db_path);
    let uri = format!("duckdb://{}", db_path.display());

    let output = cmd()
        .args([&uri, "t1", "t2", "-k", "id", "-c", "%", "-l", "1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 1);
}

#[test]
fn test_forced_hashdiff_matches_joindiff() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");
    seeded_database(&db_path);
    let uri = format!("duckdb://{}", db_path.display());

    let run = |algo: &str| {
        let output = cmd()
            .args([&uri, "t1", "t2", "-k", "id", "-c", "%", "-a", algo])
            .output()
            .unwrap();
        assert!(output.status.success(), "algorithm {algo} failed");
        let mut lines: Vec<String> = String::from_utf8(output.stdout)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        lines.sort();
        lines
    };

    assert_eq!(run("joindiff"), run("hashdiff"));
}

#[test]
fn test_config_run_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");
    seeded_database(&db_path);

    let conf = dir.path().join("rowdiff.toml");
    std::fs::write(
        &conf,
        format!(
            r#"
[database.local]
driver = "duckdb"
path = "{}"

[run.default]
key_columns = ["id"]

[run.check]
columns = ["%"]
1.database = "local"
1.table = "t1"
2.database = "local"
2.table = "t2"
"#,
            db_path.display()
        ),
    )
    .unwrap();

    cmd()
        .args(["--conf", conf.to_str().unwrap(), "--run", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-\t50\t"));
}
