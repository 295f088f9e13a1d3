//! CLI test cases.
//!
//! None of these talk to Textract. The quota tests either stop before the
//! engine is contacted or only read the usage records.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Create a new `Command` with our binary, isolated from any local `.env`
/// and AWS metadata lookups.
fn cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ocr-meter").unwrap();
    cmd.current_dir(dir)
        .env_remove("OCR_METER_USAGE_DIR")
        .env("AWS_REGION", "us-east-1")
        .env("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE")
        .env("AWS_SECRET_ACCESS_KEY", "not-a-real-secret")
        .env("AWS_EC2_METADATA_DISABLED", "true");
    cmd
}

/// The current month, formatted the way usage records store it.
fn this_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

/// Write a small PNG to `path`.
fn write_png(path: &Path) {
    image::RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255]))
        .save(path)
        .unwrap();
}

#[test]
fn test_help() {
    let dir = TempDir::new().unwrap();
    cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("OCR_METER_USAGE_DIR"));
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    cmd(dir.path()).arg("--version").assert().success();
}

#[test]
fn test_usage_reports_fresh_trial_quota() {
    let dir = TempDir::new().unwrap();
    let output = cmd(dir.path())
        .args(["usage", "--class", "trial", "--usage-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["class"], "trial");
    assert_eq!(report["used"], 0);
    assert_eq!(report["limit"], 50);
    assert_eq!(report["remaining"], 50);
    assert_eq!(report["month"], this_month());

    // Looking at a fresh quota starts the month's record.
    let record = fs::read_to_string(dir.path().join("usage_trial.json")).unwrap();
    let record: serde_json::Value = serde_json::from_str(&record).unwrap();
    assert_eq!(record["used"], 0);
}

#[test]
fn test_usage_dir_from_environment() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("usage_standard.json"),
        format!(r#"{{"month":"{}","used":998}}"#, this_month()),
    )
    .unwrap();

    let output = cmd(dir.path())
        .env("OCR_METER_USAGE_DIR", dir.path())
        .arg("usage")
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["used"], 998);
    assert_eq!(report["remaining"], 2);
}

#[test]
fn test_usage_all_classes() {
    let dir = TempDir::new().unwrap();
    let output = cmd(dir.path())
        .args(["usage", "--all", "--usage-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let reports: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    let classes = reports
        .iter()
        .map(|r| r["class"].as_str().unwrap().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(classes, ["standard", "trial"]);
}

#[test]
fn test_usage_rolls_over_old_month() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("usage_trial.json");
    fs::write(&path, r#"{"month":"1999-12","used":50}"#).unwrap();

    let output = cmd(dir.path())
        .args(["usage", "--class", "trial", "--usage-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["used"], 0);

    let record: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(record["month"], this_month());
    assert_eq!(record["used"], 0);
}

#[test]
fn test_schema_usage_state() {
    let dir = TempDir::new().unwrap();
    cmd(dir.path())
        .args(["schema", "UsageState"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"used\""));
}

#[test]
fn test_exhausted_trial_is_denied_before_ocr() {
    let dir = TempDir::new().unwrap();
    let record_path = dir.path().join("usage_trial.json");
    let record = format!(r#"{{"month":"{}","used":50}}"#, this_month());
    fs::write(&record_path, &record).unwrap();
    let image_path = dir.path().join("page.png");
    write_png(&image_path);

    cmd(dir.path())
        .args(["ocr", "--class", "trial", "--usage-dir"])
        .arg(dir.path())
        .arg(&image_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("quota exhausted"));

    // Denial doesn't touch the record.
    assert_eq!(fs::read_to_string(&record_path).unwrap(), record);
}

#[test]
fn test_exhausted_quota_is_reported_before_aws_setup() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("usage_trial.json"),
        format!(r#"{{"month":"{}","used":50}}"#, this_month()),
    )
    .unwrap();
    let image_path = dir.path().join("page.png");
    write_png(&image_path);

    // With no region anywhere, setting up Textract would fail.
    let missing = dir.path().join("missing");
    cmd(dir.path())
        .env_remove("AWS_REGION")
        .env_remove("AWS_DEFAULT_REGION")
        .env_remove("AWS_PROFILE")
        .env("AWS_CONFIG_FILE", &missing)
        .env("AWS_SHARED_CREDENTIALS_FILE", &missing)
        .args(["ocr", "--class", "trial", "--usage-dir"])
        .arg(dir.path())
        .arg(&image_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("quota exhausted"))
        .stderr(predicate::str::contains("region").not());
}

#[test]
fn test_zero_limit_is_rejected() {
    let dir = TempDir::new().unwrap();
    cmd(dir.path())
        .args(["usage", "--limit", "0"])
        .assert()
        .failure();
}

#[test]
fn test_non_image_input_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.txt");
    fs::write(&path, "not an image").unwrap();

    cmd(dir.path())
        .args(["ocr", "--usage-dir"])
        .arg(dir.path())
        .arg(&path)
        .assert()
        .failure();

    // The quota is checked first, but nothing is charged.
    let record = fs::read_to_string(dir.path().join("usage_standard.json")).unwrap();
    let record: serde_json::Value = serde_json::from_str(&record).unwrap();
    assert_eq!(record["used"], 0);
}
