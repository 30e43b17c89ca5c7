//! Corruption recovery tests for the lift binary.
//!
//! These tests verify the system can handle:
//! - Corrupted documents in a collection
//! - Corrupted config and catalog files
//! - Missing data directories

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("lift"))
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn write_workout(temp_dir: &TempDir) -> std::path::PathBuf {
    let path = temp_dir.path().join("w1.json");
    fs::write(
        &path,
        r#"{
            "workout_id": "w1",
            "ended_at": "2024-01-16T18:00:00Z",
            "exercises": [{"exercise_id": "bench_press", "sets": [
                {"reps": 5, "weight_kg": 80.0},
                {"reps": 5, "weight_kg": 80.0}
            ]}]
        }"#,
    )
    .unwrap();
    path
}

#[test]
fn test_corrupt_fact_document_is_skipped_by_queries() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");
    let workout = write_workout(&temp_dir);

    cli()
        .arg("apply")
        .arg(&workout)
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success();

    fs::write(
        data_dir.join("store/set_facts/garbage.json"),
        "{ invalid json }}}}",
    )
    .unwrap();

    let output = cli()
        .arg("sets")
        .arg("--exercise-id")
        .arg("bench_press")
        .arg("--data-dir")
        .arg(&data_dir)
        .output()
        .unwrap();
    assert!(output.status.success());
    let response: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["items"].as_array().unwrap().len(), 2);
}

#[test]
fn test_corrupt_config_is_reported() {
    let temp_dir = setup_test_dir();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[caps\nmax_limit = ").unwrap();

    cli()
        .arg("sets")
        .arg("--exercise-id")
        .arg("bench_press")
        .arg("--config")
        .arg(&config_path)
        .arg("--data-dir")
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("TOML error"));
}

#[test]
fn test_corrupt_catalog_is_reported() {
    let temp_dir = setup_test_dir();
    let catalog_path = temp_dir.path().join("catalog.toml");
    fs::write(&catalog_path, "not = [valid").unwrap();

    cli()
        .arg("apply")
        .arg(write_workout(&temp_dir))
        .arg("--catalog")
        .arg(&catalog_path)
        .arg("--data-dir")
        .arg(temp_dir.path().join("data"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_missing_data_dir_is_created() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("does/not/exist");

    cli()
        .arg("series")
        .arg("--muscle")
        .arg("pectoralis_major")
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"weekly_points\": []"));

    assert!(data_dir.join("store").exists());
}
