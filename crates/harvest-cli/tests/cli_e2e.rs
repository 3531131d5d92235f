// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI surface checks.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_fixtures(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
    let map_path = dir.path().join("map.json");
    let workbook_path = dir.path().join("workbook.json");
    std::fs::write(
        &map_path,
        serde_json::json!({
            "category": "gaming-mice",
            "key_sheet": "keys",
            "enum_sources": [],
            "component_sources": []
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        &workbook_path,
        serde_json::json!({
            "sheets": {
                "keys": [
                    ["key", "label", "type", "shape", "required_level"],
                    ["weight", "Weight", "numeric", "scalar", "critical"],
                    ["sensor", "Sensor", "text", "scalar", "required"]
                ]
            }
        })
        .to_string(),
    )
    .unwrap();
    (map_path, workbook_path)
}

#[test]
fn compile_produces_artifacts() {
    let dir = TempDir::new().unwrap();
    let (map, workbook) = write_fixtures(&dir);

    Command::cargo_bin("harvest")
        .unwrap()
        .current_dir(dir.path())
        .args(["compile", "--map"])
        .arg(&map)
        .arg("--workbook")
        .arg(&workbook)
        .assert()
        .success()
        .stdout(predicate::str::contains("compiled gaming-mice: 2 fields"));

    assert!(
        dir.path()
            .join("helper_files/gaming-mice/_generated/field_rules.json")
            .exists()
    );
}

#[test]
fn bad_contract_type_fails_with_single_line_error() {
    let dir = TempDir::new().unwrap();
    let (map, workbook) = write_fixtures(&dir);
    std::fs::write(
        &workbook,
        serde_json::json!({
            "sheets": {
                "keys": [
                    ["key", "type", "shape"],
                    ["mystery", "made_up_type", "scalar"]
                ]
            }
        })
        .to_string(),
    )
    .unwrap();

    Command::cargo_bin("harvest")
        .unwrap()
        .current_dir(dir.path())
        .args(["compile", "--map"])
        .arg(&map)
        .arg("--workbook")
        .arg(&workbook)
        .assert()
        .failure()
        .stderr(predicate::str::contains("made_up_type"));
}

#[test]
fn frontier_snapshot_on_empty_state() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("harvest")
        .unwrap()
        .current_dir(dir.path())
        .args(["frontier", "--product", "razer-viper-v3-pro"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"url_count\": 0"));
}

#[test]
fn unknown_subcommand_fails() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("harvest")
        .unwrap()
        .current_dir(dir.path())
        .arg("definitely-not-a-command")
        .assert()
        .failure();
}
