use std::fs;
use std::path::Path;
use std::process::Command;

use crm_import::crm::memory::MemorySnapshot;
use crm_import::models::EntityKind;
use tempfile::TempDir;

const SHEET: &str = "\
Contact First Name;Contact Last Name;Contact Email;Donation Amount;Donation Date
Jane;Doe;jane@x.com;25;2024-01-15
John;Roe;john@x.com;40;2024-02-01
";

fn run(dir: &Path, extra: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_crm-import"))
        .arg("--sheet")
        .arg(dir.join("sheet.csv"))
        .arg("--store")
        .arg(dir.join("store.json"))
        .args(["--delimiter", ";"])
        .args(extra)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run crm-import")
}

fn load(dir: &Path) -> MemorySnapshot {
    let raw = fs::read_to_string(dir.join("store.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn count(snapshot: &MemorySnapshot, kind: EntityKind) -> usize {
    snapshot.records.iter().filter(|r| r.kind == kind).count()
}

#[test]
fn test_import_saves_snapshot_and_reruns_cleanly() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("sheet.csv"), SHEET).unwrap();

    let output = run(dir.path(), &[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["contacts_inserted"], 2);
    assert_eq!(stats["donations_inserted"], 2);

    let first = load(dir.path());
    assert_eq!(count(&first, EntityKind::Contact), 2);
    assert_eq!(count(&first, EntityKind::Donation), 2);

    let output = run(dir.path(), &[]);
    assert!(output.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["contacts_inserted"], 0);
    assert_eq!(stats["duplicates_skipped"], 2);

    let second = load(dir.path());
    assert_eq!(second.records.len(), first.records.len());
}

#[test]
fn test_dry_run_writes_report_but_not_snapshot() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("sheet.csv"), SHEET).unwrap();
    let report_path = dir.path().join("report.json");

    let output = run(
        dir.path(),
        &["--dry-run", "--report", report_path.to_str().unwrap()],
    );

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(!dir.path().join("store.json").exists());
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["rows"].as_array().map(Vec::len), Some(2));
    assert_eq!(report["rows"][0]["row"], 2);
    assert!(report["rows"][0]["contact_id"].is_string());
}

#[test]
fn test_unknown_model_is_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("sheet.csv"), SHEET).unwrap();

    let output = run(dir.path(), &["--model", "bogus"]);

    assert!(!output.status.success());
}
