use assert_cmd::prelude::*;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const OBJ: &str = "# exported\nv 0 0 0\nv 2 0 0\nv 0 2 0\nv 2 2 0\nf 1 2 3\nf 2 4 3\n";

fn write_model(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write model");
    path
}

fn viewer() -> Command {
    let mut cmd = Command::cargo_bin("model-viewer").expect("binary exists");
    cmd.env_remove("MODEL_VIEWER_CONFIG")
        .env_remove("MODEL_VIEWER_BASE_URL");
    cmd
}

#[test]
fn summary_reports_a_local_obj() {
    let dir = TempDir::new().expect("temp dir");
    let model = write_model(dir.path(), "plate.obj", OBJ);
    viewer()
        .arg("--model")
        .arg(&model)
        .arg("--summary-only")
        .assert()
        .success()
        .stdout(contains("Format: obj (attempts: obj)"))
        .stdout(contains("Meshes: 1, triangles: 2"))
        .stdout(contains("Scale: 1.0000"));
}

#[test]
fn mislabelled_file_falls_back_to_its_real_format() {
    let dir = TempDir::new().expect("temp dir");
    let model = write_model(dir.path(), "model.glb", OBJ);
    viewer()
        .arg("--model")
        .arg(&model)
        .arg("--summary-only")
        .assert()
        .success()
        .stdout(contains("Format: obj (attempts: glb -> obj)"));
}

#[test]
fn explicit_extension_overrides_the_file_name() {
    let dir = TempDir::new().expect("temp dir");
    let model = write_model(dir.path(), "upload.bin", OBJ);
    viewer()
        .args(["--ext", ".OBJ", "--summary-only", "--model"])
        .arg(&model)
        .assert()
        .success()
        .stdout(contains("Format: obj (attempts: obj)"));
}

#[test]
fn unreadable_model_fails_with_suggestions() {
    let dir = TempDir::new().expect("temp dir");
    let missing = dir.path().join("missing.glb");
    viewer()
        .arg("--model")
        .arg(&missing)
        .arg("--summary-only")
        .assert()
        .failure()
        .stdout(contains("Error loading model:"))
        .stdout(contains("cross-origin"))
        .stderr(contains("Error:"));
}

#[test]
fn debug_flag_prints_the_trace() {
    let dir = TempDir::new().expect("temp dir");
    let model = write_model(dir.path(), "plate.obj", OBJ);
    viewer()
        .arg("--model")
        .arg(&model)
        .args(["--summary-only", "--debug"])
        .assert()
        .success()
        .stderr(contains("Cascade state"));
}

#[test]
fn unknown_argument_is_rejected() {
    viewer()
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(contains("Unknown argument: --frobnicate"));
}

#[test]
fn missing_flag_value_is_rejected() {
    viewer()
        .args(["--summary-only", "--model"])
        .assert()
        .failure()
        .stderr(contains("--model expects a value"));
}
