//! End-to-end tests for the `clboot` binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const MAIN: &str = "__kernel void cl_main(__global char* p) { p[get_global_id(0)] = 1; }\n";

fn clboot() -> Command {
    let mut cmd = Command::cargo_bin("clboot").expect("binary built");
    cmd.env_remove("CLBOOT_CONFIG").env("RUST_LOG", "off");
    cmd
}

fn kernel_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, text) in files {
        std::fs::write(dir.path().join(name), text).expect("write source");
    }
    dir
}

fn dir_arg(dir: &Path) -> &str {
    dir.to_str().expect("utf-8 temp path")
}

// ============================================================================
// explain
// ============================================================================

#[test]
fn test_explain_known_code() {
    clboot()
        .args(["explain", "-11"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CL_BUILD_PROGRAM_FAILURE"));
}

#[test]
fn test_explain_unknown_code() {
    clboot()
        .args(["explain", "424242"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CL_UNKNOWN_ERROR"));
}

#[test]
fn test_explain_all_json() {
    let output = clboot().args(["--format", "json", "explain", "--all"]).output().expect("run");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let codes = value["codes"].as_array().expect("codes");
    assert!(codes.iter().any(|c| c["label"] == "CL_SUCCESS" && c["code"] == 0));
    assert!(codes.iter().any(|c| c["label"] == "CL_INVALID_KERNEL_NAME"));
}

// ============================================================================
// run
// ============================================================================

#[test]
fn test_run_single_module_succeeds() {
    let dir = kernel_dir(&[("main.cl", MAIN)]);
    clboot()
        .args(["run", "-d", dir_arg(dir.path())])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run Complete"))
        .stdout(predicate::str::contains("built from main.cl"));
}

#[test]
fn test_run_linked_modules_json() {
    let dir = kernel_dir(&[
        ("mathlib.cl", "int square(int x) { return x * x; }\n"),
        ("main.cl", MAIN),
    ]);
    let output = clboot()
        .args(["-f", "json", "run", "-d", dir_arg(dir.path()), "-m", "mathlib.cl", "-m", "main.cl"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["program"]["kind"], "linked");
    assert_eq!(value["program"]["modules"][0], "mathlib.cl");
}

#[test]
fn test_run_build_failure_exits_100() {
    let dir = kernel_dir(&[("main.cl", "#error no target selected\n")]);
    clboot()
        .args(["run", "-d", dir_arg(dir.path())])
        .assert()
        .code(100)
        .stdout(predicate::str::contains("Failed to build CL_BUILD_PROGRAM_FAILURE"))
        .stdout(predicate::str::contains("error: no target selected"));
}

#[test]
fn test_run_compile_failure_names_module() {
    let dir = kernel_dir(&[("a.cl", "int one(void) { return 1; }\n"), ("b.cl", "#error broken module\n")]);
    clboot()
        .args(["run", "-d", dir_arg(dir.path()), "-m", "a.cl", "-m", "b.cl"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Failed to compile b.cl:"))
        .stdout(predicate::str::contains("broken module"));
}

#[test]
fn test_run_unknown_kernel_reports_device_error() {
    let dir = kernel_dir(&[("main.cl", MAIN)]);
    clboot()
        .args(["run", "-d", dir_arg(dir.path()), "-k", "missing_entry"])
        .assert()
        .code(134)
        .stdout(predicate::str::contains("Error clCreateKernel -> CL_INVALID_KERNEL_NAME"));
}

#[test]
fn test_run_missing_kernel_dir_is_usage_error() {
    clboot()
        .args(["run", "-d", "/nonexistent/clboot/kernels"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_run_uses_config_file() {
    let dir = kernel_dir(&[("entry.cl", MAIN)]);
    let config = dir.path().join("clboot.json");
    let body = serde_json::json!({
        "kernel_dir": dir.path(),
        "entry_module": "entry.cl",
        "global_work_size": 4,
    });
    std::fs::write(&config, body.to_string()).expect("write config");

    clboot()
        .env("CLBOOT_CONFIG", &config)
        .args(["-f", "json", "run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("entry.cl"))
        .stdout(predicate::str::contains("\"global_work_size\": 4"));
}

// ============================================================================
// init-config
// ============================================================================

#[test]
fn test_init_config_writes_and_refuses_overwrite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clboot.json");
    let path_arg = path.to_str().expect("utf-8 temp path");

    clboot().args(["init-config", "-o", path_arg]).assert().success();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
    assert_eq!(written["modules"][0], "mathlib.cl");

    clboot()
        .args(["init-config", "-o", path_arg])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already exists"));

    clboot().args(["init-config", "-o", path_arg, "--force"]).assert().success();
}

#[test]
fn test_run_help_states_device_is_simulated() {
    clboot()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("simulated device"));
}
