use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;

mod common;

use common::parse_json;

/// Stand-in external tools: the "transpiler" copies the C file into a safe
/// Rust file, and the "detector" reports a clean tree, so the run reaches
/// its fixed point after one translation.
const RUN_CONFIG: &str = r#"
src_globs = ["**/*.c"]
build_command = "true"
test_command = "true"

[transpile]
generate_compile_commands = false
output_dir = "rust"

[[translator]]
name = "stub"
command = ["sh", "-c", "mkdir -p rust && printf 'fn main() {}\n' > rust/main.rs"]

[detector]
command = ["sh", "-c", "echo '{}'"]
"#;

fn prepare_run_project(prefix: &str, config: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let temp = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("tempdir");
    let project = temp.path().join("c_app");
    fs::create_dir_all(&project).expect("mkdir");
    fs::write(project.join("crust.toml"), config).expect("config");
    fs::write(project.join("main.c"), "int main(void) { return 0; }\n").expect("main.c");
    (temp, project)
}

#[test]
fn run_reaches_fixed_point_with_stub_tools() {
    let (_tmp, project) = prepare_run_project("crust-run-fixed-point", RUN_CONFIG);

    cargo_bin_cmd!("crust")
        .current_dir(&project)
        .arg("import")
        .assert()
        .success();

    let assert = cargo_bin_cmd!("crust")
        .current_dir(&project)
        .args(["--json", "run"])
        .assert()
        .success();
    let payload = parse_json(&assert);
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["details"]["unsafe_remaining"], 0);
    assert_eq!(payload["details"]["iterations"], 0);
    let steps = payload["details"]["steps"].as_array().expect("steps");
    let names: Vec<&str> = steps
        .iter()
        .map(|s| s["step"].as_str().expect("step name"))
        .collect();
    assert_eq!(names, vec!["translate", "build", "test", "scan_unsafe"]);

    // The working tag denotes the translated tree; exporting it yields the
    // stub transpiler's output.
    let dest = project.join("exported");
    cargo_bin_cmd!("crust")
        .current_dir(&project)
        .args(["export", "current", "--dest"])
        .arg(&dest)
        .assert()
        .success();
    let body = fs::read_to_string(dest.join("main.rs")).expect("main.rs");
    assert_eq!(body, "fn main() {}\n");
}

#[test]
fn run_with_failing_translators_reports_the_failure() {
    let config = RUN_CONFIG.replace(
        "command = [\"sh\", \"-c\", \"mkdir -p rust && printf 'fn main() {}\\n' > rust/main.rs\"]",
        "command = [\"false\"]",
    );
    let (_tmp, project) = prepare_run_project("crust-run-translate-fail", &config);

    cargo_bin_cmd!("crust")
        .current_dir(&project)
        .arg("import")
        .assert()
        .success();

    let assert = cargo_bin_cmd!("crust")
        .current_dir(&project)
        .args(["--json", "run"])
        .assert()
        .code(2);
    let payload = parse_json(&assert);
    assert_eq!(payload["status"], "failure");
    assert_eq!(payload["details"]["error_kind"], "translation_failed");
}

#[test]
fn run_without_import_is_a_user_error() {
    let (_tmp, project) = prepare_run_project("crust-run-no-import", RUN_CONFIG);

    let assert = cargo_bin_cmd!("crust")
        .current_dir(&project)
        .args(["--json", "run"])
        .assert()
        .code(1);
    let payload = parse_json(&assert);
    assert_eq!(payload["status"], "user_error");
    assert!(payload["message"]
        .as_str()
        .expect("message")
        .contains("c_code"));
}
