#![allow(dead_code)]

use std::{fs, path::PathBuf};

use assert_cmd::assert::Assert;
use serde_json::Value;
use tempfile::TempDir;

const CONFIG: &str = r#"
src_globs = ["**/*.c", "**/*.h"]
build_command = "true"
test_command = "true"

[[translator]]
name = "primary"
command = ["c2rust-transpile", "build/compile_commands.json", "--output-dir", "rust"]

[detector]
command = ["find-unsafe", "--json"]
"#;

/// Lay out a small C project with a crust.toml in a temp dir.
pub fn prepare_project(prefix: &str) -> (TempDir, PathBuf) {
    let temp = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("tempdir");
    let project = temp.path().join("sample_c_app");
    fs::create_dir_all(project.join("include")).expect("mkdir");
    fs::write(project.join("crust.toml"), CONFIG).expect("config");
    fs::write(
        project.join("main.c"),
        "#include \"include/util.h\"\nint main(void) { return add(1, 2); }\n",
    )
    .expect("main.c");
    fs::write(
        project.join("include/util.h"),
        "int add(int a, int b);\n",
    )
    .expect("util.h");
    (temp, project)
}

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}
