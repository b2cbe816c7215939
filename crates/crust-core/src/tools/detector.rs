use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crust_store::NodeId;

use crate::config::DetectorConfig;
use crate::sandbox::Verdict;

use super::{log_tail, ToolCtx, ToolFailure, UnsafeScanner};

/// Per-file detector findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    /// Unsafe functions that are not FFI entry points.
    #[serde(default)]
    pub internal_unsafe_fns: Vec<String>,
    /// Functions whose bodies contain an unsafe block.
    #[serde(default)]
    pub fns_containing_unsafe: BTreeSet<String>,
    /// Exported functions whose ABI must be preserved, when the detector
    /// reports them; the project config may list more.
    #[serde(default)]
    pub ffi_exports: Vec<String>,
}

/// Detector output for a whole tree, keyed by relative file path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnsafeReport {
    pub files: BTreeMap<String, FileReport>,
}

impl UnsafeReport {
    pub fn parse(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }

    /// Number of unsafe locations remaining. Zero is the pipeline's fixed
    /// point.
    #[must_use]
    pub fn total(&self) -> usize {
        self.files
            .values()
            .map(|file| file.internal_unsafe_fns.len() + file.fns_containing_unsafe.len())
            .sum()
    }

    #[must_use]
    pub fn ffi_exports(&self) -> BTreeSet<String> {
        self.files
            .values()
            .flat_map(|file| file.ffi_exports.iter().cloned())
            .collect()
    }

    /// Human-readable listing for rewrite prompts.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for (path, file) in &self.files {
            let mut names: BTreeSet<&str> = file
                .internal_unsafe_fns
                .iter()
                .map(String::as_str)
                .collect();
            names.extend(file.fns_containing_unsafe.iter().map(String::as_str));
            if names.is_empty() {
                continue;
            }
            let joined = names.into_iter().collect::<Vec<_>>().join(", ");
            lines.push(format!("{path}: {joined}"));
        }
        if lines.is_empty() {
            "(none)".to_string()
        } else {
            lines.join("\n")
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("report serializes")
    }
}

/// Runs the configured detector command against a checked-out tree and
/// parses its JSON report from stdout.
pub struct CommandScanner {
    command: Vec<String>,
}

impl CommandScanner {
    #[must_use]
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            command: config.command.clone(),
        }
    }
}

impl UnsafeScanner for CommandScanner {
    fn scan(&self, ctx: &ToolCtx<'_>, tree: NodeId) -> Result<UnsafeReport, ToolFailure> {
        let session = ctx.sandbox.session().map_err(ToolFailure::Other)?;
        session.checkout(ctx.store, tree)?;
        let timeout = ctx.sandbox.timeout();
        let result = session
            .run_argv(&self.command, timeout)
            .map_err(ToolFailure::Other)?;
        match result.verdict {
            Verdict::Timeout => Err(ToolFailure::Timeout {
                name: "detector".to_string(),
                seconds: timeout.as_secs(),
            }),
            Verdict::Exit(0) => {
                UnsafeReport::parse(&result.stdout).map_err(|err| ToolFailure::Tool {
                    name: "detector".to_string(),
                    diagnostics: format!("unparseable report: {err}"),
                })
            }
            Verdict::Exit(code) => Err(ToolFailure::Tool {
                name: "detector".to_string(),
                diagnostics: format!(
                    "exit code {code}: {}",
                    log_tail(&result.combined_log(), 4096)
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "src/main.rs": {
            "internal_unsafe_fns": ["raw_copy"],
            "fns_containing_unsafe": ["parse", "raw_copy"]
        },
        "src/util.rs": {
            "internal_unsafe_fns": [],
            "fns_containing_unsafe": [],
            "ffi_exports": ["entry_point"]
        }
    }"#;

    #[test]
    fn parses_detector_json_and_counts() {
        let report = UnsafeReport::parse(SAMPLE.as_bytes()).expect("parse");
        assert_eq!(report.total(), 3);
        assert_eq!(
            report.ffi_exports(),
            BTreeSet::from(["entry_point".to_string()])
        );
    }

    #[test]
    fn zero_total_for_clean_tree() {
        let report = UnsafeReport::parse(b"{}").expect("parse");
        assert_eq!(report.total(), 0);
        assert_eq!(report.summary(), "(none)");
    }

    #[test]
    fn summary_lists_files_and_functions() {
        let report = UnsafeReport::parse(SAMPLE.as_bytes()).expect("parse");
        let summary = report.summary();
        assert!(summary.contains("src/main.rs: parse, raw_copy"));
        assert!(!summary.contains("src/util.rs"));
    }

    #[test]
    fn report_json_round_trips() {
        let report = UnsafeReport::parse(SAMPLE.as_bytes()).expect("parse");
        let back = UnsafeReport::parse(&report.to_json()).expect("reparse");
        assert_eq!(report, back);
    }
}
