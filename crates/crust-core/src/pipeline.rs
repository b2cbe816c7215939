//! The migration state machine.
//!
//! One iteration takes the tree behind the working tag through translate →
//! validate → repair → scan → split → safety-refactor → validate → repair,
//! and advances the tag (compare-and-swap) only for candidates that build,
//! pass the test suite, and strictly decrease the unsafe count. The loop
//! terminates when the detector reports zero unsafe locations, or reports
//! itself stuck once the repair budget stops producing progress.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crust_store::{Node, NodeId, StepNode, StepStatus, Store, StoreError, TagRegistry};

use crate::config::{ProjectConfig, OP_HISTORY_TAG};
use crate::sandbox::{Sandbox, SandboxResult, Verdict};
use crate::split;
use crate::tools::{
    log_tail, Rewriter, ToolCtx, ToolFailure, Translator, UnsafeReport, UnsafeScanner,
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("all translators failed: {summary}")]
    TranslationFailed { summary: String },
    #[error("{stage} output failed validation after {attempts} repair attempts")]
    ValidationFailed {
        stage: &'static str,
        attempts: u32,
        log: String,
    },
    #[error("unsafe count did not decrease ({count} remaining, baseline {baseline}) after exhausting the repair budget")]
    Stuck { count: usize, baseline: usize },
    #[error("tag `{tag}` was moved by a concurrent run; re-read it and retry")]
    Conflict { tag: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tool(#[from] ToolFailure),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TranslationFailed { .. } => "translation_failed",
            PipelineError::ValidationFailed { .. } => "validation_failed",
            PipelineError::Stuck { .. } => "stuck",
            PipelineError::Conflict { .. } => "conflict",
            PipelineError::Store(_) => "store",
            PipelineError::Tool(_) => "tool",
            PipelineError::Internal(_) => "internal",
        }
    }
}

/// One recorded step, mirroring the StepNode written to the store.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    /// Id of the StepNode itself.
    pub node: NodeId,
    pub inputs: BTreeMap<String, NodeId>,
    pub output: Option<NodeId>,
    pub status: StepStatus,
}

/// Structured progress output of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub iterations: u32,
    pub final_tree: NodeId,
    pub unsafe_remaining: usize,
    /// True when validation was build-only because no test command is
    /// configured.
    pub tests_skipped: bool,
    pub steps: Vec<StepRecord>,
}

struct Validation {
    passed: bool,
    log: Vec<u8>,
}

pub struct Engine<'a> {
    store: &'a Store,
    tags: &'a TagRegistry,
    config: &'a ProjectConfig,
    sandbox: &'a Sandbox,
    translators: Vec<Box<dyn Translator + 'a>>,
    rewriter: Box<dyn Rewriter + 'a>,
    scanner: Box<dyn UnsafeScanner + 'a>,
    steps: Vec<StepRecord>,
    tests_skipped: bool,
}

impl<'a> Engine<'a> {
    pub fn new(
        store: &'a Store,
        tags: &'a TagRegistry,
        config: &'a ProjectConfig,
        sandbox: &'a Sandbox,
        translators: Vec<Box<dyn Translator + 'a>>,
        rewriter: Box<dyn Rewriter + 'a>,
        scanner: Box<dyn UnsafeScanner + 'a>,
    ) -> Self {
        Self {
            store,
            tags,
            config,
            sandbox,
            translators,
            rewriter,
            scanner,
            steps: Vec::new(),
            tests_skipped: false,
        }
    }

    /// Steps recorded so far; useful for reporting after a failed run.
    #[must_use]
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    fn ctx(&self) -> ToolCtx<'a> {
        ToolCtx {
            store: self.store,
            sandbox: self.sandbox,
            config: self.config,
        }
    }

    /// Drive the pipeline until no unsafe code remains or an iteration fails.
    ///
    /// The working tag only ever moves by compare-and-swap against the value
    /// observed when the iteration began, so concurrent progress surfaces as
    /// `Conflict` instead of being silently overwritten.
    pub fn run(&mut self, source_tag: &str, work_tag: &str) -> Result<RunReport, PipelineError> {
        let mut current = match self.tags.try_resolve(work_tag)? {
            Some(id) => {
                info!(tag = work_tag, node = %id, "resuming from existing working tag");
                id
            }
            None => {
                let source = self.tags.resolve(source_tag)?;
                info!(tag = source_tag, node = %source, "translating source tree");
                let translated = self.translate(source)?;
                let validated = self.validate_with_repair(translated, "translate")?;
                self.advance(work_tag, None, validated, "translate")?;
                validated
            }
        };

        let mut iterations = 0u32;
        loop {
            let report = self.scan(current)?;
            let count = report.total();
            if count == 0 {
                info!(tree = %current, iterations, "no unsafe code remains; fixed point reached");
                return Ok(RunReport {
                    iterations,
                    final_tree: current,
                    unsafe_remaining: 0,
                    tests_skipped: self.tests_skipped,
                    steps: std::mem::take(&mut self.steps),
                });
            }
            iterations += 1;
            info!(iteration = iterations, unsafe_count = count, "refactoring toward safety");

            let mut exports: BTreeSet<String> = self.config.ffi.exports.iter().cloned().collect();
            exports.extend(report.ffi_exports());
            let (working, base_report) = self.split_ffi(current, &exports, report)?;
            let baseline = base_report.total();

            let candidate = self.safety_rewrite(working, &base_report)?;
            let accepted = self.validate_refactor(candidate, baseline)?;
            self.advance(work_tag, Some(current), accepted, "safety_refactor")?;
            current = accepted;
        }
    }

    /// Primary translator first, then the fallback; every attempt is
    /// recorded. No partial output survives a failed attempt.
    fn translate(&mut self, c_tree: NodeId) -> Result<NodeId, PipelineError> {
        let mut failures = Vec::new();
        for i in 0..self.translators.len() {
            let name = self.translators[i].name().to_string();
            info!(translator = %name, "attempting translation");
            let result = {
                let ctx = self.ctx();
                self.translators[i].translate(&ctx, c_tree)
            };
            match result {
                Ok(output) => {
                    let mut inputs = BTreeMap::from([("c_code".to_string(), c_tree)]);
                    inputs.extend(output.artifacts);
                    self.record_step(
                        "translate",
                        inputs,
                        json!({ "translator": name }),
                        Some(output.tree),
                        StepStatus::Success,
                        output.log,
                    )?;
                    return Ok(output.tree);
                }
                Err(failure) => {
                    warn!(translator = %name, %failure, "translator failed");
                    self.record_step(
                        "translate",
                        BTreeMap::from([("c_code".to_string(), c_tree)]),
                        json!({ "translator": name }),
                        None,
                        StepStatus::Failure,
                        failure.to_string().into_bytes(),
                    )?;
                    failures.push(format!("{name}: {failure}"));
                }
            }
        }
        Err(PipelineError::TranslationFailed {
            summary: failures.join("; "),
        })
    }

    /// Sandboxed build, then tests. A missing test command counts as passing
    /// but is flagged in the final report rather than treated as a full
    /// validation.
    fn validate(&mut self, tree: NodeId) -> Result<Validation, PipelineError> {
        let build_command = self.config.build_command.clone();
        let build = self.run_phase(tree, "build", &build_command)?;
        if !build.passed() {
            return Ok(Validation {
                passed: false,
                log: build.combined_log(),
            });
        }

        let test_command = self
            .config
            .test_command
            .clone()
            .filter(|command| !command.trim().is_empty());
        let Some(test_command) = test_command else {
            warn!("no test command configured; validation is build-only");
            self.tests_skipped = true;
            return Ok(Validation {
                passed: true,
                log: build.combined_log(),
            });
        };
        let test = self.run_phase(tree, "test", &test_command)?;
        Ok(Validation {
            passed: test.passed(),
            log: test.combined_log(),
        })
    }

    fn run_phase(
        &mut self,
        tree: NodeId,
        phase: &str,
        command: &str,
    ) -> Result<SandboxResult, PipelineError> {
        let result = {
            let session = self.sandbox.session()?;
            session.checkout(self.store, tree)?;
            session.run_shell(command, self.sandbox.timeout())?
        };
        let status = match result.verdict {
            Verdict::Exit(0) => StepStatus::Success,
            _ => StepStatus::Failure,
        };
        let params = json!({
            "command": command,
            "verdict": result.verdict.describe(),
            "timed_out": result.verdict == Verdict::Timeout,
            "duration_ms": u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        });
        self.record_step(
            phase,
            BTreeMap::from([("code".to_string(), tree)]),
            params,
            None,
            status,
            result.combined_log(),
        )?;
        Ok(result)
    }

    fn validate_with_repair(
        &mut self,
        mut tree: NodeId,
        stage: &'static str,
    ) -> Result<NodeId, PipelineError> {
        let budget = self.config.repair.max_attempts;
        let mut attempts = 0u32;
        loop {
            let validation = self.validate(tree)?;
            if validation.passed {
                return Ok(tree);
            }
            if attempts == budget {
                return Err(PipelineError::ValidationFailed {
                    stage,
                    attempts,
                    log: log_tail(&validation.log, 4096),
                });
            }
            attempts += 1;
            info!(stage, attempt = attempts, max = budget, "validation failed; requesting repair");
            tree = self.repair(tree, &validation.log)?;
        }
    }

    /// Validation plus the no-regression rule: a candidate is accepted only
    /// when its unsafe count is strictly below the baseline. Equal or worse
    /// counts are rejected and routed through the repair path until the
    /// budget runs out, at which point the run reports itself stuck.
    fn validate_refactor(
        &mut self,
        mut candidate: NodeId,
        baseline: usize,
    ) -> Result<NodeId, PipelineError> {
        let budget = self.config.repair.max_attempts;
        let mut attempts = 0u32;
        loop {
            let validation = self.validate(candidate)?;
            if validation.passed {
                let report = self.scan(candidate)?;
                let count = report.total();
                if count < baseline {
                    return Ok(candidate);
                }
                if attempts == budget {
                    return Err(PipelineError::Stuck { count, baseline });
                }
                attempts += 1;
                warn!(count, baseline, attempt = attempts, "unsafe count did not decrease; rejecting candidate");
                let context = format!(
                    "The rewrite still leaves {count} unsafe functions (the input had {baseline}).\nUnsafe functions remaining:\n{}\n",
                    report.summary()
                );
                candidate = self.repair(candidate, context.as_bytes())?;
            } else {
                if attempts == budget {
                    return Err(PipelineError::ValidationFailed {
                        stage: "safety_refactor",
                        attempts,
                        log: log_tail(&validation.log, 4096),
                    });
                }
                attempts += 1;
                candidate = self.repair(candidate, &validation.log)?;
            }
        }
    }

    fn safety_rewrite(
        &mut self,
        tree: NodeId,
        report: &UnsafeReport,
    ) -> Result<NodeId, PipelineError> {
        let output = {
            let ctx = self.ctx();
            self.rewriter.propose_safe_rewrite(&ctx, tree, report)
        }?;
        let mut inputs = BTreeMap::from([("code".to_string(), tree)]);
        inputs.extend(output.artifacts);
        self.record_step(
            "safety_refactor",
            inputs,
            json!({ "unsafe_count": report.total() }),
            Some(output.tree),
            StepStatus::Success,
            output.log,
        )?;
        Ok(output.tree)
    }

    fn repair(&mut self, tree: NodeId, failure_log: &[u8]) -> Result<NodeId, PipelineError> {
        let output = {
            let ctx = self.ctx();
            self.rewriter.propose_repair(&ctx, tree, failure_log)
        }?;
        let mut inputs = BTreeMap::from([("code".to_string(), tree)]);
        inputs.extend(output.artifacts);
        self.record_step(
            "repair",
            inputs,
            json!({}),
            Some(output.tree),
            StepStatus::Success,
            output.log,
        )?;
        Ok(output.tree)
    }

    /// Split FFI entry points ahead of the rewrite, then re-measure the
    /// baseline: the detector ignores unsafety inside exported functions, so
    /// moving logic into `_impl` functions can raise the visible count.
    fn split_ffi(
        &mut self,
        tree: NodeId,
        exports: &BTreeSet<String>,
        report: UnsafeReport,
    ) -> Result<(NodeId, UnsafeReport), PipelineError> {
        if exports.is_empty() {
            return Ok((tree, report));
        }
        let outcome = split::split_ffi_exports(self.store, tree, exports)?;
        if !outcome.changed {
            return Ok((tree, report));
        }
        self.record_step(
            "ffi_split",
            BTreeMap::from([("code".to_string(), tree)]),
            json!({ "functions": outcome.split_functions }),
            Some(outcome.tree),
            StepStatus::Success,
            Vec::new(),
        )?;
        let new_report = self.scan(outcome.tree)?;
        Ok((outcome.tree, new_report))
    }

    fn scan(&mut self, tree: NodeId) -> Result<UnsafeReport, PipelineError> {
        let result = {
            let ctx = self.ctx();
            self.scanner.scan(&ctx, tree)
        };
        match result {
            Ok(report) => {
                let report_file = self.store.put_file(report.to_json())?;
                self.record_step(
                    "scan_unsafe",
                    BTreeMap::from([("code".to_string(), tree)]),
                    json!({ "unsafe_count": report.total() }),
                    Some(report_file),
                    StepStatus::Success,
                    Vec::new(),
                )?;
                Ok(report)
            }
            Err(failure) => {
                self.record_step(
                    "scan_unsafe",
                    BTreeMap::from([("code".to_string(), tree)]),
                    json!({}),
                    None,
                    StepStatus::Failure,
                    failure.to_string().into_bytes(),
                )?;
                Err(failure.into())
            }
        }
    }

    fn advance(
        &mut self,
        work_tag: &str,
        expected: Option<NodeId>,
        new: NodeId,
        reason: &str,
    ) -> Result<(), PipelineError> {
        match self
            .tags
            .compare_and_swap(work_tag, expected, new, Some(reason))
        {
            Ok(()) => {
                info!(tag = work_tag, node = %new, reason, "advanced working tag");
                Ok(())
            }
            Err(StoreError::Conflict { tag, .. }) => Err(PipelineError::Conflict { tag }),
            Err(err) => Err(err.into()),
        }
    }

    fn record_step(
        &mut self,
        step: &str,
        inputs: BTreeMap<String, NodeId>,
        params: Value,
        output: Option<NodeId>,
        status: StepStatus,
        body: Vec<u8>,
    ) -> Result<NodeId, StoreError> {
        let node = Node::Step(StepNode {
            step: step.to_string(),
            inputs: inputs.clone(),
            params,
            output,
            status,
            body,
        });
        let id = self.store.put(&node)?;
        self.tags.update(OP_HISTORY_TAG, id, Some(step))?;
        self.steps.push(StepRecord {
            step: step.to_string(),
            node: id,
            inputs,
            output,
            status,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::Path;

    use crate::config::{DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG};
    use crate::tools::{FileReport, ToolOutput};

    struct StaticTranslator {
        name: &'static str,
        output: NodeId,
    }

    impl Translator for StaticTranslator {
        fn name(&self) -> &str {
            self.name
        }

        fn translate(&self, _ctx: &ToolCtx<'_>, _c_tree: NodeId) -> Result<ToolOutput, ToolFailure> {
            Ok(ToolOutput {
                tree: self.output,
                artifacts: BTreeMap::new(),
                log: b"translated".to_vec(),
            })
        }
    }

    struct FailingTranslator {
        name: &'static str,
    }

    impl Translator for FailingTranslator {
        fn name(&self) -> &str {
            self.name
        }

        fn translate(&self, _ctx: &ToolCtx<'_>, _c_tree: NodeId) -> Result<ToolOutput, ToolFailure> {
            Err(ToolFailure::Tool {
                name: self.name.to_string(),
                diagnostics: "unsupported construct".to_string(),
            })
        }
    }

    /// Hands out a fixed sequence of trees for rewrite and repair proposals.
    struct QueueRewriter {
        queue: RefCell<VecDeque<NodeId>>,
        rewrite_calls: Cell<u32>,
        repair_calls: Cell<u32>,
    }

    impl QueueRewriter {
        fn new(trees: Vec<NodeId>) -> Self {
            Self {
                queue: RefCell::new(trees.into()),
                rewrite_calls: Cell::new(0),
                repair_calls: Cell::new(0),
            }
        }

        fn next(&self) -> Result<ToolOutput, ToolFailure> {
            let tree = self
                .queue
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| ToolFailure::Tool {
                    name: "stub-rewriter".to_string(),
                    diagnostics: "proposal queue exhausted".to_string(),
                })?;
            Ok(ToolOutput {
                tree,
                artifacts: BTreeMap::new(),
                log: Vec::new(),
            })
        }
    }

    impl Rewriter for &QueueRewriter {
        fn propose_safe_rewrite(
            &self,
            _ctx: &ToolCtx<'_>,
            _tree: NodeId,
            _report: &UnsafeReport,
        ) -> Result<ToolOutput, ToolFailure> {
            self.rewrite_calls.set(self.rewrite_calls.get() + 1);
            self.next()
        }

        fn propose_repair(
            &self,
            _ctx: &ToolCtx<'_>,
            _tree: NodeId,
            _failure_log: &[u8],
        ) -> Result<ToolOutput, ToolFailure> {
            self.repair_calls.set(self.repair_calls.get() + 1);
            self.next()
        }
    }

    /// Counts occurrences of the word `unsafe` across the tree's files.
    struct MarkerScanner;

    impl UnsafeScanner for MarkerScanner {
        fn scan(&self, ctx: &ToolCtx<'_>, tree: NodeId) -> Result<UnsafeReport, ToolFailure> {
            let tree_node = ctx.store.get_tree(tree)?;
            let mut report = UnsafeReport::default();
            for (path, id) in &tree_node.files {
                let file = ctx.store.get_file(*id)?;
                let text = String::from_utf8_lossy(&file.body).into_owned();
                let count = text.matches("unsafe").count();
                if count > 0 {
                    let mut entry = FileReport::default();
                    for i in 0..count {
                        entry.fns_containing_unsafe.insert(format!("f{i}"));
                    }
                    report.files.insert(path.clone(), entry);
                }
            }
            Ok(report)
        }
    }

    struct Env {
        _dir: tempfile::TempDir,
        store: Store,
        tags: TagRegistry,
        config: ProjectConfig,
        sandbox: Sandbox,
    }

    fn env(max_repair_attempts: u32) -> Env {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config =
            ProjectConfig::from_toml("build_command = \"true\"", Path::new(".")).expect("config");
        config.test_command = Some("true".to_string());
        config.repair.max_attempts = max_repair_attempts;
        config.sandbox.timeout_secs = 60;
        let root = dir.path().join("store");
        let store = Store::open(&root).expect("store");
        let tags = TagRegistry::open(&root).expect("tags");
        let sandbox = Sandbox::from_config(&config.sandbox).expect("sandbox");
        Env {
            _dir: dir,
            store,
            tags,
            config,
            sandbox,
        }
    }

    fn put_source_tree(env: &Env, body: &str) -> NodeId {
        let file = env.store.put_file(body.as_bytes().to_vec()).expect("file");
        env.store
            .put_tree(BTreeMap::from([("main.rs".to_string(), file)]))
            .expect("tree")
    }

    fn seed_c_code(env: &Env) {
        let file = env.store.put_file(b"int main() {}".to_vec()).expect("c file");
        let tree = env
            .store
            .put_tree(BTreeMap::from([("main.c".to_string(), file)]))
            .expect("c tree");
        env.tags
            .update(DEFAULT_SOURCE_TAG, tree, Some("import"))
            .expect("tag");
    }

    #[test]
    fn fallback_translator_is_used_and_loop_reaches_fixed_point() {
        let env = env(3);
        seed_c_code(&env);
        let unsafe_tree = put_source_tree(&env, "unsafe fn f0() {}\nfn main() {}\n");
        let safe_tree = put_source_tree(&env, "fn f0() {}\nfn main() {}\n");

        let rewriter = QueueRewriter::new(vec![safe_tree]);
        let mut engine = Engine::new(
            &env.store,
            &env.tags,
            &env.config,
            &env.sandbox,
            vec![
                Box::new(FailingTranslator { name: "primary" }),
                Box::new(StaticTranslator {
                    name: "fallback",
                    output: unsafe_tree,
                }),
            ],
            Box::new(&rewriter),
            Box::new(MarkerScanner),
        );

        let report = engine
            .run(DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG)
            .expect("run succeeds");
        assert_eq!(report.final_tree, safe_tree);
        assert_eq!(report.unsafe_remaining, 0);
        assert_eq!(report.iterations, 1);
        assert!(!report.tests_skipped);

        // The tag denotes the zero-unsafe tree.
        assert_eq!(env.tags.resolve(DEFAULT_WORK_TAG).expect("tag"), safe_tree);

        // Both translation attempts were recorded, failure first.
        let translate_steps: Vec<_> = report
            .steps
            .iter()
            .filter(|s| s.step == "translate")
            .collect();
        assert_eq!(translate_steps.len(), 2);
        assert_eq!(translate_steps[0].status, StepStatus::Failure);
        assert_eq!(translate_steps[1].status, StepStatus::Success);
        assert_eq!(translate_steps[1].output, Some(unsafe_tree));
    }

    #[test]
    fn exhausted_translators_fail_the_iteration_without_touching_the_tag() {
        let env = env(3);
        seed_c_code(&env);
        let rewriter = QueueRewriter::new(Vec::new());
        let mut engine = Engine::new(
            &env.store,
            &env.tags,
            &env.config,
            &env.sandbox,
            vec![
                Box::new(FailingTranslator { name: "primary" }),
                Box::new(FailingTranslator { name: "fallback" }),
            ],
            Box::new(&rewriter),
            Box::new(MarkerScanner),
        );

        let err = engine
            .run(DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG)
            .expect_err("both translators fail");
        assert!(matches!(err, PipelineError::TranslationFailed { .. }));
        assert!(env
            .tags
            .try_resolve(DEFAULT_WORK_TAG)
            .expect("resolve")
            .is_none());
    }

    #[test]
    fn regressing_candidates_are_rejected_and_the_run_reports_stuck() {
        let env = env(1);
        let start = put_source_tree(&env, "unsafe fn f0() {}\n");
        env.tags
            .update(DEFAULT_WORK_TAG, start, None)
            .expect("seed work tag");

        // Both the rewrite and its repair make things worse.
        let worse = put_source_tree(&env, "unsafe fn f0() {}\nunsafe fn f1() {}\n");
        let still_worse = put_source_tree(&env, "unsafe fn f2() {}\nunsafe fn f3() {}\n");
        let rewriter = QueueRewriter::new(vec![worse, still_worse]);
        let mut engine = Engine::new(
            &env.store,
            &env.tags,
            &env.config,
            &env.sandbox,
            Vec::new(),
            Box::new(&rewriter),
            Box::new(MarkerScanner),
        );

        let err = engine
            .run(DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG)
            .expect_err("no progress");
        assert!(matches!(
            err,
            PipelineError::Stuck { count: 2, baseline: 1 }
        ));
        assert_eq!(rewriter.repair_calls.get(), 1);
        // The tag still denotes the last accepted state.
        assert_eq!(env.tags.resolve(DEFAULT_WORK_TAG).expect("tag"), start);
    }

    #[test]
    fn repair_budget_bounds_failed_validation() {
        let mut built = env(2);
        built.config.build_command = "false".to_string();
        let env = built;
        seed_c_code(&env);
        let broken = put_source_tree(&env, "unsafe fn f0() {}\n");

        // Repairs return the same broken tree; the build keeps failing.
        let rewriter = QueueRewriter::new(vec![broken, broken]);
        let mut engine = Engine::new(
            &env.store,
            &env.tags,
            &env.config,
            &env.sandbox,
            vec![Box::new(StaticTranslator {
                name: "primary",
                output: broken,
            })],
            Box::new(&rewriter),
            Box::new(MarkerScanner),
        );

        let err = engine
            .run(DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG)
            .expect_err("validation never passes");
        assert!(matches!(
            err,
            PipelineError::ValidationFailed { stage: "translate", attempts: 2, .. }
        ));
        assert_eq!(rewriter.repair_calls.get(), 2);
        assert!(env
            .tags
            .try_resolve(DEFAULT_WORK_TAG)
            .expect("resolve")
            .is_none());
    }

    #[test]
    fn missing_test_command_is_flagged_as_build_only() {
        let mut built = env(3);
        built.config.test_command = None;
        let env = built;
        seed_c_code(&env);
        let safe_tree = put_source_tree(&env, "fn main() {}\n");

        let rewriter = QueueRewriter::new(Vec::new());
        let mut engine = Engine::new(
            &env.store,
            &env.tags,
            &env.config,
            &env.sandbox,
            vec![Box::new(StaticTranslator {
                name: "primary",
                output: safe_tree,
            })],
            Box::new(&rewriter),
            Box::new(MarkerScanner),
        );

        let report = engine
            .run(DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG)
            .expect("run succeeds");
        assert!(report.tests_skipped);
        assert_eq!(report.unsafe_remaining, 0);
        assert_eq!(rewriter.rewrite_calls.get(), 0);
    }

    #[test]
    fn op_history_records_every_step() {
        let env = env(3);
        seed_c_code(&env);
        let safe_tree = put_source_tree(&env, "fn main() {}\n");
        let rewriter = QueueRewriter::new(Vec::new());
        let mut engine = Engine::new(
            &env.store,
            &env.tags,
            &env.config,
            &env.sandbox,
            vec![Box::new(StaticTranslator {
                name: "primary",
                output: safe_tree,
            })],
            Box::new(&rewriter),
            Box::new(MarkerScanner),
        );

        let report = engine
            .run(DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG)
            .expect("run succeeds");
        let history = env.tags.reflog(OP_HISTORY_TAG).expect("op history");
        assert_eq!(history.len(), report.steps.len());
        // Every recorded step node exists in the store and decodes.
        for entry in &history {
            env.store.get_step(entry.node).expect("step node");
        }
    }
}
