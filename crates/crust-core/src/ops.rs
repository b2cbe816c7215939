//! Command entry points: import, run, export, show, reflog.
//!
//! Each returns an [`ExecutionOutcome`] envelope; domain failures become
//! non-Ok outcomes rather than errors, so the CLI can render them uniformly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crust_store::{checkout_tree, commit_paths, Node, NodeId, StoreError};

use crate::config::{Project, DEFAULT_SOURCE_TAG, DEFAULT_WORK_TAG};
use crate::outcome::ExecutionOutcome;
use crate::pipeline::{Engine, PipelineError};
use crate::sandbox::Sandbox;
use crate::tools::{CommandScanner, CommandTranslator, LlmRewriter, Translator};

/// Import C sources and point `tag` at the resulting tree.
///
/// With explicit paths, files are taken as given (directories are walked);
/// without, the configured `src_globs` select files under the project root.
pub fn import(project: &Project, paths: &[PathBuf], tag: Option<&str>) -> Result<ExecutionOutcome> {
    let tag = tag.unwrap_or(DEFAULT_SOURCE_TAG);
    let files = if paths.is_empty() {
        select_by_globs(&project.config.base_dir, &project.config.src_globs)?
    } else {
        expand_paths(paths)?
    };
    if files.is_empty() {
        return Ok(ExecutionOutcome::user_error(
            "no files matched the import selection",
            json!({ "hint": "pass file paths explicitly or adjust src_globs in crust.toml" }),
        ));
    }

    let id = commit_paths(&project.store, &project.config.base_dir, &files)?;
    project.tags.update(tag, id, Some("import"))?;
    info!(%id, tag, files = files.len(), "imported source tree");
    Ok(ExecutionOutcome::success(
        format!("imported {} files as {id}", files.len()),
        json!({ "tag": tag, "node": id.to_hex(), "files": files.len() }),
    ))
}

/// Drive the pipeline on the working tag until fixed point or failure.
pub fn run(
    project: &Project,
    source_tag: Option<&str>,
    work_tag: Option<&str>,
) -> Result<ExecutionOutcome> {
    let source_tag = source_tag.unwrap_or(DEFAULT_SOURCE_TAG);
    let work_tag = work_tag.unwrap_or(DEFAULT_WORK_TAG);
    if let Err(err) = project.config.validate_for_run() {
        return Ok(ExecutionOutcome::user_error(
            err.to_string(),
            json!({ "hint": "complete the [translator], [detector], and [sandbox] sections of crust.toml" }),
        ));
    }
    let sandbox = Sandbox::from_config(&project.config.sandbox)?;
    let translators: Vec<Box<dyn Translator>> = project
        .config
        .translators
        .iter()
        .map(|config| Box::new(CommandTranslator::from_config(config)) as Box<dyn Translator>)
        .collect();
    let rewriter = LlmRewriter::new(project.config.llm.clone())?;
    let scanner = CommandScanner::from_config(&project.config.detector);

    let mut engine = Engine::new(
        &project.store,
        &project.tags,
        &project.config,
        &sandbox,
        translators,
        Box::new(rewriter),
        Box::new(scanner),
    );
    match engine.run(source_tag, work_tag) {
        Ok(report) => {
            let message = if report.tests_skipped {
                format!(
                    "migration complete after {} iterations (no test command; validation was build-only)",
                    report.iterations
                )
            } else {
                format!("migration complete after {} iterations", report.iterations)
            };
            Ok(ExecutionOutcome::success(
                message,
                serde_json::to_value(&report).context("serialize run report")?,
            ))
        }
        Err(err) => Ok(run_failure(work_tag, &err, &engine)),
    }
}

fn run_failure(work_tag: &str, err: &PipelineError, engine: &Engine<'_>) -> ExecutionOutcome {
    let hint = match err {
        PipelineError::Conflict { .. } => {
            Some("another run advanced the tag; re-run to continue from its state")
        }
        PipelineError::Stuck { .. } => {
            Some("inspect the op_history reflog, amend crust.toml, and re-run")
        }
        PipelineError::Store(StoreError::UnknownTag(_)) => {
            Some("run `crust import` before `crust run`")
        }
        _ => None,
    };
    let diagnostics = match err {
        PipelineError::ValidationFailed { log, .. } => Some(log.as_str()),
        PipelineError::TranslationFailed { summary } => Some(summary.as_str()),
        _ => None,
    };
    let details = json!({
        "error_kind": err.kind(),
        "tag": work_tag,
        "steps": engine.steps(),
        "diagnostics": diagnostics,
        "hint": hint,
    });
    match err {
        PipelineError::Store(StoreError::UnknownTag(_)) => {
            ExecutionOutcome::user_error(err.to_string(), details)
        }
        _ => ExecutionOutcome::failure(err.to_string(), details),
    }
}

/// Materialize a tree (by tag, id, or id prefix) to `dest`.
pub fn export(project: &Project, node_ref: &str, dest: &Path) -> Result<ExecutionOutcome> {
    let id = match resolve_ref(project, node_ref) {
        Ok(id) => id,
        Err(err) => return Ok(ref_error(node_ref, &err)),
    };
    match checkout_tree(&project.store, id, dest) {
        Ok(()) => {}
        Err(err @ StoreError::WrongKind { .. }) => {
            return Ok(ExecutionOutcome::user_error(
                err.to_string(),
                json!({ "reference": node_ref, "node": id.to_hex() }),
            ));
        }
        Err(err) => return Err(err.into()),
    }
    info!(%id, dest = %dest.display(), "exported tree");
    Ok(ExecutionOutcome::success(
        format!("exported {id} to {}", dest.display()),
        json!({ "node": id.to_hex(), "dest": dest.display().to_string() }),
    ))
}

/// Describe a node: kind plus content listing.
pub fn show(project: &Project, node_ref: &str) -> Result<ExecutionOutcome> {
    let id = match resolve_ref(project, node_ref) {
        Ok(id) => id,
        Err(err) => return Ok(ref_error(node_ref, &err)),
    };
    let node = project.store.get(id)?;
    let details = match &node {
        Node::File(file) => json!({
            "kind": "file",
            "node": id.to_hex(),
            "size": file.body.len(),
            "content": String::from_utf8_lossy(&file.body),
        }),
        Node::Tree(tree) => {
            let files: serde_json::Map<String, serde_json::Value> = tree
                .files
                .iter()
                .map(|(path, child)| (path.clone(), json!(child.to_hex())))
                .collect();
            json!({ "kind": "tree", "node": id.to_hex(), "files": files })
        }
        Node::Step(step) => json!({
            "kind": "step",
            "node": id.to_hex(),
            "step": step.step,
            "inputs": step.inputs,
            "params": step.params,
            "output": step.output.map(|out| out.to_hex()),
            "status": step.status,
            "log": String::from_utf8_lossy(&step.body),
        }),
    };
    let message = match &node {
        Node::File(file) => format!("file {id} ({} bytes)", file.body.len()),
        Node::Tree(tree) => format!("tree {id} ({} entries)", tree.files.len()),
        Node::Step(step) => format!("step {id} ({})", step.step),
    };
    Ok(ExecutionOutcome::success(message, details))
}

/// History of a tag, oldest entry first.
pub fn reflog(project: &Project, tag: Option<&str>) -> Result<ExecutionOutcome> {
    let tag = tag.unwrap_or(DEFAULT_WORK_TAG);
    match project.tags.reflog(tag) {
        Ok(entries) => Ok(ExecutionOutcome::success(
            format!("{} entries for tag `{tag}`", entries.len()),
            json!({ "tag": tag, "entries": entries }),
        )),
        Err(err @ StoreError::UnknownTag(_)) => Ok(ExecutionOutcome::user_error(
            err.to_string(),
            json!({ "tag": tag }),
        )),
        Err(err) => Err(err.into()),
    }
}

/// Tags take priority over hex prefixes; pure-hex tag names are unusual
/// enough that the ambiguity does not come up in practice.
fn resolve_ref(project: &Project, node_ref: &str) -> Result<NodeId, StoreError> {
    match project.tags.try_resolve(node_ref) {
        Ok(Some(id)) => return Ok(id),
        Ok(None) | Err(StoreError::InvalidTag(_)) => {}
        Err(err) => return Err(err),
    }
    project.store.find_by_prefix(node_ref)
}

fn ref_error(node_ref: &str, err: &StoreError) -> ExecutionOutcome {
    ExecutionOutcome::user_error(
        format!("unable to resolve `{node_ref}`: {err}"),
        json!({ "reference": node_ref }),
    )
}

fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
                let entry = entry.with_context(|| format!("walking {}", path.display()))?;
                if entry.file_type().is_file() {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn select_by_globs(base: &Path, globs: &[String]) -> Result<Vec<PathBuf>> {
    let mut builder = ignore::overrides::OverrideBuilder::new(base);
    for glob in globs {
        builder
            .add(glob)
            .with_context(|| format!("invalid glob `{glob}`"))?;
    }
    let overrides = builder.build().context("building glob set")?;

    let mut files = Vec::new();
    for entry in ignore::WalkBuilder::new(base).overrides(overrides).build() {
        let entry = entry.with_context(|| format!("walking {}", base.display()))?;
        if entry.file_type().is_some_and(|t| t.is_file()) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
