//! Boundary contracts for the external collaborators: the two transpilers,
//! the language model, and the unsafe-code detector. Ordering and retry
//! policy between implementations live in the pipeline engine, never here.

mod detector;
mod llm;
mod translator;

use std::collections::BTreeMap;

pub use detector::{CommandScanner, FileReport, UnsafeReport};
pub use llm::LlmRewriter;
pub use translator::{CommandTranslator, COMPILE_COMMANDS_PATH};

use crust_store::{NodeId, Store, StoreError};

use crate::config::ProjectConfig;
use crate::sandbox::Sandbox;

/// Shared context handed to every adapter call.
pub struct ToolCtx<'a> {
    pub store: &'a Store,
    pub sandbox: &'a Sandbox,
    pub config: &'a ProjectConfig,
}

/// Why an adapter call produced no usable result.
#[derive(Debug, thiserror::Error)]
pub enum ToolFailure {
    #[error("{name} failed: {diagnostics}")]
    Tool { name: String, diagnostics: String },
    #[error("{name} timed out after {seconds}s")]
    Timeout { name: String, seconds: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A tree produced by an adapter, plus auxiliary nodes worth keeping in the
/// provenance record (captured requests, responses, generated build inputs).
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tree: NodeId,
    pub artifacts: BTreeMap<String, NodeId>,
    pub log: Vec<u8>,
}

pub trait Translator {
    fn name(&self) -> &str;

    /// Translate a C source tree into a Rust tree. The output is never
    /// trusted without subsequent sandboxed validation.
    fn translate(&self, ctx: &ToolCtx<'_>, c_tree: NodeId) -> Result<ToolOutput, ToolFailure>;
}

pub trait Rewriter {
    /// Best-effort, non-deterministic rewrite toward safe Rust.
    fn propose_safe_rewrite(
        &self,
        ctx: &ToolCtx<'_>,
        tree: NodeId,
        report: &UnsafeReport,
    ) -> Result<ToolOutput, ToolFailure>;

    /// Best-effort fix for a failed build/test, given the captured output.
    fn propose_repair(
        &self,
        ctx: &ToolCtx<'_>,
        tree: NodeId,
        failure_log: &[u8],
    ) -> Result<ToolOutput, ToolFailure>;
}

pub trait UnsafeScanner {
    /// Authoritative unsafe-location report used for the termination
    /// decision.
    fn scan(&self, ctx: &ToolCtx<'_>, tree: NodeId) -> Result<UnsafeReport, ToolFailure>;
}

/// Last `max` bytes of a captured log, lossily decoded for diagnostics.
pub(crate) fn log_tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
