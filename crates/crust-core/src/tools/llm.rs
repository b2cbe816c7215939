use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crust_store::{NodeId, Store};

use crate::config::LlmConfig;

use super::{log_tail, Rewriter, ToolCtx, ToolFailure, ToolOutput, UnsafeReport};

const USER_AGENT: &str = concat!("crust/", env!("CARGO_PKG_VERSION"));

/// How much failed build/test output is quoted back in a repair request.
const FAILURE_LOG_LIMIT: usize = 16 * 1024;

const SAFETY_PROMPT: &str = "\
This Rust code was mechanically translated from C, so much of it is unsafe. \
Rewrite it as safe Rust without changing its behavior. Replace raw pointer \
operations and libc calls with safe equivalents, remove unsafe blocks, and \
turn unsafe functions into safe ones. You may adjust types and data \
structures (for example, replacing raw pointers with references, slices, or \
owned containers) as needed.

Functions marked #[no_mangle] are FFI entry points whose signatures must not \
change. Each one is already a thin wrapper around a function with the same \
name plus an `_impl` suffix; leave the wrappers exactly as they are and make \
the `_impl` functions safe.

These functions still contain unsafe code:

{unsafe_functions}

Reply with the updated contents of every file you change, as a fenced code \
block with the file path on the line directly above it, exactly as the files \
appear below.

{input_files}
";

const REPAIR_PROMPT: &str = "\
Compiling this Rust code and running its tests failed. Fix the problem so \
the project builds and the tests pass, without introducing more unsafe code \
than is already present.

Reply with the updated contents of every file you change, as a fenced code \
block with the file path on the line directly above it, exactly as the files \
appear below.

{input_files}

Build/test output:

```
{failure_log}
```
";

/// Language-model adapter implementing both rewrite roles over a blocking
/// chat-completions endpoint.
pub struct LlmRewriter {
    config: LlmConfig,
    client: Client,
}

impl LlmRewriter {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .context("failed to build llm http client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn transport_failure(&self, err: &reqwest::Error) -> ToolFailure {
        if err.is_timeout() {
            ToolFailure::Timeout {
                name: "llm".to_string(),
                seconds: self.config.timeout_secs,
            }
        } else {
            ToolFailure::Tool {
                name: "llm".to_string(),
                diagnostics: err.to_string(),
            }
        }
    }

    /// Configured model, or the first model the endpoint advertises.
    fn model(&self) -> Result<String, ToolFailure> {
        if let Some(model) = &self.config.model {
            return Ok(model.clone());
        }
        let response = self
            .client
            .get(self.endpoint("models"))
            .send()
            .map_err(|err| self.transport_failure(&err))?;
        let value: Value = response.json().map_err(|err| ToolFailure::Tool {
            name: "llm".to_string(),
            diagnostics: format!("unparseable models listing: {err}"),
        })?;
        let id = value["data"][0]["id"]
            .as_str()
            .ok_or_else(|| ToolFailure::Tool {
                name: "llm".to_string(),
                diagnostics: "models listing contained no model id".to_string(),
            })?;
        Ok(default_model_name(id))
    }

    fn chat(&self, model: &str, prompt: &str) -> Result<(Value, Value, String), ToolFailure> {
        let request = json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let mut builder = self
            .client
            .post(self.endpoint("chat/completions"))
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .map_err(|err| self.transport_failure(&err))?;
        let status = response.status();
        let value: Value = response.json().map_err(|err| ToolFailure::Tool {
            name: "llm".to_string(),
            diagnostics: format!("unparseable chat response: {err}"),
        })?;
        if !status.is_success() {
            return Err(ToolFailure::Tool {
                name: "llm".to_string(),
                diagnostics: format!("HTTP {status}: {}", log_tail(value.to_string().as_bytes(), 2048)),
            });
        }
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ToolFailure::Tool {
                name: "llm".to_string(),
                diagnostics: "chat response contained no message content".to_string(),
            })?
            .to_string();
        Ok((request, value, content))
    }

    fn rewrite(
        &self,
        ctx: &ToolCtx<'_>,
        tree: NodeId,
        template: &str,
        fills: &[(&str, String)],
    ) -> Result<ToolOutput, ToolFailure> {
        let input_tree = ctx.store.get_tree(tree)?;
        let (files_text, short_map) = emit_files(ctx.store, &input_tree.files)?;

        let mut stripped = template.to_string();
        for (key, value) in fills {
            stripped = stripped.replace(&format!("{{{key}}}"), value);
        }
        let prompt = stripped.replace("{input_files}", &files_text);

        let model = self.model()?;
        debug!(%model, "requesting rewrite");
        let (request, response, content) = self.chat(&model, &prompt)?;

        let mut files = input_tree.files.clone();
        let mut changed = 0usize;
        for (short, text) in extract_files(&content) {
            let Some(full) = short_map.get(&short) else {
                warn!(path = %short, "model emitted an unknown file path; ignoring");
                continue;
            };
            let id = ctx.store.put_file(text.into_bytes())?;
            if files.insert(full.clone(), id) != Some(id) {
                changed += 1;
            }
        }
        if changed == 0 {
            warn!("model reply contained no usable file blocks");
        }
        let new_tree = ctx.store.put_tree(files)?;

        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "prompt".to_string(),
            ctx.store.put_file(stripped.into_bytes())?,
        );
        artifacts.insert(
            "request".to_string(),
            ctx.store.put_file(request.to_string().into_bytes())?,
        );
        artifacts.insert(
            "response".to_string(),
            ctx.store.put_file(response.to_string().into_bytes())?,
        );
        Ok(ToolOutput {
            tree: new_tree,
            artifacts,
            log: content.into_bytes(),
        })
    }
}

impl Rewriter for LlmRewriter {
    fn propose_safe_rewrite(
        &self,
        ctx: &ToolCtx<'_>,
        tree: NodeId,
        report: &UnsafeReport,
    ) -> Result<ToolOutput, ToolFailure> {
        self.rewrite(
            ctx,
            tree,
            SAFETY_PROMPT,
            &[("unsafe_functions", report.summary())],
        )
    }

    fn propose_repair(
        &self,
        ctx: &ToolCtx<'_>,
        tree: NodeId,
        failure_log: &[u8],
    ) -> Result<ToolOutput, ToolFailure> {
        self.rewrite(
            ctx,
            tree,
            REPAIR_PROMPT,
            &[("failure_log", log_tail(failure_log, FAILURE_LOG_LIMIT))],
        )
    }
}

/// Strip a served model id down to a bare model name: basename, no file
/// extension.
fn default_model_name(id: &str) -> String {
    let base = id.rsplit('/').next().unwrap_or(id);
    Path::new(base)
        .file_stem()
        .map_or_else(|| base.to_string(), |stem| stem.to_string_lossy().to_string())
}

fn fence_language(path: &str) -> Option<&'static str> {
    match Path::new(path).extension()?.to_str()? {
        "rs" => Some("Rust"),
        "c" | "h" => Some("C"),
        _ => None,
    }
}

/// Render the source files of a tree as path-labelled fenced code blocks,
/// returning the text plus a map from the shortened paths used in the output
/// back to the full tree paths.
pub(crate) fn emit_files(
    store: &Store,
    files: &BTreeMap<String, NodeId>,
) -> Result<(String, BTreeMap<String, String>), ToolFailure> {
    let mut paths: Vec<&String> = files
        .keys()
        .filter(|path| fence_language(path).is_some())
        .collect();
    paths.sort();

    let prefix_len = common_parent_len(&paths);
    let mut parts = Vec::new();
    let mut short_map = BTreeMap::new();
    for path in paths {
        let lang = fence_language(path).expect("filtered above");
        let file = store.get_file(files[path.as_str()])?;
        let text = String::from_utf8_lossy(&file.body);
        let short: String = path
            .split('/')
            .skip(prefix_len)
            .collect::<Vec<_>>()
            .join("/");
        let newline = if text.ends_with('\n') { "" } else { "\n" };
        parts.push(format!("{short}\n```{lang}\n{text}{newline}```"));
        short_map.insert(short, path.clone());
    }
    Ok((parts.join("\n\n"), short_map))
}

/// Number of leading path components shared by every file's parent
/// directory.
fn common_parent_len(paths: &[&String]) -> usize {
    let mut parents = paths.iter().map(|path| {
        let components: Vec<&str> = path.split('/').collect();
        components[..components.len() - 1].to_vec()
    });
    let Some(mut prefix) = parents.next() else {
        return 0;
    };
    for parent in parents {
        let shared = prefix
            .iter()
            .zip(parent.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
    }
    prefix.len()
}

/// Extract `(path, contents)` pairs from a model reply: fenced code blocks
/// whose preceding line is a plausible relative path and whose fence
/// language matches the path's extension.
pub(crate) fn extract_files(reply: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = reply.lines().collect();
    let mut files = Vec::new();
    let mut open: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        if line.trim_end() == "```" {
            if let Some(start) = open {
                let path = lines[start - 1].trim();
                let mut text = lines[start + 1..i].join("\n");
                text.push('\n');
                files.push((path.to_string(), text));
            }
            open = None;
        } else if line.starts_with("```") {
            open = None;
            if i == 0 {
                continue;
            }
            let path = lines[i - 1].trim();
            if path.is_empty() || path.split_whitespace().count() > 1 {
                continue;
            }
            if path.contains("..") || path.starts_with('/') {
                continue;
            }
            let Some(lang) = fence_language(path) else {
                continue;
            };
            if line.trim_end().to_lowercase() != format!("```{}", lang.to_lowercase()) {
                continue;
            }
            open = Some(i);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_a_labelled_rust_block() {
        let reply = "Here is the updated file.\n\nsrc/main.rs\n```Rust\nfn main() {}\n```\n";
        let files = extract_files(reply);
        assert_eq!(
            files,
            vec![("src/main.rs".to_string(), "fn main() {}\n".to_string())]
        );
    }

    #[test]
    fn lowercase_fence_is_accepted() {
        let reply = "lib.rs\n```rust\npub fn f() {}\n```\n";
        let files = extract_files(reply);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "lib.rs");
    }

    #[test]
    fn rejects_suspicious_path_lines() {
        // Prose, traversal, and absolute paths must not be taken as paths.
        let prose = "the file is\n```Rust\nfn f() {}\n```\n";
        assert!(extract_files(prose).is_empty());
        let traversal = "../etc/passwd.rs\n```Rust\nfn f() {}\n```\n";
        assert!(extract_files(traversal).is_empty());
        let absolute = "/tmp/x.rs\n```Rust\nfn f() {}\n```\n";
        assert!(extract_files(absolute).is_empty());
    }

    #[test]
    fn rejects_mismatched_fence_language() {
        let reply = "main.rs\n```python\nprint()\n```\n";
        assert!(extract_files(reply).is_empty());
    }

    #[test]
    fn emit_then_extract_round_trips_short_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("store")).expect("store");
        let a = store.put_file(b"fn a() {}\n".as_slice()).expect("a");
        let b = store.put_file(b"fn b() {}\n".as_slice()).expect("b");
        let files = BTreeMap::from([
            ("rust/src/a.rs".to_string(), a),
            ("rust/src/b.rs".to_string(), b),
        ]);

        let (text, short_map) = emit_files(&store, &files).expect("emit");
        // Shared `rust/src` prefix is stripped from the emitted labels.
        assert_eq!(short_map.get("a.rs"), Some(&"rust/src/a.rs".to_string()));

        let extracted = extract_files(&text);
        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted[0], ("a.rs".to_string(), "fn a() {}\n".to_string()));
    }

    #[test]
    fn model_name_is_stripped_to_a_stem() {
        assert_eq!(default_model_name("models/qwen-coder.gguf"), "qwen-coder");
        assert_eq!(default_model_name("gpt-local"), "gpt-local");
    }
}
