use std::collections::BTreeMap;

use crust_store::NodeId;

use crate::config::TranslatorConfig;
use crate::sandbox::Verdict;

use super::{log_tail, ToolCtx, ToolFailure, ToolOutput, Translator};

/// compile_commands.json is always generated at a fixed relative path, in
/// case the transpiler records relative source paths inside it.
pub const COMPILE_COMMANDS_PATH: &str = "build/compile_commands.json";

/// External transpiler invoked as a configured command inside a sandbox
/// session. A `cmake` pass produces `compile_commands.json` first; the
/// transpiler's output directory is committed as the translated tree.
pub struct CommandTranslator {
    name: String,
    command: Vec<String>,
}

impl CommandTranslator {
    #[must_use]
    pub fn from_config(config: &TranslatorConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
        }
    }
}

impl Translator for CommandTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate(&self, ctx: &ToolCtx<'_>, c_tree: NodeId) -> Result<ToolOutput, ToolFailure> {
        if which::which(&self.command[0]).is_err() {
            return Err(ToolFailure::Tool {
                name: self.name.clone(),
                diagnostics: format!("`{}` not found on PATH", self.command[0]),
            });
        }

        let session = ctx.sandbox.session().map_err(ToolFailure::Other)?;
        session.checkout(ctx.store, c_tree)?;
        let timeout = ctx.sandbox.timeout();

        let mut artifacts = BTreeMap::new();
        if ctx.config.transpile.generate_compile_commands {
            let cmake_argv: Vec<String> = [
                "cmake",
                "-B",
                "build",
                "-DCMAKE_EXPORT_COMPILE_COMMANDS=ON",
                ctx.config.transpile.cmake_src_dir.as_str(),
            ]
            .into_iter()
            .map(str::to_string)
            .collect();
            let cmake = session
                .run_argv(&cmake_argv, timeout)
                .map_err(ToolFailure::Other)?;
            match cmake.verdict {
                Verdict::Timeout => {
                    return Err(ToolFailure::Timeout {
                        name: format!("{}/cmake", self.name),
                        seconds: timeout.as_secs(),
                    });
                }
                Verdict::Exit(0) => {}
                Verdict::Exit(code) => {
                    return Err(ToolFailure::Tool {
                        name: format!("{}/cmake", self.name),
                        diagnostics: format!(
                            "exit code {code}: {}",
                            log_tail(&cmake.combined_log(), 4096)
                        ),
                    });
                }
            }
            let compile_commands = session.commit_file(ctx.store, COMPILE_COMMANDS_PATH)?;
            artifacts.insert("compile_commands".to_string(), compile_commands);
        }

        let run = session
            .run_argv(&self.command, timeout)
            .map_err(ToolFailure::Other)?;
        match run.verdict {
            Verdict::Timeout => Err(ToolFailure::Timeout {
                name: self.name.clone(),
                seconds: timeout.as_secs(),
            }),
            Verdict::Exit(0) => {
                let tree = session.commit_dir(ctx.store, &ctx.config.transpile.output_dir)?;
                Ok(ToolOutput {
                    tree,
                    artifacts,
                    log: run.combined_log(),
                })
            }
            Verdict::Exit(code) => Err(ToolFailure::Tool {
                name: self.name.clone(),
                diagnostics: format!("exit code {code}: {}", log_tail(&run.combined_log(), 4096)),
            }),
        }
    }
}
