use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

use crust_store::{Store, TagRegistry};

pub const DEFAULT_CONFIG_FILE: &str = "crust.toml";
pub const DEFAULT_SOURCE_TAG: &str = "c_code";
pub const DEFAULT_WORK_TAG: &str = "current";

/// Audit tag that records every step node the engine produces.
pub const OP_HISTORY_TAG: &str = "op_history";

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Project configuration loaded from `crust.toml` plus `CRUST_*` overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Globs selecting the C sources picked up by a bare `crust import`.
    #[serde(default = "default_src_globs")]
    pub src_globs: Vec<String>,
    pub build_command: String,
    /// Optional; a missing test phase counts as passing but is flagged.
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transpile: TranspileConfig,
    #[serde(default, rename = "translator")]
    pub translators: Vec<TranslatorConfig>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub ffi: FfiConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_src_globs() -> Vec<String> {
    vec!["**/*.c".to_string(), "**/*.h".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

fn default_store_dir() -> String {
    ".crust".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranspileConfig {
    /// Run cmake to produce compile_commands.json before transpiling.
    /// Disable for transpilers that do not consume a compilation database.
    #[serde(default = "default_true")]
    pub generate_compile_commands: bool,
    #[serde(default = "default_cmake_src_dir")]
    pub cmake_src_dir: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_true() -> bool {
    true
}

fn default_cmake_src_dir() -> String {
    ".".to_string()
}

fn default_output_dir() -> String {
    "rust".to_string()
}

impl Default for TranspileConfig {
    fn default() -> Self {
        Self {
            generate_compile_commands: default_true(),
            cmake_src_dir: default_cmake_src_dir(),
            output_dir: default_output_dir(),
        }
    }
}

/// One external transpiler; list order in `crust.toml` is the priority order.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslatorConfig {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_llm_base_url() -> String {
    "http://localhost:8080/v1".to_string()
}

fn default_api_key_env() -> String {
    "CRUST_API_KEY".to_string()
}

fn default_llm_timeout() -> u64 {
    600
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_api_key_env(),
            model: None,
            timeout_secs: default_llm_timeout(),
            api_key: None,
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Isolation mechanism: "none" or "sudo".
    #[serde(default = "default_sandbox_mechanism")]
    pub mechanism: String,
    /// Unprivileged account used by the sudo mechanism.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

fn default_sandbox_mechanism() -> String {
    "none".to_string()
}

fn default_sandbox_timeout() -> u64 {
    600
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mechanism: default_sandbox_mechanism(),
            user: None,
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

impl SandboxConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairConfig {
    #[serde(default = "default_repair_attempts")]
    pub max_attempts: u32,
}

fn default_repair_attempts() -> u32 {
    3
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_repair_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FfiConfig {
    /// Functions whose foreign-ABI signature must be preserved.
    #[serde(default)]
    pub exports: Vec<String>,
}

impl ProjectConfig {
    pub fn from_toml(contents: &str, base_dir: &Path) -> Result<Self> {
        let mut config: ProjectConfig =
            toml_edit::de::from_str(contents).context("invalid crust.toml")?;
        config.base_dir = base_dir.to_path_buf();
        config.apply_env(&EnvSnapshot::capture());
        Ok(config)
    }

    fn apply_env(&mut self, snapshot: &EnvSnapshot) {
        if let Some(dir) = snapshot.var("CRUST_STORE_DIR") {
            self.store.dir = dir.to_string();
        }
        if let Some(base) = snapshot.var("CRUST_API_BASE") {
            self.llm.base_url = base.to_string();
        }
        if let Some(model) = snapshot.var("CRUST_API_MODEL") {
            self.llm.model = Some(model.to_string());
        }
        if let Some(mechanism) = snapshot.var("CRUST_SANDBOX") {
            self.sandbox.mechanism = mechanism.to_string();
        }
        if let Some(user) = snapshot.var("CRUST_SANDBOX_SUDO_USER") {
            self.sandbox.user = Some(user.to_string());
        }
        self.llm.api_key = snapshot
            .var("CRUST_API_KEY")
            .or_else(|| snapshot.var(&self.llm.api_key_env))
            .map(ToOwned::to_owned);
    }

    #[must_use]
    pub fn store_root(&self) -> PathBuf {
        self.base_dir.join(&self.store.dir)
    }

    /// Checks the fields the pipeline needs before a run starts, so a bad
    /// configuration fails up front instead of mid-iteration.
    pub fn validate_for_run(&self) -> Result<()> {
        if self.build_command.trim().is_empty() {
            bail!("build_command must not be empty");
        }
        if self.translators.is_empty() {
            bail!("at least one [[translator]] must be configured");
        }
        for translator in &self.translators {
            if translator.command.is_empty() {
                bail!("translator `{}` has an empty command", translator.name);
            }
        }
        if self.detector.command.is_empty() {
            bail!("[detector] command must be configured");
        }
        match self.sandbox.mechanism.as_str() {
            "none" => {}
            "sudo" => {
                if self.sandbox.user.is_none() {
                    bail!("sandbox mechanism `sudo` requires a sandbox user");
                }
            }
            other => bail!("unknown sandbox mechanism `{other}`: expected \"none\" or \"sudo\""),
        }
        Url::parse(&self.llm.base_url)
            .with_context(|| format!("invalid llm base_url `{}`", self.llm.base_url))?;
        Ok(())
    }
}

/// A loaded project: configuration plus its store and tag registry.
pub struct Project {
    pub config: ProjectConfig,
    pub store: Store,
    pub tags: TagRegistry,
}

impl Project {
    /// Load the project rooted at `config_path` (default `./crust.toml`).
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let config = ProjectConfig::from_toml(&contents, &base_dir)?;
        Self::from_config(config)
    }

    pub fn from_config(config: ProjectConfig) -> Result<Self> {
        let root = config.store_root();
        let store = Store::open(&root)
            .with_context(|| format!("unable to open store at {}", root.display()))?;
        let tags = TagRegistry::open(&root)
            .with_context(|| format!("unable to open tags at {}", root.display()))?;
        Ok(Self {
            config,
            store,
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
build_command = "cargo build"
test_command = "cargo test"

[[translator]]
name = "c2rust"
command = ["c2rust-transpile", "build/compile_commands.json"]

[[translator]]
name = "fallback"
command = ["fallback-transpile"]

[detector]
command = ["find-unsafe", "--json"]

[sandbox]
mechanism = "sudo"
user = "crust-sandbox"
timeout_secs = 120

[repair]
max_attempts = 5

[ffi]
exports = ["parse_input"]
"#;

    #[test]
    fn parses_full_config() {
        let config = ProjectConfig::from_toml(SAMPLE, Path::new(".")).expect("parse");
        assert_eq!(config.build_command, "cargo build");
        assert_eq!(config.translators.len(), 2);
        assert_eq!(config.translators[0].name, "c2rust");
        assert_eq!(config.sandbox.mechanism, "sudo");
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(120));
        assert_eq!(config.repair.max_attempts, 5);
        assert_eq!(config.ffi.exports, vec!["parse_input".to_string()]);
        config.validate_for_run().expect("valid");
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let config = ProjectConfig::from_toml("build_command = \"make\"", Path::new("."))
            .expect("parse");
        assert_eq!(config.store.dir, ".crust");
        assert_eq!(config.sandbox.mechanism, "none");
        assert_eq!(config.repair.max_attempts, 3);
        assert!(config.test_command.is_none());
        assert_eq!(config.transpile.output_dir, "rust");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = ProjectConfig::from_toml("build_command = \"make\"", Path::new("."))
            .expect("parse");
        let snapshot = EnvSnapshot::testing(&[
            ("CRUST_API_BASE", "http://model-host:9000/v1"),
            ("CRUST_API_MODEL", "qwen-coder"),
            ("CRUST_SANDBOX", "sudo"),
            ("CRUST_SANDBOX_SUDO_USER", "nobody"),
            ("CRUST_API_KEY", "secret"),
        ]);
        config.apply_env(&snapshot);
        assert_eq!(config.llm.base_url, "http://model-host:9000/v1");
        assert_eq!(config.llm.model.as_deref(), Some("qwen-coder"));
        assert_eq!(config.sandbox.mechanism, "sudo");
        assert_eq!(config.sandbox.user.as_deref(), Some("nobody"));
        assert_eq!(config.llm.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn run_validation_requires_translators_and_detector() {
        let config = ProjectConfig::from_toml("build_command = \"make\"", Path::new("."))
            .expect("parse");
        let err = config.validate_for_run().expect_err("no translators");
        assert!(err.to_string().contains("translator"));
    }
}
