//! Isolated execution of untrusted build/test commands.
//!
//! The pipeline runs code produced by transpilers and a language model, so
//! every build or test executes in an ephemeral working directory, optionally
//! demoted to an unprivileged account, with a hard wall-clock budget. On
//! expiry the whole process group is killed; the directory is removed on
//! every exit path.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

use crust_store::{checkout_tree, commit_dir, NodeId, Store, StoreError};

use crate::config::SandboxConfig;

#[derive(Debug, Clone)]
enum Mechanism {
    None,
    Sudo { user: String },
}

pub struct Sandbox {
    mechanism: Mechanism,
    timeout: Duration,
}

impl Sandbox {
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let mechanism = match config.mechanism.as_str() {
            "none" => Mechanism::None,
            "sudo" => {
                let user = config
                    .user
                    .clone()
                    .context("sandbox mechanism `sudo` requires a sandbox user")?;
                Mechanism::Sudo { user }
            }
            other => bail!("unknown sandbox mechanism `{other}`"),
        };
        Ok(Self {
            mechanism,
            timeout: config.timeout(),
        })
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a fresh working directory for one checkout/run/commit cycle.
    pub fn session(&self) -> Result<Session<'_>> {
        let dir = tempfile::Builder::new()
            .prefix("crust-sandbox-")
            .tempdir()
            .context("unable to create sandbox working directory")?;
        if let Mechanism::Sudo { .. } = self.mechanism {
            make_world_accessible(dir.path());
        }
        debug!(path = %dir.path().display(), "opened sandbox session");
        Ok(Session { sandbox: self, dir })
    }
}

/// Exit disposition of a sandboxed command. Timeouts are reported as their
/// own verdict, never conflated with a non-zero exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Exit(i32),
    Timeout,
}

impl Verdict {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Verdict::Exit(code) => format!("exit code {code}"),
            Verdict::Timeout => "timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub verdict: Verdict,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl SandboxResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self.verdict, Verdict::Exit(0))
    }

    /// Stdout followed by stderr, for step logs and repair context.
    #[must_use]
    pub fn combined_log(&self) -> Vec<u8> {
        let mut log = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !log.is_empty() && !log.ends_with(b"\n") {
                log.push(b'\n');
            }
            log.extend_from_slice(&self.stderr);
        }
        log
    }
}

pub struct Session<'a> {
    sandbox: &'a Sandbox,
    dir: TempDir,
}

impl Session<'_> {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn checkout(&self, store: &Store, tree: NodeId) -> Result<(), StoreError> {
        checkout_tree(store, tree, self.path())?;
        if let Mechanism::Sudo { .. } = self.sandbox.mechanism {
            make_world_accessible(self.path());
        }
        Ok(())
    }

    pub fn commit_dir(&self, store: &Store, rel: &str) -> Result<NodeId, StoreError> {
        commit_dir(store, &self.path().join(rel))
    }

    pub fn commit_file(&self, store: &Store, rel: &str) -> Result<NodeId, StoreError> {
        let body = fs::read(self.path().join(rel))?;
        store.put_file(body)
    }

    pub fn run_argv(&self, argv: &[String], timeout: Duration) -> Result<SandboxResult> {
        if argv.is_empty() {
            bail!("refusing to run an empty command");
        }
        self.run(argv.to_vec(), timeout)
    }

    pub fn run_shell(&self, script: &str, timeout: Duration) -> Result<SandboxResult> {
        self.run(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        )
    }

    fn run(&self, argv: Vec<String>, timeout: Duration) -> Result<SandboxResult> {
        let mut command = match &self.sandbox.mechanism {
            Mechanism::None => {
                let mut command = Command::new(&argv[0]);
                command.args(&argv[1..]);
                command
            }
            Mechanism::Sudo { user } => {
                let mut command = Command::new("sudo");
                command.args(["-n", "-u", user.as_str(), "--"]).args(&argv);
                command
            }
        };
        command
            .current_dir(self.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can kill the whole tree.
            command.process_group(0);
        }

        let start = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", argv[0]))?;
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let deadline = start + timeout;
        let verdict = loop {
            if let Some(status) = child.try_wait()? {
                break Verdict::Exit(status.code().unwrap_or(-1));
            }
            if Instant::now() >= deadline {
                warn!(timeout_secs = timeout.as_secs(), command = %argv[0], "sandbox command timed out");
                self.kill_tree(&mut child);
                let _ = child.wait();
                break Verdict::Timeout;
            }
            thread::sleep(Duration::from_millis(25));
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        Ok(SandboxResult {
            verdict,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    fn kill_tree(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            let group = format!("-{}", child.id());
            let status = match &self.sandbox.mechanism {
                Mechanism::None => Command::new("kill")
                    .args(["-KILL", "--", group.as_str()])
                    .status(),
                Mechanism::Sudo { .. } => Command::new("sudo")
                    .args(["-n", "kill", "-KILL", "--", group.as_str()])
                    .status(),
            };
            if let Err(err) = status {
                warn!(%err, "failed to signal sandbox process group");
            }
        }
        let _ = child.kill();
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // Files created by the sandbox user are not removable by the
        // invoking account; reclaim them before TempDir cleanup runs.
        if let Mechanism::Sudo { user } = &self.sandbox.mechanism {
            let _ = Command::new("sudo")
                .args(["-n", "-u", user.as_str(), "rm", "-rf", "--"])
                .arg(self.dir.path())
                .status();
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    source.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn make_world_accessible(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = if meta.is_dir() { 0o777 } else { 0o666 };
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
        if meta.is_dir() {
            if let Ok(entries) = fs::read_dir(path) {
                for entry in entries.flatten() {
                    make_world_accessible(&entry.path());
                }
            }
        }
    }
}

#[cfg(not(unix))]
fn make_world_accessible(_path: &Path) {}
