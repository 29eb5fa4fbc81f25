//! Subprocess execution with timeouts and line streaming
//!
//! Every external tool (the runtime, its server, winetricks, package queries and the
//! installer itself) is launched through a [`CommandRunner`] so the pipeline can be driven
//! against a recording double in tests. [`SystemRunner`] spawns each command in its own
//! process group: the runtime forks helpers that would otherwise outlive a timeout.

use crate::error::{AffinityError, Result};
use command_group::CommandGroup;
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// A fully described subprocess invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Applied on top of the inherited environment
    pub env: Vec<(String, OsString)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.env.push((key.into(), value.as_ref().to_os_string()));
        self
    }

    pub fn envs(mut self, vars: &[(String, OsString)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// File name of the program, used for log lines and test assertions
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Shell-like rendering for logs and error messages
    pub fn display(&self) -> String {
        let mut rendered = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

/// Result of a finished subprocess
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Executes subprocesses for the pipeline
pub trait CommandRunner {
    /// Run with output forwarded line by line to `on_line` as it arrives
    fn stream(&self, spec: &CommandSpec, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput>;

    /// Run with captured output
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.stream(spec, &mut |_| {})
    }

    /// Whether commands are only logged
    fn is_dry_run(&self) -> bool {
        false
    }
}

pub type SharedRunner = Arc<dyn CommandRunner + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Channel {
    Stdout,
    Stderr,
}

/// Runs commands on the host in their own process group
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    dry_run: bool,
}

impl SystemRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn shared(dry_run: bool) -> SharedRunner {
        Arc::new(Self::new(dry_run))
    }
}

impl CommandRunner for SystemRunner {
    fn stream(&self, spec: &CommandSpec, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput> {
        if self.dry_run {
            info!("[dry-run] {}", spec.display());
            return Ok(CommandOutput::ok(""));
        }

        debug!("Running: {} (timeout {}s)", spec.display(), spec.timeout.as_secs());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command
            .group_spawn()
            .map_err(|e| AffinityError::CommandExecution {
                command: spec.display(),
                error: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.inner().stdout.take() {
            spawn_reader(stdout, Channel::Stdout, tx.clone());
        }
        if let Some(stderr) = child.inner().stderr.take() {
            spawn_reader(stderr, Channel::Stderr, tx.clone());
        }
        drop(tx);

        let deadline = Instant::now() + spec.timeout;
        let mut output = CommandOutput::default();
        let mut readers_done = false;

        let status = loop {
            if readers_done {
                thread::sleep(POLL_INTERVAL);
            } else {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok((channel, line)) => collect(&mut output, channel, &line, on_line),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => readers_done = true,
                }
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }

            if Instant::now() >= deadline {
                warn!("Timed out, killing process group: {}", spec.display());
                if let Err(e) = child.kill() {
                    debug!("Failed to kill process group: {}", e);
                }
                let _ = child.wait();
                return Err(AffinityError::CommandTimeout {
                    command: spec.display(),
                    seconds: spec.timeout.as_secs(),
                });
            }
        };

        // Helpers that inherited the pipes may keep them open after the child exits
        while let Ok((channel, line)) = rx.recv_timeout(DRAIN_GRACE) {
            collect(&mut output, channel, &line, on_line);
        }

        output.code = status.code();
        output.success = status.success();
        debug!("{} exited with {:?}", spec.program_name(), output.code);
        Ok(output)
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

fn collect(output: &mut CommandOutput, channel: Channel, line: &str, on_line: &mut dyn FnMut(&str)) {
    on_line(line);
    let buffer = match channel {
        Channel::Stdout => &mut output.stdout,
        Channel::Stderr => &mut output.stderr,
    };
    buffer.push_str(line);
    buffer.push('\n');
}

fn spawn_reader<R: Read + Send + 'static>(pipe: R, channel: Channel, tx: Sender<(Channel, String)>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
                    if tx.send((channel, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Locate an executable on PATH
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Whether `path` is an executable regular file
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_both_streams() {
        let runner = SystemRunner::new(false);
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .timeout(Duration::from_secs(10));

        let mut seen = Vec::new();
        let output = runner.stream(&spec, &mut |line| seen.push(line.to_string())).unwrap();

        assert_eq!(output.code, Some(3));
        assert!(!output.success);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn applies_environment() {
        let runner = SystemRunner::new(false);
        let spec = CommandSpec::new("sh")
            .args(["-c", "printf %s \"$AFFINITY_TEST_VALUE\""])
            .env("AFFINITY_TEST_VALUE", "prefix-42");

        let output = runner.run(&spec).unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "prefix-42");
    }

    #[test]
    fn timeout_is_reported_not_raised() {
        let runner = SystemRunner::new(false);
        let spec = CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(300));

        let started = Instant::now();
        let err = runner.run(&spec).unwrap_err();
        assert!(matches!(err, AffinityError::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_an_execution_error() {
        let runner = SystemRunner::new(false);
        let spec = CommandSpec::new("/nonexistent/affinity-test-binary");
        assert!(matches!(
            runner.run(&spec),
            Err(AffinityError::CommandExecution { .. })
        ));
    }

    #[test]
    fn dry_run_spawns_nothing() {
        let runner = SystemRunner::new(true);
        let spec = CommandSpec::new("/nonexistent/affinity-test-binary").arg("--install");
        let output = runner.run(&spec).unwrap();
        assert!(output.success);
        assert!(runner.is_dry_run());
    }

    #[test]
    fn display_renders_program_and_args() {
        let spec = CommandSpec::new("/usr/bin/wine").args(["regedit", "/S", "C:\\x.reg"]);
        assert_eq!(spec.display(), "/usr/bin/wine regedit /S C:\\x.reg");
        assert_eq!(spec.program_name(), "wine");
    }
}
