//! Container runtime capability and its `docker` CLI implementation.
//!
//! Both the build stage and the run stage go through [`ContainerRuntime`].
//! Process handling follows one rule: every child started here is waited
//! for, and a child outliving its deadline or a cancellation is killed.

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::retry::Retryable;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long to keep draining output after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Build log fragments that point at daemon or registry connectivity rather
/// than at the project.
const TRANSIENT_BUILD_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "TLS handshake timeout",
    "i/o timeout",
    "connection reset by peer",
    "Temporary failure in name resolution",
    "toomanyrequests",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The runtime binary could not be started at all.
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Transient container runtime failure: {0}")]
    Transient(String),

    #[error("Container runtime failed: {0}")]
    Failed(String),

    #[error("Container operation cancelled")]
    Cancelled,
}

impl Retryable for RuntimeError {
    fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    Cancelled,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ProcessExit::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProcessExit::Signaled(signal);
            }
        }
        ProcessExit::Exited(-1)
    }
}

/// Exit and combined stdout/stderr of a finished child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit: ProcessExit,
    pub output: String,
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R, tx: mpsc::Sender<Vec<u8>>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Passes `result` through, first killing and reaping `child` if it is an
/// error so no process is left behind.
fn kill_on_error<T>(child: &mut Child, result: io::Result<T>) -> io::Result<T> {
    if let Err(e) = &result {
        tracing::warn!(pid = child.id(), error = %e, "Lost track of child process, killing it");
        let _ = child.kill();
        let _ = child.wait();
    }
    result
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> io::Result<ProcessExit> {
    let start_time = Instant::now();
    loop {
        let polled = child.try_wait();
        if let Some(status) = kill_on_error(child, polled)? {
            return Ok(ProcessExit::from_status(status));
        }
        let timed_out = timeout.is_some_and(|t| start_time.elapsed() > t);
        if timed_out || cancel.is_cancelled() {
            tracing::debug!(pid = child.id(), timed_out, "Killing child process");
            if let Err(e) = child.kill() {
                tracing::warn!(pid = child.id(), error = %e, "Failed to kill child process");
            }
            child.wait()?;
            return Ok(if timed_out {
                ProcessExit::TimedOut
            } else {
                ProcessExit::Cancelled
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Runs `cmd` to completion, capturing stdout and stderr interleaved.
///
/// The child is killed when `timeout` elapses or `cancel` trips; output
/// captured up to that point is still returned. Spawn failures are `Err`.
pub fn run_with_deadline(
    mut cmd: Command,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> io::Result<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx.clone());
    }
    drop(tx);

    let exit = wait_with_deadline(&mut child, timeout, cancel)?;

    // Grandchildren may hold the pipes open; stop draining once they go quiet.
    let mut captured = Vec::new();
    while let Ok(chunk) = rx.recv_timeout(DRAIN_GRACE) {
        captured.extend_from_slice(&chunk);
    }

    Ok(ProcessOutput {
        exit,
        output: String::from_utf8_lossy(&captured).into_owned(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildRequest {
    pub tag: String,
    pub context_dir: PathBuf,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildOutput {
    pub success: bool,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub image: String,
    pub name: String,
    pub platform: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub timeout: Duration,
    /// Leave the stopped container behind for inspection.
    pub keep: bool,
}

pub type RunOutput = ProcessOutput;

/// Builds images and runs disposable containers.
pub trait ContainerRuntime: Send + Sync {
    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Builds `request.tag` from `request.context_dir`. A build that ran and
    /// failed is `Ok` with `success == false`.
    fn build_image(
        &self,
        request: &ImageBuildRequest,
        cancel: &CancelToken,
    ) -> Result<ImageBuildOutput, RuntimeError>;

    /// Runs one container to completion or until `request.timeout`.
    ///
    /// On timeout or cancellation the container is stopped before returning.
    fn run_container(
        &self,
        request: &RunRequest,
        cancel: &CancelToken,
    ) -> Result<RunOutput, RuntimeError>;

    fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;
}

/// [`ContainerRuntime`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    memory_limit: Option<String>,
    cpus: Option<String>,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            memory_limit: None,
            cpus: None,
        }
    }

    pub fn with_limits(mut self, memory_limit: Option<String>, cpus: Option<String>) -> Self {
        self.memory_limit = memory_limit;
        self.cpus = cpus;
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn run(
        &self,
        cmd: Command,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ProcessOutput, RuntimeError> {
        run_with_deadline(cmd, timeout, cancel).map_err(|e| {
            RuntimeError::Unavailable(format!("Failed to run {:?}: {e}", self.binary))
        })
    }

    /// The argument list of `docker run` for `request`.
    pub fn run_args(&self, request: &RunRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            request.name.clone(),
            "--platform".to_string(),
            request.platform.clone(),
            "--network".to_string(),
            "none".to_string(),
        ];
        if let Some(memory) = &self.memory_limit {
            args.extend(["--memory".to_string(), memory.clone()]);
        }
        if let Some(cpus) = &self.cpus {
            args.extend(["--cpus".to_string(), cpus.clone()]);
        }
        for (key, value) in &request.env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        for mount in &request.mounts {
            let mode = if mount.read_only { ":ro" } else { "" };
            args.extend([
                "-v".to_string(),
                format!("{}:{}{mode}", mount.host.display(), mount.container),
            ]);
        }
        args.push(request.image.clone());
        args.extend(request.command.iter().cloned());
        args
    }

    fn stop_container(&self, name: &str, keep: bool) {
        let mut cmd = self.command();
        if keep {
            cmd.args(["kill", name]);
        } else {
            cmd.args(["rm", "-f", name]);
        }
        match self.run(cmd, Some(REMOVE_TIMEOUT), &CancelToken::new()) {
            Ok(out) if out.exit == ProcessExit::Exited(0) => {}
            Ok(out) => tracing::warn!(container = name, output = %out.output.trim(), "Failed to stop container"),
            Err(e) => tracing::warn!(container = name, error = %e, "Failed to stop container"),
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["image", "inspect", image]);
        let out = self.run(cmd, Some(INSPECT_TIMEOUT), &CancelToken::new())?;
        match out.exit {
            ProcessExit::Exited(0) => Ok(true),
            ProcessExit::Exited(_) => Ok(false),
            other => Err(RuntimeError::Transient(format!(
                "image inspect for {image} ended with {other:?}"
            ))),
        }
    }

    fn build_image(
        &self,
        request: &ImageBuildRequest,
        cancel: &CancelToken,
    ) -> Result<ImageBuildOutput, RuntimeError> {
        let mut cmd = self.command();
        cmd.arg("build")
            .args(["--platform", request.platform.as_str()])
            .args(["-t", request.tag.as_str()])
            .arg(&request.context_dir);
        tracing::info!(tag = %request.tag, context = ?request.context_dir, "Building image");

        let out = self.run(cmd, None, cancel)?;
        match out.exit {
            ProcessExit::Exited(0) => Ok(ImageBuildOutput {
                success: true,
                log: out.output,
            }),
            ProcessExit::Cancelled => Err(RuntimeError::Cancelled),
            _ if TRANSIENT_BUILD_MARKERS
                .iter()
                .any(|marker| out.output.contains(marker)) =>
            {
                Err(RuntimeError::Transient(format!(
                    "build of {} hit a connectivity error",
                    request.tag
                )))
            }
            _ => Ok(ImageBuildOutput {
                success: false,
                log: out.output,
            }),
        }
    }

    fn run_container(
        &self,
        request: &RunRequest,
        cancel: &CancelToken,
    ) -> Result<RunOutput, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(self.run_args(request));
        tracing::debug!(container = %request.name, image = %request.image, "Starting container");

        let out = self.run(cmd, Some(request.timeout), cancel)?;
        if matches!(out.exit, ProcessExit::TimedOut | ProcessExit::Cancelled) {
            // Killing the client does not stop the container itself.
            self.stop_container(&request.name, request.keep);
        }
        Ok(out)
    }

    fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", name]);
        let out = self.run(cmd, Some(REMOVE_TIMEOUT), &CancelToken::new())?;
        match out.exit {
            ProcessExit::Exited(0) => Ok(()),
            _ => Err(RuntimeError::Failed(format!(
                "removing container {name}: {}",
                out.output.trim()
            ))),
        }
    }
}
