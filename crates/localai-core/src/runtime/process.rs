//! A single backend subprocess.
//!
//! Backends are started as `<program> [args] --addr <host:port>` on a free
//! local port and are considered ready once the readiness probe succeeds.
//! Their output is forwarded to tracing and the last lines are kept so a
//! failed start can report why.

use super::registry::BackendCommand;
use crate::cancel::CancellationToken;
use crate::config::{EnvVars, RuntimeConfig};
use crate::error::{LocalAiError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Checks whether a started backend accepts connections.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn ready(&self, address: &str) -> bool;
}

/// Ready once a TCP connection to the backend address succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn ready(&self, address: &str) -> bool {
        matches!(
            tokio::time::timeout(
                Duration::from_secs(1),
                tokio::net::TcpStream::connect(address)
            )
            .await,
            Ok(Ok(_))
        )
    }
}

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub message: String,
}

/// Everything needed to start one backend.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub model: String,
    pub command: BackendCommand,
    pub host: String,
    pub env: Vec<(String, String)>,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl LaunchSpec {
    pub fn new(model: impl Into<String>, command: BackendCommand) -> Self {
        Self {
            model: model.into(),
            command,
            host: RuntimeConfig::BACKEND_HOST.to_string(),
            env: Vec::new(),
            ready_timeout: RuntimeConfig::READY_TIMEOUT,
            ready_poll_interval: RuntimeConfig::READY_POLL_INTERVAL,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }
}

type LogTail = Arc<Mutex<VecDeque<String>>>;

/// A running backend. Dropping it kills the process.
#[derive(Debug)]
pub struct BackendProcess {
    model: String,
    pid: Option<u32>,
    address: String,
    exit: watch::Receiver<Option<ExitInfo>>,
    log_tail: LogTail,
    kill: CancellationToken,
}

impl BackendProcess {
    /// Start the backend and wait until `probe` reports it ready.
    ///
    /// On cancellation, timeout or early exit the process is killed and an
    /// error carrying the captured output tail is returned.
    pub async fn launch(
        spec: &LaunchSpec,
        probe: &dyn ReadinessProbe,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let (process, readers) = Self::spawn(spec)?;
        let mut exit = process.exit.clone();
        let deadline = tokio::time::Instant::now() + spec.ready_timeout;

        loop {
            let exited = exit.borrow().clone();
            if let Some(info) = exited {
                for reader in readers {
                    let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
                }
                return Err(LocalAiError::LaunchFailed {
                    model: spec.model.clone(),
                    message: process.failure_message(&format!("exited during startup ({})", info.message)),
                });
            }

            if probe.ready(&process.address).await && exit.borrow().is_none() {
                info!(
                    model = %spec.model,
                    "Backend ready at {} (pid {:?})",
                    process.address,
                    process.pid
                );
                return Ok(process);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                process.kill.cancel();
                return Err(LocalAiError::LaunchFailed {
                    model: spec.model.clone(),
                    message: process.failure_message(&format!(
                        "not ready after {:?}",
                        spec.ready_timeout
                    )),
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(model = %spec.model, "Startup cancelled, killing backend");
                    process.kill.cancel();
                    return Err(LocalAiError::Cancelled);
                }
                _ = exit.changed() => {}
                _ = tokio::time::sleep_until((now + spec.ready_poll_interval).min(deadline)) => {}
            }
        }
    }

    fn spawn(spec: &LaunchSpec) -> Result<(Self, Vec<JoinHandle<()>>)> {
        let program = &spec.command.program;
        ensure_executable(program);

        let port = free_port(&spec.host)?;
        let address = format!("{}:{}", spec.host, port);

        let mut cmd = Command::new(program);
        cmd.args(&spec.command.args)
            .arg("--addr")
            .arg(&address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.command.work_dir {
            cmd.current_dir(dir);
        }
        if std::env::var_os(EnvVars::SKIP_LIBRARY_PATH).is_none() {
            if let Some(lib_dir) = spec.command.lib_dir().filter(|d| d.is_dir()) {
                cmd.env("LD_LIBRARY_PATH", prepend_library_path(&lib_dir));
            }
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        debug!(model = %spec.model, "Starting {} --addr {}", program.display(), address);
        let mut child = cmd.spawn().map_err(|e| LocalAiError::LaunchFailed {
            model: spec.model.clone(),
            message: format!("failed to start {}: {}", program.display(), e),
        })?;
        let pid = child.id();

        let log_tail: LogTail = Arc::new(Mutex::new(VecDeque::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_output(spec.model.clone(), stdout, log_tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_output(spec.model.clone(), stderr, log_tail.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let supervisor_kill = kill.clone();
        let model = spec.model.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = supervisor_kill.cancelled() => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    message: status.to_string(),
                },
                Err(e) => ExitInfo {
                    code: None,
                    message: e.to_string(),
                },
            };
            debug!(model = %model, "Backend exited: {}", info.message);
            let _ = exit_tx.send(Some(info));
        });

        Ok((
            Self {
                model: spec.model.clone(),
                pid,
                address,
                exit: exit_rx,
                log_tail,
                kill,
            },
            readers,
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Exit information once the process has ended.
    pub fn exited(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    /// Resolve when the process ends.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        let info = exit
            .wait_for(Option::is_some)
            .await
            .map(|info| (*info).clone())
            .ok()
            .flatten();
        info.unwrap_or_else(|| ExitInfo {
            code: None,
            message: "process supervisor stopped".to_string(),
        })
    }

    pub fn log_tail(&self) -> Vec<String> {
        lock_tail(&self.log_tail).iter().cloned().collect()
    }

    /// Interrupt the process and kill it if it is still alive after `grace`.
    pub async fn stop(&self, grace: Duration) {
        if self.exited().is_some() {
            return;
        }

        self.interrupt();
        let mut exit = self.exit.clone();
        let graceful = tokio::time::timeout(grace, exit.wait_for(Option::is_some))
            .await
            .is_ok();
        if !graceful {
            warn!(model = %self.model, "Backend ignored SIGINT for {:?}, killing", grace);
            self.kill.cancel();
            let _ = exit.wait_for(Option::is_some).await;
        }
        info!(model = %self.model, "Backend stopped");
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            self.kill.cancel();
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
            if e != nix::errno::Errno::ESRCH {
                warn!(model = %self.model, "Failed to interrupt pid {}: {}", pid, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {
        self.kill.cancel();
    }

    fn failure_message(&self, reason: &str) -> String {
        let tail = self.log_tail();
        if tail.is_empty() {
            reason.to_string()
        } else {
            format!("{}\n{}", reason, tail.join("\n"))
        }
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn lock_tail(tail: &LogTail) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    tail.lock().unwrap_or_else(|e| e.into_inner())
}

fn forward_output<R>(model: String, stream: R, tail: LogTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(model = %model, "{}", line);
            let mut tail = lock_tail(&tail);
            if tail.len() == RuntimeConfig::LOG_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

fn free_port(host: &str) -> Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

fn prepend_library_path(lib_dir: &Path) -> std::ffi::OsString {
    let mut paths = vec![lib_dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("LD_LIBRARY_PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).unwrap_or_else(|_| lib_dir.as_os_str().to_owned())
}

#[cfg(unix)]
fn ensure_executable(program: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(program) else {
        return;
    };
    let mut permissions = metadata.permissions();
    if permissions.mode() & 0o111 == 0 {
        permissions.set_mode(permissions.mode() | 0o755);
        if let Err(e) = std::fs::set_permissions(program, permissions) {
            warn!("Failed to make {} executable: {}", program.display(), e);
        }
    }
}

#[cfg(not(unix))]
fn ensure_executable(_program: &Path) {}
