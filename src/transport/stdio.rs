//! Child-process transport
//!
//! Spawns the upstream MCP server and exchanges newline-delimited JSON with it
//! over stdin/stdout. The child is owned by a supervisor task for its whole
//! lifetime: the task reports the exit reason exactly once and, when asked to
//! close, runs the escalating shutdown sequence (close stdin, SIGTERM, SIGKILL).

use std::{
    collections::HashMap,
    fmt,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::mcp::message::Message;
use crate::transport::{
    framing::{encode_line, ReadBuffer},
    CloseReason, MessageHandler, Transport,
};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Receives raw stderr chunks from the child. Never parsed.
pub type DiagnosticSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Clone, Default)]
pub enum StderrMode {
    #[default]
    Inherit,
    Pipe(DiagnosticSink),
}

impl fmt::Debug for StderrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inherit => f.write_str("Inherit"),
            Self::Pipe(_) => f.write_str("Pipe(..)"),
        }
    }
}

/// Grace periods of the shutdown sequence.
#[derive(Debug, Clone)]
pub struct ShutdownGrace {
    /// Time to wait after closing stdin before sending SIGTERM.
    pub stdin_close: Duration,
    /// Time to wait after SIGTERM before sending SIGKILL.
    pub sigterm: Duration,
}

impl Default for ShutdownGrace {
    fn default() -> Self {
        Self {
            stdin_close: Duration::from_secs(1),
            sigterm: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StdioParams {
    pub command: String,
    pub args: Vec<String>,
    /// When set, the child sees exactly this environment.
    pub env: Option<HashMap<String, String>>,
    pub stderr: StderrMode,
    pub shutdown: ShutdownGrace,
}

impl StdioParams {
    pub fn new(command: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().collect(),
            env: None,
            stderr: StderrMode::Inherit,
            shutdown: ShutdownGrace::default(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownGrace) -> Self {
        self.shutdown = shutdown;
        self
    }
}

pub struct StdioClientTransport {
    params: StdioParams,
    started: AtomicBool,
    closing: AtomicBool,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl StdioClientTransport {
    pub fn new(params: StdioParams) -> Self {
        Self {
            params,
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            stdin: Arc::new(Mutex::new(None)),
            shutdown_tx: StdMutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.params.command);
        command
            .args(&self.params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        match &self.params.stderr {
            StderrMode::Inherit => command.stderr(Stdio::inherit()),
            StderrMode::Pipe(_) => command.stderr(Stdio::piped()),
        };

        if let Some(env) = &self.params.env {
            command.env_clear().envs(env);
        }
        command
    }
}

#[async_trait]
impl Transport for StdioClientTransport {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(err) => {
                let reason = err.to_string();
                warn!(command = %self.params.command, error = %reason, "failed to spawn upstream");
                handler.on_error(TransportError::Spawn {
                    command: self.params.command.clone(),
                    reason: reason.clone(),
                });
                handler.on_close(CloseReason::SpawnFailed {
                    reason: reason.clone(),
                });
                return Err(TransportError::Spawn {
                    command: self.params.command.clone(),
                    reason,
                });
            }
        };

        let pid = child.id();
        info!(command = %self.params.command, pid = ?pid, state = "running", "upstream process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::NotConnected)?;
        *self.stdin.lock().await = child.stdin.take();

        if let (StderrMode::Pipe(sink), Some(stderr)) = (&self.params.stderr, child.stderr.take()) {
            tokio::spawn(pump_diagnostics(stderr, sink.clone()));
        }

        let reader = tokio::spawn(read_messages(stdout, handler.clone()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            *slot = Some(shutdown_tx);
        }

        let supervisor = tokio::spawn(supervise(
            child,
            self.stdin.clone(),
            reader,
            shutdown_rx,
            self.params.shutdown.clone(),
            handler,
        ));
        *self.supervisor.lock().await = Some(supervisor);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let line = encode_line(&message)?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shutdown_tx = self.shutdown_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(());
        }

        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                warn!(error = %err, "upstream supervisor task failed");
            }
        }
        Ok(())
    }
}

async fn read_messages(mut stdout: impl AsyncRead + Unpin, handler: Arc<dyn MessageHandler>) {
    let mut buffer = ReadBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                buffer.append(&chunk[..read]);
                while let Some(next) = buffer.next_message() {
                    match next {
                        Ok(message) => handler.on_message(message),
                        Err(err) => handler.on_error(err),
                    }
                }
            }
            Err(err) => {
                handler.on_error(TransportError::Io(err));
                break;
            }
        }
    }

    if buffer.pending_bytes() > 0 {
        debug!(
            bytes = buffer.pending_bytes(),
            "discarding unterminated line at end of upstream output"
        );
    }
}

async fn pump_diagnostics(mut stderr: impl AsyncRead + Unpin, sink: DiagnosticSink) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    while let Ok(read) = stderr.read(&mut chunk).await {
        if read == 0 {
            break;
        }
        sink(&chunk[..read]);
    }
}

async fn supervise(
    mut child: Child,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    reader: JoinHandle<()>,
    mut shutdown_rx: oneshot::Receiver<()>,
    grace: ShutdownGrace,
    handler: Arc<dyn MessageHandler>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut shutdown_rx => None,
    };

    let reason = match exited {
        Some(status) => {
            stdin.lock().await.take();
            exit_reason(status)
        }
        None => terminate(&mut child, &stdin, &grace).await,
    };

    // Deliver whatever the child wrote before exiting ahead of the close.
    if tokio::time::timeout(grace.stdin_close, reader).await.is_err() {
        debug!("upstream stdout still open after exit");
    }

    info!(reason = ?reason, state = "stopped", "upstream process exited");
    handler.on_close(reason);
}

async fn terminate(
    child: &mut Child,
    stdin: &Mutex<Option<ChildStdin>>,
    grace: &ShutdownGrace,
) -> CloseReason {
    info!(state = "shutting_down", "closing upstream stdin");
    stdin.lock().await.take();

    match tokio::time::timeout(grace.stdin_close, child.wait()).await {
        Ok(status) => return exit_reason(status),
        Err(_) => debug!("upstream did not exit after stdin close"),
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = ?err, "SIGTERM failed");
            }
            match tokio::time::timeout(grace.sigterm, child.wait()).await {
                Ok(status) => return exit_reason(status),
                Err(_) => warn!(pid, "upstream did not exit after SIGTERM"),
            }
        }
    }

    warn!("killing upstream process");
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill upstream process");
    }
    exit_reason(child.wait().await)
}

fn exit_reason(status: std::io::Result<ExitStatus>) -> CloseReason {
    let status = match status {
        Ok(status) => status,
        Err(err) => {
            warn!(error = %err, "failed to collect upstream exit status");
            return CloseReason::Exited { code: -1 };
        }
    };

    if let Some(code) = status.code() {
        return CloseReason::Exited { code };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return CloseReason::Signalled { signal };
        }
    }

    CloseReason::Exited { code: -1 }
}
