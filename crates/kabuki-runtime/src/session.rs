//! Remote sessions
//!
//! A session runs one command on one host over a single transport
//! invocation. Its stdin carries a tar stream of the inputs and a generated
//! wrapper script; its stdout carries the command's live output, a separator
//! line, and a tar stream of the declared outputs. A second, independent
//! invocation kills the remote process and removes the working directory
//! once the session closes, whatever the reason.

use kabuki_core::{KabukiError, KabukiResult, SchedulerConfig};
use rand::Rng;
use std::borrow::Cow;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{self, GeneratedFile};
use crate::stream::{DemuxEnd, SeparatorDemux};
use crate::traits::Transport;

/// Where a session's live output goes
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Result of a session. A nonzero exit of the command is
/// `Err(KabukiError::RemoteCommand)`.
pub type SessionOutcome = KabukiResult<SessionSummary>;

/// What a session needs to run one command
pub struct SessionSpec {
    /// Name used for logs
    pub job_name: String,
    /// Shell command to run
    pub command: String,
    /// Environment exported before the command starts
    pub env: Vec<(String, String)>,
    /// Local paths staged into the remote working directory
    pub inputs: Vec<PathBuf>,
    /// Paths, relative to the remote working directory, collected afterwards
    pub outputs: Vec<PathBuf>,
    /// Local directory the outputs are unpacked into
    pub result_dir: PathBuf,
    /// Receives the command's stdout
    pub stdout: OutputSink,
    /// Receives the remote stderr
    pub stderr: OutputSink,
}

impl SessionSpec {
    /// A session that discards output and stages nothing.
    pub fn new(job_name: String, command: String, result_dir: PathBuf) -> Self {
        Self {
            job_name,
            command,
            env: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            result_dir,
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        }
    }
}

/// Session tuning taken from the scheduler configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Root of the per-job working directories on the remote host
    pub remote_root: String,
    /// Upper bound of the random delay before the cleanup connection
    pub cleanup_jitter: Duration,
    /// Time between the kill and the removal of the working directory
    pub kill_grace: Duration,
}

impl From<&SchedulerConfig> for SessionSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            remote_root: config.remote_root.clone(),
            cleanup_jitter: Duration::from_millis(config.cleanup_jitter_ms),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }
}

/// Generated names of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNames {
    pub job_id: String,
    pub work_dir: String,
    pub pid_file: String,
    pub wrapper: String,
    pub separator: String,
}

impl SessionNames {
    /// Fresh names; every random part is a v4 UUID.
    pub fn generate(remote_root: &str) -> Self {
        let job_id = Uuid::new_v4().simple().to_string();
        let root = remote_root.trim_end_matches('/');
        Self {
            work_dir: format!("{}/{}", root, job_id),
            pid_file: format!(".{}_pid.txt", Uuid::new_v4().simple()),
            wrapper: format!(".{}.sh", Uuid::new_v4().simple()),
            separator: Uuid::new_v4().simple().to_string(),
            job_id,
        }
    }
}

/// Summary of a session whose command exited with status 0
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub job_id: String,
    /// Bytes of stdout forwarded to the caller
    pub stdout_bytes: u64,
    /// Entries unpacked into the result directory
    pub collected_entries: usize,
    pub elapsed: Duration,
}

fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Wrapper that starts the command as its own process group, records its pid,
/// and exits with its status.
pub fn wrapper_script(
    command: &str,
    env: &[(String, String)],
    pid_file: &str,
) -> KabukiResult<String> {
    let mut script = String::from("set -m\n");
    for (name, value) in env {
        if !is_env_name(name) {
            return Err(KabukiError::Config(format!(
                "invalid environment variable name '{}'",
                name
            )));
        }
        script.push_str(&format!("export {}={}\n", name, quote(value)));
    }
    let command = quote(command);
    script.push_str("if command -v bash >/dev/null 2>&1; then\n");
    script.push_str(&format!("  bash -c {} &\n", command));
    script.push_str("else\n");
    script.push_str(&format!("  sh -c {} &\n", command));
    script.push_str("fi\n");
    script.push_str("pid=$!\n");
    script.push_str(&format!("echo \"$pid\" > {}\n", quote(pid_file)));
    script.push_str("echo \"started command $pid\" >&2\n");
    script.push_str("wait \"$pid\"\n");
    script.push_str("exit $?\n");
    Ok(script)
}

/// The script the transport hands to the remote shell.
///
/// Only generated names and quoted output paths appear here; the command
/// itself travels inside the archived wrapper.
pub fn remote_script(names: &SessionNames, outputs: &[PathBuf]) -> String {
    let wrapper = quote(&names.wrapper);
    let mut script = format!(
        "mkdir -p {dir} && cd {dir} && tar -xmf - && {{ \
         if command -v bash >/dev/null 2>&1; then run_with=bash; else run_with=sh; fi; \
         if command -v stdbuf >/dev/null 2>&1; then stdbuf -o0 -e0 \"$run_with\" {wrapper}; \
         else \"$run_with\" {wrapper}; fi; \
         rc=$?; printf '\\n%s:%s\\n' {sep} \"$rc\"; ",
        dir = quote(&names.work_dir),
        wrapper = wrapper,
        sep = quote(&names.separator),
    );
    if !outputs.is_empty() {
        let paths: Vec<String> = outputs
            .iter()
            .map(|p| quote(&p.to_string_lossy()))
            .collect();
        script.push_str(&format!("tar -cf - {}; ", paths.join(" ")));
    }
    script.push_str("exit \"$rc\"; }");
    script
}

/// Kill the recorded process group, give it a moment, remove the working
/// directory. Safe to run any number of times.
pub fn cleanup_script(names: &SessionNames, kill_grace: Duration) -> String {
    let dir = quote(&names.work_dir);
    let pid_path = quote(&format!("{}/{}", names.work_dir, names.pid_file));
    format!(
        "pid=$(cat {pid_path} 2>/dev/null); \
         if [ -n \"$pid\" ]; then \
         kill -TERM -\"$pid\" 2>/dev/null || kill -TERM \"$pid\" 2>/dev/null; \
         sleep {grace:.3}; fi; \
         rm -rf {dir}",
        pid_path = pid_path,
        grace = kill_grace.as_secs_f64(),
        dir = dir,
    )
}

/// Runs the cleanup script exactly once
struct SessionCleanup {
    transport: Arc<dyn Transport>,
    script: String,
    jitter: Duration,
    closed: bool,
}

impl SessionCleanup {
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let delay = random_delay(self.jitter);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        run_cleanup(self.transport.clone(), self.script.clone()).await;
    }
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            let script = self.script.clone();
            handle.spawn(run_cleanup(transport, script));
        } else {
            warn!("Session dropped outside a runtime; remote cleanup skipped");
        }
    }
}

fn random_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

async fn run_cleanup(transport: Arc<dyn Transport>, script: String) {
    let result = transport
        .shell_command(&script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => debug!(host = transport.host(), "Remote cleanup done"),
        Ok(status) => warn!(
            host = transport.host(),
            status = ?status.code(),
            "Remote cleanup exited unsuccessfully"
        ),
        Err(e) => warn!(host = transport.host(), error = %e, "Remote cleanup could not start"),
    }
}

/// One multiplexed remote execution
pub struct RemoteSession {
    transport: Arc<dyn Transport>,
    names: SessionNames,
    cleanup: SessionCleanup,
}

impl RemoteSession {
    pub fn new(transport: Arc<dyn Transport>, settings: &SessionSettings) -> Self {
        let names = SessionNames::generate(&settings.remote_root);
        let cleanup = SessionCleanup {
            transport: transport.clone(),
            script: cleanup_script(&names, settings.kill_grace),
            jitter: settings.cleanup_jitter,
            closed: false,
        };
        Self {
            transport,
            names,
            cleanup,
        }
    }

    pub fn names(&self) -> &SessionNames {
        &self.names
    }

    /// Run the session to completion or cancellation, then clean up.
    ///
    /// Cancellation is requested by sending on, or dropping, the sender of `cancel`.
    pub async fn run(mut self, mut spec: SessionSpec, cancel: oneshot::Receiver<()>) -> SessionOutcome {
        let result = self.execute(&mut spec, cancel).await;
        self.cleanup.close().await;
        match &result {
            Ok(summary) => info!(
                job = %spec.job_name,
                job_id = %summary.job_id,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Session finished"
            ),
            Err(e) => info!(job = %spec.job_name, job_id = %self.names.job_id, error = %e, "Session ended"),
        }
        result
    }

    async fn execute(
        &mut self,
        spec: &mut SessionSpec,
        mut cancel: oneshot::Receiver<()>,
    ) -> SessionOutcome {
        let started = Instant::now();
        let host = self.transport.host().to_string();

        let wrapper = wrapper_script(&spec.command, &spec.env, &self.names.pid_file)?;
        let generated = vec![GeneratedFile {
            name: self.names.wrapper.clone(),
            contents: wrapper.into_bytes(),
            mode: 0o755,
        }];
        let inputs = spec.inputs.clone();
        let archive = tokio::task::spawn_blocking(move || archive::pack(&generated, &inputs))
            .await
            .map_err(|e| KabukiError::Internal(format!("pack task failed: {}", e)))??;
        debug!(job = %spec.job_name, bytes = archive.len(), "Staged inputs");

        let script = remote_script(&self.names, &spec.outputs);
        let mut child = self
            .transport
            .shell_command(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                KabukiError::connectivity(&host, format!("failed to start transport: {}", e))
            })?;
        info!(job = %spec.job_name, job_id = %self.names.job_id, host = %host, "Session started");

        let mut demux = SeparatorDemux::new(&self.names.separator);
        let streamed = tokio::select! {
            res = stream_session(
                &mut child,
                archive,
                &mut demux,
                &mut spec.stdout,
                &mut spec.stderr,
                &host,
            ) => res,
            _ = &mut cancel => Err(KabukiError::Cancelled),
        };

        let (stdout_bytes, exit) = match streamed {
            Ok(done) => done,
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
        };

        match demux.finish() {
            DemuxEnd::Complete { status, trailer } => {
                let collected_entries =
                    collect(&spec.job_name, spec.result_dir.clone(), &spec.outputs, trailer)
                        .await?;
                if status != 0 {
                    return Err(KabukiError::RemoteCommand { status });
                }
                Ok(SessionSummary {
                    job_id: self.names.job_id.clone(),
                    stdout_bytes,
                    collected_entries,
                    elapsed: started.elapsed(),
                })
            }
            DemuxEnd::Truncated { unflushed } => {
                spec.stdout.write_all(&unflushed).await?;
                spec.stdout.flush().await?;
                if exit.code() == Some(255) {
                    Err(KabukiError::connectivity(
                        host,
                        "transport exited with status 255 before the command completed",
                    ))
                } else {
                    Err(KabukiError::Protocol(format!(
                        "output ended without a separator (transport exit status {:?})",
                        exit.code()
                    )))
                }
            }
        }
    }
}

/// Unpack the result archive into `dest`, creating it when nothing was declared.
async fn collect(
    job_name: &str,
    dest: PathBuf,
    outputs: &[PathBuf],
    trailer: Vec<u8>,
) -> KabukiResult<usize> {
    if outputs.is_empty() {
        tokio::fs::create_dir_all(&dest).await?;
        return Ok(0);
    }
    if trailer.is_empty() {
        return Err(KabukiError::Protocol(
            "outputs were declared but no result archive followed the separator".to_string(),
        ));
    }
    let count = tokio::task::spawn_blocking(move || archive::unpack(&trailer, &dest))
        .await
        .map_err(|e| KabukiError::Internal(format!("unpack task failed: {}", e)))??;
    if count == 0 {
        warn!(job = %job_name, "Result archive held none of the declared outputs");
    }
    Ok(count)
}

/// Feed stdin, forward stdout through the demultiplexer and stderr verbatim,
/// then wait for the transport to exit.
async fn stream_session(
    child: &mut Child,
    archive: Vec<u8>,
    demux: &mut SeparatorDemux,
    out_sink: &mut OutputSink,
    err_sink: &mut OutputSink,
    host: &str,
) -> KabukiResult<(u64, ExitStatus)> {
    let missing = || KabukiError::Internal("transport stdio not piped".to_string());
    let mut stdin = child.stdin.take().ok_or_else(missing)?;
    let mut stdout = child.stdout.take().ok_or_else(missing)?;
    let mut stderr = child.stderr.take().ok_or_else(missing)?;

    let feed_stdin = async move {
        if let Err(e) = stdin.write_all(&archive).await {
            debug!(error = %e, "Remote side closed its input early");
        }
        drop(stdin);
    };
    let forward_stdout = forward_output(&mut stdout, demux, out_sink, host);
    let forward_stderr = tokio::io::copy(&mut stderr, err_sink);

    let ((), forwarded, stderr_copied) = tokio::join!(feed_stdin, forward_stdout, forward_stderr);
    let forwarded = forwarded?;
    if let Err(e) = stderr_copied {
        warn!(error = %e, "Forwarding remote stderr failed");
    }

    let status = child.wait().await?;
    Ok((forwarded, status))
}

async fn forward_output<R: AsyncRead + Unpin>(
    stdout: &mut R,
    demux: &mut SeparatorDemux,
    sink: &mut OutputSink,
    host: &str,
) -> KabukiResult<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut forwarded = 0u64;
    loop {
        let n = stdout
            .read(&mut buf)
            .await
            .map_err(|e| KabukiError::connectivity(host, format!("reading output: {}", e)))?;
        if n == 0 {
            break;
        }
        let live = demux.feed(&buf[..n]);
        if !live.is_empty() {
            sink.write_all(&live).await?;
            sink.flush().await?;
            forwarded += live.len() as u64;
        }
    }
    Ok(forwarded)
}

/// Caller-side handle of a session running in the background
pub struct SessionHandle {
    job_id: String,
    task: JoinHandle<SessionOutcome>,
    cancel: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    /// Spawn `session` on the runtime. The closure receives the cancellation
    /// signal; dropping the handle without joining it cancels the session.
    pub fn spawn<F, Fut>(job_id: String, session: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = SessionOutcome> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(session(rx));
        Self {
            job_id,
            task,
            cancel: Some(tx),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Non-blocking completion check
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the session to stop. Cleanup still runs; `join` reports `Cancelled`.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the session, including its cleanup, to finish.
    pub async fn join(self) -> SessionOutcome {
        let SessionHandle { task, cancel, .. } = self;
        let _keep_open = cancel;
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(KabukiError::Internal(format!("session task failed: {}", e))),
        }
    }
}
