//! Streaming bridge between an HTTP exchange and `git-receive-pack`.
//!
//! The request body is pumped into the subprocess' stdin by one task while a
//! second task forwards stdout into a bounded channel that backs the response
//! body.  Both directions await the other side (`write_all` on the pipe,
//! `send` on the channel), so a slow peer slows the subprocess down instead of
//! growing a buffer.
//!
//! The forwarding task owns the child process and the [`RepoLease`].  It ends
//! when the subprocess has exited, reporting a [`PackCompletion`] that hands
//! the lease back to the caller.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use prometheus_client::metrics::gauge::Gauge;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use crate::error::BridgeError;
use crate::git::bare_repo::RepoLease;
use crate::git::pktline::service_advertisement;

/// Name of the only service this bridge speaks.
pub const RECEIVE_PACK_SERVICE: &str = "git-receive-pack";

/// Chunks buffered between the subprocess and the HTTP response.
const CHANNEL_CAPACITY: usize = 32;

/// Bytes of stderr kept for diagnostics; the rest is drained and dropped.
const STDERR_LIMIT: u64 = 64 * 1024;

/// How long stderr may stay open once the subprocess has exited.
const STDERR_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which half of the push exchange a request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOperation {
    /// `GET .../info/refs?service=git-receive-pack`
    AdvertiseRefs,
    /// `POST .../git-receive-pack`
    ReceivePack,
}

impl ProtocolOperation {
    /// Arguments passed to the pack executable, excluding the repository.
    pub fn args(self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--stateless-rpc")];
        if self == ProtocolOperation::AdvertiseRefs {
            args.push(OsString::from("--advertise-refs"));
        }
        args
    }

    /// Bytes written to the response before any subprocess output.
    pub fn preamble(self) -> Option<Bytes> {
        match self {
            ProtocolOperation::AdvertiseRefs => Some(service_advertisement(RECEIVE_PACK_SERVICE)),
            ProtocolOperation::ReceivePack => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolOperation::AdvertiseRefs => "advertise_refs",
            ProtocolOperation::ReceivePack => "receive_pack",
        }
    }
}

/// How a pack exchange ended.
#[derive(Debug, Clone, Default)]
pub struct PackOutcome {
    /// Exit status, if the subprocess was reaped.
    pub status: Option<ExitStatus>,
    /// Request body bytes delivered to stdin.
    pub bytes_in: u64,
    /// Subprocess stdout bytes forwarded to the client.
    pub bytes_out: u64,
    /// The client stopped reading before the subprocess finished.
    pub client_gone: bool,
    /// The subprocess was killed for exceeding its lifetime.
    pub timed_out: bool,
}

impl PackOutcome {
    pub fn succeeded(&self) -> bool {
        !self.client_gone && !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

/// Handed back once the subprocess is gone.
#[derive(Debug)]
pub struct PackCompletion {
    pub outcome: PackOutcome,
    /// Still held: the repository cannot be removed until this is dropped.
    pub lease: RepoLease,
}

/// A running exchange: the response body and the handle that resolves after
/// the subprocess exited.
pub struct PackStream {
    pub body: Body,
    pub completion: JoinHandle<PackCompletion>,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ReceivePack {
    bin: PathBuf,
    timeout: Option<Duration>,
    active: Gauge,
}

impl ReceivePack {
    pub fn new(bin: impl Into<PathBuf>, timeout: Option<Duration>, active: Gauge) -> Self {
        Self {
            bin: bin.into(),
            timeout,
            active,
        }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    /// Spawn the pack executable against the leased repository and start
    /// streaming.
    ///
    /// Returns once the subprocess produced its first output (or exited).  A
    /// subprocess that exits non-zero without writing anything, or that times
    /// out before writing, is a [`BridgeError::SubprocessError`].
    #[instrument(skip(self, lease, request_body), fields(repo_id = %lease.repo_id(), op = operation.as_str()))]
    pub async fn run(
        &self,
        operation: ProtocolOperation,
        lease: RepoLease,
        request_body: Body,
    ) -> Result<PackStream, BridgeError> {
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut child = Command::new(&self.bin)
            .args(operation.args())
            .arg(lease.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::SubprocessError(format!(
                    "failed to spawn {}: {e}",
                    self.bin.display()
                ))
            })?;
        let active = ActiveGuard::new(self.active.clone());
        debug!(pid = child.id(), "pack subprocess spawned");

        let bytes_in = Arc::new(AtomicU64::new(0));
        let stdin_task = tokio::spawn(pump_request_body(
            request_body,
            child.stdin.take(),
            Arc::clone(&bytes_in),
        ));
        let stderr_task = tokio::spawn(collect_stderr(child.stderr.take()));
        let Some(stdout) = child.stdout.take() else {
            stdin_task.abort();
            kill(&mut child).await;
            return Err(BridgeError::SubprocessError(
                "pack subprocess stdout not captured".into(),
            ));
        };
        let mut stdout = ReaderStream::new(stdout);

        let first = match until(deadline, stdout.next()).await {
            Some(Some(Ok(chunk))) => Some(chunk),
            Some(None) => None,
            Some(Some(Err(e))) => {
                stdin_task.abort();
                kill(&mut child).await;
                return Err(BridgeError::SubprocessError(format!(
                    "failed to read pack output: {e}"
                )));
            }
            None => {
                stdin_task.abort();
                kill(&mut child).await;
                return Err(BridgeError::SubprocessError(
                    "pack subprocess timed out before producing output".into(),
                ));
            }
        };

        // No output at all: the exit status decides whether this was an error.
        let mut exited = None;
        if first.is_none() {
            let status = match until(deadline, child.wait()).await {
                Some(Ok(status)) => status,
                Some(Err(e)) => {
                    stdin_task.abort();
                    return Err(BridgeError::SubprocessError(format!(
                        "failed to wait on pack subprocess: {e}"
                    )));
                }
                None => {
                    stdin_task.abort();
                    kill(&mut child).await;
                    return Err(BridgeError::SubprocessError(
                        "pack subprocess timed out".into(),
                    ));
                }
            };
            if !status.success() {
                stdin_task.abort();
                let stderr = stderr_text(stderr_task).await;
                return Err(BridgeError::SubprocessError(format!(
                    "{} exited with {status} without output: {}",
                    self.bin.display(),
                    stderr.trim()
                )));
            }
            exited = Some(status);
        }

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_CAPACITY);
        let pump = Pump {
            child,
            stdout,
            stdin_task,
            stderr_task,
            bytes_in,
            deadline,
            lease,
            _active: active,
        };
        let completion = tokio::spawn(pump.forward(tx, operation.preamble(), first, exited));

        Ok(PackStream {
            body: Body::from_stream(ReceiverStream::new(rx)),
            completion,
        })
    }
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

struct Pump {
    child: Child,
    stdout: ReaderStream<ChildStdout>,
    stdin_task: JoinHandle<()>,
    stderr_task: JoinHandle<String>,
    bytes_in: Arc<AtomicU64>,
    deadline: Option<Instant>,
    lease: RepoLease,
    _active: ActiveGuard,
}

impl Pump {
    async fn forward(
        mut self,
        tx: mpsc::Sender<std::io::Result<Bytes>>,
        preamble: Option<Bytes>,
        first: Option<Bytes>,
        exited: Option<ExitStatus>,
    ) -> PackCompletion {
        let mut outcome = PackOutcome {
            status: exited,
            ..PackOutcome::default()
        };

        if let Some(preamble) = preamble {
            self.send(&tx, preamble, &mut outcome, false).await;
        }
        if let Some(chunk) = first {
            self.send(&tx, chunk, &mut outcome, true).await;
        }

        while outcome.status.is_none() && !outcome.client_gone && !outcome.timed_out {
            let next = until(self.deadline, self.stdout.next()).await;
            match next {
                None => outcome.timed_out = true,
                Some(None) => break,
                Some(Some(Ok(chunk))) => self.send(&tx, chunk, &mut outcome, true).await,
                Some(Some(Err(e))) => {
                    warn!(error = %e, "failed to read pack output");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }

        if outcome.client_gone || outcome.timed_out {
            warn!(
                client_gone = outcome.client_gone,
                timed_out = outcome.timed_out,
                "terminating pack subprocess"
            );
            self.stdin_task.abort();
            kill(&mut self.child).await;
        }

        if outcome.status.is_none() {
            outcome.status = match until(self.deadline, self.child.wait()).await {
                Some(Ok(status)) => Some(status),
                Some(Err(e)) => {
                    warn!(error = %e, "failed to wait on pack subprocess");
                    None
                }
                None => {
                    outcome.timed_out = true;
                    kill(&mut self.child).await;
                    self.child.try_wait().ok().flatten()
                }
            };
        }

        // The subprocess is gone; a client still holding its request body
        // open must not keep the exchange alive.
        self.stdin_task.abort();
        outcome.bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let stderr = stderr_text(self.stderr_task).await;

        match outcome.status {
            Some(status) if status.success() => {
                info!(
                    %status,
                    bytes_in = outcome.bytes_in,
                    bytes_out = outcome.bytes_out,
                    "pack exchange complete"
                );
            }
            status => {
                warn!(
                    status = ?status,
                    stderr = %stderr.trim(),
                    "pack subprocess did not exit cleanly"
                );
            }
        }
        if !stderr.is_empty() {
            debug!(stderr = %stderr.trim(), "pack subprocess stderr");
        }

        // `tx` is dropped here, after exit, which ends the response body.
        drop(tx);
        PackCompletion {
            outcome,
            lease: self.lease,
        }
    }

    async fn send(
        &self,
        tx: &mpsc::Sender<std::io::Result<Bytes>>,
        chunk: Bytes,
        outcome: &mut PackOutcome,
        counts: bool,
    ) {
        if outcome.client_gone || outcome.timed_out {
            return;
        }
        let len = chunk.len() as u64;
        match until(self.deadline, tx.send(Ok(chunk))).await {
            Some(Ok(())) => {
                if counts {
                    outcome.bytes_out += len;
                }
            }
            Some(Err(_)) => outcome.client_gone = true,
            None => outcome.timed_out = true,
        }
    }
}

/// Copy the request body into the subprocess' stdin, then close it.
async fn pump_request_body(body: Body, stdin: Option<ChildStdin>, total: Arc<AtomicU64>) {
    let Some(mut stdin) = stdin else {
        return;
    };
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(error = %e, "pack subprocess closed stdin early");
                    break;
                }
                total.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "request body aborted");
                break;
            }
        }
    }
    let _ = stdin.shutdown().await;
}

async fn collect_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = (&mut stderr).take(STDERR_LIMIT).read_to_end(&mut buf).await;
    drain(&mut stderr).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Collected stderr, giving up after [`STDERR_GRACE`] when something else
/// (a leftover grandchild) still holds the pipe open.
async fn stderr_text(task: JoinHandle<String>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(STDERR_GRACE, task).await {
        Ok(text) => text.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut R) {
    let _ = tokio::io::copy(reader, &mut tokio::io::sink()).await;
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to kill pack subprocess");
    }
}

/// Await `fut`, giving up at `deadline`.  `None` means the deadline passed.
async fn until<F: std::future::Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Keeps the active-subprocess gauge accurate on every exit path.
struct ActiveGuard(Gauge);

impl ActiveGuard {
    fn new(gauge: Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::git::bare_repo::BareRepoStore;
    use crate::testutil::{fake_git, script};

    struct Fixture {
        tmp: tempfile::TempDir,
        store: Arc<BareRepoStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let store = Arc::new(BareRepoStore::new(tmp.path().join("bare"), fake_git(tmp.path())));
            Self { tmp, store }
        }

        fn bridge(&self, body: &str, timeout: Option<Duration>) -> ReceivePack {
            let bin = script(self.tmp.path(), "receive-pack", body);
            ReceivePack::new(bin, timeout, Gauge::default())
        }

        async fn lease(&self) -> RepoLease {
            self.store.ensure_ready("alice/demo").await.unwrap()
        }
    }

    #[test]
    fn argument_lists() {
        assert_eq!(
            ProtocolOperation::AdvertiseRefs.args(),
            vec![OsString::from("--stateless-rpc"), OsString::from("--advertise-refs")]
        );
        assert_eq!(
            ProtocolOperation::ReceivePack.args(),
            vec![OsString::from("--stateless-rpc")]
        );
        assert!(ProtocolOperation::ReceivePack.preamble().is_none());
    }

    #[tokio::test]
    async fn advertisement_is_framed_before_output() {
        let fx = Fixture::new();
        let args_log = fx.tmp.path().join("args");
        let bridge = fx.bridge(
            &format!("echo \"$@\" > {}\nprintf 'ADVERTISEMENT'", args_log.display()),
            None,
        );
        let lease = fx.lease().await;
        let repo = lease.path().to_path_buf();

        let stream = bridge
            .run(ProtocolOperation::AdvertiseRefs, lease, Body::empty())
            .await
            .unwrap();
        let body = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        assert_eq!(
            &body[..],
            b"001f# service=git-receive-pack\n0000ADVERTISEMENT".as_slice()
        );

        let done = stream.completion.await.unwrap();
        assert!(done.outcome.succeeded());
        assert_eq!(done.outcome.bytes_out, "ADVERTISEMENT".len() as u64);
        let args = std::fs::read_to_string(&args_log).unwrap();
        assert_eq!(
            args.trim(),
            format!("--stateless-rpc --advertise-refs {}", repo.display())
        );
    }

    #[tokio::test]
    async fn request_body_is_streamed_through() {
        let fx = Fixture::new();
        let bridge = fx.bridge("cat", None);
        let lease = fx.lease().await;

        let stream = bridge
            .run(ProtocolOperation::ReceivePack, lease, Body::from("0000PACKDATA"))
            .await
            .unwrap();
        let body = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"0000PACKDATA".as_slice());

        let done = stream.completion.await.unwrap();
        assert!(done.outcome.succeeded());
        assert_eq!(done.outcome.bytes_in, 12);
        assert_eq!(done.outcome.bytes_out, 12);
    }

    #[tokio::test]
    async fn open_request_body_does_not_block_completion() {
        let fx = Fixture::new();
        let bridge = fx.bridge("head -c 4 >/dev/null\nprintf 'ok'", None);
        let lease = fx.lease().await;

        // One chunk, then a body that never ends.
        let chunks = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"0000"))])
            .chain(futures::stream::pending());
        let stream = bridge
            .run(ProtocolOperation::ReceivePack, lease, Body::from_stream(chunks))
            .await
            .unwrap();
        let body = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok".as_slice());

        let done = tokio::time::timeout(Duration::from_secs(5), stream.completion)
            .await
            .expect("completion waited on the request body")
            .unwrap();
        assert!(done.outcome.succeeded());
        assert_eq!(done.outcome.bytes_in, 4);
        drop(done);
        tokio::time::timeout(Duration::from_secs(5), fx.store.remove("alice/demo"))
            .await
            .expect("lease was not released")
            .unwrap();
    }

    #[tokio::test]
    async fn silent_failure_is_subprocess_error() {
        let fx = Fixture::new();
        let bridge = fx.bridge("echo 'fatal: corrupt' >&2\nexit 1", None);
        let lease = fx.lease().await;

        let err = bridge
            .run(ProtocolOperation::ReceivePack, lease, Body::empty())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::SubprocessError(_)));
        assert!(err.to_string().contains("fatal: corrupt"));
        // The lease went away with the error.
        fx.store.remove("alice/demo").await.unwrap();
    }

    #[tokio::test]
    async fn failure_after_output_still_streams() {
        let fx = Fixture::new();
        let bridge = fx.bridge("printf 'partial'\nexit 2", None);
        let lease = fx.lease().await;

        let stream = bridge
            .run(ProtocolOperation::ReceivePack, lease, Body::empty())
            .await
            .unwrap();
        let body = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"partial".as_slice());
        let done = stream.completion.await.unwrap();
        assert!(!done.outcome.succeeded());
        assert_eq!(done.outcome.status.and_then(|s| s.code()), Some(2));
    }

    #[tokio::test]
    async fn empty_successful_output_is_not_an_error() {
        let fx = Fixture::new();
        let bridge = fx.bridge("exit 0", None);
        let lease = fx.lease().await;

        let stream = bridge
            .run(ProtocolOperation::AdvertiseRefs, lease, Body::empty())
            .await
            .unwrap();
        let body = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"001f# service=git-receive-pack\n0000".as_slice());
        assert!(stream.completion.await.unwrap().outcome.succeeded());
    }

    #[tokio::test]
    async fn client_disconnect_kills_subprocess() {
        let fx = Fixture::new();
        let bridge = fx.bridge("exec yes pack", None);
        let lease = fx.lease().await;

        let stream = bridge
            .run(ProtocolOperation::ReceivePack, lease, Body::empty())
            .await
            .unwrap();
        let mut data = stream.body.into_data_stream();
        assert!(data.next().await.unwrap().is_ok());
        drop(data);

        let done = tokio::time::timeout(Duration::from_secs(10), stream.completion)
            .await
            .expect("subprocess was not terminated")
            .unwrap();
        assert!(done.outcome.client_gone);
        assert!(!done.outcome.succeeded());
    }

    #[tokio::test]
    async fn silent_subprocess_times_out() {
        let fx = Fixture::new();
        let bridge = fx.bridge("exec sleep 30", Some(Duration::from_millis(200)));
        let lease = fx.lease().await;

        let started = std::time::Instant::now();
        let err = bridge
            .run(ProtocolOperation::ReceivePack, lease, Body::empty())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn lease_is_held_until_completion() {
        let fx = Fixture::new();
        let bridge = fx.bridge("printf 'x'\nsleep 0.3", None);
        let lease = fx.lease().await;

        let stream = bridge
            .run(ProtocolOperation::ReceivePack, lease, Body::empty())
            .await
            .unwrap();
        let remover = {
            let store = Arc::clone(&fx.store);
            tokio::spawn(async move { store.remove("alice/demo").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished());

        let _ = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        let done = stream.completion.await.unwrap();
        assert!(done.outcome.succeeded());
        drop(done);
        remover.await.unwrap().unwrap();
        assert!(!fx.store.exists("alice/demo").await);
    }

    #[tokio::test]
    async fn active_gauge_returns_to_zero() {
        let fx = Fixture::new();
        let gauge = Gauge::default();
        let bin = script(fx.tmp.path(), "receive-pack", "printf 'x'");
        let bridge = ReceivePack::new(bin, None, gauge.clone());

        let stream = bridge
            .run(ProtocolOperation::ReceivePack, fx.lease().await, Body::empty())
            .await
            .unwrap();
        assert_eq!(gauge.get(), 1);
        let _ = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        drop(stream.completion.await.unwrap());
        assert_eq!(gauge.get(), 0);
    }
}
