//! SSH transport: cached per-host clients, short executions, stream channels.
//!
//! Short executions share one long-lived authenticated client per host; each
//! call opens an independent remote session. libssh2 serialises I/O within a
//! session, so the client holds its session behind a lock and all blocking
//! work runs on the blocking thread pool.
//!
//! Long-running commands (the streams that keep remote BEAM nodes alive) get
//! a dedicated session each, owned by a reader task that drains output and
//! surfaces a close event. Closing the channel terminates the remote process
//! through loss of its standard-input holder.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beamctl_core::config::HostSpec;
use beamctl_core::error::CoreError;
use beamctl_core::text;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default deadline for short remote executions.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);
/// Command-prefix length carried in timeout errors.
const TIMEOUT_PREFIX_CHARS: usize = 80;
/// Idle sleep between non-blocking reads of a short execution.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Idle sleep between non-blocking reads of a stream channel.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Session plus health flag, shared between the async handle and the
/// blocking thread pool.
struct ClientInner {
    label: String,
    session: Mutex<ssh2::Session>,
    broken: AtomicBool,
}

/// A long-lived authenticated SSH client for one host.
///
/// Shared by all concurrent short executions against the host. Transport
/// failures mark the client broken; the host registry drops broken clients
/// and re-dials on the next operation.
pub struct SshClient {
    inner: Arc<ClientInner>,
}

impl SshClient {
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Relaxed)
    }

    /// Run `cmd` on the remote host and return its trimmed stdout.
    ///
    /// Opens a fresh remote session for this call. The timeout is enforced
    /// by closing the session; on expiry the error carries the first 80
    /// characters of the command.
    ///
    /// # Errors
    ///
    /// [`CoreError::SshSpawn`] when the channel cannot be opened or read,
    /// [`CoreError::SshTimeout`] when the deadline passes.
    pub async fn exec_simple(&self, cmd: &str, timeout: Duration) -> Result<String, CoreError> {
        let inner = Arc::clone(&self.inner);
        let command = cmd.to_string();
        tokio::task::spawn_blocking(move || exec_simple_blocking(&inner, &command, timeout))
            .await
            .map_err(|err| CoreError::SshSpawn(format!("exec task: {err}")))?
    }

    /// End the client. Used by the shutdown coordinator; errors are ignored.
    pub async fn disconnect(&self) {
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            let session = inner.session.lock().unwrap();
            let _ = session.disconnect(None, "beamctl shutdown", None);
        })
        .await;
    }
}

fn exec_simple_blocking(
    inner: &ClientInner,
    cmd: &str,
    timeout: Duration,
) -> Result<String, CoreError> {
    let mark_broken = || inner.broken.store(true, Ordering::Relaxed);

    let session = inner.session.lock().unwrap();
    let mut channel = session.channel_session().map_err(|err| {
        mark_broken();
        CoreError::SshSpawn(format!("open channel: {err}"))
    })?;
    channel.exec(cmd).map_err(|err| {
        mark_broken();
        CoreError::SshSpawn(format!("exec: {err}"))
    })?;
    session.set_blocking(false);

    let mut stdout = Vec::new();
    let mut buf = [0u8; 8192];
    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    loop {
        let mut progressed = false;
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                stdout.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                session.set_blocking(true);
                mark_broken();
                return Err(CoreError::SshSpawn(format!("read: {err}")));
            }
        }
        // Drain stderr so a chatty command cannot stall the channel.
        match channel.stderr().read(&mut buf) {
            Ok(n) if n > 0 => {
                trace!(host = %inner.label, bytes = n, "remote stderr");
                progressed = true;
            }
            _ => {}
        }
        if channel.eof() {
            break;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            break;
        }
        if !progressed {
            std::thread::sleep(EXEC_POLL_INTERVAL);
        }
    }

    if timed_out {
        let _ = channel.close();
        session.set_blocking(true);
        return Err(CoreError::SshTimeout {
            timeout_secs: timeout.as_secs(),
            command_prefix: text::truncate_chars_slice(cmd, TIMEOUT_PREFIX_CHARS).to_string(),
        });
    }

    session.set_blocking(true);
    let _ = channel.wait_close();
    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

/// Dial, handshake, and authenticate a session for `spec`.
fn dial_blocking(spec: &HostSpec, key_pem: &str) -> Result<ssh2::Session, CoreError> {
    let dial_err = |message: String| CoreError::SshDial {
        host: spec.label.clone(),
        message,
    };

    let addr = format!("{}:{}", spec.hostname, spec.port);
    let tcp = TcpStream::connect(&addr).map_err(|err| dial_err(format!("connect {addr}: {err}")))?;
    let mut session =
        ssh2::Session::new().map_err(|err| dial_err(format!("create session: {err}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| dial_err(format!("handshake: {err}")))?;
    session
        .userauth_pubkey_memory(&spec.user, None, key_pem, None)
        .map_err(|err| dial_err(format!("authenticate: {err}")))?;
    if !session.authenticated() {
        return Err(dial_err("authentication rejected".to_string()));
    }
    Ok(session)
}

/// Open a new authenticated client for `spec`.
///
/// # Errors
///
/// [`CoreError::SshDial`] on network, handshake, or authentication failure.
pub async fn dial(spec: &HostSpec, key_pem: &str) -> Result<Arc<SshClient>, CoreError> {
    let spec_owned = spec.clone();
    let key = key_pem.to_string();
    let session = tokio::task::spawn_blocking(move || dial_blocking(&spec_owned, &key))
        .await
        .map_err(|err| CoreError::SshDial {
            host: spec.label.clone(),
            message: format!("dial task: {err}"),
        })??;
    debug!(host = %spec.label, "ssh client connected");
    Ok(Arc::new(SshClient {
        inner: Arc::new(ClientInner {
            label: spec.label.clone(),
            session: Mutex::new(session),
            broken: AtomicBool::new(false),
        }),
    }))
}

/// Handle to a long-running remote command.
///
/// The `closed` flag flips to `true` exactly once, when the remote side has
/// been observed gone, whether it exited on its own or because the handle
/// was cancelled.
#[derive(Clone)]
pub struct NodeChannel {
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

impl NodeChannel {
    pub(crate) fn from_parts(cancel: CancellationToken, closed: watch::Receiver<bool>) -> Self {
        Self { cancel, closed }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the remote channel has been observed closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Ask the reader task to close the channel and wait for it to finish.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.wait_closed().await;
    }
}

/// Launch `cmd` on a dedicated session and hand ownership of its lifetime to
/// the returned [`NodeChannel`].
///
/// A blocking reader task drains the command's output until the remote side
/// exits or the handle is cancelled, then closes the channel and flips the
/// `closed` flag.
///
/// # Errors
///
/// [`CoreError::SshDial`] for connection failures, [`CoreError::SshSpawn`]
/// when the channel cannot be opened or the command cannot be started.
pub async fn exec_stream(
    spec: &HostSpec,
    key_pem: &str,
    cmd: &str,
) -> Result<NodeChannel, CoreError> {
    let spec_owned = spec.clone();
    let key = key_pem.to_string();
    let command = cmd.to_string();
    let (session, channel) =
        tokio::task::spawn_blocking(move || -> Result<(ssh2::Session, ssh2::Channel), CoreError> {
            let session = dial_blocking(&spec_owned, &key)?;
            let mut channel = session
                .channel_session()
                .map_err(|err| CoreError::SshSpawn(format!("open channel: {err}")))?;
            channel
                .exec(&command)
                .map_err(|err| CoreError::SshSpawn(format!("exec: {err}")))?;
            session.set_blocking(false);
            Ok((session, channel))
        })
        .await
        .map_err(|err| CoreError::SshSpawn(format!("spawn task: {err}")))??;

    let cancel = CancellationToken::new();
    let (closed_tx, closed_rx) = watch::channel(false);
    let reader_cancel = cancel.clone();
    let label = spec.label.clone();
    tokio::task::spawn_blocking(move || {
        stream_reader(session, channel, &label, &reader_cancel);
        let _ = closed_tx.send(true);
    });

    Ok(NodeChannel::from_parts(cancel, closed_rx))
}

/// Drain a stream channel until remote exit or cancellation, then tear the
/// session down.
fn stream_reader(
    session: ssh2::Session,
    mut channel: ssh2::Channel,
    label: &str,
    cancel: &CancellationToken,
) {
    let mut buf = [0u8; 8192];
    loop {
        if cancel.is_cancelled() {
            debug!(host = %label, "stream channel cancelled");
            break;
        }
        let mut progressed = false;
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                trace!(host = %label, bytes = n, "stream stdout");
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!(host = %label, error = %err, "stream read error");
                break;
            }
        }
        match channel.stderr().read(&mut buf) {
            Ok(n) if n > 0 => {
                trace!(host = %label, bytes = n, "stream stderr");
                progressed = true;
            }
            _ => {}
        }
        if channel.eof() {
            debug!(host = %label, "stream channel reached eof");
            break;
        }
        if !progressed {
            std::thread::sleep(STREAM_POLL_INTERVAL);
        }
    }
    let _ = channel.close();
    session.set_blocking(true);
    let _ = channel.wait_close();
    let _ = session.disconnect(None, "stream closed", None);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fabricate a channel handle with no transport behind it; the returned
    /// sender plays the reader task's part.
    pub(crate) fn channel_pair() -> (NodeChannel, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (NodeChannel::from_parts(CancellationToken::new(), rx), tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_channel_reports_close_once_flagged() {
        let (channel, tx) = testing::channel_pair();
        assert!(!channel.is_closed());
        tx.send(true).unwrap();
        assert!(channel.is_closed());
        // wait_closed resolves immediately once the flag is set.
        channel.wait_closed().await;
    }

    #[tokio::test]
    async fn node_channel_wait_survives_sender_drop() {
        let (channel, tx) = testing::channel_pair();
        drop(tx);
        // A dropped reader ends the wait rather than hanging forever.
        channel.wait_closed().await;
    }
}
