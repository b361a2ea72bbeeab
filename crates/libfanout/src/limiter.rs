use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::FanoutError;
use crate::memory::ChildId;
use crate::paths;

/// Set on every spawned child so nested invocations share the root's
/// parallelism budget instead of multiplying it.
pub const ENV_CHILD_LIMIT_SOCKET: &str = "_FANOUT_CHILD_LIMIT_SOCKET";

const GRANT: u8 = 0x01;
const RELEASE: u8 = 0x02;

/// Cross-process concurrency limiter.
///
/// The root invocation serves `max_concurrent - 1` attendants on a unix
/// socket; each attendant owns one slot and hands out one single-byte grant
/// per acquisition. Every invocation (the root included) runs the client
/// side: the first queued child takes the process's own implicit slot, every
/// later child dials the root and blocks until an attendant grants it.
pub struct Limiter {
    socket_path: PathBuf,
    queue: Mutex<Vec<QueueEntry>>,
}

struct QueueEntry {
    id: ChildId,
    conn: Option<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl Limiter {
    /// Client for a descendant invocation, pointed at the socket advertised
    /// by the root through the environment.
    pub fn from_env() -> Option<Arc<Self>> {
        let path = std::env::var_os(ENV_CHILD_LIMIT_SOCKET)?;
        if path.is_empty() {
            return None;
        }
        Some(Self::with_socket(PathBuf::from(path)))
    }

    pub fn with_socket(socket_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            socket_path,
            queue: Mutex::new(Vec::new()),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Creates the root limiter: binds the socket under the runtime data
    /// dir, removes any stale socket a crashed predecessor with the same pid
    /// left behind, and starts the attendant pool.
    ///
    /// With `max_concurrent == 1` a single attendant still serves the socket
    /// but never writes a grant, so descendants block with the same client
    /// code they always run.
    pub async fn serve_root(max_concurrent: usize) -> Result<Arc<Self>, FanoutError> {
        let socket_path = paths::limit_socket_path(std::process::id());
        Self::serve_on(socket_path, max_concurrent).await
    }

    pub async fn serve_on(
        socket_path: PathBuf,
        max_concurrent: usize,
    ) -> Result<Arc<Self>, FanoutError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                FanoutError::ResourceExhausted(format!(
                    "could not create {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).map_err(|err| {
            FanoutError::ResourceExhausted(format!(
                "could not listen on {}: {err}",
                socket_path.display()
            ))
        })?;
        let listener = Arc::new(listener);

        let attendants = max_concurrent.saturating_sub(1).max(1);
        let grants = max_concurrent > 1;
        for _ in 0..attendants {
            let listener = Arc::clone(&listener);
            tokio::spawn(attend(listener, grants));
        }

        Ok(Self::with_socket(socket_path))
    }

    /// Waits for a slot before `id` may spawn. The head of the queue is the
    /// process's own implicit slot and proceeds at once; everyone else dials
    /// the root socket and blocks on the grant byte. Cancellation and socket
    /// closure both mean "proceed" — the only things that produce them are a
    /// release aimed at us and limiter shutdown.
    pub async fn acquire(&self, id: ChildId) -> Result<(), FanoutError> {
        let cancel = CancellationToken::new();
        {
            let mut queue = self.queue.lock().await;
            queue.push(QueueEntry {
                id,
                conn: None,
                cancel: cancel.clone(),
            });
            if queue.len() == 1 {
                return Ok(());
            }
        }

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connected = UnixStream::connect(&self.socket_path) => match connected {
                Ok(stream) => stream,
                Err(err) if dial_failure_means_shutdown(&err) => {
                    debug!("limiter socket gone while dialing; proceeding: {err}");
                    return Ok(());
                }
                Err(err) => {
                    return Err(FanoutError::ResourceExhausted(format!(
                        "could not connect to limiter socket {}: {err}",
                        self.socket_path.display()
                    )));
                }
            },
        };

        let (mut read_half, write_half) = stream.into_split();
        {
            let mut queue = self.queue.lock().await;
            match queue.iter_mut().find(|entry| entry.id == id) {
                Some(entry) if !entry.cancel.is_cancelled() => entry.conn = Some(write_half),
                // Released while we were dialing; the slot is ours.
                _ => return Ok(()),
            }
        }

        let mut byte = [0u8; 1];
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            read = read_half.read_exact(&mut byte) => match read {
                Ok(_) if byte[0] == GRANT => Ok(()),
                Ok(_) => Err(FanoutError::ProtocolViolation(byte[0])),
                Err(_) => Ok(()), // closed connection releases the waiter
            },
        }
    }

    /// Frees the slot held by a reaped child. If the reaped child was the
    /// queue head (the implicit slot), the next entry inherits it; otherwise
    /// the reaped child's own remote slot is returned. Either way the chosen
    /// entry gets a release byte on its connection (freeing its attendant)
    /// and a cancellation (unblocking a still-pending wait).
    pub async fn release(&self, id: ChildId) {
        let mut queue = self.queue.lock().await;
        let Some(index) = queue.iter().position(|entry| entry.id == id) else {
            panic!("released a child the limiter never queued");
        };
        debug_assert!(
            queue[0].conn.is_none(),
            "the queue head must hold the implicit slot, not a remote one"
        );

        let target = if index == 0 && queue.len() >= 2 { 1 } else { index };
        let entry = &mut queue[target];
        if let Some(mut conn) = entry.conn.take() {
            let _ = conn.write_all(&[RELEASE]).await;
        }
        entry.cancel.cancel();
        queue.remove(index);
    }
}

async fn attend(listener: Arc<UnixListener>, grants: bool) {
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!("limiter attendant stopping: {err}");
                break;
            }
        };

        if grants {
            if stream.write_all(&[GRANT]).await.is_err() {
                continue;
            }
        }

        let mut byte = [0u8; 1];
        match stream.read_exact(&mut byte).await {
            Ok(_) if byte[0] == RELEASE => {}
            Ok(_) => {
                error!(
                    "limiter protocol violation: expected a release byte, got {:#04x}",
                    byte[0]
                );
                std::process::exit(1);
            }
            // A vanished client frees its slot the same as a release.
            Err(_) => {}
        }
    }
}

fn dial_failure_means_shutdown(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
    )
}
