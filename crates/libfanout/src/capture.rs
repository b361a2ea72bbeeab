use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::read_error_is_stream_closed;
use crate::limiter::{Limiter, ENV_CHILD_LIMIT_SOCKET};
use crate::memory::{ChildId, MemoryBudget};
use crate::output::ChildOutput;
use crate::screen::Screen;
use crate::store::{STDERR_TAG, STDOUT_TAG};
use crate::term;

const MAX_READ: usize = 32 * 1024;

type SharedStream = Arc<AsyncFd<OwnedFd>>;

/// Everything a spawn needs that outlives any single child.
pub struct SpawnContext {
    pub memory: Arc<MemoryBudget>,
    pub limiter: Arc<Limiter>,
    /// True iff the parent's stdout is a terminal; decided once at startup.
    pub interactive: bool,
    /// True when the parent's stdout and stderr are the same stream, in
    /// which case each child gets a single pty/pipe pair.
    pub streams_deduped: bool,
    pub limit_socket_path: PathBuf,
    next_child_id: AtomicU64,
}

impl SpawnContext {
    pub fn new(
        memory: Arc<MemoryBudget>,
        limiter: Arc<Limiter>,
        interactive: bool,
        streams_deduped: bool,
        limit_socket_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            memory,
            limiter,
            interactive,
            streams_deduped,
            limit_socket_path,
            next_child_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> ChildId {
        self.next_child_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// One spawned child as the scheduler sees it.
pub struct ChildRecord {
    pub started_at: Instant,
    pub original_command: Vec<String>,
    pub output: Arc<ChildOutput>,
    pub pid: u32,
    /// Filled by the waiter task once the child has terminated and both
    /// reader streams have drained.
    pub exit_code: oneshot::Receiver<i32>,
}

/// Spawns one child under the concurrency budget and wires up its capture
/// pipeline: pty or pipe pair (deduplicated when stdout and stderr are the
/// same stream), one reader task per stream, a SIGWINCH dispatcher for
/// interactive children, and the waiter that reaps the child.
pub async fn spawn_child(ctx: &Arc<SpawnContext>, command: Vec<String>) -> Result<ChildRecord> {
    let child_id = ctx.next_id();
    ctx.limiter
        .acquire(child_id)
        .await
        .context("waiting for a concurrency slot")?;

    let started_at = Instant::now();
    let fd_stream_ends: u32 = if ctx.streams_deduped { 1 } else { 2 };

    let mut cmd = tokio::process::Command::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.env(ENV_CHILD_LIMIT_SOCKET, &ctx.limit_socket_path);

    let mut screens: [Option<Screen>; 2] = [None, None];
    let mut streams: Vec<(SharedStream, u8)> = Vec::with_capacity(2);
    let mut masters: Vec<SharedStream> = Vec::new();

    if ctx.interactive {
        let ws = term::parent_winsize().context("could not get terminal size")?;

        let (stdout_master, stdout_slave) = open_async_pty(&ws)
            .with_context(|| format!("could not create a pty for {:?}'s stdout", command))?;
        screens[0] = Some(Screen::new(ws.ws_col, ws.ws_row));
        streams.push((Arc::clone(&stdout_master), STDOUT_TAG));
        masters.push(stdout_master);

        let stderr_slave = if ctx.streams_deduped {
            None
        } else {
            let (stderr_master, stderr_slave) = open_async_pty(&ws)
                .with_context(|| format!("could not create a pty for {:?}'s stderr", command))?;
            screens[1] = Some(Screen::new(ws.ws_col, ws.ws_row));
            streams.push((Arc::clone(&stderr_master), STDERR_TAG));
            masters.push(stderr_master);
            Some(stderr_slave)
        };

        // The slave becomes the child's stdin as well, so interactive
        // children that prompt still get a terminal to read from.
        cmd.stdin(Stdio::from(stdout_slave.try_clone().context("dup slave")?));
        cmd.stdout(Stdio::from(stdout_slave.try_clone().context("dup slave")?));
        match &stderr_slave {
            Some(slave) => cmd.stderr(Stdio::from(slave.try_clone().context("dup slave")?)),
            None => cmd.stderr(Stdio::from(stdout_slave.try_clone().context("dup slave")?)),
        };

        // SAFETY: setsid and ioctl are async-signal-safe; the closure runs
        // between fork and exec in the child.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                // The slave is the child's fd 0 by now; make it the
                // controlling terminal of the new session.
                if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    } else {
        let (stdout_read, stdout_write) =
            open_async_pipe().with_context(|| format!("could not create a pipe for {:?}'s stdout", command))?;
        streams.push((stdout_read, STDOUT_TAG));

        let stderr_write = if ctx.streams_deduped {
            None
        } else {
            let (stderr_read, stderr_write) = open_async_pipe()
                .with_context(|| format!("could not create a pipe for {:?}'s stderr", command))?;
            streams.push((stderr_read, STDERR_TAG));
            Some(stderr_write)
        };

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout_write.try_clone().context("dup pipe")?));
        match &stderr_write {
            Some(write_end) => cmd.stderr(Stdio::from(write_end.try_clone().context("dup pipe")?)),
            None => cmd.stderr(Stdio::from(stdout_write.try_clone().context("dup pipe")?)),
        };
    }

    let output = ChildOutput::new(child_id, fd_stream_ends, screens, Arc::clone(&ctx.memory));

    let mut child = cmd
        .spawn()
        .with_context(|| format!("could not start {:?}", command))?;
    let pid = child.id().context("spawned child has no pid")?;
    // The parent's copies of the slave/write ends drop here; readers see EOF
    // as soon as the child's do.
    drop(cmd);

    let (closed_tx, mut closed_rx) = mpsc::channel::<()>(2);
    for (stream, tag) in streams {
        tokio::spawn(reader_loop(
            Arc::clone(&output),
            stream,
            tag,
            output.subscribe_promotion(),
            closed_tx.clone(),
        ));
    }
    drop(closed_tx);

    let winch_token = CancellationToken::new();
    if ctx.interactive {
        tokio::spawn(winch_dispatcher(
            Arc::clone(&output),
            masters,
            winch_token.clone(),
        ));
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    let limiter = Arc::clone(&ctx.limiter);
    let streams_to_drain = fd_stream_ends;
    tokio::spawn(async move {
        let mut drained = 0;
        while drained < streams_to_drain {
            if closed_rx.recv().await.is_none() {
                break;
            }
            drained += 1;
        }
        winch_token.cancel();

        let code = match child.wait().await {
            Ok(status) => exit_code_from_status(status),
            Err(err) => {
                warn!("could not wait for child {pid}: {err}");
                1
            }
        };
        limiter.release(child_id).await;
        let _ = exit_tx.send(code);
    });

    Ok(ChildRecord {
        started_at,
        original_command: command,
        output,
        pid,
        exit_code: exit_rx,
    })
}

fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Opens a pty pair at the given size and returns the master wrapped for
/// async reads. The raw master is blocking; reading it from many tasks would
/// pin a thread each, so it is duplicated, the duplicate made non-blocking,
/// and the original closed.
fn open_async_pty(ws: &libc::winsize) -> Result<(SharedStream, OwnedFd)> {
    let pty = nix::pty::openpty(Some(ws), None).context("openpty")?;

    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor we now own.
    let dup = unsafe { libc::fcntl(pty.master.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) };
    if dup == -1 {
        return Err(io::Error::last_os_error()).context("dup pty master");
    }
    let dup = unsafe { OwnedFd::from_raw_fd(dup) };
    drop(pty.master);
    set_nonblocking(&dup).context("mark pty master non-blocking")?;

    let master = Arc::new(AsyncFd::new(dup).context("register pty master")?);
    Ok((master, pty.slave))
}

fn open_async_pipe() -> Result<(SharedStream, OwnedFd)> {
    let (read_end, write_end) = nix::unistd::pipe().context("pipe")?;
    set_nonblocking(&read_end).context("mark pipe non-blocking")?;
    let read_end = Arc::new(AsyncFd::new(read_end).context("register pipe")?);
    Ok((read_end, write_end))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Propagates terminal resizes to one child: the kernel side of each
/// surviving pty and the virtual screens. Each side is resized
/// independently; a side whose pty is already gone just reports an error we
/// ignore.
async fn winch_dispatcher(
    output: Arc<ChildOutput>,
    masters: Vec<SharedStream>,
    token: CancellationToken,
) {
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("could not subscribe to SIGWINCH: {err}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = winch.recv() => {
                if received.is_none() {
                    break;
                }
                let ws = match term::parent_winsize() {
                    Ok(ws) => ws,
                    Err(err) => {
                        warn!("could not get terminal size on SIGWINCH: {err}");
                        continue;
                    }
                };
                for master in &masters {
                    if let Err(err) = term::resize_pty(master.as_raw_fd(), &ws) {
                        trace!("pty resize skipped: {err}");
                    }
                }
                output.resize_screens(ws.ws_col, ws.ws_row);
            }
        }
    }
}

enum Step {
    Promoted,
    SignalGone,
    Spurious,
    Read(usize),
    Eof,
    Closed,
    Fatal(io::Error),
}

fn read_step(guard: &mut AsyncFdReadyGuard<'_, OwnedFd>, buf: &mut [u8]) -> Step {
    let attempted = guard.try_io(|inner| {
        // SAFETY: reading into a live buffer from a descriptor the AsyncFd
        // keeps open.
        let n = unsafe {
            libc::read(
                inner.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    });
    match attempted {
        Err(_would_block) => Step::Spurious,
        Ok(Ok(0)) => Step::Eof,
        Ok(Ok(n)) => Step::Read(n),
        Ok(Err(err)) if read_error_is_stream_closed(&err) => Step::Closed,
        Ok(Err(err)) => Step::Fatal(err),
    }
}

/// The per-stream reader: waits on the stream and the promotion signal at
/// once. Until promotion, interactive bytes feed the virtual screen and only
/// spilled scrollback is buffered; after promotion everything is written
/// live. The promotion signal also triggers the screen's final flush so a
/// child idling at a prompt still shows its last frame.
async fn reader_loop(
    output: Arc<ChildOutput>,
    stream: SharedStream,
    tag: u8,
    mut promoted_rx: watch::Receiver<bool>,
    closed_tx: mpsc::Sender<()>,
) {
    let mut promoted = false;
    let mut signal_live = true;
    let mut buf = vec![0u8; MAX_READ];

    loop {
        let step = if !promoted && signal_live {
            tokio::select! {
                changed = promoted_rx.changed() => match changed {
                    Ok(()) => Step::Promoted,
                    Err(_) => Step::SignalGone,
                },
                ready = stream.readable() => match ready {
                    Ok(mut guard) => read_step(&mut guard, &mut buf),
                    Err(_) => Step::Closed,
                },
            }
        } else {
            match stream.readable().await {
                Ok(mut guard) => read_step(&mut guard, &mut buf),
                Err(_) => Step::Closed,
            }
        };

        match step {
            Step::Promoted => {
                promoted = true;
                output.acknowledge_promotion();
                if let Some(scrollback) = output.finish_screen(tag) {
                    output.submit(true, tag, &scrollback).await;
                }
            }
            Step::SignalGone => signal_live = false,
            Step::Spurious => {}
            Step::Eof | Step::Closed => break,
            Step::Fatal(err) => {
                eprintln!("fanout: error reading from child: {err}");
                std::process::exit(1);
            }
            Step::Read(n) => {
                let data = &buf[..n];
                if !promoted && output.has_screen(tag) {
                    output.advance_screen(tag, data);
                } else {
                    output.submit(promoted, tag, data).await;
                }
                if let Some(scrollback) = output.take_screen_scrollback(tag) {
                    output.submit(promoted, tag, &scrollback).await;
                }
            }
        }
    }

    // A child that was never promoted still owes its final frame.
    if !promoted {
        if let Some(scrollback) = output.finish_screen(tag) {
            output.submit(false, tag, &scrollback).await;
        }
    }
    let _ = closed_tx.send(()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputMode;
    use std::time::Duration;

    fn test_context(streams_deduped: bool) -> Arc<SpawnContext> {
        let dir = std::env::temp_dir().join(format!(".fanout-test-{}", std::process::id()));
        SpawnContext::new(
            Arc::new(MemoryBudget::new(64 * 1024 * 1024)),
            Limiter::with_socket(dir.join("processlimit")),
            false,
            streams_deduped,
            dir.join("processlimit"),
        )
    }

    async fn run_to_completion(ctx: &Arc<SpawnContext>, command: &[&str]) -> (ChildRecord, i32) {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let mut record = spawn_child(ctx, command).await.expect("spawn");
        let code = tokio::time::timeout(Duration::from_secs(5), &mut record.exit_code)
            .await
            .expect("child must exit")
            .expect("exit code delivered");
        (record, code)
    }

    #[tokio::test]
    async fn captures_stdout_into_the_store() {
        let ctx = test_context(false);
        let (record, code) = run_to_completion(&ctx, &["sh", "-c", "printf hello"]).await;
        assert_eq!(code, 0);
        // Give the reader a beat to drain the pipe EOF path.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(record.output.mode(), OutputMode::Buffered);
    }

    #[tokio::test]
    async fn exit_codes_are_delivered() {
        let ctx = test_context(false);
        let (_record, code) = run_to_completion(&ctx, &["sh", "-c", "exit 7"]).await;
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn deduped_children_use_a_single_stream() {
        let ctx = test_context(true);
        let (record, code) =
            run_to_completion(&ctx, &["sh", "-c", "echo out; echo err 1>&2"]).await;
        assert_eq!(code, 0);
        assert_eq!(record.output.fd_stream_ends(), 1);
    }
}
