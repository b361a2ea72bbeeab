use std::io::{self, IsTerminal};
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::Mutex;

use nix::sys::termios::{self, SetArg, Termios};

pub const STDOUT_FD: RawFd = libc::STDOUT_FILENO;
pub const STDERR_FD: RawFd = libc::STDERR_FILENO;

pub fn stdout_is_tty() -> bool {
    io::stdout().is_terminal()
}

/// True when two descriptors refer to the same underlying kernel object.
/// Used to avoid allocating a second pty/pipe pair for stderr when the
/// caller pointed stdout and stderr at the same stream; pty pairs are a
/// scarce resource (a few hundred to a few thousand per system).
pub fn fds_are_same_stream(a: RawFd, b: RawFd) -> io::Result<bool> {
    let sa = fstat(a)?;
    let sb = fstat(b)?;
    Ok(sa.st_dev == sb.st_dev
        && sa.st_ino == sb.st_ino
        && sa.st_mode == sb.st_mode
        && sa.st_nlink == sb.st_nlink
        && sa.st_rdev == sb.st_rdev)
}

pub fn stdout_and_stderr_are_the_same() -> io::Result<bool> {
    fds_are_same_stream(STDOUT_FD, STDERR_FD)
}

fn fstat(fd: RawFd) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fills the stat buffer or fails; we only read it on success.
    let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { st.assume_init() })
}

/// The controlling terminal's current dimensions, read from stdout.
pub fn parent_winsize() -> io::Result<libc::winsize> {
    let mut ws: libc::winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a winsize struct through the pointer.
    let rc = unsafe { libc::ioctl(STDOUT_FD, libc::TIOCGWINSZ, &mut ws) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ws)
}

pub fn resize_pty(master: RawFd, ws: &libc::winsize) -> io::Result<()> {
    // SAFETY: TIOCSWINSZ reads a winsize struct through the pointer.
    let rc = unsafe { libc::ioctl(master, libc::TIOCSWINSZ, ws) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Writes the whole buffer to a raw descriptor, retrying on EINTR and short
/// writes. Replay must not interleave with Rust's buffered stdout, so all
/// terminal output of captured bytes goes through this.
pub fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: plain write(2) on a descriptor we do not own exclusively;
        // the kernel bounds the access by the reported length.
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        buf = &buf[rc as usize..];
    }
    Ok(())
}

/// Raises the soft RLIMIT_NOFILE to the hard limit. Each interactive child
/// costs up to two pty pairs, so the inherited soft limit runs out fast.
/// Best effort; failure leaves the inherited limit in place.
pub fn raise_nofile_limit() {
    if let Ok((_soft, hard)) = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        let _ = nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE, hard, hard);
    }
}

/// Saved terminal state, captured before any child runs and restored on the
/// way out (including the SIGINT/SIGTERM path). A child that died mid-escape
/// can leave the terminal in raw mode with the cursor hidden.
pub struct TerminalGuard {
    saved: Mutex<Option<Termios>>,
    is_tty: bool,
}

impl TerminalGuard {
    pub fn capture() -> Self {
        let is_tty = stdout_is_tty();
        let saved = if is_tty {
            match termios::tcgetattr(&io::stdout()) {
                Ok(state) => Some(state),
                Err(err) => {
                    tracing::warn!("could not capture terminal state: {err}");
                    None
                }
            }
        } else {
            None
        };
        Self {
            saved: Mutex::new(saved),
            is_tty,
        }
    }

    /// Restores the captured termios state and re-shows the cursor.
    /// Idempotent; later calls are no-ops.
    pub fn restore(&self) {
        let saved = self
            .saved
            .lock()
            .expect("terminal guard lock poisoned")
            .take();
        if let Some(state) = saved {
            if let Err(err) = termios::tcsetattr(&io::stdout(), SetArg::TCSANOW, &state) {
                tracing::warn!("could not restore terminal state on exit: {err}");
            }
        }
        if self.is_tty {
            // Undo a hidden or reshaped cursor a child may have left behind.
            let _ = write_all_fd(STDOUT_FD, b"\x1b[?25h\x1b[?0c");
        }
    }
}
