use thiserror::Error;

#[derive(Error, Debug)]
pub enum FanoutError {
    /// A pty, pipe, or socket could not be allocated. Fatal to the run.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The peer closed its end of a stream. Normal end of capture.
    #[error("stream closed")]
    StreamClosed,

    /// A limiter dial or grant read was interrupted. The waiter may proceed.
    #[error("limiter wait cancelled")]
    CancelledWait,

    /// The limiter peer sent a byte outside the grant/release alphabet.
    #[error("limiter protocol violation: unexpected byte {0:#04x}")]
    ProtocolViolation(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// True when a read error means the child closed its end of the stream:
/// EOF shows up as `Ok(0)` and is handled by callers, but a hung-up pty
/// master reports `EIO` on Linux, and a descriptor torn down mid-read
/// reports as already closed.
pub fn read_error_is_stream_closed(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EIO) | Some(libc::EBADF))
        || err.kind() == std::io::ErrorKind::UnexpectedEof
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eio_counts_as_stream_closed() {
        let err = std::io::Error::from_raw_os_error(libc::EIO);
        assert!(read_error_is_stream_closed(&err));
    }

    #[test]
    fn permission_denied_does_not() {
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert!(!read_error_is_stream_closed(&err));
    }
}
