//! Readiness shim over the tokio reactor.
//!
//! The reactor plays the role of the external event loop: a connection
//! subscribes to the union of its current interests and gets woken when
//! any of them is satisfied. Both I/O helpers are strictly non-blocking
//! and perform one syscall per call; partial progress is normal and the
//! caller keeps its interest armed by calling [`wait`] again.

use crate::protocol::PacketParser;
use bytes::Buf;
use std::io;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

/// Upper bound on bytes pulled off the socket per wakeup.
pub(crate) const READ_CHUNK: usize = 8 * 1024;

/// Await readiness for reading, plus writing when requested.
pub(crate) async fn wait(stream: &TcpStream, want_write: bool) -> io::Result<Ready> {
    let interest = if want_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    stream.ready(interest).await
}

/// One non-blocking write from `output` to the socket.
///
/// The consumed prefix is shifted off the front; a spurious wakeup
/// reports zero bytes written.
pub(crate) fn drain(stream: &TcpStream, output: &mut bytes::BytesMut) -> io::Result<usize> {
    match stream.try_write(output) {
        Ok(n) => {
            output.advance(n);
            Ok(n)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

/// Outcome of one [`fill`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FillOutcome {
    /// Bytes were appended to the parser buffer
    Data(usize),
    /// The wakeup was spurious
    WouldBlock,
    /// The peer closed the connection
    Eof,
}

/// One bounded non-blocking read into the parser's buffer.
pub(crate) fn fill(stream: &TcpStream, parser: &mut PacketParser) -> io::Result<FillOutcome> {
    let buf = parser.buffer_mut();
    let start = buf.len();
    buf.resize(start + READ_CHUNK, 0);
    let result = stream.try_read(&mut buf[start..]);
    match result {
        Ok(0) => {
            buf.truncate(start);
            Ok(FillOutcome::Eof)
        }
        Ok(n) => {
            buf.truncate(start + n);
            Ok(FillOutcome::Data(n))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            buf.truncate(start);
            Ok(FillOutcome::WouldBlock)
        }
        Err(e) => {
            buf.truncate(start);
            Err(e)
        }
    }
}
