use std::collections::VecDeque;
use std::io::{self, Read, Write};

use veilnet_common::limits;

/// Bounded byte buffer backing one side of an edge connection.
///
/// Sits between a nonblocking socket and the cell machinery: the poll loop
/// fills it with [`Buffer::read_from`] and drains it with
/// [`Buffer::flush_into`]; the engine moves bytes in and out with
/// [`Buffer::write`] and [`Buffer::fetch`].
#[derive(Debug, Default)]
pub struct Buffer {
    data: VecDeque<u8>,
    reached_eof: bool,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered
    pub fn datalen(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True once the read side of the socket hit EOF
    pub fn reached_eof(&self) -> bool {
        self.reached_eof
    }

    /// Append bytes, enforcing the buffer cap.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if self.data.len() + bytes.len() > limits::EDGE_BUFFER_CAP {
            return Err(BufferError::Overflow {
                cap: limits::EDGE_BUFFER_CAP,
            });
        }
        self.data.extend(bytes);
        Ok(())
    }

    /// Drain up to `dst.len()` bytes into `dst`, returning how many moved.
    pub fn fetch(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        for (i, byte) in self.data.drain(..n).enumerate() {
            dst[i] = byte;
        }
        n
    }

    /// Copy up to `dst.len()` bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        for (i, byte) in self.data.iter().take(n).enumerate() {
            dst[i] = *byte;
        }
        n
    }

    /// Discard the first `n` buffered bytes.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Pull bytes off a nonblocking reader until it would block, hits EOF,
    /// the per-wake cap is reached, or the buffer fills. Returns bytes read.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];

        while total < limits::READ_PER_WAKE {
            let room = limits::EDGE_BUFFER_CAP - self.data.len();
            if room == 0 {
                break;
            }
            let want = chunk.len().min(room);
            match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.reached_eof = true;
                    break;
                }
                Ok(n) => {
                    self.data.extend(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Write buffered bytes to a nonblocking writer until it would block or
    /// the buffer drains. Returns bytes written.
    pub fn flush_into<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            let (front, _) = self.data.as_slices();
            match writer.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.data.drain(..n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Above the level where we stop granting the peer more credit
    pub fn too_full(&self) -> bool {
        self.data.len() >= limits::OUTBUF_HIGH_WATER
    }

    pub fn wants_flush(&self) -> bool {
        !self.data.is_empty()
    }
}

/// Buffer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer overflow past {cap} bytes")]
    Overflow { cap: usize },
}
