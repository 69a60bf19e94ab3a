//! Bounded view over one block of a larger stream.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::VfsError;

/// Restricts reads and writes on `inner` to `[offset, offset + chunk_size)`.
///
/// Positions are virtual: position 0 maps to `offset` in the source. The
/// source is re-seeked before every access, so several windows can share
/// one source as long as they are used one after another.
#[derive(Debug)]
pub struct ChunkStream<S> {
    inner: S,
    offset: u64,
    chunk_size: u64,
    position: u64,
}

impl<S> ChunkStream<S> {
    pub fn new(inner: S, offset: u64, chunk_size: u64) -> Self {
        Self {
            inner,
            offset,
            chunk_size,
            position: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Current position within the window.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left between the current position and the end of the window.
    pub fn remaining(&self) -> u64 {
        self.chunk_size - self.position
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Seek> ChunkStream<S> {
    fn seek_source(&mut self) -> io::Result<()> {
        self.inner
            .seek(SeekFrom::Start(self.offset + self.position))
            .map(|_| ())
    }
}

impl<S: Read + Seek> Read for ChunkStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.seek_source()?;
        let n = self.inner.read(&mut buf[..len])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<S: Write + Seek> Write for ChunkStream<S> {
    /// Fails without writing anything if `buf` does not fit into the rest of
    /// the window.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if buf.len() as u64 > remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes exceeds the {remaining} bytes left in the chunk",
                    buf.len()
                ),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.seek_source()?;
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S> Seek for ChunkStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::Current(d) => i128::from(self.position) + i128::from(d),
            SeekFrom::End(d) => i128::from(self.chunk_size) + i128::from(d),
        };
        if target < 0 || target > i128::from(self.chunk_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target} outside chunk of {} bytes", self.chunk_size),
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

/// Copies `data` into `target` at `offset`, accepting at most `limit` bytes.
///
/// Returns the number of bytes written. Data beyond `limit` fails with
/// [`ErrorKind::DataBlockInvalid`](crate::ErrorKind::DataBlockInvalid).
pub fn write_window<S: Write + Seek>(
    target: S,
    offset: u64,
    limit: u64,
    data: &mut dyn Read,
) -> Result<u64, VfsError> {
    let mut window = ChunkStream::new(target, offset, limit);
    match io::copy(data, &mut window) {
        Ok(n) => {
            window.flush()?;
            Ok(n)
        }
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Err(VfsError::block_invalid(
            format!("block at offset {offset} exceeds {limit} bytes"),
        )),
        Err(e) => Err(e.into()),
    }
}
