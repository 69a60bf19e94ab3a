use std::io::{self, Cursor, Write};

use tessera_protocol::{BufferedDataBlock, DataBlockInfo, StreamedDataBlock};

use crate::VfsError;

/// Accumulation state shared by the buffered and streamed writers.
#[derive(Debug)]
struct BlockAccumulator {
    transfer_id: String,
    max_block_size: usize,
    threshold: usize,
    buffer: Vec<u8>,
    next_block: u64,
    offset: u64,
    finished: bool,
}

impl BlockAccumulator {
    fn new(
        transfer_id: String,
        max_block_size: usize,
        threshold: usize,
        block_number: u64,
        offset: u64,
    ) -> Self {
        let max_block_size = max_block_size.max(1);
        Self {
            transfer_id,
            max_block_size,
            threshold: threshold.min(max_block_size),
            buffer: Vec::new(),
            next_block: block_number,
            offset,
            finished: false,
        }
    }

    /// Emits the first `len` buffered bytes. Counters and buffer only move
    /// once `emit` succeeded.
    fn emit_front<F>(&mut self, len: usize, is_last: bool, emit: &mut F) -> Result<(), VfsError>
    where
        F: FnMut(DataBlockInfo, Vec<u8>) -> Result<(), VfsError>,
    {
        let info = DataBlockInfo {
            transfer_id: self.transfer_id.clone(),
            block_number: self.next_block,
            block_length: Some(len as u64),
            offset: self.offset,
            is_last_block: is_last,
        };
        emit(info, self.buffer[..len].to_vec())?;
        self.buffer.drain(..len);
        self.next_block += 1;
        self.offset += len as u64;
        Ok(())
    }

    fn auto_flush<F>(&mut self, emit: &mut F) -> Result<(), VfsError>
    where
        F: FnMut(DataBlockInfo, Vec<u8>) -> Result<(), VfsError>,
    {
        // A full block only goes out once a later byte shows it is not the
        // last one; `finish` marks whatever is held back.
        while self.buffer.len() > self.max_block_size {
            self.emit_front(self.max_block_size, false, emit)?;
        }
        let len = self.buffer.len();
        if len > 0 && len < self.max_block_size && len >= self.threshold {
            self.emit_front(len, false, emit)?;
        }
        Ok(())
    }

    fn finish<F>(&mut self, emit: &mut F) -> Result<(), VfsError>
    where
        F: FnMut(DataBlockInfo, Vec<u8>) -> Result<(), VfsError>,
    {
        if self.finished {
            return Ok(());
        }
        while self.buffer.len() > self.max_block_size {
            self.emit_front(self.max_block_size, false, emit)?;
        }
        self.emit_front(self.buffer.len(), true, emit)?;
        self.finished = true;
        Ok(())
    }

    fn write<F>(&mut self, buf: &[u8], emit: &mut F) -> io::Result<usize>
    where
        F: FnMut(DataBlockInfo, Vec<u8>) -> Result<(), VfsError>,
    {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "block writer already finished",
            ));
        }
        // Accepted bytes stay buffered even if the emission below fails.
        self.buffer.extend_from_slice(buf);
        self.auto_flush(emit)?;
        Ok(buf.len())
    }
}

/// Splits a byte stream into [`BufferedDataBlock`]s.
///
/// Full blocks are emitted as soon as more bytes follow them, so a stream of
/// `N` bytes ends up as `ceil(N / max_block_size)` blocks. A remainder below
/// the block size is emitted early when it reaches the auto-flush threshold.
/// [`finish`](Self::finish) (or `flush`) emits the rest as the last block,
/// which is zero-length only if nothing is buffered.
///
/// If the emission callback fails, the write returns the error but the bytes
/// are kept: they go out with the next successful emission and must not be
/// written again.
pub struct BufferedBlockWriter<F> {
    state: BlockAccumulator,
    emit: F,
}

impl<F> BufferedBlockWriter<F>
where
    F: FnMut(BufferedDataBlock) -> Result<(), VfsError>,
{
    pub fn new(
        transfer_id: impl Into<String>,
        max_block_size: usize,
        threshold: usize,
        emit: F,
    ) -> Self {
        Self::resume_at(transfer_id, max_block_size, threshold, 0, 0, emit)
    }

    /// Continues a transfer at `block_number` and byte `offset`.
    pub fn resume_at(
        transfer_id: impl Into<String>,
        max_block_size: usize,
        threshold: usize,
        block_number: u64,
        offset: u64,
        emit: F,
    ) -> Self {
        Self {
            state: BlockAccumulator::new(
                transfer_id.into(),
                max_block_size,
                threshold,
                block_number,
                offset,
            ),
            emit,
        }
    }

    /// Number of the next block to be emitted.
    pub fn block_number(&self) -> u64 {
        self.state.next_block
    }

    /// Offset of the next block to be emitted.
    pub fn offset(&self) -> u64 {
        self.state.offset
    }

    pub fn buffered_len(&self) -> usize {
        self.state.buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }

    /// Emits all buffered bytes, the final block marked last.
    pub fn finish(&mut self) -> Result<(), VfsError> {
        let emit = &mut self.emit;
        self.state
            .finish(&mut |info, data| emit(BufferedDataBlock { info, data }))
    }
}

impl<F> Write for BufferedBlockWriter<F>
where
    F: FnMut(BufferedDataBlock) -> Result<(), VfsError>,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let emit = &mut self.emit;
        self.state
            .write(buf, &mut |info, data| emit(BufferedDataBlock { info, data }))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.finish().map_err(io::Error::from)
    }
}

/// Like [`BufferedBlockWriter`], but each block carries its payload as a
/// bounded reader.
pub struct StreamedBlockWriter<F> {
    state: BlockAccumulator,
    emit: F,
}

fn streamed(info: DataBlockInfo, data: Vec<u8>) -> StreamedDataBlock {
    StreamedDataBlock::new(info, Box::new(Cursor::new(data)))
}

impl<F> StreamedBlockWriter<F>
where
    F: FnMut(StreamedDataBlock) -> Result<(), VfsError>,
{
    pub fn new(
        transfer_id: impl Into<String>,
        max_block_size: usize,
        threshold: usize,
        emit: F,
    ) -> Self {
        Self::resume_at(transfer_id, max_block_size, threshold, 0, 0, emit)
    }

    pub fn resume_at(
        transfer_id: impl Into<String>,
        max_block_size: usize,
        threshold: usize,
        block_number: u64,
        offset: u64,
        emit: F,
    ) -> Self {
        Self {
            state: BlockAccumulator::new(
                transfer_id.into(),
                max_block_size,
                threshold,
                block_number,
                offset,
            ),
            emit,
        }
    }

    /// Number of the next block to be emitted.
    pub fn block_number(&self) -> u64 {
        self.state.next_block
    }

    /// Offset of the next block to be emitted.
    pub fn offset(&self) -> u64 {
        self.state.offset
    }

    pub fn buffered_len(&self) -> usize {
        self.state.buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }

    /// Emits all buffered bytes, the final block marked last.
    pub fn finish(&mut self) -> Result<(), VfsError> {
        let emit = &mut self.emit;
        self.state
            .finish(&mut |info, data| emit(streamed(info, data)))
    }
}

impl<F> Write for StreamedBlockWriter<F>
where
    F: FnMut(StreamedDataBlock) -> Result<(), VfsError>,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let emit = &mut self.emit;
        self.state
            .write(buf, &mut |info, data| emit(streamed(info, data)))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.finish().map_err(io::Error::from)
    }
}
