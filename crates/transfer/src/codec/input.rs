use std::io::{self, Read};

use tessera_protocol::{BufferedDataBlock, DataBlockInfo, StreamedDataBlock};

use crate::VfsError;

fn check_sequence(info: &DataBlockInfo, expected: u64) -> Result<(), VfsError> {
    if info.block_number != expected {
        return Err(VfsError::block_invalid(format!(
            "expected block {expected}, received block {}",
            info.block_number
        )));
    }
    Ok(())
}

/// Reconstructs a byte stream from [`BufferedDataBlock`]s.
///
/// Blocks are requested in order through `fetch`, starting at block 0. A
/// `None` block ends the stream, as does draining a block marked last.
pub struct BufferedBlockReader<F> {
    fetch: F,
    current: Vec<u8>,
    position: usize,
    next_block: u64,
    done: bool,
}

impl<F> BufferedBlockReader<F>
where
    F: FnMut(u64) -> Result<Option<BufferedDataBlock>, VfsError>,
{
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            current: Vec::new(),
            position: 0,
            next_block: 0,
            done: false,
        }
    }

    /// Number of blocks fetched so far.
    pub fn blocks_read(&self) -> u64 {
        self.next_block
    }
}

impl<F> Read for BufferedBlockReader<F>
where
    F: FnMut(u64) -> Result<Option<BufferedDataBlock>, VfsError>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let available = &self.current[self.position..];
            if !available.is_empty() {
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.position += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            match (self.fetch)(self.next_block)? {
                None => self.done = true,
                Some(block) => {
                    check_sequence(&block.info, self.next_block)?;
                    self.next_block += 1;
                    self.done = block.info.is_last_block;
                    self.current = block.data;
                    self.position = 0;
                }
            }
        }
    }
}

/// Reconstructs a byte stream from [`StreamedDataBlock`]s.
pub struct StreamedBlockReader<F> {
    fetch: F,
    current: Option<Box<dyn Read + Send>>,
    next_block: u64,
    done: bool,
}

impl<F> StreamedBlockReader<F>
where
    F: FnMut(u64) -> Result<Option<StreamedDataBlock>, VfsError>,
{
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            current: None,
            next_block: 0,
            done: false,
        }
    }

    pub fn blocks_read(&self) -> u64 {
        self.next_block
    }
}

impl<F> Read for StreamedBlockReader<F>
where
    F: FnMut(u64) -> Result<Option<StreamedDataBlock>, VfsError>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            if self.done {
                return Ok(0);
            }
            match (self.fetch)(self.next_block)? {
                None => self.done = true,
                Some(block) => {
                    check_sequence(&block.info, self.next_block)?;
                    self.next_block += 1;
                    self.done = block.info.is_last_block;
                    self.current = Some(block.data);
                }
            }
        }
    }
}
