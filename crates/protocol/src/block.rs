//! Data block descriptors.

use std::io::Read;

use serde::{Deserialize, Serialize};

/// Describes one block of a transfer.
///
/// `is_last_block` marks the block that was transmitted last, which is not
/// necessarily the one with the highest block number when a backend accepts
/// blocks in random order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBlockInfo {
    pub transfer_id: String,
    pub block_number: u64,
    /// Payload length; `None` for streamed blocks of unknown length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_length: Option<u64>,
    /// Byte offset of the block within the resource.
    pub offset: u64,
    #[serde(default)]
    pub is_last_block: bool,
}

/// A block carrying its payload in memory.
///
/// The `data` field is base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedDataBlock {
    #[serde(flatten)]
    pub info: DataBlockInfo,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl BufferedDataBlock {
    /// Creates a block whose length is taken from `data`.
    pub fn new(
        transfer_id: impl Into<String>,
        block_number: u64,
        offset: u64,
        data: Vec<u8>,
        is_last_block: bool,
    ) -> Self {
        Self {
            info: DataBlockInfo {
                transfer_id: transfer_id.into(),
                block_number,
                block_length: Some(data.len() as u64),
                offset,
                is_last_block,
            },
            data,
        }
    }
}

/// A block whose payload is a bounded reader.
pub struct StreamedDataBlock {
    pub info: DataBlockInfo,
    pub data: Box<dyn Read + Send>,
}

impl StreamedDataBlock {
    pub fn new(info: DataBlockInfo, data: Box<dyn Read + Send>) -> Self {
        Self { info, data }
    }

    /// Drains the payload into memory.
    pub fn into_buffered(mut self) -> std::io::Result<BufferedDataBlock> {
        let mut data = Vec::new();
        self.data.read_to_end(&mut data)?;
        self.info.block_length = Some(data.len() as u64);
        Ok(BufferedDataBlock {
            info: self.info,
            data,
        })
    }
}

impl std::fmt::Debug for StreamedDataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedDataBlock")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
