//! Conversion between continuous byte streams and numbered data blocks.
//!
//! Output codecs implement [`std::io::Write`] and hand complete blocks to an
//! emission callback; input codecs implement [`std::io::Read`] and pull
//! blocks through a fetch callback.

mod input;
mod output;

pub use input::{BufferedBlockReader, StreamedBlockReader};
pub use output::{BufferedBlockWriter, StreamedBlockWriter};
