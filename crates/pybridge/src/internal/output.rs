use bytes::Bytes;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;

use crate::error::{Error, Result};

/// One captured guest stream.
///
/// The pipe keeps everything the guest wrote; `clear` only moves the read
/// watermark, so the capacity bound covers the whole session.
pub struct CapturedOutput {
    name: &'static str,
    pipe: MemoryOutputPipe,
    watermark: usize,
}

impl CapturedOutput {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            pipe: MemoryOutputPipe::new(capacity),
            watermark: 0,
        }
    }

    /// Handle for the WASI context to write into.
    pub fn pipe(&self) -> MemoryOutputPipe {
        self.pipe.clone()
    }

    fn unread(&self) -> Bytes {
        let contents = self.pipe.contents();
        contents.slice(self.watermark.min(contents.len())..)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.unread()).into_owned()
    }

    pub fn clear(&mut self) {
        self.watermark = self.pipe.contents().len();
    }

    /// Drop the buffer. Fails if the WASI context still holds the pipe.
    pub fn release(self) -> Result<()> {
        let name = self.name;
        self.pipe
            .try_into_inner()
            .map(drop)
            .ok_or_else(|| Error::ResourceCloseFailed {
                resource: name,
                source: std::io::Error::other("stream is still attached to the guest"),
            })
    }
}
