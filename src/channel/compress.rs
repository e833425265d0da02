//! Streaming raw-deflate layer
//!
//! Each write is compressed and sync-flushed so the peer can inflate
//! everything sent so far without waiting for more input.

use std::io;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

/// Minimum spare output capacity before each (de)compress call
const SPARE: usize = 256;

/// Output growth step
const CHUNK: usize = 16 * 1024;

pub struct Deflater {
    inner: Compress,
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Deflater {
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::fast(), false),
        }
    }

    /// Compress `input` into `out` and sync-flush.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let mut consumed = 0usize;
        loop {
            if out.capacity() - out.len() < SPARE {
                out.reserve(CHUNK);
            }
            let (in_before, out_before) = (self.inner.total_in(), self.inner.total_out());
            self.inner
                .compress_vec(&input[consumed..], out, FlushCompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let read = (self.inner.total_in() - in_before) as usize;
            let written = self.inner.total_out() - out_before;
            consumed += read;

            if consumed == input.len() && out.len() < out.capacity() {
                return Ok(());
            }
            if read == 0 && written == 0 {
                return Ok(());
            }
        }
    }
}

pub struct Inflater {
    inner: Decompress,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    /// Inflate from `input` into the fixed `out` slice.
    ///
    /// Returns `(consumed, produced)`. Output that did not fit stays inside
    /// the inflater and comes out on the next call, even with empty input.
    pub fn decompress_into(&mut self, input: &[u8], out: &mut [u8]) -> io::Result<(usize, usize)> {
        let (in_before, out_before) = (self.inner.total_in(), self.inner.total_out());
        self.inner
            .decompress(input, out, FlushDecompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((
            (self.inner.total_in() - in_before) as usize,
            (self.inner.total_out() - out_before) as usize,
        ))
    }
}
