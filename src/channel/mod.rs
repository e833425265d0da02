//! Secure Channel
//!
//! Wraps one raw byte stream. A channel starts as a plain passthrough and is
//! upgraded at most once, after a successful handshake, to an AES-256-CFB
//! stream with an optional raw-deflate layer on top:
//!
//! ```text
//! write: plaintext ─▶ deflate (optional) ─▶ encrypt ─▶ socket
//! read:  socket ─▶ decrypt ─▶ inflate (optional) ─▶ plaintext
//! ```
//!
//! Every read, write and close is bounded by an idle deadline.

mod cipher;
mod compress;
mod error;
pub mod handshake;
mod split;

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub use cipher::{Iv, KeyDerivation, SessionKey, StreamDecryptor, StreamEncryptor, BLOCK_SIZE};
pub use compress::{Deflater, Inflater};
pub use error::HandshakeError;
pub use handshake::{HandshakeRecord, Negotiated, MAX_CLOCK_SKEW_SECS, RECORD_LEN};
pub use split::{split, ReadHalf, WriteHalf};

/// Idle deadline applied to every read, write and close
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Ciphertext read ahead of inflation. Inflated output goes straight into the
/// caller's buffer, so this is all a compressed reader ever holds.
const INFLATE_READ_SIZE: usize = 32 * 1024;

fn idle_timeout_error(timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no traffic for {}s", timeout.as_secs()),
    )
}

/// Read half of a [`SecureChannel`]
pub struct SecureReader<R> {
    inner: R,
    decryptor: Option<StreamDecryptor>,
    inflate: Option<InflateState>,
    idle_timeout: Duration,
}

struct InflateState {
    inflater: Inflater,
    /// Decrypted, not yet inflated input in `input[start..end]`
    input: Vec<u8>,
    start: usize,
    end: usize,
    /// Last call filled the caller's buffer; the inflater may owe more
    output_full: bool,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    pub fn new(inner: R, idle_timeout: Duration) -> Self {
        Self {
            inner,
            decryptor: None,
            inflate: None,
            idle_timeout,
        }
    }

    pub fn upgrade(&mut self, session: &SessionKey, compression: bool) {
        self.decryptor = Some(StreamDecryptor::new(session));
        if compression {
            self.inflate = Some(InflateState {
                inflater: Inflater::new(),
                input: vec![0u8; INFLATE_READ_SIZE],
                start: 0,
                end: 0,
                output_full: false,
            });
        }
    }

    pub fn is_upgraded(&self) -> bool {
        self.decryptor.is_some()
    }

    /// Read plaintext into `buf`. `Ok(0)` means the peer closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let Some(state) = self.inflate.as_mut() else {
            let n = read_with_deadline(&mut self.inner, buf, self.idle_timeout).await?;
            if let Some(decryptor) = self.decryptor.as_mut() {
                decryptor.apply(&mut buf[..n]);
            }
            return Ok(n);
        };

        loop {
            if state.start < state.end || state.output_full {
                let (consumed, produced) = state
                    .inflater
                    .decompress_into(&state.input[state.start..state.end], buf)?;
                state.start += consumed;
                state.output_full = produced == buf.len();
                if produced > 0 {
                    return Ok(produced);
                }
                if consumed > 0 {
                    continue;
                }
            }

            // Keep the unconsumed tail and top up behind it
            if state.start > 0 {
                state.input.copy_within(state.start..state.end, 0);
                state.end -= state.start;
                state.start = 0;
            }
            if state.end == state.input.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "inflate made no progress on a full input buffer",
                ));
            }

            let end = state.end;
            let n = read_with_deadline(&mut self.inner, &mut state.input[end..], self.idle_timeout).await?;
            if n == 0 {
                return Ok(0);
            }
            if let Some(decryptor) = self.decryptor.as_mut() {
                decryptor.apply(&mut state.input[end..end + n]);
            }
            state.end += n;
        }
    }

    #[cfg(test)]
    fn inflate_footprint(&self) -> usize {
        self.inflate.as_ref().map_or(0, |state| state.input.capacity())
    }

    /// Raw read used by the handshake, before any transform is installed
    pub(crate) fn raw_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

/// Write half of a [`SecureChannel`]
pub struct SecureWriter<W> {
    inner: W,
    encryptor: Option<StreamEncryptor>,
    deflater: Option<Deflater>,
    scratch: Vec<u8>,
    idle_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    pub fn new(inner: W, idle_timeout: Duration) -> Self {
        Self {
            inner,
            encryptor: None,
            deflater: None,
            scratch: Vec::new(),
            idle_timeout,
        }
    }

    pub fn upgrade(&mut self, session: &SessionKey, compression: bool) {
        self.encryptor = Some(StreamEncryptor::new(session));
        if compression {
            self.deflater = Some(Deflater::new());
        }
    }

    /// Transform and write all of `data`, then flush.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let out: &[u8] = if self.encryptor.is_none() && self.deflater.is_none() {
            data
        } else {
            self.scratch.clear();
            match self.deflater.as_mut() {
                Some(deflater) => deflater.compress(data, &mut self.scratch)?,
                None => self.scratch.extend_from_slice(data),
            }
            if let Some(encryptor) = self.encryptor.as_mut() {
                encryptor.apply(&mut self.scratch);
            }
            &self.scratch
        };

        let inner = &mut self.inner;
        tokio::time::timeout(self.idle_timeout, async move {
            inner.write_all(out).await?;
            inner.flush().await
        })
        .await
        .map_err(|_| idle_timeout_error(self.idle_timeout))?
    }

    /// Shut down the write side, bounded by the idle deadline.
    pub async fn close(&mut self) -> io::Result<()> {
        tokio::time::timeout(self.idle_timeout, self.inner.shutdown())
            .await
            .map_err(|_| idle_timeout_error(self.idle_timeout))?
    }

    pub(crate) fn raw_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

async fn read_with_deadline<R: AsyncRead + Unpin>(
    inner: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> io::Result<usize> {
    tokio::time::timeout(timeout, inner.read(buf))
        .await
        .map_err(|_| idle_timeout_error(timeout))?
}

/// One leg of a relayed connection
pub struct SecureChannel<S> {
    reader: SecureReader<ReadHalf<S>>,
    writer: SecureWriter<WriteHalf<S>>,
    idle_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureChannel<S> {
    pub fn new(stream: S) -> Self {
        Self::with_idle_timeout(stream, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(stream: S, idle_timeout: Duration) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            reader: SecureReader::new(read_half, idle_timeout),
            writer: SecureWriter::new(write_half, idle_timeout),
            idle_timeout,
        }
    }

    pub fn is_upgraded(&self) -> bool {
        self.reader.is_upgraded()
    }

    /// Verify the peer's handshake record with `secret`.
    pub async fn authenticate_as_responder(
        &mut self,
        secret: &[u8],
    ) -> Result<Negotiated, HandshakeError> {
        let timeout = self.idle_timeout;
        tokio::time::timeout(
            timeout,
            handshake::authenticate_as_responder(self.reader.raw_mut(), secret),
        )
        .await
        .map_err(|_| HandshakeError::Io(idle_timeout_error(timeout)))?
    }

    /// Send our handshake record signed with `secret`.
    pub async fn authenticate_as_initiator(
        &mut self,
        secret: &[u8],
    ) -> Result<Negotiated, HandshakeError> {
        let timeout = self.idle_timeout;
        tokio::time::timeout(
            timeout,
            handshake::authenticate_as_initiator(self.writer.raw_mut(), secret),
        )
        .await
        .map_err(|_| HandshakeError::Io(idle_timeout_error(timeout)))?
    }

    /// Switch from passthrough to ciphered (and optionally compressed) I/O.
    ///
    /// A second call is ignored.
    pub fn upgrade(&mut self, session: &SessionKey, compression: bool) {
        if self.is_upgraded() {
            warn!("Secure channel already upgraded, ignoring");
            return;
        }
        self.reader.upgrade(session, compression);
        self.writer.upgrade(session, compression);
        if compression {
            debug!("Channel compression enabled");
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await
    }

    /// Close the channel; the underlying stream is dropped afterwards.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (SecureReader<ReadHalf<S>>, SecureWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}
