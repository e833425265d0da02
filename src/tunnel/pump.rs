//! Bidirectional pump
//!
//! Two supervised copy tasks, one per direction, share a [`ReleaseGate`]. The
//! first direction to finish (EOF, I/O error or panic) fires the gate: the
//! other direction is told to stop and the release callback runs. Later fires
//! are no-ops, so the callback runs exactly once however the two directions
//! race. Each task shuts down the writer it owns on the way out.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::BufferPool;
use crate::channel::{ReadHalf, SecureChannel, SecureReader, SecureWriter, WriteHalf};
use crate::task::spawn_supervised_with_fault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    InboundToOutbound,
    OutboundToInbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::InboundToOutbound => "inbound->outbound",
            Direction::OutboundToInbound => "outbound->inbound",
        })
    }
}

/// How the pump ended, as seen by the first direction to finish
#[derive(Debug)]
pub enum PumpEnd {
    Eof(Direction),
    Failed(Direction, io::Error),
    Fault(Direction),
}

impl PumpEnd {
    pub fn direction(&self) -> Direction {
        match self {
            PumpEnd::Eof(d) | PumpEnd::Failed(d, _) | PumpEnd::Fault(d) => *d,
        }
    }
}

impl fmt::Display for PumpEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpEnd::Eof(d) => write!(f, "{} eof", d),
            PumpEnd::Failed(d, e) => write!(f, "{} failed: {}", d, e),
            PumpEnd::Fault(d) => write!(f, "{} crashed", d),
        }
    }
}

type ReleaseFn = Box<dyn FnOnce(PumpEnd) + Send>;

/// Single-fire gate shared by both copy directions
pub struct ReleaseGate {
    fired: AtomicBool,
    stop: CancellationToken,
    release: Mutex<Option<ReleaseFn>>,
}

impl ReleaseGate {
    pub fn new(release: impl FnOnce(PumpEnd) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            stop: CancellationToken::new(),
            release: Mutex::new(Some(Box::new(release))),
        })
    }

    /// Stop both directions and run the release callback.
    ///
    /// Returns `false` if the gate had already fired.
    pub fn fire(&self, end: PumpEnd) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Release gate already fired, dropping {}", end);
            return false;
        }

        self.stop.cancel();
        let release = self.release.lock().take();
        if let Some(release) = release {
            release(end);
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

/// Running pump for one connection
pub struct Pump {
    gate: Arc<ReleaseGate>,
    tasks: [JoinHandle<Option<()>>; 2],
}

impl Pump {
    /// Start copying between the two legs. `release` runs once, when the
    /// first direction ends.
    pub fn start<A, B>(
        label: &str,
        inbound: SecureChannel<A>,
        outbound: SecureChannel<B>,
        pool: &BufferPool,
        release: impl FnOnce(PumpEnd) + Send + 'static,
    ) -> Self
    where
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let gate = ReleaseGate::new(release);
        let (inbound_reader, inbound_writer) = inbound.into_split();
        let (outbound_reader, outbound_writer) = outbound.into_split();

        let forward = spawn_direction(
            label,
            Direction::InboundToOutbound,
            inbound_reader,
            outbound_writer,
            pool.clone(),
            gate.clone(),
        );
        let backward = spawn_direction(
            label,
            Direction::OutboundToInbound,
            outbound_reader,
            inbound_writer,
            pool.clone(),
            gate.clone(),
        );

        Self {
            gate,
            tasks: [forward, backward],
        }
    }

    pub fn is_released(&self) -> bool {
        self.gate.has_fired()
    }

    /// Wait for both directions to exit.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn spawn_direction<R, W>(
    label: &str,
    direction: Direction,
    mut reader: SecureReader<ReadHalf<R>>,
    mut writer: SecureWriter<WriteHalf<W>>,
    pool: BufferPool,
    gate: Arc<ReleaseGate>,
) -> JoinHandle<Option<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let fault_gate = gate.clone();
    spawn_supervised_with_fault(
        format!("{} {}", label, direction),
        async move {
            // Back to the pool on drop, also while unwinding
            let mut buf = pool.acquire();
            let end = tokio::select! {
                result = copy_stream(&mut reader, &mut writer, &mut buf) => Some(match result {
                    Ok(bytes) => {
                        debug!("{} copied {} bytes", direction, bytes);
                        PumpEnd::Eof(direction)
                    }
                    Err(e) => PumpEnd::Failed(direction, e),
                }),
                // The other direction finished first and already fired
                _ = gate.stopped() => None,
            };
            if let Some(end) = end {
                gate.fire(end);
            }

            // Each task closes only the writer it owns
            if let Err(e) = writer.close().await {
                trace!("{} close: {}", direction, e);
            }
        },
        move || {
            fault_gate.fire(PumpEnd::Fault(direction));
        },
    )
}

async fn copy_stream<R, W>(
    reader: &mut SecureReader<R>,
    writer: &mut SecureWriter<W>,
    buf: &mut [u8],
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
