//! Chunked-stream decompression pipeline.
//!
//! The Payload entry of an installer container wraps its archive in a
//! chunked stream: a 4-byte `pbzx` magic, an 8-byte flags field, then a
//! sequence of chunks, each headed by big-endian inflated and deflated
//! sizes. A chunk whose deflated size is smaller than its inflated size
//! is a single XZ frame; equal sizes mean the bytes are already final
//! and pass through untouched; a larger deflated size is a protocol
//! violation.
//!
//! Chunks arrive in stream order but decompress independently, so a
//! semaphore-bounded pool of blocking workers inflates them in parallel
//! while a dedicated writer task reorders completed chunks with a
//! min-heap keyed by chunk index. The output is therefore byte-identical
//! to sequential decompression for any pool size, and is exposed as a
//! pull-based reader so the consumer can start unpacking before the
//! stream finishes. All queues are bounded, so a slow consumer throttles
//! the whole pipeline instead of growing memory.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::ExtractError;
use crate::sniff::PBZX_MAGIC;

/// Size of the stream header: magic plus flags.
const STREAM_HEADER_SIZE: usize = 12;

/// Size of a per-chunk header: inflated plus deflated size.
const CHUNK_HEADER_SIZE: usize = 16;

/// A completed chunk awaiting its turn in the ordered writer's heap.
struct Completed {
    index: u64,
    data: Bytes,
}

impl PartialEq for Completed {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Completed {}

impl PartialOrd for Completed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Completed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

/// Pull-based reader over the pipeline's ordered output.
///
/// Implements [`std::io::Read`] by blocking on the output channel, so it
/// must be consumed from a blocking context (`spawn_blocking`), mirroring
/// how the channel-to-file bridge works in the downloader this pipeline
/// is modeled on.
#[derive(Debug)]
pub struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(bytes) => self.current = bytes,
                None => return Ok(0),
            }
        }
        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = self.current.slice(n..);
        Ok(n)
    }
}

/// A running decompression pipeline: the ordered output reader plus the
/// driver task that owns every worker.
#[derive(Debug)]
pub struct PbzxStream {
    reader: ChunkReader,
    driver: JoinHandle<Result<(), ExtractError>>,
}

impl PbzxStream {
    /// Split into the output reader and the driver handle. The driver
    /// must be awaited after the reader is drained (or dropped): it
    /// resolves only once every pipeline task has stopped, and carries
    /// the first error captured anywhere in the pipeline.
    pub fn into_parts(self) -> (ChunkReader, JoinHandle<Result<(), ExtractError>>) {
        (self.reader, self.driver)
    }
}

/// Start a pipeline over a chunked stream with a worker pool sized to
/// the available processors.
///
/// # Errors
///
/// Returns [`ExtractError::MalformedStream`] immediately (before any
/// chunk is processed) if the stream does not begin with the `pbzx`
/// magic tag.
pub fn spawn(payload: Bytes) -> Result<PbzxStream, ExtractError> {
    spawn_with_workers(payload, num_cpus::get().max(1))
}

/// Start a pipeline with an explicit worker-pool size.
///
/// # Errors
///
/// Returns [`ExtractError::MalformedStream`] on a bad magic tag.
pub fn spawn_with_workers(payload: Bytes, workers: usize) -> Result<PbzxStream, ExtractError> {
    if payload.len() < STREAM_HEADER_SIZE || payload[..4] != PBZX_MAGIC {
        return Err(ExtractError::MalformedStream(
            "bad magic tag, not a chunked stream".to_string(),
        ));
    }
    let flags = u64::from_be_bytes(payload[4..12].try_into().unwrap_or_default());
    tracing::debug!(flags, workers, len = payload.len(), "starting chunk pipeline");

    let (out_tx, out_rx) = mpsc::channel::<Bytes>(workers.max(2));
    let driver = tokio::spawn(drive(payload, workers, out_tx));
    Ok(PbzxStream {
        reader: ChunkReader {
            rx: out_rx,
            current: Bytes::new(),
        },
        driver,
    })
}

/// Decompress a whole chunked stream into memory.
///
/// Convenience wrapper over [`spawn`] used where streaming consumption
/// is not needed (and by the equivalence tests).
///
/// # Errors
///
/// Propagates the pipeline's first captured error.
pub async fn decompress(payload: Bytes) -> Result<Vec<u8>, ExtractError> {
    decompress_with_workers(payload, num_cpus::get().max(1)).await
}

/// [`decompress`] with an explicit worker-pool size.
///
/// # Errors
///
/// Propagates the pipeline's first captured error.
pub async fn decompress_with_workers(
    payload: Bytes,
    workers: usize,
) -> Result<Vec<u8>, ExtractError> {
    let (mut reader, driver) = spawn_with_workers(payload, workers)?.into_parts();
    let drain = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map(|_| out)
    });
    let (drained, driven) = tokio::join!(drain, driver);
    driven.map_err(|e| ExtractError::Io(std::io::Error::other(e)))??;
    Ok(drained.map_err(|e| ExtractError::Io(std::io::Error::other(e)))??)
}

/// Dispatcher: walks chunk headers in stream order, hands compressed
/// chunks to the bounded worker pool, routes pass-through chunks
/// straight to the writer, then waits for full quiescence.
async fn drive(
    payload: Bytes,
    workers: usize,
    out_tx: mpsc::Sender<Bytes>,
) -> Result<(), ExtractError> {
    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = mpsc::channel::<(u64, Result<Bytes, ExtractError>)>(workers * 2);
    let writer = tokio::spawn(write_ordered(done_rx, out_tx, cancel.clone()));

    let semaphore = Arc::new(Semaphore::new(workers));
    let mut pool = JoinSet::new();
    let mut offset = STREAM_HEADER_SIZE;
    let mut index: u64 = 0;

    let dispatch: Result<(), ExtractError> = loop {
        if cancel.is_cancelled() || offset == payload.len() {
            break Ok(());
        }
        if payload.len() - offset < CHUNK_HEADER_SIZE {
            break Err(ExtractError::MalformedStream(format!(
                "chunk {index}: truncated chunk header at offset {offset}"
            )));
        }
        let inflated =
            u64::from_be_bytes(payload[offset..offset + 8].try_into().unwrap_or_default());
        let deflated = u64::from_be_bytes(
            payload[offset + 8..offset + 16]
                .try_into()
                .unwrap_or_default(),
        );
        offset += CHUNK_HEADER_SIZE;

        if deflated > inflated {
            break Err(ExtractError::MalformedStream(format!(
                "chunk {index}: deflated size {deflated} exceeds inflated size {inflated}"
            )));
        }
        if ((payload.len() - offset) as u64) < deflated {
            break Err(ExtractError::MalformedStream(format!(
                "chunk {index}: truncated chunk data, need {deflated} bytes at offset {offset}"
            )));
        }
        let data = payload.slice(offset..offset + deflated as usize);
        offset += deflated as usize;

        if deflated == inflated {
            // Already-final bytes bypass the pool but keep their index
            // in the ordering discipline.
            if done_tx.send((index, Ok(data))).await.is_err() {
                break Ok(());
            }
        } else {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ExtractError::Io(std::io::Error::other("worker pool closed")))?;
            let tx = done_tx.clone();
            let chunk_cancel = cancel.clone();
            let chunk_index = index;
            pool.spawn(async move {
                let _permit = permit;
                if chunk_cancel.is_cancelled() {
                    return;
                }
                let result =
                    match tokio::task::spawn_blocking(move || inflate(&data, inflated, chunk_index))
                        .await
                    {
                        Ok(result) => result,
                        Err(e) => Err(ExtractError::Decompression {
                            chunk: chunk_index,
                            reason: format!("worker panicked: {e}"),
                        }),
                    };
                let _ = tx.send((chunk_index, result)).await;
            });
        }
        index += 1;
    };

    if let Err(e) = dispatch {
        // Route the dispatcher's own failure through the writer's
        // first-error slot so a single error is reported.
        let _ = done_tx.send((index, Err(e))).await;
        cancel.cancel();
    }
    drop(done_tx);

    // Full quiescence before reporting: every worker joined, then the
    // writer, which holds the captured first error.
    while pool.join_next().await.is_some() {}
    writer
        .await
        .map_err(|e| ExtractError::Io(std::io::Error::other(e)))?
}

/// Ordered writer: buffers completed chunks in a min-heap and emits runs
/// of consecutive indices, so output order matches input order no matter
/// how workers finish.
async fn write_ordered(
    mut done_rx: mpsc::Receiver<(u64, Result<Bytes, ExtractError>)>,
    out_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<(), ExtractError> {
    let mut heap: BinaryHeap<Reverse<Completed>> = BinaryHeap::new();
    let mut next: u64 = 0;
    let mut first_error: Option<ExtractError> = None;

    while let Some((index, result)) = done_rx.recv().await {
        if first_error.is_some() {
            // First failure wins; later completions are drained and
            // discarded so no task blocks on a full queue.
            continue;
        }
        match result {
            Err(e) => {
                first_error = Some(e);
                cancel.cancel();
                heap.clear();
            }
            Ok(data) => {
                heap.push(Reverse(Completed { index, data }));
                while heap.peek().is_some_and(|Reverse(c)| c.index == next) {
                    let Some(Reverse(chunk)) = heap.pop() else {
                        break;
                    };
                    if out_tx.send(chunk.data).await.is_err() {
                        // Consumer dropped the reader: it has what it
                        // needs. Stop the producers and end cleanly.
                        cancel.cancel();
                        return Ok(());
                    }
                    next += 1;
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Inflate one compressed chunk frame to exactly its declared size.
///
/// The decoder is capped one byte past the declaration so a frame that
/// would expand far beyond it is rejected without materializing the
/// excess.
fn inflate(data: &Bytes, declared: u64, index: u64) -> Result<Bytes, ExtractError> {
    let mut out = Vec::with_capacity(declared as usize);
    xz2::read::XzDecoder::new(data.as_ref())
        .take(declared.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Decompression {
            chunk: index,
            reason: e.to_string(),
        })?;
    if out.len() as u64 > declared {
        return Err(ExtractError::Decompression {
            chunk: index,
            reason: format!("frame inflates past its declared size {declared}"),
        });
    }
    if out.len() as u64 != declared {
        return Err(ExtractError::Decompression {
            chunk: index,
            reason: format!("inflated to {} bytes, declared {declared}", out.len()),
        });
    }
    Ok(Bytes::from(out))
}
