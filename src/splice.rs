//! Compression splice.
//!
//! When COMPRESS=DEFLATE has been negotiated the splice interposes
//! between the command codec and the socket: outbound chunks are deflated
//! before they reach the wire and inbound chunks are inflated before they
//! reach the framing scanner. Neither side of the rest of the machinery
//! knows the splice exists.
//!
//! The splice is driven by a typed message protocol so the codec can run
//! either in-process or on a spawned worker task: `Start` activates the
//! engine, `Deflate`/`Inflate` carry chunks in, and `Deflated`/`Inflated`
//! carry the transformed bytes back on the output channel. The in-process
//! mode is a degenerate channel that transforms synchronously and pushes
//! straight to the output side, so the driver consumes both modes
//! identically.
//!
//! Both directions use raw DEFLATE streams with a sync flush after every
//! chunk, so each transformed chunk is immediately decodable by the peer.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Output buffer growth step for the codec loops.
const BUF_GROW: usize = 4 * 1024;

/// Messages into the compression codec.
#[derive(Debug)]
pub(crate) enum SpliceMessage {
    /// Activate the codec. Sent once.
    Start,
    /// Compress an outbound chunk.
    Deflate(Vec<u8>),
    /// Decompress an inbound chunk.
    Inflate(Vec<u8>),
}

/// Messages out of the compression codec.
#[derive(Debug)]
pub(crate) enum SpliceOutput {
    /// Compressed bytes ready for the socket.
    Deflated(Vec<u8>),
    /// Decompressed bytes ready for the framing scanner.
    Inflated(Vec<u8>),
    /// The codec failed; the connection is no longer usable.
    Failed(String),
}

/// Streaming raw-DEFLATE codec for one connection.
///
/// Holds one compressor and one decompressor for the lifetime of the
/// splice; DEFLATE state carries across chunks in both directions.
pub struct DeflateEngine {
    compress: Compress,
    decompress: Decompress,
}

impl std::fmt::Debug for DeflateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateEngine")
            .field("bytes_in", &self.compress.total_in())
            .field("bytes_out", &self.compress.total_out())
            .finish_non_exhaustive()
    }
}

impl Default for DeflateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeflateEngine {
    /// Creates a fresh engine with empty stream state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Raw streams: COMPRESS=DEFLATE carries no zlib wrapper.
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
        }
    }

    /// Compresses one chunk, sync-flushed so the peer can decode it
    /// without waiting for more output.
    ///
    /// # Errors
    ///
    /// Fails if the underlying DEFLATE stream errors; the stream state is
    /// unusable afterwards.
    pub fn deflate(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            if output.len() == output.capacity() {
                output.reserve(BUF_GROW);
            }
            let before = self.compress.total_in();
            let status = self
                .compress
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += usize::try_from(self.compress.total_in() - before).unwrap_or(usize::MAX);
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // A sync flush is complete once all input is consumed
                    // and the last call left spare output space.
                    if consumed == input.len() && output.len() < output.capacity() {
                        break;
                    }
                }
            }
        }
        Ok(output)
    }

    /// Decompresses one chunk of an ongoing DEFLATE stream.
    ///
    /// # Errors
    ///
    /// Fails on corrupt input; the stream state is unusable afterwards.
    pub fn inflate(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() * 3 + 64);
        let mut consumed = 0usize;
        loop {
            if output.len() == output.capacity() {
                output.reserve(BUF_GROW);
            }
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += usize::try_from(self.decompress.total_in() - before).unwrap_or(usize::MAX);
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == input.len() && output.len() < output.capacity() {
                        break;
                    }
                }
            }
        }
        Ok(output)
    }
}

/// The installed splice: routes chunks through the codec and surfaces the
/// transformed bytes on a single output channel.
pub(crate) struct CompressionSplice {
    mode: SpliceMode,
    output_tx: mpsc::UnboundedSender<SpliceOutput>,
    pub(crate) output_rx: mpsc::UnboundedReceiver<SpliceOutput>,
}

enum SpliceMode {
    /// Codec runs inline; messages are transformed at the call site.
    InProcess(DeflateEngine),
    /// Codec runs on a worker task fed over a channel.
    Worker(mpsc::UnboundedSender<SpliceMessage>),
}

impl CompressionSplice {
    /// Activates the splice, offloading to a worker task when requested.
    pub(crate) fn start(offload: bool) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let mode = if offload {
            let (message_tx, message_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_worker(message_rx, output_tx.clone()));
            let _ = message_tx.send(SpliceMessage::Start);
            SpliceMode::Worker(message_tx)
        } else {
            SpliceMode::InProcess(DeflateEngine::new())
        };
        Self {
            mode,
            output_tx,
            output_rx,
        }
    }

    /// Submits an outbound chunk for compression.
    pub(crate) fn deflate(&mut self, bytes: Vec<u8>) {
        self.submit(SpliceMessage::Deflate(bytes));
    }

    /// Submits an inbound chunk for decompression.
    pub(crate) fn inflate(&mut self, bytes: Vec<u8>) {
        self.submit(SpliceMessage::Inflate(bytes));
    }

    fn submit(&mut self, message: SpliceMessage) {
        match &mut self.mode {
            SpliceMode::InProcess(engine) => {
                if let Some(output) = apply(engine, message) {
                    let _ = self.output_tx.send(output);
                }
            }
            SpliceMode::Worker(message_tx) => {
                if message_tx.send(message).is_err() {
                    let _ = self
                        .output_tx
                        .send(SpliceOutput::Failed("compression worker gone".to_string()));
                }
            }
        }
    }
}

impl std::fmt::Debug for CompressionSplice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            SpliceMode::InProcess(_) => "in-process",
            SpliceMode::Worker(_) => "worker",
        };
        f.debug_struct("CompressionSplice")
            .field("mode", &mode)
            .finish_non_exhaustive()
    }
}

fn apply(engine: &mut DeflateEngine, message: SpliceMessage) -> Option<SpliceOutput> {
    match message {
        SpliceMessage::Start => None,
        SpliceMessage::Deflate(bytes) => Some(match engine.deflate(&bytes) {
            Ok(out) => SpliceOutput::Deflated(out),
            Err(e) => SpliceOutput::Failed(e.to_string()),
        }),
        SpliceMessage::Inflate(bytes) => Some(match engine.inflate(&bytes) {
            Ok(out) => SpliceOutput::Inflated(out),
            Err(e) => SpliceOutput::Failed(e.to_string()),
        }),
    }
}

/// Worker loop: owns the engine, transforms messages in arrival order,
/// exits when the splice (and with it the message channel) is dropped.
async fn run_worker(
    mut messages: mpsc::UnboundedReceiver<SpliceMessage>,
    output: mpsc::UnboundedSender<SpliceOutput>,
) {
    let mut engine = None;
    while let Some(message) = messages.recv().await {
        match message {
            SpliceMessage::Start => {
                engine = Some(DeflateEngine::new());
            }
            message => {
                let engine = engine.get_or_insert_with(DeflateEngine::new);
                let Some(out) = apply(engine, message) else {
                    continue;
                };
                let failed = matches!(out, SpliceOutput::Failed(_));
                if output.send(out).is_err() || failed {
                    break;
                }
            }
        }
    }
    tracing::trace!("compression worker stopped");
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_chunk() {
        let mut client = DeflateEngine::new();
        let mut server = DeflateEngine::new();

        let wire = client.deflate(b"W1 NOOP\r\n").unwrap();
        assert_ne!(wire, b"W1 NOOP\r\n".to_vec());
        let plain = server.inflate(&wire).unwrap();
        assert_eq!(plain, b"W1 NOOP\r\n");
    }

    #[test]
    fn test_roundtrip_carries_stream_state() {
        let mut client = DeflateEngine::new();
        let mut server = DeflateEngine::new();

        // Each chunk must be independently decodable on arrival, but the
        // DEFLATE dictionary spans the whole session.
        for i in 0..20 {
            let message = format!("W{i} FETCH (BODY[] {{3}}\r\nabc)\r\n");
            let wire = client.deflate(message.as_bytes()).unwrap();
            let plain = server.inflate(&wire).unwrap();
            assert_eq!(plain, message.as_bytes());
        }
    }

    #[test]
    fn test_roundtrip_empty_and_binary() {
        let mut client = DeflateEngine::new();
        let mut server = DeflateEngine::new();

        let empty = client.deflate(b"").unwrap();
        assert_eq!(server.inflate(&empty).unwrap(), b"");

        let binary: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        let wire = client.deflate(&binary).unwrap();
        assert_eq!(server.inflate(&wire).unwrap(), binary);
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        let mut engine = DeflateEngine::new();
        // 0xFF opens an invalid DEFLATE block.
        assert!(engine.inflate(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[tokio::test]
    async fn test_in_process_splice_roundtrip() {
        let mut splice = CompressionSplice::start(false);
        let mut peer = DeflateEngine::new();

        splice.deflate(b"W1 NOOP\r\n".to_vec());
        let SpliceOutput::Deflated(wire) = splice.output_rx.recv().await.unwrap() else {
            panic!("expected deflated output");
        };
        assert_eq!(peer.inflate(&wire).unwrap(), b"W1 NOOP\r\n");

        let inbound = peer.deflate(b"W1 OK done\r\n").unwrap();
        splice.inflate(inbound);
        let SpliceOutput::Inflated(plain) = splice.output_rx.recv().await.unwrap() else {
            panic!("expected inflated output");
        };
        assert_eq!(plain, b"W1 OK done\r\n");
    }

    #[tokio::test]
    async fn test_worker_splice_preserves_order() {
        let mut splice = CompressionSplice::start(true);
        let mut peer = DeflateEngine::new();

        splice.deflate(b"first\r\n".to_vec());
        splice.deflate(b"second\r\n".to_vec());

        let mut seen = Vec::new();
        for _ in 0..2 {
            let SpliceOutput::Deflated(wire) = splice.output_rx.recv().await.unwrap() else {
                panic!("expected deflated output");
            };
            seen.push(peer.inflate(&wire).unwrap());
        }
        assert_eq!(seen, vec![b"first\r\n".to_vec(), b"second\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_worker_splice_reports_failure() {
        let mut splice = CompressionSplice::start(true);
        splice.inflate(vec![0xFF, 0xFF, 0xFF, 0xFF]);
        match splice.output_rx.recv().await.unwrap() {
            SpliceOutput::Failed(_) => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
