//! Connection manager: persistent multiplexed TCP connections.
//!
//! One connection per provider endpoint, created lazily on first send and
//! owned by a dedicated task. The task drives a `tokio::select!` over the
//! socket and the outbound queue, so per-connection handlers never run
//! concurrently: reads demultiplex response frames by sequence number
//! through a [`FrameAssembler`], and writes drain the queue one whole
//! frame at a time — at most one write is ever in flight per connection,
//! and queued frames reach the wire in FIFO submission order.
//!
//! On a socket error the task fails only this connection's in-flight
//! requests, sleeps the reconnect delay and tries again; once the retry
//! budget is spent the connection is evicted from the manager and every
//! remaining pending request for the endpoint is failed. A later send to
//! the same endpoint transparently creates a fresh connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::{DubboError, Result};
use crate::protocol::{Header, HEADER_SIZE};
use crate::registry::{RequestState, Shared};

/// Outbound queue depth per connection.
const CHANNEL_CAPACITY: usize = 1024;

/// A framed request ready to be written to a connection.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Sequence number of the pending request this frame belongs to.
    pub sequence: u64,
    /// Header and body as one contiguous buffer.
    pub bytes: Bytes,
}

type ConnectionMap = Arc<Mutex<HashMap<String, mpsc::Sender<OutboundFrame>>>>;

/// Owns one persistent connection per endpoint.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    config: ClientConfig,
    connections: ConnectionMap,
}

impl ConnectionManager {
    pub fn new(shared: Arc<Shared>, config: ClientConfig) -> Self {
        Self {
            shared,
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a frame to the endpoint's connection, creating it if needed.
    ///
    /// The frame's pending request transitions to `Queued` here; the
    /// connection task moves it through `Sending` and `Receiving`.
    pub async fn send(&self, endpoint: &str, frame: OutboundFrame) -> Result<()> {
        let tx = {
            let mut connections = self.connections.lock().expect("connection map poisoned");
            match connections.get(endpoint) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                    connections.insert(endpoint.to_string(), tx.clone());
                    tokio::spawn(connection_task(
                        endpoint.to_string(),
                        rx,
                        self.shared.clone(),
                        self.config.clone(),
                        self.connections.clone(),
                    ));
                    tracing::info!(endpoint, "creating connection");
                    tx
                }
            }
        };

        self.shared.mark(frame.sequence, RequestState::Queued);
        tx.send(frame)
            .await
            .map_err(|_| DubboError::ConnectionClosed)
    }

    /// Number of live connections (diagnostic).
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connection map poisoned").len()
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// All senders dropped; the client is shutting down.
    Shutdown,
    /// Peer closed the socket cleanly.
    Closed,
    /// Socket or framing error.
    Error(String),
}

/// Lifecycle task for one endpoint: connect, run, reconnect, evict.
async fn connection_task(
    endpoint: String,
    mut rx: mpsc::Receiver<OutboundFrame>,
    shared: Arc<Shared>,
    config: ClientConfig,
    connections: ConnectionMap,
) {
    let mut retries: u32 = 0;
    loop {
        tracing::debug!(endpoint = endpoint.as_str(), "connecting");
        match TcpStream::connect(endpoint.as_str()).await {
            Ok(stream) => {
                tracing::info!(endpoint = endpoint.as_str(), "connected");
                retries = 0;
                match run_connected(&endpoint, stream, &mut rx, &shared, &config).await {
                    SessionEnd::Shutdown => {
                        connections
                            .lock()
                            .expect("connection map poisoned")
                            .remove(&endpoint);
                        return;
                    }
                    SessionEnd::Closed => {
                        // No failure sweep: the call timeout covers any
                        // request the peer left unanswered.
                        tracing::info!(endpoint = endpoint.as_str(), "connection closed by peer");
                    }
                    SessionEnd::Error(reason) => {
                        let failed = shared.fail_in_flight(&endpoint, &reason);
                        tracing::warn!(
                            endpoint = endpoint.as_str(),
                            reason = reason.as_str(),
                            failed,
                            "connection error"
                        );
                    }
                }
            }
            Err(e) => {
                let reason = format!("connect failed: {e}");
                let failed = shared.fail_in_flight(&endpoint, &reason);
                tracing::warn!(
                    endpoint = endpoint.as_str(),
                    error = %e,
                    failed,
                    "connect failed"
                );
            }
        }

        retries += 1;
        if retries > config.max_reconnect_attempts {
            connections
                .lock()
                .expect("connection map poisoned")
                .remove(&endpoint);
            let failed = shared.fail_endpoint(&endpoint, "connection abandoned after retry budget");
            tracing::warn!(
                endpoint = endpoint.as_str(),
                retries,
                failed,
                "retry budget exhausted, evicting connection"
            );
            return;
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

/// Connected loop: reads demultiplex, writes drain the queue one frame at
/// a time. Frames still queued when this returns stay in `rx` and are
/// flushed after reconnecting.
async fn run_connected(
    endpoint: &str,
    stream: TcpStream,
    rx: &mut mpsc::Receiver<OutboundFrame>,
    shared: &Arc<Shared>,
    config: &ClientConfig,
) -> SessionEnd {
    let (mut reader, mut writer) = stream.into_split();
    let mut assembler = FrameAssembler::new(endpoint, config.max_body_size);
    let mut buf = vec![0u8; config.read_buffer_size];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return SessionEnd::Closed,
                Ok(n) => {
                    if let Err(e) = assembler.feed(&buf[..n], shared) {
                        // A framing error means the stream is desynced;
                        // only a reconnect can recover it.
                        return SessionEnd::Error(format!("framing error: {e}"));
                    }
                }
                Err(e) => return SessionEnd::Error(format!("read error: {e}")),
            },
            frame = rx.recv() => match frame {
                None => return SessionEnd::Shutdown,
                Some(frame) => {
                    // Requests resolved while queued (timeout, eviction
                    // race) no longer have an entry; skip their frames.
                    if !shared.mark(frame.sequence, RequestState::Sending) {
                        tracing::debug!(sequence = frame.sequence, "dropping frame for resolved request");
                        continue;
                    }
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        return SessionEnd::Error(format!("write error: {e}"));
                    }
                    shared.mark(frame.sequence, RequestState::Receiving);
                }
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &OutboundFrame) -> std::io::Result<()> {
    writer.write_all(&frame.bytes).await?;
    writer.flush().await
}

/// Parsing state between socket reads.
enum AssemblerState {
    /// Accumulating the 16 header bytes.
    Header { staged: [u8; HEADER_SIZE], filled: usize },
    /// Header parsed and span reserved; body bytes append into the arena.
    Body { header: Header, remaining: usize },
    /// Body bytes of an unknown or rejected sequence; consume and discard.
    Skip { remaining: usize },
}

/// Extracts zero or more complete frames per read and resolves their
/// pending requests through the shared registry and arena.
///
/// Frame boundaries are not aligned with TCP reads: one read may carry a
/// partial header, a header plus part of its body, or several complete
/// frames for different sequences back to back. Each frame is attributed
/// by its own header's sequence number.
pub(crate) struct FrameAssembler {
    endpoint: String,
    state: AssemblerState,
    max_body_size: u32,
}

impl FrameAssembler {
    pub(crate) fn new(endpoint: &str, max_body_size: u32) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: AssemblerState::Header {
                staged: [0u8; HEADER_SIZE],
                filled: 0,
            },
            max_body_size,
        }
    }

    /// Consume one chunk of socket data.
    pub(crate) fn feed(&mut self, mut data: &[u8], shared: &Shared) -> Result<()> {
        while !data.is_empty() {
            match &mut self.state {
                AssemblerState::Header { staged, filled } => {
                    let take = (HEADER_SIZE - *filled).min(data.len());
                    staged[*filled..*filled + take].copy_from_slice(&data[..take]);
                    *filled += take;
                    data = &data[take..];
                    if *filled == HEADER_SIZE {
                        let raw = *staged;
                        let header = Header::decode(&raw)
                            .ok_or_else(|| DubboError::Protocol("header truncated".into()))?;
                        header.validate(&raw, self.max_body_size)?;
                        self.state = self.begin_body(header, shared);
                    }
                }
                AssemblerState::Body { header, remaining } => {
                    let take = (*remaining).min(data.len());
                    let sequence = header.sequence;
                    // The request may have been resolved while its body was
                    // still arriving (timeout, failure sweep); its span is
                    // gone, so the rest of the body is discarded without
                    // touching the stream framing.
                    let span_live = shared.with(|state| {
                        if state.arena.remaining(sequence).is_some() {
                            state.arena.write(sequence, &data[..take]).map(|_| true)
                        } else {
                            Ok(false)
                        }
                    })?;
                    if !span_live {
                        tracing::debug!(sequence, "request resolved mid-body, discarding remainder");
                        let left = *remaining;
                        self.state = AssemblerState::Skip { remaining: left };
                        continue;
                    }
                    *remaining -= take;
                    data = &data[take..];
                    if *remaining == 0 {
                        let status = header.status;
                        shared.resolve_from_arena(sequence, status);
                        self.state = Self::fresh_header();
                    }
                }
                AssemblerState::Skip { remaining } => {
                    let take = (*remaining).min(data.len());
                    *remaining -= take;
                    data = &data[take..];
                    if *remaining == 0 {
                        self.state = Self::fresh_header();
                    }
                }
            }
        }
        Ok(())
    }

    /// Decide what to do with the body that follows a complete header.
    fn begin_body(&self, header: Header, shared: &Shared) -> AssemblerState {
        let body_length = header.body_length as usize;
        let sequence = header.sequence;

        if !shared.with(|state| state.registry.contains(sequence)) {
            tracing::warn!(
                endpoint = self.endpoint.as_str(),
                sequence,
                "no pending request for response, discarding"
            );
            return if body_length == 0 {
                Self::fresh_header()
            } else {
                AssemblerState::Skip {
                    remaining: body_length,
                }
            };
        }

        if body_length == 0 {
            shared.resolve_from_arena(sequence, header.status);
            return Self::fresh_header();
        }

        // Reserve the full expected body up front so later chunks only
        // append; rejection fails this request alone and the stream stays
        // in sync by skipping the body.
        match shared.with(|state| state.arena.alloc(sequence, body_length)) {
            Ok(()) => {
                shared.mark(sequence, RequestState::Receiving);
                AssemblerState::Body {
                    header,
                    remaining: body_length,
                }
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = self.endpoint.as_str(),
                    sequence,
                    body_length,
                    "response buffer exhausted, rejecting request"
                );
                shared.fail(sequence, e);
                AssemblerState::Skip {
                    remaining: body_length,
                }
            }
        }
    }

    fn fresh_header() -> AssemblerState {
        AssemblerState::Header {
            staged: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}
