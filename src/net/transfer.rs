//! Chunked file transfer over an open data channel
//!
//! This module moves whole files over an already-negotiated channel while
//! preserving file boundaries and byte order. The framing is deliberately
//! minimal because the channel itself is ordered and reliable:
//!
//! - one **text** message carries the JSON [`TransferEnvelope`]
//!   (`{name, size, type}`), then
//! - `ceil(size / 16384)` **binary** messages carry the raw chunks in strict
//!   ascending offset order.
//!
//! There is no application-level acknowledgement, retransmission or
//! checksum: [`send_file`] returns once the last chunk's send call has been
//! issued. If the channel dies mid-transfer the in-flight file is dropped on
//! the receive side without a partial-file event. Callers sending a batch
//! must await each [`send_file`] before starting the next so envelopes and
//! chunks never interleave.
//!
//! The sender applies cooperative backpressure: before each chunk it checks
//! the channel's outbound buffered bytes against a 16 MiB high-water mark
//! and polls until the buffer drains, so a fast producer cannot grow the
//! send queue without bound.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Maximum bytes per binary chunk message. Safe for every SCTP peer.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Outbound buffered-bytes threshold above which the sender pauses.
pub const BUFFERED_AMOUNT_HIGH: usize = 16 * 1024 * 1024;

/// How often the sender re-checks the outbound buffer while paused.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that can occur during file transfers
#[derive(Error, Debug)]
pub enum TransferError {
    /// The data channel is not open
    #[error("data channel is not open")]
    ChannelClosed,

    /// The underlying channel rejected a send
    #[error("send failed: {0}")]
    Send(#[from] webrtc::Error),

    /// The envelope could not be serialized or parsed
    #[error("malformed transfer envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}

/// Metadata preceding one file's byte stream on the wire
///
/// Exactly one envelope precedes exactly one file's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    /// File name as presented by the sender
    pub name: String,
    /// Exact byte length of the file
    pub size: u64,
    /// MIME type hint
    #[serde(rename = "type")]
    pub mime: String,
}

/// A fully reassembled inbound file
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// File name from the envelope
    pub name: String,
    /// MIME type hint from the envelope
    pub mime: String,
    /// Complete file contents
    pub bytes: Bytes,
}

/// Callback invoked once per fully reassembled inbound file
pub type OnFileReceived = Arc<dyn Fn(ReceivedFile) + Send + Sync + 'static>;

/// Number of chunk messages a file of `size` bytes occupies on the wire.
///
/// A zero-byte file is a zero-chunk transfer: the envelope alone announces
/// and completes it.
#[inline]
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Sends one file over an open channel.
///
/// Serializes the envelope as a single text message, then streams the chunks
/// in ascending offset order, pausing whenever the channel's outbound buffer
/// is above [`BUFFERED_AMOUNT_HIGH`]. Completion is implicit: the function
/// returns once the last send call has been issued, not once the peer
/// acknowledges anything.
///
/// # Errors
///
/// Fails with [`TransferError::ChannelClosed`] if the channel is not (or no
/// longer) open, or [`TransferError::Send`] if the channel rejects a
/// message.
pub async fn send_file(
    channel: &Arc<RTCDataChannel>,
    name: &str,
    mime: &str,
    data: &[u8],
) -> Result<(), TransferError> {
    ensure_open(channel)?;

    let envelope = TransferEnvelope {
        name: name.to_owned(),
        size: data.len() as u64,
        mime: mime.to_owned(),
    };
    debug!(
        name = %envelope.name,
        size = envelope.size,
        chunks = chunk_count(envelope.size),
        "sending file"
    );

    channel.send_text(serde_json::to_string(&envelope)?).await?;

    for chunk in data.chunks(CHUNK_SIZE) {
        wait_for_drain(channel).await?;
        channel.send(&Bytes::copy_from_slice(chunk)).await?;
    }

    debug!(name = %envelope.name, "file sent");
    Ok(())
}

fn ensure_open(channel: &Arc<RTCDataChannel>) -> Result<(), TransferError> {
    if channel.ready_state() == RTCDataChannelState::Open {
        Ok(())
    } else {
        Err(TransferError::ChannelClosed)
    }
}

/// Polls until the outbound buffer is back under the high-water mark.
async fn wait_for_drain(channel: &Arc<RTCDataChannel>) -> Result<(), TransferError> {
    loop {
        ensure_open(channel)?;
        let buffered = channel.buffered_amount().await;
        if buffered <= BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        trace!(
            buffered,
            high_water = BUFFERED_AMOUNT_HIGH,
            "outbound buffer above high-water mark; pausing"
        );
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

/// Reassembly state for the inbound side of one channel
///
/// Explicit per-session state: reset on every new envelope and on channel
/// teardown, never shared across sessions.
#[derive(Debug, Default)]
pub struct ReassemblyState {
    /// Envelope of the file currently being reassembled
    envelope: Option<TransferEnvelope>,
    /// Accumulated chunk bytes
    buffer: Vec<u8>,
    /// Running count of received payload bytes
    received: u64,
}

impl ReassemblyState {
    /// Creates a fresh state, awaiting an envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles a text message, which always announces a new file.
    ///
    /// Any in-progress reassembly is abandoned: a sender that starts a new
    /// file before finishing the previous one has implicitly given up on it.
    /// A zero-size envelope completes immediately with an empty file.
    pub fn on_envelope(&mut self, text: &str) -> Result<Option<ReceivedFile>, TransferError> {
        if let Some(stale) = self.envelope.take() {
            warn!(
                name = %stale.name,
                received = self.received,
                expected = stale.size,
                "new envelope arrived mid-transfer; discarding partial file"
            );
        }

        let envelope: TransferEnvelope = serde_json::from_str(text)?;
        debug!(
            name = %envelope.name,
            size = envelope.size,
            "incoming file announced"
        );

        self.buffer = Vec::with_capacity(envelope.size as usize);
        self.received = 0;

        if envelope.size == 0 {
            return Ok(Some(ReceivedFile {
                name: envelope.name,
                mime: envelope.mime,
                bytes: Bytes::new(),
            }));
        }

        self.envelope = Some(envelope);
        Ok(None)
    }

    /// Handles a binary message: the next chunk of the current file.
    ///
    /// Returns the completed file once the running byte counter reaches the
    /// envelope's declared size. Chunks arriving with no envelope in place
    /// are dropped.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Option<ReceivedFile> {
        let Some(envelope) = self.envelope.as_ref() else {
            warn!(len = chunk.len(), "chunk arrived with no envelope; dropping");
            return None;
        };

        self.buffer.extend_from_slice(chunk);
        self.received += chunk.len() as u64;
        trace!(
            name = %envelope.name,
            received = self.received,
            expected = envelope.size,
            "chunk received"
        );

        if self.received < envelope.size {
            return None;
        }

        let envelope = self.envelope.take()?;
        let bytes = Bytes::from(std::mem::take(&mut self.buffer));
        self.received = 0;
        debug!(name = %envelope.name, size = bytes.len(), "file reassembled");
        Some(ReceivedFile {
            name: envelope.name,
            mime: envelope.mime,
            bytes,
        })
    }

    /// Discards any in-progress reassembly.
    ///
    /// Called on channel teardown: a file interrupted mid-transfer is lost
    /// silently rather than surfaced as a partial result.
    pub fn reset(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            warn!(
                name = %envelope.name,
                received = self.received,
                expected = envelope.size,
                "channel closed mid-transfer; partial file discarded"
            );
        }
        self.buffer = Vec::new();
        self.received = 0;
    }

    /// Whether a file is currently being reassembled.
    pub fn in_progress(&self) -> bool {
        self.envelope.is_some()
    }
}

/// Inbound half of the transfer engine for one channel.
///
/// Owns the [`ReassemblyState`] behind a mutex and dispatches channel
/// messages to it, invoking the file-received callback for every completed
/// file.
pub struct TransferEngine {
    state: Mutex<ReassemblyState>,
    on_file_received: OnFileReceived,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Creates an engine delivering completed files to `on_file_received`.
    pub fn new(on_file_received: OnFileReceived) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReassemblyState::new()),
            on_file_received,
        })
    }

    /// Dispatches one raw channel message.
    ///
    /// Text messages are envelopes, binary messages are chunks; malformed
    /// input is logged and dropped rather than tearing the session down.
    pub fn handle_message(&self, msg: &DataChannelMessage) {
        if msg.is_string {
            let Ok(text) = std::str::from_utf8(&msg.data) else {
                warn!("non-UTF-8 text frame ignored");
                return;
            };
            let result = self.state.lock().on_envelope(text);
            match result {
                Ok(Some(file)) => (self.on_file_received)(file),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "ignoring malformed envelope"),
            }
        } else {
            let completed = self.state.lock().on_chunk(&msg.data);
            if let Some(file) = completed {
                (self.on_file_received)(file);
            }
        }
    }

    /// Discards any in-progress reassembly (channel teardown).
    pub fn reset(&self) {
        self.state.lock().reset();
    }
}
