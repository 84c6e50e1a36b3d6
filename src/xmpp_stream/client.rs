//! Stanza exchange over a negotiated connection.
//!
//! A `Client` owns the two halves of the connection and runs one task per direction:
//! - inbound: decodes top-level elements into `Stanza`s and queues them for `recv()`
//! - outbound: writes stanzas queued by `send()` in FIFO order
//!
//! Only the outbound task writes and only the inbound task reads. Both queues are
//! bounded, so a slow consumer stalls the decode loop (and, through TCP flow control,
//! the peer) instead of buffering without limit.

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::TokenError;
use super::negotiate::Stream;
use super::stanza::Stanza;
use super::token::{Token, TokenDecoder, TokenKind};

/// Capacity of the queue between the decode loop and `recv()`.
pub const INBOUND_QUEUE_CAPACITY: usize = 4;

/// Capacity of the queue between `send()` and the write loop.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 4;

const STREAM_CLOSE: &str = "</stream:stream>";

/// How the outbound (write) flow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEnd {
    /// The queue was closed and every queued stanza was written.
    Drained,
    /// Writing to the connection failed; remaining stanzas were dropped.
    WriteError(String),
    Cancelled,
    TaskFailed(String),
}

/// How the inbound (read) flow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEnd {
    /// The peer sent `</stream:stream>`.
    PeerClosed,
    /// The connection ended without a closing stream tag.
    Eof,
    /// Malformed input or a read error.
    DecodeError(String),
    /// The `Client` stopped accepting inbound stanzas.
    ReceiverDropped,
    Cancelled,
    TaskFailed(String),
}

/// Result of `Client::close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub outbound: OutboundEnd,
    pub inbound: InboundEnd,
}

/// A negotiated stream with its inbound and outbound stanza queues.
pub struct Client {
    stream: Stream,
    outbound_tx: Option<mpsc::Sender<Stanza>>,
    inbound_rx: mpsc::Receiver<Stanza>,
    outbound_task: Option<JoinHandle<OutboundEnd>>,
    inbound_task: Option<JoinHandle<InboundEnd>>,
    /// Cancels both tasks. Dropping the client drops the sender, which cancels as well.
    cancel: broadcast::Sender<()>,
}

impl Client {
    /// Start stanza exchange on a negotiated connection.
    ///
    /// `decoder` must be the one negotiation ran on, since it may already hold buffered
    /// bytes of the first stanzas.
    pub fn spawn<R, W>(stream: Stream, decoder: TokenDecoder<R>, writer: W) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (cancel, _) = broadcast::channel(1);

        let outbound_task = tokio::spawn(run_outbound(
            writer,
            outbound_rx,
            cancel.subscribe(),
            stream.id.clone(),
        ));
        let inbound_task = tokio::spawn(run_inbound(
            decoder,
            inbound_tx,
            cancel.subscribe(),
            stream.id.clone(),
        ));

        info!(stream_id = %stream.id, "Stanza exchange started");

        Self {
            stream,
            outbound_tx: Some(outbound_tx),
            inbound_rx,
            outbound_task: Some(outbound_task),
            inbound_task: Some(inbound_task),
            cancel,
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Queue a stanza for writing, waiting while the outbound queue is full.
    pub async fn send(&self, stanza: Stanza) -> Result<(), String> {
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or_else(|| "Outbound queue is closed".to_string())?;
        tx.send(stanza)
            .await
            .map_err(|_| "Outbound flow has stopped".to_string())
    }

    /// Next stanza from the peer, or `None` once the inbound flow has ended.
    pub async fn recv(&mut self) -> Option<Stanza> {
        self.inbound_rx.recv().await
    }

    /// Flush queued stanzas, close the stream and stop both flows.
    ///
    /// The outbound queue is closed and drained first, then the inbound flow is
    /// cancelled. Both tasks are joined before returning.
    pub async fn close(mut self) -> ClientSummary {
        drop(self.outbound_tx.take());

        let outbound = match self.outbound_task.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|e| OutboundEnd::TaskFailed(e.to_string())),
            None => OutboundEnd::Cancelled,
        };

        // The inbound task may already be gone; nothing to cancel then
        let _ = self.cancel.send(());
        let inbound = match self.inbound_task.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|e| InboundEnd::TaskFailed(e.to_string())),
            None => InboundEnd::Cancelled,
        };

        info!(
            stream_id = %self.stream.id,
            outbound = ?outbound,
            inbound = ?inbound,
            "Client closed"
        );
        ClientSummary { outbound, inbound }
    }
}

async fn run_outbound<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Stanza>,
    mut cancel: broadcast::Receiver<()>,
    stream_id: String,
) -> OutboundEnd
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(stanza) = next else {
                    break;
                };
                debug!(stream_id = %stream_id, data = %stanza.as_str(), "Sending stanza");
                if let Err(e) = write_flush(&mut writer, stanza.as_str()).await {
                    error!(stream_id = %stream_id, error = %e, "Stanza write error");
                    return OutboundEnd::WriteError(e.to_string());
                }
            }
            _ = cancel.recv() => {
                debug!(stream_id = %stream_id, "Outbound flow cancelled");
                return OutboundEnd::Cancelled;
            }
        }
    }

    // Queue closed and drained: end our side of the stream
    if let Err(e) = write_flush(&mut writer, STREAM_CLOSE).await {
        warn!(stream_id = %stream_id, error = %e, "Failed to write stream close");
        return OutboundEnd::WriteError(e.to_string());
    }
    if let Err(e) = writer.shutdown().await {
        debug!(stream_id = %stream_id, error = %e, "Connection shutdown failed");
    }
    OutboundEnd::Drained
}

async fn write_flush<W>(writer: &mut W, data: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data.as_bytes()).await?;
    writer.flush().await
}

async fn run_inbound<R>(
    mut decoder: TokenDecoder<R>,
    queue: mpsc::Sender<Stanza>,
    mut cancel: broadcast::Receiver<()>,
    stream_id: String,
) -> InboundEnd
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let next = tokio::select! {
            next = next_stanza(&mut decoder) => next,
            _ = cancel.recv() => return InboundEnd::Cancelled,
        };

        let stanza = match next {
            Ok(Some(stanza)) => stanza,
            Ok(None) => {
                info!(stream_id = %stream_id, "Peer closed the stream");
                return InboundEnd::PeerClosed;
            }
            Err(TokenError::Eof) => {
                info!(stream_id = %stream_id, "Connection closed without stream close");
                return InboundEnd::Eof;
            }
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "Inbound decode error");
                return InboundEnd::DecodeError(e.to_string());
            }
        };

        debug!(stream_id = %stream_id, data = %stanza.as_str(), "Received stanza");

        // Blocks while the inbound queue is full
        tokio::select! {
            sent = queue.send(stanza) => {
                if sent.is_err() {
                    return InboundEnd::ReceiverDropped;
                }
            }
            _ = cancel.recv() => return InboundEnd::Cancelled,
        }
    }
}

/// Read the next top-level stanza, skipping whitespace keepalives.
///
/// Returns `Ok(None)` when the peer closes the stream with `</stream:stream>`.
async fn next_stanza<R>(decoder: &mut TokenDecoder<R>) -> Result<Option<Stanza>, TokenError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match decoder.next_token().await? {
            Token::StartElement(root) => return Stanza::read(decoder, root).await.map(Some),
            Token::EndElement(end) if end.name.is(Some("stream"), "stream") => return Ok(None),
            Token::CharData(text) if text.trim().is_empty() => continue,
            other => {
                return Err(TokenError::WrongToken {
                    wanted: TokenKind::StartElement,
                    got: other.kind(),
                })
            }
        }
    }
}
