//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message schema helpers and protocol codecs."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! TCP transports between tiers.
//!
//! Three shapes are provided:
//! * [`RequestClient`] / [`ReplyServer`]: strict request/reply, one
//!   outstanding request per client.
//! * [`IngestListener`]: many producers fanning into one bounded queue.
//! * [`PushSender`] / [`PushQueue`]: one-way pushes with no reply.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{encode_frame, write_frame, FrameReader};
use crate::logging::{log_message, log_reply, MessageDirection};
use crate::types::{Ack, Message, Readings, ReadingsRequest, Reply};
use crate::{MessagingError, Result};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A decoded frame together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Decoded message.
    pub message: Message,
    /// Size of the frame on the wire, delimiter included.
    pub frame_bytes: usize,
    /// Remote address of the sender.
    pub peer: SocketAddr,
}

/// Failure of a single forward to a downstream tier.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Connection could not be established.
    #[error("unable to connect to {endpoint}: {source}")]
    Connect {
        /// Downstream address.
        endpoint: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// No reply arrived within the request timeout.
    #[error("no reply from {endpoint} within {timeout:?}")]
    Timeout {
        /// Downstream address.
        endpoint: SocketAddr,
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// Peer closed the connection before replying.
    #[error("{endpoint} closed the connection before replying")]
    Closed {
        /// Downstream address.
        endpoint: SocketAddr,
    },
    /// Encoding, decoding, or socket failure mid-exchange.
    #[error("transport failure talking to {endpoint}: {source}")]
    Transport {
        /// Downstream address.
        endpoint: SocketAddr,
        /// Underlying messaging error.
        #[source]
        source: MessagingError,
    },
    /// Reply had a different shape than the request calls for.
    #[error("{endpoint} answered with an unexpected {kind} reply")]
    UnexpectedReply {
        /// Downstream address.
        endpoint: SocketAddr,
        /// Reply discriminant received.
        kind: &'static str,
    },
}

impl ForwardError {
    /// Downstream address the failure concerns.
    pub fn endpoint(&self) -> SocketAddr {
        match self {
            ForwardError::Connect { endpoint, .. }
            | ForwardError::Timeout { endpoint, .. }
            | ForwardError::Closed { endpoint }
            | ForwardError::Transport { endpoint, .. }
            | ForwardError::UnexpectedReply { endpoint, .. } => *endpoint,
        }
    }
}

/// Synchronous request/reply channel to a downstream tier.
///
/// Taking `&mut self` keeps at most one request outstanding per channel.
#[async_trait]
pub trait RequestChannel: Send {
    /// Address of the downstream tier.
    fn endpoint(&self) -> SocketAddr;

    /// Send one request and wait for exactly one reply.
    async fn request(&mut self, message: &Message) -> std::result::Result<Reply, ForwardError>;

    /// Send one request that must be acknowledged.
    async fn expect_ack(&mut self, message: &Message) -> std::result::Result<Ack, ForwardError> {
        match self.request(message).await? {
            Reply::Ack(ack) => Ok(ack),
            other => Err(ForwardError::UnexpectedReply {
                endpoint: self.endpoint(),
                kind: other.kind(),
            }),
        }
    }

    /// Ask for the most recent stored readings of one sensor type.
    async fn readings(
        &mut self,
        request: ReadingsRequest,
    ) -> std::result::Result<Readings, ForwardError> {
        match self.request(&Message::Request(request)).await? {
            Reply::Readings(readings) => Ok(readings),
            other => Err(ForwardError::UnexpectedReply {
                endpoint: self.endpoint(),
                kind: other.kind(),
            }),
        }
    }
}

struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// TCP implementation of [`RequestChannel`].
///
/// Connects lazily and reconnects on the next request after any failure. A
/// request that times out also drops the connection so a late reply can never
/// be paired with the following request.
pub struct RequestClient {
    endpoint: SocketAddr,
    timeout: Duration,
    connection: Option<Connection>,
}

impl RequestClient {
    /// Create a client without connecting.
    pub fn new(endpoint: SocketAddr, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            connection: None,
        }
    }

    /// Create a client and attempt an initial connection.
    ///
    /// An unreachable peer is logged, not fatal; the next request retries.
    pub async fn connect(endpoint: SocketAddr, timeout_budget: Duration) -> Self {
        let mut client = Self::new(endpoint, timeout_budget);
        match timeout(timeout_budget, open_connection(endpoint)).await {
            Ok(Ok(connection)) => {
                debug!(%endpoint, "request channel connected");
                client.connection = Some(connection);
            }
            Ok(Err(err)) => warn!(%endpoint, error = %err, "downstream not reachable yet"),
            Err(_) => warn!(%endpoint, ?timeout_budget, "downstream connect timed out"),
        }
        client
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Request timeout applied to every exchange.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn exchange(&mut self, message: &Message) -> std::result::Result<Reply, ForwardError> {
        let endpoint = self.endpoint;
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => open_connection(endpoint).await?,
        };

        log_message(MessageDirection::Outbound, endpoint, message);
        write_frame(&mut connection.writer, message)
            .await
            .map_err(|source| ForwardError::Transport { endpoint, source })?;

        match connection.reader.next_frame::<Reply>().await {
            Ok(Some((reply, _))) => {
                log_reply(MessageDirection::Inbound, endpoint, &reply);
                self.connection = Some(connection);
                Ok(reply)
            }
            Ok(None) => Err(ForwardError::Closed { endpoint }),
            Err(source) => Err(ForwardError::Transport { endpoint, source }),
        }
    }
}

async fn open_connection(endpoint: SocketAddr) -> std::result::Result<Connection, ForwardError> {
    let stream = TcpStream::connect(endpoint)
        .await
        .map_err(|source| ForwardError::Connect { endpoint, source })?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%endpoint, error = %err, "unable to disable nagle");
    }
    let (reader, writer) = stream.into_split();
    Ok(Connection {
        reader: FrameReader::new(reader),
        writer,
    })
}

#[async_trait]
impl RequestChannel for RequestClient {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn request(&mut self, message: &Message) -> std::result::Result<Reply, ForwardError> {
        let endpoint = self.endpoint;
        let budget = self.timeout;
        let outcome = timeout(budget, self.exchange(message)).await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                self.connection = None;
                Err(err)
            }
            Err(_) => {
                self.connection = None;
                Err(ForwardError::Timeout {
                    endpoint,
                    timeout: budget,
                })
            }
        }
    }
}

/// Server side logic answering request frames.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce exactly one reply for a request.
    async fn handle(&self, inbound: Inbound) -> Reply;
}

/// Accept loop serving a [`RequestHandler`].
///
/// Malformed frames are answered with a `rejected` acknowledgment so the
/// client always receives exactly one reply per request.
pub struct ReplyServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReplyServer {
    /// Bind `addr` and start serving.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(%local_addr, "reply server listening");
        let task = tokio::spawn(serve_requests(listener, handler, shutdown_rx));
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    /// Bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close open connections, and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "reply server task ended abnormally");
        }
    }
}

async fn serve_requests(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "request connection accepted");
                    connections.spawn(serve_request_connection(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

async fn serve_request_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(reader);
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = reader.next_frame::<Message>() => frame,
        };
        let reply = match frame {
            Ok(Some((message, frame_bytes))) => {
                log_message(MessageDirection::Inbound, peer, &message);
                handler
                    .handle(Inbound {
                        message,
                        frame_bytes,
                        peer,
                    })
                    .await
            }
            Ok(None) => break,
            Err(MessagingError::Json(err)) => {
                warn!(%peer, error = %err, "rejecting malformed request");
                Reply::Ack(Ack::rejected())
            }
            Err(err) => {
                warn!(%peer, error = %err, "closing request connection");
                break;
            }
        };
        log_reply(MessageDirection::Outbound, peer, &reply);
        if let Err(err) = write_frame(&mut writer, &reply).await {
            debug!(%peer, error = %err, "reply write failed");
            break;
        }
    }
    debug!(%peer, "request connection closed");
}

/// Point-in-time view of [`IngestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Frames decoded successfully.
    pub received: u64,
    /// Frames discarded because the queue was full.
    pub dropped: u64,
    /// Frames that failed to decode.
    pub malformed: u64,
}

/// Counters shared between ingest connections.
#[derive(Debug, Default)]
pub struct IngestCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

impl IngestCounters {
    fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture the current counter values.
    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Fan-in listener feeding one bounded queue.
///
/// When the queue is full the newest frame is dropped, counted, and logged;
/// producers are never blocked.
pub struct IngestListener {
    local_addr: SocketAddr,
    counters: Arc<IngestCounters>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngestListener {
    /// Bind `addr` and return the listener with the consuming end of its queue.
    pub async fn bind(
        addr: SocketAddr,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<Inbound>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(IngestCounters::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(%local_addr, capacity, "ingest listener bound");
        let task = tokio::spawn(serve_ingest(
            listener,
            tx,
            Arc::clone(&counters),
            shutdown_rx,
        ));
        Ok((
            Self {
                local_addr,
                counters,
                shutdown,
                task,
            },
            rx,
        ))
    }

    /// Bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared counter handle.
    pub fn counters(&self) -> Arc<IngestCounters> {
        Arc::clone(&self.counters)
    }

    /// Current counter values.
    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Release the port and close every producer connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "ingest task ended abnormally");
        }
    }
}

async fn serve_ingest(
    listener: TcpListener,
    queue: mpsc::Sender<Inbound>,
    counters: Arc<IngestCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "producer connected");
                    connections.spawn(serve_ingest_connection(
                        stream,
                        peer,
                        queue.clone(),
                        Arc::clone(&counters),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

async fn serve_ingest_connection(
    stream: TcpStream,
    peer: SocketAddr,
    queue: mpsc::Sender<Inbound>,
    counters: Arc<IngestCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = FrameReader::new(stream);
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = reader.next_frame::<Message>() => frame,
        };
        match frame {
            Ok(Some((message, frame_bytes))) => {
                counters.record_received();
                log_message(MessageDirection::Inbound, peer, &message);
                let inbound = Inbound {
                    message,
                    frame_bytes,
                    peer,
                };
                match queue.try_send(inbound) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        counters.record_dropped();
                        warn!(
                            %peer,
                            kind = dropped.message.kind(),
                            "ingest queue full; dropping message"
                        );
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Ok(None) => break,
            Err(MessagingError::Json(err)) => {
                counters.record_malformed();
                warn!(%peer, error = %err, "discarding malformed frame");
            }
            Err(err) => {
                warn!(%peer, error = %err, "closing producer connection");
                break;
            }
        }
    }
    debug!(%peer, "producer disconnected");
}

/// One-way sender that pushes frames to the first reachable endpoint.
///
/// Endpoints are tried in order on every (re)connect, so a recovered
/// preferred endpoint is picked up again after the current one fails.
pub struct PushSender {
    endpoints: Vec<SocketAddr>,
    timeout: Duration,
    stream: Option<(SocketAddr, TcpStream)>,
}

impl PushSender {
    /// Create a sender over an ordered endpoint list.
    pub fn new(endpoints: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            endpoints,
            timeout,
            stream: None,
        }
    }

    /// Endpoint currently connected, if any.
    pub fn connected_endpoint(&self) -> Option<SocketAddr> {
        self.stream.as_ref().map(|(endpoint, _)| *endpoint)
    }

    /// Push one message, returning the endpoint it was written to.
    ///
    /// A failed write on a reused connection is retried once on a fresh one.
    pub async fn send(&mut self, message: &Message) -> Result<SocketAddr> {
        let frame = encode_frame(message)?;
        let reused = self.stream.is_some();
        match self.write(&frame).await {
            Ok(endpoint) => {
                log_message(MessageDirection::Outbound, endpoint, message);
                Ok(endpoint)
            }
            Err(err) if reused => {
                debug!(error = %err, "push connection lost; reconnecting");
                let endpoint = self.write(&frame).await?;
                log_message(MessageDirection::Outbound, endpoint, message);
                Ok(endpoint)
            }
            Err(err) => Err(err),
        }
    }

    async fn write(&mut self, frame: &[u8]) -> Result<SocketAddr> {
        let (endpoint, mut stream) = match self.stream.take() {
            Some(existing) => existing,
            None => self.connect_first().await?,
        };
        match timeout(self.timeout, stream.write_all(frame)).await {
            Ok(Ok(())) => {
                self.stream = Some((endpoint, stream));
                Ok(endpoint)
            }
            Ok(Err(err)) => Err(MessagingError::Io(err)),
            Err(_) => Err(MessagingError::WriteTimeout),
        }
    }

    async fn connect_first(&self) -> Result<(SocketAddr, TcpStream)> {
        for endpoint in &self.endpoints {
            match timeout(self.timeout, TcpStream::connect(*endpoint)).await {
                Ok(Ok(stream)) => {
                    info!(endpoint = %endpoint, "push channel connected");
                    return Ok((*endpoint, stream));
                }
                Ok(Err(err)) => debug!(endpoint = %endpoint, error = %err, "endpoint unavailable"),
                Err(_) => debug!(endpoint = %endpoint, "endpoint connect timed out"),
            }
        }
        Err(MessagingError::Unreachable(self.describe_endpoints()))
    }

    fn describe_endpoints(&self) -> String {
        self.endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Bounded queue in front of a [`PushSender`].
///
/// `offer` never blocks; a full queue drops the message and counts it.
pub struct PushQueue {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl PushQueue {
    /// Start the writer task that drains the queue into `sender`.
    pub fn spawn(mut sender: PushSender, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = sender.send(&message).await {
                    warn!(kind = message.kind(), error = %err, "push failed");
                }
            }
        });
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            task,
        }
    }

    /// Enqueue a message; returns `false` when it was dropped.
    pub fn offer(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = message.kind(), "push queue full; dropping message");
                false
            }
            Err(TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(kind = message.kind(), "push writer stopped; dropping message");
                false
            }
        }
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush what is queued and stop the writer.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            warn!(error = %err, "push writer ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Measurement, SensorType, SensorValue};

    fn reading() -> Message {
        Message::from(Measurement::new(
            SensorType::Humidity,
            SensorValue::Numeric(80.0),
        ))
    }

    #[tokio::test]
    async fn offer_after_writer_exit_is_dropped() {
        let sender = PushSender::new(
            vec![SocketAddr::from(([127, 0, 0, 1], 9))],
            Duration::from_millis(50),
        );
        let mut queue = PushQueue::spawn(sender, 4);
        assert!(!queue.is_closed());

        queue.task.abort();
        let _ = (&mut queue.task).await;
        assert!(queue.is_closed());
        assert!(!queue.offer(reading()));
        assert_eq!(queue.dropped(), 1);
    }
}
