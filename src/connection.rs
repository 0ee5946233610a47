use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context as _, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::kafka::error::{ClientError, DecodeError};
use crate::kafka::response::Decoder;
use crate::kafka::types::StrBytes;
use crate::kafka::{
    response, ApiKey, Deserialize as _, MessageReader, MessageWriter, Request, RequestHeader,
    RequestMessage, ResponseBody, ResponseHeader, ResponseMessage,
};
use crate::pool::{BufferPool, PooledBuf};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Completion = oneshot::Sender<Result<ResponseMessage, ClientError>>;

/// Number of encoded frames that may wait for the writer before `send` applies backpressure.
const WRITE_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Client id sent in every request header.
    pub client_id: Option<StrBytes>,
    /// Default timeout used by callers that don't pick their own.
    pub request_timeout: Duration,
    /// Largest response frame accepted from the peer.
    pub max_frame_size: usize,
    /// How long [`Connection::close`] waits for the background tasks.
    pub shutdown_timeout: Duration,
    pub pool: BufferPool,
}

impl ConnectionConfig {
    pub const DEFAULT_CLIENT_ID: &'static str = "kafka-client";
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: Some(StrBytes::from_static(Self::DEFAULT_CLIENT_ID)),
            request_timeout: Duration::from_secs(30),
            max_frame_size: Self::DEFAULT_MAX_FRAME_SIZE,
            shutdown_timeout: Duration::from_secs(5),
            pool: BufferPool::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Outstanding request waiting for the response with its correlation id.
struct PendingRequest {
    api_key: ApiKey,
    api_version: i16,
    header_version: i16,
    decoder: Decoder,
    completion: Completion,
    registered: Instant,
}

impl PendingRequest {
    /// Decode a whole response frame (without its size prefix).
    fn decode(&self, buf: &mut &[u8]) -> Result<ResponseMessage> {
        let (header, _) =
            ResponseHeader::decode(buf, self.header_version).context("response header")?;

        let body = (self.decoder)(buf, self.api_version)?;

        ensure!(buf.is_empty(), DecodeError::Leftover(buf.len()));

        Ok(ResponseMessage { header, body })
    }
}

/// State shared by the connection handle and its background tasks.
struct Shared {
    state: AtomicU8,
    pending: DashMap<i32, PendingRequest>,
    fatal: Mutex<Option<ClientError>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            pending: DashMap::new(),
            fatal: Mutex::new(None),
        }
    }

    #[inline]
    fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    #[inline]
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The error reported to requests on a connection that is no longer open.
    fn closed_error(&self) -> ClientError {
        self.fatal.lock().clone().unwrap_or(ClientError::Closed)
    }

    #[inline]
    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Record the first fatal error, close the connection and fail everything in flight.
    fn fail(&self, err: ClientError) {
        let err = {
            let mut fatal = self.fatal.lock();
            fatal.get_or_insert(err).clone()
        };

        self.set_state(ConnectionState::Closed);
        self.drain(&err);
    }

    fn drain(&self, err: &ClientError) {
        let ids = self.pending.iter().map(|e| *e.key()).collect::<Vec<_>>();

        for correlation_id in ids {
            if let Some((_, slot)) = self.pending.remove(&correlation_id) {
                debug!(correlation_id, api_key = ?slot.api_key, error = %err, "failing pending request");
                let _ = slot.completion.send(Err(err.clone()));
            }
        }
    }

    /// Route a single response frame (without its size prefix) to the request waiting for it.
    ///
    /// Returns an error only if the connection can't continue.
    fn dispatch(&self, frame: &[u8]) -> Result<(), ClientError> {
        let (correlation_id, _) = i32::decode(&mut &frame[..], 0)
            .context("response correlation id")
            .map_err(|e| ClientError::classify(&e))?;

        let Some((_, slot)) = self.pending.remove(&correlation_id) else {
            debug!(
                correlation_id,
                size = frame.len(),
                "discarding response without a pending request"
            );
            return Ok(());
        };

        let decoded = slot.decode(&mut &frame[..]).with_context(|| {
            format!(
                "{:?} v{} response {correlation_id}",
                slot.api_key, slot.api_version
            )
        });

        match decoded {
            Ok(message) => {
                trace!(
                    correlation_id,
                    api_key = ?slot.api_key,
                    elapsed = ?slot.registered.elapsed(),
                    "response received"
                );
                let _ = slot.completion.send(Ok(message));
                Ok(())
            }

            Err(e) => {
                let err = ClientError::classify(&e);

                if err.is_fatal() {
                    self.fail(err.clone());
                    let _ = slot.completion.send(Err(err.clone()));
                    Err(err)
                } else {
                    warn!(correlation_id, error = %err, "dropping corrupt response");
                    let _ = slot.completion.send(Err(err));
                    Ok(())
                }
            }
        }
    }
}

/// Removes an abandoned slot when `send` returns early or its future is dropped.
struct SlotGuard<'a> {
    pending: &'a DashMap<i32, PendingRequest>,
    correlation_id: i32,
}

impl Drop for SlotGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// Multiplexed client connection to a single broker.
///
/// Any number of tasks may [`send`](Self::send) concurrently through a shared reference. Each
/// request is tagged with a fresh correlation id and the background reader routes responses back
/// by that id, in whatever order the broker answers.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    frames: mpsc::Sender<PooledBuf>,
    next_correlation_id: AtomicI32,
    shutdown: CancellationToken,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Connection {
    /// Open a TCP connection to the broker at `addr`.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Transport(format!("connect: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::Transport(format!("enable TCP_NODELAY: {e}")))?;

        match stream.peer_addr() {
            Ok(peer) => info!(%peer, "connected to broker"),
            Err(e) => debug!(error = %e, "connected to broker with unknown peer address"),
        }

        Ok(Self::from_stream(stream, config))
    }

    /// Run the connection over an already established byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);

        let reader = MessageReader::new(Box::new(reader) as BoxReader, config.max_frame_size);
        let writer = MessageWriter::new(Box::new(writer) as BoxWriter);

        let shared = Arc::new(Shared::new());
        let shutdown = CancellationToken::new();
        let (frames, queue) = mpsc::channel(WRITE_QUEUE_CAPACITY);

        let read_task = tokio::spawn(read_loop(
            reader,
            config.pool.clone(),
            Arc::clone(&shared),
            shutdown.clone(),
        ));

        let write_task = tokio::spawn(write_loop(
            writer,
            queue,
            Arc::clone(&shared),
            shutdown.clone(),
        ));

        shared.set_state(ConnectionState::Open);

        Self {
            config,
            shared,
            frames,
            next_correlation_id: AtomicI32::new(0),
            shutdown,
            tasks: Mutex::new(Some((read_task, write_task))),
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Number of requests waiting for a response.
    #[inline]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    #[inline]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Send `request` and wait at most `timeout` for its response.
    pub async fn send<R: Request>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, ClientError> {
        self.send_with_header(request, timeout)
            .await
            .map(|(_, body)| body)
    }

    /// Like [`send`](Self::send), but also returns the response header.
    ///
    /// The `timeout` bounds the whole call, including the wait for room in the write queue.
    /// Requests the broker never answers ([`Request::expects_response`]) complete with a default
    /// response once queued.
    pub async fn send_with_header<R: Request>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<(ResponseHeader, R::Response), ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        self.shared.ensure_open()?;

        let api_version = request.api_version();

        if !R::VERSIONS.contains(&api_version) {
            return Err(ClientError::Encode(format!(
                "{:?} v{api_version} is not supported (versions {:?})",
                R::API_KEY,
                R::VERSIONS,
            )));
        }

        if !request.expects_response() {
            let correlation_id = self.next_correlation_id();
            let frame = self.encode(request, correlation_id)?;
            self.enqueue(frame, correlation_id, deadline, timeout).await?;

            let header = ResponseHeader {
                correlation_id,
                ..ResponseHeader::default()
            };

            return Ok((header, R::Response::default()));
        }

        let (correlation_id, completion) = self.register::<R>(api_version);

        let _guard = SlotGuard {
            pending: &self.shared.pending,
            correlation_id,
        };

        // the connection may have failed before the slot became visible to the reader
        self.shared.ensure_open()?;

        let frame = self.encode(request, correlation_id)?;
        self.enqueue(frame, correlation_id, deadline, timeout).await?;

        let message = match tokio::time::timeout_at(deadline, completion).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(self.shared.closed_error()),
            Err(_) => {
                debug!(correlation_id, api_key = ?R::API_KEY, ?timeout, "request timed out");
                return Err(ClientError::Timeout {
                    correlation_id,
                    timeout,
                });
            }
        };

        let ResponseMessage { header, body } = message;

        let body = <R::Response>::try_from(body).map_err(|body: ResponseBody| {
            ClientError::UnexpectedResponse {
                expected: R::API_KEY,
                actual: body.api_key(),
            }
        })?;

        Ok((header, body))
    }

    /// Encode the size-prefixed request frame into a pooled buffer.
    fn encode<R: Request>(
        &self,
        request: &R,
        correlation_id: i32,
    ) -> Result<PooledBuf, ClientError> {
        let api_version = request.api_version();

        let message = RequestMessage {
            header: RequestHeader::new(
                R::API_KEY,
                api_version,
                correlation_id,
                self.config.client_id.clone(),
            ),
            body: request,
        };

        let mut frame = self.config.pool.get();

        message
            .encode_frame(&mut frame)
            .map_err(|e| ClientError::Encode(format!("{e:#}")))?;

        trace!(
            correlation_id,
            api_key = ?R::API_KEY,
            api_version,
            size = frame.len(),
            "sending request"
        );

        Ok(frame)
    }

    /// Hand a frame over to the writer task, waiting for queue capacity until `deadline`.
    async fn enqueue(
        &self,
        frame: PooledBuf,
        correlation_id: i32,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        match tokio::time::timeout_at(deadline, self.frames.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.shared.closed_error()),
            Err(_) => {
                debug!(correlation_id, ?timeout, "request timed out waiting for the writer");
                Err(ClientError::Timeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    #[inline]
    fn next_correlation_id(&self) -> i32 {
        self.next_correlation_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Allocate a correlation id and register its slot in the pending table.
    fn register<R: Request>(
        &self,
        api_version: i16,
    ) -> (i32, oneshot::Receiver<Result<ResponseMessage, ClientError>>) {
        let (completion, receiver) = oneshot::channel();

        let slot = PendingRequest {
            api_key: R::API_KEY,
            api_version,
            header_version: R::API_KEY.response_header_version(api_version),
            decoder: response::decode_response::<R::Response>,
            completion,
            registered: Instant::now(),
        };

        loop {
            let correlation_id = self.next_correlation_id();

            // skip ids whose (very old) request is still waiting
            match self.shared.pending.entry(correlation_id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(slot);
                    return (correlation_id, receiver);
                }
            }
        }
    }

    /// Stop the background tasks and fail all outstanding requests with [`ClientError::Closed`].
    pub async fn close(&self) {
        let _ = self.shared.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        self.shutdown.cancel();

        let tasks = self.tasks.lock().take();

        if let Some((read_task, write_task)) = tasks {
            let handles = [read_task.abort_handle(), write_task.abort_handle()];

            let join = async {
                let _ = read_task.await;
                let _ = write_task.await;
            };

            if tokio::time::timeout(self.config.shutdown_timeout, join)
                .await
                .is_err()
            {
                warn!(timeout = ?self.config.shutdown_timeout, "aborting connection tasks");
                for handle in handles {
                    handle.abort();
                }
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        self.shared.drain(&ClientError::Closed);

        debug!("connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop(
    mut reader: MessageReader<BoxReader>,
    pool: BufferPool,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let err = loop {
        let mut frame = pool.get();

        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = reader.read_frame(&mut frame) => read,
        };

        match read {
            Ok(Some(size)) => {
                trace!(size, "frame received");

                if let Err(err) = shared.dispatch(&frame) {
                    break err;
                }
            }

            Ok(None) => {
                info!("broker closed the connection");
                break ClientError::Closed;
            }

            Err(e) => break ClientError::classify(&e),
        }
    };

    if !matches!(err, ClientError::Closed) {
        error!(error = %err, "connection failed");
    }

    shared.fail(err);
    shutdown.cancel();
}

async fn write_loop(
    mut writer: MessageWriter<BoxWriter>,
    mut queue: mpsc::Receiver<PooledBuf>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = write_frames(&mut writer, &mut queue, frame).await {
            let err = ClientError::classify(&e);
            error!(error = %err, "connection failed");
            shared.fail(err);
            shutdown.cancel();
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %format!("{e:#}"), "write half shutdown failed");
    }
}

/// Write `frame` and everything queued behind it, then flush once.
async fn write_frames(
    writer: &mut MessageWriter<BoxWriter>,
    queue: &mut mpsc::Receiver<PooledBuf>,
    frame: PooledBuf,
) -> Result<()> {
    writer.write_frame(&frame).await?;
    drop(frame);

    while let Ok(frame) = queue.try_recv() {
        writer.write_frame(&frame).await?;
    }

    writer.flush().await
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut as _, BytesMut};
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    use super::*;
    use crate::kafka::error::ErrorCode;
    use crate::kafka::record::{Record, RecordBatch, RecordSet};
    use crate::kafka::request;
    use crate::kafka::response::Heartbeat;
    use crate::kafka::Serialize as _;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn connection() -> (Connection, DuplexStream) {
        let (client, broker) = duplex(64 * 1024);
        let config = ConnectionConfig {
            client_id: Some(StrBytes::from_static("c")),
            shutdown_timeout: Duration::from_secs(1),
            ..ConnectionConfig::default()
        };
        (Connection::from_stream(client, config), broker)
    }

    fn heartbeat() -> request::Heartbeat {
        request::Heartbeat::new(0, "group", 1, "member")
    }

    /// Read a request frame and return it whole, including the size prefix.
    async fn read_request(broker: &mut DuplexStream) -> Vec<u8> {
        let size = broker.read_i32().await.expect("request size");
        let mut frame = vec![0; 4 + size as usize];
        frame[..4].copy_from_slice(&size.to_be_bytes());
        broker
            .read_exact(&mut frame[4..])
            .await
            .expect("request frame");
        frame
    }

    /// Correlation id of a request frame (size prefix included).
    fn correlation_id(frame: &[u8]) -> i32 {
        i32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]])
    }

    async fn respond(broker: &mut DuplexStream, correlation_id: i32, payload: &[u8]) {
        let mut frame = BytesMut::new();
        frame.put_i32(4 + payload.len() as i32);
        frame.put_i32(correlation_id);
        frame.put_slice(payload);
        broker.write_all(&frame).await.expect("write response");
    }

    /// Heartbeat v0 response whose error code echoes the correlation id.
    async fn respond_heartbeat(broker: &mut DuplexStream, correlation_id: i32) {
        respond(broker, correlation_id, &(correlation_id as i16).to_be_bytes()).await;
    }

    #[tokio::test]
    async fn api_versions_round_trip() {
        let (conn, mut broker) = connection();

        let broker = tokio::spawn(async move {
            let frame = read_request(&mut broker).await;
            assert_eq!(
                frame,
                b"\x00\x00\x00\x0b\x00\x12\x00\x00\x00\x00\x00\x01\x00\x01\x63"
            );
            // error_code, api_keys (empty)
            respond(&mut broker, 1, &[0, 0, 0, 0, 0, 0]).await;
            broker
        });

        let response = conn
            .send(&request::ApiVersions::new(0), TIMEOUT)
            .await
            .expect("api versions response");

        assert_eq!(response.error_code, ErrorCode::NONE);
        assert!(response.api_keys.is_empty());
        assert_eq!(conn.pending_requests(), 0);

        let _broker = broker.await.expect("broker task");
    }

    #[tokio::test]
    async fn responses_are_routed_by_correlation_id() {
        let (conn, mut broker) = connection();
        let conn = Arc::new(conn);

        let requests = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.send_with_header(&heartbeat(), TIMEOUT).await })
            })
            .collect::<Vec<_>>();

        let mut ids = Vec::new();
        for _ in 0..requests.len() {
            ids.push(correlation_id(&read_request(&mut broker).await));
        }

        // answer in an order unrelated to the send order
        ids.reverse();
        ids.swap(1, 5);

        for &id in &ids {
            respond_heartbeat(&mut broker, id).await;
        }

        for request in requests {
            let (header, body) = request
                .await
                .expect("request task")
                .expect("heartbeat response");

            assert_eq!(body.error_code, ErrorCode(header.correlation_id as i16));
        }

        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn timeout_affects_only_its_request() {
        let (conn, mut broker) = connection();
        let conn = Arc::new(conn);

        let slow = {
            let conn = Arc::clone(&conn);
            tokio::spawn(
                async move { conn.send(&heartbeat(), Duration::from_millis(50)).await },
            )
        };

        let slow_id = correlation_id(&read_request(&mut broker).await);

        let err = slow
            .await
            .expect("request task")
            .expect_err("request should time out");

        assert!(matches!(
            err,
            ClientError::Timeout { correlation_id, .. } if correlation_id == slow_id
        ));
        assert_eq!(conn.pending_requests(), 0);

        let next = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send_with_header(&heartbeat(), TIMEOUT).await })
        };

        let next_id = correlation_id(&read_request(&mut broker).await);
        assert_ne!(next_id, slow_id);

        // the late response is dropped without disturbing the connection
        respond_heartbeat(&mut broker, slow_id).await;
        respond_heartbeat(&mut broker, next_id).await;

        let (header, body) = next
            .await
            .expect("request task")
            .expect("heartbeat response");

        assert_eq!(header.correlation_id, next_id);
        assert_eq!(body.error_code, ErrorCode(next_id as i16));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() {
        let (conn, mut broker) = connection();
        let conn = Arc::new(conn);

        let requests = (0..5)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.send(&heartbeat(), TIMEOUT).await })
            })
            .collect::<Vec<_>>();

        for _ in 0..requests.len() {
            let _ = read_request(&mut broker).await;
        }
        assert_eq!(conn.pending_requests(), requests.len());

        let shutdown_timeout = conn.config().shutdown_timeout;

        tokio::time::timeout(shutdown_timeout * 2, conn.close())
            .await
            .expect("close within shutdown timeout");

        for request in requests {
            let err = tokio::time::timeout(shutdown_timeout, request)
                .await
                .expect("request resolved")
                .expect("request task")
                .expect_err("request should fail");

            assert!(matches!(err, ClientError::Closed), "{err:?}");
        }

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.pending_requests(), 0);

        let err = conn.send(&heartbeat(), TIMEOUT).await.expect_err("closed");
        assert!(matches!(err, ClientError::Closed));
    }

    #[tokio::test]
    async fn timeout_covers_full_write_queue() {
        // the broker never reads, so the writer stalls and the queue fills up
        let (client, _broker) = duplex(64);
        let conn = Arc::new(Connection::from_stream(client, ConnectionConfig::default()));

        let timeout = Duration::from_millis(100);

        let requests = (0..3 * WRITE_QUEUE_CAPACITY)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.send(&heartbeat(), timeout).await })
            })
            .collect::<Vec<_>>();

        for request in requests {
            let err = tokio::time::timeout(TIMEOUT, request)
                .await
                .expect("request released by its timeout")
                .expect("request task")
                .expect_err("request should time out");

            assert!(matches!(err, ClientError::Timeout { .. }), "{err:?}");
        }

        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn produce_without_acks_completes_once_queued() {
        let (conn, mut broker) = connection();

        let request = request::Produce::new(
            request::produce::Acks::None,
            1000,
            vec![request::produce::TopicProduceData {
                name: StrBytes::from("t"),
                partition_data: vec![request::produce::PartitionProduceData {
                    index: 0,
                    records: None,
                }],
            }],
        );

        let (header, body) = conn
            .send_with_header(&request, TIMEOUT)
            .await
            .expect("produce without acks");

        assert!(body.responses.is_empty());
        assert_eq!(conn.pending_requests(), 0);

        let frame = read_request(&mut broker).await;
        assert_eq!(correlation_id(&frame), header.correlation_id);
        // size, api key, version, correlation id, client id "c", null transactional id
        assert_eq!(&frame[17..19], &[0, 0], "acks");

        // later requests still get their own response
        let next = tokio::spawn(async move { conn.send(&heartbeat(), TIMEOUT).await });

        let id = correlation_id(&read_request(&mut broker).await);
        assert_ne!(id, header.correlation_id);
        respond_heartbeat(&mut broker, id).await;

        let body = next
            .await
            .expect("request task")
            .expect("heartbeat response");
        assert_eq!(body.error_code, ErrorCode(id as i16));
    }

    #[tokio::test]
    async fn leftover_payload_fails_connection() {
        let (conn, mut broker) = connection();
        let conn = Arc::new(conn);

        let request = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send(&heartbeat(), TIMEOUT).await })
        };

        let id = correlation_id(&read_request(&mut broker).await);
        respond(&mut broker, id, &[0, 0, 0]).await;

        let err = request
            .await
            .expect("request task")
            .expect_err("framing error");

        assert!(matches!(err, ClientError::Framing(_)), "{err:?}");
        assert_eq!(conn.state(), ConnectionState::Closed);

        let later = conn.send(&heartbeat(), TIMEOUT).await.expect_err("failed");
        assert!(matches!(later, ClientError::Framing(_)), "{later:?}");
    }

    #[tokio::test]
    async fn truncated_payload_fails_connection() {
        let (conn, mut broker) = connection();
        let conn = Arc::new(conn);

        let request = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send(&heartbeat(), TIMEOUT).await })
        };

        let id = correlation_id(&read_request(&mut broker).await);
        respond(&mut broker, id, &[0]).await;

        let err = request
            .await
            .expect("request task")
            .expect_err("framing error");

        assert!(matches!(err, ClientError::Framing(_)), "{err:?}");
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn broker_disconnect_fails_outstanding_requests() {
        let (conn, mut broker) = connection();
        let conn = Arc::new(conn);

        let request = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send(&heartbeat(), TIMEOUT).await })
        };

        let _ = read_request(&mut broker).await;
        drop(broker);

        let err = request
            .await
            .expect("request task")
            .expect_err("disconnected");

        assert!(matches!(err, ClientError::Closed), "{err:?}");
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    fn corrupt_fetch_payload() -> Vec<u8> {
        let batch = RecordBatch::new(
            0,
            vec![Record {
                value: Some(bytes::Bytes::from_static(b"v")),
                ..Record::default()
            }],
        );

        let mut records = BytesMut::new();
        Some(RecordSet::from(batch))
            .encode(&mut records, 11)
            .expect("encode records");

        // flip a bit in the last record byte
        let last = records.len() - 1;
        records[last] ^= 0x01;

        let mut payload = Vec::new();
        payload.extend_from_slice(&[0; 4 + 2 + 4]); // throttle_time_ms, error_code, session_id
        payload.extend_from_slice(b"\x00\x00\x00\x01\x00\x01t"); // responses[0].topic
        payload.extend_from_slice(b"\x00\x00\x00\x01"); // partitions length
        payload.extend_from_slice(&[0; 4 + 2 + 8 + 8 + 8]); // index .. log_start_offset
        payload.extend_from_slice(b"\xff\xff\xff\xff"); // aborted_transactions
        payload.extend_from_slice(b"\xff\xff\xff\xff"); // preferred_read_replica
        payload.extend_from_slice(&records);
        payload
    }

    #[tokio::test]
    async fn corrupt_batch_fails_only_its_request() {
        let (conn, mut broker) = connection();
        let conn = Arc::new(conn);

        let fetch = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let request = request::Fetch::new(0, vec![]);
                conn.send(&request, TIMEOUT).await
            })
        };

        let id = correlation_id(&read_request(&mut broker).await);
        respond(&mut broker, id, &corrupt_fetch_payload()).await;

        let err = fetch
            .await
            .expect("request task")
            .expect_err("integrity error");

        assert!(matches!(err, ClientError::Integrity(_)), "{err:?}");
        assert_eq!(conn.state(), ConnectionState::Open);

        let next = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send(&heartbeat(), TIMEOUT).await })
        };

        let id = correlation_id(&read_request(&mut broker).await);
        respond_heartbeat(&mut broker, id).await;

        let body = next
            .await
            .expect("request task")
            .expect("heartbeat response");
        assert_eq!(body.error_code, ErrorCode(id as i16));
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected_before_sending() {
        let (conn, _broker) = connection();

        let err = conn
            .send(&request::ApiVersions::new(3), TIMEOUT)
            .await
            .expect_err("unsupported version");

        assert!(matches!(err, ClientError::Encode(_)), "{err:?}");
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    fn pending_heartbeat(
        shared: &Shared,
        correlation_id: i32,
    ) -> oneshot::Receiver<Result<ResponseMessage, ClientError>> {
        let (completion, receiver) = oneshot::channel();

        shared.pending.insert(
            correlation_id,
            PendingRequest {
                api_key: ApiKey::Heartbeat,
                api_version: 0,
                header_version: 0,
                decoder: response::decode_response::<Heartbeat>,
                completion,
                registered: Instant::now(),
            },
        );

        receiver
    }

    #[test]
    fn dispatch_resolves_matching_slot() {
        let shared = Shared::new();
        shared.set_state(ConnectionState::Open);

        let mut receiver = pending_heartbeat(&shared, 7);

        shared
            .dispatch(&[0x00, 0x00, 0x00, 0x07, 0x00, 0x00])
            .expect("dispatch");

        let message = receiver
            .try_recv()
            .expect("completed")
            .expect("response message");

        assert_eq!(message.header.correlation_id, 7);

        let body = Heartbeat::try_from(message.body).expect("heartbeat body");
        assert_eq!(body.error_code, ErrorCode::NONE);
        assert!(shared.pending.is_empty());
    }

    #[test]
    fn dispatch_discards_orphans() {
        let shared = Shared::new();
        shared.set_state(ConnectionState::Open);

        let mut receiver = pending_heartbeat(&shared, 7);

        shared
            .dispatch(&[0x00, 0x00, 0x00, 0x09, 0x00, 0x00])
            .expect("dispatch");

        assert!(receiver.try_recv().is_err());
        assert_eq!(shared.pending.len(), 1);
        assert_eq!(shared.state(), ConnectionState::Open);
    }
}
