//! Connection acceptance and request dispatch
//!
//! Every accepted connection carries exactly one request. The acceptor
//! numbers connections in arrival order, hands each one to its own task and
//! goes straight back to accepting. The connection task parses the request,
//! queues the conversion on the worker pool and writes the outcome back.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::image_pipeline::{ConversionEngine, ConversionError, ConversionStats, JobStatus};
use crate::server::error::{Result, ServerError};
use crate::server::pool::WorkerPool;
use crate::server::request::{ConversionRequest, ConversionResponse, MAX_REQUEST_BYTES};

/// Lifecycle of a single connection, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Parsed,
    Queued,
    Running,
    Succeeded,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Parsed => "parsed",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

fn transition(sequence: u64, state: ConnectionState) {
    info!(sequence, state = %state, "Connection state");
}

/// How long a connection may stay silent before its request line arrives
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type JobOutcome = (JobStatus, std::result::Result<ConversionStats, ConversionError>);

pub struct Dispatcher {
    engine: Arc<ConversionEngine>,
    pool: Arc<WorkerPool>,
    connections: Arc<Semaphore>,
    sequence: AtomicU64,
    request_timeout: Duration,
}

impl Dispatcher {
    /// `max_connections` bounds connections held open at once; further
    /// clients wait in the listen backlog until one closes.
    pub fn new(engine: Arc<ConversionEngine>, pool: Arc<WorkerPool>, max_connections: usize) -> Self {
        Self {
            engine,
            pool,
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
            sequence: AtomicU64::new(0),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Accepts connections until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let address = listener.local_addr()?;
        info!(%address, "Listening for conversion requests");

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let sequence = self.next_sequence();
            let dispatcher = self.clone();
            tokio::spawn(
                async move {
                    dispatcher.handle_connection(stream, sequence).await;
                    drop(permit);
                }
                .instrument(info_span!("connection", sequence, %peer)),
            );
        }

        info!("Stopped accepting connections");
        Ok(())
    }

    /// Runs one request/response exchange and returns the final outcome state.
    pub async fn handle_connection<S>(&self, stream: S, sequence: u64) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        transition(sequence, ConnectionState::Accepted);
        let (reader, mut writer) = tokio::io::split(stream);

        let response = match read_request(reader, self.request_timeout).await {
            Ok(request) => {
                transition(sequence, ConnectionState::Parsed);
                self.dispatch(request, sequence).await
            }
            Err(e) => {
                warn!(sequence, "Rejected request: {}", e);
                ConversionResponse::failed(sequence, e)
            }
        };

        let outcome = match response {
            ConversionResponse::Succeeded { .. } => ConnectionState::Succeeded,
            ConversionResponse::Failed { .. } => ConnectionState::Failed,
        };
        transition(sequence, outcome);

        if let Err(e) = write_response(&mut writer, &response).await {
            debug!(sequence, "Client went away before the response: {}", e);
        }
        transition(sequence, ConnectionState::Closed);
        outcome
    }

    async fn dispatch(&self, request: ConversionRequest, sequence: u64) -> ConversionResponse {
        let mut job = request.into_job(sequence);
        let engine = self.engine.clone();

        transition(sequence, ConnectionState::Queued);
        let submitted = self
            .pool
            .submit(move |cancel| -> JobOutcome {
                transition(sequence, ConnectionState::Running);
                let result = engine.run(&mut job, &cancel);
                (job.status, result)
            })
            .await;

        let receiver = match submitted {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!(sequence, "Could not queue conversion: {}", e);
                return ConversionResponse::failed(sequence, e);
            }
        };

        match receiver.await {
            Ok((JobStatus::Succeeded, Ok(stats))) => ConversionResponse::succeeded(sequence, &stats),
            Ok((_, Err(e))) => ConversionResponse::failed(sequence, e),
            Ok((status, Ok(_))) => ConversionResponse::failed(sequence, format!("job ended as {status:?}")),
            Err(_) => {
                error!(sequence, "Conversion worker dropped the job");
                ConversionResponse::failed(sequence, "conversion aborted")
            }
        }
    }
}

async fn read_request<R>(reader: R, timeout: Duration) -> Result<ConversionRequest>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
    let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| ServerError::ParseError(format!("no request within {}s", timeout.as_secs_f32())))??;

    if read == 0 {
        return Err(ServerError::ParseError("connection closed before a request".to_string()));
    }
    if !line.ends_with('\n') && read as u64 >= MAX_REQUEST_BYTES {
        return Err(ServerError::ParseError(format!(
            "request exceeds {MAX_REQUEST_BYTES} bytes"
        )));
    }
    ConversionRequest::parse(&line)
}

async fn write_response<W>(writer: &mut W, response: &ConversionResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.to_line().as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_pipeline::{
        ConversionConfig, FormatHandle, FormatOpener, ImageGeometry, OutputSink, SeriesGeometry,
        SinkCapabilities, SinkFactory, Tile,
    };
    use crate::server::pool::{PoolConfig, QueueFullPolicy};
    use serde_json::Value;
    use std::net::SocketAddr;
    use tokio::io::duplex;

    struct Gray {
        geometry: ImageGeometry,
        fail: bool,
    }

    impl FormatHandle for Gray {
        fn format_name(&self) -> &str {
            "gray"
        }

        fn geometry(&self) -> crate::image_pipeline::Result<ImageGeometry> {
            Ok(self.geometry.clone())
        }

        fn read_region(&mut self, _series: usize, _plane: usize, region: Tile) -> crate::image_pipeline::Result<Vec<u8>> {
            if self.fail {
                return Err(ConversionError::DecodeError("corrupt strip".to_string()));
            }
            Ok(vec![0; region.area() as usize])
        }

        fn color_table(
            &mut self,
            _series: usize,
            _plane: usize,
        ) -> crate::image_pipeline::Result<Option<crate::image_pipeline::ColorLookupTable>> {
            Ok(None)
        }

        fn close(&mut self) -> crate::image_pipeline::Result<()> {
            Ok(())
        }
    }

    struct GrayOpener;

    impl FormatOpener for GrayOpener {
        fn open(&self, locator: &str, _group_files: bool) -> crate::image_pipeline::Result<Box<dyn FormatHandle>> {
            if locator.starts_with("missing") {
                return Err(ConversionError::open(locator, "no such file"));
            }
            Ok(Box::new(Gray {
                geometry: ImageGeometry::new(vec![SeriesGeometry::gray(8, 8, 2, 1)]),
                fail: locator.starts_with("corrupt"),
            }))
        }
    }

    struct NullSink;

    impl OutputSink for NullSink {
        fn capabilities(&self) -> SinkCapabilities {
            SinkCapabilities {
                tiled_write: true,
                big_format: false,
                stacks: true,
            }
        }

        fn begin_series(&mut self, _series: usize, _geometry: &SeriesGeometry) -> crate::image_pipeline::Result<()> {
            Ok(())
        }

        fn set_color_table(
            &mut self,
            _table: Option<&crate::image_pipeline::ColorLookupTable>,
        ) -> crate::image_pipeline::Result<()> {
            Ok(())
        }

        fn write_plane(&mut self, _plane: usize, _data: &[u8]) -> crate::image_pipeline::Result<()> {
            Ok(())
        }

        fn write_tile(&mut self, _plane: usize, _tile: Tile, _data: &[u8]) -> crate::image_pipeline::Result<()> {
            Ok(())
        }

        fn finalize(&mut self) -> crate::image_pipeline::Result<()> {
            Ok(())
        }

        fn abort(&mut self) -> crate::image_pipeline::Result<()> {
            Ok(())
        }
    }

    struct NullSinks;

    impl SinkFactory for NullSinks {
        fn create(
            &self,
            _locator: &str,
            _geometry: &ImageGeometry,
            _big_format_hint: bool,
        ) -> crate::image_pipeline::Result<Box<dyn OutputSink>> {
            Ok(Box::new(NullSink))
        }

        fn capabilities(&self, _locator: &str) -> crate::image_pipeline::Result<SinkCapabilities> {
            Ok(NullSink.capabilities())
        }
    }

    fn dispatcher() -> Dispatcher {
        let engine = ConversionEngine::new(Arc::new(GrayOpener), Arc::new(NullSinks), ConversionConfig::default());
        let pool = WorkerPool::new(PoolConfig {
            workers: 2,
            queue_capacity: 4,
            queue_full: QueueFullPolicy::Block,
        });
        Dispatcher::new(Arc::new(engine), Arc::new(pool), 8)
    }

    async fn exchange(dispatcher: &Dispatcher, request: &[u8], sequence: u64) -> (ConnectionState, Value) {
        let (mut client, server) = duplex(256 * 1024);
        client.write_all(request).await.unwrap();

        let state = dispatcher.handle_connection(server, sequence).await;

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        (state, serde_json::from_str(response.trim()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_successful_conversion_response() {
        let dispatcher = dispatcher();
        let (state, response) =
            exchange(&dispatcher, b"{\"source\":\"a.tif\",\"destination\":\"a.raw\"}\n", 1).await;

        assert_eq!(state, ConnectionState::Succeeded);
        assert_eq!(response["status"], "succeeded");
        assert_eq!(response["sequence"], 1);
        assert_eq!(response["planes"], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_conversion_response() {
        let dispatcher = dispatcher();
        let (state, response) =
            exchange(&dispatcher, b"{\"source\":\"corrupt.tif\",\"destination\":\"a.raw\"}\n", 5).await;

        assert_eq!(state, ConnectionState::Failed);
        assert_eq!(response["status"], "failed");
        assert_eq!(response["sequence"], 5);
        assert!(response["error"].as_str().unwrap().contains("corrupt strip"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_failure_response() {
        let dispatcher = dispatcher();
        let (state, response) = exchange(&dispatcher, b"{\"source\":\"missing.tif\"}\n", 2).await;

        assert_eq!(state, ConnectionState::Failed);
        assert!(response["error"].as_str().unwrap().contains("no such file"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_request_never_reaches_pool() {
        let dispatcher = dispatcher();
        let (state, response) = exchange(&dispatcher, b"{\"source\":\n", 3).await;

        assert_eq!(state, ConnectionState::Failed);
        assert_eq!(response["status"], "failed");
        assert_eq!(dispatcher.pool.snapshot().completed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_request_rejected() {
        let dispatcher = dispatcher();
        let mut request = b"{\"source\":\"".to_vec();
        request.extend(std::iter::repeat_n(b'a', MAX_REQUEST_BYTES as usize));
        request.extend_from_slice(b"\"}\n");

        let (state, response) = exchange(&dispatcher, &request, 4).await;
        assert_eq!(state, ConnectionState::Failed);
        assert!(response["error"].as_str().unwrap().contains("exceeds"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_client_times_out() {
        let dispatcher = dispatcher().with_request_timeout(Duration::from_millis(100));
        let (mut client, server) = duplex(1024);

        // The client stays connected but never sends a line
        let state = dispatcher.handle_connection(server, 9).await;
        assert_eq!(state, ConnectionState::Failed);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        let response: Value = serde_json::from_str(response.trim()).unwrap();
        assert_eq!(response["status"], "failed");
        assert!(response["error"].as_str().unwrap().contains("no request within"));
        assert_eq!(dispatcher.pool.snapshot().completed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_over_tcp_assigns_sequences() {
        let dispatcher = Arc::new(dispatcher());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address: SocketAddr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(dispatcher.clone().serve(listener, cancel.clone()));

        let mut sequences = Vec::new();
        for _ in 0..3 {
            let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
            stream.write_all(b"{\"source\":\"a.tif\",\"destination\":\"a.raw\"}\n").await.unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            let response: Value = serde_json::from_str(response.trim()).unwrap();
            assert_eq!(response["status"], "succeeded");
            sequences.push(response["sequence"].as_u64().unwrap());
        }
        assert_eq!(sequences, vec![1, 2, 3]);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
