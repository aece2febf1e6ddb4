//! Dispatch engine: opens an outbound channel per exchange, writes the
//! body asynchronously and completes the exchange through its callback,
//! immediately for the fast-fail paths and from an I/O task otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

use crate::adapters::local::LocalHub;
use crate::adapters::{tcp, udp};
use crate::channel::{channel_pair, Channel, ChannelCore, WriteCommand};
use crate::config::{Protocol, TransportConfig};
use crate::error::TransportError;
use crate::exchange::{
    completion_pair, noop_callback, DoneCallback, Exchange, ExchangeRef, Payload,
};
use crate::pipeline::{self, textline::textline_body, Pipeline};
use crate::registry::ChannelRegistry;
use crate::transport::binding::TransportBinding;
use crate::transport::executor::{ExecutorProvider, TokioExecutorProvider};
use crate::ChannelId;

const STREAM_READ_BUFFER: usize = 8192;

/// Pipeline shared between the dispatching task (encode) and the channel's
/// I/O task (decode).
type SharedPipeline = Arc<Mutex<Pipeline>>;

/// Fires the completion callback at most once, whichever completion path
/// gets there first.
#[derive(Clone)]
struct OnceDone {
    fired: Arc<AtomicBool>,
    done: DoneCallback,
}

impl OnceDone {
    fn new(done: DoneCallback) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            done,
        }
    }

    fn fire(&self, done_sync: bool) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.done)(done_sync);
        }
    }
}

/// Everything a client channel's read loop needs to correlate a reply back
/// to its exchange.
struct Correlation {
    exchange: ExchangeRef,
    once: OnceDone,
    sync: bool,
    disconnect: bool,
    request_timeout: Option<Duration>,
    registry: Arc<ChannelRegistry>,
    address: String,
}

/// Producer-side transport endpoint.
///
/// Instances are not interchangeable across concurrent correlated sends:
/// every dispatched exchange owns its channel and callback binding for the
/// duration of its round trip. Instances may share one channel registry
/// (see [`with_registry`]) so a whole producer pool can be drained
/// together.
///
/// [`with_registry`]: TransportClient::with_registry
pub struct TransportClient {
    config: Arc<TransportConfig>,
    registry: Arc<ChannelRegistry>,
    provider: Arc<dyn ExecutorProvider>,
    hub: Arc<LocalHub>,
    binding: Mutex<Option<TransportBinding>>,
    accepting: AtomicBool,
    started: AtomicBool,
}

impl TransportClient {
    /// Create a producer for the given configuration. The configuration is
    /// checked up front: an invalid one never produces a client.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let registry = ChannelRegistry::new(format!("producer:{}", config.address()));
        Ok(Self {
            config: Arc::new(config),
            registry,
            provider: Arc::new(TokioExecutorProvider::new()),
            hub: LocalHub::global(),
            binding: Mutex::new(None),
            accepting: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// Share a registry with other producer instances so shutdown drains
    /// every outbound channel of the pool.
    pub fn with_registry(mut self, registry: Arc<ChannelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Use an explicit virtual-address namespace instead of the
    /// process-wide one.
    pub fn with_hub(mut self, hub: Arc<LocalHub>) -> Self {
        self.hub = hub;
        self
    }

    /// Use an explicit executor-provisioning service.
    pub fn with_executor_provider(mut self, provider: Arc<dyn ExecutorProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Provision executor pools and, unless lazy channel creation is on,
    /// probe the remote endpoint with one connect-then-discard cycle so an
    /// unreachable peer fails the start instead of the first send.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let owner = format!("producer-{}", self.config.protocol);
        let binding =
            match TransportBinding::select(&self.config, self.provider.as_ref(), &owner, &self.hub)
            {
                Ok(binding) => binding,
                Err(e) => {
                    self.started.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
        *self.binding.lock() = Some(binding);
        self.accepting.store(true, Ordering::SeqCst);

        if !self.config.lazy_channel_creation {
            if let Err(e) = self.probe_connection().await {
                self.accepting.store(false, Ordering::SeqCst);
                if let Some(binding) = self.binding.lock().take() {
                    binding.release();
                }
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop accepting work, close every channel in the registry and wait
    /// for them, then release the executor pools. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.accepting.store(false, Ordering::SeqCst);
        tracing::debug!("stopping producer at address: {}", self.config.address());

        self.registry.close_all().await;
        if let Some(binding) = self.binding.lock().take() {
            binding.release();
        }
    }

    /// Dispatch one exchange.
    ///
    /// Returns `true` when the exchange completed before returning (the
    /// fast-fail paths: rejected, no payload, conversion failure, connect
    /// failure) and `false` when completion arrives later through the
    /// callback, on an I/O task.
    pub async fn send(&self, exchange: ExchangeRef, done: DoneCallback) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            exchange.set_error_if_absent(TransportError::rejected(
                "producer is not accepting new work",
            ));
            done(true);
            return true;
        }

        let body = match exchange.request() {
            Some(body) => body,
            None => {
                self.config.no_reply_log_level.log(&format!(
                    "No payload to send for exchange to {}",
                    self.config.address()
                ));
                done(true);
                return true;
            }
        };

        // textline mode works on the string form of the body
        let body = if self.config.textline {
            match textline_body(
                body,
                self.config.delimiter,
                self.config.auto_append_delimiter,
            ) {
                Ok(body) => body,
                Err(e) => {
                    exchange.set_error(e);
                    done(true);
                    return true;
                }
            }
        } else {
            body
        };

        if let Some(charset) = self.config.charset_name.as_deref() {
            exchange.set_charset_name(charset.to_ascii_lowercase());
        }

        let (channel, pipeline, once) = match self.open_connection(&exchange, &done).await {
            Ok(opened) => opened,
            Err(e) => {
                exchange.set_error(e);
                done(true);
                return true;
            }
        };

        let wire = match pipeline.lock().encode(body) {
            Ok(wire) => wire,
            Err(e) => {
                exchange.set_error(e);
                self.registry.remove(channel.id());
                channel.close();
                // route through the once-guard so the dying I/O task cannot
                // signal a second completion
                once.fire(true);
                return true;
            }
        };

        tracing::debug!(
            bytes = wire.len(),
            "writing body to {}",
            self.config.address()
        );
        let write_done = channel.write(wire).await;

        // completion listener: runs on an I/O task, never on the caller
        let exchange = exchange.clone();
        let registry = self.registry.clone();
        let sync = self.config.sync;
        let disconnect = self.config.disconnect;
        let address = self.config.address();
        tokio::spawn(async move {
            let result = match write_done.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::closed(
                    "channel closed before the write completed",
                )),
            };
            tracing::debug!("write complete for {}", address);

            match result {
                Err(e) => {
                    exchange.set_error_if_absent(e);
                    registry.remove(channel.id());
                    channel.close();
                    once.fire(false);
                }
                Ok(()) if !sync => {
                    // the exchange header overrides the static configuration
                    let close = exchange
                        .close_channel_when_complete()
                        .unwrap_or(disconnect);
                    if close {
                        tracing::debug!("closing channel when complete at {}", address);
                        registry.remove(channel.id());
                        channel.close();
                    }
                    once.fire(false);
                }
                // sync: the reply correlates back through the channel's
                // read loop, which owns this exchange and callback
                Ok(()) => {}
            }
        });

        false
    }

    /// Send a payload and await its correlated reply. Convenience wrapper
    /// over [`send`] for synchronous endpoints.
    ///
    /// [`send`]: TransportClient::send
    pub async fn request(&self, payload: impl Into<Payload>) -> Result<Payload, TransportError> {
        let exchange = Exchange::of(payload).into_shared();
        let (done, completion) = completion_pair();
        self.send(exchange.clone(), done).await;
        let _ = completion.await;

        if let Some(error) = exchange.error() {
            return Err(error);
        }
        exchange
            .take_response()
            .ok_or_else(|| TransportError::closed("exchange completed without a response"))
    }

    /// Send a payload and await completion of the write, without expecting
    /// a reply.
    pub async fn dispatch(&self, payload: impl Into<Payload>) -> Result<(), TransportError> {
        let exchange = Exchange::of(payload).into_shared();
        let (done, completion) = completion_pair();
        self.send(exchange.clone(), done).await;
        let _ = completion.await;

        match exchange.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn probe_connection(&self) -> Result<(), TransportError> {
        tracing::debug!("probing connection to {}", self.config.address());
        let exchange = Exchange::new().into_shared();
        let done = noop_callback();
        let (channel, _pipeline, _once) = self.open_connection(&exchange, &done).await?;
        channel.close();
        channel.closed().await;
        self.registry.remove(channel.id());
        Ok(())
    }

    /// Build the pipeline bound to this exchange, connect per protocol and
    /// spawn the channel's I/O task. Connect failures carry the target
    /// address.
    async fn open_connection(
        &self,
        exchange: &ExchangeRef,
        done: &DoneCallback,
    ) -> Result<(Channel, SharedPipeline, OnceDone), TransportError> {
        let pipeline: SharedPipeline = Arc::new(Mutex::new(pipeline::client_pipeline(
            &self.config,
            exchange,
            done,
        )));
        let once = OnceDone::new(done.clone());
        let spawner = self.spawner()?;

        let correlation = Correlation {
            exchange: exchange.clone(),
            once: once.clone(),
            sync: self.config.sync,
            disconnect: self.config.disconnect,
            request_timeout: self.config.request_timeout(),
            registry: self.registry.clone(),
            address: self.config.address(),
        };

        let channel = match self.config.protocol {
            Protocol::Tcp => {
                let stream = tcp::connect(&self.config).await?;
                let (channel, core) = channel_pair(Protocol::Tcp, self.config.address());
                self.registry.add(channel.clone());
                spawner.spawn(run_client_stream(stream, core, pipeline.clone(), correlation));
                channel
            }
            Protocol::Udp => {
                let socket = udp::connect(&self.config).await?;
                let (channel, core) = channel_pair(Protocol::Udp, self.config.address());
                self.registry.add(channel.clone());
                spawner.spawn(run_client_datagram(
                    socket,
                    core,
                    pipeline.clone(),
                    correlation,
                    udp::read_buffer_len(&self.config),
                ));
                channel
            }
            Protocol::Local => {
                let name = self.config.local_address_name.clone().ok_or_else(|| {
                    TransportError::config_error("local_address_name", "missing")
                })?;
                let stream = self.hub.connect(&name).await?;
                let (channel, core) = channel_pair(Protocol::Local, self.config.address());
                self.registry.add(channel.clone());
                spawner.spawn(run_client_stream(stream, core, pipeline.clone(), correlation));
                channel
            }
        };

        tracing::debug!("created connector to address: {}", self.config.address());
        Ok((channel, pipeline, once))
    }

    fn spawner(&self) -> Result<Spawner, TransportError> {
        let guard = self.binding.lock();
        match guard.as_ref() {
            Some(TransportBinding::Tcp { worker, .. }) | Some(TransportBinding::Udp { worker }) => {
                Ok(Spawner::Pool(worker.handle().clone()))
            }
            Some(TransportBinding::Local { .. }) => Ok(Spawner::Ambient),
            None => Err(TransportError::rejected("producer is not started")),
        }
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("address", &self.config.address())
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish()
    }
}

/// Where a channel's I/O task runs: a provisioned worker pool, or the
/// caller's runtime for the in-process transport.
enum Spawner {
    Pool(tokio::runtime::Handle),
    Ambient,
}

impl Spawner {
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match self {
            Spawner::Pool(handle) => {
                handle.spawn(future);
            }
            Spawner::Ambient => {
                tokio::spawn(future);
            }
        }
    }
}

async fn wait_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// I/O loop of one outbound stream channel (TCP or local): services the
/// FIFO write queue and, in synchronous mode, correlates the first decoded
/// inbound message back to the owning exchange.
async fn run_client_stream<S>(
    mut stream: S,
    core: ChannelCore,
    pipeline: SharedPipeline,
    ctx: Correlation,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ChannelCore {
        id,
        mut writes,
        close,
        closed_guard,
    } = core;
    let _guard = closed_guard;

    let mut buf = BytesMut::with_capacity(STREAM_READ_BUFFER);
    let mut writes_open = true;
    // reply still owed to the exchange?
    let mut pending_reply = ctx.sync;
    let deadline = ctx
        .request_timeout
        .map(|t| tokio::time::Instant::now() + t);

    loop {
        tokio::select! {
            _ = close.cancelled() => {
                let _ = stream.shutdown().await;
                break;
            }
            _ = wait_deadline(deadline), if pending_reply => {
                reply_timed_out(&ctx, id);
                break;
            }
            command = writes.recv(), if writes_open => match command {
                Some(WriteCommand { bytes, done }) => {
                    let result = write_stream(&mut stream, &bytes).await;
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        break;
                    }
                }
                None => writes_open = false,
            },
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => {
                    channel_broke(
                        &ctx,
                        id,
                        &mut pending_reply,
                        TransportError::closed("connection closed before a reply arrived"),
                    );
                    break;
                }
                Ok(_) => {
                    if !correlate_inbound(&mut buf, &pipeline, &ctx, id, &mut pending_reply) {
                        break;
                    }
                }
                Err(e) => {
                    channel_broke(
                        &ctx,
                        id,
                        &mut pending_reply,
                        TransportError::write_error(format!("read failed: {}", e)),
                    );
                    break;
                }
            }
        }
    }

    ctx.registry.remove(id);
    if pending_reply {
        // stopped under the exchange; never leave the callback hanging
        ctx.exchange
            .set_error_if_absent(TransportError::closed("channel closed"));
        ctx.once.fire(false);
    }
}

/// I/O loop of one outbound datagram channel.
async fn run_client_datagram(
    socket: UdpSocket,
    core: ChannelCore,
    pipeline: SharedPipeline,
    ctx: Correlation,
    read_len: usize,
) {
    let ChannelCore {
        id,
        mut writes,
        close,
        closed_guard,
    } = core;
    let _guard = closed_guard;

    let mut raw = vec![0u8; read_len];
    let mut buf = BytesMut::new();
    let mut writes_open = true;
    let mut pending_reply = ctx.sync;
    let deadline = ctx
        .request_timeout
        .map(|t| tokio::time::Instant::now() + t);

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            _ = wait_deadline(deadline), if pending_reply => {
                reply_timed_out(&ctx, id);
                break;
            }
            command = writes.recv(), if writes_open => match command {
                Some(WriteCommand { bytes, done }) => {
                    let result = socket
                        .send(&bytes)
                        .await
                        .map(|_| ())
                        .map_err(|e| TransportError::write_error(e.to_string()));
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        break;
                    }
                }
                None => writes_open = false,
            },
            received = socket.recv(&mut raw) => match received {
                Ok(n) => {
                    buf.extend_from_slice(&raw[..n]);
                    if !correlate_inbound(&mut buf, &pipeline, &ctx, id, &mut pending_reply) {
                        break;
                    }
                }
                Err(e) => {
                    channel_broke(
                        &ctx,
                        id,
                        &mut pending_reply,
                        TransportError::write_error(format!("receive failed: {}", e)),
                    );
                    break;
                }
            }
        }
    }

    ctx.registry.remove(id);
    if pending_reply {
        ctx.exchange
            .set_error_if_absent(TransportError::closed("channel closed"));
        ctx.once.fire(false);
    }
}

async fn write_stream<S>(stream: &mut S, bytes: &[u8]) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(bytes)
        .await
        .map_err(|e| TransportError::write_error(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| TransportError::write_error(e.to_string()))
}

/// Decode whatever is buffered; the first complete message of a
/// synchronous exchange is the correlated reply. Returns false when the
/// channel should shut down.
fn correlate_inbound(
    buf: &mut BytesMut,
    pipeline: &SharedPipeline,
    ctx: &Correlation,
    id: ChannelId,
    pending_reply: &mut bool,
) -> bool {
    loop {
        let message = match pipeline.lock().decode(buf) {
            Ok(Some(message)) => message,
            Ok(None) => return true,
            Err(e) => {
                if *pending_reply {
                    *pending_reply = false;
                    ctx.exchange.set_error_if_absent(e);
                    ctx.registry.remove(id);
                    ctx.once.fire(false);
                }
                return false;
            }
        };

        if *pending_reply {
            *pending_reply = false;
            tracing::debug!(bytes = message.len(), "correlated reply from {}", ctx.address);
            ctx.exchange.set_response(message);
            let close = ctx
                .exchange
                .close_channel_when_complete()
                .unwrap_or(ctx.disconnect);
            if close {
                ctx.registry.remove(id);
                ctx.once.fire(false);
                return false;
            }
            ctx.once.fire(false);
        } else {
            tracing::debug!(
                bytes = message.len(),
                "discarding uncorrelated inbound message from {}",
                ctx.address
            );
        }
    }
}

fn reply_timed_out(ctx: &Correlation, id: ChannelId) {
    let timeout = ctx.request_timeout.unwrap_or_default();
    tracing::warn!(
        "no reply from {} within {:?}, failing the exchange",
        ctx.address,
        timeout
    );
    ctx.exchange
        .set_error_if_absent(TransportError::timeout_error("request", timeout));
    ctx.registry.remove(id);
    ctx.once.fire(false);
}

fn channel_broke(
    ctx: &Correlation,
    id: ChannelId,
    pending_reply: &mut bool,
    error: TransportError,
) {
    if *pending_reply {
        *pending_reply = false;
        ctx.exchange.set_error_if_absent(error);
        ctx.registry.remove(id);
        ctx.once.fire(false);
    }
}
