//! Listener engine: binds an endpoint, feeds every decoded inbound
//! message to the processing collaborator and, in synchronous mode,
//! writes the produced reply back on the same channel.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::adapters::local::LocalHub;
use crate::adapters::{tcp, udp};
use crate::channel::{channel_pair, ChannelCore};
use crate::config::{Protocol, TransportConfig};
use crate::error::TransportError;
use crate::exchange::Payload;
use crate::pipeline::{self, Pipeline};
use crate::registry::ChannelRegistry;
use crate::transport::binding::TransportBinding;
use crate::transport::executor::{ExecutorProvider, TokioExecutorProvider};

const STREAM_READ_BUFFER: usize = 8192;

/// The message-processing collaborator.
///
/// Invoked once per decoded inbound unit. The engine awaits the result
/// before deciding whether to write anything back, so implementations may
/// be as asynchronous as they like.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: Payload) -> Result<Option<Payload>, TransportError>;
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F> MessageProcessor for FnProcessor<F>
where
    F: Fn(Payload) -> Result<Option<Payload>, TransportError> + Send + Sync,
{
    async fn process(&self, message: Payload) -> Result<Option<Payload>, TransportError> {
        (self.0)(message)
    }
}

/// Wrap a plain closure as a [`MessageProcessor`].
pub fn processor_fn<F>(f: F) -> Arc<dyn MessageProcessor>
where
    F: Fn(Payload) -> Result<Option<Payload>, TransportError> + Send + Sync + 'static,
{
    Arc::new(FnProcessor(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Stopped,
    Binding,
    Bound,
    Closing,
}

/// Consumer-side transport endpoint.
///
/// Owns exactly one bound channel, tracked in a per-instance registry so
/// `stop` can close it (and every accepted connection under it) before the
/// executor pools are released.
pub struct TransportServer {
    config: Arc<TransportConfig>,
    processor: Arc<dyn MessageProcessor>,
    registry: Arc<ChannelRegistry>,
    provider: Arc<dyn ExecutorProvider>,
    hub: Arc<LocalHub>,
    state: Mutex<ServerState>,
    binding: Mutex<Option<TransportBinding>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    connections: TaskTracker,
}

impl TransportServer {
    /// Create a server for the given configuration. The configuration is
    /// checked up front: an invalid one never produces a server.
    pub fn new(
        config: TransportConfig,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let registry = ChannelRegistry::new(format!("consumer:{}", config.address()));
        Ok(Self {
            config: Arc::new(config),
            processor,
            registry,
            provider: Arc::new(TokioExecutorProvider::new()),
            hub: LocalHub::global(),
            state: Mutex::new(ServerState::Stopped),
            binding: Mutex::new(None),
            bound_addr: Mutex::new(None),
            connections: TaskTracker::new(),
        })
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

    /// The actual bound socket address, available once started. Handy when
    /// binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == ServerState::Bound
    }

    /// Bind and start listening. Fatal on failure: pools are released, no
    /// channel stays registered and the state returns to stopped.
    pub async fn start(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Stopped {
                return Ok(());
            }
            *state = ServerState::Binding;
        }
        tracing::debug!("consumer binding to: {}", self.config.address());

        match self.bind_transport().await {
            Ok(()) => {
                *self.state.lock() = ServerState::Bound;
                tracing::info!("consumer bound to: {}", self.config.address());
                Ok(())
            }
            Err(e) => {
                if let Some(binding) = self.binding.lock().take() {
                    binding.release();
                }
                *self.state.lock() = ServerState::Stopped;
                Err(e)
            }
        }
    }

    /// Close every registered channel, wait for in-flight connections to
    /// wind down, then release pool resources. Idempotent; never raises.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Bound | ServerState::Binding => *state = ServerState::Closing,
                _ => return,
            }
        }
        tracing::debug!("consumer unbinding from: {}", self.config.address());

        self.registry.close_all().await;
        self.connections.close();
        self.connections.wait().await;
        self.connections.reopen();

        if self.config.protocol == Protocol::Local {
            if let Some(name) = self.config.local_address_name.as_deref() {
                self.hub.unbind(name);
            }
        }
        if let Some(binding) = self.binding.lock().take() {
            binding.release();
        }
        *self.bound_addr.lock() = None;
        *self.state.lock() = ServerState::Stopped;
        tracing::info!("consumer unbound from: {}", self.config.address());
    }

    async fn bind_transport(&self) -> Result<(), TransportError> {
        let owner = format!("consumer-{}", self.config.protocol);
        let binding =
            TransportBinding::select(&self.config, self.provider.as_ref(), &owner, &self.hub)?;

        match &binding {
            TransportBinding::Tcp { boss, worker } => {
                let listener = tcp::bind(&self.config).await?;
                let addr = listener.local_addr().map_err(|e| {
                    TransportError::bind_error(self.config.address(), e.to_string())
                })?;
                *self.bound_addr.lock() = Some(addr);

                let (handle, core) = channel_pair(Protocol::Tcp, addr.to_string());
                self.registry.add(handle);
                boss.spawn(accept_tcp(
                    listener,
                    core,
                    self.config.clone(),
                    self.processor.clone(),
                    self.connections.clone(),
                    worker.handle().clone(),
                ));
            }
            TransportBinding::Udp { worker } => {
                let socket = udp::bind(&self.config).await?;
                let addr = socket.local_addr().map_err(|e| {
                    TransportError::bind_error(self.config.address(), e.to_string())
                })?;
                *self.bound_addr.lock() = Some(addr);

                let (handle, core) = channel_pair(Protocol::Udp, addr.to_string());
                self.registry.add(handle);
                worker.spawn(serve_datagram(
                    socket,
                    core,
                    self.config.clone(),
                    self.processor.clone(),
                ));
            }
            TransportBinding::Local { hub } => {
                let name = self
                    .config
                    .local_address_name
                    .clone()
                    .ok_or_else(|| {
                        TransportError::config_error("local_address_name", "missing")
                    })?;
                let acceptor = hub.bind(&name)?;

                let (handle, core) = channel_pair(Protocol::Local, format!("local:{}", name));
                self.registry.add(handle);
                tokio::spawn(accept_local(
                    acceptor,
                    core,
                    self.config.clone(),
                    self.processor.clone(),
                    self.connections.clone(),
                    hub.clone(),
                    name,
                ));
            }
        }

        *self.binding.lock() = Some(binding);
        Ok(())
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("address", &self.config.address())
            .field("state", &*self.state.lock())
            .finish()
    }
}

async fn accept_tcp(
    listener: TcpListener,
    core: ChannelCore,
    config: Arc<TransportConfig>,
    processor: Arc<dyn MessageProcessor>,
    connections: TaskTracker,
    io: tokio::runtime::Handle,
) {
    let ChannelCore {
        close,
        closed_guard,
        ..
    } = core;
    let _guard = closed_guard;

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = tcp::apply_stream_options(&stream, &config) {
                        tracing::warn!(peer = %peer, "cannot apply socket options: {}", e);
                        continue;
                    }
                    let pipeline = pipeline::server_pipeline(&config);
                    let serve = serve_stream(
                        stream,
                        close.child_token(),
                        pipeline,
                        processor.clone(),
                        config.sync,
                        peer.to_string(),
                    );
                    io.spawn(connections.track_future(serve));
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                }
            }
        }
    }
}

async fn accept_local(
    mut acceptor: mpsc::Receiver<tokio::io::DuplexStream>,
    core: ChannelCore,
    config: Arc<TransportConfig>,
    processor: Arc<dyn MessageProcessor>,
    connections: TaskTracker,
    hub: Arc<LocalHub>,
    name: String,
) {
    let ChannelCore {
        close,
        closed_guard,
        ..
    } = core;
    let _guard = closed_guard;

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            stream = acceptor.recv() => match stream {
                Some(stream) => {
                    let pipeline = pipeline::server_pipeline(&config);
                    let serve = serve_stream(
                        stream,
                        close.child_token(),
                        pipeline,
                        processor.clone(),
                        config.sync,
                        format!("local:{}", name),
                    );
                    tokio::spawn(connections.track_future(serve));
                }
                None => break,
            }
        }
    }
    hub.unbind(&name);
}

/// Per-connection loop shared by the TCP and local transports.
async fn serve_stream<S>(
    mut stream: S,
    cancel: CancellationToken,
    mut pipeline: Pipeline,
    processor: Arc<dyn MessageProcessor>,
    sync: bool,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(STREAM_READ_BUFFER);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = stream.shutdown().await;
                break;
            }
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if !dispatch_inbound(&mut stream, &mut buf, &mut pipeline, &processor, sync, &peer).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, "read failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Decode everything buffered so far and run each message through the
/// processor. Returns false when the connection should be torn down.
async fn dispatch_inbound<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    pipeline: &mut Pipeline,
    processor: &Arc<dyn MessageProcessor>,
    sync: bool,
    peer: &str,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    loop {
        let message = match pipeline.decode(buf) {
            Ok(Some(message)) => message,
            Ok(None) => return true,
            Err(e) => {
                tracing::warn!(peer = %peer, "cannot decode inbound data: {}", e);
                return false;
            }
        };
        tracing::debug!(peer = %peer, bytes = message.len(), "inbound message");

        match processor.process(message).await {
            Ok(Some(reply)) if sync => {
                let wire = match pipeline.encode(reply) {
                    Ok(wire) => wire,
                    Err(e) => {
                        tracing::warn!(peer = %peer, "cannot encode reply: {}", e);
                        return false;
                    }
                };
                if let Err(e) = stream.write_all(&wire).await {
                    tracing::debug!(peer = %peer, "reply write failed: {}", e);
                    return false;
                }
            }
            // nothing produced, or async mode: nothing goes back
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(peer = %peer, "processor failed: {}", e);
                return false;
            }
        }
    }
}

/// Loop for the single bound datagram socket.
async fn serve_datagram(
    socket: UdpSocket,
    core: ChannelCore,
    config: Arc<TransportConfig>,
    processor: Arc<dyn MessageProcessor>,
) {
    let ChannelCore {
        close,
        closed_guard,
        ..
    } = core;
    let _guard = closed_guard;

    let mut pipeline = pipeline::server_pipeline(&config);
    let mut raw = vec![0u8; udp::read_buffer_len(&config)];
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            received = socket.recv_from(&mut raw) => match received {
                Ok((n, peer)) => {
                    buf.extend_from_slice(&raw[..n]);
                    loop {
                        let message = match pipeline.decode(&mut buf) {
                            Ok(Some(message)) => message,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(peer = %peer, "cannot decode datagram: {}", e);
                                buf.clear();
                                break;
                            }
                        };
                        match processor.process(message).await {
                            Ok(Some(reply)) if config.sync => {
                                match pipeline.encode(reply) {
                                    Ok(wire) => {
                                        if let Err(e) = socket.send_to(&wire, peer).await {
                                            tracing::debug!(peer = %peer, "reply send failed: {}", e);
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(peer = %peer, "cannot encode reply: {}", e)
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(peer = %peer, "processor failed: {}", e),
                        }
                    }
                }
                Err(e) => {
                    // datagram sockets report transient peer errors; keep serving
                    tracing::debug!("datagram receive failed: {}", e);
                }
            }
        }
    }
}
