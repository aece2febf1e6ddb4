use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::pipeline::{ClientPipelineFactory, ServerPipelineFactory};

/// Transport protocol tag.
///
/// A closed set: every decision point in the crate matches exhaustively on
/// this enum, so protocol handling is a compile-time concern. Unrecognized
/// tags only exist at the string boundary and fail there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Connection-oriented stream transport
    Tcp,
    /// Connectionless datagram transport
    Udp,
    /// In-process virtual transport, no sockets involved
    Local,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Local => "local",
        }
    }
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "local" => Ok(Protocol::Local),
            _ => Err(TransportError::UnrecognizedProtocol {
                value: value.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Textline frame delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TextlineDelimiter {
    /// Newline-terminated frames; a trailing carriage return is tolerated
    Line,
    /// NUL-terminated frames
    Null,
}

impl TextlineDelimiter {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            TextlineDelimiter::Line => b"\n",
            TextlineDelimiter::Null => b"\0",
        }
    }
}

/// Severity used when a send has no payload to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NoReplyLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl NoReplyLogLevel {
    /// The tracing macros take a const level, so dispatch by hand.
    pub fn log(&self, message: &str) {
        match self {
            NoReplyLogLevel::Trace => tracing::trace!("{}", message),
            NoReplyLogLevel::Debug => tracing::debug!("{}", message),
            NoReplyLogLevel::Info => tracing::info!("{}", message),
            NoReplyLogLevel::Warn => tracing::warn!("{}", message),
            NoReplyLogLevel::Error => tracing::error!("{}", message),
        }
    }
}

/// Endpoint configuration, immutable once a consumer or producer has
/// started with it.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport protocol
    pub protocol: Protocol,
    /// Remote (producer) or bind (consumer) host
    pub host: String,
    /// Remote (producer) or bind (consumer) port
    pub port: u16,
    /// Virtual address name for the local protocol
    pub local_address_name: Option<String>,
    /// Expect a correlated reply on the same channel for every send
    pub sync: bool,
    /// Defer outbound connection establishment until the first send
    pub lazy_channel_creation: bool,
    /// Frame payloads as delimited text lines
    pub textline: bool,
    /// Delimiter used in textline mode
    pub delimiter: TextlineDelimiter,
    /// Append the delimiter to outbound textline payloads when missing
    pub auto_append_delimiter: bool,
    /// Character encoding advertised on the exchange, UTF-8 family only
    pub charset_name: Option<String>,
    /// SO_KEEPALIVE for TCP channels
    pub keep_alive: bool,
    /// TCP_NODELAY for TCP channels
    pub tcp_no_delay: bool,
    /// SO_REUSEADDR on bound and connecting sockets
    pub reuse_address: bool,
    /// Connect timeout in milliseconds
    pub connect_timeout_millis: u64,
    /// SO_BROADCAST for UDP channels
    pub broadcast: bool,
    /// SO_SNDBUF in bytes
    pub send_buffer_size: usize,
    /// SO_RCVBUF in bytes
    pub receive_buffer_size: usize,
    /// Fixed receive-buffer size for UDP reads, 0 = unset
    pub receive_buffer_size_predictor: usize,
    /// Core executor pool size
    pub core_pool_size: usize,
    /// Maximum executor pool size
    pub max_pool_size: usize,
    /// Fixed worker thread count, 0 = derive from the pool sizing
    pub worker_count: usize,
    /// Close the channel after a completed send (async mode)
    pub disconnect: bool,
    /// Reply timeout for synchronous exchanges in milliseconds, 0 = wait
    /// forever
    pub request_timeout_millis: u64,
    /// Severity for the nothing-to-send log line
    pub no_reply_log_level: NoReplyLogLevel,
    /// User-supplied pipeline factory for producer channels
    #[serde(skip)]
    pub client_pipeline_factory: Option<Arc<dyn ClientPipelineFactory>>,
    /// User-supplied pipeline factory for consumer channels
    #[serde(skip)]
    pub server_pipeline_factory: Option<Arc<dyn ServerPipelineFactory>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            host: "127.0.0.1".to_string(),
            port: 0,
            local_address_name: None,
            sync: true,
            lazy_channel_creation: true,
            textline: false,
            delimiter: TextlineDelimiter::Line,
            auto_append_delimiter: true,
            charset_name: None,
            keep_alive: true,
            tcp_no_delay: true,
            reuse_address: true,
            connect_timeout_millis: 10_000,
            broadcast: false,
            send_buffer_size: 65536,
            receive_buffer_size: 65536,
            receive_buffer_size_predictor: 0,
            core_pool_size: 10,
            max_pool_size: 100,
            worker_count: 0,
            disconnect: false,
            request_timeout_millis: 0,
            no_reply_log_level: NoReplyLogLevel::Warn,
            client_pipeline_factory: None,
            server_pipeline_factory: None,
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("local_address_name", &self.local_address_name)
            .field("sync", &self.sync)
            .field("lazy_channel_creation", &self.lazy_channel_creation)
            .field("textline", &self.textline)
            .field("delimiter", &self.delimiter)
            .field("auto_append_delimiter", &self.auto_append_delimiter)
            .field("charset_name", &self.charset_name)
            .field("keep_alive", &self.keep_alive)
            .field("tcp_no_delay", &self.tcp_no_delay)
            .field("reuse_address", &self.reuse_address)
            .field("connect_timeout_millis", &self.connect_timeout_millis)
            .field("broadcast", &self.broadcast)
            .field("send_buffer_size", &self.send_buffer_size)
            .field("receive_buffer_size", &self.receive_buffer_size)
            .field(
                "receive_buffer_size_predictor",
                &self.receive_buffer_size_predictor,
            )
            .field("core_pool_size", &self.core_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("worker_count", &self.worker_count)
            .field("disconnect", &self.disconnect)
            .field("request_timeout_millis", &self.request_timeout_millis)
            .field("no_reply_log_level", &self.no_reply_log_level)
            .field(
                "client_pipeline_factory",
                &self.client_pipeline_factory.is_some(),
            )
            .field(
                "server_pipeline_factory",
                &self.server_pipeline_factory.is_some(),
            )
            .finish()
    }
}

impl TransportConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    /// Parse the protocol from its configuration tag.
    pub fn with_protocol_str(mut self, value: &str) -> Result<Self, TransportError> {
        self.protocol = value.parse()?;
        Ok(self)
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_local_address_name<S: Into<String>>(mut self, name: S) -> Self {
        self.local_address_name = Some(name.into());
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_lazy_channel_creation(mut self, lazy: bool) -> Self {
        self.lazy_channel_creation = lazy;
        self
    }

    pub fn with_textline(mut self, textline: bool) -> Self {
        self.textline = textline;
        self
    }

    pub fn with_delimiter(mut self, delimiter: TextlineDelimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_auto_append_delimiter(mut self, auto_append: bool) -> Self {
        self.auto_append_delimiter = auto_append;
        self
    }

    pub fn with_charset_name<S: Into<String>>(mut self, charset: S) -> Self {
        self.charset_name = Some(charset.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_tcp_no_delay(mut self, no_delay: bool) -> Self {
        self.tcp_no_delay = no_delay;
        self
    }

    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn with_connect_timeout_millis(mut self, millis: u64) -> Self {
        self.connect_timeout_millis = millis;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_receive_buffer_size_predictor(mut self, size: usize) -> Self {
        self.receive_buffer_size_predictor = size;
        self
    }

    pub fn with_core_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self
    }

    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_disconnect(mut self, disconnect: bool) -> Self {
        self.disconnect = disconnect;
        self
    }

    pub fn with_request_timeout_millis(mut self, millis: u64) -> Self {
        self.request_timeout_millis = millis;
        self
    }

    pub fn with_no_reply_log_level(mut self, level: NoReplyLogLevel) -> Self {
        self.no_reply_log_level = level;
        self
    }

    pub fn with_client_pipeline_factory(
        mut self,
        factory: Arc<dyn ClientPipelineFactory>,
    ) -> Self {
        self.client_pipeline_factory = Some(factory);
        self
    }

    pub fn with_server_pipeline_factory(
        mut self,
        factory: Arc<dyn ServerPipelineFactory>,
    ) -> Self {
        self.server_pipeline_factory = Some(factory);
        self
    }

    /// Human-readable endpoint address for logs and error context.
    pub fn address(&self) -> String {
        match self.protocol {
            Protocol::Local => format!(
                "local:{}",
                self.local_address_name.as_deref().unwrap_or("<unset>")
            ),
            _ => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_millis == 0 {
            None
        } else {
            Some(Duration::from_millis(self.request_timeout_millis))
        }
    }

    /// Validate the configuration before start. Fatal on failure: the
    /// consumer or producer owning this configuration never starts.
    pub fn validate(&self) -> Result<(), TransportError> {
        match self.protocol {
            Protocol::Local => {
                if self
                    .local_address_name
                    .as_deref()
                    .map(str::is_empty)
                    .unwrap_or(true)
                {
                    return Err(TransportError::config_error(
                        "local_address_name",
                        "required when protocol is local",
                    ));
                }
            }
            Protocol::Tcp | Protocol::Udp => {
                if self.host.is_empty() {
                    return Err(TransportError::config_error("host", "must not be empty"));
                }
            }
        }

        if self.core_pool_size == 0 {
            return Err(TransportError::config_error(
                "core_pool_size",
                "must be > 0",
            ));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(TransportError::config_error(
                "max_pool_size",
                "must be >= core_pool_size",
            ));
        }
        if let Some(charset) = self.charset_name.as_deref() {
            crate::pipeline::textline::normalize_charset(charset)?;
        }
        Ok(())
    }

    /// Validate and return, builder-style.
    pub fn build(self) -> Result<Self, TransportError> {
        self.validate()?;
        Ok(self)
    }
}
