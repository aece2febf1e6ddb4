use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::TransportError;

/// Opaque message body.
///
/// The core never looks inside a payload; codec stages decide how it maps
/// to bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
}

impl Payload {
    /// Raw byte view, encoding text as UTF-8.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    /// Convert to text for the textline path. Byte payloads must be valid
    /// UTF-8; anything else is a conversion failure, not a panic.
    pub fn into_text(self) -> Result<String, TransportError> {
        match self {
            Payload::Text(text) => Ok(text),
            Payload::Bytes(bytes) => String::from_utf8(bytes.to_vec()).map_err(|e| {
                TransportError::conversion_error(format!("payload is not valid UTF-8: {}", e))
            }),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(bytes) => bytes.len(),
            Payload::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// One unit of work: a request, its optional response and its optional
/// terminal error, plus the named control attributes the core honors.
#[derive(Debug, Default, Clone)]
pub struct Exchange {
    request: Option<Payload>,
    response: Option<Payload>,
    error: Option<TransportError>,
    /// Overrides the static disconnect configuration for this exchange
    close_channel_when_complete: Option<bool>,
    /// Character encoding advertised to codec stages
    charset_name: Option<String>,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(payload: impl Into<Payload>) -> Self {
        Self {
            request: Some(payload.into()),
            ..Self::default()
        }
    }

    pub fn request(&self) -> Option<&Payload> {
        self.request.as_ref()
    }

    pub fn set_request(&mut self, payload: impl Into<Payload>) {
        self.request = Some(payload.into());
    }

    pub fn response(&self) -> Option<&Payload> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, payload: impl Into<Payload>) {
        self.response = Some(payload.into());
    }

    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: TransportError) {
        self.error = Some(error);
    }

    pub fn close_channel_when_complete(&self) -> Option<bool> {
        self.close_channel_when_complete
    }

    pub fn set_close_channel_when_complete(&mut self, close: bool) {
        self.close_channel_when_complete = Some(close);
    }

    pub fn charset_name(&self) -> Option<&str> {
        self.charset_name.as_deref()
    }

    pub fn set_charset_name(&mut self, charset: impl Into<String>) {
        self.charset_name = Some(charset.into());
    }

    pub fn into_shared(self) -> ExchangeRef {
        ExchangeRef::new(self)
    }
}

/// Shared handle on an exchange.
///
/// The producer, its write-completion task and the reply-correlating read
/// loop all touch the same exchange from different tasks; every access goes
/// through this handle's short-lived lock.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRef(Arc<Mutex<Exchange>>);

impl ExchangeRef {
    pub fn new(exchange: Exchange) -> Self {
        Self(Arc::new(Mutex::new(exchange)))
    }

    pub fn request(&self) -> Option<Payload> {
        self.0.lock().request.clone()
    }

    pub fn set_request(&self, payload: impl Into<Payload>) {
        self.0.lock().set_request(payload);
    }

    pub fn response(&self) -> Option<Payload> {
        self.0.lock().response.clone()
    }

    pub fn set_response(&self, payload: impl Into<Payload>) {
        self.0.lock().set_response(payload);
    }

    pub fn take_response(&self) -> Option<Payload> {
        self.0.lock().response.take()
    }

    pub fn error(&self) -> Option<TransportError> {
        self.0.lock().error.clone()
    }

    pub fn set_error(&self, error: TransportError) {
        self.0.lock().set_error(error);
    }

    /// Attach an error only when none is recorded yet.
    pub fn set_error_if_absent(&self, error: TransportError) {
        let mut guard = self.0.lock();
        if guard.error.is_none() {
            guard.set_error(error);
        }
    }

    pub fn close_channel_when_complete(&self) -> Option<bool> {
        self.0.lock().close_channel_when_complete
    }

    pub fn set_close_channel_when_complete(&self, close: bool) {
        self.0.lock().set_close_channel_when_complete(close);
    }

    pub fn charset_name(&self) -> Option<String> {
        self.0.lock().charset_name.clone()
    }

    pub fn set_charset_name(&self, charset: impl Into<String>) {
        self.0.lock().set_charset_name(charset);
    }

    /// Run a closure under the exchange lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut Exchange) -> R) -> R {
        f(&mut self.0.lock())
    }
}

/// Completion callback for one dispatched exchange.
///
/// The flag is the continuation contract: `true` means the exchange
/// finished before `send` returned, `false` means it finished later on an
/// I/O task, so the caller resumes on a different execution context.
pub type DoneCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// A no-op callback, used by the startup connection probe.
pub fn noop_callback() -> DoneCallback {
    Arc::new(|_done_sync| {})
}

/// Wrapper making a oneshot sender callable from a `Fn` callback at most
/// once; later invocations are ignored.
struct SenderCell {
    inner: Mutex<Option<oneshot::Sender<bool>>>,
}

impl SenderCell {
    fn fire(&self, done_sync: bool) {
        if let Some(sender) = self.inner.lock().take() {
            let _ = sender.send(done_sync);
        }
    }
}

/// Build a callback plus a receiver resolving to the continuation flag
/// once the exchange completes.
pub fn completion_pair() -> (DoneCallback, oneshot::Receiver<bool>) {
    let (tx, rx) = oneshot::channel();
    let cell = Arc::new(SenderCell {
        inner: Mutex::new(Some(tx)),
    });
    let callback: DoneCallback = Arc::new(move |done_sync| cell.fire(done_sync));
    (callback, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_payload_to_text_requires_utf8() {
        let ok = Payload::from(&b"hello"[..]).into_text().unwrap();
        assert_eq!(ok, "hello");

        let err = Payload::from(vec![0xff, 0xfe]).into_text().unwrap_err();
        assert!(matches!(err, TransportError::Conversion { .. }));
    }

    #[test]
    fn error_is_only_attached_once() {
        let exchange = Exchange::of("body").into_shared();
        exchange.set_error_if_absent(TransportError::rejected("stopping"));
        exchange.set_error_if_absent(TransportError::write_error("later"));
        assert!(matches!(
            exchange.error(),
            Some(TransportError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn completion_pair_fires_once() {
        let (done, rx) = completion_pair();
        done(false);
        done(true);
        assert_eq!(rx.await.unwrap(), false);
    }
}
