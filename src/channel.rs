//! Channel handles.
//!
//! A channel is a live endpoint backed by a spawned I/O task. The handle
//! side queues writes over an mpsc command channel (FIFO per channel) and
//! carries two cancellation tokens: `close` asks the I/O task to stop,
//! `closed` is cancelled by the task's drop guard once it actually has.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::Protocol;
use crate::error::TransportError;
use crate::ChannelId;

/// Queue depth of the per-channel write command queue.
const WRITE_QUEUE_DEPTH: usize = 64;

/// One asynchronous write plus its completion listener.
pub struct WriteCommand {
    pub bytes: Bytes,
    pub done: oneshot::Sender<Result<(), TransportError>>,
}

/// Cloneable handle over one live channel.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    protocol: Protocol,
    peer: String,
    writer: mpsc::Sender<WriteCommand>,
    close: CancellationToken,
    closed: CancellationToken,
}

/// The I/O-task side of a channel: the write queue receiver, the close
/// signal to honor and the guard that flags the channel closed on exit.
pub struct ChannelCore {
    pub id: ChannelId,
    pub writes: mpsc::Receiver<WriteCommand>,
    pub close: CancellationToken,
    pub closed_guard: DropGuard,
}

/// Create the paired handle and I/O side for a new channel.
pub fn channel_pair(protocol: Protocol, peer: impl Into<String>) -> (Channel, ChannelCore) {
    let id = ChannelId::next();
    let (writer, writes) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let close = CancellationToken::new();
    let closed = CancellationToken::new();

    let handle = Channel {
        id,
        protocol,
        peer: peer.into(),
        writer,
        close: close.clone(),
        closed: closed.clone(),
    };
    let core = ChannelCore {
        id,
        writes,
        close,
        closed_guard: closed.drop_guard(),
    };
    (handle, core)
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue one write. The returned receiver resolves when the underlying
    /// transport reports the write finished, on whatever I/O thread that
    /// happens.
    pub async fn write(&self, bytes: Bytes) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        let command = WriteCommand { bytes, done: tx };
        if let Err(mpsc::error::SendError(command)) = self.writer.send(command).await {
            let _ = command
                .done
                .send(Err(TransportError::closed("channel is no longer writable")));
        }
        rx
    }

    /// Ask the I/O task to stop. Returns immediately; await [`closed`] for
    /// the actual closure.
    ///
    /// [`closed`]: Channel::closed
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Resolves once the I/O task has exited, however it exited.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_after_io_task_exit_reports_closed() {
        let (channel, core) = channel_pair(Protocol::Tcp, "test");
        drop(core);

        let rx = channel.write(Bytes::from_static(b"data")).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed { .. })));
    }

    #[tokio::test]
    async fn dropping_the_core_marks_the_channel_closed() {
        let (channel, core) = channel_pair(Protocol::Local, "test");
        assert!(!channel.is_closed());
        drop(core);
        channel.closed().await;
        assert!(channel.is_closed());
    }
}
