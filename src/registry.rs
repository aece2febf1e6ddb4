//! Channel registry: every live channel of one owner, so shutdown can
//! close them en masse.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::ChannelId;

/// Tracks the live channels of one consumer instance or one shared
/// producer pool. Membership is the only state; add/remove are safe from
/// any I/O task without further locking.
pub struct ChannelRegistry {
    name: String,
    channels: Mutex<HashMap<ChannelId, Channel>>,
}

impl ChannelRegistry {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, channel: Channel) {
        tracing::debug!(
            registry = %self.name,
            channel = %channel.id(),
            peer = channel.peer(),
            "registering channel"
        );
        self.channels.lock().insert(channel.id(), channel);
    }

    pub fn remove(&self, id: ChannelId) -> Option<Channel> {
        let removed = self.channels.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(registry = %self.name, channel = %id, "removed channel");
        }
        removed
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Close every member and wait for all of them, without a timeout.
    /// Close failures are swallowed; members are drained so a second call
    /// finds nothing to do.
    pub async fn close_all(&self) {
        let members: Vec<Channel> = {
            let mut guard = self.channels.lock();
            guard.drain().map(|(_, channel)| channel).collect()
        };
        if members.is_empty() {
            return;
        }

        tracing::debug!(registry = %self.name, count = members.len(), "closing all channels");
        for channel in &members {
            channel.close();
        }
        futures::future::join_all(members.iter().map(|channel| channel.closed())).await;
        tracing::debug!(registry = %self.name, "all channels closed");
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("name", &self.name)
            .field("channels", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel_pair;
    use crate::config::Protocol;

    #[tokio::test]
    async fn close_all_waits_for_members_and_drains() {
        let registry = ChannelRegistry::new("test");
        let (a, core_a) = channel_pair(Protocol::Tcp, "a");
        let (b, core_b) = channel_pair(Protocol::Tcp, "b");
        registry.add(a.clone());
        registry.add(b);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a.id()));

        // io tasks exit when asked to close
        tokio::spawn(async move {
            core_a.close.cancelled().await;
            drop(core_a.closed_guard);
        });
        tokio::spawn(async move {
            core_b.close.cancelled().await;
            drop(core_b.closed_guard);
        });

        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(a.is_closed());

        // second pass over an empty registry is a no-op
        registry.close_all().await;
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ChannelRegistry::new("test");
        let (channel, _core) = channel_pair(Protocol::Udp, "peer");
        let id = channel.id();
        registry.add(channel);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
    }
}
