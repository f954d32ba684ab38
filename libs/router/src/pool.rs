use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ip_packet::IpPacket;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tunnel_proto::{CloseReason, ConnId};

/// How many inbound events a single handler buffers.
///
/// The tunnel read loop awaits capacity here, so a slow flow eventually
/// backpressures the whole stream instead of growing memory.
pub(crate) const HANDLER_QUEUE: usize = 64;

/// Everything a handler can be fed.
#[derive(Debug)]
pub(crate) enum HandlerEvent {
    /// A packet for this flow arrived on the TUN device.
    Packet(IpPacket),
    /// Payload for this flow arrived on the tunnel.
    TunnelPayload(Bytes),
    /// The remote endpoint closed this flow.
    TunnelClose(CloseReason),
    /// The session is going away; tear down immediately.
    Shutdown(CloseReason),
}

/// A pool entry; the live end of a per-flow handler task.
pub struct Handler {
    id: ConnId,
    events: tokio::sync::mpsc::Sender<HandlerEvent>,
    cancel: CancellationToken,
    last_activity: Mutex<Instant>,
}

impl Handler {
    pub(crate) fn new(
        id: ConnId,
        events: tokio::sync::mpsc::Sender<HandlerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            events,
            cancel,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Feeds an event, awaiting queue capacity.
    pub(crate) async fn send(&self, event: HandlerEvent) -> Result<(), HandlerGone> {
        self.touch();

        self.events.send(event).await.map_err(|_| HandlerGone)
    }

    /// Feeds an event if there is capacity; drops it otherwise.
    pub(crate) fn try_send(&self, event: HandlerEvent) -> Result<(), HandlerGone> {
        self.touch();

        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(tokio::sync::mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(id = %self.id, ?event, "Handler queue full; dropping event");

                Ok(())
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => Err(HandlerGone),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn hard_close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Handler is gone")]
pub(crate) struct HandlerGone;

/// The set of active flows, keyed by their 5-tuple.
///
/// At most one handler exists per [`ConnId`]; concurrent creation is resolved
/// to a single winner under the map's shard lock.
#[derive(Default)]
pub struct ConnPool {
    inner: DashMap<ConnId, Arc<Handler>>,
}

impl ConnPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, id: &ConnId) -> Option<Arc<Handler>> {
        self.inner.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Looks up or creates the TCP handler for `id`.
    ///
    /// The caller may receive a handler created by a concurrent winner. The
    /// first packet is passed to the factory so it can refuse anything that
    /// isn't a valid flow start.
    pub(crate) fn get_or_create_tcp<F>(
        self: &Arc<Self>,
        id: ConnId,
        first_packet: &IpPacket,
        factory: F,
    ) -> anyhow::Result<Arc<Handler>>
    where
        F: FnOnce(&IpPacket, Remover) -> anyhow::Result<Arc<Handler>>,
    {
        self.get_or_create_inner(id, |remover| factory(first_packet, remover))
    }

    /// UDP counterpart of [`ConnPool::get_or_create_tcp`]; no packet validation.
    pub(crate) fn get_or_create<F>(self: &Arc<Self>, id: ConnId, factory: F) -> anyhow::Result<Arc<Handler>>
    where
        F: FnOnce(Remover) -> anyhow::Result<Arc<Handler>>,
    {
        self.get_or_create_inner(id, factory)
    }

    fn get_or_create_inner<F>(self: &Arc<Self>, id: ConnId, factory: F) -> anyhow::Result<Arc<Handler>>
    where
        F: FnOnce(Remover) -> anyhow::Result<Arc<Handler>>,
    {
        match self.inner.entry(id) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let remover = Remover {
                    pool: Arc::downgrade(self),
                    id,
                };

                // A failing factory leaves no partial state behind.
                let handler = factory(remover)?;
                entry.insert(handler.clone());

                Ok(handler)
            }
        }
    }

    pub(crate) fn remove(&self, id: &ConnId) {
        self.inner.remove(id);
    }

    /// Signals every handler to shut down and waits up to `grace` for them to
    /// drain; whatever is left gets hard-closed.
    pub async fn close_all(&self, reason: CloseReason, grace: Duration) {
        let handlers = self
            .inner
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();

        for handler in &handlers {
            tracing::debug!(id = %handler.id(), idle = ?handler.idle_for(), %reason, "Shutting down handler");

            if handler.try_send(HandlerEvent::Shutdown(reason)).is_err() {
                self.remove(&handler.id());
            }
        }

        let deadline = Instant::now() + grace;

        while !self.inner.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        for handler in handlers {
            handler.hard_close();
        }

        self.inner.clear();
    }
}

/// Detaches a pool entry from inside its handler task without keeping the
/// pool alive.
pub(crate) struct Remover {
    pool: Weak<ConnPool>,
    id: ConnId,
}

impl Remover {
    pub(crate) fn remove(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_proto::Protocol;

    fn conn_id() -> ConnId {
        ConnId::new(
            Protocol::Udp,
            "10.0.0.1:1111".parse().unwrap(),
            "10.0.0.2:2222".parse().unwrap(),
        )
        .unwrap()
    }

    fn dummy_handler(id: ConnId) -> (Arc<Handler>, tokio::sync::mpsc::Receiver<HandlerEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(HANDLER_QUEUE);

        (
            Arc::new(Handler::new(id, tx, CancellationToken::new())),
            rx,
        )
    }

    #[tokio::test]
    async fn second_create_returns_existing_handler() {
        let pool = ConnPool::new();
        let id = conn_id();

        let (handler, _rx) = dummy_handler(id);
        let first = pool
            .get_or_create(id, |_| Ok(handler.clone()))
            .unwrap();

        let second = pool
            .get_or_create(id, |_| panic!("factory must not run for existing entries"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn factory_error_leaves_no_entry() {
        let pool = ConnPool::new();
        let id = conn_id();

        let result = pool.get_or_create(id, |_| anyhow::bail!("nope"));

        assert!(result.is_err());
        assert!(pool.get(&id).is_none());

        // A subsequent create succeeds.
        let (handler, _rx) = dummy_handler(id);
        pool.get_or_create(id, |_| Ok(handler)).unwrap();
        assert!(pool.get(&id).is_some());
    }

    #[tokio::test]
    async fn remover_detaches_entry() {
        let pool = ConnPool::new();
        let id = conn_id();

        let mut remover = None;
        let (handler, _rx) = dummy_handler(id);
        pool.get_or_create(id, |r| {
            remover = Some(r);
            Ok(handler)
        })
        .unwrap();

        remover.unwrap().remove();

        assert!(pool.get(&id).is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_the_pool() {
        let pool = ConnPool::new();
        let id = conn_id();

        let (handler, mut rx) = dummy_handler(id);
        pool.get_or_create(id, |_| Ok(handler)).unwrap();

        pool.close_all(CloseReason::TunnelBroken, Duration::from_millis(100))
            .await;

        assert!(pool.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(HandlerEvent::Shutdown(CloseReason::TunnelBroken))
        ));
    }
}
