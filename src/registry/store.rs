//! Stream registry implementation
//!
//! The registry owns the listener map and the live set of inbound streams
//! for one multiplexer, and turns pairing notifications into streams.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::key::ListenerKey;
use crate::codec::{Codec, Raw};
use crate::error::{MuxError, Result};
use crate::mux::{ChannelMux, PairRequest};
use crate::stream::{StreamOptions, VirtualStream, DEFAULT_PROTOCOL};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered listener
struct Listener<C: Codec, H: Codec> {
    protocol: String,
    id: Bytes,
    options: StreamOptions<C, H>,
}

struct RegistryInner<M, C: Codec, H: Codec> {
    mux: Arc<M>,
    defaults: StreamOptions<C, H>,
    listeners: Mutex<HashMap<ListenerKey, Listener<C, H>>>,
    /// Live inbound streams, removed once destroyed
    streams: Mutex<BTreeMap<u64, VirtualStream<C, H>>>,
    next_stream_id: AtomicU64,
    pair_tx: mpsc::UnboundedSender<PairRequest>,
    connection_tx: mpsc::UnboundedSender<VirtualStream<C, H>>,
}

impl<M, C, H> RegistryInner<M, C, H>
where
    M: ChannelMux,
    C: Codec + Default,
    H: Codec + Default,
{
    fn on_pair(self: &Arc<Self>, request: PairRequest) {
        let stored = ListenerKey::new(&request.protocol, Some(&request.id))
            .ok()
            .and_then(|key| {
                lock(&self.listeners)
                    .get(&key)
                    .map(|listener| listener.options.clone())
            });

        let options = match stored {
            Some(options) => options,
            None => {
                tracing::debug!(
                    protocol = %request.protocol,
                    id = ?request.id,
                    "Pairing for withdrawn listener, using registry defaults"
                );
                StreamOptions::new()
            }
        };

        let config = match options
            .or(&self.defaults)
            .protocol(request.protocol.clone())
            .id(request.id.clone())
            .resolve()
        {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(protocol = %request.protocol, error = %e, "Invalid inbound options");
                return;
            }
        };

        let stream = match VirtualStream::new(self.mux.as_ref(), config) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    protocol = %request.protocol,
                    id = ?request.id,
                    error = %e,
                    "Failed to create inbound stream"
                );
                return;
            }
        };

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let live = {
            let mut streams = lock(&self.streams);
            streams.insert(stream_id, stream.clone());
            streams.len()
        };

        tracing::info!(
            protocol = %request.protocol,
            id = ?request.id,
            stream_id = stream_id,
            live = live,
            "Inbound stream created"
        );

        let registry = Arc::downgrade(self);
        let watched = stream.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(registry) = registry.upgrade() {
                lock(&registry.streams).remove(&stream_id);
                tracing::debug!(stream_id = stream_id, "Inbound stream removed");
            }
        });

        // Nobody taking connections is fine; the stream still runs
        let _ = self.connection_tx.send(stream);
    }
}

/// Consume pairing notifications for as long as the registry lives
async fn route_pairs<M, C, H>(
    registry: Weak<RegistryInner<M, C, H>>,
    mut requests: mpsc::UnboundedReceiver<PairRequest>,
) where
    M: ChannelMux,
    C: Codec + Default,
    H: Codec + Default,
{
    while let Some(request) = requests.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.on_pair(request);
    }
}

/// Registry of virtual streams over one multiplexer
///
/// Handles `listen`/`unlisten` registrations, outbound `connect`, and
/// delivers matched inbound streams through [`next_connection`](Self::next_connection).
pub struct StreamRegistry<M: ChannelMux, C: Codec = Raw, H: Codec = Raw> {
    inner: Arc<RegistryInner<M, C, H>>,
    connections: tokio::sync::Mutex<mpsc::UnboundedReceiver<VirtualStream<C, H>>>,
    pair_task: JoinHandle<()>,
}

impl<M, C, H> StreamRegistry<M, C, H>
where
    M: ChannelMux,
    C: Codec + Default,
    H: Codec + Default,
{
    /// Create a registry over `mux` with default stream options
    ///
    /// Fails if the transport is already destroyed. Must be called within a
    /// Tokio runtime.
    pub fn new(mux: M, defaults: StreamOptions<C, H>) -> Result<Self> {
        if mux.is_destroyed() {
            return Err(MuxError::TransportDestroyed.into());
        }

        let (pair_tx, pair_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(RegistryInner {
            mux: Arc::new(mux),
            defaults,
            listeners: Mutex::new(HashMap::new()),
            streams: Mutex::new(BTreeMap::new()),
            next_stream_id: AtomicU64::new(0),
            pair_tx,
            connection_tx,
        });

        let pair_task = tokio::spawn(route_pairs(Arc::downgrade(&inner), pair_rx));

        Ok(Self {
            inner,
            connections: tokio::sync::Mutex::new(connection_rx),
            pair_task,
        })
    }

    /// Underlying multiplexer
    pub fn mux(&self) -> &M {
        &self.inner.mux
    }

    /// Default stream options
    pub fn defaults(&self) -> &StreamOptions<C, H> {
        &self.inner.defaults
    }

    fn resolve_key(
        &self,
        id: Option<Bytes>,
        options: &StreamOptions<C, H>,
    ) -> Result<(String, Bytes, ListenerKey)> {
        let protocol = options
            .protocol
            .clone()
            .or_else(|| self.inner.defaults.protocol.clone())
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string());
        let id = id
            .or_else(|| options.id.clone())
            .or_else(|| self.inner.defaults.id.clone())
            .unwrap_or_default();

        let key = ListenerKey::new(&protocol, Some(&id))?;
        Ok((protocol, id, key))
    }

    /// Accept inbound streams for `(protocol, id)`
    ///
    /// `id` overrides `options.id`; unset fields fall back to the registry
    /// defaults. Listening on an existing key is a no-op.
    pub fn listen(&self, id: Option<Bytes>, options: StreamOptions<C, H>) -> Result<&Self> {
        let (protocol, id, key) = self.resolve_key(id, &options)?;

        {
            let mut listeners = lock(&self.inner.listeners);
            if listeners.contains_key(&key) {
                return Ok(self);
            }
            listeners.insert(
                key.clone(),
                Listener {
                    protocol: protocol.clone(),
                    id: id.clone(),
                    options,
                },
            );
        }

        self.inner
            .mux
            .pair(&protocol, &id, self.inner.pair_tx.clone());

        tracing::info!(listener = %key, "Listening");
        Ok(self)
    }

    /// Stop accepting inbound streams for `(protocol, id)`
    ///
    /// Streams already created are unaffected. Unknown keys are ignored.
    pub fn unlisten(&self, options: StreamOptions<C, H>) -> &Self {
        let Ok((_, _, key)) = self.resolve_key(None, &options) else {
            return self;
        };

        let removed = lock(&self.inner.listeners).remove(&key);
        if let Some(listener) = removed {
            self.inner.mux.unpair(&listener.protocol, &listener.id);
            tracing::info!(listener = %key, "Stopped listening");
        }
        self
    }

    /// Check if a listener is registered for `(protocol, id)`
    pub fn is_listening(&self, id: Option<Bytes>, options: &StreamOptions<C, H>) -> bool {
        match self.resolve_key(id, options) {
            Ok((_, _, key)) => lock(&self.inner.listeners).contains_key(&key),
            Err(_) => false,
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Open an outbound stream
    ///
    /// `id` overrides `options.id`; unset fields fall back to the registry
    /// defaults. The stream is returned `Pending`; await
    /// [`VirtualStream::opened`] for the handshake outcome.
    pub fn connect(
        &self,
        id: Option<Bytes>,
        options: StreamOptions<C, H>,
    ) -> Result<VirtualStream<C, H>> {
        let mut options = options.or(&self.inner.defaults);
        if let Some(id) = id {
            options.id = Some(id);
        }
        let config = options.resolve()?;

        tracing::debug!(protocol = %config.protocol, id = ?config.id, "Connecting");
        VirtualStream::new(self.inner.mux.as_ref(), config)
    }

    /// Wait for the next inbound stream
    ///
    /// Streams arrive `Pending`, before their handshake is decided.
    pub async fn next_connection(&self) -> Option<VirtualStream<C, H>> {
        self.connections.lock().await.recv().await
    }

    /// Snapshot of live inbound streams, oldest first
    pub fn streams(&self) -> Vec<VirtualStream<C, H>> {
        lock(&self.inner.streams).values().cloned().collect()
    }

    /// Number of live inbound streams
    pub fn stream_count(&self) -> usize {
        lock(&self.inner.streams).len()
    }
}

impl<M: ChannelMux, C: Codec, H: Codec> Drop for StreamRegistry<M, C, H> {
    fn drop(&mut self) {
        self.pair_task.abort();
        for listener in lock(&self.inner.listeners).values() {
            self.inner.mux.unpair(&listener.protocol, &listener.id);
        }
    }
}

impl<M: ChannelMux, C: Codec, H: Codec> std::fmt::Debug for StreamRegistry<M, C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("listeners", &lock(&self.inner.listeners).len())
            .field("streams", &lock(&self.inner.streams).len())
            .finish_non_exhaustive()
    }
}
