//! Virtual stream over one logical channel
//!
//! A [`VirtualStream`] is a cheap, cloneable handle. Its channel events are
//! consumed in order by one driver task spawned at construction; application
//! calls (`write`, `read`, `close`, `destroy`) act on the same shared state.
//!
//! # Flow control
//!
//! ```text
//!   write() ──► [write queue] ──send()──► Channel ──► peer
//!                    ▲            │false
//!                    └── Drained ─┘
//!
//!   peer ──Message──► [inbound queue] ──► read()
//!                         │ > high water: cork
//!                         │ ≤ low water:  uncork
//! ```
//!
//! The write queue lets one batch at a time reach the channel. A batch that
//! saturates the outbound buffer holds the queue until the channel drains.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{broadcast, watch, Notify};

use super::config::{StreamConfig, UserData};
use super::event::StreamEvent;
use super::handshake::{BoxError, HandshakeFuture, OnHandshake, OpenLatch};
use super::state::StreamState;
use crate::codec::{Codec, Raw};
use crate::error::{CodecError, Error, MuxError, Result};
use crate::mux::{Channel, ChannelEvent, ChannelEvents, ChannelMux, ChannelOptions};

/// Capacity of the notification channel per stream
const EVENT_CAPACITY: usize = 16;

struct Shared<T, R> {
    state: StreamState,
    channel: Option<Box<dyn Channel>>,
    inbound: VecDeque<T>,
    remote_handshake: Option<R>,
    local_ended: bool,
    remote_ended: bool,
    /// Peer tore the channel down
    severed: bool,
    corked: bool,
    awaiting_drain: bool,
    /// Reported by reads once the stream is gone
    failure: Option<Error>,
}

struct Inner<C: Codec, H: Codec> {
    protocol: String,
    id: Bytes,
    codec: Arc<C>,
    handshake_codec: Arc<H>,
    on_handshake: Option<OnHandshake<H::Item>>,
    read_high_water_mark: usize,
    read_low_water_mark: usize,
    user_data: Option<UserData>,
    shared: Mutex<Shared<C::Item, H::Item>>,
    /// Wakes readers and writers after any change to `shared`
    changed: Notify,
    write_queue: tokio::sync::Mutex<()>,
    open: OpenLatch,
    state_tx: watch::Sender<StreamState>,
    events: broadcast::Sender<StreamEvent>,
}

impl<C: Codec, H: Codec> Inner<C, H> {
    fn lock(&self) -> MutexGuard<'_, Shared<C::Item, H::Item>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut Shared<C::Item, H::Item>, state: StreamState) {
        if shared.state != state {
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn emit(&self, event: StreamEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Decode the peer handshake and start admission
    ///
    /// Returns the pending predicate when one must still decide.
    fn on_opened(&self, payload: Bytes) -> Option<(HandshakeFuture, H::Item)> {
        let remote = match self.handshake_codec.decode(payload) {
            Ok(remote) => remote,
            Err(e) => {
                self.reject(Error::Handshake(e.to_string()));
                return None;
            }
        };

        match &self.on_handshake {
            None => {
                self.accept(remote);
                None
            }
            Some(predicate) => Some((predicate(remote.clone()), remote)),
        }
    }

    fn on_verdict(&self, remote: H::Item, verdict: std::result::Result<bool, BoxError>) {
        match verdict {
            Ok(true) => self.accept(remote),
            Ok(false) => self.reject(Error::Rejected("handshake declined".into())),
            Err(e) => self.reject(Error::Handshake(e.to_string())),
        }
    }

    fn accept(&self, remote: H::Item) {
        {
            let mut shared = self.lock();
            if shared.state != StreamState::Pending {
                return;
            }
            shared.remote_handshake = Some(remote);
            self.set_state(&mut shared, StreamState::Open);
        }

        tracing::debug!(protocol = %self.protocol, id = ?self.id, "Stream connected");
        self.emit(StreamEvent::Connect);
        self.open.resolve(Ok(()));
        self.changed.notify_waiters();
    }

    fn reject(&self, cause: Error) {
        {
            let mut shared = self.lock();
            if shared.state.is_destroyed() {
                return;
            }
            self.set_state(&mut shared, StreamState::Rejected);
            shared.failure = Some(cause.clone());
            // Only the logical channel; the transport stays up
            if let Some(channel) = &shared.channel {
                channel.close();
            }
        }

        tracing::debug!(
            protocol = %self.protocol,
            id = ?self.id,
            reason = %cause,
            "Stream rejected"
        );
        self.emit(StreamEvent::Reject(cause.clone()));
        self.open.resolve(Err(cause.clone()));
        self.teardown(Some(cause));
    }

    fn on_message(&self, batch: Vec<Bytes>) {
        let decoded = if batch.is_empty() {
            self.codec
                .empty()
                .map(|item| vec![item])
                .ok_or_else(|| CodecError::Decode("codec has no empty payload".into()))
        } else {
            batch
                .into_iter()
                .map(|bytes| self.codec.decode(bytes))
                .collect::<std::result::Result<Vec<_>, _>>()
        };

        let items = match decoded {
            Ok(items) => items,
            Err(e) => {
                self.fail(Error::Transport(format!("undecodable message: {}", e)));
                return;
            }
        };

        {
            let mut shared = self.lock();
            if shared.remote_ended
                || matches!(shared.state, StreamState::Rejected | StreamState::Destroyed)
            {
                return;
            }

            shared.inbound.extend(items);

            if !shared.corked && shared.inbound.len() > self.read_high_water_mark {
                if let Some(channel) = &shared.channel {
                    channel.cork();
                }
                shared.corked = true;
                tracing::debug!(
                    protocol = %self.protocol,
                    buffered = shared.inbound.len(),
                    "Inbound corked"
                );
            }
        }

        self.changed.notify_waiters();
    }

    fn on_drained(&self) {
        self.lock().awaiting_drain = false;
        self.changed.notify_waiters();
    }

    fn on_closed(&self) {
        let finished = {
            let mut shared = self.lock();
            if shared.state.is_destroyed() || shared.remote_ended {
                return;
            }
            shared.remote_ended = true;
            let next = shared.state.settle(shared.local_ended, true);
            self.set_state(&mut shared, next);
            shared.local_ended && shared.inbound.is_empty()
        };

        tracing::debug!(protocol = %self.protocol, id = ?self.id, "Remote closed stream");
        // Closing before the handshake completed is not a failure
        self.open.resolve(Ok(()));
        self.changed.notify_waiters();

        if finished {
            self.teardown(None);
        }
    }

    fn on_destroyed(&self) {
        let finished = {
            let mut shared = self.lock();
            if shared.state.is_destroyed() {
                return;
            }
            shared.remote_ended = true;
            shared.local_ended = true;
            shared.severed = true;
            shared.awaiting_drain = false;
            let next = shared.state.settle(true, true);
            self.set_state(&mut shared, next);
            shared.inbound.is_empty()
        };

        tracing::debug!(protocol = %self.protocol, id = ?self.id, "Channel destroyed by peer");
        self.open.resolve(Err(Error::Destroyed));
        self.changed.notify_waiters();

        if finished {
            self.teardown(None);
        }
    }

    /// Transport fault: report, close the channel and destroy the stream
    fn fail(&self, error: Error) {
        {
            let shared = self.lock();
            if shared.state.is_destroyed() {
                return;
            }
            if let Some(channel) = &shared.channel {
                channel.close();
            }
        }

        tracing::warn!(
            protocol = %self.protocol,
            id = ?self.id,
            error = %error,
            "Stream transport fault"
        );
        self.emit(StreamEvent::Error(error.clone()));
        self.open.resolve(Err(error.clone()));
        self.teardown(Some(error));
    }

    /// Move to `Destroyed`, release the channel and wake everyone
    ///
    /// With `failure` set, buffered inbound data is dropped and later reads
    /// report it; without, the stream ended gracefully.
    fn teardown(&self, failure: Option<Error>) {
        let channel = {
            let mut shared = self.lock();
            if shared.state.is_destroyed() {
                return;
            }
            if let Some(error) = failure {
                shared.failure.get_or_insert(error);
                shared.inbound.clear();
            }
            shared.awaiting_drain = false;
            self.set_state(&mut shared, StreamState::Destroyed);
            shared.channel.take()
        };

        if let Some(channel) = channel {
            channel.destroy();
        }
        self.open.resolve(Err(Error::Destroyed));

        tracing::debug!(protocol = %self.protocol, id = ?self.id, "Stream destroyed");
        self.changed.notify_waiters();
        self.emit(StreamEvent::Close);
    }
}

/// What woke the driver
enum Step {
    Event(Option<ChannelEvent>),
    Verdict(std::result::Result<bool, BoxError>),
}

/// Poll the running admission predicate, or never resolve without one
async fn admit(admission: &mut Option<HandshakeFuture>) -> std::result::Result<bool, BoxError> {
    match admission {
        Some(predicate) => predicate.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Consume channel events until the stream is destroyed
///
/// The admission predicate is polled alongside the event queue so a peer
/// close or destroy is handled while it is still deciding.
async fn drive<C: Codec, H: Codec>(inner: Arc<Inner<C, H>>, mut events: ChannelEvents) {
    let mut state_rx = inner.state_tx.subscribe();
    let mut admission: Option<HandshakeFuture> = None;
    let mut candidate: Option<H::Item> = None;

    loop {
        let step = tokio::select! {
            event = events.recv() => Step::Event(event),
            verdict = admit(&mut admission) => Step::Verdict(verdict),
            _ = state_rx.wait_for(|state| state.is_destroyed()) => break,
        };

        let event = match step {
            Step::Verdict(verdict) => {
                admission = None;
                if let Some(remote) = candidate.take() {
                    inner.on_verdict(remote, verdict);
                }
                continue;
            }
            Step::Event(event) => event,
        };

        // The peer ending first makes the verdict moot
        if matches!(
            event,
            Some(ChannelEvent::Closed | ChannelEvent::Destroyed) | None
        ) && admission.take().is_some()
        {
            candidate = None;
            tracing::debug!(protocol = %inner.protocol, id = ?inner.id, "Handshake abandoned");
        }

        match event {
            Some(ChannelEvent::Opened(payload)) => {
                if let Some((predicate, remote)) = inner.on_opened(payload) {
                    admission = Some(predicate);
                    candidate = Some(remote);
                }
            }
            Some(ChannelEvent::Message(batch)) => inner.on_message(batch),
            Some(ChannelEvent::Drained) => inner.on_drained(),
            Some(ChannelEvent::Closed) => inner.on_closed(),
            Some(ChannelEvent::Destroyed) => inner.on_destroyed(),
            None => {
                // Multiplexer dropped the channel without saying so
                inner.on_destroyed();
                break;
            }
        }
    }

    if admission.is_some() {
        tracing::debug!(protocol = %inner.protocol, id = ?inner.id, "Handshake abandoned");
    }
}

/// Bidirectional, flow-controlled stream over one logical channel
///
/// Generic over the message codec `C` and the handshake codec `H`; both
/// default to [`Raw`] bytes.
pub struct VirtualStream<C: Codec = Raw, H: Codec = Raw> {
    inner: Arc<Inner<C, H>>,
}

impl<C: Codec, H: Codec> VirtualStream<C, H> {
    /// Create the channel, send the local handshake and start driving events
    ///
    /// Returns immediately with a `Pending` stream. Must be called within a
    /// Tokio runtime.
    pub fn new<M>(mux: &M, config: StreamConfig<C, H>) -> Result<Self>
    where
        M: ChannelMux + ?Sized,
    {
        if mux.is_destroyed() {
            return Err(MuxError::TransportDestroyed.into());
        }

        let handshake = match &config.handshake {
            Some(handshake) => config.handshake_codec.encode(handshake)?,
            None => Bytes::new(),
        };

        let (channel, events) = mux.create_channel(ChannelOptions {
            protocol: config.protocol.clone(),
            id: config.id.clone(),
            unique: config.unique,
        })?;
        channel.open(handshake)?;

        let (state_tx, _) = watch::channel(StreamState::Pending);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            protocol: config.protocol,
            id: config.id,
            codec: config.codec,
            handshake_codec: config.handshake_codec,
            on_handshake: config.on_handshake,
            read_high_water_mark: config.read_high_water_mark,
            read_low_water_mark: config.read_low_water_mark,
            user_data: config.user_data,
            shared: Mutex::new(Shared {
                state: StreamState::Pending,
                channel: Some(channel),
                inbound: VecDeque::new(),
                remote_handshake: None,
                local_ended: false,
                remote_ended: false,
                severed: false,
                corked: false,
                awaiting_drain: false,
                failure: None,
            }),
            changed: Notify::new(),
            write_queue: tokio::sync::Mutex::new(()),
            open: OpenLatch::new(),
            state_tx,
            events: events_tx,
        });

        tracing::debug!(protocol = %inner.protocol, id = ?inner.id, "Stream created");
        tokio::spawn(drive(Arc::clone(&inner), events));

        Ok(Self { inner })
    }

    /// Protocol name
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// Stream id, empty when absent
    pub fn id(&self) -> &Bytes {
        &self.inner.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        *self.inner.state_tx.borrow()
    }

    /// Check if the stream reached its terminal state
    pub fn is_destroyed(&self) -> bool {
        self.state().is_destroyed()
    }

    /// Admitted remote handshake, if any
    pub fn remote_handshake(&self) -> Option<H::Item> {
        self.inner.lock().remote_handshake.clone()
    }

    /// Application value attached through the options, if it is a `T`
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.user_data.clone()?.downcast::<T>().ok()
    }

    /// Inbound payloads buffered and not yet read
    pub fn buffered(&self) -> usize {
        self.inner.lock().inbound.len()
    }

    /// Subscribe to stream notifications
    ///
    /// Only notifications raised after subscribing are received.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for the handshake outcome
    ///
    /// Resolves `Ok` once admitted (or if the peer closed before the
    /// handshake completed), or with the rejection or destruction cause.
    pub async fn opened(&self) -> Result<()> {
        self.inner.open.wait().await
    }

    /// Wait until the stream is destroyed
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        let _ = state_rx.wait_for(|state| state.is_destroyed()).await;
    }

    /// Write one batch of values
    ///
    /// Waits for the handshake, then for any earlier write, then for drain
    /// if the channel reports its buffer saturated. An empty batch is sent
    /// as one explicit empty message, and fails with [`Error::Codec`] when
    /// the codec has no empty value.
    pub async fn write(&self, batch: Vec<C::Item>) -> Result<()> {
        let _turn = self.inner.write_queue.lock().await;
        self.inner.open.wait().await?;

        if batch.is_empty() && self.inner.codec.empty().is_none() {
            return Err(CodecError::Encode("codec has no empty payload".into()).into());
        }

        let encoded = batch
            .iter()
            .map(|item| self.inner.codec.encode(item))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let accepted = {
            let mut shared = self.inner.lock();
            if shared.state.is_destroyed() || shared.severed {
                return Err(Error::Destroyed);
            }
            if shared.local_ended {
                return Err(Error::WriteAfterClose);
            }
            let Some(channel) = shared.channel.as_ref() else {
                return Err(Error::Destroyed);
            };

            match channel.send(encoded) {
                Ok(accepted) => {
                    if !accepted {
                        shared.awaiting_drain = true;
                    }
                    accepted
                }
                Err(MuxError::ChannelClosed | MuxError::NotOpened) => {
                    return Err(Error::Destroyed);
                }
                Err(e) => {
                    drop(shared);
                    let error = Error::Transport(e.to_string());
                    self.inner.fail(error.clone());
                    return Err(error);
                }
            }
        };

        if !accepted {
            self.wait_drain().await?;
        }
        Ok(())
    }

    /// Write a single value
    pub async fn write_one(&self, item: C::Item) -> Result<()> {
        self.write(vec![item]).await
    }

    async fn wait_drain(&self) -> Result<()> {
        loop {
            let notified = self.inner.changed.notified();
            {
                let shared = self.inner.lock();
                if shared.state.is_destroyed() || shared.severed {
                    return Err(Error::Destroyed);
                }
                if !shared.awaiting_drain {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Read the next payload
    ///
    /// Returns `Ok(None)` at end-of-input, after every buffered payload has
    /// been read.
    pub async fn read(&self) -> Result<Option<C::Item>> {
        loop {
            let notified = self.inner.changed.notified();
            {
                let mut shared = self.inner.lock();

                if let Some(item) = shared.inbound.pop_front() {
                    if shared.corked && shared.inbound.len() <= self.inner.read_low_water_mark {
                        if let Some(channel) = &shared.channel {
                            channel.uncork();
                        }
                        shared.corked = false;
                    }
                    let finished =
                        shared.local_ended && shared.remote_ended && shared.inbound.is_empty();
                    drop(shared);

                    if finished {
                        self.inner.teardown(None);
                    }
                    return Ok(Some(item));
                }

                if shared.remote_ended && shared.failure.is_none() {
                    return Ok(None);
                }
                if shared.state.is_destroyed() {
                    return Err(shared.failure.clone().unwrap_or(Error::Destroyed));
                }
            }
            notified.await;
        }
    }

    /// Close the write side once earlier writes are handed off
    ///
    /// Already received data stays readable.
    pub async fn close(&self) -> Result<()> {
        let _turn = self.inner.write_queue.lock().await;
        self.inner.open.wait().await?;

        let finished = {
            let mut shared = self.inner.lock();
            if shared.state.is_destroyed() || shared.local_ended {
                return Ok(());
            }
            shared.local_ended = true;
            let next = shared.state.settle(true, shared.remote_ended);
            self.inner.set_state(&mut shared, next);
            if let Some(channel) = &shared.channel {
                channel.close();
            }
            shared.remote_ended && shared.inbound.is_empty()
        };

        tracing::debug!(
            protocol = %self.inner.protocol,
            id = ?self.inner.id,
            "Stream closed for writing"
        );

        if finished {
            self.inner.teardown(None);
        }
        Ok(())
    }

    /// Tear the stream down immediately
    ///
    /// Suspended reads, writes and handshake waits fail with
    /// [`Error::Destroyed`]. Destroying twice is a no-op.
    pub fn destroy(&self) {
        self.inner.teardown(Some(Error::Destroyed));
    }
}

impl<C: Codec, H: Codec> Clone for VirtualStream<C, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec, H: Codec> fmt::Debug for VirtualStream<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualStream")
            .field("protocol", &self.inner.protocol)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::Utf8;
    use crate::mux::{MemoryMux, MemoryMuxConfig};
    use crate::stream::config::StreamOptions;

    fn raw() -> StreamOptions {
        StreamOptions::new()
    }

    /// Yield until `check` holds, failing after a bounded number of turns
    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    /// Open a client on `a` and answer it with a server on `b`
    async fn open_pair<C1, H1, C2, H2>(
        mux_config: MemoryMuxConfig,
        client: StreamOptions<C1, H1>,
        server: StreamOptions<C2, H2>,
    ) -> (VirtualStream<C1, H1>, VirtualStream<C2, H2>, MemoryMux, MemoryMux)
    where
        C1: Codec + Default,
        H1: Codec + Default,
        C2: Codec + Default,
        H2: Codec + Default,
    {
        let (a, b) = MemoryMux::pair_with_config(mux_config);
        let server = server.resolve().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.pair(&server.protocol, &server.id, tx);

        let client = VirtualStream::new(&a, client.resolve().unwrap()).unwrap();
        rx.recv().await.unwrap();
        let server = VirtualStream::new(&b, server).unwrap();

        (client, server, a, b)
    }

    #[tokio::test]
    async fn test_open_write_close_read() {
        let (client, server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), raw()).await;

        assert_eq!(client.state(), StreamState::Pending);
        client.opened().await.unwrap();
        server.opened().await.unwrap();
        assert_eq!(client.state(), StreamState::Open);

        client
            .write_one(Bytes::from_static(b"Hello, World!"))
            .await
            .unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), StreamState::Closing);

        assert_eq!(
            server.read().await.unwrap(),
            Some(Bytes::from_static(b"Hello, World!"))
        );
        assert_eq!(server.read().await.unwrap(), None);
        assert_eq!(server.read().await.unwrap(), None);

        // Server still writes after the client's half-close
        server.write_one(Bytes::from_static(b"bye")).await.unwrap();
        assert_eq!(
            client.read().await.unwrap(),
            Some(Bytes::from_static(b"bye"))
        );

        server.close().await.unwrap();
        assert_eq!(client.read().await.unwrap(), None);
        server.closed().await;
        client.closed().await;
    }

    #[tokio::test]
    async fn test_empty_write_arrives_as_one_empty_payload() {
        let (client, server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), raw()).await;

        client.write(vec![]).await.unwrap();
        client.close().await.unwrap();

        assert_eq!(server.read().await.unwrap(), Some(Bytes::new()));
        assert_eq!(server.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_before_open_waits_for_handshake() {
        let (a, b) = MemoryMux::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.pair(crate::stream::DEFAULT_PROTOCOL, &Bytes::new(), tx);

        let client = VirtualStream::new(&a, raw().resolve().unwrap()).unwrap();
        let write = tokio::spawn({
            let client = client.clone();
            async move { client.write_one(Bytes::from_static(b"early")).await }
        });

        rx.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert!(!write.is_finished());

        let server = VirtualStream::new(&b, raw().resolve().unwrap()).unwrap();
        write.await.unwrap().unwrap();
        assert_eq!(
            server.read().await.unwrap(),
            Some(Bytes::from_static(b"early"))
        );
    }

    #[tokio::test]
    async fn test_reject_fires_reject_not_error() {
        let server_opts = raw().on_handshake(|_| async { Ok(false) });
        let (client, server, a, b) =
            open_pair(MemoryMuxConfig::default(), raw(), server_opts).await;
        let mut events = server.subscribe();

        let outcome = server.opened().await;
        assert!(matches!(outcome, Err(Error::Rejected(_))));
        server.closed().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(StreamEvent::Reject(e)) if e.to_string().contains("rejected")));
        assert_eq!(seen.last(), Some(&StreamEvent::Close));
        assert!(!seen.iter().any(|e| matches!(e, StreamEvent::Error(_))));

        client.closed().await;
        assert!(client.is_destroyed());
        assert!(matches!(server.read().await, Err(Error::Rejected(_))));

        assert!(!a.is_destroyed());
        assert!(!b.is_destroyed());
        assert_eq!(a.channel_count(), 0);
        assert_eq!(b.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_predicate_failure_is_rejection() {
        let server_opts = raw().on_handshake(|_| async {
            Err::<bool, BoxError>("directory unavailable".into())
        });
        let (_client, server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), server_opts).await;

        match server.opened().await {
            Err(Error::Handshake(reason)) => assert!(reason.contains("directory unavailable")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_handshake_is_recorded() {
        let client_opts = StreamOptions::<Raw, Utf8>::new().handshake("token-1".to_string());
        let server_opts = StreamOptions::<Raw, Utf8>::new()
            .handshake("server".to_string())
            .on_handshake(|token: String| async move { Ok(token.starts_with("token-")) });

        let (client, server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), client_opts, server_opts).await;

        server.opened().await.unwrap();
        client.opened().await.unwrap();
        assert_eq!(server.remote_handshake().as_deref(), Some("token-1"));
        assert_eq!(client.remote_handshake().as_deref(), Some("server"));
    }

    #[tokio::test]
    async fn test_backpressure_suspends_writer_until_drain() {
        let mux_config = MemoryMuxConfig::default().buffer_capacity(4);
        let server_opts = raw().read_high_water_mark(1);
        let (client, server, _a, _b) = open_pair(mux_config, raw(), server_opts).await;

        client.write_one(Bytes::from_static(b"x")).await.unwrap();
        client.write_one(Bytes::from_static(b"y")).await.unwrap();
        eventually(|| server.buffered() == 2).await;

        let write = tokio::spawn({
            let client = client.clone();
            async move { client.write_one(Bytes::from_static(b"abcdef")).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!write.is_finished());

        // Still above the low water mark after one read
        assert_eq!(server.read().await.unwrap(), Some(Bytes::from_static(b"x")));
        assert_eq!(server.read().await.unwrap(), Some(Bytes::from_static(b"y")));
        write.await.unwrap().unwrap();
        assert_eq!(
            server.read().await.unwrap(),
            Some(Bytes::from_static(b"abcdef"))
        );
    }

    #[tokio::test]
    async fn test_cork_only_above_high_water_mark() {
        let mux_config = MemoryMuxConfig::default().buffer_capacity(1);
        let server_opts = raw().read_high_water_mark(2);
        let (client, server, _a, _b) = open_pair(mux_config, raw(), server_opts).await;

        client.write_one(Bytes::from_static(b"a")).await.unwrap();
        client.write_one(Bytes::from_static(b"b")).await.unwrap();
        eventually(|| server.buffered() == 2).await;

        // Sitting at the mark leaves the channel open
        client.write_one(Bytes::from_static(b"c")).await.unwrap();
        eventually(|| server.buffered() == 3).await;

        let mut write = tokio_test::task::spawn(client.write_one(Bytes::from_static(b"dd")));
        tokio_test::assert_pending!(write.poll());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio_test::assert_pending!(write.poll());
        assert_eq!(server.buffered(), 3);
    }

    #[tokio::test]
    async fn test_destroy_unblocks_suspended_write() {
        let mux_config = MemoryMuxConfig::default().buffer_capacity(1);
        let server_opts = raw().read_high_water_mark(1);
        let (client, server, _a, _b) = open_pair(mux_config, raw(), server_opts).await;

        client.write_one(Bytes::from_static(b"x")).await.unwrap();
        client.write_one(Bytes::from_static(b"y")).await.unwrap();
        eventually(|| server.buffered() == 2).await;

        let write = tokio::spawn({
            let client = client.clone();
            async move { client.write_one(Bytes::from_static(b"stuck")).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!write.is_finished());

        client.destroy();
        assert_eq!(write.await.unwrap(), Err(Error::Destroyed));
        assert_eq!(
            client.write_one(Bytes::new()).await,
            Err(Error::Destroyed)
        );
    }

    #[tokio::test]
    async fn test_peer_destroy_during_admission() {
        let server_opts =
            raw().on_handshake(|_| std::future::pending::<std::result::Result<bool, BoxError>>());
        let (client, server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), server_opts).await;
        let mut events = server.subscribe();

        client.opened().await.unwrap();
        client.destroy();

        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .expect("stream stuck behind its admission predicate");
        assert_eq!(server.state(), StreamState::Destroyed);
        assert_eq!(server.opened().await, Err(Error::Destroyed));
        assert!(server.remote_handshake().is_none());

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, StreamEvent::Reject(_) | StreamEvent::Error(_)));
        }
    }

    #[tokio::test]
    async fn test_user_data_is_attached() {
        let (client, server, _a, _b) = open_pair(
            MemoryMuxConfig::default(),
            raw().user_data(String::from("session-1")),
            raw(),
        )
        .await;

        assert_eq!(
            client.user_data::<String>().as_deref().map(String::as_str),
            Some("session-1")
        );
        assert!(client.user_data::<u32>().is_none());
        assert!(server.user_data::<String>().is_none());
    }

    #[tokio::test]
    async fn test_destroy_unblocks_pending_read() {
        let (_client, server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), raw()).await;
        server.opened().await.unwrap();

        let mut read = tokio_test::task::spawn(server.read());
        tokio_test::assert_pending!(read.poll());

        server.destroy();
        server.destroy();
        assert!(read.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(read.poll()),
            Err(Error::Destroyed)
        );
    }

    #[tokio::test]
    async fn test_destroy_before_open_resolves_destroyed() {
        let (a, b) = MemoryMux::pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        b.pair(crate::stream::DEFAULT_PROTOCOL, &Bytes::new(), tx);

        let client = VirtualStream::new(&a, raw().resolve().unwrap()).unwrap();
        client.destroy();

        assert_eq!(client.opened().await, Err(Error::Destroyed));
        assert_eq!(client.read().await, Err(Error::Destroyed));
    }

    #[tokio::test]
    async fn test_peer_destroy_keeps_buffered_data() {
        let (client, server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), raw()).await;

        client.write_one(Bytes::from_static(b"one")).await.unwrap();
        client.write_one(Bytes::from_static(b"two")).await.unwrap();
        client.destroy();

        assert_eq!(server.read().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(server.read().await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(server.read().await.unwrap(), None);
        server.closed().await;
        assert!(matches!(
            server.write_one(Bytes::new()).await,
            Err(Error::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_write_after_close() {
        let (client, _server, _a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), raw()).await;

        client.close().await.unwrap();
        assert_eq!(
            client.write_one(Bytes::from_static(b"late")).await,
            Err(Error::WriteAfterClose)
        );
    }

    #[tokio::test]
    async fn test_undecodable_message_is_transport_fault() {
        let server_opts = StreamOptions::<Utf8, Raw>::new();
        let (client, server, a, _b) =
            open_pair(MemoryMuxConfig::default(), raw(), server_opts).await;
        let mut events = server.subscribe();

        client
            .write_one(Bytes::from_static(&[0xff, 0xfe]))
            .await
            .unwrap();
        server.closed().await;

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let StreamEvent::Error(Error::Transport(_)) = event {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(matches!(server.read().await, Err(Error::Transport(_))));

        // Client sees the stream end, the transport survives
        assert_eq!(client.read().await.unwrap(), None);
        assert!(!a.is_destroyed());
    }

    #[tokio::test]
    async fn test_construction_on_destroyed_transport_fails() {
        let (a, _b) = MemoryMux::pair();
        a.destroy();

        let result = VirtualStream::new(&a, raw().resolve().unwrap());
        assert!(matches!(
            result,
            Err(Error::Mux(MuxError::TransportDestroyed))
        ));
    }
}
