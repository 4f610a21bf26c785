//! In-process channel multiplexer
//!
//! [`MemoryMux::pair`] returns two connected endpoints sharing one simulated
//! physical link. All dispatch happens synchronously under the link lock, so
//! per-channel ordering is exact and events land on each channel's queue in
//! the order they were produced.
//!
//! Flow control follows the receiver: a corked channel holds inbound
//! batches, and the bytes it holds count against the sender's outbound
//! buffer. Once that exceeds `buffer_capacity`, `send` returns `false` until
//! the receiver uncorks and a `Drained` event is raised on the sender.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Channel, ChannelEvent, ChannelEvents, ChannelMux, ChannelOptions, PairRequest};
use crate::error::MuxError;

/// Default outbound buffer capacity per channel (64KB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Configuration for an in-memory link
#[derive(Debug, Clone)]
pub struct MemoryMuxConfig {
    /// Bytes a channel may have held by a corked peer before `send` reports saturation
    pub buffer_capacity: usize,
}

impl Default for MemoryMuxConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl MemoryMuxConfig {
    /// Set the outbound buffer capacity
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes.max(1);
        self
    }
}

type ChannelKey = (String, Bytes);

/// Inbound item held while a channel is corked
enum Held {
    Message(Vec<Bytes>, usize),
    Closed,
}

/// An open request from the peer waiting for a local channel
struct RemoteOpen {
    remote: u32,
    handshake: Bytes,
}

struct Slot {
    key: ChannelKey,
    events: mpsc::UnboundedSender<ChannelEvent>,
    /// Peer channel number once known
    remote: Option<u32>,
    /// Peer handshake received before we opened
    remote_handshake: Option<Bytes>,
    local_opened: bool,
    opened: bool,
    local_closed: bool,
    remote_closed: bool,
    corked: bool,
    held: VecDeque<Held>,
    /// Bytes we sent that the peer is still holding
    in_flight: usize,
    saturated: bool,
}

impl Slot {
    fn new(key: ChannelKey, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            key,
            events,
            remote: None,
            remote_handshake: None,
            local_opened: false,
            opened: false,
            local_closed: false,
            remote_closed: false,
            corked: false,
            held: VecDeque::new(),
            in_flight: 0,
            saturated: false,
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // Receiver gone means the stream already let go of the channel
        let _ = self.events.send(event);
    }

    fn is_finished(&self) -> bool {
        self.local_closed && self.remote_closed
    }
}

#[derive(Default)]
struct End {
    next_channel: u32,
    channels: HashMap<u32, Slot>,
    pending_opens: HashMap<ChannelKey, VecDeque<RemoteOpen>>,
    pairs: HashMap<ChannelKey, mpsc::UnboundedSender<PairRequest>>,
}

impl End {
    /// Refuse a peer channel that can never be answered
    fn reject(&mut self, number: u32) {
        if let Some(slot) = self.channels.remove(&number) {
            slot.emit(ChannelEvent::Closed);
            slot.emit(ChannelEvent::Destroyed);
        }
    }

    fn forget_pending(&mut self, remote: u32) {
        self.pending_opens.retain(|_, queue| {
            queue.retain(|open| open.remote != remote);
            !queue.is_empty()
        });
    }

    /// Deliver everything held regardless of cork, returning the bytes freed
    fn flush_held(&mut self, number: u32) -> usize {
        let Some(slot) = self.channels.get_mut(&number) else {
            return 0;
        };

        let mut freed = 0;
        while let Some(item) = slot.held.pop_front() {
            match item {
                Held::Message(batch, size) => {
                    freed += size;
                    slot.emit(ChannelEvent::Message(batch));
                }
                Held::Closed => {
                    slot.remote_closed = true;
                    slot.emit(ChannelEvent::Closed);
                }
            }
        }
        freed
    }
}

struct Link {
    config: MemoryMuxConfig,
    destroyed: bool,
    ends: [End; 2],
}

impl Link {
    fn split(&mut self, side: usize) -> (&mut End, &mut End) {
        let [a, b] = &mut self.ends;
        if side == 0 {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn create_channel(
        &mut self,
        side: usize,
        options: ChannelOptions,
    ) -> Result<(u32, ChannelEvents), MuxError> {
        if self.destroyed {
            return Err(MuxError::TransportDestroyed);
        }

        let key: ChannelKey = (options.protocol, options.id);
        let end = &mut self.ends[side];

        if options.unique && end.channels.values().any(|slot| slot.key == key) {
            return Err(MuxError::DuplicateChannel {
                protocol: key.0.clone(),
            });
        }

        let number = end.next_channel;
        end.next_channel += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = Slot::new(key.clone(), tx);

        // Answer the oldest waiting remote open for this key
        if let Some(queue) = end.pending_opens.get_mut(&key) {
            if let Some(open) = queue.pop_front() {
                slot.remote = Some(open.remote);
                slot.remote_handshake = Some(open.handshake);
            }
            if queue.is_empty() {
                end.pending_opens.remove(&key);
            }
        }

        end.channels.insert(number, slot);
        Ok((number, rx))
    }

    fn open(&mut self, side: usize, number: u32, handshake: Bytes) -> Result<(), MuxError> {
        if self.destroyed {
            return Err(MuxError::TransportDestroyed);
        }

        let (local, peer) = self.split(side);
        let slot = local
            .channels
            .get_mut(&number)
            .ok_or(MuxError::ChannelClosed)?;
        if slot.local_opened {
            return Ok(());
        }
        slot.local_opened = true;

        if let Some(remote) = slot.remote {
            let Some(peer_slot) = peer.channels.get_mut(&remote) else {
                local.reject(number);
                return Ok(());
            };

            let remote_handshake = slot.remote_handshake.take().unwrap_or_default();
            slot.opened = true;
            slot.emit(ChannelEvent::Opened(remote_handshake));

            peer_slot.remote = Some(number);
            peer_slot.opened = true;
            peer_slot.emit(ChannelEvent::Opened(handshake));
            return Ok(());
        }

        let key = slot.key.clone();
        if let Some(notify) = peer.pairs.get(&key) {
            let request = PairRequest {
                protocol: key.0.clone(),
                id: key.1.clone(),
            };
            if notify.send(request).is_ok() {
                peer.pending_opens
                    .entry(key)
                    .or_default()
                    .push_back(RemoteOpen {
                        remote: number,
                        handshake,
                    });
                return Ok(());
            }
            peer.pairs.remove(&key);
        }

        tracing::debug!(
            protocol = %key.0,
            id = ?key.1,
            "No listener for channel, rejecting"
        );
        local.reject(number);
        Ok(())
    }

    fn send(&mut self, side: usize, number: u32, batch: Vec<Bytes>) -> Result<bool, MuxError> {
        if self.destroyed {
            return Err(MuxError::TransportDestroyed);
        }

        let capacity = self.config.buffer_capacity;
        let (local, peer) = self.split(side);

        let slot = local
            .channels
            .get_mut(&number)
            .ok_or(MuxError::ChannelClosed)?;
        if slot.local_closed {
            return Err(MuxError::ChannelClosed);
        }
        if !slot.opened {
            return Err(MuxError::NotOpened);
        }
        let peer_slot = slot
            .remote
            .and_then(|remote| peer.channels.get_mut(&remote))
            .ok_or(MuxError::ChannelClosed)?;

        // Empty batches still occupy the wire
        let size = batch.iter().map(Bytes::len).sum::<usize>().max(1);

        if peer_slot.corked || !peer_slot.held.is_empty() {
            peer_slot.held.push_back(Held::Message(batch, size));
            slot.in_flight += size;
            if slot.in_flight > capacity {
                slot.saturated = true;
            }
            return Ok(!slot.saturated);
        }

        peer_slot.emit(ChannelEvent::Message(batch));
        Ok(true)
    }

    fn close(&mut self, side: usize, number: u32) {
        let (local, peer) = self.split(side);
        let Some(slot) = local.channels.get_mut(&number) else {
            return;
        };
        if slot.local_closed {
            return;
        }
        slot.local_closed = true;

        if !slot.opened {
            if let Some(slot) = local.channels.remove(&number) {
                Self::abort_unpaired(peer, number, &slot);
            }
            return;
        }

        if let Some(remote) = slot.remote {
            if let Some(peer_slot) = peer.channels.get_mut(&remote) {
                if peer_slot.corked || !peer_slot.held.is_empty() {
                    peer_slot.held.push_back(Held::Closed);
                } else {
                    peer_slot.remote_closed = true;
                    peer_slot.emit(ChannelEvent::Closed);
                    if peer_slot.is_finished() {
                        peer.channels.remove(&remote);
                    }
                }
            }
        }

        if slot.is_finished() {
            local.channels.remove(&number);
        }
    }

    fn destroy(&mut self, side: usize, number: u32) {
        let (local, peer) = self.split(side);
        let Some(slot) = local.channels.remove(&number) else {
            return;
        };

        if !slot.opened {
            Self::abort_unpaired(peer, number, &slot);
            return;
        }

        if let Some(remote) = slot.remote {
            peer.flush_held(remote);
            if let Some(peer_slot) = peer.channels.get_mut(&remote) {
                peer_slot.remote = None;
                peer_slot.emit(ChannelEvent::Destroyed);
            }
        }
    }

    /// Withdraw a channel that never finished opening
    fn abort_unpaired(peer: &mut End, number: u32, slot: &Slot) {
        peer.forget_pending(number);
        if let Some(remote) = slot.remote {
            peer.reject(remote);
        }
    }

    fn cork(&mut self, side: usize, number: u32) {
        if let Some(slot) = self.ends[side].channels.get_mut(&number) {
            slot.corked = true;
        }
    }

    fn uncork(&mut self, side: usize, number: u32) {
        let capacity = self.config.buffer_capacity;
        let (local, peer) = self.split(side);

        let Some(slot) = local.channels.get_mut(&number) else {
            return;
        };
        slot.corked = false;
        let remote = slot.remote;

        let freed = local.flush_held(number);

        if let Some(sender) = remote.and_then(|remote| peer.channels.get_mut(&remote)) {
            sender.in_flight = sender.in_flight.saturating_sub(freed);
            if sender.saturated && sender.in_flight <= capacity {
                sender.saturated = false;
                sender.emit(ChannelEvent::Drained);
            }
        }

        if local.channels.get(&number).is_some_and(Slot::is_finished) {
            local.channels.remove(&number);
        }
    }

    fn is_opened(&self, side: usize, number: u32) -> bool {
        self.ends[side]
            .channels
            .get(&number)
            .is_some_and(|slot| slot.opened)
    }

    fn destroy_transport(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        for end in &mut self.ends {
            for (_, slot) in end.channels.drain() {
                slot.emit(ChannelEvent::Destroyed);
            }
            end.pending_opens.clear();
            end.pairs.clear();
        }
    }
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One endpoint of an in-memory link
#[derive(Clone)]
pub struct MemoryMux {
    link: Arc<Mutex<Link>>,
    side: usize,
}

impl MemoryMux {
    /// Create two connected endpoints with default configuration
    pub fn pair() -> (Self, Self) {
        Self::pair_with_config(MemoryMuxConfig::default())
    }

    /// Create two connected endpoints
    pub fn pair_with_config(config: MemoryMuxConfig) -> (Self, Self) {
        let link = Arc::new(Mutex::new(Link {
            config,
            destroyed: false,
            ends: [End::default(), End::default()],
        }));

        (
            Self {
                link: Arc::clone(&link),
                side: 0,
            },
            Self { link, side: 1 },
        )
    }

    /// Tear down the physical link, destroying every channel on both sides
    pub fn destroy(&self) {
        tracing::debug!("Memory transport destroyed");
        lock(&self.link).destroy_transport();
    }

    /// Number of live channels on this endpoint
    pub fn channel_count(&self) -> usize {
        lock(&self.link).ends[self.side].channels.len()
    }
}

impl std::fmt::Debug for MemoryMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMux")
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}

impl ChannelMux for MemoryMux {
    fn create_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<(Box<dyn Channel>, ChannelEvents), MuxError> {
        let (number, events) = lock(&self.link).create_channel(self.side, options)?;
        let channel = MemoryChannel {
            link: Arc::clone(&self.link),
            side: self.side,
            number,
        };
        Ok((Box::new(channel), events))
    }

    fn pair(&self, protocol: &str, id: &Bytes, notify: mpsc::UnboundedSender<PairRequest>) {
        let mut link = lock(&self.link);
        if link.destroyed {
            return;
        }
        link.ends[self.side]
            .pairs
            .insert((protocol.to_string(), id.clone()), notify);
    }

    fn unpair(&self, protocol: &str, id: &Bytes) {
        lock(&self.link).ends[self.side]
            .pairs
            .remove(&(protocol.to_string(), id.clone()));
    }

    fn is_destroyed(&self) -> bool {
        lock(&self.link).destroyed
    }
}

/// Channel handle into a [`MemoryMux`]; dropping it destroys the channel
struct MemoryChannel {
    link: Arc<Mutex<Link>>,
    side: usize,
    number: u32,
}

impl Channel for MemoryChannel {
    fn open(&self, handshake: Bytes) -> Result<(), MuxError> {
        lock(&self.link).open(self.side, self.number, handshake)
    }

    fn send(&self, batch: Vec<Bytes>) -> Result<bool, MuxError> {
        lock(&self.link).send(self.side, self.number, batch)
    }

    fn close(&self) {
        lock(&self.link).close(self.side, self.number);
    }

    fn destroy(&self) {
        lock(&self.link).destroy(self.side, self.number);
    }

    fn cork(&self) {
        lock(&self.link).cork(self.side, self.number);
    }

    fn uncork(&self) {
        lock(&self.link).uncork(self.side, self.number);
    }

    fn is_opened(&self) -> bool {
        lock(&self.link).is_opened(self.side, self.number)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        lock(&self.link).destroy(self.side, self.number);
    }
}
