//! In-process publish/subscribe bus.
//!
//! Writers and readers that name the same channel are matched with each
//! other. Every reader owns a delivery thread fed by a crossbeam channel, so
//! listeners run off the writer's thread exactly as they would on a real
//! transport. Loss and a fixed one-way delay can be injected to exercise the
//! engines under imperfect conditions.

use super::{DataListener, DeliveryInfo, MatchListener, PacketReader, PacketWriter, Transport};
use crate::error::TransportError;
use crate::utils::MAX_PAYLOAD_SIZE;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Predicate deciding whether a payload is dropped in flight.
pub type DropFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Fault injection settings for the loopback bus
#[derive(Debug, Clone, Default)]
pub struct LoopbackConfig {
    /// Percentage of deliveries silently dropped, 0-100
    pub loss_percent: f64,
    /// One-way delay applied to every delivery
    pub delay: Duration,
    /// Seed for the loss generator; entropy when unset
    pub seed: Option<u64>,
}

struct Envelope {
    payload: Vec<u8>,
    deliver_at: Instant,
    info: DeliveryInfo,
}

struct WriterSlot {
    match_listener: Mutex<Option<MatchListener>>,
}

struct ReaderSlot {
    sender: Mutex<Option<Sender<Envelope>>>,
    pending: AtomicU64,
    closed: AtomicBool,
    listener: Mutex<Option<DataListener>>,
    match_listener: Mutex<Option<MatchListener>>,
}

#[derive(Default)]
struct ChannelState {
    writers: HashMap<u64, Arc<WriterSlot>>,
    readers: HashMap<u64, Arc<ReaderSlot>>,
}

struct Bus {
    channels: Mutex<HashMap<String, ChannelState>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: LoopbackConfig,
    rng: Mutex<StdRng>,
    drop_filter: Mutex<Option<DropFilter>>,
}

impl Bus {
    /// Fire match listeners for every endpoint on `channel`.
    ///
    /// Listeners are collected under the lock and invoked after it is released
    /// so they may query the bus.
    fn notify_matches(&self, channel: &str) {
        let mut calls: Vec<(MatchListener, u32)> = Vec::new();
        {
            let channels = self.channels.lock();
            if let Some(state) = channels.get(channel) {
                let readers = state.readers.len() as u32;
                let writers = state.writers.len() as u32;
                for slot in state.writers.values() {
                    if let Some(listener) = slot.match_listener.lock().clone() {
                        calls.push((listener, readers));
                    }
                }
                for slot in state.readers.values() {
                    if let Some(listener) = slot.match_listener.lock().clone() {
                        calls.push((listener, writers));
                    }
                }
            }
        }
        for (listener, count) in calls {
            listener(count);
        }
    }

    fn should_drop(&self, payload: &[u8]) -> bool {
        if let Some(filter) = self.drop_filter.lock().clone() {
            if filter(payload) {
                return true;
            }
        }
        let loss = self.config.loss_percent.clamp(0.0, 100.0);
        loss > 0.0 && self.rng.lock().gen_bool(loss / 100.0)
    }

    fn readers_of(&self, channel: &str) -> Vec<Arc<ReaderSlot>> {
        self.channels
            .lock()
            .get(channel)
            .map(|state| state.readers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Matched status is unavailable once the bus is shut down.
    fn status(&self, channel: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::StatusUnavailable {
                channel: channel.to_string(),
            });
        }
        Ok(())
    }

    fn count(&self, channel: &str, writers: bool) -> u32 {
        self.channels
            .lock()
            .get(channel)
            .map(|state| {
                if writers {
                    state.writers.len() as u32
                } else {
                    state.readers.len() as u32
                }
            })
            .unwrap_or(0)
    }
}

/// In-process transport
#[derive(Clone)]
pub struct LoopbackTransport {
    bus: Arc<Bus>,
}

impl LoopbackTransport {
    pub fn new(config: LoopbackConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            bus: Arc::new(Bus {
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                config,
                rng: Mutex::new(rng),
                drop_filter: Mutex::new(None),
            }),
        }
    }

    /// Drop every payload for which `filter` returns true
    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.bus.drop_filter.lock() = Some(filter);
    }

    pub fn clear_drop_filter(&self) {
        *self.bus.drop_filter.lock() = None;
    }

    /// Reject further writes
    pub fn shutdown(&self) {
        self.bus.closed.store(true, Ordering::Release);
        debug!("Loopback transport shut down");
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn create_writer(&self, channel: &str) -> Result<Arc<dyn PacketWriter>, TransportError> {
        if self.bus.closed.load(Ordering::Acquire) {
            return Err(TransportError::EntityCreation {
                kind: "writer",
                channel: channel.to_string(),
            });
        }
        let id = self.bus.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(WriterSlot {
            match_listener: Mutex::new(None),
        });
        self.bus
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .writers
            .insert(id, slot);
        debug!("Loopback writer {} joined '{}'", id, channel);
        self.bus.notify_matches(channel);

        Ok(Arc::new(LoopbackWriter {
            id,
            channel: channel.to_string(),
            bus: Arc::clone(&self.bus),
        }))
    }

    fn create_reader(
        &self,
        channel: &str,
        listener: DataListener,
    ) -> Result<Arc<dyn PacketReader>, TransportError> {
        if self.bus.closed.load(Ordering::Acquire) {
            return Err(TransportError::EntityCreation {
                kind: "reader",
                channel: channel.to_string(),
            });
        }
        let id = self.bus.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded();
        let slot = Arc::new(ReaderSlot {
            sender: Mutex::new(Some(sender)),
            pending: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
            match_listener: Mutex::new(None),
        });

        let thread_slot = Arc::clone(&slot);
        std::thread::Builder::new()
            .name(format!("delivery-{}", channel))
            .spawn(move || delivery_loop(receiver, thread_slot))
            .map_err(|_| TransportError::EntityCreation {
                kind: "reader",
                channel: channel.to_string(),
            })?;

        self.bus
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .readers
            .insert(id, Arc::clone(&slot));
        debug!("Loopback reader {} joined '{}'", id, channel);
        self.bus.notify_matches(channel);

        Ok(Arc::new(LoopbackReader {
            id,
            channel: channel.to_string(),
            bus: Arc::clone(&self.bus),
            slot,
        }))
    }
}

fn delivery_loop(receiver: Receiver<Envelope>, slot: Arc<ReaderSlot>) {
    // Ends once the reader is dropped and takes the only sender with it.
    for envelope in receiver.iter() {
        let now = Instant::now();
        if envelope.deliver_at > now {
            std::thread::sleep(envelope.deliver_at - now);
        }
        if !slot.closed.load(Ordering::Acquire) {
            let listener = slot.listener.lock().clone();
            if let Some(listener) = listener {
                listener(&envelope.payload, &envelope.info);
            }
        }
        slot.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

struct LoopbackWriter {
    id: u64,
    channel: String,
    bus: Arc<Bus>,
}

impl PacketWriter for LoopbackWriter {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.bus.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::WriteFailed {
                channel: self.channel.clone(),
                reason: format!("{} bytes exceeds the {} byte limit", payload.len(), MAX_PAYLOAD_SIZE),
            });
        }
        let info = DeliveryInfo { valid_data: true };
        let deliver_at = Instant::now() + self.bus.config.delay;
        for reader in self.bus.readers_of(&self.channel) {
            if self.bus.should_drop(payload) {
                trace!("Loopback dropped {} bytes on '{}'", payload.len(), self.channel);
                continue;
            }
            reader.pending.fetch_add(1, Ordering::AcqRel);
            let envelope = Envelope {
                payload: payload.to_vec(),
                deliver_at,
                info,
            };
            let sent = match reader.sender.lock().as_ref() {
                Some(sender) => sender.send(envelope).is_ok(),
                None => false,
            };
            if !sent {
                reader.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    fn wait_for_acknowledgments(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            let outstanding: u64 = self
                .bus
                .readers_of(&self.channel)
                .iter()
                .map(|reader| reader.pending.load(Ordering::Acquire))
                .sum();
            if outstanding == 0 {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn matched_peers(&self) -> Result<u32, TransportError> {
        self.bus.status(&self.channel)?;
        Ok(self.bus.count(&self.channel, false))
    }

    fn set_match_listener(&self, listener: MatchListener) {
        let channels = self.bus.channels.lock();
        if let Some(slot) = channels
            .get(&self.channel)
            .and_then(|state| state.writers.get(&self.id))
        {
            *slot.match_listener.lock() = Some(listener);
        }
    }
}

impl Drop for LoopbackWriter {
    fn drop(&mut self) {
        if let Some(state) = self.bus.channels.lock().get_mut(&self.channel) {
            state.writers.remove(&self.id);
        }
        debug!("Loopback writer {} left '{}'", self.id, self.channel);
        self.bus.notify_matches(&self.channel);
    }
}

struct LoopbackReader {
    id: u64,
    channel: String,
    bus: Arc<Bus>,
    slot: Arc<ReaderSlot>,
}

impl PacketReader for LoopbackReader {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn matched_peers(&self) -> Result<u32, TransportError> {
        self.bus.status(&self.channel)?;
        Ok(self.bus.count(&self.channel, true))
    }

    fn set_match_listener(&self, listener: MatchListener) {
        *self.slot.match_listener.lock() = Some(listener);
    }
}

impl Drop for LoopbackReader {
    fn drop(&mut self) {
        self.slot.closed.store(true, Ordering::Release);
        self.slot.sender.lock().take();
        self.slot.listener.lock().take();
        self.slot.match_listener.lock().take();
        if let Some(state) = self.bus.channels.lock().get_mut(&self.channel) {
            state.readers.remove(&self.id);
        }
        debug!("Loopback reader {} left '{}'", self.id, self.channel);
        self.bus.notify_matches(&self.channel);
    }
}
