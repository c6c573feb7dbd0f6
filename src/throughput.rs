//! # Throughput Engine
//!
//! One round of unidirectional bulk transfer over a single channel.
//!
//! The publisher waits for a matched subscriber, sends `send_count` DATA
//! packets with optional pacing, waits for acknowledgments, and finishes with
//! a repeated END sentinel tagged with the round number. The subscriber counts
//! distinct sequences on the transport's delivery thread and, once END
//! arrives, derives packet and bit rates from the first-DATA to END interval.

use crate::codec::{self, PacketKind};
use crate::config::RoundConfig;
use crate::engine::{fatal, progress_due, EngineContext, PacketCounters, RoundRunner};
use crate::error::{BenchError, Result};
use crate::metrics::{
    loss_figures, throughput_figures, ModeStats, Role, RoundResult, TestMode, ThroughputStats,
};
use crate::sync::{wait_for_peer_match, MatchHandle, ReconnectDetector, RoundSignal};
use crate::transport::{DeliveryInfo, PacketReader, PacketWriter};
use crate::utils::{format_packet_rate, format_rate, monotonic_micros};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Number of missing sequences spelled out in the log
const LOST_LOG_LIMIT: usize = 50;

#[derive(Debug, Default)]
struct ReceiveTally {
    received: u64,
    duplicates: u64,
    bytes: u64,
    sequences: HashSet<u32>,
    first_packet: Option<Instant>,
    end_packet: Option<Instant>,
}

/// Subscriber state shared with the delivery thread.
#[derive(Default)]
struct ReceiveState {
    tally: Mutex<ReceiveTally>,
    end: RoundSignal,
    active_round: AtomicU32,
    recv_print_gap: AtomicU64,
    counters: Arc<PacketCounters>,
}

impl ReceiveState {
    fn begin_round(&self, round: u32, recv_print_gap: u64) {
        *self.tally.lock() = ReceiveTally::default();
        self.end.reset();
        self.recv_print_gap.store(recv_print_gap, Ordering::Relaxed);
        self.active_round.store(round, Ordering::Release);
    }

    fn on_data(&self, payload: &[u8], info: &DeliveryInfo) {
        if !info.valid_data {
            return;
        }
        let Some(header) = codec::decode(payload) else {
            let count = self.counters.record_invalid_payload();
            debug!("Discarded invalid payload of {} bytes ({} so far)", payload.len(), count);
            return;
        };

        if header.is_end() {
            let round = self.active_round.load(Ordering::Acquire);
            if header.sequence != round {
                debug!("Ignoring END for round {} during round {}", header.sequence, round);
                return;
            }
            {
                let mut tally = self.tally.lock();
                if tally.end_packet.is_none() {
                    tally.end_packet = Some(Instant::now());
                }
            }
            if self.end.signal() {
                debug!("Round {}: END received", round);
            }
            return;
        }

        if self.end.is_signalled() {
            // Round already closed; the next round resets the tally.
            return;
        }
        let mut tally = self.tally.lock();
        if !tally.sequences.insert(header.sequence) {
            tally.duplicates += 1;
            return;
        }
        if tally.first_packet.is_none() {
            tally.first_packet = Some(Instant::now());
        }
        tally.received += 1;
        tally.bytes += payload.len() as u64;
        let received = tally.received;
        drop(tally);

        if progress_due(received, self.recv_print_gap.load(Ordering::Relaxed)) {
            info!("Received {} packets", received);
        }
    }

    fn take_tally(&self) -> ReceiveTally {
        std::mem::take(&mut *self.tally.lock())
    }
}

/// Sequences in `[0, expected)` missing from `seen`, ascending
pub fn lost_sequences(expected: u64, seen: &HashSet<u32>) -> Vec<u32> {
    let upper = expected.min(u32::MAX as u64 + 1);
    (0..upper)
        .map(|seq| seq as u32)
        .filter(|seq| !seen.contains(seq))
        .collect()
}

/// Throughput round driver for both roles.
///
/// The writer is created on first use and kept across rounds. The reader
/// lives for a single round, so from round 2 on the publisher sees the
/// subscriber leave and waits for it to come back.
pub struct ThroughputEngine {
    context: EngineContext,
    channel: String,
    writer: Mutex<Option<Arc<dyn PacketWriter>>>,
    detector: Arc<ReconnectDetector>,
    receive: Arc<ReceiveState>,
    counters: Arc<PacketCounters>,
}

impl ThroughputEngine {
    pub fn new(context: EngineContext, channel: impl Into<String>) -> Self {
        let counters = Arc::new(PacketCounters::default());
        let receive = ReceiveState {
            counters: Arc::clone(&counters),
            ..Default::default()
        };
        Self {
            context,
            channel: channel.into(),
            writer: Mutex::new(None),
            detector: Arc::new(ReconnectDetector::new()),
            receive: Arc::new(receive),
            counters,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Per-packet failures seen by this engine so far
    pub fn counters(&self) -> &PacketCounters {
        &self.counters
    }

    fn writer(&self) -> Result<Arc<dyn PacketWriter>> {
        let mut slot = self.writer.lock();
        if let Some(writer) = slot.as_ref() {
            return Ok(Arc::clone(writer));
        }
        let writer = self.context.transport.create_writer(&self.channel)?;
        writer.set_match_listener(self.detector.listener());
        *slot = Some(Arc::clone(&writer));
        Ok(writer)
    }

    fn open_reader(&self) -> Result<Arc<dyn PacketReader>> {
        let state = Arc::clone(&self.receive);
        let reader = self.context.transport.create_reader(
            &self.channel,
            Arc::new(move |payload: &[u8], info: &DeliveryInfo| state.on_data(payload, info)),
        )?;
        Ok(reader)
    }

    /// Wait for the subscriber of a later round to come back if it left.
    fn await_reconnect(&self, writer: &dyn PacketWriter, round: u32) -> Result<()> {
        if round <= 1 || writer.matched_peers()? > 0 {
            return Ok(());
        }
        info!("Round {}: subscriber gone, waiting for reconnect", round);
        if !self
            .detector
            .wait_for_reconnect(self.context.settings.reconnect_timeout)
        {
            warn!(
                "Round {}: no reconnect within {:?}, continuing with match wait",
                round, self.context.settings.reconnect_timeout
            );
        }
        Ok(())
    }

    fn publish(&self, config: &RoundConfig) -> Result<()> {
        config.validate()?;
        let round = config.active_round;
        let settings = &self.context.settings;
        // The start snapshot covers setup and peer matching.
        let resources = self.context.monitor.open_window();
        let cancel = &self.context.cancel;

        let writer = self.writer()?;
        self.await_reconnect(writer.as_ref(), round)?;
        wait_for_peer_match(
            MatchHandle::Writer(writer.as_ref()),
            round,
            settings.match_poll_interval,
            settings.match_timeout,
            cancel,
        )?;

        info!(
            "Round {}: publishing {} packets of {}..{} bytes",
            round, config.send_count, config.min_size, config.max_size
        );
        let resource_start = resources.snapshot();
        let mut rng = rand::thread_rng();
        let mut buf = Vec::with_capacity(RoundConfig::effective_size(config.max_size));
        let mut sent = 0u64;
        let mut bytes = 0u64;
        let started = Instant::now();

        for seq in 0..config.send_count {
            if cancel.is_cancelled() {
                return Err(BenchError::Cancelled { round });
            }
            let size = if config.fixed_size() {
                config.min_size
            } else {
                rng.gen_range(config.min_size..=config.max_size)
            };
            codec::encode_into(&mut buf, PacketKind::Data, seq as u32, monotonic_micros(), size);
            match writer.write(&buf) {
                Ok(()) => {
                    sent += 1;
                    bytes += buf.len() as u64;
                }
                Err(e) => {
                    if self.counters.record_write_failure() == 1 {
                        warn!("Round {}: write of packet {} failed: {}", round, seq, e);
                    } else {
                        debug!("Round {}: write of packet {} failed: {}", round, seq, e);
                    }
                }
            }

            let done = seq + 1;
            if progress_due(done, config.print_gap) {
                info!("Round {}: sent {}/{}", round, done, config.send_count);
            }
            if progress_due(done, config.send_delay_every)
                && !config.send_delay.is_zero()
                && !cancel.sleep(config.send_delay)
            {
                return Err(BenchError::Cancelled { round });
            }
        }
        let send_duration = started.elapsed().as_secs_f64();

        if !writer.wait_for_acknowledgments(settings.ack_timeout) {
            warn!(
                "Round {}: not all packets acknowledged within {:?}",
                round, settings.ack_timeout
            );
        }
        self.context
            .send_end_packets(writer.as_ref(), round, &self.counters)?;
        let resource_end = resources.snapshot();

        let avg_size = if sent > 0 {
            bytes as f64 / sent as f64
        } else {
            0.0
        };
        let (pps, mbps) = throughput_figures(sent, avg_size, send_duration);
        let (_, loss_rate) = loss_figures(config.send_count, sent);
        info!(
            "Round {}: sent {} packets, {} ({})",
            round,
            sent,
            format_packet_rate(pps),
            format_rate(mbps * 1024.0 * 1024.0 / 8.0)
        );

        self.context.emit(RoundResult {
            round_index: round,
            role: Role::Publisher,
            resource_start,
            resource_end,
            sent_count: sent,
            received_count: 0,
            loss_rate_percent: loss_rate,
            duration_seconds: send_duration,
            stats: ModeStats::Throughput(ThroughputStats {
                throughput_mbps: mbps,
                throughput_pps: pps,
                avg_packet_size_bytes: avg_size,
                duplicate_count: 0,
                lost_sequences: Vec::new(),
            }),
            cpu_samples: Vec::new(),
        });
        Ok(())
    }

    fn subscribe(&self, config: &RoundConfig) -> Result<()> {
        config.validate()?;
        let round = config.active_round;
        let settings = &self.context.settings;
        let resources = self.context.monitor.open_window();

        // Reset before matching so nothing from the previous round leaks in.
        self.receive.begin_round(round, config.recv_print_gap);
        let reader = self.open_reader()?;
        wait_for_peer_match(
            MatchHandle::Reader(reader.as_ref()),
            round,
            settings.match_poll_interval,
            settings.match_timeout,
            &self.context.cancel,
        )?;

        info!("Round {}: receiving, expecting {} packets", round, config.send_count);
        let resource_start = resources.snapshot();
        self.receive
            .end
            .wait(round, settings.round_end_timeout, &self.context.cancel)?;
        let resource_end = resources.snapshot();
        drop(reader);

        let tally = self.receive.take_tally();
        let duration = match (tally.first_packet, tally.end_packet) {
            (Some(first), Some(end)) => end.saturating_duration_since(first).as_secs_f64(),
            _ => 0.0,
        };
        let avg_size = if tally.received > 0 {
            tally.bytes as f64 / tally.received as f64
        } else {
            RoundConfig::effective_size(config.min_size) as f64
        };
        let (pps, mbps) = throughput_figures(tally.received, avg_size, duration);
        let (lost, loss_rate) = loss_figures(config.send_count, tally.received);
        let lost_list = lost_sequences(config.send_count, &tally.sequences);

        info!(
            "Round {}: received {}/{} packets, loss {:.3}%, {:.2} Mbps, {}",
            round,
            tally.received,
            config.send_count,
            loss_rate,
            mbps,
            format_packet_rate(pps)
        );
        if lost > 0 {
            let shown: Vec<String> = lost_list
                .iter()
                .take(LOST_LOG_LIMIT)
                .map(|seq| seq.to_string())
                .collect();
            let more = lost_list.len().saturating_sub(LOST_LOG_LIMIT);
            if more > 0 {
                warn!("Round {}: lost sequences {} ... and {} more", round, shown.join(","), more);
            } else {
                warn!("Round {}: lost sequences {}", round, shown.join(","));
            }
        }
        if tally.duplicates > 0 {
            debug!("Round {}: {} duplicate packets", round, tally.duplicates);
        }

        self.context.emit(RoundResult {
            round_index: round,
            role: Role::Subscriber,
            resource_start,
            resource_end,
            sent_count: config.send_count,
            received_count: tally.received,
            loss_rate_percent: loss_rate,
            duration_seconds: duration,
            stats: ModeStats::Throughput(ThroughputStats {
                throughput_mbps: mbps,
                throughput_pps: pps,
                avg_packet_size_bytes: avg_size,
                duplicate_count: tally.duplicates,
                lost_sequences: lost_list,
            }),
            cpu_samples: Vec::new(),
        });
        Ok(())
    }
}

impl RoundRunner for ThroughputEngine {
    fn mode(&self) -> TestMode {
        TestMode::Throughput
    }

    fn run_publisher_round(&self, config: &RoundConfig) -> Result<()> {
        self.publish(config)
            .map_err(|e| fatal(config.active_round, "publisher", e))
    }

    fn run_subscriber_round(&self, config: &RoundConfig) -> Result<()> {
        self.subscribe(config)
            .map_err(|e| fatal(config.active_round, "subscriber", e))
    }
}
