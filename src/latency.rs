//! # Latency Engine
//!
//! Ping/pong round-trip measurement over two channels, `<base>_ping` and
//! `<base>_pong`, so neither side ever reads its own traffic.
//!
//! The initiator stamps each probe with the shared monotonic clock and
//! computes `now - header.timestamp` when the reply arrives. The responder
//! echoes every probe from inside its delivery callback, keeping the original
//! sequence and timestamp, and answers the round's END with a single END.

use crate::codec::{self, PacketKind};
use crate::config::RoundConfig;
use crate::engine::{fatal, progress_due, EngineContext, PacketCounters, RoundRunner};
use crate::error::{BenchError, Result};
use crate::metrics::{loss_figures, LatencyStats, ModeStats, Role, RoundResult, RttCollector, TestMode};
use crate::sync::{wait_for_peer_match, MatchHandle, ReconnectDetector, RoundSignal};
use crate::transport::{ping_channel, pong_channel, DeliveryInfo, PacketReader, PacketWriter};
use crate::utils::{format_micros, monotonic_micros};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

struct ReplyTally {
    rtt: RttCollector,
    sequences: HashSet<u32>,
    discarded: u64,
    last_reply: Option<Instant>,
}

/// Initiator state shared with the pong delivery thread.
struct ReplyState {
    tally: Mutex<ReplyTally>,
    end_echo: RoundSignal,
    active_round: AtomicU32,
    counters: Arc<PacketCounters>,
}

impl ReplyState {
    fn begin_round(&self, round: u32) {
        {
            let mut tally = self.tally.lock();
            tally.rtt.reset();
            tally.sequences.clear();
            tally.discarded = 0;
            tally.last_reply = None;
        }
        self.end_echo.reset();
        self.active_round.store(round, Ordering::Release);
    }

    fn on_reply(&self, payload: &[u8], info: &DeliveryInfo) {
        if !info.valid_data {
            return;
        }
        let received_at = monotonic_micros();
        let Some(header) = codec::decode(payload) else {
            self.counters.record_invalid_payload();
            return;
        };
        if header.is_end() {
            if header.sequence == self.active_round.load(Ordering::Acquire) && self.end_echo.signal() {
                debug!("Round {}: END echoed", header.sequence);
            }
            return;
        }

        let mut tally = self.tally.lock();
        let Some(rtt) = received_at
            .checked_sub(header.timestamp)
            .filter(|rtt| *rtt > 0)
        else {
            tally.discarded += 1;
            return;
        };
        if !tally.sequences.insert(header.sequence) {
            return;
        }
        tally.rtt.record(rtt as f64);
        tally.last_reply = Some(Instant::now());
    }
}

/// Responder state shared with the ping delivery thread.
struct EchoState {
    pong: Arc<dyn PacketWriter>,
    scratch: Mutex<Vec<u8>>,
    end: RoundSignal,
    end_replied: AtomicBool,
    active_round: AtomicU32,
    echoed: AtomicU64,
    probes: Mutex<HashSet<u32>>,
    first_probe: Mutex<Option<Instant>>,
    recv_print_gap: AtomicU64,
    counters: Arc<PacketCounters>,
}

impl EchoState {
    fn begin_round(&self, round: u32, recv_print_gap: u64) {
        self.probes.lock().clear();
        *self.first_probe.lock() = None;
        self.echoed.store(0, Ordering::Relaxed);
        self.end_replied.store(false, Ordering::Relaxed);
        self.end.reset();
        self.recv_print_gap.store(recv_print_gap, Ordering::Relaxed);
        self.active_round.store(round, Ordering::Release);
    }

    fn on_probe(&self, payload: &[u8], info: &DeliveryInfo) {
        if !info.valid_data {
            return;
        }
        let Some(header) = codec::decode(payload) else {
            self.counters.record_invalid_payload();
            return;
        };

        if header.is_end() {
            let round = self.active_round.load(Ordering::Acquire);
            if header.sequence != round {
                return;
            }
            if !self.end_replied.swap(true, Ordering::AcqRel) {
                let reply = codec::encode(PacketKind::End, round, header.timestamp, codec::HEADER_SIZE);
                if let Err(e) = self.pong.write(&reply) {
                    self.counters.record_write_failure();
                    warn!("Round {}: END reply failed: {}", round, e);
                }
            }
            self.end.signal();
            return;
        }

        {
            // Same sequence and timestamp, kind normalised to DATA.
            let mut scratch = self.scratch.lock();
            codec::encode_into(
                &mut scratch,
                PacketKind::Data,
                header.sequence,
                header.timestamp,
                payload.len(),
            );
            match self.pong.write(&scratch) {
                Ok(()) => {
                    self.echoed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.record_write_failure();
                    debug!("Echo of probe {} failed: {}", header.sequence, e);
                }
            }
        }

        let distinct = {
            let mut probes = self.probes.lock();
            probes.insert(header.sequence);
            probes.len() as u64
        };
        if distinct == 1 {
            self.first_probe.lock().get_or_insert_with(Instant::now);
        }
        if progress_due(distinct, self.recv_print_gap.load(Ordering::Relaxed)) {
            info!("Echoed {} probes", distinct);
        }
    }
}

struct InitiatorSide {
    ping: Arc<dyn PacketWriter>,
    pong: Arc<dyn PacketReader>,
}

/// Latency round driver; publisher is the initiator, subscriber the responder.
///
/// Initiator endpoints persist across rounds. Responder endpoints are opened
/// per round, so a later round starts with the initiator seeing a reconnect.
pub struct LatencyEngine {
    context: EngineContext,
    base_channel: String,
    initiator: Mutex<Option<InitiatorSide>>,
    detector: Arc<ReconnectDetector>,
    replies: Arc<ReplyState>,
    counters: Arc<PacketCounters>,
}

impl LatencyEngine {
    pub fn new(context: EngineContext, base_channel: impl Into<String>) -> anyhow::Result<Self> {
        let counters = Arc::new(PacketCounters::default());
        let replies = ReplyState {
            tally: Mutex::new(ReplyTally {
                rtt: RttCollector::new()?,
                sequences: HashSet::new(),
                discarded: 0,
                last_reply: None,
            }),
            end_echo: RoundSignal::new(),
            active_round: AtomicU32::new(0),
            counters: Arc::clone(&counters),
        };
        Ok(Self {
            context,
            base_channel: base_channel.into(),
            initiator: Mutex::new(None),
            detector: Arc::new(ReconnectDetector::new()),
            replies: Arc::new(replies),
            counters,
        })
    }

    /// Per-packet failures seen by this engine so far
    pub fn counters(&self) -> &PacketCounters {
        &self.counters
    }

    fn initiator_side(&self) -> Result<(Arc<dyn PacketWriter>, Arc<dyn PacketReader>)> {
        let mut slot = self.initiator.lock();
        if let Some(side) = slot.as_ref() {
            return Ok((Arc::clone(&side.ping), Arc::clone(&side.pong)));
        }
        let replies = Arc::clone(&self.replies);
        let pong = self.context.transport.create_reader(
            &pong_channel(&self.base_channel),
            Arc::new(move |payload: &[u8], info: &DeliveryInfo| replies.on_reply(payload, info)),
        )?;
        let ping = self
            .context
            .transport
            .create_writer(&ping_channel(&self.base_channel))?;
        ping.set_match_listener(self.detector.listener());
        *slot = Some(InitiatorSide {
            ping: Arc::clone(&ping),
            pong: Arc::clone(&pong),
        });
        Ok((ping, pong))
    }

    /// Open this round's responder endpoints.
    ///
    /// Echo state is reset before the ping reader exists, so no probe can be
    /// counted against the previous round.
    fn responder_side(
        &self,
        config: &RoundConfig,
    ) -> Result<(Arc<dyn PacketReader>, Arc<EchoState>)> {
        let pong = self
            .context
            .transport
            .create_writer(&pong_channel(&self.base_channel))?;
        let state = Arc::new(EchoState {
            pong,
            scratch: Mutex::new(Vec::new()),
            end: RoundSignal::new(),
            end_replied: AtomicBool::new(false),
            active_round: AtomicU32::new(0),
            echoed: AtomicU64::new(0),
            probes: Mutex::new(HashSet::new()),
            first_probe: Mutex::new(None),
            recv_print_gap: AtomicU64::new(0),
            counters: Arc::clone(&self.counters),
        });
        state.begin_round(config.active_round, config.recv_print_gap);
        let echo = Arc::clone(&state);
        let ping = self.context.transport.create_reader(
            &ping_channel(&self.base_channel),
            Arc::new(move |payload: &[u8], info: &DeliveryInfo| echo.on_probe(payload, info)),
        )?;
        Ok((ping, state))
    }

    fn initiate(&self, config: &RoundConfig) -> Result<()> {
        config.validate()?;
        let round = config.active_round;
        let settings = &self.context.settings;
        // The start snapshot covers setup and peer matching.
        let resources = self.context.monitor.open_window();
        let cancel = &self.context.cancel;

        self.replies.begin_round(round);
        let (ping, pong) = self.initiator_side()?;
        if round > 1 && ping.matched_peers()? == 0 {
            info!("Round {}: responder gone, waiting for reconnect", round);
            if !self.detector.wait_for_reconnect(settings.reconnect_timeout) {
                warn!("Round {}: no reconnect within {:?}", round, settings.reconnect_timeout);
            }
        }
        for handle in [MatchHandle::Writer(ping.as_ref()), MatchHandle::Reader(pong.as_ref())] {
            wait_for_peer_match(
                handle,
                round,
                settings.match_poll_interval,
                settings.match_timeout,
                cancel,
            )?;
        }

        info!("Round {}: sending {} probes", round, config.send_count);
        let resource_start = resources.snapshot();
        let mut rng = rand::thread_rng();
        let mut buf = Vec::with_capacity(RoundConfig::effective_size(config.max_size));
        let mut sent = 0u64;
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
            match ping.write(&buf) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.counters.record_write_failure();
                    debug!("Round {}: probe {} failed: {}", round, seq, e);
                }
            }

            let done = seq + 1;
            if progress_due(done, config.print_gap) {
                info!("Round {}: sent {}/{} probes", round, done, config.send_count);
            }
            let pause = if config.send_delay_every > 0 {
                progress_due(done, config.send_delay_every).then_some(config.send_delay)
            } else {
                Some(settings.probe_gap)
            };
            if let Some(pause) = pause.filter(|p| !p.is_zero()) {
                if !cancel.sleep(pause) {
                    return Err(BenchError::Cancelled { round });
                }
            }
        }

        self.context
            .send_end_packets(ping.as_ref(), round, &self.counters)?;
        match self
            .replies
            .end_echo
            .wait(round, Some(settings.reply_window), cancel)
        {
            Ok(()) => {}
            Err(BenchError::DeadlineExceeded { .. }) => {
                warn!("Round {}: END not echoed within {:?}", round, settings.reply_window);
            }
            Err(e) => return Err(e),
        }
        let resource_end = resources.snapshot();

        let (stats, received, discarded, last_reply) = {
            let tally = self.replies.tally.lock();
            (
                tally.rtt.stats(),
                tally.sequences.len() as u64,
                tally.discarded,
                tally.last_reply,
            )
        };
        let duration = last_reply
            .map(|last| last.saturating_duration_since(started).as_secs_f64())
            .unwrap_or(0.0);
        let (_, loss_rate) = loss_figures(config.send_count, received);
        if discarded > 0 {
            warn!("Round {}: discarded {} non-positive RTT samples", round, discarded);
        }
        info!(
            "Round {}: {} replies, avg RTT {}, min {}, max {}, p99 {}, loss {:.3}%",
            round,
            received,
            format_micros(stats.avg_rtt_us),
            format_micros(stats.min_rtt_us),
            format_micros(stats.max_rtt_us),
            format_micros(stats.p99_rtt_us as f64),
            loss_rate
        );

        self.context.emit(RoundResult {
            round_index: round,
            role: Role::Publisher,
            resource_start,
            resource_end,
            sent_count: sent,
            received_count: received,
            loss_rate_percent: loss_rate,
            duration_seconds: duration,
            stats: ModeStats::Latency(stats),
            cpu_samples: Vec::new(),
        });
        Ok(())
    }

    fn respond(&self, config: &RoundConfig) -> Result<()> {
        config.validate()?;
        let round = config.active_round;
        let settings = &self.context.settings;
        let resources = self.context.monitor.open_window();
        let cancel = &self.context.cancel;

        let (ping, state) = self.responder_side(config)?;
        for handle in [
            MatchHandle::Reader(ping.as_ref()),
            MatchHandle::Writer(state.pong.as_ref()),
        ] {
            wait_for_peer_match(
                handle,
                round,
                settings.match_poll_interval,
                settings.match_timeout,
                cancel,
            )?;
        }

        info!("Round {}: echoing probes", round);
        let resource_start = resources.snapshot();
        state.end.wait(round, settings.round_end_timeout, cancel)?;
        let resource_end = resources.snapshot();
        drop(ping);

        let received = state.probes.lock().len() as u64;
        let echoed = state.echoed.load(Ordering::Relaxed);
        let duration = state
            .first_probe
            .lock()
            .map(|first| first.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let (_, loss_rate) = loss_figures(config.send_count, received);
        info!(
            "Round {}: echoed {} of {} probes, loss {:.3}%",
            round, echoed, config.send_count, loss_rate
        );

        self.context.emit(RoundResult {
            round_index: round,
            role: Role::Subscriber,
            resource_start,
            resource_end,
            sent_count: echoed,
            received_count: received,
            loss_rate_percent: loss_rate,
            duration_seconds: duration,
            stats: ModeStats::Latency(LatencyStats::default()),
            cpu_samples: Vec::new(),
        });
        Ok(())
    }
}

impl RoundRunner for LatencyEngine {
    fn mode(&self) -> TestMode {
        TestMode::Latency
    }

    fn run_publisher_round(&self, config: &RoundConfig) -> Result<()> {
        self.initiate(config)
            .map_err(|e| fatal(config.active_round, "initiator", e))
    }

    fn run_subscriber_round(&self, config: &RoundConfig) -> Result<()> {
        self.respond(config)
            .map_err(|e| fatal(config.active_round, "responder", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::transport::{LoopbackTransport, Transport};
    use std::time::Duration;

    const VALID: DeliveryInfo = DeliveryInfo { valid_data: true };

    fn reply_state() -> ReplyState {
        ReplyState {
            tally: Mutex::new(ReplyTally {
                rtt: RttCollector::new().unwrap(),
                sequences: HashSet::new(),
                discarded: 0,
                last_reply: None,
            }),
            end_echo: RoundSignal::new(),
            active_round: AtomicU32::new(0),
            counters: Arc::new(PacketCounters::default()),
        }
    }

    #[test]
    fn test_reply_rtt_and_discards() {
        let state = reply_state();
        state.begin_round(1);

        let sent_at = monotonic_micros() - 500;
        state.on_reply(&encode(PacketKind::Data, 0, sent_at, 64), &VALID);
        // Timestamp from the future yields a non-positive RTT.
        state.on_reply(&encode(PacketKind::Data, 1, u64::MAX / 2, 64), &VALID);
        // Duplicate reply is not sampled twice.
        state.on_reply(&encode(PacketKind::Data, 0, sent_at, 64), &VALID);

        let tally = state.tally.lock();
        assert_eq!(tally.rtt.len(), 1);
        assert_eq!(tally.discarded, 1);
        assert!(tally.rtt.stats().min_rtt_us >= 500.0);
    }

    #[test]
    fn test_timestamps_past_the_clock_are_discarded() {
        let state = reply_state();
        state.begin_round(1);

        // Would wrap to a small positive RTT through a signed cast.
        state.on_reply(&encode(PacketKind::Data, 0, u64::MAX, 64), &VALID);
        state.on_reply(&encode(PacketKind::Data, 1, 1u64 << 63, 64), &VALID);
        state.on_reply(&encode(PacketKind::Data, 2, monotonic_micros() + 60_000_000, 64), &VALID);

        let tally = state.tally.lock();
        assert_eq!(tally.discarded, 3);
        assert!(tally.rtt.is_empty());
        assert!(tally.sequences.is_empty());
    }

    #[test]
    fn test_end_echo_matches_round() {
        let state = reply_state();
        state.begin_round(4);
        state.on_reply(&encode(PacketKind::End, 3, 0, 13), &VALID);
        assert!(!state.end_echo.is_signalled());
        state.on_reply(&encode(PacketKind::End, 4, 0, 13), &VALID);
        assert!(state.end_echo.is_signalled());
    }

    #[test]
    fn test_responder_echoes_and_answers_end_once() {
        let transport = LoopbackTransport::default();
        let replies = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&replies);
        let _pong_reader = transport
            .create_reader(
                "echo_pong",
                Arc::new(move |payload: &[u8], _info: &DeliveryInfo| {
                    seen.lock().push((codec::decode(payload), payload.len()));
                }),
            )
            .unwrap();
        let pong = transport.create_writer("echo_pong").unwrap();

        let state = EchoState {
            pong: Arc::clone(&pong),
            scratch: Mutex::new(Vec::new()),
            end: RoundSignal::new(),
            end_replied: AtomicBool::new(false),
            active_round: AtomicU32::new(0),
            echoed: AtomicU64::new(0),
            probes: Mutex::new(HashSet::new()),
            first_probe: Mutex::new(None),
            recv_print_gap: AtomicU64::new(0),
            counters: Arc::new(PacketCounters::default()),
        };
        state.begin_round(2, 0);

        state.on_probe(&encode(PacketKind::Data, 9, 12345, 200), &VALID);
        state.on_probe(&encode(PacketKind::End, 2, 0, 13), &VALID);
        state.on_probe(&encode(PacketKind::End, 2, 0, 13), &VALID);
        assert!(state.end.is_signalled());
        assert!(pong.wait_for_acknowledgments(Duration::from_secs(5)));

        let replies = replies.lock();
        assert_eq!(replies.len(), 2);
        let (echo, len) = replies[0];
        let echo = echo.unwrap();
        assert_eq!(echo.sequence, 9);
        assert_eq!(echo.timestamp, 12345);
        assert_eq!(echo.kind, PacketKind::Data);
        assert_eq!(len, 200);
        let (end, _) = replies[1];
        assert!(end.unwrap().is_end());
        assert_eq!(end.unwrap().sequence, 2);
        assert_eq!(state.echoed.load(Ordering::Relaxed), 1);
    }
}
