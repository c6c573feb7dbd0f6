//! Collaborators and helpers shared by the throughput and latency engines.

use crate::codec::{self, PacketKind};
use crate::config::{EngineSettings, RoundConfig};
use crate::error::{BenchError, Result};
use crate::metrics::{ResultSink, RoundResult, TestMode};
use crate::sampler::ResourceMonitor;
use crate::sync::CancellationToken;
use crate::transport::{PacketWriter, Transport};
use crate::utils::monotonic_micros;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Everything an engine needs besides its own round state.
#[derive(Clone)]
pub struct EngineContext {
    pub transport: Arc<dyn Transport>,
    pub monitor: Arc<ResourceMonitor>,
    pub settings: EngineSettings,
    pub sink: ResultSink,
    pub cancel: CancellationToken,
}

impl EngineContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        monitor: Arc<ResourceMonitor>,
        sink: ResultSink,
    ) -> Self {
        Self {
            transport,
            monitor,
            settings: EngineSettings::default(),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn emit(&self, result: RoundResult) {
        debug!(
            "Round {} {:?} result: sent={} received={} loss={:.3}%",
            result.round_index,
            result.role,
            result.sent_count,
            result.received_count,
            result.loss_rate_percent
        );
        (self.sink)(result);
    }

    /// Write the END sentinel for `round` the configured number of times.
    ///
    /// Returns how many copies were accepted by the transport.
    pub(crate) fn send_end_packets(
        &self,
        writer: &dyn PacketWriter,
        round: u32,
        counters: &PacketCounters,
    ) -> Result<u32> {
        let repeats = self.settings.end_packet_repeats.max(1);
        let payload = codec::encode(PacketKind::End, round, monotonic_micros(), codec::HEADER_SIZE);
        let mut accepted = 0;
        for attempt in 0..repeats {
            match writer.write(&payload) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    counters.record_write_failure();
                    warn!("END packet {} of {} not sent: {}", attempt + 1, repeats, e);
                }
            }
            if attempt + 1 < repeats && !self.cancel.sleep(self.settings.end_packet_gap) {
                return Err(BenchError::Cancelled { round });
            }
        }
        debug!("Round {}: sent END {}/{} times on '{}'", round, accepted, repeats, writer.channel());
        Ok(accepted)
    }
}

/// Log a fatal round error and hand it back.
pub(crate) fn fatal(round: u32, role: &str, err: BenchError) -> BenchError {
    error!("Round {} {} failed: {}", round, role, err);
    err
}

/// Per-packet failures recovered locally.
#[derive(Debug, Default)]
pub struct PacketCounters {
    write_failures: AtomicU64,
    invalid_payloads: AtomicU64,
}

impl PacketCounters {
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn invalid_payloads(&self) -> u64 {
        self.invalid_payloads.load(Ordering::Relaxed)
    }

    /// Returns the failure count including this one.
    pub(crate) fn record_write_failure(&self) -> u64 {
        self.write_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_invalid_payload(&self) -> u64 {
        self.invalid_payloads.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Round entry points exposed to the scenario runner.
///
/// For the latency engine the publisher is the initiator and the subscriber
/// is the responder. `Err` means no result was emitted for the round.
pub trait RoundRunner: Send + Sync {
    fn mode(&self) -> TestMode;

    fn run_publisher_round(&self, config: &RoundConfig) -> Result<()>;

    fn run_subscriber_round(&self, config: &RoundConfig) -> Result<()>;
}

/// Whether a progress line is due after `count` events
pub(crate) fn progress_due(count: u64, gap: u64) -> bool {
    gap > 0 && count > 0 && count % gap == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NoMemoryProbe;
    use crate::transport::{DeliveryInfo, LoopbackTransport};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_progress_due() {
        assert!(!progress_due(10, 0));
        assert!(!progress_due(0, 5));
        assert!(progress_due(10, 5));
        assert!(!progress_due(11, 5));
    }

    #[test]
    fn test_end_packets_are_repeated_and_tagged() {
        let transport = LoopbackTransport::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let _reader = transport
            .create_reader(
                "end",
                Arc::new(move |payload: &[u8], _info: &DeliveryInfo| {
                    sink_seen.lock().push(codec::decode(payload));
                }),
            )
            .unwrap();
        let writer = transport.create_writer("end").unwrap();

        let monitor = Arc::new(ResourceMonitor::start(
            Arc::new(NoMemoryProbe),
            Duration::from_millis(20),
        ));
        let mut settings = EngineSettings::default();
        settings.end_packet_gap = Duration::from_millis(1);
        let context = EngineContext::new(Arc::new(transport), monitor, Arc::new(|_: RoundResult| {}))
            .with_settings(settings);

        let counters = PacketCounters::default();
        let accepted = context
            .send_end_packets(writer.as_ref(), 7, &counters)
            .unwrap();
        assert_eq!(accepted, 3);
        assert!(writer.wait_for_acknowledgments(Duration::from_secs(5)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        for header in seen.iter() {
            let header = header.unwrap();
            assert!(header.is_end());
            assert_eq!(header.sequence, 7);
        }
        assert_eq!(counters.write_failures(), 0);
    }
}
