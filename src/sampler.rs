//! # Resource Sampler
//!
//! A background thread samples process CPU utilisation every few tens of
//! milliseconds and folds each reading into a peak. Readers take the peak
//! with `read_peak_and_reset`, which swaps in the `NO_DATA` sentinel and
//! therefore starts a new observation window on every call.
//!
//! Every peak is an `f64` stored as bits in an `AtomicU64` and updated with a
//! compare-and-swap "raise if greater" loop, so reads never block sampling.
//! Besides its own peak the sampler feeds any number of `PeakWindow`s; each
//! concurrent reader opens one so a read by one never empties another's.
//!
//! `ResourceMonitor` pairs a sampler with a `MemoryProbe` and hands out
//! `ResourceWindow`s producing the `ResourceSample` snapshots recorded at
//! round boundaries.

use crate::error::BenchError;
use crate::memory::MemoryProbe;
use crate::metrics::ResourceSample;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Peak value meaning "no sample since the last read".
pub const NO_DATA: f64 = -1.0;

/// Raw time-accounting counters, both in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    /// CPU time consumed by this process
    pub process: u64,
    /// CPU time available to the whole system over the same clock
    pub system: u64,
}

/// Source of process/system CPU counters.
pub trait CpuClock: Send + 'static {
    fn read(&mut self) -> Option<CpuTimes>;
}

/// CPU counters of the current process.
///
/// The system counter is monotonic wall time multiplied by the number of
/// logical CPUs, so a process saturating every core reads 100%.
#[derive(Debug, Clone)]
pub struct ProcessCpuClock {
    cores: u64,
}

impl ProcessCpuClock {
    /// Open the counters, failing if the platform does not expose them.
    pub fn open() -> Result<Self, BenchError> {
        let mut clock = Self {
            cores: num_cpus::get().max(1) as u64,
        };
        match clock.read() {
            Some(_) => Ok(clock),
            None => Err(BenchError::SamplerUnavailable(
                "process CPU clock not readable".to_string(),
            )),
        }
    }
}

impl CpuClock for ProcessCpuClock {
    #[cfg(unix)]
    fn read(&mut self) -> Option<CpuTimes> {
        use nix::time::{clock_gettime, ClockId};

        fn as_nanos(ts: nix::sys::time::TimeSpec) -> u64 {
            ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
        }

        let process = clock_gettime(ClockId::CLOCK_PROCESS_CPUTIME_ID).ok()?;
        let wall = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
        Some(CpuTimes {
            process: as_nanos(process),
            system: as_nanos(wall).saturating_mul(self.cores),
        })
    }

    #[cfg(not(unix))]
    fn read(&mut self) -> Option<CpuTimes> {
        None
    }
}

/// Lifecycle of a sampler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Uninitialized,
    Running,
    Stopped,
}

impl SamplerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SamplerState::Uninitialized,
            1 => SamplerState::Running,
            _ => SamplerState::Stopped,
        }
    }
}

struct SamplerShared {
    peak_bits: AtomicU64,
    last_bits: AtomicU64,
    samples: AtomicU64,
    stop: AtomicBool,
    windows: Mutex<Vec<Weak<AtomicU64>>>,
}

impl SamplerShared {
    fn new() -> Self {
        Self {
            peak_bits: AtomicU64::new(NO_DATA.to_bits()),
            last_bits: AtomicU64::new(NO_DATA.to_bits()),
            samples: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            windows: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, percent: f64) {
        self.last_bits.store(percent.to_bits(), Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        raise_peak(&self.peak_bits, percent);
        // Dropped windows are pruned here.
        self.windows.lock().retain(|window| match window.upgrade() {
            Some(peak) => {
                raise_peak(&peak, percent);
                true
            }
            None => false,
        });
    }
}

/// Independent peak window fed by a `ResourceSampler`.
///
/// Starts empty (`NO_DATA`) and sees every sample taken while it is alive.
#[derive(Debug)]
pub struct PeakWindow {
    peak_bits: Arc<AtomicU64>,
}

impl PeakWindow {
    /// Return the peak since the previous read of this window and reset it.
    pub fn read_peak_and_reset(&self) -> f64 {
        f64::from_bits(self.peak_bits.swap(NO_DATA.to_bits(), Ordering::AcqRel))
    }
}

/// Raise `peak` to `sample` if the sample is larger.
///
/// Retries on contention until the swap succeeds or another writer has
/// already published a value at least as large. Returns whether this call
/// changed the peak.
pub fn raise_peak(peak: &AtomicU64, sample: f64) -> bool {
    let mut current = peak.load(Ordering::Acquire);
    loop {
        if sample <= f64::from_bits(current) {
            return false;
        }
        match peak.compare_exchange_weak(
            current,
            sample.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Instantaneous utilisation between two counter readings.
fn utilisation(previous: CpuTimes, current: CpuTimes) -> Option<f64> {
    let system_delta = current.system.saturating_sub(previous.system);
    if system_delta == 0 {
        return None;
    }
    let process_delta = current.process.saturating_sub(previous.process);
    Some((process_delta as f64 / system_delta as f64 * 100.0).max(0.0))
}

/// Background CPU peak sampler.
pub struct ResourceSampler {
    shared: Arc<SamplerShared>,
    state: AtomicU8,
    handle: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

impl ResourceSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(SamplerShared::new()),
            state: AtomicU8::new(SamplerState::Uninitialized as u8),
            handle: Mutex::new(None),
            interval,
        }
    }

    pub fn state(&self) -> SamplerState {
        SamplerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Take a baseline reading and start the sampling thread.
    ///
    /// Calling this on a running sampler is a no-op. A stopped sampler cannot
    /// be restarted.
    pub fn initialize<C: CpuClock>(&self, mut clock: C) -> Result<(), BenchError> {
        let mut handle = self.handle.lock();
        match self.state() {
            SamplerState::Running => return Ok(()),
            SamplerState::Stopped => {
                return Err(BenchError::SamplerUnavailable(
                    "sampler already stopped".to_string(),
                ))
            }
            SamplerState::Uninitialized => {}
        }

        let baseline = clock.read().ok_or_else(|| {
            BenchError::SamplerUnavailable("baseline CPU reading failed".to_string())
        })?;

        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let thread = std::thread::Builder::new()
            .name("resource-sampler".to_string())
            .spawn(move || sampling_loop(shared, clock, baseline, interval))
            .map_err(|e| BenchError::SamplerUnavailable(e.to_string()))?;

        *handle = Some(thread);
        self.state
            .store(SamplerState::Running as u8, Ordering::Release);
        debug!("Resource sampler started ({:?} interval)", interval);
        Ok(())
    }

    /// Stop the sampling thread and wait for it to exit.
    pub fn shutdown(&self) {
        let mut handle = self.handle.lock();
        if self.state() != SamplerState::Running {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = handle.take() {
            if thread.join().is_err() {
                warn!("Resource sampler thread panicked");
            }
        }
        self.state
            .store(SamplerState::Stopped as u8, Ordering::Release);
        debug!("Resource sampler stopped");
    }

    /// Return the peak since the previous call and reset it to `NO_DATA`.
    pub fn read_peak_and_reset(&self) -> f64 {
        f64::from_bits(
            self.shared
                .peak_bits
                .swap(NO_DATA.to_bits(), Ordering::AcqRel),
        )
    }

    /// Open a window that receives every later sample.
    pub fn open_window(&self) -> PeakWindow {
        let peak_bits = Arc::new(AtomicU64::new(NO_DATA.to_bits()));
        self.shared.windows.lock().push(Arc::downgrade(&peak_bits));
        PeakWindow { peak_bits }
    }

    /// Number of windows still open
    pub fn open_windows(&self) -> usize {
        self.shared
            .windows
            .lock()
            .iter()
            .filter(|window| window.strong_count() > 0)
            .count()
    }

    /// Most recent instantaneous reading, `NO_DATA` before the first sample.
    pub fn last_sample(&self) -> f64 {
        f64::from_bits(self.shared.last_bits.load(Ordering::Relaxed))
    }

    pub fn sample_count(&self) -> u64 {
        self.shared.samples.load(Ordering::Relaxed)
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sampling_loop<C: CpuClock>(
    shared: Arc<SamplerShared>,
    mut clock: C,
    baseline: CpuTimes,
    interval: Duration,
) {
    let mut previous = baseline;
    while !shared.stop.load(Ordering::Acquire) {
        std::thread::sleep(interval);
        let Some(current) = clock.read() else {
            continue;
        };
        if let Some(percent) = utilisation(previous, current) {
            shared.record(percent);
        }
        previous = current;
    }
}

/// One consumer's view of a `ResourceMonitor`.
///
/// Each engine role opens its own window per round, so roles running at the
/// same time all see the full CPU peak of their round.
pub struct ResourceWindow {
    cpu: PeakWindow,
    memory: Arc<dyn MemoryProbe>,
}

impl ResourceWindow {
    /// Read this window's CPU peak and the allocator counters.
    pub fn snapshot(&self) -> ResourceSample {
        let stats = self.memory.stats();
        ResourceSample {
            cpu_peak_percent: self.cpu.read_peak_and_reset(),
            memory_peak_kb: stats.peak_bytes / 1024,
            memory_current_kb: stats.current_bytes / 1024,
            alloc_count: stats.alloc_count,
            dealloc_count: stats.dealloc_count,
            current_block_count: stats.current_blocks,
        }
    }
}

/// CPU sampler plus allocator probe, snapshotted at round boundaries.
pub struct ResourceMonitor {
    sampler: ResourceSampler,
    memory: Arc<dyn MemoryProbe>,
}

impl ResourceMonitor {
    /// Start a monitor on the process CPU clock.
    ///
    /// If the counters are unavailable the monitor still works and reports
    /// `NO_DATA` for CPU.
    pub fn start(memory: Arc<dyn MemoryProbe>, interval: Duration) -> Self {
        let monitor = Self {
            sampler: ResourceSampler::new(interval),
            memory,
        };
        match ProcessCpuClock::open() {
            Ok(clock) => {
                if let Err(e) = monitor.sampler.initialize(clock) {
                    warn!("CPU sampling disabled: {}", e);
                }
            }
            Err(e) => warn!("CPU sampling disabled: {}", e),
        }
        monitor
    }

    /// Start a monitor on a caller-supplied clock.
    pub fn with_clock<C: CpuClock>(
        memory: Arc<dyn MemoryProbe>,
        interval: Duration,
        clock: C,
    ) -> Self {
        let monitor = Self {
            sampler: ResourceSampler::new(interval),
            memory,
        };
        if let Err(e) = monitor.sampler.initialize(clock) {
            warn!("CPU sampling disabled: {}", e);
        }
        monitor
    }

    pub fn sampler(&self) -> &ResourceSampler {
        &self.sampler
    }

    /// Open a private observation window for one consumer.
    pub fn open_window(&self) -> ResourceWindow {
        ResourceWindow {
            cpu: self.sampler.open_window(),
            memory: Arc::clone(&self.memory),
        }
    }

    pub fn shutdown(&self) {
        self.sampler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStats, NoMemoryProbe};
    use std::time::Instant;

    /// Clock that advances the process counter by a fixed share of system time.
    struct FixedShareClock {
        share_percent: u64,
        ticks: u64,
    }

    impl CpuClock for FixedShareClock {
        fn read(&mut self) -> Option<CpuTimes> {
            self.ticks += 1;
            Some(CpuTimes {
                process: self.ticks * self.share_percent * 10,
                system: self.ticks * 1000,
            })
        }
    }

    struct BrokenClock;

    impl CpuClock for BrokenClock {
        fn read(&mut self) -> Option<CpuTimes> {
            None
        }
    }

    struct FixedProbe;

    impl MemoryProbe for FixedProbe {
        fn stats(&self) -> MemoryStats {
            MemoryStats {
                peak_bytes: 4096,
                current_bytes: 2048,
                alloc_count: 10,
                dealloc_count: 4,
                current_blocks: 6,
            }
        }
    }

    fn wait_for_samples(sampler: &ResourceSampler, count: u64) {
        let start = Instant::now();
        while sampler.sample_count() < count && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_consecutive_reads_return_peak_then_sentinel() {
        let sampler = ResourceSampler::new(Duration::from_millis(10));
        sampler.shared.record(12.5);
        sampler.shared.record(40.0);
        sampler.shared.record(3.0);

        assert_eq!(sampler.read_peak_and_reset(), 40.0);
        assert_eq!(sampler.read_peak_and_reset(), NO_DATA);
        assert_eq!(sampler.last_sample(), 3.0);
    }

    #[test]
    fn test_raise_peak_only_increases() {
        let peak = AtomicU64::new(NO_DATA.to_bits());
        assert!(raise_peak(&peak, 0.0));
        assert!(raise_peak(&peak, 10.0));
        assert!(!raise_peak(&peak, 5.0));
        assert!(!raise_peak(&peak, 10.0));
        assert_eq!(f64::from_bits(peak.load(Ordering::Relaxed)), 10.0);
    }

    #[test]
    fn test_raise_peak_under_contention_keeps_maximum() {
        let peak = Arc::new(AtomicU64::new(NO_DATA.to_bits()));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        raise_peak(&peak, (i * 8 + t) as f64);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(f64::from_bits(peak.load(Ordering::Relaxed)), 7999.0);
    }

    #[test]
    fn test_running_sampler_reports_share() {
        let sampler = ResourceSampler::new(Duration::from_millis(5));
        assert_eq!(sampler.state(), SamplerState::Uninitialized);
        sampler
            .initialize(FixedShareClock {
                share_percent: 25,
                ticks: 0,
            })
            .unwrap();
        assert_eq!(sampler.state(), SamplerState::Running);

        wait_for_samples(&sampler, 3);
        let peak = sampler.read_peak_and_reset();
        assert!((peak - 25.0).abs() < 1e-9, "peak was {}", peak);

        sampler.shutdown();
        assert_eq!(sampler.state(), SamplerState::Stopped);
        // Window may hold one last sample taken before the stop flag was seen.
        sampler.read_peak_and_reset();
        assert_eq!(sampler.read_peak_and_reset(), NO_DATA);
    }

    #[test]
    fn test_windows_do_not_steal_each_others_peak() {
        let sampler = ResourceSampler::new(Duration::from_millis(10));
        let first = sampler.open_window();
        let second = sampler.open_window();
        sampler.shared.record(30.0);
        sampler.shared.record(55.0);

        assert_eq!(first.read_peak_and_reset(), 55.0);
        // The first read leaves the second window and the sampler's own peak intact.
        assert_eq!(second.read_peak_and_reset(), 55.0);
        assert_eq!(sampler.read_peak_and_reset(), 55.0);
        assert_eq!(first.read_peak_and_reset(), NO_DATA);

        sampler.shared.record(10.0);
        assert_eq!(second.read_peak_and_reset(), 10.0);
        assert_eq!(first.read_peak_and_reset(), 10.0);
    }

    #[test]
    fn test_dropped_window_is_pruned() {
        let sampler = ResourceSampler::new(Duration::from_millis(10));
        let kept = sampler.open_window();
        let dropped = sampler.open_window();
        assert_eq!(sampler.open_windows(), 2);
        drop(dropped);
        assert_eq!(sampler.open_windows(), 1);
        sampler.shared.record(5.0);
        assert_eq!(sampler.shared.windows.lock().len(), 1);
        assert_eq!(kept.read_peak_and_reset(), 5.0);
    }

    #[test]
    fn test_monitor_windows_share_a_running_sampler() {
        let monitor = ResourceMonitor::with_clock(
            Arc::new(FixedProbe),
            Duration::from_millis(5),
            FixedShareClock {
                share_percent: 50,
                ticks: 0,
            },
        );
        let publisher = monitor.open_window();
        let subscriber = monitor.open_window();
        let baseline = monitor.sampler().sample_count();
        wait_for_samples(monitor.sampler(), baseline + 3);

        let first = subscriber.snapshot();
        let second = publisher.snapshot();
        assert!((first.cpu_peak_percent - 50.0).abs() < 1e-9);
        assert!((second.cpu_peak_percent - 50.0).abs() < 1e-9);
        assert_eq!(second.memory_current_kb, 2);
        monitor.shutdown();
    }

    #[test]
    fn test_initialize_fails_without_counters() {
        let sampler = ResourceSampler::new(Duration::from_millis(5));
        assert!(sampler.initialize(BrokenClock).is_err());
        assert_eq!(sampler.state(), SamplerState::Uninitialized);
    }

    #[test]
    fn test_stopped_sampler_cannot_restart() {
        let sampler = ResourceSampler::new(Duration::from_millis(5));
        sampler
            .initialize(FixedShareClock {
                share_percent: 10,
                ticks: 0,
            })
            .unwrap();
        sampler.shutdown();
        assert!(sampler
            .initialize(FixedShareClock {
                share_percent: 10,
                ticks: 0,
            })
            .is_err());
    }

    #[test]
    fn test_utilisation_ignores_stalled_system_clock() {
        let a = CpuTimes {
            process: 10,
            system: 100,
        };
        assert_eq!(utilisation(a, a), None);
        let b = CpuTimes {
            process: 60,
            system: 200,
        };
        assert_eq!(utilisation(a, b), Some(50.0));
    }

    #[test]
    fn test_monitor_degrades_without_cpu_counters() {
        let monitor =
            ResourceMonitor::with_clock(Arc::new(FixedProbe), Duration::from_millis(5), BrokenClock);
        let sample = monitor.open_window().snapshot();
        assert_eq!(sample.cpu_peak_percent, NO_DATA);
        assert_eq!(sample.memory_peak_kb, 4);
        assert_eq!(sample.memory_current_kb, 2);
        assert_eq!(sample.alloc_count, 10);
        assert_eq!(sample.dealloc_count, 4);
        assert_eq!(sample.current_block_count, 6);
    }

    #[test]
    fn test_process_clock_monitor_starts() {
        let monitor = ResourceMonitor::start(Arc::new(NoMemoryProbe), Duration::from_millis(10));
        #[cfg(unix)]
        assert_eq!(monitor.sampler().state(), SamplerState::Running);
        monitor.shutdown();
        assert_ne!(monitor.sampler().state(), SamplerState::Running);
    }
}
