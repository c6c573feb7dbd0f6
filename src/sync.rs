//! Round synchronization primitives.
//!
//! - `wait_for_peer_match` polls a writer or reader until the transport
//!   reports a matched peer.
//! - `ReconnectDetector` turns matched-count notifications into an
//!   edge-triggered "peer came back" signal.
//! - `RoundSignal` is the end-of-round latch set from a delivery callback and
//!   awaited by the round loop.
//! - `CancellationToken` lets the orchestrator abort any of these waits.

use crate::error::{BenchError, Result};
use crate::transport::{MatchListener, PacketReader, PacketWriter};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Granularity at which blocking waits re-check cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(50);

struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Cooperative cancellation shared between the orchestrator and the engines.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Cancel and wake every sleeper.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` if the token was cancelled before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_cancelled() {
                return false;
            }
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_cancelled();
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Endpoint whose matched-peer count gates a round.
#[derive(Clone, Copy)]
pub enum MatchHandle<'a> {
    Writer(&'a dyn PacketWriter),
    Reader(&'a dyn PacketReader),
}

impl MatchHandle<'_> {
    fn label(&self) -> &'static str {
        match self {
            MatchHandle::Writer(_) => "Writer",
            MatchHandle::Reader(_) => "Reader",
        }
    }

    fn channel(&self) -> &str {
        match self {
            MatchHandle::Writer(w) => w.channel(),
            MatchHandle::Reader(r) => r.channel(),
        }
    }

    fn matched_peers(&self) -> std::result::Result<u32, crate::error::TransportError> {
        match self {
            MatchHandle::Writer(w) => w.matched_peers(),
            MatchHandle::Reader(r) => r.matched_peers(),
        }
    }
}

/// Block until `handle` reports at least one matched peer.
///
/// Polls every `poll_interval`, logging the observed count on each attempt.
/// `timeout` of `None` waits until cancelled. Returns the matched count.
pub fn wait_for_peer_match(
    handle: MatchHandle<'_>,
    round: u32,
    poll_interval: Duration,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<u32> {
    let started = Instant::now();
    loop {
        let count = handle.matched_peers().map_err(|e| BenchError::PeerMatch {
            channel: handle.channel().to_string(),
            reason: e.to_string(),
        })?;
        info!("{} wait match({}/1) on '{}'", handle.label(), count, handle.channel());
        if count > 0 {
            return Ok(count);
        }

        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                return Err(BenchError::PeerMatch {
                    channel: handle.channel().to_string(),
                    reason: format!("no peer matched within {:?}", limit),
                });
            }
        }
        if !cancel.sleep(poll_interval) {
            return Err(BenchError::Cancelled { round });
        }
    }
}

#[derive(Debug, Default)]
struct ReconnectState {
    previous: u32,
    pending: u32,
}

/// Edge-triggered detector for a peer re-appearing.
///
/// Every 0 -> >0 transition of the matched count records one pending
/// reconnect, consumed by `wait_for_reconnect`. A transition back to zero
/// discards reconnects nobody waited for.
#[derive(Debug, Default)]
pub struct ReconnectDetector {
    state: Mutex<ReconnectState>,
    cond: Condvar,
}

impl ReconnectDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a matched-count notification. Returns true on a 0 -> >0 edge.
    pub fn on_match_changed(&self, current: u32) -> bool {
        let mut state = self.state.lock();
        let fired = state.previous == 0 && current > 0;
        if fired {
            state.pending += 1;
            debug!("Peer reconnected (0 -> {})", current);
            self.cond.notify_all();
        } else if current == 0 && state.previous > 0 {
            state.pending = 0;
            debug!("Peer lost ({} -> 0)", state.previous);
        }
        state.previous = current;
        fired
    }

    /// Wait up to `timeout` for a reconnect edge.
    pub fn wait_for_reconnect(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.pending == 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.pending > 0 {
            state.pending -= 1;
            true
        } else {
            false
        }
    }

    /// Last matched count seen
    pub fn previous_count(&self) -> u32 {
        self.state.lock().previous
    }

    /// Listener that forwards transport notifications to this detector.
    pub fn listener(self: &Arc<Self>) -> MatchListener {
        let detector = Arc::clone(self);
        Arc::new(move |count| {
            detector.on_match_changed(count);
        })
    }
}

/// One-shot end-of-round latch.
#[derive(Debug, Default)]
pub struct RoundSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl RoundSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch. Only the first call after a reset returns true.
    pub fn signal(&self) -> bool {
        let mut done = self.done.lock();
        if *done {
            return false;
        }
        *done = true;
        self.cond.notify_all();
        true
    }

    pub fn is_signalled(&self) -> bool {
        *self.done.lock()
    }

    pub fn reset(&self) {
        *self.done.lock() = false;
    }

    /// Block until signalled, cancelled, or `timeout` elapses.
    pub fn wait(
        &self,
        round: u32,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = self.done.lock();
        while !*done {
            if cancel.is_cancelled() {
                warn!("Round {} cancelled while waiting for END", round);
                return Err(BenchError::Cancelled { round });
            }
            let slice_end = Instant::now() + WAIT_SLICE;
            let wake = match deadline {
                Some(deadline) if deadline <= Instant::now() => {
                    return Err(BenchError::DeadlineExceeded {
                        round,
                        timeout: timeout.unwrap_or_default(),
                    });
                }
                Some(deadline) => deadline.min(slice_end),
                None => slice_end,
            };
            self.cond.wait_until(&mut done, wake);
        }
        Ok(())
    }
}
