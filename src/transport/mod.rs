//! Transport seam.
//!
//! The engines talk to the publish/subscribe layer only through these traits:
//! a writer that publishes payloads and reports how many readers it is
//! matched with, and a reader that delivers payloads to a listener on the
//! transport's own delivery thread. `LoopbackTransport` is the in-process
//! implementation used by the binary and the tests.

use crate::error::TransportError;
use std::sync::Arc;
use std::time::Duration;

pub mod loopback;

pub use loopback::{LoopbackConfig, LoopbackTransport};

/// Metadata delivered alongside each payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// False for lifecycle notifications that carry no sample
    pub valid_data: bool,
}

/// Callback invoked on the delivery thread for every received payload.
pub type DataListener = Arc<dyn Fn(&[u8], &DeliveryInfo) + Send + Sync>;

/// Callback invoked whenever the matched-peer count changes.
pub type MatchListener = Arc<dyn Fn(u32) + Send + Sync>;

/// Publishing end of a named channel
pub trait PacketWriter: Send + Sync {
    fn channel(&self) -> &str;

    /// Publish one payload
    fn write(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Block until every matched reader has taken all published payloads.
    ///
    /// Returns `false` if `timeout` expired first.
    fn wait_for_acknowledgments(&self, timeout: Duration) -> bool;

    /// Number of readers currently matched
    fn matched_peers(&self) -> Result<u32, TransportError>;

    /// Install the listener for matched-count changes, replacing any previous one
    fn set_match_listener(&self, listener: MatchListener);
}

/// Receiving end of a named channel
pub trait PacketReader: Send + Sync {
    fn channel(&self) -> &str;

    /// Number of writers currently matched
    fn matched_peers(&self) -> Result<u32, TransportError>;

    /// Install the listener for matched-count changes, replacing any previous one
    fn set_match_listener(&self, listener: MatchListener);
}

/// Factory for writers and readers
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_writer(&self, channel: &str) -> Result<Arc<dyn PacketWriter>, TransportError>;

    /// Create a reader whose listener is live before the reader is matched.
    fn create_reader(
        &self,
        channel: &str,
        listener: DataListener,
    ) -> Result<Arc<dyn PacketReader>, TransportError>;
}

/// Channel carrying latency probes for `base`
pub fn ping_channel(base: &str) -> String {
    format!("{}_ping", base)
}

/// Channel carrying latency replies for `base`
pub fn pong_channel(base: &str) -> String {
    format!("{}_pong", base)
}
