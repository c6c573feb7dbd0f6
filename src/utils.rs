//! # Utility Functions
//!
//! Clock helpers, human-readable formatters, and parameter validation shared by
//! the engines, the results report, and the command line front end.
//!
//! ```rust
//! use pubsub_bench::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_rate(1048576.0), "1.00 MB/s");
//!
//! validate_size_range(64, 1024)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

/// Largest payload a round may request.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Generate a unique identifier for a benchmark run
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Microseconds on the system monotonic clock.
///
/// Both ends of a latency exchange stamp and compare against this clock, so it
/// must be shared by every process on the host. Never returns zero.
#[cfg(unix)]
pub fn monotonic_micros() -> u64 {
    use nix::time::{clock_gettime, ClockId};

    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000).max(1),
        Err(_) => fallback_micros(),
    }
}

#[cfg(not(unix))]
pub fn monotonic_micros() -> u64 {
    fallback_micros()
}

/// Process-local monotonic microseconds, offset by one so zero is never seen.
fn fallback_micros() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_micros() as u64 + 1
}

/// Format a duration in a human-readable way
///
/// Picks the unit by magnitude: nanoseconds, microseconds, milliseconds and
/// seconds with two decimals, then whole minutes and hours.
///
/// ```rust
/// # use pubsub_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        if minutes < 60 {
            format!("{}m {}s", minutes, seconds % 60)
        } else {
            format!("{}h {}m {}s", minutes / 60, minutes % 60, seconds % 60)
        }
    }
}

/// Format a microsecond latency figure
pub fn format_micros(us: f64) -> String {
    if !us.is_finite() || us < 0.0 {
        return "n/a".to_string();
    }
    format_duration(Duration::from_nanos((us * 1_000.0) as u64))
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a byte rate
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format a packet rate with K/M suffixes
pub fn format_packet_rate(packets_per_second: f64) -> String {
    if packets_per_second < 1_000.0 {
        format!("{:.0} pkt/s", packets_per_second)
    } else if packets_per_second < 1_000_000.0 {
        format!("{:.1}K pkt/s", packets_per_second / 1_000.0)
    } else {
        format!("{:.2}M pkt/s", packets_per_second / 1_000_000.0)
    }
}

/// Format a CPU peak, rendering the no-data sentinel explicitly
pub fn format_cpu(percent: f64) -> String {
    if percent < 0.0 {
        "n/a".to_string()
    } else {
        format!("{:.1}%", percent)
    }
}

/// Validate a payload size range.
///
/// Both bounds must be non-zero, ordered, and no larger than 16MB.
pub fn validate_size_range(min_size: usize, max_size: usize) -> Result<()> {
    if min_size == 0 {
        anyhow::bail!("Minimum payload size cannot be zero");
    }
    if min_size > max_size {
        anyhow::bail!(
            "Minimum payload size {} exceeds maximum {}",
            min_size,
            max_size
        );
    }
    if max_size > MAX_PAYLOAD_SIZE {
        anyhow::bail!("Payload size {} is too large (maximum 16MB)", max_size);
    }
    Ok(())
}

/// Validate a progress log cadence. Zero disables progress logging.
pub fn validate_print_gap(gap: i64) -> Result<u64> {
    if gap < 0 {
        anyhow::bail!("Print gap cannot be negative (got {})", gap);
    }
    Ok(gap as u64)
}

/// Validate an injected loss percentage
pub fn validate_loss_percent(percent: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&percent) {
        anyhow::bail!("Loss percentage {} must be between 0 and 100", percent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_millis(25)), "25.00ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.00s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_micros() {
        assert_eq!(format_micros(2.5), "2.50μs");
        assert_eq!(format_micros(4000.0), "4.00ms");
        assert_eq!(format_micros(-1.0), "n/a");
    }

    #[test]
    fn test_format_bytes_and_rates() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.50 KB");
        assert_eq!(format_rate(1048576.0), "1.00 MB/s");
        assert_eq!(format_packet_rate(500.0), "500 pkt/s");
        assert_eq!(format_packet_rate(12_500.0), "12.5K pkt/s");
        assert_eq!(format_packet_rate(2_000_000.0), "2.00M pkt/s");
    }

    #[test]
    fn test_format_cpu() {
        assert_eq!(format_cpu(-1.0), "n/a");
        assert_eq!(format_cpu(12.34), "12.3%");
    }

    #[test]
    fn test_validate_size_range() {
        assert!(validate_size_range(64, 64).is_ok());
        assert!(validate_size_range(1, 1024).is_ok());
        assert!(validate_size_range(0, 10).is_err());
        assert!(validate_size_range(100, 10).is_err());
        assert!(validate_size_range(1, MAX_PAYLOAD_SIZE + 1).is_err());
    }

    #[test]
    fn test_validate_print_gap() {
        assert_eq!(validate_print_gap(0).unwrap(), 0);
        assert_eq!(validate_print_gap(100).unwrap(), 100);
        assert!(validate_print_gap(-1).is_err());
    }

    #[test]
    fn test_validate_loss_percent() {
        assert!(validate_loss_percent(0.0).is_ok());
        assert!(validate_loss_percent(100.0).is_ok());
        assert!(validate_loss_percent(-0.5).is_err());
        assert!(validate_loss_percent(f64::NAN).is_err());
    }

    #[test]
    fn test_monotonic_micros_advances() {
        let a = monotonic_micros();
        std::thread::sleep(Duration::from_millis(2));
        let b = monotonic_micros();
        assert!(a > 0);
        assert!(b >= a + 1_000);
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
