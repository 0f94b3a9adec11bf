//! RAII timing for request handlers.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_util::timing::TimingGuard;
//!
//! async fn call_tool(name: &str) {
//!     let _timing = TimingGuard::tool(name);
//!     // Duration is logged when _timing is dropped
//! }
//! ```

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Logs the duration of an operation when dropped.
pub struct TimingGuard {
    kind: &'static str,
    name: String,
    start: Instant,
    info_threshold: Duration,
    warn_threshold: Duration,
}

impl TimingGuard {
    pub fn new(kind: &'static str, name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(kind, name = %name, "Starting operation");
        Self {
            kind,
            name,
            start: Instant::now(),
            info_threshold: Duration::from_millis(100),
            warn_threshold: Duration::from_secs(5),
        }
    }

    /// Time an inbound request by method name.
    pub fn request(method: impl Into<String>) -> Self {
        Self::new("request", method)
    }

    /// Time a single tool invocation.
    pub fn tool(name: impl Into<String>) -> Self {
        Self::new("tool", name)
    }

    pub fn with_info_threshold(mut self, threshold: Duration) -> Self {
        self.info_threshold = threshold;
        self
    }

    pub fn with_warn_threshold(mut self, threshold: Duration) -> Self {
        self.warn_threshold = threshold;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.2}s", ms as f64 / 1000.0)
    } else {
        format!("{}m {:.1}s", ms / 60_000, (ms % 60_000) as f64 / 1000.0)
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let duration = format_duration(elapsed);
        let duration_ms = elapsed.as_millis() as u64;

        if elapsed >= self.warn_threshold {
            warn!(kind = self.kind, name = %self.name, duration_ms, %duration, "Slow operation completed");
        } else if elapsed >= self.info_threshold {
            info!(kind = self.kind, name = %self.name, duration_ms, %duration, "Operation completed");
        } else {
            debug!(kind = self.kind, name = %self.name, duration_ms, %duration, "Operation completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_timing_guard_elapsed() {
        let guard = TimingGuard::request("tools/call");
        sleep(Duration::from_millis(10));
        assert!(guard.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_timing_guard_thresholds() {
        let guard = TimingGuard::tool("echo")
            .with_info_threshold(Duration::from_millis(1))
            .with_warn_threshold(Duration::from_millis(2));
        sleep(Duration::from_millis(3));
        drop(guard);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_millis(61_000)), "1m 1.0s");
    }
}
