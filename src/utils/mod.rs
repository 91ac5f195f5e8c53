//! Utilities module for logging, metrics, TensorBoard output and errors
//!
//! This module provides:
//! - Structured logging with tracing
//! - Epoch meters and the final confusion-matrix report
//! - TensorBoard event writing
//! - Error handling types

pub mod error;
pub mod logging;
pub mod metrics;
pub mod tensorboard;

// Re-export main types for convenience
pub use error::{Result, XrayError};
pub use logging::{init_logging, LogConfig};
pub use metrics::{ConfusionMatrix, EpochMeter, ValidationReport};
pub use tensorboard::EventWriter;

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.5), "30.5s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m");
    }
}
