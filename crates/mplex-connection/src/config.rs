//! Multiplexer configuration

use crate::error::{ConnectionError, ConnectionResult};
use mplex_proto::DEFAULT_MAX_PAYLOAD_SIZE;

/// Tuning parameters for a multiplexed connection.
///
/// None of these are part of the wire contract; both peers may use
/// different values as long as each peer's `max_frame_size` fits within the
/// other's `max_payload_size`.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest MESSAGE payload produced by a single `write` chunk
    pub max_frame_size: usize,

    /// Largest inbound payload accepted by the decoder
    pub max_payload_size: usize,

    /// Buffered bytes on one stream above which the reader pauses
    pub high_water_mark: usize,

    /// Buffered bytes at which a paused reader resumes
    pub low_water_mark: usize,

    /// Outbound MESSAGE bytes that may be queued ahead of the transport
    pub write_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            high_water_mark: 256 * 1024,
            low_water_mark: 64 * 1024,
            write_backlog: 1024 * 1024,
        }
    }
}

impl MuxConfig {
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set both buffering marks
    pub fn with_water_marks(mut self, low: usize, high: usize) -> Self {
        self.low_water_mark = low;
        self.high_water_mark = high;
        self
    }

    pub fn with_write_backlog(mut self, bytes: usize) -> Self {
        self.write_backlog = bytes;
        self
    }

    pub fn validate(&self) -> ConnectionResult<()> {
        let nonzero = [
            ("max_frame_size", self.max_frame_size),
            ("max_payload_size", self.max_payload_size),
            ("high_water_mark", self.high_water_mark),
            ("write_backlog", self.write_backlog),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConnectionError::Configuration(format!(
                    "{} must be > 0",
                    name
                )));
            }
        }

        if self.max_frame_size > self.max_payload_size {
            return Err(ConnectionError::Configuration(
                "max_frame_size must not exceed max_payload_size".to_string(),
            ));
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(ConnectionError::Configuration(
                "low_water_mark must be below high_water_mark".to_string(),
            ));
        }
        if self.max_frame_size > self.write_backlog {
            return Err(ConnectionError::Configuration(
                "max_frame_size must not exceed write_backlog".to_string(),
            ));
        }
        // write permits are acquired per chunk as u32
        if self.max_frame_size > u32::MAX as usize
            || self.write_backlog > tokio::sync::Semaphore::MAX_PERMITS
        {
            return Err(ConnectionError::Configuration(
                "write_backlog or max_frame_size out of range".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MuxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_payload_size, 1024 * 1024);
    }

    #[test]
    fn test_water_marks_validation() {
        let config = MuxConfig::default().with_water_marks(128, 128);
        assert!(matches!(
            config.validate(),
            Err(ConnectionError::Configuration(_))
        ));

        let config = MuxConfig::default().with_water_marks(0, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_size_validation() {
        let config = MuxConfig::default()
            .with_max_payload_size(1024)
            .with_max_frame_size(2048);
        assert!(config.validate().is_err());

        let config = MuxConfig::default()
            .with_max_frame_size(4096)
            .with_write_backlog(1024);
        assert!(config.validate().is_err());

        let config = MuxConfig::default().with_max_frame_size(0);
        assert!(config.validate().is_err());
    }
}
