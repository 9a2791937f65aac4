//! Frame hub configuration types.
//!
//! [`FrameHubConfig`] is a plain struct: the host binary fills it from the
//! TOML config file and CLI flags, tests build it directly.

use std::net::{Ipv4Addr, SocketAddr};

/// Default HTTP port of the frame hub.
pub const DEFAULT_PORT: u16 = 9090;

/// All runtime configuration for the frame hub.
///
/// # Example
///
/// ```rust
/// use maix_frame_hub::domain::FrameHubConfig;
///
/// let cfg = FrameHubConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 9090);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHubConfig {
    /// Address the HTTP server binds to.  `0.0.0.0` serves the whole LAN.
    pub bind_addr: SocketAddr,

    /// Frames a push subscriber may fall behind before it starts skipping.
    pub push_buffer: usize,
}

impl Default for FrameHubConfig {
    /// | Field         | Default        |
    /// |---------------|----------------|
    /// | bind_addr     | `0.0.0.0:9090` |
    /// | push_buffer   | 16             |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            push_buffer: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_is_9090() {
        // Arrange / Act
        let cfg = FrameHubConfig::default();
        // Assert
        assert_eq!(cfg.bind_addr.port(), 9090);
        assert!(cfg.bind_addr.ip().is_unspecified());
    }

    #[test]
    fn test_default_push_buffer_is_non_zero() {
        // tokio channels panic on a zero capacity.
        let cfg = FrameHubConfig::default();
        assert!(cfg.push_buffer > 0);
    }
}
