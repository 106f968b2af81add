//! TCP keep-alive configuration.

use serde::Deserialize;
use socket2::{Socket, TcpKeepalive};
use std::io;
use std::time::Duration;

/// Keep-alive probing parameters applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KeepAliveConfig {
    /// Seconds of idleness before the first probe.
    #[serde(default = "default_idle")]
    pub idle: u32,
    /// Seconds between probes.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Unanswered probes before the connection is dropped.
    #[serde(default = "default_count")]
    pub count: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            idle: default_idle(),
            interval: default_interval(),
            count: default_count(),
        }
    }
}

fn default_idle() -> u32 {
    120
}

fn default_interval() -> u32 {
    3
}

fn default_count() -> u32 {
    5
}

impl KeepAliveConfig {
    pub fn new(idle: u32, interval: u32, count: u32) -> Self {
        Self {
            idle,
            interval,
            count,
        }
    }

    /// Reject values the kernel would refuse anyway.
    pub fn validate(&self) -> io::Result<()> {
        if self.idle == 0 || self.interval == 0 || self.count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "keep-alive values must be positive (idle={}, interval={}, count={})",
                    self.idle, self.interval, self.count
                ),
            ));
        }
        Ok(())
    }

    fn params(&self) -> TcpKeepalive {
        let params = TcpKeepalive::new()
            .with_time(Duration::from_secs(self.idle.into()))
            .with_interval(Duration::from_secs(self.interval.into()));

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
        ))]
        let params = params.with_retries(self.count);

        params
    }

    /// Enable keep-alive on `socket` with these parameters.
    pub fn apply(&self, socket: &Socket) -> io::Result<()> {
        self.validate()?;
        socket.set_keepalive(true)?;
        socket.set_tcp_keepalive(&self.params())
    }
}
