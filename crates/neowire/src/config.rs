//! Connection configuration.
//!
//! Fixed when a connection is constructed. A zero duration disables the
//! timeout or ticker it controls.

use std::time::Duration;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;

/// How incoming requests reach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// The reactor awaits the handler before doing anything else.
    #[default]
    Inline,
    /// Each request runs on its own task and replies through the call queue.
    Spawn,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the reader -> reactor queue.
    pub incoming_buffer: usize,
    /// Capacity of the caller -> reactor and reactor -> writer queues.
    pub outgoing_buffer: usize,
    /// Ceiling on each read, and on silence from the peer.
    pub read_timeout: Duration,
    /// Ceiling on each write and ping.
    pub write_timeout: Duration,
    /// How long a call may wait for its reply.
    pub response_timeout: Duration,
    /// How often the reactor sweeps expired calls.
    pub cleanup_interval: Duration,
    /// How often the writer pings the peer.
    pub heartbeat_send_interval: Duration,
    /// How often the reactor checks for peer silence.
    pub heartbeat_check_interval: Duration,
    pub read_buffer_initial: usize,
    pub write_buffer_initial: usize,
    /// Ceiling on establishing a stream link.
    pub dial_timeout: Duration,
    pub dispatch: Dispatch,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            incoming_buffer: 64,
            outgoing_buffer: 64,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(1),
            heartbeat_send_interval: Duration::from_secs(10),
            heartbeat_check_interval: Duration::from_secs(5),
            read_buffer_initial: 4096,
            write_buffer_initial: 4096,
            dial_timeout: Duration::from_secs(10),
            dispatch: Dispatch::Inline,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffers(mut self, incoming: usize, outgoing: usize) -> Self {
        self.incoming_buffer = incoming;
        self.outgoing_buffer = outgoing;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Sets the ping period and the silence check period together.
    pub fn with_heartbeat(mut self, send: Duration, check: Duration) -> Self {
        self.heartbeat_send_interval = send;
        self.heartbeat_check_interval = check;
        self
    }

    pub fn with_buffer_hints(mut self, read: usize, write: usize) -> Self {
        self.read_buffer_initial = read;
        self.write_buffer_initial = write;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.incoming_buffer == 0 {
            return Err(invalid("incoming_buffer must be at least 1"));
        }
        if self.outgoing_buffer == 0 {
            return Err(invalid("outgoing_buffer must be at least 1"));
        }
        if !self.heartbeat_send_interval.is_zero()
            && !self.read_timeout.is_zero()
            && self.heartbeat_send_interval >= self.read_timeout
        {
            return Err(invalid("heartbeat_send_interval must be shorter than read_timeout"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    Error::new(ErrorKind::InvalidConfig(msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_buffers_rejected() {
        let config = ConnectionConfig::default().with_buffers(0, 8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_undercut_read_timeout() {
        let config = ConnectionConfig::default()
            .with_read_timeout(Duration::from_secs(1))
            .with_heartbeat(Duration::from_secs(2), Duration::from_millis(500));
        assert!(config.validate().is_err());

        let disabled = config.with_heartbeat(Duration::ZERO, Duration::ZERO);
        assert!(disabled.validate().is_ok());
    }
}
