//! Protocol tunables. Hosts deserialize these from their config file or use the defaults.

use std::time::Duration;

use serde::Deserialize;

/// How long a reliable message waits for its ACK before it is resent.
pub const DEFAULT_RESEND_TIMEOUT_MS: u64 = 2_000;
/// Resends of one reliable message before it is reported as undeliverable.
pub const DEFAULT_MAX_RESENDS: u32 = 3;
/// Interval between keepalive StartPingCheck messages.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;
/// Reliable sequence numbers remembered for duplicate suppression.
pub const DEFAULT_RECEIVED_WINDOW: usize = 4_096;
/// Consecutive socket send errors before the circuit is dropped.
pub const DEFAULT_MAX_SEND_FAILURES: u32 = 5;
/// Bytes pulled from an HTTP response per `update`.
pub const DEFAULT_CHUNK_SIZE: usize = 4_096;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Reliable-transport settings for `NetMessageManager`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(default = "default_resend_timeout_ms")]
    pub resend_timeout_ms: u64,
    #[serde(default = "default_max_resends")]
    pub max_resends: u32,
    /// 0 disables keepalive pings.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_received_window")]
    pub received_window: usize,
    #[serde(default = "default_max_send_failures")]
    pub max_send_failures: u32,
}

fn default_resend_timeout_ms() -> u64 {
    DEFAULT_RESEND_TIMEOUT_MS
}
fn default_max_resends() -> u32 {
    DEFAULT_MAX_RESENDS
}
fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}
fn default_received_window() -> usize {
    DEFAULT_RECEIVED_WINDOW
}
fn default_max_send_failures() -> u32 {
    DEFAULT_MAX_SEND_FAILURES
}

impl ManagerConfig {
    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            resend_timeout_ms: default_resend_timeout_ms(),
            max_resends: default_max_resends(),
            ping_interval_ms: default_ping_interval_ms(),
            received_window: default_received_window(),
            max_send_failures: default_max_send_failures(),
        }
    }
}

/// Settings shared by asset transfers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetTransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Limit on connecting and on each socket read. A download that keeps
    /// making progress may take longer than this in total.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

impl AssetTransferConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl Default for AssetTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_interval_zero_disables() {
        let cfg = ManagerConfig {
            ping_interval_ms: 0,
            ..ManagerConfig::default()
        };
        assert_eq!(cfg.ping_interval(), None);
        assert_eq!(
            ManagerConfig::default().ping_interval(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn defaults_match_constants() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.resend_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.max_resends, 3);
        assert_eq!(AssetTransferConfig::default().chunk_size, 4096);
    }
}
