//! Process-wide timeout and retry defaults
//!
//! `Timeouts` is the single table of defaults every option bundle starts from.
//! A process-wide instance is available through [`Timeouts::global`]; servers
//! and clients may instead be handed their own instance so tests never share
//! mutable state.

use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Keep-alive period applied to accepted TCP connections
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(180);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_RETRIES: u32 = 1;
/// Idle TTL for streams and sessions
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

lazy_static! {
    static ref GLOBAL_TIMEOUTS: RwLock<Timeouts> = RwLock::new(Timeouts::default());
}

/// Timeout and retry table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "secs")]
    pub keep_alive: Duration,
    #[serde(with = "secs")]
    pub dial: Duration,
    #[serde(with = "secs")]
    pub handshake: Duration,
    #[serde(with = "secs")]
    pub connect: Duration,
    #[serde(with = "secs")]
    pub read: Duration,
    #[serde(with = "secs")]
    pub write: Duration,
    #[serde(with = "secs")]
    pub ping: Duration,
    pub ping_retries: u32,
    #[serde(with = "secs")]
    pub ttl: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            dial: DEFAULT_DIAL_TIMEOUT,
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
            write: DEFAULT_WRITE_TIMEOUT,
            ping: DEFAULT_PING_INTERVAL,
            ping_retries: DEFAULT_PING_RETRIES,
            ttl: DEFAULT_TTL,
        }
    }
}

impl Timeouts {
    /// Snapshot of the process-wide table
    pub fn global() -> Timeouts {
        GLOBAL_TIMEOUTS.read().clone()
    }

    /// Replace the process-wide table.
    ///
    /// Only affects bundles defaulted afterwards; bundles already built keep
    /// their values.
    pub fn set_global(timeouts: Timeouts) {
        *GLOBAL_TIMEOUTS.write() = timeouts;
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Timeouts::default();
        assert_eq!(t.keep_alive, Duration::from_secs(180));
        assert_eq!(t.dial, Duration::from_secs(5));
        assert_eq!(t.handshake, Duration::from_secs(5));
        assert_eq!(t.connect, Duration::from_secs(5));
        assert_eq!(t.read, Duration::from_secs(10));
        assert_eq!(t.write, Duration::from_secs(10));
        assert_eq!(t.ping, Duration::from_secs(30));
        assert_eq!(t.ping_retries, 1);
        assert_eq!(t.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_set_global() {
        // only fields no other test reads through a default bundle
        let custom = Timeouts {
            ttl: Duration::from_secs(61),
            ping_retries: 3,
            ..Timeouts::default()
        };
        Timeouts::set_global(custom.clone());
        assert_eq!(Timeouts::global(), custom);

        let relay = crate::transport::RelayLimits::default();
        let mux = crate::session::MuxConfig::default();
        Timeouts::set_global(Timeouts::default());

        assert_eq!(relay.idle, Duration::from_secs(61));
        assert_eq!(mux.ping_retries, 3);
        assert_eq!(crate::session::MuxConfig::default().ping_retries, 1);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let t: Timeouts = serde_json::from_str(r#"{"dial": 3, "ping_retries": 4}"#).unwrap();
        assert_eq!(t.dial, Duration::from_secs(3));
        assert_eq!(t.ping_retries, 4);
        assert_eq!(t.connect, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(t.keep_alive, DEFAULT_KEEP_ALIVE);
    }

    #[test]
    fn test_serialize_as_seconds() {
        let json = serde_json::to_value(Timeouts::default()).unwrap();
        assert_eq!(json["keep_alive"], 180);
        assert_eq!(json["ttl"], 60);
    }
}
