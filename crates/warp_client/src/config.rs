//! Client and per-host configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WarpError;

/// Options applied to every host the client connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    /// Credentials sent in an `@auth` request whenever the host connects.
    pub credentials: Option<Value>,

    /// How long a downlink stays linked after its last view detaches.
    /// `None` unlinks immediately. Serialized as signed milliseconds where a
    /// negative value means immediate.
    #[serde(with = "unlink_delay_serde")]
    pub unlink_delay: Option<Duration>,

    /// Upper bound on the reconnect backoff.
    #[serde(with = "duration_ms_serde")]
    pub max_reconnect_timeout: Duration,

    /// How long an unneeded connection may sit without traffic before it is
    /// closed.
    #[serde(with = "duration_ms_serde")]
    pub idle_timeout: Duration,

    /// Maximum number of commands buffered while disconnected.
    pub send_buffer_size: usize,

    /// Keep the connection (and the host entry) alive with no downlinks.
    pub keep_open: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            unlink_delay: Some(Duration::ZERO),
            max_reconnect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1),
            send_buffer_size: 1024,
            keep_open: false,
        }
    }
}

/// Configuration for a [`WarpClient`](crate::WarpClient) or
/// [`DownlinkContext`](crate::DownlinkContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Options for every host.
    pub host: HostOptions,
    /// Initial value of the process-level online flag.
    pub online: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: HostOptions::default(),
            online: true,
        }
    }
}

impl ClientConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), WarpError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<ClientConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(dur.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

mod unlink_delay_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match delay {
            Some(dur) => s.serialize_i64(i64::try_from(dur.as_millis()).unwrap_or(i64::MAX)),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<i64>::deserialize(d)?;
        Ok(millis
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
