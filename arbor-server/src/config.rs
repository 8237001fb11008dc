use serde::Deserialize;
use std::time::Duration;

use crate::api::codec::MAX_FRAME_LENGTH;

/// Server configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default container grace time, applied when a create request does not
    /// carry one.
    #[serde(with = "humantime_serde", default = "default_grace_time")]
    pub grace_time: Duration,
    /// Maximum accepted frame length. Must be at least 16 MiB to stay
    /// interoperable.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            grace_time: default_grace_time(),
            max_frame_length: default_max_frame_length(),
        }
    }
}

impl Config {
    pub fn with_grace_time(grace_time: Duration) -> Config {
        Config {
            grace_time,
            ..Default::default()
        }
    }
}

const fn default_grace_time() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_max_frame_length() -> usize {
    MAX_FRAME_LENGTH
}
