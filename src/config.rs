//! Session timing, loadable from a JSON file. Every field has a default, so a
//! file only needs to name what it changes.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::power::DEFAULT_RAIL_MV;
use crate::receiver::{DEFAULT_DRAIN_ATTEMPTS, DEFAULT_DRAIN_QUIET};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time the module is held unpowered before startup.
    pub settle_ms: u64,
    /// How long startup waits for the sign-on message.
    pub sign_on_timeout_ms: u64,
    /// Receive window for status and other expected replies.
    pub status_timeout_ms: u64,
    pub drain_attempts: usize,
    pub drain_quiet_us: u64,
    /// Output voltage of the analog power rails.
    pub rail_mv: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_ms: 250,
            sign_on_timeout_ms: 5_000,
            status_timeout_ms: 1_000,
            drain_attempts: DEFAULT_DRAIN_ATTEMPTS,
            drain_quiet_us: DEFAULT_DRAIN_QUIET.as_micros() as u64,
            rail_mv: DEFAULT_RAIL_MV,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Loading session config from {:?}", path);
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn sign_on_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_on_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn drain_quiet(&self) -> Duration {
        Duration::from_micros(self.drain_quiet_us)
    }
}
