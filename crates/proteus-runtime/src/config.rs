//! Configuration types for the proteus runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeResult;

/// Bootstrap program evaluated in every new instance.
///
/// Evaluates to a function that receives the process object and returns the
/// module loader.
pub const DEFAULT_BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Filename reported for the embedded bootstrap.
pub const DEFAULT_BOOTSTRAP_FILENAME: &str = "proteus.js";

/// Process-wide runtime settings.
///
/// Built once by the embedder and handed to [`Runtime::new`](crate::Runtime::new).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Running inside the browser shell rather than a bare host.
    /// Default: true
    pub is_browser: bool,

    /// Application directory exposed to content.
    pub app_path: Option<PathBuf>,

    /// Download directory exposed to content.
    pub download_path: Option<PathBuf>,

    /// How long the background thread sleeps when nothing is in flight.
    /// Default: 10ms
    #[serde(with = "duration_ms")]
    pub idle_poll_interval: Duration,

    /// Capacity of the hand-off code channel.
    /// Default: 16
    pub handoff_capacity: usize,

    /// Worker threads of the reactor's I/O runtime.
    /// Default: number of CPUs, at most 4
    pub io_threads: usize,

    /// Completions dispatched per acknowledged round.
    /// Default: 10
    pub max_completions_per_round: usize,

    /// Bootstrap program source.
    pub bootstrap_source: String,

    /// Filename used when evaluating the bootstrap program.
    pub bootstrap_filename: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            is_browser: true,
            app_path: None,
            download_path: None,
            idle_poll_interval: Duration::from_millis(10),
            handoff_capacity: 16,
            io_threads: num_cpus::get().clamp(1, 4),
            max_completions_per_round: 10,
            bootstrap_source: DEFAULT_BOOTSTRAP.to_string(),
            bootstrap_filename: DEFAULT_BOOTSTRAP_FILENAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> RuntimeResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| crate::RuntimeError::invalid_argument(format!("config: {e}")))?;
        Ok(config.normalized())
    }

    /// Set whether the runtime is hosted by the browser shell.
    pub fn is_browser(mut self, is_browser: bool) -> Self {
        self.is_browser = is_browser;
        self
    }

    /// Set the application directory.
    pub fn app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.app_path = Some(path.into());
        self
    }

    /// Set the download directory.
    pub fn download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = Some(path.into());
        self
    }

    /// Set the idle poll interval.
    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Set the hand-off channel capacity.
    pub fn handoff_capacity(mut self, capacity: usize) -> Self {
        self.handoff_capacity = capacity;
        self
    }

    /// Set the reactor worker thread count.
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set the per-round completion limit.
    pub fn max_completions_per_round(mut self, max: usize) -> Self {
        self.max_completions_per_round = max;
        self
    }

    /// Replace the bootstrap program.
    pub fn bootstrap(mut self, source: impl Into<String>, filename: impl Into<String>) -> Self {
        self.bootstrap_source = source.into();
        self.bootstrap_filename = filename.into();
        self
    }

    /// Clamp zero values that would stall the runtime.
    pub(crate) fn normalized(mut self) -> Self {
        self.handoff_capacity = self.handoff_capacity.max(1);
        self.io_threads = self.io_threads.max(1);
        self.max_completions_per_round = self.max_completions_per_round.max(1);
        if self.idle_poll_interval.is_zero() {
            self.idle_poll_interval = Duration::from_millis(1);
        }
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
