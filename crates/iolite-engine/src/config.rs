//! Engine configuration.

use std::time::Duration;

/// Configuration for the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Sessions with no bound channel and no activity for this long are
    /// evicted.
    pub idle_timeout: Duration,
    /// How often the eviction sweeper runs.
    pub sweep_interval: Duration,
    /// Bounded-channel buffer size for transports.
    pub channel_buffer: usize,
    /// Unacked deltas retained per session for reconnect replay.
    pub delta_log_cap: usize,
    /// How long a background task waits for the state lock before
    /// reporting `LockTimeout`. `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            channel_buffer: 64,
            delta_log_cap: 256,
            lock_timeout: None,
        }
    }
}

/// Builder for engine configuration.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn channel_buffer(mut self, size: usize) -> Self {
        self.config.channel_buffer = size;
        self
    }

    pub fn delta_log_cap(mut self, cap: usize) -> Self {
        self.config.delta_log_cap = cap;
        self
    }

    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
