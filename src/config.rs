use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Hard upper bound on the number of concurrent flows (and sink connections).
pub const MAX_FLOWS: u32 = 65535;

/// Largest payload a single flow may write in one cycle.
pub const MAX_PAYLOAD: u32 = MAX_FLOWS * 4;

/// Ethernet, IP and TCP header bytes subtracted when converting a wire bit
/// rate into a payload byte rate (26 + 20 + 20).
pub const FRAME_OVERHEAD_BYTES: u32 = 66;

/// How often cumulative stats are pushed to a control peer.
pub const STATS_PERIOD: Duration = Duration::from_secs(1);

/// Default window between two checkpoint evaluations.
pub const DEFAULT_CHECKPOINT_PERIOD: Duration = Duration::from_secs(5);

/// Default pause between two sink drain passes.
pub const DEFAULT_NAP: Duration = Duration::from_millis(50);

/// Default upper bound on bytes read from one sink connection per pass.
pub const DEFAULT_DRAIN_CHUNK: usize = 64 * 1024;

/// Converts a wire bit rate into payload bytes.
///
/// Bits are rounded up to whole bytes, then the per-frame header overhead is
/// removed. Anything that would leave zero or fewer payload bytes becomes 1.
///
/// # Examples
///
/// ```
/// use flowgen::config::bits_to_payload_bytes_ceil;
///
/// assert_eq!(bits_to_payload_bytes_ceil(8_000), 934);
/// assert_eq!(bits_to_payload_bytes_ceil(9), 1);
/// ```
pub fn bits_to_payload_bytes_ceil(bits: u32) -> u32 {
    if bits == 0 {
        return 1;
    }
    let bytes = (bits - 1) / 8 + 1;
    if bytes > FRAME_OVERHEAD_BYTES {
        bytes - FRAME_OVERHEAD_BYTES
    } else {
        1
    }
}

/// Live configuration of the active (generator) role.
///
/// The control listener mutates it and the pacing loop reads a snapshot of it
/// once per cycle. Every accepted mutation bumps `generation`, which the
/// pacing loop uses to reset its checkpoint.
///
/// # Examples
///
/// ```
/// use flowgen::GeneratorConfig;
/// use std::time::Duration;
///
/// let config = GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 9001)
///     .with_flows(4)
///     .with_rate_bytes_per_sec(8_000)
///     .with_interval_ms(1_000)
///     .with_checkpoint_period(Duration::from_secs(10));
///
/// assert_eq!(config.desired_flows, 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Address every flow connects to
    pub peer: SocketAddr,

    /// Number of flows the pool should hold; 0 means idle
    pub desired_flows: u32,

    /// Aggregate payload rate in bytes per second
    pub rate_bytes_per_sec: u64,

    /// Length of one pacing cycle in milliseconds
    pub interval_ms: u32,

    /// Port the control listener binds to
    pub listen_port: u16,

    /// Set once a payload clamp warning has been logged for this configuration
    pub warned: bool,

    /// Window between two checkpoint evaluations
    pub checkpoint_period: Duration,

    /// Incremented on every accepted control mutation
    pub generation: u64,
}

impl GeneratorConfig {
    /// Creates a configuration targeting `peer` with control on `listen_port`.
    ///
    /// Starts with a single flow, 1 KB/s and a 100 ms interval.
    pub fn new(peer: SocketAddr, listen_port: u16) -> Self {
        Self {
            peer,
            desired_flows: 1,
            rate_bytes_per_sec: 1_000,
            interval_ms: 100,
            listen_port,
            warned: false,
            checkpoint_period: DEFAULT_CHECKPOINT_PERIOD,
            generation: 0,
        }
    }

    /// Sets the number of flows the pool should hold.
    ///
    /// Zero is allowed and leaves the generator idle until the count is
    /// raised over the control channel.
    ///
    /// # Arguments
    ///
    /// * `flows` - Desired flow count, at most [`MAX_FLOWS`] (default: 1)
    ///
    /// # Examples
    ///
    /// ```
    /// use flowgen::GeneratorConfig;
    ///
    /// let config = GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 9001)
    ///     .with_flows(16);
    /// assert_eq!(config.desired_flows, 16);
    /// ```
    pub fn with_flows(mut self, flows: u32) -> Self {
        self.desired_flows = flows;
        self
    }

    /// Sets the aggregate payload rate directly, bypassing header overhead.
    ///
    /// # Arguments
    ///
    /// * `rate` - Payload bytes per second across all flows (default: 1000)
    ///
    /// # Examples
    ///
    /// ```
    /// use flowgen::GeneratorConfig;
    ///
    /// let config = GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 9001)
    ///     .with_rate_bytes_per_sec(125_000); // 1 Mbps of payload
    /// assert_eq!(config.interval_budget(), 12_500);
    /// ```
    pub fn with_rate_bytes_per_sec(mut self, rate: u64) -> Self {
        self.rate_bytes_per_sec = rate;
        self
    }

    /// Sets the rate from a wire bit rate.
    ///
    /// The bit rate includes frame headers, which are removed by
    /// [`bits_to_payload_bytes_ceil`] to get the payload rate.
    ///
    /// # Arguments
    ///
    /// * `bits_per_sec` - Target bandwidth on the wire in bits per second
    ///
    /// # Examples
    ///
    /// ```
    /// use flowgen::GeneratorConfig;
    ///
    /// let config = GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 9001)
    ///     .with_bandwidth_bps(8_000);
    /// assert_eq!(config.rate_bytes_per_sec, 934);
    /// ```
    pub fn with_bandwidth_bps(mut self, bits_per_sec: u32) -> Self {
        self.rate_bytes_per_sec = bits_to_payload_bytes_ceil(bits_per_sec) as u64;
        self
    }

    /// Sets the pacing interval.
    ///
    /// Every flow writes once per interval, so shorter intervals mean smaller
    /// and more frequent writes at the same rate.
    ///
    /// # Arguments
    ///
    /// * `interval_ms` - Cycle length in milliseconds (default: 100)
    pub fn with_interval_ms(mut self, interval_ms: u32) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Sets how often achieved bytes are reconciled against the rate budget.
    ///
    /// # Examples
    ///
    /// ```
    /// use flowgen::GeneratorConfig;
    /// use std::time::Duration;
    ///
    /// let config = GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 9001)
    ///     .with_checkpoint_period(Duration::from_secs(1));
    /// assert_eq!(config.checkpoint_period, Duration::from_secs(1));
    /// ```
    pub fn with_checkpoint_period(mut self, period: Duration) -> Self {
        self.checkpoint_period = period;
        self
    }

    /// Checks the invariants the pacing loop relies on.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when the flow count exceeds
    /// [`MAX_FLOWS`] or when rate or interval is zero.
    pub fn validate(&self) -> crate::Result<()> {
        if self.desired_flows > MAX_FLOWS {
            return Err(crate::Error::Config(format!(
                "{} is not a valid number of flows (max {})",
                self.desired_flows, MAX_FLOWS
            )));
        }
        if self.rate_bytes_per_sec == 0 {
            return Err(crate::Error::Config("rate must be positive".to_string()));
        }
        if self.interval_ms == 0 {
            return Err(crate::Error::Config("interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Payload bytes one full interval is worth at the configured rate.
    pub fn interval_budget(&self) -> u64 {
        self.rate_bytes_per_sec * self.interval_ms as u64 / 1000
    }
}

/// `GeneratorConfig` shared between the control listener and the pacing loop.
///
/// A single mutex guards the whole struct, so a reader always sees a
/// consistent set of fields.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<Mutex<GeneratorConfig>>,
}

impl SharedConfig {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    /// Copies out the current configuration.
    pub fn snapshot(&self) -> GeneratorConfig {
        *self.inner.lock()
    }

    /// Applies `f` under the lock, then re-arms diagnostics and bumps the
    /// generation so the pacer resets its checkpoint.
    pub fn mutate<F>(&self, f: F) -> GeneratorConfig
    where
        F: FnOnce(&mut GeneratorConfig),
    {
        let mut config = self.inner.lock();
        f(&mut config);
        config.warned = false;
        config.generation = config.generation.wrapping_add(1);
        *config
    }

    /// Marks the clamp warning as emitted. Returns `true` if this call flipped
    /// the flag, i.e. the caller should log.
    pub fn warn_once(&self) -> bool {
        let mut config = self.inner.lock();
        if config.warned {
            false
        } else {
            config.warned = true;
            true
        }
    }
}

/// Configuration of the passive (sink) role.
///
/// # Examples
///
/// ```
/// use flowgen::SinkConfig;
/// use std::time::Duration;
///
/// let config = SinkConfig::new(9000).with_nap(Duration::from_millis(10));
/// assert_eq!(config.port, 9000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Port to accept flows on
    pub port: u16,

    /// Pause between drain passes
    pub nap: Duration,

    /// Upper bound on bytes read per connection per pass
    pub drain_chunk: usize,

    /// Live connections above this count are a fatal configuration error
    pub max_connections: usize,
}

impl SinkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            nap: DEFAULT_NAP,
            drain_chunk: DEFAULT_DRAIN_CHUNK,
            max_connections: MAX_FLOWS as usize,
        }
    }

    /// Sets the pause between drain passes.
    ///
    /// Longer naps make the sink a slower reader, which pushes back on the
    /// generator's send buffers.
    pub fn with_nap(mut self, nap: Duration) -> Self {
        self.nap = nap;
        self
    }

    /// Sets the most bytes read from one connection per pass.
    ///
    /// # Arguments
    ///
    /// * `chunk` - Bytes per read, raised to at least 1 (default: 64 KB)
    ///
    /// # Examples
    ///
    /// ```
    /// use flowgen::SinkConfig;
    ///
    /// let config = SinkConfig::new(9000).with_drain_chunk(4 * 1024);
    /// assert_eq!(config.drain_chunk, 4096);
    /// ```
    pub fn with_drain_chunk(mut self, chunk: usize) -> Self {
        self.drain_chunk = chunk.max(1);
        self
    }

    /// Sets how many connections the sink holds before giving up.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}
