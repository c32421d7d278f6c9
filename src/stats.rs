use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outcome of one non-blocking write on a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every requested byte was accepted by the socket
    Full(usize),
    /// Only some of the requested bytes were accepted
    Partial(usize),
    /// The socket accepted nothing this cycle
    Zero,
}

impl SendOutcome {
    /// Classifies a write of `written` bytes out of `requested`.
    pub fn classify(requested: usize, written: usize) -> Self {
        if written == 0 {
            SendOutcome::Zero
        } else if written < requested {
            SendOutcome::Partial(written)
        } else {
            SendOutcome::Full(written)
        }
    }

    pub fn bytes(&self) -> usize {
        match *self {
            SendOutcome::Full(n) | SendOutcome::Partial(n) => n,
            SendOutcome::Zero => 0,
        }
    }
}

/// Process-lifetime send counters.
///
/// Written only by the pacing loop and read by any number of reporters.
/// Counters are atomics, so a reader never blocks the writer and never sees a
/// torn 64-bit value.
#[derive(Debug)]
pub struct CumulativeStats {
    total_bytes: AtomicU64,
    packets: AtomicU64,
    partial_writes: AtomicU64,
    zero_writes: AtomicU64,
    started: Instant,
}

impl CumulativeStats {
    pub fn new() -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            partial_writes: AtomicU64::new(0),
            zero_writes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record(&self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Full(n) => {
                self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
                self.packets.fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::Partial(n) => {
                self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
                self.partial_writes.fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::Zero => {
                self.zero_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_bytes: self.total_bytes(),
            packets: self.packets.load(Ordering::Relaxed),
            partial_writes: self.partial_writes.load(Ordering::Relaxed),
            zero_writes: self.zero_writes.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

impl Default for CumulativeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`CumulativeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_bytes: u64,
    pub packets: u64,
    pub partial_writes: u64,
    pub zero_writes: u64,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Average payload throughput since process start.
    pub fn bits_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            (self.total_bytes as f64 * 8.0) / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Renders the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
