//! Interval pacing for the generator.
//!
//! Each cycle the pacer decides how many payload bytes every flow writes and
//! how long to sleep afterwards. Two mechanisms keep the achieved rate on
//! target:
//!
//! - **Per-cycle**: a cycle that overruns its interval pushes the bytes it
//!   missed into the next cycle's payload, unless the overrun was caused by
//!   opening or closing flows.
//! - **Checkpoint**: every `checkpoint_period`, the bytes sent since the last
//!   checkpoint are compared against `rate * elapsed`. Overage is paid back
//!   with an extra sleep; a deficit larger than one interval's budget skips the
//!   next ordinary sleep. Smaller deficits carry into the next window.
//!
//! All arithmetic is unsigned floor division, so rounding only ever loses
//! bytes and the achieved rate sits at or slightly below the target.

use crate::config::{GeneratorConfig, MAX_PAYLOAD};
use std::time::{Duration, Instant};

/// Why a computed payload size was clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clamp {
    /// Computed size floored to zero and was raised to one byte
    Raised,
    /// Computed size exceeded [`MAX_PAYLOAD`]
    Truncated { computed: u64 },
}

/// Bytes each flow writes this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSize {
    pub bytes: u32,
    pub clamp: Option<Clamp>,
}

/// Computes the per-flow payload for one cycle.
///
/// `(extra * 1000 + rate * interval_ms) / (flows * 1000)`, clamped to
/// `[1, MAX_PAYLOAD]`. `extra` is the aggregate catch-up in bytes, shared
/// across all flows. `flows` of zero is treated as one.
///
/// # Examples
///
/// ```
/// use flowgen::pacer::payload_bytes;
///
/// let size = payload_bytes(0, 8_000, 1_000, 4);
/// assert_eq!(size.bytes, 2_000);
/// assert!(size.clamp.is_none());
/// ```
pub fn payload_bytes(extra: u64, rate: u64, interval_ms: u32, flows: u32) -> PayloadSize {
    let numerator = extra
        .saturating_mul(1000)
        .saturating_add(rate.saturating_mul(interval_ms as u64));
    let denominator = flows.max(1) as u64 * 1000;
    let computed = numerator / denominator;

    if computed == 0 {
        PayloadSize {
            bytes: 1,
            clamp: Some(Clamp::Raised),
        }
    } else if computed > MAX_PAYLOAD as u64 {
        PayloadSize {
            bytes: MAX_PAYLOAD,
            clamp: Some(Clamp::Truncated { computed }),
        }
    } else {
        PayloadSize {
            bytes: computed as u32,
            clamp: None,
        }
    }
}

/// Reconciliation window comparing bytes sent to a time-proportional budget.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    started: Instant,
    bytes_sent: u64,
    carried: i128,
}

/// Result of a checkpoint evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Sent more than the budget; pause this long before the next cycle
    Sleep(Duration),
    /// Behind by more than one interval; skip the next ordinary sleep
    SkipSleep { deficit: u64 },
    /// Within one interval of the budget
    OnTrack,
}

impl Checkpoint {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            bytes_sent: 0,
            carried: 0,
        }
    }

    /// Starts a fresh window and forgets any carried balance.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes_sent = self.bytes_sent.saturating_add(bytes);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Evaluates the window if more than `period` has passed since it started.
    ///
    /// Returns `None` while the window is still open.
    pub fn evaluate(
        &mut self,
        now: Instant,
        period: Duration,
        rate: u64,
        interval_budget: u64,
    ) -> Option<Correction> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed <= period {
            return None;
        }

        let budget = rate as u128 * elapsed.as_millis() / 1000;
        let balance = self.carried + self.bytes_sent as i128 - budget as i128;

        self.bytes_sent = 0;
        self.started = now;

        if balance > 0 && rate > 0 {
            let sleep_ms = (balance as u128 * 1000 / rate as u128) as u64;
            let sleep = Duration::from_millis(sleep_ms);
            // the pause is part of the next window, during which nothing is owed
            self.started = now + sleep;
            self.carried = 0;
            Some(Correction::Sleep(sleep))
        } else if -balance > interval_budget as i128 {
            self.carried = balance;
            Some(Correction::SkipSleep {
                deficit: (-balance) as u64,
            })
        } else {
            self.carried = balance.min(0);
            Some(Correction::OnTrack)
        }
    }
}

/// Why a cycle took at least a full interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overrun {
    /// Missed bytes will be added to the next cycle's payload
    CatchUp {
        elapsed_ms: u64,
        interval_ms: u32,
        extra_bytes: u64,
    },
    /// Time went to opening or closing flows; nothing is carried over
    Churn { elapsed_ms: u64, interval_ms: u32 },
}

/// How the generator ends one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    pub sleep: Duration,
    pub overrun: Option<Overrun>,
}

/// Per-generator pacing state.
#[derive(Debug, Clone)]
pub struct Pacer {
    extra_bytes: u64,
    checkpoint: Checkpoint,
    generation: u64,
    skip_next_sleep: bool,
}

impl Pacer {
    pub fn new(now: Instant, generation: u64) -> Self {
        Self {
            extra_bytes: 0,
            checkpoint: Checkpoint::new(now),
            generation,
            skip_next_sleep: false,
        }
    }

    pub fn extra_bytes(&self) -> u64 {
        self.extra_bytes
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Resets the checkpoint when the configuration generation changed.
    ///
    /// Returns `true` if a reset happened.
    pub fn sync_generation(&mut self, generation: u64, now: Instant) -> bool {
        if generation == self.generation {
            return false;
        }
        self.generation = generation;
        self.checkpoint.reset(now);
        self.skip_next_sleep = false;
        true
    }

    /// Drops all drift bookkeeping while there are no flows to pace.
    pub fn idle(&mut self, now: Instant) {
        self.extra_bytes = 0;
        self.skip_next_sleep = false;
        self.checkpoint.reset(now);
    }

    /// Runs the checkpoint at the start of a cycle, before anything is sent.
    ///
    /// Only completed cycles count against the budget here. A returned
    /// duration must be slept before the cycle starts.
    pub fn begin_cycle(&mut self, config: &GeneratorConfig, now: Instant) -> Option<Correction> {
        let correction = self.checkpoint.evaluate(
            now,
            config.checkpoint_period,
            config.rate_bytes_per_sec,
            config.interval_budget(),
        )?;
        if let Correction::SkipSleep { .. } = correction {
            self.skip_next_sleep = true;
        }
        Some(correction)
    }

    /// Computes this cycle's per-flow payload, consuming any carried-over
    /// catch-up bytes.
    pub fn next_payload(&mut self, config: &GeneratorConfig, flows: u32) -> PayloadSize {
        let extra = std::mem::take(&mut self.extra_bytes);
        payload_bytes(extra, config.rate_bytes_per_sec, config.interval_ms, flows)
    }

    pub fn record_sent(&mut self, bytes: u64) {
        self.checkpoint.record(bytes);
    }

    /// Decides the end-of-cycle sleep given how long the cycle took.
    pub fn finish_cycle(
        &mut self,
        config: &GeneratorConfig,
        elapsed: Duration,
        churned: bool,
    ) -> CyclePlan {
        let interval = Duration::from_millis(config.interval_ms as u64);
        let skip = std::mem::take(&mut self.skip_next_sleep);

        if elapsed < interval {
            let sleep = if skip { Duration::ZERO } else { interval - elapsed };
            return CyclePlan {
                sleep,
                overrun: None,
            };
        }

        let elapsed_ms = elapsed.as_millis() as u64;
        let overrun = if churned {
            Overrun::Churn {
                elapsed_ms,
                interval_ms: config.interval_ms,
            }
        } else {
            let late_ms = elapsed_ms.saturating_sub(config.interval_ms as u64);
            self.extra_bytes = config.rate_bytes_per_sec.saturating_mul(late_ms) / 1000;
            Overrun::CatchUp {
                elapsed_ms,
                interval_ms: config.interval_ms,
                extra_bytes: self.extra_bytes,
            }
        };

        CyclePlan {
            sleep: Duration::ZERO,
            overrun: Some(overrun),
        }
    }
}
