use crate::config::{GeneratorConfig, SharedConfig, MAX_PAYLOAD};
use crate::control::ControlListener;
use crate::pacer::{Clamp, Correction, Overrun, Pacer};
use crate::pool::{FlowPool, PoolChange};
use crate::stats::{CumulativeStats, StatsSnapshot};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;

/// What one pacing cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Flows open while sending
    pub flows: usize,
    /// Bytes requested per flow; 0 for an idle cycle
    pub payload_bytes: u32,
    /// Bytes the sockets accepted across all flows
    pub bytes_sent: u64,
    pub change: PoolChange,
    pub correction: Option<Correction>,
    pub overrun: Option<Overrun>,
    pub sleep: Duration,
}

/// The active role: keeps the flow pool sized and paces writes across it.
///
/// # Examples
///
/// ```no_run
/// use flowgen::{CumulativeStats, Generator, GeneratorConfig, SharedConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = GeneratorConfig::new("192.168.1.100:9000".parse()?, 9001)
///     .with_flows(4)
///     .with_bandwidth_bps(1_000_000)
///     .with_interval_ms(10);
///
/// let generator = Generator::new(SharedConfig::new(config), Arc::new(CumulativeStats::new()))?;
/// generator.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Generator {
    config: SharedConfig,
    stats: Arc<CumulativeStats>,
    pool: FlowPool,
    pacer: Pacer,
    payload: Vec<u8>,
}

impl Generator {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the initial configuration is invalid.
    pub fn new(config: SharedConfig, stats: Arc<CumulativeStats>) -> Result<Self> {
        let snapshot = config.snapshot();
        snapshot.validate()?;

        Ok(Self {
            pool: FlowPool::new(snapshot.peer),
            pacer: Pacer::new(Instant::now(), snapshot.generation),
            payload: vec![0u8; MAX_PAYLOAD as usize],
            config,
            stats,
        })
    }

    pub fn pool(&self) -> &FlowPool {
        &self.pool
    }

    /// Runs pacing cycles until a flow fails.
    pub async fn run(mut self) -> Result<()> {
        loop {
            self.cycle().await?;
        }
    }

    /// Runs one cycle: resize the pool, write one payload per flow, sleep.
    ///
    /// # Errors
    ///
    /// Connect failures and hard send failures are returned; short writes
    /// are only counted.
    pub async fn cycle(&mut self) -> Result<CycleReport> {
        let config = self.config.snapshot();
        if self.pacer.sync_generation(config.generation, Instant::now()) {
            debug!("configuration changed, checkpoint reset");
        }

        if config.desired_flows == 0 {
            return self.idle_cycle(&config).await;
        }

        let correction = self.pacer.begin_cycle(&config, Instant::now());
        match correction {
            Some(Correction::Sleep(pause)) => {
                debug!(
                    "checkpoint: ahead of budget, pausing {}ms",
                    pause.as_millis()
                );
                time::sleep(pause).await;
            }
            Some(Correction::SkipSleep { deficit }) => {
                debug!(
                    "checkpoint: {} bytes behind budget, skipping next sleep",
                    deficit
                );
            }
            Some(Correction::OnTrack) | None => {}
        }

        let start = Instant::now();
        let change = self.pool.reconcile(config.desired_flows).await?;
        let flows = self.pool.len();

        let size = self.pacer.next_payload(&config, flows as u32);
        if let Some(clamp) = size.clamp {
            self.warn_clamp(clamp);
        }

        let payload = &self.payload[..size.bytes as usize];
        let mut bytes_sent = 0u64;
        for flow in self.pool.flows() {
            let outcome = flow.send(payload)?;
            self.stats.record(outcome);
            bytes_sent += outcome.bytes() as u64;
        }
        self.pacer.record_sent(bytes_sent);

        let plan = self
            .pacer
            .finish_cycle(&config, start.elapsed(), change.churned());
        match plan.overrun {
            Some(Overrun::CatchUp {
                elapsed_ms,
                interval_ms,
                extra_bytes,
            }) => warn!(
                "interval took too long (took {}ms; needed < {}ms) (will try to catch up by sending {} extra bytes next interval)",
                elapsed_ms, interval_ms, extra_bytes
            ),
            Some(Overrun::Churn {
                elapsed_ms,
                interval_ms,
            }) => warn!(
                "interval took too long (took {}ms; needed < {}ms) (will not try to catch up because we spent part of the interval creating/destroying flows)",
                elapsed_ms, interval_ms
            ),
            None => {}
        }

        if !plan.sleep.is_zero() {
            time::sleep(plan.sleep).await;
        }

        Ok(CycleReport {
            flows,
            payload_bytes: size.bytes,
            bytes_sent,
            change,
            correction,
            overrun: plan.overrun,
            sleep: plan.sleep,
        })
    }

    async fn idle_cycle(&mut self, config: &GeneratorConfig) -> Result<CycleReport> {
        let start = Instant::now();
        let change = self.pool.reconcile(0).await?;
        self.pacer.idle(Instant::now());

        let sleep = Duration::from_millis(config.interval_ms as u64).saturating_sub(start.elapsed());
        time::sleep(sleep).await;

        Ok(CycleReport {
            flows: 0,
            payload_bytes: 0,
            bytes_sent: 0,
            change,
            correction: None,
            overrun: None,
            sleep,
        })
    }

    fn warn_clamp(&self, clamp: Clamp) {
        if !self.config.warn_once() {
            return;
        }
        match clamp {
            Clamp::Raised => warn!("payload bytes will only be 1"),
            Clamp::Truncated { computed } => warn!(
                "payload bytes will be truncated to {} (should be {}; flow send buffer {})",
                MAX_PAYLOAD,
                computed,
                self.pool
                    .send_buffer_size()
                    .map(|s| format!("{} bytes", s))
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        }
    }
}

/// Runs the whole active role: control listener plus pacing loop.
///
/// Returns the final stats once a terminate command arrives.
///
/// # Errors
///
/// Fails if the control port cannot be bound, the configuration is invalid,
/// or the pacing loop hits a fatal flow error.
pub async fn run_active(config: GeneratorConfig) -> Result<StatsSnapshot> {
    let shared = SharedConfig::new(config);
    let stats = Arc::new(CumulativeStats::new());

    let listener = ControlListener::bind(shared.clone(), stats.clone()).await?;
    let generator = Generator::new(shared, stats.clone())?;

    info!(
        "generating {} flow(s) to {} at {} payload B/s every {}ms",
        config.desired_flows, config.peer, config.rate_bytes_per_sec, config.interval_ms
    );

    let mut pacing = tokio::spawn(generator.run());

    tokio::select! {
        result = listener.run() => {
            pacing.abort();
            result?;
            Ok(stats.snapshot())
        }
        joined = &mut pacing => {
            match joined {
                Ok(Ok(())) => Err(Error::Task("pacing loop stopped unexpectedly".to_string())),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::Task(format!("pacing loop failed: {}", e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn peer() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn generator(config: GeneratorConfig) -> (Generator, SharedConfig, Arc<CumulativeStats>) {
        let shared = SharedConfig::new(config);
        let stats = Arc::new(CumulativeStats::new());
        let generator = Generator::new(shared.clone(), stats.clone()).unwrap();
        (generator, shared, stats)
    }

    #[tokio::test]
    async fn test_cycle_sends_per_flow_payload() {
        let (_listener, addr) = peer().await;
        let config = GeneratorConfig::new(addr, 0)
            .with_flows(4)
            .with_rate_bytes_per_sec(8_000)
            .with_interval_ms(20);
        let (mut generator, _, stats) = generator(config);

        let report = generator.cycle().await.unwrap();
        assert_eq!(report.flows, 4);
        assert_eq!(report.change.opened, 4);
        // 8000 * 20 / (4 * 1000)
        assert_eq!(report.payload_bytes, 40);
        assert_eq!(report.bytes_sent, 160);
        assert_eq!(stats.snapshot().packets, 4);
    }

    #[tokio::test]
    async fn test_pool_follows_flow_count_changes() {
        let (_listener, addr) = peer().await;
        let config = GeneratorConfig::new(addr, 0)
            .with_flows(3)
            .with_interval_ms(5);
        let (mut generator, shared, _) = generator(config);

        generator.cycle().await.unwrap();
        assert_eq!(generator.pool().len(), 3);

        for n in [5, 2, 7, 1] {
            shared.mutate(|c| c.desired_flows = n);
            let report = generator.cycle().await.unwrap();
            assert_eq!(report.flows, n as usize);
            assert!(report.change.churned());
        }
    }

    #[tokio::test]
    async fn test_zero_flows_idles() {
        let (_listener, addr) = peer().await;
        let config = GeneratorConfig::new(addr, 0)
            .with_flows(2)
            .with_interval_ms(5);
        let (mut generator, shared, stats) = generator(config);
        generator.cycle().await.unwrap();
        let sent = stats.total_bytes();

        shared.mutate(|c| c.desired_flows = 0);
        let report = generator.cycle().await.unwrap();
        assert_eq!(report.flows, 0);
        assert_eq!(report.change.closed, 2);
        assert!(generator.pool().is_empty());

        generator.cycle().await.unwrap();
        assert_eq!(stats.total_bytes(), sent);
    }

    #[tokio::test]
    async fn test_clamp_warns_once_per_configuration() {
        let (_listener, addr) = peer().await;
        let config = GeneratorConfig::new(addr, 0)
            .with_flows(1)
            .with_rate_bytes_per_sec(1)
            .with_interval_ms(5);
        let (mut generator, shared, _) = generator(config);

        let report = generator.cycle().await.unwrap();
        assert_eq!(report.payload_bytes, 1);
        assert!(shared.snapshot().warned);

        shared.mutate(|c| c.interval_ms = 6);
        assert!(!shared.snapshot().warned);
        generator.cycle().await.unwrap();
        assert!(shared.snapshot().warned);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let addr = {
            let (listener, addr) = peer().await;
            drop(listener);
            addr
        };
        let (mut generator, _, _) = generator(GeneratorConfig::new(addr, 0));
        assert!(matches!(generator.cycle().await, Err(Error::Connection(_))));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 0).with_interval_ms(0);
        let result = Generator::new(SharedConfig::new(config), Arc::new(CumulativeStats::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
