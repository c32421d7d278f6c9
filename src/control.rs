use crate::config::{bits_to_payload_bytes_ceil, GeneratorConfig, SharedConfig, STATS_PERIOD};
use crate::protocol::{read_control_record, ControlMessage};
use crate::reporter::run_stats_reporter;
use crate::stats::CumulativeStats;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Pause after a failed accept before trying again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Effect of one control command on the shared configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Configuration changed; carries the new snapshot
    Applied(GeneratorConfig),
    /// Operator asked the generator to exit
    Terminate,
}

/// Applies a decoded command to `config`.
///
/// Every applied mutation clears the `warned` flag and bumps the
/// configuration generation, which resets the pacer's checkpoint.
///
/// # Examples
///
/// ```
/// use flowgen::control::{apply_command, ControlOutcome};
/// use flowgen::protocol::ControlMessage;
/// use flowgen::{GeneratorConfig, SharedConfig};
///
/// let shared = SharedConfig::new(GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 9001));
/// match apply_command(ControlMessage::SetFlowCount(8), &shared) {
///     ControlOutcome::Applied(config) => assert_eq!(config.desired_flows, 8),
///     ControlOutcome::Terminate => unreachable!(),
/// }
/// ```
pub fn apply_command(msg: ControlMessage, config: &SharedConfig) -> ControlOutcome {
    match msg {
        ControlMessage::SetFlowCount(n) => {
            let updated = config.mutate(|c| c.desired_flows = n);
            info!("# of flows is now {}", n);
            ControlOutcome::Applied(updated)
        }
        ControlMessage::SetRate(bps) => {
            let updated = config.mutate(|c| c.rate_bytes_per_sec = bits_to_payload_bytes_ceil(bps) as u64);
            info!(
                "bps is now {}b ({} payload B/s)",
                bps, updated.rate_bytes_per_sec
            );
            ControlOutcome::Applied(updated)
        }
        ControlMessage::SetInterval(ms) => {
            let updated = config.mutate(|c| c.interval_ms = ms);
            info!("interval is now {}ms", ms);
            ControlOutcome::Applied(updated)
        }
        ControlMessage::Terminate => {
            info!("client exiting (received exit command)");
            ControlOutcome::Terminate
        }
    }
}

/// Accepts control connections and applies the commands they carry.
///
/// Connections are served one at a time. Each gets its own stats reporter
/// for as long as the connection's read side stays open. Losing a control
/// connection never stops the generator; only [`ControlMessage::Terminate`]
/// ends [`ControlListener::run`].
pub struct ControlListener {
    listener: TcpListener,
    config: SharedConfig,
    stats: Arc<CumulativeStats>,
    stats_period: Duration,
}

impl ControlListener {
    /// Binds the control port named by `config.listen_port` on all interfaces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the port cannot be bound.
    pub async fn bind(config: SharedConfig, stats: Arc<CumulativeStats>) -> Result<Self> {
        let port = config.snapshot().listen_port;
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            Error::Connection(format!(
                "unable to bind to local port {} for controller: {}",
                port, e
            ))
        })?;
        info!("controller listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            config,
            stats,
            stats_period: STATS_PERIOD,
        })
    }

    /// Overrides the reporting cadence of per-connection stats reporters.
    pub fn with_stats_period(mut self, period: Duration) -> Self {
        self.stats_period = period;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves control connections until a terminate command arrives.
    pub async fn run(&self) -> Result<()> {
        loop {
            debug!("controller waiting for new connection");
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!("controller accepted a new connection from {}", addr);
                    if self.serve(stream).await {
                        return Ok(());
                    }
                    info!("controller connection from {} closed", addr);
                }
                Err(e) => accept_failed(&e).await,
            }
        }
    }

    /// Decodes commands from one connection. Returns `true` on terminate.
    async fn serve(&self, stream: TcpStream) -> bool {
        let (mut reader, writer) = stream.into_split();
        let cancel = CancellationToken::new();
        tokio::spawn(run_stats_reporter(
            writer,
            self.stats.clone(),
            self.stats_period,
            cancel.clone(),
        ));
        // stop the reporter however this connection ends
        let _guard = cancel.drop_guard();

        loop {
            let record = match read_control_record(&mut reader).await {
                Ok(Some(record)) => record,
                Ok(None) => return false,
                Err(e) => {
                    warn!("control connection failed: {}", e);
                    return false;
                }
            };

            let msg = match ControlMessage::try_from(record) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("ignoring control record: {}", e);
                    continue;
                }
            };

            if apply_command(msg, &self.config) == ControlOutcome::Terminate {
                return true;
            }
        }
    }
}

/// Logs a failed accept and backs off so a persistent failure (EMFILE) does
/// not spin the loop.
async fn accept_failed(e: &std::io::Error) {
    error!("accept() failed for controller: {}", e);
    time::sleep(ACCEPT_RETRY_DELAY).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlRecord;
    use crate::stats::SendOutcome;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn shared() -> SharedConfig {
        SharedConfig::new(
            GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), 0)
                .with_flows(4)
                .with_rate_bytes_per_sec(8_000)
                .with_interval_ms(1_000),
        )
    }

    #[test]
    fn test_apply_set_rate_converts_bits() {
        let config = shared();
        let outcome = apply_command(ControlMessage::SetRate(80_000), &config);
        let ControlOutcome::Applied(updated) = outcome else {
            panic!("expected Applied");
        };
        // 10_000 bytes minus 66 bytes of headers
        assert_eq!(updated.rate_bytes_per_sec, 9_934);
        assert_eq!(updated.generation, 1);
    }

    #[test]
    fn test_apply_clears_warned() {
        let config = shared();
        assert!(config.warn_once());
        apply_command(ControlMessage::SetInterval(250), &config);
        let snap = config.snapshot();
        assert_eq!(snap.interval_ms, 250);
        assert!(!snap.warned);
    }

    #[test]
    fn test_apply_terminate_leaves_config() {
        let config = shared();
        let before = config.snapshot();
        assert_eq!(
            apply_command(ControlMessage::Terminate, &config),
            ControlOutcome::Terminate
        );
        assert_eq!(config.snapshot(), before);
    }

    async fn start_listener(config: SharedConfig, stats: Arc<CumulativeStats>) -> SocketAddr {
        let listener = ControlListener::bind(config, stats)
            .await
            .unwrap()
            .with_stats_period(Duration::from_millis(20));
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { listener.run().await });
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn wait_for<F: Fn(&GeneratorConfig) -> bool>(config: &SharedConfig, f: F) {
        for _ in 0..200 {
            if f(&config.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held: {:?}", config.snapshot());
    }

    #[tokio::test]
    async fn test_commands_mutate_config() {
        let config = shared();
        let addr = start_listener(config.clone(), Arc::new(CumulativeStats::new())).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&ControlMessage::SetFlowCount(2).to_bytes()).await.unwrap();
        conn.write_all(&ControlMessage::SetInterval(50).to_bytes()).await.unwrap();

        wait_for(&config, |c| c.desired_flows == 2 && c.interval_ms == 50).await;
    }

    #[tokio::test]
    async fn test_zero_and_unknown_are_ignored() {
        let config = shared();
        let addr = start_listener(config.clone(), Arc::new(CumulativeStats::new())).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&ControlRecord { code: 2, value: 0 }.to_bytes()).await.unwrap();
        conn.write_all(&ControlRecord { code: 7, value: 5 }.to_bytes()).await.unwrap();
        // a valid command afterwards proves the connection is still served
        conn.write_all(&ControlMessage::SetFlowCount(3).to_bytes()).await.unwrap();

        wait_for(&config, |c| c.desired_flows == 3).await;
        let snap = config.snapshot();
        assert_eq!(snap.interval_ms, 1_000);
        assert_eq!(snap.generation, 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let config = shared();
        let addr = start_listener(config.clone(), Arc::new(CumulativeStats::new())).await;

        {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(&ControlMessage::SetFlowCount(5).to_bytes()).await.unwrap();
            wait_for(&config, |c| c.desired_flows == 5).await;
        }

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&ControlMessage::SetFlowCount(6).to_bytes()).await.unwrap();
        wait_for(&config, |c| c.desired_flows == 6).await;
    }

    #[tokio::test]
    async fn test_streams_stats_to_peer() {
        let stats = Arc::new(CumulativeStats::new());
        stats.record(SendOutcome::Full(4_096));
        let addr = start_listener(shared(), stats).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(u64::from_be_bytes(buf), 4_096);
    }

    #[tokio::test]
    async fn test_terminate_ends_run() {
        let listener = ControlListener::bind(shared(), Arc::new(CumulativeStats::new()))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let run = tokio::spawn(async move { listener.run().await });

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(&ControlMessage::Terminate.to_bytes()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("listener should stop on terminate")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_accept_failure_backs_off() {
        let err = std::io::Error::from_raw_os_error(24);
        let start = std::time::Instant::now();
        accept_failed(&err).await;
        assert!(start.elapsed() >= ACCEPT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = SharedConfig::new(GeneratorConfig::new("127.0.0.1:9000".parse().unwrap(), port));

        let result = ControlListener::bind(config, Arc::new(CumulativeStats::new())).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}
