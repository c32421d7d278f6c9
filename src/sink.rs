use crate::config::{SinkConfig, STATS_PERIOD};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

/// The passive role: accepts flows and throws away whatever they send.
///
/// Each pass reads at most one bounded chunk from every connection, then
/// naps. New connections are accepted while napping. Closed peers are never
/// reaped; they just stop producing bytes.
///
/// # Examples
///
/// ```no_run
/// use flowgen::{Sink, SinkConfig};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sink = Sink::bind(SinkConfig::new(9000).with_nap(Duration::from_millis(50))).await?;
/// sink.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Sink {
    config: SinkConfig,
    listener: TcpListener,
    bytes_drained: Arc<AtomicU64>,
    connections: Arc<AtomicUsize>,
}

impl Sink {
    /// Binds the sink port on all interfaces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the port cannot be bound.
    pub async fn bind(config: SinkConfig) -> Result<Self> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            Error::Connection(format!(
                "unable to bind to local port {} for server: {}",
                config.port, e
            ))
        })?;
        info!("sink listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            listener,
            bytes_drained: Arc::new(AtomicU64::new(0)),
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Counter of every byte read and discarded so far.
    pub fn bytes_drained(&self) -> Arc<AtomicU64> {
        self.bytes_drained.clone()
    }

    /// Counter of connections accepted so far.
    pub fn connections(&self) -> Arc<AtomicUsize> {
        self.connections.clone()
    }

    /// Accepts and drains forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] once more than `max_connections` peers have
    /// connected.
    pub async fn run(&self) -> Result<()> {
        let mut streams: Vec<TcpStream> = Vec::new();
        let mut buf = vec![0u8; self.config.drain_chunk];
        let mut last_report = Instant::now();
        let mut report_bytes = 0u64;

        loop {
            for stream in streams.iter() {
                // errors and EOF are ignored; a dead peer just stops producing
                if let Ok(n) = stream.try_read(&mut buf) {
                    report_bytes += n as u64;
                    self.bytes_drained.fetch_add(n as u64, Ordering::Relaxed);
                }
            }

            if last_report.elapsed() >= STATS_PERIOD {
                debug!(
                    "sink drained {} bytes from {} connection(s) in {:.1}s",
                    report_bytes,
                    streams.len(),
                    last_report.elapsed().as_secs_f64()
                );
                report_bytes = 0;
                last_report = Instant::now();
            }

            self.nap(&mut streams).await?;
        }
    }

    /// Sleeps for one nap, accepting whatever connects in the meantime.
    async fn nap(&self, streams: &mut Vec<TcpStream>) -> Result<()> {
        let nap = time::sleep(self.config.nap);
        tokio::pin!(nap);

        loop {
            tokio::select! {
                _ = &mut nap => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if streams.len() >= self.config.max_connections {
                            return Err(Error::Config(format!(
                                "too many connection requests ({})",
                                streams.len() + 1
                            )));
                        }
                        streams.push(stream);
                        self.connections.fetch_add(1, Ordering::Relaxed);
                        debug!("sink has accepted a new client from {}", addr);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!("sink accept failed: {}", e);
                        // let the rest of the nap pass instead of spinning
                        (&mut nap).await;
                        return Ok(());
                    }
                },
            }
        }
    }
}
