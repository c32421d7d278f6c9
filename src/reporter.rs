//! Per-connection stats reporter.
//!
//! Streams the cumulative byte counter to a control peer on a fixed cadence,
//! running beside the command decoder so a slow or dead peer never stalls the
//! read loop.

use crate::protocol::encode_stats;
use crate::stats::CumulativeStats;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Writes `stats.total_bytes()` to `writer` every `period` until a write
/// fails or `cancel` fires.
pub async fn run_stats_reporter<W>(
    mut writer: W,
    stats: Arc<CumulativeStats>,
    period: Duration,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stats reporter stopped with its control connection");
                return;
            }
            _ = ticker.tick() => {}
        }

        let record = encode_stats(stats.total_bytes());
        if let Err(e) = writer.write_all(&record).await {
            debug!("stats reporter write failed, stopping: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!("stats reporter flush failed, stopping: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::SendOutcome;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reports_running_total() {
        let (client, mut server) = tokio::io::duplex(64);
        let stats = Arc::new(CumulativeStats::new());
        stats.record(SendOutcome::Full(1234));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_stats_reporter(
            client,
            stats.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(u64::from_be_bytes(buf), 1234);

        stats.record(SendOutcome::Full(1000));
        // drain until the new total shows up
        loop {
            server.read_exact(&mut buf).await.unwrap();
            if u64::from_be_bytes(buf) == 2234 {
                break;
            }
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_peer_goes_away() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let handle = tokio::spawn(run_stats_reporter(
            client,
            Arc::new(CumulativeStats::new()),
            Duration::from_millis(5),
            CancellationToken::new(),
        ));

        time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reporter should stop on write failure")
            .unwrap();
    }
}
