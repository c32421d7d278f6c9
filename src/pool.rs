use crate::config::MAX_FLOWS;
use crate::flow::Flow;
use crate::Result;
use log::{debug, info, warn};
use std::net::SocketAddr;

/// What one reconciliation pass did to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolChange {
    pub opened: usize,
    pub closed: usize,
}

impl PoolChange {
    /// True when flows were opened or closed, which makes any overrun in the
    /// same cycle unavoidable overhead rather than something to catch up on.
    pub fn churned(&self) -> bool {
        self.opened > 0 || self.closed > 0
    }
}

/// Owns every open flow and keeps their number equal to the requested count.
///
/// Flows are closed in stack order: the most recently opened flow is the
/// first one closed.
#[derive(Debug)]
pub struct FlowPool {
    peer: SocketAddr,
    flows: Vec<Flow>,
    send_buffer_size: Option<usize>,
    capped_warned: bool,
}

impl FlowPool {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            flows: Vec::new(),
            send_buffer_size: None,
            capped_warned: false,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Send buffer size discovered on the first flow ever opened.
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    /// Caps `desired` at [`MAX_FLOWS`], warning once per run of over-limit
    /// requests.
    fn target(&mut self, desired: u32) -> usize {
        if desired > MAX_FLOWS {
            if !self.capped_warned {
                warn!(
                    "too many flows requested (max={}, requested={}), capping",
                    MAX_FLOWS, desired
                );
                self.capped_warned = true;
            }
            MAX_FLOWS as usize
        } else {
            self.capped_warned = false;
            desired as usize
        }
    }

    /// Opens or closes flows until exactly `desired` (capped at
    /// [`MAX_FLOWS`]) are open.
    ///
    /// # Errors
    ///
    /// A failed connect is returned immediately; flows opened earlier in the
    /// same pass stay in the pool.
    pub async fn reconcile(&mut self, desired: u32) -> Result<PoolChange> {
        let target = self.target(desired);
        let mut change = PoolChange::default();

        while self.flows.len() < target {
            debug!(
                "starting new flow (have {}, need {})",
                self.flows.len(),
                target
            );
            let flow = Flow::connect(self.peer, self.flows.len()).await?;
            if self.send_buffer_size.is_none() {
                self.send_buffer_size = flow.send_buffer_size();
                if let Some(size) = self.send_buffer_size {
                    info!("flow send buffer is {} bytes", size);
                }
            }
            self.flows.push(flow);
            change.opened += 1;
        }

        while self.flows.len() > target {
            debug!(
                "closing extraneous flow (have {}, need {})",
                self.flows.len(),
                target
            );
            self.flows.pop();
            change.closed += 1;
        }

        if change.churned() {
            info!("# of flows is now {}", self.flows.len());
        }

        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_grow_and_shrink() {
        // loopback connects complete against the backlog without accept()
        let (_listener, addr) = listener().await;
        let mut pool = FlowPool::new(addr);

        let change = pool.reconcile(4).await.unwrap();
        assert_eq!(change, PoolChange { opened: 4, closed: 0 });
        assert_eq!(pool.len(), 4);
        assert!(pool.send_buffer_size().is_some() || cfg!(not(unix)));

        let change = pool.reconcile(4).await.unwrap();
        assert!(!change.churned());

        let change = pool.reconcile(1).await.unwrap();
        assert_eq!(change, PoolChange { opened: 0, closed: 3 });
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_last_in_first_out() {
        let (_listener, addr) = listener().await;
        let mut pool = FlowPool::new(addr);
        pool.reconcile(3).await.unwrap();
        let first = pool.flows()[0].local_addr().unwrap();

        pool.reconcile(1).await.unwrap();
        assert_eq!(pool.flows()[0].index(), 0);
        assert_eq!(pool.flows()[0].local_addr().unwrap(), first);

        pool.reconcile(2).await.unwrap();
        let indices: Vec<usize> = pool.flows().iter().map(|f| f.index()).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_zero_quiesces() {
        let (_listener, addr) = listener().await;
        let mut pool = FlowPool::new(addr);
        pool.reconcile(2).await.unwrap();

        let change = pool.reconcile(0).await.unwrap();
        assert_eq!(change.closed, 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_target_caps_at_max_flows() {
        let mut pool = FlowPool::new("127.0.0.1:9000".parse().unwrap());

        assert_eq!(pool.target(0), 0);
        assert_eq!(pool.target(MAX_FLOWS), MAX_FLOWS as usize);
        assert!(!pool.capped_warned);

        assert_eq!(pool.target(MAX_FLOWS + 1), MAX_FLOWS as usize);
        assert!(pool.capped_warned);
        // still capped, no second warning
        assert_eq!(pool.target(u32::MAX), MAX_FLOWS as usize);
        assert!(pool.capped_warned);

        // a legal request ends the streak and re-arms the warning
        assert_eq!(pool.target(10), 10);
        assert!(!pool.capped_warned);
        assert_eq!(pool.target(u32::MAX), MAX_FLOWS as usize);
        assert!(pool.capped_warned);
    }

    #[tokio::test]
    async fn test_connect_failure_is_error() {
        let addr = {
            let (listener, addr) = listener().await;
            drop(listener);
            addr
        };
        let mut pool = FlowPool::new(addr);
        assert!(pool.reconcile(1).await.is_err());
        assert!(pool.is_empty());
    }
}
