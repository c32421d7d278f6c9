use crate::stats::SendOutcome;
use crate::{Error, Result};
use log::debug;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// One outbound load-generating connection.
#[derive(Debug)]
pub struct Flow {
    index: usize,
    stream: TcpStream,
}

impl Flow {
    /// Connects flow number `index` to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the connection cannot be established.
    pub async fn connect(peer: SocketAddr, index: usize) -> Result<Self> {
        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| Error::Connection(format!("connect for new flow to {} failed: {}", peer, e)))?;
        debug!("flow {} connected to {}", index, peer);
        Ok(Self { index, stream })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Writes as much of `payload` as the socket accepts right now.
    ///
    /// Never waits for buffer space: a full socket buffer is reported as
    /// [`SendOutcome::Zero`].
    ///
    /// # Errors
    ///
    /// Any failure other than would-block (reset, broken pipe) is returned as
    /// [`Error::Connection`].
    pub fn send(&self, payload: &[u8]) -> Result<SendOutcome> {
        match self.stream.try_write(payload) {
            Ok(n) => Ok(SendOutcome::classify(payload.len(), n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::Zero),
            Err(e) => Err(Error::Connection(format!(
                "send on flow {} failed: {}",
                self.index, e
            ))),
        }
    }

    /// Size of the kernel send buffer backing this flow, if the platform
    /// exposes it.
    pub fn send_buffer_size(&self) -> Option<usize> {
        send_buffer_size(&self.stream)
    }
}

#[cfg(unix)]
fn send_buffer_size(stream: &TcpStream) -> Option<usize> {
    use std::mem;
    use std::os::unix::io::AsRawFd;

    let mut size: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut size as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result == 0 && size > 0 {
        Some(size as usize)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn send_buffer_size(_stream: &TcpStream) -> Option<usize> {
    None
}
