use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram on a connected UDP socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// returns the number of bytes sent, or the OS level error
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        trace!("UDP socket: sending {} bytes", datagram.len());
        self.send(datagram).await
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.as_ref().peer_addr().ok()
    }
}
