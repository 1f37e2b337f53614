//! Datagram transports carrying redundancy packets
//!
//! The redundancy layer only needs to push a datagram to an address. Reading
//! is left to the caller (the async node spawns one reader per socket, tests
//! hand datagrams in directly), so the trait is send-only.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Send half of one local endpoint
pub trait DatagramSocket {
    /// Send one datagram without blocking
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Re-establish a path after a failed send
    ///
    /// Connectionless transports have nothing to do.
    fn redial(&self, _target: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Tear down the path to `target` when its channel is removed
    ///
    /// The socket stays open for the other channels. Connectionless
    /// transports have nothing to do.
    fn close_path(&self, _target: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    /// Close the whole socket
    fn close(&self) {}
}

impl DatagramSocket for std::net::UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        std::net::UdpSocket::send_to(self, buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::UdpSocket::local_addr(self)
    }
}

/// UDP endpoint: std socket for sending, tokio socket for reading
///
/// Both handles share one non-blocking descriptor. Sends go straight to the
/// kernel and only fail with `WouldBlock` when the send buffer is full.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    sender: Arc<std::net::UdpSocket>,
    receiver: Arc<tokio::net::UdpSocket>,
}

impl UdpTransport {
    /// Bind `addr`; must run inside a tokio runtime
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let sender = socket.try_clone()?;
        let receiver = tokio::net::UdpSocket::from_std(socket)?;
        Ok(Self { sender: Arc::new(sender), receiver: Arc::new(receiver) })
    }

    /// Handle for receiving on the same socket
    pub fn receiver(&self) -> Arc<tokio::net::UdpSocket> {
        Arc::clone(&self.receiver)
    }
}

impl DatagramSocket for UdpTransport {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sender.send_to(buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sender.local_addr()
    }
}

impl<S: DatagramSocket + ?Sized> DatagramSocket for Box<S> {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        (**self).send_to(buf, target)
    }

    fn redial(&self, target: SocketAddr) -> io::Result<()> {
        (**self).redial(target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn close_path(&self, target: SocketAddr) -> io::Result<()> {
        (**self).close_path(target)
    }

    fn close(&self) {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_socket_round_trip() {
        let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = DatagramSocket::local_addr(&b).unwrap();

        let sent = DatagramSocket::send_to(&a, b"rasta", target).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"rasta");
        assert_eq!(from, DatagramSocket::local_addr(&a).unwrap());
    }

    #[tokio::test]
    async fn test_udp_transport_send() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = peer.local_addr().unwrap();

        transport.send_to(b"hello", target).unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
    }
}
