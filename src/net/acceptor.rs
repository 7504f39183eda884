//! Listening socket wrapper.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::error;

use crate::error::Error;

const LISTEN_BACKLOG: i32 = 1000;

/// Non-blocking TCP listener. Accept failures are logged and surfaced; the
/// listen socket itself is never torn down by a failed accept.
pub struct Acceptor {
    socket: Socket,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Create, bind, and listen on `addr` (IPv4). The socket is set
    /// non-blocking with SO_REUSEADDR before binding.
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::InvalidAddress("listener has no socket address".to_string()))?;

        Ok(Acceptor { socket, local_addr })
    }

    /// Accept one pending connection. Returns the non-blocking stream and
    /// the peer address. `WouldBlock` means the backlog is drained.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (socket, peer) = self.socket.accept().inspect_err(|e| {
            if e.kind() != io::ErrorKind::WouldBlock {
                error!(error = %e, "accept failed");
            }
        })?;
        socket.set_nonblocking(true)?;
        let peer = peer
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((socket.into(), peer))
    }

    /// The bound address; reports the real port for ephemeral binds.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_reports_real_port() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
    }

    #[test]
    fn accept_without_client_would_block() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = acceptor.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn accepts_a_connection() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = TcpStream::connect(acceptor.local_addr()).unwrap();

        // non-blocking accept may race the client's handshake
        let mut accepted = None;
        for _ in 0..100 {
            match acceptor.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (_stream, peer) = accepted.expect("no connection accepted");
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
