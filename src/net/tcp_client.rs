//! Client facade: non-blocking connect plus msg-id-correlated calls.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error};

use crate::codec::message::{error_code, RpcError, RpcMessage};
use crate::error::Error;
use crate::net::addr;
use crate::net::connection::{ConnState, Connection, ReadCallback, SendCallback};
use crate::net::event_loop::{EventLoop, LoopHandle};
use crate::net::fd_event::Direction;
use crate::net::timer::Timer;

/// Callback run when a connect attempt resolves.
pub type ConnectCallback = Box<dyn FnOnce(Result<(), RpcError>) + Send>;

/// RPC client bound to the calling thread's event loop.
///
/// All methods are asynchronous: they arm interest on the loop and return;
/// completion is delivered through callbacks once the loop runs. The caller
/// owns retry policy. After a failed connect a fresh socket is already
/// staged, so `connect` may simply be called again.
pub struct TcpClient {
    peer_addr: SocketAddr,
    handle: LoopHandle,
    buffer_size: usize,
    conn: Mutex<Arc<Connection>>,
    last_error: Mutex<Option<RpcError>>,
    pending_connect: Mutex<Option<ConnectCallback>>,
}

impl TcpClient {
    /// Build a client for `addr` (IPv4 `a.b.c.d:port`, port 1..=65535) on
    /// the current thread's loop.
    pub fn new(addr: &str) -> Result<Arc<Self>, Error> {
        Self::with_buffer_size(addr, 128)
    }

    pub fn with_buffer_size(addr: &str, buffer_size: usize) -> Result<Arc<Self>, Error> {
        let peer_addr = addr::parse_addr(addr)?;
        let handle = EventLoop::current()?.handle();
        let conn = Self::make_connection(&handle, peer_addr, buffer_size)?;
        Ok(Arc::new(TcpClient {
            peer_addr,
            handle,
            buffer_size,
            conn: Mutex::new(conn),
            last_error: Mutex::new(None),
            pending_connect: Mutex::new(None),
        }))
    }

    fn make_connection(
        handle: &LoopHandle,
        peer_addr: SocketAddr,
        buffer_size: usize,
    ) -> Result<Arc<Connection>, Error> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let stream: TcpStream = socket.into();
        Connection::new_client(handle.clone(), stream, peer_addr, buffer_size)
    }

    /// Begin a non-blocking connect. `done` runs once the attempt resolves:
    /// immediately on synchronous success or failure, otherwise from the
    /// loop when the socket reports writable.
    pub fn connect(self: &Arc<Self>, done: ConnectCallback) {
        let conn = self.connection();
        match conn.connect_peer() {
            Ok(()) => {
                debug!(peer = %self.peer_addr, "connected");
                conn.set_state(ConnState::Connected);
                conn.resolve_local_addr();
                done(Ok(()));
            }
            Err(e) if connect_in_progress(&e) => {
                *self.lock(&self.pending_connect) = Some(done);
                let weak = Arc::downgrade(self);
                conn.fd_event().listen(
                    Direction::Write,
                    Arc::new(move || {
                        if let Some(client) = weak.upgrade() {
                            client.finish_connect();
                        }
                    }),
                );
                conn.update_interest();
            }
            Err(e) => {
                error!(peer = %self.peer_addr, error = %e, "connect failed");
                let err = classify_connect_error(&e);
                *self.lock(&self.last_error) = Some(err.clone());
                self.reset_socket(&conn);
                done(Err(err));
            }
        }
    }

    /// Writable event during a pending connect: re-issue `connect` to learn
    /// the outcome, then drop OUT interest and run the stashed callback.
    fn finish_connect(self: &Arc<Self>) {
        let conn = self.connection();
        let result = match conn.connect_peer() {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EISCONN) => Ok(()),
            Err(e) => Err(classify_connect_error(&e)),
        };

        match &result {
            Ok(()) => {
                debug!(peer = %self.peer_addr, "connected");
                conn.resolve_local_addr();
                conn.set_state(ConnState::Connected);
                conn.fd_event().cancel(Direction::Write);
                conn.update_interest();
            }
            Err(err) => {
                error!(peer = %self.peer_addr, error = %err, "connect failed");
                *self.lock(&self.last_error) = Some(err.clone());
                self.reset_socket(&conn);
            }
        }

        if let Some(done) = self.lock(&self.pending_connect).take() {
            done(result);
        }
    }

    /// Queue `message` for sending; `done` runs with the message once it has
    /// been fully written to the socket.
    pub fn write_message(&self, message: RpcMessage, done: Option<SendCallback>) {
        let conn = self.connection();
        conn.push_send(message, done);
        conn.listen_write();
    }

    /// Expect a reply carrying `msg_id`; `done` runs with the decoded
    /// message when it arrives.
    pub fn read_message(&self, msg_id: &str, done: ReadCallback) {
        let conn = self.connection();
        conn.push_read(msg_id, done);
        conn.listen_read();
    }

    /// Cancel an in-flight call: its reply, if it ever arrives, is dropped.
    pub fn cancel_read(&self, msg_id: &str) -> bool {
        self.connection().cancel_read(msg_id)
    }

    /// Add a timer on the client's loop (e.g. a caller-owned call timeout).
    pub fn add_timer(&self, timer: Arc<Timer>) {
        self.handle.post(move |el| el.add_timer(timer));
    }

    /// Stop the owning loop.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// The most recent connect error, if any.
    pub fn connect_error(&self) -> Option<RpcError> {
        self.lock(&self.last_error).clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection().local_addr()
    }

    /// Tear down a failed socket and stage a fresh one so the caller can
    /// simply call `connect` again.
    fn reset_socket(&self, old: &Arc<Connection>) {
        old.clear();
        match Self::make_connection(&self.handle, self.peer_addr, self.buffer_size) {
            Ok(fresh) => *self.lock(&self.conn) = fresh,
            Err(e) => error!(error = %e, "failed to stage replacement socket"),
        }
    }

    fn connection(&self) -> Arc<Connection> {
        self.lock(&self.conn).clone()
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn connect_in_progress(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
        || e.kind() == std::io::ErrorKind::WouldBlock
}

fn classify_connect_error(e: &std::io::Error) -> RpcError {
    if e.kind() == std::io::ErrorKind::ConnectionRefused {
        RpcError::new(
            error_code::PEER_CLOSED,
            format!("connect refused, sys error = {e}"),
        )
    } else {
        RpcError::new(
            error_code::FAILED_CONNECT,
            format!("connect error, sys error = {e}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_peer_addresses() {
        assert!(TcpClient::new("127.0.0.1:0").is_err());
        assert!(TcpClient::new("127.0.0.1:65536").is_err());
        assert!(TcpClient::new("nonsense").is_err());
    }

    #[test]
    fn starts_disconnected_without_error() {
        let client = TcpClient::new("127.0.0.1:9000").unwrap();
        assert!(client.connect_error().is_none());
        assert!(client.local_addr().is_none());
        assert_eq!(client.peer_addr().port(), 9000);
    }
}
