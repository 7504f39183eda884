//! Per-socket state machine: read, decode, dispatch, encode, write.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use socket2::{SockAddr, SockRef};
use tracing::{debug, error, info, warn};

use crate::buffer::RingBuffer;
use crate::codec::framed;
use crate::codec::message::RpcMessage;
use crate::error::Error;
use crate::metrics::{CONNECTIONS_ACTIVE, MESSAGES_SENT};
use crate::net::event_loop::{EventLoop, LoopHandle};
use crate::net::fd_event::{Direction, FdEvent};
use crate::rpc::dispatcher::RpcDispatcher;
use crate::runtime;

/// Which side of the connection this endpoint plays. Immutable after
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Server,
    Client,
}

/// Connection lifecycle. `Closed` is terminal: every I/O callback
/// early-returns once it is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    NotConnected = 0,
    Connected = 1,
    HalfClosing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            1 => ConnState::Connected,
            2 => ConnState::HalfClosing,
            3 => ConnState::Closed,
            _ => ConnState::NotConnected,
        }
    }
}

/// Callback run after an outbound message has been fully written.
pub type SendCallback = Box<dyn FnOnce(&RpcMessage) + Send>;
/// Callback run when the reply matching a pending msg-id arrives.
pub type ReadCallback = Box<dyn FnOnce(RpcMessage) + Send>;

struct PendingSend {
    message: RpcMessage,
    done: Option<SendCallback>,
    encoded: bool,
}

struct Inner {
    stream: TcpStream,
    in_buf: RingBuffer,
    out_buf: RingBuffer,
    pending_sends: Vec<PendingSend>,
    read_dones: HashMap<String, ReadCallback>,
}

enum ReadOutcome {
    Drained,
    PeerClosed,
    Failed,
}

/// A TCP connection owned by one event loop.
///
/// The connection is reference-counted: the loop's callbacks, the server's
/// client set, and in-flight reply closures each hold a reference, and the
/// last one dropped destroys it. Callbacks capture `Weak` references so the
/// fd-event cannot keep a cleared connection alive. All buffered state is
/// only ever touched from the owning loop thread; the state byte is atomic
/// so other threads (the server's cleanup timer) can observe `Closed`.
///
/// The out-buffer has no high-water mark: a peer that never drains its
/// socket can grow it without bound.
pub struct Connection {
    fd: RawFd,
    role: ConnRole,
    peer_addr: SocketAddr,
    local_addr: Mutex<Option<SocketAddr>>,
    state: AtomicU8,
    loop_handle: LoopHandle,
    fd_event: Arc<FdEvent>,
    dispatcher: Option<Arc<RpcDispatcher>>,
    inner: Mutex<Inner>,
}

impl Connection {
    /// Build a server-side connection for an accepted stream. The caller
    /// marks it `Connected` and arms read interest.
    pub fn new_server(
        loop_handle: LoopHandle,
        stream: TcpStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        buffer_size: usize,
        dispatcher: Arc<RpcDispatcher>,
    ) -> Result<Arc<Self>, Error> {
        Self::build(
            loop_handle,
            stream,
            ConnRole::Server,
            peer_addr,
            Some(local_addr),
            buffer_size,
            Some(dispatcher),
        )
    }

    /// Build a client-side connection around a not-yet-connected socket.
    pub fn new_client(
        loop_handle: LoopHandle,
        stream: TcpStream,
        peer_addr: SocketAddr,
        buffer_size: usize,
    ) -> Result<Arc<Self>, Error> {
        Self::build(
            loop_handle,
            stream,
            ConnRole::Client,
            peer_addr,
            None,
            buffer_size,
            None,
        )
    }

    fn build(
        loop_handle: LoopHandle,
        stream: TcpStream,
        role: ConnRole,
        peer_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        buffer_size: usize,
        dispatcher: Option<Arc<RpcDispatcher>>,
    ) -> Result<Arc<Self>, Error> {
        let fd = stream.as_raw_fd();
        let fd_event = Arc::new(FdEvent::new(fd));
        fd_event.set_non_blocking()?;
        CONNECTIONS_ACTIVE.increment();
        Ok(Arc::new(Connection {
            fd,
            role,
            peer_addr,
            local_addr: Mutex::new(local_addr),
            state: AtomicU8::new(ConnState::NotConnected as u8),
            loop_handle,
            fd_event,
            dispatcher,
            inner: Mutex::new(Inner {
                stream,
                in_buf: RingBuffer::new(buffer_size),
                out_buf: RingBuffer::new(buffer_size),
                pending_sends: Vec::new(),
                read_dones: HashMap::new(),
            }),
        }))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn role(&self) -> ConnRole {
        self.role
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.lock(&self.local_addr)
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Store the given state.
    pub fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.loop_handle.clone()
    }

    /// Resolve and record the socket's local address (client side, once the
    /// connect completes).
    pub fn resolve_local_addr(&self) {
        let addr = self.lock_inner().stream.local_addr();
        match addr {
            Ok(addr) => *self.lock(&self.local_addr) = Some(addr),
            Err(e) => error!(error = %e, "getsockname failed"),
        }
    }

    /// Re-issue `connect` on the underlying socket (non-blocking connect
    /// completion check).
    pub fn connect_peer(&self) -> io::Result<()> {
        let inner = self.lock_inner();
        SockRef::from(&inner.stream).connect(&SockAddr::from(self.peer_addr))
    }

    /// Arm read interest on the owning loop.
    pub fn listen_read(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.fd_event.listen(
            Direction::Read,
            Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.on_read();
                }
            }),
        );
        self.update_interest();
    }

    /// Arm write interest on the owning loop.
    pub fn listen_write(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.fd_event.listen(
            Direction::Write,
            Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.on_write();
                }
            }),
        );
        self.update_interest();
    }

    /// Queue an outbound message; encoded and flushed on the next writable
    /// event, after which `done` runs (client side).
    pub fn push_send(&self, message: RpcMessage, done: Option<SendCallback>) {
        self.lock_inner().pending_sends.push(PendingSend {
            message,
            done,
            encoded: false,
        });
    }

    /// Register a reply correlation: `done` runs when a reply carrying
    /// `msg_id` is decoded (client side).
    pub fn push_read(&self, msg_id: &str, done: ReadCallback) {
        self.lock_inner().read_dones.insert(msg_id.to_string(), done);
    }

    /// Drop a pending reply correlation. A reply that later arrives for
    /// this msg-id is discarded with a warning.
    pub fn cancel_read(&self, msg_id: &str) -> bool {
        self.lock_inner().read_dones.remove(msg_id).is_some()
    }

    /// Encode `messages` into the out-buffer and re-arm write interest.
    /// Callable from any thread; the work is posted to the owning loop.
    pub fn reply(self: &Arc<Self>, messages: Vec<RpcMessage>) {
        if self.loop_handle.is_in_loop_thread() {
            self.reply_local(messages);
        } else {
            let conn = self.clone();
            self.loop_handle.post(move |_| conn.reply_local(messages));
        }
    }

    fn reply_local(self: &Arc<Self>, messages: Vec<RpcMessage>) {
        if self.state() == ConnState::Closed {
            debug!(fd = self.fd, "reply after close dropped");
            return;
        }
        {
            let mut inner = self.lock_inner();
            framed::encode_all(&messages, &mut inner.out_buf);
        }
        MESSAGES_SENT.add(messages.len() as u64);
        self.listen_write();
    }

    /// Half-close: send FIN, keep draining inbound bytes. The peer's own
    /// close then drives the read path to `clear`. Idempotent.
    pub fn shutdown(&self) {
        let state = self.state();
        if state == ConnState::Closed || state == ConnState::NotConnected {
            return;
        }
        self.set_state(ConnState::HalfClosing);
        let inner = self.lock_inner();
        if let Err(e) = inner.stream.shutdown(Shutdown::Both) {
            debug!(fd = self.fd, error = %e, "shutdown failed");
        }
    }

    /// Drop all interest, deregister from the owning loop, and mark
    /// `Closed`. Safe to call more than once.
    pub fn clear(&self) {
        if self.state() == ConnState::Closed {
            return;
        }
        self.fd_event.cancel(Direction::Read);
        self.fd_event.cancel(Direction::Write);
        let fd_event = self.fd_event.clone();
        if self.loop_handle.is_in_loop_thread() {
            if let Ok(el) = EventLoop::current() {
                el.delete_event(&fd_event);
            }
        } else {
            self.loop_handle.post(move |el| el.delete_event(&fd_event));
        }
        self.set_state(ConnState::Closed);
        CONNECTIONS_ACTIVE.decrement();
    }

    /// Readable event: drain the socket into the in-buffer, then decode and
    /// dispatch whatever complete frames arrived. While half-closing, the
    /// only job left is observing the peer's FIN (read returns zero).
    fn on_read(self: &Arc<Self>) {
        let state = self.state();
        if state != ConnState::Connected && state != ConnState::HalfClosing {
            debug!(fd = self.fd, state = ?state, "read event ignored");
            return;
        }

        let outcome = {
            let mut inner = self.lock_inner();
            let Inner { stream, in_buf, .. } = &mut *inner;
            let mut outcome = ReadOutcome::Drained;
            loop {
                if in_buf.writable() == 0 {
                    let capacity = in_buf.capacity();
                    in_buf.resize(capacity * 2);
                }
                let want = in_buf.writable();
                let n = match stream.read(in_buf.writable_tail_mut()) {
                    Ok(0) => {
                        outcome = ReadOutcome::PeerClosed;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!(fd = self.fd, peer = %self.peer_addr, error = %e, "read failed");
                        outcome = ReadOutcome::Failed;
                        break;
                    }
                };
                in_buf.move_write(n);
                if n < want {
                    break; // socket buffer drained, next read would block
                }
            }
            outcome
        };

        match outcome {
            ReadOutcome::PeerClosed => {
                info!(fd = self.fd, peer = %self.peer_addr, "peer closed");
                self.clear();
            }
            ReadOutcome::Failed => self.clear(),
            ReadOutcome::Drained => {
                if state == ConnState::Connected {
                    self.execute();
                }
            }
        }
    }

    /// Decode all complete frames and hand them onward: requests to the
    /// dispatcher (server), replies to their pending-read callbacks
    /// (client).
    fn execute(self: &Arc<Self>) {
        let messages = {
            let mut inner = self.lock_inner();
            framed::decode_all(&mut inner.in_buf)
        };
        if messages.is_empty() {
            return;
        }

        match self.role {
            ConnRole::Server => {
                let Some(dispatcher) = self.dispatcher.clone() else {
                    return;
                };
                for request in messages {
                    debug!(msg_id = %request.msg_id, peer = %self.peer_addr, "request received");
                    runtime::set_current(&request.msg_id, &request.method_name);
                    dispatcher.dispatch(request, self);
                }
            }
            ConnRole::Client => {
                for message in messages {
                    let done = self.lock_inner().read_dones.remove(&message.msg_id);
                    match done {
                        Some(done) => done(message),
                        None => {
                            warn!(msg_id = %message.msg_id, "reply with unknown msg id dropped")
                        }
                    }
                }
            }
        }
    }

    /// Writable event: encode queued client messages, flush the out-buffer,
    /// and drop OUT interest once drained.
    fn on_write(self: &Arc<Self>) {
        if self.state() != ConnState::Connected {
            debug!(fd = self.fd, state = ?self.state(), "write event ignored");
            return;
        }

        let mut finished = Vec::new();
        let mut failed = false;
        let mut all_sent = false;
        {
            let mut inner = self.lock_inner();
            let Inner {
                stream,
                out_buf,
                pending_sends,
                ..
            } = &mut *inner;

            if self.role == ConnRole::Client {
                for pending in pending_sends.iter_mut() {
                    if !pending.encoded {
                        framed::encode_into(&pending.message, out_buf);
                        pending.encoded = true;
                        MESSAGES_SENT.increment();
                    }
                }
            }

            loop {
                if out_buf.readable() == 0 {
                    all_sent = true;
                    break;
                }
                match stream.write(out_buf.readable_slice()) {
                    Ok(0) => {
                        failed = true;
                        break;
                    }
                    Ok(n) => {
                        out_buf.move_read(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!(fd = self.fd, peer = %self.peer_addr, error = %e, "write failed");
                        failed = true;
                        break;
                    }
                }
            }

            if all_sent && self.role == ConnRole::Client {
                finished = std::mem::take(pending_sends);
            }
        }

        if failed {
            self.clear();
            return;
        }

        if all_sent {
            // drop OUT interest so an empty buffer cannot spin the loop
            self.fd_event.cancel(Direction::Write);
            self.update_interest();
            for pending in finished {
                if let Some(done) = pending.done {
                    done(&pending.message);
                }
            }
        }
    }

    pub(crate) fn fd_event(&self) -> &Arc<FdEvent> {
        &self.fd_event
    }

    /// Reconcile this connection's interest mask with its owning loop.
    pub(crate) fn update_interest(&self) {
        let fd_event = self.fd_event.clone();
        if self.loop_handle.is_in_loop_thread() {
            if let Ok(el) = EventLoop::current() {
                el.add_event(&fd_event);
                return;
            }
        }
        self.loop_handle.post(move |el| el.add_event(&fd_event));
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // keep the active-connections gauge balanced for connections
        // dropped without going through clear()
        if self.state() != ConnState::Closed {
            CONNECTIONS_ACTIVE.decrement();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::event_loop::EventLoop;
    use std::net::TcpListener;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn test_conn() -> (Arc<Connection>, TcpStream) {
        let (client, server) = stream_pair();
        let peer = client.peer_addr().unwrap();
        let handle = EventLoop::current().unwrap().handle();
        let conn = Connection::new_client(handle, client, peer, 128).unwrap();
        (conn, server)
    }

    #[test]
    fn set_state_stores_its_argument() {
        let (conn, _peer) = test_conn();
        assert_eq!(conn.state(), ConnState::NotConnected);
        conn.set_state(ConnState::HalfClosing);
        assert_eq!(conn.state(), ConnState::HalfClosing);
        conn.set_state(ConnState::Connected);
        assert_eq!(conn.state(), ConnState::Connected);
    }

    #[test]
    fn clear_is_terminal_and_idempotent() {
        let (conn, _peer) = test_conn();
        conn.set_state(ConnState::Connected);
        conn.clear();
        assert_eq!(conn.state(), ConnState::Closed);
        conn.clear();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.fd_event.is_idle());
    }

    #[test]
    fn shutdown_only_from_connected_states() {
        let (conn, _peer) = test_conn();
        conn.shutdown(); // NotConnected: no-op
        assert_eq!(conn.state(), ConnState::NotConnected);
        conn.set_state(ConnState::Connected);
        conn.shutdown();
        assert_eq!(conn.state(), ConnState::HalfClosing);
        conn.shutdown(); // idempotent
        assert_eq!(conn.state(), ConnState::HalfClosing);
    }

    #[test]
    fn pending_read_can_be_cancelled() {
        let (conn, _peer) = test_conn();
        conn.push_read("77", Box::new(|_| {}));
        assert!(conn.cancel_read("77"));
        assert!(!conn.cancel_read("77"));
    }
}
