//! Server facade: acceptor on the main loop, connections on the workers.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::Error;
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::net::acceptor::Acceptor;
use crate::net::addr;
use crate::net::connection::{ConnState, Connection};
use crate::net::event_loop::{EventLoop, LoopHandle};
use crate::net::fd_event::{Direction, FdEvent};
use crate::net::io_thread::IoThreadPool;
use crate::net::timer::Timer;
use crate::rpc::dispatcher::{RpcDispatcher, RpcService};

/// How often closed connections are reaped from the client set.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// RPC server: one acceptor on the calling thread's loop, a fixed pool of
/// worker loops owning the connections.
///
/// Register every service before calling [`start`](Self::start); `start`
/// blocks in the main event loop until a [`ShutdownHandle`] stops it.
pub struct TcpServer {
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    main_loop: Rc<EventLoop>,
    pool: IoThreadPool,
    listen_event: Arc<FdEvent>,
    clients: Arc<Mutex<Vec<Arc<Connection>>>>,
    dispatcher: Arc<RpcDispatcher>,
    buffer_size: usize,
}

impl TcpServer {
    /// Bind `addr` (IPv4 `a.b.c.d:port`; port 0 binds an ephemeral port)
    /// and spawn the IO worker pool. Bind or listen failure aborts
    /// construction.
    pub fn new(addr: &str, config: &Config) -> Result<Self, Error> {
        let bind_addr = addr::parse_bind_addr(addr)?;
        let acceptor = Arc::new(Acceptor::bind(bind_addr)?);
        let local_addr = acceptor.local_addr();
        let main_loop = EventLoop::current()?;
        let pool = IoThreadPool::new(config.io_threads)?;
        let listen_event = Arc::new(FdEvent::new(acceptor.raw_fd()));

        info!(addr = %local_addr, workers = pool.len(), "server listening");

        Ok(TcpServer {
            local_addr,
            acceptor,
            main_loop,
            pool,
            listen_event,
            clients: Arc::new(Mutex::new(Vec::new())),
            dispatcher: Arc::new(RpcDispatcher::new()),
            buffer_size: config.buffer_size,
        })
    }

    /// Register a service. Expected before [`start`](Self::start).
    pub fn register_service(&self, service: Arc<dyn RpcService>) {
        self.dispatcher.register(service);
    }

    /// The bound address, with the real port for ephemeral binds.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops the main loop and every worker loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        let mut handles = vec![self.main_loop.handle()];
        handles.extend(self.pool.handles());
        ShutdownHandle { handles }
    }

    /// Arm the acceptor and the cleanup timer, wait for the worker pool,
    /// and run the main loop until stopped.
    pub fn start(&self) -> Result<(), Error> {
        self.pool.start()?;

        let acceptor = self.acceptor.clone();
        let clients = self.clients.clone();
        let dispatcher = self.dispatcher.clone();
        let handles: Arc<[LoopHandle]> = self.pool.handles().into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let buffer_size = self.buffer_size;
        let local_addr = self.local_addr;
        self.listen_event.listen(
            Direction::Read,
            Arc::new(move || {
                on_accept(
                    &acceptor,
                    &clients,
                    &dispatcher,
                    &handles,
                    &cursor,
                    buffer_size,
                    local_addr,
                );
            }),
        );
        self.main_loop.add_event(&self.listen_event);

        let clients = self.clients.clone();
        self.main_loop.add_timer(Timer::repeating(
            CLEANUP_INTERVAL,
            Arc::new(move || {
                let mut clients = clients.lock().unwrap_or_else(|e| e.into_inner());
                let before = clients.len();
                clients.retain(|conn| conn.state() != ConnState::Closed);
                let reaped = before - clients.len();
                if reaped > 0 {
                    debug!(reaped, remaining = clients.len(), "reaped closed connections");
                }
            }),
        ));

        self.main_loop.run();
        Ok(())
    }
}

/// Readable event on the listen fd: accept until the backlog drains, handing
/// each connection to the next worker round-robin.
fn on_accept(
    acceptor: &Acceptor,
    clients: &Mutex<Vec<Arc<Connection>>>,
    dispatcher: &Arc<RpcDispatcher>,
    handles: &[LoopHandle],
    cursor: &AtomicUsize,
    buffer_size: usize,
    local_addr: SocketAddr,
) {
    loop {
        match acceptor.accept() {
            Ok((stream, peer_addr)) => {
                CONNECTIONS_ACCEPTED.increment();
                let index = cursor.fetch_add(1, Ordering::Relaxed) % handles.len();
                let handle = handles[index].clone();

                let conn = match Connection::new_server(
                    handle.clone(),
                    stream,
                    peer_addr,
                    local_addr,
                    buffer_size,
                    dispatcher.clone(),
                ) {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(peer = %peer_addr, error = %e, "failed to set up connection");
                        continue;
                    }
                };
                conn.set_state(ConnState::Connected);
                clients
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(conn.clone());
                info!(fd = conn.fd(), peer = %peer_addr, worker = index, "client accepted");

                // arm read interest from the worker's own thread so the
                // connection is only ever driven by its owning loop
                handle.post(move |_| conn.listen_read());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break, // already logged by the acceptor
        }
    }
}

/// Stops the server's main loop and its worker loops. Cloneable and usable
/// from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    handles: Vec<LoopHandle>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.stop();
        }
    }
}
