//! Networking core: reactor, timers, worker pool, connections, and the
//! server/client facades.

pub mod acceptor;
pub mod addr;
pub mod connection;
pub mod event_loop;
pub mod fd_event;
pub mod io_thread;
pub mod tcp_client;
pub mod tcp_server;
pub mod timer;

pub use acceptor::Acceptor;
pub use connection::{ConnRole, ConnState, Connection, ReadCallback, SendCallback};
pub use event_loop::{EventLoop, LoopHandle, LoopTask};
pub use fd_event::{Direction, EventCallback, FdEvent};
pub use io_thread::{IoThread, IoThreadPool};
pub use tcp_client::{ConnectCallback, TcpClient};
pub use tcp_server::{ShutdownHandle, TcpServer};
pub use timer::{Timer, TimerCallback, TimerHeap};
