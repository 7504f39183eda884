//! girder: a multi-threaded RPC framework built on a reactor event loop.
//!
//! A fixed pool of worker threads each runs one single-threaded reactor.
//! The main thread's reactor owns the listening socket; accepted
//! connections are handed to a worker round-robin and stay pinned to it for
//! their lifetime. Requests are length-prefixed binary frames carrying a
//! caller-chosen msg-id, a `service.method` name, and an opaque payload;
//! the dispatcher routes each request to a registered [`RpcService`] and a
//! reply closure carries the response back through the connection's owning
//! loop. The client facade originates requests and correlates replies by
//! msg-id.
//!
//! # Server
//!
//! ```no_run
//! use std::sync::Arc;
//! use girder::{Config, MethodError, ReplyClosure, RpcController, RpcService, TcpServer};
//!
//! struct Echo;
//!
//! impl RpcService for Echo {
//!     fn full_name(&self) -> &str {
//!         "Echo"
//!     }
//!
//!     fn call_method(
//!         &self,
//!         method: &str,
//!         _controller: RpcController,
//!         request: &[u8],
//!         done: ReplyClosure,
//!     ) -> Result<(), MethodError> {
//!         match method {
//!             "say" => {
//!                 done(Ok(request.to_vec()));
//!                 Ok(())
//!             }
//!             _ => Err(MethodError::UnknownMethod),
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), girder::Error> {
//!     let config = Config::default();
//!     girder::logging::init(&config);
//!     let server = TcpServer::new("127.0.0.1:12345", &config)?;
//!     server.register_service(Arc::new(Echo));
//!     server.start()
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod rpc;
pub mod runtime;

pub use buffer::RingBuffer;
pub use codec::{error_code, RpcError, RpcMessage};
pub use config::{Config, LogLevel};
pub use error::Error;
pub use net::{
    ConnRole, ConnState, Connection, EventLoop, IoThreadPool, LoopHandle, ShutdownHandle,
    TcpClient, TcpServer, Timer,
};
pub use rpc::{MethodError, ReplyClosure, RpcController, RpcDispatcher, RpcService, SerializeError};
