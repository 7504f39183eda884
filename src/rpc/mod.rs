//! Service registry, request dispatch, and per-call context.

pub mod controller;
pub mod dispatcher;

pub use controller::RpcController;
pub use dispatcher::{MethodError, ReplyClosure, RpcDispatcher, RpcService, SerializeError};
