//! Service registry and request dispatch.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::codec::message::{error_code, RpcMessage};
use crate::metrics::{DISPATCH_ERRORS, REQUESTS_DISPATCHED};
use crate::net::connection::Connection;
use crate::rpc::controller::RpcController;
use crate::runtime;

/// Why a service could not invoke a method. The dispatcher turns these into
/// structured error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodError {
    /// The method name is not part of this service.
    UnknownMethod,
    /// The request payload failed to parse.
    Deserialize,
}

/// Response payload serialization failed inside a reply closure.
#[derive(Debug)]
pub struct SerializeError(pub String);

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "serialize failed: {}", self.0)
    }
}

/// Completion closure handed to a service method.
///
/// Run it exactly once with the serialized response payload; the dispatcher
/// wraps the bytes into the reply frame and routes it back through the
/// connection's owning loop. Safe to run from any thread, including after
/// the dispatching call has returned. A service that returns an error from
/// `call_method` must not have run the closure.
pub type ReplyClosure = Box<dyn FnOnce(Result<Vec<u8>, SerializeError>) + Send>;

/// A registered service: a bundle of callable methods under one name.
///
/// Implementations parse the raw request payload themselves and report
/// parse failures through [`MethodError::Deserialize`].
pub trait RpcService: Send + Sync + 'static {
    /// The full service name requests address, the part before the `.` in
    /// `service.method`.
    fn full_name(&self) -> &str;

    /// Invoke `method` with the raw request payload. `done` eventually
    /// receives the serialized response payload.
    fn call_method(
        &self,
        method: &str,
        controller: RpcController,
        request: &[u8],
        done: ReplyClosure,
    ) -> Result<(), MethodError>;
}

/// Maps full service names to handlers and resolves each request to a
/// method invocation.
///
/// Registration happens before traffic is served; registering concurrently
/// with dispatch is not supported.
pub struct RpcDispatcher {
    services: Mutex<HashMap<String, Arc<dyn RpcService>>>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        RpcDispatcher {
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `service` under its full name.
    pub fn register(&self, service: Arc<dyn RpcService>) {
        let name = service.full_name().to_string();
        let previous = self
            .services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), service);
        if previous.is_some() {
            warn!(service = %name, "service re-registered, replacing handler");
        }
        debug!(service = %name, "service registered");
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Resolve `request` to a handler method and invoke it. Every failure
    /// mode becomes a structured reply on `connection`; dispatch itself
    /// never fails.
    pub fn dispatch(&self, request: RpcMessage, connection: &Arc<Connection>) {
        let mut response = RpcMessage {
            msg_id: request.msg_id.clone(),
            method_name: request.method_name.clone(),
            ..RpcMessage::default()
        };

        let Some((service_name, method_name)) = split_full_name(&request.method_name) else {
            error!(msg_id = %request.msg_id, full_name = %request.method_name, "cannot parse service name");
            response.set_error(error_code::PARSE_SERVICE_NAME, "parse service name error");
            DISPATCH_ERRORS.increment();
            connection.reply(vec![response]);
            return;
        };

        let Some(service) = self.lookup(service_name) else {
            error!(msg_id = %request.msg_id, service = %service_name, "service not found");
            response.set_error(error_code::SERVICE_NOT_FOUND, "service not found");
            DISPATCH_ERRORS.increment();
            connection.reply(vec![response]);
            return;
        };

        let controller = RpcController::new(
            request.msg_id.clone(),
            connection.local_addr(),
            connection.peer_addr(),
        );
        runtime::set_current(&request.msg_id, method_name);

        let conn = connection.clone();
        let msg_id = request.msg_id.clone();
        let done: ReplyClosure = Box::new(move |payload| {
            let mut response = response;
            match payload {
                Ok(bytes) => {
                    response.err_code = 0;
                    response.err_info.clear();
                    response.payload = bytes;
                }
                Err(e) => {
                    error!(msg_id = %msg_id, error = %e, "response serialization failed");
                    response.set_error(error_code::SERIALIZE_FAILED, "serialize error");
                }
            }
            conn.reply(vec![response]);
        });

        REQUESTS_DISPATCHED.increment();
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
            service.call_method(method_name, controller, &request.payload, done)
        }));

        match invoked {
            Ok(Ok(())) => {}
            Ok(Err(MethodError::UnknownMethod)) => {
                error!(msg_id = %request.msg_id, method = %method_name, service = %service_name, "method not found");
                let mut response = error_reply(&request);
                response.set_error(error_code::SERVICE_NOT_FOUND, "method not found");
                DISPATCH_ERRORS.increment();
                connection.reply(vec![response]);
            }
            Ok(Err(MethodError::Deserialize)) => {
                error!(msg_id = %request.msg_id, method = %method_name, "request deserialize failed");
                let mut response = error_reply(&request);
                response.set_error(error_code::DESERIALIZE_FAILED, "deserialize error");
                DISPATCH_ERRORS.increment();
                connection.reply(vec![response]);
            }
            Err(_) => {
                // handler panicked; the worker thread survives and the
                // caller's timeout covers the missing reply
                error!(msg_id = %request.msg_id, method = %method_name, "handler panicked");
                DISPATCH_ERRORS.increment();
            }
        }
    }
}

impl Default for RpcDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn error_reply(request: &RpcMessage) -> RpcMessage {
    RpcMessage {
        msg_id: request.msg_id.clone(),
        method_name: request.method_name.clone(),
        ..RpcMessage::default()
    }
}

/// Split `service.method` on the first dot.
pub(crate) fn split_full_name(full: &str) -> Option<(&str, &str)> {
    if full.is_empty() {
        return None;
    }
    full.split_once('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedService(&'static str);

    impl RpcService for NamedService {
        fn full_name(&self) -> &str {
            self.0
        }

        fn call_method(
            &self,
            method: &str,
            _controller: RpcController,
            _request: &[u8],
            done: ReplyClosure,
        ) -> Result<(), MethodError> {
            match method {
                "run" => {
                    done(Ok(self.0.as_bytes().to_vec()));
                    Ok(())
                }
                _ => Err(MethodError::UnknownMethod),
            }
        }
    }

    #[test]
    fn split_requires_a_dot() {
        assert_eq!(split_full_name("Echo.say"), Some(("Echo", "say")));
        assert_eq!(split_full_name("a.b.c"), Some(("a", "b.c")));
        assert_eq!(split_full_name(""), None);
        assert_eq!(split_full_name("nodot"), None);
    }

    #[test]
    fn registered_service_resolves_by_name() {
        let dispatcher = RpcDispatcher::new();
        dispatcher.register(Arc::new(NamedService("Order")));
        dispatcher.register(Arc::new(NamedService("User")));

        assert!(dispatcher.lookup("Order").is_some());
        assert!(dispatcher.lookup("User").is_some());
        assert!(dispatcher.lookup("Ghost").is_none());
    }

    #[test]
    fn re_registration_replaces() {
        let dispatcher = RpcDispatcher::new();
        dispatcher.register(Arc::new(NamedService("Order")));
        dispatcher.register(Arc::new(NamedService("Order")));
        assert!(dispatcher.lookup("Order").is_some());
    }
}
