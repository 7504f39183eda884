use std::fmt;

/// Framework-level RPC error codes carried in the `err_code` frame field and
/// surfaced by the client facade.
pub mod error_code {
    /// Malformed method-full-name (no `service.method` split).
    pub const PARSE_SERVICE_NAME: i32 = 10001;
    /// Service or method unknown.
    pub const SERVICE_NOT_FOUND: i32 = 10002;
    /// Request payload failed to parse.
    pub const DESERIALIZE_FAILED: i32 = 10003;
    /// Response payload failed to serialize.
    pub const SERIALIZE_FAILED: i32 = 10004;
    /// Connection refused or peer closed.
    pub const PEER_CLOSED: i32 = 10005;
    /// Non-specific connect failure.
    pub const FAILED_CONNECT: i32 = 10006;
}

/// One logical RPC message: a request or a reply.
///
/// `msg_id` is a caller-chosen opaque string correlating a request with its
/// reply. `method_name` is the full `service.method` name. The payload is
/// opaque to the framework.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcMessage {
    pub msg_id: String,
    pub method_name: String,
    pub err_code: i32,
    pub err_info: String,
    pub payload: Vec<u8>,
}

impl RpcMessage {
    /// Build a request message.
    pub fn request(msg_id: impl Into<String>, method_name: impl Into<String>, payload: Vec<u8>) -> Self {
        RpcMessage {
            msg_id: msg_id.into(),
            method_name: method_name.into(),
            err_code: 0,
            err_info: String::new(),
            payload,
        }
    }

    /// Mark this message as a framework error reply.
    pub fn set_error(&mut self, code: i32, info: impl Into<String>) {
        self.err_code = code;
        self.err_info = info.into();
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.err_code == 0
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[msg_id:{}, method:{}, err_code:{}, payload:{}B]",
            self.msg_id,
            self.method_name,
            self.err_code,
            self.payload.len()
        )
    }
}

/// A per-call error as seen by callers: an `error_code` value plus text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub info: String,
}

impl RpcError {
    pub fn new(code: i32, info: impl Into<String>) -> Self {
        RpcError {
            code,
            info: info.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.info)
    }
}

impl std::error::Error for RpcError {}
