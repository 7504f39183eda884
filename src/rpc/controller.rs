use std::net::SocketAddr;

/// Per-call context handed to a service method.
///
/// One controller exists per in-flight request; it is released when the
/// reply closure has run.
#[derive(Debug, Clone)]
pub struct RpcController {
    msg_id: String,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
}

impl RpcController {
    pub fn new(msg_id: String, local_addr: Option<SocketAddr>, peer_addr: SocketAddr) -> Self {
        RpcController {
            msg_id,
            local_addr,
            peer_addr,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}
