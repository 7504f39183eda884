//! IPv4 address parsing and validation.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::Error;

/// Parse and validate an IPv4 address of the form `a.b.c.d:port`.
///
/// The port must be in `1..=65535`. Port 0 is accepted only through
/// [`parse_bind_addr`], where it means "pick an ephemeral port".
pub fn parse_addr(s: &str) -> Result<SocketAddr, Error> {
    let addr = parse_inner(s)?;
    if addr.port() == 0 {
        return Err(Error::InvalidAddress(format!("port out of range in {s:?}")));
    }
    Ok(SocketAddr::V4(addr))
}

/// Like [`parse_addr`] but permits port 0 for ephemeral binds.
pub fn parse_bind_addr(s: &str) -> Result<SocketAddr, Error> {
    Ok(SocketAddr::V4(parse_inner(s)?))
}

fn parse_inner(s: &str) -> Result<SocketAddrV4, Error> {
    let (ip, port) = s
        .split_once(':')
        .ok_or_else(|| Error::InvalidAddress(format!("missing ':' in {s:?}")))?;
    if ip.is_empty() || port.is_empty() {
        return Err(Error::InvalidAddress(format!("empty ip or port in {s:?}")));
    }
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("bad ipv4 in {s:?}")))?;
    // u16 parse enforces the 65535 upper bound
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("port out of range in {s:?}")))?;
    Ok(SocketAddrV4::new(ip, port))
}
