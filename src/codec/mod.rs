//! Wire protocol: logical RPC messages and the framed binary codec.

pub mod framed;
pub mod message;

pub use framed::{decode_all, encode_all, encode_into};
pub use message::{error_code, RpcError, RpcMessage};
