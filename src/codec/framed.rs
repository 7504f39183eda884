//! Framed binary codec.
//!
//! Wire frame (big-endian):
//!
//! ```text
//! [START = 0x02]
//! [TOTAL_LEN : u32]      whole frame, START and END included
//! [MSGID_LEN : u32][MSGID]
//! [METHOD_LEN: u32][METHOD]
//! [ERR_CODE  : i32]
//! [ERRINFO_LEN: u32][ERRINFO]
//! [PAYLOAD]              TOTAL_LEN - fixed overhead - variable lengths
//! [CHECK     : u32]      reserved, zero
//! [END   = 0x03]
//! ```
//!
//! The decoder is restartable: partial frames stay in the buffer untouched
//! and decode on a later call once the remaining bytes arrive.

use tracing::warn;

use crate::buffer::RingBuffer;
use crate::codec::message::RpcMessage;
use crate::metrics::FRAME_ERRORS;

pub const FRAME_START: u8 = 0x02;
pub const FRAME_END: u8 = 0x03;

/// START + TOTAL_LEN + MSGID_LEN + METHOD_LEN + ERR_CODE + ERRINFO_LEN +
/// CHECK + END.
const FIXED_OVERHEAD: usize = 26;

/// Frame length of `msg` once encoded.
pub fn encoded_len(msg: &RpcMessage) -> usize {
    FIXED_OVERHEAD
        + msg.msg_id.len()
        + msg.method_name.len()
        + msg.err_info.len()
        + msg.payload.len()
}

/// Append one framed message to `out`.
pub fn encode_into(msg: &RpcMessage, out: &mut RingBuffer) {
    let total = encoded_len(msg) as u32;
    out.write_all(&[FRAME_START]);
    out.write_all(&total.to_be_bytes());
    out.write_all(&(msg.msg_id.len() as u32).to_be_bytes());
    out.write_all(msg.msg_id.as_bytes());
    out.write_all(&(msg.method_name.len() as u32).to_be_bytes());
    out.write_all(msg.method_name.as_bytes());
    out.write_all(&msg.err_code.to_be_bytes());
    out.write_all(&(msg.err_info.len() as u32).to_be_bytes());
    out.write_all(msg.err_info.as_bytes());
    out.write_all(&msg.payload);
    out.write_all(&0u32.to_be_bytes());
    out.write_all(&[FRAME_END]);
}

/// Append each message in `msgs`, framed, to `out`.
pub fn encode_all(msgs: &[RpcMessage], out: &mut RingBuffer) {
    for msg in msgs {
        encode_into(msg, out);
    }
}

/// Extract every complete frame currently in `buf`.
///
/// Garbage before a START byte is discarded. A START whose frame does not
/// end in END is treated as stale: the scan resumes one byte past it. A
/// frame whose variable-length fields overrun its declared length is dropped
/// whole.
pub fn decode_all(buf: &mut RingBuffer) -> Vec<RpcMessage> {
    let mut messages = Vec::new();
    let data = buf.readable_slice();
    let len = data.len();
    let mut i = 0;

    loop {
        // scan for the next frame start, discarding anything before it
        match data[i..].iter().position(|&b| b == FRAME_START) {
            Some(p) => i += p,
            None => {
                i = len;
                break;
            }
        }

        if len - i < 5 {
            break; // partial: not even START + TOTAL_LEN yet
        }
        let total = read_u32(data, i + 1) as usize;
        if total < FIXED_OVERHEAD {
            // cannot be a frame header; stale START
            i += 1;
            continue;
        }
        if len - i < total {
            break; // partial frame, wait for more bytes
        }
        if data[i + total - 1] != FRAME_END {
            i += 1;
            continue;
        }

        match parse_frame(&data[i..i + total]) {
            Some(msg) => messages.push(msg),
            None => {
                FRAME_ERRORS.increment();
                warn!(total, "dropping malformed frame");
            }
        }
        i += total;
    }

    buf.move_read(i);
    messages
}

/// Parse one frame known to span `frame` exactly (START/END verified).
fn parse_frame(frame: &[u8]) -> Option<RpcMessage> {
    let total = frame.len();
    let mut pos = 5;

    let msg_id_len = read_u32(frame, pos) as usize;
    pos += 4;
    let msg_id = read_bytes(frame, &mut pos, msg_id_len, total)?;

    let method_len = read_u32_checked(frame, pos, total)?;
    pos += 4;
    let method = read_bytes(frame, &mut pos, method_len, total)?;

    if pos + 8 > total {
        return None;
    }
    let err_code = i32::from_be_bytes([frame[pos], frame[pos + 1], frame[pos + 2], frame[pos + 3]]);
    pos += 4;
    let err_info_len = read_u32(frame, pos) as usize;
    pos += 4;
    let err_info = read_bytes(frame, &mut pos, err_info_len, total)?;

    // payload runs to CHECK + END; a negative span means the variable
    // lengths overran the frame
    let tail = 5; // CHECK + END
    if pos + tail > total {
        return None;
    }
    let payload = frame[pos..total - tail].to_vec();

    Some(RpcMessage {
        msg_id: String::from_utf8_lossy(msg_id).into_owned(),
        method_name: String::from_utf8_lossy(method).into_owned(),
        err_code,
        err_info: String::from_utf8_lossy(err_info).into_owned(),
        payload,
    })
}

#[inline]
fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

#[inline]
fn read_u32_checked(data: &[u8], off: usize, total: usize) -> Option<usize> {
    if off + 4 > total {
        return None;
    }
    Some(read_u32(data, off) as usize)
}

#[inline]
fn read_bytes<'a>(frame: &'a [u8], pos: &mut usize, len: usize, total: usize) -> Option<&'a [u8]> {
    if *pos + len > total {
        return None;
    }
    let out = &frame[*pos..*pos + len];
    *pos += len;
    Some(out)
}
