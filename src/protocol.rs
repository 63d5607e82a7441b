//! Binary wire framing for the document sync channel.
//!
//! Every WebSocket message on the `/ws` channel is a length-prefixed frame:
//!
//! ```text
//! ┌───────────┬──────────────────────────────┐
//! │ varuint   │ body                         │
//! │ msg type  │ (layout depends on type)     │
//! └───────────┴──────────────────────────────┘
//! ```
//!
//! - type 0 `sync`      — `varuint subtype || varbuf payload`; subtype 0 is a
//!   state-vector query (step 1), subtype 1 a state diff (step 2), subtype 2
//!   an incremental update.
//! - type 1 `awareness` — `varbuf` holding an awareness update blob.
//! - type 2 `file-op`   — opaque body, relayed verbatim.
//!
//! Integers use the 7-bit little-endian varint encoding shared with the
//! client, so frames produced here are readable by stock editor plugins.

use thiserror::Error;

pub const MSG_SYNC: u64 = 0;
pub const MSG_AWARENESS: u64 = 1;
pub const MSG_FILE_OP: u64 = 2;

pub const SYNC_STEP_1: u64 = 0;
pub const SYNC_STEP_2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame truncated")]
    UnexpectedEof,
    #[error("varint too long")]
    VarIntOverflow,
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown message type {0}")]
    UnknownType(u64),
}

/// A decoded inbound frame. Payload slices borrow from the raw message so
/// relaying stays copy-free.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Sync(SyncMessage<'a>),
    Awareness(&'a [u8]),
    /// Body is opaque to the server; the caller relays the original bytes.
    FileOp,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SyncMessage<'a> {
    /// Step 1: the sender's state vector, asking for what it is missing.
    Step1(&'a [u8]),
    /// Step 2: an update answering a step-1 query.
    Step2(&'a [u8]),
    /// An incremental update.
    Update(&'a [u8]),
}

pub fn write_var_u64(buf: &mut Vec<u8>, mut n: u64) {
    while n >= 0x80 {
        buf.push(0x80 | (n as u8 & 0x7F));
        n >>= 7;
    }
    buf.push(n as u8);
}

pub fn read_var_u64(input: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *input.get(*pos).ok_or(ProtocolError::UnexpectedEof)?;
        *pos += 1;
        if shift >= 64 {
            return Err(ProtocolError::VarIntOverflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn write_var_buf(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn read_var_buf<'a>(input: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = read_var_u64(input, pos)? as usize;
    let end = pos.checked_add(len).ok_or(ProtocolError::UnexpectedEof)?;
    if end > input.len() {
        return Err(ProtocolError::UnexpectedEof);
    }
    let slice = &input[*pos..end];
    *pos = end;
    Ok(slice)
}

pub fn read_var_string<'a>(input: &'a [u8], pos: &mut usize) -> Result<&'a str, ProtocolError> {
    let raw = read_var_buf(input, pos)?;
    std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)
}

pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_buf(buf, s.as_bytes());
}

/// Decode one inbound frame. Unknown types surface as an error so the caller
/// can drop them without replying.
pub fn decode_frame(data: &[u8]) -> Result<Frame<'_>, ProtocolError> {
    let mut pos = 0;
    match read_var_u64(data, &mut pos)? {
        MSG_SYNC => {
            let subtype = read_var_u64(data, &mut pos)?;
            let payload = read_var_buf(data, &mut pos)?;
            let msg = match subtype {
                SYNC_STEP_1 => SyncMessage::Step1(payload),
                SYNC_STEP_2 => SyncMessage::Step2(payload),
                SYNC_UPDATE => SyncMessage::Update(payload),
                other => return Err(ProtocolError::UnknownType(other)),
            };
            Ok(Frame::Sync(msg))
        }
        MSG_AWARENESS => {
            let payload = read_var_buf(data, &mut pos)?;
            Ok(Frame::Awareness(payload))
        }
        MSG_FILE_OP => Ok(Frame::FileOp),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn encode_sync(subtype: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 8);
    write_var_u64(&mut buf, MSG_SYNC);
    write_var_u64(&mut buf, subtype);
    write_var_buf(&mut buf, payload);
    buf
}

pub fn encode_sync_step1(state_vector: &[u8]) -> Vec<u8> {
    encode_sync(SYNC_STEP_1, state_vector)
}

pub fn encode_sync_step2(update: &[u8]) -> Vec<u8> {
    encode_sync(SYNC_STEP_2, update)
}

pub fn encode_sync_update(update: &[u8]) -> Vec<u8> {
    encode_sync(SYNC_UPDATE, update)
}

pub fn encode_awareness(blob: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(blob.len() + 8);
    write_var_u64(&mut buf, MSG_AWARENESS);
    write_var_buf(&mut buf, blob);
    buf
}
