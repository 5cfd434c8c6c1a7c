use bytes::{BufMut, BytesMut};

use crate::errors::{ProtocolError, WsError};
use crate::mask::apply_mask;

/// headroom reserved in front of every payload buffer handed to a sink
pub const PRE_PADDING: usize = 4;
/// spare bytes reserved after every payload buffer handed to a sink
pub const POST_PADDING: usize = 4;

/// frame kinds of the v7+ opcode space the endpoint handles itself
///
/// reserved opcodes have no variant here; they are carried as raw
/// nibbles and offered to extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// x0 continuation of a fragmented message
    Continue,
    /// x1 text frame
    Text,
    /// x2 binary frame
    Binary,
    /// x8 connection close
    Close,
    /// x9 ping
    Ping,
    /// xA pong
    Pong,
}

impl OpCode {
    /// corresponding v7+ opcode nibble
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    /// classify a v7+ opcode nibble, `None` for reserved values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Continue),
            1 => Some(OpCode::Text),
            2 => Some(OpCode::Binary),
            8 => Some(OpCode::Close),
            9 => Some(OpCode::Ping),
            10 => Some(OpCode::Pong),
            _ => None,
        }
    }
}

/// translate a pre-v7 opcode nibble into the v7+ encoding
///
/// the drafts up to 6 numbered the control frames first; reserved
/// values are a protocol violation there
pub fn remap_legacy_opcode(nibble: u8) -> Result<u8, ProtocolError> {
    match nibble {
        0 => Ok(0),
        1 => Ok(8),
        2 => Ok(9),
        3 => Ok(10),
        4 => Ok(1),
        5 => Ok(2),
        other => Err(ProtocolError::InvalidOpcode(other)),
    }
}

/// what an outbound write carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// raw bytes, no frame header
    Http,
    /// text data frame
    Text,
    /// binary data frame
    Binary,
    /// close control frame
    Close,
    /// ping control frame
    Ping,
    /// pong control frame
    Pong,
}

impl WriteKind {
    /// opcode written on the wire for framed kinds, `None` for raw
    /// http bytes
    pub fn opcode(self) -> Option<OpCode> {
        match self {
            WriteKind::Http => None,
            WriteKind::Text => Some(OpCode::Text),
            WriteKind::Binary => Some(OpCode::Binary),
            WriteKind::Close => Some(OpCode::Close),
            WriteKind::Ping => Some(OpCode::Ping),
            WriteKind::Pong => Some(OpCode::Pong),
        }
    }
}

/// decoded header of the frame currently being received
///
/// the opcode is always stored in the v7+ encoding, whatever revision
/// put it on the wire
#[derive(Debug, Default, Clone)]
pub struct FrameHeader {
    /// opcode nibble, v7+ encoding
    pub opcode: u8,
    /// the three rsv bits, still in wire position (bits 6..4)
    pub rsv: u8,
    /// final fragment flag
    pub fin: bool,
    /// whether a 4 byte mask key follows the length
    pub masked: bool,
    /// declared payload length
    pub payload_len: u64,
}

/// payload buffer with sink headroom
///
/// buffers handed to a [`FrameSink`](crate::hooks::FrameSink) keep
/// [`PRE_PADDING`] writable bytes in front of the payload and
/// [`POST_PADDING`] after it, so a sink can frame small payloads in
/// place without copying them
#[derive(Debug)]
pub struct PaddedBuf {
    buf: BytesMut,
    room: usize,
}

impl PaddedBuf {
    /// allocate with room for `room` payload bytes plus both paddings
    pub fn with_capacity(room: usize) -> Self {
        let mut buf = BytesMut::with_capacity(PRE_PADDING + room + POST_PADDING);
        buf.resize(PRE_PADDING, 0);
        Self { buf, room }
    }

    /// append one payload byte
    pub fn push(&mut self, c: u8) {
        self.buf.put_u8(c);
    }

    /// append payload bytes
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// payload bytes accumulated so far
    pub fn fill(&self) -> usize {
        self.buf.len() - PRE_PADDING
    }

    /// the accumulated payload
    pub fn payload(&self) -> &[u8] {
        &self.buf[PRE_PADDING..]
    }

    /// detach the payload, leaving the buffer empty and still padded
    pub fn take(&mut self) -> BytesMut {
        let chunk = self.buf.split_off(PRE_PADDING);
        self.buf.reserve(self.room + POST_PADDING);
        chunk
    }

    /// drop the payload, keeping the headroom
    pub fn clear(&mut self) {
        self.buf.truncate(PRE_PADDING);
    }

    /// whole buffer including both paddings, ready to hand to a sink
    ///
    /// appends the post padding; callers reset with [`clear`](Self::clear)
    /// or [`take`](Self::take) afterwards
    pub fn for_sink(&mut self) -> &mut [u8] {
        let len = self.buf.len();
        self.buf.resize(len + POST_PADDING, 0);
        &mut self.buf[..]
    }
}

/// write a frame header into the headroom of a padded buffer
///
/// `buf` is laid out as headroom, `len` payload bytes, post padding.
/// returns the offset where the wire bytes start. only headers that fit
/// the headroom can be placed here: unmasked frames up to 65535 bytes.
/// anything larger goes through [`encode_frame`]. http writes pass the
/// payload through unframed
pub fn encode_in_place(buf: &mut [u8], len: usize, kind: WriteKind) -> Result<usize, WsError> {
    let opcode = match kind.opcode() {
        Some(op) => op.as_u8(),
        None => return Ok(PRE_PADDING),
    };
    if len <= 125 {
        buf[PRE_PADDING - 2] = 0x80 | opcode;
        buf[PRE_PADDING - 1] = len as u8;
        Ok(PRE_PADDING - 2)
    } else if len <= 65535 {
        buf[PRE_PADDING - 4] = 0x80 | opcode;
        buf[PRE_PADDING - 3] = 126;
        buf[PRE_PADDING - 2..PRE_PADDING].copy_from_slice(&(len as u16).to_be_bytes());
        Ok(PRE_PADDING - 4)
    } else {
        Err(WsError::HeadroomExceeded)
    }
}

/// encode a complete final frame into an owned buffer
///
/// masks the payload when a key is given, as client to server frames
/// require from v7 on
pub fn encode_frame(kind: WriteKind, mask: Option<[u8; 4]>, payload: &[u8]) -> BytesMut {
    let opcode = match kind.opcode() {
        Some(op) => op.as_u8(),
        None => return BytesMut::from(payload),
    };
    let mut buf = BytesMut::with_capacity(payload.len() + 14);
    buf.put_u8(0x80 | opcode);
    let mask_bit: u8 = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        0..=125 => buf.put_u8(mask_bit | payload.len() as u8),
        126..=65535 => {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(payload.len() as u16);
        }
        _ => {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(payload.len() as u64);
        }
    }
    match mask {
        Some(key) => {
            buf.extend_from_slice(&key);
            let at = buf.len();
            buf.extend_from_slice(payload);
            apply_mask(&mut buf[at..], key);
        }
        None => buf.extend_from_slice(payload),
    }
    buf
}
