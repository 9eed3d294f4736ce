//! WebSocket frame format (RFC 6455 §5): decoder for client frames, encoder
//! for server frames, and message reassembly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::gateway::event::Message;

/// Close codes used by the gateway.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Peer closed without a status code. Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame. Never sent on the wire.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Control frame payloads are limited to 125 bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(OpCode::Continuation),
            1 => Some(OpCode::Text),
            2 => Some(OpCode::Binary),
            8 => Some(OpCode::Close),
            9 => Some(OpCode::Ping),
            10 => Some(OpCode::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Bytes,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("client frame is not masked")]
    Unmasked,
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("control frame is fragmented or longer than 125 bytes")]
    InvalidControlFrame,
    #[error("message exceeds {0} bytes")]
    TooLarge(usize),
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed close frame")]
    InvalidClose,
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    ExpectedContinuation,
}

impl FrameError {
    /// The close code sent to the peer for this error.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::TooLarge(_) => close_code::MESSAGE_TOO_BIG,
            FrameError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

/// Decodes one client frame from the front of `buf`.
///
/// Returns `Ok(None)` until the whole frame has arrived; nothing is consumed
/// in that case. `max_payload` bounds a single frame.
pub fn decode_frame(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = OpCode::from_u8(b0 & 0x0f).ok_or(FrameError::UnknownOpcode(b0 & 0x0f))?;
    if b1 & 0x80 == 0 {
        return Err(FrameError::Unmasked);
    }

    let (len, mut offset) = match b1 & 0x7f {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        len7 => (len7 as u64, 2),
    };

    if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD as u64) {
        return Err(FrameError::InvalidControlFrame);
    }
    if len > max_payload as u64 {
        return Err(FrameError::TooLarge(max_payload));
    }

    let len = len as usize;
    if buf.len() < offset + 4 + len {
        return Ok(None);
    }
    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[offset..offset + 4]);
    offset += 4;

    buf.advance(offset);
    let mut payload = buf.split_to(len);
    apply_mask(&mut payload, mask);

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

fn put_header(fin: bool, opcode: OpCode, len: usize, masked: bool, out: &mut BytesMut) {
    let fin_bit = if fin { 0x80 } else { 0 };
    let mask_bit = if masked { 0x80 } else { 0 };
    out.put_u8(fin_bit | opcode.as_u8());
    if len < 126 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }
}

/// Encodes a single unfragmented server frame (servers never mask).
pub fn encode_frame(opcode: OpCode, payload: &[u8], out: &mut BytesMut) {
    out.reserve(payload.len() + 10);
    put_header(true, opcode, payload.len(), false, out);
    out.put_slice(payload);
}

/// Encodes a masked frame as a client would send it.
pub fn encode_client_frame(
    fin: bool,
    opcode: OpCode,
    payload: &[u8],
    mask: [u8; 4],
    out: &mut BytesMut,
) {
    out.reserve(payload.len() + 14);
    put_header(fin, opcode, payload.len(), true, out);
    out.put_slice(&mask);
    let start = out.len();
    out.put_slice(payload);
    apply_mask(&mut out[start..], mask);
}

/// Encodes a close frame. The reason is cut to fit a control frame.
pub fn encode_close(code: u16, reason: &str, out: &mut BytesMut) {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    encode_frame(OpCode::Close, &payload, out);
}

/// Splits a close payload into code and reason. An empty payload means no
/// status was given.
pub fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), FrameError> {
    match payload.len() {
        0 => Ok((close_code::NO_STATUS, String::new())),
        1 => Err(FrameError::InvalidClose),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(FrameError::InvalidClose);
            }
            let reason =
                std::str::from_utf8(&payload[2..]).map_err(|_| FrameError::InvalidUtf8)?;
            Ok((code, reason.to_string()))
        }
    }
}

/// Codes a peer may legitimately put in a close frame.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// What a complete client frame (or frame sequence) amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

/// Reassembles fragmented data frames into messages. Control frames may
/// arrive between fragments and pass straight through.
#[derive(Debug)]
pub struct MessageAssembler {
    kind: Option<OpCode>,
    buffer: BytesMut,
    max_message: usize,
}

impl MessageAssembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            kind: None,
            buffer: BytesMut::new(),
            max_message,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<Option<Incoming>, FrameError> {
        match frame.opcode {
            OpCode::Ping => Ok(Some(Incoming::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Incoming::Pong(frame.payload))),
            OpCode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload)?;
                Ok(Some(Incoming::Close { code, reason }))
            }
            OpCode::Text | OpCode::Binary => {
                if self.kind.is_some() {
                    return Err(FrameError::ExpectedContinuation);
                }
                if frame.fin {
                    return finish(frame.opcode, frame.payload).map(Some);
                }
                self.kind = Some(frame.opcode);
                self.append(&frame.payload)?;
                Ok(None)
            }
            OpCode::Continuation => {
                let Some(kind) = self.kind else {
                    return Err(FrameError::UnexpectedContinuation);
                };
                self.append(&frame.payload)?;
                if !frame.fin {
                    return Ok(None);
                }
                self.kind = None;
                let data = self.buffer.split().freeze();
                finish(kind, data).map(Some)
            }
        }
    }

    fn append(&mut self, data: &[u8]) -> Result<(), FrameError> {
        if self.buffer.len() + data.len() > self.max_message {
            return Err(FrameError::TooLarge(self.max_message));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }
}

fn finish(kind: OpCode, data: Bytes) -> Result<Incoming, FrameError> {
    let message = match kind {
        OpCode::Text => {
            let text = String::from_utf8(data.to_vec()).map_err(|_| FrameError::InvalidUtf8)?;
            Message::Text(text)
        }
        _ => Message::Binary(data),
    };
    Ok(Incoming::Message(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn decodes_masked_text_frame() {
        // RFC 6455 §5.7 example: masked "Hello"
        let mut buf = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let frame = decode_frame(&mut buf, 1024).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let mut full = BytesMut::new();
        encode_client_frame(true, OpCode::Binary, &[7u8; 300], MASK, &mut full);
        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(decode_frame(&mut buf, 1024).unwrap(), None);
        assert_eq!(buf.len(), full.len() - 1);
    }

    #[test]
    fn unmasked_client_frame_is_rejected() {
        let mut buf = BytesMut::new();
        encode_frame(OpCode::Text, b"hi", &mut buf);
        let err = decode_frame(&mut buf, 1024).unwrap_err();
        assert_eq!(err, FrameError::Unmasked);
        assert_eq!(err.close_code(), close_code::PROTOCOL_ERROR);
    }

    #[test]
    fn long_ping_is_rejected() {
        let mut buf = BytesMut::new();
        encode_client_frame(true, OpCode::Ping, &[0u8; 126], MASK, &mut buf);
        assert_eq!(
            decode_frame(&mut buf, 1 << 20),
            Err(FrameError::InvalidControlFrame)
        );
    }

    #[test]
    fn server_frames_use_extended_lengths() {
        let mut out = BytesMut::new();
        encode_frame(OpCode::Binary, &[0u8; 70_000], &mut out);
        assert_eq!(out[0], 0x82);
        assert_eq!(out[1], 127);
        assert_eq!(out.len(), 10 + 70_000);
    }

    #[test]
    fn fragments_are_reassembled_around_pings() {
        let mut assembler = MessageAssembler::new(1024);
        let frames = [
            Frame {
                fin: false,
                opcode: OpCode::Text,
                payload: Bytes::from_static(b"he"),
            },
            Frame {
                fin: true,
                opcode: OpCode::Ping,
                payload: Bytes::from_static(b"p"),
            },
            Frame {
                fin: true,
                opcode: OpCode::Continuation,
                payload: Bytes::from_static(b"llo"),
            },
        ];
        let out: Vec<_> = frames
            .into_iter()
            .filter_map(|f| assembler.push(f).unwrap())
            .collect();
        assert_eq!(
            out,
            vec![
                Incoming::Ping(Bytes::from_static(b"p")),
                Incoming::Message(Message::Text("hello".to_string())),
            ]
        );
    }

    #[test]
    fn oversized_message_maps_to_1009() {
        let mut assembler = MessageAssembler::new(4);
        let first = Frame {
            fin: false,
            opcode: OpCode::Binary,
            payload: Bytes::from_static(b"abc"),
        };
        let second = Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: Bytes::from_static(b"de"),
        };
        assert!(assembler.push(first).unwrap().is_none());
        let err = assembler.push(second).unwrap_err();
        assert_eq!(err.close_code(), close_code::MESSAGE_TOO_BIG);
    }

    #[test]
    fn invalid_utf8_maps_to_1007() {
        let mut assembler = MessageAssembler::new(16);
        let frame = Frame {
            fin: true,
            opcode: OpCode::Text,
            payload: Bytes::from_static(&[0xff, 0xfe]),
        };
        assert_eq!(assembler.push(frame).unwrap_err().close_code(), close_code::INVALID_PAYLOAD);
    }

    #[test]
    fn close_payload_parsing() {
        assert_eq!(parse_close_payload(&[]).unwrap(), (close_code::NO_STATUS, String::new()));
        assert_eq!(
            parse_close_payload(&[0x03, 0xe8, b'o', b'k']).unwrap(),
            (1000, "ok".to_string())
        );
        assert_eq!(parse_close_payload(&[0x03]), Err(FrameError::InvalidClose));
        // 1005 may not be sent by a peer
        assert_eq!(parse_close_payload(&[0x03, 0xed]), Err(FrameError::InvalidClose));
    }
}
