//! Fixed-size control messages exchanged over gateway connections.
//!
//! Every message is exactly [`MESSAGE_SIZE`] bytes, encoded little-endian:
//!
//! ```text
//!  0      1      2      3      4       6         8        12           16
//!  | kind | sub  | flags| rsvd | func_id | client_id | call_id | payload_len |
//! 16                     24                 28       32                     64
//!  | send_timestamp(i64) | processing_time  | rsvd   | inline data / region |
//! ```
//!
//! `sub` is the role of a handshake, the status of a handshake response, or
//! the direction of a function call.
use std::fmt;

use static_assertions::const_assert_eq;
use thiserror::Error;

pub const MESSAGE_SIZE: usize = 64;
pub const INLINE_DATA_SIZE: usize = 32;

const HEADER_SIZE: usize = 32;
const_assert_eq!(HEADER_SIZE + INLINE_DATA_SIZE, MESSAGE_SIZE);

const KIND_HANDSHAKE: u8 = 1;
const KIND_HANDSHAKE_RESPONSE: u8 = 2;
const KIND_FUNC_CALL: u8 = 3;

const FLAG_SUCCESS: u8 = 0x1;
const FLAG_INLINE: u8 = 0x2;
const FLAG_MASK: u8 = FLAG_SUCCESS | FLAG_INLINE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Message must be 64 bytes, got {0}")]
    Length(usize),
    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("Unknown role: {0}")]
    UnknownRole(u8),
    #[error("Unknown handshake status: {0}")]
    UnknownStatus(u8),
    #[error("Unknown direction: {0}")]
    UnknownDirection(u8),
    #[error("Invalid flags: {0:#x}")]
    InvalidFlags(u8),
    #[error("Reserved bytes are not zero")]
    ReservedNonZero,
    #[error("Inline payload too long: {0}")]
    InlineTooLong(u32),
    #[error("Invalid region name")]
    InvalidRegionName,
}

/// Identifies one function invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FuncCall {
    pub func_id: u16,
    pub client_id: u16,
    pub call_id: u32,
}

impl FuncCall {
    pub const INVALID: FuncCall = FuncCall {
        func_id: 0,
        client_id: 0,
        call_id: 0,
    };

    #[inline]
    pub const fn new(func_id: u16, client_id: u16, call_id: u32) -> Self {
        FuncCall {
            func_id,
            client_id,
            call_id,
        }
    }

    #[inline]
    pub const fn full_call_id(&self) -> u64 {
        self.func_id as u64 | (self.client_id as u64) << 16 | (self.call_id as u64) << 32
    }

    #[inline]
    pub const fn from_full_call_id(full_call_id: u64) -> Self {
        FuncCall {
            func_id: full_call_id as u16,
            client_id: (full_call_id >> 16) as u16,
            call_id: (full_call_id >> 32) as u32,
        }
    }
}

impl fmt::Display for FuncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.func_id, self.client_id, self.call_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Launcher = 1,
    Watchdog = 2,
    FuncWorker = 3,
}

impl TryFrom<u8> for Role {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Role::Launcher),
            2 => Ok(Role::Watchdog),
            3 => Ok(Role::FuncWorker),
            _ => Err(DecodeError::UnknownRole(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStatus {
    Ok = 0,
    Rejected = 1,
}

impl TryFrom<u8> for HandshakeStatus {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(HandshakeStatus::Ok),
            1 => Ok(HandshakeStatus::Rejected),
            _ => Err(DecodeError::UnknownStatus(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for Direction {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Direction::Request),
            1 => Ok(Direction::Response),
            _ => Err(DecodeError::UnknownDirection(v)),
        }
    }
}

/// A shared-memory region name carried inside a message, NUL-padded to
/// [`INLINE_DATA_SIZE`] bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionName {
    len: u8,
    bytes: [u8; INLINE_DATA_SIZE],
}

impl RegionName {
    /// Returns `None` if `name` is empty, longer than [`INLINE_DATA_SIZE`],
    /// or contains a NUL byte.
    pub fn new(name: &str) -> Option<Self> {
        if name.is_empty() || name.len() > INLINE_DATA_SIZE || name.contains('\0') {
            return None;
        }
        let mut bytes = [0u8; INLINE_DATA_SIZE];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Some(RegionName {
            len: name.len() as u8,
            bytes,
        })
    }

    fn from_padded(raw: &[u8]) -> Result<Self, DecodeError> {
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        if raw[len..].iter().any(|&b| b != 0) {
            return Err(DecodeError::InvalidRegionName);
        }
        std::str::from_utf8(&raw[..len])
            .ok()
            .and_then(RegionName::new)
            .ok_or(DecodeError::InvalidRegionName)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // constructed from a valid &str
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl fmt::Debug for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegionName").field(&self.as_str()).finish()
    }
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Input,
    Output,
}

/// Name of the region holding the input or output of `func_call`.
pub fn region_name(func_call: FuncCall, kind: RegionKind) -> RegionName {
    let suffix = match kind {
        RegionKind::Input => 'i',
        RegionKind::Output => 'o',
    };
    let name = format!("{:016x}.{}", func_call.full_call_id(), suffix);
    let mut bytes = [0u8; INLINE_DATA_SIZE];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    RegionName {
        len: name.len() as u8,
        bytes,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Inline([u8; INLINE_DATA_SIZE]),
    Region(RegionName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub role: Role,
    pub func_id: u16,
    pub client_id: u16,
    pub payload_len: u32,
}

/// Sent by the gateway in reply to a handshake. `payload_len` bytes of
/// opaque payload follow it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: HandshakeStatus,
    pub client_id: u16,
    pub payload_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncCallMessage {
    pub func_call: FuncCall,
    pub direction: Direction,
    pub success: bool,
    pub payload_len: u32,
    pub payload: Payload,
    /// Monotonic microseconds at the sender.
    pub send_timestamp: i64,
    /// Microseconds the callee spent on the call, responses only.
    pub processing_time: u32,
}

impl FuncCallMessage {
    pub fn new_request(func_call: FuncCall) -> Self {
        FuncCallMessage {
            func_call,
            direction: Direction::Request,
            success: false,
            payload_len: 0,
            payload: Payload::Inline([0; INLINE_DATA_SIZE]),
            send_timestamp: 0,
            processing_time: 0,
        }
    }

    pub fn new_response(func_call: FuncCall, success: bool) -> Self {
        FuncCallMessage {
            direction: Direction::Response,
            success,
            ..Self::new_request(func_call)
        }
    }

    /// Panics if `data` does not fit inline.
    pub fn set_inline_data(&mut self, data: &[u8]) {
        assert!(data.len() <= INLINE_DATA_SIZE);
        let mut inline = [0u8; INLINE_DATA_SIZE];
        inline[..data.len()].copy_from_slice(data);
        self.payload = Payload::Inline(inline);
        self.payload_len = data.len() as u32;
    }

    pub fn set_region(&mut self, name: RegionName, len: u32) {
        self.payload = Payload::Region(name);
        self.payload_len = len;
    }

    #[inline]
    pub fn inline_data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Inline(data) => Some(&data[..self.payload_len as usize]),
            Payload::Region(_) => None,
        }
    }

    #[inline]
    pub fn region_name(&self) -> Option<&RegionName> {
        match &self.payload {
            Payload::Inline(_) => None,
            Payload::Region(name) => Some(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Handshake(HandshakeMessage),
    HandshakeResponse(HandshakeResponse),
    FuncCall(FuncCallMessage),
}

#[inline]
fn read_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut a = [0u8; N];
    a.copy_from_slice(&buf[offset..offset + N]);
    a
}

#[inline]
fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

impl Message {
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Writes the message into the first [`MESSAGE_SIZE`] bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let buf = &mut buf[..MESSAGE_SIZE];
        buf.fill(0);
        match self {
            Message::Handshake(m) => {
                buf[0] = KIND_HANDSHAKE;
                buf[1] = m.role as u8;
                write_bytes(buf, 4, &m.func_id.to_le_bytes());
                write_bytes(buf, 6, &m.client_id.to_le_bytes());
                write_bytes(buf, 12, &m.payload_len.to_le_bytes());
            }
            Message::HandshakeResponse(m) => {
                buf[0] = KIND_HANDSHAKE_RESPONSE;
                buf[1] = m.status as u8;
                write_bytes(buf, 6, &m.client_id.to_le_bytes());
                write_bytes(buf, 12, &m.payload_len.to_le_bytes());
            }
            Message::FuncCall(m) => {
                buf[0] = KIND_FUNC_CALL;
                buf[1] = m.direction as u8;
                let mut flags = 0;
                if m.success {
                    flags |= FLAG_SUCCESS;
                }
                write_bytes(buf, 4, &m.func_call.func_id.to_le_bytes());
                write_bytes(buf, 6, &m.func_call.client_id.to_le_bytes());
                write_bytes(buf, 8, &m.func_call.call_id.to_le_bytes());
                write_bytes(buf, 12, &m.payload_len.to_le_bytes());
                write_bytes(buf, 16, &m.send_timestamp.to_le_bytes());
                write_bytes(buf, 24, &m.processing_time.to_le_bytes());
                match &m.payload {
                    Payload::Inline(data) => {
                        flags |= FLAG_INLINE;
                        write_bytes(buf, HEADER_SIZE, data);
                    }
                    Payload::Region(name) => write_bytes(buf, HEADER_SIZE, &name.bytes),
                }
                buf[2] = flags;
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        if buf.len() != MESSAGE_SIZE {
            return Err(DecodeError::Length(buf.len()));
        }
        if buf[3] != 0 || buf[28..32].iter().any(|&b| b != 0) {
            return Err(DecodeError::ReservedNonZero);
        }
        let flags = buf[2];
        if flags & !FLAG_MASK != 0 {
            return Err(DecodeError::InvalidFlags(flags));
        }
        let func_id = u16::from_le_bytes(read_array(buf, 4));
        let client_id = u16::from_le_bytes(read_array(buf, 6));
        let payload_len = u32::from_le_bytes(read_array(buf, 12));

        match buf[0] {
            KIND_HANDSHAKE => Ok(Message::Handshake(HandshakeMessage {
                role: Role::try_from(buf[1])?,
                func_id,
                client_id,
                payload_len,
            })),
            KIND_HANDSHAKE_RESPONSE => Ok(Message::HandshakeResponse(HandshakeResponse {
                status: HandshakeStatus::try_from(buf[1])?,
                client_id,
                payload_len,
            })),
            KIND_FUNC_CALL => {
                let direction = Direction::try_from(buf[1])?;
                let payload = if flags & FLAG_INLINE != 0 {
                    if payload_len as usize > INLINE_DATA_SIZE {
                        return Err(DecodeError::InlineTooLong(payload_len));
                    }
                    Payload::Inline(read_array(buf, HEADER_SIZE))
                } else {
                    Payload::Region(RegionName::from_padded(&buf[HEADER_SIZE..])?)
                };
                Ok(Message::FuncCall(FuncCallMessage {
                    func_call: FuncCall {
                        func_id,
                        client_id,
                        call_id: u32::from_le_bytes(read_array(buf, 8)),
                    },
                    direction,
                    success: flags & FLAG_SUCCESS != 0,
                    payload_len,
                    payload,
                    send_timestamp: i64::from_le_bytes(read_array(buf, 16)),
                    processing_time: u32::from_le_bytes(read_array(buf, 24)),
                }))
            }
            kind => Err(DecodeError::UnknownKind(kind)),
        }
    }
}

/// Reassembles fixed-size messages from an arbitrarily chunked byte stream.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    buf: Vec<u8>,
    start: usize,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete message, if any.
    pub fn next_message(&mut self) -> Option<Result<Message, DecodeError>> {
        if self.buffered_len() < MESSAGE_SIZE {
            return None;
        }
        let end = self.start + MESSAGE_SIZE;
        let msg = Message::decode(&self.buf[self.start..end]);
        if end == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else {
            self.start = end;
        }
        Some(msg)
    }

    /// Takes up to `n` raw bytes that are not part of a message, such as the
    /// payload following a handshake response.
    pub fn take_raw(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buffered_len());
        let raw = self.buf[self.start..self.start + n].to_vec();
        self.start += n;
        raw
    }

    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buf.len() - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_messages() -> Vec<Message> {
        let mut request = FuncCallMessage::new_request(FuncCall::new(7, 3, 1));
        request.set_inline_data(b"hello");
        request.send_timestamp = 123_456;
        let mut response = FuncCallMessage::new_response(FuncCall::new(7, 3, 2), true);
        response.set_region(
            region_name(FuncCall::new(7, 3, 2), RegionKind::Output),
            4096,
        );
        response.processing_time = 42;
        vec![
            Message::Handshake(HandshakeMessage {
                role: Role::FuncWorker,
                func_id: 7,
                client_id: 0,
                payload_len: 0,
            }),
            Message::HandshakeResponse(HandshakeResponse {
                status: HandshakeStatus::Ok,
                client_id: 3,
                payload_len: 17,
            }),
            Message::FuncCall(request),
            Message::FuncCall(response),
        ]
    }

    #[test]
    fn layout_is_little_endian() {
        let mut msg = FuncCallMessage::new_response(FuncCall::new(0x0102, 0x0304, 0x05060708), true);
        msg.set_inline_data(&[0xaa; 4]);
        let buf = Message::FuncCall(msg).encode();
        assert_eq!(buf[0], KIND_FUNC_CALL);
        assert_eq!(buf[1], Direction::Response as u8);
        assert_eq!(buf[2], FLAG_SUCCESS | FLAG_INLINE);
        assert_eq!(&buf[4..12], &[0x02, 0x01, 0x04, 0x03, 0x08, 0x07, 0x06, 0x05]);
        assert_eq!(&buf[12..16], &[4, 0, 0, 0]);
        assert_eq!(&buf[32..36], &[0xaa; 4]);
    }

    #[test]
    fn full_call_id_packing() {
        let call = FuncCall::new(7, 3, 0xdead_beef);
        assert_eq!(call.full_call_id(), 0xdead_beef_0003_0007);
        assert_eq!(FuncCall::from_full_call_id(call.full_call_id()), call);
        assert_eq!(region_name(call, RegionKind::Input).as_str(), "deadbeef00030007.i");
        assert_eq!(region_name(call, RegionKind::Output).as_str(), "deadbeef00030007.o");
    }

    #[test]
    fn decode_rejects_malformed() {
        let good = Message::Handshake(HandshakeMessage {
            role: Role::Launcher,
            func_id: 1,
            client_id: 0,
            payload_len: 0,
        })
        .encode();

        assert_eq!(Message::decode(&good[..63]), Err(DecodeError::Length(63)));

        let mut buf = good;
        buf[0] = 9;
        assert_eq!(Message::decode(&buf), Err(DecodeError::UnknownKind(9)));

        let mut buf = good;
        buf[1] = 4;
        assert_eq!(Message::decode(&buf), Err(DecodeError::UnknownRole(4)));

        let mut buf = good;
        buf[3] = 1;
        assert_eq!(Message::decode(&buf), Err(DecodeError::ReservedNonZero));

        let mut buf = good;
        buf[2] = 0x80;
        assert_eq!(Message::decode(&buf), Err(DecodeError::InvalidFlags(0x80)));

        let mut call = FuncCallMessage::new_request(FuncCall::new(1, 1, 1));
        call.set_inline_data(b"x");
        let mut buf = Message::FuncCall(call).encode();
        buf[12] = 33;
        assert_eq!(Message::decode(&buf), Err(DecodeError::InlineTooLong(33)));

        // region name must be non-empty
        buf[2] = 0;
        buf[32..].fill(0);
        assert_eq!(Message::decode(&buf), Err(DecodeError::InvalidRegionName));

        // no garbage after the NUL terminator
        buf[32] = b'a';
        buf[40] = b'b';
        assert_eq!(Message::decode(&buf), Err(DecodeError::InvalidRegionName));
    }

    #[test]
    fn region_name_limits() {
        assert!(RegionName::new("").is_none());
        assert!(RegionName::new(&"x".repeat(33)).is_none());
        assert!(RegionName::new("a\0b").is_none());
        assert_eq!(RegionName::new(&"x".repeat(32)).unwrap().as_str().len(), 32);
    }

    #[test]
    fn accumulator_keeps_trailing_bytes() {
        let messages = sample_messages();
        let mut wire = Vec::new();
        for m in &messages {
            wire.extend_from_slice(&m.encode());
        }
        let mut acc = MessageAccumulator::new();
        acc.push(&wire[..70]);
        assert_eq!(acc.next_message(), Some(Ok(messages[0])));
        assert!(acc.next_message().is_none());
        assert_eq!(acc.buffered_len(), 6);
        acc.push(&wire[70..]);
        let rest: Vec<_> = std::iter::from_fn(|| acc.next_message()).collect();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[2], Ok(messages[3]));
        assert_eq!(acc.buffered_len(), 0);
    }

    #[test]
    fn accumulator_take_raw() {
        let resp = Message::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::Ok,
            client_id: 0,
            payload_len: 5,
        });
        let mut acc = MessageAccumulator::new();
        let mut wire = resp.encode().to_vec();
        wire.extend_from_slice(b"[{}]!");
        acc.push(&wire);
        assert_eq!(acc.next_message(), Some(Ok(resp)));
        assert_eq!(acc.take_raw(5), b"[{}]!");
        assert_eq!(acc.buffered_len(), 0);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_decoded_sequence(
            cuts in proptest::collection::vec(0usize..256, 0..16),
        ) {
            let messages = sample_messages();
            let mut wire = Vec::new();
            for m in &messages {
                wire.extend_from_slice(&m.encode());
            }
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (wire.len() + 1)).collect();
            cuts.push(0);
            cuts.push(wire.len());
            cuts.sort_unstable();

            let mut acc = MessageAccumulator::new();
            let mut decoded = Vec::new();
            for w in cuts.windows(2) {
                acc.push(&wire[w[0]..w[1]]);
                while let Some(m) = acc.next_message() {
                    decoded.push(m.unwrap());
                }
            }
            prop_assert_eq!(decoded, messages);
            prop_assert_eq!(acc.buffered_len(), 0);
        }
    }
}
