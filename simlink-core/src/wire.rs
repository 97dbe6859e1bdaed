//! Datagram framing: flags byte, 4-byte BE sequence, message id, block payload
//! (optionally zero-coded), then appended ACKs with their count as the last byte.

use std::net::Ipv4Addr;
use std::sync::Arc;

use uuid::Uuid;

use crate::message::{BlockData, FieldValue, InboundMessage};
use crate::template::{
    BlockQuantity, FieldTemplate, FieldType, Frequency, MessageDictionary, MessageId,
    MessageTemplate,
};
use crate::zerocode;

/// Largest datagram we build or accept.
pub const MTU: usize = 1200;
/// Flags byte + sequence number.
pub const HEADER_LEN: usize = 5;
/// Most ACKs one datagram can carry (count is a single byte).
pub const MAX_APPENDED_ACKS: usize = 255;

pub const FLAG_ZEROCODED: u8 = 0x80;
pub const FLAG_RELIABLE: u8 = 0x40;
pub const FLAG_RESENT: u8 = 0x20;
pub const FLAG_ACK: u8 = 0x10;

/// Error building or parsing a datagram. Everything except `UnknownMessageId` is a malformed message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
    #[error("bad zero-coding marker")]
    BadZeroCode,
    #[error("unknown message id {0}")]
    UnknownMessageId(MessageId),
    #[error("message {message} has no block {block}")]
    UnknownBlock { message: String, block: String },
    #[error("block {block}: invalid instance count {count}")]
    BlockCount { block: String, count: usize },
    #[error("block {block}: expected {expected} fields, got {got}")]
    FieldCount {
        block: String,
        expected: usize,
        got: usize,
    },
    #[error("block {block}: value for {field} does not match its type")]
    FieldType { block: String, field: String },
    #[error("datagram of {0} bytes exceeds MTU")]
    TooLarge(usize),
}

impl WireError {
    pub fn is_malformed(&self) -> bool {
        !matches!(self, WireError::UnknownMessageId(_))
    }
}

/// Fixed part of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: u8,
    pub sequence: u32,
}

impl PacketHeader {
    pub fn is_reliable(&self) -> bool {
        self.flags & FLAG_RELIABLE != 0
    }

    pub fn is_resent(&self) -> bool {
        self.flags & FLAG_RESENT != 0
    }

    pub fn is_zerocoded(&self) -> bool {
        self.flags & FLAG_ZEROCODED != 0
    }

    pub fn has_acks(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }
}

/// A fully decoded datagram.
#[derive(Debug, Clone)]
pub struct DecodedDatagram {
    pub header: PacketHeader,
    pub message: InboundMessage,
    pub acks: Vec<u32>,
}

/// Append the id in its frequency-dependent width.
pub fn encode_message_id(id: MessageId, frequency: Frequency, out: &mut Vec<u8>) {
    match frequency {
        Frequency::High => out.push(id.0 as u8),
        Frequency::Medium => out.extend_from_slice(&[0xFF, id.0 as u8]),
        Frequency::Low | Frequency::Fixed => out.extend_from_slice(&id.0.to_be_bytes()),
    }
}

/// Read the id from the front of a (decoded) body. Returns the id and its width.
pub fn decode_message_id(body: &[u8]) -> Result<(MessageId, usize), WireError> {
    match body {
        [] => Err(WireError::Truncated),
        [b0, ..] if *b0 != 0xFF => Ok((MessageId(*b0 as u32), 1)),
        [_, b1, ..] if *b1 != 0xFF => Ok((MessageId(0xFF00 | *b1 as u32), 2)),
        [a, b, c, d, ..] => Ok((MessageId(u32::from_be_bytes([*a, *b, *c, *d])), 4)),
        _ => Err(WireError::Truncated),
    }
}

/// Encode id + blocks (not zero-coded).
pub fn encode_body(template: &MessageTemplate, blocks: &BlockData) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(64);
    encode_message_id(template.id, template.frequency, &mut out);
    if blocks.len() != template.blocks.len() {
        return Err(WireError::BlockCount {
            block: template.name.clone(),
            count: blocks.len(),
        });
    }
    for (bt, instances) in template.blocks.iter().zip(blocks) {
        let count_ok = match bt.quantity {
            BlockQuantity::Single => instances.len() == 1,
            BlockQuantity::Multiple(n) => instances.len() == n as usize,
            BlockQuantity::Variable => instances.len() <= u8::MAX as usize,
        };
        if !count_ok {
            return Err(WireError::BlockCount {
                block: bt.name.clone(),
                count: instances.len(),
            });
        }
        if bt.quantity == BlockQuantity::Variable {
            out.push(instances.len() as u8);
        }
        for instance in instances {
            if instance.len() != bt.fields.len() {
                return Err(WireError::FieldCount {
                    block: bt.name.clone(),
                    expected: bt.fields.len(),
                    got: instance.len(),
                });
            }
            for (ft, value) in bt.fields.iter().zip(instance) {
                write_field(&bt.name, ft, value, &mut out)?;
            }
        }
    }
    Ok(out)
}

/// Build a complete datagram.
pub fn encode_datagram(
    template: &MessageTemplate,
    blocks: &BlockData,
    sequence: u32,
    reliable: bool,
    acks: &[u32],
) -> Result<Vec<u8>, WireError> {
    let body = encode_body(template, blocks)?;
    let mut flags = 0u8;
    if reliable {
        flags |= FLAG_RELIABLE;
    }
    let body = if template.is_zerocoded() {
        flags |= FLAG_ZEROCODED;
        zerocode::encode(&body)
    } else {
        body
    };
    let acks = &acks[..acks.len().min(MAX_APPENDED_ACKS)];
    if !acks.is_empty() {
        flags |= FLAG_ACK;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + acks.len() * 4 + 1);
    out.push(flags);
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&body);
    if !acks.is_empty() {
        for ack in acks {
            out.extend_from_slice(&ack.to_be_bytes());
        }
        out.push(acks.len() as u8);
    }
    if out.len() > MTU {
        return Err(WireError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Mark a stored datagram as a resend. The payload is otherwise untouched.
pub fn mark_resent(datagram: &mut [u8]) {
    if let Some(flags) = datagram.first_mut() {
        *flags |= FLAG_RESENT;
    }
}

pub fn decode_header(bytes: &[u8]) -> Result<PacketHeader, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    Ok(PacketHeader {
        flags: bytes[0],
        sequence: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
    })
}

/// Split a datagram into header, raw (possibly zero-coded) body and appended ACKs.
pub fn split_datagram(bytes: &[u8]) -> Result<(PacketHeader, &[u8], Vec<u32>), WireError> {
    if bytes.len() > MTU {
        return Err(WireError::TooLarge(bytes.len()));
    }
    let header = decode_header(bytes)?;
    let mut end = bytes.len();
    let mut acks = Vec::new();
    if header.has_acks() {
        let count = *bytes.last().ok_or(WireError::Truncated)? as usize;
        let ack_bytes = count * 4 + 1;
        if end < HEADER_LEN + ack_bytes {
            return Err(WireError::Truncated);
        }
        end -= ack_bytes;
        acks = bytes[end..bytes.len() - 1]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
    }
    Ok((header, &bytes[HEADER_LEN..end], acks))
}

/// Decode the message body that follows a header.
pub fn decode_body(
    dictionary: &MessageDictionary,
    header: PacketHeader,
    raw_body: &[u8],
) -> Result<InboundMessage, WireError> {
    let expanded;
    let body = if header.is_zerocoded() {
        expanded = zerocode::decode(raw_body)?;
        expanded.as_slice()
    } else {
        raw_body
    };
    let (id, id_len) = decode_message_id(body)?;
    let template = dictionary
        .by_id(id)
        .ok_or(WireError::UnknownMessageId(id))?;
    let blocks = decode_blocks(template, &body[id_len..])?;
    Ok(InboundMessage::new(
        Arc::clone(template),
        blocks,
        header.sequence,
        header.is_reliable(),
        header.is_resent(),
    ))
}

/// Decode a complete datagram.
pub fn decode_datagram(
    dictionary: &MessageDictionary,
    bytes: &[u8],
) -> Result<DecodedDatagram, WireError> {
    let (header, raw_body, acks) = split_datagram(bytes)?;
    let message = decode_body(dictionary, header, raw_body)?;
    Ok(DecodedDatagram {
        header,
        message,
        acks,
    })
}

fn decode_blocks(template: &MessageTemplate, payload: &[u8]) -> Result<BlockData, WireError> {
    let mut r = Reader::new(payload);
    let mut blocks = Vec::with_capacity(template.blocks.len());
    for bt in &template.blocks {
        let count = match bt.quantity {
            BlockQuantity::Single => 1,
            BlockQuantity::Multiple(n) => n as usize,
            BlockQuantity::Variable => r.u8()? as usize,
        };
        let mut instances = Vec::with_capacity(count);
        for _ in 0..count {
            let mut fields = Vec::with_capacity(bt.fields.len());
            for ft in &bt.fields {
                fields.push(read_field(ft.kind, &mut r)?);
            }
            instances.push(fields);
        }
        blocks.push(instances);
    }
    if r.remaining() > 0 {
        return Err(WireError::TrailingBytes(r.remaining()));
    }
    Ok(blocks)
}

fn write_field(
    block: &str,
    ft: &FieldTemplate,
    value: &FieldValue,
    out: &mut Vec<u8>,
) -> Result<(), WireError> {
    if !value.fits(ft.kind) {
        return Err(WireError::FieldType {
            block: block.to_string(),
            field: ft.name.clone(),
        });
    }
    match value {
        FieldValue::Null => {}
        FieldValue::Fixed(b) => out.extend_from_slice(b),
        FieldValue::Variable(b) => {
            if ft.kind == FieldType::Variable(1) {
                out.push(b.len() as u8);
            } else {
                out.extend_from_slice(&(b.len() as u16).to_le_bytes());
            }
            out.extend_from_slice(b);
        }
        FieldValue::U8(v) => out.push(*v),
        FieldValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::S8(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::S16(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::S32(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::S64(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Vector3(v) | FieldValue::Quaternion(v) => {
            for c in v {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        FieldValue::Vector3d(v) => {
            for c in v {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        FieldValue::Vector4(v) => {
            for c in v {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        FieldValue::Uuid(v) => out.extend_from_slice(v.as_bytes()),
        FieldValue::Bool(v) => out.push(*v as u8),
        FieldValue::IpAddr(v) => out.extend_from_slice(&v.octets()),
        FieldValue::IpPort(v) => out.extend_from_slice(&v.to_be_bytes()),
    }
    Ok(())
}

fn read_field(kind: FieldType, r: &mut Reader<'_>) -> Result<FieldValue, WireError> {
    let value = match kind {
        FieldType::Null => FieldValue::Null,
        FieldType::Fixed(n) => FieldValue::Fixed(r.take(n)?.to_vec()),
        FieldType::Variable(1) => {
            let len = r.u8()? as usize;
            FieldValue::Variable(r.take(len)?.to_vec())
        }
        FieldType::Variable(_) => {
            let len = u16::from_le_bytes(r.array()?) as usize;
            FieldValue::Variable(r.take(len)?.to_vec())
        }
        FieldType::U8 => FieldValue::U8(r.u8()?),
        FieldType::U16 => FieldValue::U16(u16::from_le_bytes(r.array()?)),
        FieldType::U32 => FieldValue::U32(u32::from_le_bytes(r.array()?)),
        FieldType::U64 => FieldValue::U64(u64::from_le_bytes(r.array()?)),
        FieldType::S8 => FieldValue::S8(i8::from_le_bytes(r.array()?)),
        FieldType::S16 => FieldValue::S16(i16::from_le_bytes(r.array()?)),
        FieldType::S32 => FieldValue::S32(i32::from_le_bytes(r.array()?)),
        FieldType::S64 => FieldValue::S64(i64::from_le_bytes(r.array()?)),
        FieldType::F32 => FieldValue::F32(r.f32()?),
        FieldType::F64 => FieldValue::F64(r.f64()?),
        FieldType::Vector3 => FieldValue::Vector3([r.f32()?, r.f32()?, r.f32()?]),
        FieldType::Quaternion => FieldValue::Quaternion([r.f32()?, r.f32()?, r.f32()?]),
        FieldType::Vector3d => FieldValue::Vector3d([r.f64()?, r.f64()?, r.f64()?]),
        FieldType::Vector4 => {
            FieldValue::Vector4([r.f32()?, r.f32()?, r.f32()?, r.f32()?])
        }
        FieldType::Uuid => FieldValue::Uuid(Uuid::from_bytes(r.array()?)),
        FieldType::Bool => FieldValue::Bool(r.u8()? != 0),
        FieldType::IpAddr => FieldValue::IpAddr(Ipv4Addr::from(r.array::<4>()?)),
        FieldType::IpPort => FieldValue::IpPort(u16::from_be_bytes(r.array()?)),
    };
    Ok(value)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutboundMessage;

    fn dict() -> MessageDictionary {
        MessageDictionary::bundled().unwrap()
    }

    fn ping(dict: &MessageDictionary, id: u8) -> OutboundMessage {
        let mut msg = OutboundMessage::new(dict.by_name("StartPingCheck").unwrap().clone());
        msg.add_block("PingID", vec![FieldValue::U8(id), FieldValue::U32(77)])
            .unwrap();
        msg
    }

    #[test]
    fn ping_layout_is_bit_exact() {
        let d = dict();
        let msg = ping(&d, 9);
        let bytes = encode_datagram(msg.template(), msg.blocks(), 0x0102_0304, false, &[]).unwrap();
        assert_eq!(bytes, vec![0x00, 1, 2, 3, 4, 0x01, 9, 77, 0, 0, 0]);
    }

    #[test]
    fn ids_by_frequency() {
        let mut out = Vec::new();
        encode_message_id(MessageId(0xFF0D), Frequency::Medium, &mut out);
        assert_eq!(out, vec![0xFF, 0x0D]);
        assert_eq!(decode_message_id(&out).unwrap(), (MessageId(0xFF0D), 2));

        out.clear();
        encode_message_id(MessageId(0xFFFF_0003), Frequency::Low, &mut out);
        assert_eq!(out, vec![0xFF, 0xFF, 0x00, 0x03]);
        assert_eq!(decode_message_id(&out).unwrap(), (MessageId(0xFFFF_0003), 4));

        out.clear();
        encode_message_id(MessageId(0xFFFF_FFFB), Frequency::Fixed, &mut out);
        assert_eq!(decode_message_id(&out).unwrap(), (MessageId(0xFFFF_FFFB), 4));

        assert!(matches!(decode_message_id(&[0xFF, 0xFF, 0]), Err(WireError::Truncated)));
    }

    #[test]
    fn appended_acks_roundtrip() {
        let d = dict();
        let msg = ping(&d, 1);
        let bytes = encode_datagram(msg.template(), msg.blocks(), 5, true, &[10, 11, 0xDEAD_BEEF]).unwrap();
        assert_eq!(bytes[0], FLAG_RELIABLE | FLAG_ACK);
        assert_eq!(*bytes.last().unwrap(), 3);
        let decoded = decode_datagram(&d, &bytes).unwrap();
        assert_eq!(decoded.acks, vec![10, 11, 0xDEAD_BEEF]);
        assert_eq!(decoded.header.sequence, 5);
        assert!(decoded.message.is_reliable());
        assert_eq!(decoded.message.field("PingID", 0, "PingID"), Some(&FieldValue::U8(1)));
    }

    #[test]
    fn zerocoded_message_roundtrip() {
        let d = dict();
        let mut msg = OutboundMessage::new(d.by_name("TestMessage").unwrap().clone());
        msg.add_block("TestBlock1", vec![FieldValue::U32(0)]).unwrap();
        for i in 0..4u32 {
            msg.add_block(
                "NeighborBlock",
                vec![FieldValue::U32(i), FieldValue::U32(0), FieldValue::U32(i << 24)],
            )
            .unwrap();
        }
        let bytes = encode_datagram(msg.template(), msg.blocks(), 42, false, &[]).unwrap();
        assert!(bytes[0] & FLAG_ZEROCODED != 0);
        let raw_len = HEADER_LEN + encode_body(msg.template(), msg.blocks()).unwrap().len();
        assert!(bytes.len() < raw_len);
        let decoded = decode_datagram(&d, &bytes).unwrap();
        assert_eq!(decoded.message.blocks(), msg.blocks());
    }

    #[test]
    fn mark_resent_keeps_payload() {
        let d = dict();
        let msg = ping(&d, 3);
        let original = encode_datagram(msg.template(), msg.blocks(), 8, true, &[]).unwrap();
        let mut resent = original.clone();
        mark_resent(&mut resent);
        assert_eq!(resent[0], FLAG_RELIABLE | FLAG_RESENT);
        assert_eq!(resent[1..], original[1..]);
        assert!(decode_header(&resent).unwrap().is_resent());
    }

    #[test]
    fn unknown_id_is_not_malformed() {
        let d = dict();
        let bytes = [0u8, 0, 0, 0, 1, 0xFE];
        let err = decode_datagram(&d, &bytes).unwrap_err();
        assert!(matches!(err, WireError::UnknownMessageId(MessageId(0xFE))));
        assert!(!err.is_malformed());
    }

    #[test]
    fn truncated_and_trailing() {
        let d = dict();
        let msg = ping(&d, 1);
        let bytes = encode_datagram(msg.template(), msg.blocks(), 1, false, &[]).unwrap();
        assert!(matches!(
            decode_datagram(&d, &bytes[..bytes.len() - 1]),
            Err(WireError::Truncated)
        ));
        let mut longer = bytes.clone();
        longer.push(0xAA);
        assert!(matches!(
            decode_datagram(&d, &longer),
            Err(WireError::TrailingBytes(1))
        ));
        assert!(matches!(decode_header(&bytes[..3]), Err(WireError::Truncated)));
    }

    #[test]
    fn ack_count_larger_than_datagram() {
        let d = dict();
        let bytes = [FLAG_ACK, 0, 0, 0, 1, 0x01, 9, 200];
        assert!(matches!(decode_datagram(&d, &bytes), Err(WireError::Truncated)));
    }

    #[test]
    fn incomplete_single_block_rejected() {
        let d = dict();
        let msg = OutboundMessage::new(d.by_name("StartPingCheck").unwrap().clone());
        assert!(matches!(
            encode_datagram(msg.template(), msg.blocks(), 1, false, &[]),
            Err(WireError::BlockCount { count: 0, .. })
        ));
    }

    #[test]
    fn oversized_datagram_rejected() {
        let d = dict();
        let mut msg = OutboundMessage::new(d.by_name("ChatFromViewer").unwrap().clone());
        msg.add_block("AgentData", vec![Uuid::nil().into(), Uuid::nil().into()])
            .unwrap();
        msg.add_block(
            "ChatData",
            vec![FieldValue::Variable(vec![b'x'; 2000]), 1u8.into(), 0i32.into()],
        )
        .unwrap();
        assert!(matches!(
            encode_datagram(msg.template(), msg.blocks(), 1, true, &[]),
            Err(WireError::TooLarge(_))
        ));
    }
}
