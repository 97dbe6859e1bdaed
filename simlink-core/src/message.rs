//! Outbound builder and inbound reader over template-described block data.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use uuid::Uuid;

use crate::template::{BlockQuantity, FieldType, MessageId, MessageTemplate};
use crate::wire::WireError;

/// Block data for one message: per template block, per instance, per field.
pub type BlockData = Vec<Vec<Vec<FieldValue>>>;

/// A single decoded field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Fixed(Vec<u8>),
    Variable(Vec<u8>),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    F32(f32),
    F64(f64),
    Vector3([f32; 3]),
    Vector3d([f64; 3]),
    Vector4([f32; 4]),
    /// Packed unit quaternion (x, y, z); w is implied.
    Quaternion([f32; 3]),
    Uuid(Uuid),
    Bool(bool),
    IpAddr(Ipv4Addr),
    IpPort(u16),
}

impl FieldValue {
    /// Text in a Variable field, without the trailing NUL the simulator appends.
    pub fn variable_text(text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        FieldValue::Variable(bytes)
    }

    /// True if this value can be written as `kind`.
    pub fn fits(&self, kind: FieldType) -> bool {
        match (kind, self) {
            (FieldType::Null, FieldValue::Null) => true,
            (FieldType::Fixed(n), FieldValue::Fixed(b)) => b.len() == n,
            (FieldType::Variable(1), FieldValue::Variable(b)) => b.len() <= u8::MAX as usize,
            (FieldType::Variable(_), FieldValue::Variable(b)) => b.len() <= u16::MAX as usize,
            (FieldType::U8, FieldValue::U8(_))
            | (FieldType::U16, FieldValue::U16(_))
            | (FieldType::U32, FieldValue::U32(_))
            | (FieldType::U64, FieldValue::U64(_))
            | (FieldType::S8, FieldValue::S8(_))
            | (FieldType::S16, FieldValue::S16(_))
            | (FieldType::S32, FieldValue::S32(_))
            | (FieldType::S64, FieldValue::S64(_))
            | (FieldType::F32, FieldValue::F32(_))
            | (FieldType::F64, FieldValue::F64(_))
            | (FieldType::Vector3, FieldValue::Vector3(_))
            | (FieldType::Vector3d, FieldValue::Vector3d(_))
            | (FieldType::Vector4, FieldValue::Vector4(_))
            | (FieldType::Quaternion, FieldValue::Quaternion(_))
            | (FieldType::Uuid, FieldValue::Uuid(_))
            | (FieldType::Bool, FieldValue::Bool(_))
            | (FieldType::IpAddr, FieldValue::IpAddr(_))
            | (FieldType::IpPort, FieldValue::IpPort(_)) => true,
            _ => false,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            FieldValue::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            FieldValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            FieldValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Fixed(b) | FieldValue::Variable(b) => Some(b),
            _ => None,
        }
    }

    /// Variable/Fixed bytes as text, trailing NULs stripped.
    pub fn as_text(&self) -> Option<String> {
        let bytes = self.as_bytes()?;
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Fixed(b) | FieldValue::Variable(b) => {
                if let Some(text) = self.as_text().filter(|t| {
                    !t.is_empty() && t.chars().all(|c| !c.is_control())
                }) {
                    write!(f, "{:?}", text)
                } else {
                    write!(f, "<{} bytes>", b.len())
                }
            }
            FieldValue::U8(v) => write!(f, "{}", v),
            FieldValue::U16(v) => write!(f, "{}", v),
            FieldValue::U32(v) => write!(f, "{}", v),
            FieldValue::U64(v) => write!(f, "{}", v),
            FieldValue::S8(v) => write!(f, "{}", v),
            FieldValue::S16(v) => write!(f, "{}", v),
            FieldValue::S32(v) => write!(f, "{}", v),
            FieldValue::S64(v) => write!(f, "{}", v),
            FieldValue::F32(v) => write!(f, "{}", v),
            FieldValue::F64(v) => write!(f, "{}", v),
            FieldValue::Vector3(v) | FieldValue::Quaternion(v) => {
                write!(f, "<{}, {}, {}>", v[0], v[1], v[2])
            }
            FieldValue::Vector3d(v) => write!(f, "<{}, {}, {}>", v[0], v[1], v[2]),
            FieldValue::Vector4(v) => write!(f, "<{}, {}, {}, {}>", v[0], v[1], v[2], v[3]),
            FieldValue::Uuid(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::IpAddr(v) => write!(f, "{}", v),
            FieldValue::IpPort(v) => write!(f, "{}", v),
        }
    }
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        FieldValue::U8(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::U32(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::S32(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::F32(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Uuid(v)
    }
}

/// Message under construction. Obtained from `NetMessageManager::start_new_message`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    template: Arc<MessageTemplate>,
    blocks: BlockData,
    reliable: bool,
    sequence: Option<u32>,
}

impl OutboundMessage {
    pub fn new(template: Arc<MessageTemplate>) -> Self {
        let blocks = vec![Vec::new(); template.blocks.len()];
        Self {
            reliable: template.is_reliable(),
            template,
            blocks,
            sequence: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.template.id
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &Arc<MessageTemplate> {
        &self.template
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// Override the template's default reliability for this message.
    pub fn set_reliable(&mut self, reliable: bool) {
        self.reliable = reliable;
    }

    /// Sequence number, assigned when the message is finished.
    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, seq: u32) {
        self.sequence = Some(seq);
    }

    pub fn blocks(&self) -> &BlockData {
        &self.blocks
    }

    /// Append one instance of `block`. Values are checked against the template here;
    /// instance counts are checked when the message is encoded.
    pub fn add_block(
        &mut self,
        block: &str,
        fields: Vec<FieldValue>,
    ) -> Result<&mut Self, WireError> {
        let idx = self
            .template
            .block_index(block)
            .ok_or_else(|| WireError::UnknownBlock {
                message: self.template.name.clone(),
                block: block.to_string(),
            })?;
        let bt = &self.template.blocks[idx];
        if fields.len() != bt.fields.len() {
            return Err(WireError::FieldCount {
                block: bt.name.clone(),
                expected: bt.fields.len(),
                got: fields.len(),
            });
        }
        for (ft, value) in bt.fields.iter().zip(&fields) {
            if !value.fits(ft.kind) {
                return Err(WireError::FieldType {
                    block: bt.name.clone(),
                    field: ft.name.clone(),
                });
            }
        }
        let max = match bt.quantity {
            BlockQuantity::Single => 1,
            BlockQuantity::Multiple(n) => n as usize,
            BlockQuantity::Variable => u8::MAX as usize,
        };
        if self.blocks[idx].len() >= max {
            return Err(WireError::BlockCount {
                block: bt.name.clone(),
                count: self.blocks[idx].len() + 1,
            });
        }
        self.blocks[idx].push(fields);
        Ok(self)
    }
}

/// Decoded message handed to the listener.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    template: Arc<MessageTemplate>,
    blocks: BlockData,
    sequence: u32,
    reliable: bool,
    resent: bool,
}

impl InboundMessage {
    pub(crate) fn new(
        template: Arc<MessageTemplate>,
        blocks: BlockData,
        sequence: u32,
        reliable: bool,
        resent: bool,
    ) -> Self {
        Self {
            template,
            blocks,
            sequence,
            reliable,
            resent,
        }
    }

    pub fn id(&self) -> MessageId {
        self.template.id
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &Arc<MessageTemplate> {
        &self.template
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn is_resent(&self) -> bool {
        self.resent
    }

    pub fn blocks(&self) -> &BlockData {
        &self.blocks
    }

    /// Instances of `block`; empty if the template has no such block.
    pub fn block(&self, block: &str) -> &[Vec<FieldValue>] {
        self.template
            .block_index(block)
            .map(|i| self.blocks[i].as_slice())
            .unwrap_or(&[])
    }

    pub fn block_count(&self, block: &str) -> usize {
        self.block(block).len()
    }

    /// Field `field` of instance `index` of `block`.
    pub fn field(&self, block: &str, index: usize, field: &str) -> Option<&FieldValue> {
        let bi = self.template.block_index(block)?;
        let fi = self.template.blocks[bi]
            .fields
            .iter()
            .position(|f| f.name == field)?;
        self.blocks[bi].get(index)?.get(fi)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({}) seq={}{}{}",
            self.template.name,
            self.template.id,
            self.sequence,
            if self.reliable { " reliable" } else { "" },
            if self.resent { " resent" } else { "" },
        )?;
        for (bt, instances) in self.template.blocks.iter().zip(&self.blocks) {
            for (i, instance) in instances.iter().enumerate() {
                writeln!(f, "  {}[{}]", bt.name, i)?;
                for (ft, value) in bt.fields.iter().zip(instance) {
                    writeln!(f, "    {} = {}", ft.name, value)?;
                }
            }
        }
        Ok(())
    }
}
