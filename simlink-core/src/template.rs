//! Message templates: parse `message_template.msg` into an immutable dictionary.
//!
//! The dictionary is built once and shared as `Arc<MessageDictionary>`; nothing in it
//! changes after `parse` returns.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Bundled template: circuit control messages plus common session messages.
pub const DEFAULT_TEMPLATE: &str = include_str!("../data/message_template.msg");

/// Full message number as it appears on the wire (see `wire::encode_message_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    High,
    Medium,
    Low,
    Fixed,
}

impl Frequency {
    /// Number of bytes the message id occupies on the wire.
    pub fn id_len(self) -> usize {
        match self {
            Frequency::High => 1,
            Frequency::Medium => 2,
            Frequency::Low | Frequency::Fixed => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Unencoded,
    Zerocoded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// How many instances of a block a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockQuantity {
    Single,
    Multiple(u8),
    /// Count prefix byte on the wire, 0..=255 instances.
    Variable,
}

/// Wire type of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Null,
    Fixed(usize),
    /// Length-prefixed bytes; the prefix is 1 or 2 bytes.
    Variable(u8),
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
    Vector3,
    Vector3d,
    Vector4,
    Quaternion,
    Uuid,
    Bool,
    IpAddr,
    IpPort,
}

impl FieldType {
    /// Encoded size of fixed-size types; `None` for length-prefixed ones.
    pub fn fixed_size(self) -> Option<usize> {
        let n = match self {
            FieldType::Null => 0,
            FieldType::Fixed(n) => n,
            FieldType::Variable(_) => return None,
            FieldType::U8 | FieldType::S8 | FieldType::Bool => 1,
            FieldType::U16 | FieldType::S16 | FieldType::IpPort => 2,
            FieldType::U32 | FieldType::S32 | FieldType::F32 | FieldType::IpAddr => 4,
            FieldType::U64 | FieldType::S64 | FieldType::F64 => 8,
            FieldType::Vector3 | FieldType::Quaternion => 12,
            FieldType::Vector4 | FieldType::Uuid => 16,
            FieldType::Vector3d => 24,
        };
        Some(n)
    }

    fn from_tokens(t: &mut Tokens<'_>) -> Result<Self, DictionaryError> {
        let (line, tok) = t.next()?;
        let kind = match tok {
            "Null" => FieldType::Null,
            "Fixed" => {
                let n = t.number()?;
                FieldType::Fixed(n as usize)
            }
            "Variable" => match t.number()? {
                1 => FieldType::Variable(1),
                2 => FieldType::Variable(2),
                other => {
                    return Err(DictionaryError::syntax(
                        line,
                        format!("variable length prefix must be 1 or 2, got {}", other),
                    ))
                }
            },
            "U8" => FieldType::U8,
            "U16" => FieldType::U16,
            "U32" => FieldType::U32,
            "U64" => FieldType::U64,
            "S8" => FieldType::S8,
            "S16" => FieldType::S16,
            "S32" => FieldType::S32,
            "S64" => FieldType::S64,
            "F32" => FieldType::F32,
            "F64" => FieldType::F64,
            "LLVector3" => FieldType::Vector3,
            "LLVector3d" => FieldType::Vector3d,
            "LLVector4" => FieldType::Vector4,
            "LLQuaternion" => FieldType::Quaternion,
            "LLUUID" => FieldType::Uuid,
            "BOOL" => FieldType::Bool,
            "IPADDR" => FieldType::IpAddr,
            "IPPORT" => FieldType::IpPort,
            other => {
                return Err(DictionaryError::syntax(
                    line,
                    format!("unknown field type {}", other),
                ))
            }
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldTemplate {
    pub name: String,
    pub kind: FieldType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub name: String,
    pub quantity: BlockQuantity,
    pub fields: Vec<FieldTemplate>,
}

/// One message layout from the dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    pub id: MessageId,
    pub name: String,
    pub frequency: Frequency,
    pub trusted: bool,
    pub encoding: Encoding,
    pub reliability: Reliability,
    pub deprecated: bool,
    pub blocks: Vec<BlockTemplate>,
}

impl MessageTemplate {
    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }

    pub fn is_zerocoded(&self) -> bool {
        self.encoding == Encoding::Zerocoded
    }

    /// Index of the block with this name, if the template has one.
    pub fn block_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }
}

/// Error loading a template definition.
#[derive(Debug, thiserror::Error)]
pub enum DictionaryError {
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("unexpected end of template")]
    UnexpectedEof,
    #[error("duplicate message id {0}")]
    DuplicateId(MessageId),
    #[error("duplicate message name {0}")]
    DuplicateName(String),
    #[error("read template: {0}")]
    Io(#[from] std::io::Error),
}

impl DictionaryError {
    fn syntax(line: usize, reason: impl Into<String>) -> Self {
        DictionaryError::Syntax {
            line,
            reason: reason.into(),
        }
    }
}

/// Immutable id/name → template lookup.
#[derive(Debug, Default)]
pub struct MessageDictionary {
    templates: Vec<Arc<MessageTemplate>>,
    by_id: HashMap<MessageId, usize>,
    by_name: HashMap<String, usize>,
}

impl MessageDictionary {
    /// Parse a complete template definition.
    pub fn parse(src: &str) -> Result<Self, DictionaryError> {
        let mut t = Tokens::new(src);
        if t.peek() == Some("version") {
            t.next()?;
            t.next()?;
        }
        let mut dict = MessageDictionary::default();
        while t.peek().is_some() {
            let template = parse_message(&mut t)?;
            dict.insert(template)?;
        }
        Ok(dict)
    }

    /// Read and parse a template file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let src = std::fs::read_to_string(path)?;
        Self::parse(&src)
    }

    /// Dictionary built from `DEFAULT_TEMPLATE`.
    pub fn bundled() -> Result<Self, DictionaryError> {
        Self::parse(DEFAULT_TEMPLATE)
    }

    fn insert(&mut self, template: MessageTemplate) -> Result<(), DictionaryError> {
        if self.by_id.contains_key(&template.id) {
            return Err(DictionaryError::DuplicateId(template.id));
        }
        if self.by_name.contains_key(&template.name) {
            return Err(DictionaryError::DuplicateName(template.name));
        }
        let idx = self.templates.len();
        self.by_id.insert(template.id, idx);
        self.by_name.insert(template.name.clone(), idx);
        self.templates.push(Arc::new(template));
        Ok(())
    }

    pub fn by_id(&self, id: MessageId) -> Option<&Arc<MessageTemplate>> {
        self.by_id.get(&id).map(|&i| &self.templates[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<MessageTemplate>> {
        self.by_name.get(name).map(|&i| &self.templates[i])
    }

    pub fn id_of(&self, name: &str) -> Option<MessageId> {
        self.by_name(name).map(|t| t.id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MessageTemplate>> {
        self.templates.iter()
    }
}

impl FromStr for MessageDictionary {
    type Err = DictionaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_message(t: &mut Tokens<'_>) -> Result<MessageTemplate, DictionaryError> {
    t.expect("{")?;
    let name = t.ident()?;
    let (line, freq) = t.next()?;
    let frequency = match freq {
        "High" => Frequency::High,
        "Medium" => Frequency::Medium,
        "Low" => Frequency::Low,
        "Fixed" => Frequency::Fixed,
        other => {
            return Err(DictionaryError::syntax(
                line,
                format!("unknown frequency {}", other),
            ))
        }
    };
    let line = t.line();
    let number = t.number()?;
    let id = full_id(frequency, number)
        .ok_or_else(|| DictionaryError::syntax(line, format!("{} number out of range", name)))?;
    let (line, trust) = t.next()?;
    let trusted = match trust {
        "Trusted" => true,
        "NotTrusted" => false,
        other => {
            return Err(DictionaryError::syntax(
                line,
                format!("unknown trust {}", other),
            ))
        }
    };
    let (line, enc) = t.next()?;
    let encoding = match enc {
        "Unencoded" => Encoding::Unencoded,
        "Zerocoded" => Encoding::Zerocoded,
        other => {
            return Err(DictionaryError::syntax(
                line,
                format!("unknown encoding {}", other),
            ))
        }
    };

    let mut reliability = Reliability::Unreliable;
    let mut deprecated = false;
    while let Some(tok) = t.peek() {
        if tok == "{" || tok == "}" {
            break;
        }
        let (line, flag) = t.next()?;
        match flag {
            "Reliable" => reliability = Reliability::Reliable,
            "Unreliable" => reliability = Reliability::Unreliable,
            "Deprecated" | "UDPDeprecated" | "UDPBlackListed" => deprecated = true,
            other => {
                return Err(DictionaryError::syntax(
                    line,
                    format!("unknown message flag {}", other),
                ))
            }
        }
    }

    let mut blocks = Vec::new();
    while t.peek() == Some("{") {
        blocks.push(parse_block(t)?);
    }
    t.expect("}")?;

    Ok(MessageTemplate {
        id,
        name,
        frequency,
        trusted,
        encoding,
        reliability,
        deprecated,
        blocks,
    })
}

fn parse_block(t: &mut Tokens<'_>) -> Result<BlockTemplate, DictionaryError> {
    t.expect("{")?;
    let name = t.ident()?;
    let (line, quantity) = t.next()?;
    let quantity = match quantity {
        "Single" => BlockQuantity::Single,
        "Variable" => BlockQuantity::Variable,
        "Multiple" => {
            let n = t.number()?;
            if n == 0 || n > u8::MAX as u64 {
                return Err(DictionaryError::syntax(
                    line,
                    format!("block {} repeat count {} out of range", name, n),
                ));
            }
            BlockQuantity::Multiple(n as u8)
        }
        other => {
            return Err(DictionaryError::syntax(
                line,
                format!("unknown block quantity {}", other),
            ))
        }
    };
    let mut fields = Vec::new();
    while t.peek() == Some("{") {
        t.expect("{")?;
        let name = t.ident()?;
        let kind = FieldType::from_tokens(t)?;
        t.expect("}")?;
        fields.push(FieldTemplate { name, kind });
    }
    t.expect("}")?;
    Ok(BlockTemplate {
        name,
        quantity,
        fields,
    })
}

/// Map (frequency, template number) to the id the wire carries.
fn full_id(frequency: Frequency, number: u64) -> Option<MessageId> {
    let id = match frequency {
        Frequency::High if (1..=0xFE).contains(&number) => number as u32,
        Frequency::Medium if (1..=0xFE).contains(&number) => 0xFF00 | number as u32,
        Frequency::Low if (1..=0xFFF9).contains(&number) => 0xFFFF_0000 | number as u32,
        Frequency::Fixed if (0xFFFF_FFFA..=0xFFFF_FFFE).contains(&number) => number as u32,
        _ => return None,
    };
    Some(MessageId(id))
}

/// Whitespace/brace tokenizer that remembers line numbers for error reporting.
struct Tokens<'a> {
    items: Vec<(usize, &'a str)>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(src: &'a str) -> Self {
        let mut items = Vec::new();
        for (i, raw) in src.lines().enumerate() {
            let line = raw.split("//").next().unwrap_or("");
            let mut start = None;
            for (j, c) in line.char_indices() {
                if c == '{' || c == '}' || c.is_whitespace() {
                    if let Some(s) = start.take() {
                        items.push((i + 1, &line[s..j]));
                    }
                    if !c.is_whitespace() {
                        items.push((i + 1, &line[j..j + 1]));
                    }
                } else if start.is_none() {
                    start = Some(j);
                }
            }
            if let Some(s) = start {
                items.push((i + 1, &line[s..]));
            }
        }
        Self { items, pos: 0 }
    }

    fn peek(&self) -> Option<&'a str> {
        self.items.get(self.pos).map(|(_, tok)| *tok)
    }

    fn line(&self) -> usize {
        self.items
            .get(self.pos)
            .or_else(|| self.items.last())
            .map(|(line, _)| *line)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Result<(usize, &'a str), DictionaryError> {
        let item = self
            .items
            .get(self.pos)
            .copied()
            .ok_or(DictionaryError::UnexpectedEof)?;
        self.pos += 1;
        Ok(item)
    }

    fn expect(&mut self, want: &str) -> Result<(), DictionaryError> {
        let (line, tok) = self.next()?;
        if tok != want {
            return Err(DictionaryError::syntax(
                line,
                format!("expected '{}', found '{}'", want, tok),
            ));
        }
        Ok(())
    }

    fn ident(&mut self) -> Result<String, DictionaryError> {
        let (line, tok) = self.next()?;
        if tok == "{" || tok == "}" {
            return Err(DictionaryError::syntax(
                line,
                format!("expected a name, found '{}'", tok),
            ));
        }
        Ok(tok.to_string())
    }

    fn number(&mut self) -> Result<u64, DictionaryError> {
        let (line, tok) = self.next()?;
        let parsed = match tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => tok.parse::<u64>(),
        };
        parsed.map_err(|_| DictionaryError::syntax(line, format!("expected a number, found '{}'", tok)))
    }
}
