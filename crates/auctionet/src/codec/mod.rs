// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire codec: message header plus self-describing template/record sets.
//!
//! ```text
//! +---------+-----------+-------------+-------+--------+-----------+-----------+------+
//! | version | domain id | session tag | flags | seq no | [ack no]  | set count | sets |
//! |   u16   |    u32    |     u32     |  u8   |  u32   | u32 (ACK) |    u16    | ...  |
//! +---------+-----------+-------------+-------+--------+-----------+-----------+------+
//!
//! set: set id (u16) | content length (u32) | content
//!   set id 2         -> templates: id u16, kind u8, count u16, count * (eno u32, fid u16, type u8)
//!   set id >= 256    -> data records of the template with that id
//! ```
//!
//! All integers are big-endian. Malformed input returns an error, never panics.

pub mod fields;
pub mod records;
pub mod template;

use crate::error::CodecError;
use std::fmt;
use template::{DataRecord, Reader, RecordView, Template, TemplateKind};

pub use template::{FieldSpec, Value, ValueType, MIN_TEMPLATE_ID};

pub const PROTOCOL_VERSION: u16 = 2;

/// Set id carrying template definitions.
pub const TEMPLATE_SET_ID: u16 = 2;

/// Header size without the optional ack number.
pub const BASE_HEADER_SIZE: usize = 15;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Control flags of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const SYN: Flags = Flags(0x01);
    pub const ACK: Flags = Flags(0x02);
    pub const FIN: Flags = Flags(0x04);

    const KNOWN: u8 = 0x07;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::KNOWN)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("DATA");
        }
        let names: Vec<&str> = [(Self::SYN, "SYN"), (Self::ACK, "ACK"), (Self::FIN, "FIN")]
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("+"))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u16,
    pub domain_id: u32,
    /// Demultiplexes sessions sharing one connection.
    pub session_tag: u32,
    pub flags: Flags,
    pub seq_no: u32,
    /// Only meaningful (and only encoded) when ACK is set.
    pub ack_seq_no: u32,
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            domain_id: 0,
            session_tag: 0,
            flags: Flags::NONE,
            seq_no: 0,
            ack_seq_no: 0,
        }
    }
}

/// Application meaning of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Handshake / acknowledgment only.
    Control,
    Ask,
    Auction,
    Bid,
    Allocation,
}

impl From<TemplateKind> for MessageType {
    fn from(kind: TemplateKind) -> Self {
        match kind {
            TemplateKind::Ask => Self::Ask,
            TemplateKind::Auction => Self::Auction,
            TemplateKind::Bid => Self::Bid,
            TemplateKind::Allocation => Self::Allocation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: MessageHeader,
    pub templates: Vec<Template>,
    pub records: Vec<DataRecord>,
}

impl Message {
    /// A payload-less message carrying only `flags`.
    pub fn control(flags: Flags) -> Self {
        Self {
            header: MessageHeader {
                flags,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn syn(&self) -> bool {
        self.header.flags.contains(Flags::SYN)
    }

    pub fn ack(&self) -> bool {
        self.header.flags.contains(Flags::ACK)
    }

    pub fn fin(&self) -> bool {
        self.header.flags.contains(Flags::FIN)
    }

    pub fn seq_no(&self) -> u32 {
        self.header.seq_no
    }

    /// Acknowledged sequence number, present only with the ACK flag.
    pub fn ack_seq_no(&self) -> Option<u32> {
        self.ack().then_some(self.header.ack_seq_no)
    }

    pub fn message_type(&self) -> MessageType {
        self.templates
            .first()
            .map(|t| MessageType::from(t.kind))
            .unwrap_or(MessageType::Control)
    }

    pub fn is_application(&self) -> bool {
        self.message_type() != MessageType::Control
    }

    pub fn template(&self, id: u16) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// Records whose template has `kind`, in message order.
    pub fn records_of(&self, kind: TemplateKind) -> impl Iterator<Item = RecordView<'_>> {
        self.records.iter().filter_map(move |record| {
            self.template(record.template_id)
                .filter(|t| t.kind == kind)
                .map(|template| RecordView { template, record })
        })
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize a message to bytes.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(64);
    let h = &msg.header;
    buf.extend_from_slice(&h.version.to_be_bytes());
    buf.extend_from_slice(&h.domain_id.to_be_bytes());
    buf.extend_from_slice(&h.session_tag.to_be_bytes());
    buf.push(h.flags.bits());
    buf.extend_from_slice(&h.seq_no.to_be_bytes());
    if h.flags.contains(Flags::ACK) {
        buf.extend_from_slice(&h.ack_seq_no.to_be_bytes());
    }

    let mut sets: Vec<(u16, Vec<u8>)> = Vec::new();
    if !msg.templates.is_empty() {
        let mut content = Vec::new();
        for t in &msg.templates {
            if t.id < MIN_TEMPLATE_ID {
                return Err(CodecError::ReservedTemplateId(t.id));
            }
            t.write_to(&mut content)?;
        }
        sets.push((TEMPLATE_SET_ID, content));
    }

    for t in &msg.templates {
        let mut content = Vec::new();
        for record in msg.records.iter().filter(|r| r.template_id == t.id) {
            if record.values.len() != t.fields.len() {
                return Err(CodecError::MissingField("record value"));
            }
            for (value, spec) in record.values.iter().zip(&t.fields) {
                if value.value_type() != spec.value_type {
                    return Err(CodecError::FieldTypeMismatch {
                        field: "record value",
                        expected: spec.value_type.as_str(),
                        found: value.value_type().as_str(),
                    });
                }
                value.write_to(&mut content)?;
            }
        }
        if !content.is_empty() {
            sets.push((t.id, content));
        }
    }
    if let Some(orphan) = msg.records.iter().find(|r| msg.template(r.template_id).is_none()) {
        return Err(CodecError::UnknownTemplate(orphan.template_id));
    }

    let count = u16::try_from(sets.len()).map_err(|_| CodecError::Overflow("set count"))?;
    buf.extend_from_slice(&count.to_be_bytes());
    for (id, content) in sets {
        let len = u32::try_from(content.len()).map_err(|_| CodecError::Overflow("set length"))?;
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&content);
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse a message. Templates must precede the data sets that use them.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    let mut r = Reader::new(buf);
    let version = r.u16()?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let domain_id = r.u32()?;
    let session_tag = r.u32()?;
    let flags = Flags::from_bits(r.u8()?);
    let seq_no = r.u32()?;
    let ack_seq_no = if flags.contains(Flags::ACK) { r.u32()? } else { 0 };

    let mut msg = Message {
        header: MessageHeader {
            version,
            domain_id,
            session_tag,
            flags,
            seq_no,
            ack_seq_no,
        },
        ..Default::default()
    };

    let set_count = r.u16()?;
    for _ in 0..set_count {
        let set_id = r.u16()?;
        let len = r.u32()? as usize;
        let content = r.take(len)?;
        let mut set = Reader::new(content);

        if set_id == TEMPLATE_SET_ID {
            while set.remaining() > 0 {
                msg.templates.push(Template::read_from(&mut set)?);
            }
        } else if set_id >= MIN_TEMPLATE_ID {
            let template = msg
                .template(set_id)
                .ok_or(CodecError::UnknownTemplate(set_id))?
                .clone();
            if template.fields.is_empty() {
                continue;
            }
            while set.remaining() > 0 {
                let values = template
                    .fields
                    .iter()
                    .map(|spec| Value::read_from(spec.value_type, &mut set))
                    .collect::<Result<Vec<_>, _>>()?;
                msg.records.push(DataRecord {
                    template_id: set_id,
                    values,
                });
            }
        } else {
            return Err(CodecError::ReservedTemplateId(set_id));
        }
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::fields::*;
    use super::*;

    fn bid_template() -> Template {
        Template::new(300, TemplateKind::Bid, &[OBJECT_SET, QUANTITY, START, ALIGN])
    }

    #[test]
    fn control_header_without_ack_omits_ack_field() {
        let mut msg = Message::control(Flags::SYN);
        msg.header.seq_no = 7;
        msg.header.ack_seq_no = 99;
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.len(), BASE_HEADER_SIZE + 2);

        let decoded = decode(&bytes).unwrap();
        assert!(decoded.syn());
        assert!(!decoded.ack());
        assert_eq!(decoded.seq_no(), 7);
        assert_eq!(decoded.ack_seq_no(), None);
        assert_eq!(decoded.message_type(), MessageType::Control);
    }

    #[test]
    fn ack_header_carries_ack_number() {
        let mut msg = Message::control(Flags::SYN | Flags::ACK);
        msg.header.seq_no = u32::MAX;
        msg.header.ack_seq_no = 41;
        msg.header.session_tag = 0xDEAD_BEEF;
        msg.header.domain_id = 3;

        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.header, msg.header);
        assert_eq!(decoded.ack_seq_no(), Some(41));
    }

    #[test]
    fn records_follow_template_order() {
        let msg = Message {
            templates: vec![bid_template()],
            records: vec![
                DataRecord {
                    template_id: 300,
                    values: vec![
                        Value::Str("bids".into()),
                        Value::F64(2.5),
                        Value::U64(1_700_000_000_000),
                        Value::U8(1),
                    ],
                },
                DataRecord {
                    template_id: 300,
                    values: vec![
                        Value::Str("bids".into()),
                        Value::F64(0.25),
                        Value::U64(5),
                        Value::U8(0),
                    ],
                },
            ],
            ..Default::default()
        };

        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.message_type(), MessageType::Bid);
        let views: Vec<_> = decoded.records_of(TemplateKind::Bid).collect();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].f64(&QUANTITY).unwrap(), 2.5);
        assert!(views[0].flag(&ALIGN).unwrap());
        assert_eq!(views[1].u64(&START).unwrap(), 5);
        assert_eq!(
            views[1].str(&MODULE).unwrap_err(),
            CodecError::MissingField("module")
        );
        assert!(matches!(
            views[1].f64(&START).unwrap_err(),
            CodecError::FieldTypeMismatch { .. }
        ));
    }

    #[test]
    fn truncated_input_rejected() {
        let msg = Message {
            templates: vec![bid_template()],
            records: vec![DataRecord {
                template_id: 300,
                values: vec![
                    Value::Str("bids".into()),
                    Value::F64(1.0),
                    Value::U64(1),
                    Value::U8(0),
                ],
            }],
            ..Default::default()
        };
        let bytes = encode(&msg).unwrap();
        for cut in [0, 3, BASE_HEADER_SIZE, bytes.len() - 1] {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = encode(&Message::control(Flags::FIN)).unwrap();
        bytes[1] = 9;
        assert_eq!(decode(&bytes).unwrap_err(), CodecError::UnsupportedVersion(9));
    }

    #[test]
    fn encode_rejects_mismatched_records() {
        let msg = Message {
            templates: vec![bid_template()],
            records: vec![DataRecord {
                template_id: 300,
                values: vec![
                    Value::U64(1),
                    Value::F64(1.0),
                    Value::U64(1),
                    Value::U8(0),
                ],
            }],
            ..Default::default()
        };
        assert!(matches!(
            encode(&msg).unwrap_err(),
            CodecError::FieldTypeMismatch { .. }
        ));

        let orphan = Message {
            records: vec![DataRecord {
                template_id: 999,
                values: vec![],
            }],
            ..Default::default()
        };
        assert_eq!(encode(&orphan).unwrap_err(), CodecError::UnknownTemplate(999));
    }

    #[test]
    fn flags_display() {
        assert_eq!((Flags::SYN | Flags::ACK).to_string(), "SYN+ACK");
        assert_eq!(Flags::NONE.to_string(), "DATA");
        assert_eq!(Flags::from_bits(0xFF), Flags::SYN | Flags::ACK | Flags::FIN);
    }
}
