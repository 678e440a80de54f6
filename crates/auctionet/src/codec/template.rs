// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Templates, field specifications and data records.
//
// A template lists (enterprise-id, field-id, value-type) triples; a data
// record supplies one value per triple, in template order.

use crate::codec::fields::Field;
use crate::error::CodecError;

/// Lowest id a template may use; smaller set ids are reserved.
pub const MIN_TEMPLATE_ID: u16 = 256;

// ---------------------------------------------------------------------------
// Template kind
// ---------------------------------------------------------------------------

pub const KIND_ASK: u8 = 0x01;
pub const KIND_AUCTION: u8 = 0x02;
pub const KIND_BID: u8 = 0x03;
pub const KIND_ALLOCATION: u8 = 0x04;

/// What the records of a template describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TemplateKind {
    Ask = KIND_ASK,
    Auction = KIND_AUCTION,
    Bid = KIND_BID,
    Allocation = KIND_ALLOCATION,
}

impl TemplateKind {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            KIND_ASK => Ok(Self::Ask),
            KIND_AUCTION => Ok(Self::Auction),
            KIND_BID => Ok(Self::Bid),
            KIND_ALLOCATION => Ok(Self::Allocation),
            _ => Err(CodecError::UnknownTemplateKind(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::Auction => "auction",
            Self::Bid => "bid",
            Self::Allocation => "allocation",
        }
    }
}

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

pub const TYPE_U8: u8 = 0x01;
pub const TYPE_U32: u8 = 0x02;
pub const TYPE_U64: u8 = 0x03;
pub const TYPE_F64: u8 = 0x04;
pub const TYPE_STR: u8 = 0x05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    U8 = TYPE_U8,
    U32 = TYPE_U32,
    U64 = TYPE_U64,
    F64 = TYPE_F64,
    Str = TYPE_STR,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            TYPE_U8 => Ok(Self::U8),
            TYPE_U32 => Ok(Self::U32),
            TYPE_U64 => Ok(Self::U64),
            TYPE_F64 => Ok(Self::F64),
            TYPE_STR => Ok(Self::Str),
            _ => Err(CodecError::UnknownValueType(v)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F64 => "f64",
            Self::Str => "string",
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::U8(_) => ValueType::U8,
            Self::U32(_) => ValueType::U32,
            Self::U64(_) => ValueType::U64,
            Self::F64(_) => ValueType::F64,
            Self::Str(_) => ValueType::Str,
        }
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Self::U8(v) => buf.push(*v),
            Self::U32(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::U64(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::F64(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            Self::Str(s) => {
                let len = u16::try_from(s.len()).map_err(|_| CodecError::Overflow("string length"))?;
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
        Ok(())
    }

    pub(crate) fn read_from(ty: ValueType, r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(match ty {
            ValueType::U8 => Self::U8(r.u8()?),
            ValueType::U32 => Self::U32(r.u32()?),
            ValueType::U64 => Self::U64(r.u64()?),
            ValueType::F64 => Self::F64(f64::from_bits(r.u64()?)),
            ValueType::Str => {
                let len = r.u16()? as usize;
                let bytes = r.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                Self::Str(s.to_string())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// One column of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    pub enterprise: u32,
    pub field_id: u16,
    pub value_type: ValueType,
}

pub const FIELD_SPEC_SIZE: usize = 7;

impl From<&Field> for FieldSpec {
    fn from(f: &Field) -> Self {
        Self {
            enterprise: f.enterprise,
            field_id: f.id,
            value_type: f.value_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: u16,
    pub kind: TemplateKind,
    pub fields: Vec<FieldSpec>,
}

impl Template {
    pub fn new(id: u16, kind: TemplateKind, fields: &[Field]) -> Self {
        Self {
            id,
            kind,
            fields: fields.iter().map(FieldSpec::from).collect(),
        }
    }

    /// Column index of a catalog field.
    pub fn position(&self, field: &Field) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.enterprise == field.enterprise && f.field_id == field.id)
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let count = u16::try_from(self.fields.len()).map_err(|_| CodecError::Overflow("field count"))?;
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(self.kind.as_u8());
        buf.extend_from_slice(&count.to_be_bytes());
        for f in &self.fields {
            buf.extend_from_slice(&f.enterprise.to_be_bytes());
            buf.extend_from_slice(&f.field_id.to_be_bytes());
            buf.push(f.value_type.as_u8());
        }
        Ok(())
    }

    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let id = r.u16()?;
        if id < MIN_TEMPLATE_ID {
            return Err(CodecError::ReservedTemplateId(id));
        }
        let kind = TemplateKind::from_u8(r.u8()?)?;
        let count = r.u16()? as usize;
        if r.remaining() < count * FIELD_SPEC_SIZE {
            return Err(CodecError::BufferTooShort);
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldSpec {
                enterprise: r.u32()?,
                field_id: r.u16()?,
                value_type: ValueType::from_u8(r.u8()?)?,
            });
        }
        Ok(Self { id, kind, fields })
    }
}

/// Values for one template, in template order.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub template_id: u16,
    pub values: Vec<Value>,
}

/// Read-only view of a record through its template.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub template: &'a Template,
    pub record: &'a DataRecord,
}

impl<'a> RecordView<'a> {
    pub fn value(&self, field: &Field) -> Option<&'a Value> {
        self.template
            .position(field)
            .and_then(|i| self.record.values.get(i))
    }

    fn require(&self, field: &Field) -> Result<&'a Value, CodecError> {
        self.value(field).ok_or(CodecError::MissingField(field.name))
    }

    fn mismatch(field: &Field, expected: ValueType, found: &Value) -> CodecError {
        CodecError::FieldTypeMismatch {
            field: field.name,
            expected: expected.as_str(),
            found: found.value_type().as_str(),
        }
    }

    pub fn str(&self, field: &Field) -> Result<&'a str, CodecError> {
        match self.require(field)? {
            Value::Str(s) => Ok(s.as_str()),
            other => Err(Self::mismatch(field, ValueType::Str, other)),
        }
    }

    pub fn u64(&self, field: &Field) -> Result<u64, CodecError> {
        match self.require(field)? {
            Value::U64(v) => Ok(*v),
            Value::U32(v) => Ok(u64::from(*v)),
            other => Err(Self::mismatch(field, ValueType::U64, other)),
        }
    }

    pub fn f64(&self, field: &Field) -> Result<f64, CodecError> {
        match self.require(field)? {
            Value::F64(v) => Ok(*v),
            other => Err(Self::mismatch(field, ValueType::F64, other)),
        }
    }

    pub fn flag(&self, field: &Field) -> Result<bool, CodecError> {
        match self.require(field)? {
            Value::U8(v) => Ok(*v != 0),
            other => Err(Self::mismatch(field, ValueType::U8, other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Big-endian reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over a byte slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::BufferTooShort);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}
