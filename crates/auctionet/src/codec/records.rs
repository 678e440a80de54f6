// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Conversion between domain objects and data records.
//!
//! Every message built here carries exactly one template followed by its
//! records. Bidding objects produce one record per element; parsing groups
//! consecutive records with the same key back into one object.

use super::fields::*;
use super::template::{DataRecord, RecordView, Template, TemplateKind, Value};
use super::{Message, MessageType};
use crate::error::CodecError;
use crate::interval::Interval;
use crate::object::{Auction, BidElement, BiddingObject, ObjectKey, ResourceSelector};
use std::collections::BTreeMap;

pub const ASK_TEMPLATE_ID: u16 = 256;
pub const AUCTION_TEMPLATE_ID: u16 = 257;
pub const BID_TEMPLATE_ID: u16 = 258;
pub const ALLOCATION_TEMPLATE_ID: u16 = 259;

const ASK_FIELDS: &[Field] = &[OBJECT_SET, OBJECT_NAME, RESOURCE, START, STOP];

const AUCTION_FIELDS: &[Field] = &[
    OBJECT_SET,
    OBJECT_NAME,
    RESOURCE,
    MODULE,
    START,
    STOP,
    INTERVAL,
    ALIGN,
    PARAMS,
];

const BIDDING_FIELDS: &[Field] = &[
    OBJECT_SET,
    OBJECT_NAME,
    AUCTION_SET,
    AUCTION_NAME,
    MODULE,
    SESSION_ID,
    START,
    STOP,
    ELEMENT_NAME,
    QUANTITY,
    UNIT_PRICE,
];

/// An agent's question: which auctions sell `resource` during `[start, stop)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ask {
    /// Resource request the ask is issued for.
    pub request: ObjectKey,
    pub resource: ResourceSelector,
    pub start: u64,
    pub stop: u64,
}

fn single_template(id: u16, kind: TemplateKind, fields: &[Field], records: Vec<Vec<Value>>) -> Message {
    Message {
        templates: vec![Template::new(id, kind, fields)],
        records: records
            .into_iter()
            .map(|values| DataRecord {
                template_id: id,
                values,
            })
            .collect(),
        ..Default::default()
    }
}

fn expect_type(msg: &Message, expected: TemplateKind) -> Result<(), CodecError> {
    let found = msg.message_type();
    if found != MessageType::from(expected) {
        let found = msg.templates.first().map(|t| t.kind.as_str()).unwrap_or("control");
        return Err(CodecError::UnexpectedKind {
            expected: expected.as_str(),
            found,
        });
    }
    Ok(())
}

fn key_of(view: &RecordView<'_>, set: &Field, name: &Field) -> Result<ObjectKey, CodecError> {
    let set_value = view.str(set)?;
    let name_value = view.str(name)?;
    if set_value.is_empty() || name_value.is_empty() {
        return Err(CodecError::InvalidValue(set.name));
    }
    Ok(ObjectKey::new(set_value, name_value))
}

fn str_value(s: impl ToString) -> Value {
    Value::Str(s.to_string())
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

const PARAM_SEP: char = ';';
const PARAM_KV: char = '=';
const PARAM_ESCAPE: char = '\\';

fn push_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, PARAM_SEP | PARAM_KV | PARAM_ESCAPE) {
            out.push(PARAM_ESCAPE);
        }
        out.push(c);
    }
}

/// Render a parameter map as `k=v;k=v`, backslash-escaping `;`, `=` and `\`
/// inside keys and values.
pub fn encode_params(params: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (i, (k, v)) in params.iter().enumerate() {
        if i > 0 {
            out.push(PARAM_SEP);
        }
        push_escaped(&mut out, k);
        out.push(PARAM_KV);
        push_escaped(&mut out, v);
    }
    out
}

pub fn decode_params(s: &str) -> Result<BTreeMap<String, String>, CodecError> {
    let invalid = CodecError::InvalidValue("params");
    let mut params = BTreeMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            PARAM_ESCAPE => {
                let escaped = chars.next().ok_or_else(|| invalid.clone())?;
                let target = if in_value { &mut value } else { &mut key };
                target.push(escaped);
            }
            PARAM_KV if !in_value => in_value = true,
            PARAM_KV => return Err(invalid),
            PARAM_SEP => {
                if in_value {
                    params.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                    in_value = false;
                } else if !key.is_empty() {
                    return Err(invalid);
                }
            }
            c => {
                let target = if in_value { &mut value } else { &mut key };
                target.push(c);
            }
        }
    }
    if in_value {
        params.insert(key, value);
    } else if !key.is_empty() {
        return Err(invalid);
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Ask
// ---------------------------------------------------------------------------

pub fn ask_message(asks: &[Ask]) -> Message {
    let records = asks
        .iter()
        .map(|ask| {
            vec![
                str_value(ask.request.set()),
                str_value(ask.request.name()),
                str_value(&ask.resource),
                Value::U64(ask.start),
                Value::U64(ask.stop),
            ]
        })
        .collect();
    single_template(ASK_TEMPLATE_ID, TemplateKind::Ask, ASK_FIELDS, records)
}

pub fn parse_asks(msg: &Message) -> Result<Vec<Ask>, CodecError> {
    expect_type(msg, TemplateKind::Ask)?;
    msg.records_of(TemplateKind::Ask)
        .map(|view| {
            let resource = ResourceSelector::parse(view.str(&RESOURCE)?)
                .map_err(|_| CodecError::InvalidValue(RESOURCE.name))?;
            Ok(Ask {
                request: key_of(&view, &OBJECT_SET, &OBJECT_NAME)?,
                resource,
                start: view.u64(&START)?,
                stop: view.u64(&STOP)?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Auctions
// ---------------------------------------------------------------------------

pub fn auctions_message(auctions: &[Auction]) -> Message {
    let records = auctions
        .iter()
        .map(|a| {
            vec![
                str_value(a.key().set()),
                str_value(a.key().name()),
                str_value(&a.resource),
                str_value(&a.module),
                Value::U64(a.interval.start),
                Value::U64(a.interval.stop),
                Value::U64(a.interval.interval_ms),
                Value::U8(u8::from(a.interval.align)),
                Value::Str(encode_params(&a.params)),
            ]
        })
        .collect();
    single_template(AUCTION_TEMPLATE_ID, TemplateKind::Auction, AUCTION_FIELDS, records)
}

pub fn parse_auctions(msg: &Message) -> Result<Vec<Auction>, CodecError> {
    expect_type(msg, TemplateKind::Auction)?;
    msg.records_of(TemplateKind::Auction)
        .map(|view| {
            let resource = ObjectKey::parse(view.str(&RESOURCE)?)
                .map_err(|_| CodecError::InvalidValue(RESOURCE.name))?;
            let mut interval = Interval::new(view.u64(&START)?, view.u64(&STOP)?, view.u64(&INTERVAL)?)
                .map_err(|_| CodecError::InvalidValue(STOP.name))?;
            interval.align = view.flag(&ALIGN)?;

            let mut auction = Auction::new(
                key_of(&view, &OBJECT_SET, &OBJECT_NAME)?,
                resource,
                view.str(&MODULE)?,
                interval,
            );
            auction.params = decode_params(view.str(&PARAMS)?)?;
            Ok(auction)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Bids and allocations
// ---------------------------------------------------------------------------

fn bidding_records(objects: &[BiddingObject]) -> Vec<Vec<Value>> {
    let mut records = Vec::new();
    for obj in objects {
        let row = |name: &str, quantity: f64, unit_price: f64| {
            vec![
                str_value(obj.key().set()),
                str_value(obj.key().name()),
                str_value(obj.auction.set()),
                str_value(obj.auction.name()),
                str_value(&obj.module),
                Value::Str(obj.session_id.clone().unwrap_or_default()),
                Value::U64(obj.start),
                Value::U64(obj.stop),
                str_value(name),
                Value::F64(quantity),
                Value::F64(unit_price),
            ]
        };
        if obj.elements.is_empty() {
            // An element-less object still travels as one record.
            records.push(row("", 0.0, 0.0));
        }
        for e in &obj.elements {
            records.push(row(&e.name, e.quantity, e.unit_price));
        }
    }
    records
}

fn parse_bidding(msg: &Message, kind: TemplateKind) -> Result<Vec<BiddingObject>, CodecError> {
    expect_type(msg, kind)?;
    let mut out: Vec<BiddingObject> = Vec::new();
    for view in msg.records_of(kind) {
        let key = key_of(&view, &OBJECT_SET, &OBJECT_NAME)?;
        let element_name = view.str(&ELEMENT_NAME)?;
        let element = (!element_name.is_empty())
            .then(|| -> Result<BidElement, CodecError> {
                Ok(BidElement::new(
                    element_name,
                    view.f64(&QUANTITY)?,
                    view.f64(&UNIT_PRICE)?,
                ))
            })
            .transpose()?;

        if let Some(last) = out.last_mut().filter(|last| last.key() == &key) {
            last.elements.extend(element);
            continue;
        }

        let auction = key_of(&view, &AUCTION_SET, &AUCTION_NAME)?;
        let module = view.str(&MODULE)?;
        let mut obj = match kind {
            TemplateKind::Allocation => BiddingObject::allocation(key, auction, module),
            _ => BiddingObject::bid(key, auction, module),
        }
        .with_window(view.u64(&START)?, view.u64(&STOP)?);
        let session = view.str(&SESSION_ID)?;
        obj.session_id = (!session.is_empty()).then(|| session.to_string());
        obj.elements.extend(element);
        out.push(obj);
    }
    Ok(out)
}

pub fn bids_message(bids: &[BiddingObject]) -> Message {
    single_template(BID_TEMPLATE_ID, TemplateKind::Bid, BIDDING_FIELDS, bidding_records(bids))
}

pub fn parse_bids(msg: &Message) -> Result<Vec<BiddingObject>, CodecError> {
    parse_bidding(msg, TemplateKind::Bid)
}

pub fn allocations_message(allocations: &[BiddingObject]) -> Message {
    single_template(
        ALLOCATION_TEMPLATE_ID,
        TemplateKind::Allocation,
        BIDDING_FIELDS,
        bidding_records(allocations),
    )
}

pub fn parse_allocations(msg: &Message) -> Result<Vec<BiddingObject>, CodecError> {
    parse_bidding(msg, TemplateKind::Allocation)
}
