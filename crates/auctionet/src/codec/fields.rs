// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Field catalog shared by agents and servers.

use crate::codec::template::ValueType;

/// Enterprise id of the built-in fields.
pub const ENTERPRISE_AUCTIONET: u32 = 0;

/// A catalog entry: identity on the wire plus its value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub enterprise: u32,
    pub id: u16,
    pub value_type: ValueType,
    pub name: &'static str,
}

const fn field(id: u16, value_type: ValueType, name: &'static str) -> Field {
    Field {
        enterprise: ENTERPRISE_AUCTIONET,
        id,
        value_type,
        name,
    }
}

pub const OBJECT_SET: Field = field(1, ValueType::Str, "object_set");
pub const OBJECT_NAME: Field = field(2, ValueType::Str, "object_name");
pub const AUCTION_SET: Field = field(3, ValueType::Str, "auction_set");
pub const AUCTION_NAME: Field = field(4, ValueType::Str, "auction_name");
pub const RESOURCE: Field = field(5, ValueType::Str, "resource");
pub const MODULE: Field = field(6, ValueType::Str, "module");
pub const SESSION_ID: Field = field(7, ValueType::Str, "session_id");
pub const START: Field = field(8, ValueType::U64, "start");
pub const STOP: Field = field(9, ValueType::U64, "stop");
pub const INTERVAL: Field = field(10, ValueType::U64, "interval");
pub const ALIGN: Field = field(11, ValueType::U8, "align");
pub const ELEMENT_NAME: Field = field(12, ValueType::Str, "element_name");
pub const QUANTITY: Field = field(13, ValueType::F64, "quantity");
pub const UNIT_PRICE: Field = field(14, ValueType::F64, "unit_price");
/// `key=value` pairs joined by `;`.
pub const PARAMS: Field = field(15, ValueType::Str, "params");
