use crate::objects::object::{ObjBody, Object};
use crate::value::Value;

/// Nominal record type: name symbol, optional parent struct-type, this
/// type's own field-name symbols, and the total field count along the
/// parent chain.
pub struct StructType {
    pub name: Value,
    pub parent: Value,
    pub fields: Vec<Value>,
    pub total: usize,
}

/// An instance carries its type and a field vector whose length equals
/// the type's total field count.
pub struct StructInstance {
    pub stype: Value,
    pub fields: Vec<Value>,
}

/// Safety: `v` must be nil or a live struct-type object.
pub unsafe fn struct_type_of(v: Value) -> Option<*mut Object> {
    let p = match v {
        Value::Object(p) => p,
        _ => return None,
    };
    match &(*p).body {
        ObjBody::StructType(_) => Some(p),
        _ => None,
    }
}

unsafe fn type_body<'a>(p: *mut Object) -> &'a StructType {
    match &(*p).body {
        ObjBody::StructType(st) => &*(st as *const StructType),
        _ => unreachable!("struct op on non-struct-type object"),
    }
}

/// Total field count for a type: the parent's total plus its own.
pub unsafe fn total_fields(stype: Value) -> usize {
    match struct_type_of(stype) {
        Some(p) => type_body(p).total,
        None => 0,
    }
}

/// Walk the parent chain looking for `ancestor` by identity.
pub unsafe fn struct_type_isa(stype: Value, ancestor: Value) -> bool {
    let mut cur = stype;
    loop {
        if cur == ancestor {
            return true;
        }
        match struct_type_of(cur) {
            Some(p) => cur = type_body(p).parent,
            None => return false,
        }
    }
}

pub unsafe fn instance_isa(inst: Value, stype: Value) -> bool {
    let p = match inst {
        Value::Object(p) => p,
        _ => return false,
    };
    match &(*p).body {
        ObjBody::StructInstance(si) => struct_type_isa(si.stype, stype),
        _ => false,
    }
}

/// Linear index of `field` in an instance of `stype`.  A type's own
/// fields sit after all inherited ones, so the search walks up the chain
/// and offsets by the parent's total.
pub unsafe fn field_index(stype: Value, field: Value) -> Option<usize> {
    let p = struct_type_of(stype)?;
    let st = type_body(p);
    if let Some(pos) = st.fields.iter().position(|&f| f == field) {
        return Some(st.total - st.fields.len() + pos);
    }
    field_index(st.parent, field)
}

pub unsafe fn instance_ref_direct(inst: Value, index: usize) -> Value {
    let p = match inst {
        Value::Object(p) => p,
        _ => return Value::Nil,
    };
    match &(*p).body {
        ObjBody::StructInstance(si) => si.fields.get(index).copied().unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

pub unsafe fn instance_set_direct(inst: Value, index: usize, v: Value) {
    if let Value::Object(p) = inst {
        if let ObjBody::StructInstance(si) = &mut (*p).body {
            if index < si.fields.len() {
                si.fields[index] = v;
            }
        }
    }
}

pub unsafe fn instance_type(inst: Value) -> Value {
    match inst {
        Value::Object(p) => match &(*p).body {
            ObjBody::StructInstance(si) => si.stype,
            _ => Value::Nil,
        },
        _ => Value::Nil,
    }
}
