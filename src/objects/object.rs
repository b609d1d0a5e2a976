use strum_macros::Display;

use crate::array::RtArray;
use crate::bignum::Bignum;
use crate::bitset::Bitset;
use crate::handle::Handle;
use crate::hash::RtHash;
use crate::module::Module;
use crate::strings::{RtString, Substring};
use crate::struct_type::{StructInstance, StructType};
use crate::thread::ThreadRegs;
use crate::value::Value;

/// One type tag per heap kind.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Pair,
    Array,
    Hash,
    Str,
    Substring,
    Symbol,
    Closure,
    Primitive,
    Continuation,
    Frame,
    StructType,
    StructInstance,
    Handle,
    Module,
    Bitset,
    Bignum,
    CPointer,
    /// Sentinel scribbled over freed objects in debug builds.
    Freed,
}

/// Tri-color mark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Grey,
    Black,
}

/// Finalizers run after the sweep and may not allocate, so they are a
/// closed set of native actions rather than arbitrary callables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalizer {
    CloseHandle,
}

impl Finalizer {
    pub fn run(self, obj: &mut Object) {
        match self {
            Finalizer::CloseHandle => {
                if let ObjBody::Handle(h) = &mut obj.body {
                    h.close();
                }
            }
        }
    }
}

pub struct ObjHeader {
    pub kind: ObjectKind,
    pub color: Color,
    /// Generation of the tracing pass that last visited this object.
    pub gen: u64,
    pub finalizer: Option<Finalizer>,
}

pub struct Object {
    pub header: ObjHeader,
    pub body: ObjBody,
}

/// Classic cons cell.
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub head: Value,
    pub tail: Value,
}

/// Interned string with numeric identity.  Uniqueness is maintained by
/// the heap's intern table: pointer equality iff spelling equality.
pub struct Symbol {
    pub name: Box<str>,
    pub id: u64,
}

/// A callable pairing a code offset with a captured frame.
pub struct Closure {
    pub pc: usize,
    pub frame: Value,
    pub name: Value,
    pub docs: Value,
}

pub type PrimitiveFn =
    fn(&mut crate::runtime::Runtime, &[Value]) -> crate::condition::VmResult<Value>;

pub struct Primitive {
    pub func: PrimitiveFn,
    pub arity: u8,
    pub varargs: bool,
    pub name: &'static str,
    pub docs: &'static str,
}

/// A captured execution state: a snapshot of the value stack plus the
/// register file.  Immutable once captured; invoking it overwrites the
/// running thread's stack and registers, any number of times.
pub struct Continuation {
    pub stack: Vec<Value>,
    pub regs: ThreadRegs,
}

/// Activation record: local slots plus the parent frame.
pub struct Frame {
    pub parent: Value,
    pub slots: Vec<Value>,
}

/// Wrapper for foreign data.
pub struct CPointer {
    pub ptr: *mut std::ffi::c_void,
}

pub enum ObjBody {
    Pair(Pair),
    Array(RtArray),
    Hash(RtHash),
    Str(RtString),
    Substring(Substring),
    Symbol(Symbol),
    Closure(Closure),
    Primitive(Primitive),
    Continuation(Continuation),
    Frame(Frame),
    StructType(StructType),
    StructInstance(StructInstance),
    Handle(Handle),
    Module(Module),
    Bitset(Bitset),
    Bignum(Bignum),
    CPointer(CPointer),
    Freed,
}

impl ObjBody {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjBody::Pair(_) => ObjectKind::Pair,
            ObjBody::Array(_) => ObjectKind::Array,
            ObjBody::Hash(_) => ObjectKind::Hash,
            ObjBody::Str(_) => ObjectKind::Str,
            ObjBody::Substring(_) => ObjectKind::Substring,
            ObjBody::Symbol(_) => ObjectKind::Symbol,
            ObjBody::Closure(_) => ObjectKind::Closure,
            ObjBody::Primitive(_) => ObjectKind::Primitive,
            ObjBody::Continuation(_) => ObjectKind::Continuation,
            ObjBody::Frame(_) => ObjectKind::Frame,
            ObjBody::StructType(_) => ObjectKind::StructType,
            ObjBody::StructInstance(_) => ObjectKind::StructInstance,
            ObjBody::Handle(_) => ObjectKind::Handle,
            ObjBody::Module(_) => ObjectKind::Module,
            ObjBody::Bitset(_) => ObjectKind::Bitset,
            ObjBody::Bignum(_) => ObjectKind::Bignum,
            ObjBody::CPointer(_) => ObjectKind::CPointer,
            ObjBody::Freed => ObjectKind::Freed,
        }
    }
}

impl Object {
    pub fn new(body: ObjBody, finalizer: Option<Finalizer>) -> Object {
        Object {
            header: ObjHeader {
                kind: body.kind(),
                color: Color::White,
                gen: 0,
                finalizer,
            },
            body,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.header.kind
    }

    /// Approximate heap footprint: header plus owned payload capacity.
    /// Referenced GC objects are not traversed; they account for
    /// themselves.
    pub fn deep_size(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        base + match &self.body {
            ObjBody::Pair(_) => 0,
            ObjBody::Array(a) => a.elems.capacity() * std::mem::size_of::<Value>(),
            ObjBody::Hash(h) => h.slot_bytes(),
            ObjBody::Str(s) => s.byte_capacity(),
            ObjBody::Substring(_) => 0,
            ObjBody::Symbol(s) => s.name.len(),
            ObjBody::Closure(_) => 0,
            ObjBody::Primitive(_) => 0,
            ObjBody::Continuation(k) => k.stack.capacity() * std::mem::size_of::<Value>(),
            ObjBody::Frame(f) => f.slots.capacity() * std::mem::size_of::<Value>(),
            ObjBody::StructType(st) => st.fields.capacity() * std::mem::size_of::<Value>(),
            ObjBody::StructInstance(si) => si.fields.capacity() * std::mem::size_of::<Value>(),
            ObjBody::Handle(_) => 64,
            ObjBody::Module(m) => m.approx_bytes(),
            ObjBody::Bitset(b) => b.words.capacity() * std::mem::size_of::<u64>(),
            ObjBody::Bignum(_) => 0,
            ObjBody::CPointer(_) => 0,
            ObjBody::Freed => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_body() {
        let o = Object::new(
            ObjBody::Pair(Pair {
                head: Value::Nil,
                tail: Value::Nil,
            }),
            None,
        );
        assert_eq!(o.kind(), ObjectKind::Pair);
        assert_eq!(o.header.color, Color::White);
        assert!(o.header.finalizer.is_none());
    }

    #[test]
    fn deep_size_counts_payload() {
        let a = Object::new(ObjBody::Array(RtArray::with_capacity(8)), None);
        let p = Object::new(
            ObjBody::Pair(Pair {
                head: Value::Nil,
                tail: Value::Nil,
            }),
            None,
        );
        assert!(a.deep_size() > p.deep_size());
    }
}
