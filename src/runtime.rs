use std::collections::HashMap;
use std::time::Instant;

use crate::condition::{self, ConditionTable};
use crate::handle::{ConsoleOps, ConsoleStream, Handle};
use crate::hash::{HashFns, RtHash};
use crate::heap::Heap;
use crate::module::Module;
use crate::objects::object::{
    Closure, Finalizer, Frame, ObjBody, Object, Pair, Primitive, PrimitiveFn,
};
use crate::primitives;
use crate::strings::RtString;
use crate::struct_type::{StructInstance, StructType};
use crate::thread::RtThread;
use crate::value::Value;

/// The process-wide runtime state as one explicit context object: heap,
/// running thread, code and constants, global values vector, modules,
/// the krun stack and the condition machinery.  Every primitive receives
/// it; the design is re-entrant within one OS thread.
pub struct Runtime {
    pub heap: Heap,
    pub thread: RtThread,
    /// The program: one grow-only byte vector of opcodes.
    pub code: Vec<u8>,
    /// Grow-only constants pool, parallel to the code.
    pub constants: Vec<Value>,
    /// Indexed global binding storage.
    pub values: Vec<Value>,
    pub modules: Vec<Value>,
    pub main_module: Value,
    /// Saved (continuation, annotation) pairs for the restart/reset
    /// meta-handlers.
    pub krun: Vec<(Value, Value)>,
    /// struct-type → handler registry consulted by the default handler.
    pub default_handlers: HashMap<*mut Object, Value>,
    pub conditions: ConditionTable,
    /// Fallback bindings behind the stack-threaded dynamic chain.
    pub dynamic_base: Vec<(Value, Value)>,
    /// Fallback bindings behind the stack-threaded environ chain.
    pub environ_base: Vec<(Value, Value)>,
    /// Transient roots held across native re-entry into the VM.
    pub temp_roots: Vec<Value>,
    pub interactive: bool,
    start: Instant,
}

impl Runtime {
    pub fn new() -> Runtime {
        let mut rt = Runtime {
            heap: Heap::new(),
            thread: RtThread::new(),
            code: Vec::new(),
            constants: Vec::new(),
            values: Vec::new(),
            modules: Vec::new(),
            main_module: Value::Nil,
            krun: Vec::new(),
            default_handlers: HashMap::new(),
            conditions: ConditionTable::default(),
            dynamic_base: Vec::new(),
            environ_base: Vec::new(),
            temp_roots: Vec::new(),
            interactive: false,
            start: Instant::now(),
        };

        let name = rt.intern("calyx");
        let main = rt.make_module(name);
        rt.main_module = main;
        rt.thread.regs.module = main;

        rt.thread.regs.input = rt.alloc(
            ObjBody::Handle(Handle::new("*stdin*", Box::new(ConsoleOps::new(ConsoleStream::In)))),
            None,
        );
        rt.thread.regs.output = rt.alloc(
            ObjBody::Handle(Handle::new(
                "*stdout*",
                Box::new(ConsoleOps::new(ConsoleStream::Out)),
            )),
            None,
        );
        rt.thread.regs.error = rt.alloc(
            ObjBody::Handle(Handle::new(
                "*stderr*",
                Box::new(ConsoleOps::new(ConsoleStream::Err)),
            )),
            None,
        );

        condition::init(&mut rt);
        primitives::install(&mut rt);
        rt
    }

    pub fn alloc(&mut self, body: ObjBody, finalizer: Option<Finalizer>) -> Value {
        self.heap.alloc(body, finalizer)
    }

    pub fn intern(&mut self, name: &str) -> Value {
        self.heap.intern(name)
    }

    pub fn cons(&mut self, head: Value, tail: Value) -> Value {
        self.alloc(ObjBody::Pair(Pair { head, tail }), None)
    }

    pub fn make_string(&mut self, s: &str) -> Value {
        self.alloc(ObjBody::Str(RtString::from_str(s)), None)
    }

    pub fn make_frame(&mut self, parent: Value, slots: Vec<Value>) -> Value {
        self.alloc(ObjBody::Frame(Frame { parent, slots }), None)
    }

    pub fn make_hash(&mut self, fns: HashFns) -> Value {
        self.alloc(ObjBody::Hash(RtHash::new(fns)), None)
    }

    pub fn make_closure(&mut self, pc: usize, frame: Value, name: Value, docs: Value) -> Value {
        self.alloc(
            ObjBody::Closure(Closure {
                pc,
                frame,
                name,
                docs,
            }),
            None,
        )
    }

    pub fn make_module(&mut self, name: Value) -> Value {
        let m = self.alloc(ObjBody::Module(Module::new(name)), None);
        self.modules.push(m);
        m
    }

    pub fn find_module(&self, name: Value) -> Option<Value> {
        self.modules.iter().copied().find(|&m| {
            if let Value::Object(p) = m {
                unsafe {
                    if let ObjBody::Module(mb) = &(*p).body {
                        return mb.name == name;
                    }
                }
            }
            false
        })
    }

    pub fn make_struct_type(&mut self, name: Value, parent: Value, fields: Vec<Value>) -> Value {
        let inherited = unsafe { crate::struct_type::total_fields(parent) };
        let total = inherited + fields.len();
        self.alloc(
            ObjBody::StructType(StructType {
                name,
                parent,
                fields,
                total,
            }),
            None,
        )
    }

    /// Allocate an instance with every field nil, then fill the leading
    /// fields from `init`.
    pub fn make_struct_instance(&mut self, stype: Value, init: &[Value]) -> Value {
        let total = unsafe { crate::struct_type::total_fields(stype) };
        let mut fields = vec![Value::Nil; total];
        for (i, &v) in init.iter().enumerate().take(total) {
            fields[i] = v;
        }
        self.alloc(ObjBody::StructInstance(StructInstance { stype, fields }), None)
    }

    /// Normalize a wide integer: a fixnum immediate when it fits the
    /// tag-reduced range, else a bignum object.
    pub fn make_integer(&mut self, v: i128) -> Value {
        if v >= crate::value::FIXNUM_MIN as i128 && v <= crate::value::FIXNUM_MAX as i128 {
            Value::Fixnum(v as i64)
        } else {
            self.alloc(ObjBody::Bignum(crate::bignum::Bignum::new(v)), None)
        }
    }

    pub fn constants_extend(&mut self, v: Value) -> usize {
        self.constants.push(v);
        self.constants.len() - 1
    }

    pub fn constants_lookup_or_extend(&mut self, v: Value) -> usize {
        match self.constants.iter().position(|&c| c == v) {
            Some(at) => at,
            None => self.constants_extend(v),
        }
    }

    pub fn extend_values(&mut self, v: Value) -> usize {
        self.values.push(v);
        self.values.len() - 1
    }

    /// Bind `sym` in the main module to a fresh values-vector slot.
    pub fn define_global(&mut self, sym: Value, v: Value) -> usize {
        let gvi = self.extend_values(v);
        unsafe {
            crate::module::bind(self.main_module, sym, gvi);
            crate::module::export(self.main_module, sym);
        }
        gvi
    }

    /// Values-vector index of a name visible from the main module.
    pub fn global_index(&mut self, name: &str) -> Option<usize> {
        let sym = self.intern(name);
        unsafe { crate::module::resolve(self.main_module, sym) }
    }

    pub fn global_value(&mut self, name: &str) -> Option<Value> {
        let gvi = self.global_index(name)?;
        self.values.get(gvi).copied()
    }

    pub fn add_primitive(
        &mut self,
        name: &'static str,
        arity: u8,
        varargs: bool,
        docs: &'static str,
        func: PrimitiveFn,
    ) -> Value {
        let prim = self.alloc(
            ObjBody::Primitive(Primitive {
                func,
                arity,
                varargs,
                name,
                docs,
            }),
            None,
        );
        let sym = self.intern(name);
        self.define_global(sym, prim);
        prim
    }

    /// A computed variable's slot holds a (getter, setter) pair;
    /// dedicated opcodes resolve through it.
    pub fn add_computed(&mut self, name: &str, getter: Value, setter: Value) -> usize {
        let cell = self.cons(getter, setter);
        let sym = self.intern(name);
        self.define_global(sym, cell)
    }

    pub fn environ_base_get(&self, sym: Value) -> Option<Value> {
        self.environ_base
            .iter()
            .rev()
            .find(|(k, _)| *k == sym)
            .map(|(_, v)| *v)
    }

    pub fn environ_base_set(&mut self, sym: Value, v: Value) {
        if let Some(e) = self.environ_base.iter_mut().find(|(k, _)| *k == sym) {
            e.1 = v;
        } else {
            self.environ_base.push((sym, v));
        }
    }

    pub fn dynamic_base_get(&self, sym: Value) -> Option<Value> {
        self.dynamic_base
            .iter()
            .rev()
            .find(|(k, _)| *k == sym)
            .map(|(_, v)| *v)
    }

    pub fn dynamic_base_set(&mut self, sym: Value, v: Value) {
        if let Some(e) = self.dynamic_base.iter_mut().find(|(k, _)| *k == sym) {
            e.1 = v;
        } else {
            self.dynamic_base.push((sym, v));
        }
    }

    /// Write to the thread's current error handle, falling back to the
    /// process stderr when no handle is installed.
    pub fn write_error(&mut self, s: &str) {
        let h = self.thread.regs.error;
        if let Value::Object(p) = h {
            unsafe {
                if let ObjBody::Handle(handle) = &mut (*p).body {
                    let _ = handle.puts(s.as_bytes());
                    return;
                }
            }
        }
        eprint!("{}", s);
    }

    pub fn elapsed_seconds(&self) -> i64 {
        self.start.elapsed().as_secs() as i64
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
