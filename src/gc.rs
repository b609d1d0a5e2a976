use crate::hash::HashFns;
use crate::objects::object::{Color, ObjBody, Object, ObjectKind};
use crate::runtime::Runtime;
use crate::value::Value;

/// Aggregated GC statistics.
#[derive(Default, Debug, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GcStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace {
    ($($arg:tt)*) => {};
}
pub(crate) use gc_trace;

/// The marking half of the collector: an explicit grey worklist over
/// the colored object headers.
struct Marker {
    grey: Vec<*mut Object>,
    pass: u64,
}

impl Marker {
    fn new(pass: u64) -> Marker {
        Marker {
            grey: Vec::new(),
            pass,
        }
    }

    fn mark_value(&mut self, v: Value) {
        if let Value::Object(p) = v {
            self.mark_object(p);
        }
    }

    fn mark_object(&mut self, p: *mut Object) {
        if p.is_null() {
            return;
        }
        unsafe {
            if (*p).header.color == Color::White {
                (*p).header.color = Color::Grey;
                (*p).header.gen = self.pass;
                self.grey.push(p);
                gc_trace!("mark enqueue grey ptr={:p} kind={}", p, (*p).kind());
            }
        }
    }

    fn trace(&mut self) {
        while let Some(p) = self.grey.pop() {
            unsafe {
                (*p).header.color = Color::Black;
                self.blacken(p);
            }
        }
    }

    unsafe fn blacken(&mut self, p: *mut Object) {
        match &(*p).body {
            ObjBody::Pair(pr) => {
                self.mark_value(pr.head);
                self.mark_value(pr.tail);
            }
            ObjBody::Array(a) => {
                for &e in a.as_slice() {
                    self.mark_value(e);
                }
            }
            ObjBody::Hash(h) => {
                for (k, v) in h.iter() {
                    self.mark_value(k);
                    self.mark_value(v);
                }
                if let HashFns::Custom { hashf, eqf } = h.fns {
                    self.mark_value(hashf);
                    self.mark_value(eqf);
                }
            }
            ObjBody::Str(_) => {}
            ObjBody::Substring(ss) => self.mark_value(ss.parent),
            ObjBody::Symbol(_) => {}
            ObjBody::Closure(c) => {
                self.mark_value(c.frame);
                self.mark_value(c.name);
                self.mark_value(c.docs);
            }
            ObjBody::Primitive(_) => {}
            ObjBody::Continuation(k) => {
                for &v in &k.stack {
                    self.mark_value(v);
                }
                self.mark_value(k.regs.val);
                self.mark_value(k.regs.func);
                self.mark_value(k.regs.reg1);
                self.mark_value(k.regs.reg2);
                self.mark_value(k.regs.frame);
                self.mark_value(k.regs.module);
                self.mark_value(k.regs.input);
                self.mark_value(k.regs.output);
                self.mark_value(k.regs.error);
            }
            ObjBody::Frame(f) => {
                self.mark_value(f.parent);
                for &s in &f.slots {
                    self.mark_value(s);
                }
            }
            ObjBody::StructType(st) => {
                self.mark_value(st.name);
                self.mark_value(st.parent);
                for &f in &st.fields {
                    self.mark_value(f);
                }
            }
            ObjBody::StructInstance(si) => {
                self.mark_value(si.stype);
                for &f in &si.fields {
                    self.mark_value(f);
                }
            }
            ObjBody::Handle(_) => {}
            ObjBody::Module(m) => {
                self.mark_value(m.name);
                for &e in &m.exports {
                    self.mark_value(e);
                }
                for &i in &m.imports {
                    self.mark_value(i);
                }
                for (&sym, _) in m.bindings.iter() {
                    self.mark_object(sym);
                }
            }
            ObjBody::Bitset(_) => {}
            ObjBody::Bignum(_) => {}
            ObjBody::CPointer(_) => {}
            ObjBody::Freed => {}
        }
    }
}

unsafe fn free_object(p: *mut Object) {
    // Debug builds scribble a sentinel over the object so a stale
    // reference trips a visible kind check rather than silent reuse.
    #[cfg(debug_assertions)]
    {
        (*p).body = ObjBody::Freed;
        (*p).header.kind = ObjectKind::Freed;
    }
    #[cfg(not(debug_assertions))]
    let _ = ObjectKind::Freed;
    drop(Box::from_raw(p));
}

/// Full stop-the-world mark-and-sweep.
///
/// Phases: whiten everything, push roots grey, trace until the grey
/// list drains, then sweep the all-objects chain.  A white object with
/// a finalizer is scheduled and preserved black for this cycle; its
/// finalizer is consumed, so the next cycle frees it.  Finalizers run
/// after the sweep, oldest allocation first, and may not allocate.
pub fn collect(rt: &mut Runtime) {
    let pass = rt.heap.gen + 1;
    gc_trace!("collect pass={} objects={}", pass, rt.heap.object_count());

    // Phase 1: all white, grey list empty.
    for &p in rt.heap.objects.iter() {
        unsafe {
            (*p).header.color = Color::White;
        }
    }

    // Phase 2: roots.
    let mut m = Marker::new(pass);
    for &v in rt.thread.stack.iter() {
        m.mark_value(v);
    }
    let regs = &rt.thread.regs;
    for v in [
        regs.val,
        regs.func,
        regs.reg1,
        regs.reg2,
        regs.frame,
        regs.module,
        regs.input,
        regs.output,
        regs.error,
    ] {
        m.mark_value(v);
    }
    for v in rt.heap.roots() {
        m.mark_value(v);
    }
    for &v in rt.constants.iter() {
        m.mark_value(v);
    }
    for &v in rt.values.iter() {
        m.mark_value(v);
    }
    for &v in rt.modules.iter() {
        m.mark_value(v);
    }
    for &(k, ann) in rt.krun.iter() {
        m.mark_value(k);
        m.mark_value(ann);
    }
    for (&ct, &handler) in rt.default_handlers.iter() {
        m.mark_object(ct);
        m.mark_value(handler);
    }
    for &(k, v) in rt.dynamic_base.iter().chain(rt.environ_base.iter()) {
        m.mark_value(k);
        m.mark_value(v);
    }
    for &v in rt.temp_roots.iter() {
        m.mark_value(v);
    }

    // Phase 3.
    m.trace();

    // Phase 4: sweep.
    let objects = std::mem::take(&mut rt.heap.objects);
    let before: usize = objects.iter().map(|&p| unsafe { (*p).deep_size() }).sum();
    let mut survivors = Vec::with_capacity(objects.len());
    let mut to_finalize: Vec<*mut Object> = Vec::new();
    let mut freed = 0usize;
    let mut live = 0usize;
    for p in objects {
        unsafe {
            if (*p).header.color == Color::White {
                if (*p).header.finalizer.is_some() {
                    (*p).header.color = Color::Black;
                    live += (*p).deep_size();
                    to_finalize.push(p);
                    survivors.push(p);
                } else {
                    freed += (*p).deep_size();
                    free_object(p);
                }
            } else {
                live += (*p).deep_size();
                survivors.push(p);
            }
        }
    }
    rt.heap.objects = survivors;

    // Finalizers, allocation order; consuming the slot means the next
    // cycle frees the object.
    for p in to_finalize {
        unsafe {
            if let Some(f) = (*p).header.finalizer.take() {
                gc_trace!("finalize ptr={:p}", p);
                f.run(&mut *p);
            }
        }
    }

    rt.heap.after_collect(live);
    let next = rt.heap.threshold();
    rt.heap.stats.record(before, freed, live, next);
    gc_trace!(
        "cycle={} freed={} live={} next_trigger={}",
        rt.heap.stats.cycles,
        freed,
        live,
        next
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Handle, StringOutputOps};
    use crate::objects::object::{Finalizer, Pair};

    #[test]
    fn collects_unreachable_objects() {
        let mut rt = Runtime::new();
        let baseline = rt.heap.object_count();
        for _ in 0..10_000 {
            rt.alloc(
                ObjBody::Pair(Pair {
                    head: Value::Nil,
                    tail: Value::Nil,
                }),
                None,
            );
        }
        assert_eq!(rt.heap.object_count(), baseline + 10_000);
        collect(&mut rt);
        assert_eq!(rt.heap.object_count(), baseline);
    }

    #[test]
    fn protected_roots_survive() {
        let mut rt = Runtime::new();
        let keep = rt.cons(Value::Fixnum(1), Value::Nil);
        rt.heap.protect(keep);
        let _drop = rt.cons(Value::Fixnum(2), Value::Nil);
        let baseline = rt.heap.object_count();
        collect(&mut rt);
        assert_eq!(rt.heap.object_count(), baseline - 1);
        // the kept pair is intact
        if let Value::Object(p) = keep {
            unsafe {
                match &(*p).body {
                    ObjBody::Pair(pr) => assert_eq!(pr.head, Value::Fixnum(1)),
                    _ => panic!("kept object was corrupted"),
                }
            }
        }
        rt.heap.expose(keep);
    }

    #[test]
    fn marking_traverses_pair_chains() {
        let mut rt = Runtime::new();
        let mut list = Value::Nil;
        for i in 0..100 {
            list = rt.cons(Value::Fixnum(i), list);
        }
        rt.heap.protect(list);
        let count = rt.heap.object_count();
        collect(&mut rt);
        assert_eq!(rt.heap.object_count(), count);
        rt.heap.expose(list);
    }

    #[test]
    fn cyclic_graphs_are_collected() {
        let mut rt = Runtime::new();
        let a = rt.cons(Value::Nil, Value::Nil);
        let b = rt.cons(a, Value::Nil);
        unsafe {
            if let Value::Object(pa) = a {
                if let ObjBody::Pair(pr) = &mut (*pa).body {
                    pr.tail = b;
                }
            }
        }
        let baseline = rt.heap.object_count();
        collect(&mut rt);
        assert_eq!(rt.heap.object_count(), baseline - 2);
    }

    #[test]
    fn finalizable_objects_get_one_grace_cycle() {
        let mut rt = Runtime::new();
        let h = rt.alloc(
            ObjBody::Handle(Handle::new("scratch", Box::new(StringOutputOps::new()))),
            Some(Finalizer::CloseHandle),
        );
        let baseline = rt.heap.object_count();
        collect(&mut rt);
        // preserved this cycle, finalizer has run (handle closed)
        assert_eq!(rt.heap.object_count(), baseline);
        if let Value::Object(p) = h {
            unsafe {
                match &(*p).body {
                    ObjBody::Handle(handle) => assert!(handle.is_closed()),
                    _ => panic!("handle was freed early"),
                }
            }
        }
        collect(&mut rt);
        assert_eq!(rt.heap.object_count(), baseline - 1);
    }

    #[test]
    fn stats_record_cycles() {
        let mut rt = Runtime::new();
        let cycles = rt.heap.stats.cycles;
        collect(&mut rt);
        assert_eq!(rt.heap.stats.cycles, cycles + 1);
        assert!(rt.heap.stats.last_next_trigger_bytes > 0);
    }

    #[test]
    fn bytes_return_to_baseline_after_collect() {
        let mut rt = Runtime::new();
        collect(&mut rt);
        let baseline = rt.heap.live_bytes();
        for _ in 0..10_000 {
            rt.alloc(
                ObjBody::Pair(Pair {
                    head: Value::Nil,
                    tail: Value::Nil,
                }),
                None,
            );
        }
        assert!(rt.heap.live_bytes() > baseline);
        collect(&mut rt);
        assert_eq!(rt.heap.live_bytes(), baseline);
    }
}
