use std::collections::HashMap;

use crate::gc::GcStats;
use crate::objects::object::{Finalizer, ObjBody, Object, Symbol};
use crate::value::Value;

const INITIAL_THRESHOLD: usize = 64 * 1024;
const THRESHOLD_CEILING: usize = 64 * 1024 * 1024;
const THRESHOLD_SCALE: usize = 2;

/// Owns every heap object, the intern table, and the C-side root
/// registrations.  Collection itself lives in `gc`; the heap only
/// decides when a collection is wanted.
pub struct Heap {
    pub objects: Vec<*mut Object>,
    /// Bytes allocated since the last collection.
    pending: usize,
    threshold: usize,
    /// Set when pending crosses the threshold; the VM collects at the
    /// next opcode boundary.
    pub collect_requested: bool,
    protected: Vec<Value>,
    permanent: Vec<Value>,
    symbols: HashMap<Box<str>, Value>,
    next_symbol_id: u64,
    /// Tracing-pass generation, bumped per collection.
    pub gen: u64,
    pub stats: GcStats,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: Vec::new(),
            pending: 0,
            threshold: INITIAL_THRESHOLD,
            collect_requested: false,
            protected: Vec::new(),
            permanent: Vec::new(),
            symbols: HashMap::new(),
            next_symbol_id: 0,
            gen: 0,
            stats: GcStats::default(),
        }
    }

    /// Allocate a zero-initialized object of the given kind.  Crossing
    /// the pending-bytes threshold requests a collection at the next
    /// safe point.
    pub fn alloc(&mut self, body: ObjBody, finalizer: Option<Finalizer>) -> Value {
        let ptr = Box::into_raw(Box::new(Object::new(body, finalizer)));
        let size = unsafe { (*ptr).deep_size() };
        self.pending += size;
        if self.pending > self.threshold {
            self.collect_requested = true;
        }
        self.objects.push(ptr);
        Value::Object(ptr)
    }

    /// Symbols are unique by spelling: the same byte sequence always
    /// yields the same object.
    pub fn intern(&mut self, name: &str) -> Value {
        if let Some(&v) = self.symbols.get(name) {
            return v;
        }
        let id = self.next_symbol_id;
        self.next_symbol_id += 1;
        let v = self.alloc(
            ObjBody::Symbol(Symbol {
                name: name.into(),
                id,
            }),
            None,
        );
        self.symbols.insert(name.into(), v);
        v
    }

    /// Register a root on behalf of native code.
    pub fn protect(&mut self, v: Value) {
        self.protected.push(v);
    }

    /// Unregister one occurrence of a protected root.
    pub fn expose(&mut self, v: Value) {
        if let Some(at) = self.protected.iter().rposition(|&p| p == v) {
            self.protected.swap_remove(at);
        }
    }

    /// Register a root for the process lifetime.
    pub fn protect_auto(&mut self, v: Value) {
        self.permanent.push(v);
    }

    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.protected
            .iter()
            .chain(self.permanent.iter())
            .chain(self.symbols.values())
            .copied()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.objects.iter().map(|&p| unsafe { (*p).deep_size() }).sum()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Post-collection accounting: clear the pending counter and scale
    /// the trigger with the surviving bytes, up to a ceiling.
    pub fn after_collect(&mut self, surviving: usize) {
        self.pending = 0;
        self.collect_requested = false;
        self.threshold = (surviving * THRESHOLD_SCALE)
            .max(INITIAL_THRESHOLD)
            .min(THRESHOLD_CEILING);
        self.gen += 1;
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for &ptr in &self.objects {
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object::Pair;

    #[test]
    fn intern_is_unique_by_spelling() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn intern_round_trips_spelling() {
        let mut heap = Heap::new();
        let s = heap.intern("spell-check");
        assert_eq!(crate::value::as_string(s), "spell-check");
    }

    #[test]
    fn pending_bytes_request_collection() {
        let mut heap = Heap::new();
        assert!(!heap.collect_requested);
        while !heap.collect_requested {
            heap.alloc(
                ObjBody::Pair(Pair {
                    head: Value::Nil,
                    tail: Value::Nil,
                }),
                None,
            );
        }
        assert!(heap.live_bytes() > heap.threshold());
    }

    #[test]
    fn expose_removes_one_registration() {
        let mut heap = Heap::new();
        let v = heap.intern("root");
        heap.protect(v);
        heap.protect(v);
        heap.expose(v);
        assert_eq!(heap.roots().filter(|&r| r == v).count(), 2); // one protected + the symbol table
        heap.expose(v);
        assert_eq!(heap.roots().filter(|&r| r == v).count(), 1);
    }
}
