use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::condition::VmResult;
use crate::objects::object::{ObjBody, Object};
use crate::runtime::Runtime;
use crate::strings::string_bytes;
use crate::value::{values_equal, Value};
use crate::vm;

const INITIAL_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSlot {
    Empty,
    /// Deleted-slot marker; probing continues across it.
    Tombstone,
    Live(Value, Value),
}

/// Key discipline: identity (pointer equality, address hashing — the
/// default), structural, or a user-supplied (hash, eq) pair of callables
/// invoked through the VM.
#[derive(Debug, Clone, Copy)]
pub enum HashFns {
    Identity,
    Equal,
    Custom { hashf: Value, eqf: Value },
}

/// Open-addressed table with linear probing and tombstone deletion.
pub struct RtHash {
    pub slots: Vec<HashSlot>,
    pub count: usize,
    pub tombstones: usize,
    pub fns: HashFns,
}

impl RtHash {
    pub fn new(fns: HashFns) -> RtHash {
        RtHash {
            slots: vec![HashSlot::Empty; INITIAL_SLOTS],
            count: 0,
            tombstones: 0,
            fns,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn slot_bytes(&self) -> usize {
        self.slots.capacity() * std::mem::size_of::<HashSlot>()
    }

    /// Iteration order is unspecified and unstable across insertions.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.slots.iter().filter_map(|s| match s {
            HashSlot::Live(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

    fn needs_grow(&self) -> bool {
        (self.count + self.tombstones + 1) * 10 > self.slots.len() * 7
    }

    fn needs_compact(&self) -> bool {
        self.tombstones * 4 > self.slots.len()
    }
}

pub fn identity_hash(v: Value) -> u64 {
    let mut h = DefaultHasher::new();
    v.hash(&mut h);
    h.finish()
}

/// Structural hash, depth-limited so cyclic graphs terminate; anything
/// past the limit falls back to a constant, which is safe (equal values
/// must agree, unequal values may collide).
pub fn structural_hash(v: Value) -> u64 {
    structural_hash_depth(v, 4)
}

fn structural_hash_depth(v: Value, depth: usize) -> u64 {
    let mut h = DefaultHasher::new();
    match v {
        Value::Object(p) => unsafe {
            match &(*p).body {
                ObjBody::Str(_) | ObjBody::Substring(_) => {
                    string_bytes(p).hash(&mut h);
                }
                ObjBody::Symbol(s) => s.id.hash(&mut h),
                ObjBody::Bignum(b) => b.value.hash(&mut h),
                ObjBody::Pair(pr) => {
                    if depth == 0 {
                        0u8.hash(&mut h);
                    } else {
                        structural_hash_depth(pr.head, depth - 1).hash(&mut h);
                        structural_hash_depth(pr.tail, depth - 1).hash(&mut h);
                    }
                }
                ObjBody::Array(a) => {
                    a.used.hash(&mut h);
                    if depth > 0 {
                        for &e in a.as_slice().iter().take(4) {
                            structural_hash_depth(e, depth - 1).hash(&mut h);
                        }
                    }
                }
                _ => v.hash(&mut h),
            }
        },
        _ => v.hash(&mut h),
    }
    h.finish()
}

fn fixnum_of(v: Value) -> u64 {
    match v {
        Value::Fixnum(n) => n as u64,
        other => identity_hash(other),
    }
}

pub fn key_hash(rt: &mut Runtime, fns: &HashFns, key: Value) -> VmResult<u64> {
    match fns {
        HashFns::Identity => Ok(identity_hash(key)),
        HashFns::Equal => Ok(structural_hash(key)),
        HashFns::Custom { hashf, .. } => {
            let r = vm::call_value(rt, *hashf, &[key])?;
            Ok(fixnum_of(r))
        }
    }
}

pub fn key_eq(rt: &mut Runtime, fns: &HashFns, a: Value, b: Value) -> VmResult<bool> {
    match fns {
        HashFns::Identity => Ok(a == b),
        HashFns::Equal => Ok(values_equal(a, b)),
        HashFns::Custom { eqf, .. } => {
            let r = vm::call_value(rt, *eqf, &[a, b])?;
            Ok(crate::value::is_truthy(r))
        }
    }
}

/// Safety: `p` must be a live hash object.
unsafe fn hash_mut<'a>(p: *mut Object) -> &'a mut RtHash {
    match &mut (*p).body {
        ObjBody::Hash(h) => &mut *(h as *mut RtHash),
        _ => unreachable!("hash op on non-hash object"),
    }
}

unsafe fn rehash(rt: &mut Runtime, p: *mut Object, new_len: usize) -> VmResult<()> {
    let live: Vec<(Value, Value)> = hash_mut(p).iter().collect();
    let fns = hash_mut(p).fns;
    {
        let h = hash_mut(p);
        h.slots = vec![HashSlot::Empty; new_len];
        h.count = 0;
        h.tombstones = 0;
    }
    for (k, v) in live {
        insert_no_grow(rt, p, &fns, k, v)?;
    }
    Ok(())
}

unsafe fn insert_no_grow(
    rt: &mut Runtime,
    p: *mut Object,
    fns: &HashFns,
    key: Value,
    val: Value,
) -> VmResult<()> {
    let hash = key_hash(rt, fns, key)?;
    let len = hash_mut(p).slots.len();
    let mask = len - 1;
    let mut i = (hash as usize) & mask;
    let mut first_tombstone: Option<usize> = None;
    loop {
        match hash_mut(p).slots[i] {
            HashSlot::Empty => {
                let at = first_tombstone.unwrap_or(i);
                let h = hash_mut(p);
                if matches!(h.slots[at], HashSlot::Tombstone) {
                    h.tombstones -= 1;
                }
                h.slots[at] = HashSlot::Live(key, val);
                h.count += 1;
                return Ok(());
            }
            HashSlot::Tombstone => {
                if first_tombstone.is_none() {
                    first_tombstone = Some(i);
                }
            }
            HashSlot::Live(k, _) => {
                if key_eq(rt, fns, k, key)? {
                    hash_mut(p).slots[i] = HashSlot::Live(k, val);
                    return Ok(());
                }
            }
        }
        i = (i + 1) & mask;
    }
}

pub fn hash_put(rt: &mut Runtime, p: *mut Object, key: Value, val: Value) -> VmResult<()> {
    unsafe {
        let fns = hash_mut(p).fns;
        if hash_mut(p).needs_grow() {
            let target = (hash_mut(p).count * 2).max(INITIAL_SLOTS).next_power_of_two();
            let target = target.max(hash_mut(p).slots.len() * 2);
            rehash(rt, p, target)?;
        }
        insert_no_grow(rt, p, &fns, key, val)
    }
}

pub fn hash_get(rt: &mut Runtime, p: *mut Object, key: Value) -> VmResult<Option<Value>> {
    unsafe {
        let fns = hash_mut(p).fns;
        let hash = key_hash(rt, &fns, key)?;
        let mask = hash_mut(p).slots.len() - 1;
        let mut i = (hash as usize) & mask;
        loop {
            match hash_mut(p).slots[i] {
                HashSlot::Empty => return Ok(None),
                HashSlot::Tombstone => {}
                HashSlot::Live(k, v) => {
                    if key_eq(rt, &fns, k, key)? {
                        return Ok(Some(v));
                    }
                }
            }
            i = (i + 1) & mask;
        }
    }
}

pub fn hash_delete(rt: &mut Runtime, p: *mut Object, key: Value) -> VmResult<Option<Value>> {
    unsafe {
        let fns = hash_mut(p).fns;
        let hash = key_hash(rt, &fns, key)?;
        let mask = hash_mut(p).slots.len() - 1;
        let mut i = (hash as usize) & mask;
        let removed = loop {
            match hash_mut(p).slots[i] {
                HashSlot::Empty => break None,
                HashSlot::Tombstone => {}
                HashSlot::Live(k, v) => {
                    if key_eq(rt, &fns, k, key)? {
                        let h = hash_mut(p);
                        h.slots[i] = HashSlot::Tombstone;
                        h.count -= 1;
                        h.tombstones += 1;
                        break Some(v);
                    }
                }
            }
            i = (i + 1) & mask;
        };
        if removed.is_some() && hash_mut(p).needs_compact() {
            let len = hash_mut(p).slots.len();
            rehash(rt, p, len)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn new_hash(rt: &mut Runtime, fns: HashFns) -> *mut Object {
        let v = rt.alloc(ObjBody::Hash(RtHash::new(fns)), None);
        match v {
            Value::Object(p) => p,
            _ => unreachable!(),
        }
    }

    #[test]
    fn put_get_delete_identity() {
        let mut rt = Runtime::new();
        let h = new_hash(&mut rt, HashFns::Identity);
        for i in 0..100 {
            hash_put(&mut rt, h, Value::Fixnum(i), Value::Fixnum(i * 10)).unwrap();
        }
        for i in 0..100 {
            assert_eq!(
                hash_get(&mut rt, h, Value::Fixnum(i)).unwrap(),
                Some(Value::Fixnum(i * 10))
            );
        }
        assert_eq!(unsafe { hash_mut(h).count }, 100);
        assert_eq!(
            hash_delete(&mut rt, h, Value::Fixnum(3)).unwrap(),
            Some(Value::Fixnum(30))
        );
        assert_eq!(hash_get(&mut rt, h, Value::Fixnum(3)).unwrap(), None);
        assert_eq!(unsafe { hash_mut(h).count }, 99);
    }

    #[test]
    fn overwrite_keeps_count() {
        let mut rt = Runtime::new();
        let h = new_hash(&mut rt, HashFns::Identity);
        hash_put(&mut rt, h, Value::Fixnum(1), Value::True).unwrap();
        hash_put(&mut rt, h, Value::Fixnum(1), Value::False).unwrap();
        assert_eq!(unsafe { hash_mut(h).count }, 1);
        assert_eq!(
            hash_get(&mut rt, h, Value::Fixnum(1)).unwrap(),
            Some(Value::False)
        );
    }

    #[test]
    fn tombstones_trigger_compaction() {
        let mut rt = Runtime::new();
        let h = new_hash(&mut rt, HashFns::Identity);
        for i in 0..64 {
            hash_put(&mut rt, h, Value::Fixnum(i), Value::True).unwrap();
        }
        for i in 0..48 {
            hash_delete(&mut rt, h, Value::Fixnum(i)).unwrap();
        }
        let (count, tombstones, len) = unsafe {
            let hm = hash_mut(h);
            (hm.count, hm.tombstones, hm.slots.len())
        };
        assert_eq!(count, 16);
        assert!(tombstones * 4 <= len);
        for i in 48..64 {
            assert!(hash_get(&mut rt, h, Value::Fixnum(i)).unwrap().is_some());
        }
    }

    #[test]
    fn structural_keys_match_equal_strings() {
        let mut rt = Runtime::new();
        let h = new_hash(&mut rt, HashFns::Equal);
        let k1 = rt.make_string("key");
        let k2 = rt.make_string("key");
        assert_ne!(k1, k2);
        hash_put(&mut rt, h, k1, Value::Fixnum(1)).unwrap();
        assert_eq!(
            hash_get(&mut rt, h, k2).unwrap(),
            Some(Value::Fixnum(1))
        );
    }

    #[test]
    fn slots_stay_power_of_two() {
        let mut rt = Runtime::new();
        let h = new_hash(&mut rt, HashFns::Identity);
        for i in 0..1000 {
            hash_put(&mut rt, h, Value::Fixnum(i), Value::Nil).unwrap();
        }
        let len = unsafe { hash_mut(h).slots.len() };
        assert!(len.is_power_of_two());
        assert!(len * 7 >= 1000 * 10 / 2); // load factor respected on the way up
    }
}
