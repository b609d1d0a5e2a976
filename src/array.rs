use crate::value::Value;

/// Growable array of references.  `elems.len()` is the capacity; slots in
/// `[used, capacity)` always hold nil.
pub struct RtArray {
    pub elems: Vec<Value>,
    pub used: usize,
}

impl RtArray {
    pub fn with_capacity(capacity: usize) -> RtArray {
        let capacity = capacity.max(1);
        RtArray {
            elems: vec![Value::Nil; capacity],
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.elems.len()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Resolve a possibly-negative index against used-size.  Negative
    /// indices count from the end; anything still negative after that is
    /// out of bounds.
    pub fn resolve_index(&self, index: i64) -> Option<usize> {
        if index < 0 {
            let index = index + self.used as i64;
            if index < 0 {
                return None;
            }
            return Some(index as usize);
        }
        Some(index as usize)
    }

    pub fn get(&self, index: i64) -> Option<Value> {
        let index = self.resolve_index(index)?;
        if index >= self.used {
            return None;
        }
        Some(self.elems[index])
    }

    fn grow(&mut self) {
        let ncap = self.capacity() * 2;
        self.elems.resize(ncap, Value::Nil);
    }

    /// Insert at `index`, growing by doubling when the index lands on
    /// capacity.  An index at or beyond twice the current capacity is a
    /// hard fault, as is an index past the negative end.
    pub fn insert(&mut self, index: i64, v: Value) {
        let index = match self.resolve_index(index) {
            Some(i) => i,
            None => panic!(
                "array insert: index {} is out of bounds ({})",
                index, self.used
            ),
        };
        if index >= self.capacity() {
            if index < self.capacity() * 2 {
                self.grow();
            } else {
                panic!(
                    "array insert: index {} is out of bounds ({})",
                    index,
                    self.capacity()
                );
            }
        }
        self.elems[index] = v;
        if index >= self.used {
            // intervening slots are already nil
            self.used = index + 1;
        }
    }

    pub fn push(&mut self, v: Value) {
        self.insert(self.used as i64, v);
    }

    pub fn pop(&mut self) -> Value {
        if self.used == 0 {
            return Value::Nil;
        }
        let v = self.elems[self.used - 1];
        self.elems[self.used - 1] = Value::Nil;
        self.used -= 1;
        v
    }

    /// Remove and return the first element, shuffling the rest down.
    pub fn shift(&mut self) -> Value {
        if self.used == 0 {
            return Value::Nil;
        }
        let v = self.elems[0];
        for i in 0..self.used - 1 {
            self.elems[i] = self.elems[i + 1];
        }
        self.elems[self.used - 1] = Value::Nil;
        self.used -= 1;
        v
    }

    /// Insert at the front, shuffling everything up.
    pub fn unshift(&mut self, v: Value) {
        let used = self.used;
        if used >= self.capacity() {
            self.grow();
        }
        let mut i = used;
        while i > 0 {
            self.elems[i] = self.elems[i - 1];
            i -= 1;
        }
        self.elems[0] = v;
        self.used = used + 1;
    }

    pub fn fill(&mut self, v: Value) {
        for i in 0..self.used {
            self.elems[i] = v;
        }
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.elems[..self.used]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_at_capacity_doubles() {
        let mut a = RtArray::with_capacity(4);
        for i in 0..5 {
            a.insert(i, Value::Fixnum(i));
        }
        assert_eq!(a.capacity(), 8);
        assert_eq!(a.used, 5);
        assert_eq!(a.get(4), Some(Value::Fixnum(4)));
        // slack holds nil
        for i in 5..8 {
            assert_eq!(a.elems[i], Value::Nil);
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn insert_far_past_capacity_faults() {
        let mut a = RtArray::with_capacity(4);
        a.insert(20, Value::True);
    }

    #[test]
    fn negative_indices_count_from_end() {
        let mut a = RtArray::with_capacity(4);
        a.push(Value::Fixnum(10));
        a.push(Value::Fixnum(20));
        a.push(Value::Fixnum(30));
        assert_eq!(a.get(-1), Some(Value::Fixnum(30)));
        assert_eq!(a.get(-3), Some(Value::Fixnum(10)));
        assert_eq!(a.resolve_index(-4), None);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn insert_past_negative_end_faults() {
        let mut a = RtArray::with_capacity(4);
        a.push(Value::Fixnum(1));
        a.insert(-2, Value::True);
    }

    #[test]
    fn insertion_past_used_extends_and_nils() {
        let mut a = RtArray::with_capacity(8);
        a.insert(3, Value::True);
        assert_eq!(a.used, 4);
        assert_eq!(a.get(0), Some(Value::Nil));
        assert_eq!(a.get(3), Some(Value::True));
    }

    #[test]
    fn push_pop_shift_unshift() {
        let mut a = RtArray::with_capacity(2);
        a.push(Value::Fixnum(1));
        a.push(Value::Fixnum(2));
        a.unshift(Value::Fixnum(0));
        assert_eq!(a.used, 3);
        assert_eq!(a.shift(), Value::Fixnum(0));
        assert_eq!(a.pop(), Value::Fixnum(2));
        assert_eq!(a.pop(), Value::Fixnum(1));
        assert_eq!(a.pop(), Value::Nil);
        assert!(a.is_empty());
    }

    #[test]
    fn used_never_exceeds_capacity() {
        let mut a = RtArray::with_capacity(1);
        for i in 0..64 {
            a.push(Value::Fixnum(i));
            assert!(a.used <= a.capacity());
        }
    }
}
