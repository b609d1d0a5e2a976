use std::borrow::Cow;

use crate::objects::object::{ObjBody, Object};
use crate::value::Value;

/// Immutable byte string.  The buffer carries a trailing NUL for foreign
/// interop; the logical length excludes it.
pub struct RtString {
    bytes: Vec<u8>,
}

impl RtString {
    pub fn from_str(s: &str) -> RtString {
        RtString::from_bytes(s.as_bytes().to_vec())
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> RtString {
        bytes.push(0);
        RtString { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    pub fn byte_capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.bytes())
    }
}

/// A view into a parent string's buffer.  The view lies wholly within
/// the parent; the parent is kept alive by the GC through this value.
pub struct Substring {
    pub parent: Value,
    pub offset: usize,
    pub len: usize,
}

impl Substring {
    /// Safety: `parent` must point to a live string object.
    pub unsafe fn bytes(&self) -> &[u8] {
        let p = match self.parent {
            Value::Object(p) => p,
            _ => return &[],
        };
        match &(*p).body {
            ObjBody::Str(s) => &s.bytes()[self.offset..self.offset + self.len],
            _ => &[],
        }
    }

    pub unsafe fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.bytes())
    }
}

/// Bytes of either string flavour, given its object pointer.
///
/// Safety: `p` must be a live string or substring object.
pub unsafe fn string_bytes<'a>(p: *mut Object) -> &'a [u8] {
    match &(*p).body {
        ObjBody::Str(s) => {
            let b = s.bytes();
            std::slice::from_raw_parts(b.as_ptr(), b.len())
        }
        ObjBody::Substring(ss) => {
            let b = ss.bytes();
            std::slice::from_raw_parts(b.as_ptr(), b.len())
        }
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object::Object;

    #[test]
    fn trailing_nul_is_not_part_of_length() {
        let s = RtString::from_str("hello");
        assert_eq!(s.len(), 5);
        assert_eq!(s.bytes(), b"hello");
        assert_eq!(s.as_str(), "hello");
    }

    #[test]
    fn substring_views_parent_buffer() {
        let parent = Box::into_raw(Box::new(Object::new(
            ObjBody::Str(RtString::from_str("hello world")),
            None,
        )));
        let ss = Substring {
            parent: Value::Object(parent),
            offset: 6,
            len: 5,
        };
        unsafe {
            assert_eq!(ss.bytes(), b"world");
            assert_eq!(ss.as_str(), "world");
            drop(Box::from_raw(parent));
        }
    }
}
