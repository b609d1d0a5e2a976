use std::fmt;

use crate::chunk::{read_uvarint, write_uvarint, CodeUnit, ConstSpec};
use crate::runtime::Runtime;
use crate::value::Value;

/// Container format for a compiled unit: magic, version, entry offset,
/// code section, typed constant records.  Private to this runtime —
/// compatibility with anything else is a non-goal.
const MAGIC: &[u8; 4] = b"CLYX";
const VERSION: u8 = 1;

const CONST_FIXNUM: u8 = 0;
const CONST_STR: u8 = 1;
const CONST_SYM: u8 = 2;
const CONST_CHAR: u8 = 3;
const CONST_NIL: u8 = 4;
const CONST_TRUE: u8 = 5;
const CONST_FALSE: u8 = 6;
const CONST_UNSPEC: u8 = 7;

#[derive(Debug)]
pub enum LoadError {
    BadMagic,
    BadVersion(u8),
    Truncated,
    BadConstTag(u8),
    BadUtf8,
    Io(std::io::Error),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::BadMagic => write!(f, "not a compiled unit (bad magic)"),
            LoadError::BadVersion(v) => write!(f, "unsupported unit version {}", v),
            LoadError::Truncated => write!(f, "compiled unit is truncated"),
            LoadError::BadConstTag(t) => write!(f, "unknown constant tag {}", t),
            LoadError::BadUtf8 => write!(f, "constant is not valid UTF-8"),
            LoadError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError::Io(e)
    }
}

pub fn serialize(unit: &CodeUnit) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    write_uvarint(&mut out, unit.entry as u64);
    write_uvarint(&mut out, unit.code.len() as u64);
    out.extend_from_slice(&unit.code);
    write_uvarint(&mut out, unit.constants.len() as u64);
    for c in &unit.constants {
        match c {
            ConstSpec::Fixnum(n) => {
                out.push(CONST_FIXNUM);
                // zigzag via the shared encoder
                crate::chunk::write_svarint(&mut out, *n);
            }
            ConstSpec::Str(s) => {
                out.push(CONST_STR);
                write_uvarint(&mut out, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            ConstSpec::Sym(s) => {
                out.push(CONST_SYM);
                write_uvarint(&mut out, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            ConstSpec::Char(ch) => {
                out.push(CONST_CHAR);
                write_uvarint(&mut out, *ch as u64);
            }
            ConstSpec::Nil => out.push(CONST_NIL),
            ConstSpec::True => out.push(CONST_TRUE),
            ConstSpec::False => out.push(CONST_FALSE),
            ConstSpec::Unspec => out.push(CONST_UNSPEC),
        }
    }
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, LoadError> {
        let b = *self.bytes.get(self.at).ok_or(LoadError::Truncated)?;
        self.at += 1;
        Ok(b)
    }

    fn uvarint(&mut self) -> Result<u64, LoadError> {
        // bounds-checked wrapper over the shared decoder
        let mut probe = self.at;
        loop {
            let b = *self.bytes.get(probe).ok_or(LoadError::Truncated)?;
            probe += 1;
            if b & 0x80 == 0 {
                break;
            }
        }
        let v = read_uvarint(self.bytes, &mut self.at);
        Ok(v)
    }

    fn svarint(&mut self) -> Result<i64, LoadError> {
        let z = self.uvarint()?;
        Ok(((z >> 1) as i64) ^ -((z & 1) as i64))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.at + n > self.bytes.len() {
            return Err(LoadError::Truncated);
        }
        let s = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(s)
    }
}

pub fn deserialize(bytes: &[u8]) -> Result<CodeUnit, LoadError> {
    let mut r = Reader { bytes, at: 0 };
    if r.take(4)? != MAGIC {
        return Err(LoadError::BadMagic);
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(LoadError::BadVersion(version));
    }
    let entry = r.uvarint()? as usize;
    let code_len = r.uvarint()? as usize;
    let code = r.take(code_len)?.to_vec();
    let nconsts = r.uvarint()? as usize;
    let mut constants = Vec::with_capacity(nconsts);
    for _ in 0..nconsts {
        let tag = r.u8()?;
        constants.push(match tag {
            CONST_FIXNUM => ConstSpec::Fixnum(r.svarint()?),
            CONST_STR | CONST_SYM => {
                let len = r.uvarint()? as usize;
                let s = std::str::from_utf8(r.take(len)?)
                    .map_err(|_| LoadError::BadUtf8)?
                    .to_string();
                if tag == CONST_STR {
                    ConstSpec::Str(s)
                } else {
                    ConstSpec::Sym(s)
                }
            }
            CONST_CHAR => {
                let u = r.uvarint()? as u32;
                ConstSpec::Char(char::from_u32(u).ok_or(LoadError::BadConstTag(tag))?)
            }
            CONST_NIL => ConstSpec::Nil,
            CONST_TRUE => ConstSpec::True,
            CONST_FALSE => ConstSpec::False,
            CONST_UNSPEC => ConstSpec::Unspec,
            other => return Err(LoadError::BadConstTag(other)),
        });
    }
    Ok(CodeUnit {
        code,
        constants,
        entry,
    })
}

/// Append a unit to the runtime's grow-only code and constants and
/// return the absolute entry offset.  Constant operands in the code are
/// absolute: the compiler emits them against the pool it is extending.
pub fn install(rt: &mut Runtime, unit: &CodeUnit) -> usize {
    let code_base = rt.code.len();
    rt.code.extend_from_slice(&unit.code);
    for c in &unit.constants {
        let v = match c {
            ConstSpec::Fixnum(n) => Value::Fixnum(*n),
            ConstSpec::Str(s) => rt.make_string(s),
            ConstSpec::Sym(s) => rt.intern(s),
            ConstSpec::Char(ch) => Value::Char(*ch),
            ConstSpec::Nil => Value::Nil,
            ConstSpec::True => Value::True,
            ConstSpec::False => Value::False,
            ConstSpec::Unspec => Value::Unspec,
        };
        rt.constants_extend(v);
    }
    #[cfg(feature = "debug_print_code")]
    crate::debug::disassemble_code(&rt.code[code_base..], &rt.constants, "unit");
    code_base + unit.entry
}

pub fn load_bytes(rt: &mut Runtime, bytes: &[u8]) -> Result<usize, LoadError> {
    let unit = deserialize(bytes)?;
    Ok(install(rt, &unit))
}

pub fn load_file(rt: &mut Runtime, path: &str) -> Result<usize, LoadError> {
    let bytes = std::fs::read(path)?;
    load_bytes(rt, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Opcode;
    use crate::vm;

    #[test]
    fn serialize_deserialize_round_trip() {
        let mut u = CodeUnit::new();
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(-7);
        u.write_op(Opcode::Finish);
        u.add_constant(ConstSpec::Str("hello".to_string()));
        u.add_constant(ConstSpec::Sym("sym".to_string()));
        u.add_constant(ConstSpec::Fixnum(-123));
        u.add_constant(ConstSpec::Char('x'));
        u.add_constant(ConstSpec::Nil);
        u.entry = 0;

        let bytes = serialize(&u);
        let back = deserialize(&bytes).unwrap();
        assert_eq!(back.code, u.code);
        assert_eq!(back.constants, u.constants);
        assert_eq!(back.entry, 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(matches!(
            deserialize(b"NOPE\x01\x00"),
            Err(LoadError::BadMagic)
        ));
    }

    #[test]
    fn truncated_units_are_rejected() {
        let mut u = CodeUnit::new();
        u.write_op(Opcode::Finish);
        let bytes = serialize(&u);
        assert!(matches!(
            deserialize(&bytes[..bytes.len() - 1]),
            Err(LoadError::Truncated)
        ));
    }

    #[test]
    fn loaded_unit_runs() {
        let mut rt = Runtime::new();
        let mut u = CodeUnit::new();
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(41);
        u.write_op(Opcode::Finish);
        let bytes = serialize(&u);
        let entry = load_bytes(&mut rt, &bytes).unwrap();
        let v = vm::run_at(&mut rt, entry).ok().unwrap();
        assert_eq!(v, Value::Fixnum(41));
    }
}
