use crate::chunk::{read_svarint, read_uvarint, Opcode};
use crate::value::{as_string, Value};

#[allow(dead_code)]
pub fn disassemble_code(code: &[u8], constants: &[Value], name: &str) {
    eprintln!("== {} ==", name);

    let mut offset = 0;
    while offset < code.len() {
        offset = disassemble_instruction(code, constants, offset);
    }
}

pub fn disassemble_instruction(code: &[u8], constants: &[Value], offset: usize) -> usize {
    eprint!("{:08} ", offset);

    let op = match Opcode::from_repr(code[offset]) {
        Some(op) => op,
        None => {
            eprintln!("Unknown opcode {}", code[offset]);
            return offset + 1;
        }
    };
    let mut pc = offset + 1;

    match op {
        Opcode::Constant | Opcode::PushDynamic | Opcode::DynamicRef | Opcode::PushEnviron
        | Opcode::EnvironRef => {
            let u = read_uvarint(code, &mut pc);
            let noted = constants
                .get(u as usize)
                .map(|v| as_string(*v))
                .unwrap_or_default();
            eprintln!("{:<24} {:>4} '{}'", op, u, noted);
        }
        Opcode::GlobalRef | Opcode::ComputedRef | Opcode::ComputedSet => {
            let gvi = read_uvarint(code, &mut pc);
            let ci = read_uvarint(code, &mut pc);
            let noted = constants
                .get(ci as usize)
                .map(|v| as_string(*v))
                .unwrap_or_default();
            eprintln!("{:<24} {:>4} '{}'", op, gvi, noted);
        }
        Opcode::FixnumImm => {
            let s = read_svarint(code, &mut pc);
            eprintln!("{:<24} {:>4}", op, s);
        }
        Opcode::GlobalSet
        | Opcode::CharImm
        | Opcode::ShallowRef
        | Opcode::ShallowSet
        | Opcode::AllocFrame
        | Opcode::PopFrameSlot
        | Opcode::ExtendFrame
        | Opcode::FunctionInvoke
        | Opcode::FunctionGoto
        | Opcode::ArityEq
        | Opcode::ArityGe => {
            let u = read_uvarint(code, &mut pc);
            eprintln!("{:<24} {:>4}", op, u);
        }
        Opcode::DeepRef | Opcode::DeepSet => {
            let depth = read_uvarint(code, &mut pc);
            let slot = read_uvarint(code, &mut pc);
            eprintln!("{:<24} {:>4} {:>4}", op, depth, slot);
        }
        Opcode::CreateClosure => {
            let len = read_uvarint(code, &mut pc);
            let name_ci = read_uvarint(code, &mut pc);
            let _docs_ci = read_uvarint(code, &mut pc);
            let noted = constants
                .get(name_ci as usize)
                .map(|v| as_string(*v))
                .unwrap_or_default();
            eprintln!("{:<24} body {} '{}'", op, len, noted);
        }
        Opcode::Goto | Opcode::BranchFalse | Opcode::BranchNil | Opcode::CaptureContinuation => {
            let s = read_svarint(code, &mut pc);
            let target = (pc as i64 + s) as usize;
            eprintln!("{:<24} {:>4} -> {}", op, s, target);
        }
        _ => {
            eprintln!("{}", op);
        }
    }
    pc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{write_svarint, write_uvarint};

    #[test]
    fn operand_widths_advance_the_offset() {
        let mut code = vec![Opcode::Constant as u8];
        write_uvarint(&mut code, 300);
        code.push(Opcode::Goto as u8);
        write_svarint(&mut code, -5);
        code.push(Opcode::Return as u8);

        let constants = [Value::Fixnum(1)];
        let mut offset = 0;
        offset = disassemble_instruction(&code, &constants, offset);
        offset = disassemble_instruction(&code, &constants, offset);
        offset = disassemble_instruction(&code, &constants, offset);
        assert_eq!(offset, code.len());
    }
}
