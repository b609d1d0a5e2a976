use crate::chunk::{read_svarint, read_uvarint, Opcode};
use crate::condition::{self, RaisedCondition, Unwind, VmResult};
use crate::gc;
use crate::objects::object::{Continuation, ObjBody, Object};
use crate::runtime::Runtime;
use crate::signals;
use crate::struct_type::instance_set_direct;
use crate::value::{as_fixnum, is_truthy, Value};

/// Return-record PC marking the bottom of a native re-entry; popping it
/// ends the nested dispatch loop.
const RETURN_SENTINEL: i64 = -1;

/// Beyond this the VM raises rather than letting the stack grow without
/// bound.
const STACK_LIMIT: usize = 1 << 16;

enum Flow {
    Continue,
    Finished,
    SentinelReturn,
}

/// Run from the thread's current PC until the unit finishes.
pub fn run(rt: &mut Runtime) -> VmResult<Value> {
    execute(rt, false)
}

pub fn run_at(rt: &mut Runtime, entry: usize) -> VmResult<Value> {
    rt.thread.regs.pc = entry;
    run(rt)
}

/// The dispatch loop.  The top-level loop absorbs continuation
/// restores; nested loops (native re-entry) propagate them so the Rust
/// call stack unwinds back here first.
fn execute(rt: &mut Runtime, nested: bool) -> VmResult<Value> {
    loop {
        match step(rt) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Finished) => return Ok(rt.thread.regs.val),
            Ok(Flow::SentinelReturn) => {
                if nested {
                    return Ok(rt.thread.regs.val);
                }
                return Err(Unwind::Fatal("return past the top of the stack".to_string()));
            }
            Err(Unwind::Raise(rc)) => {
                match condition::raise_condition(rt, rc.continuable, rc.condition) {
                    Ok(v) => rt.thread.regs.val = v,
                    Err(Unwind::Restore) if !nested => {}
                    Err(e) => return Err(e),
                }
            }
            Err(Unwind::Restore) if !nested => {}
            Err(e) => return Err(e),
        }
    }
}

/// One opcode, preceded by the safe point: a requested collection runs
/// here, pending signals raise here, never mid-opcode.
fn step(rt: &mut Runtime) -> VmResult<Flow> {
    if rt.heap.collect_requested {
        gc::collect(rt);
    }
    if let Some(sig) = signals::poll() {
        let ct = rt.conditions.rt_signal;
        let c = condition::make_condition(rt, ct, &[Value::Fixnum(sig as i64)]);
        return Err(Unwind::Raise(RaisedCondition {
            continuable: true,
            condition: c,
        }));
    }
    if rt.thread.stack.len() > STACK_LIMIT {
        let ct = rt.conditions.runtime_error;
        return Err(condition::error_unwind(
            rt,
            ct,
            "VM stack overflow",
            "vm/run",
            Value::Nil,
        ));
    }

    let at = rt.thread.regs.pc;
    if at >= rt.code.len() {
        return Err(Unwind::Fatal(format!("pc {} past end of code", at)));
    }

    trace::instruction(rt, at);

    let op = match Opcode::from_repr(rt.code[at]) {
        Some(op) => op,
        None => return Err(Unwind::Fatal(format!("unknown opcode {} at {}", rt.code[at], at))),
    };
    let mut pc = at + 1;

    macro_rules! read_u {
        () => {{
            read_uvarint(&rt.code, &mut pc) as usize
        }};
    }
    macro_rules! read_s {
        () => {{
            read_svarint(&rt.code, &mut pc)
        }};
    }

    match op {
        Opcode::Nop => {}
        Opcode::Constant => {
            let ci = read_u!();
            rt.thread.regs.val = constant(rt, ci)?;
        }
        Opcode::FixnumImm => {
            let n = read_s!();
            rt.thread.regs.val = Value::Fixnum(n);
        }
        Opcode::CharImm => {
            let u = read_u!() as u32;
            let c = char::from_u32(u)
                .ok_or_else(|| Unwind::Fatal(format!("bad character scalar {}", u)))?;
            rt.thread.regs.val = Value::Char(c);
        }
        Opcode::NilVal => rt.thread.regs.val = Value::Nil,
        Opcode::TrueVal => rt.thread.regs.val = Value::True,
        Opcode::FalseVal => rt.thread.regs.val = Value::False,
        Opcode::UnspecVal => rt.thread.regs.val = Value::Unspec,
        Opcode::PushValue => {
            let v = rt.thread.regs.val;
            rt.thread.push(v);
        }
        Opcode::PopValue => {
            rt.thread.regs.val = rt.thread.pop();
        }
        Opcode::GlobalRef => {
            let gvi = read_u!();
            let ci = read_u!();
            let v = rt.values.get(gvi).copied().unwrap_or(Value::Undef);
            if v == Value::Undef {
                let name = constant(rt, ci)?;
                rt.thread.regs.pc = pc;
                let ct = rt.conditions.rt_variable_unbound_error;
                return Err(variable_unwind(rt, ct, "unbound", "vm/global-ref", name));
            }
            rt.thread.regs.val = v;
        }
        Opcode::GlobalSet => {
            let gvi = read_u!();
            let v = rt.thread.regs.val;
            match rt.values.get_mut(gvi) {
                Some(slot) => *slot = v,
                None => return Err(Unwind::Fatal(format!("global-set: no slot {}", gvi))),
            }
        }
        Opcode::ComputedRef => {
            let gvi = read_u!();
            let ci = read_u!();
            rt.thread.regs.pc = pc;
            let cell = rt.values.get(gvi).copied().unwrap_or(Value::Undef);
            let (getter, _setter) = computed_cell(cell);
            if getter == Value::Nil || getter == Value::Undef {
                let name = constant(rt, ci)?;
                let ct = rt.conditions.rt_computed_variable_no_accessor_error;
                return Err(variable_unwind(rt, ct, "no getter", "vm/computed-ref", name));
            }
            let v = call_value(rt, getter, &[])?;
            rt.thread.regs.val = v;
            return Ok(Flow::Continue);
        }
        Opcode::ComputedSet => {
            let gvi = read_u!();
            let ci = read_u!();
            rt.thread.regs.pc = pc;
            let cell = rt.values.get(gvi).copied().unwrap_or(Value::Undef);
            let (_getter, setter) = computed_cell(cell);
            if setter == Value::Nil || setter == Value::Undef {
                let name = constant(rt, ci)?;
                let ct = rt.conditions.rt_computed_variable_no_accessor_error;
                return Err(variable_unwind(rt, ct, "no setter", "vm/computed-set", name));
            }
            let v = rt.thread.regs.val;
            call_value(rt, setter, &[v])?;
            rt.thread.regs.val = Value::Unspec;
            return Ok(Flow::Continue);
        }
        Opcode::ShallowRef => {
            let slot = read_u!();
            rt.thread.regs.val = frame_slot(rt.thread.regs.frame, 0, slot)?;
        }
        Opcode::ShallowSet => {
            let slot = read_u!();
            let v = rt.thread.regs.val;
            set_frame_slot(rt.thread.regs.frame, 0, slot, v)?;
        }
        Opcode::DeepRef => {
            let depth = read_u!();
            let slot = read_u!();
            rt.thread.regs.val = frame_slot(rt.thread.regs.frame, depth, slot)?;
        }
        Opcode::DeepSet => {
            let depth = read_u!();
            let slot = read_u!();
            let v = rt.thread.regs.val;
            set_frame_slot(rt.thread.regs.frame, depth, slot, v)?;
        }
        Opcode::AllocFrame => {
            let n = read_u!();
            rt.thread.regs.val = rt.make_frame(Value::Nil, vec![Value::Nil; n]);
        }
        Opcode::PopFrameSlot => {
            let slot = read_u!();
            let v = rt.thread.pop();
            set_frame_slot(rt.thread.regs.val, 0, slot, v)?;
        }
        Opcode::LinkFrame => {
            let f = rt.thread.regs.val;
            let cur = rt.thread.regs.frame;
            unsafe {
                if let Some(fr) = frame_body(f) {
                    fr.parent = cur;
                }
            }
            rt.thread.regs.frame = f;
        }
        Opcode::UnlinkFrame => {
            let cur = rt.thread.regs.frame;
            let parent = unsafe { frame_body(cur).map(|f| f.parent).unwrap_or(Value::Nil) };
            rt.thread.regs.frame = parent;
        }
        Opcode::ExtendFrame => {
            let n = read_u!();
            let cur = rt.thread.regs.frame;
            unsafe {
                if let Some(fr) = frame_body(cur) {
                    fr.slots.extend(std::iter::repeat(Value::Nil).take(n));
                }
            }
        }
        Opcode::SetFunc => {
            rt.thread.regs.func = rt.thread.regs.val;
        }
        Opcode::CreateClosure => {
            let len = read_u!();
            let name_ci = read_u!();
            let docs_ci = read_u!();
            let name = constant(rt, name_ci)?;
            let docs = constant(rt, docs_ci)?;
            let frame = rt.thread.regs.frame;
            rt.thread.regs.val = rt.make_closure(pc, frame, name, docs);
            pc += len;
        }
        Opcode::FunctionInvoke => {
            let argc = read_u!();
            rt.thread.regs.pc = pc;
            return invoke(rt, argc, false).map(|_| Flow::Continue);
        }
        Opcode::FunctionGoto => {
            let argc = read_u!();
            rt.thread.regs.pc = pc;
            return invoke(rt, argc, true).map(|_| Flow::Continue);
        }
        Opcode::Return => {
            let _argc = rt.thread.pop();
            let frame = rt.thread.pop();
            let module = rt.thread.pop();
            let pcv = rt.thread.pop();
            rt.thread.regs.frame = frame;
            rt.thread.regs.module = module;
            match as_fixnum(pcv) {
                Some(RETURN_SENTINEL) => return Ok(Flow::SentinelReturn),
                Some(n) if n >= 0 => {
                    rt.thread.regs.pc = n as usize;
                    return Ok(Flow::Continue);
                }
                _ => return Err(Unwind::Fatal("return: corrupt return record".to_string())),
            }
        }
        Opcode::Goto => {
            let s = read_s!();
            pc = (pc as i64 + s) as usize;
        }
        Opcode::BranchFalse => {
            let s = read_s!();
            if !is_truthy(rt.thread.regs.val) {
                pc = (pc as i64 + s) as usize;
            }
        }
        Opcode::BranchNil => {
            let s = read_s!();
            if rt.thread.regs.val == Value::Nil {
                pc = (pc as i64 + s) as usize;
            }
        }
        Opcode::Abort => {
            return Err(Unwind::Fatal("abort".to_string()));
        }
        Opcode::Finish => {
            return Ok(Flow::Finished);
        }
        Opcode::PushDynamic => {
            let ci = read_u!();
            let name = constant(rt, ci)?;
            let v = rt.thread.regs.val;
            let old = rt.thread.regs.dynamic_sp;
            rt.thread.push(v);
            rt.thread.push(name);
            rt.thread.push(Value::Fixnum(old));
            rt.thread.regs.dynamic_sp = rt.thread.stack.len() as i64 - 1;
        }
        Opcode::PopDynamic => {
            let sp = rt.thread.regs.dynamic_sp as usize;
            let old = as_fixnum(rt.thread.stack[sp]).unwrap_or(-1);
            rt.thread.stack.truncate(sp - 2);
            rt.thread.regs.dynamic_sp = old;
        }
        Opcode::DynamicRef => {
            let ci = read_u!();
            let name = constant(rt, ci)?;
            rt.thread.regs.pc = pc;
            let v = lookup_chain(rt, rt.thread.regs.dynamic_sp, name)
                .or_else(|| rt.dynamic_base_get(name));
            match v {
                Some(v) => rt.thread.regs.val = v,
                None => {
                    let ct = rt.conditions.rt_dynamic_variable_unbound_error;
                    return Err(variable_unwind(rt, ct, "unbound", "vm/dynamic-ref", name));
                }
            }
            return Ok(Flow::Continue);
        }
        Opcode::PushEnviron => {
            let ci = read_u!();
            let name = constant(rt, ci)?;
            let v = rt.thread.regs.val;
            let old = rt.thread.regs.environ_sp;
            rt.thread.push(v);
            rt.thread.push(name);
            rt.thread.push(Value::Fixnum(old));
            rt.thread.regs.environ_sp = rt.thread.stack.len() as i64 - 1;
        }
        Opcode::PopEnviron => {
            let sp = rt.thread.regs.environ_sp as usize;
            let old = as_fixnum(rt.thread.stack[sp]).unwrap_or(-1);
            rt.thread.stack.truncate(sp - 2);
            rt.thread.regs.environ_sp = old;
        }
        Opcode::EnvironRef => {
            let ci = read_u!();
            let name = constant(rt, ci)?;
            rt.thread.regs.pc = pc;
            let v = lookup_chain(rt, rt.thread.regs.environ_sp, name)
                .or_else(|| rt.environ_base_get(name));
            match v {
                Some(v) => rt.thread.regs.val = v,
                None => {
                    let ct = rt.conditions.rt_environ_variable_unbound_error;
                    return Err(variable_unwind(rt, ct, "unbound", "vm/environ-ref", name));
                }
            }
            return Ok(Flow::Continue);
        }
        Opcode::PushTrap => {
            // handler is already on the stack; the filter type is in val
            let filter = rt.thread.regs.val;
            let old = rt.thread.regs.trap_sp;
            rt.thread.push(filter);
            rt.thread.push(Value::Fixnum(old));
            rt.thread.regs.trap_sp = rt.thread.stack.len() as i64 - 1;
        }
        Opcode::PopTrap => {
            let sp = rt.thread.regs.trap_sp as usize;
            let old = as_fixnum(rt.thread.stack[sp]).unwrap_or(-1);
            rt.thread.stack.truncate(sp - 2);
            rt.thread.regs.trap_sp = old;
        }
        Opcode::CaptureContinuation => {
            let s = read_s!();
            let resume = (pc as i64 + s) as usize;
            let mut regs = rt.thread.regs.clone();
            regs.pc = resume;
            let stack = rt.thread.stack.clone();
            rt.thread.regs.val =
                rt.alloc(ObjBody::Continuation(Continuation { stack, regs }), None);
        }
        Opcode::ArityEq => {
            let n = read_u!();
            let have = unsafe { frame_body(rt.thread.regs.frame).map(|f| f.slots.len()) };
            if have != Some(n) {
                rt.thread.regs.pc = pc;
                let ct = rt.conditions.rt_function_arity_error;
                return Err(condition::error_unwind(
                    rt,
                    ct,
                    &format!("expected {} arguments, got {}", n, have.unwrap_or(0)),
                    "vm/arity",
                    Value::Nil,
                ));
            }
        }
        Opcode::ArityGe => {
            let n = read_u!();
            let have = unsafe { frame_body(rt.thread.regs.frame).map(|f| f.slots.len()) }
                .unwrap_or(0);
            if have < n {
                rt.thread.regs.pc = pc;
                let ct = rt.conditions.rt_function_arity_error;
                return Err(condition::error_unwind(
                    rt,
                    ct,
                    &format!("expected at least {} arguments, got {}", n, have),
                    "vm/arity",
                    Value::Nil,
                ));
            }
        }
    }

    rt.thread.regs.pc = pc;
    Ok(Flow::Continue)
}

fn constant(rt: &Runtime, ci: usize) -> VmResult<Value> {
    rt.constants
        .get(ci)
        .copied()
        .ok_or_else(|| Unwind::Fatal(format!("no constant {}", ci)))
}

fn computed_cell(cell: Value) -> (Value, Value) {
    if let Value::Object(p) = cell {
        unsafe {
            if let ObjBody::Pair(pr) = &(*p).body {
                return (pr.head, pr.tail);
            }
        }
    }
    (Value::Nil, Value::Nil)
}

fn variable_unwind(
    rt: &mut Runtime,
    ctype: Value,
    message: &str,
    location: &str,
    name: Value,
) -> Unwind {
    let c = condition::simple_error(rt, ctype, message, location, Value::Nil);
    unsafe {
        // fourth field along the ^rt-variable-error chain is the name
        instance_set_direct(c, 3, name);
    }
    Unwind::Raise(RaisedCondition {
        continuable: false,
        condition: c,
    })
}

/// Walk a stack-threaded sub-stack (dynamic or environ chain): each
/// entry is [value, name, previous-sp], with the register pointing at
/// the previous-sp slot of the newest entry.
fn lookup_chain(rt: &Runtime, mut sp: i64, name: Value) -> Option<Value> {
    while sp >= 2 && (sp as usize) < rt.thread.stack.len() {
        let spu = sp as usize;
        if rt.thread.stack[spu - 1] == name {
            return Some(rt.thread.stack[spu - 2]);
        }
        sp = as_fixnum(rt.thread.stack[spu]).unwrap_or(-1);
    }
    None
}

unsafe fn frame_body<'a>(v: Value) -> Option<&'a mut crate::objects::object::Frame> {
    let p = match v {
        Value::Object(p) => p,
        _ => return None,
    };
    match &mut (*p).body {
        ObjBody::Frame(f) => Some(&mut *(f as *mut crate::objects::object::Frame)),
        _ => None,
    }
}

fn frame_slot(frame: Value, depth: usize, slot: usize) -> VmResult<Value> {
    let mut cur = frame;
    for _ in 0..depth {
        cur = unsafe { frame_body(cur) }
            .map(|f| f.parent)
            .ok_or_else(|| Unwind::Fatal("frame ref: chain too short".to_string()))?;
    }
    unsafe { frame_body(cur) }
        .and_then(|f| f.slots.get(slot).copied())
        .ok_or_else(|| Unwind::Fatal(format!("frame ref: no slot {}", slot)))
}

fn set_frame_slot(frame: Value, depth: usize, slot: usize, v: Value) -> VmResult<()> {
    let mut cur = frame;
    for _ in 0..depth {
        cur = unsafe { frame_body(cur) }
            .map(|f| f.parent)
            .ok_or_else(|| Unwind::Fatal("frame set: chain too short".to_string()))?;
    }
    match unsafe { frame_body(cur) } {
        Some(f) if slot < f.slots.len() => {
            f.slots[slot] = v;
            Ok(())
        }
        _ => Err(Unwind::Fatal(format!("frame set: no slot {}", slot))),
    }
}

enum Callable {
    Primitive(*mut Object),
    Closure(*mut Object),
    Continuation(*mut Object),
    Other,
}

fn classify(v: Value) -> Callable {
    if let Value::Object(p) = v {
        unsafe {
            return match &(*p).body {
                ObjBody::Primitive(_) => Callable::Primitive(p),
                ObjBody::Closure(_) => Callable::Closure(p),
                ObjBody::Continuation(_) => Callable::Continuation(p),
                _ => Callable::Other,
            };
        }
    }
    Callable::Other
}

fn frame_args(argframe: Value, argc: usize) -> VmResult<Vec<Value>> {
    match unsafe { frame_body(argframe) } {
        Some(f) => Ok(f.slots.iter().copied().take(argc).collect()),
        None if argc == 0 => Ok(Vec::new()),
        None => Err(Unwind::Fatal("invoke: arguments without a frame".to_string())),
    }
}

fn arity_unwind(rt: &mut Runtime, name: &str, wanted: String, got: usize) -> Unwind {
    let ct = rt.conditions.rt_function_arity_error;
    condition::error_unwind(
        rt,
        ct,
        &format!("{}: expected {} arguments, got {}", name, wanted, got),
        "vm/invoke",
        Value::Nil,
    )
}

/// Invoke the func register with the argument frame in val.  Arity is
/// verified before any side effect.  The call protocol pushes, in
/// order: PC, module, frame, argument count; `Return` undoes exactly
/// that.  A tail invocation pushes nothing.
fn invoke(rt: &mut Runtime, argc: usize, tail: bool) -> VmResult<()> {
    let callee = rt.thread.regs.func;
    let argframe = rt.thread.regs.val;
    match classify(callee) {
        Callable::Primitive(p) => {
            let (arity, varargs, name, func) = unsafe {
                match &(*p).body {
                    ObjBody::Primitive(prim) => {
                        (prim.arity as usize, prim.varargs, prim.name, prim.func)
                    }
                    _ => unreachable!(),
                }
            };
            if argc < arity || (!varargs && argc != arity) {
                let wanted = if varargs {
                    format!("at least {}", arity)
                } else {
                    arity.to_string()
                };
                return Err(arity_unwind(rt, name, wanted, argc));
            }
            let args = frame_args(argframe, argc)?;
            rt.temp_roots.push(argframe);
            let r = func(rt, &args);
            rt.temp_roots.pop();
            rt.thread.regs.val = r?;
            Ok(())
        }
        Callable::Closure(p) => {
            let (body_pc, captured) = unsafe {
                match &(*p).body {
                    ObjBody::Closure(c) => (c.pc, c.frame),
                    _ => unreachable!(),
                }
            };
            if !tail {
                let ret = rt.thread.regs.pc as i64;
                let module = rt.thread.regs.module;
                let frame = rt.thread.regs.frame;
                rt.thread.push(Value::Fixnum(ret));
                rt.thread.push(module);
                rt.thread.push(frame);
                rt.thread.push(Value::Fixnum(argc as i64));
            }
            unsafe {
                if let Some(f) = frame_body(argframe) {
                    f.parent = captured;
                }
            }
            rt.thread.regs.frame = argframe;
            rt.thread.regs.pc = body_pc;
            Ok(())
        }
        Callable::Continuation(_) => {
            if argc != 1 {
                return Err(arity_unwind(rt, "continuation", "1".to_string(), argc));
            }
            let arg = frame_args(argframe, 1)?
                .first()
                .copied()
                .unwrap_or(Value::Unspec);
            Err(restore_continuation(rt, callee, arg))
        }
        Callable::Other => {
            let ct = rt.conditions.rt_function_error;
            let shown = crate::value::as_string(callee);
            let d = rt.make_string(&shown);
            Err(condition::error_unwind(rt, ct, "not a procedure", "vm/invoke", d))
        }
    }
}

/// Native re-entry: call a runtime value with ready arguments and run
/// the VM until it returns.  Handlers, computed variables and custom
/// hash functions all come through here.
pub fn call_value(rt: &mut Runtime, callee: Value, args: &[Value]) -> VmResult<Value> {
    match classify(callee) {
        Callable::Primitive(p) => {
            let (arity, varargs, name, func) = unsafe {
                match &(*p).body {
                    ObjBody::Primitive(prim) => {
                        (prim.arity as usize, prim.varargs, prim.name, prim.func)
                    }
                    _ => unreachable!(),
                }
            };
            if args.len() < arity || (!varargs && args.len() != arity) {
                let wanted = if varargs {
                    format!("at least {}", arity)
                } else {
                    arity.to_string()
                };
                return Err(arity_unwind(rt, name, wanted, args.len()));
            }
            rt.temp_roots.push(callee);
            rt.temp_roots.extend_from_slice(args);
            let r = func(rt, args);
            rt.temp_roots
                .truncate(rt.temp_roots.len() - args.len() - 1);
            r
        }
        Callable::Closure(p) => {
            let captured = unsafe {
                match &(*p).body {
                    ObjBody::Closure(c) => c.frame,
                    _ => unreachable!(),
                }
            };
            let body_pc = unsafe {
                match &(*p).body {
                    ObjBody::Closure(c) => c.pc,
                    _ => unreachable!(),
                }
            };
            rt.temp_roots.push(callee);
            rt.temp_roots.extend_from_slice(args);
            let frame = rt.make_frame(captured, args.to_vec());
            rt.temp_roots
                .truncate(rt.temp_roots.len() - args.len() - 1);

            // the sentinel return record restores frame and module; the
            // caller's pc is native state, put it back ourselves
            let saved_pc = rt.thread.regs.pc;
            let module = rt.thread.regs.module;
            let cur_frame = rt.thread.regs.frame;
            rt.thread.push(Value::Fixnum(RETURN_SENTINEL));
            rt.thread.push(module);
            rt.thread.push(cur_frame);
            rt.thread.push(Value::Fixnum(args.len() as i64));
            rt.thread.regs.frame = frame;
            rt.thread.regs.pc = body_pc;
            match execute(rt, true) {
                Ok(v) => {
                    rt.thread.regs.pc = saved_pc;
                    Ok(v)
                }
                Err(e) => Err(e),
            }
        }
        Callable::Continuation(_) => {
            let arg = args.first().copied().unwrap_or(Value::Unspec);
            Err(restore_continuation(rt, callee, arg))
        }
        Callable::Other => {
            let ct = rt.conditions.rt_function_error;
            let shown = crate::value::as_string(callee);
            let d = rt.make_string(&shown);
            Err(condition::error_unwind(
                rt,
                ct,
                "not a procedure",
                "vm/call",
                d,
            ))
        }
    }
}

/// Overwrite the running thread with the captured snapshot.  Always an
/// unwind: native frames between here and the dispatch loop are dead.
pub fn restore_continuation(rt: &mut Runtime, k: Value, v: Value) -> Unwind {
    let p = match k {
        Value::Object(p) => p,
        _ => return Unwind::Fatal("restore: not a continuation".to_string()),
    };
    unsafe {
        match &(*p).body {
            ObjBody::Continuation(c) => {
                rt.thread.stack = c.stack.clone();
                rt.thread.regs = c.regs.clone();
                rt.thread.regs.val = v;
                Unwind::Restore
            }
            _ => Unwind::Fatal("restore: not a continuation".to_string()),
        }
    }
}

/// Snapshot the thread as it stands; restoring resumes at the current
/// PC.
pub fn capture_current_continuation(rt: &mut Runtime) -> Value {
    let regs = rt.thread.regs.clone();
    let stack = rt.thread.stack.clone();
    rt.alloc(ObjBody::Continuation(Continuation { stack, regs }), None)
}

#[cfg(feature = "debug_trace_execution")]
mod trace {
    use super::*;
    use crate::debug;
    use crate::value::as_string;

    pub fn instruction(rt: &Runtime, at: usize) {
        eprint!("{: >17}", "");
        for slot in rt.thread.stack.iter() {
            eprint!(" [ {} ]", as_string(*slot));
        }
        eprintln!();
        debug::disassemble_instruction(&rt.code, &rt.constants, at);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod trace {
    use super::*;

    pub fn instruction(_rt: &Runtime, _at: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{CodeUnit, ConstSpec, Opcode};
    use crate::loader;

    /// Emit the call preamble for a global function with fixnum
    /// arguments already evaluated onto the stack by the caller.
    fn emit_call_global(rt: &mut Runtime, u: &mut CodeUnit, name: &str, args: &[i64]) {
        let gvi = rt.global_index(name).expect("global");
        let ci = u.add_constant(ConstSpec::Sym(name.to_string()));
        u.write_op(Opcode::GlobalRef);
        u.write_uvarint(gvi as u64);
        u.write_uvarint(ci as u64);
        u.write_op(Opcode::SetFunc);
        for &a in args {
            u.write_op(Opcode::FixnumImm);
            u.write_svarint(a);
            u.write_op(Opcode::PushValue);
        }
        u.write_op(Opcode::AllocFrame);
        u.write_uvarint(args.len() as u64);
        for i in (0..args.len()).rev() {
            u.write_op(Opcode::PopFrameSlot);
            u.write_uvarint(i as u64);
        }
        u.write_op(Opcode::FunctionInvoke);
        u.write_uvarint(args.len() as u64);
    }

    fn run_unit(rt: &mut Runtime, unit: &CodeUnit) -> VmResult<Value> {
        let entry = loader::install(rt, unit);
        run_at(rt, entry)
    }

    #[test]
    fn constants_and_immediates() {
        let mut rt = Runtime::new();
        let mut u = CodeUnit::new();
        let ci = u.add_constant(ConstSpec::Str("hi".to_string()));
        u.write_op(Opcode::Constant);
        u.write_uvarint(ci as u64);
        u.write_op(Opcode::Finish);
        let v = run_unit(&mut rt, &u).ok().unwrap();
        assert_eq!(crate::value::as_string(v), "hi");
    }

    #[test]
    fn addition_of_two_fixnums() {
        let mut rt = Runtime::new();
        let mut u = CodeUnit::new();
        emit_call_global(&mut rt, &mut u, "+", &[2, 3]);
        u.write_op(Opcode::Finish);
        let v = run_unit(&mut rt, &u).ok().unwrap();
        assert_eq!(v, Value::Fixnum(5));
    }

    #[test]
    fn branch_false_takes_the_jump() {
        let mut rt = Runtime::new();
        let mut u = CodeUnit::new();
        u.write_op(Opcode::FalseVal);
        u.write_op(Opcode::BranchFalse);
        u.write_svarint(2); // over the FixnumImm 1 below
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(1);
        u.write_op(Opcode::Finish);
        // fall through target: val still #f
        let v = run_unit(&mut rt, &u).ok().unwrap();
        assert_eq!(v, Value::False);
    }

    #[test]
    fn closure_call_and_return() {
        let mut rt = Runtime::new();
        let mut u = CodeUnit::new();
        let name_ci = u.add_constant(ConstSpec::Sym("id".to_string()));
        let docs_ci = u.add_constant(ConstSpec::Nil);

        // closure body: arity check, return first argument
        let mut body = CodeUnit::new();
        body.write_op(Opcode::ArityEq);
        body.write_uvarint(1);
        body.write_op(Opcode::ShallowRef);
        body.write_uvarint(0);
        body.write_op(Opcode::Return);

        u.write_op(Opcode::CreateClosure);
        u.write_uvarint(body.code.len() as u64);
        u.write_uvarint(name_ci as u64);
        u.write_uvarint(docs_ci as u64);
        u.code.extend_from_slice(&body.code);
        u.write_op(Opcode::SetFunc);
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(99);
        u.write_op(Opcode::PushValue);
        u.write_op(Opcode::AllocFrame);
        u.write_uvarint(1);
        u.write_op(Opcode::PopFrameSlot);
        u.write_uvarint(0);
        u.write_op(Opcode::FunctionInvoke);
        u.write_uvarint(1);
        u.write_op(Opcode::Finish);

        let v = run_unit(&mut rt, &u).ok().unwrap();
        assert_eq!(v, Value::Fixnum(99));
    }

    #[test]
    fn closure_arity_mismatch_raises() {
        let mut rt = Runtime::new();
        let mut u = CodeUnit::new();
        let name_ci = u.add_constant(ConstSpec::Sym("two".to_string()));
        let docs_ci = u.add_constant(ConstSpec::Nil);

        let mut body = CodeUnit::new();
        body.write_op(Opcode::ArityEq);
        body.write_uvarint(2);
        body.write_op(Opcode::UnspecVal);
        body.write_op(Opcode::Return);

        u.write_op(Opcode::CreateClosure);
        u.write_uvarint(body.code.len() as u64);
        u.write_uvarint(name_ci as u64);
        u.write_uvarint(docs_ci as u64);
        u.code.extend_from_slice(&body.code);
        u.write_op(Opcode::SetFunc);
        u.write_op(Opcode::AllocFrame);
        u.write_uvarint(1);
        u.write_op(Opcode::FunctionInvoke);
        u.write_uvarint(1);
        u.write_op(Opcode::Finish);

        match run_unit(&mut rt, &u) {
            Err(Unwind::Fatal(msg)) => assert!(msg.contains("nothing to restore")),
            other => panic!(
                "arity error should escalate to fatal, got {:?}",
                other.ok()
            ),
        }
    }

    #[test]
    fn trap_handler_value_resumes_a_continuable_raise() {
        let mut rt = Runtime::new();
        fn h42(_rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
            Ok(Value::Fixnum(42))
        }
        rt.add_primitive("h42", 2, false, "", h42);

        let mut u = CodeUnit::new();
        // push handler
        let hgvi = rt.global_index("h42").unwrap();
        let hci = u.add_constant(ConstSpec::Sym("h42".to_string()));
        u.write_op(Opcode::GlobalRef);
        u.write_uvarint(hgvi as u64);
        u.write_uvarint(hci as u64);
        u.write_op(Opcode::PushValue);
        // filter type in val
        let fgvi = rt.global_index("^rt-divide-by-zero-error").unwrap();
        let fci = u.add_constant(ConstSpec::Sym("^rt-divide-by-zero-error".to_string()));
        u.write_op(Opcode::GlobalRef);
        u.write_uvarint(fgvi as u64);
        u.write_uvarint(fci as u64);
        u.write_op(Opcode::PushTrap);
        // (/ 1 0)
        emit_call_global(&mut rt, &mut u, "/", &[1, 0]);
        u.write_op(Opcode::PopTrap);
        u.write_op(Opcode::Finish);

        let v = run_unit(&mut rt, &u).ok().unwrap();
        assert_eq!(v, Value::Fixnum(42));
    }

    #[test]
    fn continuation_is_multi_shot() {
        let mut rt = Runtime::new();
        let saved_sym = rt.intern("saved-k");
        let saved_gvi = rt.define_global(saved_sym, Value::Undef);

        let mut u = CodeUnit::new();
        // (+ 1 (call/cc (lambda (k) (set! saved-k k) 10)))
        let plus_gvi = rt.global_index("+").unwrap();
        let plus_ci = u.add_constant(ConstSpec::Sym("+".to_string()));
        u.write_op(Opcode::GlobalRef);
        u.write_uvarint(plus_gvi as u64);
        u.write_uvarint(plus_ci as u64);
        u.write_op(Opcode::SetFunc);
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(1);
        u.write_op(Opcode::PushValue);
        // capture: resume just after the "10" below
        u.write_op(Opcode::CaptureContinuation);
        // operands: svarint jump over [GlobalSet saved][FixnumImm 10]
        let mut after = Vec::new();
        crate::chunk::write_uvarint(&mut after, saved_gvi as u64);
        // GlobalSet op byte + operand + FixnumImm op byte + svarint(10)
        let mut ten = Vec::new();
        crate::chunk::write_svarint(&mut ten, 10);
        let skip = 1 + after.len() + 1 + ten.len();
        u.write_svarint(skip as i64);
        u.write_op(Opcode::GlobalSet);
        u.code.extend_from_slice(&after);
        u.write_op(Opcode::FixnumImm);
        u.code.extend_from_slice(&ten);
        // resume point: finish the call with val as second argument
        u.write_op(Opcode::PushValue);
        u.write_op(Opcode::AllocFrame);
        u.write_uvarint(2);
        u.write_op(Opcode::PopFrameSlot);
        u.write_uvarint(1);
        u.write_op(Opcode::PopFrameSlot);
        u.write_uvarint(0);
        u.write_op(Opcode::FunctionInvoke);
        u.write_uvarint(2);
        u.write_op(Opcode::Finish);

        let entry = loader::install(&mut rt, &u);
        let v = run_at(&mut rt, entry).ok().unwrap();
        assert_eq!(v, Value::Fixnum(11));

        // now (saved-k 100) → control re-enters the add with 100
        let mut u2 = CodeUnit::new();
        let saved_ci = u2.add_constant(ConstSpec::Sym("saved-k".to_string()));
        u2.write_op(Opcode::GlobalRef);
        u2.write_uvarint(saved_gvi as u64);
        u2.write_uvarint(saved_ci as u64);
        u2.write_op(Opcode::SetFunc);
        u2.write_op(Opcode::FixnumImm);
        u2.write_svarint(100);
        u2.write_op(Opcode::PushValue);
        u2.write_op(Opcode::AllocFrame);
        u2.write_uvarint(1);
        u2.write_op(Opcode::PopFrameSlot);
        u2.write_uvarint(0);
        u2.write_op(Opcode::FunctionInvoke);
        u2.write_uvarint(1);
        u2.write_op(Opcode::Finish);

        let entry2 = loader::install(&mut rt, &u2);
        let v2 = run_at(&mut rt, entry2).ok().unwrap();
        assert_eq!(v2, Value::Fixnum(101));
        // multi-shot: invoking again behaves identically
        let v3 = run_at(&mut rt, entry2).ok().unwrap();
        assert_eq!(v3, Value::Fixnum(101));
    }

    #[test]
    fn dynamic_chain_shadows_and_unwinds() {
        let mut rt = Runtime::new();
        let ifs = rt.intern("IFS");
        let base = rt.make_string("base");
        rt.dynamic_base_set(ifs, base);
        let probe_sym = rt.intern("probe");
        let probe_gvi = rt.define_global(probe_sym, Value::Nil);

        let mut u = CodeUnit::new();
        let ci = u.add_constant(ConstSpec::Sym("IFS".to_string()));
        let inner = u.add_constant(ConstSpec::Str("inner".to_string()));
        u.write_op(Opcode::Constant);
        u.write_uvarint(inner as u64);
        u.write_op(Opcode::PushDynamic);
        u.write_uvarint(ci as u64);
        u.write_op(Opcode::DynamicRef);
        u.write_uvarint(ci as u64);
        u.write_op(Opcode::GlobalSet);
        u.write_uvarint(probe_gvi as u64);
        u.write_op(Opcode::PopDynamic);
        u.write_op(Opcode::DynamicRef);
        u.write_uvarint(ci as u64);
        u.write_op(Opcode::Finish);

        let entry = loader::install(&mut rt, &u);
        let outer = run_at(&mut rt, entry).ok().unwrap();
        assert_eq!(crate::value::as_string(outer), "base");
        // the shadowing binding was seen inside the extent
        assert_eq!(crate::value::as_string(rt.values[probe_gvi]), "inner");
        assert!(rt.thread.stack.is_empty());
    }

    #[test]
    fn pending_signal_is_raised_at_a_safe_point() {
        let mut rt = Runtime::new();
        signals::deliver(signals::SIGHUP);
        let mut u = CodeUnit::new();
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(5);
        u.write_op(Opcode::Finish);
        // SIGHUP is absorbed by the default handler and execution
        // continues to completion
        let v = run_unit(&mut rt, &u).ok().unwrap();
        assert_eq!(v, Value::Fixnum(5));
    }

    #[test]
    fn deep_frame_refs_walk_the_parent_chain() {
        let mut rt = Runtime::new();
        let outer = rt.make_frame(Value::Nil, vec![Value::Fixnum(7)]);
        let inner = rt.make_frame(outer, vec![Value::Fixnum(8)]);
        rt.thread.regs.frame = inner;

        let mut u = CodeUnit::new();
        u.write_op(Opcode::DeepRef);
        u.write_uvarint(1);
        u.write_uvarint(0);
        u.write_op(Opcode::Finish);
        let entry = loader::install(&mut rt, &u);
        let v = run_at(&mut rt, entry).ok().unwrap();
        assert_eq!(v, Value::Fixnum(7));
    }

    #[test]
    fn runaway_recursion_raises_instead_of_crashing() {
        let mut rt = Runtime::new();
        let f_sym = rt.intern("loop-forever");
        let f_gvi = rt.define_global(f_sym, Value::Nil);

        let mut u = CodeUnit::new();
        let f_ci = u.add_constant(ConstSpec::Sym("loop-forever".to_string()));
        let name_ci = u.add_constant(ConstSpec::Sym("loop-forever".to_string()));
        let docs_ci = u.add_constant(ConstSpec::Nil);

        // body: call self in non-tail position, growing the stack
        let mut body = CodeUnit::new();
        body.write_op(Opcode::GlobalRef);
        body.write_uvarint(f_gvi as u64);
        body.write_uvarint(f_ci as u64);
        body.write_op(Opcode::SetFunc);
        body.write_op(Opcode::AllocFrame);
        body.write_uvarint(0);
        body.write_op(Opcode::FunctionInvoke);
        body.write_uvarint(0);
        body.write_op(Opcode::Return);

        u.write_op(Opcode::CreateClosure);
        u.write_uvarint(body.code.len() as u64);
        u.write_uvarint(name_ci as u64);
        u.write_uvarint(docs_ci as u64);
        u.code.extend_from_slice(&body.code);
        u.write_op(Opcode::GlobalSet);
        u.write_uvarint(f_gvi as u64);
        u.write_op(Opcode::GlobalRef);
        u.write_uvarint(f_gvi as u64);
        u.write_uvarint(f_ci as u64);
        u.write_op(Opcode::SetFunc);
        u.write_op(Opcode::AllocFrame);
        u.write_uvarint(0);
        u.write_op(Opcode::FunctionInvoke);
        u.write_uvarint(0);
        u.write_op(Opcode::Finish);

        match run_unit(&mut rt, &u) {
            Err(Unwind::Fatal(msg)) => assert!(msg.contains("nothing to restore")),
            other => panic!("expected overflow escalation, got {:?}", other.ok()),
        }
    }

    #[test]
    fn tail_calls_do_not_grow_the_stack() {
        let mut rt = Runtime::new();
        let f_sym = rt.intern("countdown");
        let f_gvi = rt.define_global(f_sym, Value::Nil);
        let eq_gvi = rt.global_index("=").unwrap();
        let minus_gvi = rt.global_index("-").unwrap();

        let mut u = CodeUnit::new();
        let f_ci = u.add_constant(ConstSpec::Sym("countdown".to_string()));
        let eq_ci = u.add_constant(ConstSpec::Sym("=".to_string()));
        let minus_ci = u.add_constant(ConstSpec::Sym("-".to_string()));
        let docs_ci = u.add_constant(ConstSpec::Nil);

        // body: (if (= n 0) 42 (countdown (- n 1))), the recursion in
        // tail position
        let mut body = CodeUnit::new();
        body.write_op(Opcode::ArityEq);
        body.write_uvarint(1);
        body.write_op(Opcode::GlobalRef);
        body.write_uvarint(eq_gvi as u64);
        body.write_uvarint(eq_ci as u64);
        body.write_op(Opcode::SetFunc);
        body.write_op(Opcode::ShallowRef);
        body.write_uvarint(0);
        body.write_op(Opcode::PushValue);
        body.write_op(Opcode::FixnumImm);
        body.write_svarint(0);
        body.write_op(Opcode::PushValue);
        body.write_op(Opcode::AllocFrame);
        body.write_uvarint(2);
        body.write_op(Opcode::PopFrameSlot);
        body.write_uvarint(1);
        body.write_op(Opcode::PopFrameSlot);
        body.write_uvarint(0);
        body.write_op(Opcode::FunctionInvoke);
        body.write_uvarint(2);
        body.write_op(Opcode::BranchFalse);
        body.write_svarint(3); // over [FixnumImm 42][Return]
        body.write_op(Opcode::FixnumImm);
        body.write_svarint(42);
        body.write_op(Opcode::Return);
        // (- n 1)
        body.write_op(Opcode::GlobalRef);
        body.write_uvarint(minus_gvi as u64);
        body.write_uvarint(minus_ci as u64);
        body.write_op(Opcode::SetFunc);
        body.write_op(Opcode::ShallowRef);
        body.write_uvarint(0);
        body.write_op(Opcode::PushValue);
        body.write_op(Opcode::FixnumImm);
        body.write_svarint(1);
        body.write_op(Opcode::PushValue);
        body.write_op(Opcode::AllocFrame);
        body.write_uvarint(2);
        body.write_op(Opcode::PopFrameSlot);
        body.write_uvarint(1);
        body.write_op(Opcode::PopFrameSlot);
        body.write_uvarint(0);
        body.write_op(Opcode::FunctionInvoke);
        body.write_uvarint(2);
        body.write_op(Opcode::PushValue);
        body.write_op(Opcode::GlobalRef);
        body.write_uvarint(f_gvi as u64);
        body.write_uvarint(f_ci as u64);
        body.write_op(Opcode::SetFunc);
        body.write_op(Opcode::AllocFrame);
        body.write_uvarint(1);
        body.write_op(Opcode::PopFrameSlot);
        body.write_uvarint(0);
        body.write_op(Opcode::FunctionGoto);
        body.write_uvarint(1);

        u.write_op(Opcode::CreateClosure);
        u.write_uvarint(body.code.len() as u64);
        u.write_uvarint(f_ci as u64);
        u.write_uvarint(docs_ci as u64);
        u.code.extend_from_slice(&body.code);
        u.write_op(Opcode::GlobalSet);
        u.write_uvarint(f_gvi as u64);
        u.write_op(Opcode::GlobalRef);
        u.write_uvarint(f_gvi as u64);
        u.write_uvarint(f_ci as u64);
        u.write_op(Opcode::SetFunc);
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(20_000);
        u.write_op(Opcode::PushValue);
        u.write_op(Opcode::AllocFrame);
        u.write_uvarint(1);
        u.write_op(Opcode::PopFrameSlot);
        u.write_uvarint(0);
        u.write_op(Opcode::FunctionInvoke);
        u.write_uvarint(1);
        u.write_op(Opcode::Finish);

        // 20k frames in non-tail position would trip the stack limit;
        // in tail position this completes
        let v = run_unit(&mut rt, &u).ok().unwrap();
        assert_eq!(v, Value::Fixnum(42));
    }

    #[test]
    fn non_procedure_invoke_raises_function_error() {
        let mut rt = Runtime::new();
        let mut u = CodeUnit::new();
        u.write_op(Opcode::FixnumImm);
        u.write_svarint(3);
        u.write_op(Opcode::SetFunc);
        u.write_op(Opcode::AllocFrame);
        u.write_uvarint(0);
        u.write_op(Opcode::FunctionInvoke);
        u.write_uvarint(0);
        u.write_op(Opcode::Finish);
        assert!(matches!(run_unit(&mut rt, &u), Err(Unwind::Fatal(_))));
    }
}
