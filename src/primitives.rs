use crate::condition::{self, RaisedCondition, Unwind, VmResult};
use crate::gc;
use crate::handle::{FileOps, Handle, StringInputOps, StringOutputOps};
use crate::hash::{self, HashFns, RtHash};
use crate::objects::object::{Finalizer, ObjBody, Object, ObjectKind};
use crate::runtime::Runtime;
use crate::strings::{string_bytes, Substring};
use crate::struct_type::{
    field_index, instance_isa, instance_ref_direct, instance_set_direct, instance_type,
};
use crate::value::{as_string, is_truthy, make_boolean, values_equal, Value};

/// Register the baseline primitive set into the main module.
pub fn install(rt: &mut Runtime) {
    rt.add_primitive("+", 0, true, "sum of the arguments", prim_add);
    rt.add_primitive("-", 1, true, "difference, or negation for one argument", prim_sub);
    rt.add_primitive("*", 0, true, "product of the arguments", prim_mul);
    rt.add_primitive("/", 1, true, "quotient, left to right", prim_div);
    rt.add_primitive("expt", 2, false, "base raised to a non-negative power", prim_expt);
    rt.add_primitive("<", 2, true, "strictly increasing", prim_lt);
    rt.add_primitive("=", 2, true, "numerically equal", prim_num_eq);
    rt.add_primitive(">", 2, true, "strictly decreasing", prim_gt);

    rt.add_primitive("cons", 2, false, "pair of head and tail", prim_cons);
    rt.add_primitive("head", 1, false, "head of a pair", prim_head);
    rt.add_primitive("tail", 1, false, "tail of a pair", prim_tail);
    rt.add_primitive("list", 0, true, "proper list of the arguments", prim_list);
    rt.add_primitive("length", 1, false, "length of a proper list", prim_length);
    rt.add_primitive("append", 2, false, "left copied, right shared", prim_append);

    rt.add_primitive("eq?", 2, false, "identity equality", prim_eqp);
    rt.add_primitive("equal?", 2, false, "structural equality", prim_equalp);
    rt.add_primitive("not", 1, false, "", prim_not);
    rt.add_primitive("copy", 2, false, "copy a value, 'shallow or 'deep", prim_copy);

    rt.add_primitive("pair?", 1, false, "", prim_pairp);
    rt.add_primitive("null?", 1, false, "", prim_nullp);
    rt.add_primitive("symbol?", 1, false, "", prim_symbolp);
    rt.add_primitive("string?", 1, false, "", prim_stringp);
    rt.add_primitive("fixnum?", 1, false, "", prim_fixnump);
    rt.add_primitive("char?", 1, false, "", prim_charp);
    rt.add_primitive("boolean?", 1, false, "", prim_booleanp);
    rt.add_primitive("array?", 1, false, "", prim_arrayp);
    rt.add_primitive("hash?", 1, false, "", prim_hashp);
    rt.add_primitive("procedure?", 1, false, "", prim_procedurep);
    rt.add_primitive("eof-object?", 1, false, "", prim_eofp);

    rt.add_primitive("make-array", 1, false, "array with the given capacity", prim_make_array);
    rt.add_primitive("array-ref", 2, false, "", prim_array_ref);
    rt.add_primitive("array-set!", 3, false, "", prim_array_set);
    rt.add_primitive("array-push!", 2, false, "", prim_array_push);
    rt.add_primitive("array-pop!", 1, false, "", prim_array_pop);
    rt.add_primitive("array-length", 1, false, "", prim_array_length);
    rt.add_primitive("array->list", 1, false, "", prim_array_to_list);

    rt.add_primitive(
        "make-hash",
        0,
        true,
        "hash table; optional 'equal, or a hash and an equality function",
        prim_make_hash,
    );
    rt.add_primitive("hash-set!", 3, false, "", prim_hash_set);
    rt.add_primitive("hash-ref", 2, true, "value for key, or the given default", prim_hash_ref);
    rt.add_primitive("hash-delete!", 2, false, "", prim_hash_delete);
    rt.add_primitive("hash-exists?", 2, false, "", prim_hash_existsp);
    rt.add_primitive("hash-keys", 1, false, "", prim_hash_keys);
    rt.add_primitive("hash-values", 1, false, "", prim_hash_values);
    rt.add_primitive("hash-size", 1, false, "", prim_hash_size);

    rt.add_primitive("string-length", 1, false, "", prim_string_length);
    rt.add_primitive("string-ref", 2, false, "", prim_string_ref);
    rt.add_primitive("substring", 3, false, "view sharing the parent's buffer", prim_substring);
    rt.add_primitive("string->symbol", 1, false, "", prim_string_to_symbol);
    rt.add_primitive("symbol->string", 1, false, "", prim_symbol_to_string);
    rt.add_primitive("as-string", 1, false, "display form of any value", prim_as_string);

    rt.add_primitive(
        "make-struct-type",
        3,
        false,
        "name, parent or #n, list of field names",
        prim_make_struct_type,
    );
    rt.add_primitive("make-struct-instance", 1, true, "", prim_make_struct_instance);
    rt.add_primitive("struct-instance-ref", 2, false, "", prim_struct_instance_ref);
    rt.add_primitive("struct-instance-set!", 3, false, "", prim_struct_instance_set);
    rt.add_primitive("struct-instance-isa?", 2, false, "", prim_struct_instance_isap);

    rt.add_primitive("condition?", 1, false, "", prim_conditionp);
    rt.add_primitive("condition-isa?", 2, false, "", prim_condition_isap);
    rt.add_primitive("condition-ref", 2, false, "", prim_condition_ref);
    rt.add_primitive("condition-set!", 3, false, "", prim_condition_set);
    rt.add_primitive("make-condition", 1, true, "", prim_make_condition);
    rt.add_primitive(
        "raise",
        2,
        false,
        "raise a condition; the flag says whether the handler may return",
        prim_raise,
    );
    rt.add_primitive("set-default-handler!", 2, false, "", prim_set_default_handler);
    rt.add_primitive("clear-default-handler!", 1, false, "", prim_clear_default_handler);
    rt.add_primitive(
        "default-condition-handler",
        2,
        false,
        "",
        prim_default_condition_handler,
    );
    rt.add_primitive(
        "restart-condition-handler",
        2,
        false,
        "",
        prim_restart_condition_handler,
    );
    rt.add_primitive(
        "reset-condition-handler",
        2,
        false,
        "",
        prim_reset_condition_handler,
    );

    rt.add_primitive("gc-collect", 0, false, "run a full collection", prim_gc_collect);
    rt.add_primitive("gc-stats", 0, false, "(cycles total-freed live)", prim_gc_stats);

    rt.add_primitive("open-input-string", 1, false, "", prim_open_input_string);
    rt.add_primitive("open-output-string", 0, false, "", prim_open_output_string);
    rt.add_primitive("get-output-string", 1, false, "", prim_get_output_string);
    rt.add_primitive("open-input-file", 1, false, "", prim_open_input_file);
    rt.add_primitive("read-char", 0, true, "", prim_read_char);
    rt.add_primitive("peek-char", 0, true, "", prim_peek_char);
    rt.add_primitive("write-char", 1, true, "", prim_write_char);
    rt.add_primitive("display", 1, true, "", prim_display);
    rt.add_primitive("newline", 0, true, "", prim_newline);
    rt.add_primitive("close-handle", 1, false, "", prim_close_handle);
    rt.add_primitive("handle-line", 1, false, "", prim_handle_line);
    rt.add_primitive("handle-pos", 1, false, "", prim_handle_pos);
    rt.add_primitive("handle-name", 1, false, "", prim_handle_name);

    rt.add_primitive("current-module", 0, false, "", prim_current_module);
    rt.add_primitive("current-input-handle", 0, false, "", prim_current_input);
    rt.add_primitive("current-output-handle", 0, false, "", prim_current_output);
    rt.add_primitive("current-error-handle", 0, false, "", prim_current_error);
    rt.add_primitive("find-module", 1, false, "", prim_find_module);

    let geti = rt.add_primitive(
        "SECONDS/get",
        0,
        false,
        "elapsed running time in seconds",
        prim_seconds_get,
    );
    rt.add_computed("SECONDS", geti, Value::Nil);
}

fn type_unwind(rt: &mut Runtime, location: &str, expected: &str, got: Value) -> Unwind {
    let ct = rt.conditions.rt_parameter_type_error;
    let shown = as_string(got);
    let d = rt.make_string(&shown);
    condition::error_unwind(rt, ct, &format!("expected {}", expected), location, d)
}

fn obj_ptr(v: Value, kind: ObjectKind) -> Option<*mut Object> {
    if let Value::Object(p) = v {
        unsafe {
            if (*p).kind() == kind {
                return Some(p);
            }
        }
    }
    None
}

unsafe fn array_mut<'a>(p: *mut Object) -> &'a mut crate::array::RtArray {
    match &mut (*p).body {
        ObjBody::Array(a) => &mut *(a as *mut crate::array::RtArray),
        _ => unreachable!("array op on non-array"),
    }
}

unsafe fn handle_mut<'a>(p: *mut Object) -> &'a mut Handle {
    match &mut (*p).body {
        ObjBody::Handle(h) => &mut *(h as *mut Handle),
        _ => unreachable!("handle op on non-handle"),
    }
}

fn pair_parts(v: Value) -> Option<(Value, Value)> {
    let p = obj_ptr(v, ObjectKind::Pair)?;
    unsafe {
        match &(*p).body {
            ObjBody::Pair(pr) => Some((pr.head, pr.tail)),
            _ => None,
        }
    }
}

/// Integer value of a fixnum or bignum argument.
fn int_of(rt: &mut Runtime, location: &str, v: Value) -> VmResult<i128> {
    match v {
        Value::Fixnum(n) => Ok(n as i128),
        Value::Object(p) => unsafe {
            match &(*p).body {
                ObjBody::Bignum(b) => Ok(b.value),
                _ => Err(type_unwind(rt, location, "an integer", v)),
            }
        },
        _ => Err(type_unwind(rt, location, "an integer", v)),
    }
}

fn overflow_unwind(rt: &mut Runtime, location: &str) -> Unwind {
    let ct = rt.conditions.rt_bignum_conversion_error;
    condition::error_unwind(rt, ct, "integer overflow", location, Value::Nil)
}

fn prim_add(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let mut acc: i128 = 0;
    for &a in args {
        let n = int_of(rt, "+", a)?;
        acc = acc.checked_add(n).ok_or_else(|| overflow_unwind(rt, "+"))?;
    }
    Ok(rt.make_integer(acc))
}

fn prim_sub(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let first = int_of(rt, "-", args[0])?;
    if args.len() == 1 {
        return Ok(rt.make_integer(-first));
    }
    let mut acc = first;
    for &a in &args[1..] {
        let n = int_of(rt, "-", a)?;
        acc = acc.checked_sub(n).ok_or_else(|| overflow_unwind(rt, "-"))?;
    }
    Ok(rt.make_integer(acc))
}

fn prim_mul(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let mut acc: i128 = 1;
    for &a in args {
        let n = int_of(rt, "*", a)?;
        acc = acc.checked_mul(n).ok_or_else(|| overflow_unwind(rt, "*"))?;
    }
    Ok(rt.make_integer(acc))
}

fn divide_by_zero(rt: &mut Runtime) -> Unwind {
    let ct = rt.conditions.rt_divide_by_zero_error;
    let c = condition::simple_error(rt, ct, "divide by zero", "/", Value::Nil);
    Unwind::Raise(RaisedCondition {
        continuable: true,
        condition: c,
    })
}

fn prim_div(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let first = int_of(rt, "/", args[0])?;
    if args.len() == 1 {
        if first == 0 {
            return Err(divide_by_zero(rt));
        }
        return Ok(rt.make_integer(1 / first));
    }
    let mut acc = first;
    for &a in &args[1..] {
        let n = int_of(rt, "/", a)?;
        if n == 0 {
            return Err(divide_by_zero(rt));
        }
        acc /= n;
    }
    Ok(rt.make_integer(acc))
}

fn prim_expt(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let base = int_of(rt, "expt", args[0])?;
    let exp = int_of(rt, "expt", args[1])?;
    if exp < 0 {
        return Err(type_unwind(rt, "expt", "a non-negative power", args[1]));
    }
    let mut acc: i128 = 1;
    let mut b = base;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            acc = acc.checked_mul(b).ok_or_else(|| overflow_unwind(rt, "expt"))?;
        }
        e >>= 1;
        if e > 0 {
            b = b.checked_mul(b).ok_or_else(|| overflow_unwind(rt, "expt"))?;
        }
    }
    Ok(rt.make_integer(acc))
}

fn compare_chain(
    rt: &mut Runtime,
    location: &str,
    args: &[Value],
    ok: fn(i128, i128) -> bool,
) -> VmResult<Value> {
    let mut prev = int_of(rt, location, args[0])?;
    for &a in &args[1..] {
        let n = int_of(rt, location, a)?;
        if !ok(prev, n) {
            return Ok(Value::False);
        }
        prev = n;
    }
    Ok(Value::True)
}

fn prim_lt(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    compare_chain(rt, "<", args, |a, b| a < b)
}

fn prim_num_eq(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    compare_chain(rt, "=", args, |a, b| a == b)
}

fn prim_gt(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    compare_chain(rt, ">", args, |a, b| a > b)
}

fn prim_cons(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(rt.cons(args[0], args[1]))
}

fn prim_head(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    match pair_parts(args[0]) {
        Some((h, _)) => Ok(h),
        None => Err(type_unwind(rt, "head", "a pair", args[0])),
    }
}

fn prim_tail(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    match pair_parts(args[0]) {
        Some((_, t)) => Ok(t),
        None => Err(type_unwind(rt, "tail", "a pair", args[0])),
    }
}

fn prim_list(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let mut out = Value::Nil;
    for &a in args.iter().rev() {
        out = rt.cons(a, out);
    }
    Ok(out)
}

fn list_len(rt: &mut Runtime, location: &str, mut v: Value) -> VmResult<usize> {
    let mut n = 0;
    loop {
        match v {
            Value::Nil => return Ok(n),
            _ => match pair_parts(v) {
                Some((_, t)) => {
                    n += 1;
                    v = t;
                }
                None => return Err(type_unwind(rt, location, "a proper list", v)),
            },
        }
    }
}

fn prim_length(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let n = list_len(rt, "length", args[0])?;
    Ok(Value::Fixnum(n as i64))
}

fn prim_append(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    // left is copied, right is shared
    let mut items = Vec::new();
    let mut v = args[0];
    loop {
        match v {
            Value::Nil => break,
            _ => match pair_parts(v) {
                Some((h, t)) => {
                    items.push(h);
                    v = t;
                }
                None => return Err(type_unwind(rt, "append", "a proper list", args[0])),
            },
        }
    }
    let mut out = args[1];
    for &h in items.iter().rev() {
        out = rt.cons(h, out);
    }
    Ok(out)
}

fn prim_eqp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(args[0] == args[1]))
}

fn prim_equalp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(values_equal(args[0], args[1])))
}

fn prim_not(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(!is_truthy(args[0])))
}

fn copy_value(
    rt: &mut Runtime,
    v: Value,
    deep: bool,
    seen: &mut Vec<(*mut Object, Value)>,
) -> Value {
    let p = match v {
        Value::Object(p) => p,
        _ => return v,
    };
    if let Some((_, copied)) = seen.iter().find(|(o, _)| *o == p) {
        return *copied;
    }
    unsafe {
        match &(*p).body {
            ObjBody::Pair(pr) => {
                let (h0, t0) = (pr.head, pr.tail);
                let new = rt.cons(Value::Nil, Value::Nil);
                seen.push((p, new));
                let h = if deep { copy_value(rt, h0, deep, seen) } else { h0 };
                let t = if deep { copy_value(rt, t0, deep, seen) } else { t0 };
                if let Value::Object(np) = new {
                    if let ObjBody::Pair(npr) = &mut (*np).body {
                        npr.head = h;
                        npr.tail = t;
                    }
                }
                new
            }
            ObjBody::Array(a) => {
                let used = a.used;
                let cap = a.capacity();
                let elems: Vec<Value> = a.as_slice().to_vec();
                let new = rt.alloc(
                    ObjBody::Array(crate::array::RtArray::with_capacity(cap)),
                    None,
                );
                seen.push((p, new));
                if let Value::Object(np) = new {
                    for (i, &e) in elems.iter().enumerate() {
                        let e = if deep { copy_value(rt, e, deep, seen) } else { e };
                        array_mut(np).insert(i as i64, e);
                    }
                    debug_assert_eq!(array_mut(np).used, used);
                }
                new
            }
            ObjBody::Str(_) | ObjBody::Substring(_) => {
                let bytes = string_bytes(p).to_vec();
                rt.alloc(
                    ObjBody::Str(crate::strings::RtString::from_bytes(bytes)),
                    None,
                )
            }
            ObjBody::Bitset(b) => rt.alloc(ObjBody::Bitset(b.copy()), None),
            ObjBody::StructInstance(si) => {
                let stype = si.stype;
                let fields: Vec<Value> = si.fields.clone();
                let new = rt.make_struct_instance(stype, &[]);
                seen.push((p, new));
                for (i, &f) in fields.iter().enumerate() {
                    let f = if deep { copy_value(rt, f, deep, seen) } else { f };
                    instance_set_direct(new, i, f);
                }
                new
            }
            _ => v,
        }
    }
}

fn prim_copy(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let deep = {
        let shallow_sym = rt.intern("shallow");
        let deep_sym = rt.intern("deep");
        if args[1] == deep_sym {
            true
        } else if args[1] == shallow_sym {
            false
        } else {
            return Err(type_unwind(rt, "copy", "'shallow or 'deep", args[1]));
        }
    };
    let mut seen = Vec::new();
    Ok(copy_value(rt, args[0], deep, &mut seen))
}

fn prim_pairp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(pair_parts(args[0]).is_some()))
}

fn prim_nullp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(args[0] == Value::Nil))
}

fn prim_symbolp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(obj_ptr(args[0], ObjectKind::Symbol).is_some()))
}

fn prim_stringp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(
        obj_ptr(args[0], ObjectKind::Str).is_some()
            || obj_ptr(args[0], ObjectKind::Substring).is_some(),
    ))
}

fn prim_fixnump(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(matches!(args[0], Value::Fixnum(_))))
}

fn prim_charp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(matches!(args[0], Value::Char(_))))
}

fn prim_booleanp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(matches!(args[0], Value::True | Value::False)))
}

fn prim_arrayp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(obj_ptr(args[0], ObjectKind::Array).is_some()))
}

fn prim_hashp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(obj_ptr(args[0], ObjectKind::Hash).is_some()))
}

fn prim_procedurep(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(
        obj_ptr(args[0], ObjectKind::Closure).is_some()
            || obj_ptr(args[0], ObjectKind::Primitive).is_some()
            || obj_ptr(args[0], ObjectKind::Continuation).is_some(),
    ))
}

fn prim_eofp(_rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(args[0] == Value::Eof))
}

fn fixnum_arg(rt: &mut Runtime, location: &str, v: Value) -> VmResult<i64> {
    match v {
        Value::Fixnum(n) => Ok(n),
        _ => Err(type_unwind(rt, location, "a fixnum", v)),
    }
}

fn prim_make_array(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let cap = fixnum_arg(rt, "make-array", args[0])?;
    if cap < 0 {
        return Err(type_unwind(rt, "make-array", "a non-negative capacity", args[0]));
    }
    Ok(rt.alloc(
        ObjBody::Array(crate::array::RtArray::with_capacity(cap as usize)),
        None,
    ))
}

fn array_arg(rt: &mut Runtime, location: &str, v: Value) -> VmResult<*mut Object> {
    obj_ptr(v, ObjectKind::Array).ok_or_else(|| type_unwind(rt, location, "an array", v))
}

fn array_bounds_unwind(rt: &mut Runtime, location: &str, index: Value) -> Unwind {
    let ct = rt.conditions.rt_array_bounds_error;
    let c = condition::simple_error(rt, ct, "index out of bounds", location, Value::Nil);
    unsafe {
        instance_set_direct(c, 3, index);
    }
    Unwind::Raise(RaisedCondition {
        continuable: false,
        condition: c,
    })
}

fn prim_array_ref(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = array_arg(rt, "array-ref", args[0])?;
    let i = fixnum_arg(rt, "array-ref", args[1])?;
    unsafe {
        match array_mut(p).get(i) {
            Some(v) => Ok(v),
            None => Err(array_bounds_unwind(rt, "array-ref", args[1])),
        }
    }
}

fn prim_array_set(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = array_arg(rt, "array-set!", args[0])?;
    let i = fixnum_arg(rt, "array-set!", args[1])?;
    unsafe {
        array_mut(p).insert(i, args[2]);
    }
    Ok(Value::Unspec)
}

fn prim_array_push(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = array_arg(rt, "array-push!", args[0])?;
    unsafe {
        array_mut(p).push(args[1]);
    }
    Ok(Value::Unspec)
}

fn prim_array_pop(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = array_arg(rt, "array-pop!", args[0])?;
    unsafe { Ok(array_mut(p).pop()) }
}

fn prim_array_length(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = array_arg(rt, "array-length", args[0])?;
    unsafe { Ok(Value::Fixnum(array_mut(p).len() as i64)) }
}

fn prim_array_to_list(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = array_arg(rt, "array->list", args[0])?;
    let elems: Vec<Value> = unsafe { array_mut(p).as_slice().to_vec() };
    let mut out = Value::Nil;
    for &e in elems.iter().rev() {
        out = rt.cons(e, out);
    }
    Ok(out)
}

fn prim_make_hash(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let fns = match args.len() {
        0 => HashFns::Identity,
        1 => {
            let equal_sym = rt.intern("equal");
            if args[0] == equal_sym {
                HashFns::Equal
            } else {
                return Err(type_unwind(rt, "make-hash", "'equal", args[0]));
            }
        }
        _ => HashFns::Custom {
            hashf: args[0],
            eqf: args[1],
        },
    };
    Ok(rt.alloc(ObjBody::Hash(RtHash::new(fns)), None))
}

fn hash_arg(rt: &mut Runtime, location: &str, v: Value) -> VmResult<*mut Object> {
    obj_ptr(v, ObjectKind::Hash).ok_or_else(|| type_unwind(rt, location, "a hash", v))
}

fn prim_hash_set(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = hash_arg(rt, "hash-set!", args[0])?;
    hash::hash_put(rt, p, args[1], args[2])?;
    Ok(Value::Unspec)
}

fn prim_hash_ref(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = hash_arg(rt, "hash-ref", args[0])?;
    match hash::hash_get(rt, p, args[1])? {
        Some(v) => Ok(v),
        None => {
            if let Some(&default) = args.get(2) {
                return Ok(default);
            }
            let ct = rt.conditions.rt_hash_key_not_found_error;
            let c = condition::simple_error(rt, ct, "key not found", "hash-ref", Value::Nil);
            unsafe {
                instance_set_direct(c, 3, args[1]);
            }
            Err(Unwind::Raise(RaisedCondition {
                continuable: false,
                condition: c,
            }))
        }
    }
}

fn prim_hash_delete(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = hash_arg(rt, "hash-delete!", args[0])?;
    hash::hash_delete(rt, p, args[1])?;
    Ok(Value::Unspec)
}

fn prim_hash_existsp(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = hash_arg(rt, "hash-exists?", args[0])?;
    Ok(make_boolean(hash::hash_get(rt, p, args[1])?.is_some()))
}

fn hash_pairs(p: *mut Object) -> Vec<(Value, Value)> {
    unsafe {
        match &(*p).body {
            ObjBody::Hash(h) => h.iter().collect(),
            _ => Vec::new(),
        }
    }
}

fn prim_hash_keys(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = hash_arg(rt, "hash-keys", args[0])?;
    let mut out = Value::Nil;
    for (k, _) in hash_pairs(p) {
        out = rt.cons(k, out);
    }
    Ok(out)
}

fn prim_hash_values(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = hash_arg(rt, "hash-values", args[0])?;
    let mut out = Value::Nil;
    for (_, v) in hash_pairs(p) {
        out = rt.cons(v, out);
    }
    Ok(out)
}

fn prim_hash_size(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = hash_arg(rt, "hash-size", args[0])?;
    unsafe {
        match &(*p).body {
            ObjBody::Hash(h) => Ok(Value::Fixnum(h.len() as i64)),
            _ => unreachable!(),
        }
    }
}

fn string_arg(rt: &mut Runtime, location: &str, v: Value) -> VmResult<*mut Object> {
    obj_ptr(v, ObjectKind::Str)
        .or_else(|| obj_ptr(v, ObjectKind::Substring))
        .ok_or_else(|| type_unwind(rt, location, "a string", v))
}

fn prim_string_length(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = string_arg(rt, "string-length", args[0])?;
    unsafe { Ok(Value::Fixnum(string_bytes(p).len() as i64)) }
}

fn prim_string_ref(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = string_arg(rt, "string-ref", args[0])?;
    let i = fixnum_arg(rt, "string-ref", args[1])?;
    unsafe {
        let bytes = string_bytes(p);
        if i < 0 || i as usize >= bytes.len() {
            return Err(array_bounds_unwind(rt, "string-ref", args[1]));
        }
        Ok(Value::Char(bytes[i as usize] as char))
    }
}

fn prim_substring(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = string_arg(rt, "substring", args[0])?;
    let start = fixnum_arg(rt, "substring", args[1])?;
    let end = fixnum_arg(rt, "substring", args[2])?;
    unsafe {
        let len = string_bytes(p).len() as i64;
        if start < 0 || end < start || end > len {
            let ct = rt.conditions.runtime_error;
            return Err(condition::error_unwind(
                rt,
                ct,
                &format!("substring [{}, {}) out of range ({})", start, end, len),
                "substring",
                Value::Nil,
            ));
        }
        // views always root the owning buffer, not an intermediate view
        let (parent, base) = match &(*p).body {
            ObjBody::Substring(ss) => (ss.parent, ss.offset),
            _ => (args[0], 0),
        };
        Ok(rt.alloc(
            ObjBody::Substring(Substring {
                parent,
                offset: base + start as usize,
                len: (end - start) as usize,
            }),
            None,
        ))
    }
}

fn prim_string_to_symbol(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = string_arg(rt, "string->symbol", args[0])?;
    let s = unsafe { String::from_utf8_lossy(string_bytes(p)).into_owned() };
    Ok(rt.intern(&s))
}

fn prim_symbol_to_string(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    match obj_ptr(args[0], ObjectKind::Symbol) {
        Some(p) => unsafe {
            match &(*p).body {
                ObjBody::Symbol(s) => {
                    let name = s.name.to_string();
                    Ok(rt.make_string(&name))
                }
                _ => unreachable!(),
            }
        },
        None => Err(type_unwind(rt, "symbol->string", "a symbol", args[0])),
    }
}

fn prim_as_string(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let s = as_string(args[0]);
    Ok(rt.make_string(&s))
}

fn prim_make_struct_type(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    if obj_ptr(args[0], ObjectKind::Symbol).is_none() {
        return Err(type_unwind(rt, "make-struct-type", "a symbol", args[0]));
    }
    if args[1] != Value::Nil && obj_ptr(args[1], ObjectKind::StructType).is_none() {
        return Err(type_unwind(rt, "make-struct-type", "a struct type or #n", args[1]));
    }
    let mut fields = Vec::new();
    let mut v = args[2];
    loop {
        match v {
            Value::Nil => break,
            _ => match pair_parts(v) {
                Some((h, t)) => {
                    if obj_ptr(h, ObjectKind::Symbol).is_none() {
                        return Err(type_unwind(rt, "make-struct-type", "a field symbol", h));
                    }
                    fields.push(h);
                    v = t;
                }
                None => {
                    return Err(type_unwind(rt, "make-struct-type", "a list of fields", args[2]))
                }
            },
        }
    }
    Ok(rt.make_struct_type(args[0], args[1], fields))
}

fn struct_type_arg(rt: &mut Runtime, location: &str, v: Value) -> VmResult<Value> {
    if obj_ptr(v, ObjectKind::StructType).is_none() {
        return Err(type_unwind(rt, location, "a struct type", v));
    }
    Ok(v)
}

fn prim_make_struct_instance(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let stype = struct_type_arg(rt, "make-struct-instance", args[0])?;
    Ok(rt.make_struct_instance(stype, &args[1..]))
}

fn field_lookup(rt: &mut Runtime, location: &str, inst: Value, field: Value) -> VmResult<usize> {
    if obj_ptr(inst, ObjectKind::StructInstance).is_none() {
        return Err(type_unwind(rt, location, "a struct instance", inst));
    }
    let stype = unsafe { instance_type(inst) };
    match unsafe { field_index(stype, field) } {
        Some(i) => Ok(i),
        None => {
            let ct = rt.conditions.runtime_error;
            let shown = as_string(field);
            let d = rt.make_string(&shown);
            Err(condition::error_unwind(rt, ct, "no such field", location, d))
        }
    }
}

fn prim_struct_instance_ref(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let i = field_lookup(rt, "struct-instance-ref", args[0], args[1])?;
    unsafe { Ok(instance_ref_direct(args[0], i)) }
}

fn prim_struct_instance_set(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let i = field_lookup(rt, "struct-instance-set!", args[0], args[1])?;
    unsafe {
        instance_set_direct(args[0], i, args[2]);
    }
    Ok(Value::Unspec)
}

fn prim_struct_instance_isap(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let stype = struct_type_arg(rt, "struct-instance-isa?", args[1])?;
    Ok(make_boolean(unsafe { instance_isa(args[0], stype) }))
}

fn condition_arg(rt: &mut Runtime, location: &str, v: Value) -> VmResult<Value> {
    if !condition::is_condition(rt, v) {
        return Err(type_unwind(rt, location, "a condition", v));
    }
    Ok(v)
}

fn prim_conditionp(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    Ok(make_boolean(condition::is_condition(rt, args[0])))
}

fn prim_condition_isap(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    condition_arg(rt, "condition-isa?", args[0])?;
    struct_type_arg(rt, "condition-isa?", args[1])?;
    Ok(make_boolean(unsafe { instance_isa(args[0], args[1]) }))
}

fn prim_condition_ref(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    condition_arg(rt, "condition-ref", args[0])?;
    let i = field_lookup(rt, "condition-ref", args[0], args[1])?;
    unsafe { Ok(instance_ref_direct(args[0], i)) }
}

fn prim_condition_set(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    condition_arg(rt, "condition-set!", args[0])?;
    let i = field_lookup(rt, "condition-set!", args[0], args[1])?;
    unsafe {
        instance_set_direct(args[0], i, args[2]);
    }
    Ok(Value::Unspec)
}

fn prim_make_condition(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let stype = struct_type_arg(rt, "make-condition", args[0])?;
    Ok(condition::make_condition(rt, stype, &args[1..]))
}

fn prim_raise(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let cond = condition_arg(rt, "raise", args[1])?;
    Err(Unwind::Raise(RaisedCondition {
        continuable: is_truthy(args[0]),
        condition: cond,
    }))
}

fn prim_set_default_handler(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    struct_type_arg(rt, "set-default-handler!", args[0])?;
    condition::set_default_handler(rt, args[0], args[1]);
    Ok(Value::Unspec)
}

fn prim_clear_default_handler(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    struct_type_arg(rt, "clear-default-handler!", args[0])?;
    condition::clear_default_handler(rt, args[0]);
    Ok(Value::Unspec)
}

fn prim_default_condition_handler(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    condition::default_handler_impl(rt, is_truthy(args[0]), args[1])
}

fn prim_restart_condition_handler(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    condition::restart_handler_impl(rt, is_truthy(args[0]), args[1])
}

fn prim_reset_condition_handler(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    condition::reset_handler_impl(rt, is_truthy(args[0]), args[1])
}

fn prim_gc_collect(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    gc::collect(rt);
    Ok(Value::Unspec)
}

fn prim_gc_stats(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    let cycles = Value::Fixnum(rt.heap.stats.cycles as i64);
    let freed = Value::Fixnum(rt.heap.stats.total_freed_bytes as i64);
    let live = Value::Fixnum(rt.heap.live_bytes() as i64);
    let tail = rt.cons(live, Value::Nil);
    let tail = rt.cons(freed, tail);
    Ok(rt.cons(cycles, tail))
}

fn handle_arg(rt: &mut Runtime, location: &str, v: Value) -> VmResult<*mut Object> {
    obj_ptr(v, ObjectKind::Handle).ok_or_else(|| type_unwind(rt, location, "a handle", v))
}

fn closed_unwind(rt: &mut Runtime, location: &str, h: Value) -> Unwind {
    let ct = rt.conditions.io_closed_error;
    let c = condition::simple_error(rt, ct, "handle is closed", location, Value::Nil);
    unsafe {
        instance_set_direct(c, 3, h);
    }
    Unwind::Raise(RaisedCondition {
        continuable: false,
        condition: c,
    })
}

fn io_unwind(rt: &mut Runtime, location: &str, e: std::io::Error) -> Unwind {
    let ct = rt.conditions.system_error;
    let c = condition::simple_error(rt, ct, &e.to_string(), location, Value::Nil);
    if let Some(errno) = e.raw_os_error() {
        unsafe {
            instance_set_direct(c, 3, Value::Fixnum(errno as i64));
        }
    }
    Unwind::Raise(RaisedCondition {
        continuable: false,
        condition: c,
    })
}

fn prim_open_input_string(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = string_arg(rt, "open-input-string", args[0])?;
    let s = unsafe { String::from_utf8_lossy(string_bytes(p)).into_owned() };
    Ok(rt.alloc(
        ObjBody::Handle(Handle::new("input string", Box::new(StringInputOps::new(&s)))),
        None,
    ))
}

fn prim_open_output_string(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    Ok(rt.alloc(
        ObjBody::Handle(Handle::new("output string", Box::new(StringOutputOps::new()))),
        None,
    ))
}

fn prim_get_output_string(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = handle_arg(rt, "get-output-string", args[0])?;
    let s = unsafe {
        match handle_mut(p).output_string() {
            Some(s) => s,
            None => {
                return Err(type_unwind(
                    rt,
                    "get-output-string",
                    "an output string handle",
                    args[0],
                ))
            }
        }
    };
    Ok(rt.make_string(&s))
}

fn prim_open_input_file(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = string_arg(rt, "open-input-file", args[0])?;
    let name = unsafe { String::from_utf8_lossy(string_bytes(p)).into_owned() };
    match FileOps::open(&name) {
        Ok(ops) => Ok(rt.alloc(
            ObjBody::Handle(Handle::new(&name, Box::new(ops))),
            Some(Finalizer::CloseHandle),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let ct = rt.conditions.io_no_such_file_error;
            let c = condition::simple_error(rt, ct, "no such file", "open-input-file", Value::Nil);
            unsafe {
                instance_set_direct(c, 3, args[0]);
            }
            Err(Unwind::Raise(RaisedCondition {
                continuable: false,
                condition: c,
            }))
        }
        Err(e) => Err(io_unwind(rt, "open-input-file", e)),
    }
}

fn optional_handle(
    rt: &mut Runtime,
    location: &str,
    args: &[Value],
    at: usize,
    default: Value,
) -> VmResult<(*mut Object, Value)> {
    let v = args.get(at).copied().unwrap_or(default);
    let p = handle_arg(rt, location, v)?;
    if unsafe { handle_mut(p).is_closed() } {
        return Err(closed_unwind(rt, location, v));
    }
    Ok((p, v))
}

fn prim_read_char(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let default = rt.thread.regs.input;
    let (p, _) = optional_handle(rt, "read-char", args, 0, default)?;
    match unsafe { handle_mut(p).getc() } {
        Ok(Some(b)) => Ok(Value::Char(b as char)),
        Ok(None) => Ok(Value::Eof),
        Err(e) => Err(io_unwind(rt, "read-char", e)),
    }
}

fn prim_peek_char(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let default = rt.thread.regs.input;
    let (p, _) = optional_handle(rt, "peek-char", args, 0, default)?;
    match unsafe { handle_mut(p).getc() } {
        Ok(Some(b)) => {
            unsafe {
                handle_mut(p).ungetc(b);
            }
            Ok(Value::Char(b as char))
        }
        Ok(None) => Ok(Value::Eof),
        Err(e) => Err(io_unwind(rt, "peek-char", e)),
    }
}

fn prim_write_char(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let ch = match args[0] {
        Value::Char(c) => c,
        _ => return Err(type_unwind(rt, "write-char", "a character", args[0])),
    };
    let default = rt.thread.regs.output;
    let (p, _) = optional_handle(rt, "write-char", args, 1, default)?;
    let mut buf = [0u8; 4];
    let s = ch.encode_utf8(&mut buf);
    unsafe {
        handle_mut(p)
            .puts(s.as_bytes())
            .map_err(|e| io_unwind(rt, "write-char", e))?;
    }
    Ok(Value::Unspec)
}

fn prim_display(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let default = rt.thread.regs.output;
    let (p, _) = optional_handle(rt, "display", args, 1, default)?;
    unsafe {
        handle_mut(p)
            .print(args[0])
            .map_err(|e| io_unwind(rt, "display", e))?;
    }
    Ok(Value::Unspec)
}

fn prim_newline(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let default = rt.thread.regs.output;
    let (p, _) = optional_handle(rt, "newline", args, 0, default)?;
    unsafe {
        handle_mut(p)
            .putc(b'\n')
            .map_err(|e| io_unwind(rt, "newline", e))?;
    }
    Ok(Value::Unspec)
}

fn prim_close_handle(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = handle_arg(rt, "close-handle", args[0])?;
    unsafe {
        handle_mut(p).close();
    }
    Ok(Value::Unspec)
}

fn prim_handle_line(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = handle_arg(rt, "handle-line", args[0])?;
    unsafe { Ok(Value::Fixnum(handle_mut(p).line as i64)) }
}

fn prim_handle_pos(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = handle_arg(rt, "handle-pos", args[0])?;
    unsafe { Ok(Value::Fixnum(handle_mut(p).pos as i64)) }
}

fn prim_handle_name(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    let p = handle_arg(rt, "handle-name", args[0])?;
    let name = unsafe { handle_mut(p).name.clone() };
    Ok(rt.make_string(&name))
}

fn prim_current_module(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    Ok(rt.thread.regs.module)
}

fn prim_current_input(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    Ok(rt.thread.regs.input)
}

fn prim_current_output(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    Ok(rt.thread.regs.output)
}

fn prim_current_error(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    Ok(rt.thread.regs.error)
}

fn prim_find_module(rt: &mut Runtime, args: &[Value]) -> VmResult<Value> {
    if obj_ptr(args[0], ObjectKind::Symbol).is_none() {
        return Err(type_unwind(rt, "find-module", "a symbol", args[0]));
    }
    match rt.find_module(args[0]) {
        Some(m) => Ok(m),
        None => {
            let ct = rt.conditions.rt_module_unbound_error;
            let c = condition::simple_error(rt, ct, "no such module", "find-module", Value::Nil);
            unsafe {
                instance_set_direct(c, 3, args[0]);
            }
            Err(Unwind::Raise(RaisedCondition {
                continuable: false,
                condition: c,
            }))
        }
    }
}

fn prim_seconds_get(rt: &mut Runtime, _args: &[Value]) -> VmResult<Value> {
    Ok(Value::Fixnum(rt.elapsed_seconds()))
}
