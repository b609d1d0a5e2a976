use phf::phf_map;

use crate::runtime::Runtime;
use crate::signals;
use crate::struct_type::{instance_isa, instance_ref_direct, instance_type};
use crate::value::{as_fixnum, as_string, make_boolean, Value};
use crate::vm;

/// A condition in flight: the struct-instance plus whether the handler
/// may return a value (vs. being obliged to transfer non-locally).
#[derive(Debug, Clone, Copy)]
pub struct RaisedCondition {
    pub continuable: bool,
    pub condition: Value,
}

/// Non-local control leaving an opcode or primitive.
#[derive(Debug)]
pub enum Unwind {
    /// A condition looking for a trap.
    Raise(RaisedCondition),
    /// A continuation overwrote the thread; unwind native frames back
    /// to the top of the dispatch loop.
    Restore,
    /// No recovery path remains.
    Fatal(String),
}

pub type VmResult<T> = Result<T, Unwind>;

/// Field indices shared by the whole `^idio-error` subtree.
pub const SI_MESSAGE: usize = 0;
pub const SI_LOCATION: usize = 1;
pub const SI_DETAIL: usize = 2;
/// `^read-error` extends with these.
pub const SI_READ_LINE: usize = 3;
pub const SI_READ_POSITION: usize = 4;
/// `^evaluation-error`.
pub const SI_EVAL_EXPR: usize = 3;
/// `^system-error`.
pub const SI_ERRNO: usize = 3;
/// `^rt-signal` stands alone.
pub const SI_SIGNAL_SIGNUM: usize = 0;

macro_rules! condition_table {
    ($($field:ident),* $(,)?) => {
        /// Every built-in condition type, by identity.  All of them are
        /// process-lifetime GC roots.
        pub struct ConditionTable {
            $(pub $field: Value,)*
        }

        impl Default for ConditionTable {
            fn default() -> Self {
                ConditionTable { $($field: Value::Nil,)* }
            }
        }
    };
}

condition_table!(
    condition,
    message,
    error,
    idio_error,
    io_error,
    io_handle_error,
    io_read_error,
    io_write_error,
    io_closed_error,
    io_filename_error,
    io_malformed_filename_error,
    io_file_protection_error,
    io_file_is_read_only_error,
    io_file_already_exists_error,
    io_no_such_file_error,
    read_error,
    evaluation_error,
    system_error,
    static_error,
    st_variable_error,
    st_variable_type_error,
    st_function_error,
    st_function_arity_error,
    runtime_error,
    rt_parameter_type_error,
    rt_const_parameter_error,
    rt_parameter_nil_error,
    rt_variable_error,
    rt_variable_unbound_error,
    rt_dynamic_variable_error,
    rt_dynamic_variable_unbound_error,
    rt_environ_variable_error,
    rt_environ_variable_unbound_error,
    rt_computed_variable_error,
    rt_computed_variable_no_accessor_error,
    rt_function_error,
    rt_function_arity_error,
    rt_module_error,
    rt_module_unbound_error,
    rt_module_symbol_unbound_error,
    rt_array_bounds_error,
    rt_hash_key_not_found_error,
    rt_divide_by_zero_error,
    rt_bignum_conversion_error,
    rt_fixnum_conversion_error,
    rt_command_status_error,
    rt_signal,
);

fn define(rt: &mut Runtime, name: &str, parent: Value, fields: &[&str]) -> Value {
    let name_sym = rt.intern(name);
    let field_syms: Vec<Value> = fields.iter().map(|f| rt.intern(f)).collect();
    let st = rt.make_struct_type(name_sym, parent, field_syms);
    rt.heap.protect_auto(st);
    rt.define_global(name_sym, st);
    st
}

/// Build the SRFI-35-ish lattice.
pub fn init(rt: &mut Runtime) {
    let condition = define(rt, "^condition", Value::Nil, &[]);
    let message = define(rt, "^message", condition, &["message"]);
    let error = define(rt, "^error", condition, &[]);
    let idio_error = define(rt, "^idio-error", error, &["message", "location", "detail"]);

    let io_error = define(rt, "^i/o-error", idio_error, &[]);
    let io_handle_error = define(rt, "^i/o-handle-error", io_error, &["handle"]);
    let io_read_error = define(rt, "^i/o-read-error", io_handle_error, &[]);
    let io_write_error = define(rt, "^i/o-write-error", io_handle_error, &[]);
    let io_closed_error = define(rt, "^i/o-closed-error", io_handle_error, &[]);
    let io_filename_error = define(rt, "^i/o-filename-error", io_error, &["filename"]);
    let io_malformed_filename_error =
        define(rt, "^i/o-malformed-filename-error", io_filename_error, &[]);
    let io_file_protection_error =
        define(rt, "^i/o-file-protection-error", io_filename_error, &[]);
    let io_file_is_read_only_error =
        define(rt, "^i/o-file-is-read-only-error", io_filename_error, &[]);
    let io_file_already_exists_error =
        define(rt, "^i/o-file-already-exists-error", io_filename_error, &[]);
    let io_no_such_file_error = define(rt, "^i/o-no-such-file-error", io_filename_error, &[]);

    let read_error = define(rt, "^read-error", idio_error, &["line", "position"]);
    let evaluation_error = define(rt, "^evaluation-error", idio_error, &["expr"]);
    let system_error = define(rt, "^system-error", idio_error, &["errno"]);

    let static_error = define(rt, "^static-error", idio_error, &[]);
    let st_variable_error = define(rt, "^st-variable-error", static_error, &["name"]);
    let st_variable_type_error = define(rt, "^st-variable-type-error", st_variable_error, &[]);
    let st_function_error = define(rt, "^st-function-error", static_error, &[]);
    let st_function_arity_error = define(rt, "^st-function-arity-error", st_function_error, &[]);

    let runtime_error = define(rt, "^runtime-error", idio_error, &[]);
    let rt_parameter_type_error = define(rt, "^rt-parameter-type-error", runtime_error, &[]);
    let rt_const_parameter_error = define(rt, "^rt-const-parameter-error", runtime_error, &[]);
    let rt_parameter_nil_error = define(rt, "^rt-parameter-nil-error", runtime_error, &[]);
    let rt_variable_error = define(rt, "^rt-variable-error", runtime_error, &["name"]);
    let rt_variable_unbound_error =
        define(rt, "^rt-variable-unbound-error", rt_variable_error, &[]);
    let rt_dynamic_variable_error =
        define(rt, "^rt-dynamic-variable-error", rt_variable_error, &[]);
    let rt_dynamic_variable_unbound_error = define(
        rt,
        "^rt-dynamic-variable-unbound-error",
        rt_dynamic_variable_error,
        &[],
    );
    let rt_environ_variable_error =
        define(rt, "^rt-environ-variable-error", rt_variable_error, &[]);
    let rt_environ_variable_unbound_error = define(
        rt,
        "^rt-environ-variable-unbound-error",
        rt_environ_variable_error,
        &[],
    );
    let rt_computed_variable_error =
        define(rt, "^rt-computed-variable-error", rt_variable_error, &[]);
    let rt_computed_variable_no_accessor_error = define(
        rt,
        "^rt-computed-variable-no-accessor-error",
        rt_computed_variable_error,
        &[],
    );
    let rt_function_error = define(rt, "^rt-function-error", runtime_error, &[]);
    let rt_function_arity_error =
        define(rt, "^rt-function-arity-error", rt_function_error, &[]);
    let rt_module_error = define(rt, "^rt-module-error", runtime_error, &["module"]);
    let rt_module_unbound_error = define(rt, "^rt-module-unbound-error", rt_module_error, &[]);
    let rt_module_symbol_unbound_error = define(
        rt,
        "^rt-module-symbol-unbound-error",
        rt_module_error,
        &["symbol"],
    );
    let rt_array_bounds_error =
        define(rt, "^rt-array-bounds-error", runtime_error, &["index"]);
    let rt_hash_key_not_found_error =
        define(rt, "^rt-hash-key-not-found-error", runtime_error, &["key"]);
    let rt_divide_by_zero_error = define(rt, "^rt-divide-by-zero-error", runtime_error, &[]);
    let rt_bignum_conversion_error =
        define(rt, "^rt-bignum-conversion-error", runtime_error, &["bignum"]);
    let rt_fixnum_conversion_error =
        define(rt, "^rt-fixnum-conversion-error", runtime_error, &["fixnum"]);
    let rt_command_status_error =
        define(rt, "^rt-command-status-error", runtime_error, &["status"]);

    let rt_signal = define(rt, "^rt-signal", error, &["signum"]);

    rt.conditions = ConditionTable {
        condition,
        message,
        error,
        idio_error,
        io_error,
        io_handle_error,
        io_read_error,
        io_write_error,
        io_closed_error,
        io_filename_error,
        io_malformed_filename_error,
        io_file_protection_error,
        io_file_is_read_only_error,
        io_file_already_exists_error,
        io_no_such_file_error,
        read_error,
        evaluation_error,
        system_error,
        static_error,
        st_variable_error,
        st_variable_type_error,
        st_function_error,
        st_function_arity_error,
        runtime_error,
        rt_parameter_type_error,
        rt_const_parameter_error,
        rt_parameter_nil_error,
        rt_variable_error,
        rt_variable_unbound_error,
        rt_dynamic_variable_error,
        rt_dynamic_variable_unbound_error,
        rt_environ_variable_error,
        rt_environ_variable_unbound_error,
        rt_computed_variable_error,
        rt_computed_variable_no_accessor_error,
        rt_function_error,
        rt_function_arity_error,
        rt_module_error,
        rt_module_unbound_error,
        rt_module_symbol_unbound_error,
        rt_array_bounds_error,
        rt_hash_key_not_found_error,
        rt_divide_by_zero_error,
        rt_bignum_conversion_error,
        rt_fixnum_conversion_error,
        rt_command_status_error,
        rt_signal,
    };
}

pub fn is_condition(rt: &Runtime, v: Value) -> bool {
    unsafe { instance_isa(v, rt.conditions.condition) }
}

/// Instance of `ctype` with the leading fields filled from `fields` and
/// the rest nil.
pub fn make_condition(rt: &mut Runtime, ctype: Value, fields: &[Value]) -> Value {
    rt.make_struct_instance(ctype, fields)
}

/// The common three-field constructor for the `^idio-error` subtree.
pub fn simple_error(
    rt: &mut Runtime,
    ctype: Value,
    message: &str,
    location: &str,
    detail: Value,
) -> Value {
    let msg = rt.make_string(message);
    let loc = rt.make_string(location);
    rt.make_struct_instance(ctype, &[msg, loc, detail])
}

/// Build and package a non-continuable raise for `?`-style propagation
/// out of a primitive.
pub fn error_unwind(
    rt: &mut Runtime,
    ctype: Value,
    message: &str,
    location: &str,
    detail: Value,
) -> Unwind {
    let c = simple_error(rt, ctype, message, location, detail);
    Unwind::Raise(RaisedCondition {
        continuable: false,
        condition: c,
    })
}

static ERRNO_NAMES: phf::Map<i32, &'static str> = phf_map! {
    1i32 => "EPERM",
    2i32 => "ENOENT",
    3i32 => "ESRCH",
    4i32 => "EINTR",
    5i32 => "EIO",
    6i32 => "ENXIO",
    7i32 => "E2BIG",
    8i32 => "ENOEXEC",
    9i32 => "EBADF",
    10i32 => "ECHILD",
    11i32 => "EAGAIN",
    12i32 => "ENOMEM",
    13i32 => "EACCES",
    14i32 => "EFAULT",
    16i32 => "EBUSY",
    17i32 => "EEXIST",
    18i32 => "EXDEV",
    19i32 => "ENODEV",
    20i32 => "ENOTDIR",
    21i32 => "EISDIR",
    22i32 => "EINVAL",
    23i32 => "ENFILE",
    24i32 => "EMFILE",
    25i32 => "ENOTTY",
    27i32 => "EFBIG",
    28i32 => "ENOSPC",
    29i32 => "ESPIPE",
    30i32 => "EROFS",
    31i32 => "EMLINK",
    32i32 => "EPIPE",
    33i32 => "EDOM",
    34i32 => "ERANGE",
};

pub fn errno_name(errno: i32) -> String {
    match ERRNO_NAMES.get(&errno) {
        Some(n) => (*n).to_string(),
        None => format!("errno-{}", errno),
    }
}

fn type_name(sit: Value) -> String {
    unsafe {
        if let Value::Object(p) = sit {
            if let crate::objects::object::ObjBody::StructType(st) = &(*p).body {
                return as_string(st.name);
            }
        }
    }
    as_string(sit)
}

/// Render the user-visible diagnostic:
/// `<location>: <type-name>: <message>[: <detail>][ => <errno-name>]`,
/// with line/position folded into the location for read errors and the
/// offending expression for evaluation errors.
pub fn condition_report(rt: &Runtime, cond: Value) -> String {
    if !is_condition(rt, cond) {
        return format!("non-condition: {}", as_string(cond));
    }
    unsafe {
        let sit = instance_type(cond);
        let tname = type_name(sit);
        let c = &rt.conditions;

        if instance_isa(cond, c.rt_signal) {
            let signum = as_fixnum(instance_ref_direct(cond, SI_SIGNAL_SIGNUM)).unwrap_or(-1);
            return format!("{}: {}", tname, signals::name(signum as i32));
        }

        if !instance_isa(cond, c.idio_error) {
            if instance_isa(cond, c.message) {
                return format!("{}: {}", tname, as_string(instance_ref_direct(cond, 0)));
            }
            return tname;
        }

        let mut out = String::new();
        let loc = instance_ref_direct(cond, SI_LOCATION);
        if loc != Value::Nil {
            out.push_str(&as_string(loc));
            if instance_isa(cond, c.read_error) {
                out.push_str(&format!(
                    ":{}:{}",
                    as_string(instance_ref_direct(cond, SI_READ_LINE)),
                    as_string(instance_ref_direct(cond, SI_READ_POSITION))
                ));
            } else if instance_isa(cond, c.evaluation_error) {
                out.push_str(&format!(
                    ":{}",
                    as_string(instance_ref_direct(cond, SI_EVAL_EXPR))
                ));
            }
            out.push_str(": ");
        }
        out.push_str(&tname);
        let msg = instance_ref_direct(cond, SI_MESSAGE);
        if msg != Value::Nil {
            out.push_str(": ");
            out.push_str(&as_string(msg));
        }
        let detail = instance_ref_direct(cond, SI_DETAIL);
        if detail != Value::Nil {
            out.push_str(": ");
            out.push_str(&as_string(detail));
        }
        if instance_isa(cond, c.system_error) {
            if let Some(e) = as_fixnum(instance_ref_direct(cond, SI_ERRNO)) {
                out.push_str(" => ");
                out.push_str(&errno_name(e as i32));
            }
        }
        out
    }
}

/// Walk the installed traps, most recently installed first; the first
/// whose filter type is an ancestor of the condition's type gets the
/// condition.  With no match, control goes to the process-wide default
/// handler.
pub fn raise_condition(rt: &mut Runtime, continuable: bool, cond: Value) -> VmResult<Value> {
    rt.temp_roots.push(cond);
    let r = raise_inner(rt, continuable, cond);
    rt.temp_roots.pop();
    r
}

fn raise_inner(rt: &mut Runtime, continuable: bool, cond: Value) -> VmResult<Value> {
    let mut sp = rt.thread.regs.trap_sp;
    while sp >= 2 && (sp as usize) < rt.thread.stack.len() {
        let spu = sp as usize;
        let next = as_fixnum(rt.thread.stack[spu]).unwrap_or(-1);
        let filter = rt.thread.stack[spu - 1];
        let handler = rt.thread.stack[spu - 2];
        if unsafe { instance_isa(cond, filter) } {
            // a raise inside the handler resumes the walk one trap out
            let saved = rt.thread.regs.trap_sp;
            rt.thread.regs.trap_sp = next;
            let flag = make_boolean(continuable);
            let r = vm::call_value(rt, handler, &[flag, cond]);
            return match r {
                Ok(v) => {
                    rt.thread.regs.trap_sp = saved;
                    if continuable {
                        Ok(v)
                    } else {
                        // a handler for a non-continuable raise must
                        // transfer; returning is a defect
                        restart_handler_impl(rt, continuable, cond)
                    }
                }
                Err(e) => Err(e),
            };
        }
        sp = next;
    }
    default_handler_impl(rt, continuable, cond)
}

/// The process-wide handler of last resort before the meta-handlers.
pub fn default_handler_impl(
    rt: &mut Runtime,
    continuable: bool,
    cond: Value,
) -> VmResult<Value> {
    unsafe {
        if instance_isa(cond, rt.conditions.rt_signal) {
            let signum =
                as_fixnum(instance_ref_direct(cond, SI_SIGNAL_SIGNUM)).unwrap_or(-1) as i32;
            if signum == signals::SIGCHLD || signum == signals::SIGHUP {
                let line = format!("default-condition-handler: {}\n", signals::name(signum));
                rt.write_error(&line);
                return Ok(Value::Unspec);
            }
        }
    }

    let sit = unsafe { instance_type(cond) };
    if let Value::Object(p) = sit {
        if let Some(&handler) = rt.default_handlers.get(&p) {
            let flag = make_boolean(continuable);
            return vm::call_value(rt, handler, &[flag, cond]);
        }
    }

    let report = condition_report(rt, cond);
    rt.write_error(&format!("\ndefault-condition-handler: {}\n", report));

    if rt.interactive {
        // stash a debugger resume point so a later restart can come
        // back to just after the failing opcode
        let k = vm::capture_current_continuation(rt);
        let ann = rt.make_string("debugger");
        rt.krun.push((k, ann));
    }

    if continuable {
        return Ok(Value::Void);
    }
    restart_handler_impl(rt, continuable, cond)
}

/// Pop the single most recent krun entry and restore it.  The rest of
/// the krun stack stays for the next escalation; draining wholesale is
/// the reset handler's job.
pub fn restart_handler_impl(
    rt: &mut Runtime,
    continuable: bool,
    cond: Value,
) -> VmResult<Value> {
    let report = condition_report(rt, cond);
    rt.write_error(&format!("\nrestart-condition-handler: {}\n", report));

    if let Some((k, ann)) = rt.krun.pop() {
        rt.write_error(&format!(
            "restart-condition-handler: restoring {}\n",
            as_string(ann)
        ));
        return Err(vm::restore_continuation(rt, k, Value::Unspec));
    }
    reset_handler_impl(rt, continuable, cond)
}

/// Drain the krun stack and restore the bottom-most entry; with nothing
/// stashed, reset the thread wholesale and give up.
pub fn reset_handler_impl(rt: &mut Runtime, _continuable: bool, cond: Value) -> VmResult<Value> {
    let report = condition_report(rt, cond);
    rt.write_error(&format!("\nreset-condition-handler: {}\n", report));

    if !rt.krun.is_empty() {
        let (k, ann) = rt.krun[0];
        rt.krun.clear();
        rt.write_error(&format!(
            "reset-condition-handler: restoring {}\n",
            as_string(ann)
        ));
        return Err(vm::restore_continuation(rt, k, Value::Unspec));
    }

    rt.thread.reset();
    Err(Unwind::Fatal(format!(
        "reset-condition-handler: nothing to restore: {}",
        report
    )))
}

pub fn set_default_handler(rt: &mut Runtime, ctype: Value, handler: Value) {
    if let Value::Object(p) = ctype {
        rt.default_handlers.insert(p, handler);
    }
}

pub fn clear_default_handler(rt: &mut Runtime, ctype: Value) {
    if let Value::Object(p) = ctype {
        rt.default_handlers.remove(&p);
    }
}
