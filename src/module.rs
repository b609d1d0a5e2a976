use std::collections::HashMap;

use crate::objects::object::{ObjBody, Object};
use crate::value::Value;

/// A named scope: exports set, internal bindings (symbol → values-vector
/// index), and an ordered imports list.
pub struct Module {
    pub name: Value,
    pub exports: Vec<Value>,
    pub bindings: HashMap<*mut Object, usize>,
    pub imports: Vec<Value>,
}

impl Module {
    pub fn new(name: Value) -> Module {
        Module {
            name,
            exports: Vec::new(),
            bindings: HashMap::new(),
            imports: Vec::new(),
        }
    }

    pub fn approx_bytes(&self) -> usize {
        self.bindings.len() * (std::mem::size_of::<*mut Object>() + std::mem::size_of::<usize>())
            + self.exports.capacity() * std::mem::size_of::<Value>()
            + self.imports.capacity() * std::mem::size_of::<Value>()
    }
}

/// Safety: `v` must be nil or a live object.
pub unsafe fn module_of(v: Value) -> Option<*mut Object> {
    let p = match v {
        Value::Object(p) => p,
        _ => return None,
    };
    match &(*p).body {
        ObjBody::Module(_) => Some(p),
        _ => None,
    }
}

unsafe fn body<'a>(p: *mut Object) -> &'a mut Module {
    match &mut (*p).body {
        ObjBody::Module(m) => &mut *(m as *mut Module),
        _ => unreachable!("module op on non-module object"),
    }
}

fn sym_ptr(sym: Value) -> Option<*mut Object> {
    match sym {
        Value::Object(p) => Some(p),
        _ => None,
    }
}

pub unsafe fn bind(module: Value, sym: Value, gvi: usize) {
    if let (Some(m), Some(s)) = (module_of(module), sym_ptr(sym)) {
        body(m).bindings.insert(s, gvi);
    }
}

pub unsafe fn export(module: Value, sym: Value) {
    if let Some(m) = module_of(module) {
        let b = body(m);
        if !b.exports.contains(&sym) {
            b.exports.push(sym);
        }
    }
}

pub unsafe fn add_import(module: Value, imported: Value) {
    if let Some(m) = module_of(module) {
        body(m).imports.push(imported);
    }
}

/// Name resolution: local bindings first, then imports in order — and
/// only through what each import exports.
pub unsafe fn resolve(module: Value, sym: Value) -> Option<usize> {
    let m = module_of(module)?;
    let s = sym_ptr(sym)?;
    if let Some(&gvi) = body(m).bindings.get(&s) {
        return Some(gvi);
    }
    let imports = body(m).imports.clone();
    for imp in imports {
        if let Some(im) = module_of(imp) {
            let ib = body(im);
            if ib.exports.contains(&sym) {
                if let Some(&gvi) = ib.bindings.get(&s) {
                    return Some(gvi);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn local_bindings_shadow_imports() {
        let mut rt = Runtime::new();
        let lib_name = rt.intern("lib");
        let lib = rt.make_module(lib_name);
        let app_name = rt.intern("app");
        let app = rt.make_module(app_name);
        let x = rt.intern("x");
        unsafe {
            bind(lib, x, 7);
            export(lib, x);
            add_import(app, lib);
            assert_eq!(resolve(app, x), Some(7));
            bind(app, x, 9);
            assert_eq!(resolve(app, x), Some(9));
        }
    }

    #[test]
    fn unexported_names_stay_private() {
        let mut rt = Runtime::new();
        let lib_name = rt.intern("lib");
        let lib = rt.make_module(lib_name);
        let app_name = rt.intern("app");
        let app = rt.make_module(app_name);
        let hidden = rt.intern("hidden");
        unsafe {
            bind(lib, hidden, 3);
            add_import(app, lib);
            assert_eq!(resolve(app, hidden), None);
        }
    }

    #[test]
    fn imports_resolve_in_order() {
        let mut rt = Runtime::new();
        let a_name = rt.intern("a");
        let a = rt.make_module(a_name);
        let b_name = rt.intern("b");
        let b = rt.make_module(b_name);
        let app_name = rt.intern("app");
        let app = rt.make_module(app_name);
        let x = rt.intern("x");
        unsafe {
            bind(a, x, 1);
            export(a, x);
            bind(b, x, 2);
            export(b, x);
            add_import(app, a);
            add_import(app, b);
            assert_eq!(resolve(app, x), Some(1));
        }
    }
}
