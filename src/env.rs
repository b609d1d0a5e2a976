use crate::runtime::Runtime;

pub const PATH_DEFAULT: &str = "/bin:/usr/bin";
pub const IFS_DEFAULT: &str = " \t\n";
pub const LIB_VAR: &str = "CALYXLIB";

/// Read the host process environment into environ bindings and
/// establish the defaults: PATH when unset, PWD from the OS cwd, the
/// library path from the executable's location, IFS.
pub fn import_environment(rt: &mut Runtime) {
    for (k, v) in std::env::vars() {
        let sym = rt.intern(&k);
        let val = rt.make_string(&v);
        rt.environ_base_set(sym, val);
    }

    let path_sym = rt.intern("PATH");
    if rt.environ_base_get(path_sym).is_none() {
        let v = rt.make_string(PATH_DEFAULT);
        rt.environ_base_set(path_sym, v);
    }

    // The shell's idea of PWD is wherever we actually are, whatever the
    // inherited variable claims.
    if let Ok(cwd) = std::env::current_dir() {
        let pwd_sym = rt.intern("PWD");
        let v = rt.make_string(&cwd.to_string_lossy());
        rt.environ_base_set(pwd_sym, v);
    }

    if let Some(libdir) = derived_libdir() {
        let lib_sym = rt.intern(LIB_VAR);
        let combined = match rt.environ_base_get(lib_sym) {
            Some(existing) => {
                let existing = crate::value::as_string(existing);
                if existing.split(':').any(|p| p == libdir) {
                    existing
                } else {
                    format!("{}:{}", existing, libdir)
                }
            }
            None => libdir,
        };
        let v = rt.make_string(&combined);
        rt.environ_base_set(lib_sym, v);
    }

    let ifs_sym = rt.intern("IFS");
    if rt.dynamic_base_get(ifs_sym).is_none() {
        let v = rt.make_string(IFS_DEFAULT);
        rt.dynamic_base_set(ifs_sym, v);
    }
}

/// `.../bin/calyx` implies a `.../lib` worth ensuring on the library
/// path.
fn derived_libdir() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let bindir = exe.parent()?;
    if bindir.file_name()? != "bin" {
        return None;
    }
    Some(bindir.parent()?.join("lib").to_string_lossy().into_owned())
}
