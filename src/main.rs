use std::process::ExitCode;

use calyx::condition::Unwind;
use calyx::{env, loader, runtime::Runtime, vm};

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let bootstrap = match args.next() {
        Some(f) => f,
        None => {
            eprintln!("usage: calyx BOOTSTRAP-FILE");
            return ExitCode::from(2);
        }
    };

    let mut rt = Runtime::new();
    env::import_environment(&mut rt);

    let entry = match loader::load_file(&mut rt, &bootstrap) {
        Ok(entry) => entry,
        Err(e) => {
            eprintln!("calyx: {}: {}", bootstrap, e);
            return ExitCode::from(1);
        }
    };

    match vm::run_at(&mut rt, entry) {
        Ok(_) => ExitCode::SUCCESS,
        Err(Unwind::Fatal(msg)) => {
            eprintln!("calyx: {}", msg);
            ExitCode::from(1)
        }
        Err(_) => {
            eprintln!("calyx: abnormal termination");
            ExitCode::from(1)
        }
    }
}
