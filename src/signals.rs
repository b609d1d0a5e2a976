use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use phf::phf_map;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGCHLD: i32 = 17;

const NSIG: usize = 65;

/// Pending-signal flags.  A delivering context (the process-launching
/// collaborator's handler, or a test) only sets a flag; the VM observes
/// them at safe points between opcodes and raises there.
static PENDING: Lazy<Vec<AtomicBool>> =
    Lazy::new(|| (0..NSIG).map(|_| AtomicBool::new(false)).collect());

pub fn deliver(sig: i32) {
    if sig >= 0 && (sig as usize) < NSIG {
        PENDING[sig as usize].store(true, Ordering::SeqCst);
    }
}

/// Claim the lowest-numbered pending signal, if any.
pub fn poll() -> Option<i32> {
    for (sig, flag) in PENDING.iter().enumerate() {
        if flag.swap(false, Ordering::SeqCst) {
            return Some(sig as i32);
        }
    }
    None
}

static SIGNAL_NAMES: phf::Map<i32, &'static str> = phf_map! {
    1i32 => "SIGHUP",
    2i32 => "SIGINT",
    3i32 => "SIGQUIT",
    4i32 => "SIGILL",
    6i32 => "SIGABRT",
    8i32 => "SIGFPE",
    9i32 => "SIGKILL",
    11i32 => "SIGSEGV",
    13i32 => "SIGPIPE",
    14i32 => "SIGALRM",
    15i32 => "SIGTERM",
    17i32 => "SIGCHLD",
    18i32 => "SIGCONT",
    19i32 => "SIGSTOP",
    20i32 => "SIGTSTP",
    21i32 => "SIGTTIN",
    22i32 => "SIGTTOU",
};

pub fn name(sig: i32) -> String {
    match SIGNAL_NAMES.get(&sig) {
        Some(n) => (*n).to_string(),
        None => format!("signal-{}", sig),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliver_then_poll_drains() {
        // the flags are process-wide, so tolerate deliveries from
        // concurrently running tests; 60 and 61 are ours alone
        deliver(61);
        deliver(60);
        let mut seen = Vec::new();
        for _ in 0..100 {
            if let Some(s) = poll() {
                seen.push(s);
                if seen.contains(&60) && seen.contains(&61) {
                    break;
                }
            }
        }
        let at60 = seen.iter().position(|&s| s == 60).expect("60 pending");
        let at61 = seen.iter().position(|&s| s == 61).expect("61 pending");
        // lowest first
        assert!(at60 < at61);
    }

    #[test]
    fn names() {
        assert_eq!(name(SIGCHLD), "SIGCHLD");
        assert_eq!(name(63), "signal-63");
    }
}
