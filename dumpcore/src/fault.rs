// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The fault context: what runs inside a fatal signal handler.
//!
//! Only async-signal-safe operations are reachable from the handler. It
//! reports the crash once, points the kernel's dumper at a pattern prepared
//! ahead of time, runs whatever handler it replaced, then re-raises with the
//! default action. Nothing here depends on the rest of the crate.

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{sysconf, SysconfVar};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::OnceLock;

/// Longest pattern the kernel accepts in `core_pattern`.
pub const MAX_CORE_PATTERN_LEN: usize = 127;

/// Signals treated as fatal faults.
pub const FATAL_SIGNALS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGILL,
];

const CORE_PATTERN_PATH: &[u8] = b"/proc/sys/kernel/core_pattern\0";
const CRASH_MESSAGE: &[u8] = b"CRASH DETECTED\n";

/// Pages of alternate signal stack, not counting the guard page.
const ALT_STACK_PAGES: usize = 16;

/// A core pattern in a fixed-size buffer.
struct CorePattern {
    bytes: [u8; MAX_CORE_PATTERN_LEN],
    len: usize,
}

/// Pattern for the handler; null when there is none. Whoever swaps a
/// pattern out owns it: `arm` frees the one it replaces, the handler keeps
/// the one it takes.
static CORE_PATTERN: AtomicPtr<CorePattern> = AtomicPtr::new(ptr::null_mut());

static INSTALLED: AtomicBool = AtomicBool::new(false);
static REPORTED: AtomicBool = AtomicBool::new(false);

/// Dispositions replaced by [`install_handlers`], chained after ours.
static PREVIOUS_ACTIONS: OnceLock<Vec<(Signal, SigAction)>> = OnceLock::new();

/// Prepares `pattern` for the handler, replacing the previous one. Patterns
/// longer than [`MAX_CORE_PATTERN_LEN`] are rejected and clear the slot.
///
/// Not callable from the fault context: it allocates.
pub fn arm(pattern: Option<&[u8]>) -> bool {
    let next = match pattern {
        Some(pattern) if pattern.len() <= MAX_CORE_PATTERN_LEN => {
            let mut bytes = [0_u8; MAX_CORE_PATTERN_LEN];
            bytes[..pattern.len()].copy_from_slice(pattern);
            Box::into_raw(Box::new(CorePattern {
                bytes,
                len: pattern.len(),
            }))
        }
        _ => ptr::null_mut(),
    };
    let previous = CORE_PATTERN.swap(next, Ordering::AcqRel);
    if !previous.is_null() {
        // SAFETY: only `arm` publishes, always from `Box::into_raw`, and the
        // swap made this call the only owner.
        drop(unsafe { Box::from_raw(previous) });
    }
    !next.is_null()
}

/// Installs the single-shot handler for every signal in [`FATAL_SIGNALS`].
///
/// The handlers run on an alternate stack so that a stack overflow still
/// reaches them. The calling thread gets one unless it already has one;
/// threads started by `std` always do. Later calls do nothing.
pub fn install_handlers() -> nix::Result<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    ensure_alt_stack()?;

    // SA_RESETHAND restores the default action on entry, so the re-raise
    // in the handler reaches the kernel's own dumper.
    let action = SigAction::new(
        SigHandler::SigAction(on_fatal_signal),
        SaFlags::SA_RESETHAND | SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );

    let mut previous = Vec::with_capacity(FATAL_SIGNALS.len());
    let mut result = Ok(());
    for signal in FATAL_SIGNALS {
        // SAFETY: the handler only calls async-signal-safe functions.
        match unsafe { sigaction(signal, &action) } {
            Ok(old) => previous.push((signal, old)),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    let _ = PREVIOUS_ACTIONS.set(previous);
    result
}

/// Gives the calling thread an alternate signal stack with a guard page,
/// unless it already has one. The mapping lives until the process exits.
fn ensure_alt_stack() -> nix::Result<()> {
    // SAFETY: a null new stack only queries the current one.
    let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
    Errno::result(unsafe { libc::sigaltstack(ptr::null(), &mut current) })?;
    if current.ss_flags & libc::SS_DISABLE == 0 {
        return Ok(());
    }

    let page = match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => 0x1000,
    };
    let size = std::cmp::max(libc::SIGSTKSZ, ALT_STACK_PAGES * page);

    // SAFETY: a fresh anonymous mapping; the guard page is its first page
    // and the stack is the rest.
    unsafe {
        let base = libc::mmap(
            ptr::null_mut(),
            size + page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        Errno::result(libc::mprotect(base, page, libc::PROT_NONE))?;

        let stack = libc::stack_t {
            ss_sp: base.cast::<u8>().add(page).cast::<c_void>(),
            ss_flags: 0,
            ss_size: size,
        };
        Errno::result(libc::sigaltstack(&stack, ptr::null_mut()))?;
    }
    Ok(())
}

/// Lets the kernel write core files for this process: marks it dumpable and
/// lifts the core size limit as far as allowed.
pub fn enable_core_files() -> nix::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: PR_SET_DUMPABLE only changes a flag of this process.
        let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1 as libc::c_ulong, 0, 0, 0) };
        Errno::result(ret)?;
    }

    if setrlimit(Resource::RLIMIT_CORE, libc::RLIM_INFINITY, libc::RLIM_INFINITY).is_err() {
        // Unprivileged processes may only raise the soft limit to the hard one
        let (_, hard) = getrlimit(Resource::RLIMIT_CORE)?;
        setrlimit(Resource::RLIMIT_CORE, hard, hard)?;
    }
    Ok(())
}

/// Writes `bytes` to standard error without buffering.
pub fn raw_write(bytes: &[u8]) {
    // SAFETY: write(2) reads `bytes.len()` bytes from a live slice.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Points the kernel's dumper at the armed pattern, if any. Fails silently,
/// typically for lack of privilege.
pub fn update_core_pattern() {
    write_armed_pattern(CORE_PATTERN_PATH);
}

/// Takes the armed pattern and writes it to the NUL terminated `target`.
/// Only the first caller after an `arm` finds a pattern.
fn write_armed_pattern(target: &[u8]) {
    let pattern = CORE_PATTERN.swap(ptr::null_mut(), Ordering::AcqRel);
    if pattern.is_null() {
        return;
    }

    // SAFETY: the swap made this call the owner of the pattern, which is
    // left allocated; open/write/close are async-signal-safe.
    unsafe {
        let pattern = &*pattern;
        let fd = libc::open(target.as_ptr().cast(), libc::O_WRONLY | libc::O_TRUNC);
        if fd >= 0 {
            libc::write(fd, pattern.bytes.as_ptr().cast(), pattern.len);
            libc::close(fd);
        }
    }
}

/// Re-raises `signum` with its default action, then exits if the signal
/// did not terminate the process.
pub fn terminate(signum: libc::c_int) -> ! {
    // SAFETY: raise and _exit are async-signal-safe.
    unsafe {
        libc::raise(signum);
        libc::_exit(128 + signum)
    }
}

/// Runs the disposition [`install_handlers`] replaced for `signum`. The
/// Rust runtime's stack overflow report is one of them.
fn chain_previous(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(previous) = PREVIOUS_ACTIONS.get() else {
        return;
    };
    for (signal, action) in previous {
        if *signal as libc::c_int != signum {
            continue;
        }
        match action.handler() {
            SigHandler::Handler(handler) => handler(signum),
            SigHandler::SigAction(handler) => handler(signum, info, context),
            SigHandler::SigDfl | SigHandler::SigIgn => {}
        }
    }
}

extern "C" fn on_fatal_signal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    // A chained handler may abort, bringing us back here for SIGABRT
    if !REPORTED.swap(true, Ordering::AcqRel) {
        raw_write(CRASH_MESSAGE);
    }
    update_core_pattern();
    chain_previous(signum, info, context);
    terminate(signum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::resource::{setrlimit, Resource};
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Output};

    const CHILD_ENV: &str = "DUMPCORE_FAULT_CHILD";

    fn armed() -> Option<Vec<u8>> {
        let pattern = CORE_PATTERN.load(Ordering::Acquire);
        if pattern.is_null() {
            return None;
        }
        // SAFETY: nothing else touches the slot while this test runs.
        let pattern = unsafe { &*pattern };
        Some(pattern.bytes[..pattern.len].to_vec())
    }

    /// Reruns the test `name` in a new process with `CHILD_ENV` set.
    fn run_in_child(name: &str) -> Output {
        Command::new(std::env::current_exe().unwrap())
            .args([name, "--exact", "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, "1")
            .output()
            .unwrap()
    }

    fn in_child() -> bool {
        if std::env::var_os(CHILD_ENV).is_none() {
            return false;
        }
        setrlimit(Resource::RLIMIT_CORE, 0, 0).unwrap();
        true
    }

    #[test]
    fn arming_replaces_and_bounds_the_pattern() {
        assert!(arm(Some(b"/var/dumps/unix_full_%t_%p_0123456789ABCDEF.core")));
        assert_eq!(
            armed().as_deref(),
            Some(&b"/var/dumps/unix_full_%t_%p_0123456789ABCDEF.core"[..])
        );

        let longest = vec![b'a'; MAX_CORE_PATTERN_LEN];
        assert!(arm(Some(&longest)));
        assert_eq!(armed(), Some(longest));

        assert!(!arm(Some(&[b'a'; MAX_CORE_PATTERN_LEN + 1])));
        assert_eq!(armed(), None);

        assert!(!arm(None));
        assert_eq!(armed(), None);

        // The handler's write consumes the pattern
        let target = tempfile::NamedTempFile::new().unwrap();
        let mut path = target.path().to_str().unwrap().as_bytes().to_vec();
        path.push(0);
        assert!(arm(Some(b"/var/dumps/core_%t_%p")));
        write_armed_pattern(&path);
        assert_eq!(std::fs::read(target.path()).unwrap(), b"/var/dumps/core_%t_%p");
        assert_eq!(armed(), None);

        std::fs::write(target.path(), b"untouched").unwrap();
        write_armed_pattern(&path);
        assert_eq!(std::fs::read(target.path()).unwrap(), b"untouched");
    }

    #[test]
    fn fatal_signal_is_reported_once_then_default() {
        if in_child() {
            install_handlers().unwrap();

            // SAFETY: a null new action only queries the current one.
            let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
            assert_eq!(
                unsafe { libc::sigaction(libc::SIGFPE, ptr::null(), &mut current) },
                0
            );
            for flag in [libc::SA_RESETHAND, libc::SA_ONSTACK, libc::SA_SIGINFO] {
                assert_ne!(current.sa_flags & flag, 0, "flag {flag:#x}");
            }

            let mut stack: libc::stack_t = unsafe { std::mem::zeroed() };
            assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut stack) }, 0);
            assert_eq!(stack.ss_flags & libc::SS_DISABLE, 0);

            unsafe { libc::raise(libc::SIGFPE) };
            unreachable!("SIGFPE returned");
        }

        let output = run_in_child("fault::tests::fatal_signal_is_reported_once_then_default");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(output.status.signal(), Some(libc::SIGFPE), "{stderr}");
        assert_eq!(stderr.matches("CRASH DETECTED").count(), 1, "{stderr}");
    }

    #[inline(never)]
    #[allow(unconditional_recursion)]
    fn recurse(depth: u64) -> u64 {
        let frame = std::hint::black_box([depth; 64]);
        recurse(depth + 1).wrapping_add(frame[(depth % 64) as usize])
    }

    #[test]
    fn stack_overflow_reaches_the_handler() {
        if in_child() {
            install_handlers().unwrap();
            recurse(0);
            unreachable!("unbounded recursion returned");
        }

        let output = run_in_child("fault::tests::stack_overflow_reaches_the_handler");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(stderr.matches("CRASH DETECTED").count(), 1, "{stderr}");
        // The runtime's own report still runs after ours, then aborts
        assert!(stderr.contains("has overflowed its stack"), "{stderr}");
        assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{stderr}");
    }
}
