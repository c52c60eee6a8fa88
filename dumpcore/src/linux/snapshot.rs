// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dumps the calling process by forking a paused copy of it and reading the
//! copy under ptrace. A process cannot stop its own threads, but its fork
//! shares the address space contents at the moment of the call.

use super::ProcessView;
use crate::backend::{create_dump_file, DumpRequest, PlatformDumpBackend};
use crate::coredump::{write_core_dump, RegionPolicy};
use crate::{diagnostics, SnapshotError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::io::{BufWriter, Write};

/// Name of the note carrying the dump type and the reason.
pub const METADATA_NOTE: &str = "DUMPCORE";

const MAX_REASON_LEN: usize = 1024;

/// Writes ELF core files.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxCoreBackend;

/// A forked copy of the caller that waits to be killed.
struct PausedChild {
    pid: Pid,
}

impl PausedChild {
    fn spawn() -> Result<Self, SnapshotError> {
        let parent = getpid();

        // SAFETY: the child only makes async-signal-safe calls.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(Self { pid: child }),
            ForkResult::Child => {
                // SAFETY: prctl, getppid, pause and _exit are async-signal-safe.
                unsafe {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
                    if libc::getppid() != parent.as_raw() {
                        libc::_exit(0);
                    }
                    loop {
                        libc::pause();
                    }
                }
            }
        }
    }
}

impl Drop for PausedChild {
    fn drop(&mut self) {
        if let Err(e) = kill(self.pid, Signal::SIGKILL) {
            tracing::debug!("Killing snapshot process {} failed: {e}", self.pid);
        }
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => break,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::debug!("Reaping snapshot process {} failed: {e}", self.pid);
                    break;
                }
            }
        }
    }
}

fn metadata_note(request: &DumpRequest<'_>) -> Vec<u8> {
    let reason: String = request.reason.chars().take(MAX_REASON_LEN).collect();
    format!(
        "dump_type={}\npid={}\nreason={}\n",
        request.dump_type,
        getpid(),
        reason
    )
    .into_bytes()
}

fn capture<W: Write>(
    writer: W,
    request: &DumpRequest<'_>,
    policy: &RegionPolicy,
) -> Result<usize, SnapshotError> {
    let child = PausedChild::spawn();
    let view = match &child {
        Ok(child) => ProcessView::seize(child.pid).or_else(|e| {
            diagnostics::warn(&format!(
                "Could not stop the snapshot process ({e}), capturing without register state"
            ));
            ProcessView::observe(getpid())
        }),
        Err(e) => {
            diagnostics::warn(&format!(
                "Could not fork a snapshot process ({e}), capturing without register state"
            ));
            ProcessView::observe(getpid())
        }
    };

    let mut view = view?;
    view.add_note(METADATA_NOTE, metadata_note(request));
    let written = write_core_dump(writer, &view, policy, request.max_size_bytes)?;

    // Resume before killing
    drop(view);
    drop(child);
    Ok(written)
}

impl PlatformDumpBackend for LinuxCoreBackend {
    fn name(&self) -> &'static str {
        "elf-core"
    }

    fn extension(&self) -> &'static str {
        "core"
    }

    fn write_dump(&self, request: &DumpRequest<'_>) -> Result<u64, SnapshotError> {
        let policy = RegionPolicy::for_dump_type(request.dump_type, request.memory_filters)?;
        if request.compress {
            diagnostics::info("Compression is not available, writing an uncompressed core");
        }
        if policy == RegionPolicy::Matching(Vec::new()) {
            diagnostics::warn("No memory filters given, the core will contain notes only");
        }

        let file = create_dump_file(request.path)?;
        match capture(BufWriter::new(file), request, &policy) {
            Ok(written) => Ok(written as u64),
            Err(e) => {
                // Do not leave a truncated core behind
                if let Err(remove) = std::fs::remove_file(request.path) {
                    tracing::debug!("Removing the partial core failed: {remove}");
                }
                Err(e)
            }
        }
    }
}
