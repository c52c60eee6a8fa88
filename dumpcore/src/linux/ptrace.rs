// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process trace helpers that are not machine specific.

use crate::elf::{NT_PRFPREG, NT_PRSTATUS};
use crate::SnapshotError;
use nix::errno::Errno;
use nix::sys::ptrace::{Request, RequestType};
use nix::unistd::Pid;
use std::ffi::c_void;
use std::ptr;

// Large enough for an XSAVE area with AVX-512 and AMX tiles.
const REG_SET_CAPACITY: usize = 0x4000;

/// Reads the register set `set` of a stopped thread.
pub fn get_reg_set(tid: Pid, set: u32) -> Result<Vec<u8>, SnapshotError> {
    let mut data = vec![0_u8; REG_SET_CAPACITY];
    let mut iov = nix::libc::iovec {
        iov_base: data.as_mut_ptr().cast::<c_void>(),
        iov_len: data.len(),
    };

    // SAFETY: the kernel writes at most `iov_len` bytes into `data`, which
    // outlives the call, and shrinks `iov_len` to the size of the set.
    let ret = unsafe {
        nix::libc::ptrace(
            Request::PTRACE_GETREGSET as RequestType,
            nix::libc::pid_t::from(tid),
            set as usize as *mut c_void,
            ptr::addr_of_mut!(iov).cast::<c_void>(),
        )
    };
    Errno::result(ret)?;

    data.truncate(iov.iov_len);
    Ok(data)
}

/// Stops a seized thread without sending it a signal.
pub fn interrupt(tid: Pid) -> Result<(), SnapshotError> {
    // SAFETY: PTRACE_INTERRUPT takes no buffers.
    let ret = unsafe {
        nix::libc::ptrace(
            Request::PTRACE_INTERRUPT as RequestType,
            nix::libc::pid_t::from(tid),
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    Errno::result(ret)?;
    Ok(())
}

pub fn get_gp_reg_set(tid: Pid) -> Result<Vec<u8>, SnapshotError> {
    get_reg_set(tid, NT_PRSTATUS)
}

pub fn get_fp_reg_set(tid: Pid) -> Result<Vec<u8>, SnapshotError> {
    get_reg_set(tid, NT_PRFPREG)
}
