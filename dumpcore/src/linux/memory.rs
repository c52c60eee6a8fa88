// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reading the memory of the snapshot process.

use crate::SnapshotError;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::{IoSliceMut, Read, Seek, SeekFrom};

/// Something able to read another process's virtual memory.
pub trait ReadProcessMemory {
    /// Reads into `buf` starting at the virtual address `base`, returning the
    /// number of bytes read.
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, SnapshotError>;
}

/// Reads with `process_vm_readv`, available on Linux 3.2+ unless disabled
/// in the kernel configuration.
struct FastMemoryReader {
    pid: Pid,
}

impl ReadProcessMemory for FastMemoryReader {
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, SnapshotError> {
        let len = buf.len();
        let read = process_vm_readv(
            self.pid,
            &mut [IoSliceMut::new(buf)],
            &[RemoteIoVec { base, len }],
        )?;
        // Short reads stop at the first unmapped page
        if read == 0 {
            return Err(SnapshotError::InternalError("no bytes read"));
        }
        Ok(read)
    }
}

/// Reads through `/proc/<pid>/mem`. Slower, but works where
/// `process_vm_readv` is unavailable.
struct SlowMemoryReader {
    file: std::fs::File,
}

impl SlowMemoryReader {
    fn new(pid: Pid) -> Result<Self, SnapshotError> {
        let file = std::fs::File::open(format!("/proc/{pid}/mem"))?;
        Ok(Self { file })
    }
}

impl ReadProcessMemory for SlowMemoryReader {
    fn read_process_memory(&mut self, base: usize, buf: &mut [u8]) -> Result<usize, SnapshotError> {
        self.file.seek(SeekFrom::Start(base as u64))?;
        self.file.read_exact(buf)?;
        Ok(buf.len())
    }
}

/// Picks the fastest reader that works on this system.
pub fn memory_reader(pid: Pid) -> Result<Box<dyn ReadProcessMemory>, SnapshotError> {
    if process_vm_readv_works() {
        tracing::debug!("Using process_vm_readv for memory reads");
        Ok(Box::new(FastMemoryReader { pid }))
    } else {
        tracing::debug!("Using /proc/{pid}/mem for memory reads");
        Ok(Box::new(SlowMemoryReader::new(pid)?))
    }
}

/// `process_vm_readv` might be unavailable, so probe that the ABI works.
fn process_vm_readv_works() -> bool {
    let probe_in = [0xc1c2c3c4c5c6c7c8_u64];
    let mut probe_out = 0u64.to_le_bytes();

    let result = process_vm_readv(
        nix::unistd::getpid(),
        &mut [IoSliceMut::new(&mut probe_out)],
        &[RemoteIoVec {
            base: probe_in.as_ptr() as usize,
            len: std::mem::size_of_val(&probe_in),
        }],
    );

    match result {
        Ok(_) if probe_in[0] == u64::from_le_bytes(probe_out) => true,
        Ok(_) => {
            tracing::debug!("process_vm_readv returned unexpected data, won't be using it");
            false
        }
        Err(e) => {
            tracing::debug!("process_vm_readv failed ({e}), won't be using it");
            false
        }
    }
}
