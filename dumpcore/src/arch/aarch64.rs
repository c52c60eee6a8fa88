// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Aarch64 specifics for ELF core files.

#![allow(non_camel_case_types)]

use super::ArchComponentState;
use crate::linux::ptrace::get_reg_set;
use crate::SnapshotError;
use nix::unistd::Pid;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const EM_AARCH64: u16 = 183;

const NT_ARM_TLS: u32 = 0x401;
const NT_ARM_HW_BREAK: u32 = 0x402;
const NT_ARM_HW_WATCH: u32 = 0x403;
const NT_ARM_SYSTEM_CALL: u32 = 0x404;

/// `user_pt_regs`: `x0` to `x30`, then `sp`, `pc` and `pstate`.
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, IntoBytes, FromBytes, Immutable)]
pub struct elf_gregset_t {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

impl elf_gregset_t {
    pub fn instruction_pointer(&self) -> u64 {
        self.pc
    }

    pub fn stack_pointer(&self) -> u64 {
        self.sp
    }
}

pub fn arch_components(tid: Pid) -> Result<Vec<ArchComponentState>, SnapshotError> {
    let sets: [(&'static str, u32); 4] = [
        ("TLS", NT_ARM_TLS),
        ("HW BREAK", NT_ARM_HW_BREAK),
        ("HW WATCH", NT_ARM_HW_WATCH),
        ("SYSCALL", NT_ARM_SYSTEM_CALL),
    ];

    sets.into_iter()
        .map(|(name, note_type)| {
            Ok(ArchComponentState {
                name,
                note_type,
                note_name: b"LINUX",
                data: get_reg_set(tid, note_type)?,
            })
        })
        .collect()
}
