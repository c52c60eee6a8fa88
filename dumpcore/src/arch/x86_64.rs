// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86_64 specifics for ELF core files.

#![allow(non_camel_case_types)]

use super::ArchComponentState;
use crate::linux::ptrace::get_reg_set;
use crate::SnapshotError;
use nix::unistd::Pid;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const EM_X86_64: u16 = 62;

const NT_X86_XSTATE: u32 = 0x202;

/// Number of registers in `user_regs_struct`.
const USER_REGS: usize = 27;
const RIP: usize = 16;
const RSP: usize = 19;

/// `user_regs_struct`, from `r15` through `gs`, indexed by kernel order.
#[repr(C)]
#[derive(Clone, Copy, Debug, IntoBytes, FromBytes, Immutable)]
pub struct elf_gregset_t([u64; USER_REGS]);

impl elf_gregset_t {
    pub fn instruction_pointer(&self) -> u64 {
        self.0[RIP]
    }

    pub fn stack_pointer(&self) -> u64 {
        self.0[RSP]
    }
}

pub fn arch_components(tid: Pid) -> Result<Vec<ArchComponentState>, SnapshotError> {
    Ok(vec![ArchComponentState {
        name: "XSAVE",
        note_type: NT_X86_XSTATE,
        note_name: b"LINUX",
        data: get_reg_set(tid, NT_X86_XSTATE)?,
    }])
}
