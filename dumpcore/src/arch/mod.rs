// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Machine-specific register state for ELF core files.

use crate::elf::NT_PRFPREG;
use crate::linux::ptrace;
use crate::SnapshotError;
use nix::unistd::Pid;
use zerocopy::{FromBytes, FromZeros};

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{elf_gregset_t, EM_X86_64 as EM_ELF_MACHINE};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{elf_gregset_t, EM_AARCH64 as EM_ELF_MACHINE};

/// A register set saved as its own note: FP/SIMD, XSAVE, TLS and so on.
#[derive(Debug)]
pub struct ArchComponentState {
    pub name: &'static str,
    pub note_type: u32,
    pub note_name: &'static [u8],
    pub data: Vec<u8>,
}

/// CPU state of one thread.
#[derive(Debug)]
pub struct ArchState {
    /// General purpose registers as the kernel lays them out
    gpr_state: Vec<u8>,
    components: Vec<ArchComponentState>,
}

impl ArchState {
    /// Reads the registers of a ptrace-stopped thread.
    pub fn capture(tid: Pid) -> Result<Self, SnapshotError> {
        tracing::debug!("Getting GP registers for #{tid}");
        let gpr_state = ptrace::get_gp_reg_set(tid)?;

        let mut components = vec![ArchComponentState {
            name: "Floating point",
            note_type: NT_PRFPREG,
            note_name: b"CORE",
            data: ptrace::get_fp_reg_set(tid)?,
        }];

        match arch_components(tid) {
            Ok(extended) => components.extend(extended),
            // XSAVE might be disabled, etc
            Err(e) => tracing::debug!("No extended register state for #{tid}: {e}"),
        }

        Ok(Self {
            gpr_state,
            components,
        })
    }

    /// State for a thread whose registers could not be read.
    pub fn unavailable() -> Self {
        Self {
            gpr_state: Vec::new(),
            components: Vec::new(),
        }
    }

    /// The register block of the status note, zeroed if nothing was read.
    pub fn greg_set(&self) -> elf_gregset_t {
        elf_gregset_t::read_from_prefix(&self.gpr_state)
            .map(|(regs, _)| regs)
            .unwrap_or_else(|_| elf_gregset_t::new_zeroed())
    }

    pub fn components(&self) -> &[ArchComponentState] {
        &self.components
    }

    pub fn has_fp_state(&self) -> bool {
        self.components.iter().any(|c| c.note_type == NT_PRFPREG)
    }
}

fn arch_components(tid: Pid) -> Result<Vec<ArchComponentState>, SnapshotError> {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::arch_components(tid)
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::arch_components(tid)
    }
}
