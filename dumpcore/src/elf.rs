// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The small part of the ELF format a core file needs. Kept local rather
//! than pulling a full object-file crate into a crash path.

#![allow(non_camel_case_types)]

use super::arch;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF version
pub const EV_CURRENT: u8 = 1;
/// Offset of the version byte in `e_ident`
const EI_VERSION: usize = 6;

/// `e_ident` of a 64-bit little endian object without ABI extensions:
/// magic, class, data encoding, version, then zero padding.
pub const ELF64_LSB_IDENT: [u8; 16] = [
    ELFMAG[0], ELFMAG[1], ELFMAG[2], ELFMAG[3],
    2, // ELFCLASS64
    1, // ELFDATA2LSB
    EV_CURRENT,
    0, // ELFOSABI_NONE
    0, 0, 0, 0, 0, 0, 0, 0,
];

/// Executable file
pub const ET_EXEC: u16 = 2;
/// Shared object file
pub const ET_DYN: u16 = 3;
/// Core file
pub const ET_CORE: u16 = 4;

/// Loadable program segment
pub const PT_LOAD: u32 = 1;
/// Auxiliary information
pub const PT_NOTE: u32 = 4;

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

/// Program status note
pub const NT_PRSTATUS: u32 = 1;
/// Floating point registers note
pub const NT_PRFPREG: u32 = 2;
/// Program information note
pub const NT_PRPSINFO: u32 = 3;
/// Auxiliary vector note
pub const NT_AUXV: u32 = 6;
/// Signal information note
pub const NT_SIGINFO: u32 = 0x5349_4749;
/// Mapped files note
pub const NT_FILE: u32 = 0x4649_4c45;
/// Note type for application-defined payloads
pub const NT_CUSTOM: u32 = 0xffff_ffff;

/// Process information
#[derive(IntoBytes, Immutable)]
#[repr(C)]
pub struct prpsinfo_t {
    // 136 bytes
    pub pr_state: u8,
    pub pr_sname: u8,
    pub pr_zomb: u8,
    pub pr_nice: u8,
    pub pad0: u32,
    pub pr_flag: u64,
    pub pr_uid: u32,
    pub pr_gid: u32,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_fname: [u8; 16],
    pub pr_psargs: [u8; 80],
}

/// Signal information
#[derive(IntoBytes, Immutable)]
#[repr(C)]
pub struct siginfo_t {
    // 128 bytes
    pub si_signo: u32,
    pub si_errno: u32,
    pub si_code: u32,
    pub pad0: u32,
    pub si_data: [u32; 28],
}

#[derive(IntoBytes, Immutable)]
#[repr(C)]
pub struct pr_timeval_t {
    pub tv_sec: u64,
    pub tv_usec: u64,
}

/// Thread status
#[derive(IntoBytes, Immutable)]
#[repr(C)]
pub struct prstatus_t {
    // 336 bytes on x86_64, 392 on aarch64
    pub si_signo: u32,
    pub si_code: u32,
    pub si_errno: u32,
    pub pr_cursig: u16,
    pub pad0: u16,
    pub pr_sigpend: u64,
    pub pr_sighold: u64,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_utime: pr_timeval_t,
    pub pr_stime: pr_timeval_t,
    pub pr_cutime: pr_timeval_t,
    pub pr_cstime: pr_timeval_t,
    pub pr_reg: arch::elf_gregset_t,
    pub pr_fpvalid: u32,
    pub pad1: u32,
}

/// Auxiliary vector entry
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Auxv {
    pub a_type: u64,
    pub a_val: u64,
}

/// Note header
#[derive(IntoBytes, Immutable)]
#[repr(C)]
pub struct Elf64_Nhdr {
    pub namesz: u32,
    pub descsz: u32,
    pub ntype: u32,
}

/// File header
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Elf64_Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// Program header
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Elf64_Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64_Ehdr {
    /// Header of a core file for this machine whose `phnum` program headers
    /// follow it directly. There are no sections.
    pub fn core(phnum: u16) -> Self {
        Self {
            e_ident: ELF64_LSB_IDENT,
            e_type: ET_CORE,
            e_machine: arch::EM_ELF_MACHINE,
            e_version: u32::from(EV_CURRENT),
            e_entry: 0,
            e_phoff: std::mem::size_of::<Elf64_Ehdr>() as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: std::mem::size_of::<Elf64_Ehdr>() as u16,
            e_phentsize: std::mem::size_of::<Elf64_Phdr>() as u16,
            e_phnum: phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    /// Returns `true` for a loadable image of this machine's architecture.
    pub fn is_loadable_image(&self) -> bool {
        self.e_ident[..ELFMAG.len()] == ELFMAG
            && self.e_ident[EI_VERSION] == EV_CURRENT
            && usize::from(self.e_ehsize) == std::mem::size_of::<Elf64_Ehdr>()
            && usize::from(self.e_phentsize) == std::mem::size_of::<Elf64_Phdr>()
            && (self.e_type == ET_EXEC || self.e_type == ET_DYN)
            && self.e_machine == arch::EM_ELF_MACHINE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layouts_match_the_kernel() {
        assert_eq!(std::mem::size_of::<prpsinfo_t>(), 136);
        assert_eq!(std::mem::size_of::<siginfo_t>(), 128);
        assert_eq!(std::mem::size_of::<Elf64_Ehdr>(), 64);
        assert_eq!(std::mem::size_of::<Elf64_Phdr>(), 56);
        #[cfg(target_arch = "x86_64")]
        assert_eq!(std::mem::size_of::<prstatus_t>(), 336);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(std::mem::size_of::<prstatus_t>(), 392);
    }

    #[test]
    fn recognizes_own_executable() {
        let image = std::fs::read("/proc/self/exe").unwrap();
        let (header, _) = Elf64_Ehdr::read_from_prefix(&image).unwrap();
        assert!(header.is_loadable_image());

        let mut core = header;
        core.e_type = ET_CORE;
        assert!(!core.is_loadable_image());

        let core = Elf64_Ehdr::core(3);
        assert_eq!(core.e_ident[..4], image[..4]);
        assert_eq!(core.e_machine, arch::EM_ELF_MACHINE);
        assert_eq!(core.e_phnum, 3);
    }
}
