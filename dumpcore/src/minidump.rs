// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `MINIDUMP_TYPE` content flags and the mapping from [`DumpType`].
//!
//! The values match the constants of the Windows debug help library so that
//! the mapping can be computed and tested on any host.

use crate::DumpType;
use bitflags::bitflags;

bitflags! {
    /// A set of `MINIDUMP_TYPE` flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MinidumpFlags: u32 {
        /// Stack traces of all threads
        const NORMAL = 0x0000_0000;
        /// Data sections of loaded modules
        const WITH_DATA_SEGS = 0x0000_0001;
        /// All accessible memory
        const WITH_FULL_MEMORY = 0x0000_0002;
        /// Handle table
        const WITH_HANDLE_DATA = 0x0000_0004;
        /// Stack and backing store filtered to pointers
        const FILTER_MEMORY = 0x0000_0008;
        /// Referenced modules only
        const SCAN_MEMORY = 0x0000_0010;
        /// Recently unloaded modules
        const WITH_UNLOADED_MODULES = 0x0000_0020;
        /// Pages referenced by locals and other stack memory
        const WITH_INDIRECTLY_REFERENCED_MEMORY = 0x0000_0040;
        /// Module paths stripped of directories
        const FILTER_MODULE_PATHS = 0x0000_0080;
        /// Process and thread environment blocks
        const WITH_PROCESS_THREAD_DATA = 0x0000_0100;
        /// Private read-write pages
        const WITH_PRIVATE_READ_WRITE_MEMORY = 0x0000_0200;
        /// Omit optional data
        const WITHOUT_OPTIONAL_DATA = 0x0000_0400;
        /// Memory region information
        const WITH_FULL_MEMORY_INFO = 0x0000_0800;
        /// Thread state information
        const WITH_THREAD_INFO = 0x0000_1000;
        /// Code sections of loaded modules
        const WITH_CODE_SEGS = 0x0000_2000;
        /// Skip auxiliary state
        const WITHOUT_AUXILIARY_STATE = 0x0000_4000;
        /// Full auxiliary state
        const WITH_FULL_AUXILIARY_STATE = 0x0000_8000;
        /// Private write-copy pages
        const WITH_PRIVATE_WRITE_COPY_MEMORY = 0x0001_0000;
        /// Keep going on unreadable memory
        const IGNORE_INACCESSIBLE_MEMORY = 0x0002_0000;
        /// Security token information
        const WITH_TOKEN_INFORMATION = 0x0004_0000;
    }
}

impl MinidumpFlags {
    /// Returns `true` if the combination is accepted by the dump writer.
    ///
    /// Unknown bits and asking for full memory information while omitting
    /// optional data are rejected.
    pub const fn is_valid(self) -> bool {
        if self.bits() & !Self::all().bits() != 0 {
            return false;
        }
        !(self.contains(Self::WITHOUT_OPTIONAL_DATA) && self.contains(Self::WITH_FULL_MEMORY_INFO))
    }

    /// Returns `self`, or [`Self::NORMAL`] if the combination is invalid.
    pub const fn or_normal(self) -> Self {
        if self.is_valid() {
            self
        } else {
            Self::NORMAL
        }
    }
}

impl From<DumpType> for MinidumpFlags {
    /// Content flags for a Windows dump type. Types outside the Windows band
    /// map to [`MinidumpFlags::NORMAL`].
    fn from(dump_type: DumpType) -> Self {
        use MinidumpFlags as F;

        let full_memory = F::WITH_FULL_MEMORY | F::WITH_FULL_MEMORY_INFO;
        match dump_type {
            DumpType::MiniDumpNormal => F::NORMAL,
            DumpType::MiniDumpWithDataSegs => F::WITH_DATA_SEGS,
            DumpType::MiniDumpWithFullMemory | DumpType::KernelFull => {
                full_memory
                    | F::WITH_HANDLE_DATA
                    | F::WITH_UNLOADED_MODULES
                    | F::WITH_INDIRECTLY_REFERENCED_MEMORY
                    | F::WITH_PROCESS_THREAD_DATA
                    | F::WITH_PRIVATE_READ_WRITE_MEMORY
                    | F::WITH_THREAD_INFO
            }
            DumpType::MiniDumpWithHandleData => F::WITH_HANDLE_DATA,
            DumpType::MiniDumpFilterMemory => F::FILTER_MEMORY,
            DumpType::MiniDumpScanMemory => F::SCAN_MEMORY,
            DumpType::MiniDumpWithUnloadedModules => F::WITH_UNLOADED_MODULES,
            DumpType::MiniDumpWithIndirectlyReferencedMemory => {
                F::WITH_INDIRECTLY_REFERENCED_MEMORY
            }
            DumpType::MiniDumpFilterModulePaths => F::FILTER_MODULE_PATHS,
            DumpType::MiniDumpWithProcessThreadData => F::WITH_PROCESS_THREAD_DATA,
            DumpType::MiniDumpWithPrivateReadWriteMemory => F::WITH_PRIVATE_READ_WRITE_MEMORY,
            DumpType::MiniDumpWithoutOptionalData => F::WITHOUT_OPTIONAL_DATA,
            DumpType::MiniDumpWithFullMemoryInfo => F::WITH_FULL_MEMORY_INFO,
            DumpType::MiniDumpWithThreadInfo => F::WITH_THREAD_INFO,
            DumpType::MiniDumpWithCodeSegments => F::WITH_CODE_SEGS,
            DumpType::MiniDumpWithoutAuxiliaryState => F::WITHOUT_AUXILIARY_STATE,
            DumpType::MiniDumpWithFullAuxiliaryState => F::WITH_FULL_AUXILIARY_STATE,
            DumpType::MiniDumpWithPrivateWriteCopyMemory => F::WITH_PRIVATE_WRITE_COPY_MEMORY,
            DumpType::MiniDumpIgnoreInaccessibleMemory => F::IGNORE_INACCESSIBLE_MEMORY,
            DumpType::MiniDumpWithTokenInformation => F::WITH_TOKEN_INFORMATION,
            DumpType::KernelKernelOnly => full_memory,
            DumpType::KernelSmall => F::NORMAL,
            DumpType::KernelAutomatic => full_memory | F::WITH_HANDLE_DATA,
            DumpType::KernelActive => {
                full_memory
                    | F::WITH_HANDLE_DATA
                    | F::WITH_UNLOADED_MODULES
                    | F::WITH_PROCESS_THREAD_DATA
            }
            _ => F::NORMAL,
        }
        .or_normal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump_type::WINDOWS_BAND;

    #[test]
    fn composite_kernel_mappings() {
        let full = MinidumpFlags::from(DumpType::KernelFull);
        assert_eq!(full, MinidumpFlags::from(DumpType::MiniDumpWithFullMemory));
        assert_eq!(full.bits(), 0x1b66);

        assert_eq!(MinidumpFlags::from(DumpType::KernelKernelOnly).bits(), 0x0802);
        assert_eq!(MinidumpFlags::from(DumpType::KernelSmall), MinidumpFlags::NORMAL);
        assert_eq!(MinidumpFlags::from(DumpType::KernelAutomatic).bits(), 0x0806);
        assert_eq!(MinidumpFlags::from(DumpType::KernelActive).bits(), 0x0926);
    }

    #[test]
    fn every_windows_type_maps_to_a_valid_set() {
        for dump_type in DumpType::ALL {
            if !WINDOWS_BAND.contains(&dump_type.raw()) {
                assert_eq!(MinidumpFlags::from(dump_type), MinidumpFlags::NORMAL);
                continue;
            }
            assert!(MinidumpFlags::from(dump_type).is_valid(), "{dump_type}");
        }
    }

    #[test]
    fn invalid_combinations_fall_back_to_normal() {
        let conflicting = MinidumpFlags::WITHOUT_OPTIONAL_DATA | MinidumpFlags::WITH_FULL_MEMORY_INFO;
        assert!(!conflicting.is_valid());
        assert_eq!(conflicting.or_normal(), MinidumpFlags::NORMAL);

        let unknown = MinidumpFlags::from_bits_retain(0x0010_0000);
        assert!(!unknown.is_valid());

        let mut flags = MinidumpFlags::WITH_THREAD_INFO;
        flags |= MinidumpFlags::WITH_CODE_SEGS;
        assert!(flags.contains(MinidumpFlags::WITH_CODE_SEGS));
        assert_eq!(format!("{flags:x}"), "3000");
    }

    #[test]
    fn code_segments_type_selects_code_sections() {
        assert_eq!(
            MinidumpFlags::from(DumpType::MiniDumpWithCodeSegments),
            MinidumpFlags::WITH_CODE_SEGS
        );
        assert_eq!(MinidumpFlags::all().bits(), 0x0007_ffff);
    }
}
