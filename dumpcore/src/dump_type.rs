// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Catalog of dump variants.
//!
//! Windows variants occupy the numeric band `0..=24` (mini-dumps `0..=19`,
//! kernel dumps `20..=24`), UNIX core dump variants the band `25..=29`.
//! [`DumpType::AutoDetect`] is `-1` and is resolved to
//! [`DumpType::PLATFORM_DEFAULT`] before it is used for anything.

use std::fmt;
use std::str::FromStr;

/// 32 KiB
pub const KB_32: u64 = 32 * 1024;
/// 64 KiB
pub const KB_64: u64 = 64 * 1024;
/// 128 KiB
pub const KB_128: u64 = 128 * 1024;
/// 256 KiB
pub const KB_256: u64 = 256 * 1024;
/// 512 KiB
pub const KB_512: u64 = 512 * 1024;
/// 1 MiB
pub const MB_1: u64 = 1024 * 1024;

/// Numeric band reserved for the Windows dump variants.
pub(crate) const WINDOWS_BAND: std::ops::RangeInclusive<i8> = 0..=24;
/// Numeric band reserved for the UNIX core dump variants.
pub(crate) const UNIX_BAND: std::ops::RangeInclusive<i8> = 25..=29;

/// Platform a dump variant belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// Mini-dumps and kernel dumps
    Windows,
    /// Core dumps
    Unix,
    /// Resolved on whatever platform the code runs on
    Any,
}

impl Platform {
    /// The platform this build targets.
    pub const fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Capture variant.
#[repr(i8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DumpType {
    /// Basic snapshot: thread stacks and module list
    MiniDumpNormal = 0,
    /// Includes data sections of loaded modules
    MiniDumpWithDataSegs = 1,
    /// All accessible memory
    MiniDumpWithFullMemory = 2,
    /// Handle table
    MiniDumpWithHandleData = 3,
    /// Stack memory filtered to pointers only
    MiniDumpFilterMemory = 4,
    /// Stack and backing store scanned for referenced modules
    MiniDumpScanMemory = 5,
    /// Recently unloaded modules
    MiniDumpWithUnloadedModules = 6,
    /// Pages referenced by locals and other stack memory
    MiniDumpWithIndirectlyReferencedMemory = 7,
    /// Module paths filtered
    MiniDumpFilterModulePaths = 8,
    /// Process and thread environment blocks
    MiniDumpWithProcessThreadData = 9,
    /// Private read/write pages
    MiniDumpWithPrivateReadWriteMemory = 10,
    /// Minimal dump without optional data
    MiniDumpWithoutOptionalData = 11,
    /// Memory region descriptors
    MiniDumpWithFullMemoryInfo = 12,
    /// Thread times and start addresses
    MiniDumpWithThreadInfo = 13,
    /// Code sections of modules
    MiniDumpWithCodeSegments = 14,
    /// Skip auxiliary state
    MiniDumpWithoutAuxiliaryState = 15,
    /// Full auxiliary state
    MiniDumpWithFullAuxiliaryState = 16,
    /// Private write-copy pages
    MiniDumpWithPrivateWriteCopyMemory = 17,
    /// Continue past inaccessible memory
    MiniDumpIgnoreInaccessibleMemory = 18,
    /// Security token information
    MiniDumpWithTokenInformation = 19,
    /// Full kernel dump
    KernelFull = 20,
    /// Kernel memory only
    KernelKernelOnly = 21,
    /// Small kernel dump
    KernelSmall = 22,
    /// Automatic kernel dump
    KernelAutomatic = 23,
    /// Active kernel dump
    KernelActive = 24,
    /// Core dump with all memory
    UnixFull = 25,
    /// Kernel-space only core dump
    UnixKernelOnly = 26,
    /// User-space only core dump
    UnixUserOnly = 27,
    /// Compressed core dump
    UnixCompressed = 28,
    /// Core dump restricted by memory filters
    UnixFiltered = 29,
    /// Pick the platform default
    AutoDetect = -1,
}

impl DumpType {
    /// Default variant of the platform this build targets.
    #[cfg(windows)]
    pub const PLATFORM_DEFAULT: DumpType = DumpType::MiniDumpWithFullMemory;
    /// Default variant of the platform this build targets.
    #[cfg(not(windows))]
    pub const PLATFORM_DEFAULT: DumpType = DumpType::UnixFull;

    /// Every variant, in catalog order.
    pub const ALL: [DumpType; 31] = [
        DumpType::MiniDumpNormal,
        DumpType::MiniDumpWithDataSegs,
        DumpType::MiniDumpWithFullMemory,
        DumpType::MiniDumpWithHandleData,
        DumpType::MiniDumpFilterMemory,
        DumpType::MiniDumpScanMemory,
        DumpType::MiniDumpWithUnloadedModules,
        DumpType::MiniDumpWithIndirectlyReferencedMemory,
        DumpType::MiniDumpFilterModulePaths,
        DumpType::MiniDumpWithProcessThreadData,
        DumpType::MiniDumpWithPrivateReadWriteMemory,
        DumpType::MiniDumpWithoutOptionalData,
        DumpType::MiniDumpWithFullMemoryInfo,
        DumpType::MiniDumpWithThreadInfo,
        DumpType::MiniDumpWithCodeSegments,
        DumpType::MiniDumpWithoutAuxiliaryState,
        DumpType::MiniDumpWithFullAuxiliaryState,
        DumpType::MiniDumpWithPrivateWriteCopyMemory,
        DumpType::MiniDumpIgnoreInaccessibleMemory,
        DumpType::MiniDumpWithTokenInformation,
        DumpType::KernelFull,
        DumpType::KernelKernelOnly,
        DumpType::KernelSmall,
        DumpType::KernelAutomatic,
        DumpType::KernelActive,
        DumpType::UnixFull,
        DumpType::UnixKernelOnly,
        DumpType::UnixUserOnly,
        DumpType::UnixCompressed,
        DumpType::UnixFiltered,
        DumpType::AutoDetect,
    ];

    /// Numeric tag of the variant.
    pub const fn raw(self) -> i8 {
        self as i8
    }

    /// Looks a variant up by its numeric tag.
    pub fn from_raw(raw: i8) -> Option<DumpType> {
        DumpType::ALL.iter().copied().find(|t| t.raw() == raw)
    }

    /// Platform the variant belongs to, by numeric band.
    pub fn platform(self) -> Platform {
        let raw = self.raw();
        if WINDOWS_BAND.contains(&raw) {
            Platform::Windows
        } else if UNIX_BAND.contains(&raw) {
            Platform::Unix
        } else {
            Platform::Any
        }
    }

    /// Returns `self`, or the platform default for [`DumpType::AutoDetect`].
    pub fn resolve(self) -> DumpType {
        match self {
            DumpType::AutoDetect => DumpType::PLATFORM_DEFAULT,
            other => other,
        }
    }

    /// The name used as a filename prefix, and accepted by [`FromStr`].
    pub const fn as_str(self) -> &'static str {
        match self {
            DumpType::MiniDumpNormal => "minidump_normal",
            DumpType::MiniDumpWithDataSegs => "minidump_with_data_segs",
            DumpType::MiniDumpWithFullMemory => "minidump_with_full_memory",
            DumpType::MiniDumpWithHandleData => "minidump_with_handle_data",
            DumpType::MiniDumpFilterMemory => "minidump_filter_memory",
            DumpType::MiniDumpScanMemory => "minidump_scan_memory",
            DumpType::MiniDumpWithUnloadedModules => "minidump_with_unloaded_modules",
            DumpType::MiniDumpWithIndirectlyReferencedMemory => {
                "minidump_with_indirectly_referenced_memory"
            }
            DumpType::MiniDumpFilterModulePaths => "minidump_filter_module_paths",
            DumpType::MiniDumpWithProcessThreadData => "minidump_with_process_thread_data",
            DumpType::MiniDumpWithPrivateReadWriteMemory => {
                "minidump_with_private_read_write_memory"
            }
            DumpType::MiniDumpWithoutOptionalData => "minidump_without_optional_data",
            DumpType::MiniDumpWithFullMemoryInfo => "minidump_with_full_memory_info",
            DumpType::MiniDumpWithThreadInfo => "minidump_with_thread_info",
            DumpType::MiniDumpWithCodeSegments => "minidump_with_code_segments",
            DumpType::MiniDumpWithoutAuxiliaryState => "minidump_without_auxiliary_state",
            DumpType::MiniDumpWithFullAuxiliaryState => "minidump_with_full_auxiliary_state",
            DumpType::MiniDumpWithPrivateWriteCopyMemory => {
                "minidump_with_private_write_copy_memory"
            }
            DumpType::MiniDumpIgnoreInaccessibleMemory => "minidump_ignore_inaccessible_memory",
            DumpType::MiniDumpWithTokenInformation => "minidump_with_token_information",
            DumpType::KernelFull => "kernel_full",
            DumpType::KernelKernelOnly => "kernel_kernel_only",
            DumpType::KernelSmall => "kernel_small",
            DumpType::KernelAutomatic => "kernel_automatic",
            DumpType::KernelActive => "kernel_active",
            DumpType::UnixFull => "unix_full",
            DumpType::UnixKernelOnly => "unix_kernel_only",
            DumpType::UnixUserOnly => "unix_user_only",
            DumpType::UnixCompressed => "unix_compressed",
            DumpType::UnixFiltered => "unix_filtered",
            DumpType::AutoDetect => "auto_detect",
        }
    }

    /// Human readable description.
    pub const fn description(self) -> &'static str {
        match self {
            DumpType::MiniDumpNormal => "Basic mini-dump (64KB)",
            DumpType::MiniDumpWithDataSegs => "Mini-dump with data segments",
            DumpType::MiniDumpWithFullMemory => "Full memory mini-dump (largest)",
            DumpType::MiniDumpWithHandleData => "Mini-dump with handle data",
            DumpType::MiniDumpFilterMemory => "Filtered memory mini-dump",
            DumpType::MiniDumpScanMemory => "Scanned memory mini-dump",
            DumpType::MiniDumpWithUnloadedModules => "Mini-dump with unloaded modules",
            DumpType::MiniDumpWithIndirectlyReferencedMemory => {
                "Mini-dump with indirectly referenced memory"
            }
            DumpType::MiniDumpFilterModulePaths => "Mini-dump with filtered module paths",
            DumpType::MiniDumpWithProcessThreadData => "Mini-dump with process/thread data",
            DumpType::MiniDumpWithPrivateReadWriteMemory => {
                "Mini-dump with private read/write memory"
            }
            DumpType::MiniDumpWithoutOptionalData => "Mini-dump without optional data",
            DumpType::MiniDumpWithFullMemoryInfo => "Mini-dump with full memory info",
            DumpType::MiniDumpWithThreadInfo => "Mini-dump with thread info",
            DumpType::MiniDumpWithCodeSegments => "Mini-dump with code segments",
            DumpType::MiniDumpWithoutAuxiliaryState => "Mini-dump without auxiliary state",
            DumpType::MiniDumpWithFullAuxiliaryState => "Mini-dump with full auxiliary state",
            DumpType::MiniDumpWithPrivateWriteCopyMemory => {
                "Mini-dump with private write-copy memory"
            }
            DumpType::MiniDumpIgnoreInaccessibleMemory => "Mini-dump ignoring inaccessible memory",
            DumpType::MiniDumpWithTokenInformation => "Mini-dump with token information",
            DumpType::KernelFull => "Full kernel dump - largest kernel dump",
            DumpType::KernelKernelOnly => "Kernel memory dump - kernel memory only",
            DumpType::KernelSmall => "Small kernel dump - 64KB",
            DumpType::KernelAutomatic => "Automatic kernel dump - flexible size",
            DumpType::KernelActive => "Active kernel dump - similar to full but smaller",
            DumpType::UnixFull => "Full core dump with all memory",
            DumpType::UnixKernelOnly => "Kernel-space only core dump",
            DumpType::UnixUserOnly => "User-space only core dump",
            DumpType::UnixCompressed => "Compressed core dump",
            DumpType::UnixFiltered => "Filtered core dump (exclude certain memory regions)",
            DumpType::AutoDetect => "Auto-detect based on platform",
        }
    }

    /// Estimated size of the artifact in bytes, 0 when it depends on the
    /// process memory.
    pub const fn estimated_size(self) -> u64 {
        match self {
            DumpType::MiniDumpNormal => KB_64,
            DumpType::MiniDumpWithDataSegs => KB_128,
            DumpType::MiniDumpWithHandleData => KB_256,
            DumpType::MiniDumpFilterMemory => KB_64,
            DumpType::MiniDumpScanMemory => KB_128,
            DumpType::MiniDumpWithUnloadedModules => KB_512,
            DumpType::MiniDumpFilterModulePaths => KB_64,
            DumpType::MiniDumpWithProcessThreadData => MB_1,
            DumpType::MiniDumpWithoutOptionalData => KB_32,
            DumpType::MiniDumpWithThreadInfo => KB_256,
            DumpType::MiniDumpWithCodeSegments => KB_512,
            DumpType::MiniDumpWithoutAuxiliaryState => KB_64,
            DumpType::MiniDumpWithFullAuxiliaryState => MB_1,
            DumpType::MiniDumpIgnoreInaccessibleMemory => KB_64,
            DumpType::MiniDumpWithTokenInformation => KB_128,
            DumpType::KernelSmall => KB_64,
            _ => 0,
        }
    }
}

impl fmt::Display for DumpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl TryFrom<i8> for DumpType {
    type Error = i8;

    fn try_from(raw: i8) -> Result<Self, Self::Error> {
        DumpType::from_raw(raw).ok_or(raw)
    }
}

/// Unknown dump type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dump type \"{0}\"")]
pub struct ParseDumpTypeError(String);

impl FromStr for DumpType {
    type Err = ParseDumpTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "auto" | "default" => Ok(DumpType::AutoDetect),
            _ => DumpType::ALL
                .iter()
                .copied()
                .find(|t| t.as_str() == name)
                .ok_or_else(|| ParseDumpTypeError(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_are_disjoint_and_complete() {
        let windows = DumpType::ALL
            .iter()
            .filter(|t| t.platform() == Platform::Windows)
            .count();
        let unix = DumpType::ALL
            .iter()
            .filter(|t| t.platform() == Platform::Unix)
            .count();
        assert_eq!(windows, 25);
        assert_eq!(unix, 5);
        assert_eq!(DumpType::AutoDetect.platform(), Platform::Any);
    }

    #[test]
    fn raw_tags_round_trip() {
        assert_eq!(DumpType::from_raw(25), Some(DumpType::UnixFull));
        assert_eq!(DumpType::from_raw(-1), Some(DumpType::AutoDetect));
        assert_eq!(DumpType::try_from(30), Err(30));
        assert_eq!(DumpType::try_from(-2), Err(-2));
    }

    #[test]
    fn auto_detect_resolves_to_platform_default() {
        assert_eq!(DumpType::AutoDetect.resolve(), DumpType::PLATFORM_DEFAULT);
        assert_eq!(DumpType::KernelSmall.resolve(), DumpType::KernelSmall);
        assert_ne!(DumpType::PLATFORM_DEFAULT.platform(), Platform::Any);
    }

    #[test]
    fn names_parse_back() {
        assert_eq!("unix_full".parse::<DumpType>(), Ok(DumpType::UnixFull));
        assert_eq!(" KERNEL_SMALL ".parse::<DumpType>(), Ok(DumpType::KernelSmall));
        assert_eq!("auto".parse::<DumpType>(), Ok(DumpType::AutoDetect));
        assert!("unix_everything".parse::<DumpType>().is_err());
    }

    #[test]
    fn variable_sized_types_estimate_zero() {
        assert_eq!(DumpType::MiniDumpNormal.estimated_size(), KB_64);
        assert_eq!(DumpType::MiniDumpWithoutOptionalData.estimated_size(), KB_32);
        assert_eq!(DumpType::MiniDumpWithFullMemory.estimated_size(), 0);
        assert_eq!(DumpType::UnixFull.estimated_size(), 0);
    }
}
