// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Maps dump types to platform-appropriate configurations and answers
//! catalog queries.

use crate::dump_type::{Platform, KB_64, UNIX_BAND, WINDOWS_BAND};
use crate::{DumpConfiguration, DumpType};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Stateless catalog front-end.
pub struct DumpFactory;

impl DumpFactory {
    /// Builds the default configuration for `dump_type`, resolving
    /// [`DumpType::AutoDetect`] to the platform default first.
    ///
    /// Size ceilings bound the worst-case disk usage of each variant.
    pub fn create_configuration(dump_type: DumpType) -> DumpConfiguration {
        let dump_type = dump_type.resolve();
        match dump_type.platform() {
            Platform::Windows => windows_configuration(dump_type),
            Platform::Unix => unix_configuration(dump_type),
            // `resolve` never yields a platform-less type
            Platform::Any => unix_configuration(DumpType::UnixFull),
        }
    }

    /// Default dump type for the platform this build targets.
    pub fn default_dump_type() -> DumpType {
        DumpType::PLATFORM_DEFAULT
    }

    /// Returns `true` for [`DumpType::AutoDetect`] and for the types in the
    /// numeric band of the platform this build targets.
    pub fn is_supported(dump_type: DumpType) -> bool {
        Self::is_supported_on(Platform::current(), dump_type)
    }

    pub(crate) fn is_supported_on(platform: Platform, dump_type: DumpType) -> bool {
        let raw = dump_type.raw();
        match (dump_type, platform) {
            (DumpType::AutoDetect, _) => true,
            (_, Platform::Windows) => WINDOWS_BAND.contains(&raw),
            (_, Platform::Unix) => UNIX_BAND.contains(&raw),
            (_, Platform::Any) => false,
        }
    }

    /// Human readable description of `dump_type`.
    pub fn description(dump_type: DumpType) -> &'static str {
        dump_type.description()
    }

    /// Estimated size in bytes, 0 when the size depends on the process.
    pub fn estimated_size(dump_type: DumpType) -> u64 {
        dump_type.estimated_size()
    }

    /// Types usable on this platform, in catalog order, followed by
    /// [`DumpType::AutoDetect`].
    pub fn supported_types() -> Vec<DumpType> {
        DumpType::ALL
            .iter()
            .copied()
            .filter(|t| Self::is_supported(*t))
            .collect()
    }
}

fn windows_configuration(dump_type: DumpType) -> DumpConfiguration {
    let max_size_bytes = match dump_type {
        DumpType::MiniDumpNormal | DumpType::KernelSmall => KB_64,
        DumpType::MiniDumpWithFullMemory => GB,
        DumpType::KernelFull => 2 * GB,
        _ => 256 * MB,
    };

    DumpConfiguration {
        dump_type,
        enable_symbols: true,
        enable_source_info: true,
        include_unloaded_modules: true,
        include_handle_data: true,
        include_thread_info: true,
        include_process_data: true,
        max_size_bytes,
        ..DumpConfiguration::default()
    }
}

fn unix_configuration(dump_type: DumpType) -> DumpConfiguration {
    let mut config = DumpConfiguration {
        dump_type,
        enable_symbols: true,
        enable_source_info: true,
        max_size_bytes: 128 * MB,
        ..DumpConfiguration::default()
    };

    match dump_type {
        DumpType::UnixFull => config.max_size_bytes = GB,
        DumpType::UnixCompressed => {
            config.compress = true;
            config.max_size_bytes = 512 * MB;
        }
        DumpType::UnixFiltered => {
            config.memory_filters = vec!["stack".to_owned(), "heap".to_owned()];
            config.max_size_bytes = 256 * MB;
        }
        _ => {}
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_detect_is_resolved() {
        let config = DumpFactory::create_configuration(DumpType::AutoDetect);
        assert_eq!(config.dump_type, DumpType::PLATFORM_DEFAULT);
        assert_ne!(config.dump_type, DumpType::AutoDetect);
    }

    #[test]
    fn windows_defaults_include_subsystems() {
        let config = DumpFactory::create_configuration(DumpType::MiniDumpWithHandleData);
        assert!(config.include_unloaded_modules);
        assert!(config.include_handle_data);
        assert!(config.include_thread_info);
        assert!(config.include_process_data);
        assert!(config.enable_symbols && config.enable_source_info);
        assert_eq!(config.max_size_bytes, 256 * MB);

        assert_eq!(
            DumpFactory::create_configuration(DumpType::MiniDumpNormal).max_size_bytes,
            KB_64
        );
        assert_eq!(
            DumpFactory::create_configuration(DumpType::KernelFull).max_size_bytes,
            2 * GB
        );
    }

    #[test]
    fn unix_defaults() {
        let full = DumpFactory::create_configuration(DumpType::UnixFull);
        assert!(full.enable_symbols && full.enable_source_info);
        assert!(!full.include_handle_data && !full.include_thread_info);
        assert_eq!(full.max_size_bytes, GB);

        let compressed = DumpFactory::create_configuration(DumpType::UnixCompressed);
        assert!(compressed.compress);
        assert_eq!(compressed.max_size_bytes, 512 * MB);

        let filtered = DumpFactory::create_configuration(DumpType::UnixFiltered);
        assert_eq!(filtered.memory_filters, vec!["stack", "heap"]);
        assert_eq!(filtered.max_size_bytes, 256 * MB);

        let user = DumpFactory::create_configuration(DumpType::UnixUserOnly);
        assert_eq!(user.max_size_bytes, 128 * MB);
    }

    #[test]
    fn every_default_configuration_is_valid() {
        for dump_type in DumpType::ALL {
            let config = DumpFactory::create_configuration(dump_type);
            assert!(config.is_valid(), "{dump_type}: {}", config.validation_error());
        }
    }

    #[test]
    fn bands_per_platform() {
        assert!(DumpFactory::is_supported_on(Platform::Windows, DumpType::KernelActive));
        assert!(!DumpFactory::is_supported_on(Platform::Windows, DumpType::UnixFull));
        assert!(DumpFactory::is_supported_on(Platform::Unix, DumpType::UnixFiltered));
        assert!(!DumpFactory::is_supported_on(Platform::Unix, DumpType::MiniDumpNormal));
        assert!(DumpFactory::is_supported_on(Platform::Unix, DumpType::AutoDetect));
        assert!(DumpFactory::is_supported_on(Platform::Windows, DumpType::AutoDetect));
    }

    #[test]
    fn descriptions_survive_configuration() {
        for dump_type in DumpFactory::supported_types() {
            let config = DumpFactory::create_configuration(dump_type);
            if dump_type == DumpType::AutoDetect {
                continue;
            }
            assert_eq!(
                DumpFactory::description(config.dump_type),
                DumpFactory::description(dump_type)
            );
        }
    }

    #[test]
    fn supported_types_end_with_auto_detect() {
        let types = DumpFactory::supported_types();
        assert_eq!(types.last(), Some(&DumpType::AutoDetect));
        assert!(types.contains(&DumpType::PLATFORM_DEFAULT));
    }
}
