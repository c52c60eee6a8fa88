// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capture options bundled with a dump type.

use crate::error::ConfigurationError;
use crate::DumpType;

/// Smallest non-zero size ceiling.
pub const MIN_MAX_SIZE_BYTES: u64 = 1024;
/// Longest accepted directory path.
pub const MAX_DIRECTORY_LEN: usize = 4096;
/// Longest accepted filename.
pub const MAX_FILENAME_LEN: usize = 255;
/// Longest accepted memory filter.
pub const MAX_MEMORY_FILTER_LEN: usize = 64;

/// Options for one capture.
///
/// Built by [`crate::DumpFactory::create_configuration`] and then adjusted
/// with the `with_*` helpers. The engine keeps its own copy, so a value
/// handed to it is never observed changing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpConfiguration {
    /// Capture variant
    pub dump_type: DumpType,
    /// Explicit filename, empty to generate one
    pub filename: String,
    /// Output directory, empty for the engine's directory
    pub directory: String,
    /// Request compression
    pub compress: bool,
    /// Include the unloaded module list
    pub include_unloaded_modules: bool,
    /// Include the handle table
    pub include_handle_data: bool,
    /// Include per-thread information
    pub include_thread_info: bool,
    /// Include process environment data
    pub include_process_data: bool,
    /// Size ceiling in bytes, 0 for unlimited
    pub max_size_bytes: u64,
    /// Names of memory regions to keep in a filtered dump
    pub memory_filters: Vec<String>,
    /// Keep symbol information
    pub enable_symbols: bool,
    /// Keep source information
    pub enable_source_info: bool,
}

impl Default for DumpConfiguration {
    fn default() -> Self {
        Self {
            dump_type: DumpType::PLATFORM_DEFAULT,
            filename: String::new(),
            directory: String::new(),
            compress: false,
            include_unloaded_modules: false,
            include_handle_data: false,
            include_thread_info: false,
            include_process_data: false,
            max_size_bytes: 0,
            memory_filters: Vec::new(),
            enable_symbols: false,
            enable_source_info: false,
        }
    }
}

impl DumpConfiguration {
    /// Sets the output directory.
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Sets an explicit filename.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Sets the size ceiling, 0 for unlimited.
    pub fn with_max_size_bytes(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    /// Replaces the memory filters.
    pub fn with_memory_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memory_filters = filters.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the compression request.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Checks the invariants of the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_size_bytes != 0 && self.max_size_bytes < MIN_MAX_SIZE_BYTES {
            return Err(ConfigurationError::MaxSizeTooSmall);
        }
        if self.max_size_bytes > (usize::MAX / 2) as u64 {
            return Err(ConfigurationError::MaxSizeTooLarge);
        }
        if self.directory.chars().count() > MAX_DIRECTORY_LEN {
            return Err(ConfigurationError::DirectoryTooLong);
        }
        if !self.filename.is_empty() {
            if self.filename.chars().count() > MAX_FILENAME_LEN {
                return Err(ConfigurationError::FilenameTooLong);
            }
            if self.filename.contains(['/', '\\']) {
                return Err(ConfigurationError::FilenameHasSeparators);
            }
        }
        for filter in &self.memory_filters {
            if filter.is_empty() {
                return Err(ConfigurationError::EmptyMemoryFilter);
            }
            if filter.chars().count() > MAX_MEMORY_FILTER_LEN {
                return Err(ConfigurationError::MemoryFilterTooLong);
            }
        }
        Ok(())
    }

    /// Returns `true` if [`DumpConfiguration::validate`] passes.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Describes the first failed invariant, or reports the configuration valid.
    pub fn validation_error(&self) -> String {
        match self.validate() {
            Ok(()) => "configuration is valid".to_owned(),
            Err(e) => e.to_string(),
        }
    }
}
