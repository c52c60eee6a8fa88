// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors that might be seen when configuring the capture engine or
//! writing a dump file.

use crate::DumpType;
use thiserror::Error;

/// Error encountered while capturing a dump or preparing to do so.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The engine has not been initialized
    #[error("dump capture is not initialized")]
    NotInitialized,
    /// The dump type is not available on this platform or the configuration is invalid
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    /// Creating the dump directory or the dump file failed
    #[error("filesystem failure: {context}")]
    Filesystem {
        /// What was being done
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The platform dump facility failed
    #[error("dump write failed")]
    Snapshot(#[from] SnapshotError),
    /// A path or a filename failed the security checks
    #[error("validation failure: {0}")]
    Validation(String),
    /// Anything else
    #[error("unknown failure: {0}")]
    Unknown(String),
}

/// Category of a [`CaptureError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation attempted before initialization
    NotInitialized,
    /// Dump type invalid for the platform or configuration failed validation
    UnsupportedConfiguration,
    /// Directory, file or dump facility failure
    Filesystem,
    /// Path or filename rejected
    Validation,
    /// Anything else
    Unknown,
}

/// Structured error codes reported by the non-panicking capture API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The engine is not in a state to perform the operation
    OperationNotPermitted,
    /// The request itself is not acceptable
    InvalidArgument,
    /// The capture was attempted and did not complete
    OperationCanceled,
}

impl CaptureError {
    pub(crate) fn filesystem(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem {
            context: context.into(),
            source,
        }
    }

    /// Returns the error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::UnsupportedConfiguration(_) => ErrorKind::UnsupportedConfiguration,
            Self::Filesystem { .. } | Self::Snapshot(_) => ErrorKind::Filesystem,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Maps the error onto the structured error code space.
    pub fn code(&self) -> ErrorCode {
        match self.kind() {
            ErrorKind::NotInitialized => ErrorCode::OperationNotPermitted,
            ErrorKind::UnsupportedConfiguration | ErrorKind::Validation => {
                ErrorCode::InvalidArgument
            }
            ErrorKind::Filesystem | ErrorKind::Unknown => ErrorCode::OperationCanceled,
        }
    }
}

impl From<CaptureError> for ErrorCode {
    fn from(e: CaptureError) -> Self {
        e.code()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OperationNotPermitted => "operation not permitted",
            Self::InvalidArgument => "invalid argument",
            Self::OperationCanceled => "operation canceled",
        })
    }
}

/// Error encountered by a platform backend while writing a dump file
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Race when seizing threads
    #[error("race when seizing threads")]
    RaceTryAgain,
    /// A /proc file parsing error
    #[error("/proc parsing error")]
    ProcParsingError,
    /// A /proc file parsing error
    #[error("/proc integer parsing error")]
    ProcIntParsingError(#[from] std::num::ParseIntError),
    /// Internal error
    #[error("internal error: {0}")]
    InternalError(&'static str),
    /// OS error
    #[cfg(unix)]
    #[error("OS error")]
    NixError(#[from] nix::Error),
    /// I/O error
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    /// The platform dump facility reported a failure
    #[error("platform dump facility failed: {0}")]
    Platform(String),
    /// The backend cannot produce this kind of dump
    #[error("dump type {0} is not available from this backend")]
    UnsupportedType(DumpType),
}

/// Reasons a [`crate::DumpConfiguration`] is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// Size ceiling below the minimum
    #[error("maxSizeBytes must be 0 (unlimited) or at least 1024 bytes")]
    MaxSizeTooSmall,
    /// Size ceiling cannot be represented in memory
    #[error("maxSizeBytes exceeds the addressable range")]
    MaxSizeTooLarge,
    /// Directory path too long
    #[error("directory path too long (max 4096 characters)")]
    DirectoryTooLong,
    /// Filename too long
    #[error("filename too long (max 255 characters)")]
    FilenameTooLong,
    /// Filename is not a single path component
    #[error("filename contains path separators")]
    FilenameHasSeparators,
    /// One of the memory filters is empty
    #[error("empty memory filter found")]
    EmptyMemoryFilter,
    /// One of the memory filters is too long
    #[error("memory filter too long (max 64 characters)")]
    MemoryFilterTooLong,
}
