// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the capture engine and the operating system's dump
//! facility.

use crate::{DumpType, SnapshotError};
use std::path::Path;

/// Everything a backend needs to write one dump file.
#[derive(Clone, Copy, Debug)]
pub struct DumpRequest<'a> {
    /// Destination. The file must not exist yet.
    pub path: &'a Path,
    /// Resolved dump type
    pub dump_type: DumpType,
    /// Size ceiling in bytes, 0 for unlimited
    pub max_size_bytes: u64,
    /// Region selectors for filtered dumps
    pub memory_filters: &'a [String],
    /// Whether compression was asked for
    pub compress: bool,
    /// Caller supplied reason, recorded in the dump where the format allows
    pub reason: &'a str,
}

/// A platform dump facility.
pub trait PlatformDumpBackend: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Extension of the files this backend writes, without the dot.
    fn extension(&self) -> &'static str;

    /// Writes a dump of the calling process to `request.path`, returning the
    /// number of bytes written.
    fn write_dump(&self, request: &DumpRequest<'_>) -> Result<u64, SnapshotError>;
}

/// Backend for targets without a dump facility. Every request fails.
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl PlatformDumpBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn extension(&self) -> &'static str {
        "dmp"
    }

    fn write_dump(&self, request: &DumpRequest<'_>) -> Result<u64, SnapshotError> {
        Err(SnapshotError::UnsupportedType(request.dump_type))
    }
}

/// The backend for the platform this build targets.
pub fn default_backend() -> Box<dyn PlatformDumpBackend> {
    #[cfg(target_os = "linux")]
    {
        Box::new(crate::linux::LinuxCoreBackend)
    }
    #[cfg(windows)]
    {
        Box::new(crate::win32::MinidumpBackend)
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        Box::new(UnsupportedBackend)
    }
}

/// Creates the dump file: it must not exist, and only the owner may read it.
pub(crate) fn create_dump_file(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_files_are_never_overwritten() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("a.dmp");

        drop(create_dump_file(&path).unwrap());
        let again = create_dump_file(&path).unwrap_err();
        assert_eq!(again.kind(), std::io::ErrorKind::AlreadyExists);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn unsupported_backend_refuses() {
        let request = DumpRequest {
            path: Path::new("/nonexistent/x.dmp"),
            dump_type: DumpType::UnixFull,
            max_size_bytes: 0,
            memory_filters: &[],
            compress: false,
            reason: "test",
        };
        assert!(matches!(
            UnsupportedBackend.write_dump(&request),
            Err(SnapshotError::UnsupportedType(DumpType::UnixFull))
        ));
    }
}
