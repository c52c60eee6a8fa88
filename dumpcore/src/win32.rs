// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Minidumps through the debug help library, and the unhandled exception
//! filter that writes one when the process faults.

use crate::backend::{create_dump_file, DumpRequest, PlatformDumpBackend};
use crate::interception::{CrashPlan, FaultInterception};
use crate::minidump::MinidumpFlags;
use crate::security::sanitize_filename_component;
use crate::{diagnostics, CaptureError, SnapshotError};
use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::AsRawHandle;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, GENERIC_WRITE, HANDLE};
use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, CREATE_NEW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_MODE,
};
use windows::Win32::System::Diagnostics::Debug::{
    MiniDumpWriteDump, SetUnhandledExceptionFilter, EXCEPTION_POINTERS,
    MINIDUMP_EXCEPTION_INFORMATION, MINIDUMP_TYPE,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId, OpenProcessToken,
};

const EXCEPTION_EXECUTE_HANDLER: i32 = 1;

/// Writes minidumps of the calling process.
#[derive(Clone, Copy, Debug, Default)]
pub struct MinidumpBackend;

/// Content flags for `dump_type`, replaced by the basic snapshot if the
/// combination is rejected.
fn content_flags(request: &DumpRequest<'_>) -> MinidumpFlags {
    let flags = MinidumpFlags::from(request.dump_type);
    if !flags.is_valid() {
        diagnostics::warn(&format!(
            "Conflicting minidump flags {flags:#x}, writing a basic snapshot"
        ));
    }
    flags.or_normal()
}

/// Writes a minidump of this process into `file`.
///
/// # Safety
///
/// `file` must be a handle open for writing, and `exception`, if given, must
/// point to the exception record of the current thread.
unsafe fn write_minidump(
    file: HANDLE,
    flags: MinidumpFlags,
    exception: Option<*const MINIDUMP_EXCEPTION_INFORMATION>,
) -> windows::core::Result<()> {
    MiniDumpWriteDump(
        GetCurrentProcess(),
        GetCurrentProcessId(),
        file,
        MINIDUMP_TYPE(flags.bits() as i32),
        exception,
        None,
        None,
    )
}

impl PlatformDumpBackend for MinidumpBackend {
    fn name(&self) -> &'static str {
        "minidump"
    }

    fn extension(&self) -> &'static str {
        "dmp"
    }

    fn write_dump(&self, request: &DumpRequest<'_>) -> Result<u64, SnapshotError> {
        if !crate::DumpFactory::is_supported(request.dump_type) {
            return Err(SnapshotError::UnsupportedType(request.dump_type));
        }
        if request.compress {
            diagnostics::info("Compression is not available, writing an uncompressed minidump");
        }

        let flags = content_flags(request);
        let file = create_dump_file(request.path)?;
        tracing::debug!("Writing minidump with flags {flags:#x}");

        // SAFETY: the handle belongs to `file`, which outlives the call.
        let written = unsafe { write_minidump(HANDLE(file.as_raw_handle()), flags, None) };
        let size = written
            .map_err(|e| SnapshotError::Platform(e.to_string()))
            .and_then(|()| Ok(file.metadata()?.len()));
        drop(file);

        match size {
            Ok(size) => {
                if request.max_size_bytes > 0 && size > request.max_size_bytes {
                    diagnostics::warn(&format!(
                        "Minidump is {size} bytes, above the {} byte ceiling",
                        request.max_size_bytes
                    ));
                }
                Ok(size)
            }
            Err(e) => {
                if let Err(remove) = std::fs::remove_file(request.path) {
                    tracing::debug!("Removing the partial minidump failed: {remove}");
                }
                Err(e)
            }
        }
    }
}

/// What the exception filter writes, prepared ahead of the fault.
struct FilterPlan {
    /// NUL terminated UTF-16 path
    path: Vec<u16>,
    flags: MinidumpFlags,
}

/// Plan for the filter; null when there is none. Whoever swaps a plan out
/// owns it: `arm` frees the one it replaces, the filter keeps the one it
/// takes.
static FILTER_PLAN: AtomicPtr<FilterPlan> = AtomicPtr::new(ptr::null_mut());

fn arm(plan: &CrashPlan) {
    let name = format!(
        "{}_unhandled_exception_{}.dmp",
        sanitize_filename_component(plan.dump_type.as_str()),
        plan.random_component
    );
    let path = plan
        .directory
        .join(name)
        .as_os_str()
        .encode_wide()
        .chain(Some(0))
        .collect();

    let next = Box::into_raw(Box::new(FilterPlan {
        path,
        flags: MinidumpFlags::from(plan.dump_type).or_normal(),
    }));
    let previous = FILTER_PLAN.swap(next, Ordering::AcqRel);
    if !previous.is_null() {
        // SAFETY: only `arm` publishes, always from `Box::into_raw`, and the
        // swap made this call the only owner.
        drop(unsafe { Box::from_raw(previous) });
    }
}

unsafe extern "system" fn on_unhandled_exception(info: *const EXCEPTION_POINTERS) -> i32 {
    let plan = FILTER_PLAN.swap(ptr::null_mut(), Ordering::AcqRel);
    if plan.is_null() {
        return EXCEPTION_EXECUTE_HANDLER;
    }
    let plan = &*plan;

    let file = CreateFileW(
        PCWSTR(plan.path.as_ptr()),
        GENERIC_WRITE.0,
        FILE_SHARE_MODE(0),
        None,
        CREATE_NEW,
        FILE_ATTRIBUTE_NORMAL,
        None,
    );
    if let Ok(file) = file {
        let exception = MINIDUMP_EXCEPTION_INFORMATION {
            ThreadId: GetCurrentThreadId(),
            ExceptionPointers: info as *mut EXCEPTION_POINTERS,
            ClientPointers: false.into(),
        };
        // Nothing can be done about a failure here
        let _ = write_minidump(file, plan.flags, Some(&exception));
        let _ = CloseHandle(file);
    }
    EXCEPTION_EXECUTE_HANDLER
}

/// Writes a minidump from the unhandled exception filter.
#[derive(Debug, Default)]
pub struct ExceptionFilterInterception;

impl FaultInterception for ExceptionFilterInterception {
    fn install(&self, plan: &CrashPlan) -> Result<(), CaptureError> {
        self.update(plan);
        let filter: unsafe extern "system" fn(*const EXCEPTION_POINTERS) -> i32 =
            on_unhandled_exception;
        // SAFETY: the filter only takes the published plan.
        unsafe {
            SetUnhandledExceptionFilter(Some(Some(filter)));
        }
        diagnostics::info("Windows exception filter installed");
        Ok(())
    }

    fn update(&self, plan: &CrashPlan) {
        arm(plan);
    }
}

/// Returns `true` if the process token is elevated.
pub fn is_elevated() -> bool {
    let mut token = HANDLE::default();
    // SAFETY: the pseudo handle of the current process is always valid.
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) }.is_err() {
        return false;
    }

    let mut elevation = TOKEN_ELEVATION::default();
    let mut returned = 0_u32;
    // SAFETY: the buffer is a TOKEN_ELEVATION of the size passed.
    let queried = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut TOKEN_ELEVATION as *mut c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    };
    // SAFETY: `token` was opened above.
    let _ = unsafe { CloseHandle(token) };

    queried.is_ok() && elevation.TokenIsElevated != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DumpType;

    #[test]
    fn writes_a_minidump() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("normal.dmp");
        let request = DumpRequest {
            path: &path,
            dump_type: DumpType::MiniDumpNormal,
            max_size_bytes: 0,
            memory_filters: &[],
            compress: false,
            reason: "unit test",
        };

        let size = MinidumpBackend.write_dump(&request).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, size);
        assert_eq!(&bytes[..4], b"MDMP");
    }

    #[test]
    fn unix_types_are_refused() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("never.dmp");
        let request = DumpRequest {
            path: &path,
            dump_type: DumpType::UnixFull,
            max_size_bytes: 0,
            memory_filters: &[],
            compress: false,
            reason: "unit test",
        };

        assert!(matches!(
            MinidumpBackend.write_dump(&request),
            Err(SnapshotError::UnsupportedType(DumpType::UnixFull))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn rearming_replaces_the_plan() {
        let armed = || {
            let plan = FILTER_PLAN.load(Ordering::Acquire);
            assert!(!plan.is_null());
            // SAFETY: nothing else touches the slot while this test runs.
            let plan = unsafe { &*plan };
            let path = String::from_utf16(&plan.path[..plan.path.len() - 1]).unwrap();
            (path, plan.flags)
        };

        let mut plan = CrashPlan {
            directory: std::path::PathBuf::from(r"C:\dumps"),
            dump_type: DumpType::MiniDumpNormal,
            random_component: "0123456789ABCDEF".to_owned(),
        };
        arm(&plan);
        assert_eq!(
            armed(),
            (
                r"C:\dumps\minidump_normal_unhandled_exception_0123456789ABCDEF.dmp".to_owned(),
                MinidumpFlags::NORMAL
            )
        );

        for _ in 0..64 {
            arm(&plan);
        }
        plan.dump_type = DumpType::MiniDumpWithFullMemory;
        arm(&plan);
        let (path, flags) = armed();
        assert!(path.ends_with("_unhandled_exception_0123456789ABCDEF.dmp"), "{path}");
        assert_eq!(flags, MinidumpFlags::from(DumpType::MiniDumpWithFullMemory));
    }
}
