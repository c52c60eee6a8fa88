// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crash dump capture for Rust processes.
//!
//! Once initialized, the engine intercepts fatal faults (signals on UNIX,
//! the unhandled exception filter on Windows) and unhandled panics, and can
//! write a dump of the running process on demand. On Linux dumps are ELF
//! core files written by the crate itself; on Windows they are minidumps.
//!
//! ```no_run
//! use dumpcore::DumpType;
//!
//! // Dumps go to `dumps` next to the executable.
//! dumpcore::initialize("", DumpType::AutoDetect, true)?;
//!
//! match dumpcore::try_generate_dump("cache corrupted", DumpType::AutoDetect) {
//!     Ok(artifact) => println!("dump written to {}", artifact.path.display()),
//!     Err(code) => eprintln!("no dump: {code}"),
//! }
//! # Ok::<(), dumpcore::CaptureError>(())
//! ```

#![warn(missing_docs)]

#[cfg(target_os = "linux")]
mod arch;
mod backend;
mod collaborators;
mod configuration;
#[cfg(target_os = "linux")]
mod coredump;
pub mod diagnostics;
mod dump_type;
#[cfg(target_os = "linux")]
mod elf;
mod engine;
mod error;
mod factory;
#[cfg(unix)]
mod fault;
mod interception;
#[cfg(target_os = "linux")]
mod linux;
mod minidump;
mod panic_hook;
pub mod security;
mod throttle;
#[cfg(windows)]
mod win32;

pub use backend::{default_backend, DumpRequest, PlatformDumpBackend, UnsupportedBackend};
pub use collaborators::{
    Clock, Collaborators, DirectoryCreator, EntropySource, FsDirectoryCreator, OsEntropy,
    SystemClock,
};
pub use configuration::DumpConfiguration;
pub use diagnostics::is_admin_privileges;
pub use dump_type::{DumpType, ParseDumpTypeError, Platform};
pub use engine::{
    default_directory, CaptureEngine, CaptureEngineBuilder, DumpArtifact,
    DEFAULT_DIRECTORY_NAME, UNHANDLED_PANIC_PREFIX,
};
pub use error::{CaptureError, ConfigurationError, ErrorCode, ErrorKind, SnapshotError};
pub use factory::DumpFactory;
pub use interception::{default_interception, CrashPlan, FaultInterception, NoInterception};
#[cfg(unix)]
pub use interception::{core_pattern, SignalInterception};
#[cfg(target_os = "linux")]
pub use linux::LinuxCoreBackend;
pub use minidump::MinidumpFlags;
pub use throttle::{OperationSlots, SlotGuard, MAX_CONCURRENT_OPERATIONS};
#[cfg(windows)]
pub use win32::{ExceptionFilterInterception, MinidumpBackend};

use std::path::PathBuf;
use std::sync::OnceLock;

static GLOBAL: OnceLock<CaptureEngine> = OnceLock::new();

/// The process-wide engine.
///
/// Fault handlers are process-wide, so this is the one piece of ambient
/// state in the crate. It is created with the platform's default backend,
/// interception and collaborators on first use.
pub fn global() -> &'static CaptureEngine {
    GLOBAL.get_or_init(CaptureEngine::default)
}

/// Initializes the process-wide engine. See [`CaptureEngine::initialize`].
pub fn initialize(
    directory: &str,
    dump_type: DumpType,
    handle_unhandled_exceptions: bool,
) -> Result<(), CaptureError> {
    global().initialize(directory, dump_type, handle_unhandled_exceptions)
}

/// Initializes the process-wide engine with a full configuration. See
/// [`CaptureEngine::initialize_with`].
pub fn initialize_with(
    config: DumpConfiguration,
    handle_unhandled_exceptions: bool,
) -> Result<(), CaptureError> {
    global().initialize_with(config, handle_unhandled_exceptions)
}

/// Writes a dump with the process-wide engine. See
/// [`CaptureEngine::generate_dump`].
pub fn generate_dump(reason: &str, dump_type: DumpType) -> Result<bool, CaptureError> {
    global().generate_dump(reason, dump_type)
}

/// Writes a dump with the process-wide engine. See
/// [`CaptureEngine::try_generate_dump`].
pub fn try_generate_dump(reason: &str, dump_type: DumpType) -> Result<DumpArtifact, ErrorCode> {
    global().try_generate_dump(reason, dump_type)
}

/// Writes a dump with the process-wide engine. See
/// [`CaptureEngine::generate_dump_with_config`].
pub fn generate_dump_with_config(
    config: &DumpConfiguration,
    reason: &str,
) -> Result<bool, CaptureError> {
    global().generate_dump_with_config(config, reason)
}

/// Whether the process-wide engine is initialized.
pub fn is_initialized() -> bool {
    global().is_initialized()
}

/// Dump directory of the process-wide engine.
pub fn dump_directory() -> Option<PathBuf> {
    global().dump_directory()
}

/// Current configuration of the process-wide engine.
pub fn current_configuration() -> DumpConfiguration {
    global().current_configuration()
}

/// Current dump type of the process-wide engine.
pub fn current_dump_type() -> DumpType {
    global().current_dump_type()
}

/// Changes the dump type of the process-wide engine. See
/// [`CaptureEngine::set_dump_type`].
pub fn set_dump_type(dump_type: DumpType) -> Result<bool, CaptureError> {
    global().set_dump_type(dump_type)
}
