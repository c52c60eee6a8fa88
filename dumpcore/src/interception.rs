// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide interception of fatal faults.
//!
//! The engine prepares a [`CrashPlan`] while it can still allocate and log;
//! the interception turns it into whatever its fault context can use
//! without either.

use crate::{CaptureError, DumpType};
use std::path::PathBuf;

/// Where and how a fault-triggered dump should be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashPlan {
    /// Validated dump directory
    pub directory: PathBuf,
    /// Resolved dump type
    pub dump_type: DumpType,
    /// Uppercase hex text from the secure random source
    pub random_component: String,
}

/// A platform mechanism that reacts to fatal faults.
pub trait FaultInterception: Send + Sync {
    /// Installs the process-wide handlers.
    fn install(&self, plan: &CrashPlan) -> Result<(), CaptureError>;

    /// Replaces the plan used by already installed handlers.
    fn update(&self, plan: &CrashPlan);
}

/// The interception for the platform this build targets.
pub fn default_interception() -> Box<dyn FaultInterception> {
    #[cfg(unix)]
    {
        Box::new(SignalInterception)
    }
    #[cfg(windows)]
    {
        Box::new(crate::win32::ExceptionFilterInterception)
    }
    #[cfg(not(any(unix, windows)))]
    {
        Box::new(NoInterception)
    }
}

/// Leaves faults to the platform's default behavior.
#[derive(Debug, Default)]
pub struct NoInterception;

impl FaultInterception for NoInterception {
    fn install(&self, _plan: &CrashPlan) -> Result<(), CaptureError> {
        crate::diagnostics::warn("No fault interception is available on this platform");
        Ok(())
    }

    fn update(&self, _plan: &CrashPlan) {}
}

#[cfg(unix)]
pub use self::unix::{core_pattern, SignalInterception};

#[cfg(unix)]
mod unix {
    use super::{CrashPlan, FaultInterception};
    use crate::fault::{self, MAX_CORE_PATTERN_LEN};
    use crate::security::sanitize_filename_component;
    use crate::{diagnostics, CaptureError};

    /// Hex characters of the random component kept in a core pattern.
    const PATTERN_RANDOM_LEN: usize = 16;

    /// Fatal signals redirect the kernel's core dumper into the dump
    /// directory, then let the default action produce the core.
    #[derive(Debug, Default)]
    pub struct SignalInterception;

    /// Kernel core pattern for `plan`:
    /// `<dir>/<type>_%t_%p_<random>.core`, or `<dir>/core_%t_%p` if that is
    /// too long, or `None` if even that does not fit.
    pub fn core_pattern(plan: &CrashPlan) -> Option<String> {
        // `%` introduces a specifier in core_pattern
        let directory = plan.directory.to_string_lossy().replace('%', "%%");
        let directory = directory.trim_end_matches('/');
        let random: String = plan
            .random_component
            .chars()
            .take(PATTERN_RANDOM_LEN)
            .collect();

        let full = format!(
            "{directory}/{}_%t_%p_{random}.core",
            sanitize_filename_component(plan.dump_type.as_str())
        );
        if full.len() <= MAX_CORE_PATTERN_LEN {
            return Some(full);
        }

        let short = format!("{directory}/core_%t_%p");
        (short.len() <= MAX_CORE_PATTERN_LEN).then_some(short)
    }

    impl FaultInterception for SignalInterception {
        fn install(&self, plan: &CrashPlan) -> Result<(), CaptureError> {
            if let Err(e) = fault::enable_core_files() {
                diagnostics::warn(&format!("Could not enable kernel core files: {e}"));
            }
            self.update(plan);
            fault::install_handlers().map_err(|e| {
                CaptureError::Unknown(format!("installing signal handlers failed: {e}"))
            })?;
            diagnostics::info("UNIX signal handlers installed");
            Ok(())
        }

        fn update(&self, plan: &CrashPlan) {
            let pattern = core_pattern(plan);
            if !fault::arm(pattern.as_deref().map(str::as_bytes)) {
                diagnostics::warn(
                    "Dump directory is too long for a kernel core pattern, \
                     fault dumps will use the system default location",
                );
            }
        }
    }
}
