// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Captures a dump when a panic is about to end the process.
//!
//! The hook runs on the panicking thread's ordinary stack, so it may log and
//! write files, but the engine may be in any state. It never returns: the
//! process is aborted whether or not the dump was written.

use crate::diagnostics;
use crate::engine::Shared;
use std::panic;
use std::sync::Weak;

/// Chains a capturing hook in front of the currently installed one.
pub(crate) fn install(shared: Weak<Shared>) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        previous(info);

        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string payload");
        let reason = match info.location() {
            Some(location) => format!(
                "unhandled panic at {}:{}: {payload}",
                location.file(),
                location.line()
            ),
            None => format!("unhandled panic: {payload}"),
        };

        diagnostics::error("Unhandled panic detected");
        match shared.upgrade() {
            Some(shared) => match shared.capture_unhandled(&reason) {
                Ok(artifact) => diagnostics::info(&format!(
                    "Panic dump written: {}",
                    artifact.path.display()
                )),
                Err(e) => diagnostics::error(&format!("Failed to write the panic dump: {e}")),
            },
            None => diagnostics::error("Dump capture is gone, skipping the panic dump"),
        }

        std::process::abort();
    }));
}
