// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Gathering process state on Linux and writing it as an ELF core file.

pub(crate) mod memory;
mod process;
pub(crate) mod ptrace;
mod snapshot;

pub(crate) use process::ProcessView;
pub use snapshot::LinuxCoreBackend;
