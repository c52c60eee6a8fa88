// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capabilities the engine consumes rather than implements: directory
//! creation, wall clock time and OS entropy.

use chrono::{DateTime, Local};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Creates a directory tree.
pub trait DirectoryCreator: Send + Sync {
    /// Creates `path` and any missing ancestors. Succeeds if the directory
    /// already exists.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Wall clock.
pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> DateTime<Local>;
}

/// Cryptographic random bytes.
pub trait EntropySource: Send + Sync {
    /// Fills `dest` completely or fails.
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<(), rand::Error>;
}

/// Creates directories one level at a time, tolerating concurrent creators.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDirectoryCreator;

impl DirectoryCreator for FsDirectoryCreator {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                self.create_dir_all(parent)?;
            }
        }

        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }

        match builder.create(path) {
            Ok(()) => Ok(()),
            // Lost a race with another creator
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Local system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// The operating system's random number generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<(), rand::Error> {
        OsRng.try_fill_bytes(dest)
    }
}

/// The set of collaborators an engine is built with.
#[derive(Clone)]
pub struct Collaborators {
    /// Directory creation
    pub directories: Arc<dyn DirectoryCreator>,
    /// Time source for filenames and log lines
    pub clock: Arc<dyn Clock>,
    /// Random source for filenames
    pub entropy: Arc<dyn EntropySource>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            directories: Arc::new(FsDirectoryCreator),
            clock: Arc::new(SystemClock),
            entropy: Arc::new(OsEntropy),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
