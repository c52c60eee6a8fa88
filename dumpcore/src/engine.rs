// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The capture engine: lifecycle, manual captures and the two error
//! reporting surfaces.

use crate::backend::{default_backend, DumpRequest, PlatformDumpBackend};
use crate::collaborators::{Clock, Collaborators, DirectoryCreator, EntropySource};
use crate::interception::{default_interception, CrashPlan, FaultInterception};
use crate::security::{
    build_dump_filename, generate_random_component_with, sanitize_path, strip_control_characters,
    validate_directory, validate_filename,
};
use crate::throttle::{OperationSlots, MAX_CONCURRENT_OPERATIONS};
use crate::{
    diagnostics, panic_hook, CaptureError, DumpConfiguration, DumpFactory, DumpType, ErrorCode,
    ErrorKind,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};

/// Format of the timestamp in generated filenames.
const TIMESTAMP_FORMAT: &str = "%d.%m.%Y.%H.%M.%S";

/// Filename prefix of dumps written for unhandled panics.
pub const UNHANDLED_PANIC_PREFIX: &str = "unhandled_panic";

/// Name of the directory created next to the executable when no dump
/// directory is configured.
pub const DEFAULT_DIRECTORY_NAME: &str = "dumps";

/// A dump file written by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpArtifact {
    /// Location of the file
    pub path: PathBuf,
    /// Type the dump was written as
    pub dump_type: DumpType,
    /// Size of the file on disk
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Default)]
struct EngineState {
    directory: PathBuf,
    config: DumpConfiguration,
    crash_random: String,
}

impl EngineState {
    fn crash_plan(&self) -> CrashPlan {
        CrashPlan {
            directory: self.directory.clone(),
            dump_type: self.config.dump_type,
            random_component: self.crash_random.clone(),
        }
    }
}

pub(crate) struct Shared {
    initialized: AtomicBool,
    lifecycle: Mutex<()>,
    state: RwLock<EngineState>,
    slots: OperationSlots,
    backend: Arc<dyn PlatformDumpBackend>,
    interception: Arc<dyn FaultInterception>,
    collaborators: Collaborators,
}

/// Installs crash interception for the process and writes dumps on demand.
///
/// Most programs use the process-wide engine returned by [`crate::global`].
/// Separate engines can be built with [`CaptureEngine::builder`], but only
/// one of them should install fault interception, since signal handlers and
/// exception filters are process-wide.
///
/// ```no_run
/// use dumpcore::{CaptureEngine, DumpType};
///
/// let engine = CaptureEngine::builder().build();
/// engine.initialize("/var/crash/myapp", DumpType::AutoDetect, true)?;
/// if !engine.generate_dump("configuration reloaded", DumpType::AutoDetect)? {
///     eprintln!("dump failed, see the log");
/// }
/// # Ok::<(), dumpcore::CaptureError>(())
/// ```
#[derive(Clone)]
pub struct CaptureEngine {
    shared: Arc<Shared>,
}

/// Builds a [`CaptureEngine`] with replaced collaborators.
pub struct CaptureEngineBuilder {
    backend: Option<Arc<dyn PlatformDumpBackend>>,
    interception: Option<Arc<dyn FaultInterception>>,
    collaborators: Collaborators,
    max_concurrent_operations: usize,
}

impl Default for CaptureEngineBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            interception: None,
            collaborators: Collaborators::default(),
            max_concurrent_operations: MAX_CONCURRENT_OPERATIONS,
        }
    }
}

impl CaptureEngineBuilder {
    /// Dump facility, [`default_backend`] if not set.
    pub fn backend(mut self, backend: Arc<dyn PlatformDumpBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Fault interception, [`default_interception`] if not set.
    pub fn interception(mut self, interception: Arc<dyn FaultInterception>) -> Self {
        self.interception = Some(interception);
        self
    }

    /// Directory creation primitive.
    pub fn directory_creator(mut self, directories: Arc<dyn DirectoryCreator>) -> Self {
        self.collaborators.directories = directories;
        self
    }

    /// Time source for filenames.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.collaborators.clock = clock;
        self
    }

    /// Random source for filenames.
    pub fn entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.collaborators.entropy = entropy;
        self
    }

    /// Number of manual captures allowed in flight at once.
    pub fn max_concurrent_operations(mut self, max: usize) -> Self {
        self.max_concurrent_operations = max;
        self
    }

    /// Builds an uninitialized engine.
    pub fn build(self) -> CaptureEngine {
        let backend = self.backend.unwrap_or_else(|| Arc::from(default_backend()));
        let interception = self
            .interception
            .unwrap_or_else(|| Arc::from(default_interception()));

        CaptureEngine {
            shared: Arc::new(Shared {
                initialized: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                state: RwLock::new(EngineState::default()),
                slots: OperationSlots::new(self.max_concurrent_operations),
                backend,
                interception,
                collaborators: self.collaborators,
            }),
        }
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("initialized", &self.is_initialized())
            .field("backend", &self.shared.backend.name())
            .finish_non_exhaustive()
    }
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CaptureEngine {
    /// Starts building an engine.
    pub fn builder() -> CaptureEngineBuilder {
        CaptureEngineBuilder::default()
    }

    /// Initializes the engine with the default configuration of `dump_type`.
    ///
    /// An empty `directory` selects `dumps` next to the executable.
    pub fn initialize(
        &self,
        directory: &str,
        dump_type: DumpType,
        handle_unhandled_exceptions: bool,
    ) -> Result<(), CaptureError> {
        let config = DumpFactory::create_configuration(dump_type).with_directory(directory);
        self.initialize_with(config, handle_unhandled_exceptions)
    }

    /// Validates `config`, creates its directory, installs fault
    /// interception and, if asked, the unhandled panic hook.
    ///
    /// Only the first successful call has an effect; later calls are logged
    /// and return `Ok`. On failure the engine stays uninitialized.
    pub fn initialize_with(
        &self,
        mut config: DumpConfiguration,
        handle_unhandled_exceptions: bool,
    ) -> Result<(), CaptureError> {
        let _lifecycle = self.lock_lifecycle();
        if self.shared.initialized.load(Ordering::Acquire) {
            diagnostics::info("Dump capture is already initialized");
            return Ok(());
        }

        let result = self.initialize_locked(&mut config, handle_unhandled_exceptions);
        if let Err(e) = &result {
            diagnostics::error(&format!("Failed to initialize dump capture: {e}"));
        }
        result
    }

    fn initialize_locked(
        &self,
        config: &mut DumpConfiguration,
        handle_unhandled_exceptions: bool,
    ) -> Result<(), CaptureError> {
        config.dump_type = config.dump_type.resolve();
        check_configuration(config)?;

        let directory = resolve_directory(&config.directory)?;
        self.create_directory(&directory)?;
        config.directory = directory.to_string_lossy().into_owned();
        diagnostics::info(&format!("Dump directory created: {}", directory.display()));
        diagnostics::info(&format!("Dump type: {}", config.dump_type.description()));
        if config.max_size_bytes > 0 {
            diagnostics::info(&format!("Max size: {} bytes", config.max_size_bytes));
        }

        let state = EngineState {
            directory,
            config: config.clone(),
            crash_random: generate_random_component_with(&*self.shared.collaborators.entropy)
                .value,
        };
        self.shared.interception.install(&state.crash_plan())?;
        *self.write_state() = state;

        if handle_unhandled_exceptions {
            panic_hook::install(Arc::downgrade(&self.shared));
            diagnostics::info("Unhandled panic capture enabled");
        }

        self.shared.initialized.store(true, Ordering::Release);
        diagnostics::info("Dump capture initialized");
        Ok(())
    }

    /// Returns `true` once [`CaptureEngine::initialize`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// The directory dumps are written to, once initialized.
    pub fn dump_directory(&self) -> Option<PathBuf> {
        self.is_initialized()
            .then(|| self.read_state().directory.clone())
    }

    /// The configuration used for dumps of type [`DumpType::AutoDetect`].
    /// Before initialization this is the default configuration.
    pub fn current_configuration(&self) -> DumpConfiguration {
        self.read_state().config.clone()
    }

    /// Dump type of the current configuration.
    pub fn current_dump_type(&self) -> DumpType {
        self.read_state().config.dump_type
    }

    /// Replaces the current configuration with the default configuration of
    /// `dump_type`, keeping the dump directory.
    ///
    /// Returns `Ok(false)` if the type is not supported on this platform.
    pub fn set_dump_type(&self, dump_type: DumpType) -> Result<bool, CaptureError> {
        let _lifecycle = self.lock_lifecycle();
        self.ensure_initialized()?;

        if !DumpFactory::is_supported(dump_type) {
            diagnostics::error(&format!(
                "Dump type {dump_type} is not supported on this platform"
            ));
            return Ok(false);
        }

        let plan = {
            let mut state = self.write_state();
            let directory = state.config.directory.clone();
            state.config = DumpFactory::create_configuration(dump_type).with_directory(directory);
            state.crash_plan()
        };
        self.shared.interception.update(&plan);
        Ok(true)
    }

    /// Writes a dump of the calling process.
    ///
    /// [`DumpType::AutoDetect`] uses the current configuration; any other
    /// type uses its default configuration in the current directory. Waits
    /// for a free operation slot first.
    pub fn capture_dump(
        &self,
        reason: &str,
        dump_type: DumpType,
    ) -> Result<DumpArtifact, CaptureError> {
        self.ensure_initialized()?;
        if !DumpFactory::is_supported(dump_type) {
            return Err(CaptureError::UnsupportedConfiguration(format!(
                "dump type {dump_type} is not supported on this platform"
            )));
        }

        let state = self.read_state().clone();
        let config = match dump_type {
            DumpType::AutoDetect => state.config,
            explicit => {
                DumpFactory::create_configuration(explicit).with_directory(state.config.directory)
            }
        };

        let _slot = self.shared.slots.acquire();
        self.shared
            .write_artifact(&state.directory, &config, config.dump_type.as_str(), reason)
    }

    /// Writes a dump, reporting rejected requests as errors and failed
    /// captures as `Ok(false)`.
    pub fn generate_dump(&self, reason: &str, dump_type: DumpType) -> Result<bool, CaptureError> {
        outcome(self.capture_dump(reason, dump_type))
    }

    /// Writes a dump, mapping every failure onto an [`ErrorCode`].
    pub fn try_generate_dump(
        &self,
        reason: &str,
        dump_type: DumpType,
    ) -> Result<DumpArtifact, ErrorCode> {
        self.capture_dump(reason, dump_type).map_err(|e| {
            diagnostics::error(&format!("Failed to generate dump: {e}"));
            e.code()
        })
    }

    /// Writes a dump with an externally supplied configuration.
    ///
    /// The configuration is validated first. A non-empty directory in it is
    /// validated and created; an empty one selects the current directory.
    pub fn generate_dump_with_config(
        &self,
        config: &DumpConfiguration,
        reason: &str,
    ) -> Result<bool, CaptureError> {
        outcome(self.capture_with_config(config, reason))
    }

    fn capture_with_config(
        &self,
        config: &DumpConfiguration,
        reason: &str,
    ) -> Result<DumpArtifact, CaptureError> {
        self.ensure_initialized()?;

        let mut config = config.clone();
        config.dump_type = config.dump_type.resolve();
        check_configuration(&config)?;

        let directory = if config.directory.is_empty() {
            self.read_state().directory.clone()
        } else {
            let directory = resolve_directory(&config.directory)?;
            self.create_directory(&directory)?;
            directory
        };

        let _slot = self.shared.slots.acquire();
        self.shared
            .write_artifact(&directory, &config, config.dump_type.as_str(), reason)
    }

    fn ensure_initialized(&self) -> Result<(), CaptureError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CaptureError::NotInitialized)
        }
    }

    fn create_directory(&self, directory: &Path) -> Result<(), CaptureError> {
        self.shared
            .collaborators
            .directories
            .create_dir_all(directory)
            .map_err(|e| {
                CaptureError::filesystem(
                    format!("failed to create dump directory {}", directory.display()),
                    e,
                )
            })
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, ()> {
        self.shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, EngineState> {
        self.shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, EngineState> {
        self.shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shared {
    /// Captures a dump for an unhandled panic, without waiting for a slot.
    ///
    /// Works on a copy of the state; if the state is locked the capture is
    /// skipped rather than risking a deadlock with the panicking thread.
    pub(crate) fn capture_unhandled(&self, reason: &str) -> Result<DumpArtifact, CaptureError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(CaptureError::NotInitialized);
        }

        let state = match self.state.try_read() {
            Ok(state) => state.clone(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
            Err(TryLockError::WouldBlock) => {
                return Err(CaptureError::Unknown(
                    "capture state is locked by another thread".to_owned(),
                ))
            }
        };

        self.write_artifact(
            &state.directory,
            &state.config,
            UNHANDLED_PANIC_PREFIX,
            reason,
        )
    }

    /// Writes one dump and logs how long it took.
    fn write_artifact(
        &self,
        directory: &Path,
        config: &DumpConfiguration,
        prefix: &str,
        reason: &str,
    ) -> Result<DumpArtifact, CaptureError> {
        let started = Instant::now();
        let result = self.write_dump_file(directory, config, prefix, reason);
        CaptureMetrics {
            duration: started.elapsed(),
            size_bytes: result.as_ref().map_or(0, |artifact| artifact.size_bytes),
            success: result.is_ok(),
        }
        .log();
        result
    }

    fn write_dump_file(
        &self,
        directory: &Path,
        config: &DumpConfiguration,
        prefix: &str,
        reason: &str,
    ) -> Result<DumpArtifact, CaptureError> {
        let path = if config.filename.is_empty() {
            let timestamp = self
                .collaborators
                .clock
                .now()
                .format(TIMESTAMP_FORMAT)
                .to_string();
            let random = generate_random_component_with(&*self.collaborators.entropy);
            build_dump_filename(
                directory,
                prefix,
                &timestamp,
                &random,
                self.backend.extension(),
            )
        } else if validate_filename(&config.filename) {
            directory.join(&config.filename)
        } else {
            return Err(CaptureError::Validation(format!(
                "invalid dump filename: {}",
                config.filename
            )));
        };

        diagnostics::info(&format!("Generating dump: {reason}"));
        diagnostics::info(&format!("Dump type: {}", config.dump_type.description()));

        let request = DumpRequest {
            path: &path,
            dump_type: config.dump_type,
            max_size_bytes: config.max_size_bytes,
            memory_filters: &config.memory_filters,
            compress: config.compress,
            reason,
        };
        let written = self.backend.write_dump(&request)?;

        let size_bytes = match std::fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                diagnostics::warn(&format!("Could not verify the dump size: {e}"));
                written
            }
        };
        diagnostics::info(&format!(
            "Dump written: {} ({size_bytes} bytes)",
            path.display()
        ));

        Ok(DumpArtifact {
            path,
            dump_type: config.dump_type,
            size_bytes,
        })
    }
}

/// Cost of one capture attempt.
struct CaptureMetrics {
    duration: Duration,
    size_bytes: u64,
    success: bool,
}

impl CaptureMetrics {
    fn log(&self) {
        diagnostics::info(&format!(
            "Performance: {}ms, Size: {} bytes, Success: {}",
            self.duration.as_millis(),
            self.size_bytes,
            self.success
        ));
    }
}

/// Rejects configurations that are invalid or foreign to this platform.
fn check_configuration(config: &DumpConfiguration) -> Result<(), CaptureError> {
    config
        .validate()
        .map_err(|e| CaptureError::UnsupportedConfiguration(e.to_string()))?;
    if !DumpFactory::is_supported(config.dump_type) {
        return Err(CaptureError::UnsupportedConfiguration(format!(
            "dump type {} is not supported on this platform",
            config.dump_type
        )));
    }
    Ok(())
}

/// Sanitizes and validates a dump directory, defaulting to `dumps` next to
/// the executable.
fn resolve_directory(directory: &str) -> Result<PathBuf, CaptureError> {
    let directory = if directory.is_empty() {
        default_directory()?.to_string_lossy().into_owned()
    } else {
        directory.to_owned()
    };

    // The path used is the one validated
    let sanitized = strip_control_characters(&sanitize_path(&directory));
    if !validate_directory(&sanitized) {
        return Err(CaptureError::Validation(format!(
            "invalid dump directory: {sanitized}"
        )));
    }
    Ok(PathBuf::from(sanitized))
}

/// `dumps` in the directory of the running executable.
pub fn default_directory() -> Result<PathBuf, CaptureError> {
    let exe = std::env::current_exe()
        .map_err(|e| CaptureError::filesystem("failed to locate the executable", e))?;
    let parent = exe.parent().ok_or_else(|| {
        CaptureError::Unknown(format!("executable {} has no parent", exe.display()))
    })?;
    Ok(parent.join(DEFAULT_DIRECTORY_NAME))
}

/// Splits capture results into rejected requests and failed captures.
fn outcome(result: Result<DumpArtifact, CaptureError>) -> Result<bool, CaptureError> {
    match result {
        Ok(_) => Ok(true),
        Err(e) => match e.kind() {
            ErrorKind::NotInitialized
            | ErrorKind::UnsupportedConfiguration
            | ErrorKind::Validation => Err(e),
            ErrorKind::Filesystem | ErrorKind::Unknown => {
                diagnostics::error(&format!("Failed to generate dump: {e}"));
                Ok(false)
            }
        },
    }
}
