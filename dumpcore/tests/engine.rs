// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use dumpcore::{
    CaptureEngine, CaptureError, CrashPlan, DirectoryCreator, DumpFactory, DumpRequest, DumpType,
    ErrorCode, FaultInterception, FsDirectoryCreator, PlatformDumpBackend, SnapshotError,
};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CountingCreator {
    calls: AtomicUsize,
}

impl DirectoryCreator for CountingCreator {
    fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        FsDirectoryCreator.create_dir_all(path)
    }
}

#[derive(Default)]
struct CountingInterception {
    installs: AtomicUsize,
    updates: AtomicUsize,
}

impl FaultInterception for CountingInterception {
    fn install(&self, _plan: &CrashPlan) -> Result<(), CaptureError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, _plan: &CrashPlan) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds every write until the gate is opened.
#[derive(Default)]
struct GatedBackend {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
    in_flight: usize,
    max_in_flight: usize,
}

impl GatedBackend {
    fn wait_for_entries(&self, count: usize) {
        let state = self.state.lock().unwrap();
        let (_state, timeout) = self
            .changed
            .wait_timeout_while(state, Duration::from_secs(10), |s| s.entered < count)
            .unwrap();
        assert!(!timeout.timed_out(), "no capture reached the backend");
    }

    fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }
}

impl PlatformDumpBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn extension(&self) -> &'static str {
        "txt"
    }

    fn write_dump(&self, request: &DumpRequest<'_>) -> Result<u64, SnapshotError> {
        {
            let mut state = self.state.lock().unwrap();
            state.entered += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            self.changed.notify_all();
            let mut state = self.changed.wait_while(state, |s| !s.open).unwrap();
            state.in_flight -= 1;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(request.path)?;
        file.write_all(request.reason.as_bytes())?;
        Ok(request.reason.len() as u64)
    }
}

struct Harness {
    engine: CaptureEngine,
    directories: Arc<CountingCreator>,
    interception: Arc<CountingInterception>,
}

fn harness() -> Harness {
    let directories = Arc::new(CountingCreator::default());
    let interception = Arc::new(CountingInterception::default());
    let engine = CaptureEngine::builder()
        .directory_creator(directories.clone())
        .interception(interception.clone())
        .build();
    Harness {
        engine,
        directories,
        interception,
    }
}

fn foreign_type() -> DumpType {
    if cfg!(windows) {
        DumpType::UnixFull
    } else {
        DumpType::MiniDumpWithFullMemory
    }
}

#[test]
fn initialize_is_idempotent() {
    let scratch = tempfile::tempdir().unwrap();
    let first = scratch.path().join("first");
    let second = scratch.path().join("second");
    let h = harness();

    h.engine
        .initialize(first.to_str().unwrap(), DumpType::AutoDetect, false)
        .unwrap();
    let config = h.engine.current_configuration();
    assert_eq!(config.dump_type, DumpFactory::default_dump_type());
    assert_eq!(config.directory, first.to_str().unwrap());
    assert!(first.is_dir());

    let other = DumpFactory::supported_types()[1];
    h.engine
        .initialize(second.to_str().unwrap(), other, false)
        .unwrap();

    assert_eq!(h.engine.current_configuration(), config);
    assert_eq!(h.engine.dump_directory().as_deref(), Some(first.as_path()));
    assert_eq!(h.directories.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.interception.installs.load(Ordering::SeqCst), 1);
    assert!(!second.exists());
}

#[test]
fn set_dump_type_keeps_the_directory() {
    let scratch = tempfile::tempdir().unwrap();
    let h = harness();
    h.engine
        .initialize(scratch.path().to_str().unwrap(), DumpType::AutoDetect, false)
        .unwrap();
    let directory = h.engine.dump_directory();

    assert!(!h.engine.set_dump_type(foreign_type()).unwrap());
    assert_eq!(h.engine.current_dump_type(), DumpFactory::default_dump_type());
    assert_eq!(h.interception.updates.load(Ordering::SeqCst), 0);

    let other = DumpFactory::supported_types()[1];
    assert!(h.engine.set_dump_type(other).unwrap());
    assert_eq!(h.engine.current_dump_type(), other);
    assert_eq!(h.engine.dump_directory(), directory);
    assert_eq!(
        h.engine.current_configuration().directory,
        scratch.path().to_str().unwrap()
    );
    assert_eq!(h.interception.updates.load(Ordering::SeqCst), 1);
}

#[test]
fn captures_require_initialization() {
    let h = harness();

    assert!(matches!(
        h.engine.generate_dump("early", DumpType::AutoDetect),
        Err(CaptureError::NotInitialized)
    ));
    assert_eq!(
        h.engine.try_generate_dump("early", DumpType::AutoDetect),
        Err(ErrorCode::OperationNotPermitted)
    );
    assert!(matches!(
        h.engine.set_dump_type(DumpType::AutoDetect),
        Err(CaptureError::NotInitialized)
    ));
    assert!(!h.engine.is_initialized());
    assert_eq!(h.engine.dump_directory(), None);
}

#[test]
fn foreign_dump_types_are_invalid_arguments() {
    let scratch = tempfile::tempdir().unwrap();
    let h = harness();
    h.engine
        .initialize(scratch.path().to_str().unwrap(), DumpType::AutoDetect, false)
        .unwrap();

    assert_eq!(
        h.engine.try_generate_dump("wrong platform", foreign_type()),
        Err(ErrorCode::InvalidArgument)
    );
    assert!(matches!(
        h.engine.generate_dump("wrong platform", foreign_type()),
        Err(CaptureError::UnsupportedConfiguration(_))
    ));
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn foreign_initialization_is_refused() {
    let scratch = tempfile::tempdir().unwrap();
    let h = harness();

    let result = h
        .engine
        .initialize(scratch.path().to_str().unwrap(), foreign_type(), false);
    assert!(matches!(
        result,
        Err(CaptureError::UnsupportedConfiguration(_))
    ));
    assert!(!h.engine.is_initialized());
    assert_eq!(h.directories.calls.load(Ordering::SeqCst), 0);
}

#[cfg(target_os = "linux")]
#[test]
fn empty_directory_defaults_next_to_the_executable() {
    let h = harness();
    h.engine.initialize("", DumpType::AutoDetect, false).unwrap();

    let expected = dumpcore::default_directory().unwrap();
    assert_eq!(h.engine.dump_directory().as_deref(), Some(expected.as_path()));
    assert!(expected.is_dir());

    assert!(h.engine.generate_dump("test", DumpType::AutoDetect).unwrap());

    let written: Vec<_> = std::fs::read_dir(&expected)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            let name = path.file_name().unwrap().to_str().unwrap();
            name.starts_with("unix_full_") && name.ends_with(".core")
        })
        .collect();
    assert!(!written.is_empty());

    for path in written {
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 64);
        assert_eq!(&bytes[..4], b"\x7fELF");
        // e_type
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 4);
        std::fs::remove_file(&path).unwrap();
    }
}

#[cfg(target_os = "linux")]
#[test]
fn filtered_cores_respect_the_size_ceiling() {
    let scratch = tempfile::tempdir().unwrap();
    let h = harness();
    h.engine
        .initialize(scratch.path().to_str().unwrap(), DumpType::UnixFiltered, false)
        .unwrap();

    let config = h
        .engine
        .current_configuration()
        .with_memory_filters(["stack", "heap"])
        .with_max_size_bytes(64 * 1024 * 1024);
    assert!(h.engine.generate_dump_with_config(&config, "filtered").unwrap());

    let path = std::fs::read_dir(scratch.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let size = std::fs::metadata(&path).unwrap().len();
    assert!(size > 0);
    assert!(size <= 64 * 1024 * 1024);
    assert!(path
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("unix_filtered_"));
}

#[test]
fn captures_beyond_the_slot_budget_wait_their_turn() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = Arc::new(GatedBackend::default());
    let engine = CaptureEngine::builder()
        .backend(backend.clone())
        .interception(Arc::new(CountingInterception::default()))
        .max_concurrent_operations(1)
        .build();
    engine
        .initialize(scratch.path().to_str().unwrap(), DumpType::AutoDetect, false)
        .unwrap();

    let first = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.generate_dump("first", DumpType::AutoDetect))
    };
    backend.wait_for_entries(1);

    let second = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.try_generate_dump("second", DumpType::AutoDetect))
    };
    std::thread::sleep(Duration::from_millis(200));
    {
        let state = backend.state.lock().unwrap();
        assert_eq!(state.entered, 1, "the second capture did not wait for a slot");
    }
    assert!(!second.is_finished());

    backend.open();
    assert!(first.join().unwrap().unwrap());
    let artifact = second.join().unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(artifact.path).unwrap(), "second");

    let state = backend.state.lock().unwrap();
    assert_eq!(state.entered, 2);
    assert_eq!(state.max_in_flight, 1);
}
