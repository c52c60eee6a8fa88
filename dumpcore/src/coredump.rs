// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Streams an ELF core file out of a [`ProcessView`].
//!
//! Panics must be avoided as they may leave the snapshot process stopped.
//! Nothing here seeks backwards, so the output can be any `Write`.

use crate::elf::*;
use crate::linux::memory::{memory_reader, ReadProcessMemory};
use crate::linux::ProcessView;
use crate::{DumpType, SnapshotError};
use smallvec::{smallvec, SmallVec};
use std::io::Write;
use std::mem::size_of;
use zerocopy::{Immutable, IntoBytes};

const ELF_HEADER_ALIGN: u64 = 8;
const ELF_NOTE_ALIGN: u64 = 4;

/// Bytes written for memory that could not be read.
const UNREADABLE_FILL: u8 = 0xf1;

/// Wraps a `Write` to track the file offset and pad forward.
struct ElfCoreWriter<T: Write> {
    writer: T,
    written: usize,
}

impl<T: Write> Write for ElfCoreWriter<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.written += written;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl<T: Write> ElfCoreWriter<T> {
    fn new(writer: T) -> Self {
        Self { writer, written: 0 }
    }

    fn position(&self) -> usize {
        self.written
    }

    fn align_position(&mut self, alignment: u64) -> std::io::Result<usize> {
        let padding = (round_up(self.written as u64, alignment) - self.written as u64) as usize;
        let zeros: SmallVec<[u8; 0x1000]> = smallvec![0; padding];
        self.write_all(&zeros)?;
        Ok(padding)
    }
}

#[derive(IntoBytes, Immutable)]
#[repr(C, packed)]
struct MappedFilesNoteIntro {
    file_count: u64,
    page_size: u64,
}

#[derive(IntoBytes, Immutable)]
#[repr(C, packed)]
struct MappedFilesNoteItem {
    start_addr: u64,
    end_addr: u64,
    page_count: u64,
}

/// Access rights of a mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VaProtection {
    pub is_private: bool,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

/// One mapping of the address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VaRegion {
    pub begin: u64,
    pub end: u64,
    pub offset: u64,
    pub protection: VaProtection,
    /// File path or a kernel label such as `[stack]`
    pub pathname: Option<String>,
}

impl VaRegion {
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    /// Path of the mapped file, if the region is file backed.
    pub fn mapped_file(&self) -> Option<&str> {
        self.pathname.as_deref().filter(|p| p.starts_with('/'))
    }

    fn segment_flags(&self) -> u32 {
        let mut flags = 0;
        if self.protection.execute {
            flags |= PF_X;
        }
        if self.protection.write {
            flags |= PF_W;
        }
        if self.protection.read {
            flags |= PF_R;
        }
        flags
    }
}

#[derive(Debug)]
pub struct MappedFileRegion {
    pub begin: u64,
    pub end: u64,
    pub offset: u64,
}

#[derive(Debug)]
pub struct MappedFile {
    pub name: String,
    pub regions: Vec<MappedFileRegion>,
}

/// Which memory regions a dump type keeps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionPolicy {
    /// Anonymous and ELF-backed regions
    Everything,
    /// Writable regions; read-only images can be recovered from disk
    WritableOnly,
    /// Thread state, auxiliary vector and file list only
    NotesOnly,
    /// Regions whose label or mapped file matches one of the filters
    Matching(Vec<String>),
}

impl RegionPolicy {
    pub fn for_dump_type(dump_type: DumpType, filters: &[String]) -> Result<Self, SnapshotError> {
        match dump_type.resolve() {
            DumpType::UnixFull | DumpType::UnixCompressed => Ok(Self::Everything),
            DumpType::UnixUserOnly => Ok(Self::WritableOnly),
            DumpType::UnixKernelOnly => Ok(Self::NotesOnly),
            DumpType::UnixFiltered => Ok(Self::Matching(filters.to_vec())),
            other => Err(SnapshotError::UnsupportedType(other)),
        }
    }

    pub fn admits(&self, region: &VaRegion) -> bool {
        match self {
            Self::Everything => true,
            Self::WritableOnly => region.protection.write,
            Self::NotesOnly => false,
            Self::Matching(filters) => {
                let Some(pathname) = region.pathname.as_deref() else {
                    return false;
                };
                filters.iter().any(|filter| match pathname.strip_prefix('[') {
                    // `[stack]`, and `[stack:1234]` on older kernels
                    Some(label) => {
                        let label = label.trim_end_matches(']');
                        label == filter || label.split(':').next() == Some(filter.as_str())
                    }
                    None => pathname.contains(filter.as_str()),
                })
            }
        }
    }
}

#[derive(Debug, Default)]
struct NoteSizes {
    process_info: usize,
    process_status: usize,
    aux_vector: usize,
    mapped_files: usize,
    custom: usize,
    total_note_size: usize,
}

/// File layout decided before anything is written.
struct CoreLayout<'a> {
    notes: NoteSizes,
    regions: Vec<&'a VaRegion>,
    skipped: usize,
    /// Offset of the notes, right after the headers
    note_offset: u64,
    /// Offset of the first memory segment
    data_offset: u64,
}

impl<'a> CoreLayout<'a> {
    fn plan(
        pv: &'a ProcessView,
        policy: &RegionPolicy,
        max_size_bytes: u64,
    ) -> Result<Self, SnapshotError> {
        let notes = get_elf_notes_sizes(pv)?;
        let page_size = pv.page_size as u64;
        let offsets = |region_count: usize| {
            let note_offset = headers_size(region_count);
            let data_offset = round_up(note_offset + notes.total_note_size as u64, page_size);
            (note_offset, data_offset)
        };

        let stack_pointers: Vec<u64> = pv
            .threads
            .iter()
            .map(|thread| thread.arch_state.greg_set().stack_pointer())
            .filter(|sp| *sp != 0)
            .collect();
        let candidates = pv.va_regions.iter().filter(|r| policy.admits(r));
        let (regions, skipped) = select_regions(candidates, &stack_pointers, |count, memory_size| {
            let (_, data_offset) = offsets(count);
            max_size_bytes == 0 || data_offset + memory_size <= max_size_bytes
        });

        if regions.len() >= usize::from(u16::MAX) {
            return Err(SnapshotError::InternalError("too many memory regions"));
        }

        let (note_offset, data_offset) = offsets(regions.len());
        Ok(Self {
            notes,
            regions,
            skipped,
            note_offset,
            data_offset,
        })
    }
}

/// Whether `region` holds a thread stack: the main stack's label, or the
/// mapping a stopped thread's stack pointer falls in.
fn is_stack(region: &VaRegion, stack_pointers: &[u64]) -> bool {
    region
        .pathname
        .as_deref()
        .is_some_and(|p| p.starts_with("[stack"))
        || stack_pointers
            .iter()
            .any(|sp| (region.begin..region.end).contains(sp))
}

/// Admits regions while `fits(region_count, memory_size)` holds, stacks
/// first and then the rest in address order. Returns the admitted regions
/// in address order along with the number left out.
fn select_regions<'a>(
    candidates: impl Iterator<Item = &'a VaRegion>,
    stack_pointers: &[u64],
    fits: impl Fn(usize, u64) -> bool,
) -> (Vec<&'a VaRegion>, usize) {
    let mut candidates: Vec<_> = candidates.enumerate().collect();
    candidates.sort_by_key(|(index, region)| (!is_stack(region, stack_pointers), *index));

    let mut admitted = Vec::with_capacity(candidates.len());
    let mut skipped = 0;
    let mut memory_size = 0_u64;
    for (index, region) in candidates {
        if !fits(admitted.len() + 1, memory_size + region.len()) {
            skipped += 1;
            continue;
        }
        memory_size += region.len();
        admitted.push((index, region));
    }

    admitted.sort_by_key(|(index, _)| *index);
    (admitted.into_iter().map(|(_, region)| region).collect(), skipped)
}

fn headers_size(region_count: usize) -> u64 {
    // One PT_NOTE and a PT_LOAD per region
    let phdrs = (size_of::<Elf64_Phdr>() * (region_count + 1)) as u64;
    round_up(size_of::<Elf64_Ehdr>() as u64, ELF_HEADER_ALIGN) + round_up(phdrs, ELF_HEADER_ALIGN)
}

fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn note_size(name: &[u8], desc_len: usize) -> usize {
    size_of::<Elf64_Nhdr>()
        + round_up(name.len() as u64 + 1, ELF_NOTE_ALIGN) as usize
        + round_up(desc_len as u64, ELF_NOTE_ALIGN) as usize
}

fn mapped_files_note_data(pv: &ProcessView) -> Vec<u8> {
    let mut data = Vec::with_capacity(pv.page_size);

    let intro = MappedFilesNoteIntro {
        file_count: pv.mapped_files.iter().map(|f| f.regions.len() as u64).sum(),
        // Offsets below are in bytes
        page_size: 1,
    };
    data.extend_from_slice(intro.as_bytes());

    for mapped_file in &pv.mapped_files {
        for region in &mapped_file.regions {
            let item = MappedFilesNoteItem {
                start_addr: region.begin,
                end_addr: region.end,
                page_count: region.offset,
            };
            data.extend_from_slice(item.as_bytes());
        }
    }

    for mapped_file in &pv.mapped_files {
        for _ in &mapped_file.regions {
            data.extend_from_slice(mapped_file.name.as_bytes());
            data.push(0);
        }
    }

    data
}

fn get_elf_notes_sizes(pv: &ProcessView) -> Result<NoteSizes, SnapshotError> {
    if pv.threads.is_empty() {
        return Err(SnapshotError::InternalError("no threads to describe"));
    }

    let process_info = note_size(b"CORE", size_of::<prpsinfo_t>());
    let process_status = pv
        .threads
        .iter()
        .map(|thread| {
            note_size(b"CORE", size_of::<prstatus_t>())
                + thread
                    .arch_state
                    .components()
                    .iter()
                    .map(|c| note_size(c.note_name, c.data.len()))
                    .sum::<usize>()
                + note_size(b"CORE", size_of::<siginfo_t>())
        })
        .sum();
    let aux_vector = note_size(b"CORE", pv.aux_vector.as_bytes().len());
    let mapped_files = note_size(b"CORE", mapped_files_note_data(pv).len());
    let custom = pv
        .custom_notes
        .iter()
        .map(|(name, data)| note_size(name.as_bytes(), data.len()))
        .sum();

    let total_note_size = process_info + process_status + aux_vector + mapped_files + custom;
    tracing::debug!(
        process_info,
        process_status,
        aux_vector,
        mapped_files,
        custom,
        total_note_size,
        "Note sizes"
    );

    Ok(NoteSizes {
        process_info,
        process_status,
        aux_vector,
        mapped_files,
        custom,
        total_note_size,
    })
}

/// Writes an ELF core file for `pv`, keeping the regions `policy` admits
/// while the file stays within `max_size_bytes` (0 is unlimited). Headers
/// and notes are always written.
///
/// Returns the number of bytes written.
pub fn write_core_dump<T: Write>(
    writer: T,
    pv: &ProcessView,
    policy: &RegionPolicy,
    max_size_bytes: u64,
) -> Result<usize, SnapshotError> {
    let mut writer = ElfCoreWriter::new(writer);
    let layout = CoreLayout::plan(pv, policy, max_size_bytes)?;

    tracing::debug!(
        "Writing core for process {}: {} regions, {} skipped by the size ceiling",
        pv.pid,
        layout.regions.len(),
        layout.skipped
    );

    write_elf_header(&mut writer, &layout)?;
    writer.align_position(ELF_HEADER_ALIGN)?;
    write_program_headers(&mut writer, pv, &layout)?;
    writer.align_position(ELF_HEADER_ALIGN)?;
    if writer.position() as u64 != layout.note_offset {
        return Err(SnapshotError::InternalError("Mismatched header size"));
    }
    write_elf_notes(&mut writer, pv, &layout.notes)?;
    writer.align_position(pv.page_size as u64)?;
    if !layout.regions.is_empty() {
        write_va_regions(&mut writer, pv, &layout)?;
    }
    writer.flush()?;

    tracing::debug!("Wrote {} bytes for ELF core dump", writer.position());
    Ok(writer.position())
}

fn write_elf_header<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    layout: &CoreLayout<'_>,
) -> Result<(), SnapshotError> {
    let elf_header = Elf64_Ehdr::core(1 + layout.regions.len() as u16);
    writer.write_all(elf_header.as_bytes())?;
    Ok(())
}

fn write_program_headers<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    pv: &ProcessView,
    layout: &CoreLayout<'_>,
) -> Result<(), SnapshotError> {
    tracing::trace!("Writing program headers at offset {}", writer.position());

    let note_size = layout.notes.total_note_size as u64;
    let note_header = Elf64_Phdr {
        p_type: PT_NOTE,
        p_flags: 0,
        p_offset: layout.note_offset,
        p_vaddr: 0,
        p_paddr: 0,
        p_filesz: note_size,
        p_memsz: note_size,
        p_align: 1,
    };
    writer.write_all(note_header.as_bytes())?;

    let mut offset = layout.data_offset;
    for region in &layout.regions {
        let segment_header = Elf64_Phdr {
            p_type: PT_LOAD,
            p_flags: region.segment_flags(),
            p_offset: offset,
            p_vaddr: region.begin,
            p_paddr: 0,
            p_filesz: region.len(),
            p_memsz: region.len(),
            p_align: pv.page_size as u64,
        };
        writer.write_all(segment_header.as_bytes())?;
        offset += region.len();
    }

    Ok(())
}

fn write_elf_note<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    note_kind: u32,
    name: &[u8],
    data: &[u8],
) -> Result<usize, SnapshotError> {
    let start = writer.position();

    let header = Elf64_Nhdr {
        // The terminating zero is counted; readelf and gdb insist on it
        namesz: name.len() as u32 + 1,
        descsz: data.len() as u32,
        ntype: note_kind,
    };
    writer.write_all(header.as_bytes())?;
    writer.write_all(name)?;
    writer.write_all(&[0])?;
    writer.align_position(ELF_NOTE_ALIGN)?;
    writer.write_all(data)?;
    writer.align_position(ELF_NOTE_ALIGN)?;

    Ok(writer.position() - start)
}

fn copy_truncated<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0_u8; N];
    let bytes = text.as_bytes();
    // Leave room for a terminating zero
    let len = bytes.len().min(N - 1);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn timeval(ticks: u64, clock_ticks: u64) -> pr_timeval_t {
    let clock_ticks = clock_ticks.max(1);
    pr_timeval_t {
        tv_sec: ticks / clock_ticks,
        tv_usec: (ticks % clock_ticks) * 1_000_000 / clock_ticks,
    }
}

fn write_process_info_note<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    pv: &ProcessView,
) -> Result<usize, SnapshotError> {
    let main = pv
        .threads
        .iter()
        .find(|t| t.tid == pv.pid)
        .or_else(|| pv.threads.first())
        .ok_or(SnapshotError::InternalError("no threads to describe"))?;

    let info = prpsinfo_t {
        pr_state: main.stat.state,
        pr_sname: main.stat.state,
        pr_zomb: u8::from(main.stat.state == b'Z'),
        pr_nice: main.stat.nice as u8,
        pad0: 0,
        pr_flag: u64::from(main.stat.flags),
        pr_uid: main.status.uid,
        pr_gid: main.status.gid,
        pr_pid: pv.pid.as_raw() as u32,
        pr_ppid: main.stat.ppid as u32,
        pr_pgrp: main.stat.pgrp as u32,
        pr_sid: main.stat.session as u32,
        pr_fname: copy_truncated(&main.stat.comm),
        pr_psargs: copy_truncated(&main.cmd_line),
    };

    write_elf_note(writer, NT_PRPSINFO, b"CORE", info.as_bytes())
}

fn write_process_status_notes<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    pv: &ProcessView,
) -> Result<usize, SnapshotError> {
    let mut written = 0;

    for thread in &pv.threads {
        let regs = thread.arch_state.greg_set();
        tracing::trace!(
            "Thread {}: pc 0x{:x}, sp 0x{:x}",
            thread.tid,
            regs.instruction_pointer(),
            regs.stack_pointer()
        );

        let status = prstatus_t {
            si_signo: 0,
            si_code: 0,
            si_errno: 0,
            pr_cursig: 0,
            pad0: 0,
            pr_sigpend: thread.status.sigpend,
            pr_sighold: thread.status.sighold,
            pr_pid: thread.tid.as_raw() as u32,
            pr_ppid: thread.stat.ppid as u32,
            pr_pgrp: thread.stat.pgrp as u32,
            pr_sid: thread.stat.session as u32,
            pr_utime: timeval(thread.stat.utime, pv.clock_ticks),
            pr_stime: timeval(thread.stat.stime, pv.clock_ticks),
            pr_cutime: timeval(thread.stat.cutime, pv.clock_ticks),
            pr_cstime: timeval(thread.stat.cstime, pv.clock_ticks),
            pr_reg: regs,
            pr_fpvalid: u32::from(thread.arch_state.has_fp_state()),
            pad1: 0,
        };
        written += write_elf_note(writer, NT_PRSTATUS, b"CORE", status.as_bytes())?;

        for component in thread.arch_state.components() {
            tracing::trace!("Writing {} state of thread {}", component.name, thread.tid);
            written += write_elf_note(
                writer,
                component.note_type,
                component.note_name,
                &component.data,
            )?;
        }

        let signals = siginfo_t {
            si_signo: 0,
            si_errno: 0,
            si_code: 0,
            pad0: 0,
            si_data: [0; 28],
        };
        written += write_elf_note(writer, NT_SIGINFO, b"CORE", signals.as_bytes())?;
    }

    Ok(written)
}

fn write_custom_notes<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    pv: &ProcessView,
) -> Result<usize, SnapshotError> {
    let mut written = 0;
    for (name, data) in &pv.custom_notes {
        written += write_elf_note(writer, NT_CUSTOM, name.as_bytes(), data)?;
    }
    Ok(written)
}

fn write_elf_notes<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    pv: &ProcessView,
    note_sizes: &NoteSizes,
) -> Result<(), SnapshotError> {
    tracing::trace!("Writing notes at offset {}", writer.position());

    let check = |written: usize, expected: usize, what: &'static str| {
        if written == expected {
            Ok(())
        } else {
            Err(SnapshotError::InternalError(what))
        }
    };

    check(
        write_process_info_note(writer, pv)?,
        note_sizes.process_info,
        "Mismatched process info note size",
    )?;
    check(
        write_process_status_notes(writer, pv)?,
        note_sizes.process_status,
        "Mismatched process status note size",
    )?;
    check(
        write_elf_note(writer, NT_AUXV, b"CORE", pv.aux_vector.as_bytes())?,
        note_sizes.aux_vector,
        "Mismatched aux vector note size",
    )?;
    check(
        write_elf_note(writer, NT_FILE, b"CORE", &mapped_files_note_data(pv))?,
        note_sizes.mapped_files,
        "Mismatched mapped files note size",
    )?;
    check(
        write_custom_notes(writer, pv)?,
        note_sizes.custom,
        "Mismatched custom note size",
    )
}

fn write_va_region<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    region: &VaRegion,
    page_size: u64,
    memory_reader: &mut dyn ReadProcessMemory,
    buffer: &mut [u8],
) -> Result<usize, SnapshotError> {
    let mut dumped = 0_usize;
    let mut address = region.begin;

    while address < region.end {
        let len = ((region.end - address) as usize).min(buffer.len());
        match memory_reader.read_process_memory(address as usize, &mut buffer[..len]) {
            Ok(read) => {
                writer.write_all(&buffer[..read])?;
                address += read as u64;
                dumped += read;
            }
            Err(_) => {
                // The mapping changed or the page is not readable. Keep the
                // segment the advertised size by filling up to the next page.
                let next = ((address / page_size) + 1) * page_size;
                let fill = (next.min(region.end) - address) as usize;
                let fill = fill.min(buffer.len());
                buffer[..fill].fill(UNREADABLE_FILL);
                writer.write_all(&buffer[..fill])?;
                address += fill as u64;
                dumped += fill;
            }
        }
    }

    Ok(dumped)
}

fn write_va_regions<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    pv: &ProcessView,
    layout: &CoreLayout<'_>,
) -> Result<(), SnapshotError> {
    // Reads in the [8KiB; 64KiB] range perform best
    const BUFFER_SIZE: usize = 0x10000;

    if writer.position() as u64 != layout.data_offset {
        return Err(SnapshotError::InternalError("Mismatched note size"));
    }

    let mut memory_reader = memory_reader(pv.pid)?;
    let mut buffer = vec![0_u8; BUFFER_SIZE];
    let page_size = (pv.page_size as u64).max(1);

    for region in &layout.regions {
        let dumped = write_va_region(
            writer,
            region,
            page_size,
            memory_reader.as_mut(),
            &mut buffer,
        )?;
        tracing::trace!(
            "Saved {dumped} bytes from region [0x{:x}; 0x{:x}]",
            region.begin,
            region.end
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::Elf64_Ehdr;
    use zerocopy::FromBytes;

    fn region(begin: u64, end: u64, write: bool, pathname: Option<&str>) -> VaRegion {
        VaRegion {
            begin,
            end,
            offset: 0,
            protection: VaProtection {
                is_private: true,
                read: true,
                write,
                execute: false,
            },
            pathname: pathname.map(str::to_owned),
        }
    }

    #[test]
    fn policies_per_dump_type() {
        let filters = vec!["stack".to_owned()];
        assert_eq!(
            RegionPolicy::for_dump_type(DumpType::UnixFull, &filters).unwrap(),
            RegionPolicy::Everything
        );
        assert_eq!(
            RegionPolicy::for_dump_type(DumpType::UnixCompressed, &filters).unwrap(),
            RegionPolicy::Everything
        );
        assert_eq!(
            RegionPolicy::for_dump_type(DumpType::AutoDetect, &filters).unwrap(),
            RegionPolicy::Everything
        );
        assert_eq!(
            RegionPolicy::for_dump_type(DumpType::UnixFiltered, &filters).unwrap(),
            RegionPolicy::Matching(filters.clone())
        );
        assert!(matches!(
            RegionPolicy::for_dump_type(DumpType::MiniDumpNormal, &filters),
            Err(SnapshotError::UnsupportedType(DumpType::MiniDumpNormal))
        ));
    }

    #[test]
    fn policies_select_regions() {
        let stack = region(0x1000, 0x2000, true, Some("[stack]"));
        let old_stack = region(0x1000, 0x2000, true, Some("[stack:77]"));
        let heap = region(0x3000, 0x4000, true, Some("[heap]"));
        let text = region(0x5000, 0x6000, false, Some("/usr/lib/libstackdriver.so"));
        let anon = region(0x7000, 0x8000, true, None);

        let writable = RegionPolicy::WritableOnly;
        assert!(writable.admits(&stack) && writable.admits(&anon));
        assert!(!writable.admits(&text));

        assert!(!RegionPolicy::NotesOnly.admits(&heap));
        assert!(RegionPolicy::Everything.admits(&text));

        let matching = RegionPolicy::Matching(vec!["stack".to_owned(), "heap".to_owned()]);
        assert!(matching.admits(&stack));
        assert!(matching.admits(&old_stack));
        assert!(matching.admits(&heap));
        assert!(matching.admits(&text));
        assert!(!matching.admits(&anon));

        let by_file = RegionPolicy::Matching(vec!["libc".to_owned()]);
        assert!(!by_file.admits(&stack));
        assert!(by_file.admits(&region(0, 0x1000, false, Some("/lib/x86_64/libc.so.6"))));
    }

    #[test]
    fn stacks_are_kept_first_under_a_ceiling() {
        let low = region(0x1000, 0x5000, true, None);
        let main_stack = region(0x10000, 0x12000, true, Some("[stack]"));
        let heap = region(0x20000, 0x24000, true, Some("[heap]"));
        let thread_stack = region(0x30000, 0x32000, true, None);
        let all = [low, main_stack, heap, thread_stack];

        // 0x6000 bytes hold both stacks, and no 0x4000 region after them
        let fits = |count: usize, memory_size: u64| count <= 3 && memory_size <= 0x6000;
        let (kept, skipped) = select_regions(all.iter(), &[0x31f00], fits);
        assert_eq!(skipped, 2);
        let kept: Vec<u64> = kept.iter().map(|r| r.begin).collect();
        assert_eq!(kept, [0x10000, 0x30000]);

        // Without a ceiling everything stays, in address order
        let (kept, skipped) = select_regions(all.iter(), &[0x31f00], |_, _| true);
        assert_eq!(skipped, 0);
        let kept: Vec<u64> = kept.iter().map(|r| r.begin).collect();
        assert_eq!(kept, [0x1000, 0x10000, 0x20000, 0x30000]);

        assert!(is_stack(&region(0, 0x1000, true, Some("[stack:77]")), &[]));
        assert!(!is_stack(&all[2], &[0x31f00]));
    }

    #[test]
    fn note_sizes_are_padded() {
        assert_eq!(note_size(b"CORE", 0), 12 + 8);
        assert_eq!(note_size(b"LINUX", 5), 12 + 8 + 8);
        assert_eq!(note_size(b"DUMPCORE", 4), 12 + 12 + 4);
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(9, 8), 16);
    }

    #[test]
    fn process_times_convert_from_ticks() {
        let t = timeval(250, 100);
        assert_eq!({ t.tv_sec }, 2);
        assert_eq!({ t.tv_usec }, 500_000);
    }

    fn observe_self() -> ProcessView {
        let mut pv = ProcessView::observe(nix::unistd::getpid()).unwrap();
        pv.add_note("DUMPCORE", b"type=unix_full\n".to_vec());
        pv
    }

    #[test]
    fn notes_only_core_is_well_formed() {
        let pv = observe_self();
        let mut out = Vec::new();
        let written = write_core_dump(&mut out, &pv, &RegionPolicy::NotesOnly, 0).unwrap();
        assert_eq!(written, out.len());

        let (header, _) = Elf64_Ehdr::read_from_prefix(&out).unwrap();
        assert_eq!(header.e_ident[..4], ELFMAG);
        assert_eq!(header.e_type, ET_CORE);
        assert_eq!(header.e_phnum, 1);

        let note = out.windows(9).any(|w| w == b"DUMPCORE\0");
        assert!(note);
    }

    #[test]
    fn size_ceiling_limits_memory_segments() {
        let pv = observe_self();

        let mut unlimited = Vec::new();
        write_core_dump(&mut unlimited, &pv, &RegionPolicy::WritableOnly, 0).unwrap();

        let ceiling = 256 * 1024;
        let mut limited = Vec::new();
        write_core_dump(&mut limited, &pv, &RegionPolicy::WritableOnly, ceiling).unwrap();

        let mut notes_only = Vec::new();
        write_core_dump(&mut notes_only, &pv, &RegionPolicy::NotesOnly, 0).unwrap();

        assert!(limited.len() <= unlimited.len());
        assert!(limited.len() as u64 <= ceiling.max(notes_only.len() as u64));
    }
}
