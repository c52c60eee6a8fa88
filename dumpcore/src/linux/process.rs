// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Gathering the state of a process from procfs, with or without stopping
//! it under ptrace.

use super::memory::{memory_reader, ReadProcessMemory};
use super::ptrace;
use crate::arch::ArchState;
use crate::coredump::{MappedFile, MappedFileRegion, VaProtection, VaRegion};
use crate::elf::{Elf64_Auxv, Elf64_Ehdr};
use crate::SnapshotError;
use nix::sys::ptrace::{detach, seize, Options};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{sysconf, Pid, SysconfVar};
use std::collections::HashMap;
use std::fs;
use std::io;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

/// Fields of `/proc/<pid>/task/<tid>/stat`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatFields {
    pub comm: String,
    pub state: u8,
    pub ppid: i32,
    pub pgrp: i32,
    pub session: i32,
    pub flags: u32,
    /// Clock ticks
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    pub nice: i64,
}

/// Fields of `/proc/<pid>/task/<tid>/status`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatusFields {
    pub uid: u32,
    pub gid: u32,
    pub sighold: u64,
    pub sigpend: u64,
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, PartialEq, Eq)]
pub struct MapsEntry<'a> {
    pub begin: u64,
    pub end: u64,
    pub perms: &'a str,
    pub offset: u64,
    pub pathname: Option<&'a str>,
}

/// Parses a stat line. The command name is parenthesized and may itself
/// contain spaces and parentheses, so everything up to the last `)` is it.
pub fn parse_stat(stat: &str) -> Result<StatFields, SnapshotError> {
    let stat = stat.trim();
    let (Some(open), Some(close)) = (stat.find('('), stat.rfind(')')) else {
        tracing::debug!("No command name in the stat line: {stat}");
        return Err(SnapshotError::ProcParsingError);
    };
    if close < open {
        return Err(SnapshotError::ProcParsingError);
    }

    let comm = stat[open + 1..close].to_owned();
    let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    // state is fields[0]; cstime, the last one read, is fields[14]
    if fields.len() < 17 {
        tracing::debug!("Found {} entries after the command name", fields.len());
        return Err(SnapshotError::ProcParsingError);
    }

    Ok(StatFields {
        comm,
        state: *fields[0].as_bytes().first().ok_or(SnapshotError::ProcParsingError)?,
        ppid: fields[1].parse()?,
        pgrp: fields[2].parse()?,
        session: fields[3].parse()?,
        flags: fields[6].parse()?,
        utime: fields[11].parse()?,
        stime: fields[12].parse()?,
        cutime: fields[13].parse()?,
        cstime: fields[14].parse()?,
        nice: fields[16].parse()?,
    })
}

/// Parses a status file. Unknown or malformed lines are ignored.
pub fn parse_status(status: &str) -> StatusFields {
    let first_decimal = |s: &str| {
        s.split_whitespace()
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0)
    };
    let hex = |s: &str| u64::from_str_radix(s.trim(), 16).unwrap_or(0);

    let mut fields = StatusFields::default();
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "Uid" => fields.uid = first_decimal(value),
            "Gid" => fields.gid = first_decimal(value),
            "SigBlk" => fields.sighold = hex(value),
            "SigPnd" => fields.sigpend = hex(value),
            _ => {}
        }
    }
    fields
}

/// Parses a maps line: `begin-end perms offset dev inode [pathname]`.
pub fn parse_maps_line(line: &str) -> Result<MapsEntry<'_>, SnapshotError> {
    let mut rest = line.trim_start();
    let mut next_field = || {
        let field_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (field, tail) = rest.split_at(field_end);
        rest = tail.trim_start();
        field
    };

    let range = next_field();
    let perms = next_field();
    let offset = next_field();
    let _dev = next_field();
    let inode = next_field();
    if inode.is_empty() || perms.len() < 4 {
        return Err(SnapshotError::ProcParsingError);
    }
    let pathname = rest.trim_end();

    let (begin, end) = range
        .split_once('-')
        .ok_or(SnapshotError::ProcParsingError)?;

    Ok(MapsEntry {
        begin: u64::from_str_radix(begin, 16)?,
        end: u64::from_str_radix(end, 16)?,
        perms,
        offset: u64::from_str_radix(offset, 16)?,
        pathname: (!pathname.is_empty()).then_some(pathname),
    })
}

/// A Linux light-weight process.
#[derive(Debug)]
pub struct ThreadView {
    pub tid: Pid,
    /// Arguments separated by spaces
    pub cmd_line: String,
    pub stat: StatFields,
    pub status: StatusFields,
    pub arch_state: ArchState,
}

impl ThreadView {
    fn new(pid: Pid, tid: Pid, arch_state: ArchState) -> Result<Self, SnapshotError> {
        let task = format!("/proc/{pid}/task/{tid}");
        tracing::trace!("Reading {task}");

        let cmd_line = fs::read(format!("{task}/cmdline"))?;
        let cmd_line = String::from_utf8_lossy(&cmd_line)
            .replace('\0', " ")
            .trim_end()
            .to_owned();

        Ok(Self {
            tid,
            cmd_line,
            stat: parse_stat(&fs::read_to_string(format!("{task}/stat"))?)?,
            status: parse_status(&fs::read_to_string(format!("{task}/status"))?),
            arch_state,
        })
    }
}

/// Everything an ELF core file describes about a process.
pub struct ProcessView {
    pub(crate) pid: Pid,
    pub(crate) threads: Vec<ThreadView>,
    pub(crate) va_regions: Vec<VaRegion>,
    pub(crate) mapped_files: Vec<MappedFile>,
    // The kernel exposes some system configuration through it.
    pub(crate) aux_vector: Vec<Elf64_Auxv>,
    pub(crate) page_size: usize,
    pub(crate) clock_ticks: u64,
    pub(crate) custom_notes: Vec<(String, Vec<u8>)>,
    /// Threads stopped under ptrace, detached on drop
    attached: Vec<Pid>,
}

fn get_thread_ids(pid: Pid) -> Result<Vec<Pid>, SnapshotError> {
    let mut tids = Vec::new();
    for entry in fs::read_dir(format!("/proc/{pid}/task"))? {
        let name = entry?.file_name();
        if let Some(tid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort();
    Ok(tids)
}

fn get_aux_vector(pid: Pid) -> Result<Vec<Elf64_Auxv>, SnapshotError> {
    let raw = fs::read(format!("/proc/{pid}/auxv"))?;
    Ok(raw
        .chunks_exact(std::mem::size_of::<Elf64_Auxv>())
        .filter_map(|entry| Elf64_Auxv::read_from_bytes(entry).ok())
        .collect())
}

fn is_elf_image(reader: &mut dyn ReadProcessMemory, base: u64) -> Option<bool> {
    let mut header = Elf64_Ehdr::new_zeroed();
    reader
        .read_process_memory(base as usize, header.as_mut_bytes())
        .ok()
        .map(|_| header.is_loadable_image())
}

fn get_va_regions(
    pid: Pid,
    reader: &mut dyn ReadProcessMemory,
) -> Result<(Vec<VaRegion>, Vec<MappedFile>), SnapshotError> {
    let maps = fs::read_to_string(format!("/proc/{pid}/maps"))?;

    let mut regions = Vec::new();
    let mut mapped_files: Vec<MappedFile> = Vec::new();
    // Decided on the first mapping of each file, which holds its header
    let mut elf_files: HashMap<String, bool> = HashMap::new();

    for line in maps.lines() {
        let entry = parse_maps_line(line)?;
        let perms = entry.perms.as_bytes();

        if let Some(label) = entry.pathname {
            if label.starts_with("[vdso]")
                || label.starts_with("[vvar")
                || label.starts_with("[vsyscall]")
            {
                tracing::trace!("Skipping VA range mapped to {label}");
                continue;
            }
            if label.starts_with("/dev/") {
                // Reading device memory might have side effects
                tracing::trace!("Skipping VA range mapped to a device");
                continue;
            }
        }

        let protection = VaProtection {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            is_private: perms[3] == b'p',
        };
        if !protection.read {
            tracing::trace!(
                "Skipping non-readable VA range [0x{:x}; 0x{:x}]",
                entry.begin,
                entry.end
            );
            continue;
        }

        let file = entry.pathname.filter(|p| p.starts_with('/'));
        if let Some(file) = file {
            // Non-ELF files might be huge and contain secrets
            let is_elf = *elf_files
                .entry(file.to_owned())
                .or_insert_with(|| is_elf_image(reader, entry.begin).unwrap_or(true));
            if !is_elf {
                tracing::trace!("Skipping VA range mapped to a non-ELF file");
                continue;
            }

            match mapped_files.last_mut() {
                Some(last) if last.name == file => match last.regions.last_mut() {
                    Some(tail) if tail.end == entry.begin => tail.end = entry.end,
                    _ => last.regions.push(MappedFileRegion {
                        begin: entry.begin,
                        end: entry.end,
                        offset: entry.offset,
                    }),
                },
                _ => mapped_files.push(MappedFile {
                    name: file.to_owned(),
                    regions: vec![MappedFileRegion {
                        begin: entry.begin,
                        end: entry.end,
                        offset: entry.offset,
                    }],
                }),
            }
        }

        regions.push(VaRegion {
            begin: entry.begin,
            end: entry.end,
            offset: entry.offset,
            protection,
            pathname: entry.pathname.map(str::to_owned),
        });
    }

    regions.sort_by_key(|r| r.begin);
    Ok((regions, mapped_files))
}

fn sysconf_or(var: SysconfVar, fallback: u64) -> u64 {
    match sysconf(var) {
        Ok(Some(value)) if value > 0 => value as u64,
        _ => fallback,
    }
}

impl ProcessView {
    /// Stops every thread of `pid` under ptrace and reads its registers.
    ///
    /// The threads are resumed when the view is dropped.
    pub fn seize(pid: Pid) -> Result<Self, SnapshotError> {
        let tids = get_thread_ids(pid)?;
        tracing::debug!("Attaching to {} threads of process {pid}", tids.len());

        let mut view = Self::empty(pid);
        for tid in &tids {
            seize(*tid, Options::empty())?;
            view.attached.push(*tid);
            ptrace::interrupt(*tid)?;
            let status = waitpid(*tid, Some(WaitPidFlag::__WALL))?;
            tracing::trace!("Thread {tid} stopped, status {status:?}");
        }

        // Threads may have been created or have exited while we were
        // stopping them. Thread ids can be reused, so this is best effort.
        if get_thread_ids(pid)? != tids {
            return Err(SnapshotError::RaceTryAgain);
        }

        view.threads = tids
            .iter()
            .map(|tid| ThreadView::new(pid, *tid, ArchState::capture(*tid)?))
            .collect::<Result<_, _>>()?;
        view.describe_memory()?;
        Ok(view)
    }

    /// Reads `pid` without stopping it. Register state is left zeroed, and
    /// threads that exit while being read are left out.
    pub fn observe(pid: Pid) -> Result<Self, SnapshotError> {
        let mut view = Self::empty(pid);
        for tid in get_thread_ids(pid)? {
            match ThreadView::new(pid, tid, ArchState::unavailable()) {
                Ok(thread) => view.threads.push(thread),
                Err(SnapshotError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::trace!("Thread {tid} exited while being read");
                }
                Err(e) => return Err(e),
            }
        }
        view.describe_memory()?;
        Ok(view)
    }

    fn empty(pid: Pid) -> Self {
        Self {
            pid,
            threads: Vec::new(),
            va_regions: Vec::new(),
            mapped_files: Vec::new(),
            aux_vector: Vec::new(),
            page_size: 0x1000,
            clock_ticks: 100,
            custom_notes: Vec::new(),
            attached: Vec::new(),
        }
    }

    fn describe_memory(&mut self) -> Result<(), SnapshotError> {
        let mut reader = memory_reader(self.pid)?;
        let (va_regions, mapped_files) = get_va_regions(self.pid, reader.as_mut())?;
        self.va_regions = va_regions;
        self.mapped_files = mapped_files;
        self.aux_vector = get_aux_vector(self.pid)?;
        self.page_size = sysconf_or(SysconfVar::PAGE_SIZE, 0x1000) as usize;
        self.clock_ticks = sysconf_or(SysconfVar::CLK_TCK, 100);

        tracing::debug!(
            "Process {}: {} threads, {} VA regions, {} mapped files, {} auxv entries",
            self.pid,
            self.threads.len(),
            self.va_regions.len(),
            self.mapped_files.len(),
            self.aux_vector.len()
        );
        Ok(())
    }

    /// Adds an application-defined note.
    pub fn add_note(&mut self, name: &str, data: Vec<u8>) {
        self.custom_notes.push((name.to_owned(), data));
    }
}

impl Drop for ProcessView {
    fn drop(&mut self) {
        for tid in self.attached.drain(..) {
            match detach(tid, None) {
                Ok(()) => tracing::trace!("Thread {tid} resumed"),
                Err(e) => tracing::debug!("Thread {tid} failed to resume: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_with_awkward_command_name() {
        let line = "4242 (my (odd) prog) S 1 4242 4242 0 -1 4194560 120 0 0 0 \
                    250 30 7 3 20 -5 3 0 1000 0 0 18446744073709551615";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.comm, "my (odd) prog");
        assert_eq!(stat.state, b'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.session, 4242);
        assert_eq!(stat.flags, 4194560);
        assert_eq!((stat.utime, stat.stime, stat.cutime, stat.cstime), (250, 30, 7, 3));
        assert_eq!(stat.nice, -5);

        assert!(parse_stat("4242 no parens S 1").is_err());
        assert!(parse_stat("4242 (short) S 1 2").is_err());
    }

    #[test]
    fn status_signal_masks_are_hex() {
        let status = "Name:\tdemo\nUid:\t1000\t1000\t1000\t1000\nGid:\t100\t100\t100\t100\n\
                      SigPnd:\t0000000000000100\nSigBlk:\t0000000000010000\n";
        let fields = parse_status(status);
        assert_eq!(
            fields,
            StatusFields {
                uid: 1000,
                gid: 100,
                sighold: 0x10000,
                sigpend: 0x100,
            }
        );
    }

    #[test]
    fn maps_lines() {
        let entry =
            parse_maps_line("7f00a000-7f00c000 r-xp 00001000 08:01 1234    /usr/lib/my lib.so")
                .unwrap();
        assert_eq!(entry.begin, 0x7f00a000);
        assert_eq!(entry.end, 0x7f00c000);
        assert_eq!(entry.perms, "r-xp");
        assert_eq!(entry.offset, 0x1000);
        assert_eq!(entry.pathname, Some("/usr/lib/my lib.so"));

        let anon = parse_maps_line("7ffd0000-7ffd1000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(anon.pathname, None);

        let stack = parse_maps_line("7ffd0000-7ffd1000 rw-p 00000000 00:00 0  [stack]").unwrap();
        assert_eq!(stack.pathname, Some("[stack]"));

        assert!(parse_maps_line("garbage").is_err());
    }

    #[test]
    fn observes_itself() {
        let pid = nix::unistd::getpid();
        let view = ProcessView::observe(pid).unwrap();

        assert!(view.threads.iter().any(|t| t.tid == pid));
        assert!(view.page_size.is_power_of_two());
        assert!(!view.aux_vector.is_empty());
        assert!(view
            .va_regions
            .iter()
            .any(|r| r.pathname.as_deref() == Some("[stack]")));
        assert!(view.va_regions.windows(2).all(|w| w[0].begin <= w[1].begin));
        assert!(view
            .va_regions
            .iter()
            .all(|r| r.pathname.as_deref() != Some("[vdso]")));
    }
}
