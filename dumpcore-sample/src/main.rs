// Copyright (C) Microsoft Corporation.
// Licensed under the MIT License.

//! Sample process for capturing dumps.
//!
//! `dumpcore-sample [-v] [--dir <path>] [--type <name>] <action> [reason]`
//!
//! Actions:
//!
//! * `list` prints the dump types usable on this platform.
//! * `dump [reason]` writes a dump of this process and prints where it went.
//! * `panic`, `segv` and `abort` crash the process so that the installed
//!   handlers run.
//!
//! An optional `-v` parameter may be specified before any options to enable
//! debug level tracing.

use anyhow::Context;
use dumpcore::{DumpFactory, DumpType};
use tracing::Level;

enum Action {
    List,
    Dump(String),
    Panic,
    Segv,
    Abort,
}

pub fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1).peekable();

    let level = if args.peek().map_or(false, |x| x == "-v") {
        args.next();
        Level::DEBUG
    } else {
        Level::INFO
    };

    let mut directory = String::new();
    let mut dump_type = DumpType::AutoDetect;
    let action = loop {
        let arg = args.next().context("missing action")?;
        match arg.as_str() {
            "--dir" => directory = args.next().context("missing --dir value")?,
            "--type" => {
                dump_type = args
                    .next()
                    .context("missing --type value")?
                    .parse()
                    .context("failed to parse dump type")?;
            }
            "list" => break Action::List,
            "dump" => {
                break Action::Dump(args.next().unwrap_or_else(|| "requested by user".to_owned()))
            }
            "panic" => break Action::Panic,
            "segv" => break Action::Segv,
            "abort" => break Action::Abort,
            other => anyhow::bail!("unknown argument {other}"),
        }
    };

    if args.next().is_some() {
        anyhow::bail!("unexpected extra arguments");
    }

    dumpcore::diagnostics::init_console_logging(level)
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to install logging")?;

    if !matches!(action, Action::List) {
        dumpcore::initialize(&directory, dump_type, true).context("failed to initialize")?;
        tracing::debug!(
            "dumps go to {:?} as {}",
            dumpcore::dump_directory(),
            dumpcore::current_dump_type()
        );
    }

    match action {
        Action::List => print_types(),
        Action::Dump(reason) => {
            let artifact = dumpcore::try_generate_dump(&reason, DumpType::AutoDetect)
                .map_err(|code| anyhow::anyhow!("dump failed: {code}"))?;
            println!(
                "{} ({} bytes)",
                artifact.path.display(),
                artifact.size_bytes
            );
        }
        Action::Panic => crash::outer(crash::panic),
        Action::Segv => crash::outer(crash::segv),
        Action::Abort => crash::outer(crash::abort),
    }

    Ok(())
}

fn print_types() {
    for t in DumpFactory::supported_types() {
        let size = match DumpFactory::estimated_size(t) {
            0 => "variable".to_owned(),
            bytes => format!("{} KiB", bytes / 1024),
        };
        println!("{t:<45} {size:>10}  {}", DumpFactory::description(t));
    }
}

/// A short call chain so the dumps have frames to show.
mod crash {
    #[inline(never)]
    pub fn outer(f: fn()) {
        middle(f);
    }

    #[inline(never)]
    fn middle(f: fn()) {
        f();
    }

    pub fn panic() {
        panic!("deliberate panic from dumpcore-sample");
    }

    pub fn segv() {
        let null = std::ptr::null_mut::<u32>();
        // SAFETY: not safe at all, the write faults on purpose.
        unsafe { null.write_volatile(0xdead) };
    }

    pub fn abort() {
        std::process::abort();
    }
}
