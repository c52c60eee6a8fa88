// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Privilege-aware log redaction and the console log format.
//!
//! Messages logged through [`info`], [`warn`], [`error`] and [`critical`]
//! are redacted before they reach `tracing`: absolute paths, addresses,
//! process ids and numeric error codes are replaced with placeholders unless
//! the process holds elevated privileges. The privilege check runs on every
//! call.

use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Placeholder for a redacted path.
pub const PATH_PLACEHOLDER: &str = "[PATH]";
/// Placeholder for a redacted address.
pub const ADDR_PLACEHOLDER: &str = "[ADDR]";
/// Placeholder for a redacted number.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// What a sanitized message may still contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RedactionPolicy {
    redact_paths: bool,
    redact_error_codes: bool,
    /// `0x` runs with more hex digits than this are redacted
    max_address_digits: usize,
    max_len: usize,
}

const UNPRIVILEGED: RedactionPolicy = RedactionPolicy {
    redact_paths: true,
    redact_error_codes: true,
    max_address_digits: 6,
    max_len: 512,
};

const PRIVILEGED: RedactionPolicy = RedactionPolicy {
    redact_paths: false,
    redact_error_codes: false,
    max_address_digits: 10,
    max_len: 1024,
};

/// Redacts `message` for an unprivileged reader.
pub fn sanitize_log_message(message: &str) -> String {
    sanitize_with(message, UNPRIVILEGED)
}

/// Redacts `message` for a privileged reader: paths and error codes are
/// kept, only long addresses and process ids are hidden.
pub fn sanitize_log_message_privileged(message: &str) -> String {
    sanitize_with(message, PRIVILEGED)
}

/// Redacts `message` according to the privileges of the current process.
pub fn sanitize_for_current_process(message: &str) -> String {
    if is_admin_privileges() {
        sanitize_log_message_privileged(message)
    } else {
        sanitize_log_message(message)
    }
}

fn sanitize_with(message: &str, policy: RedactionPolicy) -> String {
    if message.is_empty() {
        return "[empty]".to_owned();
    }

    // Only printable ASCII survives, which keeps the scans below byte-safe.
    let mut sanitized: String = message.chars().filter(|c| (' '..='~').contains(c)).collect();

    if policy.redact_paths {
        sanitized = redact_paths(&sanitized);
    }
    sanitized = redact_addresses(&sanitized, policy.max_address_digits);
    sanitized = redact_tagged_number(&sanitized, "PID:", 1, false);
    if policy.redact_error_codes {
        sanitized = redact_tagged_number(&sanitized, "Error:", 3, true);
    }

    if sanitized.len() > policy.max_len {
        sanitized.truncate(policy.max_len - 3);
        sanitized.push_str("...");
    }

    sanitized
}

fn redact_paths(s: &str) -> String {
    s.split(' ')
        .map(|token| {
            if token.len() > 10 && token.contains(['/', '\\']) {
                PATH_PLACEHOLDER
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn redact_addresses(s: &str, max_digits: usize) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'0' && matches!(bytes.get(i + 1), Some(&b'x') | Some(&b'X')) {
            let digits = bytes[i + 2..]
                .iter()
                .take_while(|b| b.is_ascii_hexdigit())
                .count();
            let end = i + 2 + digits;
            if digits > max_digits {
                out.push_str(ADDR_PLACEHOLDER);
            } else {
                out.push_str(&s[i..end]);
            }
            i = end;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }

    out
}

/// Replaces the digits after `tag`. With `whole_token` the digits must run
/// up to whitespace or the end of the message.
fn redact_tagged_number(s: &str, tag: &str, min_digits: usize, whole_token: bool) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find(tag) {
        let after = &rest[pos + tag.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let token_ends = after[digits..]
            .chars()
            .next()
            .map_or(true, |c| c.is_ascii_whitespace());

        out.push_str(&rest[..pos]);
        out.push_str(tag);
        if digits >= min_digits && (!whole_token || token_ends) {
            out.push_str(REDACTED_PLACEHOLDER);
        } else {
            out.push_str(&after[..digits]);
        }
        rest = &after[digits..];
    }

    out.push_str(rest);
    out
}

/// Returns `true` if the process runs with elevated privileges.
///
/// Only chooses the redaction level of log messages.
pub fn is_admin_privileges() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(windows)]
    {
        crate::win32::is_elevated()
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Logs a redacted informational message.
pub fn info(message: &str) {
    tracing::info!("{}", sanitize_for_current_process(message));
}

/// Logs a redacted warning.
pub fn warn(message: &str) {
    tracing::warn!("{}", sanitize_for_current_process(message));
}

/// Logs a redacted error.
pub fn error(message: &str) {
    tracing::error!("{}", sanitize_for_current_process(message));
}

/// Logs a redacted error that weakens a security guarantee.
pub fn critical(message: &str) {
    tracing::error!("CRITICAL: {}", sanitize_for_current_process(message));
}

/// Formats events as `[HH:MM:SS] LEVEL: <message>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleFormat;

impl<S, N> FormatEvent<S, N> for ConsoleFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };
        write!(writer, "[{}] {}: ", chrono::Local::now().format("%H:%M:%S"), level)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs a global subscriber printing [`ConsoleFormat`] lines: warnings
/// and errors to stderr, everything else to stdout.
pub fn init_console_logging(
    max_level: Level,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_writer(std::io::stderr.with_max_level(Level::WARN).or_else(std::io::stdout))
        .event_format(ConsoleFormat)
        .try_init()
}


#[cfg(test)]
mod tests {
    use super::capture::logs_of as capture;
    use super::*;

    #[test]
    fn empty_message() {
        assert_eq!(sanitize_log_message(""), "[empty]");
        assert_eq!(sanitize_log_message_privileged(""), "[empty]");
    }

    #[test]
    fn long_paths_are_redacted() {
        assert_eq!(
            sanitize_log_message("Dump written to /var/crash/dumps/app.core now"),
            "Dump written to [PATH] now"
        );
        assert_eq!(
            sanitize_log_message("Dump written to C:\\Users\\me\\dumps\\app.dmp"),
            "Dump written to [PATH]"
        );
        assert_eq!(sanitize_log_message("short /tmp/a"), "short /tmp/a");
        assert_eq!(
            sanitize_log_message_privileged("Dump written to /var/crash/dumps/app.core"),
            "Dump written to /var/crash/dumps/app.core"
        );
    }

    #[test]
    fn addresses_are_redacted() {
        assert_eq!(sanitize_log_message("at 0x7ffd1234abcd"), "at [ADDR]");
        assert_eq!(sanitize_log_message("flag 0x1f"), "flag 0x1f");
        assert_eq!(sanitize_log_message("six 0xabcdef"), "six 0xabcdef");
        assert_eq!(sanitize_log_message("seven 0xabcdef1"), "seven [ADDR]");
        assert_eq!(
            sanitize_log_message_privileged("seven 0xabcdef1"),
            "seven 0xabcdef1"
        );
        assert_eq!(
            sanitize_log_message_privileged("at 0x7ffd1234abcd"),
            "at [ADDR]"
        );
    }

    #[test]
    fn pids_are_redacted_for_everyone() {
        assert_eq!(sanitize_log_message("PID:4242 crashed"), "PID:[REDACTED] crashed");
        assert_eq!(
            sanitize_log_message_privileged("child PID:17"),
            "child PID:[REDACTED]"
        );
        assert_eq!(sanitize_log_message("PID: none"), "PID: none");
    }

    #[test]
    fn long_error_codes_are_redacted() {
        assert_eq!(sanitize_log_message("Error:13"), "Error:13");
        assert_eq!(sanitize_log_message("Error:1455 failed"), "Error:[REDACTED] failed");
        assert_eq!(sanitize_log_message("Error:12ab"), "Error:12ab");
        assert_eq!(sanitize_log_message_privileged("Error:1455"), "Error:1455");
    }

    #[test]
    fn non_printable_characters_are_removed() {
        assert_eq!(sanitize_log_message("a\u{7}b\tc\u{e9}d"), "abcd");
    }

    #[test]
    fn messages_are_truncated() {
        let long = "x".repeat(2000);
        let out = sanitize_log_message(&long);
        assert_eq!(out.len(), 512);
        assert!(out.ends_with("..."));

        let out = sanitize_log_message_privileged(&long);
        assert_eq!(out.len(), 1024);
        assert!(out.ends_with("..."));

        assert_eq!(sanitize_log_message(&"y".repeat(512)).len(), 512);
        assert!(!sanitize_log_message(&"y".repeat(512)).ends_with("..."));
    }

    #[test]
    fn console_format() {
        let out = capture(|| info("capture engine ready"));
        assert!(out.starts_with('['), "{out}");
        assert_eq!(&out[9..], "] INFO: capture engine ready\n");
        assert_eq!(out.as_bytes()[3], b':');
    }

    #[test]
    fn critical_is_an_error_with_a_prefix() {
        let out = capture(|| critical("entropy failed"));
        assert!(out.ends_with("] ERROR: CRITICAL: entropy failed\n"), "{out}");
    }

    #[test]
    fn shim_redacts_before_emitting() {
        let out = capture(|| warn("PID:99 went away"));
        assert!(out.ends_with("] WARN: PID:[REDACTED] went away\n"), "{out}");
    }
}
