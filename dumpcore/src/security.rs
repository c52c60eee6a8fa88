// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Filename and path hygiene for dump artifacts.
//!
//! Everything that ends up in a dump path passes through here: directories
//! and filenames are validated against traversal, doubled separators and
//! shell metacharacters, free-form components are sanitized, and the random
//! part of every generated name comes from the OS entropy source.

use crate::collaborators::{EntropySource, OsEntropy};
use crate::configuration::{MAX_DIRECTORY_LEN, MAX_FILENAME_LEN};
use crate::diagnostics;
use crate::dump_type::Platform;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Characters that have a meaning to a shell.
pub const SHELL_METACHARACTERS: &str = ";&|`$(){}[]<>\"'";

/// Longest sanitized filename component.
pub const MAX_COMPONENT_LEN: usize = 64;

/// Bytes of entropy in a random filename component.
pub const RANDOM_BYTES: usize = 32;

const TRAVERSAL_PATTERNS: [&str; 8] = [
    "..",
    "%2e%2e",
    "%2e.",
    ".%2e",
    "%252e%252e",
    "..%2f",
    "..%5c",
    "..\\",
];

const RESERVED_WINDOWS_NAMES: [&str; 22] = [
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Returns `true` if `path` is acceptable as a dump directory on this platform.
pub fn validate_directory(path: &str) -> bool {
    validate_directory_on(Platform::current(), path)
}

/// Returns `true` if `filename` is acceptable as a dump filename on this platform.
pub fn validate_filename(filename: &str) -> bool {
    validate_filename_on(Platform::current(), filename)
}

pub(crate) fn validate_directory_on(platform: Platform, path: &str) -> bool {
    if path.is_empty() || path.chars().count() > MAX_DIRECTORY_LEN {
        return false;
    }

    let normalized = strip_control_characters(path);
    let lower = normalized.to_ascii_lowercase();

    if has_traversal(&lower) || lower.contains("//") || lower.contains("\\\\") {
        return false;
    }
    if has_shell_metacharacters(&normalized) {
        return false;
    }
    if !is_absolute_on(platform, &normalized) {
        return false;
    }
    if platform == Platform::Windows {
        let last = lower
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(lower.as_str());
        if is_reserved_windows_name(last) {
            return false;
        }
    }

    true
}

pub(crate) fn validate_filename_on(platform: Platform, filename: &str) -> bool {
    if filename.is_empty() || filename.chars().count() > MAX_FILENAME_LEN {
        return false;
    }

    let normalized = strip_control_characters(filename);
    let lower = normalized.to_ascii_lowercase();

    if has_traversal(&lower) || lower.contains(['/', '\\']) {
        return false;
    }
    if has_shell_metacharacters(&normalized) {
        return false;
    }
    // An extension is mandatory
    if !normalized.contains('.') {
        return false;
    }
    if platform == Platform::Windows && is_reserved_windows_name(&lower) {
        return false;
    }

    true
}

/// Removes shell metacharacters from `path`.
///
/// This is a cleanup step only, the result must still be validated.
pub fn sanitize_path(path: &str) -> String {
    path.chars()
        .filter(|c| !SHELL_METACHARACTERS.contains(*c))
        .collect()
}

/// Turns arbitrary text into a safe filename component.
///
/// Never fails: the result is 1 to 64 printable ASCII characters without
/// leading, trailing or doubled `_`, or `"unknown"`.
pub fn sanitize_filename_component(component: &str) -> String {
    let mut sanitized = String::with_capacity(component.len().min(MAX_COMPONENT_LEN * 2));

    for c in component.chars() {
        let c = if is_unsafe_filename_char(c) { '_' } else { c };
        if c == '_' && sanitized.ends_with('_') {
            continue;
        }
        sanitized.push(c);
    }

    let mut sanitized: String = sanitized
        .trim_matches('_')
        .chars()
        .take(MAX_COMPONENT_LEN)
        .collect();

    // Truncation may have exposed a trailing separator
    while sanitized.ends_with('_') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        "unknown".to_owned()
    } else {
        sanitized
    }
}

/// A random filename component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RandomComponent {
    /// Uppercase hexadecimal text
    pub value: String,
    /// Set when the OS entropy source failed and the value is predictable
    pub degraded: bool,
}

impl fmt::Display for RandomComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// 32 bytes from the OS entropy source as 64 uppercase hex characters.
///
/// If the entropy source fails, a predictable 16 character value derived
/// from the time, the process id and the thread id is returned instead and
/// the degradation is logged as critical.
pub fn generate_secure_random_component() -> RandomComponent {
    generate_random_component_with(&OsEntropy)
}

pub(crate) fn generate_random_component_with(entropy: &dyn EntropySource) -> RandomComponent {
    let mut bytes = [0_u8; RANDOM_BYTES];
    match entropy.fill_bytes(&mut bytes) {
        Ok(()) => RandomComponent {
            value: hex::encode_upper(bytes),
            degraded: false,
        },
        Err(e) => {
            diagnostics::critical(&format!(
                "secure random source failed ({e}), falling back to an insecure filename component"
            ));
            RandomComponent {
                value: fallback_random_component(),
                degraded: true,
            }
        }
    }
}

fn fallback_random_component() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = DefaultHasher::new();
    nanos.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    format!("{:016X}", hasher.finish())
}

/// Builds `<directory>/<prefix>_<timestamp>_<random>.<extension>`.
///
/// `prefix` and `timestamp` are sanitized. If the resulting name still fails
/// [`validate_filename`], `<directory>/dump_<random>.<extension>` is used.
pub fn build_dump_filename(
    directory: &Path,
    prefix: &str,
    timestamp: &str,
    random: &RandomComponent,
    extension: &str,
) -> PathBuf {
    let name = format!(
        "{}_{}_{}.{}",
        sanitize_filename_component(prefix),
        sanitize_filename_component(timestamp),
        random.value,
        extension
    );

    if validate_filename(&name) {
        directory.join(name)
    } else {
        diagnostics::warn("generated dump filename failed validation, using the fallback name");
        directory.join(format!("dump_{}.{}", random.value, extension))
    }
}

pub(crate) fn strip_control_characters(s: &str) -> String {
    s.chars()
        .filter(|&c| !(c.is_ascii_control() && c != '\t' && c != '\n' && c != '\r' && c != '\x7f'))
        .collect()
}

fn has_traversal(lower: &str) -> bool {
    TRAVERSAL_PATTERNS.iter().any(|p| lower.contains(p))
}

fn has_shell_metacharacters(s: &str) -> bool {
    s.contains(|c: char| SHELL_METACHARACTERS.contains(c))
}

fn is_absolute_on(platform: Platform, path: &str) -> bool {
    match platform {
        Platform::Windows => {
            let bytes = path.as_bytes();
            (bytes.len() >= 3
                && bytes[0].is_ascii_alphabetic()
                && bytes[1] == b':'
                && (bytes[2] == b'\\' || bytes[2] == b'/'))
                || path.starts_with("\\\\")
        }
        Platform::Unix | Platform::Any => path.starts_with('/'),
    }
}

/// `lower` is a single lowercase path component.
fn is_reserved_windows_name(lower: &str) -> bool {
    let base = lower.split('.').next().unwrap_or(lower);
    RESERVED_WINDOWS_NAMES.contains(&base)
}

fn is_unsafe_filename_char(c: char) -> bool {
    !(' '..='~').contains(&c)
        || c == ' '
        || "/\\:*?\"<>|".contains(c)
        || SHELL_METACHARACTERS.contains(c)
}
