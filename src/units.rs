//! Byte-size parsing for configuration values such as `limits.memory`.
//!
//! Accepts plain byte counts plus decimal (`kB`/`MB`/`GB`/`TB` or bare
//! `K`/`M`/`G`/`T`) and binary (`KiB`/`MiB`/`GiB`/`TiB`) suffixes.

use crate::{Error, Result};

const DECIMAL: [(&str, u64); 8] = [
    ("TB", 1000 * 1000 * 1000 * 1000),
    ("GB", 1000 * 1000 * 1000),
    ("MB", 1000 * 1000),
    ("kB", 1000),
    ("T", 1000 * 1000 * 1000 * 1000),
    ("G", 1000 * 1000 * 1000),
    ("M", 1000 * 1000),
    ("K", 1000),
];

const BINARY: [(&str, u64); 4] = [
    ("TiB", 1 << 40),
    ("GiB", 1 << 30),
    ("MiB", 1 << 20),
    ("KiB", 1 << 10),
];

/// Parse a human byte-size string into a byte count.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid(value, "empty value"));
    }

    let (digits, multiplier) = split_suffix(value);
    if digits.is_empty() {
        return Err(invalid(value, "missing number"));
    }

    let count: u64 = digits
        .trim()
        .parse()
        .map_err(|_| invalid(value, "not a positive integer"))?;

    count
        .checked_mul(multiplier)
        .ok_or_else(|| invalid(value, "value overflows"))
}

fn split_suffix(value: &str) -> (&str, u64) {
    for (suffix, mult) in BINARY {
        if let Some(digits) = value.strip_suffix(suffix) {
            return (digits, mult);
        }
    }

    for (suffix, mult) in DECIMAL {
        if let Some(digits) = value.strip_suffix(suffix) {
            return (digits, mult);
        }
    }

    if let Some(digits) = value.strip_suffix('B') {
        return (digits, 1);
    }

    (value, 1)
}

fn invalid(value: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        key: "limits.memory".into(),
        reason: format!("{value:?}: {reason}"),
    }
}
