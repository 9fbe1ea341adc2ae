// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Parsing and formatting of human-readable quantities like "800MHz" or
//! "50us". Property values are kept in their native unit (Hz for
//! frequencies, microseconds for latencies), these helpers convert at the
//! user-input and printing boundaries.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

lazy_static! {
    static ref QUANTITY_RE: Regex = Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*([A-Za-z]*)$").unwrap();
}

/// SI prefix multipliers relative to the base unit.
fn prefix_scale(prefix: &str) -> Option<f64> {
    match prefix {
        "" => Some(1.0),
        "k" | "K" => Some(1e3),
        "M" => Some(1e6),
        "G" => Some(1e9),
        "T" => Some(1e12),
        "m" => Some(1e-3),
        "u" => Some(1e-6),
        "n" => Some(1e-9),
        _ => None,
    }
}

/// Parse a quantity with an optional unit suffix, e.g. "800MHz" with
/// `unit="Hz"`, and return the value in the base unit. A bare number is
/// assumed to already be in the base unit. `name` is used in error messages.
pub fn parse_quantity(val: &str, unit: &str, name: &str) -> Result<f64> {
    let val = val.trim();
    let caps = QUANTITY_RE.captures(val).ok_or_else(|| {
        Error::BadFormat(format!(
            "bad value '{val}' for {name}, expected a number, optionally followed \
             by a unit like '{unit}'"
        ))
    })?;

    let num: f64 = caps[1]
        .parse()
        .map_err(|_| Error::BadFormat(format!("bad number '{}' for {name}", &caps[1])))?;
    let suffix = &caps[2];

    if suffix.is_empty() {
        return Ok(num);
    }

    // "MHz" against base "Hz" leaves the "M" prefix, "us" against base "s"
    // leaves "u". The suffix may also be the bare base unit.
    let prefix = suffix
        .strip_suffix(unit)
        .or_else(|| suffix.strip_suffix(&unit.to_lowercase()));
    let scale = prefix.and_then(prefix_scale).ok_or_else(|| {
        Error::BadFormat(format!(
            "bad unit in '{val}' for {name}, expected something like '100{unit}'"
        ))
    })?;

    Ok(num * scale)
}

/// Same as [`parse_quantity`], but for integer-typed properties. Fails if the
/// scaled value is not a whole number.
pub fn parse_int_quantity(val: &str, unit: &str, name: &str) -> Result<i64> {
    let num = parse_quantity(val, unit, name)?;
    if num.fract() != 0.0 || num < i64::MIN as f64 || num > i64::MAX as f64 {
        return Err(Error::BadFormat(format!(
            "bad value '{val}' for {name}: must be a whole number of {unit}"
        )));
    }
    Ok(num as i64)
}

/// Format a frequency in Hz the way humans read them: "2.4GHz", "800MHz".
pub fn format_freq(hz: i64) -> String {
    let hz = hz as f64;
    for (scale, suffix) in [(1e9, "GHz"), (1e6, "MHz"), (1e3, "kHz")] {
        if hz >= scale {
            let scaled = hz / scale;
            if scaled.fract() == 0.0 {
                return format!("{scaled}{suffix}");
            }
            return format!("{scaled:.2}{suffix}");
        }
    }
    format!("{hz}Hz")
}

/// Lower-case the first character of a property label so it reads naturally
/// mid-sentence in error messages.
pub fn uncapitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("800MHz", "Hz", "t").unwrap(), 800e6);
        assert_eq!(parse_quantity("2.5GHz", "Hz", "t").unwrap(), 2.5e9);
        assert_eq!(parse_quantity("1600", "Hz", "t").unwrap(), 1600.0);
        assert_eq!(parse_quantity("100Hz", "Hz", "t").unwrap(), 100.0);
        assert_eq!(parse_quantity("50us", "s", "t").unwrap(), 50e-6);
        assert!(parse_quantity("fast", "Hz", "t").is_err());
        assert!(parse_quantity("100MiB", "Hz", "t").is_err());
    }

    #[test]
    fn int_quantities() {
        assert_eq!(parse_int_quantity("1.4GHz", "Hz", "t").unwrap(), 1_400_000_000);
        assert_eq!(parse_int_quantity("100us", "us", "t").unwrap(), 100);
        assert!(parse_int_quantity("0.5us", "us", "t").is_err());
    }

    #[test]
    fn freq_formatting() {
        assert_eq!(format_freq(800_000_000), "800MHz");
        assert_eq!(format_freq(2_400_000_000), "2.40GHz");
        assert_eq!(format_freq(1_000), "1kHz");
        assert_eq!(format_freq(999), "999Hz");
    }

    #[test]
    fn uncap() {
        assert_eq!(uncapitalize("Max. CPU frequency"), "max. CPU frequency");
        assert_eq!(uncapitalize(""), "");
    }
}
