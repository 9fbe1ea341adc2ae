// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Error taxonomy shared by all `pwr_utils` modules.
//!
//! The split matters for control flow, not just messages: `NotSupported` and
//! `TryAnotherMechanism` are caught at the mechanism-fallback boundary,
//! `UsePerCpu` is caught exactly once per call site to retry at CPU
//! granularity, and `Bug` must never be swallowed by fallback logic.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The property or mechanism is genuinely unavailable on this platform.
    /// Recoverable: may trigger mechanism fallback or be reported to the user
    /// as "not supported". Carries the per-mechanism failures collected while
    /// falling back.
    #[error("{}", format_not_supported(.what, .errors))]
    NotSupported { what: String, errors: Vec<String> },

    /// The current mechanism categorically cannot serve this property.
    /// Triggers fallback only, never surfaced raw.
    #[error("mechanism '{mname}' cannot be used: {reason}")]
    TryAnotherMechanism { mname: String, reason: String },

    /// A property with scope coarser than its I/O scope was read at the
    /// coarse granularity and the sibling units disagree.
    #[error("CPU {cpu1} and CPU {cpu2} are in the same {sname}, but '{pname}' differs: \
             '{val1}' vs '{val2}', use per-CPU access instead")]
    UsePerCpu {
        pname: String,
        sname: String,
        cpu1: usize,
        val1: String,
        cpu2: usize,
        val2: String,
    },

    /// A write was accepted but the readback does not match.
    #[error("verification failed for {what}: wrote '{expected}', but read back '{actual}'")]
    VerifyFailed {
        what: String,
        expected: String,
        actual: String,
    },

    /// Value parsing failure.
    #[error("{0}")]
    BadFormat(String),

    /// The resource (file, register, device node) is absent.
    #[error("{0} was not found")]
    NotFound(String),

    /// No CPUs, dies or packages were specified at all.
    #[error("no CPUs, cores, modules, dies or packages were specified")]
    NoTarget,

    /// A target was specified, but it resolves to zero CPUs.
    #[error("{0}")]
    NoCpuTarget(String),

    /// Invariant violation. Always fatal, indicates an implementation defect.
    #[error("BUG: {0}")]
    Bug(String),

    /// Any other user-facing error.
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<glob::PatternError> for Error {
    fn from(err: glob::PatternError) -> Error {
        Error::Bug(format!("bad glob pattern: {err}"))
    }
}

impl Error {
    /// Errors the mechanism-fallback loop is allowed to catch. Everything
    /// else, `Bug` in particular, must propagate.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Error::NotSupported { .. } | Error::TryAnotherMechanism { .. }
        )
    }

    pub fn not_supported<S: Into<String>>(what: S) -> Error {
        Error::NotSupported {
            what: what.into(),
            errors: Vec::new(),
        }
    }

    pub fn try_another<M: ToString, S: Into<String>>(mname: M, reason: S) -> Error {
        Error::TryAnotherMechanism {
            mname: mname.to_string(),
            reason: reason.into(),
        }
    }

    pub fn verify_failed<W, E, A>(what: W, expected: E, actual: A) -> Error
    where
        W: Into<String>,
        E: ToString,
        A: ToString,
    {
        Error::VerifyFailed {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

fn format_not_supported(what: &str, errors: &[String]) -> String {
    if errors.is_empty() {
        return format!("{what} is not supported");
    }

    let mut msg = format!("{what} is not supported:");
    for err in errors {
        msg.push_str("\n  * ");
        msg.push_str(err);
    }
    msg
}

/// Re-read a value with `read` until it matches `expected`, up to `retries`
/// additional attempts with `sleep` between them. Shared by the sysfs and MSR
/// write-verification paths.
pub(crate) fn verify_readback<F>(
    mut read: F,
    what: &str,
    expected: &str,
    retries: u32,
    sleep: Duration,
) -> Result<()>
where
    F: FnMut() -> Result<String>,
{
    let mut actual = read()?;
    if actual == expected {
        return Ok(());
    }

    for _ in 0..retries {
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
        actual = read()?;
        if actual == expected {
            return Ok(());
        }
    }

    Err(Error::verify_failed(what, expected, actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_readback_retries() {
        // First two reads mismatch, the third one matches.
        let mut reads = vec!["2", "1", "0"];
        let res = verify_readback(
            || Ok(reads.pop().unwrap().to_string()),
            "test knob",
            "2",
            2,
            Duration::ZERO,
        );
        assert!(res.is_ok());
        assert!(reads.is_empty());
    }

    #[test]
    fn verify_readback_exhausted() {
        let res = verify_readback(
            || Ok("1".to_string()),
            "test knob",
            "2",
            2,
            Duration::ZERO,
        );
        match res {
            Err(Error::VerifyFailed {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "2");
                assert_eq!(actual, "1");
            }
            other => panic!("expected VerifyFailed, got {other:?}"),
        }
    }

    #[test]
    fn fallback_classification() {
        assert!(Error::not_supported("x").triggers_fallback());
        assert!(Error::try_another("msr", "y").triggers_fallback());
        assert!(!Error::Bug("z".to_string()).triggers_fallback());
        assert!(!Error::verify_failed("k", "1", "2").triggers_fallback());
    }
}
