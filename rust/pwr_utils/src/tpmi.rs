// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! TPMI (Topology Aware Register and PM Capsule Interface) access through
//! debugfs.
//!
//! The `intel_vsec_tpmi` driver exposes one `tpmi-*` directory per package
//! under debugfs. This module models the surface we need from it: per-feature
//! register files holding a 64-bit value, read and written as hex text.
//! Instances are ordered and addressed by package index. A missing debugfs
//! tree (driver not loaded, debugfs not mounted) reports `NotSupported`, so
//! mechanism fallback can move on.

use std::path::{Path, PathBuf};

use glob::glob;

use crate::error::{Error, Result};
use crate::ROOT_PREFIX;

const DEBUGFS: &str = "sys/kernel/debug";

#[derive(Debug)]
pub struct Tpmi {
    /// Instance directories, sorted, indexed by package number.
    instances: Vec<PathBuf>,
}

impl Tpmi {
    pub fn new() -> Result<Tpmi> {
        let root = if ROOT_PREFIX.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(&*ROOT_PREFIX)
        };
        Self::with_root(root)
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Result<Tpmi> {
        let pattern = root.as_ref().join(DEBUGFS).join("tpmi-*");
        let mut instances: Vec<PathBuf> = glob(&pattern.to_string_lossy())?
            .filter_map(std::result::Result::ok)
            .filter(|p| p.is_dir())
            .collect();
        instances.sort();

        if instances.is_empty() {
            return Err(Error::not_supported(
                "TPMI: no 'tpmi-*' debugfs directories found, is the 'intel_vsec_tpmi' \
                 driver loaded and debugfs mounted?",
            ));
        }

        Ok(Tpmi { instances })
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn reg_path(&self, instance: usize, feature: &str, reg: &str) -> Result<PathBuf> {
        let dir = self.instances.get(instance).ok_or_else(|| {
            Error::not_supported(format!(
                "TPMI instance {instance} does not exist, only {} instance(s) found",
                self.instances.len()
            ))
        })?;
        Ok(dir.join(feature).join(reg))
    }

    /// Read the register file `reg` of `feature` on `instance`.
    pub fn read(&self, instance: usize, feature: &str, reg: &str) -> Result<u64> {
        let path = self.reg_path(instance, feature, reg)?;
        let val = match std::fs::read_to_string(&path) {
            Ok(val) => val,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_supported(format!(
                    "TPMI feature '{feature}' register '{reg}' does not exist on \
                     instance {instance}"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let val = val.trim().trim_start_matches("0x");
        u64::from_str_radix(val, 16)
            .map_err(|_| Error::BadFormat(format!("failed to parse '{val}' from '{}'", path.display())))
    }

    /// Write the register file `reg` of `feature` on `instance`.
    pub fn write(&self, instance: usize, feature: &str, reg: &str, val: u64) -> Result<()> {
        let path = self.reg_path(instance, feature, reg)?;
        match std::fs::write(&path, format!("{val:#x}")) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_supported(format!(
                    "TPMI feature '{feature}' register '{reg}' does not exist on \
                     instance {instance}"
                )))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write() {
        let dir = tempfile::tempdir().unwrap();
        let feature = dir.path().join("sys/kernel/debug/tpmi-0000:00:03.1/uncore");
        std::fs::create_dir_all(&feature).unwrap();
        std::fs::write(feature.join("control_d0"), "0x1f00\n").unwrap();

        let tpmi = Tpmi::with_root(dir.path()).unwrap();
        assert_eq!(tpmi.instance_count(), 1);
        assert_eq!(tpmi.read(0, "uncore", "control_d0").unwrap(), 0x1f00);

        tpmi.write(0, "uncore", "control_d0", 0x2000).unwrap();
        assert_eq!(tpmi.read(0, "uncore", "control_d0").unwrap(), 0x2000);

        match tpmi.read(1, "uncore", "control_d0") {
            Err(Error::NotSupported { .. }) => {}
            other => panic!("expected NotSupported, got {other:?}"),
        }
        match tpmi.read(0, "uncore", "control_d9") {
            Err(Error::NotSupported { .. }) => {}
            other => panic!("expected NotSupported, got {other:?}"),
        }
    }

    #[test]
    fn missing_debugfs() {
        let dir = tempfile::tempdir().unwrap();
        match Tpmi::with_root(dir.path()) {
            Err(Error::NotSupported { .. }) => {}
            other => panic!("expected NotSupported, got {other:?}"),
        }
    }
}
