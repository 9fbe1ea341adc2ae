// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Uncore frequency properties.
//!
//! Uncore frequency limits are per-die knobs, and the dies include
//! non-compute (I/O) dies, so this adapter works in die units rather than
//! CPU units. The primary mechanism is the `intel_uncore_frequency` sysfs
//! directory tree; the fallback is the TPMI uncore control register
//! (`UFS_CONTROL`-style layout: max ratio in bits 8-14, min ratio in bits
//! 15-21, in 100MHz units).
//!
//! The TPMI frequency bounds in [`UncoreLimits`] are policy knobs with
//! reasonable defaults, not hardware truths: embedders can override them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::access::{DiePvStream, PropsBackend, PvStream};
use crate::error::{Error, Result};
use crate::msr::{get_bits, set_bits};
use crate::props::{DType, Mechanism, PropDesc, PropValue, Scope};
use crate::sysfs::SysfsIo;
use crate::topology::Topology;
use crate::tpmi::Tpmi;
use crate::ROOT_PREFIX;

const UNCORE_SYSFS: &str = "/sys/devices/system/cpu/intel_uncore_frequency";

const MAX_RATIO_BITS: std::ops::RangeInclusive<u32> = 8..=14;
const MIN_RATIO_BITS: std::ops::RangeInclusive<u32> = 15..=21;
const RATIO_HZ: u64 = 100_000_000;

/// Frequency bounds applied to TPMI writes. The defaults cover current
/// server parts; override them when the platform is known to differ.
#[derive(Debug, Clone, Copy)]
pub struct UncoreLimits {
    pub min_hz: u64,
    pub max_hz: u64,
}

impl Default for UncoreLimits {
    fn default() -> Self {
        UncoreLimits {
            min_hz: 400_000_000,
            max_hz: 3_500_000_000,
        }
    }
}

const PROPS: &[PropDesc] = &[
    PropDesc {
        name: "min_freq",
        label: "Min. uncore frequency",
        dtype: DType::Int,
        unit: Some("Hz"),
        writable: true,
        sname: Some(Scope::Die),
        iosname: Some(Scope::Die),
        mnames: &[Mechanism::Sysfs, Mechanism::Tpmi],
        special_vals: &["min", "max"],
        subprops: &[],
    },
    PropDesc {
        name: "max_freq",
        label: "Max. uncore frequency",
        dtype: DType::Int,
        unit: Some("Hz"),
        writable: true,
        sname: Some(Scope::Die),
        iosname: Some(Scope::Die),
        mnames: &[Mechanism::Sysfs, Mechanism::Tpmi],
        special_vals: &["min", "max"],
        subprops: &[],
    },
];

pub struct Uncore {
    topo: Arc<Topology>,
    sysfs: SysfsIo,
    limits: UncoreLimits,
    tpmi_root: PathBuf,
    /// Lazily constructed, with the failure remembered so the hardware is
    /// probed only once.
    tpmi: Option<std::result::Result<Tpmi, String>>,
    props: BTreeMap<&'static str, PropDesc>,
}

impl Uncore {
    pub fn new(topo: Arc<Topology>) -> Uncore {
        let root = if ROOT_PREFIX.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(&*ROOT_PREFIX)
        };
        Self::with_services(topo, SysfsIo::new(), root, UncoreLimits::default())
    }

    pub fn with_services(
        topo: Arc<Topology>,
        sysfs: SysfsIo,
        tpmi_root: PathBuf,
        limits: UncoreLimits,
    ) -> Uncore {
        let mut props = BTreeMap::new();
        for desc in PROPS {
            props.insert(desc.name, desc.clone());
        }
        Uncore {
            topo,
            sysfs,
            limits,
            tpmi_root,
            tpmi: None,
            props,
        }
    }

    pub fn limits(&self) -> UncoreLimits {
        self.limits
    }

    fn tpmi(&mut self) -> Result<&Tpmi> {
        if self.tpmi.is_none() {
            self.tpmi = Some(Tpmi::with_root(&self.tpmi_root).map_err(|err| err.to_string()));
        }
        match self.tpmi.as_ref().unwrap() {
            Ok(tpmi) => Ok(tpmi),
            Err(msg) => Err(Error::not_supported(msg.clone())),
        }
    }

    fn die_dir(package: usize, die: usize) -> String {
        format!("{UNCORE_SYSFS}/package_{package:02}_die_{die:02}")
    }

    fn read_sysfs(&mut self, pname: &str, package: usize, die: usize) -> Result<PropValue> {
        let file = if pname == "min_freq" {
            "min_freq_khz"
        } else {
            "max_freq_khz"
        };
        let path = format!("{}/{file}", Self::die_dir(package, die));
        match self.sysfs.read_int(&path) {
            Ok(khz) => Ok(PropValue::Int(khz * 1000)),
            Err(Error::NotFound(_)) => Err(Error::not_supported(format!(
                "no uncore frequency sysfs directory for die {die} of package {package}, \
                 is the 'intel_uncore_frequency' driver loaded?"
            ))),
            Err(err) => Err(err),
        }
    }

    fn write_sysfs(
        &mut self,
        pname: &str,
        package: usize,
        die: usize,
        val: &PropValue,
    ) -> Result<()> {
        let dir = Self::die_dir(package, die);
        let khz = match val {
            PropValue::Int(hz) => hz / 1000,
            PropValue::Str(special) => {
                // The initial_* files hold the hardware limits, which is
                // what "min" and "max" mean.
                let file = if special == "min" {
                    "initial_min_freq_khz"
                } else {
                    "initial_max_freq_khz"
                };
                match self.sysfs.read_int(&format!("{dir}/{file}")) {
                    Ok(khz) => khz,
                    Err(Error::NotFound(_)) => {
                        return Err(Error::not_supported(format!(
                            "no '{file}' sysfs file for die {die} of package {package}"
                        )));
                    }
                    Err(err) => return Err(err),
                }
            }
            other => {
                return Err(Error::Bug(format!(
                    "unexpected uncore frequency value '{other}'"
                )));
            }
        };

        let file = if pname == "min_freq" {
            "min_freq_khz"
        } else {
            "max_freq_khz"
        };
        let path = format!("{dir}/{file}");
        if !self.sysfs.exists(&path) {
            return Err(Error::not_supported(format!(
                "no uncore frequency sysfs directory for die {die} of package {package}, \
                 is the 'intel_uncore_frequency' driver loaded?"
            )));
        }
        debug!("package {package} die {die}: writing {khz} kHz to '{file}'");
        self.sysfs
            .write_verify(&path, &khz.to_string(), 0, Duration::ZERO)
    }

    /// Map a package number to its TPMI instance index.
    fn tpmi_instance(&self, package: usize) -> Result<usize> {
        self.topo
            .packages()
            .iter()
            .position(|&pkg| pkg == package)
            .ok_or_else(|| Error::Bug(format!("unknown package {package}")))
    }

    fn read_tpmi(&mut self, pname: &str, package: usize, die: usize) -> Result<PropValue> {
        let instance = self.tpmi_instance(package)?;
        let reg = format!("control_d{die}");
        let val = self.tpmi()?.read(instance, "uncore", &reg)?;
        let bits = if pname == "min_freq" {
            MIN_RATIO_BITS
        } else {
            MAX_RATIO_BITS
        };
        Ok(PropValue::Int((get_bits(val, &bits) * RATIO_HZ) as i64))
    }

    fn write_tpmi(
        &mut self,
        pname: &str,
        package: usize,
        die: usize,
        val: &PropValue,
    ) -> Result<()> {
        let hz = match val {
            PropValue::Int(hz) => *hz as u64,
            PropValue::Str(special) => {
                if special == "min" {
                    self.limits.min_hz
                } else {
                    self.limits.max_hz
                }
            }
            other => {
                return Err(Error::Bug(format!(
                    "unexpected uncore frequency value '{other}'"
                )));
            }
        };

        if hz < self.limits.min_hz || hz > self.limits.max_hz {
            return Err(Error::Other(format!(
                "uncore frequency {hz}Hz is out of the supported range \
                 [{}Hz, {}Hz]",
                self.limits.min_hz, self.limits.max_hz
            )));
        }

        let instance = self.tpmi_instance(package)?;
        let reg = format!("control_d{die}");
        let bits = if pname == "min_freq" {
            MIN_RATIO_BITS
        } else {
            MAX_RATIO_BITS
        };

        let tpmi = self.tpmi()?;
        let old = tpmi.read(instance, "uncore", &reg)?;
        let new = set_bits(old, &bits, hz / RATIO_HZ);
        tpmi.write(instance, "uncore", &reg, new)
    }
}

impl PropsBackend for Uncore {
    fn name(&self) -> &'static str {
        "uncore"
    }

    fn props(&self) -> &BTreeMap<&'static str, PropDesc> {
        &self.props
    }

    fn props_mut(&mut self) -> &mut BTreeMap<&'static str, PropDesc> {
        &mut self.props
    }

    fn handles(&self, pname: &str, mname: Mechanism) -> bool {
        matches!(pname, "min_freq" | "max_freq")
            && matches!(mname, Mechanism::Sysfs | Mechanism::Tpmi)
    }

    fn die_units(&self, _pname: &str) -> bool {
        true
    }

    fn read_cpus<'a>(
        &'a mut self,
        pname: &'a str,
        _mname: Mechanism,
        _cpus: &'a [usize],
    ) -> PvStream<'a> {
        Box::new(std::iter::once(Err(Error::Bug(format!(
            "uncore property '{pname}' has die units and cannot be read per CPU"
        )))))
    }

    fn write_cpus(
        &mut self,
        pname: &str,
        _mname: Mechanism,
        _val: &PropValue,
        _cpus: &[usize],
    ) -> Result<()> {
        Err(Error::Bug(format!(
            "uncore property '{pname}' has die units and cannot be set per CPU"
        )))
    }

    fn read_dies<'a>(
        &'a mut self,
        pname: &'a str,
        mname: Mechanism,
        dies: &'a [(usize, usize)],
    ) -> DiePvStream<'a> {
        match mname {
            Mechanism::Sysfs => Box::new(dies.iter().map(move |&(pkg, die)| {
                self.read_sysfs(pname, pkg, die).map(|val| ((pkg, die), val))
            })),
            Mechanism::Tpmi => Box::new(dies.iter().map(move |&(pkg, die)| {
                self.read_tpmi(pname, pkg, die).map(|val| ((pkg, die), val))
            })),
            _ => Box::new(std::iter::once(Err(Error::Bug(format!(
                "unhandled mechanism '{mname}' for '{pname}'"
            ))))),
        }
    }

    fn write_dies(
        &mut self,
        pname: &str,
        mname: Mechanism,
        val: &PropValue,
        dies: &[(usize, usize)],
    ) -> Result<()> {
        for &(pkg, die) in dies {
            match mname {
                Mechanism::Sysfs => self.write_sysfs(pname, pkg, die, val)?,
                Mechanism::Tpmi => self.write_tpmi(pname, pkg, die, val)?,
                _ => {
                    return Err(Error::Bug(format!(
                        "unhandled mechanism '{mname}' for '{pname}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PropsEngine;
    use crate::topology::tests::two_package_topo;

    fn setup(with_sysfs: bool, with_tpmi: bool) -> (tempfile::TempDir, PropsEngine<Uncore>) {
        let dir = tempfile::tempdir().unwrap();

        if with_sysfs {
            for pkg in 0..2 {
                for die in 0..3 {
                    let die_dir = dir.path().join(format!(
                        "sys/devices/system/cpu/intel_uncore_frequency/package_{pkg:02}_die_{die:02}"
                    ));
                    std::fs::create_dir_all(&die_dir).unwrap();
                    std::fs::write(die_dir.join("min_freq_khz"), "800000\n").unwrap();
                    std::fs::write(die_dir.join("max_freq_khz"), "2400000\n").unwrap();
                    std::fs::write(die_dir.join("initial_min_freq_khz"), "800000\n").unwrap();
                    std::fs::write(die_dir.join("initial_max_freq_khz"), "2400000\n").unwrap();
                }
            }
        }

        if with_tpmi {
            for pkg in 0..2 {
                let feature = dir
                    .path()
                    .join(format!("sys/kernel/debug/tpmi-0000:{pkg:02}:03.1/uncore"));
                std::fs::create_dir_all(&feature).unwrap();
                for die in 0..3 {
                    // min ratio 8 (800MHz), max ratio 24 (2.4GHz).
                    let val: u64 = (8 << 15) | (24 << 8);
                    std::fs::write(feature.join(format!("control_d{die}")), format!("{val:#x}"))
                        .unwrap();
                }
            }
        }

        let topo = Arc::new(two_package_topo());
        let uncore = Uncore::with_services(
            Arc::clone(&topo),
            SysfsIo::with_root(dir.path(), true),
            dir.path().to_path_buf(),
            UncoreLimits::default(),
        );
        (dir, PropsEngine::new(topo, uncore).unwrap())
    }

    #[test]
    fn sysfs_read_includes_io_dies() {
        let (_dir, mut engine) = setup(true, false);
        let dies = BTreeMap::from([(0, vec![0, 1, 2])]);
        let infos = engine.get_prop_dies("min_freq", &dies, None, false).unwrap();
        assert_eq!(infos.len(), 3);
        for info in &infos {
            assert_eq!(info.value, Some(PropValue::Int(800_000_000)));
            assert_eq!(info.mname, Some(Mechanism::Sysfs));
        }
        // Die 2 is the I/O die and is served all the same.
        assert_eq!(infos[2].die, 2);
    }

    #[test]
    fn tpmi_fallback() {
        let (_dir, mut engine) = setup(false, true);
        let dies = BTreeMap::from([(1, vec![0])]);
        let infos = engine.get_prop_dies("max_freq", &dies, None, false).unwrap();
        assert_eq!(infos[0].value, Some(PropValue::Int(2_400_000_000)));
        assert_eq!(infos[0].mname, Some(Mechanism::Tpmi));

        let mname = engine
            .set_prop_dies("max_freq", "2GHz", &dies, None)
            .unwrap();
        assert_eq!(mname, Mechanism::Tpmi);
        let infos = engine.get_prop_dies("max_freq", &dies, None, false).unwrap();
        assert_eq!(infos[0].value, Some(PropValue::Int(2_000_000_000)));
    }

    #[test]
    fn tpmi_write_respects_limits() {
        let (_dir, mut engine) = setup(false, true);
        let dies = BTreeMap::from([(0, vec![0])]);
        match engine.set_prop_dies("max_freq", "8GHz", &dies, None) {
            Err(Error::Other(msg)) => assert!(msg.contains("out of the supported range")),
            other => panic!("expected limit error, got {other:?}"),
        }
    }

    #[test]
    fn neither_mechanism_available() {
        let (_dir, mut engine) = setup(false, false);
        let dies = BTreeMap::from([(0, vec![0])]);
        match engine.get_prop_dies("min_freq", &dies, None, false) {
            Err(Error::NotSupported { errors, .. }) => assert_eq!(errors.len(), 2),
            other => panic!("expected NotSupported, got {other:?}"),
        }
        // Tolerant callers get None-valued records instead.
        let infos = engine.get_prop_dies("min_freq", &dies, None, true).unwrap();
        assert_eq!(infos[0].value, None);
    }

    #[test]
    fn special_values_via_sysfs() {
        let (dir, mut engine) = setup(true, false);
        let dies = BTreeMap::from([(0, vec![1])]);
        engine.set_prop_dies("min_freq", "max", &dies, None).unwrap();
        let val = std::fs::read_to_string(dir.path().join(
            "sys/devices/system/cpu/intel_uncore_frequency/package_00_die_01/min_freq_khz",
        ))
        .unwrap();
        assert_eq!(val, "2400000");
    }
}
