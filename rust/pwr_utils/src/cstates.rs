// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! C-state properties and requestable idle states.
//!
//! The package C-state limit and C1 demotion knobs live in the
//! `MSR_PKG_CST_CONFIG_CONTROL` register. The limit has package scope but the
//! register is per-core, so the property declares a core I/O scope and the
//! framework cross-checks sibling cores before trusting a single read. The
//! idle driver and governor knobs are global sysfs files. Requestable idle
//! states (C1, C6, ...) are not properties: they are enumerated and toggled
//! per CPU through the `cpuidle/stateN` directories.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::access::{PropsBackend, PvStream};
use crate::error::{Error, Result};
use crate::msr::{self, Msr};
use crate::props::{DType, Mechanism, PropDesc, PropValue, Scope};
use crate::sysfs::SysfsIo;
use crate::topology::Topology;

/// Package C-state limit codes of `MSR_PKG_CST_CONFIG_CONTROL` bits 0-2.
/// The mapping is model-specific in reality; this is the common encoding.
const PKG_CST_LIMITS: &[&str] = &["PC0", "PC2", "PC3", "PC6", "PC8", "PC9", "PC10", "unlimited"];

const LIMIT_BITS: std::ops::RangeInclusive<u32> = 0..=2;
const LOCK_BIT: std::ops::RangeInclusive<u32> = 15..=15;
const C1_DEMOTION_BIT: std::ops::RangeInclusive<u32> = 26..=26;
const C1_UNDEMOTION_BIT: std::ops::RangeInclusive<u32> = 28..=28;

const CPUIDLE_SYSFS: &str = "/sys/devices/system/cpu/cpuidle";

const PROPS: &[PropDesc] = &[
    PropDesc {
        name: "pkg_cstate_limit",
        label: "Package C-state limit",
        dtype: DType::Str,
        unit: None,
        writable: true,
        sname: Some(Scope::Package),
        iosname: Some(Scope::Core),
        mnames: &[Mechanism::Msr],
        special_vals: &[],
        subprops: &["pkg_cstate_limit_lock"],
    },
    PropDesc {
        name: "pkg_cstate_limit_lock",
        label: "Package C-state limit lock",
        dtype: DType::Bool,
        unit: None,
        writable: false,
        sname: Some(Scope::Package),
        iosname: Some(Scope::Core),
        mnames: &[Mechanism::Msr],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "c1_demotion",
        label: "C1 demotion",
        dtype: DType::Bool,
        unit: None,
        writable: true,
        sname: Some(Scope::Core),
        iosname: Some(Scope::Core),
        mnames: &[Mechanism::Msr],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "c1_undemotion",
        label: "C1 undemotion",
        dtype: DType::Bool,
        unit: None,
        writable: true,
        sname: Some(Scope::Core),
        iosname: Some(Scope::Core),
        mnames: &[Mechanism::Msr],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "idle_driver",
        label: "Idle driver",
        dtype: DType::Str,
        unit: None,
        writable: false,
        sname: Some(Scope::Global),
        iosname: Some(Scope::Global),
        mnames: &[Mechanism::Sysfs],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "governor",
        label: "Idle governor",
        dtype: DType::Str,
        unit: None,
        writable: true,
        sname: Some(Scope::Global),
        iosname: Some(Scope::Global),
        mnames: &[Mechanism::Sysfs],
        special_vals: &[],
        subprops: &["governors"],
    },
    PropDesc {
        name: "governors",
        label: "Available idle governors",
        dtype: DType::StrList,
        unit: None,
        writable: false,
        sname: Some(Scope::Global),
        iosname: Some(Scope::Global),
        mnames: &[Mechanism::Sysfs],
        special_vals: &[],
        subprops: &[],
    },
];

/// One requestable idle state of one CPU.
#[derive(Debug, Clone)]
pub struct IdleState {
    pub index: usize,
    pub name: String,
    pub desc: String,
    pub latency_us: u64,
    pub residency_us: u64,
    pub disabled: bool,
    pub usage: u64,
    pub time_us: u64,
}

pub struct CStates {
    topo: Arc<Topology>,
    sysfs: SysfsIo,
    msr: Msr,
    props: BTreeMap<&'static str, PropDesc>,
}

impl CStates {
    pub fn new(topo: Arc<Topology>) -> CStates {
        Self::with_services(topo, SysfsIo::new(), Msr::new())
    }

    pub fn with_services(topo: Arc<Topology>, sysfs: SysfsIo, msr: Msr) -> CStates {
        let mut props = BTreeMap::new();
        for desc in PROPS {
            props.insert(desc.name, desc.clone());
        }
        CStates {
            topo,
            sysfs,
            msr,
            props,
        }
    }

    fn read_prop(&mut self, pname: &str, cpu: usize) -> Result<PropValue> {
        match pname {
            "pkg_cstate_limit" => {
                let code = self
                    .msr
                    .read_bits(cpu, msr::MSR_PKG_CST_CONFIG_CONTROL, &LIMIT_BITS)?;
                let limit = PKG_CST_LIMITS.get(code as usize).ok_or_else(|| {
                    Error::Bug(format!("unexpected package C-state limit code {code}"))
                })?;
                Ok(PropValue::Str(limit.to_string()))
            }
            "pkg_cstate_limit_lock" => {
                let lock = self
                    .msr
                    .read_bits(cpu, msr::MSR_PKG_CST_CONFIG_CONTROL, &LOCK_BIT)?;
                Ok(PropValue::Bool(lock == 1))
            }
            "c1_demotion" => {
                let bit = self
                    .msr
                    .read_bits(cpu, msr::MSR_PKG_CST_CONFIG_CONTROL, &C1_DEMOTION_BIT)?;
                Ok(PropValue::Bool(bit == 1))
            }
            "c1_undemotion" => {
                let bit = self
                    .msr
                    .read_bits(cpu, msr::MSR_PKG_CST_CONFIG_CONTROL, &C1_UNDEMOTION_BIT)?;
                Ok(PropValue::Bool(bit == 1))
            }
            "idle_driver" => self.read_global_sysfs("current_driver"),
            "governor" => self.read_global_sysfs("current_governor"),
            "governors" => {
                let val = self.read_global_sysfs("available_governors")?;
                let list = val
                    .to_string()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                Ok(PropValue::StrList(list))
            }
            _ => Err(Error::Bug(format!("unhandled property '{pname}'"))),
        }
    }

    fn read_global_sysfs(&mut self, file: &str) -> Result<PropValue> {
        match self.sysfs.read(&format!("{CPUIDLE_SYSFS}/{file}")) {
            Ok(val) => Ok(PropValue::Str(val)),
            Err(Error::NotFound(_)) => Err(Error::not_supported(format!(
                "the '{file}' cpuidle sysfs file does not exist, the kernel is probably \
                 built without CONFIG_CPU_IDLE"
            ))),
            Err(err) => Err(err),
        }
    }

    fn write_limit(&mut self, limit: &str, cpus: &[usize]) -> Result<()> {
        let code = PKG_CST_LIMITS
            .iter()
            .position(|l| l.eq_ignore_ascii_case(limit))
            .ok_or_else(|| {
                Error::BadFormat(format!(
                    "bad package C-state limit '{limit}', use one of: {}",
                    PKG_CST_LIMITS.join(", ")
                ))
            })?;

        for &cpu in cpus {
            let lock = self
                .msr
                .read_bits(cpu, msr::MSR_PKG_CST_CONFIG_CONTROL, &LOCK_BIT)?;
            if lock == 1 {
                return Err(Error::Other(format!(
                    "the package C-state limit is locked by the BIOS on CPU {cpu} and \
                     cannot be modified"
                )));
            }
            self.msr.write_bits(
                cpu,
                msr::MSR_PKG_CST_CONFIG_CONTROL,
                &LIMIT_BITS,
                code as u64,
            )?;
        }
        Ok(())
    }

    fn write_bit(&mut self, bits: &std::ops::RangeInclusive<u32>, on: bool, cpus: &[usize]) -> Result<()> {
        for &cpu in cpus {
            self.msr.write_bits(
                cpu,
                msr::MSR_PKG_CST_CONFIG_CONTROL,
                bits,
                u64::from(on),
            )?;
        }
        Ok(())
    }

    fn state_path(cpu: usize, index: usize, file: &str) -> String {
        format!("/sys/devices/system/cpu/cpu{cpu}/cpuidle/state{index}/{file}")
    }

    /// Enumerate the requestable idle states of `cpu`, ordered by state
    /// index.
    pub fn idle_states(&mut self, cpu: usize) -> Result<Vec<IdleState>> {
        let mut states = Vec::new();
        for index in 0.. {
            if !self.sysfs.exists(&Self::state_path(cpu, index, "name")) {
                break;
            }
            // The disable flag and the statistics change at runtime, do not
            // let the cache go stale.
            let disable_path = Self::state_path(cpu, index, "disable");
            self.sysfs.cache_remove(&disable_path);
            self.sysfs.cache_remove(&Self::state_path(cpu, index, "usage"));
            self.sysfs.cache_remove(&Self::state_path(cpu, index, "time"));

            states.push(IdleState {
                index,
                name: self.sysfs.read(&Self::state_path(cpu, index, "name"))?,
                desc: self.sysfs.read(&Self::state_path(cpu, index, "desc"))?,
                latency_us: self.sysfs.read_int(&Self::state_path(cpu, index, "latency"))? as u64,
                residency_us: self.sysfs.read_int(&Self::state_path(cpu, index, "residency"))?
                    as u64,
                disabled: self.sysfs.read_int(&disable_path)? != 0,
                usage: self.sysfs.read_int(&Self::state_path(cpu, index, "usage"))? as u64,
                time_us: self.sysfs.read_int(&Self::state_path(cpu, index, "time"))? as u64,
            });
        }

        if states.is_empty() {
            return Err(Error::not_supported(format!(
                "no idle states found for CPU {cpu}, the kernel is probably built \
                 without CONFIG_CPU_IDLE"
            )));
        }
        Ok(states)
    }

    /// Enable or disable idle states by name ("C6", case-insensitive, or
    /// "all") for every CPU in `cpus`.
    pub fn toggle_idle_states(
        &mut self,
        cpus: &[usize],
        names: &[String],
        disable: bool,
    ) -> Result<()> {
        let cpus = self.topo.normalize_cpus(cpus, false)?;
        let all = names.iter().any(|n| n.eq_ignore_ascii_case("all"));

        for &cpu in &cpus {
            let states = self.idle_states(cpu)?;
            let mut matched: Vec<&IdleState> = Vec::new();
            if all {
                matched.extend(states.iter());
            } else {
                for name in names {
                    let state = states
                        .iter()
                        .find(|s| s.name.eq_ignore_ascii_case(name))
                        .ok_or_else(|| {
                            Error::Other(format!(
                                "CPU {cpu} does not have idle state '{name}', available \
                                 states are: {}",
                                states
                                    .iter()
                                    .map(|s| s.name.as_str())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            ))
                        })?;
                    matched.push(state);
                }
            }

            for state in matched {
                let path = Self::state_path(cpu, state.index, "disable");
                debug!(
                    "{} idle state {} on CPU {cpu}",
                    if disable { "disabling" } else { "enabling" },
                    state.name
                );
                self.sysfs
                    .write_verify(&path, if disable { "1" } else { "0" }, 0, Duration::ZERO)?;
            }
        }
        Ok(())
    }
}

impl PropsBackend for CStates {
    fn name(&self) -> &'static str {
        "cstates"
    }

    fn props(&self) -> &BTreeMap<&'static str, PropDesc> {
        &self.props
    }

    fn props_mut(&mut self) -> &mut BTreeMap<&'static str, PropDesc> {
        &mut self.props
    }

    fn handles(&self, pname: &str, mname: Mechanism) -> bool {
        match mname {
            Mechanism::Msr => matches!(
                pname,
                "pkg_cstate_limit" | "pkg_cstate_limit_lock" | "c1_demotion" | "c1_undemotion"
            ),
            Mechanism::Sysfs => matches!(pname, "idle_driver" | "governor" | "governors"),
            _ => false,
        }
    }

    fn read_cpus<'a>(
        &'a mut self,
        pname: &'a str,
        _mname: Mechanism,
        cpus: &'a [usize],
    ) -> PvStream<'a> {
        Box::new(
            cpus.iter()
                .map(move |&cpu| self.read_prop(pname, cpu).map(|val| (cpu, val))),
        )
    }

    fn write_cpus(
        &mut self,
        pname: &str,
        _mname: Mechanism,
        val: &PropValue,
        cpus: &[usize],
    ) -> Result<()> {
        match (pname, val) {
            ("pkg_cstate_limit", PropValue::Str(limit)) => self.write_limit(limit, cpus),
            ("c1_demotion", PropValue::Bool(on)) => self.write_bit(&C1_DEMOTION_BIT, *on, cpus),
            ("c1_undemotion", PropValue::Bool(on)) => self.write_bit(&C1_UNDEMOTION_BIT, *on, cpus),
            ("governor", PropValue::Str(governor)) => {
                let known = match self.read_prop("governors", cpus[0])? {
                    PropValue::StrList(known) => known,
                    _ => Vec::new(),
                };
                if !known.contains(governor) {
                    return Err(Error::Other(format!(
                        "bad idle governor '{governor}', available governors are: {}",
                        known.join(", ")
                    )));
                }
                self.sysfs.write_verify(
                    &format!("{CPUIDLE_SYSFS}/current_governor"),
                    governor,
                    0,
                    Duration::ZERO,
                )
            }
            _ => Err(Error::Bug(format!(
                "unhandled write of property '{pname}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PropsEngine;
    use crate::topology::tests::two_package_topo;

    fn setup() -> (tempfile::TempDir, PropsEngine<CStates>) {
        let dir = tempfile::tempdir().unwrap();

        let cpuidle = dir.path().join("sys/devices/system/cpu/cpuidle");
        std::fs::create_dir_all(&cpuidle).unwrap();
        std::fs::write(cpuidle.join("current_driver"), "intel_idle\n").unwrap();
        std::fs::write(cpuidle.join("current_governor"), "menu\n").unwrap();
        std::fs::write(cpuidle.join("available_governors"), "ladder menu teo\n").unwrap();

        for cpu in 0..8 {
            let msr_dir = dir.path().join(format!("dev/cpu/{cpu}"));
            std::fs::create_dir_all(&msr_dir).unwrap();
            // Limit code 3 (PC6), C1 demotion on.
            let mut image = vec![0u8; 0x1000];
            let val: u64 = 0x3 | (1 << 26);
            image[0xE2..0xE2 + 8].copy_from_slice(&val.to_le_bytes());
            std::fs::write(msr_dir.join("msr"), image).unwrap();

            for (index, &(name, latency)) in [("POLL", 0), ("C1", 2), ("C6", 133)]
                .iter()
                .enumerate()
            {
                let state = dir.path().join(format!(
                    "sys/devices/system/cpu/cpu{cpu}/cpuidle/state{index}"
                ));
                std::fs::create_dir_all(&state).unwrap();
                std::fs::write(state.join("name"), format!("{name}\n")).unwrap();
                std::fs::write(state.join("desc"), format!("{name} state\n")).unwrap();
                std::fs::write(state.join("latency"), format!("{latency}\n")).unwrap();
                std::fs::write(state.join("residency"), format!("{}\n", latency * 3)).unwrap();
                std::fs::write(state.join("disable"), "0\n").unwrap();
                std::fs::write(state.join("usage"), "0\n").unwrap();
                std::fs::write(state.join("time"), "0\n").unwrap();
            }
        }

        let topo = Arc::new(two_package_topo());
        let cstates = CStates::with_services(
            Arc::clone(&topo),
            SysfsIo::with_root(dir.path(), true),
            Msr::with_root(dir.path(), true),
        );
        (dir, PropsEngine::new(topo, cstates).unwrap())
    }

    #[test]
    fn limit_read_decode() {
        let (_dir, mut engine) = setup();
        let infos = engine
            .get_prop_packages("pkg_cstate_limit", &[0, 1], None, false)
            .unwrap();
        assert_eq!(infos.len(), 2);
        for info in infos {
            assert_eq!(info.value, Some(PropValue::Str("PC6".to_string())));
            assert_eq!(info.mname, Some(Mechanism::Msr));
        }
    }

    #[test]
    fn limit_write_respects_lock() {
        let (dir, mut engine) = setup();
        engine
            .set_prop_packages("pkg_cstate_limit", "PC2", &[0], None)
            .unwrap();
        let infos = engine
            .get_prop_packages("pkg_cstate_limit", &[0], None, false)
            .unwrap();
        assert_eq!(infos[0].value, Some(PropValue::Str("PC2".to_string())));

        // Lock CPU 4 (package 1) and try to modify package 1.
        let msr_path = dir.path().join("dev/cpu/4/msr");
        let mut image = std::fs::read(&msr_path).unwrap();
        let mut val = u64::from_le_bytes(image[0xE2..0xE2 + 8].try_into().unwrap());
        val |= 1 << 15;
        image[0xE2..0xE2 + 8].copy_from_slice(&val.to_le_bytes());
        std::fs::write(&msr_path, image).unwrap();
        engine.backend_mut().msr.cache_remove(4, msr::MSR_PKG_CST_CONFIG_CONTROL);

        match engine.set_prop_packages("pkg_cstate_limit", "PC2", &[1], None) {
            Err(Error::Other(msg)) => assert!(msg.contains("locked")),
            other => panic!("expected lock error, got {other:?}"),
        }
    }

    #[test]
    fn c1_demotion_core_scope() {
        let (_dir, mut engine) = setup();
        assert_eq!(
            engine.get_cpu_prop("c1_demotion", 0).unwrap(),
            Some(PropValue::Bool(true))
        );
        engine.set_prop_cpus("c1_demotion", "off", &[0], None).unwrap();
        assert_eq!(
            engine.get_cpu_prop("c1_demotion", 0).unwrap(),
            Some(PropValue::Bool(false))
        );
    }

    #[test]
    fn governor_validation() {
        let (_dir, mut engine) = setup();
        let all: Vec<usize> = (0..8).collect();
        engine.set_prop_cpus("governor", "teo", &all, None).unwrap();
        match engine.set_prop_cpus("governor", "nope", &all, None) {
            Err(Error::Other(msg)) => assert!(msg.contains("available governors")),
            other => panic!("expected governor error, got {other:?}"),
        }
    }

    #[test]
    fn idle_state_toggling() {
        let (_dir, mut engine) = setup();
        let states = engine.backend_mut().idle_states(0).unwrap();
        assert_eq!(states.len(), 3);
        assert_eq!(states[2].name, "C6");
        assert!(!states[2].disabled);

        engine
            .backend_mut()
            .toggle_idle_states(&[0, 1], &["c6".to_string()], true)
            .unwrap();
        let states = engine.backend_mut().idle_states(0).unwrap();
        assert!(states[2].disabled);
        assert!(!states[1].disabled);

        assert!(engine
            .backend_mut()
            .toggle_idle_states(&[0], &["C9".to_string()], true)
            .is_err());
    }
}
