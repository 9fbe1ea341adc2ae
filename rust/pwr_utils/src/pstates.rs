// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! P-state properties: CPU frequency limits, turbo, cpufreq governors, EPP,
//! EPB and HWP status.
//!
//! Frequencies are kept in Hz (sysfs reports kHz, the adapter converts).
//! EPP and base frequency fall back from sysfs to MSR. EPB scope depends on
//! the platform and is resolved lazily: per-CPU when the kernel exposes the
//! sysfs knob, package otherwise (the bare MSR is shared more widely on the
//! platforms that lack the knob).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::access::{PropsBackend, PvStream};
use crate::error::{Error, Result};
use crate::human::format_freq;
use crate::msr::{self, Msr};
use crate::props::{DType, Mechanism, PropDesc, PropValue, Scope};
use crate::sysfs::SysfsIo;
use crate::topology::Topology;

const EPB_BITS: std::ops::RangeInclusive<u32> = 0..=3;
const EPP_BITS: std::ops::RangeInclusive<u32> = 24..=31;
const HWP_ENABLE_BIT: std::ops::RangeInclusive<u32> = 0..=0;
const BASE_RATIO_BITS: std::ops::RangeInclusive<u32> = 8..=15;

/// Frequency writes may take a moment to settle, verify with a short retry.
const VERIFY_RETRIES: u32 = 2;
const VERIFY_SLEEP: Duration = Duration::from_millis(100);

const PROPS: &[PropDesc] = &[
    PropDesc {
        name: "min_freq",
        label: "Min. CPU frequency",
        dtype: DType::Int,
        unit: Some("Hz"),
        writable: true,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs],
        special_vals: &["min", "max"],
        subprops: &[],
    },
    PropDesc {
        name: "max_freq",
        label: "Max. CPU frequency",
        dtype: DType::Int,
        unit: Some("Hz"),
        writable: true,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs],
        special_vals: &["min", "max"],
        subprops: &[],
    },
    PropDesc {
        name: "base_freq",
        label: "Base CPU frequency",
        dtype: DType::Int,
        unit: Some("Hz"),
        writable: false,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "turbo",
        label: "Turbo",
        dtype: DType::Bool,
        unit: None,
        writable: true,
        sname: Some(Scope::Global),
        iosname: Some(Scope::Global),
        mnames: &[Mechanism::Sysfs],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "governor",
        label: "CPU frequency governor",
        dtype: DType::Str,
        unit: None,
        writable: true,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs],
        special_vals: &[],
        subprops: &["governors"],
    },
    PropDesc {
        name: "governors",
        label: "Available CPU frequency governors",
        dtype: DType::StrList,
        unit: None,
        writable: false,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "driver",
        label: "CPU frequency driver",
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
        name: "epp",
        label: "EPP",
        dtype: DType::Str,
        unit: None,
        writable: true,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "epb",
        label: "EPB",
        dtype: DType::Int,
        unit: None,
        writable: true,
        // Scope depends on the platform, resolved lazily.
        sname: None,
        iosname: None,
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "hwp",
        label: "Hardware power management",
        dtype: DType::Bool,
        unit: None,
        writable: false,
        sname: Some(Scope::Global),
        iosname: Some(Scope::Global),
        mnames: &[Mechanism::Msr],
        special_vals: &[],
        subprops: &[],
    },
];

pub struct PStates {
    topo: Arc<Topology>,
    sysfs: SysfsIo,
    msr: Msr,
    props: BTreeMap<&'static str, PropDesc>,
}

impl PStates {
    pub fn new(topo: Arc<Topology>) -> PStates {
        Self::with_services(topo, SysfsIo::new(), Msr::new())
    }

    pub fn with_services(topo: Arc<Topology>, sysfs: SysfsIo, msr: Msr) -> PStates {
        let mut props = BTreeMap::new();
        for desc in PROPS {
            props.insert(desc.name, desc.clone());
        }
        PStates {
            topo,
            sysfs,
            msr,
            props,
        }
    }

    fn cpufreq_path(cpu: usize, file: &str) -> String {
        format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/{file}")
    }

    fn epb_path(cpu: usize) -> String {
        format!("/sys/devices/system/cpu/cpu{cpu}/power/energy_perf_bias")
    }

    /// Read a cpufreq policy file, mapping a missing file to NotSupported so
    /// the fallback loop can move on.
    fn read_cpufreq(&mut self, cpu: usize, file: &str) -> Result<String> {
        match self.sysfs.read(&Self::cpufreq_path(cpu, file)) {
            Ok(val) => Ok(val),
            Err(Error::NotFound(_)) => Err(Error::not_supported(format!(
                "the '{file}' cpufreq sysfs file does not exist for CPU {cpu}"
            ))),
            Err(err) => Err(err),
        }
    }

    fn read_khz(&mut self, cpu: usize, file: &str) -> Result<i64> {
        let val = self.read_cpufreq(cpu, file)?;
        val.parse::<i64>()
            .map(|khz| khz * 1000)
            .map_err(|_| Error::BadFormat(format!("failed to parse '{val}' from '{file}'")))
    }

    fn read_sysfs_prop(&mut self, pname: &str, cpu: usize) -> Result<PropValue> {
        match pname {
            "min_freq" => Ok(PropValue::Int(self.read_khz(cpu, "scaling_min_freq")?)),
            "max_freq" => Ok(PropValue::Int(self.read_khz(cpu, "scaling_max_freq")?)),
            "base_freq" => Ok(PropValue::Int(self.read_khz(cpu, "base_frequency")?)),
            "governor" => Ok(PropValue::Str(self.read_cpufreq(cpu, "scaling_governor")?)),
            "governors" => {
                let val = self.read_cpufreq(cpu, "scaling_available_governors")?;
                Ok(PropValue::StrList(
                    val.split_whitespace().map(str::to_string).collect(),
                ))
            }
            "driver" => Ok(PropValue::Str(self.read_cpufreq(cpu, "scaling_driver")?)),
            "epp" => Ok(PropValue::Str(
                self.read_cpufreq(cpu, "energy_performance_preference")?,
            )),
            "epb" => match self.sysfs.read_int(&Self::epb_path(cpu)) {
                Ok(val) => Ok(PropValue::Int(val)),
                Err(Error::NotFound(_)) => Err(Error::not_supported(format!(
                    "the EPB sysfs file does not exist for CPU {cpu}"
                ))),
                Err(err) => Err(err),
            },
            "turbo" => self.read_turbo(),
            _ => Err(Error::Bug(format!("unhandled sysfs property '{pname}'"))),
        }
    }

    fn read_msr_prop(&mut self, pname: &str, cpu: usize) -> Result<PropValue> {
        match pname {
            "base_freq" => {
                let ratio = self
                    .msr
                    .read_bits(cpu, msr::MSR_PLATFORM_INFO, &BASE_RATIO_BITS)?;
                Ok(PropValue::Int(ratio as i64 * 100_000_000))
            }
            "epp" => {
                let epp = self.msr.read_bits(cpu, msr::MSR_HWP_REQUEST, &EPP_BITS)?;
                Ok(PropValue::Str(epp.to_string()))
            }
            "epb" => {
                let epb = self
                    .msr
                    .read_bits(cpu, msr::MSR_ENERGY_PERF_BIAS, &EPB_BITS)?;
                Ok(PropValue::Int(epb as i64))
            }
            "hwp" => {
                let bit = self.msr.read_bits(cpu, msr::MSR_PM_ENABLE, &HWP_ENABLE_BIT)?;
                Ok(PropValue::Bool(bit == 1))
            }
            _ => Err(Error::Bug(format!("unhandled MSR property '{pname}'"))),
        }
    }

    /// `intel_pstate` exposes an inverted "no_turbo" knob, the generic
    /// cpufreq layer a "boost" one.
    fn read_turbo(&mut self) -> Result<PropValue> {
        match self.sysfs.read_int("/sys/devices/system/cpu/intel_pstate/no_turbo") {
            Ok(no_turbo) => return Ok(PropValue::Bool(no_turbo == 0)),
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        match self.sysfs.read_int("/sys/devices/system/cpu/cpufreq/boost") {
            Ok(boost) => Ok(PropValue::Bool(boost == 1)),
            Err(Error::NotFound(_)) => Err(Error::not_supported(
                "turbo cannot be controlled, neither the 'no_turbo' nor the 'boost' sysfs \
                 file exists",
            )),
            Err(err) => Err(err),
        }
    }

    fn write_turbo(&mut self, on: bool) -> Result<()> {
        if self
            .sysfs
            .exists("/sys/devices/system/cpu/intel_pstate/no_turbo")
        {
            return self.sysfs.write_verify(
                "/sys/devices/system/cpu/intel_pstate/no_turbo",
                if on { "0" } else { "1" },
                0,
                Duration::ZERO,
            );
        }
        if self.sysfs.exists("/sys/devices/system/cpu/cpufreq/boost") {
            return self.sysfs.write_verify(
                "/sys/devices/system/cpu/cpufreq/boost",
                if on { "1" } else { "0" },
                0,
                Duration::ZERO,
            );
        }
        Err(Error::not_supported(
            "turbo cannot be controlled, neither the 'no_turbo' nor the 'boost' sysfs \
             file exists",
        ))
    }

    /// Resolve a frequency value to Hz: either a number, or the special
    /// "min"/"max" resolved against the CPU's hardware limits.
    fn resolve_freq(&mut self, cpu: usize, val: &PropValue) -> Result<i64> {
        match val {
            PropValue::Int(hz) => Ok(*hz),
            PropValue::Str(special) => match special.as_str() {
                "min" => self.read_khz(cpu, "cpuinfo_min_freq"),
                "max" => self.read_khz(cpu, "cpuinfo_max_freq"),
                other => Err(Error::Bug(format!("unexpected special value '{other}'"))),
            },
            other => Err(Error::Bug(format!("unexpected frequency value '{other}'"))),
        }
    }

    fn write_freq(&mut self, pname: &str, cpu: usize, val: &PropValue) -> Result<()> {
        let hz = self.resolve_freq(cpu, val)?;

        // Refuse orderings the kernel would silently clamp.
        if pname == "min_freq" {
            let max_hz = self.read_khz(cpu, "scaling_max_freq")?;
            if hz > max_hz {
                return Err(Error::Other(format!(
                    "cannot set min. CPU frequency of CPU {cpu} to {}: it is higher than \
                     the currently configured max. frequency {}",
                    format_freq(hz),
                    format_freq(max_hz)
                )));
            }
        } else {
            let min_hz = self.read_khz(cpu, "scaling_min_freq")?;
            if hz < min_hz {
                return Err(Error::Other(format!(
                    "cannot set max. CPU frequency of CPU {cpu} to {}: it is lower than \
                     the currently configured min. frequency {}",
                    format_freq(hz),
                    format_freq(min_hz)
                )));
            }
        }

        let file = if pname == "min_freq" {
            "scaling_min_freq"
        } else {
            "scaling_max_freq"
        };
        debug!("CPU {cpu}: writing {} to '{file}'", format_freq(hz));
        self.sysfs.write_verify(
            &Self::cpufreq_path(cpu, file),
            &(hz / 1000).to_string(),
            VERIFY_RETRIES,
            VERIFY_SLEEP,
        )
    }

    fn write_sysfs_prop(&mut self, pname: &str, val: &PropValue, cpus: &[usize]) -> Result<()> {
        match (pname, val) {
            ("min_freq" | "max_freq", _) => {
                for &cpu in cpus {
                    self.write_freq(pname, cpu, val)?;
                }
                Ok(())
            }
            ("turbo", PropValue::Bool(on)) => self.write_turbo(*on),
            ("governor", PropValue::Str(governor)) => {
                let known = match self.read_sysfs_prop("governors", cpus[0])? {
                    PropValue::StrList(known) => known,
                    _ => Vec::new(),
                };
                if !known.contains(governor) {
                    return Err(Error::Other(format!(
                        "bad CPU frequency governor '{governor}', available governors \
                         are: {}",
                        known.join(", ")
                    )));
                }
                for &cpu in cpus {
                    self.sysfs.write_verify(
                        &Self::cpufreq_path(cpu, "scaling_governor"),
                        governor,
                        0,
                        Duration::ZERO,
                    )?;
                }
                Ok(())
            }
            ("epp", PropValue::Str(epp)) => {
                for &cpu in cpus {
                    let path = Self::cpufreq_path(cpu, "energy_performance_preference");
                    if !self.sysfs.exists(&path) {
                        return Err(Error::not_supported(format!(
                            "the EPP sysfs file does not exist for CPU {cpu}"
                        )));
                    }
                    self.sysfs.write_verify(&path, epp, 0, Duration::ZERO)?;
                }
                Ok(())
            }
            ("epb", PropValue::Int(epb)) => {
                Self::validate_epb(*epb)?;
                for &cpu in cpus {
                    let path = Self::epb_path(cpu);
                    if !self.sysfs.exists(&path) {
                        return Err(Error::not_supported(format!(
                            "the EPB sysfs file does not exist for CPU {cpu}"
                        )));
                    }
                    self.sysfs
                        .write_verify(&path, &epb.to_string(), 0, Duration::ZERO)?;
                }
                Ok(())
            }
            _ => Err(Error::Bug(format!(
                "unhandled sysfs write of property '{pname}'"
            ))),
        }
    }

    fn write_msr_prop(&mut self, pname: &str, val: &PropValue, cpus: &[usize]) -> Result<()> {
        match (pname, val) {
            ("epp", PropValue::Str(epp)) => {
                // The MSR carries only the raw 0-255 hint, policy names need
                // the sysfs interface.
                let raw: u64 = epp.parse().map_err(|_| {
                    Error::try_another(
                        Mechanism::Msr,
                        format!(
                            "EPP policy name '{epp}' cannot be written through the MSR, \
                             only numeric values 0-255"
                        ),
                    )
                })?;
                if raw > 255 {
                    return Err(Error::BadFormat(format!(
                        "bad EPP value {raw}, must be in the range 0-255"
                    )));
                }
                for &cpu in cpus {
                    self.msr.write_bits(cpu, msr::MSR_HWP_REQUEST, &EPP_BITS, raw)?;
                }
                Ok(())
            }
            ("epb", PropValue::Int(epb)) => {
                Self::validate_epb(*epb)?;
                for &cpu in cpus {
                    self.msr
                        .write_bits(cpu, msr::MSR_ENERGY_PERF_BIAS, &EPB_BITS, *epb as u64)?;
                }
                Ok(())
            }
            _ => Err(Error::Bug(format!(
                "unhandled MSR write of property '{pname}'"
            ))),
        }
    }

    fn validate_epb(epb: i64) -> Result<()> {
        if !(0..=15).contains(&epb) {
            return Err(Error::BadFormat(format!(
                "bad EPB value {epb}, must be in the range 0-15"
            )));
        }
        Ok(())
    }
}

impl PropsBackend for PStates {
    fn name(&self) -> &'static str {
        "pstates"
    }

    fn props(&self) -> &BTreeMap<&'static str, PropDesc> {
        &self.props
    }

    fn props_mut(&mut self) -> &mut BTreeMap<&'static str, PropDesc> {
        &mut self.props
    }

    fn resolve_sname(&mut self, pname: &str) -> Result<Scope> {
        match pname {
            "epb" => {
                // Platforms with the kernel EPB knob manage it per CPU. On
                // the rest only the bare MSR is left, which is shared at
                // package level on the platforms that lack the knob.
                let cpus = self.topo.cpus();
                let cpu = cpus.first().copied().unwrap_or(0);
                if self.sysfs.exists(&Self::epb_path(cpu)) {
                    Ok(Scope::Cpu)
                } else {
                    Ok(Scope::Package)
                }
            }
            _ => Err(Error::Bug(format!(
                "scope of property '{pname}' was left unresolved"
            ))),
        }
    }

    fn handles(&self, pname: &str, mname: Mechanism) -> bool {
        match mname {
            Mechanism::Sysfs => matches!(
                pname,
                "min_freq"
                    | "max_freq"
                    | "base_freq"
                    | "turbo"
                    | "governor"
                    | "governors"
                    | "driver"
                    | "epp"
                    | "epb"
            ),
            Mechanism::Msr => matches!(pname, "base_freq" | "epp" | "epb" | "hwp"),
            _ => false,
        }
    }

    fn read_cpus<'a>(
        &'a mut self,
        pname: &'a str,
        mname: Mechanism,
        cpus: &'a [usize],
    ) -> PvStream<'a> {
        match mname {
            Mechanism::Sysfs => Box::new(
                cpus.iter()
                    .map(move |&cpu| self.read_sysfs_prop(pname, cpu).map(|val| (cpu, val))),
            ),
            Mechanism::Msr => Box::new(
                cpus.iter()
                    .map(move |&cpu| self.read_msr_prop(pname, cpu).map(|val| (cpu, val))),
            ),
            _ => Box::new(std::iter::once(Err(Error::Bug(format!(
                "unhandled mechanism '{mname}' for '{pname}'"
            ))))),
        }
    }

    fn write_cpus(
        &mut self,
        pname: &str,
        mname: Mechanism,
        val: &PropValue,
        cpus: &[usize],
    ) -> Result<()> {
        match mname {
            Mechanism::Sysfs => self.write_sysfs_prop(pname, val, cpus),
            Mechanism::Msr => self.write_msr_prop(pname, val, cpus),
            _ => Err(Error::Bug(format!(
                "unhandled mechanism '{mname}' for '{pname}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PropsEngine;
    use crate::topology::tests::two_package_topo;

    fn setup(with_epb_sysfs: bool) -> (tempfile::TempDir, PropsEngine<PStates>) {
        let dir = tempfile::tempdir().unwrap();
        let cpu_root = dir.path().join("sys/devices/system/cpu");

        for cpu in 0..8 {
            let cpufreq = cpu_root.join(format!("cpu{cpu}/cpufreq"));
            std::fs::create_dir_all(&cpufreq).unwrap();
            std::fs::write(cpufreq.join("scaling_min_freq"), "800000\n").unwrap();
            std::fs::write(cpufreq.join("scaling_max_freq"), "3600000\n").unwrap();
            std::fs::write(cpufreq.join("cpuinfo_min_freq"), "800000\n").unwrap();
            std::fs::write(cpufreq.join("cpuinfo_max_freq"), "3600000\n").unwrap();
            std::fs::write(cpufreq.join("scaling_governor"), "powersave\n").unwrap();
            std::fs::write(
                cpufreq.join("scaling_available_governors"),
                "performance powersave\n",
            )
            .unwrap();
            std::fs::write(cpufreq.join("scaling_driver"), "intel_pstate\n").unwrap();
            std::fs::write(
                cpufreq.join("energy_performance_preference"),
                "balance_performance\n",
            )
            .unwrap();

            if with_epb_sysfs {
                let power = cpu_root.join(format!("cpu{cpu}/power"));
                std::fs::create_dir_all(&power).unwrap();
                std::fs::write(power.join("energy_perf_bias"), "6\n").unwrap();
            }

            let msr_dir = dir.path().join(format!("dev/cpu/{cpu}"));
            std::fs::create_dir_all(&msr_dir).unwrap();
            let mut image = vec![0u8; 0x1000];
            // Base ratio 24 (2.4GHz), HWP enabled, EPP 128, EPB 7.
            image[0xCE..0xCE + 8].copy_from_slice(&(24u64 << 8).to_le_bytes());
            image[0x770..0x770 + 8].copy_from_slice(&1u64.to_le_bytes());
            image[0x774..0x774 + 8].copy_from_slice(&(128u64 << 24).to_le_bytes());
            image[0x1B0..0x1B0 + 8].copy_from_slice(&7u64.to_le_bytes());
            std::fs::write(msr_dir.join("msr"), image).unwrap();
        }

        let pstate_dir = cpu_root.join("intel_pstate");
        std::fs::create_dir_all(&pstate_dir).unwrap();
        std::fs::write(pstate_dir.join("no_turbo"), "0\n").unwrap();

        let topo = Arc::new(two_package_topo());
        let pstates = PStates::with_services(
            Arc::clone(&topo),
            SysfsIo::with_root(dir.path(), true),
            Msr::with_root(dir.path(), true),
        );
        (dir, PropsEngine::new(topo, pstates).unwrap())
    }

    #[test]
    fn freq_roundtrip_with_units() {
        let (_dir, mut engine) = setup(true);
        let mname = engine
            .set_prop_cpus("max_freq", "2.4GHz", &[0, 1], None)
            .unwrap();
        assert_eq!(mname, Mechanism::Sysfs);

        let infos = engine.get_prop_cpus("max_freq", &[0, 1], None, false).unwrap();
        for info in infos {
            assert_eq!(info.value, Some(PropValue::Int(2_400_000_000)));
        }
    }

    #[test]
    fn freq_special_values() {
        let (_dir, mut engine) = setup(true);
        engine.set_prop_cpus("min_freq", "min", &[0], None).unwrap();
        assert_eq!(
            engine.get_cpu_prop("min_freq", 0).unwrap(),
            Some(PropValue::Int(800_000_000))
        );
        engine.set_prop_cpus("max_freq", "max", &[0], None).unwrap();
        assert_eq!(
            engine.get_cpu_prop("max_freq", 0).unwrap(),
            Some(PropValue::Int(3_600_000_000))
        );
    }

    #[test]
    fn freq_ordering_check() {
        let (_dir, mut engine) = setup(true);
        match engine.set_prop_cpus("min_freq", "3.8GHz", &[0], None) {
            Err(Error::Other(msg)) => assert!(msg.contains("higher than")),
            other => panic!("expected ordering error, got {other:?}"),
        }
    }

    #[test]
    fn base_freq_falls_back_to_msr() {
        let (_dir, mut engine) = setup(true);
        // No 'base_frequency' sysfs file in the fixture: sysfs reports "not
        // supported" and the MSR mechanism takes over.
        let infos = engine.get_prop_cpus("base_freq", &[0], None, false).unwrap();
        assert_eq!(infos[0].value, Some(PropValue::Int(2_400_000_000)));
        assert_eq!(infos[0].mname, Some(Mechanism::Msr));
    }

    #[test]
    fn turbo_is_global_and_inverted() {
        let (dir, mut engine) = setup(true);
        assert_eq!(
            engine.get_cpu_prop("turbo", 0).unwrap(),
            Some(PropValue::Bool(true))
        );

        let all: Vec<usize> = (0..8).collect();
        engine.set_prop_cpus("turbo", "off", &all, None).unwrap();
        assert_eq!(
            std::fs::read_to_string(
                dir.path().join("sys/devices/system/cpu/intel_pstate/no_turbo")
            )
            .unwrap(),
            "1"
        );
    }

    #[test]
    fn epb_scope_depends_on_platform() {
        let (_dir, mut engine) = setup(true);
        assert_eq!(engine.get_sname("epb").unwrap(), Scope::Cpu);
        // Resolved once, the runtime table remembers it.
        assert_eq!(engine.get_sname("epb").unwrap(), Scope::Cpu);

        let (_dir, mut engine) = setup(false);
        assert_eq!(engine.get_sname("epb").unwrap(), Scope::Package);
    }

    #[test]
    fn epp_msr_rejects_policy_names() {
        let (_dir, mut engine) = setup(true);
        // Via sysfs policy names work.
        engine
            .set_prop_cpus("epp", "performance", &[0], None)
            .unwrap();
        // Restricted to MSR, a policy name cannot be applied and the
        // aggregated "not supported" error names the reason.
        match engine.set_prop_cpus("epp", "performance", &[0], Some(&[Mechanism::Msr])) {
            Err(Error::NotSupported { errors, .. }) => {
                assert!(errors[0].contains("only numeric"));
            }
            other => panic!("expected NotSupported, got {other:?}"),
        }
        // Numeric EPP through the MSR works.
        let mname = engine
            .set_prop_cpus("epp", "64", &[0], Some(&[Mechanism::Msr]))
            .unwrap();
        assert_eq!(mname, Mechanism::Msr);
    }

    #[test]
    fn hwp_is_read_only() {
        let (_dir, mut engine) = setup(true);
        assert_eq!(
            engine.get_cpu_prop("hwp", 0).unwrap(),
            Some(PropValue::Bool(true))
        );
        assert!(engine.set_prop_cpus("hwp", "off", &(0..8).collect::<Vec<_>>(), None).is_err());
    }
}
