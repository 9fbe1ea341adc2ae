// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! PM QoS latency-limit properties.
//!
//! Two knobs: the per-CPU resume latency limit
//! (`/sys/devices/system/cpu/cpuN/power/pm_qos_resume_latency_us`), and the
//! global DMA latency limit (`/dev/cpu_dma_latency`). The global limit is a
//! character-device request: it holds only while the device node is open, so
//! the adapter keeps the file descriptor for its own lifetime.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use crate::access::{PropsBackend, PvStream};
use crate::error::{Error, Result};
use crate::props::{DType, Mechanism, PropDesc, PropValue, Scope};
use crate::sysfs::SysfsIo;
use crate::ROOT_PREFIX;

const PROPS: &[PropDesc] = &[
    PropDesc {
        name: "latency_limit",
        label: "CPU wake-up latency limit",
        dtype: DType::Int,
        unit: Some("us"),
        writable: true,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs],
        special_vals: &[],
        subprops: &[],
    },
    PropDesc {
        name: "global_latency_limit",
        label: "Global DMA latency limit",
        dtype: DType::Int,
        unit: Some("us"),
        writable: true,
        sname: Some(Scope::Global),
        iosname: Some(Scope::Global),
        mnames: &[Mechanism::Cdev],
        special_vals: &[],
        subprops: &[],
    },
];

pub struct PmQos {
    sysfs: SysfsIo,
    props: BTreeMap<&'static str, PropDesc>,
    cdev_path: PathBuf,
    /// The latency request stays in force only while this stays open.
    cdev_file: Option<File>,
}

impl PmQos {
    pub fn new() -> PmQos {
        let root = if ROOT_PREFIX.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(&*ROOT_PREFIX)
        };
        Self::with_services(SysfsIo::new(), root.join("dev/cpu_dma_latency"))
    }

    pub fn with_services(sysfs: SysfsIo, cdev_path: PathBuf) -> PmQos {
        let mut props = BTreeMap::new();
        for desc in PROPS {
            props.insert(desc.name, desc.clone());
        }
        PmQos {
            sysfs,
            props,
            cdev_path,
            cdev_file: None,
        }
    }

    fn latency_path(cpu: usize) -> String {
        format!("/sys/devices/system/cpu/cpu{cpu}/power/pm_qos_resume_latency_us")
    }

    fn read_latency(&mut self, cpu: usize) -> Result<PropValue> {
        match self.sysfs.read_int(&Self::latency_path(cpu)) {
            Ok(val) => Ok(PropValue::Int(val)),
            Err(Error::NotFound(_)) => Err(Error::not_supported(format!(
                "the PM QoS resume latency sysfs file does not exist for CPU {cpu}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// The current global DMA latency request, in microseconds. The kernel
    /// reports it as a raw little-endian i32.
    fn read_cdev(&mut self) -> Result<PropValue> {
        let mut file = match File::open(&self.cdev_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_supported(format!(
                    "'{}' does not exist",
                    self.cdev_path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf)?;
        Ok(PropValue::Int(i32::from_le_bytes(buf) as i64))
    }

    fn write_cdev(&mut self, us: i64) -> Result<()> {
        let us = i32::try_from(us)
            .map_err(|_| Error::BadFormat(format!("latency value {us}us is out of range")))?;
        if us < 0 {
            return Err(Error::BadFormat(
                "latency value must be non-negative".to_string(),
            ));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.cdev_path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Error::not_supported(format!("'{}' does not exist", self.cdev_path.display()))
                } else {
                    Error::Io(err)
                }
            })?;
        file.write_all(&us.to_le_bytes())?;
        debug!("global DMA latency limit set to {us}us, holding the request open");
        // Replacing a previous request drops it.
        self.cdev_file = Some(file);
        Ok(())
    }
}

impl Default for PmQos {
    fn default() -> Self {
        Self::new()
    }
}

impl PropsBackend for PmQos {
    fn name(&self) -> &'static str {
        "pmqos"
    }

    fn props(&self) -> &BTreeMap<&'static str, PropDesc> {
        &self.props
    }

    fn props_mut(&mut self) -> &mut BTreeMap<&'static str, PropDesc> {
        &mut self.props
    }

    fn handles(&self, pname: &str, mname: Mechanism) -> bool {
        matches!(
            (pname, mname),
            ("latency_limit", Mechanism::Sysfs) | ("global_latency_limit", Mechanism::Cdev)
        )
    }

    fn read_cpus<'a>(
        &'a mut self,
        pname: &'a str,
        mname: Mechanism,
        cpus: &'a [usize],
    ) -> PvStream<'a> {
        match (pname, mname) {
            ("latency_limit", Mechanism::Sysfs) => Box::new(
                cpus.iter()
                    .map(move |&cpu| self.read_latency(cpu).map(|val| (cpu, val))),
            ),
            ("global_latency_limit", Mechanism::Cdev) => match self.read_cdev() {
                Ok(val) => Box::new(cpus.iter().map(move |&cpu| Ok((cpu, val.clone())))),
                Err(err) => Box::new(std::iter::once(Err(err))),
            },
            _ => Box::new(std::iter::once(Err(Error::Bug(format!(
                "unhandled property '{pname}' via '{mname}'"
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
        let us = val.as_int().ok_or_else(|| {
            Error::Bug(format!("non-integer value '{val}' for '{pname}'"))
        })?;

        match (pname, mname) {
            ("latency_limit", Mechanism::Sysfs) => {
                for &cpu in cpus {
                    let path = Self::latency_path(cpu);
                    if !self.sysfs.exists(&path) {
                        return Err(Error::not_supported(format!(
                            "the PM QoS resume latency sysfs file does not exist for CPU {cpu}"
                        )));
                    }
                    self.sysfs
                        .write_verify(&path, &us.to_string(), 0, Duration::ZERO)?;
                }
                Ok(())
            }
            ("global_latency_limit", Mechanism::Cdev) => self.write_cdev(us),
            _ => Err(Error::Bug(format!(
                "unhandled property '{pname}' via '{mname}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PropsEngine;
    use crate::topology::tests::two_package_topo;
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, PropsEngine<PmQos>) {
        let dir = tempfile::tempdir().unwrap();
        for cpu in 0..8 {
            let power = dir
                .path()
                .join(format!("sys/devices/system/cpu/cpu{cpu}/power"));
            std::fs::create_dir_all(&power).unwrap();
            std::fs::write(power.join("pm_qos_resume_latency_us"), "0\n").unwrap();
        }
        std::fs::create_dir_all(dir.path().join("dev")).unwrap();
        std::fs::write(
            dir.path().join("dev/cpu_dma_latency"),
            2_000_000_000i32.to_le_bytes(),
        )
        .unwrap();

        let topo = Arc::new(two_package_topo());
        let pmqos = PmQos::with_services(
            SysfsIo::with_root(dir.path(), true),
            dir.path().join("dev/cpu_dma_latency"),
        );
        (dir, PropsEngine::new(topo, pmqos).unwrap())
    }

    #[test]
    fn latency_limit_roundtrip() {
        let (_dir, mut engine) = setup();
        let mname = engine
            .set_prop_cpus("latency_limit", "100us", &[0, 1], None)
            .unwrap();
        assert_eq!(mname, Mechanism::Sysfs);

        let infos = engine
            .get_prop_cpus("latency_limit", &[0, 1, 2], None, false)
            .unwrap();
        assert_eq!(infos[0].value, Some(PropValue::Int(100)));
        assert_eq!(infos[1].value, Some(PropValue::Int(100)));
        assert_eq!(infos[2].value, Some(PropValue::Int(0)));
    }

    #[test]
    fn global_limit_needs_all_cpus() {
        let (_dir, mut engine) = setup();
        assert!(engine
            .set_prop_cpus("global_latency_limit", "50", &[0], None)
            .is_err());

        let all: Vec<usize> = (0..8).collect();
        engine
            .set_prop_cpus("global_latency_limit", "50", &all, None)
            .unwrap();
        // The request is held open.
        assert!(engine.backend().cdev_file.is_some());
        assert_eq!(
            engine.get_cpu_prop("global_latency_limit", 0).unwrap(),
            Some(PropValue::Int(50))
        );
    }
}
