// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Saving and restoring property state.
//!
//! `save` walks every writable, supported property of every subsystem at its
//! natural granularity and records (mechanism, value, unit ranges) entries.
//! `restore` replays each entry as a set call. The file is flat TOML: one
//! `[[props]]` table per property, each holding grouped value entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use pwr_utils::error::{Error, Result};
use pwr_utils::{format_cpulist, read_cpulist, Mechanism, OpTarget, PropValue, PropsBackend,
                PropsEngine, Scope};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SaveFile {
    pub props: Vec<SavedProp>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SavedProp {
    pub subsystem: String,
    pub name: String,
    pub entries: Vec<SavedEntry>,
}

/// One (value, units) group. Exactly one of `cpus`, `dies` or `packages` is
/// set, matching the property's granularity. `dies` maps package numbers to
/// die lists.
#[derive(Debug, Serialize, Deserialize)]
pub struct SavedEntry {
    pub value: String,
    pub mechanism: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dies: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<String>,
}

/// Raw (not humanized) value form, so restore can feed it straight back into
/// a set call.
fn raw_value(value: &PropValue) -> String {
    value.to_string()
}

/// Collect the state of every writable, supported property of one
/// subsystem.
pub fn save_subsystem<B: PropsBackend>(
    engine: &mut PropsEngine<B>,
    target: &OpTarget,
    out: &mut SaveFile,
) -> Result<()> {
    let subsystem = engine.backend().name().to_string();

    for pname in engine.prop_names() {
        let desc = engine.backend().props().get(pname).unwrap().clone();
        if !desc.writable {
            continue;
        }
        let sname = engine.get_sname(pname)?;

        let mut entries: Vec<SavedEntry> = Vec::new();
        match sname {
            Scope::Die => {
                let dies = target.dies(false)?;
                let infos = engine.get_prop_dies(pname, &dies, None, true)?;
                let mut groups: BTreeMap<(String, String), BTreeMap<usize, Vec<usize>>> =
                    BTreeMap::new();
                for info in infos {
                    let (Some(value), Some(mname)) = (&info.value, info.mname) else {
                        continue;
                    };
                    groups
                        .entry((raw_value(value), mname.short().to_string()))
                        .or_default()
                        .entry(info.package)
                        .or_default()
                        .push(info.die);
                }
                for ((value, mechanism), packages) in groups {
                    let dies = packages
                        .into_iter()
                        .map(|(pkg, dies)| (pkg.to_string(), format_cpulist(&dies)))
                        .collect();
                    entries.push(SavedEntry {
                        value,
                        mechanism,
                        cpus: None,
                        dies: Some(dies),
                        packages: None,
                    });
                }
            }
            Scope::Package => {
                let packages = target.packages(false)?;
                let infos = engine.get_prop_packages(pname, &packages, None, true)?;
                let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
                for info in infos {
                    let (Some(value), Some(mname)) = (&info.value, info.mname) else {
                        continue;
                    };
                    groups
                        .entry((raw_value(value), mname.short().to_string()))
                        .or_default()
                        .push(info.package);
                }
                for ((value, mechanism), packages) in groups {
                    entries.push(SavedEntry {
                        value,
                        mechanism,
                        cpus: None,
                        dies: None,
                        packages: Some(format_cpulist(&packages)),
                    });
                }
            }
            _ => {
                let infos = engine.get_prop_cpus(pname, &target.cpus()?, None, true)?;
                let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
                for info in infos {
                    let (Some(value), Some(mname)) = (&info.value, info.mname) else {
                        continue;
                    };
                    groups
                        .entry((raw_value(value), mname.short().to_string()))
                        .or_default()
                        .push(info.cpu);
                }
                for ((value, mechanism), cpus) in groups {
                    entries.push(SavedEntry {
                        value,
                        mechanism,
                        cpus: Some(format_cpulist(&cpus)),
                        dies: None,
                        packages: None,
                    });
                }
            }
        }

        if !entries.is_empty() {
            out.props.push(SavedProp {
                subsystem: subsystem.clone(),
                name: pname.to_string(),
                entries,
            });
        }
    }
    Ok(())
}

/// Replay the entries of one subsystem from a save file.
pub fn restore_subsystem<B: PropsBackend>(
    engine: &mut PropsEngine<B>,
    save: &SaveFile,
) -> Result<usize> {
    let subsystem = engine.backend().name();
    let mut count = 0;

    for prop in save.props.iter().filter(|p| p.subsystem == subsystem) {
        for entry in &prop.entries {
            let mname: Mechanism = entry.mechanism.parse()?;
            let mnames = [mname];

            if let Some(cpus) = &entry.cpus {
                let cpus = read_cpulist(cpus)?;
                engine.set_prop_cpus(&prop.name, &entry.value, &cpus, Some(&mnames))?;
            } else if let Some(dies) = &entry.dies {
                let mut map: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                for (pkg, dies) in dies {
                    let pkg: usize = pkg.parse().map_err(|_| {
                        Error::BadFormat(format!("bad package number '{pkg}' in the save file"))
                    })?;
                    map.insert(pkg, read_cpulist(dies)?);
                }
                engine.set_prop_dies(&prop.name, &entry.value, &map, Some(&mnames))?;
            } else if let Some(packages) = &entry.packages {
                let packages = read_cpulist(packages)?;
                engine.set_prop_packages(&prop.name, &entry.value, &packages, Some(&mnames))?;
            } else {
                return Err(Error::BadFormat(format!(
                    "property '{}' in the save file has no CPU, die or package list",
                    prop.name
                )));
            }
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pwr_utils::topology::TopoEntry;
    use pwr_utils::{CpuKind, OpTargetBuilder, PmQos, PropsEngine, SysfsIo, Topology};

    /// One package, 2 CPUs, with the per-CPU PM QoS latency knob.
    fn fake_host() -> (tempfile::TempDir, Arc<Topology>) {
        let dir = tempfile::tempdir().unwrap();
        for cpu in 0..2 {
            let power = dir
                .path()
                .join(format!("sys/devices/system/cpu/cpu{cpu}/power"));
            std::fs::create_dir_all(&power).unwrap();
            std::fs::write(power.join("pm_qos_resume_latency_us"), "100\n").unwrap();
        }
        std::fs::create_dir_all(dir.path().join("dev")).unwrap();
        std::fs::write(dir.path().join("dev/cpu_dma_latency"), 0i32.to_le_bytes()).unwrap();

        let entries = (0..2)
            .map(|cpu| TopoEntry {
                cpu,
                core: cpu,
                module: cpu,
                die: 0,
                package: 0,
                kind: CpuKind::Unknown,
            })
            .collect();
        let topo = Topology::from_entries(entries, vec![], Default::default()).unwrap();
        (dir, Arc::new(topo))
    }

    fn engine(
        dir: &tempfile::TempDir,
        topo: &Arc<Topology>,
    ) -> PropsEngine<PmQos> {
        let pmqos = PmQos::with_services(
            SysfsIo::with_root(dir.path(), true),
            dir.path().join("dev/cpu_dma_latency"),
        );
        PropsEngine::new(Arc::clone(topo), pmqos).unwrap()
    }

    #[test]
    fn save_restore_through_file() {
        let (dir, topo) = fake_host();
        let target = OpTargetBuilder::new(Arc::clone(&topo)).build().unwrap();

        let mut save = SaveFile::default();
        save_subsystem(&mut engine(&dir, &topo), &target, &mut save).unwrap();
        let saved = save
            .props
            .iter()
            .find(|p| p.name == "latency_limit")
            .expect("latency_limit should be saved");
        assert_eq!(saved.entries[0].value, "100");
        assert_eq!(saved.entries[0].cpus.as_deref(), Some("0-1"));

        // Round-trip the file, change the live state, then restore.
        let path = dir.path().join("state.toml");
        std::fs::write(&path, toml::to_string_pretty(&save).unwrap()).unwrap();
        let knob = dir
            .path()
            .join("sys/devices/system/cpu/cpu1/power/pm_qos_resume_latency_us");
        std::fs::write(&knob, "250\n").unwrap();

        let parsed: SaveFile = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let count = restore_subsystem(&mut engine(&dir, &topo), &parsed).unwrap();
        assert!(count >= 1);
        assert_eq!(std::fs::read_to_string(&knob).unwrap(), "100");
    }

    #[test]
    fn save_file_toml_roundtrip() {
        let save = SaveFile {
            props: vec![SavedProp {
                subsystem: "pstates".to_string(),
                name: "max_freq".to_string(),
                entries: vec![SavedEntry {
                    value: "2400000000".to_string(),
                    mechanism: "sysfs".to_string(),
                    cpus: Some("0-7".to_string()),
                    dies: None,
                    packages: None,
                }],
            }],
        };

        let text = toml::to_string_pretty(&save).unwrap();
        let parsed: SaveFile = toml::from_str(&text).unwrap();
        assert_eq!(parsed.props.len(), 1);
        assert_eq!(parsed.props[0].name, "max_freq");
        assert_eq!(parsed.props[0].entries[0].cpus.as_deref(), Some("0-7"));
        assert!(parsed.props[0].entries[0].dies.is_none());
    }
}
