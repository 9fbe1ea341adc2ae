// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Rendering of property read results.
//!
//! Values are grouped: units (CPUs, dies, packages) that share a value are
//! reported on one line with a rangified unit list, the way the numbers are
//! easiest to eyeball on big machines.

use std::collections::BTreeMap;

use pwr_utils::access::{CpuPropInfo, DiePropInfo, PkgPropInfo};
use pwr_utils::error::{Error, Result};
use pwr_utils::human::format_freq;
use pwr_utils::{format_cpulist, Mechanism, OpTarget, PropDesc, PropValue, PropsBackend,
                PropsEngine, Scope};

/// Render one value in its natural form: frequencies humanized, booleans as
/// on/off, everything else as-is.
fn format_value(desc: &PropDesc, value: &PropValue) -> String {
    match (desc.unit, value) {
        (Some("Hz"), PropValue::Int(hz)) => format_freq(*hz),
        (Some(unit), PropValue::Int(n)) => format!("{n}{unit}"),
        _ => value.to_string(),
    }
}

fn mech_suffix(mname: Option<Mechanism>) -> String {
    match mname {
        Some(mname) => format!(" ({mname})"),
        None => String::new(),
    }
}

fn print_cpu_infos(desc: &PropDesc, infos: &[CpuPropInfo], skip_unsupported: bool) {
    // Group CPUs by (value, mechanism).
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for info in infos {
        let key = match &info.value {
            Some(value) => format!("{}{}", format_value(desc, value), mech_suffix(info.mname)),
            None => String::new(),
        };
        groups.entry(key).or_default().push(info.cpu);
    }

    for (key, cpus) in groups {
        if key.is_empty() {
            if !skip_unsupported {
                println!(
                    "{}: not supported for CPUs {}",
                    desc.label,
                    format_cpulist(&cpus)
                );
            }
            continue;
        }
        println!("{}: {key} for CPUs {}", desc.label, format_cpulist(&cpus));
    }
}

fn print_die_infos(desc: &PropDesc, infos: &[DiePropInfo], skip_unsupported: bool) {
    let mut groups: BTreeMap<String, BTreeMap<usize, Vec<usize>>> = BTreeMap::new();
    for info in infos {
        let key = match &info.value {
            Some(value) => format!("{}{}", format_value(desc, value), mech_suffix(info.mname)),
            None => String::new(),
        };
        groups
            .entry(key)
            .or_default()
            .entry(info.package)
            .or_default()
            .push(info.die);
    }

    for (key, packages) in groups {
        let dies_str = packages
            .iter()
            .map(|(pkg, dies)| format!("package {pkg} dies {}", format_cpulist(dies)))
            .collect::<Vec<_>>()
            .join(", ");
        if key.is_empty() {
            if !skip_unsupported {
                println!("{}: not supported for {dies_str}", desc.label);
            }
            continue;
        }
        println!("{}: {key} for {dies_str}", desc.label);
    }
}

fn print_pkg_infos(desc: &PropDesc, infos: &[PkgPropInfo], skip_unsupported: bool) {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for info in infos {
        let key = match &info.value {
            Some(value) => format!("{}{}", format_value(desc, value), mech_suffix(info.mname)),
            None => String::new(),
        };
        groups.entry(key).or_default().push(info.package);
    }

    for (key, packages) in groups {
        if key.is_empty() {
            if !skip_unsupported {
                println!(
                    "{}: not supported for packages {}",
                    desc.label,
                    format_cpulist(&packages)
                );
            }
            continue;
        }
        println!(
            "{}: {key} for packages {}",
            desc.label,
            format_cpulist(&packages)
        );
    }
}

/// Read and print one property at its natural granularity. A `UsePerCpu`
/// from a die/package read triggers exactly one retry at CPU granularity.
pub fn print_prop<B: PropsBackend>(
    engine: &mut PropsEngine<B>,
    target: &OpTarget,
    pname: &str,
    mnames: Option<&[Mechanism]>,
    skip_unsupported: bool,
) -> Result<()> {
    let desc = match engine.backend().props().get(pname) {
        Some(desc) => desc.clone(),
        None => {
            return Err(Error::Other(format!(
                "unknown property '{pname}', known properties are: {}",
                engine.prop_names().join(", ")
            )));
        }
    };
    let sname = engine.get_sname(pname)?;

    match sname {
        Scope::Die => {
            let dies = target.dies(false)?;
            match engine.get_prop_dies(pname, &dies, mnames, true) {
                Ok(infos) => print_die_infos(&desc, &infos, skip_unsupported),
                Err(err @ Error::UsePerCpu { .. }) => {
                    log::debug!("{err}, retrying per CPU");
                    let infos = engine.get_prop_cpus(pname, &target.cpus()?, mnames, true)?;
                    print_cpu_infos(&desc, &infos, skip_unsupported);
                }
                Err(err) => return Err(err),
            }
        }
        Scope::Package => {
            let packages = target.packages(false)?;
            match engine.get_prop_packages(pname, &packages, mnames, true) {
                Ok(infos) => print_pkg_infos(&desc, &infos, skip_unsupported),
                Err(err @ Error::UsePerCpu { .. }) => {
                    log::debug!("{err}, retrying per CPU");
                    let infos = engine.get_prop_cpus(pname, &target.cpus()?, mnames, true)?;
                    print_cpu_infos(&desc, &infos, skip_unsupported);
                }
                Err(err) => return Err(err),
            }
        }
        _ => {
            let infos = engine.get_prop_cpus(pname, &target.cpus()?, mnames, true)?;
            print_cpu_infos(&desc, &infos, skip_unsupported);
        }
    }
    Ok(())
}

/// Report the outcome of a set operation.
pub fn print_set_result(label: &str, val: &str, mname: Mechanism, units: &str) {
    println!("{label}: set to '{val}' for {units} ({mname})");
}
