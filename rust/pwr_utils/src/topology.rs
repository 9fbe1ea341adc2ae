// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host CPU topology model.
//!
//! The hierarchy is CPU ⊂ core ⊂ module ⊂ die ⊂ package. Core and die
//! numbers are package-relative (the same core number typically exists in
//! every package), module numbers are globally unique, CPU and package
//! numbers are global. Dies come in two flavors: compute dies, which have
//! CPUs, and non-compute (I/O) dies, which have none and are only reachable
//! through die-granularity knobs such as uncore frequency.
//!
//! A `Topology` is built once by scanning sysfs and is read-only afterwards.
//! If the host topology changes (CPU hotplug), build a new one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use glob::glob;
use sscanf::sscanf;

use crate::cpumask::{format_cpulist, read_cpulist, Cpumask};
use crate::error::{Error, Result};
use crate::ROOT_PREFIX;

const CPU_SYSFS: &str = "sys/devices/system/cpu";

/// Hybrid CPU classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuKind {
    Unknown,
    Performance,
    Efficiency,
}

/// One online logical CPU and its position in the hierarchy.
#[derive(Debug, Clone)]
pub struct TopoEntry {
    pub cpu: usize,
    /// Package-relative core number.
    pub core: usize,
    /// Globally unique module number.
    pub module: usize,
    /// Package-relative die number.
    pub die: usize,
    pub package: usize,
    pub kind: CpuKind,
}

#[derive(Debug)]
pub struct Topology {
    /// Online CPUs, ascending by CPU number.
    entries: Vec<TopoEntry>,
    offline: Vec<usize>,
    /// Package number -> non-compute die numbers.
    io_dies: BTreeMap<usize, BTreeSet<usize>>,
    hybrid: bool,
}

fn read_trimmed(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(val) => Ok(val.trim().trim_end_matches('\0').to_string()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::NotFound(format!("'{}'", path.display())))
        }
        Err(err) => Err(err.into()),
    }
}

fn read_id(path: &Path) -> Result<isize> {
    let val = read_trimmed(path)?;
    val.parse::<isize>()
        .map_err(|_| Error::BadFormat(format!("failed to parse '{val}' from '{}'", path.display())))
}

impl Topology {
    /// Build the host topology by scanning sysfs.
    pub fn new() -> Result<Topology> {
        if ROOT_PREFIX.is_empty() {
            Self::scan("/")
        } else {
            Self::scan(&*ROOT_PREFIX)
        }
    }

    /// Same as [`Topology::new`], but with an explicit filesystem root, so
    /// tests can point it at a fake sysfs tree.
    pub fn scan<P: AsRef<Path>>(root: P) -> Result<Topology> {
        let root = root.as_ref();
        let cpu_root = root.join(CPU_SYSFS);

        let online_str = read_trimmed(&cpu_root.join("online"))?;
        let online: BTreeSet<usize> = read_cpulist(&online_str)?.into_iter().collect();

        let pcore_mask = Self::read_kind_mask(&root.join("sys/devices/cpu_core/cpus"))?;
        let ecore_mask = Self::read_kind_mask(&root.join("sys/devices/cpu_atom/cpus"))?;
        let hybrid = pcore_mask.is_some() && ecore_mask.is_some();

        let mut entries = Vec::new();
        let mut offline = Vec::new();

        let pattern = cpu_root.join("cpu[0-9]*");
        for cpu_path in glob(&pattern.to_string_lossy())?.filter_map(std::result::Result::ok) {
            let cpu_str = cpu_path.to_string_lossy();
            let cpu = match sscanf!(
                cpu_str.rsplit('/').next().unwrap_or_default(),
                "cpu{usize}"
            ) {
                Ok(cpu) => cpu,
                Err(_) => continue,
            };

            if !online.contains(&cpu) {
                offline.push(cpu);
                continue;
            }

            let topo = cpu_path.join("topology");
            let package = read_id(&topo.join("physical_package_id"))? as usize;
            let core = read_id(&topo.join("core_id"))? as usize;
            let die = match read_id(&topo.join("die_id")) {
                Ok(die) => die as usize,
                Err(Error::NotFound(_)) => 0,
                Err(err) => return Err(err),
            };
            // cluster_id is the kernel's name for what this tool calls a
            // module. Not all platforms have it, and some report -1.
            let module = match read_id(&topo.join("cluster_id")) {
                Ok(id) if id >= 0 => Some(id as usize),
                Ok(_) => None,
                Err(Error::NotFound(_)) => None,
                Err(err) => return Err(err),
            };

            let kind = if let Some(mask) = &pcore_mask {
                if mask.test_cpu(cpu) {
                    CpuKind::Performance
                } else if ecore_mask.as_ref().is_some_and(|m| m.test_cpu(cpu)) {
                    CpuKind::Efficiency
                } else {
                    CpuKind::Unknown
                }
            } else {
                CpuKind::Unknown
            };

            entries.push((
                module,
                TopoEntry {
                    cpu,
                    core,
                    module: 0,
                    die,
                    package,
                    kind,
                },
            ));
        }

        entries.sort_by_key(|(_, e)| e.cpu);
        offline.sort_unstable();

        // Platforms without cluster_id get one synthesized module per core,
        // numbered in CPU discovery order.
        let mut next_module = 0;
        let mut core2module: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        let mut resolved = Vec::with_capacity(entries.len());
        for (module, mut entry) in entries {
            entry.module = match module {
                Some(module) => module,
                None => *core2module
                    .entry((entry.package, entry.core))
                    .or_insert_with(|| {
                        let m = next_module;
                        next_module += 1;
                        m
                    }),
            };
            resolved.push(entry);
        }

        let io_dies = Self::scan_io_dies(&cpu_root, &resolved)?;
        Self::from_entries(resolved, offline, io_dies)
    }

    fn read_kind_mask(path: &Path) -> Result<Option<Cpumask>> {
        match read_trimmed(path) {
            Ok(list) => Ok(Some(Cpumask::from_cpulist(&list)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Non-compute dies have no CPUs, so the only sysfs evidence of their
    /// existence is the uncore frequency directory layout.
    fn scan_io_dies(
        cpu_root: &Path,
        entries: &[TopoEntry],
    ) -> Result<BTreeMap<usize, BTreeSet<usize>>> {
        let mut io_dies: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();

        let pattern = cpu_root.join("intel_uncore_frequency/package_*_die_*");
        for dir in glob(&pattern.to_string_lossy())?.filter_map(std::result::Result::ok) {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (package, die) = match sscanf!(name, "package_{usize}_die_{usize}") {
                Ok(ids) => ids,
                Err(_) => continue,
            };

            let has_cpus = entries
                .iter()
                .any(|e| e.package == package && e.die == die);
            if !has_cpus {
                io_dies.entry(package).or_default().insert(die);
            }
        }

        Ok(io_dies)
    }

    /// Build a topology from explicit rows. Used by unit tests and
    /// emulation; `Topology::new()` ends up here too.
    pub fn from_entries(
        entries: Vec<TopoEntry>,
        offline: Vec<usize>,
        io_dies: BTreeMap<usize, BTreeSet<usize>>,
    ) -> Result<Topology> {
        let mut seen = BTreeSet::new();
        for entry in &entries {
            if !seen.insert(entry.cpu) {
                return Err(Error::Bug(format!("duplicate CPU {}", entry.cpu)));
            }
        }
        for cpu in &offline {
            if seen.contains(cpu) {
                return Err(Error::Bug(format!("CPU {cpu} is both online and offline")));
            }
        }

        let mut entries = entries;
        entries.sort_by_key(|e| e.cpu);
        let hybrid = entries.iter().any(|e| e.kind != CpuKind::Unknown);

        Ok(Topology {
            entries,
            offline,
            io_dies,
            hybrid,
        })
    }

    /// Online CPU numbers, ascending.
    pub fn cpus(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.cpu).collect()
    }

    pub fn offline_cpus(&self) -> &[usize] {
        &self.offline
    }

    pub fn nr_cpus(&self) -> usize {
        self.entries.len()
    }

    pub fn is_hybrid(&self) -> bool {
        self.hybrid
    }

    pub fn packages(&self) -> Vec<usize> {
        let mut pkgs: Vec<usize> = self.entries.iter().map(|e| e.package).collect();
        pkgs.sort_unstable();
        pkgs.dedup();
        pkgs
    }

    pub fn modules(&self) -> Vec<usize> {
        let mut mods: Vec<usize> = self.entries.iter().map(|e| e.module).collect();
        mods.sort_unstable();
        mods.dedup();
        mods
    }

    fn entry(&self, cpu: usize) -> Result<&TopoEntry> {
        self.entries
            .iter()
            .find(|e| e.cpu == cpu)
            .ok_or_else(|| self.bad_cpu_error(cpu))
    }

    fn bad_cpu_error(&self, cpu: usize) -> Error {
        if self.offline.contains(&cpu) {
            Error::Other(format!("CPU {cpu} is offline"))
        } else {
            Error::Other(format!(
                "CPU {cpu} is not available, online CPUs are: {}",
                format_cpulist(&self.cpus())
            ))
        }
    }

    pub fn cpu_to_package(&self, cpu: usize) -> Result<usize> {
        Ok(self.entry(cpu)?.package)
    }

    /// Package-relative die number of `cpu`, paired with its package.
    pub fn cpu_to_die(&self, cpu: usize) -> Result<(usize, usize)> {
        let entry = self.entry(cpu)?;
        Ok((entry.package, entry.die))
    }

    pub fn cpu_to_module(&self, cpu: usize) -> Result<usize> {
        Ok(self.entry(cpu)?.module)
    }

    /// Package-relative core number of `cpu`, paired with its package.
    pub fn cpu_to_core(&self, cpu: usize) -> Result<(usize, usize)> {
        let entry = self.entry(cpu)?;
        Ok((entry.package, entry.core))
    }

    pub fn cpu_kind(&self, cpu: usize) -> Result<CpuKind> {
        Ok(self.entry(cpu)?.kind)
    }

    pub fn package_to_cpus(&self, package: usize) -> Result<Vec<usize>> {
        self.validate_package(package)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.package == package)
            .map(|e| e.cpu)
            .collect())
    }

    pub fn package_to_cores(&self, package: usize) -> Result<Vec<usize>> {
        self.validate_package(package)?;
        let mut cores: Vec<usize> = self
            .entries
            .iter()
            .filter(|e| e.package == package)
            .map(|e| e.core)
            .collect();
        cores.sort_unstable();
        cores.dedup();
        Ok(cores)
    }

    /// Die numbers of `package`. Compute and/or non-compute dies are
    /// included according to the flags.
    pub fn package_to_dies(
        &self,
        package: usize,
        compute_dies: bool,
        io_dies: bool,
    ) -> Result<Vec<usize>> {
        self.validate_package(package)?;
        let mut dies = BTreeSet::new();
        if compute_dies {
            for entry in self.entries.iter().filter(|e| e.package == package) {
                dies.insert(entry.die);
            }
        }
        if io_dies {
            if let Some(pkg_io_dies) = self.io_dies.get(&package) {
                dies.extend(pkg_io_dies.iter().copied());
            }
        }
        Ok(dies.into_iter().collect())
    }

    pub fn is_io_die(&self, package: usize, die: usize) -> bool {
        self.io_dies
            .get(&package)
            .is_some_and(|dies| dies.contains(&die))
    }

    pub fn packages_to_cpus(&self, packages: &[usize]) -> Result<Vec<usize>> {
        let packages = self.normalize_packages(packages)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| packages.contains(&e.package))
            .map(|e| e.cpu)
            .collect())
    }

    /// CPUs of package-relative cores `cores` within `packages`.
    pub fn cores_to_cpus(&self, cores: &[usize], packages: &[usize]) -> Result<Vec<usize>> {
        let packages = self.normalize_packages(packages)?;
        let mut cpus = Vec::new();
        for &package in &packages {
            let cores = self.normalize_cores(cores, package)?;
            cpus.extend(
                self.entries
                    .iter()
                    .filter(|e| e.package == package && cores.contains(&e.core))
                    .map(|e| e.cpu),
            );
        }
        cpus.sort_unstable();
        Ok(cpus)
    }

    pub fn modules_to_cpus(&self, modules: &[usize]) -> Result<Vec<usize>> {
        let modules = self.normalize_modules(modules)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| modules.contains(&e.module))
            .map(|e| e.cpu)
            .collect())
    }

    /// CPUs of package-relative dies `dies` within `packages`. Non-compute
    /// dies contribute no CPUs.
    pub fn dies_to_cpus(&self, dies: &[usize], packages: &[usize]) -> Result<Vec<usize>> {
        let packages = self.normalize_packages(packages)?;
        let mut cpus = Vec::new();
        for &package in &packages {
            let dies = self.normalize_dies(dies, package)?;
            cpus.extend(
                self.entries
                    .iter()
                    .filter(|e| e.package == package && dies.contains(&e.die))
                    .map(|e| e.cpu),
            );
        }
        cpus.sort_unstable();
        Ok(cpus)
    }

    fn validate_package(&self, package: usize) -> Result<()> {
        if self.entries.iter().any(|e| e.package == package) {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "package {package} is not available, available packages are: {}",
                format_cpulist(&self.packages())
            )))
        }
    }

    /// Validate and dedup CPU numbers, preserving input order.
    pub fn normalize_cpus(&self, cpus: &[usize], offline_ok: bool) -> Result<Vec<usize>> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for &cpu in cpus {
            if !seen.insert(cpu) {
                continue;
            }
            if self.entries.iter().any(|e| e.cpu == cpu) {
                result.push(cpu);
            } else if offline_ok && self.offline.contains(&cpu) {
                result.push(cpu);
            } else {
                return Err(self.bad_cpu_error(cpu));
            }
        }
        Ok(result)
    }

    pub fn normalize_packages(&self, packages: &[usize]) -> Result<Vec<usize>> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for &package in packages {
            if !seen.insert(package) {
                continue;
            }
            self.validate_package(package)?;
            result.push(package);
        }
        Ok(result)
    }

    pub fn normalize_cores(&self, cores: &[usize], package: usize) -> Result<Vec<usize>> {
        let valid = self.package_to_cores(package)?;
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for &core in cores {
            if !seen.insert(core) {
                continue;
            }
            if !valid.contains(&core) {
                return Err(Error::Other(format!(
                    "core {core} is not available in package {package}, available cores are: {}",
                    format_cpulist(&valid)
                )));
            }
            result.push(core);
        }
        Ok(result)
    }

    pub fn normalize_dies(&self, dies: &[usize], package: usize) -> Result<Vec<usize>> {
        let valid = self.package_to_dies(package, true, true)?;
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for &die in dies {
            if !seen.insert(die) {
                continue;
            }
            if !valid.contains(&die) {
                return Err(Error::Other(format!(
                    "die {die} is not available in package {package}, available dies are: {}",
                    format_cpulist(&valid)
                )));
            }
            result.push(die);
        }
        Ok(result)
    }

    pub fn normalize_modules(&self, modules: &[usize]) -> Result<Vec<usize>> {
        let valid = self.modules();
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for &module in modules {
            if !seen.insert(module) {
                continue;
            }
            if !valid.contains(&module) {
                return Err(Error::Other(format!(
                    "module {module} is not available, available modules are: {}",
                    format_cpulist(&valid)
                )));
            }
            result.push(module);
        }
        Ok(result)
    }

    /// Which packages contain core number `core`? Used for resolving
    /// package-relative numbers given without a package.
    pub fn core_to_packages(&self, core: usize) -> Vec<usize> {
        let mut pkgs: Vec<usize> = self
            .entries
            .iter()
            .filter(|e| e.core == core)
            .map(|e| e.package)
            .collect();
        pkgs.sort_unstable();
        pkgs.dedup();
        pkgs
    }

    /// Which packages contain die number `die` (compute or non-compute)?
    pub fn die_to_packages(&self, die: usize) -> Vec<usize> {
        let mut pkgs: Vec<usize> = self
            .entries
            .iter()
            .filter(|e| e.die == die)
            .map(|e| e.package)
            .collect();
        for (&package, dies) in &self.io_dies {
            if dies.contains(&die) {
                pkgs.push(package);
            }
        }
        pkgs.sort_unstable();
        pkgs.dedup();
        pkgs
    }

    /// Check which CPU numbers in `cpus` cover entire cores. Returns the
    /// covered cores as a package -> core numbers map, plus the remainder
    /// CPUs in input order.
    pub fn cpus_div_cores(
        &self,
        cpus: &[usize],
    ) -> Result<(BTreeMap<usize, Vec<usize>>, Vec<usize>)> {
        let cpus = self.normalize_cpus(cpus, true)?;
        let mut cpus_set: BTreeSet<usize> = cpus.iter().copied().collect();
        let mut cores: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for package in self.packages() {
            for core in self.package_to_cores(package)? {
                let siblings: BTreeSet<usize> = self
                    .cores_to_cpus(&[core], &[package])?
                    .into_iter()
                    .collect();
                if siblings.is_subset(&cpus_set) {
                    cores.entry(package).or_default().push(core);
                    for cpu in &siblings {
                        cpus_set.remove(cpu);
                    }
                }
            }
        }

        let rem: Vec<usize> = cpus.into_iter().filter(|c| cpus_set.contains(c)).collect();
        Ok((cores, rem))
    }

    /// Like [`Topology::cpus_div_cores`], but for dies. Non-compute dies are
    /// skipped, they have no CPUs.
    pub fn cpus_div_dies(
        &self,
        cpus: &[usize],
    ) -> Result<(BTreeMap<usize, Vec<usize>>, Vec<usize>)> {
        let cpus = self.normalize_cpus(cpus, true)?;
        let mut cpus_set: BTreeSet<usize> = cpus.iter().copied().collect();
        let mut dies: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for package in self.packages() {
            for die in self.package_to_dies(package, true, false)? {
                let siblings: BTreeSet<usize> = self
                    .dies_to_cpus(&[die], &[package])?
                    .into_iter()
                    .collect();
                if siblings.is_subset(&cpus_set) {
                    dies.entry(package).or_default().push(die);
                    for cpu in &siblings {
                        cpus_set.remove(cpu);
                    }
                }
            }
        }

        let rem: Vec<usize> = cpus.into_iter().filter(|c| cpus_set.contains(c)).collect();
        Ok((dies, rem))
    }

    /// Check which CPU numbers in `cpus` cover entire packages. Returns the
    /// covered packages plus the remainder CPUs in input order.
    pub fn cpus_div_packages(&self, cpus: &[usize]) -> Result<(Vec<usize>, Vec<usize>)> {
        let cpus = self.normalize_cpus(cpus, true)?;
        let mut cpus_set: BTreeSet<usize> = cpus.iter().copied().collect();
        let mut packages = Vec::new();

        for package in self.packages() {
            let pkg_cpus: BTreeSet<usize> =
                self.package_to_cpus(package)?.into_iter().collect();
            if pkg_cpus.is_subset(&cpus_set) {
                packages.push(package);
                for cpu in &pkg_cpus {
                    cpus_set.remove(cpu);
                }
            }
        }

        let rem: Vec<usize> = cpus.into_iter().filter(|c| cpus_set.contains(c)).collect();
        Ok((packages, rem))
    }

    /// Select core siblings with the given indices from `cpus`. The index of
    /// a CPU is its position among the CPUs of its core: with cores
    /// {0: [0, 4], 1: [1, 5]}, CPUs 0 and 1 have index 0, CPUs 4 and 5 have
    /// index 1. The result is always a subset of `cpus`, in `cpus` order.
    pub fn select_core_siblings(&self, cpus: &[usize], indexes: &[usize]) -> Result<Vec<usize>> {
        let cpus = self.normalize_cpus(cpus, true)?;
        self.select_siblings(&cpus, indexes, |e| (e.package, e.core))
    }

    /// Same as [`Topology::select_core_siblings`], but for modules.
    pub fn select_module_siblings(&self, cpus: &[usize], indexes: &[usize]) -> Result<Vec<usize>> {
        let cpus = self.normalize_cpus(cpus, true)?;
        self.select_siblings(&cpus, indexes, |e| (e.package, e.module))
    }

    fn select_siblings<K: Ord + Copy>(
        &self,
        cpus: &[usize],
        indexes: &[usize],
        group: impl Fn(&TopoEntry) -> K,
    ) -> Result<Vec<usize>> {
        let mut sorted: Vec<&TopoEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| (group(e), e.cpu));

        let mut cpu2index = BTreeMap::new();
        let mut prev: Option<K> = None;
        let mut index = 0;
        for entry in sorted {
            let key = group(entry);
            if prev != Some(key) {
                prev = Some(key);
                index = 0;
            }
            cpu2index.insert(entry.cpu, index);
            index += 1;
        }

        let indexes: BTreeSet<usize> = indexes.iter().copied().collect();
        Ok(cpus
            .iter()
            .filter(|cpu| cpu2index.get(cpu).is_some_and(|i| indexes.contains(i)))
            .copied()
            .collect())
    }
}
