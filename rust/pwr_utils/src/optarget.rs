// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Operation target resolution.
//!
//! An [`OpTarget`] captures the user's topology selection — any mix of CPU,
//! core, module, die and package numbers plus core/module sibling index
//! filters — and resolves it into concrete CPU, die and package sets.
//!
//! Core and die numbers are package-relative. When they are given without a
//! package and the same number exists in more than one package, resolution
//! fails with an ambiguity error rather than guessing. Selecting CPUs that
//! happen to cover a whole package does not by itself make that package
//! "targeted": per-package targeting comes from explicit selectors, or from
//! the whole-coverage membership check in [`OpTarget::dies`] and
//! [`OpTarget::packages`].
//!
//! The resolved sets are memoized: selectors are immutable after
//! construction, and repeated derivation is expensive and must be consistent
//! within one invocation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cpumask::{format_cpulist, read_cpulist};
use crate::error::{Error, Result};
use crate::topology::Topology;

/// A single-level selection: everything, or an explicit list of numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Nums(Vec<usize>),
}

impl Selector {
    /// Parse "all" or a cpulist-style string ("0-2,5").
    pub fn parse(s: &str) -> Result<Selector> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(Selector::All)
        } else {
            Ok(Selector::Nums(read_cpulist(s)?))
        }
    }
}

/// Selection of package-relative numbers (cores, dies): everything, bare
/// numbers resolved against packages later, or an explicit per-package map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSelector {
    All,
    Nums(Vec<usize>),
    PerPackage(BTreeMap<usize, Vec<usize>>),
}

impl GroupSelector {
    pub fn parse(s: &str) -> Result<GroupSelector> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(GroupSelector::All)
        } else {
            Ok(GroupSelector::Nums(read_cpulist(s)?))
        }
    }
}

pub struct OpTargetBuilder {
    topo: Arc<Topology>,
    cpus: Option<Selector>,
    cores: Option<GroupSelector>,
    modules: Option<Selector>,
    dies: Option<GroupSelector>,
    packages: Option<Selector>,
    core_sib_index: Vec<usize>,
    module_sib_index: Vec<usize>,
    default_all: bool,
}

impl OpTargetBuilder {
    pub fn new(topo: Arc<Topology>) -> OpTargetBuilder {
        OpTargetBuilder {
            topo,
            cpus: None,
            cores: None,
            modules: None,
            dies: None,
            packages: None,
            core_sib_index: Vec::new(),
            module_sib_index: Vec::new(),
            default_all: true,
        }
    }

    pub fn cpus(mut self, sel: Selector) -> Self {
        self.cpus = Some(sel);
        self
    }

    pub fn cores(mut self, sel: GroupSelector) -> Self {
        self.cores = Some(sel);
        self
    }

    pub fn modules(mut self, sel: Selector) -> Self {
        self.modules = Some(sel);
        self
    }

    pub fn dies(mut self, sel: GroupSelector) -> Self {
        self.dies = Some(sel);
        self
    }

    pub fn packages(mut self, sel: Selector) -> Self {
        self.packages = Some(sel);
        self
    }

    pub fn core_siblings(mut self, indexes: Vec<usize>) -> Self {
        self.core_sib_index = indexes;
        self
    }

    pub fn module_siblings(mut self, indexes: Vec<usize>) -> Self {
        self.module_sib_index = indexes;
        self
    }

    /// Whether an empty selection defaults to "all CPUs, all dies, all
    /// packages" (the CLI behavior) or fails with `NoTarget`.
    pub fn default_all(mut self, default_all: bool) -> Self {
        self.default_all = default_all;
        self
    }

    pub fn build(self) -> Result<OpTarget> {
        let topo = self.topo;

        let specified = self.cpus.is_some()
            || self.cores.is_some()
            || self.modules.is_some()
            || self.dies.is_some()
            || self.packages.is_some()
            || !self.core_sib_index.is_empty()
            || !self.module_sib_index.is_empty();

        // Core/die numbers may be package-relative, so requesting all cores
        // or all dies without naming packages silently selects all packages
        // too.
        let mut packages_sel = self.packages.clone();
        if packages_sel.is_none()
            && (self.cores == Some(GroupSelector::All) || self.dies == Some(GroupSelector::All))
        {
            packages_sel = Some(Selector::All);
        }

        let packages = match &packages_sel {
            None => None,
            Some(Selector::All) => Some(topo.packages()),
            Some(Selector::Nums(nums)) => Some(topo.normalize_packages(nums)?),
        };

        let cores = match self.cores {
            None => None,
            Some(sel) => Some(Self::resolve_group(
                &topo,
                sel,
                packages.as_deref(),
                "core",
                |topo, pkg| topo.package_to_cores(pkg),
                |topo, num| topo.core_to_packages(num),
            )?),
        };

        let dies = match self.dies {
            None => None,
            Some(sel) => Some(Self::resolve_group(
                &topo,
                sel,
                packages.as_deref(),
                "die",
                |topo, pkg| topo.package_to_dies(pkg, true, true),
                |topo, num| topo.die_to_packages(num),
            )?),
        };

        let modules = match self.modules {
            None => None,
            Some(Selector::All) => Some(topo.modules()),
            Some(Selector::Nums(nums)) => Some(topo.normalize_modules(&nums)?),
        };

        let cpus = match self.cpus {
            None => None,
            Some(Selector::All) => Some(topo.cpus()),
            Some(Selector::Nums(nums)) => Some(topo.normalize_cpus(&nums, false)?),
        };

        Ok(OpTarget {
            topo,
            cpus,
            cores,
            modules,
            dies,
            packages,
            core_sib_index: self.core_sib_index,
            module_sib_index: self.module_sib_index,
            specified,
            default_all: self.default_all,
            cpus_cache: RefCell::new(None),
            dies_cache: RefCell::new(BTreeMap::new()),
            packages_cache: RefCell::new(BTreeMap::new()),
        })
    }

    /// Resolve a core or die selection to a package -> numbers map.
    fn resolve_group(
        topo: &Topology,
        sel: GroupSelector,
        packages: Option<&[usize]>,
        what: &str,
        all_in_package: impl Fn(&Topology, usize) -> Result<Vec<usize>>,
        packages_of: impl Fn(&Topology, usize) -> Vec<usize>,
    ) -> Result<BTreeMap<usize, Vec<usize>>> {
        let mut result: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        match sel {
            GroupSelector::PerPackage(map) => {
                for (pkg, nums) in map {
                    let valid = all_in_package(topo, pkg)?;
                    for num in &nums {
                        if !valid.contains(num) {
                            return Err(Error::Other(format!(
                                "{what} {num} is not available in package {pkg}, available \
                                 {what}s are: {}",
                                format_cpulist(&valid)
                            )));
                        }
                    }
                    result.insert(pkg, nums);
                }
            }
            GroupSelector::All => {
                let pkgs: Vec<usize> = match packages {
                    Some(pkgs) => pkgs.to_vec(),
                    None => topo.packages(),
                };
                for pkg in pkgs {
                    result.insert(pkg, all_in_package(topo, pkg)?);
                }
            }
            GroupSelector::Nums(nums) => match packages {
                Some(pkgs) => {
                    for &pkg in pkgs {
                        let valid = all_in_package(topo, pkg)?;
                        for num in &nums {
                            if !valid.contains(num) {
                                return Err(Error::Other(format!(
                                    "{what} {num} is not available in package {pkg}, \
                                     available {what}s are: {}",
                                    format_cpulist(&valid)
                                )));
                            }
                        }
                        result.insert(pkg, nums.clone());
                    }
                }
                None => {
                    // No package context: every number must belong to
                    // exactly one package, otherwise it is ambiguous.
                    for num in nums {
                        let pkgs = packages_of(topo, num);
                        match pkgs.len() {
                            0 => {
                                return Err(Error::Other(format!(
                                    "{what} {num} does not exist in any package"
                                )));
                            }
                            1 => {
                                result.entry(pkgs[0]).or_default().push(num);
                            }
                            _ => {
                                return Err(Error::Other(format!(
                                    "{what} {num} exists in multiple packages ({}), please \
                                     specify the package number",
                                    format_cpulist(&pkgs)
                                )));
                            }
                        }
                    }
                }
            },
        }

        for nums in result.values_mut() {
            nums.sort_unstable();
            nums.dedup();
        }
        Ok(result)
    }
}

#[derive(Debug)]
pub struct OpTarget {
    topo: Arc<Topology>,
    cpus: Option<Vec<usize>>,
    cores: Option<BTreeMap<usize, Vec<usize>>>,
    modules: Option<Vec<usize>>,
    dies: Option<BTreeMap<usize, Vec<usize>>>,
    packages: Option<Vec<usize>>,
    core_sib_index: Vec<usize>,
    module_sib_index: Vec<usize>,
    /// Whether any selector was given at all.
    specified: bool,
    default_all: bool,
    cpus_cache: RefCell<Option<Vec<usize>>>,
    dies_cache: RefCell<BTreeMap<bool, BTreeMap<usize, Vec<usize>>>>,
    packages_cache: RefCell<BTreeMap<bool, Vec<usize>>>,
}

impl OpTarget {
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Whether any CPU-granularity selector (CPUs, cores or modules) was
    /// given. Dies and packages alone are a pure die/package-level target.
    fn has_cpu_overlay(&self) -> bool {
        self.cpus.is_some() || self.cores.is_some() || self.modules.is_some()
    }

    /// The CPU numbers this target resolves to, ascending.
    pub fn cpus(&self) -> Result<Vec<usize>> {
        if let Some(cached) = self.cpus_cache.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let cpus = self.resolve_cpus()?;
        *self.cpus_cache.borrow_mut() = Some(cpus.clone());
        Ok(cpus)
    }

    fn resolve_cpus(&self) -> Result<Vec<usize>> {
        if !self.specified {
            if !self.default_all {
                return Err(Error::NoTarget);
            }
            return Ok(self.topo.cpus());
        }

        let mut cpus: Vec<usize> = Vec::new();

        if let Some(explicit) = &self.cpus {
            cpus.extend(explicit);
        }
        if let Some(cores) = &self.cores {
            for (pkg, nums) in cores {
                cpus.extend(self.topo.cores_to_cpus(nums, &[*pkg])?);
            }
        }
        if let Some(modules) = &self.modules {
            cpus.extend(self.topo.modules_to_cpus(modules)?);
        }
        if let Some(dies) = &self.dies {
            for (pkg, nums) in dies {
                cpus.extend(self.topo.dies_to_cpus(nums, &[*pkg])?);
            }
        }
        if let Some(packages) = &self.packages {
            cpus.extend(self.topo.packages_to_cpus(packages)?);
        }

        cpus.sort_unstable();
        cpus.dedup();

        // Sibling filters narrow the set derived from the other selectors:
        // core siblings first, then module siblings on the result.
        if !self.core_sib_index.is_empty() {
            cpus = self.topo.select_core_siblings(&cpus, &self.core_sib_index)?;
        }
        if !self.module_sib_index.is_empty() {
            cpus = self
                .topo
                .select_module_siblings(&cpus, &self.module_sib_index)?;
        }

        if cpus.is_empty() {
            return Err(self.no_cpus_error());
        }
        Ok(cpus)
    }

    /// A target was specified but resolves to zero CPUs. Be specific about
    /// the common cause: only non-compute dies were selected.
    fn no_cpus_error(&self) -> Error {
        if let Some(dies) = &self.dies {
            let mut io_only = !dies.is_empty();
            let mut descr = Vec::new();
            for (pkg, nums) in dies {
                for num in nums {
                    if self.topo.is_io_die(*pkg, *num) {
                        descr.push(format!("die {num} of package {pkg}"));
                    } else {
                        io_only = false;
                    }
                }
            }
            if io_only && !self.has_cpu_overlay() && self.packages.is_none() {
                return Error::NoCpuTarget(format!(
                    "the target has no CPUs: {} {} non-compute dies and have no CPUs",
                    descr.join(", "),
                    if descr.len() == 1 { "is a" } else { "are" },
                ));
            }
        }
        Error::NoCpuTarget("the specified target has no CPUs".to_string())
    }

    /// The dies this target resolves to, as a package -> die numbers map.
    ///
    /// In strict mode every resolved CPU must belong to a wholly-selected
    /// die. Explicitly selected die numbers are always included, and
    /// packages targeted without a CPU/core/module overlay contribute all
    /// their dies, non-compute dies included.
    pub fn dies(&self, strict: bool) -> Result<BTreeMap<usize, Vec<usize>>> {
        if let Some(cached) = self.dies_cache.borrow().get(&strict) {
            return Ok(cached.clone());
        }
        let dies = self.resolve_dies(strict)?;
        self.dies_cache.borrow_mut().insert(strict, dies.clone());
        Ok(dies)
    }

    fn resolve_dies(&self, strict: bool) -> Result<BTreeMap<usize, Vec<usize>>> {
        if !self.specified {
            if !self.default_all {
                return Err(Error::NoTarget);
            }
            let mut all = BTreeMap::new();
            for pkg in self.topo.packages() {
                all.insert(pkg, self.topo.package_to_dies(pkg, true, true)?);
            }
            return Ok(all);
        }

        let mut result: BTreeMap<usize, Vec<usize>> = self.dies.clone().unwrap_or_default();

        // Packages targeted as whole packages pull in their non-compute dies
        // too; an explicit die selection for the same package wins.
        if let Some(packages) = &self.packages {
            if !self.has_cpu_overlay() {
                for &pkg in packages {
                    if !result.contains_key(&pkg) {
                        result.insert(pkg, self.topo.package_to_dies(pkg, true, true)?);
                    }
                }
            }
        }

        match self.cpus() {
            Ok(cpus) => {
                if strict {
                    let (div_dies, rem) = self.topo.cpus_div_dies(&cpus)?;
                    if !rem.is_empty() {
                        return Err(Error::Other(format!(
                            "CPUs {} do not comprise whole die(s)",
                            format_cpulist(&rem)
                        )));
                    }
                    for (pkg, nums) in div_dies {
                        result.entry(pkg).or_default().extend(nums);
                    }
                } else {
                    for cpu in cpus {
                        let (pkg, die) = self.topo.cpu_to_die(cpu)?;
                        result.entry(pkg).or_default().push(die);
                    }
                }
            }
            // A CPU-less target (only non-compute dies) is fine here.
            Err(Error::NoCpuTarget(_)) => {}
            Err(err) => return Err(err),
        }

        for nums in result.values_mut() {
            nums.sort_unstable();
            nums.dedup();
        }
        Ok(result)
    }

    /// The packages this target resolves to, ascending.
    ///
    /// In strict mode every resolved CPU must belong to a wholly-selected
    /// package.
    pub fn packages(&self, strict: bool) -> Result<Vec<usize>> {
        if let Some(cached) = self.packages_cache.borrow().get(&strict) {
            return Ok(cached.clone());
        }
        let packages = self.resolve_packages(strict)?;
        self.packages_cache
            .borrow_mut()
            .insert(strict, packages.clone());
        Ok(packages)
    }

    fn resolve_packages(&self, strict: bool) -> Result<Vec<usize>> {
        if !self.specified {
            if !self.default_all {
                return Err(Error::NoTarget);
            }
            return Ok(self.topo.packages());
        }

        let mut result: Vec<usize> = self.packages.clone().unwrap_or_default();

        match self.cpus() {
            Ok(cpus) => {
                if strict {
                    let (div_pkgs, rem) = self.topo.cpus_div_packages(&cpus)?;
                    if !rem.is_empty() {
                        return Err(Error::Other(format!(
                            "CPUs {} do not comprise whole package(s)",
                            format_cpulist(&rem)
                        )));
                    }
                    result.extend(div_pkgs);
                } else {
                    for cpu in cpus {
                        result.push(self.topo.cpu_to_package(cpu)?);
                    }
                }
            }
            Err(Error::NoCpuTarget(_)) => {}
            Err(err) => return Err(err),
        }

        result.sort_unstable();
        result.dedup();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::tests::{smt_topo, two_package_topo};

    fn builder(topo: Topology) -> OpTargetBuilder {
        OpTargetBuilder::new(Arc::new(topo))
    }

    #[test]
    fn default_all() {
        let target = builder(two_package_topo()).build().unwrap();
        assert_eq!(target.cpus().unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(target.packages(false).unwrap(), vec![0, 1]);
        // Non-compute die 2 is included by default.
        assert_eq!(
            target.dies(false).unwrap(),
            BTreeMap::from([(0, vec![0, 1, 2]), (1, vec![0, 1, 2])])
        );
    }

    #[test]
    fn no_target() {
        let target = builder(two_package_topo())
            .default_all(false)
            .build()
            .unwrap();
        assert!(matches!(target.cpus(), Err(Error::NoTarget)));
        assert!(matches!(target.dies(false), Err(Error::NoTarget)));
        assert!(matches!(target.packages(true), Err(Error::NoTarget)));
    }

    #[test]
    fn cpus_scenario() {
        // cpus 0-3 cover package 0 (dies 0 and 1) exactly.
        let target = builder(two_package_topo())
            .cpus(Selector::parse("0-3").unwrap())
            .build()
            .unwrap();
        assert_eq!(target.cpus().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            target.dies(true).unwrap(),
            BTreeMap::from([(0, vec![0, 1])])
        );
        assert_eq!(target.packages(true).unwrap(), vec![0]);
    }

    #[test]
    fn strict_partial_die() {
        // CPUs 0,1 are die 0 of package 0; CPU 2 starts die 1.
        let target = builder(two_package_topo())
            .cpus(Selector::parse("0,2").unwrap())
            .build()
            .unwrap();
        match target.dies(true) {
            Err(Error::Other(msg)) => assert!(msg.contains("do not comprise whole die")),
            other => panic!("expected strict-die error, got {other:?}"),
        }
        // Non-strict returns the touched dies.
        assert_eq!(
            target.dies(false).unwrap(),
            BTreeMap::from([(0, vec![0, 1])])
        );
    }

    #[test]
    fn ambiguous_relative_numbers() {
        // Die 0 exists in both packages: a bare die number must not guess.
        let err = builder(two_package_topo())
            .dies(GroupSelector::parse("0").unwrap())
            .build()
            .unwrap_err();
        match err {
            Error::Other(msg) => {
                assert!(msg.contains("multiple packages"));
                assert!(msg.contains("0-1"));
            }
            other => panic!("expected ambiguity error, got {other:?}"),
        }

        // With an explicit package there is no ambiguity.
        let target = builder(two_package_topo())
            .dies(GroupSelector::parse("0").unwrap())
            .packages(Selector::parse("1").unwrap())
            .build()
            .unwrap();
        assert_eq!(target.cpus().unwrap(), vec![4, 5]);
    }

    #[test]
    fn all_cores_selects_all_packages() {
        let target = builder(two_package_topo())
            .cores(GroupSelector::All)
            .build()
            .unwrap();
        assert_eq!(target.cpus().unwrap(), (0..8).collect::<Vec<_>>());
        // The implied "all packages" makes per-package operations work.
        assert_eq!(target.packages(false).unwrap(), vec![0, 1]);
    }

    #[test]
    fn packages_only_include_io_dies() {
        let target = builder(two_package_topo())
            .packages(Selector::parse("1").unwrap())
            .build()
            .unwrap();
        assert_eq!(
            target.dies(false).unwrap(),
            BTreeMap::from([(1, vec![0, 1, 2])])
        );

        // With a CPU overlay the non-compute die inference is off.
        let target = builder(two_package_topo())
            .packages(Selector::parse("1").unwrap())
            .cpus(Selector::parse("4-7").unwrap())
            .build()
            .unwrap();
        assert_eq!(
            target.dies(false).unwrap(),
            BTreeMap::from([(1, vec![0, 1])])
        );
    }

    #[test]
    fn explicit_dies_suppress_package_inference() {
        let target = builder(two_package_topo())
            .packages(Selector::parse("0").unwrap())
            .dies(GroupSelector::PerPackage(BTreeMap::from([(0, vec![0])])))
            .build()
            .unwrap();
        let dies = target.dies(false).unwrap();
        assert_eq!(dies, BTreeMap::from([(0, vec![0])]));
    }

    #[test]
    fn io_die_only_target() {
        let target = builder(two_package_topo())
            .dies(GroupSelector::PerPackage(BTreeMap::from([(0, vec![2])])))
            .build()
            .unwrap();
        match target.cpus() {
            Err(Error::NoCpuTarget(msg)) => {
                assert!(msg.contains("die 2 of package 0"));
                assert!(msg.contains("non-compute"));
            }
            other => panic!("expected NoCpuTarget, got {other:?}"),
        }
        // The die-level view still works.
        assert_eq!(target.dies(false).unwrap(), BTreeMap::from([(0, vec![2])]));
        assert_eq!(target.packages(false).unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn sibling_filters() {
        // smt_topo: cores (0,4), (1,5), (2,6), (3,7); modules {0,1,4,5}, {2,3,6,7}.
        let target = builder(smt_topo())
            .cpus(Selector::All)
            .core_siblings(vec![1])
            .build()
            .unwrap();
        assert_eq!(target.cpus().unwrap(), vec![4, 5, 6, 7]);

        // Core-sibling filter applies first, module-sibling filter narrows
        // its result. Module members in traversal order are 0,1,4,5 and
        // 2,3,6,7, so module-sibling index 2 means CPUs 4 and 6.
        let target = builder(smt_topo())
            .cpus(Selector::All)
            .core_siblings(vec![1])
            .module_siblings(vec![2])
            .build()
            .unwrap();
        assert_eq!(target.cpus().unwrap(), vec![4, 6]);

        // A filter that excludes everything is a "no CPUs" error, not an
        // empty success.
        let target = builder(smt_topo())
            .cpus(Selector::All)
            .module_siblings(vec![9])
            .build()
            .unwrap();
        assert!(matches!(target.cpus(), Err(Error::NoCpuTarget(_))));
    }

    #[test]
    fn memoization() {
        let target = builder(two_package_topo())
            .cpus(Selector::parse("0-3").unwrap())
            .build()
            .unwrap();
        let first = target.cpus().unwrap();
        let second = target.cpus().unwrap();
        assert_eq!(first, second);
        assert_eq!(target.dies(true).unwrap(), target.dies(true).unwrap());
        assert_eq!(
            target.packages(false).unwrap(),
            target.packages(false).unwrap()
        );
    }

    #[test]
    fn cores_with_explicit_packages() {
        let target = builder(two_package_topo())
            .cores(GroupSelector::parse("0,1").unwrap())
            .packages(Selector::parse("0").unwrap())
            .build()
            .unwrap();
        assert_eq!(target.cpus().unwrap(), vec![0, 1]);
        assert!(builder(two_package_topo())
            .cores(GroupSelector::parse("9").unwrap())
            .packages(Selector::parse("0").unwrap())
            .build()
            .is_err());
    }
}
