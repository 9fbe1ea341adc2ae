// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The property access framework: uniform, mechanism-ordered, scope-aware
//! get/set for any declared property across CPU, die or package granularity.
//!
//! Subsystem adapters implement [`PropsBackend`] and are driven by
//! [`PropsEngine`]. For reads, the backend produces a single-pass iterator
//! of (unit, value) results, ordered by the input unit order. The engine
//! tries mechanisms in their declared (or caller-restricted) order: a
//! mechanism failing with "not supported" before yielding anything triggers
//! fallback to the next one; failing after having yielded some units is a
//! hard inconsistency (partial support within one mechanism is not
//! tolerated). `Bug`-class errors are never caught by the fallback loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::cpumask::format_cpulist;
use crate::error::{Error, Result};
use crate::human::uncapitalize;
use crate::props::{Mechanism, PropDesc, PropValue, Scope};
use crate::topology::Topology;

/// One item of a per-CPU value stream.
pub type PvItem = Result<(usize, PropValue)>;
/// Lazy per-CPU value stream: finite, single-pass, ordered by the input CPU
/// order, not restartable.
pub type PvStream<'a> = Box<dyn Iterator<Item = PvItem> + 'a>;

/// One item of a per-die value stream, keyed by (package, die).
pub type DiePvItem = Result<((usize, usize), PropValue)>;
pub type DiePvStream<'a> = Box<dyn Iterator<Item = DiePvItem> + 'a>;

/// Result of reading one property for one CPU.
#[derive(Debug, Clone)]
pub struct CpuPropInfo {
    pub cpu: usize,
    pub pname: String,
    /// `None` when the property is not supported.
    pub value: Option<PropValue>,
    /// The mechanism that produced the value.
    pub mname: Option<Mechanism>,
}

/// Result of reading one property for one die.
#[derive(Debug, Clone)]
pub struct DiePropInfo {
    pub package: usize,
    pub die: usize,
    pub pname: String,
    pub value: Option<PropValue>,
    pub mname: Option<Mechanism>,
}

/// Result of reading one property for one package.
#[derive(Debug, Clone)]
pub struct PkgPropInfo {
    pub package: usize,
    pub pname: String,
    pub value: Option<PropValue>,
    pub mname: Option<Mechanism>,
}

/// The per-subsystem adapter contract.
///
/// Adapters raise `NotSupported` (never panic) when a mechanism genuinely
/// cannot serve the request on the current hardware, and
/// `TryAnotherMechanism` when the mechanism categorically cannot serve the
/// property (e.g. a numeric-only mechanism asked to write a named value).
pub trait PropsBackend {
    /// Subsystem name, used in messages.
    fn name(&self) -> &'static str;

    /// The property table. This is the adapter's runtime copy: the engine
    /// updates lazily-resolved scopes in it.
    fn props(&self) -> &BTreeMap<&'static str, PropDesc>;
    fn props_mut(&mut self) -> &mut BTreeMap<&'static str, PropDesc>;

    /// Resolve the platform-dependent scope of a property whose descriptor
    /// carries no static scope.
    fn resolve_sname(&mut self, pname: &str) -> Result<Scope> {
        Err(Error::Bug(format!(
            "scope of property '{pname}' was left unresolved"
        )))
    }

    /// Whether a (property, mechanism) pair declared in the table actually
    /// dispatches to a handler. Checked exhaustively at engine construction.
    fn handles(&self, pname: &str, mname: Mechanism) -> bool;

    /// Stream values of `pname` via `mname` for every CPU in `cpus`, in
    /// order.
    fn read_cpus<'a>(
        &'a mut self,
        pname: &'a str,
        mname: Mechanism,
        cpus: &'a [usize],
    ) -> PvStream<'a>;

    /// Apply `val` to `pname` via `mname` for every CPU in `cpus`.
    fn write_cpus(
        &mut self,
        pname: &str,
        mname: Mechanism,
        val: &PropValue,
        cpus: &[usize],
    ) -> Result<()>;

    /// Whether the property's units are dies rather than CPUs (uncore
    /// frequency). Such properties must implement `read_dies`/`write_dies`.
    fn die_units(&self, _pname: &str) -> bool {
        false
    }

    fn read_dies<'a>(
        &'a mut self,
        pname: &'a str,
        _mname: Mechanism,
        _dies: &'a [(usize, usize)],
    ) -> DiePvStream<'a> {
        Box::new(std::iter::once(Err(Error::Bug(format!(
            "die-granularity read of '{pname}' is not implemented"
        )))))
    }

    fn write_dies(
        &mut self,
        pname: &str,
        _mname: Mechanism,
        _val: &PropValue,
        _dies: &[(usize, usize)],
    ) -> Result<()> {
        Err(Error::Bug(format!(
            "die-granularity write of '{pname}' is not implemented"
        )))
    }
}

pub struct PropsEngine<B: PropsBackend> {
    topo: Arc<Topology>,
    backend: B,
}

impl<B: PropsBackend> PropsEngine<B> {
    /// Wrap a backend, validating its property table: every declared
    /// (property, mechanism) pair must dispatch to a handler, writable
    /// properties must have a writable mechanism.
    pub fn new(topo: Arc<Topology>, backend: B) -> Result<PropsEngine<B>> {
        for (pname, desc) in backend.props() {
            if desc.mnames.is_empty() {
                return Err(Error::Bug(format!(
                    "property '{pname}' declares no mechanisms"
                )));
            }
            if desc.writable && !desc.mnames.iter().any(|m| m.writable()) {
                return Err(Error::Bug(format!(
                    "writable property '{pname}' has no writable mechanism"
                )));
            }
            for mname in desc.mnames {
                if !backend.handles(pname, *mname) {
                    return Err(Error::Bug(format!(
                        "property '{pname}' declares mechanism '{mname}' but the '{}' \
                         backend does not handle it",
                        backend.name()
                    )));
                }
            }
        }
        Ok(PropsEngine { topo, backend })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// All property names, in table order.
    pub fn prop_names(&self) -> Vec<&'static str> {
        self.backend.props().keys().copied().collect()
    }

    fn desc(&self, pname: &str) -> Result<PropDesc> {
        match self.backend.props().get(pname) {
            Some(desc) => Ok(desc.clone()),
            None => {
                let known: Vec<&str> = self.backend.props().keys().copied().collect();
                Err(Error::Other(format!(
                    "unknown property '{pname}', known properties are: {}",
                    known.join(", ")
                )))
            }
        }
    }

    /// Scope of property `pname`, resolving platform-dependent scopes
    /// lazily.
    pub fn get_sname(&mut self, pname: &str) -> Result<Scope> {
        let desc = self.desc(pname)?;
        if let Some(sname) = desc.sname {
            return Ok(sname);
        }

        let sname = self.backend.resolve_sname(pname)?;
        let desc = self.backend.props_mut().get_mut(pname).unwrap();
        desc.sname = Some(sname);
        if desc.iosname.is_none() {
            desc.iosname = Some(sname);
        }
        Ok(sname)
    }

    fn get_iosname(&mut self, pname: &str) -> Result<Scope> {
        let sname = self.get_sname(pname)?;
        Ok(self.desc(pname)?.iosname.unwrap_or(sname))
    }

    /// The mechanisms to try, in order: the caller's restriction if given,
    /// the descriptor's preference order otherwise.
    fn mech_order(&self, desc: &PropDesc, mnames: Option<&[Mechanism]>) -> Result<Vec<Mechanism>> {
        match mnames {
            None => Ok(desc.mnames.to_vec()),
            Some(requested) => {
                let mut order = Vec::new();
                for mname in requested {
                    if !desc.mnames.contains(mname) {
                        return Err(Error::Other(format!(
                            "mechanism '{mname}' cannot be used for {}, supported \
                             mechanisms are: {}",
                            uncapitalize(desc.label),
                            desc.mnames
                                .iter()
                                .map(|m| m.short())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )));
                    }
                    if !order.contains(mname) {
                        order.push(*mname);
                    }
                }
                if order.is_empty() {
                    return Err(Error::Other(format!(
                        "no mechanisms were specified for {}",
                        uncapitalize(desc.label)
                    )));
                }
                Ok(order)
            }
        }
    }

    /// Read property `pname` for every CPU in `cpus`.
    ///
    /// With `unsupported_ok`, exhausting all mechanisms produces `None`-valued
    /// records instead of an error.
    pub fn get_prop_cpus(
        &mut self,
        pname: &str,
        cpus: &[usize],
        mnames: Option<&[Mechanism]>,
        unsupported_ok: bool,
    ) -> Result<Vec<CpuPropInfo>> {
        let desc = self.desc(pname)?;
        let cpus = self.topo.normalize_cpus(cpus, false)?;
        let mechs = self.mech_order(&desc, mnames)?;

        let mut errors: Vec<String> = Vec::new();
        'mechs: for mname in mechs {
            let mut infos: Vec<CpuPropInfo> = Vec::with_capacity(cpus.len());
            for item in self.backend.read_cpus(pname, mname, &cpus) {
                match item {
                    Ok((cpu, value)) => {
                        debug!("CPU {cpu}: {pname} = {value} ({mname})");
                        infos.push(CpuPropInfo {
                            cpu,
                            pname: pname.to_string(),
                            value: Some(value),
                            mname: Some(mname),
                        });
                    }
                    Err(err) if err.triggers_fallback() => {
                        if let Some(last) = infos.last() {
                            // The mechanism served some CPUs and then bailed:
                            // that is an inconsistency, not a fallback case.
                            return Err(Error::Bug(format!(
                                "mechanism '{mname}' served '{pname}' up to CPU {} and \
                                 then reported: {err}",
                                last.cpu
                            )));
                        }
                        errors.push(format!("{}: {err}", mname.short()));
                        continue 'mechs;
                    }
                    Err(err) => return Err(err),
                }
            }

            if infos.len() != cpus.len() {
                return Err(Error::Bug(format!(
                    "mechanism '{mname}' yielded {} of {} values for '{pname}'",
                    infos.len(),
                    cpus.len()
                )));
            }
            return Ok(infos);
        }

        if unsupported_ok {
            return Ok(cpus
                .iter()
                .map(|&cpu| CpuPropInfo {
                    cpu,
                    pname: pname.to_string(),
                    value: None,
                    mname: None,
                })
                .collect());
        }
        Err(Error::NotSupported {
            what: desc.label.to_string(),
            errors,
        })
    }

    /// Read property `pname` for the dies in `dies` (package -> die
    /// numbers).
    pub fn get_prop_dies(
        &mut self,
        pname: &str,
        dies: &BTreeMap<usize, Vec<usize>>,
        mnames: Option<&[Mechanism]>,
        unsupported_ok: bool,
    ) -> Result<Vec<DiePropInfo>> {
        let desc = self.desc(pname)?;
        let sname = self.get_sname(pname)?;
        if !matches!(sname, Scope::Die | Scope::Package | Scope::Global) {
            return Err(Error::Other(format!(
                "{} has {sname} scope and cannot be accessed at die granularity",
                uncapitalize(desc.label)
            )));
        }

        let mut flat: Vec<(usize, usize)> = Vec::new();
        for (pkg, nums) in dies {
            for die in self.topo.normalize_dies(nums, *pkg)? {
                flat.push((*pkg, die));
            }
        }

        if self.backend.die_units(pname) {
            return self.get_prop_dies_direct(pname, &desc, &flat, mnames, unsupported_ok);
        }

        let iosname = self.get_iosname(pname)?;
        let mut infos = Vec::with_capacity(flat.len());
        for (pkg, die) in flat {
            let cpus = self.topo.dies_to_cpus(&[die], &[pkg])?;
            if cpus.is_empty() {
                return Err(Error::Other(format!(
                    "cannot read {} for die {die} of package {pkg}: it is a non-compute \
                     die and the property is backed by per-CPU state",
                    uncapitalize(desc.label)
                )));
            }
            let (value, mname) =
                self.read_uniform(pname, sname, iosname, &cpus, mnames, unsupported_ok)?;
            infos.push(DiePropInfo {
                package: pkg,
                die,
                pname: pname.to_string(),
                value,
                mname,
            });
        }
        Ok(infos)
    }

    /// Mechanism-fallback loop over the backend's die-granularity streams.
    fn get_prop_dies_direct(
        &mut self,
        pname: &str,
        desc: &PropDesc,
        dies: &[(usize, usize)],
        mnames: Option<&[Mechanism]>,
        unsupported_ok: bool,
    ) -> Result<Vec<DiePropInfo>> {
        let mechs = self.mech_order(desc, mnames)?;

        let mut errors: Vec<String> = Vec::new();
        'mechs: for mname in mechs {
            let mut infos: Vec<DiePropInfo> = Vec::with_capacity(dies.len());
            for item in self.backend.read_dies(pname, mname, dies) {
                match item {
                    Ok(((package, die), value)) => infos.push(DiePropInfo {
                        package,
                        die,
                        pname: pname.to_string(),
                        value: Some(value),
                        mname: Some(mname),
                    }),
                    Err(err) if err.triggers_fallback() => {
                        if let Some(last) = infos.last() {
                            return Err(Error::Bug(format!(
                                "mechanism '{mname}' served '{pname}' up to die {} of \
                                 package {} and then reported: {err}",
                                last.die, last.package
                            )));
                        }
                        errors.push(format!("{}: {err}", mname.short()));
                        continue 'mechs;
                    }
                    Err(err) => return Err(err),
                }
            }

            if infos.len() != dies.len() {
                return Err(Error::Bug(format!(
                    "mechanism '{mname}' yielded {} of {} values for '{pname}'",
                    infos.len(),
                    dies.len()
                )));
            }
            return Ok(infos);
        }

        if unsupported_ok {
            return Ok(dies
                .iter()
                .map(|&(package, die)| DiePropInfo {
                    package,
                    die,
                    pname: pname.to_string(),
                    value: None,
                    mname: None,
                })
                .collect());
        }
        Err(Error::NotSupported {
            what: desc.label.to_string(),
            errors,
        })
    }

    /// Read property `pname` for the packages in `packages`.
    pub fn get_prop_packages(
        &mut self,
        pname: &str,
        packages: &[usize],
        mnames: Option<&[Mechanism]>,
        unsupported_ok: bool,
    ) -> Result<Vec<PkgPropInfo>> {
        let desc = self.desc(pname)?;
        let sname = self.get_sname(pname)?;
        if !matches!(sname, Scope::Package | Scope::Global) {
            return Err(Error::Other(format!(
                "{} has {sname} scope and cannot be accessed at package granularity",
                uncapitalize(desc.label)
            )));
        }

        let packages = self.topo.normalize_packages(packages)?;
        let iosname = self.get_iosname(pname)?;

        let mut infos = Vec::with_capacity(packages.len());
        for pkg in packages {
            let cpus = self.topo.package_to_cpus(pkg)?;
            let (value, mname) =
                self.read_uniform(pname, sname, iosname, &cpus, mnames, unsupported_ok)?;
            infos.push(PkgPropInfo {
                package: pkg,
                pname: pname.to_string(),
                value,
                mname,
            });
        }
        Ok(infos)
    }

    /// Read a value that is supposed to be uniform across `cpus`.
    ///
    /// When the I/O scope differs from the declared scope, a single read
    /// cannot be trusted: read every CPU and verify agreement, reporting
    /// `UsePerCpu` (naming the disagreeing CPUs and values) on mismatch.
    /// Otherwise read one representative CPU.
    fn read_uniform(
        &mut self,
        pname: &str,
        sname: Scope,
        iosname: Scope,
        cpus: &[usize],
        mnames: Option<&[Mechanism]>,
        unsupported_ok: bool,
    ) -> Result<(Option<PropValue>, Option<Mechanism>)> {
        let read_cpus: &[usize] = if sname == iosname {
            &cpus[..1]
        } else {
            cpus
        };

        let infos = match self.get_prop_cpus(pname, read_cpus, mnames, false) {
            Ok(infos) => infos,
            Err(Error::NotSupported { .. }) if unsupported_ok => return Ok((None, None)),
            Err(err) => return Err(err),
        };

        let first = &infos[0];
        for info in &infos[1..] {
            if info.value != first.value {
                return Err(Error::UsePerCpu {
                    pname: pname.to_string(),
                    sname: sname.to_string(),
                    cpu1: first.cpu,
                    val1: display_opt(&first.value),
                    cpu2: info.cpu,
                    val2: display_opt(&info.value),
                });
            }
        }
        Ok((first.value.clone(), first.mname))
    }

    /// Set property `pname` to `val` (raw user input) for every CPU in
    /// `cpus`. Returns the mechanism that succeeded.
    pub fn set_prop_cpus(
        &mut self,
        pname: &str,
        val: &str,
        cpus: &[usize],
        mnames: Option<&[Mechanism]>,
    ) -> Result<Mechanism> {
        let desc = self.desc(pname)?;
        let value = self.normalize_write(&desc, val)?;
        let cpus = self.topo.normalize_cpus(cpus, false)?;

        let sname = self.get_sname(pname)?;
        self.validate_cpus_vs_scope(&desc, sname, &cpus)?;

        self.write_fallback(pname, &desc, &value, &cpus, mnames)
    }

    /// Set property `pname` for the dies in `dies`. Returns the mechanism
    /// that succeeded.
    pub fn set_prop_dies(
        &mut self,
        pname: &str,
        val: &str,
        dies: &BTreeMap<usize, Vec<usize>>,
        mnames: Option<&[Mechanism]>,
    ) -> Result<Mechanism> {
        let desc = self.desc(pname)?;
        let value = self.normalize_write(&desc, val)?;
        let sname = self.get_sname(pname)?;
        if !matches!(sname, Scope::Die | Scope::Package | Scope::Global) {
            return Err(Error::Other(format!(
                "{} has {sname} scope and cannot be set at die granularity",
                uncapitalize(desc.label)
            )));
        }

        let mut flat: Vec<(usize, usize)> = Vec::new();
        for (pkg, nums) in dies {
            for die in self.topo.normalize_dies(nums, *pkg)? {
                flat.push((*pkg, die));
            }
        }

        if self.backend.die_units(pname) {
            return self.write_dies_fallback(pname, &desc, &value, &flat, mnames);
        }

        let mut cpus = Vec::new();
        for (pkg, die) in &flat {
            let die_cpus = self.topo.dies_to_cpus(&[*die], &[*pkg])?;
            if die_cpus.is_empty() {
                return Err(Error::Other(format!(
                    "cannot set {} for die {die} of package {pkg}: it is a non-compute \
                     die and the property is backed by per-CPU state",
                    uncapitalize(desc.label)
                )));
            }
            cpus.extend(die_cpus);
        }
        cpus.sort_unstable();

        self.validate_cpus_vs_scope(&desc, sname, &cpus)?;
        let iosname = self.get_iosname(pname)?;
        let reps = self.iosname_representatives(&cpus, iosname)?;
        self.write_fallback(pname, &desc, &value, &reps, mnames)
    }

    /// Set property `pname` for the packages in `packages`. Returns the
    /// mechanism that succeeded.
    pub fn set_prop_packages(
        &mut self,
        pname: &str,
        val: &str,
        packages: &[usize],
        mnames: Option<&[Mechanism]>,
    ) -> Result<Mechanism> {
        let desc = self.desc(pname)?;
        let value = self.normalize_write(&desc, val)?;
        let sname = self.get_sname(pname)?;
        if !matches!(sname, Scope::Package | Scope::Global) {
            return Err(Error::Other(format!(
                "{} has {sname} scope and cannot be set at package granularity",
                uncapitalize(desc.label)
            )));
        }

        let packages = self.topo.normalize_packages(packages)?;
        let mut cpus = Vec::new();
        for pkg in &packages {
            cpus.extend(self.topo.package_to_cpus(*pkg)?);
        }
        cpus.sort_unstable();

        self.validate_cpus_vs_scope(&desc, sname, &cpus)?;
        let iosname = self.get_iosname(pname)?;
        let reps = self.iosname_representatives(&cpus, iosname)?;
        self.write_fallback(pname, &desc, &value, &reps, mnames)
    }

    fn normalize_write(&self, desc: &PropDesc, val: &str) -> Result<PropValue> {
        if !desc.writable {
            return Err(Error::Other(format!(
                "{} is read-only and cannot be modified",
                uncapitalize(desc.label)
            )));
        }
        desc.normalize_input(val)
    }

    fn write_fallback(
        &mut self,
        pname: &str,
        desc: &PropDesc,
        value: &PropValue,
        cpus: &[usize],
        mnames: Option<&[Mechanism]>,
    ) -> Result<Mechanism> {
        let mechs: Vec<Mechanism> = self
            .mech_order(desc, mnames)?
            .into_iter()
            .filter(|m| m.writable())
            .collect();
        if mechs.is_empty() {
            return Err(Error::Other(format!(
                "no writable mechanism was specified for {}",
                uncapitalize(desc.label)
            )));
        }

        let mut errors: Vec<String> = Vec::new();
        for mname in mechs {
            match self.backend.write_cpus(pname, mname, value, cpus) {
                Ok(()) => {
                    debug!("set {pname} = {value} for CPUs {} ({mname})", format_cpulist(cpus));
                    return Ok(mname);
                }
                Err(err) if err.triggers_fallback() => {
                    errors.push(format!("{}: {err}", mname.short()));
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::NotSupported {
            what: format!("setting {}", uncapitalize(desc.label)),
            errors,
        })
    }

    fn write_dies_fallback(
        &mut self,
        pname: &str,
        desc: &PropDesc,
        value: &PropValue,
        dies: &[(usize, usize)],
        mnames: Option<&[Mechanism]>,
    ) -> Result<Mechanism> {
        let mechs: Vec<Mechanism> = self
            .mech_order(desc, mnames)?
            .into_iter()
            .filter(|m| m.writable())
            .collect();
        if mechs.is_empty() {
            return Err(Error::Other(format!(
                "no writable mechanism was specified for {}",
                uncapitalize(desc.label)
            )));
        }

        let mut errors: Vec<String> = Vec::new();
        for mname in mechs {
            match self.backend.write_dies(pname, mname, value, dies) {
                Ok(()) => return Ok(mname),
                Err(err) if err.triggers_fallback() => {
                    errors.push(format!("{}: {err}", mname.short()));
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::NotSupported {
            what: format!("setting {}", uncapitalize(desc.label)),
            errors,
        })
    }

    /// Make sure the CPU set matches the property scope: a global property
    /// needs all CPUs, a package/die/core/module property needs the CPUs to
    /// comprise whole units.
    fn validate_cpus_vs_scope(
        &mut self,
        desc: &PropDesc,
        sname: Scope,
        cpus: &[usize],
    ) -> Result<()> {
        match sname {
            Scope::Cpu => Ok(()),
            Scope::Global => {
                let all: Vec<usize> = self.topo.cpus();
                let missing: Vec<usize> =
                    all.iter().copied().filter(|c| !cpus.contains(c)).collect();
                if missing.is_empty() {
                    return Ok(());
                }
                Err(Error::Other(format!(
                    "{} has global scope, so the list of CPUs must include all CPUs. \
                     However, the following CPUs are missing: {}",
                    uncapitalize(desc.label),
                    format_cpulist(&missing)
                )))
            }
            Scope::Package | Scope::Die | Scope::Core => {
                let rem = match sname {
                    Scope::Package => self.topo.cpus_div_packages(cpus)?.1,
                    Scope::Die => self.topo.cpus_div_dies(cpus)?.1,
                    Scope::Core => self.topo.cpus_div_cores(cpus)?.1,
                    _ => unreachable!(),
                };
                if rem.is_empty() {
                    return Ok(());
                }

                let mut mapping = String::new();
                for pkg in self.topo.packages() {
                    let pkg_cpus = self.topo.package_to_cpus(pkg)?;
                    mapping.push_str(&format!(
                        "\n  * package {pkg}: CPUs: {}",
                        format_cpulist(&pkg_cpus)
                    ));
                }
                Err(Error::Other(format!(
                    "{} has {sname} scope, so the list of CPUs must comprise whole \
                     {sname}(s). However, the following CPUs do not: {}\nHere is the \
                     relation between CPUs and packages:{mapping}",
                    uncapitalize(desc.label),
                    format_cpulist(&rem)
                )))
            }
            Scope::Module => Err(Error::Bug(format!(
                "unsupported scope 'module' for property '{}'",
                desc.name
            ))),
        }
    }

    /// Reduce `cpus` to one representative per I/O-scope sibling group, to
    /// avoid redundant writes of the same physical register.
    fn iosname_representatives(&self, cpus: &[usize], iosname: Scope) -> Result<Vec<usize>> {
        let mut seen = std::collections::BTreeSet::new();
        let mut reps = Vec::new();
        for &cpu in cpus {
            let key = match iosname {
                Scope::Cpu => (0, cpu),
                Scope::Core => self.topo.cpu_to_core(cpu)?,
                Scope::Module => (0, self.topo.cpu_to_module(cpu)?),
                Scope::Die => self.topo.cpu_to_die(cpu)?,
                Scope::Package => (0, self.topo.cpu_to_package(cpu)?),
                Scope::Global => (0, 0),
            };
            let key = (iosname as usize, key.0, key.1);
            if seen.insert(key) {
                reps.push(cpu);
            }
        }
        Ok(reps)
    }

    /// Single-CPU convenience wrapper: the value of `pname` on `cpu`, or
    /// `None` when unsupported.
    pub fn get_cpu_prop(&mut self, pname: &str, cpu: usize) -> Result<Option<PropValue>> {
        let infos = self.get_prop_cpus(pname, &[cpu], None, true)?;
        Ok(infos.into_iter().next().and_then(|i| i.value))
    }

    /// Single-die convenience wrapper.
    pub fn get_die_prop(
        &mut self,
        pname: &str,
        package: usize,
        die: usize,
    ) -> Result<Option<PropValue>> {
        let dies = BTreeMap::from([(package, vec![die])]);
        let infos = self.get_prop_dies(pname, &dies, None, true)?;
        Ok(infos.into_iter().next().and_then(|i| i.value))
    }

    /// Single-package convenience wrapper.
    pub fn get_package_prop(&mut self, pname: &str, package: usize) -> Result<Option<PropValue>> {
        let infos = self.get_prop_packages(pname, &[package], None, true)?;
        Ok(infos.into_iter().next().and_then(|i| i.value))
    }

    /// Single-CPU convenience wrapper for sets.
    pub fn set_cpu_prop(&mut self, pname: &str, val: &str, cpu: usize) -> Result<Mechanism> {
        self.set_prop_cpus(pname, val, &[cpu], None)
    }

    pub fn prop_is_supported_cpu(&mut self, pname: &str, cpu: usize) -> Result<bool> {
        Ok(self.get_cpu_prop(pname, cpu)?.is_some())
    }

    pub fn prop_is_supported_die(
        &mut self,
        pname: &str,
        package: usize,
        die: usize,
    ) -> Result<bool> {
        Ok(self.get_die_prop(pname, package, die)?.is_some())
    }

    pub fn prop_is_supported_package(&mut self, pname: &str, package: usize) -> Result<bool> {
        Ok(self.get_package_prop(pname, package)?.is_some())
    }
}

fn display_opt(value: &Option<PropValue>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "not supported".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::DType;
    use crate::topology::tests::two_package_topo;
    use std::collections::HashMap;

    /// A scriptable backend: per (property, mechanism) either a per-CPU
    /// value store or a failure mode.
    #[derive(Default)]
    struct TestBackend {
        props: BTreeMap<&'static str, PropDesc>,
        /// (pname, mname) -> per-CPU values.
        values: HashMap<(&'static str, Mechanism), BTreeMap<usize, PropValue>>,
        /// Mechanisms that report "not supported" before yielding anything.
        unsupported: Vec<(&'static str, Mechanism)>,
        /// Mechanisms that die after yielding one unit.
        flaky: Vec<(&'static str, Mechanism)>,
        writes: Vec<(String, Mechanism, PropValue, Vec<usize>)>,
    }

    const TEST_PROPS: &[PropDesc] = &[
        PropDesc {
            name: "freq",
            label: "Frequency",
            dtype: DType::Int,
            unit: Some("Hz"),
            writable: true,
            sname: Some(Scope::Cpu),
            iosname: Some(Scope::Cpu),
            mnames: &[Mechanism::Sysfs, Mechanism::Msr],
            special_vals: &["min", "max"],
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
            name: "cst_limit",
            label: "Package C-state limit",
            dtype: DType::Str,
            unit: None,
            writable: true,
            sname: Some(Scope::Package),
            iosname: Some(Scope::Core),
            mnames: &[Mechanism::Msr],
            special_vals: &[],
            subprops: &[],
        },
    ];

    impl TestBackend {
        fn new() -> TestBackend {
            let mut backend = TestBackend::default();
            for desc in TEST_PROPS {
                backend.props.insert(desc.name, desc.clone());
            }
            backend
        }

        fn preset(&mut self, pname: &'static str, mname: Mechanism, cpus: &[usize], val: PropValue) {
            let store = self.values.entry((pname, mname)).or_default();
            for &cpu in cpus {
                store.insert(cpu, val.clone());
            }
        }
    }

    impl PropsBackend for TestBackend {
        fn name(&self) -> &'static str {
            "test"
        }

        fn props(&self) -> &BTreeMap<&'static str, PropDesc> {
            &self.props
        }

        fn props_mut(&mut self) -> &mut BTreeMap<&'static str, PropDesc> {
            &mut self.props
        }

        fn handles(&self, pname: &str, _mname: Mechanism) -> bool {
            self.props.contains_key(pname)
        }

        fn read_cpus<'a>(
            &'a mut self,
            pname: &'a str,
            mname: Mechanism,
            cpus: &'a [usize],
        ) -> PvStream<'a> {
            let key = TEST_PROPS
                .iter()
                .find(|d| d.name == pname)
                .map(|d| (d.name, mname))
                .unwrap();

            if self.unsupported.contains(&key) {
                return Box::new(std::iter::once(Err(Error::not_supported(format!(
                    "'{pname}' via {mname}"
                )))));
            }

            let flaky = self.flaky.contains(&key);
            let values = self.values.get(&key).cloned().unwrap_or_default();
            Box::new(cpus.iter().enumerate().map(move |(idx, &cpu)| {
                if flaky && idx == 1 {
                    return Err(Error::not_supported(format!("'{pname}' flaked on CPU {cpu}")));
                }
                match values.get(&cpu) {
                    Some(val) => Ok((cpu, val.clone())),
                    None => Err(Error::not_supported(format!("'{pname}' via {mname}"))),
                }
            }))
        }

        fn write_cpus(
            &mut self,
            pname: &str,
            mname: Mechanism,
            val: &PropValue,
            cpus: &[usize],
        ) -> Result<()> {
            let key = TEST_PROPS
                .iter()
                .find(|d| d.name == pname)
                .map(|d| (d.name, mname))
                .unwrap();
            if self.unsupported.contains(&key) {
                return Err(Error::not_supported(format!("'{pname}' via {mname}")));
            }
            self.writes
                .push((pname.to_string(), mname, val.clone(), cpus.to_vec()));
            let store = self.values.entry(key).or_default();
            for &cpu in cpus {
                store.insert(cpu, val.clone());
            }
            Ok(())
        }
    }

    fn engine(backend: TestBackend) -> PropsEngine<TestBackend> {
        PropsEngine::new(Arc::new(two_package_topo()), backend).unwrap()
    }

    #[test]
    fn mechanism_fallback_reports_second() {
        let mut backend = TestBackend::new();
        backend.unsupported.push(("freq", Mechanism::Sysfs));
        backend.preset("freq", Mechanism::Msr, &[0, 1], PropValue::Int(1000));
        let mut engine = engine(backend);

        let infos = engine.get_prop_cpus("freq", &[0, 1], None, false).unwrap();
        assert_eq!(infos.len(), 2);
        for info in &infos {
            assert_eq!(info.mname, Some(Mechanism::Msr));
            assert_eq!(info.value, Some(PropValue::Int(1000)));
        }
    }

    #[test]
    fn partial_yield_is_a_bug() {
        let mut backend = TestBackend::new();
        backend.preset("freq", Mechanism::Sysfs, &[0, 1], PropValue::Int(1000));
        backend.flaky.push(("freq", Mechanism::Sysfs));
        let mut engine = engine(backend);

        match engine.get_prop_cpus("freq", &[0, 1], None, false) {
            Err(Error::Bug(msg)) => assert!(msg.contains("up to CPU 0")),
            other => panic!("expected Bug, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_synthesis() {
        let mut backend = TestBackend::new();
        backend.unsupported.push(("freq", Mechanism::Sysfs));
        backend.unsupported.push(("freq", Mechanism::Msr));
        let mut engine = engine(backend);

        match engine.get_prop_cpus("freq", &[0], None, false) {
            Err(Error::NotSupported { errors, .. }) => assert_eq!(errors.len(), 2),
            other => panic!("expected NotSupported, got {other:?}"),
        }

        let infos = engine.get_prop_cpus("freq", &[0, 1], None, true).unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|i| i.value.is_none() && i.mname.is_none()));
    }

    #[test]
    fn set_returns_mechanism_used() {
        let mut backend = TestBackend::new();
        backend.unsupported.push(("freq", Mechanism::Sysfs));
        let mut engine = engine(backend);

        let mname = engine.set_prop_cpus("freq", "800MHz", &[0, 1], None).unwrap();
        assert_eq!(mname, Mechanism::Msr);
        assert_eq!(
            engine.get_cpu_prop("freq", 0).unwrap(),
            Some(PropValue::Int(800_000_000))
        );
    }

    #[test]
    fn global_scope_requires_all_cpus() {
        let mut backend = TestBackend::new();
        backend.preset("turbo", Mechanism::Sysfs, &[0], PropValue::Bool(true));
        let mut engine = engine(backend);

        match engine.set_prop_cpus("turbo", "on", &[0, 1, 2], None) {
            Err(Error::Other(msg)) => {
                assert!(msg.contains("global scope"));
                assert!(msg.contains("3-7"));
            }
            other => panic!("expected scope error, got {other:?}"),
        }

        let all: Vec<usize> = (0..8).collect();
        engine.set_prop_cpus("turbo", "on", &all, None).unwrap();
    }

    #[test]
    fn bool_values_roundtrip_as_on_off() {
        let backend = TestBackend::new();
        let mut engine = engine(backend);
        let all: Vec<usize> = (0..8).collect();

        engine.set_prop_cpus("turbo", "on", &all, None).unwrap();
        let val = engine.get_cpu_prop("turbo", 3).unwrap().unwrap();
        assert_eq!(val, PropValue::Bool(true));
        assert_eq!(val.to_string(), "on");

        assert!(matches!(
            engine.set_prop_cpus("turbo", "bogus", &all, None),
            Err(Error::BadFormat(_))
        ));
    }

    #[test]
    fn iosname_disagreement_raises_use_per_cpu() {
        let mut backend = TestBackend::new();
        // cst_limit: package scope, core I/O scope. CPUs 0-3 are package 0;
        // make CPU 2 disagree.
        backend.preset(
            "cst_limit",
            Mechanism::Msr,
            &[0, 1, 3, 4, 5, 6, 7],
            PropValue::Str("PC6".to_string()),
        );
        backend.preset(
            "cst_limit",
            Mechanism::Msr,
            &[2],
            PropValue::Str("PC2".to_string()),
        );
        let mut engine = engine(backend);

        match engine.get_prop_packages("cst_limit", &[0], None, false) {
            Err(Error::UsePerCpu {
                cpu1, cpu2, val1, val2, ..
            }) => {
                assert_eq!((cpu1, cpu2), (0, 2));
                assert_eq!((val1.as_str(), val2.as_str()), ("PC6", "PC2"));
            }
            other => panic!("expected UsePerCpu, got {other:?}"),
        }

        // Package 1 agrees, so the package read works.
        let infos = engine
            .get_prop_packages("cst_limit", &[1], None, false)
            .unwrap();
        assert_eq!(infos[0].value, Some(PropValue::Str("PC6".to_string())));
    }

    #[test]
    fn die_granularity_scope_checks() {
        let backend = TestBackend::new();
        let mut engine = engine(backend);
        let dies = BTreeMap::from([(0, vec![0])]);

        // A CPU-scope property cannot be read at die granularity.
        match engine.get_prop_dies("freq", &dies, None, false) {
            Err(Error::Other(msg)) => assert!(msg.contains("CPU scope")),
            other => panic!("expected scope error, got {other:?}"),
        }
    }

    #[test]
    fn package_set_reduces_to_iosname_siblings() {
        let backend = TestBackend::new();
        let mut engine = engine(backend);

        // cst_limit has core I/O scope and every core of the test topology
        // has one CPU, so all 4 CPUs of the package are written.
        engine
            .set_prop_packages("cst_limit", "PC6", &[0], None)
            .unwrap();
        let writes = &engine.backend().writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].3, vec![0, 1, 2, 3]);
    }

    #[test]
    fn mechanism_restriction() {
        let mut backend = TestBackend::new();
        backend.preset("freq", Mechanism::Sysfs, &[0], PropValue::Int(1));
        backend.preset("freq", Mechanism::Msr, &[0], PropValue::Int(2));
        let mut engine = engine(backend);

        let infos = engine
            .get_prop_cpus("freq", &[0], Some(&[Mechanism::Msr]), false)
            .unwrap();
        assert_eq!(infos[0].value, Some(PropValue::Int(2)));

        // Restricting to a mechanism the property does not declare fails.
        assert!(engine
            .get_prop_cpus("freq", &[0], Some(&[Mechanism::Tpmi]), false)
            .is_err());
    }

    #[test]
    fn read_only_property_rejects_writes() {
        let mut backend = TestBackend::new();
        backend.props.get_mut("freq").unwrap().writable = false;
        let mut engine = engine(backend);
        match engine.set_prop_cpus("freq", "1000", &[0], None) {
            Err(Error::Other(msg)) => assert!(msg.contains("read-only")),
            other => panic!("expected read-only error, got {other:?}"),
        }
    }
}
