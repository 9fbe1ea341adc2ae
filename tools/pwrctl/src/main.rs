// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod cli;
mod printers;
mod state;

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::debug;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};

use pwr_utils::{
    CStates, GroupSelector, Mechanism, OpTarget, OpTargetBuilder, PStates, PmQos, PropsBackend,
    PropsEngine, Scope, Selector, Topology, Uncore,
};

use cli::{Cli, Commands, CstatesCmd, InfoArgs, PmqosCmd, PstatesCmd, TargetArgs, UncoreCmd};
use printers::{print_prop, print_set_result};
use state::SaveFile;

fn build_target(topo: &Arc<Topology>, args: &TargetArgs) -> Result<OpTarget> {
    let mut builder = OpTargetBuilder::new(Arc::clone(topo));

    if let Some(cpus) = &args.cpus {
        builder = builder.cpus(Selector::parse(cpus)?);
    }
    if let Some(cores) = &args.cores {
        builder = builder.cores(GroupSelector::parse(cores)?);
    }
    if let Some(modules) = &args.modules {
        builder = builder.modules(Selector::parse(modules)?);
    }
    if let Some(dies) = &args.dies {
        builder = builder.dies(GroupSelector::parse(dies)?);
    }
    if let Some(packages) = &args.packages {
        builder = builder.packages(Selector::parse(packages)?);
    }
    if let Some(siblings) = &args.core_siblings {
        builder = builder.core_siblings(pwr_utils::read_cpulist(siblings)?);
    }
    if let Some(siblings) = &args.module_siblings {
        builder = builder.module_siblings(pwr_utils::read_cpulist(siblings)?);
    }

    Ok(builder.build()?)
}

fn parse_mechanisms(arg: &Option<String>) -> Result<Option<Vec<Mechanism>>> {
    match arg {
        None => Ok(None),
        Some(list) => {
            let mut mnames = Vec::new();
            for name in list.split(',') {
                mnames.push(name.trim().parse::<Mechanism>()?);
            }
            Ok(Some(mnames))
        }
    }
}

/// Run the info verb for one subsystem: print the requested (or all)
/// properties.
fn run_info<B: PropsBackend>(
    engine: &mut PropsEngine<B>,
    topo: &Arc<Topology>,
    args: &InfoArgs,
) -> Result<()> {
    let target = build_target(topo, &args.target)?;
    let mnames = parse_mechanisms(&args.mechanisms)?;

    let pnames: Vec<String> = match &args.properties {
        Some(list) => list.split(',').map(|p| p.trim().to_string()).collect(),
        None => engine.prop_names().iter().map(|p| p.to_string()).collect(),
    };

    for pname in &pnames {
        print_prop(engine, &target, pname, mnames.as_deref(), !args.all)?;
    }
    Ok(())
}

/// Apply one property set request at the property's natural granularity and
/// report the outcome.
fn set_prop<B: PropsBackend>(
    engine: &mut PropsEngine<B>,
    target: &OpTarget,
    pname: &str,
    val: &str,
    mnames: Option<&[Mechanism]>,
) -> Result<()> {
    let label = engine
        .backend()
        .props()
        .get(pname)
        .map(|d| d.label)
        .unwrap_or(pname);
    let sname = engine.get_sname(pname)?;

    match sname {
        Scope::Die => {
            let dies = target.dies(true)?;
            let mname = engine.set_prop_dies(pname, val, &dies, mnames)?;
            let units = dies
                .iter()
                .map(|(pkg, dies)| {
                    format!("package {pkg} dies {}", pwr_utils::format_cpulist(dies))
                })
                .collect::<Vec<_>>()
                .join(", ");
            print_set_result(label, val, mname, &units);
        }
        Scope::Package => {
            let packages = target.packages(true)?;
            let mname = engine.set_prop_packages(pname, val, &packages, mnames)?;
            let units = format!("packages {}", pwr_utils::format_cpulist(&packages));
            print_set_result(label, val, mname, &units);
        }
        _ => {
            let cpus = target.cpus()?;
            let mname = engine.set_prop_cpus(pname, val, &cpus, mnames)?;
            let units = format!("CPUs {}", pwr_utils::format_cpulist(&cpus));
            print_set_result(label, val, mname, &units);
        }
    }
    Ok(())
}

fn run_cstates(topo: &Arc<Topology>, action: CstatesCmd) -> Result<()> {
    let mut engine = PropsEngine::new(Arc::clone(topo), CStates::new(Arc::clone(topo)))?;

    match action {
        CstatesCmd::Info { args } => run_info(&mut engine, topo, &args),
        CstatesCmd::Config {
            target,
            mechanisms,
            pkg_cstate_limit,
            c1_demotion,
            c1_undemotion,
            governor,
            enable,
            disable,
        } => {
            let target = build_target(topo, &target)?;
            let mnames = parse_mechanisms(&mechanisms)?;

            let sets = [
                ("pkg_cstate_limit", pkg_cstate_limit),
                ("c1_demotion", c1_demotion),
                ("c1_undemotion", c1_undemotion),
                ("governor", governor),
            ];
            for (pname, val) in sets {
                if let Some(val) = val {
                    set_prop(&mut engine, &target, pname, &val, mnames.as_deref())?;
                }
            }

            if !enable.is_empty() {
                let cpus = target.cpus()?;
                engine.backend_mut().toggle_idle_states(&cpus, &enable, false)?;
                println!(
                    "Enabled idle state(s) {} for CPUs {}",
                    enable.join(","),
                    pwr_utils::format_cpulist(&cpus)
                );
            }
            if !disable.is_empty() {
                let cpus = target.cpus()?;
                engine.backend_mut().toggle_idle_states(&cpus, &disable, true)?;
                println!(
                    "Disabled idle state(s) {} for CPUs {}",
                    disable.join(","),
                    pwr_utils::format_cpulist(&cpus)
                );
            }
            Ok(())
        }
    }
}

fn run_pstates(topo: &Arc<Topology>, action: PstatesCmd) -> Result<()> {
    let mut engine = PropsEngine::new(Arc::clone(topo), PStates::new(Arc::clone(topo)))?;

    match action {
        PstatesCmd::Info { args } => run_info(&mut engine, topo, &args),
        PstatesCmd::Config {
            target,
            mechanisms,
            min_freq,
            max_freq,
            turbo,
            governor,
            epp,
            epb,
        } => {
            let target = build_target(topo, &target)?;
            let mnames = parse_mechanisms(&mechanisms)?;

            match (&min_freq, &max_freq) {
                (Some(min), Some(max)) => {
                    // Writing the max first fails only when the new max is
                    // below the currently configured min: flip the order in
                    // that case.
                    match set_prop(&mut engine, &target, "max_freq", max, mnames.as_deref()) {
                        Ok(()) => {
                            set_prop(&mut engine, &target, "min_freq", min, mnames.as_deref())?
                        }
                        Err(err) => {
                            debug!("max-first ordering failed ({err}), trying min first");
                            set_prop(&mut engine, &target, "min_freq", min, mnames.as_deref())?;
                            set_prop(&mut engine, &target, "max_freq", max, mnames.as_deref())?;
                        }
                    }
                }
                (Some(min), None) => {
                    set_prop(&mut engine, &target, "min_freq", min, mnames.as_deref())?
                }
                (None, Some(max)) => {
                    set_prop(&mut engine, &target, "max_freq", max, mnames.as_deref())?
                }
                (None, None) => {}
            }

            let sets = [("turbo", turbo), ("governor", governor), ("epp", epp), ("epb", epb)];
            for (pname, val) in sets {
                if let Some(val) = val {
                    set_prop(&mut engine, &target, pname, &val, mnames.as_deref())?;
                }
            }
            Ok(())
        }
    }
}

fn run_uncore(topo: &Arc<Topology>, action: UncoreCmd) -> Result<()> {
    let mut engine = PropsEngine::new(Arc::clone(topo), Uncore::new(Arc::clone(topo)))?;

    match action {
        UncoreCmd::Info { args } => run_info(&mut engine, topo, &args),
        UncoreCmd::Config {
            target,
            mechanisms,
            min_freq,
            max_freq,
        } => {
            let target = build_target(topo, &target)?;
            let mnames = parse_mechanisms(&mechanisms)?;

            let sets = [("min_freq", min_freq), ("max_freq", max_freq)];
            for (pname, val) in sets {
                if let Some(val) = val {
                    set_prop(&mut engine, &target, pname, &val, mnames.as_deref())?;
                }
            }
            Ok(())
        }
    }
}

fn run_pmqos(topo: &Arc<Topology>, action: PmqosCmd) -> Result<()> {
    let mut engine = PropsEngine::new(Arc::clone(topo), PmQos::new())?;

    match action {
        PmqosCmd::Info { args } => run_info(&mut engine, topo, &args),
        PmqosCmd::Config {
            target,
            mechanisms,
            latency_limit,
            global_latency_limit,
        } => {
            let target = build_target(topo, &target)?;
            let mnames = parse_mechanisms(&mechanisms)?;

            let sets = [
                ("latency_limit", latency_limit),
                ("global_latency_limit", global_latency_limit),
            ];
            for (pname, val) in sets {
                if let Some(val) = val {
                    set_prop(&mut engine, &target, pname, &val, mnames.as_deref())?;
                }
            }
            Ok(())
        }
    }
}

fn run_save(topo: &Arc<Topology>, path: Option<std::path::PathBuf>) -> Result<()> {
    let target = build_target(topo, &TargetArgs::default())?;
    let mut save = SaveFile::default();

    let mut cstates = PropsEngine::new(Arc::clone(topo), CStates::new(Arc::clone(topo)))?;
    state::save_subsystem(&mut cstates, &target, &mut save)?;
    let mut pstates = PropsEngine::new(Arc::clone(topo), PStates::new(Arc::clone(topo)))?;
    state::save_subsystem(&mut pstates, &target, &mut save)?;
    let mut uncore = PropsEngine::new(Arc::clone(topo), Uncore::new(Arc::clone(topo)))?;
    state::save_subsystem(&mut uncore, &target, &mut save)?;
    let mut pmqos = PropsEngine::new(Arc::clone(topo), PmQos::new())?;
    state::save_subsystem(&mut pmqos, &target, &mut save)?;

    let text = toml::to_string_pretty(&save).context("failed to serialize the saved state")?;
    match path {
        Some(path) if path.as_os_str() != "-" => {
            std::fs::write(&path, text)
                .with_context(|| format!("failed to write '{}'", path.display()))?;
            println!("Saved {} propert(ies) to '{}'", save.props.len(), path.display());
        }
        _ => {
            std::io::stdout().write_all(text.as_bytes())?;
        }
    }
    Ok(())
}

fn run_restore(topo: &Arc<Topology>, path: std::path::PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let save: SaveFile =
        toml::from_str(&text).with_context(|| format!("failed to parse '{}'", path.display()))?;

    let mut count = 0;
    let mut cstates = PropsEngine::new(Arc::clone(topo), CStates::new(Arc::clone(topo)))?;
    count += state::restore_subsystem(&mut cstates, &save)?;
    let mut pstates = PropsEngine::new(Arc::clone(topo), PStates::new(Arc::clone(topo)))?;
    count += state::restore_subsystem(&mut pstates, &save)?;
    let mut uncore = PropsEngine::new(Arc::clone(topo), Uncore::new(Arc::clone(topo)))?;
    count += state::restore_subsystem(&mut uncore, &save)?;
    let mut pmqos = PropsEngine::new(Arc::clone(topo), PmQos::new())?;
    count += state::restore_subsystem(&mut pmqos, &save)?;

    println!("Restored {count} propert(ies) from '{}'", path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("failed to initialize the logger")?;

    let topo = Arc::new(Topology::new().context("failed to read the host CPU topology")?);
    if topo.cpus().is_empty() {
        bail!("no online CPUs found");
    }
    debug!(
        "topology: {} CPUs, {} package(s)",
        topo.nr_cpus(),
        topo.packages().len()
    );

    match cli.command {
        Commands::Cstates { action } => run_cstates(&topo, action),
        Commands::Pstates { action } => run_pstates(&topo, action),
        Commands::Uncore { action } => run_uncore(&topo, action),
        Commands::Pmqos { action } => run_pmqos(&topo, action),
        Commands::Save { path } => run_save(&topo, path),
        Commands::Restore { path } => run_restore(&topo, path),
    }
}
