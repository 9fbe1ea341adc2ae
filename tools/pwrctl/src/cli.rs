// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Configure Linux power-management knobs", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Print debug information")]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

/// Topology selection flags shared by every verb. Each takes a cpulist-style
/// string ("0-3,7") or "all". Core and die numbers are package-relative.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    #[arg(long, help = "CPUs to operate on (cpulist or 'all')")]
    pub cpus: Option<String>,
    #[arg(long, help = "Cores to operate on, relative to '--packages'")]
    pub cores: Option<String>,
    #[arg(long, help = "Modules to operate on")]
    pub modules: Option<String>,
    #[arg(long, help = "Dies to operate on, relative to '--packages'")]
    pub dies: Option<String>,
    #[arg(long, help = "Packages to operate on")]
    pub packages: Option<String>,
    #[arg(long, help = "Core sibling indices to filter the CPUs by")]
    pub core_siblings: Option<String>,
    #[arg(long, help = "Module sibling indices to filter the CPUs by")]
    pub module_siblings: Option<String>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[clap(flatten)]
    pub target: TargetArgs,
    #[arg(long, help = "Comma-separated property names to read (default: all)")]
    pub properties: Option<String>,
    #[arg(long, help = "Comma-separated mechanisms to use, in order")]
    pub mechanisms: Option<String>,
    #[arg(long, help = "Also print properties that are not supported")]
    pub all: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "C-state properties and requestable idle states")]
    Cstates {
        #[command(subcommand)]
        action: CstatesCmd,
    },
    #[command(about = "P-state (CPU frequency) properties")]
    Pstates {
        #[command(subcommand)]
        action: PstatesCmd,
    },
    #[command(about = "Uncore frequency properties")]
    Uncore {
        #[command(subcommand)]
        action: UncoreCmd,
    },
    #[command(about = "PM QoS latency limits")]
    Pmqos {
        #[command(subcommand)]
        action: PmqosCmd,
    },
    #[command(about = "Save all writable properties to a file")]
    Save {
        #[arg(help = "Output file ('-' or omitted for stdout)")]
        path: Option<PathBuf>,
    },
    #[command(about = "Restore properties from a file created by 'save'")]
    Restore {
        #[arg(help = "File created by 'pwrctl save'")]
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum CstatesCmd {
    #[command(about = "Read C-state properties")]
    Info {
        #[clap(flatten)]
        args: InfoArgs,
    },
    #[command(about = "Modify C-state properties and toggle idle states")]
    Config {
        #[clap(flatten)]
        target: TargetArgs,
        #[arg(long, help = "Comma-separated mechanisms to use, in order")]
        mechanisms: Option<String>,
        #[arg(long, help = "Package C-state limit (e.g. PC6)")]
        pkg_cstate_limit: Option<String>,
        #[arg(long, help = "Enable or disable C1 demotion (on/off)")]
        c1_demotion: Option<String>,
        #[arg(long, help = "Enable or disable C1 undemotion (on/off)")]
        c1_undemotion: Option<String>,
        #[arg(long, help = "Idle governor to use")]
        governor: Option<String>,
        #[arg(long, value_delimiter = ',', help = "Idle states to enable (names or 'all')")]
        enable: Vec<String>,
        #[arg(long, value_delimiter = ',', help = "Idle states to disable (names or 'all')")]
        disable: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PstatesCmd {
    #[command(about = "Read P-state properties")]
    Info {
        #[clap(flatten)]
        args: InfoArgs,
    },
    #[command(about = "Modify P-state properties")]
    Config {
        #[clap(flatten)]
        target: TargetArgs,
        #[arg(long, help = "Comma-separated mechanisms to use, in order")]
        mechanisms: Option<String>,
        #[arg(long, help = "Min. CPU frequency (e.g. 800MHz, 'min', 'max')")]
        min_freq: Option<String>,
        #[arg(long, help = "Max. CPU frequency (e.g. 3.6GHz, 'min', 'max')")]
        max_freq: Option<String>,
        #[arg(long, help = "Enable or disable turbo (on/off)")]
        turbo: Option<String>,
        #[arg(long, help = "CPU frequency governor to use")]
        governor: Option<String>,
        #[arg(long, help = "Energy Performance Preference (name or 0-255)")]
        epp: Option<String>,
        #[arg(long, help = "Energy Performance Bias (0-15)")]
        epb: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum UncoreCmd {
    #[command(about = "Read uncore frequency properties")]
    Info {
        #[clap(flatten)]
        args: InfoArgs,
    },
    #[command(about = "Modify uncore frequency properties")]
    Config {
        #[clap(flatten)]
        target: TargetArgs,
        #[arg(long, help = "Comma-separated mechanisms to use, in order")]
        mechanisms: Option<String>,
        #[arg(long, help = "Min. uncore frequency (e.g. 800MHz, 'min', 'max')")]
        min_freq: Option<String>,
        #[arg(long, help = "Max. uncore frequency (e.g. 2.4GHz, 'min', 'max')")]
        max_freq: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PmqosCmd {
    #[command(about = "Read PM QoS properties")]
    Info {
        #[clap(flatten)]
        args: InfoArgs,
    },
    #[command(about = "Modify PM QoS properties")]
    Config {
        #[clap(flatten)]
        target: TargetArgs,
        #[arg(long, help = "Comma-separated mechanisms to use, in order")]
        mechanisms: Option<String>,
        #[arg(long, help = "Per-CPU wake-up latency limit (e.g. 100us)")]
        latency_limit: Option<String>,
        #[arg(long, help = "Global DMA latency limit (e.g. 50us)")]
        global_latency_limit: Option<String>,
    },
}
