// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for Linux power-management configuration
//!
//! This crate is the engine behind the `pwrctl` tool. It models the host CPU
//! topology, provides cached and transactional access to the kernel control
//! surfaces power-management knobs live behind (sysfs files, model-specific
//! registers, the TPMI debugfs interface, character devices), and builds a
//! normalized "property" abstraction on top.
//!
//! The two central pieces are:
//!
//! * [`OpTarget`] — resolves a user's topology selection (any mix of CPU,
//!   core, module, die and package numbers, plus sibling-index filters) into
//!   concrete CPU, die and package sets, refusing to guess when
//!   package-relative numbers are ambiguous.
//! * [`PropsEngine`] — generic get/set for declared properties across CPU,
//!   die or package granularity, trying mechanisms in order, validating that
//!   the selection matches the property scope, and cross-checking sibling
//!   units when a property's I/O granularity differs from its declared
//!   scope.
//!
//! Subsystem adapters ([`CStates`], [`PStates`], [`Uncore`], [`PmQos`])
//! declare their property tables and implement the [`PropsBackend`] I/O
//! contract.

use lazy_static::lazy_static;

lazy_static! {
    /// Filesystem root prefix applied to every `/sys`, `/dev` and debugfs
    /// path, so tests and emulation can redirect the whole crate at a fake
    /// tree.
    pub static ref ROOT_PREFIX: String = std::env::var("PWR_ROOT_PREFIX").unwrap_or_default();
}

pub mod error;
pub use error::{Error, Result};

pub mod cpumask;
pub use cpumask::{format_cpulist, read_cpulist, Cpumask};

pub mod human;

pub mod topology;
pub use topology::{CpuKind, TopoEntry, Topology};

pub mod sysfs;
pub use sysfs::SysfsIo;

pub mod msr;
pub use msr::Msr;

pub mod tpmi;
pub use tpmi::Tpmi;

pub mod props;
pub use props::{DType, Mechanism, PropDesc, PropValue, Scope};

pub mod optarget;
pub use optarget::{GroupSelector, OpTarget, OpTargetBuilder, Selector};

pub mod access;
pub use access::{CpuPropInfo, DiePropInfo, PkgPropInfo, PropsBackend, PropsEngine};

pub mod cstates;
pub use cstates::CStates;

pub mod pstates;
pub use pstates::PStates;

pub mod uncore;
pub use uncore::{Uncore, UncoreLimits};

pub mod pmqos;
pub use pmqos::PmQos;
