// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Model-Specific Register access through `/dev/cpu/N/msr`.
//!
//! Reads and writes are positioned 8-byte accesses at the register address.
//! The service carries the same per-key write-through cache and transaction
//! surface as the sysfs service, keyed by (CPU, register).

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::ops::RangeInclusive;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::error::{verify_readback, Error, Result};
use crate::ROOT_PREFIX;

/// Package C-state limit and C1 demotion control.
pub const MSR_PKG_CST_CONFIG_CONTROL: u32 = 0xE2;
/// Platform frequency information (base ratio in bits 8-15).
pub const MSR_PLATFORM_INFO: u32 = 0xCE;
/// Energy Performance Bias hint.
pub const MSR_ENERGY_PERF_BIAS: u32 = 0x1B0;
/// HWP enable status.
pub const MSR_PM_ENABLE: u32 = 0x770;
/// HWP request (EPP in bits 24-31).
pub const MSR_HWP_REQUEST: u32 = 0x774;

/// Extract a closed bit range from a register value.
pub fn get_bits(val: u64, bits: &RangeInclusive<u32>) -> u64 {
    let width = bits.end() - bits.start() + 1;
    let mask = if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    (val >> bits.start()) & mask
}

/// Replace a closed bit range in a register value.
pub fn set_bits(val: u64, bits: &RangeInclusive<u32>, field: u64) -> u64 {
    let width = bits.end() - bits.start() + 1;
    let mask = if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    (val & !(mask << bits.start())) | ((field & mask) << bits.start())
}

#[derive(Debug, Clone)]
struct TransEntry {
    value: u64,
    verify: Option<(u32, Duration)>,
}

#[derive(Debug, Default)]
struct Transaction {
    order: Vec<(usize, u32)>,
    entries: HashMap<(usize, u32), TransEntry>,
}

#[derive(Debug)]
pub struct Msr {
    root: PathBuf,
    enable_cache: bool,
    cache: HashMap<(usize, u32), u64>,
    transaction: Option<Transaction>,
}

impl Msr {
    pub fn new() -> Msr {
        let root = if ROOT_PREFIX.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(&*ROOT_PREFIX)
        };
        Self::with_root(root, true)
    }

    pub fn with_root<P: AsRef<Path>>(root: P, enable_cache: bool) -> Msr {
        Msr {
            root: root.as_ref().to_path_buf(),
            enable_cache,
            cache: HashMap::new(),
            transaction: None,
        }
    }

    fn dev_path(&self, cpu: usize) -> PathBuf {
        self.root.join(format!("dev/cpu/{cpu}/msr"))
    }

    fn read_reg(&self, cpu: usize, reg: u32) -> Result<u64> {
        let path = self.dev_path(cpu);
        let file = OpenOptions::new().read(true).open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::not_supported(format!(
                    "MSR access for CPU {cpu}: '{}' does not exist, is the 'msr' kernel \
                     module loaded?",
                    path.display()
                ))
            } else {
                Error::Other(format!("failed to open '{}': {err}", path.display()))
            }
        })?;

        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, reg as u64).map_err(|err| {
            // The msr driver reports EIO for registers the CPU does not have.
            Error::not_supported(format!(
                "failed to read MSR {reg:#x} on CPU {cpu}: {err}"
            ))
        })?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_reg(&self, cpu: usize, reg: u32, val: u64) -> Result<()> {
        let path = self.dev_path(cpu);
        debug!("writing {val:#x} to MSR {reg:#x} on CPU {cpu}");
        let file = OpenOptions::new().write(true).open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::not_supported(format!(
                    "MSR access for CPU {cpu}: '{}' does not exist, is the 'msr' kernel \
                     module loaded?",
                    path.display()
                ))
            } else {
                Error::Other(format!("failed to open '{}': {err}", path.display()))
            }
        })?;

        file.write_all_at(&val.to_le_bytes(), reg as u64)
            .map_err(|err| {
                Error::Other(format!(
                    "failed to write {val:#x} to MSR {reg:#x} on CPU {cpu}: {err}"
                ))
            })
    }

    /// Read MSR `reg` on `cpu`, going through the cache.
    pub fn read(&mut self, cpu: usize, reg: u32) -> Result<u64> {
        if self.enable_cache {
            if let Some(val) = self.cache.get(&(cpu, reg)) {
                return Ok(*val);
            }
        }
        let val = self.read_reg(cpu, reg)?;
        if self.enable_cache {
            self.cache.insert((cpu, reg), val);
        }
        Ok(val)
    }

    /// Read the bit range `bits` of MSR `reg` on `cpu`.
    pub fn read_bits(&mut self, cpu: usize, reg: u32, bits: &RangeInclusive<u32>) -> Result<u64> {
        Ok(get_bits(self.read(cpu, reg)?, bits))
    }

    /// Write MSR `reg` on `cpu`. Inside a transaction the write is buffered.
    pub fn write(&mut self, cpu: usize, reg: u32, val: u64) -> Result<()> {
        self.do_write(cpu, reg, val, None)
    }

    /// Read-modify-write the bit range `bits` of MSR `reg` on `cpu`.
    pub fn write_bits(
        &mut self,
        cpu: usize,
        reg: u32,
        bits: &RangeInclusive<u32>,
        field: u64,
    ) -> Result<()> {
        let old = self.read(cpu, reg)?;
        self.write(cpu, reg, set_bits(old, bits, field))
    }

    /// Write and verify by reading back, with bounded retry.
    pub fn write_verify(
        &mut self,
        cpu: usize,
        reg: u32,
        val: u64,
        retries: u32,
        sleep: Duration,
    ) -> Result<()> {
        self.do_write(cpu, reg, val, Some((retries, sleep)))
    }

    fn do_write(
        &mut self,
        cpu: usize,
        reg: u32,
        val: u64,
        verify: Option<(u32, Duration)>,
    ) -> Result<()> {
        let key = (cpu, reg);

        if let Some(transaction) = &mut self.transaction {
            if let Some(entry) = transaction.entries.get_mut(&key) {
                if entry.verify != verify {
                    return Err(Error::Bug(format!(
                        "conflicting buffered writes for MSR {reg:#x} on CPU {cpu}"
                    )));
                }
                entry.value = val;
            } else {
                transaction.order.push(key);
                transaction.entries.insert(key, TransEntry { value: val, verify });
            }
            if self.enable_cache {
                self.cache.insert(key, val);
            }
            return Ok(());
        }

        self.write_reg(cpu, reg, val)?;
        if self.enable_cache {
            self.cache.insert(key, val);
        }
        if let Some((retries, sleep)) = verify {
            self.verify(cpu, reg, val, retries, sleep)?;
        }
        Ok(())
    }

    fn verify(&self, cpu: usize, reg: u32, val: u64, retries: u32, sleep: Duration) -> Result<()> {
        verify_readback(
            || self.read_reg(cpu, reg).map(|v| format!("{v:#x}")),
            &format!("MSR {reg:#x} on CPU {cpu}"),
            &format!("{val:#x}"),
            retries,
            sleep,
        )
    }

    pub fn cache_remove(&mut self, cpu: usize, reg: u32) {
        self.cache.remove(&(cpu, reg));
    }

    /// Start buffering writes. Same rules as `SysfsIo::start_transaction`.
    pub fn start_transaction(&mut self) -> Result<()> {
        if !self.enable_cache {
            return Ok(());
        }
        if self.transaction.is_some() {
            return Err(Error::Bug("MSR transaction is already started".to_string()));
        }
        self.transaction = Some(Transaction::default());
        Ok(())
    }

    pub fn flush_transaction(&mut self) -> Result<()> {
        let Some(transaction) = self.transaction.take() else {
            return Ok(());
        };

        debug!("flushing {} buffered MSR write(s)", transaction.order.len());
        for key in &transaction.order {
            let entry = &transaction.entries[key];
            self.write_reg(key.0, key.1, entry.value)?;
        }
        for key in &transaction.order {
            let entry = &transaction.entries[key];
            if let Some((retries, sleep)) = entry.verify {
                self.verify(key.0, key.1, entry.value, retries, sleep)?;
            }
        }

        self.transaction = Some(Transaction::default());
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        self.flush_transaction()?;
        self.transaction = None;
        Ok(())
    }
}

impl Default for Msr {
    fn default() -> Self {
        Self::new()
    }
}
