// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU masks and cpulist strings.
//!
//! A [`Cpumask`] is a dynamically sized `BitVec` of `u64`s plus helpers for
//! creating, manipulating and formatting it. Masks can be built from Linux
//! cpulist strings ("0-3,7"), from hexadecimal mask strings ("0xf0"), or bit
//! by bit. `Display` renders the rangified cpulist form, which is also the
//! format used throughout error messages and the CLI.

use std::fmt;
use std::ops::{BitAndAssign, BitOrAssign};

use bitvec::prelude::*;
use sscanf::sscanf;

use crate::error::{Error, Result};

#[derive(Debug, Default, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// Build a new empty Cpumask.
    pub fn new() -> Cpumask {
        Cpumask::default()
    }

    /// Build a Cpumask from a Linux cpulist string, e.g. "0-3,6,8-9".
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu);
        }
        Ok(mask)
    }

    /// Build a Cpumask from a hexadecimal mask string, e.g. "0xf0" or "f0".
    pub fn from_hex_str(cpumask: &str) -> Result<Cpumask> {
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec = hex::decode(&hex_str)
            .map_err(|_| Error::BadFormat(format!("failed to parse cpumask '{cpumask}'")))?;

        let mut mask = Cpumask::new();
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                mask.set_cpu(index * 8 + lsb);
            }
        }
        Ok(mask)
    }

    /// Set a bit in the Cpumask, growing the mask if needed.
    pub fn set_cpu(&mut self, cpu: usize) {
        if cpu >= self.mask.len() {
            self.mask.resize(cpu + 1, false);
        }
        self.mask.set(cpu, true);
    }

    /// Clear a bit from the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) {
        if cpu < self.mask.len() {
            self.mask.set(cpu, false);
        }
    }

    /// Test whether the specified CPU bit is set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// Iterate over the indices of the set bits, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }

    /// Collect the set bits into a vector of CPU numbers.
    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        let mut rhs = rhs.mask.clone();
        rhs.resize(self.mask.len().max(rhs.len()), false);
        self.mask.resize(rhs.len(), false);
        self.mask &= rhs;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        let mut rhs = rhs.mask.clone();
        rhs.resize(self.mask.len().max(rhs.len()), false);
        self.mask.resize(rhs.len(), false);
        self.mask |= rhs;
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_cpulist(&self.to_vec()))
    }
}

/// Parse a Linux cpulist string ("0-3,6") into an ordered list of CPU
/// numbers. Duplicates are preserved the way the kernel reports them, which
/// in practice means there are none.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    if cpulist.is_empty() {
        return Ok(Vec::new());
    }

    let mut nums = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    return Err(Error::BadFormat(format!(
                        "failed to parse cpulist element '{}'",
                        group.trim()
                    )));
                }
            },
        };
        if min > max {
            return Err(Error::BadFormat(format!(
                "bad range '{}': {min} is greater than {max}",
                group.trim()
            )));
        }
        for i in min..=max {
            nums.push(i);
        }
    }

    Ok(nums)
}

/// Format a list of numbers as a rangified cpulist string: [0, 1, 2, 7]
/// becomes "0-2,7". The input does not have to be sorted.
pub fn format_cpulist(nums: &[usize]) -> String {
    let mut nums: Vec<usize> = nums.to_vec();
    nums.sort_unstable();
    nums.dedup();

    let mut ranges: Vec<String> = vec![];
    let mut idx = 0;
    while idx < nums.len() {
        let start = nums[idx];
        let mut end = start;
        while idx + 1 < nums.len() && nums[idx + 1] == end + 1 {
            idx += 1;
            end = nums[idx];
        }
        if start == end {
            ranges.push(format!("{start}"));
        } else {
            ranges.push(format!("{start}-{end}"));
        }
        idx += 1;
    }

    ranges.join(",")
}
