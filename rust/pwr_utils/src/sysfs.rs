// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cached, transactional key-value I/O over sysfs files.
//!
//! Every value read or written goes through a per-path write-through cache
//! (unless caching was disabled at construction). A transaction buffers
//! writes and their verification until [`SysfsIo::commit_transaction`], which
//! applies everything in registration order and then verifies in one pass.
//! Transactions are a batching optimization, not an atomicity guarantee:
//! failure mid-commit leaves earlier writes applied.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::error::{verify_readback, Error, Result};
use crate::ROOT_PREFIX;

#[derive(Debug, Clone, PartialEq)]
struct VerifyInfo {
    retries: u32,
    sleep: Duration,
}

#[derive(Debug, Clone)]
struct TransEntry {
    value: String,
    verify: Option<VerifyInfo>,
}

#[derive(Debug, Default)]
struct Transaction {
    /// Registration order of the keys in `entries`.
    order: Vec<PathBuf>,
    entries: HashMap<PathBuf, TransEntry>,
}

#[derive(Debug)]
pub struct SysfsIo {
    root: PathBuf,
    enable_cache: bool,
    cache: HashMap<PathBuf, String>,
    transaction: Option<Transaction>,
}

impl SysfsIo {
    pub fn new() -> SysfsIo {
        let root = if ROOT_PREFIX.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(&*ROOT_PREFIX)
        };
        Self::with_root(root, true)
    }

    /// Build a service rooted at `root` ("/sys/..." paths are resolved under
    /// it). Tests point this at a tempdir.
    pub fn with_root<P: AsRef<Path>>(root: P, enable_cache: bool) -> SysfsIo {
        SysfsIo {
            root: root.as_ref().to_path_buf(),
            enable_cache,
            cache: HashMap::new(),
            transaction: None,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        match std::fs::read_to_string(&full) {
            Ok(val) => Ok(val.trim().trim_end_matches('\0').to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("'{path}'")))
            }
            Err(err) => Err(Error::Other(format!("failed to read '{path}': {err}"))),
        }
    }

    fn write_file(&self, path: &str, value: &str) -> Result<()> {
        let full = self.resolve(path);
        debug!("writing '{value}' to '{path}'");
        match std::fs::write(&full, value) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("'{path}'")))
            }
            Err(err) => Err(Error::Other(format!(
                "failed to write '{value}' to '{path}': {err}"
            ))),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    /// Read the (trimmed) contents of `path`, going through the cache.
    pub fn read(&mut self, path: &str) -> Result<String> {
        let key = self.resolve(path);
        if self.enable_cache {
            if let Some(val) = self.cache.get(&key) {
                return Ok(val.clone());
            }
        }
        let val = self.read_file(path)?;
        if self.enable_cache {
            self.cache.insert(key, val.clone());
        }
        Ok(val)
    }

    pub fn read_int(&mut self, path: &str) -> Result<i64> {
        let val = self.read(path)?;
        val.parse::<i64>().map_err(|_| {
            Error::BadFormat(format!("failed to parse '{val}' from '{path}' as an integer"))
        })
    }

    /// Write `value` to `path`. Inside a transaction the write is buffered.
    pub fn write(&mut self, path: &str, value: &str) -> Result<()> {
        self.do_write(path, value, None)
    }

    /// Write `value` to `path` and verify by reading it back, retrying up to
    /// `retries` times with `sleep` between attempts. Mismatch after the
    /// last attempt raises [`Error::VerifyFailed`]. Inside a transaction the
    /// write and its verification are deferred to the commit.
    pub fn write_verify(
        &mut self,
        path: &str,
        value: &str,
        retries: u32,
        sleep: Duration,
    ) -> Result<()> {
        self.do_write(path, value, Some(VerifyInfo { retries, sleep }))
    }

    fn do_write(&mut self, path: &str, value: &str, verify: Option<VerifyInfo>) -> Result<()> {
        let key = self.resolve(path);

        if let Some(transaction) = &mut self.transaction {
            if let Some(entry) = transaction.entries.get_mut(&key) {
                // Same key, different verification metadata is a programming
                // error, not something to silently merge.
                if entry.verify != verify {
                    return Err(Error::Bug(format!(
                        "conflicting buffered writes for '{path}'"
                    )));
                }
                entry.value = value.to_string();
            } else {
                transaction.order.push(key.clone());
                transaction.entries.insert(
                    key.clone(),
                    TransEntry {
                        value: value.to_string(),
                        verify,
                    },
                );
            }
            if self.enable_cache {
                self.cache.insert(key, value.to_string());
            }
            return Ok(());
        }

        self.write_file(path, value)?;
        if self.enable_cache {
            self.cache.insert(key, value.to_string());
        }
        if let Some(info) = verify {
            self.verify(path, value, &info)?;
        }
        Ok(())
    }

    fn verify(&self, path: &str, expected: &str, info: &VerifyInfo) -> Result<()> {
        // Verification reads bypass the cache, the point is to observe what
        // the kernel actually accepted.
        verify_readback(
            || self.read_file(path),
            &format!("'{path}'"),
            expected,
            info.retries,
            info.sleep,
        )
    }

    pub fn cache_get(&self, path: &str) -> Option<&String> {
        self.cache.get(&self.resolve(path))
    }

    pub fn cache_add(&mut self, path: &str, value: &str) {
        if self.enable_cache {
            self.cache.insert(self.resolve(path), value.to_string());
        }
    }

    pub fn cache_remove(&mut self, path: &str) {
        self.cache.remove(&self.resolve(path));
    }

    /// Start buffering writes. No-op when caching is disabled. Starting a
    /// transaction while one is open is a bug.
    pub fn start_transaction(&mut self) -> Result<()> {
        if !self.enable_cache {
            return Ok(());
        }
        if self.transaction.is_some() {
            return Err(Error::Bug("transaction is already started".to_string()));
        }
        self.transaction = Some(Transaction::default());
        Ok(())
    }

    /// Apply all buffered writes in registration order, then run the
    /// verification pass. The transaction stays open. No-op when caching is
    /// disabled or no transaction is open.
    pub fn flush_transaction(&mut self) -> Result<()> {
        let Some(transaction) = self.transaction.take() else {
            return Ok(());
        };

        debug!("flushing {} buffered write(s)", transaction.order.len());
        for key in &transaction.order {
            let entry = &transaction.entries[key];
            let path = format!("/{}", key.strip_prefix(&self.root).unwrap_or(key).display());
            self.write_file(&path, &entry.value)?;
        }
        for key in &transaction.order {
            let entry = &transaction.entries[key];
            if let Some(info) = &entry.verify {
                let path = format!("/{}", key.strip_prefix(&self.root).unwrap_or(key).display());
                self.verify(&path, &entry.value, info)?;
            }
        }

        self.transaction = Some(Transaction::default());
        Ok(())
    }

    /// Flush and close the transaction. No-op when caching is disabled or no
    /// transaction is open.
    pub fn commit_transaction(&mut self) -> Result<()> {
        self.flush_transaction()?;
        self.transaction = None;
        Ok(())
    }
}

impl Default for SysfsIo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, SysfsIo) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sys/test")).unwrap();
        let sysfs = SysfsIo::with_root(dir.path(), true);
        (dir, sysfs)
    }

    #[test]
    fn read_write_cache() {
        let (dir, mut sysfs) = setup();
        std::fs::write(dir.path().join("sys/test/knob"), "42\n").unwrap();

        assert_eq!(sysfs.read("/sys/test/knob").unwrap(), "42");
        assert_eq!(sysfs.read_int("/sys/test/knob").unwrap(), 42);

        // Cached: changing the file behind the cache's back is not observed.
        std::fs::write(dir.path().join("sys/test/knob"), "43\n").unwrap();
        assert_eq!(sysfs.read("/sys/test/knob").unwrap(), "42");
        sysfs.cache_remove("/sys/test/knob");
        assert_eq!(sysfs.read("/sys/test/knob").unwrap(), "43");

        sysfs.write("/sys/test/knob", "7").unwrap();
        assert_eq!(sysfs.read("/sys/test/knob").unwrap(), "7");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sys/test/knob")).unwrap(),
            "7"
        );
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, mut sysfs) = setup();
        match sysfs.read("/sys/test/nope") {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn write_verify_ok() {
        let (_dir, mut sysfs) = setup();
        std::fs::write(sysfs.resolve("/sys/test/knob"), "0").unwrap();
        sysfs
            .write_verify("/sys/test/knob", "5", 0, Duration::ZERO)
            .unwrap();
        assert_eq!(sysfs.read("/sys/test/knob").unwrap(), "5");
    }

    #[test]
    fn transaction_batches_writes() {
        let (dir, mut sysfs) = setup();
        let path = dir.path().join("sys/test/knob");
        std::fs::write(&path, "0").unwrap();

        sysfs.start_transaction().unwrap();
        sysfs.write("/sys/test/knob", "1").unwrap();
        // Buffered: the file is untouched, but the cache already serves the
        // new value.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
        assert_eq!(sysfs.read("/sys/test/knob").unwrap(), "1");

        sysfs.write("/sys/test/knob", "2").unwrap();
        sysfs.commit_transaction().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2");
    }

    #[test]
    fn transaction_invariants() {
        let (_dir, mut sysfs) = setup();
        sysfs.start_transaction().unwrap();
        match sysfs.start_transaction() {
            Err(Error::Bug(_)) => {}
            other => panic!("expected Bug, got {other:?}"),
        }

        sysfs.write("/sys/test/knob", "1").unwrap();
        match sysfs.write_verify("/sys/test/knob", "2", 1, Duration::ZERO) {
            Err(Error::Bug(_)) => {}
            other => panic!("expected Bug on conflicting metadata, got {other:?}"),
        }
    }

    #[test]
    fn transaction_noop_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sys/test")).unwrap();
        let mut sysfs = SysfsIo::with_root(dir.path(), false);

        sysfs.start_transaction().unwrap();
        sysfs.start_transaction().unwrap();
        sysfs.write("/sys/test/knob", "1").unwrap();
        // Not buffered: caching is off, so the write went straight through.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sys/test/knob")).unwrap(),
            "1"
        );
        sysfs.commit_transaction().unwrap();
        sysfs.commit_transaction().unwrap();
    }
}
