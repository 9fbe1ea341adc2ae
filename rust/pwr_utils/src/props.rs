// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Property descriptors and values.
//!
//! Every knob a subsystem exposes is described by a static [`PropDesc`]:
//! name, value type, unit, writability, scope, and the ordered list of
//! mechanisms that can serve it. The scope (`sname`) is the granularity at
//! which the value is guaranteed uniform; the I/O scope (`iosname`) is the
//! granularity at which the backing register or file is physically read,
//! which may differ (e.g. a package-scope value backed by a per-core MSR).

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::human;

/// Granularity levels of the topology hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    Cpu,
    Core,
    Module,
    Die,
    Package,
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Cpu => "CPU",
            Scope::Core => "core",
            Scope::Module => "module",
            Scope::Die => "die",
            Scope::Package => "package",
            Scope::Global => "global",
        };
        write!(f, "{name}")
    }
}

/// Techniques for reaching a property's backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mechanism {
    Sysfs,
    Msr,
    Tpmi,
    Cdev,
    /// Documentation-only: the value is known from specs, not readable from
    /// the running system. Never writable.
    Doc,
}

impl Mechanism {
    /// Whether the mechanism is capable of writes at all. Individual
    /// properties may still be read-only.
    pub fn writable(&self) -> bool {
        !matches!(self, Mechanism::Doc)
    }

    pub fn short(&self) -> &'static str {
        match self {
            Mechanism::Sysfs => "sysfs",
            Mechanism::Msr => "MSR",
            Mechanism::Tpmi => "TPMI",
            Mechanism::Cdev => "cdev",
            Mechanism::Doc => "doc",
        }
    }

    pub fn long(&self) -> &'static str {
        match self {
            Mechanism::Sysfs => "Linux sysfs file-system",
            Mechanism::Msr => "Model Specific Register (MSR)",
            Mechanism::Tpmi => "Topology Aware Register and PM Capsule Interface (TPMI)",
            Mechanism::Cdev => "Linux character device node",
            Mechanism::Doc => "Hardware documentation",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl FromStr for Mechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Mechanism> {
        match s.to_lowercase().as_str() {
            "sysfs" => Ok(Mechanism::Sysfs),
            "msr" => Ok(Mechanism::Msr),
            "tpmi" => Ok(Mechanism::Tpmi),
            "cdev" => Ok(Mechanism::Cdev),
            "doc" => Ok(Mechanism::Doc),
            _ => Err(Error::BadFormat(format!(
                "unknown mechanism '{s}', use one of: sysfs, msr, tpmi, cdev, doc"
            ))),
        }
    }
}

/// Value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Bool,
    Int,
    Float,
    Str,
    IntList,
    StrList,
}

/// A property value. Booleans render as "on"/"off".
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
}

impl PropValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(true) => write!(f, "on"),
            PropValue::Bool(false) => write!(f, "off"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::IntList(v) => {
                let strs: Vec<String> = v.iter().map(|n| n.to_string()).collect();
                write!(f, "{}", strs.join(","))
            }
            PropValue::StrList(v) => write!(f, "{}", v.join(",")),
        }
    }
}

/// Static description of one property.
#[derive(Debug, Clone)]
pub struct PropDesc {
    /// Property name, the key used throughout the API.
    pub name: &'static str,
    /// Human-readable label for messages ("Max. CPU frequency").
    pub label: &'static str,
    pub dtype: DType,
    /// Native unit of numeric values, e.g. "Hz" or "us".
    pub unit: Option<&'static str>,
    pub writable: bool,
    /// Scope. `None` means the scope depends on the platform and is
    /// resolved lazily through the backend.
    pub sname: Option<Scope>,
    /// I/O scope. Defaults to `sname` when equal; corrected by the adapter
    /// when the backing store is at a different granularity.
    pub iosname: Option<Scope>,
    /// Supported mechanisms, in preference order.
    pub mnames: &'static [Mechanism],
    /// Special string values passed through unconverted ("min", "max").
    pub special_vals: &'static [&'static str],
    /// Read-only sub-properties that only make sense when this one is
    /// supported.
    pub subprops: &'static [&'static str],
}

impl PropDesc {
    /// Normalize and validate a user-supplied input value for this property.
    /// Special values are passed through as strings for the adapter to
    /// interpret contextually.
    pub fn normalize_input(&self, val: &str) -> Result<PropValue> {
        if self.dtype == DType::Bool {
            return self.normalize_bool(val);
        }

        if self.special_vals.iter().any(|s| *s == val) {
            return Ok(PropValue::Str(val.to_string()));
        }

        match self.dtype {
            DType::Int => {
                if let Ok(num) = val.trim().parse::<i64>() {
                    return Ok(PropValue::Int(num));
                }
                if let Some(unit) = self.unit {
                    // Not a bare number: presumably a value with a unit,
                    // such as "100MHz".
                    let name = human::uncapitalize(self.label);
                    return Ok(PropValue::Int(human::parse_int_quantity(val, unit, &name)?));
                }
                Err(self.bad_value(val, "an integer"))
            }
            DType::Float => {
                if let Ok(num) = val.trim().parse::<f64>() {
                    return Ok(PropValue::Float(num));
                }
                if let Some(unit) = self.unit {
                    let name = human::uncapitalize(self.label);
                    return Ok(PropValue::Float(human::parse_quantity(val, unit, &name)?));
                }
                Err(self.bad_value(val, "a number"))
            }
            DType::Str => Ok(PropValue::Str(val.to_string())),
            DType::IntList | DType::StrList => Err(Error::Other(format!(
                "{} is a list property and cannot be set directly",
                human::uncapitalize(self.label)
            ))),
            DType::Bool => unreachable!(),
        }
    }

    fn normalize_bool(&self, val: &str) -> Result<PropValue> {
        match val.to_lowercase().as_str() {
            "true" | "on" | "enable" => Ok(PropValue::Bool(true)),
            "false" | "off" | "disable" => Ok(PropValue::Bool(false)),
            _ => Err(Error::BadFormat(format!(
                "bad value '{val}' for {}, use one of: true, false, on, off, enable, disable",
                human::uncapitalize(self.label)
            ))),
        }
    }

    fn bad_value(&self, val: &str, expected: &str) -> Error {
        Error::BadFormat(format!(
            "bad value '{val}' for {}, expected {expected}",
            human::uncapitalize(self.label)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: PropDesc = PropDesc {
        name: "max_freq",
        label: "Max. CPU frequency",
        dtype: DType::Int,
        unit: Some("Hz"),
        writable: true,
        sname: Some(Scope::Cpu),
        iosname: Some(Scope::Cpu),
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        special_vals: &["min", "max"],
        subprops: &[],
    };

    const TURBO: PropDesc = PropDesc {
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
    };

    #[test]
    fn bool_normalization() {
        assert_eq!(TURBO.normalize_input("on").unwrap(), PropValue::Bool(true));
        assert_eq!(TURBO.normalize_input("ON").unwrap(), PropValue::Bool(true));
        assert_eq!(
            TURBO.normalize_input("disable").unwrap(),
            PropValue::Bool(false)
        );
        assert!(TURBO.normalize_input("bogus").is_err());
        assert_eq!(PropValue::Bool(true).to_string(), "on");
        assert_eq!(PropValue::Bool(false).to_string(), "off");
    }

    #[test]
    fn quantity_normalization() {
        assert_eq!(
            FREQ.normalize_input("800MHz").unwrap(),
            PropValue::Int(800_000_000)
        );
        assert_eq!(
            FREQ.normalize_input("1600000").unwrap(),
            PropValue::Int(1_600_000)
        );
        assert_eq!(
            FREQ.normalize_input("min").unwrap(),
            PropValue::Str("min".to_string())
        );
        assert!(FREQ.normalize_input("fast").is_err());
    }

    #[test]
    fn mechanism_parsing() {
        assert_eq!("sysfs".parse::<Mechanism>().unwrap(), Mechanism::Sysfs);
        assert_eq!("MSR".parse::<Mechanism>().unwrap(), Mechanism::Msr);
        assert!("ouija".parse::<Mechanism>().is_err());
        assert!(!Mechanism::Doc.writable());
        assert!(Mechanism::Tpmi.writable());
    }
}
