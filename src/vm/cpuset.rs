//! CPU and NUMA-node index sets
//!
//! [`CpuSet`] is the mask type used everywhere a placement decision names
//! host CPUs: vCPU pinning, emulator pinning, cpuset cgroup writes, and the
//! legacy affinity syscall. It parses and formats the kernel list syntax
//! ("0-3,8") used by sysfs and the cgroup filesystem, so the same type also
//! serves for NUMA node sets.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{VmError, VmResult};

/// Sysfs file listing the online host CPUs, in kernel list syntax.
const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

/// An ordered set of CPU (or NUMA node) indices.
///
/// The empty set means "don't constrain".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

/// NUMA node sets share the list syntax and the set semantics.
pub type NodeSet = CpuSet;

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from explicit indices.
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            cpus: indices.into_iter().collect(),
        }
    }

    pub fn set(&mut self, cpu: usize) {
        self.cpus.insert(cpu);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    /// Convert to the fixed-size mask consumed by sched_setaffinity.
    pub fn to_sched_set(&self) -> VmResult<nix::sched::CpuSet> {
        let mut set = nix::sched::CpuSet::new();
        for cpu in self.iter() {
            set.set(cpu)
                .map_err(|e| VmError::errno(format!("cpu {cpu} out of affinity mask range"), e))?;
        }
        Ok(set)
    }

    /// Build from a kernel affinity mask (e.g. the result of
    /// sched_getaffinity).
    pub fn from_sched_set(set: &nix::sched::CpuSet) -> Self {
        let mut cpus = BTreeSet::new();
        for cpu in 0..nix::sched::CpuSet::count() {
            if matches!(set.is_set(cpu), Ok(true)) {
                cpus.insert(cpu);
            }
        }
        Self { cpus }
    }
}

impl FromStr for CpuSet {
    type Err = VmError;

    /// Parse kernel list syntax: comma-separated indices and inclusive
    /// ranges, e.g. "0-3,8,10-11". The empty string is the empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cpus = BTreeSet::new();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self { cpus });
        }
        for part in trimmed.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: usize = lo
                        .trim()
                        .parse()
                        .map_err(|_| VmError::Internal(format!("bad cpu list range '{part}'")))?;
                    let hi: usize = hi
                        .trim()
                        .parse()
                        .map_err(|_| VmError::Internal(format!("bad cpu list range '{part}'")))?;
                    if lo > hi {
                        return Err(VmError::Internal(format!("bad cpu list range '{part}'")));
                    }
                    cpus.extend(lo..=hi);
                }
                None => {
                    let cpu: usize = part
                        .parse()
                        .map_err(|_| VmError::Internal(format!("bad cpu list entry '{part}'")))?;
                    cpus.insert(cpu);
                }
            }
        }
        Ok(Self { cpus })
    }
}

impl fmt::Display for CpuSet {
    /// Format in kernel list syntax, collapsing runs into ranges.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.cpus.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next != end + 1 {
                    break;
                }
                end = next;
                iter.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for CpuSet {
    type Error = VmError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CpuSet> for String {
    fn from(set: CpuSet) -> String {
        set.to_string()
    }
}

/// All online host CPUs, read from sysfs.
///
/// A freshly spawned VMM inherits the affinity of this controller process,
/// so callers that want "unconstrained" must apply this set explicitly
/// rather than leaving the ambient mask in place.
pub fn host_online_cpus() -> VmResult<CpuSet> {
    online_cpus_from(Path::new(ONLINE_CPUS_PATH))
}

fn online_cpus_from(path: &Path) -> VmResult<CpuSet> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| VmError::system(format!("read {}", path.display()), e))?;
    raw.trim().parse()
}

/// Union of the CPU lists of the given NUMA nodes, read from
/// `/sys/devices/system/node/node<N>/cpulist`.
pub fn nodeset_to_cpus(nodes: &NodeSet) -> VmResult<CpuSet> {
    let mut cpus = CpuSet::new();
    for node in nodes.iter() {
        let path = format!("/sys/devices/system/node/node{node}/cpulist");
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| VmError::system(format!("read {path}"), e))?;
        let node_cpus: CpuSet = raw.trim().parse()?;
        for cpu in node_cpus.iter() {
            cpus.set(cpu);
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_syntax() {
        let set: CpuSet = "0-3,8".parse().unwrap();
        assert_eq!(set.len(), 5);
        assert!(set.contains(0));
        assert!(set.contains(3));
        assert!(set.contains(8));
        assert!(!set.contains(4));
    }

    #[test]
    fn test_parse_empty_is_unconstrained() {
        let set: CpuSet = "".parse().unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("0-".parse::<CpuSet>().is_err());
        assert!("a,b".parse::<CpuSet>().is_err());
        assert!("3-1".parse::<CpuSet>().is_err());
    }

    #[test]
    fn test_format_collapses_ranges() {
        let set = CpuSet::from_indices([0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(set.to_string(), "0-3,8,10-11");
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let set = CpuSet::from_indices([1, 2, 5]);
        let reparsed: CpuSet = set.to_string().parse().unwrap();
        assert_eq!(set, reparsed);
    }

    #[test]
    fn test_sched_set_conversion() {
        let set = CpuSet::from_indices([0, 2]);
        let sched = set.to_sched_set().unwrap();
        let back = CpuSet::from_sched_set(&sched);
        assert_eq!(set, back);
    }

    #[test]
    fn test_online_cpus_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("online");
        std::fs::write(&path, "0-7\n").unwrap();
        let set = online_cpus_from(&path).unwrap();
        assert_eq!(set.len(), 8);
    }
}
