//! CPU pinning topology.
//!
//! When `limits.cpu` holds a cpuset expression instead of a plain count,
//! the requested host CPUs are resolved against the host topology to build
//! a guest socket/core/thread layout plus a vCPU to host-CPU pinning map.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::{Error, Result};

/// One schedulable host CPU with its position in the physical topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostThread {
    /// Kernel CPU id, as used by sched_setaffinity.
    pub id: u64,
    pub socket: u64,
    pub core: u64,
    pub thread: u64,
}

/// Host CPU enumeration, sockets to cores to threads with stable ids.
#[derive(Debug, Clone)]
pub struct HostTopology {
    threads: Vec<HostThread>,
}

impl HostTopology {
    pub fn from_threads(threads: Vec<HostThread>) -> Self {
        Self { threads }
    }

    /// Enumerate the host CPUs from sysfs.
    pub fn detect() -> Result<Self> {
        Self::detect_from(Path::new("/sys/devices/system/cpu"))
    }

    fn detect_from(base: &Path) -> Result<Self> {
        let online = fs::read_to_string(base.join("online"))
            .map_err(|e| Error::context(format!("Failed reading CPU online mask: {e}")))?;
        let cpu_ids = parse_cpuset(online.trim())?;

        let mut threads = Vec::with_capacity(cpu_ids.len());
        let mut sibling_count: BTreeMap<(u64, u64), u64> = BTreeMap::new();
        for id in cpu_ids {
            let topo = base.join(format!("cpu{id}/topology"));
            let socket = read_id(&topo.join("physical_package_id"))?;
            let core = read_id(&topo.join("core_id"))?;

            // Thread number within the core, in enumeration order.
            let thread = sibling_count.entry((socket, core)).or_insert(0);
            threads.push(HostThread {
                id,
                socket,
                core,
                thread: *thread,
            });
            *thread += 1;
        }

        Ok(Self { threads })
    }

    fn find(&self, id: u64) -> Option<&HostThread> {
        self.threads.iter().find(|t| t.id == id)
    }
}

fn read_id(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::context(format!("Failed reading {}: {e}", path.display())))?;
    content
        .trim()
        .parse()
        .map_err(|_| Error::context(format!("Unparseable topology id in {}", path.display())))
}

/// Guest CPU layout solved from a cpuset expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    pub sockets: u64,
    pub cores: u64,
    pub threads: u64,
    /// Pinning map: vCPU index to host CPU id, preserving cpuset order.
    pub vcpus: Vec<u64>,
}

impl CpuTopology {
    pub fn vcpu_count(&self) -> u64 {
        self.vcpus.len() as u64
    }
}

/// Parse a cpuset expression: comma-separated ids and `a-b` ranges.
/// Duplicates are collapsed, first occurrence wins.
pub fn parse_cpuset(set: &str) -> Result<Vec<u64>> {
    let invalid = |reason: &str| Error::InvalidConfig {
        key: "limits.cpu".into(),
        reason: format!("{set:?}: {reason}"),
    };

    let mut pins = Vec::new();
    let mut push = |id: u64| {
        if !pins.contains(&id) {
            pins.push(id);
        }
    };

    for field in set.split(',') {
        let field = field.trim();
        if field.is_empty() {
            return Err(invalid("empty field"));
        }

        match field.split_once('-') {
            Some((low, high)) => {
                let low: u64 = low.trim().parse().map_err(|_| invalid("bad range start"))?;
                let high: u64 = high.trim().parse().map_err(|_| invalid("bad range end"))?;
                if low > high {
                    return Err(invalid("range start after end"));
                }
                for id in low..=high {
                    push(id);
                }
            }
            None => push(field.parse().map_err(|_| invalid("not a CPU id"))?),
        }
    }

    Ok(pins)
}

/// Resolve a cpuset expression against the host topology.
///
/// The layout is valid when every matched socket contributes the same
/// number of cores, every core the same number of threads, and the product
/// equals the pin count. Otherwise we fall back to one socket of
/// single-thread cores and log a warning.
pub fn solve(host: &HostTopology, name: &str, limit: &str) -> Result<CpuTopology> {
    let pins = parse_cpuset(limit)?;

    let mut matched = Vec::with_capacity(pins.len());
    for pin in &pins {
        match host.find(*pin) {
            Some(thread) => matched.push(*thread),
            None => {
                return Err(Error::InvalidConfig {
                    key: "limits.cpu".into(),
                    reason: format!("Unavailable CPUs requested: {limit}"),
                })
            }
        }
    }

    // Cores seen per socket and threads seen per core.
    let mut socket_cores: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    let mut core_threads: BTreeMap<(u64, u64), Vec<u64>> = BTreeMap::new();
    for t in &matched {
        let cores = socket_cores.entry(t.socket).or_default();
        if !cores.contains(&t.core) {
            cores.push(t.core);
        }
        let threads = core_threads.entry((t.socket, t.core)).or_default();
        if !threads.contains(&t.thread) {
            threads.push(t.thread);
        }
    }

    let vcpus: Vec<u64> = pins;

    let cores_per_socket = uniform_len(socket_cores.values());
    let threads_per_core = uniform_len(core_threads.values());

    let valid = match (cores_per_socket, threads_per_core) {
        (Some(cores), Some(threads)) => {
            socket_cores.len() as u64 * cores * threads == vcpus.len() as u64
        }
        _ => false,
    };

    if !valid {
        warn!(
            instance = name,
            cpuset = limit,
            "CPU pinning doesn't match hardware layout, falling back to flat core topology"
        );
        return Ok(CpuTopology {
            sockets: 1,
            cores: vcpus.len() as u64,
            threads: 1,
            vcpus,
        });
    }

    Ok(CpuTopology {
        sockets: socket_cores.len() as u64,
        cores: cores_per_socket.unwrap_or(0),
        threads: threads_per_core.unwrap_or(0),
        vcpus,
    })
}

fn uniform_len<'a, I, T: 'a>(groups: I) -> Option<u64>
where
    I: Iterator<Item = &'a Vec<T>>,
{
    let mut len = None;
    for group in groups {
        match len {
            None => len = Some(group.len() as u64),
            Some(expected) if expected != group.len() as u64 => return None,
            Some(_) => {}
        }
    }
    len
}
