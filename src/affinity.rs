//! CPU placement checks
//!
//! Each measurement role busy-loops on its own core, so misplacement is
//! not a performance footnote: an unsynchronized TSC invalidates every
//! timestamp and a cross-NUMA port placement costs memory latency on the
//! hot path. Pinning failures and TSC skew are fatal; NUMA mismatch only
//! warns, matching how much each actually breaks.

use std::fs;

use thiserror::Error;
use tracing::{info, warn};

use crate::tsc::rdtsc;

#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("can't pin thread to core #{core}: {source}")]
    Pin {
        core: usize,
        #[source]
        source: nix::Error,
    },
    #[error("core #{core} is out of range for this machine")]
    InvalidCore { core: usize },
    #[error("TSC of core #{core} for {role} is not synchronized with the main core")]
    TscNotSynchronized { core: usize, role: &'static str },
    #[error("TSC check thread for {role} panicked")]
    CheckFailed { role: &'static str },
}

/// Pins the calling thread to `core`.
pub fn pin_to_core(core: usize) -> Result<(), AffinityError> {
    let mut cpu_set = nix::sched::CpuSet::new();
    cpu_set
        .set(core)
        .map_err(|_| AffinityError::InvalidCore { core })?;
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpu_set)
        .map_err(|source| AffinityError::Pin { core, source })
}

/// Verifies that the TSC of `core` is synchronized with the calling
/// core's by a round-trip sample: a value read on `core` must fall
/// between two values read here. TSCs of distinct physical packages may
/// drift, which would silently corrupt every latency figure.
pub fn check_tsc_sync(core: usize, role: &'static str) -> Result<(), AffinityError> {
    let tsc_before = rdtsc();
    let reported = std::thread::spawn(move || -> Result<u64, AffinityError> {
        pin_to_core(core)?;
        Ok(rdtsc())
    })
    .join()
    .map_err(|_| AffinityError::CheckFailed { role })??;
    let tsc_after = rdtsc();

    if reported < tsc_before || reported > tsc_after {
        return Err(AffinityError::TscNotSynchronized { core, role });
    }
    info!("TSC of core #{core} for {role} is synchronized with the main core");
    Ok(())
}

/// Number of configured NUMA nodes; 0 when the machine exposes none.
pub fn num_numa_nodes() -> usize {
    let Ok(entries) = fs::read_dir("/sys/devices/system/node") else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix("node")
                .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        })
        .count()
}

fn numa_node_of_cpu(core: usize) -> Option<u32> {
    let dir = format!("/sys/devices/system/cpu/cpu{core}");
    for entry in fs::read_dir(dir).ok()?.filter_map(Result::ok) {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if let Some(id) = name.strip_prefix("node") {
            if let Ok(id) = id.parse() {
                return Some(id);
            }
        }
    }
    None
}

fn numa_node_of_port(interface: &str) -> Option<u32> {
    let text = fs::read_to_string(format!("/sys/class/net/{interface}/device/numa_node")).ok()?;
    text.trim().parse::<i32>().ok().and_then(|n| u32::try_from(n).ok())
}

/// Warns when a port and the core working it sit on different NUMA nodes.
pub fn numa_check(interface: &str, port_side: &str, core: usize, role: &str) {
    match (numa_node_of_port(interface), numa_node_of_cpu(core)) {
        (Some(port_node), Some(cpu_node)) if port_node == cpu_node => {
            info!("{port_side} port and {role} CPU core belong to the same NUMA node: {port_node}");
        }
        (Some(port_node), Some(cpu_node)) => {
            warn!(
                "{port_side} port and {role} CPU core belong to NUMA nodes {port_node}, {cpu_node}, respectively"
            );
        }
        _ => {
            info!("no NUMA information for {port_side} port ({interface}) or core #{core}");
        }
    }
}
