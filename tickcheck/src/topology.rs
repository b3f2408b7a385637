//! CPU topology: affinity, heterogeneous core groups, and the per-CPU
//! microarchitecture table.
//!
//! Counters are CPU-affine, so cross-CPU detection works by pinning the
//! calling thread to each CPU in turn rather than by running anything in
//! parallel. Pinning is a scoped guard that restores the previous mask on
//! every exit path, including errors.

use crate::error::{Error, Result};
use crate::microarch::{self, CpuMicroarch};
use log::{debug, warn};
use perf_event_open_sys::bindings as perf;
use smallvec::SmallVec;
use std::fs;
use std::io;
use std::mem;
use std::path::Path;

/// Resolved identity of one logical CPU: its microarchitecture and the
/// perf event type its counters must be opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuInfo {
    pub microarch: CpuMicroarch,
    pub perf_type: u32,
}

/// A named set of logical CPUs sharing one core design, e.g. the kernel's
/// `cpu_core` / `cpu_atom` PMU devices on hybrid parts. `end_cpu` is
/// exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuGroup {
    pub name: String,
    pub start_cpu: u32,
    pub end_cpu: u32,
    pub perf_type: u32,
}

/// Where CPU affinity and heterogeneous groups come from. Production code
/// uses [`LinuxTopology`]; tests substitute a fixed in-memory topology.
pub trait TopologySource {
    /// Logical CPUs the calling thread is allowed to run on.
    fn initial_affinity(&self) -> &[u32];

    /// Heterogeneous core groups, sorted by `start_cpu`. Empty on machines
    /// with only one kind of core.
    fn cpu_groups(&self) -> &[CpuGroup];

    /// Pin the calling thread to `cpu` until the returned guard drops.
    fn pin_to_cpu(&self, cpu: u32) -> Result<AffinityGuard>;
}

/// Scoped affinity change. Dropping the guard restores the mask that was
/// in effect when it was created.
pub struct AffinityGuard {
    saved: Option<libc::cpu_set_t>,
}

impl AffinityGuard {
    pub(crate) fn pin(cpu: u32) -> Result<AffinityGuard> {
        let size = mem::size_of::<libc::cpu_set_t>();
        let mut saved: libc::cpu_set_t = unsafe { mem::zeroed() };
        if unsafe { libc::sched_getaffinity(0, size, &mut saved) } != 0 {
            return Err(Error::ReadAffinity(io::Error::last_os_error()));
        }

        let mut target: libc::cpu_set_t = unsafe { mem::zeroed() };
        unsafe { libc::CPU_SET(cpu as usize, &mut target) };
        if unsafe { libc::sched_setaffinity(0, size, &target) } != 0 {
            return Err(Error::SetAffinity {
                cpu,
                source: io::Error::last_os_error(),
            });
        }
        Ok(AffinityGuard { saved: Some(saved) })
    }

    /// A guard that restores nothing, for topology sources that don't
    /// manage real affinity.
    pub fn unpinned() -> AffinityGuard {
        AffinityGuard { saved: None }
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            let size = mem::size_of::<libc::cpu_set_t>();
            if unsafe { libc::sched_setaffinity(0, size, &saved) } != 0 {
                warn!(
                    "can't restore CPU affinity: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

/// Topology as reported by the running kernel.
pub struct LinuxTopology {
    affinity: Vec<u32>,
    groups: SmallVec<[CpuGroup; 2]>,
}

impl LinuxTopology {
    pub fn new() -> Result<LinuxTopology> {
        let size = mem::size_of::<libc::cpu_set_t>();
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        if unsafe { libc::sched_getaffinity(0, size, &mut set) } != 0 {
            return Err(Error::ReadAffinity(io::Error::last_os_error()));
        }
        let mut affinity = Vec::new();
        for cpu in 0..libc::CPU_SETSIZE as usize {
            if unsafe { libc::CPU_ISSET(cpu, &set) } {
                affinity.push(cpu as u32);
            }
        }

        let groups = read_cpu_groups(Path::new("/sys/bus/event_source/devices"))?;
        Ok(LinuxTopology { affinity, groups })
    }
}

impl TopologySource for LinuxTopology {
    fn initial_affinity(&self) -> &[u32] {
        &self.affinity
    }

    fn cpu_groups(&self) -> &[CpuGroup] {
        &self.groups
    }

    fn pin_to_cpu(&self, cpu: u32) -> Result<AffinityGuard> {
        AffinityGuard::pin(cpu)
    }
}

/// Heterogeneous PMU devices show up as `cpu_<name>` under the perf
/// event-source directory, each with a `cpus` range and a `type` id.
/// Homogeneous machines expose only `cpu` and report no groups.
fn read_cpu_groups(dir: &Path) -> Result<SmallVec<[CpuGroup; 2]>> {
    let mut groups = SmallVec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("{} not readable ({}); assuming no core groups", dir.display(), err);
            return Ok(groups);
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let device = file_name.to_string_lossy();
        let name = match device.strip_prefix("cpu_") {
            Some(name) => name,
            None => continue,
        };

        let cpus_path = entry.path().join("cpus");
        let cpus_raw = match fs::read_to_string(&cpus_path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!("can't read {} ({}); skipping", cpus_path.display(), err);
                continue;
            }
        };
        let (start_cpu, end_cpu) =
            parse_cpu_range(cpus_raw.trim()).ok_or_else(|| Error::Topology {
                path: cpus_path.display().to_string(),
                detail: format!("malformed CPU range '{}'", cpus_raw.trim()),
            })?;

        let type_path = entry.path().join("type");
        let type_raw = fs::read_to_string(&type_path).map_err(|err| Error::Topology {
            path: type_path.display().to_string(),
            detail: err.to_string(),
        })?;
        let perf_type = type_raw.trim().parse::<u32>().map_err(|err| Error::Topology {
            path: type_path.display().to_string(),
            detail: err.to_string(),
        })?;

        groups.push(CpuGroup {
            name: name.to_owned(),
            start_cpu,
            end_cpu,
            perf_type,
        });
    }

    groups.sort_by_key(|group| group.start_cpu);
    Ok(groups)
}

/// Parse a sysfs CPU list of the form `4-7` or `3` into a half-open
/// range. Groups are contiguous, so comma-separated lists are not
/// expected here.
fn parse_cpu_range(raw: &str) -> Option<(u32, u32)> {
    match raw.split_once('-') {
        Some((start, end)) => {
            let start = start.parse::<u32>().ok()?;
            let end = end.parse::<u32>().ok()?;
            if end < start {
                return None;
            }
            Some((start, end + 1))
        }
        None => {
            let cpu = raw.parse::<u32>().ok()?;
            Some((cpu, cpu + 1))
        }
    }
}

/// Determine the microarchitecture and counter event type of every CPU in
/// the affinity set.
///
/// On machines without heterogeneous groups this returns a single entry
/// that stands for every CPU. With groups, detection is run on one
/// representative CPU per group (plus every ungrouped CPU) and the result
/// is propagated across the group, which avoids scheduling this thread on
/// every single CPU in the system.
pub fn compute_cpus_info(topology: &dyn TopologySource) -> Result<Vec<CpuInfo>> {
    compute_cpus_info_with(topology, &mut microarch::compute_cpu_microarch)
}

pub(crate) fn compute_cpus_info_with(
    topology: &dyn TopologySource,
    detect: &mut dyn FnMut() -> Result<CpuMicroarch>,
) -> Result<Vec<CpuInfo>> {
    let raw = perf::PERF_TYPE_RAW;
    let unresolved = CpuInfo {
        microarch: CpuMicroarch::Unknown,
        perf_type: raw,
    };

    let groups = topology.cpu_groups();
    if groups.is_empty() {
        // Only one kind of CPU core.
        return Ok(vec![CpuInfo {
            microarch: detect()?,
            perf_type: raw,
        }]);
    }

    let mut result: Vec<CpuInfo> = Vec::new();
    for &cpu in topology.initial_affinity() {
        let idx = cpu as usize;
        if idx < result.len() && result[idx].microarch != CpuMicroarch::Unknown {
            // Already covered by a group resolved below.
            continue;
        }
        while result.len() <= idx {
            result.push(unresolved);
        }

        let uarch = {
            let _pinned = topology.pin_to_cpu(cpu)?;
            detect()?
        };
        // May be overwritten below if this CPU is part of a known group.
        result[idx] = CpuInfo {
            microarch: uarch,
            perf_type: raw,
        };

        for group in groups {
            if group.start_cpu <= cpu && cpu < group.end_cpu {
                let resolved = microarch::resolve_hybrid_group(uarch, &group.name)?;
                while result.len() < group.end_cpu as usize {
                    result.push(unresolved);
                }
                for info in &mut result[group.start_cpu as usize..group.end_cpu as usize] {
                    *info = CpuInfo {
                        microarch: resolved,
                        perf_type: group.perf_type,
                    };
                }
                break;
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
pub(crate) struct FakeTopology {
    pub affinity: Vec<u32>,
    pub groups: Vec<CpuGroup>,
}

#[cfg(test)]
impl TopologySource for FakeTopology {
    fn initial_affinity(&self) -> &[u32] {
        &self.affinity
    }

    fn cpu_groups(&self) -> &[CpuGroup] {
        &self.groups
    }

    fn pin_to_cpu(&self, _cpu: u32) -> Result<AffinityGuard> {
        Ok(AffinityGuard::unpinned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microarch::CpuMicroarch::*;

    fn group(name: &str, start_cpu: u32, end_cpu: u32, perf_type: u32) -> CpuGroup {
        CpuGroup {
            name: name.to_owned(),
            start_cpu,
            end_cpu,
            perf_type,
        }
    }

    #[test]
    fn parse_cpu_range_forms() {
        assert_eq!(parse_cpu_range("4-7"), Some((4, 8)));
        assert_eq!(parse_cpu_range("0-15"), Some((0, 16)));
        assert_eq!(parse_cpu_range("3"), Some((3, 4)));
        assert_eq!(parse_cpu_range("7-4"), None);
        assert_eq!(parse_cpu_range("4-"), None);
        assert_eq!(parse_cpu_range("banana"), None);
    }

    #[test]
    fn homogeneous_machine_detects_once() {
        let topology = FakeTopology {
            affinity: vec![0, 1, 2, 3],
            groups: vec![],
        };
        let mut calls = 0;
        let cpus = compute_cpus_info_with(&topology, &mut || {
            calls += 1;
            Ok(IntelIvyBridge)
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(cpus.len(), 1);
        assert_eq!(cpus[0].microarch, IntelIvyBridge);
    }

    #[test]
    fn hybrid_group_propagates_small_core_value() {
        let topology = FakeTopology {
            affinity: (0..8).collect(),
            groups: vec![group("core", 0, 4, 4), group("atom", 4, 8, 8)],
        };
        let mut calls = 0;
        let cpus = compute_cpus_info_with(&topology, &mut || {
            calls += 1;
            Ok(IntelAlderLake)
        })
        .unwrap();

        // One detection per group representative, none for the other
        // members of an already-resolved group.
        assert_eq!(calls, 2);
        assert_eq!(cpus.len(), 8);
        for cpu in 0..4 {
            assert_eq!(
                cpus[cpu],
                CpuInfo {
                    microarch: IntelAlderLake,
                    perf_type: 4
                }
            );
        }
        for cpu in 4..8 {
            assert_eq!(
                cpus[cpu],
                CpuInfo {
                    microarch: IntelGracemont,
                    perf_type: 8
                }
            );
        }
    }

    #[test]
    fn ungrouped_cpus_keep_independent_values() {
        // CPUs 0-3 are outside every group and detected one by one.
        let topology = FakeTopology {
            affinity: (0..8).collect(),
            groups: vec![group("atom", 4, 8, 8)],
        };
        let mut calls = 0;
        let cpus = compute_cpus_info_with(&topology, &mut || {
            calls += 1;
            Ok(IntelMeteorLake)
        })
        .unwrap();

        assert_eq!(calls, 5);
        for cpu in 0..4 {
            assert_eq!(cpus[cpu].microarch, IntelMeteorLake);
            assert_eq!(cpus[cpu].perf_type, perf::PERF_TYPE_RAW);
        }
        for cpu in 4..8 {
            assert_eq!(cpus[cpu].microarch, IntelCrestmont);
            assert_eq!(cpus[cpu].perf_type, 8);
        }
    }

    #[test]
    fn repeated_resolution_is_identical() {
        let topology = FakeTopology {
            affinity: (0..8).collect(),
            groups: vec![group("core", 0, 4, 4), group("atom", 4, 8, 8)],
        };
        let first =
            compute_cpus_info_with(&topology, &mut || Ok(IntelRaptorLake)).unwrap();
        let second =
            compute_cpus_info_with(&topology, &mut || Ok(IntelRaptorLake)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_group_name_fails() {
        let topology = FakeTopology {
            affinity: (0..4).collect(),
            groups: vec![group("mystery", 0, 4, 4)],
        };
        let err =
            compute_cpus_info_with(&topology, &mut || Ok(IntelAlderLake)).unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn detection_errors_propagate() {
        let topology = FakeTopology {
            affinity: vec![0],
            groups: vec![],
        };
        let err = compute_cpus_info_with(&topology, &mut || {
            Err(crate::error::Error::UnknownIntelCpuType { cpu_type: 0xF0FF0 })
        })
        .unwrap_err();
        assert!(err.to_string().contains("0xf0ff0"));
    }
}
