//! Detection and validation of the hardware tick counters a deterministic
//! record/replay engine depends on.
//!
//! [`PmuValidation::init`] identifies the microarchitecture of every CPU
//! the process may run on, resolves the tick-counting event for each, and
//! probes for the hardware and hypervisor defects that would make tick
//! counts non-deterministic. The result is computed once and read-only
//! afterwards.

mod attrs;
mod counter;
mod error;
mod microarch;
mod policy;
mod probes;
mod topology;

pub use crate::attrs::{
    always_recreate_counters, check_restricted_counter_capacity, counter_attrs,
    open_arch_extras, pmu_config, ArchExtras, CounterAttrs, PmuConfig,
};
pub use crate::counter::PerfCounter;
pub use crate::error::{Error, Result};
pub use crate::microarch::{compute_cpu_microarch, CpuMicroarch};
pub use crate::policy::Flags;
pub use crate::probes::{check_for_arch_bugs, probe_plan, BugCheck, ProbePlan, NUM_BRANCHES};
pub use crate::topology::{
    compute_cpus_info, AffinityGuard, CpuGroup, CpuInfo, LinuxTopology, TopologySource,
};

/// The per-CPU microarchitecture table, counter configuration, and defect
/// probe results for this machine.
pub struct PmuValidation {
    cpus: Vec<CpuInfo>,
    attrs: CounterAttrs,
    bugs: BugCheck,
}

impl PmuValidation {
    /// Validate the machine described by `topology`. Probes run pinned to
    /// the first CPU in the affinity set; detection visits one CPU per
    /// heterogeneous group.
    pub fn init(topology: &dyn TopologySource, flags: Flags) -> Result<PmuValidation> {
        let cpus = topology::compute_cpus_info(topology)?;
        let probe_cpu = topology
            .initial_affinity()
            .first()
            .copied()
            .ok_or(Error::EmptyAffinity)?;
        // On a homogeneous machine the table has one entry standing for
        // every CPU.
        let info = cpus
            .get(probe_cpu as usize)
            .or_else(|| cpus.first())
            .copied()
            .ok_or(Error::EmptyAffinity)?;
        let attrs = attrs::counter_attrs(&info)?;
        let bugs = {
            let _pinned = topology.pin_to_cpu(probe_cpu)?;
            probes::check_for_arch_bugs(&attrs.ticks, info.microarch, flags)?
        };
        Ok(PmuValidation { cpus, attrs, bugs })
    }

    /// Validate using the running kernel's topology.
    pub fn init_for_this_machine(flags: Flags) -> Result<PmuValidation> {
        let topology = LinuxTopology::new()?;
        PmuValidation::init(&topology, flags)
    }

    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    pub fn bugs(&self) -> &BugCheck {
        &self.bugs
    }

    /// Counter configuration for the CPU the probes ran on.
    pub fn counter_attrs(&self) -> &CounterAttrs {
        &self.attrs
    }

    /// Counter configuration for an arbitrary CPU index.
    pub fn counter_attrs_for_cpu(&self, cpu: u32) -> Result<CounterAttrs> {
        let info = self
            .cpus
            .get(cpu as usize)
            .or_else(|| self.cpus.first())
            .copied()
            .ok_or(Error::EmptyAffinity)?;
        attrs::counter_attrs(&info)
    }

    /// Whether tick counters must be reopened between uses rather than
    /// disabled and re-enabled.
    pub fn must_recreate_counters(&self) -> bool {
        attrs::always_recreate_counters(&self.attrs, &self.bugs)
    }

    /// True when a defect was detected but validation was forced to
    /// continue. Determinism is not guaranteed.
    pub fn improperly_configured(&self) -> bool {
        self.bugs.improperly_configured
    }

    /// Open the auxiliary transaction-accounting counters for a thread.
    pub fn open_arch_extras(&self, tid: libc::pid_t, group_fd: std::os::unix::io::RawFd) -> ArchExtras {
        attrs::open_arch_extras(&self.attrs, tid, group_fd, &self.bugs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::FakeTopology;
    use perf_event_open_sys::bindings as perf;

    #[test]
    fn empty_affinity_is_an_error() {
        let topology = FakeTopology {
            affinity: vec![],
            groups: vec![],
        };
        // An empty affinity set means the probes have nowhere to run.
        // Depending on the machine, detection itself may fail first; either
        // way this can't succeed.
        assert!(PmuValidation::init(&topology, Flags::default()).is_err());
    }

    #[test]
    fn attrs_for_out_of_table_cpu_fall_back_to_shared_entry() {
        let validation = PmuValidation {
            cpus: vec![CpuInfo {
                microarch: CpuMicroarch::IntelIvyBridge,
                perf_type: perf::PERF_TYPE_RAW,
            }],
            attrs: counter_attrs(&CpuInfo {
                microarch: CpuMicroarch::IntelIvyBridge,
                perf_type: perf::PERF_TYPE_RAW,
            })
            .unwrap(),
            bugs: BugCheck::default(),
        };
        let attrs = validation.counter_attrs_for_cpu(7).unwrap();
        assert_eq!(attrs.ticks.config, 0x5101c4);
        assert_eq!(attrs.pmu_name, "Intel Ivy Bridge");
    }
}
