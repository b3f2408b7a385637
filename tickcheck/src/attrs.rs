//! Per-microarchitecture counter configuration: which raw event counts
//! ticks, how far an interrupt can skid past its programmed period, and
//! which auxiliary counters a CPU needs.

use crate::counter::{self, PerfCounter, IN_TX, IN_TXCP};
use crate::error::{Error, Result};
use crate::microarch::{self, CpuMicroarch};
use crate::policy::Flags;
use crate::probes::BugCheck;
use crate::topology::CpuInfo;
use log::warn;
use perf_event_open_sys::bindings as perf;
use std::fmt;
use std::os::unix::io::RawFd;

/// Static counter parameters for one microarchitecture. The tick event is
/// retired conditional branches (taken branches on pre-Zen AMD), encoded
/// as a raw umask+event byte pair.
#[derive(Clone, Copy, Debug)]
pub struct PmuConfig {
    pub uarch: CpuMicroarch,
    pub name: &'static str,
    pub ticks_event: u64,
    /// Upper bound on how many ticks a counter interrupt can arrive late.
    pub skid_size: u64,
    /// The kernel can't reprogram the sample period of a live counter on
    /// this microarchitecture.
    pub ioc_period_bug: bool,
}

use self::CpuMicroarch::*;

#[rustfmt::skip]
static PMU_CONFIGS: &[PmuConfig] = &[
    PmuConfig { uarch: IntelMerom, name: "Intel Merom", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelPenryn, name: "Intel Penryn", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelNehalem, name: "Intel Nehalem", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelWestmere, name: "Intel Westmere", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelSandyBridge, name: "Intel Sandy Bridge", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelIvyBridge, name: "Intel Ivy Bridge", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelHaswell, name: "Intel Haswell", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelBroadwell, name: "Intel Broadwell", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelSkylake, name: "Intel Skylake", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelSilvermont, name: "Intel Silvermont", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelGoldmont, name: "Intel Goldmont", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelTremont, name: "Intel Tremont", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelKabyLake, name: "Intel Kaby Lake", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelCometLake, name: "Intel Comet Lake", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelIceLake, name: "Intel Ice Lake", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelTigerLake, name: "Intel Tiger Lake", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelRocketLake, name: "Intel Rocket Lake", ticks_event: 0x5101c4, skid_size: 100, ioc_period_bug: false },
    // Alder Lake and later encode conditional branches with umask 0x11.
    PmuConfig { uarch: IntelAlderLake, name: "Intel Alder Lake", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelRaptorLake, name: "Intel Raptor Lake", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelSapphireRapids, name: "Intel Sapphire Rapids", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelEmeraldRapids, name: "Intel Emerald Rapids", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelGraniteRapids, name: "Intel Granite Rapids", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelMeteorLake, name: "Intel Meteor Lake", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelLunarLake, name: "Intel Lunar Lake", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelArrowLake, name: "Intel Arrow Lake", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelGracemont, name: "Intel Gracemont", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelCrestmont, name: "Intel Crestmont", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    PmuConfig { uarch: IntelSkymont, name: "Intel Skymont", ticks_event: 0x5111c4, skid_size: 100, ioc_period_bug: false },
    // Family 15h counts retired taken branches; conditional branches
    // aren't exposed as a single event there.
    PmuConfig { uarch: AmdF15, name: "AMD Family 15h Revision 30h", ticks_event: 0x5100c4, skid_size: 250, ioc_period_bug: false },
    // Zen's conditional-branch counter has a very large observed skid.
    PmuConfig { uarch: AmdZen, name: "AMD Zen", ticks_event: 0x5100d1, skid_size: 10000, ioc_period_bug: false },
    PmuConfig { uarch: AmdZen2, name: "AMD Zen 2", ticks_event: 0x5100d1, skid_size: 10000, ioc_period_bug: false },
    PmuConfig { uarch: AmdZen3, name: "AMD Zen 3", ticks_event: 0x5100d1, skid_size: 10000, ioc_period_bug: false },
    PmuConfig { uarch: AmdZen4, name: "AMD Zen 4", ticks_event: 0x5100d1, skid_size: 10000, ioc_period_bug: false },
    PmuConfig { uarch: AmdZen5, name: "AMD Zen 5", ticks_event: 0x5100d1, skid_size: 10000, ioc_period_bug: false },
];

pub fn pmu_config(uarch: CpuMicroarch) -> Option<&'static PmuConfig> {
    PMU_CONFIGS.iter().find(|config| config.uarch == uarch)
}

/// Everything the counter lifecycle needs to open tick counters on one
/// CPU, resolved from its microarchitecture and perf event type.
#[derive(Clone, Copy)]
pub struct CounterAttrs {
    pub ticks: perf::perf_event_attr,
    pub pmu_name: &'static str,
    pub skid_size: u64,
    pub ioc_period_bug: bool,
}

// perf_event_attr has no Debug impl (it contains unions), so summarize
// the event instead of dumping the whole attr.
impl fmt::Debug for CounterAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterAttrs")
            .field("pmu_name", &self.pmu_name)
            .field("ticks_event", &format_args!("{:#x}", self.ticks.config))
            .field("perf_type", &self.ticks.type_)
            .field("skid_size", &self.skid_size)
            .field("ioc_period_bug", &self.ioc_period_bug)
            .finish()
    }
}

pub fn counter_attrs(info: &CpuInfo) -> Result<CounterAttrs> {
    let config =
        pmu_config(info.microarch).ok_or(Error::UnsupportedMicroarch(info.microarch))?;
    Ok(CounterAttrs {
        ticks: counter::init_perf_event_attr(info.perf_type, config.ticks_event),
        pmu_name: config.name,
        skid_size: config.skid_size,
        ioc_period_bug: config.ioc_period_bug,
    })
}

/// Whether tick counters must be closed and reopened between uses instead
/// of disabled and re-enabled. With the KVM IN_TXCP bug, re-enabling a
/// TXCP counter after disabling it does not work.
pub fn always_recreate_counters(attrs: &CounterAttrs, bugs: &BugCheck) -> bool {
    attrs.ioc_period_bug || bugs.has_kvm_in_txcp_bug
}

/// Called when only a single hardware counter slot is usable. Programs
/// using Hardware Lock Elision need a second slot to replay, so warn if
/// the CPU supports it.
pub fn check_restricted_counter_capacity(flags: Flags) {
    if microarch::cpu_has_hle() && !flags.suppress_environment_warnings {
        warn!(
            "Your CPU supports Hardware Lock Elision but you only have one\n\
             hardware performance counter available. Record and replay\n\
             of code that uses HLE will fail unless you alter your\n\
             configuration to make more than one hardware performance counter\n\
             available."
        );
    }
}

/// Auxiliary counters for transaction-aware tick accounting.
#[derive(Default)]
pub struct ArchExtras {
    /// Ticks inside hardware transactions, aborted or not. Opened only
    /// when IN_TXCP can't be trusted.
    pub ticks_in_transaction: Option<PerfCounter>,
    /// Ticks excluding aborted transactions. A counter can't carry both a
    /// sample period and IN_TXCP, so this is a second, period-free
    /// counter alongside the interrupting one.
    pub ticks_measure: Option<PerfCounter>,
}

pub fn open_arch_extras(
    attrs: &CounterAttrs,
    tid: libc::pid_t,
    group_fd: RawFd,
    bugs: &BugCheck,
) -> ArchExtras {
    let mut extras = ArchExtras::default();
    if !bugs.supports_txcp {
        return extras;
    }

    let mut attr = attrs.ticks;
    attr.__bindgen_anon_1.sample_period = 0;
    if bugs.has_kvm_in_txcp_bug {
        // IN_TXCP isn't going to work reliably. Assume HLE/RTM are not
        // used, and count transactional ticks so that can be checked.
        attr.config |= IN_TX;
        extras.ticks_in_transaction = counter::start_counter(tid, group_fd, &mut attr);
    } else {
        attr.config |= IN_TXCP;
        extras.ticks_measure = counter::start_counter(tid, group_fd, &mut attr);
    }
    extras
}

#[cfg(test)]
mod tests {
    use super::*;
    use perf_event_open_sys::bindings as perf;

    #[test]
    fn every_detectable_microarch_has_a_config() {
        for uarch in microarch::all_mapped_microarchs() {
            let config = pmu_config(uarch);
            assert!(config.is_some(), "no PMU config for {:?}", uarch);
            assert_eq!(config.unwrap().uarch, uarch);
        }
    }

    #[test]
    fn unknown_has_no_config() {
        assert!(pmu_config(Unknown).is_none());
    }

    #[test]
    fn tick_events_per_family() {
        assert_eq!(pmu_config(IntelIvyBridge).unwrap().ticks_event, 0x5101c4);
        assert_eq!(pmu_config(IntelAlderLake).unwrap().ticks_event, 0x5111c4);
        assert_eq!(pmu_config(IntelGracemont).unwrap().ticks_event, 0x5111c4);
        assert_eq!(pmu_config(AmdF15).unwrap().ticks_event, 0x5100c4);
        assert_eq!(pmu_config(AmdZen4).unwrap().ticks_event, 0x5100d1);
    }

    #[test]
    fn attrs_carry_cpu_perf_type() {
        let info = CpuInfo {
            microarch: IntelGracemont,
            perf_type: 8,
        };
        let attrs = counter_attrs(&info).unwrap();
        assert_eq!(attrs.ticks.type_, 8);
        assert_eq!(attrs.ticks.config, 0x5111c4);
        assert_eq!(attrs.pmu_name, "Intel Gracemont");
    }

    #[test]
    fn debug_output_names_pmu_and_event() {
        let info = CpuInfo {
            microarch: AmdZen3,
            perf_type: perf::PERF_TYPE_RAW,
        };
        let attrs = counter_attrs(&info).unwrap();
        let formatted = format!("{:?}", attrs);
        assert!(formatted.contains("AMD Zen 3"));
        assert!(formatted.contains("0x5100d1"));
    }

    #[test]
    fn unknown_microarch_is_unsupported() {
        let info = CpuInfo {
            microarch: Unknown,
            perf_type: perf::PERF_TYPE_RAW,
        };
        assert!(matches!(
            counter_attrs(&info),
            Err(Error::UnsupportedMicroarch(Unknown))
        ));
    }

    #[test]
    fn must_recreate_truth_table() {
        let info = CpuInfo {
            microarch: IntelSkylake,
            perf_type: perf::PERF_TYPE_RAW,
        };
        let mut attrs = counter_attrs(&info).unwrap();
        let mut bugs = BugCheck::default();
        assert!(!always_recreate_counters(&attrs, &bugs));

        bugs.has_kvm_in_txcp_bug = true;
        assert!(always_recreate_counters(&attrs, &bugs));

        bugs.has_kvm_in_txcp_bug = false;
        attrs.ioc_period_bug = true;
        assert!(always_recreate_counters(&attrs, &bugs));
    }

    #[test]
    fn no_extras_without_txcp_support() {
        let info = CpuInfo {
            microarch: IntelSkylake,
            perf_type: perf::PERF_TYPE_RAW,
        };
        let attrs = counter_attrs(&info).unwrap();
        let extras = open_arch_extras(&attrs, 0, -1, &BugCheck::default());
        assert!(extras.ticks_in_transaction.is_none());
        assert!(extras.ticks_measure.is_none());
    }
}
