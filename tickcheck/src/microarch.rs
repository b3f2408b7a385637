//! CPU microarchitecture identification.
//!
//! Replay needs to know the exact microarchitecture of every logical CPU
//! before it can trust a tick counter on it, so detection is strict: an
//! unrecognized vendor or cpuid model key is a hard error, never a guess.
//! Another way to do this would be to read the PMU type from
//! `/sys/devices/.../caps/pmu_name`, but that only works on kernels that
//! already know about the CPU; decoding cpuid ourselves keeps old kernels
//! working at the cost of having to update this table for new CPUs.

use crate::error::{Error, Result};

/// A known CPU microarchitecture.
///
/// The discriminant order is meaningful: all Intel values form one
/// contiguous range (P-cores in roughly chronological order, then the
/// hybrid E-core designs), followed by all AMD values with the Zen
/// generations contiguous. Probe dispatch and the freeze-on-SMI check
/// rely on these ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum CpuMicroarch {
    /// Internal sentinel for "not yet detected". Detection never returns
    /// this; it only marks CPUs whose group has not been resolved yet.
    Unknown,
    IntelMerom,
    IntelPenryn,
    IntelNehalem,
    IntelWestmere,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    IntelSilvermont,
    IntelGoldmont,
    IntelTremont,
    IntelKabyLake,
    IntelCometLake,
    IntelIceLake,
    IntelTigerLake,
    IntelRocketLake,
    IntelAlderLake,
    IntelRaptorLake,
    IntelSapphireRapids,
    IntelEmeraldRapids,
    IntelGraniteRapids,
    IntelMeteorLake,
    IntelLunarLake,
    IntelArrowLake,
    IntelGracemont,
    IntelCrestmont,
    IntelSkymont,
    AmdF15,
    AmdZen,
    AmdZen2,
    AmdZen3,
    AmdZen4,
    AmdZen5,
}

const FIRST_INTEL: CpuMicroarch = CpuMicroarch::IntelMerom;
const LAST_INTEL: CpuMicroarch = CpuMicroarch::IntelSkymont;
const FIRST_AMD_ZEN: CpuMicroarch = CpuMicroarch::AmdZen;
const LAST_AMD_ZEN: CpuMicroarch = CpuMicroarch::AmdZen5;

impl CpuMicroarch {
    pub fn is_intel(self) -> bool {
        FIRST_INTEL <= self && self <= LAST_INTEL
    }

    pub fn is_amd_zen(self) -> bool {
        FIRST_AMD_ZEN <= self && self <= LAST_AMD_ZEN
    }

    /// Comet Lake and everything after it pause counters during System
    /// Management Interrupts only if the `freeze_on_smi` toggle is set,
    /// so those CPUs need the toggle verified.
    pub fn needs_freeze_on_smi(self) -> bool {
        CpuMicroarch::IntelCometLake <= self && self <= LAST_INTEL
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Vendor {
    Intel,
    Amd,
}

/// How a composite cpuid key maps to a microarchitecture. AMD reuses
/// composite keys across generations and needs the extended family field
/// to disambiguate.
enum Mapping {
    Direct(CpuMicroarch),
    ByExtFamily(&'static [(u32, CpuMicroarch)]),
}

use self::CpuMicroarch::*;
use self::Mapping::*;

/// Composite key (feature word & 0xF0FF0, i.e. base+extended family and
/// model fields) to microarchitecture. Sorted by key for binary search.
static CPU_TYPE_TABLE: &[(u32, Mapping)] = &[
    (0x006F0, Direct(IntelMerom)),
    // A8-3530MX, Naples, Whitehaven, Summit Ridge, Snowy Owl (Zen), Milan (Zen 3)
    (
        0x00F10,
        ByExtFamily(&[(3, AmdF15), (8, AmdZen), (0xa, AmdZen3)]),
    ),
    (0x00F20, Direct(AmdF15)), // Piledriver
    // Colfax, Pinnacle Ridge (Zen+), Chagall (Zen 3)
    (0x00F80, ByExtFamily(&[(8, AmdZen), (0xa, AmdZen3)])),
    (0x10660, Direct(IntelMerom)),
    (0x10670, Direct(IntelPenryn)),
    (0x106A0, Direct(IntelNehalem)),
    (0x106D0, Direct(IntelPenryn)),
    (0x106E0, Direct(IntelNehalem)),
    // Raven Ridge, Great Horned Owl (Zen)
    (0x10F10, ByExtFamily(&[(8, AmdZen), (0xa, AmdZen2)])),
    // Banded Kestrel (Zen), Picasso (Zen+), 7975WX (Zen 2)
    (0x10F80, ByExtFamily(&[(8, AmdZen), (0xa, AmdZen2)])),
    (0x20650, Direct(IntelWestmere)),
    (0x206A0, Direct(IntelSandyBridge)),
    (0x206C0, Direct(IntelWestmere)),
    (0x206D0, Direct(IntelSandyBridge)),
    (0x206E0, Direct(IntelNehalem)),
    (0x206F0, Direct(IntelWestmere)),
    (0x20F00, ByExtFamily(&[(8, AmdZen), (0xa, AmdZen2)])), // Dali (Zen)
    (0x20F10, Direct(AmdZen3)),                             // Vermeer
    (0x20F40, Direct(AmdZen5)),                             // Strix Point
    (0x30670, Direct(IntelSilvermont)),
    (0x306A0, Direct(IntelIvyBridge)),
    (0x306C0, Direct(IntelHaswell)), // Devil's Canyon
    (0x306D0, Direct(IntelBroadwell)),
    (0x306E0, Direct(IntelSandyBridge)),
    (0x306F0, Direct(IntelHaswell)),
    (0x30F00, Direct(AmdF15)),                  // Steamroller
    (0x30F10, ByExtFamily(&[(8, AmdZen2)])),    // Rome, Castle Peak
    (0x40650, Direct(IntelHaswell)),
    (0x40660, Direct(IntelHaswell)),
    (0x40670, Direct(IntelBroadwell)),
    (0x406C0, Direct(IntelSilvermont)),
    (0x406E0, Direct(IntelSkylake)),
    (0x406F0, Direct(IntelBroadwell)),
    (0x40F40, Direct(AmdZen3)), // Rembrandt (Zen 3+)
    (0x50650, Direct(IntelSkylake)),
    (0x50660, Direct(IntelBroadwell)),
    (0x50670, Direct(IntelSilvermont)),
    (0x506C0, Direct(IntelGoldmont)),
    (0x506E0, Direct(IntelSkylake)),
    (0x506F0, Direct(IntelGoldmont)),
    (0x50F00, Direct(AmdZen3)), // Cezanne
    (0x606A0, Direct(IntelIceLake)),
    (0x60F00, ByExtFamily(&[(8, AmdZen2)])), // Renoir
    (0x60F10, Direct(AmdZen4)),              // Raphael
    (0x60F80, ByExtFamily(&[(8, AmdZen2)])), // Lucienne
    (0x706A0, Direct(IntelGoldmont)),
    (0x706E0, Direct(IntelIceLake)),
    (0x70F10, ByExtFamily(&[(8, AmdZen2)])), // Matisse
    (0x70F40, Direct(AmdZen4)),              // Phoenix
    (0x70F50, Direct(AmdZen4)),              // Hawk Point
    (0x80660, Direct(IntelIceLake)),
    (0x806C0, Direct(IntelTigerLake)),
    (0x806D0, Direct(IntelTigerLake)),
    (0x806E0, Direct(IntelKabyLake)),
    (0x806F0, Direct(IntelSapphireRapids)),
    (0x90670, Direct(IntelAlderLake)),
    (0x906A0, Direct(IntelAlderLake)),
    (0x906C0, Direct(IntelTremont)),
    (0x906E0, Direct(IntelKabyLake)),
    (0x90F00, ByExtFamily(&[(8, AmdZen2)])), // Van Gogh
    (0xA0650, Direct(IntelCometLake)),
    (0xA0660, Direct(IntelCometLake)),
    (0xA0670, Direct(IntelRocketLake)),
    (0xA06A0, Direct(IntelMeteorLake)),
    (0xA06D0, Direct(IntelGraniteRapids)),
    (0xB0670, Direct(IntelRaptorLake)),
    (0xB06A0, Direct(IntelRaptorLake)),
    (0xB06D0, Direct(IntelLunarLake)),
    (0xB06F0, Direct(IntelRaptorLake)),
    (0xC0660, Direct(IntelArrowLake)),
    (0xC06F0, Direct(IntelEmeraldRapids)),
];

/// Remap of a P-core microarchitecture to the matching E-core design,
/// keyed by the detected big-core value and the kernel's name for the
/// heterogeneous group.
static HYBRID_GROUP_TABLE: &[(CpuMicroarch, &str, CpuMicroarch)] = &[
    (IntelAlderLake, "atom", IntelGracemont),
    (IntelRaptorLake, "atom", IntelGracemont),
    (IntelMeteorLake, "atom", IntelCrestmont),
    // Some Arrow Lakes may use Crestmont E-cores; hopefully it doesn't
    // matter for the PMU.
    (IntelLunarLake, "atom", IntelSkymont),
    (IntelArrowLake, "atom", IntelSkymont),
    (IntelArrowLake, "lowpower", IntelCrestmont),
];

pub(crate) fn vendor_from_bytes(vendor: &[u8; 12]) -> Result<Vendor> {
    match &vendor[..] {
        b"GenuineIntel" => Ok(Vendor::Intel),
        b"AuthenticAMD" => Ok(Vendor::Amd),
        raw => Err(Error::UnknownVendor(
            String::from_utf8_lossy(raw).into_owned(),
        )),
    }
}

/// Resolve a composite cpuid key to a microarchitecture. The vendor is
/// only consulted to produce a useful error for unmapped keys.
pub(crate) fn microarch_for_cpuid(
    vendor: Vendor,
    cpu_type: u32,
    ext_family: u32,
) -> Result<CpuMicroarch> {
    let unmapped = || match vendor {
        Vendor::Amd => Error::UnknownAmdCpuType {
            cpu_type,
            ext_family,
        },
        Vendor::Intel => Error::UnknownIntelCpuType { cpu_type },
    };

    let idx = CPU_TYPE_TABLE
        .binary_search_by_key(&cpu_type, |&(key, _)| key)
        .map_err(|_| unmapped())?;
    match &CPU_TYPE_TABLE[idx].1 {
        Mapping::Direct(uarch) => Ok(*uarch),
        Mapping::ByExtFamily(choices) => choices
            .iter()
            .find(|&&(family, _)| family == ext_family)
            .map(|&(_, uarch)| uarch)
            .ok_or_else(unmapped),
    }
}

/// Resolve the microarchitecture for a CPU inside a named heterogeneous
/// group. `core` keeps the detected P-core value; `atom` and `lowpower`
/// remap it to the matching E-core design; anything else is an error.
pub(crate) fn resolve_hybrid_group(
    uarch: CpuMicroarch,
    group_name: &str,
) -> Result<CpuMicroarch> {
    if group_name == "core" {
        return Ok(uarch);
    }
    if group_name != "atom" && group_name != "lowpower" {
        return Err(Error::UnknownHybridGroup(group_name.to_owned()));
    }
    HYBRID_GROUP_TABLE
        .iter()
        .find(|&&(big, name, _)| big == uarch && name == group_name)
        .map(|&(_, _, small)| small)
        .ok_or_else(|| Error::UnknownHybridVariant {
            group: group_name.to_owned(),
            uarch,
        })
}

/// Detect the microarchitecture of the CPU this thread currently runs on.
/// Never returns [`CpuMicroarch::Unknown`]; an unmapped CPU is an error.
#[cfg(target_arch = "x86_64")]
pub fn compute_cpu_microarch() -> Result<CpuMicroarch> {
    let cpuid0 = unsafe { std::arch::x86_64::__cpuid(0) };
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&cpuid0.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&cpuid0.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&cpuid0.ecx.to_le_bytes());
    let vendor = vendor_from_bytes(&vendor)?;

    let features = unsafe { std::arch::x86_64::__cpuid(1) }.eax;
    let cpu_type = features & 0xF0FF0;
    let ext_family = (features >> 20) & 0xFF;
    microarch_for_cpuid(vendor, cpu_type, ext_family)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn compute_cpu_microarch() -> Result<CpuMicroarch> {
    Err(Error::UnsupportedPlatform)
}

/// Whether this CPU advertises Hardware Lock Elision (cpuid leaf 7, EBX
/// bit 4).
#[cfg(target_arch = "x86_64")]
pub(crate) fn cpu_has_hle() -> bool {
    const HLE_FEATURE_FLAG: u32 = 1 << 4;
    let extended = unsafe { std::arch::x86_64::__cpuid_count(7, 0) };
    extended.ebx & HLE_FEATURE_FLAG != 0
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn cpu_has_hle() -> bool {
    false
}

#[cfg(test)]
pub(crate) fn all_mapped_microarchs() -> Vec<CpuMicroarch> {
    let mut result = Vec::new();
    for (_, mapping) in CPU_TYPE_TABLE {
        match mapping {
            Mapping::Direct(uarch) => result.push(*uarch),
            Mapping::ByExtFamily(choices) => {
                result.extend(choices.iter().map(|&(_, uarch)| uarch))
            }
        }
    }
    for &(_, _, small) in HYBRID_GROUP_TABLE {
        result.push(small);
    }
    result.sort();
    result.dedup();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_type_table_is_sorted_and_unique() {
        for window in CPU_TYPE_TABLE.windows(2) {
            assert!(
                window[0].0 < window[1].0,
                "table keys {:#x} and {:#x} out of order",
                window[0].0,
                window[1].0
            );
        }
    }

    #[test]
    fn every_table_entry_resolves() {
        for &(key, ref mapping) in CPU_TYPE_TABLE {
            match mapping {
                Mapping::Direct(expected) => {
                    let got = microarch_for_cpuid(Vendor::Intel, key, 0)
                        .or_else(|_| microarch_for_cpuid(Vendor::Amd, key, 0));
                    // Direct entries ignore the extended family entirely.
                    assert_eq!(got.unwrap(), *expected);
                    assert_ne!(*expected, Unknown);
                }
                Mapping::ByExtFamily(choices) => {
                    for &(family, expected) in *choices {
                        let got = microarch_for_cpuid(Vendor::Amd, key, family).unwrap();
                        assert_eq!(got, expected);
                        assert_ne!(expected, Unknown);
                    }
                }
            }
        }
    }

    #[test]
    fn ivy_bridge_key_resolves() {
        assert_eq!(
            microarch_for_cpuid(Vendor::Intel, 0x306A0, 0).unwrap(),
            IntelIvyBridge
        );
    }

    #[test]
    fn shared_amd_key_disambiguates_by_ext_family() {
        assert_eq!(
            microarch_for_cpuid(Vendor::Amd, 0x00F10, 0xa).unwrap(),
            AmdZen3
        );
        assert_eq!(microarch_for_cpuid(Vendor::Amd, 0x00F10, 8).unwrap(), AmdZen);
        assert_eq!(microarch_for_cpuid(Vendor::Amd, 0x00F10, 3).unwrap(), AmdF15);
    }

    #[test]
    fn unmapped_intel_key_names_key_in_hex() {
        let err = microarch_for_cpuid(Vendor::Intel, 0xDEAD0, 0).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Intel"), "{}", msg);
        assert!(msg.contains("0xdead0"), "{}", msg);
    }

    #[test]
    fn unmapped_amd_ext_family_names_both_fields() {
        let err = microarch_for_cpuid(Vendor::Amd, 0x00F10, 0x5).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("AMD"), "{}", msg);
        assert!(msg.contains("0xf10"), "{}", msg);
        assert!(msg.contains("0x5"), "{}", msg);
    }

    #[test]
    fn unknown_vendor_names_raw_string() {
        let err = vendor_from_bytes(b"NotAnActualV").unwrap_err();
        assert!(err.to_string().contains("NotAnActualV"));
    }

    #[test]
    fn vendor_ranges() {
        assert!(IntelMerom.is_intel());
        assert!(IntelSkymont.is_intel());
        assert!(IntelGracemont.is_intel());
        assert!(!AmdZen.is_intel());
        assert!(!Unknown.is_intel());

        assert!(AmdZen.is_amd_zen());
        assert!(AmdZen5.is_amd_zen());
        assert!(!AmdF15.is_amd_zen());
        assert!(!IntelSkylake.is_amd_zen());
    }

    #[test]
    fn freeze_on_smi_range_starts_at_comet_lake() {
        assert!(IntelCometLake.needs_freeze_on_smi());
        assert!(IntelAlderLake.needs_freeze_on_smi());
        assert!(IntelSkymont.needs_freeze_on_smi());
        assert!(!IntelKabyLake.needs_freeze_on_smi());
        assert!(!IntelSkylake.needs_freeze_on_smi());
        assert!(!AmdZen5.needs_freeze_on_smi());
    }

    #[test]
    fn hybrid_remap_known_pairs() {
        assert_eq!(
            resolve_hybrid_group(IntelAlderLake, "atom").unwrap(),
            IntelGracemont
        );
        assert_eq!(
            resolve_hybrid_group(IntelRaptorLake, "atom").unwrap(),
            IntelGracemont
        );
        assert_eq!(
            resolve_hybrid_group(IntelMeteorLake, "atom").unwrap(),
            IntelCrestmont
        );
        assert_eq!(
            resolve_hybrid_group(IntelArrowLake, "lowpower").unwrap(),
            IntelCrestmont
        );
    }

    #[test]
    fn hybrid_core_group_keeps_detected_value() {
        assert_eq!(
            resolve_hybrid_group(IntelAlderLake, "core").unwrap(),
            IntelAlderLake
        );
    }

    #[test]
    fn hybrid_unknown_group_name_is_an_error() {
        let err = resolve_hybrid_group(IntelAlderLake, "mystery").unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn hybrid_unknown_variant_is_an_error() {
        let err = resolve_hybrid_group(IntelIvyBridge, "atom").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("atom"), "{}", msg);
        assert!(msg.contains("IvyBridge"), "{}", msg);
    }
}
