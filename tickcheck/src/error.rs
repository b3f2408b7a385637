use crate::microarch::CpuMicroarch;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Conditions that end validation. Apart from the defect variants, which
/// [`crate::Flags::force_things`] downgrades to unsound-but-continuing,
/// none of these are recoverable: the machine cannot host a deterministic
/// replay until the underlying problem is fixed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown CPU vendor '{0}'")]
    UnknownVendor(String),

    #[error("Intel CPU type {cpu_type:#x} unknown")]
    UnknownIntelCpuType { cpu_type: u32 },

    #[error("AMD CPU type {cpu_type:#x} (ext family {ext_family:#x}) unknown")]
    UnknownAmdCpuType { cpu_type: u32, ext_family: u32 },

    #[error("{group} architecture detected but not known for {uarch:?}")]
    UnknownHybridVariant { group: String, uarch: CpuMicroarch },

    #[error("hybrid architecture group name not known: {0}")]
    UnknownHybridGroup(String),

    #[error("microarchitecture {0:?} currently unsupported")]
    UnsupportedMicroarch(CpuMicroarch),

    #[error("can't read CPU affinity mask: {0}")]
    ReadAffinity(std::io::Error),

    #[error("can't set affinity to previously allowed CPU {cpu}: {source}")]
    SetAffinity { cpu: u32, source: std::io::Error },

    #[error("CPU affinity set is empty")]
    EmptyAffinity,

    #[error("can't parse {path}: {detail}")]
    Topology { path: String, detail: String },

    #[error(
        "Overcount triggered by PMU interrupts detected due to Xen PMU \
         virtualization bug.\n\
         Aborting. Retry with the force override, but it will probably fail."
    )]
    XenPmiBug,

    #[error(
        "On Zen CPUs, record and replay will not work reliably unless you \
         disable the hardware SpecLockMap optimization.\n\
         For instructions on how to do this, see \
         https://github.com/rr-debugger/rr/wiki/Zen"
    )]
    SpecLockMapNotDisabled,

    #[error(
        "Freezing performance counters on SMIs should be enabled for maximum\n\
         reliability on Comet Lake and later CPUs. To manually enable this setting, run\n\
         \techo 1 | sudo tee /sys/devices/cpu/freeze_on_smi\n\
         On systemd systems, consider putting\n\
         'w /sys/devices/cpu/freeze_on_smi - - - - 1' into /etc/tmpfiles.d/10-replay.conf\n\
         to automatically apply this setting on every reboot.\n\
         If you are seeing this message, the setting has not been enabled."
    )]
    FreezeOnSmiNotSet,

    #[error("hardware performance counters not supported on this platform")]
    UnsupportedPlatform,
}
