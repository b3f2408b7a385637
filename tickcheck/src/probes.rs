//! Runtime probes for hardware and hypervisor defects that corrupt tick
//! counts.
//!
//! Each probe opens its own counter, measures a small fixed instruction
//! sequence, and turns the reading into a verdict. The verdict functions
//! are separate from the measurement so the decision logic can be tested
//! without a PMU. Probes run exactly once, on the CPU being validated.

use crate::counter::{self, PerfCounter, IN_TXCP};
use crate::error::Result;
use crate::microarch::CpuMicroarch;
use crate::policy::{self, Defect, Flags};
use log::{debug, warn};
use perf_event_open_sys::bindings as perf;
use std::fs;

#[cfg(target_arch = "x86_64")]
use std::arch::asm;

/// Number of conditional branches each measurement loop retires.
pub const NUM_BRANCHES: u64 = 500;

/// Iterations of the Xen probe's inner loop. The two post-syscall success
/// checks inside the measured region each retire one branch, so the loop
/// runs two short of the full budget.
const XEN_LOOP_ITERATIONS: u64 = NUM_BRANCHES - 2;

/// Sentinel reading meaning the measured region never completed.
const REGION_FAILED: i64 = -1;

/// Slack allowed on the Xen probe's final reading. The measured region is
/// exact down to the branch, so no slack is needed; a port to a platform
/// without precise sequencing control would raise this.
const XEN_COUNT_TOLERANCE: i64 = 0;

/// AMD raw event 0x25 (retired locked instructions), umask 0x08
/// (SpecLockMapCommit). Stays at zero when SpecLockMap is disabled.
const SPEC_LOCK_MAP_COMMIT: u64 = 0x510825;

const FREEZE_ON_SMI_PATH: &str = "/sys/devices/cpu/freeze_on_smi";

/// Outcome of defect probing on one CPU, computed once and then read-only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BugCheck {
    /// The kernel and hardware accept the IN_TXCP counter config bit.
    pub supports_txcp: bool,
    /// IN_TXCP counters undercount, as seen under KVM.
    pub has_kvm_in_txcp_bug: bool,
    /// PMU interrupts are over-delivered, as seen under Xen.
    pub has_xen_pmi_bug: bool,
    /// A defect was found but the caller forced validation to continue.
    pub improperly_configured: bool,
}

/// Which probes apply to a microarchitecture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbePlan {
    pub kvm_in_txcp: bool,
    pub xen_pmi: bool,
    pub zen_speclockmap: bool,
    pub freeze_on_smi: bool,
}

pub fn probe_plan(uarch: CpuMicroarch) -> ProbePlan {
    ProbePlan {
        kvm_in_txcp: uarch.is_intel(),
        xen_pmi: uarch.is_intel(),
        zen_speclockmap: uarch.is_amd_zen(),
        freeze_on_smi: uarch.needs_freeze_on_smi(),
    }
}

/// Run every probe that applies to `uarch`. Must be called on the CPU
/// being validated. `ticks` is the tick-counting event for that CPU.
pub fn check_for_arch_bugs(
    ticks: &perf::perf_event_attr,
    uarch: CpuMicroarch,
    flags: Flags,
) -> Result<BugCheck> {
    let plan = probe_plan(uarch);
    let mut bugs = BugCheck::default();
    if plan.kvm_in_txcp {
        check_for_kvm_in_txcp_bug(ticks, &mut bugs);
    }
    if plan.xen_pmi {
        check_for_xen_pmi_bug(ticks, flags, &mut bugs)?;
    }
    if plan.zen_speclockmap {
        check_for_zen_speclockmap(flags, &mut bugs)?;
    }
    if plan.freeze_on_smi {
        check_for_freeze_on_smi(flags, &mut bugs)?;
    }
    Ok(bugs)
}

/// Decide (supports_txcp, has_kvm_in_txcp_bug) from the branch-loop count
/// measured under IN_TXCP.
pub(crate) fn kvm_in_txcp_verdict(count: i64) -> (bool, bool) {
    let supports_txcp = count > 0;
    let has_bug = supports_txcp && count < NUM_BRANCHES as i64;
    (supports_txcp, has_bug)
}

/// Decide whether the Xen probe's final reading indicates over-delivered
/// PMU interrupts. A failed region reads as the sentinel and is treated
/// the same way as an overcount.
pub(crate) fn xen_pmi_verdict(count: i64) -> bool {
    count > NUM_BRANCHES as i64 + XEN_COUNT_TOLERANCE || count == REGION_FAILED
}

fn check_for_kvm_in_txcp_bug(ticks: &perf::perf_event_attr, bugs: &mut BugCheck) {
    let mut count: i64 = 0;
    let mut attr = *ticks;
    attr.config |= IN_TXCP;
    attr.__bindgen_anon_1.sample_period = 0;
    if let Some((counter, stripped_txcp)) = counter::start_counter_txcp(0, -1, &mut attr) {
        if !stripped_txcp {
            counter.disable();
            counter.enable();
            do_branches();
            match counter.read() {
                Ok(value) => count = value,
                Err(err) => warn!("can't read IN_TXCP counter: {}", err),
            }
        }
    }

    let (supports_txcp, has_bug) = kvm_in_txcp_verdict(count);
    bugs.supports_txcp = supports_txcp;
    bugs.has_kvm_in_txcp_bug = has_bug;
    debug!("supports txcp={}", supports_txcp);
    debug!("has_kvm_in_txcp_bug={} count={}", has_bug, count);
}

fn check_for_xen_pmi_bug(
    ticks: &perf::perf_event_attr,
    flags: Flags,
    bugs: &mut BugCheck,
) -> Result<()> {
    let mut count = REGION_FAILED;
    let mut attr = *ticks;
    attr.__bindgen_anon_1.sample_period = NUM_BRANCHES - 1;
    if let Some(counter) = counter::start_counter(0, -1, &mut attr) {
        count = run_measured_region(&counter, &mut attr);
    }

    bugs.has_xen_pmi_bug = xen_pmi_verdict(count);
    if bugs.has_xen_pmi_bug {
        debug!("has_xen_pmi_bug=true count={}", count);
        policy::enforce(
            Defect::XenPmiOvercount,
            flags,
            &mut bugs.improperly_configured,
        )?;
    }
    Ok(())
}

/// Enable, reset, reprogram the sample period, run the branch loop, and
/// disable the counter, with the control syscalls issued from inline asm
/// so nothing extra is reordered into the measured region. Everything
/// after the reset syscall returns counts against the branch budget.
///
/// Returns the counter reading after the region, or the failure sentinel
/// if any control operation failed.
#[cfg(target_arch = "x86_64")]
fn run_measured_region(counter: &PerfCounter, attr: &mut perf::perf_event_attr) -> i64 {
    // Always odd, so the loop body can't collapse to zero.
    let mut accumulator: u32 = std::process::id().wrapping_mul(2).wrapping_add(1);
    let mut failed: u64 = 1;
    let period_ptr: *mut u64 =
        unsafe { std::ptr::addr_of_mut!(attr.__bindgen_anon_1.sample_period) };
    unsafe {
        asm!(
            "mov rax, {sys_ioctl}",
            "mov edi, {fd:e}",
            "xor rdx, rdx",
            "mov rsi, {ioc_enable}",
            "syscall",
            "cmp rax, -4095",
            "jae 2f",
            "mov rax, {sys_ioctl}",
            "mov rsi, {ioc_reset}",
            "syscall",
            // From this point on all conditional branches count.
            "cmp rax, -4095",
            "jae 2f",
            // Reset the counter period to the real target.
            "mov rax, {sys_ioctl}",
            "mov rsi, {ioc_period}",
            "mov rdx, {period}",
            "syscall",
            "cmp rax, -4095",
            "jae 2f",
            "mov rax, {iterations}",
            "3:",
            "dec rax",
            // Multiply by 7.
            "mov edx, {acc:e}",
            "shl {acc:e}, 3",
            "sub {acc:e}, edx",
            // Add 2.
            "add {acc:e}, 2",
            // Mask off bits.
            "and {acc:e}, 0xffffff",
            // And loop.
            "test rax, rax",
            "jnz 3b",
            "mov rsi, {ioc_disable}",
            "mov rax, {sys_ioctl}",
            "xor rdx, rdx",
            // rdi still holds the fd.
            "syscall",
            "cmp rax, -4095",
            "jae 2f",
            "xor {failed}, {failed}",
            "2:",
            sys_ioctl = const libc::SYS_ioctl,
            ioc_enable = const perf::ENABLE,
            ioc_reset = const perf::RESET,
            ioc_period = const perf::PERIOD,
            ioc_disable = const perf::DISABLE,
            iterations = const XEN_LOOP_ITERATIONS,
            fd = in(reg) counter.fd(),
            period = in(reg) period_ptr,
            acc = inout(reg) accumulator,
            failed = inout(reg) failed,
            out("rax") _,
            out("rdx") _,
            out("rdi") _,
            out("rsi") _,
            // `syscall` clobbers rcx and r11.
            out("rcx") _,
            out("r11") _,
        );
    }
    // Keep the accumulator live so the loop body can't be optimized out.
    std::hint::black_box(accumulator);

    if failed != 0 {
        return REGION_FAILED;
    }
    match counter.read() {
        Ok(count) => count,
        Err(err) => {
            warn!("can't read counter after measured region: {}", err);
            REGION_FAILED
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn run_measured_region(_counter: &PerfCounter, _attr: &mut perf::perf_event_attr) -> i64 {
    REGION_FAILED
}

/// Retire exactly `NUM_BRANCHES` conditional branches that can't be
/// optimized out.
#[cfg(target_arch = "x86_64")]
fn do_branches() {
    let iterations = NUM_BRANCHES;
    unsafe {
        asm!(
            "2:",
            "sub {0}, 1",
            "jnz 2b",
            inout(reg) iterations => _,
        );
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn do_branches() {}

/// One lock-prefixed memory increment, known to bump the
/// SpecLockMapCommit counter when the optimization is active.
#[cfg(target_arch = "x86_64")]
fn locked_increment() {
    let mut word: u32 = 0;
    unsafe {
        asm!(
            "lock add dword ptr [{0}], 1",
            in(reg) std::ptr::addr_of_mut!(word),
            options(nostack),
        );
    }
    std::hint::black_box(word);
}

#[cfg(not(target_arch = "x86_64"))]
fn locked_increment() {}

/// When SpecLockMap is enabled, replay of anything beyond a single thread
/// is unreliable. When it is disabled, the SpecLockMapCommit counter
/// stays at zero across locked instructions.
/// See https://github.com/rr-debugger/rr/issues/2034.
fn check_for_zen_speclockmap(flags: Flags, bugs: &mut BugCheck) -> Result<()> {
    let mut attr =
        counter::init_perf_event_attr(perf::PERF_TYPE_RAW, SPEC_LOCK_MAP_COMMIT);
    let counter = match counter::start_counter(0, -1, &mut attr) {
        Some(counter) => counter,
        None => return Ok(()),
    };

    let before = match counter.read() {
        Ok(value) => value,
        Err(err) => {
            warn!("can't read SpecLockMap counter: {}", err);
            return Ok(());
        }
    };
    locked_increment();
    let after = match counter.read() {
        Ok(value) => value,
        Err(err) => {
            warn!("can't read SpecLockMap counter: {}", err);
            return Ok(());
        }
    };

    if after == before {
        debug!("SpecLockMap is disabled");
    } else {
        debug!("SpecLockMap is not disabled");
        policy::enforce(
            Defect::SpecLockMapNotDisabled,
            flags,
            &mut bugs.improperly_configured,
        )?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SmiFreezeState {
    /// The toggle doesn't exist on this kernel or platform.
    NotApplicable,
    Enabled,
    Disabled,
    /// Empty read or a value we don't recognize.
    Indeterminate,
}

fn interpret_freeze_on_smi(contents: Option<&[u8]>) -> SmiFreezeState {
    match contents {
        None => SmiFreezeState::NotApplicable,
        Some(bytes) => match bytes.first() {
            Some(b'1') => SmiFreezeState::Enabled,
            Some(b'0') => SmiFreezeState::Disabled,
            _ => SmiFreezeState::Indeterminate,
        },
    }
}

fn check_for_freeze_on_smi(flags: Flags, bugs: &mut BugCheck) -> Result<()> {
    let contents = fs::read(FREEZE_ON_SMI_PATH).ok();
    match interpret_freeze_on_smi(contents.as_deref()) {
        SmiFreezeState::NotApplicable => {
            debug!("{} not present", FREEZE_ON_SMI_PATH);
        }
        SmiFreezeState::Enabled => {
            debug!("freeze_on_smi is set");
        }
        SmiFreezeState::Disabled => {
            warn!("freeze_on_smi is not set");
            policy::enforce(
                Defect::FreezeOnSmiNotSet,
                flags,
                &mut bugs.improperly_configured,
            )?;
        }
        SmiFreezeState::Indeterminate => {
            warn!("unrecognized {} contents", FREEZE_ON_SMI_PATH);
        }
    }
    Ok(())
}
