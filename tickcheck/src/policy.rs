//! What to do when a machine defect is found: abort validation, or carry
//! on in degraded mode when the caller forces it.

use crate::error::{Error, Result};
use log::warn;

/// Caller-supplied overrides for validation strictness.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    /// Continue past defects that would otherwise abort, marking the CPU
    /// improperly configured instead. Recording will probably misbehave.
    pub force_things: bool,
    /// Silence advisory warnings about the environment.
    pub suppress_environment_warnings: bool,
}

/// A machine misconfiguration that makes tick counts unreliable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Defect {
    XenPmiOvercount,
    SpecLockMapNotDisabled,
    FreezeOnSmiNotSet,
}

impl Defect {
    fn into_error(self) -> Error {
        match self {
            Defect::XenPmiOvercount => Error::XenPmiBug,
            Defect::SpecLockMapNotDisabled => Error::SpecLockMapNotDisabled,
            Defect::FreezeOnSmiNotSet => Error::FreezeOnSmiNotSet,
        }
    }
}

/// Apply the abort-or-degrade policy to a detected defect. Without
/// `force_things` the defect becomes a hard error; with it, the defect is
/// logged and recorded in `improperly_configured`.
pub(crate) fn enforce(
    defect: Defect,
    flags: Flags,
    improperly_configured: &mut bool,
) -> Result<()> {
    if flags.force_things {
        warn!("continuing past {:?} because of force override", defect);
        *improperly_configured = true;
        Ok(())
    } else {
        Err(defect.into_error())
    }
}
