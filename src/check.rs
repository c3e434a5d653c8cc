//! VMX instruction privilege checks
//!
//! Every VMX instruction is fenced by the same set of machine-state checks
//! before any decoding happens. A rejected instruction turns into a fault
//! injected straight back into the guest.
//!
//! See Intel SDM, Volume 3C, Section 30.3, the "IF" blocks opening each
//! VMX instruction's operation.

use utils::GuestPhysAddr;

use crate::bitmaps::RFlags;
use crate::errors::{Exception, InstrError};
use crate::platform::GuestContext;
use crate::regs::{GuestRegs, Segment};

const CR0_PE: u64 = 1 << 0;
const CR4_VMXE: u64 = 1 << 13;

/// Checks the privilege conditions for a VMX instruction.
///
/// With `for_vmxon` the gate validates the conditions of VMXON itself
/// (protected mode with CR4.VMXE); for every other instruction it requires
/// VMX operation to have been entered. On failure the matching fault has
/// been injected and the instruction must not be emulated further.
pub fn check_privilege<P: GuestContext>(
    ctx: &mut P,
    regs: &GuestRegs,
    vmxon_region: Option<GuestPhysAddr>,
    for_vmxon: bool,
) -> Result<(), InstrError> {
    let cs = ctx.segment(Segment::Cs);

    if for_vmxon {
        if ctx.cr0() & CR0_PE == 0 || ctx.cr4() & CR4_VMXE == 0 {
            return Err(invalid_op(ctx));
        }
    } else if vmxon_region.is_none() {
        return Err(invalid_op(ctx));
    }

    let rflags = RFlags::from_bits_truncate(regs.rflags);
    if rflags.contains(RFlags::VIRTUAL_8086_MODE) || (ctx.long_mode() && !cs.long) {
        return Err(invalid_op(ctx));
    }

    // CPL is the RPL of CS outside virtual-8086 mode.
    if cs.selector & 0b11 != 0 {
        log::debug!("vmx instruction at CPL {}", cs.selector & 0b11);
        let fault = Exception::GeneralProtection(0);
        ctx.inject_exception(fault);
        return Err(InstrError::Fault(fault));
    }

    Ok(())
}

fn invalid_op<P: GuestContext>(ctx: &mut P) -> InstrError {
    log::debug!("vmx instruction outside vmx operation");
    ctx.inject_exception(Exception::InvalidOpcode);
    InstrError::Fault(Exception::InvalidOpcode)
}

// ————————————————————————————————— Tests —————————————————————————————————— //
