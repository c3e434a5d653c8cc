//! VMX instruction emulation
//!
//! One handler per opcode, all following the same shape: privilege gate,
//! operand decode, architectural logic, then the VMX status convention
//! written into guest RFLAGS. Faults raised along the way leave RFLAGS and
//! RIP alone; everything else completes the instruction.

use utils::GuestPhysAddr;

use crate::bitmaps::{PrimaryControls, RFlags};
use crate::check::check_privilege;
use crate::decode::{decode_instruction, read_operand, write_operand, Decoded};
use crate::errors::{InstrError, VmxStatus};
use crate::fields::VmcsField;
use crate::platform::{GuestContext, GuestFrameRw, HostVmcs};
use crate::regs::GuestRegs;
use crate::{vvmcs, IoBitmap, NestedVmx, VMCS_ADDR_INVALID};

/// The VMX opcodes the core emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxOpcode {
    Vmxon,
    Vmxoff,
    Vmptrld,
    Vmptrst,
    Vmclear,
    Vmread,
    Vmwrite,
    Vmlaunch,
    Vmresume,
}

/// Writes the architectural VMX status into guest RFLAGS.
///
/// See Intel SDM, Volume 3C, Section 30.2.
fn vmreturn(regs: &mut GuestRegs, status: VmxStatus) {
    let mask = RFlags::CARRY_FLAG
        | RFlags::PARITY_FLAG
        | RFlags::AUXILIARY_CARRY_FLAG
        | RFlags::ZERO_FLAG
        | RFlags::SIGN_FLAG
        | RFlags::OVERFLOW_FLAG;

    let mut rflags = regs.rflags & !mask.bits();
    match status {
        VmxStatus::Succeed => (),
        VmxStatus::FailValid => rflags |= RFlags::ZERO_FLAG.bits(),
        VmxStatus::FailInvalid => rflags |= RFlags::CARRY_FLAG.bits(),
    }
    regs.rflags = rflags;
}

impl<P: GuestContext> NestedVmx<P> {
    /// Emulates one VMX instruction on behalf of the L1 guest.
    ///
    /// On `Ok` the instruction completed and the caller advances RIP; the
    /// outcome (VMsucceed or a VMfail) is already in `regs.rflags`. On `Err`
    /// a fault went to the guest and RIP must stay put.
    pub fn handle<V: HostVmcs>(
        &mut self,
        opcode: VmxOpcode,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        match opcode {
            VmxOpcode::Vmxon => self.handle_vmxon(ctx, vmcs, regs),
            VmxOpcode::Vmxoff => self.handle_vmxoff(ctx, vmcs, regs),
            VmxOpcode::Vmptrld => self.handle_vmptrld(ctx, vmcs, regs),
            VmxOpcode::Vmptrst => self.handle_vmptrst(ctx, vmcs, regs),
            VmxOpcode::Vmclear => self.handle_vmclear(ctx, vmcs, regs),
            VmxOpcode::Vmread => self.handle_vmread(ctx, vmcs, regs),
            VmxOpcode::Vmwrite => self.handle_vmwrite(ctx, vmcs, regs),
            VmxOpcode::Vmlaunch => self.handle_vmlaunch(ctx, vmcs, regs),
            VmxOpcode::Vmresume => self.handle_vmresume(ctx, vmcs, regs),
        }
    }

    fn handle_vmxon<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, true)?;
        let decoded = decode_instruction(ctx, vmcs, regs)?;
        let gpa = GuestPhysAddr::new(read_operand(ctx, regs, &decoded)? as usize);

        if !gpa.is_page_aligned() {
            vmreturn(regs, VmxStatus::FailInvalid);
            return Ok(());
        }

        if let Some(prev) = self.vmxon_region {
            log::warn!(
                "vmxon again: orig {:#x} new {:#x}",
                prev.as_usize(),
                gpa.as_usize()
            );
        }
        self.vmxon_region = Some(gpa);

        // Fork the live host VMCS into the shadow, so that nested entries
        // start from the same machine state. The VMCS must be clear before
        // its memory image is read, and is reloaded right after.
        vmcs.vmclear(self.host_vmcs.phys_addr);
        self.shadow_vmcs.as_mut().copy_from_slice(self.host_vmcs.as_ref());
        vmcs.vmptrld(self.host_vmcs.phys_addr);
        self.host_launched = false;

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmxoff<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;

        self.purge_vvmcs(vmcs);
        self.vmxon_region = None;

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmptrld<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;
        let decoded = decode_instruction(ctx, vmcs, regs)?;
        let gpa = GuestPhysAddr::new(read_operand(ctx, regs, &decoded)? as usize);

        if Some(gpa) == self.vmxon_region || !gpa.is_page_aligned() {
            vmreturn(regs, VmxStatus::FailInvalid);
            return Ok(());
        }

        if self.current_vvmcs_gpa() != Some(gpa) {
            self.purge_vvmcs(vmcs);
        }

        if self.current_vvmcs.is_none() && !self.load_current_vvmcs(ctx, gpa) {
            log::error!("vmptrld: cannot map vvmcs frame at {:#x}", gpa.as_usize());
            vmreturn(regs, VmxStatus::FailInvalid);
            return Ok(());
        }

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmptrst<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;
        let decoded = decode_instruction(ctx, vmcs, regs)?;

        let gpa = match self.current_vvmcs_gpa() {
            Some(gpa) => gpa.as_u64(),
            None => VMCS_ADDR_INVALID,
        };
        write_operand(ctx, regs, &decoded, gpa)?;

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmclear<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;
        let decoded = decode_instruction(ctx, vmcs, regs)?;
        let gpa = GuestPhysAddr::new(read_operand(ctx, regs, &decoded)? as usize);

        if !gpa.is_page_aligned() {
            vmreturn(regs, VmxStatus::FailInvalid);
            return Ok(());
        }

        match self.current_vvmcs_gpa() {
            Some(current) if current != gpa => {
                // Clearing a VMCS that is not loaded needs nothing from us.
                log::warn!(
                    "vmclear gpa {:#x} is not the current vmcs {:#x}",
                    gpa.as_usize(),
                    current.as_usize()
                );
            }
            current => {
                if current.is_some() {
                    self.set_launch_state(0);
                }
                self.purge_vvmcs(vmcs);
            }
        }

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmread<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;
        let decoded = decode_instruction(ctx, vmcs, regs)?;

        let map = match self.current_vvmcs.as_ref() {
            Some((_, map)) => map,
            None => {
                vmreturn(regs, VmxStatus::FailInvalid);
                return Ok(());
            }
        };

        // The field encoding comes from a register, never from an immediate.
        let field = VmcsField::new(regs.get(decoded.reg2()) as u32);
        let value = vvmcs::read_vvmcs(map.slots(), field);
        write_operand(ctx, regs, &decoded, value)?;

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmwrite<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;
        let decoded = decode_instruction(ctx, vmcs, regs)?;
        let value = read_operand(ctx, regs, &decoded)?;

        let map = match self.current_vvmcs.as_mut() {
            Some((_, map)) => map,
            None => {
                vmreturn(regs, VmxStatus::FailInvalid);
                return Ok(());
            }
        };

        let field = VmcsField::new(regs.get(decoded.reg2()) as u32);
        vvmcs::write_vvmcs(map.slots_mut(), field, value);

        // A rewritten bitmap address invalidates the mapping we hold.
        if field == VmcsField::IO_BITMAP_A || field == VmcsField::IO_BITMAP_A_HIGH {
            self.remap_io_bitmap(ctx, IoBitmap::A);
        } else if field == VmcsField::IO_BITMAP_B || field == VmcsField::IO_BITMAP_B_HIGH {
            self.remap_io_bitmap(ctx, IoBitmap::B);
        }

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmlaunch<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        _vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;

        if !self.nested_entry_ready() {
            vmreturn(regs, VmxStatus::FailInvalid);
            return Ok(());
        }
        // A launched VMCS must be resumed, not launched again.
        if self.launch_state() != Some(0) {
            vmreturn(regs, VmxStatus::FailValid);
            return Ok(());
        }

        self.vm_entry_pending = true;
        self.set_launch_state(1);

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    fn handle_vmresume<V: HostVmcs>(
        &mut self,
        ctx: &mut P,
        _vmcs: &mut V,
        regs: &mut GuestRegs,
    ) -> Result<(), InstrError> {
        check_privilege(ctx, regs, self.vmxon_region, false)?;

        if !self.nested_entry_ready() {
            vmreturn(regs, VmxStatus::FailInvalid);
            return Ok(());
        }
        // A clear VMCS must be launched first.
        if self.launch_state() == Some(0) {
            vmreturn(regs, VmxStatus::FailValid);
            return Ok(());
        }

        self.vm_entry_pending = true;

        vmreturn(regs, VmxStatus::Succeed);
        Ok(())
    }

    /// A nested entry needs a current VVMCS, and when L1 asked for I/O
    /// bitmap exiting, both bitmap frames mapped.
    fn nested_entry_ready(&self) -> bool {
        let ctl = match self.exec_control() {
            Ok(ctl) => PrimaryControls::from_bits_truncate(ctl),
            Err(_) => return false,
        };
        if ctl.contains(PrimaryControls::USE_IO_BITMAPS) {
            self.io_bitmap[0].is_some() && self.io_bitmap[1].is_some()
        } else {
            true
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
