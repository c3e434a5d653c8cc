//! VMX instruction-operand decoding
//!
//! A VM exit caused by a VMX instruction leaves the operand shape in the
//! VMX-instruction-information field and the memory displacement in the exit
//! qualification; there is no need to fetch or parse instruction bytes. The
//! decoder turns the pair into either a register-form or a memory-form
//! operand with its guest-linear address.
//!
//! See Intel SDM, Volume 3C, Section 27.2.4, Table 27-9.

use utils::GuestVirtAddr;

use crate::errors::{Exception, InstrError};
use crate::fields::VmcsField;
use crate::platform::{GuestContext, HostVmcs};
use crate::regs::{GuestRegs, Register, Segment};

// ———————————————————————— Instruction Information ————————————————————————— //

/// The VMX-instruction-information field.
#[derive(Clone, Copy, Debug)]
pub struct VmxInstrInfo(u32);

impl VmxInstrInfo {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Index scaling: 1, 2, 4 or 8.
    fn scale(self) -> u64 {
        1 << (self.0 & 0b11)
    }

    fn reg1(self) -> Register {
        Register::from_raw((self.0 >> 3) & 0xf)
    }

    /// Operand length derived from the address size: 2, 4 or 8 bytes.
    fn operand_len(self) -> usize {
        1 << (((self.0 >> 7) & 0b111) + 1)
    }

    /// True for the register form of the instruction.
    fn is_reg_form(self) -> bool {
        self.0 & (1 << 10) != 0
    }

    fn segment(self) -> u32 {
        (self.0 >> 15) & 0b111
    }

    /// The index register, unless marked invalid.
    fn index_reg(self) -> Option<Register> {
        if self.0 & (1 << 22) != 0 {
            None
        } else {
            Some(Register::from_raw((self.0 >> 18) & 0xf))
        }
    }

    /// The base register, unless marked invalid.
    fn base_reg(self) -> Option<Register> {
        if self.0 & (1 << 27) != 0 {
            None
        } else {
            Some(Register::from_raw((self.0 >> 23) & 0xf))
        }
    }

    fn reg2(self) -> Register {
        Register::from_raw((self.0 >> 28) & 0xf)
    }
}

// ————————————————————————————— Decoded Operand ———————————————————————————— //

/// A decoded VMX instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Register form.
    Register { reg1: Register, reg2: Register },
    /// Memory form, with the guest-linear address and access length.
    Memory {
        addr: GuestVirtAddr,
        len: usize,
        reg2: Register,
    },
}

impl Decoded {
    /// The second register operand, present in both forms.
    pub fn reg2(&self) -> Register {
        match *self {
            Decoded::Register { reg2, .. } => reg2,
            Decoded::Memory { reg2, .. } => reg2,
        }
    }
}

// ———————————————————————————————— Decoding ———————————————————————————————— //

/// Decodes the operand form of the VMX instruction that just exited.
///
/// Memory operands are checked against the segment limit except in long
/// mode, where only GS-relative accesses keep the check (FS/GS are the
/// segments that still carry a meaningful base there).
pub fn decode_instruction<P: GuestContext, V: HostVmcs>(
    ctx: &mut P,
    vmcs: &V,
    regs: &GuestRegs,
) -> Result<Decoded, InstrError> {
    let info = VmxInstrInfo::new(vmcs.vmread(VmcsField::VMX_INSTRUCTION_INFO) as u32);

    if info.is_reg_form() {
        return Ok(Decoded::Register {
            reg1: info.reg1(),
            reg2: info.reg2(),
        });
    }

    let segment = match Segment::from_raw(info.segment()) {
        Some(segment) => segment,
        None => return Err(gp_fault(ctx)),
    };
    let seg = ctx.segment(segment);

    let base = info.base_reg().map(|reg| regs.get(reg)).unwrap_or(0);
    let index = info.index_reg().map(|reg| regs.get(reg)).unwrap_or(0);
    let disp = vmcs.vmread(VmcsField::EXIT_QUALIFICATION);
    let len = info.operand_len();

    let offset = base
        .wrapping_add(index.wrapping_mul(info.scale()))
        .wrapping_add(disp);

    let beyond_limit =
        offset > seg.limit as u64 || offset.wrapping_add(len as u64) > seg.limit as u64;
    if beyond_limit && (!ctx.long_mode() || segment == Segment::Gs) {
        return Err(gp_fault(ctx));
    }

    Ok(Decoded::Memory {
        addr: GuestVirtAddr::new(seg.base.wrapping_add(offset) as usize),
        len,
        reg2: info.reg2(),
    })
}

/// Reads the operand value: register contents for the register form, a
/// zero-extended little-endian load for the memory form.
pub fn read_operand<P: GuestContext>(
    ctx: &mut P,
    regs: &GuestRegs,
    decoded: &Decoded,
) -> Result<u64, InstrError> {
    match *decoded {
        Decoded::Register { reg1, .. } => Ok(regs.get(reg1)),
        Decoded::Memory { addr, len, .. } => {
            let mut bytes = [0u8; 8];
            let len = len.min(bytes.len());
            ctx.copy_from_guest(&mut bytes[..len], addr)?;
            Ok(u64::from_le_bytes(bytes))
        }
    }
}

/// Writes a value to the operand location: the full register for the
/// register form, the low operand-length bytes for the memory form.
pub fn write_operand<P: GuestContext>(
    ctx: &mut P,
    regs: &mut GuestRegs,
    decoded: &Decoded,
    value: u64,
) -> Result<(), InstrError> {
    match *decoded {
        Decoded::Register { reg1, .. } => {
            regs.set(reg1, value);
            Ok(())
        }
        Decoded::Memory { addr, len, .. } => {
            let bytes = value.to_le_bytes();
            let len = len.min(bytes.len());
            ctx.copy_to_guest(addr, &bytes[..len])?;
            Ok(())
        }
    }
}

fn gp_fault<P: GuestContext>(ctx: &mut P) -> InstrError {
    let fault = Exception::GeneralProtection(0);
    ctx.inject_exception(fault);
    InstrError::Fault(fault)
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{mem_form, reg_form, FakeContext, FakeVmcs};

    #[test]
    fn register_form() {
        let mut ctx = FakeContext::new(4);
        let mut vmcs = FakeVmcs::new();
        let regs = GuestRegs::new();

        vmcs.vmwrite(
            VmcsField::VMX_INSTRUCTION_INFO,
            reg_form(Register::Rbx, Register::Rdi),
        );

        let decoded = decode_instruction(&mut ctx, &vmcs, &regs).unwrap();
        assert_eq!(
            decoded,
            Decoded::Register {
                reg1: Register::Rbx,
                reg2: Register::Rdi,
            }
        );
    }

    #[test]
    fn memory_form_linear_address() {
        let mut ctx = FakeContext::new(4);
        let mut vmcs = FakeVmcs::new();
        let mut regs = GuestRegs::new();

        // base = RAX, index = RBX scaled by 4, displacement 0x20, DS based
        // at 0x100000.
        ctx.segments[Segment::Ds as usize].base = 0x10_0000;
        regs.set(Register::Rax, 0x1000);
        regs.set(Register::Rbx, 0x10);
        vmcs.vmwrite(
            VmcsField::VMX_INSTRUCTION_INFO,
            mem_form(
                2, // scaling: x4
                2, // addr size: 64 bits
                Segment::Ds,
                Some(Register::Rbx),
                Some(Register::Rax),
                Register::Rcx,
            ),
        );
        vmcs.vmwrite(VmcsField::EXIT_QUALIFICATION, 0x20);

        let decoded = decode_instruction(&mut ctx, &vmcs, &regs).unwrap();
        assert_eq!(
            decoded,
            Decoded::Memory {
                addr: GuestVirtAddr::new(0x10_1060),
                len: 8,
                reg2: Register::Rcx,
            }
        );
    }

    #[test]
    fn memory_form_without_base_or_index() {
        let mut ctx = FakeContext::new(4);
        let mut vmcs = FakeVmcs::new();
        let regs = GuestRegs::new();

        vmcs.vmwrite(
            VmcsField::VMX_INSTRUCTION_INFO,
            mem_form(0, 1, Segment::Es, None, None, Register::Rax),
        );
        vmcs.vmwrite(VmcsField::EXIT_QUALIFICATION, 0x1234);

        let decoded = decode_instruction(&mut ctx, &vmcs, &regs).unwrap();
        assert_eq!(
            decoded,
            Decoded::Memory {
                addr: GuestVirtAddr::new(0x1234),
                len: 4,
                reg2: Register::Rax,
            }
        );
    }

    #[test]
    fn reserved_segment_faults() {
        let mut ctx = FakeContext::new(4);
        let mut vmcs = FakeVmcs::new();
        let regs = GuestRegs::new();

        // Segment number 6 is reserved.
        let info = mem_form(0, 2, Segment::Es, None, None, Register::Rax) | 6 << 15;
        vmcs.vmwrite(VmcsField::VMX_INSTRUCTION_INFO, info);

        let res = decode_instruction(&mut ctx, &vmcs, &regs);
        assert_eq!(
            res,
            Err(InstrError::Fault(Exception::GeneralProtection(0)))
        );
        assert_eq!(ctx.injected, vec![Exception::GeneralProtection(0)]);
    }

    #[test]
    fn limit_enforced_outside_long_mode() {
        let mut ctx = FakeContext::new(4);
        let mut vmcs = FakeVmcs::new();
        let regs = GuestRegs::new();

        ctx.long_mode = false;
        ctx.segments[Segment::Ds as usize].limit = 0xfff;
        vmcs.vmwrite(
            VmcsField::VMX_INSTRUCTION_INFO,
            mem_form(0, 2, Segment::Ds, None, None, Register::Rax),
        );
        vmcs.vmwrite(VmcsField::EXIT_QUALIFICATION, 0x2000);

        let res = decode_instruction(&mut ctx, &vmcs, &regs);
        assert_eq!(
            res,
            Err(InstrError::Fault(Exception::GeneralProtection(0)))
        );
    }

    #[test]
    fn limit_ignored_in_long_mode_except_gs() {
        let mut ctx = FakeContext::new(4);
        let mut vmcs = FakeVmcs::new();
        let regs = GuestRegs::new();

        ctx.segments[Segment::Ds as usize].limit = 0xfff;
        ctx.segments[Segment::Gs as usize].limit = 0xfff;
        vmcs.vmwrite(
            VmcsField::VMX_INSTRUCTION_INFO,
            mem_form(0, 2, Segment::Ds, None, None, Register::Rax),
        );
        vmcs.vmwrite(VmcsField::EXIT_QUALIFICATION, 0x2000);
        assert!(decode_instruction(&mut ctx, &vmcs, &regs).is_ok());

        vmcs.vmwrite(
            VmcsField::VMX_INSTRUCTION_INFO,
            mem_form(0, 2, Segment::Gs, None, None, Register::Rax),
        );
        let res = decode_instruction(&mut ctx, &vmcs, &regs);
        assert_eq!(
            res,
            Err(InstrError::Fault(Exception::GeneralProtection(0)))
        );
    }

    #[test]
    fn operand_read_zero_extends() {
        let mut ctx = FakeContext::new(4);
        ctx.write_mem(0x100, &[0xdd, 0xcc, 0xbb, 0xaa]);

        let decoded = Decoded::Memory {
            addr: GuestVirtAddr::new(0x100),
            len: 4,
            reg2: Register::Rax,
        };
        let mut regs = GuestRegs::new();
        regs.set(Register::Rax, 0xffff_ffff_ffff_ffff);

        assert_eq!(read_operand(&mut ctx, &regs, &decoded), Ok(0xaabb_ccdd));
    }

    #[test]
    fn operand_read_beyond_memory_fails() {
        let mut ctx = FakeContext::new(1);
        let regs = GuestRegs::new();
        let decoded = Decoded::Memory {
            addr: GuestVirtAddr::new(0x10_0000),
            len: 8,
            reg2: Register::Rax,
        };

        assert_eq!(
            read_operand(&mut ctx, &regs, &decoded),
            Err(InstrError::BadGuestAccess)
        );
    }

    #[test]
    fn operand_write_truncates_to_length() {
        let mut ctx = FakeContext::new(4);
        let mut regs = GuestRegs::new();
        let decoded = Decoded::Memory {
            addr: GuestVirtAddr::new(0x200),
            len: 4,
            reg2: Register::Rax,
        };

        write_operand(&mut ctx, &mut regs, &decoded, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(ctx.read_mem(0x200, 8), [0x88, 0x77, 0x66, 0x55, 0, 0, 0, 0]);
    }
}
