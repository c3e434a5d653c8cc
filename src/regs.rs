//! Guest registers and segments
//!
//! The dispatcher works on a snapshot of the guest's general purpose
//! registers and RFLAGS captured at VM exit; the outer emulator writes the
//! snapshot back before resuming the guest.

/// General purpose registers, numbered the way VMX instruction-information
/// fields and exit qualifications encode them.
///
/// See Intel SDM, Volume 3C, Table 27-3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Register {
    /// Decodes a 4-bit hardware register number.
    pub fn from_raw(v: u32) -> Register {
        match v {
            0 => Register::Rax,
            1 => Register::Rcx,
            2 => Register::Rdx,
            3 => Register::Rbx,
            4 => Register::Rsp,
            5 => Register::Rbp,
            6 => Register::Rsi,
            7 => Register::Rdi,
            8 => Register::R8,
            9 => Register::R9,
            10 => Register::R10,
            11 => Register::R11,
            12 => Register::R12,
            13 => Register::R13,
            14 => Register::R14,
            15 => Register::R15,
            _ => panic!("Invalid register number."),
        }
    }
}

/// The register file size.
pub const REGFILE_SIZE: usize = 16;

/// Snapshot of the guest general purpose registers and RFLAGS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestRegs {
    regs: [u64; REGFILE_SIZE],
    pub rflags: u64,
}

impl GuestRegs {
    pub fn new() -> Self {
        Self {
            regs: [0; REGFILE_SIZE],
            // Bit 1 reads as 1 on every x86.
            rflags: 1 << 1,
        }
    }

    /// Returns a given register.
    pub fn get(&self, register: Register) -> u64 {
        self.regs[register as usize]
    }

    /// Sets a given register.
    pub fn set(&mut self, register: Register, value: u64) {
        self.regs[register as usize] = value;
    }
}

impl Default for GuestRegs {
    fn default() -> Self {
        Self::new()
    }
}

/// Segment registers, numbered the way the VMX instruction-information
/// field encodes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Segment {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl Segment {
    /// Decodes the 3-bit segment number; values above 5 are reserved and
    /// decode to `None`.
    pub fn from_raw(v: u32) -> Option<Segment> {
        match v {
            0 => Some(Segment::Es),
            1 => Some(Segment::Cs),
            2 => Some(Segment::Ss),
            3 => Some(Segment::Ds),
            4 => Some(Segment::Fs),
            5 => Some(Segment::Gs),
            _ => None,
        }
    }
}

/// The cached state of a guest segment register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// The L bit from the access rights: 64-bit code segment.
    pub long: bool,
}

// ————————————————————————————————— Tests —————————————————————————————————— //
