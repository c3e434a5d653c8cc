//! VMCS field encodings
//!
//! A VMCS field is named by a 16-bit encoding packing an access type, an
//! index, a field type and a width. VMREAD and VMWRITE hand the core raw
//! encodings taken from guest registers, so the type here wraps an arbitrary
//! word and exposes its decomposition; the fields the core itself interprets
//! are named as associated constants.
//!
//! See Intel SDM, Volume 3C, Section 24.11.2, Table 24-21.

// ———————————————————————— Masks from Intel Manual ————————————————————————— //

pub const VMCS_FIELD_ACCESS_TYPE_SHIFT: u32 = 0;
pub const VMCS_FIELD_INDEX_SHIFT: u32 = 1;
pub const VMCS_FIELD_TYPE_SHIFT: u32 = 10;
pub const VMCS_FIELD_WIDTH_SHIFT: u32 = 13;

pub const VMCS_FIELD_ACCESS_TYPE_MASK: u32 = 1 << VMCS_FIELD_ACCESS_TYPE_SHIFT;
pub const VMCS_FIELD_INDEX_MASK: u32 = 0b1_1111_1111 << VMCS_FIELD_INDEX_SHIFT;
pub const VMCS_FIELD_TYPE_MASK: u32 = 0b11 << VMCS_FIELD_TYPE_SHIFT;
pub const VMCS_FIELD_WIDTH_MASK: u32 = 0b11 << VMCS_FIELD_WIDTH_SHIFT;

// ————————————————————————————— Field Encoding ————————————————————————————— //

/// A VMCS field encoding, as handed to VMREAD and VMWRITE.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct VmcsField(u32);

#[rustfmt::skip]
impl VmcsField {
    pub const VIRTUAL_PROCESSOR_ID: Self   = Self(0x0000_0000);
    pub const IO_BITMAP_A: Self            = Self(0x0000_2000);
    pub const IO_BITMAP_A_HIGH: Self       = Self(0x0000_2001);
    pub const IO_BITMAP_B: Self            = Self(0x0000_2002);
    pub const IO_BITMAP_B_HIGH: Self       = Self(0x0000_2003);
    pub const MSR_BITMAP: Self             = Self(0x0000_2004);
    pub const CPU_BASED_EXEC_CONTROL: Self = Self(0x0000_4002);
    pub const EXCEPTION_BITMAP: Self       = Self(0x0000_4004);
    pub const SECONDARY_EXEC_CONTROL: Self = Self(0x0000_401E);
    pub const VM_INSTRUCTION_ERROR: Self   = Self(0x0000_4400);
    pub const VMX_INSTRUCTION_INFO: Self   = Self(0x0000_440E);
    pub const EXIT_QUALIFICATION: Self     = Self(0x0000_6400);
    pub const GUEST_RFLAGS: Self           = Self(0x0000_6820);

    /// Launch state of a virtual VMCS. This is not an architectural field:
    /// it lives in the vacant 16-bit read-only-data window of the encoding
    /// space, which no hardware-defined field occupies.
    pub const LAUNCH_STATE: Self           = Self(0x0000_0400);
}

impl VmcsField {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn access_type(self) -> VmcsFieldAccessType {
        VmcsFieldAccessType::from_raw(
            ((self.0 & VMCS_FIELD_ACCESS_TYPE_MASK) >> VMCS_FIELD_ACCESS_TYPE_SHIFT) as u8,
        )
    }

    pub fn index(self) -> u32 {
        (self.0 & VMCS_FIELD_INDEX_MASK) >> VMCS_FIELD_INDEX_SHIFT
    }

    pub fn tpe(self) -> VmcsFieldType {
        VmcsFieldType::from_raw(((self.0 & VMCS_FIELD_TYPE_MASK) >> VMCS_FIELD_TYPE_SHIFT) as u8)
    }

    pub fn width(self) -> VmcsFieldWidth {
        VmcsFieldWidth::from_raw(((self.0 & VMCS_FIELD_WIDTH_MASK) >> VMCS_FIELD_WIDTH_SHIFT) as u8)
    }
}

/// Valid VmcsFieldAccessType as encoded in a field encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VmcsFieldAccessType {
    Full = 0,
    High = 1,
}

impl VmcsFieldAccessType {
    pub fn from_raw(v: u8) -> VmcsFieldAccessType {
        match v {
            0 => VmcsFieldAccessType::Full,
            1 => VmcsFieldAccessType::High,
            _ => panic!("Invalid VMCS access type."),
        }
    }
}

/// Valid VmcsFieldWidth as encoded in a field encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VmcsFieldWidth {
    Width16 = 0,
    Width64 = 1,
    Width32 = 2,
    WidthNat = 3,
}

impl VmcsFieldWidth {
    pub fn from_raw(v: u8) -> VmcsFieldWidth {
        match v {
            0 => VmcsFieldWidth::Width16,
            1 => VmcsFieldWidth::Width64,
            2 => VmcsFieldWidth::Width32,
            3 => VmcsFieldWidth::WidthNat,
            _ => panic!("Invalid VMCS field width value"),
        }
    }
}

/// Types of VMCS fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VmcsFieldType {
    Control = 0,
    VmExitInformation = 1,
    GuestState = 2,
    HostState = 3,
}

impl VmcsFieldType {
    pub fn from_raw(v: u8) -> VmcsFieldType {
        match v {
            0 => VmcsFieldType::Control,
            1 => VmcsFieldType::VmExitInformation,
            2 => VmcsFieldType::GuestState,
            3 => VmcsFieldType::HostState,
            _ => panic!("Invalid VMCS field type value"),
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
