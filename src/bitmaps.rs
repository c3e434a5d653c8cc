//! VMX bitmaps
//!
//! Wrappers for simple and type safe manipulation of the bit vectors the
//! nested core interprets: execution controls, the exception bitmap and
//! guest RFLAGS.

use bitflags::bitflags;

bitflags! {
    /// Primary processor-based VM-execution controls.
    ///
    /// Only the flags the nested core inspects or filters are named here.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.2, Table 24-6.
    pub struct PrimaryControls: u32 {
        /// Interrupt-window exiting.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// HLT exiting.
        const HLT_EXITING              = 1 << 7;
        /// Use TPR shadow.
        const USE_TPR_SHADOW           = 1 << 21;
        /// MOV-DR exiting.
        const MOV_DR_EXITING           = 1 << 23;
        /// Unconditional I/O exiting.
        const UNCOND_IO_EXITING        = 1 << 24;
        /// Use I/O bitmaps.
        const USE_IO_BITMAPS           = 1 << 25;
        /// Monitor trap flag.
        const MONITOR_TRAP_FLAG        = 1 << 27;
        /// Use MSR bitmaps.
        const USE_MSR_BITMAPS          = 1 << 28;
        /// Activate secondary controls.
        const SECONDARY_CONTROLS       = 1 << 31;
    }

    /// Secondary processor-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.2, Table 24-7.
    pub struct SecondaryControls: u32 {
        /// Virtualize APIC accesses.
        const VIRTUALIZE_APIC          = 1 << 0;
        /// Enable EPT.
        const ENABLE_EPT               = 1 << 1;
        /// Enable RDTSCP.
        const ENABLE_RDTSCP            = 1 << 3;
        /// Enable VPID.
        const ENABLE_VPID              = 1 << 5;
        /// WBINVD exiting.
        const WBINVD_EXITING           = 1 << 6;
        /// Unrestricted guest.
        const UNRESTRICTED_GUEST       = 1 << 7;
        /// VMCS shadowing.
        const VMCS_SHADOWING           = 1 << 14;
    }

    /// Exception bitmap: a set bit causes the matching guest exception to
    /// exit to the VMM.
    pub struct ExceptionBitmap: u32 {
        // Divide error #DE
        const DIVIDE_ERROR             = 1 << 0;
        // Debug #DB
        const DEBUG                    = 1 << 1;
        // Non Maskable Interrupt (NMI)
        const NMI                      = 1 << 2;
        // Breakpoint #BP
        const BREAKPOINT               = 1 << 3;
        // Invalid Opcode #UD
        const INVALID_OPCODE           = 1 << 6;
        // Double fault
        const DOUBLE_FAULT             = 1 << 8;
        // Stack segment #SS
        const STACK_SEGMENT_FAULT      = 1 << 12;
        // General protection fault #GP
        const GENERAL_PROTECTION_FAULT = 1 << 13;
        // Page fault #PF
        const PAGE_FAULT               = 1 << 14;
        // Machine check #MC
        const MACHINE_CHECK            = 1 << 18;
    }

    /// The RFLAGS bits touched by the VMX status convention, plus the VM
    /// flag checked by the privilege gate.
    pub struct RFlags: u64 {
        /// Carry flag.
        const CARRY_FLAG           = 1 << 0;
        /// Parity flag.
        const PARITY_FLAG          = 1 << 2;
        /// Auxiliary carry flag.
        const AUXILIARY_CARRY_FLAG = 1 << 4;
        /// Zero flag.
        const ZERO_FLAG            = 1 << 6;
        /// Sign flag.
        const SIGN_FLAG            = 1 << 7;
        /// Overflow flag.
        const OVERFLOW_FLAG        = 1 << 11;
        /// Virtual-8086 mode.
        const VIRTUAL_8086_MODE    = 1 << 17;
    }
}
