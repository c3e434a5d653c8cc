//! Nested VMX support
//!
//! This crate lets an L1 guest run its own hypervisor: it emulates the VMX
//! instruction set on L1's behalf, keeps track of the virtual VMCS (VVMCS)
//! pages L1 points the core at, and synthesizes the execution controls the
//! hardware VMCS needs for an L2 entry.
//!
//! The core is a per-vCPU state machine with no locking: only the thread
//! running a vCPU ever touches its nested state. Everything the machine
//! needs from the outside (registers, guest memory, the logical CPU's VMCS)
//! comes in through the [`platform`] traits.

#![cfg_attr(not(test), no_std)]

pub mod bitmaps;
pub mod check;
pub mod decode;
pub mod errors;
pub mod fields;
pub mod instr;
pub mod platform;
pub mod regs;
pub mod shadow;
pub mod vvmcs;

#[cfg(test)]
pub(crate) mod testing;

use utils::{Frame, GuestPhysAddr};

use crate::errors::NvmxError;
use crate::fields::VmcsField;
use crate::platform::{GuestContext, GuestFrameRw, HostVmcs};

pub use crate::errors::{Exception, InstrError, NvmxError as Error, VmxStatus};
pub use crate::instr::VmxOpcode;
pub use crate::regs::{GuestRegs, Register};

/// The value VMPTRST reports while no VVMCS is current.
pub const VMCS_ADDR_INVALID: u64 = !0;

/// Basic VMX information, captured once at boot and shared by every vCPU.
///
/// See Intel SDM Vol. 3D Appendix A-1.
#[derive(Clone, Debug)]
pub struct VmxInfo {
    /// The 31-bits VMCS revision identifier used by the CPU.
    pub revision: u32,

    /// Minimum required size in bytes for VMCS and VMXON regions.
    pub vmcs_width: u32,
}

/// Interruption state latched for the outer exit-reflection path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingIntr {
    pub intr_info: u32,
    pub error_code: u32,
}

/// Identifies one of the two I/O bitmap pages of a VMCS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoBitmap {
    A,
    B,
}

impl IoBitmap {
    fn index(self) -> usize {
        match self {
            IoBitmap::A => 0,
            IoBitmap::B => 1,
        }
    }

    fn field(self) -> VmcsField {
        match self {
            IoBitmap::A => VmcsField::IO_BITMAP_A,
            IoBitmap::B => VmcsField::IO_BITMAP_B,
        }
    }
}

// ————————————————————————————— Per-vCPU State ————————————————————————————— //

/// Nested VMX state of a single vCPU.
///
/// The vCPU is always in exactly one of three modes: outside VMX operation
/// (`vmxon_region` is `None`), in VMX operation with no current VVMCS, or in
/// VMX operation with a current VVMCS mapped. The VVMCS address and its
/// mapping live in one `Option` so the two can never disagree.
pub struct NestedVmx<P: GuestContext> {
    info: VmxInfo,

    /// Guest physical address of the VMXON region, `None` until L1 executes
    /// VMXON.
    pub(crate) vmxon_region: Option<GuestPhysAddr>,

    /// Exclusively owned backing store for the hardware VMCS while L2 runs.
    /// Kept clear (uncached on every logical CPU) whenever L2 does not.
    pub(crate) shadow_vmcs: Frame,

    /// The L0/L1-boundary VMCS used when L1 runs directly. Non-owning.
    pub(crate) host_vmcs: Frame,

    /// The VVMCS L1 pointed the core at, with its read-write mapping.
    pub(crate) current_vvmcs: Option<(GuestPhysAddr, P::FrameRw)>,

    /// Read-only mappings of the guest frames named by the IO_BITMAP_A and
    /// IO_BITMAP_B fields of the current VVMCS.
    pub(crate) io_bitmap: [Option<P::FrameRo>; 2],

    /// Tells the scheduler that the next resume must enter L2.
    pub(crate) vm_entry_pending: bool,

    /// Launch state of the host VMCS; cleared by the VMXON snapshot so that
    /// the next L1 entry uses VMLAUNCH.
    pub(crate) host_launched: bool,

    /// Interruption info to reflect into L1, owned by the outer exit path.
    pub pending_intr: PendingIntr,
}

impl<P: GuestContext> NestedVmx<P> {
    /// Creates the nested state for a vCPU.
    ///
    /// `shadow_vmcs` must be an exclusively owned frame; it is initialized
    /// with the VMCS revision the way the hardware expects. `host_vmcs` is
    /// the frame backing the L0/L1 boundary VMCS and stays owned by the
    /// caller.
    pub fn new(info: VmxInfo, mut shadow_vmcs: Frame, host_vmcs: Frame) -> Self {
        shadow_vmcs.zero_out();
        shadow_vmcs.as_mut()[0..4].copy_from_slice(&info.revision.to_le_bytes());

        Self {
            info,
            vmxon_region: None,
            shadow_vmcs,
            host_vmcs,
            current_vvmcs: None,
            io_bitmap: [None, None],
            vm_entry_pending: false,
            host_launched: false,
            pending_intr: PendingIntr::default(),
        }
    }

    /// Tears the nested state down: releases every guest mapping and makes
    /// sure no logical CPU caches the shadow VMCS. The caller frees the
    /// frame afterwards.
    pub fn destroy<V: HostVmcs>(&mut self, vmcs: &mut V) {
        self.purge_vvmcs(vmcs);
        vmcs.vmclear(self.shadow_vmcs.phys_addr);
    }

    /// Hook for vCPU reset; the nested state survives INIT unchanged.
    pub fn vcpu_reset(&mut self) {}

    pub fn vmx_info(&self) -> &VmxInfo {
        &self.info
    }

    /// Whether L1 executed VMXON.
    pub fn vmxon_active(&self) -> bool {
        self.vmxon_region.is_some()
    }

    /// The guest physical address of the current VVMCS, if any.
    pub fn current_vvmcs_gpa(&self) -> Option<GuestPhysAddr> {
        self.current_vvmcs.as_ref().map(|(gpa, _)| *gpa)
    }

    /// The frame backing the hardware VMCS while L2 runs.
    pub fn shadow_vmcs(&self) -> Frame {
        self.shadow_vmcs
    }

    /// Consumes the pending-entry flag; the scheduler calls this before
    /// resuming the guest and performs a nested entry when it was set.
    pub fn take_vm_entry_pending(&mut self) -> bool {
        core::mem::replace(&mut self.vm_entry_pending, false)
    }

    /// Whether the host VMCS has been launched since the last VMXON.
    pub fn host_launched(&self) -> bool {
        self.host_launched
    }

    pub fn set_host_launched(&mut self, launched: bool) {
        self.host_launched = launched;
    }

    // ——————————————————————————————— Stubs ———————————————————————————————— //

    /// L2 guest CR3, needed once the shadow page-table layer lands.
    pub fn vcpu_guest_cr3(&self) -> Result<u64, NvmxError> {
        Err(NvmxError::NotImplemented)
    }

    /// L1-side CR3 for the L2 address space.
    pub fn vcpu_host_cr3(&self) -> Result<u64, NvmxError> {
        Err(NvmxError::NotImplemented)
    }

    /// Address-space identifier of the running L2.
    pub fn vcpu_asid(&self) -> Result<u32, NvmxError> {
        Err(NvmxError::NotImplemented)
    }

    // ————————————————————————— VVMCS Lifecycle ———————————————————————————— //

    /// Makes sure no logical CPU caches the shadow VMCS.
    pub(crate) fn clear_shadow<V: HostVmcs>(&mut self, vmcs: &mut V) {
        vmcs.vmclear(self.shadow_vmcs.phys_addr);
    }

    /// Points the vCPU at a new VVMCS: maps its backing frame read-write and
    /// both I/O bitmap frames it names. Returns false if the frame does not
    /// resolve to guest memory.
    pub(crate) fn load_current_vvmcs(&mut self, ctx: &mut P, gpa: GuestPhysAddr) -> bool {
        let map = match ctx.map_frame_rw(gpa.frame_number()) {
            Some(map) => map,
            None => return false,
        };
        self.current_vvmcs = Some((gpa, map));
        self.remap_io_bitmap(ctx, IoBitmap::A);
        self.remap_io_bitmap(ctx, IoBitmap::B);
        true
    }

    /// Re-reads the bitmap address stored in the current VVMCS and maps that
    /// frame read-only, replacing any previous mapping.
    pub(crate) fn remap_io_bitmap(&mut self, ctx: &mut P, which: IoBitmap) {
        self.io_bitmap[which.index()] = None;

        let map = match self.current_vvmcs.as_ref() {
            Some((_, map)) => map,
            None => return,
        };
        let gpa = GuestPhysAddr::new(vvmcs::read_vvmcs(map.slots(), which.field()) as usize);
        self.io_bitmap[which.index()] = ctx.map_frame_ro(gpa.frame_number());
    }

    /// Drops everything tied to the current VVMCS: clears the shadow VMCS
    /// from the logical CPU and releases the VVMCS and I/O bitmap mappings.
    ///
    /// Runs on VMXOFF, on VMPTRLD of a different address, and on vCPU
    /// destruction.
    pub(crate) fn purge_vvmcs<V: HostVmcs>(&mut self, vmcs: &mut V) {
        self.clear_shadow(vmcs);
        self.current_vvmcs = None;
        self.io_bitmap = [None, None];
    }

    // —————————————————————————— VVMCS Accessors ——————————————————————————— //

    /// L1's CPU-based execution controls, read from the current VVMCS.
    pub(crate) fn exec_control(&self) -> Result<u32, NvmxError> {
        let (_, map) = self.current_vvmcs.as_ref().ok_or(NvmxError::NoCurrentVvmcs)?;
        Ok(vvmcs::read_vvmcs(map.slots(), VmcsField::CPU_BASED_EXEC_CONTROL) as u32)
    }

    /// Launch state of the current VVMCS; `None` without one.
    pub(crate) fn launch_state(&self) -> Option<u64> {
        let (_, map) = self.current_vvmcs.as_ref()?;
        Some(vvmcs::read_vvmcs(map.slots(), VmcsField::LAUNCH_STATE))
    }

    pub(crate) fn set_launch_state(&mut self, launched: u64) {
        if let Some((_, map)) = self.current_vvmcs.as_mut() {
            vvmcs::write_vvmcs(map.slots_mut(), VmcsField::LAUNCH_STATE, launched);
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
