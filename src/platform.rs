//! Host surfaces consumed by the nested VMX core
//!
//! The core runs inside a larger monitor that owns the vCPU, the guest
//! memory map and the logical CPU's VMCS. Those surfaces are reached through
//! the traits here so that the core stays a pure per-vCPU state machine.

use utils::{GuestVirtAddr, HostPhysAddr, PAGE_SIZE, PAGE_SLOTS};

use crate::errors::{CopyFailed, Exception};
use crate::fields::VmcsField;
use crate::regs::{Segment, SegmentRegister};

/// A read-only mapping of a guest frame, released by dropping the handle.
pub trait GuestFrameRo {
    fn bytes(&self) -> &[u8; PAGE_SIZE];
}

/// A read-write mapping of a guest frame, released by dropping the handle.
///
/// The slot view matches the virtual VMCS layout, the only structure the
/// core maps writable.
pub trait GuestFrameRw {
    fn slots(&self) -> &[u64; PAGE_SLOTS];
    fn slots_mut(&mut self) -> &mut [u64; PAGE_SLOTS];
}

/// Per-vCPU surface: guest-visible machine state and guest memory.
pub trait GuestContext {
    type FrameRo: GuestFrameRo;
    type FrameRw: GuestFrameRw;

    /// Returns the cached state of a guest segment register.
    fn segment(&self, seg: Segment) -> SegmentRegister;

    /// Guest CR0 as the guest sees it.
    fn cr0(&self) -> u64;

    /// Guest CR4 as the guest sees it.
    fn cr4(&self) -> u64;

    /// Whether the guest has IA-32e mode enabled (EFER.LMA).
    fn long_mode(&self) -> bool;

    /// Queues an architectural fault for delivery on the next guest entry.
    fn inject_exception(&mut self, exception: Exception);

    /// Copies bytes from guest-virtual memory. On failure the implementation
    /// raises the appropriate fault with the guest before returning.
    fn copy_from_guest(&mut self, dst: &mut [u8], src: GuestVirtAddr) -> Result<(), CopyFailed>;

    /// Copies bytes into guest-virtual memory. Same failure contract as
    /// [`Self::copy_from_guest`].
    fn copy_to_guest(&mut self, dst: GuestVirtAddr, src: &[u8]) -> Result<(), CopyFailed>;

    /// Maps a guest frame read-only. `None` if the frame number does not
    /// resolve to guest memory.
    fn map_frame_ro(&mut self, gfn: usize) -> Option<Self::FrameRo>;

    /// Maps a guest frame read-write.
    fn map_frame_rw(&mut self, gfn: usize) -> Option<Self::FrameRw>;
}

/// Per-logical-CPU surface: the hardware VMCS and the host I/O bitmaps.
///
/// The scheduler guarantees a VMCS is loaded before the core runs, so the
/// field accessors are infallible; implementations must treat a VMX
/// instruction failure here as a host bug, not a reportable condition.
pub trait HostVmcs {
    /// Reads a field from the VMCS loaded on this logical CPU.
    fn vmread(&self, field: VmcsField) -> u64;

    /// Writes a field of the VMCS loaded on this logical CPU.
    fn vmwrite(&mut self, field: VmcsField, value: u64);

    /// Clears the VMCS at the given address from every logical CPU cache.
    fn vmclear(&mut self, vmcs: HostPhysAddr);

    /// Loads the VMCS at the given address as current.
    fn vmptrld(&mut self, vmcs: HostPhysAddr);

    /// The host's default I/O bitmap pair (two consecutive pages).
    fn host_io_bitmap(&self) -> HostPhysAddr;

    /// One of four precomputed bitmap pairs, keyed on whether L1 intercepts
    /// the short-delay ports 0x80 and 0xED.
    fn shadow_io_bitmap(&self, port80: bool, port_ed: bool) -> HostPhysAddr;
}
