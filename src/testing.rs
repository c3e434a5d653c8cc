//! Test doubles for the platform traits
//!
//! `FakeContext` models a vCPU over a flat, identity-mapped block of guest
//! memory; `FakeVmcs` records hardware VMCS traffic in a map. Both live only
//! in the test configuration.

use std::collections::BTreeMap;

use utils::{Frame, GuestVirtAddr, HostPhysAddr, HostVirtAddr, PAGE_SIZE, PAGE_SLOTS};

use crate::errors::{CopyFailed, Exception};
use crate::fields::VmcsField;
use crate::platform::{GuestContext, GuestFrameRo, GuestFrameRw, HostVmcs};
use crate::regs::{Register, Segment, SegmentRegister};
use crate::{NestedVmx, VmxInfo};

pub(crate) const SHADOW_VMCS_PA: usize = 0x7000_0000;
pub(crate) const HOST_VMCS_PA: usize = 0x7000_1000;

/// Leaks a zeroed page and wraps it as a `Frame` at the given address.
pub(crate) fn alloc_frame(phys_addr: usize) -> Frame {
    let page: &'static mut [u64; PAGE_SLOTS] = Box::leak(Box::new([0u64; PAGE_SLOTS]));
    unsafe {
        Frame::new(
            HostPhysAddr::new(phys_addr),
            HostVirtAddr::new(page.as_mut_ptr() as usize),
        )
    }
}

/// Fresh nested state with its own shadow and host VMCS frames.
pub(crate) fn nested(revision: u32) -> NestedVmx<FakeContext> {
    NestedVmx::new(
        VmxInfo {
            revision,
            vmcs_width: PAGE_SIZE as u32,
        },
        alloc_frame(SHADOW_VMCS_PA),
        alloc_frame(HOST_VMCS_PA),
    )
}

// ——————————————————————————— Instruction Words ———————————————————————————— //

/// A register-form VMX-instruction-information word.
pub(crate) fn reg_form(reg1: Register, reg2: Register) -> u64 {
    (1 << 10) | (reg1 as u64) << 3 | (reg2 as u64) << 28
}

/// A memory-form VMX-instruction-information word.
pub(crate) fn mem_form(
    scaling: u64,
    addr_size: u64,
    segment: Segment,
    index: Option<Register>,
    base: Option<Register>,
    reg2: Register,
) -> u64 {
    let index_bits = match index {
        Some(reg) => (reg as u64) << 18,
        None => 1 << 22,
    };
    let base_bits = match base {
        Some(reg) => (reg as u64) << 23,
        None => 1 << 27,
    };
    scaling | addr_size << 7 | (segment as u64) << 15 | index_bits | base_bits | (reg2 as u64) << 28
}

// ——————————————————————————————— Guest Side ——————————————————————————————— //

/// A vCPU over a flat block of identity-mapped guest memory.
pub(crate) struct FakeContext {
    base: *mut u8,
    size: usize,
    pub cr0: u64,
    pub cr4: u64,
    pub long_mode: bool,
    pub segments: [SegmentRegister; 6],
    pub injected: Vec<Exception>,
}

impl FakeContext {
    /// Builds a context with `pages` pages of guest memory and a guest state
    /// that passes every privilege check.
    pub fn new(pages: usize) -> Self {
        // Backed by u64 so that page-sized slot views stay aligned.
        let mem = Vec::leak(vec![0u64; pages * PAGE_SLOTS]);
        let flat = SegmentRegister {
            selector: 0x8,
            base: 0,
            limit: u32::MAX,
            long: true,
        };
        Self {
            base: mem.as_mut_ptr() as *mut u8,
            size: pages * PAGE_SIZE,
            cr0: 1,        // CR0.PE
            cr4: 1 << 13,  // CR4.VMXE
            long_mode: true,
            segments: [flat; 6],
            injected: Vec::new(),
        }
    }

    pub fn write_mem(&mut self, addr: usize, bytes: &[u8]) {
        assert!(addr + bytes.len() <= self.size);
        unsafe {
            std::slice::from_raw_parts_mut(self.base.add(addr), bytes.len())
                .copy_from_slice(bytes)
        }
    }

    pub fn read_mem(&self, addr: usize, len: usize) -> Vec<u8> {
        assert!(addr + len <= self.size);
        unsafe { std::slice::from_raw_parts(self.base.add(addr), len).to_vec() }
    }

    /// Slot view of a guest page, bypassing the mapping handles.
    pub fn page_slots(&self, gfn: usize) -> &'static mut [u64; PAGE_SLOTS] {
        assert!((gfn + 1) * PAGE_SIZE <= self.size);
        unsafe { &mut *(self.base.add(gfn * PAGE_SIZE) as *mut [u64; PAGE_SLOTS]) }
    }

    fn in_bounds(&self, addr: usize, len: usize) -> bool {
        addr.checked_add(len).map_or(false, |end| end <= self.size)
    }
}

pub(crate) struct FakeFrameRo {
    ptr: *const [u8; PAGE_SIZE],
    pub gfn: usize,
}

impl GuestFrameRo for FakeFrameRo {
    fn bytes(&self) -> &[u8; PAGE_SIZE] {
        unsafe { &*self.ptr }
    }
}

pub(crate) struct FakeFrameRw {
    ptr: *mut [u64; PAGE_SLOTS],
    pub gfn: usize,
}

impl GuestFrameRw for FakeFrameRw {
    fn slots(&self) -> &[u64; PAGE_SLOTS] {
        unsafe { &*self.ptr }
    }

    fn slots_mut(&mut self) -> &mut [u64; PAGE_SLOTS] {
        unsafe { &mut *self.ptr }
    }
}

impl GuestContext for FakeContext {
    type FrameRo = FakeFrameRo;
    type FrameRw = FakeFrameRw;

    fn segment(&self, seg: Segment) -> SegmentRegister {
        self.segments[seg as usize]
    }

    fn cr0(&self) -> u64 {
        self.cr0
    }

    fn cr4(&self) -> u64 {
        self.cr4
    }

    fn long_mode(&self) -> bool {
        self.long_mode
    }

    fn inject_exception(&mut self, exception: Exception) {
        self.injected.push(exception);
    }

    fn copy_from_guest(&mut self, dst: &mut [u8], src: GuestVirtAddr) -> Result<(), CopyFailed> {
        if !self.in_bounds(src.as_usize(), dst.len()) {
            return Err(CopyFailed);
        }
        dst.copy_from_slice(&self.read_mem(src.as_usize(), dst.len()));
        Ok(())
    }

    fn copy_to_guest(&mut self, dst: GuestVirtAddr, src: &[u8]) -> Result<(), CopyFailed> {
        if !self.in_bounds(dst.as_usize(), src.len()) {
            return Err(CopyFailed);
        }
        self.write_mem(dst.as_usize(), src);
        Ok(())
    }

    fn map_frame_ro(&mut self, gfn: usize) -> Option<FakeFrameRo> {
        if !self.in_bounds(gfn * PAGE_SIZE, PAGE_SIZE) {
            return None;
        }
        Some(FakeFrameRo {
            ptr: unsafe { self.base.add(gfn * PAGE_SIZE) as *const [u8; PAGE_SIZE] },
            gfn,
        })
    }

    fn map_frame_rw(&mut self, gfn: usize) -> Option<FakeFrameRw> {
        if !self.in_bounds(gfn * PAGE_SIZE, PAGE_SIZE) {
            return None;
        }
        Some(FakeFrameRw {
            ptr: unsafe { self.base.add(gfn * PAGE_SIZE) as *mut [u64; PAGE_SLOTS] },
            gfn,
        })
    }
}

// ———————————————————————————————— Host Side ——————————————————————————————— //

/// Records hardware VMCS traffic instead of executing VMX instructions.
pub(crate) struct FakeVmcs {
    pub fields: BTreeMap<u32, u64>,
    pub loaded: Option<HostPhysAddr>,
    pub clears: Vec<HostPhysAddr>,
    pub host_bitmap: HostPhysAddr,
    pub shadow_bitmaps: [HostPhysAddr; 4],
}

impl FakeVmcs {
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            loaded: None,
            clears: Vec::new(),
            host_bitmap: HostPhysAddr::new(0xaa000),
            shadow_bitmaps: [
                HostPhysAddr::new(0xb0000),
                HostPhysAddr::new(0xb2000),
                HostPhysAddr::new(0xb4000),
                HostPhysAddr::new(0xb6000),
            ],
        }
    }
}

impl HostVmcs for FakeVmcs {
    fn vmread(&self, field: VmcsField) -> u64 {
        self.fields.get(&field.raw()).copied().unwrap_or(0)
    }

    fn vmwrite(&mut self, field: VmcsField, value: u64) {
        self.fields.insert(field.raw(), value);
    }

    fn vmclear(&mut self, vmcs: HostPhysAddr) {
        self.clears.push(vmcs);
        if self.loaded == Some(vmcs) {
            self.loaded = None;
        }
    }

    fn vmptrld(&mut self, vmcs: HostPhysAddr) {
        self.loaded = Some(vmcs);
    }

    fn host_io_bitmap(&self) -> HostPhysAddr {
        self.host_bitmap
    }

    fn shadow_io_bitmap(&self, port80: bool, port_ed: bool) -> HostPhysAddr {
        self.shadow_bitmaps[port80 as usize | (port_ed as usize) << 1]
    }
}
