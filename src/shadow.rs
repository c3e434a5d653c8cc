//! Shadow execution controls
//!
//! While L2 runs, the hardware VMCS must exit whenever *either* L0 or L1
//! wants an exit, so the controls programmed there are a composite of both
//! intents. Features L0 keeps for itself are stripped from L1's word before
//! the host's bits are folded in; the I/O exit policy gets special handling
//! because L1's bitmaps cannot be handed to hardware as-is.

use utils::{HostPhysAddr, PAGE_SIZE};

use crate::bitmaps::{ExceptionBitmap, PrimaryControls, SecondaryControls};
use crate::errors::NvmxError;
use crate::fields::VmcsField;
use crate::platform::{GuestContext, GuestFrameRo, GuestFrameRw, HostVmcs};
use crate::vvmcs;
use crate::NestedVmx;

/// Controls L0 never lets L1 drive directly.
const RESERVED_TO_HOST: PrimaryControls = PrimaryControls::from_bits_truncate(
    PrimaryControls::USE_TPR_SHADOW.bits()
        | PrimaryControls::USE_MSR_BITMAPS.bits()
        | PrimaryControls::SECONDARY_CONTROLS.bits()
        | PrimaryControls::USE_IO_BITMAPS.bits()
        | PrimaryControls::UNCOND_IO_EXITING.bits(),
);

impl<P: GuestContext> NestedVmx<P> {
    /// Synthesizes the CPU-based execution controls for a nested entry and
    /// writes them, along with the I/O bitmap addresses the policy calls
    /// for, to the hardware VMCS.
    ///
    /// The I/O policy keeps the strict-exit rule intact:
    /// - L1 intercepts all I/O: unconditional exiting, no bitmaps.
    /// - L1 intercepts no I/O: the host's own bitmaps.
    /// - L1 uses bitmaps: a precomputed bitmap that intercepts the
    ///   short-delay ports exactly when L1 does not (and always everything
    ///   the host wants).
    pub fn update_exec_control<V: HostVmcs>(
        &self,
        vmcs: &mut V,
        host_cntrl: PrimaryControls,
    ) -> Result<(), NvmxError> {
        let l1_cntrl = PrimaryControls::from_bits_truncate(self.exec_control()?);
        let pio_cntrl =
            l1_cntrl & (PrimaryControls::USE_IO_BITMAPS | PrimaryControls::UNCOND_IO_EXITING);

        let mut shadow_cntrl = l1_cntrl - RESERVED_TO_HOST;
        shadow_cntrl |= host_cntrl;

        if pio_cntrl == PrimaryControls::UNCOND_IO_EXITING {
            // L1 intercepts all I/O instructions.
            shadow_cntrl |= PrimaryControls::UNCOND_IO_EXITING;
            shadow_cntrl -= PrimaryControls::USE_IO_BITMAPS;
        } else {
            let bitmap = if pio_cntrl.is_empty() {
                // L1 does not intercept I/O, the host policy stands alone.
                vmcs.host_io_bitmap()
            } else {
                self.derive_io_bitmap(vmcs)?
            };
            vmcs.vmwrite(VmcsField::IO_BITMAP_A, bitmap.as_u64());
            vmcs.vmwrite(VmcsField::IO_BITMAP_B, bitmap.as_u64() + PAGE_SIZE as u64);
        }

        vmcs.vmwrite(
            VmcsField::CPU_BASED_EXEC_CONTROL,
            shadow_cntrl.bits() as u64,
        );
        Ok(())
    }

    /// Shadows the secondary execution controls: L1's word with the host's
    /// bits folded in.
    pub fn update_secondary_exec_control<V: HostVmcs>(
        &self,
        vmcs: &mut V,
        host_value: SecondaryControls,
    ) -> Result<(), NvmxError> {
        self.set_shadow_control(vmcs, VmcsField::SECONDARY_EXEC_CONTROL, host_value.bits())
    }

    /// Shadows the exception bitmap: L1's word with the host's bits folded
    /// in.
    pub fn update_exception_bitmap<V: HostVmcs>(
        &self,
        vmcs: &mut V,
        host_value: ExceptionBitmap,
    ) -> Result<(), NvmxError> {
        self.set_shadow_control(vmcs, VmcsField::EXCEPTION_BITMAP, host_value.bits())
    }

    fn set_shadow_control<V: HostVmcs>(
        &self,
        vmcs: &mut V,
        field: VmcsField,
        host_value: u32,
    ) -> Result<(), NvmxError> {
        let (_, map) = self.current_vvmcs.as_ref().ok_or(NvmxError::NoCurrentVvmcs)?;
        let value = vvmcs::read_vvmcs(map.slots(), field) as u32 | host_value;
        vmcs.vmwrite(field, value as u64);
        Ok(())
    }

    /// Picks the precomputed bitmap matching L1's treatment of the
    /// short-delay ports 0x80 and 0xED.
    fn derive_io_bitmap<V: HostVmcs>(&self, vmcs: &V) -> Result<HostPhysAddr, NvmxError> {
        let bitmap = self.io_bitmap[0].as_ref().ok_or(NvmxError::BitmapNotMapped)?;
        let bytes = bitmap.bytes();
        let port80 = bytes[0x80 >> 3] & (1 << (0x80 & 0x7)) != 0;
        let port_ed = bytes[0xed >> 3] & (1 << (0xed & 0x7)) != 0;
        Ok(vmcs.shadow_io_bitmap(port80, port_ed))
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
