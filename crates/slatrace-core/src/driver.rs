use std::time::Duration;

use crate::{
    DomainInfo, Error, EventResponse, Gfn, MemoryAccess, Pa, Registers, TraceEvent, Va, VcpuId,
    View,
};

/// Hardware events the engine asks the hypervisor to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventMonitor {
    /// Software breakpoint (`INT3`) execution.
    SoftwareBreakpoint,

    /// Single-step completion.
    Singlestep,
}

/// A trait for implementing a hypervisor driver.
///
/// The driver owns the domain control and memory handles and hides the
/// hypervisor's event plumbing. All engine state changes flow through this
/// trait, which also makes the engine testable against a synthetic guest.
pub trait Driver {
    /// Retrieves static information about the domain.
    fn info(&self) -> Result<DomainInfo, Error>;

    /// Pauses the domain.
    fn pause(&self) -> Result<(), Error>;

    /// Resumes the domain.
    fn resume(&self) -> Result<(), Error>;

    /// Retrieves the registers of a virtual CPU.
    fn registers(&self, vcpu: VcpuId) -> Result<Registers, Error>;

    /// Reads guest physical memory.
    ///
    /// The read is physically contiguous; callers are responsible for not
    /// assuming virtual contiguity past a page boundary.
    fn read(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), Error>;

    /// Writes guest physical memory.
    fn write(&self, pa: Pa, buffer: &[u8]) -> Result<(), Error>;

    /// Reads a single byte of guest physical memory.
    fn read_u8(&self, pa: Pa) -> Result<u8, Error> {
        let mut buffer = [0u8; 1];
        self.read(pa, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 64-bit little-endian word of guest physical memory.
    fn read_u64(&self, pa: Pa) -> Result<u64, Error> {
        let mut buffer = [0u8; 8];
        self.read(pa, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Writes a single byte of guest physical memory.
    fn write_u8(&self, pa: Pa, value: u8) -> Result<(), Error> {
        self.write(pa, &[value])
    }

    /// Writes a 64-bit little-endian word of guest physical memory.
    fn write_u64(&self, pa: Pa, value: u64) -> Result<(), Error> {
        self.write(pa, &value.to_le_bytes())
    }

    /// Translates a kernel virtual address to a physical address.
    fn translate_kernel(&self, va: Va) -> Result<Pa, Error>;

    /// Sets the domain's maximum memory reservation in bytes.
    fn set_max_mem(&self, bytes: u64) -> Result<(), Error>;

    /// Grows the domain's reservation by one frame and returns it.
    fn increase_reservation(&self) -> Result<Gfn, Error>;

    /// Backs a previously reserved frame with memory. The frame is
    /// zero-filled.
    fn populate_frame(&self, gfn: Gfn) -> Result<(), Error>;

    /// Returns a frame to the hypervisor, shrinking the reservation.
    fn decrease_reservation(&self, gfn: Gfn) -> Result<(), Error>;

    /// Enables the alternate-p2m facility on the domain.
    fn altp2m_enable(&self) -> Result<(), Error>;

    /// Disables the alternate-p2m facility on the domain.
    fn altp2m_disable(&self) -> Result<(), Error>;

    /// Creates a new view. The view is not active until switched to.
    fn create_view(&self) -> Result<View, Error>;

    /// Destroys a previously created view.
    fn destroy_view(&self, view: View) -> Result<(), Error>;

    /// Switches the active view on all VCPUs.
    fn switch_to_view(&self, view: View) -> Result<(), Error>;

    /// Remaps `old_gfn` to `new_gfn` within a view.
    fn change_view_gfn(&self, view: View, old_gfn: Gfn, new_gfn: Gfn) -> Result<(), Error>;

    /// Restores the original mapping of `gfn` within a view.
    fn reset_view_gfn(&self, view: View, gfn: Gfn) -> Result<(), Error>;

    /// Sets the access permissions of a frame within a view. Disallowed
    /// accesses trap as memory events.
    fn set_memory_access(&self, gfn: Gfn, view: View, access: MemoryAccess) -> Result<(), Error>;

    /// Starts delivery of an event class.
    fn monitor_enable(&self, monitor: EventMonitor) -> Result<(), Error>;

    /// Stops delivery of an event class.
    fn monitor_disable(&self, monitor: EventMonitor) -> Result<(), Error>;

    /// Blocks until an event arrives or the timeout elapses, handing each
    /// delivered event to `handler` and applying its response.
    ///
    /// Delivery is serialized: `handler` is never re-entered.
    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&TraceEvent) -> EventResponse,
    ) -> Result<(), Error>;
}
