//! Events delivered by the hypervisor and the responses handed back.

use crate::{Gfn, GpRegisters, MemoryAccess, Pa, Registers, Va, VcpuId, View};

/// Details of a breakpoint (interrupt) event.
#[derive(Debug, Clone, Copy)]
pub struct EventInterrupt {
    /// Guest linear address of the faulting instruction.
    pub gla: Va,

    /// Guest frame of the faulting instruction.
    pub gfn: Gfn,
}

/// Details of an access to a monitored page.
#[derive(Debug, Clone, Copy)]
pub struct EventMemoryAccess {
    /// Physical address that was accessed.
    pub pa: Pa,

    /// Virtual address that was accessed.
    pub va: Va,

    /// The kind of access that trapped.
    pub access: MemoryAccess,
}

/// Details of a single-step completion.
#[derive(Debug, Clone, Copy)]
pub struct EventSinglestep {
    /// Guest frame of the stepped instruction.
    pub gfn: Gfn,
}

/// The reason an event was delivered.
#[derive(Debug, Clone, Copy)]
pub enum EventReason {
    /// A breakpoint instruction was executed.
    Interrupt(EventInterrupt),

    /// A monitored page was read or written.
    MemoryAccess(EventMemoryAccess),

    /// A single-step window completed.
    Singlestep(EventSinglestep),
}

/// An event delivered by the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent {
    vcpu_id: VcpuId,
    registers: Registers,
    reason: EventReason,
}

impl TraceEvent {
    /// Creates a new event.
    pub fn new(vcpu_id: VcpuId, registers: Registers, reason: EventReason) -> Self {
        Self {
            vcpu_id,
            registers,
            reason,
        }
    }

    /// Returns the virtual CPU the event occurred on.
    pub fn vcpu_id(&self) -> VcpuId {
        self.vcpu_id
    }

    /// Returns the register image captured with the event.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Returns the reason for the event.
    pub fn reason(&self) -> &EventReason {
        &self.reason
    }
}

bitflags::bitflags! {
    /// Flags carried in an event response.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseFlags: u8 {
        /// Deliver the trapped interrupt to the guest after all.
        const REINJECT = 1 << 0;

        /// Toggle single-step mode on the event's VCPU.
        ///
        /// Combined with [`EventResponse::view`], the view switch and the
        /// toggle are applied atomically when the VCPU resumes.
        const TOGGLE_SINGLESTEP = 1 << 1;
    }
}

/// A response to a delivered event.
///
/// The response is applied to the VCPU that raised the event only; other
/// VCPUs are unaffected.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EventResponse {
    /// Flags to apply.
    pub flags: ResponseFlags,

    /// The view to move the VCPU to, if any.
    pub view: Option<View>,

    /// Replacement general-purpose registers, if any.
    pub registers: Option<GpRegisters>,
}

impl EventResponse {
    /// An empty response; the guest resumes unchanged.
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a response that reinjects the trapped interrupt.
    pub fn reinject() -> Self {
        Self {
            flags: ResponseFlags::REINJECT,
            ..Self::default()
        }
    }

    /// Creates a response that toggles single-step mode.
    pub fn toggle_singlestep() -> Self {
        Self {
            flags: ResponseFlags::TOGGLE_SINGLESTEP,
            ..Self::default()
        }
    }

    /// Creates a response that replaces the VCPU's general-purpose registers.
    pub fn set_registers(registers: GpRegisters) -> Self {
        Self {
            registers: Some(registers),
            ..Self::default()
        }
    }

    /// Moves the VCPU to the given view when the response is applied.
    pub fn and_set_view(self, view: View) -> Self {
        Self {
            view: Some(view),
            ..self
        }
    }
}
