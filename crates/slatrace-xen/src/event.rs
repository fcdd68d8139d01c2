//! vm_event ring processing: conversion into engine events and response
//! application.

use slatrace_core::{
    EventInterrupt, EventMemoryAccess, EventReason, EventResponse, EventSinglestep, Gfn,
    MemoryAccess, Pa, ResponseFlags, TraceEvent, Va, VcpuId,
};
use xen::ctrl::{VmEvent, VmEventData, VmEventFlag, VmEventReason, VmEventRegs};
use xen::{XenX86EventType, XenX86ExceptionVector};

use crate::{regs, Error, XenDriver};

impl XenDriver {
    /// Converts one ring request into an engine event, hands it to the
    /// handler and folds the response back into the request before it is
    /// returned to Xen.
    pub(crate) fn process_event(
        &self,
        event: &mut VmEvent,
        handler: &mut impl FnMut(&TraceEvent) -> EventResponse,
    ) -> Result<(), Error> {
        let registers = match &event.data {
            Some(VmEventData::Registers(VmEventRegs::X86(regs))) => regs::registers_from_event(regs),
            _ => Default::default(),
        };

        let reason = match &event.reason {
            VmEventReason::SoftwareBreakpoint(debug) => EventReason::Interrupt(EventInterrupt {
                gla: Va(registers.rip),
                gfn: Gfn(debug.gfn),
            }),
            VmEventReason::MemAccess(access) => EventReason::MemoryAccess(EventMemoryAccess {
                pa: Pa::from_parts(Gfn(access.gfn), access.offset),
                va: Va(access.gla),
                access: MemoryAccess::from_bits_truncate(access.flags as u8),
            }),
            VmEventReason::Singlestep(step) => EventReason::Singlestep(EventSinglestep {
                gfn: Gfn(step.gfn),
            }),
            other => {
                tracing::warn!(?other, "unexpected vm_event, ignoring");
                event.flags &= VmEventFlag::VCPU_PAUSED;
                event.data = None;
                return Ok(());
            }
        };

        let vcpu_id = VcpuId(event.vcpu_id as u16);
        let trace_event = TraceEvent::new(vcpu_id, registers, reason);

        let response = handler(&trace_event);

        // Rebuild the request flags from the response.
        event.flags &= VmEventFlag::VCPU_PAUSED;

        if let Some(view) = response.view {
            event.flags |= VmEventFlag::ALTERNATE_P2M;
            event.altp2m_idx = view.0;
        }

        match response.registers {
            Some(gp) => match &mut event.data {
                Some(VmEventData::Registers(VmEventRegs::X86(event_regs))) => {
                    regs::apply_gp_registers(event_regs, &gp);
                    event.flags |= VmEventFlag::SET_REGISTERS;
                }
                _ => {
                    tracing::warn!("register update requested without an event register block");
                    event.data = None;
                }
            },
            None => {
                event.data = None;
            }
        }

        if response.flags.contains(ResponseFlags::TOGGLE_SINGLESTEP) {
            event.flags |= VmEventFlag::TOGGLE_SINGLESTEP;
        }

        if response.flags.contains(ResponseFlags::REINJECT) {
            self.reinject(event)?;
        }

        Ok(())
    }

    /// Delivers the trapped breakpoint to the guest after all; the engine
    /// decided the interrupt was not one of ours.
    fn reinject(&self, event: &VmEvent) -> Result<(), Error> {
        let debug = match &event.reason {
            VmEventReason::SoftwareBreakpoint(debug) => debug,
            _ => {
                tracing::warn!("attempted to reinject a non-breakpoint event");
                return Ok(());
            }
        };

        self.devicemodel.inject_event(
            event.vcpu_id,
            XenX86ExceptionVector::Breakpoint,
            XenX86EventType::SoftwareException,
            0xffff_ffff,
            debug.insn_length as u8,
            0,
        )?;

        Ok(())
    }
}
