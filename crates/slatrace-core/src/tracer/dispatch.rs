//! The three-way event dispatcher.
//!
//! All events arrive serialized on the loop thread, so the engine state
//! behind the `RefCell` is never contended.

use super::{CallInFlight, Tracer};
use crate::{
    CallEvent, Driver, EventInterrupt, EventMemoryAccess, EventReason, EventResponse, OsAdapter,
    Pa, ProcessId, ReturnEvent, TraceEvent, Va, View,
};

impl<D, Os> Tracer<D, Os>
where
    D: Driver,
    Os: OsAdapter<D>,
{
    /// Handles one delivered event and produces the response the driver
    /// applies to the faulting VCPU.
    pub fn dispatch(&self, event: &TraceEvent) -> EventResponse {
        match event.reason() {
            EventReason::Interrupt(interrupt) => self.on_breakpoint(event, interrupt),
            EventReason::MemoryAccess(access) => self.on_memory_access(event, access),
            EventReason::Singlestep(_) => self.on_singlestep(event),
        }
    }

    /// A breakpoint fired. The trampoline address selects the return-site
    /// branch; everything else is a call-site candidate.
    fn on_breakpoint(&self, event: &TraceEvent, interrupt: &EventInterrupt) -> EventResponse {
        let trampoline_addr = self.state.borrow().trampoline_addr;

        if interrupt.gla == trampoline_addr {
            self.on_syscall_return(event)
        } else {
            self.on_syscall_entry(event, interrupt.gla)
        }
    }

    /// Call-site branch: hijack the return slot and record the in-flight
    /// call, then step the VCPU once through the original view so the real
    /// first instruction executes.
    fn on_syscall_entry(&self, event: &TraceEvent, gla: Va) -> EventResponse {
        let handler = {
            let st = self.state.borrow();

            let pa = match self.driver.translate_kernel(gla) {
                Ok(pa) => pa,
                Err(_) => return EventResponse::reinject(),
            };

            match st.shadow.lookup(pa) {
                Some(record) => record.handler.clone(),
                // Not a breakpoint we emplaced; the interrupt belongs to
                // the guest.
                None => return EventResponse::reinject(),
            }
        };

        // Whatever happens below, the VCPU takes one step through the
        // original view so the hidden instruction byte executes.
        let detour = EventResponse::toggle_singlestep().and_set_view(View::DEFAULT);

        let registers = event.registers();
        let thread_id = registers.stack_pointer();

        let return_loc = match self.driver.translate_kernel(thread_id) {
            Ok(pa) => pa,
            Err(_) => return detour,
        };

        let return_slot = match self.driver.read_u64(return_loc) {
            Ok(value) => value,
            Err(_) => return detour,
        };

        let (return_addr, trampoline_addr) = {
            let st = self.state.borrow();
            (st.return_addr, st.trampoline_addr)
        };

        if Va(return_slot) != return_addr {
            // The traced function was entered through some path that does
            // not return to the dispatch site. Hijacking here would corrupt
            // the guest; trace nothing.
            tracing::trace!(
                vcpu = %event.vcpu_id(), %gla, %thread_id, slot = %Va(return_slot),
                "unexpected return slot, skipping hijack"
            );
            return detour;
        }

        let pid = self.resolve_pid(registers.translation_root());

        let user_state = handler.on_call(&CallEvent {
            pid,
            thread_id,
            registers: *registers,
        });

        let mut st = self.state.borrow_mut();
        st.calls.insert(
            thread_id,
            CallInFlight {
                handler,
                user_state,
            },
        );

        if let Err(err) = self.driver.write_u64(return_loc, trampoline_addr.0) {
            tracing::error!(%thread_id, %err, "failed to hijack return slot");
            st.calls.remove(thread_id);
            return detour;
        }

        tracing::trace!(vcpu = %event.vcpu_id(), %gla, %thread_id, %pid, "call recorded");
        detour
    }

    /// Return-site branch: the guest just "returned" into the trampoline.
    /// Deliver the return callback and point the VCPU at the real
    /// post-dispatch instruction.
    fn on_syscall_return(&self, event: &TraceEvent) -> EventResponse {
        let registers = event.registers();

        // The return has executed, so the stack pointer has moved past the
        // slot that held the trampoline address.
        let thread_id = Va(registers.rsp - self.pointer_width);

        let (call, return_addr) = {
            let mut st = self.state.borrow_mut();

            let call = match st.calls.remove(thread_id) {
                Some(call) => call,
                None => {
                    tracing::trace!(%thread_id, "no call in flight for this return");
                    return EventResponse::none();
                }
            };

            (call, st.return_addr)
        };

        let pid = self.resolve_pid(registers.translation_root());

        call.handler.on_return(
            &ReturnEvent {
                pid,
                thread_id,
                registers: *registers,
            },
            call.user_state,
        );

        tracing::trace!(vcpu = %event.vcpu_id(), %thread_id, %pid, "return delivered");

        let mut gp = registers.gp_registers();
        gp.rip = return_addr.0;
        EventResponse::set_registers(gp)
    }

    /// The guest read or wrote a monitored page, most likely a kernel
    /// integrity check measuring its own text. Step it once through the
    /// original view so it sees clean bytes; no callback fires.
    fn on_memory_access(&self, event: &TraceEvent, access: &EventMemoryAccess) -> EventResponse {
        tracing::trace!(
            vcpu = %event.vcpu_id(),
            pa = %access.pa,
            va = %access.va,
            access = %access.access,
            "monitored page accessed"
        );

        EventResponse::toggle_singlestep().and_set_view(View::DEFAULT)
    }

    /// The single-step window closed: put the VCPU back on the shadow view
    /// so the instrumented bytes become visible again.
    fn on_singlestep(&self, event: &TraceEvent) -> EventResponse {
        tracing::trace!(vcpu = %event.vcpu_id(), "single step complete");

        EventResponse::toggle_singlestep().and_set_view(self.view)
    }

    fn resolve_pid(&self, root: Pa) -> ProcessId {
        match self.os.process_id(&self.driver, root) {
            Ok(pid) => pid,
            Err(err) => {
                tracing::warn!(%root, %err, "failed to resolve process id");
                ProcessId(0)
            }
        }
    }
}
